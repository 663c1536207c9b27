//! File-backed simulated cloud.
//!
//! Every resource lives in one JSON file keyed by provider id. Useful for
//! trying a document end to end without touching real infrastructure.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::{CreateOutcome, ObservedResource, Outputs, Provider, ProviderResult};
use crate::error::ProviderError;
use crate::graph::{Attributes, ResourceKind};

/// Default backing file, relative to the document directory.
pub const DEFAULT_PROVIDER_FILE: &str = ".converge/provider.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct Cloud {
    resources: BTreeMap<String, StoredResource>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredResource {
    kind: ResourceKind,
    logical_id: String,
    attributes: Attributes,
    outputs: Outputs,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// Provider that simulates a cloud in a local JSON file.
#[derive(Debug)]
pub struct LocalProvider {
    path: PathBuf,
    // Serializes read-modify-write cycles on the backing file.
    guard: Mutex<()>,
}

impl LocalProvider {
    /// Creates a provider backed by `path`. The file is created on first write.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of resources currently stored.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the backing file cannot be read.
    pub async fn resource_count(&self) -> ProviderResult<usize> {
        let _guard = self.guard.lock().await;
        Ok(self.load().await?.resources.len())
    }

    async fn load(&self) -> ProviderResult<Cloud> {
        if !self.path.exists() {
            return Ok(Cloud::default());
        }
        let content = fs::read_to_string(&self.path)
            .await
            .map_err(|e| ProviderError::storage(format!("Failed to read {}: {e}", self.path.display())))?;
        serde_json::from_str(&content)
            .map_err(|e| ProviderError::storage(format!("Failed to parse {}: {e}", self.path.display())))
    }

    async fn save(&self, cloud: &Cloud) -> ProviderResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| ProviderError::storage(format!("Failed to create directory: {e}")))?;
        }

        let content = serde_json::to_string_pretty(cloud)
            .map_err(|e| ProviderError::storage(format!("Failed to serialize: {e}")))?;

        let temp_path = self.path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| ProviderError::storage(format!("Failed to create temp file: {e}")))?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| ProviderError::storage(format!("Failed to write: {e}")))?;
        file.sync_all()
            .await
            .map_err(|e| ProviderError::storage(format!("Failed to sync: {e}")))?;
        fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| ProviderError::storage(format!("Failed to rename: {e}")))?;
        Ok(())
    }
}

fn outputs_for(kind: ResourceKind, provider_id: &str, attributes: &Attributes) -> Outputs {
    let mut outputs: Outputs = attributes.clone();
    outputs.insert(String::from("id"), Value::String(provider_id.to_string()));
    outputs.insert(
        String::from("arn"),
        Value::String(format!("arn:converge:{kind}::{provider_id}")),
    );
    outputs
}

fn not_found(provider_id: &str) -> ProviderError {
    ProviderError::NotFound {
        provider_id: provider_id.to_string(),
    }
}

#[async_trait]
impl Provider for LocalProvider {
    async fn create(
        &self,
        kind: ResourceKind,
        id: &str,
        attributes: &Attributes,
    ) -> ProviderResult<CreateOutcome> {
        let _guard = self.guard.lock().await;
        let mut cloud = self.load().await?;

        let provider_id = format!("{}-{}", kind.id_prefix(), &Uuid::new_v4().simple().to_string()[..8]);
        let outputs = outputs_for(kind, &provider_id, attributes);
        let now = Utc::now();
        cloud.resources.insert(
            provider_id.clone(),
            StoredResource {
                kind,
                logical_id: id.to_string(),
                attributes: attributes.clone(),
                outputs: outputs.clone(),
                created_at: now,
                updated_at: now,
            },
        );
        self.save(&cloud).await?;

        debug!("Local provider created {} as {}", id, provider_id);
        Ok(CreateOutcome { provider_id, outputs })
    }

    async fn update(
        &self,
        kind: ResourceKind,
        provider_id: &str,
        attributes: &Attributes,
    ) -> ProviderResult<Outputs> {
        let _guard = self.guard.lock().await;
        let mut cloud = self.load().await?;

        let stored = cloud
            .resources
            .get_mut(provider_id)
            .filter(|r| r.kind == kind)
            .ok_or_else(|| not_found(provider_id))?;
        stored.attributes = attributes.clone();
        stored.outputs = outputs_for(kind, provider_id, attributes);
        stored.updated_at = Utc::now();
        let outputs = stored.outputs.clone();
        self.save(&cloud).await?;

        debug!("Local provider updated {}", provider_id);
        Ok(outputs)
    }

    async fn destroy(&self, kind: ResourceKind, provider_id: &str) -> ProviderResult<()> {
        let _guard = self.guard.lock().await;
        let mut cloud = self.load().await?;

        match cloud.resources.get(provider_id) {
            Some(stored) if stored.kind == kind => {
                cloud.resources.remove(provider_id);
                self.save(&cloud).await?;
                debug!("Local provider destroyed {}", provider_id);
                Ok(())
            }
            _ => Err(not_found(provider_id)),
        }
    }

    async fn read(
        &self,
        kind: ResourceKind,
        provider_id: &str,
    ) -> ProviderResult<Option<ObservedResource>> {
        let _guard = self.guard.lock().await;
        let cloud = self.load().await?;

        Ok(cloud
            .resources
            .get(provider_id)
            .filter(|r| r.kind == kind)
            .map(|r| ObservedResource {
                attributes: r.attributes.clone(),
                outputs: r.outputs.clone(),
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn provider() -> (LocalProvider, TempDir) {
        let dir = TempDir::new().expect("Failed to create temp dir");
        (LocalProvider::new(dir.path().join("provider.json")), dir)
    }

    fn attrs() -> Attributes {
        Attributes::from([
            (String::from("name"), json!("platform-vpc")),
            (String::from("cidr"), json!("10.0.0.0/16")),
        ])
    }

    #[tokio::test]
    async fn test_create_and_read() {
        let (provider, _dir) = provider();

        let created = provider.create(ResourceKind::Network, "vpc", &attrs()).await.unwrap();
        assert!(created.provider_id.starts_with("vpc-"));
        assert_eq!(created.provider_id.len(), "vpc-".len() + 8);
        assert_eq!(created.outputs["id"], json!(created.provider_id));
        assert_eq!(created.outputs["name"], json!("platform-vpc"));
        assert!(created.outputs["arn"].as_str().unwrap().contains(&created.provider_id));

        let observed = provider
            .read(ResourceKind::Network, &created.provider_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(observed.attributes, attrs());
    }

    #[tokio::test]
    async fn test_update_and_destroy() {
        let (provider, _dir) = provider();
        let created = provider.create(ResourceKind::Network, "vpc", &attrs()).await.unwrap();

        let mut changed = attrs();
        changed.insert(String::from("cidr"), json!("10.1.0.0/16"));
        let outputs = provider
            .update(ResourceKind::Network, &created.provider_id, &changed)
            .await
            .unwrap();
        assert_eq!(outputs["cidr"], json!("10.1.0.0/16"));

        provider.destroy(ResourceKind::Network, &created.provider_id).await.unwrap();
        assert_eq!(provider.resource_count().await.unwrap(), 0);
        assert!(provider
            .read(ResourceKind::Network, &created.provider_id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_missing_resources() {
        let (provider, _dir) = provider();

        assert_eq!(
            provider.destroy(ResourceKind::Cluster, "cluster-deadbeef").await,
            Err(not_found("cluster-deadbeef"))
        );
        assert_eq!(
            provider.update(ResourceKind::Cluster, "cluster-deadbeef", &attrs()).await,
            Err(not_found("cluster-deadbeef"))
        );
    }

    #[tokio::test]
    async fn test_persists_across_instances() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("provider.json");

        let created = LocalProvider::new(&path)
            .create(ResourceKind::Role, "cluster_role", &Attributes::new())
            .await
            .unwrap();

        let reopened = LocalProvider::new(&path);
        assert_eq!(reopened.resource_count().await.unwrap(), 1);
        assert!(reopened
            .read(ResourceKind::Role, &created.provider_id)
            .await
            .unwrap()
            .is_some());
    }
}
