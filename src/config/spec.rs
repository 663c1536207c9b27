//! Document types for `converge.yaml`.
//!
//! These types describe the desired state: the project, where state lives,
//! which provider converges it, the flags gating optional resources and the
//! resources themselves.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::graph::{EnabledExpr, ResourceKind};

/// Root of a `converge.yaml` document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    /// Project identity.
    pub project: ProjectConfig,
    /// State location.
    #[serde(default)]
    pub state: StateConfig,
    /// Provider selection.
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Execution settings.
    #[serde(default)]
    pub settings: Settings,
    /// Flag defaults.
    #[serde(default)]
    pub flags: BTreeMap<String, bool>,
    /// Declared resources, in declaration order.
    #[serde(default)]
    pub resources: Vec<ResourceDecl>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Project name.
    pub name: String,
    /// Environment (e.g. "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// Where reconciliation state is stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// Directory holding `state.json` and `state.lock`, relative to the document.
    #[serde(default = "default_state_path")]
    pub path: String,
}

/// Provider kinds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// File-backed simulated cloud.
    #[default]
    Local,
    /// REST provider.
    Http,
}

/// Provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Provider kind.
    #[serde(default)]
    pub kind: ProviderKind,
    /// Base URL of the REST provider.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Backing file for the local provider, relative to the document.
    #[serde(default)]
    pub path: Option<String>,
    /// Request timeout for the REST provider.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// Execution settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Settings {
    /// Maximum number of concurrent provider operations.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
}

/// A declared resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceDecl {
    /// Unique id.
    pub id: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Inclusion predicate: `true`, `false`, `flag` or `!flag`.
    #[serde(default)]
    pub enabled: EnabledExpr,
    /// Explicit dependencies.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Raw attributes; strings may contain `${...}` placeholders.
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

fn default_environment() -> String {
    String::from("dev")
}

fn default_state_path() -> String {
    String::from(".converge")
}

const fn default_timeout_secs() -> u64 {
    30
}

const fn default_parallelism() -> usize {
    4
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: default_state_path(),
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::Local,
            endpoint: None,
            path: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
        }
    }
}

impl ResourceDecl {
    /// Creates an always-enabled declaration without attributes.
    #[must_use]
    pub fn new(id: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: EnabledExpr::default(),
            depends_on: Vec::new(),
            attributes: BTreeMap::new(),
        }
    }

    /// Adds a raw attribute.
    #[must_use]
    pub fn attr(mut self, name: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }

    /// Adds an explicit dependency.
    #[must_use]
    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.depends_on.push(id.into());
        self
    }

    /// Gates the resource on a flag expression.
    #[must_use]
    pub fn enabled_by(mut self, flag: impl Into<String>) -> Self {
        self.enabled = EnabledExpr::Flag(flag.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let doc: Document = serde_yaml::from_str("project: { name: platform }").unwrap();

        assert_eq!(doc.project.environment, "dev");
        assert_eq!(doc.state.path, ".converge");
        assert_eq!(doc.provider.kind, ProviderKind::Local);
        assert_eq!(doc.provider.timeout_secs, 30);
        assert_eq!(doc.settings.parallelism, 4);
        assert!(doc.resources.is_empty());
    }

    #[test]
    fn test_resource_declarations() {
        let yaml = r#"
project: { name: platform }
flags: { create_cluster: true }
resources:
  - id: vpc
    kind: network
    attributes: { cidr: 10.0.0.0/16 }
  - id: cluster
    kind: cluster
    enabled: create_cluster
    depends_on: [vpc]
    attributes: { vpc_id: "${vpc.id}" }
  - id: legacy
    kind: addon
    enabled: false
"#;
        let doc: Document = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(doc.resources.len(), 3);
        assert_eq!(doc.resources[0].kind, ResourceKind::Network);
        assert_eq!(doc.resources[1].enabled, EnabledExpr::Flag(String::from("create_cluster")));
        assert_eq!(doc.resources[1].depends_on, vec![String::from("vpc")]);
        assert_eq!(doc.resources[1].attributes["vpc_id"], json!("${vpc.id}"));
        assert_eq!(doc.resources[2].enabled, EnabledExpr::Literal(false));
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let yaml = r"
project: { name: platform }
resources:
  - id: db
    kind: database
";
        assert!(serde_yaml::from_str::<Document>(yaml).is_err());
    }
}
