//! Recorded reconciliation state.
//!
//! State remembers what the provider created for each resource id: its
//! provider id, the attributes it was last converged to and its outputs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::graph::{Attributes, ResourceKind};
use crate::provider::Outputs;

/// Current version of the state format.
pub const STATE_VERSION: &str = "1.0";

/// Maximum number of history entries kept.
const MAX_HISTORY: usize = 100;

/// The complete reconciliation state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconcileState {
    /// State format version.
    pub version: String,
    /// Project name.
    pub project: String,
    /// Environment name.
    pub environment: String,
    /// Incremented on every save.
    #[serde(default)]
    pub serial: u64,
    /// `${run.suffix}`, generated once and reused by every later run.
    pub naming_suffix: String,
    /// Hash of the last applied document.
    #[serde(default)]
    pub config_hash: String,
    /// Recorded resources by id.
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceState>,
    /// When the state was last updated.
    pub last_updated: DateTime<Utc>,
    /// Recent runs, oldest first.
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

/// State of a single resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceState {
    /// Resource id from the document.
    pub id: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Provider-assigned id.
    pub provider_id: String,
    /// Attributes last sent to the provider.
    pub attributes: Attributes,
    /// Hash of `attributes`.
    pub attributes_hash: String,
    /// Outputs last reported by the provider.
    #[serde(default)]
    pub outputs: Outputs,
    /// Resource ids this one depended on when last applied.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Declaration position when last applied.
    #[serde(default)]
    pub position: usize,
    /// When the resource was created.
    pub created_at: DateTime<Utc>,
    /// When the resource was last updated.
    pub updated_at: DateTime<Utc>,
}

/// A single entry in the run history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryEntry {
    /// When the run finished.
    pub timestamp: DateTime<Utc>,
    /// Type of run.
    pub operation: Operation,
    /// Document hash at the time.
    pub config_hash: String,
    /// Resources that changed.
    pub resources: Vec<String>,
    /// Whether every resource succeeded.
    pub success: bool,
    /// Summary of failures, if any.
    #[serde(default)]
    pub error: Option<String>,
}

/// Types of runs recorded in history.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Converge towards the document.
    Apply,
    /// Tear everything down.
    Destroy,
}

/// Generates a fresh 8-character naming suffix.
#[must_use]
pub fn generate_suffix() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

impl ReconcileState {
    /// Creates an empty state with a fresh naming suffix.
    #[must_use]
    pub fn new(project: &str, environment: &str) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            project: project.to_string(),
            environment: environment.to_string(),
            serial: 0,
            naming_suffix: generate_suffix(),
            config_hash: String::new(),
            resources: BTreeMap::new(),
            last_updated: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Gets a resource by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ResourceState> {
        self.resources.get(id)
    }

    /// Adds or replaces a resource.
    pub fn set(&mut self, resource: ResourceState) {
        self.resources.insert(resource.id.clone(), resource);
        self.last_updated = Utc::now();
    }

    /// Removes a resource.
    pub fn remove(&mut self, id: &str) -> Option<ResourceState> {
        let removed = self.resources.remove(id);
        if removed.is_some() {
            self.last_updated = Utc::now();
        }
        removed
    }

    /// Looks up a recorded output.
    #[must_use]
    pub fn output(&self, id: &str, output: &str) -> Option<&serde_json::Value> {
        self.resources.get(id).and_then(|r| r.outputs.get(output))
    }

    /// Adds a history entry, dropping the oldest beyond the limit.
    pub fn add_history(&mut self, entry: HistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            self.history.remove(0);
        }
        self.history.push(entry);
    }

    /// Ids of all recorded resources.
    #[must_use]
    pub fn resource_ids(&self) -> Vec<&str> {
        self.resources.keys().map(String::as_str).collect()
    }

    /// Returns true if no resources are recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

impl HistoryEntry {
    /// Creates a history entry.
    #[must_use]
    pub fn new(
        operation: Operation,
        config_hash: &str,
        resources: Vec<String>,
        error: Option<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            config_hash: config_hash.to_string(),
            resources,
            success: error.is_none(),
            error,
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Apply => "apply",
            Self::Destroy => "destroy",
        };
        write!(f, "{op}")
    }
}
