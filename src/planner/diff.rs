//! Diff engine comparing the document against recorded and observed state.

use std::collections::HashMap;
use tracing::debug;

use crate::config::ConfigHasher;
use crate::graph::{Inclusion, OutputRef, ResourceGraph, ResourceKind, Schedule};
use crate::provider::ObservedResource;
use crate::state::ReconcileState;

/// Engine for computing diffs between desired and recorded state.
#[derive(Debug, Default)]
pub struct DiffEngine {
    hasher: ConfigHasher,
}

/// Difference for a single resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDiff {
    /// Resource id.
    pub id: String,
    /// Desired kind, or the recorded kind for resources only in state.
    pub kind: ResourceKind,
    /// Type of difference.
    pub diff_type: DiffType,
    /// Human-readable explanation.
    pub reason: String,
    /// Hash recorded in state, if any.
    pub old_hash: Option<String>,
    /// Desired hash, if every reference could be resolved.
    pub new_hash: Option<String>,
}

/// Type of difference detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffType {
    /// Resource needs to be created.
    Create,
    /// Recorded resource has a different kind; destroy then create.
    Replace,
    /// Attributes differ from the recorded ones.
    Update,
    /// The provider reports attributes that differ from the recorded ones.
    Drift,
    /// Resource is recorded but no longer wanted.
    Delete,
    /// Resource is disabled and was never created.
    Excluded,
    /// Resource is unchanged.
    NoChange,
}

/// Complete diff result.
#[derive(Debug, Default)]
pub struct DiffResult {
    /// Diffs for graph nodes, indexed by graph index.
    pub nodes: Vec<Option<ResourceDiff>>,
    /// Diffs for resources only present in state, sorted by id.
    pub orphans: Vec<ResourceDiff>,
}

/// What the provider reported for each refreshed resource id. Ids absent from
/// the map were not refreshed.
pub type Observations = HashMap<String, Option<ObservedResource>>;

impl DiffEngine {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            hasher: ConfigHasher::new(),
        }
    }

    /// Computes the diff for an apply.
    ///
    /// Included nodes are visited in apply order so each node knows whether
    /// its dependencies will be recreated, in which case their outputs are
    /// only known after apply.
    #[must_use]
    pub fn compute(
        &self,
        graph: &ResourceGraph,
        inclusion: &Inclusion,
        schedule: &Schedule,
        state: &ReconcileState,
        observed: &Observations,
    ) -> DiffResult {
        let mut nodes: Vec<Option<ResourceDiff>> = vec![None; graph.len()];
        let mut recreated: Vec<bool> = vec![false; graph.len()];

        for &idx in schedule.apply_order() {
            let node = graph.node_at(idx);
            let diff = match state.get(&node.id) {
                None => self.diff(node.id.as_str(), node.kind, DiffType::Create, "declared in document", None, None),
                Some(recorded) if recorded.kind != node.kind => self.diff(
                    &node.id,
                    node.kind,
                    DiffType::Replace,
                    &format!("kind changed from {} to {}", recorded.kind, node.kind),
                    Some(recorded.attributes_hash.clone()),
                    None,
                ),
                Some(recorded) => {
                    let old_hash = Some(recorded.attributes_hash.clone());
                    match observed.get(&node.id) {
                        Some(None) => self.diff(
                            &node.id,
                            node.kind,
                            DiffType::Create,
                            "missing from provider",
                            old_hash,
                            None,
                        ),
                        Some(Some(current))
                            if self.hasher.hash_attributes(&current.attributes)
                                != recorded.attributes_hash =>
                        {
                            self.diff(&node.id, node.kind, DiffType::Drift, "drift detected", old_hash, None)
                        }
                        _ => {
                            let lookup = |r: &OutputRef| {
                                let dep = graph.index_of(&r.node)?;
                                if recreated[dep] {
                                    return None;
                                }
                                state.output(&r.node, &r.output).cloned()
                            };
                            match node.resolve_attributes(&lookup) {
                                Ok(resolved) => {
                                    let new_hash = self.hasher.hash_attributes(&resolved);
                                    if new_hash == recorded.attributes_hash {
                                        self.diff(&node.id, node.kind, DiffType::NoChange, "up to date", old_hash, Some(new_hash))
                                    } else {
                                        self.diff(&node.id, node.kind, DiffType::Update, "attributes changed", old_hash, Some(new_hash))
                                    }
                                }
                                Err(unresolved) => self.diff(
                                    &node.id,
                                    node.kind,
                                    DiffType::Update,
                                    &format!("{unresolved} known after apply"),
                                    old_hash,
                                    None,
                                ),
                            }
                        }
                    }
                }
            };

            recreated[idx] = matches!(diff.diff_type, DiffType::Create | DiffType::Replace);
            debug!("{}: {:?} ({})", diff.id, diff.diff_type, diff.reason);
            nodes[idx] = Some(diff);
        }

        for &idx in inclusion.excluded() {
            let node = graph.node_at(idx);
            let diff = match state.get(&node.id) {
                Some(recorded) => self.diff(
                    &node.id,
                    recorded.kind,
                    DiffType::Delete,
                    "disabled by flag",
                    Some(recorded.attributes_hash.clone()),
                    None,
                ),
                None => self.diff(&node.id, node.kind, DiffType::Excluded, "disabled", None, None),
            };
            nodes[idx] = Some(diff);
        }

        let orphans = state
            .resources
            .values()
            .filter(|r| graph.index_of(&r.id).is_none())
            .map(|r| {
                debug!("Found orphaned resource: {}", r.id);
                self.diff(
                    &r.id,
                    r.kind,
                    DiffType::Delete,
                    "removed from document",
                    Some(r.attributes_hash.clone()),
                    None,
                )
            })
            .collect();

        DiffResult { nodes, orphans }
    }

    #[allow(clippy::unused_self)]
    fn diff(
        &self,
        id: &str,
        kind: ResourceKind,
        diff_type: DiffType,
        reason: &str,
        old_hash: Option<String>,
        new_hash: Option<String>,
    ) -> ResourceDiff {
        ResourceDiff {
            id: id.to_string(),
            kind,
            diff_type,
            reason: reason.to_string(),
            old_hash,
            new_hash,
        }
    }
}

impl DiffResult {
    /// Iterates over every diff, graph nodes first.
    pub fn iter(&self) -> impl Iterator<Item = &ResourceDiff> {
        self.nodes.iter().flatten().chain(self.orphans.iter())
    }

    /// Returns true if applying would change nothing.
    #[must_use]
    pub fn is_converged(&self) -> bool {
        self.iter()
            .all(|d| matches!(d.diff_type, DiffType::NoChange | DiffType::Excluded))
    }

    /// Resources whose provider-side attributes drifted.
    #[must_use]
    pub fn drifted(&self) -> Vec<&ResourceDiff> {
        self.iter()
            .filter(|d| d.diff_type == DiffType::Drift || d.reason == "missing from provider")
            .collect()
    }
}

impl std::fmt::Display for DiffType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Replace => "replace",
            Self::Update => "update",
            Self::Drift => "drift",
            Self::Delete => "delete",
            Self::Excluded => "excluded",
            Self::NoChange => "no change",
        };
        write!(f, "{s}")
    }
}
