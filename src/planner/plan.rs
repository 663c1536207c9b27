//! Reconciliation plans.
//!
//! A plan is a list of entries, each naming the entries it must wait for.
//! Destroys of resources that are no longer wanted come first; apply entries
//! follow in apply order.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::diff::{DiffResult, DiffType, ResourceDiff};
use crate::error::PlanError;
use crate::graph::{topological_order, ResourceGraph, ResourceKind, Schedule};
use crate::state::ReconcileState;

/// What a plan does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanMode {
    /// Converge towards the document.
    Apply,
    /// Tear down everything recorded in state.
    Destroy,
}

/// Action planned for one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanAction {
    /// Create the resource.
    Create,
    /// Update the resource in place.
    Update,
    /// Destroy the resource.
    Destroy,
    /// Disabled; nothing to do.
    Skip,
    /// Expected to be unchanged; re-checked before execution.
    NoOp,
}

/// A single plan entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanEntry {
    /// Resource id.
    pub id: String,
    /// Resource kind the action applies to.
    pub kind: ResourceKind,
    /// Planned action.
    pub action: PlanAction,
    /// Why.
    pub reason: String,
    /// Graph index, for resources declared in the document.
    #[serde(skip)]
    pub node: Option<usize>,
    /// Declaration position, for resources declared in the document.
    pub position: Option<usize>,
    /// Force an update even if the recorded hash matches (drift).
    pub force: bool,
    /// Indices of entries that must succeed first.
    pub dependencies: Vec<usize>,
}

/// A complete reconciliation plan.
#[derive(Debug, Clone, Serialize)]
pub struct ReconcilePlan {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Plan mode.
    pub mode: PlanMode,
    /// Document hash the plan is based on.
    pub config_hash: String,
    /// Entries in a valid execution order.
    pub entries: Vec<PlanEntry>,
}

impl ReconcilePlan {
    /// Builds an apply plan from a diff.
    ///
    /// # Errors
    ///
    /// Returns `StateCycle` if recorded dependencies between destroyed
    /// resources form a cycle.
    pub fn for_apply(
        graph: &ResourceGraph,
        schedule: &Schedule,
        diff: &DiffResult,
        state: &ReconcileState,
        config_hash: &str,
    ) -> Result<Self, PlanError> {
        let mut entries: Vec<PlanEntry> = Vec::new();

        // Destroys: orphans, disabled resources and the old half of replacements.
        let mut doomed: Vec<(&ResourceDiff, Option<usize>)> = diff
            .orphans
            .iter()
            .map(|d| (d, None))
            .collect();
        for (idx, d) in diff.nodes.iter().enumerate() {
            if let Some(d) = d.as_ref().filter(|d| matches!(d.diff_type, DiffType::Delete | DiffType::Replace)) {
                doomed.push((d, Some(idx)));
            }
        }
        let destroy_ids = destroy_order(&doomed.iter().map(|(d, _)| d.id.as_str()).collect::<Vec<_>>(), state)?;
        let mut destroy_index: HashMap<String, usize> = HashMap::new();
        for id in destroy_ids {
            let Some(&(d, node)) = doomed.iter().find(|(d, _)| d.id == id) else {
                continue;
            };
            let recorded_kind = state.get(&d.id).map_or(d.kind, |r| r.kind);
            let reason = if d.diff_type == DiffType::Replace {
                format!("{} (replaced)", d.reason)
            } else {
                d.reason.clone()
            };
            destroy_index.insert(d.id.clone(), entries.len());
            entries.push(PlanEntry {
                id: d.id.clone(),
                kind: recorded_kind,
                action: PlanAction::Destroy,
                reason,
                node,
                position: node.map(|i| graph.node_at(i).position),
                force: false,
                dependencies: Vec::new(),
            });
        }
        wire_destroy_dependencies(&mut entries, state);

        // Applies in apply order.
        let mut apply_index: Vec<Option<usize>> = vec![None; graph.len()];
        for &idx in schedule.apply_order() {
            let Some(d) = diff.nodes[idx].as_ref() else {
                continue;
            };
            let node = graph.node_at(idx);
            let action = match d.diff_type {
                DiffType::Create | DiffType::Replace => PlanAction::Create,
                DiffType::Update | DiffType::Drift => PlanAction::Update,
                DiffType::NoChange => PlanAction::NoOp,
                DiffType::Delete | DiffType::Excluded => continue,
            };

            let mut dependencies: Vec<usize> = graph
                .dependencies_of(idx)
                .iter()
                .filter_map(|&dep| apply_index[dep])
                .collect();
            if d.diff_type == DiffType::Replace {
                dependencies.extend(destroy_index.get(&d.id).copied());
            }
            dependencies.sort_unstable();

            apply_index[idx] = Some(entries.len());
            entries.push(PlanEntry {
                id: node.id.clone(),
                kind: node.kind,
                action,
                reason: d.reason.clone(),
                node: Some(idx),
                position: Some(node.position),
                force: d.diff_type == DiffType::Drift,
                dependencies,
            });
        }

        // A resource being removed waits for the updates of resources that
        // still referenced it when last applied.
        for (entry_idx, entry) in entries.clone().iter().enumerate() {
            if entry.action != PlanAction::Destroy || entry.reason.ends_with("(replaced)") {
                continue;
            }
            for recorded in state.resources.values() {
                if !recorded.depends_on.contains(&entry.id) {
                    continue;
                }
                if let Some(apply) = graph.index_of(&recorded.id).and_then(|i| apply_index[i]) {
                    if entries[apply].action != PlanAction::Create {
                        entries[entry_idx].dependencies.push(apply);
                    }
                }
            }
            entries[entry_idx].dependencies.sort_unstable();
            entries[entry_idx].dependencies.dedup();
        }

        // Disabled resources that were never created.
        for (idx, d) in diff.nodes.iter().enumerate() {
            if let Some(d) = d.as_ref().filter(|d| d.diff_type == DiffType::Excluded) {
                entries.push(PlanEntry {
                    id: d.id.clone(),
                    kind: d.kind,
                    action: PlanAction::Skip,
                    reason: d.reason.clone(),
                    node: Some(idx),
                    position: Some(graph.node_at(idx).position),
                    force: false,
                    dependencies: Vec::new(),
                });
            }
        }

        let plan = Self {
            created_at: Utc::now(),
            mode: PlanMode::Apply,
            config_hash: config_hash.to_string(),
            entries,
        };
        plan.check_acyclic()?;
        Ok(plan)
    }

    /// Builds a destroy plan covering every resource recorded in state.
    ///
    /// Each destroy waits for the destroys of everything that depends on it,
    /// per the graph and per recorded dependencies.
    ///
    /// # Errors
    ///
    /// Returns `StateCycle` if recorded dependencies form a cycle.
    pub fn for_destroy(
        graph: &ResourceGraph,
        schedule: &Schedule,
        state: &ReconcileState,
        config_hash: &str,
    ) -> Result<Self, PlanError> {
        let orphans: Vec<&str> = state
            .resources
            .keys()
            .map(String::as_str)
            .filter(|id| graph.index_of(id).is_none())
            .collect();

        let mut entries: Vec<PlanEntry> = Vec::new();
        for id in destroy_order(&orphans, state)? {
            if let Some(recorded) = state.get(&id) {
                entries.push(PlanEntry {
                    id,
                    kind: recorded.kind,
                    action: PlanAction::Destroy,
                    reason: String::from("removed from document"),
                    node: None,
                    position: None,
                    force: false,
                    dependencies: Vec::new(),
                });
            }
        }

        for idx in schedule.destroy_order() {
            let node = graph.node_at(idx);
            if let Some(recorded) = state.get(&node.id) {
                entries.push(PlanEntry {
                    id: node.id.clone(),
                    kind: recorded.kind,
                    action: PlanAction::Destroy,
                    reason: String::from("destroy requested"),
                    node: Some(idx),
                    position: Some(node.position),
                    force: false,
                    dependencies: Vec::new(),
                });
            }
        }

        let index: HashMap<&str, usize> = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.id.as_str(), i))
            .collect();

        // waits[i]: entries that must be destroyed before entry i.
        let mut waits: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); entries.len()];
        for edge in graph.edges() {
            if let (Some(&dependent), Some(&dependency)) =
                (index.get(edge.from.as_str()), index.get(edge.to.as_str()))
            {
                waits[dependency].insert(dependent);
            }
        }
        for recorded in state.resources.values() {
            let Some(&dependent) = index.get(recorded.id.as_str()) else {
                continue;
            };
            for dep in &recorded.depends_on {
                if let Some(&dependency) = index.get(dep.as_str()) {
                    waits[dependency].insert(dependent);
                }
            }
        }
        for (entry, wait) in entries.iter_mut().zip(waits) {
            entry.dependencies = wait.into_iter().collect();
        }

        let plan = Self {
            created_at: Utc::now(),
            mode: PlanMode::Destroy,
            config_hash: config_hash.to_string(),
            entries,
        };
        plan.check_acyclic()?;
        Ok(plan)
    }

    fn check_acyclic(&self) -> Result<(), PlanError> {
        for entry in &self.entries {
            if let Some(&missing) = entry.dependencies.iter().find(|&&d| d >= self.entries.len()) {
                return Err(PlanError::MissingDependency {
                    entry: entry.id.clone(),
                    index: missing,
                });
            }
        }

        let deps: Vec<Vec<usize>> = self.entries.iter().map(|e| e.dependencies.clone()).collect();
        let priority: Vec<usize> = (0..self.entries.len()).collect();
        topological_order(&deps, &priority).map(|_| ()).map_err(|remaining| PlanError::StateCycle {
            nodes: remaining.into_iter().map(|i| self.entries[i].id.clone()).collect(),
        })
    }

    /// Returns true if nothing would change.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries
            .iter()
            .all(|e| matches!(e.action, PlanAction::NoOp | PlanAction::Skip))
    }

    /// Number of entries with the given action.
    #[must_use]
    pub fn count(&self, action: PlanAction) -> usize {
        self.entries.iter().filter(|e| e.action == action).count()
    }

    /// `Plan: N to add, M to change, K to destroy.`
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "Plan: {} to add, {} to change, {} to destroy.",
            self.count(PlanAction::Create),
            self.count(PlanAction::Update),
            self.count(PlanAction::Destroy)
        )
    }
}

/// Orders resources being destroyed so dependents go first, per recorded
/// dependencies. Ties are broken by last-applied position, latest first.
fn destroy_order(ids: &[&str], state: &ReconcileState) -> Result<Vec<String>, PlanError> {
    let mut sorted: Vec<&str> = ids.to_vec();
    sorted.sort_by(|a, b| {
        let pa = state.get(a).map_or(0, |r| r.position);
        let pb = state.get(b).map_or(0, |r| r.position);
        pb.cmp(&pa).then_with(|| a.cmp(b))
    });
    let local: BTreeMap<&str, usize> = sorted.iter().enumerate().map(|(i, id)| (*id, i)).collect();

    // deps[x]: resources that must be destroyed before x, i.e. those depending on x.
    let mut deps: Vec<Vec<usize>> = vec![Vec::new(); sorted.len()];
    for (i, id) in sorted.iter().enumerate() {
        if let Some(recorded) = state.get(id) {
            for dep in &recorded.depends_on {
                if let Some(&j) = local.get(dep.as_str()) {
                    deps[j].push(i);
                }
            }
        }
    }

    let priority: Vec<usize> = (0..sorted.len()).collect();
    topological_order(&deps, &priority)
        .map(|order| order.into_iter().map(|i| sorted[i].to_string()).collect())
        .map_err(|remaining| PlanError::StateCycle {
            nodes: remaining.into_iter().map(|i| sorted[i].to_string()).collect(),
        })
}

/// Makes every destroy wait for the destroys of resources recorded as depending on it.
fn wire_destroy_dependencies(entries: &mut [PlanEntry], state: &ReconcileState) {
    let index: HashMap<String, usize> = entries
        .iter()
        .enumerate()
        .map(|(i, e)| (e.id.clone(), i))
        .collect();

    for recorded in state.resources.values() {
        let Some(&dependent) = index.get(&recorded.id) else {
            continue;
        };
        for dep in &recorded.depends_on {
            if let Some(&dependency) = index.get(dep) {
                entries[dependency].dependencies.push(dependent);
            }
        }
    }
    for entry in entries.iter_mut() {
        entry.dependencies.sort_unstable();
        entry.dependencies.dedup();
    }
}

impl std::fmt::Display for PlanAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Destroy => "destroy",
            Self::Skip => "skip",
            Self::NoOp => "no-op",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for PlanEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} ({}): {}", self.action, self.id, self.kind, self.reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigHasher, FlagBindings, ResourceDecl};
    use crate::graph::{Attributes, GraphBuilder, Inclusion, InclusionResolver, RunContext, Scheduler};
    use crate::planner::diff::{DiffEngine, Observations};
    use crate::state::ResourceState;
    use serde_json::json;

    fn build(decls: &[ResourceDecl], flags: &FlagBindings) -> (ResourceGraph, Inclusion, Schedule) {
        let graph = GraphBuilder::new(RunContext::new("s", "p", "dev")).build(decls).unwrap();
        let inclusion = InclusionResolver::new(flags).resolve(&graph).unwrap();
        let schedule = Scheduler::schedule(&graph, &inclusion).unwrap();
        (graph, inclusion, schedule)
    }

    fn record(state: &mut ReconcileState, id: &str, kind: ResourceKind, position: usize, depends_on: &[&str]) {
        state.set(ResourceState {
            id: id.to_string(),
            kind,
            provider_id: format!("{id}-1"),
            attributes: Attributes::new(),
            attributes_hash: ConfigHasher::new().hash_attributes(&Attributes::new()),
            outputs: Attributes::from([(String::from("id"), json!(format!("{id}-1")))]),
            depends_on: depends_on.iter().map(ToString::to_string).collect(),
            position,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        });
    }

    fn platform() -> Vec<ResourceDecl> {
        vec![
            ResourceDecl::new("vpc", ResourceKind::Network),
            ResourceDecl::new("cluster", ResourceKind::Cluster).attr("vpc_id", json!("${vpc.id}")),
            ResourceDecl::new("ng_a", ResourceKind::NodeGroup).attr("cluster", json!("${cluster.id}")),
            ResourceDecl::new("ng_b", ResourceKind::NodeGroup).attr("cluster", json!("${cluster.id}")),
        ]
    }

    fn entry<'a>(plan: &'a ReconcilePlan, id: &str) -> (usize, &'a PlanEntry) {
        plan.entries.iter().enumerate().find(|(_, e)| e.id == id).unwrap()
    }

    #[test]
    fn test_apply_plan_dependencies_follow_graph() {
        let (graph, inclusion, schedule) = build(&platform(), &FlagBindings::default());
        let state = ReconcileState::new("p", "dev");
        let diff = DiffEngine::new().compute(&graph, &inclusion, &schedule, &state, &Observations::new());

        let plan = ReconcilePlan::for_apply(&graph, &schedule, &diff, &state, "hash").unwrap();

        assert_eq!(plan.summary(), "Plan: 4 to add, 0 to change, 0 to destroy.");
        let (vpc, _) = entry(&plan, "vpc");
        let (cluster, cluster_entry) = entry(&plan, "cluster");
        let (_, ng_a) = entry(&plan, "ng_a");
        assert_eq!(cluster_entry.dependencies, vec![vpc]);
        assert_eq!(ng_a.dependencies, vec![cluster]);
    }

    #[test]
    fn test_removed_resources_destroyed_first_in_reverse_dependency_order() {
        let (graph, inclusion, schedule) = build(&platform()[..1], &FlagBindings::default());
        let mut state = ReconcileState::new("p", "dev");
        record(&mut state, "vpc", ResourceKind::Network, 0, &[]);
        record(&mut state, "cluster", ResourceKind::Cluster, 1, &["vpc"]);
        record(&mut state, "ng_a", ResourceKind::NodeGroup, 2, &["cluster"]);
        let diff = DiffEngine::new().compute(&graph, &inclusion, &schedule, &state, &Observations::new());

        let plan = ReconcilePlan::for_apply(&graph, &schedule, &diff, &state, "hash").unwrap();

        let ids: Vec<&str> = plan.entries.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["ng_a", "cluster", "vpc"]);
        let (ng_a, _) = entry(&plan, "ng_a");
        let (_, cluster) = entry(&plan, "cluster");
        assert_eq!(cluster.dependencies, vec![ng_a]);
        assert_eq!(plan.count(PlanAction::NoOp), 1);
    }

    #[test]
    fn test_disabled_resource_waits_for_dependent_updates() {
        let decls = vec![
            ResourceDecl::new("sg", ResourceKind::SecurityGroup).enabled_by("legacy_sg"),
            ResourceDecl::new("cluster", ResourceKind::Cluster),
        ];
        let flags = FlagBindings::from_iter([(String::from("legacy_sg"), false)]);
        let (graph, inclusion, schedule) = build(&decls, &flags);
        let mut state = ReconcileState::new("p", "dev");
        record(&mut state, "sg", ResourceKind::SecurityGroup, 0, &[]);
        record(&mut state, "cluster", ResourceKind::Cluster, 1, &["sg"]);
        let diff = DiffEngine::new().compute(&graph, &inclusion, &schedule, &state, &Observations::new());

        let plan = ReconcilePlan::for_apply(&graph, &schedule, &diff, &state, "hash").unwrap();

        let (cluster, _) = entry(&plan, "cluster");
        let (_, sg) = entry(&plan, "sg");
        assert_eq!(sg.action, PlanAction::Destroy);
        assert_eq!(sg.reason, "disabled by flag");
        assert_eq!(sg.dependencies, vec![cluster]);
    }

    #[test]
    fn test_destroy_plan_is_reverse_apply_order() {
        let (graph, _, _) = build(&platform(), &FlagBindings::default());
        let all = Inclusion::all(&graph);
        let schedule = Scheduler::schedule(&graph, &all).unwrap();
        let mut state = ReconcileState::new("p", "dev");
        record(&mut state, "vpc", ResourceKind::Network, 0, &[]);
        record(&mut state, "cluster", ResourceKind::Cluster, 1, &["vpc"]);
        record(&mut state, "ng_a", ResourceKind::NodeGroup, 2, &["cluster"]);
        record(&mut state, "ng_b", ResourceKind::NodeGroup, 3, &["cluster"]);
        record(&mut state, "orphan", ResourceKind::Addon, 4, &["cluster"]);

        let plan = ReconcilePlan::for_destroy(&graph, &schedule, &state, "hash").unwrap();

        let ids: Vec<&str> = plan.entries.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["orphan", "ng_b", "ng_a", "cluster", "vpc"]);
        let (_, cluster) = entry(&plan, "cluster");
        assert_eq!(cluster.dependencies, vec![0, 1, 2]);
        assert_eq!(plan.summary(), "Plan: 0 to add, 0 to change, 5 to destroy.");
    }

    #[test]
    fn test_state_cycle_rejected() {
        let (graph, _, _) = build(&[], &FlagBindings::default());
        let schedule = Scheduler::schedule(&graph, &Inclusion::all(&graph)).unwrap();
        let mut state = ReconcileState::new("p", "dev");
        record(&mut state, "a", ResourceKind::Role, 0, &["b"]);
        record(&mut state, "b", ResourceKind::Policy, 1, &["a"]);

        let err = ReconcilePlan::for_destroy(&graph, &schedule, &state, "hash").unwrap_err();
        assert!(matches!(err, PlanError::StateCycle { .. }));
    }
}
