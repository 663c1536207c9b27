//! Plan executor.
//!
//! A single coordinator walks the plan and hands ready entries to a bounded
//! pool of tokio tasks. Workers only talk to the provider; the coordinator
//! alone resolves attributes, records outcomes and mutates state.

use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::{Id, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ConfigHasher;
use crate::error::{ConvergeError, ProviderError, ReconcileError, Result};
use crate::graph::{Attributes, OutputRef, ResourceGraph, ResourceKind};
use crate::provider::{CreateOutcome, NoRetry, Outputs, Provider, ProviderResult, RetryHook};
use crate::state::{ReconcileState, ResourceState};

use super::plan::{PlanAction, PlanMode, ReconcilePlan};

/// Default number of concurrent provider operations.
pub const DEFAULT_PARALLELISM: usize = 4;

/// Why a node was not executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum SkipReason {
    /// Disabled by its `enabled` predicate.
    Disabled,
    /// A dependency failed or was itself skipped for that reason.
    DependencyFailed(String),
    /// The run was cancelled before the node started.
    Cancelled,
}

/// Terminal outcome of one plan entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum NodeOutcome {
    /// The resource was created.
    Created,
    /// The resource was updated in place.
    Updated,
    /// The resource was destroyed.
    Destroyed,
    /// Nothing needed to change.
    Unchanged,
    /// The provider operation failed.
    Failed(String),
    /// The entry never ran.
    Skipped(SkipReason),
}

/// Result for one plan entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeResult {
    /// Resource id.
    pub id: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Planned action.
    pub action: PlanAction,
    /// Declaration position, if declared in the document.
    pub position: Option<usize>,
    /// Terminal outcome.
    pub outcome: NodeOutcome,
    /// Provider id after the operation, if the resource exists.
    pub provider_id: Option<String>,
    /// Provider attempts made.
    pub attempts: u32,
    /// Time spent in the provider, in milliseconds.
    pub duration_ms: Option<u64>,
}

/// Result of executing a whole plan.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    /// Plan mode.
    pub mode: PlanMode,
    /// One result per plan entry, in plan order.
    pub results: Vec<NodeResult>,
    /// Whether cancellation was requested during the run.
    pub cancelled: bool,
}

/// Executes reconciliation plans against a provider.
#[derive(Clone)]
pub struct PlanExecutor {
    provider: Arc<dyn Provider>,
    retry: Arc<dyn RetryHook>,
    parallelism: usize,
    cancel: CancellationToken,
}

/// Provider call handed to a worker.
#[derive(Debug)]
enum Job {
    Create {
        kind: ResourceKind,
        id: String,
        attributes: Attributes,
    },
    Update {
        kind: ResourceKind,
        provider_id: String,
        attributes: Attributes,
    },
    Destroy {
        kind: ResourceKind,
        provider_id: String,
    },
}

#[derive(Debug)]
enum JobOutput {
    Created(CreateOutcome),
    Updated(Outputs),
    Destroyed,
}

#[derive(Debug)]
struct WorkerReport {
    result: ProviderResult<JobOutput>,
    attempts: u32,
    elapsed: Duration,
}

/// Resolved attributes waiting for the provider's answer.
#[derive(Debug)]
struct Pending {
    attributes: Attributes,
    hash: String,
}

enum Prepared {
    Done(NodeOutcome),
    Spawn(Job, Option<Pending>),
}

/// Coordinator bookkeeping for one run.
struct Run<'a> {
    plan: &'a ReconcilePlan,
    graph: &'a ResourceGraph,
    outcomes: Vec<Option<NodeOutcome>>,
    remaining: Vec<usize>,
    dependents: Vec<Vec<usize>>,
    ready: BTreeSet<usize>,
    run_outputs: HashMap<String, Outputs>,
    pending: HashMap<usize, Pending>,
    attempts: Vec<u32>,
    durations: Vec<Option<u64>>,
}

impl std::fmt::Debug for PlanExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanExecutor")
            .field("retry", &self.retry)
            .field("parallelism", &self.parallelism)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl PlanExecutor {
    /// Creates an executor with default parallelism and no retries.
    #[must_use]
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider,
            retry: Arc::new(NoRetry),
            parallelism: DEFAULT_PARALLELISM,
            cancel: CancellationToken::new(),
        }
    }

    /// Sets the maximum number of concurrent provider operations.
    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Sets the hook consulted after transient provider errors.
    #[must_use]
    pub fn with_retry_hook(mut self, retry: Arc<dyn RetryHook>) -> Self {
        self.retry = retry;
        self
    }

    /// Uses `cancel` to stop starting new operations.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Executes a plan, updating `state` as entries succeed.
    ///
    /// Failures never abort the run: a failed entry's transitive dependents
    /// are skipped while independent entries keep running.
    ///
    /// # Errors
    ///
    /// Returns `WorkerLost` if a worker task disappears without reporting.
    pub async fn execute(
        &self,
        plan: &ReconcilePlan,
        graph: &ResourceGraph,
        state: &mut ReconcileState,
    ) -> Result<ExecutionResult> {
        info!(
            "Executing {:?} plan with {} entries (parallelism {})",
            plan.mode,
            plan.entries.len(),
            self.parallelism
        );

        let mut run = Run::new(plan, graph);
        let mut workers: JoinSet<WorkerReport> = JoinSet::new();
        let mut in_flight: HashMap<Id, usize> = HashMap::new();
        let mut cancelled = self.cancel.is_cancelled();

        loop {
            while !cancelled && workers.len() < self.parallelism {
                let Some(i) = run.ready.pop_first() else {
                    break;
                };
                match run.prepare(i, state) {
                    Prepared::Done(outcome) => run.finish(i, outcome),
                    Prepared::Spawn(job, pending) => {
                        if let Some(pending) = pending {
                            run.pending.insert(i, pending);
                        }
                        let handle = workers.spawn(run_job(
                            Arc::clone(&self.provider),
                            Arc::clone(&self.retry),
                            plan.entries[i].id.clone(),
                            job,
                        ));
                        in_flight.insert(handle.id(), i);
                    }
                }
            }

            if workers.is_empty() {
                break;
            }

            tokio::select! {
                () = self.cancel.cancelled(), if !cancelled => {
                    warn!("Cancellation requested; waiting for {} in-flight operations", workers.len());
                    cancelled = true;
                }
                joined = workers.join_next_with_id() => match joined {
                    Some(Ok((task, report))) => {
                        let i = in_flight.remove(&task).ok_or_else(|| {
                            ConvergeError::internal("worker finished for an unknown entry")
                        })?;
                        run.complete(i, report, state);
                    }
                    Some(Err(join_error)) => {
                        let Some(i) = in_flight.remove(&join_error.id()) else {
                            return Err(ConvergeError::Reconcile(ReconcileError::WorkerLost {
                                id: String::from("<unknown>"),
                                reason: join_error.to_string(),
                            }));
                        };
                        error!("Worker for {} did not complete: {}", plan.entries[i].id, join_error);
                        run.finish(i, NodeOutcome::Failed(format!("worker did not complete: {join_error}")));
                    }
                    None => break,
                }
            }
        }

        Ok(run.into_result(cancelled))
    }
}

/// Runs one provider call, consulting the retry hook on transient errors.
async fn run_job(
    provider: Arc<dyn Provider>,
    retry: Arc<dyn RetryHook>,
    id: String,
    job: Job,
) -> WorkerReport {
    let started = Instant::now();
    let mut attempts = 0;

    loop {
        attempts += 1;
        let result = match &job {
            Job::Create {
                kind,
                id: logical_id,
                attributes,
            } => provider
                .create(*kind, logical_id, attributes)
                .await
                .map(JobOutput::Created),
            Job::Update {
                kind,
                provider_id,
                attributes,
            } => provider
                .update(*kind, provider_id, attributes)
                .await
                .map(JobOutput::Updated),
            Job::Destroy { kind, provider_id } => match provider.destroy(*kind, provider_id).await {
                Err(ProviderError::NotFound { .. }) => {
                    debug!("{} already gone from provider", id);
                    Ok(JobOutput::Destroyed)
                }
                other => other.map(|()| JobOutput::Destroyed),
            },
        };

        match result {
            Err(e) if e.is_transient() => {
                if let Some(delay) = retry.retry_after(&id, attempts, &e) {
                    warn!("Transient error for {} (attempt {}): {}; retrying in {:?}", id, attempts, e, delay);
                    tokio::time::sleep(delay).await;
                    continue;
                }
                return WorkerReport {
                    result: Err(e),
                    attempts,
                    elapsed: started.elapsed(),
                };
            }
            result => {
                return WorkerReport {
                    result,
                    attempts,
                    elapsed: started.elapsed(),
                };
            }
        }
    }
}

impl<'a> Run<'a> {
    fn new(plan: &'a ReconcilePlan, graph: &'a ResourceGraph) -> Self {
        let n = plan.entries.len();
        let mut dependents = vec![Vec::new(); n];
        let mut remaining = vec![0; n];
        for (i, entry) in plan.entries.iter().enumerate() {
            remaining[i] = entry.dependencies.len();
            for &dep in &entry.dependencies {
                dependents[dep].push(i);
            }
        }

        let mut run = Self {
            plan,
            graph,
            outcomes: vec![None; n],
            remaining,
            dependents,
            ready: BTreeSet::new(),
            run_outputs: HashMap::new(),
            pending: HashMap::new(),
            attempts: vec![0; n],
            durations: vec![None; n],
        };

        for (i, entry) in plan.entries.iter().enumerate() {
            if entry.action == PlanAction::Skip {
                run.outcomes[i] = Some(NodeOutcome::Skipped(SkipReason::Disabled));
            } else if run.remaining[i] == 0 {
                run.ready.insert(i);
            }
        }
        run
    }

    /// Decides what entry `i` needs, resolving its attributes against outputs
    /// produced in this run or recorded in state.
    fn prepare(&self, i: usize, state: &ReconcileState) -> Prepared {
        let entry = &self.plan.entries[i];

        if entry.action == PlanAction::Destroy {
            return match state.get(&entry.id) {
                Some(recorded) => {
                    info!("Destroying {} ({})", entry.id, entry.kind);
                    Prepared::Spawn(
                        Job::Destroy {
                            kind: recorded.kind,
                            provider_id: recorded.provider_id.clone(),
                        },
                        None,
                    )
                }
                None => Prepared::Done(NodeOutcome::Destroyed),
            };
        }

        let Some(node) = entry.node.map(|idx| self.graph.node_at(idx)) else {
            return Prepared::Done(NodeOutcome::Failed(format!(
                "'{}' is not declared in the document",
                entry.id
            )));
        };

        let lookup = |r: &OutputRef| {
            self.run_outputs
                .get(&r.node)
                .and_then(|outputs| outputs.get(&r.output))
                .or_else(|| state.output(&r.node, &r.output))
                .cloned()
        };
        let attributes = match node.resolve_attributes(&lookup) {
            Ok(attributes) => attributes,
            Err(unresolved) => {
                return Prepared::Done(NodeOutcome::Failed(format!(
                    "unresolved reference {unresolved}"
                )));
            }
        };
        let hash = ConfigHasher::new().hash_attributes(&attributes);

        let recorded = state.get(&entry.id).filter(|r| r.kind == node.kind);
        match (entry.action, recorded) {
            (PlanAction::Update | PlanAction::NoOp, Some(recorded)) => {
                if hash == recorded.attributes_hash && !entry.force {
                    debug!("{} unchanged", entry.id);
                    return Prepared::Done(NodeOutcome::Unchanged);
                }
                info!("Updating {} ({})", entry.id, node.kind);
                Prepared::Spawn(
                    Job::Update {
                        kind: node.kind,
                        provider_id: recorded.provider_id.clone(),
                        attributes: attributes.clone(),
                    },
                    Some(Pending { attributes, hash }),
                )
            }
            _ => {
                info!("Creating {} ({})", entry.id, node.kind);
                Prepared::Spawn(
                    Job::Create {
                        kind: node.kind,
                        id: entry.id.clone(),
                        attributes: attributes.clone(),
                    },
                    Some(Pending { attributes, hash }),
                )
            }
        }
    }

    /// Records a worker's report and updates state on success.
    fn complete(&mut self, i: usize, report: WorkerReport, state: &mut ReconcileState) {
        self.attempts[i] = report.attempts;
        self.durations[i] = u64::try_from(report.elapsed.as_millis()).ok();
        let entry = &self.plan.entries[i];
        let pending = self.pending.remove(&i);

        let outcome = match report.result {
            Ok(JobOutput::Destroyed) => {
                state.remove(&entry.id);
                info!("Destroyed {}", entry.id);
                NodeOutcome::Destroyed
            }
            Ok(JobOutput::Created(created)) => {
                let now = Utc::now();
                let (attributes, hash) = pending.map(|p| (p.attributes, p.hash)).unwrap_or_default();
                self.run_outputs.insert(entry.id.clone(), created.outputs.clone());
                state.set(ResourceState {
                    id: entry.id.clone(),
                    kind: entry.kind,
                    provider_id: created.provider_id.clone(),
                    attributes,
                    attributes_hash: hash,
                    outputs: created.outputs,
                    depends_on: self.dependency_ids(i),
                    position: entry.position.unwrap_or_default(),
                    created_at: now,
                    updated_at: now,
                });
                info!("Created {} as {}", entry.id, created.provider_id);
                NodeOutcome::Created
            }
            Ok(JobOutput::Updated(outputs)) => {
                let depends_on = self.dependency_ids(i);
                if let Some(mut recorded) = state.get(&entry.id).cloned() {
                    if let Some(p) = pending {
                        recorded.attributes = p.attributes;
                        recorded.attributes_hash = p.hash;
                    }
                    recorded.outputs.clone_from(&outputs);
                    recorded.depends_on = depends_on;
                    recorded.position = entry.position.unwrap_or(recorded.position);
                    recorded.updated_at = Utc::now();
                    state.set(recorded);
                }
                self.run_outputs.insert(entry.id.clone(), outputs);
                info!("Updated {}", entry.id);
                NodeOutcome::Updated
            }
            Err(e) => {
                error!("{} {} failed: {}", entry.action, entry.id, e);
                NodeOutcome::Failed(e.to_string())
            }
        };

        self.finish(i, outcome);
    }

    /// Marks entry `i` terminal and releases or skips its dependents.
    fn finish(&mut self, i: usize, outcome: NodeOutcome) {
        let failed = matches!(outcome, NodeOutcome::Failed(_));
        self.outcomes[i] = Some(outcome);

        if failed {
            let root = self.plan.entries[i].id.clone();
            let mut queue: VecDeque<usize> = self.dependents[i].iter().copied().collect();
            while let Some(d) = queue.pop_front() {
                if self.outcomes[d].is_some() {
                    continue;
                }
                warn!("Skipping {}: dependency {} failed", self.plan.entries[d].id, root);
                self.outcomes[d] = Some(NodeOutcome::Skipped(SkipReason::DependencyFailed(root.clone())));
                self.ready.remove(&d);
                queue.extend(self.dependents[d].iter().copied());
            }
            return;
        }

        for &d in &self.dependents[i] {
            self.remaining[d] -= 1;
            if self.remaining[d] == 0 && self.outcomes[d].is_none() {
                self.ready.insert(d);
            }
        }
    }

    /// Ids of the graph dependencies of entry `i`.
    fn dependency_ids(&self, i: usize) -> Vec<String> {
        self.plan.entries[i]
            .node
            .map(|idx| {
                self.graph
                    .dependencies_of(idx)
                    .iter()
                    .map(|&dep| self.graph.node_at(dep).id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn into_result(self, cancelled: bool) -> ExecutionResult {
        let results = self
            .plan
            .entries
            .iter()
            .enumerate()
            .map(|(i, entry)| {
                let outcome = self.outcomes[i]
                    .clone()
                    .unwrap_or(NodeOutcome::Skipped(SkipReason::Cancelled));
                if outcome == NodeOutcome::Skipped(SkipReason::Cancelled) {
                    warn!("Skipping {}: run cancelled", entry.id);
                }
                NodeResult {
                    id: entry.id.clone(),
                    kind: entry.kind,
                    action: entry.action,
                    position: entry.position,
                    provider_id: None,
                    outcome,
                    attempts: self.attempts[i],
                    duration_ms: self.durations[i],
                }
            })
            .collect();

        ExecutionResult {
            mode: self.plan.mode,
            results,
            cancelled,
        }
    }
}

impl NodeOutcome {
    /// Returns true for `Created`, `Updated`, `Destroyed` and `Unchanged`.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(
            self,
            Self::Created | Self::Updated | Self::Destroyed | Self::Unchanged
        )
    }
}

impl ExecutionResult {
    /// Fills in provider ids from the final state.
    pub fn attach_provider_ids(&mut self, state: &ReconcileState) {
        for result in &mut self.results {
            result.provider_id = state.get(&result.id).map(|r| r.provider_id.clone());
        }
    }

    /// Returns the result for a resource id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&NodeResult> {
        self.results.iter().rev().find(|r| r.id == id)
    }

    /// Ids of resources whose outcome changed something.
    #[must_use]
    pub fn changed_ids(&self) -> Vec<String> {
        self.results
            .iter()
            .filter(|r| {
                matches!(
                    r.outcome,
                    NodeOutcome::Created | NodeOutcome::Updated | NodeOutcome::Destroyed
                )
            })
            .map(|r| r.id.clone())
            .collect()
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disabled => write!(f, "disabled"),
            Self::DependencyFailed(id) => write!(f, "dependency {id} failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::fmt::Display for NodeOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Updated => write!(f, "updated"),
            Self::Destroyed => write!(f, "destroyed"),
            Self::Unchanged => write!(f, "unchanged"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
            Self::Skipped(reason) => write!(f, "skipped ({reason})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FlagBindings, ResourceDecl};
    use crate::graph::{GraphBuilder, Inclusion, InclusionResolver, RunContext, Schedule, Scheduler};
    use crate::planner::diff::{DiffEngine, Observations};
    use crate::provider::{BoundedRetry, LocalProvider, ObservedResource};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// In-memory provider that fails chosen ids and records call order.
    #[derive(Debug, Default)]
    struct FakeProvider {
        fail_create: Vec<String>,
        transient_failures: AtomicUsize,
        calls: Mutex<Vec<String>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        delay: Duration,
    }

    impl FakeProvider {
        fn failing(ids: &[&str]) -> Self {
            Self {
                fail_create: ids.iter().map(ToString::to_string).collect(),
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        async fn enter(&self, call: String) {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            self.calls.lock().unwrap().push(call);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Provider for FakeProvider {
        async fn create(&self, kind: ResourceKind, id: &str, attributes: &Attributes) -> ProviderResult<CreateOutcome> {
            self.enter(format!("create {id}")).await;
            if self.fail_create.iter().any(|f| f == id) {
                return Err(ProviderError::rejected(400, format!("{id} rejected")));
            }
            if self
                .transient_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(ProviderError::Unavailable {
                    message: String::from("try later"),
                });
            }
            let provider_id = format!("{}-{id}", kind.id_prefix());
            let mut outputs = attributes.clone();
            outputs.insert(String::from("id"), json!(provider_id));
            Ok(CreateOutcome { provider_id, outputs })
        }

        async fn update(&self, _kind: ResourceKind, provider_id: &str, attributes: &Attributes) -> ProviderResult<Outputs> {
            self.enter(format!("update {provider_id}")).await;
            let mut outputs = attributes.clone();
            outputs.insert(String::from("id"), json!(provider_id));
            Ok(outputs)
        }

        async fn destroy(&self, _kind: ResourceKind, provider_id: &str) -> ProviderResult<()> {
            self.enter(format!("destroy {provider_id}")).await;
            if provider_id.ends_with("gone") {
                return Err(ProviderError::NotFound {
                    provider_id: provider_id.to_string(),
                });
            }
            Ok(())
        }

        async fn read(&self, _kind: ResourceKind, _provider_id: &str) -> ProviderResult<Option<ObservedResource>> {
            Ok(None)
        }
    }

    struct Fixture {
        graph: ResourceGraph,
        inclusion: Inclusion,
        schedule: Schedule,
    }

    fn fixture(decls: &[ResourceDecl], flags: &FlagBindings) -> Fixture {
        let graph = GraphBuilder::new(RunContext::new("s", "p", "dev")).build(decls).unwrap();
        let inclusion = InclusionResolver::new(flags).resolve(&graph).unwrap();
        let schedule = Scheduler::schedule(&graph, &inclusion).unwrap();
        Fixture {
            graph,
            inclusion,
            schedule,
        }
    }

    fn apply_plan(f: &Fixture, state: &ReconcileState) -> ReconcilePlan {
        let diff = DiffEngine::new().compute(&f.graph, &f.inclusion, &f.schedule, state, &Observations::new());
        ReconcilePlan::for_apply(&f.graph, &f.schedule, &diff, state, "hash").unwrap()
    }

    fn platform() -> Vec<ResourceDecl> {
        vec![
            ResourceDecl::new("vpc", ResourceKind::Network).attr("cidr", json!("10.0.0.0/16")),
            ResourceDecl::new("cluster", ResourceKind::Cluster)
                .attr("vpc_id", json!("${vpc.id}"))
                .attr("name", json!("eks-${run.suffix}")),
            ResourceDecl::new("ng_a", ResourceKind::NodeGroup).attr("cluster", json!("${cluster.name}")),
            ResourceDecl::new("ng_b", ResourceKind::NodeGroup).attr("cluster", json!("${cluster.name}")),
            ResourceDecl::new("role", ResourceKind::Role),
        ]
    }

    fn outcome(result: &ExecutionResult, id: &str) -> NodeOutcome {
        result.get(id).unwrap().outcome.clone()
    }

    #[tokio::test]
    async fn test_failed_cluster_skips_node_groups_only() {
        let f = fixture(&platform(), &FlagBindings::default());
        let mut state = ReconcileState::new("p", "dev");
        let provider = Arc::new(FakeProvider::failing(&["cluster"]));

        let plan = apply_plan(&f, &state);
        let result = PlanExecutor::new(provider.clone())
            .execute(&plan, &f.graph, &mut state)
            .await
            .unwrap();

        assert_eq!(outcome(&result, "vpc"), NodeOutcome::Created);
        assert_eq!(outcome(&result, "role"), NodeOutcome::Created);
        assert!(matches!(outcome(&result, "cluster"), NodeOutcome::Failed(_)));
        for ng in ["ng_a", "ng_b"] {
            assert_eq!(
                outcome(&result, ng),
                NodeOutcome::Skipped(SkipReason::DependencyFailed(String::from("cluster")))
            );
        }
        assert!(!provider.calls().iter().any(|c| c.starts_with("create ng_")));
        assert!(state.get("vpc").is_some());
        assert!(state.get("cluster").is_none());
    }

    #[tokio::test]
    async fn test_outputs_flow_to_dependents() {
        let f = fixture(&platform(), &FlagBindings::default());
        let mut state = ReconcileState::new("p", "dev");

        let plan = apply_plan(&f, &state);
        PlanExecutor::new(Arc::new(FakeProvider::default()))
            .execute(&plan, &f.graph, &mut state)
            .await
            .unwrap();

        let cluster = state.get("cluster").unwrap();
        assert_eq!(cluster.attributes["vpc_id"], json!("vpc-vpc"));
        assert_eq!(cluster.depends_on, vec![String::from("vpc")]);
        assert_eq!(state.get("ng_a").unwrap().attributes["cluster"], json!("eks-s"));
    }

    #[tokio::test]
    async fn test_reapply_is_unchanged_without_provider_calls() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(LocalProvider::new(dir.path().join("provider.json")));
        let f = fixture(&platform(), &FlagBindings::default());
        let mut state = ReconcileState::new("p", "dev");
        let executor = PlanExecutor::new(provider.clone());

        let first = executor.execute(&apply_plan(&f, &state), &f.graph, &mut state).await.unwrap();
        assert!(first.results.iter().all(|r| r.outcome == NodeOutcome::Created));

        let second = executor.execute(&apply_plan(&f, &state), &f.graph, &mut state).await.unwrap();
        assert!(second.results.iter().all(|r| r.outcome == NodeOutcome::Unchanged));
        assert_eq!(provider.resource_count().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_parallelism_is_bounded() {
        let decls: Vec<ResourceDecl> = (0..8)
            .map(|i| ResourceDecl::new(format!("role_{i}"), ResourceKind::Role))
            .collect();
        let f = fixture(&decls, &FlagBindings::default());
        let mut state = ReconcileState::new("p", "dev");
        let provider = Arc::new(FakeProvider {
            delay: Duration::from_millis(20),
            ..FakeProvider::default()
        });

        let result = PlanExecutor::new(provider.clone())
            .with_parallelism(3)
            .execute(&apply_plan(&f, &state), &f.graph, &mut state)
            .await
            .unwrap();

        assert!(result.results.iter().all(|r| r.outcome == NodeOutcome::Created));
        let max = provider.max_in_flight.load(Ordering::SeqCst);
        assert!(max <= 3 && max >= 2, "max in flight {max}");
    }

    #[tokio::test]
    async fn test_cancelled_before_start_skips_everything() {
        let f = fixture(&platform(), &FlagBindings::default());
        let mut state = ReconcileState::new("p", "dev");
        let provider = Arc::new(FakeProvider::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = PlanExecutor::new(provider.clone())
            .with_cancellation(cancel)
            .execute(&apply_plan(&f, &state), &f.graph, &mut state)
            .await
            .unwrap();

        assert!(result.cancelled);
        assert!(result
            .results
            .iter()
            .all(|r| r.outcome == NodeOutcome::Skipped(SkipReason::Cancelled)));
        assert!(provider.calls().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_mid_run_lets_in_flight_finish() {
        let decls = vec![
            ResourceDecl::new("vpc", ResourceKind::Network),
            ResourceDecl::new("cluster", ResourceKind::Cluster).depends_on("vpc"),
        ];
        let f = fixture(&decls, &FlagBindings::default());
        let mut state = ReconcileState::new("p", "dev");
        let provider = Arc::new(FakeProvider {
            delay: Duration::from_millis(50),
            ..FakeProvider::default()
        });
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let result = PlanExecutor::new(provider)
            .with_cancellation(cancel)
            .execute(&apply_plan(&f, &state), &f.graph, &mut state)
            .await
            .unwrap();

        assert_eq!(outcome(&result, "vpc"), NodeOutcome::Created);
        assert_eq!(outcome(&result, "cluster"), NodeOutcome::Skipped(SkipReason::Cancelled));
        assert!(state.get("vpc").is_some());
    }

    #[tokio::test]
    async fn test_transient_errors_consult_retry_hook() {
        let decls = vec![ResourceDecl::new("vpc", ResourceKind::Network)];
        let f = fixture(&decls, &FlagBindings::default());

        let provider = Arc::new(FakeProvider::default());
        provider.transient_failures.store(1, Ordering::SeqCst);
        let mut state = ReconcileState::new("p", "dev");
        let no_retry = PlanExecutor::new(provider.clone())
            .execute(&apply_plan(&f, &state), &f.graph, &mut state)
            .await
            .unwrap();
        assert!(matches!(outcome(&no_retry, "vpc"), NodeOutcome::Failed(_)));

        provider.transient_failures.store(1, Ordering::SeqCst);
        let retried = PlanExecutor::new(provider)
            .with_retry_hook(Arc::new(BoundedRetry::new(2, Duration::ZERO)))
            .execute(&apply_plan(&f, &state), &f.graph, &mut state)
            .await
            .unwrap();
        assert_eq!(outcome(&retried, "vpc"), NodeOutcome::Created);
        assert_eq!(retried.get("vpc").unwrap().attempts, 2);
    }

    #[tokio::test]
    async fn test_destroy_of_missing_resource_succeeds() {
        let decls = vec![ResourceDecl::new("vpc", ResourceKind::Network)];
        let f = fixture(&decls, &FlagBindings::default());
        let mut state = ReconcileState::new("p", "dev");
        state.set(ResourceState {
            id: String::from("vpc"),
            kind: ResourceKind::Network,
            provider_id: String::from("vpc-gone"),
            attributes: Attributes::new(),
            attributes_hash: String::new(),
            outputs: Outputs::new(),
            depends_on: Vec::new(),
            position: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        });

        let schedule = Scheduler::schedule(&f.graph, &Inclusion::all(&f.graph)).unwrap();
        let plan = ReconcilePlan::for_destroy(&f.graph, &schedule, &state, "hash").unwrap();
        let result = PlanExecutor::new(Arc::new(FakeProvider::default()))
            .execute(&plan, &f.graph, &mut state)
            .await
            .unwrap();

        assert_eq!(outcome(&result, "vpc"), NodeOutcome::Destroyed);
        assert!(state.is_empty());
    }

    #[tokio::test]
    async fn test_disabled_nodes_reported_skipped() {
        let decls = vec![
            ResourceDecl::new("vpc", ResourceKind::Network),
            ResourceDecl::new("addon", ResourceKind::Addon).enabled_by("addons"),
        ];
        let flags = FlagBindings::from_iter([(String::from("addons"), false)]);
        let f = fixture(&decls, &flags);
        let mut state = ReconcileState::new("p", "dev");

        let result = PlanExecutor::new(Arc::new(FakeProvider::default()))
            .execute(&apply_plan(&f, &state), &f.graph, &mut state)
            .await
            .unwrap();

        assert_eq!(outcome(&result, "addon"), NodeOutcome::Skipped(SkipReason::Disabled));
        assert_eq!(outcome(&result, "vpc"), NodeOutcome::Created);
    }
}
