//! Reconciler driving plan, apply, destroy and drift checks.
//!
//! Every fatal configuration problem (graph errors, unknown flags, dangling
//! dependencies, cycles) surfaces from [`Reconciler::prepare`], before the
//! provider is called for anything.

use chrono::Utc;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigHasher, ConfigParser, Document, FlagBindings, ProviderKind};
use crate::error::{ConfigError, ConvergeError, Result};
use crate::graph::{
    GraphBuilder, Inclusion, InclusionResolver, ResourceGraph, ResourceKind, RunContext, Schedule,
    Scheduler,
};
use crate::planner::{
    DiffEngine, DiffType, Observations, PlanExecutor, PlanMode, ReconcilePlan,
};
use crate::provider::{
    BoundedRetry, HttpProvider, LocalProvider, NoRetry, Provider, RetryHook,
    DEFAULT_PROVIDER_FILE,
};
use crate::reporter::Report;
use crate::state::{
    generate_holder_id, HistoryEntry, LocalStateStore, Operation, ReconcileState, StateStore,
};

/// Reconciler for one document against one state store and provider.
pub struct Reconciler<'a, S: StateStore + ?Sized> {
    document: &'a Document,
    flags: FlagBindings,
    store: &'a S,
    provider: Arc<dyn Provider>,
    retry: Arc<dyn RetryHook>,
    parallelism: usize,
    refresh: bool,
    cancel: CancellationToken,
}

/// Graph, pruning and schedule for one run, with the state they were built from.
#[derive(Debug)]
pub struct Prepared {
    /// Frozen resource graph.
    pub graph: ResourceGraph,
    /// Included and excluded nodes.
    pub inclusion: Inclusion,
    /// Apply order of the included nodes.
    pub schedule: Schedule,
    /// State loaded (or initialised) for the run.
    pub state: ReconcileState,
    /// Hash of the document.
    pub config_hash: String,
}

/// Result of an apply or destroy.
#[derive(Debug)]
pub struct RunOutcome {
    /// The plan that was executed.
    pub plan: ReconcilePlan,
    /// Per-resource report.
    pub report: Report,
}

/// One resource whose recorded or observed state differs from the document.
#[derive(Debug, Clone, Serialize)]
pub struct DriftItem {
    /// Resource id.
    pub id: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Pending change (`create`, `update`, `drift`, ...).
    pub change: String,
    /// Why.
    pub reason: String,
}

/// Report of drift detection.
#[derive(Debug, Clone, Serialize)]
pub struct DriftReport {
    /// Resources that would change on the next apply.
    pub drifted: Vec<DriftItem>,
    /// Number of resources declared in the document.
    pub total_resources: usize,
    /// Number of recorded resources the provider still knows.
    pub observed_count: usize,
}

impl<'a, S: StateStore + ?Sized> Reconciler<'a, S> {
    /// Creates a reconciler with flags taken from the document defaults.
    #[must_use]
    pub fn new(document: &'a Document, store: &'a S, provider: Arc<dyn Provider>) -> Self {
        Self {
            document,
            flags: FlagBindings::from_defaults(&document.flags),
            store,
            provider,
            retry: Arc::new(NoRetry),
            parallelism: document.settings.parallelism.max(1),
            refresh: true,
            cancel: CancellationToken::new(),
        }
    }

    /// Sets the resolved flag bindings.
    #[must_use]
    pub fn with_flags(mut self, flags: FlagBindings) -> Self {
        self.flags = flags;
        self
    }

    /// Overrides the document's parallelism.
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

    /// Enables or disables reading resources from the provider before planning.
    #[must_use]
    pub const fn with_refresh(mut self, refresh: bool) -> Self {
        self.refresh = refresh;
        self
    }

    /// Uses `cancel` to stop the executor from starting new operations.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Loads state and builds, prunes and schedules the graph.
    ///
    /// Destroy ignores flags: every declared resource is considered.
    ///
    /// # Errors
    ///
    /// Returns `Graph` errors for invalid documents and `State` errors if
    /// state cannot be loaded.
    pub async fn prepare(&self, mode: PlanMode) -> Result<Prepared> {
        prepare(self.document, &self.flags, self.store, mode).await
    }

    /// Reads every recorded resource from the provider.
    async fn observe(&self, state: &ReconcileState) -> Result<Observations> {
        let mut observations = Observations::new();
        for (id, recorded) in &state.resources {
            let observed = self.provider.read(recorded.kind, &recorded.provider_id).await?;
            if observed.is_none() {
                debug!("{} ({}) not found at provider", id, recorded.provider_id);
            }
            observations.insert(id.clone(), observed);
        }
        Ok(observations)
    }

    /// Computes the apply plan without changing anything.
    ///
    /// # Errors
    ///
    /// Returns configuration errors, provider errors from the refresh, or
    /// `Plan` errors if recorded dependencies form a cycle.
    pub async fn plan(&self) -> Result<(Prepared, ReconcilePlan)> {
        let prepared = self.prepare(PlanMode::Apply).await?;
        let plan = self.plan_apply(&prepared).await?;
        Ok((prepared, plan))
    }

    async fn plan_apply(&self, prepared: &Prepared) -> Result<ReconcilePlan> {
        let observations = if self.refresh {
            self.observe(&prepared.state).await?
        } else {
            Observations::new()
        };

        let diff = DiffEngine::new().compute(
            &prepared.graph,
            &prepared.inclusion,
            &prepared.schedule,
            &prepared.state,
            &observations,
        );
        let plan = ReconcilePlan::for_apply(
            &prepared.graph,
            &prepared.schedule,
            &diff,
            &prepared.state,
            &prepared.config_hash,
        )?;
        info!("{}", plan.summary());
        Ok(plan)
    }

    /// Converges infrastructure towards the document.
    ///
    /// Per-resource failures are reported in the returned [`Report`]; they
    /// never abort the run.
    ///
    /// # Errors
    ///
    /// Returns configuration errors before any provider call, and lock,
    /// state or refresh errors.
    pub async fn apply(&self) -> Result<RunOutcome> {
        info!(
            "Applying {}/{}",
            self.document.project.name, self.document.project.environment
        );
        let mut prepared = self.prepare(PlanMode::Apply).await?;
        self.locked(Operation::Apply, async {
            let plan = self.plan_apply(&prepared).await?;
            self.execute(plan, &mut prepared, Operation::Apply).await
        })
        .await
    }

    /// Destroys every recorded resource, dependents first.
    ///
    /// # Errors
    ///
    /// Returns configuration errors before any provider call, and lock or
    /// state errors.
    pub async fn destroy(&self) -> Result<RunOutcome> {
        info!(
            "Destroying {}/{}",
            self.document.project.name, self.document.project.environment
        );
        let mut prepared = self.prepare(PlanMode::Destroy).await?;
        self.locked(Operation::Destroy, async {
            let plan = ReconcilePlan::for_destroy(
                &prepared.graph,
                &prepared.schedule,
                &prepared.state,
                &prepared.config_hash,
            )?;
            info!("{}", plan.summary());
            self.execute(plan, &mut prepared, Operation::Destroy).await
        })
        .await
    }

    /// Runs `work` while holding the state lock, releasing it afterwards.
    async fn locked<T>(
        &self,
        operation: Operation,
        work: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        let lock = self
            .store
            .acquire_lock(&generate_holder_id(), &operation.to_string())
            .await?;

        let result = work.await;

        if let Err(e) = self.store.release_lock(&lock.lock_id).await {
            error!("Failed to release state lock {}: {}", lock.lock_id, e);
        }
        result
    }

    async fn execute(
        &self,
        plan: ReconcilePlan,
        prepared: &mut Prepared,
        operation: Operation,
    ) -> Result<RunOutcome> {
        let executor = PlanExecutor::new(Arc::clone(&self.provider))
            .with_parallelism(self.parallelism)
            .with_retry_hook(Arc::clone(&self.retry))
            .with_cancellation(self.cancel.clone());

        let state = &mut prepared.state;
        let mut result = executor.execute(&plan, &prepared.graph, state).await?;
        result.attach_provider_ids(state);
        let report = Report::from_execution(&result);

        let failure = if report.cancelled {
            Some(String::from("cancelled"))
        } else if report.summary.failed > 0 {
            Some(format!("{} resources failed", report.summary.failed))
        } else {
            None
        };
        state.config_hash.clone_from(&prepared.config_hash);
        state.serial += 1;
        state.last_updated = Utc::now();
        state.add_history(HistoryEntry::new(
            operation,
            &prepared.config_hash,
            result.changed_ids(),
            failure,
        ));

        self.store.save(state).await?;
        info!("{}", report.summary);

        Ok(RunOutcome { plan, report })
    }

    /// Reports every resource the next apply would change.
    ///
    /// # Errors
    ///
    /// Returns configuration errors, or provider errors from the refresh.
    pub async fn check_drift(&self) -> Result<DriftReport> {
        info!(
            "Checking for drift in {}/{}",
            self.document.project.name, self.document.project.environment
        );

        let prepared = self.prepare(PlanMode::Apply).await?;
        let observations = self.observe(&prepared.state).await?;
        let diff = DiffEngine::new().compute(
            &prepared.graph,
            &prepared.inclusion,
            &prepared.schedule,
            &prepared.state,
            &observations,
        );

        let drifted = diff
            .iter()
            .filter(|d| !matches!(d.diff_type, DiffType::NoChange | DiffType::Excluded))
            .map(|d| DriftItem {
                id: d.id.clone(),
                kind: d.kind,
                change: d.diff_type.to_string(),
                reason: d.reason.clone(),
            })
            .collect();

        Ok(DriftReport {
            drifted,
            total_resources: prepared.graph.len(),
            observed_count: observations.values().filter(|o| o.is_some()).count(),
        })
    }
}

impl DriftReport {
    /// Returns true if nothing would change.
    #[must_use]
    pub fn is_converged(&self) -> bool {
        self.drifted.is_empty()
    }
}

impl std::fmt::Display for DriftReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_converged() {
            return write!(f, "No drift detected - state is converged");
        }
        writeln!(f, "Drift detected:")?;
        for item in &self.drifted {
            writeln!(f, "  - {} ({}): {}", item.id, item.change, item.reason)?;
        }
        Ok(())
    }
}

/// Loads state and builds, prunes and schedules the graph of `document`
/// without touching any provider.
///
/// # Errors
///
/// Returns `Graph` errors for invalid documents and `State` errors if state
/// cannot be loaded.
pub async fn prepare<S: StateStore + ?Sized>(
    document: &Document,
    flags: &FlagBindings,
    store: &S,
    mode: PlanMode,
) -> Result<Prepared> {
    let project = &document.project;
    let state = match store.load().await? {
        Some(state) => {
            if state.project != project.name || state.environment != project.environment {
                warn!(
                    "State at {} belongs to {}/{}, document declares {}/{}",
                    store.location(),
                    state.project,
                    state.environment,
                    project.name,
                    project.environment
                );
            }
            state
        }
        None => {
            debug!("No state found, starting fresh");
            ReconcileState::new(&project.name, &project.environment)
        }
    };

    let ctx = RunContext::new(&state.naming_suffix, &project.name, &project.environment);
    let graph = GraphBuilder::new(ctx).build(&document.resources)?;

    // Cycles are checked on the full graph so a document apply accepts can
    // always be destroyed.
    let acyclic = Scheduler::check_acyclic(&graph);
    let inclusion = match mode {
        PlanMode::Apply => InclusionResolver::new(flags).resolve(&graph),
        PlanMode::Destroy => Ok(Inclusion::all(&graph)),
    };
    let inclusion = match (inclusion, acyclic) {
        (Ok(inclusion), Ok(())) => inclusion,
        (Ok(_), Err(errors)) | (Err(errors), Ok(())) => return Err(errors.into()),
        (Err(mut errors), Err(cycles)) => {
            errors.append(cycles);
            return Err(errors.into());
        }
    };
    let schedule = Scheduler::schedule(&graph, &inclusion)?;

    info!(
        "Resource graph: {} nodes, {} edges, {} included",
        graph.len(),
        graph.edges().len(),
        schedule.len()
    );

    Ok(Prepared {
        graph,
        inclusion,
        schedule,
        state,
        config_hash: ConfigHasher::new().hash_document(document),
    })
}

/// Builds the provider a document selects. Relative paths resolve against
/// `base_dir`, the document's directory.
///
/// # Errors
///
/// Returns a configuration error if the HTTP provider has no endpoint or no
/// token, or a provider error if its client cannot be built.
pub fn build_provider(document: &Document, base_dir: &Path) -> Result<Arc<dyn Provider>> {
    match document.provider.kind {
        ProviderKind::Local => {
            let path = document
                .provider
                .path
                .as_ref()
                .map_or_else(|| base_dir.join(DEFAULT_PROVIDER_FILE), |p| base_dir.join(p));
            debug!("Using local provider at {}", path.display());
            Ok(Arc::new(LocalProvider::new(path)))
        }
        ProviderKind::Http => {
            let endpoint = document.provider.endpoint.as_deref().ok_or_else(|| {
                ConvergeError::Config(ConfigError::ValidationFailed {
                    errors: vec![String::from(
                        "provider.endpoint: required for the http provider",
                    )],
                })
            })?;
            let token = ConfigParser::provider_token()?;
            let provider = HttpProvider::new(endpoint, &token, document.provider.timeout_secs)?;
            debug!("Using http provider at {}", endpoint);
            Ok(Arc::new(provider))
        }
    }
}

/// Builds the state store for a document.
#[must_use]
pub fn build_state_store(document: &Document, base_dir: &Path) -> LocalStateStore {
    LocalStateStore::with_base_dir(base_dir.join(&document.state.path))
}

/// Builds the executor-level retry hook for `--retries`.
#[must_use]
pub fn retry_hook(retries: u32) -> Arc<dyn RetryHook> {
    if retries == 0 {
        Arc::new(NoRetry)
    } else {
        Arc::new(BoundedRetry::new(retries, Duration::from_secs(2)))
    }
}
