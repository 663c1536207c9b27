//! Planning and execution.
//!
//! The diff engine compares the pruned graph with recorded state, the plan
//! turns the diff into dependency-ordered actions, and the executor runs
//! those actions against a provider.

mod diff;
mod executor;
mod plan;

pub use diff::{DiffEngine, DiffResult, DiffType, Observations, ResourceDiff};
pub use executor::{
    DEFAULT_PARALLELISM, ExecutionResult, NodeOutcome, NodeResult, PlanExecutor, SkipReason,
};
pub use plan::{PlanAction, PlanEntry, PlanMode, ReconcilePlan};
