// ============================================================================
// Linting
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![warn(dead_code)]
#![warn(unused_imports)]
#![warn(unused_variables)]

// Clippy lints (warnings only)
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]
#![warn(clippy::todo)]
#![warn(clippy::unimplemented)]
#![warn(clippy::unwrap_in_result)]
#![warn(clippy::redundant_clone)]
#![warn(clippy::cognitive_complexity)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

// ============================================================================
// Crate Documentation
// ============================================================================

//! # converge
//!
//! A declarative resource reconciler. A YAML document declares typed
//! infrastructure resources; converge builds their dependency graph, prunes
//! resources disabled by flags, orders the rest and converges real
//! infrastructure through a provider, one resource at a time.
//!
//! ## Pipeline
//!
//! 1. **Graph**: nodes from declarations, edges from `depends_on` and from
//!    `${id.output}` references ([`graph`]).
//! 2. **Inclusion**: `enabled` predicates evaluated once against flag
//!    bindings; an enabled resource depending on a disabled one is an error.
//! 3. **Schedule**: Kahn's algorithm, ties broken by declaration order.
//! 4. **Plan**: diff against recorded state and, optionally, the provider
//!    ([`planner`]).
//! 5. **Execute**: a bounded worker pool; a failure skips its dependents
//!    while independent branches keep going.
//! 6. **Report**: per-resource outcomes and aggregate counts ([`reporter`]).
//!
//! ## Modules
//!
//! - [`config`]: document parsing, flags, validation and hashing
//! - [`graph`]: resource graph, inclusion and scheduling
//! - [`planner`]: diff, plan and executor
//! - [`provider`]: provider boundary with local and HTTP implementations
//! - [`state`]: persistent state and locking
//! - [`reconciler`]: plan, apply, destroy and drift orchestration
//! - [`reporter`]: run reports
//! - [`cli`]: command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: platform
//! flags:
//!   create_cluster: true
//! resources:
//!   - id: vpc
//!     kind: network
//!     attributes:
//!       name: "platform-${run.suffix}"
//!   - id: cluster
//!     kind: cluster
//!     enabled: create_cluster
//!     attributes:
//!       vpc_id: "${vpc.id}"
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod error;
pub mod graph;
pub mod planner;
pub mod provider;
pub mod reconciler;
pub mod reporter;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use config::{ConfigHasher, ConfigParser, ConfigValidator, Document, FlagBindings};
pub use error::{ConvergeError, Result};
pub use graph::{GraphBuilder, InclusionResolver, ResourceGraph, Scheduler};
pub use planner::{DiffEngine, PlanExecutor, ReconcilePlan};
pub use provider::{LocalProvider, Provider};
pub use reconciler::{DriftReport, Reconciler};
pub use reporter::Report;
pub use state::{LocalStateStore, ReconcileState, StateStore};
