//! Resource graph: model, construction, conditional inclusion and scheduling.
//!
//! A run goes through these stages in order, and all of them finish before
//! the first provider call:
//! - build the graph from declarations (explicit and implicit edges)
//! - evaluate `enabled` predicates and reject dangling dependencies
//! - compute a deterministic apply order

mod builder;
mod inclusion;
mod model;
mod reference;
mod scheduler;

pub use builder::GraphBuilder;
pub use inclusion::{Inclusion, InclusionResolver};
pub use model::{
    AttrValue, Attributes, Edge, EdgeOrigin, EnabledExpr, OutputRef, ResourceGraph, ResourceKind,
    ResourceNode, Segment,
};
pub use reference::{parse_value, RunContext, RESERVED_IDS};
pub use scheduler::{topological_order, Schedule, Scheduler};
