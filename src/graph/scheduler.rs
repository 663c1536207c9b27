//! Topological scheduling with Kahn's algorithm.
//!
//! Ready nodes are taken lowest priority first (declaration position for
//! resource graphs), so the same graph always yields the same order.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use tracing::debug;

use super::inclusion::Inclusion;
use super::model::ResourceGraph;
use crate::error::{GraphError, GraphErrors};

/// Orders `0..deps.len()` so every node comes after its dependencies.
///
/// `deps[i]` lists the nodes `i` depends on; `priority[i]` breaks ties among
/// ready nodes, lowest first.
///
/// # Errors
///
/// Returns the nodes left unscheduled, sorted by priority, if the dependencies
/// contain a cycle.
pub fn topological_order<P: Ord + Copy>(
    deps: &[Vec<usize>],
    priority: &[P],
) -> Result<Vec<usize>, Vec<usize>> {
    let n = deps.len();
    let mut in_degree = vec![0usize; n];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];

    for (node, node_deps) in deps.iter().enumerate() {
        for &dep in node_deps {
            in_degree[node] += 1;
            dependents[dep].push(node);
        }
    }

    let mut ready: BinaryHeap<Reverse<(P, usize)>> = in_degree
        .iter()
        .enumerate()
        .filter(|&(_, &d)| d == 0)
        .map(|(node, _)| Reverse((priority[node], node)))
        .collect();

    let mut order = Vec::with_capacity(n);
    while let Some(Reverse((_, node))) = ready.pop() {
        order.push(node);
        for &dependent in &dependents[node] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.push(Reverse((priority[dependent], dependent)));
            }
        }
    }

    if order.len() == n {
        return Ok(order);
    }

    let mut remaining: Vec<usize> = (0..n).filter(|&node| in_degree[node] > 0).collect();
    remaining.sort_by_key(|&node| (priority[node], node));
    Err(remaining)
}

/// A deterministic apply order over the included nodes of a graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    order: Vec<usize>,
}

impl Schedule {
    /// Graph indices in apply order.
    #[must_use]
    pub fn apply_order(&self) -> &[usize] {
        &self.order
    }

    /// Graph indices in destroy order, the exact reverse of apply order.
    #[must_use]
    pub fn destroy_order(&self) -> Vec<usize> {
        self.order.iter().rev().copied().collect()
    }

    /// Number of scheduled nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Returns true if nothing is scheduled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Schedules the included subgraph of a resource graph.
#[derive(Debug, Default)]
pub struct Scheduler;

impl Scheduler {
    /// Checks the whole graph for cycles, whatever inclusion says.
    ///
    /// # Errors
    ///
    /// Returns `CycleDetected` listing every node on or behind a cycle.
    pub fn check_acyclic(graph: &ResourceGraph) -> Result<(), GraphErrors> {
        Self::schedule(graph, &Inclusion::all(graph)).map(|_| ())
    }

    /// Computes the apply order.
    ///
    /// # Errors
    ///
    /// Returns `CycleDetected` listing every unscheduled node in declaration order.
    pub fn schedule(graph: &ResourceGraph, inclusion: &Inclusion) -> Result<Schedule, GraphErrors> {
        let included = inclusion.included();
        let mut local = vec![usize::MAX; graph.len()];
        for (i, &idx) in included.iter().enumerate() {
            local[idx] = i;
        }

        let deps: Vec<Vec<usize>> = included
            .iter()
            .map(|&idx| {
                graph
                    .dependencies_of(idx)
                    .iter()
                    .filter(|&&dep| inclusion.is_included(dep))
                    .map(|&dep| local[dep])
                    .collect()
            })
            .collect();
        let priority: Vec<usize> = included
            .iter()
            .map(|&idx| graph.node_at(idx).position)
            .collect();

        match topological_order(&deps, &priority) {
            Ok(order) => {
                let order: Vec<usize> = order.into_iter().map(|i| included[i]).collect();
                debug!("Scheduled {} resources", order.len());
                Ok(Schedule { order })
            }
            Err(remaining) => Err(GraphErrors::single(GraphError::CycleDetected {
                nodes: remaining
                    .into_iter()
                    .map(|i| graph.node_at(included[i]).id.clone())
                    .collect(),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FlagBindings, ResourceDecl};
    use crate::graph::{GraphBuilder, InclusionResolver, ResourceKind, RunContext};

    fn build(decls: &[ResourceDecl]) -> ResourceGraph {
        GraphBuilder::new(RunContext::new("s", "p", "dev")).build(decls).unwrap()
    }

    fn ids(graph: &ResourceGraph, order: &[usize]) -> Vec<String> {
        order.iter().map(|&i| graph.node_at(i).id.clone()).collect()
    }

    fn platform() -> Vec<ResourceDecl> {
        vec![
            ResourceDecl::new("ng_a", ResourceKind::NodeGroup).depends_on("cluster"),
            ResourceDecl::new("cluster", ResourceKind::Cluster)
                .depends_on("vpc")
                .depends_on("cluster_role"),
            ResourceDecl::new("vpc", ResourceKind::Network),
            ResourceDecl::new("cluster_role", ResourceKind::Role),
            ResourceDecl::new("ng_b", ResourceKind::NodeGroup).depends_on("cluster"),
            ResourceDecl::new("policy", ResourceKind::Policy),
        ]
    }

    #[test]
    fn test_apply_order_is_topological_and_deterministic() {
        let graph = build(&platform());
        let inclusion = Inclusion::all(&graph);

        let first = Scheduler::schedule(&graph, &inclusion).unwrap();
        let second = Scheduler::schedule(&graph, &inclusion).unwrap();
        assert_eq!(first, second);

        let position: Vec<usize> = {
            let mut p = vec![0; graph.len()];
            for (i, &idx) in first.apply_order().iter().enumerate() {
                p[idx] = i;
            }
            p
        };
        for edge in graph.edges() {
            let from = graph.index_of(&edge.from).unwrap();
            let to = graph.index_of(&edge.to).unwrap();
            assert!(position[to] < position[from], "{} before {}", edge.to, edge.from);
        }

        assert_eq!(
            ids(&graph, first.apply_order()),
            vec!["vpc", "cluster_role", "cluster", "ng_a", "ng_b", "policy"]
        );
    }

    #[test]
    fn test_destroy_order_is_reverse() {
        let graph = build(&platform());
        let schedule = Scheduler::schedule(&graph, &Inclusion::all(&graph)).unwrap();

        let mut reversed = schedule.apply_order().to_vec();
        reversed.reverse();
        assert_eq!(schedule.destroy_order(), reversed);
    }

    #[test]
    fn test_cycle_detected() {
        let graph = build(&[
            ResourceDecl::new("vpc", ResourceKind::Network),
            ResourceDecl::new("a", ResourceKind::Role).depends_on("b"),
            ResourceDecl::new("b", ResourceKind::Policy).depends_on("c"),
            ResourceDecl::new("c", ResourceKind::RolePolicyAttachment).depends_on("a"),
        ]);

        let errors = Scheduler::schedule(&graph, &Inclusion::all(&graph)).unwrap_err();
        assert_eq!(
            errors.errors(),
            &[GraphError::CycleDetected {
                nodes: vec![String::from("a"), String::from("b"), String::from("c")],
            }]
        );
    }

    #[test]
    fn test_cycle_among_excluded_nodes() {
        let graph = build(&[
            ResourceDecl::new("vpc", ResourceKind::Network),
            ResourceDecl::new("a", ResourceKind::Role)
                .enabled_by("legacy")
                .depends_on("b"),
            ResourceDecl::new("b", ResourceKind::Policy)
                .enabled_by("legacy")
                .depends_on("a"),
        ]);
        let flags = FlagBindings::from_iter([(String::from("legacy"), false)]);
        let inclusion = InclusionResolver::new(&flags).resolve(&graph).unwrap();

        assert!(Scheduler::schedule(&graph, &inclusion).is_ok());
        let errors = Scheduler::check_acyclic(&graph).unwrap_err();
        assert_eq!(
            errors.errors(),
            &[GraphError::CycleDetected {
                nodes: vec![String::from("a"), String::from("b")],
            }]
        );
    }

    #[test]
    fn test_excluded_nodes_not_scheduled() {
        let graph = build(&[
            ResourceDecl::new("vpc", ResourceKind::Network),
            ResourceDecl::new("addon", ResourceKind::Addon).enabled_by("enable_addons"),
        ]);
        let flags = FlagBindings::from_iter([(String::from("enable_addons"), false)]);
        let inclusion = InclusionResolver::new(&flags).resolve(&graph).unwrap();

        let schedule = Scheduler::schedule(&graph, &inclusion).unwrap();
        assert_eq!(ids(&graph, schedule.apply_order()), vec!["vpc"]);
    }

    #[test]
    fn test_topological_order_priority() {
        let deps = vec![vec![], vec![], vec![0, 1]];
        assert_eq!(topological_order(&deps, &[5, 1, 0]), Ok(vec![1, 0, 2]));
        assert_eq!(topological_order(&[vec![1], vec![0]], &[0, 1]), Err(vec![0, 1]));
    }
}
