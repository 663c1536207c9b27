//! Conditional inclusion.
//!
//! Evaluates each node's `enabled` predicate once per run and rejects graphs
//! where an included node depends on an excluded one.

use tracing::debug;

use super::model::ResourceGraph;
use crate::config::FlagBindings;
use crate::error::{GraphError, GraphErrors};

/// Result of evaluating inclusion predicates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inclusion {
    included: Vec<usize>,
    excluded: Vec<usize>,
    mask: Vec<bool>,
}

impl Inclusion {
    /// Includes every node, ignoring predicates.
    #[must_use]
    pub fn all(graph: &ResourceGraph) -> Self {
        Self {
            included: (0..graph.len()).collect(),
            excluded: Vec::new(),
            mask: vec![true; graph.len()],
        }
    }

    /// Indices of included nodes, ascending.
    #[must_use]
    pub fn included(&self) -> &[usize] {
        &self.included
    }

    /// Indices of excluded nodes, ascending.
    #[must_use]
    pub fn excluded(&self) -> &[usize] {
        &self.excluded
    }

    /// Returns true if the node at `idx` is included.
    #[must_use]
    pub fn is_included(&self, idx: usize) -> bool {
        self.mask.get(idx).copied().unwrap_or(false)
    }
}

/// Evaluates `enabled` predicates against flag bindings.
#[derive(Debug)]
pub struct InclusionResolver<'a> {
    flags: &'a FlagBindings,
}

impl<'a> InclusionResolver<'a> {
    /// Creates a resolver.
    #[must_use]
    pub const fn new(flags: &'a FlagBindings) -> Self {
        Self { flags }
    }

    /// Splits the graph into included and excluded nodes.
    ///
    /// # Errors
    ///
    /// Returns every `UnknownFlag` and `DanglingDependency` found.
    pub fn resolve(&self, graph: &ResourceGraph) -> Result<Inclusion, GraphErrors> {
        let mut errors = Vec::new();
        let mut mask = vec![false; graph.len()];
        let mut known = vec![true; graph.len()];

        for (idx, node) in graph.nodes().iter().enumerate() {
            match node.enabled.evaluate(self.flags) {
                Ok(enabled) => mask[idx] = enabled,
                Err(flag) => {
                    known[idx] = false;
                    errors.push(GraphError::UnknownFlag {
                        id: node.id.clone(),
                        flag,
                    });
                }
            }
        }

        // Nodes behind an unknown flag have no inclusion to check against.
        for (idx, node) in graph.nodes().iter().enumerate() {
            if !known[idx] || !mask[idx] {
                continue;
            }
            for &dep in graph.dependencies_of(idx) {
                if known[dep] && !mask[dep] {
                    errors.push(GraphError::DanglingDependency {
                        dependent: node.id.clone(),
                        dependency: graph.node_at(dep).id.clone(),
                    });
                }
            }
        }

        if let Some(errors) = GraphErrors::from_vec(errors) {
            return Err(errors);
        }

        let (included, excluded): (Vec<usize>, Vec<usize>) =
            (0..graph.len()).partition(|&idx| mask[idx]);
        for &idx in &excluded {
            debug!("Resource {} excluded by its enabled predicate", graph.node_at(idx).id);
        }

        Ok(Inclusion {
            included,
            excluded,
            mask,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceDecl;
    use crate::graph::{GraphBuilder, ResourceKind, RunContext};
    use serde_json::json;

    fn graph(decls: &[ResourceDecl]) -> ResourceGraph {
        GraphBuilder::new(RunContext::new("s", "p", "dev")).build(decls).unwrap()
    }

    fn flags(create_cluster: bool) -> FlagBindings {
        FlagBindings::from_iter([(String::from("create_cluster"), create_cluster)])
    }

    #[test]
    fn test_excluded_leaf_is_pruned() {
        let g = graph(&[
            ResourceDecl::new("vpc", ResourceKind::Network),
            ResourceDecl::new("cluster", ResourceKind::Cluster)
                .enabled_by("create_cluster")
                .depends_on("vpc"),
        ]);

        let inclusion = InclusionResolver::new(&flags(false)).resolve(&g).unwrap();
        assert_eq!(inclusion.included(), &[0]);
        assert_eq!(inclusion.excluded(), &[1]);
        assert!(!inclusion.is_included(1));
    }

    #[test]
    fn test_dangling_dependencies_reported_together() {
        let g = graph(&[
            ResourceDecl::new("cluster", ResourceKind::Cluster).enabled_by("create_cluster"),
            ResourceDecl::new("ng_a", ResourceKind::NodeGroup)
                .attr("cluster_name", json!("${cluster.name}")),
            ResourceDecl::new("ng_b", ResourceKind::NodeGroup).depends_on("cluster"),
        ]);

        let errors = InclusionResolver::new(&flags(false)).resolve(&g).unwrap_err();
        assert_eq!(
            errors.errors(),
            &[
                GraphError::DanglingDependency {
                    dependent: String::from("ng_a"),
                    dependency: String::from("cluster"),
                },
                GraphError::DanglingDependency {
                    dependent: String::from("ng_b"),
                    dependency: String::from("cluster"),
                },
            ]
        );
    }

    #[test]
    fn test_negated_flag() {
        let g = graph(&[ResourceDecl::new("legacy", ResourceKind::Addon).enabled_by("!create_cluster")]);

        let inclusion = InclusionResolver::new(&flags(true)).resolve(&g).unwrap();
        assert!(inclusion.included().is_empty());
    }

    #[test]
    fn test_unknown_flag_reported_with_dangling_dependencies() {
        let g = graph(&[
            ResourceDecl::new("cluster", ResourceKind::Cluster).enabled_by("create_cluster"),
            ResourceDecl::new("ng", ResourceKind::NodeGroup).depends_on("cluster"),
            ResourceDecl::new("addon", ResourceKind::Addon)
                .enabled_by("addons")
                .depends_on("cluster"),
        ]);

        let errors = InclusionResolver::new(&flags(false)).resolve(&g).unwrap_err();
        assert_eq!(
            errors.errors(),
            &[
                GraphError::UnknownFlag {
                    id: String::from("addon"),
                    flag: String::from("addons"),
                },
                GraphError::DanglingDependency {
                    dependent: String::from("ng"),
                    dependency: String::from("cluster"),
                },
            ]
        );
    }

    #[test]
    fn test_unknown_flag() {
        let g = graph(&[ResourceDecl::new("cluster", ResourceKind::Cluster).enabled_by("nope")]);

        let errors = InclusionResolver::new(&flags(true)).resolve(&g).unwrap_err();
        assert_eq!(
            errors.errors(),
            &[GraphError::UnknownFlag {
                id: String::from("cluster"),
                flag: String::from("nope"),
            }]
        );
    }
}
