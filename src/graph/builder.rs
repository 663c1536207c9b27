//! Construction of a frozen [`ResourceGraph`] from declarations.

use tracing::debug;

use super::model::{EdgeOrigin, ResourceGraph, ResourceNode};
use super::reference::{parse_value, RunContext};
use crate::config::ResourceDecl;
use crate::error::{GraphError, GraphErrors};

/// Builds resource graphs, collecting every error rather than stopping at the first.
#[derive(Debug)]
pub struct GraphBuilder {
    ctx: RunContext,
}

impl GraphBuilder {
    /// Creates a builder that substitutes the given run values.
    #[must_use]
    pub const fn new(ctx: RunContext) -> Self {
        Self { ctx }
    }

    /// Returns the run context.
    #[must_use]
    pub const fn context(&self) -> &RunContext {
        &self.ctx
    }

    /// Builds and freezes the graph.
    ///
    /// Explicit edges come from `depends_on`, implicit edges from attribute
    /// references.
    ///
    /// # Errors
    ///
    /// Returns every duplicate id, malformed reference, unknown node and
    /// self-dependency found.
    pub fn build(&self, decls: &[ResourceDecl]) -> Result<ResourceGraph, GraphErrors> {
        let mut graph = ResourceGraph::new();
        let mut errors = Vec::new();

        for decl in decls {
            match self.node_from_decl(decl) {
                Ok(node) => {
                    if let Err(e) = graph.add_node(node) {
                        errors.push(e);
                    }
                }
                Err(mut node_errors) => errors.append(&mut node_errors),
            }
        }

        // Edges are wired from the graph's own nodes so duplicates only count once.
        let wiring: Vec<(String, Vec<(String, EdgeOrigin)>)> = graph
            .nodes()
            .iter()
            .map(|node| {
                let mut targets: Vec<(String, EdgeOrigin)> = node
                    .depends_on
                    .iter()
                    .map(|dep| (dep.clone(), EdgeOrigin::Explicit))
                    .collect();
                targets.extend(
                    node.referenced_nodes()
                        .into_iter()
                        .map(|dep| (dep.to_string(), EdgeOrigin::Implicit)),
                );
                (node.id.clone(), targets)
            })
            .collect();

        for (from, targets) in wiring {
            for (to, origin) in targets {
                if let Err(e) = graph.add_edge(&from, &to, origin) {
                    if !errors.contains(&e) {
                        errors.push(e);
                    }
                }
            }
        }

        if let Some(errors) = GraphErrors::from_vec(errors) {
            return Err(errors);
        }

        graph.freeze();
        debug!(
            "Built resource graph with {} nodes and {} edges",
            graph.len(),
            graph.edges().len()
        );
        Ok(graph)
    }

    fn node_from_decl(&self, decl: &ResourceDecl) -> Result<ResourceNode, Vec<GraphError>> {
        let mut node = ResourceNode::new(decl.id.clone(), decl.kind).with_enabled(decl.enabled.clone());
        let mut errors = Vec::new();

        for dep in &decl.depends_on {
            node.depends_on.insert(dep.clone());
        }

        for (name, raw) in &decl.attributes {
            match parse_value(raw, &self.ctx) {
                Ok(value) => {
                    node.attributes.insert(name.clone(), value);
                }
                Err(reference) => errors.push(GraphError::InvalidReference {
                    id: decl.id.clone(),
                    attribute: name.clone(),
                    reference,
                }),
            }
        }

        if errors.is_empty() {
            Ok(node)
        } else {
            Err(errors)
        }
    }
}
