//! Resource graph model.
//!
//! Typed resource nodes, their attributes and the dependency edges between
//! them. A graph is built once per run and frozen before anything reads it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use crate::config::FlagBindings;
use crate::error::GraphError;

/// Resolved attribute values passed to a provider.
pub type Attributes = BTreeMap<String, Value>;

/// Kinds of infrastructure resources the reconciler understands.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Virtual network (VPC).
    Network,
    /// Subnet inside a network.
    Subnet,
    /// Security group / firewall rule set.
    SecurityGroup,
    /// IAM role.
    Role,
    /// IAM policy.
    Policy,
    /// Attachment of a policy to a role.
    RolePolicyAttachment,
    /// Managed Kubernetes control plane.
    Cluster,
    /// Worker node group attached to a cluster.
    NodeGroup,
    /// Cluster addon.
    Addon,
}

/// Whether a node takes part in the run.
///
/// Either a boolean literal, a flag name, or a negated flag name (`!name`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnabledExpr {
    /// Fixed value.
    Literal(bool),
    /// Flag reference, optionally prefixed with `!`.
    Flag(String),
}

/// Placeholder for another node's output, written `${node.output}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutputRef {
    /// Referenced node id.
    pub node: String,
    /// Output key on that node.
    pub output: String,
}

/// Piece of a template string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Literal text.
    Text(String),
    /// Output placeholder.
    Reference(OutputRef),
}

/// A declared attribute value, possibly waiting on other nodes' outputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValue {
    /// Fully known value.
    Literal(Value),
    /// Exactly one output reference; keeps the output's JSON type.
    Reference(OutputRef),
    /// String mixing text and references.
    Template(Vec<Segment>),
    /// List containing at least one unresolved element.
    List(Vec<AttrValue>),
    /// Map containing at least one unresolved value.
    Map(BTreeMap<String, AttrValue>),
}

/// A single declared resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceNode {
    /// Unique, stable id.
    pub id: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Declared attributes.
    pub attributes: BTreeMap<String, AttrValue>,
    /// Inclusion predicate.
    pub enabled: EnabledExpr,
    /// Explicitly declared dependencies.
    pub depends_on: BTreeSet<String>,
    /// Declaration position, assigned when the node is added to a graph.
    pub position: usize,
}

/// Where an edge came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeOrigin {
    /// Declared in `depends_on`.
    Explicit,
    /// Derived from an attribute reference.
    Implicit,
}

/// `from` depends on `to`: `to` must be applied first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Edge {
    /// Dependent node id.
    pub from: String,
    /// Dependency node id.
    pub to: String,
    /// Edge origin.
    pub origin: EdgeOrigin,
}

/// Resource graph with O(1) id lookup and adjacency lists.
#[derive(Debug, Default)]
pub struct ResourceGraph {
    nodes: Vec<ResourceNode>,
    index: HashMap<String, usize>,
    edges: Vec<Edge>,
    edge_index: HashMap<(usize, usize), usize>,
    dependencies: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
    frozen: bool,
}

impl ResourceKind {
    /// Returns the snake-case name used in documents.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Subnet => "subnet",
            Self::SecurityGroup => "security_group",
            Self::Role => "role",
            Self::Policy => "policy",
            Self::RolePolicyAttachment => "role_policy_attachment",
            Self::Cluster => "cluster",
            Self::NodeGroup => "node_group",
            Self::Addon => "addon",
        }
    }

    /// Short prefix used for provider-assigned ids.
    #[must_use]
    pub const fn id_prefix(self) -> &'static str {
        match self {
            Self::Network => "vpc",
            Self::Subnet => "subnet",
            Self::SecurityGroup => "sg",
            Self::Role => "role",
            Self::Policy => "policy",
            Self::RolePolicyAttachment => "rpa",
            Self::Cluster => "cluster",
            Self::NodeGroup => "ng",
            Self::Addon => "addon",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Default for EnabledExpr {
    fn default() -> Self {
        Self::Literal(true)
    }
}

impl EnabledExpr {
    /// Returns the referenced flag name and whether it is negated.
    #[must_use]
    pub fn flag(&self) -> Option<(&str, bool)> {
        match self {
            Self::Literal(_) => None,
            Self::Flag(raw) => {
                let raw = raw.trim();
                Some(raw.strip_prefix('!').map_or((raw, false), |name| (name.trim(), true)))
            }
        }
    }

    /// Evaluates the predicate against flag bindings.
    ///
    /// # Errors
    ///
    /// Returns the flag name if it is not bound.
    pub fn evaluate(&self, flags: &FlagBindings) -> std::result::Result<bool, String> {
        match self {
            Self::Literal(value) => Ok(*value),
            Self::Flag(_) => {
                let (name, negated) = self.flag().unwrap_or(("", false));
                flags
                    .get(name)
                    .map(|value| value != negated)
                    .ok_or_else(|| name.to_string())
            }
        }
    }
}

impl OutputRef {
    /// Creates a new output reference.
    #[must_use]
    pub fn new(node: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            output: output.into(),
        }
    }
}

impl fmt::Display for OutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${{{}.{}}}", self.node, self.output)
    }
}

impl AttrValue {
    /// Returns true if the value needs no resolution.
    #[must_use]
    pub const fn is_literal(&self) -> bool {
        matches!(self, Self::Literal(_))
    }

    /// Collects every output reference inside this value.
    pub fn collect_references<'a>(&'a self, out: &mut Vec<&'a OutputRef>) {
        match self {
            Self::Literal(_) => {}
            Self::Reference(r) => out.push(r),
            Self::Template(segments) => {
                for segment in segments {
                    if let Segment::Reference(r) = segment {
                        out.push(r);
                    }
                }
            }
            Self::List(items) => {
                for item in items {
                    item.collect_references(out);
                }
            }
            Self::Map(entries) => {
                for value in entries.values() {
                    value.collect_references(out);
                }
            }
        }
    }

    /// Resolves placeholders through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns the first reference `lookup` could not satisfy.
    pub fn resolve<F>(&self, lookup: &F) -> std::result::Result<Value, OutputRef>
    where
        F: Fn(&OutputRef) -> Option<Value>,
    {
        match self {
            Self::Literal(value) => Ok(value.clone()),
            Self::Reference(r) => lookup(r).ok_or_else(|| r.clone()),
            Self::Template(segments) => {
                let mut out = String::new();
                for segment in segments {
                    match segment {
                        Segment::Text(text) => out.push_str(text),
                        Segment::Reference(r) => match lookup(r).ok_or_else(|| r.clone())? {
                            Value::String(s) => out.push_str(&s),
                            other => out.push_str(&other.to_string()),
                        },
                    }
                }
                Ok(Value::String(out))
            }
            Self::List(items) => items
                .iter()
                .map(|item| item.resolve(lookup))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map(Value::Array),
            Self::Map(entries) => {
                let mut object = serde_json::Map::new();
                for (key, value) in entries {
                    object.insert(key.clone(), value.resolve(lookup)?);
                }
                Ok(Value::Object(object))
            }
        }
    }
}

impl ResourceNode {
    /// Creates an enabled node without attributes or dependencies.
    #[must_use]
    pub fn new(id: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            id: id.into(),
            kind,
            attributes: BTreeMap::new(),
            enabled: EnabledExpr::default(),
            depends_on: BTreeSet::new(),
            position: 0,
        }
    }

    /// Adds an attribute.
    #[must_use]
    pub fn with_attribute(mut self, name: impl Into<String>, value: AttrValue) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }

    /// Adds an explicit dependency.
    #[must_use]
    pub fn with_dependency(mut self, id: impl Into<String>) -> Self {
        self.depends_on.insert(id.into());
        self
    }

    /// Sets the inclusion predicate.
    #[must_use]
    pub fn with_enabled(mut self, enabled: EnabledExpr) -> Self {
        self.enabled = enabled;
        self
    }

    /// Returns every output reference in the node's attributes.
    #[must_use]
    pub fn references(&self) -> Vec<&OutputRef> {
        let mut refs = Vec::new();
        for value in self.attributes.values() {
            value.collect_references(&mut refs);
        }
        refs
    }

    /// Returns the ids of nodes referenced through attributes.
    #[must_use]
    pub fn referenced_nodes(&self) -> BTreeSet<&str> {
        self.references().into_iter().map(|r| r.node.as_str()).collect()
    }

    /// Resolves all attributes through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns the first reference that could not be resolved.
    pub fn resolve_attributes<F>(&self, lookup: &F) -> std::result::Result<Attributes, OutputRef>
    where
        F: Fn(&OutputRef) -> Option<Value>,
    {
        self.attributes
            .iter()
            .map(|(name, value)| Ok((name.clone(), value.resolve(lookup)?)))
            .collect()
    }
}

impl ResourceGraph {
    /// Creates an empty, mutable graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node, assigning its declaration position.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateId` if the id is already present, `Frozen` after `freeze()`.
    pub fn add_node(&mut self, mut node: ResourceNode) -> std::result::Result<usize, GraphError> {
        if self.frozen {
            return Err(GraphError::Frozen);
        }
        if self.index.contains_key(&node.id) {
            return Err(GraphError::DuplicateId { id: node.id });
        }

        let idx = self.nodes.len();
        node.position = idx;
        self.index.insert(node.id.clone(), idx);
        self.nodes.push(node);
        self.dependencies.push(Vec::new());
        self.dependents.push(Vec::new());
        Ok(idx)
    }

    /// Adds a `from` depends-on `to` edge. Adding an existing edge again is a
    /// no-op, except that an explicit declaration upgrades an implicit edge.
    ///
    /// # Errors
    ///
    /// Returns `UnknownNode` if either id is absent, `SelfDependency` for a
    /// self-loop, `Frozen` after `freeze()`.
    pub fn add_edge(
        &mut self,
        from: &str,
        to: &str,
        origin: EdgeOrigin,
    ) -> std::result::Result<(), GraphError> {
        if self.frozen {
            return Err(GraphError::Frozen);
        }

        let from_idx = self.index_of(from).ok_or_else(|| GraphError::UnknownNode {
            id: from.to_string(),
            referenced_by: None,
        })?;
        let to_idx = self.index_of(to).ok_or_else(|| GraphError::UnknownNode {
            id: to.to_string(),
            referenced_by: Some(from.to_string()),
        })?;

        if from_idx == to_idx {
            return Err(GraphError::SelfDependency {
                id: from.to_string(),
            });
        }

        if let Some(&existing) = self.edge_index.get(&(from_idx, to_idx)) {
            if origin == EdgeOrigin::Explicit {
                self.edges[existing].origin = EdgeOrigin::Explicit;
            }
            return Ok(());
        }

        self.edge_index.insert((from_idx, to_idx), self.edges.len());
        self.edges.push(Edge {
            from: from.to_string(),
            to: to.to_string(),
            origin,
        });
        self.dependencies[from_idx].push(to_idx);
        self.dependents[to_idx].push(from_idx);
        Ok(())
    }

    /// Forbids any further mutation.
    pub const fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Returns true once `freeze()` has been called.
    #[must_use]
    pub const fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Returns all nodes in declaration order.
    #[must_use]
    pub fn nodes(&self) -> &[ResourceNode] {
        &self.nodes
    }

    /// Returns all edges in insertion order.
    #[must_use]
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Returns the number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Looks up a node index by id.
    #[must_use]
    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Looks up a node by id.
    #[must_use]
    pub fn node(&self, id: &str) -> Option<&ResourceNode> {
        self.index_of(id).map(|idx| &self.nodes[idx])
    }

    /// Returns the node at an index.
    ///
    /// # Panics
    ///
    /// Panics if `idx` is out of bounds.
    #[must_use]
    pub fn node_at(&self, idx: usize) -> &ResourceNode {
        &self.nodes[idx]
    }

    /// Indices of the nodes `idx` depends on.
    #[must_use]
    pub fn dependencies_of(&self, idx: usize) -> &[usize] {
        &self.dependencies[idx]
    }

    /// Indices of the nodes depending on `idx`.
    #[must_use]
    pub fn dependents_of(&self, idx: usize) -> &[usize] {
        &self.dependents[idx]
    }
}
