//! Arena of closure graphs and their nodes.
//!
//! Every node lives in one `Module` and is addressed by `NodeId`. Parameters
//! and apply nodes are owned by exactly one graph; constant nodes are
//! ownerless and may be shared by applies of several graphs. A graph's
//! output is held by an ordinary `[return, value]` apply so that rewiring
//! the output is just another edge update.

use crate::{AbstractValue, Constant, GraphId, IrError, NodeId, Primitive};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt::Write;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    Parameter,
    Constant(Constant),
    Apply(SmallVec<[NodeId; 4]>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub kind: NodeKind,
    pub graph: Option<GraphId>,
    pub abstract_value: Option<AbstractValue>,
    pub debug_name: Option<String>,
}

impl Node {
    #[must_use]
    pub fn constant(&self) -> Option<&Constant> {
        match &self.kind {
            NodeKind::Constant(constant) => Some(constant),
            _ => None,
        }
    }

    #[must_use]
    pub fn inputs(&self) -> Option<&[NodeId]> {
        match &self.kind {
            NodeKind::Apply(inputs) => Some(inputs),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_parameter(&self) -> bool {
        matches!(self.kind, NodeKind::Parameter)
    }

    #[must_use]
    pub fn is_apply(&self) -> bool {
        matches!(self.kind, NodeKind::Apply(_))
    }

    #[must_use]
    pub fn is_monad(&self) -> bool {
        self.abstract_value
            .as_ref()
            .is_some_and(AbstractValue::is_monad)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphFlags {
    /// Monads must be re-inserted into this graph before it is lowered.
    pub re_auto_monad: bool,
    pub defer_inline: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Graph {
    pub name: String,
    pub parameters: Vec<NodeId>,
    pub return_node: Option<NodeId>,
    /// Lexically enclosing graph, for closures.
    pub parent: Option<GraphId>,
    pub flags: GraphFlags,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    nodes: Vec<Node>,
    graphs: Vec<Graph>,
}

impl Module {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn graph_count(&self) -> usize {
        self.graphs.len()
    }

    pub fn graph_ids(&self) -> impl Iterator<Item = GraphId> + '_ {
        (0..self.graphs.len()).map(|idx| GraphId(idx as u32))
    }

    pub fn node(&self, id: NodeId) -> Result<&Node, IrError> {
        self.nodes
            .get(id.0 as usize)
            .ok_or(IrError::UnknownNode(id))
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> Result<&mut Node, IrError> {
        self.nodes
            .get_mut(id.0 as usize)
            .ok_or(IrError::UnknownNode(id))
    }

    pub fn graph(&self, id: GraphId) -> Result<&Graph, IrError> {
        self.graphs
            .get(id.0 as usize)
            .ok_or(IrError::UnknownGraph(id))
    }

    pub fn graph_mut(&mut self, id: GraphId) -> Result<&mut Graph, IrError> {
        self.graphs
            .get_mut(id.0 as usize)
            .ok_or(IrError::UnknownGraph(id))
    }

    pub fn new_graph(&mut self, name: impl Into<String>, parent: Option<GraphId>) -> GraphId {
        let id = GraphId(self.graphs.len() as u32);
        self.graphs.push(Graph {
            name: name.into(),
            parameters: Vec::new(),
            return_node: None,
            parent,
            flags: GraphFlags::default(),
        });
        id
    }

    pub fn add_parameter(&mut self, graph: GraphId) -> Result<NodeId, IrError> {
        self.graph(graph)?;
        let id = self.push_node(Node {
            kind: NodeKind::Parameter,
            graph: Some(graph),
            abstract_value: None,
            debug_name: None,
        });
        self.graph_mut(graph)?.parameters.push(id);
        Ok(id)
    }

    /// Add a parameter carrying a shape/type abstraction.
    pub fn add_typed_parameter(
        &mut self,
        graph: GraphId,
        abstract_value: AbstractValue,
    ) -> Result<NodeId, IrError> {
        let id = self.add_parameter(graph)?;
        self.set_abstract(id, abstract_value)?;
        Ok(id)
    }

    pub fn new_constant(&mut self, constant: Constant) -> NodeId {
        let abstract_value = constant.abstract_value();
        self.push_node(Node {
            kind: NodeKind::Constant(constant),
            graph: None,
            abstract_value,
            debug_name: None,
        })
    }

    pub fn new_apply(
        &mut self,
        graph: GraphId,
        inputs: impl IntoIterator<Item = NodeId>,
    ) -> Result<NodeId, IrError> {
        self.graph(graph)?;
        let inputs: SmallVec<[NodeId; 4]> = inputs.into_iter().collect();
        if inputs.is_empty() {
            return Err(IrError::EmptyApply);
        }
        for input in &inputs {
            self.node(*input)?;
        }
        Ok(self.push_node(Node {
            kind: NodeKind::Apply(inputs),
            graph: Some(graph),
            abstract_value: None,
            debug_name: None,
        }))
    }

    /// Apply `primitive` to `args` inside `graph`, creating the operator constant.
    pub fn new_primitive_apply(
        &mut self,
        graph: GraphId,
        primitive: Primitive,
        args: &[NodeId],
    ) -> Result<NodeId, IrError> {
        let op = self.new_constant(Constant::Primitive(primitive));
        self.new_apply(graph, std::iter::once(op).chain(args.iter().copied()))
    }

    /// Make `value` the output of `graph`, replacing any previous return node.
    pub fn set_output(&mut self, graph: GraphId, value: NodeId) -> Result<NodeId, IrError> {
        let ret = self.new_primitive_apply(graph, Primitive::Return, &[value])?;
        if let Some(abstract_value) = self.node(value)?.abstract_value.clone() {
            self.set_abstract(ret, abstract_value)?;
        }
        self.graph_mut(graph)?.return_node = Some(ret);
        Ok(ret)
    }

    pub fn output(&self, graph: GraphId) -> Result<NodeId, IrError> {
        let ret = self
            .graph(graph)?
            .return_node
            .ok_or(IrError::MissingOutput(graph))?;
        match self.node(ret)?.inputs() {
            Some([_, value]) => Ok(*value),
            _ => Err(IrError::MalformedReturn { graph, node: ret }),
        }
    }

    pub fn set_abstract(
        &mut self,
        node: NodeId,
        abstract_value: AbstractValue,
    ) -> Result<(), IrError> {
        self.node_mut(node)?.abstract_value = Some(abstract_value);
        Ok(())
    }

    pub fn set_debug_name(&mut self, node: NodeId, name: impl Into<String>) -> Result<(), IrError> {
        self.node_mut(node)?.debug_name = Some(name.into());
        Ok(())
    }

    pub fn abstract_of(&self, node: NodeId) -> Result<Option<&AbstractValue>, IrError> {
        Ok(self.node(node)?.abstract_value.as_ref())
    }

    pub fn inputs(&self, node: NodeId) -> Result<&[NodeId], IrError> {
        self.node(node)?.inputs().ok_or(IrError::NotAnApply(node))
    }

    pub fn constant(&self, node: NodeId) -> Result<Option<&Constant>, IrError> {
        Ok(self.node(node)?.constant())
    }

    pub fn graph_constant(&self, node: NodeId) -> Result<Option<GraphId>, IrError> {
        Ok(self.node(node)?.constant().and_then(Constant::as_graph))
    }

    /// Applies owned by `graph` reachable from its return node, inputs first.
    pub fn graph_applies(&self, graph: GraphId) -> Result<Vec<NodeId>, IrError> {
        let Some(ret) = self.graph(graph)?.return_node else {
            return Ok(Vec::new());
        };
        let mut order = Vec::new();
        let mut seen: FxHashSet<NodeId> = FxHashSet::default();
        let mut stack = vec![(ret, false)];
        while let Some((node_id, expanded)) = stack.pop() {
            if expanded {
                order.push(node_id);
                continue;
            }
            if !seen.insert(node_id) {
                continue;
            }
            let node = self.node(node_id)?;
            let Some(inputs) = node.inputs() else {
                continue;
            };
            if node.graph != Some(graph) {
                continue;
            }
            stack.push((node_id, true));
            for input in inputs.iter().rev() {
                if !seen.contains(input) && self.node(*input)?.is_apply() {
                    stack.push((*input, false));
                }
            }
        }
        Ok(order)
    }

    /// Distinct constant nodes used by the applies of `graph`.
    pub fn value_nodes(&self, graph: GraphId) -> Result<Vec<NodeId>, IrError> {
        let mut seen: FxHashSet<NodeId> = FxHashSet::default();
        let mut out = Vec::new();
        for apply in self.graph_applies(graph)? {
            for input in self.inputs(apply)? {
                if self.node(*input)?.constant().is_some() && seen.insert(*input) {
                    out.push(*input);
                }
            }
        }
        Ok(out)
    }

    /// Nodes owned by another graph that the applies of `graph` use directly.
    pub fn free_variables(&self, graph: GraphId) -> Result<Vec<NodeId>, IrError> {
        let mut seen: FxHashSet<NodeId> = FxHashSet::default();
        let mut out = Vec::new();
        for apply in self.graph_applies(graph)? {
            for input in self.inputs(apply)? {
                let node = self.node(*input)?;
                if node.graph.is_some_and(|owner| owner != graph) && seen.insert(*input) {
                    out.push(*input);
                }
            }
        }
        Ok(out)
    }

    /// Graphs whose parent chain passes through `graph`.
    pub fn nested_graphs(&self, graph: GraphId) -> Result<Vec<GraphId>, IrError> {
        self.graph(graph)?;
        let mut out = Vec::new();
        for candidate in self.graph_ids() {
            if candidate == graph {
                continue;
            }
            let mut cursor = self.graph(candidate)?.parent;
            let mut depth = 0;
            while let Some(parent) = cursor {
                if parent == graph {
                    out.push(candidate);
                    break;
                }
                depth += 1;
                if depth > self.graphs.len() {
                    break;
                }
                cursor = self.graph(parent)?.parent;
            }
        }
        Ok(out)
    }

    /// Deep-copy `graph` and every graph nested in it.
    ///
    /// Parameters, applies, and constant nodes of the copied graphs are all
    /// fresh; graph constants that point into the copied set are retargeted
    /// to the copies. Free variables from enclosing scopes stay shared.
    pub fn clone_graph(&mut self, graph: GraphId) -> Result<GraphId, IrError> {
        let mut sources = vec![graph];
        sources.extend(self.nested_graphs(graph)?);

        let mut graph_map: FxHashMap<GraphId, GraphId> = FxHashMap::default();
        for source in &sources {
            let template = self.graph(*source)?.clone();
            let copy = self.new_graph(template.name, template.parent);
            self.graph_mut(copy)?.flags = template.flags;
            graph_map.insert(*source, copy);
        }
        for source in &sources {
            let copy = graph_map[source];
            let parent = self.graph(copy)?.parent;
            if let Some(parent) = parent
                && let Some(mapped) = graph_map.get(&parent).copied()
            {
                self.graph_mut(copy)?.parent = Some(mapped);
            }
        }

        let mut node_map: FxHashMap<NodeId, NodeId> = FxHashMap::default();
        let mut applies = Vec::new();
        for source in &sources {
            let copy = graph_map[source];
            let params = self.graph(*source)?.parameters.clone();
            for param in params {
                let template = self.node(param)?.clone();
                let fresh = self.add_parameter(copy)?;
                let fresh_node = self.node_mut(fresh)?;
                fresh_node.abstract_value = template.abstract_value;
                fresh_node.debug_name = template.debug_name;
                node_map.insert(param, fresh);
            }
            for apply in self.graph_applies(*source)? {
                let template = self.node(apply)?.clone();
                let fresh = self.push_node(Node {
                    kind: NodeKind::Apply(SmallVec::new()),
                    graph: Some(copy),
                    abstract_value: template.abstract_value,
                    debug_name: template.debug_name,
                });
                node_map.insert(apply, fresh);
                applies.push(apply);
            }
        }

        let mut constant_map: FxHashMap<NodeId, NodeId> = FxHashMap::default();
        for apply in applies {
            let mut inputs: SmallVec<[NodeId; 4]> = SmallVec::new();
            let inputs_of_source = self.inputs(apply)?.to_vec();
            for input in inputs_of_source {
                let mapped = if let Some(mapped) = node_map.get(&input) {
                    *mapped
                } else if let Some(constant) = self.node(input)?.constant().cloned() {
                    if let Some(mapped) = constant_map.get(&input) {
                        *mapped
                    } else {
                        let constant = match constant {
                            Constant::Graph(target) => {
                                Constant::Graph(graph_map.get(&target).copied().unwrap_or(target))
                            }
                            other => other,
                        };
                        let template = self.node(input)?.clone();
                        let fresh = self.new_constant(constant);
                        let fresh_node = self.node_mut(fresh)?;
                        fresh_node.abstract_value = template.abstract_value;
                        fresh_node.debug_name = template.debug_name;
                        constant_map.insert(input, fresh);
                        fresh
                    }
                } else {
                    input
                };
                inputs.push(mapped);
            }
            let fresh = node_map[&apply];
            self.node_mut(fresh)?.kind = NodeKind::Apply(inputs);
        }

        for source in &sources {
            if let Some(ret) = self.graph(*source)?.return_node {
                let copy = graph_map[source];
                self.graph_mut(copy)?.return_node = node_map.get(&ret).copied();
            }
        }
        Ok(graph_map[&graph])
    }

    pub fn validate_graph(&self, graph: GraphId) -> Result<(), IrError> {
        for param in &self.graph(graph)?.parameters {
            let node = self.node(*param)?;
            if !node.is_parameter() || node.graph != Some(graph) {
                return Err(IrError::ParameterOwnership {
                    graph,
                    node: *param,
                });
            }
        }
        let ret = self
            .graph(graph)?
            .return_node
            .ok_or(IrError::MissingOutput(graph))?;
        let is_return = match self.inputs(ret)? {
            [op, _] => {
                self.constant(*op)?.and_then(Constant::as_primitive) == Some(Primitive::Return)
            }
            _ => false,
        };
        if !is_return {
            return Err(IrError::MalformedReturn { graph, node: ret });
        }
        for apply in self.graph_applies(graph)? {
            if self.inputs(apply)?.is_empty() {
                return Err(IrError::EmptyApply);
            }
        }
        Ok(())
    }

    /// Canonical rendering of `graph` with graph-local numbering.
    ///
    /// Parameters print as `p<i>`, applies as `a<i>` in evaluation order,
    /// graph constants as `@name`, other constants inline, and free
    /// variables as `fv<node id>`.
    pub fn fingerprint(&self, graph: GraphId) -> Result<String, IrError> {
        let graph_ref = self.graph(graph)?;
        let mut names: FxHashMap<NodeId, String> = FxHashMap::default();
        for (idx, param) in graph_ref.parameters.iter().enumerate() {
            names.insert(*param, format!("p{idx}"));
        }
        let applies = self.graph_applies(graph)?;
        for (idx, apply) in applies.iter().enumerate() {
            names.insert(*apply, format!("a{idx}"));
        }

        let mut out = String::new();
        let _ = write!(&mut out, "{}(", graph_ref.name);
        for idx in 0..graph_ref.parameters.len() {
            if idx > 0 {
                out.push_str(", ");
            }
            let _ = write!(&mut out, "p{idx}");
        }
        out.push_str(") {");
        for apply in &applies {
            let _ = write!(&mut out, " {} = ", names[apply]);
            for (idx, input) in self.inputs(*apply)?.iter().enumerate() {
                if idx == 1 {
                    out.push('(');
                } else if idx > 1 {
                    out.push_str(", ");
                }
                match names.get(input) {
                    Some(name) => out.push_str(name),
                    None => match self.node(*input)?.constant() {
                        Some(Constant::Graph(target)) => {
                            let _ = write!(&mut out, "@{}", self.graph(*target)?.name);
                        }
                        Some(constant) => {
                            let _ = write!(&mut out, "{constant}");
                        }
                        None => {
                            let _ = write!(&mut out, "fv{}", input.0);
                        }
                    },
                }
            }
            out.push_str(if self.inputs(*apply)?.len() > 1 { ");" } else { "();" });
        }
        out.push_str(" }");
        Ok(out)
    }

    fn push_node(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }
}
