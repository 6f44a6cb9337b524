//! Graph expansion: rewrites a vmap closure, and every closure it reaches,
//! so that each primitive call goes through its batching rule and each
//! value flowing in carries a batch axis.
//!
//! All state lives in `ExpandCtx` and is dropped with it; nothing persists
//! between call sites.

use crate::resolve::{Resolution, resolve_primitive};
use crate::{PassConfig, VmapError};
use fv_core::{Constant, GraphId, GraphManager, Module, NodeId, NodeUse, Primitive};
use fv_rules::RuleRegistry;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

/// Counters gathered while expanding one vmap scope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpandStats {
    pub primitives_rewritten: usize,
    pub meta_ops_rewritten: usize,
    pub constants_wrapped: usize,
    pub free_variables_bound: usize,
    pub nodes_copied: usize,
    pub graphs_cloned: usize,
}

pub struct ExpandCtx<'a> {
    manager: &'a mut GraphManager,
    registry: &'a RuleRegistry,
    config: &'a PassConfig,
    axis_size: usize,
    visited_graphs: FxHashSet<GraphId>,
    visited_nodes: FxHashSet<NodeId>,
    /// Closures cloned for this scope, keyed by the graph they copy.
    clones: FxHashMap<GraphId, GraphId>,
    stats: ExpandStats,
}

/// Constant kinds rewritten to `(value, none)`.
#[must_use]
pub fn is_unbatched_constant(constant: &Constant) -> bool {
    matches!(
        constant,
        Constant::Scalar(_)
            | Constant::Tensor(_)
            | Constant::None
            | Constant::Tuple(_)
            | Constant::Type(_)
            | Constant::Str(_)
    )
}

/// Whether any use of a node lies outside `graph`.
///
/// Users of one node are usually contiguous in one graph, so the first and
/// last users are checked before the full scan.
pub fn needs_copy(
    module: &Module,
    uses: &[NodeUse],
    graph: GraphId,
) -> Result<bool, VmapError> {
    let owner = |node_use: &NodeUse| -> Result<Option<GraphId>, VmapError> {
        Ok(module.node(node_use.user)?.graph)
    };
    let (Some(first), Some(last)) = (uses.first(), uses.last()) else {
        return Ok(false);
    };
    if owner(first)? != Some(graph) || owner(last)? != Some(graph) {
        return Ok(true);
    }
    for node_use in uses {
        if owner(node_use)? != Some(graph) {
            return Ok(true);
        }
    }
    Ok(false)
}

impl<'a> ExpandCtx<'a> {
    pub fn new(
        manager: &'a mut GraphManager,
        registry: &'a RuleRegistry,
        config: &'a PassConfig,
        axis_size: usize,
    ) -> Self {
        Self {
            manager,
            registry,
            config,
            axis_size,
            visited_graphs: FxHashSet::default(),
            visited_nodes: FxHashSet::default(),
            clones: FxHashMap::default(),
            stats: ExpandStats::default(),
        }
    }

    #[must_use]
    pub fn stats(&self) -> ExpandStats {
        self.stats
    }

    /// Expand `graph` in place.
    pub fn expand_root(&mut self, graph: GraphId) -> Result<GraphId, VmapError> {
        debug!(
            graph = %self.manager.module().graph(graph)?.name,
            axis_size = self.axis_size,
            "performing vmap expansion"
        );
        self.visited_graphs.insert(graph);
        self.expand_graph(graph)
    }

    fn expand_graph(&mut self, graph: GraphId) -> Result<GraphId, VmapError> {
        self.manager.add_graph(graph)?;
        // Parameters receive (value, axis) pairs from the caller, so they are
        // never rebound as free variables of nested closures.
        let parameters = self.manager.module().graph(graph)?.parameters.clone();
        self.visited_nodes.extend(parameters);

        self.expand_value_nodes(graph)?;
        self.expand_free_variables(graph)?;
        Ok(graph)
    }

    fn expand_value_nodes(&mut self, graph: GraphId) -> Result<(), VmapError> {
        let value_nodes = self.manager.module().value_nodes(graph)?;
        for node in value_nodes {
            if self.visited_nodes.contains(&node) {
                debug!(%node, "value node already transformed");
                continue;
            }
            let node = self.copy_node_to_vmap(node, graph)?;
            let Some(constant) = self.manager.module().constant(node)?.cloned() else {
                return Err(VmapError::UnsupportedNode {
                    node,
                    detail: "value node without a constant".to_owned(),
                });
            };

            match constant {
                Constant::Graph(sub) => {
                    self.visited_nodes.insert(node);
                    if let Some(&copy) = self.clones.get(&sub) {
                        self.retarget_graph_holder(node, copy, graph)?;
                        continue;
                    }
                    if self.visited_graphs.contains(&sub) {
                        continue;
                    }
                    let (holder, sub) = self.isolate_graph(node, sub, graph)?;
                    self.visited_nodes.insert(holder);
                    self.visited_graphs.insert(sub);
                    self.expand_graph(sub)?;
                }
                Constant::Primitive(primitive) => {
                    let replacement = self.expand_primitive(node, primitive)?;
                    self.visited_nodes.insert(replacement);
                    if replacement != node {
                        self.manager.replace(node, replacement)?;
                        self.stats.primitives_rewritten += 1;
                    }
                }
                Constant::Meta(meta) => {
                    // Left behind by an inner vmap expanded on an earlier sweep.
                    debug!(%node, %meta, "batching a meta function of an inner vmap");
                    let nested = Constant::Meta(meta.nested(self.axis_size));
                    let replacement = self.manager.module_mut().new_constant(nested);
                    self.visited_nodes.insert(replacement);
                    self.manager.replace(node, replacement)?;
                    self.stats.meta_ops_rewritten += 1;
                }
                Constant::Monad(_) => {}
                constant if is_unbatched_constant(&constant) => {
                    let wrapped = Constant::Tuple(vec![constant, Constant::None]);
                    let replacement = self.manager.module_mut().new_constant(wrapped);
                    self.visited_nodes.insert(replacement);
                    self.manager.replace(node, replacement)?;
                    self.stats.constants_wrapped += 1;
                }
                other => {
                    return Err(VmapError::UnsupportedNode {
                        node,
                        detail: other.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    fn expand_primitive(
        &mut self,
        node: NodeId,
        primitive: Primitive,
    ) -> Result<NodeId, VmapError> {
        debug!(%node, primitive = primitive.as_str(), "overloading primitive node");
        let resolution = resolve_primitive(
            self.manager.module_mut(),
            self.registry,
            self.config,
            primitive,
            self.axis_size,
        )?;
        let module = self.manager.module_mut();
        Ok(match resolution {
            Resolution::PassThrough => node,
            Resolution::Rule(rule) => module.new_constant(Constant::Graph(rule)),
            Resolution::Fallback(meta) => module.new_constant(Constant::Meta(meta)),
        })
    }

    fn expand_free_variables(&mut self, graph: GraphId) -> Result<(), VmapError> {
        let free_variables = self.manager.module().free_variables(graph)?;
        for node in free_variables {
            if self.visited_nodes.contains(&node) {
                debug!(%node, "free variable already transformed");
                continue;
            }
            // Constants are ownerless and were handled as value nodes.
            if self.manager.module().node(node)?.is_parameter() {
                self.bind_none_axis(node, graph)?;
            } else {
                debug!(%node, "apply-node free variable left as is");
            }
        }
        Ok(())
    }

    /// Give `graph` its own copy of `node` when other graphs also use it.
    fn copy_node_to_vmap(&mut self, node: NodeId, graph: GraphId) -> Result<NodeId, VmapError> {
        let uses = self.manager.node_users(node)?;
        if uses.len() <= 1 || !needs_copy(self.manager.module(), &uses, graph)? {
            return Ok(node);
        }
        debug!(%node, "value node is used outside this graph, copying it");
        let template = self.manager.module().node(node)?.clone();
        let Some(constant) = template.constant().cloned() else {
            return Ok(node);
        };
        let module = self.manager.module_mut();
        let copy = module.new_constant(constant);
        if let Some(abstract_value) = template.abstract_value {
            module.set_abstract(copy, abstract_value)?;
        }
        for node_use in self.local_uses(&uses, graph)? {
            self.manager.set_edge(node_use.user, node_use.index, copy)?;
        }
        self.stats.nodes_copied += 1;
        Ok(copy)
    }

    /// Deep-clone `sub` when a graph outside this scope still calls it, and
    /// point the uses of `holder` in `graph` at the clone.
    fn isolate_graph(
        &mut self,
        holder: NodeId,
        sub: GraphId,
        graph: GraphId,
    ) -> Result<(NodeId, GraphId), VmapError> {
        let module = self.manager.module();
        let mut family: FxHashSet<GraphId> = module.nested_graphs(sub)?.into_iter().collect();
        family.insert(sub);
        family.insert(graph);

        let mut shared = false;
        for node_use in self.manager.graph_users(sub)? {
            let owner = self.manager.user_graph(node_use)?;
            if !owner.is_some_and(|owner| family.contains(&owner)) {
                shared = true;
                break;
            }
        }
        if !shared {
            return Ok((holder, sub));
        }

        debug!(
            graph = %self.manager.module().graph(sub)?.name,
            "closure is also used outside the vmap scope, cloning it"
        );
        let uses = self.manager.node_users(holder)?;
        let local = self.local_uses(&uses, graph)?;
        let module = self.manager.module_mut();
        let copy = module.clone_graph(sub)?;
        let fresh = module.new_constant(Constant::Graph(copy));
        for node_use in local {
            self.manager.set_edge(node_use.user, node_use.index, fresh)?;
        }
        self.clones.insert(sub, copy);
        self.visited_graphs.insert(sub);
        self.stats.graphs_cloned += 1;
        Ok((fresh, copy))
    }

    /// Point the uses of `holder` in `graph` at a closure already cloned for
    /// this scope.
    fn retarget_graph_holder(
        &mut self,
        holder: NodeId,
        copy: GraphId,
        graph: GraphId,
    ) -> Result<(), VmapError> {
        let uses = self.manager.node_users(holder)?;
        let local = self.local_uses(&uses, graph)?;
        let fresh = self.manager.module_mut().new_constant(Constant::Graph(copy));
        self.visited_nodes.insert(fresh);
        for node_use in local {
            self.manager.set_edge(node_use.user, node_use.index, fresh)?;
        }
        Ok(())
    }

    /// Rewire the uses of `node` inside `graph` to a fresh `(node, none)`.
    fn bind_none_axis(&mut self, node: NodeId, graph: GraphId) -> Result<(), VmapError> {
        let uses = self.manager.node_users(node)?;
        let local = self.local_uses(&uses, graph)?;
        if local.is_empty() {
            return Ok(());
        }
        let module = self.manager.module_mut();
        let none = module.new_constant(Constant::None);
        let pair = module.new_primitive_apply(graph, Primitive::MakeTuple, &[node, none])?;
        for node_use in local {
            self.manager.set_edge(node_use.user, node_use.index, pair)?;
        }
        self.stats.free_variables_bound += 1;
        Ok(())
    }

    fn local_uses(&self, uses: &[NodeUse], graph: GraphId) -> Result<Vec<NodeUse>, VmapError> {
        let mut local = Vec::with_capacity(uses.len());
        for node_use in uses {
            if self.manager.user_graph(*node_use)? == Some(graph) {
                local.push(*node_use);
            }
        }
        Ok(local)
    }
}
