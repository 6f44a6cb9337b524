//! Mutation tracking over a `Module`.
//!
//! The manager owns the module for the duration of a pass. User lists only
//! cover nodes reachable from the managed roots (directly, or through graph
//! constants), so nodes orphaned by a rewrite stop counting as users. The
//! index is rebuilt lazily after any mutation.

use crate::{Constant, GraphId, IrError, Module, NodeId};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

/// One edge: `user.inputs[index]` refers to the node in question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeUse {
    pub user: NodeId,
    pub index: usize,
}

#[derive(Debug)]
pub struct GraphManager {
    module: Module,
    roots: Vec<GraphId>,
    users: FxHashMap<NodeId, Vec<NodeUse>>,
    dirty: bool,
}

impl GraphManager {
    #[must_use]
    pub fn new(module: Module) -> Self {
        Self {
            module,
            roots: Vec::new(),
            users: FxHashMap::default(),
            dirty: true,
        }
    }

    pub fn with_root(module: Module, root: GraphId) -> Result<Self, IrError> {
        let mut manager = Self::new(module);
        manager.add_graph(root)?;
        Ok(manager)
    }

    #[must_use]
    pub fn module(&self) -> &Module {
        &self.module
    }

    /// Mutable access for building new nodes. Invalidates the user index.
    pub fn module_mut(&mut self) -> &mut Module {
        self.dirty = true;
        &mut self.module
    }

    #[must_use]
    pub fn into_module(self) -> Module {
        self.module
    }

    #[must_use]
    pub fn roots(&self) -> &[GraphId] {
        &self.roots
    }

    /// Register `graph` for user tracking.
    pub fn add_graph(&mut self, graph: GraphId) -> Result<(), IrError> {
        self.module.graph(graph)?;
        if !self.roots.contains(&graph) {
            self.roots.push(graph);
            self.dirty = true;
        }
        Ok(())
    }

    /// Roots plus every graph reachable from them through graph constants.
    pub fn managed_graphs(&self) -> Result<Vec<GraphId>, IrError> {
        let mut seen: FxHashSet<GraphId> = FxHashSet::default();
        let mut order = Vec::new();
        let mut queue: Vec<GraphId> = self.roots.iter().rev().copied().collect();
        while let Some(graph) = queue.pop() {
            if !seen.insert(graph) {
                continue;
            }
            order.push(graph);
            let mut children = Vec::new();
            for node in self.module.value_nodes(graph)? {
                if let Some(child) = self.module.graph_constant(node)?
                    && !seen.contains(&child)
                {
                    children.push(child);
                }
            }
            queue.extend(children.into_iter().rev());
        }
        Ok(order)
    }

    fn refresh(&mut self) -> Result<(), IrError> {
        if !self.dirty {
            return Ok(());
        }
        let mut users: FxHashMap<NodeId, Vec<NodeUse>> = FxHashMap::default();
        for graph in self.managed_graphs()? {
            for apply in self.module.graph_applies(graph)? {
                for (index, input) in self.module.inputs(apply)?.iter().enumerate() {
                    users
                        .entry(*input)
                        .or_default()
                        .push(NodeUse { user: apply, index });
                }
            }
        }
        self.users = users;
        self.dirty = false;
        Ok(())
    }

    pub fn node_users(&mut self, node: NodeId) -> Result<Vec<NodeUse>, IrError> {
        self.module.node(node)?;
        self.refresh()?;
        Ok(self.users.get(&node).cloned().unwrap_or_default())
    }

    /// Every use of any constant node that holds `graph`.
    pub fn graph_users(&mut self, graph: GraphId) -> Result<Vec<NodeUse>, IrError> {
        self.module.graph(graph)?;
        self.refresh()?;
        let mut holders: Vec<NodeId> = Vec::new();
        for node in self.users.keys() {
            if self.module.node(*node)?.constant() == Some(&Constant::Graph(graph)) {
                holders.push(*node);
            }
        }
        holders.sort_unstable();
        Ok(holders
            .iter()
            .flat_map(|holder| self.users[holder].iter().copied())
            .collect())
    }

    /// Graph owning the user side of `node_use`.
    pub fn user_graph(&self, node_use: NodeUse) -> Result<Option<GraphId>, IrError> {
        Ok(self.module.node(node_use.user)?.graph)
    }

    pub fn set_edge(&mut self, user: NodeId, index: usize, new: NodeId) -> Result<(), IrError> {
        self.module.node(new)?;
        let node = self.module.node_mut(user)?;
        let crate::NodeKind::Apply(inputs) = &mut node.kind else {
            return Err(IrError::NotAnApply(user));
        };
        let len = inputs.len();
        let slot = inputs
            .get_mut(index)
            .ok_or(IrError::InputIndexOutOfRange {
                node: user,
                index,
                len,
            })?;
        *slot = new;
        self.dirty = true;
        Ok(())
    }

    /// Rewire every tracked use of `old` to `new`. Returns whether anything changed.
    pub fn replace(&mut self, old: NodeId, new: NodeId) -> Result<bool, IrError> {
        if old == new {
            return Ok(false);
        }
        self.module.node(new)?;
        let uses = self.node_users(old)?;
        for node_use in &uses {
            self.set_edge(node_use.user, node_use.index, new)?;
        }
        Ok(!uses.is_empty())
    }
}
