#![forbid(unsafe_code)]

//! Vectorizing-map elimination.
//!
//! Every apply of a `vmap` operator is rewritten into an apply of an
//! ordinary closure: arguments are paired with their batch axes, the mapped
//! closure is expanded so that each primitive goes through its batching
//! rule, and the result is wrapped to honor `out_axes`.

pub mod axis;
pub mod bind;
pub mod config;
pub mod expand;
pub mod matcher;
pub mod report;
pub mod resolve;

pub use axis::{CallAxes, resolve_call_axes};
pub use bind::{BoundCall, MonadLayout, bind_in_axis};
pub use config::PassConfig;
pub use expand::{ExpandCtx, ExpandStats};
pub use matcher::match_out_axis;
pub use report::{SiteReport, VmapPassReport, module_digest};
pub use resolve::{Resolution, resolve_primitive};

use fv_core::{
    AxisError, Constant, GraphId, GraphManager, IrError, Module, NodeId, Primitive, VmapSpec,
};
use fv_rules::{RuleError, RuleRegistry};
use rustc_hash::FxHashSet;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Malformed axes, arguments, or options supplied by the caller.
    InputContract,
    /// Constructs vmap has no semantics for.
    Unsupported,
    /// Internal consistency of the graph was broken.
    Invariant,
}

impl ErrorCategory {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InputContract => "input_contract",
            Self::Unsupported => "unsupported",
            Self::Invariant => "invariant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmapError {
    Ir(IrError),
    Rule(RuleError),
    Axis {
        node: NodeId,
        source: AxisError,
    },
    AxisLengthMismatch {
        node: NodeId,
        expected: usize,
        found: usize,
    },
    AxisOnUnshapedValue {
        node: NodeId,
        abstract_value: String,
    },
    AxisSizeMismatch {
        node: NodeId,
        expected: usize,
        found: usize,
    },
    AxisSizeUnknown {
        call: NodeId,
    },
    MissingAbstract {
        node: NodeId,
    },
    NoUsers {
        vmap_node: NodeId,
    },
    MalformedCall {
        vmap_node: NodeId,
        user: NodeId,
        index: usize,
    },
    MalformedVmap {
        node: NodeId,
    },
    NotAGraph {
        vmap_node: NodeId,
    },
    IoSideEffect {
        primitive: Primitive,
    },
    UnsupportedNode {
        node: NodeId,
        detail: String,
    },
    UnknownOptions {
        keys: Vec<String>,
    },
    InvalidOption {
        key: String,
        value: String,
        detail: &'static str,
    },
    SweepLimit {
        max_sweeps: usize,
    },
}

impl VmapError {
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Ir(_)
            | Self::AxisSizeMismatch { .. }
            | Self::NoUsers { .. }
            | Self::SweepLimit { .. } => ErrorCategory::Invariant,
            Self::Rule(_)
            | Self::IoSideEffect { .. }
            | Self::UnsupportedNode { .. }
            | Self::NotAGraph { .. } => ErrorCategory::Unsupported,
            Self::Axis { .. }
            | Self::AxisLengthMismatch { .. }
            | Self::AxisOnUnshapedValue { .. }
            | Self::AxisSizeUnknown { .. }
            | Self::MissingAbstract { .. }
            | Self::MalformedCall { .. }
            | Self::MalformedVmap { .. }
            | Self::UnknownOptions { .. }
            | Self::InvalidOption { .. } => ErrorCategory::InputContract,
        }
    }
}

impl std::fmt::Display for VmapError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ir(err) => write!(f, "ir error: {err}"),
            Self::Rule(err) => write!(f, "vmap rule error: {err}"),
            Self::Axis { node, source } => write!(f, "invalid axis for node {node}: {source}"),
            Self::AxisLengthMismatch {
                node,
                expected,
                found,
            } => write!(
                f,
                "axis spec for node {node} has {found} entries but the value has {expected} elements"
            ),
            Self::AxisOnUnshapedValue {
                node,
                abstract_value,
            } => write!(
                f,
                "axis spec does not fit node {node} with abstract value {abstract_value}"
            ),
            Self::AxisSizeMismatch {
                node,
                expected,
                found,
            } => write!(
                f,
                "inconsistent axis size at node {node}: expected {expected}, found {found}"
            ),
            Self::AxisSizeUnknown { call } => write!(
                f,
                "failed to get axis size for vmap call {call}: no argument is batched"
            ),
            Self::MissingAbstract { node } => {
                write!(f, "argument {node} of a vmap call has no abstract value")
            }
            Self::NoUsers { vmap_node } => write!(f, "vmap node {vmap_node} has no users"),
            Self::MalformedCall {
                vmap_node,
                user,
                index,
            } => write!(
                f,
                "vmap node {vmap_node} is used by {user} at input {index}, expected the operator slot"
            ),
            Self::MalformedVmap { node } => write!(
                f,
                "vmap node {node} must apply the vmap operator to exactly one closure"
            ),
            Self::NotAGraph { vmap_node } => write!(
                f,
                "vmap node {vmap_node} maps over a value that is not a closure graph"
            ),
            Self::IoSideEffect { primitive } => write!(
                f,
                "primitive {} has an I/O side effect and cannot be batched",
                primitive.as_str()
            ),
            Self::UnsupportedNode { node, detail } => {
                write!(f, "vmap does not support node {node} ({detail})")
            }
            Self::UnknownOptions { keys } => write!(
                f,
                "strict mode rejected unknown vmap options: {}",
                keys.join(",")
            ),
            Self::InvalidOption { key, value, detail } => {
                write!(f, "invalid value {value:?} for option {key}: {detail}")
            }
            Self::SweepLimit { max_sweeps } => write!(
                f,
                "vmap sites were still pending after {max_sweeps} sweeps"
            ),
        }
    }
}

impl std::error::Error for VmapError {}

impl From<IrError> for VmapError {
    fn from(value: IrError) -> Self {
        Self::Ir(value)
    }
}

impl From<RuleError> for VmapError {
    fn from(value: RuleError) -> Self {
        Self::Rule(value)
    }
}

// ── Site discovery ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
struct VmapSite {
    node: NodeId,
    spec: VmapSpec,
    closure: GraphId,
}

/// Graphs reachable from `root` through graph constants, `root` first.
fn scope_graphs(module: &Module, root: GraphId) -> Result<Vec<GraphId>, IrError> {
    let mut seen: FxHashSet<GraphId> = FxHashSet::default();
    let mut order = Vec::new();
    let mut stack = vec![root];
    while let Some(graph) = stack.pop() {
        if !seen.insert(graph) {
            continue;
        }
        order.push(graph);
        for node in module.value_nodes(graph)? {
            if let Some(child) = module.graph_constant(node)? {
                stack.push(child);
            }
        }
    }
    Ok(order)
}

fn scope_has_vmap(module: &Module, closure: GraphId) -> Result<bool, IrError> {
    for graph in scope_graphs(module, closure)? {
        for node in module.value_nodes(graph)? {
            if matches!(module.constant(node)?, Some(Constant::Vmap(_))) {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

fn find_sites(manager: &GraphManager) -> Result<Vec<VmapSite>, VmapError> {
    let module = manager.module();
    let mut sites = Vec::new();
    for graph in manager.managed_graphs()? {
        for apply in module.graph_applies(graph)? {
            let inputs = module.inputs(apply)?;
            let Some(Constant::Vmap(spec)) = module.constant(inputs[0])? else {
                continue;
            };
            if inputs.len() != 2 {
                return Err(VmapError::MalformedVmap { node: apply });
            }
            let closure = module
                .graph_constant(inputs[1])?
                .ok_or(VmapError::NotAGraph { vmap_node: apply })?;
            sites.push(VmapSite {
                node: apply,
                spec: spec.clone(),
                closure,
            });
        }
    }
    Ok(sites)
}

// ── Driver ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct VmapPass {
    config: PassConfig,
    registry: RuleRegistry,
}

impl VmapPass {
    #[must_use]
    pub fn new(config: PassConfig) -> Self {
        Self::with_registry(config, RuleRegistry::with_default_rules())
    }

    #[must_use]
    pub fn with_registry(config: PassConfig, registry: RuleRegistry) -> Self {
        Self { config, registry }
    }

    #[must_use]
    pub fn config(&self) -> &PassConfig {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &RuleRegistry {
        &self.registry
    }

    /// One sweep over every vmap site reachable from the managed roots.
    pub fn run(&self, manager: &mut GraphManager) -> Result<VmapPassReport, VmapError> {
        self.sweep(manager, 1)
    }

    /// Sweep until no deferred sites remain or a sweep changes nothing.
    pub fn run_to_fixpoint(&self, manager: &mut GraphManager) -> Result<VmapPassReport, VmapError> {
        let mut report = self.sweep(manager, 1)?;
        let mut progressed = report.changed();
        while progressed && report.deferred_sites > 0 {
            if report.sweeps >= self.config.max_sweeps {
                return Err(VmapError::SweepLimit {
                    max_sweeps: self.config.max_sweeps,
                });
            }
            let next = self.sweep(manager, report.sweeps + 1)?;
            progressed = next.changed();
            report.absorb(next);
        }
        Ok(report)
    }

    #[tracing::instrument(skip_all, fields(sweep = sweep))]
    fn sweep(&self, manager: &mut GraphManager, sweep: usize) -> Result<VmapPassReport, VmapError> {
        let roots = manager.roots().to_vec();
        let digest_before = module_digest(manager.module(), &roots)?;

        let mut sites = Vec::new();
        let mut deferred_sites = 0;
        for site in find_sites(manager)? {
            if scope_has_vmap(manager.module(), site.closure)? {
                debug!(vmap_node = %site.node, "closure holds another vmap, deferring");
                deferred_sites += 1;
                continue;
            }
            sites.extend(self.expand_site(manager, &site, sweep)?);
        }

        let digest_after = module_digest(manager.module(), &roots)?;
        info!(
            sweep,
            expanded = sites.len(),
            deferred = deferred_sites,
            "vmap sweep finished"
        );
        Ok(VmapPassReport {
            sweeps: 1,
            sites,
            deferred_sites,
            unknown_options: self.config.unknown_options.clone(),
            digest_before,
            digest_after,
        })
    }

    fn expand_site(
        &self,
        manager: &mut GraphManager,
        site: &VmapSite,
        sweep: usize,
    ) -> Result<Vec<SiteReport>, VmapError> {
        let users = manager.node_users(site.node)?;
        if users.is_empty() {
            return Err(VmapError::NoUsers {
                vmap_node: site.node,
            });
        }
        let fn_users = manager.graph_users(site.closure)?.len();
        let closure_name = manager.module().graph(site.closure)?.name.clone();

        let mut reports = Vec::with_capacity(users.len());
        for (position, node_use) in users.iter().enumerate() {
            if node_use.index != 0 {
                return Err(VmapError::MalformedCall {
                    vmap_node: site.node,
                    user: node_use.user,
                    index: node_use.index,
                });
            }
            let call = node_use.user;
            let last = position + 1 == users.len();
            let cloned = (users.len() > 1 && !last) || fn_users > 1;
            let target = if cloned {
                debug!(closure = %closure_name, %call, "closure has other users, cloning it");
                let copy = manager.module_mut().clone_graph(site.closure)?;
                manager.add_graph(copy)?;
                copy
            } else {
                site.closure
            };

            let axes = resolve_call_axes(manager.module(), call, &site.spec.in_axes)?;
            debug!(
                %call,
                axis_size = axes.axis_size,
                in_axes = %axes.in_axes_text(),
                "resolved call axes"
            );
            let parameters_size = manager.module().inputs(call)?.len() - 1;
            let bound = bind_in_axis(manager.module_mut(), call, &axes.in_axes)?;
            manager.replace(call, bound.node)?;

            let stats = {
                let mut ctx = ExpandCtx::new(manager, &self.registry, &self.config, axes.axis_size);
                ctx.expand_root(target)?;
                ctx.stats()
            };

            let wrapper = match_out_axis(
                manager.module_mut(),
                target,
                parameters_size,
                bound.monads.u_monad_offset,
                axes.axis_size,
                &site.spec.out_axes,
            )?;
            let wrapper_node = manager.module_mut().new_constant(Constant::Graph(wrapper));
            manager.set_edge(bound.node, 0, wrapper_node)?;

            reports.push(SiteReport {
                sweep,
                vmap_node: site.node,
                call_node: call,
                closure: closure_name.clone(),
                axis_size: axes.axis_size,
                in_axes: axes.in_axes_text(),
                cloned,
                primitives_rewritten: stats.primitives_rewritten,
                meta_ops_rewritten: stats.meta_ops_rewritten,
                constants_wrapped: stats.constants_wrapped,
                free_variables_bound: stats.free_variables_bound,
                graphs_cloned: stats.graphs_cloned,
            });
        }
        Ok(reports)
    }
}

/// Run the pass over `module` rooted at `root` until every site is expanded.
pub fn vmap_eliminate(
    module: Module,
    root: GraphId,
    config: PassConfig,
) -> Result<(Module, VmapPassReport), VmapError> {
    let mut manager = GraphManager::with_root(module, root)?;
    let report = VmapPass::new(config).run_to_fixpoint(&mut manager)?;
    Ok((manager.into_module(), report))
}
