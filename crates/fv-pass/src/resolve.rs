//! Maps a primitive to the function that batches it.

use crate::{PassConfig, VmapError};
use fv_core::{GraphId, MetaOp, Module, Primitive, SideEffect};
use fv_rules::{RuleRegistry, RuleVariant};
use tracing::debug;

/// Structural primitives that are axis-agnostic and stay as they are.
pub const PASS_THROUGH: [Primitive; 6] = [
    Primitive::MakeTuple,
    Primitive::MakeList,
    Primitive::Depend,
    Primitive::Return,
    Primitive::UpdateState,
    Primitive::StopGradient,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    PassThrough,
    /// A freshly built rule graph from the registry.
    Rule(GraphId),
    /// No registered rule; a generic meta rule stands in.
    Fallback(MetaOp),
}

#[must_use]
pub fn is_pass_through(primitive: Primitive) -> bool {
    PASS_THROUGH.contains(&primitive)
}

pub fn resolve_primitive(
    module: &mut Module,
    registry: &RuleRegistry,
    config: &PassConfig,
    primitive: Primitive,
    axis_size: usize,
) -> Result<Resolution, VmapError> {
    if is_pass_through(primitive) {
        return Ok(Resolution::PassThrough);
    }

    let variant = match primitive.side_effect() {
        SideEffect::None => RuleVariant::Pure,
        SideEffect::Memory => RuleVariant::SideEffect,
        SideEffect::Io if config.allows_io(primitive) => RuleVariant::Pure,
        SideEffect::Io => return Err(VmapError::IoSideEffect { primitive }),
    };

    if let Some(graph) = registry.build(module, primitive, variant, axis_size)? {
        if primitive.propagates_side_effect() {
            module.graph_mut(graph)?.flags.re_auto_monad = true;
        }
        return Ok(Resolution::Rule(graph));
    }

    debug!(
        primitive = primitive.as_str(),
        variant = variant.as_str(),
        axis_size,
        "no registered vmap rule, falling back to the general rule"
    );
    Ok(Resolution::Fallback(match variant {
        RuleVariant::Pure => MetaOp::GeneralRule {
            primitive,
            axis_size,
        },
        RuleVariant::SideEffect => MetaOp::MonadRule {
            primitive,
            axis_size,
        },
    }))
}
