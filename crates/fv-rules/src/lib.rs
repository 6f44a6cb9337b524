#![forbid(unsafe_code)]

//! Registered batching rules.
//!
//! A rule is a graph builder: given the primitive and the axis size of the
//! current vmap scope it emits a fresh graph into the module. Rule graphs
//! take one `(value, axis)` tuple per operand, plus the universe monad for
//! side-effect variants, and return a `(value, axis)` tuple.

use fv_core::{Constant, GraphId, IrError, Module, NodeId, Primitive};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RuleVariant {
    Pure,
    /// Threads the universe monad through the rewritten call.
    SideEffect,
}

impl RuleVariant {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pure => "pure",
            Self::SideEffect => "side_effect",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleRequest {
    pub primitive: Primitive,
    pub axis_size: usize,
}

pub type RuleBuilder = fn(&mut Module, RuleRequest) -> Result<GraphId, RuleError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleError {
    Ir(IrError),
    /// A builder was registered for a primitive it cannot express.
    BuilderMismatch {
        primitive: Primitive,
        builder: &'static str,
    },
}

impl std::fmt::Display for RuleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ir(err) => write!(f, "rule graph construction failed: {err}"),
            Self::BuilderMismatch { primitive, builder } => write!(
                f,
                "{} rule builder cannot batch primitive {}",
                builder,
                primitive.as_str()
            ),
        }
    }
}

impl std::error::Error for RuleError {}

impl From<IrError> for RuleError {
    fn from(value: IrError) -> Self {
        Self::Ir(value)
    }
}

// ── Registry ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct RuleRegistry {
    rules: FxHashMap<(Primitive, RuleVariant), RuleBuilder>,
}

pub const UNARY_ELEMENTWISE: [Primitive; 8] = [
    Primitive::Neg,
    Primitive::Abs,
    Primitive::Exp,
    Primitive::Log,
    Primitive::Sin,
    Primitive::Cos,
    Primitive::Tanh,
    Primitive::Sqrt,
];

pub const BINARY_ELEMENTWISE: [Primitive; 6] = [
    Primitive::Add,
    Primitive::Sub,
    Primitive::Mul,
    Primitive::Div,
    Primitive::Max,
    Primitive::Min,
];

impl RuleRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_default_rules() -> Self {
        let mut registry = Self::new();
        for primitive in UNARY_ELEMENTWISE {
            registry.register(primitive, RuleVariant::Pure, unary_elementwise_rule);
        }
        for primitive in BINARY_ELEMENTWISE {
            registry.register(primitive, RuleVariant::Pure, binary_elementwise_rule);
        }
        registry.register(Primitive::Assign, RuleVariant::SideEffect, assign_rule);
        registry
    }

    /// Install `builder`, returning the one it displaced.
    pub fn register(
        &mut self,
        primitive: Primitive,
        variant: RuleVariant,
        builder: RuleBuilder,
    ) -> Option<RuleBuilder> {
        self.rules.insert((primitive, variant), builder)
    }

    #[must_use]
    pub fn lookup(&self, primitive: Primitive, variant: RuleVariant) -> Option<RuleBuilder> {
        self.rules.get(&(primitive, variant)).copied()
    }

    #[must_use]
    pub fn contains(&self, primitive: Primitive, variant: RuleVariant) -> bool {
        self.rules.contains_key(&(primitive, variant))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Registered keys in a stable order.
    #[must_use]
    pub fn registered(&self) -> Vec<(Primitive, RuleVariant)> {
        let mut keys: Vec<_> = self.rules.keys().copied().collect();
        keys.sort_unstable();
        keys
    }

    /// Build the rule graph for `primitive`, or `None` when nothing is registered.
    pub fn build(
        &self,
        module: &mut Module,
        primitive: Primitive,
        variant: RuleVariant,
        axis_size: usize,
    ) -> Result<Option<GraphId>, RuleError> {
        match self.lookup(primitive, variant) {
            Some(builder) => builder(
                module,
                RuleRequest {
                    primitive,
                    axis_size,
                },
            )
            .map(Some),
            None => Ok(None),
        }
    }
}

// ── Rule Graph Builders ────────────────────────────────────────────

fn rule_graph_name(request: RuleRequest) -> String {
    format!("vmap_rule_{}", request.primitive.as_str())
}

/// `tuple_getitem(pair, 0)` and `tuple_getitem(pair, 1)`.
fn split_pair(
    module: &mut Module,
    graph: GraphId,
    pair: NodeId,
) -> Result<(NodeId, NodeId), IrError> {
    let zero = module.new_constant(Constant::i64(0));
    let one = module.new_constant(Constant::i64(1));
    let value = module.new_primitive_apply(graph, Primitive::TupleGetItem, &[pair, zero])?;
    let axis = module.new_primitive_apply(graph, Primitive::TupleGetItem, &[pair, one])?;
    Ok((value, axis))
}

/// Elementwise unary ops keep the operand's batch axis where it is.
fn unary_elementwise_rule(module: &mut Module, request: RuleRequest) -> Result<GraphId, RuleError> {
    if !UNARY_ELEMENTWISE.contains(&request.primitive) {
        return Err(RuleError::BuilderMismatch {
            primitive: request.primitive,
            builder: "unary_elementwise",
        });
    }
    let graph = module.new_graph(rule_graph_name(request), None);
    let operand = module.add_parameter(graph)?;
    let (value, axis) = split_pair(module, graph, operand)?;
    let out = module.new_primitive_apply(graph, request.primitive, &[value])?;
    let result = module.new_primitive_apply(graph, Primitive::MakeTuple, &[out, axis])?;
    module.set_output(graph, result)?;
    Ok(graph)
}

/// Both operands are moved (or broadcast) to a leading batch axis of
/// `axis_size`, so the result is batched at axis 0.
fn binary_elementwise_rule(
    module: &mut Module,
    request: RuleRequest,
) -> Result<GraphId, RuleError> {
    if !BINARY_ELEMENTWISE.contains(&request.primitive) {
        return Err(RuleError::BuilderMismatch {
            primitive: request.primitive,
            builder: "binary_elementwise",
        });
    }
    let graph = module.new_graph(rule_graph_name(request), None);
    let lhs = module.add_parameter(graph)?;
    let rhs = module.add_parameter(graph)?;
    let size = module.new_constant(Constant::i64(request.axis_size as i64));
    let lhs = module.new_primitive_apply(graph, Primitive::BdimAtFront, &[lhs, size])?;
    let rhs = module.new_primitive_apply(graph, Primitive::BdimAtFront, &[rhs, size])?;
    let out = module.new_primitive_apply(graph, request.primitive, &[lhs, rhs])?;
    let front = module.new_constant(Constant::i64(0));
    let result = module.new_primitive_apply(graph, Primitive::MakeTuple, &[out, front])?;
    module.set_output(graph, result)?;
    Ok(graph)
}

/// `assign(ref, value, u)`: the stored value is moved to the front, so the
/// ref is expected to carry its batch axis at 0.
fn assign_rule(module: &mut Module, request: RuleRequest) -> Result<GraphId, RuleError> {
    if request.primitive != Primitive::Assign {
        return Err(RuleError::BuilderMismatch {
            primitive: request.primitive,
            builder: "assign",
        });
    }
    let graph = module.new_graph(rule_graph_name(request), None);
    let target = module.add_parameter(graph)?;
    let source = module.add_parameter(graph)?;
    let monad = module.add_parameter(graph)?;
    let (target_value, target_axis) = split_pair(module, graph, target)?;
    let size = module.new_constant(Constant::i64(request.axis_size as i64));
    let source = module.new_primitive_apply(graph, Primitive::BdimAtFront, &[source, size])?;
    let stored =
        module.new_primitive_apply(graph, Primitive::Assign, &[target_value, source, monad])?;
    let result = module.new_primitive_apply(graph, Primitive::MakeTuple, &[stored, target_axis])?;
    module.set_output(graph, result)?;
    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::{
        BINARY_ELEMENTWISE, RuleError, RuleRegistry, RuleRequest, RuleVariant, UNARY_ELEMENTWISE,
        binary_elementwise_rule,
    };
    use fv_core::{Module, Primitive};
    use proptest::prelude::*;

    #[test]
    fn default_registry_covers_elementwise_and_assign() {
        let registry = RuleRegistry::with_default_rules();
        assert_eq!(registry.len(), 15);
        for primitive in UNARY_ELEMENTWISE.into_iter().chain(BINARY_ELEMENTWISE) {
            assert!(registry.contains(primitive, RuleVariant::Pure));
            assert!(!registry.contains(primitive, RuleVariant::SideEffect));
        }
        assert!(registry.contains(Primitive::Assign, RuleVariant::SideEffect));
        assert!(registry.lookup(Primitive::MatMul, RuleVariant::Pure).is_none());
        assert_eq!(
            registry.registered().first(),
            Some(&(Primitive::Add, RuleVariant::Pure))
        );
    }

    #[test]
    fn unary_rule_keeps_operand_axis() {
        let registry = RuleRegistry::with_default_rules();
        let mut module = Module::new();
        let graph = registry
            .build(&mut module, Primitive::Neg, RuleVariant::Pure, 8)
            .expect("build")
            .expect("registered");
        assert_eq!(module.validate_graph(graph), Ok(()));
        assert_eq!(
            module.fingerprint(graph).expect("fingerprint"),
            "vmap_rule_neg(p0) { a0 = tuple_getitem(p0, i64:0); a1 = neg(a0); \
             a2 = tuple_getitem(p0, i64:1); a3 = make_tuple(a1, a2); a4 = return(a3); }"
        );
    }

    #[test]
    fn binary_rule_moves_both_operands_to_front() {
        let registry = RuleRegistry::with_default_rules();
        let mut module = Module::new();
        let graph = registry
            .build(&mut module, Primitive::Add, RuleVariant::Pure, 4)
            .expect("build")
            .expect("registered");
        assert_eq!(
            module.fingerprint(graph).expect("fingerprint"),
            "vmap_rule_add(p0, p1) { a0 = bdim_at_front(p0, i64:4); a1 = bdim_at_front(p1, i64:4); \
             a2 = add(a0, a1); a3 = make_tuple(a2, i64:0); a4 = return(a3); }"
        );
    }

    #[test]
    fn assign_rule_threads_the_monad() {
        let registry = RuleRegistry::with_default_rules();
        let mut module = Module::new();
        let graph = registry
            .build(&mut module, Primitive::Assign, RuleVariant::SideEffect, 3)
            .expect("build")
            .expect("registered");
        assert_eq!(module.graph(graph).expect("graph").parameters.len(), 3);
        let text = module.fingerprint(graph).expect("fingerprint");
        assert!(text.contains("assign(a0, a1, p2)"), "{text}");
        assert!(text.contains("bdim_at_front(p1, i64:3)"), "{text}");
    }

    #[test]
    fn unregistered_primitive_builds_nothing() {
        let registry = RuleRegistry::with_default_rules();
        let mut module = Module::new();
        assert_eq!(
            registry.build(&mut module, Primitive::Reshape, RuleVariant::Pure, 2),
            Ok(None)
        );
        assert_eq!(module.graph_count(), 0);
    }

    #[test]
    fn mismatched_builder_is_reported() {
        let mut registry = RuleRegistry::new();
        assert!(registry.is_empty());
        assert!(
            registry
                .register(Primitive::Exp, RuleVariant::Pure, binary_elementwise_rule)
                .is_none()
        );
        let mut module = Module::new();
        let err = registry
            .build(&mut module, Primitive::Exp, RuleVariant::Pure, 2)
            .expect_err("exp is not binary");
        assert_eq!(
            err,
            RuleError::BuilderMismatch {
                primitive: Primitive::Exp,
                builder: "binary_elementwise"
            }
        );
        assert_eq!(
            err.to_string(),
            "binary_elementwise rule builder cannot batch primitive exp"
        );
    }

    #[test]
    fn request_is_forwarded_to_custom_builders() {
        fn marker_rule(
            module: &mut Module,
            request: RuleRequest,
        ) -> Result<fv_core::GraphId, RuleError> {
            let graph = module.new_graph(format!("custom_{}", request.axis_size), None);
            let p = module.add_parameter(graph)?;
            module.set_output(graph, p)?;
            Ok(graph)
        }
        let mut registry = RuleRegistry::with_default_rules();
        assert!(
            registry
                .register(Primitive::Neg, RuleVariant::Pure, marker_rule)
                .is_some()
        );
        let mut module = Module::new();
        let graph = registry
            .build(&mut module, Primitive::Neg, RuleVariant::Pure, 7)
            .expect("build")
            .expect("registered");
        assert_eq!(module.graph(graph).expect("graph").name, "custom_7");
    }

    proptest! {
        #[test]
        fn every_default_rule_builds_a_valid_graph(axis_size in 1usize..64) {
            let registry = RuleRegistry::with_default_rules();
            let mut module = Module::new();
            for (primitive, variant) in registry.registered() {
                let graph = registry
                    .build(&mut module, primitive, variant, axis_size)
                    .expect("default rules build")
                    .expect("registered");
                prop_assert_eq!(module.validate_graph(graph), Ok(()));
            }
        }
    }
}
