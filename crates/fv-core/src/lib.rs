#![forbid(unsafe_code)]

pub mod axes;
pub mod manager;
pub mod module;

#[cfg(test)]
pub mod proptest_strategies;

pub use axes::{AxisError, AxisSpec};
pub use manager::{GraphManager, NodeUse};
pub use module::{Graph, GraphFlags, Module, Node, NodeKind};

use serde::{Deserialize, Serialize};
use std::fmt::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompatibilityMode {
    Strict,
    Hardened,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GraphId(pub u32);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "%{}", self.0)
    }
}

impl std::fmt::Display for GraphId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "@g{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F32,
    F64,
    I32,
    I64,
    Bool,
}

impl DType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::Bool => "bool",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    pub dims: Vec<u32>,
}

impl Shape {
    #[must_use]
    pub fn new(dims: &[u32]) -> Self {
        Self {
            dims: dims.to_vec(),
        }
    }

    #[must_use]
    pub fn scalar() -> Self {
        Self { dims: Vec::new() }
    }

    #[must_use]
    pub fn vector(len: u32) -> Self {
        Self { dims: vec![len] }
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.dims.len()
    }
}

/// Side-effect classification of a primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SideEffect {
    None,
    /// Reads or writes a parameter's memory; ordered by the universe monad.
    Memory,
    /// Observable outside the program; ordered by the I/O monad.
    Io,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Primitive {
    // Structural
    MakeTuple,
    MakeList,
    TupleGetItem,
    Depend,
    Return,
    UpdateState,
    StopGradient,
    // Elementwise
    Add,
    Sub,
    Mul,
    Div,
    Max,
    Min,
    Neg,
    Abs,
    Exp,
    Log,
    Sin,
    Cos,
    Tanh,
    Sqrt,
    Cast,
    // Linear algebra and layout
    MatMul,
    ReduceSum,
    Reshape,
    Transpose,
    // Vmap utility
    BdimAtFront,
    // Stateful
    Assign,
    ScatterNdUpdate,
    Print,
    TensorDump,
}

impl Primitive {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MakeTuple => "make_tuple",
            Self::MakeList => "make_list",
            Self::TupleGetItem => "tuple_getitem",
            Self::Depend => "depend",
            Self::Return => "return",
            Self::UpdateState => "update_state",
            Self::StopGradient => "stop_gradient",
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
            Self::Max => "max",
            Self::Min => "min",
            Self::Neg => "neg",
            Self::Abs => "abs",
            Self::Exp => "exp",
            Self::Log => "log",
            Self::Sin => "sin",
            Self::Cos => "cos",
            Self::Tanh => "tanh",
            Self::Sqrt => "sqrt",
            Self::Cast => "cast",
            Self::MatMul => "matmul",
            Self::ReduceSum => "reduce_sum",
            Self::Reshape => "reshape",
            Self::Transpose => "transpose",
            Self::BdimAtFront => "bdim_at_front",
            Self::Assign => "assign",
            Self::ScatterNdUpdate => "scatter_nd_update",
            Self::Print => "print",
            Self::TensorDump => "tensor_dump",
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|prim| prim.as_str() == name)
    }

    pub const ALL: [Primitive; 31] = [
        Self::MakeTuple,
        Self::MakeList,
        Self::TupleGetItem,
        Self::Depend,
        Self::Return,
        Self::UpdateState,
        Self::StopGradient,
        Self::Add,
        Self::Sub,
        Self::Mul,
        Self::Div,
        Self::Max,
        Self::Min,
        Self::Neg,
        Self::Abs,
        Self::Exp,
        Self::Log,
        Self::Sin,
        Self::Cos,
        Self::Tanh,
        Self::Sqrt,
        Self::Cast,
        Self::MatMul,
        Self::ReduceSum,
        Self::Reshape,
        Self::Transpose,
        Self::BdimAtFront,
        Self::Assign,
        Self::ScatterNdUpdate,
        Self::Print,
        Self::TensorDump,
    ];

    #[must_use]
    pub fn side_effect(self) -> SideEffect {
        match self {
            Self::Assign | Self::ScatterNdUpdate => SideEffect::Memory,
            Self::Print | Self::TensorDump => SideEffect::Io,
            Self::MakeTuple
            | Self::MakeList
            | Self::TupleGetItem
            | Self::Depend
            | Self::Return
            | Self::UpdateState
            | Self::StopGradient
            | Self::Add
            | Self::Sub
            | Self::Mul
            | Self::Div
            | Self::Max
            | Self::Min
            | Self::Neg
            | Self::Abs
            | Self::Exp
            | Self::Log
            | Self::Sin
            | Self::Cos
            | Self::Tanh
            | Self::Sqrt
            | Self::Cast
            | Self::MatMul
            | Self::ReduceSum
            | Self::Reshape
            | Self::Transpose
            | Self::BdimAtFront => SideEffect::None,
        }
    }

    /// Primitives that hand an updated ref back to the caller; their rule
    /// graphs must have monads re-inserted after the rewrite.
    #[must_use]
    pub fn propagates_side_effect(self) -> bool {
        matches!(self, Self::Assign | Self::ScatterNdUpdate)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Literal {
    I64(i64),
    Bool(bool),
    F64Bits(u64),
}

impl Literal {
    #[must_use]
    pub fn from_f64(value: f64) -> Self {
        Self::F64Bits(value.to_bits())
    }

    #[must_use]
    pub fn as_i64(self) -> Option<i64> {
        match self {
            Self::I64(value) => Some(value),
            Self::Bool(_) | Self::F64Bits(_) => None,
        }
    }

    #[must_use]
    pub fn dtype(self) -> DType {
        match self {
            Self::I64(_) => DType::I64,
            Self::Bool(_) => DType::Bool,
            Self::F64Bits(_) => DType::F64,
        }
    }
}

/// Metadata of a tensor constant. Element storage lives with the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorConst {
    pub dtype: DType,
    pub shape: Shape,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MonadKind {
    Universe,
    Io,
}

/// Function objects produced by the vmap pass itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetaOp {
    GeneralRule { primitive: Primitive, axis_size: usize },
    MonadRule { primitive: Primitive, axis_size: usize },
    MatchOutAxis,
    /// An inner vmap's meta function batched again by an enclosing vmap.
    NestedRule { inner: Box<MetaOp>, axis_size: usize },
}

impl MetaOp {
    /// Wrap `self` for an enclosing vmap of `axis_size`.
    #[must_use]
    pub fn nested(self, axis_size: usize) -> Self {
        Self::NestedRule {
            inner: Box::new(self),
            axis_size,
        }
    }
}

impl std::fmt::Display for MetaOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GeneralRule {
                primitive,
                axis_size,
            } => write!(f, "general_rule[{},{}]", primitive.as_str(), axis_size),
            Self::MonadRule {
                primitive,
                axis_size,
            } => write!(f, "monad_rule[{},{}]", primitive.as_str(), axis_size),
            Self::MatchOutAxis => f.write_str("match_out_axis"),
            Self::NestedRule { inner, axis_size } => {
                write!(f, "nested_rule[{inner},{axis_size}]")
            }
        }
    }
}

/// Axis attributes of a vmap operator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VmapSpec {
    pub in_axes: AxisSpec,
    pub out_axes: AxisSpec,
}

impl Default for VmapSpec {
    fn default() -> Self {
        Self {
            in_axes: AxisSpec::Axis(0),
            out_axes: AxisSpec::Axis(0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Constant {
    Primitive(Primitive),
    Vmap(VmapSpec),
    Graph(GraphId),
    Scalar(Literal),
    Tensor(TensorConst),
    None,
    Tuple(Vec<Constant>),
    Type(DType),
    Str(String),
    Monad(MonadKind),
    Meta(MetaOp),
    /// Host object carried through the IR without batching semantics.
    Opaque(String),
}

impl Constant {
    #[must_use]
    pub fn i64(value: i64) -> Self {
        Self::Scalar(Literal::I64(value))
    }

    #[must_use]
    pub fn as_graph(&self) -> Option<GraphId> {
        match self {
            Self::Graph(graph) => Some(*graph),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_primitive(&self) -> Option<Primitive> {
        match self {
            Self::Primitive(prim) => Some(*prim),
            _ => None,
        }
    }

    #[must_use]
    pub fn abstract_value(&self) -> Option<AbstractValue> {
        match self {
            Self::Scalar(lit) => Some(AbstractValue::Scalar(lit.dtype())),
            Self::Tensor(tensor) => Some(AbstractValue::Tensor {
                dtype: tensor.dtype,
                shape: tensor.shape.clone(),
            }),
            Self::None => Some(AbstractValue::None),
            Self::Tuple(items) => items
                .iter()
                .map(Self::abstract_value)
                .collect::<Option<Vec<_>>>()
                .map(AbstractValue::Tuple),
            Self::Monad(kind) => Some(AbstractValue::Monad(*kind)),
            Self::Primitive(_) | Self::Vmap(_) | Self::Graph(_) | Self::Meta(_) => {
                Some(AbstractValue::Function)
            }
            Self::Type(_) | Self::Str(_) | Self::Opaque(_) => None,
        }
    }
}

impl std::fmt::Display for Constant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Primitive(prim) => f.write_str(prim.as_str()),
            Self::Vmap(spec) => write!(f, "vmap[in={},out={}]", spec.in_axes, spec.out_axes),
            Self::Graph(graph) => write!(f, "{graph}"),
            Self::Scalar(Literal::I64(value)) => write!(f, "i64:{value}"),
            Self::Scalar(Literal::Bool(value)) => write!(f, "bool:{value}"),
            Self::Scalar(Literal::F64Bits(bits)) => write!(f, "f64:{}", f64::from_bits(*bits)),
            Self::Tensor(tensor) => {
                write!(f, "tensor<{}{:?}>", tensor.dtype.as_str(), tensor.shape.dims)
            }
            Self::None => f.write_str("none"),
            Self::Tuple(items) => {
                f.write_str("(")?;
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str(")")
            }
            Self::Type(dtype) => write!(f, "type:{}", dtype.as_str()),
            Self::Str(text) => write!(f, "str:{text:?}"),
            Self::Monad(MonadKind::Universe) => f.write_str("U"),
            Self::Monad(MonadKind::Io) => f.write_str("IO"),
            Self::Meta(meta) => write!(f, "{meta}"),
            Self::Opaque(name) => write!(f, "opaque:{name}"),
        }
    }
}

/// Shape/type abstraction attached to a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AbstractValue {
    Tensor { dtype: DType, shape: Shape },
    Scalar(DType),
    Tuple(Vec<AbstractValue>),
    List(Vec<AbstractValue>),
    Monad(MonadKind),
    None,
    Function,
}

impl AbstractValue {
    #[must_use]
    pub fn tensor(dtype: DType, dims: &[u32]) -> Self {
        Self::Tensor {
            dtype,
            shape: Shape::new(dims),
        }
    }

    #[must_use]
    pub fn is_monad(&self) -> bool {
        matches!(self, Self::Monad(_))
    }

    #[must_use]
    pub fn is_universe_monad(&self) -> bool {
        matches!(self, Self::Monad(MonadKind::Universe))
    }

    /// The dimension extents, if this abstraction carries a shape.
    #[must_use]
    pub fn shape(&self) -> Option<&Shape> {
        match self {
            Self::Tensor { shape, .. } => Some(shape),
            _ => None,
        }
    }

    #[must_use]
    pub fn rank(&self) -> Option<usize> {
        match self {
            Self::Tensor { shape, .. } => Some(shape.rank()),
            Self::Scalar(_) => Some(0),
            _ => None,
        }
    }

    /// Elements of a tuple or list abstraction.
    #[must_use]
    pub fn sequence_elements(&self) -> Option<&[AbstractValue]> {
        match self {
            Self::Tuple(items) | Self::List(items) => Some(items),
            _ => None,
        }
    }

    #[must_use]
    pub fn tuple_elements(&self) -> Option<&[AbstractValue]> {
        match self {
            Self::Tuple(items) => Some(items),
            _ => None,
        }
    }
}

impl std::fmt::Display for AbstractValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tensor { dtype, shape } => write!(f, "{}{:?}", dtype.as_str(), shape.dims),
            Self::Scalar(dtype) => f.write_str(dtype.as_str()),
            Self::Tuple(items) | Self::List(items) => {
                let (open, close) = if matches!(self, Self::Tuple(_)) {
                    ('(', ')')
                } else {
                    ('[', ']')
                };
                let mut out = String::new();
                out.push(open);
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        out.push_str(", ");
                    }
                    let _ = write!(&mut out, "{item}");
                }
                out.push(close);
                f.write_str(&out)
            }
            Self::Monad(MonadKind::Universe) => f.write_str("UMonad"),
            Self::Monad(MonadKind::Io) => f.write_str("IOMonad"),
            Self::None => f.write_str("None"),
            Self::Function => f.write_str("Func"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IrError {
    UnknownNode(NodeId),
    UnknownGraph(GraphId),
    NotAnApply(NodeId),
    EmptyApply,
    InputIndexOutOfRange {
        node: NodeId,
        index: usize,
        len: usize,
    },
    MissingOutput(GraphId),
    MalformedReturn {
        graph: GraphId,
        node: NodeId,
    },
    ParameterOwnership {
        graph: GraphId,
        node: NodeId,
    },
}

impl std::fmt::Display for IrError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownNode(node) => write!(f, "unknown node {node}"),
            Self::UnknownGraph(graph) => write!(f, "unknown graph {graph}"),
            Self::NotAnApply(node) => write!(f, "node {node} is not an apply node"),
            Self::EmptyApply => write!(f, "apply node requires at least an operator input"),
            Self::InputIndexOutOfRange { node, index, len } => write!(
                f,
                "input index {} out of range for node {} with {} inputs",
                index, node, len
            ),
            Self::MissingOutput(graph) => write!(f, "graph {graph} has no output"),
            Self::MalformedReturn { graph, node } => write!(
                f,
                "return node {} of graph {} is not [return, value]",
                node, graph
            ),
            Self::ParameterOwnership { graph, node } => write!(
                f,
                "parameter {} listed by graph {} is owned elsewhere",
                node, graph
            ),
        }
    }
}

impl std::error::Error for IrError {}

#[cfg(test)]
mod tests {
    use super::{
        AbstractValue, Constant, DType, Literal, MetaOp, MonadKind, Primitive, SideEffect,
        TensorConst,
    };
    use crate::proptest_strategies::{dtype_strategy, shape_strategy};
    use proptest::prelude::*;

    #[test]
    fn primitive_names_round_trip() {
        for prim in Primitive::ALL {
            assert_eq!(Primitive::from_name(prim.as_str()), Some(prim));
        }
        assert_eq!(Primitive::from_name("no_such_op"), None);
    }

    #[test]
    fn side_effect_classification_is_closed() {
        assert_eq!(Primitive::Assign.side_effect(), SideEffect::Memory);
        assert_eq!(Primitive::Print.side_effect(), SideEffect::Io);
        assert_eq!(Primitive::TensorDump.side_effect(), SideEffect::Io);
        assert_eq!(Primitive::Add.side_effect(), SideEffect::None);
        assert!(Primitive::ScatterNdUpdate.propagates_side_effect());
        assert!(!Primitive::Print.propagates_side_effect());
    }

    #[test]
    fn constant_abstractions_follow_value_kind() {
        assert_eq!(
            Constant::i64(3).abstract_value(),
            Some(AbstractValue::Scalar(DType::I64))
        );
        assert_eq!(
            Constant::Monad(MonadKind::Universe).abstract_value(),
            Some(AbstractValue::Monad(MonadKind::Universe))
        );
        assert_eq!(
            Constant::Tuple(vec![Constant::Scalar(Literal::Bool(true)), Constant::None])
                .abstract_value(),
            Some(AbstractValue::Tuple(vec![
                AbstractValue::Scalar(DType::Bool),
                AbstractValue::None
            ]))
        );
        assert_eq!(Constant::Str("x".to_owned()).abstract_value(), None);
    }

    #[test]
    fn constant_display_is_stable() {
        assert_eq!(Constant::Primitive(Primitive::Add).to_string(), "add");
        assert_eq!(
            Constant::Tuple(vec![Constant::i64(1), Constant::None]).to_string(),
            "(i64:1, none)"
        );
        assert_eq!(
            Constant::Meta(MetaOp::GeneralRule {
                primitive: Primitive::MatMul,
                axis_size: 4
            })
            .to_string(),
            "general_rule[matmul,4]"
        );
        assert_eq!(
            Constant::Meta(MetaOp::MatchOutAxis.nested(2).nested(5)).to_string(),
            "nested_rule[nested_rule[match_out_axis,2],5]"
        );
    }

    #[test]
    fn abstract_rank_covers_scalars_and_tensors() {
        assert_eq!(AbstractValue::tensor(DType::F32, &[8, 4]).rank(), Some(2));
        assert_eq!(AbstractValue::Scalar(DType::F32).rank(), Some(0));
        assert_eq!(AbstractValue::None.rank(), None);
        assert_eq!(
            AbstractValue::Tuple(vec![AbstractValue::None]).to_string(),
            "(None)"
        );
    }

    proptest! {
        #[test]
        fn tensor_constants_abstract_to_their_shape(
            dtype in dtype_strategy(),
            shape in shape_strategy(5),
        ) {
            let rank = shape.rank();
            let constant = Constant::Tensor(TensorConst { dtype, shape: shape.clone() });
            let abstract_value = constant.abstract_value().expect("tensors have an abstraction");
            prop_assert_eq!(abstract_value.rank(), Some(rank));
            prop_assert_eq!(abstract_value.shape(), Some(&shape));
        }
    }
}
