//! Pairs every argument of a vmap call with its batch axis.

use crate::VmapError;
use fv_core::{AbstractValue, AxisSpec, Constant, GraphId, IrError, Module, NodeId, Primitive};
use smallvec::SmallVec;

/// Position of the trailing monad arguments of a call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonadLayout {
    /// Distance of the universe monad from the end of the inputs, 0 if absent.
    pub u_monad_offset: usize,
    /// Number of trailing monad inputs (0, 1 or 2).
    pub count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundCall {
    pub node: NodeId,
    pub monads: MonadLayout,
}

/// Inspect the last two inputs. A universe monad may be last, or
/// second-to-last followed by an I/O monad.
pub fn monad_layout(module: &Module, inputs: &[NodeId]) -> Result<MonadLayout, VmapError> {
    let kind = |index: usize| -> Result<(bool, bool), VmapError> {
        let value = module.abstract_of(inputs[index])?;
        Ok((
            value.is_some_and(AbstractValue::is_monad),
            value.is_some_and(AbstractValue::is_universe_monad),
        ))
    };
    let Some(last) = inputs.len().checked_sub(1) else {
        return Ok(MonadLayout::default());
    };
    let (last_is_monad, last_is_universe) = kind(last)?;
    if !last_is_monad {
        return Ok(MonadLayout::default());
    }
    if last_is_universe {
        return Ok(MonadLayout {
            u_monad_offset: 1,
            count: 1,
        });
    }
    if last >= 1 && kind(last - 1)?.1 {
        return Ok(MonadLayout {
            u_monad_offset: 2,
            count: 2,
        });
    }
    Ok(MonadLayout {
        u_monad_offset: 0,
        count: 1,
    })
}

/// Build `[op, (arg0, axis0), ..., monads...]` next to `call`.
///
/// Tuple-typed arguments are unpacked and re-packed element by element so
/// that every leaf value carries its own axis. `in_axes` holds one spec per
/// non-monad argument.
pub fn bind_in_axis(
    module: &mut Module,
    call: NodeId,
    in_axes: &[AxisSpec],
) -> Result<BoundCall, VmapError> {
    let graph = module
        .node(call)?
        .graph
        .ok_or(IrError::NotAnApply(call))?;
    let inputs = module.inputs(call)?.to_vec();
    let monads = monad_layout(module, &inputs)?;
    let real_args = inputs.len().saturating_sub(monads.count + 1);
    if in_axes.len() != real_args {
        return Err(VmapError::AxisLengthMismatch {
            node: call,
            expected: real_args,
            found: in_axes.len(),
        });
    }

    let mut bound: SmallVec<[NodeId; 4]> = SmallVec::with_capacity(inputs.len());
    bound.push(inputs[0]);
    for (arg, axis) in inputs[1..=real_args].iter().zip(in_axes) {
        let elements = module
            .abstract_of(*arg)?
            .and_then(AbstractValue::tuple_elements)
            .map(<[AbstractValue]>::to_vec);
        let pair = match elements {
            Some(elements) => bind_tuple_input(module, graph, *arg, &elements, axis)?,
            None => bind_leaf(module, graph, *arg, axis)?,
        };
        bound.push(pair);
    }
    bound.extend_from_slice(&inputs[real_args + 1..]);

    let node = module.new_apply(graph, bound)?;
    if let Some(abstract_value) = module.abstract_of(call)?.cloned() {
        module.set_abstract(node, abstract_value)?;
    }
    Ok(BoundCall { node, monads })
}

fn bind_leaf(
    module: &mut Module,
    graph: GraphId,
    value: NodeId,
    axis: &AxisSpec,
) -> Result<NodeId, IrError> {
    let axis = module.new_constant(axis.to_constant());
    module.new_primitive_apply(graph, Primitive::MakeTuple, &[value, axis])
}

fn bind_tuple_input(
    module: &mut Module,
    graph: GraphId,
    input: NodeId,
    elements: &[AbstractValue],
    axis: &AxisSpec,
) -> Result<NodeId, VmapError> {
    if let AxisSpec::Seq(items) = axis
        && items.len() != elements.len()
    {
        return Err(VmapError::AxisLengthMismatch {
            node: input,
            expected: elements.len(),
            found: items.len(),
        });
    }
    let mut packed = Vec::with_capacity(elements.len());
    for (index, element) in elements.iter().enumerate() {
        let position = module.new_constant(Constant::i64(index as i64));
        let item = module.new_primitive_apply(graph, Primitive::TupleGetItem, &[input, position])?;
        module.set_abstract(item, element.clone())?;
        let item_axis = match axis {
            AxisSpec::Seq(items) => &items[index],
            scalar => scalar,
        };
        let pair = match element.tuple_elements() {
            Some(nested) => bind_tuple_input(module, graph, item, nested, item_axis)?,
            None => bind_leaf(module, graph, item, item_axis)?,
        };
        packed.push(pair);
    }
    Ok(module.new_primitive_apply(graph, Primitive::MakeTuple, &packed)?)
}

#[cfg(test)]
mod tests {
    use super::{MonadLayout, bind_in_axis, monad_layout};
    use crate::VmapError;
    use fv_core::{
        AbstractValue, AxisSpec, Constant, DType, GraphId, Module, MonadKind, NodeId, VmapSpec,
    };

    struct Fixture {
        module: Module,
        main: GraphId,
        call: NodeId,
    }

    fn fixture(args: &[AbstractValue]) -> Fixture {
        let mut module = Module::new();
        let main = module.new_graph("main", None);
        let body = module.new_graph("body", None);
        let vmap = module.new_constant(Constant::Vmap(VmapSpec::default()));
        let fn_ref = module.new_constant(Constant::Graph(body));
        let site = module.new_apply(main, [vmap, fn_ref]).expect("site");
        let mut inputs = vec![site];
        for abstract_value in args {
            inputs.push(
                module
                    .add_typed_parameter(main, abstract_value.clone())
                    .expect("param"),
            );
        }
        let call = module.new_apply(main, inputs).expect("call");
        module.set_output(main, call).expect("output");
        Fixture { module, main, call }
    }

    fn f32(dims: &[u32]) -> AbstractValue {
        AbstractValue::tensor(DType::F32, dims)
    }

    const U: AbstractValue = AbstractValue::Monad(MonadKind::Universe);
    const IO: AbstractValue = AbstractValue::Monad(MonadKind::Io);

    #[test]
    fn monad_layout_reads_trailing_inputs() {
        let cases = [
            (vec![f32(&[2])], MonadLayout::default()),
            (
                vec![f32(&[2]), U],
                MonadLayout {
                    u_monad_offset: 1,
                    count: 1,
                },
            ),
            (
                vec![f32(&[2]), U, IO],
                MonadLayout {
                    u_monad_offset: 2,
                    count: 2,
                },
            ),
            (
                vec![f32(&[2]), IO],
                MonadLayout {
                    u_monad_offset: 0,
                    count: 1,
                },
            ),
        ];
        for (args, expected) in cases {
            let fx = fixture(&args);
            let inputs = fx.module.inputs(fx.call).expect("inputs").to_vec();
            assert_eq!(monad_layout(&fx.module, &inputs), Ok(expected));
        }
    }

    #[test]
    fn arguments_become_value_axis_pairs() {
        let mut fx = fixture(&[f32(&[8, 4]), f32(&[4])]);
        let bound = bind_in_axis(
            &mut fx.module,
            fx.call,
            &[AxisSpec::Axis(1), AxisSpec::None],
        )
        .expect("bind");
        let inputs = fx.module.inputs(bound.node).expect("inputs").to_vec();
        assert_eq!(inputs.len(), 3);
        assert_eq!(inputs[0], fx.module.inputs(fx.call).expect("inputs")[0]);
        assert_eq!(fx.module.node(bound.node).expect("node").graph, Some(fx.main));
        let second = fx.module.inputs(inputs[2]).expect("pair").to_vec();
        assert_eq!(
            fx.module.constant(second[2]).expect("node"),
            Some(&Constant::None)
        );
        assert_eq!(bound.monads, MonadLayout::default());
    }

    #[test]
    fn monads_are_kept_unpaired_at_the_end() {
        let mut fx = fixture(&[f32(&[3]), U, IO]);
        let original = fx.module.inputs(fx.call).expect("inputs").to_vec();
        let bound = bind_in_axis(&mut fx.module, fx.call, &[AxisSpec::Axis(0)]).expect("bind");
        let inputs = fx.module.inputs(bound.node).expect("inputs").to_vec();
        assert_eq!(inputs.len(), 4);
        assert_eq!(&inputs[2..], &original[2..]);
        assert_eq!(bound.monads.u_monad_offset, 2);
    }

    #[test]
    fn tuple_arguments_are_unpacked_recursively() {
        let nested = AbstractValue::Tuple(vec![
            f32(&[5]),
            AbstractValue::Tuple(vec![f32(&[5, 2]), f32(&[2, 5])]),
        ]);
        let mut fx = fixture(&[nested]);
        let spec = AxisSpec::Seq(vec![
            AxisSpec::Axis(0),
            AxisSpec::Seq(vec![AxisSpec::Axis(0), AxisSpec::Axis(1)]),
        ]);
        let bound = bind_in_axis(&mut fx.module, fx.call, &[spec]).expect("bind");
        let output = fx.module.output(fx.main).expect("output");
        assert_ne!(output, bound.node);

        let mut probe = fx.module.clone();
        probe.set_output(fx.main, bound.node).expect("output");
        let text = probe.fingerprint(fx.main).expect("fingerprint");
        assert!(
            text.contains("make_tuple(a1, i64:0)"),
            "leaf pairs carry their own axis: {text}"
        );
        assert!(
            text.contains("a6 = tuple_getitem(a3, i64:1)"),
            "nested tuples are unpacked: {text}"
        );
        assert!(text.contains("a7 = make_tuple(a6, i64:1)"), "{text}");
    }

    #[test]
    fn axis_count_must_match_real_arguments() {
        let mut fx = fixture(&[f32(&[3]), f32(&[3]), U]);
        let err = bind_in_axis(&mut fx.module, fx.call, &[AxisSpec::Axis(0)])
            .expect_err("two real arguments");
        assert_eq!(
            err,
            VmapError::AxisLengthMismatch {
                node: fx.call,
                expected: 2,
                found: 1
            }
        );
    }

    #[test]
    fn tuple_spec_length_must_match_tuple() {
        let mut fx = fixture(&[AbstractValue::Tuple(vec![f32(&[2]), f32(&[2])])]);
        let err = bind_in_axis(
            &mut fx.module,
            fx.call,
            &[AxisSpec::Seq(vec![AxisSpec::Axis(0)])],
        )
        .expect_err("tuple has two elements");
        assert!(matches!(
            err,
            VmapError::AxisLengthMismatch {
                expected: 2,
                found: 1,
                ..
            }
        ));
    }
}
