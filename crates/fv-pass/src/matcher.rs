//! Wrapper that moves every batched output to the requested `out_axes`.

use crate::VmapError;
use fv_core::{
    AbstractValue, AxisSpec, Constant, GraphId, MetaOp, Module, MonadKind, NodeId, Primitive,
};

/// Build `vmap_<name>(p0..pn) = match_out_axis(expanded(p0..pn), out_axes, axis_size)`.
///
/// With a universe monad among the parameters (`u_monad_offset` counted
/// from the end), the outputs are threaded through `update_state` on that
/// monad and the result depends on the new state, so downstream effects
/// stay ordered after the batched call.
pub fn match_out_axis(
    module: &mut Module,
    expanded: GraphId,
    parameters_size: usize,
    u_monad_offset: usize,
    axis_size: usize,
    out_axes: &AxisSpec,
) -> Result<GraphId, VmapError> {
    let name = format!("vmap_{}", module.graph(expanded)?.name);
    let wrapper = module.new_graph(name, None);
    let mut parameters: Vec<NodeId> = Vec::with_capacity(parameters_size);
    for _ in 0..parameters_size {
        parameters.push(module.add_parameter(wrapper)?);
    }

    let expanded_ref = module.new_constant(Constant::Graph(expanded));
    let outputs = module.new_apply(
        wrapper,
        std::iter::once(expanded_ref).chain(parameters.iter().copied()),
    )?;
    let out_axes = module.new_constant(out_axes.to_constant());
    let axis_size = module.new_constant(Constant::i64(axis_size as i64));
    let meta = module.new_constant(Constant::Meta(MetaOp::MatchOutAxis));

    let result = match u_monad_offset
        .checked_sub(1)
        .and_then(|back| parameters_size.checked_sub(back + 1))
    {
        Some(position) => {
            let u_monad = parameters[position];
            module.set_abstract(u_monad, AbstractValue::Monad(MonadKind::Universe))?;
            let state = module.new_primitive_apply(
                wrapper,
                Primitive::UpdateState,
                &[u_monad, outputs],
            )?;
            let matched = module.new_apply(wrapper, [meta, outputs, out_axes, axis_size])?;
            module.new_primitive_apply(wrapper, Primitive::Depend, &[matched, state])?
        }
        None => module.new_apply(wrapper, [meta, outputs, out_axes, axis_size])?,
    };
    module.set_output(wrapper, result)?;
    Ok(wrapper)
}

#[cfg(test)]
mod tests {
    use super::match_out_axis;
    use fv_core::{AbstractValue, AxisSpec, GraphId, Module, MonadKind};

    fn identity(module: &mut Module, arity: usize) -> GraphId {
        let graph = module.new_graph("f", None);
        let mut first = None;
        for _ in 0..arity {
            let param = module.add_parameter(graph).expect("param");
            first.get_or_insert(param);
        }
        module
            .set_output(graph, first.expect("at least one parameter"))
            .expect("output");
        graph
    }

    #[test]
    fn wrapper_calls_expanded_graph_then_matches() {
        let mut module = Module::new();
        let f = identity(&mut module, 1);
        let wrapper = match_out_axis(&mut module, f, 1, 0, 4, &AxisSpec::None).expect("wrap");
        assert_eq!(
            module.fingerprint(wrapper).expect("fingerprint"),
            "vmap_f(p0) { a0 = @f(p0); a1 = match_out_axis(a0, none, i64:4); a2 = return(a1); }"
        );
        assert_eq!(module.graph(wrapper).expect("graph").parent, None);
        assert_eq!(module.validate_graph(wrapper), Ok(()));
    }

    #[test]
    fn universe_monad_orders_the_result() {
        let mut module = Module::new();
        let f = identity(&mut module, 3);
        let wrapper = match_out_axis(&mut module, f, 3, 1, 2, &AxisSpec::Axis(0)).expect("wrap");
        assert_eq!(
            module.fingerprint(wrapper).expect("fingerprint"),
            "vmap_f(p0, p1, p2) { a0 = @f(p0, p1, p2); a1 = match_out_axis(a0, i64:0, i64:2); \
             a2 = update_state(p2, a0); a3 = depend(a1, a2); a4 = return(a3); }"
        );
        let u = module.graph(wrapper).expect("graph").parameters[2];
        assert_eq!(
            module.abstract_of(u),
            Ok(Some(&AbstractValue::Monad(MonadKind::Universe)))
        );
    }

    #[test]
    fn universe_before_io_monad_is_found() {
        let mut module = Module::new();
        let f = identity(&mut module, 3);
        let wrapper = match_out_axis(&mut module, f, 3, 2, 2, &AxisSpec::Axis(0)).expect("wrap");
        let text = module.fingerprint(wrapper).expect("fingerprint");
        assert!(text.contains("update_state(p1, a0)"), "{text}");
    }
}
