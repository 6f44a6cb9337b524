//! Axis size inference and in_axes normalization for one vmap call.

use crate::VmapError;
use fv_core::{AbstractValue, AxisSpec, Module, NodeId};

/// Normalized axes of one call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallAxes {
    pub axis_size: usize,
    /// One entry per non-monad argument, negative axes rewritten.
    pub in_axes: Vec<AxisSpec>,
}

impl CallAxes {
    #[must_use]
    pub fn in_axes_text(&self) -> String {
        AxisSpec::Seq(self.in_axes.clone()).to_string()
    }
}

/// Expand `in_axes` to one spec per argument.
///
/// A sequence is taken as is. A scalar is repeated, so that a negative
/// axis can resolve to a different positive axis for each argument.
#[must_use]
pub fn per_argument_axes(in_axes: &AxisSpec, count: usize) -> Vec<AxisSpec> {
    match in_axes {
        AxisSpec::Seq(items) => items.clone(),
        scalar => vec![scalar.clone(); count],
    }
}

/// Batch size implied by one value, with its spec normalized.
///
/// `Ok((None, _))` means the value is not batched.
pub fn axis_size_of(
    node: NodeId,
    abstract_value: &AbstractValue,
    spec: &AxisSpec,
) -> Result<(Option<usize>, AxisSpec), VmapError> {
    if let Some(elements) = abstract_value.sequence_elements() {
        let elements: Vec<&AbstractValue> = elements
            .iter()
            .take_while(|element| !element.is_monad())
            .collect();
        if let AxisSpec::Seq(items) = spec
            && items.len() != elements.len()
        {
            return Err(VmapError::AxisLengthMismatch {
                node,
                expected: elements.len(),
                found: items.len(),
            });
        }
        let element_specs = per_argument_axes(spec, elements.len());
        let mut size = None;
        let mut corrected = Vec::with_capacity(elements.len());
        for (element, element_spec) in elements.into_iter().zip(&element_specs) {
            let (element_size, normalized) = axis_size_of(node, element, element_spec)?;
            merge_axis_size(node, &mut size, element_size)?;
            corrected.push(normalized);
        }
        return Ok((size, AxisSpec::Seq(corrected)));
    }

    match spec {
        AxisSpec::None => Ok((None, AxisSpec::None)),
        AxisSpec::Axis(axis) => {
            let rank = abstract_value
                .rank()
                .ok_or_else(|| VmapError::AxisOnUnshapedValue {
                    node,
                    abstract_value: abstract_value.to_string(),
                })?;
            let normalized = AxisSpec::normalize(*axis, rank)
                .map_err(|source| VmapError::Axis { node, source })?;
            let size = abstract_value
                .shape()
                .and_then(|shape| shape.dims.get(normalized))
                .map(|extent| *extent as usize);
            Ok((size, AxisSpec::Axis(normalized as i64)))
        }
        AxisSpec::Seq(_) => Err(VmapError::AxisOnUnshapedValue {
            node,
            abstract_value: abstract_value.to_string(),
        }),
    }
}

fn merge_axis_size(
    node: NodeId,
    size: &mut Option<usize>,
    found: Option<usize>,
) -> Result<(), VmapError> {
    match (*size, found) {
        (_, None) => Ok(()),
        (None, Some(found)) => {
            *size = Some(found);
            Ok(())
        }
        (Some(expected), Some(found)) if expected == found => Ok(()),
        (Some(expected), Some(found)) => Err(VmapError::AxisSizeMismatch {
            node,
            expected,
            found,
        }),
    }
}

/// Resolve the axis size of `call` (an apply of a vmap node) and normalize
/// `in_axes` against its actual arguments. Arguments from the first monad
/// on are not considered.
pub fn resolve_call_axes(
    module: &Module,
    call: NodeId,
    in_axes: &AxisSpec,
) -> Result<CallAxes, VmapError> {
    let inputs = module.inputs(call)?;
    let mut arguments = Vec::new();
    for arg in inputs.iter().skip(1) {
        let abstract_value = module
            .abstract_of(*arg)?
            .ok_or(VmapError::MissingAbstract { node: *arg })?;
        if abstract_value.is_monad() {
            break;
        }
        arguments.push((*arg, abstract_value));
    }

    if let AxisSpec::Seq(items) = in_axes
        && items.len() != arguments.len()
    {
        return Err(VmapError::AxisLengthMismatch {
            node: call,
            expected: arguments.len(),
            found: items.len(),
        });
    }

    let specs = per_argument_axes(in_axes, arguments.len());
    let mut size = None;
    let mut corrected = Vec::with_capacity(arguments.len());
    for ((arg, abstract_value), spec) in arguments.into_iter().zip(&specs) {
        let (arg_size, normalized) = axis_size_of(arg, abstract_value, spec)?;
        merge_axis_size(call, &mut size, arg_size)?;
        corrected.push(normalized);
    }

    let axis_size = size.ok_or(VmapError::AxisSizeUnknown { call })?;
    Ok(CallAxes {
        axis_size,
        in_axes: corrected,
    })
}
