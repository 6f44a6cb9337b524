use crate::{AxisSpec, DType, Shape};
use proptest::prelude::*;

/// A rank in `1..=6` together with an in-range axis, negative or positive.
pub fn rank_and_axis() -> impl Strategy<Value = (usize, i64)> {
    (1_usize..=6).prop_flat_map(|rank| {
        let bound = rank as i64;
        (Just(rank), -bound..bound)
    })
}

pub fn shape_strategy(max_rank: usize) -> impl Strategy<Value = Shape> {
    prop::collection::vec(1_u32..=9, 1..=max_rank).prop_map(|dims| Shape { dims })
}

pub fn dtype_strategy() -> impl Strategy<Value = DType> {
    prop_oneof![
        Just(DType::F32),
        Just(DType::F64),
        Just(DType::I32),
        Just(DType::I64),
    ]
}

pub fn axis_spec_strategy() -> impl Strategy<Value = AxisSpec> {
    let leaf = prop_oneof![(-8_i64..8).prop_map(AxisSpec::Axis), Just(AxisSpec::None)];
    leaf.prop_recursive(3, 16, 4, |inner| {
        prop::collection::vec(inner, 0..4).prop_map(AxisSpec::Seq)
    })
}
