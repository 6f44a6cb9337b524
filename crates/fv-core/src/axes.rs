//! Batch-axis specifications (`in_axes` / `out_axes`).
//!
//! An axis specification is either a single (possibly negative) axis, `none`
//! for an unbatched value, or a nested sequence mirroring the tuple
//! structure of the values it describes. Specifications travel through the
//! IR as ordinary constants: `i64` scalars, `none`, and tuples.

use crate::{Constant, Literal};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AxisSpec {
    Axis(i64),
    None,
    Seq(Vec<AxisSpec>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AxisError {
    OutOfBounds { axis: i64, rank: usize },
    Parse { input: String, position: usize, detail: &'static str },
}

impl std::fmt::Display for AxisError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OutOfBounds { axis, rank } => write!(
                f,
                "axis {} is out of bounds for array of dimension [{}, {})",
                axis,
                -(*rank as i64),
                rank
            ),
            Self::Parse {
                input,
                position,
                detail,
            } => write!(
                f,
                "cannot parse axis spec {:?} at byte {}: {}",
                input, position, detail
            ),
        }
    }
}

impl std::error::Error for AxisError {}

impl AxisSpec {
    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    #[must_use]
    pub fn as_seq(&self) -> Option<&[AxisSpec]> {
        match self {
            Self::Seq(items) => Some(items),
            _ => None,
        }
    }

    /// Map a possibly negative axis onto `[0, rank)`.
    pub fn normalize(axis: i64, rank: usize) -> Result<usize, AxisError> {
        let rank_i64 = rank as i64;
        if axis < -rank_i64 || axis >= rank_i64 {
            return Err(AxisError::OutOfBounds { axis, rank });
        }
        let positive = if axis < 0 { rank_i64 + axis } else { axis };
        Ok(positive as usize)
    }

    #[must_use]
    pub fn to_constant(&self) -> Constant {
        match self {
            Self::Axis(axis) => Constant::Scalar(Literal::I64(*axis)),
            Self::None => Constant::None,
            Self::Seq(items) => Constant::Tuple(items.iter().map(Self::to_constant).collect()),
        }
    }

    #[must_use]
    pub fn from_constant(constant: &Constant) -> Option<Self> {
        match constant {
            Constant::Scalar(Literal::I64(axis)) => Some(Self::Axis(*axis)),
            Constant::None => Some(Self::None),
            Constant::Tuple(items) => items
                .iter()
                .map(Self::from_constant)
                .collect::<Option<Vec<_>>>()
                .map(Self::Seq),
            _ => None,
        }
    }

    /// Parse `0`, `-1`, `none`, or nested `(0, none, (1, -1))` / `[..]`.
    pub fn parse(input: &str) -> Result<Self, AxisError> {
        let mut parser = Parser {
            input,
            bytes: input.as_bytes(),
            pos: 0,
        };
        let spec = parser.spec()?;
        parser.skip_ws();
        if parser.pos != parser.bytes.len() {
            return Err(parser.error("trailing characters"));
        }
        Ok(spec)
    }
}

impl std::fmt::Display for AxisSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Axis(axis) => write!(f, "{axis}"),
            Self::None => f.write_str("none"),
            Self::Seq(items) => {
                f.write_str("(")?;
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                if items.len() == 1 {
                    f.write_str(",")?;
                }
                f.write_str(")")
            }
        }
    }
}

struct Parser<'a> {
    input: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn error(&self, detail: &'static str) -> AxisError {
        AxisError::Parse {
            input: self.input.to_owned(),
            position: self.pos,
            detail,
        }
    }

    fn skip_ws(&mut self) {
        while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn spec(&mut self) -> Result<AxisSpec, AxisError> {
        self.skip_ws();
        match self.bytes.get(self.pos) {
            Some(b'(') | Some(b'[') => self.seq(),
            Some(b'n') | Some(b'N') => self.none(),
            Some(b'-') | Some(b'0'..=b'9') => self.axis(),
            Some(_) => Err(self.error("expected axis, none, or sequence")),
            None => Err(self.error("unexpected end of input")),
        }
    }

    fn seq(&mut self) -> Result<AxisSpec, AxisError> {
        let close = if self.bytes[self.pos] == b'(' {
            b')'
        } else {
            b']'
        };
        self.pos += 1;
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            if self.bytes.get(self.pos) == Some(&close) {
                self.pos += 1;
                return Ok(AxisSpec::Seq(items));
            }
            items.push(self.spec()?);
            self.skip_ws();
            match self.bytes.get(self.pos) {
                Some(b',') => self.pos += 1,
                Some(byte) if *byte == close => {}
                Some(_) => return Err(self.error("expected ',' or closing bracket")),
                None => return Err(self.error("unterminated sequence")),
            }
        }
    }

    fn none(&mut self) -> Result<AxisSpec, AxisError> {
        let word = self.input.get(self.pos..self.pos + 4);
        if word.is_some_and(|word| word.eq_ignore_ascii_case("none")) {
            self.pos += 4;
            Ok(AxisSpec::None)
        } else {
            Err(self.error("expected none"))
        }
    }

    fn axis(&mut self) -> Result<AxisSpec, AxisError> {
        let start = self.pos;
        if self.bytes[self.pos] == b'-' {
            self.pos += 1;
        }
        while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_digit() {
            self.pos += 1;
        }
        self.input[start..self.pos]
            .parse::<i64>()
            .map(AxisSpec::Axis)
            .map_err(|_| self.error("invalid integer axis"))
    }
}

#[cfg(test)]
mod tests {
    use super::{AxisError, AxisSpec};
    use crate::Constant;
    use crate::proptest_strategies::{axis_spec_strategy, rank_and_axis};
    use proptest::prelude::*;

    #[test]
    fn normalize_negative_axis_counts_from_last() {
        assert_eq!(AxisSpec::normalize(-1, 2), Ok(1));
        assert_eq!(AxisSpec::normalize(-2, 2), Ok(0));
        assert_eq!(AxisSpec::normalize(1, 2), Ok(1));
    }

    #[test]
    fn normalize_rejects_out_of_bounds() {
        assert_eq!(
            AxisSpec::normalize(2, 2),
            Err(AxisError::OutOfBounds { axis: 2, rank: 2 })
        );
        assert_eq!(
            AxisSpec::normalize(-3, 2),
            Err(AxisError::OutOfBounds { axis: -3, rank: 2 })
        );
        assert!(AxisSpec::normalize(0, 0).is_err());
    }

    #[test]
    fn out_of_bounds_message_names_the_range() {
        let err = AxisSpec::normalize(5, 3).expect_err("axis 5 exceeds rank 3");
        assert_eq!(
            err.to_string(),
            "axis 5 is out of bounds for array of dimension [-3, 3)"
        );
    }

    #[test]
    fn parse_accepts_nested_syntax() {
        assert_eq!(AxisSpec::parse("0"), Ok(AxisSpec::Axis(0)));
        assert_eq!(AxisSpec::parse(" None "), Ok(AxisSpec::None));
        assert_eq!(
            AxisSpec::parse("(0, none, [1, -1])"),
            Ok(AxisSpec::Seq(vec![
                AxisSpec::Axis(0),
                AxisSpec::None,
                AxisSpec::Seq(vec![AxisSpec::Axis(1), AxisSpec::Axis(-1)]),
            ]))
        );
        assert_eq!(
            AxisSpec::parse("(1,)"),
            Ok(AxisSpec::Seq(vec![AxisSpec::Axis(1)]))
        );
        assert_eq!(AxisSpec::parse("()"), Ok(AxisSpec::Seq(vec![])));
    }

    #[test]
    fn parse_reports_position_of_error() {
        let err = AxisSpec::parse("(0, x)").expect_err("x is not an axis");
        assert!(matches!(err, AxisError::Parse { position: 4, .. }));
        assert!(AxisSpec::parse("(0, 1").is_err());
        assert!(AxisSpec::parse("0 1").is_err());
        assert!(AxisSpec::parse("-").is_err());
    }

    #[test]
    fn constant_conversion_preserves_structure() {
        let spec = AxisSpec::Seq(vec![AxisSpec::Axis(-1), AxisSpec::None]);
        let constant = spec.to_constant();
        assert_eq!(
            constant,
            Constant::Tuple(vec![Constant::i64(-1), Constant::None])
        );
        assert_eq!(AxisSpec::from_constant(&constant), Some(spec));
        assert_eq!(AxisSpec::from_constant(&Constant::Str("0".to_owned())), None);
    }

    proptest! {
        #[test]
        fn normalize_is_idempotent((rank, axis) in rank_and_axis()) {
            let once = AxisSpec::normalize(axis, rank).expect("strategy yields in-range axes");
            let twice =
                AxisSpec::normalize(once as i64, rank).expect("positive axis stays in range");
            prop_assert_eq!(once, twice);
            prop_assert!(once < rank);
        }

        #[test]
        fn display_parses_back(spec in axis_spec_strategy()) {
            let text = spec.to_string();
            prop_assert_eq!(AxisSpec::parse(&text), Ok(spec));
        }
    }
}
