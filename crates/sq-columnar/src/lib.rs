#![forbid(unsafe_code)]

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use sq_types::{DType, NullKind, Scalar, TypeError, cast_scalar, infer_dtype};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    dtype: DType,
    values: Vec<Scalar>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArithmeticOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl ComparisonOp {
    /// Operator with its operands swapped (`5 < x` becomes `x > 5`).
    #[must_use]
    pub fn reversed(self) -> Self {
        match self {
            Self::Eq => Self::Eq,
            Self::Ne => Self::Ne,
            Self::Lt => Self::Gt,
            Self::Le => Self::Ge,
            Self::Gt => Self::Lt,
            Self::Ge => Self::Le,
        }
    }

    /// Applies the operator to two cells. Missing operands yield `None`;
    /// incomparable present values are unequal and unordered.
    #[must_use]
    pub fn apply(self, left: &Scalar, right: &Scalar) -> Option<bool> {
        if left.is_missing() || right.is_missing() {
            return None;
        }
        let ordering = left.partial_compare(right);
        Some(match (self, ordering) {
            (Self::Eq, Some(ord)) => ord == Ordering::Equal,
            (Self::Ne, Some(ord)) => ord != Ordering::Equal,
            (Self::Lt, Some(ord)) => ord == Ordering::Less,
            (Self::Le, Some(ord)) => ord != Ordering::Greater,
            (Self::Gt, Some(ord)) => ord == Ordering::Greater,
            (Self::Ge, Some(ord)) => ord != Ordering::Less,
            (Self::Ne, None) => true,
            (_, None) => false,
        })
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ColumnError {
    #[error("columns disagree on row count ({left} vs {right})")]
    LengthMismatch { left: usize, right: usize },
    #[error("operator {op:?} is not defined for {left:?} and {right:?}")]
    UnsupportedOperands {
        op: ArithmeticOp,
        left: DType,
        right: DType,
    },
    #[error(transparent)]
    Type(#[from] TypeError),
}

impl Column {
    /// Builds a column of `dtype`, casting each cell into it.
    pub fn new(dtype: DType, values: Vec<Scalar>) -> Result<Self, ColumnError> {
        let coerced = values
            .into_iter()
            .map(|value| {
                if value.dtype() == dtype {
                    Ok(value)
                } else {
                    cast_scalar(&value, dtype)
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            dtype,
            values: coerced,
        })
    }

    pub fn from_values(values: Vec<Scalar>) -> Result<Self, ColumnError> {
        let dtype = infer_dtype(&values)?;
        Self::new(dtype, values)
    }

    /// Infallible construction for computed results. Values that share no
    /// common dtype are rendered to strings; a column holding any list
    /// becomes a list column.
    #[must_use]
    pub fn from_values_lossy(values: Vec<Scalar>) -> Self {
        let has_list = values.iter().any(|v| matches!(v, Scalar::List(_)));
        if !has_list && let Ok(column) = Self::from_values(values.clone()) {
            return column;
        }

        let (dtype, values) = if has_list {
            let wrapped: Vec<Scalar> = values
                .into_iter()
                .map(|value| match value {
                    Scalar::List(_) => value,
                    missing if missing.is_missing() => Scalar::Null(NullKind::Null),
                    other => Scalar::List(vec![other]),
                })
                .collect();
            (DType::List, wrapped)
        } else {
            let rendered: Vec<Scalar> = values
                .into_iter()
                .map(|value| match value {
                    Scalar::Utf8(_) => value,
                    missing if missing.is_missing() => Scalar::Null(NullKind::Null),
                    other => Scalar::Utf8(other.render()),
                })
                .collect();
            (DType::Utf8, rendered)
        };

        Self { dtype, values }
    }

    /// Broadcast one value to `len` rows.
    #[must_use]
    pub fn full(value: Scalar, len: usize) -> Self {
        Self::from_values_lossy(vec![value; len])
    }

    #[must_use]
    pub fn nulls(len: usize) -> Self {
        Self::full(Scalar::Null(NullKind::Null), len)
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[must_use]
    pub fn values(&self) -> &[Scalar] {
        &self.values
    }

    #[must_use]
    pub fn value(&self, idx: usize) -> Option<&Scalar> {
        self.values.get(idx)
    }

    pub fn reindex_by_positions(&self, positions: &[Option<usize>]) -> Result<Self, ColumnError> {
        let values = positions
            .iter()
            .map(|slot| match slot {
                Some(idx) => self
                    .values
                    .get(*idx)
                    .cloned()
                    .unwrap_or_else(|| Scalar::missing_for_dtype(self.dtype)),
                None => Scalar::missing_for_dtype(self.dtype),
            })
            .collect::<Vec<_>>();

        Self::new(self.dtype, values)
    }

    /// Gathers rows by position; out-of-range positions become missing.
    #[must_use]
    pub fn take(&self, positions: &[usize]) -> Self {
        let values = positions
            .iter()
            .map(|idx| {
                self.values
                    .get(*idx)
                    .cloned()
                    .unwrap_or_else(|| Scalar::missing_for_dtype(self.dtype))
            })
            .collect::<Vec<_>>();
        Self {
            dtype: self.dtype,
            values,
        }
    }

    pub fn filter(&self, mask: &[bool]) -> Result<Self, ColumnError> {
        if mask.len() != self.len() {
            return Err(ColumnError::LengthMismatch {
                left: self.len(),
                right: mask.len(),
            });
        }
        let positions = mask
            .iter()
            .enumerate()
            .filter_map(|(idx, keep)| keep.then_some(idx))
            .collect::<Vec<_>>();
        Ok(self.take(&positions))
    }

    /// Appends `other` below `self`, widening the dtype when needed.
    #[must_use]
    pub fn concat(&self, other: &Self) -> Self {
        let mut values = Vec::with_capacity(self.len() + other.len());
        values.extend(self.values.iter().cloned());
        values.extend(other.values.iter().cloned());
        Self::from_values_lossy(values)
    }

    pub fn binary_numeric(&self, right: &Self, op: ArithmeticOp) -> Result<Self, ColumnError> {
        if self.len() != right.len() {
            return Err(ColumnError::LengthMismatch {
                left: self.len(),
                right: right.len(),
            });
        }

        let values = self
            .values
            .iter()
            .zip(&right.values)
            .map(|(left, right)| scalar_arithmetic(left, right, op))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self::from_values_lossy(values))
    }

    /// Element-wise comparison producing a bool column; rows with a missing
    /// operand are missing in the output.
    pub fn compare(&self, right: &Self, op: ComparisonOp) -> Result<Self, ColumnError> {
        if self.len() != right.len() {
            return Err(ColumnError::LengthMismatch {
                left: self.len(),
                right: right.len(),
            });
        }
        let values = self
            .values
            .iter()
            .zip(&right.values)
            .map(|(l, r)| op.apply(l, r).map_or(Scalar::null(), Scalar::Bool))
            .collect::<Vec<_>>();
        Self::new(DType::Bool, values)
    }

    pub fn compare_scalar(&self, right: &Scalar, op: ComparisonOp) -> Result<Self, ColumnError> {
        let values = self
            .values
            .iter()
            .map(|l| op.apply(l, right).map_or(Scalar::null(), Scalar::Bool))
            .collect::<Vec<_>>();
        Self::new(DType::Bool, values)
    }

    /// Membership test; missing cells are never members.
    pub fn is_in(&self, candidates: &[Scalar]) -> Result<Self, ColumnError> {
        let values = self
            .values
            .iter()
            .map(|value| {
                Scalar::Bool(
                    candidates
                        .iter()
                        .any(|candidate| ComparisonOp::Eq.apply(value, candidate) == Some(true)),
                )
            })
            .collect::<Vec<_>>();
        Self::new(DType::Bool, values)
    }

    /// Kleene AND: false dominates, otherwise missing propagates.
    pub fn and(&self, right: &Self) -> Result<Self, ColumnError> {
        self.kleene(right, |l, r| match (l, r) {
            (Some(false), _) | (_, Some(false)) => Some(false),
            (Some(true), Some(true)) => Some(true),
            _ => None,
        })
    }

    /// Kleene OR: true dominates, otherwise missing propagates.
    pub fn or(&self, right: &Self) -> Result<Self, ColumnError> {
        self.kleene(right, |l, r| match (l, r) {
            (Some(true), _) | (_, Some(true)) => Some(true),
            (Some(false), Some(false)) => Some(false),
            _ => None,
        })
    }

    pub fn not(&self) -> Result<Self, ColumnError> {
        let values = self
            .values
            .iter()
            .map(|v| truth(v).map_or(Scalar::null(), |b| Scalar::Bool(!b)))
            .collect::<Vec<_>>();
        Self::new(DType::Bool, values)
    }

    fn kleene<F>(&self, right: &Self, f: F) -> Result<Self, ColumnError>
    where
        F: Fn(Option<bool>, Option<bool>) -> Option<bool>,
    {
        if self.len() != right.len() {
            return Err(ColumnError::LengthMismatch {
                left: self.len(),
                right: right.len(),
            });
        }
        let values = self
            .values
            .iter()
            .zip(&right.values)
            .map(|(l, r)| f(truth(l), truth(r)).map_or(Scalar::null(), Scalar::Bool))
            .collect::<Vec<_>>();
        Self::new(DType::Bool, values)
    }

    /// Row mask for filtering: missing counts as false.
    #[must_use]
    pub fn to_mask(&self) -> Vec<bool> {
        self.values.iter().map(Scalar::is_truthy).collect()
    }
}

fn truth(value: &Scalar) -> Option<bool> {
    if value.is_missing() {
        None
    } else {
        Some(value.is_truthy())
    }
}

fn scalar_arithmetic(left: &Scalar, right: &Scalar, op: ArithmeticOp) -> Result<Scalar, ColumnError> {
    if left.is_missing() || right.is_missing() {
        return Ok(if left.is_nan() || right.is_nan() {
            Scalar::Null(NullKind::NaN)
        } else {
            Scalar::Null(NullKind::Null)
        });
    }

    let unsupported = || ColumnError::UnsupportedOperands {
        op,
        left: left.dtype(),
        right: right.dtype(),
    };

    match (left, right) {
        (Scalar::Utf8(l), Scalar::Utf8(r)) if op == ArithmeticOp::Add => {
            return Ok(Scalar::Utf8(format!("{l}{r}")));
        }
        (Scalar::Utf8(_) | Scalar::List(_) | Scalar::Datetime(_), _)
        | (_, Scalar::Utf8(_) | Scalar::List(_) | Scalar::Datetime(_)) => {
            return Err(unsupported());
        }
        _ => {}
    }

    let int_operands = match (left, right) {
        (Scalar::Int64(a), Scalar::Int64(b)) => Some((*a, *b)),
        (Scalar::Bool(a), Scalar::Int64(b)) => Some((i64::from(*a), *b)),
        (Scalar::Int64(a), Scalar::Bool(b)) => Some((*a, i64::from(*b))),
        (Scalar::Bool(a), Scalar::Bool(b)) => Some((i64::from(*a), i64::from(*b))),
        _ => None,
    };

    if let Some((a, b)) = int_operands {
        let exact = match op {
            ArithmeticOp::Add => a.checked_add(b),
            ArithmeticOp::Sub => a.checked_sub(b),
            ArithmeticOp::Mul => a.checked_mul(b),
            ArithmeticOp::Div => None,
            ArithmeticOp::Mod => {
                if b == 0 {
                    return Ok(Scalar::Null(NullKind::Null));
                }
                a.checked_rem(b).map(|r| if r != 0 && (r < 0) != (b < 0) { r + b } else { r })
            }
            ArithmeticOp::Pow => u32::try_from(b).ok().and_then(|exp| a.checked_pow(exp)),
        };
        if let Some(value) = exact {
            return Ok(Scalar::Int64(value));
        }
    }

    let lhs = left.to_f64()?;
    let rhs = right.to_f64()?;
    let result = match op {
        ArithmeticOp::Add => lhs + rhs,
        ArithmeticOp::Sub => lhs - rhs,
        ArithmeticOp::Mul => lhs * rhs,
        ArithmeticOp::Div => lhs / rhs,
        ArithmeticOp::Mod => {
            if rhs == 0.0 {
                return Ok(Scalar::Null(NullKind::NaN));
            }
            lhs - rhs * (lhs / rhs).floor()
        }
        ArithmeticOp::Pow => lhs.powf(rhs),
    };
    Ok(Scalar::Float64(result))
}

/// Hashable identity of one cell, used for grouping, joining and
/// de-duplication. Integral floats share the key of the equal integer and
/// every missing marker shares one key.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub enum KeyRef<'a> {
    Missing,
    Bool(bool),
    Int64(i64),
    FloatBits(u64),
    Datetime(i64),
    Utf8(&'a str),
    List(Vec<KeyRef<'a>>),
}

impl<'a> KeyRef<'a> {
    #[must_use]
    pub fn from_scalar(value: &'a Scalar) -> Self {
        match value {
            v if v.is_missing() => Self::Missing,
            Scalar::Bool(v) => Self::Bool(*v),
            Scalar::Int64(v) => Self::Int64(*v),
            Scalar::Float64(v) => {
                if v.fract() == 0.0 && v.abs() < 9.0e15 {
                    Self::Int64(*v as i64)
                } else {
                    Self::FloatBits(v.to_bits())
                }
            }
            Scalar::Datetime(v) => Self::Datetime(*v),
            Scalar::Utf8(v) => Self::Utf8(v.as_str()),
            Scalar::List(items) => Self::List(items.iter().map(Self::from_scalar).collect()),
            Scalar::Null(_) => Self::Missing,
        }
    }

    #[must_use]
    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Missing)
    }
}

#[cfg(test)]
mod tests {
    use sq_types::{DType, NullKind, Scalar};

    use super::{ArithmeticOp, Column, ComparisonOp, KeyRef};

    fn ints(values: &[i64]) -> Column {
        Column::from_values(values.iter().copied().map(Scalar::Int64).collect()).expect("ints")
    }

    #[test]
    fn unmatched_join_rows_read_as_null() {
        let ports = ints(&[443, 8080, 22]);

        let out = ports
            .reindex_by_positions(&[Some(2), None, None, Some(0)])
            .expect("left join gather");

        assert_eq!(out.len(), 4);
        assert_eq!(out.values()[0], Scalar::Int64(22));
        assert!(out.values()[1].is_missing());
        assert!(out.values()[2].is_missing());
        assert_eq!(out.values()[3], Scalar::Int64(443));
    }

    #[test]
    fn byte_totals_skip_rows_with_gaps() {
        let sent = Column::from_values(vec![
            Scalar::Float64(f64::NAN),
            Scalar::Int64(512),
            Scalar::Null(NullKind::Null),
        ])
        .expect("sent");
        let received = ints(&[100, 256, 64]);

        let total = sent
            .binary_numeric(&received, ArithmeticOp::Add)
            .expect("sent + received");

        assert!(total.values()[0].is_missing());
        assert_eq!(total.values()[1], Scalar::Float64(768.0));
        assert!(total.values()[2].is_missing());
    }

    #[test]
    fn integer_arithmetic_stays_integral_except_division() {
        let left = ints(&[7, -7, 2]);
        let right = ints(&[3, 3, 10]);

        let modulo = left.binary_numeric(&right, ArithmeticOp::Mod).expect("mod");
        assert_eq!(
            modulo.values(),
            &[Scalar::Int64(1), Scalar::Int64(2), Scalar::Int64(2)]
        );

        let pow = left.binary_numeric(&right, ArithmeticOp::Pow).expect("pow");
        assert_eq!(pow.values()[2], Scalar::Int64(1024));

        let div = left.binary_numeric(&right, ArithmeticOp::Div).expect("div");
        assert_eq!(div.dtype(), DType::Float64);
        assert_eq!(div.values()[2], Scalar::Float64(0.2));
    }

    #[test]
    fn string_addition_concatenates_and_mixed_operands_fail() {
        let left = Column::full(Scalar::Utf8("ab".to_owned()), 1);
        let right = Column::full(Scalar::Utf8("cd".to_owned()), 1);
        let out = left.binary_numeric(&right, ArithmeticOp::Add).expect("concat");
        assert_eq!(out.values(), &[Scalar::Utf8("abcd".to_owned())]);

        let err = left
            .binary_numeric(&ints(&[1]), ArithmeticOp::Mul)
            .expect_err("string times int");
        assert!(err.to_string().contains("Mul"));
    }

    #[test]
    fn lossy_construction_renders_mixed_values() {
        let column = Column::from_values_lossy(vec![
            Scalar::Utf8("hi".to_owned()),
            Scalar::Int64(5),
            Scalar::Null(NullKind::Null),
        ]);
        assert_eq!(column.dtype(), DType::Utf8);
        assert_eq!(column.values()[1], Scalar::Utf8("5".to_owned()));
        assert!(column.values()[2].is_missing());
    }

    #[test]
    fn comparisons_follow_missing_semantics() {
        let column = Column::from_values(vec![
            Scalar::Int64(1),
            Scalar::Null(NullKind::Null),
            Scalar::Int64(3),
        ])
        .expect("column");
        let out = column
            .compare_scalar(&Scalar::Int64(2), ComparisonOp::Lt)
            .expect("compare");
        assert_eq!(
            out.values(),
            &[
                Scalar::Bool(true),
                Scalar::Null(NullKind::Null),
                Scalar::Bool(false)
            ]
        );
        assert_eq!(out.to_mask(), vec![true, false, false]);
    }

    #[test]
    fn kleene_logic_matches_truth_tables() {
        let t = Scalar::Bool(true);
        let f = Scalar::Bool(false);
        let n = Scalar::Null(NullKind::Null);
        let left = Column::from_values(vec![t.clone(), f.clone(), n.clone(), n.clone()])
            .expect("left");
        let right = Column::from_values(vec![n.clone(), n.clone(), f.clone(), t.clone()])
            .expect("right");

        let and = left.and(&right).expect("and");
        assert_eq!(and.values(), &[n.clone(), f.clone(), f.clone(), n.clone()]);

        let or = left.or(&right).expect("or");
        assert_eq!(or.values(), &[t.clone(), n.clone(), n.clone(), t]);

        let not = left.not().expect("not");
        assert_eq!(not.values()[1], Scalar::Bool(true));
        assert!(not.values()[2].is_missing());
    }

    #[test]
    fn membership_ignores_missing_cells() {
        let column = Column::from_values(vec![
            Scalar::Int64(1),
            Scalar::Int64(4),
            Scalar::Null(NullKind::Null),
        ])
        .expect("column");
        let out = column
            .is_in(&[Scalar::Int64(1), Scalar::Float64(4.0)])
            .expect("is_in");
        assert_eq!(out.to_mask(), vec![true, true, false]);
    }

    #[test]
    fn key_ref_unifies_integral_floats_and_missing_kinds() {
        let float = Scalar::Float64(3.0);
        let int = Scalar::Int64(3);
        assert_eq!(KeyRef::from_scalar(&float), KeyRef::from_scalar(&int));

        let nan = Scalar::Null(NullKind::NaN);
        let null = Scalar::Null(NullKind::Null);
        assert_eq!(KeyRef::from_scalar(&nan), KeyRef::from_scalar(&null));
        assert!(KeyRef::from_scalar(&nan).is_missing());
    }

    #[test]
    fn filter_and_take_keep_dtype() {
        let column = ints(&[1, 2, 3]);
        let filtered = column.filter(&[true, false, true]).expect("filter");
        assert_eq!(filtered.values(), &[Scalar::Int64(1), Scalar::Int64(3)]);
        assert_eq!(filtered.dtype(), DType::Int64);

        let err = column.filter(&[true]).expect_err("length mismatch");
        assert_eq!(err.to_string(), "columns disagree on row count (3 vs 1)");
    }
}
