//! Reducers over a bag of cells, shared by the aggregation modes and by
//! the row-wise aggregate functions of `eval`. Missing cells are skipped.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use sq_columnar::KeyRef;
use sq_types::{DType, Scalar, TypeError};

/// Numeric view of a cell: integers stay exact until they overflow.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    pub fn from_scalar(value: &Scalar) -> Result<Self, TypeError> {
        match value {
            Scalar::Int64(v) => Ok(Self::Int(*v)),
            Scalar::Bool(v) => Ok(Self::Int(i64::from(*v))),
            Scalar::Float64(v) => Ok(Self::Float(*v)),
            Scalar::Datetime(ms) => Ok(Self::Int(*ms)),
            Scalar::Utf8(text) => match Scalar::infer_from_text(text) {
                Scalar::Int64(v) => Ok(Self::Int(v)),
                Scalar::Float64(v) => Ok(Self::Float(v)),
                _ => Err(TypeError::NonNumericValue {
                    value: text.clone(),
                    dtype: DType::Utf8,
                }),
            },
            Scalar::Null(kind) => Err(TypeError::ValueIsMissing { kind: *kind }),
            Scalar::List(_) => Err(TypeError::NonNumericValue {
                value: value.render(),
                dtype: DType::List,
            }),
        }
    }

    #[must_use]
    pub fn as_f64(self) -> f64 {
        match self {
            Self::Int(v) => v as f64,
            Self::Float(v) => v,
        }
    }

    #[must_use]
    pub fn add(self, other: Self) -> Self {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a
                .checked_add(b)
                .map_or(Self::Float(a as f64 + b as f64), Self::Int),
            (a, b) => Self::Float(a.as_f64() + b.as_f64()),
        }
    }

    #[must_use]
    pub fn sub(self, other: Self) -> Self {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a
                .checked_sub(b)
                .map_or(Self::Float(a as f64 - b as f64), Self::Int),
            (a, b) => Self::Float(a.as_f64() - b.as_f64()),
        }
    }

    #[must_use]
    pub fn into_scalar(self) -> Scalar {
        match self {
            Self::Int(v) => Scalar::Int64(v),
            Self::Float(v) => Scalar::Float64(v),
        }
    }
}

fn present<'a, 'b>(values: &'b [&'a Scalar]) -> impl Iterator<Item = &'a Scalar> + 'b {
    values.iter().copied().filter(|value| !value.is_missing())
}

fn numbers(values: &[&Scalar]) -> Result<Vec<Number>, TypeError> {
    present(values).map(Number::from_scalar).collect()
}

/// Non-missing cell count.
#[must_use]
pub fn count(values: &[&Scalar]) -> Scalar {
    Scalar::Int64(present(values).count() as i64)
}

pub fn sum(values: &[&Scalar]) -> Result<Scalar, TypeError> {
    Ok(numbers(values)?
        .into_iter()
        .reduce(Number::add)
        .map_or_else(Scalar::null, Number::into_scalar))
}

pub fn mean(values: &[&Scalar]) -> Result<Scalar, TypeError> {
    let numbers = numbers(values)?;
    if numbers.is_empty() {
        return Ok(Scalar::null());
    }
    let total = numbers.iter().map(|n| n.as_f64()).sum::<f64>();
    Ok(Scalar::Float64(total / numbers.len() as f64))
}

/// Middle value; the mean of the two middles for an even count.
pub fn median(values: &[&Scalar]) -> Result<Scalar, TypeError> {
    let mut numbers = numbers(values)?;
    if numbers.is_empty() {
        return Ok(Scalar::null());
    }
    numbers.sort_by(|a, b| a.as_f64().total_cmp(&b.as_f64()));
    let mid = numbers.len() / 2;
    if numbers.len() % 2 == 1 {
        Ok(numbers[mid].into_scalar())
    } else {
        Ok(Scalar::Float64(
            (numbers[mid - 1].as_f64() + numbers[mid].as_f64()) / 2.0,
        ))
    }
}

/// Most frequent value; ties go to the value encountered first.
#[must_use]
pub fn mode(values: &[&Scalar]) -> Scalar {
    let mut counts = HashMap::<KeyRef<'_>, (usize, usize)>::new();
    for (position, value) in present(values).enumerate() {
        counts
            .entry(KeyRef::from_scalar(value))
            .or_insert((0, position))
            .0 += 1;
    }
    let Some((_, first)) = counts.values().copied().max_by(|(ca, fa), (cb, fb)| {
        ca.cmp(cb).then_with(|| fb.cmp(fa))
    }) else {
        return Scalar::null();
    };
    present(values)
        .nth(first)
        .cloned()
        .unwrap_or_else(Scalar::null)
}

/// Distinct non-missing values.
#[must_use]
pub fn dcount(values: &[&Scalar]) -> Scalar {
    let distinct = present(values)
        .map(KeyRef::from_scalar)
        .collect::<HashSet<_>>();
    Scalar::Int64(distinct.len() as i64)
}

fn extreme(values: &[&Scalar], wanted: Ordering) -> Scalar {
    present(values)
        .reduce(|best, value| {
            if value.total_cmp(best) == wanted {
                value
            } else {
                best
            }
        })
        .cloned()
        .unwrap_or_else(Scalar::null)
}

#[must_use]
pub fn min(values: &[&Scalar]) -> Scalar {
    extreme(values, Ordering::Less)
}

#[must_use]
pub fn max(values: &[&Scalar]) -> Scalar {
    extreme(values, Ordering::Greater)
}

/// `max - min` over the numeric values.
pub fn range(values: &[&Scalar]) -> Result<Scalar, TypeError> {
    let numbers = numbers(values)?;
    let mut iter = numbers.into_iter();
    let Some(first) = iter.next() else {
        return Ok(Scalar::null());
    };
    let (lo, hi) = iter.fold((first, first), |(lo, hi), n| {
        (
            if n.as_f64() < lo.as_f64() { n } else { lo },
            if n.as_f64() > hi.as_f64() { n } else { hi },
        )
    });
    Ok(hi.sub(lo).into_scalar())
}

/// First-seen unique values as a multivalue cell; missing when there are
/// none.
#[must_use]
pub fn distinct_values(values: &[&Scalar]) -> Scalar {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for value in present(values) {
        if seen.insert(KeyRef::from_scalar(value)) {
            out.push(value.clone());
        }
    }
    if out.is_empty() {
        Scalar::null()
    } else {
        Scalar::List(out)
    }
}

#[must_use]
pub fn first(values: &[&Scalar]) -> Scalar {
    present(values).next().cloned().unwrap_or_else(Scalar::null)
}

#[must_use]
pub fn last(values: &[&Scalar]) -> Scalar {
    present(values).last().cloned().unwrap_or_else(Scalar::null)
}

#[cfg(test)]
mod tests {
    use sq_types::Scalar;

    use super::{count, dcount, distinct_values, mean, median, mode, range, sum};

    fn ints(values: &[i64]) -> Vec<Scalar> {
        values.iter().copied().map(Scalar::Int64).collect()
    }

    fn refs(values: &[Scalar]) -> Vec<&Scalar> {
        values.iter().collect()
    }

    #[test]
    fn median_averages_two_middles() {
        let odd = ints(&[5, 1, 3]);
        assert_eq!(median(&refs(&odd)).expect("median"), Scalar::Int64(3));
        let even = ints(&[4, 1, 3, 2]);
        assert_eq!(median(&refs(&even)).expect("median"), Scalar::Float64(2.5));
    }

    #[test]
    fn mode_breaks_ties_by_first_encounter() {
        let values = ints(&[7, 3, 3, 7, 1]);
        assert_eq!(mode(&refs(&values)), Scalar::Int64(7));
        let values = ints(&[2, 9, 9]);
        assert_eq!(mode(&refs(&values)), Scalar::Int64(9));
    }

    #[test]
    fn missing_values_are_ignored() {
        let values = vec![Scalar::Int64(1), Scalar::null(), Scalar::Int64(1), Scalar::Int64(4)];
        let values = refs(&values);
        assert_eq!(count(&values), Scalar::Int64(3));
        assert_eq!(dcount(&values), Scalar::Int64(2));
        assert_eq!(sum(&values).expect("sum"), Scalar::Int64(6));
        assert_eq!(mean(&values).expect("mean"), Scalar::Float64(2.0));
        assert_eq!(range(&values).expect("range"), Scalar::Int64(3));
        assert_eq!(
            distinct_values(&values),
            Scalar::List(vec![Scalar::Int64(1), Scalar::Int64(4)])
        );
    }

    #[test]
    fn empty_input_is_missing() {
        let none: Vec<&Scalar> = Vec::new();
        assert_eq!(sum(&none).expect("sum"), Scalar::null());
        assert_eq!(median(&none).expect("median"), Scalar::null());
        assert_eq!(mode(&none), Scalar::null());
        assert_eq!(count(&none), Scalar::Int64(0));
    }

    #[test]
    fn non_numeric_sum_is_a_type_error() {
        let values = vec![Scalar::Utf8("abc".to_owned())];
        assert!(sum(&refs(&values)).is_err());
    }
}
