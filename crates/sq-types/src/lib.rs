#![forbid(unsafe_code)]

use std::cmp::Ordering;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    Null,
    Bool,
    Int64,
    Float64,
    Datetime,
    Utf8,
    List,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NullKind {
    Null,
    NaN,
    NaT,
}

/// One table cell.
///
/// `Datetime` holds UTC epoch milliseconds. `List` is a multivalue cell;
/// nested lists are allowed but directives only ever produce one level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Scalar {
    Null(NullKind),
    Bool(bool),
    Int64(i64),
    Float64(f64),
    Datetime(i64),
    Utf8(String),
    List(Vec<Scalar>),
}

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%m/%d/%Y %H:%M:%S",
];

impl Scalar {
    #[must_use]
    pub fn null() -> Self {
        Self::Null(NullKind::Null)
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        match self {
            Self::Null(_) => DType::Null,
            Self::Bool(_) => DType::Bool,
            Self::Int64(_) => DType::Int64,
            Self::Float64(_) => DType::Float64,
            Self::Datetime(_) => DType::Datetime,
            Self::Utf8(_) => DType::Utf8,
            Self::List(_) => DType::List,
        }
    }

    #[must_use]
    pub fn is_missing(&self) -> bool {
        match self {
            Self::Null(_) => true,
            Self::Float64(v) => v.is_nan(),
            _ => false,
        }
    }

    #[must_use]
    pub fn is_nan(&self) -> bool {
        matches!(self, Self::Null(NullKind::NaN)) || matches!(self, Self::Float64(v) if v.is_nan())
    }

    #[must_use]
    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Int64(_) | Self::Float64(_)) && !self.is_missing()
    }

    #[must_use]
    pub fn missing_for_dtype(dtype: DType) -> Self {
        match dtype {
            DType::Float64 => Self::Null(NullKind::NaN),
            DType::Datetime => Self::Null(NullKind::NaT),
            DType::Null | DType::Bool | DType::Int64 | DType::Utf8 | DType::List => {
                Self::Null(NullKind::Null)
            }
        }
    }

    #[must_use]
    pub fn semantic_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Float64(a), Self::Float64(b)) => (a.is_nan() && b.is_nan()) || (a == b),
            (Self::Null(_), Self::Float64(v)) | (Self::Float64(v), Self::Null(_)) => v.is_nan(),
            (Self::Null(_), Self::Null(_)) => true,
            (Self::List(a), Self::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(l, r)| l.semantic_eq(r))
            }
            _ => self == other,
        }
    }

    pub fn to_f64(&self) -> Result<f64, TypeError> {
        match self {
            Self::Bool(v) => Ok(if *v { 1.0 } else { 0.0 }),
            Self::Int64(v) => Ok(*v as f64),
            Self::Float64(v) => Ok(*v),
            Self::Datetime(v) => Ok(*v as f64),
            Self::Null(kind) => Err(TypeError::ValueIsMissing { kind: *kind }),
            Self::Utf8(v) => Err(TypeError::NonNumericValue {
                value: v.clone(),
                dtype: DType::Utf8,
            }),
            Self::List(_) => Err(TypeError::NonNumericValue {
                value: self.render(),
                dtype: DType::List,
            }),
        }
    }

    /// Numeric view used by comparisons: numbers as-is, numeric-looking
    /// strings parsed, everything else `None`.
    #[must_use]
    pub fn numeric_value(&self) -> Option<f64> {
        match self {
            Self::Int64(v) => Some(*v as f64),
            Self::Float64(v) if !v.is_nan() => Some(*v),
            Self::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            Self::Utf8(text) => match Self::infer_from_text(text) {
                Self::Int64(v) => Some(v as f64),
                Self::Float64(v) => Some(v),
                _ => None,
            },
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Utf8(v) => Some(v),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Null(_) => false,
            Self::Bool(v) => *v,
            Self::Int64(v) => *v != 0,
            Self::Float64(v) => !v.is_nan() && *v != 0.0,
            Self::Datetime(_) => true,
            Self::Utf8(v) => !v.is_empty(),
            Self::List(v) => !v.is_empty(),
        }
    }

    /// Text form used by `concat`, `tostring`, group keys and file output.
    /// Missing values render as the empty string.
    #[must_use]
    pub fn render(&self) -> String {
        match self {
            Self::Null(_) => String::new(),
            Self::Bool(v) => v.to_string(),
            Self::Int64(v) => v.to_string(),
            Self::Float64(v) => render_float(*v),
            Self::Datetime(ms) => render_datetime(*ms),
            Self::Utf8(v) => v.clone(),
            Self::List(items) => items
                .iter()
                .map(Self::render)
                .collect::<Vec<_>>()
                .join(" "),
        }
    }

    /// Literal inference shared by lexers and file readers: empty text is
    /// missing, then int64, float64, bool, and finally a plain string.
    #[must_use]
    pub fn infer_from_text(text: &str) -> Self {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Self::Null(NullKind::Null);
        }

        if let Ok(value) = trimmed.parse::<i64>() {
            return Self::Int64(value);
        }
        if trimmed.bytes().any(|b| b.is_ascii_digit())
            && let Ok(value) = trimmed.parse::<f64>()
        {
            return Self::Float64(value);
        }
        if let Ok(value) = trimmed.parse::<bool>() {
            return Self::Bool(value);
        }

        Self::Utf8(trimmed.to_owned())
    }

    /// Ordering for comparison operators. Numbers compare numerically (a
    /// numeric-looking string compares as its number), strings
    /// lexicographically, datetimes against datetimes or parseable date
    /// strings. Missing or incomparable pairs yield `None`.
    #[must_use]
    pub fn partial_compare(&self, other: &Self) -> Option<Ordering> {
        if self.is_missing() || other.is_missing() {
            return None;
        }
        match (self, other) {
            (Self::Int64(a), Self::Int64(b)) => Some(a.cmp(b)),
            (Self::Utf8(a), Self::Utf8(b)) => Some(a.cmp(b)),
            (Self::Bool(a), Self::Bool(b)) => Some(a.cmp(b)),
            (Self::Datetime(a), Self::Datetime(b)) => Some(a.cmp(b)),
            (Self::Datetime(a), Self::Utf8(text)) => parse_datetime_millis(text).map(|b| a.cmp(&b)),
            (Self::Utf8(text), Self::Datetime(b)) => parse_datetime_millis(text).map(|a| a.cmp(b)),
            (Self::List(a), Self::List(b)) => Some(compare_lists(a, b)),
            (Self::List(_), _) | (_, Self::List(_)) => None,
            _ => {
                let a = self.numeric_value()?;
                let b = other.numeric_value()?;
                a.partial_cmp(&b)
            }
        }
    }

    /// Total ordering used for sorting, min/max and group output:
    /// missing < bool < numeric < datetime < string < list.
    #[must_use]
    pub fn total_cmp(&self, other: &Self) -> Ordering {
        let rank = |value: &Self| match value {
            v if v.is_missing() => 0_u8,
            Self::Bool(_) => 1,
            Self::Int64(_) | Self::Float64(_) => 2,
            Self::Datetime(_) => 3,
            Self::Utf8(_) => 4,
            Self::List(_) => 5,
            Self::Null(_) => 0,
        };
        let (left_rank, right_rank) = (rank(self), rank(other));
        if left_rank != right_rank {
            return left_rank.cmp(&right_rank);
        }
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::Int64(a), Self::Int64(b)) => a.cmp(b),
            (Self::Int64(_) | Self::Float64(_), Self::Int64(_) | Self::Float64(_)) => {
                let a = self.to_f64().unwrap_or(f64::NAN);
                let b = other.to_f64().unwrap_or(f64::NAN);
                a.total_cmp(&b)
            }
            (Self::Datetime(a), Self::Datetime(b)) => a.cmp(b),
            (Self::Utf8(a), Self::Utf8(b)) => a.cmp(b),
            (Self::List(a), Self::List(b)) => compare_lists(a, b),
            _ => Ordering::Equal,
        }
    }
}

fn compare_lists(left: &[Scalar], right: &[Scalar]) -> Ordering {
    for (a, b) in left.iter().zip(right) {
        let ord = a.total_cmp(b);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    left.len().cmp(&right.len())
}

fn render_float(value: f64) -> String {
    if value.is_nan() {
        String::new()
    } else if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e16 {
        format!("{value:.1}")
    } else {
        value.to_string()
    }
}

#[must_use]
pub fn render_datetime(epoch_millis: i64) -> String {
    match DateTime::from_timestamp_millis(epoch_millis) {
        Some(ts) if epoch_millis.rem_euclid(1000) == 0 => {
            ts.format("%Y-%m-%d %H:%M:%S").to_string()
        }
        Some(ts) => ts.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        None => epoch_millis.to_string(),
    }
}

/// Parses the date/time spellings found in event data into UTC epoch
/// milliseconds. Naive timestamps are taken as UTC.
#[must_use]
pub fn parse_datetime_millis(text: &str) -> Option<i64> {
    let trimmed = text.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(ts.timestamp_millis());
    }
    for format in DATETIME_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(ts.and_utc().timestamp_millis());
        }
    }
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|ts| ts.and_utc().timestamp_millis())
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TypeError {
    #[error("{left:?} and {right:?} values cannot share a column")]
    IncompatibleDtypes { left: DType, right: DType },
    #[error("no conversion from {from:?} to {to:?}")]
    InvalidCast { from: DType, to: DType },
    #[error("{value} is not a whole number")]
    LossyFloatToInt { value: f64 },
    #[error("integer {value} is not a boolean (0 or 1)")]
    InvalidBoolInt { value: i64 },
    #[error("float {value} is not a boolean (0.0 or 1.0)")]
    InvalidBoolFloat { value: f64 },
    #[error("{value:?} ({dtype:?}) is not numeric")]
    NonNumericValue { value: String, dtype: DType },
    #[error("value {value:?} cannot be parsed as a number")]
    InvalidNumber { value: String },
    #[error("value {value:?} cannot be parsed as a timestamp")]
    InvalidDatetime { value: String },
    #[error("missing value ({kind:?})")]
    ValueIsMissing { kind: NullKind },
}

pub fn common_dtype(left: DType, right: DType) -> Result<DType, TypeError> {
    use DType::{Bool, Float64, Int64, List, Null};

    let out = match (left, right) {
        (a, b) if a == b => a,
        (Null, other) | (other, Null) => other,
        (List, _) | (_, List) => List,
        (Bool, Int64) | (Int64, Bool) => Int64,
        (Bool, Float64) | (Float64, Bool) => Float64,
        (Int64, Float64) | (Float64, Int64) => Float64,
        _ => return Err(TypeError::IncompatibleDtypes { left, right }),
    };

    Ok(out)
}

pub fn infer_dtype(values: &[Scalar]) -> Result<DType, TypeError> {
    let mut current = DType::Null;
    for value in values {
        current = common_dtype(current, value.dtype())?;
    }
    Ok(current)
}

pub fn cast_scalar(value: &Scalar, target: DType) -> Result<Scalar, TypeError> {
    let from = value.dtype();
    if from == target || matches!(value, Scalar::Null(_)) {
        return Ok(match value {
            Scalar::Null(_) => Scalar::missing_for_dtype(target),
            _ => value.clone(),
        });
    }

    match target {
        DType::Null => Ok(Scalar::Null(NullKind::Null)),
        DType::Bool => match value {
            Scalar::Int64(0) => Ok(Scalar::Bool(false)),
            Scalar::Int64(1) => Ok(Scalar::Bool(true)),
            Scalar::Int64(v) => Err(TypeError::InvalidBoolInt { value: *v }),
            Scalar::Float64(v) if *v == 0.0 || *v == 1.0 => Ok(Scalar::Bool(*v == 1.0)),
            Scalar::Float64(v) => Err(TypeError::InvalidBoolFloat { value: *v }),
            _ => Err(TypeError::InvalidCast { from, to: target }),
        },
        DType::Int64 => match value {
            Scalar::Bool(flag) => Ok(Scalar::Int64(i64::from(*flag))),
            // 2^63 is the first float past i64::MAX.
            Scalar::Float64(v) if v.fract() == 0.0 && v.abs() < 9.223_372_036_854_775_808e18 => {
                Ok(Scalar::Int64(*v as i64))
            }
            Scalar::Float64(v) => Err(TypeError::LossyFloatToInt { value: *v }),
            _ => Err(TypeError::InvalidCast { from, to: target }),
        },
        DType::Float64 => match value {
            Scalar::Bool(flag) => Ok(Scalar::Float64(f64::from(u8::from(*flag)))),
            Scalar::Int64(v) => Ok(Scalar::Float64(*v as f64)),
            _ => Err(TypeError::InvalidCast { from, to: target }),
        },
        DType::Datetime => match value {
            Scalar::Utf8(text) => parse_datetime_millis(text)
                .map(Scalar::Datetime)
                .ok_or_else(|| TypeError::InvalidDatetime {
                    value: text.clone(),
                }),
            _ => Err(TypeError::InvalidCast { from, to: target }),
        },
        DType::List => Ok(Scalar::List(vec![value.clone()])),
        DType::Utf8 => Err(TypeError::InvalidCast { from, to: target }),
    }
}
