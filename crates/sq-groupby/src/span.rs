//! Time spans and fixed-width bucketing for `bin` and `timechart`.

use serde::{Deserialize, Serialize};
use sq_columnar::Column;
use sq_types::{Scalar, parse_datetime_millis};

use crate::StatsError;

const SECOND: i64 = 1_000;
const MINUTE: i64 = 60 * SECOND;
const HOUR: i64 = 60 * MINUTE;
const DAY: i64 = 24 * HOUR;
const WEEK: i64 = 7 * DAY;
const YEAR: i64 = 365 * DAY;

const UNITS: &[(&[&str], i64)] = &[
    (&["s", "sec", "secs", "second", "seconds"], SECOND),
    (&["m", "min", "mins", "minute", "minutes"], MINUTE),
    (&["h", "hr", "hrs", "hour", "hours"], HOUR),
    (&["d", "day", "days"], DAY),
    (&["w", "week", "weeks"], WEEK),
    (&["y", "yr", "yrs", "year", "years"], YEAR),
];

/// Canonical bucket width in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    millis: i64,
}

impl Span {
    #[must_use]
    pub fn millis(self) -> i64 {
        self.millis
    }

    /// Parses `<n><unit>` (`15m`, `1hour`, `2 days`); a missing count
    /// means 1.
    pub fn parse(text: &str) -> Result<Self, StatsError> {
        let normalized = text.trim().to_ascii_lowercase();
        let digits = normalized
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(normalized.len());
        let (count, unit) = normalized.split_at(digits);
        let count = if count.is_empty() {
            1
        } else {
            count
                .parse::<i64>()
                .map_err(|_| StatsError::InvalidSpan(text.to_owned()))?
        };
        let unit = unit.trim();
        let per_unit = UNITS
            .iter()
            .find(|(names, _)| names.contains(&unit))
            .map(|(_, millis)| *millis)
            .ok_or_else(|| StatsError::InvalidSpan(text.to_owned()))?;
        let millis = count
            .checked_mul(per_unit)
            .filter(|millis| *millis > 0)
            .ok_or_else(|| StatsError::InvalidSpan(text.to_owned()))?;
        Ok(Self { millis })
    }

    /// Start of the bucket holding `epoch_millis`.
    #[must_use]
    pub fn floor(self, epoch_millis: i64) -> i64 {
        epoch_millis.div_euclid(self.millis) * self.millis
    }
}

/// Reads a cell as epoch milliseconds: datetimes as-is, numbers as epoch
/// seconds, strings through the datetime parser.
#[must_use]
pub fn time_value(value: &Scalar) -> Option<i64> {
    match value {
        Scalar::Datetime(ms) => Some(*ms),
        Scalar::Int64(secs) => secs.checked_mul(SECOND),
        Scalar::Float64(secs) if secs.is_finite() => Some((secs * SECOND as f64).floor() as i64),
        Scalar::Utf8(text) => parse_datetime_millis(text),
        _ => None,
    }
}

/// Floors every cell of a time column to `span`. Missing cells stay missing.
pub fn bin_time_column(name: &str, column: &Column, span: Span) -> Result<Column, StatsError> {
    let values = column
        .values()
        .iter()
        .map(|value| {
            if value.is_missing() {
                return Ok(Scalar::null());
            }
            time_value(value)
                .map(|ms| Scalar::Datetime(span.floor(ms)))
                .ok_or_else(|| StatsError::InvalidTime {
                    column: name.to_owned(),
                    value: value.render(),
                })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Column::from_values_lossy(values))
}

/// Floors numeric cells to multiples of `width`. Integer cells stay
/// integral when `width` is a whole number.
pub fn bin_numeric_column(name: &str, column: &Column, width: f64) -> Result<Column, StatsError> {
    if !(width.is_finite() && width > 0.0) {
        return Err(StatsError::InvalidSpan(width.to_string()));
    }
    let whole = width.fract() == 0.0 && width < 9.0e15;
    let values = column
        .values()
        .iter()
        .map(|value| match value {
            v if v.is_missing() => Ok(Scalar::null()),
            Scalar::Int64(v) if whole => {
                let w = width as i64;
                Ok(Scalar::Int64(v.div_euclid(w) * w))
            }
            other => other
                .numeric_value()
                .map(|v| Scalar::Float64((v / width).floor() * width))
                .ok_or_else(|| StatsError::InvalidTime {
                    column: name.to_owned(),
                    value: other.render(),
                }),
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Column::from_values_lossy(values))
}
