use std::collections::HashMap;

use sq_columnar::{Column, KeyRef};
use sq_frame::Table;
use sq_groupby::reduce;
use sq_types::{DType, Scalar};

use crate::args::{Args, configuration};
use crate::directive::Invocation;
use crate::error::DirectiveError;

const SUMMARY_COLUMNS: [&str; 10] = [
    "field",
    "count",
    "distinct_count",
    "is_exact",
    "max",
    "min",
    "mean",
    "stdev",
    "numeric_count",
    "values",
];

/// `fieldsummary [maxvals=N]`: one row per input field.
pub(crate) fn fieldsummary(table: Table, inv: &Invocation<'_>) -> Result<Table, DirectiveError> {
    let args = Args::parse(inv.args);
    if !args.positional.is_empty() {
        return Err(configuration("fieldsummary", "only maxvals= is accepted"));
    }
    let maxvals = args.count("fieldsummary", "maxvals")?.unwrap_or(10);

    let mut rows: Vec<Vec<Scalar>> = vec![Vec::with_capacity(table.width()); SUMMARY_COLUMNS.len()];
    for (name, column) in table.columns() {
        for (slot, value) in rows.iter_mut().zip(summarize(name, column, maxvals)?) {
            slot.push(value);
        }
    }
    let columns = SUMMARY_COLUMNS
        .iter()
        .zip(rows)
        .map(|(name, values)| ((*name).to_owned(), Column::from_values_lossy(values)))
        .collect();
    Ok(Table::with_row_count(table.width(), columns)?)
}

fn summarize(name: &str, column: &Column, maxvals: usize) -> Result<[Scalar; 10], DirectiveError> {
    let cells: Vec<&Scalar> = column.values().iter().collect();
    let present: Vec<&Scalar> = cells.iter().copied().filter(|v| !v.is_missing()).collect();
    let numeric = matches!(column.dtype(), DType::Int64 | DType::Float64);

    let (mean, stdev, numeric_count) = if numeric {
        let mean = reduce::mean(&present)?;
        (mean, sample_stdev(&present), Scalar::Int64(present.len() as i64))
    } else {
        (Scalar::null(), Scalar::null(), Scalar::Int64(0))
    };

    let (values, exact) = top_values(&present, maxvals);
    Ok([
        Scalar::Utf8(name.to_owned()),
        reduce::count(&cells),
        reduce::dcount(&cells),
        Scalar::Int64(i64::from(exact)),
        reduce::max(&cells),
        reduce::min(&cells),
        mean,
        stdev,
        numeric_count,
        values,
    ])
}

fn sample_stdev(values: &[&Scalar]) -> Scalar {
    let numbers: Vec<f64> = values.iter().filter_map(|v| v.numeric_value()).collect();
    if numbers.len() < 2 {
        return Scalar::null();
    }
    let n = numbers.len() as f64;
    let mean = numbers.iter().sum::<f64>() / n;
    let variance = numbers.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0);
    Scalar::Float64(variance.sqrt())
}

/// `value:count` strings, most frequent first; ties keep first-seen order.
/// Top `maxvals` `value:count` strings, and whether they cover every
/// distinct value.
fn top_values(values: &[&Scalar], maxvals: usize) -> (Scalar, bool) {
    let mut order: Vec<(&Scalar, usize)> = Vec::new();
    let mut slots = HashMap::<KeyRef<'_>, usize>::new();
    for &value in values {
        let slot = *slots.entry(KeyRef::from_scalar(value)).or_insert_with(|| {
            order.push((value, 0));
            order.len() - 1
        });
        order[slot].1 += 1;
    }
    order.sort_by(|a, b| b.1.cmp(&a.1));
    let exact = order.len() <= maxvals;
    let items: Vec<Scalar> = order
        .into_iter()
        .take(maxvals)
        .map(|(value, count)| Scalar::Utf8(format!("{}:{count}", value.render())))
        .collect();
    let values = if items.is_empty() {
        Scalar::null()
    } else {
        Scalar::List(items)
    };
    (values, exact)
}
