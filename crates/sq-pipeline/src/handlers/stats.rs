use sq_expr::apply_assignments;
use sq_frame::Table;
use sq_groupby::{Span, StatsClause, bin_numeric_column, bin_time_column, eventstats, stats, streamstats};
use sq_types::DType;

use crate::args::{Args, syntax};
use crate::directive::{Directive, Invocation};
use crate::engine::Exec;
use crate::error::DirectiveError;

pub(crate) fn eval(
    exec: &Exec<'_>,
    table: Table,
    inv: &Invocation<'_>,
) -> Result<Table, DirectiveError> {
    if inv.text.is_empty() {
        return Err(syntax("eval", "expected at least one assignment"));
    }
    Ok(apply_assignments(&table, inv.text, exec.eval_options())?)
}

/// `stats`, `eventstats` and `streamstats` share one clause grammar.
pub(crate) fn aggregate(
    directive: Directive,
    table: Table,
    inv: &Invocation<'_>,
) -> Result<Table, DirectiveError> {
    let clause = StatsClause::from_tokens(inv.args, inv.text)?;
    let out = match directive {
        Directive::EventStats => eventstats(&table, &clause)?,
        Directive::StreamStats => streamstats(&table, &clause)?,
        _ => stats(&table, &clause)?,
    };
    Ok(out)
}

pub(crate) fn timechart(
    exec: &Exec<'_>,
    table: Table,
    inv: &Invocation<'_>,
) -> Result<Table, DirectiveError> {
    let span = Span::parse(&exec.policy().default_span)?;
    Ok(sq_groupby::timechart(&table, inv.text, span)?)
}

/// `bin <field> [span=<span>]`. A bare-number span on a numeric field
/// floors to multiples of that number; anything else buckets time.
pub(crate) fn bin(
    exec: &Exec<'_>,
    table: Table,
    inv: &Invocation<'_>,
) -> Result<Table, DirectiveError> {
    let args = Args::parse(inv.args);
    let [field] = args.names().try_into().map_err(|names: Vec<String>| {
        syntax("bin", format!("expected one field, got {}", names.len()))
    })?;
    let span_text = args
        .option("span")
        .map_or_else(|| exec.policy().default_span.clone(), str::to_owned);
    let column = table.require_column(&field)?;

    let numeric = matches!(column.dtype(), DType::Int64 | DType::Float64);
    let binned = match span_text.trim().parse::<f64>() {
        Ok(width) if numeric => bin_numeric_column(&field, column, width)?,
        _ => bin_time_column(&field, column, Span::parse(&span_text)?)?,
    };
    Ok(table.with_column(field, binned)?)
}

#[cfg(test)]
mod tests {
    use sq_frame::Table;
    use sq_types::Scalar;

    use crate::engine::Engine;
    use crate::error::ErrorKind;

    fn run(table: Table, pipeline: &str) -> Table {
        Engine::default()
            .run_pipeline(table, pipeline)
            .expect("pipeline")
    }

    #[test]
    fn eval_then_stats_by_group() {
        let table = Table::from_dict(vec![
            ("g", vec![Scalar::Utf8("a".into()), Scalar::Utf8("b".into()), Scalar::Utf8("a".into())]),
            ("x", vec![Scalar::Int64(1), Scalar::Int64(2), Scalar::Int64(3)]),
        ])
        .expect("table");
        let out = run(table, "eval y = x * 10 | stats sum(y) as total by g");
        assert_eq!(out.column_names(), &["g".to_owned(), "total".to_owned()]);
        assert_eq!(
            out.column("total").expect("total").values(),
            &[Scalar::Int64(40), Scalar::Int64(20)]
        );
    }

    #[test]
    fn bin_numeric_floors_to_width() {
        let table = Table::from_dict(vec![(
            "latency",
            vec![Scalar::Int64(3), Scalar::Int64(17), Scalar::Int64(25)],
        )])
        .expect("table");
        let out = run(table, "bin latency span=10");
        assert_eq!(
            out.column("latency").expect("latency").values(),
            &[Scalar::Int64(0), Scalar::Int64(10), Scalar::Int64(20)]
        );
    }

    #[test]
    fn bin_time_uses_policy_span_by_default() {
        let table = Table::from_dict(vec![(
            "_time",
            vec![
                Scalar::Utf8("2024-01-01 10:15:00".into()),
                Scalar::Utf8("2024-01-01 10:45:00".into()),
            ],
        )])
        .expect("table");
        let out = run(table, "bin _time | stats count by _time");
        assert_eq!(out.row_count(), 1);
        assert_eq!(out.column("count").expect("count").values(), &[Scalar::Int64(2)]);
    }

    #[test]
    fn unknown_aggregate_is_aggregation_error() {
        let table = Table::from_dict(vec![("x", vec![Scalar::Int64(1)])]).expect("table");
        let err = Engine::default()
            .run_pipeline(table, "stats p99(x)")
            .expect_err("unknown function");
        assert_eq!(err.kind(), ErrorKind::Aggregation);
    }
}
