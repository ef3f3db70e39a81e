use sq_filter::CompiledFilter;
use sq_frame::Table;

use crate::directive::Invocation;
use crate::error::DirectiveError;

/// `search` and `where`: keep the rows the predicate marks true.
pub(crate) fn search(table: Table, inv: &Invocation<'_>) -> Result<Table, DirectiveError> {
    if inv.args.is_empty() {
        return Ok(table);
    }
    let filter = CompiledFilter::from_tokens(inv.args, inv.text)?;
    Ok(filter.apply(&table)?)
}

#[cfg(test)]
mod tests {
    use sq_frame::Table;
    use sq_lexer::split_query;
    use sq_types::Scalar;

    use super::search;
    use crate::directive::Invocation;
    use crate::error::{DirectiveError, ErrorKind};

    fn run(table: Table, query: &str) -> Result<Table, DirectiveError> {
        let split = split_query(query).expect("split");
        let inv = Invocation::resolve(&split.segments[0]).expect("resolve");
        search(table, &inv)
    }

    fn sample() -> Table {
        Table::from_dict(vec![
            ("status", vec![Scalar::Int64(200), Scalar::Int64(404), Scalar::Int64(500)]),
            (
                "host",
                vec![
                    Scalar::Utf8("a".into()),
                    Scalar::Utf8("b".into()),
                    Scalar::Utf8("a".into()),
                ],
            ),
        ])
        .expect("table")
    }

    #[test]
    fn where_keeps_matching_rows() {
        let out = run(sample(), "| where status >= 400 host=\"a\"").expect("where");
        assert_eq!(out.column("status").expect("status").values(), &[Scalar::Int64(500)]);
    }

    #[test]
    fn empty_search_is_identity() {
        let out = run(sample(), "| search").expect("search");
        assert_eq!(out.row_count(), 3);
    }

    #[test]
    fn unknown_field_is_missing_column() {
        let err = run(sample(), "| where nope=1").expect_err("missing");
        assert_eq!(err.kind(), ErrorKind::MissingColumn);
    }
}
