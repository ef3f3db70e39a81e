use std::collections::{HashMap, HashSet};

use sq_columnar::{Column, KeyRef};
use sq_frame::{SortKey, Table};
use sq_lexer::{Token, TokenKind};
use sq_types::Scalar;

use super::{put_column, require};
use crate::args::{Args, configuration, field_names, leading_count, syntax};
use crate::directive::Invocation;
use crate::engine::Exec;
use crate::error::DirectiveError;

/// `rename a as b, c as d`.
pub(crate) fn rename(table: Table, inv: &Invocation<'_>) -> Result<Table, DirectiveError> {
    let words: Vec<&Token> = inv.args.iter().filter(|t| !t.is_punct(",")).collect();
    if words.is_empty() || words.len() % 3 != 0 {
        return Err(syntax("rename", "expected `<field> as <new>` pairs"));
    }
    let mut out = table;
    for triple in words.chunks(3) {
        if !triple[1].is_keyword("as") {
            return Err(syntax("rename", format!("expected `as`, got {:?}", triple[1].value)));
        }
        let (old, new) = (triple[0].unquoted(), triple[2].unquoted());
        if !out.has_column(&old) {
            return Err(DirectiveError::MissingColumn(old));
        }
        out = out.rename(&old, &new)?;
    }
    Ok(out)
}

/// `fields [+|-] f1 f2` and its alias `table`.
pub(crate) fn fields(table: Table, inv: &Invocation<'_>) -> Result<Table, DirectiveError> {
    let (drop, rest) = match inv.args.split_first() {
        Some((first, rest)) if first.is_operator("-") => (true, rest),
        Some((first, rest)) if first.is_operator("+") => (false, rest),
        _ => (false, inv.args),
    };
    let names = field_names(rest);
    if names.is_empty() {
        return Err(syntax("fields", "expected at least one field"));
    }
    if drop {
        return Ok(table.without_columns(&names));
    }
    Ok(table.select(&names)?)
}

/// Like `fields +`, but absent fields become all-null columns.
pub(crate) fn maketable(table: Table, inv: &Invocation<'_>) -> Result<Table, DirectiveError> {
    let mut names = field_names(inv.args);
    if names.is_empty() {
        return Err(syntax("maketable", "expected at least one field"));
    }
    let mut seen = HashSet::new();
    names.retain(|name| seen.insert(name.clone()));

    let rows = table.row_count();
    let columns = names
        .into_iter()
        .map(|name| {
            let column = table
                .column(&name)
                .cloned()
                .unwrap_or_else(|| Column::nulls(rows));
            (name, column)
        })
        .collect();
    Ok(Table::with_row_count(rows, columns)?)
}

/// `head [N]`, `limit [N]`, `head count=N`.
pub(crate) fn head(exec: &Exec<'_>, table: Table, inv: &Invocation<'_>) -> Result<Table, DirectiveError> {
    let args = Args::parse(inv.args);
    let count = match (args.count("head", "count")?, leading_count(&args.positional)) {
        (Some(count), _) => count,
        (None, Some((count, []))) => count,
        (None, None) if args.positional.is_empty() => exec.policy().default_head_count,
        _ => return Err(syntax("head", "expected a row count")),
    };
    if count == 0 {
        return Err(configuration("head", "row count must be at least 1"));
    }
    Ok(table.head(count))
}

/// `dedup [N] f1 f2 [consecutive=true]`. Missing values are part of the
/// key, so two rows missing the same fields are duplicates.
pub(crate) fn dedup(table: Table, inv: &Invocation<'_>) -> Result<Table, DirectiveError> {
    let args = Args::parse(inv.args);
    let consecutive = args.flag("dedup", "consecutive")?.unwrap_or(false);
    let (keep, rest) = leading_count(&args.positional).unwrap_or((1, &args.positional[..]));
    if keep == 0 {
        return Err(configuration("dedup", "count must be at least 1"));
    }
    let names = field_names(rest);
    if names.is_empty() {
        return Err(syntax("dedup", "expected at least one field"));
    }
    let columns = names
        .iter()
        .map(|name| require(&table, name))
        .collect::<Result<Vec<_>, _>>()?;
    let key = |row: usize| {
        columns
            .iter()
            .map(|column| KeyRef::from_scalar(&column.values()[row]))
            .collect::<Vec<_>>()
    };

    let mut positions = Vec::new();
    if consecutive {
        let mut previous: Option<Vec<KeyRef<'_>>> = None;
        let mut run = 0_usize;
        for row in 0..table.row_count() {
            let current = key(row);
            if previous.as_ref() == Some(&current) {
                run += 1;
            } else {
                run = 1;
                previous = Some(current);
            }
            if run <= keep {
                positions.push(row);
            }
        }
    } else {
        let mut seen = HashMap::<Vec<KeyRef<'_>>, usize>::new();
        for row in 0..table.row_count() {
            let hits = seen.entry(key(row)).or_default();
            *hits += 1;
            if *hits <= keep {
                positions.push(row);
            }
        }
    }
    Ok(table.take_rows(&positions))
}

/// `sort [N] [+|-]f1, [+|-]f2`. N = 0 keeps every row.
pub(crate) fn sort(table: Table, inv: &Invocation<'_>) -> Result<Table, DirectiveError> {
    let (limit, rest) = leading_count(inv.args).unwrap_or((0, inv.args));
    let mut keys = Vec::new();
    let mut descending = false;
    for token in rest {
        match token.kind {
            TokenKind::Punctuation if token.value == "," => {}
            TokenKind::Operator if token.value == "-" => descending = true,
            TokenKind::Operator if token.value == "+" => descending = false,
            TokenKind::Identifier | TokenKind::StringLiteral => {
                let name = token.unquoted();
                keys.push(if descending {
                    SortKey::descending(name)
                } else {
                    SortKey::ascending(name)
                });
                descending = false;
            }
            _ => return Err(syntax("sort", format!("unexpected {:?}", token.value))),
        }
    }
    if keys.is_empty() {
        return Err(syntax("sort", "expected at least one field"));
    }
    let sorted = table.sort_by(&keys)?;
    Ok(if limit > 0 { sorted.head(limit) } else { sorted })
}

/// `fillnull value=<v> [f1 f2]`. A listed field the table lacks is
/// created filled with the value.
pub(crate) fn fillnull(table: Table, inv: &Invocation<'_>) -> Result<Table, DirectiveError> {
    let args = Args::parse(inv.args);
    let Some(value) = args.option("value") else {
        return Err(configuration("fillnull", "value= is required"));
    };
    let fill = Scalar::infer_from_text(value);
    let names = match args.names() {
        names if names.is_empty() => table.column_names().to_vec(),
        names => names,
    };

    let mut out = table;
    for name in &names {
        let filled = match out.column(name) {
            Some(column) => column
                .values()
                .iter()
                .map(|v| if v.is_missing() { fill.clone() } else { v.clone() })
                .collect(),
            None => vec![fill.clone(); out.row_count()],
        };
        out = put_column(&out, name, filled)?;
    }
    Ok(out)
}

/// `coalesce(a, b) [as name]` or `coalesce a b`: first value that is
/// neither missing nor empty.
pub(crate) fn coalesce(table: Table, inv: &Invocation<'_>) -> Result<Table, DirectiveError> {
    let mut fields = Vec::new();
    let mut output = "coalesce".to_owned();
    let mut tokens = inv.args.iter();
    while let Some(token) = tokens.next() {
        if token.is_punct("(") || token.is_punct(")") || token.is_punct(",") {
            continue;
        }
        if token.is_keyword("as") {
            let Some(name) = tokens.next() else {
                return Err(syntax("coalesce", "expected a name after `as`"));
            };
            output = name.unquoted();
            continue;
        }
        fields.push(token.unquoted());
    }
    if fields.is_empty() {
        return Err(syntax("coalesce", "expected at least one field"));
    }
    let columns = fields
        .iter()
        .map(|name| require(&table, name))
        .collect::<Result<Vec<_>, _>>()?;

    let values = (0..table.row_count())
        .map(|row| {
            columns
                .iter()
                .map(|column| &column.values()[row])
                .find(|v| !v.is_missing() && !matches!(v, Scalar::Utf8(s) if s.is_empty()))
                .cloned()
                .unwrap_or_else(Scalar::null)
        })
        .collect();
    put_column(&table, &output, values)
}

#[cfg(test)]
mod tests {
    use sq_frame::Table;
    use sq_types::Scalar;

    use crate::engine::Engine;
    use crate::error::{DirectiveError, EngineError, ErrorKind};

    fn s(value: &str) -> Scalar {
        Scalar::Utf8(value.to_owned())
    }

    fn sample() -> Table {
        Table::from_dict(vec![
            ("host", vec![s("a"), s("b"), s("a"), s("a"), s("c")]),
            (
                "bytes",
                vec![
                    Scalar::Int64(10),
                    Scalar::Int64(30),
                    Scalar::null(),
                    Scalar::Int64(20),
                    Scalar::Int64(5),
                ],
            ),
        ])
        .expect("table")
    }

    fn run(pipeline: &str) -> Result<Table, EngineError> {
        Engine::default().run_pipeline(sample(), pipeline)
    }

    #[test]
    fn rename_replaces_and_rejects_missing_sources() {
        let out = run("rename host as server, bytes as host").expect("rename");
        assert_eq!(out.column_names(), &["server".to_owned(), "host".to_owned()]);
        let err = run("rename nope as other").expect_err("missing");
        assert_eq!(err.kind(), ErrorKind::MissingColumn);
    }

    #[test]
    fn fields_projects_or_drops() {
        let out = run("fields bytes, host").expect("fields");
        assert_eq!(out.column_names(), &["bytes".to_owned(), "host".to_owned()]);
        let out = run("fields - bytes nope").expect("drop");
        assert_eq!(out.column_names(), &["host".to_owned()]);
        assert_eq!(run("table nope").expect_err("missing").kind(), ErrorKind::MissingColumn);
    }

    #[test]
    fn maketable_materialises_absent_fields() {
        let out = run("maketable host status").expect("maketable");
        assert_eq!(out.row_count(), 5);
        assert!(out.column("status").expect("status").values().iter().all(Scalar::is_missing));
    }

    #[test]
    fn head_defaults_and_validates() {
        assert_eq!(run("head").expect("head").row_count(), 5);
        assert_eq!(run("limit 2").expect("limit").row_count(), 2);
        assert_eq!(run("head count=3").expect("count").row_count(), 3);
        let err = run("head 0").expect_err("zero");
        assert!(matches!(
            err,
            EngineError::Directive { source: DirectiveError::Configuration { .. }, .. }
        ));
    }

    #[test]
    fn dedup_keeps_first_rows_per_key() {
        let out = run("dedup host").expect("dedup");
        assert_eq!(out.column("host").expect("host").values(), &[s("a"), s("b"), s("c")]);
        let out = run("dedup 2 host").expect("dedup 2");
        assert_eq!(out.column("host").expect("host").values(), &[s("a"), s("b"), s("a"), s("c")]);
        let out = run("dedup host consecutive=true").expect("consecutive");
        assert_eq!(
            out.column("host").expect("host").values(),
            &[s("a"), s("b"), s("a"), s("c")]
        );
    }

    #[test]
    fn sort_descending_puts_missing_last() {
        let out = run("sort -bytes").expect("sort");
        assert_eq!(
            out.column("bytes").expect("bytes").values(),
            &[
                Scalar::Int64(30),
                Scalar::Int64(20),
                Scalar::Int64(10),
                Scalar::Int64(5),
                Scalar::null()
            ]
        );
        let out = run("sort 2 host, -bytes").expect("sort limit");
        assert_eq!(
            out.column("bytes").expect("bytes").values(),
            &[Scalar::Int64(20), Scalar::Int64(10)]
        );
    }

    #[test]
    fn fillnull_requires_value() {
        let out = run("fillnull value=0 bytes").expect("fillnull");
        assert_eq!(out.column("bytes").expect("bytes").values()[2], Scalar::Int64(0));
        let err = run("fillnull bytes").expect_err("no value");
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn coalesce_skips_missing_and_empty() {
        let table = Table::from_dict(vec![
            ("a", vec![Scalar::null(), s(""), s("x")]),
            ("b", vec![s("y"), s("z"), s("w")]),
        ])
        .expect("table");
        let out = Engine::default()
            .run_pipeline(table, "coalesce(a, b) as first")
            .expect("coalesce");
        assert_eq!(out.column("first").expect("first").values(), &[s("y"), s("z"), s("x")]);
    }
}
