//! Multivalue directives. A list cell is a multivalue; a scalar counts
//! as a one-element multivalue and a missing cell as an empty one.

use std::collections::HashSet;

use regex::Regex;
use sq_columnar::{Column, KeyRef};
use sq_frame::Table;
use sq_lexer::{Token, TokenKind};
use sq_types::Scalar;

use super::{put_column, require};
use crate::args::{Args, field_names, syntax};
use crate::directive::Invocation;
use crate::error::DirectiveError;

fn elements(value: &Scalar) -> Vec<Scalar> {
    match value {
        Scalar::List(items) => items.clone(),
        v if v.is_missing() => Vec::new(),
        v => vec![v.clone()],
    }
}

fn list_or_null(items: Vec<Scalar>) -> Scalar {
    if items.is_empty() {
        Scalar::null()
    } else {
        Scalar::List(items)
    }
}

fn one_field(directive: &'static str, names: &[String]) -> Result<String, DirectiveError> {
    names
        .first()
        .cloned()
        .ok_or_else(|| syntax(directive, "expected a field"))
}

/// Rewrites list cells of one field in place; other cells pass through.
fn map_lists(
    table: Table,
    inv: &Invocation<'_>,
    directive: &'static str,
    f: impl Fn(&[Scalar]) -> Scalar,
) -> Result<Table, DirectiveError> {
    let field = one_field(directive, &field_names(inv.args))?;
    let values = require(&table, &field)?
        .values()
        .iter()
        .map(|value| match value {
            Scalar::List(items) => f(items),
            other => other.clone(),
        })
        .collect();
    put_column(&table, &field, values)
}

/// `mvexpand f`: one row per element; an empty multivalue keeps one row
/// with a missing cell.
pub(crate) fn expand(table: Table, inv: &Invocation<'_>) -> Result<Table, DirectiveError> {
    let field = one_field("mvexpand", &field_names(inv.args))?;
    let column = require(&table, &field)?;
    let mut positions = Vec::with_capacity(table.row_count());
    let mut values = Vec::with_capacity(table.row_count());
    for (row, value) in column.values().iter().enumerate() {
        let items = elements(value);
        if items.is_empty() {
            positions.push(row);
            values.push(Scalar::null());
            continue;
        }
        for item in items {
            positions.push(row);
            values.push(item);
        }
    }
    Ok(table
        .take_rows(&positions)
        .with_column(field, Column::from_values_lossy(values))?)
}

/// `mvjoin f delim=","` / `mvcombine f [delim=" "]`. A quoted second
/// argument also sets the delimiter.
pub(crate) fn join(
    table: Table,
    inv: &Invocation<'_>,
    default_delim: &str,
) -> Result<Table, DirectiveError> {
    let args = Args::parse(inv.args);
    let names = args.names();
    let delim = args
        .option("delim")
        .map(str::to_owned)
        .or_else(|| names.get(1).cloned())
        .unwrap_or_else(|| default_delim.to_owned());
    let field = one_field(inv.name(), &names)?;
    let values = require(&table, &field)?
        .values()
        .iter()
        .map(|value| match value {
            Scalar::List(items) => Scalar::Utf8(
                items
                    .iter()
                    .map(Scalar::render)
                    .collect::<Vec<_>>()
                    .join(&delim),
            ),
            other => other.clone(),
        })
        .collect();
    put_column(&table, &field, values)
}

/// Integer arguments, with `-` tokens folded into negative numbers.
fn signed_integers(directive: &'static str, tokens: &[Token]) -> Result<Vec<i64>, DirectiveError> {
    let mut out = Vec::new();
    let mut negative = false;
    for token in tokens {
        match token.kind {
            TokenKind::Punctuation if token.value == "," => {}
            TokenKind::Operator if token.value == "-" => negative = true,
            TokenKind::NumberLiteral => {
                let value = token
                    .value
                    .parse::<i64>()
                    .map_err(|_| syntax(directive, format!("invalid index {:?}", token.value)))?;
                out.push(if negative { -value } else { value });
                negative = false;
            }
            _ => return Err(syntax(directive, format!("invalid index {:?}", token.value))),
        }
    }
    Ok(out)
}

/// `mvindex f i [j ...]` into `mvindex`. Negative indexes count from the
/// end. With one index an out-of-range position is missing; with several,
/// out-of-range positions are skipped.
pub(crate) fn index(table: Table, inv: &Invocation<'_>) -> Result<Table, DirectiveError> {
    let Some((field, rest)) = inv.args.split_first() else {
        return Err(syntax("mvindex", "expected a field and an index"));
    };
    let indexes = signed_integers("mvindex", rest)?;
    if indexes.is_empty() {
        return Err(syntax("mvindex", "expected at least one index"));
    }
    let pick = |items: &[Scalar], idx: i64| -> Option<Scalar> {
        let len = items.len() as i64;
        let pos = if idx < 0 { len + idx } else { idx };
        (0..len).contains(&pos).then(|| items[pos as usize].clone())
    };
    let values = require(&table, &field.unquoted())?
        .values()
        .iter()
        .map(|value| {
            let items = elements(value);
            if let [only] = indexes.as_slice() {
                return pick(&items, *only).unwrap_or_else(Scalar::null);
            }
            list_or_null(indexes.iter().filter_map(|idx| pick(&items, *idx)).collect())
        })
        .collect();
    put_column(&table, "mvindex", values)
}

/// `mvcount f` into `f_count`.
pub(crate) fn count(table: Table, inv: &Invocation<'_>) -> Result<Table, DirectiveError> {
    let field = one_field("mvcount", &field_names(inv.args))?;
    let values = require(&table, &field)?
        .values()
        .iter()
        .map(|value| Scalar::Int64(elements(value).len() as i64))
        .collect();
    put_column(&table, &format!("{field}_count"), values)
}

/// `mvdc f` into `f_dc`.
pub(crate) fn distinct_count(table: Table, inv: &Invocation<'_>) -> Result<Table, DirectiveError> {
    let field = one_field("mvdc", &field_names(inv.args))?;
    let values = require(&table, &field)?
        .values()
        .iter()
        .map(|value| {
            let items = elements(value);
            let distinct: HashSet<KeyRef<'_>> = items
                .iter()
                .filter(|item| !item.is_missing())
                .map(KeyRef::from_scalar)
                .collect();
            Scalar::Int64(distinct.len() as i64)
        })
        .collect();
    put_column(&table, &format!("{field}_dc"), values)
}

/// `mvfind f "<regex>"` into `mvfind`: first matching position or -1.
pub(crate) fn find(table: Table, inv: &Invocation<'_>) -> Result<Table, DirectiveError> {
    let [field, pattern] = field_names(inv.args).try_into().map_err(|_: Vec<String>| {
        syntax("mvfind", "expected a field and a pattern")
    })?;
    let regex = Regex::new(&pattern)?;
    let values = require(&table, &field)?
        .values()
        .iter()
        .map(|value| {
            let found = elements(value)
                .iter()
                .position(|item| regex.is_match(&item.render()));
            Scalar::Int64(found.map_or(-1, |pos| pos as i64))
        })
        .collect();
    put_column(&table, "mvfind", values)
}

/// `mvzip a, b [delim]` into `mvzip`: pairwise `a<delim>b`.
pub(crate) fn zip(table: Table, inv: &Invocation<'_>) -> Result<Table, DirectiveError> {
    let args = Args::parse(inv.args);
    let names = args.names();
    let (Some(left), Some(right)) = (names.first(), names.get(1)) else {
        return Err(syntax("mvzip", "expected two fields"));
    };
    let delim = args
        .option("delim")
        .map(str::to_owned)
        .or_else(|| names.get(2).cloned())
        .unwrap_or_else(|| "_".to_owned());
    let left = require(&table, left)?;
    let right = require(&table, right)?;
    let values = left
        .values()
        .iter()
        .zip(right.values())
        .map(|(a, b)| {
            let pairs = elements(a)
                .iter()
                .zip(elements(b).iter())
                .map(|(a, b)| Scalar::Utf8(format!("{}{delim}{}", a.render(), b.render())))
                .collect();
            list_or_null(pairs)
        })
        .collect();
    put_column(&table, "mvzip", values)
}

pub(crate) fn reverse(table: Table, inv: &Invocation<'_>) -> Result<Table, DirectiveError> {
    map_lists(table, inv, "mvreverse", |items| {
        Scalar::List(items.iter().rev().cloned().collect())
    })
}

/// Drops repeated elements, keeping first occurrences in order.
pub(crate) fn dedup(table: Table, inv: &Invocation<'_>) -> Result<Table, DirectiveError> {
    map_lists(table, inv, "mvdedup", |items| {
        let mut seen = HashSet::new();
        Scalar::List(
            items
                .iter()
                .filter(|item| seen.insert(KeyRef::from_scalar(item)))
                .cloned()
                .collect(),
        )
    })
}

/// `mvappend f1, f2 ...`: every field's elements, concatenated into `f1`.
pub(crate) fn append(table: Table, inv: &Invocation<'_>) -> Result<Table, DirectiveError> {
    let names = field_names(inv.args);
    let target = one_field("mvappend", &names)?;
    let columns = names
        .iter()
        .map(|name| require(&table, name))
        .collect::<Result<Vec<_>, _>>()?;
    let values = (0..table.row_count())
        .map(|row| {
            list_or_null(
                columns
                    .iter()
                    .flat_map(|column| elements(&column.values()[row]))
                    .collect(),
            )
        })
        .collect();
    put_column(&table, &target, values)
}

/// `mvfilter f <value>` / `mvfilter f=<value>`: keeps elements whose
/// rendered text equals the value.
pub(crate) fn filter(table: Table, inv: &Invocation<'_>) -> Result<Table, DirectiveError> {
    let (field, wanted) = match inv.args {
        [field, op, value] if op.is_operator("=") => (field.unquoted(), value.unquoted()),
        [field, value] => (field.unquoted(), value.unquoted()),
        _ => return Err(syntax("mvfilter", "expected <field> <value>")),
    };
    let values = require(&table, &field)?
        .values()
        .iter()
        .map(|value| match value {
            Scalar::List(items) => Scalar::List(
                items
                    .iter()
                    .filter(|item| item.render() == wanted)
                    .cloned()
                    .collect(),
            ),
            other => other.clone(),
        })
        .collect();
    put_column(&table, &field, values)
}

#[cfg(test)]
mod tests {
    use sq_frame::Table;
    use sq_types::Scalar;

    use crate::engine::Engine;

    fn s(value: &str) -> Scalar {
        Scalar::Utf8(value.to_owned())
    }

    fn list(items: &[&str]) -> Scalar {
        Scalar::List(items.iter().map(|item| s(item)).collect())
    }

    fn sample() -> Table {
        Table::from_dict(vec![
            ("id", vec![Scalar::Int64(1), Scalar::Int64(2), Scalar::Int64(3)]),
            ("tags", vec![list(&["a", "b", "a"]), list(&[]), s("solo")]),
        ])
        .expect("table")
    }

    fn run(pipeline: &str) -> Table {
        Engine::default()
            .run_pipeline(sample(), pipeline)
            .expect("pipeline")
    }

    #[test]
    fn mvexpand_emits_one_row_per_element() {
        let out = run("mvexpand tags");
        assert_eq!(
            out.column("id").expect("id").values(),
            &[
                Scalar::Int64(1),
                Scalar::Int64(1),
                Scalar::Int64(1),
                Scalar::Int64(2),
                Scalar::Int64(3)
            ]
        );
        assert_eq!(out.column("tags").expect("tags").values()[3], Scalar::null());
    }

    #[test]
    fn mvcount_and_mvdc() {
        let out = run("mvcount tags | mvdc tags");
        assert_eq!(
            out.column("tags_count").expect("count").values(),
            &[Scalar::Int64(3), Scalar::Int64(0), Scalar::Int64(1)]
        );
        assert_eq!(
            out.column("tags_dc").expect("dc").values(),
            &[Scalar::Int64(2), Scalar::Int64(0), Scalar::Int64(1)]
        );
    }

    #[test]
    fn mvindex_counts_negative_from_the_end() {
        let out = run("mvindex tags -1");
        assert_eq!(
            out.column("mvindex").expect("mvindex").values(),
            &[s("a"), Scalar::null(), s("solo")]
        );
        let out = run("mvindex tags 0, 1");
        assert_eq!(out.column("mvindex").expect("mvindex").values()[0], list(&["a", "b"]));
    }

    #[test]
    fn mvjoin_and_mvcombine_delimiters() {
        let out = run(r#"mvjoin tags delim=",""#);
        assert_eq!(out.column("tags").expect("tags").values()[0], s("a,b,a"));
        let out = run("mvcombine tags");
        assert_eq!(out.column("tags").expect("tags").values()[0], s("a b a"));
    }

    #[test]
    fn mvfind_mvdedup_mvreverse_mvfilter() {
        let out = run(r#"mvfind tags "^b""#);
        assert_eq!(
            out.column("mvfind").expect("mvfind").values(),
            &[Scalar::Int64(1), Scalar::Int64(-1), Scalar::Int64(-1)]
        );
        let out = run("mvdedup tags | mvreverse tags");
        assert_eq!(out.column("tags").expect("tags").values()[0], list(&["b", "a"]));
        let out = run("mvfilter tags=a");
        assert_eq!(out.column("tags").expect("tags").values()[0], list(&["a", "a"]));
    }

    #[test]
    fn mvzip_and_mvappend() {
        let table = Table::from_dict(vec![
            ("k", vec![list(&["x", "y"])]),
            ("v", vec![list(&["1", "2", "3"])]),
        ])
        .expect("table");
        let out = Engine::default()
            .run_pipeline(table, r#"mvzip k, v "=" | mvappend k, v"#)
            .expect("pipeline");
        assert_eq!(out.column("mvzip").expect("mvzip").values()[0], list(&["x=1", "y=2"]));
        assert_eq!(
            out.column("k").expect("k").values()[0],
            list(&["x", "y", "1", "2", "3"])
        );
    }
}
