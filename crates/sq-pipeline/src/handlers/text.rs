use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use regex::{Regex, RegexBuilder};
use serde_json::Value;
use sq_frame::Table;
use sq_io::json_to_scalar;
use sq_types::Scalar;

use super::{put_column, require};
use crate::args::{Args, configuration, syntax};
use crate::directive::Invocation;
use crate::error::DirectiveError;

const RAW_FIELD: &str = "_raw";

// ── rex ────────────────────────────────────────────────────────────────

/// `rex field=F [max_match=N] [mode=sed] "<pattern>"`.
pub(crate) fn rex(table: Table, inv: &Invocation<'_>) -> Result<Table, DirectiveError> {
    let args = Args::parse(inv.args);
    let Some(field) = args.option("field") else {
        return Err(configuration("rex", "field= is required"));
    };
    let [pattern] = args.names().try_into().map_err(|names: Vec<String>| {
        syntax("rex", format!("expected one pattern, got {}", names.len()))
    })?;
    let source = require(&table, field)?;

    if args.option("mode").is_some_and(|mode| mode.eq_ignore_ascii_case("sed")) {
        let sed = SedExpr::parse(&pattern)?;
        let values = source
            .values()
            .iter()
            .map(|value| match value {
                v if v.is_missing() => Scalar::null(),
                v => Scalar::Utf8(sed.apply(&v.render())),
            })
            .collect();
        return put_column(&table, field, values);
    }

    let regex = RegexBuilder::new(&pattern)
        .case_insensitive(true)
        .dot_matches_new_line(true)
        .build()?;
    let groups: Vec<&str> = regex.capture_names().flatten().collect();
    if groups.is_empty() {
        return Err(configuration("rex", "pattern has no named groups"));
    }
    // max_match=0 means every match.
    let limit = match args.count("rex", "max_match")?.unwrap_or(1) {
        0 => usize::MAX,
        n => n,
    };

    let mut extracted = vec![Vec::with_capacity(table.row_count()); groups.len()];
    for value in source.values() {
        let text = if value.is_missing() { None } else { Some(value.render()) };
        let captures: Vec<_> = text
            .as_deref()
            .map(|text| regex.captures_iter(text).take(limit).collect())
            .unwrap_or_default();
        for (slot, group) in extracted.iter_mut().zip(&groups) {
            let mut hits: Vec<Scalar> = captures
                .iter()
                .filter_map(|caps| caps.name(group))
                .map(|m| Scalar::Utf8(m.as_str().to_owned()))
                .collect();
            slot.push(match hits.len() {
                0 => Scalar::null(),
                1 => hits.remove(0),
                _ => Scalar::List(hits),
            });
        }
    }

    let mut out = table.clone();
    for (group, values) in groups.iter().zip(extracted) {
        let name = if table.has_column(group) {
            format!("{group}_rex")
        } else {
            (*group).to_owned()
        };
        out = put_column(&out, &name, values)?;
    }
    Ok(out)
}

/// `s/<regex>/<replacement>/[g]`.
#[derive(Debug)]
struct SedExpr {
    regex: Regex,
    replacement: String,
    global: bool,
}

impl SedExpr {
    fn parse(text: &str) -> Result<Self, DirectiveError> {
        let invalid = || syntax("rex", format!("invalid sed expression {text:?}"));
        let rest = text.strip_prefix('s').ok_or_else(invalid)?;
        let delimiter = rest.chars().next().ok_or_else(invalid)?;
        let parts = split_unescaped(&rest[delimiter.len_utf8()..], delimiter);
        let [pattern, replacement, flags] = <[String; 3]>::try_from(parts).map_err(|_| invalid())?;
        if flags.chars().any(|flag| flag != 'g') {
            return Err(invalid());
        }
        Ok(Self {
            regex: Regex::new(&pattern)?,
            replacement: backrefs_to_dollar(&replacement),
            global: flags.contains('g'),
        })
    }

    fn apply(&self, text: &str) -> String {
        if self.global {
            self.regex.replace_all(text, self.replacement.as_str()).into_owned()
        } else {
            self.regex.replace(text, self.replacement.as_str()).into_owned()
        }
    }
}

/// Splits on `delimiter` unless escaped; `\<delimiter>` loses its backslash.
fn split_unescaped(text: &str, delimiter: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' if chars.peek() == Some(&delimiter) => {
                current.push(delimiter);
                chars.next();
            }
            c if c == delimiter => parts.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }
    parts.push(current);
    parts
}

/// `\1` becomes `${1}`; a literal `$` is escaped as `$$`.
fn backrefs_to_dollar(replacement: &str) -> String {
    let mut out = String::with_capacity(replacement.len());
    let mut chars = replacement.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' if chars.peek().is_some_and(char::is_ascii_digit) => {
                let mut group = String::new();
                while let Some(digit) = chars.next_if(char::is_ascii_digit) {
                    group.push(digit);
                }
                out.push_str(&format!("${{{group}}}"));
            }
            '$' => out.push_str("$$"),
            c => out.push(c),
        }
    }
    out
}

// ── regex ──────────────────────────────────────────────────────────────

/// `regex F="<pattern>"`, `regex F!="<pattern>"` or a lone pattern
/// matched against `_raw`. Missing cells never match.
pub(crate) fn regex(table: Table, inv: &Invocation<'_>) -> Result<Table, DirectiveError> {
    let (field, negate, pattern) = match inv.args {
        [field, op, pattern] if op.is_operator("=") || op.is_operator("!=") => {
            (field.unquoted(), op.is_operator("!="), pattern.unquoted())
        }
        [pattern] => (RAW_FIELD.to_owned(), false, pattern.unquoted()),
        _ => return Err(syntax("regex", "expected <field>=\"<pattern>\"")),
    };
    let regex = Regex::new(&pattern)?;
    let column = require(&table, &field)?;
    let mask: Vec<bool> = column
        .values()
        .iter()
        .map(|value| {
            let hit = !value.is_missing() && regex.is_match(&value.render());
            hit != negate
        })
        .collect();
    Ok(table.filter_rows(&mask)?)
}

// ── base64 ─────────────────────────────────────────────────────────────

/// `base64 encode|decode f1 f2`, in place.
pub(crate) fn base64(table: Table, inv: &Invocation<'_>) -> Result<Table, DirectiveError> {
    let args = Args::parse(inv.args);
    let names = args.names();
    let Some((mode, fields)) = names.split_first() else {
        return Err(syntax("base64", "expected encode|decode and fields"));
    };
    let decode = match mode.to_ascii_lowercase().as_str() {
        "encode" => false,
        "decode" => true,
        other => return Err(syntax("base64", format!("unknown mode {other:?}"))),
    };
    if fields.is_empty() {
        return Err(syntax("base64", "expected at least one field"));
    }

    let mut out = table;
    for field in fields {
        let values = require(&out, field)?
            .values()
            .iter()
            .map(|value| match value {
                v if v.is_missing() => Ok(Scalar::null()),
                v if decode => decode_text(&v.render()).map(Scalar::Utf8),
                v => Ok(Scalar::Utf8(STANDARD.encode(v.render()))),
            })
            .collect::<Result<Vec<_>, _>>()?;
        out = put_column(&out, field, values)?;
    }
    Ok(out)
}

fn decode_text(text: &str) -> Result<String, DirectiveError> {
    let invalid = |message: String| DirectiveError::InvalidValue {
        directive: "base64",
        value: text.to_owned(),
        message,
    };
    let bytes = STANDARD.decode(text.trim()).map_err(|err| invalid(err.to_string()))?;
    String::from_utf8(bytes).map_err(|err| invalid(err.to_string()))
}

// ── spath ──────────────────────────────────────────────────────────────

/// `spath input=<f> [output=<o>] [path=a.b[0].c]`. Without a path every
/// top-level key of each object becomes a column.
pub(crate) fn spath(table: Table, inv: &Invocation<'_>) -> Result<Table, DirectiveError> {
    let args = Args::parse(inv.args);
    let input = args.option("input").unwrap_or(RAW_FIELD);
    let path = args.option("path");
    let source = require(&table, input)?;

    let documents = source
        .values()
        .iter()
        .map(|value| {
            if value.is_missing() {
                return Ok(None);
            }
            let text = value.render();
            serde_json::from_str::<Value>(&text)
                .map(Some)
                .map_err(|err| DirectiveError::InvalidValue {
                    directive: "spath",
                    value: text,
                    message: err.to_string(),
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    if let Some(path) = path {
        let output = args.option("output").unwrap_or(path);
        let values = documents
            .iter()
            .map(|doc| {
                doc.as_ref()
                    .and_then(|doc| json_path(doc, path))
                    .map_or_else(Scalar::null, json_to_scalar)
            })
            .collect();
        return put_column(&table, output, values);
    }

    let rows = documents.len();
    let mut names: Vec<String> = Vec::new();
    let mut columns: Vec<Vec<Scalar>> = Vec::new();
    for (row, doc) in documents.iter().enumerate() {
        let Some(Value::Object(map)) = doc else {
            continue;
        };
        for (key, value) in map {
            let slot = match names.iter().position(|name| name == key) {
                Some(slot) => slot,
                None => {
                    names.push(key.clone());
                    columns.push(vec![Scalar::null(); rows]);
                    names.len() - 1
                }
            };
            columns[slot][row] = json_to_scalar(value);
        }
    }
    let mut out = table.clone();
    for (name, values) in names.iter().zip(columns) {
        out = put_column(&out, name, values)?;
    }
    Ok(out)
}

/// Dotted path lookup. Segments may carry `[N]` suffixes, and a numeric
/// segment indexes into an array.
fn json_path<'v>(value: &'v Value, path: &str) -> Option<&'v Value> {
    let mut current = value;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        let (key, indexes) = segment.split_at(segment.find('[').unwrap_or(segment.len()));
        if !key.is_empty() {
            current = match current {
                Value::Object(map) => map.get(key)?,
                Value::Array(items) => items.get(key.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        for index in indexes.split('[').filter(|s| !s.is_empty()) {
            let idx = index.strip_suffix(']')?.parse::<usize>().ok()?;
            current = current.as_array()?.get(idx)?;
        }
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use sq_frame::Table;
    use sq_types::Scalar;

    use super::{backrefs_to_dollar, json_path};
    use crate::engine::Engine;
    use crate::error::ErrorKind;

    fn s(value: &str) -> Scalar {
        Scalar::Utf8(value.to_owned())
    }

    fn messages(values: Vec<Scalar>) -> Table {
        Table::from_dict(vec![("msg", values)]).expect("table")
    }

    #[test]
    fn rex_extracts_named_groups() {
        let table = messages(vec![s("user=alice id=7"), s("no match"), Scalar::null()]);
        let out = Engine::default()
            .run_pipeline(table, r#"rex field=msg "USER=(?<user>\w+) id=(?P<id>\d+)""#)
            .expect("rex");
        assert_eq!(
            out.column("user").expect("user").values(),
            &[s("alice"), Scalar::null(), Scalar::null()]
        );
        assert_eq!(out.column("id").expect("id").values()[0], s("7"));
    }

    #[test]
    fn rex_max_match_yields_lists_and_suffixes_collisions() {
        let table = messages(vec![s("a=1 a=2 a=3")]);
        let table = table
            .with_column("n", sq_columnar::Column::full(Scalar::Int64(0), 1))
            .expect("n");
        let out = Engine::default()
            .run_pipeline(table, r#"rex field=msg max_match=2 "a=(?<n>\d)""#)
            .expect("rex");
        assert_eq!(out.column("n").expect("n").values(), &[Scalar::Int64(0)]);
        assert_eq!(
            out.column("n_rex").expect("n_rex").values(),
            &[Scalar::List(vec![s("1"), s("2")])]
        );
    }

    #[test]
    fn rex_sed_mode_rewrites_in_place() {
        let table = messages(vec![s("ssn 123-45-6789")]);
        let out = Engine::default()
            .run_pipeline(table, r#"rex field=msg mode=sed "s/(\d{3})-\d{2}-\d{4}/\1-XX-XXXX/g""#)
            .expect("sed");
        assert_eq!(out.column("msg").expect("msg").values(), &[s("ssn 123-XX-XXXX")]);
        assert_eq!(backrefs_to_dollar(r"\1$"), "${1}$$");
    }

    #[test]
    fn regex_keeps_or_drops_matches() {
        let table = messages(vec![s("error: disk"), s("ok"), Scalar::null()]);
        let kept = Engine::default()
            .run_pipeline(table.clone(), r#"regex msg="^error""#)
            .expect("regex");
        assert_eq!(kept.row_count(), 1);
        let dropped = Engine::default()
            .run_pipeline(table, r#"regex msg!="^error""#)
            .expect("negated");
        assert_eq!(dropped.row_count(), 2);
    }

    #[test]
    fn base64_round_trips_and_rejects_garbage() {
        let table = messages(vec![s("hello")]);
        let out = Engine::default()
            .run_pipeline(table, "base64 encode msg | eval enc = msg | base64 decode msg")
            .expect("base64");
        assert_eq!(out.column("enc").expect("enc").values(), &[s("aGVsbG8=")]);
        assert_eq!(out.column("msg").expect("msg").values(), &[s("hello")]);

        let err = Engine::default()
            .run_pipeline(messages(vec![s("%%%")]), "base64 decode msg")
            .expect_err("garbage");
        assert_eq!(err.kind(), ErrorKind::Type);
    }

    #[test]
    fn spath_extracts_paths_and_top_level_keys() {
        let doc = r#"{"user": {"name": "bob", "tags": ["x", "y"]}, "n": 3}"#;
        let table = Table::from_dict(vec![("_raw", vec![s(doc)])]).expect("table");
        let out = Engine::default()
            .run_pipeline(table.clone(), "spath path=user.tags[1] output=tag")
            .expect("path");
        assert_eq!(out.column("tag").expect("tag").values(), &[s("y")]);

        let out = Engine::default().run_pipeline(table, "spath").expect("keys");
        assert_eq!(out.column("n").expect("n").values(), &[Scalar::Int64(3)]);
        assert!(out.has_column("user"));

        let bad = Table::from_dict(vec![("_raw", vec![s("{not json")])]).expect("table");
        let err = Engine::default().run_pipeline(bad, "spath").expect_err("invalid");
        assert_eq!(err.kind(), ErrorKind::Type);
    }

    #[test]
    fn json_path_handles_numeric_segments() {
        let doc = json!({"a": [{"b": 1}, {"b": 2}]});
        assert_eq!(json_path(&doc, "a.1.b"), Some(&json!(2)));
        assert_eq!(json_path(&doc, "a[0].b"), Some(&json!(1)));
        assert_eq!(json_path(&doc, "a.5.b"), None);
    }
}
