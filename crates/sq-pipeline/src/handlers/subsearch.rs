//! Directives that run nested queries: join, append, appendpipe,
//! multisearch and macro expansion. Every nested run is one level deeper
//! and subject to the policy's depth limit.

use sq_frame::Table;
use sq_join::{JoinType, join_tables};
use sq_lexer::{bracket_blocks, lex_segment, text_before_brackets};

use crate::args::{Args, configuration, syntax};
use crate::collab::parse_macro_call;
use crate::directive::Invocation;
use crate::engine::Exec;
use crate::error::DirectiveError;

fn single_block(directive: &'static str, text: &str) -> Result<String, DirectiveError> {
    let [block] = bracket_blocks(text)?.try_into().map_err(|blocks: Vec<String>| {
        syntax(directive, format!("expected one [subsearch], got {}", blocks.len()))
    })?;
    Ok(block)
}

/// `join [type=inner|left|right|outer] f1, f2 [ <query> ]`.
pub(crate) fn join(exec: &Exec<'_>, table: Table, inv: &Invocation<'_>) -> Result<Table, DirectiveError> {
    let subquery = single_block("join", inv.text)?;
    let head = lex_segment(text_before_brackets(inv.text))?;
    let args = Args::parse(&head);
    let how = match args.option("type") {
        Some(name) => JoinType::parse(name)
            .ok_or_else(|| configuration("join", format!("unknown join type {name:?}")))?,
        None => JoinType::Inner,
    };
    let fields = args.names();
    if fields.is_empty() {
        return Err(syntax("join", "expected at least one join field"));
    }
    let right = exec.run_query(&subquery)?;
    Ok(join_tables(&table, &right, &fields, how)?)
}

/// `append [ <query> ]`.
pub(crate) fn append(exec: &Exec<'_>, table: Table, inv: &Invocation<'_>) -> Result<Table, DirectiveError> {
    let subquery = single_block("append", inv.text)?;
    let extra = exec.run_query(&subquery)?;
    Ok(Table::concat(&[&table, &extra]))
}

/// `appendpipe [ <pipeline> ]`: the pipeline sees the current table.
pub(crate) fn appendpipe(
    exec: &Exec<'_>,
    table: Table,
    inv: &Invocation<'_>,
) -> Result<Table, DirectiveError> {
    let pipeline = single_block("appendpipe", inv.text)?;
    let extra = exec.run_pipeline(table.clone(), &pipeline)?;
    Ok(Table::concat(&[&table, &extra]))
}

/// `multisearch [ q1 ] [ q2 ] ...`; the incoming table is discarded.
pub(crate) fn multisearch(exec: &Exec<'_>, inv: &Invocation<'_>) -> Result<Table, DirectiveError> {
    let blocks = bracket_blocks(inv.text)?;
    if blocks.len() < 2 {
        return Err(syntax("multisearch", "expected at least two [subsearches]"));
    }
    let results = blocks
        .iter()
        .map(|query| exec.run_query(query))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Table::concat(&results.iter().collect::<Vec<_>>()))
}

/// `` `name(k=v, ...)` ``: expands through the registry and runs the text
/// over the current table.
pub(crate) fn macro_call(
    exec: &Exec<'_>,
    table: Table,
    inv: &Invocation<'_>,
) -> Result<Table, DirectiveError> {
    if !inv.args.is_empty() {
        return Err(syntax("macro", "unexpected arguments after the macro call"));
    }
    let Some((name, args)) = parse_macro_call(inv.keyword) else {
        return Err(syntax("macro", format!("invalid macro call {:?}", inv.keyword.value)));
    };
    let expansion = exec
        .macros()
        .expand(&name, &args)
        .ok_or(DirectiveError::UnknownMacro(name))?;
    exec.run_pipeline(table, &expansion)
}

#[cfg(test)]
mod tests {
    use sq_frame::Table;
    use sq_runtime::RuntimePolicy;
    use sq_types::Scalar;

    use crate::collab::{StaticMacroRegistry, TableAccelerator};
    use crate::engine::Engine;
    use crate::error::{DirectiveError, EngineError, ErrorKind};

    fn s(value: &str) -> Scalar {
        Scalar::Utf8(value.to_owned())
    }

    fn engine() -> Engine {
        let users = Table::from_dict(vec![
            ("id", vec![Scalar::Int64(1), Scalar::Int64(2)]),
            ("name", vec![s("ann"), s("bo")]),
        ])
        .expect("users");
        let logins = Table::from_dict(vec![
            ("id", vec![Scalar::Int64(2), Scalar::Int64(1), Scalar::Int64(3)]),
            ("ok", vec![Scalar::Bool(true), Scalar::Bool(false), Scalar::Bool(true)]),
        ])
        .expect("logins");
        Engine::default()
            .with_accelerator(
                TableAccelerator::new()
                    .with_index("users", users)
                    .with_index("logins", logins),
            )
            .with_macros(
                StaticMacroRegistry::new()
                    .with_macro("only_ok", "where ok=true")
                    .with_macro("top", "head $n$"),
            )
    }

    #[test]
    fn join_follows_left_row_order() {
        let out = engine()
            .execute("index=logins | join type=left id [ search index=users ]")
            .expect("join");
        assert_eq!(
            out.column("name").expect("name").values(),
            &[s("bo"), s("ann"), Scalar::null()]
        );
        let inner = engine()
            .execute("index=logins | join id [ index=users ]")
            .expect("inner");
        assert_eq!(inner.row_count(), 2);
    }

    #[test]
    fn join_requires_fields_and_one_block() {
        let err = engine()
            .execute("index=logins | join [ index=users ]")
            .expect_err("no fields");
        assert_eq!(err.kind(), ErrorKind::Syntax);
        let err = engine()
            .execute("index=logins | join id")
            .expect_err("no block");
        assert_eq!(err.kind(), ErrorKind::Syntax);
    }

    #[test]
    fn append_and_appendpipe_stack_rows() {
        let out = engine()
            .execute("index=users | append [ index=logins | where ok=true ]")
            .expect("append");
        assert_eq!(out.row_count(), 4);
        assert_eq!(out.column("ok").expect("ok").values()[0], Scalar::null());

        let out = engine()
            .execute("index=users | appendpipe [ stats count ]")
            .expect("appendpipe");
        assert_eq!(out.row_count(), 3);
        assert_eq!(out.column("count").expect("count").values()[2], Scalar::Int64(2));
    }

    #[test]
    fn multisearch_needs_two_queries() {
        let out = engine()
            .execute("| multisearch [ index=users ] [ index=logins ]")
            .expect("multisearch");
        assert_eq!(out.row_count(), 5);
        let err = engine()
            .execute("| multisearch [ index=users ]")
            .expect_err("one block");
        assert_eq!(err.kind(), ErrorKind::Syntax);
    }

    #[test]
    fn macros_expand_with_arguments() {
        let out = engine()
            .execute("index=logins | `only_ok` | `top(n=1)`")
            .expect("macros");
        assert_eq!(out.column("id").expect("id").values(), &[Scalar::Int64(2)]);

        let err = engine().execute("index=logins | `nope`").expect_err("unknown");
        assert!(matches!(
            err,
            EngineError::Directive { source: DirectiveError::UnknownMacro(ref name), .. } if name == "nope"
        ));
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn nesting_beyond_the_limit_is_rejected() {
        let policy = RuntimePolicy {
            max_subsearch_depth: 1,
            ..RuntimePolicy::default()
        };
        let users = Table::from_dict(vec![("id", vec![Scalar::Int64(1)])]).expect("users");
        let engine =
            Engine::new(policy).with_accelerator(TableAccelerator::new().with_index("users", users));
        assert!(engine.execute("index=users | append [ index=users ]").is_ok());
        let err = engine
            .execute("index=users | append [ index=users | append [ index=users ] ]")
            .expect_err("too deep");
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }
}
