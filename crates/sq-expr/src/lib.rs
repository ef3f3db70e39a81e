#![forbid(unsafe_code)]

//! Sandboxed evaluator behind `eval`.
//!
//! Expressions are parsed into a generic [`Node`] tree and then checked by
//! a restrictive walker before anything runs: names must be existing
//! columns, calls must name an entry of [`ALLOWED_FUNCTIONS`] directly, and
//! attribute access or subscripting is refused outright.

mod functions;
mod parser;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng, rng};
use serde::{Deserialize, Serialize};
use sq_columnar::{ArithmeticOp, Column, ColumnError};
use sq_frame::{FrameError, Table};
use sq_lexer::{LexError, split_arguments, split_assignment, unquote};
use sq_types::{Scalar, TypeError};
use thiserror::Error;

pub use functions::{ALLOWED_FUNCTIONS, Function, is_allowed_function};
pub use parser::{BoolOp, Node, UnaryOp, parse_expr};

use functions::Value;

#[derive(Debug, Error)]
pub enum ExprError {
    #[error("syntax error in expression {expr:?}: {message}")]
    Syntax { expr: String, message: String },
    #[error("invalid assignment {0:?}: expected `field = expression`")]
    InvalidAssignment(String),
    #[error("name {0:?} is neither a column nor an allowed function")]
    NameNotAllowed(String),
    #[error("disallowed construct: {0}")]
    DisallowedConstruct(String),
    #[error("{function}() takes {expected} arguments, got {got}")]
    Arity {
        function: &'static str,
        expected: &'static str,
        got: usize,
    },
    #[error("{function}() got an unexpected keyword argument {keyword:?}")]
    UnexpectedKeyword {
        function: &'static str,
        keyword: String,
    },
    #[error("{function}(): {message}")]
    InvalidArgument {
        function: &'static str,
        message: String,
    },
    #[error(transparent)]
    Lex(#[from] LexError),
    #[error(transparent)]
    Type(#[from] TypeError),
    #[error(transparent)]
    Column(#[from] ColumnError),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Knobs for one evaluation. `seed` makes `randomize` reproducible.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalOptions {
    pub seed: Option<u64>,
}

/// Per-evaluation state; nothing here outlives one directive.
pub struct EvalContext {
    rng: StdRng,
}

impl EvalContext {
    #[must_use]
    pub fn new(options: EvalOptions) -> Self {
        let rng = match options.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => {
                let mut seed = [0_u8; 32];
                rng().fill_bytes(&mut seed);
                StdRng::from_seed(seed)
            }
        };
        Self { rng }
    }
}

// ── Allow-list walker ───────────────────────────────────────────────────

/// Rejects every node kind outside the permitted set before evaluation.
pub fn check_allowed(node: &Node, table: &Table) -> Result<(), ExprError> {
    match node {
        Node::Literal { .. } => Ok(()),
        Node::Name { id } => {
            if table.has_column(id) {
                Ok(())
            } else if is_allowed_function(id) {
                Err(ExprError::DisallowedConstruct(format!(
                    "function {id:?} referenced without a call"
                )))
            } else {
                Err(ExprError::NameNotAllowed(id.clone()))
            }
        }
        Node::Unary { operand, .. } => check_allowed(operand, table),
        Node::Binary { left, right, .. }
        | Node::Compare { left, right, .. }
        | Node::Logical { left, right, .. } => {
            check_allowed(left, table)?;
            check_allowed(right, table)
        }
        Node::Call {
            callee,
            args,
            keywords,
        } => {
            allowed_callee(callee)?;
            for arg in args {
                check_allowed(arg, table)?;
            }
            for (_, value) in keywords {
                check_allowed(value, table)?;
            }
            Ok(())
        }
        Node::Attribute { attr, .. } => Err(ExprError::DisallowedConstruct(format!(
            "attribute access .{attr}"
        ))),
        Node::Subscript { .. } => Err(ExprError::DisallowedConstruct("subscript".to_owned())),
        Node::List { items } => items.iter().try_for_each(|item| check_allowed(item, table)),
    }
}

fn allowed_callee(callee: &Node) -> Result<Function, ExprError> {
    match callee {
        Node::Name { id } => Function::lookup(id).ok_or_else(|| {
            ExprError::DisallowedConstruct(format!("call to {id:?} is not allowed"))
        }),
        Node::Attribute { attr, .. } => Err(ExprError::DisallowedConstruct(format!(
            "method call .{attr}()"
        ))),
        _ => Err(ExprError::DisallowedConstruct(
            "indirect call through a computed callee".to_owned(),
        )),
    }
}

/// Checks `node` against the allow-list, then evaluates it into a column of
/// `table.row_count()` rows.
pub fn evaluate(node: &Node, table: &Table, ctx: &mut EvalContext) -> Result<Column, ExprError> {
    check_allowed(node, table)?;
    Ok(eval_node(node, table, ctx)?.into_column(table.row_count()))
}

fn eval_node(node: &Node, table: &Table, ctx: &mut EvalContext) -> Result<Value, ExprError> {
    match node {
        Node::Literal { value } => Ok(Value::Scalar(value.clone())),
        Node::Name { id } => table
            .column(id)
            .cloned()
            .map(Value::Column)
            .ok_or_else(|| ExprError::NameNotAllowed(id.clone())),
        Node::Unary { op, operand } => {
            let operand = eval_node(operand, table, ctx)?;
            match op {
                UnaryOp::Neg => combine(
                    Value::Scalar(Scalar::Int64(0)),
                    operand,
                    table.row_count(),
                    |l, r| l.binary_numeric(r, ArithmeticOp::Sub),
                ),
                UnaryOp::Not => match operand {
                    Value::Scalar(v) if v.is_missing() => Ok(Value::Scalar(Scalar::null())),
                    Value::Scalar(v) => Ok(Value::Scalar(Scalar::Bool(!v.is_truthy()))),
                    Value::Column(column) => Ok(Value::Column(column.not()?)),
                },
            }
        }
        Node::Binary { op, left, right } => {
            let (l, r) = (eval_node(left, table, ctx)?, eval_node(right, table, ctx)?);
            combine(l, r, table.row_count(), |l, r| l.binary_numeric(r, *op))
        }
        Node::Compare { op, left, right } => {
            let (l, r) = (eval_node(left, table, ctx)?, eval_node(right, table, ctx)?);
            combine(l, r, table.row_count(), |l, r| l.compare(r, *op))
        }
        Node::Logical { op, left, right } => {
            let (l, r) = (eval_node(left, table, ctx)?, eval_node(right, table, ctx)?);
            combine(l, r, table.row_count(), |l, r| match op {
                BoolOp::And => l.and(r),
                BoolOp::Or => l.or(r),
            })
        }
        Node::Call {
            callee,
            args,
            keywords,
        } => {
            let function = allowed_callee(callee)?;
            let args = args
                .iter()
                .map(|arg| eval_node(arg, table, ctx))
                .collect::<Result<Vec<_>, _>>()?;
            let keywords = keywords
                .iter()
                .map(|(name, value)| Ok((name.clone(), eval_node(value, table, ctx)?)))
                .collect::<Result<Vec<_>, ExprError>>()?;
            functions::call(function, args, keywords, table.row_count(), &mut ctx.rng)
        }
        Node::Attribute { attr, .. } => Err(ExprError::DisallowedConstruct(format!(
            "attribute access .{attr}"
        ))),
        Node::Subscript { .. } => Err(ExprError::DisallowedConstruct("subscript".to_owned())),
        Node::List { items } => {
            let items = items
                .iter()
                .map(|item| eval_node(item, table, ctx))
                .collect::<Result<Vec<_>, _>>()?;
            if items.iter().all(Value::is_scalar) {
                let values = items.iter().map(|item| item.cell(0).clone()).collect();
                return Ok(Value::Scalar(Scalar::List(values)));
            }
            let rows = (0..table.row_count())
                .map(|row| Scalar::List(items.iter().map(|item| item.cell(row).clone()).collect()))
                .collect();
            Ok(Value::Column(Column::from_values_lossy(rows)))
        }
    }
}

/// Applies a column kernel to two operands, broadcasting scalars. Two
/// scalars produce a scalar.
fn combine<F>(left: Value, right: Value, len: usize, kernel: F) -> Result<Value, ExprError>
where
    F: Fn(&Column, &Column) -> Result<Column, ColumnError>,
{
    if let (Value::Scalar(l), Value::Scalar(r)) = (&left, &right) {
        let out = kernel(
            &Column::from_values_lossy(vec![l.clone()]),
            &Column::from_values_lossy(vec![r.clone()]),
        )?;
        return Ok(Value::Scalar(
            out.value(0).cloned().unwrap_or_else(Scalar::null),
        ));
    }
    let out = kernel(&left.into_column(len), &right.into_column(len))?;
    Ok(Value::Column(out))
}

/// Parses and evaluates one expression against `table`.
pub fn eval_expr(table: &Table, expr: &str, options: EvalOptions) -> Result<Column, ExprError> {
    let node = parse_expr(expr)?;
    evaluate(&node, table, &mut EvalContext::new(options))
}

// ── Assignments ─────────────────────────────────────────────────────────

/// One `field = expression` pair of an eval clause.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub field: String,
    pub expr: Node,
    pub source: String,
}

/// Splits an eval clause on top-level commas and parses every assignment.
/// All of them must parse before any runs.
pub fn parse_assignments(text: &str) -> Result<Vec<Assignment>, ExprError> {
    let pieces = split_arguments(text)?;
    if pieces.is_empty() {
        return Err(ExprError::InvalidAssignment(text.to_owned()));
    }
    pieces
        .into_iter()
        .map(|piece| {
            let Some((field, expr)) = split_assignment(&piece) else {
                return Err(ExprError::InvalidAssignment(piece.clone()));
            };
            let field = if field.starts_with(['"', '\'']) {
                unquote(field)
            } else {
                field.to_owned()
            };
            if field.is_empty() || expr.is_empty() || field.split_whitespace().count() != 1 {
                return Err(ExprError::InvalidAssignment(piece.clone()));
            }
            Ok(Assignment {
                field,
                expr: parse_expr(expr)?,
                source: piece.clone(),
            })
        })
        .collect()
}

/// Runs every assignment in order on a working copy; later assignments see
/// earlier results. On error `table` is left untouched.
pub fn apply_assignments(
    table: &Table,
    text: &str,
    options: EvalOptions,
) -> Result<Table, ExprError> {
    let assignments = parse_assignments(text)?;
    let mut ctx = EvalContext::new(options);
    let mut working = table.clone();
    for assignment in &assignments {
        #[cfg(feature = "tracing")]
        tracing::debug!(field = %assignment.field, expr = %assignment.source, "eval assignment");
        let column = evaluate(&assignment.expr, &working, &mut ctx)?;
        working = working.with_column(assignment.field.clone(), column)?;
    }
    Ok(working)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use sq_frame::Table;
    use sq_types::Scalar;

    use super::{EvalOptions, ExprError, apply_assignments, eval_expr, parse_assignments};

    fn s(value: &str) -> Scalar {
        Scalar::Utf8(value.to_owned())
    }

    fn ints(name: &str, values: &[i64]) -> Table {
        Table::from_dict(vec![(name, values.iter().copied().map(Scalar::Int64).collect())])
            .expect("table")
    }

    #[test]
    fn arithmetic_broadcasts_literals() {
        let out = apply_assignments(&ints("x", &[1, 2, 3]), "y = x + 1", EvalOptions::default())
            .expect("eval");
        assert_eq!(
            out.column("y").expect("y").values(),
            &[Scalar::Int64(2), Scalar::Int64(3), Scalar::Int64(4)]
        );
    }

    #[test]
    fn import_and_attribute_forms_are_disallowed() {
        let table = ints("x", &[1]);
        for expr in [
            "__import__('os')",
            "os.system('ls')",
            "x.__class__",
            "lower.__globals__",
            "x[0]",
            "lower(x)(1)",
            "getattr(x, 'y')",
        ] {
            let err = eval_expr(&table, expr, EvalOptions::default()).expect_err(expr);
            assert!(
                matches!(err, ExprError::DisallowedConstruct(_)),
                "{expr}: {err}"
            );
        }
    }

    #[test]
    fn unknown_names_fail_closed() {
        let err = eval_expr(&ints("x", &[1]), "y + 1", EvalOptions::default())
            .expect_err("unknown column");
        assert!(matches!(err, ExprError::NameNotAllowed(name) if name == "y"));
    }

    #[test]
    fn case_folds_right_to_left() {
        let out = eval_expr(
            &ints("a", &[-1, 5, 20]),
            r#"case(a>10,"hi",a>0,"lo","na")"#,
            EvalOptions::default(),
        )
        .expect("case");
        assert_eq!(out.values(), &[s("na"), s("lo"), s("hi")]);
    }

    #[test]
    fn concat_joins_in_order() {
        let out = eval_expr(&ints("x", &[1, 2]), r#"concat("a-", x, "-b")"#, EvalOptions::default())
            .expect("concat");
        assert_eq!(out.values(), &[s("a-1-b"), s("a-2-b")]);
    }

    #[test]
    fn if_treats_missing_condition_as_false() {
        let table = Table::from_dict(vec![(
            "x",
            vec![Scalar::Int64(5), Scalar::null(), Scalar::Int64(-2)],
        )])
        .expect("table");
        let out = eval_expr(&table, "if_(x > 0, 'pos', 'other')", EvalOptions::default())
            .expect("if_");
        assert_eq!(out.values(), &[s("pos"), s("other"), s("other")]);
    }

    #[test]
    fn coalesce_and_null_tests() {
        let table = Table::from_dict(vec![
            ("a", vec![Scalar::null(), s("x")]),
            ("b", vec![s("fallback"), s("y")]),
        ])
        .expect("table");
        let out = apply_assignments(
            &table,
            "c = coalesce(a, b), n = isnull(a), m = isnotnull(a)",
            EvalOptions::default(),
        )
        .expect("eval");
        assert_eq!(out.column("c").expect("c").values(), &[s("fallback"), s("x")]);
        assert_eq!(
            out.column("n").expect("n").values(),
            &[Scalar::Bool(true), Scalar::Bool(false)]
        );
        assert_eq!(
            out.column("m").expect("m").values(),
            &[Scalar::Bool(false), Scalar::Bool(true)]
        );
    }

    #[test]
    fn later_assignments_see_earlier_ones() {
        let out = apply_assignments(&ints("x", &[2]), "y = x * 3, z = y ** 2", EvalOptions::default())
            .expect("eval");
        assert_eq!(out.column("z").expect("z").values(), &[Scalar::Int64(36)]);
    }

    #[test]
    fn failed_assignment_commits_nothing() {
        let table = ints("x", &[1]);
        let err = apply_assignments(&table, "y = x + 1, z = nope", EvalOptions::default())
            .expect_err("second assignment fails");
        assert!(matches!(err, ExprError::NameNotAllowed(_)));
        assert!(!table.has_column("y"));
    }

    #[test]
    fn string_plus_concatenates_and_mod_stays_integral() {
        let table = Table::from_dict(vec![
            ("host", vec![s("web"), s("db")]),
            ("n", vec![Scalar::Int64(7), Scalar::Int64(-7)]),
        ])
        .expect("table");
        let out = apply_assignments(
            &table,
            "label = host + '-01', r = n % 3, q = n / 2",
            EvalOptions::default(),
        )
        .expect("eval");
        assert_eq!(out.column("label").expect("label").values(), &[s("web-01"), s("db-01")]);
        assert_eq!(
            out.column("r").expect("r").values(),
            &[Scalar::Int64(1), Scalar::Int64(2)]
        );
        assert_eq!(
            out.column("q").expect("q").values(),
            &[Scalar::Float64(3.5), Scalar::Float64(-3.5)]
        );
    }

    #[test]
    fn randomize_is_reproducible_with_a_seed() {
        let table = ints("x", &[10, 20, 30]);
        let options = EvalOptions { seed: Some(42) };
        let a = eval_expr(&table, "randomize(x)", options).expect("first");
        let b = eval_expr(&table, "randomize(x)", options).expect("second");
        assert_eq!(a, b);
        for (value, bound) in a.values().iter().zip([10, 20, 30]) {
            let Scalar::Int64(v) = value else {
                panic!("expected int");
            };
            assert!((-bound..=bound).contains(v));
        }
    }

    #[test]
    fn round_takes_precision_keyword() {
        let table = Table::from_dict(vec![("v", vec![Scalar::Float64(3.14159)])]).expect("table");
        let out = eval_expr(&table, "round(v, precision=2)", EvalOptions::default()).expect("round");
        assert_eq!(out.values(), &[Scalar::Float64(3.14)]);
    }

    #[test]
    fn assignment_parsing_rejects_malformed_pieces() {
        assert!(matches!(
            parse_assignments("just_a_name"),
            Err(ExprError::InvalidAssignment(_))
        ));
        assert!(matches!(
            parse_assignments("a b = 1"),
            Err(ExprError::InvalidAssignment(_))
        ));
        let parsed = parse_assignments(r#"msg = concat("a,b", x), n = 1"#).expect("parse");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].field, "msg");
    }

    #[test]
    fn literal_only_expression_fills_every_row() {
        let out = eval_expr(&ints("x", &[1, 2]), "'const'", EvalOptions::default()).expect("eval");
        assert_eq!(out.values(), &[s("const"), s("const")]);
    }

    proptest! {
        #[test]
        fn integer_arithmetic_is_element_wise(values in prop::collection::vec(-1000_i64..1000, 1..32)) {
            let out = eval_expr(&ints("x", &values), "x * 2 - 1", EvalOptions::default())
                .expect("eval");
            let expected: Vec<Scalar> = values.iter().map(|v| Scalar::Int64(v * 2 - 1)).collect();
            prop_assert_eq!(out.values(), expected.as_slice());
        }

        #[test]
        fn unknown_names_never_evaluate(suffix in "[a-z]{1,8}") {
            let name = format!("zz_{suffix}");
            let err = eval_expr(&ints("x", &[1]), &format!("x + {name}"), EvalOptions::default())
                .expect_err("unknown name");
            prop_assert!(matches!(err, ExprError::NameNotAllowed(ref found) if *found == name));
        }
    }
}
