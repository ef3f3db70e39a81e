#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use sq_columnar::{Column, ColumnError, ComparisonOp};
use sq_frame::{FrameError, Table};
use sq_lexer::{LexError, Token, TokenKind, lex_segment};
use sq_types::{DType, Scalar};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("syntax error in filter {clause:?}: {message}")]
    Syntax { clause: String, message: String },
    #[error("filter references missing column {0:?}")]
    MissingColumn(String),
    #[error(transparent)]
    Lex(#[from] LexError),
    #[error(transparent)]
    Column(#[from] ColumnError),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalOp {
    And,
    Or,
}

/// Filter AST. Built once per clause and discarded after lowering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FilterNode {
    Comparison {
        left: Box<FilterNode>,
        op: ComparisonOp,
        right: Box<FilterNode>,
    },
    Logical {
        op: LogicalOp,
        left: Box<FilterNode>,
        right: Box<FilterNode>,
    },
    InClause {
        identifier: String,
        values: Vec<Scalar>,
    },
    Identifier {
        name: String,
    },
    Literal {
        value: Scalar,
    },
}

// ── Filter Parser ───────────────────────────────────────────────────────
//
// Log-search filter grammar. Adjacent predicates without a boolean keyword
// are joined with AND, so `a=1 b=2` reads as `a=1 AND b=2`.

/// Parse filter tokens into a `FilterNode`.
///
/// Syntax:
///   filter     → or_expr
///   or_expr    → and_expr ( "OR" and_expr )*
///   and_expr   → comparison ( "AND"? comparison )*
///   comparison → primary ( ("=" | "==" | "!=" | "<" | "<=" | ">" | ">=") primary
///                        | "IN" "(" literal ( "," literal )* ")" )?
///   primary    → "(" or_expr ")" | operand
///   operand    → STRING | NUMBER | "-" NUMBER | "True" | "False" | IDENT
pub fn parse_filter(tokens: &[Token], clause: &str) -> Result<FilterNode, FilterError> {
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
        clause,
    };
    let node = parser.parse_or()?;
    if let Some(token) = parser.peek() {
        return Err(parser.syntax(format!(
            "unexpected {:?} at offset {}",
            token.value, token.offset
        )));
    }
    Ok(node)
}

const MAX_NESTING: usize = 128;

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    depth: usize,
    clause: &'a str,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn syntax(&self, message: impl Into<String>) -> FilterError {
        FilterError::Syntax {
            clause: self.clause.to_owned(),
            message: message.into(),
        }
    }

    fn parse_or(&mut self) -> Result<FilterNode, FilterError> {
        let mut left = self.parse_and()?;
        while self.peek().is_some_and(|t| t.is_keyword("OR")) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = FilterNode::Logical {
                op: LogicalOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<FilterNode, FilterError> {
        let mut left = self.parse_comparison()?;
        loop {
            match self.peek() {
                Some(t) if t.is_keyword("AND") => self.pos += 1,
                Some(t) if starts_operand(t) => {}
                _ => break,
            }
            let right = self.parse_comparison()?;
            left = FilterNode::Logical {
                op: LogicalOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<FilterNode, FilterError> {
        let left = self.parse_primary()?;

        if self.peek().is_some_and(|t| t.is_keyword("IN")) {
            self.pos += 1;
            let FilterNode::Identifier { name } = left else {
                return Err(self.syntax("IN requires a field name on its left"));
            };
            let values = self.parse_in_list()?;
            return Ok(FilterNode::InClause {
                identifier: name,
                values,
            });
        }

        let op = match self.peek() {
            Some(t) if t.kind == TokenKind::Operator => match t.value.as_str() {
                "=" | "==" => Some(ComparisonOp::Eq),
                "!=" => Some(ComparisonOp::Ne),
                "<" => Some(ComparisonOp::Lt),
                "<=" => Some(ComparisonOp::Le),
                ">" => Some(ComparisonOp::Gt),
                ">=" => Some(ComparisonOp::Ge),
                _ => None,
            },
            _ => None,
        };
        let Some(op) = op else {
            return Ok(left);
        };
        self.pos += 1;
        let right = self.parse_primary()?;
        Ok(FilterNode::Comparison {
            left: Box::new(left),
            op,
            right: Box::new(right),
        })
    }

    fn parse_in_list(&mut self) -> Result<Vec<Scalar>, FilterError> {
        if !self.peek().is_some_and(|t| t.is_punct("(")) {
            return Err(self.syntax("IN must be followed by a parenthesized list"));
        }
        self.pos += 1;
        let mut values = Vec::new();
        loop {
            if self.peek().is_some_and(|t| t.is_punct(")")) {
                self.pos += 1;
                break;
            }
            if !values.is_empty() {
                if !self.peek().is_some_and(|t| t.is_punct(",")) {
                    return Err(self.syntax("IN list items must be separated by commas"));
                }
                self.pos += 1;
            }
            match self.parse_operand()? {
                FilterNode::Literal { value } => values.push(value),
                FilterNode::Identifier { name } => {
                    return Err(self.syntax(format!(
                        "IN list accepts literals only, found field {name:?}"
                    )));
                }
                _ => return Err(self.syntax("IN list accepts literals only")),
            }
        }
        if values.is_empty() {
            return Err(self.syntax("IN list must not be empty"));
        }
        Ok(values)
    }

    fn parse_primary(&mut self) -> Result<FilterNode, FilterError> {
        if self.peek().is_some_and(|t| t.is_punct("(")) {
            self.depth += 1;
            if self.depth > MAX_NESTING {
                return Err(self.syntax("parentheses nest too deeply"));
            }
            self.pos += 1;
            let inner = self.parse_or()?;
            if !self.peek().is_some_and(|t| t.is_punct(")")) {
                return Err(self.syntax("missing closing parenthesis"));
            }
            self.pos += 1;
            self.depth -= 1;
            return Ok(inner);
        }
        self.parse_operand()
    }

    fn parse_operand(&mut self) -> Result<FilterNode, FilterError> {
        let Some(token) = self.peek().cloned() else {
            return Err(self.syntax("unexpected end of filter"));
        };
        self.pos += 1;
        match token.kind {
            TokenKind::StringLiteral => Ok(FilterNode::Literal {
                value: Scalar::Utf8(token.unquoted()),
            }),
            TokenKind::NumberLiteral => Ok(FilterNode::Literal {
                value: Scalar::infer_from_text(&token.value),
            }),
            TokenKind::Operator if token.value == "-" => match self.peek() {
                Some(next) if next.kind == TokenKind::NumberLiteral => {
                    let value = Scalar::infer_from_text(&format!("-{}", next.value));
                    self.pos += 1;
                    Ok(FilterNode::Literal { value })
                }
                _ => Err(self.syntax(format!(
                    "unexpected \"-\" at offset {}",
                    token.offset
                ))),
            },
            TokenKind::Identifier if token.is_keyword("true") => Ok(FilterNode::Literal {
                value: Scalar::Bool(true),
            }),
            TokenKind::Identifier if token.is_keyword("false") => Ok(FilterNode::Literal {
                value: Scalar::Bool(false),
            }),
            TokenKind::Identifier
                if ["AND", "OR", "IN"].iter().any(|kw| token.is_keyword(kw)) =>
            {
                Err(self.syntax(format!(
                    "keyword {:?} at offset {} has no left operand",
                    token.value, token.offset
                )))
            }
            TokenKind::Identifier => Ok(FilterNode::Identifier { name: token.value }),
            TokenKind::Operator | TokenKind::Punctuation => Err(self.syntax(format!(
                "unexpected {:?} at offset {}",
                token.value, token.offset
            ))),
        }
    }
}

fn starts_operand(token: &Token) -> bool {
    match token.kind {
        TokenKind::StringLiteral | TokenKind::NumberLiteral => true,
        TokenKind::Identifier => !["AND", "OR", "IN"].iter().any(|kw| token.is_keyword(kw)),
        TokenKind::Punctuation => token.value == "(",
        TokenKind::Operator => token.value == "-",
    }
}

// ── Lowering ────────────────────────────────────────────────────────────

enum Operand {
    Column(Column),
    Scalar(Scalar),
}

/// A parsed filter clause ready to run against tables.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledFilter {
    clause: String,
    root: Option<FilterNode>,
}

impl CompiledFilter {
    /// Lexes and parses `clause`. An empty clause matches every row.
    pub fn parse(clause: &str) -> Result<Self, FilterError> {
        let tokens = lex_segment(clause)?;
        Self::from_tokens(&tokens, clause)
    }

    pub fn from_tokens(tokens: &[Token], clause: &str) -> Result<Self, FilterError> {
        let root = if tokens.is_empty() {
            None
        } else {
            Some(parse_filter(tokens, clause)?)
        };
        Ok(Self {
            clause: clause.to_owned(),
            root,
        })
    }

    #[must_use]
    pub fn clause(&self) -> &str {
        &self.clause
    }

    #[must_use]
    pub fn root(&self) -> Option<&FilterNode> {
        self.root.as_ref()
    }

    /// Row mask; missing comparison results count as false.
    pub fn mask(&self, table: &Table) -> Result<Vec<bool>, FilterError> {
        let Some(root) = &self.root else {
            return Ok(vec![true; table.row_count()]);
        };
        let column = self.lower_predicate(root, table)?;
        Ok(column.to_mask())
    }

    pub fn apply(&self, table: &Table) -> Result<Table, FilterError> {
        let mask = self.mask(table)?;
        Ok(table.filter_rows(&mask)?)
    }

    fn syntax(&self, message: impl Into<String>) -> FilterError {
        FilterError::Syntax {
            clause: self.clause.clone(),
            message: message.into(),
        }
    }

    fn lower_predicate(&self, node: &FilterNode, table: &Table) -> Result<Column, FilterError> {
        match self.lower(node, table)? {
            Operand::Column(column) => Ok(column),
            Operand::Scalar(Scalar::Bool(value)) => {
                Ok(Column::new(DType::Bool, vec![Scalar::Bool(value); table.row_count()])?)
            }
            Operand::Scalar(value) => Err(self.syntax(format!(
                "literal {:?} is not a predicate",
                value.render()
            ))),
        }
    }

    fn lower(&self, node: &FilterNode, table: &Table) -> Result<Operand, FilterError> {
        match node {
            FilterNode::Identifier { name } => Ok(Operand::Column(column_ref(table, name)?)),
            FilterNode::Literal { value } => Ok(Operand::Scalar(value.clone())),
            FilterNode::InClause { identifier, values } => {
                Ok(Operand::Column(column_ref(table, identifier)?.is_in(values)?))
            }
            FilterNode::Logical { op, left, right } => {
                let left = self.lower_predicate(left, table)?;
                let right = self.lower_predicate(right, table)?;
                Ok(Operand::Column(match op {
                    LogicalOp::And => left.and(&right)?,
                    LogicalOp::Or => left.or(&right)?,
                }))
            }
            FilterNode::Comparison { left, op, right } => {
                let column = match (self.lower(left, table)?, self.lower(right, table)?) {
                    (Operand::Column(l), Operand::Column(r)) => l.compare(&r, *op)?,
                    (Operand::Column(l), Operand::Scalar(r)) => l.compare_scalar(&r, *op)?,
                    (Operand::Scalar(l), Operand::Column(r)) => {
                        r.compare_scalar(&l, op.reversed())?
                    }
                    (Operand::Scalar(l), Operand::Scalar(r)) => {
                        let value = op.apply(&l, &r).map_or(Scalar::null(), Scalar::Bool);
                        Column::new(DType::Bool, vec![value; table.row_count()])?
                    }
                };
                Ok(Operand::Column(column))
            }
        }
    }
}

fn column_ref(table: &Table, name: &str) -> Result<Column, FilterError> {
    table
        .column(name)
        .cloned()
        .ok_or_else(|| FilterError::MissingColumn(name.to_owned()))
}

/// Filters `table` by `clause` in one step.
pub fn filter_table(table: &Table, clause: &str) -> Result<Table, FilterError> {
    CompiledFilter::parse(clause)?.apply(table)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use sq_frame::Table;
    use sq_types::{NullKind, Scalar};

    use super::{CompiledFilter, FilterError, FilterNode, LogicalOp, filter_table};

    fn s(value: &str) -> Scalar {
        Scalar::Utf8(value.to_owned())
    }

    fn fixture() -> Table {
        Table::from_dict(vec![
            ("status", vec![s("error"), s("critical"), s("error"), s("ok")]),
            ("code", vec![
                Scalar::Int64(403),
                Scalar::Int64(500),
                Scalar::Int64(404),
                Scalar::Int64(403),
            ]),
        ])
        .expect("fixture")
    }

    #[test]
    fn grouped_or_with_in_matches_truth_table() {
        let clause = r#"(status="error" OR status="critical") AND code IN (403,404)"#;
        let mask = CompiledFilter::parse(clause)
            .expect("parse")
            .mask(&fixture())
            .expect("mask");
        assert_eq!(mask, vec![true, false, true, false]);
    }

    #[test]
    fn implicit_and_equals_explicit_and() {
        let table = fixture();
        let explicit = filter_table(&table, r#"status="error" AND code=404"#).expect("explicit");
        let implicit = filter_table(&table, r#"status="error" code=404"#).expect("implicit");
        assert_eq!(explicit, implicit);
        assert_eq!(implicit.row_count(), 1);
    }

    #[test]
    fn and_binds_tighter_than_or() {
        let root = CompiledFilter::parse("a=1 OR b=2 c=3").expect("parse");
        let Some(FilterNode::Logical { op, right, .. }) = root.root() else {
            panic!("expected logical root");
        };
        assert_eq!(*op, LogicalOp::Or);
        assert!(matches!(
            right.as_ref(),
            FilterNode::Logical {
                op: LogicalOp::And,
                ..
            }
        ));
    }

    #[test]
    fn in_clause_matches_membership_exactly() {
        let table = Table::from_dict(vec![(
            "x",
            (0..6).map(Scalar::Int64).collect::<Vec<_>>(),
        )])
        .expect("table");
        let mask = CompiledFilter::parse("x IN (1,2,3)")
            .expect("parse")
            .mask(&table)
            .expect("mask");
        assert_eq!(mask, vec![false, true, true, true, false, false]);
    }

    #[test]
    fn in_clause_requires_identifier_and_literals() {
        assert!(matches!(
            CompiledFilter::parse("5 IN (1,2)"),
            Err(FilterError::Syntax { .. })
        ));
        assert!(matches!(
            CompiledFilter::parse("x IN ()"),
            Err(FilterError::Syntax { .. })
        ));
        assert!(matches!(
            CompiledFilter::parse("x IN (a, b)"),
            Err(FilterError::Syntax { .. })
        ));
    }

    #[test]
    fn literal_on_left_reverses_operator() {
        let table = fixture();
        let out = filter_table(&table, "404 <= code").expect("filter");
        assert_eq!(
            out.column("code").expect("code").values(),
            &[Scalar::Int64(500), Scalar::Int64(404)]
        );
    }

    #[test]
    fn booleans_and_negative_numbers_normalize() {
        let table = Table::from_dict(vec![
            ("flag", vec![Scalar::Bool(true), Scalar::Bool(false)]),
            ("delta", vec![Scalar::Int64(-5), Scalar::Int64(3)]),
        ])
        .expect("table");
        let out = filter_table(&table, "flag=True delta<-1").expect("filter");
        assert_eq!(out.row_count(), 1);
        let all = filter_table(&table, "False OR delta>-10").expect("filter");
        assert_eq!(all.row_count(), 2);
    }

    #[test]
    fn missing_values_never_match() {
        let table = Table::from_dict(vec![(
            "x",
            vec![Scalar::Int64(1), Scalar::Null(NullKind::Null)],
        )])
        .expect("table");
        let out = filter_table(&table, "x!=5").expect("filter");
        assert_eq!(out.row_count(), 1);
    }

    #[test]
    fn unknown_identifier_is_missing_column() {
        let err = filter_table(&fixture(), "status=error").expect_err("error is a column ref");
        assert!(matches!(err, FilterError::MissingColumn(name) if name == "error"));
    }

    #[test]
    fn syntax_errors_carry_clause_text() {
        let err = CompiledFilter::parse("status= OR").expect_err("syntax");
        assert!(err.to_string().contains("status= OR"));
        let err = CompiledFilter::parse("(a=1").expect_err("unbalanced");
        assert!(matches!(err, FilterError::Lex(_)));
        let err = filter_table(&fixture(), r#""error""#).expect_err("bare literal");
        assert!(matches!(err, FilterError::Syntax { .. }));
    }

    #[test]
    fn empty_clause_keeps_every_row() {
        let out = filter_table(&fixture(), "").expect("filter");
        assert_eq!(out.row_count(), 4);
    }

    proptest! {
        #[test]
        fn implicit_and_matches_explicit_on_random_tables(
            rows in prop::collection::vec((0_i64..4, 0_i64..4), 0..24),
            a in 0_i64..4,
            b in 0_i64..4,
        ) {
            let table = Table::from_dict(vec![
                ("a", rows.iter().map(|(x, _)| Scalar::Int64(*x)).collect()),
                ("b", rows.iter().map(|(_, y)| Scalar::Int64(*y)).collect()),
            ])
            .expect("table");
            let explicit = filter_table(&table, &format!("a={a} AND b={b}")).expect("explicit");
            let implicit = filter_table(&table, &format!("a={a} b={b}")).expect("implicit");
            prop_assert_eq!(explicit, implicit);
        }
    }
}
