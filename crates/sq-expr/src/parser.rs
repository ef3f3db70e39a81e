//! Expression tokenizer and recursive-descent parser.
//!
//! The parser accepts a deliberately generic grammar (attribute access,
//! subscripts and calls on arbitrary callees all parse) so the walker in
//! `lib.rs` can reject them by node kind instead of by string matching.

use serde::{Deserialize, Serialize};
use sq_columnar::{ArithmeticOp, ComparisonOp};
use sq_types::Scalar;

use crate::ExprError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoolOp {
    And,
    Or,
}

/// Generic expression tree. Every kind the parser can build is listed here;
/// the walker decides which ones may run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Node {
    Literal {
        value: Scalar,
    },
    Name {
        id: String,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Node>,
    },
    Binary {
        op: ArithmeticOp,
        left: Box<Node>,
        right: Box<Node>,
    },
    Compare {
        op: ComparisonOp,
        left: Box<Node>,
        right: Box<Node>,
    },
    Logical {
        op: BoolOp,
        left: Box<Node>,
        right: Box<Node>,
    },
    Call {
        callee: Box<Node>,
        args: Vec<Node>,
        keywords: Vec<(String, Node)>,
    },
    Attribute {
        value: Box<Node>,
        attr: String,
    },
    Subscript {
        value: Box<Node>,
        index: Box<Node>,
    },
    List {
        items: Vec<Node>,
    },
}

impl Node {
    pub(crate) fn literal(value: Scalar) -> Self {
        Self::Literal { value }
    }

    pub(crate) fn name(id: impl Into<String>) -> Self {
        Self::Name { id: id.into() }
    }
}

// ── Expression Parser ───────────────────────────────────────────────────
//
// Recursive descent over eval expressions:
//   - column references and function names (identifiers)
//   - integer, float, string, boolean and null literals
//   - arithmetic: + - * / % ** (power is right-associative)
//   - comparisons: == = != < <= > >=
//   - logical: and, or, not (any case)
//   - calls, attribute access, subscripts and list displays

/// Each level costs roughly ten stack frames, so this stays small enough
/// for a 2 MiB thread in debug builds.
const MAX_DEPTH: usize = 64;

/// Names that read as keyword arguments in `name=value` call position.
/// Anywhere else a single `=` compares, so `if_(status=200, ...)` works.
const KEYWORD_PARAMETERS: &[&str] = &["precision", "chars"];

/// Parse an expression string into a `Node` tree.
///
/// Syntax:
///   expr       → or_expr
///   or_expr    → and_expr ( "or" and_expr )*
///   and_expr   → not_expr ( "and" not_expr )*
///   not_expr   → "not" not_expr | comparison
///   comparison → add_expr ( ("==" | "=" | "!=" | ">" | ">=" | "<" | "<=") add_expr )?
///   add_expr   → mul_expr ( ("+" | "-") mul_expr )*
///   mul_expr   → unary ( ("*" | "/" | "%") unary )*
///   unary      → ("-" | "+") unary | power
///   power      → postfix ( "**" unary )?
///   postfix    → atom ( "(" args ")" | "." IDENT | "[" expr "]" )*
///   atom       → NUMBER | STRING | IDENT | "(" expr ")" | "[" items "]"
pub fn parse_expr(input: &str) -> Result<Node, ExprError> {
    let tokens = tokenize(input)?;
    let mut parser = ExprParser {
        tokens: &tokens,
        pos: 0,
        depth: 0,
        input,
    };
    let node = parser.parse_or()?;
    if let Some(token) = parser.tokens.get(parser.pos) {
        return Err(parser.syntax(format!(
            "unexpected token at position {}: {token:?}",
            parser.pos
        )));
    }
    Ok(node)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    // Comparison
    EqEq,
    Assign,
    NotEq,
    Gt,
    Ge,
    Lt,
    Le,
    // Arithmetic
    Plus,
    Minus,
    Star,
    StarStar,
    Slash,
    Percent,
    // Grouping
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    // Logical (keywords)
    And,
    Or,
    Not,
}

fn syntax_error(input: &str, message: impl Into<String>) -> ExprError {
    ExprError::Syntax {
        expr: input.to_owned(),
        message: message.into(),
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExprError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        let next = chars.get(i + 1).copied();
        let (token, width) = match (c, next) {
            ('+', _) => (Token::Plus, 1),
            ('-', _) => (Token::Minus, 1),
            ('*', Some('*')) => (Token::StarStar, 2),
            ('*', _) => (Token::Star, 1),
            ('/', _) => (Token::Slash, 1),
            ('%', _) => (Token::Percent, 1),
            ('(', _) => (Token::LParen, 1),
            (')', _) => (Token::RParen, 1),
            ('[', _) => (Token::LBracket, 1),
            (']', _) => (Token::RBracket, 1),
            (',', _) => (Token::Comma, 1),
            ('.', Some(d)) if d.is_ascii_digit() && !ends_value(tokens.last()) => {
                let (token, end) = lex_number(input, &chars, i)?;
                tokens.push(token);
                i = end;
                continue;
            }
            ('.', _) => (Token::Dot, 1),
            ('=', Some('=')) => (Token::EqEq, 2),
            ('=', _) => (Token::Assign, 1),
            ('!', Some('=')) => (Token::NotEq, 2),
            ('!', _) => (Token::Not, 1),
            ('>', Some('=')) => (Token::Ge, 2),
            ('>', _) => (Token::Gt, 1),
            ('<', Some('=')) => (Token::Le, 2),
            ('<', Some('>')) => (Token::NotEq, 2),
            ('<', _) => (Token::Lt, 1),
            ('"' | '\'', _) => {
                let (text, end) = lex_string(input, &chars, i)?;
                tokens.push(Token::Str(text));
                i = end;
                continue;
            }
            (d, _) if d.is_ascii_digit() => {
                let (token, end) = lex_number(input, &chars, i)?;
                tokens.push(token);
                i = end;
                continue;
            }
            (a, _) if a.is_alphabetic() || a == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.to_ascii_lowercase().as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    _ => Token::Ident(word),
                });
                continue;
            }
            (other, _) => {
                return Err(syntax_error(
                    input,
                    format!("unexpected character {other:?} at position {i}"),
                ));
            }
        };
        tokens.push(token);
        i += width;
    }
    Ok(tokens)
}

fn ends_value(token: Option<&Token>) -> bool {
    matches!(
        token,
        Some(
            Token::Ident(_)
                | Token::Int(_)
                | Token::Float(_)
                | Token::Str(_)
                | Token::RParen
                | Token::RBracket
        )
    )
}

fn lex_string(input: &str, chars: &[char], start: usize) -> Result<(String, usize), ExprError> {
    let quote = chars[start];
    let mut out = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            '\\' if i + 1 < chars.len() => {
                out.push(match chars[i + 1] {
                    'n' => '\n',
                    't' => '\t',
                    other => other,
                });
                i += 2;
            }
            c if c == quote => return Ok((out, i + 1)),
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    Err(syntax_error(
        input,
        format!("unterminated string starting at position {start}"),
    ))
}

fn lex_number(input: &str, chars: &[char], start: usize) -> Result<(Token, usize), ExprError> {
    let mut i = start;
    let mut is_float = false;
    while i < chars.len() {
        match chars[i] {
            d if d.is_ascii_digit() => i += 1,
            '.' if !is_float && chars.get(i + 1).is_some_and(char::is_ascii_digit) => {
                is_float = true;
                i += 1;
            }
            'e' | 'E'
                if chars
                    .get(i + 1)
                    .is_some_and(|n| n.is_ascii_digit() || *n == '-' || *n == '+') =>
            {
                is_float = true;
                i += 2;
            }
            _ => break,
        }
    }
    let text: String = chars[start..i].iter().collect();
    let token = if is_float {
        Token::Float(
            text.parse::<f64>()
                .map_err(|_| syntax_error(input, format!("invalid float: {text}")))?,
        )
    } else {
        match text.parse::<i64>() {
            Ok(value) => Token::Int(value),
            Err(_) => Token::Float(
                text.parse::<f64>()
                    .map_err(|_| syntax_error(input, format!("invalid number: {text}")))?,
            ),
        }
    };
    Ok((token, i))
}

struct ExprParser<'a> {
    tokens: &'a [Token],
    pos: usize,
    depth: usize,
    input: &'a str,
}

impl ExprParser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token, what: &str) -> Result<(), ExprError> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.syntax(format!("expected {what} at position {}", self.pos)))
        }
    }

    fn syntax(&self, message: impl Into<String>) -> ExprError {
        syntax_error(self.input, message)
    }

    fn descend(&mut self) -> Result<(), ExprError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(self.syntax("expression nests too deeply"));
        }
        Ok(())
    }

    fn parse_or(&mut self) -> Result<Node, ExprError> {
        self.descend()?;
        let mut left = self.parse_and()?;
        while self.eat(&Token::Or) {
            let right = self.parse_and()?;
            left = Node::Logical {
                op: BoolOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        self.depth -= 1;
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Node, ExprError> {
        let mut left = self.parse_not()?;
        while self.eat(&Token::And) {
            let right = self.parse_not()?;
            left = Node::Logical {
                op: BoolOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Node, ExprError> {
        if self.eat(&Token::Not) {
            self.descend()?;
            let operand = self.parse_not()?;
            self.depth -= 1;
            return Ok(Node::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Node, ExprError> {
        let left = self.parse_add()?;
        let op = match self.peek() {
            Some(Token::EqEq | Token::Assign) => ComparisonOp::Eq,
            Some(Token::NotEq) => ComparisonOp::Ne,
            Some(Token::Gt) => ComparisonOp::Gt,
            Some(Token::Ge) => ComparisonOp::Ge,
            Some(Token::Lt) => ComparisonOp::Lt,
            Some(Token::Le) => ComparisonOp::Le,
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.parse_add()?;
        Ok(Node::Compare {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    fn parse_add(&mut self) -> Result<Node, ExprError> {
        let mut left = self.parse_mul()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => ArithmeticOp::Add,
                Some(Token::Minus) => ArithmeticOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_mul()?;
            left = Node::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_mul(&mut self) -> Result<Node, ExprError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => ArithmeticOp::Mul,
                Some(Token::Slash) => ArithmeticOp::Div,
                Some(Token::Percent) => ArithmeticOp::Mod,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Node::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Node, ExprError> {
        if self.eat(&Token::Minus) {
            self.descend()?;
            let operand = self.parse_unary()?;
            self.depth -= 1;
            return Ok(match operand {
                Node::Literal {
                    value: Scalar::Int64(v),
                } if v != i64::MIN => Node::literal(Scalar::Int64(-v)),
                Node::Literal {
                    value: Scalar::Float64(v),
                } => Node::literal(Scalar::Float64(-v)),
                other => Node::Unary {
                    op: UnaryOp::Neg,
                    operand: Box::new(other),
                },
            });
        }
        if self.eat(&Token::Plus) {
            self.descend()?;
            let operand = self.parse_unary()?;
            self.depth -= 1;
            return Ok(operand);
        }
        self.parse_power()
    }

    fn parse_power(&mut self) -> Result<Node, ExprError> {
        let base = self.parse_postfix()?;
        if self.eat(&Token::StarStar) {
            self.descend()?;
            let exponent = self.parse_unary()?;
            self.depth -= 1;
            return Ok(Node::Binary {
                op: ArithmeticOp::Pow,
                left: Box::new(base),
                right: Box::new(exponent),
            });
        }
        Ok(base)
    }

    fn parse_postfix(&mut self) -> Result<Node, ExprError> {
        let mut node = self.parse_atom()?;
        loop {
            if self.eat(&Token::LParen) {
                let (args, keywords) = self.parse_call_args()?;
                node = Node::Call {
                    callee: Box::new(node),
                    args,
                    keywords,
                };
            } else if self.eat(&Token::Dot) {
                let Some(Token::Ident(attr)) = self.peek().cloned() else {
                    return Err(self.syntax("expected attribute name after '.'"));
                };
                self.pos += 1;
                node = Node::Attribute {
                    value: Box::new(node),
                    attr,
                };
            } else if self.eat(&Token::LBracket) {
                let index = self.parse_or()?;
                self.expect(&Token::RBracket, "']'")?;
                node = Node::Subscript {
                    value: Box::new(node),
                    index: Box::new(index),
                };
            } else {
                return Ok(node);
            }
        }
    }

    fn parse_call_args(&mut self) -> Result<(Vec<Node>, Vec<(String, Node)>), ExprError> {
        let mut args = Vec::new();
        let mut keywords = Vec::new();
        if self.eat(&Token::RParen) {
            return Ok((args, keywords));
        }
        loop {
            let keyword = match (self.peek(), self.tokens.get(self.pos + 1)) {
                (Some(Token::Ident(name)), Some(Token::Assign))
                    if KEYWORD_PARAMETERS.contains(&name.as_str()) =>
                {
                    Some(name.clone())
                }
                _ => None,
            };
            if let Some(name) = keyword {
                self.pos += 2;
                let value = self.parse_or()?;
                keywords.push((name, value));
            } else {
                if !keywords.is_empty() {
                    return Err(self.syntax("positional argument follows keyword argument"));
                }
                args.push(self.parse_or()?);
            }
            if self.eat(&Token::Comma) {
                continue;
            }
            self.expect(&Token::RParen, "')' to close the call")?;
            return Ok((args, keywords));
        }
    }

    fn parse_atom(&mut self) -> Result<Node, ExprError> {
        let Some(token) = self.peek().cloned() else {
            return Err(self.syntax("unexpected end of expression"));
        };
        self.pos += 1;
        match token {
            Token::Int(v) => Ok(Node::literal(Scalar::Int64(v))),
            Token::Float(v) => Ok(Node::literal(Scalar::Float64(v))),
            Token::Str(s) => Ok(Node::literal(Scalar::Utf8(s))),
            Token::Ident(name) => Ok(match name.to_ascii_lowercase().as_str() {
                "true" => Node::literal(Scalar::Bool(true)),
                "false" => Node::literal(Scalar::Bool(false)),
                "null" | "none" => Node::literal(Scalar::null()),
                _ => Node::name(name),
            }),
            Token::LParen => {
                let inner = self.parse_or()?;
                self.expect(&Token::RParen, "')'")?;
                Ok(inner)
            }
            Token::LBracket => {
                let mut items = Vec::new();
                if !self.eat(&Token::RBracket) {
                    loop {
                        items.push(self.parse_or()?);
                        if self.eat(&Token::Comma) {
                            continue;
                        }
                        self.expect(&Token::RBracket, "']' to close the list")?;
                        break;
                    }
                }
                Ok(Node::List { items })
            }
            other => Err(self.syntax(format!(
                "unexpected token at position {}: {other:?}",
                self.pos - 1
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use sq_columnar::{ArithmeticOp, ComparisonOp};
    use sq_types::Scalar;

    use super::{BoolOp, MAX_DEPTH, Node, parse_expr};
    use crate::ExprError;

    #[test]
    fn precedence_follows_arithmetic_rules() {
        let node = parse_expr("a + b * 2").expect("parse");
        let Node::Binary { op, right, .. } = node else {
            panic!("expected binary root");
        };
        assert_eq!(op, ArithmeticOp::Add);
        assert!(matches!(
            *right,
            Node::Binary {
                op: ArithmeticOp::Mul,
                ..
            }
        ));
    }

    #[test]
    fn power_is_right_associative_and_binds_tighter_than_negation() {
        let node = parse_expr("-2 ** 2").expect("parse");
        assert!(matches!(node, Node::Unary { .. }));
        let node = parse_expr("2 ** 3 ** 2").expect("parse");
        let Node::Binary { right, .. } = node else {
            panic!("expected binary root");
        };
        assert!(matches!(
            *right,
            Node::Binary {
                op: ArithmeticOp::Pow,
                ..
            }
        ));
    }

    #[test]
    fn keywords_are_case_insensitive() {
        let node = parse_expr("a > 1 AND NOT b == 'x' or c").expect("parse");
        assert!(matches!(
            node,
            Node::Logical {
                op: BoolOp::Or,
                ..
            }
        ));
    }

    #[test]
    fn single_equals_compares() {
        let node = parse_expr("status = 'ok'").expect("parse");
        assert!(matches!(
            node,
            Node::Compare {
                op: ComparisonOp::Eq,
                ..
            }
        ));
    }

    #[test]
    fn equality_inside_call_is_not_a_keyword() {
        let Node::Call { args, keywords, .. } =
            parse_expr("if_(status=200, 'ok', 'bad')").expect("parse")
        else {
            panic!("expected call");
        };
        assert!(keywords.is_empty());
        assert!(matches!(args[0], Node::Compare { .. }));
    }

    #[test]
    fn negative_literals_fold() {
        assert_eq!(
            parse_expr("-1.5").expect("parse"),
            Node::Literal {
                value: Scalar::Float64(-1.5)
            }
        );
    }

    #[test]
    fn attribute_subscript_and_keyword_calls_parse() {
        let node = parse_expr("os.system('ls')").expect("parse");
        let Node::Call { callee, .. } = node else {
            panic!("expected call");
        };
        assert!(matches!(*callee, Node::Attribute { .. }));

        assert!(matches!(
            parse_expr("x[0]").expect("parse"),
            Node::Subscript { .. }
        ));

        let Node::Call { keywords, .. } = parse_expr("round(x, precision=2)").expect("parse")
        else {
            panic!("expected call");
        };
        assert_eq!(keywords.len(), 1);
        assert_eq!(keywords[0].0, "precision");
    }

    #[test]
    fn malformed_input_is_a_syntax_error() {
        for bad in ["", "a +", "(a", "'open", "a $ b", "round(precision=1, 2)", "[1, 2"] {
            assert!(
                matches!(parse_expr(bad), Err(ExprError::Syntax { .. })),
                "{bad:?} should fail"
            );
        }
    }

    #[test]
    fn deep_nesting_is_rejected_without_overflow() {
        let deep = format!("{}1{}", "(".repeat(5000), ")".repeat(5000));
        assert!(matches!(parse_expr(&deep), Err(ExprError::Syntax { .. })));
        let negations = format!("{}1", "-".repeat(5000));
        assert!(matches!(parse_expr(&negations), Err(ExprError::Syntax { .. })));
    }

    fn parenthesized(levels: usize) -> String {
        format!("{}x + 1{}", "(".repeat(levels), ")".repeat(levels))
    }

    #[test]
    fn nesting_limit_is_exact() {
        // The whole expression is the first level; each paren adds one.
        let node = parse_expr(&parenthesized(MAX_DEPTH - 1)).expect("at the limit");
        assert!(matches!(node, Node::Binary { .. }));

        let err = parse_expr(&parenthesized(MAX_DEPTH)).expect_err("one past the limit");
        assert!(matches!(err, ExprError::Syntax { .. }), "{err}");

        let negations = format!("{}1", "-".repeat(MAX_DEPTH - 1));
        assert!(parse_expr(&negations).is_ok());
        let negations = format!("{}1", "-".repeat(MAX_DEPTH));
        assert!(matches!(parse_expr(&negations), Err(ExprError::Syntax { .. })));
    }
}
