#![forbid(unsafe_code)]

//! Tokenizer and segmenter for speak queries.
//!
//! ```text
//! query    := index_clause ( "|" segment )*
//! segment  := keyword args...
//! ```
//!
//! Splitting happens on top-level `|` only: pipes inside quotes, `(...)` or
//! `[...]` (subsearch blocks) belong to the enclosing segment. Token values
//! are exact slices of the input, so quoted literals keep their quotes.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Identifier,
    StringLiteral,
    NumberLiteral,
    Operator,
    Punctuation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub kind: TokenKind,
    pub value: String,
    /// Byte offset of the token within its segment.
    pub offset: usize,
}

impl Token {
    #[must_use]
    pub fn new(kind: TokenKind, value: impl Into<String>, offset: usize) -> Self {
        Self {
            kind,
            value: value.into(),
            offset,
        }
    }

    /// Case-insensitive keyword test on identifiers (`AND`, `by`, `as`).
    #[must_use]
    pub fn is_keyword(&self, keyword: &str) -> bool {
        self.kind == TokenKind::Identifier && self.value.eq_ignore_ascii_case(keyword)
    }

    #[must_use]
    pub fn is_punct(&self, punct: &str) -> bool {
        self.kind == TokenKind::Punctuation && self.value == punct
    }

    #[must_use]
    pub fn is_operator(&self, op: &str) -> bool {
        self.kind == TokenKind::Operator && self.value == op
    }

    /// Literal content: quotes stripped and escaped quotes resolved for
    /// string literals, the raw value otherwise.
    #[must_use]
    pub fn unquoted(&self) -> String {
        if self.kind != TokenKind::StringLiteral {
            return self.value.clone();
        }
        unquote(&self.value)
    }

    #[must_use]
    pub fn end(&self) -> usize {
        self.offset + self.value.len()
    }
}

/// Strips one pair of matching quotes and resolves `\<quote>` escapes.
/// Other backslash sequences are kept verbatim so regex patterns survive.
#[must_use]
pub fn unquote(raw: &str) -> String {
    let mut chars = raw.chars();
    let Some(open) = chars.next() else {
        return String::new();
    };
    if !is_quote(open) || raw.len() < 2 || !raw.ends_with(open) {
        return raw.to_owned();
    }
    let inner = &raw[open.len_utf8()..raw.len() - open.len_utf8()];
    let mut out = String::with_capacity(inner.len());
    let mut iter = inner.chars().peekable();
    while let Some(ch) = iter.next() {
        if ch == '\\' && iter.peek() == Some(&open) {
            out.push(open);
            iter.next();
        } else {
            out.push(ch);
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineSegment {
    /// Zero-based position in the pipeline.
    pub index: usize,
    pub text: String,
    pub tokens: Vec<Token>,
}

impl PipelineSegment {
    #[must_use]
    pub fn keyword(&self) -> Option<&Token> {
        self.tokens.first()
    }

    /// Tokens after the keyword.
    #[must_use]
    pub fn args(&self) -> &[Token] {
        self.tokens.get(1..).unwrap_or_default()
    }

    /// Raw text after the keyword, trimmed.
    #[must_use]
    pub fn args_text(&self) -> &str {
        self.tokens
            .first()
            .and_then(|first| self.text.get(first.end()..))
            .map_or("", str::trim)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitQuery {
    pub index_clause: String,
    pub index_tokens: Vec<Token>,
    pub segments: Vec<PipelineSegment>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LexError {
    #[error("unterminated {delimiter} quote starting at offset {offset} in {segment:?}")]
    Unterminated {
        segment: String,
        offset: usize,
        delimiter: char,
    },
    #[error("unbalanced {delimiter:?} at offset {offset} in {segment:?}")]
    Unbalanced {
        segment: String,
        offset: usize,
        delimiter: char,
    },
    #[error("empty pipeline segment at offset {offset} in {query:?}")]
    EmptySegment { query: String, offset: usize },
}

fn is_quote(ch: char) -> bool {
    matches!(ch, '"' | '\'' | '`')
}

fn closer_for(open: char) -> char {
    if open == '(' { ')' } else { ']' }
}

/// Splits `text` on `separator` wherever it occurs outside quotes and
/// brackets. Pieces are returned untrimmed together with their byte offset.
pub fn split_top_level_with_offsets(
    text: &str,
    separator: char,
) -> Result<Vec<(usize, &str)>, LexError> {
    let mut pieces = Vec::new();
    let mut stack: Vec<(char, usize)> = Vec::new();
    let mut quote: Option<(char, usize)> = None;
    let mut escaped = false;
    let mut start = 0;

    for (offset, ch) in text.char_indices() {
        if let Some((open, _)) = quote {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == open {
                quote = None;
            }
            continue;
        }
        match ch {
            c if is_quote(c) => quote = Some((c, offset)),
            '(' | '[' => stack.push((ch, offset)),
            ')' | ']' => match stack.pop() {
                Some((open, _)) if closer_for(open) == ch => {}
                _ => {
                    return Err(LexError::Unbalanced {
                        segment: text.to_owned(),
                        offset,
                        delimiter: ch,
                    });
                }
            },
            c if c == separator && stack.is_empty() => {
                pieces.push((start, &text[start..offset]));
                start = offset + c.len_utf8();
            }
            _ => {}
        }
    }

    if let Some((delimiter, offset)) = quote {
        return Err(LexError::Unterminated {
            segment: text.to_owned(),
            offset,
            delimiter,
        });
    }
    if let Some((delimiter, offset)) = stack.pop() {
        return Err(LexError::Unbalanced {
            segment: text.to_owned(),
            offset,
            delimiter,
        });
    }

    pieces.push((start, &text[start..]));
    Ok(pieces)
}

/// Top-level split with each piece trimmed; empty pieces are dropped.
pub fn split_top_level(text: &str, separator: char) -> Result<Vec<String>, LexError> {
    Ok(split_top_level_with_offsets(text, separator)?
        .into_iter()
        .map(|(_, piece)| piece.trim())
        .filter(|piece| !piece.is_empty())
        .map(str::to_owned)
        .collect())
}

/// Comma-separated argument list (`a, f(b, c), "x,y"` has three items).
pub fn split_arguments(text: &str) -> Result<Vec<String>, LexError> {
    split_top_level(text, ',')
}

/// Splits `text` into the index clause and pipeline segments, lexing each.
pub fn split_query(query: &str) -> Result<SplitQuery, LexError> {
    let pieces = split_top_level_with_offsets(query, '|')?;
    let mut iter = pieces.into_iter();
    let index_clause = iter.next().map_or("", |(_, piece)| piece).trim().to_owned();
    let index_tokens = lex_segment(&index_clause)?;

    let mut segments = Vec::new();
    for (index, (offset, piece)) in iter.enumerate() {
        let text = piece.trim();
        if text.is_empty() {
            return Err(LexError::EmptySegment {
                query: query.to_owned(),
                offset,
            });
        }
        segments.push(PipelineSegment {
            index,
            text: text.to_owned(),
            tokens: lex_segment(text)?,
        });
    }

    Ok(SplitQuery {
        index_clause,
        index_tokens,
        segments,
    })
}

fn is_operator_start(ch: char) -> bool {
    matches!(ch, '=' | '!' | '<' | '>')
}

fn is_word_char(ch: char) -> bool {
    !(ch.is_whitespace()
        || is_quote(ch)
        || is_operator_start(ch)
        || matches!(ch, '(' | ')' | '[' | ']' | ','))
}

fn looks_numeric(word: &str) -> bool {
    let first = word.chars().next().unwrap_or(' ');
    (first.is_ascii_digit() || (first == '.' && word.len() > 1))
        && word.bytes().any(|b| b.is_ascii_digit())
        && word.parse::<f64>().is_ok()
}

/// Lexes one segment (or the index clause) into tokens.
///
/// `-`, `+` and `%` are operators only at the start of a word, so
/// `-count` is two tokens while `my-file.csv` stays one.
pub fn lex_segment(text: &str) -> Result<Vec<Token>, LexError> {
    let chars = text.char_indices().collect::<Vec<_>>();
    let mut tokens = Vec::new();
    let mut stack: Vec<(char, usize)> = Vec::new();
    let mut pos = 0;

    while pos < chars.len() {
        let (offset, ch) = chars[pos];

        if ch.is_whitespace() {
            pos += 1;
            continue;
        }

        if is_quote(ch) {
            let mut end = None;
            let mut idx = pos + 1;
            while idx < chars.len() {
                let (_, c) = chars[idx];
                if c == '\\' {
                    idx += 2;
                    continue;
                }
                if c == ch {
                    end = Some(idx);
                    break;
                }
                idx += 1;
            }
            let Some(end) = end else {
                return Err(LexError::Unterminated {
                    segment: text.to_owned(),
                    offset,
                    delimiter: ch,
                });
            };
            let stop = chars[end].0 + ch.len_utf8();
            tokens.push(Token::new(
                TokenKind::StringLiteral,
                &text[offset..stop],
                offset,
            ));
            pos = end + 1;
            continue;
        }

        match ch {
            '(' | '[' => {
                stack.push((ch, offset));
                tokens.push(Token::new(TokenKind::Punctuation, ch.to_string(), offset));
                pos += 1;
                continue;
            }
            ')' | ']' => {
                match stack.pop() {
                    Some((open, _)) if closer_for(open) == ch => {}
                    _ => {
                        return Err(LexError::Unbalanced {
                            segment: text.to_owned(),
                            offset,
                            delimiter: ch,
                        });
                    }
                }
                tokens.push(Token::new(TokenKind::Punctuation, ch.to_string(), offset));
                pos += 1;
                continue;
            }
            ',' => {
                tokens.push(Token::new(TokenKind::Punctuation, ",", offset));
                pos += 1;
                continue;
            }
            _ => {}
        }

        if is_operator_start(ch) {
            let next = chars.get(pos + 1).map(|(_, c)| *c);
            let width = match (ch, next) {
                ('=' | '!' | '<' | '>', Some('=')) => 2,
                _ => 1,
            };
            let stop = chars.get(pos + width).map_or(text.len(), |(o, _)| *o);
            tokens.push(Token::new(TokenKind::Operator, &text[offset..stop], offset));
            pos += width;
            continue;
        }

        if matches!(ch, '-' | '+' | '%') {
            tokens.push(Token::new(TokenKind::Operator, ch.to_string(), offset));
            pos += 1;
            continue;
        }

        let mut idx = pos;
        while idx < chars.len() && is_word_char(chars[idx].1) {
            idx += 1;
        }
        let stop = chars.get(idx).map_or(text.len(), |(o, _)| *o);
        let word = &text[offset..stop];
        let kind = if looks_numeric(word) {
            TokenKind::NumberLiteral
        } else {
            TokenKind::Identifier
        };
        tokens.push(Token::new(kind, word, offset));
        pos = idx;
    }

    if let Some((delimiter, offset)) = stack.pop() {
        return Err(LexError::Unbalanced {
            segment: text.to_owned(),
            offset,
            delimiter,
        });
    }

    Ok(tokens)
}

/// Inner text of every top-level `[...]` block, in order.
pub fn bracket_blocks(text: &str) -> Result<Vec<String>, LexError> {
    let mut blocks = Vec::new();
    let mut depth = 0_usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut start = 0;

    for (offset, ch) in text.char_indices() {
        if let Some(open) = quote {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == open {
                quote = None;
            }
            continue;
        }
        match ch {
            c if is_quote(c) => quote = Some(c),
            '[' => {
                if depth == 0 {
                    start = offset + 1;
                }
                depth += 1;
            }
            ']' => {
                if depth == 0 {
                    return Err(LexError::Unbalanced {
                        segment: text.to_owned(),
                        offset,
                        delimiter: ']',
                    });
                }
                depth -= 1;
                if depth == 0 {
                    blocks.push(text[start..offset].trim().to_owned());
                }
            }
            _ => {}
        }
    }

    if depth > 0 {
        return Err(LexError::Unbalanced {
            segment: text.to_owned(),
            offset: start.saturating_sub(1),
            delimiter: '[',
        });
    }
    Ok(blocks)
}

/// Text before the first top-level `[`, i.e. a directive's arguments
/// without its subsearch blocks.
#[must_use]
pub fn text_before_brackets(text: &str) -> &str {
    let mut quote: Option<char> = None;
    for (offset, ch) in text.char_indices() {
        match quote {
            Some(open) if ch == open => quote = None,
            Some(_) => {}
            None if is_quote(ch) => quote = Some(ch),
            None if ch == '[' => return text[..offset].trim(),
            None => {}
        }
    }
    text.trim()
}

/// Splits an assignment on its first top-level `=` that is not part of
/// `==`, `!=`, `<=` or `>=`.
#[must_use]
pub fn split_assignment(text: &str) -> Option<(&str, &str)> {
    let bytes = text.as_bytes();
    let mut depth = 0_i32;
    let mut quote: Option<u8> = None;
    let mut idx = 0;
    while idx < bytes.len() {
        let b = bytes[idx];
        if let Some(open) = quote {
            if b == b'\\' {
                idx += 2;
                continue;
            }
            if b == open {
                quote = None;
            }
            idx += 1;
            continue;
        }
        match b {
            b'"' | b'\'' | b'`' => quote = Some(b),
            b'(' | b'[' => depth += 1,
            b')' | b']' => depth -= 1,
            b'=' if depth == 0 => {
                let prev = idx.checked_sub(1).map(|p| bytes[p]);
                let next = bytes.get(idx + 1).copied();
                let part_of_operator =
                    matches!(prev, Some(b'!' | b'<' | b'>' | b'=')) || next == Some(b'=');
                if !part_of_operator {
                    return Some((text[..idx].trim(), text[idx + 1..].trim()));
                }
                if next == Some(b'=') {
                    idx += 1;
                }
            }
            _ => {}
        }
        idx += 1;
    }
    None
}

/// True for `[A-Za-z_][A-Za-z0-9_]*`.
#[must_use]
pub fn is_identifier(text: &str) -> bool {
    let mut chars = text.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
