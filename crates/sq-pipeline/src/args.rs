//! Shared argument handling for directive handlers.

use sq_lexer::{Token, TokenKind};

use crate::error::DirectiveError;

/// A directive's arguments split into `key=value` options and the
/// remaining positional tokens (commas dropped).
#[derive(Debug, Clone, Default)]
pub(crate) struct Args {
    options: Vec<(String, String)>,
    pub positional: Vec<Token>,
}

impl Args {
    /// Tokens glued to an option value without whitespace belong to it, so
    /// `path=a.b[0]` keeps its brackets.
    pub fn parse(tokens: &[Token]) -> Self {
        let mut args = Self::default();
        let mut pos = 0;
        while pos < tokens.len() {
            let token = &tokens[pos];
            if token.is_punct(",") {
                pos += 1;
                continue;
            }
            let is_option = token.kind == TokenKind::Identifier
                && tokens.get(pos + 1).is_some_and(|t| t.is_operator("="))
                && tokens.get(pos + 2).is_some_and(|t| !t.is_punct(","));
            if !is_option {
                args.positional.push(token.clone());
                pos += 1;
                continue;
            }
            let first = &tokens[pos + 2];
            let mut value = first.unquoted();
            let mut end = first.end();
            pos += 3;
            while let Some(next) = tokens.get(pos) {
                if next.offset != end || next.is_punct(",") {
                    break;
                }
                value.push_str(&next.value);
                end = next.end();
                pos += 1;
            }
            args.options.push((token.value.to_ascii_lowercase(), value));
        }
        args
    }

    #[must_use]
    pub fn option(&self, key: &str) -> Option<&str> {
        self.options
            .iter()
            .rev()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }

    pub fn flag(&self, directive: &'static str, key: &str) -> Result<Option<bool>, DirectiveError> {
        self.option(key)
            .map(|value| parse_bool(value).ok_or_else(|| invalid(directive, key, value)))
            .transpose()
    }

    pub fn count(&self, directive: &'static str, key: &str) -> Result<Option<usize>, DirectiveError> {
        self.option(key)
            .map(|value| value.parse::<usize>().map_err(|_| invalid(directive, key, value)))
            .transpose()
    }

    /// Positional tokens read as field names.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.positional.iter().map(Token::unquoted).collect()
    }
}

fn invalid(directive: &'static str, key: &str, value: &str) -> DirectiveError {
    DirectiveError::Configuration {
        directive,
        message: format!("invalid value {value:?} for {key}"),
    }
}

pub(crate) fn parse_bool(text: &str) -> Option<bool> {
    match text.to_ascii_lowercase().as_str() {
        "true" | "t" | "1" | "yes" => Some(true),
        "false" | "f" | "0" | "no" => Some(false),
        _ => None,
    }
}

/// Field names from tokens, skipping commas.
pub(crate) fn field_names(tokens: &[Token]) -> Vec<String> {
    tokens
        .iter()
        .filter(|token| !token.is_punct(","))
        .map(Token::unquoted)
        .collect()
}

/// A leading count such as `head 10` or `sort 5 -x`.
pub(crate) fn leading_count(tokens: &[Token]) -> Option<(usize, &[Token])> {
    let first = tokens.first()?;
    if first.kind != TokenKind::NumberLiteral {
        return None;
    }
    let count = first.value.parse::<usize>().ok()?;
    Some((count, &tokens[1..]))
}

pub(crate) fn syntax(directive: &'static str, message: impl Into<String>) -> DirectiveError {
    DirectiveError::Syntax {
        directive,
        message: message.into(),
    }
}

pub(crate) fn configuration(directive: &'static str, message: impl Into<String>) -> DirectiveError {
    DirectiveError::Configuration {
        directive,
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use sq_lexer::lex_segment;

    use super::{Args, leading_count};

    #[test]
    fn options_and_positionals_separate() {
        let tokens = lex_segment(r#"field=msg max_match=2 "(?<user>\w+)" path=a.b[0].c"#)
            .expect("lex");
        let args = Args::parse(&tokens);
        assert_eq!(args.option("field"), Some("msg"));
        assert_eq!(args.count("rex", "max_match").expect("count"), Some(2));
        assert_eq!(args.option("path"), Some("a.b[0].c"));
        assert_eq!(args.names(), vec![r"(?<user>\w+)".to_owned()]);
    }

    #[test]
    fn bad_flags_are_configuration_errors() {
        let args = Args::parse(&lex_segment("append=maybe").expect("lex"));
        assert!(args.flag("outputlookup", "append").is_err());
    }

    #[test]
    fn leading_count_needs_a_number() {
        let tokens = lex_segment("10 x").expect("lex");
        assert_eq!(leading_count(&tokens).map(|(n, rest)| (n, rest.len())), Some((10, 1)));
        assert!(leading_count(&lex_segment("x").expect("lex")).is_none());
    }
}
