use serde::{Deserialize, Serialize};
use sq_columnar::ColumnError;
use sq_expr::ExprError;
use sq_filter::FilterError;
use sq_frame::FrameError;
use sq_groupby::StatsError;
use sq_join::JoinError;
use sq_lexer::LexError;
use sq_runtime::RuntimeError;
use sq_types::TypeError;
use thiserror::Error;

use crate::collab::CollaboratorError;

/// Failure taxonomy reported to hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Syntax,
    NameNotAllowed,
    DisallowedConstruct,
    UnknownDirective,
    Configuration,
    MissingColumn,
    Aggregation,
    Type,
    Collaborator,
}

#[derive(Debug, Error)]
pub enum DirectiveError {
    #[error("unknown directive {0:?}")]
    UnknownDirective(String),
    #[error("invalid {directive} arguments: {message}")]
    Syntax {
        directive: &'static str,
        message: String,
    },
    #[error("{directive}: {message}")]
    Configuration {
        directive: &'static str,
        message: String,
    },
    #[error("column {0:?} does not exist")]
    MissingColumn(String),
    #[error("{directive}: cannot convert {value:?}: {message}")]
    InvalidValue {
        directive: &'static str,
        value: String,
        message: String,
    },
    #[error("unknown macro {0:?}")]
    UnknownMacro(String),
    #[error("invalid regular expression: {0}")]
    Regex(#[from] regex::Error),
    #[error("subsearch failed: {0}")]
    Subsearch(Box<EngineError>),
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error(transparent)]
    Expr(#[from] ExprError),
    #[error(transparent)]
    Stats(#[from] StatsError),
    #[error(transparent)]
    Join(#[from] JoinError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Column(#[from] ColumnError),
    #[error(transparent)]
    Type(#[from] TypeError),
    #[error(transparent)]
    Lex(#[from] LexError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
}

impl DirectiveError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownDirective(_) => ErrorKind::UnknownDirective,
            Self::Syntax { .. } | Self::Regex(_) | Self::Lex(_) => ErrorKind::Syntax,
            Self::Configuration { .. } | Self::UnknownMacro(_) | Self::Runtime(_) => {
                ErrorKind::Configuration
            }
            Self::MissingColumn(_) => ErrorKind::MissingColumn,
            Self::InvalidValue { .. } | Self::Column(_) | Self::Type(_) => ErrorKind::Type,
            Self::Subsearch(inner) => inner.kind(),
            Self::Filter(err) => filter_kind(err),
            Self::Expr(err) => expr_kind(err),
            Self::Stats(err) => stats_kind(err),
            Self::Join(err) => match err {
                JoinError::NoKeys => ErrorKind::Syntax,
                JoinError::MissingKey { .. } => ErrorKind::MissingColumn,
                JoinError::Frame(err) => frame_kind(err),
                JoinError::Column(_) => ErrorKind::Type,
            },
            Self::Frame(err) => frame_kind(err),
            Self::Collaborator(_) => ErrorKind::Collaborator,
        }
    }
}

fn frame_kind(err: &FrameError) -> ErrorKind {
    match err {
        FrameError::MissingColumn(_) => ErrorKind::MissingColumn,
        FrameError::DuplicateColumn(_) => ErrorKind::Configuration,
        FrameError::LengthMismatch { .. } | FrameError::Column(_) => ErrorKind::Type,
    }
}

fn filter_kind(err: &FilterError) -> ErrorKind {
    match err {
        FilterError::Syntax { .. } | FilterError::Lex(_) => ErrorKind::Syntax,
        FilterError::MissingColumn(_) => ErrorKind::MissingColumn,
        FilterError::Column(_) => ErrorKind::Type,
        FilterError::Frame(err) => frame_kind(err),
    }
}

fn expr_kind(err: &ExprError) -> ErrorKind {
    match err {
        ExprError::Syntax { .. } | ExprError::InvalidAssignment(_) | ExprError::Lex(_) => {
            ErrorKind::Syntax
        }
        ExprError::NameNotAllowed(_) => ErrorKind::NameNotAllowed,
        ExprError::DisallowedConstruct(_) => ErrorKind::DisallowedConstruct,
        ExprError::Arity { .. } | ExprError::UnexpectedKeyword { .. } => ErrorKind::Configuration,
        ExprError::InvalidArgument { .. } | ExprError::Type(_) | ExprError::Column(_) => {
            ErrorKind::Type
        }
        ExprError::Frame(err) => frame_kind(err),
    }
}

fn stats_kind(err: &StatsError) -> ErrorKind {
    match err {
        StatsError::UnknownFunction(_) => ErrorKind::Aggregation,
        StatsError::InvalidSpec { .. } | StatsError::NoFunctions | StatsError::Lex(_) => {
            ErrorKind::Syntax
        }
        StatsError::DuplicateAlias(_)
        | StatsError::FieldRequired(_)
        | StatsError::InvalidSpan(_) => ErrorKind::Configuration,
        StatsError::MissingColumn(_) => ErrorKind::MissingColumn,
        StatsError::InvalidTime { .. } | StatsError::Type(_) | StatsError::Column(_) => {
            ErrorKind::Type
        }
        StatsError::Frame(err) => frame_kind(err),
    }
}

/// Error returned by [`crate::Engine::execute`]. Directive failures carry
/// the 0-based segment index and the keyword as written.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Lex(#[from] LexError),
    #[error("accelerator failed: {0}")]
    Accelerator(#[source] CollaboratorError),
    #[error(transparent)]
    Admission(RuntimeError),
    #[error("directive {index} ({keyword}) failed: {source}")]
    Directive {
        index: usize,
        keyword: String,
        #[source]
        source: DirectiveError,
    },
}

impl EngineError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Lex(_) => ErrorKind::Syntax,
            Self::Accelerator(_) => ErrorKind::Collaborator,
            Self::Admission(_) => ErrorKind::Configuration,
            Self::Directive { source, .. } => source.kind(),
        }
    }

    /// Index and keyword of the failing directive, if one was running.
    #[must_use]
    pub fn directive(&self) -> Option<(usize, &str)> {
        match self {
            Self::Directive { index, keyword, .. } => Some((*index, keyword.as_str())),
            _ => None,
        }
    }
}
