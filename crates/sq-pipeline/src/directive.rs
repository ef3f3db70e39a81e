//! The closed directive set and keyword resolution.

use serde::{Deserialize, Serialize};
use sq_frame::Table;
use sq_lexer::{PipelineSegment, Token, TokenKind, is_identifier, split_assignment};

use crate::engine::Exec;
use crate::error::DirectiveError;
use crate::handlers;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Directive {
    Search,
    Where,
    Eval,
    Stats,
    EventStats,
    StreamStats,
    Timechart,
    Rename,
    Fields,
    MakeTable,
    Lookup,
    InputLookup,
    OutputLookup,
    Head,
    Bin,
    Reverse,
    Dedup,
    Sort,
    Rex,
    Regex,
    Base64,
    FillNull,
    Join,
    Append,
    AppendPipe,
    MultiSearch,
    Coalesce,
    MvExpand,
    MvJoin,
    MvIndex,
    MvCount,
    MvDc,
    MvFind,
    MvZip,
    MvReverse,
    MvCombine,
    MvDedup,
    MvAppend,
    MvFilter,
    SPath,
    FieldSummary,
    Macro,
}

/// Keyword table. The first entry for a directive is its canonical name.
pub const DIRECTIVES: &[(&str, Directive)] = &[
    ("search", Directive::Search),
    ("where", Directive::Where),
    ("eval", Directive::Eval),
    ("stats", Directive::Stats),
    ("eventstats", Directive::EventStats),
    ("streamstats", Directive::StreamStats),
    ("timechart", Directive::Timechart),
    ("rename", Directive::Rename),
    ("fields", Directive::Fields),
    ("table", Directive::Fields),
    ("maketable", Directive::MakeTable),
    ("lookup", Directive::Lookup),
    ("inputlookup", Directive::InputLookup),
    ("outputlookup", Directive::OutputLookup),
    ("head", Directive::Head),
    ("limit", Directive::Head),
    ("bin", Directive::Bin),
    ("reverse", Directive::Reverse),
    ("dedup", Directive::Dedup),
    ("sort", Directive::Sort),
    ("rex", Directive::Rex),
    ("regex", Directive::Regex),
    ("base64", Directive::Base64),
    ("fillnull", Directive::FillNull),
    ("join", Directive::Join),
    ("append", Directive::Append),
    ("appendpipe", Directive::AppendPipe),
    ("multisearch", Directive::MultiSearch),
    ("coalesce", Directive::Coalesce),
    ("mvexpand", Directive::MvExpand),
    ("mvjoin", Directive::MvJoin),
    ("mvindex", Directive::MvIndex),
    ("mvcount", Directive::MvCount),
    ("mvdc", Directive::MvDc),
    ("mvfind", Directive::MvFind),
    ("mvzip", Directive::MvZip),
    ("mvreverse", Directive::MvReverse),
    ("mvcombine", Directive::MvCombine),
    ("mvdedup", Directive::MvDedup),
    ("mvappend", Directive::MvAppend),
    ("mvfilter", Directive::MvFilter),
    ("spath", Directive::SPath),
    ("fieldsummary", Directive::FieldSummary),
];

impl Directive {
    /// Case-insensitive keyword lookup, aliases included.
    #[must_use]
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        DIRECTIVES
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(keyword))
            .map(|(_, directive)| *directive)
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        if self == Self::Macro {
            return "macro";
        }
        DIRECTIVES
            .iter()
            .find(|(_, directive)| *directive == self)
            .map_or("macro", |(name, _)| *name)
    }

    pub(crate) fn apply(
        self,
        exec: &Exec<'_>,
        table: Table,
        inv: &Invocation<'_>,
    ) -> Result<Table, DirectiveError> {
        use handlers::{filter, lookup, mv, reshape, stats, subsearch, summary, text};

        match self {
            Self::Search | Self::Where => filter::search(table, inv),
            Self::Eval => stats::eval(exec, table, inv),
            Self::Stats | Self::EventStats | Self::StreamStats => stats::aggregate(self, table, inv),
            Self::Timechart => stats::timechart(exec, table, inv),
            Self::Rename => reshape::rename(table, inv),
            Self::Fields => reshape::fields(table, inv),
            Self::MakeTable => reshape::maketable(table, inv),
            Self::Head => reshape::head(exec, table, inv),
            Self::Reverse => Ok(table.reverse()),
            Self::Dedup => reshape::dedup(table, inv),
            Self::Sort => reshape::sort(table, inv),
            Self::FillNull => reshape::fillnull(table, inv),
            Self::Coalesce => reshape::coalesce(table, inv),
            Self::Bin => stats::bin(exec, table, inv),
            Self::Rex => text::rex(table, inv),
            Self::Regex => text::regex(table, inv),
            Self::Base64 => text::base64(table, inv),
            Self::SPath => text::spath(table, inv),
            Self::Lookup => lookup::lookup(exec, table, inv),
            Self::InputLookup => lookup::inputlookup(exec, inv),
            Self::OutputLookup => lookup::outputlookup(exec, table, inv),
            Self::Join => subsearch::join(exec, table, inv),
            Self::Append => subsearch::append(exec, table, inv),
            Self::AppendPipe => subsearch::appendpipe(exec, table, inv),
            Self::MultiSearch => subsearch::multisearch(exec, inv),
            Self::Macro => subsearch::macro_call(exec, table, inv),
            Self::MvExpand => mv::expand(table, inv),
            Self::MvJoin => mv::join(table, inv, ","),
            Self::MvCombine => mv::join(table, inv, " "),
            Self::MvIndex => mv::index(table, inv),
            Self::MvCount => mv::count(table, inv),
            Self::MvDc => mv::distinct_count(table, inv),
            Self::MvFind => mv::find(table, inv),
            Self::MvZip => mv::zip(table, inv),
            Self::MvReverse => mv::reverse(table, inv),
            Self::MvDedup => mv::dedup(table, inv),
            Self::MvAppend => mv::append(table, inv),
            Self::MvFilter => mv::filter(table, inv),
            Self::FieldSummary => summary::fieldsummary(table, inv),
        }
    }
}

/// A segment bound to its directive: the keyword token, the argument
/// tokens after it and their raw text.
#[derive(Debug, Clone)]
pub struct Invocation<'s> {
    pub directive: Directive,
    pub keyword: &'s Token,
    pub args: &'s [Token],
    pub text: &'s str,
}

impl<'s> Invocation<'s> {
    /// Resolves the segment's leading keyword. An unknown keyword in
    /// `ident = expr` form runs as `eval` over the whole segment.
    pub fn resolve(segment: &'s PipelineSegment) -> Result<Self, DirectiveError> {
        let Some(keyword) = segment.keyword() else {
            return Err(DirectiveError::UnknownDirective(String::new()));
        };
        if keyword.kind == TokenKind::StringLiteral && keyword.value.starts_with('`') {
            return Ok(Self {
                directive: Directive::Macro,
                keyword,
                args: segment.args(),
                text: segment.args_text(),
            });
        }
        if keyword.kind == TokenKind::Identifier
            && let Some(directive) = Directive::from_keyword(&keyword.value)
        {
            return Ok(Self {
                directive,
                keyword,
                args: segment.args(),
                text: segment.args_text(),
            });
        }
        let implicit_eval = split_assignment(&segment.text)
            .is_some_and(|(field, expr)| is_identifier(field) && !expr.is_empty());
        if implicit_eval {
            return Ok(Self {
                directive: Directive::Eval,
                keyword,
                args: &segment.tokens,
                text: &segment.text,
            });
        }
        Err(DirectiveError::UnknownDirective(keyword.value.clone()))
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.directive.name()
    }
}
