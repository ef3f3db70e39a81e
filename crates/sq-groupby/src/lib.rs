#![forbid(unsafe_code)]

//! Aggregation engine behind `stats`, `eventstats`, `streamstats` and
//! `timechart`.
//!
//! All three modes share one clause grammar:
//!
//! ```text
//! clause := spec ( ","? spec )* ( "by" field ( ","? field )* )?
//! spec   := func ( "(" field? ")" )? ( "as" alias )?
//! ```

pub mod reduce;
pub mod span;

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use sq_columnar::{Column, ColumnError, KeyRef};
use sq_frame::{FrameError, Table};
use sq_lexer::{LexError, Token, TokenKind, lex_segment};
use sq_types::{Scalar, TypeError};
use thiserror::Error;

pub use span::{Span, bin_numeric_column, bin_time_column, time_value};

use reduce::Number;

/// Column that `timechart` buckets on.
pub const TIME_FIELD: &str = "_time";

#[derive(Debug, Error)]
pub enum StatsError {
    #[error("unknown aggregation function {0:?}")]
    UnknownFunction(String),
    #[error("invalid aggregation clause {clause:?}: {message}")]
    InvalidSpec { clause: String, message: String },
    #[error("duplicate alias {0:?} in one aggregation call")]
    DuplicateAlias(String),
    #[error("{0}() requires a field")]
    FieldRequired(String),
    #[error("column {0:?} does not exist")]
    MissingColumn(String),
    #[error("aggregation clause names no functions")]
    NoFunctions,
    #[error("invalid span {0:?}")]
    InvalidSpan(String),
    #[error("value {value:?} in column {column:?} is not a time")]
    InvalidTime { column: String, value: String },
    #[error(transparent)]
    Type(#[from] TypeError),
    #[error(transparent)]
    Lex(#[from] LexError),
    #[error(transparent)]
    Column(#[from] ColumnError),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggFunc {
    Count,
    Sum,
    Mean,
    Min,
    Max,
    Median,
    Mode,
    DCount,
    Values,
    First,
    Last,
    Range,
}

impl AggFunc {
    /// Resolves a function name case-insensitively, aliases included.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        let func = match name.to_ascii_lowercase().as_str() {
            "count" => Self::Count,
            "sum" => Self::Sum,
            "avg" | "mean" => Self::Mean,
            "min" => Self::Min,
            "max" => Self::Max,
            "median" => Self::Median,
            "mode" => Self::Mode,
            "dc" | "dcount" | "distinct_count" | "distinctcount" => Self::DCount,
            "values" => Self::Values,
            "earliest" | "first" => Self::First,
            "latest" | "last" => Self::Last,
            "range" => Self::Range,
            _ => return None,
        };
        Some(func)
    }

    /// Reduces one group's cells.
    pub fn reduce(self, values: &[&Scalar]) -> Result<Scalar, TypeError> {
        match self {
            Self::Count => Ok(reduce::count(values)),
            Self::Sum => reduce::sum(values),
            Self::Mean => reduce::mean(values),
            Self::Min => Ok(reduce::min(values)),
            Self::Max => Ok(reduce::max(values)),
            Self::Median => reduce::median(values),
            Self::Mode => Ok(reduce::mode(values)),
            Self::DCount => Ok(reduce::dcount(values)),
            Self::Values => Ok(reduce::distinct_values(values)),
            Self::First => Ok(reduce::first(values)),
            Self::Last => Ok(reduce::last(values)),
            Self::Range => reduce::range(values),
        }
    }
}

/// One parsed `func(field) as alias` term.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggSpec {
    pub func: AggFunc,
    /// Function name as written, lowercased; used for default aliases.
    pub label: String,
    pub field: Option<String>,
    pub alias: Option<String>,
}

impl AggSpec {
    /// `alias`, else `label(field)`, else `label`.
    #[must_use]
    pub fn output_name(&self) -> String {
        match (&self.alias, &self.field) {
            (Some(alias), _) => alias.clone(),
            (None, Some(field)) => format!("{}({field})", self.label),
            (None, None) => self.label.clone(),
        }
    }
}

/// A spec after wildcard expansion, bound to a concrete output column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSpec {
    pub func: AggFunc,
    pub field: Option<String>,
    pub output: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsClause {
    pub specs: Vec<AggSpec>,
    pub by: Vec<String>,
}

impl StatsClause {
    pub fn parse(text: &str) -> Result<Self, StatsError> {
        let tokens = lex_segment(text)?;
        Self::from_tokens(&tokens, text)
    }

    pub fn from_tokens(tokens: &[Token], clause: &str) -> Result<Self, StatsError> {
        let invalid = |message: String| StatsError::InvalidSpec {
            clause: clause.to_owned(),
            message,
        };
        let split = tokens.iter().position(|token| token.is_keyword("by"));
        let (spec_tokens, by_tokens) = match split {
            Some(pos) => (&tokens[..pos], Some(&tokens[pos + 1..])),
            None => (tokens, None),
        };

        let mut specs = Vec::new();
        let mut pos = 0;
        while pos < spec_tokens.len() {
            let token = &spec_tokens[pos];
            if token.is_punct(",") {
                pos += 1;
                continue;
            }
            if token.kind != TokenKind::Identifier {
                return Err(invalid(format!("unexpected {:?}", token.value)));
            }
            let label = token.value.to_ascii_lowercase();
            let func = AggFunc::from_name(&label)
                .ok_or_else(|| StatsError::UnknownFunction(token.value.clone()))?;
            pos += 1;

            let mut field = None;
            if spec_tokens.get(pos).is_some_and(|t| t.is_punct("(")) {
                pos += 1;
                match spec_tokens.get(pos) {
                    Some(t) if t.is_punct(")") => {}
                    Some(t) if is_name_token(t) => {
                        field = Some(t.unquoted());
                        pos += 1;
                    }
                    other => {
                        return Err(invalid(format!(
                            "expected a field inside {label}(...), found {:?}",
                            other.map(|t| t.value.as_str())
                        )));
                    }
                }
                if !spec_tokens.get(pos).is_some_and(|t| t.is_punct(")")) {
                    return Err(invalid(format!("unclosed {label}(")));
                }
                pos += 1;
            }

            let mut alias = None;
            if spec_tokens.get(pos).is_some_and(|t| t.is_keyword("as")) {
                match spec_tokens.get(pos + 1) {
                    Some(t) if is_name_token(t) => alias = Some(t.unquoted()),
                    _ => return Err(invalid(format!("missing alias after {label} as"))),
                }
                pos += 2;
            }

            specs.push(AggSpec {
                func,
                label,
                field,
                alias,
            });
        }
        if specs.is_empty() {
            return Err(StatsError::NoFunctions);
        }

        let mut by = Vec::new();
        if let Some(by_tokens) = by_tokens {
            for token in by_tokens {
                if token.is_punct(",") {
                    continue;
                }
                if !is_name_token(token) {
                    return Err(invalid(format!("unexpected {:?} in by clause", token.value)));
                }
                by.push(token.unquoted());
            }
            if by.is_empty() {
                return Err(invalid("by requires at least one field".to_owned()));
            }
        }
        Ok(Self { specs, by })
    }

    /// Expands `*` fields against `table`, checks fields exist and rejects
    /// duplicate output names.
    pub fn resolve(&self, table: &Table) -> Result<Vec<ResolvedSpec>, StatsError> {
        for field in &self.by {
            if !table.has_column(field) {
                return Err(StatsError::MissingColumn(field.clone()));
            }
        }
        let mut resolved = Vec::new();
        for spec in &self.specs {
            match spec.field.as_deref() {
                Some("*") => {
                    for name in table.column_names() {
                        if self.by.contains(name) {
                            continue;
                        }
                        let output = match spec.alias.as_deref() {
                            Some("*") => name.clone(),
                            Some(alias) => alias.to_owned(),
                            None => format!("{}({name})", spec.label),
                        };
                        resolved.push(ResolvedSpec {
                            func: spec.func,
                            field: Some(name.clone()),
                            output,
                        });
                    }
                }
                Some(field) => {
                    if !table.has_column(field) {
                        return Err(StatsError::MissingColumn(field.to_owned()));
                    }
                    let output = if spec.alias.as_deref() == Some("*") {
                        field.to_owned()
                    } else {
                        spec.output_name()
                    };
                    resolved.push(ResolvedSpec {
                        func: spec.func,
                        field: Some(field.to_owned()),
                        output,
                    });
                }
                None if spec.func == AggFunc::Count => resolved.push(ResolvedSpec {
                    func: spec.func,
                    field: None,
                    output: spec.output_name(),
                }),
                None => return Err(StatsError::FieldRequired(spec.label.clone())),
            }
        }
        let mut seen = HashSet::new();
        for spec in &resolved {
            if !seen.insert(spec.output.as_str()) {
                return Err(StatsError::DuplicateAlias(spec.output.clone()));
            }
        }
        Ok(resolved)
    }
}

fn is_name_token(token: &Token) -> bool {
    matches!(
        token.kind,
        TokenKind::Identifier | TokenKind::StringLiteral | TokenKind::NumberLiteral
    )
}

// ── Grouping ───────────────────────────────────────────────────────────

struct Grouping {
    /// Key cells per group, in first-seen order.
    keys: Vec<Vec<Scalar>>,
    /// Row positions per group, ascending.
    members: Vec<Vec<usize>>,
    /// Group of every row; `None` when a key cell is missing.
    row_group: Vec<Option<usize>>,
}

fn group_rows(table: &Table, by: &[String]) -> Result<Grouping, StatsError> {
    let row_count = table.row_count();
    if by.is_empty() {
        return Ok(Grouping {
            keys: vec![Vec::new()],
            members: vec![(0..row_count).collect()],
            row_group: vec![Some(0); row_count],
        });
    }
    let columns = by
        .iter()
        .map(|name| table.require_column(name))
        .collect::<Result<Vec<_>, _>>()?;

    let mut slots = HashMap::<Vec<KeyRef<'_>>, usize>::new();
    let mut keys = Vec::new();
    let mut members: Vec<Vec<usize>> = Vec::new();
    let mut row_group = Vec::with_capacity(row_count);
    for row in 0..row_count {
        let cells: Vec<&Scalar> = columns.iter().map(|c| &c.values()[row]).collect();
        if cells.iter().any(|cell| cell.is_missing()) {
            row_group.push(None);
            continue;
        }
        let key: Vec<KeyRef<'_>> = cells.iter().map(|cell| KeyRef::from_scalar(*cell)).collect();
        let next = keys.len();
        let slot = *slots.entry(key).or_insert_with(|| {
            keys.push(cells.iter().map(|cell| (*cell).clone()).collect());
            members.push(Vec::new());
            next
        });
        members[slot].push(row);
        row_group.push(Some(slot));
    }
    Ok(Grouping {
        keys,
        members,
        row_group,
    })
}

fn compare_keys(left: &[Scalar], right: &[Scalar]) -> Ordering {
    left.iter()
        .zip(right)
        .map(|(l, r)| l.total_cmp(r))
        .find(|ordering| ordering.is_ne())
        .unwrap_or(Ordering::Equal)
}

fn aggregate(spec: &ResolvedSpec, table: &Table, rows: &[usize]) -> Result<Scalar, StatsError> {
    let Some(field) = &spec.field else {
        return Ok(Scalar::Int64(rows.len() as i64));
    };
    let column = table.require_column(field)?;
    let cells: Vec<&Scalar> = rows.iter().map(|row| &column.values()[*row]).collect();
    Ok(spec.func.reduce(&cells)?)
}

// ── Modes ──────────────────────────────────────────────────────────────

/// One row per group: group columns first, then one column per spec.
/// Groups are ordered ascending by key; rows with a missing key are
/// dropped. Without `by` the result is exactly one row.
pub fn stats(table: &Table, clause: &StatsClause) -> Result<Table, StatsError> {
    let specs = clause.resolve(table)?;
    let grouping = group_rows(table, &clause.by)?;
    let mut order: Vec<usize> = (0..grouping.keys.len()).collect();
    order.sort_by(|a, b| compare_keys(&grouping.keys[*a], &grouping.keys[*b]));

    let mut columns = Vec::with_capacity(clause.by.len() + specs.len());
    for (i, name) in clause.by.iter().enumerate() {
        let values = order
            .iter()
            .map(|group| grouping.keys[*group][i].clone())
            .collect();
        columns.push((name.clone(), Column::from_values_lossy(values)));
    }
    for spec in &specs {
        let values = order
            .iter()
            .map(|group| aggregate(spec, table, &grouping.members[*group]))
            .collect::<Result<Vec<_>, _>>()?;
        columns.push((spec.output.clone(), Column::from_values_lossy(values)));
    }

    #[cfg(feature = "tracing")]
    tracing::debug!(groups = order.len(), specs = specs.len(), "stats");

    Ok(Table::with_row_count(order.len(), columns)?)
}

/// Per-group aggregates broadcast back onto every row of the group. Rows
/// with a missing group key receive missing in every aggregate column.
pub fn eventstats(table: &Table, clause: &StatsClause) -> Result<Table, StatsError> {
    let specs = clause.resolve(table)?;
    let grouping = group_rows(table, &clause.by)?;
    let mut out = table.clone();
    for spec in &specs {
        let per_group = grouping
            .members
            .iter()
            .map(|rows| aggregate(spec, table, rows))
            .collect::<Result<Vec<_>, _>>()?;
        let values = grouping
            .row_group
            .iter()
            .map(|group| group.map_or_else(Scalar::null, |g| per_group[g].clone()))
            .collect();
        out = out.with_column(spec.output.clone(), Column::from_values_lossy(values))?;
    }

    #[cfg(feature = "tracing")]
    tracing::debug!(groups = grouping.keys.len(), rows = out.row_count(), "eventstats");

    Ok(out)
}

/// Running aggregates in row order, partitioned by group.
pub fn streamstats(table: &Table, clause: &StatsClause) -> Result<Table, StatsError> {
    let specs = clause.resolve(table)?;
    let grouping = group_rows(table, &clause.by)?;
    let mut out = table.clone();
    for spec in &specs {
        let column = spec
            .field
            .as_deref()
            .map(|field| table.require_column(field))
            .transpose()?;
        let mut states: Vec<Running<'_>> =
            (0..grouping.keys.len()).map(|_| Running::default()).collect();
        let mut values = Vec::with_capacity(table.row_count());
        for (row, group) in grouping.row_group.iter().enumerate() {
            let Some(group) = group else {
                values.push(Scalar::null());
                continue;
            };
            let state = &mut states[*group];
            state.rows += 1;
            match column {
                None => values.push(Scalar::Int64(state.rows)),
                Some(column) => {
                    state.push(&column.values()[row], spec.func)?;
                    values.push(state.emit(spec.func)?);
                }
            }
        }
        out = out.with_column(spec.output.clone(), Column::from_values_lossy(values))?;
    }
    Ok(out)
}

/// Accumulator for one group of one streamstats spec.
#[derive(Default)]
struct Running<'a> {
    rows: i64,
    count: i64,
    sum: Option<Number>,
    bounds: Option<(Number, Number)>,
    extreme: Option<&'a Scalar>,
    first: Option<&'a Scalar>,
    last: Option<&'a Scalar>,
    seen: Vec<&'a Scalar>,
    distinct: HashSet<KeyRef<'a>>,
    unique: Vec<Scalar>,
}

impl<'a> Running<'a> {
    fn push(&mut self, value: &'a Scalar, func: AggFunc) -> Result<(), TypeError> {
        // earliest holds the group's first row and latest the current row,
        // missing or not.
        match func {
            AggFunc::First => {
                if self.first.is_none() {
                    self.first = Some(value);
                }
                return Ok(());
            }
            AggFunc::Last => {
                self.last = Some(value);
                return Ok(());
            }
            _ => {}
        }
        if value.is_missing() {
            return Ok(());
        }
        self.count += 1;
        match func {
            AggFunc::Count => {}
            AggFunc::Sum | AggFunc::Mean => {
                let n = Number::from_scalar(value)?;
                self.sum = Some(self.sum.map_or(n, |sum| sum.add(n)));
            }
            AggFunc::Range => {
                let n = Number::from_scalar(value)?;
                self.bounds = Some(match self.bounds {
                    None => (n, n),
                    Some((lo, hi)) => (
                        if n.as_f64() < lo.as_f64() { n } else { lo },
                        if n.as_f64() > hi.as_f64() { n } else { hi },
                    ),
                });
            }
            AggFunc::Min | AggFunc::Max => {
                let wanted = if func == AggFunc::Min {
                    Ordering::Less
                } else {
                    Ordering::Greater
                };
                if self.extreme.is_none_or(|best| value.total_cmp(best) == wanted) {
                    self.extreme = Some(value);
                }
            }
            AggFunc::Median => {
                Number::from_scalar(value)?;
                self.seen.push(value);
            }
            AggFunc::Mode => self.seen.push(value),
            AggFunc::DCount => {
                self.distinct.insert(KeyRef::from_scalar(value));
            }
            AggFunc::Values => {
                if self.distinct.insert(KeyRef::from_scalar(value)) {
                    self.unique.push(value.clone());
                }
            }
            AggFunc::First | AggFunc::Last => {}
        }
        Ok(())
    }

    fn emit(&self, func: AggFunc) -> Result<Scalar, TypeError> {
        let cloned = |cell: Option<&Scalar>| cell.cloned().unwrap_or_else(Scalar::null);
        Ok(match func {
            AggFunc::Count => Scalar::Int64(self.count),
            AggFunc::Sum => self.sum.map_or_else(Scalar::null, Number::into_scalar),
            AggFunc::Mean => self.sum.map_or_else(Scalar::null, |sum| {
                Scalar::Float64(sum.as_f64() / self.count as f64)
            }),
            AggFunc::Range => self
                .bounds
                .map_or_else(Scalar::null, |(lo, hi)| hi.sub(lo).into_scalar()),
            AggFunc::Min | AggFunc::Max => cloned(self.extreme),
            AggFunc::Median => reduce::median(&self.seen)?,
            AggFunc::Mode => reduce::mode(&self.seen),
            AggFunc::DCount => Scalar::Int64(self.distinct.len() as i64),
            AggFunc::Values if self.unique.is_empty() => Scalar::null(),
            AggFunc::Values => Scalar::List(self.unique.clone()),
            AggFunc::First => cloned(self.first),
            AggFunc::Last => cloned(self.last),
        })
    }
}

// ── Timechart ──────────────────────────────────────────────────────────

/// Buckets `_time` to the clause's `span=` (or `default_span`) and runs
/// `stats` with the bucket appended to the grouping.
pub fn timechart(table: &Table, text: &str, default_span: Span) -> Result<Table, StatsError> {
    let tokens = lex_segment(text)?;
    let mut span = default_span;
    let mut rest = Vec::with_capacity(tokens.len());
    let mut pos = 0;
    while pos < tokens.len() {
        let token = &tokens[pos];
        if token.is_keyword("span") && tokens.get(pos + 1).is_some_and(|t| t.is_operator("=")) {
            let value = tokens
                .get(pos + 2)
                .ok_or_else(|| StatsError::InvalidSpan(String::new()))?;
            span = Span::parse(&value.unquoted())?;
            pos += 3;
            continue;
        }
        rest.push(token.clone());
        pos += 1;
    }

    let mut clause = StatsClause::from_tokens(&rest, text)?;
    clause.by.retain(|field| field != TIME_FIELD);
    clause.by.push(TIME_FIELD.to_owned());

    let time = table
        .column(TIME_FIELD)
        .ok_or_else(|| StatsError::MissingColumn(TIME_FIELD.to_owned()))?;
    let binned = table.with_column(TIME_FIELD, bin_time_column(TIME_FIELD, time, span)?)?;
    stats(&binned, &clause)
}
