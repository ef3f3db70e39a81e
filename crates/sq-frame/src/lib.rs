#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sq_columnar::{Column, ColumnError};
use sq_types::Scalar;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("column {name:?} has length {column_len} but the table has {row_count} rows")]
    LengthMismatch {
        name: String,
        row_count: usize,
        column_len: usize,
    },
    #[error("duplicate column name {0:?}")]
    DuplicateColumn(String),
    #[error("column {0:?} does not exist")]
    MissingColumn(String),
    #[error(transparent)]
    Column(#[from] ColumnError),
}

/// One sort criterion for [`Table::sort_by`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub column: String,
    pub descending: bool,
}

impl SortKey {
    #[must_use]
    pub fn ascending(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: false,
        }
    }

    #[must_use]
    pub fn descending(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: true,
        }
    }
}

/// In-memory columnar result set passed between directives.
///
/// Column order is significant and names are unique. Every operation
/// returns a new table; nothing mutates a table another owner can see.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    row_count: usize,
    names: Vec<String>,
    columns: BTreeMap<String, Column>,
}

impl Default for Table {
    fn default() -> Self {
        Self::empty()
    }
}

impl Table {
    /// Builds a table from ordered columns. The row count is taken from the
    /// first column (zero when there are none).
    pub fn new(columns: Vec<(String, Column)>) -> Result<Self, FrameError> {
        let row_count = columns.first().map_or(0, |(_, column)| column.len());
        Self::with_row_count(row_count, columns)
    }

    pub fn with_row_count(
        row_count: usize,
        columns: Vec<(String, Column)>,
    ) -> Result<Self, FrameError> {
        let mut names = Vec::with_capacity(columns.len());
        let mut map = BTreeMap::new();
        for (name, column) in columns {
            if column.len() != row_count {
                return Err(FrameError::LengthMismatch {
                    name,
                    row_count,
                    column_len: column.len(),
                });
            }
            if map.contains_key(&name) {
                return Err(FrameError::DuplicateColumn(name));
            }
            names.push(name.clone());
            map.insert(name, column);
        }
        Ok(Self {
            row_count,
            names,
            columns: map,
        })
    }

    #[must_use]
    pub fn empty() -> Self {
        Self {
            row_count: 0,
            names: Vec::new(),
            columns: BTreeMap::new(),
        }
    }

    /// Zero-row table with the given (all-missing) columns.
    pub fn with_columns(names: &[String]) -> Result<Self, FrameError> {
        Self::with_row_count(
            0,
            names
                .iter()
                .map(|name| (name.clone(), Column::nulls(0)))
                .collect(),
        )
    }

    pub fn from_dict(pairs: Vec<(&str, Vec<Scalar>)>) -> Result<Self, FrameError> {
        let columns = pairs
            .into_iter()
            .map(|(name, values)| Ok((name.to_owned(), Column::from_values(values)?)))
            .collect::<Result<Vec<_>, FrameError>>()?;
        Self::new(columns)
    }

    #[must_use]
    pub fn row_count(&self) -> usize {
        self.row_count
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.row_count == 0
    }

    #[must_use]
    pub fn width(&self) -> usize {
        self.names.len()
    }

    #[must_use]
    pub fn column_names(&self) -> &[String] {
        &self.names
    }

    #[must_use]
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.get(name)
    }

    pub fn require_column(&self, name: &str) -> Result<&Column, FrameError> {
        self.columns
            .get(name)
            .ok_or_else(|| FrameError::MissingColumn(name.to_owned()))
    }

    /// Columns in table order.
    pub fn columns(&self) -> impl Iterator<Item = (&str, &Column)> {
        self.names
            .iter()
            .filter_map(|name| self.columns.get(name).map(|column| (name.as_str(), column)))
    }

    #[must_use]
    pub fn value(&self, name: &str, row: usize) -> Option<&Scalar> {
        self.columns.get(name).and_then(|column| column.value(row))
    }

    /// Adds `column`, or replaces an existing column of the same name in
    /// place.
    pub fn with_column(&self, name: impl Into<String>, column: Column) -> Result<Self, FrameError> {
        let name = name.into();
        if column.len() != self.row_count && !(self.names.is_empty() && self.row_count == 0) {
            return Err(FrameError::LengthMismatch {
                name,
                row_count: self.row_count,
                column_len: column.len(),
            });
        }
        let mut out = self.clone();
        if out.names.is_empty() {
            out.row_count = column.len();
        }
        if !out.columns.contains_key(&name) {
            out.names.push(name.clone());
        }
        out.columns.insert(name, column);
        Ok(out)
    }

    /// Projects `names` in the given order; repeated names are kept once.
    pub fn select(&self, names: &[String]) -> Result<Self, FrameError> {
        let mut columns = Vec::with_capacity(names.len());
        for name in names {
            if columns.iter().any(|(seen, _): &(String, Column)| seen == name) {
                continue;
            }
            columns.push((name.clone(), self.require_column(name)?.clone()));
        }
        Self::with_row_count(self.row_count, columns)
    }

    /// Drops `names`; unknown names are ignored.
    #[must_use]
    pub fn without_columns(&self, names: &[String]) -> Self {
        let mut out = self.clone();
        out.names.retain(|name| !names.contains(name));
        out.columns.retain(|name, _| !names.contains(name));
        out
    }

    /// Renames `old` to `new`. An existing column called `new` is replaced
    /// and the renamed column keeps the position of `old`.
    pub fn rename(&self, old: &str, new: &str) -> Result<Self, FrameError> {
        if old == new {
            self.require_column(old)?;
            return Ok(self.clone());
        }
        let mut out = self.clone();
        let column = out
            .columns
            .remove(old)
            .ok_or_else(|| FrameError::MissingColumn(old.to_owned()))?;
        out.names.retain(|name| name != new);
        out.columns.remove(new);
        for name in &mut out.names {
            if name == old {
                new.clone_into(name);
            }
        }
        out.columns.insert(new.to_owned(), column);
        Ok(out)
    }

    pub fn filter_rows(&self, mask: &[bool]) -> Result<Self, FrameError> {
        if mask.len() != self.row_count {
            return Err(FrameError::Column(ColumnError::LengthMismatch {
                left: self.row_count,
                right: mask.len(),
            }));
        }
        let positions = mask
            .iter()
            .enumerate()
            .filter_map(|(idx, keep)| keep.then_some(idx))
            .collect::<Vec<_>>();
        Ok(self.take_rows(&positions))
    }

    /// Gathers rows by position, in the order given.
    #[must_use]
    pub fn take_rows(&self, positions: &[usize]) -> Self {
        let columns = self
            .columns
            .iter()
            .map(|(name, column)| (name.clone(), column.take(positions)))
            .collect();
        Self {
            row_count: positions.len(),
            names: self.names.clone(),
            columns,
        }
    }

    #[must_use]
    pub fn head(&self, n: usize) -> Self {
        let positions = (0..self.row_count.min(n)).collect::<Vec<_>>();
        self.take_rows(&positions)
    }

    #[must_use]
    pub fn reverse(&self) -> Self {
        let positions = (0..self.row_count).rev().collect::<Vec<_>>();
        self.take_rows(&positions)
    }

    /// Stacks tables vertically. Output columns are the union in first-seen
    /// order; cells a table lacks are missing.
    #[must_use]
    pub fn concat(tables: &[&Self]) -> Self {
        let mut names = Vec::<String>::new();
        for table in tables {
            for name in &table.names {
                if !names.contains(name) {
                    names.push(name.clone());
                }
            }
        }

        let row_count = tables.iter().map(|table| table.row_count).sum();
        let mut columns = BTreeMap::new();
        for name in &names {
            let mut values = Vec::with_capacity(row_count);
            for table in tables {
                match table.columns.get(name) {
                    Some(column) => values.extend(column.values().iter().cloned()),
                    None => values.extend(std::iter::repeat_n(Scalar::null(), table.row_count)),
                }
            }
            columns.insert(name.clone(), Column::from_values_lossy(values));
        }

        Self {
            row_count,
            names,
            columns,
        }
    }

    /// Stable multi-key sort. Missing values sort last regardless of
    /// direction.
    pub fn sort_by(&self, keys: &[SortKey]) -> Result<Self, FrameError> {
        let key_columns = keys
            .iter()
            .map(|key| Ok((self.require_column(&key.column)?, key.descending)))
            .collect::<Result<Vec<_>, FrameError>>()?;

        let mut positions = (0..self.row_count).collect::<Vec<_>>();
        positions.sort_by(|a, b| {
            for (column, descending) in &key_columns {
                let left = &column.values()[*a];
                let right = &column.values()[*b];
                let ord = match (left.is_missing(), right.is_missing()) {
                    (true, true) => Ordering::Equal,
                    (true, false) => Ordering::Greater,
                    (false, true) => Ordering::Less,
                    (false, false) if *descending => right.total_cmp(left),
                    (false, false) => left.total_cmp(right),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });
        Ok(self.take_rows(&positions))
    }
}

#[cfg(test)]
mod tests {
    use sq_columnar::Column;
    use sq_types::{NullKind, Scalar};

    use super::{FrameError, SortKey, Table};

    fn sample() -> Table {
        Table::from_dict(vec![
            ("host", vec![
                Scalar::Utf8("b".to_owned()),
                Scalar::Utf8("a".to_owned()),
                Scalar::Utf8("b".to_owned()),
            ]),
            ("bytes", vec![
                Scalar::Int64(30),
                Scalar::Null(NullKind::Null),
                Scalar::Int64(10),
            ]),
        ])
        .expect("table")
    }

    #[test]
    fn construction_rejects_ragged_and_duplicate_columns() {
        let err = Table::new(vec![
            ("a".to_owned(), Column::nulls(2)),
            ("b".to_owned(), Column::nulls(3)),
        ])
        .expect_err("ragged");
        assert!(matches!(err, FrameError::LengthMismatch { .. }));

        let err = Table::new(vec![
            ("a".to_owned(), Column::nulls(1)),
            ("a".to_owned(), Column::nulls(1)),
        ])
        .expect_err("duplicate");
        assert!(matches!(err, FrameError::DuplicateColumn(name) if name == "a"));
    }

    #[test]
    fn column_order_is_preserved() {
        let table = sample();
        assert_eq!(table.column_names(), &["host", "bytes"]);
        let with_new = table
            .with_column("alpha", Column::nulls(3))
            .expect("append");
        assert_eq!(with_new.column_names(), &["host", "bytes", "alpha"]);
        let names = with_new.columns().map(|(name, _)| name).collect::<Vec<_>>();
        assert_eq!(names, vec!["host", "bytes", "alpha"]);
    }

    #[test]
    fn rename_keeps_position_and_replaces_target() {
        let table = sample().rename("bytes", "host").expect("rename");
        assert_eq!(table.column_names(), &["host"]);
        assert_eq!(
            table.column("host").expect("host").values()[0],
            Scalar::Int64(30)
        );

        let err = sample().rename("nope", "x").expect_err("missing");
        assert!(matches!(err, FrameError::MissingColumn(name) if name == "nope"));
    }

    #[test]
    fn sort_is_stable_and_puts_missing_last() {
        let sorted = sample()
            .sort_by(&[SortKey::descending("bytes")])
            .expect("sort");
        assert_eq!(
            sorted.column("bytes").expect("bytes").values(),
            &[
                Scalar::Int64(30),
                Scalar::Int64(10),
                Scalar::Null(NullKind::Null)
            ]
        );

        let by_host = sample().sort_by(&[SortKey::ascending("host")]).expect("sort");
        assert_eq!(
            by_host.column("bytes").expect("bytes").values(),
            &[
                Scalar::Null(NullKind::Null),
                Scalar::Int64(30),
                Scalar::Int64(10)
            ]
        );
    }

    #[test]
    fn concat_unions_columns_and_fills_missing() {
        let left = Table::from_dict(vec![("x", vec![Scalar::Int64(1)])]).expect("left");
        let right = Table::from_dict(vec![
            ("x", vec![Scalar::Int64(2)]),
            ("total", vec![Scalar::Int64(3)]),
        ])
        .expect("right");
        let out = Table::concat(&[&left, &right]);
        assert_eq!(out.row_count(), 2);
        assert_eq!(out.column_names(), &["x", "total"]);
        assert!(out.column("total").expect("total").values()[0].is_missing());
    }

    #[test]
    fn filter_head_and_reverse_share_row_positions() {
        let table = sample();
        let filtered = table.filter_rows(&[true, false, true]).expect("filter");
        assert_eq!(filtered.row_count(), 2);
        assert_eq!(table.head(1).row_count(), 1);
        assert_eq!(
            table.reverse().column("bytes").expect("bytes").values()[0],
            Scalar::Int64(10)
        );
        assert!(table.filter_rows(&[true]).is_err());
    }

    #[test]
    fn empty_named_table_has_zero_rows() {
        let table = Table::with_columns(&["colA".to_owned(), "colB".to_owned()]).expect("empty");
        assert!(table.is_empty());
        assert_eq!(table.column_names(), &["colA", "colB"]);
    }

    #[test]
    fn tables_survive_json_persistence() {
        let table = sample();
        let encoded = serde_json::to_string(&table).expect("serialize");
        let decoded: Table = serde_json::from_str(&encoded).expect("deserialize");
        assert_eq!(decoded, table);
        assert_eq!(decoded.column_names(), table.column_names());
    }
}
