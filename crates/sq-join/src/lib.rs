#![forbid(unsafe_code)]

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sq_columnar::{Column, ColumnError, KeyRef};
use sq_frame::{FrameError, Table};
use sq_types::Scalar;
use thiserror::Error;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinType {
    #[default]
    Inner,
    Left,
    Right,
    Outer,
}

impl JoinType {
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        match text.to_ascii_lowercase().as_str() {
            "inner" => Some(Self::Inner),
            "left" => Some(Self::Left),
            "right" => Some(Self::Right),
            "outer" | "full" => Some(Self::Outer),
            _ => None,
        }
    }

    fn keeps_left(self) -> bool {
        matches!(self, Self::Left | Self::Outer)
    }

    fn keeps_right(self) -> bool {
        matches!(self, Self::Right | Self::Outer)
    }
}

#[derive(Debug, Error)]
pub enum JoinError {
    #[error("join requires at least one key column")]
    NoKeys,
    #[error("{side} table has no key column {column:?}")]
    MissingKey { side: &'static str, column: String },
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Column(#[from] ColumnError),
}

fn key_columns<'a>(
    table: &'a Table,
    on: &[String],
    side: &'static str,
) -> Result<Vec<&'a Column>, JoinError> {
    on.iter()
        .map(|name| {
            table.column(name).ok_or_else(|| JoinError::MissingKey {
                side,
                column: name.clone(),
            })
        })
        .collect()
}

/// Row key; `None` when any key cell is missing, which never matches.
fn row_key<'a>(columns: &[&'a Column], row: usize) -> Option<Vec<KeyRef<'a>>> {
    columns
        .iter()
        .map(|column| {
            let key = KeyRef::from_scalar(&column.values()[row]);
            (!key.is_missing()).then_some(key)
        })
        .collect()
}

/// Joins on equal values of `on`. Output rows follow the left table; a
/// left row matching several right rows repeats once per match, and
/// unmatched right rows (right/outer) come last. Key columns are merged
/// into one; other colliding names get `_x` / `_y` suffixes.
pub fn join_tables(
    left: &Table,
    right: &Table,
    on: &[String],
    how: JoinType,
) -> Result<Table, JoinError> {
    if on.is_empty() {
        return Err(JoinError::NoKeys);
    }
    let left_keys = key_columns(left, on, "left")?;
    let right_keys = key_columns(right, on, "right")?;

    let mut right_map = HashMap::<Vec<KeyRef<'_>>, Vec<usize>>::new();
    for row in 0..right.row_count() {
        if let Some(key) = row_key(&right_keys, row) {
            right_map.entry(key).or_default().push(row);
        }
    }

    let mut left_positions = Vec::<Option<usize>>::new();
    let mut right_positions = Vec::<Option<usize>>::new();
    let mut right_matched = vec![false; right.row_count()];

    for left_row in 0..left.row_count() {
        let matches = row_key(&left_keys, left_row).and_then(|key| right_map.get(&key));
        match matches {
            Some(rows) => {
                for right_row in rows {
                    left_positions.push(Some(left_row));
                    right_positions.push(Some(*right_row));
                    right_matched[*right_row] = true;
                }
            }
            None if how.keeps_left() => {
                left_positions.push(Some(left_row));
                right_positions.push(None);
            }
            None => {}
        }
    }
    if how.keeps_right() {
        for (right_row, matched) in right_matched.iter().enumerate() {
            if !matched {
                left_positions.push(None);
                right_positions.push(Some(right_row));
            }
        }
    }

    let row_count = left_positions.len();
    let mut columns = Vec::with_capacity(left.width() + right.width());
    for (name, column) in left.columns() {
        if let Some(key) = on.iter().position(|k| k == name) {
            let values = left_positions
                .iter()
                .zip(&right_positions)
                .map(|(l, r)| match (l, r) {
                    (Some(l), _) => left_keys[key].values()[*l].clone(),
                    (None, Some(r)) => right_keys[key].values()[*r].clone(),
                    (None, None) => Scalar::null(),
                })
                .collect();
            columns.push((name.to_owned(), Column::from_values_lossy(values)));
            continue;
        }
        let out_name = if right.has_column(name) {
            format!("{name}_x")
        } else {
            name.to_owned()
        };
        columns.push((out_name, column.reindex_by_positions(&left_positions)?));
    }
    for (name, column) in right.columns() {
        if on.iter().any(|k| k == name) {
            continue;
        }
        let out_name = if left.has_column(name) {
            format!("{name}_y")
        } else {
            name.to_owned()
        };
        columns.push((out_name, column.reindex_by_positions(&right_positions)?));
    }
    Ok(Table::with_row_count(row_count, columns)?)
}

#[cfg(test)]
mod tests {
    use sq_frame::Table;
    use sq_types::Scalar;

    use super::{JoinError, JoinType, join_tables};

    fn text(value: &str) -> Scalar {
        Scalar::Utf8(value.to_owned())
    }

    fn on(key: &str) -> Vec<String> {
        vec![key.to_owned()]
    }

    fn left() -> Table {
        Table::from_dict(vec![
            ("k", vec![text("a"), text("b"), text("a")]),
            ("v", vec![Scalar::Int64(1), Scalar::Int64(2), Scalar::Int64(3)]),
        ])
        .expect("left")
    }

    fn right() -> Table {
        Table::from_dict(vec![
            ("k", vec![text("a"), text("c")]),
            ("v", vec![Scalar::Int64(10), Scalar::Int64(30)]),
            ("w", vec![text("x"), text("z")]),
        ])
        .expect("right")
    }

    #[test]
    fn inner_join_keeps_left_order_and_suffixes_collisions() {
        let out = join_tables(&left(), &right(), &on("k"), JoinType::Inner).expect("join");
        assert_eq!(out.column_names(), &["k", "v_x", "v_y", "w"]);
        assert_eq!(
            out.column("v_x").expect("v_x").values(),
            &[Scalar::Int64(1), Scalar::Int64(3)]
        );
        assert_eq!(
            out.column("v_y").expect("v_y").values(),
            &[Scalar::Int64(10), Scalar::Int64(10)]
        );
    }

    #[test]
    fn left_join_injects_missing_for_unmatched_rows() {
        let out = join_tables(&left(), &right(), &on("k"), JoinType::Left).expect("join");
        assert_eq!(out.row_count(), 3);
        assert!(out.value("w", 1).expect("w").is_missing());
    }

    #[test]
    fn outer_join_appends_unmatched_right_rows() {
        let out = join_tables(&left(), &right(), &on("k"), JoinType::Outer).expect("join");
        assert_eq!(
            out.column("k").expect("k").values(),
            &[text("a"), text("b"), text("a"), text("c")]
        );
        assert!(out.value("v_x", 3).expect("v_x").is_missing());

        let out = join_tables(&left(), &right(), &on("k"), JoinType::Right).expect("join");
        assert_eq!(
            out.column("k").expect("k").values(),
            &[text("a"), text("a"), text("c")]
        );
    }

    #[test]
    fn missing_keys_never_match() {
        let left = Table::from_dict(vec![("k", vec![Scalar::null()])]).expect("left");
        let right = Table::from_dict(vec![("k", vec![Scalar::null()])]).expect("right");
        let out = join_tables(&left, &right, &on("k"), JoinType::Inner).expect("join");
        assert_eq!(out.row_count(), 0);
    }

    #[test]
    fn unknown_key_is_an_error() {
        let err = join_tables(&left(), &right(), &on("w"), JoinType::Inner).expect_err("no key");
        assert!(matches!(err, JoinError::MissingKey { side: "left", .. }));
    }
}
