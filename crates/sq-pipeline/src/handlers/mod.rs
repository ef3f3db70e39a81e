//! Directive implementations. Each handler takes the working table by
//! value and returns the next one; a failed handler leaves nothing behind.

pub(crate) mod filter;
pub(crate) mod lookup;
pub(crate) mod mv;
pub(crate) mod reshape;
pub(crate) mod stats;
pub(crate) mod subsearch;
pub(crate) mod summary;
pub(crate) mod text;

use sq_columnar::Column;
use sq_frame::Table;
use sq_types::Scalar;

use crate::error::DirectiveError;

/// Replaces or appends `name`, coercing mixed values the way eval does.
pub(crate) fn put_column(
    table: &Table,
    name: &str,
    values: Vec<Scalar>,
) -> Result<Table, DirectiveError> {
    Ok(table.with_column(name, Column::from_values_lossy(values))?)
}

pub(crate) fn require<'t>(table: &'t Table, name: &str) -> Result<&'t Column, DirectiveError> {
    table
        .column(name)
        .ok_or_else(|| DirectiveError::MissingColumn(name.to_owned()))
}
