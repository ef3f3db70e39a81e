#![forbid(unsafe_code)]

//! Lookup-file codecs. Every reader infers cell types from the text (ints,
//! floats, booleans, strings; empty is missing) and keeps column order as
//! it appears in the source.

use std::fs;
use std::path::Path;

use csv::{ReaderBuilder, WriterBuilder};
use serde_json::{Map, Value};
use sq_columnar::{Column, ColumnError};
use sq_frame::{FrameError, Table};
use sq_types::Scalar;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IoError {
    #[error("csv input has no headers")]
    MissingHeaders,
    #[error("unsupported lookup format {0:?}")]
    UnsupportedFormat(String),
    #[error("json input must be an array of objects or one object per line, found {0}")]
    JsonShape(String),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Utf8(#[from] std::string::FromUtf8Error),
    #[cfg(feature = "sql-sqlite")]
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Column(#[from] ColumnError),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// On-disk lookup format, chosen by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Csv,
    Tsv,
    Json,
    JsonLines,
    #[cfg(feature = "sql-sqlite")]
    Sqlite,
}

impl Format {
    pub fn from_path(path: &Path) -> Result<Self, IoError> {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match extension.as_str() {
            "csv" => Ok(Self::Csv),
            "tsv" | "tab" => Ok(Self::Tsv),
            "json" => Ok(Self::Json),
            "jsonl" | "ndjson" => Ok(Self::JsonLines),
            #[cfg(feature = "sql-sqlite")]
            "db" | "sqlite" | "sqlite3" => Ok(Self::Sqlite),
            _ => Err(IoError::UnsupportedFormat(path.display().to_string())),
        }
    }
}

// ── Delimited text ─────────────────────────────────────────────────────

pub fn read_csv_str(input: &str) -> Result<Table, IoError> {
    read_delimited_str(input, b',')
}

pub fn read_tsv_str(input: &str) -> Result<Table, IoError> {
    read_delimited_str(input, b'\t')
}

pub fn read_delimited_str(input: &str, delimiter: u8) -> Result<Table, IoError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .delimiter(delimiter)
        .flexible(true)
        .from_reader(input.as_bytes());

    let headers = reader.headers().cloned().map_err(IoError::from)?;
    if headers.is_empty() {
        return Err(IoError::MissingHeaders);
    }

    let mut columns = vec![Vec::<Scalar>::new(); headers.len()];
    for row in reader.records() {
        let record = row?;
        for (idx, values) in columns.iter_mut().enumerate() {
            values.push(Scalar::infer_from_text(record.get(idx).unwrap_or_default()));
        }
    }

    let columns = headers
        .iter()
        .zip(columns)
        .map(|(name, values)| (name.to_owned(), Column::from_values_lossy(values)))
        .collect();
    Ok(Table::new(columns)?)
}

pub fn write_csv_string(table: &Table) -> Result<String, IoError> {
    write_delimited_string(table, b',')
}

pub fn write_delimited_string(table: &Table, delimiter: u8) -> Result<String, IoError> {
    let mut writer = WriterBuilder::new()
        .delimiter(delimiter)
        .from_writer(Vec::new());

    writer.write_record(table.column_names())?;
    for row_idx in 0..table.row_count() {
        let row = table
            .columns()
            .map(|(_, column)| column.value(row_idx).map_or_else(String::new, Scalar::render))
            .collect::<Vec<_>>();
        writer.write_record(&row)?;
    }

    let bytes = writer.into_inner().map_err(|err| err.into_error())?;
    Ok(String::from_utf8(bytes)?)
}

// ── JSON ───────────────────────────────────────────────────────────────

/// Converts a JSON value to a cell: arrays become multivalue cells, nested
/// objects are kept as their JSON text.
#[must_use]
pub fn json_to_scalar(value: &Value) -> Scalar {
    match value {
        Value::Null => Scalar::null(),
        Value::Bool(v) => Scalar::Bool(*v),
        Value::Number(n) => n
            .as_i64()
            .map(Scalar::Int64)
            .or_else(|| n.as_f64().map(Scalar::Float64))
            .unwrap_or_else(Scalar::null),
        Value::String(text) => Scalar::Utf8(text.clone()),
        Value::Array(items) => Scalar::List(items.iter().map(json_to_scalar).collect()),
        Value::Object(_) => Scalar::Utf8(value.to_string()),
    }
}

#[must_use]
pub fn scalar_to_json(value: &Scalar) -> Value {
    match value {
        v if v.is_missing() => Value::Null,
        Scalar::Bool(v) => Value::Bool(*v),
        Scalar::Int64(v) => Value::from(*v),
        Scalar::Float64(v) => Value::from(*v),
        Scalar::List(items) => Value::Array(items.iter().map(scalar_to_json).collect()),
        other => Value::String(other.render()),
    }
}

fn table_from_records(records: &[Map<String, Value>]) -> Result<Table, IoError> {
    let mut names: Vec<String> = Vec::new();
    for record in records {
        for key in record.keys() {
            if !names.contains(key) {
                names.push(key.clone());
            }
        }
    }
    let columns = names
        .into_iter()
        .map(|name| {
            let values = records
                .iter()
                .map(|record| record.get(&name).map_or_else(Scalar::null, json_to_scalar))
                .collect();
            (name, Column::from_values_lossy(values))
        })
        .collect();
    Ok(Table::with_row_count(records.len(), columns)?)
}

fn expect_object(value: Value) -> Result<Map<String, Value>, IoError> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(IoError::JsonShape(json_kind(&other).to_owned())),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Reads an array of records (or a single record object).
pub fn read_json_str(input: &str) -> Result<Table, IoError> {
    let records = match serde_json::from_str::<Value>(input)? {
        Value::Array(items) => items
            .into_iter()
            .map(expect_object)
            .collect::<Result<Vec<_>, _>>()?,
        Value::Object(map) => vec![map],
        other => return Err(IoError::JsonShape(json_kind(&other).to_owned())),
    };
    table_from_records(&records)
}

/// Reads one record object per non-blank line.
pub fn read_jsonl_str(input: &str) -> Result<Table, IoError> {
    let records = input
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| expect_object(serde_json::from_str(line)?))
        .collect::<Result<Vec<_>, _>>()?;
    table_from_records(&records)
}

fn records(table: &Table) -> impl Iterator<Item = Value> + '_ {
    (0..table.row_count()).map(move |row| {
        let record = table
            .columns()
            .map(|(name, column)| {
                let value = column.value(row).map_or(Value::Null, scalar_to_json);
                (name.to_owned(), value)
            })
            .collect::<Map<_, _>>();
        Value::Object(record)
    })
}

pub fn write_json_string(table: &Table) -> Result<String, IoError> {
    Ok(serde_json::to_string(&Value::Array(records(table).collect()))?)
}

pub fn write_jsonl_string(table: &Table) -> Result<String, IoError> {
    let mut out = String::new();
    for record in records(table) {
        out.push_str(&serde_json::to_string(&record)?);
        out.push('\n');
    }
    Ok(out)
}

// ── SQLite ─────────────────────────────────────────────────────────────

/// Table name used inside SQLite lookup files.
#[cfg(feature = "sql-sqlite")]
pub const SQLITE_TABLE: &str = "lookup";

#[cfg(feature = "sql-sqlite")]
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(feature = "sql-sqlite")]
pub fn read_sqlite(path: &Path, table_name: &str) -> Result<Table, IoError> {
    use rusqlite::types::ValueRef;

    let conn = rusqlite::Connection::open(path)?;
    let mut stmt = conn.prepare(&format!("SELECT * FROM {}", quote_ident(table_name)))?;
    let names: Vec<String> = stmt.column_names().iter().map(|n| (*n).to_owned()).collect();
    let mut columns = vec![Vec::<Scalar>::new(); names.len()];
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        for (idx, values) in columns.iter_mut().enumerate() {
            let value = match row.get_ref(idx)? {
                ValueRef::Null => Scalar::null(),
                ValueRef::Integer(v) => Scalar::Int64(v),
                ValueRef::Real(v) => Scalar::Float64(v),
                ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
                    Scalar::Utf8(String::from_utf8_lossy(bytes).into_owned())
                }
            };
            values.push(value);
        }
    }
    let columns = names
        .into_iter()
        .zip(columns)
        .map(|(name, values)| (name, Column::from_values_lossy(values)))
        .collect();
    Ok(Table::new(columns)?)
}

/// Replaces `table_name` in the database at `path` with `table`.
#[cfg(feature = "sql-sqlite")]
pub fn write_sqlite(path: &Path, table_name: &str, table: &Table) -> Result<(), IoError> {
    use rusqlite::types::Value as SqlValue;
    use sq_types::DType;

    let mut conn = rusqlite::Connection::open(path)?;
    let tx = conn.transaction()?;
    let target = quote_ident(table_name);
    tx.execute(&format!("DROP TABLE IF EXISTS {target}"), [])?;
    let definitions = table
        .columns()
        .map(|(name, column)| {
            let affinity = match column.dtype() {
                DType::Bool | DType::Int64 => "INTEGER",
                DType::Float64 => "REAL",
                _ => "TEXT",
            };
            format!("{} {affinity}", quote_ident(name))
        })
        .collect::<Vec<_>>();
    tx.execute(&format!("CREATE TABLE {target} ({})", definitions.join(", ")), [])?;

    if table.width() > 0 {
        let placeholders = vec!["?"; table.width()].join(", ");
        let mut stmt = tx.prepare(&format!("INSERT INTO {target} VALUES ({placeholders})"))?;
        for row in 0..table.row_count() {
            let params = table.columns().map(|(_, column)| match column.value(row) {
                Some(v) if v.is_missing() => SqlValue::Null,
                Some(Scalar::Bool(v)) => SqlValue::Integer(i64::from(*v)),
                Some(Scalar::Int64(v)) => SqlValue::Integer(*v),
                Some(Scalar::Float64(v)) => SqlValue::Real(*v),
                Some(other) => SqlValue::Text(other.render()),
                None => SqlValue::Null,
            });
            stmt.execute(rusqlite::params_from_iter(params))?;
        }
    }
    tx.commit()?;
    Ok(())
}

// ── Files ──────────────────────────────────────────────────────────────

pub fn read_path(path: &Path) -> Result<Table, IoError> {
    match Format::from_path(path)? {
        Format::Csv => read_csv_str(&fs::read_to_string(path)?),
        Format::Tsv => read_tsv_str(&fs::read_to_string(path)?),
        Format::Json => read_json_str(&fs::read_to_string(path)?),
        Format::JsonLines => read_jsonl_str(&fs::read_to_string(path)?),
        #[cfg(feature = "sql-sqlite")]
        Format::Sqlite => read_sqlite(path, SQLITE_TABLE),
    }
}

pub fn write_path(path: &Path, table: &Table) -> Result<(), IoError> {
    let text = match Format::from_path(path)? {
        Format::Csv => write_csv_string(table)?,
        Format::Tsv => write_delimited_string(table, b'\t')?,
        Format::Json => write_json_string(table)?,
        Format::JsonLines => write_jsonl_string(table)?,
        #[cfg(feature = "sql-sqlite")]
        Format::Sqlite => return write_sqlite(path, SQLITE_TABLE, table),
    };
    fs::write(path, text)?;
    Ok(())
}
