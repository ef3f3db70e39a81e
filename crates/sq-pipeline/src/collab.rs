//! Collaborators the engine consumes: the accelerator that produces the
//! initial table, the lookup store, result persistence and the macro
//! registry. Implementations must be reentrant; the engine calls them from
//! whatever thread runs the query.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use sq_filter::{CompiledFilter, FilterError};
use sq_frame::{FrameError, Table};
use sq_io::IoError;
use sq_lexer::{Token, TokenKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("unknown index {0:?}")]
    UnknownIndex(String),
    #[error("index clause {0:?} does not select an index")]
    NoIndex(String),
    #[error("lookup {0:?} not found")]
    LookupNotFound(String),
    #[error("invalid lookup name {0:?}")]
    InvalidName(String),
    #[error("{0}")]
    Backend(String),
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error(transparent)]
    Io(#[from] IoError),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Resolves the index clause to the initial table.
pub trait Accelerator: Send + Sync {
    fn select_rows(&self, index_tokens: &[Token]) -> Result<Table, CollaboratorError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveOptions {
    /// Append to an existing lookup instead of replacing it.
    pub append: bool,
    /// Write even when the table has no rows.
    pub override_if_empty: bool,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            append: false,
            override_if_empty: true,
        }
    }
}

pub trait LookupStore: Send + Sync {
    fn load(&self, name: &str) -> Result<Table, CollaboratorError>;
    fn save(&self, name: &str, table: &Table, options: SaveOptions)
    -> Result<(), CollaboratorError>;
}

/// Best-effort sink for finished results. Errors are logged, never raised.
pub trait Persistence: Send + Sync {
    fn save(&self, request_id: &str, table: &Table, query_text: &str)
    -> Result<(), CollaboratorError>;
}

pub trait MacroRegistry: Send + Sync {
    /// Pipeline text for `name` with `$key$` placeholders substituted, or
    /// `None` for an unknown macro.
    fn expand(&self, name: &str, args: &[(String, String)]) -> Option<String>;
}

// ── In-memory accelerator ───────────────────────────────────────────────

/// Named in-memory tables. `index=<name>` selects a table; the rest of the
/// index clause filters it like `search`.
#[derive(Debug, Clone, Default)]
pub struct TableAccelerator {
    indexes: HashMap<String, Table>,
}

impl TableAccelerator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_index(mut self, name: impl Into<String>, table: Table) -> Self {
        self.indexes.insert(name.into(), table);
        self
    }
}

impl Accelerator for TableAccelerator {
    fn select_rows(&self, index_tokens: &[Token]) -> Result<Table, CollaboratorError> {
        let tokens = match index_tokens.first() {
            Some(first) if first.is_keyword("search") => &index_tokens[1..],
            _ => index_tokens,
        };
        let clause = tokens
            .iter()
            .map(|token| token.value.as_str())
            .collect::<Vec<_>>()
            .join(" ");

        let mut index = None;
        let mut rest = Vec::with_capacity(tokens.len());
        let mut pos = 0;
        while pos < tokens.len() {
            let token = &tokens[pos];
            if index.is_none()
                && token.is_keyword("index")
                && tokens.get(pos + 1).is_some_and(|t| t.is_operator("="))
                && let Some(value) = tokens.get(pos + 2)
            {
                index = Some(value.unquoted());
                pos += 3;
                continue;
            }
            rest.push(token.clone());
            pos += 1;
        }

        let name = index.ok_or_else(|| CollaboratorError::NoIndex(clause.clone()))?;
        let table = self
            .indexes
            .get(&name)
            .ok_or(CollaboratorError::UnknownIndex(name))?;
        let filter = CompiledFilter::from_tokens(&rest, &clause)?;
        Ok(filter.apply(table)?)
    }
}

// ── Lookup stores ───────────────────────────────────────────────────────

/// Lookup files under one root directory; the extension picks the format.
#[derive(Debug, Clone)]
pub struct FileLookupStore {
    root: PathBuf,
}

impl FileLookupStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, name: &str) -> Result<PathBuf, CollaboratorError> {
        let relative = Path::new(name);
        let escapes = relative
            .components()
            .any(|part| !matches!(part, Component::Normal(_)));
        if name.is_empty() || escapes {
            return Err(CollaboratorError::InvalidName(name.to_owned()));
        }
        Ok(self.root.join(relative))
    }
}

impl LookupStore for FileLookupStore {
    fn load(&self, name: &str) -> Result<Table, CollaboratorError> {
        let path = self.resolve(name)?;
        if !path.is_file() {
            return Err(CollaboratorError::LookupNotFound(name.to_owned()));
        }
        Ok(sq_io::read_path(&path)?)
    }

    fn save(
        &self,
        name: &str,
        table: &Table,
        options: SaveOptions,
    ) -> Result<(), CollaboratorError> {
        let path = self.resolve(name)?;
        if table.is_empty() && !options.override_if_empty && path.is_file() {
            return Ok(());
        }
        if options.append && path.is_file() {
            let existing = sq_io::read_path(&path)?;
            return Ok(sq_io::write_path(&path, &Table::concat(&[&existing, table]))?);
        }
        Ok(sq_io::write_path(&path, table)?)
    }
}

#[derive(Debug, Default)]
pub struct MemoryLookupStore {
    tables: Mutex<HashMap<String, Table>>,
}

impl MemoryLookupStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_table(self, name: impl Into<String>, table: Table) -> Self {
        if let Ok(mut tables) = self.tables.lock() {
            tables.insert(name.into(), table);
        }
        self
    }

    fn tables(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Table>>, CollaboratorError> {
        self.tables
            .lock()
            .map_err(|_| CollaboratorError::Backend("lookup store lock poisoned".to_owned()))
    }
}

impl LookupStore for MemoryLookupStore {
    fn load(&self, name: &str) -> Result<Table, CollaboratorError> {
        self.tables()?
            .get(name)
            .cloned()
            .ok_or_else(|| CollaboratorError::LookupNotFound(name.to_owned()))
    }

    fn save(
        &self,
        name: &str,
        table: &Table,
        options: SaveOptions,
    ) -> Result<(), CollaboratorError> {
        let mut tables = self.tables()?;
        if table.is_empty() && !options.override_if_empty && tables.contains_key(name) {
            return Ok(());
        }
        let stored = match tables.get(name) {
            Some(existing) if options.append => Table::concat(&[existing, table]),
            _ => table.clone(),
        };
        tables.insert(name.to_owned(), stored);
        Ok(())
    }
}

// ── Persistence and macros ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPersistence;

impl Persistence for NoopPersistence {
    fn save(&self, _: &str, _: &Table, _: &str) -> Result<(), CollaboratorError> {
        Ok(())
    }
}

/// Fixed macro templates keyed by name.
#[derive(Debug, Clone, Default)]
pub struct StaticMacroRegistry {
    macros: HashMap<String, String>,
}

impl StaticMacroRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_macro(mut self, name: impl Into<String>, template: impl Into<String>) -> Self {
        self.macros.insert(name.into(), template.into());
        self
    }
}

impl MacroRegistry for StaticMacroRegistry {
    fn expand(&self, name: &str, args: &[(String, String)]) -> Option<String> {
        let template = self.macros.get(name)?;
        Some(args.iter().fold(template.clone(), |text, (key, value)| {
            text.replace(&format!("${key}$"), value)
        }))
    }
}

/// Reads `name(k=v, ...)` / `name` out of a backtick macro token.
pub(crate) fn parse_macro_call(token: &Token) -> Option<(String, Vec<(String, String)>)> {
    if token.kind != TokenKind::StringLiteral || !token.value.starts_with('`') {
        return None;
    }
    let inner = token.unquoted();
    let inner = inner.trim();
    let Some(open) = inner.find('(') else {
        return Some((inner.to_owned(), Vec::new()));
    };
    let name = inner[..open].trim().to_owned();
    let body = inner[open + 1..].strip_suffix(')')?;
    let args = sq_lexer::split_arguments(body)
        .ok()?
        .iter()
        .filter_map(|piece| {
            let (key, value) = sq_lexer::split_assignment(piece)?;
            Some((key.to_owned(), sq_lexer::unquote(value)))
        })
        .collect();
    Some((name, args))
}

#[cfg(test)]
mod tests {
    use sq_frame::Table;
    use sq_lexer::lex_segment;
    use sq_types::Scalar;

    use super::{
        Accelerator, CollaboratorError, FileLookupStore, LookupStore, MacroRegistry,
        MemoryLookupStore, SaveOptions, StaticMacroRegistry, TableAccelerator, parse_macro_call,
    };

    fn hosts() -> Table {
        Table::from_dict(vec![
            ("host", vec![Scalar::Utf8("web".to_owned()), Scalar::Utf8("db".to_owned())]),
            ("status", vec![Scalar::Int64(200), Scalar::Int64(500)]),
        ])
        .expect("hosts")
    }

    #[test]
    fn accelerator_selects_index_and_filters_the_rest() {
        let accelerator = TableAccelerator::new().with_index("main", hosts());
        let tokens = lex_segment("search index=main status=500").expect("lex");
        let table = accelerator.select_rows(&tokens).expect("select");
        assert_eq!(table.row_count(), 1);
        assert_eq!(table.value("host", 0), Some(&Scalar::Utf8("db".to_owned())));

        let tokens = lex_segment("index=nope").expect("lex");
        assert!(matches!(
            accelerator.select_rows(&tokens),
            Err(CollaboratorError::UnknownIndex(_))
        ));
    }

    #[test]
    fn file_store_rejects_escaping_names() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileLookupStore::new(dir.path());
        assert!(matches!(
            store.load("../etc/passwd.csv"),
            Err(CollaboratorError::InvalidName(_))
        ));
        assert!(matches!(
            store.load("absent.csv"),
            Err(CollaboratorError::LookupNotFound(_))
        ));
    }

    #[test]
    fn file_store_appends_and_keeps_non_empty_lookups() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileLookupStore::new(dir.path());
        store.save("hosts.csv", &hosts(), SaveOptions::default()).expect("save");
        let append = SaveOptions {
            append: true,
            ..SaveOptions::default()
        };
        store.save("hosts.csv", &hosts(), append).expect("append");
        assert_eq!(store.load("hosts.csv").expect("load").row_count(), 4);

        let keep = SaveOptions {
            override_if_empty: false,
            ..SaveOptions::default()
        };
        store.save("hosts.csv", &Table::empty(), keep).expect("skip");
        assert_eq!(store.load("hosts.csv").expect("load").row_count(), 4);
    }

    #[test]
    fn memory_store_round_trips() {
        let store = MemoryLookupStore::new().with_table("hosts", hosts());
        assert_eq!(store.load("hosts").expect("load"), hosts());
        assert!(store.load("other").is_err());
    }

    #[test]
    fn macros_substitute_placeholders() {
        let registry = StaticMacroRegistry::new().with_macro("errors", "search status>=$min$");
        let token = &lex_segment("`errors(min=500)`").expect("lex")[0];
        let (name, args) = parse_macro_call(token).expect("macro call");
        assert_eq!(name, "errors");
        assert_eq!(
            registry.expand(&name, &args).as_deref(),
            Some("search status>=500")
        );
        assert_eq!(registry.expand("missing", &[]), None);
    }
}
