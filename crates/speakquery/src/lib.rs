#![forbid(unsafe_code)]

//! Speak query engine.
//!
//! Re-exports the workspace crates under one roof. Most hosts need only
//! [`Engine`], a [`RuntimePolicy`] and the collaborator implementations:
//!
//! ```text
//! let engine = Engine::new(policy)
//!     .with_accelerator(TableAccelerator::new().with_index("web", events))
//!     .with_lookup_store(FileLookupStore::new("/srv/lookups"));
//! let table = engine.execute("index=web status>=500 | stats count by host")?;
//! ```

pub use sq_columnar::{Column, ColumnError};
pub use sq_expr::{EvalOptions, ExprError};
pub use sq_filter::{CompiledFilter, FilterError};
pub use sq_frame::{FrameError, SortKey, Table};
pub use sq_groupby::{AggFunc, Span, StatsClause, StatsError};
pub use sq_io::{Format, IoError};
pub use sq_join::{JoinError, JoinType};
pub use sq_lexer::{LexError, PipelineSegment, SplitQuery, Token, TokenKind, split_query};
pub use sq_pipeline::{
    Accelerator, CollaboratorError, DIRECTIVES, Directive, DirectiveError, DirectiveRecord,
    Engine, EngineError, ErrorKind, ExecutionLedger, FileLookupStore, LookupStore,
    MacroRegistry, MemoryLookupStore, NoopPersistence, Persistence, RuntimePolicy, SaveOptions,
    StaticMacroRegistry, TableAccelerator,
};
pub use sq_types::{DType, NullKind, Scalar, TypeError};

/// Per-concern crates, for callers that need more than the re-exports.
pub mod crates {
    pub use sq_columnar as columnar;
    pub use sq_expr as expr;
    pub use sq_filter as filter;
    pub use sq_frame as frame;
    pub use sq_groupby as groupby;
    pub use sq_io as io;
    pub use sq_join as join;
    pub use sq_lexer as lexer;
    pub use sq_pipeline as pipeline;
    pub use sq_runtime as runtime;
    pub use sq_types as types;
}

#[cfg(test)]
mod tests {
    use super::{Engine, ErrorKind, FileLookupStore, RuntimePolicy, Scalar, Table, crates};

    #[test]
    fn file_lookups_drive_a_query_end_to_end() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("hosts.csv"),
            "host,bytes\nweb,10\ndb,30\nweb,5\n",
        )
        .expect("write csv");

        let policy = RuntimePolicy::from_json_str(r#"{"default_head_count": 1}"#).expect("policy");
        let engine = Engine::new(policy).with_lookup_store(FileLookupStore::new(dir.path()));
        let out = engine
            .execute("| inputlookup hosts.csv | stats sum(bytes) as total by host | sort -total | head")
            .expect("query");
        assert_eq!(out.column("host").expect("host").values(), &[Scalar::Utf8("db".into())]);
        assert_eq!(out.column("total").expect("total").values(), &[Scalar::Int64(30)]);
    }

    #[test]
    fn errors_surface_their_kind() {
        let err = Engine::default().execute("| eval y = __import__('os')").expect_err("blocked");
        assert_eq!(err.kind(), ErrorKind::DisallowedConstruct);
        let split = crates::lexer::split_query("a | b").expect("split");
        assert_eq!(split.segments.len(), 1);
        assert_eq!(Table::empty().row_count(), 0);
    }
}
