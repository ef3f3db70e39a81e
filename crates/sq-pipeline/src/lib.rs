#![forbid(unsafe_code)]

//! Query engine for speak queries.
//!
//! A query is an index clause followed by `|`-separated directives:
//!
//! ```text
//! index=web status>=500 | eval kb = bytes / 1024 | stats avg(kb) by host
//! ```
//!
//! The index clause goes to an [`Accelerator`], which returns the initial
//! table; a query starting with `|` begins from an empty table. Each
//! directive then maps the working table to the next one. Lookups, macros
//! and result persistence are reached through the collaborator traits in
//! [`collab`].

mod args;
pub mod collab;
pub mod directive;
mod engine;
pub mod error;
mod handlers;

pub use collab::{
    Accelerator, CollaboratorError, FileLookupStore, LookupStore, MacroRegistry,
    MemoryLookupStore, NoopPersistence, Persistence, SaveOptions, StaticMacroRegistry,
    TableAccelerator,
};
pub use directive::{DIRECTIVES, Directive};
pub use engine::Engine;
pub use error::{DirectiveError, EngineError, ErrorKind};
pub use sq_runtime::{DirectiveRecord, ExecutionLedger, RuntimePolicy};
