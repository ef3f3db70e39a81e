use std::fmt;

use sq_expr::EvalOptions;
use sq_frame::Table;
use sq_lexer::{LexError, PipelineSegment, SplitQuery, split_query};
use sq_runtime::{ExecutionLedger, RuntimePolicy, now_unix_ms};
use uuid::Uuid;

use crate::collab::{
    Accelerator, LookupStore, MacroRegistry, MemoryLookupStore, NoopPersistence, Persistence,
    StaticMacroRegistry, TableAccelerator,
};
use crate::directive::Invocation;
use crate::error::{DirectiveError, EngineError};

/// Runs speak queries against its collaborators.
///
/// The engine holds no per-query state, so one instance can serve
/// concurrent queries from several threads.
pub struct Engine {
    policy: RuntimePolicy,
    eval_options: EvalOptions,
    accelerator: Box<dyn Accelerator>,
    lookups: Box<dyn LookupStore>,
    persistence: Box<dyn Persistence>,
    macros: Box<dyn MacroRegistry>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("policy", &self.policy)
            .field("eval_options", &self.eval_options)
            .finish_non_exhaustive()
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(RuntimePolicy::default())
    }
}

impl Engine {
    /// An engine with in-memory collaborators: no indexes, an empty lookup
    /// store, no persistence and no macros.
    #[must_use]
    pub fn new(policy: RuntimePolicy) -> Self {
        Self {
            policy,
            eval_options: EvalOptions::default(),
            accelerator: Box::new(TableAccelerator::new()),
            lookups: Box::new(MemoryLookupStore::new()),
            persistence: Box::new(NoopPersistence),
            macros: Box::new(StaticMacroRegistry::new()),
        }
    }

    #[must_use]
    pub fn with_accelerator(mut self, accelerator: impl Accelerator + 'static) -> Self {
        self.accelerator = Box::new(accelerator);
        self
    }

    #[must_use]
    pub fn with_lookup_store(mut self, lookups: impl LookupStore + 'static) -> Self {
        self.lookups = Box::new(lookups);
        self
    }

    #[must_use]
    pub fn with_persistence(mut self, persistence: impl Persistence + 'static) -> Self {
        self.persistence = Box::new(persistence);
        self
    }

    #[must_use]
    pub fn with_macros(mut self, macros: impl MacroRegistry + 'static) -> Self {
        self.macros = Box::new(macros);
        self
    }

    /// Fixes the seed `randomize` draws from.
    #[must_use]
    pub fn with_eval_seed(mut self, seed: u64) -> Self {
        self.eval_options.seed = Some(seed);
        self
    }

    #[must_use]
    pub fn policy(&self) -> &RuntimePolicy {
        &self.policy
    }

    #[must_use]
    pub fn lookup_store(&self) -> &dyn LookupStore {
        self.lookups.as_ref()
    }

    pub fn execute(&self, query: &str) -> Result<Table, EngineError> {
        let mut ledger = ExecutionLedger::new();
        self.execute_with_ledger(query, &mut ledger)
    }

    /// Executes `query` and records one entry per directive in `ledger`.
    /// The final table is handed to persistence; a persistence failure is
    /// logged and does not fail the query.
    pub fn execute_with_ledger(
        &self,
        query: &str,
        ledger: &mut ExecutionLedger,
    ) -> Result<Table, EngineError> {
        let request_id = new_request_id();
        ledger.set_request_id(request_id.as_str());

        let table = self.run_query(query, 0, Some(ledger))?;

        #[cfg(feature = "tracing")]
        tracing::info!(request_id = %request_id, rows = table.row_count(), "query finished");

        if let Err(_err) = self.persistence.save(&request_id, &table, query) {
            #[cfg(feature = "tracing")]
            tracing::warn!(request_id = %request_id, error = %_err, "persistence failed");
        }
        Ok(table)
    }

    /// Runs a pipeline (directives only, no index clause) over `table`.
    pub fn run_pipeline(&self, table: Table, pipeline: &str) -> Result<Table, EngineError> {
        match split_pipeline(pipeline)? {
            Some(split) => self.run_segments(table, &split.segments, 0, None),
            None => Ok(table),
        }
    }

    fn run_query(
        &self,
        query: &str,
        depth: usize,
        ledger: Option<&mut ExecutionLedger>,
    ) -> Result<Table, EngineError> {
        let split = split_query(query)?;
        let table = if split.index_tokens.is_empty() {
            Table::empty()
        } else {
            self.accelerator
                .select_rows(&split.index_tokens)
                .map_err(EngineError::Accelerator)?
        };
        self.policy
            .admit_rows("accelerator", table.row_count())
            .map_err(EngineError::Admission)?;
        self.run_segments(table, &split.segments, depth, ledger)
    }

    fn run_segments(
        &self,
        mut table: Table,
        segments: &[PipelineSegment],
        depth: usize,
        mut ledger: Option<&mut ExecutionLedger>,
    ) -> Result<Table, EngineError> {
        let exec = Exec { engine: self, depth };
        for segment in segments {
            let fail = |source: DirectiveError| EngineError::Directive {
                index: segment.index,
                keyword: segment
                    .keyword()
                    .map_or_else(String::new, |token| token.value.clone()),
                source,
            };
            let inv = Invocation::resolve(segment).map_err(fail)?;
            let rows_in = table.row_count();
            table = inv.directive.apply(&exec, table, &inv).map_err(fail)?;
            self.policy
                .admit_rows(inv.name(), table.row_count())
                .map_err(|err| fail(err.into()))?;

            #[cfg(feature = "tracing")]
            tracing::debug!(
                index = segment.index,
                directive = inv.name(),
                depth,
                rows_in,
                rows_out = table.row_count(),
                "directive"
            );
            if let Some(ledger) = ledger.as_deref_mut() {
                ledger.record(segment.index, inv.name(), rows_in, table.row_count());
            }
        }
        Ok(table)
    }
}

/// `<unix_millis>_<uuid v4>`.
fn new_request_id() -> String {
    format!("{}_{}", now_unix_ms().unwrap_or_default(), Uuid::new_v4())
}

/// Splits directive-only text. `None` when there is nothing to run.
fn split_pipeline(text: &str) -> Result<Option<SplitQuery>, LexError> {
    let trimmed = text.trim();
    let body = trimmed.strip_prefix('|').unwrap_or(trimmed).trim();
    if body.is_empty() {
        return Ok(None);
    }
    split_query(&format!("| {body}")).map(Some)
}

/// Handler view of a running query: the engine plus the subsearch depth.
#[derive(Clone, Copy)]
pub(crate) struct Exec<'e> {
    engine: &'e Engine,
    depth: usize,
}

impl Exec<'_> {
    pub(crate) fn policy(&self) -> &RuntimePolicy {
        &self.engine.policy
    }

    pub(crate) fn eval_options(&self) -> EvalOptions {
        self.engine.eval_options
    }

    pub(crate) fn lookups(&self) -> &dyn LookupStore {
        self.engine.lookups.as_ref()
    }

    pub(crate) fn macros(&self) -> &dyn MacroRegistry {
        self.engine.macros.as_ref()
    }

    fn nested_depth(&self) -> Result<usize, DirectiveError> {
        let depth = self.depth + 1;
        self.engine.policy.admit_depth(depth)?;
        Ok(depth)
    }

    /// Runs a complete query (index clause included) one level deeper.
    pub(crate) fn run_query(&self, query: &str) -> Result<Table, DirectiveError> {
        let depth = self.nested_depth()?;
        self.engine
            .run_query(query, depth, None)
            .map_err(|err| DirectiveError::Subsearch(Box::new(err)))
    }

    /// Runs directive-only text over `table` one level deeper.
    pub(crate) fn run_pipeline(&self, table: Table, pipeline: &str) -> Result<Table, DirectiveError> {
        let depth = self.nested_depth()?;
        let split = split_pipeline(pipeline)?;
        let Some(split) = split else {
            return Ok(table);
        };
        self.engine
            .run_segments(table, &split.segments, depth, None)
            .map_err(|err| DirectiveError::Subsearch(Box::new(err)))
    }
}
