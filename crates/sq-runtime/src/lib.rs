#![forbid(unsafe_code)]

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("system clock is before UNIX_EPOCH")]
    ClockSkew,
    #[error("{subject} produced {rows} rows, above the row cap of {cap}")]
    RowCapExceeded {
        subject: String,
        rows: usize,
        cap: usize,
    },
    #[error("subsearch nesting depth {depth} exceeds the limit of {limit}")]
    DepthExceeded { depth: usize, limit: usize },
    #[error("invalid runtime policy: {0}")]
    InvalidPolicy(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Engine configuration. Every field has a default, so a policy document
/// only needs to name what it overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimePolicy {
    /// Rows kept by `head` / `limit` without an explicit count.
    pub default_head_count: usize,
    /// Bucket width used by `bin` and `timechart` without `span=`.
    pub default_span: String,
    /// Nesting limit for join/append/appendpipe/multisearch and macros.
    pub max_subsearch_depth: usize,
    /// Admission limit on the initial table and every directive's output.
    pub row_cap: Option<usize>,
}

impl Default for RuntimePolicy {
    fn default() -> Self {
        Self {
            default_head_count: 5,
            default_span: "1h".to_owned(),
            max_subsearch_depth: 8,
            row_cap: None,
        }
    }
}

impl RuntimePolicy {
    pub fn from_json_str(input: &str) -> Result<Self, RuntimeError> {
        let policy: Self = serde_json::from_str(input)?;
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.default_head_count == 0 {
            return Err(RuntimeError::InvalidPolicy(
                "default_head_count must be at least 1".to_owned(),
            ));
        }
        if self.default_span.trim().is_empty() {
            return Err(RuntimeError::InvalidPolicy(
                "default_span must not be empty".to_owned(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn with_row_cap(mut self, cap: usize) -> Self {
        self.row_cap = Some(cap);
        self
    }

    /// Fails once `rows` exceeds the configured cap; never truncates.
    pub fn admit_rows(&self, subject: &str, rows: usize) -> Result<(), RuntimeError> {
        match self.row_cap {
            Some(cap) if rows > cap => Err(RuntimeError::RowCapExceeded {
                subject: subject.to_owned(),
                rows,
                cap,
            }),
            _ => Ok(()),
        }
    }

    pub fn admit_depth(&self, depth: usize) -> Result<(), RuntimeError> {
        if depth > self.max_subsearch_depth {
            return Err(RuntimeError::DepthExceeded {
                depth,
                limit: self.max_subsearch_depth,
            });
        }
        Ok(())
    }
}

/// One executed directive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectiveRecord {
    pub ts_unix_ms: u64,
    pub index: usize,
    pub keyword: String,
    pub rows_in: usize,
    pub rows_out: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionLedger {
    request_id: Option<String>,
    records: Vec<DirectiveRecord>,
}

impl ExecutionLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_request_id(&mut self, request_id: impl Into<String>) {
        self.request_id = Some(request_id.into());
    }

    #[must_use]
    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    pub fn record(&mut self, index: usize, keyword: &str, rows_in: usize, rows_out: usize) {
        self.records.push(DirectiveRecord {
            ts_unix_ms: now_unix_ms().unwrap_or_default(),
            index,
            keyword: keyword.to_owned(),
            rows_in,
            rows_out,
        });
    }

    #[must_use]
    pub fn records(&self) -> &[DirectiveRecord] {
        &self.records
    }

    pub fn to_json_string(&self) -> Result<String, RuntimeError> {
        Ok(serde_json::to_string(self)?)
    }
}

pub fn now_unix_ms() -> Result<u64, RuntimeError> {
    let ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| RuntimeError::ClockSkew)?
        .as_millis();
    Ok(ms as u64)
}

#[cfg(test)]
mod tests {
    use super::{ExecutionLedger, RuntimeError, RuntimePolicy};

    #[test]
    fn defaults_match_the_documented_values() {
        let policy = RuntimePolicy::default();
        assert_eq!(policy.default_head_count, 5);
        assert_eq!(policy.default_span, "1h");
        assert_eq!(policy.max_subsearch_depth, 8);
        assert_eq!(policy.row_cap, None);
    }

    #[test]
    fn partial_json_overrides_only_named_fields() {
        let policy = RuntimePolicy::from_json_str(r#"{"row_cap": 100, "default_span": "15m"}"#)
            .expect("policy");
        assert_eq!(policy.row_cap, Some(100));
        assert_eq!(policy.default_span, "15m");
        assert_eq!(policy.default_head_count, 5);

        let err = RuntimePolicy::from_json_str(r#"{"default_head_count": 0}"#)
            .expect_err("zero head");
        assert!(matches!(err, RuntimeError::InvalidPolicy(_)));
    }

    #[test]
    fn row_cap_and_depth_reject_instead_of_truncating() {
        let policy = RuntimePolicy::default().with_row_cap(10);
        assert!(policy.admit_rows("accelerator", 10).is_ok());
        assert!(matches!(
            policy.admit_rows("stats", 11),
            Err(RuntimeError::RowCapExceeded { rows: 11, cap: 10, .. })
        ));
        assert!(policy.admit_depth(8).is_ok());
        assert!(matches!(
            policy.admit_depth(9),
            Err(RuntimeError::DepthExceeded { depth: 9, limit: 8 })
        ));
    }

    #[test]
    fn ledger_records_directives_in_order() {
        let mut ledger = ExecutionLedger::new();
        ledger.set_request_id("1_abc");
        ledger.record(0, "eval", 3, 3);
        ledger.record(1, "stats", 3, 1);
        assert_eq!(ledger.request_id(), Some("1_abc"));
        let keywords: Vec<&str> = ledger.records().iter().map(|r| r.keyword.as_str()).collect();
        assert_eq!(keywords, vec!["eval", "stats"]);
        assert!(ledger.to_json_string().expect("json").contains("\"rows_out\":1"));
    }
}
