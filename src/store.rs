//! Row Store port
//!
//! The dispatch core never binds to fixed table shapes. Every table access goes
//! through [`RowStore`], which speaks loosely typed JSON rows so that the schema
//! resolver can decide table and column names at runtime.
//!
//! Adapters: [`crate::store_memory::MemoryStore`] for tests and local tooling,
//! `PgRowStore` (feature `postgres`) for production.

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

/// A database row as column name → JSON value.
pub type Row = Map<String, Value>;

/// Errors surfaced by a [`RowStore`] adapter.
///
/// Missing tables and columns are separate variants because discovery and the
/// write-strategy fallbacks branch on them.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("table '{table}' does not exist")]
    MissingTable { table: String },

    #[error("column '{column}' does not exist on '{table}'")]
    MissingColumn { table: String, column: String },

    #[error("unique constraint violated on '{table}': {detail}")]
    Conflict { table: String, detail: String },

    #[error("database error: {0}")]
    Backend(String),
}

impl StoreError {
    /// True when the error names this specific missing column.
    pub fn is_missing_column(&self, name: &str) -> bool {
        matches!(self, Self::MissingColumn { column, .. } if column == name)
    }

    /// True for errors caused by naming drift rather than data or connectivity.
    pub fn is_schema_mismatch(&self) -> bool {
        matches!(self, Self::MissingTable { .. } | Self::MissingColumn { .. })
    }
}

/// A single row predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// `column = value`, compared on the textual form of both sides.
    Eq { column: String, value: Value },
    /// `column IS NOT NULL`
    NotNull { column: String },
}

impl Filter {
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq {
            column: column.into(),
            value: value.into(),
        }
    }

    pub fn column(&self) -> &str {
        match self {
            Self::Eq { column, .. } | Self::NotNull { column } => column,
        }
    }
}

/// Select query: conjunction of filters, optional ordering and limit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub filters: Vec<Filter>,
    pub order_by: Option<String>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::eq(column, value));
        self
    }

    pub fn not_null(mut self, column: impl Into<String>) -> Self {
        self.filters.push(Filter::NotNull {
            column: column.into(),
        });
        self
    }

    pub fn order_by(mut self, column: impl Into<String>) -> Self {
        self.order_by = Some(column.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Table operations needed by the dispatch core.
#[async_trait]
pub trait RowStore: Send + Sync {
    /// Read rows matching `query`.
    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Row>, StoreError>;

    /// Insert a row and return it as stored (including generated columns).
    async fn insert(&self, table: &str, row: &Row) -> Result<Row, StoreError>;

    /// Patch every row matching `filters`. Returns the number of rows touched.
    async fn update(&self, table: &str, filters: &[Filter], patch: &Row)
        -> Result<u64, StoreError>;

    /// Insert, or overwrite the row that collides on `conflict` columns.
    ///
    /// Columns listed in `insert_only` are written on insert and left untouched
    /// when an existing row is overwritten.
    async fn upsert(
        &self,
        table: &str,
        row: &Row,
        conflict: &[&str],
        insert_only: &[&str],
    ) -> Result<Row, StoreError>;
}

/// Textual form of a scalar JSON value, used for identifier comparison.
///
/// Empty strings, nulls, arrays and objects yield `None`.
pub fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Numeric reading of a JSON value; numeric strings are accepted.
pub fn value_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Build a [`Row`] from `(column, value)` pairs.
pub fn row_of<I, K>(pairs: I) -> Row
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}
