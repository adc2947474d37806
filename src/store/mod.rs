//! Abstract tabular store consumed by the migration engine.
//!
//! The engine never talks to a database directly; it drives this trait.
//! Any SQL or document store that can count rows, page them in primary-key
//! order, update columns by id, and bracket work in a transaction can plug
//! in. A reference PostgreSQL adapter ships behind the `postgres` feature,
//! and [`MemoryStore`] ships unconditionally for tests and prototyping.

use crate::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::MemoryStore;

#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;

/// One row as seen by the migration engine.
///
/// `id` is the primary key rendered as text; column values are JSON values
/// with SQL `NULL` mapped to `Value::Null`.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub id: String,
    pub columns: HashMap<String, Value>,
}

impl StoredRow {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            columns: HashMap::new(),
        }
    }

    pub fn with_column(mut self, name: impl Into<String>, value: Value) -> Self {
        self.columns.insert(name.into(), value);
        self
    }

    /// Column value, if the column was selected. SQL `NULL` comes back as
    /// `Some(&Value::Null)`.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns.get(column)
    }

    /// True when the column is absent or `NULL`.
    pub fn is_null(&self, column: &str) -> bool {
        matches!(self.get(column), None | Some(Value::Null))
    }
}

/// Minimal tabular interface the migration engine operates against.
///
/// Transactions are explicit: the engine calls `begin_transaction`, issues
/// updates, and either `commit_transaction` after a clean full scan or
/// `rollback_transaction` on any error. Implementations route reads and
/// writes through the open transaction while one exists, making a
/// non-dry-run migration a single all-or-nothing unit.
#[async_trait]
pub trait Store: Send + Sync {
    /// Number of rows in `table`, optionally restricted by a SQL-style
    /// predicate over column nullability (`"ssn IS NOT NULL"`, clauses
    /// joined with `AND`).
    async fn count(&self, table: &str, predicate: Option<&str>) -> Result<u64>;

    /// One page of rows ordered by primary key.
    async fn select_batch(
        &self,
        table: &str,
        columns: &[String],
        limit: u32,
        offset: u64,
    ) -> Result<Vec<StoredRow>>;

    /// Updates the named columns of one row.
    async fn update_row(&self, table: &str, id: &str, values: &[(String, Value)]) -> Result<()>;

    /// Opens the transaction subsequent calls run inside. Nested
    /// transactions are an error.
    async fn begin_transaction(&self) -> Result<()>;

    /// Commits the open transaction.
    async fn commit_transaction(&self) -> Result<()>;

    /// Rolls the open transaction back, discarding every staged write.
    async fn rollback_transaction(&self) -> Result<()>;
}
