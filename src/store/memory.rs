//! In-memory [`Store`] implementation.
//!
//! Backs the test suites and small prototypes. Rows keep insertion order,
//! which stands in for primary-key order; transactions are whole-store
//! snapshots, so a rollback restores the exact pre-transaction state.

use super::{Store, StoredRow};
use crate::{FieldVaultError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::{Mutex, RwLock};

type Tables = HashMap<String, Vec<StoredRow>>;

#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    snapshot: Mutex<Option<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a row. Test fixtures insert in primary-key order.
    pub async fn insert_row(&self, table: &str, row: StoredRow) {
        self.tables
            .write()
            .await
            .entry(table.to_string())
            .or_default()
            .push(row);
    }

    /// Fetches a row by id for assertions.
    pub async fn get_row(&self, table: &str, id: &str) -> Option<StoredRow> {
        self.tables
            .read()
            .await
            .get(table)?
            .iter()
            .find(|row| row.id == id)
            .cloned()
    }

    /// Directly overwrites one column of one row, bypassing transactions.
    /// Used by tests to corrupt stored envelopes.
    pub async fn set_column(&self, table: &str, id: &str, column: &str, value: Value) {
        if let Some(rows) = self.tables.write().await.get_mut(table) {
            if let Some(row) = rows.iter_mut().find(|row| row.id == id) {
                row.columns.insert(column.to_string(), value);
            }
        }
    }

    fn matches(row: &StoredRow, predicate: &str) -> Result<bool> {
        for clause in predicate.split(" AND ") {
            let clause = clause.trim();
            if let Some(column) = clause.strip_suffix(" IS NOT NULL") {
                if row.is_null(column.trim()) {
                    return Ok(false);
                }
            } else if let Some(column) = clause.strip_suffix(" IS NULL") {
                if !row.is_null(column.trim()) {
                    return Ok(false);
                }
            } else {
                return Err(FieldVaultError::Store {
                    message: format!("unsupported predicate clause: {}", clause),
                });
            }
        }
        Ok(true)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn count(&self, table: &str, predicate: Option<&str>) -> Result<u64> {
        let tables = self.tables.read().await;
        let rows = tables.get(table).map(Vec::as_slice).unwrap_or_default();

        match predicate {
            None => Ok(rows.len() as u64),
            Some(predicate) => {
                let mut count = 0u64;
                for row in rows {
                    if Self::matches(row, predicate)? {
                        count += 1;
                    }
                }
                Ok(count)
            }
        }
    }

    async fn select_batch(
        &self,
        table: &str,
        columns: &[String],
        limit: u32,
        offset: u64,
    ) -> Result<Vec<StoredRow>> {
        let tables = self.tables.read().await;
        let rows = tables.get(table).map(Vec::as_slice).unwrap_or_default();

        let start = (offset as usize).min(rows.len());
        let end = (start + limit as usize).min(rows.len());

        Ok(rows[start..end]
            .iter()
            .map(|row| {
                let mut projected = StoredRow::new(row.id.clone());
                for column in columns {
                    if column == "id" {
                        continue;
                    }
                    let value = row.get(column).cloned().unwrap_or(Value::Null);
                    projected.columns.insert(column.clone(), value);
                }
                projected
            })
            .collect())
    }

    async fn update_row(&self, table: &str, id: &str, values: &[(String, Value)]) -> Result<()> {
        let mut tables = self.tables.write().await;
        let rows = tables.get_mut(table).ok_or_else(|| FieldVaultError::Store {
            message: format!("unknown table: {}", table),
        })?;
        let row = rows
            .iter_mut()
            .find(|row| row.id == id)
            .ok_or_else(|| FieldVaultError::Store {
                message: format!("row {} not found in {}", id, table),
            })?;

        for (column, value) in values {
            row.columns.insert(column.clone(), value.clone());
        }
        Ok(())
    }

    async fn begin_transaction(&self) -> Result<()> {
        let mut snapshot = self.snapshot.lock().await;
        if snapshot.is_some() {
            return Err(FieldVaultError::Store {
                message: "transaction already open".to_string(),
            });
        }
        *snapshot = Some(self.tables.read().await.clone());
        Ok(())
    }

    async fn commit_transaction(&self) -> Result<()> {
        let mut snapshot = self.snapshot.lock().await;
        if snapshot.take().is_none() {
            return Err(FieldVaultError::Store {
                message: "no open transaction to commit".to_string(),
            });
        }
        Ok(())
    }

    async fn rollback_transaction(&self) -> Result<()> {
        let mut snapshot = self.snapshot.lock().await;
        match snapshot.take() {
            Some(saved) => {
                *self.tables.write().await = saved;
                Ok(())
            }
            None => Err(FieldVaultError::Store {
                message: "no open transaction to roll back".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .insert_row(
                "users",
                StoredRow::new("1")
                    .with_column("ssn", json!("111-11-1111"))
                    .with_column("ssn_encrypted", Value::Null),
            )
            .await;
        store
            .insert_row(
                "users",
                StoredRow::new("2")
                    .with_column("ssn", Value::Null)
                    .with_column("ssn_encrypted", Value::Null),
            )
            .await;
        store
    }

    #[tokio::test]
    async fn test_count_with_predicates() {
        let store = seeded().await;
        assert_eq!(store.count("users", None).await.unwrap(), 2);
        assert_eq!(
            store.count("users", Some("ssn IS NOT NULL")).await.unwrap(),
            1
        );
        assert_eq!(
            store
                .count("users", Some("ssn IS NULL AND ssn_encrypted IS NULL"))
                .await
                .unwrap(),
            1
        );
        assert!(store.count("users", Some("ssn = 'x'")).await.is_err());
    }

    #[tokio::test]
    async fn test_select_batch_projects_and_pages() {
        let store = seeded().await;
        let columns = vec!["id".to_string(), "ssn".to_string()];

        let page = store.select_batch("users", &columns, 1, 0).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, "1");
        assert_eq!(page[0].get("ssn"), Some(&json!("111-11-1111")));
        assert!(page[0].get("ssn_encrypted").is_none());

        let page = store.select_batch("users", &columns, 10, 2).await.unwrap();
        assert!(page.is_empty());
    }

    #[tokio::test]
    async fn test_rollback_restores_snapshot() {
        let store = seeded().await;
        store.begin_transaction().await.unwrap();
        store
            .update_row("users", "1", &[("ssn".to_string(), json!("999-99-9999"))])
            .await
            .unwrap();
        store.rollback_transaction().await.unwrap();

        let row = store.get_row("users", "1").await.unwrap();
        assert_eq!(row.get("ssn"), Some(&json!("111-11-1111")));
    }

    #[tokio::test]
    async fn test_nested_transaction_rejected() {
        let store = seeded().await;
        store.begin_transaction().await.unwrap();
        assert!(store.begin_transaction().await.is_err());
        store.commit_transaction().await.unwrap();
        assert!(store.commit_transaction().await.is_err());
    }
}
