//! PostgreSQL [`Store`] adapter backed by sqlx.
//!
//! Encrypted-shadow workflows operate on text columns, so every selected
//! column is cast to text; adapters for other stores can map types however
//! suits them. Identifiers are validated before being interpolated;
//! predicates are the engine-generated nullability clauses and are treated
//! as trusted operator input.

use super::{Store, StoredRow};
use crate::{FieldVaultError, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::{PgPool, Postgres, Row as _, Transaction};
use tokio::sync::Mutex;

pub struct PostgresStore {
    pool: PgPool,
    tx: Mutex<Option<Transaction<'static, Postgres>>>,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            tx: Mutex::new(None),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn validate_ident(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');

    if valid {
        Ok(())
    } else {
        Err(FieldVaultError::Store {
            message: format!("invalid identifier: {:?}", name),
        })
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn count(&self, table: &str, predicate: Option<&str>) -> Result<u64> {
        validate_ident(table)?;
        let sql = match predicate {
            Some(predicate) => format!("SELECT COUNT(*) FROM {} WHERE {}", table, predicate),
            None => format!("SELECT COUNT(*) FROM {}", table),
        };

        let mut guard = self.tx.lock().await;
        let row = match guard.as_mut() {
            Some(tx) => sqlx::query(&sql).fetch_one(&mut **tx).await?,
            None => sqlx::query(&sql).fetch_one(&self.pool).await?,
        };
        let count: i64 = row.try_get(0)?;
        Ok(count as u64)
    }

    async fn select_batch(
        &self,
        table: &str,
        columns: &[String],
        limit: u32,
        offset: u64,
    ) -> Result<Vec<StoredRow>> {
        validate_ident(table)?;
        let data_columns: Vec<&String> = columns.iter().filter(|c| c.as_str() != "id").collect();
        for column in &data_columns {
            validate_ident(column)?;
        }

        let mut select_list = vec!["id::text AS id".to_string()];
        for column in &data_columns {
            select_list.push(format!("{}::text AS {}", column, column));
        }
        let sql = format!(
            "SELECT {} FROM {} ORDER BY id LIMIT {} OFFSET {}",
            select_list.join(", "),
            table,
            limit,
            offset
        );

        let mut guard = self.tx.lock().await;
        let rows = match guard.as_mut() {
            Some(tx) => sqlx::query(&sql).fetch_all(&mut **tx).await?,
            None => sqlx::query(&sql).fetch_all(&self.pool).await?,
        };

        let mut result = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("id")?;
            let mut stored = StoredRow::new(id);
            for column in &data_columns {
                let value: Option<String> = row.try_get(column.as_str())?;
                stored.columns.insert(
                    (*column).clone(),
                    value.map(Value::String).unwrap_or(Value::Null),
                );
            }
            result.push(stored);
        }
        Ok(result)
    }

    async fn update_row(&self, table: &str, id: &str, values: &[(String, Value)]) -> Result<()> {
        validate_ident(table)?;
        if values.is_empty() {
            return Ok(());
        }

        let mut assignments = Vec::with_capacity(values.len());
        for (i, (column, _)) in values.iter().enumerate() {
            validate_ident(column)?;
            assignments.push(format!("{} = ${}", column, i + 1));
        }
        let sql = format!(
            "UPDATE {} SET {} WHERE id::text = ${}",
            table,
            assignments.join(", "),
            values.len() + 1
        );

        let mut query = sqlx::query(&sql);
        for (_, value) in values {
            let bound = match value {
                Value::Null => None,
                Value::String(s) => Some(s.clone()),
                other => Some(other.to_string()),
            };
            query = query.bind(bound);
        }
        query = query.bind(id.to_string());

        let mut guard = self.tx.lock().await;
        match guard.as_mut() {
            Some(tx) => query.execute(&mut **tx).await?,
            None => query.execute(&self.pool).await?,
        };
        Ok(())
    }

    async fn begin_transaction(&self) -> Result<()> {
        let mut guard = self.tx.lock().await;
        if guard.is_some() {
            return Err(FieldVaultError::Store {
                message: "transaction already open".to_string(),
            });
        }
        *guard = Some(self.pool.begin().await?);
        Ok(())
    }

    async fn commit_transaction(&self) -> Result<()> {
        match self.tx.lock().await.take() {
            Some(tx) => {
                tx.commit().await?;
                Ok(())
            }
            None => Err(FieldVaultError::Store {
                message: "no open transaction to commit".to_string(),
            }),
        }
    }

    async fn rollback_transaction(&self) -> Result<()> {
        match self.tx.lock().await.take() {
            Some(tx) => {
                tx.rollback().await?;
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

    #[test]
    fn test_identifier_validation() {
        assert!(validate_ident("users").is_ok());
        assert!(validate_ident("ssn_encrypted").is_ok());
        assert!(validate_ident("_shadow").is_ok());

        assert!(validate_ident("").is_err());
        assert!(validate_ident("1users").is_err());
        assert!(validate_ident("users; DROP TABLE users").is_err());
        assert!(validate_ident("na me").is_err());
    }
}
