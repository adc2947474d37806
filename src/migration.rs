//! Batch migration of at-rest data: bulk encryption of existing plaintext,
//! re-encryption under a new key version, integrity verification, and field
//! statistics.
//!
//! All operations drive the abstract [`Store`] in fixed-size offset batches
//! ordered by primary key and go through the [`CipherEngine`]; the engine
//! never bypasses the envelope format. Mutating runs are bracketed in a
//! single store transaction and either commit after a clean full scan or
//! roll back entirely: a crash or error mid-run leaves the table unchanged.
//! That all-or-nothing policy trades partial progress for consistency;
//! callers migrating very large tables should chunk the work into multiple
//! independent invocations if rollback cost is a concern. Progress is not
//! checkpointed, so a restart scans from offset 0.

use crate::{
    FieldVaultError, Result,
    encryption::{CipherEngine, FieldEnvelope, KeyManager},
    store::{Store, StoredRow},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Default rows per batch when a plan does not specify one.
pub const DEFAULT_BATCH_SIZE: u32 = 500;

/// Name of the shadow column an encrypted field is written to.
pub fn encrypted_column(field: &str) -> String {
    format!("{}_encrypted", field)
}

/// Progress callback: `(rows_scanned, rows_total)`.
pub type MigrationProgress = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// A single migration run: which table, which fields, how to batch.
///
/// Transient: plans live only for the duration of a run and are not
/// persisted anywhere.
#[derive(Clone)]
pub struct MigrationPlan {
    pub table: String,
    pub fields: Vec<String>,
    pub batch_size: u32,
    /// Scan and report without writing anything.
    pub dry_run: bool,
    pub on_progress: Option<MigrationProgress>,
}

impl MigrationPlan {
    pub fn new(table: impl Into<String>, fields: Vec<String>) -> Self {
        Self {
            table: table.into(),
            fields,
            batch_size: DEFAULT_BATCH_SIZE,
            dry_run: false,
            on_progress: None,
        }
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_progress(mut self, callback: MigrationProgress) -> Self {
        self.on_progress = Some(callback);
        self
    }

    fn validate(&self) -> Result<()> {
        if self.fields.is_empty() {
            return Err(FieldVaultError::Configuration(
                "migration plan has no fields".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(FieldVaultError::Configuration(
                "migration batch size must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// One undecryptable field found by an integrity scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityError {
    pub id: String,
    pub field: String,
    pub error: String,
}

/// Result of [`MigrationEngine::verify_encryption_integrity`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub total_records: u64,
    /// Encrypted fields that decrypted cleanly.
    pub verified: u64,
    /// Encrypted fields that failed to decrypt.
    pub failed: u64,
    pub errors: Vec<IntegrityError>,
}

/// Per-field counts from [`MigrationEngine::encryption_stats`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldStats {
    /// Rows with a populated shadow column.
    pub encrypted: u64,
    /// Rows still carrying plaintext with no shadow value.
    pub plaintext: u64,
    /// Rows where the field is absent entirely.
    pub null: u64,
}

/// Result of [`MigrationEngine::encryption_stats`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionStatsReport {
    pub total_records: u64,
    pub field_stats: HashMap<String, FieldStats>,
}

/// Drives bulk encryption, re-keying, and verification against a [`Store`].
///
/// Batch loops are single-threaded scans; the open transaction of a
/// non-dry run is the unit of atomicity. There is no cancellation primitive
/// beyond terminating the process, which the transactional design makes
/// safe: an uncommitted transaction leaves no partial writes.
pub struct MigrationEngine {
    store: Arc<dyn Store>,
    cipher: CipherEngine,
    key_manager: Arc<KeyManager>,
}

impl MigrationEngine {
    pub fn new(store: Arc<dyn Store>, cipher: CipherEngine, key_manager: Arc<KeyManager>) -> Self {
        Self {
            store,
            cipher,
            key_manager,
        }
    }

    /// Encrypts existing plaintext fields into their shadow columns.
    ///
    /// Skips fields that are null, already hold an envelope, or already
    /// have a populated shadow column, so repeated runs are idempotent.
    /// Returns the number of rows that had at least one field processed
    /// (for a dry run: that would have been processed).
    pub async fn encrypt_existing_data(&self, plan: &MigrationPlan) -> Result<u64> {
        plan.validate()?;
        let total = self.store.count(&plan.table, None).await?;
        info!(
            table = %plan.table,
            fields = plan.fields.len(),
            total,
            dry_run = plan.dry_run,
            "starting bulk field encryption"
        );

        if !plan.dry_run {
            self.store.begin_transaction().await?;
        }
        match self.encrypt_existing_inner(plan, total).await {
            Ok(processed) => {
                if !plan.dry_run {
                    self.store.commit_transaction().await?;
                }
                info!(table = %plan.table, processed, "bulk field encryption complete");
                Ok(processed)
            }
            Err(e) => self.abort(plan, e).await,
        }
    }

    /// Re-encrypts populated shadow columns under `target_version`
    /// (default: the current active version).
    ///
    /// Envelopes already tagged with the target version are skipped by
    /// metadata inspection alone, with no decryption. Returns the number
    /// of rows with at least one field re-encrypted.
    pub async fn migrate_to_new_key(
        &self,
        plan: &MigrationPlan,
        target_version: Option<u32>,
    ) -> Result<u64> {
        plan.validate()?;
        let target = match target_version {
            Some(v) => v,
            None => self.key_manager.current_key_version().await?,
        };
        let total = self.store.count(&plan.table, None).await?;
        info!(
            table = %plan.table,
            target_version = target,
            total,
            dry_run = plan.dry_run,
            "starting key migration"
        );

        if !plan.dry_run {
            self.store.begin_transaction().await?;
        }
        match self.migrate_to_new_key_inner(plan, target, total).await {
            Ok(processed) => {
                if !plan.dry_run {
                    self.store.commit_transaction().await?;
                }
                info!(table = %plan.table, processed, target_version = target, "key migration complete");
                Ok(processed)
            }
            Err(e) => self.abort(plan, e).await,
        }
    }

    /// Attempts to decrypt every populated shadow column and reports every
    /// failure without aborting the scan. Diagnostic only; never mutates.
    pub async fn verify_encryption_integrity(
        &self,
        table: &str,
        fields: &[String],
    ) -> Result<IntegrityReport> {
        let total_records = self.store.count(table, None).await?;
        let mut report = IntegrityReport {
            total_records,
            verified: 0,
            failed: 0,
            errors: Vec::new(),
        };

        let mut columns = vec!["id".to_string()];
        columns.extend(fields.iter().map(|f| encrypted_column(f)));

        let mut offset = 0u64;
        loop {
            let rows = self
                .store
                .select_batch(table, &columns, DEFAULT_BATCH_SIZE, offset)
                .await?;
            if rows.is_empty() {
                break;
            }

            for row in &rows {
                for field in fields {
                    let shadow = encrypted_column(field);
                    let result = match row.get(&shadow) {
                        None | Some(Value::Null) => continue,
                        Some(Value::String(wire)) => match FieldEnvelope::from_wire(wire) {
                            Ok(envelope) => self.cipher.decrypt(&envelope).await.map(|_| ()),
                            Err(e) => Err(e),
                        },
                        Some(_) => Err(FieldVaultError::InvalidEnvelope(
                            "encrypted column does not hold text".to_string(),
                        )),
                    };

                    match result {
                        Ok(()) => report.verified += 1,
                        Err(e) => {
                            report.failed += 1;
                            report.errors.push(IntegrityError {
                                id: row.id.clone(),
                                field: field.clone(),
                                error: e.to_string(),
                            });
                        }
                    }
                }
            }

            offset += rows.len() as u64;
            if (rows.len() as u32) < DEFAULT_BATCH_SIZE {
                break;
            }
        }

        if report.failed > 0 {
            error!(
                table,
                failed = report.failed,
                "integrity verification found undecryptable fields"
            );
        }
        Ok(report)
    }

    /// Per-field encrypted/plaintext/null counts. Read-only; three count
    /// queries per field.
    pub async fn encryption_stats(
        &self,
        table: &str,
        fields: &[String],
    ) -> Result<EncryptionStatsReport> {
        let total_records = self.store.count(table, None).await?;
        let mut field_stats = HashMap::new();

        for field in fields {
            let shadow = encrypted_column(field);
            let encrypted = self
                .store
                .count(table, Some(&format!("{} IS NOT NULL", shadow)))
                .await?;
            let plaintext = self
                .store
                .count(
                    table,
                    Some(&format!("{} IS NOT NULL AND {} IS NULL", field, shadow)),
                )
                .await?;
            let null = self
                .store
                .count(
                    table,
                    Some(&format!("{} IS NULL AND {} IS NULL", field, shadow)),
                )
                .await?;

            field_stats.insert(
                field.clone(),
                FieldStats {
                    encrypted,
                    plaintext,
                    null,
                },
            );
        }

        Ok(EncryptionStatsReport {
            total_records,
            field_stats,
        })
    }

    /// DDL adding one nullable text shadow column per field. Text output
    /// for operator review; never executed by this crate.
    pub fn generate_add_columns_script(table: &str, fields: &[String]) -> String {
        let mut script = String::new();
        script.push_str(&format!("-- Encrypted shadow columns for table {}.\n", table));
        script.push_str("-- Apply before running any data migration against this table.\n");
        for field in fields {
            script.push_str(&format!(
                "ALTER TABLE {} ADD COLUMN {} TEXT;\n",
                table,
                encrypted_column(field)
            ));
        }
        script
    }

    async fn encrypt_existing_inner(&self, plan: &MigrationPlan, total: u64) -> Result<u64> {
        let mut columns = vec!["id".to_string()];
        for field in &plan.fields {
            columns.push(field.clone());
            columns.push(encrypted_column(field));
        }

        let mut offset = 0u64;
        let mut processed = 0u64;
        loop {
            let rows = self
                .store
                .select_batch(&plan.table, &columns, plan.batch_size, offset)
                .await?;
            if rows.is_empty() {
                break;
            }

            for row in &rows {
                let updates = self.stage_row_encryption(row, &plan.fields).await?;
                if !updates.is_empty() {
                    processed += 1;
                    if !plan.dry_run {
                        self.store.update_row(&plan.table, &row.id, &updates).await?;
                    }
                }
            }

            offset += rows.len() as u64;
            debug!(table = %plan.table, scanned = offset, processed, "encryption batch done");
            if let Some(callback) = &plan.on_progress {
                callback(offset.min(total), total);
            }
            if (rows.len() as u32) < plan.batch_size {
                break;
            }
        }
        Ok(processed)
    }

    async fn stage_row_encryption(
        &self,
        row: &StoredRow,
        fields: &[String],
    ) -> Result<Vec<(String, Value)>> {
        let mut updates = Vec::new();
        for field in fields {
            let shadow = encrypted_column(field);
            if row.is_null(field) || !row.is_null(&shadow) {
                continue;
            }

            let value = match row.get(field) {
                Some(value) => value.clone(),
                None => continue,
            };
            if let Value::String(s) = &value {
                if CipherEngine::is_encrypted(s) {
                    continue;
                }
            }

            let Some(envelope) = self.cipher.encrypt(&value).await? else {
                continue;
            };
            updates.push((shadow, Value::String(envelope.to_wire()?)));
        }
        Ok(updates)
    }

    async fn migrate_to_new_key_inner(
        &self,
        plan: &MigrationPlan,
        target: u32,
        total: u64,
    ) -> Result<u64> {
        let mut columns = vec!["id".to_string()];
        columns.extend(plan.fields.iter().map(|f| encrypted_column(f)));

        let mut offset = 0u64;
        let mut processed = 0u64;
        loop {
            let rows = self
                .store
                .select_batch(&plan.table, &columns, plan.batch_size, offset)
                .await?;
            if rows.is_empty() {
                break;
            }

            for row in &rows {
                let mut updates = Vec::new();
                for field in &plan.fields {
                    let shadow = encrypted_column(field);
                    let wire = match row.get(&shadow) {
                        None | Some(Value::Null) => continue,
                        Some(Value::String(wire)) => wire,
                        Some(_) => {
                            return Err(FieldVaultError::InvalidEnvelope(
                                "encrypted column does not hold text".to_string(),
                            ));
                        }
                    };

                    let envelope = FieldEnvelope::from_wire(wire)?;
                    if envelope.version == target {
                        continue;
                    }

                    let reencrypted = self.cipher.reencrypt(&envelope, Some(target)).await?;
                    updates.push((shadow, Value::String(reencrypted.to_wire()?)));
                }

                if !updates.is_empty() {
                    processed += 1;
                    if !plan.dry_run {
                        self.store.update_row(&plan.table, &row.id, &updates).await?;
                    }
                }
            }

            offset += rows.len() as u64;
            debug!(table = %plan.table, scanned = offset, processed, "re-key batch done");
            if let Some(callback) = &plan.on_progress {
                callback(offset.min(total), total);
            }
            if (rows.len() as u32) < plan.batch_size {
                break;
            }
        }
        Ok(processed)
    }

    async fn abort(&self, plan: &MigrationPlan, cause: FieldVaultError) -> Result<u64> {
        if !plan.dry_run {
            if let Err(rollback_err) = self.store.rollback_transaction().await {
                error!(error = %rollback_err, "rollback failed after migration error");
            }
        }
        error!(table = %plan.table, error = %cause, "migration aborted; table unchanged");
        Err(FieldVaultError::MigrationAborted {
            message: cause.to_string(),
        })
    }
}
