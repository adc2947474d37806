//! Key lifecycle policy: rotation, grace periods, and auditing.
//!
//! The manager owns a [`KeyStorageProvider`] and layers policy on top of it:
//! which key is current, how long retired keys stay decryption-valid, when
//! rotation is due, and an append-only audit trail of every operation that
//! touches key material.
//!
//! # Rotation and the grace period
//!
//! `rotate_keys` retires the current key and installs a fresh one under the
//! next version. Retired keys remain retrievable for decryption for
//! `grace_period_days`; after that an operator may purge them explicitly.
//! Nothing purges automatically: an unattended timer that destroys key
//! material can destroy data with it.

use crate::{
    FieldVaultError, Result,
    encryption::key_store::{EncryptionKey, KeyMaterial, KeyStatus, KeyStorageProvider},
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Upper bound on retained audit entries; the oldest are dropped first.
const AUDIT_LOG_CAPACITY: usize = 10_000;

/// Governs when keys rotate and how long retired keys stay valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyRotationPolicy {
    /// Lifetime of a key as the active encryption key, in days.
    pub rotation_interval_days: u32,

    /// How long a retired key remains decryption-valid, in days.
    pub grace_period_days: u32,

    /// Whether [`KeyManager::rotate_if_due`] performs rotations. Scheduling
    /// the check is the caller's job; this crate runs no timers.
    pub auto_rotate: bool,

    /// How many days before expiry health checks start warning.
    pub notify_before_days: u32,
}

impl Default for KeyRotationPolicy {
    fn default() -> Self {
        Self {
            rotation_interval_days: 90,
            grace_period_days: 30,
            auto_rotate: false,
            notify_before_days: 30,
        }
    }
}

impl KeyRotationPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rotation_interval_days(mut self, days: u32) -> Self {
        self.rotation_interval_days = days;
        self
    }

    pub fn with_grace_period_days(mut self, days: u32) -> Self {
        self.grace_period_days = days;
        self
    }

    pub fn with_auto_rotate(mut self, enabled: bool) -> Self {
        self.auto_rotate = enabled;
        self
    }

    pub fn with_notify_before_days(mut self, days: u32) -> Self {
        self.notify_before_days = days;
        self
    }
}

/// Operations recorded in the audit trail.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditOperation {
    Encrypt,
    Decrypt,
    Rotate,
    KeyAccess,
    Purge,
}

impl std::fmt::Display for AuditOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuditOperation::Encrypt => write!(f, "encrypt"),
            AuditOperation::Decrypt => write!(f, "decrypt"),
            AuditOperation::Rotate => write!(f, "rotate"),
            AuditOperation::KeyAccess => write!(f, "key_access"),
            AuditOperation::Purge => write!(f, "purge"),
        }
    }
}

/// One append-only audit record. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: Uuid,
    pub operation: AuditOperation,
    /// Identifier of the record the operation was performed for, when the
    /// caller supplied one.
    pub entity_ref: Option<String>,
    /// Field the operation was performed for, when known.
    pub field_name: Option<String>,
    pub key_version: Option<u32>,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub error_message: Option<String>,
}

/// Snapshot of the rotation state for operators and health checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationStatus {
    pub current_version: u32,
    pub expires_at: Option<DateTime<Utc>>,
    pub days_until_expiration: Option<i64>,
    pub auto_rotate_enabled: bool,
    pub grace_period_days: u32,
}

/// Policy layer over a [`KeyStorageProvider`].
///
/// Read paths (`key_material`, `current_key_version`, `active_keys`) are
/// safe to call concurrently. `rotate_keys` is serialized by an internal
/// single-writer lock; multi-process deployments must additionally
/// serialize rotation externally.
pub struct KeyManager {
    store: Box<dyn KeyStorageProvider>,
    policy: KeyRotationPolicy,
    rotation_lock: tokio::sync::Mutex<()>,
    audit: Mutex<VecDeque<AuditLogEntry>>,
}

impl KeyManager {
    pub fn new(store: Box<dyn KeyStorageProvider>, policy: KeyRotationPolicy) -> Self {
        Self {
            store,
            policy,
            rotation_lock: tokio::sync::Mutex::new(()),
            audit: Mutex::new(VecDeque::new()),
        }
    }

    pub fn policy(&self) -> &KeyRotationPolicy {
        &self.policy
    }

    /// Version of the current active key.
    pub async fn current_key_version(&self) -> Result<u32> {
        match self.store.get_current_key().await? {
            Some(key) => Ok(key.version),
            None => Err(FieldVaultError::NoActiveKey),
        }
    }

    /// Key material for `version`.
    ///
    /// Succeeds for any version still present in the store, including
    /// retired keys; presence is what makes an envelope decryptable.
    /// Purged or never-issued versions fail with `UnknownKeyVersion`.
    pub async fn key_material(&self, version: u32) -> Result<KeyMaterial> {
        match self.store.get_key(version).await? {
            Some(key) => {
                self.record_operation(AuditOperation::KeyAccess, Some(version), true, None);
                Ok(key.material.clone())
            }
            None => {
                self.record_operation(
                    AuditOperation::KeyAccess,
                    Some(version),
                    false,
                    Some("unknown key version".to_string()),
                );
                Err(FieldVaultError::UnknownKeyVersion { version })
            }
        }
    }

    /// All keys currently valid for decryption: the active key plus retired
    /// keys still inside the grace period.
    pub async fn active_keys(&self) -> Result<Vec<EncryptionKey>> {
        let keys = self.store.list_active_keys().await?;
        Ok(keys
            .into_iter()
            .filter(|key| match key.status {
                KeyStatus::Active => true,
                KeyStatus::Retired => self.within_grace_period(key),
            })
            .collect())
    }

    /// Generates a new key, retires the previous active key, and returns
    /// the new version.
    ///
    /// The whole sequence runs under a single-writer lock: concurrent
    /// callers queue, and each produces a distinct version. The old key is
    /// marked retired in the provider before the new version is stored, so
    /// a crash in between never leaves two active keys.
    pub async fn rotate_keys(&self) -> Result<u32> {
        let _guard = self.rotation_lock.lock().await;

        let previous = self.store.get_current_key().await?;
        if let Some(prev) = &previous {
            self.store.deactivate_key(prev.version).await?;
        }

        let next_version = self.store.latest_version().await?.map_or(1, |v| v + 1);
        match self.install_key(next_version).await {
            Ok(()) => {
                self.record_operation(AuditOperation::Rotate, Some(next_version), true, None);
                info!(
                    previous = previous.as_ref().map(|k| k.version),
                    version = next_version,
                    "rotated field encryption key"
                );
                Ok(next_version)
            }
            Err(e) => {
                self.record_operation(
                    AuditOperation::Rotate,
                    Some(next_version),
                    false,
                    Some(e.to_string()),
                );
                Err(e)
            }
        }
    }

    /// Creates the first key when the store is empty, or repairs a store
    /// left without an active key. Returns the active version.
    pub async fn ensure_key(&self) -> Result<u32> {
        if let Some(key) = self.store.get_current_key().await? {
            return Ok(key.version);
        }

        let _guard = self.rotation_lock.lock().await;
        // Re-check under the lock; another caller may have won the race.
        if let Some(key) = self.store.get_current_key().await? {
            return Ok(key.version);
        }

        let version = self.store.latest_version().await?.map_or(1, |v| v + 1);
        if version > 1 {
            warn!(version, "no active key found; installing a fresh version");
        }
        self.install_key(version).await?;
        self.record_operation(AuditOperation::Rotate, Some(version), true, None);
        Ok(version)
    }

    /// Rotates when `auto_rotate` is enabled and the active key has passed
    /// its expiry. Returns the new version if a rotation happened.
    pub async fn rotate_if_due(&self) -> Result<Option<u32>> {
        if !self.policy.auto_rotate {
            return Ok(None);
        }

        let due = match self.store.get_current_key().await? {
            Some(key) => key.is_expired(),
            None => true,
        };

        if due {
            let version = self.rotate_keys().await?;
            Ok(Some(version))
        } else {
            debug!("active key is not due for rotation");
            Ok(None)
        }
    }

    /// Rotation state snapshot for operators and the health monitor.
    pub async fn rotation_status(&self) -> Result<RotationStatus> {
        let key = self
            .store
            .get_current_key()
            .await?
            .ok_or(FieldVaultError::NoActiveKey)?;

        let days_until_expiration = key.expires_at.map(|at| (at - Utc::now()).num_days());
        Ok(RotationStatus {
            current_version: key.version,
            expires_at: key.expires_at,
            days_until_expiration,
            auto_rotate_enabled: self.policy.auto_rotate,
            grace_period_days: self.policy.grace_period_days,
        })
    }

    /// Permanently removes a retired key that has left its grace period.
    ///
    /// Operator-triggered only; refuses to purge the active key or a key
    /// still inside the grace period, since envelopes tagged with it would
    /// become undecryptable.
    pub async fn purge_key(&self, version: u32) -> Result<()> {
        let key = self
            .store
            .get_key(version)
            .await?
            .ok_or(FieldVaultError::UnknownKeyVersion { version })?;

        if key.status == KeyStatus::Active {
            return Err(FieldVaultError::KeyManagement(format!(
                "cannot purge active key version {}",
                version
            )));
        }
        if self.within_grace_period(&key) {
            return Err(FieldVaultError::KeyManagement(format!(
                "key version {} is still inside its {}-day grace period",
                version, self.policy.grace_period_days
            )));
        }

        self.store.remove_key(version).await?;
        self.record_operation(AuditOperation::Purge, Some(version), true, None);
        info!(version, "purged retired encryption key");
        Ok(())
    }

    /// Most recent audit entries, newest first.
    pub fn audit_logs(&self, limit: usize) -> Vec<AuditLogEntry> {
        let audit = self.audit.lock().unwrap_or_else(|e| e.into_inner());
        audit.iter().rev().take(limit).cloned().collect()
    }

    pub(crate) fn record_operation(
        &self,
        operation: AuditOperation,
        key_version: Option<u32>,
        success: bool,
        error_message: Option<String>,
    ) {
        let entry = AuditLogEntry {
            id: Uuid::new_v4(),
            operation,
            entity_ref: None,
            field_name: None,
            key_version,
            timestamp: Utc::now(),
            success,
            error_message,
        };

        let mut audit = self.audit.lock().unwrap_or_else(|e| e.into_inner());
        if audit.len() >= AUDIT_LOG_CAPACITY {
            audit.pop_front();
        }
        audit.push_back(entry);
    }

    async fn install_key(&self, version: u32) -> Result<()> {
        let expires_at = if self.policy.rotation_interval_days > 0 {
            Some(Utc::now() + Duration::days(self.policy.rotation_interval_days as i64))
        } else {
            None
        };
        self.store
            .store_key(EncryptionKey::generate(version, expires_at))
            .await
    }

    fn within_grace_period(&self, key: &EncryptionKey) -> bool {
        let grace = Duration::days(self.policy.grace_period_days as i64);
        match key.retired_at {
            Some(retired_at) => Utc::now() < retired_at + grace,
            // A retired key without a retirement timestamp is kept valid
            // rather than silently invalidated.
            None => true,
        }
    }
}
