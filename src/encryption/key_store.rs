//! Versioned key storage.
//!
//! The [`KeyStorageProvider`] trait is the pluggable backend seam: an
//! environment-variable single key and an in-memory store ship here, and
//! cloud KMS or vault backends implement the same trait out of tree. The
//! [`KeyManager`](super::KeyManager) layers rotation policy, grace periods,
//! and auditing on top; providers only store and retrieve.

use crate::{FieldVaultError, Result, encryption::EncryptionAlgorithm};
use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::{RngCore, rngs::OsRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Raw 32-byte symmetric key material.
///
/// Zeroed on drop. Deliberately not serializable, and `Debug` is redacted;
/// key bytes never reach logs or stored metadata.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial([u8; 32]);

impl KeyMaterial {
    pub const LEN: usize = 32;

    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Generates fresh random key material from the OS RNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; Self::LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Validates length and copies the slice.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::LEN {
            return Err(FieldVaultError::KeyManagement(format!(
                "key material must be {} bytes, got {}",
                Self::LEN,
                bytes.len()
            )));
        }
        let mut material = [0u8; Self::LEN];
        material.copy_from_slice(bytes);
        Ok(Self(material))
    }

    /// Decodes a base64-encoded 32-byte key.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| FieldVaultError::KeyManagement(format!("invalid base64 key: {}", e)))?;
        Self::from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Clone for KeyMaterial {
    fn clone(&self) -> Self {
        Self(self.0)
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyMaterial(..)")
    }
}

/// Lifecycle state of a stored key.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum KeyStatus {
    /// The single current encryption key.
    Active,
    /// Replaced by rotation; still valid for decryption until purged.
    Retired,
}

impl std::fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyStatus::Active => write!(f, "Active"),
            KeyStatus::Retired => write!(f, "Retired"),
        }
    }
}

/// A versioned symmetric key and its lifecycle metadata.
///
/// Immutable once created, except that rotation flips `status` to
/// `Retired` and stamps `retired_at`. Removal from the store is a separate
/// operator-triggered purge.
#[derive(Debug, Clone)]
pub struct EncryptionKey {
    /// Monotonically increasing, starting at 1.
    pub version: u32,
    pub material: KeyMaterial,
    pub algorithm: EncryptionAlgorithm,
    pub created_at: DateTime<Utc>,
    /// When this key should stop being the encryption key, per policy.
    pub expires_at: Option<DateTime<Utc>>,
    pub retired_at: Option<DateTime<Utc>>,
    pub status: KeyStatus,
}

impl EncryptionKey {
    /// Generates a fresh active key for `version`.
    pub fn generate(version: u32, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            version,
            material: KeyMaterial::generate(),
            algorithm: EncryptionAlgorithm::Aes256Gcm,
            created_at: Utc::now(),
            expires_at,
            retired_at: None,
            status: KeyStatus::Active,
        }
    }

    /// True while this key is past `expires_at`.
    pub fn is_expired(&self) -> bool {
        matches!(self.expires_at, Some(at) if Utc::now() >= at)
    }
}

/// Pluggable backend for versioned key storage.
///
/// Implementations must keep at most one `Active` key and retain retired
/// keys until `remove_key` is called. They are not responsible for policy:
/// grace periods, rotation intervals, and audit live in the manager.
#[async_trait]
pub trait KeyStorageProvider: Send + Sync {
    /// Persists a key under its version. Overwrites an existing entry for
    /// the same version.
    async fn store_key(&self, key: EncryptionKey) -> Result<()>;

    /// Fetches a key by version, if it has not been removed.
    async fn get_key(&self, version: u32) -> Result<Option<EncryptionKey>>;

    /// All keys still present in the store (active and retired); every one
    /// of them is decryption-capable until removed.
    async fn list_active_keys(&self) -> Result<Vec<EncryptionKey>>;

    /// Marks a key retired. Idempotent.
    async fn deactivate_key(&self, version: u32) -> Result<()>;

    /// The single `Active` key, if one exists.
    async fn get_current_key(&self) -> Result<Option<EncryptionKey>>;

    /// Highest version ever stored and not yet removed, regardless of
    /// status. Rotation allocates the next version from this.
    async fn latest_version(&self) -> Result<Option<u32>>;

    /// Permanently removes a key. The caller (the manager's purge path) is
    /// responsible for grace-period checks.
    async fn remove_key(&self, version: u32) -> Result<()>;
}

/// In-memory provider for development and tests.
#[derive(Default)]
pub struct MemoryKeyStore {
    keys: RwLock<HashMap<u32, EncryptionKey>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyStorageProvider for MemoryKeyStore {
    async fn store_key(&self, key: EncryptionKey) -> Result<()> {
        self.keys.write().await.insert(key.version, key);
        Ok(())
    }

    async fn get_key(&self, version: u32) -> Result<Option<EncryptionKey>> {
        Ok(self.keys.read().await.get(&version).cloned())
    }

    async fn list_active_keys(&self) -> Result<Vec<EncryptionKey>> {
        let mut keys: Vec<_> = self.keys.read().await.values().cloned().collect();
        keys.sort_by_key(|k| k.version);
        Ok(keys)
    }

    async fn deactivate_key(&self, version: u32) -> Result<()> {
        if let Some(key) = self.keys.write().await.get_mut(&version) {
            if key.status == KeyStatus::Active {
                key.status = KeyStatus::Retired;
                key.retired_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn get_current_key(&self) -> Result<Option<EncryptionKey>> {
        Ok(self
            .keys
            .read()
            .await
            .values()
            .filter(|k| k.status == KeyStatus::Active)
            .max_by_key(|k| k.version)
            .cloned())
    }

    async fn latest_version(&self) -> Result<Option<u32>> {
        Ok(self.keys.read().await.keys().max().copied())
    }

    async fn remove_key(&self, version: u32) -> Result<()> {
        self.keys.write().await.remove(&version);
        Ok(())
    }
}

/// Single-key provider backed by an environment variable.
///
/// The variable holds a base64-encoded 32-byte key, exposed as version 1.
/// Read-only: rotation against this provider fails, which is the correct
/// behavior for deployments that rotate by redeploying the variable.
pub struct EnvKeyStore {
    var_name: String,
}

impl EnvKeyStore {
    pub fn new(var_name: impl Into<String>) -> Self {
        Self {
            var_name: var_name.into(),
        }
    }

    fn load(&self) -> Result<EncryptionKey> {
        let encoded = std::env::var(&self.var_name).map_err(|_| {
            FieldVaultError::KeyManagement(format!(
                "environment variable {} not found",
                self.var_name
            ))
        })?;
        let material = KeyMaterial::from_base64(&encoded)?;
        Ok(EncryptionKey {
            version: 1,
            material,
            algorithm: EncryptionAlgorithm::Aes256Gcm,
            created_at: Utc::now(),
            expires_at: None,
            retired_at: None,
            status: KeyStatus::Active,
        })
    }

    fn read_only_error(&self) -> FieldVaultError {
        FieldVaultError::KeyManagement(format!(
            "key provider backed by {} is read-only",
            self.var_name
        ))
    }
}

#[async_trait]
impl KeyStorageProvider for EnvKeyStore {
    async fn store_key(&self, _key: EncryptionKey) -> Result<()> {
        Err(self.read_only_error())
    }

    async fn get_key(&self, version: u32) -> Result<Option<EncryptionKey>> {
        if version == 1 {
            Ok(Some(self.load()?))
        } else {
            Ok(None)
        }
    }

    async fn list_active_keys(&self) -> Result<Vec<EncryptionKey>> {
        Ok(vec![self.load()?])
    }

    async fn deactivate_key(&self, _version: u32) -> Result<()> {
        Err(self.read_only_error())
    }

    async fn get_current_key(&self) -> Result<Option<EncryptionKey>> {
        Ok(Some(self.load()?))
    }

    async fn latest_version(&self) -> Result<Option<u32>> {
        Ok(Some(1))
    }

    async fn remove_key(&self, _version: u32) -> Result<()> {
        Err(self.read_only_error())
    }
}
