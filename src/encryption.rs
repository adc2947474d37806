//! Field-level encryption for sensitive record data.
//!
//! This module provides authenticated encryption of individual record fields
//! (PHI, payment data, credentials) using AES-256-GCM, with versioned keys so
//! that data encrypted under a retired key remains readable during its grace
//! period while all new encryption uses the current key.
//!
//! # Examples
//!
//! ## Encrypting and decrypting a field
//!
//! ```rust,no_run
//! use fieldvault::encryption::{CipherEngine, KeyManager, KeyRotationPolicy};
//! use fieldvault::encryption::key_store::MemoryKeyStore;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn example() -> fieldvault::Result<()> {
//! let manager = Arc::new(KeyManager::new(
//!     Box::new(MemoryKeyStore::new()),
//!     KeyRotationPolicy::default(),
//! ));
//! manager.ensure_key().await?;
//!
//! let engine = CipherEngine::new(manager);
//! let envelope = engine.encrypt(&json!("123-45-6789")).await?.unwrap();
//! let plaintext = engine.decrypt(&envelope).await?;
//! assert_eq!(plaintext, json!("123-45-6789"));
//! # Ok(())
//! # }
//! ```
//!
//! ## Rotating keys
//!
//! ```rust,no_run
//! # use fieldvault::encryption::{KeyManager, KeyRotationPolicy};
//! # use fieldvault::encryption::key_store::MemoryKeyStore;
//! # async fn example() -> fieldvault::Result<()> {
//! # let manager = KeyManager::new(Box::new(MemoryKeyStore::new()), KeyRotationPolicy::default());
//! let new_version = manager.rotate_keys().await?;
//! // Envelopes tagged with earlier versions keep decrypting until their
//! // key leaves the grace period and an operator purges it.
//! # Ok(())
//! # }
//! ```

pub mod engine;
pub mod envelope;
pub mod key_manager;
pub mod key_store;

pub use engine::CipherEngine;
pub use envelope::FieldEnvelope;
pub use key_manager::{
    AuditLogEntry, AuditOperation, KeyManager, KeyRotationPolicy, RotationStatus,
};
pub use key_store::{
    EncryptionKey, EnvKeyStore, KeyMaterial, KeyStatus, KeyStorageProvider, MemoryKeyStore,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Supported authenticated-encryption algorithms.
///
/// The engine currently encrypts exclusively with AES-256-GCM; the enum
/// exists so that envelopes carrying an unrecognized algorithm tag are
/// rejected at decrypt time instead of being fed to the wrong cipher.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EncryptionAlgorithm {
    /// AES-256 in Galois/Counter Mode. 32-byte keys, 12-byte nonces,
    /// 16-byte authentication tags.
    Aes256Gcm,
}

impl EncryptionAlgorithm {
    /// The wire-format tag stored inside envelopes.
    pub fn as_str(&self) -> &'static str {
        match self {
            EncryptionAlgorithm::Aes256Gcm => "aes-256-gcm",
        }
    }

    /// Parses a wire-format tag. Returns `None` for unrecognized tags.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "aes-256-gcm" => Some(EncryptionAlgorithm::Aes256Gcm),
            _ => None,
        }
    }

    /// Key size in bytes.
    pub fn key_size_bytes(&self) -> usize {
        32
    }

    /// Nonce/IV size in bytes.
    pub fn nonce_size_bytes(&self) -> usize {
        12
    }

    /// Authentication tag size in bytes.
    pub fn tag_size_bytes(&self) -> usize {
        16
    }
}

impl Default for EncryptionAlgorithm {
    fn default() -> Self {
        Self::Aes256Gcm
    }
}

impl std::fmt::Display for EncryptionAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-call options for [`CipherEngine::encrypt_with_options`].
#[derive(Clone, Default)]
pub struct EncryptOptions {
    /// Encrypt under a specific key version instead of the current active
    /// version. The version must still be retrievable from the key manager.
    pub key_version: Option<u32>,

    /// Additional authenticated data bound into the GCM tag without being
    /// encrypted. Decryption must supply the same bytes.
    pub aad: Option<Vec<u8>>,

    /// Produce an envelope even for `null` values. By default encrypting
    /// `null` yields no envelope.
    pub encrypt_null: bool,
}

impl EncryptOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key_version(mut self, version: u32) -> Self {
        self.key_version = Some(version);
        self
    }

    pub fn with_aad(mut self, aad: impl Into<Vec<u8>>) -> Self {
        self.aad = Some(aad.into());
        self
    }

    pub fn with_encrypt_null(mut self, encrypt_null: bool) -> Self {
        self.encrypt_null = encrypt_null;
        self
    }
}

/// Strategies for handling per-item failures within a batch operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PartialFailureMode {
    /// Record the error, leave a gap in the results, and keep going.
    ContinueOnError,
    /// Abort the whole batch on the first failing item.
    FailFast,
}

impl Default for PartialFailureMode {
    fn default() -> Self {
        Self::ContinueOnError
    }
}

/// Progress callback: `(items_done, items_total)`.
pub type ProgressCallback = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// Options for [`CipherEngine::batch_encrypt`] / [`CipherEngine::batch_decrypt`].
#[derive(Clone)]
pub struct BatchOptions {
    /// Chunk size per processing round.
    pub batch_size: usize,

    /// Fan the items of each chunk out onto the runtime instead of
    /// processing them sequentially. Bounded by `batch_size`.
    pub parallel: bool,

    /// What to do when a single item fails.
    pub failure_mode: PartialFailureMode,

    /// Invoked after each chunk with `(done, total)`.
    pub on_progress: Option<ProgressCallback>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            batch_size: 100,
            parallel: false,
            failure_mode: PartialFailureMode::default(),
            on_progress: None,
        }
    }
}

impl BatchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_failure_mode(mut self, mode: PartialFailureMode) -> Self {
        self.failure_mode = mode;
        self
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.on_progress = Some(callback);
        self
    }
}

/// A single failed item inside a batch run in `ContinueOnError` mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItemError {
    /// Index of the failing item in the input slice.
    pub index: usize,
    /// Rendered error message.
    pub error: String,
}

/// Outcome of a batch operation.
///
/// `results` is positionally aligned with the input: `None` marks items that
/// were skipped (`null` inputs) or failed in `ContinueOnError` mode.
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome<T> {
    pub results: Vec<Option<T>>,
    pub errors: Vec<BatchItemError>,
}

impl<T> BatchOutcome<T> {
    /// Number of successfully processed items.
    pub fn success_count(&self) -> usize {
        self.results.iter().filter(|r| r.is_some()).count()
    }

    /// True when no item failed.
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Operation counters maintained by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CipherStats {
    pub encrypt_ops: u64,
    pub decrypt_ops: u64,
    pub reencrypt_ops: u64,
    pub hmac_ops: u64,
    pub encrypt_errors: u64,
    pub decrypt_errors: u64,
    pub last_updated: DateTime<Utc>,
}

impl Default for CipherStats {
    fn default() -> Self {
        Self {
            encrypt_ops: 0,
            decrypt_ops: 0,
            reencrypt_ops: 0,
            hmac_ops: 0,
            encrypt_errors: 0,
            decrypt_errors: 0,
            last_updated: Utc::now(),
        }
    }
}
