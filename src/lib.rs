//! # FieldVault
//!
//! A field-level encryption engine for protecting sensitive record data
//! (PHI, payment details, credentials) in relational stores, without
//! downtime and without trusting the store with plaintext.
//!
//! ## Features
//!
//! - **Authenticated encryption**: AES-256-GCM envelopes with per-value
//!   random IVs and optional additional authenticated data
//! - **Versioned keys**: every envelope is tagged with the key version that
//!   produced it, so rotation never breaks existing data
//! - **Rotation with a grace period**: retired keys keep decrypting until
//!   an operator explicitly purges them
//! - **Batch migration**: transactional bulk encryption of existing
//!   plaintext and re-encryption under new key versions, all-or-nothing
//! - **Integrity verification**: decrypt-everything diagnostic scans that
//!   report failures row by row without mutating anything
//! - **Pluggable backends**: key storage and the tabular store are trait
//!   seams; an in-memory store ships for tests and PostgreSQL support is a
//!   feature flag
//! - **Health checks**: round-trip probes and key-expiry warnings for
//!   readiness and liveness endpoints
//!
//! ## Quick Start
//!
//! ```rust
//! use fieldvault::{FieldVault, config::FieldVaultConfig};
//! use serde_json::json;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> fieldvault::Result<()> {
//!     let vault = FieldVault::from_config(FieldVaultConfig::new().with_memory_keys()).await?;
//!
//!     // Encrypt a field value; the envelope replaces the plaintext at rest.
//!     let envelope = vault.cipher().encrypt(&json!("123-45-6789")).await?.unwrap();
//!     assert_eq!(envelope.version, 1);
//!
//!     // Rotate; old envelopes keep decrypting during the grace period.
//!     vault.key_manager().rotate_keys().await?;
//!     assert_eq!(vault.cipher().decrypt(&envelope).await?, json!("123-45-6789"));
//!
//!     // Move the envelope forward to the new key.
//!     let rotated = vault.cipher().reencrypt(&envelope, None).await?;
//!     assert_eq!(rotated.version, 2);
//!     Ok(())
//! }
//! ```
//!
//! ## Core Concepts
//!
//! ### Envelopes
//!
//! An encrypted field is stored as an opaque JSON envelope carrying the key
//! version, IV, auth tag, ciphertext, algorithm tag, and a timestamp.
//! Consumers must reject unrecognized algorithm tags, and a failed
//! decryption is always an error, never a hint that the value was
//! plaintext.
//!
//! ### Key lifecycle
//!
//! Keys are versioned monotonically. Exactly one key is active for
//! encryption; rotation retires it (still decryption-valid for the grace
//! period) and installs the next version. Purging a retired key is a
//! separate operator action; nothing destroys key material on a timer.
//!
//! ### Migration
//!
//! The migration engine scans tables in primary-key order and writes
//! envelopes into `<field>_encrypted` shadow columns, inside one store
//! transaction per run: any error rolls the whole run back. Schema changes
//! are emitted as DDL text for operator review, never executed.
//!
//! ## Feature Flags
//!
//! - `postgres` - sqlx-backed PostgreSQL implementation of the store trait

pub mod config;
pub mod encryption;
pub mod error;
pub mod health;
pub mod migration;
pub mod registry;
pub mod store;
pub mod vault;

pub use config::{FieldVaultConfig, KeySourceConfig, MigrationDefaults};
pub use encryption::{
    AuditLogEntry, AuditOperation, BatchOptions, BatchOutcome, CipherEngine, CipherStats,
    EncryptOptions, EncryptionAlgorithm, EncryptionKey, FieldEnvelope, KeyManager,
    KeyRotationPolicy, KeyStatus, KeyStorageProvider, PartialFailureMode, RotationStatus,
};
pub use error::FieldVaultError;
pub use health::{HealthMonitor, HealthReport};
pub use migration::{
    EncryptionStatsReport, FieldStats, IntegrityError, IntegrityReport, MigrationEngine,
    MigrationPlan,
};
pub use registry::EncryptedFieldRegistry;
pub use store::{MemoryStore, Store, StoredRow};
pub use vault::FieldVault;

#[cfg(feature = "postgres")]
pub use store::PostgresStore;

/// Convenient type alias for Results with [`FieldVaultError`] as the error
/// type.
///
/// This is used throughout the crate for consistent error handling.
pub type Result<T> = std::result::Result<T, FieldVaultError>;
