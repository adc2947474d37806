//! Configuration for the encryption subsystem.
//!
//! Covers where key material comes from, the rotation policy, and batch
//! migration defaults. Configurations round-trip through TOML so
//! deployments can keep them in a reviewed file. The key itself never
//! appears in the file, only the name of the environment variable that
//! holds it.
//!
//! # Examples
//!
//! ```rust
//! use fieldvault::config::FieldVaultConfig;
//! use fieldvault::encryption::KeyRotationPolicy;
//!
//! let config = FieldVaultConfig::new()
//!     .with_env_key("APP_FIELD_KEY")
//!     .with_rotation(KeyRotationPolicy::default().with_rotation_interval_days(60))
//!     .with_migration_batch_size(1000);
//!
//! assert_eq!(config.rotation.rotation_interval_days, 60);
//! ```

use crate::{
    Result,
    encryption::{
        KeyRotationPolicy,
        key_store::{EnvKeyStore, KeyStorageProvider, MemoryKeyStore},
    },
    migration::DEFAULT_BATCH_SIZE,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default environment variable consulted for key material.
pub const DEFAULT_KEY_ENV_VAR: &str = "FIELDVAULT_MASTER_KEY";

/// Where the key store gets its key material.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum KeySourceConfig {
    /// Base64-encoded 32-byte key in the named environment variable,
    /// exposed as version 1. Read-only; rotation happens by redeploying
    /// the variable.
    Environment(String),

    /// In-memory key store with generated keys. Keys do not survive the
    /// process; development and tests only.
    Memory,
}

impl Default for KeySourceConfig {
    fn default() -> Self {
        Self::Environment(DEFAULT_KEY_ENV_VAR.to_string())
    }
}

/// Defaults applied to migration plans built from this configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationDefaults {
    pub batch_size: u32,
    pub dry_run: bool,
}

impl Default for MigrationDefaults {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            dry_run: false,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct FieldVaultConfig {
    pub key_source: KeySourceConfig,
    pub rotation: KeyRotationPolicy,
    pub migration: MigrationDefaults,
}

impl FieldVaultConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads key material from the named environment variable.
    pub fn with_env_key(mut self, var_name: &str) -> Self {
        self.key_source = KeySourceConfig::Environment(var_name.to_string());
        self
    }

    /// Uses an in-memory key store with generated keys.
    pub fn with_memory_keys(mut self) -> Self {
        self.key_source = KeySourceConfig::Memory;
        self
    }

    pub fn with_rotation(mut self, rotation: KeyRotationPolicy) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_migration_batch_size(mut self, batch_size: u32) -> Self {
        self.migration.batch_size = batch_size;
        self
    }

    /// Loads a TOML configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Writes the configuration as TOML.
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Loads `path` if it exists, otherwise returns defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        if path.as_ref().exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Instantiates the key storage provider this configuration names.
    pub fn build_key_store(&self) -> Box<dyn KeyStorageProvider> {
        match &self.key_source {
            KeySourceConfig::Environment(var_name) => Box::new(EnvKeyStore::new(var_name.clone())),
            KeySourceConfig::Memory => Box::new(MemoryKeyStore::new()),
        }
    }
}
