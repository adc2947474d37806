//! Wiring entry point: configuration in, ready-to-use components out.

use crate::{
    FieldVaultError, Result,
    config::{FieldVaultConfig, KeySourceConfig},
    encryption::{CipherEngine, KeyManager},
    health::HealthMonitor,
    migration::{MigrationEngine, MigrationPlan},
    registry::EncryptedFieldRegistry,
    store::Store,
};
use std::sync::Arc;

/// The assembled encryption subsystem.
///
/// # Examples
///
/// ```rust
/// use fieldvault::{FieldVault, config::FieldVaultConfig};
/// use serde_json::json;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> fieldvault::Result<()> {
/// let vault = FieldVault::from_config(FieldVaultConfig::new().with_memory_keys()).await?;
///
/// let envelope = vault.cipher().encrypt(&json!("415-555-1234")).await?.unwrap();
/// assert_eq!(vault.cipher().decrypt(&envelope).await?, json!("415-555-1234"));
/// assert!(vault.health().is_healthy().await);
/// # Ok(())
/// # }
/// ```
pub struct FieldVault {
    config: FieldVaultConfig,
    key_manager: Arc<KeyManager>,
    cipher: CipherEngine,
    health: HealthMonitor,
}

impl FieldVault {
    /// Builds the key store, key manager, cipher engine, and health monitor
    /// from a configuration, and verifies an active key is resolvable.
    ///
    /// With a memory key source the first key is generated here; with an
    /// environment source the variable must already hold a valid key.
    pub async fn from_config(config: FieldVaultConfig) -> Result<Self> {
        let key_manager = Arc::new(KeyManager::new(
            config.build_key_store(),
            config.rotation.clone(),
        ));

        match &config.key_source {
            KeySourceConfig::Memory => {
                key_manager.ensure_key().await?;
            }
            KeySourceConfig::Environment(_) => {
                key_manager.current_key_version().await?;
            }
        }

        let cipher = CipherEngine::new(key_manager.clone());
        let health = HealthMonitor::new(key_manager.clone(), cipher.clone());

        Ok(Self {
            config,
            key_manager,
            cipher,
            health,
        })
    }

    pub fn config(&self) -> &FieldVaultConfig {
        &self.config
    }

    pub fn cipher(&self) -> &CipherEngine {
        &self.cipher
    }

    pub fn key_manager(&self) -> &Arc<KeyManager> {
        &self.key_manager
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    /// Attaches a store adapter and returns a migration engine sharing this
    /// vault's cipher and key manager.
    pub fn migration_engine(&self, store: Arc<dyn Store>) -> MigrationEngine {
        MigrationEngine::new(store, self.cipher.clone(), self.key_manager.clone())
    }

    /// Builds a migration plan for a registered record type using the
    /// configured migration defaults.
    pub fn plan_for(&self, registry: &EncryptedFieldRegistry, table: &str) -> Result<MigrationPlan> {
        let fields = registry.fields_for(table);
        if fields.is_empty() {
            return Err(FieldVaultError::Configuration(format!(
                "no encrypted fields registered for record type {}",
                table
            )));
        }

        Ok(MigrationPlan::new(table, fields)
            .with_batch_size(self.config.migration.batch_size)
            .with_dry_run(self.config.migration.dry_run))
    }
}
