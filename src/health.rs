//! Periodic self-check for the encryption subsystem.
//!
//! Deployments wire [`HealthMonitor::check_health`] into their readiness
//! endpoint and [`HealthMonitor::is_healthy`] into liveness probes. The
//! full check exercises a real encrypt→decrypt round trip, so a broken key
//! store or corrupted key surfaces here before it surfaces in a request.

use crate::encryption::{CipherEngine, KeyManager};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

/// Fixed probe value for the round-trip check.
const PROBE_VALUE: &str = "fieldvault-health-probe";

/// How many decryption-valid keys are considered normal before the monitor
/// flags rotation hygiene.
const LIVE_KEY_WARNING_THRESHOLD: usize = 5;

/// Outcome of a full health check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// True when no errors were found. Warnings do not affect this.
    pub healthy: bool,
    pub key_available: bool,
    pub key_version: Option<u32>,
    pub days_until_expiration: Option<i64>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

#[derive(Clone)]
pub struct HealthMonitor {
    key_manager: Arc<KeyManager>,
    cipher: CipherEngine,
}

impl HealthMonitor {
    pub fn new(key_manager: Arc<KeyManager>, cipher: CipherEngine) -> Self {
        Self {
            key_manager,
            cipher,
        }
    }

    /// Full self-check: key availability, expiry, rotation hygiene, and an
    /// encrypt→decrypt round trip of a fixed probe value.
    pub async fn check_health(&self) -> HealthReport {
        let mut report = HealthReport {
            healthy: true,
            key_available: false,
            key_version: None,
            days_until_expiration: None,
            warnings: Vec::new(),
            errors: Vec::new(),
        };

        match self.key_manager.rotation_status().await {
            Ok(status) => {
                report.key_available = true;
                report.key_version = Some(status.current_version);
                report.days_until_expiration = status.days_until_expiration;

                if let Some(days) = status.days_until_expiration {
                    if days < 0 {
                        report
                            .errors
                            .push("active encryption key has expired".to_string());
                    } else if days <= self.key_manager.policy().notify_before_days as i64 {
                        report
                            .warnings
                            .push(format!("active encryption key expires in {} days", days));
                    }
                }
                if !status.auto_rotate_enabled {
                    report
                        .warnings
                        .push("automatic key rotation is disabled".to_string());
                }
            }
            Err(e) => {
                report.errors.push(format!("no active encryption key: {}", e));
            }
        }

        match self.key_manager.active_keys().await {
            Ok(keys) if keys.len() > LIVE_KEY_WARNING_THRESHOLD => {
                report.warnings.push(format!(
                    "{} keys are decryption-valid; consider purging retired keys past their grace period",
                    keys.len()
                ));
            }
            Ok(_) => {}
            Err(e) => {
                report.errors.push(format!("cannot enumerate keys: {}", e));
            }
        }

        if report.key_available {
            if let Err(message) = self.round_trip_probe().await {
                report.errors.push(message);
            }
        }

        report.healthy = report.errors.is_empty();
        if !report.healthy {
            warn!(errors = report.errors.len(), "encryption health check failed");
        }
        report
    }

    /// Cheap liveness variant: does an active key resolve?
    pub async fn is_healthy(&self) -> bool {
        self.key_manager.current_key_version().await.is_ok()
    }

    async fn round_trip_probe(&self) -> std::result::Result<(), String> {
        let probe = json!(PROBE_VALUE);
        let envelope = self
            .cipher
            .encrypt(&probe)
            .await
            .map_err(|e| format!("round-trip probe encryption failed: {}", e))?
            .ok_or_else(|| "round-trip probe produced no envelope".to_string())?;

        let decrypted = self
            .cipher
            .decrypt(&envelope)
            .await
            .map_err(|e| format!("round-trip probe decryption failed: {}", e))?;

        if decrypted != probe {
            return Err("round-trip probe mismatch".to_string());
        }
        Ok(())
    }
}
