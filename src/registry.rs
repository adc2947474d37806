//! Static registry of which fields need encryption.
//!
//! Record types declare their sensitive fields here explicitly, and the
//! migration and persistence layers consult the registry imperatively.
//! There is no attribute scanning, no property interception, and no hidden
//! dirty-flag state: the encryption boundary is a plain function call at
//! the point of persistence, with the field list coming from this mapping.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// Maps a record-type identifier (usually the table name) to the ordered
/// list of its fields requiring encryption.
#[derive(Default)]
pub struct EncryptedFieldRegistry {
    entries: RwLock<HashMap<String, Vec<String>>>,
}

/// Serializable snapshot of a registry's contents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistrySnapshot {
    pub entries: HashMap<String, Vec<String>>,
}

impl EncryptedFieldRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares the encrypted fields for a record type, replacing any
    /// previous declaration. Duplicate field names are dropped, first
    /// occurrence wins.
    pub fn register(&self, record_type: impl Into<String>, fields: Vec<String>) {
        let mut deduped = Vec::with_capacity(fields.len());
        for field in fields {
            if !deduped.contains(&field) {
                deduped.push(field);
            }
        }
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(record_type.into(), deduped);
    }

    /// The declared fields for a record type, in declaration order. Empty
    /// when the type was never registered.
    pub fn fields_for(&self, record_type: &str) -> Vec<String> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(record_type)
            .cloned()
            .unwrap_or_default()
    }

    /// Whether `field` of `record_type` is declared as encrypted.
    pub fn is_registered(&self, record_type: &str, field: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(record_type)
            .is_some_and(|fields| fields.iter().any(|f| f == field))
    }

    /// All registered record types, sorted.
    pub fn record_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }

    pub fn is_empty(&self) -> bool {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }

    /// Copies the current contents for export or inspection.
    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            entries: self
                .entries
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let registry = EncryptedFieldRegistry::new();
        registry.register(
            "users",
            vec!["ssn".to_string(), "phone".to_string(), "ssn".to_string()],
        );

        assert_eq!(registry.fields_for("users"), vec!["ssn", "phone"]);
        assert!(registry.is_registered("users", "ssn"));
        assert!(!registry.is_registered("users", "email"));
        assert!(registry.fields_for("appointments").is_empty());
    }

    #[test]
    fn test_reregistration_replaces() {
        let registry = EncryptedFieldRegistry::new();
        registry.register("users", vec!["ssn".to_string()]);
        registry.register("users", vec!["dob".to_string()]);

        assert_eq!(registry.fields_for("users"), vec!["dob"]);
    }

    #[test]
    fn test_record_types_sorted() {
        let registry = EncryptedFieldRegistry::new();
        assert!(registry.is_empty());

        registry.register("users", vec!["ssn".to_string()]);
        registry.register("claims", vec!["diagnosis".to_string()]);

        assert_eq!(registry.record_types(), vec!["claims", "users"]);
        assert!(!registry.is_empty());
    }

    #[test]
    fn test_snapshot_round_trip() {
        let registry = EncryptedFieldRegistry::new();
        registry.register("users", vec!["ssn".to_string()]);

        let snapshot = registry.snapshot();
        let json = serde_json::to_string(&snapshot).unwrap();
        let restored: RegistrySnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(snapshot, restored);
    }
}
