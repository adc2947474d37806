//! The stored representation of an encrypted field value.
//!
//! An envelope is a self-describing JSON object that replaces the plaintext
//! in a text column: the key version it was encrypted under, the per-call
//! IV, the GCM authentication tag, the ciphertext, the algorithm tag, and a
//! creation timestamp. All binary fields are base64. The JSON keys are
//! camelCase and fixed; they are a wire format shared with every consumer
//! of the column.

use crate::{FieldVaultError, Result, encryption::EncryptionAlgorithm};
use base64::Engine;
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// An encrypted field value as stored at rest.
///
/// Created only by the cipher engine; immutable once created. The IV is
/// cryptographically random and unique per encryption call, and the auth
/// tag is produced by the cipher, never caller-supplied.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FieldEnvelope {
    /// Version of the key that encrypted this value.
    pub version: u32,

    /// Base64-encoded initialization vector (12 bytes).
    pub iv: String,

    /// Base64-encoded GCM authentication tag (16 bytes).
    pub auth_tag: String,

    /// Base64-encoded ciphertext.
    pub ciphertext: String,

    /// Algorithm tag, `"aes-256-gcm"`. Consumers must reject envelopes with
    /// an unrecognized tag.
    pub algorithm: String,

    /// Unix milliseconds at encryption time.
    pub timestamp: i64,
}

impl FieldEnvelope {
    /// Builds an envelope from raw cipher output.
    pub fn new(version: u32, iv: &[u8], auth_tag: &[u8], ciphertext: &[u8]) -> Self {
        let b64 = base64::engine::general_purpose::STANDARD;
        Self {
            version,
            iv: b64.encode(iv),
            auth_tag: b64.encode(auth_tag),
            ciphertext: b64.encode(ciphertext),
            algorithm: EncryptionAlgorithm::Aes256Gcm.as_str().to_string(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// Decodes the IV from base64.
    pub fn decode_iv(&self) -> Result<Vec<u8>> {
        base64::engine::general_purpose::STANDARD
            .decode(&self.iv)
            .map_err(FieldVaultError::Base64)
    }

    /// Decodes the authentication tag from base64.
    pub fn decode_auth_tag(&self) -> Result<Vec<u8>> {
        base64::engine::general_purpose::STANDARD
            .decode(&self.auth_tag)
            .map_err(FieldVaultError::Base64)
    }

    /// Decodes the ciphertext from base64.
    pub fn decode_ciphertext(&self) -> Result<Vec<u8>> {
        base64::engine::general_purpose::STANDARD
            .decode(&self.ciphertext)
            .map_err(FieldVaultError::Base64)
    }

    /// The algorithm tag parsed into the supported set, if recognized.
    pub fn parsed_algorithm(&self) -> Option<EncryptionAlgorithm> {
        EncryptionAlgorithm::parse(&self.algorithm)
    }

    /// Serializes to the wire form stored in a text column.
    pub fn to_wire(&self) -> Result<String> {
        serde_json::to_string(self).map_err(FieldVaultError::Serialization)
    }

    /// Parses the wire form. Fails with [`FieldVaultError::InvalidEnvelope`]
    /// when the text is not an envelope or carries an unrecognized
    /// algorithm tag.
    pub fn from_wire(data: &str) -> Result<Self> {
        let envelope: FieldEnvelope = serde_json::from_str(data)
            .map_err(|e| FieldVaultError::InvalidEnvelope(format!("not an envelope: {}", e)))?;

        if envelope.parsed_algorithm().is_none() {
            return Err(FieldVaultError::InvalidEnvelope(format!(
                "unrecognized algorithm tag: {}",
                envelope.algorithm
            )));
        }
        if envelope.version == 0 {
            return Err(FieldVaultError::InvalidEnvelope(
                "key version must be >= 1".to_string(),
            ));
        }

        Ok(envelope)
    }

    /// Structural check: does `data` parse as a valid envelope with a
    /// recognized algorithm tag? Used by the migration engine to avoid
    /// double-encrypting values that are already at rest in envelope form.
    pub fn is_envelope(data: &str) -> bool {
        Self::from_wire(data).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FieldEnvelope {
        FieldEnvelope::new(1, &[0u8; 12], &[1u8; 16], b"ciphertext-bytes")
    }

    #[test]
    fn test_wire_round_trip() {
        let envelope = sample();
        let wire = envelope.to_wire().unwrap();
        let parsed = FieldEnvelope::from_wire(&wire).unwrap();
        assert_eq!(envelope, parsed);
    }

    #[test]
    fn test_wire_keys_are_camel_case() {
        let wire = sample().to_wire().unwrap();
        assert!(wire.contains("\"authTag\""));
        assert!(wire.contains("\"ciphertext\""));
        assert!(wire.contains("\"iv\""));
        assert!(wire.contains("\"algorithm\":\"aes-256-gcm\""));
    }

    #[test]
    fn test_decode_helpers() {
        let envelope = sample();
        assert_eq!(envelope.decode_iv().unwrap(), vec![0u8; 12]);
        assert_eq!(envelope.decode_auth_tag().unwrap(), vec![1u8; 16]);
        assert_eq!(
            envelope.decode_ciphertext().unwrap(),
            b"ciphertext-bytes".to_vec()
        );
    }

    #[test]
    fn test_rejects_unknown_algorithm() {
        let mut envelope = sample();
        envelope.algorithm = "rot13".to_string();
        let wire = envelope.to_wire().unwrap();

        let err = FieldEnvelope::from_wire(&wire).unwrap_err();
        assert!(matches!(err, FieldVaultError::InvalidEnvelope(_)));
        assert!(!FieldEnvelope::is_envelope(&wire));
    }

    #[test]
    fn test_rejects_version_zero() {
        let mut envelope = sample();
        envelope.version = 0;
        let wire = envelope.to_wire().unwrap();
        assert!(FieldEnvelope::from_wire(&wire).is_err());
    }

    #[test]
    fn test_is_envelope_on_plaintext() {
        assert!(!FieldEnvelope::is_envelope("123-45-6789"));
        assert!(!FieldEnvelope::is_envelope("{\"version\":1}"));
        assert!(!FieldEnvelope::is_envelope(""));
    }
}
