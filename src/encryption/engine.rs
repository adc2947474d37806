//! The authenticated-encryption primitive service.
//!
//! [`CipherEngine`] turns field values into [`FieldEnvelope`]s and back.
//! It is stateless apart from read-only key lookups and an operation
//! counter, so clones are cheap and every operation is safe to call
//! concurrently. All key material comes from the [`KeyManager`]: the
//! current active version for new encryption, the envelope's tagged
//! version for decryption, never a silent fallback to a different key.

use super::{
    BatchItemError, BatchOptions, BatchOutcome, CipherStats, EncryptOptions, EncryptionAlgorithm,
    FieldEnvelope, KeyManager, PartialFailureMode, key_manager::AuditOperation,
};
use crate::{FieldVaultError, Result};
use aes_gcm::{
    Aes256Gcm, Key, KeyInit, Nonce,
    aead::{Aead, Payload},
};
use chrono::Utc;
use hmac::{Hmac, Mac};
use rand::{RngCore, rngs::OsRng};
use serde_json::Value;
use sha2::Sha256;
use std::sync::{Arc, Mutex};
use subtle::ConstantTimeEq;
use tokio::task::JoinSet;

type HmacSha256 = Hmac<Sha256>;

/// Stateless AES-256-GCM encrypt/decrypt/re-encrypt service over versioned
/// keys.
///
/// # Examples
///
/// ```rust,no_run
/// use fieldvault::encryption::{CipherEngine, KeyManager, KeyRotationPolicy};
/// use fieldvault::encryption::key_store::MemoryKeyStore;
/// use serde_json::json;
/// use std::sync::Arc;
///
/// # async fn example() -> fieldvault::Result<()> {
/// let manager = Arc::new(KeyManager::new(
///     Box::new(MemoryKeyStore::new()),
///     KeyRotationPolicy::default(),
/// ));
/// manager.ensure_key().await?;
/// let engine = CipherEngine::new(manager);
///
/// let envelope = engine.encrypt(&json!({"ssn": "123-45-6789"})).await?.unwrap();
/// assert_eq!(engine.decrypt(&envelope).await?, json!({"ssn": "123-45-6789"}));
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct CipherEngine {
    key_manager: Arc<KeyManager>,
    stats: Arc<Mutex<CipherStats>>,
}

impl CipherEngine {
    pub fn new(key_manager: Arc<KeyManager>) -> Self {
        Self {
            key_manager,
            stats: Arc::new(Mutex::new(CipherStats::default())),
        }
    }

    pub fn key_manager(&self) -> &Arc<KeyManager> {
        &self.key_manager
    }

    /// Encrypts a value under the current active key.
    ///
    /// The value is serialized as canonical JSON, so strings, numbers,
    /// bools, objects, and arrays all round-trip exactly; dates travel as
    /// ISO-8601 strings. Encrypting `null` returns `Ok(None)` unless
    /// [`EncryptOptions::encrypt_null`] is set.
    pub async fn encrypt(&self, value: &Value) -> Result<Option<FieldEnvelope>> {
        self.encrypt_with_options(value, &EncryptOptions::default())
            .await
    }

    /// Encrypts with an explicit key version, AAD, or null handling.
    pub async fn encrypt_with_options(
        &self,
        value: &Value,
        opts: &EncryptOptions,
    ) -> Result<Option<FieldEnvelope>> {
        if value.is_null() && !opts.encrypt_null {
            return Ok(None);
        }

        match self.encrypt_inner(value, opts).await {
            Ok(envelope) => {
                self.touch_stats(|s| s.encrypt_ops += 1);
                self.key_manager.record_operation(
                    AuditOperation::Encrypt,
                    Some(envelope.version),
                    true,
                    None,
                );
                Ok(Some(envelope))
            }
            Err(e) => {
                self.touch_stats(|s| s.encrypt_errors += 1);
                self.key_manager.record_operation(
                    AuditOperation::Encrypt,
                    opts.key_version,
                    false,
                    Some(e.to_string()),
                );
                Err(e)
            }
        }
    }

    /// Decrypts an envelope back to its value.
    ///
    /// Fails with [`FieldVaultError::DecryptionFailed`] on tag mismatch or
    /// a malformed envelope, and [`FieldVaultError::UnknownKeyVersion`]
    /// when the tagged key has been purged. A failed decryption must never
    /// be treated as "the value was plaintext".
    pub async fn decrypt(&self, envelope: &FieldEnvelope) -> Result<Value> {
        self.decrypt_with_aad(envelope, None).await
    }

    /// Decrypts an envelope whose tag was bound over additional
    /// authenticated data. The same bytes must be supplied here.
    pub async fn decrypt_with_aad(
        &self,
        envelope: &FieldEnvelope,
        aad: Option<&[u8]>,
    ) -> Result<Value> {
        match self.decrypt_inner(envelope, aad).await {
            Ok(value) => {
                self.touch_stats(|s| s.decrypt_ops += 1);
                self.key_manager.record_operation(
                    AuditOperation::Decrypt,
                    Some(envelope.version),
                    true,
                    None,
                );
                Ok(value)
            }
            Err(e) => {
                self.touch_stats(|s| s.decrypt_errors += 1);
                self.key_manager.record_operation(
                    AuditOperation::Decrypt,
                    Some(envelope.version),
                    false,
                    Some(e.to_string()),
                );
                Err(e)
            }
        }
    }

    /// Decrypts and re-encrypts under `new_version` (default: the current
    /// active version). Used during key rotation to move data forward.
    ///
    /// Envelopes that were encrypted with AAD must be re-encrypted
    /// manually via [`decrypt_with_aad`](Self::decrypt_with_aad) and
    /// [`encrypt_with_options`](Self::encrypt_with_options).
    pub async fn reencrypt(
        &self,
        envelope: &FieldEnvelope,
        new_version: Option<u32>,
    ) -> Result<FieldEnvelope> {
        let value = self.decrypt(envelope).await?;
        let version = match new_version {
            Some(v) => v,
            None => self.key_manager.current_key_version().await?,
        };

        let opts = EncryptOptions::new()
            .with_key_version(version)
            .with_encrypt_null(true);
        let reencrypted = self
            .encrypt_with_options(&value, &opts)
            .await?
            .ok_or_else(|| {
                FieldVaultError::EncryptionFailed("re-encryption produced no envelope".to_string())
            })?;

        self.touch_stats(|s| s.reencrypt_ops += 1);
        Ok(reencrypted)
    }

    /// Encrypts a slice of values in chunks.
    ///
    /// `ContinueOnError` records per-item failures and leaves gaps;
    /// `FailFast` aborts the remaining items on the first failure.
    /// Parallel mode fans each chunk out onto the runtime, bounded by
    /// `batch_size`.
    pub async fn batch_encrypt(
        &self,
        values: &[Value],
        opts: &BatchOptions,
    ) -> Result<BatchOutcome<FieldEnvelope>> {
        let total = values.len();
        let mut outcome = BatchOutcome {
            results: Vec::with_capacity(total),
            errors: Vec::new(),
        };
        let mut done = 0usize;

        for chunk in values.chunks(opts.batch_size.max(1)) {
            if opts.parallel {
                let mut set = JoinSet::new();
                for (i, value) in chunk.iter().enumerate() {
                    let engine = self.clone();
                    let value = value.clone();
                    let index = done + i;
                    set.spawn(async move { (index, engine.encrypt(&value).await) });
                }
                self.drain_join_set(set, &mut outcome, &opts.failure_mode)
                    .await?;
            } else {
                for (i, value) in chunk.iter().enumerate() {
                    let result = self.encrypt(value).await;
                    fold_batch_item(&mut outcome, done + i, result, &opts.failure_mode)?;
                }
            }

            done += chunk.len();
            if let Some(callback) = &opts.on_progress {
                callback(done, total);
            }
        }

        Ok(outcome)
    }

    /// Decrypts a slice of envelopes in chunks. Same failure and
    /// parallelism semantics as [`batch_encrypt`](Self::batch_encrypt).
    pub async fn batch_decrypt(
        &self,
        envelopes: &[FieldEnvelope],
        opts: &BatchOptions,
    ) -> Result<BatchOutcome<Value>> {
        let total = envelopes.len();
        let mut outcome = BatchOutcome {
            results: Vec::with_capacity(total),
            errors: Vec::new(),
        };
        let mut done = 0usize;

        for chunk in envelopes.chunks(opts.batch_size.max(1)) {
            if opts.parallel {
                let mut set = JoinSet::new();
                for (i, envelope) in chunk.iter().enumerate() {
                    let engine = self.clone();
                    let envelope = envelope.clone();
                    let index = done + i;
                    set.spawn(async move { (index, engine.decrypt(&envelope).await.map(Some)) });
                }
                self.drain_join_set(set, &mut outcome, &opts.failure_mode)
                    .await?;
            } else {
                for (i, envelope) in chunk.iter().enumerate() {
                    let result = self.decrypt(envelope).await.map(Some);
                    fold_batch_item(&mut outcome, done + i, result, &opts.failure_mode)?;
                }
            }

            done += chunk.len();
            if let Some(callback) = &opts.on_progress {
                callback(done, total);
            }
        }

        Ok(outcome)
    }

    /// Decrypts the envelope and compares against `plain` with a
    /// timing-safe byte comparison, for secret-like fields where equality
    /// timing must not leak.
    pub async fn constant_time_compare(
        &self,
        envelope: &FieldEnvelope,
        plain: &Value,
    ) -> Result<bool> {
        let decrypted = self.decrypt(envelope).await?;
        let a = serde_json::to_vec(&decrypted)?;
        let b = serde_json::to_vec(plain)?;
        Ok(a.as_slice().ct_eq(b.as_slice()).into())
    }

    /// Structural check: does `data` parse as a valid envelope with a
    /// recognized algorithm tag? Used by the migration engine to avoid
    /// double-encrypting. Requires no key material.
    pub fn is_encrypted(data: &str) -> bool {
        FieldEnvelope::is_envelope(data)
    }

    /// Keyed SHA-256 integrity tag over an arbitrary string, independent of
    /// the envelope format, e.g. for equality-lookup hashes. The tag is
    /// prefixed with the key version (`v3:<hex>`) so verification keeps
    /// working through rotations while the tagged key is retrievable.
    pub async fn generate_hmac(&self, data: &str) -> Result<String> {
        let version = self.key_manager.current_key_version().await?;
        self.generate_hmac_with_version(data, version).await
    }

    /// HMAC under a specific key version.
    pub async fn generate_hmac_with_version(&self, data: &str, version: u32) -> Result<String> {
        let material = self.key_manager.key_material(version).await?;
        let mut mac = <HmacSha256 as Mac>::new_from_slice(material.as_bytes())
            .map_err(|e| FieldVaultError::EncryptionFailed(format!("HMAC key setup: {}", e)))?;
        mac.update(data.as_bytes());
        let tag = hex::encode(mac.finalize().into_bytes());

        self.touch_stats(|s| s.hmac_ops += 1);
        Ok(format!("v{}:{}", version, tag))
    }

    /// Verifies a tag produced by [`generate_hmac`](Self::generate_hmac).
    ///
    /// Constant-time comparison. Malformed tags and purged key versions
    /// verify as `false` rather than erroring.
    pub async fn verify_hmac(&self, data: &str, tag: &str) -> Result<bool> {
        let Some((version_part, hex_part)) = tag.split_once(':') else {
            return Ok(false);
        };
        let Some(version) = version_part
            .strip_prefix('v')
            .and_then(|v| v.parse::<u32>().ok())
        else {
            return Ok(false);
        };
        let Ok(expected) = hex::decode(hex_part) else {
            return Ok(false);
        };

        let material = match self.key_manager.key_material(version).await {
            Ok(material) => material,
            Err(FieldVaultError::UnknownKeyVersion { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };

        let mut mac = <HmacSha256 as Mac>::new_from_slice(material.as_bytes())
            .map_err(|e| FieldVaultError::EncryptionFailed(format!("HMAC key setup: {}", e)))?;
        mac.update(data.as_bytes());
        Ok(mac.verify_slice(&expected).is_ok())
    }

    /// Snapshot of the engine's operation counters.
    pub fn stats(&self) -> CipherStats {
        self.stats
            .lock()
            .map(|stats| stats.clone())
            .unwrap_or_default()
    }

    async fn encrypt_inner(&self, value: &Value, opts: &EncryptOptions) -> Result<FieldEnvelope> {
        let version = match opts.key_version {
            Some(v) => v,
            None => self.key_manager.current_key_version().await?,
        };
        let material = self.key_manager.key_material(version).await?;

        let plaintext = serde_json::to_vec(value)
            .map_err(|e| FieldVaultError::EncryptionFailed(format!("serialization: {}", e)))?;

        let algorithm = EncryptionAlgorithm::Aes256Gcm;
        let mut iv = vec![0u8; algorithm.nonce_size_bytes()];
        OsRng.fill_bytes(&mut iv);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(material.as_bytes()));
        let payload = Payload {
            msg: &plaintext,
            aad: opts.aad.as_deref().unwrap_or(&[]),
        };
        let ciphertext_with_tag = cipher
            .encrypt(Nonce::from_slice(&iv), payload)
            .map_err(|e| FieldVaultError::EncryptionFailed(format!("AES-GCM: {}", e)))?;

        // aes-gcm appends the 16-byte tag to the ciphertext.
        let tag_start = ciphertext_with_tag.len() - algorithm.tag_size_bytes();
        Ok(FieldEnvelope::new(
            version,
            &iv,
            &ciphertext_with_tag[tag_start..],
            &ciphertext_with_tag[..tag_start],
        ))
    }

    async fn decrypt_inner(&self, envelope: &FieldEnvelope, aad: Option<&[u8]>) -> Result<Value> {
        let algorithm = envelope.parsed_algorithm().ok_or_else(|| {
            FieldVaultError::DecryptionFailed(format!(
                "unrecognized algorithm tag: {}",
                envelope.algorithm
            ))
        })?;

        let material = self.key_manager.key_material(envelope.version).await?;

        let iv = envelope
            .decode_iv()
            .map_err(|e| FieldVaultError::DecryptionFailed(format!("malformed IV: {}", e)))?;
        if iv.len() != algorithm.nonce_size_bytes() {
            return Err(FieldVaultError::DecryptionFailed(format!(
                "unexpected IV length: {}",
                iv.len()
            )));
        }
        let tag = envelope
            .decode_auth_tag()
            .map_err(|e| FieldVaultError::DecryptionFailed(format!("malformed tag: {}", e)))?;
        let mut ciphertext_with_tag = envelope.decode_ciphertext().map_err(|e| {
            FieldVaultError::DecryptionFailed(format!("malformed ciphertext: {}", e))
        })?;
        ciphertext_with_tag.extend_from_slice(&tag);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(material.as_bytes()));
        let payload = Payload {
            msg: &ciphertext_with_tag,
            aad: aad.unwrap_or(&[]),
        };
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&iv), payload)
            .map_err(|_| {
                FieldVaultError::DecryptionFailed(
                    "authentication failed: tag mismatch or wrong key".to_string(),
                )
            })?;

        serde_json::from_slice(&plaintext)
            .map_err(|e| FieldVaultError::DecryptionFailed(format!("deserialization: {}", e)))
    }

    async fn drain_join_set<T: Send + 'static>(
        &self,
        mut set: JoinSet<(usize, Result<Option<T>>)>,
        outcome: &mut BatchOutcome<T>,
        failure_mode: &PartialFailureMode,
    ) -> Result<()> {
        let mut chunk_results = Vec::with_capacity(set.len());
        while let Some(joined) = set.join_next().await {
            let item = joined
                .map_err(|e| FieldVaultError::EncryptionFailed(format!("batch task: {}", e)))?;
            chunk_results.push(item);
        }
        chunk_results.sort_by_key(|(index, _)| *index);

        for (index, result) in chunk_results {
            fold_batch_item(outcome, index, result, failure_mode)?;
        }
        Ok(())
    }

    fn touch_stats(&self, update: impl FnOnce(&mut CipherStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            update(&mut stats);
            stats.last_updated = Utc::now();
        }
    }
}

fn fold_batch_item<T>(
    outcome: &mut BatchOutcome<T>,
    index: usize,
    result: Result<Option<T>>,
    failure_mode: &PartialFailureMode,
) -> Result<()> {
    match result {
        Ok(item) => outcome.results.push(item),
        Err(e) => match failure_mode {
            PartialFailureMode::FailFast => return Err(e),
            PartialFailureMode::ContinueOnError => {
                outcome.errors.push(BatchItemError {
                    index,
                    error: e.to_string(),
                });
                outcome.results.push(None);
            }
        },
    }
    Ok(())
}
