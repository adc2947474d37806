//! Cipher engine tests that exercise the envelope format end to end:
//! round trips, IV uniqueness, tamper detection, AAD binding, batches,
//! HMAC tags, and timing-safe comparison. No database required.

use base64::Engine as _;
use fieldvault::{
    BatchOptions, CipherEngine, EncryptOptions, FieldEnvelope, FieldVaultError, KeyManager,
    KeyRotationPolicy, PartialFailureMode,
    encryption::key_store::MemoryKeyStore,
};
use serde_json::{Value, json};
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

async fn test_engine() -> (Arc<KeyManager>, CipherEngine) {
    let manager = Arc::new(KeyManager::new(
        Box::new(MemoryKeyStore::new()),
        KeyRotationPolicy::default(),
    ));
    manager.ensure_key().await.unwrap();
    let engine = CipherEngine::new(manager.clone());
    (manager, engine)
}

fn flip_base64_bit(encoded: &str) -> String {
    let mut bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .unwrap();
    bytes[0] ^= 0x01;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

#[tokio::test]
async fn test_round_trip_all_value_types() {
    let (_, engine) = test_engine().await;

    let values = vec![
        json!("plain string"),
        json!(""),
        json!(42),
        json!(-17),
        json!(99.99),
        json!(true),
        json!(false),
        json!("2024-03-01T12:30:00Z"),
        json!({"ssn": "123-45-6789", "nested": {"dob": "1990-01-01"}}),
        json!(["a", 1, null, {"k": "v"}]),
        // A string of digits must come back a string, not a number.
        json!("123"),
    ];

    for value in values {
        let envelope = engine.encrypt(&value).await.unwrap().unwrap();
        let decrypted = engine.decrypt(&envelope).await.unwrap();
        assert_eq!(decrypted, value, "round trip failed for {}", value);
    }
}

#[tokio::test]
async fn test_encrypting_same_value_twice_differs() {
    let (_, engine) = test_engine().await;
    let value = json!("4155551234");

    let a = engine.encrypt(&value).await.unwrap().unwrap();
    let b = engine.encrypt(&value).await.unwrap().unwrap();

    assert_ne!(a.iv, b.iv);
    assert_ne!(a.ciphertext, b.ciphertext);
    // Both still decrypt to the same plaintext.
    assert_eq!(engine.decrypt(&a).await.unwrap(), value);
    assert_eq!(engine.decrypt(&b).await.unwrap(), value);
}

#[tokio::test]
async fn test_tampered_ciphertext_is_detected() {
    let (_, engine) = test_engine().await;
    let mut envelope = engine.encrypt(&json!("sensitive")).await.unwrap().unwrap();
    envelope.ciphertext = flip_base64_bit(&envelope.ciphertext);

    let err = engine.decrypt(&envelope).await.unwrap_err();
    assert!(matches!(err, FieldVaultError::DecryptionFailed(_)));
}

#[tokio::test]
async fn test_tampered_auth_tag_is_detected() {
    let (_, engine) = test_engine().await;
    let mut envelope = engine.encrypt(&json!("sensitive")).await.unwrap().unwrap();
    envelope.auth_tag = flip_base64_bit(&envelope.auth_tag);

    let err = engine.decrypt(&envelope).await.unwrap_err();
    assert!(matches!(err, FieldVaultError::DecryptionFailed(_)));
}

#[tokio::test]
async fn test_unrecognized_algorithm_is_rejected() {
    let (_, engine) = test_engine().await;
    let mut envelope = engine.encrypt(&json!("v")).await.unwrap().unwrap();
    envelope.algorithm = "des-ecb".to_string();

    assert!(engine.decrypt(&envelope).await.is_err());
}

#[tokio::test]
async fn test_version_fidelity() {
    let (manager, engine) = test_engine().await;
    manager.rotate_keys().await.unwrap();
    manager.rotate_keys().await.unwrap();
    assert_eq!(manager.current_key_version().await.unwrap(), 3);

    let opts = EncryptOptions::new().with_key_version(2);
    let envelope = engine
        .encrypt_with_options(&json!("pinned"), &opts)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(envelope.version, 2);
    assert_eq!(engine.decrypt(&envelope).await.unwrap(), json!("pinned"));
}

#[tokio::test]
async fn test_decrypt_fails_once_version_is_purged() {
    let manager = Arc::new(KeyManager::new(
        Box::new(MemoryKeyStore::new()),
        KeyRotationPolicy::default().with_grace_period_days(0),
    ));
    manager.ensure_key().await.unwrap();
    let engine = CipherEngine::new(manager.clone());

    let envelope = engine.encrypt(&json!("doomed")).await.unwrap().unwrap();
    manager.rotate_keys().await.unwrap();
    manager.purge_key(1).await.unwrap();

    let err = engine.decrypt(&envelope).await.unwrap_err();
    assert!(matches!(
        err,
        FieldVaultError::UnknownKeyVersion { version: 1 }
    ));
}

#[tokio::test]
async fn test_wire_format_round_trip() {
    let (_, engine) = test_engine().await;
    let envelope = engine.encrypt(&json!({"a": 1})).await.unwrap().unwrap();

    let wire = envelope.to_wire().unwrap();
    assert!(wire.contains("\"authTag\""));
    assert!(wire.contains("\"algorithm\":\"aes-256-gcm\""));

    let parsed = FieldEnvelope::from_wire(&wire).unwrap();
    assert_eq!(engine.decrypt(&parsed).await.unwrap(), json!({"a": 1}));
}

#[tokio::test]
async fn test_constant_time_compare() {
    let (_, engine) = test_engine().await;
    let envelope = engine.encrypt(&json!("s3cret")).await.unwrap().unwrap();

    assert!(
        engine
            .constant_time_compare(&envelope, &json!("s3cret"))
            .await
            .unwrap()
    );
    assert!(
        !engine
            .constant_time_compare(&envelope, &json!("s3cret!"))
            .await
            .unwrap()
    );
    assert!(
        !engine
            .constant_time_compare(&envelope, &json!(1234))
            .await
            .unwrap()
    );
}

mod batches {
    use super::*;

    #[tokio::test]
    async fn test_batch_round_trip_sequential() {
        let (_, engine) = test_engine().await;
        let values: Vec<Value> = (0..25).map(|i| json!(format!("value-{}", i))).collect();

        let opts = BatchOptions::new().with_batch_size(10);
        let encrypted = engine.batch_encrypt(&values, &opts).await.unwrap();
        assert!(encrypted.is_complete());
        assert_eq!(encrypted.success_count(), 25);

        let envelopes: Vec<FieldEnvelope> =
            encrypted.results.into_iter().map(Option::unwrap).collect();
        let decrypted = engine.batch_decrypt(&envelopes, &opts).await.unwrap();
        for (i, value) in decrypted.results.iter().enumerate() {
            assert_eq!(value.as_ref().unwrap(), &values[i]);
        }
    }

    #[tokio::test]
    async fn test_batch_parallel_preserves_order() {
        let (_, engine) = test_engine().await;
        let values: Vec<Value> = (0..40).map(|i| json!(i)).collect();

        let opts = BatchOptions::new().with_batch_size(8).with_parallel(true);
        let encrypted = engine.batch_encrypt(&values, &opts).await.unwrap();
        assert_eq!(encrypted.success_count(), 40);

        for (i, envelope) in encrypted.results.iter().enumerate() {
            let decrypted = engine.decrypt(envelope.as_ref().unwrap()).await.unwrap();
            assert_eq!(decrypted, json!(i));
        }
    }

    #[tokio::test]
    async fn test_batch_null_values_leave_gaps() {
        let (_, engine) = test_engine().await;
        let values = vec![json!("a"), Value::Null, json!("c")];

        let outcome = engine
            .batch_encrypt(&values, &BatchOptions::new())
            .await
            .unwrap();
        assert!(outcome.is_complete());
        assert!(outcome.results[0].is_some());
        assert!(outcome.results[1].is_none());
        assert!(outcome.results[2].is_some());
    }

    #[tokio::test]
    async fn test_batch_decrypt_continue_on_error() {
        let (_, engine) = test_engine().await;
        let values = vec![json!("a"), json!("b"), json!("c")];
        let encrypted = engine
            .batch_encrypt(&values, &BatchOptions::new())
            .await
            .unwrap();

        let mut envelopes: Vec<FieldEnvelope> =
            encrypted.results.into_iter().map(Option::unwrap).collect();
        envelopes[1].auth_tag = flip_base64_bit(&envelopes[1].auth_tag);

        let outcome = engine
            .batch_decrypt(&envelopes, &BatchOptions::new())
            .await
            .unwrap();
        assert_eq!(outcome.success_count(), 2);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].index, 1);
        assert!(outcome.results[1].is_none());
    }

    #[tokio::test]
    async fn test_batch_decrypt_fail_fast_aborts() {
        let (_, engine) = test_engine().await;
        let values = vec![json!("a"), json!("b"), json!("c")];
        let encrypted = engine
            .batch_encrypt(&values, &BatchOptions::new())
            .await
            .unwrap();

        let mut envelopes: Vec<FieldEnvelope> =
            encrypted.results.into_iter().map(Option::unwrap).collect();
        envelopes[0].auth_tag = flip_base64_bit(&envelopes[0].auth_tag);

        let opts = BatchOptions::new().with_failure_mode(PartialFailureMode::FailFast);
        assert!(engine.batch_decrypt(&envelopes, &opts).await.is_err());
    }

    #[tokio::test]
    async fn test_batch_progress_callback() {
        let (_, engine) = test_engine().await;
        let values: Vec<Value> = (0..23).map(|i| json!(i)).collect();

        let calls = Arc::new(AtomicUsize::new(0));
        let last_done = Arc::new(AtomicUsize::new(0));
        let calls_ref = calls.clone();
        let last_ref = last_done.clone();

        let opts = BatchOptions::new()
            .with_batch_size(10)
            .with_progress(Arc::new(move |done, total| {
                calls_ref.fetch_add(1, Ordering::SeqCst);
                last_ref.store(done, Ordering::SeqCst);
                assert_eq!(total, 23);
            }));

        engine.batch_encrypt(&values, &opts).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(last_done.load(Ordering::SeqCst), 23);
    }
}

mod hmac_tags {
    use super::*;

    #[tokio::test]
    async fn test_generate_and_verify() {
        let (_, engine) = test_engine().await;

        let tag = engine.generate_hmac("patient-lookup-key").await.unwrap();
        assert!(tag.starts_with("v1:"));

        assert!(engine.verify_hmac("patient-lookup-key", &tag).await.unwrap());
        assert!(!engine.verify_hmac("other-data", &tag).await.unwrap());
    }

    #[tokio::test]
    async fn test_malformed_tags_verify_false() {
        let (_, engine) = test_engine().await;

        assert!(!engine.verify_hmac("data", "no-version-prefix").await.unwrap());
        assert!(!engine.verify_hmac("data", "v1:zzzz-not-hex").await.unwrap());
        assert!(!engine.verify_hmac("data", "v99:00ff").await.unwrap());
    }

    #[tokio::test]
    async fn test_tags_survive_rotation() {
        let (manager, engine) = test_engine().await;

        let tag = engine.generate_hmac("lookup").await.unwrap();
        manager.rotate_keys().await.unwrap();

        // The tag pins key version 1, which is retired but in grace.
        assert!(engine.verify_hmac("lookup", &tag).await.unwrap());

        // New tags use the new key.
        let new_tag = engine.generate_hmac("lookup").await.unwrap();
        assert!(new_tag.starts_with("v2:"));
    }
}
