use thiserror::Error;

#[derive(Error, Debug)]
pub enum FieldVaultError {
    /// Serialization or cipher failure while producing an envelope.
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Auth-tag mismatch, malformed envelope, or plaintext deserialization
    /// failure. Must never be interpreted as "the value is plaintext".
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// No key is configured as the active encryption key.
    #[error("No active encryption key is configured")]
    NoActiveKey,

    /// The requested key version was purged or never existed.
    #[error("Unknown key version: {version}")]
    UnknownKeyVersion { version: u32 },

    /// A non-diagnostic batch migration hit a row-level error; the open
    /// transaction was rolled back and the table is unchanged.
    #[error("Migration aborted: {message}")]
    MigrationAborted { message: String },

    #[error("Key management error: {0}")]
    KeyManagement(String),

    /// The payload does not parse as a field envelope with a recognized
    /// algorithm tag.
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Store error: {message}")]
    Store { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Base64 error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "postgres")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<toml::de::Error> for FieldVaultError {
    fn from(err: toml::de::Error) -> Self {
        FieldVaultError::Configuration(format!("TOML deserialization error: {}", err))
    }
}

impl From<toml::ser::Error> for FieldVaultError {
    fn from(err: toml::ser::Error) -> Self {
        FieldVaultError::Configuration(format!("TOML serialization error: {}", err))
    }
}
