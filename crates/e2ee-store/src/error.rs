use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("crypto error: {0}")]
    Crypto(#[from] e2ee_crypto::CryptoError),

    #[error("serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("stored record failed to decrypt, treated as absent: {0}")]
    CorruptRecord(String),

    #[error("migration error: {0}")]
    Migration(String),
}
