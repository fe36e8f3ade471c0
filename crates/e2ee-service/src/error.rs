use thiserror::Error;

/// Service-level error taxonomy, composing crypto/store errors via `#[from]`.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("engine not initialized — call enable() first")]
    NotInitialized,

    #[error("engine is already enabled")]
    AlreadyEnabled,

    #[error("engine is not enabled")]
    NotEnabled,

    #[error("peer key bundle is invalid: {0}")]
    BadBundle(String),

    #[error("decryption failed: {0}")]
    DecryptError(String),

    #[error("message index is out of order and no cached key is available")]
    OutOfOrder,

    #[error("too many skipped messages: {skipped} exceeds the configured maximum {max}")]
    TooManySkipped { skipped: u64, max: u64 },

    #[error("unknown key id: {0}")]
    UnknownKey(u32),

    #[error("no sender-key record for room {room_id} and sender {sender_id}")]
    NoSenderKey { room_id: String, sender_id: String },

    #[error("storage error: {0}")]
    StorageError(#[from] e2ee_store::StoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("directory/transport error: {0}")]
    TransportError(String),

    #[error("linking failed: {0}")]
    LinkingFailed(String),

    #[error("linking code has expired or was already used")]
    LinkingExpired,

    #[error("backup password is incorrect or the blob is corrupt")]
    BackupAuthFailed,

    #[error("operation was canceled")]
    Canceled,

    #[error("crypto error: {0}")]
    Crypto(#[from] e2ee_crypto::CryptoError),
}

impl ServiceError {
    /// Opaque, user-facing reason string. Never includes key material.
    pub fn user_message(&self) -> &'static str {
        match self {
            ServiceError::NotInitialized | ServiceError::NotEnabled => "encryption is not set up yet",
            ServiceError::AlreadyEnabled => "encryption is already set up",
            ServiceError::BadBundle(_) => "could not verify the recipient's keys",
            ServiceError::DecryptError(_) => "failed",
            ServiceError::OutOfOrder => "encrypted but not yet decryptable",
            ServiceError::TooManySkipped { .. } => "failed",
            ServiceError::UnknownKey(_) => "failed",
            ServiceError::NoSenderKey { .. } => "encrypted but not yet decryptable",
            ServiceError::StorageError(_) => "a local storage error occurred",
            ServiceError::Serialization(_) => "a local storage error occurred",
            ServiceError::TransportError(_) => "a network error occurred",
            ServiceError::LinkingFailed(_) => "device linking failed",
            ServiceError::LinkingExpired => "the linking code has expired",
            ServiceError::BackupAuthFailed => "incorrect backup password",
            ServiceError::Canceled => "canceled",
            ServiceError::Crypto(_) => "failed",
        }
    }
}
