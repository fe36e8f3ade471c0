//! Programmatic configuration, analogous to the teacher's
//! `EncryptionSettings`/auto-lock-timeout pattern. No file-based parsing is
//! in scope — the embedding application constructs this struct directly.

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Bound on cached skipped message keys per pairwise session.
    pub max_skip: u64,
    /// Bound on cached out-of-order ratchet steps per sender-key record.
    pub max_ratchet_steps: u64,
    /// Refill one-time prekeys when fewer than this many remain.
    pub prekey_refill_threshold: u32,
    /// Generate up to this many one-time prekeys on refill.
    pub prekey_refill_target: u32,
    /// Rotate the signed prekey after it reaches this age.
    pub signed_prekey_rotation_period: std::time::Duration,
    /// PBKDF2-HMAC-SHA256 iteration count for backup-key derivation.
    pub backup_pbkdf2_iterations: u32,
    /// How long a generated linking code remains valid.
    pub linking_code_lifetime: std::time::Duration,
    /// Interval between `request_status` polls during `link_with_code`.
    pub linking_poll_interval: std::time::Duration,
    /// Total time budget for `link_with_code` polling before giving up.
    pub linking_poll_window: std::time::Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_skip: e2ee_crypto::ratchet::DEFAULT_MAX_SKIP,
            max_ratchet_steps: e2ee_crypto::sender_key::DEFAULT_MAX_RATCHET_STEPS,
            prekey_refill_threshold: 25,
            prekey_refill_target: 100,
            signed_prekey_rotation_period: std::time::Duration::from_secs(7 * 24 * 3600),
            backup_pbkdf2_iterations: 100_000,
            linking_code_lifetime: std::time::Duration::from_secs(5 * 60),
            linking_poll_interval: std::time::Duration::from_secs(2),
            linking_poll_window: std::time::Duration::from_secs(5 * 60),
        }
    }
}
