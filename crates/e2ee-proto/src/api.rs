//! DTOs exchanged with the directory service over the `DirectoryClient` trait.
//! These map directly to JSON bodies on the wire; the transport and its
//! authentication are out of scope here (see `e2ee-service::DirectoryClient`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::envelope::{GroupEnvelope, PairwiseEnvelope};

// ── Key bundles ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrekeyBundleUpload {
    pub registration_id: u16,
    pub identity_public: String,
    pub signed_prekey_id: u32,
    pub signed_prekey_public: String,
    pub signed_prekey_signature: String,
    pub one_time_prekeys: Vec<OneTimePrekeyUpload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneTimePrekeyUpload {
    pub key_id: u32,
    pub public: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicKeyBundleDto {
    pub registration_id: u16,
    pub identity_public: String,
    pub signed_prekey_id: u32,
    pub signed_prekey_public: String,
    pub signed_prekey_signature: String,
    pub one_time_prekey: Option<OneTimePrekeyUpload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedPrekeyUpload {
    pub signed_prekey_id: u32,
    pub signed_prekey_public: String,
    pub signed_prekey_signature: String,
}

/// Top-up for a device's one-time prekey pool. Distinct from
/// `PrekeyBundleUpload`, which registers a full bundle (identity + signed
/// prekey + one-time prekeys) — a refill only ever adds more one-time
/// prekeys to an already-registered device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneTimePrekeyRefill {
    pub identity_public: String,
    pub one_time_prekeys: Vec<OneTimePrekeyUpload>,
}

// ── Devices ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DevicePlatform {
    Web,
    Ios,
    Android,
    Desktop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRegistration {
    pub device_id: String,
    pub device_name: String,
    pub platform: DevicePlatform,
    /// Signed `DeviceCert` JSON, signed by the account identity key.
    pub device_cert: serde_json::Value,
    pub bundle: PrekeyBundleUpload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSummary {
    pub device_id: String,
    pub device_name: String,
    pub platform: DevicePlatform,
    pub identity_public: String,
    pub is_verified: bool,
    pub enrolled_at: DateTime<Utc>,
    pub last_seen_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserDevicesResponse {
    pub user_id: String,
    pub devices: Vec<DeviceSummary>,
}

// ── Linking ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkingCode {
    pub code: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkRequest {
    pub code: String,
    pub device_id_b: String,
    pub device_name_b: String,
    pub identity_public_b: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkRequestHandle {
    pub request_id: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LinkRequestState {
    Pending,
    Approved,
    Rejected,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkRequestStatus {
    pub request_id: String,
    pub state: LinkRequestState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingLinkRequest {
    pub request_id: String,
    pub device_id_b: String,
    pub device_name_b: String,
    pub identity_public_b: String,
    pub requested_at: DateTime<Utc>,
}

// ── Backup ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyBackupDto {
    pub version: u8,
    /// base64, 16 bytes
    pub salt: String,
    /// base64, >= 12 bytes
    pub iv: String,
    /// base64 AEAD ciphertext of identity + signed prekey + registration id
    pub ciphertext: String,
    pub timestamp: DateTime<Utc>,
}

// ── Message relay (sender-key distribution over the pairwise channel) ───────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderKeyDistributionRequest {
    pub room_id: String,
    pub recipient_id: String,
    pub distribution: PairwiseEnvelope,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSendRequest {
    pub envelope: GroupEnvelope,
}

// ── Common ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}
