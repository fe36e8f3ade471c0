//! Decrypted domain records held by the [`crate::KeyStore`].
//!
//! Each of these is serialized to JSON and AEAD-encrypted as a single blob
//! under the device key; only the index columns a query needs (ids,
//! timestamps, `is_verified`) live in cleartext alongside it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredIdentity {
    pub registration_id: u16,
    /// base64 Ed25519 public key
    pub identity_public: String,
    /// raw 32-byte Ed25519 secret key
    pub identity_secret: [u8; 32],
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSignedPrekey {
    pub key_id: u32,
    /// base64 X25519 public key
    pub public: String,
    /// raw 32-byte X25519 secret key
    pub secret: [u8; 32],
    /// base64 Ed25519 signature over `public`, made by the identity key
    pub signature: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredOneTimePrekey {
    pub key_id: u32,
    pub public: String,
    pub secret: [u8; 32],
}

/// Opaque — the service layer owns the exact shape of ratchet session state;
/// the store only persists and retrieves it as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSession {
    pub state_json: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSenderKeyOwn {
    pub state_json: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSenderKeyPeer {
    pub record_json: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DevicePlatform {
    Web,
    Ios,
    Android,
    Desktop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredDevice {
    pub device_id: String,
    pub device_name: String,
    pub platform: DevicePlatform,
    pub identity_public: String,
    pub signed_prekey_id: u32,
    pub signed_prekey_public: String,
    pub signed_prekey_signature: String,
    pub registration_id: u16,
    pub is_verified: bool,
    /// Signed `DeviceCert` JSON (see `e2ee_crypto::identity::DeviceCert`).
    pub device_cert: serde_json::Value,
    pub capabilities: Vec<String>,
    pub enrolled_at: DateTime<Utc>,
    pub last_seen_at: Option<DateTime<Utc>>,
}

/// Length-prefixed, non-ambiguous session key for `(peer, Option<room>)`, so
/// a peer id containing a `:` can never collide with a room-qualified key.
pub fn session_key(peer_user_id: &str, room_id: Option<&str>) -> String {
    match room_id {
        Some(room) => format!("{}:{}:{}:{}", peer_user_id.len(), peer_user_id, room.len(), room),
        None => format!("{}:{}", peer_user_id.len(), peer_user_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_key_is_unambiguous() {
        let a = session_key("alice:bob", None);
        let b = session_key("alice", Some("bob"));
        assert_ne!(a, b);
    }
}
