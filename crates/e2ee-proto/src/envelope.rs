//! Encrypted message payloads — what the transport/relay sees.
//!
//! The relay is a DUMB RELAY: it only sees `sender_id`, `recipient_id` (for
//! routing), and opaque base64 ciphertext. It CANNOT see message type,
//! plaintext, or any ratchet state beyond the wire header bytes already
//! embedded in `message`.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};

use e2ee_crypto::error::CryptoError;
use e2ee_crypto::ratchet::RatchetHeader;
use e2ee_crypto::x3dh::X3DHHeader;

const NONCE_LEN: usize = 12;

/// Pack a Double Ratchet header + AEAD output (nonce‖ciphertext+tag) into the
/// bit-exact wire message: Header(40) ‖ Nonce(12) ‖ CiphertextLen(u32 BE) ‖ Ciphertext.
pub fn pack_ratchet_message(header: &RatchetHeader, aead_output: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if aead_output.len() < NONCE_LEN {
        return Err(CryptoError::AeadEncrypt);
    }
    let (nonce, ct) = aead_output.split_at(NONCE_LEN);
    let header_bytes = header.to_wire_bytes()?;
    let mut out = Vec::with_capacity(40 + NONCE_LEN + 4 + ct.len());
    out.extend_from_slice(&header_bytes);
    out.extend_from_slice(nonce);
    out.extend_from_slice(&(ct.len() as u32).to_be_bytes());
    out.extend_from_slice(ct);
    Ok(out)
}

/// Inverse of [`pack_ratchet_message`]. Returns (header, aead_input = nonce‖ciphertext+tag).
pub fn unpack_ratchet_message(wire: &[u8]) -> Result<(RatchetHeader, Vec<u8>), CryptoError> {
    if wire.len() < 40 + NONCE_LEN + 4 {
        return Err(CryptoError::AeadDecrypt);
    }
    let header_bytes: [u8; 40] = wire[0..40].try_into().unwrap();
    let header = RatchetHeader::from_wire_bytes(&header_bytes);
    let nonce = &wire[40..40 + NONCE_LEN];
    let len_start = 40 + NONCE_LEN;
    let ct_len = u32::from_be_bytes(wire[len_start..len_start + 4].try_into().unwrap()) as usize;
    let ct = wire.get(len_start + 4..len_start + 4 + ct_len).ok_or(CryptoError::AeadDecrypt)?;
    let mut aead_input = Vec::with_capacity(NONCE_LEN + ct.len());
    aead_input.extend_from_slice(nonce);
    aead_input.extend_from_slice(ct);
    Ok((header, aead_input))
}

/// Tagged variant: either the very first message on a session (carries the
/// X3DH header) or a normal Double Ratchet message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PairwiseMessage {
    Initial {
        x3dh_header: X3DHHeader,
        /// base64(Header(40) ‖ Nonce(12) ‖ CiphertextLen(u32) ‖ Ciphertext)
        message: String,
    },
    Normal {
        /// base64(Header(40) ‖ Nonce(12) ‖ CiphertextLen(u32) ‖ Ciphertext)
        message: String,
    },
}

impl PairwiseMessage {
    pub fn message_b64(&self) -> &str {
        match self {
            PairwiseMessage::Initial { message, .. } => message,
            PairwiseMessage::Normal { message } => message,
        }
    }

    pub fn decode_wire(&self) -> Result<(RatchetHeader, Vec<u8>), CryptoError> {
        let raw = URL_SAFE_NO_PAD
            .decode(self.message_b64())
            .map_err(CryptoError::Base64Decode)?;
        unpack_ratchet_message(&raw)
    }
}

/// Top-level pairwise envelope, what goes over the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairwiseEnvelope {
    pub version: u8,
    pub message: PairwiseMessage,
}

impl PairwiseEnvelope {
    pub const VERSION: u8 = 1;
}

/// A Sender Keys ciphertext as routed through the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupCiphertextWire {
    pub key_id: u32,
    pub iteration: u32,
    /// base64(nonce ‖ ciphertext+tag)
    pub ciphertext: String,
    /// base64 group MAC over `ciphertext`
    pub signature: String,
}

/// Top-level group envelope, what goes over the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupEnvelope {
    pub version: u8,
    #[serde(rename = "type")]
    pub kind: String,
    pub sender_id: String,
    pub room_id: String,
    pub key_id: u32,
    pub message: GroupCiphertextWire,
    pub is_group_e2e: bool,
}

impl GroupEnvelope {
    pub const VERSION: u8 = 1;
    pub const KIND: &'static str = "sender-key";
}

#[cfg(test)]
mod tests {
    use super::*;
    use e2ee_crypto::aead;

    #[test]
    fn pack_unpack_roundtrip() {
        let header = RatchetHeader {
            dh_pub: URL_SAFE_NO_PAD.encode([3u8; 32]),
            n: 5,
            pn: 2,
        };
        let key = [9u8; 32];
        let aead_out = aead::encrypt(&key, b"hello group", b"aad").unwrap();

        let packed = pack_ratchet_message(&header, &aead_out).unwrap();
        let (decoded_header, aead_input) = unpack_ratchet_message(&packed).unwrap();
        assert_eq!(decoded_header.dh_pub, header.dh_pub);
        assert_eq!(decoded_header.n, 5);
        assert_eq!(decoded_header.pn, 2);

        let plaintext = aead::decrypt(&key, &aead_input, b"aad").unwrap();
        assert_eq!(&plaintext[..], b"hello group");
    }

    #[test]
    fn pairwise_message_serializes_tagged() {
        let msg = PairwiseMessage::Normal {
            message: "Zm9v".into(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"normal\""));
    }
}
