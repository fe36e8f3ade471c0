//! Sender Keys — per-(group, sender) symmetric ratchet for group messaging.
//!
//! Each member owns one `SenderKeyState` per group and distributes it (over a
//! pairwise Double Ratchet session, see `e2ee-service`) to every other member.
//! Recipients keep a `SenderKeyRecord` per (group, sender) and step it forward
//! the same way a chain key advances in the Double Ratchet, but without a DH
//! ratchet — there is no DH here, only repeated HMAC stepping plus a MAC key
//! used to authenticate ciphertexts (this is an HMAC key-pair, not an Ed25519
//! signature, despite being called "mac key" on purpose to keep that plain).

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use indexmap::IndexMap;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use crate::error::CryptoError;

pub const DEFAULT_MAX_RATCHET_STEPS: u64 = 2000;

fn random_32() -> [u8; 32] {
    let mut buf = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    buf
}

/// This device's own sender-key state for one group.
#[derive(Serialize, Deserialize)]
pub struct SenderKeyState {
    pub key_id: u32,
    chain_key: [u8; 32],
    mac_key: [u8; 32],
    pub iteration: u32,
}

impl Drop for SenderKeyState {
    fn drop(&mut self) {
        self.chain_key.zeroize();
        self.mac_key.zeroize();
    }
}

impl SenderKeyState {
    pub fn generate(key_id: u32) -> Self {
        Self {
            key_id,
            chain_key: random_32(),
            mac_key: random_32(),
            iteration: 0,
        }
    }

    pub fn distribution_message(&self) -> DistributionMessage {
        DistributionMessage {
            key_id: self.key_id,
            chain_key: URL_SAFE_NO_PAD.encode(self.chain_key),
            group_mac_public: URL_SAFE_NO_PAD.encode(self.mac_key),
            iteration: self.iteration,
        }
    }

    /// Advance the chain and AEAD-encrypt `plaintext`, MAC-authenticating
    /// the wire bytes with the group MAC key.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<GroupCiphertext, CryptoError> {
        let (next_chain, message_key) = chain_step(&self.chain_key)?;
        let nonce_ct = crate::aead::encrypt(&message_key, plaintext, &self.key_id.to_be_bytes())?;
        let mac = hmac_sha256(&self.mac_key, &nonce_ct);

        let out = GroupCiphertext {
            key_id: self.key_id,
            iteration: self.iteration,
            ciphertext: URL_SAFE_NO_PAD.encode(&nonce_ct),
            mac: URL_SAFE_NO_PAD.encode(mac),
        };
        self.chain_key = next_chain;
        self.iteration += 1;
        Ok(out)
    }
}

/// Sent over a pairwise Double Ratchet session so a peer can decrypt this
/// device's group messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionMessage {
    pub key_id: u32,
    pub chain_key: String,
    pub group_mac_public: String,
    pub iteration: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupCiphertext {
    pub key_id: u32,
    pub iteration: u32,
    pub ciphertext: String,
    pub mac: String,
}

/// A peer's sender-key record, received via a `DistributionMessage` and
/// advanced as their messages arrive (possibly out of order).
#[derive(Serialize, Deserialize)]
pub struct SenderKeyRecord {
    pub key_id: u32,
    chain_key: [u8; 32],
    mac_key: [u8; 32],
    pub iteration: u32,
    message_keys: IndexMap<u32, [u8; 32]>,
    max_ratchet_steps: u64,
}

impl Drop for SenderKeyRecord {
    fn drop(&mut self) {
        self.chain_key.zeroize();
        self.mac_key.zeroize();
        for (_, k) in self.message_keys.iter_mut() {
            k.zeroize();
        }
    }
}

impl SenderKeyRecord {
    pub fn from_distribution(msg: &DistributionMessage, max_ratchet_steps: u64) -> Result<Self, CryptoError> {
        let chain_key = decode_32(&msg.chain_key)?;
        let mac_key = decode_32(&msg.group_mac_public)?;
        Ok(Self {
            key_id: msg.key_id,
            chain_key,
            mac_key,
            iteration: msg.iteration,
            message_keys: IndexMap::new(),
            max_ratchet_steps,
        })
    }

    pub fn decrypt(&mut self, msg: &GroupCiphertext) -> Result<Vec<u8>, CryptoError> {
        if msg.key_id != self.key_id {
            return Err(CryptoError::InvalidKey("sender-key id mismatch".into()));
        }

        let nonce_ct = URL_SAFE_NO_PAD
            .decode(&msg.ciphertext)
            .map_err(CryptoError::Base64Decode)?;
        let mac = URL_SAFE_NO_PAD
            .decode(&msg.mac)
            .map_err(CryptoError::Base64Decode)?;
        let expected_mac = hmac_sha256(&self.mac_key, &nonce_ct);
        if mac.len() != expected_mac.len() || mac.as_slice().ct_eq(&expected_mac[..]).unwrap_u8() != 1 {
            return Err(CryptoError::AeadDecrypt);
        }

        let message_key = if msg.iteration < self.iteration {
            self.message_keys
                .shift_remove(&msg.iteration)
                .ok_or_else(|| CryptoError::RatchetStep("no cached sender-key for past message".into()))?
        } else {
            let steps = (msg.iteration - self.iteration) as u64;
            if steps > self.max_ratchet_steps {
                return Err(CryptoError::TooManySkipped {
                    skipped: steps,
                    max: self.max_ratchet_steps,
                });
            }
            let mut key = self.chain_key;
            let mut iter = self.iteration;
            let mut target_key = None;
            while iter <= msg.iteration {
                let (next_chain, mk) = chain_step(&key)?;
                if iter == msg.iteration {
                    target_key = Some(mk);
                } else {
                    self.message_keys.insert(iter, mk);
                    while self.message_keys.len() > self.max_ratchet_steps as usize {
                        if let Some((_, mut evicted)) = self.message_keys.shift_remove_index(0) {
                            evicted.zeroize();
                        }
                    }
                }
                key = next_chain;
                iter += 1;
            }
            self.chain_key = key;
            self.iteration = msg.iteration + 1;
            target_key.expect("loop always reaches msg.iteration")
        };

        let plaintext = crate::aead::decrypt(&message_key, &nonce_ct, &self.key_id.to_be_bytes())?;
        Ok(plaintext.to_vec())
    }
}

fn decode_32(s: &str) -> Result<[u8; 32], CryptoError> {
    let bytes = URL_SAFE_NO_PAD.decode(s).map_err(CryptoError::Base64Decode)?;
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("expected 32-byte key".into()))
}

fn chain_step(ck: &[u8; 32]) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;
    type HmacSha256 = Hmac<Sha256>;

    let mut mac_ck = HmacSha256::new_from_slice(ck)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    mac_ck.update(&[0x02]);
    let next_ck: [u8; 32] = mac_ck.finalize().into_bytes().into();

    let mut mac_mk = HmacSha256::new_from_slice(ck)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    mac_mk.update(&[0x01]);
    let mk: [u8; 32] = mac_mk.finalize().into_bytes().into();

    Ok((next_ck, mk))
}

fn hmac_sha256(key: &[u8; 32], msg: &[u8]) -> [u8; 32] {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;
    type HmacSha256 = Hmac<Sha256>;
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(msg);
    mac.finalize().into_bytes().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_roundtrip_in_order() {
        let mut sender = SenderKeyState::generate(1);
        let dist = sender.distribution_message();
        let mut recipient =
            SenderKeyRecord::from_distribution(&dist, DEFAULT_MAX_RATCHET_STEPS).unwrap();

        for i in 0..3 {
            let ct = sender.encrypt(format!("msg-{i}").as_bytes()).unwrap();
            let pt = recipient.decrypt(&ct).unwrap();
            assert_eq!(pt, format!("msg-{i}").as_bytes());
        }
    }

    #[test]
    fn group_out_of_order_uses_cache() {
        let mut sender = SenderKeyState::generate(2);
        let dist = sender.distribution_message();
        let mut recipient =
            SenderKeyRecord::from_distribution(&dist, DEFAULT_MAX_RATCHET_STEPS).unwrap();

        let c0 = sender.encrypt(b"zero").unwrap();
        let c1 = sender.encrypt(b"one").unwrap();
        let c2 = sender.encrypt(b"two").unwrap();

        assert_eq!(recipient.decrypt(&c2).unwrap(), b"two");
        assert_eq!(recipient.decrypt(&c0).unwrap(), b"zero");
        assert_eq!(recipient.decrypt(&c1).unwrap(), b"one");
    }

    #[test]
    fn rejects_tampered_mac() {
        let mut sender = SenderKeyState::generate(3);
        let dist = sender.distribution_message();
        let mut recipient =
            SenderKeyRecord::from_distribution(&dist, DEFAULT_MAX_RATCHET_STEPS).unwrap();

        let mut ct = sender.encrypt(b"hello").unwrap();
        ct.mac = URL_SAFE_NO_PAD.encode([0u8; 32]);
        assert!(recipient.decrypt(&ct).is_err());
    }

    #[test]
    fn wrong_key_id_rejected() {
        let mut sender = SenderKeyState::generate(4);
        let dist = sender.distribution_message();
        let mut recipient =
            SenderKeyRecord::from_distribution(&dist, DEFAULT_MAX_RATCHET_STEPS).unwrap();
        let mut ct = sender.encrypt(b"hi").unwrap();
        ct.key_id = 999;
        assert!(recipient.decrypt(&ct).is_err());
    }
}
