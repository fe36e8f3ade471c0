//! Authenticated Encryption with Associated Data
//!
//! Uses AES-256-GCM (96-bit nonce).
//! Key size: 32 bytes.  Nonce: 12 bytes (random).  Tag: 16 bytes.
//!
//! Ciphertext wire format:
//!   [ nonce (12 bytes) | ciphertext + tag ]

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng as AeadOsRng},
    Aes256Gcm, Nonce,
};
use zeroize::Zeroizing;

use crate::error::CryptoError;

const NONCE_LEN: usize = 12;

/// Encrypt `plaintext` with a 32-byte key, prepending a random 12-byte nonce.
/// `aad` - additional associated data (authenticated but not encrypted).
pub fn encrypt(key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| CryptoError::AeadEncrypt)?;

    let nonce = Aes256Gcm::generate_nonce(&mut AeadOsRng);

    let ciphertext = cipher
        .encrypt(&nonce, aes_gcm::aead::Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::AeadEncrypt)?;

    // Prepend nonce
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt wire-format bytes (nonce || ciphertext+tag).
pub fn decrypt(key: &[u8; 32], data: &[u8], aad: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if data.len() < NONCE_LEN {
        return Err(CryptoError::AeadDecrypt);
    }
    let (nonce_bytes, ct) = data.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| CryptoError::AeadDecrypt)?;

    let plaintext = cipher
        .decrypt(nonce, aes_gcm::aead::Payload { msg: ct, aad })
        .map_err(|_| CryptoError::AeadDecrypt)?;

    Ok(Zeroizing::new(plaintext))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decrypt_rejects_short_input() {
        let key = [1u8; 32];
        assert!(decrypt(&key, &[0u8; 10], b"aad").is_err());
    }

    #[test]
    fn decrypt_rejects_tampered_ciphertext() {
        let key = [3u8; 32];
        let mut wire = encrypt(&key, b"hello world", b"ctx").unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 1;
        assert!(decrypt(&key, &wire, b"ctx").is_err());
    }

    #[test]
    fn decrypt_rejects_wrong_aad() {
        let key = [5u8; 32];
        let wire = encrypt(&key, b"hello world", b"ctx-a").unwrap();
        assert!(decrypt(&key, &wire, b"ctx-b").is_err());
    }

    #[test]
    fn wire_format_uses_a_96_bit_nonce() {
        let key = [7u8; 32];
        let wire = encrypt(&key, b"hello world", b"ctx").unwrap();
        assert_eq!(wire.len(), NONCE_LEN + b"hello world".len() + 16);
    }

    proptest::proptest! {
        #[test]
        fn encrypt_decrypt_roundtrips(
            key in proptest::array::uniform32(0u8..),
            plaintext in proptest::collection::vec(0u8.., 0..512),
            aad in proptest::collection::vec(0u8.., 0..64),
        ) {
            let wire = encrypt(&key, &plaintext, &aad).unwrap();
            let recovered = decrypt(&key, &wire, &aad).unwrap();
            proptest::prop_assert_eq!(recovered.as_slice(), plaintext.as_slice());
        }
    }
}
