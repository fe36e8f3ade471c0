//! Key derivation functions
//!
//! `hkdf_expand` — HKDF-SHA256, used for session key material.

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;

// ── HKDF-SHA256 ───────────────────────────────────────────────────────────────

/// Expand `ikm` + `info` into `output.len()` bytes of key material.
///
/// `salt` may be empty (HKDF will use a zeroed salt).
pub fn hkdf_expand(
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    output: &mut [u8],
) -> Result<(), CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    hk.expand(info, output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}

// ── Backup key (PBKDF2) ───────────────────────────────────────────────────────

/// 32-byte key wrapping the password-encrypted key backup. PBKDF2 is used
/// here rather than a faster modern KDF because the wire format must stay
/// interoperable with other clients deriving the same backup key.
#[derive(ZeroizeOnDrop)]
pub struct BackupKey(pub [u8; 32]);

/// Derive a backup key from a password + salt using PBKDF2-HMAC-SHA256.
pub fn backup_key_from_password(
    password: &[u8],
    salt: &[u8; 16],
    iterations: u32,
) -> Result<BackupKey, CryptoError> {
    let mut output = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut output);
    Ok(BackupKey(output))
}
