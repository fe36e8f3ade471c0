//! e2ee-crypto — cryptographic primitives for the end-to-end encryption engine
//!
//! # Design principles
//! - NO custom crypto; all primitives come from audited Rust crates.
//! - Zeroize all secret material on drop.
//! - All public APIs return opaque newtypes to prevent accidental misuse.
//!
//! # Module layout
//! - `identity`    — long-term Ed25519 identity + device keys + device certificates
//! - `x3dh`        — X3DH asynchronous key agreement (SPK verification, proper DH)
//! - `ratchet`     — full Double Ratchet with DH ratchet steps + skipped message keys
//! - `sender_key`  — Sender Keys group ratchet (distribution, chain, MAC)
//! - `aead`        — AES-256-GCM encrypt/decrypt helpers
//! - `kdf`         — HKDF / PBKDF2 key derivation
//! - `error`       — unified error type

pub mod aead;
pub mod error;
pub mod identity;
pub mod kdf;
pub mod ratchet;
pub mod sender_key;
pub mod x3dh;

pub use error::CryptoError;
