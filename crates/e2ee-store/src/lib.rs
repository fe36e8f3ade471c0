//! e2ee-store — local encrypted key storage for the end-to-end encryption engine
//!
//! # Encryption strategy
//! SQLite does NOT natively encrypt. We use application-level encryption:
//! each record is serialized to JSON and sealed under a device-local
//! symmetric key with AES-256-GCM; only the index columns a query
//! needs (ids, timestamps, `is_verified`) stay in cleartext. The device key
//! itself is generated on first open and persisted unencrypted — see
//! `device_key` — trusting the host storage sandbox as the boundary.
//!
//! # Migration
//! SQLx migrations in `migrations/` are run on first open.

pub mod db;
pub mod device_key;
pub mod error;
pub mod migrations;
pub mod models;

pub use db::{KeyStore, SqliteKeyStore};
pub use error::StoreError;
