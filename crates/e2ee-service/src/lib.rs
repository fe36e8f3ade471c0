//! End-to-end encryption engine: X3DH + Double Ratchet for one-to-one
//! sessions, Sender Keys for groups, and multi-device key management
//! (registration, linking, encrypted backup).
//!
//! This crate is transport-agnostic: embedding applications supply a
//! `DirectoryClient` (talks to the key/relay server) and a `KeyStore` (local
//! persistence). Nothing here assumes a browser, Tauri, or any particular
//! networking stack.

pub mod backoff;
pub mod config;
pub mod error;
pub mod group;
pub mod memory_store;
pub mod multidevice;
pub mod pairwise;
#[cfg(test)]
pub mod test_support;
pub mod traits;

pub use config::ServiceConfig;
pub use error::ServiceError;
pub use group::GroupService;
pub use memory_store::InMemoryKeyStore;
pub use multidevice::MultiDeviceService;
pub use pairwise::{EngineStatus, PairwiseService};
pub use traits::{Clock, DirectoryClient, OsRng, Rng, SystemClock, Transport};
