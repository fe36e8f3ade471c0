//! e2ee-proto — wire types and serialisation for the end-to-end encryption engine
//!
//! All on-wire types are serialised to JSON and carry an explicit `version`
//! field so future format changes don't break older clients mid-rollout.
//!
//! # Modules
//! - `envelope` — pairwise and group payload envelopes (what the transport sees)
//! - `group`    — room membership tracked by `GroupService`
//! - `api`      — DTOs exchanged with the directory service

pub mod api;
pub mod envelope;
pub mod group;

pub use envelope::{
    GroupCiphertextWire, GroupEnvelope, PairwiseEnvelope, PairwiseMessage,
};
pub use group::RoomMembership;
