//! Injection seams: the things a browser/OS environment provides ambiently
//! and that tests need to control deterministically.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use e2ee_crypto::x3dh::PrekeyBundle;
use e2ee_proto::api::{
    DeviceRegistration, DeviceSummary, KeyBackupDto, LinkRequest, LinkRequestHandle,
    LinkRequestStatus, LinkingCode, OneTimePrekeyRefill, PendingLinkRequest, PrekeyBundleUpload,
    SignedPrekeyUpload,
};
use e2ee_proto::{GroupEnvelope, PairwiseEnvelope};

use crate::error::ServiceError;

/// Wall-clock access, injected so tests can freeze or fast-forward time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Default clock backed by the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Randomness source, injected so property tests can use a seeded generator.
pub trait Rng: Send + Sync {
    fn fill_bytes(&self, out: &mut [u8]);

    fn gen_linking_code(&self) -> String {
        let mut raw = [0u8; 6];
        self.fill_bytes(&mut raw);
        raw.iter().map(|b| (b'A' + (b % 26)) as char).collect()
    }
}

/// Default RNG backed by the OS CSPRNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsRng;

impl Rng for OsRng {
    fn fill_bytes(&self, out: &mut [u8]) {
        use rand_core::RngCore;
        rand_core::OsRng.fill_bytes(out);
    }
}

/// The server-side directory: publishes bundles, relays distributions,
/// brokers device linking and encrypted backups. Never sees plaintext or
/// ratchet state.
#[async_trait]
pub trait DirectoryClient: Send + Sync {
    async fn register_keys(&self, upload: PrekeyBundleUpload) -> Result<(), ServiceError>;

    async fn get_bundle(&self, peer_user_id: &str) -> Result<PrekeyBundle, ServiceError>;

    async fn check_enabled(&self, peer_user_id: &str) -> Result<bool, ServiceError>;

    async fn upload_prekeys(&self, refill: OneTimePrekeyRefill) -> Result<(), ServiceError>;

    async fn set_signed_prekey(&self, spk: SignedPrekeyUpload) -> Result<(), ServiceError>;

    async fn send_sender_key_distribution(
        &self,
        room_id: &str,
        recipient_id: &str,
        distribution: PairwiseEnvelope,
    ) -> Result<(), ServiceError>;

    async fn send_group_message(&self, envelope: GroupEnvelope) -> Result<(), ServiceError>;

    async fn register_device(&self, registration: DeviceRegistration) -> Result<(), ServiceError>;

    async fn list_devices(&self) -> Result<Vec<DeviceSummary>, ServiceError>;

    async fn remove_device(&self, device_id: &str) -> Result<(), ServiceError>;

    async fn rename_device(&self, device_id: &str, name: &str) -> Result<(), ServiceError>;

    async fn generate_linking_code(&self) -> Result<LinkingCode, ServiceError>;

    async fn submit_link_request(
        &self,
        request: LinkRequest,
    ) -> Result<LinkRequestHandle, ServiceError>;

    async fn request_status(
        &self,
        handle: &LinkRequestHandle,
    ) -> Result<LinkRequestStatus, ServiceError>;

    async fn pending_link_requests(&self) -> Result<Vec<PendingLinkRequest>, ServiceError>;

    async fn approve_link_request(&self, request_id: &str) -> Result<(), ServiceError>;

    async fn reject_link_request(&self, request_id: &str) -> Result<(), ServiceError>;

    async fn upload_backup(&self, backup: KeyBackupDto) -> Result<(), ServiceError>;

    async fn fetch_backup(&self) -> Result<Option<KeyBackupDto>, ServiceError>;
}

/// Carries bearer credentials for a `DirectoryClient` implementation; kept
/// separate so directory calls can be retried/authenticated uniformly.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post_json(&self, path: &str, body: serde_json::Value) -> Result<serde_json::Value, ServiceError>;

    async fn get_json(&self, path: &str) -> Result<serde_json::Value, ServiceError>;
}
