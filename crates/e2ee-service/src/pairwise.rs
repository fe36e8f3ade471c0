//! High-level one-to-one encryption: owns X3DH session establishment, the
//! Double Ratchet, and prekey lifecycle (refill/rotation). The store is the
//! source of truth for session state; this service only adds a per-session
//! lock domain on top of it so concurrent calls for the same peer serialize.

use std::collections::HashMap;
use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use tokio::sync::Mutex;

use e2ee_crypto::identity::{IdentityKeyPair, PublicKeyBytes};
use e2ee_crypto::ratchet::RatchetSession;
use e2ee_crypto::{aead, x3dh};
use e2ee_proto::api::{OneTimePrekeyRefill, OneTimePrekeyUpload, PrekeyBundleUpload, SignedPrekeyUpload};
use e2ee_proto::{PairwiseEnvelope, PairwiseMessage};
use e2ee_store::models::{
    session_key, StoredIdentity, StoredOneTimePrekey, StoredSession, StoredSignedPrekey,
};
use e2ee_store::KeyStore;

use crate::config::ServiceConfig;
use crate::error::ServiceError;
use crate::traits::{Clock, DirectoryClient, Rng, Transport};

/// Snapshot of the engine's readiness, surfaced to the embedding UI.
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub enabled: bool,
    pub fingerprint: Option<String>,
    pub available_prekeys: u64,
    pub needs_prekey_refill: bool,
    pub signed_prekey_age: Option<chrono::Duration>,
    pub needs_rotation: bool,
}

fn chrono_duration(d: std::time::Duration) -> chrono::Duration {
    chrono::Duration::seconds(d.as_secs() as i64)
}

pub struct PairwiseService {
    store: Arc<dyn KeyStore>,
    directory: Arc<dyn DirectoryClient>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    rng: Arc<dyn Rng>,
    config: ServiceConfig,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl PairwiseService {
    pub fn new(
        store: Arc<dyn KeyStore>,
        directory: Arc<dyn DirectoryClient>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        rng: Arc<dyn Rng>,
        config: ServiceConfig,
    ) -> Self {
        Self {
            store,
            directory,
            transport,
            clock,
            rng,
            config,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    async fn lock_domain(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(key.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    async fn require_identity(&self) -> Result<(StoredIdentity, IdentityKeyPair), ServiceError> {
        let stored = self.store.get_identity().await?.ok_or(ServiceError::NotInitialized)?;
        let keypair = IdentityKeyPair::from_bytes(&stored.identity_secret)?;
        Ok((stored, keypair))
    }

    pub async fn is_enabled(&self) -> Result<bool, ServiceError> {
        Ok(self.store.get_identity().await?.is_some())
    }

    #[tracing::instrument(skip(self))]
    pub async fn enable(&self) -> Result<(), ServiceError> {
        if self.store.get_identity().await?.is_some() {
            return Err(ServiceError::AlreadyEnabled);
        }

        let identity = IdentityKeyPair::generate()?;
        let mut reg_bytes = [0u8; 2];
        self.rng.fill_bytes(&mut reg_bytes);
        let registration_id = u16::from_be_bytes(reg_bytes);

        let now = self.clock.now();
        let (spk_secret, spk_pub, spk_sig) = x3dh::generate_signed_prekey(&identity)?;
        let spk_id = 1u32;

        self.store
            .put_identity(&StoredIdentity {
                registration_id,
                identity_public: identity.public_b64(),
                identity_secret: *identity.secret_bytes(),
                created_at: now,
            })
            .await?;

        self.store
            .put_signed_prekey(&StoredSignedPrekey {
                key_id: spk_id,
                public: URL_SAFE_NO_PAD.encode(spk_pub.as_bytes()),
                secret: spk_secret.to_bytes(),
                signature: URL_SAFE_NO_PAD.encode(&spk_sig),
                created_at: now,
            })
            .await?;

        let opks = self.generate_and_store_opks(1, self.config.prekey_refill_target).await?;

        self.directory
            .register_keys(PrekeyBundleUpload {
                registration_id,
                identity_public: identity.public_b64(),
                signed_prekey_id: spk_id,
                signed_prekey_public: URL_SAFE_NO_PAD.encode(spk_pub.as_bytes()),
                signed_prekey_signature: URL_SAFE_NO_PAD.encode(&spk_sig),
                one_time_prekeys: opks,
            })
            .await?;

        Ok(())
    }

    async fn generate_and_store_opks(
        &self,
        start_id: u32,
        count: u32,
    ) -> Result<Vec<OneTimePrekeyUpload>, ServiceError> {
        let generated = x3dh::generate_one_time_prekeys(count as usize);
        let mut stored = Vec::with_capacity(generated.len());
        let mut uploads = Vec::with_capacity(generated.len());
        for (i, (secret, public)) in generated.into_iter().enumerate() {
            let key_id = start_id + i as u32;
            let public_b64 = URL_SAFE_NO_PAD.encode(public.as_bytes());
            stored.push(StoredOneTimePrekey {
                key_id,
                public: public_b64.clone(),
                secret: secret.to_bytes(),
            });
            uploads.push(OneTimePrekeyUpload { key_id, public: public_b64 });
        }
        self.store.put_one_time_prekeys(&stored).await?;
        Ok(uploads)
    }

    pub async fn status(&self) -> Result<EngineStatus, ServiceError> {
        let identity = self.store.get_identity().await?;
        let Some(identity) = identity else {
            return Ok(EngineStatus {
                enabled: false,
                fingerprint: None,
                available_prekeys: 0,
                needs_prekey_refill: false,
                signed_prekey_age: None,
                needs_rotation: false,
            });
        };

        let fingerprint = PublicKeyBytes::from_b64(&identity.identity_public)?.fingerprint();
        let available_prekeys = self.store.count_one_time_prekeys().await?;
        let needs_prekey_refill = available_prekeys < self.config.prekey_refill_threshold as u64;

        let current_spk = self.store.get_current_signed_prekey().await?;
        let (signed_prekey_age, needs_rotation) = match current_spk {
            Some(spk) => {
                let age = self.clock.now().signed_duration_since(spk.created_at);
                let needs = age > chrono_duration(self.config.signed_prekey_rotation_period);
                (Some(age), needs)
            }
            None => (None, true),
        };

        Ok(EngineStatus {
            enabled: true,
            fingerprint: Some(fingerprint),
            available_prekeys,
            needs_prekey_refill,
            signed_prekey_age,
            needs_rotation,
        })
    }

    pub async fn safety_number(&self, peer_user_id: &str) -> Result<String, ServiceError> {
        let (identity, _) = self.require_identity().await?;
        let own_pub = PublicKeyBytes::from_b64(&identity.identity_public)?;
        let peer_bundle = self.directory.get_bundle(peer_user_id).await?;
        let peer_pub = PublicKeyBytes::from_b64(&peer_bundle.ik_pub)?;
        Ok(e2ee_crypto::identity::safety_number(&own_pub, &peer_pub))
    }

    /// Encrypt `plaintext` for `peer_user_id`, establishing a session via X3DH
    /// if none exists yet. `room_id` disambiguates a sender-key distribution
    /// channel from a direct conversation with the same peer.
    #[tracing::instrument(skip(self, plaintext))]
    pub async fn encrypt(
        &self,
        peer_user_id: &str,
        plaintext: &[u8],
        room_id: Option<&str>,
    ) -> Result<PairwiseEnvelope, ServiceError> {
        let (_, my_identity) = self.require_identity().await?;
        let key = session_key(peer_user_id, room_id);
        let domain = self.lock_domain(&key).await;
        let _guard = domain.lock().await;

        let existing = self.store.get_session(&key).await?;
        let (mut session, x3dh_header) = match existing {
            Some(stored) => {
                let session: RatchetSession = serde_json::from_value(stored.state_json)?;
                (session, None)
            }
            None => {
                let bundle = self.directory.get_bundle(peer_user_id).await?;
                let result = x3dh::initiate(peer_user_id, &my_identity, &bundle)
                    .map_err(|e| ServiceError::BadBundle(e.to_string()))?;
                let spk_pub_bytes = URL_SAFE_NO_PAD
                    .decode(&bundle.spk_pub)
                    .map_err(|e| ServiceError::BadBundle(e.to_string()))?;
                let spk_arr: [u8; 32] = spk_pub_bytes
                    .try_into()
                    .map_err(|_| ServiceError::BadBundle("signed prekey not 32 bytes".into()))?;
                let bob_spk_pub = x25519_dalek::PublicKey::from(spk_arr);
                let session = RatchetSession::init_alice(
                    result.header.session_id.clone(),
                    peer_user_id.to_string(),
                    result.shared_key,
                    &bob_spk_pub,
                    self.config.max_skip,
                )?;
                (session, Some(result.header))
            }
        };

        let (header, message_key) = session.encrypt_step()?;
        let aad = header.to_wire_bytes()?;
        let aead_out = aead::encrypt(&message_key, plaintext, &aad[..])?;
        let wire = e2ee_proto::envelope::pack_ratchet_message(&header, &aead_out)?;
        let message_b64 = URL_SAFE_NO_PAD.encode(&wire);

        self.persist_session(&key, &session).await?;

        let message = match x3dh_header {
            Some(x3dh_header) => PairwiseMessage::Initial { x3dh_header, message: message_b64 },
            None => PairwiseMessage::Normal { message: message_b64 },
        };

        Ok(PairwiseEnvelope { version: PairwiseEnvelope::VERSION, message })
    }

    /// Decrypt an envelope received from `peer_user_id`. Establishes a
    /// responder session from the embedded X3DH header on the first message.
    #[tracing::instrument(skip(self, envelope))]
    pub async fn decrypt(
        &self,
        peer_user_id: &str,
        envelope: &PairwiseEnvelope,
        room_id: Option<&str>,
    ) -> Result<Vec<u8>, ServiceError> {
        let (_, my_identity) = self.require_identity().await?;
        let key = session_key(peer_user_id, room_id);
        let domain = self.lock_domain(&key).await;
        let _guard = domain.lock().await;

        let existing = self.store.get_session(&key).await?;
        let mut session = match (existing, &envelope.message) {
            (Some(stored), _) => serde_json::from_value::<RatchetSession>(stored.state_json)?,
            (None, PairwiseMessage::Initial { x3dh_header, .. }) => {
                let spk = self
                    .store
                    .get_signed_prekey(x3dh_header.spk_id)
                    .await?
                    .ok_or(ServiceError::UnknownKey(x3dh_header.spk_id))?;
                let spk_secret = x25519_dalek::StaticSecret::from(spk.secret);
                let spk_pub_bytes = URL_SAFE_NO_PAD
                    .decode(&spk.public)
                    .map_err(|e| ServiceError::BadBundle(e.to_string()))?;
                let spk_arr: [u8; 32] = spk_pub_bytes
                    .try_into()
                    .map_err(|_| ServiceError::BadBundle("signed prekey not 32 bytes".into()))?;
                let my_spk_pub = x25519_dalek::PublicKey::from(spk_arr);

                let one_time_secret = match x3dh_header.opk_id {
                    Some(opk_id) => {
                        let stored_opk = self
                            .store
                            .get_one_time_prekey(opk_id)
                            .await?
                            .ok_or(ServiceError::UnknownKey(opk_id))?;
                        Some(x25519_dalek::StaticSecret::from(stored_opk.secret))
                    }
                    None => None,
                };

                let sender_ik_bytes = URL_SAFE_NO_PAD
                    .decode(&x3dh_header.ik_pub)
                    .map_err(|e| ServiceError::BadBundle(e.to_string()))?;
                let sender_ik: [u8; 32] = sender_ik_bytes
                    .try_into()
                    .map_err(|_| ServiceError::BadBundle("identity key not 32 bytes".into()))?;

                let shared_key = x3dh::respond(
                    &my_identity,
                    &spk_secret,
                    one_time_secret.as_ref(),
                    &sender_ik,
                    x3dh_header,
                )?;

                if let Some(opk_id) = x3dh_header.opk_id {
                    self.store.delete_one_time_prekey(opk_id).await?;
                }

                RatchetSession::init_bob(
                    x3dh_header.session_id.clone(),
                    peer_user_id.to_string(),
                    shared_key,
                    &spk_secret,
                    &my_spk_pub,
                    self.config.max_skip,
                )?
            }
            (None, PairwiseMessage::Normal { .. }) => {
                return Err(ServiceError::DecryptError(
                    "no session established for this peer".into(),
                ));
            }
        };

        let (header, aead_input) = envelope
            .message
            .decode_wire()
            .map_err(|e| ServiceError::DecryptError(e.to_string()))?;
        let message_key = session.decrypt_step(&header).map_err(|e| match e {
            e2ee_crypto::CryptoError::TooManySkipped { skipped, max } => {
                ServiceError::TooManySkipped { skipped, max }
            }
            other => ServiceError::DecryptError(other.to_string()),
        })?;
        let aad = header.to_wire_bytes()?;
        let plaintext = aead::decrypt(&message_key, &aead_input, &aad[..])
            .map_err(|e| ServiceError::DecryptError(e.to_string()))?;

        self.persist_session(&key, &session).await?;

        if matches!(envelope.message, PairwiseMessage::Initial { .. }) {
            let _ = self.run_maintenance().await;
        }

        Ok(plaintext.to_vec())
    }

    async fn persist_session(&self, key: &str, session: &RatchetSession) -> Result<(), ServiceError> {
        let state_json = serde_json::to_value(session)?;
        self.store
            .put_session(key, &StoredSession { state_json, updated_at: Utc::now() })
            .await?;
        Ok(())
    }

    pub async fn delete_session(&self, peer_user_id: &str, room_id: Option<&str>) -> Result<(), ServiceError> {
        let key = session_key(peer_user_id, room_id);
        let domain = self.lock_domain(&key).await;
        let _guard = domain.lock().await;
        self.store.delete_session(&key).await?;
        Ok(())
    }

    pub async fn reset(&self) -> Result<(), ServiceError> {
        self.store.clear_all().await?;
        Ok(())
    }

    /// Refill one-time prekeys and rotate the signed prekey if due. Safe to
    /// call on a timer or opportunistically after a responder handshake.
    #[tracing::instrument(skip(self))]
    pub async fn run_maintenance(&self) -> Result<(), ServiceError> {
        let (_, identity) = self.require_identity().await?;

        let available = self.store.count_one_time_prekeys().await?;
        if available < self.config.prekey_refill_threshold as u64 {
            let next_id = self.store.get_highest_prekey_id().await?.map(|id| id + 1).unwrap_or(1);
            let deficit = self.config.prekey_refill_target as u64 - available;
            let uploads = self.generate_and_store_opks(next_id, deficit as u32).await?;
            let refill = OneTimePrekeyRefill {
                identity_public: identity.public_b64(),
                one_time_prekeys: uploads,
            };
            crate::backoff::retry_transport(4, || self.directory.upload_prekeys(refill.clone())).await?;
        }

        if let Some(current) = self.store.get_current_signed_prekey().await? {
            let age = self.clock.now().signed_duration_since(current.created_at);
            let rotation_due = age > chrono_duration(self.config.signed_prekey_rotation_period);
            if rotation_due {
                let (secret, public, sig) = x3dh::generate_signed_prekey(&identity)?;
                let new_id = current.key_id + 1;
                self.store
                    .put_signed_prekey(&StoredSignedPrekey {
                        key_id: new_id,
                        public: URL_SAFE_NO_PAD.encode(public.as_bytes()),
                        secret: secret.to_bytes(),
                        signature: URL_SAFE_NO_PAD.encode(&sig),
                        created_at: self.clock.now(),
                    })
                    .await?;
                let rotation = SignedPrekeyUpload {
                    signed_prekey_id: new_id,
                    signed_prekey_public: URL_SAFE_NO_PAD.encode(public.as_bytes()),
                    signed_prekey_signature: URL_SAFE_NO_PAD.encode(&sig),
                };
                crate::backoff::retry_transport(4, || self.directory.set_signed_prekey(rotation.clone())).await?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::InMemoryKeyStore;
    use crate::traits::{OsRng as ServiceOsRng, SystemClock};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct TestDirectory {
        bundles: StdMutex<HashMap<String, e2ee_crypto::x3dh::PrekeyBundle>>,
    }

    #[async_trait]
    impl DirectoryClient for TestDirectory {
        async fn register_keys(&self, upload: PrekeyBundleUpload) -> Result<(), ServiceError> {
            Ok(self.stash(upload))
        }
        async fn get_bundle(&self, peer_user_id: &str) -> Result<e2ee_crypto::x3dh::PrekeyBundle, ServiceError> {
            self.bundles
                .lock()
                .unwrap()
                .get(peer_user_id)
                .cloned()
                .ok_or_else(|| ServiceError::TransportError("unknown peer".into()))
        }
        async fn check_enabled(&self, peer_user_id: &str) -> Result<bool, ServiceError> {
            Ok(self.bundles.lock().unwrap().contains_key(peer_user_id))
        }
        async fn upload_prekeys(&self, _refill: OneTimePrekeyRefill) -> Result<(), ServiceError> {
            Ok(())
        }
        async fn set_signed_prekey(&self, _spk: SignedPrekeyUpload) -> Result<(), ServiceError> {
            Ok(())
        }
        async fn send_sender_key_distribution(
            &self,
            _room_id: &str,
            _recipient_id: &str,
            _distribution: PairwiseEnvelope,
        ) -> Result<(), ServiceError> {
            Ok(())
        }
        async fn send_group_message(&self, _envelope: e2ee_proto::GroupEnvelope) -> Result<(), ServiceError> {
            Ok(())
        }
        async fn register_device(&self, _registration: e2ee_proto::api::DeviceRegistration) -> Result<(), ServiceError> {
            Ok(())
        }
        async fn list_devices(&self) -> Result<Vec<e2ee_proto::api::DeviceSummary>, ServiceError> {
            Ok(vec![])
        }
        async fn remove_device(&self, _device_id: &str) -> Result<(), ServiceError> {
            Ok(())
        }
        async fn rename_device(&self, _device_id: &str, _name: &str) -> Result<(), ServiceError> {
            Ok(())
        }
        async fn generate_linking_code(&self) -> Result<e2ee_proto::api::LinkingCode, ServiceError> {
            unimplemented!()
        }
        async fn submit_link_request(
            &self,
            _request: e2ee_proto::api::LinkRequest,
        ) -> Result<e2ee_proto::api::LinkRequestHandle, ServiceError> {
            unimplemented!()
        }
        async fn request_status(
            &self,
            _handle: &e2ee_proto::api::LinkRequestHandle,
        ) -> Result<e2ee_proto::api::LinkRequestStatus, ServiceError> {
            unimplemented!()
        }
        async fn pending_link_requests(&self) -> Result<Vec<e2ee_proto::api::PendingLinkRequest>, ServiceError> {
            Ok(vec![])
        }
        async fn approve_link_request(&self, _request_id: &str) -> Result<(), ServiceError> {
            Ok(())
        }
        async fn reject_link_request(&self, _request_id: &str) -> Result<(), ServiceError> {
            Ok(())
        }
        async fn upload_backup(&self, _backup: e2ee_proto::api::KeyBackupDto) -> Result<(), ServiceError> {
            Ok(())
        }
        async fn fetch_backup(&self) -> Result<Option<e2ee_proto::api::KeyBackupDto>, ServiceError> {
            Ok(None)
        }
    }

    impl TestDirectory {
        fn stash(&self, upload: PrekeyBundleUpload) {
            let bundle = e2ee_crypto::x3dh::PrekeyBundle {
                user_id: "peer".into(),
                registration_id: upload.registration_id,
                ik_pub: upload.identity_public,
                spk_id: upload.signed_prekey_id,
                spk_pub: upload.signed_prekey_public,
                spk_sig: upload.signed_prekey_signature,
                opk_pub: upload.one_time_prekeys.first().map(|o| o.public.clone()),
                opk_id: upload.one_time_prekeys.first().map(|o| o.key_id),
            };
            self.bundles.lock().unwrap().insert("self".into(), bundle);
        }
    }

    struct NoopTransport;
    #[async_trait]
    impl Transport for NoopTransport {
        async fn post_json(&self, _path: &str, _body: serde_json::Value) -> Result<serde_json::Value, ServiceError> {
            Ok(serde_json::Value::Null)
        }
        async fn get_json(&self, _path: &str) -> Result<serde_json::Value, ServiceError> {
            Ok(serde_json::Value::Null)
        }
    }

    async fn build_service(directory: Arc<TestDirectory>) -> PairwiseService {
        PairwiseService::new(
            Arc::new(InMemoryKeyStore::new()),
            directory,
            Arc::new(NoopTransport),
            Arc::new(SystemClock),
            Arc::new(ServiceOsRng),
            ServiceConfig::default(),
        )
    }

    #[tokio::test]
    async fn fresh_send_then_decrypt_round_trip() {
        crate::test_support::init_tracing();
        let directory = Arc::new(TestDirectory::default());
        let alice = build_service(directory.clone()).await;
        let bob = build_service(directory.clone()).await;

        alice.enable().await.unwrap();
        bob.enable().await.unwrap();

        // swap the bundle key under "self" to the name the test looks up by
        let bob_bundle = directory.bundles.lock().unwrap().get("self").cloned();
        if let Some(bundle) = bob_bundle {
            directory.bundles.lock().unwrap().insert("bob".into(), bundle);
        }

        let envelope = alice.encrypt("bob", b"hello", None).await.unwrap();
        assert!(matches!(envelope.message, PairwiseMessage::Initial { .. }));

        let plaintext = bob.decrypt("alice", &envelope, None).await.unwrap();
        assert_eq!(plaintext, b"hello");
    }
}
