//! Sender Keys group messaging, built on top of `PairwiseService` for
//! distribution transport: a sender-key distribution is just a regular
//! pairwise message sent to each member individually.

use std::sync::Arc;

use chrono::Utc;

use e2ee_crypto::sender_key::{DistributionMessage, GroupCiphertext, SenderKeyRecord, SenderKeyState};
use e2ee_proto::group::RoomMembership;
use e2ee_proto::{GroupCiphertextWire, GroupEnvelope};
use e2ee_store::models::{StoredSenderKeyOwn, StoredSenderKeyPeer};
use e2ee_store::KeyStore;

use crate::config::ServiceConfig;
use crate::error::ServiceError;
use crate::pairwise::PairwiseService;
use crate::traits::DirectoryClient;

fn membership_key(room_id: &str) -> String {
    format!("room:{room_id}:members")
}

pub struct GroupService {
    store: Arc<dyn KeyStore>,
    directory: Arc<dyn DirectoryClient>,
    pairwise: Arc<PairwiseService>,
    own_user_id: String,
    config: ServiceConfig,
}

impl GroupService {
    pub fn new(
        store: Arc<dyn KeyStore>,
        directory: Arc<dyn DirectoryClient>,
        pairwise: Arc<PairwiseService>,
        own_user_id: String,
        config: ServiceConfig,
    ) -> Self {
        Self { store, directory, pairwise, own_user_id, config }
    }

    async fn members(&self, room_id: &str) -> Result<Vec<String>, ServiceError> {
        match self.store.get_metadata(&membership_key(room_id)).await? {
            Some(raw) => Ok(serde_json::from_str::<RoomMembership>(&raw)?.member_ids),
            None => Ok(Vec::new()),
        }
    }

    async fn put_members(&self, room_id: &str, members: &[String]) -> Result<(), ServiceError> {
        let membership = RoomMembership::new(room_id, members.to_vec());
        let raw = serde_json::to_string(&membership)?;
        self.store.put_metadata(&membership_key(room_id), &raw).await?;
        Ok(())
    }

    async fn own_state(&self, room_id: &str) -> Result<Option<SenderKeyState>, ServiceError> {
        match self.store.get_sender_key_own(room_id).await? {
            Some(stored) => Ok(Some(serde_json::from_value(stored.state_json)?)),
            None => Ok(None),
        }
    }

    async fn persist_own_state(&self, room_id: &str, state: &SenderKeyState) -> Result<(), ServiceError> {
        self.store
            .put_sender_key_own(
                room_id,
                &StoredSenderKeyOwn { state_json: serde_json::to_value(state)?, updated_at: Utc::now() },
            )
            .await?;
        Ok(())
    }

    async fn send_distribution(&self, room_id: &str, recipient_id: &str, state: &SenderKeyState) -> Result<(), ServiceError> {
        let distribution = state.distribution_message();
        let payload = serde_json::to_vec(&distribution)?;
        let envelope = self.pairwise.encrypt(recipient_id, &payload, Some(room_id)).await?;
        self.directory.send_sender_key_distribution(room_id, recipient_id, envelope).await?;
        Ok(())
    }

    /// Seed a fresh own sender key for `room_id` and distribute it to every
    /// member. Called once when a room's group encryption is turned on.
    #[tracing::instrument(skip(self, member_ids))]
    pub async fn initialize_for_room(&self, room_id: &str, member_ids: &[String]) -> Result<(), ServiceError> {
        let state = SenderKeyState::generate(1);
        self.persist_own_state(room_id, &state).await?;
        self.put_members(room_id, member_ids).await?;

        for member_id in member_ids {
            self.send_distribution(room_id, member_id, &state).await?;
        }
        Ok(())
    }

    /// Encrypt `plaintext` for the room, lazily creating an own sender key
    /// (with no distribution) if the room has never been initialized.
    #[tracing::instrument(skip(self, plaintext))]
    pub async fn encrypt(&self, room_id: &str, plaintext: &[u8]) -> Result<GroupEnvelope, ServiceError> {
        let mut state = match self.own_state(room_id).await? {
            Some(state) => state,
            None => {
                let state = SenderKeyState::generate(1);
                self.persist_own_state(room_id, &state).await?;
                state
            }
        };

        let ciphertext = state.encrypt(plaintext)?;
        self.persist_own_state(room_id, &state).await?;

        Ok(GroupEnvelope {
            version: GroupEnvelope::VERSION,
            kind: GroupEnvelope::KIND.to_string(),
            sender_id: self.own_user_id.clone(),
            room_id: room_id.to_string(),
            key_id: ciphertext.key_id,
            message: GroupCiphertextWire {
                key_id: ciphertext.key_id,
                iteration: ciphertext.iteration,
                ciphertext: ciphertext.ciphertext,
                signature: ciphertext.mac,
            },
            is_group_e2e: true,
        })
    }

    /// Decrypt a message from another member's sender key.
    #[tracing::instrument(skip(self, envelope))]
    pub async fn decrypt(&self, envelope: &GroupEnvelope) -> Result<Vec<u8>, ServiceError> {
        let stored = self
            .store
            .get_sender_key_peer(&envelope.room_id, &envelope.sender_id)
            .await?
            .ok_or_else(|| ServiceError::NoSenderKey {
                room_id: envelope.room_id.clone(),
                sender_id: envelope.sender_id.clone(),
            })?;

        let mut record: SenderKeyRecord = serde_json::from_value(stored.record_json)?;
        if record.key_id != envelope.key_id {
            return Err(ServiceError::NoSenderKey {
                room_id: envelope.room_id.clone(),
                sender_id: envelope.sender_id.clone(),
            });
        }

        let ciphertext = GroupCiphertext {
            key_id: envelope.message.key_id,
            iteration: envelope.message.iteration,
            ciphertext: envelope.message.ciphertext.clone(),
            mac: envelope.message.signature.clone(),
        };
        let plaintext = record
            .decrypt(&ciphertext)
            .map_err(|e| ServiceError::DecryptError(e.to_string()))?;

        self.store
            .put_sender_key_peer(
                &envelope.room_id,
                &envelope.sender_id,
                &StoredSenderKeyPeer { record_json: serde_json::to_value(&record)?, updated_at: Utc::now() },
            )
            .await?;

        Ok(plaintext)
    }

    /// Handle an inbound distribution: decrypt it over the pairwise channel
    /// and install the sender's sender-key record for this room.
    #[tracing::instrument(skip(self, encrypted))]
    pub async fn on_distribution(
        &self,
        room_id: &str,
        from_sender_id: &str,
        encrypted: &e2ee_proto::PairwiseEnvelope,
    ) -> Result<(), ServiceError> {
        let payload = self.pairwise.decrypt(from_sender_id, encrypted, Some(room_id)).await?;
        let distribution: DistributionMessage = serde_json::from_slice(&payload)?;
        let record = SenderKeyRecord::from_distribution(&distribution, self.config.max_ratchet_steps)?;

        self.store
            .put_sender_key_peer(
                room_id,
                from_sender_id,
                &StoredSenderKeyPeer { record_json: serde_json::to_value(&record)?, updated_at: Utc::now() },
            )
            .await?;

        let membership = RoomMembership::new(room_id, self.members(room_id).await?);
        if !membership.contains(from_sender_id) {
            let mut member_ids = membership.member_ids;
            member_ids.push(from_sender_id.to_string());
            self.put_members(room_id, &member_ids).await?;
        }
        Ok(())
    }

    /// A new member joined: send them (only) our current sender key.
    #[tracing::instrument(skip(self))]
    pub async fn on_member_joined(&self, room_id: &str, new_member_id: &str) -> Result<(), ServiceError> {
        let state = match self.own_state(room_id).await? {
            Some(state) => state,
            None => {
                let state = SenderKeyState::generate(1);
                self.persist_own_state(room_id, &state).await?;
                state
            }
        };

        let membership = RoomMembership::new(room_id, self.members(room_id).await?);
        if !membership.contains(new_member_id) {
            let mut member_ids = membership.member_ids;
            member_ids.push(new_member_id.to_string());
            self.put_members(room_id, &member_ids).await?;
        }

        self.send_distribution(room_id, new_member_id, &state).await
    }

    /// A member left: drop their sender-key record, rotate our own key
    /// (new key id), and redistribute to everyone still in the room.
    #[tracing::instrument(skip(self))]
    pub async fn on_member_left(&self, room_id: &str, left_member_id: &str) -> Result<(), ServiceError> {
        self.store.delete_sender_key_peer(room_id, left_member_id).await?;

        let membership = RoomMembership::new(room_id, self.members(room_id).await?);
        let members = membership.without(left_member_id);
        self.put_members(room_id, &members).await?;

        let next_key_id = self.own_state(room_id).await?.map(|s| s.key_id + 1).unwrap_or(1);
        let state = SenderKeyState::generate(next_key_id);
        self.persist_own_state(room_id, &state).await?;

        for member_id in &members {
            self.send_distribution(room_id, member_id, &state).await?;
        }
        Ok(())
    }

    /// We left the room: purge our own sender key, every peer record we
    /// hold for it, and the membership list.
    #[tracing::instrument(skip(self))]
    pub async fn on_self_left(&self, room_id: &str) -> Result<(), ServiceError> {
        let members = self.members(room_id).await?;
        for member_id in &members {
            self.store.delete_sender_key_peer(room_id, member_id).await?;
        }
        self.store.delete_sender_key_own(room_id).await?;
        self.put_members(room_id, &[]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::InMemoryKeyStore;
    use crate::pairwise::PairwiseService;
    use crate::traits::{DirectoryClient, OsRng, SystemClock, Transport};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct SharedDirectory {
        bundles: StdMutex<HashMap<String, e2ee_crypto::x3dh::PrekeyBundle>>,
        inboxes: StdMutex<HashMap<String, Vec<(String, e2ee_proto::PairwiseEnvelope)>>>,
        last_registered: StdMutex<Option<e2ee_crypto::x3dh::PrekeyBundle>>,
    }

    #[async_trait]
    impl DirectoryClient for SharedDirectory {
        async fn register_keys(&self, upload: e2ee_proto::api::PrekeyBundleUpload) -> Result<(), ServiceError> {
            let bundle = e2ee_crypto::x3dh::PrekeyBundle {
                user_id: String::new(),
                registration_id: upload.registration_id,
                ik_pub: upload.identity_public,
                spk_id: upload.signed_prekey_id,
                spk_pub: upload.signed_prekey_public,
                spk_sig: upload.signed_prekey_signature,
                opk_pub: upload.one_time_prekeys.first().map(|o| o.public.clone()),
                opk_id: upload.one_time_prekeys.first().map(|o| o.key_id),
            };
            *self.last_registered.lock().unwrap() = Some(bundle);
            Ok(())
        }
        async fn get_bundle(&self, peer_user_id: &str) -> Result<e2ee_crypto::x3dh::PrekeyBundle, ServiceError> {
            self.bundles
                .lock()
                .unwrap()
                .get(peer_user_id)
                .cloned()
                .ok_or_else(|| ServiceError::TransportError("unknown peer".into()))
        }
        async fn check_enabled(&self, _peer_user_id: &str) -> Result<bool, ServiceError> {
            Ok(true)
        }
        async fn upload_prekeys(&self, _refill: e2ee_proto::api::OneTimePrekeyRefill) -> Result<(), ServiceError> {
            Ok(())
        }
        async fn set_signed_prekey(&self, _spk: e2ee_proto::api::SignedPrekeyUpload) -> Result<(), ServiceError> {
            Ok(())
        }
        async fn send_sender_key_distribution(
            &self,
            _room_id: &str,
            recipient_id: &str,
            distribution: e2ee_proto::PairwiseEnvelope,
        ) -> Result<(), ServiceError> {
            self.inboxes
                .lock()
                .unwrap()
                .entry(recipient_id.to_string())
                .or_default()
                .push(("unused".into(), distribution));
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

    async fn register(directory: &SharedDirectory, user_id: &str, pairwise: &PairwiseService) {
        pairwise.enable().await.unwrap();
        let bundle = directory.last_registered.lock().unwrap().take().unwrap();
        directory.bundles.lock().unwrap().insert(user_id.to_string(), bundle);
    }

    #[tokio::test]
    async fn group_distribution_round_trip() {
        crate::test_support::init_tracing();
        let directory = Arc::new(SharedDirectory::default());

        let store_a = Arc::new(InMemoryKeyStore::new());
        let pairwise_a = Arc::new(PairwiseService::new(
            store_a.clone(),
            directory.clone(),
            Arc::new(NoopTransport),
            Arc::new(SystemClock),
            Arc::new(OsRng),
            ServiceConfig::default(),
        ));

        let store_b = Arc::new(InMemoryKeyStore::new());
        let pairwise_b = Arc::new(PairwiseService::new(
            store_b.clone(),
            directory.clone(),
            Arc::new(NoopTransport),
            Arc::new(SystemClock),
            Arc::new(OsRng),
            ServiceConfig::default(),
        ));

        register(&directory, "alice", &pairwise_a).await;
        register(&directory, "bob", &pairwise_b).await;

        let group_a = GroupService::new(
            store_a,
            directory.clone(),
            pairwise_a,
            "alice".into(),
            ServiceConfig::default(),
        );
        let group_b = GroupService::new(
            store_b,
            directory.clone(),
            pairwise_b,
            "bob".into(),
            ServiceConfig::default(),
        );

        group_a.initialize_for_room("room1", &["bob".to_string()]).await.unwrap();

        let inbox = directory.inboxes.lock().unwrap().remove("bob").unwrap_or_default();
        for (_, envelope) in inbox {
            group_b.on_distribution("room1", "alice", &envelope).await.unwrap();
        }

        let envelope = group_a.encrypt("room1", b"gm").await.unwrap();
        let plaintext = group_b.decrypt(&envelope).await.unwrap();
        assert_eq!(plaintext, b"gm");
    }
}
