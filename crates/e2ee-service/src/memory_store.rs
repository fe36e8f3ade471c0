//! Test-only `KeyStore`: the same trait as `SqliteKeyStore`, backed by an
//! in-memory map instead of SQLite. No encryption at rest — tests assert on
//! plaintext records directly.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use e2ee_store::error::StoreError;
use e2ee_store::models::*;
use e2ee_store::KeyStore;

#[derive(Default)]
struct State {
    identity: Option<StoredIdentity>,
    signed_prekeys: HashMap<u32, StoredSignedPrekey>,
    one_time_prekeys: HashMap<u32, StoredOneTimePrekey>,
    sessions: HashMap<String, StoredSession>,
    sender_keys_own: HashMap<String, StoredSenderKeyOwn>,
    sender_keys_peer: HashMap<(String, String), StoredSenderKeyPeer>,
    devices: HashMap<String, StoredDevice>,
    metadata: HashMap<String, String>,
}

#[derive(Default)]
pub struct InMemoryKeyStore {
    state: RwLock<State>,
}

impl InMemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyStore for InMemoryKeyStore {
    async fn put_identity(&self, identity: &StoredIdentity) -> Result<(), StoreError> {
        self.state.write().await.identity = Some(identity.clone());
        Ok(())
    }

    async fn get_identity(&self) -> Result<Option<StoredIdentity>, StoreError> {
        Ok(self.state.read().await.identity.clone())
    }

    async fn put_signed_prekey(&self, spk: &StoredSignedPrekey) -> Result<(), StoreError> {
        self.state.write().await.signed_prekeys.insert(spk.key_id, spk.clone());
        Ok(())
    }

    async fn get_signed_prekey(&self, key_id: u32) -> Result<Option<StoredSignedPrekey>, StoreError> {
        Ok(self.state.read().await.signed_prekeys.get(&key_id).cloned())
    }

    async fn get_current_signed_prekey(&self) -> Result<Option<StoredSignedPrekey>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .signed_prekeys
            .values()
            .max_by_key(|spk| spk.created_at)
            .cloned())
    }

    async fn put_one_time_prekeys(&self, batch: &[StoredOneTimePrekey]) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        for opk in batch {
            state.one_time_prekeys.insert(opk.key_id, opk.clone());
        }
        Ok(())
    }

    async fn get_one_time_prekey(&self, key_id: u32) -> Result<Option<StoredOneTimePrekey>, StoreError> {
        Ok(self.state.read().await.one_time_prekeys.get(&key_id).cloned())
    }

    async fn delete_one_time_prekey(&self, key_id: u32) -> Result<(), StoreError> {
        self.state.write().await.one_time_prekeys.remove(&key_id);
        Ok(())
    }

    async fn count_one_time_prekeys(&self) -> Result<u64, StoreError> {
        Ok(self.state.read().await.one_time_prekeys.len() as u64)
    }

    async fn get_highest_prekey_id(&self) -> Result<Option<u32>, StoreError> {
        Ok(self.state.read().await.one_time_prekeys.keys().copied().max())
    }

    async fn put_session(&self, session_key: &str, state: &StoredSession) -> Result<(), StoreError> {
        self.state.write().await.sessions.insert(session_key.to_string(), state.clone());
        Ok(())
    }

    async fn get_session(&self, session_key: &str) -> Result<Option<StoredSession>, StoreError> {
        Ok(self.state.read().await.sessions.get(session_key).cloned())
    }

    async fn delete_session(&self, session_key: &str) -> Result<(), StoreError> {
        self.state.write().await.sessions.remove(session_key);
        Ok(())
    }

    async fn get_all_sessions(&self) -> Result<Vec<(String, StoredSession)>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .sessions
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn put_sender_key_own(&self, room_id: &str, state: &StoredSenderKeyOwn) -> Result<(), StoreError> {
        self.state.write().await.sender_keys_own.insert(room_id.to_string(), state.clone());
        Ok(())
    }

    async fn get_sender_key_own(&self, room_id: &str) -> Result<Option<StoredSenderKeyOwn>, StoreError> {
        Ok(self.state.read().await.sender_keys_own.get(room_id).cloned())
    }

    async fn delete_sender_key_own(&self, room_id: &str) -> Result<(), StoreError> {
        self.state.write().await.sender_keys_own.remove(room_id);
        Ok(())
    }

    async fn put_sender_key_peer(
        &self,
        room_id: &str,
        sender_id: &str,
        record: &StoredSenderKeyPeer,
    ) -> Result<(), StoreError> {
        self.state
            .write()
            .await
            .sender_keys_peer
            .insert((room_id.to_string(), sender_id.to_string()), record.clone());
        Ok(())
    }

    async fn get_sender_key_peer(
        &self,
        room_id: &str,
        sender_id: &str,
    ) -> Result<Option<StoredSenderKeyPeer>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .sender_keys_peer
            .get(&(room_id.to_string(), sender_id.to_string()))
            .cloned())
    }

    async fn delete_sender_key_peer(&self, room_id: &str, sender_id: &str) -> Result<(), StoreError> {
        self.state
            .write()
            .await
            .sender_keys_peer
            .remove(&(room_id.to_string(), sender_id.to_string()));
        Ok(())
    }

    async fn put_device(&self, record: &StoredDevice) -> Result<(), StoreError> {
        self.state.write().await.devices.insert(record.device_id.clone(), record.clone());
        Ok(())
    }

    async fn get_device(&self, device_id: &str) -> Result<Option<StoredDevice>, StoreError> {
        Ok(self.state.read().await.devices.get(device_id).cloned())
    }

    async fn list_devices(&self) -> Result<Vec<StoredDevice>, StoreError> {
        let mut devices: Vec<_> = self.state.read().await.devices.values().cloned().collect();
        devices.sort_by_key(|d| d.enrolled_at);
        Ok(devices)
    }

    async fn delete_device(&self, device_id: &str) -> Result<(), StoreError> {
        self.state.write().await.devices.remove(device_id);
        Ok(())
    }

    async fn put_metadata(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.state.write().await.metadata.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get_metadata(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.state.read().await.metadata.get(key).cloned())
    }

    async fn clear_all(&self) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let device_key = state.metadata.get("device_key").cloned();
        *state = State::default();
        if let Some(dk) = device_key {
            state.metadata.insert("device_key".to_string(), dk);
        }
        Ok(())
    }

    async fn export_all(&self) -> Result<serde_json::Value, StoreError> {
        let state = self.state.read().await;
        Ok(serde_json::json!({
            "identity": state.identity,
            "sessions": state.sessions.iter().collect::<Vec<_>>(),
            "devices": state.devices.values().collect::<Vec<_>>(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn identity_roundtrip() {
        let store = InMemoryKeyStore::new();
        let identity = StoredIdentity {
            registration_id: 1,
            identity_public: "pub".into(),
            identity_secret: [1u8; 32],
            created_at: Utc::now(),
        };
        store.put_identity(&identity).await.unwrap();
        assert_eq!(store.get_identity().await.unwrap().unwrap().registration_id, 1);
    }

    #[tokio::test]
    async fn clear_all_keeps_device_key() {
        let store = InMemoryKeyStore::new();
        store.put_metadata("device_key", "deadbeef").await.unwrap();
        store.put_metadata("other", "x").await.unwrap();
        store.clear_all().await.unwrap();
        assert_eq!(store.get_metadata("device_key").await.unwrap(), Some("deadbeef".into()));
        assert!(store.get_metadata("other").await.unwrap().is_none());
    }
}
