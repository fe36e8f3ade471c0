//! `KeyStore` trait and its SQLite-backed production implementation.

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool},
    Row,
};
use std::path::Path;
use tracing::{info, warn};

use crate::device_key::{self, DeviceKey};
use crate::error::StoreError;
use crate::models::*;

const AAD: &[u8] = b"e2ee-store-v1";

/// Storage operations needed by `PairwiseService`/`GroupService`/`MultiDeviceService`.
///
/// Two implementations ship: [`SqliteKeyStore`] (production) and
/// `e2ee_service::InMemoryKeyStore` (test-only, same trait).
#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn put_identity(&self, identity: &StoredIdentity) -> Result<(), StoreError>;
    async fn get_identity(&self) -> Result<Option<StoredIdentity>, StoreError>;

    async fn put_signed_prekey(&self, spk: &StoredSignedPrekey) -> Result<(), StoreError>;
    async fn get_signed_prekey(&self, key_id: u32) -> Result<Option<StoredSignedPrekey>, StoreError>;
    async fn get_current_signed_prekey(&self) -> Result<Option<StoredSignedPrekey>, StoreError>;

    async fn put_one_time_prekeys(&self, batch: &[StoredOneTimePrekey]) -> Result<(), StoreError>;
    async fn get_one_time_prekey(&self, key_id: u32) -> Result<Option<StoredOneTimePrekey>, StoreError>;
    async fn delete_one_time_prekey(&self, key_id: u32) -> Result<(), StoreError>;
    async fn count_one_time_prekeys(&self) -> Result<u64, StoreError>;
    async fn get_highest_prekey_id(&self) -> Result<Option<u32>, StoreError>;

    async fn put_session(&self, session_key: &str, state: &StoredSession) -> Result<(), StoreError>;
    async fn get_session(&self, session_key: &str) -> Result<Option<StoredSession>, StoreError>;
    async fn delete_session(&self, session_key: &str) -> Result<(), StoreError>;
    async fn get_all_sessions(&self) -> Result<Vec<(String, StoredSession)>, StoreError>;

    async fn put_sender_key_own(&self, room_id: &str, state: &StoredSenderKeyOwn) -> Result<(), StoreError>;
    async fn get_sender_key_own(&self, room_id: &str) -> Result<Option<StoredSenderKeyOwn>, StoreError>;
    async fn delete_sender_key_own(&self, room_id: &str) -> Result<(), StoreError>;
    async fn put_sender_key_peer(
        &self,
        room_id: &str,
        sender_id: &str,
        record: &StoredSenderKeyPeer,
    ) -> Result<(), StoreError>;
    async fn get_sender_key_peer(
        &self,
        room_id: &str,
        sender_id: &str,
    ) -> Result<Option<StoredSenderKeyPeer>, StoreError>;
    async fn delete_sender_key_peer(&self, room_id: &str, sender_id: &str) -> Result<(), StoreError>;

    async fn put_device(&self, record: &StoredDevice) -> Result<(), StoreError>;
    async fn get_device(&self, device_id: &str) -> Result<Option<StoredDevice>, StoreError>;
    async fn list_devices(&self) -> Result<Vec<StoredDevice>, StoreError>;
    async fn delete_device(&self, device_id: &str) -> Result<(), StoreError>;

    async fn put_metadata(&self, key: &str, value: &str) -> Result<(), StoreError>;
    async fn get_metadata(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn clear_all(&self) -> Result<(), StoreError>;
    async fn export_all(&self) -> Result<serde_json::Value, StoreError>;
}

/// Production `KeyStore`: SQLite via `sqlx`, WAL mode, migrations run on open.
#[derive(Clone)]
pub struct SqliteKeyStore {
    pool: SqlitePool,
    device_key: std::sync::Arc<DeviceKey>,
}

impl SqliteKeyStore {
    /// Open (or create) the SQLite database at `db_path`, running all pending
    /// migrations and loading (or generating) the device key.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePool::connect_with(opts).await?;

        // WAL mode is set via connection options, not inside a migration:
        // SQLite forbids changing journal_mode inside a transaction and sqlx
        // wraps every migration in one.
        crate::migrations::run::run_migrations(&pool).await?;

        let device_key = device_key::load_or_create(&pool).await?;
        info!(path = %db_path.display(), "opened key store");

        Ok(Self {
            pool,
            device_key: std::sync::Arc::new(device_key),
        })
    }

    fn encrypt_record<T: Serialize>(&self, value: &T) -> Result<String, StoreError> {
        let json = serde_json::to_vec(value)?;
        let ct = e2ee_crypto::aead::encrypt(&self.device_key.0, &json, AAD)?;
        Ok(URL_SAFE_NO_PAD.encode(ct))
    }

    fn decrypt_record<T: DeserializeOwned>(&self, b64: &str) -> Result<T, StoreError> {
        let ct = URL_SAFE_NO_PAD.decode(b64).map_err(|e| {
            warn!(error = %e, "stored record is not valid base64");
            StoreError::CorruptRecord(e.to_string())
        })?;
        let plaintext = e2ee_crypto::aead::decrypt(&self.device_key.0, &ct, AAD).map_err(|e| {
            warn!(error = %e, "stored record failed to decrypt");
            StoreError::CorruptRecord(e.to_string())
        })?;
        serde_json::from_slice(&plaintext).map_err(|e| StoreError::CorruptRecord(e.to_string()))
    }
}

#[async_trait]
impl KeyStore for SqliteKeyStore {
    async fn put_identity(&self, identity: &StoredIdentity) -> Result<(), StoreError> {
        let enc = self.encrypt_record(identity)?;
        sqlx::query(
            "INSERT INTO identity (id, identity_public, created_at, enc) VALUES (1, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET identity_public = excluded.identity_public,
                created_at = excluded.created_at, enc = excluded.enc",
        )
        .bind(&identity.identity_public)
        .bind(identity.created_at)
        .bind(enc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_identity(&self) -> Result<Option<StoredIdentity>, StoreError> {
        let row = sqlx::query("SELECT enc FROM identity WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(self.decrypt_record(row.try_get::<String, _>("enc")?.as_str())?)),
            None => Ok(None),
        }
    }

    async fn put_signed_prekey(&self, spk: &StoredSignedPrekey) -> Result<(), StoreError> {
        let enc = self.encrypt_record(spk)?;
        sqlx::query(
            "INSERT INTO signed_prekeys (key_id, created_at, enc) VALUES (?, ?, ?)
             ON CONFLICT(key_id) DO UPDATE SET created_at = excluded.created_at, enc = excluded.enc",
        )
        .bind(spk.key_id as i64)
        .bind(spk.created_at)
        .bind(enc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_signed_prekey(&self, key_id: u32) -> Result<Option<StoredSignedPrekey>, StoreError> {
        let row = sqlx::query("SELECT enc FROM signed_prekeys WHERE key_id = ?")
            .bind(key_id as i64)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(self.decrypt_record(row.try_get::<String, _>("enc")?.as_str())?)),
            None => Ok(None),
        }
    }

    async fn get_current_signed_prekey(&self) -> Result<Option<StoredSignedPrekey>, StoreError> {
        let row = sqlx::query("SELECT enc FROM signed_prekeys ORDER BY created_at DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(self.decrypt_record(row.try_get::<String, _>("enc")?.as_str())?)),
            None => Ok(None),
        }
    }

    async fn put_one_time_prekeys(&self, batch: &[StoredOneTimePrekey]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for opk in batch {
            let enc = self.encrypt_record(opk)?;
            sqlx::query(
                "INSERT INTO one_time_prekeys (key_id, created_at, enc) VALUES (?, ?, ?)
                 ON CONFLICT(key_id) DO UPDATE SET enc = excluded.enc",
            )
            .bind(opk.key_id as i64)
            .bind(Utc::now())
            .bind(enc)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_one_time_prekey(&self, key_id: u32) -> Result<Option<StoredOneTimePrekey>, StoreError> {
        let row = sqlx::query("SELECT enc FROM one_time_prekeys WHERE key_id = ?")
            .bind(key_id as i64)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(self.decrypt_record(row.try_get::<String, _>("enc")?.as_str())?)),
            None => Ok(None),
        }
    }

    async fn delete_one_time_prekey(&self, key_id: u32) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM one_time_prekeys WHERE key_id = ?")
            .bind(key_id as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn count_one_time_prekeys(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM one_time_prekeys")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn get_highest_prekey_id(&self) -> Result<Option<u32>, StoreError> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(key_id) FROM one_time_prekeys")
            .fetch_one(&self.pool)
            .await?;
        Ok(max.map(|v| v as u32))
    }

    async fn put_session(&self, session_key: &str, state: &StoredSession) -> Result<(), StoreError> {
        let enc = self.encrypt_record(state)?;
        sqlx::query(
            "INSERT INTO sessions (session_key, updated_at, enc) VALUES (?, ?, ?)
             ON CONFLICT(session_key) DO UPDATE SET updated_at = excluded.updated_at, enc = excluded.enc",
        )
        .bind(session_key)
        .bind(state.updated_at)
        .bind(enc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_session(&self, session_key: &str) -> Result<Option<StoredSession>, StoreError> {
        let row = sqlx::query("SELECT enc FROM sessions WHERE session_key = ?")
            .bind(session_key)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(self.decrypt_record(row.try_get::<String, _>("enc")?.as_str())?)),
            None => Ok(None),
        }
    }

    async fn delete_session(&self, session_key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM sessions WHERE session_key = ?")
            .bind(session_key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_all_sessions(&self) -> Result<Vec<(String, StoredSession)>, StoreError> {
        let rows = sqlx::query("SELECT session_key, enc FROM sessions")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                let key: String = row.try_get("session_key")?;
                let enc: String = row.try_get("enc")?;
                let state = self.decrypt_record(&enc)?;
                Ok((key, state))
            })
            .collect()
    }

    async fn put_sender_key_own(&self, room_id: &str, state: &StoredSenderKeyOwn) -> Result<(), StoreError> {
        let enc = self.encrypt_record(state)?;
        sqlx::query(
            "INSERT INTO sender_keys_own (room_id, updated_at, enc) VALUES (?, ?, ?)
             ON CONFLICT(room_id) DO UPDATE SET updated_at = excluded.updated_at, enc = excluded.enc",
        )
        .bind(room_id)
        .bind(state.updated_at)
        .bind(enc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_sender_key_own(&self, room_id: &str) -> Result<Option<StoredSenderKeyOwn>, StoreError> {
        let row = sqlx::query("SELECT enc FROM sender_keys_own WHERE room_id = ?")
            .bind(room_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(self.decrypt_record(row.try_get::<String, _>("enc")?.as_str())?)),
            None => Ok(None),
        }
    }

    async fn delete_sender_key_own(&self, room_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM sender_keys_own WHERE room_id = ?")
            .bind(room_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn put_sender_key_peer(
        &self,
        room_id: &str,
        sender_id: &str,
        record: &StoredSenderKeyPeer,
    ) -> Result<(), StoreError> {
        let enc = self.encrypt_record(record)?;
        sqlx::query(
            "INSERT INTO sender_keys_peer (room_id, sender_id, updated_at, enc) VALUES (?, ?, ?, ?)
             ON CONFLICT(room_id, sender_id) DO UPDATE SET updated_at = excluded.updated_at, enc = excluded.enc",
        )
        .bind(room_id)
        .bind(sender_id)
        .bind(record.updated_at)
        .bind(enc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_sender_key_peer(
        &self,
        room_id: &str,
        sender_id: &str,
    ) -> Result<Option<StoredSenderKeyPeer>, StoreError> {
        let row = sqlx::query("SELECT enc FROM sender_keys_peer WHERE room_id = ? AND sender_id = ?")
            .bind(room_id)
            .bind(sender_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(self.decrypt_record(row.try_get::<String, _>("enc")?.as_str())?)),
            None => Ok(None),
        }
    }

    async fn delete_sender_key_peer(&self, room_id: &str, sender_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM sender_keys_peer WHERE room_id = ? AND sender_id = ?")
            .bind(room_id)
            .bind(sender_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn put_device(&self, record: &StoredDevice) -> Result<(), StoreError> {
        let enc = self.encrypt_record(record)?;
        sqlx::query(
            "INSERT INTO devices (device_id, is_verified, enrolled_at, last_seen_at, enc) VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(device_id) DO UPDATE SET is_verified = excluded.is_verified,
                last_seen_at = excluded.last_seen_at, enc = excluded.enc",
        )
        .bind(&record.device_id)
        .bind(record.is_verified)
        .bind(record.enrolled_at)
        .bind(record.last_seen_at)
        .bind(enc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_device(&self, device_id: &str) -> Result<Option<StoredDevice>, StoreError> {
        let row = sqlx::query("SELECT enc FROM devices WHERE device_id = ?")
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(self.decrypt_record(row.try_get::<String, _>("enc")?.as_str())?)),
            None => Ok(None),
        }
    }

    async fn list_devices(&self) -> Result<Vec<StoredDevice>, StoreError> {
        let rows = sqlx::query("SELECT enc FROM devices ORDER BY enrolled_at ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| self.decrypt_record(row.try_get::<String, _>("enc")?.as_str()))
            .collect()
    }

    async fn delete_device(&self, device_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM devices WHERE device_id = ?")
            .bind(device_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn put_metadata(&self, key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO metadata (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_metadata(&self, key: &str) -> Result<Option<String>, StoreError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM metadata WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(v,)| v))
    }

    async fn clear_all(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for table in [
            "identity",
            "signed_prekeys",
            "one_time_prekeys",
            "sessions",
            "sender_keys_own",
            "sender_keys_peer",
            "devices",
        ] {
            sqlx::query(&format!("DELETE FROM {table}")).execute(&mut *tx).await?;
        }
        // Deliberately keep the `device_key` metadata row so the same
        // encryption key can be reused if the caller re-populates identity.
        sqlx::query("DELETE FROM metadata WHERE key != 'device_key'")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn export_all(&self) -> Result<serde_json::Value, StoreError> {
        let identity = self.get_identity().await?;
        let sessions = self.get_all_sessions().await?;
        let devices = self.list_devices().await?;
        Ok(serde_json::json!({
            "identity": identity,
            "sessions": sessions,
            "devices": devices,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    async fn open_tmp() -> (SqliteKeyStore, std::path::PathBuf) {
        let path = std::env::temp_dir().join(format!("e2ee-store-test-{}.db", uuid::Uuid::new_v4()));
        let store = SqliteKeyStore::open(&path).await.expect("open store");
        (store, path)
    }

    fn cleanup(path: &std::path::Path) {
        let _ = std::fs::remove_file(path);
        let _ = std::fs::remove_file(path.with_extension("db-wal"));
        let _ = std::fs::remove_file(path.with_extension("db-shm"));
    }

    #[tokio::test]
    async fn identity_roundtrip() {
        let (store, path) = open_tmp().await;
        let identity = StoredIdentity {
            registration_id: 42,
            identity_public: "pub".into(),
            identity_secret: [7u8; 32],
            created_at: Utc::now(),
        };
        store.put_identity(&identity).await.unwrap();
        let fetched = store.get_identity().await.unwrap().unwrap();
        assert_eq!(fetched.registration_id, 42);
        assert_eq!(fetched.identity_secret, [7u8; 32]);
        cleanup(&path);
    }

    #[tokio::test]
    async fn one_time_prekeys_counted_and_consumed() {
        let (store, path) = open_tmp().await;
        let batch: Vec<_> = (0..5)
            .map(|i| StoredOneTimePrekey {
                key_id: i,
                public: format!("pub-{i}"),
                secret: [i as u8; 32],
            })
            .collect();
        store.put_one_time_prekeys(&batch).await.unwrap();
        assert_eq!(store.count_one_time_prekeys().await.unwrap(), 5);
        assert_eq!(store.get_highest_prekey_id().await.unwrap(), Some(4));

        store.delete_one_time_prekey(2).await.unwrap();
        assert_eq!(store.count_one_time_prekeys().await.unwrap(), 4);
        assert!(store.get_one_time_prekey(2).await.unwrap().is_none());
        cleanup(&path);
    }

    #[tokio::test]
    async fn sessions_persist_across_two_peers() {
        let (store, path) = open_tmp().await;
        let key_a = session_key("alice", None);
        let key_b = session_key("bob", Some("room-1"));
        let state = StoredSession {
            state_json: serde_json::json!({"n": 1}),
            updated_at: Utc::now(),
        };
        store.put_session(&key_a, &state).await.unwrap();
        store.put_session(&key_b, &state).await.unwrap();
        assert_eq!(store.get_all_sessions().await.unwrap().len(), 2);
        store.delete_session(&key_a).await.unwrap();
        assert!(store.get_session(&key_a).await.unwrap().is_none());
        assert!(store.get_session(&key_b).await.unwrap().is_some());
        cleanup(&path);
    }

    #[tokio::test]
    async fn clear_all_keeps_device_key() {
        let (store, path) = open_tmp().await;
        store.put_metadata("foo", "bar").await.unwrap();
        store.clear_all().await.unwrap();
        assert!(store.get_metadata("foo").await.unwrap().is_none());
        assert!(store.get_metadata("device_key").await.unwrap().is_some());
        cleanup(&path);
    }
}
