//! Device identity, linking, and encrypted key backup.
//!
//! Each `KeyStore` is scoped to one device: `device_id` is generated once on
//! first use and never changes. Linking a new device means walking it
//! through a code handshake approved on an existing device, then restoring
//! identity material from an encrypted backup — the two features compose
//! rather than duplicate each other.

use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use tokio_util::sync::CancellationToken;

use e2ee_crypto::identity::{DeviceCapabilities, DeviceCert, DeviceKeyPair, IdentityKeyPair, PublicKeyBytes};
use e2ee_crypto::kdf;
use e2ee_crypto::{aead, x3dh};
use e2ee_proto::api::{
    DeviceRegistration, DeviceSummary, KeyBackupDto, LinkRequest, LinkRequestState, LinkingCode,
    PendingLinkRequest, PrekeyBundleUpload,
};
use e2ee_store::models::{StoredIdentity, StoredSignedPrekey};
use e2ee_store::KeyStore;

use crate::config::ServiceConfig;
use crate::error::ServiceError;
use crate::traits::{Clock, DirectoryClient, Rng};

const DEVICE_ID_KEY: &str = "device_id";
const DEVICE_NAME_KEY: &str = "device_name";
const DEVICE_CERT_VALID_DAYS: i64 = 365;
const BACKUP_AAD: &[u8] = b"e2ee-backup-v1";
const BACKUP_NONCE_LEN: usize = 12;

pub struct MultiDeviceService {
    store: Arc<dyn KeyStore>,
    directory: Arc<dyn DirectoryClient>,
    clock: Arc<dyn Clock>,
    rng: Arc<dyn Rng>,
    config: ServiceConfig,
}

impl MultiDeviceService {
    /// Loads this device's id/name, generating them on first run. Never
    /// touches the network.
    pub async fn new(
        store: Arc<dyn KeyStore>,
        directory: Arc<dyn DirectoryClient>,
        clock: Arc<dyn Clock>,
        rng: Arc<dyn Rng>,
        config: ServiceConfig,
    ) -> Result<Self, ServiceError> {
        if store.get_metadata(DEVICE_ID_KEY).await?.is_none() {
            let mut raw = [0u8; 16];
            rng.fill_bytes(&mut raw);
            store.put_metadata(DEVICE_ID_KEY, &hex::encode(raw)).await?;
            store.put_metadata(DEVICE_NAME_KEY, "Unnamed Device").await?;
        }
        Ok(Self { store, directory, clock, rng, config })
    }

    pub async fn device_id(&self) -> Result<String, ServiceError> {
        self.store.get_metadata(DEVICE_ID_KEY).await?.ok_or(ServiceError::NotInitialized)
    }

    pub async fn device_name(&self) -> Result<String, ServiceError> {
        Ok(self.store.get_metadata(DEVICE_NAME_KEY).await?.unwrap_or_else(|| "Unnamed Device".to_string()))
    }

    /// Publish this device under the account, with its own prekey bundle and
    /// a `DeviceCert` binding it to the account identity key.
    #[tracing::instrument(skip(self))]
    pub async fn register_device(
        &self,
        user_id: &str,
        platform: e2ee_proto::api::DevicePlatform,
    ) -> Result<(), ServiceError> {
        let stored_identity = self.store.get_identity().await?.ok_or(ServiceError::NotInitialized)?;
        let identity = IdentityKeyPair::from_bytes(&stored_identity.identity_secret)?;
        let device_id = self.device_id().await?;
        let device_name = self.device_name().await?;

        let device_keypair = DeviceKeyPair::generate()?;
        let cert = DeviceCert::issue(
            &identity,
            &device_keypair.public,
            &device_id,
            user_id,
            DEVICE_CERT_VALID_DAYS,
            DeviceCapabilities::secondary(),
        )?;

        let now = self.clock.now();
        let (spk_secret, spk_pub, spk_sig) = x3dh::generate_signed_prekey(&identity)?;
        self.store
            .put_signed_prekey(&StoredSignedPrekey {
                key_id: stored_identity.registration_id as u32,
                public: URL_SAFE_NO_PAD.encode(spk_pub.as_bytes()),
                secret: spk_secret.to_bytes(),
                signature: URL_SAFE_NO_PAD.encode(&spk_sig),
                created_at: now,
            })
            .await?;

        let registration = DeviceRegistration {
            device_id,
            device_name,
            platform,
            device_cert: serde_json::to_value(&cert)?,
            bundle: PrekeyBundleUpload {
                registration_id: stored_identity.registration_id,
                identity_public: stored_identity.identity_public,
                signed_prekey_id: stored_identity.registration_id as u32,
                signed_prekey_public: URL_SAFE_NO_PAD.encode(spk_pub.as_bytes()),
                signed_prekey_signature: URL_SAFE_NO_PAD.encode(&spk_sig),
                one_time_prekeys: vec![],
            },
        };

        self.directory.register_device(registration).await?;
        Ok(())
    }

    pub async fn list_devices(&self) -> Result<Vec<DeviceSummary>, ServiceError> {
        Ok(self.directory.list_devices().await?)
    }

    pub async fn remove_device(&self, device_id: &str) -> Result<(), ServiceError> {
        self.directory.remove_device(device_id).await?;
        self.store.delete_device(device_id).await?;
        Ok(())
    }

    pub async fn rename_device(&self, new_name: &str) -> Result<(), ServiceError> {
        let device_id = self.device_id().await?;
        self.directory.rename_device(&device_id, new_name).await?;
        self.store.put_metadata(DEVICE_NAME_KEY, new_name).await?;
        Ok(())
    }

    pub async fn generate_linking_code(&self) -> Result<LinkingCode, ServiceError> {
        Ok(self.directory.generate_linking_code().await?)
    }

    /// Run on the NEW device: submit the code shown on an already-linked
    /// device, wait for approval, then bootstrap identity material from the
    /// account's encrypted backup. Cancellable via `cancellation`.
    #[tracing::instrument(skip(self, cancellation))]
    pub async fn link_with_code(
        &self,
        code: &str,
        backup_password: &str,
        cancellation: CancellationToken,
    ) -> Result<(), ServiceError> {
        let device_id = self.device_id().await?;
        let device_name = self.device_name().await?;
        let handshake_key = DeviceKeyPair::generate()?;

        let handle = self
            .directory
            .submit_link_request(LinkRequest {
                code: code.to_string(),
                device_id_b: device_id,
                device_name_b: device_name,
                identity_public_b: handshake_key.public.to_b64(),
            })
            .await?;

        let deadline = self.clock.now() + chrono::Duration::seconds(self.config.linking_poll_window.as_secs() as i64);
        loop {
            if cancellation.is_cancelled() {
                return Err(ServiceError::Canceled);
            }
            let status = self.directory.request_status(&handle).await?;
            match status.state {
                LinkRequestState::Approved => break,
                LinkRequestState::Rejected => {
                    return Err(ServiceError::LinkingFailed("request was rejected by an existing device".into()));
                }
                LinkRequestState::Expired => return Err(ServiceError::LinkingExpired),
                LinkRequestState::Pending => {
                    if self.clock.now() >= deadline {
                        return Err(ServiceError::LinkingFailed("timed out waiting for approval".into()));
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.linking_poll_interval) => {}
                        _ = cancellation.cancelled() => return Err(ServiceError::Canceled),
                    }
                }
            }
        }

        self.restore_backup(backup_password, None).await
    }

    pub async fn pending_link_requests(&self) -> Result<Vec<PendingLinkRequest>, ServiceError> {
        Ok(self.directory.pending_link_requests().await?)
    }

    pub async fn approve_request(&self, request_id: &str) -> Result<(), ServiceError> {
        self.directory.approve_link_request(request_id).await?;
        Ok(())
    }

    pub async fn reject_request(&self, request_id: &str) -> Result<(), ServiceError> {
        self.directory.reject_link_request(request_id).await?;
        Ok(())
    }

    /// A base64 JSON blob the other device scans/compares, so verification
    /// never goes over the network unauthenticated.
    pub async fn qr_payload(&self, user_id: &str) -> Result<String, ServiceError> {
        let identity = self.store.get_identity().await?.ok_or(ServiceError::NotInitialized)?;
        let fingerprint = PublicKeyBytes::from_b64(&identity.identity_public)?.fingerprint();
        let device_id = self.device_id().await?;
        let payload = serde_json::json!({
            "user_id": user_id,
            "device_id": device_id,
            "fingerprint": fingerprint,
            "timestamp": self.clock.now().to_rfc3339(),
        });
        Ok(URL_SAFE_NO_PAD.encode(serde_json::to_vec(&payload)?))
    }

    pub async fn verify_by_qr(&self, expected_user_id: &str, payload: &str) -> Result<(), ServiceError> {
        let raw = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|e| ServiceError::LinkingFailed(e.to_string()))?;
        let parsed: serde_json::Value = serde_json::from_slice(&raw)?;

        let scanned_user_id = parsed
            .get("user_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ServiceError::LinkingFailed("malformed QR payload".into()))?;
        if scanned_user_id != expected_user_id {
            return Err(ServiceError::LinkingFailed("QR payload is for a different account".into()));
        }

        let device_id = parsed
            .get("device_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ServiceError::LinkingFailed("malformed QR payload".into()))?;
        let fingerprint = parsed
            .get("fingerprint")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ServiceError::LinkingFailed("malformed QR payload".into()))?;

        let device = self
            .store
            .get_device(device_id)
            .await?
            .ok_or_else(|| ServiceError::LinkingFailed("unknown device".into()))?;
        let actual_fingerprint = PublicKeyBytes::from_b64(&device.identity_public)?.fingerprint();
        if actual_fingerprint != fingerprint {
            return Err(ServiceError::LinkingFailed("fingerprint mismatch — possible key substitution".into()));
        }

        let mut verified = device;
        verified.is_verified = true;
        self.store.put_device(&verified).await?;
        Ok(())
    }

    /// Encrypt identity + signed prekey material under a password-derived
    /// key and upload it for another device to restore from.
    #[tracing::instrument(skip(self, password))]
    pub async fn create_backup(&self, password: &str) -> Result<(), ServiceError> {
        let identity = self.store.get_identity().await?.ok_or(ServiceError::NotInitialized)?;
        let spk = self.store.get_current_signed_prekey().await?.ok_or(ServiceError::NotInitialized)?;

        let payload = serde_json::json!({
            "registration_id": identity.registration_id,
            "identity_public": identity.identity_public,
            "identity_secret": URL_SAFE_NO_PAD.encode(identity.identity_secret),
            "signed_prekey_id": spk.key_id,
            "signed_prekey_public": spk.public,
            "signed_prekey_signature": spk.signature,
            "signed_prekey_secret": URL_SAFE_NO_PAD.encode(spk.secret),
        });
        let plaintext = serde_json::to_vec(&payload)?;

        let mut salt = [0u8; 16];
        self.rng.fill_bytes(&mut salt);
        let backup_key =
            kdf::backup_key_from_password(password.as_bytes(), &salt, self.config.backup_pbkdf2_iterations)?;
        let aead_out = aead::encrypt(&backup_key.0, &plaintext, BACKUP_AAD)?;
        let (iv, ciphertext) = aead_out.split_at(BACKUP_NONCE_LEN);

        self.directory
            .upload_backup(KeyBackupDto {
                version: 1,
                salt: URL_SAFE_NO_PAD.encode(salt),
                iv: URL_SAFE_NO_PAD.encode(iv),
                ciphertext: URL_SAFE_NO_PAD.encode(ciphertext),
                timestamp: self.clock.now(),
            })
            .await?;
        Ok(())
    }

    /// Restore identity + signed prekey material from a backup blob (fetched
    /// from the directory if not supplied directly). Wrong password or a
    /// corrupt blob fails closed with no partial state written.
    #[tracing::instrument(skip(self, password, blob))]
    pub async fn restore_backup(&self, password: &str, blob: Option<KeyBackupDto>) -> Result<(), ServiceError> {
        let backup = match blob {
            Some(backup) => backup,
            None => self.directory.fetch_backup().await?.ok_or(ServiceError::BackupAuthFailed)?,
        };

        let salt: [u8; 16] = URL_SAFE_NO_PAD
            .decode(&backup.salt)
            .map_err(|_| ServiceError::BackupAuthFailed)?
            .try_into()
            .map_err(|_| ServiceError::BackupAuthFailed)?;
        let iv = URL_SAFE_NO_PAD.decode(&backup.iv).map_err(|_| ServiceError::BackupAuthFailed)?;
        let ciphertext = URL_SAFE_NO_PAD
            .decode(&backup.ciphertext)
            .map_err(|_| ServiceError::BackupAuthFailed)?;
        let mut aead_input = Vec::with_capacity(iv.len() + ciphertext.len());
        aead_input.extend_from_slice(&iv);
        aead_input.extend_from_slice(&ciphertext);

        let backup_key =
            kdf::backup_key_from_password(password.as_bytes(), &salt, self.config.backup_pbkdf2_iterations)?;
        let plaintext = aead::decrypt(&backup_key.0, &aead_input, BACKUP_AAD).map_err(|_| ServiceError::BackupAuthFailed)?;
        let parsed: serde_json::Value =
            serde_json::from_slice(&plaintext).map_err(|_| ServiceError::BackupAuthFailed)?;

        let decode_field = |key: &str| -> Result<[u8; 32], ServiceError> {
            let encoded = parsed.get(key).and_then(|v| v.as_str()).ok_or(ServiceError::BackupAuthFailed)?;
            URL_SAFE_NO_PAD
                .decode(encoded)
                .map_err(|_| ServiceError::BackupAuthFailed)?
                .try_into()
                .map_err(|_| ServiceError::BackupAuthFailed)
        };

        let identity_secret = decode_field("identity_secret")?;
        let signed_prekey_secret = decode_field("signed_prekey_secret")?;

        let registration_id = parsed
            .get("registration_id")
            .and_then(|v| v.as_u64())
            .ok_or(ServiceError::BackupAuthFailed)? as u16;
        let identity_public = parsed
            .get("identity_public")
            .and_then(|v| v.as_str())
            .ok_or(ServiceError::BackupAuthFailed)?
            .to_string();
        let signed_prekey_id = parsed
            .get("signed_prekey_id")
            .and_then(|v| v.as_u64())
            .ok_or(ServiceError::BackupAuthFailed)? as u32;
        let signed_prekey_public = parsed
            .get("signed_prekey_public")
            .and_then(|v| v.as_str())
            .ok_or(ServiceError::BackupAuthFailed)?
            .to_string();
        let signed_prekey_signature = parsed
            .get("signed_prekey_signature")
            .and_then(|v| v.as_str())
            .ok_or(ServiceError::BackupAuthFailed)?
            .to_string();

        let now = self.clock.now();
        self.store
            .put_identity(&StoredIdentity { registration_id, identity_public, identity_secret, created_at: now })
            .await?;
        self.store
            .put_signed_prekey(&StoredSignedPrekey {
                key_id: signed_prekey_id,
                public: signed_prekey_public,
                secret: signed_prekey_secret,
                signature: signed_prekey_signature,
                created_at: now,
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::InMemoryKeyStore;
    use crate::pairwise::PairwiseService;
    use crate::traits::{OsRng, SystemClock, Transport};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

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

    #[derive(Default)]
    struct BackupOnlyDirectory {
        backup: StdMutex<Option<KeyBackupDto>>,
    }

    #[async_trait]
    impl DirectoryClient for BackupOnlyDirectory {
        async fn register_keys(&self, _upload: PrekeyBundleUpload) -> Result<(), ServiceError> {
            Ok(())
        }
        async fn get_bundle(&self, _peer_user_id: &str) -> Result<e2ee_crypto::x3dh::PrekeyBundle, ServiceError> {
            unimplemented!()
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
            _recipient_id: &str,
            _distribution: e2ee_proto::PairwiseEnvelope,
        ) -> Result<(), ServiceError> {
            Ok(())
        }
        async fn send_group_message(&self, _envelope: e2ee_proto::GroupEnvelope) -> Result<(), ServiceError> {
            Ok(())
        }
        async fn register_device(&self, _registration: DeviceRegistration) -> Result<(), ServiceError> {
            Ok(())
        }
        async fn list_devices(&self) -> Result<Vec<DeviceSummary>, ServiceError> {
            Ok(vec![])
        }
        async fn remove_device(&self, _device_id: &str) -> Result<(), ServiceError> {
            Ok(())
        }
        async fn rename_device(&self, _device_id: &str, _name: &str) -> Result<(), ServiceError> {
            Ok(())
        }
        async fn generate_linking_code(&self) -> Result<LinkingCode, ServiceError> {
            unimplemented!()
        }
        async fn submit_link_request(&self, _request: LinkRequest) -> Result<e2ee_proto::api::LinkRequestHandle, ServiceError> {
            unimplemented!()
        }
        async fn request_status(&self, _handle: &e2ee_proto::api::LinkRequestHandle) -> Result<e2ee_proto::api::LinkRequestStatus, ServiceError> {
            unimplemented!()
        }
        async fn pending_link_requests(&self) -> Result<Vec<PendingLinkRequest>, ServiceError> {
            Ok(vec![])
        }
        async fn approve_link_request(&self, _request_id: &str) -> Result<(), ServiceError> {
            Ok(())
        }
        async fn reject_link_request(&self, _request_id: &str) -> Result<(), ServiceError> {
            Ok(())
        }
        async fn upload_backup(&self, backup: KeyBackupDto) -> Result<(), ServiceError> {
            *self.backup.lock().unwrap() = Some(backup);
            Ok(())
        }
        async fn fetch_backup(&self) -> Result<Option<KeyBackupDto>, ServiceError> {
            Ok(self.backup.lock().unwrap().clone())
        }
    }

    #[tokio::test]
    async fn backup_round_trip_with_correct_password() {
        crate::test_support::init_tracing();
        let store = Arc::new(InMemoryKeyStore::new());
        let directory = Arc::new(BackupOnlyDirectory::default());
        let pairwise = PairwiseService::new(
            store.clone(),
            directory.clone(),
            Arc::new(NoopTransport),
            Arc::new(SystemClock),
            Arc::new(OsRng),
            ServiceConfig::default(),
        );
        pairwise.enable().await.unwrap();

        let multidevice = MultiDeviceService::new(
            store.clone(),
            directory.clone(),
            Arc::new(SystemClock),
            Arc::new(OsRng),
            ServiceConfig::default(),
        )
        .await
        .unwrap();

        multidevice.create_backup("correct horse battery staple").await.unwrap();

        let fresh_store = Arc::new(InMemoryKeyStore::new());
        let fresh_multidevice = MultiDeviceService::new(
            fresh_store,
            directory.clone(),
            Arc::new(SystemClock),
            Arc::new(OsRng),
            ServiceConfig::default(),
        )
        .await
        .unwrap();
        fresh_multidevice.restore_backup("correct horse battery staple", None).await.unwrap();
    }

    #[tokio::test]
    async fn backup_restore_rejects_wrong_password() {
        let store = Arc::new(InMemoryKeyStore::new());
        let directory = Arc::new(BackupOnlyDirectory::default());
        let pairwise = PairwiseService::new(
            store.clone(),
            directory.clone(),
            Arc::new(NoopTransport),
            Arc::new(SystemClock),
            Arc::new(OsRng),
            ServiceConfig::default(),
        );
        pairwise.enable().await.unwrap();

        let multidevice = MultiDeviceService::new(
            store,
            directory.clone(),
            Arc::new(SystemClock),
            Arc::new(OsRng),
            ServiceConfig::default(),
        )
        .await
        .unwrap();
        multidevice.create_backup("right password").await.unwrap();

        let fresh_store = Arc::new(InMemoryKeyStore::new());
        let fresh_multidevice = MultiDeviceService::new(
            fresh_store,
            directory,
            Arc::new(SystemClock),
            Arc::new(OsRng),
            ServiceConfig::default(),
        )
        .await
        .unwrap();

        let err = fresh_multidevice.restore_backup("wrong password", None).await.unwrap_err();
        assert!(matches!(err, ServiceError::BackupAuthFailed));
    }
}
