//! The device-local symmetric key that wraps every record in the store.
//!
//! Unlike the teacher's password-unlocked `Vault`, this key is never derived
//! from a user secret: it is generated once on first open and persisted
//! unencrypted in the `metadata` table, trusting the host storage sandbox as
//! the boundary (see `KeyStore` at-rest encryption notes). There is no lock
//! state — the key is available for the lifetime of the `Store` handle.

use zeroize::ZeroizeOnDrop;

use crate::error::StoreError;

const METADATA_KEY: &str = "device_key";

#[derive(ZeroizeOnDrop)]
pub struct DeviceKey(pub [u8; 32]);

/// Load the persisted device key, generating and storing a fresh one if
/// this is the first open.
pub async fn load_or_create(pool: &sqlx::SqlitePool) -> Result<DeviceKey, StoreError> {
    let existing: Option<(String,)> =
        sqlx::query_as("SELECT value FROM metadata WHERE key = ?")
            .bind(METADATA_KEY)
            .fetch_optional(pool)
            .await?;

    if let Some((hex_key,)) = existing {
        let bytes = hex::decode(&hex_key)
            .map_err(|e| StoreError::CorruptRecord(format!("device key is not valid hex: {e}")))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| StoreError::CorruptRecord("device key is not 32 bytes".into()))?;
        return Ok(DeviceKey(key));
    }

    let mut key = [0u8; 32];
    use rand::RngCore;
    rand::rngs::OsRng.fill_bytes(&mut key);

    sqlx::query("INSERT INTO metadata (key, value) VALUES (?, ?)")
        .bind(METADATA_KEY)
        .bind(hex::encode(key))
        .execute(pool)
        .await?;

    Ok(DeviceKey(key))
}
