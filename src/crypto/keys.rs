//! Per-instance signing identity.
//!
//! The instance id is public (it appears, truncated, in every stamp); the
//! 32-byte HMAC key lives in the store's secret table and never leaves
//! this module. Rotation keeps the previous key alive so stamps emitted
//! just before a rotation still verify.

use std::sync::Arc;
use std::sync::RwLock;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use crate::store::Store;

type HmacSha256 = Hmac<Sha256>;

const INSTANCE_ID_KEY: &str = "identity/instance_id";
const KEY_CREATED_AT_KEY: &str = "identity/key_created_at";
const SIGNING_KEY_SECRET: &str = "signing_key";
const PREVIOUS_KEY_SECRET: &str = "signing_key_previous";

/// Rotation is recommended once the active key is older than this.
const KEY_MAX_AGE_DAYS: i64 = 90;

struct KeyState {
    current: [u8; 32],
    previous: Option<[u8; 32]>,
    created_at: DateTime<Utc>,
}

/// Manages the instance id and HMAC signing keys.
pub struct KeyManager {
    store: Arc<dyn Store>,
    instance_id: String,
    state: RwLock<KeyState>,
}

impl std::fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material is deliberately absent here.
        f.debug_struct("KeyManager")
            .field("instance_id", &self.instance_id)
            .finish_non_exhaustive()
    }
}

impl KeyManager {
    /// Load the identity from the store, creating one on first run.
    pub fn init(store: Arc<dyn Store>) -> Result<Self> {
        let instance_id = match store.get(INSTANCE_ID_KEY)? {
            Some(id) => id,
            None => {
                let id = random_hex_u64();
                store.put(INSTANCE_ID_KEY, &id)?;
                id
            }
        };

        let (current, created_at) = match store.get_secret(SIGNING_KEY_SECRET)? {
            Some(bytes) => {
                let key = key_from_bytes(&bytes)?;
                let created_at = store
                    .get(KEY_CREATED_AT_KEY)?
                    .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_else(Utc::now);
                (key, created_at)
            }
            None => {
                let key = random_key();
                let now = Utc::now();
                store.put_secret(SIGNING_KEY_SECRET, &key)?;
                store.put(KEY_CREATED_AT_KEY, &now.to_rfc3339())?;
                (key, now)
            }
        };

        let previous = match store.get_secret(PREVIOUS_KEY_SECRET)? {
            Some(bytes) => Some(key_from_bytes(&bytes)?),
            None => None,
        };

        Ok(Self {
            store,
            instance_id,
            state: RwLock::new(KeyState {
                current,
                previous,
                created_at,
            }),
        })
    }

    /// Public 64-bit instance id, lowercase hex.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// First 8 hex chars of the instance id, as shown in stamp footers.
    pub fn short_id(&self) -> String {
        self.instance_id.chars().take(8).collect()
    }

    /// HMAC-SHA256 over `payload` with the current key, lowercase hex.
    pub fn sign(&self, payload: &[u8]) -> Result<String> {
        let state = self.read_state()?;
        Ok(hmac_hex(&state.current, payload))
    }

    /// Verify `signature` against the current key, then the previous key
    /// (rotation grace). Comparison is constant-time via the Mac trait.
    pub fn verify(&self, payload: &[u8], signature: &str) -> Result<bool> {
        let sig_bytes = match hex::decode(signature) {
            Ok(bytes) => bytes,
            Err(_) => return Ok(false),
        };
        let state = self.read_state()?;
        if verify_with(&state.current, payload, &sig_bytes)? {
            return Ok(true);
        }
        if let Some(prev) = &state.previous {
            return verify_with(prev, payload, &sig_bytes);
        }
        Ok(false)
    }

    /// Rotate: current becomes previous, a fresh key becomes current.
    pub fn rotate(&self) -> Result<()> {
        let mut state = self
            .state
            .write()
            .map_err(|e| anyhow::anyhow!("key state lock poisoned: {}", e))?;
        let new_key = random_key();
        let now = Utc::now();

        self.store.put_secret(PREVIOUS_KEY_SECRET, &state.current)?;
        self.store.put_secret(SIGNING_KEY_SECRET, &new_key)?;
        self.store.put(KEY_CREATED_AT_KEY, &now.to_rfc3339())?;

        state.previous = Some(state.current);
        state.current = new_key;
        state.created_at = now;
        Ok(())
    }

    /// Age of the current key.
    pub fn key_age(&self) -> Result<Duration> {
        let state = self.read_state()?;
        Ok(Utc::now() - state.created_at)
    }

    /// True once the current key is past its recommended lifetime.
    pub fn rotation_recommended(&self) -> Result<bool> {
        Ok(self.key_age()? > Duration::days(KEY_MAX_AGE_DAYS))
    }

    fn read_state(&self) -> Result<std::sync::RwLockReadGuard<'_, KeyState>> {
        self.state
            .read()
            .map_err(|e| anyhow::anyhow!("key state lock poisoned: {}", e))
    }
}

fn random_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

/// 64-bit random value as 16 lowercase hex chars.
pub fn random_hex_u64() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn key_from_bytes(bytes: &[u8]) -> Result<[u8; 32]> {
    bytes
        .try_into()
        .context("Stored signing key is not 32 bytes")
}

fn hmac_hex(key: &[u8; 32], payload: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(key).expect("HMAC-SHA256 accepts keys of any length");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

fn verify_with(key: &[u8; 32], payload: &[u8], signature: &[u8]) -> Result<bool> {
    let mut mac =
        HmacSha256::new_from_slice(key).expect("HMAC-SHA256 accepts keys of any length");
    mac.update(payload);
    Ok(mac.verify_slice(signature).is_ok())
}
