//! Nonce registry for stamp anti-replay.
//!
//! A nonce is bound to the first comment id it is seen on. Seeing the same
//! nonce on a different comment means someone copied one of our stamps.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::store::Store;

const REGISTRY_KEY: &str = "nonces/registry";

/// Entries older than this are pruned.
const RETENTION_DAYS: i64 = 30;

/// One observed nonce and where it was first seen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NonceEntry {
    pub nonce: String,
    pub timestamp: DateTime<Utc>,
    pub repo: String,
    pub comment_id: u64,
    pub action: String,
}

/// Outcome of checking a nonce against the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceBinding {
    /// Never seen before.
    Unknown,
    /// Seen before, bound to the same comment id.
    SameComment,
    /// Seen before, bound to a different comment id: replay.
    DifferentComment,
}

/// In-memory registry with store-backed persistence.
pub struct NonceRegistry {
    entries: Mutex<HashMap<String, NonceEntry>>,
}

impl NonceRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Load the serialized registry from the store, pruning stale entries.
    pub fn load(store: &dyn Store) -> Result<Self> {
        let registry = Self::new();
        if let Some(json) = store.get(REGISTRY_KEY)? {
            let entries: Vec<NonceEntry> =
                serde_json::from_str(&json).context("Failed to parse nonce registry")?;
            let cutoff = Utc::now() - Duration::days(RETENTION_DAYS);
            let mut map = registry.lock()?;
            for entry in entries {
                if entry.timestamp >= cutoff {
                    map.insert(entry.nonce.clone(), entry);
                }
            }
        }
        Ok(registry)
    }

    /// Persist the registry to the store.
    pub fn save(&self, store: &dyn Store) -> Result<()> {
        let map = self.lock()?;
        let entries: Vec<&NonceEntry> = map.values().collect();
        let json = serde_json::to_string(&entries).context("Failed to serialize nonce registry")?;
        store.put(REGISTRY_KEY, &json)
    }

    /// How this nonce relates to prior observations.
    pub fn check(&self, nonce: &str, comment_id: u64) -> Result<NonceBinding> {
        let map = self.lock()?;
        Ok(match map.get(nonce) {
            None => NonceBinding::Unknown,
            Some(entry) if entry.comment_id == comment_id => NonceBinding::SameComment,
            Some(_) => NonceBinding::DifferentComment,
        })
    }

    /// Record a nonce's first binding. A later registration for the same
    /// nonce keeps the original binding.
    pub fn register(&self, entry: NonceEntry) -> Result<()> {
        let mut map = self.lock()?;
        map.entry(entry.nonce.clone()).or_insert(entry);
        Ok(())
    }

    /// Drop entries older than the retention window. Returns the count
    /// removed.
    pub fn prune(&self) -> Result<usize> {
        let cutoff = Utc::now() - Duration::days(RETENTION_DAYS);
        let mut map = self.lock()?;
        let before = map.len();
        map.retain(|_, entry| entry.timestamp >= cutoff);
        Ok(before - map.len())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, NonceEntry>>> {
        self.entries
            .lock()
            .map_err(|e| anyhow!("nonce registry lock poisoned: {}", e))
    }
}

impl Default for NonceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;

    fn entry(nonce: &str, comment_id: u64) -> NonceEntry {
        NonceEntry {
            nonce: nonce.to_string(),
            timestamp: Utc::now(),
            repo: "github:demo/app".to_string(),
            comment_id,
            action: "add_comment".to_string(),
        }
    }

    #[test]
    fn test_unknown_nonce() {
        let registry = NonceRegistry::new();
        assert_eq!(
            registry.check("deadbeef00000000", 1).unwrap(),
            NonceBinding::Unknown
        );
    }

    #[test]
    fn test_same_comment_binding() {
        let registry = NonceRegistry::new();
        registry.register(entry("aa00", 7)).unwrap();
        assert_eq!(registry.check("aa00", 7).unwrap(), NonceBinding::SameComment);
    }

    #[test]
    fn test_different_comment_is_replay() {
        let registry = NonceRegistry::new();
        registry.register(entry("aa00", 7)).unwrap();
        assert_eq!(
            registry.check("aa00", 8).unwrap(),
            NonceBinding::DifferentComment
        );
    }

    #[test]
    fn test_register_keeps_first_binding() {
        let registry = NonceRegistry::new();
        registry.register(entry("aa00", 7)).unwrap();
        registry.register(entry("aa00", 9)).unwrap();
        assert_eq!(registry.check("aa00", 7).unwrap(), NonceBinding::SameComment);
    }

    #[test]
    fn test_prune_drops_old_entries() {
        let registry = NonceRegistry::new();
        let mut old = entry("old0", 1);
        old.timestamp = Utc::now() - Duration::days(RETENTION_DAYS + 1);
        registry.register(old).unwrap();
        registry.register(entry("new0", 2)).unwrap();
        assert_eq!(registry.prune().unwrap(), 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.check("new0", 2).unwrap(), NonceBinding::SameComment);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let store = SqliteStore::new_in_memory().unwrap();
        let registry = NonceRegistry::new();
        registry.register(entry("aa00", 7)).unwrap();
        registry.save(&store).unwrap();

        let reloaded = NonceRegistry::load(&store).unwrap();
        assert_eq!(reloaded.check("aa00", 7).unwrap(), NonceBinding::SameComment);
        assert_eq!(
            reloaded.check("aa00", 8).unwrap(),
            NonceBinding::DifferentComment
        );
    }
}
