//! Persistent store port and its SQLite implementation.
//!
//! The store is memento-style key/value: instance id, key metadata, audit
//! counter, audit entries, and the serialized nonce registry all live in
//! the `memento` table. Secret material (the HMAC signing keys) lives in a
//! separate `secrets` table and never crosses the plain KV surface.

mod sqlite;

pub use sqlite::SqliteStore;

use anyhow::Result;

/// Abstraction over durable storage for testability. All operations are
/// synchronous and cheap; callers on hot async paths should keep
/// individual calls small (single key reads/writes).
pub trait Store: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn put(&self, key: &str, value: &str) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
    /// All `(key, value)` pairs whose key starts with `prefix`, key-ordered.
    fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>>;

    fn get_secret(&self, name: &str) -> Result<Option<Vec<u8>>>;
    fn put_secret(&self, name: &str, value: &[u8]) -> Result<()>;
    fn delete_secret(&self, name: &str) -> Result<()>;
}
