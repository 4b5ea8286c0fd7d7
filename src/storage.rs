//! Key-value persistence seam.
//!
//! The actual backend (app data dir, browser storage, ...) is an external
//! collaborator; the core only sees string keys and serialized JSON values.
//! A missing or corrupt value always degrades to an empty default rather
//! than failing startup.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Namespaced persistence keys.
pub mod keys {
    pub const SERVERS: &str = "mcphub.servers";
    pub const CONNECTION_HISTORY: &str = "mcphub.connection_history";
    pub const PROCESSES: &str = "mcphub.processes";
    pub const TOKENS: &str = "mcphub.tokens";
    pub const TOKEN_ENDPOINTS: &str = "mcphub.token_endpoints";
    pub const LOGS: &str = "mcphub.logs";
}

/// Upper bound on persisted connection-history entries; oldest evicted.
pub const MAX_HISTORY_ENTRIES: usize = 200;

/// Opaque key-value store provided by the host application.
pub trait Storage: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: String);
    fn remove(&self, key: &str);
}

/// In-memory backend used by tests and as the default when the host
/// provides nothing durable.
#[derive(Default)]
pub struct MemoryStorage {
    map: RwLock<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.map.read().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: String) {
        if let Ok(mut map) = self.map.write() {
            map.insert(key.to_string(), value);
        }
    }

    fn remove(&self, key: &str) {
        if let Ok(mut map) = self.map.write() {
            map.remove(key);
        }
    }
}

/// Deserialize a stored value, falling back to `T::default()` when the
/// key is absent or holds something that is not valid JSON for `T`.
pub fn load_or_default<T: DeserializeOwned + Default>(storage: &dyn Storage, key: &str) -> T {
    match storage.get(key) {
        Some(raw) => match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(key, "corrupt persisted value, using default: {e}");
                T::default()
            }
        },
        None => T::default(),
    }
}

/// Serialize and store a value. Serialization failures are logged and
/// swallowed; persistence is never allowed to take down the core.
pub fn store<T: Serialize>(storage: &dyn Storage, key: &str, value: &T) {
    match serde_json::to_string(value) {
        Ok(raw) => storage.set(key, raw),
        Err(e) => tracing::error!(key, "failed to serialize for persistence: {e}"),
    }
}

/// Append to the bounded connection-history list under
/// [`keys::CONNECTION_HISTORY`].
pub fn push_history(storage: &dyn Storage, entry: serde_json::Value) {
    let mut history: Vec<serde_json::Value> = load_or_default(storage, keys::CONNECTION_HISTORY);
    history.push(entry);
    if history.len() > MAX_HISTORY_ENTRIES {
        let excess = history.len() - MAX_HISTORY_ENTRIES;
        history.drain(..excess);
    }
    store(storage, keys::CONNECTION_HISTORY, &history);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_key_yields_default() {
        let s = MemoryStorage::new();
        let v: Vec<String> = load_or_default(&s, keys::SERVERS);
        assert!(v.is_empty());
    }

    #[test]
    fn corrupt_value_yields_default() {
        let s = MemoryStorage::new();
        s.set(keys::TOKENS, "not json {{{".into());
        let v: HashMap<String, String> = load_or_default(&s, keys::TOKENS);
        assert!(v.is_empty());
    }

    #[test]
    fn round_trip() {
        let s = MemoryStorage::new();
        store(&s, keys::SERVERS, &vec!["a".to_string(), "b".to_string()]);
        let v: Vec<String> = load_or_default(&s, keys::SERVERS);
        assert_eq!(v, vec!["a", "b"]);
    }

    #[test]
    fn history_is_bounded() {
        let s = MemoryStorage::new();
        for i in 0..MAX_HISTORY_ENTRIES + 25 {
            push_history(&s, serde_json::json!({ "n": i }));
        }
        let history: Vec<serde_json::Value> = load_or_default(&s, keys::CONNECTION_HISTORY);
        assert_eq!(history.len(), MAX_HISTORY_ENTRIES);
        assert_eq!(history[0]["n"], 25, "oldest entries evicted first");
    }
}
