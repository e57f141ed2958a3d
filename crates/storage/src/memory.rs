use std::collections::HashMap;
use std::sync::Mutex;

use snafu::ensure;

use super::KeyValueStore;
use super::error::{EmptyKeySnafu, LockPoisonedSnafu, StorageResult};

/// Process-local store. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a store with existing entries.
    pub fn with_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: Mutex::new(
                entries
                    .into_iter()
                    .map(|(key, value)| (key.into(), value.into()))
                    .collect(),
            ),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map_or(0, |entries| entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| LockPoisonedSnafu { stage: "memory-get" }.build())?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        ensure!(!key.is_empty(), EmptyKeySnafu { stage: "memory-set" });
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| LockPoisonedSnafu { stage: "memory-set" }.build())?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| LockPoisonedSnafu {
                stage: "memory-remove",
            }
            .build())?;
        entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_overwrites_and_remove_forgets() {
        let store = MemoryStore::with_entries([("auth_token", "old")]);
        store.set("auth_token", "new").unwrap();
        assert_eq!(store.get("auth_token").unwrap().as_deref(), Some("new"));

        store.remove("auth_token").unwrap();
        assert_eq!(store.get("auth_token").unwrap(), None);
        assert!(store.is_empty());

        // Removing an absent key is not an error.
        store.remove("auth_token").unwrap();
    }

    #[test]
    fn empty_keys_are_rejected() {
        let store = MemoryStore::new();
        assert!(store.set("", "value").is_err());
    }
}
