pub mod error;
pub mod keys;
pub mod memory;
pub mod sqlite;

pub use error::{StorageError, StorageResult};
pub use keys::{AUTH_TOKEN_KEY, AUTH_USERNAME_KEY, StorageNamespace};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Client-local string key-value storage, the persistence layer behind sessions and transcripts.
///
/// Calls are synchronous: callers persist right after a finalizing mutation and expect the
/// write to have landed when the call returns.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> StorageResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> StorageResult<()>;
    fn remove(&self, key: &str) -> StorageResult<()>;
}
