//! Storage service contract.
//!
//! Key/value, map, set and counter operations scoped by keyspace and table.
//! Implementations are expected to retry transient transport failures
//! internally; the engine treats every returned error as final.

mod memory;

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use thiserror::Error;

pub use memory::MemoryDataLayer;

/// Table holding user-visible key/value, map and set data.
pub const DEFAULT_TABLE: &str = "defaultTable";

/// Table holding fan-in counters.
pub const COUNTER_TRIGGERS_TABLE: &str = "counterTriggersTable";

/// Table holding fan-in counter metadata.
pub const COUNTER_TRIGGERS_INFO_TABLE: &str = "counterTriggersInfoTable";

/// Errors returned by a storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Backend could not be reached after retries.
    #[error("Storage transport error: {0}")]
    Transport(String),

    /// Named counter, map or set does not exist.
    #[error("Storage object not found: {0}")]
    NotFound(String),

    /// Stored data could not be encoded or decoded.
    #[error("Storage serialization error: {0}")]
    Serialization(String),
}

/// Result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Durability hint carried by every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Locality {
    /// Host-local replica is sufficient.
    Local,
    /// Write must be synchronously visible from every host.
    Global,
}

/// Keyspace/table scope of a storage call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Scope {
    pub keyspace: String,
    pub table: String,
    pub locality: Locality,
}

impl Scope {
    /// Create a scope.
    pub fn new(keyspace: impl Into<String>, table: impl Into<String>, locality: Locality) -> Self {
        Self {
            keyspace: keyspace.into(),
            table: table.into(),
            locality,
        }
    }

    /// Same keyspace, different table.
    pub fn with_table(&self, table: impl Into<String>) -> Self {
        Self {
            keyspace: self.keyspace.clone(),
            table: table.into(),
            locality: self.locality,
        }
    }
}

/// Storage service operations.
#[async_trait]
pub trait DataLayer: Send + Sync {
    // Key/value

    async fn get(&self, scope: &Scope, key: &str) -> StorageResult<Option<String>>;

    async fn put(&self, scope: &Scope, key: &str, value: &str) -> StorageResult<()>;

    async fn delete(&self, scope: &Scope, key: &str) -> StorageResult<()>;

    // Maps

    async fn create_map(&self, scope: &Scope, map: &str) -> StorageResult<()>;

    async fn put_map_entry(&self, scope: &Scope, map: &str, key: &str, value: &str)
        -> StorageResult<()>;

    async fn get_map_entry(&self, scope: &Scope, map: &str, key: &str)
        -> StorageResult<Option<String>>;

    async fn delete_map_entry(&self, scope: &Scope, map: &str, key: &str) -> StorageResult<()>;

    async fn get_map_keys(&self, scope: &Scope, map: &str) -> StorageResult<Vec<String>>;

    async fn clear_map(&self, scope: &Scope, map: &str) -> StorageResult<()>;

    async fn retrieve_map(&self, scope: &Scope, map: &str) -> StorageResult<HashMap<String, String>>;

    async fn delete_map(&self, scope: &Scope, map: &str) -> StorageResult<()>;

    // Sets

    async fn create_set(&self, scope: &Scope, set: &str) -> StorageResult<()>;

    async fn add_set_entry(&self, scope: &Scope, set: &str, item: &str) -> StorageResult<()>;

    async fn remove_set_entry(&self, scope: &Scope, set: &str, item: &str) -> StorageResult<()>;

    async fn contains_set_item(&self, scope: &Scope, set: &str, item: &str) -> StorageResult<bool>;

    async fn retrieve_set(&self, scope: &Scope, set: &str) -> StorageResult<BTreeSet<String>>;

    async fn clear_set(&self, scope: &Scope, set: &str) -> StorageResult<()>;

    async fn delete_set(&self, scope: &Scope, set: &str) -> StorageResult<()>;

    // Counters

    async fn create_counter(&self, scope: &Scope, counter: &str, initial: i64) -> StorageResult<()>;

    /// Atomically add `by` and return the new value.
    async fn increment_counter(&self, scope: &Scope, counter: &str, by: i64) -> StorageResult<i64>;

    /// Atomically subtract `by` and return the new value.
    async fn decrement_counter(&self, scope: &Scope, counter: &str, by: i64) -> StorageResult<i64>;

    async fn get_counter(&self, scope: &Scope, counter: &str) -> StorageResult<Option<i64>>;

    async fn delete_counter(&self, scope: &Scope, counter: &str) -> StorageResult<()>;
}
