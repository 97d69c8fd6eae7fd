//! In-memory storage backend.
//!
//! Single-process stand-in for the storage service, used by tests and by
//! workers running with every state on one host.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use tokio::sync::Mutex;

use super::{DataLayer, Scope, StorageError, StorageResult};

#[derive(Debug, Default)]
struct TableData {
    values: HashMap<String, String>,
    maps: HashMap<String, HashMap<String, String>>,
    sets: HashMap<String, BTreeSet<String>>,
    counters: HashMap<String, i64>,
}

/// Storage backed by process memory.
#[derive(Debug, Default)]
pub struct MemoryDataLayer {
    tables: Mutex<HashMap<(String, String), TableData>>,
}

impl MemoryDataLayer {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    async fn with_table<T>(&self, scope: &Scope, f: impl FnOnce(&mut TableData) -> T) -> T {
        let mut tables = self.tables.lock().await;
        let table = tables
            .entry((scope.keyspace.clone(), scope.table.clone()))
            .or_default();
        f(table)
    }

    /// Total number of stored keys, map entries, set items and counters.
    pub async fn object_count(&self) -> usize {
        let tables = self.tables.lock().await;
        tables
            .values()
            .map(|t| {
                t.values.len()
                    + t.maps.values().map(HashMap::len).sum::<usize>()
                    + t.sets.values().map(BTreeSet::len).sum::<usize>()
                    + t.counters.len()
            })
            .sum()
    }

    /// Every plain key currently stored in the scope.
    pub async fn keys(&self, scope: &Scope) -> Vec<String> {
        let mut keys = self
            .with_table(scope, |t| t.values.keys().cloned().collect::<Vec<_>>())
            .await;
        keys.sort();
        keys
    }
}

#[async_trait]
impl DataLayer for MemoryDataLayer {
    async fn get(&self, scope: &Scope, key: &str) -> StorageResult<Option<String>> {
        Ok(self.with_table(scope, |t| t.values.get(key).cloned()).await)
    }

    async fn put(&self, scope: &Scope, key: &str, value: &str) -> StorageResult<()> {
        self.with_table(scope, |t| {
            t.values.insert(key.to_string(), value.to_string());
        })
        .await;
        Ok(())
    }

    async fn delete(&self, scope: &Scope, key: &str) -> StorageResult<()> {
        self.with_table(scope, |t| {
            t.values.remove(key);
        })
        .await;
        Ok(())
    }

    async fn create_map(&self, scope: &Scope, map: &str) -> StorageResult<()> {
        self.with_table(scope, |t| {
            t.maps.entry(map.to_string()).or_default();
        })
        .await;
        Ok(())
    }

    async fn put_map_entry(
        &self,
        scope: &Scope,
        map: &str,
        key: &str,
        value: &str,
    ) -> StorageResult<()> {
        self.with_table(scope, |t| {
            t.maps
                .entry(map.to_string())
                .or_default()
                .insert(key.to_string(), value.to_string());
        })
        .await;
        Ok(())
    }

    async fn get_map_entry(
        &self,
        scope: &Scope,
        map: &str,
        key: &str,
    ) -> StorageResult<Option<String>> {
        Ok(self
            .with_table(scope, |t| t.maps.get(map).and_then(|m| m.get(key)).cloned())
            .await)
    }

    async fn delete_map_entry(&self, scope: &Scope, map: &str, key: &str) -> StorageResult<()> {
        self.with_table(scope, |t| {
            if let Some(m) = t.maps.get_mut(map) {
                m.remove(key);
            }
        })
        .await;
        Ok(())
    }

    async fn get_map_keys(&self, scope: &Scope, map: &str) -> StorageResult<Vec<String>> {
        let mut keys = self
            .with_table(scope, |t| {
                t.maps
                    .get(map)
                    .map(|m| m.keys().cloned().collect::<Vec<_>>())
                    .unwrap_or_default()
            })
            .await;
        keys.sort();
        Ok(keys)
    }

    async fn clear_map(&self, scope: &Scope, map: &str) -> StorageResult<()> {
        self.with_table(scope, |t| {
            if let Some(m) = t.maps.get_mut(map) {
                m.clear();
            }
        })
        .await;
        Ok(())
    }

    async fn retrieve_map(&self, scope: &Scope, map: &str) -> StorageResult<HashMap<String, String>> {
        Ok(self
            .with_table(scope, |t| t.maps.get(map).cloned().unwrap_or_default())
            .await)
    }

    async fn delete_map(&self, scope: &Scope, map: &str) -> StorageResult<()> {
        self.with_table(scope, |t| {
            t.maps.remove(map);
        })
        .await;
        Ok(())
    }

    async fn create_set(&self, scope: &Scope, set: &str) -> StorageResult<()> {
        self.with_table(scope, |t| {
            t.sets.entry(set.to_string()).or_default();
        })
        .await;
        Ok(())
    }

    async fn add_set_entry(&self, scope: &Scope, set: &str, item: &str) -> StorageResult<()> {
        self.with_table(scope, |t| {
            t.sets
                .entry(set.to_string())
                .or_default()
                .insert(item.to_string());
        })
        .await;
        Ok(())
    }

    async fn remove_set_entry(&self, scope: &Scope, set: &str, item: &str) -> StorageResult<()> {
        self.with_table(scope, |t| {
            if let Some(s) = t.sets.get_mut(set) {
                s.remove(item);
            }
        })
        .await;
        Ok(())
    }

    async fn contains_set_item(&self, scope: &Scope, set: &str, item: &str) -> StorageResult<bool> {
        Ok(self
            .with_table(scope, |t| t.sets.get(set).is_some_and(|s| s.contains(item)))
            .await)
    }

    async fn retrieve_set(&self, scope: &Scope, set: &str) -> StorageResult<BTreeSet<String>> {
        Ok(self
            .with_table(scope, |t| t.sets.get(set).cloned().unwrap_or_default())
            .await)
    }

    async fn clear_set(&self, scope: &Scope, set: &str) -> StorageResult<()> {
        self.with_table(scope, |t| {
            if let Some(s) = t.sets.get_mut(set) {
                s.clear();
            }
        })
        .await;
        Ok(())
    }

    async fn delete_set(&self, scope: &Scope, set: &str) -> StorageResult<()> {
        self.with_table(scope, |t| {
            t.sets.remove(set);
        })
        .await;
        Ok(())
    }

    async fn create_counter(&self, scope: &Scope, counter: &str, initial: i64) -> StorageResult<()> {
        self.with_table(scope, |t| {
            t.counters.insert(counter.to_string(), initial);
        })
        .await;
        Ok(())
    }

    async fn increment_counter(&self, scope: &Scope, counter: &str, by: i64) -> StorageResult<i64> {
        self.with_table(scope, |t| match t.counters.get_mut(counter) {
            Some(value) => {
                *value += by;
                Ok(*value)
            }
            None => Err(StorageError::NotFound(format!("counter {}", counter))),
        })
        .await
    }

    async fn decrement_counter(&self, scope: &Scope, counter: &str, by: i64) -> StorageResult<i64> {
        self.increment_counter(scope, counter, -by).await
    }

    async fn get_counter(&self, scope: &Scope, counter: &str) -> StorageResult<Option<i64>> {
        Ok(self.with_table(scope, |t| t.counters.get(counter).copied()).await)
    }

    async fn delete_counter(&self, scope: &Scope, counter: &str) -> StorageResult<()> {
        self.with_table(scope, |t| {
            t.counters.remove(counter);
        })
        .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Locality;
    use std::sync::Arc;

    fn scope() -> Scope {
        Scope::new("storage_test", "defaultTable", Locality::Global)
    }

    #[tokio::test]
    async fn test_kv_and_scoping() {
        let store = MemoryDataLayer::new();
        let s = scope();
        store.put(&s, "k", "v").await.unwrap();
        assert_eq!(store.get(&s, "k").await.unwrap().as_deref(), Some("v"));

        let other = s.with_table("otherTable");
        assert_eq!(store.get(&other, "k").await.unwrap(), None);

        store.delete(&s, "k").await.unwrap();
        assert_eq!(store.get(&s, "k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_map_and_set() {
        let store = MemoryDataLayer::new();
        let s = scope();

        store.create_map(&s, "m").await.unwrap();
        store.put_map_entry(&s, "m", "b", "2").await.unwrap();
        store.put_map_entry(&s, "m", "a", "1").await.unwrap();
        assert_eq!(store.get_map_keys(&s, "m").await.unwrap(), vec!["a", "b"]);
        store.delete_map_entry(&s, "m", "a").await.unwrap();
        assert_eq!(store.retrieve_map(&s, "m").await.unwrap().len(), 1);

        store.add_set_entry(&s, "set", "x").await.unwrap();
        store.add_set_entry(&s, "set", "x").await.unwrap();
        assert!(store.contains_set_item(&s, "set", "x").await.unwrap());
        assert_eq!(store.retrieve_set(&s, "set").await.unwrap().len(), 1);
        store.delete_set(&s, "set").await.unwrap();
        assert!(store.retrieve_set(&s, "set").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_counter_concurrent_increments() {
        let store = Arc::new(MemoryDataLayer::new());
        let s = scope();
        store.create_counter(&s, "c", 0).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            let s = s.clone();
            handles.push(tokio::spawn(async move {
                store.increment_counter(&s, "c", 1).await.unwrap()
            }));
        }

        let mut seen = Vec::new();
        for handle in handles {
            seen.push(handle.await.unwrap());
        }
        seen.sort();
        assert_eq!(seen, (1..=16).collect::<Vec<i64>>());
        assert_eq!(store.get_counter(&s, "c").await.unwrap(), Some(16));
    }

    #[tokio::test]
    async fn test_missing_counter() {
        let store = MemoryDataLayer::new();
        let err = store.increment_counter(&scope(), "nope", 1).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }
}
