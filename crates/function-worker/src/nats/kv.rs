//! Storage service over a JetStream key/value bucket.
//!
//! Layout: one bucket key per object, `<keyspace>.<table>.<kind>.<name>`
//! with every segment token-encoded. Plain values are stored raw, maps as a
//! JSON object, sets as a JSON array and counters as a decimal string.
//! Maps, sets and counters are updated with compare-and-swap on the entry
//! revision, so concurrent branch writes never lose an update.
//!
//! JetStream replicates every write, so [`Locality`](workflow_engine::Locality)
//! hints are accepted but not acted on.

use async_nats::jetstream::kv::{Config as KvConfig, Entry, Operation, Store};
use async_nats::jetstream::Context;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use workflow_engine::storage::StorageResult;
use workflow_engine::{DataLayer, RetryPolicy, Scope, StorageError};

use super::token;

/// Attempts per compare-and-swap update before giving up.
const MAX_CAS_ATTEMPTS: usize = 64;

#[derive(Debug, Clone, Copy)]
enum Kind {
    Value,
    Map,
    Set,
    Counter,
}

impl Kind {
    fn as_str(self) -> &'static str {
        match self {
            Kind::Value => "kv",
            Kind::Map => "map",
            Kind::Set => "set",
            Kind::Counter => "ctr",
        }
    }
}

fn object_key(scope: &Scope, kind: Kind, name: &str) -> String {
    format!(
        "{}.{}.{}.{}",
        token(&scope.keyspace),
        token(&scope.table),
        kind.as_str(),
        token(name)
    )
}

/// JetStream key/value backed [`DataLayer`].
pub struct JetStreamDataLayer {
    store: Store,
    bucket: String,
    retry: RetryPolicy,
}

impl JetStreamDataLayer {
    /// Open the bucket, creating it if it does not exist yet.
    pub async fn open(js: &Context, bucket: &str) -> anyhow::Result<Self> {
        let store = match js.get_key_value(bucket).await {
            Ok(store) => {
                tracing::debug!(bucket = %bucket, "Using existing K/V bucket");
                store
            }
            Err(_) => {
                let store = js
                    .create_key_value(KvConfig {
                        bucket: bucket.to_string(),
                        description: "Workflow storage".to_string(),
                        history: 1,
                        ..Default::default()
                    })
                    .await?;
                tracing::info!(bucket = %bucket, "Created K/V bucket");
                store
            }
        };

        Ok(Self {
            store,
            bucket: bucket.to_string(),
            retry: RetryPolicy::default(),
        })
    }

    /// Current entry of a key, including delete markers.
    async fn entry(&self, key: &str) -> StorageResult<Option<Entry>> {
        let store = &self.store;
        self.retry
            .run("kv entry", move || store.entry(key))
            .await
            .map_err(transport)
    }

    async fn read(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self
            .entry(key)
            .await?
            .filter(is_live)
            .map(|entry| entry.value.to_vec()))
    }

    async fn write(&self, key: &str, value: Vec<u8>) -> StorageResult<()> {
        let store = &self.store;
        let value = &value;
        self.retry
            .run("kv put", move || store.put(key, value.clone().into()))
            .await
            .map_err(transport)?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> StorageResult<()> {
        let store = &self.store;
        self.retry
            .run("kv delete", move || store.delete(key))
            .await
            .map_err(transport)
    }

    /// Read-modify-write of one key under optimistic concurrency.
    ///
    /// `f` sees the live value (if any) and returns the replacement (`None`
    /// leaves the key untouched) along with the call's result.
    async fn modify<T, F>(&self, key: &str, mut f: F) -> StorageResult<T>
    where
        T: Send,
        F: FnMut(Option<&[u8]>) -> StorageResult<(Option<Vec<u8>>, T)> + Send,
    {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let entry = self.entry(key).await?;
            let current = entry.as_ref().filter(|e| is_live(e)).map(|e| e.value.as_ref());
            let (replacement, result) = f(current)?;

            let Some(replacement) = replacement else {
                return Ok(result);
            };

            let written = match &entry {
                Some(entry) => self
                    .store
                    .update(key, replacement.into(), entry.revision)
                    .await
                    .map_err(|e| e.to_string()),
                None => self
                    .store
                    .create(key, replacement.into())
                    .await
                    .map_err(|e| e.to_string()),
            };

            match written {
                Ok(_) => return Ok(result),
                Err(e) => {
                    tracing::debug!(key = %key, attempt, error = %e, "K/V update conflict, retrying");
                }
            }
        }

        Err(StorageError::Transport(format!(
            "update of {} did not settle after {} attempts",
            key, MAX_CAS_ATTEMPTS
        )))
    }

    async fn modify_map<T: Send>(
        &self,
        scope: &Scope,
        map: &str,
        mut f: impl FnMut(&mut BTreeMap<String, String>) -> (bool, T) + Send,
    ) -> StorageResult<T> {
        self.modify(&object_key(scope, Kind::Map, map), |current| {
            let mut entries: BTreeMap<String, String> = decode_or_default(current)?;
            let (changed, result) = f(&mut entries);
            Ok((changed.then(|| encode(&entries)).transpose()?, result))
        })
        .await
    }

    async fn modify_set<T: Send>(
        &self,
        scope: &Scope,
        set: &str,
        mut f: impl FnMut(&mut BTreeSet<String>) -> (bool, T) + Send,
    ) -> StorageResult<T> {
        self.modify(&object_key(scope, Kind::Set, set), |current| {
            let mut items: BTreeSet<String> = decode_or_default(current)?;
            let (changed, result) = f(&mut items);
            Ok((changed.then(|| encode(&items)).transpose()?, result))
        })
        .await
    }

    async fn load_map(&self, scope: &Scope, map: &str) -> StorageResult<BTreeMap<String, String>> {
        let raw = self.read(&object_key(scope, Kind::Map, map)).await?;
        decode_or_default(raw.as_deref())
    }

    async fn load_set(&self, scope: &Scope, set: &str) -> StorageResult<BTreeSet<String>> {
        let raw = self.read(&object_key(scope, Kind::Set, set)).await?;
        decode_or_default(raw.as_deref())
    }
}

#[async_trait]
impl DataLayer for JetStreamDataLayer {
    async fn get(&self, scope: &Scope, key: &str) -> StorageResult<Option<String>> {
        self.read(&object_key(scope, Kind::Value, key))
            .await?
            .map(utf8)
            .transpose()
    }

    async fn put(&self, scope: &Scope, key: &str, value: &str) -> StorageResult<()> {
        self.write(&object_key(scope, Kind::Value, key), value.as_bytes().to_vec())
            .await
    }

    async fn delete(&self, scope: &Scope, key: &str) -> StorageResult<()> {
        self.remove(&object_key(scope, Kind::Value, key)).await
    }

    async fn create_map(&self, scope: &Scope, map: &str) -> StorageResult<()> {
        self.modify(&object_key(scope, Kind::Map, map), |current| match current {
            Some(_) => Ok((None, ())),
            None => Ok((Some(encode(&BTreeMap::<String, String>::new())?), ())),
        })
        .await
    }

    async fn put_map_entry(
        &self,
        scope: &Scope,
        map: &str,
        key: &str,
        value: &str,
    ) -> StorageResult<()> {
        self.modify_map(scope, map, |entries| {
            entries.insert(key.to_string(), value.to_string());
            (true, ())
        })
        .await
    }

    async fn get_map_entry(
        &self,
        scope: &Scope,
        map: &str,
        key: &str,
    ) -> StorageResult<Option<String>> {
        Ok(self.load_map(scope, map).await?.remove(key))
    }

    async fn delete_map_entry(&self, scope: &Scope, map: &str, key: &str) -> StorageResult<()> {
        self.modify_map(scope, map, |entries| (entries.remove(key).is_some(), ()))
            .await
    }

    async fn get_map_keys(&self, scope: &Scope, map: &str) -> StorageResult<Vec<String>> {
        Ok(self.load_map(scope, map).await?.into_keys().collect())
    }

    async fn clear_map(&self, scope: &Scope, map: &str) -> StorageResult<()> {
        self.modify_map(scope, map, |entries| {
            let changed = !entries.is_empty();
            entries.clear();
            (changed, ())
        })
        .await
    }

    async fn retrieve_map(&self, scope: &Scope, map: &str) -> StorageResult<HashMap<String, String>> {
        Ok(self.load_map(scope, map).await?.into_iter().collect())
    }

    async fn delete_map(&self, scope: &Scope, map: &str) -> StorageResult<()> {
        self.remove(&object_key(scope, Kind::Map, map)).await
    }

    async fn create_set(&self, scope: &Scope, set: &str) -> StorageResult<()> {
        self.modify(&object_key(scope, Kind::Set, set), |current| match current {
            Some(_) => Ok((None, ())),
            None => Ok((Some(encode(&BTreeSet::<String>::new())?), ())),
        })
        .await
    }

    async fn add_set_entry(&self, scope: &Scope, set: &str, item: &str) -> StorageResult<()> {
        self.modify_set(scope, set, |items| (items.insert(item.to_string()), ()))
            .await
    }

    async fn remove_set_entry(&self, scope: &Scope, set: &str, item: &str) -> StorageResult<()> {
        self.modify_set(scope, set, |items| (items.remove(item), ()))
            .await
    }

    async fn contains_set_item(&self, scope: &Scope, set: &str, item: &str) -> StorageResult<bool> {
        Ok(self.load_set(scope, set).await?.contains(item))
    }

    async fn retrieve_set(&self, scope: &Scope, set: &str) -> StorageResult<BTreeSet<String>> {
        self.load_set(scope, set).await
    }

    async fn clear_set(&self, scope: &Scope, set: &str) -> StorageResult<()> {
        self.modify_set(scope, set, |items| {
            let changed = !items.is_empty();
            items.clear();
            (changed, ())
        })
        .await
    }

    async fn delete_set(&self, scope: &Scope, set: &str) -> StorageResult<()> {
        self.remove(&object_key(scope, Kind::Set, set)).await
    }

    async fn create_counter(&self, scope: &Scope, counter: &str, initial: i64) -> StorageResult<()> {
        self.write(
            &object_key(scope, Kind::Counter, counter),
            initial.to_string().into_bytes(),
        )
        .await
    }

    async fn increment_counter(&self, scope: &Scope, counter: &str, by: i64) -> StorageResult<i64> {
        self.modify(&object_key(scope, Kind::Counter, counter), |current| {
            let value = match current {
                Some(raw) => parse_counter(raw)?,
                None => return Err(StorageError::NotFound(format!("counter {}", counter))),
            };
            let next = value + by;
            Ok((Some(next.to_string().into_bytes()), next))
        })
        .await
    }

    async fn decrement_counter(&self, scope: &Scope, counter: &str, by: i64) -> StorageResult<i64> {
        self.increment_counter(scope, counter, -by).await
    }

    async fn get_counter(&self, scope: &Scope, counter: &str) -> StorageResult<Option<i64>> {
        self.read(&object_key(scope, Kind::Counter, counter))
            .await?
            .map(|raw| parse_counter(&raw))
            .transpose()
    }

    async fn delete_counter(&self, scope: &Scope, counter: &str) -> StorageResult<()> {
        self.remove(&object_key(scope, Kind::Counter, counter)).await
    }
}

impl std::fmt::Debug for JetStreamDataLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JetStreamDataLayer")
            .field("bucket", &self.bucket)
            .field("retry", &self.retry)
            .finish()
    }
}

fn is_live(entry: &Entry) -> bool {
    matches!(entry.operation, Operation::Put)
}

fn transport(e: impl std::fmt::Display) -> StorageError {
    StorageError::Transport(e.to_string())
}

fn utf8(raw: Vec<u8>) -> StorageResult<String> {
    String::from_utf8(raw).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn parse_counter(raw: &[u8]) -> StorageResult<i64> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .ok_or_else(|| StorageError::Serialization("counter is not an integer".to_string()))
}

fn encode<T: serde::Serialize>(value: &T) -> StorageResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn decode_or_default<T>(raw: Option<&[u8]>) -> StorageResult<T>
where
    T: serde::de::DeserializeOwned + Default,
{
    match raw {
        Some(bytes) => {
            serde_json::from_slice(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
        }
        None => Ok(T::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use workflow_engine::Locality;

    #[test]
    fn test_object_keys_are_distinct() {
        let scope = Scope::new("storage_alice", "defaultTable", Locality::Global);
        let value = object_key(&scope, Kind::Value, "x");
        let map = object_key(&scope, Kind::Map, "x");
        let other_table = object_key(&scope.with_table("counterTriggersTable"), Kind::Value, "x");

        assert_ne!(value, map);
        assert_ne!(value, other_table);
        assert_eq!(value.split('.').count(), 4);
        assert!(map.contains(".map."));
    }

    #[test]
    fn test_object_key_escapes_dots() {
        let scope = Scope::new("a.b", "t", Locality::Local);
        let key = object_key(&scope, Kind::Value, "result_exec.1");
        assert_eq!(key.split('.').count(), 4);
    }

    #[test]
    fn test_parse_counter() {
        assert_eq!(parse_counter(b"42").unwrap(), 42);
        assert_eq!(parse_counter(b"-3").unwrap(), -3);
        assert!(parse_counter(b"abc").is_err());
    }

    #[test]
    fn test_decode_documents() {
        let map: BTreeMap<String, String> = decode_or_default(Some(br#"{"a":"1"}"#)).unwrap();
        assert_eq!(map.get("a").map(String::as_str), Some("1"));

        let set: BTreeSet<String> = decode_or_default(None).unwrap();
        assert!(set.is_empty());

        let bad: StorageResult<BTreeSet<String>> = decode_or_default(Some(b"{"));
        assert!(matches!(bad, Err(StorageError::Serialization(_))));
    }
}
