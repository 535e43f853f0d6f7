//! The KV store interface (§4.5, §6): persists subscriber offsets and small
//! metadata. The storage engine itself is an external collaborator (§1) —
//! this module specifies only the contract the core consumes.

use async_trait::async_trait;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> std::io::Result<Option<Vec<u8>>>;
    async fn put(&self, key: &str, value: Vec<u8>) -> std::io::Result<()>;
    async fn iterate_prefix(&self, prefix: &str) -> std::io::Result<Vec<(String, Vec<u8>)>>;
}

/// In-memory `KvStore` used by tests and as a default when no durable
/// backend is configured.
#[derive(Default)]
pub struct InMemoryKvStore {
    entries: tokio::sync::Mutex<std::collections::BTreeMap<String, Vec<u8>>>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> std::io::Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> std::io::Result<()> {
        self.entries.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn iterate_prefix(&self, prefix: &str) -> std::io::Result<Vec<(String, Vec<u8>)>> {
        Ok(self
            .entries
            .lock()
            .await
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }
}

/// Parses the big-endian-ASCII-decimal offset convention from §6.
pub fn parse_offset(bytes: &[u8]) -> Option<u64> {
    std::str::from_utf8(bytes).ok()?.trim().parse().ok()
}

pub fn subscription_key(user_id: &str, application_id: &str, path: &str) -> String {
    format!("subscription/{user_id}/{application_id}/{path}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let kv = InMemoryKvStore::new();
        kv.put("subscription/u/a/x", b"5".to_vec()).await.unwrap();
        let value = kv.get("subscription/u/a/x").await.unwrap().unwrap();
        assert_eq!(parse_offset(&value), Some(5));
    }

    #[tokio::test]
    async fn iterate_prefix_filters_by_prefix() {
        let kv = InMemoryKvStore::new();
        kv.put("subscription/u/a/x", b"1".to_vec()).await.unwrap();
        kv.put("subscription/u/b/y", b"2".to_vec()).await.unwrap();
        kv.put("other/z", b"3".to_vec()).await.unwrap();
        let results = kv.iterate_prefix("subscription/u/").await.unwrap();
        assert_eq!(results.len(), 2);
    }
}
