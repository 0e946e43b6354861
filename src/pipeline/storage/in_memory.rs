use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use super::traits::{DedupStore, StoreError, StoreResult, StoredEvent, TransformCache};
use crate::domain::Record;
use crate::idempotency::record_fingerprint;

#[derive(Default)]
struct EventIndex {
    by_fingerprint: HashMap<String, StoredEvent>,
    urls: HashSet<String>,
}

type CacheKey = (String, String, String);

/// In-memory dedup store and transform cache for development/testing
#[derive(Clone, Default)]
pub struct InMemoryStore {
    events: Arc<Mutex<EventIndex>>,
    cache: Arc<Mutex<HashMap<CacheKey, (String, f64)>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn events(&self) -> StoreResult<MutexGuard<'_, EventIndex>> {
        self.events.lock().map_err(|_| StoreError::Poisoned)
    }

    pub fn event(&self, fingerprint: &str) -> StoreResult<Option<StoredEvent>> {
        Ok(self.events()?.by_fingerprint.get(fingerprint).cloned())
    }

    pub fn cache_len(&self) -> usize {
        self.cache.lock().map(|c| c.len()).unwrap_or(0)
    }
}

#[async_trait]
impl DedupStore for InMemoryStore {
    async fn exists_by_url(&self, url: &str) -> StoreResult<bool> {
        Ok(self.events()?.urls.contains(url))
    }

    async fn exists_by_fingerprint(&self, record: &Record) -> StoreResult<bool> {
        let fingerprint = record_fingerprint(record);
        Ok(self.events()?.by_fingerprint.contains_key(&fingerprint))
    }

    async fn save(&self, record: &Record, template_name: &str) -> StoreResult<bool> {
        let event = StoredEvent::from_record(record, template_name)?;
        // One lock covers the check and the insert.
        let mut index = self.events()?;
        if index.urls.contains(&event.url) || index.by_fingerprint.contains_key(&event.fingerprint) {
            return Ok(false);
        }
        debug!("Saved event {} ({})", event.url, event.fingerprint);
        index.urls.insert(event.url.clone());
        index.by_fingerprint.insert(event.fingerprint.clone(), event);
        Ok(true)
    }

    async fn count(&self) -> StoreResult<usize> {
        Ok(self.events()?.by_fingerprint.len())
    }
}

#[async_trait]
impl TransformCache for InMemoryStore {
    async fn get(&self, template: &str, transform: &str, input: &str) -> StoreResult<Option<String>> {
        let cache = self.cache.lock().map_err(|_| StoreError::Poisoned)?;
        let key = (template.to_string(), transform.to_string(), input.to_string());
        Ok(cache.get(&key).map(|(output, _)| output.clone()))
    }

    async fn put(&self, template: &str, transform: &str, input: &str, output: &str) -> StoreResult<()> {
        let now = Utc::now().timestamp_millis() as f64 / 1000.0;
        let mut cache = self.cache.lock().map_err(|_| StoreError::Poisoned)?;
        cache.insert(
            (template.to_string(), transform.to_string(), input.to_string()),
            (output.to_string(), now),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_fingerprint_is_rejected() {
        let store = InMemoryStore::new();
        let mut r = Record::new("https://example.org/a");
        r.title = Some("A".into());
        assert!(store.save(&r, "t").await.unwrap());
        assert!(!store.save(&r, "t").await.unwrap());
        assert_eq!(store.count().await.unwrap(), 1);
        assert!(store.event(&store.fingerprint(&r)).unwrap().is_some());
    }

    #[tokio::test]
    async fn cache_put_then_get() {
        let store = InMemoryStore::new();
        store.put("t", "x", "in", "out").await.unwrap();
        store.put("t", "x", "in", "out2").await.unwrap();
        assert_eq!(store.get("t", "x", "in").await.unwrap().as_deref(), Some("out2"));
        assert_eq!(store.cache_len(), 1);
    }
}
