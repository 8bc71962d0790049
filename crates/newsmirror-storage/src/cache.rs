use std::sync::Arc;

use async_trait::async_trait;
use newsmirror_core::{OrganizationalUnit, ReferenceData, StoreResult, Topic};
use tokio::sync::RwLock;
use tracing::info;

/// Where the cache reads its reference tables from.
#[async_trait]
pub trait ReferenceSource: Send + Sync {
    async fn fetch_units(&self) -> StoreResult<Vec<OrganizationalUnit>>;
    async fn fetch_topics(&self) -> StoreResult<Vec<Topic>>;
}

/// Explicit-lifecycle cache of units and topics.
///
/// Loaded once (explicitly or on first lookup) and never refreshed on its own;
/// callers that change reference rows must call [`ReferenceCache::reset`].
#[derive(Debug, Default)]
pub struct ReferenceCache {
    snapshot: RwLock<Option<Arc<ReferenceData>>>,
}

impl ReferenceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read both tables, one pass each, and replace the current snapshot.
    pub async fn load(&self, source: &dyn ReferenceSource) -> StoreResult<Arc<ReferenceData>> {
        let units = source.fetch_units().await?;
        let topics = source.fetch_topics().await?;
        let data = Arc::new(ReferenceData::new(units, topics));
        info!(
            units = data.unit_count(),
            topics = data.topic_count(),
            "reference cache loaded"
        );
        *self.snapshot.write().await = Some(data.clone());
        Ok(data)
    }

    /// Current snapshot, loading lazily when nothing has been loaded yet.
    pub async fn snapshot(&self, source: &dyn ReferenceSource) -> StoreResult<Arc<ReferenceData>> {
        if let Some(data) = self.snapshot.read().await.as_ref() {
            return Ok(data.clone());
        }
        let mut guard = self.snapshot.write().await;
        if let Some(data) = guard.as_ref() {
            return Ok(data.clone());
        }
        let units = source.fetch_units().await?;
        let topics = source.fetch_topics().await?;
        let data = Arc::new(ReferenceData::new(units, topics));
        *guard = Some(data.clone());
        Ok(data)
    }

    pub async fn unit_by_key(
        &self,
        source: &dyn ReferenceSource,
        key: &str,
    ) -> StoreResult<Option<OrganizationalUnit>> {
        Ok(self.snapshot(source).await?.unit_by_key(key).cloned())
    }

    pub async fn topic_by_code(
        &self,
        source: &dyn ReferenceSource,
        code: &str,
    ) -> StoreResult<Option<Topic>> {
        Ok(self.snapshot(source).await?.topic_by_code(code).cloned())
    }

    pub async fn reset(&self) {
        *self.snapshot.write().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct CountingSource {
        loads: AtomicUsize,
        units: Mutex<Vec<OrganizationalUnit>>,
    }

    impl CountingSource {
        fn new(name: &str) -> Self {
            Self {
                loads: AtomicUsize::new(0),
                units: Mutex::new(vec![OrganizationalUnit {
                    id: 1,
                    key: "mec".into(),
                    name: name.into(),
                    unit_type: None,
                    parent_key: None,
                }]),
            }
        }
    }

    #[async_trait]
    impl ReferenceSource for CountingSource {
        async fn fetch_units(&self) -> StoreResult<Vec<OrganizationalUnit>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(self.units.lock().unwrap().clone())
        }

        async fn fetch_topics(&self) -> StoreResult<Vec<Topic>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn unknown_keys_are_not_found_and_leave_cache_untouched() {
        let source = CountingSource::new("Ministério da Educação");
        let cache = ReferenceCache::new();
        let before = cache.load(&source).await.unwrap();

        assert_eq!(cache.unit_by_key(&source, "nonexistent").await.unwrap(), None);
        assert_eq!(cache.topic_by_code(&source, "99").await.unwrap(), None);

        let after = cache.snapshot(&source).await.unwrap();
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(source.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn first_lookup_loads_lazily() {
        let source = CountingSource::new("MEC");
        let cache = ReferenceCache::new();
        assert_eq!(source.loads.load(Ordering::SeqCst), 0);

        let unit = cache.unit_by_key(&source, "mec").await.unwrap();
        assert_eq!(unit.map(|u| u.name), Some("MEC".to_string()));
        cache.unit_by_key(&source, "mec").await.unwrap();
        assert_eq!(source.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn staleness_persists_until_reset() {
        let source = CountingSource::new("Old name");
        let cache = ReferenceCache::new();
        cache.load(&source).await.unwrap();

        source.units.lock().unwrap()[0].name = "New name".into();
        let stale = cache.unit_by_key(&source, "mec").await.unwrap().unwrap();
        assert_eq!(stale.name, "Old name");

        cache.reset().await;
        let fresh = cache.unit_by_key(&source, "mec").await.unwrap().unwrap();
        assert_eq!(fresh.name, "New name");
    }
}
