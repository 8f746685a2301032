//! In-process counter store.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::{CounterStore, StoreResult};
use crate::ratelimit::{RateLimitKey, RateLimitRecord};

/// Counter store held in a sharded concurrent map.
///
/// Suitable for single-process deployments. An update holds the shard lock
/// of its key only while the synchronous transform runs, so updates of the
/// same key serialize while other keys proceed.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: DashMap<RateLimitKey, RateLimitRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn get(&self, key: &RateLimitKey) -> StoreResult<Option<RateLimitRecord>> {
        Ok(self.records.get(key).map(|record| *record))
    }

    async fn update(
        &self,
        key: &RateLimitKey,
        apply: &mut (dyn FnMut(Option<RateLimitRecord>) -> Option<RateLimitRecord> + Send),
    ) -> StoreResult<()> {
        match self.records.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                if let Some(next) = apply(Some(*entry.get())) {
                    *entry.get_mut() = next;
                }
            }
            Entry::Vacant(entry) => {
                if let Some(next) = apply(None) {
                    entry.insert(next);
                }
            }
        }
        Ok(())
    }

    async fn remove(&self, key: &RateLimitKey) -> StoreResult<bool> {
        Ok(self.records.remove(key).is_some())
    }

    async fn purge_stale(&self, operation: &str, cutoff: i64) -> StoreResult<usize> {
        let mut purged = 0;
        self.records.retain(|key, record| {
            let stale = key.operation == operation && record.window_start <= cutoff;
            if stale {
                purged += 1;
            }
            !stale
        });
        Ok(purged)
    }

    async fn len(&self) -> StoreResult<usize> {
        Ok(self.records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn key(operation: &str, identity: &str) -> RateLimitKey {
        RateLimitKey::new(operation, identity).unwrap()
    }

    #[tokio::test]
    async fn test_update_inserts_and_mutates() {
        let store = MemoryStore::new();
        let k = key("api", "1.2.3.4");

        store
            .update(&k, &mut |current| {
                assert!(current.is_none());
                Some(RateLimitRecord::opened_at(100))
            })
            .await
            .unwrap();

        store
            .update(&k, &mut |current| {
                let mut record = current.unwrap();
                record.count += 1;
                Some(record)
            })
            .await
            .unwrap();

        let record = store.get(&k).await.unwrap().unwrap();
        assert_eq!(record.count, 2);
        assert_eq!(record.window_start, 100);
    }

    #[tokio::test]
    async fn test_update_returning_none_leaves_state() {
        let store = MemoryStore::new();
        let k = key("api", "1.2.3.4");

        store.update(&k, &mut |_| None).await.unwrap();
        assert_eq!(store.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_remove() {
        let store = MemoryStore::new();
        let k = key("auth", "1.2.3.4");

        store
            .update(&k, &mut |_| Some(RateLimitRecord::opened_at(1)))
            .await
            .unwrap();

        assert!(store.remove(&k).await.unwrap());
        assert!(!store.remove(&k).await.unwrap());
    }

    #[tokio::test]
    async fn test_purge_is_scoped_to_operation() {
        let store = MemoryStore::new();

        for (op, start) in [("auth", 0), ("auth", 500), ("api", 0)] {
            let k = key(op, &format!("10.0.0.{}", start));
            store
                .update(&k, &mut |_| Some(RateLimitRecord::opened_at(start)))
                .await
                .unwrap();
        }

        assert_eq!(store.purge_stale("auth", 100).await.unwrap(), 1);
        assert_eq!(store.len().await.unwrap(), 2);
        assert!(store.get(&key("api", "10.0.0.0")).await.unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_do_not_lose_increments() {
        let store = Arc::new(MemoryStore::new());
        let k = key("api", "1.2.3.4");

        let tasks: Vec<_> = (0..200)
            .map(|_| {
                let store = store.clone();
                let k = k.clone();
                tokio::spawn(async move {
                    store
                        .update(&k, &mut |current| {
                            let mut record = current.unwrap_or(RateLimitRecord {
                                count: 0,
                                window_start: 0,
                            });
                            record.count += 1;
                            Some(record)
                        })
                        .await
                        .unwrap();
                })
            })
            .collect();

        for task in futures::future::join_all(tasks).await {
            task.unwrap();
        }

        assert_eq!(store.get(&k).await.unwrap().unwrap().count, 200);
    }
}
