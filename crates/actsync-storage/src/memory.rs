//! In-process store with the same upsert/retire semantics as Postgres.

use std::collections::{BTreeMap, HashMap, HashSet};

use actsync_core::{Endpoint, StoredActivity};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::store::{ActivityStore, CacheInvalidation, EndpointSource, StoreError};

#[derive(Debug, Default)]
pub struct MemoryActivityStore {
    rows: Mutex<BTreeMap<i64, StoredActivity>>,
    endpoints: Mutex<BTreeMap<i64, Endpoint>>,
    upsert_calls: Mutex<Vec<Vec<i64>>>,
}

impl MemoryActivityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<StoredActivity> {
        self.rows.lock().await.values().cloned().collect()
    }

    pub async fn registered_endpoints(&self) -> Vec<Endpoint> {
        self.endpoints.lock().await.values().cloned().collect()
    }

    /// Ids of every upsert batch received, in call order.
    pub async fn upsert_batches(&self) -> Vec<Vec<i64>> {
        self.upsert_calls.lock().await.clone()
    }
}

#[async_trait]
impl ActivityStore for MemoryActivityStore {
    async fn find_active(&self, id: i64) -> Result<Option<StoredActivity>, StoreError> {
        Ok(self
            .rows
            .lock()
            .await
            .get(&id)
            .filter(|row| !row.is_retired())
            .cloned())
    }

    async fn find_including_retired(&self, id: i64) -> Result<Option<StoredActivity>, StoreError> {
        Ok(self.rows.lock().await.get(&id).cloned())
    }

    async fn find_many_including_retired(
        &self,
        ids: &[i64],
    ) -> Result<HashMap<i64, StoredActivity>, StoreError> {
        let rows = self.rows.lock().await;
        Ok(ids
            .iter()
            .filter_map(|id| rows.get(id).map(|row| (*id, row.clone())))
            .collect())
    }

    async fn upsert_activities(&self, batch: &[StoredActivity]) -> Result<u64, StoreError> {
        {
            let endpoints = self.endpoints.lock().await;
            if let Some(orphan) = batch
                .iter()
                .find(|row| !endpoints.contains_key(&row.content.api_endpoint_id))
            {
                return Err(StoreError::UnknownEndpoint {
                    activity_id: orphan.id,
                    endpoint_id: orphan.content.api_endpoint_id,
                });
            }
        }
        let mut rows = self.rows.lock().await;
        for incoming in batch {
            match rows.get_mut(&incoming.id) {
                Some(existing) => {
                    existing.content = incoming.content.clone();
                    existing.updated_at = incoming.updated_at;
                    existing.deleted_at = incoming.deleted_at;
                }
                None => {
                    rows.insert(incoming.id, incoming.clone());
                }
            }
        }
        self.upsert_calls
            .lock()
            .await
            .push(batch.iter().map(|row| row.id).collect());
        Ok(batch.len() as u64)
    }

    async fn register_endpoints(&self, endpoints: &[Endpoint]) -> Result<u64, StoreError> {
        let mut known = self.endpoints.lock().await;
        let mut changed = 0;
        for endpoint in endpoints {
            if known.get(&endpoint.id) != Some(endpoint) {
                known.insert(endpoint.id, endpoint.clone());
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn active_ids_for_endpoint(&self, endpoint_id: i64) -> Result<HashSet<i64>, StoreError> {
        Ok(self
            .rows
            .lock()
            .await
            .values()
            .filter(|row| row.content.api_endpoint_id == endpoint_id && !row.is_retired())
            .map(|row| row.id)
            .collect())
    }

    async fn soft_delete(&self, ids: &[i64], at: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut rows = self.rows.lock().await;
        let mut retired = 0;
        for id in ids {
            if let Some(row) = rows.get_mut(id).filter(|row| !row.is_retired()) {
                row.deleted_at = Some(at);
                retired += 1;
            }
        }
        Ok(retired)
    }
}

/// Fixed endpoint list.
#[derive(Debug, Clone, Default)]
pub struct StaticEndpoints(pub Vec<Endpoint>);

#[async_trait]
impl EndpointSource for StaticEndpoints {
    async fn load_endpoints(&self) -> Result<Vec<Endpoint>, StoreError> {
        Ok(self.0.clone())
    }
}

/// Records invalidated keys instead of touching a cache.
#[derive(Debug, Default)]
pub struct RecordingCacheInvalidation {
    keys: Mutex<Vec<String>>,
}

impl RecordingCacheInvalidation {
    pub async fn keys(&self) -> Vec<String> {
        self.keys.lock().await.clone()
    }
}

#[async_trait]
impl CacheInvalidation for RecordingCacheInvalidation {
    async fn invalidate(&self, key: &str) -> Result<(), StoreError> {
        self.keys.lock().await.push(key.to_string());
        Ok(())
    }
}
