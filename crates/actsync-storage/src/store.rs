//! Store surface consumed by the sync pipeline.

use std::collections::{HashMap, HashSet};

use actsync_core::{Endpoint, StoredActivity};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("activity {activity_id} references unknown endpoint {endpoint_id}")]
    UnknownEndpoint { activity_id: i64, endpoint_id: i64 },
    #[error("{0}")]
    Unavailable(String),
}

/// Persistent table of activities keyed by the source-assigned id.
///
/// Lookups default to active rows; the `_including_retired` forms also return
/// soft-deleted rows so reappearing activities can be restored.
#[async_trait]
pub trait ActivityStore: Send + Sync {
    async fn find_active(&self, id: i64) -> Result<Option<StoredActivity>, StoreError>;

    async fn find_including_retired(&self, id: i64) -> Result<Option<StoredActivity>, StoreError>;

    async fn find_many_including_retired(
        &self,
        ids: &[i64],
    ) -> Result<HashMap<i64, StoredActivity>, StoreError>;

    /// Insert absent rows, update existing ones. `created_at` of an existing row
    /// is never overwritten. Runs as one bulk operation.
    async fn upsert_activities(&self, rows: &[StoredActivity]) -> Result<u64, StoreError>;

    /// Make sure every endpoint has a row before activities reference it.
    /// Returns the number of rows inserted or changed.
    async fn register_endpoints(&self, endpoints: &[Endpoint]) -> Result<u64, StoreError>;

    async fn active_ids_for_endpoint(&self, endpoint_id: i64) -> Result<HashSet<i64>, StoreError>;

    /// Set `deleted_at` on the given active rows. Returns the number retired.
    async fn soft_delete(&self, ids: &[i64], at: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Where the endpoint registry comes from.
#[async_trait]
pub trait EndpointSource: Send + Sync {
    async fn load_endpoints(&self) -> Result<Vec<Endpoint>, StoreError>;
}

/// Fired once per successful run so cached exports built from the table get rebuilt.
#[async_trait]
pub trait CacheInvalidation: Send + Sync {
    async fn invalidate(&self, key: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct NoopCacheInvalidation;

#[async_trait]
impl CacheInvalidation for NoopCacheInvalidation {
    async fn invalidate(&self, _key: &str) -> Result<(), StoreError> {
        Ok(())
    }
}
