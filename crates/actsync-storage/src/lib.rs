//! HTTP fetch utilities and the activity store for actsync.

pub mod http;
pub mod memory;
pub mod pg;
pub mod store;

pub use http::{
    BackoffPolicy, FetchError, FetchedResponse, HttpClientConfig, HttpFetcher, TokenBucketConfig,
};
pub use memory::{MemoryActivityStore, RecordingCacheInvalidation, StaticEndpoints};
pub use pg::PgActivityStore;
pub use store::{ActivityStore, CacheInvalidation, EndpointSource, NoopCacheInvalidation, StoreError};

pub const CRATE_NAME: &str = "actsync-storage";
