//! Activity import and reconciliation: endpoint registry, filter, geocode
//! decisions, change detection, upsert and retirement.

pub mod change;
pub mod config;
pub mod filter;
pub mod geocoding;
pub mod pipeline;
pub mod registry;
pub mod scheduler;
pub mod summary;

pub use change::{content_hash, plan_write, ChangeCounts, ChangeKind, ChangeSet};
pub use config::SyncConfig;
pub use filter::{ActivityFilter, FilterRule, FilterStats, BUILTIN_RULES};
pub use geocoding::{decide, GeocodeDecision, GeocodeReason, GeocodeStats, GeocodeStep};
pub use pipeline::{run_sync_once_from_env, PipelineOptions, RunBudget, SyncError, SyncPipeline};
pub use registry::{EndpointRegistry, YamlEndpointRegistry};
pub use scheduler::{build_scheduler, maybe_build_scheduler};
pub use summary::{EndpointReport, EndpointStatus, RunSummary};

pub const CRATE_NAME: &str = "actsync-sync";
