//! Sync orchestration: fetch every endpoint, then normalize, geocode, diff, upsert and retire.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use actsync_adapters::{
    build_geocoder, merge_detail, ActivitySource, ContentNormalizer, Geocoder, JsonObject,
    RestActivitySource,
};
use actsync_core::{ActivityContent, Endpoint, RawActivity};
use actsync_storage::{
    ActivityStore, BackoffPolicy, CacheInvalidation, EndpointSource, HttpClientConfig, HttpFetcher,
    NoopCacheInvalidation, PgActivityStore, StoreError,
};
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::change::ChangeSet;
use crate::config::SyncConfig;
use crate::filter::{ActivityFilter, FilterStats};
use crate::geocoding::GeocodeStep;
use crate::registry::YamlEndpointRegistry;
use crate::summary::{EndpointReport, EndpointStatus, RetirementStats, RunSummary};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("a sync run is already in progress")]
    AlreadyRunning,
    #[error("run exceeded its {budget:?} budget while {stage}")]
    BudgetExceeded {
        budget: Duration,
        stage: &'static str,
    },
    #[error("loading endpoint registry: {0}")]
    Registry(#[source] StoreError),
    #[error("store failure while {stage}: {source}")]
    Store {
        stage: &'static str,
        #[source]
        source: StoreError,
    },
}

/// Cooperative wall-clock limit, checked between units of work.
#[derive(Debug, Clone, Copy)]
pub struct RunBudget {
    started: Instant,
    limit: Duration,
}

impl RunBudget {
    pub fn start(limit: Duration) -> Self {
        Self {
            started: Instant::now(),
            limit,
        }
    }

    pub fn check(&self, stage: &'static str) -> Result<(), SyncError> {
        if self.started.elapsed() >= self.limit {
            return Err(SyncError::BudgetExceeded {
                budget: self.limit,
                stage,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub max_run: Duration,
    pub cache_key: String,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            max_run: Duration::from_secs(300),
            cache_key: "activities_ics".to_string(),
        }
    }
}

/// What one endpoint contributed to the run.
struct EndpointHarvest {
    report: EndpointReport,
    filter: FilterStats,
    /// Every id the list returned; `None` when the endpoint must not be retired against.
    listed_ids: Option<HashSet<i64>>,
    activities: Vec<(i64, ActivityContent)>,
}

impl EndpointHarvest {
    fn new(endpoint: &Endpoint) -> Self {
        Self {
            report: EndpointReport {
                endpoint_id: endpoint.id,
                url: endpoint.url.clone(),
                status: EndpointStatus::Ok,
                listed: 0,
                malformed: 0,
                kept: 0,
                detailed: 0,
                detail_failed: 0,
                error: None,
            },
            filter: FilterStats::default(),
            listed_ids: None,
            activities: Vec::new(),
        }
    }
}

pub struct SyncPipeline {
    endpoints: Arc<dyn EndpointSource>,
    source: Arc<dyn ActivitySource>,
    geocoder: Arc<dyn Geocoder>,
    store: Arc<dyn ActivityStore>,
    cache: Arc<dyn CacheInvalidation>,
    filter: ActivityFilter,
    normalizer: ContentNormalizer,
    options: PipelineOptions,
    run_lock: Mutex<()>,
}

impl SyncPipeline {
    pub fn new(
        endpoints: Arc<dyn EndpointSource>,
        source: Arc<dyn ActivitySource>,
        geocoder: Arc<dyn Geocoder>,
        store: Arc<dyn ActivityStore>,
    ) -> Self {
        Self {
            endpoints,
            source,
            geocoder,
            store,
            cache: Arc::new(NoopCacheInvalidation),
            filter: ActivityFilter::default(),
            normalizer: ContentNormalizer::default(),
            options: PipelineOptions::default(),
            run_lock: Mutex::new(()),
        }
    }

    pub fn with_cache_invalidation(mut self, cache: Arc<dyn CacheInvalidation>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_filter(mut self, filter: ActivityFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_normalizer(mut self, normalizer: ContentNormalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn with_options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    /// Postgres store, REST source and the configured geocoder.
    pub async fn from_config(config: &SyncConfig) -> anyhow::Result<Self> {
        let store = Arc::new(
            PgActivityStore::connect(&config.database_url)
                .await
                .context("connecting to the activity store")?,
        );
        let endpoints: Arc<dyn EndpointSource> = match &config.endpoints_file {
            Some(path) => Arc::new(YamlEndpointRegistry::new(path)),
            None => store.clone(),
        };
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: config.http_timeout(),
            user_agent: Some(config.user_agent.clone()),
            backoff: BackoffPolicy {
                max_retries: config.http_max_retries,
                ..BackoffPolicy::default()
            },
            token_bucket: None,
        })?;
        let source = Arc::new(RestActivitySource::new(Arc::new(http)));
        let geocoder = build_geocoder(&config.geocoder).context("building geocoder")?;
        let filter = ActivityFilter::from_names(&config.filter_rules);
        info!(
            rules = ?filter.rule_names(),
            geocoder = geocoder.provider(),
            "sync pipeline configured"
        );

        Ok(Self::new(endpoints, source, geocoder, store.clone())
            .with_cache_invalidation(store)
            .with_filter(filter)
            .with_options(PipelineOptions {
                max_run: config.max_run(),
                cache_key: config.cache_key.clone(),
            }))
    }

    pub async fn run_once(&self) -> Result<RunSummary, SyncError> {
        let _guard = self
            .run_lock
            .try_lock()
            .map_err(|_| SyncError::AlreadyRunning)?;
        let run_id = Uuid::new_v4();
        self.run(run_id)
            .instrument(info_span!("sync_run", %run_id))
            .await
    }

    async fn run(&self, run_id: Uuid) -> Result<RunSummary, SyncError> {
        let budget = RunBudget::start(self.options.max_run);
        let started_at = Utc::now();
        let endpoints = self
            .endpoints
            .load_endpoints()
            .await
            .map_err(SyncError::Registry)?;
        let mut summary = RunSummary::new(run_id, started_at, endpoints.len());

        if endpoints.is_empty() {
            warn!("endpoint registry is empty; nothing to sync");
            summary.retirement.skipped = true;
            summary.finished_at = Utc::now();
            return Ok(summary);
        }
        info!(endpoints = endpoints.len(), "sync run started");
        self.store
            .register_endpoints(&endpoints)
            .await
            .map_err(|source| SyncError::Store {
                stage: "registering endpoints",
                source,
            })?;

        let mut pending: BTreeMap<i64, ActivityContent> = BTreeMap::new();
        let mut listed_by_endpoint: Vec<(i64, HashSet<i64>)> = Vec::new();
        for endpoint in &endpoints {
            budget.check("fetching endpoints")?;
            let span = info_span!("endpoint", endpoint_id = endpoint.id, url = %endpoint.url);
            let harvest = self
                .harvest_endpoint(endpoint, &budget, started_at)
                .instrument(span)
                .await?;

            summary.filter.merge(&harvest.filter);
            summary.record_endpoint(harvest.report);
            if let Some(ids) = harvest.listed_ids {
                listed_by_endpoint.push((endpoint.id, ids));
            }
            for (activity_id, content) in harvest.activities {
                if let Some(previous) = pending.insert(activity_id, content) {
                    summary.duplicates += 1;
                    warn!(
                        activity_id,
                        previous_endpoint_id = previous.api_endpoint_id,
                        endpoint_id = endpoint.id,
                        "duplicate activity id; keeping the last occurrence"
                    );
                }
            }
        }

        for content in pending.values_mut() {
            let outcome = self.normalizer.normalize(content);
            summary.normalize.record(outcome);
        }

        let ids: Vec<i64> = pending.keys().copied().collect();
        let existing = if ids.is_empty() {
            HashMap::new()
        } else {
            self.store
                .find_many_including_retired(&ids)
                .await
                .map_err(|source| SyncError::Store {
                    stage: "loading stored activities",
                    source,
                })?
        };

        let geocode = GeocodeStep::new(self.geocoder.as_ref());
        for (activity_id, content) in pending.iter_mut() {
            budget.check("geocoding")?;
            let previous = existing.get(activity_id).map(|row| &row.content);
            geocode
                .apply(*activity_id, previous, content, &mut summary.geocode)
                .await;
        }

        let now = Utc::now();
        let mut changes = ChangeSet::default();
        for (activity_id, content) in pending {
            changes.push(activity_id, existing.get(&activity_id), content, now);
        }
        summary.changes = changes.counts.clone();

        budget.check("upserting")?;
        if !changes.is_empty() {
            summary.upserted = self
                .store
                .upsert_activities(&changes.rows)
                .await
                .map_err(|source| SyncError::Store {
                    stage: "upserting activities",
                    source,
                })?;
        }
        info!(
            new = summary.changes.new,
            updated = summary.changes.updated,
            restored = summary.changes.restored,
            unchanged = summary.changes.unchanged,
            upserted = summary.upserted,
            "reconciled activities"
        );

        let listed_total: usize = listed_by_endpoint.iter().map(|(_, ids)| ids.len()).sum();
        if listed_total == 0 {
            warn!("no activities listed by any endpoint; skipping retirement");
            summary.retirement.skipped = true;
        } else {
            budget.check("retiring")?;
            self.retire(&listed_by_endpoint, now, &mut summary.retirement)
                .await;
        }

        match self.cache.invalidate(&self.options.cache_key).await {
            Ok(()) => summary.cache_invalidated = true,
            Err(error) => warn!(key = %self.options.cache_key, %error, "cache invalidation failed"),
        }

        summary.finished_at = Utc::now();
        info!(
            endpoints_succeeded = summary.endpoints_succeeded,
            endpoints_failed = summary.endpoints_failed,
            fetched = summary.fetched,
            filtered_out = summary.filter.rejected(),
            detailed = summary.detailed,
            geocoded = summary.geocode.geocoded,
            soft_deleted = summary.retirement.soft_deleted,
            "sync run finished"
        );
        Ok(summary)
    }

    /// List, filter and detail-fetch one endpoint. Source failures are absorbed
    /// into the report; only the run budget aborts.
    async fn harvest_endpoint(
        &self,
        endpoint: &Endpoint,
        budget: &RunBudget,
        now: DateTime<Utc>,
    ) -> Result<EndpointHarvest, SyncError> {
        let mut harvest = EndpointHarvest::new(endpoint);

        let list = match self.source.fetch_list(endpoint).await {
            Ok(list) => list,
            Err(error) => {
                error!(endpoint_id = endpoint.id, %error, "list fetch failed; skipping endpoint");
                harvest.report.status = EndpointStatus::Failed;
                harvest.report.error = Some(error.to_string());
                return Ok(harvest);
            }
        };
        harvest.report.listed = list.len();

        let mut listed_ids = HashSet::with_capacity(list.len());
        let mut candidates: Vec<(i64, JsonObject)> = Vec::new();
        for entry in list {
            let JsonValue::Object(fields) = entry else {
                harvest.report.malformed += 1;
                warn!(endpoint_id = endpoint.id, "skipping list entry that is not an object");
                continue;
            };
            match RawActivity::from_object(fields.clone()) {
                Ok(raw) => {
                    listed_ids.insert(raw.id);
                    if self.filter.admit(&raw, now, &mut harvest.filter) {
                        candidates.push((raw.id, fields));
                    }
                }
                Err(error) => {
                    harvest.report.malformed += 1;
                    warn!(endpoint_id = endpoint.id, %error, "skipping undecodable list entry");
                }
            }
        }
        harvest.report.kept = candidates.len();

        for (activity_id, summary_fields) in candidates {
            budget.check("fetching details")?;
            let detail = match self.source.fetch_detail(endpoint, activity_id).await {
                Ok(detail) => detail,
                Err(error) => {
                    harvest.report.detail_failed += 1;
                    warn!(activity_id, %error, "detail fetch failed; dropping activity");
                    continue;
                }
            };
            match RawActivity::from_object(merge_detail(&summary_fields, detail)) {
                Ok(raw) if raw.id == activity_id => {
                    harvest.report.detailed += 1;
                    harvest
                        .activities
                        .push((activity_id, raw.into_content(endpoint.id)));
                }
                Ok(raw) => {
                    harvest.report.detail_failed += 1;
                    warn!(activity_id, detail_id = raw.id, "detail id does not match; dropping activity");
                }
                Err(error) => {
                    harvest.report.detail_failed += 1;
                    warn!(activity_id, %error, "undecodable detail payload; dropping activity");
                }
            }
        }

        if harvest.report.malformed == 0 {
            harvest.listed_ids = Some(listed_ids);
        } else {
            warn!(
                endpoint_id = endpoint.id,
                malformed = harvest.report.malformed,
                "list had unreadable entries; endpoint excluded from retirement"
            );
        }
        info!(
            listed = harvest.report.listed,
            kept = harvest.report.kept,
            detailed = harvest.report.detailed,
            detail_failed = harvest.report.detail_failed,
            "endpoint harvested"
        );
        Ok(harvest)
    }

    async fn retire(
        &self,
        listed_by_endpoint: &[(i64, HashSet<i64>)],
        now: DateTime<Utc>,
        stats: &mut RetirementStats,
    ) {
        for (endpoint_id, listed) in listed_by_endpoint {
            match self.retire_endpoint(*endpoint_id, listed, now).await {
                Ok(0) => {}
                Ok(retired) => {
                    stats.soft_deleted += retired;
                    stats.retired_by_endpoint.insert(*endpoint_id, retired);
                }
                Err(error) => {
                    error!(endpoint_id, %error, "retirement failed for endpoint");
                    stats.failed_endpoints.push(*endpoint_id);
                }
            }
        }
    }

    async fn retire_endpoint(
        &self,
        endpoint_id: i64,
        listed: &HashSet<i64>,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let active = self.store.active_ids_for_endpoint(endpoint_id).await?;
        let mut stale: Vec<i64> = active.difference(listed).copied().collect();
        if stale.is_empty() {
            return Ok(0);
        }
        stale.sort_unstable();
        let retired = self.store.soft_delete(&stale, now).await?;
        info!(endpoint_id, retired, "retired activities missing upstream");
        Ok(retired as usize)
    }
}

pub async fn run_sync_once_from_env() -> anyhow::Result<RunSummary> {
    let config = SyncConfig::from_env();
    let pipeline = SyncPipeline::from_config(&config).await?;
    Ok(pipeline.run_once().await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn budget_expires_after_its_limit() {
        let budget = RunBudget::start(Duration::from_secs(5));
        assert!(budget.check("fetching endpoints").is_ok());
        tokio::time::advance(Duration::from_secs(6)).await;
        let err = budget.check("geocoding").expect_err("expired");
        assert!(matches!(err, SyncError::BudgetExceeded { stage: "geocoding", .. }));
    }
}
