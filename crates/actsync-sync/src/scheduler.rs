use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::config::SyncConfig;
use crate::pipeline::{SyncError, SyncPipeline};

/// Scheduler that runs `pipeline` on every tick of `cron`. Not started.
pub async fn build_scheduler(pipeline: Arc<SyncPipeline>, cron: &str) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            match pipeline.run_once().await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    upserted = summary.upserted,
                    soft_deleted = summary.retirement.soft_deleted,
                    "scheduled sync finished"
                ),
                Err(SyncError::AlreadyRunning) => {
                    warn!("previous sync still running; skipping scheduled tick")
                }
                Err(error) => error!(%error, "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    pipeline: Arc<SyncPipeline>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }
    build_scheduler(pipeline, &config.sync_cron).await.map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use actsync_adapters::{ActivitySource, DisabledGeocoder, RestActivitySource};
    use actsync_storage::{HttpClientConfig, HttpFetcher, MemoryActivityStore, StaticEndpoints};

    fn pipeline() -> Arc<SyncPipeline> {
        let http = HttpFetcher::new(HttpClientConfig::default()).expect("fetcher");
        let source: Arc<dyn ActivitySource> = Arc::new(RestActivitySource::new(Arc::new(http)));
        Arc::new(SyncPipeline::new(
            Arc::new(StaticEndpoints::default()),
            source,
            Arc::new(DisabledGeocoder),
            Arc::new(MemoryActivityStore::new()),
        ))
    }

    #[tokio::test]
    async fn disabled_scheduler_is_not_built() {
        let config = SyncConfig::default();
        assert!(maybe_build_scheduler(&config, pipeline())
            .await
            .expect("scheduler")
            .is_none());
    }

    #[tokio::test]
    async fn invalid_cron_is_reported() {
        match build_scheduler(pipeline(), "not a cron").await {
            Ok(_) => panic!("invalid cron accepted"),
            Err(err) => assert!(format!("{err:#}").contains("not a cron")),
        }
    }
}
