use std::collections::BTreeMap;

use actsync_adapters::NormalizeOutcome;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::change::ChangeCounts;
use crate::filter::FilterStats;
use crate::geocoding::GeocodeStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointStatus {
    Ok,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct EndpointReport {
    pub endpoint_id: i64,
    pub url: String,
    pub status: EndpointStatus,
    pub listed: usize,
    pub malformed: usize,
    pub kept: usize,
    pub detailed: usize,
    pub detail_failed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NormalizeStats {
    pub locations_corrected: usize,
    pub descriptions_sanitized: usize,
    pub sanitizer_fallbacks: usize,
}

impl NormalizeStats {
    pub fn record(&mut self, outcome: NormalizeOutcome) {
        self.locations_corrected += usize::from(outcome.location_corrected);
        self.descriptions_sanitized += usize::from(outcome.description_sanitized);
        self.sanitizer_fallbacks += usize::from(outcome.sanitizer_fallback);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetirementStats {
    pub skipped: bool,
    pub soft_deleted: usize,
    pub failed_endpoints: Vec<i64>,
    pub retired_by_endpoint: BTreeMap<i64, usize>,
}

/// Counts for every stage of one run. Serialized as the run report.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub endpoints_total: usize,
    pub endpoints_succeeded: usize,
    pub endpoints_failed: usize,
    pub fetched: usize,
    pub malformed: usize,
    pub filter: FilterStats,
    pub detailed: usize,
    pub detail_failed: usize,
    pub duplicates: usize,
    pub normalize: NormalizeStats,
    pub geocode: GeocodeStats,
    pub changes: ChangeCounts,
    pub upserted: u64,
    pub retirement: RetirementStats,
    pub cache_invalidated: bool,
    pub endpoints: Vec<EndpointReport>,
}

impl RunSummary {
    pub fn new(run_id: Uuid, started_at: DateTime<Utc>, endpoints_total: usize) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: started_at,
            endpoints_total,
            endpoints_succeeded: 0,
            endpoints_failed: 0,
            fetched: 0,
            malformed: 0,
            filter: FilterStats::default(),
            detailed: 0,
            detail_failed: 0,
            duplicates: 0,
            normalize: NormalizeStats::default(),
            geocode: GeocodeStats::default(),
            changes: ChangeCounts::default(),
            upserted: 0,
            retirement: RetirementStats::default(),
            cache_invalidated: false,
            endpoints: Vec::new(),
        }
    }

    pub(crate) fn record_endpoint(&mut self, report: EndpointReport) {
        match report.status {
            EndpointStatus::Ok => self.endpoints_succeeded += 1,
            EndpointStatus::Failed => self.endpoints_failed += 1,
        }
        self.fetched += report.listed;
        self.malformed += report.malformed;
        self.detailed += report.detailed;
        self.detail_failed += report.detail_failed;
        self.endpoints.push(report);
    }
}
