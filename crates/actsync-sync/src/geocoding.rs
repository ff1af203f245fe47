//! Decides per activity whether coordinates are looked up, kept, or cleared.

use std::fmt;

use actsync_adapters::Geocoder;
use actsync_core::{ActivityContent, Coordinates};
use serde::Serialize;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GeocodeReason {
    NewActivity,
    LocationRemoved,
    LocationChanged,
    CoordinatesMissing,
    SkipPreserve,
}

impl GeocodeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewActivity => "new_activity",
            Self::LocationRemoved => "location_removed",
            Self::LocationChanged => "location_changed",
            Self::CoordinatesMissing => "coordinates_missing",
            Self::SkipPreserve => "skip_preserve",
        }
    }
}

impl fmt::Display for GeocodeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GeocodeDecision {
    Lookup(GeocodeReason),
    Clear(GeocodeReason),
    Preserve(Coordinates),
    /// New activity without a location.
    NoCoordinates,
}

/// `existing` is the stored content (retired rows included); `incoming` is already normalized.
pub fn decide(existing: Option<&ActivityContent>, incoming: &ActivityContent) -> GeocodeDecision {
    let Some(existing) = existing else {
        return match incoming.location_text() {
            Some(_) => GeocodeDecision::Lookup(GeocodeReason::NewActivity),
            None => GeocodeDecision::NoCoordinates,
        };
    };
    if incoming.location_text().is_none() {
        return GeocodeDecision::Clear(GeocodeReason::LocationRemoved);
    }
    if existing.location != incoming.location {
        return GeocodeDecision::Lookup(GeocodeReason::LocationChanged);
    }
    match existing.coordinates() {
        Some(coordinates) => GeocodeDecision::Preserve(coordinates),
        None => GeocodeDecision::Lookup(GeocodeReason::CoordinatesMissing),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GeocodeStats {
    pub requested: usize,
    pub geocoded: usize,
    pub no_match: usize,
    pub failed: usize,
    pub preserved: usize,
    pub cleared: usize,
    pub without_location: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeocodeOutcome {
    Geocoded,
    NoMatch,
    Failed,
    Preserved,
    Cleared,
    NoLocation,
}

/// Applies [`decide`] and performs the lookups it asks for.
pub struct GeocodeStep<'a> {
    geocoder: &'a dyn Geocoder,
}

impl<'a> GeocodeStep<'a> {
    pub fn new(geocoder: &'a dyn Geocoder) -> Self {
        Self { geocoder }
    }

    /// Never fails: provider errors leave the activity without coordinates.
    pub async fn apply(
        &self,
        activity_id: i64,
        existing: Option<&ActivityContent>,
        incoming: &mut ActivityContent,
        stats: &mut GeocodeStats,
    ) -> GeocodeOutcome {
        let decision = decide(existing, incoming);
        let (outcome, coordinates) = match decision {
            GeocodeDecision::NoCoordinates => (GeocodeOutcome::NoLocation, None),
            GeocodeDecision::Clear(reason) => {
                debug!(activity_id, %reason, "clearing coordinates");
                (GeocodeOutcome::Cleared, None)
            }
            GeocodeDecision::Preserve(coordinates) => (GeocodeOutcome::Preserved, Some(coordinates)),
            GeocodeDecision::Lookup(reason) => {
                stats.requested += 1;
                self.lookup(activity_id, reason, incoming).await
            }
        };
        incoming.set_coordinates(coordinates);

        match outcome {
            GeocodeOutcome::Geocoded => stats.geocoded += 1,
            GeocodeOutcome::NoMatch => stats.no_match += 1,
            GeocodeOutcome::Failed => stats.failed += 1,
            GeocodeOutcome::Preserved => stats.preserved += 1,
            GeocodeOutcome::Cleared => stats.cleared += 1,
            GeocodeOutcome::NoLocation => stats.without_location += 1,
        }
        outcome
    }

    async fn lookup(
        &self,
        activity_id: i64,
        reason: GeocodeReason,
        incoming: &ActivityContent,
    ) -> (GeocodeOutcome, Option<Coordinates>) {
        let Some(address) = incoming.location_text() else {
            return (GeocodeOutcome::NoLocation, None);
        };
        match self.geocoder.geocode(address).await {
            Ok(Some(coordinates)) => {
                debug!(activity_id, %reason, provider = self.geocoder.provider(), "geocoded location");
                (GeocodeOutcome::Geocoded, Some(coordinates.rounded()))
            }
            Ok(None) => {
                warn!(activity_id, %reason, location = address, "geocoder found no match");
                (GeocodeOutcome::NoMatch, None)
            }
            Err(error) => {
                warn!(
                    activity_id,
                    %reason,
                    location = address,
                    provider = self.geocoder.provider(),
                    %error,
                    "geocoding failed"
                );
                (GeocodeOutcome::Failed, None)
            }
        }
    }
}
