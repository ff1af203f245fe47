//! Geocoding clients: free-text location to latitude/longitude.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use actsync_core::Coordinates;
use actsync_storage::{
    BackoffPolicy, FetchError, HttpClientConfig, HttpFetcher, TokenBucketConfig,
};
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde::Deserialize;
use thiserror::Error;

pub const GOOGLE_GEOCODE_URL: &str = "https://maps.googleapis.com/maps/api/geocode";
pub const NOMINATIM_URL: &str = "https://nominatim.openstreetmap.org";

#[derive(Debug, Error)]
pub enum GeocodeError {
    #[error("geocoding credential is not configured")]
    MissingCredential,
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("provider answered {status}: {message}")]
    ProviderStatus { status: String, message: String },
    #[error("malformed provider response: {0}")]
    Malformed(String),
    #[error("invalid geocoding url: {0}")]
    Url(#[from] url::ParseError),
}

/// Resolves an address to coordinates. `Ok(None)` means the provider had no match.
#[async_trait]
pub trait Geocoder: Send + Sync {
    fn provider(&self) -> &'static str;

    async fn geocode(&self, address: &str) -> Result<Option<Coordinates>, GeocodeError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeocoderKind {
    Google,
    Nominatim,
    Disabled,
}

impl FromStr for GeocoderKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "google" => Ok(Self::Google),
            "nominatim" | "osm" => Ok(Self::Nominatim),
            "disabled" | "none" | "off" => Ok(Self::Disabled),
            other => Err(format!("unknown geocoder provider {other:?}")),
        }
    }
}

impl fmt::Display for GeocoderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Google => "google",
            Self::Nominatim => "nominatim",
            Self::Disabled => "disabled",
        })
    }
}

#[derive(Debug, Clone)]
pub struct GeocoderSettings {
    pub provider: GeocoderKind,
    pub api_key: Option<String>,
    pub language: String,
    pub region: String,
    pub user_agent: String,
    pub timeout: Duration,
    pub max_retries: usize,
    pub google_base_url: String,
    pub nominatim_base_url: String,
}

impl Default for GeocoderSettings {
    fn default() -> Self {
        Self {
            provider: GeocoderKind::Google,
            api_key: None,
            language: "it".into(),
            region: "it".into(),
            user_agent: "RTIT-Activities/1.0".into(),
            timeout: Duration::from_secs(10),
            max_retries: 1,
            google_base_url: GOOGLE_GEOCODE_URL.into(),
            nominatim_base_url: NOMINATIM_URL.into(),
        }
    }
}

pub fn build_geocoder(settings: &GeocoderSettings) -> anyhow::Result<Arc<dyn Geocoder>> {
    let backoff = BackoffPolicy {
        max_retries: settings.max_retries,
        ..BackoffPolicy::default()
    };
    Ok(match settings.provider {
        GeocoderKind::Google => {
            let http = HttpFetcher::new(HttpClientConfig {
                timeout: settings.timeout,
                user_agent: Some(settings.user_agent.clone()),
                backoff,
                token_bucket: None,
            })?;
            Arc::new(GoogleGeocoder::new(Arc::new(http), settings))
        }
        GeocoderKind::Nominatim => {
            // Nominatim usage policy: at most one request per second.
            let http = HttpFetcher::new(HttpClientConfig {
                timeout: settings.timeout,
                user_agent: Some(settings.user_agent.clone()),
                backoff,
                token_bucket: Some(TokenBucketConfig {
                    capacity: 1,
                    refill_every: Duration::from_secs(1),
                }),
            })?;
            Arc::new(NominatimGeocoder::new(Arc::new(http), settings))
        }
        GeocoderKind::Disabled => Arc::new(DisabledGeocoder),
    })
}

/// Google Geocoding API, keyed. Without a key every lookup fails with
/// [`GeocodeError::MissingCredential`] and no request is made.
pub struct GoogleGeocoder {
    http: Arc<HttpFetcher>,
    api_key: Option<String>,
    base_url: String,
    language: String,
    region: String,
}

#[derive(Debug, Deserialize)]
struct GoogleResponse {
    status: String,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    results: Vec<GoogleResult>,
}

#[derive(Debug, Deserialize)]
struct GoogleResult {
    geometry: GoogleGeometry,
}

#[derive(Debug, Deserialize)]
struct GoogleGeometry {
    location: GoogleLatLng,
}

#[derive(Debug, Deserialize)]
struct GoogleLatLng {
    lat: f64,
    lng: f64,
}

impl GoogleGeocoder {
    pub fn new(http: Arc<HttpFetcher>, settings: &GeocoderSettings) -> Self {
        Self {
            http,
            api_key: settings.api_key.clone().filter(|k| !k.trim().is_empty()),
            base_url: settings.google_base_url.trim_end_matches('/').to_string(),
            language: settings.language.clone(),
            region: settings.region.clone(),
        }
    }
}

#[async_trait]
impl Geocoder for GoogleGeocoder {
    fn provider(&self) -> &'static str {
        "google"
    }

    async fn geocode(&self, address: &str) -> Result<Option<Coordinates>, GeocodeError> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(GeocodeError::MissingCredential);
        };
        let url = url::Url::parse_with_params(
            &format!("{}/json", self.base_url),
            &[
                ("address", address),
                ("key", api_key),
                ("language", self.language.as_str()),
                ("region", self.region.as_str()),
            ],
        )?;
        let response: GoogleResponse = self
            .http
            .fetch_json(url.as_str(), &HeaderMap::new())
            .await?;

        match response.status.as_str() {
            "OK" => Ok(response
                .results
                .first()
                .map(|r| Coordinates::new(r.geometry.location.lat, r.geometry.location.lng))),
            "ZERO_RESULTS" => Ok(None),
            _ => Err(GeocodeError::ProviderStatus {
                message: response.error_message.unwrap_or_default(),
                status: response.status,
            }),
        }
    }
}

/// OpenStreetMap Nominatim search.
pub struct NominatimGeocoder {
    http: Arc<HttpFetcher>,
    base_url: String,
    language: String,
}

#[derive(Debug, Deserialize)]
struct NominatimResult {
    lat: String,
    lon: String,
}

impl NominatimGeocoder {
    pub fn new(http: Arc<HttpFetcher>, settings: &GeocoderSettings) -> Self {
        Self {
            http,
            base_url: settings.nominatim_base_url.trim_end_matches('/').to_string(),
            language: settings.language.clone(),
        }
    }
}

#[async_trait]
impl Geocoder for NominatimGeocoder {
    fn provider(&self) -> &'static str {
        "nominatim"
    }

    async fn geocode(&self, address: &str) -> Result<Option<Coordinates>, GeocodeError> {
        let url = url::Url::parse_with_params(
            &format!("{}/search", self.base_url),
            &[
                ("q", address),
                ("format", "json"),
                ("accept-language", self.language.as_str()),
                ("limit", "1"),
            ],
        )?;
        let results: Vec<NominatimResult> = self
            .http
            .fetch_json(url.as_str(), &HeaderMap::new())
            .await?;
        let Some(first) = results.into_iter().next() else {
            return Ok(None);
        };
        let lat = first
            .lat
            .parse::<f64>()
            .map_err(|e| GeocodeError::Malformed(format!("lat {:?}: {e}", first.lat)))?;
        let lon = first
            .lon
            .parse::<f64>()
            .map_err(|e| GeocodeError::Malformed(format!("lon {:?}: {e}", first.lon)))?;
        Ok(Some(Coordinates::new(lat, lon)))
    }
}

#[derive(Debug, Default)]
pub struct DisabledGeocoder;

#[async_trait]
impl Geocoder for DisabledGeocoder {
    fn provider(&self) -> &'static str {
        "disabled"
    }

    async fn geocode(&self, _address: &str) -> Result<Option<Coordinates>, GeocodeError> {
        Ok(None)
    }
}
