//! Client for the source activities API.

use std::sync::Arc;

use actsync_core::Endpoint;
use actsync_storage::{FetchError, HttpFetcher};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;

pub type JsonObject = JsonMap<String, JsonValue>;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("expected a JSON {expected} from {url}")]
    UnexpectedShape { url: String, expected: &'static str },
    #[error("endpoint {endpoint_id} has a token that is not a valid header value")]
    InvalidToken { endpoint_id: i64 },
}

#[async_trait]
pub trait ActivitySource: Send + Sync {
    /// `GET {url}/activities/`: the summary list, one JSON value per activity.
    async fn fetch_list(&self, endpoint: &Endpoint) -> Result<Vec<JsonValue>, SourceError>;

    /// `GET {url}/activities/{id}/`: the detail object for one activity.
    async fn fetch_detail(
        &self,
        endpoint: &Endpoint,
        activity_id: i64,
    ) -> Result<JsonObject, SourceError>;
}

pub struct RestActivitySource {
    http: Arc<HttpFetcher>,
}

impl RestActivitySource {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self { http }
    }
}

pub fn auth_headers(endpoint: &Endpoint) -> Result<HeaderMap, SourceError> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    if let Some(token) = endpoint.token.as_deref().filter(|t| !t.is_empty()) {
        let mut value = HeaderValue::from_str(&format!("Token {token}")).map_err(|_| {
            SourceError::InvalidToken {
                endpoint_id: endpoint.id,
            }
        })?;
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);
    }
    Ok(headers)
}

#[async_trait]
impl ActivitySource for RestActivitySource {
    async fn fetch_list(&self, endpoint: &Endpoint) -> Result<Vec<JsonValue>, SourceError> {
        let url = endpoint.activities_url();
        let headers = auth_headers(endpoint)?;
        match self.http.fetch_json::<JsonValue>(&url, &headers).await? {
            JsonValue::Array(items) => Ok(items),
            _ => Err(SourceError::UnexpectedShape {
                url,
                expected: "array",
            }),
        }
    }

    async fn fetch_detail(
        &self,
        endpoint: &Endpoint,
        activity_id: i64,
    ) -> Result<JsonObject, SourceError> {
        let url = endpoint.activity_detail_url(activity_id);
        let headers = auth_headers(endpoint)?;
        match self.http.fetch_json::<JsonValue>(&url, &headers).await? {
            JsonValue::Object(detail) => Ok(detail),
            _ => Err(SourceError::UnexpectedShape {
                url,
                expected: "object",
            }),
        }
    }
}

/// Detail fields overwrite summary fields with the same key.
pub fn merge_detail(summary: &JsonObject, detail: JsonObject) -> JsonObject {
    let mut merged = summary.clone();
    merged.extend(detail);
    merged
}
