//! Core domain model for activity sync: source endpoints, wire activities and stored rows.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

pub const CRATE_NAME: &str = "actsync-core";

/// Names of the fields that make up an activity's content hash.
pub const CANONICAL_FIELDS: [&str; 14] = [
    "level_id",
    "name",
    "type",
    "description",
    "start_date",
    "end_date",
    "rt_type",
    "rt_visibility",
    "location",
    "cover_picture",
    "canceled",
    "latitude",
    "longitude",
    "api_endpoint_id",
];

/// Reporting category of a source endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndpointKind {
    #[serde(rename = "Nazionale")]
    National,
    #[serde(rename = "Zona")]
    Zone,
    #[serde(rename = "Tavola")]
    Table,
}

impl EndpointKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::National => "Nazionale",
            Self::Zone => "Zona",
            Self::Table => "Tavola",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "Nazionale" => Some(Self::National),
            "Zona" => Some(Self::Zone),
            "Tavola" => Some(Self::Table),
            _ => None,
        }
    }
}

/// A configured external activities API.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: i64,
    pub url: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub area: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<EndpointKind>,
}

impl Endpoint {
    pub fn activities_url(&self) -> String {
        format!("{}/activities/", self.url.trim_end_matches('/'))
    }

    pub fn activity_detail_url(&self, activity_id: i64) -> String {
        format!("{}{activity_id}/", self.activities_url())
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("description", &self.description)
            .field("area", &self.area)
            .field("kind", &self.kind)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Rounded to the 8 decimal places the store keeps.
    pub fn rounded(self) -> Self {
        Self {
            latitude: round_coordinate(self.latitude),
            longitude: round_coordinate(self.longitude),
        }
    }
}

pub fn round_coordinate(value: f64) -> f64 {
    (value * 1e8).round() / 1e8
}

/// Activity as delivered by a source API (list entry merged with its detail payload).
///
/// Known fields are typed; anything else the source sends is kept in `extra`
/// so schema drift upstream never breaks decoding.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawActivity {
    #[serde(deserialize_with = "wire::id")]
    pub id: i64,
    #[serde(default, deserialize_with = "wire::opt_i64")]
    pub level_id: Option<i64>,
    #[serde(default, deserialize_with = "wire::opt_string")]
    pub name: Option<String>,
    #[serde(default, rename = "type", deserialize_with = "wire::opt_string")]
    pub kind: Option<String>,
    #[serde(default, deserialize_with = "wire::opt_timestamp")]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "wire::opt_timestamp")]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "wire::opt_string")]
    pub rt_type: Option<String>,
    #[serde(default, deserialize_with = "wire::opt_string")]
    pub rt_visibility: Option<String>,
    #[serde(default, deserialize_with = "wire::opt_string")]
    pub location: Option<String>,
    #[serde(default, deserialize_with = "wire::opt_string")]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "wire::opt_string")]
    pub cover_picture: Option<String>,
    #[serde(default, deserialize_with = "wire::opt_f64")]
    pub latitude: Option<f64>,
    #[serde(default, deserialize_with = "wire::opt_f64")]
    pub longitude: Option<f64>,
    #[serde(default, deserialize_with = "wire::opt_bool")]
    pub canceled: Option<bool>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, JsonValue>,
}

impl RawActivity {
    pub fn from_json(value: JsonValue) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    pub fn from_object(object: JsonMap<String, JsonValue>) -> Result<Self, serde_json::Error> {
        Self::from_json(JsonValue::Object(object))
    }

    /// Canonical content owned by `api_endpoint_id`; coordinates are carried over as sent.
    pub fn into_content(self, api_endpoint_id: i64) -> ActivityContent {
        ActivityContent {
            level_id: self.level_id,
            name: self.name.unwrap_or_default(),
            kind: self.kind.unwrap_or_default(),
            description: self.description,
            start_date: self.start_date,
            end_date: self.end_date,
            rt_type: self.rt_type,
            rt_visibility: self.rt_visibility,
            location: self.location,
            cover_picture: self.cover_picture,
            canceled: self.canceled.unwrap_or(false),
            latitude: self.latitude,
            longitude: self.longitude,
            api_endpoint_id,
        }
    }
}

/// The canonical field set of an activity. Two records with equal content never
/// produce a write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityContent {
    pub level_id: Option<i64>,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub description: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub rt_type: Option<String>,
    pub rt_visibility: Option<String>,
    pub location: Option<String>,
    pub cover_picture: Option<String>,
    pub canceled: bool,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub api_endpoint_id: i64,
}

impl ActivityContent {
    /// Location text, `None` when absent or blank.
    pub fn location_text(&self) -> Option<&str> {
        self.location
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn coordinates(&self) -> Option<Coordinates> {
        match (self.latitude, self.longitude) {
            (Some(latitude), Some(longitude)) => Some(Coordinates::new(latitude, longitude)),
            _ => None,
        }
    }

    pub fn set_coordinates(&mut self, coordinates: Option<Coordinates>) {
        self.latitude = coordinates.map(|c| c.latitude);
        self.longitude = coordinates.map(|c| c.longitude);
    }
}

/// Persisted activity row. `id` is the source-assigned identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredActivity {
    pub id: i64,
    #[serde(flatten)]
    pub content: ActivityContent,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl StoredActivity {
    pub fn is_retired(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Parse the timestamp shapes source APIs send. Naive values are taken as UTC.
/// Sub-microsecond precision is dropped so values survive a database round trip.
pub fn parse_timestamp(input: &str) -> Option<DateTime<Utc>> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Some(dt.with_timezone(&Utc).trunc_subsecs(6));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(input, format) {
            return Some(naive.and_utc().trunc_subsecs(6));
        }
    }
    NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Lenient decoders for source payload fields. Optional fields that cannot be
/// interpreted decode as absent instead of failing the whole record.
mod wire {
    use chrono::{DateTime, Utc};
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer};
    use serde_json::Value as JsonValue;

    fn as_i64(value: &JsonValue) -> Option<i64> {
        match value {
            JsonValue::Number(n) => n.as_i64(),
            JsonValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
        let value = JsonValue::deserialize(deserializer)?;
        as_i64(&value).ok_or_else(|| D::Error::custom(format!("invalid activity id: {value}")))
    }

    pub fn opt_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
        let value = Option::<JsonValue>::deserialize(deserializer)?;
        Ok(value.as_ref().and_then(as_i64))
    }

    pub fn opt_string<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<String>, D::Error> {
        let value = Option::<JsonValue>::deserialize(deserializer)?;
        Ok(match value {
            Some(JsonValue::String(s)) => Some(s),
            Some(JsonValue::Number(n)) => Some(n.to_string()),
            Some(JsonValue::Bool(b)) => Some(b.to_string()),
            _ => None,
        })
    }

    pub fn opt_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
        let value = Option::<JsonValue>::deserialize(deserializer)?;
        Ok(match value {
            Some(JsonValue::Number(n)) => n.as_f64(),
            Some(JsonValue::String(s)) => s.trim().parse().ok(),
            _ => None,
        }
        .filter(|v: &f64| v.is_finite()))
    }

    pub fn opt_bool<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<bool>, D::Error> {
        let value = Option::<JsonValue>::deserialize(deserializer)?;
        Ok(match value {
            Some(JsonValue::Bool(b)) => Some(b),
            Some(JsonValue::Number(n)) => n.as_i64().map(|v| v != 0),
            Some(JsonValue::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => Some(true),
                "0" | "false" | "no" | "" => Some(false),
                _ => None,
            },
            _ => None,
        })
    }

    pub fn opt_timestamp<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let value = Option::<JsonValue>::deserialize(deserializer)?;
        Ok(match value {
            Some(JsonValue::String(s)) => super::parse_timestamp(&s),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn raw_activity_decodes_lenient_fields_and_keeps_extras() {
        let raw = RawActivity::from_json(json!({
            "id": "42",
            "level_id": 3,
            "name": "Assemblea",
            "type": "announcement",
            "start_date": "2026-05-01 18:30:00",
            "end_date": "not a date",
            "latitude": "45.4642",
            "longitude": 9.19,
            "canceled": 0,
            "organizer": {"name": "Tavola 7"}
        }))
        .expect("decode");

        assert_eq!(raw.id, 42);
        assert_eq!(raw.level_id, Some(3));
        assert_eq!(raw.kind.as_deref(), Some("announcement"));
        assert_eq!(
            raw.start_date,
            Utc.with_ymd_and_hms(2026, 5, 1, 18, 30, 0).single()
        );
        assert_eq!(raw.end_date, None);
        assert_eq!(raw.latitude, Some(45.4642));
        assert_eq!(raw.canceled, Some(false));
        assert!(raw.extra.contains_key("organizer"));
    }

    #[test]
    fn raw_activity_without_id_is_rejected() {
        assert!(RawActivity::from_json(json!({"name": "no id"})).is_err());
        assert!(RawActivity::from_json(json!({"id": "abc"})).is_err());
    }

    #[test]
    fn timestamps_accept_common_shapes() {
        let expected = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).single();
        assert_eq!(parse_timestamp("2026-01-02T03:04:05Z"), expected);
        assert_eq!(parse_timestamp("2026-01-02T04:04:05+01:00"), expected);
        assert_eq!(parse_timestamp("2026-01-02 03:04:05"), expected);
        assert_eq!(
            parse_timestamp("2026-01-02"),
            Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).single()
        );
        assert_eq!(parse_timestamp(""), None);
    }

    #[test]
    fn content_defaults_canceled_and_blank_location() {
        let raw = RawActivity::from_json(json!({"id": 1, "location": "   "})).expect("decode");
        let content = raw.into_content(9);
        assert!(!content.canceled);
        assert_eq!(content.api_endpoint_id, 9);
        assert_eq!(content.location_text(), None);
    }

    #[test]
    fn endpoint_urls_and_debug_redaction() {
        let endpoint = Endpoint {
            id: 1,
            url: "https://api.example.test/v1/".into(),
            token: Some("secret".into()),
            description: "National".into(),
            area: None,
            kind: Some(EndpointKind::National),
        };
        assert_eq!(endpoint.activities_url(), "https://api.example.test/v1/activities/");
        assert_eq!(
            endpoint.activity_detail_url(7),
            "https://api.example.test/v1/activities/7/"
        );
        assert!(!format!("{endpoint:?}").contains("secret"));
    }

    #[test]
    fn coordinates_round_to_store_precision() {
        let c = Coordinates::new(45.123456789, 9.000000004).rounded();
        assert_eq!(c.latitude, 45.12345679);
        assert_eq!(c.longitude, 9.0);
    }
}
