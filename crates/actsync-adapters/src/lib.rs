//! Upstream clients (activities API, geocoders) and content normalization.

pub mod geocode;
pub mod normalize;
pub mod source;

pub use geocode::{
    build_geocoder, DisabledGeocoder, GeocodeError, Geocoder, GeocoderKind, GeocoderSettings,
    GoogleGeocoder, NominatimGeocoder, GOOGLE_GEOCODE_URL, NOMINATIM_URL,
};
pub use normalize::{
    correct_location, ContentNormalizer, HtmlSanitizer, NormalizeOutcome, SanitizeError,
};
pub use source::{auth_headers, merge_detail, ActivitySource, JsonObject, RestActivitySource, SourceError};

pub const CRATE_NAME: &str = "actsync-adapters";
