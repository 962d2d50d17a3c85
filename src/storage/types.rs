use serde::Serialize;
use time::OffsetDateTime;
use url::{Origin, Url};

use crate::errors::StorageError;

/// Serializes an origin into the key used by the stores.
///
/// Opaque origins (`data:`, sandboxed frames) have no stable identity and are rejected.
pub fn origin_key(origin: &Origin) -> Result<String, StorageError> {
    if !origin.is_tuple() {
        return Err(StorageError::OpaqueOrigin);
    }
    Ok(origin.ascii_serialization())
}

/// Parses a stored origin key back into an origin. Returns `None` for garbage or opaque origins.
pub fn parse_origin(s: &str) -> Option<Origin> {
    let url = Url::parse(s).ok()?;
    let origin = url.origin();
    origin.is_tuple().then_some(origin)
}

/// Size of a key or value, counted the way script sees it (UTF-16 code units, two bytes each).
pub fn utf16_bytes(s: &str) -> usize {
    s.encode_utf16().count() * 2
}

/// Local storage footprint of a single origin.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LocalStorageUsageInfo {
    #[serde(serialize_with = "serialize_origin")]
    pub origin: Origin,
    pub data_size: u64,
    /// Only filled in when requested.
    pub last_modified: Option<OffsetDateTime>,
}

/// A (persistent namespace, origin) pair known to the session store.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct SessionStorageUsageInfo {
    pub persistent_namespace_id: String,
    #[serde(serialize_with = "serialize_origin")]
    pub origin: Origin,
}

/// In-memory footprint of a context.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MemoryUsage {
    pub namespaces: usize,
    pub areas: usize,
    /// Distinct maps; areas sharing a map after a clone count once.
    pub maps: usize,
    pub map_bytes: usize,
}

fn serialize_origin<S: serde::Serializer>(origin: &Origin, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&origin.ascii_serialization())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn o(s: &str) -> Origin {
        Url::parse(s).expect("valid URL").origin()
    }

    #[test]
    fn origin_key_elides_default_port() {
        assert_eq!(origin_key(&o("https://example.com/path?q=1")).unwrap(), "https://example.com");
        assert_eq!(origin_key(&o("http://a.test:8080/")).unwrap(), "http://a.test:8080");
    }

    #[test]
    fn opaque_origins_are_rejected() {
        let opaque = o("data:text/plain,hello");
        assert!(matches!(origin_key(&opaque), Err(StorageError::OpaqueOrigin)));
        assert!(parse_origin("null").is_none());
    }

    #[test]
    fn parse_origin_round_trips_key() {
        let origin = o("https://sub.example.com:8443/x");
        let key = origin_key(&origin).unwrap();
        assert_eq!(parse_origin(&key), Some(origin));
    }

    #[test]
    fn utf16_sizes_count_code_units() {
        assert_eq!(utf16_bytes(""), 0);
        assert_eq!(utf16_bytes("abc"), 6);
        // U+1F600 needs a surrogate pair
        assert_eq!(utf16_bytes("\u{1F600}"), 4);
    }

    #[test]
    fn usage_info_serializes_origin_as_string() {
        let info = SessionStorageUsageInfo {
            persistent_namespace_id: "abc".into(),
            origin: o("https://example.com"),
        };
        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"origin\":\"https://example.com\""));
    }

    #[test]
    fn local_usage_serializes_with_timestamp() {
        let info = LocalStorageUsageInfo {
            origin: o("https://example.com"),
            data_size: 8,
            last_modified: Some(OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap()),
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["origin"], "https://example.com");
        assert_eq!(json["data_size"], 8);
        assert!(!json["last_modified"].is_null());

        let json = serde_json::to_value(LocalStorageUsageInfo { last_modified: None, ..info }).unwrap();
        assert!(json["last_modified"].is_null());
    }
}
