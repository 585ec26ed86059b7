//! Stored cache records: entries, variant maps, and lookup keys.

use std::collections::HashMap;
use std::time::SystemTime;

use http::{HeaderMap, Method, StatusCode, Uri};
use serde::{Deserialize, Serialize};

use crate::HttpVersion;

/// The canonical identity of a cacheable exchange: target authority,
/// effective request URI, and method. Its string form is the backend
/// storage key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    /// URI scheme of the target (`http`/`https`)
    pub scheme: String,
    /// Target host
    pub host: String,
    /// Target port
    pub port: u16,
    /// Effective request URI (path and query)
    pub uri: String,
    /// Request method
    pub method: String,
}

impl Fingerprint {
    /// Builds a fingerprint for a request against a target authority.
    pub fn new(target: &Target, uri: &Uri, method: &Method) -> Self {
        let path = uri
            .path_and_query()
            .map_or_else(|| "/".to_string(), |pq| pq.as_str().to_string());
        Self {
            scheme: target.scheme.clone(),
            host: target.host.to_ascii_lowercase(),
            port: target.port,
            uri: path,
            method: method.as_str().to_string(),
        }
    }

    /// The same fingerprint with a different method. Used to flush the
    /// GET entry a mutating method invalidates.
    #[must_use]
    pub fn with_method(&self, method: &Method) -> Self {
        Self { method: method.as_str().to_string(), ..self.clone() }
    }

    /// Canonical backend key for the root record.
    #[must_use]
    pub fn storage_key(&self) -> String {
        format!("{}:{}://{}:{}{}", self.method, self.scheme, self.host, self.port, self.uri)
    }

    /// Backend key for one variant of this resource.
    #[must_use]
    pub fn variant_storage_key(&self, variant_key: &str) -> String {
        format!("{}#{}", self.storage_key(), variant_key)
    }
}

/// The authority a request is routed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// URI scheme (`http`/`https`)
    pub scheme: String,
    /// Host name
    pub host: String,
    /// Port
    pub port: u16,
}

impl Target {
    /// Builds a target from an absolute request URI.
    pub fn from_uri(uri: &Uri) -> Option<Self> {
        let host = uri.host()?.to_string();
        let scheme = uri.scheme_str().unwrap_or("http").to_string();
        let port = uri.port_u16().unwrap_or(if scheme == "https" { 443 } else { 80 });
        Some(Self { scheme, host, port })
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// A stored response: the origin exchange plus the local clock readings
/// taken around it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Origin request method
    #[serde(with = "http_serde::method")]
    pub method: Method,
    /// Effective request URI
    #[serde(with = "http_serde::uri")]
    pub uri: Uri,
    /// Headers of the request that produced this entry; consulted when
    /// matching `Vary` and when recomputing variant keys
    #[serde(with = "http_serde::header_map")]
    pub request_headers: HeaderMap,
    /// Response status code
    #[serde(with = "http_serde::status_code")]
    pub status: StatusCode,
    /// Response protocol version
    pub version: HttpVersion,
    /// Response headers in original order
    #[serde(with = "http_serde::header_map")]
    pub headers: HeaderMap,
    /// Response body bytes, owned by the storage backend
    pub body: Vec<u8>,
    /// Local clock when the request was sent
    pub request_sent: SystemTime,
    /// Local clock when the response was received
    pub response_received: SystemTime,
}

impl CacheEntry {
    /// First value of a header as a string.
    #[must_use]
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// The origin `Date`, when present and parseable.
    #[must_use]
    pub fn date(&self) -> Option<SystemTime> {
        self.header_str("date").and_then(|d| httpdate::parse_http_date(d).ok())
    }

    /// The entity tag of this entry.
    #[must_use]
    pub fn etag(&self) -> Option<&str> {
        self.header_str("etag").map(str::trim)
    }

    /// The `Last-Modified` timestamp, when present and parseable.
    #[must_use]
    pub fn last_modified(&self) -> Option<SystemTime> {
        self.header_str("last-modified").and_then(|d| httpdate::parse_http_date(d).ok())
    }

    /// The header names this entry varies on, lowercased, in order.
    #[must_use]
    pub fn vary_names(&self) -> Vec<String> {
        self.headers
            .get_all("vary")
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(|n| n.trim().to_ascii_lowercase())
            .filter(|n| !n.is_empty())
            .collect()
    }

    /// Whether this entry carries a `Vary` header.
    #[must_use]
    pub fn has_vary(&self) -> bool {
        self.headers.contains_key("vary")
    }
}

/// What one backend key maps to: an optional root entry plus the map
/// of known variants (variant key to ETag).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoredRecord {
    /// The canonical entry for this fingerprint, if one exists
    pub entry: Option<CacheEntry>,
    /// Variant key to ETag, for content-negotiated resources
    pub variants: HashMap<String, String>,
    /// The selecting header names of the variant set, lowercased;
    /// empty for plain resources
    pub vary_names: Vec<String>,
}

impl StoredRecord {
    /// A record holding just a root entry.
    #[must_use]
    pub fn root(entry: CacheEntry) -> Self {
        Self { entry: Some(entry), variants: HashMap::new(), vary_names: Vec::new() }
    }

    /// Whether any variants are known for this fingerprint.
    #[must_use]
    pub fn has_variants(&self) -> bool {
        !self.variants.is_empty()
    }
}

/// One variant of a negotiated resource, resolved from storage.
#[derive(Debug, Clone)]
pub struct VariantHandle {
    /// The variant key this entry is stored under
    pub variant_key: String,
    /// The stored variant
    pub entry: CacheEntry,
}

/// Computes the canonical variant key: a hash over the request's values
/// of the selecting headers, in the order the stored `Vary` names them.
/// Absent headers hash as empty values so that "header missing" is a
/// distinct, stable coordinate.
#[must_use]
pub fn variant_key(vary_names: &[String], request_headers: &HeaderMap) -> String {
    let mut hasher = blake3::Hasher::new();
    for name in vary_names {
        hasher.update(name.as_bytes());
        hasher.update(b":");
        for value in request_headers.get_all(name.as_str()) {
            hasher.update(value.as_bytes());
            hasher.update(b",");
        }
        hasher.update(b"\n");
    }
    hex::encode(&hasher.finalize().as_bytes()[..16])
}
