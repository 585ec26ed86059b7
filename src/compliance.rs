//! Protocol compliance at the cache boundary.
//!
//! Incoming requests are screened for violations the cache must reject
//! outright, then normalized; backend responses get their protocol
//! deficiencies repaired before any caching decision looks at them.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::SystemTime;

use http::header::HeaderValue;
use http::{request, HeaderMap, Method};

use crate::error::RequestViolation;
use crate::policy::CacheControl;
use crate::{HttpResponse, HttpVersion};

// Entity headers a 304 must not carry; the stored entry keeps the
// authoritative values.
const ENTITY_HEADERS_304: &[&str] = &[
    "allow",
    "content-encoding",
    "content-language",
    "content-length",
    "content-md5",
    "content-range",
    "content-type",
];

// Freshness directives that contradict an explicit no-cache.
const FRESHNESS_DIRECTIVES: &[&str] = &["min-fresh", "max-stale", "max-age"];

/// Screens and normalizes incoming requests.
#[derive(Debug, Copy, Clone)]
pub struct RequestCompliance {
    allow_weak_etag_on_put_delete: bool,
}

impl RequestCompliance {
    /// Builds the screen; `allow_weak_etag_on_put_delete` relaxes the
    /// weak-validator rule for PUT and DELETE.
    #[must_use]
    pub fn new(allow_weak_etag_on_put_delete: bool) -> Self {
        Self { allow_weak_etag_on_put_delete }
    }

    /// Violations that abort the exchange before any backend call.
    #[must_use]
    pub fn fatal_errors(
        &self,
        parts: &request::Parts,
        has_body: bool,
    ) -> Vec<RequestViolation> {
        let mut errors = Vec::new();

        if has_body
            && !parts.headers.contains_key("content-length")
            && !parts.headers.contains_key("transfer-encoding")
        {
            errors.push(RequestViolation::BodyButNoLength);
        }

        let is_put_delete =
            parts.method == Method::PUT || parts.method == Method::DELETE;
        if is_put_delete
            && !self.allow_weak_etag_on_put_delete
            && has_weak_etag(&parts.headers, "if-match")
        {
            errors.push(RequestViolation::WeakEtagOnPutDelete);
        }

        errors
    }

    /// Normalizes the request in place. When `no-cache` is present,
    /// freshness directives that contradict it are stripped and a
    /// field-named `no-cache="..."` is folded to the bare directive,
    /// since this cache only implements whole-response semantics.
    pub fn normalize(&self, parts: &mut request::Parts) {
        let cc = CacheControl::from_headers(&parts.headers);
        if cc.has("no-cache") {
            normalize_no_cache_request(&mut parts.headers);
        }
    }
}

fn has_weak_etag(headers: &HeaderMap, name: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|tag| tag.trim().starts_with("W/"))
}

fn normalize_no_cache_request(headers: &mut HeaderMap) {
    let remaining: Vec<String> = headers
        .get_all("cache-control")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .filter_map(|d| {
            let key = d.splitn(2, '=').next().unwrap_or("").trim().to_ascii_lowercase();
            if FRESHNESS_DIRECTIVES.contains(&key.as_str()) {
                None
            } else if key == "no-cache" {
                Some("no-cache".to_string())
            } else {
                Some(d.to_string())
            }
        })
        .collect();

    headers.remove("cache-control");
    if !remaining.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&remaining.join(", ")) {
            headers.insert("cache-control", value);
        }
    }
}

/// Repairs protocol deficiencies in backend responses.
#[derive(Debug, Copy, Clone, Default)]
pub struct ResponseCompliance;

impl ResponseCompliance {
    /// Applies the repairs in place. `response_received` backfills a
    /// missing or unparseable `Date`.
    pub fn ensure(&self, response: &mut HttpResponse, response_received: SystemTime) {
        let date_ok = response
            .headers
            .get("date")
            .and_then(|v| v.to_str().ok())
            .map(|d| httpdate::parse_http_date(d).is_ok())
            .unwrap_or(false);
        if !date_ok {
            if let Ok(value) =
                HeaderValue::from_str(&httpdate::fmt_http_date(response_received))
            {
                response.headers.insert("date", value);
            }
        }

        if response.status == http::StatusCode::NOT_MODIFIED {
            for name in ENTITY_HEADERS_304 {
                response.headers.remove(*name);
            }
        }
    }
}

/// Builds and memoizes the `Via` value identifying this cache, one
/// value per protocol version.
#[derive(Debug, Default)]
pub struct ViaCache {
    values: Mutex<HashMap<HttpVersion, HeaderValue>>,
}

impl ViaCache {
    /// The `Via` value for `version`, computed once per version.
    pub fn value_for(&self, version: HttpVersion) -> HeaderValue {
        let mut values = self.values.lock().expect("via memo poisoned");
        values
            .entry(version)
            .or_insert_with(|| {
                let release = format!(
                    "{} localhost ({}/{} (cache))",
                    version.via_protocol(),
                    env!("CARGO_PKG_NAME"),
                    env!("CARGO_PKG_VERSION"),
                );
                HeaderValue::from_str(&release)
                    .unwrap_or_else(|_| HeaderValue::from_static("1.1 localhost"))
            })
            .clone()
    }

    /// Appends the cache's `Via` to a header map.
    pub fn append_to(&self, headers: &mut HeaderMap, version: HttpVersion) {
        headers.append("via", self.value_for(version));
    }
}
