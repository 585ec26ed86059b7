//! Materializes client-facing responses from stored entries and
//! synthesizes the cache's own responses.

use std::time::SystemTime;

use bytes::Bytes;
use http::header::HeaderValue;
use http::{request, HeaderMap, Method, StatusCode};
use url::Url;

use crate::body::CacheBody;
use crate::entry::CacheEntry;
use crate::error::{RequestViolation, Result};
use crate::policy::ValidityPolicy;
use crate::{HttpResponse, HttpVersion};

const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

// The only headers a synthesized 304 carries.
const NOT_MODIFIED_HEADERS: &[&str] =
    &["date", "etag", "content-location", "expires", "cache-control", "vary"];

/// Builds client responses from stored entries.
#[derive(Debug, Copy, Clone)]
pub struct ResponseGenerator {
    validity: ValidityPolicy,
}

impl ResponseGenerator {
    /// Builds a generator sharing the cache's validity policy.
    #[must_use]
    pub fn new(validity: ValidityPolicy) -> Self {
        Self { validity }
    }

    /// A full response from the stored entry: hop-by-hop headers
    /// stripped, stale 1xx warnings dropped, `Age` computed at `now`.
    /// HEAD requests get the stored headers without the body.
    pub fn response(
        &self,
        parts: &request::Parts,
        entry: &CacheEntry,
        now: SystemTime,
    ) -> Result<HttpResponse> {
        let mut headers = copy_end_to_end_headers(&entry.headers);
        retain_valid_warnings(&mut headers, entry);

        let age = self.validity.age_secs(entry, now);
        headers.insert("age", HeaderValue::from_str(&age.to_string())?);

        let body = if parts.method == Method::HEAD {
            CacheBody::empty()
        } else {
            CacheBody::buffered(Bytes::from(entry.body.clone()))
        };

        Ok(HttpResponse {
            status: entry.status,
            version: entry.version,
            headers,
            url: Url::parse(&entry.uri.to_string())?,
            body,
        })
    }

    /// A synthesized `304 Not Modified` carrying only the headers a
    /// 304 is permitted to repeat.
    pub fn not_modified(&self, entry: &CacheEntry) -> Result<HttpResponse> {
        let mut headers = HeaderMap::new();
        for name in NOT_MODIFIED_HEADERS {
            for value in entry.headers.get_all(*name) {
                headers.append(
                    name.parse::<http::header::HeaderName>()?,
                    value.clone(),
                );
            }
        }
        Ok(HttpResponse {
            status: StatusCode::NOT_MODIFIED,
            version: entry.version,
            headers,
            url: Url::parse(&entry.uri.to_string())?,
            body: CacheBody::empty(),
        })
    }

    /// Maps a fatal request violation to its response.
    pub fn error_for_request(
        &self,
        violation: RequestViolation,
        url: Url,
    ) -> HttpResponse {
        let (status, reason) = match violation {
            RequestViolation::BodyButNoLength => {
                (StatusCode::LENGTH_REQUIRED, "Request body requires a declared length")
            }
            RequestViolation::WeakEtagOnPutDelete => {
                (StatusCode::BAD_REQUEST, "Weak ETag not permitted on PUT or DELETE")
            }
        };
        synthesize(status, reason, url)
    }

    /// `504 Gateway Timeout` for `only-if-cached` with nothing usable.
    pub fn gateway_timeout(&self, url: Url) -> HttpResponse {
        synthesize(StatusCode::GATEWAY_TIMEOUT, "Gateway Timeout", url)
    }

    /// `501 Not Implemented` for the cache's self-directed probe.
    pub fn not_implemented(&self, url: Url) -> HttpResponse {
        synthesize(StatusCode::NOT_IMPLEMENTED, "Not Implemented", url)
    }

    /// `502 Bad Gateway` carrying a diagnostic for truncated bodies.
    pub fn bad_gateway(&self, diagnostic: &str, url: Url) -> HttpResponse {
        let mut response = synthesize(StatusCode::BAD_GATEWAY, "Bad Gateway", url);
        response.body = CacheBody::buffered(Bytes::from(diagnostic.to_string()));
        if let Ok(len) = HeaderValue::from_str(&diagnostic.len().to_string()) {
            response.headers.insert("content-length", len);
        }
        response
    }
}

/// Appends a `Warning` value of the form `<code> localhost "<text>"`.
pub fn add_warning(headers: &mut HeaderMap, code: u16, text: &str) {
    if let Ok(value) = HeaderValue::from_str(&format!("{code} localhost \"{text}\"")) {
        headers.append("warning", value);
    }
}

fn synthesize(status: StatusCode, reason: &str, url: Url) -> HttpResponse {
    let mut headers = HeaderMap::new();
    if let Ok(len) = HeaderValue::from_str(&reason.len().to_string()) {
        headers.insert("content-length", len);
    }
    HttpResponse {
        status,
        version: HttpVersion::Http11,
        headers,
        url,
        body: CacheBody::buffered(Bytes::from(reason.to_string())),
    }
}

fn copy_end_to_end_headers(in_headers: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(in_headers.len());
    let dropped: Vec<String> = in_headers
        .get_all("connection")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|n| n.trim().to_ascii_lowercase())
        .collect();

    for (name, value) in in_headers {
        let name_str = name.as_str();
        if HOP_BY_HOP_HEADERS.contains(&name_str) || dropped.iter().any(|d| d == name_str) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

// A 1xx warning survives only when its warn-date equals the entry's
// Date; 2xx warnings are always retained.
fn retain_valid_warnings(headers: &mut HeaderMap, entry: &CacheEntry) {
    let entry_date = entry.date();
    let retained: Vec<HeaderValue> = headers
        .get_all("warning")
        .iter()
        .filter(|v| {
            let Some(text) = v.to_str().ok() else { return false };
            let code: Option<u16> =
                text.trim().chars().take(3).collect::<String>().parse().ok();
            match code {
                Some(code) if (100..200).contains(&code) => {
                    warn_date(text).is_some() && warn_date(text) == entry_date
                }
                Some(_) => true,
                None => false,
            }
        })
        .cloned()
        .collect();
    headers.remove("warning");
    for value in retained {
        headers.append("warning", value);
    }
}

fn warn_date(warning: &str) -> Option<SystemTime> {
    let start = warning.find("\" \"")? + 3;
    let rest = &warning[start..];
    let end = rest.find('"')?;
    httpdate::parse_http_date(&rest[..end]).ok()
}
