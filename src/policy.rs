//! Freshness arithmetic for stored entries.
//!
//! Age, freshness lifetime, and staleness follow RFC 7234 section 4.2;
//! the stale-serving windows follow RFC 5861. All functions take `now`
//! explicitly; nothing in this module reads the clock.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use http::HeaderMap;

use crate::entry::CacheEntry;

/// Parsed `Cache-Control` directives: name to optional argument.
#[derive(Debug, Clone, Default)]
pub struct CacheControl {
    directives: HashMap<Box<str>, Option<Box<str>>>,
}

impl CacheControl {
    /// Parses every `Cache-Control` header in `headers`.
    ///
    /// Conflicting duplicate directives invalidate freshness: the
    /// result gains `must-revalidate` so the entry reads as stale.
    #[must_use]
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let mut directives = HashMap::new();
        let mut is_valid = true;

        for h in headers.get_all("cache-control").iter().filter_map(|v| v.to_str().ok()) {
            for part in h.split(',') {
                if part.trim().is_empty() {
                    continue;
                }
                let mut kv = part.splitn(2, '=');
                let k = kv.next().unwrap_or("").trim().to_ascii_lowercase();
                if k.is_empty() {
                    continue;
                }
                let v = kv.next().map(str::trim);
                match directives.entry(k.into_boxed_str()) {
                    Entry::Occupied(e) => {
                        let e: &Option<Box<str>> = e.get();
                        if e.as_deref() != v.map(|v| v.trim_matches('"')) {
                            is_valid = false;
                        }
                    }
                    Entry::Vacant(e) => {
                        e.insert(v.map(|v| v.trim_matches('"')).map(From::from));
                    }
                }
            }
        }
        if !is_valid {
            directives.insert("must-revalidate".into(), None);
        }
        Self { directives }
    }

    /// Whether the directive is present at all.
    #[must_use]
    pub fn has(&self, name: &str) -> bool {
        self.directives.contains_key(name)
    }

    /// The directive's argument, when present.
    #[must_use]
    pub fn value(&self, name: &str) -> Option<&str> {
        self.directives.get(name).and_then(|v| v.as_deref())
    }

    /// The directive's argument parsed as whole seconds.
    #[must_use]
    pub fn seconds(&self, name: &str) -> Option<u64> {
        self.value(name).and_then(|v| v.parse().ok())
    }

    /// The argument of a directive that is present but may be bare.
    /// Distinguishes "absent" from "present without value".
    #[must_use]
    pub fn seconds_or_bare(&self, name: &str) -> Option<Option<u64>> {
        self.directives.get(name).map(|v| v.as_deref().and_then(|s| s.parse().ok()))
    }
}

/// Computes age, freshness, and stale-serving eligibility of stored
/// entries.
#[derive(Debug, Copy, Clone)]
pub struct ValidityPolicy {
    shared: bool,
}

impl ValidityPolicy {
    /// A policy for a shared or private cache.
    #[must_use]
    pub fn new(shared: bool) -> Self {
        Self { shared }
    }

    /// Current age of the entry, per RFC 7234 section 4.2.3.
    #[must_use]
    pub fn age(&self, entry: &CacheEntry, now: SystemTime) -> Duration {
        let apparent_age = entry
            .date()
            .and_then(|date| entry.response_received.duration_since(date).ok())
            .unwrap_or_default();

        let response_delay = entry
            .response_received
            .duration_since(entry.request_sent)
            .unwrap_or_default();
        let age_value = Duration::from_secs(
            entry.header_str("age").and_then(|v| v.trim().parse().ok()).unwrap_or(0),
        );
        let corrected_age_value = age_value + response_delay;

        let corrected_initial_age = apparent_age.max(corrected_age_value);
        let resident_time =
            now.duration_since(entry.response_received).unwrap_or_default();
        corrected_initial_age + resident_time
    }

    /// Current age in whole seconds, for the `Age` header.
    #[must_use]
    pub fn age_secs(&self, entry: &CacheEntry, now: SystemTime) -> u64 {
        self.age(entry, now).as_secs()
    }

    /// Freshness lifetime: `s-maxage` for a shared cache, else
    /// `max-age`, else `Expires` minus `Date`.
    #[must_use]
    pub fn freshness_lifetime(&self, entry: &CacheEntry) -> Duration {
        let cc = CacheControl::from_headers(&entry.headers);
        if self.shared {
            if let Some(s_maxage) = cc.seconds("s-maxage") {
                return Duration::from_secs(s_maxage);
            }
        }
        if let Some(max_age) = cc.seconds("max-age") {
            return Duration::from_secs(max_age);
        }
        if let (Some(expires), Some(date)) = (
            entry.header_str("expires").and_then(|e| httpdate::parse_http_date(e).ok()),
            entry.date(),
        ) {
            // invalid/past Expires means already expired
            return expires.duration_since(date).unwrap_or_default();
        }
        Duration::ZERO
    }

    /// How far past its lifetime the entry is; zero while fresh.
    #[must_use]
    pub fn staleness(&self, entry: &CacheEntry, now: SystemTime) -> Duration {
        self.age(entry, now)
            .checked_sub(self.freshness_lifetime(entry))
            .unwrap_or_default()
    }

    /// Whether the entry is still within its freshness lifetime.
    #[must_use]
    pub fn is_fresh(&self, entry: &CacheEntry, now: SystemTime) -> bool {
        self.freshness_lifetime(entry) > self.age(entry, now)
    }

    /// Whether the entry demands revalidation once stale.
    #[must_use]
    pub fn must_revalidate(&self, entry: &CacheEntry) -> bool {
        CacheControl::from_headers(&entry.headers).has("must-revalidate")
    }

    /// Whether a shared cache must revalidate this entry once stale.
    #[must_use]
    pub fn proxy_revalidate(&self, entry: &CacheEntry) -> bool {
        CacheControl::from_headers(&entry.headers).has("proxy-revalidate")
    }

    /// Whether serving this request stale is permitted at all.
    #[must_use]
    pub fn stale_allowed(&self, request_headers: &HeaderMap, entry: &CacheEntry) -> bool {
        let req_cc = CacheControl::from_headers(request_headers);
        if req_cc.has("no-cache") {
            return false;
        }
        if self.must_revalidate(entry) {
            return false;
        }
        if self.shared && self.proxy_revalidate(entry) {
            return false;
        }
        true
    }

    /// `stale-while-revalidate=N` is present and the entry is within
    /// its window.
    #[must_use]
    pub fn may_return_stale_while_revalidating(
        &self,
        entry: &CacheEntry,
        now: SystemTime,
    ) -> bool {
        let cc = CacheControl::from_headers(&entry.headers);
        match cc.seconds("stale-while-revalidate") {
            Some(window) => self.staleness(entry, now) <= Duration::from_secs(window),
            None => false,
        }
    }

    /// `stale-if-error=N` appears on the request or the entry, and the
    /// entry is within the window at `now`.
    #[must_use]
    pub fn may_return_stale_if_error(
        &self,
        request_headers: &HeaderMap,
        entry: &CacheEntry,
        now: SystemTime,
    ) -> bool {
        let req_cc = CacheControl::from_headers(request_headers);
        let res_cc = CacheControl::from_headers(&entry.headers);
        let window = req_cc
            .seconds("stale-if-error")
            .or_else(|| res_cc.seconds("stale-if-error"));
        match window {
            Some(window) => self.staleness(entry, now) <= Duration::from_secs(window),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderValue, Method, StatusCode, Uri};

    use crate::HttpVersion;

    fn entry_with_headers(pairs: &[(&str, String)], sent: SystemTime, received: SystemTime) -> CacheEntry {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.append(
                name.parse::<http::header::HeaderName>().unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        CacheEntry {
            method: Method::GET,
            uri: Uri::from_static("http://example.com/"),
            request_headers: HeaderMap::new(),
            status: StatusCode::OK,
            version: HttpVersion::Http11,
            headers,
            body: b"body".to_vec(),
            request_sent: sent,
            response_received: received,
        }
    }

    fn at(base: SystemTime, secs: u64) -> SystemTime {
        base + Duration::from_secs(secs)
    }

    #[test]
    fn age_combines_age_header_and_residence() {
        let base = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let entry = entry_with_headers(
            &[
                ("date", httpdate::fmt_http_date(base)),
                ("age", "10".to_string()),
                ("cache-control", "max-age=3600".to_string()),
            ],
            at(base, 2),
            at(base, 4),
        );
        let policy = ValidityPolicy::new(true);
        // age header (10) + response delay (2) dominates apparent age (4),
        // plus 60s of residence
        assert_eq!(policy.age_secs(&entry, at(base, 64)), 72);
    }

    #[test]
    fn lifetime_prefers_s_maxage_when_shared() {
        let base = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let entry = entry_with_headers(
            &[
                ("date", httpdate::fmt_http_date(base)),
                ("cache-control", "max-age=100, s-maxage=50".to_string()),
            ],
            base,
            base,
        );
        assert_eq!(ValidityPolicy::new(true).freshness_lifetime(&entry), Duration::from_secs(50));
        assert_eq!(ValidityPolicy::new(false).freshness_lifetime(&entry), Duration::from_secs(100));
    }

    #[test]
    fn lifetime_falls_back_to_expires_minus_date() {
        let base = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let entry = entry_with_headers(
            &[
                ("date", httpdate::fmt_http_date(base)),
                ("expires", httpdate::fmt_http_date(at(base, 300))),
            ],
            base,
            base,
        );
        let policy = ValidityPolicy::new(true);
        assert_eq!(policy.freshness_lifetime(&entry), Duration::from_secs(300));
        assert!(policy.is_fresh(&entry, at(base, 299)));
        assert!(!policy.is_fresh(&entry, at(base, 301)));
    }

    #[test]
    fn stale_while_revalidate_window() {
        let base = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let entry = entry_with_headers(
            &[
                ("date", httpdate::fmt_http_date(base)),
                ("cache-control", "max-age=10, stale-while-revalidate=30".to_string()),
            ],
            base,
            base,
        );
        let policy = ValidityPolicy::new(true);
        assert!(policy.may_return_stale_while_revalidating(&entry, at(base, 20)));
        assert!(!policy.may_return_stale_while_revalidating(&entry, at(base, 60)));
    }

    #[test]
    fn stale_if_error_honors_request_directive() {
        let base = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let entry = entry_with_headers(
            &[
                ("date", httpdate::fmt_http_date(base)),
                ("cache-control", "max-age=10".to_string()),
            ],
            base,
            base,
        );
        let policy = ValidityPolicy::new(true);
        let mut req = HeaderMap::new();
        req.insert("cache-control", HeaderValue::from_static("stale-if-error=120"));
        assert!(policy.may_return_stale_if_error(&req, &entry, at(base, 60)));
        assert!(!policy.may_return_stale_if_error(&HeaderMap::new(), &entry, at(base, 60)));
    }

    #[test]
    fn conflicting_duplicate_directives_force_revalidation() {
        let mut headers = HeaderMap::new();
        headers.append("cache-control", HeaderValue::from_static("max-age=100"));
        headers.append("cache-control", HeaderValue::from_static("max-age=200"));
        let cc = CacheControl::from_headers(&headers);
        assert!(cc.has("must-revalidate"));
    }

    #[test]
    fn stale_allowed_gates() {
        let base = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let entry = entry_with_headers(
            &[("cache-control", "max-age=10, must-revalidate".to_string())],
            base,
            base,
        );
        let policy = ValidityPolicy::new(true);
        assert!(!policy.stale_allowed(&HeaderMap::new(), &entry));

        let plain = entry_with_headers(&[("cache-control", "max-age=10".to_string())], base, base);
        assert!(policy.stale_allowed(&HeaderMap::new(), &plain));
        let mut req = HeaderMap::new();
        req.insert("cache-control", HeaderValue::from_static("no-cache"));
        assert!(!policy.stale_allowed(&req, &plain));
    }
}
