//! Decides whether one stored entry satisfies one request right now.

use std::time::{Duration, SystemTime};

use http::{request, HeaderMap};

use crate::entry::CacheEntry;
use crate::policy::{CacheControl, ValidityPolicy};

/// Per-request suitability checks against a stored entry.
#[derive(Debug, Copy, Clone)]
pub struct SuitabilityChecker {
    validity: ValidityPolicy,
}

impl SuitabilityChecker {
    /// Builds a checker sharing the cache's validity policy.
    #[must_use]
    pub fn new(validity: ValidityPolicy) -> Self {
        Self { validity }
    }

    /// True when the entry may be returned for this request without
    /// contacting the origin.
    #[must_use]
    pub fn can_use(&self, parts: &request::Parts, entry: &CacheEntry, now: SystemTime) -> bool {
        if entry.method != parts.method {
            return false;
        }
        if !self.vary_matches(parts, entry) {
            return false;
        }

        let req_cc = CacheControl::from_headers(&parts.headers);
        let res_cc = CacheControl::from_headers(&entry.headers);
        // Either side may mandate revalidation.
        if req_cc.has("no-cache") || res_cc.has("no-cache") {
            return false;
        }

        // A conditional request whose preconditions no longer hold is
        // answered by the origin, not by a stored 304 synthesis.
        if self.is_conditional(parts) && !self.all_conditionals_match(parts, entry, now) {
            return false;
        }

        let age = self.validity.age(entry, now);
        if let Some(max_age) = req_cc.seconds("max-age") {
            if age > Duration::from_secs(max_age) {
                return false;
            }
        }
        if let Some(min_fresh) = req_cc.seconds("min-fresh") {
            let ttl = self
                .validity
                .freshness_lifetime(entry)
                .checked_sub(age)
                .unwrap_or_default();
            if ttl < Duration::from_secs(min_fresh) {
                return false;
            }
        }

        if self.validity.is_fresh(entry, now) {
            return true;
        }

        // Stale: only a max-stale request tolerance can keep the entry
        // usable, and never against must-revalidate.
        if !self.validity.stale_allowed(&parts.headers, entry) {
            return false;
        }
        match req_cc.seconds_or_bare("max-stale") {
            // bare max-stale accepts any staleness
            Some(None) => true,
            Some(Some(limit)) => {
                self.validity.staleness(entry, now) <= Duration::from_secs(limit)
            }
            None => false,
        }
    }

    /// Whether every header named by the entry's `Vary` carries the
    /// same values on this request as on the stored one.
    #[must_use]
    pub fn vary_matches(&self, parts: &request::Parts, entry: &CacheEntry) -> bool {
        for name in entry.vary_names() {
            if name == "*" {
                return false;
            }
            if !header_values_equal(&parts.headers, &entry.request_headers, &name) {
                return false;
            }
        }
        true
    }

    /// Whether the request carries preconditions eligible for a 304.
    #[must_use]
    pub fn is_conditional(&self, parts: &request::Parts) -> bool {
        parts.headers.contains_key("if-none-match")
            || parts.headers.contains_key("if-modified-since")
    }

    /// Evaluates the request's preconditions against the entry.
    /// `If-None-Match` takes precedence over `If-Modified-Since`.
    #[must_use]
    pub fn all_conditionals_match(
        &self,
        parts: &request::Parts,
        entry: &CacheEntry,
        _now: SystemTime,
    ) -> bool {
        if parts.headers.contains_key("if-none-match") {
            let entry_tag = match entry.etag() {
                Some(tag) => tag,
                None => return false,
            };
            return parts
                .headers
                .get_all("if-none-match")
                .iter()
                .filter_map(|v| v.to_str().ok())
                .flat_map(|v| v.split(','))
                .map(str::trim)
                .any(|tag| tag == "*" || weak_etag_eq(tag, entry_tag));
        }

        if let Some(ims) = parts
            .headers
            .get("if-modified-since")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| httpdate::parse_http_date(v).ok())
        {
            // whole-second resolution on both sides
            return match entry.last_modified().or_else(|| entry.date()) {
                Some(modified) => modified <= ims,
                None => false,
            };
        }

        false
    }
}

fn header_values_equal(a: &HeaderMap, b: &HeaderMap, name: &str) -> bool {
    let left: Vec<_> = a.get_all(name).iter().collect();
    let right: Vec<_> = b.get_all(name).iter().collect();
    left == right
}

/// Weak comparison per RFC 7232 section 2.3.2: prefixes are ignored,
/// opaque tags must match exactly.
fn weak_etag_eq(a: &str, b: &str) -> bool {
    a.trim().trim_start_matches("W/") == b.trim().trim_start_matches("W/")
}
