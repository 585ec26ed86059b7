//! Builds revalidation requests from stored state.

use http::header::HeaderValue;
use http::request;

use crate::entry::CacheEntry;

/// Constructs conditional and unconditional revalidation requests.
#[derive(Debug, Copy, Clone, Default)]
pub struct ConditionalRequestBuilder;

impl ConditionalRequestBuilder {
    /// A copy of the request carrying the entry's validators:
    /// `If-None-Match` from its ETag and/or `If-Modified-Since` from
    /// its `Last-Modified`, falling back to its `Date`.
    #[must_use]
    pub fn build_conditional(
        &self,
        parts: &request::Parts,
        entry: &CacheEntry,
    ) -> request::Parts {
        let mut out = parts.clone();

        if let Some(etag) = entry.etag() {
            let mut tags: Vec<String> = out
                .headers
                .get_all("if-none-match")
                .iter()
                .filter_map(|v| v.to_str().ok())
                .flat_map(|v| v.split(','))
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect();
            if !tags.iter().any(|t| t == etag) {
                tags.push(etag.to_string());
            }
            if let Ok(value) = HeaderValue::from_str(&tags.join(", ")) {
                out.headers.insert("if-none-match", value);
            }
        }

        let validator_date =
            entry.header_str("last-modified").or_else(|| entry.header_str("date"));
        if let Some(date) = validator_date {
            if let Ok(value) = HeaderValue::from_str(date) {
                out.headers.insert("if-modified-since", value);
            }
        }

        out
    }

    /// A copy of the request carrying one `If-None-Match` listing
    /// every known variant ETag.
    #[must_use]
    pub fn build_from_variants(
        &self,
        parts: &request::Parts,
        variant_etags: &[String],
    ) -> request::Parts {
        let mut out = parts.clone();
        out.headers.remove("if-none-match");
        out.headers.remove("if-modified-since");
        if let Ok(value) = HeaderValue::from_str(&variant_etags.join(", ")) {
            out.headers.insert("if-none-match", value);
        }
        out
    }

    /// A copy of the request with validator preconditions removed and
    /// any `max-age=0` directive dropped, for the single retry after a
    /// too-old revalidation response.
    #[must_use]
    pub fn build_unconditional(&self, parts: &request::Parts) -> request::Parts {
        let mut out = parts.clone();
        for name in
            ["if-none-match", "if-modified-since", "if-range", "if-match", "if-unmodified-since"]
        {
            out.headers.remove(name);
        }

        let remaining: Vec<String> = out
            .headers
            .get_all("cache-control")
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|d| !d.is_empty() && !d.eq_ignore_ascii_case("max-age=0"))
            .map(str::to_string)
            .collect();
        out.headers.remove("cache-control");
        if !remaining.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&remaining.join(", ")) {
                out.headers.insert("cache-control", value);
            }
        }

        out
    }
}
