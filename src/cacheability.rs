//! Classification: which requests can be answered from storage, and
//! which backend responses may enter it.

use http::{request, Method, StatusCode};

use crate::policy::CacheControl;
use crate::{HttpResponse, HttpVersion};

// rfc7231 6.1
const STATUS_CACHEABLE_BY_DEFAULT: &[u16] =
    &[200, 203, 204, 300, 301, 404, 405, 410, 414, 501];

// Storable only with explicit freshness information.
const STATUS_NEEDS_EXPLICIT: &[u16] = &[302, 304, 307];

/// Decides whether a request is a candidate for cache lookup.
#[derive(Debug, Copy, Clone, Default)]
pub struct RequestCacheability;

impl RequestCacheability {
    /// True when a stored response may be used to answer this request.
    #[must_use]
    pub fn is_servable_from_cache(&self, parts: &request::Parts) -> bool {
        if parts.method != Method::GET && parts.method != Method::HEAD {
            return false;
        }
        // A Pragma request header predates fine-grained directives;
        // treat any occurrence as a bypass.
        if parts.headers.contains_key("pragma") {
            return false;
        }
        let cc = CacheControl::from_headers(&parts.headers);
        !(cc.has("no-store") || cc.has("no-cache"))
    }
}

/// Decides whether a backend response is storable.
#[derive(Debug, Copy, Clone)]
pub struct ResponseCacheability {
    shared: bool,
    cache_303_responses: bool,
    never_cache_http10_responses_with_query: bool,
}

impl ResponseCacheability {
    /// Builds the policy from the cache configuration flags.
    #[must_use]
    pub fn new(
        shared: bool,
        cache_303_responses: bool,
        never_cache_http10_responses_with_query: bool,
    ) -> Self {
        Self { shared, cache_303_responses, never_cache_http10_responses_with_query }
    }

    /// True when the response to this request may be stored.
    ///
    /// The object-size cap is enforced later, while the body is
    /// buffered; this check is header-only.
    #[must_use]
    pub fn is_storable(&self, parts: &request::Parts, response: &HttpResponse) -> bool {
        if parts.method != Method::GET && parts.method != Method::HEAD {
            return false;
        }

        let req_cc = CacheControl::from_headers(&parts.headers);
        if req_cc.has("no-store") {
            return false;
        }

        let res_cc = CacheControl::from_headers(&response.headers);
        if res_cc.has("no-store") {
            return false;
        }
        if self.shared && res_cc.has("private") {
            return false;
        }
        if self.shared
            && parts.headers.contains_key("authorization")
            && !(res_cc.has("must-revalidate")
                || res_cc.has("public")
                || res_cc.has("s-maxage"))
        {
            return false;
        }

        // Partial content is not implemented.
        if response.status == StatusCode::PARTIAL_CONTENT
            || response.headers.contains_key("content-range")
        {
            return false;
        }

        if response
            .headers
            .get("vary")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            == Some("*")
        {
            return false;
        }

        let explicit = self.has_explicit_expiration(response, &res_cc);

        if self.never_cache_http10_responses_with_query
            && response.version == HttpVersion::Http10
            && parts.uri.query().is_some()
            && !explicit
        {
            return false;
        }

        let status = response.status.as_u16();
        if STATUS_CACHEABLE_BY_DEFAULT.contains(&status) {
            return true;
        }
        if STATUS_NEEDS_EXPLICIT.contains(&status) {
            return explicit;
        }
        if status == 303 {
            return self.cache_303_responses && explicit;
        }
        // Unknown statuses are storable only when marked explicitly.
        explicit && (res_cc.has("public") || res_cc.has("max-age") || res_cc.has("s-maxage"))
    }

    fn has_explicit_expiration(&self, response: &HttpResponse, res_cc: &CacheControl) -> bool {
        (self.shared && res_cc.has("s-maxage"))
            || res_cc.has("max-age")
            || response.headers.contains_key("expires")
    }
}
