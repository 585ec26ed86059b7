#![forbid(unsafe_code, future_incompatible)]
#![deny(
    missing_docs,
    missing_debug_implementations,
    nonstandard_style,
    unused_qualifications,
    unused_import_braces,
    unused_extern_crates,
    trivial_casts,
    trivial_numeric_casts
)]
#![cfg_attr(docsrs, feature(doc_cfg))]
//! A transparent client-side HTTP/1.1 cache, built as one stage in a
//! request pipeline.
//!
//! The executor intercepts each request, decides whether a stored
//! response can satisfy it, revalidates stale entries against the
//! origin with conditional requests, and stores fresh responses
//! subject to HTTP caching rules. It aims for conditional compliance
//! with RFC 7234: all MUST/MUST NOT, most SHOULD/SHOULD NOT.
//!
//! The byte-level transport stays outside: the executor consumes a
//! [`Transport`] capability representing the next pipeline stage and
//! is itself invoked as one. Physical storage is a [`CacheStorage`]
//! backend behind the [`HttpCache`] façade; disk ([`CACacheManager`])
//! and in-memory ([`MokaManager`]) backends are provided behind
//! feature flags.
//!
//! ## Basic usage
//!
//! ```rust,no_run
//! # #[cfg(feature = "manager-moka")]
//! # async fn run() -> http_cache_exec::Result<()> {
//! use std::sync::Arc;
//! use http_cache_exec::{
//!     CacheConfig, CachingExecutor, ExecContext, MokaManager, RouteScope,
//!     Target, Transport,
//! };
//!
//! let executor = CachingExecutor::new(MokaManager::default(), CacheConfig::default());
//! # let transport: Arc<dyn Transport> = unimplemented!();
//!
//! let request = http::Request::get("http://example.com/feed")
//!     .body(bytes::Bytes::new())?;
//! let scope = RouteScope {
//!     target: Target { scheme: "http".into(), host: "example.com".into(), port: 80 },
//! };
//! let mut ctx = ExecContext::default();
//! let response = executor.execute(request, &scope, &mut ctx, transport).await?;
//! println!("{} ({})", response.status, ctx.response_status());
//! # Ok(())
//! # }
//! ```
//!
//! ## Background revalidation
//!
//! With an [`AsyncRevalidator`] attached, entries carrying
//! `stale-while-revalidate` are served stale immediately while a
//! bounded worker pool refreshes them off-band:
//!
//! ```rust,no_run
//! # #[cfg(feature = "manager-moka")]
//! # fn build() {
//! use http_cache_exec::{AsyncRevalidator, CacheConfig, CachingExecutor, MokaManager};
//!
//! let executor = CachingExecutor::new(MokaManager::default(), CacheConfig::default())
//!     .with_revalidator(AsyncRevalidator::new(4));
//! # }
//! ```

mod body;
mod cacheability;
mod compliance;
mod conditional;
mod entry;
mod error;
mod generator;
mod managers;
mod policy;
mod revalidator;
mod storage;
mod suitability;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use http::{request, HeaderMap, Method, Request, StatusCode};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use url::Url;

pub use body::{BoundedRead, CacheBody};
pub use cacheability::{RequestCacheability, ResponseCacheability};
pub use compliance::{RequestCompliance, ResponseCompliance, ViaCache};
pub use conditional::ConditionalRequestBuilder;
pub use entry::{
    variant_key, CacheEntry, Fingerprint, StoredRecord, Target, VariantHandle,
};
pub use error::{
    BoxError, HttpCacheError, RequestViolation, Result, StorageError,
    StorageErrorKind, StorageResult,
};
pub use generator::{add_warning, ResponseGenerator};
pub use policy::{CacheControl, ValidityPolicy};
pub use revalidator::AsyncRevalidator;
pub use storage::{CacheStorage, HttpCache};
pub use suitability::SuitabilityChecker;

#[cfg(feature = "manager-cacache")]
pub use managers::cacache::CACacheManager;

#[cfg(feature = "manager-moka")]
pub use managers::moka::MokaManager;

// Exposing the moka cache for convenience, renaming to avoid naming conflicts
#[cfg(feature = "manager-moka")]
#[cfg_attr(docsrs, doc(cfg(feature = "manager-moka")))]
pub use moka::future::{Cache as MokaCache, CacheBuilder as MokaCacheBuilder};

/// Context attribute carrying the per-call [`CacheResponseStatus`].
pub const CACHE_RESPONSE_STATUS: &str = "cache.response-status";
/// Context attribute carrying the route a cache hit was served for.
pub const CACHE_ROUTE: &str = "cache.route";

/// Represents an HTTP version
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[non_exhaustive]
pub enum HttpVersion {
    /// HTTP Version 0.9
    #[serde(rename = "HTTP/0.9")]
    Http09,
    /// HTTP Version 1.0
    #[serde(rename = "HTTP/1.0")]
    Http10,
    /// HTTP Version 1.1
    #[serde(rename = "HTTP/1.1")]
    Http11,
    /// HTTP Version 2.0
    #[serde(rename = "HTTP/2.0")]
    H2,
    /// HTTP Version 3.0
    #[serde(rename = "HTTP/3.0")]
    H3,
}

impl HttpVersion {
    /// The protocol-version token used in `Via` values.
    #[must_use]
    pub fn via_protocol(self) -> &'static str {
        match self {
            Self::Http09 => "0.9",
            Self::Http10 => "1.0",
            Self::Http11 => "1.1",
            Self::H2 => "2.0",
            Self::H3 => "3.0",
        }
    }

    fn from_http(value: http::Version) -> Self {
        match value {
            http::Version::HTTP_09 => Self::Http09,
            http::Version::HTTP_10 => Self::Http10,
            http::Version::HTTP_2 => Self::H2,
            http::Version::HTTP_3 => Self::H3,
            _ => Self::Http11,
        }
    }
}

impl fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            HttpVersion::Http09 => write!(f, "HTTP/0.9"),
            HttpVersion::Http10 => write!(f, "HTTP/1.0"),
            HttpVersion::Http11 => write!(f, "HTTP/1.1"),
            HttpVersion::H2 => write!(f, "HTTP/2.0"),
            HttpVersion::H3 => write!(f, "HTTP/3.0"),
        }
    }
}

impl From<HttpVersion> for http::Version {
    fn from(value: HttpVersion) -> Self {
        match value {
            HttpVersion::Http09 => Self::HTTP_09,
            HttpVersion::Http10 => Self::HTTP_10,
            HttpVersion::Http11 => Self::HTTP_11,
            HttpVersion::H2 => Self::HTTP_2,
            HttpVersion::H3 => Self::HTTP_3,
        }
    }
}

/// A basic generic type that represents an HTTP response flowing
/// through the pipeline.
#[derive(Debug)]
pub struct HttpResponse {
    /// HTTP response status code
    pub status: StatusCode,
    /// HTTP response version
    pub version: HttpVersion,
    /// HTTP response headers
    pub headers: HeaderMap,
    /// HTTP response url
    pub url: Url,
    /// HTTP response body
    pub body: CacheBody,
}

/// The classification of one executor invocation, surfaced through
/// the per-call context.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CacheResponseStatus {
    /// Served from storage without contacting the origin
    CacheHit,
    /// Storage could not satisfy the request
    CacheMiss,
    /// A stored entry was confirmed or refreshed against the origin
    Validated,
    /// The cache answered on its own authority (504, 501, 4xx)
    CacheModuleResponse,
    /// Storage failed while a stored entry was being read
    Failure,
}

impl fmt::Display for CacheResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::CacheHit => write!(f, "CACHE_HIT"),
            Self::CacheMiss => write!(f, "CACHE_MISS"),
            Self::Validated => write!(f, "VALIDATED"),
            Self::CacheModuleResponse => write!(f, "CACHE_MODULE_RESPONSE"),
            Self::Failure => write!(f, "FAILURE"),
        }
    }
}

/// The per-call scope: the route this request travels.
#[derive(Debug, Clone)]
pub struct RouteScope {
    /// The target authority
    pub target: Target,
}

/// Per-call context the executor writes observability attributes into.
#[derive(Debug, Default)]
pub struct ExecContext {
    status: Option<CacheResponseStatus>,
    attributes: HashMap<String, String>,
}

impl ExecContext {
    /// How the last execution was classified. Defaults to
    /// [`CacheResponseStatus::CacheMiss`] before classification.
    #[must_use]
    pub fn response_status(&self) -> CacheResponseStatus {
        self.status.unwrap_or(CacheResponseStatus::CacheMiss)
    }

    /// Reads a context attribute.
    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// Sets a context attribute.
    pub fn set_attribute(&mut self, key: &str, value: String) {
        self.attributes.insert(key.to_string(), value);
    }

    fn set_status(&mut self, status: CacheResponseStatus) {
        self.status = Some(status);
        self.attributes.insert(CACHE_RESPONSE_STATUS.to_string(), status.to_string());
    }
}

/// A snapshot of the executor's counters.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CacheStats {
    /// Requests served from storage
    pub hits: u64,
    /// Requests storage could not satisfy
    pub misses: u64,
    /// Entries confirmed or refreshed by revalidation
    pub updates: u64,
}

#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    updates: AtomicU64,
}

/// A wall clock. Injected so policy decisions are testable; read only
/// at phase boundaries, never inside policy functions.
pub trait Clock: Send + Sync + fmt::Debug {
    /// The current time.
    fn now(&self) -> SystemTime;
}

/// The system wall clock.
#[derive(Debug, Copy, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// The `proceed` capability: the next stage of the pipeline.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Forwards the request toward the origin and returns its
    /// response, or a transport error.
    async fn proceed(
        &self,
        request: Request<Bytes>,
        scope: &RouteScope,
    ) -> std::result::Result<HttpResponse, BoxError>;
}

/// Configuration of the caching stage.
#[derive(Debug, Copy, Clone)]
pub struct CacheConfig {
    /// Upper bound in bytes for storable bodies; larger responses are
    /// passed through uncached.
    pub max_object_size: u64,
    /// Evaluate responses as a shared cache (`s-maxage`,
    /// `proxy-revalidate`, `private`, `Authorization` rules).
    pub shared_cache: bool,
    /// Permit caching of 303 responses with explicit freshness.
    pub cache_303_responses: bool,
    /// Refuse heuristic caching of HTTP/1.0 responses whose URI has a
    /// query string.
    pub never_cache_http10_responses_with_query: bool,
    /// Accept weak ETags in `If-Match` on PUT and DELETE.
    pub allow_weak_etag_on_put_delete: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_object_size: 8192,
            shared_cache: true,
            cache_303_responses: false,
            never_cache_http10_responses_with_query: false,
            allow_weak_etag_on_put_delete: false,
        }
    }
}

/// The caching execution stage.
///
/// Safe for concurrent invocation: per-call state lives on the stack,
/// shared state is three atomic counters, the `Via` memo, and the
/// storage backend (which linearizes per key).
#[derive(Debug)]
pub struct CachingExecutor<S: CacheStorage> {
    storage: Arc<HttpCache<S>>,
    config: CacheConfig,
    validity: ValidityPolicy,
    suitability: SuitabilityChecker,
    conditional: ConditionalRequestBuilder,
    generator: ResponseGenerator,
    request_compliance: RequestCompliance,
    response_compliance: ResponseCompliance,
    request_cacheability: RequestCacheability,
    response_cacheability: ResponseCacheability,
    via: Arc<ViaCache>,
    counters: Arc<CacheCounters>,
    clock: Arc<dyn Clock>,
    revalidator: Option<AsyncRevalidator>,
}

impl<S: CacheStorage> Clone for CachingExecutor<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            config: self.config,
            validity: self.validity,
            suitability: self.suitability,
            conditional: self.conditional,
            generator: self.generator,
            request_compliance: self.request_compliance,
            response_compliance: self.response_compliance,
            request_cacheability: self.request_cacheability,
            response_cacheability: self.response_cacheability,
            via: Arc::clone(&self.via),
            counters: Arc::clone(&self.counters),
            clock: Arc::clone(&self.clock),
            revalidator: self.revalidator.clone(),
        }
    }
}

impl<S: CacheStorage> CachingExecutor<S> {
    /// Builds the stage over a storage backend with the system clock.
    pub fn new(backend: S, config: CacheConfig) -> Self {
        Self::with_clock(backend, config, Arc::new(SystemClock))
    }

    /// Builds the stage with an injected clock.
    pub fn with_clock(backend: S, config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        let validity = ValidityPolicy::new(config.shared_cache);
        Self {
            storage: Arc::new(HttpCache::new(backend)),
            config,
            validity,
            suitability: SuitabilityChecker::new(validity),
            conditional: ConditionalRequestBuilder,
            generator: ResponseGenerator::new(validity),
            request_compliance: RequestCompliance::new(config.allow_weak_etag_on_put_delete),
            response_compliance: ResponseCompliance,
            request_cacheability: RequestCacheability,
            response_cacheability: ResponseCacheability::new(
                config.shared_cache,
                config.cache_303_responses,
                config.never_cache_http10_responses_with_query,
            ),
            via: Arc::new(ViaCache::default()),
            counters: Arc::new(CacheCounters::default()),
            clock,
            revalidator: None,
        }
    }

    /// Attaches a background revalidation pool, enabling
    /// `stale-while-revalidate` service.
    #[must_use]
    pub fn with_revalidator(mut self, revalidator: AsyncRevalidator) -> Self {
        self.revalidator = Some(revalidator);
        self
    }

    /// The storage façade this executor commands.
    #[must_use]
    pub fn storage(&self) -> &HttpCache<S> {
        &self.storage
    }

    /// A snapshot of the hit/miss/update counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            updates: self.counters.updates.load(Ordering::Relaxed),
        }
    }

    /// Executes one request through the cache.
    ///
    /// Returns the client-facing response, calling `backend` zero, one
    /// or (on a too-old revalidation response) two times. Transport
    /// errors propagate; storage errors never do.
    pub async fn execute(
        &self,
        request: Request<Bytes>,
        scope: &RouteScope,
        ctx: &mut ExecContext,
        backend: Arc<dyn Transport>,
    ) -> Result<HttpResponse> {
        let (mut parts, body) = request.into_parts();
        let url = request_url(&scope.target, &parts)?;

        // Phase 0: shortcuts
        if is_self_probe(&parts) {
            ctx.set_status(CacheResponseStatus::CacheModuleResponse);
            return Ok(self.generator.not_implemented(url));
        }
        if let Some(violation) =
            self.request_compliance.fatal_errors(&parts, !body.is_empty()).first()
        {
            debug!("request fatally noncompliant: {violation:?}");
            ctx.set_status(CacheResponseStatus::CacheModuleResponse);
            return Ok(self.generator.error_for_request(*violation, url));
        }

        // Phase 1: normalization
        self.request_compliance.normalize(&mut parts);
        self.via.append_to(&mut parts.headers, HttpVersion::from_http(parts.version));

        // Phase 2: classification
        if !self.request_cacheability.is_servable_from_cache(&parts) {
            ctx.set_status(CacheResponseStatus::CacheMiss);
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            if let Err(err) = self
                .storage
                .flush_invalidated_cache_entries_for(&scope.target, &parts, None)
                .await
            {
                warn!("request-triggered invalidation failed: {err}");
            }
            return self.call_backend(&parts, &body, scope, ctx, &backend).await;
        }

        // Phase 3: lookup
        match self.storage.get(&scope.target, &parts).await {
            Ok(Some(entry)) => {
                self.handle_cache_hit(&parts, &body, scope, ctx, &backend, entry).await
            }
            Ok(None) => self.handle_cache_miss(&parts, &body, scope, ctx, &backend).await,
            Err(err) => {
                warn!("cache lookup failed: {err}");
                self.handle_cache_failure(&parts, &body, scope, ctx, &backend).await
            }
        }
    }

    async fn handle_cache_miss(
        &self,
        parts: &request::Parts,
        body: &Bytes,
        scope: &RouteScope,
        ctx: &mut ExecContext,
        backend: &Arc<dyn Transport>,
    ) -> Result<HttpResponse> {
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        ctx.set_status(CacheResponseStatus::CacheMiss);

        if only_if_cached(parts) {
            ctx.set_status(CacheResponseStatus::CacheModuleResponse);
            return Ok(self.generator.gateway_timeout(request_url(&scope.target, parts)?));
        }

        let variants = match self.storage.get_variants_with_etags(&scope.target, parts).await
        {
            Ok(variants) => variants,
            Err(err) => {
                warn!("variant lookup failed: {err}");
                HashMap::new()
            }
        };
        if !variants.is_empty() {
            return self.negotiate_variants(parts, body, scope, ctx, backend, variants).await;
        }

        self.call_backend(parts, body, scope, ctx, backend).await
    }

    async fn handle_cache_hit(
        &self,
        parts: &request::Parts,
        body: &Bytes,
        scope: &RouteScope,
        ctx: &mut ExecContext,
        backend: &Arc<dyn Transport>,
        entry: CacheEntry,
    ) -> Result<HttpResponse> {
        let now = self.clock.now();

        if self.suitability.can_use(parts, &entry, now) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            ctx.set_status(CacheResponseStatus::CacheHit);
            ctx.set_attribute(CACHE_ROUTE, scope.target.to_string());
            return self.serve_from_entry(parts, &entry, now);
        }

        if only_if_cached(parts) {
            ctx.set_status(CacheResponseStatus::CacheModuleResponse);
            return Ok(self.generator.gateway_timeout(request_url(&scope.target, parts)?));
        }

        // A stored 304 can satisfy only conditional clients; anyone
        // else needs the origin's full representation.
        if entry.status == StatusCode::NOT_MODIFIED && !self.suitability.is_conditional(parts)
        {
            return self.call_backend(parts, body, scope, ctx, backend).await;
        }

        if let Some(revalidator) = &self.revalidator {
            if self.validity.may_return_stale_while_revalidating(&entry, now)
                && self.validity.stale_allowed(&parts.headers, &entry)
            {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                ctx.set_status(CacheResponseStatus::CacheHit);
                ctx.set_attribute(CACHE_ROUTE, scope.target.to_string());
                let response = self.serve_from_entry(parts, &entry, now)?;
                self.schedule_background_revalidation(
                    parts.clone(),
                    body.clone(),
                    scope.clone(),
                    Arc::clone(backend),
                    entry,
                    revalidator,
                );
                return Ok(response);
            }
        }

        self.revalidate(parts, body, scope, ctx, backend, entry).await
    }

    async fn handle_cache_failure(
        &self,
        parts: &request::Parts,
        body: &Bytes,
        scope: &RouteScope,
        ctx: &mut ExecContext,
        backend: &Arc<dyn Transport>,
    ) -> Result<HttpResponse> {
        self.counters.misses.fetch_add(1, Ordering::Relaxed);

        if only_if_cached(parts) {
            ctx.set_status(CacheResponseStatus::CacheModuleResponse);
            return Ok(self.generator.gateway_timeout(request_url(&scope.target, parts)?));
        }

        // Storage is misbehaving; hand the exchange straight through
        // without any further caching semantics.
        ctx.set_status(CacheResponseStatus::Failure);
        let mut response = backend
            .proceed(rebuild_request(parts, body), scope)
            .await
            .map_err(HttpCacheError::Transport)?;
        self.via.append_to(&mut response.headers, response.version);
        Ok(response)
    }

    fn serve_from_entry(
        &self,
        parts: &request::Parts,
        entry: &CacheEntry,
        now: SystemTime,
    ) -> Result<HttpResponse> {
        let mut response = if self.suitability.is_conditional(parts) {
            self.generator.not_modified(entry)?
        } else {
            self.generator.response(parts, entry, now)?
        };
        if !self.validity.is_fresh(entry, now) {
            add_warning(&mut response.headers, 110, "Response is stale");
        }
        Ok(response)
    }

    /// Synchronous revalidation: one conditional call, with a single
    /// unconditional retry when the origin's answer predates the
    /// stored entry.
    async fn revalidate(
        &self,
        parts: &request::Parts,
        body: &Bytes,
        scope: &RouteScope,
        ctx: &mut ExecContext,
        backend: &Arc<dyn Transport>,
        entry: CacheEntry,
    ) -> Result<HttpResponse> {
        let conditional = self.conditional.build_conditional(parts, &entry);

        let mut request_date = self.clock.now();
        let sent = backend.proceed(rebuild_request(&conditional, body), scope).await;
        let mut response_date = self.clock.now();

        let mut backend_response = match sent {
            Ok(response) => response,
            Err(err) => {
                return self.serve_after_revalidation_failure(parts, scope, ctx, &entry, err)
            }
        };

        if response_older_than(&backend_response, &entry) {
            debug!("revalidation response predates stored entry; retrying unconditionally");
            drop(backend_response);
            let unconditional = self.conditional.build_unconditional(parts);
            request_date = self.clock.now();
            let retried =
                backend.proceed(rebuild_request(&unconditional, body), scope).await;
            response_date = self.clock.now();
            backend_response = match retried {
                Ok(response) => response,
                Err(err) => {
                    return self
                        .serve_after_revalidation_failure(parts, scope, ctx, &entry, err)
                }
            };
        }

        self.via.append_to(&mut backend_response.headers, backend_response.version);

        if backend_response.status == StatusCode::OK
            || backend_response.status == StatusCode::NOT_MODIFIED
        {
            self.counters.updates.fetch_add(1, Ordering::Relaxed);
            ctx.set_status(CacheResponseStatus::Validated);
        }

        if backend_response.status == StatusCode::NOT_MODIFIED {
            let updated = match self
                .storage
                .update_cache_entry(
                    &scope.target,
                    parts,
                    &entry,
                    &backend_response,
                    request_date,
                    response_date,
                )
                .await
            {
                Ok(updated) => updated,
                Err(err) => {
                    // keep the merge; only its persistence failed
                    warn!("storing revalidated entry failed: {err}");
                    storage::merge_not_modified(
                        &entry,
                        &backend_response.headers,
                        request_date,
                        response_date,
                    )
                }
            };
            let now = self.clock.now();
            if self.suitability.is_conditional(parts)
                && self.suitability.all_conditionals_match(parts, &updated, now)
            {
                return self.generator.not_modified(&updated);
            }
            return self.generator.response(parts, &updated, now);
        }

        if is_stale_if_error_candidate(backend_response.status)
            && self.validity.stale_allowed(&parts.headers, &entry)
            && self.validity.may_return_stale_if_error(&parts.headers, &entry, response_date)
        {
            drop(backend_response);
            ctx.set_status(CacheResponseStatus::CacheHit);
            let mut response = self.generator.response(parts, &entry, response_date)?;
            add_warning(&mut response.headers, 110, "Response is stale");
            return Ok(response);
        }

        self.handle_backend_response(
            parts,
            scope,
            ctx,
            backend_response,
            request_date,
            response_date,
        )
        .await
    }

    fn serve_after_revalidation_failure(
        &self,
        parts: &request::Parts,
        scope: &RouteScope,
        ctx: &mut ExecContext,
        entry: &CacheEntry,
        err: BoxError,
    ) -> Result<HttpResponse> {
        warn!("revalidation transport failure: {err}");
        if !self.validity.stale_allowed(&parts.headers, entry) {
            ctx.set_status(CacheResponseStatus::CacheModuleResponse);
            return Ok(self.generator.gateway_timeout(request_url(&scope.target, parts)?));
        }
        ctx.set_status(CacheResponseStatus::CacheHit);
        let now = self.clock.now();
        let mut response = self.generator.response(parts, entry, now)?;
        add_warning(&mut response.headers, 111, "Revalidation failed");
        Ok(response)
    }

    /// Miss with a known variant set: one conditional request listing
    /// every variant ETag decides between reuse and a fresh fetch.
    async fn negotiate_variants(
        &self,
        parts: &request::Parts,
        body: &Bytes,
        scope: &RouteScope,
        ctx: &mut ExecContext,
        backend: &Arc<dyn Transport>,
        variants: HashMap<String, VariantHandle>,
    ) -> Result<HttpResponse> {
        let mut etags: Vec<String> = variants.keys().cloned().collect();
        etags.sort();
        let conditional = self.conditional.build_from_variants(parts, &etags);

        let request_date = self.clock.now();
        let mut backend_response = backend
            .proceed(rebuild_request(&conditional, body), scope)
            .await
            .map_err(HttpCacheError::Transport)?;
        let response_date = self.clock.now();

        if backend_response.status != StatusCode::NOT_MODIFIED {
            return self
                .handle_backend_response(
                    parts,
                    scope,
                    ctx,
                    backend_response,
                    request_date,
                    response_date,
                )
                .await;
        }

        let matched = backend_response
            .headers
            .get("etag")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .and_then(|etag| variants.get(etag));

        let Some(variant) = matched else {
            // 304 without a usable ETag cannot select a variant
            debug!("variant negotiation returned an unusable 304; fetching full response");
            drop(backend_response);
            return self.call_backend(parts, body, scope, ctx, backend).await;
        };

        if response_older_than(&backend_response, &variant.entry) {
            drop(backend_response);
            let unconditional = self.conditional.build_unconditional(parts);
            let request_date = self.clock.now();
            let retried = backend
                .proceed(rebuild_request(&unconditional, body), scope)
                .await
                .map_err(HttpCacheError::Transport)?;
            let response_date = self.clock.now();
            return self
                .handle_backend_response(parts, scope, ctx, retried, request_date, response_date)
                .await;
        }

        self.via.append_to(&mut backend_response.headers, backend_response.version);
        self.counters.updates.fetch_add(1, Ordering::Relaxed);
        ctx.set_status(CacheResponseStatus::Validated);

        let updated = match self
            .storage
            .update_variant_cache_entry(
                &scope.target,
                parts,
                &variant.entry,
                &backend_response,
                request_date,
                response_date,
                &variant.variant_key,
            )
            .await
        {
            Ok(updated) => updated,
            Err(err) => {
                warn!("storing revalidated variant failed: {err}");
                storage::merge_not_modified(
                    &variant.entry,
                    &backend_response.headers,
                    request_date,
                    response_date,
                )
            }
        };

        let handle =
            VariantHandle { variant_key: variant.variant_key.clone(), entry: updated.clone() };
        if let Err(err) =
            self.storage.reuse_variant_entry_for(&scope.target, parts, &handle).await
        {
            warn!("recording canonical variant failed: {err}");
        }

        let now = self.clock.now();
        if self.suitability.is_conditional(parts)
            && self.suitability.all_conditionals_match(parts, &updated, now)
        {
            return self.generator.not_modified(&updated);
        }
        self.generator.response(parts, &updated, now)
    }

    async fn call_backend(
        &self,
        parts: &request::Parts,
        body: &Bytes,
        scope: &RouteScope,
        ctx: &mut ExecContext,
        backend: &Arc<dyn Transport>,
    ) -> Result<HttpResponse> {
        let request_date = self.clock.now();
        let response = backend
            .proceed(rebuild_request(parts, body), scope)
            .await
            .map_err(HttpCacheError::Transport)?;
        let response_date = self.clock.now();
        self.handle_backend_response(parts, scope, ctx, response, request_date, response_date)
            .await
    }

    /// Everything that happens to a fresh backend response: repair,
    /// response-triggered invalidation, the storability decision, and
    /// the bounded-buffer store.
    async fn handle_backend_response(
        &self,
        parts: &request::Parts,
        scope: &RouteScope,
        ctx: &mut ExecContext,
        mut response: HttpResponse,
        request_date: SystemTime,
        response_date: SystemTime,
    ) -> Result<HttpResponse> {
        self.response_compliance.ensure(&mut response, response_date);
        self.via.append_to(&mut response.headers, response.version);

        if let Err(err) = self
            .storage
            .flush_invalidated_cache_entries_for(&scope.target, parts, Some(&response))
            .await
        {
            warn!("response-triggered invalidation failed: {err}");
        }

        let storable = self.response_cacheability.is_storable(parts, &response);
        if storable && !self.already_have_newer_entry(parts, scope, &response).await {
            return self
                .cache_and_return(parts, scope, ctx, response, request_date, response_date)
                .await;
        }

        if !storable {
            if let Err(err) =
                self.storage.flush_cache_entries_for(&scope.target, parts).await
            {
                warn!("flushing superseded entry failed: {err}");
            }
        }
        Ok(response)
    }

    /// Resolves writer races by newest origin time: an entry already
    /// stored with a later `Date` wins over this response.
    async fn already_have_newer_entry(
        &self,
        parts: &request::Parts,
        scope: &RouteScope,
        response: &HttpResponse,
    ) -> bool {
        let existing = match self.storage.get(&scope.target, parts).await {
            Ok(existing) => existing,
            Err(err) => {
                warn!("pre-store lookup failed: {err}");
                return false;
            }
        };
        match (existing.as_ref().and_then(CacheEntry::date), response_date_header(response)) {
            (Some(existing_date), Some(new_date)) => existing_date > new_date,
            _ => false,
        }
    }

    async fn cache_and_return(
        &self,
        parts: &request::Parts,
        scope: &RouteScope,
        ctx: &mut ExecContext,
        response: HttpResponse,
        request_date: SystemTime,
        response_date: SystemTime,
    ) -> Result<HttpResponse> {
        let HttpResponse { status, version, headers, url, body } = response;

        let bytes = match body
            .read_bounded(self.config.max_object_size)
            .await
            .map_err(HttpCacheError::Transport)?
        {
            BoundedRead::Complete(bytes) => bytes,
            BoundedRead::Overflow { prefix, rest } => {
                debug!("response body exceeds max object size; passing through uncached");
                return Ok(HttpResponse {
                    status,
                    version,
                    headers,
                    url,
                    body: CacheBody::chained(prefix, rest),
                });
            }
        };

        if matches!(status.as_u16(), 200 | 206) {
            if let Some(declared) = content_length(&headers) {
                if (bytes.len() as u64) < declared {
                    let diagnostic = format!(
                        "Received incomplete response body (expected {declared} bytes, received {})",
                        bytes.len()
                    );
                    warn!("{diagnostic}");
                    ctx.set_status(CacheResponseStatus::CacheModuleResponse);
                    return Ok(self.generator.bad_gateway(&diagnostic, url));
                }
            }
        }

        let mut meta = HttpResponse { status, version, headers, url, body: CacheBody::empty() };

        // A storable 304 needs a validator for later entry matching;
        // the client's precondition supplies it, but must never be
        // surfaced back out.
        let mut stashed_last_modified = false;
        if status == StatusCode::NOT_MODIFIED && !meta.headers.contains_key("last-modified") {
            if let Some(ims) = parts.headers.get("if-modified-since") {
                meta.headers.insert("last-modified", ims.clone());
                stashed_last_modified = true;
            }
        }

        match self
            .storage
            .create_cache_entry(
                &scope.target,
                parts,
                &meta,
                bytes.to_vec(),
                request_date,
                response_date,
            )
            .await
        {
            Ok(entry) => {
                let now = self.clock.now();
                let mut generated = self.generator.response(parts, &entry, now)?;
                if stashed_last_modified {
                    generated.headers.remove("last-modified");
                }
                Ok(generated)
            }
            Err(err) => {
                warn!("storing response failed; returning it uncached: {err}");
                if stashed_last_modified {
                    meta.headers.remove("last-modified");
                }
                meta.body = CacheBody::buffered(bytes);
                Ok(meta)
            }
        }
    }

    fn schedule_background_revalidation(
        &self,
        parts: request::Parts,
        body: Bytes,
        scope: RouteScope,
        backend: Arc<dyn Transport>,
        entry: CacheEntry,
        revalidator: &AsyncRevalidator,
    ) {
        let fingerprint =
            Fingerprint::new(&scope.target, &parts.uri, &parts.method).storage_key();
        let executor = self.clone();
        revalidator.schedule(
            fingerprint,
            async move {
                let mut ctx = ExecContext::default();
                match executor
                    .revalidate(&parts, &body, &scope, &mut ctx, &backend, entry)
                    .await
                {
                    // the response is discarded; storage already saw
                    // the side effects
                    Ok(_) => {}
                    Err(err) => warn!("background revalidation failed: {err}"),
                }
            }
            .boxed(),
        );
    }
}

fn is_self_probe(parts: &request::Parts) -> bool {
    parts.method == Method::OPTIONS
        && (parts.uri == "*" || parts.uri.path() == "*")
        && parts.headers.get("max-forwards").and_then(|v| v.to_str().ok()) == Some("0")
}

fn only_if_cached(parts: &request::Parts) -> bool {
    CacheControl::from_headers(&parts.headers).has("only-if-cached")
}

fn rebuild_request(parts: &request::Parts, body: &Bytes) -> Request<Bytes> {
    let mut request = Request::new(body.clone());
    *request.method_mut() = parts.method.clone();
    *request.uri_mut() = parts.uri.clone();
    *request.version_mut() = parts.version;
    *request.headers_mut() = parts.headers.clone();
    request
}

fn request_url(target: &Target, parts: &request::Parts) -> Result<Url> {
    let path = match parts.uri.path_and_query() {
        Some(pq) if pq.as_str() != "*" => pq.as_str(),
        _ => "/",
    };
    Ok(Url::parse(&format!("{target}{path}"))?)
}

fn response_date_header(response: &HttpResponse) -> Option<SystemTime> {
    response
        .headers
        .get("date")
        .and_then(|v| v.to_str().ok())
        .and_then(|d| httpdate::parse_http_date(d).ok())
}

/// Strictly-older check driving the single unconditional retry.
fn response_older_than(response: &HttpResponse, entry: &CacheEntry) -> bool {
    match (response_date_header(response), entry.date()) {
        (Some(response_date), Some(entry_date)) => response_date < entry_date,
        _ => false,
    }
}

fn is_stale_if_error_candidate(status: StatusCode) -> bool {
    matches!(status.as_u16(), 500 | 502 | 503 | 504)
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers.get("content-length").and_then(|v| v.to_str().ok()).and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod test;
