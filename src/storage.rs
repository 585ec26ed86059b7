//! The storage façade: atomic put/get/update/invalidate over a
//! pluggable backend, including variant-set management.
//!
//! Backends linearize operations per key; every façade write is a
//! single backend put, so a reader observes either the old or the new
//! record, never a torn one. Composite operations (a variant entry
//! plus its parent map) are two writes whose relative order is
//! backend-defined, matching the cross-key ordering contract.

use std::collections::HashMap;
use std::time::SystemTime;

use async_trait::async_trait;
use http::{request, HeaderMap, Method};
use log::warn;
use url::Url;

use crate::entry::{variant_key, CacheEntry, Fingerprint, StoredRecord, Target, VariantHandle};
use crate::error::StorageResult;
use crate::HttpResponse;

// Headers never copied from a 304 onto a stored entry: the body is
// reused, so properties of the body must not change.
const EXCLUDED_FROM_REVALIDATION_UPDATE: &[&str] =
    &["content-length", "content-encoding", "transfer-encoding", "content-range"];

/// A key-value backend holding stored records.
///
/// Implementations must be safe for concurrent reads and must make
/// each write internally atomic; ordering between concurrent writes on
/// the same key is backend-defined.
#[async_trait]
pub trait CacheStorage: Send + Sync + 'static {
    /// Reads the record stored under `key`.
    async fn get(&self, key: &str) -> StorageResult<Option<StoredRecord>>;
    /// Stores `record` under `key`, replacing any previous record.
    async fn put(&self, key: String, record: StoredRecord) -> StorageResult<()>;
    /// Removes the record stored under `key`.
    async fn delete(&self, key: &str) -> StorageResult<()>;
}

/// The storage façade used by the executor.
#[derive(Debug, Clone)]
pub struct HttpCache<S> {
    backend: S,
}

impl<S: CacheStorage> HttpCache<S> {
    /// Wraps a backend.
    pub fn new(backend: S) -> Self {
        Self { backend }
    }

    /// Looks up the entry satisfying `parts`, resolving `Vary`
    /// variants through the stored selecting headers.
    pub async fn get(
        &self,
        target: &Target,
        parts: &request::Parts,
    ) -> StorageResult<Option<CacheEntry>> {
        let fp = Fingerprint::new(target, &parts.uri, &parts.method);
        let Some(record) = self.backend.get(&fp.storage_key()).await? else {
            return Ok(None);
        };

        if record.has_variants() {
            let key = variant_key(&record.vary_names, &parts.headers);
            if record.variants.contains_key(&key) {
                let stored = self.backend.get(&fp.variant_storage_key(&key)).await?;
                return Ok(stored.and_then(|r| r.entry));
            }
            // No stored variant for this request's selecting headers;
            // the canonical entry only helps if its Vary still matches,
            // which the suitability check establishes.
            return Ok(record.entry.filter(|e| {
                variant_key(&record.vary_names, &e.request_headers) == key
            }));
        }

        Ok(record.entry)
    }

    /// All known variants of this fingerprint, keyed by ETag.
    pub async fn get_variants_with_etags(
        &self,
        target: &Target,
        parts: &request::Parts,
    ) -> StorageResult<HashMap<String, VariantHandle>> {
        let fp = Fingerprint::new(target, &parts.uri, &parts.method);
        let Some(record) = self.backend.get(&fp.storage_key()).await? else {
            return Ok(HashMap::new());
        };

        let mut variants = HashMap::new();
        for (key, etag) in &record.variants {
            match self.backend.get(&fp.variant_storage_key(key)).await? {
                Some(StoredRecord { entry: Some(entry), .. }) => {
                    variants.insert(
                        etag.clone(),
                        VariantHandle { variant_key: key.clone(), entry },
                    );
                }
                _ => {
                    warn!("variant record missing for {} #{}", fp.storage_key(), key);
                }
            }
        }
        Ok(variants)
    }

    /// Atomically stores a fresh backend response; variant-aware.
    /// Returns the stored entry.
    pub async fn create_cache_entry(
        &self,
        target: &Target,
        parts: &request::Parts,
        response: &HttpResponse,
        body: Vec<u8>,
        request_sent: SystemTime,
        response_received: SystemTime,
    ) -> StorageResult<CacheEntry> {
        let fp = Fingerprint::new(target, &parts.uri, &parts.method);
        let entry = CacheEntry {
            method: parts.method.clone(),
            uri: parts.uri.clone(),
            request_headers: parts.headers.clone(),
            status: response.status,
            version: response.version,
            headers: response.headers.clone(),
            body,
            request_sent,
            response_received,
        };

        let etag = entry.etag().map(str::to_string);
        if entry.has_vary() {
            if let Some(etag) = etag {
                return self.store_variant(&fp, entry, etag).await;
            }
        }

        // Plain store; a previously negotiated resource collapses back
        // to a single representation.
        if let Some(old) = self.backend.get(&fp.storage_key()).await.ok().flatten() {
            self.drop_variant_records(&fp, &old).await;
        }
        self.backend.put(fp.storage_key(), StoredRecord::root(entry.clone())).await?;
        Ok(entry)
    }

    async fn store_variant(
        &self,
        fp: &Fingerprint,
        entry: CacheEntry,
        etag: String,
    ) -> StorageResult<CacheEntry> {
        let vary_names = entry.vary_names();
        let key = variant_key(&vary_names, &entry.request_headers);

        let mut record =
            self.backend.get(&fp.storage_key()).await?.unwrap_or_default();
        record.vary_names = vary_names;

        // One ETag names one variant; a reassigned tag evicts the
        // variant that used to carry it.
        let displaced: Vec<String> = record
            .variants
            .iter()
            .filter(|(k, v)| **v == etag && **k != key)
            .map(|(k, _)| k.clone())
            .collect();
        for old_key in displaced {
            record.variants.remove(&old_key);
            if let Err(err) =
                self.backend.delete(&fp.variant_storage_key(&old_key)).await
            {
                warn!("failed to drop displaced variant: {err}");
            }
        }

        record.variants.insert(key.clone(), etag);
        record.entry = Some(entry.clone());

        self.backend
            .put(fp.variant_storage_key(&key), StoredRecord::root(entry.clone()))
            .await?;
        self.backend.put(fp.storage_key(), record).await?;
        Ok(entry)
    }

    /// Merges a `304 Not Modified` onto the stored entry and persists
    /// the result. The body handle is retained.
    pub async fn update_cache_entry(
        &self,
        target: &Target,
        parts: &request::Parts,
        entry: &CacheEntry,
        not_modified: &HttpResponse,
        request_sent: SystemTime,
        response_received: SystemTime,
    ) -> StorageResult<CacheEntry> {
        let fp = Fingerprint::new(target, &parts.uri, &parts.method);
        let merged =
            merge_not_modified(entry, &not_modified.headers, request_sent, response_received);

        let mut record =
            self.backend.get(&fp.storage_key()).await?.unwrap_or_default();
        record.entry = Some(merged.clone());
        self.backend.put(fp.storage_key(), record).await?;
        Ok(merged)
    }

    /// Variant-aware 304 merge: the variant record is rewritten and
    /// the parent map re-pointed at the merged entry's ETag.
    pub async fn update_variant_cache_entry(
        &self,
        target: &Target,
        parts: &request::Parts,
        entry: &CacheEntry,
        not_modified: &HttpResponse,
        request_sent: SystemTime,
        response_received: SystemTime,
        variant_key: &str,
    ) -> StorageResult<CacheEntry> {
        let fp = Fingerprint::new(target, &parts.uri, &parts.method);
        let merged =
            merge_not_modified(entry, &not_modified.headers, request_sent, response_received);

        self.backend
            .put(fp.variant_storage_key(variant_key), StoredRecord::root(merged.clone()))
            .await?;

        let mut record =
            self.backend.get(&fp.storage_key()).await?.unwrap_or_default();
        if let Some(etag) = merged.etag() {
            record.variants.insert(variant_key.to_string(), etag.to_string());
        }
        if record.vary_names.is_empty() {
            record.vary_names = merged.vary_names();
        }
        self.backend.put(fp.storage_key(), record).await?;
        Ok(merged)
    }

    /// Records that this fingerprint now canonically resolves to
    /// `variant`.
    pub async fn reuse_variant_entry_for(
        &self,
        target: &Target,
        parts: &request::Parts,
        variant: &VariantHandle,
    ) -> StorageResult<()> {
        let fp = Fingerprint::new(target, &parts.uri, &parts.method);
        let mut record =
            self.backend.get(&fp.storage_key()).await?.unwrap_or_default();
        record.entry = Some(variant.entry.clone());
        if record.vary_names.is_empty() {
            record.vary_names = variant.entry.vary_names();
        }
        self.backend.put(fp.storage_key(), record).await
    }

    /// Invalidates entries this exchange makes untrustworthy: the
    /// request URI on unsafe methods, plus same-host `Location` and
    /// `Content-Location` targets of a non-error response.
    pub async fn flush_invalidated_cache_entries_for(
        &self,
        target: &Target,
        parts: &request::Parts,
        response: Option<&HttpResponse>,
    ) -> StorageResult<()> {
        let unsafe_method = !matches!(
            parts.method,
            Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE
        );
        if unsafe_method {
            self.flush_cache_entries_for(target, parts).await?;
        }

        if let Some(response) = response {
            if unsafe_method && !response.status.is_server_error() && !response.status.is_client_error() {
                for name in ["location", "content-location"] {
                    if let Some(value) =
                        response.headers.get(name).and_then(|v| v.to_str().ok())
                    {
                        self.flush_location(target, value).await;
                    }
                }
            }
        }
        Ok(())
    }

    async fn flush_location(&self, target: &Target, location: &str) {
        let Ok(url) = Url::parse(location) else { return };
        if url.host_str() != Some(target.host.as_str()) {
            // Never invalidate other origins on a server's say-so.
            return;
        }
        let Ok(uri) = url.as_str().parse::<http::Uri>() else { return };
        for method in [Method::GET, Method::HEAD] {
            let fp = Fingerprint::new(target, &uri, &method);
            if let Err(err) = self.delete_record(&fp).await {
                warn!("invalidation of {} failed: {err}", fp.storage_key());
            }
        }
    }

    /// Hard-removes the entries for this request URI (GET and HEAD
    /// fingerprints, including variants).
    pub async fn flush_cache_entries_for(
        &self,
        target: &Target,
        parts: &request::Parts,
    ) -> StorageResult<()> {
        for method in [Method::GET, Method::HEAD] {
            let fp = Fingerprint::new(target, &parts.uri, &method);
            self.delete_record(&fp).await?;
        }
        Ok(())
    }

    async fn delete_record(&self, fp: &Fingerprint) -> StorageResult<()> {
        if let Some(record) = self.backend.get(&fp.storage_key()).await.ok().flatten() {
            self.drop_variant_records(fp, &record).await;
        }
        self.backend.delete(&fp.storage_key()).await
    }

    async fn drop_variant_records(&self, fp: &Fingerprint, record: &StoredRecord) {
        for key in record.variants.keys() {
            if let Err(err) = self.backend.delete(&fp.variant_storage_key(key)).await {
                warn!("failed to drop variant {}: {err}", fp.variant_storage_key(key));
            }
        }
    }
}

/// Applies the end-to-end headers of a 304 onto a stored entry. The
/// old body and any body-describing headers are retained; warning
/// values with 1xx codes are dropped as part of the update.
pub(crate) fn merge_not_modified(
    entry: &CacheEntry,
    fresh: &HeaderMap,
    request_sent: SystemTime,
    response_received: SystemTime,
) -> CacheEntry {
    let mut merged = entry.clone();
    merged.request_sent = request_sent;
    merged.response_received = response_received;

    let retained: Vec<http::HeaderValue> = merged
        .headers
        .get_all("warning")
        .iter()
        .filter(|v| {
            v.to_str()
                .ok()
                .and_then(|t| t.trim().chars().take(3).collect::<String>().parse::<u16>().ok())
                .is_some_and(|code| code >= 200)
        })
        .cloned()
        .collect();
    merged.headers.remove("warning");
    for value in retained {
        merged.headers.append("warning", value);
    }

    for name in fresh.keys() {
        let name_str = name.as_str();
        if EXCLUDED_FROM_REVALIDATION_UPDATE.contains(&name_str) || name_str == "warning" {
            continue;
        }
        let values: Vec<_> = fresh.get_all(name).iter().cloned().collect();
        merged.headers.remove(name);
        for value in values {
            merged.headers.append(name.clone(), value);
        }
    }
    merged
}
