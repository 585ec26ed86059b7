use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use http::{request, Request, StatusCode};

use crate::{
    AsyncRevalidator, CacheBody, CacheConfig, CacheResponseStatus, CacheStorage,
    CachingExecutor, Clock, ExecContext, HttpResponse, HttpVersion, RouteScope,
    StorageError, StorageResult, StoredRecord, Target, Transport, CACHE_RESPONSE_STATUS,
};

const T0: SystemTime = SystemTime::UNIX_EPOCH;

fn base() -> SystemTime {
    T0 + Duration::from_secs(1_700_000_000)
}

#[derive(Debug)]
struct FixedClock(Mutex<SystemTime>);

impl FixedClock {
    fn new(start: SystemTime) -> Arc<Self> {
        Arc::new(Self(Mutex::new(start)))
    }

    fn advance(&self, secs: u64) {
        *self.0.lock().unwrap() += Duration::from_secs(secs);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> SystemTime {
        *self.0.lock().unwrap()
    }
}

/// In-memory backend that counts reads and can be told to fail them.
#[derive(Debug, Clone, Default)]
struct TestBackend {
    records: Arc<Mutex<HashMap<String, StoredRecord>>>,
    reads: Arc<AtomicUsize>,
    fail_reads: Arc<AtomicBool>,
}

#[async_trait]
impl CacheStorage for TestBackend {
    async fn get(&self, key: &str) -> StorageResult<Option<StoredRecord>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        if self.fail_reads.load(Ordering::Relaxed) {
            return Err(StorageError::unavailable(std::io::Error::other("backend down")));
        }
        Ok(self.records.lock().unwrap().get(key).cloned())
    }

    async fn put(&self, key: String, record: StoredRecord) -> StorageResult<()> {
        self.records.lock().unwrap().insert(key, record);
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.records.lock().unwrap().remove(key);
        Ok(())
    }
}

enum Step {
    Respond { status: u16, headers: Vec<(&'static str, String)>, chunks: Vec<Bytes> },
    Fail(&'static str),
}

/// Transport that replays a script and records every request it saw.
#[derive(Default)]
struct ScriptedTransport {
    script: Mutex<VecDeque<Step>>,
    calls: Mutex<Vec<request::Parts>>,
}

impl ScriptedTransport {
    fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self { script: Mutex::new(steps.into()), calls: Mutex::new(Vec::new()) })
    }

    fn push(&self, step: Step) {
        self.script.lock().unwrap().push_back(step);
    }

    fn calls(&self) -> Vec<request::Parts> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn proceed(
        &self,
        request: Request<Bytes>,
        _scope: &RouteScope,
    ) -> Result<HttpResponse, crate::BoxError> {
        let (parts, _body) = request.into_parts();
        let url = url::Url::parse(&parts.uri.to_string()).expect("absolute request uri");
        self.calls.lock().unwrap().push(parts);

        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .expect("backend called more times than scripted");
        match step {
            Step::Fail(reason) => Err(reason.into()),
            Step::Respond { status, headers, chunks } => {
                let mut map = http::HeaderMap::new();
                for (name, value) in headers {
                    map.append(
                        name.parse::<http::header::HeaderName>().unwrap(),
                        http::HeaderValue::from_str(&value).unwrap(),
                    );
                }
                let body = if chunks.len() == 1 {
                    CacheBody::buffered(chunks.into_iter().next().unwrap())
                } else {
                    CacheBody::streaming(stream::iter(
                        chunks.into_iter().map(Ok).collect::<Vec<_>>(),
                    ))
                };
                Ok(HttpResponse {
                    status: StatusCode::from_u16(status).unwrap(),
                    version: HttpVersion::Http11,
                    headers: map,
                    url,
                    body,
                })
            }
        }
    }
}

fn scope() -> RouteScope {
    RouteScope { target: Target { scheme: "http".into(), host: "h".into(), port: 80 } }
}

fn executor_at(
    clock: Arc<FixedClock>,
) -> (CachingExecutor<TestBackend>, TestBackend) {
    executor_with_config(clock, CacheConfig::default())
}

fn executor_with_config(
    clock: Arc<FixedClock>,
    config: CacheConfig,
) -> (CachingExecutor<TestBackend>, TestBackend) {
    let backend = TestBackend::default();
    let executor = CachingExecutor::with_clock(backend.clone(), config, clock);
    (executor, backend)
}

fn get(uri: &str) -> Request<Bytes> {
    Request::get(uri).body(Bytes::new()).unwrap()
}

fn get_with(uri: &str, headers: &[(&str, &str)]) -> Request<Bytes> {
    let mut builder = Request::get(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder.body(Bytes::new()).unwrap()
}

fn ok_with_max_age(clock: &FixedClock, body: &str) -> Step {
    Step::Respond {
        status: 200,
        headers: vec![
            ("date", httpdate::fmt_http_date(Clock::now(clock))),
            ("cache-control", "max-age=3600".to_string()),
        ],
        chunks: vec![Bytes::from(body.to_string())],
    }
}

async fn body_of(response: HttpResponse) -> Bytes {
    response.body.collect().await.unwrap()
}

#[tokio::test]
async fn first_miss_then_hit() {
    let clock = FixedClock::new(base());
    let (executor, _backend) = executor_at(clock.clone());
    let transport = ScriptedTransport::new(vec![ok_with_max_age(&clock, "AAA")]);

    let mut ctx = ExecContext::default();
    let first = executor
        .execute(get("http://h/x"), &scope(), &mut ctx, transport.clone())
        .await
        .unwrap();
    assert_eq!(first.status, StatusCode::OK);
    assert_eq!(body_of(first).await, "AAA");
    assert_eq!(ctx.response_status(), CacheResponseStatus::CacheMiss);

    clock.advance(60);
    let mut ctx = ExecContext::default();
    let second = executor
        .execute(get("http://h/x"), &scope(), &mut ctx, transport.clone())
        .await
        .unwrap();
    assert_eq!(second.status, StatusCode::OK);
    assert_eq!(second.headers.get("age").unwrap(), "60");
    assert_eq!(body_of(second).await, "AAA");
    assert_eq!(ctx.response_status(), CacheResponseStatus::CacheHit);
    assert_eq!(ctx.attribute(CACHE_RESPONSE_STATUS), Some("CACHE_HIT"));

    // no second backend call, one of each counter
    assert_eq!(transport.calls().len(), 1);
    let stats = executor.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
}

#[tokio::test]
async fn stale_entry_revalidates_with_304() {
    let clock = FixedClock::new(base());
    let (executor, _backend) = executor_at(clock.clone());
    let transport = ScriptedTransport::new(vec![Step::Respond {
        status: 200,
        headers: vec![
            ("date", httpdate::fmt_http_date(Clock::now(&*clock))),
            ("cache-control", "max-age=1".to_string()),
            ("etag", "\"v1\"".to_string()),
        ],
        chunks: vec![Bytes::from_static(b"AAA")],
    }]);

    let mut ctx = ExecContext::default();
    executor
        .execute(get("http://h/x"), &scope(), &mut ctx, transport.clone())
        .await
        .unwrap();

    clock.advance(100);
    let t1 = Clock::now(&*clock);
    transport.push(Step::Respond {
        status: 304,
        headers: vec![
            ("date", httpdate::fmt_http_date(t1)),
            ("cache-control", "max-age=3600".to_string()),
        ],
        chunks: vec![Bytes::new()],
    });

    let mut ctx = ExecContext::default();
    let response = executor
        .execute(get("http://h/x"), &scope(), &mut ctx, transport.clone())
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.headers.get("age").unwrap(), "0");
    assert_eq!(body_of(response).await, "AAA");
    assert_eq!(ctx.response_status(), CacheResponseStatus::Validated);
    assert_eq!(executor.stats().updates, 1);

    // the revalidation carried the entry's validator
    let calls = transport.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].headers.get("if-none-match").unwrap(), "\"v1\"");

    // the merged entry is fresh again
    clock.advance(10);
    let mut ctx = ExecContext::default();
    executor
        .execute(get("http://h/x"), &scope(), &mut ctx, transport.clone())
        .await
        .unwrap();
    assert_eq!(ctx.response_status(), CacheResponseStatus::CacheHit);
    assert_eq!(transport.calls().len(), 2);
}

#[tokio::test]
async fn only_if_cached_miss_returns_504() {
    let clock = FixedClock::new(base());
    let (executor, _backend) = executor_at(clock);
    let transport = ScriptedTransport::new(vec![]);

    let mut ctx = ExecContext::default();
    let response = executor
        .execute(
            get_with("http://h/x", &[("cache-control", "only-if-cached")]),
            &scope(),
            &mut ctx,
            transport.clone(),
        )
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(ctx.response_status(), CacheResponseStatus::CacheModuleResponse);
    assert!(transport.calls().is_empty());
}

#[tokio::test]
async fn only_if_cached_with_stale_entry_returns_504() {
    let clock = FixedClock::new(base());
    let (executor, _backend) = executor_at(clock.clone());
    let transport = ScriptedTransport::new(vec![Step::Respond {
        status: 200,
        headers: vec![
            ("date", httpdate::fmt_http_date(Clock::now(&*clock))),
            ("cache-control", "max-age=1".to_string()),
        ],
        chunks: vec![Bytes::from_static(b"AAA")],
    }]);
    let mut ctx = ExecContext::default();
    executor
        .execute(get("http://h/x"), &scope(), &mut ctx, transport.clone())
        .await
        .unwrap();

    clock.advance(100);
    let mut ctx = ExecContext::default();
    let response = executor
        .execute(
            get_with("http://h/x", &[("cache-control", "only-if-cached")]),
            &scope(),
            &mut ctx,
            transport.clone(),
        )
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(ctx.response_status(), CacheResponseStatus::CacheModuleResponse);
    assert_eq!(transport.calls().len(), 1);
}

#[tokio::test]
async fn self_probe_options_returns_501() {
    let clock = FixedClock::new(base());
    let (executor, backend) = executor_at(clock);
    let transport = ScriptedTransport::new(vec![]);

    let request = Request::builder()
        .method("OPTIONS")
        .uri("*")
        .header("max-forwards", "0")
        .body(Bytes::new())
        .unwrap();
    let mut ctx = ExecContext::default();
    let response =
        executor.execute(request, &scope(), &mut ctx, transport.clone()).await.unwrap();
    assert_eq!(response.status, StatusCode::NOT_IMPLEMENTED);
    assert_eq!(ctx.response_status(), CacheResponseStatus::CacheModuleResponse);
    assert!(transport.calls().is_empty());
    assert_eq!(backend.reads.load(Ordering::Relaxed), 0);
}

#[tokio::test]
async fn variant_negotiation_stores_new_variant() {
    let clock = FixedClock::new(base());
    let (executor, _backend) = executor_at(clock.clone());
    let date = httpdate::fmt_http_date(Clock::now(&*clock));
    let transport = ScriptedTransport::new(vec![Step::Respond {
        status: 200,
        headers: vec![
            ("date", date.clone()),
            ("cache-control", "max-age=3600".to_string()),
            ("vary", "accept".to_string()),
            ("etag", "\"a\"".to_string()),
        ],
        chunks: vec![Bytes::from_static(b"html")],
    }]);

    let mut ctx = ExecContext::default();
    executor
        .execute(
            get_with("http://h/x", &[("accept", "text/html")]),
            &scope(),
            &mut ctx,
            transport.clone(),
        )
        .await
        .unwrap();

    // a request for a representation we don't hold negotiates with
    // every known variant ETag
    transport.push(Step::Respond {
        status: 200,
        headers: vec![
            ("date", date),
            ("cache-control", "max-age=3600".to_string()),
            ("vary", "accept".to_string()),
            ("etag", "\"b\"".to_string()),
        ],
        chunks: vec![Bytes::from_static(b"json")],
    });
    let mut ctx = ExecContext::default();
    let response = executor
        .execute(
            get_with("http://h/x", &[("accept", "application/json")]),
            &scope(),
            &mut ctx,
            transport.clone(),
        )
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(body_of(response).await, "json");

    let calls = transport.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].headers.get("if-none-match").unwrap(), "\"a\"");

    // both variants now serve from storage
    let mut ctx = ExecContext::default();
    let json_again = executor
        .execute(
            get_with("http://h/x", &[("accept", "application/json")]),
            &scope(),
            &mut ctx,
            transport.clone(),
        )
        .await
        .unwrap();
    assert_eq!(body_of(json_again).await, "json");
    assert_eq!(ctx.response_status(), CacheResponseStatus::CacheHit);
    assert_eq!(transport.calls().len(), 2);
}

#[tokio::test]
async fn variant_negotiation_reuses_matching_variant_on_304() {
    let clock = FixedClock::new(base());
    let (executor, _backend) = executor_at(clock.clone());
    let date = httpdate::fmt_http_date(Clock::now(&*clock));
    let transport = ScriptedTransport::new(vec![Step::Respond {
        status: 200,
        headers: vec![
            ("date", date.clone()),
            ("cache-control", "max-age=3600".to_string()),
            ("vary", "accept".to_string()),
            ("etag", "\"a\"".to_string()),
        ],
        chunks: vec![Bytes::from_static(b"html")],
    }]);

    let mut ctx = ExecContext::default();
    executor
        .execute(
            get_with("http://h/x", &[("accept", "text/html")]),
            &scope(),
            &mut ctx,
            transport.clone(),
        )
        .await
        .unwrap();

    clock.advance(10);
    transport.push(Step::Respond {
        status: 304,
        headers: vec![
            ("date", httpdate::fmt_http_date(Clock::now(&*clock))),
            ("etag", "\"a\"".to_string()),
        ],
        chunks: vec![Bytes::new()],
    });
    let mut ctx = ExecContext::default();
    let response = executor
        .execute(
            get_with("http://h/x", &[("accept", "text/xhtml")]),
            &scope(),
            &mut ctx,
            transport.clone(),
        )
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(body_of(response).await, "html");
    assert_eq!(ctx.response_status(), CacheResponseStatus::Validated);
    assert_eq!(executor.stats().updates, 1);
}

#[tokio::test]
async fn too_old_revalidation_retries_unconditionally() {
    let clock = FixedClock::new(base());
    let (executor, _backend) = executor_at(clock.clone());
    let t2 = Clock::now(&*clock);
    let transport = ScriptedTransport::new(vec![Step::Respond {
        status: 200,
        headers: vec![
            ("date", httpdate::fmt_http_date(t2)),
            ("cache-control", "max-age=1".to_string()),
            ("etag", "\"v2\"".to_string()),
        ],
        chunks: vec![Bytes::from_static(b"OLD")],
    }]);

    let mut ctx = ExecContext::default();
    executor
        .execute(get("http://h/x"), &scope(), &mut ctx, transport.clone())
        .await
        .unwrap();

    clock.advance(50);
    // a validation answer older than what we hold is discarded
    transport.push(Step::Respond {
        status: 304,
        headers: vec![("date", httpdate::fmt_http_date(t2 - Duration::from_secs(100)))],
        chunks: vec![Bytes::new()],
    });
    transport.push(Step::Respond {
        status: 200,
        headers: vec![
            ("date", httpdate::fmt_http_date(Clock::now(&*clock))),
            ("cache-control", "max-age=60".to_string()),
        ],
        chunks: vec![Bytes::from_static(b"NEW")],
    });

    let mut ctx = ExecContext::default();
    let response = executor
        .execute(get("http://h/x"), &scope(), &mut ctx, transport.clone())
        .await
        .unwrap();
    assert_eq!(body_of(response).await, "NEW");

    let calls = transport.calls();
    assert_eq!(calls.len(), 3);
    assert!(calls[1].headers.contains_key("if-none-match"));
    assert!(!calls[2].headers.contains_key("if-none-match"));
    assert!(!calls[2].headers.contains_key("if-modified-since"));

    // the retried response is what got stored
    let mut ctx = ExecContext::default();
    let hit = executor
        .execute(get("http://h/x"), &scope(), &mut ctx, transport.clone())
        .await
        .unwrap();
    assert_eq!(body_of(hit).await, "NEW");
    assert_eq!(transport.calls().len(), 3);
}

#[tokio::test]
async fn unservable_request_skips_lookup() {
    let clock = FixedClock::new(base());
    let (executor, backend) = executor_at(clock.clone());
    let transport = ScriptedTransport::new(vec![Step::Respond {
        status: 201,
        headers: vec![
            ("date", httpdate::fmt_http_date(Clock::now(&*clock))),
            ("content-length", "0".to_string()),
        ],
        chunks: vec![Bytes::new()],
    }]);

    let request = Request::post("http://h/x")
        .header("content-length", "3")
        .body(Bytes::from_static(b"abc"))
        .unwrap();
    let mut ctx = ExecContext::default();
    let response =
        executor.execute(request, &scope(), &mut ctx, transport.clone()).await.unwrap();
    assert_eq!(response.status, StatusCode::CREATED);
    assert_eq!(ctx.response_status(), CacheResponseStatus::CacheMiss);
    assert_eq!(transport.calls().len(), 1);
    // nothing entered storage for the uncacheable method
    assert!(backend.records.lock().unwrap().is_empty());
}

#[tokio::test]
async fn oversized_response_passes_through_uncached() {
    let clock = FixedClock::new(base());
    let config = CacheConfig { max_object_size: 8, ..Default::default() };
    let (executor, _backend) = executor_with_config(clock.clone(), config);
    let date = httpdate::fmt_http_date(Clock::now(&*clock));
    let big = || Step::Respond {
        status: 200,
        headers: vec![("date", date.clone()), ("cache-control", "max-age=3600".to_string())],
        chunks: vec![
            Bytes::from_static(b"aaaa"),
            Bytes::from_static(b"bbbb"),
            Bytes::from_static(b"cccc"),
        ],
    };
    let transport = ScriptedTransport::new(vec![big(), big()]);

    let mut ctx = ExecContext::default();
    let response = executor
        .execute(get("http://h/x"), &scope(), &mut ctx, transport.clone())
        .await
        .unwrap();
    // the client still sees every byte, rejoined around the cap
    assert_eq!(body_of(response).await, "aaaabbbbcccc");

    // nothing was stored
    let mut ctx = ExecContext::default();
    executor
        .execute(get("http://h/x"), &scope(), &mut ctx, transport.clone())
        .await
        .unwrap();
    assert_eq!(transport.calls().len(), 2);
}

#[tokio::test]
async fn truncated_body_becomes_bad_gateway() {
    let clock = FixedClock::new(base());
    let (executor, _backend) = executor_at(clock.clone());
    let transport = ScriptedTransport::new(vec![Step::Respond {
        status: 200,
        headers: vec![
            ("date", httpdate::fmt_http_date(Clock::now(&*clock))),
            ("cache-control", "max-age=3600".to_string()),
            ("content-length", "10".to_string()),
        ],
        chunks: vec![Bytes::from_static(b"abc")],
    }]);

    let mut ctx = ExecContext::default();
    let response = executor
        .execute(get("http://h/x"), &scope(), &mut ctx, transport.clone())
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::BAD_GATEWAY);
    let body = body_of(response).await;
    let text = std::str::from_utf8(&body).unwrap();
    assert!(text.contains("expected 10"));
    assert!(text.contains("received 3"));
}

#[tokio::test]
async fn storage_read_failure_degrades_to_passthrough() {
    let clock = FixedClock::new(base());
    let (executor, backend) = executor_at(clock.clone());
    backend.fail_reads.store(true, Ordering::Relaxed);
    let transport = ScriptedTransport::new(vec![ok_with_max_age(&clock, "AAA")]);

    let mut ctx = ExecContext::default();
    let response = executor
        .execute(get("http://h/x"), &scope(), &mut ctx, transport.clone())
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(body_of(response).await, "AAA");
    assert_eq!(ctx.response_status(), CacheResponseStatus::Failure);
    assert_eq!(executor.stats().misses, 1);
    assert_eq!(transport.calls().len(), 1);
}

#[tokio::test]
async fn revalidation_transport_error_serves_stale_with_warning() {
    let clock = FixedClock::new(base());
    let (executor, _backend) = executor_at(clock.clone());
    let transport = ScriptedTransport::new(vec![Step::Respond {
        status: 200,
        headers: vec![
            ("date", httpdate::fmt_http_date(Clock::now(&*clock))),
            ("cache-control", "max-age=1".to_string()),
            ("etag", "\"v1\"".to_string()),
        ],
        chunks: vec![Bytes::from_static(b"AAA")],
    }]);
    let mut ctx = ExecContext::default();
    executor
        .execute(get("http://h/x"), &scope(), &mut ctx, transport.clone())
        .await
        .unwrap();

    clock.advance(100);
    transport.push(Step::Fail("connection refused"));
    let mut ctx = ExecContext::default();
    let response = executor
        .execute(get("http://h/x"), &scope(), &mut ctx, transport.clone())
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::OK);
    let warning = response.headers.get("warning").unwrap().to_str().unwrap().to_string();
    assert_eq!(body_of(response).await, "AAA");
    assert_eq!(ctx.response_status(), CacheResponseStatus::CacheHit);
    assert_eq!(warning, "111 localhost \"Revalidation failed\"");
}

#[tokio::test]
async fn revalidation_transport_error_without_stale_permission_times_out() {
    let clock = FixedClock::new(base());
    let (executor, _backend) = executor_at(clock.clone());
    let transport = ScriptedTransport::new(vec![Step::Respond {
        status: 200,
        headers: vec![
            ("date", httpdate::fmt_http_date(Clock::now(&*clock))),
            ("cache-control", "max-age=1, must-revalidate".to_string()),
            ("etag", "\"v1\"".to_string()),
        ],
        chunks: vec![Bytes::from_static(b"AAA")],
    }]);
    let mut ctx = ExecContext::default();
    executor
        .execute(get("http://h/x"), &scope(), &mut ctx, transport.clone())
        .await
        .unwrap();

    clock.advance(100);
    transport.push(Step::Fail("connection refused"));
    let mut ctx = ExecContext::default();
    let response = executor
        .execute(get("http://h/x"), &scope(), &mut ctx, transport.clone())
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::GATEWAY_TIMEOUT);
}

#[tokio::test]
async fn stale_if_error_serves_stale_on_5xx() {
    let clock = FixedClock::new(base());
    let (executor, _backend) = executor_at(clock.clone());
    let transport = ScriptedTransport::new(vec![Step::Respond {
        status: 200,
        headers: vec![
            ("date", httpdate::fmt_http_date(Clock::now(&*clock))),
            ("cache-control", "max-age=1, stale-if-error=600".to_string()),
            ("etag", "\"v1\"".to_string()),
        ],
        chunks: vec![Bytes::from_static(b"AAA")],
    }]);
    let mut ctx = ExecContext::default();
    executor
        .execute(get("http://h/x"), &scope(), &mut ctx, transport.clone())
        .await
        .unwrap();

    clock.advance(100);
    transport.push(Step::Respond {
        status: 503,
        headers: vec![("date", httpdate::fmt_http_date(Clock::now(&*clock)))],
        chunks: vec![Bytes::new()],
    });
    let mut ctx = ExecContext::default();
    let response = executor
        .execute(get("http://h/x"), &scope(), &mut ctx, transport.clone())
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::OK);
    let warning = response.headers.get("warning").unwrap().to_str().unwrap().to_string();
    assert_eq!(body_of(response).await, "AAA");
    assert_eq!(warning, "110 localhost \"Response is stale\"");
}

#[tokio::test]
async fn conditional_client_request_gets_304_on_fresh_hit() {
    let clock = FixedClock::new(base());
    let (executor, _backend) = executor_at(clock.clone());
    let transport = ScriptedTransport::new(vec![Step::Respond {
        status: 200,
        headers: vec![
            ("date", httpdate::fmt_http_date(Clock::now(&*clock))),
            ("cache-control", "max-age=3600".to_string()),
            ("etag", "\"v1\"".to_string()),
        ],
        chunks: vec![Bytes::from_static(b"AAA")],
    }]);
    let mut ctx = ExecContext::default();
    executor
        .execute(get("http://h/x"), &scope(), &mut ctx, transport.clone())
        .await
        .unwrap();

    clock.advance(10);
    let mut ctx = ExecContext::default();
    let response = executor
        .execute(
            get_with("http://h/x", &[("if-none-match", "\"v1\"")]),
            &scope(),
            &mut ctx,
            transport.clone(),
        )
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::NOT_MODIFIED);
    assert_eq!(response.headers.get("etag").unwrap(), "\"v1\"");
    assert!(body_of(response).await.is_empty());
    assert_eq!(ctx.response_status(), CacheResponseStatus::CacheHit);
    assert_eq!(transport.calls().len(), 1);
}

#[tokio::test]
async fn outbound_requests_carry_via() {
    let clock = FixedClock::new(base());
    let (executor, _backend) = executor_at(clock.clone());
    let transport = ScriptedTransport::new(vec![ok_with_max_age(&clock, "AAA")]);

    let mut ctx = ExecContext::default();
    let response = executor
        .execute(get("http://h/x"), &scope(), &mut ctx, transport.clone())
        .await
        .unwrap();

    let calls = transport.calls();
    let sent_via = calls[0].headers.get("via").unwrap().to_str().unwrap();
    assert!(sent_via.starts_with("1.1 localhost ("));
    assert!(sent_via.ends_with("(cache))"));
    drop(response);
}

#[tokio::test]
async fn stale_while_revalidate_serves_stale_and_refreshes() {
    let clock = FixedClock::new(base());
    let backend = TestBackend::default();
    let executor = CachingExecutor::with_clock(
        backend.clone(),
        CacheConfig::default(),
        clock.clone(),
    )
    .with_revalidator(AsyncRevalidator::new(2));
    let transport = ScriptedTransport::new(vec![Step::Respond {
        status: 200,
        headers: vec![
            ("date", httpdate::fmt_http_date(Clock::now(&*clock))),
            ("cache-control", "max-age=1, stale-while-revalidate=600".to_string()),
            ("etag", "\"v1\"".to_string()),
        ],
        chunks: vec![Bytes::from_static(b"AAA")],
    }]);

    let mut ctx = ExecContext::default();
    executor
        .execute(get("http://h/x"), &scope(), &mut ctx, transport.clone())
        .await
        .unwrap();

    clock.advance(100);
    transport.push(Step::Respond {
        status: 304,
        headers: vec![
            ("date", httpdate::fmt_http_date(Clock::now(&*clock))),
            ("cache-control", "max-age=3600, stale-while-revalidate=600".to_string()),
            ("etag", "\"v1\"".to_string()),
        ],
        chunks: vec![Bytes::new()],
    });

    // served stale immediately, marked as such
    let mut ctx = ExecContext::default();
    let response = executor
        .execute(get("http://h/x"), &scope(), &mut ctx, transport.clone())
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::OK);
    let warning = response.headers.get("warning").unwrap().to_str().unwrap().to_string();
    assert_eq!(body_of(response).await, "AAA");
    assert_eq!(ctx.response_status(), CacheResponseStatus::CacheHit);
    assert_eq!(warning, "110 localhost \"Response is stale\"");

    // the background worker revalidates off-band
    for _ in 0..200 {
        if executor.stats().updates == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert_eq!(executor.stats().updates, 1);
    assert_eq!(transport.calls().len(), 2);

    // refreshed entry serves fresh with no further backend traffic
    let mut ctx = ExecContext::default();
    let after = executor
        .execute(get("http://h/x"), &scope(), &mut ctx, transport.clone())
        .await
        .unwrap();
    assert_eq!(ctx.response_status(), CacheResponseStatus::CacheHit);
    assert!(after.headers.get("warning").is_none());
    assert_eq!(transport.calls().len(), 2);
}

#[tokio::test]
async fn unsafe_method_invalidates_stored_entry() {
    let clock = FixedClock::new(base());
    let (executor, _backend) = executor_at(clock.clone());
    let transport = ScriptedTransport::new(vec![ok_with_max_age(&clock, "AAA")]);

    let mut ctx = ExecContext::default();
    executor
        .execute(get("http://h/x"), &scope(), &mut ctx, transport.clone())
        .await
        .unwrap();

    transport.push(Step::Respond {
        status: 204,
        headers: vec![("date", httpdate::fmt_http_date(Clock::now(&*clock)))],
        chunks: vec![Bytes::new()],
    });
    let delete = Request::delete("http://h/x").body(Bytes::new()).unwrap();
    let mut ctx = ExecContext::default();
    executor.execute(delete, &scope(), &mut ctx, transport.clone()).await.unwrap();

    // the stored entry is gone; the next read refetches
    transport.push(ok_with_max_age(&clock, "BBB"));
    let mut ctx = ExecContext::default();
    let response = executor
        .execute(get("http://h/x"), &scope(), &mut ctx, transport.clone())
        .await
        .unwrap();
    assert_eq!(body_of(response).await, "BBB");
    assert_eq!(transport.calls().len(), 3);
}

#[tokio::test]
async fn fatal_noncompliance_answers_without_backend() {
    let clock = FixedClock::new(base());
    let (executor, _backend) = executor_at(clock);
    let transport = ScriptedTransport::new(vec![]);

    let request = Request::post("http://h/x").body(Bytes::from_static(b"abc")).unwrap();
    let mut ctx = ExecContext::default();
    let response =
        executor.execute(request, &scope(), &mut ctx, transport.clone()).await.unwrap();
    assert_eq!(response.status, StatusCode::LENGTH_REQUIRED);
    assert_eq!(ctx.response_status(), CacheResponseStatus::CacheModuleResponse);
    assert!(transport.calls().is_empty());
}

#[tokio::test]
async fn counters_cover_all_classified_outcomes() {
    let clock = FixedClock::new(base());
    let (executor, _backend) = executor_at(clock.clone());
    let transport = ScriptedTransport::new(vec![ok_with_max_age(&clock, "AAA")]);

    // miss, hit, and a validated refresh
    let mut ctx = ExecContext::default();
    executor
        .execute(get("http://h/x"), &scope(), &mut ctx, transport.clone())
        .await
        .unwrap();
    let mut ctx = ExecContext::default();
    executor
        .execute(get("http://h/x"), &scope(), &mut ctx, transport.clone())
        .await
        .unwrap();

    clock.advance(4000);
    transport.push(Step::Respond {
        status: 304,
        headers: vec![
            ("date", httpdate::fmt_http_date(Clock::now(&*clock))),
            ("cache-control", "max-age=3600".to_string()),
        ],
        chunks: vec![Bytes::new()],
    });
    let mut ctx = ExecContext::default();
    executor
        .execute(get("http://h/x"), &scope(), &mut ctx, transport.clone())
        .await
        .unwrap();

    let stats = executor.stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.updates, 1);
    assert!(stats.hits + stats.misses + stats.updates >= 3);
}
