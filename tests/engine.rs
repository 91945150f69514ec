//! End-to-end engine behavior over scripted transports: retry bounds,
//! detection gating, caching, cookies, and batch ordering.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{CONTENT_TYPE, COOKIE, SET_COOKIE};
use http::{HeaderMap, HeaderValue};
use metafetch::{
    recommend, Engine, FailureKind, FetchOptions, RequestDescriptor, ResponseEnvelope, Transport,
    TransportError,
};

/// One scripted transport step.
enum Step {
    Respond {
        status: u16,
        body: &'static str,
        headers: HeaderMap,
    },
    Fail(TransportError),
}

/// Replays a fixed script, repeating the last step once exhausted. Counts
/// calls and remembers the Cookie header of the most recent request.
struct ScriptedTransport {
    script: Mutex<VecDeque<Step>>,
    last: Mutex<Option<Step>>,
    calls: AtomicUsize,
    seen_cookie: Mutex<Option<String>>,
}

impl ScriptedTransport {
    fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(steps.into()),
            last: Mutex::new(None),
            calls: AtomicUsize::new(0),
            seen_cookie: Mutex::new(None),
        })
    }

    fn ok(status: u16, body: &'static str) -> Step {
        Step::Respond {
            status,
            body,
            headers: HeaderMap::new(),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: &RequestDescriptor) -> Result<ResponseEnvelope, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.seen_cookie.lock().unwrap() = request
            .headers
            .get(COOKIE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let step = {
            let mut script = self.script.lock().unwrap();
            match script.pop_front() {
                Some(step) => {
                    let mut last = self.last.lock().unwrap();
                    let replay = match &step {
                        Step::Respond {
                            status,
                            body,
                            headers,
                        } => Step::Respond {
                            status: *status,
                            body: *body,
                            headers: headers.clone(),
                        },
                        Step::Fail(err) => Step::Fail(err.clone()),
                    };
                    *last = Some(replay);
                    step
                }
                None => {
                    let last = self.last.lock().unwrap();
                    match last.as_ref() {
                        Some(Step::Respond {
                            status,
                            body,
                            headers,
                        }) => Step::Respond {
                            status: *status,
                            body: *body,
                            headers: headers.clone(),
                        },
                        Some(Step::Fail(err)) => Step::Fail(err.clone()),
                        None => Step::Fail(TransportError::Network("script empty".into())),
                    }
                }
            }
        };

        match step {
            Step::Respond {
                status,
                body,
                headers,
            } => Ok(ResponseEnvelope {
                status,
                body: Bytes::from_static(body.as_bytes()),
                headers,
                elapsed: Duration::from_millis(5),
                proxy_id: request.proxy.as_ref().map(|p| p.id),
            }),
            Step::Fail(err) => Err(err),
        }
    }
}

/// Echoes the request path back as the body. Used for ordering checks.
struct EchoTransport;

#[async_trait]
impl Transport for EchoTransport {
    async fn send(&self, request: &RequestDescriptor) -> Result<ResponseEnvelope, TransportError> {
        Ok(ResponseEnvelope {
            status: 200,
            body: Bytes::from(request.url.path().to_string()),
            headers: HeaderMap::new(),
            elapsed: Duration::from_millis(1),
            proxy_id: None,
        })
    }
}

fn engine_with(transport: Arc<dyn Transport>) -> Engine {
    Engine::builder()
        .with_transport(transport)
        .with_base_delay(Duration::from_millis(1))
        .build()
}

fn no_cache() -> FetchOptions {
    FetchOptions {
        use_cache: false,
        ..FetchOptions::default()
    }
}

#[tokio::test]
async fn cache_hit_skips_transport() {
    let transport = ScriptedTransport::new(vec![ScriptedTransport::ok(200, "<html>ok</html>")]);
    let engine = engine_with(transport.clone());

    let first = engine
        .fetch("https://example.com/page", FetchOptions::default())
        .await
        .unwrap();
    assert!(!first.from_cache);

    let second = engine
        .fetch("https://example.com/page", FetchOptions::default())
        .await
        .unwrap();
    assert!(second.from_cache);
    assert_eq!(second.body, first.body);
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn transient_status_retries_until_success() {
    let transport = ScriptedTransport::new(vec![
        ScriptedTransport::ok(503, "try later"),
        ScriptedTransport::ok(200, "<html>ok</html>"),
    ]);
    let engine = engine_with(transport.clone());

    let result = engine
        .fetch("https://example.com/item", no_cache())
        .await
        .unwrap();
    assert_eq!(result.status, 200);
    assert_eq!(result.attempts, 2);
    assert_eq!(transport.calls(), 2);
}

#[tokio::test]
async fn network_errors_exhaust_the_attempt_budget() {
    let transport = ScriptedTransport::new(vec![Step::Fail(TransportError::Network(
        "connection refused".into(),
    ))]);
    let engine = engine_with(transport.clone());

    let err = engine
        .fetch("https://example.com/item", no_cache())
        .await
        .expect_err("all attempts fail");
    assert_eq!(err.kind, FailureKind::Network);
    assert_eq!(err.attempts, 3);
    assert_eq!(transport.calls(), 3);
}

#[tokio::test]
async fn terminal_status_is_not_retried() {
    let transport = ScriptedTransport::new(vec![ScriptedTransport::ok(404, "gone")]);
    let engine = engine_with(transport.clone());

    let err = engine
        .fetch("https://example.com/missing", no_cache())
        .await
        .expect_err("404 is terminal");
    assert_eq!(err.kind, FailureKind::Http(404));
    assert_eq!(err.attempts, 1);
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn bare_rate_limit_stays_retryable() {
    // A lone 429 scores below the confidence gate, so it keeps its
    // transient-status retry semantics.
    let transport = ScriptedTransport::new(vec![
        ScriptedTransport::ok(429, "slow down"),
        ScriptedTransport::ok(200, "<html>ok</html>"),
    ]);
    let engine = engine_with(transport.clone());

    let result = engine
        .fetch("https://example.com/item", no_cache())
        .await
        .unwrap();
    assert_eq!(result.attempts, 2);
}

#[tokio::test]
async fn confident_bot_block_stops_immediately() {
    let mut headers = HeaderMap::new();
    headers.insert("cf-ray", HeaderValue::from_static("8a1b2c3d4e5f-ABC"));
    let transport = ScriptedTransport::new(vec![Step::Respond {
        status: 403,
        body: "<html>Checking your browser before accessing</html>",
        headers,
    }]);
    let engine = engine_with(transport.clone());

    let err = engine
        .fetch("https://example.com/protected", no_cache())
        .await
        .expect_err("block is terminal");
    assert_eq!(err.kind, FailureKind::BotDetected);
    assert_eq!(err.attempts, 1);
    assert_eq!(transport.calls(), 1);

    let detection = err.detection.expect("detection attached");
    assert!(detection.confidence >= 0.7);
    assert!(!recommend(&detection).is_empty());

    let stats = engine.detection_stats();
    assert_eq!(stats.bot_detected, 1);
}

#[tokio::test]
async fn challenge_request_without_capability_fails_fast() {
    let transport = ScriptedTransport::new(vec![ScriptedTransport::ok(200, "never reached")]);
    let engine = engine_with(transport.clone());

    let options = FetchOptions {
        use_challenge_transport: true,
        use_cache: false,
        ..FetchOptions::default()
    };
    let err = engine
        .fetch("https://example.com/protected", options)
        .await
        .expect_err("no challenge transport configured");
    assert_eq!(err.kind, FailureKind::ChallengeBlocked);
    assert_eq!(err.attempts, 1);
    assert_eq!(transport.calls(), 0);
}

#[tokio::test]
async fn challenge_transport_is_used_when_requested() {
    let direct = ScriptedTransport::new(vec![ScriptedTransport::ok(200, "direct")]);
    let challenge = ScriptedTransport::new(vec![ScriptedTransport::ok(200, "solved")]);
    let engine = Engine::builder()
        .with_transport(direct.clone())
        .with_challenge_transport(challenge.clone())
        .build();

    let options = FetchOptions {
        use_challenge_transport: true,
        use_cache: false,
        ..FetchOptions::default()
    };
    let result = engine
        .fetch("https://example.com/protected", options)
        .await
        .unwrap();
    assert_eq!(result.body, "solved");
    assert_eq!(direct.calls(), 0);
    assert_eq!(challenge.calls(), 1);
}

#[tokio::test]
async fn body_is_decoded_per_declared_charset() {
    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=iso-8859-1"),
    );
    // "café" spelled in Latin-1 inside minimal markup.
    static LATIN1_BODY: &[u8] = &[
        b'<', b'p', b'>', b'c', b'a', b'f', 0xE9, b'<', b'/', b'p', b'>',
    ];

    struct Latin1Transport;

    #[async_trait]
    impl Transport for Latin1Transport {
        async fn send(
            &self,
            _request: &RequestDescriptor,
        ) -> Result<ResponseEnvelope, TransportError> {
            let mut headers = HeaderMap::new();
            headers.insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/html; charset=iso-8859-1"),
            );
            Ok(ResponseEnvelope {
                status: 200,
                body: Bytes::from_static(LATIN1_BODY),
                headers,
                elapsed: Duration::from_millis(1),
                proxy_id: None,
            })
        }
    }

    let engine = engine_with(Arc::new(Latin1Transport));
    let result = engine
        .fetch("https://example.com/cafe", no_cache())
        .await
        .unwrap();
    assert_eq!(result.body, "<p>café</p>");
    assert_eq!(metafetch::normalize::text_content(&result.body), "café");
}

#[tokio::test]
async fn fetched_markup_sanitizes_down_to_text() {
    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    let transport = ScriptedTransport::new(vec![Step::Respond {
        status: 200,
        body: "<html><body><h1>X</h1></body></html>",
        headers,
    }]);
    let engine = engine_with(transport);

    let result = engine
        .fetch("https://example.com/x", no_cache())
        .await
        .unwrap();
    let clean = metafetch::normalize::sanitize(&result.body);
    assert_eq!(metafetch::normalize::text_content(&clean), "X");
}

#[tokio::test]
async fn set_cookie_is_stored_and_replayed() {
    let mut headers = HeaderMap::new();
    headers.insert(
        SET_COOKIE,
        HeaderValue::from_static("sid=abc123; Path=/; HttpOnly"),
    );
    let transport = ScriptedTransport::new(vec![
        Step::Respond {
            status: 200,
            body: "<html>first</html>",
            headers,
        },
        ScriptedTransport::ok(200, "<html>second</html>"),
    ]);
    let engine = engine_with(transport.clone());

    engine
        .fetch("https://example.com/login", no_cache())
        .await
        .unwrap();
    let stored = engine.cookies().for_domain("example.com");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].name, "sid");

    engine
        .fetch("https://example.com/account", no_cache())
        .await
        .unwrap();
    let seen = transport.seen_cookie.lock().unwrap().clone();
    assert_eq!(seen.as_deref(), Some("sid=abc123"));
}

#[tokio::test]
async fn fetch_many_preserves_input_order() {
    let engine = engine_with(Arc::new(EchoTransport));
    let urls = [
        "https://example.com/a",
        "https://example.com/b",
        "https://example.com/c",
        "https://example.com/d",
    ];

    let results = engine.fetch_many(&urls, no_cache(), Some(2)).await;
    let bodies: Vec<_> = results
        .into_iter()
        .map(|r| r.unwrap().body)
        .collect();
    assert_eq!(bodies, vec!["/a", "/b", "/c", "/d"]);
}

#[tokio::test]
async fn fetch_many_isolates_failures() {
    let engine = engine_with(Arc::new(EchoTransport));
    let urls = ["https://example.com/ok", "not a url"];

    let results = engine.fetch_many(&urls, no_cache(), None).await;
    assert!(results[0].is_ok());
    let err = results[1].as_ref().expect_err("bad url fails alone");
    assert_eq!(err.kind, FailureKind::InvalidUrl);
}

#[tokio::test]
async fn zero_deadline_fails_before_any_attempt() {
    let transport = ScriptedTransport::new(vec![ScriptedTransport::ok(200, "never")]);
    let engine = engine_with(transport.clone());

    let options = FetchOptions {
        deadline: Some(Duration::ZERO),
        use_cache: false,
        ..FetchOptions::default()
    };
    let err = engine
        .fetch("https://example.com/slow", options)
        .await
        .expect_err("budget already spent");
    assert_eq!(err.kind, FailureKind::DeadlineExceeded);
    assert_eq!(err.attempts, 0);
    assert_eq!(transport.calls(), 0);
}

#[tokio::test]
async fn failing_proxy_leaves_rotation_and_pool_self_heals() {
    let transport = ScriptedTransport::new(vec![Step::Fail(TransportError::Network(
        "connection reset".into(),
    ))]);
    let engine = Engine::builder()
        .with_transport(transport)
        .with_base_delay(Duration::from_millis(1))
        .with_proxy("10.0.0.1", 8080)
        .build();

    // One exhausted fetch burns three attempts through the only proxy,
    // crossing the failure threshold.
    let err = engine
        .fetch("https://example.com/item", no_cache())
        .await
        .expect_err("all attempts fail");
    assert_eq!(err.attempts, 3);
    assert_eq!(engine.pool_stats().failed_proxies, 1);

    // The next fetch still draws the proxy on every attempt: the pool
    // self-heals rather than starve rotation.
    let _ = engine.fetch("https://example.com/item", no_cache()).await;
    let stats = engine.pool_stats();
    assert_eq!(stats.rotations, 6);
    assert_eq!(stats.total_requests, 6);
}

#[tokio::test]
async fn metrics_track_responses_and_retries() {
    let transport = ScriptedTransport::new(vec![
        ScriptedTransport::ok(503, "busy"),
        ScriptedTransport::ok(200, "<html>ok</html>"),
    ]);
    let engine = engine_with(transport);

    engine
        .fetch("https://example.com/item", no_cache())
        .await
        .unwrap();

    let snapshot = engine.metrics();
    assert_eq!(snapshot.global.total_requests, 2);
    assert_eq!(snapshot.global.successes, 1);
    assert_eq!(snapshot.global.failures, 1);
    assert_eq!(snapshot.global.retries, 1);

    let domain = snapshot
        .domains
        .iter()
        .find(|d| d.domain == "example.com")
        .expect("domain tracked");
    assert_eq!(domain.total_requests, 2);
    assert_eq!(domain.last_status, Some(200));
}
