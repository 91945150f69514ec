//! Fetch orchestration: retry loop, failure classification, caching, and
//! batch fan-out over the transport policy.
//!
//! The engine owns one instance of every collaborator module and is the only
//! place where their interactions are sequenced. A single `fetch` call walks
//! cache -> bounded retry loop -> detection gate -> normalization, feeding
//! proxy health and metrics along the way.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::stream::{self, StreamExt};
use http::header::{ACCEPT, ACCEPT_LANGUAGE, USER_AGENT};
use http::{HeaderMap, HeaderValue, Method};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::modules::cache::{cache_key, ResponseCache, DEFAULT_TTL};
use crate::modules::cookies::{CookieStore, DEFAULT_MAX_AGE};
use crate::modules::detection::{BotDetector, DetectionResult, DetectionStats};
use crate::modules::events::{
    EngineEvent, EventDispatcher, LoggingHandler, MetricsHandler, PostResponseEvent,
    PreRequestEvent, RetryEvent,
};
use crate::modules::metrics::{MetricsCollector, MetricsSnapshot};
use crate::modules::normalize;
use crate::modules::proxy::{PoolStats, ProxyPool};
use crate::transport::{
    DirectTransport, ProxySelection, RequestDescriptor, Transport, TransportError,
    TransportPolicy, DEFAULT_TIMEOUT,
};

/// Attempts per fetch before giving up, including the first.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Concurrent requests per `fetch_many` batch.
pub const DEFAULT_BATCH_SIZE: usize = 5;

/// Detection confidence at or above which a fetch stops retrying.
pub const DEFAULT_BOT_CONFIDENCE_THRESHOLD: f32 = 0.7;

/// Statuses worth another attempt. Everything else non-2xx is terminal.
pub const TRANSIENT_STATUSES: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// Why a fetch ultimately failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    Network,
    Timeout,
    Http(u16),
    ChallengeBlocked,
    BotDetected,
    DeadlineExceeded,
    InvalidUrl,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Network => write!(f, "network failure"),
            Self::Timeout => write!(f, "timeout"),
            Self::Http(status) => write!(f, "http status {status}"),
            Self::ChallengeBlocked => write!(f, "challenge blocked"),
            Self::BotDetected => write!(f, "bot detection"),
            Self::DeadlineExceeded => write!(f, "deadline exceeded"),
            Self::InvalidUrl => write!(f, "invalid url"),
        }
    }
}

/// Whether a failure of this kind is worth another attempt.
pub fn retryable(kind: &FailureKind) -> bool {
    match kind {
        FailureKind::Network | FailureKind::Timeout => true,
        FailureKind::Http(status) => TRANSIENT_STATUSES.contains(status),
        _ => false,
    }
}

/// Terminal fetch failure carrying what the retry loop learned on the way.
#[derive(Debug, Clone, Error)]
#[error("{kind} after {attempts} attempt(s): {reason}")]
pub struct FetchError {
    pub kind: FailureKind,
    pub reason: String,
    pub attempts: u32,
    pub elapsed: Duration,
    /// Present when the final response tripped the anti-bot heuristics.
    pub detection: Option<DetectionResult>,
}

/// Decoded, successful response. Serializable so it can live in the cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchResult {
    pub status: u16,
    pub body: String,
    pub headers: Vec<(String, String)>,
    pub attempts: u32,
    #[serde(default)]
    pub from_cache: bool,
}

/// Per-call knobs. `Default` is a cached GET with engine-level timeout.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
    pub timeout: Option<Duration>,
    pub use_challenge_transport: bool,
    pub use_cache: bool,
    pub proxy: Option<ProxySelection>,
    /// Wall-clock budget for the whole fetch including backoff sleeps.
    pub deadline: Option<Duration>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
            timeout: None,
            use_challenge_transport: false,
            use_cache: true,
            proxy: None,
            deadline: None,
        }
    }
}

#[derive(Debug, Clone)]
struct EngineConfig {
    max_attempts: u32,
    /// Fixed backoff base. `None` draws a random 1-3s delay per retry.
    base_delay: Option<Duration>,
    timeout: Duration,
    cookie_max_age: Duration,
    batch_size: usize,
    bot_confidence_threshold: f32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: None,
            timeout: DEFAULT_TIMEOUT,
            cookie_max_age: DEFAULT_MAX_AGE,
            batch_size: DEFAULT_BATCH_SIZE,
            bot_confidence_threshold: DEFAULT_BOT_CONFIDENCE_THRESHOLD,
        }
    }
}

/// Builder for [`Engine`].
#[derive(Default)]
pub struct EngineBuilder {
    config: EngineConfig,
    cache_ttl: Option<Duration>,
    proxies: Vec<(String, u16, Option<(String, String)>)>,
    transport: Option<Arc<dyn Transport>>,
    challenge: Option<Arc<dyn Transport>>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_proxy(mut self, host: impl Into<String>, port: u16) -> Self {
        self.proxies.push((host.into(), port, None));
        self
    }

    pub fn with_authenticated_proxy(
        mut self,
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.proxies
            .push((host.into(), port, Some((username.into(), password.into()))));
        self
    }

    /// Replace the default direct transport. Primarily a test seam.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Attach a challenge-capable transport for protected targets.
    pub fn with_challenge_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.challenge = Some(transport);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.config.max_attempts = max_attempts.max(1);
        self
    }

    /// Fix the backoff base so delays become `base * 2^(attempt-1)`. Without
    /// this the engine draws a random 1-3s delay per retry.
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.config.base_delay = Some(base_delay);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    pub fn with_cookie_max_age(mut self, max_age: Duration) -> Self {
        self.config.cookie_max_age = max_age;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.config.batch_size = batch_size.max(1);
        self
    }

    pub fn with_bot_confidence_threshold(mut self, threshold: f32) -> Self {
        self.config.bot_confidence_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    pub fn build(self) -> Engine {
        let metrics = MetricsCollector::new();
        let mut dispatcher = EventDispatcher::new();
        dispatcher.register_handler(Arc::new(LoggingHandler));
        dispatcher.register_handler(Arc::new(MetricsHandler::new(metrics.clone())));
        let events = Arc::new(dispatcher);

        let mut pool = ProxyPool::new().with_events(events.clone());
        for (host, port, credentials) in self.proxies {
            pool.add_with_credentials(host, port, credentials);
        }
        let proxies = Arc::new(Mutex::new(pool));

        let cookies = CookieStore::new();
        let direct = self
            .transport
            .unwrap_or_else(|| Arc::new(DirectTransport::new()) as Arc<dyn Transport>);
        let policy = TransportPolicy::new(direct, self.challenge, proxies.clone(), cookies.clone());

        Engine {
            config: self.config,
            policy,
            proxies,
            cookies,
            cache: ResponseCache::new(self.cache_ttl.unwrap_or(DEFAULT_TTL)),
            detector: BotDetector::new().with_events(events.clone()),
            metrics,
            events,
            base_headers: default_headers(),
        }
    }
}

fn default_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        USER_AGENT,
        HeaderValue::from_static(
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
             (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
        ),
    );
    headers.insert(
        ACCEPT,
        HeaderValue::from_static(
            "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
        ),
    );
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
    headers
}

/// Resilient fetch orchestrator. Cheap to share behind an `Arc`.
pub struct Engine {
    config: EngineConfig,
    policy: TransportPolicy,
    proxies: Arc<Mutex<ProxyPool>>,
    cookies: CookieStore,
    cache: ResponseCache,
    detector: BotDetector,
    metrics: MetricsCollector,
    events: Arc<EventDispatcher>,
    base_headers: HeaderMap,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Fetch one URL with bounded retries, returning the decoded body.
    pub async fn fetch(&self, url: &str, options: FetchOptions) -> Result<FetchResult, FetchError> {
        let started = Instant::now();
        let url = Url::parse(url).map_err(|err| FetchError {
            kind: FailureKind::InvalidUrl,
            reason: err.to_string(),
            attempts: 0,
            elapsed: started.elapsed(),
            detection: None,
        })?;

        let mut headers = self.base_headers.clone();
        for (name, value) in options.headers.iter() {
            headers.insert(name.clone(), value.clone());
        }

        let descriptor = RequestDescriptor::new(url)
            .with_method(options.method.clone())
            .with_body(options.body.clone())
            .with_headers(headers)
            .with_timeout(options.timeout.unwrap_or(self.config.timeout))
            .with_proxy(options.proxy.clone());

        let key = cache_key(&descriptor.method, &descriptor.url, &descriptor.headers);
        if options.use_cache
            && let Some(mut cached) = self.cache.get::<FetchResult>(&key)
        {
            log::debug!("cache hit for {}", descriptor.url);
            cached.from_cache = true;
            return Ok(cached);
        }

        let domain = descriptor.domain().to_string();
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1u32;

        loop {
            if let Some(deadline) = options.deadline
                && started.elapsed() >= deadline
            {
                return Err(FetchError {
                    kind: FailureKind::DeadlineExceeded,
                    reason: format!("budget of {:.2}s spent", deadline.as_secs_f64()),
                    attempts: attempt - 1,
                    elapsed: started.elapsed(),
                    detection: None,
                });
            }

            self.events.dispatch(EngineEvent::PreRequest(PreRequestEvent {
                url: descriptor.url.clone(),
                method: descriptor.method.clone(),
                attempt,
                timestamp: Utc::now(),
            }));

            let (proxy_id, outcome) = self
                .policy
                .dispatch(&descriptor, options.use_challenge_transport)
                .await;

            let (kind, reason, detection) = match outcome {
                Ok(envelope) => {
                    self.events
                        .dispatch(EngineEvent::PostResponse(PostResponseEvent {
                            url: descriptor.url.clone(),
                            method: descriptor.method.clone(),
                            status: envelope.status,
                            latency: envelope.elapsed,
                            timestamp: Utc::now(),
                        }));

                    let body = normalize::decode(&envelope.body, &envelope.headers);
                    let detection =
                        self.detector
                            .analyze(&domain, envelope.status, &envelope.headers, &body);

                    if detection.is_bot
                        && detection.confidence >= self.config.bot_confidence_threshold
                    {
                        self.report_proxy(proxy_id, false);
                        return Err(FetchError {
                            kind: FailureKind::BotDetected,
                            reason: detection.reason.clone(),
                            attempts: attempt,
                            elapsed: started.elapsed(),
                            detection: Some(detection),
                        });
                    }

                    if envelope.is_success() {
                        self.report_proxy(proxy_id, true);
                        self.cookies.prune(self.config.cookie_max_age);

                        let result = FetchResult {
                            status: envelope.status,
                            body,
                            headers: envelope
                                .headers
                                .iter()
                                .filter_map(|(name, value)| {
                                    value
                                        .to_str()
                                        .ok()
                                        .map(|v| (name.as_str().to_string(), v.to_string()))
                                })
                                .collect(),
                            attempts: attempt,
                            from_cache: false,
                        };
                        if options.use_cache {
                            self.cache.put(&key, &result);
                        }
                        return Ok(result);
                    }

                    (
                        FailureKind::Http(envelope.status),
                        format!("unexpected status {}", envelope.status),
                        detection.is_bot.then_some(detection),
                    )
                }
                Err(err) => {
                    self.metrics.record_error(&domain);
                    let kind = match err {
                        TransportError::Timeout => FailureKind::Timeout,
                        TransportError::Network(_) => FailureKind::Network,
                        TransportError::ChallengeBlocked(_) => FailureKind::ChallengeBlocked,
                    };
                    (kind, err.to_string(), None)
                }
            };

            self.report_proxy(proxy_id, false);

            if !retryable(&kind) || attempt >= max_attempts {
                return Err(FetchError {
                    kind,
                    reason,
                    attempts: attempt,
                    elapsed: started.elapsed(),
                    detection,
                });
            }

            let delay = self.backoff_delay(attempt);
            self.events.dispatch(EngineEvent::Retry(RetryEvent {
                url: descriptor.url.clone(),
                attempt: attempt + 1,
                reason,
                scheduled_after: delay,
                timestamp: Utc::now(),
            }));
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Fetch a batch concurrently. Results come back in input order; one
    /// failed URL never aborts its siblings. `batch_size` overrides the
    /// engine-level bound for this call.
    pub async fn fetch_many(
        &self,
        urls: &[&str],
        options: FetchOptions,
        batch_size: Option<usize>,
    ) -> Vec<Result<FetchResult, FetchError>> {
        let bound = batch_size.unwrap_or(self.config.batch_size).max(1);
        stream::iter(urls.iter().map(|url| {
            let options = options.clone();
            async move { self.fetch(url, options).await }
        }))
        .buffered(bound)
        .collect()
        .await
    }

    fn report_proxy(&self, proxy_id: Option<u64>, success: bool) {
        let Some(id) = proxy_id else {
            return;
        };
        let mut pool = self.proxies.lock().expect("proxy pool lock poisoned");
        if success {
            pool.report_success(id);
        } else {
            pool.report_failure(id);
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        match self.config.base_delay {
            Some(base) => {
                let factor = 1u32 << (attempt - 1).min(16);
                base.checked_mul(factor).unwrap_or(base)
            }
            None => Duration::from_millis(rand::thread_rng().gen_range(1000..=3000)),
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn detection_stats(&self) -> DetectionStats {
        self.detector.stats()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.proxies
            .lock()
            .expect("proxy pool lock poisoned")
            .stats()
    }

    pub fn cookies(&self) -> &CookieStore {
        &self.cookies
    }

    pub fn has_challenge_transport(&self) -> bool {
        self.policy.has_challenge_transport()
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_statuses_are_retryable() {
        for status in TRANSIENT_STATUSES {
            assert!(retryable(&FailureKind::Http(status)), "status {status}");
        }
        assert!(retryable(&FailureKind::Network));
        assert!(retryable(&FailureKind::Timeout));

        assert!(!retryable(&FailureKind::Http(404)));
        assert!(!retryable(&FailureKind::Http(401)));
        assert!(!retryable(&FailureKind::BotDetected));
        assert!(!retryable(&FailureKind::ChallengeBlocked));
        assert!(!retryable(&FailureKind::InvalidUrl));
    }

    #[test]
    fn fixed_base_delay_doubles_per_attempt() {
        let engine = Engine::builder()
            .with_base_delay(Duration::from_millis(100))
            .build();
        assert_eq!(engine.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(engine.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(engine.backoff_delay(3), Duration::from_millis(400));
    }

    #[test]
    fn unconfigured_delay_stays_in_window() {
        let engine = Engine::builder().build();
        for attempt in 1..=5 {
            let delay = engine.backoff_delay(attempt);
            assert!(delay >= Duration::from_millis(1000));
            assert!(delay <= Duration::from_millis(3000));
        }
    }

    #[tokio::test]
    async fn invalid_url_fails_without_attempts() {
        let engine = Engine::builder().build();
        let err = engine
            .fetch("not a url", FetchOptions::default())
            .await
            .expect_err("parse should fail");
        assert_eq!(err.kind, FailureKind::InvalidUrl);
        assert_eq!(err.attempts, 0);
    }
}
