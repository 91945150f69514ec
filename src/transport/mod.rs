//! Transport layer: request/response types and the pluggable strategy trait.
//!
//! A transport executes exactly one attempt. The retry loop, anti-bot
//! classification, and caching all live above this boundary in the engine.

pub mod direct;
pub mod policy;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method};
use thiserror::Error;
use url::Url;

pub use direct::DirectTransport;
pub use policy::TransportPolicy;

/// Default per-attempt timeout applied when the caller supplies none.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Proxy endpoint handed to a transport for a single attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySelection {
    pub id: u64,
    pub endpoint: String,
}

/// Immutable description of one outgoing request.
///
/// Constructed once per logical fetch; the policy layer clones and augments
/// it (cookies, proxy) rather than mutating the caller's copy.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub url: Url,
    pub method: Method,
    pub body: Option<Vec<u8>>,
    pub headers: HeaderMap,
    pub timeout: Duration,
    pub proxy: Option<ProxySelection>,
}

impl RequestDescriptor {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            method: Method::GET,
            body: None,
            headers: HeaderMap::new(),
            timeout: DEFAULT_TIMEOUT,
            proxy: None,
        }
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn with_body(mut self, body: Option<Vec<u8>>) -> Self {
        self.body = body;
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_proxy(mut self, proxy: Option<ProxySelection>) -> Self {
        self.proxy = proxy;
        self
    }

    /// Target domain derived from the URL host. Cookie partitioning and cache
    /// keys both hang off this value, never off the serving proxy.
    pub fn domain(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }
}

/// Raw result of a single transport attempt. Never mutated after creation; a
/// retry produces a fresh envelope.
#[derive(Debug, Clone)]
pub struct ResponseEnvelope {
    pub status: u16,
    pub body: Bytes,
    pub headers: HeaderMap,
    pub elapsed: Duration,
    pub proxy_id: Option<u64>,
}

impl ResponseEnvelope {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Failures a transport can produce. Non-2xx statuses are not transport
/// errors; they come back as envelopes and are classified by the engine.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out")]
    Timeout,
    #[error("challenge verification failed: {0}")]
    ChallengeBlocked(String),
}

/// Strategy interface implemented by the direct HTTP client and by any
/// externally supplied challenge-capable capability.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &RequestDescriptor) -> Result<ResponseEnvelope, TransportError>;
}
