//! Event system for engine lifecycle notifications.
//!
//! Provides hooks for metrics, logging, and custom reactions around fetch
//! activity.

use chrono::{DateTime, Utc};
use http::Method;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use super::metrics::MetricsCollector;

/// Structured pre-request event.
#[derive(Debug, Clone)]
pub struct PreRequestEvent {
    pub url: Url,
    pub method: Method,
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
}

/// Structured post-response event.
#[derive(Debug, Clone)]
pub struct PostResponseEvent {
    pub url: Url,
    pub method: Method,
    pub status: u16,
    pub latency: Duration,
    pub timestamp: DateTime<Utc>,
}

/// Emitted when the heuristic engine flags a response as bot-blocked.
#[derive(Debug, Clone)]
pub struct BotDetectedEvent {
    pub domain: String,
    pub reason: String,
    pub confidence: f32,
    pub status: u16,
    pub timestamp: DateTime<Utc>,
}

/// Emitted when a proxy crosses the consecutive-failure threshold.
#[derive(Debug, Clone)]
pub struct ProxyFailedEvent {
    pub id: u64,
    pub endpoint: String,
    pub consecutive_failures: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RetryEvent {
    pub url: Url,
    pub attempt: u32,
    pub reason: String,
    pub scheduled_after: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum EngineEvent {
    PreRequest(PreRequestEvent),
    PostResponse(PostResponseEvent),
    BotDetected(BotDetectedEvent),
    ProxyFailed(ProxyFailedEvent),
    Retry(RetryEvent),
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &EngineEvent);
}

/// Dispatcher that broadcasts events to registered handlers.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn dispatch(&self, event: EngineEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &EngineEvent) {
        match event {
            EngineEvent::PreRequest(pre) => {
                log::debug!("-> {} {} (attempt {})", pre.method, pre.url, pre.attempt);
            }
            EngineEvent::PostResponse(post) => {
                log::debug!(
                    "<- {} {} -> {} ({:.2}s)",
                    post.method,
                    post.url,
                    post.status,
                    post.latency.as_secs_f64()
                );
            }
            EngineEvent::BotDetected(detected) => {
                log::warn!(
                    "bot block on {} (status {}, confidence {:.2}): {}",
                    detected.domain,
                    detected.status,
                    detected.confidence,
                    detected.reason
                );
            }
            EngineEvent::ProxyFailed(failed) => {
                log::warn!(
                    "proxy {} failed {} times in a row",
                    failed.endpoint,
                    failed.consecutive_failures
                );
            }
            EngineEvent::Retry(retry) => {
                log::info!(
                    "retry {} attempt {} after {:.2}s ({})",
                    retry.url,
                    retry.attempt,
                    retry.scheduled_after.as_secs_f64(),
                    retry.reason
                );
            }
        }
    }
}

/// Metrics handler that feeds the metrics collector.
#[derive(Clone, Debug)]
pub struct MetricsHandler {
    metrics: MetricsCollector,
}

impl MetricsHandler {
    pub fn new(metrics: MetricsCollector) -> Self {
        Self { metrics }
    }
}

impl EventHandler for MetricsHandler {
    fn handle(&self, event: &EngineEvent) {
        match event {
            EngineEvent::PostResponse(post) => {
                self.metrics.record_response(
                    post.url.host_str().unwrap_or(""),
                    post.status,
                    post.latency,
                );
            }
            EngineEvent::Retry(retry) => {
                self.metrics
                    .record_retry(retry.url.host_str().unwrap_or(""));
            }
            _ => {}
        }
    }
}
