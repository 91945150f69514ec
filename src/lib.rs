//! # metafetch
//!
//! A resilient web-scraping engine with bounded retries, failure-aware proxy
//! rotation, anti-bot heuristics, per-domain cookies, and a TTL response
//! cache, composed behind one async fetch interface.
//!
//! ## Features
//!
//! - Pluggable transports: a direct reqwest client plus an optional
//!   challenge-capable strategy
//! - Bounded retry with exponential or randomized backoff
//! - Heuristic bot-block scoring over status, body phrases, and headers
//! - Round-robin proxy rotation with failure tracking and self-healing
//! - Per-domain cookie accumulation with age-based pruning
//! - TTL response cache keyed by method, URL, and content-negotiation headers
//! - Charset-aware decoding, markup sanitization, and text extraction
//!
//! ## Example
//!
//! ```no_run
//! use metafetch::{Engine, FetchOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = Engine::builder()
//!         .with_proxy("10.0.0.1", 8080)
//!         .build();
//!     let page = engine
//!         .fetch("https://example.com", FetchOptions::default())
//!         .await?;
//!     println!("{}", metafetch::normalize::text_content(&page.body));
//!     Ok(())
//! }
//! ```

mod engine;

pub mod modules;
pub mod transport;

pub use crate::engine::{
    Engine,
    EngineBuilder,
    FailureKind,
    FetchError,
    FetchOptions,
    FetchResult,
    retryable,
    DEFAULT_BATCH_SIZE,
    DEFAULT_BOT_CONFIDENCE_THRESHOLD,
    DEFAULT_MAX_ATTEMPTS,
    TRANSIENT_STATUSES,
};

pub use crate::modules::cache::ResponseCache;
pub use crate::modules::cookies::{CookieEntry, CookieStore};
pub use crate::modules::detection::{
    recommend,
    BotDetector,
    DetectionResult,
    DetectionStats,
    Signal,
};
pub use crate::modules::events::{EngineEvent, EventDispatcher, EventHandler};
pub use crate::modules::metrics::{DomainStats, GlobalStats, MetricsSnapshot};
pub use crate::modules::normalize;
pub use crate::modules::proxy::{PoolStats, ProxyPool, ProxyRecord};
pub use crate::transport::{
    DirectTransport,
    ProxySelection,
    RequestDescriptor,
    ResponseEnvelope,
    Transport,
    TransportError,
    DEFAULT_TIMEOUT,
};

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
