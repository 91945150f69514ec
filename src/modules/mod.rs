//! Internal collaborator modules composed by the engine.
//!
//! Each module stands alone and is unit-tested in isolation; the engine owns
//! one instance of each and wires them together per fetch.

pub mod cache;
pub mod cookies;
pub mod detection;
pub mod events;
pub mod metrics;
pub mod normalize;
pub mod proxy;

// Re-export commonly used types
pub use cache::{cache_key, ResponseCache};
pub use cookies::{CookieEntry, CookieStore};
pub use detection::{recommend, BotDetector, DetectionResult, DetectionStats, Signal};
pub use events::{
    BotDetectedEvent, EngineEvent, EventDispatcher, EventHandler, LoggingHandler, MetricsHandler,
    PostResponseEvent, PreRequestEvent, ProxyFailedEvent, RetryEvent,
};
pub use metrics::{DomainStats, GlobalStats, MetricsCollector, MetricsSnapshot};
pub use proxy::{PoolStats, ProxyPool, ProxyRecord};
