//! Request metrics: global and per-domain counters with windowed latency
//! percentiles. Counters live inside one engine instance, never in
//! process-wide globals.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

const DEFAULT_WINDOW: usize = 128;
const MIN_WINDOW: usize = 16;

/// Aggregated metrics across all domains.
#[derive(Debug, Clone)]
pub struct GlobalStats {
    pub started_at: DateTime<Utc>,
    pub total_requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub retries: u64,
    pub average_latency: Option<Duration>,
    pub p95_latency: Option<Duration>,
}

/// Domain-scoped metrics snapshot.
#[derive(Debug, Clone)]
pub struct DomainStats {
    pub domain: String,
    pub total_requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub retries: u64,
    pub average_latency: Option<Duration>,
    pub p95_latency: Option<Duration>,
    pub last_status: Option<u16>,
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub global: GlobalStats,
    pub domains: Vec<DomainStats>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Counters {
    requests: u64,
    successes: u64,
    failures: u64,
    retries: u64,
}

impl Counters {
    fn count(&mut self, success: bool) {
        self.requests += 1;
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
    }
}

/// Bounded sample reservoir; oldest samples fall off the back.
#[derive(Debug)]
struct LatencyWindow {
    samples: VecDeque<Duration>,
    cap: usize,
}

impl LatencyWindow {
    fn new(cap: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(cap),
            cap,
        }
    }

    fn push(&mut self, latency: Duration) {
        if self.samples.len() == self.cap {
            self.samples.pop_front();
        }
        self.samples.push_back(latency);
    }

    fn mean(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let total: f64 = self.samples.iter().map(|d| d.as_secs_f64()).sum();
        Some(Duration::from_secs_f64(total / self.samples.len() as f64))
    }

    fn percentile(&self, p: f64) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<_> = self.samples.iter().copied().collect();
        sorted.sort_unstable();
        let rank = ((sorted.len() as f64 * p).ceil() as usize).saturating_sub(1);
        Some(sorted[rank])
    }
}

#[derive(Debug)]
struct DomainEntry {
    counts: Counters,
    latency: LatencyWindow,
    last_status: Option<u16>,
}

#[derive(Debug)]
struct Registry {
    started_at: DateTime<Utc>,
    window: usize,
    global: Counters,
    global_latency: LatencyWindow,
    domains: HashMap<String, DomainEntry>,
}

impl Registry {
    fn new(window: usize) -> Self {
        Self {
            started_at: Utc::now(),
            window,
            global: Counters::default(),
            // Wider than any single domain so the global percentile does not
            // forget quiet domains too quickly.
            global_latency: LatencyWindow::new(window * 4),
            domains: HashMap::new(),
        }
    }

    fn domain_mut(&mut self, domain: &str) -> &mut DomainEntry {
        let window = self.window;
        self.domains
            .entry(domain.to_string())
            .or_insert_with(|| DomainEntry {
                counts: Counters::default(),
                latency: LatencyWindow::new(window),
                last_status: None,
            })
    }
}

/// Thread-safe metrics collector shared by the orchestration layer.
#[derive(Clone, Debug)]
pub struct MetricsCollector {
    registry: Arc<Mutex<Registry>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::with_window(DEFAULT_WINDOW)
    }

    pub fn with_window(window: usize) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::new(window.max(MIN_WINDOW)))),
        }
    }

    /// Record one completed transport attempt. Redirect-range statuses count
    /// as successes; the retry loop above decides what to do with them.
    pub fn record_response(&self, domain: &str, status: u16, latency: Duration) {
        let success = (200..400).contains(&status);
        let mut registry = self.registry.lock().expect("metrics lock poisoned");
        registry.global.count(success);
        registry.global_latency.push(latency);

        let entry = registry.domain_mut(domain);
        entry.counts.count(success);
        entry.latency.push(latency);
        entry.last_status = Some(status);
    }

    /// Record an attempt that produced no response at all.
    pub fn record_error(&self, domain: &str) {
        let mut registry = self.registry.lock().expect("metrics lock poisoned");
        registry.global.count(false);
        let entry = registry.domain_mut(domain);
        entry.counts.count(false);
        entry.last_status = None;
    }

    pub fn record_retry(&self, domain: &str) {
        let mut registry = self.registry.lock().expect("metrics lock poisoned");
        registry.global.retries += 1;
        registry.domain_mut(domain).counts.retries += 1;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let registry = self.registry.lock().expect("metrics lock poisoned");
        let domains = registry
            .domains
            .iter()
            .map(|(domain, entry)| DomainStats {
                domain: domain.clone(),
                total_requests: entry.counts.requests,
                successes: entry.counts.successes,
                failures: entry.counts.failures,
                retries: entry.counts.retries,
                average_latency: entry.latency.mean(),
                p95_latency: entry.latency.percentile(0.95),
                last_status: entry.last_status,
            })
            .collect();

        MetricsSnapshot {
            global: GlobalStats {
                started_at: registry.started_at,
                total_requests: registry.global.requests,
                successes: registry.global.successes,
                failures: registry.global.failures,
                retries: registry.global.retries,
                average_latency: registry.global_latency.mean(),
                p95_latency: registry.global_latency.percentile(0.95),
            },
            domains,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
