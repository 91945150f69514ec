//! Per-domain cookie accumulation with expiry pruning.
//!
//! Entries are keyed by (domain, name); later writes for the same key
//! replace the value in place and refresh the creation timestamp, so
//! insertion order stays deterministic. No persistence; the store is rebuilt
//! on process restart.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Default maximum cookie age before pruning (30 days).
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(30 * 24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieEntry {
    pub domain: String,
    pub name: String,
    pub value: String,
    pub created_at: DateTime<Utc>,
}

/// Thread-safe cookie store, cheap to clone (shared interior).
#[derive(Clone, Debug, Default)]
pub struct CookieStore {
    inner: Arc<RwLock<HashMap<String, Vec<CookieEntry>>>>,
}

impl CookieStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a comma/semicolon-delimited `name=value` list and write each
    /// pair under the domain. Existing names are overwritten in place.
    pub fn record(&self, domain: &str, raw: &str) {
        let mut guard = self.inner.write().expect("cookie store lock poisoned");
        let entries = guard.entry(domain.to_string()).or_default();

        for item in raw.split([',', ';']) {
            let Some((name, value)) = item.split_once('=') else {
                continue;
            };
            let name = name.trim();
            let value = value.trim();
            if name.is_empty() {
                continue;
            }

            let now = Utc::now();
            if let Some(existing) = entries.iter_mut().find(|e| e.name == name) {
                existing.value = value.to_string();
                existing.created_at = now;
            } else {
                entries.push(CookieEntry {
                    domain: domain.to_string(),
                    name: name.to_string(),
                    value: value.to_string(),
                    created_at: now,
                });
            }
        }
    }

    /// All non-expired entries for an exact domain match, in insertion order.
    pub fn for_domain(&self, domain: &str) -> Vec<CookieEntry> {
        self.for_domain_with_max_age(domain, DEFAULT_MAX_AGE)
    }

    pub fn for_domain_with_max_age(&self, domain: &str, max_age: Duration) -> Vec<CookieEntry> {
        let guard = self.inner.read().expect("cookie store lock poisoned");
        let cutoff = age_cutoff(max_age);
        guard
            .get(domain)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| e.created_at > cutoff)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// `Cookie` header value for the domain, or `None` when nothing is stored.
    pub fn header_for(&self, domain: &str) -> Option<String> {
        let entries = self.for_domain(domain);
        if entries.is_empty() {
            return None;
        }
        Some(
            entries
                .iter()
                .map(|e| format!("{}={}", e.name, e.value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    /// Drop entries older than the threshold. Called opportunistically by
    /// the engine, not on a timer.
    pub fn prune(&self, max_age: Duration) {
        let mut guard = self.inner.write().expect("cookie store lock poisoned");
        let cutoff = age_cutoff(max_age);
        for entries in guard.values_mut() {
            entries.retain(|e| e.created_at > cutoff);
        }
        guard.retain(|_, entries| !entries.is_empty());
    }

    pub fn len(&self) -> usize {
        let guard = self.inner.read().expect("cookie store lock poisoned");
        guard.values().map(|entries| entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn age_cutoff(max_age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(max_age)
        .ok()
        .and_then(|age| Utc::now().checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
