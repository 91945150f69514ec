//! Response cache with lazy TTL expiry.
//!
//! Keys are a pure function of method, URL, and a declared subset of request
//! headers, so identical logical requests collide regardless of which proxy
//! served them. Entries are checked on read and never swept proactively.
//! Payloads are serialized; anything that fails to deserialize is treated as
//! a miss, never as a fatal error.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use http::{HeaderMap, Method};
use serde::de::DeserializeOwned;
use serde::Serialize;
use url::Url;

/// Default entry lifetime.
pub const DEFAULT_TTL: Duration = Duration::from_secs(30 * 60);

/// Request headers that participate in key derivation. Everything else
/// (cookies, user-agent rotation) must not split the cache.
const KEYED_HEADERS: &[&str] = &["accept", "accept-language"];

#[derive(Debug)]
struct CacheSlot {
    payload: Vec<u8>,
    stored_at: Instant,
}

/// Key→payload store with checked-on-read expiry.
#[derive(Clone, Debug)]
pub struct ResponseCache {
    ttl: Duration,
    inner: Arc<Mutex<HashMap<String, CacheSlot>>>,
}

impl ResponseCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Stored value if present and fresh; expired or corrupt entries are
    /// deleted and reported as a miss.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let mut guard = self.inner.lock().expect("cache lock poisoned");
        let slot = guard.get(key)?;
        if slot.stored_at.elapsed() >= self.ttl {
            guard.remove(key);
            return None;
        }
        match serde_json::from_slice(&slot.payload) {
            Ok(value) => Some(value),
            Err(err) => {
                log::warn!("dropping corrupt cache entry for {key}: {err}");
                guard.remove(key);
                None
            }
        }
    }

    /// Store with a fresh timestamp, overwriting any prior entry.
    pub fn put<T: Serialize>(&self, key: &str, value: &T) {
        let Ok(payload) = serde_json::to_vec(value) else {
            return;
        };
        let mut guard = self.inner.lock().expect("cache lock poisoned");
        guard.insert(
            key.to_string(),
            CacheSlot {
                payload,
                stored_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.lock().expect("cache lock poisoned").clear();
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

/// Deterministic cache key for one logical request.
pub fn cache_key(method: &Method, url: &Url, headers: &HeaderMap) -> String {
    let mut material = format!("{} {}", method, url);
    for name in KEYED_HEADERS {
        if let Some(value) = headers.get(*name)
            && let Ok(value) = value.to_str()
        {
            material.push('\n');
            material.push_str(name);
            material.push('=');
            material.push_str(value);
        }
    }

    let mut hasher = DefaultHasher::new();
    material.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn hit_within_ttl_miss_after() {
        let cache = ResponseCache::new(Duration::from_millis(100));
        cache.put("k", &"value".to_string());

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(cache.get::<String>("k").as_deref(), Some("value"));

        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(cache.get::<String>("k"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn put_overwrites() {
        let cache = ResponseCache::default();
        cache.put("k", &1u32);
        cache.put("k", &2u32);
        assert_eq!(cache.get::<u32>("k"), Some(2));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn corrupt_payload_is_a_miss() {
        let cache = ResponseCache::default();
        cache.put("k", &"not a number".to_string());
        assert_eq!(cache.get::<u64>("k"), None);
        // The corrupt entry is gone afterwards.
        assert!(cache.is_empty());
    }

    #[test]
    fn key_is_stable_and_header_sensitive() {
        let url = Url::parse("https://example.com/item?q=1").unwrap();
        let empty = HeaderMap::new();
        let k1 = cache_key(&Method::GET, &url, &empty);
        let k2 = cache_key(&Method::GET, &url, &empty);
        assert_eq!(k1, k2);

        assert_ne!(k1, cache_key(&Method::POST, &url, &empty));

        let mut headers = HeaderMap::new();
        headers.insert("accept", HeaderValue::from_static("application/json"));
        assert_ne!(k1, cache_key(&Method::GET, &url, &headers));

        // Headers outside the declared subset do not split the cache.
        let mut noise = HeaderMap::new();
        noise.insert("user-agent", HeaderValue::from_static("probe/1.0"));
        assert_eq!(k1, cache_key(&Method::GET, &url, &noise));
    }
}
