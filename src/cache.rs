use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, warn};

/// Key-value store with per-entry expiry, shared by all request handlers.
///
/// Values are JSON text so that a networked backend can implement the same trait.
pub trait Cache: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: String, ttl: Duration);
}

pub fn get_json<T: DeserializeOwned>(cache: &dyn Cache, key: &str) -> Option<T> {
    let raw = cache.get(key)?;
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("dropping undecodable cache entry {key}: {e}");
            None
        }
    }
}

pub fn set_json<T: Serialize>(cache: &dyn Cache, key: &str, value: &T, ttl: Duration) {
    match serde_json::to_string(value) {
        Ok(raw) => cache.set(key, raw, ttl),
        Err(e) => warn!("failed to encode cache entry {key}: {e}"),
    }
}

#[derive(Default)]
pub struct MemoryCache {
    // `None` expiry means the entry outlives any representable instant
    entries: Mutex<HashMap<String, (Option<Instant>, String)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

impl Cache for MemoryCache {
    fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock();
        let expired = match entries.get(key) {
            Some((expires_at, value)) if is_live(*expires_at, Instant::now()) => {
                debug!("cache hit {key}");
                return Some(value.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            debug!("cache expired {key}");
            entries.remove(key);
        }
        None
    }

    fn set(&self, key: &str, value: String, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, (expires_at, _)| is_live(*expires_at, now));
        // last writer wins
        entries.insert(key.to_string(), (now.checked_add(ttl), value));
    }
}

fn is_live(expires_at: Option<Instant>, now: Instant) -> bool {
    expires_at.is_none_or(|expires_at| expires_at > now)
}

/// Always misses. Used when caching is disabled.
pub struct NoCache;

impl Cache for NoCache {
    fn get(&self, _key: &str) -> Option<String> {
        None
    }

    fn set(&self, _key: &str, _value: String, _ttl: Duration) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::yt_dlp::MediaInfo;

    #[test]
    fn returns_value_before_expiry() {
        let cache = MemoryCache::new();
        cache.set("k", "v".into(), Duration::from_secs(60));
        assert_eq!(cache.get("k").as_deref(), Some("v"));
        assert_eq!(cache.get("other"), None);
    }

    #[test]
    fn expired_entries_miss_and_are_purged() {
        let cache = MemoryCache::new();
        cache.set("short", "v".into(), Duration::from_millis(20));
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(cache.get("short"), None);
        assert_eq!(cache.len(), 0);

        cache.set("a", "1".into(), Duration::from_millis(20));
        std::thread::sleep(Duration::from_millis(40));
        cache.set("b", "2".into(), Duration::from_secs(60));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn last_writer_wins() {
        let cache = MemoryCache::new();
        cache.set("k", "first".into(), Duration::from_secs(60));
        cache.set("k", "second".into(), Duration::from_secs(60));
        assert_eq!(cache.get("k").as_deref(), Some("second"));
    }

    #[test]
    fn zero_ttl_is_not_stored() {
        let cache = MemoryCache::new();
        cache.set("k", "v".into(), Duration::ZERO);
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn huge_ttl_never_expires() {
        let cache = MemoryCache::new();
        cache.set("k", "v".into(), Duration::from_secs(u64::MAX));
        cache.set("other", "w".into(), Duration::MAX);
        assert_eq!(cache.get("k").as_deref(), Some("v"));
        assert_eq!(cache.get("other").as_deref(), Some("w"));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn no_cache_always_misses() {
        NoCache.set("k", "v".into(), Duration::from_secs(60));
        assert_eq!(NoCache.get("k"), None);
    }

    #[test]
    fn typed_helpers() {
        let cache = MemoryCache::new();
        let info = MediaInfo {
            id: "abc".into(),
            title: "title".into(),
            ..Default::default()
        };
        set_json(&cache, "media:abc", &info, Duration::from_secs(60));
        assert_eq!(get_json::<MediaInfo>(&cache, "media:abc"), Some(info));

        cache.set("broken", "{not json".into(), Duration::from_secs(60));
        assert_eq!(get_json::<MediaInfo>(&cache, "broken"), None);
    }
}
