//! Optional cache of successful capability responses, keyed by a digest of
//! the request. Failures are never stored.

use std::{collections::HashMap, fmt::Write as _, time::Duration};

use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::{sync::Mutex, time::Instant};
use tracing::{debug, warn};

use crate::{
    config::{BackendKind, CacheSettings},
    models::Capability,
};

/// Entries kept by the in-memory store before expired ones are swept.
pub const DEFAULT_MEMORY_ENTRIES: usize = 1_024;

/// What a cache hit replays: the rendered payload and who produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub backend: BackendKind,
    pub payload: Value,
}

pub struct ResponseCache {
    store: CacheStore,
    ttl: Duration,
}

enum CacheStore {
    Disabled,
    Memory {
        entries: Mutex<HashMap<String, MemoryEntry>>,
        max_entries: usize,
    },
    Redis { client: redis::Client, prefix: String },
}

struct MemoryEntry {
    value: CachedResponse,
    expires_at: Instant,
}

impl ResponseCache {
    pub fn disabled() -> Self {
        Self {
            store: CacheStore::Disabled,
            ttl: Duration::ZERO,
        }
    }

    pub fn memory(ttl: Duration) -> Self {
        Self::memory_bounded(ttl, DEFAULT_MEMORY_ENTRIES)
    }

    /// In-memory store holding at most `max_entries` responses.
    pub fn memory_bounded(ttl: Duration, max_entries: usize) -> Self {
        Self {
            store: CacheStore::Memory {
                entries: Mutex::new(HashMap::new()),
                max_entries: max_entries.max(1),
            },
            ttl,
        }
    }

    /// Redis when a URL is configured, memory when only caching is enabled.
    /// An unusable Redis URL degrades to the in-memory store.
    pub fn from_settings(settings: &CacheSettings) -> Self {
        if !settings.enabled {
            return Self::disabled();
        }
        let Some(url) = settings.redis_url.as_deref() else {
            return Self::memory(settings.ttl);
        };
        match redis::Client::open(url) {
            Ok(client) => Self {
                store: CacheStore::Redis {
                    client,
                    prefix: settings.prefix.clone(),
                },
                ttl: settings.ttl,
            },
            Err(error) => {
                warn!(error = %error, "invalid redis url, falling back to in-memory cache");
                Self::memory(settings.ttl)
            }
        }
    }

    pub fn enabled(&self) -> bool {
        !matches!(self.store, CacheStore::Disabled)
    }

    pub fn describe(&self) -> &'static str {
        match self.store {
            CacheStore::Disabled => "disabled",
            CacheStore::Memory { .. } => "memory",
            CacheStore::Redis { .. } => "redis",
        }
    }

    pub async fn get(&self, key: &str) -> Option<CachedResponse> {
        match &self.store {
            CacheStore::Disabled => None,
            CacheStore::Memory { entries, .. } => {
                let mut entries = entries.lock().await;
                let entry = entries.get(key)?;
                if entry.expires_at <= Instant::now() {
                    entries.remove(key);
                    return None;
                }
                Some(entry.value.clone())
            }
            CacheStore::Redis { client, prefix } => {
                let mut connection = match client.get_multiplexed_async_connection().await {
                    Ok(connection) => connection,
                    Err(error) => {
                        warn!(error = %error, "redis unavailable for cache read");
                        return None;
                    }
                };
                let payload = match connection
                    .get::<_, Option<String>>(format!("{prefix}:{key}"))
                    .await
                {
                    Ok(payload) => payload?,
                    Err(error) => {
                        warn!(error = %error, "redis cache read failed");
                        return None;
                    }
                };
                serde_json::from_str(&payload)
                    .map_err(|error| warn!(error = %error, "discarding undecodable cache entry"))
                    .ok()
            }
        }
    }

    pub async fn set(&self, key: &str, value: &CachedResponse) {
        match &self.store {
            CacheStore::Disabled => {}
            CacheStore::Memory {
                entries,
                max_entries,
            } => {
                let now = Instant::now();
                let mut entries = entries.lock().await;
                if !entries.contains_key(key) && entries.len() >= *max_entries {
                    make_room(&mut entries, *max_entries, now);
                }
                entries.insert(
                    key.to_owned(),
                    MemoryEntry {
                        value: value.clone(),
                        expires_at: now + self.ttl,
                    },
                );
            }
            CacheStore::Redis { client, prefix } => {
                let payload = match serde_json::to_string(value) {
                    Ok(payload) => payload,
                    Err(error) => {
                        warn!(error = %error, "cache entry could not be serialized");
                        return;
                    }
                };
                let mut connection = match client.get_multiplexed_async_connection().await {
                    Ok(connection) => connection,
                    Err(error) => {
                        warn!(error = %error, "redis unavailable for cache write");
                        return;
                    }
                };
                if let Err(error) = connection
                    .set_ex::<_, _, ()>(format!("{prefix}:{key}"), payload, self.ttl.as_secs().max(1))
                    .await
                {
                    warn!(error = %error, "redis cache write failed");
                    return;
                }
            }
        }
        debug!(key, "response cached");
    }
}

/// Drops expired entries, then the soonest to expire while still full.
fn make_room(entries: &mut HashMap<String, MemoryEntry>, max_entries: usize, now: Instant) {
    entries.retain(|_, entry| entry.expires_at > now);
    while entries.len() >= max_entries {
        let Some(oldest) = entries
            .iter()
            .min_by_key(|(_, entry)| entry.expires_at)
            .map(|(key, _)| key.clone())
        else {
            break;
        };
        entries.remove(&oldest);
    }
    debug!(remaining = entries.len(), "memory cache swept");
}

/// `<capability>:<sha256 of the request JSON>`. Returns `None` for requests
/// that cannot be serialized, which are then simply not cached.
pub fn cache_key<T: Serialize>(capability: Capability, request: &T) -> Option<String> {
    let body = serde_json::to_vec(request).ok()?;
    let digest = Sha256::digest(&body);
    let mut key = format!("{}:", capability.as_str());
    for byte in digest.iter() {
        let _ = write!(key, "{byte:02x}");
    }
    Some(key)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::models::RecipeSuggestionRequest;

    fn cached(payload: Value) -> CachedResponse {
        CachedResponse {
            backend: BackendKind::Local,
            payload,
        }
    }

    #[test]
    fn keys_depend_on_capability_and_request() {
        let request = RecipeSuggestionRequest::new(vec!["egg".into()]);
        let other = RecipeSuggestionRequest::new(vec!["flour".into()]);

        let key = cache_key(Capability::SuggestRecipes, &request).expect("key");
        assert!(key.starts_with("suggest_recipes:"));
        assert_eq!(Some(key.clone()), cache_key(Capability::SuggestRecipes, &request));
        assert_ne!(Some(key.clone()), cache_key(Capability::SuggestRecipes, &other));
        assert_ne!(Some(key), cache_key(Capability::Personalize, &request));
    }

    #[tokio::test]
    async fn disabled_cache_never_hits() {
        let cache = ResponseCache::disabled();
        cache.set("k", &cached(json!({"recipes": []}))).await;
        assert!(cache.get("k").await.is_none());
        assert!(!cache.enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn memory_entries_expire_after_ttl() {
        let cache = ResponseCache::memory(Duration::from_secs(60));
        let value = cached(json!({"total_results": 0}));
        cache.set("k", &value).await;

        assert_eq!(cache.get("k").await, Some(value));
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cache.get("k").await.is_none());
    }

    async fn resident(cache: &ResponseCache) -> usize {
        match &cache.store {
            CacheStore::Memory { entries, .. } => entries.lock().await.len(),
            _ => 0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_swept_when_full() {
        let cache = ResponseCache::memory_bounded(Duration::from_secs(60), 2);
        cache.set("a", &cached(json!(1))).await;
        cache.set("b", &cached(json!(2))).await;

        tokio::time::advance(Duration::from_secs(61)).await;
        cache.set("c", &cached(json!(3))).await;

        assert_eq!(resident(&cache).await, 1);
        assert!(cache.get("c").await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn full_cache_evicts_the_soonest_to_expire() {
        let cache = ResponseCache::memory_bounded(Duration::from_secs(60), 2);
        cache.set("a", &cached(json!(1))).await;
        tokio::time::advance(Duration::from_secs(1)).await;
        cache.set("b", &cached(json!(2))).await;
        cache.set("c", &cached(json!(3))).await;

        assert_eq!(resident(&cache).await, 2);
        assert!(cache.get("a").await.is_none());
        assert!(cache.get("b").await.is_some());

        cache.set("b", &cached(json!(4))).await;
        assert_eq!(resident(&cache).await, 2);
        assert_eq!(cache.get("b").await.map(|hit| hit.payload), Some(json!(4)));
    }

    #[test]
    fn settings_select_the_store() {
        let mut settings = CacheSettings::default();
        assert_eq!(ResponseCache::from_settings(&settings).describe(), "disabled");

        settings.enabled = true;
        assert_eq!(ResponseCache::from_settings(&settings).describe(), "memory");

        settings.redis_url = Some("redis://127.0.0.1:6379".to_owned());
        assert_eq!(ResponseCache::from_settings(&settings).describe(), "redis");

        settings.redis_url = Some("not a url".to_owned());
        assert_eq!(ResponseCache::from_settings(&settings).describe(), "memory");
    }
}
