//! In-memory TTL caches
//!
//! Soft caches for remote actor documents and capability check results.
//! Both are read-mostly and safely shared across concurrent delivery
//! workers; concurrent refreshes of the same key are last-writer-wins,
//! which the staleness tolerance of both caches already allows.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

// =============================================================================
// Remote actor cache
// =============================================================================

/// A resolved remote endpoint
///
/// Both `inbox_url` and `public_key_pem` are required before any delivery
/// or verification may use the entry; resolution fails when either is
/// missing from the remote actor document.
#[derive(Debug, Clone)]
pub struct RemoteActor {
    /// Canonical actor URL (cache key)
    pub actor_url: String,
    /// Inbox endpoint for delivery
    pub inbox_url: String,
    /// RSA public key (PEM) for signature verification
    pub public_key_pem: String,
    /// When this entry was fetched
    pub fetched_at: Instant,
}

#[derive(Debug, Clone)]
struct CachedActor {
    actor: RemoteActor,
    ttl: Duration,
}

impl CachedActor {
    fn is_valid(&self) -> bool {
        self.actor.fetched_at.elapsed() < self.ttl
    }
}

/// Remote actor cache
///
/// Thread-safe cache keyed by actor URL. Entries are refreshed lazily on
/// TTL expiry, and invalidated out-of-band on signature verification
/// mismatch (possible key rotation).
pub struct RemoteActorCache {
    cache: Arc<RwLock<HashMap<String, CachedActor>>>,
    default_ttl: Duration,
}

impl RemoteActorCache {
    /// Create new actor cache
    ///
    /// # Arguments
    /// * `default_ttl` - TTL for cached entries (default: 1 hour)
    pub fn new(default_ttl: Option<Duration>) -> Self {
        Self {
            cache: Arc::new(RwLock::new(HashMap::new())),
            default_ttl: default_ttl.unwrap_or(Duration::from_secs(3600)),
        }
    }

    /// Get a cached actor if present and within TTL
    pub async fn get(&self, actor_url: &str) -> Option<RemoteActor> {
        use crate::metrics::{CACHE_HITS_TOTAL, CACHE_MISSES_TOTAL};

        let cache = self.cache.read().await;
        match cache.get(actor_url) {
            Some(cached) if cached.is_valid() => {
                CACHE_HITS_TOTAL.with_label_values(&["remote_actor"]).inc();
                Some(cached.actor.clone())
            }
            _ => {
                CACHE_MISSES_TOTAL
                    .with_label_values(&["remote_actor"])
                    .inc();
                None
            }
        }
    }

    /// Insert or replace an entry
    pub async fn insert(&self, actor: RemoteActor) {
        let mut cache = self.cache.write().await;
        cache.insert(
            actor.actor_url.clone(),
            CachedActor {
                actor,
                ttl: self.default_ttl,
            },
        );

        use crate::metrics::CACHE_SIZE;
        CACHE_SIZE
            .with_label_values(&["remote_actor"])
            .set(cache.len() as i64);
    }

    /// Invalidate a cached actor
    ///
    /// Used on verification mismatch before the single forced re-fetch.
    pub async fn invalidate(&self, actor_url: &str) {
        let mut cache = self.cache.write().await;
        cache.remove(actor_url);
        tracing::debug!(actor_url = %actor_url, "Invalidated remote actor cache entry");
    }

    /// Prune expired entries
    ///
    /// Should be called periodically to clean up expired entries.
    pub async fn prune_expired(&self) {
        let mut cache = self.cache.write().await;
        let before = cache.len();
        cache.retain(|_, entry| entry.is_valid());
        let removed = before - cache.len();

        if removed > 0 {
            tracing::info!(removed, "Pruned expired remote actor cache entries");
        }
    }

    /// Get cache statistics
    pub async fn stats(&self) -> CacheStats {
        let cache = self.cache.read().await;
        let total = cache.len();
        let valid = cache.values().filter(|entry| entry.is_valid()).count();

        CacheStats {
            total_entries: total,
            valid_entries: valid,
            expired_entries: total - valid,
        }
    }
}

// =============================================================================
// Capability cache
// =============================================================================

#[derive(Debug, Clone)]
struct CachedCapability {
    supported: bool,
    checked_at: Instant,
    ttl: Duration,
}

impl CachedCapability {
    fn is_valid(&self) -> bool {
        self.checked_at.elapsed() < self.ttl
    }
}

/// Capability check result cache
///
/// Keyed by `(domain, capability)`. This is a soft cache: a stale
/// "unsupported" result only downgrades optional transports, it never
/// blocks delivery of mandatory activities.
pub struct CapabilityCache {
    cache: Arc<RwLock<HashMap<(String, String), CachedCapability>>>,
    default_ttl: Duration,
}

impl CapabilityCache {
    /// Create new capability cache
    ///
    /// # Arguments
    /// * `default_ttl` - TTL for cached results (default: 1 hour)
    pub fn new(default_ttl: Option<Duration>) -> Self {
        Self {
            cache: Arc::new(RwLock::new(HashMap::new())),
            default_ttl: default_ttl.unwrap_or(Duration::from_secs(3600)),
        }
    }

    /// Get a cached result if present and within TTL
    pub async fn get(&self, domain: &str, capability: &str) -> Option<bool> {
        use crate::metrics::{CACHE_HITS_TOTAL, CACHE_MISSES_TOTAL};

        let cache = self.cache.read().await;
        match cache.get(&(domain.to_string(), capability.to_string())) {
            Some(cached) if cached.is_valid() => {
                CACHE_HITS_TOTAL.with_label_values(&["capability"]).inc();
                Some(cached.supported)
            }
            _ => {
                CACHE_MISSES_TOTAL.with_label_values(&["capability"]).inc();
                None
            }
        }
    }

    /// Store a check result
    pub async fn insert(&self, domain: &str, capability: &str, supported: bool) {
        let mut cache = self.cache.write().await;
        cache.insert(
            (domain.to_string(), capability.to_string()),
            CachedCapability {
                supported,
                checked_at: Instant::now(),
                ttl: self.default_ttl,
            },
        );

        use crate::metrics::CACHE_SIZE;
        CACHE_SIZE
            .with_label_values(&["capability"])
            .set(cache.len() as i64);
    }

    /// Prune expired entries
    pub async fn prune_expired(&self) {
        let mut cache = self.cache.write().await;
        let before = cache.len();
        cache.retain(|_, entry| entry.is_valid());
        let removed = before - cache.len();

        if removed > 0 {
            tracing::info!(removed, "Pruned expired capability cache entries");
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone)]
pub struct CacheStats {
    /// Total number of entries
    pub total_entries: usize,
    /// Number of valid (non-expired) entries
    pub valid_entries: usize,
    /// Number of expired entries
    pub expired_entries: usize,
}
