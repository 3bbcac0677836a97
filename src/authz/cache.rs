use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use crate::errors::AppError;

use super::resolver::PermissionResolver;

pub type PermissionSet = Arc<HashSet<String>>;

#[derive(Clone)]
struct CachedEntry {
    permissions: PermissionSet,
    fetched_at: Instant,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Total cached weight (sum of permission-set sizes), not entry count.
    pub max_weight: u64,
    /// Freshness window; a stale entry is served once while a background
    /// refresh runs.
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_weight: 4096,
            ttl: Duration::from_secs(300),
        }
    }
}

impl CacheConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let defaults = Self::default();

        let max_weight = match std::env::var("AUTHZ_CACHE_WEIGHT") {
            Ok(raw) => raw
                .parse::<u64>()
                .map_err(|_| AppError::configuration("AUTHZ_CACHE_WEIGHT must be a positive integer"))?,
            Err(_) => defaults.max_weight,
        };

        let ttl = match std::env::var("AUTHZ_CACHE_TTL_SECS") {
            Ok(raw) => Duration::from_secs(
                raw.parse::<u64>()
                    .map_err(|_| AppError::configuration("AUTHZ_CACHE_TTL_SECS must be a positive integer"))?,
            ),
            Err(_) => defaults.ttl,
        };

        Ok(Self { max_weight, ttl })
    }
}

/// Bounded, time-expiring memoization layer in front of a
/// [`PermissionResolver`].
///
/// Concurrent misses for the same key collapse into a single resolver call
/// whose outcome (value or error) is shared by every waiter. Entries past
/// the freshness window are served once while a refresh runs off the
/// request path.
pub struct PermissionCache {
    entries: moka::future::Cache<String, CachedEntry>,
    resolver: Arc<dyn PermissionResolver>,
    ttl: Duration,
}

impl PermissionCache {
    pub fn new(config: CacheConfig, resolver: Arc<dyn PermissionResolver>) -> Self {
        let entries = moka::future::CacheBuilder::new(config.max_weight)
            .weigher(|_key: &String, entry: &CachedEntry| entry.permissions.len() as u32 + 1)
            .build();

        Self {
            entries,
            resolver,
            ttl: config.ttl,
        }
    }

    fn cache_key(user_id: Uuid, organization_id: Uuid) -> String {
        format!("{}.{}", user_id, organization_id)
    }

    pub async fn get(&self, user_id: Uuid, organization_id: Uuid) -> Result<PermissionSet, AppError> {
        let key = Self::cache_key(user_id, organization_id);

        if let Some(entry) = self.entries.get(&key).await {
            if entry.fetched_at.elapsed() < self.ttl {
                return Ok(entry.permissions);
            }

            // Stale: serve the old set one last time and refresh off the
            // request path. Dropping the entry first makes later readers
            // join the in-flight refresh instead of re-reading stale data.
            self.entries.invalidate(&key).await;
            self.spawn_refresh(key, user_id, organization_id);
            return Ok(entry.permissions);
        }

        self.entries
            .try_get_with(key, Self::load(Arc::clone(&self.resolver), user_id, organization_id))
            .await
            .map(|entry| entry.permissions)
            .map_err(shared_error)
    }

    /// Drops the cached entry for one (user, organization) pair. Called by
    /// membership mutations so permission changes take effect immediately
    /// instead of after the freshness window.
    pub async fn invalidate(&self, user_id: Uuid, organization_id: Uuid) {
        self.entries
            .invalidate(&Self::cache_key(user_id, organization_id))
            .await;
    }

    fn spawn_refresh(&self, key: String, user_id: Uuid, organization_id: Uuid) {
        let entries = self.entries.clone();
        let resolver = Arc::clone(&self.resolver);

        tokio::spawn(async move {
            // A failed refresh caches nothing; the stale value already served
            // is not retracted and the next access resolves fresh.
            let outcome = entries
                .try_get_with(key, Self::load(resolver, user_id, organization_id))
                .await;

            if let Err(err) = outcome {
                tracing::warn!(
                    user_id = %user_id,
                    organization_id = %organization_id,
                    error = %err,
                    "background permission refresh failed"
                );
            }
        });
    }

    async fn load(
        resolver: Arc<dyn PermissionResolver>,
        user_id: Uuid,
        organization_id: Uuid,
    ) -> Result<CachedEntry, AppError> {
        let permissions = resolver.resolve(user_id, organization_id).await?;
        Ok(CachedEntry {
            permissions: Arc::new(permissions),
            fetched_at: Instant::now(),
        })
    }
}

fn shared_error(err: Arc<AppError>) -> AppError {
    AppError::internal(format!("permission resolution failed: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts resolutions; fails the first `failures` calls, then returns a
    /// set tagged with the call number.
    struct CountingResolver {
        calls: AtomicUsize,
        failures: AtomicUsize,
    }

    impl CountingResolver {
        fn new(failures: usize) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                failures: AtomicUsize::new(failures),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PermissionResolver for CountingResolver {
        async fn resolve(&self, _user_id: Uuid, _organization_id: Uuid) -> Result<HashSet<String>, AppError> {
            // Give concurrent callers a chance to pile up on the same key.
            tokio::task::yield_now().await;

            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(AppError::internal("store offline"));
            }

            Ok(HashSet::from(["read:packages".to_string(), format!("generation:{call}")]))
        }
    }

    fn cache_with(resolver: Arc<CountingResolver>, ttl: Duration) -> PermissionCache {
        PermissionCache::new(
            CacheConfig {
                max_weight: 1024,
                ttl,
            },
            resolver,
        )
    }

    #[tokio::test]
    async fn concurrent_misses_collapse_into_one_resolution() {
        let resolver = Arc::new(CountingResolver::new(0));
        let cache = cache_with(Arc::clone(&resolver), Duration::from_secs(300));
        let (user, org) = (Uuid::new_v4(), Uuid::new_v4());

        let (a, b, c) = tokio::join!(cache.get(user, org), cache.get(user, org), cache.get(user, org));

        assert_eq!(resolver.calls(), 1);
        let a = a.unwrap();
        assert_eq!(*a, *b.unwrap());
        assert_eq!(*a, *c.unwrap());
    }

    #[tokio::test]
    async fn fresh_entry_served_without_resolution() {
        let resolver = Arc::new(CountingResolver::new(0));
        let cache = cache_with(Arc::clone(&resolver), Duration::from_secs(300));
        let (user, org) = (Uuid::new_v4(), Uuid::new_v4());

        cache.get(user, org).await.unwrap();
        cache.get(user, org).await.unwrap();

        assert_eq!(resolver.calls(), 1);
    }

    #[tokio::test]
    async fn resolver_error_reaches_all_waiters_and_caches_nothing() {
        let resolver = Arc::new(CountingResolver::new(1));
        let cache = cache_with(Arc::clone(&resolver), Duration::from_secs(300));
        let (user, org) = (Uuid::new_v4(), Uuid::new_v4());

        let (a, b) = tokio::join!(cache.get(user, org), cache.get(user, org));
        assert!(a.is_err());
        assert!(b.is_err());
        assert_eq!(resolver.calls(), 1);

        // Nothing was cached, so the next access resolves again and succeeds.
        let third = cache.get(user, org).await.unwrap();
        assert!(third.contains("generation:2"));
        assert_eq!(resolver.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_entry_served_once_while_background_refresh_runs() {
        let resolver = Arc::new(CountingResolver::new(0));
        let cache = cache_with(Arc::clone(&resolver), Duration::from_secs(300));
        let (user, org) = (Uuid::new_v4(), Uuid::new_v4());

        let first = cache.get(user, org).await.unwrap();
        assert!(first.contains("generation:1"));

        tokio::time::advance(Duration::from_secs(301)).await;

        // Stale read: old value comes back immediately, refresh is spawned.
        let stale = cache.get(user, org).await.unwrap();
        assert!(stale.contains("generation:1"));

        // Let the background refresh task run to completion.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        let fresh = cache.get(user, org).await.unwrap();
        assert!(fresh.contains("generation:2"));
        assert_eq!(resolver.calls(), 2);
    }

    #[tokio::test]
    async fn invalidate_forces_fresh_resolution() {
        let resolver = Arc::new(CountingResolver::new(0));
        let cache = cache_with(Arc::clone(&resolver), Duration::from_secs(300));
        let (user, org) = (Uuid::new_v4(), Uuid::new_v4());

        cache.get(user, org).await.unwrap();
        cache.invalidate(user, org).await;
        let second = cache.get(user, org).await.unwrap();

        assert!(second.contains("generation:2"));
        assert_eq!(resolver.calls(), 2);
    }

    #[tokio::test]
    async fn total_weight_stays_bounded() {
        let resolver = Arc::new(CountingResolver::new(0));
        let cache = PermissionCache::new(
            CacheConfig {
                max_weight: 16,
                ttl: Duration::from_secs(300),
            },
            Arc::clone(&resolver) as Arc<dyn PermissionResolver>,
        );

        for _ in 0..64 {
            cache.get(Uuid::new_v4(), Uuid::new_v4()).await.unwrap();
        }

        cache.entries.run_pending_tasks().await;
        assert!(cache.entries.weighted_size() <= 16);
    }
}
