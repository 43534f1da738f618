//! Read-through fence cache for payload enrichment.
//!
//! Keyed by fence id with a TTL (default 1 hour). There is no active
//! invalidation on fence edits; an edit becomes visible once the entry
//! expires. That bounded staleness is acceptable for enrichment. It is not
//! acceptable for containment checks, which always read live geometry from
//! the store and never touch this cache.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;

use crate::fence::GeofenceArea;
use crate::store::{SqliteStore, StoreError};

/// Upper bound on cached fences; far beyond any realistic fence count.
const MAX_CACHED_FENCES: u64 = 10_000;

/// TTL read-through cache over [`SqliteStore::fence_by_id`].
pub struct FenceCache {
    cache: Cache<i64, GeofenceArea>,
    store: Arc<SqliteStore>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl FenceCache {
    /// Creates a cache reading through to `store` with the given TTL.
    pub fn new(store: Arc<SqliteStore>, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(MAX_CACHED_FENCES)
            .time_to_live(ttl)
            .build();
        Self {
            cache,
            store,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Fetches fence details, reading through to the store on miss.
    ///
    /// A miss that the store cannot answer propagates the store error; the
    /// cache never fabricates entries. An unknown fence id yields
    /// `Ok(None)` and is not negatively cached.
    pub async fn get(&self, fence_id: i64) -> Result<Option<GeofenceArea>, StoreError> {
        if let Some(fence) = self.cache.get(&fence_id).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(fence));
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        match self.store.fence_by_id(fence_id)? {
            Some(fence) => {
                self.cache.insert(fence_id, fence.clone()).await;
                Ok(Some(fence))
            }
            None => Ok(None),
        }
    }

    /// Cache hits since creation.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Cache misses since creation.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for FenceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FenceCache")
            .field("entries", &self.cache.entry_count())
            .field("hits", &self.hits())
            .field("misses", &self.misses())
            .finish()
    }
}
