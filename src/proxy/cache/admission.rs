use tracing::trace;

use super::CacheError;
use super::directory::CacheDirectory;

impl CacheDirectory {
    /// Whether an empty cache could ever hold `nbytes`. Ignores occupancy.
    pub(super) fn could_fit(&self, nbytes: u64) -> bool {
        let capacity = self.capacity_bytes();
        capacity == 0 || nbytes < capacity
    }

    /// Whether `nbytes` fit alongside what is cached right now.
    pub(super) fn can_fit(&self, nbytes: u64) -> bool {
        let capacity = self.capacity_bytes();
        capacity == 0 || self.total_bytes().saturating_add(nbytes) < capacity
    }

    /// Removes the least recently used entry, returning the bytes freed.
    pub(super) fn evict_one(&mut self) -> u64 {
        let Some(victim) = self.find_victim() else {
            return 0;
        };
        let freed = self.remove(victim);
        crate::metrics::record_cache_eviction();
        trace!(freed, "evicted least recently used cache entry");
        freed
    }

    /// Evicts LRU entries until `nbytes` fit.
    ///
    /// Fails once the directory is empty and the request still does not fit,
    /// which can only happen when `nbytes` is at or above capacity.
    pub(super) fn make_space(&mut self, nbytes: u64) -> Result<u64, CacheError> {
        let mut freed = 0u64;
        while !self.can_fit(nbytes) {
            if self.entry_count() == 0 {
                return Err(CacheError::EvictionExhausted {
                    needed: nbytes,
                    freed,
                });
            }
            freed = freed.saturating_add(self.evict_one());
        }
        Ok(freed)
    }

    /// Admission for a response of `nbytes`: the full size when known, the
    /// first chunk's size otherwise.
    pub(super) fn admit(&mut self, nbytes: u64) -> Result<u64, CacheError> {
        if !self.could_fit(nbytes) {
            return Err(CacheError::Oversized {
                size: nbytes,
                capacity: self.capacity_bytes(),
            });
        }
        if !self.can_fit(nbytes) {
            return self.make_space(nbytes);
        }
        Ok(0)
    }
}
