use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

mod admission;
mod chunk;
mod directory;
mod entry;
mod error;
mod key;
mod lru;
mod writer;

use directory::CacheDirectory;
use entry::CacheEntry;

pub use chunk::EntryChunk;
pub use directory::EntryHandle;
pub use entry::{CachedResponse, ResponseMeta};
pub use error::CacheError;
pub use key::{CacheKey, DEFAULT_MAX_KEY_LENGTH};
pub use writer::{CacheSkipReason, CacheStoreOutcome, CacheWriter};

pub const BYTES_PER_MEGABYTE: u64 = 1_048_576;

/// Shared in-memory response cache.
///
/// Clones share one directory. Every operation takes the lock for a short,
/// purely in-memory section; callers never hold it across I/O.
#[derive(Clone, Debug)]
pub struct ResponseCache {
    directory: Arc<Mutex<CacheDirectory>>,
    max_key_length: usize,
    cache_unbounded: bool,
}

/// Point-in-time view of the directory, computed by walking it in both
/// directions under the lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheAudit {
    pub entry_count: usize,
    pub total_bytes: u64,
    pub capacity_bytes: u64,
    pub forward_len: usize,
    pub backward_len: usize,
    pub summed_bytes: u64,
    pub stamps_unique: bool,
}

impl CacheAudit {
    /// Whether the aggregate counters agree with the live entries.
    pub fn is_consistent(&self) -> bool {
        self.forward_len == self.entry_count
            && self.backward_len == self.entry_count
            && self.summed_bytes == self.total_bytes
            && self.stamps_unique
    }
}

impl ResponseCache {
    /// `capacity_bytes == 0` disables the budget.
    pub fn new(capacity_bytes: u64) -> Self {
        Self {
            directory: Arc::new(Mutex::new(CacheDirectory::new(capacity_bytes))),
            max_key_length: DEFAULT_MAX_KEY_LENGTH,
            cache_unbounded: true,
        }
    }

    pub fn with_capacity_megabytes(megabytes: u64) -> Self {
        Self::new(megabytes.saturating_mul(BYTES_PER_MEGABYTE))
    }

    pub fn with_max_key_length(mut self, max_key_length: usize) -> Self {
        self.max_key_length = max_key_length;
        self
    }

    /// Whether responses without a declared length (chunked, read until
    /// close) may be cached.
    pub fn with_unbounded_responses(mut self, enabled: bool) -> Self {
        self.cache_unbounded = enabled;
        self
    }

    /// Changes the budget. Takes effect on the next admission; nothing is
    /// evicted eagerly.
    pub fn set_capacity_megabytes(&self, megabytes: u64) {
        let capacity = megabytes.saturating_mul(BYTES_PER_MEGABYTE);
        self.directory.lock().set_capacity_bytes(capacity);
        debug!(capacity_bytes = capacity, "cache capacity updated");
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.directory.lock().capacity_bytes()
    }

    pub fn max_key_length(&self) -> usize {
        self.max_key_length
    }

    pub fn caches_unbounded_responses(&self) -> bool {
        self.cache_unbounded
    }

    /// Returns a copy of the complete entry for `(host, path)`, marking it
    /// most recently used.
    pub fn lookup(&self, host: &str, path: &str) -> Option<CachedResponse> {
        let cached = {
            let mut dir = self.directory.lock();
            dir.lookup(host, path)
                .and_then(|handle| dir.entry(handle).map(CacheEntry::to_cached))
        };
        crate::metrics::record_cache_lookup(cached.is_some());
        trace!(host, path, hit = cached.is_some(), "cache lookup");
        cached
    }

    pub fn could_fit(&self, nbytes: u64) -> bool {
        self.directory.lock().could_fit(nbytes)
    }

    pub fn can_fit(&self, nbytes: u64) -> bool {
        self.directory.lock().can_fit(nbytes)
    }

    /// Runs admission for a new entry and inserts it with `first_chunk`.
    ///
    /// Admission uses `meta.total_size` when set, otherwise the size of
    /// `first_chunk`. The entry stays invisible to lookups until
    /// [`ResponseCache::complete`] is called.
    pub fn admit_and_insert(
        &self,
        host: &str,
        path: &str,
        first_chunk: &[u8],
        meta: ResponseMeta,
    ) -> Result<EntryHandle, CacheError> {
        let key = CacheKey::new(host, path, self.max_key_length)?;
        self.insert_keyed(key, first_chunk, meta)
            .map(|(handle, _)| handle)
    }

    /// Like [`ResponseCache::admit_and_insert`], also returning the bytes
    /// evicted to make room.
    pub(crate) fn insert_keyed(
        &self,
        key: CacheKey,
        first_chunk: &[u8],
        meta: ResponseMeta,
    ) -> Result<(EntryHandle, u64), CacheError> {
        let admission_size = meta.total_size.unwrap_or(first_chunk.len() as u64);
        let chunk = EntryChunk::copy_from(first_chunk)?;

        let mut dir = self.directory.lock();
        let freed = dir.admit(admission_size)?;
        let handle = dir.insert(key, chunk, meta)?;
        publish_usage(&dir);
        drop(dir);

        if freed > 0 {
            debug!(freed, admission_size, "evicted entries to admit response");
        }
        Ok((handle, freed))
    }

    /// Appends to an entry being filled.
    ///
    /// Appends bypass the budget check. Any failure other than
    /// [`CacheError::StaleHandle`] removes the whole entry before returning.
    pub fn append_chunk(&self, handle: EntryHandle, bytes: &[u8]) -> Result<(), CacheError> {
        let chunk = match EntryChunk::copy_from(bytes) {
            Ok(chunk) => chunk,
            Err(err) => {
                self.rollback(handle);
                return Err(err);
            }
        };

        let mut dir = self.directory.lock();
        match dir.append_chunk(handle, chunk) {
            Ok(_) => {
                publish_usage(&dir);
                Ok(())
            }
            Err(CacheError::StaleHandle) => Err(CacheError::StaleHandle),
            Err(err) => {
                let freed = dir.remove(handle);
                publish_usage(&dir);
                drop(dir);
                crate::metrics::record_cache_rollback();
                debug!(freed, error = %err, "rolled back cache entry after failed append");
                Err(err)
            }
        }
    }

    /// Publishes a filled entry to lookups. Returns bytes released by older
    /// entries under the same key.
    pub fn complete(&self, handle: EntryHandle) -> Result<u64, CacheError> {
        let mut dir = self.directory.lock();
        let superseded = dir.mark_complete(handle)?;
        publish_usage(&dir);
        Ok(superseded)
    }

    /// Removes a partially filled entry. Stale handles are ignored.
    pub fn rollback(&self, handle: EntryHandle) -> u64 {
        let freed = self.remove(handle);
        if freed > 0 {
            crate::metrics::record_cache_rollback();
        }
        freed
    }

    pub fn remove(&self, handle: EntryHandle) -> u64 {
        let mut dir = self.directory.lock();
        let freed = dir.remove(handle);
        publish_usage(&dir);
        freed
    }

    pub fn evict_one(&self) -> u64 {
        let mut dir = self.directory.lock();
        let freed = dir.evict_one();
        publish_usage(&dir);
        freed
    }

    pub fn make_space(&self, nbytes: u64) -> Result<u64, CacheError> {
        let mut dir = self.directory.lock();
        let result = dir.make_space(nbytes);
        publish_usage(&dir);
        result
    }

    pub fn current_size(&self) -> u64 {
        self.directory.lock().total_bytes()
    }

    pub fn entry_count(&self) -> usize {
        self.directory.lock().entry_count()
    }

    pub fn audit(&self) -> CacheAudit {
        let dir = self.directory.lock();
        let mut stamps: Vec<u64> = dir.iter().map(|(_, entry)| entry.recency).collect();
        let forward_len = stamps.len();
        stamps.sort_unstable();
        stamps.dedup();
        CacheAudit {
            entry_count: dir.entry_count(),
            total_bytes: dir.total_bytes(),
            capacity_bytes: dir.capacity_bytes(),
            forward_len,
            backward_len: dir.iter_rev().count(),
            summed_bytes: dir.iter().map(|(_, entry)| entry.total_size()).sum(),
            stamps_unique: stamps.len() == forward_len
                && stamps.last().is_none_or(|last| *last <= dir.recency_counter()),
        }
    }

    /// Starts streaming one upstream response into the cache.
    pub fn open_writer(&self, host: &str, path: &str, meta: ResponseMeta) -> CacheWriter {
        CacheWriter::open(self.clone(), host, path, meta)
    }
}

fn publish_usage(dir: &CacheDirectory) {
    crate::metrics::set_cache_usage(dir.total_bytes(), dir.entry_count());
}
