use tracing::{debug, trace, warn};

use super::{CacheError, CacheKey, EntryHandle, ResponseCache, ResponseMeta};

/// Why a response was not (or no longer) cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSkipReason {
    ClientSpecific,
    UncacheableStatus,
    MalformedKey,
    UnboundedResponse,
    Oversized,
    NoRoom,
    Allocation,
    Evicted,
    Incomplete,
    EmptyResponse,
}

impl CacheSkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheSkipReason::ClientSpecific => "client_specific",
            CacheSkipReason::UncacheableStatus => "uncacheable_status",
            CacheSkipReason::MalformedKey => "malformed_key",
            CacheSkipReason::UnboundedResponse => "unbounded_response",
            CacheSkipReason::Oversized => "oversized",
            CacheSkipReason::NoRoom => "no_room",
            CacheSkipReason::Allocation => "allocation",
            CacheSkipReason::Evicted => "evicted",
            CacheSkipReason::Incomplete => "incomplete",
            CacheSkipReason::EmptyResponse => "empty_response",
        }
    }

    fn from_error(err: &CacheError) -> Self {
        match err {
            CacheError::Allocation { .. } => CacheSkipReason::Allocation,
            CacheError::Oversized { .. } => CacheSkipReason::Oversized,
            CacheError::EvictionExhausted { .. } => CacheSkipReason::NoRoom,
            CacheError::MalformedKey { .. } => CacheSkipReason::MalformedKey,
            CacheError::StaleHandle => CacheSkipReason::Evicted,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStoreOutcome {
    Stored,
    Skipped(CacheSkipReason),
    RolledBack,
}

impl CacheStoreOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStoreOutcome::Stored => "stored",
            CacheStoreOutcome::Skipped(reason) => reason.as_str(),
            CacheStoreOutcome::RolledBack => "rolled_back",
        }
    }
}

/// Only complete, unconditional answers are stored.
const CACHEABLE_STATUS: u16 = 200;

enum WriterState {
    Pending { key: CacheKey, meta: ResponseMeta },
    Filling(EntryHandle),
    Done(CacheStoreOutcome),
}

/// Streams one upstream response into the cache as it is relayed.
///
/// The first non-empty push runs admission and creates the entry; later
/// pushes append. The entry is only published by [`CacheWriter::finish`].
/// Dropping an unfinished writer removes whatever was stored, so a failed or
/// cancelled transfer never leaves a truncated entry behind.
pub struct CacheWriter {
    cache: ResponseCache,
    state: WriterState,
    expected: Option<u64>,
    written: u64,
    evicted: u64,
}

impl CacheWriter {
    pub(super) fn open(cache: ResponseCache, host: &str, path: &str, meta: ResponseMeta) -> Self {
        let expected = meta.total_size;
        let state = if meta.status_code != CACHEABLE_STATUS {
            trace!(status = meta.status_code, "response status not cacheable");
            WriterState::Done(CacheStoreOutcome::Skipped(
                CacheSkipReason::UncacheableStatus,
            ))
        } else if expected.is_none() && !cache.caches_unbounded_responses() {
            WriterState::Done(CacheStoreOutcome::Skipped(
                CacheSkipReason::UnboundedResponse,
            ))
        } else {
            match CacheKey::new(host, path, cache.max_key_length()) {
                Ok(key) => WriterState::Pending { key, meta },
                Err(err) => {
                    debug!(host, error = %err, "response not cacheable");
                    WriterState::Done(CacheStoreOutcome::Skipped(CacheSkipReason::MalformedKey))
                }
            }
        };
        Self {
            cache,
            state,
            expected,
            written: 0,
            evicted: 0,
        }
    }

    /// Whether further pushes can still reach the cache.
    pub fn is_active(&self) -> bool {
        !matches!(self.state, WriterState::Done(_))
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Bytes of other entries evicted to admit this response.
    pub fn evicted_bytes(&self) -> u64 {
        self.evicted
    }

    /// Feeds the next piece of the response, exactly as relayed to the
    /// client. Cache failures end caching for this response but are never
    /// reported to the caller.
    pub fn push(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let state = std::mem::replace(
            &mut self.state,
            WriterState::Done(CacheStoreOutcome::RolledBack),
        );
        self.state = match state {
            WriterState::Pending { key, meta } => {
                match self.cache.insert_keyed(key, bytes, meta) {
                    Ok((handle, freed)) => {
                        self.written = bytes.len() as u64;
                        self.evicted = freed;
                        WriterState::Filling(handle)
                    }
                    Err(err) => {
                        if matches!(err, CacheError::Allocation { .. }) {
                            crate::metrics::record_cache_store_error();
                        }
                        debug!(error = %err, "response not admitted to cache");
                        WriterState::Done(CacheStoreOutcome::Skipped(
                            CacheSkipReason::from_error(&err),
                        ))
                    }
                }
            }
            WriterState::Filling(handle) => match self.cache.append_chunk(handle, bytes) {
                Ok(()) => {
                    self.written = self.written.saturating_add(bytes.len() as u64);
                    WriterState::Filling(handle)
                }
                Err(CacheError::StaleHandle) => {
                    trace!("cache entry evicted while filling");
                    WriterState::Done(CacheStoreOutcome::Skipped(CacheSkipReason::Evicted))
                }
                Err(err) => {
                    crate::metrics::record_cache_store_error();
                    warn!(error = %err, "cache append failed; entry rolled back");
                    WriterState::Done(CacheStoreOutcome::RolledBack)
                }
            },
            done @ WriterState::Done(_) => done,
        };
    }

    /// Publishes the entry once the response has been fully relayed.
    pub fn finish(mut self) -> CacheStoreOutcome {
        let state = std::mem::replace(
            &mut self.state,
            WriterState::Done(CacheStoreOutcome::Stored),
        );
        match state {
            WriterState::Pending { .. } => {
                CacheStoreOutcome::Skipped(CacheSkipReason::EmptyResponse)
            }
            WriterState::Done(outcome) => outcome,
            WriterState::Filling(handle) => {
                if let Some(expected) = self.expected
                    && expected != self.written
                {
                    self.cache.rollback(handle);
                    debug!(expected, written = self.written, "cached body length mismatch");
                    return CacheStoreOutcome::Skipped(CacheSkipReason::Incomplete);
                }
                match self.cache.complete(handle) {
                    Ok(superseded) => {
                        crate::metrics::record_cache_store();
                        trace!(bytes = self.written, superseded, "stored cache entry");
                        CacheStoreOutcome::Stored
                    }
                    Err(_) => CacheStoreOutcome::Skipped(CacheSkipReason::Evicted),
                }
            }
        }
    }

    /// Discards the partial entry, for transfers that ended early.
    pub fn abort(mut self) -> CacheStoreOutcome {
        let state = std::mem::replace(
            &mut self.state,
            WriterState::Done(CacheStoreOutcome::RolledBack),
        );
        match state {
            WriterState::Filling(handle) => {
                self.cache.rollback(handle);
                CacheStoreOutcome::RolledBack
            }
            WriterState::Pending { .. } => {
                CacheStoreOutcome::Skipped(CacheSkipReason::Incomplete)
            }
            WriterState::Done(outcome) => outcome,
        }
    }
}

impl Drop for CacheWriter {
    fn drop(&mut self) {
        if let WriterState::Filling(handle) = self.state {
            let freed = self.cache.rollback(handle);
            trace!(freed, "dropped unfinished cache writer");
        }
    }
}
