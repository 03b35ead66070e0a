use thiserror::Error;

/// Failures raised by the in-memory cache engine.
///
/// None of these are fatal to the client-facing response: callers abandon the
/// cache write and keep streaming from upstream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("failed to allocate {bytes} bytes for cache storage")]
    Allocation { bytes: usize },
    #[error("response of {size} bytes can never fit in a cache of {capacity} bytes")]
    Oversized { size: u64, capacity: u64 },
    #[error("cache emptied after freeing {freed} bytes without room for {needed} bytes")]
    EvictionExhausted { needed: u64, freed: u64 },
    #[error("cache key {field} is {len} bytes, limit is {max}")]
    MalformedKey {
        field: &'static str,
        len: usize,
        max: usize,
    },
    #[error("cache entry was removed while still referenced")]
    StaleHandle,
}

impl CacheError {
    /// Short label used for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            CacheError::Allocation { .. } => "allocation",
            CacheError::Oversized { .. } => "oversized",
            CacheError::EvictionExhausted { .. } => "eviction_exhausted",
            CacheError::MalformedKey { .. } => "malformed_key",
            CacheError::StaleHandle => "stale_handle",
        }
    }
}
