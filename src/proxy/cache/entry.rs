use bytes::Bytes;

use super::CacheKey;
use super::chunk::{EntryBody, EntryChunk};
use super::directory::EntryHandle;

/// Response metadata parsed from the upstream head before the body streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseMeta {
    pub status_code: u16,
    pub status_text: String,
    pub content_type: Option<String>,
    /// Full size in bytes when known up front (head plus Content-Length).
    /// `None` for chunked or read-until-close responses.
    pub total_size: Option<u64>,
}

impl ResponseMeta {
    pub fn new(status_code: u16, status_text: impl Into<String>) -> Self {
        Self {
            status_code,
            status_text: status_text.into(),
            content_type: None,
            total_size: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_total_size(mut self, total_size: u64) -> Self {
        self.total_size = Some(total_size);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum FillState {
    Filling,
    Complete,
}

#[derive(Debug)]
pub(super) struct CacheEntry {
    pub key: CacheKey,
    pub status_code: u16,
    pub status_text: String,
    pub content_type: Option<String>,
    pub body: EntryBody,
    pub recency: u64,
    pub state: FillState,
    pub prev: Option<EntryHandle>,
    pub next: Option<EntryHandle>,
}

impl CacheEntry {
    pub(super) fn new(
        key: CacheKey,
        meta: ResponseMeta,
        body: EntryBody,
        recency: u64,
        prev: Option<EntryHandle>,
    ) -> Self {
        Self {
            key,
            status_code: meta.status_code,
            status_text: meta.status_text,
            content_type: meta.content_type,
            body,
            recency,
            state: FillState::Filling,
            prev,
            next: None,
        }
    }

    pub(super) fn total_size(&self) -> u64 {
        self.body.total_size()
    }

    pub(super) fn is_complete(&self) -> bool {
        self.state == FillState::Complete
    }

    pub(super) fn push_chunk(&mut self, chunk: EntryChunk) -> Result<(), super::CacheError> {
        self.body.push(chunk)
    }

    pub(super) fn to_cached(&self) -> CachedResponse {
        CachedResponse {
            status_code: self.status_code,
            status_text: self.status_text.clone(),
            content_type: self.content_type.clone(),
            total_size: self.total_size(),
            chunks: self.body.snapshot(),
        }
    }
}

/// Copy of a cache hit taken under the cache lock, safe to stream after the
/// lock is released even if the entry is evicted meanwhile.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status_code: u16,
    pub status_text: String,
    pub content_type: Option<String>,
    pub total_size: u64,
    pub chunks: Vec<Bytes>,
}

impl CachedResponse {
    /// Concatenates the stored chunks. Mostly useful in tests; the proxy
    /// writes chunks one by one.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_size as usize);
        for chunk in &self.chunks {
            out.extend_from_slice(chunk);
        }
        out
    }
}
