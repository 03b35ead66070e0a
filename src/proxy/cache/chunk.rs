use bytes::Bytes;

use super::CacheError;

/// One immutable piece of a cached response, in upstream arrival order.
#[derive(Debug, Clone)]
pub struct EntryChunk {
    data: Bytes,
}

impl EntryChunk {
    /// Copies `src` into a freshly allocated buffer.
    ///
    /// The allocation is fallible so that memory pressure surfaces as
    /// [`CacheError::Allocation`] rather than aborting the process.
    pub fn copy_from(src: &[u8]) -> Result<Self, CacheError> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(src.len())
            .map_err(|_| CacheError::Allocation { bytes: src.len() })?;
        buf.extend_from_slice(src);
        Ok(Self {
            data: Bytes::from(buf),
        })
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn bytes(&self) -> &Bytes {
        &self.data
    }
}

/// Append-only chunk sequence backing one cache entry.
#[derive(Debug)]
pub(super) struct EntryBody {
    chunks: Vec<EntryChunk>,
    total_size: u64,
}

impl EntryBody {
    pub(super) fn with_first(chunk: EntryChunk) -> Result<Self, CacheError> {
        let mut body = Self {
            chunks: Vec::new(),
            total_size: 0,
        };
        body.push(chunk)?;
        Ok(body)
    }

    pub(super) fn push(&mut self, chunk: EntryChunk) -> Result<(), CacheError> {
        self.chunks
            .try_reserve(1)
            .map_err(|_| CacheError::Allocation {
                bytes: std::mem::size_of::<EntryChunk>(),
            })?;
        self.total_size = self.total_size.saturating_add(chunk.len());
        self.chunks.push(chunk);
        Ok(())
    }

    pub(super) fn total_size(&self) -> u64 {
        self.total_size
    }

    pub(super) fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub(super) fn chunks(&self) -> impl Iterator<Item = &EntryChunk> {
        self.chunks.iter()
    }

    /// Clones the chunk handles so the body can be replayed after the cache
    /// lock is released. Buffers are shared, not copied.
    pub(super) fn snapshot(&self) -> Vec<Bytes> {
        self.chunks.iter().map(|chunk| chunk.bytes().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_tracks_total_size_across_chunks() {
        let first = EntryChunk::copy_from(b"HTTP/1.1").unwrap();
        let mut body = EntryBody::with_first(first).unwrap();
        body.push(EntryChunk::copy_from(b" 200 OK\r\n").unwrap()).unwrap();
        body.push(EntryChunk::copy_from(b"").unwrap()).unwrap();

        assert_eq!(body.total_size(), 17);
        assert_eq!(body.chunk_count(), 3);
        let summed: u64 = body.chunks().map(EntryChunk::len).sum();
        assert_eq!(summed, body.total_size());
    }

    #[test]
    fn snapshot_preserves_arrival_order() {
        let first = EntryChunk::copy_from(b"first-").unwrap();
        let mut body = EntryBody::with_first(first).unwrap();
        body.push(EntryChunk::copy_from(b"second").unwrap()).unwrap();

        let joined: Vec<u8> = body
            .snapshot()
            .iter()
            .flat_map(|chunk| chunk.iter().copied())
            .collect();
        assert_eq!(joined, b"first-second");
    }
}
