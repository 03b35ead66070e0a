use super::chunk::{EntryBody, EntryChunk};
use super::entry::{CacheEntry, FillState, ResponseMeta};
use super::{CacheError, CacheKey};

/// Stable reference to one directory entry.
///
/// The generation changes whenever a slot is vacated, so a handle kept past
/// the removal of its entry resolves to nothing instead of to whatever entry
/// reuses the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryHandle {
    index: usize,
    generation: u64,
}

#[derive(Debug)]
struct Slot {
    generation: u64,
    entry: Option<CacheEntry>,
}

/// Doubly linked set of cached responses, stored in an index arena.
///
/// List order is insertion order and only matters for iteration; eviction
/// order comes from recency stamps (see `lru.rs`). All methods assume the
/// caller holds the cache lock.
#[derive(Debug)]
pub(super) struct CacheDirectory {
    slots: Vec<Slot>,
    free: Vec<usize>,
    head: Option<EntryHandle>,
    tail: Option<EntryHandle>,
    entry_count: usize,
    total_bytes: u64,
    recency_counter: u64,
    capacity_bytes: u64,
    #[cfg(test)]
    fail_next_append: bool,
}

impl CacheDirectory {
    /// `capacity_bytes == 0` means unbounded.
    pub(super) fn new(capacity_bytes: u64) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            entry_count: 0,
            total_bytes: 0,
            recency_counter: 0,
            capacity_bytes,
            #[cfg(test)]
            fail_next_append: false,
        }
    }

    pub(super) fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    pub(super) fn set_capacity_bytes(&mut self, capacity_bytes: u64) {
        self.capacity_bytes = capacity_bytes;
    }

    pub(super) fn entry_count(&self) -> usize {
        self.entry_count
    }

    pub(super) fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub(super) fn recency_counter(&self) -> u64 {
        self.recency_counter
    }

    pub(super) fn entry(&self, handle: EntryHandle) -> Option<&CacheEntry> {
        let slot = self.slots.get(handle.index)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    fn entry_mut(&mut self, handle: EntryHandle) -> Option<&mut CacheEntry> {
        let slot = self.slots.get_mut(handle.index)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_mut()
    }

    pub(super) fn contains(&self, handle: EntryHandle) -> bool {
        self.entry(handle).is_some()
    }

    pub(super) fn recency_of(&self, handle: EntryHandle) -> Option<u64> {
        self.entry(handle).map(|entry| entry.recency)
    }

    pub(super) fn size_of(&self, handle: EntryHandle) -> Option<u64> {
        self.entry(handle).map(CacheEntry::total_size)
    }

    fn next_stamp(&mut self) -> u64 {
        self.recency_counter += 1;
        self.recency_counter
    }

    /// Finds the complete entry for `(host, path)` and marks it most recently
    /// used. Entries still being filled never match.
    pub(super) fn lookup(&mut self, host: &str, path: &str) -> Option<EntryHandle> {
        let mut cursor = self.head;
        while let Some(handle) = cursor {
            let entry = self.entry(handle)?;
            if entry.is_complete() && entry.key.matches(host, path) {
                let stamp = self.next_stamp();
                if let Some(entry) = self.entry_mut(handle) {
                    entry.recency = stamp;
                }
                return Some(handle);
            }
            cursor = entry.next;
        }
        None
    }

    /// Links a new entry at the tail. Nothing changes if allocation fails.
    pub(super) fn insert(
        &mut self,
        key: CacheKey,
        first_chunk: EntryChunk,
        meta: ResponseMeta,
    ) -> Result<EntryHandle, CacheError> {
        let body = EntryBody::with_first(first_chunk)?;
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots
                    .try_reserve(1)
                    .map_err(|_| CacheError::Allocation {
                        bytes: std::mem::size_of::<Slot>(),
                    })?;
                self.free
                    .try_reserve(self.slots.len() + 1)
                    .map_err(|_| CacheError::Allocation {
                        bytes: std::mem::size_of::<usize>(),
                    })?;
                self.slots.push(Slot {
                    generation: 0,
                    entry: None,
                });
                self.slots.len() - 1
            }
        };

        let handle = EntryHandle {
            index,
            generation: self.slots[index].generation,
        };
        let size = body.total_size();
        let recency = self.next_stamp();
        self.slots[index].entry = Some(CacheEntry::new(key, meta, body, recency, self.tail));

        match self.tail {
            Some(tail) => {
                if let Some(tail_entry) = self.entry_mut(tail) {
                    tail_entry.next = Some(handle);
                }
            }
            None => self.head = Some(handle),
        }
        self.tail = Some(handle);
        self.entry_count += 1;
        self.total_bytes = self.total_bytes.saturating_add(size);
        Ok(handle)
    }

    /// Appends one chunk to an existing entry and returns its new size.
    ///
    /// No budget check happens here: a response of unknown length keeps
    /// growing even past capacity so that an entry is never cut in half.
    pub(super) fn append_chunk(
        &mut self,
        handle: EntryHandle,
        chunk: EntryChunk,
    ) -> Result<u64, CacheError> {
        #[cfg(test)]
        if std::mem::take(&mut self.fail_next_append) {
            return Err(CacheError::Allocation {
                bytes: chunk.len() as usize,
            });
        }

        let added = chunk.len();
        let entry = self.entry_mut(handle).ok_or(CacheError::StaleHandle)?;
        entry.push_chunk(chunk)?;
        let new_size = entry.total_size();
        self.total_bytes = self.total_bytes.saturating_add(added);
        Ok(new_size)
    }

    /// Unlinks and drops an entry, returning the bytes it held. Absent or
    /// stale handles are ignored.
    pub(super) fn remove(&mut self, handle: EntryHandle) -> u64 {
        let Some(slot) = self.slots.get_mut(handle.index) else {
            return 0;
        };
        if slot.generation != handle.generation {
            return 0;
        }
        let Some(entry) = slot.entry.take() else {
            return 0;
        };
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);

        match entry.prev {
            Some(prev) => {
                if let Some(prev_entry) = self.entry_mut(prev) {
                    prev_entry.next = entry.next;
                }
            }
            None => self.head = entry.next,
        }
        match entry.next {
            Some(next) => {
                if let Some(next_entry) = self.entry_mut(next) {
                    next_entry.prev = entry.prev;
                }
            }
            None => self.tail = entry.prev,
        }

        self.entry_count -= 1;
        let freed = entry.total_size();
        self.total_bytes = self.total_bytes.saturating_sub(freed);
        freed
    }

    /// Makes a filled entry visible to lookups. Older complete entries under
    /// the same key are superseded and removed; returns the bytes they held.
    pub(super) fn mark_complete(&mut self, handle: EntryHandle) -> Result<u64, CacheError> {
        let entry = self.entry_mut(handle).ok_or(CacheError::StaleHandle)?;
        entry.state = FillState::Complete;
        let key = entry.key.clone();

        let superseded: Vec<EntryHandle> = self
            .iter()
            .filter(|(other, entry)| {
                *other != handle && entry.is_complete() && entry.key == key
            })
            .map(|(other, _)| other)
            .collect();
        Ok(superseded
            .into_iter()
            .map(|other| self.remove(other))
            .sum())
    }

    /// Head-to-tail traversal.
    pub(super) fn iter(&self) -> Entries<'_> {
        Entries {
            directory: self,
            cursor: self.head,
            forward: true,
        }
    }

    /// Tail-to-head traversal.
    pub(super) fn iter_rev(&self) -> Entries<'_> {
        Entries {
            directory: self,
            cursor: self.tail,
            forward: false,
        }
    }

    #[cfg(test)]
    pub(super) fn fail_next_append(&mut self) {
        self.fail_next_append = true;
    }
}

pub(super) struct Entries<'a> {
    directory: &'a CacheDirectory,
    cursor: Option<EntryHandle>,
    forward: bool,
}

impl<'a> Iterator for Entries<'a> {
    type Item = (EntryHandle, &'a CacheEntry);

    fn next(&mut self) -> Option<Self::Item> {
        let handle = self.cursor?;
        let entry = self.directory.entry(handle)?;
        self.cursor = if self.forward { entry.next } else { entry.prev };
        Some((handle, entry))
    }
}
