use super::directory::{CacheDirectory, EntryHandle};

impl CacheDirectory {
    /// Returns the entry with the lowest recency stamp.
    ///
    /// Full scan per call, so evicting k entries costs O(n·k). Stamps are
    /// unique, so there are no ties to break.
    pub(super) fn find_victim(&self) -> Option<EntryHandle> {
        self.iter()
            .min_by_key(|(_, entry)| entry.recency)
            .map(|(handle, _)| handle)
    }
}
