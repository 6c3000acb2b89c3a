//! # Load Status
//!
//! Per-id load state for banks and sequences. Written by the loader and the
//! sequencer, read by the temporary pool when it picks a side to evict.

/// Kind of streamed content.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ContentKind {
    /// Sequence bytecode.
    Sequence,
    /// Instrument bank.
    Bank,
}

/// Where a piece of content is in its loading lifecycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LoadStatus {
    /// Not resident.
    #[default]
    NotLoaded = 0,
    /// An asynchronous transfer is filling it.
    InProgress = 1,
    /// Resident and in use.
    Complete = 2,
    /// Resident, but its last user let go; first in line for eviction.
    Discardable = 3,
}

impl LoadStatus {
    /// Returns true for content that can be used (complete or discardable).
    #[inline]
    #[must_use]
    pub const fn is_loaded(self) -> bool {
        matches!(self, Self::Complete | Self::Discardable)
    }
}

/// Load status of every id of one content kind.
#[derive(Clone, Debug)]
pub struct LoadStatusTable {
    kind: ContentKind,
    entries: Box<[LoadStatus]>,
}

impl LoadStatusTable {
    /// Creates a table of `len` ids, all [`LoadStatus::NotLoaded`].
    #[must_use]
    pub fn new(kind: ContentKind, len: usize) -> Self {
        Self {
            kind,
            entries: vec![LoadStatus::NotLoaded; len].into_boxed_slice(),
        }
    }

    /// Content kind tracked by this table.
    #[inline]
    #[must_use]
    pub const fn kind(&self) -> ContentKind {
        self.kind
    }

    /// Number of ids tracked.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true when the table tracks no ids.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Status of `id`; ids outside the table read as not loaded.
    #[inline]
    #[must_use]
    pub fn get(&self, id: u8) -> LoadStatus {
        self.entries
            .get(usize::from(id))
            .copied()
            .unwrap_or(LoadStatus::NotLoaded)
    }

    /// Sets the status of `id`. Ids outside the table are ignored.
    pub fn set(&mut self, id: u8, status: LoadStatus) {
        let kind = self.kind;
        if let Some(slot) = self.entries.get_mut(usize::from(id)) {
            if *slot != status {
                tracing::trace!(?kind, id, from = ?*slot, to = ?status, "load status");
                *slot = status;
            }
        }
    }

    /// Marks `id` discardable if it is currently complete.
    pub fn release(&mut self, id: u8) {
        if self.get(id) == LoadStatus::Complete {
            self.set(id, LoadStatus::Discardable);
        }
    }

    /// All statuses, indexed by id.
    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[LoadStatus] {
        &self.entries
    }

    /// Resets every id to not loaded.
    pub fn clear(&mut self) {
        self.entries.fill(LoadStatus::NotLoaded);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_defaults_and_bounds() {
        let mut table = LoadStatusTable::new(ContentKind::Bank, 4);
        assert_eq!(table.get(2), LoadStatus::NotLoaded);
        assert_eq!(table.get(200), LoadStatus::NotLoaded);

        table.set(200, LoadStatus::Complete);
        table.set(1, LoadStatus::Complete);
        assert_eq!(table.get(1), LoadStatus::Complete);
        assert!(table.get(1).is_loaded());
    }

    #[test]
    fn test_release_only_touches_complete() {
        let mut table = LoadStatusTable::new(ContentKind::Sequence, 4);
        table.set(0, LoadStatus::Complete);
        table.set(1, LoadStatus::InProgress);
        table.release(0);
        table.release(1);
        assert_eq!(table.get(0), LoadStatus::Discardable);
        assert_eq!(table.get(1), LoadStatus::InProgress);

        table.clear();
        assert!(table.as_slice().iter().all(|s| *s == LoadStatus::NotLoaded));
    }
}
