//! Region version counters (`cmap`/`cmapss`).
//!
//! A [`CountMap`] is a [`PageTree`] whose leaves are pages of 64-bit version
//! counters, one per byte slot in the page. Every committed write to a byte
//! range bumps the counters that cover it; a transaction's
//! [`CountMapSnapshot`] remembers whole pages it has touched so that
//! commit-time validation can detect whether anyone else incremented any
//! counter in those pages meanwhile. Counters are monotonically
//! non-decreasing, which is what makes "snapshot != global" a sound conflict
//! signal: nothing ever rolls a counter back, so any mismatch means a
//! concurrent writer committed.

use crate::error::TxError;
use crate::pagetree::{PAGE_SIZE, PageSnapshot, PageTree, page_range};

type Page = [u64; PAGE_SIZE];

fn new_page() -> Page {
    [0; PAGE_SIZE]
}

/// Global, process-wide region version counters for one OFD.
#[derive(Default)]
pub struct CountMap {
    tree: PageTree<Page>,
}

impl CountMap {
    /// An empty counter map; every counter reads as zero until written.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(offset: u64) -> usize {
        (offset as usize) & (PAGE_SIZE - 1)
    }

    /// Increment the counters covering `[off, off+len)` by one. Called at
    /// commit for every write a transaction made.
    pub fn inc_region(&self, off: u64, len: u64) {
        for page_index in page_range(off, len) {
            let base = PageSnapshot::<()>::page_base(page_index);
            let handle = self.tree.lookup(base, new_page);
            let mut page = handle.lock();
            let lo = off.max(base);
            let hi = (off + len).min(base + PAGE_SIZE as u64);
            for o in lo..hi {
                page[Self::slot(o)] += 1;
            }
        }
    }

    fn page_copy(&self, page_index: u64) -> Page {
        let base = PageSnapshot::<()>::page_base(page_index);
        *self.tree.lookup(base, new_page).lock()
    }
}

/// Per-transaction view of a [`CountMap`]: the whole pages this transaction
/// has observed, lazily copied in on first read or write of a region.
#[derive(Default)]
pub struct CountMapSnapshot {
    pages: PageSnapshot<Page>,
}

impl CountMapSnapshot {
    /// An empty snapshot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy the pages covering `[off, off+len)` from `global` into this
    /// snapshot if not already cached. Idempotent within a transaction.
    pub fn get_region(&mut self, global: &CountMap, off: u64, len: u64) {
        for page_index in page_range(off, len) {
            if self.pages.get(page_index).is_some() {
                continue;
            }
            let page = global.page_copy(page_index);
            self.pages.get_or_fill(page_index, || page);
        }
    }

    /// Compare the cached pages touching `[off, off+len)` against the
    /// current global values. Returns `Conflict` if any counter in a
    /// touched page advanced since this snapshot copied it.
    pub fn validate_region(&self, global: &CountMap, off: u64, len: u64) -> Result<(), TxError> {
        for page_index in page_range(off, len) {
            let Some(snapshot_page) = self.pages.get(page_index) else {
                continue;
            };
            if *snapshot_page != global.page_copy(page_index) {
                return Err(TxError::Conflict);
            }
        }
        Ok(())
    }

    /// Re-validate every page this snapshot has touched (`VALIDATE_FULL`).
    pub fn validate_all(&self, global: &CountMap) -> Result<(), TxError> {
        for (page_index, snapshot_page) in self.pages.iter() {
            if *snapshot_page != global.page_copy(page_index) {
                return Err(TxError::Conflict);
            }
        }
        Ok(())
    }

    /// Drop all cached state, e.g. when a transaction restarts.
    pub fn clear(&mut self) {
        self.pages.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_counters_validate_clean() {
        let map = CountMap::new();
        let mut ss = CountMapSnapshot::new();
        ss.get_region(&map, 0, 16);
        assert!(ss.validate_all(&map).is_ok());
    }

    #[test]
    fn concurrent_increment_fails_validation() {
        let map = CountMap::new();
        let mut ss = CountMapSnapshot::new();
        ss.get_region(&map, 0, 16);
        map.inc_region(4, 1);
        assert_eq!(ss.validate_all(&map), Err(TxError::Conflict));
        assert_eq!(ss.validate_region(&map, 0, 16), Err(TxError::Conflict));
    }

    #[test]
    fn validate_region_ignores_untouched_pages() {
        let map = CountMap::new();
        let mut ss = CountMapSnapshot::new();
        ss.get_region(&map, 0, 16);
        map.inc_region(PAGE_SIZE as u64 + 4, 1);
        assert!(ss.validate_region(&map, 0, 16).is_ok());
    }

    #[test]
    fn increment_spans_page_boundary() {
        let map = CountMap::new();
        map.inc_region(PAGE_SIZE as u64 - 1, 3);
        let mut ss = CountMapSnapshot::new();
        ss.get_region(&map, PAGE_SIZE as u64 - 1, 3);
        assert!(ss.validate_all(&map).is_ok());
        map.inc_region(PAGE_SIZE as u64, 1);
        assert_eq!(ss.validate_all(&map), Err(TxError::Conflict));
    }
}
