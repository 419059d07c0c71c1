//! Region reader/writer locks (`rwlockmap`/`rwstatemap`).
//!
//! Same page-tree shape as [`crate::cmap`], but the payload of each slot is
//! a reader-count/writer-bit cell instead of a version counter. Used by the
//! 2PL and 2PL-extended concurrency-control modes to hold byte-range locks
//! for the lifetime of a transaction.

use crate::error::TxError;
use crate::pagetree::{PAGE_SIZE, PageSnapshot, PageTree, page_range};

/// Lock strength held against a single byte slot or a whole region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    /// Shared; any number of readers may coexist.
    Read,
    /// Exclusive; no other reader or writer may coexist.
    Write,
}

/// `0` = unlocked, `-1` = write-locked, `n > 0` = `n` concurrent readers.
type Cell = i32;
const WRITE: Cell = -1;
type Page = [Cell; PAGE_SIZE];

fn new_page() -> Page {
    [0; PAGE_SIZE]
}

/// Global, process-wide region locks for one OFD's byte range.
#[derive(Default)]
pub struct RwLockMap {
    tree: PageTree<Page>,
}

impl RwLockMap {
    /// An empty lock map; every slot starts unlocked.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(offset: u64) -> usize {
        (offset as usize) & (PAGE_SIZE - 1)
    }

    fn for_each_slot(&self, off: u64, len: u64, mut f: impl FnMut(&mut Cell) -> Result<(), TxError>) -> Result<(), TxError> {
        // Touched slots in a syscall are contiguous and ascending, so taking
        // page locks in offset order here can't deadlock against another
        // thread doing the same for a disjoint or overlapping region.
        for page_index in page_range(off, len) {
            let base = PageSnapshot::<()>::page_base(page_index);
            let handle = self.tree.lookup(base, new_page);
            let mut page = handle.lock();
            let lo = off.max(base);
            let hi = (off + len).min(base + PAGE_SIZE as u64);
            for o in lo..hi {
                f(&mut page[Self::slot(o)])?;
            }
        }
        Ok(())
    }

    /// Acquire a read lock on `[off, off+len)`. Fails if any slot is
    /// currently write-locked.
    pub fn try_read_lock(&self, off: u64, len: u64) -> Result<(), TxError> {
        self.for_each_slot(off, len, |cell| {
            if *cell == WRITE {
                return Err(TxError::Conflict);
            }
            *cell += 1;
            Ok(())
        })
    }

    /// Acquire a write lock on `[off, off+len)`. Fails if any slot is
    /// currently held by any reader or writer.
    pub fn try_write_lock(&self, off: u64, len: u64) -> Result<(), TxError> {
        self.for_each_slot(off, len, |cell| {
            if *cell != 0 {
                return Err(TxError::Conflict);
            }
            *cell = WRITE;
            Ok(())
        })
    }

    /// Upgrade a read lock this caller already holds to a write lock.
    /// Fails if any other reader is also holding the slot.
    pub fn try_upgrade(&self, off: u64, len: u64) -> Result<(), TxError> {
        self.for_each_slot(off, len, |cell| {
            if *cell != 1 {
                return Err(TxError::Conflict);
            }
            *cell = WRITE;
            Ok(())
        })
    }

    /// Release a previously acquired read lock.
    pub fn unlock_read(&self, off: u64, len: u64) {
        let _ = self.for_each_slot(off, len, |cell| {
            debug_assert!(*cell > 0, "unlock_read on a slot without a reader");
            *cell -= 1;
            Ok(())
        });
    }

    /// Release a previously acquired write lock.
    pub fn unlock_write(&self, off: u64, len: u64) {
        let _ = self.for_each_slot(off, len, |cell| {
            debug_assert_eq!(*cell, WRITE, "unlock_write on a slot without a writer");
            *cell = 0;
            Ok(())
        });
    }
}

/// Per-transaction record of which regions this transaction currently holds
/// and under which lock kind, so that unlock at commit/abort is symmetric
/// with acquisition.
#[derive(Debug, Default)]
pub struct RwStateMap {
    /// Ordered by acquisition time, not offset: unlock walks this in any
    /// order since each entry is independent once acquired.
    locked_regions: Vec<(u64, u64, LockKind)>,
}

impl RwStateMap {
    /// No regions held.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `[off, off+len)` is now held under `kind`.
    pub fn record(&mut self, off: u64, len: u64, kind: LockKind) {
        self.locked_regions.push((off, len, kind));
    }

    /// Record that a previously read-locked region was upgraded to write.
    pub fn record_upgrade(&mut self, off: u64, len: u64) {
        for entry in &mut self.locked_regions {
            if entry.0 == off && entry.1 == len && entry.2 == LockKind::Read {
                entry.2 = LockKind::Write;
                return;
            }
        }
    }

    /// Every lock this transaction holds.
    #[must_use]
    pub fn held(&self) -> &[(u64, u64, LockKind)] {
        &self.locked_regions
    }

    /// Release every lock this transaction holds against `global`. Called
    /// at both commit (`updatecc`) and abort (`clearcc`); the set of held
    /// locks is empty afterwards regardless of outcome (spec.md §8
    /// invariant 4).
    pub fn unlock_all(&mut self, global: &RwLockMap) {
        for (off, len, kind) in self.locked_regions.drain(..) {
            match kind {
                LockKind::Read => global.unlock_read(off, len),
                LockKind::Write => global.unlock_write(off, len),
            }
        }
    }

    /// True once every lock taken has been released.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locked_regions.is_empty()
    }
}
