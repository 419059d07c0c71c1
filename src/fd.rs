//! File-descriptor table: a fixed-size array of shared slots, one per small
//! integer file descriptor the process might hold.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::TxError;

/// Largest file descriptor value the table tracks. Chosen to comfortably
/// exceed the default `RLIMIT_NOFILE` on Linux without the table becoming
/// unreasonably large; descriptors beyond this bound are rejected with
/// `Domain` rather than panicking.
pub const MAX_NUM_FD: usize = 4096;

/// Lifecycle state of an [`Fd`] slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdState {
    /// No live reference.
    Unused,
    /// At least one transaction references this descriptor.
    Inuse,
    /// An in-flight transaction has closed this descriptor; it becomes
    /// `Unused` on that transaction's commit. Any other transaction that
    /// tries to reference it observes a conflict.
    Closing,
}

/// A single slot in the process-wide file-descriptor table.
pub struct Fd {
    guard: Mutex<FdState>,
    ofd_index: AtomicUsize,
    refcount: AtomicI64,
    version: AtomicU64,
}

impl Default for Fd {
    fn default() -> Self {
        Self {
            guard: Mutex::new(FdState::Unused),
            ofd_index: AtomicUsize::new(usize::MAX),
            refcount: AtomicI64::new(0),
            version: AtomicU64::new(0),
        }
    }
}

impl Fd {
    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> FdState {
        *self.guard.lock()
    }

    /// Index into the OFD table this descriptor currently refers to.
    #[must_use]
    pub fn ofd_index(&self) -> usize {
        self.ofd_index.load(Ordering::Acquire)
    }

    /// Monotonic version, bumped every time this slot transitions from
    /// `Unused` to `Inuse`. Lets a transaction detect "closed and reopened
    /// under my feet" even though the integer fildes is reused.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Bind this slot to `ofd_index`, transitioning `Unused -> Inuse` and
    /// bumping the version. If already `Inuse`, just bumps the refcount.
    pub fn ref_new(&self, ofd_index: usize) -> u64 {
        let mut state = self.guard.lock();
        match *state {
            FdState::Unused => {
                *state = FdState::Inuse;
                self.ofd_index.store(ofd_index, Ordering::Release);
                self.refcount.store(1, Ordering::Release);
                self.version.fetch_add(1, Ordering::AcqRel) + 1
            }
            FdState::Inuse => {
                self.refcount.fetch_add(1, Ordering::AcqRel);
                self.version.load(Ordering::Acquire)
            }
            FdState::Closing => {
                // Caller must have already checked via `validate`; treat as
                // a fresh reference racing a close.
                self.refcount.fetch_add(1, Ordering::AcqRel);
                self.version.load(Ordering::Acquire)
            }
        }
    }

    /// Drop a reference; the final `unref` does not itself flip the state
    /// back to `Unused` — that happens explicitly via `close` at commit so
    /// that it can be ordered correctly against `apply_event`.
    pub fn unref(&self) {
        self.refcount.fetch_sub(1, Ordering::AcqRel);
    }

    /// Compare an observed version against the current one.
    pub fn validate(&self, observed_version: u64) -> Result<(), TxError> {
        if self.state() == FdState::Closing || self.version() != observed_version {
            Err(TxError::Conflict)
        } else {
            Ok(())
        }
    }

    /// Mark this slot `Closing`; other transactions referencing it from now
    /// on observe a conflict.
    pub fn signal_close(&self) {
        *self.guard.lock() = FdState::Closing;
    }

    /// Apply a close: transition to `Unused` and reset bookkeeping fields.
    /// Called during commit's `apply_event` phase.
    pub fn close(&self) {
        let mut state = self.guard.lock();
        *state = FdState::Unused;
        self.ofd_index.store(usize::MAX, Ordering::Release);
        self.refcount.store(0, Ordering::Release);
    }
}

/// The process-wide, fixed-size file-descriptor table.
pub struct FdTable {
    slots: Box<[Fd]>,
}

impl FdTable {
    fn new() -> Self {
        Self {
            slots: (0..MAX_NUM_FD).map(|_| Fd::default()).collect(),
        }
    }

    /// Build a standalone table outside the process-wide singleton, for
    /// tests that need an `&FdTable` without going through [`fd_table`].
    #[cfg(test)]
    pub(crate) fn default_for_test() -> Self {
        Self::new()
    }

    /// Look up the slot for `fildes`, or `Domain` if out of range.
    pub fn get(&self, fildes: i32) -> Result<&Fd, TxError> {
        let index = usize::try_from(fildes).map_err(|_| TxError::Domain)?;
        self.slots.get(index).ok_or(TxError::Domain)
    }
}

static FD_TABLE: OnceLock<FdTable> = OnceLock::new();

/// The single, lazily-initialized process-wide file-descriptor table.
pub fn fd_table() -> &'static FdTable {
    FD_TABLE.get_or_init(FdTable::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_transitions() {
        let fd = Fd::default();
        assert_eq!(fd.state(), FdState::Unused);
        let v1 = fd.ref_new(3);
        assert_eq!(fd.state(), FdState::Inuse);
        assert_eq!(fd.ofd_index(), 3);
        assert!(fd.validate(v1).is_ok());
        fd.signal_close();
        assert_eq!(fd.state(), FdState::Closing);
        assert_eq!(fd.validate(v1), Err(TxError::Conflict));
        fd.close();
        assert_eq!(fd.state(), FdState::Unused);
    }

    #[test]
    fn reopen_bumps_version_past_old_observers() {
        let fd = Fd::default();
        let v1 = fd.ref_new(1);
        fd.close();
        let v2 = fd.ref_new(2);
        assert_ne!(v1, v2);
        assert_eq!(fd.validate(v1), Err(TxError::Conflict));
        assert!(fd.validate(v2).is_ok());
    }

    #[test]
    fn table_rejects_out_of_range_fildes() {
        let table = FdTable::new();
        assert!(table.get(-1).is_err());
        assert!(table.get(i32::try_from(MAX_NUM_FD).unwrap() + 10).is_err());
        assert!(table.get(0).is_ok());
    }
}
