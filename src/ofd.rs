//! Open file descriptions: the shared kernel-style state that a group of
//! file descriptors referring to the same (device, inode) can share.

use std::os::unix::io::RawFd;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::cmap::CountMap;
use crate::config::{CcMode, OfdFlags, OfdType, ofd_type_ccmode};
use crate::error::TxError;
use crate::rwlockmap::RwLockMap;

/// Identity of an open file description. Two live descriptors are
/// considered the *same* OFD only if all three fields match: the system
/// cannot otherwise tell whether the kernel actually shares the
/// read/write offset between them (see spec.md §3 on `dup`), so a second
/// descriptor for the same `(dev, ino)` with a different `fildes` is
/// treated as a distinct, unrelated OFD unless the caller explicitly asks
/// for a fresh one.
///
/// Field order is significant: `Ord` compares `(dev, ino, fildes)`
/// lexicographically, matching the C original's `ofdidcmp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct OfdId {
    /// Device number from `fstat`.
    pub dev: u64,
    /// Inode number from `fstat`.
    pub ino: u64,
    /// The file descriptor that first established this OFD.
    pub fildes: RawFd,
}

impl OfdId {
    /// Build an id from an `fstat`-derived `(dev, ino)` pair.
    #[must_use]
    pub fn new(dev: u64, ino: u64, fildes: RawFd) -> Self {
        Self { dev, ino, fildes }
    }
}

/// Fields of an OFD that can be independently read/write locked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfdField {
    /// The shared file offset (advanced by `read`/`write`, set by `lseek`).
    FileOffset,
    /// Descriptor flags and other miscellaneous state (`fcntl`).
    State,
}

#[derive(Debug, Default)]
struct OfdState {
    file_offset: u64,
    state_version: u64,
}

const FIELD_WRITE: i32 = -1;

/// 2PL locks over whole-OFD fields (spec.md §4.4/§4.6's `try_rdlock_field`/
/// `try_wrlock_field`), used by `lseek`'s `FILE_OFFSET` and `fcntl`'s
/// `STATE` instead of routing through the byte-range [`RwLockMap`] with a
/// zero-length region (which would never lock anything at all).
#[derive(Debug, Default)]
struct FieldLocks {
    cells: Mutex<[i32; 2]>,
}

impl FieldLocks {
    fn index(field: OfdField) -> usize {
        match field {
            OfdField::FileOffset => 0,
            OfdField::State => 1,
        }
    }

    fn try_read(&self, field: OfdField) -> Result<(), TxError> {
        let mut cells = self.cells.lock();
        let cell = &mut cells[Self::index(field)];
        if *cell == FIELD_WRITE {
            return Err(TxError::Conflict);
        }
        *cell += 1;
        Ok(())
    }

    fn try_write(&self, field: OfdField) -> Result<(), TxError> {
        let mut cells = self.cells.lock();
        let cell = &mut cells[Self::index(field)];
        if *cell != 0 {
            return Err(TxError::Conflict);
        }
        *cell = FIELD_WRITE;
        Ok(())
    }

    fn unlock_read(&self, field: OfdField) {
        let mut cells = self.cells.lock();
        let cell = &mut cells[Self::index(field)];
        debug_assert!(*cell > 0, "unlock_read on a field without a reader");
        *cell -= 1;
    }

    fn unlock_write(&self, field: OfdField) {
        let mut cells = self.cells.lock();
        let cell = &mut cells[Self::index(field)];
        debug_assert_eq!(*cell, FIELD_WRITE, "unlock_write on a field without a writer");
        *cell = 0;
    }
}

/// A single open file description, shared by every file descriptor that
/// refers to the same underlying kernel object.
pub struct Ofd {
    id: OfdId,
    refcount: AtomicI64,
    flags: OfdFlags,
    ty: OfdType,
    ccmode: CcMode,
    state: RwLock<OfdState>,
    /// Region version counters, used by `Ts` mode on regular files.
    pub cmap: CountMap,
    /// Region reader/writer locks, used by `TwoPl`/`TwoPlExt` on regular
    /// files.
    pub rwlockmap: RwLockMap,
    field_locks: FieldLocks,
}

impl Ofd {
    fn new(id: OfdId, ty: OfdType, flags: OfdFlags) -> Self {
        Self {
            id,
            refcount: AtomicI64::new(1),
            flags,
            ty,
            ccmode: ofd_type_ccmode(ty),
            state: RwLock::new(OfdState::default()),
            cmap: CountMap::new(),
            rwlockmap: RwLockMap::new(),
            field_locks: FieldLocks::default(),
        }
    }

    /// Build a standalone OFD outside the process-wide table, for tests
    /// that need an `&Ofd` without going through [`ofd_table`].
    #[cfg(test)]
    pub(crate) fn new_for_test(id: OfdId, ty: OfdType) -> Self {
        Self::new(id, ty, OfdFlags::empty())
    }

    /// This OFD's identity.
    #[must_use]
    pub fn id(&self) -> OfdId {
        self.id
    }

    /// The file type this OFD was classified as at creation.
    #[must_use]
    pub fn ty(&self) -> OfdType {
        self.ty
    }

    /// The concurrency-control mode configured for this OFD's type.
    #[must_use]
    pub fn ccmode(&self) -> CcMode {
        self.ccmode
    }

    /// Flags recorded at creation (`UNLINK`, `WANTNEW`).
    #[must_use]
    pub fn flags(&self) -> OfdFlags {
        self.flags
    }

    fn incref(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop a reference. Returns the refcount observed after decrementing.
    pub fn unref(&self) -> i64 {
        self.refcount.fetch_sub(1, Ordering::AcqRel) - 1
    }

    /// Current refcount.
    #[must_use]
    pub fn refcount(&self) -> i64 {
        self.refcount.load(Ordering::Acquire)
    }

    /// The shared file offset.
    #[must_use]
    pub fn file_offset(&self) -> u64 {
        self.state.read().file_offset
    }

    /// Commit a new shared file offset (called by `OfdTx::apply`).
    pub fn set_file_offset(&self, offset: u64) {
        self.state.write().file_offset = offset;
    }

    /// Snapshot the OFD's state version, for TS-mode validation.
    #[must_use]
    pub fn ts_get_state_version(&self) -> u64 {
        self.state.read().state_version
    }

    /// Validate an observed state version against the current one.
    pub fn ts_validate_state(&self, observed: u64) -> Result<(), TxError> {
        if self.ts_get_state_version() == observed {
            Ok(())
        } else {
            Err(TxError::Conflict)
        }
    }

    /// Bump the state version at commit (called when `TL_INCVER` is set).
    pub fn ts_inc_state_version(&self) {
        self.state.write().state_version += 1;
    }

    /// Acquire a 2PL lock on `[off, off+len)` of this OFD's regular-file
    /// byte range.
    pub fn lock_region(&self, off: u64, len: u64, write: bool) -> Result<(), TxError> {
        if write {
            self.rwlockmap.try_write_lock(off, len)
        } else {
            self.rwlockmap.try_read_lock(off, len)
        }
    }

    /// Acquire a 2PL lock on a whole OFD field (`FILE_OFFSET` for `lseek`,
    /// `STATE` for `fcntl`), independent of the byte-range region locks.
    pub fn lock_field(&self, field: OfdField, write: bool) -> Result<(), TxError> {
        if write {
            self.field_locks.try_write(field)
        } else {
            self.field_locks.try_read(field)
        }
    }

    /// Release a previously acquired field lock.
    pub fn unlock_field(&self, field: OfdField, write: bool) {
        if write {
            self.field_locks.unlock_write(field);
        } else {
            self.field_locks.unlock_read(field);
        }
    }
}

/// Process-wide, append-only table of live OFDs, looked up by [`OfdId`].
pub struct OfdTable {
    entries: RwLock<Vec<Ofd>>,
}

impl OfdTable {
    fn new() -> Self {
        Self { entries: RwLock::new(Vec::new()) }
    }

    /// Find an existing OFD matching `id`, or install a new one.
    ///
    /// When `want_new` is true (the caller is creating a brand-new
    /// descriptor, e.g. via `open`), a match on `(dev, ino)` with a
    /// *different*, still-referenced `fildes` is treated as ambiguous: the
    /// system cannot tell whether the kernel intends this to share state
    /// with the existing OFD, so it reports `Conflict` rather than
    /// guessing (spec.md §3, the "double-fdes same OFD rejection"
    /// scenario). A matching entry with no remaining references is a dead
    /// row from a descriptor that has since been closed, not a live
    /// ambiguity, so it is skipped rather than rejected.
    pub fn find_or_install(&self, id: OfdId, ty: OfdType, flags: OfdFlags, want_new: bool) -> Result<usize, TxError> {
        {
            let entries = self.entries.read();
            for (index, ofd) in entries.iter().enumerate() {
                if ofd.id() == id {
                    ofd.incref();
                    return Ok(index);
                }
                if want_new && ofd.refcount() > 0 && ofd.id().dev == id.dev && ofd.id().ino == id.ino {
                    return Err(TxError::Conflict);
                }
            }
        }
        let mut entries = self.entries.write();
        // Re-check under the write lock: another thread may have installed
        // the same id while we were waiting for it.
        for (index, ofd) in entries.iter().enumerate() {
            if ofd.id() == id {
                ofd.incref();
                return Ok(index);
            }
        }
        entries.push(Ofd::new(id, ty, flags));
        Ok(entries.len() - 1)
    }

    /// Run `f` against the OFD at `index`.
    pub fn with<R>(&self, index: usize, f: impl FnOnce(&Ofd) -> R) -> R {
        f(&self.entries.read()[index])
    }
}

static OFD_TABLE: OnceLock<OfdTable> = OnceLock::new();

/// The single, lazily-initialized process-wide OFD table.
pub fn ofd_table() -> &'static OfdTable {
    OFD_TABLE.get_or_init(OfdTable::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_orders_by_dev_then_ino_then_fildes() {
        let a = OfdId::new(1, 1, 3);
        let b = OfdId::new(1, 2, 0);
        let c = OfdId::new(2, 0, 0);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn find_or_install_reuses_matching_id() {
        let table = OfdTable::new();
        let id = OfdId::new(1, 2, 3);
        let i1 = table.find_or_install(id, OfdType::Regular, OfdFlags::empty(), false).unwrap();
        let i2 = table.find_or_install(id, OfdType::Regular, OfdFlags::empty(), false).unwrap();
        assert_eq!(i1, i2);
        table.with(i1, |ofd| assert_eq!(ofd.refcount(), 2));
    }

    #[test]
    fn want_new_rejects_same_inode_different_fildes() {
        let table = OfdTable::new();
        let id1 = OfdId::new(1, 2, 3);
        table.find_or_install(id1, OfdType::Regular, OfdFlags::empty(), false).unwrap();
        let id2 = OfdId::new(1, 2, 4);
        let result = table.find_or_install(id2, OfdType::Regular, OfdFlags::empty(), true);
        assert_eq!(result, Err(TxError::Conflict));
    }

    #[test]
    fn state_version_round_trips() {
        let ofd = Ofd::new(OfdId::new(0, 0, 0), OfdType::Regular, OfdFlags::empty());
        let v0 = ofd.ts_get_state_version();
        assert!(ofd.ts_validate_state(v0).is_ok());
        ofd.ts_inc_state_version();
        assert_eq!(ofd.ts_validate_state(v0), Err(TxError::Conflict));
    }

    #[test]
    fn field_lock_excludes_a_second_writer_but_not_the_other_field() {
        let ofd = Ofd::new(OfdId::new(0, 0, 0), OfdType::Regular, OfdFlags::empty());
        assert!(ofd.lock_field(OfdField::FileOffset, true).is_ok());
        assert_eq!(ofd.lock_field(OfdField::FileOffset, true), Err(TxError::Conflict));
        assert!(ofd.lock_field(OfdField::State, true).is_ok());
        ofd.unlock_field(OfdField::FileOffset, true);
        ofd.unlock_field(OfdField::State, true);
        assert!(ofd.lock_field(OfdField::FileOffset, true).is_ok());
    }
}
