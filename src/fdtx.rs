//! Per-transaction companion to a file descriptor slot: the redo-only
//! close-on-exec overlay and the fd-table version this transaction has
//! pinned.
//!
//! `FD_CLOEXEC` is deliberately kept separate from [`crate::ofdtx::OfdTx`]:
//! it is a property of the descriptor, not of the open file description, so
//! two `dup`-related descriptors can disagree about it even though they
//! share everything else.

use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;

use nix::fcntl::{FcntlArg, FdFlag, fcntl};

use crate::config::CcMode;
use crate::error::TxError;
use crate::fd::{Fd, FdTable};

/// Per-transaction state for one referenced file descriptor.
pub struct FdTx {
    /// The descriptor this transaction is operating on.
    pub fildes: RawFd,
    /// The OFD-table index this descriptor referred to when this tx first
    /// referenced it, cached for the `ofdtx` layer's convenience.
    pub ofd_index: usize,
    ccmode: CcMode,
    /// Version of the fd-table slot observed at reference time, used to
    /// detect a concurrent close-then-reopen of the same integer fildes.
    remembered_version: u64,
    /// Overlay for `FD_CLOEXEC`: `None` until this tx changes it, matching
    /// the real flag otherwise.
    cloexec_overlay: Option<bool>,
    /// This tx has requested this descriptor be closed at commit.
    closing: bool,
}

impl FdTx {
    /// Reference `fildes` for the first time in this transaction: bind it
    /// in the fd-table slot to `ofd_index` and remember the resulting
    /// version for later validation.
    pub fn reference(fildes: RawFd, ofd_index: usize, ccmode: CcMode, table: &FdTable) -> Result<Self, TxError> {
        let slot = table.get(fildes)?;
        let version = slot.ref_new(ofd_index);
        Ok(Self {
            fildes,
            ofd_index,
            ccmode,
            remembered_version: version,
            cloexec_overlay: None,
            closing: false,
        })
    }

    /// Re-validate that no other transaction has closed and reopened this
    /// descriptor since `reference` ran.
    pub fn validate(&self, table: &FdTable) -> Result<(), TxError> {
        table.get(self.fildes)?.validate(self.remembered_version)
    }

    fn borrow(&self) -> BorrowedFd<'_> {
        unsafe { BorrowedFd::borrow_raw(self.fildes) }
    }

    /// `fcntl(F_GETFD)`: the overlay if this tx has already set it,
    /// otherwise the real flag.
    pub fn exec_getfd(&mut self) -> Result<bool, TxError> {
        if let Some(value) = self.cloexec_overlay {
            return Ok(value);
        }
        let raw = fcntl(self.borrow(), FcntlArg::F_GETFD).map_err(TxError::System)?;
        let value = FdFlag::from_bits_truncate(raw).contains(FdFlag::FD_CLOEXEC);
        self.cloexec_overlay = Some(value);
        Ok(value)
    }

    /// `fcntl(F_SETFD, ...)`: buffered locally, applied at commit. Cheap and
    /// fully undoable, unlike the OFD-level `fcntl` commands.
    pub fn exec_setfd(&mut self, cloexec: bool) {
        self.cloexec_overlay = Some(cloexec);
    }

    /// Apply a buffered `FD_CLOEXEC` change for real.
    pub fn apply(&self) -> Result<(), TxError> {
        if let Some(value) = self.cloexec_overlay {
            let flags = if value { FdFlag::FD_CLOEXEC } else { FdFlag::empty() };
            fcntl(self.borrow(), FcntlArg::F_SETFD(flags)).map_err(TxError::System)?;
        }
        Ok(())
    }

    /// Mark this descriptor to be closed once this transaction commits.
    pub fn request_close(&mut self, table: &FdTable) -> Result<(), TxError> {
        table.get(self.fildes)?.signal_close();
        self.closing = true;
        Ok(())
    }

    /// True if this transaction has requested the descriptor be closed.
    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.closing
    }

    /// Finish a close at commit: release the table slot and the real
    /// descriptor.
    pub fn finish_close(&self, fd: &Fd) -> Result<(), TxError> {
        nix::unistd::close(self.fildes).map_err(TxError::System)?;
        fd.close();
        Ok(())
    }

    /// Drop this tx's reference without closing, e.g. on abort.
    pub fn unref(&self, fd: &Fd) {
        fd.unref();
    }

    /// The concurrency-control mode this descriptor's OFD was configured
    /// with at reference time.
    #[must_use]
    pub fn ccmode(&self) -> CcMode {
        self.ccmode
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CcMode;
    use crate::fd::FdTable;

    #[test]
    fn reference_records_version_and_validates() {
        let table = FdTable::default_for_test();
        let tx = FdTx::reference(3, 0, CcMode::Ts, &table).unwrap();
        assert!(tx.validate(&table).is_ok());
    }

    #[test]
    fn concurrent_close_fails_validation() {
        let table = FdTable::default_for_test();
        let tx = FdTx::reference(3, 0, CcMode::Ts, &table).unwrap();
        table.get(3).unwrap().signal_close();
        table.get(3).unwrap().close();
        table.get(3).unwrap().ref_new(1);
        assert!(tx.validate(&table).is_err());
    }
}
