//! Per-transaction companion to an [`Ofd`]: write-set buffer, redo logs for
//! seeks and `fcntl`, the TS read-set snapshot, and the 2PL lock-state
//! bookkeeping.

use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;

use nix::errno::Errno;
use nix::sys::uio::{pread, pwrite};
use nix::unistd::{Whence, lseek};

use crate::cmap::CountMapSnapshot;
use crate::config::{CcMode, OfdTxFlags, OfdType, ValidateMode};
use crate::error::TxError;
use crate::ofd::{Ofd, OfdField};
use crate::rwlockmap::{LockKind, RwStateMap};

/// One coalescable run in the write redo log.
#[derive(Debug, Clone, Copy)]
pub struct WriteLogEntry {
    /// Absolute file offset this write targets.
    pub file_offset: u64,
    /// Number of bytes.
    pub nbyte: u64,
    /// Offset into the transaction's private `write_buf`.
    pub buf_offset: usize,
}

/// One seek redo-log entry.
#[derive(Debug, Clone, Copy)]
pub struct SeekLogEntry {
    /// Tx-private offset observed before this seek.
    pub from_offset: u64,
    /// `offset` argument as passed to `lseek`.
    pub offset: i64,
    /// `whence` argument as passed to `lseek`.
    pub whence: Whence,
}

/// One `fcntl` redo-log entry, enough to undo a flag-mutating command.
#[derive(Debug, Clone, Copy)]
pub struct FcntlLogEntry {
    /// The `fcntl` command, e.g. `F_SETFD`.
    pub cmd: i32,
    /// Value installed by this call.
    pub new_value: i32,
    /// Value observed before this call, restored on undo.
    pub old_value: i32,
}

/// Per-transaction state for one referenced OFD.
pub struct OfdTx {
    /// The descriptor this tx used to first reference the OFD.
    pub fildes: RawFd,
    /// Index of the shared [`Ofd`] in the process-wide OFD table.
    pub ofd_index: usize,
    ty: OfdType,
    ccmode: CcMode,
    refs: u32,
    /// Transaction-private file offset, authoritative until commit.
    pub offset: u64,
    state_version: Option<u64>,
    write_buf: Vec<u8>,
    write_log: Vec<WriteLogEntry>,
    read_log: Vec<(u64, u64)>,
    seek_log: Vec<SeekLogEntry>,
    fcntl_log: Vec<FcntlLogEntry>,
    cmap_ss: CountMapSnapshot,
    rwstate: RwStateMap,
    /// Whole-field 2PL locks this tx currently holds (`lseek`'s
    /// `FILE_OFFSET`, `fcntl`'s `STATE`), released alongside `rwstate` in
    /// `updatecc`/`clear_cc`.
    field_locks_held: Vec<(OfdField, bool)>,
    /// `LOCALSTATE` / `LOCALBUF` / `TL_INCVER`.
    pub flags: OfdTxFlags,
}

impl OfdTx {
    /// Initialize this transaction's view of an OFD: copy its type and CC
    /// mode, clear every log, and snapshot the starting offset.
    #[must_use]
    pub fn new(fildes: RawFd, ofd_index: usize, ofd: &Ofd) -> Self {
        Self {
            fildes,
            ofd_index,
            ty: ofd.ty(),
            ccmode: ofd.ccmode(),
            refs: 1,
            offset: ofd.file_offset(),
            state_version: None,
            write_buf: Vec::new(),
            write_log: Vec::new(),
            read_log: Vec::new(),
            seek_log: Vec::new(),
            fcntl_log: Vec::new(),
            cmap_ss: CountMapSnapshot::new(),
            rwstate: RwStateMap::new(),
            field_locks_held: Vec::new(),
            flags: OfdTxFlags::empty(),
        }
    }

    /// Record an additional reference to the same OFD from this tx.
    pub fn add_ref(&mut self) {
        self.refs += 1;
    }

    /// Drop one reference; `true` once the last one is gone.
    pub fn drop_ref(&mut self) -> bool {
        self.refs -= 1;
        self.refs == 0
    }

    fn state_version(&mut self, ofd: &Ofd) -> u64 {
        *self.state_version.get_or_insert_with(|| ofd.ts_get_state_version())
    }

    /// Borrow this transaction's descriptor for the duration of one syscall.
    /// Sound because the owning `FdTx` holds a live reference on the
    /// underlying table slot for as long as this `OfdTx` exists, which
    /// keeps `fildes` open.
    fn borrow(&self) -> BorrowedFd<'_> {
        unsafe { BorrowedFd::borrow_raw(self.fildes) }
    }

    // ---- write path ----------------------------------------------------

    /// `pwrite` under TS or 2PL: append to the local write-set buffer and
    /// redo log; no syscall happens until commit.
    pub fn exec_pwrite(&mut self, ofd: &Ofd, off: u64, buf: &[u8]) -> Result<usize, TxError> {
        if self.ty == OfdType::Fifo {
            return Err(TxError::System(Errno::ESPIPE));
        }
        if self.ccmode == CcMode::TwoPl || self.ccmode == CcMode::TwoPlExt {
            ofd.lock_region(off, buf.len() as u64, true)?;
            self.rwstate.record(off, buf.len() as u64, LockKind::Write);
        }
        let buf_offset = self.write_buf.len();
        self.write_buf.extend_from_slice(buf);
        self.write_log.push(WriteLogEntry {
            file_offset: off,
            nbyte: buf.len() as u64,
            buf_offset,
        });
        self.flags |= OfdTxFlags::LOCALBUF;
        Ok(buf.len())
    }

    /// Coalesce adjacent write-log runs (same buffer, contiguous file
    /// offsets) and issue one `pwrite(2)` per run. Called at commit.
    pub fn apply_writes(&self) -> Result<(), TxError> {
        let mut i = 0;
        while i < self.write_log.len() {
            let start = self.write_log[i];
            let mut end = i + 1;
            while end < self.write_log.len() {
                let prev = self.write_log[end - 1];
                let next = self.write_log[end];
                if next.file_offset == prev.file_offset + prev.nbyte
                    && next.buf_offset == prev.buf_offset + prev.nbyte as usize
                {
                    end += 1;
                } else {
                    break;
                }
            }
            let last = self.write_log[end - 1];
            let total = (last.buf_offset + last.nbyte as usize) - start.buf_offset;
            let chunk = &self.write_buf[start.buf_offset..start.buf_offset + total];
            pwrite(self.borrow(), chunk, start.file_offset as i64).map_err(TxError::System)?;
            i = end;
        }
        Ok(())
    }

    /// The write-set as a sequence of non-overlapping byte ranges, used by
    /// commit to increment region counters (TS) or is already covered by
    /// held locks (2PL).
    pub fn write_ranges(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.write_log.iter().map(|e| (e.file_offset, e.nbyte))
    }

    // ---- read path ------------------------------------------------------

    /// `pread` under TS mode: snapshot region versions, perform the read,
    /// optionally validate immediately (`VALIDATE_OP`), merge in any
    /// not-yet-applied local writes, and record the region for later
    /// validation.
    pub fn exec_pread_ts(
        &mut self,
        ofd: &Ofd,
        off: u64,
        buf: &mut [u8],
        validate_mode: ValidateMode,
    ) -> Result<usize, TxError> {
        if self.ty == OfdType::Fifo {
            return Err(TxError::System(Errno::ESPIPE));
        }
        let _ = self.state_version(ofd);
        self.cmap_ss.get_region(&ofd.cmap, off, buf.len() as u64);
        let n = pread(self.borrow(), buf, off as i64).map_err(TxError::System)?;
        if matches!(validate_mode, ValidateMode::Op) {
            self.cmap_ss.validate_region(&ofd.cmap, off, buf.len() as u64)?;
        }
        self.merge_local_writes(off, &mut buf[..n]);
        self.read_log.push((off, n as u64));
        Ok(n)
    }

    /// `pread` under 2PL: write-lock the offset field (the shared offset
    /// advances), read-lock the touched region, read, merge local writes.
    pub fn exec_pread_2pl(&mut self, ofd: &Ofd, off: u64, buf: &mut [u8]) -> Result<usize, TxError> {
        if self.ty == OfdType::Fifo {
            return Err(TxError::System(Errno::ESPIPE));
        }
        ofd.lock_region(off, buf.len() as u64, false)?;
        self.rwstate.record(off, buf.len() as u64, LockKind::Read);
        let n = pread(self.borrow(), buf, off as i64).map_err(TxError::System)?;
        self.merge_local_writes(off, &mut buf[..n]);
        Ok(n)
    }

    fn merge_local_writes(&self, off: u64, buf: &mut [u8]) {
        let end = off + buf.len() as u64;
        for entry in &self.write_log {
            let w_end = entry.file_offset + entry.nbyte;
            if entry.file_offset >= end || w_end <= off {
                continue;
            }
            let overlap_start = entry.file_offset.max(off);
            let overlap_end = w_end.min(end);
            let src = &self.write_buf[entry.buf_offset + (overlap_start - entry.file_offset) as usize
                ..entry.buf_offset + (overlap_end - entry.file_offset) as usize];
            let dst_start = (overlap_start - off) as usize;
            buf[dst_start..dst_start + src.len()].copy_from_slice(src);
        }
    }

    /// Re-validate every region this tx has read, used by
    /// `ValidateMode::Full`/`Domain` at commit.
    pub fn validate_reads(&self, ofd: &Ofd) -> Result<(), TxError> {
        self.cmap_ss.validate_all(&ofd.cmap)
    }

    // ---- seek path --------------------------------------------------------

    /// `lseek(0, SEEK_CUR)` never needs a syscall: it returns the
    /// transaction's private offset and never sets `TL_INCVER`.
    #[must_use]
    pub fn exec_seek_cur_zero(&self) -> u64 {
        self.offset
    }

    /// General seek path: computes the new absolute position, validates the
    /// OFD's state version for `SEEK_END` (the size can change underneath
    /// us), logs the redo entry, and updates the tx-private offset.
    pub fn exec_lseek(&mut self, ofd: &Ofd, offset: i64, whence: Whence) -> Result<u64, TxError> {
        if self.ty == OfdType::Fifo || self.ty == OfdType::Socket {
            return Err(TxError::System(Errno::ESPIPE));
        }
        if matches!(whence, Whence::SeekEnd) {
            let observed = self.state_version(ofd);
            ofd.ts_validate_state(observed)?;
        }
        if self.ccmode == CcMode::TwoPl || self.ccmode == CcMode::TwoPlExt {
            ofd.lock_field(OfdField::FileOffset, true)?;
            self.field_locks_held.push((OfdField::FileOffset, true));
        }
        let from_offset = self.offset;
        let new_offset = match whence {
            Whence::SeekSet => offset.max(0) as u64,
            Whence::SeekCur => (from_offset as i64 + offset).max(0) as u64,
            Whence::SeekEnd => {
                let real = lseek(self.borrow(), offset, Whence::SeekEnd).map_err(TxError::System)?;
                real as u64
            }
            _ => return Err(TxError::NoUndo),
        };
        self.seek_log.push(SeekLogEntry { from_offset, offset, whence });
        self.offset = new_offset;
        self.flags |= OfdTxFlags::LOCALSTATE | OfdTxFlags::TL_INCVER;
        Ok(new_offset)
    }

    /// Apply the final seek in the log to the shared OFD offset (only the
    /// final value matters; intermediate seeks in the same tx never
    /// touched the kernel).
    pub fn apply_seek(&self, ofd: &Ofd) {
        if self.seek_log.is_empty() {
            return;
        }
        ofd.set_file_offset(self.offset);
    }

    // ---- fcntl ------------------------------------------------------------

    /// `F_GETFD`/`F_GETFL`/`F_GETOWN`/`F_GETLK`: snapshot the state version
    /// (TS) or take a read lock (2PL), then run the real `fcntl`.
    pub fn exec_fcntl_get(&mut self, ofd: &Ofd, value: i32) -> Result<i32, TxError> {
        match self.ccmode {
            CcMode::Ts => {
                let _ = self.state_version(ofd);
            }
            CcMode::TwoPl | CcMode::TwoPlExt => {
                ofd.lock_field(OfdField::State, false)?;
                self.field_locks_held.push((OfdField::State, false));
            }
            CcMode::NoUndo => {}
        }
        Ok(value)
    }

    /// `F_SETFL`/`F_SETOWN`/`F_SETLK`/`F_SETLKW`: these mutate OFD-shared
    /// state with no general undo path. A non-irrevocable transaction gets
    /// `NoUndo` and must escalate through `Tx::mark_irrevocable`; once
    /// irrevocable, the call runs for real and always succeeds or surfaces
    /// the underlying `errno`.
    pub fn exec_fcntl_set(&mut self, cmd: i32, new_value: i32, irrevocable: bool) -> Result<(), TxError> {
        if !irrevocable {
            return Err(TxError::NoUndo);
        }
        let rc = unsafe { libc::fcntl(self.fildes, cmd, new_value) };
        if rc < 0 {
            return Err(TxError::last_os_error());
        }
        Ok(())
    }

    /// Record an `fcntl` applied irrevocably so it can still be undone if
    /// the call turns out to support it (`FD_CLOEXEC` toggles do).
    pub fn log_fcntl(&mut self, cmd: i32, new_value: i32, old_value: i32) {
        self.fcntl_log.push(FcntlLogEntry { cmd, new_value, old_value });
        self.flags |= OfdTxFlags::LOCALSTATE;
    }

    // ---- commit / abort protocol -------------------------------------------

    /// Phase 1 of commit: TS mode has nothing to lock ahead of validation
    /// (the comparison in [`Self::validate`] is lock-free against monotonic
    /// counters); 2PL modes already hold every lock they need from the
    /// exec phase, so this is a no-op for every mode today. Kept as an
    /// explicit phase because `Tx::commit` always calls it.
    pub fn pre_commit(&self, _ofd: &Ofd) -> Result<(), TxError> {
        Ok(())
    }

    /// Phase 2: re-check state version and all region versions (TS only).
    pub fn validate(&self, ofd: &Ofd) -> Result<(), TxError> {
        if self.ccmode != CcMode::Ts {
            return Ok(());
        }
        if let Some(observed) = self.state_version {
            ofd.ts_validate_state(observed)?;
        }
        self.validate_reads(ofd)
    }

    /// Phase 3: apply buffered writes and the final seek.
    pub fn apply(&self, ofd: &Ofd) -> Result<(), TxError> {
        self.apply_writes()?;
        self.apply_seek(ofd);
        Ok(())
    }

    /// Phase 4: TS mode increments the OFD version and region counters for
    /// the write-set; 2PL modes release region and OFD locks.
    pub fn updatecc(&mut self, ofd: &Ofd) {
        match self.ccmode {
            CcMode::Ts => {
                if self.flags.contains(OfdTxFlags::TL_INCVER) {
                    ofd.ts_inc_state_version();
                }
                for (off, len) in self.write_ranges() {
                    ofd.cmap.inc_region(off, len);
                }
            }
            CcMode::TwoPl | CcMode::TwoPlExt => {
                self.rwstate.unlock_all(&ofd.rwlockmap);
                self.unlock_fields(ofd);
            }
            CcMode::NoUndo => {}
        }
    }

    /// Phase 5 / abort `clear_cc`: release anything still held. A no-op for
    /// TS mode beyond what `updatecc` already released.
    pub fn clear_cc(&mut self, ofd: &Ofd) {
        self.rwstate.unlock_all(&ofd.rwlockmap);
        self.unlock_fields(ofd);
    }

    fn unlock_fields(&mut self, ofd: &Ofd) {
        for (field, write) in self.field_locks_held.drain(..) {
            ofd.unlock_field(field, write);
        }
    }

    /// Every lock still held by this transaction (should be empty once
    /// `clear_cc`/`updatecc` have run; spec.md §8 invariant 4).
    #[must_use]
    pub fn locks_held(&self) -> &[(u64, u64, LockKind)] {
        self.rwstate.held()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OfdType, ofd_type_set_ccmode};
    use crate::ofd::{Ofd, OfdId};

    fn regular_ofd() -> Ofd {
        ofd_type_set_ccmode(OfdType::Regular, CcMode::Ts);
        Ofd::new_for_test(OfdId::new(1, 1, 1), OfdType::Regular)
    }

    #[test]
    fn write_log_coalesces_contiguous_runs() {
        let ofd = regular_ofd();
        let mut tx = OfdTx::new(1, 0, &ofd);
        tx.exec_pwrite(&ofd, 0, b"ab").unwrap();
        tx.exec_pwrite(&ofd, 2, b"cd").unwrap();
        assert_eq!(tx.write_log.len(), 2);
        let ranges: Vec<_> = tx.write_ranges().collect();
        assert_eq!(ranges, vec![(0, 2), (2, 2)]);
    }

    #[test]
    fn merge_local_writes_overrides_stale_read() {
        let ofd = regular_ofd();
        let mut tx = OfdTx::new(1, 0, &ofd);
        tx.exec_pwrite(&ofd, 0, b"XXXX").unwrap();
        let mut buf = [0u8; 4];
        tx.merge_local_writes(0, &mut buf);
        assert_eq!(&buf, b"XXXX");
    }

    #[test]
    fn seek_cur_zero_never_touches_flags() {
        let ofd = regular_ofd();
        let mut tx = OfdTx::new(1, 0, &ofd);
        tx.offset = 42;
        assert_eq!(tx.exec_seek_cur_zero(), 42);
        assert!(!tx.flags.contains(OfdTxFlags::TL_INCVER));
    }

    #[test]
    fn two_pl_lseek_excludes_a_concurrent_seek_on_the_same_ofd() {
        ofd_type_set_ccmode(OfdType::Regular, CcMode::TwoPl);
        let ofd = Ofd::new_for_test(OfdId::new(2, 2, 2), OfdType::Regular);
        let mut tx1 = OfdTx::new(1, 0, &ofd);
        let mut tx2 = OfdTx::new(2, 0, &ofd);

        tx1.exec_lseek(&ofd, 0, Whence::SeekSet).unwrap();
        assert_eq!(tx2.exec_lseek(&ofd, 0, Whence::SeekSet), Err(TxError::Conflict));

        tx1.clear_cc(&ofd);
        assert!(tx2.exec_lseek(&ofd, 0, Whence::SeekSet).is_ok());

        ofd_type_set_ccmode(OfdType::Regular, CcMode::Ts);
    }

    #[test]
    fn two_pl_fcntl_get_locks_are_shared_and_independent_of_file_offset() {
        ofd_type_set_ccmode(OfdType::Regular, CcMode::TwoPl);
        let ofd = Ofd::new_for_test(OfdId::new(3, 3, 3), OfdType::Regular);
        let mut tx1 = OfdTx::new(1, 0, &ofd);
        let mut tx2 = OfdTx::new(2, 0, &ofd);

        // Two concurrent readers of STATE coexist...
        assert!(tx1.exec_fcntl_get(&ofd, 0).is_ok());
        assert!(tx2.exec_fcntl_get(&ofd, 0).is_ok());
        // ...and a held STATE lock never blocks a FILE_OFFSET lock, since
        // they are tracked as separate fields.
        assert!(tx1.exec_lseek(&ofd, 0, Whence::SeekSet).is_ok());

        tx1.clear_cc(&ofd);
        tx2.clear_cc(&ofd);
        ofd_type_set_ccmode(OfdType::Regular, CcMode::Ts);
    }
}
