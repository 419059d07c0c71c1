//! FD module: the per-transaction aggregate of every [`crate::fdtx::FdTx`]
//! and [`crate::ofdtx::OfdTx`] this transaction has touched, plus the event
//! log that orders their apply/undo at commit and abort.

use std::collections::HashMap;
use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;

use nix::fcntl::OFlag;
use nix::sys::stat::{SFlag, fstat};
use nix::unistd::Whence;

use crate::config::{CcMode, OfdFlags, OfdType, ValidateMode};
use crate::error::TxError;
use crate::fd::fd_table;
use crate::fdtx::FdTx;
use crate::ofd::{Ofd, OfdId, ofd_table};
use crate::ofdtx::OfdTx;

/// One kind of call recorded in the event log, enough to redispatch to the
/// right apply/undo handler without re-inspecting arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// A descriptor was created (`open`, `dup`, one end of `pipe`).
    Open,
    /// `pwrite`.
    Write,
    /// `lseek`.
    Seek,
    /// `fcntl(F_SETFD, ...)`.
    FcntlSetFd,
    /// `fcntl(F_SETFL/F_SETOWN/F_SETLK/F_SETLKW, ...)`, run irrevocably.
    FcntlSet,
    /// The descriptor was closed.
    Close,
}

/// One entry in the FD module's event log.
#[derive(Debug, Clone, Copy)]
struct Event {
    kind: CallKind,
    fildes: RawFd,
}

/// An `open(2)` with `O_CREAT|O_EXCL` this transaction performed, recorded
/// so abort can unlink the path it created by `(dev, ino)`, the same race-safe
/// technique `ComFs::mkstemp_exec` uses.
struct CreatedFileRecord {
    fildes: RawFd,
    dev: u64,
    ino: u64,
}

fn classify(fildes: RawFd) -> Result<(OfdId, OfdType), TxError> {
    let borrowed = unsafe { BorrowedFd::borrow_raw(fildes) };
    let st = fstat(borrowed).map_err(TxError::System)?;
    let mode = SFlag::from_bits_truncate(st.st_mode);
    let ty = if mode.contains(SFlag::S_IFIFO) {
        OfdType::Fifo
    } else if mode.contains(SFlag::S_IFSOCK) {
        OfdType::Socket
    } else if mode.contains(SFlag::S_IFREG) {
        OfdType::Regular
    } else {
        OfdType::Any
    };
    Ok((OfdId::new(st.st_dev as u64, st.st_ino as u64, fildes), ty))
}

/// Per-transaction FD-module state: one [`FdTx`] per referenced descriptor,
/// one [`OfdTx`] per referenced open file description, and the ordered
/// event log tying them together.
#[derive(Default)]
pub struct ComFd {
    fdtxs: HashMap<RawFd, FdTx>,
    ofdtxs: HashMap<usize, OfdTx>,
    log: Vec<Event>,
    /// Fildes created by `open`/`dup`/`pipe` in this tx, so abort can close
    /// them without consulting the event log.
    created: Vec<RawFd>,
    /// `open(2)` calls in this tx that used `O_CREAT|O_EXCL`, so abort can
    /// unlink the new file as well as close its fildes.
    created_files: Vec<CreatedFileRecord>,
    validate_mode: ValidateMode,
}

impl ComFd {
    /// An empty FD module for a fresh transaction.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set when TS-mode region validation runs for reads on this tx.
    pub fn set_validate_mode(&mut self, mode: ValidateMode) {
        self.validate_mode = mode;
    }

    /// Bind this tx to `fildes`, classifying its OFD on first reference and
    /// validating the fd-table version on subsequent ones.
    fn ref_or_validate(&mut self, fildes: RawFd, want_new: bool) -> Result<usize, TxError> {
        if let Some(fdtx) = self.fdtxs.get(&fildes) {
            fdtx.validate(fd_table())?;
            let ofd_index = fdtx.ofd_index;
            self.ofdtxs.entry(ofd_index).and_modify(|o| o.add_ref());
            return Ok(ofd_index);
        }
        let (id, ty) = classify(fildes)?;
        let ofd_index = ofd_table().find_or_install(id, ty, OfdFlags::empty(), want_new)?;
        let ccmode = ofd_table().with(ofd_index, Ofd::ccmode);
        let fdtx = FdTx::reference(fildes, ofd_index, ccmode, fd_table())?;
        self.fdtxs.insert(fildes, fdtx);
        if !self.ofdtxs.contains_key(&ofd_index) {
            let new_tx = ofd_table().with(ofd_index, |ofd| OfdTx::new(fildes, ofd_index, ofd));
            self.ofdtxs.insert(ofd_index, new_tx);
        }
        Ok(ofd_index)
    }

    fn push_event(&mut self, kind: CallKind, fildes: RawFd) {
        self.log.push(Event { kind, fildes });
    }

    // ---- exec path -------------------------------------------------------

    /// `open(2)`: performed directly (no undo-able staging is possible for a
    /// syscall that names a brand-new kernel object), then registered so
    /// abort can close it again.
    ///
    /// Every open asks `ref_or_validate` for `want_new`: the returned
    /// `fildes` is always freshly minted by the kernel, so a match on
    /// `(dev, ino)` under some other fildes already tracked by this
    /// transaction is exactly the ambiguous-sharing case the OFD table
    /// rejects (spec.md §8 scenario 6), not a coincidence to paper over.
    pub fn exec_open(&mut self, path: &std::ffi::CStr, oflag: OFlag, mode: nix::sys::stat::Mode) -> Result<RawFd, TxError> {
        use std::os::fd::IntoRawFd;
        let fildes = nix::fcntl::open(path, oflag, mode).map_err(TxError::System)?.into_raw_fd();
        if let Err(err) = self.ref_or_validate(fildes, true) {
            let _ = nix::unistd::close(fildes);
            return Err(err);
        }
        if oflag.contains(OFlag::O_CREAT | OFlag::O_EXCL) {
            let borrowed = unsafe { BorrowedFd::borrow_raw(fildes) };
            if let Ok(st) = fstat(borrowed) {
                self.created_files.push(CreatedFileRecord {
                    fildes,
                    dev: st.st_dev as u64,
                    ino: st.st_ino as u64,
                });
            }
        }
        self.created.push(fildes);
        self.push_event(CallKind::Open, fildes);
        Ok(fildes)
    }

    /// `pipe(2)`: both ends are registered and logged the same way as `open`.
    ///
    /// Unlike `open`, neither end asks for `want_new`: both descriptors refer
    /// to the same freshly created inode by construction, so there is no
    /// pre-existing OFD they could ambiguously collide with.
    pub fn exec_pipe(&mut self) -> Result<(RawFd, RawFd), TxError> {
        use std::os::fd::IntoRawFd;
        let (read_end, write_end) = nix::unistd::pipe().map_err(TxError::System)?;
        let read_fd = read_end.into_raw_fd();
        let write_fd = write_end.into_raw_fd();
        for fildes in [read_fd, write_fd] {
            if let Err(err) = self.ref_or_validate(fildes, false) {
                let _ = nix::unistd::close(read_fd);
                let _ = nix::unistd::close(write_fd);
                return Err(err);
            }
            self.created.push(fildes);
            self.push_event(CallKind::Open, fildes);
        }
        Ok((read_fd, write_fd))
    }

    /// `dup(2)`.
    pub fn exec_dup(&mut self, fildes: RawFd) -> Result<RawFd, TxError> {
        use std::os::fd::IntoRawFd;
        self.ref_or_validate(fildes, false)?;
        let borrowed = unsafe { BorrowedFd::borrow_raw(fildes) };
        let new_fd = nix::unistd::dup(borrowed).map_err(TxError::System)?.into_raw_fd();
        if let Err(err) = self.ref_or_validate(new_fd, false) {
            let _ = nix::unistd::close(new_fd);
            return Err(err);
        }
        self.created.push(new_fd);
        self.push_event(CallKind::Open, new_fd);
        Ok(new_fd)
    }

    /// `pwrite(2)`.
    pub fn exec_pwrite(&mut self, fildes: RawFd, off: u64, buf: &[u8]) -> Result<usize, TxError> {
        let ofd_index = self.ref_or_validate(fildes, false)?;
        let n = ofd_table().with(ofd_index, |ofd| {
            self.ofdtxs.get_mut(&ofd_index).expect("referenced above").exec_pwrite(ofd, off, buf)
        })?;
        self.push_event(CallKind::Write, fildes);
        Ok(n)
    }

    /// `pread(2)`, dispatching to the TS or 2PL path by the OFD's configured
    /// concurrency-control mode.
    pub fn exec_pread(&mut self, fildes: RawFd, off: u64, buf: &mut [u8]) -> Result<usize, TxError> {
        let ofd_index = self.ref_or_validate(fildes, false)?;
        let validate_mode = self.validate_mode;
        ofd_table().with(ofd_index, |ofd| {
            let tx = self.ofdtxs.get_mut(&ofd_index).expect("referenced above");
            match ofd.ccmode() {
                CcMode::TwoPl | CcMode::TwoPlExt => tx.exec_pread_2pl(ofd, off, buf),
                _ => tx.exec_pread_ts(ofd, off, buf, validate_mode),
            }
        })
    }

    /// `lseek(2)`.
    pub fn exec_lseek(&mut self, fildes: RawFd, offset: i64, whence: Whence) -> Result<u64, TxError> {
        let ofd_index = self.ref_or_validate(fildes, false)?;
        if offset == 0 && matches!(whence, Whence::SeekCur) {
            let tx = self.ofdtxs.get(&ofd_index).expect("referenced above");
            return Ok(tx.exec_seek_cur_zero());
        }
        let result = ofd_table().with(ofd_index, |ofd| {
            self.ofdtxs.get_mut(&ofd_index).expect("referenced above").exec_lseek(ofd, offset, whence)
        })?;
        self.push_event(CallKind::Seek, fildes);
        Ok(result)
    }

    /// `fcntl(F_SETFD, ...)`: descriptor-local, always undoable.
    pub fn exec_fcntl_setfd(&mut self, fildes: RawFd, cloexec: bool) -> Result<(), TxError> {
        self.ref_or_validate(fildes, false)?;
        self.fdtxs.get_mut(&fildes).expect("referenced above").exec_setfd(cloexec);
        self.push_event(CallKind::FcntlSetFd, fildes);
        Ok(())
    }

    /// `fcntl(F_GETFD)`.
    pub fn exec_fcntl_getfd(&mut self, fildes: RawFd) -> Result<bool, TxError> {
        self.ref_or_validate(fildes, false)?;
        self.fdtxs.get_mut(&fildes).expect("referenced above").exec_getfd()
    }

    /// `fcntl(F_GETFL/F_GETOWN/F_GETLK, ...)`: OFD-shared state, read only.
    pub fn exec_fcntl_get(&mut self, fildes: RawFd, value: i32) -> Result<i32, TxError> {
        let ofd_index = self.ref_or_validate(fildes, false)?;
        ofd_table().with(ofd_index, |ofd| {
            self.ofdtxs.get_mut(&ofd_index).expect("referenced above").exec_fcntl_get(ofd, value)
        })
    }

    /// `fcntl(F_SETFL/F_SETOWN/F_SETLK/F_SETLKW, ...)`: OFD-shared state with
    /// no undo path outside irrevocable mode.
    pub fn exec_fcntl_set(&mut self, fildes: RawFd, cmd: i32, new_value: i32, irrevocable: bool) -> Result<(), TxError> {
        let ofd_index = self.ref_or_validate(fildes, false)?;
        self.ofdtxs.get_mut(&ofd_index).expect("referenced above").exec_fcntl_set(cmd, new_value, irrevocable)?;
        self.push_event(CallKind::FcntlSet, fildes);
        Ok(())
    }

    /// `close(2)`: staged, not performed, so abort can leave the descriptor
    /// open.
    pub fn exec_close(&mut self, fildes: RawFd) -> Result<(), TxError> {
        self.ref_or_validate(fildes, false)?;
        self.fdtxs.get_mut(&fildes).expect("referenced above").request_close(fd_table())?;
        self.push_event(CallKind::Close, fildes);
        Ok(())
    }

    // ---- commit / abort protocol ------------------------------------------

    /// Phase 1: delegate to every referenced OFDTx's `pre_commit`.
    pub fn pre_commit(&self) -> Result<(), TxError> {
        for (&ofd_index, tx) in &self.ofdtxs {
            ofd_table().with(ofd_index, |ofd| tx.pre_commit(ofd))?;
        }
        Ok(())
    }

    /// Phase 2: re-validate every FDTx and OFDTx this tx touched.
    pub fn validate(&self) -> Result<(), TxError> {
        for fdtx in self.fdtxs.values() {
            fdtx.validate(fd_table())?;
        }
        for (&ofd_index, tx) in &self.ofdtxs {
            ofd_table().with(ofd_index, |ofd| tx.validate(ofd))?;
        }
        Ok(())
    }

    /// Phase 3: replay the event log in order, applying writes/seeks/fcntls
    /// and finally closes (closes run last among same-fildes events since
    /// the log preserves call order and a close is always the caller's
    /// final operation on that descriptor).
    pub fn apply_event(&self) -> Result<(), TxError> {
        for (&ofd_index, tx) in &self.ofdtxs {
            ofd_table().with(ofd_index, |ofd| tx.apply(ofd))?;
        }
        for fdtx in self.fdtxs.values() {
            fdtx.apply()?;
        }
        for event in &self.log {
            if event.kind == CallKind::Close {
                let fdtx = self.fdtxs.get(&event.fildes).expect("logged fdtx must exist");
                let fd = fd_table().get(event.fildes)?;
                fdtx.finish_close(fd)?;
            }
        }
        Ok(())
    }

    /// Phase 4: release locks and publish version bumps for every OFDTx.
    pub fn updatecc(&mut self) {
        for tx in self.ofdtxs.values_mut() {
            ofd_table().with(tx.ofd_index, |ofd| tx.updatecc(ofd));
        }
    }

    /// Abort phase 1: unlink any path created with `O_CREAT|O_EXCL` while its
    /// fildes is still open (the `/proc/self/fd/<n>` resolution needs a live
    /// fd), then close everything this tx newly created, in reverse creation
    /// order.
    pub fn undo_event(&mut self) {
        for record in self.created_files.drain(..) {
            let proc_path = format!("/proc/self/fd/{}", record.fildes);
            let Ok(target) = std::fs::read_link(&proc_path) else { continue };
            let Ok(st) = nix::sys::stat::lstat(target.as_path()) else { continue };
            if st.st_dev as u64 == record.dev && st.st_ino as u64 == record.ino {
                let _ = std::fs::remove_file(&target);
            }
        }
        for &fildes in self.created.iter().rev() {
            let _ = nix::unistd::close(fildes);
        }
    }

    /// Abort phase 2: release every lock this tx's OFDTxs are holding.
    pub fn clear_cc(&mut self) {
        for tx in self.ofdtxs.values_mut() {
            ofd_table().with(tx.ofd_index, |ofd| tx.clear_cc(ofd));
        }
    }

    /// Final phase for both commit and abort: drop every reference this tx
    /// held on FD/OFD table slots.
    pub fn finish(&mut self) {
        for fdtx in self.fdtxs.values() {
            if let Ok(fd) = fd_table().get(fdtx.fildes) {
                fdtx.unref(fd);
            }
        }
        for &ofd_index in self.ofdtxs.keys() {
            ofd_table().with(ofd_index, Ofd::unref);
        }
        self.fdtxs.clear();
        self.ofdtxs.clear();
        self.log.clear();
        self.created.clear();
        self.created_files.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn write_then_commit_is_visible_on_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"0123456789").unwrap();
        let fildes = nix::fcntl::open(file.path(), OFlag::O_RDWR, nix::sys::stat::Mode::empty()).unwrap();

        let mut comfd = ComFd::new();
        comfd.exec_pwrite(fildes, 0, b"XX").unwrap();
        comfd.pre_commit().unwrap();
        comfd.validate().unwrap();
        comfd.apply_event().unwrap();
        comfd.updatecc();
        comfd.finish();

        let contents = std::fs::read(file.path()).unwrap();
        assert_eq!(&contents[..2], b"XX");
        let _ = nix::unistd::close(fildes);
    }

    #[test]
    fn abort_closes_newly_opened_fildes() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = std::ffi::CString::new(file.path().to_str().unwrap()).unwrap();
        let mut comfd = ComFd::new();
        let fildes = comfd.exec_open(&path, OFlag::O_RDWR, nix::sys::stat::Mode::empty()).unwrap();
        comfd.undo_event();
        comfd.clear_cc();
        comfd.finish();
        assert!(nix::unistd::close(fildes).is_err());
    }

    #[test]
    fn abort_unlinks_a_file_created_with_o_creat_excl() {
        let dir = tempfile::tempdir().unwrap();
        let path = std::ffi::CString::new(dir.path().join("new").to_str().unwrap()).unwrap();
        let mut comfd = ComFd::new();
        let fildes = comfd
            .exec_open(&path, OFlag::O_RDWR | OFlag::O_CREAT | OFlag::O_EXCL, nix::sys::stat::Mode::S_IRUSR | nix::sys::stat::Mode::S_IWUSR)
            .unwrap();
        comfd.undo_event();
        comfd.clear_cc();
        comfd.finish();
        assert!(nix::unistd::close(fildes).is_err());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn abort_spares_an_o_creat_excl_file_whose_inode_changed() {
        let dir = tempfile::tempdir().unwrap();
        let path = std::ffi::CString::new(dir.path().join("new").to_str().unwrap()).unwrap();
        let mut comfd = ComFd::new();
        let fildes = comfd
            .exec_open(&path, OFlag::O_RDWR | OFlag::O_CREAT | OFlag::O_EXCL, nix::sys::stat::Mode::S_IRUSR | nix::sys::stat::Mode::S_IWUSR)
            .unwrap();
        std::fs::remove_file(dir.path().join("new")).unwrap();
        std::fs::write(dir.path().join("new"), b"replaced").unwrap();
        comfd.undo_event();
        comfd.clear_cc();
        comfd.finish();
        let _ = nix::unistd::close(fildes);
        assert!(dir.path().join("new").exists());
    }

    #[test]
    fn commit_keeps_an_o_creat_excl_file_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = std::ffi::CString::new(dir.path().join("new").to_str().unwrap()).unwrap();
        let mut comfd = ComFd::new();
        let fildes = comfd
            .exec_open(&path, OFlag::O_RDWR | OFlag::O_CREAT | OFlag::O_EXCL, nix::sys::stat::Mode::S_IRUSR | nix::sys::stat::Mode::S_IWUSR)
            .unwrap();
        comfd.pre_commit().unwrap();
        comfd.validate().unwrap();
        comfd.apply_event().unwrap();
        comfd.updatecc();
        comfd.finish();
        assert!(dir.path().join("new").exists());
        let _ = nix::unistd::close(fildes);
    }
}
