//! VFS module: transaction-local current-working-directory tracking and
//! `*at(2)`-relative path operations.

use std::ffi::CString;
use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;

use nix::fcntl::{AtFlags, OFlag};
use nix::sys::stat::{FchmodatFlags, Mode, fstatat, mkdirat, mknodat};
use nix::unistd::{UnlinkatFlags, linkat, mkfifo, unlinkat};

use crate::error::TxError;

/// One `mkstemp` this transaction created, recorded so abort can unlink the
/// file by path if (and only if) the fildes still names the same inode.
struct MkstempRecord {
    fildes: RawFd,
    dev: u64,
    ino: u64,
}

/// Per-transaction VFS-module state: the tx-local CWD override and the
/// bookkeeping `mkstemp` needs for rollback.
pub struct ComFs {
    /// CWD this tx started with (the real process CWD at `Tx::begin`).
    inicwd: RawFd,
    /// CWD after any `fchdir` calls in this tx; `*at` operations resolve
    /// relative paths against this, never the real process CWD.
    newcwd: RawFd,
    mkstemps: Vec<MkstempRecord>,
}

impl ComFs {
    /// Start a new VFS module with `cwd_fildes` (typically `AT_FDCWD` or an
    /// explicit open directory descriptor) as both the initial and current
    /// working directory.
    #[must_use]
    pub fn new(cwd_fildes: RawFd) -> Self {
        Self {
            inicwd: cwd_fildes,
            newcwd: cwd_fildes,
            mkstemps: Vec::new(),
        }
    }

    fn cwd(&self) -> BorrowedFd<'_> {
        unsafe { BorrowedFd::borrow_raw(self.newcwd) }
    }

    /// The raw descriptor `*at` calls currently resolve relative paths
    /// against, for callers (like `tx_getcwd`) that need to resolve it to a
    /// path themselves.
    #[must_use]
    pub fn cwd_fildes(&self) -> RawFd {
        self.newcwd
    }

    /// `fchdir(2)`: reference `fildes`, confirm it names a directory, and
    /// replace the tx-local CWD.
    pub fn fchdir_exec(&mut self, fildes: RawFd) -> Result<(), TxError> {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fildes) };
        let st = nix::sys::stat::fstat(borrowed).map_err(TxError::System)?;
        if !nix::sys::stat::SFlag::from_bits_truncate(st.st_mode).contains(nix::sys::stat::SFlag::S_IFDIR) {
            return Err(TxError::Domain);
        }
        self.newcwd = fildes;
        Ok(())
    }

    /// `fstatat(2)` relative to the tx CWD.
    pub fn stat_at(&self, path: &std::ffi::CStr, flags: AtFlags) -> Result<nix::sys::stat::FileStat, TxError> {
        fstatat(self.cwd(), path, flags).map_err(TxError::System)
    }

    /// `fchmodat(2)` relative to the tx CWD.
    pub fn chmod_at(&self, path: &std::ffi::CStr, mode: Mode) -> Result<(), TxError> {
        nix::sys::stat::fchmodat(self.cwd(), path, mode, FchmodatFlags::FollowSymlink).map_err(TxError::System)
    }

    /// `linkat(2)` relative to the tx CWD for both endpoints.
    pub fn link_at(&self, old: &std::ffi::CStr, new: &std::ffi::CStr) -> Result<(), TxError> {
        linkat(self.cwd(), old, self.cwd(), new, AtFlags::empty()).map_err(TxError::System)
    }

    /// `unlinkat(2)` relative to the tx CWD.
    pub fn unlink_at(&self, path: &std::ffi::CStr) -> Result<(), TxError> {
        unlinkat(self.cwd(), path, UnlinkatFlags::NoRemoveDir).map_err(TxError::System)
    }

    /// `mkdirat(2)` relative to the tx CWD.
    pub fn mkdir_at(&self, path: &std::ffi::CStr, mode: Mode) -> Result<(), TxError> {
        mkdirat(self.cwd(), path, mode).map_err(TxError::System)
    }

    /// `mkfifoat` relative to the tx CWD. `nix` only exposes the
    /// CWD-relative `mkfifo`, so a non-`AT_FDCWD` CWD is resolved through
    /// `/proc/self/fd/<n>/<relative path>`, mirroring the `mkstemp` rollback
    /// technique below.
    pub fn mkfifo_at(&self, path: &std::ffi::CStr, mode: Mode) -> Result<(), TxError> {
        if self.newcwd == nix::fcntl::AT_FDCWD {
            mkfifo(path, mode).map_err(TxError::System)
        } else {
            let resolved = self.resolve_via_proc_fd(path)?;
            mkfifo(resolved.as_c_str(), mode).map_err(TxError::System)
        }
    }

    /// `mknodat(2)` relative to the tx CWD.
    pub fn mknod_at(&self, path: &std::ffi::CStr, kind: nix::sys::stat::SFlag, mode: Mode, dev: u64) -> Result<(), TxError> {
        mknodat(self.cwd(), path, kind, mode, dev as libc::dev_t).map_err(TxError::System)
    }

    fn resolve_via_proc_fd(&self, path: &std::ffi::CStr) -> Result<CString, TxError> {
        let link = format!("/proc/self/fd/{}/{}", self.newcwd, path.to_string_lossy());
        CString::new(link).map_err(|_| TxError::Domain)
    }

    /// `mkstemp(3)`: create the file, then remember its `(dev, ino)` so
    /// abort can safely unlink it via `/proc/self/fd/<n>` even though the
    /// template has already been overwritten in place by the libc call.
    pub fn mkstemp_exec(&mut self, template: &mut [u8]) -> Result<RawFd, TxError> {
        let path = CString::new(&*template).map_err(|_| TxError::Domain)?;
        let raw_ptr = path.into_raw();
        let raw_fd = unsafe { libc::mkstemp(raw_ptr) };
        let path = unsafe { CString::from_raw(raw_ptr) };
        if raw_fd < 0 {
            return Err(TxError::last_os_error());
        }
        let bytes = path.as_bytes();
        template[..bytes.len()].copy_from_slice(bytes);
        let borrowed = unsafe { BorrowedFd::borrow_raw(raw_fd) };
        let st = nix::sys::stat::fstat(borrowed).map_err(TxError::System)?;
        self.mkstemps.push(MkstempRecord {
            fildes: raw_fd,
            dev: st.st_dev as u64,
            ino: st.st_ino as u64,
        });
        Ok(raw_fd)
    }

    /// Undo every `mkstemp` this tx created: read back the path through
    /// `/proc/self/fd/<n>`, re-`lstat` it, and only unlink if the inode
    /// still matches what was created (it may have already been replaced
    /// or unlinked by something else).
    pub fn undo_mkstemps(&mut self) {
        for record in self.mkstemps.drain(..) {
            let proc_path = format!("/proc/self/fd/{}", record.fildes);
            let Ok(target) = std::fs::read_link(&proc_path) else { continue };
            let Ok(st) = nix::sys::stat::lstat(target.as_path()) else { continue };
            if st.st_dev as u64 == record.dev && st.st_ino as u64 == record.ino {
                let _ = std::fs::remove_file(&target);
            }
        }
    }

    /// Drop the CWD override back to the transaction's starting directory,
    /// e.g. on abort.
    pub fn reset_cwd(&mut self) {
        self.newcwd = self.inicwd;
    }

    /// Commit-path cleanup: the files this tx `mkstemp`'d are staying
    /// around, so just drop the rollback bookkeeping for them.
    pub fn forget_mkstemps(&mut self) {
        self.mkstemps.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    #[test]
    fn mkstemp_undo_removes_untouched_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut template = dir.path().join("tmpXXXXXX").to_str().unwrap().as_bytes().to_vec();
        let mut comfs = ComFs::new(nix::fcntl::AT_FDCWD);
        let fildes = comfs.mkstemp_exec(&mut template).unwrap();
        comfs.undo_mkstemps();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        let _ = nix::unistd::close(fildes);
    }

    #[test]
    fn mkstemp_undo_spares_file_with_changed_inode() {
        let dir = tempfile::tempdir().unwrap();
        let mut template = dir.path().join("tmpXXXXXX").to_str().unwrap().as_bytes().to_vec();
        let mut comfs = ComFs::new(nix::fcntl::AT_FDCWD);
        let fildes = comfs.mkstemp_exec(&mut template).unwrap();
        let proc_path = format!("/proc/self/fd/{fildes}");
        let target = std::fs::read_link(&proc_path).unwrap();
        std::fs::remove_file(&target).unwrap();
        std::fs::write(&target, b"replaced").unwrap();
        comfs.undo_mkstemps();
        assert!(target.exists());
        let _ = nix::unistd::close(fildes);
    }

    #[test]
    fn reset_cwd_restores_initial_descriptor() {
        let mut comfs = ComFs::new(3);
        comfs.newcwd = 7;
        comfs.reset_cwd();
        assert_eq!(comfs.newcwd, 3);
    }
}
