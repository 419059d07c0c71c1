//! The public POSIX-shaped facade: one free function per `tx_*` call,
//! each taking `&mut Tx` and mirroring its underlying syscall's signature
//! as closely as Rust's types allow.
//!
//! Regular-file and pipe I/O route through [`crate::comfd::ComFd`] and
//! [`crate::comfs::ComFs`], which is where the undo-logged, concurrency-
//! controlled behavior lives. Calls with no meaningful undo path under any
//! CC mode this engine implements — socket I/O, `fsync`/`sync`, `select` —
//! run only once a transaction has escalated to irrevocable (see
//! [`crate::tx::Tx::mark_irrevocable`]); until then they return
//! [`TxError::NoUndo`], which `atomically` turns into exactly that
//! escalation. This matches spec.md's irrevocability model: an irrevocable
//! transaction is guaranteed to run to completion, so performing these
//! calls for real at that point is sound.

use std::ffi::CStr;
use std::os::unix::io::RawFd;
use std::path::PathBuf;

use nix::fcntl::{self, AtFlags, FcntlArg, OFlag};
use nix::sys::select::FdSet;
use nix::sys::socket::SockaddrLike;
use nix::sys::stat::{FileStat, Mode, SFlag};
use nix::sys::time::TimeVal;
use nix::unistd::Whence;

use crate::error::TxError;
use crate::tx::Tx;

/// `F_GETFL`/`F_GETOWN`/`F_GETLK` and similar OFD-shared, read-only
/// `fcntl` commands, routed through [`ComFd::exec_fcntl_get`](crate::comfd::ComFd::exec_fcntl_get).
const FCNTL_GET: i32 = libc::F_GETFL;

fn require_irrevocable<T>(tx: &Tx, f: impl FnOnce() -> Result<T, TxError>) -> Result<T, TxError> {
    if !tx.is_irrevocable() {
        return Err(TxError::NoUndo);
    }
    f()
}

/// `rc < 0` means the raw libc call failed; everything else is success.
fn check(rc: i32) -> Result<i32, TxError> {
    if rc < 0 {
        return Err(TxError::last_os_error());
    }
    Ok(rc)
}

// ---- fd: descriptor lifecycle ---------------------------------------------

pub fn tx_open(tx: &mut Tx, path: &CStr, oflag: OFlag, mode: Mode) -> Result<RawFd, TxError> {
    tx.comfd.exec_open(path, oflag, mode)
}

pub fn tx_close(tx: &mut Tx, fildes: RawFd) -> Result<(), TxError> {
    tx.comfd.exec_close(fildes)
}

pub fn tx_dup(tx: &mut Tx, fildes: RawFd) -> Result<RawFd, TxError> {
    tx.comfd.exec_dup(fildes)
}

pub fn tx_pipe(tx: &mut Tx) -> Result<(RawFd, RawFd), TxError> {
    tx.comfd.exec_pipe()
}

// ---- fd: positioned and current-offset I/O --------------------------------

pub fn tx_pread(tx: &mut Tx, fildes: RawFd, off: u64, buf: &mut [u8]) -> Result<usize, TxError> {
    tx.comfd.exec_pread(fildes, off, buf)
}

pub fn tx_pwrite(tx: &mut Tx, fildes: RawFd, off: u64, buf: &[u8]) -> Result<usize, TxError> {
    tx.comfd.exec_pwrite(fildes, off, buf)
}

/// `read(2)`: reads from, then advances, the OFD's shared offset. Built from
/// `pread` plus two `lseek(SEEK_CUR, ...)` calls — the zero-offset one is
/// free in TS mode (spec.md §8's lseek boundary behavior).
pub fn tx_read(tx: &mut Tx, fildes: RawFd, buf: &mut [u8]) -> Result<usize, TxError> {
    let off = tx.comfd.exec_lseek(fildes, 0, Whence::SeekCur)?;
    let n = tx.comfd.exec_pread(fildes, off, buf)?;
    tx.comfd.exec_lseek(fildes, n as i64, Whence::SeekCur)?;
    Ok(n)
}

/// `write(2)`: same composition as [`tx_read`], in the write direction.
pub fn tx_write(tx: &mut Tx, fildes: RawFd, buf: &[u8]) -> Result<usize, TxError> {
    let off = tx.comfd.exec_lseek(fildes, 0, Whence::SeekCur)?;
    let n = tx.comfd.exec_pwrite(fildes, off, buf)?;
    tx.comfd.exec_lseek(fildes, n as i64, Whence::SeekCur)?;
    Ok(n)
}

pub fn tx_lseek(tx: &mut Tx, fildes: RawFd, offset: i64, whence: Whence) -> Result<u64, TxError> {
    tx.comfd.exec_lseek(fildes, offset, whence)
}

// ---- fd: fcntl, routed to FD- or OFD-level state by command ---------------

/// `fcntl(2)`, split by spec.md §4.11's domain-routing rule: `F_GETFD`/
/// `F_SETFD` are descriptor-local and always undoable; everything else is
/// OFD-shared and, for the mutating commands, requires irrevocable mode.
pub fn tx_fcntl(tx: &mut Tx, fildes: RawFd, arg: FcntlArg<'_>) -> Result<i32, TxError> {
    match arg {
        FcntlArg::F_GETFD => Ok(i32::from(tx.comfd.exec_fcntl_getfd(fildes)?)),
        FcntlArg::F_SETFD(flag) => {
            tx.comfd.exec_fcntl_setfd(fildes, flag.contains(fcntl::FdFlag::FD_CLOEXEC))?;
            Ok(0)
        }
        FcntlArg::F_GETFL => Ok(tx.comfd.exec_fcntl_get(fildes, FCNTL_GET)?),
        FcntlArg::F_SETFL(flags) => {
            let irrevocable = tx.is_irrevocable();
            tx.comfd.exec_fcntl_set(fildes, libc::F_SETFL, flags.bits(), irrevocable)?;
            Ok(0)
        }
        FcntlArg::F_SETLK(_) | FcntlArg::F_SETLKW(_) => {
            let irrevocable = tx.is_irrevocable();
            tx.comfd.exec_fcntl_set(fildes, libc::F_SETLK, 0, irrevocable)?;
            Ok(0)
        }
        _ => Err(TxError::Domain),
    }
}

pub fn tx_fsync(tx: &mut Tx, fildes: RawFd) -> Result<(), TxError> {
    require_irrevocable(tx, || check(unsafe { libc::fsync(fildes) }).map(|_| ()))
}

pub fn tx_sync(tx: &mut Tx) -> Result<(), TxError> {
    require_irrevocable(tx, || {
        unsafe { libc::sync() };
        Ok(())
    })
}

// ---- fd: sockets, always irrevocable ---------------------------------------
//
// This engine implements no undo-logged concurrency control for socket
// I/O (spec.md's default `ofd_type_set_ccmode(SOCKET, ..)` is `NOUNDO`); a
// transaction touching a socket escalates to irrevocable on first use and
// every call below then runs for real, exactly once, never rolled back.
// Built on raw `libc` rather than `nix::sys::socket`'s wrappers, the same
// way `OfdTx::exec_fcntl_set` reaches for `libc::fcntl` directly for a
// command shape nix's typed enum doesn't cover.

pub fn tx_socket(tx: &mut Tx, domain: i32, ty: i32, protocol: i32) -> Result<RawFd, TxError> {
    require_irrevocable(tx, || check(unsafe { libc::socket(domain, ty, protocol) }))
}

pub fn tx_bind(tx: &mut Tx, fildes: RawFd, addr: &dyn SockaddrLike) -> Result<(), TxError> {
    require_irrevocable(tx, || check(unsafe { libc::bind(fildes, addr.as_ptr(), addr.len()) }).map(|_| ()))
}

pub fn tx_listen(tx: &mut Tx, fildes: RawFd, backlog: i32) -> Result<(), TxError> {
    require_irrevocable(tx, || check(unsafe { libc::listen(fildes, backlog) }).map(|_| ()))
}

pub fn tx_connect(tx: &mut Tx, fildes: RawFd, addr: &dyn SockaddrLike) -> Result<(), TxError> {
    require_irrevocable(tx, || check(unsafe { libc::connect(fildes, addr.as_ptr(), addr.len()) }).map(|_| ()))
}

pub fn tx_accept(tx: &mut Tx, fildes: RawFd) -> Result<RawFd, TxError> {
    require_irrevocable(tx, || {
        check(unsafe { libc::accept(fildes, std::ptr::null_mut(), std::ptr::null_mut()) })
    })
}

pub fn tx_send(tx: &mut Tx, fildes: RawFd, buf: &[u8], flags: i32) -> Result<usize, TxError> {
    require_irrevocable(tx, || {
        let n = unsafe { libc::send(fildes, buf.as_ptr().cast(), buf.len(), flags) };
        check(n as i32).map(|n| n as usize)
    })
}

pub fn tx_recv(tx: &mut Tx, fildes: RawFd, buf: &mut [u8], flags: i32) -> Result<usize, TxError> {
    require_irrevocable(tx, || {
        let n = unsafe { libc::recv(fildes, buf.as_mut_ptr().cast(), buf.len(), flags) };
        check(n as i32).map(|n| n as usize)
    })
}

/// `how`: `libc::SHUT_RD`/`SHUT_WR`/`SHUT_RDWR`.
pub fn tx_shutdown(tx: &mut Tx, fildes: RawFd, how: i32) -> Result<(), TxError> {
    require_irrevocable(tx, || check(unsafe { libc::shutdown(fildes, how) }).map(|_| ()))
}

pub fn tx_select(
    tx: &mut Tx,
    nfds: Option<i32>,
    readfds: Option<&mut FdSet>,
    writefds: Option<&mut FdSet>,
    errorfds: Option<&mut FdSet>,
    timeout: Option<&mut TimeVal>,
) -> Result<i32, TxError> {
    require_irrevocable(tx, || nix::sys::select::select(nfds, readfds, writefds, errorfds, timeout).map_err(TxError::System))
}

// ---- fs: path and cwd operations ------------------------------------------

pub fn tx_chdir(tx: &mut Tx, path: &CStr) -> Result<(), TxError> {
    let fildes = tx.comfd.exec_open(path, OFlag::O_RDONLY | OFlag::O_DIRECTORY, Mode::empty())?;
    tx.comfs.fchdir_exec(fildes)
}

pub fn tx_fchdir(tx: &mut Tx, fildes: RawFd) -> Result<(), TxError> {
    tx.comfs.fchdir_exec(fildes)
}

/// `getcwd(3)`: not undo-logged (it only reads), resolved via
/// `/proc/self/fd/<n>` against the tx-local CWD override (or the process's
/// real CWD if no `tx_chdir`/`tx_fchdir` has run yet), the same
/// race-safe technique `mkstemp` undo uses.
pub fn tx_getcwd(tx: &Tx) -> Result<PathBuf, TxError> {
    let fildes = tx.comfs.cwd_fildes();
    let proc_path = if fildes == fcntl::AT_FDCWD {
        "/proc/self/cwd".to_string()
    } else {
        format!("/proc/self/fd/{fildes}")
    };
    std::fs::read_link(&proc_path).map_err(|_| TxError::System(nix::errno::Errno::ENOENT))
}

pub fn tx_chmod(tx: &mut Tx, path: &CStr, mode: Mode) -> Result<(), TxError> {
    tx.comfs.chmod_at(path, mode)
}

/// `fchmod(2)`: OFD-shared state with no undo path here, so it needs
/// irrevocable mode like the socket calls above.
pub fn tx_fchmod(tx: &mut Tx, fildes: RawFd, mode: Mode) -> Result<(), TxError> {
    require_irrevocable(tx, || nix::sys::stat::fchmod(fildes, mode))
}

pub fn tx_stat(tx: &mut Tx, path: &CStr) -> Result<FileStat, TxError> {
    tx.comfs.stat_at(path, AtFlags::empty())
}

pub fn tx_lstat(tx: &mut Tx, path: &CStr) -> Result<FileStat, TxError> {
    tx.comfs.stat_at(path, AtFlags::AT_SYMLINK_NOFOLLOW)
}

pub fn tx_fstat(tx: &mut Tx, fildes: RawFd) -> Result<FileStat, TxError> {
    let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fildes) };
    nix::sys::stat::fstat(borrowed).map_err(TxError::System)
}

pub fn tx_link(tx: &mut Tx, old: &CStr, new: &CStr) -> Result<(), TxError> {
    tx.comfs.link_at(old, new)
}

pub fn tx_unlink(tx: &mut Tx, path: &CStr) -> Result<(), TxError> {
    tx.comfs.unlink_at(path)
}

pub fn tx_mkdir(tx: &mut Tx, path: &CStr, mode: Mode) -> Result<(), TxError> {
    tx.comfs.mkdir_at(path, mode)
}

pub fn tx_mkfifo(tx: &mut Tx, path: &CStr, mode: Mode) -> Result<(), TxError> {
    tx.comfs.mkfifo_at(path, mode)
}

pub fn tx_mknod(tx: &mut Tx, path: &CStr, kind: SFlag, mode: Mode, dev: u64) -> Result<(), TxError> {
    tx.comfs.mknod_at(path, kind, mode, dev)
}

pub fn tx_mkstemp(tx: &mut Tx, template: &mut [u8]) -> Result<RawFd, TxError> {
    tx.comfs.mkstemp_exec(template)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tx::atomically;

    #[test]
    fn open_write_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = std::ffi::CString::new(dir.path().join("f").to_str().unwrap()).unwrap();

        atomically(|tx| {
            let fildes = tx_open(tx, &path, OFlag::O_CREAT | OFlag::O_RDWR, Mode::from_bits_truncate(0o600))?;
            tx_write(tx, fildes, b"hello")?;
            tx_close(tx, fildes)?;
            Ok::<_, TxError>(())
        })
        .unwrap();

        let read_back = atomically(|tx| {
            let fildes = tx_open(tx, &path, OFlag::O_RDONLY, Mode::empty())?;
            let mut buf = [0u8; 5];
            tx_read(tx, fildes, &mut buf)?;
            tx_close(tx, fildes)?;
            Ok::<_, TxError>(buf)
        })
        .unwrap();
        assert_eq!(&read_back, b"hello");
    }

    #[test]
    fn pipe_abort_closes_both_ends() {
        let mut tx = Tx::begin();
        let (r, w) = tx_pipe(&mut tx).unwrap();
        tx.abort();
        assert!(nix::unistd::close(r).is_err());
        assert!(nix::unistd::close(w).is_err());
    }

    #[test]
    fn mkstemp_then_abort_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut template = dir.path().join("tmpXXXXXX").to_str().unwrap().as_bytes().to_vec();

        let mut tx = Tx::begin();
        let fildes = tx_mkstemp(&mut tx, &mut template).unwrap();
        let proc_path = format!("/proc/self/fd/{fildes}");
        let target = std::fs::read_link(&proc_path).unwrap();
        tx.abort();

        assert!(!target.exists());
    }

    #[test]
    fn socket_call_before_irrevocable_returns_no_undo() {
        let mut tx = Tx::begin();
        let err = tx_socket(&mut tx, libc::AF_INET, libc::SOCK_STREAM, libc::IPPROTO_TCP).unwrap_err();
        assert_eq!(err, TxError::NoUndo);
        tx.abort();
    }
}
