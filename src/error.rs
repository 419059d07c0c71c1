//! Error taxonomy for the transactional I/O engine.
//!
//! Every internal operation returns `Result<_, TxError>`. The facade in
//! `crate::tx::atomically` is the sole place that interprets a `TxError` as
//! "abort and retry", "escalate to irrevocable and retry", or "hand to caller".

use std::{error, fmt};

use nix::errno::Errno;

/// Outcome of a transactional operation.
///
/// Mirrors the five-way split used throughout the C original: a syscall
/// failure, a conflict with a concurrent transaction, an operation with no
/// undo path in the current concurrency-control mode, a call that is out of
/// domain for the component that received it, and a dependency on an already
/// aborted peer transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxError {
    /// The underlying syscall failed; the wrapped errno is surfaced to the
    /// caller exactly as the POSIX call would report it.
    System(Errno),
    /// A concurrent commit invalidated state this transaction observed.
    Conflict,
    /// This call has no undo path under the descriptor's current CC mode.
    NoUndo,
    /// The call is out of domain for the component that received it.
    Domain,
    /// A transaction this one depends on has already aborted.
    PeerAbort,
}

impl TxError {
    /// True for the two outcomes that the retry loop in `tx::atomically`
    /// resolves by unwinding the transaction and trying again.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, TxError::Conflict | TxError::PeerAbort)
    }

    /// True when the retry loop should escalate the transaction to
    /// irrevocable mode before retrying.
    #[must_use]
    pub fn requires_irrevocable(self) -> bool {
        matches!(self, TxError::NoUndo)
    }

    /// Wrap the calling thread's `errno` as a `TxError::System`.
    #[must_use]
    pub fn last_os_error() -> Self {
        TxError::System(Errno::last())
    }
}

impl fmt::Display for TxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxError::System(errno) => write!(f, "system error: {errno}"),
            TxError::Conflict => write!(f, "conflict with a concurrent transaction"),
            TxError::NoUndo => write!(f, "operation has no undo path in current CC mode"),
            TxError::Domain => write!(f, "call out of domain for this component"),
            TxError::PeerAbort => write!(f, "dependent transaction aborted"),
        }
    }
}

impl error::Error for TxError {}

impl From<Errno> for TxError {
    fn from(errno: Errno) -> Self {
        TxError::System(errno)
    }
}

impl From<TxError> for std::io::Error {
    fn from(err: TxError) -> Self {
        match err {
            TxError::System(errno) => std::io::Error::from_raw_os_error(errno as i32),
            TxError::Conflict | TxError::PeerAbort => {
                std::io::Error::new(std::io::ErrorKind::WouldBlock, err.to_string())
            }
            TxError::NoUndo | TxError::Domain => {
                std::io::Error::new(std::io::ErrorKind::Unsupported, err.to_string())
            }
        }
    }
}
