//! Software transactional memory for POSIX I/O.
//!
//! A transaction body runs arbitrary calls from [`posix`] (open, read, write,
//! stat, socket, ...) and [`txlib`]'s collections against a [`tx::Tx`]; the
//! library appends each call to a per-module event log as it executes, then
//! replays or reverses those logs when the transaction commits or aborts.
//! [`tx::atomically`] is the single entry point that drives a closure through
//! this retry loop to completion.
//!
//! Concurrency control is chosen per file type via [`config::ofd_type_set_ccmode`]:
//! optimistic timestamp validation for regular files by default, with
//! two-phase locking and a no-undo/irrevocable fallback available for cases
//! that need them. See `DESIGN.md` for how each module maps onto this model.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

mod cmap;
mod comfd;
mod comfs;
pub mod config;
pub mod error;
mod fd;
mod fdtx;
mod ofd;
mod ofdtx;
mod pagetree;
pub mod posix;
pub mod tx;
pub mod txlib;
mod rwlockmap;

pub use crate::config::{CcMode, OfdFlags, OfdTxFlags, OfdType, ValidateMode};
pub use crate::error::TxError;
pub use crate::tx::{Module, Tx, atomically};
