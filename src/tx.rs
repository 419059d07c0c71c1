//! Per-thread transaction context, the module callback bundle, and the
//! commit/abort driver that walks every registered module through the
//! five-phase commit protocol (or its mirror-image abort protocol).
//!
//! [`ComFd`] and [`ComFs`] are registered unconditionally, since every
//! transaction touches the POSIX I/O surface. A txlib collection
//! ([`crate::txlib`]) registers itself into the same transaction on first
//! use via [`Tx::register_module`], which hands back the small integer id
//! `picotm_register_module` returns in the original — used here to fetch
//! the module back out of the registry with [`Tx::module_mut`].

use std::any::Any;
use std::sync::OnceLock;

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::comfd::ComFd;
use crate::comfs::ComFs;
use crate::error::TxError;

/// The callback bundle a module contributes to the commit/abort driver.
///
/// Default bodies are provided for modules that have nothing to do in a
/// given phase (e.g. [`ComFs`]'s operations run directly and have no commit
/// validation step).
pub trait Module: Any {
    /// Acquire any coarse module-level locks needed before validation.
    fn lock(&self) -> Result<(), TxError> {
        Ok(())
    }
    /// Release locks taken by `lock`, used only if a later module's `lock`
    /// fails partway through phase 1.
    fn unlock(&self) {}
    /// Confirm every read this transaction made is still current.
    fn is_valid(&self) -> Result<(), TxError> {
        Ok(())
    }
    /// Replay this module's event log forward, making its effects visible.
    ///
    /// Most modules mutate shared state directly at exec time and have
    /// nothing left to do here (the symmetry property from spec.md §4.10);
    /// a few (the transactional queue and stack) buffer pushes tx-locally
    /// and transfer them to shared state only now, which is why this takes
    /// `&mut self` rather than `&self`.
    fn apply_event(&mut self) -> Result<(), TxError> {
        Ok(())
    }
    /// Replay this module's event log in reverse, undoing its effects.
    fn undo_event(&mut self) {}
    /// Release locks and publish version bumps after a successful commit.
    fn update_cc(&mut self) {}
    /// Release locks held for rollback after an abort.
    fn clear_cc(&mut self) {}
    /// Drop all per-transaction state; called after both commit and abort.
    fn finish(&mut self) {}
    /// Downcast support for [`Tx::module_mut`]; every implementor just
    /// returns `self`.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl Module for ComFd {
    fn lock(&self) -> Result<(), TxError> {
        self.pre_commit()
    }
    fn is_valid(&self) -> Result<(), TxError> {
        self.validate()
    }
    fn apply_event(&mut self) -> Result<(), TxError> {
        ComFd::apply_event(self)
    }
    fn undo_event(&mut self) {
        ComFd::undo_event(self);
    }
    fn update_cc(&mut self) {
        self.updatecc();
    }
    fn clear_cc(&mut self) {
        ComFd::clear_cc(self);
    }
    fn finish(&mut self) {
        ComFd::finish(self);
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl Module for ComFs {
    fn undo_event(&mut self) {
        self.undo_mkstemps();
        self.reset_cwd();
    }
    fn finish(&mut self) {
        self.forget_mkstemps();
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Process-wide gate serializing every thread behind one irrevocable
/// transaction. While held, [`Tx::begin`] blocks new transactions from
/// starting; it is released from the irrevocable transaction's `finish`.
struct IrrevocableGate {
    held: Mutex<bool>,
    released: Condvar,
}

impl IrrevocableGate {
    fn new() -> Self {
        Self {
            held: Mutex::new(false),
            released: Condvar::new(),
        }
    }

    fn wait_until_clear(&self) {
        let mut held = self.held.lock();
        while *held {
            self.released.wait(&mut held);
        }
    }

    fn acquire(&self) {
        *self.held.lock() = true;
    }

    fn release(&self) {
        *self.held.lock() = false;
        self.released.notify_all();
    }
}

static IRREVOCABLE_GATE: OnceLock<IrrevocableGate> = OnceLock::new();

fn irrevocable_gate() -> &'static IrrevocableGate {
    IRREVOCABLE_GATE.get_or_init(IrrevocableGate::new)
}

/// One thread's in-flight transaction: the two fixed modules, any modules
/// registered dynamically (txlib collections), and whether this transaction
/// has escalated to irrevocable mode.
pub struct Tx {
    pub(crate) comfd: ComFd,
    pub(crate) comfs: ComFs,
    extra: Vec<Box<dyn Module>>,
    irrevocable: bool,
}

impl Tx {
    /// Start a new transaction. Blocks until no other transaction in the
    /// process is irrevocable.
    #[must_use]
    pub fn begin() -> Self {
        irrevocable_gate().wait_until_clear();
        Self::new_modules(false)
    }

    /// Start the retry of a transaction that has already escalated to
    /// irrevocable mode: the calling thread already holds the gate, so this
    /// must not wait on it again.
    #[must_use]
    fn begin_irrevocable() -> Self {
        Self::new_modules(true)
    }

    fn new_modules(irrevocable: bool) -> Self {
        Self {
            comfd: ComFd::new(),
            comfs: ComFs::new(nix::fcntl::AT_FDCWD),
            extra: Vec::new(),
            irrevocable,
        }
    }

    fn all_modules(&mut self) -> Vec<&mut dyn Module> {
        let mut modules: Vec<&mut dyn Module> = vec![&mut self.comfd, &mut self.comfs];
        modules.extend(self.extra.iter_mut().map(|m| m.as_mut() as &mut dyn Module));
        modules
    }

    /// Register a module with this transaction, returning the id later
    /// passed to [`Tx::module_mut`]. Mirrors `picotm_register_module`'s
    /// small-integer module ids.
    pub fn register_module<M: Module + 'static>(&mut self, module: M) -> usize {
        self.extra.push(Box::new(module));
        let id = self.extra.len() - 1;
        debug!("registered module {id} ({})", std::any::type_name::<M>());
        id
    }

    /// Fetch a previously registered module back out by id and type.
    ///
    /// # Panics
    ///
    /// Panics if `id` is out of range or was registered with a different
    /// type than `M`.
    pub fn module_mut<M: Module + 'static>(&mut self, id: usize) -> &mut M {
        self.extra[id]
            .as_any_mut()
            .downcast_mut::<M>()
            .expect("module_mut called with the wrong type for this id")
    }

    /// Escalate this transaction to irrevocable mode: no other transaction
    /// may start until this one finishes, and exec paths that would
    /// otherwise return [`TxError::NoUndo`] may now run directly.
    pub fn mark_irrevocable(&mut self) {
        if !self.irrevocable {
            warn!("escalating transaction to irrevocable mode");
            irrevocable_gate().acquire();
            self.irrevocable = true;
        }
    }

    /// Whether this transaction has escalated to irrevocable mode.
    #[must_use]
    pub fn is_irrevocable(&self) -> bool {
        self.irrevocable
    }

    /// Run the five-phase commit protocol. On a validation conflict, runs
    /// the abort protocol instead and returns the conflicting error so the
    /// caller can retry.
    pub fn commit(&mut self) -> Result<(), TxError> {
        let mut locked = 0;
        let mut lock_err = None;
        for module in self.all_modules() {
            match module.lock() {
                Ok(()) => locked += 1,
                Err(err) => {
                    lock_err = Some(err);
                    break;
                }
            }
        }
        if let Some(err) = lock_err {
            warn!("commit: lock phase failed: {err}");
            for module in self.all_modules().into_iter().take(locked) {
                module.unlock();
            }
            self.abort();
            return Err(err);
        }
        for module in self.all_modules() {
            if let Err(err) = module.is_valid() {
                debug!("commit: validation conflict: {err}");
                self.abort();
                return Err(err);
            }
        }
        for module in self.all_modules() {
            if let Err(err) = module.apply_event() {
                warn!("commit: apply failed: {err}");
                self.abort();
                return Err(err);
            }
        }
        for module in self.all_modules() {
            module.update_cc();
        }
        for module in self.all_modules() {
            module.finish();
        }
        self.release_irrevocable();
        debug!("transaction committed");
        Ok(())
    }

    /// Run the abort protocol: undo every module's log in reverse, release
    /// locks, and finish.
    pub fn abort(&mut self) {
        for module in self.all_modules().into_iter().rev() {
            module.undo_event();
        }
        for module in self.all_modules() {
            module.clear_cc();
        }
        for module in self.all_modules() {
            module.finish();
        }
        self.release_irrevocable();
        debug!("transaction aborted");
    }

    fn release_irrevocable(&mut self) {
        if self.irrevocable {
            irrevocable_gate().release();
            self.irrevocable = false;
        }
    }
}

/// Run `body` inside a transaction, retrying on conflict and escalating to
/// irrevocable mode on an unsupported operation, until it either commits or
/// returns an error neither of those cover.
///
/// This is the sole retry loop in the engine: every lower layer returns an
/// error rather than looping.
pub fn atomically<T>(mut body: impl FnMut(&mut Tx) -> Result<T, TxError>) -> Result<T, TxError> {
    let mut retry_irrevocable = false;
    loop {
        let mut tx = if retry_irrevocable { Tx::begin_irrevocable() } else { Tx::begin() };
        retry_irrevocable = false;
        match body(&mut tx) {
            Ok(value) => match tx.commit() {
                Ok(()) => return Ok(value),
                Err(err) if err.is_retryable() => continue,
                Err(err) if err.requires_irrevocable() => {
                    tx.mark_irrevocable();
                    retry_irrevocable = true;
                    continue;
                }
                Err(err) => return Err(err),
            },
            Err(err) => {
                tx.abort();
                if err.is_retryable() {
                    continue;
                }
                if err.requires_irrevocable() {
                    tx.mark_irrevocable();
                    retry_irrevocable = true;
                    continue;
                }
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_with_no_work_succeeds() {
        let mut tx = Tx::begin();
        assert!(tx.commit().is_ok());
    }

    #[test]
    fn abort_with_no_work_is_a_noop() {
        let mut tx = Tx::begin();
        tx.abort();
        assert!(!tx.is_irrevocable());
    }

    #[test]
    fn atomically_returns_body_value_on_commit() {
        let result = atomically(|_tx| Ok::<_, TxError>(42));
        assert_eq!(result, Ok(42));
    }

    #[test]
    fn atomically_surfaces_non_retryable_errors() {
        let result = atomically(|_tx| Err::<i32, _>(TxError::Domain));
        assert_eq!(result, Err(TxError::Domain));
    }

    #[test]
    fn mark_irrevocable_round_trips_the_gate() {
        let mut tx = Tx::begin();
        tx.mark_irrevocable();
        assert!(tx.is_irrevocable());
        tx.abort();
        assert!(!tx.is_irrevocable());
        // The gate is clear again, so a second transaction can start
        // without blocking.
        let _tx2 = Tx::begin();
    }
}
