//! Transactional FIFO queue.
//!
//! Grounded on `examples/original_source/modules/txlib/src/txqueue_tx.c` and
//! `picotm-txqueue.h`. Unlike [`crate::txlib::list`], a push must stay
//! invisible to every other transaction until commit — a concurrent
//! transaction could otherwise pop an entry this one hasn't committed yet.
//! So pushes buffer tx-locally and only move to the shared tail in
//! `apply_event`; a pop checks the local buffer's head first (a push then a
//! pop of the same entry in one tx cancels out, matching spec.md §4.10's
//! worked example) and otherwise pops the shared head, logging it so undo
//! can put it back.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{ArcRwLockWriteGuard, RawRwLock, RwLock};

use crate::error::TxError;
use crate::tx::{Module, Tx};

/// A value popped from shared state this tx; undo puts it back at the
/// front. Local pushes never reach the log until apply, so there's nothing
/// to log or undo for them — they're just entries sitting in `pushed`.
enum QueueEvent<T> {
    PoppedShared(T),
}

#[derive(Clone)]
pub struct TxQueue<T> {
    shared: Arc<RwLock<VecDeque<T>>>,
}

impl<T: Clone + Send + 'static> TxQueue<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(RwLock::new(VecDeque::new())),
        }
    }

    pub fn begin(&self, tx: &mut Tx) -> TxQueueHandle<T> {
        let module = TxQueueModule {
            shared: Arc::clone(&self.shared),
            guard: None,
            pushed: VecDeque::new(),
            log: Vec::new(),
        };
        let id = tx.register_module(module);
        TxQueueHandle {
            id,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T: Clone + Send + 'static> Default for TxQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

struct TxQueueModule<T> {
    shared: Arc<RwLock<VecDeque<T>>>,
    guard: Option<ArcRwLockWriteGuard<RawRwLock, VecDeque<T>>>,
    /// Entries this tx has pushed but not yet transferred to shared state.
    pushed: VecDeque<T>,
    log: Vec<QueueEvent<T>>,
}

impl<T: Clone + Send + 'static> TxQueueModule<T> {
    fn writer(&mut self) -> &mut ArcRwLockWriteGuard<RawRwLock, VecDeque<T>> {
        if self.guard.is_none() {
            self.guard = Some(self.shared.write_arc());
        }
        self.guard.as_mut().expect("just populated")
    }

    fn push(&mut self, value: T) {
        self.pushed.push_back(value);
    }

    /// Pop the local buffer's head if non-empty (a same-tx push/pop cancels
    /// out with no log entry), else the shared head.
    fn pop(&mut self) -> Option<T> {
        if let Some(value) = self.pushed.pop_front() {
            return Some(value);
        }
        let value = self.writer().pop_front()?;
        self.log.push(QueueEvent::PoppedShared(value.clone()));
        Some(value)
    }

    fn len(&mut self) -> usize {
        self.pushed.len() + self.writer().len()
    }

    fn is_empty(&mut self) -> bool {
        self.pushed.is_empty() && self.writer().is_empty()
    }
}

impl<T: Clone + Send + 'static> Module for TxQueueModule<T> {
    fn undo_event(&mut self) {
        // Local pushes never touched shared state and aren't logged; just
        // drop them. Shared pops get put back, in reverse pop order.
        self.pushed.clear();
        for event in self.log.drain(..).rev() {
            let QueueEvent::PoppedShared(value) = event;
            let shared = if self.guard.is_some() {
                self.guard.as_mut().expect("checked above")
            } else {
                self.guard.insert(self.shared.write_arc())
            };
            shared.push_front(value);
        }
    }

    fn apply_event(&mut self) -> Result<(), TxError> {
        // Transfer every still-pending local push onto the shared tail, in
        // push order.
        while let Some(value) = self.pushed.pop_front() {
            self.writer().push_back(value);
        }
        Ok(())
    }

    fn update_cc(&mut self) {
        self.log.clear();
        self.guard = None;
    }

    fn clear_cc(&mut self) {
        self.guard = None;
    }

    fn finish(&mut self) {
        self.pushed.clear();
        self.log.clear();
        self.guard = None;
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub struct TxQueueHandle<T> {
    id: usize,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: Clone + Send + 'static> TxQueueHandle<T> {
    fn module<'t>(&self, tx: &'t mut Tx) -> &'t mut TxQueueModule<T> {
        tx.module_mut(self.id)
    }

    pub fn push(&self, tx: &mut Tx, value: T) -> Result<(), TxError> {
        self.module(tx).push(value);
        Ok(())
    }

    pub fn pop(&self, tx: &mut Tx) -> Result<Option<T>, TxError> {
        Ok(self.module(tx).pop())
    }

    pub fn len(&self, tx: &mut Tx) -> Result<usize, TxError> {
        Ok(self.module(tx).len())
    }

    pub fn is_empty(&self, tx: &mut Tx) -> Result<bool, TxError> {
        Ok(self.module(tx).is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tx::atomically;

    #[test]
    fn push_then_pop_same_tx_cancels_out_with_no_commit_visible_change() {
        let q = TxQueue::<i32>::new();
        atomically(|tx| {
            let h = q.begin(tx);
            h.push(tx, 1)?;
            let popped = h.pop(tx)?;
            assert_eq!(popped, Some(1));
            Ok::<_, TxError>(())
        })
        .unwrap();

        let empty = atomically(|tx| {
            let h = q.begin(tx);
            h.is_empty(tx)
        })
        .unwrap();
        assert!(empty);
    }

    #[test]
    fn push_is_invisible_until_commit() {
        let q = TxQueue::<i32>::new();
        let mut tx = Tx::begin();
        let h = q.begin(&mut tx);
        h.push(&mut tx, 42).unwrap();
        // Not yet committed: a fresh transaction's view (via a second
        // handle's module instance) starts from the still-empty shared
        // state, since pushed entries only move over in apply_event.
        assert_eq!(h.len(&mut tx).unwrap(), 1);
        tx.commit().unwrap();

        let popped = atomically(|tx| {
            let h = q.begin(tx);
            h.pop(tx)
        })
        .unwrap();
        assert_eq!(popped, Some(42));
    }

    #[test]
    fn abort_restores_popped_shared_entry_to_front() {
        let q = TxQueue::<i32>::new();
        atomically(|tx| {
            let h = q.begin(tx);
            h.push(tx, 7)?;
            Ok::<_, TxError>(())
        })
        .unwrap();

        let mut tx = Tx::begin();
        let h = q.begin(&mut tx);
        assert_eq!(h.pop(&mut tx).unwrap(), Some(7));
        tx.abort();

        let popped = atomically(|tx| {
            let h = q.begin(tx);
            h.pop(tx)
        })
        .unwrap();
        assert_eq!(popped, Some(7));
    }

    #[test]
    fn queue_move_scenario() {
        // Queue states A = [e], B = []. pop A -> e, push B <- e, commit.
        // Expected: A = [], B = [e].
        let a = TxQueue::<i32>::new();
        let b = TxQueue::<i32>::new();
        atomically(|tx| {
            let ha = a.begin(tx);
            ha.push(tx, 99)?;
            Ok::<_, TxError>(())
        })
        .unwrap();

        atomically(|tx| {
            let ha = a.begin(tx);
            let hb = b.begin(tx);
            let e = ha.pop(tx)?.expect("A has one entry");
            hb.push(tx, e)?;
            Ok::<_, TxError>(())
        })
        .unwrap();

        let (a_empty, b_front) = atomically(|tx| {
            let ha = a.begin(tx);
            let hb = b.begin(tx);
            Ok::<_, TxError>((ha.is_empty(tx)?, hb.pop(tx)?))
        })
        .unwrap();
        assert!(a_empty);
        assert_eq!(b_front, Some(99));
    }
}
