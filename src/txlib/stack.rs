//! Transactional LIFO stack.
//!
//! Grounded on `examples/original_source/modules/txlib/src/txstack_tx.c`
//! and `picotm-txstack.h`. Same local-buffer pattern as
//! [`crate::txlib::queue`] — a push must stay invisible to concurrent
//! transactions until commit — but LIFO: a pop checks this tx's local top
//! first, and `apply_event` transfers pending local pushes onto the shared
//! top in push order (so the last-pushed local entry ends up on top, same
//! as if it had mutated shared state directly).

use std::any::Any;
use std::sync::Arc;

use parking_lot::{ArcRwLockWriteGuard, RawRwLock, RwLock};

use crate::error::TxError;
use crate::tx::{Module, Tx};

enum StackEvent<T> {
    PoppedShared(T),
}

#[derive(Clone)]
pub struct TxStack<T> {
    shared: Arc<RwLock<Vec<T>>>,
}

impl<T: Clone + Send + 'static> TxStack<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn begin(&self, tx: &mut Tx) -> TxStackHandle<T> {
        let module = TxStackModule {
            shared: Arc::clone(&self.shared),
            guard: None,
            pushed: Vec::new(),
            log: Vec::new(),
        };
        let id = tx.register_module(module);
        TxStackHandle {
            id,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T: Clone + Send + 'static> Default for TxStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

struct TxStackModule<T> {
    shared: Arc<RwLock<Vec<T>>>,
    guard: Option<ArcRwLockWriteGuard<RawRwLock, Vec<T>>>,
    /// Entries this tx has pushed, most recent last (so `.pop()` is LIFO).
    pushed: Vec<T>,
    log: Vec<StackEvent<T>>,
}

impl<T: Clone + Send + 'static> TxStackModule<T> {
    fn writer(&mut self) -> &mut ArcRwLockWriteGuard<RawRwLock, Vec<T>> {
        if self.guard.is_none() {
            self.guard = Some(self.shared.write_arc());
        }
        self.guard.as_mut().expect("just populated")
    }

    fn push(&mut self, value: T) {
        self.pushed.push(value);
    }

    /// Pop this tx's local top if non-empty, else the shared top.
    fn pop(&mut self) -> Option<T> {
        if let Some(value) = self.pushed.pop() {
            return Some(value);
        }
        let value = self.writer().pop()?;
        self.log.push(StackEvent::PoppedShared(value.clone()));
        Some(value)
    }

    fn len(&mut self) -> usize {
        self.pushed.len() + self.writer().len()
    }

    fn is_empty(&mut self) -> bool {
        self.pushed.is_empty() && self.writer().is_empty()
    }
}

impl<T: Clone + Send + 'static> Module for TxStackModule<T> {
    fn undo_event(&mut self) {
        self.pushed.clear();
        for event in self.log.drain(..).rev() {
            let StackEvent::PoppedShared(value) = event;
            let shared = if self.guard.is_some() {
                self.guard.as_mut().expect("checked above")
            } else {
                self.guard.insert(self.shared.write_arc())
            };
            shared.push(value);
        }
    }

    fn apply_event(&mut self) -> Result<(), TxError> {
        for value in self.pushed.drain(..) {
            self.writer().push(value);
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

pub struct TxStackHandle<T> {
    id: usize,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: Clone + Send + 'static> TxStackHandle<T> {
    fn module<'t>(&self, tx: &'t mut Tx) -> &'t mut TxStackModule<T> {
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
    fn push_order_is_reversed_on_pop() {
        let s = TxStack::<i32>::new();
        atomically(|tx| {
            let h = s.begin(tx);
            h.push(tx, 1)?;
            h.push(tx, 2)?;
            h.push(tx, 3)?;
            Ok::<_, TxError>(())
        })
        .unwrap();

        let popped = atomically(|tx| {
            let h = s.begin(tx);
            Ok::<_, TxError>((h.pop(tx)?, h.pop(tx)?, h.pop(tx)?))
        })
        .unwrap();
        assert_eq!(popped, (Some(3), Some(2), Some(1)));
    }

    #[test]
    fn abort_restores_popped_shared_entry_to_top() {
        let s = TxStack::<i32>::new();
        atomically(|tx| {
            let h = s.begin(tx);
            h.push(tx, 5)?;
            Ok::<_, TxError>(())
        })
        .unwrap();

        let mut tx = Tx::begin();
        let h = s.begin(&mut tx);
        assert_eq!(h.pop(&mut tx).unwrap(), Some(5));
        tx.abort();

        let popped = atomically(|tx| {
            let h = s.begin(tx);
            h.pop(tx)
        })
        .unwrap();
        assert_eq!(popped, Some(5));
    }
}
