//! Transactional doubly-ended list.
//!
//! Grounded on `examples/original_source/modules/txlib/src/txlist_tx.c` and
//! `picotm-txlist.h`: a list's shared state is a plain sequence guarded by
//! one rwlock; a transaction takes the writer side on first touch and holds
//! it until `update_cc`/`clear_cc`. Mutations apply directly to the shared
//! sequence and are undone by reversing them in reverse log order (the
//! symmetry property from spec.md §4.10) — there's no separate apply step.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{ArcRwLockWriteGuard, RawRwLock, RwLock};

use crate::error::TxError;
use crate::tx::{Module, Tx};

enum ListEvent<T> {
    Inserted(usize),
    Removed(usize, T),
}

/// Shared, cloneable handle to a transactional list's backing storage.
pub struct TxList<T> {
    shared: Arc<RwLock<VecDeque<T>>>,
    eq: Arc<dyn Fn(&T, &T) -> bool + Send + Sync>,
}

impl<T> Clone for TxList<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            eq: Arc::clone(&self.eq),
        }
    }
}

impl<T: Clone + Send + 'static + PartialEq> TxList<T> {
    /// A new, empty list using `T`'s own `PartialEq`.
    #[must_use]
    pub fn new() -> Self {
        Self::new_with_eq(|a, b| a == b)
    }
}

impl<T: Clone + Send + 'static> TxList<T> {
    /// A new, empty list using a caller-supplied equality function, for
    /// element types with no natural `PartialEq` or where `find` should
    /// match on something other than full equality.
    #[must_use]
    pub fn new_with_eq(eq: impl Fn(&T, &T) -> bool + Send + Sync + 'static) -> Self {
        Self {
            shared: Arc::new(RwLock::new(VecDeque::new())),
            eq: Arc::new(eq),
        }
    }

    /// Register this list with `tx` and hand back a per-tx handle. Safe to
    /// call more than once per transaction; each call registers a distinct
    /// module instance, so callers should call it once and keep the handle.
    pub fn begin(&self, tx: &mut Tx) -> TxListHandle<T> {
        let module = TxListModule {
            shared: Arc::clone(&self.shared),
            eq: Arc::clone(&self.eq),
            guard: None,
            log: Vec::new(),
        };
        let id = tx.register_module(module);
        TxListHandle {
            id,
            _marker: std::marker::PhantomData,
        }
    }
}

struct TxListModule<T> {
    shared: Arc<RwLock<VecDeque<T>>>,
    eq: Arc<dyn Fn(&T, &T) -> bool + Send + Sync>,
    guard: Option<ArcRwLockWriteGuard<RawRwLock, VecDeque<T>>>,
    log: Vec<ListEvent<T>>,
}

impl<T: Clone + Send + 'static> TxListModule<T> {
    fn writer(&mut self) -> &mut VecDeque<T> {
        if self.guard.is_none() {
            self.guard = Some(self.shared.write_arc());
        }
        self.guard.as_mut().expect("just populated")
    }

    fn push_back(&mut self, value: T) {
        let index = self.writer().len();
        self.writer().push_back(value);
        self.log.push(ListEvent::Inserted(index));
    }

    fn push_front(&mut self, value: T) {
        self.writer().push_front(value);
        self.log.push(ListEvent::Inserted(0));
    }

    fn insert(&mut self, index: usize, value: T) {
        self.writer().insert(index, value);
        self.log.push(ListEvent::Inserted(index));
    }

    fn erase(&mut self, index: usize) -> Option<T> {
        let removed = self.writer().remove(index)?;
        self.log.push(ListEvent::Removed(index, removed.clone()));
        Some(removed)
    }

    fn clear(&mut self) {
        loop {
            let len = self.writer().len();
            if len == 0 {
                break;
            }
            let value = self.writer().pop_back().expect("checked above");
            self.log.push(ListEvent::Removed(len - 1, value));
        }
    }

    fn find(&mut self, value: &T) -> Option<usize> {
        let eq = Arc::clone(&self.eq);
        self.writer().iter().position(|v| eq(v, value))
    }

    fn len(&mut self) -> usize {
        self.writer().len()
    }

    fn is_empty(&mut self) -> bool {
        self.writer().is_empty()
    }

    fn get(&mut self, index: usize) -> Option<T> {
        self.writer().get(index).cloned()
    }
}

impl<T: Clone + Send + 'static> Module for TxListModule<T> {
    fn undo_event(&mut self) {
        for event in self.log.drain(..).rev() {
            let shared = if self.guard.is_some() {
                self.guard.as_mut().expect("checked above")
            } else {
                self.guard.insert(self.shared.write_arc())
            };
            match event {
                ListEvent::Inserted(index) => {
                    shared.remove(index);
                }
                ListEvent::Removed(index, value) => {
                    shared.insert(index, value);
                }
            }
        }
    }

    fn update_cc(&mut self) {
        self.log.clear();
        self.guard = None;
    }

    fn clear_cc(&mut self) {
        self.guard = None;
    }

    fn finish(&mut self) {
        self.log.clear();
        self.guard = None;
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A transaction's view of one [`TxList`]. Cheap to copy; every method
/// re-borrows the module out of `tx` by id.
pub struct TxListHandle<T> {
    id: usize,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: Clone + Send + 'static> TxListHandle<T> {
    fn module<'t>(&self, tx: &'t mut Tx) -> &'t mut TxListModule<T> {
        tx.module_mut(self.id)
    }

    pub fn push_back(&self, tx: &mut Tx, value: T) -> Result<(), TxError> {
        self.module(tx).push_back(value);
        Ok(())
    }

    pub fn push_front(&self, tx: &mut Tx, value: T) -> Result<(), TxError> {
        self.module(tx).push_front(value);
        Ok(())
    }

    pub fn insert(&self, tx: &mut Tx, index: usize, value: T) -> Result<(), TxError> {
        self.module(tx).insert(index, value);
        Ok(())
    }

    pub fn erase(&self, tx: &mut Tx, index: usize) -> Result<Option<T>, TxError> {
        Ok(self.module(tx).erase(index))
    }

    /// Remove every entry, undoable like any other mutation: aborting
    /// restores them all in their original order.
    pub fn clear(&self, tx: &mut Tx) -> Result<(), TxError> {
        self.module(tx).clear();
        Ok(())
    }

    pub fn find(&self, tx: &mut Tx, value: &T) -> Result<Option<usize>, TxError> {
        Ok(self.module(tx).find(value))
    }

    pub fn len(&self, tx: &mut Tx) -> Result<usize, TxError> {
        Ok(self.module(tx).len())
    }

    pub fn is_empty(&self, tx: &mut Tx) -> Result<bool, TxError> {
        Ok(self.module(tx).is_empty())
    }

    pub fn get(&self, tx: &mut Tx, index: usize) -> Result<Option<T>, TxError> {
        Ok(self.module(tx).get(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tx::atomically;

    #[test]
    fn push_back_then_commit_is_visible_to_next_tx() {
        let list = TxList::<i32>::new();
        atomically(|tx| {
            let h = list.begin(tx);
            h.push_back(tx, 1)?;
            h.push_back(tx, 2)?;
            Ok::<_, TxError>(())
        })
        .unwrap();

        let len = atomically(|tx| {
            let h = list.begin(tx);
            h.len(tx)
        })
        .unwrap();
        assert_eq!(len, 2);
    }

    #[test]
    fn abort_undoes_inserts_in_reverse_order() {
        let list = TxList::<i32>::new();
        atomically(|tx| {
            let h = list.begin(tx);
            h.push_back(tx, 1)?;
            Ok::<_, TxError>(())
        })
        .unwrap();

        let mut tx = Tx::begin();
        let h = list.begin(&mut tx);
        h.push_back(&mut tx, 2).unwrap();
        h.push_front(&mut tx, 0).unwrap();
        tx.abort();

        let len = atomically(|tx| {
            let h = list.begin(tx);
            h.len(tx)
        })
        .unwrap();
        assert_eq!(len, 1);
        let value = atomically(|tx| {
            let h = list.begin(tx);
            h.get(tx, 0)
        })
        .unwrap();
        assert_eq!(value, Some(1));
    }

    #[test]
    fn erase_then_abort_restores_value_at_same_index() {
        let list = TxList::<i32>::new();
        atomically(|tx| {
            let h = list.begin(tx);
            h.push_back(tx, 10)?;
            h.push_back(tx, 20)?;
            h.push_back(tx, 30)?;
            Ok::<_, TxError>(())
        })
        .unwrap();

        let mut tx = Tx::begin();
        let h = list.begin(&mut tx);
        h.erase(&mut tx, 1).unwrap();
        tx.abort();

        let value = atomically(|tx| {
            let h = list.begin(tx);
            h.get(tx, 1)
        })
        .unwrap();
        assert_eq!(value, Some(20));
    }

    #[test]
    fn find_uses_custom_equality() {
        let list = TxList::<(i32, &'static str)>::new_with_eq(|a, b| a.0 == b.0);
        atomically(|tx| {
            let h = list.begin(tx);
            h.push_back(tx, (1, "a"))?;
            h.push_back(tx, (2, "b"))?;
            Ok::<_, TxError>(())
        })
        .unwrap();

        let index = atomically(|tx| {
            let h = list.begin(tx);
            h.find(tx, &(2, "ignored"))
        })
        .unwrap();
        assert_eq!(index, Some(1));
    }

    #[test]
    fn clear_empties_the_list_and_commits() {
        let list = TxList::<i32>::new();
        atomically(|tx| {
            let h = list.begin(tx);
            h.push_back(tx, 1)?;
            h.push_back(tx, 2)?;
            h.push_back(tx, 3)?;
            Ok::<_, TxError>(())
        })
        .unwrap();

        atomically(|tx| {
            let h = list.begin(tx);
            h.clear(tx)
        })
        .unwrap();

        let is_empty = atomically(|tx| {
            let h = list.begin(tx);
            h.is_empty(tx)
        })
        .unwrap();
        assert!(is_empty);
    }

    #[test]
    fn clear_then_abort_restores_every_entry_in_order() {
        let list = TxList::<i32>::new();
        atomically(|tx| {
            let h = list.begin(tx);
            h.push_back(tx, 1)?;
            h.push_back(tx, 2)?;
            h.push_back(tx, 3)?;
            Ok::<_, TxError>(())
        })
        .unwrap();

        let mut tx = Tx::begin();
        let h = list.begin(&mut tx);
        h.clear(&mut tx).unwrap();
        tx.abort();

        let (len, first, last) = atomically(|tx| {
            let h = list.begin(tx);
            Ok::<_, TxError>((h.len(tx)?, h.get(tx, 0)?, h.get(tx, 2)?))
        })
        .unwrap();
        assert_eq!(len, 3);
        assert_eq!(first, Some(1));
        assert_eq!(last, Some(3));
    }
}
