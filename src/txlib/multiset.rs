//! Transactional multiset: a binary tree keyed by a user-supplied key,
//! allowing duplicate keys.
//!
//! Grounded on `examples/original_source/modules/txlib/src/txmultiset_tx.c`
//! and `picotm-txmultiset.h`. The original walks a red-black tree directly;
//! `BTreeMap<K, Vec<V>>` gives the same O(log n) `find`/`lower_bound`/
//! `upper_bound` and O(log n + matches) `count` without hand-rolling tree
//! balancing. Like [`crate::txlib::list`], mutations apply directly to
//! shared state and undo reverses them — there's no local-buffer step,
//! since multiset membership (unlike queue/stack order) doesn't leak
//! anything a concurrent transaction could exploit by reading committed
//! state only.

use std::any::Any;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use parking_lot::{ArcRwLockWriteGuard, RawRwLock, RwLock};

use crate::error::TxError;
use crate::tx::{Module, Tx};

enum MultisetEvent<K, V> {
    Inserted(K),
    Removed(K, V),
}

#[derive(Clone)]
pub struct TxMultiset<K, V> {
    shared: Arc<RwLock<BTreeMap<K, Vec<V>>>>,
}

impl<K: Ord + Clone + Send + 'static, V: Clone + Send + 'static> TxMultiset<K, V> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    pub fn begin(&self, tx: &mut Tx) -> TxMultisetHandle<K, V> {
        let module = TxMultisetModule {
            shared: Arc::clone(&self.shared),
            guard: None,
            log: Vec::new(),
        };
        let id = tx.register_module(module);
        TxMultisetHandle {
            id,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<K: Ord + Clone + Send + 'static, V: Clone + Send + 'static> Default for TxMultiset<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

struct TxMultisetModule<K, V> {
    shared: Arc<RwLock<BTreeMap<K, Vec<V>>>>,
    guard: Option<ArcRwLockWriteGuard<RawRwLock, BTreeMap<K, Vec<V>>>>,
    log: Vec<MultisetEvent<K, V>>,
}

impl<K: Ord + Clone + Send + 'static, V: Clone + Send + 'static> TxMultisetModule<K, V> {
    fn writer(&mut self) -> &mut ArcRwLockWriteGuard<RawRwLock, BTreeMap<K, Vec<V>>> {
        if self.guard.is_none() {
            self.guard = Some(self.shared.write_arc());
        }
        self.guard.as_mut().expect("just populated")
    }

    fn insert(&mut self, key: K, value: V) {
        self.writer().entry(key.clone()).or_default().push(value);
        self.log.push(MultisetEvent::Inserted(key));
    }

    /// Remove one arbitrary entry under `key`, returning its value.
    fn remove_one(&mut self, key: &K) -> Option<V> {
        let writer = self.writer();
        let values = writer.get_mut(key)?;
        let value = values.pop()?;
        if values.is_empty() {
            writer.remove(key);
        }
        self.log.push(MultisetEvent::Removed(key.clone(), value.clone()));
        Some(value)
    }

    /// Remove every entry under every key, one `remove_one` at a time so each
    /// removal is logged the same way a caller-driven one would be.
    fn clear(&mut self) {
        let keys: Vec<K> = self.writer().keys().cloned().collect();
        for key in keys {
            while self.remove_one(&key).is_some() {}
        }
    }

    fn find(&mut self, key: &K) -> Option<V> {
        self.writer().get(key).and_then(|values| values.last().cloned())
    }

    fn count(&mut self, key: &K) -> usize {
        self.writer().get(key).map_or(0, Vec::len)
    }

    fn lower_bound(&mut self, key: &K) -> Option<K> {
        self.writer()
            .range((Bound::Included(key.clone()), Bound::Unbounded))
            .next()
            .map(|(k, _)| k.clone())
    }

    fn upper_bound(&mut self, key: &K) -> Option<K> {
        self.writer()
            .range((Bound::Excluded(key.clone()), Bound::Unbounded))
            .next()
            .map(|(k, _)| k.clone())
    }

    fn len(&mut self) -> usize {
        self.writer().values().map(Vec::len).sum()
    }

    fn is_empty(&mut self) -> bool {
        self.writer().is_empty()
    }
}

impl<K: Ord + Clone + Send + 'static, V: Clone + Send + 'static> Module for TxMultisetModule<K, V> {
    fn undo_event(&mut self) {
        for event in self.log.drain(..).rev() {
            let writer = if self.guard.is_some() {
                self.guard.as_mut().expect("checked above")
            } else {
                self.guard.insert(self.shared.write_arc())
            };
            match event {
                MultisetEvent::Inserted(key) => {
                    if let Some(values) = writer.get_mut(&key) {
                        values.pop();
                        if values.is_empty() {
                            writer.remove(&key);
                        }
                    }
                }
                MultisetEvent::Removed(key, value) => {
                    writer.entry(key).or_default().push(value);
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

pub struct TxMultisetHandle<K, V> {
    id: usize,
    _marker: std::marker::PhantomData<fn() -> (K, V)>,
}

impl<K: Ord + Clone + Send + 'static, V: Clone + Send + 'static> TxMultisetHandle<K, V> {
    fn module<'t>(&self, tx: &'t mut Tx) -> &'t mut TxMultisetModule<K, V> {
        tx.module_mut(self.id)
    }

    pub fn insert(&self, tx: &mut Tx, key: K, value: V) -> Result<(), TxError> {
        self.module(tx).insert(key, value);
        Ok(())
    }

    pub fn remove_one(&self, tx: &mut Tx, key: &K) -> Result<Option<V>, TxError> {
        Ok(self.module(tx).remove_one(key))
    }

    pub fn find(&self, tx: &mut Tx, key: &K) -> Result<Option<V>, TxError> {
        Ok(self.module(tx).find(key))
    }

    /// Remove every entry under every key, undoable like any other mutation:
    /// aborting restores the whole multiset.
    pub fn clear(&self, tx: &mut Tx) -> Result<(), TxError> {
        self.module(tx).clear();
        Ok(())
    }

    pub fn count(&self, tx: &mut Tx, key: &K) -> Result<usize, TxError> {
        Ok(self.module(tx).count(key))
    }

    pub fn lower_bound(&self, tx: &mut Tx, key: &K) -> Result<Option<K>, TxError> {
        Ok(self.module(tx).lower_bound(key))
    }

    pub fn upper_bound(&self, tx: &mut Tx, key: &K) -> Result<Option<K>, TxError> {
        Ok(self.module(tx).upper_bound(key))
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
    fn count_and_bounds_after_duplicate_keys() {
        let ms = TxMultiset::<i32, &'static str>::new();
        atomically(|tx| {
            let h = ms.begin(tx);
            h.insert(tx, 1, "a")?;
            h.insert(tx, 1, "b")?;
            h.insert(tx, 5, "c")?;
            Ok::<_, TxError>(())
        })
        .unwrap();

        let (count, lower, upper) = atomically(|tx| {
            let h = ms.begin(tx);
            Ok::<_, TxError>((h.count(tx, &1)?, h.lower_bound(tx, &2)?, h.upper_bound(tx, &1)?))
        })
        .unwrap();
        assert_eq!(count, 2);
        assert_eq!(lower, Some(5));
        assert_eq!(upper, Some(5));
    }

    #[test]
    fn abort_restores_removed_entry() {
        let ms = TxMultiset::<i32, &'static str>::new();
        atomically(|tx| {
            let h = ms.begin(tx);
            h.insert(tx, 1, "a")?;
            Ok::<_, TxError>(())
        })
        .unwrap();

        let mut tx = Tx::begin();
        let h = ms.begin(&mut tx);
        assert_eq!(h.remove_one(&mut tx, &1).unwrap(), Some("a"));
        tx.abort();

        let count = atomically(|tx| {
            let h = ms.begin(tx);
            h.count(tx, &1)
        })
        .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn abort_undoes_insert() {
        let ms = TxMultiset::<i32, &'static str>::new();
        let mut tx = Tx::begin();
        let h = ms.begin(&mut tx);
        h.insert(&mut tx, 3, "x").unwrap();
        tx.abort();

        let is_empty = atomically(|tx| {
            let h = ms.begin(tx);
            h.is_empty(tx)
        })
        .unwrap();
        assert!(is_empty);
    }

    #[test]
    fn clear_empties_every_key_and_commits() {
        let ms = TxMultiset::<i32, &'static str>::new();
        atomically(|tx| {
            let h = ms.begin(tx);
            h.insert(tx, 1, "a")?;
            h.insert(tx, 1, "b")?;
            h.insert(tx, 5, "c")?;
            Ok::<_, TxError>(())
        })
        .unwrap();

        atomically(|tx| {
            let h = ms.begin(tx);
            h.clear(tx)
        })
        .unwrap();

        let is_empty = atomically(|tx| {
            let h = ms.begin(tx);
            h.is_empty(tx)
        })
        .unwrap();
        assert!(is_empty);
    }

    #[test]
    fn clear_then_abort_restores_all_entries() {
        let ms = TxMultiset::<i32, &'static str>::new();
        atomically(|tx| {
            let h = ms.begin(tx);
            h.insert(tx, 1, "a")?;
            h.insert(tx, 1, "b")?;
            Ok::<_, TxError>(())
        })
        .unwrap();

        let mut tx = Tx::begin();
        let h = ms.begin(&mut tx);
        h.clear(&mut tx).unwrap();
        tx.abort();

        let count = atomically(|tx| {
            let h = ms.begin(tx);
            h.count(tx, &1)
        })
        .unwrap();
        assert_eq!(count, 2);
    }
}
