//! Transactional collections: list, queue, stack, multiset.
//!
//! Each collection's shared state lives behind an `Arc<RwLock<_>>`; a
//! transaction's handle acquires the appropriate side of that lock on first
//! touch and keeps it for the rest of the transaction (released in
//! `finish`), matching spec.md §4.10's "per-tx transaction object holds a
//! `rwstate` token on the global rwlock". List and multiset mutate the
//! shared structure directly and undo by reversing the mutation; queue and
//! stack buffer pushes tx-locally until commit so a concurrent transaction
//! can never observe or pop an uncommitted push.

pub mod list;
pub mod multiset;
pub mod queue;
pub mod stack;

pub use list::{TxList, TxListHandle};
pub use multiset::{TxMultiset, TxMultisetHandle};
pub use queue::{TxQueue, TxQueueHandle};
pub use stack::{TxStack, TxStackHandle};
