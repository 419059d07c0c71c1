//! Cross-cutting tests for the transactional collections: round-trips
//! across separate committed transactions, concurrent access serialized by
//! each collection's shared lock, and a transaction that touches more than
//! one collection module at once.

use txio::tx::atomically;
use txio::txlib::{TxList, TxMultiset, TxQueue, TxStack};
use txio::{Tx, TxError};

#[test]
fn queue_round_trip_across_separate_transactions() {
    let q = TxQueue::<String>::new();

    atomically(|tx| {
        let h = q.begin(tx);
        h.push(tx, "entry".to_string())
    })
    .unwrap();

    let popped = atomically(|tx| {
        let h = q.begin(tx);
        h.pop(tx)
    })
    .unwrap();

    assert_eq!(popped, Some("entry".to_string()));
    let empty = atomically(|tx| {
        let h = q.begin(tx);
        h.is_empty(tx)
    })
    .unwrap();
    assert!(empty);
}

#[test]
fn concurrent_pushes_to_one_stack_are_serialized_not_lost() {
    let stack = TxStack::<i32>::new();
    let barrier = std::sync::Barrier::new(2);

    std::thread::scope(|scope| {
        for base in [0, 100] {
            let stack = stack.clone();
            let barrier = &barrier;
            scope.spawn(move || {
                barrier.wait();
                for i in 0..10 {
                    atomically(|tx| {
                        let h = stack.begin(tx);
                        h.push(tx, base + i)
                    })
                    .unwrap();
                }
            });
        }
    });

    let len = atomically(|tx| {
        let h = stack.begin(tx);
        h.len(tx)
    })
    .unwrap();
    assert_eq!(len, 20);
}

#[test]
fn abort_leaves_a_fresh_stack_untouched_for_the_next_transaction() {
    let stack = TxStack::<i32>::new();

    let mut tx = Tx::begin();
    let h = stack.begin(&mut tx);
    h.push(&mut tx, 1).unwrap();
    h.push(&mut tx, 2).unwrap();
    tx.abort();

    let is_empty = atomically(|tx| {
        let h = stack.begin(tx);
        h.is_empty(tx)
    })
    .unwrap();
    assert!(is_empty);
}

#[test]
fn one_transaction_can_move_an_entry_from_a_list_into_a_multiset() {
    let list = TxList::<(i32, &'static str)>::new_with_eq(|a, b| a.0 == b.0);
    let ms = TxMultiset::<i32, &'static str>::new();

    atomically(|tx| {
        let hl = list.begin(tx);
        hl.push_back(tx, (1, "alpha"))?;
        hl.push_back(tx, (2, "beta"))?;
        Ok::<_, TxError>(())
    })
    .unwrap();

    atomically(|tx| {
        let hl = list.begin(tx);
        let hm = ms.begin(tx);
        let index = hl.find(tx, &(1, "ignored"))?.expect("entry present");
        let (key, value) = hl.erase(tx, index)?.expect("erased entry");
        hm.insert(tx, key, value)
    })
    .unwrap();

    let (list_len, ms_count) = atomically(|tx| {
        let hl = list.begin(tx);
        let hm = ms.begin(tx);
        Ok::<_, TxError>((hl.len(tx)?, hm.count(tx, &1)?))
    })
    .unwrap();
    assert_eq!(list_len, 1);
    assert_eq!(ms_count, 1);
}

#[test]
fn queue_pop_on_empty_after_concurrent_drain_returns_none_not_an_error() {
    let q = TxQueue::<i32>::new();
    atomically(|tx| {
        let h = q.begin(tx);
        h.push(tx, 1)
    })
    .unwrap();

    let first = atomically(|tx| {
        let h = q.begin(tx);
        h.pop(tx)
    })
    .unwrap();
    assert_eq!(first, Some(1));

    let second = atomically(|tx| {
        let h = q.begin(tx);
        h.pop(tx)
    })
    .unwrap();
    assert_eq!(second, None);
}
