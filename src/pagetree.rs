//! Sparse, lazily-allocated radix tree keyed by 64-bit offsets.
//!
//! A [`PageTree`] indexes arbitrary byte offsets down to a fixed-size leaf
//! page without allocating storage for unused ranges. It backs `CountMap`
//! (region version counters) and `RwLockMap` (region reader/writer locks).
//! Depth grows dynamically: inserting a higher offset than the tree
//! currently covers wraps the existing root in a fresh directory node.
//!
//! Interior references aren't expressible in safe Rust the way the C
//! original links directory slots directly to child nodes, so nodes live in
//! an append-only arena and are addressed by index. A node is reference
//! counted (`Arc`) so a lookup can release the arena lock before taking the
//! node's own lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::{Mutex, RwLock};

/// `log2` of the number of entries per page. 512 entries per page.
pub const PAGE_BITS: u32 = 9;
/// Number of entries in a leaf page / slots in a directory page.
pub const PAGE_SIZE: usize = 1 << PAGE_BITS;

type NodeId = u32;

enum Node<T> {
    Dir(Mutex<[Option<NodeId>; PAGE_SIZE]>),
    Leaf(Mutex<T>),
}

/// A handle to a single leaf page, keeping the page alive for as long as the
/// handle is held even if the tree itself grows a new root meanwhile.
pub struct PageHandle<T>(Arc<Node<T>>);

impl<T> PageHandle<T> {
    /// Lock the leaf page for exclusive access.
    pub fn lock(&self) -> parking_lot::MutexGuard<'_, T> {
        match self.0.as_ref() {
            Node::Leaf(m) => m.lock(),
            Node::Dir(_) => unreachable!("PageHandle always wraps a leaf node"),
        }
    }
}

fn capacity_for_depth(depth: u32) -> u64 {
    let bits = u64::from(depth + 1) * u64::from(PAGE_BITS);
    if bits >= 64 { u64::MAX } else { 1u64 << bits }
}

/// Global, concurrency-safe page tree. Each directory and leaf page is
/// guarded by its own lock, so two threads touching disjoint subtrees never
/// contend.
pub struct PageTree<T> {
    arena: RwLock<Vec<Arc<Node<T>>>>,
    root: Mutex<Option<NodeId>>,
    depth: AtomicU32,
}

impl<T> Default for PageTree<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PageTree<T> {
    /// An empty tree: no root, depth zero (a single leaf would cover
    /// `[0, PAGE_SIZE)`).
    #[must_use]
    pub fn new() -> Self {
        Self {
            arena: RwLock::new(Vec::new()),
            root: Mutex::new(None),
            depth: AtomicU32::new(0),
        }
    }

    fn push(&self, node: Node<T>) -> NodeId {
        let mut arena = self.arena.write();
        let id = u32::try_from(arena.len()).expect("page-tree arena exhausted");
        arena.push(Arc::new(node));
        id
    }

    fn get(&self, id: NodeId) -> Arc<Node<T>> {
        Arc::clone(&self.arena.read()[id as usize])
    }

    fn grow_root(&self) {
        let mut root = self.root.lock();
        let depth = self.depth.load(Ordering::Acquire);
        let mut slots: [Option<NodeId>; PAGE_SIZE] = [None; PAGE_SIZE];
        slots[0] = *root;
        let new_root = self.push(Node::Dir(Mutex::new(slots)));
        *root = Some(new_root);
        self.depth.store(depth + 1, Ordering::Release);
    }

    /// Find (creating on demand) the leaf page that owns `offset`,
    /// calling `create_leaf` exactly once if no leaf exists there yet.
    /// Idempotent: repeated lookups for the same offset return the same
    /// leaf.
    pub fn lookup(&self, offset: u64, create_leaf: impl FnOnce() -> T) -> PageHandle<T> {
        while offset >= capacity_for_depth(self.depth.load(Ordering::Acquire)) {
            self.grow_root();
        }
        let mut depth = self.depth.load(Ordering::Acquire);
        let mut create_leaf = Some(create_leaf);

        let root_id = {
            let mut root = self.root.lock();
            if root.is_none() {
                let id = if depth == 0 {
                    let f = create_leaf.take().expect("leaf created twice");
                    self.push(Node::Leaf(Mutex::new(f())))
                } else {
                    self.push(Node::Dir(Mutex::new([None; PAGE_SIZE])))
                };
                *root = Some(id);
            }
            root.unwrap()
        };

        let mut current = root_id;
        while depth > 0 {
            let shift = u64::from(depth) * u64::from(PAGE_BITS);
            let index = ((offset >> shift) & (PAGE_SIZE as u64 - 1)) as usize;
            let node = self.get(current);
            let Node::Dir(slots) = node.as_ref() else {
                unreachable!("descended into a leaf above depth 0")
            };
            let mut slots = slots.lock();
            current = match slots[index] {
                Some(child) => child,
                None => {
                    let child_is_leaf = depth == 1;
                    let child_id = if child_is_leaf {
                        let f = create_leaf.take().expect("leaf created twice");
                        self.push(Node::Leaf(Mutex::new(f())))
                    } else {
                        self.push(Node::Dir(Mutex::new([None; PAGE_SIZE])))
                    };
                    slots[index] = Some(child_id);
                    child_id
                }
            };
            depth -= 1;
        }

        let node = self.get(current);
        if !matches!(node.as_ref(), Node::Leaf(_)) {
            unreachable!("descent did not reach a leaf");
        }
        PageHandle(node)
    }

    /// Visit every existing leaf in ascending-offset order.
    pub fn for_each_page(&self, mut f: impl FnMut(u64, &PageHandle<T>)) {
        let Some(root_id) = *self.root.lock() else {
            return;
        };
        let depth = self.depth.load(Ordering::Acquire);
        self.walk(root_id, depth, 0, &mut f);
    }

    fn walk(&self, id: NodeId, depth: u32, base: u64, f: &mut impl FnMut(u64, &PageHandle<T>)) {
        let node = self.get(id);
        match node.as_ref() {
            Node::Leaf(_) => f(base, &PageHandle(Arc::clone(&node))),
            Node::Dir(slots) => {
                let slots = *slots.lock();
                let shift = u64::from(depth) * u64::from(PAGE_BITS);
                for (index, child) in slots.iter().enumerate() {
                    if let Some(child) = child {
                        let child_base = base + ((index as u64) << shift);
                        self.walk(*child, depth - 1, child_base, f);
                    }
                }
            }
        }
    }
}

impl<T> PageHandle<T> {
    /// Two handles refer to the same physical leaf page.
    #[must_use]
    pub fn same_page(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Per-transaction sparse cache of page-sized records, keyed by page index
/// (`offset >> PAGE_BITS`). Single-threaded: only the owning transaction
/// ever touches it, so no locking is needed here, only when copying data in
/// from or out to the global [`PageTree`].
#[derive(Debug, Default)]
pub struct PageSnapshot<T> {
    pages: HashMap<u64, T>,
}

impl<T> PageSnapshot<T> {
    /// A fresh, empty snapshot.
    #[must_use]
    pub fn new() -> Self {
        Self { pages: HashMap::new() }
    }

    /// Page index (offset divided by the page size) for `offset`.
    #[must_use]
    pub fn page_index(offset: u64) -> u64 {
        offset >> PAGE_BITS
    }

    /// Offset of the first byte/slot of page `index`.
    #[must_use]
    pub fn page_base(index: u64) -> u64 {
        index << PAGE_BITS
    }

    /// Returns the cached page, populating it via `fill` on first access.
    pub fn get_or_fill(&mut self, index: u64, fill: impl FnOnce() -> T) -> &mut T {
        self.pages.entry(index).or_insert_with(fill)
    }

    /// Returns the cached page if this snapshot has already touched it.
    #[must_use]
    pub fn get(&self, index: u64) -> Option<&T> {
        self.pages.get(&index)
    }

    /// Iterate all pages this snapshot has touched.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &T)> {
        self.pages.iter().map(|(&index, page)| (index, page))
    }

    /// Discard all cached state (used when a transaction restarts).
    pub fn clear(&mut self) {
        self.pages.clear();
    }
}

/// Inclusive-exclusive `[first_page, last_page]` range of page indices
/// touched by a byte range `[offset, offset + len)`.
#[must_use]
pub fn page_range(offset: u64, len: u64) -> std::ops::RangeInclusive<u64> {
    if len == 0 {
        let page = PageSnapshot::<()>::page_index(offset);
        return page..=page;
    }
    let last = offset + len - 1;
    PageSnapshot::<()>::page_index(offset)..=PageSnapshot::<()>::page_index(last)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_idempotent() {
        let tree: PageTree<u64> = PageTree::new();
        let a = tree.lookup(42, || 7);
        let b = tree.lookup(42, || panic!("should not be called twice"));
        assert!(a.same_page(&b));
        assert_eq!(*a.lock(), 7);
    }

    #[test]
    fn lookup_grows_root_for_large_offsets() {
        let tree: PageTree<u64> = PageTree::new();
        let far = (PAGE_SIZE as u64) * (PAGE_SIZE as u64) * 3 + 5;
        let leaf = tree.lookup(far, || 99);
        assert_eq!(*leaf.lock(), 99);
        // Still idempotent after growth.
        let again = tree.lookup(far, || panic!("should not re-create"));
        assert!(leaf.same_page(&again));
    }

    #[test]
    fn for_each_page_visits_in_ascending_order() {
        let tree: PageTree<u64> = PageTree::new();
        let offsets = [0u64, PAGE_SIZE as u64, (PAGE_SIZE as u64) * 5];
        for (i, &off) in offsets.iter().enumerate() {
            tree.lookup(off, || i as u64);
        }
        let mut seen = Vec::new();
        tree.for_each_page(|base, page| seen.push((base, *page.lock())));
        seen.sort_by_key(|(base, _)| *base);
        assert_eq!(seen.len(), 3);
        assert!(seen.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn page_range_handles_zero_length() {
        assert_eq!(page_range(10, 0), 0..=0);
    }

    #[test]
    fn snapshot_fills_lazily() {
        let mut ss: PageSnapshot<u64> = PageSnapshot::new();
        assert!(ss.get(0).is_none());
        *ss.get_or_fill(0, || 5) += 1;
        assert_eq!(ss.get(0), Some(&6));
    }
}
