//! Bin entries: list nodes, tree bins, and forwarding markers.
//!
//! A bin slot holds one of four states, modeled as an explicit sum type
//! rather than sentinel hash values: empty (a null slot), the head of a
//! linked list of [`Node`]s, a [`TreeBin`] holding a red-black tree of
//! [`TreeNode`]s, or a [`BinEntry::Moved`] marker forwarding to the table a
//! resize transferred the bin into.
//!
//! # Safety
//!
//! This module uses unsafe code to dereference epoch-managed pointers. The
//! invariants are:
//! - Every `Shared` dereferenced here was loaded from a live table or node
//!   link while an epoch guard was pinned; removed entries and replaced
//!   tables are retired with `defer_destroy`, so they outlive any guard that
//!   could have observed them
//! - Tree restructuring (rotations, rebalancing) only happens while the tree
//!   bin's write lock is held, so the only concurrent accesses are readers
//!   that either hold the shared lock (excluding restructuring) or walk the
//!   `next` list, which restructuring never touches
//! - A `Moved(t)` pointer is valid for as long as the guard that loaded the
//!   table containing the marker is alive: the forwarded table is only
//!   retired by a *later* resize, which must begin after the marker became
//!   unreachable

use std::borrow::Borrow;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::thread::{self, Thread};

use crossbeam_epoch::{Atomic, Guard, Owned, Shared};
use parking_lot::Mutex;

use crate::raw::Table;

/// Entry in a bin.
///
/// The head of a list bin is a `Node`; tree bins put a `Tree` at the head
/// and chain `TreeNode`s below it; `Moved` only ever appears as a bin head.
pub(crate) enum BinEntry<K, V> {
    Node(Node<K, V>),
    Tree(TreeBin<K, V>),
    TreeNode(TreeNode<K, V>),
    Moved(*const Table<K, V>),
}

// safety: the raw Moved pointer disables the auto impls; the pointee is a
// Table whose shared use is governed by the epoch protocol, so BinEntry is
// as Send/Sync as its key and value types allow.
unsafe impl<K, V> Send for BinEntry<K, V>
where
    K: Send,
    V: Send,
{
}

unsafe impl<K, V> Sync for BinEntry<K, V>
where
    K: Send + Sync,
    V: Send + Sync,
{
}

impl<K, V> BinEntry<K, V> {
    pub(crate) fn as_node(&self) -> Option<&Node<K, V>> {
        match self {
            BinEntry::Node(node) => Some(node),
            BinEntry::TreeNode(tree_node) => Some(&tree_node.node),
            _ => None,
        }
    }

    pub(crate) fn as_node_mut(&mut self) -> Option<&mut Node<K, V>> {
        match self {
            BinEntry::Node(node) => Some(node),
            BinEntry::TreeNode(tree_node) => Some(&mut tree_node.node),
            _ => None,
        }
    }

}

impl<K, V> BinEntry<K, V>
where
    K: Ord,
{
    /// Searches the bin headed by `bin` for `key`, following forwarding
    /// markers into newer tables and delegating to the tree search for tree
    /// bins.
    ///
    /// Returns the matching entry, or null. The caller decides visibility by
    /// inspecting the entry's value.
    ///
    /// # Safety
    ///
    /// `bin` must be a non-null pointer loaded from a live table under
    /// `guard`.
    pub(crate) unsafe fn find<'g, Q>(
        bin: Shared<'g, BinEntry<K, V>>,
        hash: u64,
        key: &Q,
        guard: &'g Guard,
    ) -> Shared<'g, BinEntry<K, V>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Ord,
    {
        // safety: guaranteed by the caller.
        match *unsafe { bin.deref() } {
            BinEntry::Node(_) | BinEntry::TreeNode(_) => {
                // list walk; `TreeNode` heads occur when a reader resumed
                // mid-way through a tree bin's list view.
                let mut entry = bin;
                loop {
                    // safety: every step was loaded from a live `next` link
                    // under `guard`; removed nodes are retired only after a
                    // grace period.
                    let node = unsafe { entry.deref() }
                        .as_node()
                        .expect("list bins link only nodes");
                    if node.hash == hash && node.key.borrow() == key {
                        return entry;
                    }
                    entry = node.next.load(Ordering::SeqCst, guard);
                    if entry.is_null() {
                        return Shared::null();
                    }
                }
            }
            BinEntry::Tree(ref tree_bin) => tree_bin.find(hash, key, guard),
            BinEntry::Moved(mut next_table) => {
                // safety: we got to this marker through a table loaded under
                // `guard`; the forwarded table is retired no earlier than the
                // marker itself, so it is valid while the guard lives (see
                // the module-level safety notes).
                loop {
                    let table = unsafe { &*next_table };
                    if table.is_empty() {
                        return Shared::null();
                    }
                    let bini = table.bini(hash);
                    let bin = table.bin(bini, guard);
                    if bin.is_null() {
                        return Shared::null();
                    }
                    // safety: the bin was loaded under `guard` from a live
                    // table.
                    match *unsafe { bin.deref() } {
                        BinEntry::Moved(yet_newer) => {
                            next_table = yet_newer;
                        }
                        _ => return unsafe { BinEntry::find(bin, hash, key, guard) },
                    }
                }
            }
        }
    }
}

/// Key-value entry.
///
/// A node with a null `value` pointer is invisible to readers: it is either
/// being created by a `compute` that has not produced a value yet, or being
/// torn down. Only nodes with a non-null value count toward the map's
/// apparent contents.
pub(crate) struct Node<K, V> {
    pub(crate) hash: u64,
    pub(crate) key: K,
    pub(crate) value: Atomic<V>,
    pub(crate) next: Atomic<BinEntry<K, V>>,
    /// Bin-head lock: meaningful only while this node is the first entry of
    /// a list bin. Writers acquire it, then re-validate that the bin slot
    /// still points here.
    pub(crate) lock: Mutex<()>,
}

impl<K, V> Node<K, V> {
    pub(crate) fn new(hash: u64, key: K, value: Atomic<V>) -> Self {
        Self {
            hash,
            key,
            value,
            next: Atomic::null(),
            lock: Mutex::new(()),
        }
    }
}

/* ---------------- Tree bins -------------- */

/// A node in a tree bin's red-black tree.
///
/// Tree nodes keep the same `next` traversal pointers as list nodes (plus
/// `prev`, needed to unlink on deletion), so iterators and readers that
/// cannot take the shared lock traverse tree bins exactly like lists.
pub(crate) struct TreeNode<K, V> {
    pub(crate) node: Node<K, V>,
    pub(crate) parent: Atomic<BinEntry<K, V>>,
    pub(crate) left: Atomic<BinEntry<K, V>>,
    pub(crate) right: Atomic<BinEntry<K, V>>,
    pub(crate) prev: Atomic<BinEntry<K, V>>,
    pub(crate) red: AtomicBool,
}

impl<K, V> TreeNode<K, V> {
    pub(crate) fn new(hash: u64, key: K, value: Atomic<V>) -> Self {
        Self {
            node: Node::new(hash, key, value),
            parent: Atomic::null(),
            left: Atomic::null(),
            right: Atomic::null(),
            prev: Atomic::null(),
            red: AtomicBool::new(false),
        }
    }

    /// Returns the tree node behind `bin`.
    ///
    /// # Safety
    ///
    /// `bin` must be a non-null pointer to a `BinEntry::TreeNode` that is
    /// protected by an epoch guard or by exclusive ownership.
    pub(crate) unsafe fn get<'g>(bin: Shared<'g, BinEntry<K, V>>) -> &'g TreeNode<K, V> {
        match unsafe { bin.deref() } {
            BinEntry::TreeNode(tree_node) => tree_node,
            _ => unreachable!("bin is not a tree node"),
        }
    }
}

impl<K, V> TreeNode<K, V>
where
    K: Ord,
{
    /// Standard binary-search-tree descent from `from`, ordered by
    /// `(hash, key)`.
    pub(crate) fn find_tree_node<'g, Q>(
        from: Shared<'g, BinEntry<K, V>>,
        hash: u64,
        key: &Q,
        guard: &'g Guard,
    ) -> Shared<'g, BinEntry<K, V>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Ord,
    {
        let mut p = from;
        while !p.is_null() {
            // safety: tree links are only mutated under the tree's write
            // lock and retired after a grace period; `p` was reached from a
            // live root under `guard`.
            let p_deref = unsafe { TreeNode::get(p) };
            p = match hash.cmp(&p_deref.node.hash) {
                std::cmp::Ordering::Less => p_deref.left.load(Ordering::SeqCst, guard),
                std::cmp::Ordering::Greater => p_deref.right.load(Ordering::SeqCst, guard),
                std::cmp::Ordering::Equal => match key.cmp(p_deref.node.key.borrow()) {
                    std::cmp::Ordering::Equal => return p,
                    std::cmp::Ordering::Less => p_deref.left.load(Ordering::SeqCst, guard),
                    std::cmp::Ordering::Greater => p_deref.right.load(Ordering::SeqCst, guard),
                },
            };
        }
        Shared::null()
    }
}

/// Write lock held.
const WRITER: i64 = 1;
/// A writer is parked, waiting for readers to drain.
const WAITER: i64 = 2;
/// Increment for each shared-lock holder.
const READER: i64 = 4;

/// A red-black tree over tree nodes, replacing an overlong bin list.
///
/// Tree bins carry their own locking discipline, distinct from bin-head
/// locking, because the root node changes across rotations. The `lock`
/// mutex is the bin's write lock (one mutating thread at a time);
/// `lock_state` is a reader/writer latch protecting the tree *structure*:
/// restructuring requires the exclusive state, searches take the shared
/// state, and a search that would otherwise block instead falls back to a
/// linear walk over the nodes' `next` list view, so reads never block.
pub(crate) struct TreeBin<K, V> {
    pub(crate) root: Atomic<BinEntry<K, V>>,
    pub(crate) first: Atomic<BinEntry<K, V>>,
    waiter: Atomic<Thread>,
    pub(crate) lock: Mutex<()>,
    lock_state: AtomicI64,
}

// safety: as for BinEntry; the parked Thread handle is Send + Sync.
unsafe impl<K, V> Send for TreeBin<K, V>
where
    K: Send,
    V: Send,
{
}

unsafe impl<K, V> Sync for TreeBin<K, V>
where
    K: Send + Sync,
    V: Send + Sync,
{
}

impl<K, V> TreeBin<K, V>
where
    K: Ord,
{
    /// Builds a tree bin from a `next`-linked chain of `TreeNode` entries.
    pub(crate) fn new<'g>(bin: Shared<'g, BinEntry<K, V>>, guard: &'g Guard) -> Self {
        let mut root = Shared::null();

        let mut x = bin;
        while !x.is_null() {
            // safety: we exclusively own the freshly-allocated chain; it has
            // not been shared with any other thread yet.
            let x_deref = unsafe { TreeNode::get(x) };
            let next = x_deref.node.next.load(Ordering::SeqCst, guard);
            x_deref.left.store(Shared::null(), Ordering::SeqCst);
            x_deref.right.store(Shared::null(), Ordering::SeqCst);

            if root.is_null() {
                x_deref.parent.store(Shared::null(), Ordering::SeqCst);
                x_deref.red.store(false, Ordering::SeqCst);
                root = x;
            } else {
                let hash = x_deref.node.hash;
                let key = &x_deref.node.key;
                let mut p = root;
                loop {
                    // safety: as above; the chain is unshared.
                    let p_deref = unsafe { TreeNode::get(p) };
                    let dir = match hash
                        .cmp(&p_deref.node.hash)
                        .then_with(|| key.cmp(&p_deref.node.key))
                    {
                        std::cmp::Ordering::Less => &p_deref.left,
                        _ => &p_deref.right,
                    };
                    let child = dir.load(Ordering::SeqCst, guard);
                    if child.is_null() {
                        x_deref.parent.store(p, Ordering::SeqCst);
                        dir.store(x, Ordering::SeqCst);
                        root = Self::balance_insertion(root, x, guard);
                        break;
                    }
                    p = child;
                }
            }
            x = next;
        }

        let bin_root = Atomic::null();
        bin_root.store(root, Ordering::SeqCst);
        let bin_first = Atomic::null();
        bin_first.store(bin, Ordering::SeqCst);

        Self {
            root: bin_root,
            first: bin_first,
            waiter: Atomic::null(),
            lock: Mutex::new(()),
            lock_state: AtomicI64::new(0),
        }
    }

    /// Searches for `key`.
    ///
    /// Takes the shared lock when it is free; while a writer holds or awaits
    /// the lock, steps along the linear `next` view instead, so this never
    /// blocks.
    pub(crate) fn find<'g, Q>(
        &'g self,
        hash: u64,
        key: &Q,
        guard: &'g Guard,
    ) -> Shared<'g, BinEntry<K, V>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Ord,
    {
        let mut element = self.first.load(Ordering::SeqCst, guard);
        while !element.is_null() {
            let state = self.lock_state.load(Ordering::SeqCst);
            if state & (WRITER | WAITER) != 0 {
                // structure may be mid-mutation; take one step through the
                // list view and re-check.
                // safety: list nodes are retired only after a grace period.
                let node = &unsafe { TreeNode::get(element) }.node;
                if node.hash == hash && node.key.borrow() == key {
                    return element;
                }
                element = node.next.load(Ordering::SeqCst, guard);
            } else if self
                .lock_state
                .compare_exchange(state, state + READER, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                let root = self.root.load(Ordering::SeqCst, guard);
                let found = if root.is_null() {
                    Shared::null()
                } else {
                    TreeNode::find_tree_node(root, hash, key, guard)
                };
                // release the shared lock; if we are the last reader and a
                // writer is parked, wake it.
                if self.lock_state.fetch_sub(READER, Ordering::SeqCst) == (READER | WAITER) {
                    let waiter = self.waiter.load(Ordering::SeqCst, guard);
                    if !waiter.is_null() {
                        // safety: waiter handles are retired via the epoch
                        // collector when replaced.
                        unsafe { waiter.deref() }.unpark();
                    }
                }
                return found;
            }
        }
        Shared::null()
    }

    /// Finds the node for `(hash, key)`, inserting a new one holding `value`
    /// if absent.
    ///
    /// Returns the pre-existing node, or null if `value` was inserted. When
    /// an existing node is returned, `value` has not been consumed and the
    /// caller still owns it. Caller must hold the bin's write mutex.
    pub(crate) fn find_or_put_tree_val<'g>(
        &'g self,
        hash: u64,
        key: K,
        value: Shared<'g, V>,
        guard: &'g Guard,
    ) -> Shared<'g, BinEntry<K, V>> {
        let mut p = self.root.load(Ordering::SeqCst, guard);
        if p.is_null() {
            // empty tree: the new node becomes the root.
            let tree_node = Owned::new(BinEntry::TreeNode(TreeNode::new(
                hash,
                key,
                Atomic::from(value),
            )))
            .into_shared(guard);
            self.root.store(tree_node, Ordering::SeqCst);
            self.first.store(tree_node, Ordering::SeqCst);
            return Shared::null();
        }

        loop {
            // safety: tree links are mutated only under the bin mutex, which
            // we hold; nodes are retired after a grace period.
            let p_deref = unsafe { TreeNode::get(p) };
            let dir = match hash
                .cmp(&p_deref.node.hash)
                .then_with(|| key.cmp(&p_deref.node.key))
            {
                std::cmp::Ordering::Equal => return p,
                std::cmp::Ordering::Less => &p_deref.left,
                std::cmp::Ordering::Greater => &p_deref.right,
            };
            let child = dir.load(Ordering::SeqCst, guard);
            if !child.is_null() {
                p = child;
                continue;
            }

            // attach a new leaf, prepended to the list view. Leaf
            // attachment is visible to lock-free list readers immediately
            // and to tree readers after the balancing below.
            let first = self.first.load(Ordering::SeqCst, guard);
            let tree_node = TreeNode::new(hash, key, Atomic::from(value));
            tree_node.node.next.store(first, Ordering::SeqCst);
            tree_node.parent.store(p, Ordering::SeqCst);
            tree_node.red.store(true, Ordering::SeqCst);
            let tree_node = Owned::new(BinEntry::TreeNode(tree_node)).into_shared(guard);

            self.first.store(tree_node, Ordering::SeqCst);
            if !first.is_null() {
                // safety: as above.
                unsafe { TreeNode::get(first) }
                    .prev
                    .store(tree_node, Ordering::SeqCst);
            }
            dir.store(tree_node, Ordering::SeqCst);

            // a red leaf under a black parent keeps the tree valid as-is;
            // only a red parent forces a rebalance.
            if p_deref.red.load(Ordering::SeqCst) {
                self.lock_root(guard);
                let root = self.root.load(Ordering::SeqCst, guard);
                let new_root = Self::balance_insertion(root, tree_node, guard);
                self.root.store(new_root, Ordering::SeqCst);
                self.unlock_root();
            }
            return Shared::null();
        }
    }

    /// Unlinks `p` from the list view and the tree.
    ///
    /// Returns `true` if the bin has become too small to stay a tree and the
    /// caller should untreeify it. Caller must hold the bin's write mutex.
    /// The node itself (and its value) are retired by the caller.
    pub(crate) fn remove_tree_node<'g>(
        &'g self,
        p: Shared<'g, BinEntry<K, V>>,
        guard: &'g Guard,
    ) -> bool {
        // safety throughout this method: we hold the bin mutex, so we are
        // the only thread mutating links; all pointers were reached from the
        // live bin under `guard`.
        let p_deref = unsafe { TreeNode::get(p) };

        // unlink from the list view first.
        let next = p_deref.node.next.load(Ordering::SeqCst, guard);
        let prev = p_deref.prev.load(Ordering::SeqCst, guard);
        if prev.is_null() {
            self.first.store(next, Ordering::SeqCst);
        } else {
            unsafe { TreeNode::get(prev) }
                .node
                .next
                .store(next, Ordering::SeqCst);
        }
        if !next.is_null() {
            unsafe { TreeNode::get(next) }
                .prev
                .store(prev, Ordering::SeqCst);
        }

        if self.first.load(Ordering::SeqCst, guard).is_null() {
            self.root.store(Shared::null(), Ordering::SeqCst);
            return true;
        }

        // too-small heuristic: a tree this sparse reverts to a list.
        let root = self.root.load(Ordering::SeqCst, guard);
        if root.is_null() {
            return true;
        }
        {
            let r = unsafe { TreeNode::get(root) };
            let rl = r.left.load(Ordering::SeqCst, guard);
            if r.right.load(Ordering::SeqCst, guard).is_null() || rl.is_null() {
                return true;
            }
            if unsafe { TreeNode::get(rl) }
                .left
                .load(Ordering::SeqCst, guard)
                .is_null()
            {
                return true;
            }
        }

        self.lock_root(guard);
        let mut r = self.root.load(Ordering::SeqCst, guard);
        let replacement;
        let pl = p_deref.left.load(Ordering::SeqCst, guard);
        let pr = p_deref.right.load(Ordering::SeqCst, guard);

        if !pl.is_null() && !pr.is_null() {
            // interior node: swap places with its in-order successor.
            let mut s = pr;
            loop {
                let sl = unsafe { TreeNode::get(s) }.left.load(Ordering::SeqCst, guard);
                if sl.is_null() {
                    break;
                }
                s = sl;
            }
            let s_deref = unsafe { TreeNode::get(s) };
            let color = s_deref.red.load(Ordering::SeqCst);
            s_deref
                .red
                .store(p_deref.red.load(Ordering::SeqCst), Ordering::SeqCst);
            p_deref.red.store(color, Ordering::SeqCst);

            let sr = s_deref.right.load(Ordering::SeqCst, guard);
            let pp = p_deref.parent.load(Ordering::SeqCst, guard);

            if s == pr {
                p_deref.parent.store(s, Ordering::SeqCst);
                s_deref.right.store(p, Ordering::SeqCst);
            } else {
                let sp = s_deref.parent.load(Ordering::SeqCst, guard);
                p_deref.parent.store(sp, Ordering::SeqCst);
                if !sp.is_null() {
                    let sp_deref = unsafe { TreeNode::get(sp) };
                    if s == sp_deref.left.load(Ordering::SeqCst, guard) {
                        sp_deref.left.store(p, Ordering::SeqCst);
                    } else {
                        sp_deref.right.store(p, Ordering::SeqCst);
                    }
                }
                s_deref.right.store(pr, Ordering::SeqCst);
                unsafe { TreeNode::get(pr) }.parent.store(s, Ordering::SeqCst);
            }

            p_deref.left.store(Shared::null(), Ordering::SeqCst);
            p_deref.right.store(sr, Ordering::SeqCst);
            if !sr.is_null() {
                unsafe { TreeNode::get(sr) }.parent.store(p, Ordering::SeqCst);
            }
            s_deref.left.store(pl, Ordering::SeqCst);
            unsafe { TreeNode::get(pl) }.parent.store(s, Ordering::SeqCst);
            s_deref.parent.store(pp, Ordering::SeqCst);
            if pp.is_null() {
                r = s;
            } else {
                let pp_deref = unsafe { TreeNode::get(pp) };
                if p == pp_deref.left.load(Ordering::SeqCst, guard) {
                    pp_deref.left.store(s, Ordering::SeqCst);
                } else {
                    pp_deref.right.store(s, Ordering::SeqCst);
                }
            }

            replacement = if sr.is_null() { p } else { sr };
        } else if !pl.is_null() {
            replacement = pl;
        } else if !pr.is_null() {
            replacement = pr;
        } else {
            replacement = p;
        }

        if replacement != p {
            let pp = p_deref.parent.load(Ordering::SeqCst, guard);
            unsafe { TreeNode::get(replacement) }
                .parent
                .store(pp, Ordering::SeqCst);
            if pp.is_null() {
                r = replacement;
            } else {
                let pp_deref = unsafe { TreeNode::get(pp) };
                if p == pp_deref.left.load(Ordering::SeqCst, guard) {
                    pp_deref.left.store(replacement, Ordering::SeqCst);
                } else {
                    pp_deref.right.store(replacement, Ordering::SeqCst);
                }
            }
            p_deref.left.store(Shared::null(), Ordering::SeqCst);
            p_deref.right.store(Shared::null(), Ordering::SeqCst);
            p_deref.parent.store(Shared::null(), Ordering::SeqCst);
        }

        let new_root = if p_deref.red.load(Ordering::SeqCst) {
            r
        } else {
            Self::balance_deletion(r, replacement, guard)
        };
        self.root.store(new_root, Ordering::SeqCst);

        if p == replacement {
            // leaf case: detach from the parent.
            let pp = p_deref.parent.load(Ordering::SeqCst, guard);
            if !pp.is_null() {
                let pp_deref = unsafe { TreeNode::get(pp) };
                if p == pp_deref.left.load(Ordering::SeqCst, guard) {
                    pp_deref.left.store(Shared::null(), Ordering::SeqCst);
                } else if p == pp_deref.right.load(Ordering::SeqCst, guard) {
                    pp_deref.right.store(Shared::null(), Ordering::SeqCst);
                }
                p_deref.parent.store(Shared::null(), Ordering::SeqCst);
            }
        }
        self.unlock_root();

        debug_assert!(Self::check_invariants(
            self.root.load(Ordering::SeqCst, guard),
            guard
        ));
        false
    }

    /* ---------------- Write lock -------------- */

    /// Acquires the exclusive structural lock. Caller holds the bin mutex,
    /// so the only competition is draining readers.
    fn lock_root(&self, guard: &Guard) {
        if self
            .lock_state
            .compare_exchange(0, WRITER, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.contended_lock(guard);
        }
    }

    fn unlock_root(&self) {
        self.lock_state.store(0, Ordering::SeqCst);
    }

    /// Spin/park until readers drain and the exclusive state is ours.
    fn contended_lock(&self, guard: &Guard) {
        let mut waiting = false;
        loop {
            let state = self.lock_state.load(Ordering::SeqCst);
            if state & !WAITER == 0 {
                if self
                    .lock_state
                    .compare_exchange(state, WRITER, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    if waiting {
                        let waiter = self.waiter.swap(Shared::null(), Ordering::SeqCst, guard);
                        if !waiter.is_null() {
                            // safety: no longer reachable; a reader that
                            // loaded it may still unpark a parked handle,
                            // so retire rather than drop in place.
                            unsafe { guard.defer_destroy(waiter) };
                        }
                    }
                    return;
                }
            } else if state & WAITER == 0 {
                if self
                    .lock_state
                    .compare_exchange(state, state | WAITER, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    waiting = true;
                    let previous =
                        self.waiter
                            .swap(Owned::new(thread::current()), Ordering::SeqCst, guard);
                    debug_assert!(previous.is_null());
                }
            } else if waiting {
                thread::park();
            }
            std::hint::spin_loop();
        }
    }

}

/* ---------------- Teardown -------------- */

impl<K, V> TreeBin<K, V> {
    /// Drops every tree node in this bin along with its value.
    ///
    /// Only called from table teardown, with exclusive ownership.
    pub(crate) fn drop_nodes_and_values(&mut self) {
        // safety: exclusive ownership; no other thread can reach the chain.
        let guard = unsafe { crossbeam_epoch::unprotected() };
        let mut element = self.first.swap(Shared::null(), Ordering::SeqCst, guard);
        self.root.store(Shared::null(), Ordering::SeqCst);
        while !element.is_null() {
            // safety: as above, we own the chain.
            let mut entry = unsafe { element.into_owned() };
            let node = entry
                .as_node_mut()
                .expect("tree bins chain only tree nodes");
            element = node.next.swap(Shared::null(), Ordering::SeqCst, guard);
            let value = node.value.swap(Shared::null(), Ordering::SeqCst, guard);
            if !value.is_null() {
                // safety: the value is owned by this node.
                drop(unsafe { value.into_owned() });
            }
            drop(entry);
        }
    }
}

impl<K, V> Drop for TreeBin<K, V> {
    fn drop(&mut self) {
        // Dropped either after `drop_nodes_and_values` (map teardown) or as
        // a retired bin after a resize split, in which case the values (and
        // possibly the chain) have moved to the new table and must survive.
        // safety: drop means no thread can reach this bin anymore.
        let guard = unsafe { crossbeam_epoch::unprotected() };
        let mut element = self.first.swap(Shared::null(), Ordering::SeqCst, guard);
        while !element.is_null() {
            // safety: as above; values are intentionally not dropped here.
            let mut entry = unsafe { element.into_owned() };
            let node = entry
                .as_node_mut()
                .expect("tree bins chain only tree nodes");
            element = node.next.swap(Shared::null(), Ordering::SeqCst, guard);
            drop(entry);
        }
        let waiter = self.waiter.swap(Shared::null(), Ordering::SeqCst, guard);
        if !waiter.is_null() {
            // safety: as above.
            drop(unsafe { waiter.into_owned() });
        }
    }
}

/* ---------------- Red-black balancing (CLR) -------------- */

impl<K, V> TreeBin<K, V>
where
    K: Ord,
{
    fn rotate_left<'g>(
        mut root: Shared<'g, BinEntry<K, V>>,
        p: Shared<'g, BinEntry<K, V>>,
        guard: &'g Guard,
    ) -> Shared<'g, BinEntry<K, V>> {
        if p.is_null() {
            return root;
        }
        // safety: rotations only run under the exclusive structural lock;
        // all nodes are alive under `guard`.
        let p_deref = unsafe { TreeNode::get(p) };
        let r = p_deref.right.load(Ordering::SeqCst, guard);
        if r.is_null() {
            return root;
        }
        let r_deref = unsafe { TreeNode::get(r) };
        let rl = r_deref.left.load(Ordering::SeqCst, guard);
        p_deref.right.store(rl, Ordering::SeqCst);
        if !rl.is_null() {
            unsafe { TreeNode::get(rl) }.parent.store(p, Ordering::SeqCst);
        }
        let pp = p_deref.parent.load(Ordering::SeqCst, guard);
        r_deref.parent.store(pp, Ordering::SeqCst);
        if pp.is_null() {
            root = r;
            r_deref.red.store(false, Ordering::SeqCst);
        } else {
            let pp_deref = unsafe { TreeNode::get(pp) };
            if pp_deref.left.load(Ordering::SeqCst, guard) == p {
                pp_deref.left.store(r, Ordering::SeqCst);
            } else {
                pp_deref.right.store(r, Ordering::SeqCst);
            }
        }
        r_deref.left.store(p, Ordering::SeqCst);
        p_deref.parent.store(r, Ordering::SeqCst);
        root
    }

    fn rotate_right<'g>(
        mut root: Shared<'g, BinEntry<K, V>>,
        p: Shared<'g, BinEntry<K, V>>,
        guard: &'g Guard,
    ) -> Shared<'g, BinEntry<K, V>> {
        if p.is_null() {
            return root;
        }
        // safety: as in `rotate_left`.
        let p_deref = unsafe { TreeNode::get(p) };
        let l = p_deref.left.load(Ordering::SeqCst, guard);
        if l.is_null() {
            return root;
        }
        let l_deref = unsafe { TreeNode::get(l) };
        let lr = l_deref.right.load(Ordering::SeqCst, guard);
        p_deref.left.store(lr, Ordering::SeqCst);
        if !lr.is_null() {
            unsafe { TreeNode::get(lr) }.parent.store(p, Ordering::SeqCst);
        }
        let pp = p_deref.parent.load(Ordering::SeqCst, guard);
        l_deref.parent.store(pp, Ordering::SeqCst);
        if pp.is_null() {
            root = l;
            l_deref.red.store(false, Ordering::SeqCst);
        } else {
            let pp_deref = unsafe { TreeNode::get(pp) };
            if pp_deref.right.load(Ordering::SeqCst, guard) == p {
                pp_deref.right.store(l, Ordering::SeqCst);
            } else {
                pp_deref.left.store(l, Ordering::SeqCst);
            }
        }
        l_deref.right.store(p, Ordering::SeqCst);
        p_deref.parent.store(l, Ordering::SeqCst);
        root
    }

    fn balance_insertion<'g>(
        mut root: Shared<'g, BinEntry<K, V>>,
        mut x: Shared<'g, BinEntry<K, V>>,
        guard: &'g Guard,
    ) -> Shared<'g, BinEntry<K, V>> {
        // safety throughout: only run while the chain is unshared (treeify)
        // or under the exclusive structural lock (inserts).
        unsafe { TreeNode::get(x) }.red.store(true, Ordering::SeqCst);

        loop {
            let x_deref = unsafe { TreeNode::get(x) };
            let xp = x_deref.parent.load(Ordering::SeqCst, guard);
            if xp.is_null() {
                x_deref.red.store(false, Ordering::SeqCst);
                return x;
            }
            let xp_deref = unsafe { TreeNode::get(xp) };
            if !xp_deref.red.load(Ordering::SeqCst) {
                return root;
            }
            let xpp = xp_deref.parent.load(Ordering::SeqCst, guard);
            if xpp.is_null() {
                return root;
            }
            let xpp_deref = unsafe { TreeNode::get(xpp) };
            let xppl = xpp_deref.left.load(Ordering::SeqCst, guard);

            if xp == xppl {
                let xppr = xpp_deref.right.load(Ordering::SeqCst, guard);
                if !xppr.is_null() && unsafe { TreeNode::get(xppr) }.red.load(Ordering::SeqCst) {
                    unsafe { TreeNode::get(xppr) }.red.store(false, Ordering::SeqCst);
                    xp_deref.red.store(false, Ordering::SeqCst);
                    xpp_deref.red.store(true, Ordering::SeqCst);
                    x = xpp;
                } else {
                    if x == xp_deref.right.load(Ordering::SeqCst, guard) {
                        x = xp;
                        root = Self::rotate_left(root, x, guard);
                    }
                    let xp = unsafe { TreeNode::get(x) }.parent.load(Ordering::SeqCst, guard);
                    if !xp.is_null() {
                        let xp_deref = unsafe { TreeNode::get(xp) };
                        xp_deref.red.store(false, Ordering::SeqCst);
                        let xpp = xp_deref.parent.load(Ordering::SeqCst, guard);
                        if !xpp.is_null() {
                            unsafe { TreeNode::get(xpp) }.red.store(true, Ordering::SeqCst);
                            root = Self::rotate_right(root, xpp, guard);
                        }
                    }
                }
            } else {
                let y = xppl;
                if !y.is_null() && unsafe { TreeNode::get(y) }.red.load(Ordering::SeqCst) {
                    unsafe { TreeNode::get(y) }.red.store(false, Ordering::SeqCst);
                    xp_deref.red.store(false, Ordering::SeqCst);
                    xpp_deref.red.store(true, Ordering::SeqCst);
                    x = xpp;
                } else {
                    if x == xp_deref.left.load(Ordering::SeqCst, guard) {
                        x = xp;
                        root = Self::rotate_right(root, x, guard);
                    }
                    let xp = unsafe { TreeNode::get(x) }.parent.load(Ordering::SeqCst, guard);
                    if !xp.is_null() {
                        let xp_deref = unsafe { TreeNode::get(xp) };
                        xp_deref.red.store(false, Ordering::SeqCst);
                        let xpp = xp_deref.parent.load(Ordering::SeqCst, guard);
                        if !xpp.is_null() {
                            unsafe { TreeNode::get(xpp) }.red.store(true, Ordering::SeqCst);
                            root = Self::rotate_left(root, xpp, guard);
                        }
                    }
                }
            }
        }
    }

    fn balance_deletion<'g>(
        mut root: Shared<'g, BinEntry<K, V>>,
        mut x: Shared<'g, BinEntry<K, V>>,
        guard: &'g Guard,
    ) -> Shared<'g, BinEntry<K, V>> {
        // safety throughout: only run under the exclusive structural lock.
        loop {
            if x.is_null() || x == root {
                return root;
            }
            let x_deref = unsafe { TreeNode::get(x) };
            let xp = x_deref.parent.load(Ordering::SeqCst, guard);
            if xp.is_null() {
                x_deref.red.store(false, Ordering::SeqCst);
                return x;
            }
            if x_deref.red.load(Ordering::SeqCst) {
                x_deref.red.store(false, Ordering::SeqCst);
                return root;
            }
            let xp_deref = unsafe { TreeNode::get(xp) };
            let xpl = xp_deref.left.load(Ordering::SeqCst, guard);

            if xpl == x {
                let mut xpr = xp_deref.right.load(Ordering::SeqCst, guard);
                if !xpr.is_null() && unsafe { TreeNode::get(xpr) }.red.load(Ordering::SeqCst) {
                    unsafe { TreeNode::get(xpr) }.red.store(false, Ordering::SeqCst);
                    xp_deref.red.store(true, Ordering::SeqCst);
                    root = Self::rotate_left(root, xp, guard);
                    let xp = unsafe { TreeNode::get(x) }.parent.load(Ordering::SeqCst, guard);
                    xpr = if xp.is_null() {
                        Shared::null()
                    } else {
                        unsafe { TreeNode::get(xp) }.right.load(Ordering::SeqCst, guard)
                    };
                }
                if xpr.is_null() {
                    x = unsafe { TreeNode::get(x) }.parent.load(Ordering::SeqCst, guard);
                    continue;
                }
                let xpr_deref = unsafe { TreeNode::get(xpr) };
                let sl = xpr_deref.left.load(Ordering::SeqCst, guard);
                let sr = xpr_deref.right.load(Ordering::SeqCst, guard);
                let sl_red = !sl.is_null() && unsafe { TreeNode::get(sl) }.red.load(Ordering::SeqCst);
                let sr_red = !sr.is_null() && unsafe { TreeNode::get(sr) }.red.load(Ordering::SeqCst);
                if !sl_red && !sr_red {
                    xpr_deref.red.store(true, Ordering::SeqCst);
                    x = unsafe { TreeNode::get(x) }.parent.load(Ordering::SeqCst, guard);
                    continue;
                }
                if !sr_red {
                    if !sl.is_null() {
                        unsafe { TreeNode::get(sl) }.red.store(false, Ordering::SeqCst);
                    }
                    xpr_deref.red.store(true, Ordering::SeqCst);
                    root = Self::rotate_right(root, xpr, guard);
                    let xp = unsafe { TreeNode::get(x) }.parent.load(Ordering::SeqCst, guard);
                    xpr = if xp.is_null() {
                        Shared::null()
                    } else {
                        unsafe { TreeNode::get(xp) }.right.load(Ordering::SeqCst, guard)
                    };
                }
                let xp = unsafe { TreeNode::get(x) }.parent.load(Ordering::SeqCst, guard);
                if !xpr.is_null() {
                    let xpr_deref = unsafe { TreeNode::get(xpr) };
                    let xp_red = !xp.is_null() && unsafe { TreeNode::get(xp) }.red.load(Ordering::SeqCst);
                    xpr_deref.red.store(xp_red, Ordering::SeqCst);
                    let sr = xpr_deref.right.load(Ordering::SeqCst, guard);
                    if !sr.is_null() {
                        unsafe { TreeNode::get(sr) }.red.store(false, Ordering::SeqCst);
                    }
                }
                if !xp.is_null() {
                    unsafe { TreeNode::get(xp) }.red.store(false, Ordering::SeqCst);
                    root = Self::rotate_left(root, xp, guard);
                }
                x = root;
            } else {
                // symmetric
                let mut xpl = xpl;
                if !xpl.is_null() && unsafe { TreeNode::get(xpl) }.red.load(Ordering::SeqCst) {
                    unsafe { TreeNode::get(xpl) }.red.store(false, Ordering::SeqCst);
                    xp_deref.red.store(true, Ordering::SeqCst);
                    root = Self::rotate_right(root, xp, guard);
                    let xp = unsafe { TreeNode::get(x) }.parent.load(Ordering::SeqCst, guard);
                    xpl = if xp.is_null() {
                        Shared::null()
                    } else {
                        unsafe { TreeNode::get(xp) }.left.load(Ordering::SeqCst, guard)
                    };
                }
                if xpl.is_null() {
                    x = unsafe { TreeNode::get(x) }.parent.load(Ordering::SeqCst, guard);
                    continue;
                }
                let xpl_deref = unsafe { TreeNode::get(xpl) };
                let sl = xpl_deref.left.load(Ordering::SeqCst, guard);
                let sr = xpl_deref.right.load(Ordering::SeqCst, guard);
                let sl_red = !sl.is_null() && unsafe { TreeNode::get(sl) }.red.load(Ordering::SeqCst);
                let sr_red = !sr.is_null() && unsafe { TreeNode::get(sr) }.red.load(Ordering::SeqCst);
                if !sl_red && !sr_red {
                    xpl_deref.red.store(true, Ordering::SeqCst);
                    x = unsafe { TreeNode::get(x) }.parent.load(Ordering::SeqCst, guard);
                    continue;
                }
                if !sl_red {
                    if !sr.is_null() {
                        unsafe { TreeNode::get(sr) }.red.store(false, Ordering::SeqCst);
                    }
                    xpl_deref.red.store(true, Ordering::SeqCst);
                    root = Self::rotate_left(root, xpl, guard);
                    let xp = unsafe { TreeNode::get(x) }.parent.load(Ordering::SeqCst, guard);
                    xpl = if xp.is_null() {
                        Shared::null()
                    } else {
                        unsafe { TreeNode::get(xp) }.left.load(Ordering::SeqCst, guard)
                    };
                }
                let xp = unsafe { TreeNode::get(x) }.parent.load(Ordering::SeqCst, guard);
                if !xpl.is_null() {
                    let xpl_deref = unsafe { TreeNode::get(xpl) };
                    let xp_red = !xp.is_null() && unsafe { TreeNode::get(xp) }.red.load(Ordering::SeqCst);
                    xpl_deref.red.store(xp_red, Ordering::SeqCst);
                    let sl = xpl_deref.left.load(Ordering::SeqCst, guard);
                    if !sl.is_null() {
                        unsafe { TreeNode::get(sl) }.red.store(false, Ordering::SeqCst);
                    }
                }
                if !xp.is_null() {
                    unsafe { TreeNode::get(xp) }.red.store(false, Ordering::SeqCst);
                    root = Self::rotate_right(root, xp, guard);
                }
                x = root;
            }
        }
    }

    /// Red-black and ordering invariants, checked in debug builds after
    /// structural deletions.
    pub(crate) fn check_invariants<'g>(
        root: Shared<'g, BinEntry<K, V>>,
        guard: &'g Guard,
    ) -> bool {
        if root.is_null() {
            return true;
        }
        Self::check_subtree(root, guard).is_some()
    }

    /// Returns the black height of the subtree, or `None` on violation.
    fn check_subtree<'g>(p: Shared<'g, BinEntry<K, V>>, guard: &'g Guard) -> Option<usize> {
        if p.is_null() {
            return Some(1);
        }
        // safety: called under the structural lock or from unit tests with
        // exclusive access.
        let p_deref = unsafe { TreeNode::get(p) };
        let red = p_deref.red.load(Ordering::SeqCst);
        let left = p_deref.left.load(Ordering::SeqCst, guard);
        let right = p_deref.right.load(Ordering::SeqCst, guard);
        for (child, is_left) in [(left, true), (right, false)] {
            if child.is_null() {
                continue;
            }
            let c = unsafe { TreeNode::get(child) };
            if c.parent.load(Ordering::SeqCst, guard) != p {
                return None;
            }
            if red && c.red.load(Ordering::SeqCst) {
                return None;
            }
            let ordered = match (c.node.hash, p_deref.node.hash) {
                (ch, ph) if ch != ph => (ch < ph) == is_left,
                _ => (c.node.key < p_deref.node.key) == is_left,
            };
            if !ordered {
                return None;
            }
        }
        let lh = Self::check_subtree(left, guard)?;
        let rh = Self::check_subtree(right, guard)?;
        if lh != rh {
            return None;
        }
        Some(lh + usize::from(!red))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_epoch::{self as epoch};

    fn tree_node_chain<'g>(
        pairs: &[(u64, usize)],
        guard: &'g Guard,
    ) -> Shared<'g, BinEntry<usize, usize>> {
        let mut head = Shared::null();
        let mut tail: Shared<'_, BinEntry<usize, usize>> = Shared::null();
        for &(hash, key) in pairs {
            let entry = Owned::new(BinEntry::TreeNode(TreeNode::new(
                hash,
                key,
                Atomic::new(key * 10),
            )))
            .into_shared(guard);
            if tail.is_null() {
                head = entry;
            } else {
                // safety: the chain is unshared until handed to TreeBin::new.
                unsafe { TreeNode::get(tail) }
                    .node
                    .next
                    .store(entry, Ordering::SeqCst);
                unsafe { TreeNode::get(entry) }
                    .prev
                    .store(tail, Ordering::SeqCst);
            }
            tail = entry;
        }
        head
    }

    #[test]
    fn build_and_search_tree_bin() {
        let guard = &epoch::pin();
        let pairs: Vec<_> = (0..64u64).map(|i| (1u64, i as usize)).collect();
        let chain = tree_node_chain(&pairs, guard);
        let mut bin = TreeBin::new(chain, guard);

        for i in 0..64usize {
            let found = bin.find(1, &i, guard);
            assert!(!found.is_null(), "key {i} missing");
            // safety: the bin is privately owned by this test.
            let node = unsafe { found.deref() }.as_node().unwrap();
            let value = node.value.load(Ordering::SeqCst, guard);
            assert_eq!(*unsafe { value.deref() }, i * 10);
        }
        assert!(bin.find(1, &1000usize, guard).is_null());
        assert!(TreeBin::check_invariants(
            bin.root.load(Ordering::SeqCst, guard),
            guard
        ));

        bin.drop_nodes_and_values();
    }

    #[test]
    fn insert_and_remove_keep_invariants() {
        let guard = &epoch::pin();
        let chain = tree_node_chain(&[(1, 0), (1, 1)], guard);
        let mut bin = TreeBin::new(chain, guard);

        for i in 2..40usize {
            let value = Owned::new(i * 10).into_shared(guard);
            let existing = bin.find_or_put_tree_val(1, i, value, guard);
            assert!(existing.is_null(), "key {i} should be new");
        }
        assert!(TreeBin::check_invariants(
            bin.root.load(Ordering::SeqCst, guard),
            guard
        ));

        // a duplicate insert returns the existing node and leaves the new
        // value with the caller
        let rejected = Owned::new(999usize).into_shared(guard);
        let existing = bin.find_or_put_tree_val(1, 5, rejected, guard);
        assert!(!existing.is_null());
        // safety: the rejected value was never linked into the bin.
        drop(unsafe { rejected.into_owned() });

        // remove a few interior keys and re-validate
        for i in [5usize, 17, 3, 20] {
            let p = bin.find(1, &i, guard);
            assert!(!p.is_null());
            let too_small = bin.remove_tree_node(p, guard);
            assert!(!too_small);
            // safety: the removed node is unlinked; the test owns the bin.
            let mut entry = unsafe { p.into_owned() };
            let node = entry.as_node_mut().unwrap();
            let value = node.value.swap(Shared::null(), Ordering::SeqCst, guard);
            drop(unsafe { value.into_owned() });
            drop(entry);
            assert!(bin.find(1, &i, guard).is_null());
        }
        assert!(TreeBin::check_invariants(
            bin.root.load(Ordering::SeqCst, guard),
            guard
        ));

        bin.drop_nodes_and_values();
    }

    #[test]
    fn out_of_order_inserts_keep_invariants() {
        let guard = &epoch::pin();
        let chain = tree_node_chain(&[(1, 500)], guard);
        let mut bin = TreeBin::new(chain, guard);

        // 37 is coprime to 64, so this visits every key exactly once in a
        // scrambled order, exercising both the red-parent rebalance path
        // and the black-parent fast path
        for i in 0..64usize {
            let key = (i * 37 + 11) % 64;
            let value = Owned::new(key * 10).into_shared(guard);
            let existing = bin.find_or_put_tree_val(1, key, value, guard);
            assert!(existing.is_null(), "key {key} should be new");
            assert!(
                TreeBin::check_invariants(bin.root.load(Ordering::SeqCst, guard), guard),
                "invariants broken after insert {i} (key {key})"
            );
        }
        for key in 0..64usize {
            assert!(!bin.find(1, &key, guard).is_null(), "key {key} missing");
        }

        bin.drop_nodes_and_values();
    }
}
