//! The concurrent map.
//!
//! # Safety
//!
//! Memory reclamation follows the epoch protocol throughout:
//! - Nodes, values, tree bins, and tables are only unlinked while the
//!   relevant lock is held, and are retired with `defer_destroy` so that any
//!   thread that loaded them under a pinned guard can keep using them
//! - A replaced table is retired only after every one of its bins has been
//!   overwritten with a forwarding marker, so late readers always find their
//!   way to the current table
//! - References handed out (`&'g V`, `&'g K`) borrow the caller's guard and
//!   cannot outlive the pin

use std::borrow::Borrow;
use std::collections::VecDeque;
use std::fmt;
use std::hash::{BuildHasher, Hash, Hasher};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use crossbeam_utils::Backoff;

use crate::counter::StripedAdder;
use crate::iter::{Iter, Keys, NodeIter, Values};
use crate::node::{BinEntry, Node, TreeBin, TreeNode};
use crate::raw::Table;

/// The default [`BuildHasher`].
pub type DefaultHashBuilder = ahash::RandomState;

/// Capacity of the first table when none was requested.
const DEFAULT_CAPACITY: usize = 16;

/// Largest table size. The bin mask must leave hash bits to split on, and
/// doubling past this would overflow downstream arithmetic.
const MAXIMUM_CAPACITY: usize = 1 << 30;

/// List length at which a bin is converted to a tree.
const TREEIFY_THRESHOLD: usize = 16;

/// Tree size at or below which a resize split reverts the half to a list.
const UNTREEIFY_THRESHOLD: usize = 8;

/// How many locked bins a resize skips over before it blocks on one.
const TRANSFER_BUFFER_SIZE: usize = 32;

// Lifecycle of the table, advanced by compare-and-swap. Exactly one thread
// wins the transition into INITIALIZING or RESIZING and performs the work.
const UNINIT: u8 = 0;
const INITIALIZING: u8 = 1;
const LIVE: u8 = 2;
const RESIZING: u8 = 3;

/// A concurrent hash map with lock-free reads and per-bin write locking.
///
/// Reads (`get`, iteration) never block: they walk an atomic snapshot of the
/// bin and follow forwarding markers left by an in-flight resize. Writes
/// lock only the single bin they touch. Overlong bins convert to red-black
/// trees, which requires `K: Ord`. The live-entry count is kept in a
/// [`StripedAdder`] and is approximate under concurrent mutation.
///
/// Most methods take an epoch [`Guard`] (from [`DriftMap::guard`]) and
/// return references that live as long as that guard is pinned.
pub struct DriftMap<K, V, S = DefaultHashBuilder> {
    /// Current bin table. Null until the first write.
    table: Atomic<Table<K, V>>,
    /// Target table of an in-flight resize, null otherwise.
    next_table: Atomic<Table<K, V>>,
    /// Live element count (approximate).
    count: StripedAdder,
    /// Lifecycle state, see the constants above.
    state: AtomicU8,
    /// Resize trigger: live count at which the next doubling starts. Valid
    /// while the state is LIVE.
    threshold: AtomicUsize,
    /// Size the first table will be created with.
    initial_capacity: AtomicUsize,
    build_hasher: S,
}

/// Outcome of the internal put engine.
enum PutResult<'g, T> {
    Inserted { new: &'g T },
    Replaced { new: &'g T, old: &'g T },
    Exists { current: &'g T, not_inserted: Box<T> },
}

/// Error returned by [`DriftMap::try_insert`] when the key was already
/// mapped.
#[derive(Debug, PartialEq, Eq)]
pub struct TryInsertError<'g, V> {
    /// Value associated with the key at the time of the call.
    pub current: &'g V,
    /// The value the call did not insert, returned to the caller.
    pub not_inserted: V,
}

impl<V> fmt::Display for TryInsertError<'_, V>
where
    V: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "not inserted because the key already mapped to {:?}",
            self.current
        )
    }
}

impl<V> std::error::Error for TryInsertError<'_, V> where V: fmt::Debug {}

impl<K, V> DriftMap<K, V, DefaultHashBuilder> {
    /// Creates an empty map with the default hasher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty map sized to hold `capacity` elements without
    /// resizing.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_hasher(capacity, DefaultHashBuilder::default())
    }
}

impl<K, V, S> Default for DriftMap<K, V, S>
where
    S: Default,
{
    fn default() -> Self {
        Self::with_hasher(S::default())
    }
}

impl<K, V, S> DriftMap<K, V, S> {
    /// Creates an empty map that hashes with `build_hasher`.
    pub fn with_hasher(build_hasher: S) -> Self {
        Self {
            table: Atomic::null(),
            next_table: Atomic::null(),
            count: StripedAdder::new(),
            state: AtomicU8::new(UNINIT),
            threshold: AtomicUsize::new(0),
            initial_capacity: AtomicUsize::new(DEFAULT_CAPACITY),
            build_hasher,
        }
    }

    /// Creates an empty map sized for `capacity` elements, hashing with
    /// `build_hasher`.
    pub fn with_capacity_and_hasher(capacity: usize, build_hasher: S) -> Self {
        let map = Self::with_hasher(build_hasher);
        map.initial_capacity
            .store(Self::table_size_for(capacity), Ordering::Relaxed);
        map
    }

    /// Pins the current thread's epoch. References returned by the lookup
    /// methods live as long as the returned guard.
    pub fn guard(&self) -> Guard {
        epoch::pin()
    }

    /// Number of live entries. Approximate while other threads mutate the
    /// map; exact at quiescence.
    pub fn len(&self) -> usize {
        let count = self.count.sum();
        if count < 0 {
            0
        } else {
            count as usize
        }
    }

    /// `true` if [`len`](DriftMap::len) is zero.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Table size for a requested element capacity: 1.5x plus one, rounded
    /// up to a power of two.
    fn table_size_for(capacity: usize) -> usize {
        capacity
            .saturating_add(capacity >> 1)
            .saturating_add(1)
            .next_power_of_two()
            .clamp(DEFAULT_CAPACITY, MAXIMUM_CAPACITY)
    }
}

impl<K, V, S> DriftMap<K, V, S>
where
    S: BuildHasher,
{
    fn hash<Q: ?Sized + Hash>(&self, key: &Q) -> u64 {
        let mut hasher = self.build_hasher.build_hasher();
        key.hash(&mut hasher);
        hasher.finish()
    }
}

impl<K, V, S> DriftMap<K, V, S>
where
    K: Sync + Send + Clone + Hash + Ord,
    V: Sync + Send,
    S: BuildHasher,
{
    /* ---------------- Reads -------------- */

    /// Returns a reference to the value mapped to `key`, if any.
    pub fn get<'g, Q>(&'g self, key: &Q, guard: &'g Guard) -> Option<&'g V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Ord,
    {
        let node = self.get_node(key, guard)?;
        let value = node.value.load(Ordering::SeqCst, guard);
        if value.is_null() {
            // mid-computation or mid-removal
            return None;
        }
        // safety: the value was loaded under `guard` and is retired only
        // after a grace period.
        Some(unsafe { value.deref() })
    }

    /// Returns the key and value for `key`, if mapped. The returned key is
    /// the one stored in the map.
    pub fn get_key_value<'g, Q>(&'g self, key: &Q, guard: &'g Guard) -> Option<(&'g K, &'g V)>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Ord,
    {
        let node = self.get_node(key, guard)?;
        let value = node.value.load(Ordering::SeqCst, guard);
        if value.is_null() {
            return None;
        }
        // safety: as in `get`.
        Some((&node.key, unsafe { value.deref() }))
    }

    /// `true` if `key` is currently mapped.
    pub fn contains_key<Q>(&self, key: &Q, guard: &Guard) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Ord,
    {
        self.get(key, guard).is_some()
    }

    /// `true` if any key currently maps to `value`. Walks the whole map.
    pub fn contains_value(&self, value: &V, guard: &Guard) -> bool
    where
        V: PartialEq,
    {
        self.values(guard).any(|v| v == value)
    }

    fn get_node<'g, Q>(&'g self, key: &Q, guard: &'g Guard) -> Option<&'g Node<K, V>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Ord,
    {
        let table = self.table.load(Ordering::SeqCst, guard);
        if table.is_null() {
            return None;
        }
        // safety: the current table is retired only after being fully
        // forwarded and a grace period has passed.
        let t = unsafe { table.deref() };
        if t.is_empty() {
            return None;
        }
        let hash = self.hash(key);
        let bin = t.bin(t.bini(hash), guard);
        if bin.is_null() {
            return None;
        }
        // safety: `bin` was loaded from a live table under `guard`.
        let entry = unsafe { BinEntry::find(bin, hash, key, guard) };
        if entry.is_null() {
            return None;
        }
        // safety: as above.
        Some(
            unsafe { entry.deref() }
                .as_node()
                .expect("find returns nodes"),
        )
    }

    /* ---------------- Writes -------------- */

    /// Maps `key` to `value`, returning the previous value if the key was
    /// already mapped.
    pub fn insert<'g>(&'g self, key: K, value: V, guard: &'g Guard) -> Option<&'g V> {
        match self.put(key, value, false, guard) {
            PutResult::Inserted { .. } => None,
            PutResult::Replaced { old, .. } => Some(old),
            PutResult::Exists { .. } => unreachable!("replacing put cannot refuse"),
        }
    }

    /// Maps `key` to `value` only if the key is not already mapped. On
    /// conflict the error carries both the current value and `value`.
    pub fn try_insert<'g>(
        &'g self,
        key: K,
        value: V,
        guard: &'g Guard,
    ) -> Result<&'g V, TryInsertError<'g, V>> {
        match self.put(key, value, true, guard) {
            PutResult::Inserted { new } => Ok(new),
            PutResult::Exists {
                current,
                not_inserted,
            } => Err(TryInsertError {
                current,
                not_inserted: *not_inserted,
            }),
            PutResult::Replaced { .. } => unreachable!("no-replacement put cannot replace"),
        }
    }

    fn put<'g>(
        &'g self,
        mut key: K,
        value: V,
        no_replacement: bool,
        guard: &'g Guard,
    ) -> PutResult<'g, V> {
        let hash = self.hash(&key);
        // allocate the value once; on retries only the pointer moves.
        let value = Owned::new(value).into_shared(guard);
        let mut table = self.table.load(Ordering::SeqCst, guard);

        loop {
            if table.is_null() {
                table = self.init_table(guard);
                continue;
            }
            // safety: tables are retired only after a grace period.
            let t = unsafe { table.deref() };
            if t.is_empty() {
                table = self.init_table(guard);
                continue;
            }

            let bini = t.bini(hash);
            let bin = t.bin(bini, guard);
            if bin.is_null() {
                // lock-free insertion into an empty bin
                let node = Owned::new(BinEntry::Node(Node::new(hash, key, Atomic::from(value))));
                match t.cas_bin(bini, Shared::null(), node, guard) {
                    Ok(_) => {
                        self.add_count(1, true, guard);
                        // safety: we just allocated the value; it is only
                        // retired after removal plus a grace period.
                        return PutResult::Inserted {
                            new: unsafe { value.deref() },
                        };
                    }
                    Err(changed) => {
                        // someone beat us to it; take the key back and work
                        // the now-nonempty bin
                        let BinEntry::Node(node) = *changed.new.into_box() else {
                            unreachable!("we CASed a list node");
                        };
                        key = node.key;
                        continue;
                    }
                }
            }

            // safety: as above.
            match *unsafe { bin.deref() } {
                BinEntry::Moved(next_table) => {
                    // this bin has been transferred; write into the new table
                    table = Shared::from(next_table as *const _);
                    continue;
                }
                BinEntry::Node(ref head) => {
                    let head_lock = head.lock.lock();
                    // the bin may have been replaced while we waited
                    if t.bin(bini, guard) != bin {
                        drop(head_lock);
                        continue;
                    }

                    let mut bin_count = 1;
                    let mut p = bin;
                    let result = loop {
                        // safety: list nodes are retired only after a grace
                        // period; the chain is stable under the bin lock.
                        let n = unsafe { p.deref() }
                            .as_node()
                            .expect("list bins link only nodes");
                        if n.hash == hash && n.key == key {
                            let current = n.value.load(Ordering::SeqCst, guard);
                            if current.is_null() {
                                // leftover placeholder from an aborted
                                // computation; fill it in
                                n.value.store(value, Ordering::SeqCst);
                                break PutResult::Inserted {
                                    // safety: as in the CAS arm.
                                    new: unsafe { value.deref() },
                                };
                            }
                            if no_replacement {
                                break PutResult::Exists {
                                    // safety: as above.
                                    current: unsafe { current.deref() },
                                    // safety: the value never left this
                                    // thread.
                                    not_inserted: unsafe { value.into_owned() }.into_box(),
                                };
                            }
                            let old = n.value.swap(value, Ordering::SeqCst, guard);
                            // safety: `old` stays readable for pinned guards
                            // and is freed after a grace period.
                            unsafe { guard.defer_destroy(old) };
                            break PutResult::Replaced {
                                new: unsafe { value.deref() },
                                old: unsafe { old.deref() },
                            };
                        }
                        let next = n.next.load(Ordering::SeqCst, guard);
                        if next.is_null() {
                            let node =
                                Owned::new(BinEntry::Node(Node::new(hash, key, Atomic::from(value))));
                            n.next.store(node, Ordering::SeqCst);
                            break PutResult::Inserted {
                                // safety: as above.
                                new: unsafe { value.deref() },
                            };
                        }
                        p = next;
                        bin_count += 1;
                    };
                    drop(head_lock);

                    match result {
                        PutResult::Inserted { .. } => {
                            // bin_count counted the pre-append chain
                            if bin_count + 1 >= TREEIFY_THRESHOLD {
                                self.treeify_bin(t, bini, guard);
                            }
                            self.add_count(1, true, guard);
                        }
                        PutResult::Replaced { .. } | PutResult::Exists { .. } => {}
                    }
                    return result;
                }
                BinEntry::Tree(ref tree_bin) => {
                    let bin_lock = tree_bin.lock.lock();
                    if t.bin(bini, guard) != bin {
                        drop(bin_lock);
                        continue;
                    }

                    let existing = tree_bin.find_or_put_tree_val(hash, key, value, guard);
                    if existing.is_null() {
                        drop(bin_lock);
                        self.add_count(1, true, guard);
                        // safety: as above.
                        return PutResult::Inserted {
                            new: unsafe { value.deref() },
                        };
                    }
                    // safety: the existing node is protected by `guard`.
                    let n = &unsafe { TreeNode::get(existing) }.node;
                    let current = n.value.load(Ordering::SeqCst, guard);
                    let result = if current.is_null() {
                        n.value.store(value, Ordering::SeqCst);
                        drop(bin_lock);
                        self.add_count(1, true, guard);
                        PutResult::Inserted {
                            // safety: as above.
                            new: unsafe { value.deref() },
                        }
                    } else if no_replacement {
                        drop(bin_lock);
                        PutResult::Exists {
                            // safety: as above.
                            current: unsafe { current.deref() },
                            // safety: the value never left this thread.
                            not_inserted: unsafe { value.into_owned() }.into_box(),
                        }
                    } else {
                        let old = n.value.swap(value, Ordering::SeqCst, guard);
                        drop(bin_lock);
                        // safety: as in the list arm.
                        unsafe { guard.defer_destroy(old) };
                        PutResult::Replaced {
                            new: unsafe { value.deref() },
                            old: unsafe { old.deref() },
                        }
                    };
                    return result;
                }
                BinEntry::TreeNode(_) => unreachable!("tree node as bin head"),
            }
        }
    }

    /// Returns the value mapped to `key`, inserting the one produced by
    /// `compute` first if the key was unmapped.
    pub fn compute_if_absent<'g, F>(&'g self, mut key: K, compute: F, guard: &'g Guard) -> &'g V
    where
        F: FnOnce(&K) -> V,
    {
        let hash = self.hash(&key);
        let mut table = self.table.load(Ordering::SeqCst, guard);

        loop {
            if table.is_null() {
                table = self.init_table(guard);
                continue;
            }
            // safety: as in `put`.
            let t = unsafe { table.deref() };
            if t.is_empty() {
                table = self.init_table(guard);
                continue;
            }

            let bini = t.bini(hash);
            let bin = t.bin(bini, guard);
            if bin.is_null() {
                match self.claim_empty_bin(t, bini, hash, key, guard) {
                    Ok(head) => {
                        // bin claimed with its lock held; run the closure
                        // with the placeholder invisible to readers
                        let value = run_claimed(self, t, bini, head, guard, || {
                            // safety: the placeholder is ours until the
                            // claim is released.
                            let key = &unsafe { head.deref() }
                                .as_node()
                                .expect("placeholder is a list node")
                                .key;
                            Owned::new(compute(key))
                        });
                        self.add_count(1, true, guard);
                        // safety: the value was just published under `guard`.
                        return unsafe { value.deref() };
                    }
                    Err(returned_key) => {
                        key = returned_key;
                        continue;
                    }
                }
            }

            // safety: as in `put`.
            match *unsafe { bin.deref() } {
                BinEntry::Moved(next_table) => {
                    table = Shared::from(next_table as *const _);
                    continue;
                }
                BinEntry::Node(ref head) => {
                    let head_lock = head.lock.lock();
                    if t.bin(bini, guard) != bin {
                        drop(head_lock);
                        continue;
                    }

                    let mut bin_count = 1;
                    let mut p = bin;
                    loop {
                        // safety: as in `put`.
                        let n = unsafe { p.deref() }
                            .as_node()
                            .expect("list bins link only nodes");
                        if n.hash == hash && n.key == key {
                            let current = n.value.load(Ordering::SeqCst, guard);
                            if !current.is_null() {
                                drop(head_lock);
                                // safety: as in `get`.
                                return unsafe { current.deref() };
                            }
                            // aborted placeholder; recompute in place
                            let value = Owned::new(compute(&n.key)).into_shared(guard);
                            n.value.store(value, Ordering::SeqCst);
                            drop(head_lock);
                            self.add_count(1, true, guard);
                            // safety: as above.
                            return unsafe { value.deref() };
                        }
                        let next = n.next.load(Ordering::SeqCst, guard);
                        if next.is_null() {
                            let value = Owned::new(compute(&key)).into_shared(guard);
                            let node = Owned::new(BinEntry::Node(Node::new(
                                hash,
                                key,
                                Atomic::from(value),
                            )));
                            n.next.store(node, Ordering::SeqCst);
                            drop(head_lock);
                            if bin_count + 1 >= TREEIFY_THRESHOLD {
                                self.treeify_bin(t, bini, guard);
                            }
                            self.add_count(1, true, guard);
                            // safety: as above.
                            return unsafe { value.deref() };
                        }
                        p = next;
                        bin_count += 1;
                    }
                }
                BinEntry::Tree(ref tree_bin) => {
                    let bin_lock = tree_bin.lock.lock();
                    if t.bin(bini, guard) != bin {
                        drop(bin_lock);
                        continue;
                    }

                    let root = tree_bin.root.load(Ordering::SeqCst, guard);
                    let existing = if root.is_null() {
                        Shared::null()
                    } else {
                        TreeNode::find_tree_node(root, hash, &key, guard)
                    };
                    if existing.is_null() {
                        let value = Owned::new(compute(&key)).into_shared(guard);
                        let inserted = tree_bin.find_or_put_tree_val(hash, key, value, guard);
                        debug_assert!(inserted.is_null());
                        drop(bin_lock);
                        self.add_count(1, true, guard);
                        // safety: as above.
                        return unsafe { value.deref() };
                    }
                    // safety: as in `put`.
                    let n = &unsafe { TreeNode::get(existing) }.node;
                    let current = n.value.load(Ordering::SeqCst, guard);
                    if !current.is_null() {
                        drop(bin_lock);
                        // safety: as in `get`.
                        return unsafe { current.deref() };
                    }
                    let value = Owned::new(compute(&n.key)).into_shared(guard);
                    n.value.store(value, Ordering::SeqCst);
                    drop(bin_lock);
                    self.add_count(1, true, guard);
                    // safety: as above.
                    return unsafe { value.deref() };
                }
                BinEntry::TreeNode(_) => unreachable!("tree node as bin head"),
            }
        }
    }

    /// Re-maps the value of `key` if one is present. `remap` returning
    /// `None` removes the mapping; a panic in `remap` leaves it unchanged.
    pub fn compute_if_present<'g, Q, F>(
        &'g self,
        key: &Q,
        remap: F,
        guard: &'g Guard,
    ) -> Option<&'g V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Ord,
        F: FnOnce(&K, &V) -> Option<V>,
    {
        self.remap_existing(key, remap, guard)
    }

    /// Engine for [`compute_if_present`](DriftMap::compute_if_present):
    /// acts only on a mapped key, so it never inserts a placeholder.
    fn remap_existing<'g, Q, F>(&'g self, key: &Q, remap: F, guard: &'g Guard) -> Option<&'g V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Ord,
        F: FnOnce(&K, &V) -> Option<V>,
    {
        let hash = self.hash(key);
        let mut table = self.table.load(Ordering::SeqCst, guard);

        loop {
            if table.is_null() {
                return None;
            }
            // safety: as in `put`.
            let t = unsafe { table.deref() };
            if t.is_empty() {
                return None;
            }
            let bini = t.bini(hash);
            let bin = t.bin(bini, guard);
            if bin.is_null() {
                return None;
            }

            // safety: as in `put`.
            match *unsafe { bin.deref() } {
                BinEntry::Moved(next_table) => {
                    table = Shared::from(next_table as *const _);
                    continue;
                }
                BinEntry::Node(ref head) => {
                    let head_lock = head.lock.lock();
                    if t.bin(bini, guard) != bin {
                        drop(head_lock);
                        continue;
                    }

                    let mut prev = Shared::null();
                    let mut p = bin;
                    loop {
                        // safety: as in `put`.
                        let n = unsafe { p.deref() }
                            .as_node()
                            .expect("list bins link only nodes");
                        if n.hash == hash && n.key.borrow() == key {
                            let current = n.value.load(Ordering::SeqCst, guard);
                            if current.is_null() {
                                // placeholder; nothing mapped
                                drop(head_lock);
                                return None;
                            }
                            // safety: as in `get`.
                            return match remap(&n.key, unsafe { current.deref() }) {
                                Some(value) => {
                                    let value = Owned::new(value).into_shared(guard);
                                    let old = n.value.swap(value, Ordering::SeqCst, guard);
                                    drop(head_lock);
                                    // safety: as in `put`.
                                    unsafe { guard.defer_destroy(old) };
                                    // safety: as above.
                                    Some(unsafe { value.deref() })
                                }
                                None => {
                                    self.unlink_list_node(t, bini, bin, prev, p, guard);
                                    drop(head_lock);
                                    self.add_count(-1, false, guard);
                                    None
                                }
                            };
                        }
                        let next = n.next.load(Ordering::SeqCst, guard);
                        if next.is_null() {
                            drop(head_lock);
                            return None;
                        }
                        prev = p;
                        p = next;
                    }
                }
                BinEntry::Tree(ref tree_bin) => {
                    let bin_lock = tree_bin.lock.lock();
                    if t.bin(bini, guard) != bin {
                        drop(bin_lock);
                        continue;
                    }

                    let root = tree_bin.root.load(Ordering::SeqCst, guard);
                    let existing = if root.is_null() {
                        Shared::null()
                    } else {
                        TreeNode::find_tree_node(root, hash, key, guard)
                    };
                    if existing.is_null() {
                        drop(bin_lock);
                        return None;
                    }
                    // safety: as in `put`.
                    let n = &unsafe { TreeNode::get(existing) }.node;
                    let current = n.value.load(Ordering::SeqCst, guard);
                    if current.is_null() {
                        drop(bin_lock);
                        return None;
                    }
                    // safety: as in `get`.
                    return match remap(&n.key, unsafe { current.deref() }) {
                        Some(value) => {
                            let value = Owned::new(value).into_shared(guard);
                            let old = n.value.swap(value, Ordering::SeqCst, guard);
                            drop(bin_lock);
                            // safety: as in `put`.
                            unsafe { guard.defer_destroy(old) };
                            // safety: as above.
                            Some(unsafe { value.deref() })
                        }
                        None => {
                            self.remove_tree_entry(t, bini, bin, tree_bin, existing, guard);
                            drop(bin_lock);
                            self.add_count(-1, false, guard);
                            None
                        }
                    };
                }
                BinEntry::TreeNode(_) => unreachable!("tree node as bin head"),
            }
        }
    }

    /// Re-maps `key` whether or not it is currently mapped. The closure
    /// receives the current value, if any; returning `None` removes the
    /// mapping (or leaves an absent key absent).
    pub fn compute<'g, F>(&'g self, mut key: K, remap: F, guard: &'g Guard) -> Option<&'g V>
    where
        F: FnOnce(&K, Option<&V>) -> Option<V>,
    {
        let hash = self.hash(&key);
        let mut table = self.table.load(Ordering::SeqCst, guard);

        loop {
            if table.is_null() {
                table = self.init_table(guard);
                continue;
            }
            // safety: as in `put`.
            let t = unsafe { table.deref() };
            if t.is_empty() {
                table = self.init_table(guard);
                continue;
            }

            let bini = t.bini(hash);
            let bin = t.bin(bini, guard);
            if bin.is_null() {
                match self.claim_empty_bin(t, bini, hash, key, guard) {
                    Ok(head) => {
                        // safety: we own the placeholder and hold its lock.
                        let head_node = unsafe { head.deref() }
                            .as_node()
                            .expect("placeholder is a list node");
                        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                            remap(&head_node.key, None)
                        }));
                        match outcome {
                            Ok(Some(value)) => {
                                let value = Owned::new(value).into_shared(guard);
                                head_node.value.store(value, Ordering::SeqCst);
                                // the placeholder's mutex acts as the bin
                                // lock; force-unlock our claim
                                // safety: we acquired it in claim_empty_bin.
                                unsafe { head_node.lock.force_unlock() };
                                self.add_count(1, true, guard);
                                // safety: as above.
                                return Some(unsafe { value.deref() });
                            }
                            Ok(None) => {
                                self.discard_claimed_bin(t, bini, head, guard);
                                return None;
                            }
                            Err(panic_payload) => {
                                self.discard_claimed_bin(t, bini, head, guard);
                                panic::resume_unwind(panic_payload);
                            }
                        }
                    }
                    Err(returned_key) => {
                        key = returned_key;
                        continue;
                    }
                }
            }

            // safety: as in `put`.
            match *unsafe { bin.deref() } {
                BinEntry::Moved(next_table) => {
                    table = Shared::from(next_table as *const _);
                    continue;
                }
                BinEntry::Node(ref head) => {
                    let head_lock = head.lock.lock();
                    if t.bin(bini, guard) != bin {
                        drop(head_lock);
                        continue;
                    }

                    let mut bin_count = 1;
                    let mut prev = Shared::null();
                    let mut p = bin;
                    loop {
                        // safety: as in `put`.
                        let n = unsafe { p.deref() }
                            .as_node()
                            .expect("list bins link only nodes");
                        if n.hash == hash && n.key == key {
                            let current = n.value.load(Ordering::SeqCst, guard);
                            let current_ref = if current.is_null() {
                                None
                            } else {
                                // safety: as in `get`.
                                Some(unsafe { current.deref() })
                            };
                            return match remap(&n.key, current_ref) {
                                Some(value) => {
                                    let value = Owned::new(value).into_shared(guard);
                                    let old = n.value.swap(value, Ordering::SeqCst, guard);
                                    drop(head_lock);
                                    if old.is_null() {
                                        // filled an aborted placeholder
                                        self.add_count(1, true, guard);
                                    } else {
                                        // safety: as in `put`.
                                        unsafe { guard.defer_destroy(old) };
                                    }
                                    // safety: as above.
                                    Some(unsafe { value.deref() })
                                }
                                None => {
                                    let was_mapped = !current.is_null();
                                    self.unlink_list_node(t, bini, bin, prev, p, guard);
                                    drop(head_lock);
                                    if was_mapped {
                                        self.add_count(-1, false, guard);
                                    }
                                    None
                                }
                            };
                        }
                        let next = n.next.load(Ordering::SeqCst, guard);
                        if next.is_null() {
                            return match remap(&key, None) {
                                Some(value) => {
                                    let value = Owned::new(value).into_shared(guard);
                                    let node = Owned::new(BinEntry::Node(Node::new(
                                        hash,
                                        key,
                                        Atomic::from(value),
                                    )));
                                    n.next.store(node, Ordering::SeqCst);
                                    drop(head_lock);
                                    if bin_count + 1 >= TREEIFY_THRESHOLD {
                                        self.treeify_bin(t, bini, guard);
                                    }
                                    self.add_count(1, true, guard);
                                    // safety: as above.
                                    Some(unsafe { value.deref() })
                                }
                                None => {
                                    drop(head_lock);
                                    None
                                }
                            };
                        }
                        prev = p;
                        p = next;
                        bin_count += 1;
                    }
                }
                BinEntry::Tree(ref tree_bin) => {
                    let bin_lock = tree_bin.lock.lock();
                    if t.bin(bini, guard) != bin {
                        drop(bin_lock);
                        continue;
                    }

                    let root = tree_bin.root.load(Ordering::SeqCst, guard);
                    let existing = if root.is_null() {
                        Shared::null()
                    } else {
                        TreeNode::find_tree_node(root, hash, &key, guard)
                    };
                    if existing.is_null() {
                        return match remap(&key, None) {
                            Some(value) => {
                                let value = Owned::new(value).into_shared(guard);
                                let inserted =
                                    tree_bin.find_or_put_tree_val(hash, key, value, guard);
                                debug_assert!(inserted.is_null());
                                drop(bin_lock);
                                self.add_count(1, true, guard);
                                // safety: as above.
                                Some(unsafe { value.deref() })
                            }
                            None => {
                                drop(bin_lock);
                                None
                            }
                        };
                    }
                    // safety: as in `put`.
                    let n = &unsafe { TreeNode::get(existing) }.node;
                    let current = n.value.load(Ordering::SeqCst, guard);
                    let current_ref = if current.is_null() {
                        None
                    } else {
                        // safety: as in `get`.
                        Some(unsafe { current.deref() })
                    };
                    return match remap(&n.key, current_ref) {
                        Some(value) => {
                            let value = Owned::new(value).into_shared(guard);
                            let old = n.value.swap(value, Ordering::SeqCst, guard);
                            drop(bin_lock);
                            if old.is_null() {
                                self.add_count(1, true, guard);
                            } else {
                                // safety: as in `put`.
                                unsafe { guard.defer_destroy(old) };
                            }
                            // safety: as above.
                            Some(unsafe { value.deref() })
                        }
                        None => {
                            let was_mapped = !current.is_null();
                            self.remove_tree_entry(t, bini, bin, tree_bin, existing, guard);
                            drop(bin_lock);
                            if was_mapped {
                                self.add_count(-1, false, guard);
                            }
                            None
                        }
                    };
                }
                BinEntry::TreeNode(_) => unreachable!("tree node as bin head"),
            }
        }
    }

    /// Inserts `value` for an unmapped `key`, or combines it with the
    /// current value. `merge` returning `None` removes the mapping.
    pub fn merge<'g, F>(&'g self, key: K, value: V, merge: F, guard: &'g Guard) -> Option<&'g V>
    where
        F: FnOnce(&V, V) -> Option<V>,
    {
        self.compute(
            key,
            |_, current| match current {
                None => Some(value),
                Some(current) => merge(current, value),
            },
            guard,
        )
    }

    /// Replaces the value of `key` if it is currently mapped, returning the
    /// previous value.
    pub fn replace<'g, Q>(&'g self, key: &Q, value: V, guard: &'g Guard) -> Option<&'g V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Ord,
    {
        self.replace_node(key, Some(value), |_| true, guard)
            .map(|(_, old)| old)
    }

    /// Replaces the value of `key` only when the current value satisfies
    /// `condition`, returning the previous value on success.
    pub fn replace_if<'g, Q, F>(
        &'g self,
        key: &Q,
        value: V,
        condition: F,
        guard: &'g Guard,
    ) -> Option<&'g V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Ord,
        F: FnOnce(&V) -> bool,
    {
        self.replace_node(key, Some(value), condition, guard)
            .map(|(_, old)| old)
    }

    /// Removes `key`, returning the value it mapped to.
    pub fn remove<'g, Q>(&'g self, key: &Q, guard: &'g Guard) -> Option<&'g V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Ord,
    {
        self.replace_node(key, None, |_| true, guard)
            .map(|(_, old)| old)
    }

    /// Removes `key`, returning the stored key and value.
    pub fn remove_entry<'g, Q>(&'g self, key: &Q, guard: &'g Guard) -> Option<(&'g K, &'g V)>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Ord,
    {
        self.replace_node(key, None, |_| true, guard)
    }

    /// Removes `key` only when its current value satisfies `condition`.
    pub fn remove_if<'g, Q, F>(&'g self, key: &Q, condition: F, guard: &'g Guard) -> Option<&'g V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Ord,
        F: FnOnce(&V) -> bool,
    {
        self.replace_node(key, None, condition, guard)
            .map(|(_, old)| old)
    }

    /// Shared engine for replace/remove: acts on an existing mapping only,
    /// and only when `condition` accepts the current value.
    fn replace_node<'g, Q, F>(
        &'g self,
        key: &Q,
        new_value: Option<V>,
        condition: F,
        guard: &'g Guard,
    ) -> Option<(&'g K, &'g V)>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Ord,
        F: FnOnce(&V) -> bool,
    {
        let hash = self.hash(key);
        let mut table = self.table.load(Ordering::SeqCst, guard);

        loop {
            if table.is_null() {
                return None;
            }
            // safety: as in `put`.
            let t = unsafe { table.deref() };
            if t.is_empty() {
                return None;
            }
            let bini = t.bini(hash);
            let bin = t.bin(bini, guard);
            if bin.is_null() {
                return None;
            }

            // safety: as in `put`.
            match *unsafe { bin.deref() } {
                BinEntry::Moved(next_table) => {
                    table = Shared::from(next_table as *const _);
                    continue;
                }
                BinEntry::Node(ref head) => {
                    let head_lock = head.lock.lock();
                    if t.bin(bini, guard) != bin {
                        drop(head_lock);
                        continue;
                    }

                    let mut prev = Shared::null();
                    let mut p = bin;
                    loop {
                        // safety: as in `put`.
                        let n = unsafe { p.deref() }
                            .as_node()
                            .expect("list bins link only nodes");
                        if n.hash == hash && n.key.borrow() == key {
                            let current = n.value.load(Ordering::SeqCst, guard);
                            if current.is_null() {
                                // placeholder; nothing mapped
                                drop(head_lock);
                                return None;
                            }
                            // safety: as in `get`.
                            let current_ref = unsafe { current.deref() };
                            if !condition(current_ref) {
                                drop(head_lock);
                                return None;
                            }
                            match new_value {
                                Some(value) => {
                                    let value = Owned::new(value);
                                    let old = n.value.swap(value, Ordering::SeqCst, guard);
                                    drop(head_lock);
                                    // safety: as in `put`.
                                    unsafe { guard.defer_destroy(old) };
                                    return Some((&n.key, current_ref));
                                }
                                None => {
                                    self.unlink_list_node(t, bini, bin, prev, p, guard);
                                    drop(head_lock);
                                    self.add_count(-1, false, guard);
                                    return Some((&n.key, current_ref));
                                }
                            }
                        }
                        let next = n.next.load(Ordering::SeqCst, guard);
                        if next.is_null() {
                            drop(head_lock);
                            return None;
                        }
                        prev = p;
                        p = next;
                    }
                }
                BinEntry::Tree(ref tree_bin) => {
                    let bin_lock = tree_bin.lock.lock();
                    if t.bin(bini, guard) != bin {
                        drop(bin_lock);
                        continue;
                    }

                    let root = tree_bin.root.load(Ordering::SeqCst, guard);
                    let existing = if root.is_null() {
                        Shared::null()
                    } else {
                        TreeNode::find_tree_node(root, hash, key, guard)
                    };
                    if existing.is_null() {
                        drop(bin_lock);
                        return None;
                    }
                    // safety: as in `put`.
                    let n = &unsafe { TreeNode::get(existing) }.node;
                    let current = n.value.load(Ordering::SeqCst, guard);
                    if current.is_null() {
                        drop(bin_lock);
                        return None;
                    }
                    // safety: as in `get`.
                    let current_ref = unsafe { current.deref() };
                    if !condition(current_ref) {
                        drop(bin_lock);
                        return None;
                    }
                    match new_value {
                        Some(value) => {
                            let value = Owned::new(value);
                            let old = n.value.swap(value, Ordering::SeqCst, guard);
                            drop(bin_lock);
                            // safety: as in `put`.
                            unsafe { guard.defer_destroy(old) };
                            return Some((&n.key, current_ref));
                        }
                        None => {
                            self.remove_tree_entry(t, bini, bin, tree_bin, existing, guard);
                            drop(bin_lock);
                            self.add_count(-1, false, guard);
                            return Some((&n.key, current_ref));
                        }
                    }
                }
                BinEntry::TreeNode(_) => unreachable!("tree node as bin head"),
            }
        }
    }

    /* ---------------- Bulk operations -------------- */

    /// Removes every mapping. Weakly consistent: entries inserted
    /// concurrently may survive.
    pub fn clear(&self, guard: &Guard) {
        let mut removed: isize = 0;
        let mut table = self.table.load(Ordering::SeqCst, guard);
        let mut bini = 0;

        'table: while !table.is_null() {
            // safety: as in `put`.
            let t = unsafe { table.deref() };
            while bini < t.len() {
                let bin = t.bin(bini, guard);
                if bin.is_null() {
                    bini += 1;
                    continue;
                }
                // safety: as in `put`.
                match *unsafe { bin.deref() } {
                    BinEntry::Moved(_) => {
                        // transfer in flight; wait for the new table to
                        // become current, then rescan it from the start
                        let backoff = Backoff::new();
                        while self.state.load(Ordering::SeqCst) == RESIZING {
                            backoff.snooze();
                        }
                        table = self.table.load(Ordering::SeqCst, guard);
                        bini = 0;
                        continue 'table;
                    }
                    BinEntry::Node(ref head) => {
                        let head_lock = head.lock.lock();
                        if t.bin(bini, guard) != bin {
                            drop(head_lock);
                            continue;
                        }
                        t.store_bin(bini, Shared::null());
                        let mut p = bin;
                        while !p.is_null() {
                            // safety: as in `put`.
                            let n = unsafe { p.deref() }
                                .as_node()
                                .expect("list bins link only nodes");
                            let value = n.value.load(Ordering::SeqCst, guard);
                            if !value.is_null() {
                                removed -= 1;
                                // safety: unlinked under the bin lock.
                                unsafe { guard.defer_destroy(value) };
                            }
                            let next = n.next.load(Ordering::SeqCst, guard);
                            // safety: as above.
                            unsafe { guard.defer_destroy(p) };
                            p = next;
                        }
                        drop(head_lock);
                        bini += 1;
                    }
                    BinEntry::Tree(ref tree_bin) => {
                        let bin_lock = tree_bin.lock.lock();
                        if t.bin(bini, guard) != bin {
                            drop(bin_lock);
                            continue;
                        }
                        t.store_bin(bini, Shared::null());
                        let mut p = tree_bin.first.load(Ordering::SeqCst, guard);
                        while !p.is_null() {
                            // safety: as in `put`.
                            let n = &unsafe { TreeNode::get(p) }.node;
                            let value = n.value.load(Ordering::SeqCst, guard);
                            if !value.is_null() {
                                removed -= 1;
                                // safety: unlinked under the bin lock.
                                unsafe { guard.defer_destroy(value) };
                            }
                            p = n.next.load(Ordering::SeqCst, guard);
                        }
                        // the tree bin's drop frees its nodes but not the
                        // values, which we just retired ourselves
                        // safety: as above.
                        unsafe { guard.defer_destroy(bin) };
                        drop(bin_lock);
                        bini += 1;
                    }
                    BinEntry::TreeNode(_) => unreachable!("tree node as bin head"),
                }
            }
            break;
        }

        if removed != 0 {
            self.count.add(removed as i64);
        }
    }

    /// Keeps only the entries `f` accepts. An entry whose value changes
    /// between the check and the removal is kept.
    pub fn retain<F>(&self, mut f: F, guard: &Guard)
    where
        F: FnMut(&K, &V) -> bool,
    {
        for (k, v) in self.iter(guard) {
            if !f(k, v) {
                // only remove if the value is still the one we tested
                self.replace_node(k, None, |current| std::ptr::eq(current, v), guard);
            }
        }
    }

    /// Keeps only the entries `f` accepts, removing rejected keys even if
    /// their value has changed since the check.
    pub fn retain_force<F>(&self, mut f: F, guard: &Guard)
    where
        F: FnMut(&K, &V) -> bool,
    {
        for (k, v) in self.iter(guard) {
            if !f(k, v) {
                self.replace_node(k, None, |_| true, guard);
            }
        }
    }

    /// Pre-sizes the table for `additional` further entries, so bulk
    /// insertion does not resize repeatedly.
    pub fn reserve(&self, additional: usize, guard: &Guard) {
        let absolute = self.len().saturating_add(additional);
        self.try_presize(absolute, guard);
    }

    /* ---------------- Iteration -------------- */

    /// Iterates over the entries. Weakly consistent: concurrent updates may
    /// or may not be reflected, but entries present for the whole traversal
    /// are yielded, each at most once.
    pub fn iter<'g>(&'g self, guard: &'g Guard) -> Iter<'g, K, V> {
        let table = self.table.load(Ordering::SeqCst, guard);
        let table = if table.is_null() {
            None
        } else {
            // safety: as in `put`.
            Some(unsafe { table.deref() })
        };
        Iter {
            node_iter: NodeIter::new(table, guard),
            guard,
        }
    }

    /// Iterates over the keys. See [`iter`](DriftMap::iter).
    pub fn keys<'g>(&'g self, guard: &'g Guard) -> Keys<'g, K, V> {
        Keys {
            iter: self.iter(guard),
        }
    }

    /// Iterates over the values. See [`iter`](DriftMap::iter).
    pub fn values<'g>(&'g self, guard: &'g Guard) -> Values<'g, K, V> {
        Values {
            iter: self.iter(guard),
        }
    }

    /* ---------------- Table lifecycle -------------- */

    /// Creates the first table. Exactly one thread builds it; the rest
    /// yield until it is published.
    fn init_table<'g>(&'g self, guard: &'g Guard) -> Shared<'g, Table<K, V>> {
        loop {
            let table = self.table.load(Ordering::SeqCst, guard);
            if !table.is_null() {
                return table;
            }
            match self.state.compare_exchange(
                UNINIT,
                INITIALIZING,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    let capacity = self.initial_capacity.load(Ordering::SeqCst);
                    let new_table = Owned::new(Table::new(capacity)).into_shared(guard);
                    self.table.store(new_table, Ordering::SeqCst);
                    self.threshold
                        .store(capacity - (capacity >> 2), Ordering::SeqCst);
                    self.state.store(LIVE, Ordering::SeqCst);
                    return new_table;
                }
                Err(_) => {
                    // initialization or a resize is in flight elsewhere
                    let backoff = Backoff::new();
                    while self.state.load(Ordering::SeqCst) == INITIALIZING {
                        backoff.snooze();
                    }
                }
            }
        }
    }

    /// Adjusts the live count and, after insertions, starts a resize when
    /// the count crossed the threshold.
    fn add_count(&self, delta: isize, check_resize: bool, guard: &Guard) {
        self.count.add(delta as i64);
        if !check_resize {
            return;
        }
        loop {
            if self.state.load(Ordering::SeqCst) != LIVE {
                // initialization or a resize is already in flight
                break;
            }
            if self.len() < self.threshold.load(Ordering::SeqCst) {
                break;
            }
            if self
                .state
                .compare_exchange(LIVE, RESIZING, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                break;
            }
            // we are the resizer now; re-check against the current table
            let table = self.table.load(Ordering::SeqCst, guard);
            // safety: the current table cannot be retired while the state
            // is RESIZING and we are the resizing thread.
            if table.is_null() || unsafe { table.deref() }.len() >= MAXIMUM_CAPACITY {
                self.state.store(LIVE, Ordering::SeqCst);
                break;
            }
            if self.len() < self.threshold.load(Ordering::SeqCst) {
                self.state.store(LIVE, Ordering::SeqCst);
                break;
            }
            self.transfer(table, guard);
            // loop: one doubling may not be enough after a bulk insert
        }
    }

    /// Grows the table until it can hold `size` elements.
    fn try_presize(&self, size: usize, guard: &Guard) {
        let requested = Self::table_size_for(size);
        loop {
            match self.state.load(Ordering::SeqCst) {
                UNINIT => {
                    self.initial_capacity.fetch_max(requested, Ordering::SeqCst);
                    if self.state.load(Ordering::SeqCst) == UNINIT {
                        return;
                    }
                }
                LIVE => {
                    let table = self.table.load(Ordering::SeqCst, guard);
                    if table.is_null() {
                        continue;
                    }
                    // safety: as in `put`.
                    let n = unsafe { table.deref() }.len();
                    if n >= requested || n >= MAXIMUM_CAPACITY {
                        return;
                    }
                    if self
                        .state
                        .compare_exchange(LIVE, RESIZING, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                    {
                        let table = self.table.load(Ordering::SeqCst, guard);
                        // safety: as in `add_count`; we are the resizer.
                        if table.is_null() || unsafe { table.deref() }.len() >= requested {
                            self.state.store(LIVE, Ordering::SeqCst);
                            return;
                        }
                        self.transfer(table, guard);
                    }
                }
                _ => std::thread::yield_now(),
            }
        }
    }

    /// Moves every bin of `table` into a table twice its size, leaving a
    /// forwarding marker behind each. Runs on the single thread that won
    /// the LIVE to RESIZING transition; publishes the new table and returns
    /// the state to LIVE.
    fn transfer<'g>(&'g self, table: Shared<'g, Table<K, V>>, guard: &'g Guard) {
        // safety: as in `add_count`; the table stays live while we hold the
        // RESIZING state.
        let t = unsafe { table.deref() };
        let n = t.len();
        let next_n = n << 1;

        let next_table = Owned::new(Table::new(next_n)).into_shared(guard);
        self.next_table.store(next_table, Ordering::SeqCst);
        // safety: we just allocated it.
        let next = unsafe { next_table.deref() };

        // bins whose lock was contended; revisited later so one stuck
        // writer does not stall the whole sweep
        let mut deferred: VecDeque<usize> = VecDeque::new();

        for i in (0..n).rev() {
            if !self.transfer_bin(t, next, next_table, i, false, guard) {
                deferred.push_back(i);
                if deferred.len() >= TRANSFER_BUFFER_SIZE {
                    let oldest = deferred.pop_front().expect("buffer is full");
                    self.transfer_bin(t, next, next_table, oldest, true, guard);
                }
            }
        }
        while let Some(i) = deferred.pop_front() {
            self.transfer_bin(t, next, next_table, i, true, guard);
        }

        self.table.store(next_table, Ordering::SeqCst);
        self.next_table.store(Shared::null(), Ordering::SeqCst);
        self.threshold.store(next_n - (next_n >> 2), Ordering::SeqCst);
        self.state.store(LIVE, Ordering::SeqCst);
        // the old table now holds only forwarding markers; readers that
        // already hold it still route through them, so retire, not drop
        // safety: unlinked from self.table; no new thread can load it.
        unsafe { guard.defer_destroy(table) };
    }

    /// Transfers bin `i`. Returns `false` when the bin lock was contended
    /// and `block` was not set.
    fn transfer_bin<'g>(
        &'g self,
        t: &'g Table<K, V>,
        next: &'g Table<K, V>,
        next_table: Shared<'g, Table<K, V>>,
        i: usize,
        block: bool,
        guard: &'g Guard,
    ) -> bool {
        loop {
            let bin = t.bin(i, guard);
            if bin.is_null() {
                let marker = Owned::new(BinEntry::Moved(next_table.as_raw()));
                match t.cas_bin(i, Shared::null(), marker, guard) {
                    Ok(_) => return true,
                    Err(_) => continue,
                }
            }
            // safety: as in `put`.
            match *unsafe { bin.deref() } {
                BinEntry::Moved(_) => return true,
                BinEntry::Node(ref head) => {
                    let head_lock = if block {
                        head.lock.lock()
                    } else {
                        match head.lock.try_lock() {
                            Some(lock) => lock,
                            None => return false,
                        }
                    };
                    if t.bin(i, guard) != bin {
                        drop(head_lock);
                        continue;
                    }
                    self.split_list_bin(t, next, next_table, i, bin, guard);
                    drop(head_lock);
                    return true;
                }
                BinEntry::Tree(ref tree_bin) => {
                    let bin_lock = if block {
                        tree_bin.lock.lock()
                    } else {
                        match tree_bin.lock.try_lock() {
                            Some(lock) => lock,
                            None => return false,
                        }
                    };
                    if t.bin(i, guard) != bin {
                        drop(bin_lock);
                        continue;
                    }
                    self.split_tree_bin(t, next, next_table, i, bin, tree_bin, guard);
                    drop(bin_lock);
                    return true;
                }
                BinEntry::TreeNode(_) => unreachable!("tree node as bin head"),
            }
        }
    }

    /// Splits a locked list bin into the two bins it maps to in the doubled
    /// table, reusing the longest tail run that lands in one half.
    fn split_list_bin<'g>(
        &'g self,
        t: &'g Table<K, V>,
        next: &'g Table<K, V>,
        next_table: Shared<'g, Table<K, V>>,
        i: usize,
        bin: Shared<'g, BinEntry<K, V>>,
        guard: &'g Guard,
    ) {
        let n = t.len() as u64;

        // the longest suffix whose entries all map to the same half can be
        // reused as-is; only the prefix needs cloning
        // safety throughout: the chain is stable under the bin lock we hold;
        // nodes are retired only after a grace period.
        let mut run_bit = unsafe { bin.deref() }
            .as_node()
            .expect("list bins link only nodes")
            .hash
            & n;
        let mut last_run = bin;
        let mut p = bin;
        loop {
            let node = unsafe { p.deref() }
                .as_node()
                .expect("list bins link only nodes");
            let next_p = node.next.load(Ordering::SeqCst, guard);
            if next_p.is_null() {
                break;
            }
            let next_bit = unsafe { next_p.deref() }
                .as_node()
                .expect("list bins link only nodes")
                .hash
                & n;
            if next_bit != run_bit {
                run_bit = next_bit;
                last_run = next_p;
            }
            p = next_p;
        }

        let mut low = Shared::null();
        let mut high = Shared::null();
        if run_bit == 0 {
            low = last_run;
        } else {
            high = last_run;
        }

        let mut p = bin;
        while p != last_run {
            let node = unsafe { p.deref() }
                .as_node()
                .expect("list bins link only nodes");
            let link = if node.hash & n == 0 { &mut low } else { &mut high };
            // the clone shares the value pointer; only the node shell and
            // the key are duplicated
            let new_node = Node::new(node.hash, node.key.clone(), node.value.clone());
            new_node.next.store(*link, Ordering::SeqCst);
            *link = Owned::new(BinEntry::Node(new_node)).into_shared(guard);
            p = node.next.load(Ordering::SeqCst, guard);
        }

        next.store_bin(i, low);
        next.store_bin(i + n as usize, high);
        t.store_bin(i, Owned::new(BinEntry::Moved(next_table.as_raw())));

        // retire the cloned prefix; the reused suffix lives on in the new
        // table
        let mut p = bin;
        while p != last_run {
            let next_p = unsafe { p.deref() }
                .as_node()
                .expect("list bins link only nodes")
                .next
                .load(Ordering::SeqCst, guard);
            // safety: replaced by the forwarding marker above; late readers
            // may still walk it until the epoch turns over.
            unsafe { guard.defer_destroy(p) };
            p = next_p;
        }
    }

    /// Splits a locked tree bin into its two target bins, reverting a half
    /// to a plain list when it has shrunk enough.
    #[allow(clippy::too_many_arguments)]
    fn split_tree_bin<'g>(
        &'g self,
        t: &'g Table<K, V>,
        next: &'g Table<K, V>,
        next_table: Shared<'g, Table<K, V>>,
        i: usize,
        bin: Shared<'g, BinEntry<K, V>>,
        tree_bin: &'g TreeBin<K, V>,
        guard: &'g Guard,
    ) {
        let n = t.len() as u64;

        let mut low_entries = Vec::new();
        let mut high_entries = Vec::new();
        let mut p = tree_bin.first.load(Ordering::SeqCst, guard);
        while !p.is_null() {
            // safety: the list view is stable under the bin lock we hold.
            let node = &unsafe { TreeNode::get(p) }.node;
            let entry = (node.hash, node.key.clone(), node.value.clone());
            if node.hash & n == 0 {
                low_entries.push(entry);
            } else {
                high_entries.push(entry);
            }
            p = node.next.load(Ordering::SeqCst, guard);
        }

        next.store_bin(i, Self::build_split_half(low_entries, guard));
        next.store_bin(i + n as usize, Self::build_split_half(high_entries, guard));
        t.store_bin(i, Owned::new(BinEntry::Moved(next_table.as_raw())));

        // the tree bin's drop frees the old tree nodes, not the values the
        // new bins now share
        // safety: replaced by the forwarding marker above.
        unsafe { guard.defer_destroy(bin) };
    }

    /// Builds one half of a split bin: nothing, a plain list, or a new tree,
    /// depending on how many entries landed in it.
    fn build_split_half<'g>(
        entries: Vec<(u64, K, Atomic<V>)>,
        guard: &'g Guard,
    ) -> Shared<'g, BinEntry<K, V>> {
        if entries.is_empty() {
            return Shared::null();
        }
        if entries.len() <= UNTREEIFY_THRESHOLD {
            let mut head = Shared::null();
            for (hash, key, value) in entries.into_iter().rev() {
                let node = Node::new(hash, key, value);
                node.next.store(head, Ordering::SeqCst);
                head = Owned::new(BinEntry::Node(node)).into_shared(guard);
            }
            head
        } else {
            let mut head = Shared::null();
            for (hash, key, value) in entries.into_iter().rev() {
                let tree_node = TreeNode::new(hash, key, value);
                tree_node.node.next.store(head, Ordering::SeqCst);
                let new_head = Owned::new(BinEntry::TreeNode(tree_node)).into_shared(guard);
                if !head.is_null() {
                    // safety: the chain is unshared until the bin is stored.
                    unsafe { TreeNode::get(head) }
                        .prev
                        .store(new_head, Ordering::SeqCst);
                }
                head = new_head;
            }
            Owned::new(BinEntry::Tree(TreeBin::new(head, guard))).into_shared(guard)
        }
    }

    /// Replaces the list bin at `index` with a tree bin when it is still
    /// long enough. Caller does not hold the bin lock.
    fn treeify_bin<'g>(&'g self, t: &'g Table<K, V>, index: usize, guard: &'g Guard) {
        let bin = t.bin(index, guard);
        if bin.is_null() {
            return;
        }
        // safety: as in `put`.
        let BinEntry::Node(ref head) = *(unsafe { bin.deref() }) else {
            // already a tree, or moved; nothing to do
            return;
        };
        let head_lock = head.lock.lock();
        if t.bin(index, guard) != bin {
            drop(head_lock);
            return;
        }

        // rebuild the chain as tree nodes sharing the value pointers
        let mut chain_head = Shared::null();
        let mut chain_tail: Shared<'_, BinEntry<K, V>> = Shared::null();
        let mut p = bin;
        while !p.is_null() {
            // safety: the chain is stable under the bin lock.
            let node = unsafe { p.deref() }
                .as_node()
                .expect("list bins link only nodes");
            let tree_node = Owned::new(BinEntry::TreeNode(TreeNode::new(
                node.hash,
                node.key.clone(),
                node.value.clone(),
            )))
            .into_shared(guard);
            if chain_tail.is_null() {
                chain_head = tree_node;
            } else {
                // safety: the new chain is unshared until the bin is stored.
                let tail = unsafe { TreeNode::get(chain_tail) };
                tail.node.next.store(tree_node, Ordering::SeqCst);
                unsafe { TreeNode::get(tree_node) }
                    .prev
                    .store(chain_tail, Ordering::SeqCst);
            }
            chain_tail = tree_node;
            p = node.next.load(Ordering::SeqCst, guard);
        }

        t.store_bin(
            index,
            Owned::new(BinEntry::Tree(TreeBin::new(chain_head, guard))),
        );
        drop(head_lock);

        // retire the old list nodes; their values live on in the tree
        let mut p = bin;
        while !p.is_null() {
            // safety: unlinked above; late readers drain with the epoch.
            let next_p = unsafe { p.deref() }
                .as_node()
                .expect("list bins link only nodes")
                .next
                .load(Ordering::SeqCst, guard);
            unsafe { guard.defer_destroy(p) };
            p = next_p;
        }
    }

    /* ---------------- Locked-bin helpers -------------- */

    /// Publishes a locked placeholder node (null value, invisible to
    /// readers) into the empty bin `bini`. On success the placeholder's
    /// mutex is held by the current thread and acts as the bin lock; the
    /// caller must fill the value and `force_unlock`, or discard the claim.
    /// On a lost race the key is handed back.
    fn claim_empty_bin<'g>(
        &'g self,
        t: &'g Table<K, V>,
        bini: usize,
        hash: u64,
        key: K,
        guard: &'g Guard,
    ) -> Result<Shared<'g, BinEntry<K, V>>, K> {
        let node = Owned::new(BinEntry::Node(Node::new(hash, key, Atomic::null())))
            .into_shared(guard);
        // safety: we just allocated the node; nothing else references it.
        let head = unsafe { node.deref() }
            .as_node()
            .expect("placeholder is a list node");
        // uncontended: the node is not yet published
        std::mem::forget(head.lock.lock());

        match t.cas_bin(bini, Shared::null(), node, guard) {
            Ok(_) => Ok(node),
            Err(_) => {
                // safety: the node was never published; unlock and reclaim.
                unsafe { head.lock.force_unlock() };
                // safety: as above, sole owner.
                let BinEntry::Node(node) = *unsafe { node.into_owned() }.into_box() else {
                    unreachable!("placeholder is a list node");
                };
                Err(node.key)
            }
        }
    }

    /// Rolls back a claimed-but-unfilled placeholder bin: empties the slot,
    /// releases the lock, and retires the placeholder.
    fn discard_claimed_bin<'g>(
        &'g self,
        t: &'g Table<K, V>,
        bini: usize,
        head: Shared<'g, BinEntry<K, V>>,
        guard: &'g Guard,
    ) {
        t.store_bin(bini, Shared::null());
        // safety: we hold the claim made in claim_empty_bin.
        let head_node = unsafe { head.deref() }
            .as_node()
            .expect("placeholder is a list node");
        unsafe { head_node.lock.force_unlock() };
        // safety: unlinked; late readers drain with the epoch.
        unsafe { guard.defer_destroy(head) };
    }

    /// Unlinks `p` (whose predecessor in the chain is `prev`, or null if
    /// `p` is the bin head `bin`) and retires the node and its value.
    /// Caller holds the bin lock.
    fn unlink_list_node<'g>(
        &'g self,
        t: &'g Table<K, V>,
        bini: usize,
        bin: Shared<'g, BinEntry<K, V>>,
        prev: Shared<'g, BinEntry<K, V>>,
        p: Shared<'g, BinEntry<K, V>>,
        guard: &'g Guard,
    ) {
        // safety: the chain is stable under the bin lock.
        let n = unsafe { p.deref() }
            .as_node()
            .expect("list bins link only nodes");
        let next = n.next.load(Ordering::SeqCst, guard);
        if prev.is_null() {
            debug_assert_eq!(p, bin);
            t.store_bin(bini, next);
        } else {
            // safety: as above.
            unsafe { prev.deref() }
                .as_node()
                .expect("list bins link only nodes")
                .next
                .store(next, Ordering::SeqCst);
        }
        let value = n.value.load(Ordering::SeqCst, guard);
        if !value.is_null() {
            // safety: unlinked under the bin lock.
            unsafe { guard.defer_destroy(value) };
        }
        // safety: as above.
        unsafe { guard.defer_destroy(p) };
    }

    /// Removes the tree node `p` from the tree bin at `bini`, reverting the
    /// bin to a plain list if the tree has become too small. Caller holds
    /// the tree bin's write mutex.
    #[allow(clippy::too_many_arguments)]
    fn remove_tree_entry<'g>(
        &'g self,
        t: &'g Table<K, V>,
        bini: usize,
        bin: Shared<'g, BinEntry<K, V>>,
        tree_bin: &'g TreeBin<K, V>,
        p: Shared<'g, BinEntry<K, V>>,
        guard: &'g Guard,
    ) {
        // retire the value first; the node itself follows below
        // safety: the tree is stable under the bin mutex we hold.
        let n = &unsafe { TreeNode::get(p) }.node;
        let value = n.value.load(Ordering::SeqCst, guard);
        if !value.is_null() {
            // safety: unlinked under the bin mutex.
            unsafe { guard.defer_destroy(value) };
        }

        if tree_bin.remove_tree_node(p, guard) {
            // too small to stay a tree; rebuild the remainder as a list
            let mut head = Shared::null();
            let mut tail: Shared<'_, BinEntry<K, V>> = Shared::null();
            let mut q = tree_bin.first.load(Ordering::SeqCst, guard);
            while !q.is_null() {
                // safety: as above.
                let node = &unsafe { TreeNode::get(q) }.node;
                let new_node = Owned::new(BinEntry::Node(Node::new(
                    node.hash,
                    node.key.clone(),
                    node.value.clone(),
                )))
                .into_shared(guard);
                if tail.is_null() {
                    head = new_node;
                } else {
                    // safety: the new chain is unshared until stored.
                    unsafe { tail.deref() }
                        .as_node()
                        .expect("list bins link only nodes")
                        .next
                        .store(new_node, Ordering::SeqCst);
                }
                tail = new_node;
                q = node.next.load(Ordering::SeqCst, guard);
            }
            t.store_bin(bini, head);
            // the tree bin's drop frees the remaining tree nodes; the
            // values moved into the list
            // safety: unlinked above.
            unsafe { guard.defer_destroy(bin) };
        }
        // safety: `p` was unlinked by remove_tree_node.
        unsafe { guard.defer_destroy(p) };
    }
}

/// Runs `make_value` for a claimed placeholder bin, publishing the result
/// and releasing the claim; on panic the claim is rolled back first.
fn run_claimed<'g, K, V, S>(
    map: &'g DriftMap<K, V, S>,
    t: &'g Table<K, V>,
    bini: usize,
    head: Shared<'g, BinEntry<K, V>>,
    guard: &'g Guard,
    make_value: impl FnOnce() -> Owned<V>,
) -> Shared<'g, V>
where
    K: Sync + Send + Clone + Hash + Ord,
    V: Sync + Send,
    S: BuildHasher,
{
    match panic::catch_unwind(AssertUnwindSafe(make_value)) {
        Ok(value) => {
            let value = value.into_shared(guard);
            // safety: we own the placeholder claim.
            let head_node = unsafe { head.deref() }
                .as_node()
                .expect("placeholder is a list node");
            head_node.value.store(value, Ordering::SeqCst);
            // safety: locked in claim_empty_bin.
            unsafe { head_node.lock.force_unlock() };
            value
        }
        Err(panic_payload) => {
            map.discard_claimed_bin(t, bini, head, guard);
            panic::resume_unwind(panic_payload);
        }
    }
}

impl<K, V, S> Drop for DriftMap<K, V, S> {
    fn drop(&mut self) {
        // safety: &mut self means no thread is inside the map; plain
        // ownership suffices.
        let guard = unsafe { epoch::unprotected() };
        debug_assert!(self.next_table.load(Ordering::SeqCst, guard).is_null());
        let table = self.table.swap(Shared::null(), Ordering::SeqCst, guard);
        if !table.is_null() {
            // safety: sole owner.
            let mut table = unsafe { table.into_owned() };
            table.drop_bins();
        }
    }
}

impl<K, V, S> fmt::Debug for DriftMap<K, V, S>
where
    K: Sync + Send + Clone + Hash + Ord + fmt::Debug,
    V: Sync + Send + fmt::Debug,
    S: BuildHasher,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.guard();
        f.debug_map().entries(self.iter(&guard)).finish()
    }
}

impl<K, V, S> Clone for DriftMap<K, V, S>
where
    K: Sync + Send + Clone + Hash + Ord,
    V: Sync + Send + Clone,
    S: BuildHasher + Clone,
{
    fn clone(&self) -> Self {
        let cloned = Self::with_capacity_and_hasher(self.len(), self.build_hasher.clone());
        let guard = self.guard();
        for (k, v) in self.iter(&guard) {
            cloned.insert(k.clone(), v.clone(), &guard);
        }
        cloned
    }
}

impl<K, V, S> PartialEq for DriftMap<K, V, S>
where
    K: Sync + Send + Clone + Hash + Ord,
    V: Sync + Send + PartialEq,
    S: BuildHasher,
{
    fn eq(&self, other: &Self) -> bool {
        if self.len() != other.len() {
            return false;
        }
        let guard = self.guard();
        self.iter(&guard)
            .all(|(k, v)| other.get(k, &guard) == Some(v))
    }
}

impl<K, V, S> Eq for DriftMap<K, V, S>
where
    K: Sync + Send + Clone + Hash + Ord,
    V: Sync + Send + Eq,
    S: BuildHasher,
{
}

impl<K, V, S> Extend<(K, V)> for &DriftMap<K, V, S>
where
    K: Sync + Send + Clone + Hash + Ord,
    V: Sync + Send,
    S: BuildHasher,
{
    fn extend<T: IntoIterator<Item = (K, V)>>(&mut self, iter: T) {
        let iter = iter.into_iter();
        // same presize heuristic as the standard library: assume the hint
        // is exact when the map starts empty, half otherwise
        let reserve = if self.is_empty() {
            iter.size_hint().0
        } else {
            iter.size_hint().0 / 2
        };
        let guard = self.guard();
        self.reserve(reserve, &guard);
        for (key, value) in iter {
            self.insert(key, value, &guard);
        }
    }
}

impl<K, V, S> FromIterator<(K, V)> for DriftMap<K, V, S>
where
    K: Sync + Send + Clone + Hash + Ord,
    V: Sync + Send,
    S: BuildHasher + Default,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let map = Self::default();
        (&map).extend(iter);
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    /// Sends every key to the same bin, forcing list growth and tree
    /// conversion.
    #[derive(Clone, Default)]
    struct CollidingHasher;

    impl BuildHasher for CollidingHasher {
        type Hasher = ConstantHasher;

        fn build_hasher(&self) -> ConstantHasher {
            ConstantHasher
        }
    }

    struct ConstantHasher;

    impl Hasher for ConstantHasher {
        fn finish(&self) -> u64 {
            42
        }

        fn write(&mut self, _bytes: &[u8]) {}
    }

    #[test]
    fn insert_get_remove() {
        let map = DriftMap::new();
        let guard = map.guard();
        assert_eq!(map.insert(1, "one", &guard), None);
        assert_eq!(map.insert(1, "uno", &guard), Some(&"one"));
        assert_eq!(map.get(&1, &guard), Some(&"uno"));
        assert_eq!(map.remove(&1, &guard), Some(&"uno"));
        assert_eq!(map.get(&1, &guard), None);
        assert_eq!(map.len(), 0);
    }

    #[test]
    fn try_insert_reports_conflict() {
        let map = DriftMap::new();
        let guard = map.guard();
        assert_eq!(map.try_insert(1, 10, &guard), Ok(&10));
        let err = map.try_insert(1, 20, &guard).unwrap_err();
        assert_eq!(*err.current, 10);
        assert_eq!(err.not_inserted, 20);
        assert_eq!(map.get(&1, &guard), Some(&10));
    }

    #[rstest]
    #[case::present(true)]
    #[case::absent(false)]
    fn compute_if_absent_inserts_once(#[case] prefill: bool) {
        let map = DriftMap::new();
        let guard = map.guard();
        if prefill {
            map.insert(7, 70, &guard);
        }
        let v = map.compute_if_absent(7, |_| 700, &guard);
        assert_eq!(*v, if prefill { 70 } else { 700 });
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn compute_inserts_updates_and_removes() {
        let map = DriftMap::new();
        let guard = map.guard();

        assert_eq!(map.compute(1, |_, v| v.map_or(Some(1), |_| None), &guard), Some(&1));
        assert_eq!(
            map.compute(1, |_, v| v.map(|v| v + 10), &guard),
            Some(&11)
        );
        assert_eq!(map.compute(1, |_, _| None, &guard), None);
        assert_eq!(map.get(&1, &guard), None);
        assert_eq!(map.len(), 0);

        // removing an absent key is a no-op
        assert_eq!(map.compute(2, |_, _| None, &guard), None);
        assert_eq!(map.len(), 0);
    }

    #[test]
    fn compute_if_present_skips_absent_keys() {
        let map = DriftMap::new();
        let guard = map.guard();
        assert_eq!(map.compute_if_present(&1, |_, v| Some(v + 1), &guard), None);
        map.insert(1, 5, &guard);
        assert_eq!(map.compute_if_present(&1, |_, v| Some(v + 1), &guard), Some(&6));
        assert_eq!(map.compute_if_present(&1, |_, _| None, &guard), None);
        assert!(!map.contains_key(&1, &guard));
    }

    #[test]
    fn merge_combines_values() {
        let map = DriftMap::new();
        let guard = map.guard();
        assert_eq!(map.merge(1, 2, |old, new| Some(old + new), &guard), Some(&2));
        assert_eq!(map.merge(1, 3, |old, new| Some(old + new), &guard), Some(&5));
        assert_eq!(map.merge(1, 0, |_, _| None, &guard), None);
        assert!(map.is_empty());
    }

    #[test]
    fn replace_and_conditions() {
        let map = DriftMap::new();
        let guard = map.guard();
        assert_eq!(map.replace(&1, 10, &guard), None);
        assert!(!map.contains_key(&1, &guard));

        map.insert(1, 10, &guard);
        assert_eq!(map.replace(&1, 11, &guard), Some(&10));
        assert_eq!(map.replace_if(&1, 99, |v| *v == 10, &guard), None);
        assert_eq!(map.get(&1, &guard), Some(&11));
        assert_eq!(map.remove_if(&1, |v| *v == 10, &guard), None);
        assert_eq!(map.remove_if(&1, |v| *v == 11, &guard), Some(&11));
        assert!(map.is_empty());
    }

    #[test]
    fn growth_preserves_entries() {
        let map = DriftMap::new();
        let guard = map.guard();
        for i in 0..10_000u32 {
            map.insert(i, i.wrapping_mul(31), &guard);
        }
        assert_eq!(map.len(), 10_000);
        for i in 0..10_000u32 {
            assert_eq!(map.get(&i, &guard), Some(&i.wrapping_mul(31)), "key {i}");
        }
    }

    #[test]
    fn colliding_keys_treeify_and_survive() {
        let map: DriftMap<u32, u32, _> = DriftMap::with_hasher(CollidingHasher);
        let guard = map.guard();
        for i in 0..1_000u32 {
            map.insert(i, i + 1, &guard);
        }
        assert_eq!(map.len(), 1_000);
        for i in 0..1_000u32 {
            assert_eq!(map.get(&i, &guard), Some(&(i + 1)), "key {i}");
        }
        // remove half, then reinsert new colliding keys
        for i in (0..1_000u32).step_by(2) {
            assert_eq!(map.remove(&i, &guard), Some(&(i + 1)));
        }
        for i in 1_000..1_500u32 {
            map.insert(i, i + 1, &guard);
        }
        assert_eq!(map.len(), 1_000);
        for i in (1..1_000u32).step_by(2) {
            assert_eq!(map.get(&i, &guard), Some(&(i + 1)));
        }
        for i in 1_000..1_500u32 {
            assert_eq!(map.get(&i, &guard), Some(&(i + 1)));
        }
        for i in (0..1_000u32).step_by(2) {
            assert_eq!(map.get(&i, &guard), None);
        }
    }

    #[test]
    fn every_write_path_treeifies_at_the_same_chain_length() {
        fn colliding_bin_is_tree(map: &DriftMap<u32, u32, CollidingHasher>) -> bool {
            let guard = map.guard();
            let t = map.table.load(Ordering::SeqCst, &guard);
            // safety: the table stays live under the guard.
            let t = unsafe { t.deref() };
            let bin = t.bin(t.bini(42), &guard);
            !bin.is_null() && matches!(unsafe { bin.deref() }, BinEntry::Tree(_))
        }

        let map: DriftMap<u32, u32, _> = DriftMap::with_hasher(CollidingHasher);
        let guard = map.guard();
        for i in 0..(TREEIFY_THRESHOLD as u32 - 1) {
            map.insert(i, i, &guard);
        }
        assert!(!colliding_bin_is_tree(&map), "treeified one insert early");
        map.insert(99, 99, &guard);
        assert!(colliding_bin_is_tree(&map), "insert did not treeify");

        let map: DriftMap<u32, u32, _> = DriftMap::with_hasher(CollidingHasher);
        let guard = map.guard();
        for i in 0..(TREEIFY_THRESHOLD as u32 - 1) {
            map.compute_if_absent(i, |_| i, &guard);
        }
        assert!(!colliding_bin_is_tree(&map), "treeified one compute early");
        map.compute_if_absent(99, |_| 99, &guard);
        assert!(colliding_bin_is_tree(&map), "compute did not treeify");
    }

    #[test]
    fn clear_empties_the_map() {
        let map = DriftMap::new();
        let guard = map.guard();
        for i in 0..100u32 {
            map.insert(i, i, &guard);
        }
        map.clear(&guard);
        assert_eq!(map.len(), 0);
        assert_eq!(map.iter(&guard).count(), 0);
        // still usable
        map.insert(1, 1, &guard);
        assert_eq!(map.get(&1, &guard), Some(&1));
    }

    #[test]
    fn retain_and_retain_force() {
        let map = DriftMap::new();
        let guard = map.guard();
        for i in 0..100u32 {
            map.insert(i, i, &guard);
        }
        map.retain(|_, v| v % 2 == 0, &guard);
        assert_eq!(map.len(), 50);
        map.retain_force(|k, _| *k < 10, &guard);
        assert_eq!(map.len(), 5);
    }

    #[test]
    fn iteration_sees_all_entries() {
        let map = DriftMap::new();
        let guard = map.guard();
        for i in 0..500u32 {
            map.insert(i, i, &guard);
        }
        let mut keys: Vec<_> = map.keys(&guard).copied().collect();
        keys.sort_unstable();
        assert_eq!(keys, (0..500).collect::<Vec<_>>());
        assert!(map.contains_value(&499, &guard));
        assert!(!map.contains_value(&500, &guard));
    }

    #[test]
    fn std_trait_impls() {
        let map: DriftMap<u32, u32> = (0..10u32).map(|i| (i, i)).collect();
        assert_eq!(map.len(), 10);

        let clone = map.clone();
        assert_eq!(map, clone);

        let guard = clone.guard();
        clone.insert(99, 99, &guard);
        assert_ne!(map, clone);

        let debug = format!("{map:?}");
        assert!(debug.starts_with('{') && debug.ends_with('}'));
    }

    #[test]
    fn reserve_avoids_growth_during_bulk_insert() {
        let map = DriftMap::new();
        let guard = map.guard();
        map.reserve(10_000, &guard);
        for i in 0..10_000u32 {
            map.insert(i, i, &guard);
        }
        assert_eq!(map.len(), 10_000);
    }

    #[test]
    fn closure_panic_leaves_map_usable() {
        let map = DriftMap::new();
        let guard = map.guard();
        map.insert(1, 10, &guard);

        let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
            map.compute(1, |_, _| -> Option<u32> { panic!("remap failed") }, &guard);
        }));
        assert!(result.is_err());
        assert_eq!(map.get(&1, &guard), Some(&10));

        // panic while claiming an empty bin must roll the claim back
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
            map.compute(2, |_, _| -> Option<u32> { panic!("remap failed") }, &guard);
        }));
        assert!(result.is_err());
        assert_eq!(map.get(&2, &guard), None);
        map.insert(2, 20, &guard);
        assert_eq!(map.get(&2, &guard), Some(&20));
    }

    proptest! {
        /// Sequential operations agree with the standard map.
        #[test]
        fn matches_std_hashmap(ops in proptest::collection::vec(
            (0u8..4, 0u16..64, any::<u32>()),
            1..256,
        )) {
            let map = DriftMap::new();
            let guard = map.guard();
            let mut model = std::collections::HashMap::new();

            for (op, key, value) in ops {
                match op {
                    0 => {
                        prop_assert_eq!(
                            map.insert(key, value, &guard).copied(),
                            model.insert(key, value)
                        );
                    }
                    1 => {
                        prop_assert_eq!(
                            map.remove(&key, &guard).copied(),
                            model.remove(&key)
                        );
                    }
                    2 => {
                        prop_assert_eq!(map.get(&key, &guard), model.get(&key));
                    }
                    _ => {
                        let got = map
                            .compute(key, |_, v| v.map(|v| v.wrapping_add(1)), &guard)
                            .copied();
                        let want = model.get(&key).map(|v| v.wrapping_add(1));
                        if let Some(want) = want {
                            model.insert(key, want);
                        }
                        prop_assert_eq!(got, want);
                    }
                }
                prop_assert_eq!(map.len(), model.len());
            }
        }
    }
}
