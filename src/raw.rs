//! The raw bin table.
//!
//! A [`Table`] is a power-of-two array of atomic bin slots. Volatile-style
//! access goes through [`bin`], [`cas_bin`], and [`store_bin`]; indices are
//! always masked with `len - 1`, so they are implicitly in bounds.
//!
//! [`bin`]: Table::bin
//! [`cas_bin`]: Table::cas_bin
//! [`store_bin`]: Table::store_bin

use std::sync::atomic::Ordering;

use crossbeam_epoch::{Atomic, CompareExchangeError, Guard, Owned, Pointer, Shared};

use crate::node::BinEntry;

/// The array of bins. Lazily initialized upon first insertion.
/// Size is always a power of two.
pub(crate) struct Table<K, V> {
    bins: Box<[Atomic<BinEntry<K, V>>]>,
}

impl<K, V> Table<K, V> {
    pub(crate) fn new(len: usize) -> Self {
        debug_assert!(len.is_power_of_two() || len == 0);
        let mut bins = Vec::with_capacity(len);
        bins.resize_with(len, Atomic::null);
        Self {
            bins: bins.into_boxed_slice(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.bins.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    /// Returns the bin index for `hash` in this table.
    #[inline]
    pub(crate) fn bini(&self, hash: u64) -> usize {
        let mask = self.bins.len() as u64 - 1;
        (hash & mask) as usize
    }

    pub(crate) fn bin<'g>(&'g self, i: usize, guard: &'g Guard) -> Shared<'g, BinEntry<K, V>> {
        self.bins[i].load(Ordering::SeqCst, guard)
    }

    #[allow(clippy::type_complexity)]
    pub(crate) fn cas_bin<'g, P>(
        &'g self,
        i: usize,
        current: Shared<'_, BinEntry<K, V>>,
        new: P,
        guard: &'g Guard,
    ) -> Result<Shared<'g, BinEntry<K, V>>, CompareExchangeError<'g, BinEntry<K, V>, P>>
    where
        P: Pointer<BinEntry<K, V>>,
    {
        self.bins[i].compare_exchange(current, new, Ordering::SeqCst, Ordering::SeqCst, guard)
    }

    pub(crate) fn store_bin<P: Pointer<BinEntry<K, V>>>(&self, i: usize, new: P) {
        self.bins[i].store(new, Ordering::SeqCst)
    }

    /// Tears down all bins, dropping every node, tree bin, and value.
    ///
    /// Only called when the map itself is dropped: at that point no thread
    /// holds a reference into the table, so plain ownership suffices.
    pub(crate) fn drop_bins(&mut self) {
        // safety: we have &mut self, so no other thread can access the table.
        let guard = unsafe { crossbeam_epoch::unprotected() };

        for bin in &self.bins[..] {
            let bin_entry = bin.swap(Shared::null(), Ordering::SeqCst, guard);
            if bin_entry.is_null() {
                continue;
            }

            // safety: same as above; we own the table and its bins.
            match *unsafe { bin_entry.deref() } {
                BinEntry::Moved(_) => {
                    // the target table is owned elsewhere; just drop the
                    // marker itself.
                    // safety: we are the only owner of this marker.
                    drop(unsafe { bin_entry.into_owned() });
                }
                BinEntry::Node(_) => {
                    let mut head = bin_entry;
                    while !head.is_null() {
                        // safety: we own the chain; nothing else can reach it.
                        let mut entry = unsafe { head.into_owned() };
                        let node = entry
                            .as_node_mut()
                            .expect("list bins contain only nodes");
                        head = node.next.swap(Shared::null(), Ordering::SeqCst, guard);
                        let value = node.value.swap(Shared::null(), Ordering::SeqCst, guard);
                        if !value.is_null() {
                            // safety: we own the value; it was only shared
                            // through this node.
                            drop(unsafe { value.into_owned() });
                        }
                        drop(entry);
                    }
                }
                BinEntry::Tree(_) => {
                    // safety: we own the tree bin; drop its nodes and values.
                    let mut entry = unsafe { bin_entry.into_owned() };
                    if let BinEntry::Tree(ref mut tree_bin) = *entry {
                        tree_bin.drop_nodes_and_values();
                    }
                    drop(entry);
                }
                BinEntry::TreeNode(_) => {
                    unreachable!("tree nodes are only reachable through a tree bin")
                }
            }
        }
    }
}

impl<K, V> Drop for Table<K, V> {
    fn drop(&mut self) {
        // A table is dropped either after `drop_bins` (map teardown) or after
        // a completed transfer, in which case every bin is a forwarding
        // marker owned by this table.
        // safety: we have &mut self.
        let guard = unsafe { crossbeam_epoch::unprotected() };
        for bin in &self.bins[..] {
            let bin_entry = bin.swap(Shared::null(), Ordering::SeqCst, guard);
            if bin_entry.is_null() {
                continue;
            }
            // safety: we are the only owner of the remaining markers.
            match *unsafe { bin_entry.deref() } {
                BinEntry::Moved(_) => drop(unsafe { bin_entry.into_owned() }),
                _ => unreachable!("dropped a table that still holds live bins"),
            }
        }
    }
}
