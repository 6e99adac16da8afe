//! Weakly consistent iteration.
//!
//! Iterators snapshot nothing: they walk the table bin by bin and follow
//! forwarding markers into newer tables when a resize overtakes them. To
//! guarantee each bin is visited at most once in that case, the traverser
//! keeps a stack of (table, index) frames it can return to once the
//! forwarded region is exhausted.
//!
//! # Safety
//!
//! All node and table references yielded or held here were loaded under the
//! iterator's guard from a live table and remain valid for the guard's
//! lifetime, per the reclamation protocol described in [`crate::node`].

use std::sync::atomic::Ordering;

use crossbeam_epoch::Guard;

use crate::node::{BinEntry, Node};
use crate::raw::Table;

/// Frame saved when the traversal follows a forwarding marker.
struct TableStack<'g, K, V> {
    length: usize,
    index: usize,
    table: &'g Table<K, V>,
    next: Option<Box<TableStack<'g, K, V>>>,
}

/// Walks every node reachable from `table`, including nodes whose value is
/// currently null. Callers filter for visibility.
pub(crate) struct NodeIter<'g, K, V> {
    /// Table being traversed; may change when following forwarding markers.
    table: Option<&'g Table<K, V>>,
    stack: Option<Box<TableStack<'g, K, V>>>,
    /// Popped frames kept for reuse, to avoid reallocating on every
    /// forwarding hop.
    spare: Option<Box<TableStack<'g, K, V>>>,
    /// Node most recently yielded, or `None` at a bin boundary.
    prev: Option<&'g Node<K, V>>,
    /// Index of the next bin within `table`.
    index: usize,
    /// Index of the next bin in the table the traversal started from.
    base_index: usize,
    base_limit: usize,
    base_size: usize,
    guard: &'g Guard,
}

impl<'g, K, V> NodeIter<'g, K, V> {
    pub(crate) fn new(table: Option<&'g Table<K, V>>, guard: &'g Guard) -> Self {
        let base_size = table.map_or(0, Table::len);
        Self {
            table,
            stack: None,
            spare: None,
            prev: None,
            index: 0,
            base_index: 0,
            base_limit: base_size,
            base_size,
            guard,
        }
    }

    /// Saves the current traversal position before descending into the
    /// table a forwarding marker points at.
    fn push_state(&mut self, table: &'g Table<K, V>, index: usize, length: usize) {
        let mut frame = match self.spare.take() {
            Some(mut spare) => {
                self.spare = spare.next.take();
                spare
            }
            None => Box::new(TableStack {
                length: 0,
                index: 0,
                table,
                next: None,
            }),
        };
        frame.length = length;
        frame.index = index;
        frame.table = table;
        frame.next = self.stack.take();
        self.stack = Some(frame);
    }

    /// Pops saved frames once the forwarded region is exhausted, resuming
    /// in the outer table. The forwarded table holds the split halves of the
    /// saved bin at `index` and `index + length`, hence the stride below.
    fn recover_state(&mut self, mut n: usize) {
        while let Some(frame) = &mut self.stack {
            self.index += frame.length;
            if self.index < n {
                break;
            }
            n = frame.length;
            self.index = frame.index;
            self.table = Some(frame.table);
            let mut frame = self.stack.take().expect("just matched Some");
            self.stack = frame.next.take();
            frame.next = self.spare.take();
            self.spare = Some(frame);
        }
        if self.stack.is_none() {
            self.index += self.base_size;
            if self.index >= n {
                self.base_index += 1;
                self.index = self.base_index;
            }
        }
    }
}

impl<'g, K, V> Iterator for NodeIter<'g, K, V> {
    type Item = &'g Node<K, V>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut e = None;
        if let Some(prev) = self.prev {
            let next = prev.next.load(Ordering::SeqCst, self.guard);
            if !next.is_null() {
                // safety: loaded under our guard from a live bin; retired
                // nodes outlive any guard that observed them.
                e = Some(unsafe { next.deref() });
            }
        }

        loop {
            if let Some(entry) = e {
                let node = entry.as_node().expect("lists chain only nodes");
                self.prev = Some(node);
                return Some(node);
            }

            if self.base_index >= self.base_limit {
                self.prev = None;
                return None;
            }
            let table = self.table?;
            let n = table.len();
            if n <= self.index {
                self.prev = None;
                return None;
            }

            let bin = table.bin(self.index, self.guard);
            if !bin.is_null() {
                // safety: as above.
                match unsafe { bin.deref() } {
                    BinEntry::Moved(next_table) => {
                        // descend into the forwarded table at the same index;
                        // the split halves of this bin live at `index` and
                        // `index + n` there, which the stride logic visits
                        // before recover_state returns here.
                        // safety: forwarded tables outlive the markers that
                        // point to them (see crate::node).
                        self.table = Some(unsafe { &**next_table });
                        self.push_state(table, self.index, n);
                        continue;
                    }
                    BinEntry::Tree(tree_bin) => {
                        let first = tree_bin.first.load(Ordering::SeqCst, self.guard);
                        if !first.is_null() {
                            // safety: as above.
                            e = Some(unsafe { first.deref() });
                        }
                    }
                    entry @ BinEntry::Node(_) => {
                        e = Some(entry);
                    }
                    BinEntry::TreeNode(_) => unreachable!("tree node at bin head"),
                }
            }

            if self.stack.is_some() {
                self.recover_state(n);
            } else {
                self.index += self.base_size;
                if self.index >= n {
                    self.base_index += 1;
                    self.index = self.base_index;
                }
            }
        }
    }
}

/// Iterator over a map's entries.
///
/// See [`crate::DriftMap::iter`].
pub struct Iter<'g, K, V> {
    pub(crate) node_iter: NodeIter<'g, K, V>,
    pub(crate) guard: &'g Guard,
}

impl<'g, K, V> Iterator for Iter<'g, K, V> {
    type Item = (&'g K, &'g V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let node = self.node_iter.next()?;
            let value = node.value.load(Ordering::SeqCst, self.guard);
            if value.is_null() {
                // mid-computation or mid-removal; not part of the map's
                // visible contents
                continue;
            }
            // safety: values are retired only after a grace period; this one
            // was loaded under our guard.
            return Some((&node.key, unsafe { value.deref() }));
        }
    }
}

/// Iterator over a map's keys.
///
/// See [`crate::DriftMap::keys`].
pub struct Keys<'g, K, V> {
    pub(crate) iter: Iter<'g, K, V>,
}

impl<'g, K, V> Iterator for Keys<'g, K, V> {
    type Item = &'g K;

    fn next(&mut self) -> Option<Self::Item> {
        self.iter.next().map(|(k, _)| k)
    }
}

/// Iterator over a map's values.
///
/// See [`crate::DriftMap::values`].
pub struct Values<'g, K, V> {
    pub(crate) iter: Iter<'g, K, V>,
}

impl<'g, K, V> Iterator for Values<'g, K, V> {
    type Item = &'g V;

    fn next(&mut self) -> Option<Self::Item> {
        self.iter.next().map(|(_, v)| v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_epoch::{self as epoch, Atomic, Owned};

    fn push_node(table: &Table<usize, usize>, hash: u64, key: usize, value: usize) {
        let guard = &epoch::pin();
        let bini = table.bini(hash);
        let head = table.bin(bini, guard);
        let node = Node::new(hash, key, Atomic::new(value));
        node.next.store(head, Ordering::SeqCst);
        table.store_bin(bini, Owned::new(BinEntry::Node(node)));
    }

    #[test]
    fn iterates_all_nodes() {
        let guard = &epoch::pin();
        let mut table = Table::<usize, usize>::new(16);
        for i in 0..32usize {
            push_node(&table, i as u64, i, i * 2);
        }

        let mut seen: Vec<_> = NodeIter::new(Some(&table), guard)
            .map(|node| node.key)
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..32).collect::<Vec<_>>());

        table.drop_bins();
    }

    #[test]
    fn empty_table_yields_nothing() {
        let guard = &epoch::pin();
        assert!(NodeIter::<usize, usize>::new(None, guard).next().is_none());
        let table = Table::<usize, usize>::new(4);
        assert!(NodeIter::new(Some(&table), guard).next().is_none());
    }
}
