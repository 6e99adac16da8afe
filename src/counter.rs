//! Striped, low-contention accumulator.
//!
//! This module provides [`StripedAdder`], an approximate 64-bit counter
//! optimized for highly concurrent updates. A single shared counter suffers
//! destructive cache-line interference once several threads update it in a
//! loop; `StripedAdder` instead spreads contended updates over a lazily-grown
//! array of cache-padded cells, each updated by (mostly) disjoint sets of
//! threads.
//!
//! The sum is only approximate while writers are in flight: [`sum`] reads the
//! base and the cells one by one, without freezing concurrent updates. Once
//! all writers have quiesced, the sum is exact.
//!
//! # Safety
//!
//! This module uses unsafe code to dereference epoch-managed pointers to the
//! cell array. The following invariants are maintained:
//! - The cell array is only replaced by a strictly larger array whose prefix
//!   shares the same [`Cell`] allocations, so an in-flight update through a
//!   stale array lands in a cell that is still reachable from the current one
//! - A replaced array is retired through the epoch collector and freed only
//!   after every thread that could hold a reference has unpinned
//! - Growth is single-threaded, guarded by the `grow_busy` flag
//!
//! [`sum`]: StripedAdder::sum

use std::cell::Cell as StdCell;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use crossbeam_utils::CachePadded;

/// Number of cells the array starts with on first contention.
const INITIAL_CELLS: usize = 2;

/// One padded counter cell.
///
/// The padding is disproportionate to the stored value on purpose: adjacent
/// atomics in an array would otherwise share cache lines and every update
/// would invalidate its neighbors.
type Cell = CachePadded<AtomicI64>;

/// A snapshot of the striped cells.
///
/// Cells are shared between generations of the array via `Arc`: growing the
/// array clones the existing cell handles into a larger array, so a thread
/// still updating through the old array writes to a cell the new array also
/// sees.
struct Cells {
    slots: Box<[Arc<Cell>]>,
}

impl Cells {
    fn new(len: usize) -> Self {
        Self {
            slots: (0..len).map(|_| Arc::new(Cell::new(AtomicI64::new(0)))).collect(),
        }
    }

    fn grown(&self) -> Self {
        let mut slots = Vec::with_capacity(self.slots.len() * 2);
        slots.extend(self.slots.iter().cloned());
        slots.extend((0..self.slots.len()).map(|_| Arc::new(Cell::new(AtomicI64::new(0)))));
        Self {
            slots: slots.into_boxed_slice(),
        }
    }
}

thread_local! {
    /// Per-thread probe used to pick a cell slot.
    ///
    /// Zero means "uninitialized"; the first contended update seeds it from
    /// the thread's hash. On a failed cell CAS the probe is advanced with an
    /// xorshift step so colliding threads disperse.
    static PROBE: StdCell<u64> = const { StdCell::new(0) };
}

fn probe() -> u64 {
    PROBE.with(|p| {
        let mut current = p.get();
        if current == 0 {
            use std::hash::{BuildHasher, Hash, Hasher};
            let mut hasher = ahash::RandomState::new().build_hasher();
            std::thread::current().id().hash(&mut hasher);
            current = hasher.finish() | 1;
            p.set(current);
        }
        current
    })
}

fn advance_probe(mut current: u64) -> u64 {
    // xorshift
    current ^= current << 13;
    current ^= current >> 17;
    current ^= current << 5;
    PROBE.with(|p| p.set(current));
    current
}

/// An approximate, monotonically-adjustable 64-bit counter optimized for
/// highly concurrent [`add`] calls.
///
/// Updates first try a compare-and-swap on a single shared base. Once
/// contention is detected, the updating thread is hashed to one of a set of
/// cache-padded cells and updates that cell instead; the cell array doubles
/// (up to the number of CPUs) under repeated collisions.
///
/// [`sum`] returns the base plus all cells. It is not atomic as a whole: with
/// writers in flight it can miss recently-added deltas, bounded by the number
/// of concurrent [`add`] calls. After quiescence it is exact.
///
/// # Examples
///
/// ```rust
/// use driftmap::StripedAdder;
/// use std::sync::Arc;
/// use std::thread;
///
/// let adder = Arc::new(StripedAdder::new());
/// let handles: Vec<_> = (0..4)
///     .map(|_| {
///         let adder = Arc::clone(&adder);
///         thread::spawn(move || {
///             for _ in 0..1000 {
///                 adder.add(1);
///             }
///         })
///     })
///     .collect();
/// for handle in handles {
///     handle.join().unwrap();
/// }
/// assert_eq!(adder.sum(), 4000);
/// ```
///
/// [`add`]: StripedAdder::add
/// [`sum`]: StripedAdder::sum
pub struct StripedAdder {
    base: CachePadded<AtomicI64>,
    cells: Atomic<Cells>,
    grow_busy: AtomicBool,
    max_cells: usize,
}

impl StripedAdder {
    /// Creates an adder with an initial sum of zero.
    ///
    /// No cells are allocated until the base counter sees contention.
    pub fn new() -> Self {
        Self {
            base: CachePadded::new(AtomicI64::new(0)),
            cells: Atomic::null(),
            grow_busy: AtomicBool::new(false),
            max_cells: num_cpus::get().next_power_of_two(),
        }
    }

    /// Adds `delta` to the counter.
    pub fn add(&self, delta: i64) {
        let base = self.base.load(Ordering::Relaxed);
        if self
            .base
            .compare_exchange(base, base.wrapping_add(delta), Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
        self.accumulate(delta);
    }

    /// Adds one to the counter.
    #[inline]
    pub fn increment(&self) {
        self.add(1);
    }

    /// Subtracts one from the counter.
    #[inline]
    pub fn decrement(&self) {
        self.add(-1);
    }

    /// Slow path: route the update to a striped cell.
    fn accumulate(&self, delta: i64) {
        let mut probe = probe();
        let mut contended = false;
        let guard = epoch::pin();

        loop {
            let cells = self.cells.load(Ordering::Acquire, &guard);
            if cells.is_null() {
                if self.try_init_cells(delta, &guard) {
                    return;
                }
                continue;
            }

            // safety: a non-null cell array read under our guard is retired
            // only through `defer_destroy` after being replaced, so it stays
            // allocated at least until we unpin.
            let cells = unsafe { cells.deref() };
            let slot = &cells.slots[(probe as usize) & (cells.slots.len() - 1)];
            let current = slot.load(Ordering::Relaxed);
            if slot
                .compare_exchange(
                    current,
                    current.wrapping_add(delta),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return;
            }

            // The cell is contended. Retry the base once, then disperse or
            // grow.
            let base = self.base.load(Ordering::Relaxed);
            if self
                .base
                .compare_exchange(
                    base,
                    base.wrapping_add(delta),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return;
            }

            if contended && cells.slots.len() < self.max_cells {
                self.try_grow_cells(&guard);
                contended = false;
            } else {
                contended = true;
            }
            probe = advance_probe(probe);
        }
    }

    /// Installs the initial cell array and applies `delta` to one cell.
    ///
    /// Returns `false` if another thread holds the growth flag, in which case
    /// the caller retries.
    fn try_init_cells(&self, delta: i64, guard: &Guard) -> bool {
        if self.grow_busy.swap(true, Ordering::Acquire) {
            std::hint::spin_loop();
            return false;
        }
        let installed = if self.cells.load(Ordering::Acquire, guard).is_null() {
            let cells = Cells::new(INITIAL_CELLS);
            cells.slots[(probe() as usize) & (INITIAL_CELLS - 1)]
                .store(delta, Ordering::Relaxed);
            self.cells.store(Owned::new(cells), Ordering::Release);
            true
        } else {
            false
        };
        self.grow_busy.store(false, Ordering::Release);
        installed
    }

    /// Doubles the cell array, sharing the existing cells as its prefix.
    fn try_grow_cells(&self, guard: &Guard) {
        if self.grow_busy.swap(true, Ordering::Acquire) {
            return;
        }
        let current = self.cells.load(Ordering::Acquire, guard);
        if !current.is_null() {
            // safety: as in `accumulate`, the array is protected by `guard`.
            let cells = unsafe { current.deref() };
            if cells.slots.len() < self.max_cells {
                self.cells
                    .store(Owned::new(cells.grown()), Ordering::Release);
                // safety: the old array is unreachable from `self.cells` now;
                // in-flight updates through it land in shared cells, and the
                // allocation itself is freed only after a grace period.
                unsafe { guard.defer_destroy(current) };
            }
        }
        self.grow_busy.store(false, Ordering::Release);
    }

    /// Returns the current sum: base plus all cells.
    ///
    /// Not atomic as a whole; see the type-level documentation.
    pub fn sum(&self) -> i64 {
        let guard = epoch::pin();
        let mut sum = self.base.load(Ordering::Acquire);
        let cells = self.cells.load(Ordering::Acquire, &guard);
        if !cells.is_null() {
            // safety: as in `accumulate`, the array is protected by the guard.
            for slot in unsafe { cells.deref() }.slots.iter() {
                sum = sum.wrapping_add(slot.load(Ordering::Acquire));
            }
        }
        sum
    }

    /// Sets the base and every populated cell to `value`.
    ///
    /// This re-baselines an adder that has grown a cell array without
    /// deallocating it; afterwards `sum` reads `value * (1 + cells)`. It is
    /// only meaningful at quiescence; racing it with concurrent
    /// [`add`](StripedAdder::add) calls gives unspecified sums, the same way
    /// `sum` is approximate.
    pub fn reset(&self, value: i64) {
        let guard = epoch::pin();
        self.base.store(value, Ordering::Release);
        let cells = self.cells.load(Ordering::Acquire, &guard);
        if !cells.is_null() {
            // safety: as in `accumulate`, the array is protected by the guard.
            for slot in unsafe { cells.deref() }.slots.iter() {
                slot.store(value, Ordering::Release);
            }
        }
    }
}

impl Default for StripedAdder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StripedAdder {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("StripedAdder")
            .field("sum", &self.sum())
            .finish()
    }
}

impl Drop for StripedAdder {
    fn drop(&mut self) {
        // safety: we have &mut self, so no thread can still hold a reference
        // into the cell array.
        let guard = unsafe { epoch::unprotected() };
        let cells = self.cells.swap(Shared::null(), Ordering::Relaxed, guard);
        if !cells.is_null() {
            // safety: same as above; we are the only owner.
            drop(unsafe { cells.into_owned() });
        }
    }
}
