//! # driftmap
//!
//! A concurrent hash map with lock-free reads, per-bin write locking, and
//! incremental resizing.
//!
//! ## Overview
//!
//! [`DriftMap`] shards contention at the level of individual hash bins:
//!
//! - **Reads never block.** `get` and iteration walk an atomic snapshot of
//!   the bin they hash to, even while writers or a resize are active.
//! - **Writes lock one bin.** Inserts, removals, and the `compute` family
//!   serialize only against other writers of the same bin.
//! - **Resizing is incremental.** A growing map moves bins one at a time
//!   into the doubled table, leaving forwarding markers behind so readers
//!   and writers route themselves to wherever an entry currently lives.
//! - **Overlong bins become trees.** A bin holding sixteen or more entries
//!   (which takes a pathological or adversarial hash function) converts to
//!   a red-black tree, bounding worst-case lookups at `O(log n)`. This is
//!   why keys must implement `Ord` in addition to `Hash`.
//!
//! Element counting goes through [`StripedAdder`], a cell-striped
//! accumulator that keeps hot counters off a single shared cache line. It
//! is also exported on its own for workloads that just need a
//! contention-friendly counter.
//!
//! ## Guards
//!
//! Memory reclamation is epoch-based (via `crossbeam-epoch`), which is what
//! lets readers proceed without locks. Most methods take a [`Guard`],
//! obtained from [`DriftMap::guard`], and references returned by the map
//! stay valid for as long as that guard is held:
//!
//! ```
//! use driftmap::DriftMap;
//!
//! let map = DriftMap::new();
//! let guard = map.guard();
//! map.insert("ring", 3, &guard);
//! assert_eq!(map.get("ring", &guard), Some(&3));
//! ```
//!
//! Pinning a guard is cheap but not free; batch work under one guard where
//! convenient, and drop guards promptly so retired memory can be freed.
//!
//! ## Feature Flags
//!
//! - `serde`: `Serialize` and `Deserialize` for [`DriftMap`]
//!
//! ## Sharing and ownership
//!
//! The map is `Send + Sync` when its keys and values are, so it can sit in
//! an `Arc` and be mutated from any thread through `&self`. Types that are
//! not thread-safe are rejected at compile time:
//!
//! ```compile_fail
//! use driftmap::DriftMap;
//! use std::rc::Rc;
//!
//! let map: DriftMap<u32, Rc<u32>> = DriftMap::new();
//! let guard = map.guard();
//! map.insert(1, Rc::new(1), &guard);
//! ```
//!
//! ## Example
//!
//! ```
//! use driftmap::DriftMap;
//! use std::sync::Arc;
//!
//! let map = Arc::new(DriftMap::new());
//!
//! let handles: Vec<_> = (0..4)
//!     .map(|_| {
//!         let map = Arc::clone(&map);
//!         std::thread::spawn(move || {
//!             let guard = map.guard();
//!             for i in 0..100 {
//!                 map.compute(i, |_, hits| Some(hits.copied().unwrap_or(0) + 1), &guard);
//!             }
//!         })
//!     })
//!     .collect();
//! for handle in handles {
//!     handle.join().unwrap();
//! }
//!
//! let guard = map.guard();
//! assert!((0..100).all(|i| map.get(&i, &guard) == Some(&4)));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(rust_2018_idioms)]

mod counter;
mod iter;
mod map;
mod node;
mod raw;

#[cfg(feature = "serde")]
mod serde_impls;

pub use counter::StripedAdder;
pub use iter::{Iter, Keys, Values};
pub use map::{DefaultHashBuilder, DriftMap, TryInsertError};

pub use crossbeam_epoch::Guard;
