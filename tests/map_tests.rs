//! Integration tests for the map's single-threaded semantics.
//!
//! Covers the full operation surface: lookups, the insert family, the
//! compute family, conditional replacement and removal, and bulk
//! operations.

use driftmap::{DriftMap, TryInsertError};
use rstest::rstest;

// =============================================================================
// Lookups
// =============================================================================

#[rstest]
fn get_on_empty_map_is_none() {
    let map: DriftMap<u32, u32> = DriftMap::new();
    let guard = map.guard();
    assert_eq!(map.get(&1, &guard), None);
    assert!(!map.contains_key(&1, &guard));
    assert!(map.is_empty());
}

#[rstest]
fn get_uses_borrowed_forms_of_the_key() {
    let map: DriftMap<String, u32> = DriftMap::new();
    let guard = map.guard();
    map.insert("alpha".to_owned(), 1, &guard);
    assert_eq!(map.get("alpha", &guard), Some(&1));
    assert_eq!(map.get("beta", &guard), None);
}

#[rstest]
fn get_key_value_returns_the_stored_key() {
    let map: DriftMap<String, u32> = DriftMap::new();
    let guard = map.guard();
    map.insert("alpha".to_owned(), 1, &guard);
    let (k, v) = map.get_key_value("alpha", &guard).unwrap();
    assert_eq!(k, "alpha");
    assert_eq!(*v, 1);
}

// =============================================================================
// Insert family
// =============================================================================

#[rstest]
fn insert_returns_the_previous_value() {
    let map = DriftMap::new();
    let guard = map.guard();
    assert_eq!(map.insert(1, 'a', &guard), None);
    assert_eq!(map.insert(1, 'b', &guard), Some(&'a'));
    assert_eq!(map.get(&1, &guard), Some(&'b'));
    assert_eq!(map.len(), 1);
}

#[rstest]
fn try_insert_refuses_existing_keys() {
    let map = DriftMap::new();
    let guard = map.guard();
    assert_eq!(map.try_insert(1, 'a', &guard), Ok(&'a'));
    assert_eq!(
        map.try_insert(1, 'b', &guard),
        Err(TryInsertError {
            current: &'a',
            not_inserted: 'b',
        })
    );
    assert_eq!(map.get(&1, &guard), Some(&'a'));
}

// =============================================================================
// Compute family
// =============================================================================

#[rstest]
fn compute_if_absent_runs_once_per_key() {
    let map = DriftMap::new();
    let guard = map.guard();
    let mut calls = 0;
    map.compute_if_absent(1, |_| {
        calls += 1;
        10
    }, &guard);
    let v = map.compute_if_absent(1, |_| {
        calls += 1;
        20
    }, &guard);
    assert_eq!(*v, 10);
    assert_eq!(calls, 1);
}

#[rstest]
fn compute_covers_all_transitions() {
    let map = DriftMap::new();
    let guard = map.guard();

    // absent -> absent
    assert_eq!(map.compute(1, |_, _| None::<u32>, &guard), None);
    // absent -> present
    assert_eq!(map.compute(1, |_, _| Some(1), &guard), Some(&1));
    // present -> present
    assert_eq!(map.compute(1, |_, v| v.map(|v| v * 2), &guard), Some(&2));
    // present -> absent
    assert_eq!(map.compute(1, |_, _| None, &guard), None);
    assert!(map.is_empty());
}

#[rstest]
fn compute_if_present_ignores_absent_keys() {
    let map: DriftMap<i32, u32> = DriftMap::new();
    let guard = map.guard();
    let mut called = false;
    assert_eq!(
        map.compute_if_present(&1, |_, _: &u32| {
            called = true;
            None
        }, &guard),
        None
    );
    assert!(!called);
}

#[rstest]
fn merge_inserts_then_combines() {
    let map = DriftMap::new();
    let guard = map.guard();
    assert_eq!(map.merge("k", 1, |old, new| Some(old + new), &guard), Some(&1));
    assert_eq!(map.merge("k", 2, |old, new| Some(old + new), &guard), Some(&3));
    assert_eq!(map.merge("k", 0, |_, _| None, &guard), None);
    assert!(!map.contains_key("k", &guard));
}

// =============================================================================
// Conditional replacement and removal
// =============================================================================

#[rstest]
fn replace_only_touches_mapped_keys() {
    let map = DriftMap::new();
    let guard = map.guard();
    assert_eq!(map.replace(&1, 'x', &guard), None);
    assert!(map.is_empty());
    map.insert(1, 'a', &guard);
    assert_eq!(map.replace(&1, 'b', &guard), Some(&'a'));
}

#[rstest]
#[case::accepted(5, true)]
#[case::rejected(6, false)]
fn replace_if_consults_the_current_value(#[case] threshold: u32, #[case] replaced: bool) {
    let map = DriftMap::new();
    let guard = map.guard();
    map.insert(1, 5, &guard);
    let result = map.replace_if(&1, 99, |v| *v >= threshold, &guard);
    assert_eq!(result.is_some(), replaced);
    assert_eq!(map.get(&1, &guard), Some(if replaced { &99 } else { &5 }));
}

#[rstest]
fn remove_entry_returns_both_halves() {
    let map = DriftMap::new();
    let guard = map.guard();
    map.insert("k".to_owned(), 7, &guard);
    let (k, v) = map.remove_entry("k", &guard).unwrap();
    assert_eq!(k, "k");
    assert_eq!(*v, 7);
    assert!(map.is_empty());
}

#[rstest]
fn remove_if_keeps_rejected_entries() {
    let map = DriftMap::new();
    let guard = map.guard();
    map.insert(1, 10, &guard);
    assert_eq!(map.remove_if(&1, |v| *v > 100, &guard), None);
    assert_eq!(map.remove_if(&1, |v| *v == 10, &guard), Some(&10));
}

// =============================================================================
// Bulk operations and iteration
// =============================================================================

#[rstest]
fn clear_then_reuse() {
    let map = DriftMap::new();
    let guard = map.guard();
    for i in 0..1_000u32 {
        map.insert(i, i, &guard);
    }
    map.clear(&guard);
    assert!(map.is_empty());
    map.insert(1, 1, &guard);
    assert_eq!(map.len(), 1);
}

#[rstest]
fn retain_respects_the_predicate() {
    let map = DriftMap::new();
    let guard = map.guard();
    for i in 0..100u32 {
        map.insert(i, i * 2, &guard);
    }
    map.retain(|k, _| k % 10 == 0, &guard);
    assert_eq!(map.len(), 10);
    let mut kept: Vec<_> = map.keys(&guard).copied().collect();
    kept.sort_unstable();
    assert_eq!(kept, vec![0, 10, 20, 30, 40, 50, 60, 70, 80, 90]);
}

#[rstest]
fn iteration_yields_each_entry_once() {
    let map = DriftMap::new();
    let guard = map.guard();
    for i in 0..1_000u32 {
        map.insert(i, i, &guard);
    }
    let mut seen = vec![false; 1_000];
    for (k, v) in map.iter(&guard) {
        assert_eq!(k, v);
        assert!(!seen[*k as usize], "key {k} yielded twice");
        seen[*k as usize] = true;
    }
    assert!(seen.iter().all(|&s| s));
}

#[rstest]
fn iteration_follows_forwarded_bins_after_a_resize() {
    let map = DriftMap::new();
    let guard = map.guard();
    for i in 0..8u32 {
        map.insert(i, i, &guard);
    }

    // start iterating, then grow the table several times underneath; every
    // key present before the iterator started must still be yielded
    let mut iter = map.iter(&guard);
    let mut seen = std::collections::HashSet::new();
    seen.insert(*iter.next().unwrap().0);

    let write_guard = map.guard();
    for i in 8..4_096u32 {
        map.insert(i, i, &write_guard);
    }

    for (k, _) in iter {
        seen.insert(*k);
    }
    for i in 0..8u32 {
        assert!(seen.contains(&i), "stable key {i} skipped");
    }
}

#[rstest]
fn values_and_contains_value() {
    let map = DriftMap::new();
    let guard = map.guard();
    map.insert(1, "one", &guard);
    map.insert(2, "two", &guard);
    assert!(map.contains_value(&"one", &guard));
    assert!(!map.contains_value(&"three", &guard));
    assert_eq!(map.values(&guard).count(), 2);
}

// =============================================================================
// Mixed-operation scenario
// =============================================================================

#[rstest]
fn disjoint_keys_commute() {
    // starting from {a: 1, b: 2}, adding 10 to a and removing b must end in
    // {a: 11}, regardless of how the two updates are ordered
    let map = DriftMap::new();
    let guard = map.guard();
    map.insert("a", 1, &guard);
    map.insert("b", 2, &guard);

    map.compute("a", |_, v| v.map(|v| v + 10), &guard);
    map.remove("b", &guard);

    assert_eq!(map.get("a", &guard), Some(&11));
    assert_eq!(map.get("b", &guard), None);
    assert_eq!(map.len(), 1);
}
