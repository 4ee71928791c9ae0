//! Property-based tests for the bounded incident log.
//!
//! Covers the capacity bound, insertion order, zero-capacity discard and
//! re-keying of deleted scopes onto their root.

mod common;

use std::collections::BTreeSet;

use proptest::prelude::*;

use common::ScopeTree;
use plumbkit_core::incident_log::{IncidentLog, ScopeId};

// =============================================================================
// Strategies
// =============================================================================

/// (scope, payload) pairs with payloads numbered in insertion order.
fn arb_records() -> impl Strategy<Value = Vec<u64>> {
    prop::collection::vec(0u64..5, 0..60)
}

fn all_scopes() -> BTreeSet<ScopeId> {
    (0..5).map(ScopeId).collect()
}

// =============================================================================
// Capacity and order
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn log_never_exceeds_capacity(capacity in 0usize..8, scopes in arb_records()) {
        let mut log = IncidentLog::new(capacity);
        for (seq, scope) in scopes.iter().enumerate() {
            log.record(ScopeId(*scope), seq);
            prop_assert!(log.len() <= capacity, "len {} > capacity {}", log.len(), capacity);
        }
    }

    #[test]
    fn log_keeps_newest_in_insertion_order(capacity in 1usize..8, scopes in arb_records()) {
        let mut log = IncidentLog::new(capacity);
        for (seq, scope) in scopes.iter().enumerate() {
            log.record(ScopeId(*scope), seq);
        }
        let kept: Vec<usize> = log.query(&all_scopes()).into_iter().copied().collect();
        let start = scopes.len().saturating_sub(capacity);
        let expected: Vec<usize> = (start..scopes.len()).collect();
        prop_assert_eq!(kept, expected);
        prop_assert_eq!(log.total_recorded(), scopes.len() as u64);
        prop_assert_eq!(log.total_evicted(), start as u64);
    }

    #[test]
    fn filtered_query_is_ordered_subsequence(
        capacity in 1usize..10,
        scopes in arb_records(),
        filter in prop::collection::btree_set(0u64..5, 0..5),
    ) {
        let mut log = IncidentLog::new(capacity);
        for (seq, scope) in scopes.iter().enumerate() {
            log.record(ScopeId(*scope), seq);
        }
        let filter: BTreeSet<ScopeId> = filter.into_iter().map(ScopeId).collect();
        let hits: Vec<usize> = log.query(&filter).into_iter().copied().collect();
        prop_assert!(hits.windows(2).all(|w| w[0] < w[1]), "out of order: {:?}", hits);
        for seq in &hits {
            prop_assert!(filter.contains(&ScopeId(scopes[*seq])));
        }
    }

    #[test]
    fn zero_capacity_discards_everything(scopes in arb_records()) {
        let mut log = IncidentLog::new(0);
        for (seq, scope) in scopes.iter().enumerate() {
            log.record(ScopeId(*scope), seq);
        }
        prop_assert!(log.is_empty());
        prop_assert!(log.query(&all_scopes()).is_empty());
    }
}

// =============================================================================
// Re-keying
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Scope 0 is the root; 1..5 are its children. Deleting children never
    /// loses or reorders an incident, and everything ends up under the root.
    #[test]
    fn deleting_children_rekeys_to_root(
        scopes in arb_records(),
        deletions in prop::collection::vec(1u64..5, 0..8),
    ) {
        let tree = ScopeTree::new();
        tree.add_root(0);
        for child in 1..5 {
            tree.add_child(child, 0);
        }

        let mut log = IncidentLog::new(100);
        for (seq, scope) in scopes.iter().enumerate() {
            log.record(ScopeId(*scope), seq);
        }
        let before: Vec<usize> = log.query(&all_scopes()).into_iter().copied().collect();

        for scope in &deletions {
            log.on_scope_deleted(ScopeId(*scope), &*tree);
        }
        // Deleting the root itself is a no-op for the log.
        log.on_scope_deleted(ScopeId(0), &*tree);

        let after: Vec<usize> = log.query(&all_scopes()).into_iter().copied().collect();
        prop_assert_eq!(&before, &after);

        let deleted: BTreeSet<u64> = deletions.iter().copied().collect();
        for (scope, seq) in log.iter() {
            let original = scopes[*seq];
            if deleted.contains(&original) {
                prop_assert_eq!(scope, ScopeId(0));
            } else {
                prop_assert_eq!(scope, ScopeId(original));
            }
        }
    }
}
