//! Property tests for cache keying, collections and the error budget.
//!
//! Uses proptest to verify:
//! 1. Query order never changes a request key
//! 2. Verbs and namespaces always keep keys apart
//! 3. Appended collections preserve input order and length
//! 4. The error budget is the smallest integer whose square covers the job

use proptest::prelude::*;
use serde_json::json;

use crest_core::cache::canonical_url;
use crest_core::{error_budget, CacheKey, Collection, Verb};

// ── Strategies (proptest) ────────────────────────────────────────────

fn arb_query_pairs() -> impl Strategy<Value = Vec<(String, String)>> {
    prop::collection::vec(("[a-z]{1,6}", "[a-z0-9]{0,6}"), 0..6)
}

fn arb_namespace() -> impl Strategy<Value = String> {
    "[a-z]{1,8}"
}

fn build_url(pairs: &[(String, String)]) -> String {
    let query: Vec<String> = pairs.iter().map(|(k, v)| format!("{k}={v}")).collect();
    if query.is_empty() {
        "https://crest.example/market/10000002/orders/".to_string()
    } else {
        format!(
            "https://crest.example/market/10000002/orders/?{}",
            query.join("&")
        )
    }
}

// ── 1. Query order ───────────────────────────────────────────────────

proptest! {
    /// Reordering query pairs yields the same canonical URL and key.
    #[test]
    fn query_order_is_irrelevant(pairs in arb_query_pairs()) {
        let mut reversed = pairs.clone();
        reversed.reverse();
        let a = build_url(&pairs);
        let b = build_url(&reversed);
        prop_assert_eq!(canonical_url(&a), canonical_url(&b));
        prop_assert_eq!(
            CacheKey::for_request(&Verb::Get, &a, None),
            CacheKey::for_request(&Verb::Get, &b, None)
        );
    }

    /// Canonicalization is idempotent.
    #[test]
    fn canonical_url_is_idempotent(pairs in arb_query_pairs()) {
        let once = canonical_url(&build_url(&pairs));
        prop_assert_eq!(canonical_url(&once), once.clone());
    }

    /// Fragments never reach the key.
    #[test]
    fn fragment_is_dropped(pairs in arb_query_pairs(), fragment in "[a-z]{1,8}") {
        let url = build_url(&pairs);
        let with_fragment = format!("{url}#{fragment}");
        prop_assert_eq!(canonical_url(&url), canonical_url(&with_fragment));
    }
}

// ── 2. Key separation ────────────────────────────────────────────────

proptest! {
    #[test]
    fn verbs_and_namespaces_separate_keys(
        pairs in arb_query_pairs(),
        ns_a in arb_namespace(),
        ns_b in arb_namespace(),
    ) {
        let url = build_url(&pairs);
        prop_assert_ne!(
            CacheKey::for_request(&Verb::Get, &url, None),
            CacheKey::for_request(&Verb::Post, &url, None)
        );
        prop_assert_ne!(
            CacheKey::for_request(&Verb::Get, &url, Some(&ns_a)),
            CacheKey::for_request(&Verb::Get, &url, None)
        );
        if ns_a != ns_b {
            prop_assert_ne!(
                CacheKey::for_request(&Verb::Get, &url, Some(&ns_a)),
                CacheKey::for_request(&Verb::Get, &url, Some(&ns_b))
            );
        }
        prop_assert_ne!(
            CacheKey::gathered(&url, None, None),
            CacheKey::for_request(&Verb::Get, &url, None)
        );
    }
}

// ── 3. Collections ───────────────────────────────────────────────────

proptest! {
    #[test]
    fn appends_preserve_order(values in prop::collection::vec(any::<i64>(), 0..50)) {
        let mut collection = Collection::new();
        for v in &values {
            collection.push(json!(v));
        }
        prop_assert_eq!(collection.len(), values.len());
        let back: Vec<i64> = collection
            .into_values()
            .into_iter()
            .map(|v| v.as_i64().unwrap())
            .collect();
        prop_assert_eq!(back, values);
    }

    /// Keyed inserts keep one entry per distinct key.
    #[test]
    fn keyed_inserts_dedupe(keys in prop::collection::vec(0u8..10, 0..40)) {
        let mut collection = Collection::new();
        for (i, k) in keys.iter().enumerate() {
            collection.insert(k.to_string(), json!(i));
        }
        let mut distinct = keys.clone();
        distinct.sort();
        distinct.dedup();
        prop_assert_eq!(collection.len(), distinct.len());
        if let Some(last) = keys.last() {
            prop_assert_eq!(collection.get(&last.to_string()), Some(&json!(keys.len() - 1)));
        }
    }
}

// ── 4. Error budget ──────────────────────────────────────────────────

proptest! {
    #[test]
    fn budget_is_ceil_sqrt(n in 1usize..100_000) {
        let b = error_budget(n);
        prop_assert!(b * b >= n);
        prop_assert!((b - 1) * (b - 1) < n);
    }
}
