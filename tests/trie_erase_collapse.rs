use std::collections::BTreeMap;

use bytetrie::{debug, Trie};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn s(text: &str) -> String {
    text.to_string()
}

#[test]
fn erase_missing_reports_not_found() {
    let trie: Trie<String, u32> = Trie::new();
    assert!(!trie.erase(&s("missing")));
    trie.insert(&s("present"), 1);
    assert!(!trie.erase(&s("pres")));
    assert!(!trie.erase(&s("presents")));
    assert!(!trie.erase(&s("missing")));
    assert_eq!(trie.len(), 1);
}

#[test]
fn collapse_concatenates_prefix_edge_and_child_skip() {
    let trie: Trie<String, u32> = Trie::new();
    trie.insert(&s("prefixA1"), 1);
    trie.insert(&s("prefixB2"), 2);
    // Two keys share "prefix" and branch into two tails.
    assert!(trie.erase(&s("prefixB2")));

    // The branch collapses back into a single node whose skip is the
    // former prefix, the edge byte and the surviving child's skip.
    let dump = debug::dump_tree(&trie);
    assert!(dump.contains("skip=\"prefixA1\""), "{dump}");
    assert_eq!(trie.get(&s("prefixA1")), Some(1));
    debug::validate(&trie).unwrap();
}

#[test]
fn single_entry_embedded_leaf_stays_compact() {
    // With embeddable values and one-byte tails the branch is an
    // embedded leaf; erasing down to one entry keeps it an in-place
    // leaf rather than rebuilding.
    let trie: Trie<String, u32> = Trie::new();
    trie.insert(&s("prefixA"), 1);
    trie.insert(&s("prefixB"), 2);
    assert!(trie.erase(&s("prefixB")));
    assert_eq!(trie.get(&s("prefixA")), Some(1));
    assert_eq!(trie.len(), 1);
    debug::validate(&trie).unwrap();
}

#[test]
fn collapse_stops_at_an_eos_carrier() {
    let trie: Trie<String, u32> = Trie::new();
    trie.insert(&s("app"), 1);
    trie.insert(&s("apple"), 2);
    trie.insert(&s("apply"), 3);

    // Removing one branch must not merge through the node that still
    // carries the "app" key.
    assert!(trie.erase(&s("apply")));
    assert!(trie.contains(&s("app")));
    assert!(trie.contains(&s("apple")));
    debug::validate(&trie).unwrap();

    assert!(trie.erase(&s("apple")));
    assert!(trie.contains(&s("app")));
    assert_eq!(trie.len(), 1);
    debug::validate(&trie).unwrap();
}

#[test]
fn erase_all_leaves_null_root() {
    let trie: Trie<String, u64> = Trie::new();
    let keys: Vec<String> = (0..200).map(|i| format!("k{i:03}")).collect();
    for (i, k) in keys.iter().enumerate() {
        trie.insert(k, i as u64);
    }
    for k in &keys {
        assert!(trie.erase(k), "missing {k}");
    }
    assert_eq!(trie.len(), 0);
    assert!(trie.debug_root_is_null());
    trie.reclaim_retired();
}

#[test]
fn interior_eos_erase_then_leaf_erase() {
    let trie: Trie<String, u32> = Trie::new();
    trie.insert(&s("app"), 1);
    trie.insert(&s("apple"), 2);

    assert!(trie.erase(&s("apple")));
    assert_eq!(trie.get(&s("app")), Some(1));
    debug::validate(&trie).unwrap();

    assert!(trie.erase(&s("app")));
    assert!(trie.debug_root_is_null());
}

#[test]
fn randomized_churn_matches_model() {
    let mut rng = StdRng::seed_from_u64(42);
    let trie: Trie<u32, u64> = Trie::new();
    let mut model: BTreeMap<u32, u64> = BTreeMap::new();

    for round in 0..20_000u64 {
        let key = rng.gen_range(0..600u32);
        if rng.gen_bool(0.6) {
            let inserted = trie.insert(&key, round);
            assert_eq!(inserted, !model.contains_key(&key), "insert {key}");
            model.entry(key).or_insert(round);
        } else {
            let erased = trie.erase(&key);
            assert_eq!(erased, model.remove(&key).is_some(), "erase {key}");
        }
        assert_eq!(trie.len(), model.len());
    }

    debug::validate(&trie).unwrap();
    for (k, v) in &model {
        assert_eq!(trie.get(k), Some(*v));
    }
    let collected: Vec<u32> = trie.iter().map(|(k, _)| k).collect();
    let expected: Vec<u32> = model.keys().copied().collect();
    assert_eq!(collected, expected);

    // Drain to empty: the tree must reduce to a null root.
    let remaining: Vec<u32> = model.keys().copied().collect();
    for k in remaining {
        assert!(trie.erase(&k));
    }
    assert!(trie.debug_root_is_null());
}
