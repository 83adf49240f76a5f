use std::collections::BTreeSet;

use bytetrie::Trie;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

#[test]
fn iter_returns_sorted_byte_keys() {
    let mut rng = StdRng::seed_from_u64(0);
    let trie: Trie<Vec<u8>, u64> = Trie::new();
    let mut keys = BTreeSet::new();
    while keys.len() < 1000 {
        let len = rng.gen_range(1..=24);
        let mut key = vec![0u8; len];
        rng.fill_bytes(&mut key);
        if keys.insert(key.clone()) {
            assert!(trie.insert(&key, keys.len() as u64));
        }
    }

    let collected: Vec<Vec<u8>> = trie.iter().map(|(k, _)| k).collect();
    let expected: Vec<Vec<u8>> = keys.into_iter().collect();
    assert_eq!(collected, expected);
}

#[test]
fn signed_integers_iterate_in_numeric_order() {
    let trie: Trie<i64, i64> = Trie::new();
    let keys = [i64::MIN, -1, 0, 1, i64::MAX];
    for &k in &keys {
        assert!(trie.insert(&k, k));
    }
    let order: Vec<i64> = trie.iter().map(|(k, _)| k).collect();
    assert_eq!(order, keys);
}

#[test]
fn mixed_sign_integer_family() {
    let trie: Trie<i64, u32> = Trie::new();
    let keys = [100, -50, 0, 1_000_000, -1_000_000, i64::MAX, i64::MIN];
    for (i, &k) in keys.iter().enumerate() {
        assert!(trie.insert(&k, i as u32));
    }
    assert_eq!(trie.len(), 7);
    for (i, &k) in keys.iter().enumerate() {
        assert_eq!(trie.get(&k), Some(i as u32));
    }

    let mut sorted = keys;
    sorted.sort_unstable();
    let order: Vec<i64> = trie.iter().map(|(k, _)| k).collect();
    assert_eq!(order, sorted);
}

#[test]
fn next_after_steps_through_adjacent_keys() {
    let trie: Trie<String, u32> = Trie::new();
    trie.insert(&"a".to_string(), 1);
    trie.insert(&"b".to_string(), 2);

    let (first, v) = trie.first().unwrap();
    assert_eq!((first.as_str(), v), ("a", 1));
    let (next, v) = trie.next_after(&"a".to_string()).unwrap();
    assert_eq!((next.as_str(), v), ("b", 2));
    assert!(trie.next_after(&"b".to_string()).is_none());

    // A probe key that is not present still lands on the successor.
    let (next, _) = trie.next_after(&"aa".to_string()).unwrap();
    assert_eq!(next.as_str(), "b");
}

#[test]
fn prefix_keys_order_before_extensions() {
    let trie: Trie<String, u32> = Trie::new();
    for (i, k) in ["app", "apple", "application", "apply", "banana"]
        .iter()
        .enumerate()
    {
        trie.insert(&k.to_string(), i as u32);
    }
    let order: Vec<String> = trie.iter().map(|(k, _)| k).collect();
    assert_eq!(order, ["app", "apple", "application", "apply", "banana"]);
}

#[test]
fn unsigned_random_iteration_matches_model() {
    let mut rng = StdRng::seed_from_u64(7);
    let trie: Trie<u64, u64> = Trie::new();
    let mut keys = BTreeSet::new();
    for _ in 0..5000 {
        let k: u64 = rng.gen();
        if keys.insert(k) {
            trie.insert(&k, !k);
        }
    }
    assert_eq!(trie.len(), keys.len());
    let collected: Vec<u64> = trie.iter().map(|(k, v)| {
        assert_eq!(v, !k);
        k
    }).collect();
    let expected: Vec<u64> = keys.into_iter().collect();
    assert_eq!(collected, expected);
}
