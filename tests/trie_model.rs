#![cfg(feature = "proptest")]
//! Model-based checks: any operation sequence must agree with a
//! `BTreeMap` over the encoded key bytes.

use std::collections::BTreeMap;

use bytetrie::{debug, Trie};
use proptest::prelude::*;

#[derive(Clone, Debug)]
enum Op {
    Insert(Vec<u8>, u64),
    Erase(Vec<u8>),
    Get(Vec<u8>),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    let key = prop::collection::vec(prop::num::u8::ANY, 0..6);
    prop_oneof![
        (key.clone(), any::<u64>()).prop_map(|(k, v)| Op::Insert(k, v)),
        key.clone().prop_map(Op::Erase),
        key.prop_map(Op::Get),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn agrees_with_btreemap(ops in prop::collection::vec(op_strategy(), 1..400)) {
        let trie: Trie<Vec<u8>, u64> = Trie::new();
        let mut model: BTreeMap<Vec<u8>, u64> = BTreeMap::new();

        for op in ops {
            match op {
                Op::Insert(k, v) => {
                    let fresh = trie.insert(&k, v);
                    prop_assert_eq!(fresh, !model.contains_key(&k));
                    model.entry(k).or_insert(v);
                }
                Op::Erase(k) => {
                    let erased = trie.erase(&k);
                    prop_assert_eq!(erased, model.remove(&k).is_some());
                }
                Op::Get(k) => {
                    prop_assert_eq!(trie.get(&k), model.get(&k).copied());
                }
            }
            prop_assert_eq!(trie.len(), model.len());
        }

        prop_assert!(debug::validate(&trie).is_ok());
        let collected: Vec<(Vec<u8>, u64)> = trie.iter().collect();
        let expected: Vec<(Vec<u8>, u64)> = model.into_iter().collect();
        prop_assert_eq!(collected, expected);
    }

    #[test]
    fn string_values_agree_with_btreemap(ops in prop::collection::vec(op_strategy(), 1..200)) {
        // Same sequence but with boxed (non-embeddable) values.
        let trie: Trie<Vec<u8>, String> = Trie::new();
        let mut model: BTreeMap<Vec<u8>, String> = BTreeMap::new();

        for op in ops {
            match op {
                Op::Insert(k, v) => {
                    let v = v.to_string();
                    let fresh = trie.insert(&k, v.clone());
                    prop_assert_eq!(fresh, !model.contains_key(&k));
                    model.entry(k).or_insert(v);
                }
                Op::Erase(k) => {
                    let erased = trie.erase(&k);
                    prop_assert_eq!(erased, model.remove(&k).is_some());
                }
                Op::Get(k) => {
                    prop_assert_eq!(trie.get(&k), model.get(&k).cloned());
                }
            }
        }

        prop_assert!(debug::validate(&trie).is_ok());
        let collected: Vec<Vec<u8>> = trie.iter().map(|(k, _)| k).collect();
        let expected: Vec<Vec<u8>> = model.keys().cloned().collect();
        prop_assert_eq!(collected, expected);
    }
}
