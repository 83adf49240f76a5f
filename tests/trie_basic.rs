use bytetrie::{debug, Trie};

fn s(text: &str) -> String {
    text.to_string()
}

#[test]
fn insert_find_erase_string_family() {
    let trie: Trie<String, u32> = Trie::new();
    assert!(trie.insert(&s("apple"), 1));
    assert!(trie.insert(&s("application"), 2));
    assert!(trie.insert(&s("apply"), 3));
    assert!(trie.insert(&s("app"), 4));
    assert!(trie.insert(&s("banana"), 5));
    assert_eq!(trie.len(), 5);

    assert_eq!(trie.get(&s("app")), Some(4));
    assert_eq!(trie.get(&s("apple")), Some(1));
    assert_eq!(trie.get(&s("application")), Some(2));
    assert_eq!(trie.get(&s("apply")), Some(3));
    assert_eq!(trie.get(&s("banana")), Some(5));
    assert_eq!(trie.get(&s("ap")), None);
    assert_eq!(trie.get(&s("applications")), None);
    debug::validate(&trie).unwrap();

    assert!(trie.erase(&s("apple")));
    assert!(!trie.contains(&s("apple")));
    assert!(trie.contains(&s("app")));
    assert!(trie.contains(&s("application")));
    assert_eq!(trie.len(), 4);
    debug::validate(&trie).unwrap();
}

#[test]
fn duplicate_insert_keeps_original_value() {
    let trie: Trie<String, u64> = Trie::new();
    assert!(trie.insert(&s("key"), 10));
    assert!(!trie.insert(&s("key"), 20));
    assert_eq!(trie.get(&s("key")), Some(10));
    assert_eq!(trie.len(), 1);
}

#[test]
fn insert_with_constructs_only_when_absent() {
    let trie: Trie<String, u64> = Trie::new();
    assert!(trie.insert_with(&s("a"), || 1));
    assert!(!trie.insert_with(&s("a"), || panic!("must not construct for a present key")));
    assert_eq!(trie.get(&s("a")), Some(1));
}

#[test]
fn empty_key_coexists_with_others() {
    let trie: Trie<String, u32> = Trie::new();
    assert!(trie.insert(&s(""), 99));
    assert!(trie.contains(&s("")));
    assert_eq!(trie.get(&s("")), Some(99));

    assert!(trie.insert(&s("a"), 1));
    assert!(trie.contains(&s("")));
    assert!(trie.contains(&s("a")));
    assert_eq!(trie.len(), 2);
    // The root holds the empty key at its entry EOS and one child
    // for 'a'.
    let dump = debug::dump_tree(&trie);
    assert!(dump.contains("+eos") || dump.contains("=value"), "{dump}");
    debug::validate(&trie).unwrap();

    assert!(trie.erase(&s("")));
    assert!(!trie.contains(&s("")));
    assert!(trie.contains(&s("a")));
}

#[test]
fn clear_releases_everything() {
    let mut trie: Trie<String, u64> = Trie::new();
    for i in 0..100u64 {
        trie.insert(&format!("entry{i}"), i);
    }
    assert_eq!(trie.len(), 100);
    trie.clear();
    assert_eq!(trie.len(), 0);
    assert!(trie.is_empty());
    assert!(trie.debug_root_is_null());
    assert!(!trie.contains(&s("entry1")));

    // Usable again after clear.
    assert!(trie.insert(&s("fresh"), 7));
    assert_eq!(trie.get(&s("fresh")), Some(7));
}

#[test]
fn boxed_values_round_trip() {
    // Strings do not fit in a leaf slot, so every value goes through
    // the boxed EOS path.
    let trie: Trie<String, String> = Trie::new();
    assert!(trie.insert(&s("alpha"), s("first")));
    assert!(trie.insert(&s("alp"), s("second")));
    assert!(trie.insert(&s("alphabet"), s("third")));
    assert_eq!(trie.get(&s("alpha")).as_deref(), Some("first"));
    assert_eq!(trie.get(&s("alp")).as_deref(), Some("second"));
    assert_eq!(trie.get(&s("alphabet")).as_deref(), Some("third"));
    debug::validate(&trie).unwrap();

    assert!(trie.erase(&s("alpha")));
    assert_eq!(trie.get(&s("alpha")), None);
    assert_eq!(trie.get(&s("alphabet")).as_deref(), Some("third"));
    debug::validate(&trie).unwrap();
}

#[test]
fn clone_is_a_deep_independent_copy() {
    let trie: Trie<String, u32> = Trie::new();
    for i in 0..50u32 {
        trie.insert(&format!("k{i}"), i);
    }
    let copy = trie.clone();
    assert_eq!(copy.len(), 50);

    assert!(trie.erase(&s("k0")));
    assert!(!trie.contains(&s("k0")));
    assert_eq!(copy.get(&s("k0")), Some(0));

    copy.insert(&s("only-in-copy"), 1000);
    assert!(!trie.contains(&s("only-in-copy")));
    debug::validate(&trie).unwrap();
    debug::validate(&copy).unwrap();
}
