//! Insert engine.
//!
//! A writer probes lock-free under a reader guard, recording the visited
//! `(node, version, edge)` path and classifying the structural outcome.
//! It then pre-allocates any replacement nodes with their data filled in
//! and marks them poisoned, takes the writer mutex, re-validates every
//! recorded version, and commits: unpoison, bump the parent version,
//! publish the retry sentinel, store the replacement pointer. A version
//! mismatch aborts the attempt, frees the poisoned pre-allocation
//! (shallow, so borrowed children are untouched) and retries from the
//! probe; after [`MAX_RETRIES`] misses the whole operation re-runs under
//! the mutex, where the probe cannot be invalidated.

use std::sync::atomic::{AtomicU64, Ordering};

use arrayvec::ArrayVec;
use parking_lot::Mutex;

use crate::builder::{
    build_interior_from_pairs, build_leaf_from_pairs, build_terminal_leaf, clone_eos,
    collect_child_pairs, collect_leaf_pairs, dealloc_node,
};
use crate::ebr;
use crate::node::{
    box_value, bits_to_value, can_embed, eos_ref, header_poisoned, header_unstable,
    header_version, sentinel_bits, value_to_bits, NodePtr, NodeView, FLAGS_MASK,
};
use crate::trie::Counters;

/// Speculative attempts before falling back to the serialized path.
pub(crate) const MAX_RETRIES: usize = 7;

/// Largest pre-allocation any single operation needs.
const MAX_SPEC_NODES: usize = 4;

#[derive(Copy, Clone)]
pub(crate) struct PathEntry {
    pub(crate) node: NodePtr,
    pub(crate) version: u32,
    pub(crate) edge: u8,
}

/// Structural outcome of an insert probe.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum InsertOp {
    Exists,
    Retry,
    EmptyTree,
    /// Key ends at node entry of an interior node: set the pre-skip EOS
    /// slot in place.
    PreEos,
    /// Key ends right after an interior node's skip: set the skip-EOS
    /// slot in place.
    PostEos,
    /// FULL interior: attach a child by storing into its direct slot.
    AddChild { c: u8 },
    /// Any other interior: rebuild with the new child, promoting the
    /// representation when the count crosses a threshold.
    GrowChild { c: u8 },
    SplitInterior { m: usize },
    PrefixInterior { m: usize },
    SplitLeafSkip { m: usize },
    PrefixLeafSkip { m: usize },
    ExtendLeafSkip,
    SplitLeafMulti { m: usize },
    PrefixLeafMulti { m: usize },
    /// `LEAF|FULL`: write the value slot, then set the validity bit.
    AddLeafEntry { c: u8 },
    /// Any other leaf: rebuild with the new value, promoting the
    /// representation when the count crosses a threshold.
    GrowLeafEntry { c: u8 },
    /// Key ends at a multi-entry leaf's branch point, which has no EOS
    /// slot: demote to an interior carrying the EOS.
    AddEosLeafMulti,
    /// Key runs deeper than a one-byte-deep leaf: demote to an interior,
    /// then re-probe.
    DemoteLeafMulti,
}

pub(crate) struct Probe {
    pub(crate) op: InsertOp,
    pub(crate) path: Vec<PathEntry>,
    /// Key bytes consumed before reaching the target (last path) node.
    pub(crate) consumed: usize,
}

#[inline]
fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

/// Lock-free probe: walk, record versions, classify.
pub(crate) unsafe fn probe(root: &AtomicU64, key: &[u8]) -> Probe {
    let mut path = Vec::with_capacity(16);
    let mut consumed = 0usize;
    let mut edge = 0u8;
    let mut bits = root.load(Ordering::Acquire);

    let classified = loop {
        if bits == 0 {
            break if path.is_empty() {
                InsertOp::EmptyTree
            } else {
                // A nulled FULL slot: attach through the parent.
                unreachable!("probe descends only through non-null slots")
            };
        }
        if bits == sentinel_bits() {
            break InsertOp::Retry;
        }
        let node = NodePtr::from_bits(bits).expect("non-null node bits");
        let h = node.header();
        if header_unstable(h) {
            break InsertOp::Retry;
        }
        path.push(PathEntry {
            node,
            version: header_version(h),
            edge,
        });
        let view = NodeView {
            node,
            flags: h & FLAGS_MASK,
        };
        let key_rest = &key[consumed..];

        // Key consumed at node entry: the pre-skip EOS position.
        if key_rest.is_empty() {
            break if view.is_terminal_leaf() {
                if view.has_skip() {
                    InsertOp::PrefixLeafSkip { m: 0 }
                } else {
                    InsertOp::Exists
                }
            } else if view.is_leaf() {
                if view.has_skip() {
                    InsertOp::PrefixLeafMulti { m: 0 }
                } else {
                    InsertOp::AddEosLeafMulti
                }
            } else if view.load_eos(view.pre_eos_slot()) != 0 {
                InsertOp::Exists
            } else {
                InsertOp::PreEos
            };
        }

        let skip = view.skip_bytes();
        let m = common_prefix(skip, key_rest);
        if m < skip.len() {
            let diverges = m < key_rest.len();
            break if view.is_terminal_leaf() {
                if diverges {
                    InsertOp::SplitLeafSkip { m }
                } else {
                    InsertOp::PrefixLeafSkip { m }
                }
            } else if view.is_leaf() {
                if diverges {
                    InsertOp::SplitLeafMulti { m }
                } else {
                    InsertOp::PrefixLeafMulti { m }
                }
            } else if diverges {
                InsertOp::SplitInterior { m }
            } else {
                InsertOp::PrefixInterior { m }
            };
        }

        let after = &key_rest[m..];
        // Key consumed right after the skip: the skip-EOS position.
        if after.is_empty() {
            break if view.is_terminal_leaf() {
                InsertOp::Exists
            } else if view.is_leaf() {
                InsertOp::AddEosLeafMulti
            } else if view.load_eos(view.post_eos_slot()) != 0 {
                InsertOp::Exists
            } else {
                InsertOp::PostEos
            };
        }

        let c = after[0];
        let rest = &after[1..];

        if view.is_terminal_leaf() {
            break InsertOp::ExtendLeafSkip;
        }

        if view.is_leaf() {
            // Nodes are allocated exactly sized, so only the FULL
            // representation can take a new entry in place; LIST and POP
            // rebuild (and promote past their thresholds).
            break if !rest.is_empty() {
                InsertOp::DemoteLeafMulti
            } else if view.find_entry(c).is_some() {
                InsertOp::Exists
            } else if view.has_full() {
                InsertOp::AddLeafEntry { c }
            } else {
                InsertOp::GrowLeafEntry { c }
            };
        }

        // Interior: descend or attach.
        let child_bits = view
            .find_entry(c)
            .map(|slot| unsafe { view.load_slot_bits(slot) });
        match child_bits {
            Some(b) if b == sentinel_bits() => break InsertOp::Retry,
            Some(b) if b != 0 => {
                consumed += m + 1;
                edge = c;
                bits = b;
                continue;
            }
            _ => {}
        }
        break if view.has_full() {
            InsertOp::AddChild { c }
        } else {
            // Empty, LIST or POP: rebuild with the new child.
            InsertOp::GrowChild { c }
        };
    };

    Probe {
        op: classified,
        path,
        consumed,
    }
}

/// Work prepared outside the lock for one attempt.
pub(crate) enum Prepared<V> {
    /// Whole-node replacement, all nodes poisoned.
    Replace {
        nodes: ArrayVec<NodePtr, MAX_SPEC_NODES>,
        replacement: NodePtr,
        inserted: bool,
    },
    /// In-place interior child attach: the poisoned tail node.
    AttachChild { c: u8, child: NodePtr },
    /// In-place embedded leaf value.
    LeafEntry { c: u8, value: V },
    /// In-place EOS store (pre- or post-skip slot per the op).
    EosBox { value: V },
}

/// Frees an abandoned speculation. Poison guarantees the shallow
/// deallocator is the right one: borrowed children are never followed.
pub(crate) unsafe fn abandon<V>(prepared: Prepared<V>) {
    match prepared {
        Prepared::Replace { nodes, .. } => {
            for node in nodes {
                dealloc_node::<V>(node);
            }
        }
        Prepared::AttachChild { child, .. } => dealloc_node::<V>(child),
        Prepared::LeafEntry { .. } | Prepared::EosBox { .. } => {}
    }
}

/// Terminal node for the tail of a freshly inserted key.
unsafe fn tail_node<V>(tail: &[u8], value: V) -> NodePtr {
    build_terminal_leaf(tail, box_value(value))
}

/// Value slot word of a terminal leaf.
unsafe fn terminal_value_bits(view: NodeView) -> u64 {
    let slot = if view.has_skip() {
        view.post_eos_slot()
    } else {
        view.pre_eos_slot()
    };
    view.load_eos(slot)
}

unsafe fn clone_terminal_value<V: Clone>(view: NodeView) -> V {
    eos_ref::<V>(terminal_value_bits(view))
        .expect("terminal leaf carries a value")
        .clone()
}

/// Builds the demoted interior equivalent of a multi-entry leaf: same
/// skip, one terminal-leaf child per embedded value, plus an optional
/// EOS at the branch point.
unsafe fn demote_leaf<V: Clone>(
    view: NodeView,
    post_eos: u64,
    nodes: &mut ArrayVec<NodePtr, MAX_SPEC_NODES>,
) -> NodePtr {
    let entries = collect_leaf_pairs(view);
    let children: Vec<(u8, u64)> = entries
        .iter()
        .map(|&(c, bits)| unsafe {
            let value: V = bits_to_value(bits);
            (c, tail_node(&[], value).bits())
        })
        .collect();
    let skip = view.skip_bytes();
    let node = build_interior_from_pairs(skip, 0, post_eos, &children);
    // Only the interior shell is tracked for abandonment: the terminal
    // children hang off it and must outlive a successful commit, so an
    // abandoned demotion frees them through `free_subtree` instead.
    nodes.push(node);
    node
}

/// Pre-allocates everything an operation needs, with data filled in and
/// every new node poisoned.
pub(crate) unsafe fn prepare<V: Clone>(probe: &Probe, key: &[u8], value: V) -> Prepared<V> {
    let key_rest = &key[probe.consumed..];
    let target = probe
        .path
        .last()
        .map(|e| unsafe { NodeView::new(e.node) });

    let mut nodes: ArrayVec<NodePtr, MAX_SPEC_NODES> = ArrayVec::new();
    let push = |nodes: &mut ArrayVec<NodePtr, MAX_SPEC_NODES>, n: NodePtr| -> NodePtr {
        unsafe { n.poison() };
        nodes.push(n);
        n
    };

    let (replacement, inserted) = match probe.op {
        InsertOp::EmptyTree => {
            let n = push(&mut nodes, tail_node(key, value));
            (n, true)
        }

        InsertOp::SplitLeafSkip { m } => {
            let view = target.expect("split targets a node");
            let skip = view.skip_bytes();
            let (common, old_c, new_c) = (&skip[..m], skip[m], key_rest[m]);
            let (old_tail, new_tail) = (&skip[m + 1..], &key_rest[m + 1..]);
            let old_value: V = clone_terminal_value(view);

            let n = if can_embed::<V>() && old_tail.is_empty() && new_tail.is_empty() {
                let mut pairs = [
                    (old_c, value_to_bits(old_value)),
                    (new_c, value_to_bits(value)),
                ];
                pairs.sort_unstable_by_key(|&(c, _)| c);
                push(&mut nodes, build_leaf_from_pairs(common, &pairs))
            } else {
                let old_child = push(&mut nodes, tail_node(old_tail, old_value));
                let new_child = push(&mut nodes, tail_node(new_tail, value));
                let mut pairs = [(old_c, old_child.bits()), (new_c, new_child.bits())];
                pairs.sort_unstable_by_key(|&(c, _)| c);
                push(&mut nodes, build_interior_from_pairs(common, 0, 0, &pairs))
            };
            (n, true)
        }

        InsertOp::PrefixLeafSkip { m } => {
            let view = target.expect("prefix targets a node");
            let skip = view.skip_bytes();
            let old_value: V = clone_terminal_value(view);
            let child = push(&mut nodes, tail_node(&skip[m + 1..], old_value));
            let n = push(
                &mut nodes,
                build_interior_from_pairs(
                    key_rest,
                    0,
                    box_value(value),
                    &[(skip[m], child.bits())],
                ),
            );
            (n, true)
        }

        InsertOp::ExtendLeafSkip => {
            let view = target.expect("extend targets a node");
            let skip = view.skip_bytes();
            let old_value: V = clone_terminal_value(view);
            let (c, tail) = (key_rest[skip.len()], &key_rest[skip.len() + 1..]);
            let child = push(&mut nodes, tail_node(tail, value));
            let n = push(
                &mut nodes,
                build_interior_from_pairs(skip, 0, box_value(old_value), &[(c, child.bits())]),
            );
            (n, true)
        }

        InsertOp::SplitLeafMulti { m } => {
            let view = target.expect("split targets a node");
            let skip = view.skip_bytes();
            let (common, old_c, new_c) = (&skip[..m], skip[m], key_rest[m]);
            let entries = collect_leaf_pairs(view);
            let old_child = push(&mut nodes, build_leaf_from_pairs(&skip[m + 1..], &entries));
            let new_child = push(&mut nodes, tail_node(&key_rest[m + 1..], value));
            let mut pairs = [(old_c, old_child.bits()), (new_c, new_child.bits())];
            pairs.sort_unstable_by_key(|&(c, _)| c);
            let n = push(&mut nodes, build_interior_from_pairs(common, 0, 0, &pairs));
            (n, true)
        }

        InsertOp::PrefixLeafMulti { m } => {
            let view = target.expect("prefix targets a node");
            let skip = view.skip_bytes();
            let entries = collect_leaf_pairs(view);
            let old_child = push(&mut nodes, build_leaf_from_pairs(&skip[m + 1..], &entries));
            let n = push(
                &mut nodes,
                build_interior_from_pairs(
                    key_rest,
                    0,
                    box_value(value),
                    &[(skip[m], old_child.bits())],
                ),
            );
            (n, true)
        }

        InsertOp::GrowLeafEntry { c } => {
            let view = target.expect("grow targets a node");
            let mut pairs = collect_leaf_pairs(view);
            let at = pairs.partition_point(|&(b, _)| b < c);
            pairs.insert(at, (c, value_to_bits(value)));
            let n = push(&mut nodes, build_leaf_from_pairs(view.skip_bytes(), &pairs));
            (n, true)
        }

        InsertOp::AddEosLeafMulti => {
            let view = target.expect("demote targets a node");
            let n = demote_leaf::<V>(view, box_value(value), &mut nodes);
            n.poison();
            (n, true)
        }

        InsertOp::DemoteLeafMulti => {
            let view = target.expect("demote targets a node");
            let n = demote_leaf::<V>(view, 0, &mut nodes);
            n.poison();
            (n, false)
        }

        InsertOp::SplitInterior { m } => {
            let view = target.expect("split targets a node");
            let skip = view.skip_bytes();
            let (common, old_c, new_c) = (&skip[..m], skip[m], key_rest[m]);
            let old_child = push(
                &mut nodes,
                build_interior_from_pairs(
                    &skip[m + 1..],
                    0,
                    clone_eos::<V>(view.load_eos(view.post_eos_slot())),
                    &collect_child_pairs(view),
                ),
            );
            let new_child = push(&mut nodes, tail_node(&key_rest[m + 1..], value));
            let mut pairs = [(old_c, old_child.bits()), (new_c, new_child.bits())];
            pairs.sort_unstable_by_key(|&(c, _)| c);
            let pre = clone_eos::<V>(view.load_eos(view.pre_eos_slot()));
            let n = push(&mut nodes, build_interior_from_pairs(common, pre, 0, &pairs));
            (n, true)
        }

        InsertOp::PrefixInterior { m } => {
            let view = target.expect("prefix targets a node");
            let skip = view.skip_bytes();
            let old_child = push(
                &mut nodes,
                build_interior_from_pairs(
                    &skip[m + 1..],
                    0,
                    clone_eos::<V>(view.load_eos(view.post_eos_slot())),
                    &collect_child_pairs(view),
                ),
            );
            let pre = clone_eos::<V>(view.load_eos(view.pre_eos_slot()));
            let n = push(
                &mut nodes,
                build_interior_from_pairs(
                    key_rest,
                    pre,
                    box_value(value),
                    &[(skip[m], old_child.bits())],
                ),
            );
            (n, true)
        }

        InsertOp::GrowChild { c } => {
            let view = target.expect("grow targets a node");
            let tail_start = probe.consumed + view.skip_len() + 1;
            let child = push(&mut nodes, tail_node(&key[tail_start..], value));
            let mut pairs = collect_child_pairs(view);
            let at = pairs.partition_point(|&(b, _)| b < c);
            pairs.insert(at, (c, child.bits()));
            let pre = clone_eos::<V>(view.load_eos(view.pre_eos_slot()));
            let post = if view.has_skip() {
                clone_eos::<V>(view.load_eos(view.post_eos_slot()))
            } else {
                0
            };
            let n = push(
                &mut nodes,
                build_interior_from_pairs(view.skip_bytes(), pre, post, &pairs),
            );
            (n, true)
        }

        InsertOp::AddChild { c } => {
            let view = target.expect("attach targets a node");
            let tail_start = probe.consumed + view.skip_len() + 1;
            let child = tail_node(&key[tail_start..], value);
            child.poison();
            return Prepared::AttachChild { c, child };
        }

        InsertOp::AddLeafEntry { c } => return Prepared::LeafEntry { c, value },

        InsertOp::PreEos | InsertOp::PostEos => return Prepared::EosBox { value },

        InsertOp::Exists | InsertOp::Retry => {
            unreachable!("terminal probe outcomes are handled by the driver")
        }
    };

    Prepared::Replace {
        nodes,
        replacement,
        inserted,
    }
}

/// Re-checks the probe under the writer mutex: the root pointer still
/// leads to the recorded path, and every recorded version is unchanged.
/// An unchanged parent version also pins its child slots, so the
/// validated chain reaches the target through live nodes only.
pub(crate) unsafe fn validate(probe: &Probe, root: &AtomicU64) -> bool {
    match probe.path.first() {
        None => root.load(Ordering::Acquire) == 0,
        Some(first) => {
            root.load(Ordering::Acquire) == first.node.bits()
                && probe.path.iter().all(|e| {
                    let h = unsafe { e.node.header() };
                    !header_poisoned(h) && header_version(h) == e.version
                })
        }
    }
}

pub(crate) struct Commit {
    pub(crate) inserted: bool,
    pub(crate) retired: Option<NodePtr>,
}

/// Applies a validated attempt. Caller holds the writer mutex.
pub(crate) unsafe fn commit<V>(root: &AtomicU64, probe: &Probe, prepared: Prepared<V>) -> Commit {
    match prepared {
        Prepared::Replace {
            nodes,
            replacement,
            inserted,
        } => {
            for node in &nodes {
                node.unpoison();
            }
            let Some(target) = probe.path.last() else {
                // Empty tree: nothing displaced.
                root.store(replacement.bits(), Ordering::Release);
                return Commit {
                    inserted,
                    retired: None,
                };
            };
            if probe.path.len() == 1 {
                root.store(sentinel_bits(), Ordering::Release);
                root.store(replacement.bits(), Ordering::Release);
            } else {
                let parent = probe.path[probe.path.len() - 2].node;
                let pview = NodeView::new(parent);
                let slot = pview
                    .find_entry(target.edge)
                    .expect("validated parent still routes the edge");
                debug_assert_eq!(pview.load_slot_bits(slot), target.node.bits());
                parent.bump_committed();
                pview.store_slot_bits(slot, sentinel_bits());
                pview.store_slot_bits(slot, replacement.bits());
            }
            Commit {
                inserted,
                retired: Some(target.node),
            }
        }

        Prepared::AttachChild { c, child } => {
            child.unpoison();
            let target = probe.path.last().expect("attach needs a target").node;
            let view = NodeView::new(target);
            debug_assert!(view.has_full() && !view.is_leaf());
            let base = view.child_base_slot();
            view.store_slot_bits(base + c as usize, child.bits());
            target.bump_committed();
            Commit {
                inserted: true,
                retired: None,
            }
        }

        Prepared::LeafEntry { c, value } => {
            let bits = value_to_bits(value);
            let target = probe.path.last().expect("leaf entry needs a target").node;
            let view = NodeView::new(target);
            debug_assert!(view.is_leaf() && view.has_full());
            // Value slot first, then the release bit-set that publishes
            // it to readers.
            let base = view.child_base_slot();
            view.store_slot_bits(base + c as usize, bits);
            view.leaf_valid_set_bit(c);
            target.bump_committed();
            Commit {
                inserted: true,
                retired: None,
            }
        }

        Prepared::EosBox { value } => {
            let target = probe.path.last().expect("eos needs a target").node;
            let view = NodeView::new(target);
            let slot = match probe.op {
                InsertOp::PreEos => view.pre_eos_slot(),
                InsertOp::PostEos => view.post_eos_slot(),
                _ => unreachable!("EosBox only backs the EOS ops"),
            };
            debug_assert_eq!(view.load_eos(slot), 0);
            view.store_slot_bits(slot, box_value(value));
            target.bump_committed();
            Commit {
                inserted: true,
                retired: None,
            }
        }
    }
}

unsafe fn retire_node<V>(node: NodePtr) {
    unsafe fn drop_node<V>(ptr: *mut u8) {
        let node = NodePtr::from_bits(ptr as u64).expect("retired node is non-null");
        dealloc_node::<V>(node);
    }
    ebr::retire(node.as_ptr() as *mut u8, drop_node::<V>);
}

/// Full insert driver: speculative attempts, then the serialized
/// fallback. Returns true iff the key was absent and is now present.
pub(crate) unsafe fn insert_value<V: Clone>(
    root: &AtomicU64,
    write_lock: &Mutex<()>,
    counters: &Counters,
    key: &[u8],
    value: V,
) -> bool {
    let _guard = ebr::pin();

    let mut attempts = 0;
    while attempts <= MAX_RETRIES {
        let probe = probe(root, key);
        match probe.op {
            InsertOp::Exists => {
                // A duplicate report must rest on a stable view of the
                // path, not on a read that overlapped a mutation.
                if validate(&probe, root) {
                    return false;
                }
                counters.note_writer_retry();
                attempts += 1;
                continue;
            }
            InsertOp::Retry => {
                counters.note_writer_retry();
                attempts += 1;
                std::hint::spin_loop();
                continue;
            }
            _ => {}
        }

        let prepared = prepare::<V>(&probe, key, value.clone());
        let locked = write_lock.lock();
        if !validate(&probe, root) {
            drop(locked);
            abandon_prepared::<V>(&probe, prepared);
            counters.note_writer_retry();
            attempts += 1;
            continue;
        }
        let commit = commit(root, &probe, prepared);
        drop(locked);
        if let Some(old) = commit.retired {
            retire_node::<V>(old);
        }
        if commit.inserted {
            return true;
        }
        // A demotion made progress without inserting; probe again.
    }

    // Serialized fallback: under the mutex the probe cannot be
    // invalidated, so each iteration commits, and the loop only repeats
    // across demotion steps.
    counters.note_writer_fallback();
    let locked = write_lock.lock();
    let mut displaced: Vec<NodePtr> = Vec::new();
    let inserted = loop {
        let probe = probe(root, key);
        match probe.op {
            InsertOp::Exists => break false,
            InsertOp::Retry => unreachable!("no concurrent writer under the mutex"),
            _ => {}
        }
        let prepared = prepare::<V>(&probe, key, value.clone());
        let commit = commit(root, &probe, prepared);
        if let Some(old) = commit.retired {
            displaced.push(old);
        }
        if commit.inserted {
            break true;
        }
    };
    drop(locked);
    for old in displaced {
        retire_node::<V>(old);
    }
    inserted
}

/// Abandons a failed attempt, including the terminal children of a
/// demotion (reachable only through the abandoned shell, so the subtree
/// walk is sound).
unsafe fn abandon_prepared<V>(probe: &Probe, prepared: Prepared<V>) {
    match (probe.op, prepared) {
        (
            InsertOp::AddEosLeafMulti | InsertOp::DemoteLeafMulti,
            Prepared::Replace { nodes, .. },
        ) => {
            for node in nodes {
                crate::builder::free_subtree::<V>(node);
            }
        }
        (_, prepared) => abandon::<V>(prepared),
    }
}
