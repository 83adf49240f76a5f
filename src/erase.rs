//! Erase engine.
//!
//! Removal runs under the writer mutex after a validated lock-free
//! absent check. In-place clears (a leaf entry, an interior child slot,
//! an EOS box) use the paired version bump so overlapping readers
//! restart; structural changes build fully-formed replacement nodes
//! before publishing them through the parent slot. After a removal the
//! engine collapses upward: a node left with a single child and no EOS
//! merges with that child into one node whose skip is
//! `old-skip ∥ edge ∥ child-skip`, and a node left with nothing is
//! removed from its parent, which then becomes a collapse candidate
//! itself. Merges preserve leaf/interior shape and never cross an EOS.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::builder::{
    build_interior_from_pairs, build_leaf_from_pairs, build_terminal_leaf, clone_eos,
    collect_child_pairs, collect_leaf_pairs, dealloc_node,
};
use crate::ebr;
use crate::nav;
use crate::node::{box_value, eos_ref, sentinel_bits, NodePtr, NodeView};
use crate::trie::Counters;

enum EraseStatus {
    NotFound,
    /// Entry removed; this node remains in place.
    Erased,
    /// This node became empty and must be unlinked from its parent.
    Gone,
    /// This node was merged away; link the replacement instead.
    Replaced(NodePtr),
}

#[derive(Default)]
struct EraseOut {
    retired_nodes: Vec<NodePtr>,
    retired_boxes: Vec<u64>,
}

#[inline]
fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

unsafe fn erase_rec<V: Clone>(node: NodePtr, key: &[u8], out: &mut EraseOut) -> EraseStatus {
    let view = NodeView::new(node);

    if view.is_terminal_leaf() {
        let skip = view.skip_bytes();
        if key != skip {
            return EraseStatus::NotFound;
        }
        out.retired_nodes.push(node);
        return EraseStatus::Gone;
    }

    if view.is_leaf() {
        let skip = view.skip_bytes();
        let m = common_prefix(skip, key);
        if m < skip.len() {
            return EraseStatus::NotFound;
        }
        let rest = &key[m..];
        if rest.len() != 1 {
            return EraseStatus::NotFound;
        }
        let c = rest[0];

        if view.has_full() {
            if !view.leaf_valid().contains(c) {
                return EraseStatus::NotFound;
            }
            if view.leaf_valid().count() == 1 {
                out.retired_nodes.push(node);
                return EraseStatus::Gone;
            }
            view.leaf_valid_clear_bit(c);
            node.bump_committed();
            return EraseStatus::Erased;
        }
        if view.has_list() {
            let Some(idx) = view.list().find(c) else {
                return EraseStatus::NotFound;
            };
            let count = view.list().count();
            if count == 1 {
                out.retired_nodes.push(node);
                return EraseStatus::Gone;
            }
            node.begin_mutate();
            let mut lst = view.list();
            for i in idx..count - 1 {
                view.store_child_slot(i, view.child_slot_bits(i + 1));
            }
            view.store_child_slot(count - 1, 0);
            lst.remove_at(idx);
            view.store_list(lst);
            node.end_mutate();
            return EraseStatus::Erased;
        }
        // LEAF|POP
        let Some(idx) = view.bitmap().find(c) else {
            return EraseStatus::NotFound;
        };
        let count = view.bitmap().count();
        if count == 1 {
            out.retired_nodes.push(node);
            return EraseStatus::Gone;
        }
        node.begin_mutate();
        let mut bmp = view.bitmap();
        for i in idx..count - 1 {
            view.store_child_slot(i, view.child_slot_bits(i + 1));
        }
        view.store_child_slot(count - 1, 0);
        bmp.clear(c);
        view.store_bitmap(bmp);
        node.end_mutate();
        return EraseStatus::Erased;
    }

    // Interior node.
    if key.is_empty() {
        let slot = view.pre_eos_slot();
        let bits = view.load_eos(slot);
        if bits == 0 {
            return EraseStatus::NotFound;
        }
        view.store_slot_bits(slot, 0);
        node.bump_committed();
        out.retired_boxes.push(bits);
        return collapse_check::<V>(node, view, out);
    }

    let skip = view.skip_bytes();
    let m = common_prefix(skip, key);
    if m < skip.len() {
        return EraseStatus::NotFound;
    }
    let after = &key[m..];

    if after.is_empty() {
        let slot = view.post_eos_slot();
        let bits = view.load_eos(slot);
        if bits == 0 {
            return EraseStatus::NotFound;
        }
        view.store_slot_bits(slot, 0);
        node.bump_committed();
        out.retired_boxes.push(bits);
        return collapse_check::<V>(node, view, out);
    }

    let c = after[0];
    let Some(slot) = view.find_entry(c) else {
        return EraseStatus::NotFound;
    };
    let child_bits = view.load_slot_bits(slot);
    let Some(child) = NodePtr::from_bits(child_bits) else {
        return EraseStatus::NotFound;
    };

    match erase_rec::<V>(child, &after[1..], out) {
        EraseStatus::NotFound => EraseStatus::NotFound,
        EraseStatus::Erased => EraseStatus::Erased,
        EraseStatus::Replaced(merged) => {
            node.bump_committed();
            view.store_slot_bits(slot, merged.bits());
            EraseStatus::Erased
        }
        EraseStatus::Gone => {
            remove_child_entry(node, view, c);
            collapse_check::<V>(node, view, out)
        }
    }
}

/// Unlinks the child entry for byte `c` from an interior node.
unsafe fn remove_child_entry(node: NodePtr, view: NodeView, c: u8) {
    if view.has_full() {
        let base = view.child_base_slot();
        view.store_slot_bits(base + c as usize, 0);
        node.bump_committed();
    } else if view.has_list() {
        let idx = view.list().find(c).expect("routed edge is listed");
        let count = view.list().count();
        node.begin_mutate();
        let mut lst = view.list();
        for i in idx..count - 1 {
            view.store_child_slot(i, view.child_slot_bits(i + 1));
        }
        view.store_child_slot(count - 1, 0);
        lst.remove_at(idx);
        view.store_list(lst);
        node.end_mutate();
    } else {
        let idx = view.bitmap().find(c).expect("routed edge is mapped");
        let count = view.bitmap().count();
        node.begin_mutate();
        let mut bmp = view.bitmap();
        for i in idx..count - 1 {
            view.store_child_slot(i, view.child_slot_bits(i + 1));
        }
        view.store_child_slot(count - 1, 0);
        bmp.clear(c);
        view.store_bitmap(bmp);
        node.end_mutate();
    }
}

/// Collapses an interior node after something was removed beneath it.
unsafe fn collapse_check<V: Clone>(
    node: NodePtr,
    view: NodeView,
    out: &mut EraseOut,
) -> EraseStatus {
    let pre = view.load_eos(view.pre_eos_slot());
    let post = if view.has_skip() {
        view.load_eos(view.post_eos_slot())
    } else {
        0
    };
    let count = view.child_count();

    if count == 0 {
        if pre == 0 && post == 0 {
            out.retired_nodes.push(node);
            return EraseStatus::Gone;
        }
        return EraseStatus::Erased;
    }
    if count != 1 || pre != 0 || post != 0 {
        return EraseStatus::Erased;
    }

    let pairs = collect_child_pairs(view);
    debug_assert_eq!(pairs.len(), 1);
    let (c, child_bits) = pairs[0];
    let child = NodePtr::from_bits(child_bits).expect("counted child is non-null");
    match merge_single_child::<V>(node, view, c, child, out) {
        Some(merged) => EraseStatus::Replaced(merged),
        None => EraseStatus::Erased,
    }
}

/// Merges a single-child node with that child. Returns `None` when the
/// merge would lose a key position: the child carries an EOS at its
/// entry under a non-empty child skip, which has no slot in the merged
/// node.
unsafe fn merge_single_child<V: Clone>(
    node: NodePtr,
    view: NodeView,
    c: u8,
    child: NodePtr,
    out: &mut EraseOut,
) -> Option<NodePtr> {
    let cview = NodeView::new(child);
    let child_skip = cview.skip_bytes();

    if !cview.is_leaf() && !child_skip.is_empty() && cview.load_eos(cview.pre_eos_slot()) != 0 {
        return None;
    }

    let mut skip = Vec::with_capacity(view.skip_len() + 1 + child_skip.len());
    skip.extend_from_slice(view.skip_bytes());
    skip.push(c);
    skip.extend_from_slice(child_skip);

    let merged = if cview.is_terminal_leaf() {
        let slot = if cview.has_skip() {
            cview.post_eos_slot()
        } else {
            cview.pre_eos_slot()
        };
        let value: V = eos_ref::<V>(cview.load_eos(slot))
            .expect("terminal leaf carries a value")
            .clone();
        build_terminal_leaf(&skip, box_value(value))
    } else if cview.is_leaf() {
        build_leaf_from_pairs(&skip, &collect_leaf_pairs(cview))
    } else {
        // A skipless child keeps its branch-point EOS at the merged
        // node's post-skip position; a skipped child was checked above.
        let post = if cview.has_skip() {
            clone_eos::<V>(cview.load_eos(cview.post_eos_slot()))
        } else {
            clone_eos::<V>(cview.load_eos(cview.pre_eos_slot()))
        };
        build_interior_from_pairs(&skip, 0, post, &collect_child_pairs(cview))
    };

    out.retired_nodes.push(node);
    out.retired_nodes.push(child);
    Some(merged)
}

unsafe fn retire_node<V>(node: NodePtr) {
    unsafe fn drop_node<V>(ptr: *mut u8) {
        let node = NodePtr::from_bits(ptr as u64).expect("retired node is non-null");
        dealloc_node::<V>(node);
    }
    ebr::retire(node.as_ptr() as *mut u8, drop_node::<V>);
}

unsafe fn retire_box<V>(bits: u64) {
    unsafe fn drop_box<V>(ptr: *mut u8) {
        drop(Box::from_raw(ptr as *mut V));
    }
    ebr::retire(bits as *mut u8, drop_box::<V>);
}

/// Full erase driver. Returns true iff the key was present and is now
/// removed.
pub(crate) unsafe fn erase_value<V: Clone>(
    root: &AtomicU64,
    write_lock: &Mutex<()>,
    counters: &Counters,
    key: &[u8],
) -> bool {
    let guard = ebr::pin();

    // Validated lock-free absent check: a clean miss is a legitimate
    // linearization of the erase.
    if nav::lookup(root, key, counters, &guard).is_none() {
        return false;
    }

    let locked = write_lock.lock();
    let mut out = EraseOut::default();
    let status = match NodePtr::from_bits(root.load(Ordering::Acquire)) {
        None => EraseStatus::NotFound,
        Some(node) => erase_rec::<V>(node, key, &mut out),
    };
    let erased = match status {
        EraseStatus::NotFound => false,
        EraseStatus::Erased => true,
        EraseStatus::Gone => {
            root.store(0, Ordering::Release);
            true
        }
        EraseStatus::Replaced(merged) => {
            root.store(sentinel_bits(), Ordering::Release);
            root.store(merged.bits(), Ordering::Release);
            true
        }
    };
    drop(locked);

    for node in out.retired_nodes {
        retire_node::<V>(node);
    }
    for bits in out.retired_boxes {
        retire_box::<V>(bits);
    }
    erased
}
