//! Node construction and destruction.
//!
//! Exactly one constructor per variant family, a shallow deallocator
//! that never follows child pointers (displaced and abandoned nodes may
//! reference children still owned by the live tree), a recursive
//! `free_subtree` used only once a tree is detached, and a recursive
//! `deep_copy` backing `Clone`.

use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::ptr::NonNull;
use std::sync::atomic::AtomicU64;

use crate::bitmap::Bitmap256;
use crate::list::{SmallList, LIST_MAX};
use crate::node::{
    box_value, drop_eos_box, eos_ref, make_header, skip_words, NodePtr, NodeView, FLAG_FULL,
    FLAG_LEAF, FLAG_LIST, FLAG_POP, FLAG_SKIP,
};

/// POP holds up to this many children; inserting one more converts the
/// node to FULL.
pub(crate) const POP_MAX: usize = 128;

/// Branch representation chosen for a given child count.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum Repr {
    List,
    Pop,
    Full,
}

#[inline]
pub(crate) fn repr_for(count: usize) -> Repr {
    if count <= LIST_MAX {
        Repr::List
    } else if count <= POP_MAX {
        Repr::Pop
    } else {
        Repr::Full
    }
}

fn layout_for(slots: usize) -> Layout {
    Layout::array::<AtomicU64>(slots).expect("node size overflow")
}

unsafe fn alloc_slots(slots: usize) -> NodePtr {
    let layout = layout_for(slots);
    let Some(ptr) = NonNull::new(alloc_zeroed(layout) as *mut AtomicU64) else {
        handle_alloc_error(layout);
    };
    NodePtr::from_raw(ptr)
}

/// Writes the packed skip section (length slot + char slots). The char
/// slot padding is already zero from the allocator.
unsafe fn write_skip(node: NodePtr, len_slot: usize, skip: &[u8]) {
    node.slot(len_slot)
        .store(skip.len() as u64, std::sync::atomic::Ordering::Relaxed);
    let dst = node.as_ptr().add(len_slot + 1) as *mut u8;
    std::ptr::copy_nonoverlapping(skip.as_ptr(), dst, skip.len());
}

/// Child structure of a new interior node.
pub(crate) enum Children<'a> {
    None,
    List(SmallList, &'a [u64]),
    Pop(Bitmap256, &'a [u64]),
    Full(&'a [u64; 256]),
}

/// Value structure of a new multi-entry leaf.
pub(crate) enum LeafEntries<'a> {
    List(SmallList, &'a [u64]),
    Pop(Bitmap256, &'a [u64]),
    Full(Bitmap256, &'a [u64; 256]),
}

/// Builds a non-leaf node. `pre_eos`/`post_eos` are boxed-value slot
/// words (0 = absent); on a skipless node both positions share slot 1,
/// so at most one may be non-zero.
pub(crate) unsafe fn build_interior(
    skip: &[u8],
    pre_eos: u64,
    post_eos: u64,
    children: Children<'_>,
) -> NodePtr {
    debug_assert!(!skip.is_empty() || pre_eos == 0 || post_eos == 0);
    let mut flags = 0u64;
    let mut slots = 2;
    if !skip.is_empty() {
        flags |= FLAG_SKIP;
        slots += 1 + skip_words(skip.len()) + 1;
    }
    let (repr_slots, child_slots) = match &children {
        Children::None => (0, 0),
        Children::List(lst, kids) => {
            debug_assert_eq!(lst.count(), kids.len());
            flags |= FLAG_LIST;
            (1, kids.len())
        }
        Children::Pop(bmp, kids) => {
            debug_assert_eq!(bmp.count(), kids.len());
            flags |= FLAG_POP;
            (4, kids.len())
        }
        Children::Full(_) => {
            flags |= FLAG_FULL;
            (0, 256)
        }
    };
    slots += repr_slots + child_slots;

    let node = alloc_slots(slots);
    node.store_header(make_header(flags, slots));
    let view = NodeView::new(node);
    if !skip.is_empty() {
        write_skip(node, 2, skip);
        view.store_slot_bits(view.post_eos_slot(), post_eos);
        view.store_slot_bits(view.pre_eos_slot(), pre_eos);
    } else {
        view.store_slot_bits(view.pre_eos_slot(), pre_eos | post_eos);
    }
    match children {
        Children::None => {}
        Children::List(lst, kids) => {
            view.store_list(lst);
            for (i, &bits) in kids.iter().enumerate() {
                view.store_child_slot(i, bits);
            }
        }
        Children::Pop(bmp, kids) => {
            view.store_bitmap(bmp);
            for (i, &bits) in kids.iter().enumerate() {
                view.store_child_slot(i, bits);
            }
        }
        Children::Full(kids) => {
            for (i, &bits) in kids.iter().enumerate() {
                view.store_child_slot(i, bits);
            }
        }
    }
    node
}

/// Builds a terminal leaf holding a single boxed value at the position
/// where its skip (possibly empty) is consumed.
pub(crate) unsafe fn build_terminal_leaf(skip: &[u8], value_bits: u64) -> NodePtr {
    let mut flags = FLAG_LEAF | FLAG_LIST | FLAG_POP;
    let slots;
    if skip.is_empty() {
        slots = 2;
    } else {
        flags |= FLAG_SKIP;
        slots = 1 + 1 + skip_words(skip.len()) + 1;
    }
    let node = alloc_slots(slots);
    node.store_header(make_header(flags, slots));
    let view = NodeView::new(node);
    if !skip.is_empty() {
        write_skip(node, 1, skip);
        view.store_slot_bits(view.post_eos_slot(), value_bits);
    } else {
        view.store_slot_bits(view.pre_eos_slot(), value_bits);
    }
    node
}

/// Builds a multi-entry leaf with embedded values.
pub(crate) unsafe fn build_leaf(skip: &[u8], entries: LeafEntries<'_>) -> NodePtr {
    let mut flags = FLAG_LEAF;
    let mut slots = 1;
    if !skip.is_empty() {
        flags |= FLAG_SKIP;
        slots += 1 + skip_words(skip.len());
    }
    let (repr_slots, value_slots) = match &entries {
        LeafEntries::List(lst, vals) => {
            debug_assert_eq!(lst.count(), vals.len());
            flags |= FLAG_LIST;
            (1, vals.len())
        }
        LeafEntries::Pop(bmp, vals) => {
            debug_assert_eq!(bmp.count(), vals.len());
            flags |= FLAG_POP;
            (4, vals.len())
        }
        LeafEntries::Full(_, _) => {
            flags |= FLAG_FULL;
            (4, 256)
        }
    };
    slots += repr_slots + value_slots;

    let node = alloc_slots(slots);
    node.store_header(make_header(flags, slots));
    let view = NodeView::new(node);
    if !skip.is_empty() {
        write_skip(node, 1, skip);
    }
    match entries {
        LeafEntries::List(lst, vals) => {
            view.store_list(lst);
            for (i, &bits) in vals.iter().enumerate() {
                view.store_child_slot(i, bits);
            }
        }
        LeafEntries::Pop(bmp, vals) => {
            view.store_bitmap(bmp);
            for (i, &bits) in vals.iter().enumerate() {
                view.store_child_slot(i, bits);
            }
        }
        LeafEntries::Full(valid, vals) => {
            view.store_bitmap(valid);
            for (i, &bits) in vals.iter().enumerate() {
                view.store_child_slot(i, bits);
            }
        }
    }
    node
}

/// Builds an interior node from ascending `(byte, child_bits)` pairs,
/// picking the representation from the pair count.
pub(crate) unsafe fn build_interior_from_pairs(
    skip: &[u8],
    pre_eos: u64,
    post_eos: u64,
    pairs: &[(u8, u64)],
) -> NodePtr {
    debug_assert!(pairs.windows(2).all(|w| w[0].0 < w[1].0));
    if pairs.is_empty() {
        return build_interior(skip, pre_eos, post_eos, Children::None);
    }
    match repr_for(pairs.len()) {
        Repr::List => {
            let mut lst = SmallList::new();
            let mut kids = [0u64; LIST_MAX];
            for (i, &(c, bits)) in pairs.iter().enumerate() {
                lst.insert(c);
                kids[i] = bits;
            }
            build_interior(
                skip,
                pre_eos,
                post_eos,
                Children::List(lst, &kids[..pairs.len()]),
            )
        }
        Repr::Pop => {
            let mut bmp = Bitmap256::new();
            let mut kids = Vec::with_capacity(pairs.len());
            for &(c, bits) in pairs {
                bmp.set(c);
                kids.push(bits);
            }
            build_interior(skip, pre_eos, post_eos, Children::Pop(bmp, &kids))
        }
        Repr::Full => {
            let mut kids = [0u64; 256];
            for &(c, bits) in pairs {
                kids[c as usize] = bits;
            }
            build_interior(skip, pre_eos, post_eos, Children::Full(&kids))
        }
    }
}

/// Builds a multi-entry leaf from ascending `(byte, value_bits)` pairs.
pub(crate) unsafe fn build_leaf_from_pairs(skip: &[u8], pairs: &[(u8, u64)]) -> NodePtr {
    debug_assert!(pairs.windows(2).all(|w| w[0].0 < w[1].0));
    debug_assert!(!pairs.is_empty());
    match repr_for(pairs.len()) {
        Repr::List => {
            let mut lst = SmallList::new();
            let mut vals = [0u64; LIST_MAX];
            for (i, &(c, bits)) in pairs.iter().enumerate() {
                lst.insert(c);
                vals[i] = bits;
            }
            build_leaf(skip, LeafEntries::List(lst, &vals[..pairs.len()]))
        }
        Repr::Pop => {
            let mut bmp = Bitmap256::new();
            let mut vals = Vec::with_capacity(pairs.len());
            for &(c, bits) in pairs {
                bmp.set(c);
                vals.push(bits);
            }
            build_leaf(skip, LeafEntries::Pop(bmp, &vals))
        }
        Repr::Full => {
            let mut valid = Bitmap256::new();
            let mut vals = [0u64; 256];
            for &(c, bits) in pairs {
                valid.set(c);
                vals[c as usize] = bits;
            }
            build_leaf(skip, LeafEntries::Full(valid, &vals))
        }
    }
}

/// Destroys a single node: drops any boxed EOS values it owns and frees
/// the slot array. Children are never followed.
pub(crate) unsafe fn dealloc_node<V>(node: NodePtr) {
    let view = NodeView::new(node);
    if !view.is_leaf() {
        drop_eos_box::<V>(view.load_eos(view.pre_eos_slot()));
        if view.has_skip() {
            drop_eos_box::<V>(view.load_eos(view.post_eos_slot()));
        }
    } else if view.is_terminal_leaf() {
        let slot = if view.has_skip() {
            view.post_eos_slot()
        } else {
            view.pre_eos_slot()
        };
        drop_eos_box::<V>(view.load_eos(slot));
    }
    let slots = node.slots();
    dealloc(node.as_ptr() as *mut u8, layout_for(slots));
}

/// Frees a whole detached subtree. Only sound when no reader can reach
/// it: teardown after `clear`/drop, or abandoned private construction.
pub(crate) unsafe fn free_subtree<V>(node: NodePtr) {
    let view = NodeView::new(node);
    if !view.is_leaf() {
        match () {
            _ if view.has_full() => {
                let base = view.child_base_slot();
                for i in 0..256 {
                    if let Some(child) = NodePtr::from_bits(view.load_slot_bits(base + i)) {
                        free_subtree::<V>(child);
                    }
                }
            }
            _ if view.has_list() => {
                for i in 0..view.list().count() {
                    if let Some(child) = NodePtr::from_bits(view.child_slot_bits(i)) {
                        free_subtree::<V>(child);
                    }
                }
            }
            _ if view.has_pop() => {
                for i in 0..view.bitmap().count() {
                    if let Some(child) = NodePtr::from_bits(view.child_slot_bits(i)) {
                        free_subtree::<V>(child);
                    }
                }
            }
            _ => {}
        }
    }
    dealloc_node::<V>(node);
}

/// Clones the boxed value behind an EOS slot word into a fresh box.
/// Structural rebuilds use this instead of adopting the pointer, so the
/// displaced node keeps sole ownership of its own box.
pub(crate) unsafe fn clone_eos<V: Clone>(bits: u64) -> u64 {
    match eos_ref::<V>(bits) {
        Some(v) => box_value(v.clone()),
        None => 0,
    }
}

/// Ascending `(byte, child_bits)` pairs of an interior node, skipping
/// slots nulled by deletion.
pub(crate) unsafe fn collect_child_pairs(view: NodeView) -> Vec<(u8, u64)> {
    debug_assert!(!view.is_leaf());
    let mut pairs = Vec::new();
    if view.has_full() {
        let base = view.child_base_slot();
        for c in 0u16..=255 {
            let bits = view.load_slot_bits(base + c as usize);
            if bits != 0 {
                pairs.push((c as u8, bits));
            }
        }
    } else if view.has_list() {
        for (i, c) in view.list().iter().enumerate() {
            let bits = view.child_slot_bits(i);
            if bits != 0 {
                pairs.push((c, bits));
            }
        }
    } else if view.has_pop() {
        for (i, c) in view.bitmap().iter().enumerate() {
            let bits = view.child_slot_bits(i);
            if bits != 0 {
                pairs.push((c, bits));
            }
        }
    }
    pairs
}

/// Ascending `(byte, value_bits)` pairs of a multi-entry leaf.
pub(crate) unsafe fn collect_leaf_pairs(view: NodeView) -> Vec<(u8, u64)> {
    debug_assert!(view.leaf_has_entries());
    let mut pairs = Vec::new();
    if view.has_full() {
        let base = view.child_base_slot();
        for c in view.leaf_valid().iter() {
            pairs.push((c, view.load_slot_bits(base + c as usize)));
        }
    } else if view.has_list() {
        for (i, c) in view.list().iter().enumerate() {
            pairs.push((c, view.child_slot_bits(i)));
        }
    } else if view.has_pop() {
        for (i, c) in view.bitmap().iter().enumerate() {
            pairs.push((c, view.child_slot_bits(i)));
        }
    }
    pairs
}

/// Recursively copies a subtree, cloning boxed values and bit-copying
/// embedded leaf values. The copy starts with a fresh version and no
/// poison.
pub(crate) unsafe fn deep_copy<V: Clone>(node: NodePtr) -> NodePtr {
    let view = NodeView::new(node);
    let slots = node.slots();
    let copy = alloc_slots(slots);
    copy.store_header(make_header(view.flags, slots));
    let cview = NodeView::new(copy);

    if view.has_skip() {
        write_skip(copy, if view.is_leaf() { 1 } else { 2 }, view.skip_bytes());
    }

    if !view.is_leaf() {
        cview.store_slot_bits(
            cview.pre_eos_slot(),
            clone_eos::<V>(view.load_eos(view.pre_eos_slot())),
        );
        if view.has_skip() {
            cview.store_slot_bits(
                cview.post_eos_slot(),
                clone_eos::<V>(view.load_eos(view.post_eos_slot())),
            );
        }
        match () {
            _ if view.has_full() => {
                let base = view.child_base_slot();
                let cbase = cview.child_base_slot();
                for i in 0..256 {
                    if let Some(child) = NodePtr::from_bits(view.load_slot_bits(base + i)) {
                        cview.store_slot_bits(cbase + i, deep_copy::<V>(child).bits());
                    }
                }
            }
            _ if view.has_list() => {
                cview.store_list(view.list());
                for i in 0..view.list().count() {
                    if let Some(child) = NodePtr::from_bits(view.child_slot_bits(i)) {
                        cview.store_child_slot(i, deep_copy::<V>(child).bits());
                    }
                }
            }
            _ if view.has_pop() => {
                cview.store_bitmap(view.bitmap());
                for i in 0..view.bitmap().count() {
                    if let Some(child) = NodePtr::from_bits(view.child_slot_bits(i)) {
                        cview.store_child_slot(i, deep_copy::<V>(child).bits());
                    }
                }
            }
            _ => {}
        }
    } else if view.is_terminal_leaf() {
        let (src, dst) = if view.has_skip() {
            (view.post_eos_slot(), cview.post_eos_slot())
        } else {
            (view.pre_eos_slot(), cview.pre_eos_slot())
        };
        cview.store_slot_bits(dst, clone_eos::<V>(view.load_eos(src)));
    } else {
        // Embedded values: copy the representation header and the value
        // slots verbatim.
        let from = view.children_header_slot();
        let to = slots;
        let cfrom = cview.children_header_slot();
        for (i, slot) in (from..to).enumerate() {
            cview.store_slot_bits(cfrom + i, view.load_slot_bits(slot));
        }
    }
    copy
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{bits_to_value, value_to_bits};

    #[test]
    fn terminal_leaf_roundtrip() {
        unsafe {
            let node = build_terminal_leaf(b"apple", box_value(42u32));
            let view = NodeView::new(node);
            assert!(view.is_terminal_leaf());
            assert_eq!(view.skip_bytes(), b"apple");
            let bits = view.load_eos(view.post_eos_slot());
            assert_eq!(eos_ref::<u32>(bits), Some(&42));
            dealloc_node::<u32>(node);
        }
    }

    #[test]
    fn interior_layout_roundtrip() {
        unsafe {
            let child = build_terminal_leaf(b"", box_value(7u64));
            let node = build_interior_from_pairs(
                b"ap",
                0,
                box_value(1u64),
                &[(b'p', child.bits())],
            );
            let view = NodeView::new(node);
            assert!(!view.is_leaf());
            assert_eq!(view.skip_bytes(), b"ap");
            assert_eq!(view.load_eos(view.pre_eos_slot()), 0);
            assert_eq!(
                eos_ref::<u64>(view.load_eos(view.post_eos_slot())),
                Some(&1)
            );
            let slot = view.find_entry(b'p').unwrap();
            assert_eq!(view.load_slot_bits(slot), child.bits());
            assert_eq!(view.find_entry(b'q'), None);
            free_subtree::<u64>(node);
        }
    }

    fn embedded_pairs(range: impl Iterator<Item = u8>) -> Vec<(u8, u64)> {
        range
            .map(|c| (c, unsafe { value_to_bits(c as u32) }))
            .collect()
    }

    #[test]
    fn leaf_pairs_pick_representation() {
        let small = embedded_pairs(0..5u8);
        let mid = embedded_pairs(0..60u8);
        let big = embedded_pairs(0..=200u8);
        unsafe {
            let node = build_leaf_from_pairs(b"k", &small);
            let view = NodeView::new(node);
            assert!(view.has_list() && !view.has_pop());
            let slot = view.find_entry(3).unwrap();
            assert_eq!(bits_to_value::<u32>(view.load_slot_bits(slot)), 3);
            dealloc_node::<u32>(node);

            let node = build_leaf_from_pairs(b"", &mid);
            let view = NodeView::new(node);
            assert!(view.has_pop());
            dealloc_node::<u32>(node);

            let node = build_leaf_from_pairs(b"", &big);
            let view = NodeView::new(node);
            assert!(view.has_full());
            assert_eq!(view.leaf_valid().count(), 201);
            let slot = view.find_entry(200).unwrap();
            assert_eq!(bits_to_value::<u32>(view.load_slot_bits(slot)), 200);
            dealloc_node::<u32>(node);
        }
    }

    #[test]
    fn deep_copy_clones_boxes() {
        unsafe {
            let child = build_terminal_leaf(b"xyz", box_value(5i32));
            let root = build_interior_from_pairs(b"", 0, box_value(9i32), &[(b'x', child.bits())]);
            let copy = deep_copy::<i32>(root);

            let cv = NodeView::new(copy);
            assert_eq!(
                eos_ref::<i32>(cv.load_eos(cv.pre_eos_slot())),
                Some(&9)
            );
            let slot = cv.find_entry(b'x').unwrap();
            let cchild = NodePtr::from_bits(cv.load_slot_bits(slot)).unwrap();
            assert_ne!(cchild, child);

            free_subtree::<i32>(root);
            free_subtree::<i32>(copy);
        }
    }
}
