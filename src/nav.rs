//! Lock-free reader traversal.
//!
//! Readers hold an epoch guard, never block, and tolerate racing
//! writers: a traversal restarts from the root whenever it observes a
//! poisoned node, the retry sentinel, an odd (mid-mutation) version, or
//! a header that changed under it. Every answer — found, absent, or a
//! successor key — is validated against the header snapshot of each node
//! that contributed to it, so a reader can only ever report a state the
//! tree actually passed through.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::ebr::Guard;
use crate::node::{header_unstable, sentinel_bits, NodePtr, NodeView, FLAGS_MASK};
use crate::trie::Counters;

/// Where a present key stores its value.
#[derive(Copy, Clone, Debug)]
pub(crate) enum Found {
    /// Boxed value behind an EOS slot (never null).
    Eos(u64),
    /// Embedded leaf value bits.
    Embedded(u64),
}

impl Found {
    /// Materializes the value. Must run under the guard that produced
    /// the lookup, before a racing writer's retirement can be reclaimed.
    pub(crate) unsafe fn value<V: Clone>(self) -> V {
        match self {
            Found::Eos(bits) => crate::node::eos_ref::<V>(bits)
                .expect("found EOS is non-null")
                .clone(),
            Found::Embedded(bits) => crate::node::bits_to_value::<V>(bits),
        }
    }
}

struct Restart;

type Step<T> = Result<T, Restart>;

#[inline]
fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

/// Resolves child-slot bits into a live node, reporting sentinels and
/// unstable headers as restarts. Returns the node together with its
/// validated header snapshot.
#[inline]
unsafe fn resolve(bits: u64, counters: &Counters) -> Step<Option<(NodeView, u64)>> {
    if bits == 0 {
        return Ok(None);
    }
    if bits == sentinel_bits() {
        counters.note_sentinel();
        return Err(Restart);
    }
    let node = NodePtr::from_bits(bits).expect("non-null child bits");
    let h1 = node.header();
    if header_unstable(h1) {
        counters.note_unstable();
        return Err(Restart);
    }
    Ok(Some((
        NodeView {
            node,
            flags: h1 & FLAGS_MASK,
        },
        h1,
    )))
}

#[inline]
unsafe fn still_valid(view: NodeView, h1: u64) -> Step<()> {
    if view.node.header() == h1 {
        Ok(())
    } else {
        Err(Restart)
    }
}

/// Point lookup. Returns where the value lives, validated against every
/// header on the way down.
unsafe fn lookup_step(bits: u64, key: &[u8], counters: &Counters) -> Step<Option<Found>> {
    let mut bits = bits;
    let mut key = key;
    loop {
        let Some((view, h1)) = resolve(bits, counters)? else {
            return Ok(None);
        };

        // Key consumed at node entry: the pre-skip EOS position.
        if key.is_empty() {
            let found = if !view.is_leaf() || (view.is_terminal_leaf() && !view.has_skip()) {
                let eos = view.load_eos(view.pre_eos_slot());
                (eos != 0).then_some(Found::Eos(eos))
            } else {
                None
            };
            still_valid(view, h1)?;
            return Ok(found);
        }

        let skip = view.skip_bytes();
        let m = common_prefix(skip, key);
        if m < skip.len() {
            still_valid(view, h1)?;
            return Ok(None);
        }
        key = &key[m..];

        // Key consumed right after the skip: the skip-EOS position.
        if key.is_empty() {
            let found = if view.is_terminal_leaf() || !view.is_leaf() {
                let eos = view.load_eos(view.post_eos_slot());
                (eos != 0).then_some(Found::Eos(eos))
            } else {
                None
            };
            still_valid(view, h1)?;
            return Ok(found);
        }

        if view.is_terminal_leaf() {
            still_valid(view, h1)?;
            return Ok(None);
        }

        let c = key[0];
        if view.is_leaf() {
            let found = if key.len() == 1 {
                view.find_entry(c)
                    .map(|slot| unsafe { Found::Embedded(view.load_slot_bits(slot)) })
            } else {
                None
            };
            still_valid(view, h1)?;
            return Ok(found);
        }

        match view.find_entry(c) {
            None => {
                still_valid(view, h1)?;
                return Ok(None);
            }
            Some(slot) => {
                let child = view.load_slot_bits(slot);
                still_valid(view, h1)?;
                bits = child;
                key = &key[1..];
            }
        }
    }
}

pub(crate) unsafe fn lookup(
    root: &AtomicU64,
    key: &[u8],
    counters: &Counters,
    _guard: &Guard,
) -> Option<Found> {
    loop {
        match lookup_step(root.load(Ordering::Acquire), key, counters) {
            Ok(found) => return found,
            Err(Restart) => {
                counters.note_restart();
                std::hint::spin_loop();
            }
        }
    }
}

/// Smallest entry in the subtree, including the pre-skip EOS position.
/// `acc` carries the key bytes accumulated above this node and is left
/// untouched when nothing is found.
unsafe fn subtree_first(bits: u64, acc: &mut Vec<u8>, counters: &Counters) -> Step<Option<Found>> {
    let Some((view, h1)) = resolve(bits, counters)? else {
        return Ok(None);
    };

    if !view.is_leaf() || (view.is_terminal_leaf() && !view.has_skip()) {
        let eos = view.load_eos(view.pre_eos_slot());
        if eos != 0 {
            still_valid(view, h1)?;
            return Ok(Some(Found::Eos(eos)));
        }
    }

    let mark = acc.len();
    acc.extend_from_slice(view.skip_bytes());
    match first_from_post(view, h1, acc, counters)? {
        Some(found) => Ok(Some(found)),
        None => {
            acc.truncate(mark);
            still_valid(view, h1)?;
            Ok(None)
        }
    }
}

/// Smallest entry at or below the post-skip position: the skip-EOS, then
/// the children in ascending byte order.
unsafe fn first_from_post(
    view: NodeView,
    h1: u64,
    acc: &mut Vec<u8>,
    counters: &Counters,
) -> Step<Option<Found>> {
    if view.has_skip() && (view.is_terminal_leaf() || !view.is_leaf()) {
        let eos = view.load_eos(view.post_eos_slot());
        if eos != 0 {
            still_valid(view, h1)?;
            return Ok(Some(Found::Eos(eos)));
        }
    }
    children_first(view, h1, acc, None, counters)
}

/// Smallest entry among children with byte strictly above `after`
/// (`None` = no lower bound).
unsafe fn children_first(
    view: NodeView,
    h1: u64,
    acc: &mut Vec<u8>,
    after: Option<u8>,
    counters: &Counters,
) -> Step<Option<Found>> {
    if view.is_terminal_leaf() {
        still_valid(view, h1)?;
        return Ok(None);
    }

    let candidates: Vec<(u8, usize)> = if view.has_full() {
        let base = view.child_base_slot();
        if view.is_leaf() {
            view.leaf_valid()
                .iter()
                .filter(|&c| after.map_or(true, |a| c > a))
                .map(|c| (c, base + c as usize))
                .collect()
        } else {
            (0u16..=255)
                .map(|c| c as u8)
                .filter(|&c| after.map_or(true, |a| c > a))
                .map(|c| (c, base + c as usize))
                .collect()
        }
    } else if view.has_list() {
        let base = view.child_base_slot();
        view.list()
            .iter()
            .enumerate()
            .filter(|&(_, c)| after.map_or(true, |a| c > a))
            .map(|(i, c)| (c, base + i))
            .collect()
    } else if view.has_pop() {
        let base = view.child_base_slot();
        view.bitmap()
            .iter()
            .enumerate()
            .filter(|&(_, c)| after.map_or(true, |a| c > a))
            .map(|(i, c)| (c, base + i))
            .collect()
    } else {
        Vec::new()
    };
    // The enumeration above is only trustworthy if the node has not
    // mutated since the header snapshot.
    still_valid(view, h1)?;

    for (c, slot) in candidates {
        let bits = view.load_slot_bits(slot);
        still_valid(view, h1)?;
        if view.is_leaf() {
            acc.push(c);
            return Ok(Some(Found::Embedded(bits)));
        }
        if bits == 0 {
            continue;
        }
        if bits == sentinel_bits() {
            counters.note_sentinel();
            return Err(Restart);
        }
        acc.push(c);
        match subtree_first(bits, acc, counters)? {
            Some(found) => {
                still_valid(view, h1)?;
                return Ok(Some(found));
            }
            None => {
                acc.pop();
            }
        }
    }
    still_valid(view, h1)?;
    Ok(None)
}

/// Smallest entry in the subtree strictly greater than the remaining
/// previous-key bytes `prev`.
unsafe fn subtree_next(
    bits: u64,
    prev: &[u8],
    acc: &mut Vec<u8>,
    counters: &Counters,
) -> Step<Option<Found>> {
    let Some((view, h1)) = resolve(bits, counters)? else {
        return Ok(None);
    };

    let mark = acc.len();
    let skip = view.skip_bytes();
    let m = common_prefix(skip, prev);

    if m < skip.len() {
        let subtree_is_greater = m == prev.len() || prev[m] < skip[m];
        if !subtree_is_greater {
            still_valid(view, h1)?;
            return Ok(None);
        }
        acc.extend_from_slice(skip);
        return match first_from_post(view, h1, acc, counters)? {
            Some(found) => Ok(Some(found)),
            None => {
                acc.truncate(mark);
                still_valid(view, h1)?;
                Ok(None)
            }
        };
    }

    let rest = &prev[m..];
    acc.extend_from_slice(skip);

    let result = if rest.is_empty() {
        // The previous key ends exactly at the post-skip position; every
        // child entry is greater.
        children_first(view, h1, acc, None, counters)?
    } else {
        let c = rest[0];
        let mut found = None;
        if !view.is_leaf() {
            if let Some(slot) = view.find_entry(c) {
                let child = view.load_slot_bits(slot);
                still_valid(view, h1)?;
                if child == sentinel_bits() {
                    counters.note_sentinel();
                    return Err(Restart);
                }
                if child != 0 {
                    acc.push(c);
                    found = subtree_next(child, &rest[1..], acc, counters)?;
                    if found.is_some() {
                        still_valid(view, h1)?;
                    } else {
                        acc.pop();
                    }
                }
            }
        }
        match found {
            Some(found) => Some(found),
            None => children_first(view, h1, acc, Some(c), counters)?,
        }
    };

    match result {
        Some(found) => Ok(Some(found)),
        None => {
            acc.truncate(mark);
            still_valid(view, h1)?;
            Ok(None)
        }
    }
}

/// Smallest key in the trie, with its value location.
pub(crate) unsafe fn first_entry(
    root: &AtomicU64,
    counters: &Counters,
    _guard: &Guard,
) -> Option<(Vec<u8>, Found)> {
    loop {
        let mut acc = Vec::new();
        match subtree_first(root.load(Ordering::Acquire), &mut acc, counters) {
            Ok(Some(found)) => return Some((acc, found)),
            Ok(None) => return None,
            Err(Restart) => {
                counters.note_restart();
                std::hint::spin_loop();
            }
        }
    }
}

/// Smallest key strictly greater than `prev`, with its value location.
pub(crate) unsafe fn next_entry_after(
    root: &AtomicU64,
    prev: &[u8],
    counters: &Counters,
    _guard: &Guard,
) -> Option<(Vec<u8>, Found)> {
    loop {
        let mut acc = Vec::new();
        match subtree_next(root.load(Ordering::Acquire), prev, &mut acc, counters) {
            Ok(Some(found)) => return Some((acc, found)),
            Ok(None) => return None,
            Err(Restart) => {
                counters.note_restart();
                std::hint::spin_loop();
            }
        }
    }
}
