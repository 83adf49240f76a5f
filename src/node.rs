//! Packed node representation.
//!
//! A node is a heap block of 64-bit slots. The first slot is the header;
//! every other offset is computed from the header's flag bits, so a
//! reader can decode a node from the header alone:
//!
//! ```text
//! NON-LEAF (pre-skip EOS slot always exists):
//!   [header][eos]                                         - Empty
//!   [header][eos][lst][ptr x N]                           - LIST
//!   [header][eos][bmp x4][ptr x N]                        - POP
//!   [header][eos][ptr x256]                               - FULL
//!   [header][eos][skip_len][chars...][skip_eos]           - SKIP
//!   [header][eos][skip_len][chars...][skip_eos][lst][...] - SKIP+LIST, etc.
//!
//! LEAF (EOS slot only in the terminal LIST|POP sentinel):
//!   [header][lst][V x N]                                  - LEAF|LIST
//!   [header][bmp x4][V x N]                               - LEAF|POP
//!   [header][valid x4][V x256]                            - LEAF|FULL
//!   [header][eos]                                         - LEAF|LIST|POP (terminal)
//!   [header][skip_len][chars...][skip_eos]                - LEAF|SKIP|LIST|POP
//!   [header][skip_len][chars...][lst][V x N]              - LEAF|SKIP|LIST, etc.
//! ```
//!
//! The header packs five flag bits, a 24-bit version, a poison bit and a
//! 27-bit slot count. The version is bumped on every mutation; in-place
//! multi-slot mutations hold it odd for their duration so a reader that
//! overlaps one can detect it and restart. Poisoned nodes are
//! pre-allocations that are not yet live; readers never follow them.

use core::mem::{needs_drop, size_of, MaybeUninit};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::bitmap::Bitmap256;
use crate::list::SmallList;

pub(crate) const FLAG_LEAF: u64 = 1 << 63;
pub(crate) const FLAG_SKIP: u64 = 1 << 62;
pub(crate) const FLAG_LIST: u64 = 1 << 61;
pub(crate) const FLAG_POP: u64 = 1 << 60;
pub(crate) const FLAG_FULL: u64 = 1 << 59;
pub(crate) const FLAGS_MASK: u64 = 0xF8 << 56;

const VERSION_SHIFT: u32 = 35;
const VERSION_MASK: u64 = 0xFF_FFFF << VERSION_SHIFT;
pub(crate) const FLAG_POISON: u64 = 1 << 34;
const SIZE_MASK: u64 = 0x07FF_FFFF;

/// Slots needed to store `len` skip bytes.
#[inline]
pub(crate) const fn skip_words(len: usize) -> usize {
    (len + 7) / 8
}

#[inline]
pub(crate) fn make_header(flags: u64, slots: usize) -> u64 {
    debug_assert_eq!(flags & !FLAGS_MASK, 0);
    flags | (slots as u64 & SIZE_MASK)
}

#[inline]
pub(crate) fn header_version(header: u64) -> u32 {
    ((header & VERSION_MASK) >> VERSION_SHIFT) as u32
}

#[inline]
fn with_version(header: u64, version: u32) -> u64 {
    (header & !VERSION_MASK) | (((version as u64) << VERSION_SHIFT) & VERSION_MASK)
}

#[inline]
pub(crate) fn header_poisoned(header: u64) -> bool {
    header & FLAG_POISON != 0
}

#[inline]
pub(crate) fn header_version_odd(header: u64) -> bool {
    header_version(header) & 1 != 0
}

/// A header is safe for a reader to decode when the node is live and no
/// in-place mutation is in flight.
#[inline]
pub(crate) fn header_unstable(header: u64) -> bool {
    header_poisoned(header) | header_version_odd(header)
}

static RETRY_SENTINEL: AtomicU64 = AtomicU64::new(0);

/// Distinguished slot value instructing readers to restart the lookup.
/// Published transiently between a version bump and the replacement
/// pointer store.
#[inline]
pub(crate) fn sentinel_bits() -> u64 {
    &RETRY_SENTINEL as *const AtomicU64 as u64
}

/// Raw handle to a node's slot array.
///
/// The handle is just the address of the block; all field access decodes
/// offsets from the header. Dereferencing is only sound while the node is
/// reachable (owned by the tree, held by a reader guard, or exclusively
/// owned during construction/teardown), which is why most accessors are
/// `unsafe`.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) struct NodePtr(NonNull<AtomicU64>);

unsafe impl Send for NodePtr {}
unsafe impl Sync for NodePtr {}

impl NodePtr {
    #[inline]
    pub(crate) fn from_raw(ptr: NonNull<AtomicU64>) -> Self {
        NodePtr(ptr)
    }

    #[inline]
    pub(crate) fn from_bits(bits: u64) -> Option<Self> {
        NonNull::new(bits as *mut AtomicU64).map(NodePtr)
    }

    #[inline]
    pub(crate) fn bits(self) -> u64 {
        self.0.as_ptr() as u64
    }

    #[inline]
    pub(crate) fn as_ptr(self) -> *mut AtomicU64 {
        self.0.as_ptr()
    }

    #[inline]
    pub(crate) unsafe fn slot<'a>(self, idx: usize) -> &'a AtomicU64 {
        &*self.0.as_ptr().add(idx)
    }

    #[inline]
    pub(crate) unsafe fn header(self) -> u64 {
        self.slot(0).load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) unsafe fn store_header(self, header: u64) {
        self.slot(0).store(header, Ordering::Release);
    }

    #[inline]
    pub(crate) unsafe fn slots(self) -> usize {
        (self.header() & SIZE_MASK) as usize
    }

    pub(crate) unsafe fn poison(self) {
        let h = self.header();
        self.store_header(h | FLAG_POISON);
    }

    pub(crate) unsafe fn unpoison(self) {
        let h = self.header();
        self.store_header(h & !FLAG_POISON);
    }

    /// Starts an in-place multi-slot mutation: leaves the version odd so
    /// overlapping readers restart. Writer-lock only.
    pub(crate) unsafe fn begin_mutate(self) {
        let h = self.header();
        debug_assert!(!header_version_odd(h));
        self.store_header(with_version(h, header_version(h).wrapping_add(1)));
    }

    /// Ends an in-place mutation, returning the version to even.
    pub(crate) unsafe fn end_mutate(self) {
        let h = self.header();
        debug_assert!(header_version_odd(h));
        self.store_header(with_version(h, header_version(h).wrapping_add(1)));
    }

    /// Bumps the version by two (stays even). Used after single-slot
    /// publications that cannot be observed torn, purely as the signal
    /// that invalidates recorded probe versions.
    pub(crate) unsafe fn bump_committed(self) {
        let h = self.header();
        debug_assert!(!header_version_odd(h));
        self.store_header(with_version(h, header_version(h).wrapping_add(2)));
    }

    // === flag shorthands (decode a caller-supplied header snapshot) ===

    #[inline]
    pub(crate) unsafe fn flags(self) -> u64 {
        self.header() & FLAGS_MASK
    }
}

/// Decoded view of a header snapshot. Offsets depend only on flags and
/// the skip length, both immutable for the node's lifetime, so a view
/// taken from any header snapshot decodes stable offsets.
#[derive(Copy, Clone)]
pub(crate) struct NodeView {
    pub(crate) node: NodePtr,
    pub(crate) flags: u64,
}

impl NodeView {
    /// Snapshot the node's flags. The caller must hold the node alive.
    #[inline]
    pub(crate) unsafe fn new(node: NodePtr) -> Self {
        NodeView {
            node,
            flags: node.flags(),
        }
    }

    #[inline]
    pub(crate) fn is_leaf(self) -> bool {
        self.flags & FLAG_LEAF != 0
    }

    #[inline]
    pub(crate) fn has_skip(self) -> bool {
        self.flags & FLAG_SKIP != 0
    }

    #[inline]
    pub(crate) fn has_list(self) -> bool {
        self.flags & FLAG_LIST != 0
    }

    #[inline]
    pub(crate) fn has_pop(self) -> bool {
        self.flags & FLAG_POP != 0
    }

    #[inline]
    pub(crate) fn has_full(self) -> bool {
        self.flags & FLAG_FULL != 0
    }

    /// `LEAF|LIST|POP` is the terminal-leaf sentinel: no children, one
    /// EOS value.
    #[inline]
    pub(crate) fn is_terminal_leaf(self) -> bool {
        self.is_leaf() && self.has_list() && self.has_pop()
    }

    #[inline]
    pub(crate) fn leaf_has_entries(self) -> bool {
        self.is_leaf() && !self.is_terminal_leaf()
    }

    // === skip section ===

    #[inline]
    fn skip_len_slot(self) -> usize {
        if self.is_leaf() {
            1
        } else {
            2
        }
    }

    #[inline]
    pub(crate) unsafe fn skip_len(self) -> usize {
        if !self.has_skip() {
            return 0;
        }
        self.node.slot(self.skip_len_slot()).load(Ordering::Acquire) as usize
    }

    /// Skip bytes as a slice over the packed char slots.
    ///
    /// SAFETY: skip bytes are written once at construction and never
    /// mutated, so the non-atomic view cannot race; the caller must keep
    /// the node alive for `'a`.
    pub(crate) unsafe fn skip_bytes<'a>(self) -> &'a [u8] {
        if !self.has_skip() {
            return &[];
        }
        let len = self.skip_len();
        let base = self.node.as_ptr().add(self.skip_len_slot() + 1) as *const u8;
        core::slice::from_raw_parts(base, len)
    }

    /// Slot of the EOS for a key ending right at node entry (before the
    /// skip). Exists on every non-leaf node and on the skipless terminal
    /// leaf.
    #[inline]
    pub(crate) fn pre_eos_slot(self) -> usize {
        debug_assert!(!self.is_leaf() || (self.is_terminal_leaf() && !self.has_skip()));
        1
    }

    /// Slot of the EOS for a key ending exactly after the skip. On a
    /// skipless node this coincides with the pre-skip slot.
    #[inline]
    pub(crate) unsafe fn post_eos_slot(self) -> usize {
        if !self.has_skip() {
            return self.pre_eos_slot();
        }
        self.skip_len_slot() + 1 + skip_words(self.skip_len())
    }

    #[inline]
    pub(crate) unsafe fn load_eos(self, slot: usize) -> u64 {
        self.node.slot(slot).load(Ordering::Acquire)
    }

    // === children section ===

    #[inline]
    pub(crate) unsafe fn children_header_slot(self) -> usize {
        if self.is_leaf() {
            debug_assert!(!self.is_terminal_leaf());
            let mut off = 1;
            if self.has_skip() {
                off += 1 + skip_words(self.skip_len());
            }
            off
        } else {
            let mut off = 2;
            if self.has_skip() {
                off += 1 + skip_words(self.skip_len()) + 1;
            }
            off
        }
    }

    #[inline]
    pub(crate) unsafe fn child_base_slot(self) -> usize {
        let off = self.children_header_slot();
        if self.has_full() {
            if self.is_leaf() {
                off + 4 // validity bitmap
            } else {
                off
            }
        } else if self.has_list() {
            off + 1
        } else if self.has_pop() {
            off + 4
        } else {
            off
        }
    }

    #[inline]
    pub(crate) unsafe fn list(self) -> SmallList {
        debug_assert!(self.has_list() && !self.is_terminal_leaf());
        SmallList::from_bits(
            self.node
                .slot(self.children_header_slot())
                .load(Ordering::Acquire),
        )
    }

    pub(crate) unsafe fn store_list(self, list: SmallList) {
        self.node
            .slot(self.children_header_slot())
            .store(list.bits(), Ordering::Release);
    }

    unsafe fn bitmap_at(self, base: usize) -> Bitmap256 {
        let mut words = [0u64; 4];
        for (i, w) in words.iter_mut().enumerate() {
            *w = self.node.slot(base + i).load(Ordering::Acquire);
        }
        Bitmap256::from_words(words)
    }

    unsafe fn store_bitmap_at(self, base: usize, bmp: Bitmap256) {
        for (i, w) in bmp.words().iter().enumerate() {
            self.node.slot(base + i).store(*w, Ordering::Release);
        }
    }

    #[inline]
    pub(crate) unsafe fn bitmap(self) -> Bitmap256 {
        debug_assert!(self.has_pop() && !self.is_terminal_leaf());
        self.bitmap_at(self.children_header_slot())
    }

    pub(crate) unsafe fn store_bitmap(self, bmp: Bitmap256) {
        self.store_bitmap_at(self.children_header_slot(), bmp)
    }

    /// Validity bitmap of a `LEAF|FULL` node.
    #[inline]
    pub(crate) unsafe fn leaf_valid(self) -> Bitmap256 {
        debug_assert!(self.is_leaf() && self.has_full());
        self.bitmap_at(self.children_header_slot())
    }

    /// Atomically publishes byte `c` in a `LEAF|FULL` validity bitmap.
    /// The value slot must already be written (release ordering here
    /// makes it visible to any reader that observes the bit).
    pub(crate) unsafe fn leaf_valid_set_bit(self, c: u8) {
        let slot = self.children_header_slot() + (c >> 6) as usize;
        self.node
            .slot(slot)
            .fetch_or(1u64 << (c & 63), Ordering::Release);
    }

    pub(crate) unsafe fn leaf_valid_clear_bit(self, c: u8) {
        let slot = self.children_header_slot() + (c >> 6) as usize;
        self.node
            .slot(slot)
            .fetch_and(!(1u64 << (c & 63)), Ordering::Release);
    }

    /// Number of occupied child (or value) positions.
    pub(crate) unsafe fn child_count(self) -> usize {
        if self.is_terminal_leaf() {
            0
        } else if self.has_full() {
            if self.is_leaf() {
                self.leaf_valid().count()
            } else {
                let base = self.child_base_slot();
                (0..256)
                    .filter(|i| self.node.slot(base + i).load(Ordering::Acquire) != 0)
                    .count()
            }
        } else if self.has_list() {
            self.list().count()
        } else if self.has_pop() {
            self.bitmap().count()
        } else {
            0
        }
    }

    #[inline]
    pub(crate) unsafe fn child_slot_bits(self, idx: usize) -> u64 {
        self.node
            .slot(self.child_base_slot() + idx)
            .load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) unsafe fn store_child_slot(self, idx: usize, bits: u64) {
        self.node
            .slot(self.child_base_slot() + idx)
            .store(bits, Ordering::Release);
    }

    /// Absolute slot index holding the child pointer (or embedded value)
    /// for byte `c`, if that byte is present in the node's structure.
    pub(crate) unsafe fn find_entry(self, c: u8) -> Option<usize> {
        debug_assert!(!self.is_terminal_leaf());
        if self.has_full() {
            if self.is_leaf() && !self.leaf_valid().contains(c) {
                return None;
            }
            Some(self.child_base_slot() + c as usize)
        } else if self.has_list() {
            let idx = self.list().find(c)?;
            Some(self.child_base_slot() + idx)
        } else if self.has_pop() {
            let idx = self.bitmap().find(c)?;
            Some(self.child_base_slot() + idx)
        } else {
            None
        }
    }

    #[inline]
    pub(crate) unsafe fn load_slot_bits(self, slot: usize) -> u64 {
        self.node.slot(slot).load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) unsafe fn store_slot_bits(self, slot: usize, bits: u64) {
        self.node.slot(slot).store(bits, Ordering::Release);
    }
}

// === value embedding ===

/// A value can live directly in a leaf slot when it fits in 64 bits and
/// is bitwise-duplicable. Otherwise the leaf optimization is disabled
/// and every value is boxed behind an EOS slot.
#[inline]
pub(crate) const fn can_embed<V>() -> bool {
    size_of::<V>() <= 8 && !needs_drop::<V>()
}

/// Packs an embeddable value into a slot word. Guarded by [`can_embed`]
/// at every call site.
#[inline]
pub(crate) unsafe fn value_to_bits<V>(value: V) -> u64 {
    debug_assert!(can_embed::<V>());
    let mut bits = 0u64;
    core::ptr::copy_nonoverlapping(
        &value as *const V as *const u8,
        &mut bits as *mut u64 as *mut u8,
        size_of::<V>(),
    );
    core::mem::forget(value);
    bits
}

/// Unpacks an embeddable value from a slot word.
#[inline]
pub(crate) unsafe fn bits_to_value<V>(bits: u64) -> V {
    debug_assert!(can_embed::<V>());
    let mut out = MaybeUninit::<V>::uninit();
    core::ptr::copy_nonoverlapping(
        &bits as *const u64 as *const u8,
        out.as_mut_ptr() as *mut u8,
        size_of::<V>(),
    );
    out.assume_init()
}

// === boxed EOS values ===

#[inline]
pub(crate) fn box_value<V>(value: V) -> u64 {
    Box::into_raw(Box::new(value)) as u64
}

/// Borrows the boxed value behind an EOS slot word. The caller must hold
/// a reader guard (or the writer lock) so the box cannot be reclaimed.
#[inline]
pub(crate) unsafe fn eos_ref<'a, V>(bits: u64) -> Option<&'a V> {
    (bits as *const V).as_ref()
}

#[inline]
pub(crate) unsafe fn drop_eos_box<V>(bits: u64) {
    if bits != 0 {
        drop(Box::from_raw(bits as *mut V));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_packs_fields_independently() {
        let h = make_header(FLAG_LEAF | FLAG_SKIP, 37);
        assert_eq!(h & FLAGS_MASK, FLAG_LEAF | FLAG_SKIP);
        assert_eq!(h & SIZE_MASK, 37);
        assert_eq!(header_version(h), 0);
        assert!(!header_poisoned(h));
        assert!(!header_unstable(h));

        let bumped = with_version(h, 3);
        assert_eq!(header_version(bumped), 3);
        assert_eq!(bumped & FLAGS_MASK, FLAG_LEAF | FLAG_SKIP);
        assert_eq!(bumped & SIZE_MASK, 37);
        assert!(header_version_odd(bumped));
        assert!(header_unstable(bumped));

        assert!(header_unstable(h | FLAG_POISON));
    }

    #[test]
    fn version_wraps_without_touching_flags() {
        let h = with_version(make_header(FLAG_FULL, 258), 0xFF_FFFF);
        let wrapped = with_version(h, header_version(h).wrapping_add(1) & 0xFF_FFFF);
        assert_eq!(header_version(wrapped), 0);
        assert_eq!(wrapped & FLAGS_MASK, FLAG_FULL);
        assert_eq!(wrapped & SIZE_MASK, 258);
    }

    #[test]
    fn embedded_value_roundtrip() {
        assert!(can_embed::<u64>());
        assert!(can_embed::<(u32, u32)>());
        assert!(!can_embed::<String>());
        assert!(!can_embed::<[u8; 9]>());
        unsafe {
            let bits = value_to_bits(0x1234_5678u32);
            assert_eq!(bits_to_value::<u32>(bits), 0x1234_5678);
            let bits = value_to_bits(-7i8);
            assert_eq!(bits_to_value::<i8>(bits), -7);
        }
    }

    #[test]
    fn skip_words_rounds_up() {
        assert_eq!(skip_words(0), 0);
        assert_eq!(skip_words(1), 1);
        assert_eq!(skip_words(8), 1);
        assert_eq!(skip_words(9), 2);
    }

    #[test]
    fn sentinel_is_stable_and_nonzero() {
        assert_ne!(sentinel_bits(), 0);
        assert_eq!(sentinel_bits(), sentinel_bits());
    }
}
