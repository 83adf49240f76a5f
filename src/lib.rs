//! An ordered, byte-keyed map shaped as an adaptive radix trie.
//!
//! Keys are encoded to byte strings whose lexicographic order equals key
//! order (strings map identically, integers through a big-endian /
//! sign-flip encoding), and the tree adapts its branch points to their
//! fan-out: up to seven children live in a packed sorted byte list, wider
//! nodes use a 256-bit popcount-indexed bitmap, and the widest use 256
//! direct-indexed slots. Runs of single-child nodes are compressed into
//! per-node skip strings, and values that fit in 64 bits are embedded
//! directly in leaf slots.
//!
//! The container is concurrent: any number of readers proceed without
//! locks against a single writer at a time. Writers speculate — probe
//! lock-free, pre-allocate poisoned replacement nodes, validate recorded
//! node versions under the writer mutex, then commit — and readers
//! tolerate the race by restarting when they observe a poisoned node, a
//! retry sentinel or a mid-mutation version. Displaced nodes are freed
//! through epoch-based reclamation once every reader that could hold
//! them has moved on.
//!
//! ```
//! use bytetrie::Trie;
//!
//! let trie: Trie<String, u32> = Trie::new();
//! trie.insert(&"apple".to_string(), 1);
//! trie.insert(&"app".to_string(), 2);
//! assert_eq!(trie.get(&"app".to_string()), Some(2));
//! assert!(trie.erase(&"apple".to_string()));
//! assert_eq!(trie.len(), 1);
//! ```

#[cfg(not(target_pointer_width = "64"))]
compile_error!("bytetrie packs node state into 64-bit slots and requires a 64-bit target");

mod bitmap;
mod builder;
mod ebr;
mod erase;
mod insert;
mod iter;
mod key;
mod list;
mod nav;
mod node;
mod trie;

pub mod debug;

pub use iter::Iter;
pub use key::TrieKey;
pub use trie::{DebugCounters, Trie};

#[doc(hidden)]
pub use ebr::retired_len as debug_retired_count;
