//! Tree rendering and invariant validation.
//!
//! Both walks stabilize the tree by holding the writer lock, so they
//! are safe to call while readers and writers are active; they exist
//! for tests and debugging sessions, not for production paths.

use crate::key::TrieKey;
use crate::node::{can_embed, header_version, NodePtr, NodeView};
use crate::trie::Trie;

fn byte_repr(c: u8) -> String {
    if (32..127).contains(&c) {
        format!("'{}'", c as char)
    } else {
        format!("0x{c:02x}")
    }
}

fn bytes_repr(s: &[u8]) -> String {
    s.iter()
        .map(|&c| {
            if (32..127).contains(&c) {
                (c as char).to_string()
            } else {
                format!("\\x{c:02x}")
            }
        })
        .collect()
}

fn flags_repr(view: NodeView) -> String {
    let mut parts = Vec::new();
    if view.is_leaf() {
        parts.push("LEAF");
    }
    if view.has_skip() {
        parts.push("SKIP");
    }
    if view.has_list() {
        parts.push("LIST");
    }
    if view.has_pop() {
        parts.push("POP");
    }
    if view.has_full() {
        parts.push("FULL");
    }
    if parts.is_empty() {
        parts.push("EMPTY");
    }
    parts.join("|")
}

unsafe fn render_node(node: NodePtr, out: &mut String, indent: usize, prefix: &str) {
    let view = NodeView::new(node);
    let pad = "  ".repeat(indent);
    out.push_str(&format!(
        "{pad}{prefix}[{} ver={} slots={}]",
        flags_repr(view),
        header_version(node.header()),
        node.slots(),
    ));
    if view.has_skip() {
        out.push_str(&format!(" skip=\"{}\"", bytes_repr(view.skip_bytes())));
    }
    if !view.is_leaf() {
        if view.load_eos(view.pre_eos_slot()) != 0 {
            out.push_str(" +eos");
        }
        if view.has_skip() && view.load_eos(view.post_eos_slot()) != 0 {
            out.push_str(" +skip_eos");
        }
    } else if view.is_terminal_leaf() {
        out.push_str(" =value");
    }
    out.push('\n');

    if view.is_terminal_leaf() {
        return;
    }
    if view.is_leaf() {
        let pairs = crate::builder::collect_leaf_pairs(view);
        out.push_str(&format!("{pad}  {} embedded value(s):", pairs.len()));
        for (c, _) in pairs {
            out.push_str(&format!(" {}", byte_repr(c)));
        }
        out.push('\n');
        return;
    }
    for (c, bits) in crate::builder::collect_child_pairs(view) {
        let child_prefix = format!("{} -> ", byte_repr(c));
        match NodePtr::from_bits(bits) {
            Some(child) => render_node(child, out, indent + 1, &child_prefix),
            None => out.push_str(&format!("{pad}  {child_prefix}(null)\n")),
        }
    }
}

/// Renders the tree structure as an indented listing.
pub fn dump_tree<K: TrieKey, V>(trie: &Trie<K, V>) -> String {
    let _stable = trie.lock_writes();
    let mut out = String::new();
    match NodePtr::from_bits(trie.root_bits()) {
        Some(root) => unsafe { render_node(root, &mut out, 0, "") },
        None => out.push_str("(empty)\n"),
    }
    out
}

unsafe fn validate_node<V>(node: NodePtr, reachable_by_parent: bool) -> Result<(), String> {
    let view = NodeView::new(node);

    if view.has_list() && view.has_full() {
        return Err("LIST and FULL both set".into());
    }
    if view.has_pop() && view.has_full() {
        return Err("POP and FULL both set".into());
    }
    if view.has_list() && view.has_pop() && !view.is_leaf() {
        return Err("LIST and POP both set outside the terminal leaf".into());
    }
    if view.has_skip() && view.skip_len() == 0 {
        return Err("SKIP with zero length".into());
    }
    if view.leaf_has_entries() && !can_embed::<V>() {
        return Err("embedded leaf entries for a non-embeddable value type".into());
    }

    if view.is_terminal_leaf() {
        let slot = if view.has_skip() {
            view.post_eos_slot()
        } else {
            view.pre_eos_slot()
        };
        if view.load_eos(slot) == 0 {
            return Err("terminal leaf without a value".into());
        }
        return Ok(());
    }

    if view.is_leaf() {
        if view.has_list() {
            let lst = view.list();
            for i in 1..lst.count() {
                if lst.char_at(i - 1) >= lst.char_at(i) {
                    return Err("leaf list not strictly sorted".into());
                }
            }
        }
        if view.child_count() == 0 {
            return Err("multi-entry leaf with no entries".into());
        }
        return Ok(());
    }

    // Interior.
    let pre = view.load_eos(view.pre_eos_slot());
    let post = if view.has_skip() {
        view.load_eos(view.post_eos_slot())
    } else {
        0
    };
    let pairs = crate::builder::collect_child_pairs(view);
    if reachable_by_parent && pairs.is_empty() && pre == 0 && post == 0 {
        return Err("reachable interior node with no children and no EOS".into());
    }
    if view.has_list() {
        let lst = view.list();
        for i in 1..lst.count() {
            if lst.char_at(i - 1) >= lst.char_at(i) {
                return Err("interior list not strictly sorted".into());
            }
        }
        for i in 0..lst.count() {
            if view.child_slot_bits(i) == 0 {
                return Err("null child in interior LIST".into());
            }
        }
    }
    if view.has_pop() {
        for i in 0..view.bitmap().count() {
            if view.child_slot_bits(i) == 0 {
                return Err("null child in interior POP".into());
            }
        }
    }
    for (_, bits) in pairs {
        if let Some(child) = NodePtr::from_bits(bits) {
            validate_node::<V>(child, true)?;
        }
    }
    Ok(())
}

/// Walks the whole tree checking the structural invariants: legal flag
/// combinations, non-zero skips, sorted lists, dense non-null children
/// and no unreachable empty interiors.
pub fn validate<K: TrieKey, V>(trie: &Trie<K, V>) -> Result<(), String> {
    let _stable = trie.lock_writes();
    match NodePtr::from_bits(trie.root_bits()) {
        Some(root) => unsafe { validate_node::<V>(root, false) },
        None => Ok(()),
    }
}
