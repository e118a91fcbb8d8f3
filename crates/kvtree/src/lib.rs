#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `kvtree` is the tree-store every persisted or exchanged SCR data
//! structure is built on: a recursive ordered mapping from string keys to
//! sub-trees. A "value" is simply a key at the next level, so
//! `tree.set_str("SIZE", "1024")` produces `SIZE → 1024 → {}` and reading
//! it back walks one level down. This shape packs, merges, and diffs
//! uniformly no matter what the tree means.
//!
//! The crate adds three capabilities on top of the container itself:
//!
//! - a byte-exact [pack/unpack](KvTree::pack) wire format,
//! - file persistence, either atomic-replace ([`KvTree::write_file`]) or
//!   read-modify-write under an advisory lock ([`file::lock_open_read`]),
//! - exchange over a [`group::Communicator`]: send/recv, broadcast,
//!   sendrecv, and a Bruck-style sparse all-to-all ([`exchange::exchange`]).
//!
//! # Invariants
//!
//! - `unpack(pack(t)) == t` for every tree.
//! - `read_file(write_file(t)) == t`; writes are atomic under rename.
//! - Iteration order is the canonical (lexicographic) key order, so two
//!   equal trees pack to identical bytes.

use std::collections::BTreeMap;
use std::fmt;

mod error;
pub mod exchange;
pub mod file;
mod pack;

pub use error::KvTreeError;

/// A recursive ordered mapping from string keys to sub-trees.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KvTree {
    children: BTreeMap<String, KvTree>,
}

impl KvTree {
    /// Creates an empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys at this level.
    #[must_use]
    pub fn len(&self) -> usize {
        self.children.len()
    }

    /// True when this level holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Returns the sub-tree under `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&KvTree> {
        self.children.get(key)
    }

    /// Returns the sub-tree under `key` mutably.
    pub fn get_mut(&mut self, key: &str) -> Option<&mut KvTree> {
        self.children.get_mut(key)
    }

    /// Inserts (or replaces) `subtree` under `key` and returns it.
    pub fn set(&mut self, key: impl Into<String>, subtree: KvTree) -> &mut KvTree {
        let key = key.into();
        self.children.insert(key.clone(), subtree);
        self.children.get_mut(&key).expect("freshly inserted key")
    }

    /// Returns the sub-tree under `key`, creating an empty one if missing.
    pub fn ensure(&mut self, key: impl Into<String>) -> &mut KvTree {
        self.children.entry(key.into()).or_default()
    }

    /// Removes `key`, returning its sub-tree.
    pub fn unset(&mut self, key: &str) -> Option<KvTree> {
        self.children.remove(key)
    }

    /// Removes every key.
    pub fn clear(&mut self) {
        self.children.clear();
    }

    /// Integer-keyed [`KvTree::get`].
    #[must_use]
    pub fn get_int(&self, key: i64) -> Option<&KvTree> {
        self.get(&key.to_string())
    }

    /// Integer-keyed [`KvTree::ensure`].
    pub fn ensure_int(&mut self, key: i64) -> &mut KvTree {
        self.ensure(key.to_string())
    }

    /// Integer-keyed [`KvTree::unset`].
    pub fn unset_int(&mut self, key: i64) -> Option<KvTree> {
        self.unset(&key.to_string())
    }

    /// Sets the key/value pair `key → val` and returns the tree under `val`.
    pub fn set_kv(&mut self, key: impl Into<String>, val: impl Into<String>) -> &mut KvTree {
        self.ensure(key).ensure(val)
    }

    /// Returns the tree under the pair `key → val`.
    #[must_use]
    pub fn get_kv(&self, key: &str, val: &str) -> Option<&KvTree> {
        self.get(key)?.get(val)
    }

    /// Removes `val` under `key`; removes `key` too once empty.
    pub fn unset_kv(&mut self, key: &str, val: &str) {
        if let Some(sub) = self.get_mut(key) {
            sub.unset(val);
            if sub.is_empty() {
                self.unset(key);
            }
        }
    }

    /// First value (child key) under `key`.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key)?.keys().next()
    }

    /// Replaces whatever is under `key` with the single value `val`.
    pub fn set_str(&mut self, key: impl Into<String>, val: impl Into<String>) {
        let key = key.into();
        self.unset(&key);
        self.set_kv(key, val);
    }

    /// Value under `key` parsed as `u64`.
    #[must_use]
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get_str(key)?.parse().ok()
    }

    /// Value under `key` parsed as `i64`.
    #[must_use]
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get_str(key)?.parse().ok()
    }

    /// Value under `key` parsed as `f64`.
    #[must_use]
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get_str(key)?.parse().ok()
    }

    /// Sets `key` to the decimal rendering of `val`.
    pub fn set_u64(&mut self, key: impl Into<String>, val: u64) {
        self.set_str(key, val.to_string());
    }

    /// Sets `key` to the decimal rendering of `val`.
    pub fn set_i64(&mut self, key: impl Into<String>, val: i64) {
        self.set_str(key, val.to_string());
    }

    /// Iterates over `(key, subtree)` pairs in canonical order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &KvTree)> {
        self.children.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Iterates over keys in canonical order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.children.keys().map(String::as_str)
    }

    /// Keys parsed as integers, ascending; non-numeric keys are skipped.
    #[must_use]
    pub fn int_keys(&self) -> Vec<i64> {
        let mut keys: Vec<i64> = self.keys().filter_map(|k| k.parse().ok()).collect();
        keys.sort_unstable();
        keys
    }

    /// Merges `other` into `self`; on key collisions the merge recurses,
    /// so incoming leaves win.
    pub fn merge(&mut self, other: KvTree) {
        for (key, sub) in other.children {
            match self.children.get_mut(&key) {
                Some(existing) => existing.merge(sub),
                None => {
                    self.children.insert(key, sub);
                }
            }
        }
    }
}

impl fmt::Display for KvTree {
    /// Pretty-prints the tree with two-space indentation per level.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn render(tree: &KvTree, depth: usize, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            for (key, sub) in tree.iter() {
                writeln!(f, "{:indent$}{key}", "", indent = depth * 2)?;
                render(sub, depth + 1, f)?;
            }
            Ok(())
        }
        render(self, 0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kv_shortcuts_round_trip() {
        let mut tree = KvTree::new();
        tree.set_str("NAME", "ckpt.1");
        tree.set_u64("SIZE", 4096);
        assert_eq!(tree.get_str("NAME"), Some("ckpt.1"));
        assert_eq!(tree.get_u64("SIZE"), Some(4096));

        tree.set_u64("SIZE", 8192);
        assert_eq!(tree.get_u64("SIZE"), Some(8192));
        assert_eq!(tree.get("SIZE").unwrap().len(), 1);
    }

    #[test]
    fn unset_kv_prunes_empty_parent() {
        let mut tree = KvTree::new();
        tree.set_kv("FLAG", "DONE");
        tree.unset_kv("FLAG", "DONE");
        assert!(tree.get("FLAG").is_none());
    }

    #[test]
    fn merge_prefers_incoming() {
        let mut base = KvTree::new();
        base.set_str("A", "old");
        base.set_kv("NEST", "x");

        let mut incoming = KvTree::new();
        incoming.set_str("A", "new");
        incoming.set_kv("NEST", "y");

        base.merge(incoming);
        // leaf values union; both "old" and "new" are keys under A
        assert!(base.get_kv("A", "old").is_some());
        assert!(base.get_kv("A", "new").is_some());
        assert!(base.get_kv("NEST", "x").is_some());
        assert!(base.get_kv("NEST", "y").is_some());
    }

    #[test]
    fn int_keys_sort_numerically() {
        let mut tree = KvTree::new();
        for id in [10, 2, 1, 30] {
            tree.ensure_int(id);
        }
        assert_eq!(tree.int_keys(), vec![1, 2, 10, 30]);
    }
}
