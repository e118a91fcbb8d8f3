//! Binary wire format.
//!
//! A tree packs as a `u32` (LE) child count followed by each child's
//! NUL-terminated key and recursively packed sub-tree, children in
//! canonical order. Keys therefore must not contain NUL bytes, which the
//! key vocabulary never does.

use crate::{KvTree, KvTreeError};

impl KvTree {
    /// Packs the tree into a fresh byte buffer.
    #[must_use]
    pub fn pack(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.pack_size());
        self.pack_into(&mut buf);
        buf
    }

    /// Number of bytes [`KvTree::pack`] will produce.
    #[must_use]
    pub fn pack_size(&self) -> usize {
        4 + self
            .iter()
            .map(|(key, sub)| key.len() + 1 + sub.pack_size())
            .sum::<usize>()
    }

    fn pack_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&(self.len() as u32).to_le_bytes());
        for (key, sub) in self.iter() {
            buf.extend_from_slice(key.as_bytes());
            buf.push(0);
            sub.pack_into(buf);
        }
    }

    /// Unpacks a tree from `buf`, requiring the buffer to be consumed
    /// exactly.
    pub fn unpack(buf: &[u8]) -> Result<Self, KvTreeError> {
        let (tree, used) = Self::unpack_prefix(buf)?;
        if used != buf.len() {
            return Err(KvTreeError::corrupt(format!(
                "packed tree: {} trailing bytes",
                buf.len() - used
            )));
        }
        Ok(tree)
    }

    /// Unpacks a tree from the front of `buf`, returning the tree and the
    /// number of bytes consumed.
    pub fn unpack_prefix(buf: &[u8]) -> Result<(Self, usize), KvTreeError> {
        let mut offset = 0;
        let tree = unpack_at(buf, &mut offset)?;
        Ok((tree, offset))
    }
}

fn unpack_at(buf: &[u8], offset: &mut usize) -> Result<KvTree, KvTreeError> {
    let count_bytes: [u8; 4] = buf
        .get(*offset..*offset + 4)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| KvTreeError::corrupt("packed tree: truncated child count"))?;
    *offset += 4;
    let count = u32::from_le_bytes(count_bytes) as usize;

    let mut tree = KvTree::new();
    for _ in 0..count {
        let rest = &buf[*offset..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| KvTreeError::corrupt("packed tree: unterminated key"))?;
        let key = std::str::from_utf8(&rest[..nul])
            .map_err(|_| KvTreeError::corrupt("packed tree: non-UTF-8 key"))?
            .to_owned();
        *offset += nul + 1;
        let sub = unpack_at(buf, offset)?;
        tree.set(key, sub);
    }
    Ok(tree)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_tree(depth: u32) -> impl Strategy<Value = KvTree> {
        let key = "[A-Z][A-Z0-9_]{0,8}";
        let leaf = Just(KvTree::new());
        leaf.prop_recursive(depth, 24, 4, move |inner| {
            proptest::collection::btree_map(key.prop_map(String::from), inner, 0..4).prop_map(
                |children| {
                    let mut tree = KvTree::new();
                    for (k, v) in children {
                        tree.set(k, v);
                    }
                    tree
                },
            )
        })
    }

    proptest! {
        #[test]
        fn pack_unpack_is_identity(tree in arb_tree(3)) {
            let packed = tree.pack();
            prop_assert_eq!(packed.len(), tree.pack_size());
            let back = KvTree::unpack(&packed).unwrap();
            prop_assert_eq!(back, tree);
        }
    }

    #[test]
    fn truncated_buffer_is_corrupt() {
        let mut tree = KvTree::new();
        tree.set_str("RANK", "3");
        let packed = tree.pack();
        assert!(KvTree::unpack(&packed[..packed.len() - 2]).is_err());
    }

    #[test]
    fn trailing_bytes_are_corrupt() {
        let mut packed = KvTree::new().pack();
        packed.push(7);
        assert!(KvTree::unpack(&packed).is_err());
    }
}
