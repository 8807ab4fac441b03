//! On-disk node record encoding: the bytes stored at a [`ChunkOffset`] by
//! the Node Writer and decoded by the Node Cache on every traversal.
//!
//! A node carries a compressed nibble path (the shared prefix since its
//! parent's branch point), up to sixteen children, and an optional value.
//! This collapses the classic leaf/extension/branch trio into one shape —
//! a node with no children and a value is a leaf, a node with children and
//! no value is a pure branch, and a node with both is a branch whose key
//! also terminates there. Each record also carries the keccak256 Merkle
//! commitment of its subtree, computed bottom-up at write time, so
//! `root_hash()` never has to touch storage.

use alloy_primitives::{keccak256, B256};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read as _, Write as _};

use crate::chunk::{ChunkOffset, INVALID_OFFSET};
use crate::error::MptError;
use crate::nibbles::Nibbles;

/// Inline values up to this many bytes live directly in the node record;
/// larger values are written as a side record and referenced by offset,
/// keeping branch nodes small and cache-friendly.
pub const INLINE_VALUE_THRESHOLD: usize = 32;

/// A value stored at a node: either inlined or indirected through its own
/// chunk offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredValue {
    /// Small values embedded directly in the node record.
    Inline(Vec<u8>),
    /// Values over [`INLINE_VALUE_THRESHOLD`], stored as a standalone
    /// record and referenced by offset.
    Indirect(ChunkOffset),
}

/// A single trie node as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// Version this node was written at.
    pub version: u64,
    /// Nibble path shared by this node and its children, relative to its
    /// parent's branch point.
    pub path: Nibbles,
    /// Up to 16 children, indexed by the next nibble after `path`.
    /// `INVALID_OFFSET` means no child at that index.
    pub children: [ChunkOffset; 16],
    /// Value terminating at this node, if the key path ends here.
    pub value: Option<StoredValue>,
    /// keccak256 Merkle commitment of this node and its subtree.
    pub hash: B256,
}

impl Node {
    /// Whether this node has no children (a pure leaf).
    pub fn is_leaf(&self) -> bool {
        self.children.iter().all(ChunkOffset::is_invalid)
    }

    /// Count of non-empty children.
    pub fn child_count(&self) -> usize {
        self.children.iter().filter(|c| !c.is_invalid()).count()
    }

    /// Recompute [`Node::hash`] from this node's own content plus the
    /// supplied child hashes (must be in index order, `None` for absent
    /// children). This is the Merkle commitment, independent of the
    /// storage-addressing [`ChunkOffset`]s in `children`.
    pub fn compute_hash(&mut self, child_hashes: &[Option<B256>; 16]) {
        let mut buf = Vec::with_capacity(64 + self.path.nibble_size());
        buf.push(if self.is_leaf() { 0u8 } else { 1u8 });
        buf.extend_from_slice(&(self.path.nibble_size() as u32).to_le_bytes());
        for i in 0..self.path.nibble_size() {
            buf.push(self.path.get(i));
        }
        match &self.value {
            Some(StoredValue::Inline(bytes)) => {
                buf.push(1);
                buf.extend_from_slice(bytes);
            }
            Some(StoredValue::Indirect(_)) => {
                buf.push(1);
                // The indirected bytes are hashed by the caller before
                // this is invoked and folded into `value`'s inline
                // representation for hashing purposes; nothing further
                // to add here beyond the discriminant.
            }
            None => buf.push(0),
        }
        for h in child_hashes {
            match h {
                Some(h) => buf.extend_from_slice(h.as_slice()),
                None => buf.extend_from_slice(&[0u8; 32]),
            }
        }
        self.hash = keccak256(&buf);
    }
}

fn write_value<W: Write>(w: &mut W, value: &Option<StoredValue>) -> std::io::Result<()> {
    match value {
        None => w.write_u8(0),
        Some(StoredValue::Inline(bytes)) => {
            w.write_u8(1)?;
            w.write_u32::<LittleEndian>(bytes.len() as u32)?;
            w.write_all(bytes)
        }
        Some(StoredValue::Indirect(offset)) => {
            w.write_u8(2)?;
            w.write_all(&offset.to_bytes())
        }
    }
}

fn read_value<R: Read>(r: &mut R) -> Result<Option<StoredValue>, MptError> {
    match r.read_u8().map_err(crate::error::IoError::Io)? {
        0 => Ok(None),
        1 => {
            let len = r.read_u32::<LittleEndian>().map_err(crate::error::IoError::Io)? as usize;
            let mut bytes = vec![0u8; len];
            r.read_exact(&mut bytes).map_err(crate::error::IoError::Io)?;
            Ok(Some(StoredValue::Inline(bytes)))
        }
        2 => {
            let mut raw = [0u8; 8];
            r.read_exact(&mut raw).map_err(crate::error::IoError::Io)?;
            Ok(Some(StoredValue::Indirect(ChunkOffset::from_bytes(raw))))
        }
        tag => Err(MptError::CorruptRecord(tag)),
    }
}

/// Serialize a node to its on-disk byte record.
pub fn encode_node(node: &Node) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::with_capacity(128));
    buf.write_u64::<LittleEndian>(node.version).unwrap();
    buf.write_u8(node.path.nibble_size() as u8).unwrap();
    for i in 0..node.path.nibble_size() {
        buf.write_u8(node.path.get(i)).unwrap();
    }
    let mut present: u16 = 0;
    for (i, c) in node.children.iter().enumerate() {
        if !c.is_invalid() {
            present |= 1 << i;
        }
    }
    buf.write_u16::<LittleEndian>(present).unwrap();
    for c in &node.children {
        if !c.is_invalid() {
            buf.write_all(&c.to_bytes()).unwrap();
        }
    }
    write_value(&mut buf, &node.value).unwrap();
    buf.write_all(node.hash.as_slice()).unwrap();
    buf.into_inner()
}

/// Parse a node from its on-disk byte record.
pub fn decode_node(bytes: &[u8]) -> Result<Node, MptError> {
    let mut cur = Cursor::new(bytes);
    let version = cur.read_u64::<LittleEndian>().map_err(crate::error::IoError::Io)?;
    let path_len = cur.read_u8().map_err(crate::error::IoError::Io)? as usize;
    let mut path_nibbles = Vec::with_capacity(path_len);
    for _ in 0..path_len {
        path_nibbles.push(cur.read_u8().map_err(crate::error::IoError::Io)?);
    }
    let path = nibbles_from_values(&path_nibbles)?;
    let present = cur.read_u16::<LittleEndian>().map_err(crate::error::IoError::Io)?;
    let mut children = [INVALID_OFFSET; 16];
    for i in 0..16 {
        if present & (1 << i) != 0 {
            let mut raw = [0u8; 8];
            cur.read_exact(&mut raw).map_err(crate::error::IoError::Io)?;
            children[i] = ChunkOffset::from_bytes(raw);
        }
    }
    let value = read_value(&mut cur)?;
    let mut hash_bytes = [0u8; 32];
    cur.read_exact(&mut hash_bytes).map_err(crate::error::IoError::Io)?;
    Ok(Node { version, path, children, value, hash: B256::from(hash_bytes) })
}

fn nibbles_from_values(values: &[u8]) -> Result<Nibbles, MptError> {
    let mut n = Nibbles::with_capacity(values.len())?;
    for (i, &v) in values.iter().enumerate() {
        n.set_at(i, v);
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_node(path_bytes: &[u8], value: &[u8]) -> Node {
        let path = Nibbles::from_bytes(path_bytes).unwrap();
        let mut node = Node {
            version: 7,
            path,
            children: [INVALID_OFFSET; 16],
            value: Some(StoredValue::Inline(value.to_vec())),
            hash: B256::ZERO,
        };
        node.compute_hash(&[None; 16]);
        node
    }

    #[test]
    fn encode_decode_round_trip() {
        let node = sample_node(&[0xAB], b"value");
        let bytes = encode_node(&node);
        let decoded = decode_node(&bytes).unwrap();
        assert_eq!(decoded, node);
    }

    #[test]
    fn leaf_detection() {
        let node = sample_node(&[0x12], b"x");
        assert!(node.is_leaf());
        assert_eq!(node.child_count(), 0);
    }
}
