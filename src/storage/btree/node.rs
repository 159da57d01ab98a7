//! In-memory form of tree pages and their on-disk encoding.
//!
//! Leaf payload, after the common page header, is a packed run of entries:
//!
//! ```text
//! flags:u8 | key_len:u16 | value_len:u32 | key | value-or-overflow-head:u64
//! ```
//!
//! Branch payload is a packed run of `key_len:u16 | child:u64 | key`. The
//! first branch entry always has an empty key.

use std::sync::Arc;

use crate::types::{
    page::{self, read_u16, read_u32, read_u64, PageHeader, PageKind, PAGE_HDR_LEN},
    ArborError, PageId, Result,
};

const FLAG_OVERFLOW: u8 = 0x01;
const LEAF_ENTRY_HDR: usize = 7;
const BRANCH_ENTRY_HDR: usize = 10;
const OVERFLOW_NEXT: usize = PAGE_HDR_LEN;
const OVERFLOW_DATA: usize = PAGE_HDR_LEN + 8;

/// Stored form of a leaf value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LeafValue {
    /// Value bytes stored in the leaf itself.
    Inline(Vec<u8>),
    /// Value stored in a chain of overflow pages.
    Overflow {
        /// First page of the chain.
        head: PageId,
        /// Total value length in bytes.
        len: u32,
    },
}

impl LeafValue {
    fn stored_len(&self) -> usize {
        match self {
            LeafValue::Inline(bytes) => bytes.len(),
            LeafValue::Overflow { .. } => 8,
        }
    }
}

/// Key/value pair held by a leaf.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeafEntry {
    /// Key bytes.
    pub key: Vec<u8>,
    /// Value, inline or in overflow pages.
    pub value: LeafValue,
}

impl LeafEntry {
    /// Encoded size of this entry in bytes.
    pub fn encoded_len(&self) -> usize {
        LEAF_ENTRY_HDR + self.key.len() + self.value.stored_len()
    }
}

/// Separator key and child pointer held by a branch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BranchEntry {
    /// Smallest key reachable through `child` (empty for the first entry).
    pub key: Vec<u8>,
    /// Child page id.
    pub child: PageId,
}

impl BranchEntry {
    /// Encoded size of this entry in bytes.
    pub fn encoded_len(&self) -> usize {
        BRANCH_ENTRY_HDR + self.key.len()
    }
}

/// Decoded tree page.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Node {
    /// Sorted key/value pairs.
    Leaf(Vec<LeafEntry>),
    /// Sorted separators with child pointers.
    Branch(Vec<BranchEntry>),
}

impl Node {
    /// Number of entries in the node.
    pub fn len(&self) -> usize {
        match self {
            Node::Leaf(entries) => entries.len(),
            Node::Branch(entries) => entries.len(),
        }
    }

    /// Returns true when the node holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true for leaves.
    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf(_))
    }

    /// Payload bytes the node needs, header excluded.
    pub fn encoded_len(&self) -> usize {
        match self {
            Node::Leaf(entries) => entries.iter().map(LeafEntry::encoded_len).sum(),
            Node::Branch(entries) => entries.iter().map(BranchEntry::encoded_len).sum(),
        }
    }

    /// Encodes the node as the sealed image of page `id`.
    pub fn encode(&self, id: PageId, page_size: usize, salt: u64) -> Result<Vec<u8>> {
        let used = self.encoded_len();
        if PAGE_HDR_LEN + used > page_size {
            return Err(ArborError::Invalid("node does not fit in a page"));
        }
        let mut buf = vec![0u8; page_size];
        let kind = if self.is_leaf() {
            PageKind::Leaf
        } else {
            PageKind::Branch
        };
        let count = u16::try_from(self.len()).map_err(|_| ArborError::Invalid("too many entries"))?;
        PageHeader::new(id, kind, page_size as u32)?
            .with_layout(count, (PAGE_HDR_LEN + used) as u16)
            .encode(&mut buf)?;
        let mut off = PAGE_HDR_LEN;
        match self {
            Node::Leaf(entries) => {
                for entry in entries {
                    let (flags, vlen) = match &entry.value {
                        LeafValue::Inline(bytes) => (0u8, bytes.len() as u32),
                        LeafValue::Overflow { len, .. } => (FLAG_OVERFLOW, *len),
                    };
                    buf[off] = flags;
                    buf[off + 1..off + 3].copy_from_slice(&(entry.key.len() as u16).to_be_bytes());
                    buf[off + 3..off + 7].copy_from_slice(&vlen.to_be_bytes());
                    off += LEAF_ENTRY_HDR;
                    buf[off..off + entry.key.len()].copy_from_slice(&entry.key);
                    off += entry.key.len();
                    match &entry.value {
                        LeafValue::Inline(bytes) => {
                            buf[off..off + bytes.len()].copy_from_slice(bytes);
                            off += bytes.len();
                        }
                        LeafValue::Overflow { head, .. } => {
                            buf[off..off + 8].copy_from_slice(&head.0.to_be_bytes());
                            off += 8;
                        }
                    }
                }
            }
            Node::Branch(entries) => {
                for entry in entries {
                    buf[off..off + 2].copy_from_slice(&(entry.key.len() as u16).to_be_bytes());
                    buf[off + 2..off + 10].copy_from_slice(&entry.child.0.to_be_bytes());
                    off += BRANCH_ENTRY_HDR;
                    buf[off..off + entry.key.len()].copy_from_slice(&entry.key);
                    off += entry.key.len();
                }
            }
        }
        page::seal(&mut buf, id, salt)?;
        Ok(buf)
    }

    /// Decodes a verified tree page image.
    pub fn decode(buf: &[u8]) -> Result<Node> {
        let header = PageHeader::decode(buf)?;
        let end = header.free_offset as usize;
        if end > buf.len() {
            return Err(ArborError::Corruption("node free offset beyond page"));
        }
        let count = header.entry_count as usize;
        let mut off = PAGE_HDR_LEN;
        match header.kind {
            PageKind::Leaf => {
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    if off + LEAF_ENTRY_HDR > end {
                        return Err(ArborError::Corruption("leaf entry truncated"));
                    }
                    let flags = buf[off];
                    let klen = read_u16(buf, off + 1) as usize;
                    let vlen = read_u32(buf, off + 3);
                    off += LEAF_ENTRY_HDR;
                    let stored = if flags & FLAG_OVERFLOW != 0 { 8 } else { vlen as usize };
                    if off + klen + stored > end {
                        return Err(ArborError::Corruption("leaf entry truncated"));
                    }
                    let key = buf[off..off + klen].to_vec();
                    off += klen;
                    let value = match flags {
                        0 => LeafValue::Inline(buf[off..off + stored].to_vec()),
                        FLAG_OVERFLOW => LeafValue::Overflow {
                            head: PageId(read_u64(buf, off)),
                            len: vlen,
                        },
                        _ => return Err(ArborError::Corruption("unknown leaf entry flags")),
                    };
                    off += stored;
                    entries.push(LeafEntry { key, value });
                }
                Ok(Node::Leaf(entries))
            }
            PageKind::Branch => {
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    if off + BRANCH_ENTRY_HDR > end {
                        return Err(ArborError::Corruption("branch entry truncated"));
                    }
                    let klen = read_u16(buf, off) as usize;
                    let child = PageId(read_u64(buf, off + 2));
                    off += BRANCH_ENTRY_HDR;
                    if off + klen > end {
                        return Err(ArborError::Corruption("branch entry truncated"));
                    }
                    entries.push(BranchEntry {
                        key: buf[off..off + klen].to_vec(),
                        child,
                    });
                    off += klen;
                }
                if entries.is_empty() || !entries[0].key.is_empty() {
                    return Err(ArborError::Corruption("malformed branch node"));
                }
                Ok(Node::Branch(entries))
            }
            _ => Err(ArborError::Corruption("page is not a tree node")),
        }
    }
}

/// Size limits derived from the page size.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct NodeLimits {
    /// Payload bytes available in a page.
    pub capacity: usize,
    /// Largest single entry; a quarter of the payload so splits always fit.
    pub max_entry: usize,
}

impl NodeLimits {
    /// Limits for pages of `page_size` bytes.
    pub fn new(page_size: usize) -> Self {
        let capacity = page_size - PAGE_HDR_LEN;
        Self {
            capacity,
            max_entry: capacity / 4,
        }
    }

    /// Longest key accepted by the tree.
    pub fn max_key_len(&self) -> usize {
        self.max_entry - LEAF_ENTRY_HDR - 8
    }

    /// Returns true when a value of `value_len` bytes stays in the leaf.
    pub fn fits_inline(&self, key_len: usize, value_len: usize) -> bool {
        LEAF_ENTRY_HDR + key_len + value_len <= self.max_entry
    }

    /// Returns true when `node` needs splitting.
    pub fn overflows(&self, node: &Node) -> bool {
        node.encoded_len() > self.capacity
    }

    /// Value bytes carried by one overflow page.
    pub fn overflow_chunk(&self) -> usize {
        self.capacity - 8
    }
}

/// Splits an over-full node roughly in half by encoded bytes.
///
/// Returns the left half, the right half, and the separator to insert into
/// the parent. For leaves the separator is a copy of the right half's first
/// key; for branches it is moved out of the right half's first entry.
pub fn split(node: Node) -> (Node, Node, Vec<u8>) {
    match node {
        Node::Leaf(mut entries) => {
            let at = split_index(entries.iter().map(LeafEntry::encoded_len));
            let right = entries.split_off(at);
            let sep = right[0].key.clone();
            (Node::Leaf(entries), Node::Leaf(right), sep)
        }
        Node::Branch(mut entries) => {
            let at = split_index(entries.iter().map(BranchEntry::encoded_len));
            let mut right = entries.split_off(at);
            let sep = std::mem::take(&mut right[0].key);
            (Node::Branch(entries), Node::Branch(right), sep)
        }
    }
}

fn split_index(sizes: impl Iterator<Item = usize> + Clone) -> usize {
    let total: usize = sizes.clone().sum();
    let count = sizes.clone().count();
    let mut prefix = 0;
    for (idx, size) in sizes.enumerate() {
        prefix += size;
        if prefix * 2 >= total {
            return (idx + 1).clamp(1, count - 1);
        }
    }
    count / 2
}

/// Builds the sealed overflow pages for `value` on the given page ids.
pub fn encode_overflow(
    value: &[u8],
    ids: &[PageId],
    page_size: usize,
    salt: u64,
) -> Result<Vec<(PageId, Arc<[u8]>)>> {
    let chunk = NodeLimits::new(page_size).overflow_chunk();
    if ids.len() != value.len().div_ceil(chunk) {
        return Err(ArborError::Invalid("overflow page count mismatch"));
    }
    let mut out = Vec::with_capacity(ids.len());
    for (idx, (id, part)) in ids.iter().zip(value.chunks(chunk)).enumerate() {
        let next = ids.get(idx + 1).copied().unwrap_or(PageId::NONE);
        let mut buf = vec![0u8; page_size];
        PageHeader::new(*id, PageKind::Overflow, page_size as u32)?
            .with_layout(0, (OVERFLOW_DATA + part.len()) as u16)
            .encode(&mut buf)?;
        buf[OVERFLOW_NEXT..OVERFLOW_NEXT + 8].copy_from_slice(&next.0.to_be_bytes());
        buf[OVERFLOW_DATA..OVERFLOW_DATA + part.len()].copy_from_slice(part);
        page::seal(&mut buf, *id, salt)?;
        out.push((*id, Arc::from(buf)));
    }
    Ok(out)
}

/// Splits an overflow page image into its data bytes and the next page id.
pub fn decode_overflow(buf: &[u8]) -> Result<(&[u8], PageId)> {
    let header = PageHeader::decode(buf)?;
    if header.kind != PageKind::Overflow {
        return Err(ArborError::Corruption("expected overflow page"));
    }
    let end = header.free_offset as usize;
    if end < OVERFLOW_DATA || end > buf.len() {
        return Err(ArborError::Corruption("overflow page length out of range"));
    }
    Ok((&buf[OVERFLOW_DATA..end], PageId(read_u64(buf, OVERFLOW_NEXT))))
}
