use std::cmp::Ordering;

use super::node::{self, BranchEntry, LeafEntry, LeafValue, Node, NodeLimits};
use super::{PageSink, PageSource};
use crate::types::{page::PageKind, ArborError, KeyOrder, PageId, Result};

/// Deepest tree accepted before a descent is treated as corruption.
const MAX_DEPTH: usize = 64;

/// How [`put`] treats an existing key.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum WriteMode {
    /// Insert or replace.
    #[default]
    Upsert,
    /// Fail with [`ArborError::KeyExists`] when the key is present.
    NoOverwrite,
}

/// Root pointer and bookkeeping a transaction carries for its tree.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct TreeRoot {
    /// Root page, [`PageId::NONE`] for an empty tree.
    pub root: PageId,
    /// Number of levels, 0 for an empty tree.
    pub depth: u32,
    /// Number of key/value pairs.
    pub entries: u64,
}

pub(crate) fn child_index(entries: &[BranchEntry], key: &[u8], order: KeyOrder) -> usize {
    entries[1..].partition_point(|e| order.compare(&e.key, key) != Ordering::Greater)
}

fn search_leaf(entries: &[LeafEntry], key: &[u8], order: KeyOrder) -> std::result::Result<usize, usize> {
    entries.binary_search_by(|e| order.compare(&e.key, key))
}

fn find<S: PageSource + ?Sized>(src: &S, root: PageId, key: &[u8]) -> Result<Option<LeafValue>> {
    if root.is_none() {
        return Ok(None);
    }
    let order = src.key_order();
    let mut id = root;
    for _ in 0..MAX_DEPTH {
        let node = src.load_node(id)?;
        match &*node {
            Node::Leaf(entries) => {
                return Ok(search_leaf(entries, key, order)
                    .ok()
                    .map(|idx| entries[idx].value.clone()));
            }
            Node::Branch(entries) => id = entries[child_index(entries, key, order)].child,
        }
    }
    Err(ArborError::Corruption("tree deeper than supported"))
}

/// Looks up `key` in the tree rooted at `root`.
pub fn get<S: PageSource + ?Sized>(src: &S, root: PageId, key: &[u8]) -> Result<Option<Vec<u8>>> {
    match find(src, root, key)? {
        Some(value) => read_value(src, &value).map(Some),
        None => Ok(None),
    }
}

/// Materialises a stored value, following its overflow chain if needed.
pub fn read_value<S: PageSource + ?Sized>(src: &S, value: &LeafValue) -> Result<Vec<u8>> {
    match value {
        LeafValue::Inline(bytes) => Ok(bytes.clone()),
        LeafValue::Overflow { head, len } => {
            let len = *len as usize;
            let mut out = Vec::with_capacity(len);
            let mut next = *head;
            while !next.is_none() {
                if out.len() >= len {
                    return Err(ArborError::Corruption("overflow chain longer than value"));
                }
                let buf = src.load_overflow(next)?;
                let (data, following) = node::decode_overflow(&buf)?;
                out.extend_from_slice(data);
                next = following;
            }
            if out.len() != len {
                return Err(ArborError::Corruption("overflow chain length mismatch"));
            }
            Ok(out)
        }
    }
}

/// Page ids of the overflow chain starting at `head`.
pub fn overflow_chain<S: PageSource + ?Sized>(src: &S, head: PageId, len: u32) -> Result<Vec<PageId>> {
    let chunk = NodeLimits::new(src.page_size()).overflow_chunk();
    let expected = (len as usize).div_ceil(chunk);
    let mut ids = Vec::with_capacity(expected);
    let mut next = head;
    while !next.is_none() {
        if ids.len() >= expected {
            return Err(ArborError::Corruption("overflow chain longer than value"));
        }
        ids.push(next);
        let buf = src.load_overflow(next)?;
        next = node::decode_overflow(&buf)?.1;
    }
    Ok(ids)
}

/// Visits every page reachable from `root` in preorder, overflow pages
/// right after the leaf that references them.
pub fn visit_pages<S, F>(src: &S, root: PageId, visit: &mut F) -> Result<()>
where
    S: PageSource + ?Sized,
    F: FnMut(PageId, PageKind) -> Result<()>,
{
    if root.is_none() {
        return Ok(());
    }
    visit_rec(src, root, 0, visit)
}

fn visit_rec<S, F>(src: &S, id: PageId, level: usize, visit: &mut F) -> Result<()>
where
    S: PageSource + ?Sized,
    F: FnMut(PageId, PageKind) -> Result<()>,
{
    if level >= MAX_DEPTH {
        return Err(ArborError::Corruption("tree deeper than supported"));
    }
    let node = src.load_node(id)?;
    match &*node {
        Node::Leaf(entries) => {
            visit(id, PageKind::Leaf)?;
            for entry in entries {
                if let LeafValue::Overflow { head, len } = entry.value {
                    for page in overflow_chain(src, head, len)? {
                        visit(page, PageKind::Overflow)?;
                    }
                }
            }
        }
        Node::Branch(entries) => {
            visit(id, PageKind::Branch)?;
            for entry in entries {
                visit_rec(src, entry.child, level + 1, visit)?;
            }
        }
    }
    Ok(())
}

fn validate_key(key: &[u8], limits: &NodeLimits) -> Result<()> {
    if key.is_empty() {
        return Err(ArborError::Invalid("key must not be empty"));
    }
    if key.len() > limits.max_key_len() {
        return Err(ArborError::Invalid("key exceeds maximum length"));
    }
    Ok(())
}

/// Inserts or replaces `key` in `tree`.
///
/// Every check that can reject the call runs before the first page is
/// touched, so a rejected put leaves the transaction unchanged.
pub fn put<S: PageSink + ?Sized>(
    sink: &mut S,
    tree: &mut TreeRoot,
    key: &[u8],
    value: &[u8],
    mode: WriteMode,
) -> Result<()> {
    let limits = NodeLimits::new(sink.page_size());
    validate_key(key, &limits)?;
    if u32::try_from(value.len()).is_err() {
        return Err(ArborError::Invalid("value exceeds maximum length"));
    }
    let existing = find(&*sink, tree.root, key)?;
    if existing.is_some() && mode == WriteMode::NoOverwrite {
        return Err(ArborError::KeyExists);
    }
    let stored = if limits.fits_inline(key.len(), value.len()) {
        LeafValue::Inline(value.to_vec())
    } else {
        write_overflow(sink, value, &limits)?
    };
    let entry = LeafEntry {
        key: key.to_vec(),
        value: stored,
    };
    let order = sink.key_order();
    if tree.root.is_none() {
        let id = sink.alloc()?;
        sink.put_node(id, Node::Leaf(vec![entry]));
        tree.root = id;
        tree.depth = 1;
    } else {
        let (root, split) = insert_rec(sink, tree.root, entry, order, &limits)?;
        tree.root = root;
        if let Some((sep, right)) = split {
            let id = sink.alloc()?;
            sink.put_node(
                id,
                Node::Branch(vec![
                    BranchEntry {
                        key: Vec::new(),
                        child: root,
                    },
                    BranchEntry {
                        key: sep,
                        child: right,
                    },
                ]),
            );
            sink.stats().inc_root_splits();
            tree.root = id;
            tree.depth += 1;
        }
    }
    match existing {
        Some(old) => free_value(sink, &old)?,
        None => tree.entries += 1,
    }
    Ok(())
}

/// Removes `key` from `tree`, failing with [`ArborError::NotFound`] when it
/// is absent.
///
/// Nodes are never merged. A node left without entries is unlinked from its
/// parent, and a branch root left with a single child is replaced by it.
pub fn delete<S: PageSink + ?Sized>(sink: &mut S, tree: &mut TreeRoot, key: &[u8]) -> Result<()> {
    let existing = find(&*sink, tree.root, key)?.ok_or(ArborError::NotFound)?;
    let order = sink.key_order();
    match delete_rec(sink, tree.root, key, order)? {
        Some(root) => {
            tree.root = root;
            collapse_root(sink, tree)?;
        }
        None => {
            tree.root = PageId::NONE;
            tree.depth = 0;
        }
    }
    tree.entries = tree.entries.saturating_sub(1);
    free_value(sink, &existing)
}

fn cow<S: PageSink + ?Sized>(sink: &mut S, id: PageId) -> Result<(PageId, Node)> {
    if let Some(node) = sink.take_node(id) {
        return Ok((id, node));
    }
    let node = sink.load_node(id)?.into_owned();
    sink.free(id);
    let fresh = sink.alloc()?;
    sink.stats().inc_cow_clones();
    Ok((fresh, node))
}

type Split = Option<(Vec<u8>, PageId)>;

fn insert_rec<S: PageSink + ?Sized>(
    sink: &mut S,
    id: PageId,
    entry: LeafEntry,
    order: KeyOrder,
    limits: &NodeLimits,
) -> Result<(PageId, Split)> {
    let (id, mut node) = cow(sink, id)?;
    match &mut node {
        Node::Leaf(entries) => match search_leaf(entries, &entry.key, order) {
            Ok(idx) => entries[idx] = entry,
            Err(idx) => entries.insert(idx, entry),
        },
        Node::Branch(entries) => {
            let idx = child_index(entries, &entry.key, order);
            let (child, split) = insert_rec(sink, entries[idx].child, entry, order, limits)?;
            entries[idx].child = child;
            if let Some((key, right)) = split {
                entries.insert(idx + 1, BranchEntry { key, child: right });
            }
        }
    }
    if !limits.overflows(&node) {
        sink.put_node(id, node);
        return Ok((id, None));
    }
    let is_leaf = node.is_leaf();
    let (left, right, sep) = node::split(node);
    let right_id = sink.alloc()?;
    sink.put_node(id, left);
    sink.put_node(right_id, right);
    if is_leaf {
        sink.stats().inc_leaf_splits();
    } else {
        sink.stats().inc_branch_splits();
    }
    Ok((id, Some((sep, right_id))))
}

fn delete_rec<S: PageSink + ?Sized>(
    sink: &mut S,
    id: PageId,
    key: &[u8],
    order: KeyOrder,
) -> Result<Option<PageId>> {
    let (id, mut node) = cow(sink, id)?;
    match &mut node {
        Node::Leaf(entries) => {
            let idx = search_leaf(entries, key, order)
                .map_err(|_| ArborError::Corruption("key vanished during delete"))?;
            entries.remove(idx);
        }
        Node::Branch(entries) => {
            let idx = child_index(entries, key, order);
            match delete_rec(sink, entries[idx].child, key, order)? {
                Some(child) => entries[idx].child = child,
                None => {
                    entries.remove(idx);
                    sink.stats().inc_nodes_unlinked();
                    if let Some(first) = entries.first_mut() {
                        first.key.clear();
                    }
                }
            }
        }
    }
    if node.is_empty() {
        sink.free(id);
        return Ok(None);
    }
    sink.put_node(id, node);
    Ok(Some(id))
}

fn collapse_root<S: PageSink + ?Sized>(sink: &mut S, tree: &mut TreeRoot) -> Result<()> {
    loop {
        let only_child = match &*sink.load_node(tree.root)? {
            Node::Branch(entries) if entries.len() == 1 => Some(entries[0].child),
            _ => None,
        };
        let Some(child) = only_child else {
            return Ok(());
        };
        let _ = sink.take_node(tree.root);
        sink.free(tree.root);
        tree.root = child;
        tree.depth = tree.depth.saturating_sub(1);
        sink.stats().inc_root_collapses();
    }
}

fn write_overflow<S: PageSink + ?Sized>(
    sink: &mut S,
    value: &[u8],
    limits: &NodeLimits,
) -> Result<LeafValue> {
    let pages = value.len().div_ceil(limits.overflow_chunk());
    let ids = (0..pages)
        .map(|_| sink.alloc())
        .collect::<Result<Vec<PageId>>>()?;
    let images = node::encode_overflow(value, &ids, sink.page_size(), sink.salt())?;
    for (id, image) in images {
        sink.put_overflow(id, image);
    }
    sink.stats().add_overflow_pages(pages as u64);
    Ok(LeafValue::Overflow {
        head: ids[0],
        len: value.len() as u32,
    })
}

fn free_value<S: PageSink + ?Sized>(sink: &mut S, value: &LeafValue) -> Result<()> {
    if let LeafValue::Overflow { head, len } = value {
        for id in overflow_chain(&*sink, *head, *len)? {
            sink.free(id);
        }
    }
    Ok(())
}
