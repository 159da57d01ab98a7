#![forbid(unsafe_code)]

//! Copy-on-write B+ tree over pager pages.
//!
//! The tree code never touches the file directly. Reads go through a
//! [`PageSource`]; a write transaction additionally provides a [`PageSink`]
//! that hands out page ids and keeps the nodes it has modified in memory
//! until commit.

use std::borrow::Cow;
use std::sync::Arc;

use crate::primitives::pager::Pager;
use crate::types::{KeyOrder, PageId, Result};

mod cursor;
/// Node layout and page encoding.
pub mod node;
mod stats;
mod tree;

pub use cursor::{Cursor, Iter};
pub use node::{BranchEntry, LeafEntry, LeafValue, Node, NodeLimits};
pub use stats::{BTreeStats, BTreeStatsSnapshot};
pub use tree::{delete, get, overflow_chain, put, read_value, visit_pages, TreeRoot, WriteMode};

/// Read access to tree pages of one snapshot.
pub trait PageSource {
    /// Page size of the underlying file.
    fn page_size(&self) -> usize;
    /// Key collation of the tree.
    fn key_order(&self) -> KeyOrder;
    /// Loads the node stored at `id`.
    fn load_node(&self, id: PageId) -> Result<Cow<'_, Node>>;
    /// Loads the raw image of overflow page `id`.
    fn load_overflow(&self, id: PageId) -> Result<Arc<[u8]>>;
}

/// Write access used by [`put`] and [`delete`].
pub trait PageSink: PageSource {
    /// Allocates a page owned by the current transaction.
    fn alloc(&mut self) -> Result<PageId>;
    /// Releases a page; owned pages are reusable at once, committed pages
    /// only after readers of older snapshots finish.
    fn free(&mut self, id: PageId);
    /// Removes and returns a node already owned by the transaction.
    fn take_node(&mut self, id: PageId) -> Option<Node>;
    /// Stores a modified node under an owned page id.
    fn put_node(&mut self, id: PageId, node: Node);
    /// Stores a sealed overflow page image under an owned page id.
    fn put_overflow(&mut self, id: PageId, image: Arc<[u8]>);
    /// Checksum salt of the file.
    fn salt(&self) -> u64;
    /// Counters updated by tree operations.
    fn stats(&self) -> &BTreeStats;
}

impl PageSource for Pager {
    fn page_size(&self) -> usize {
        Pager::page_size(self)
    }

    fn key_order(&self) -> KeyOrder {
        Pager::key_order(self)
    }

    fn load_node(&self, id: PageId) -> Result<Cow<'_, Node>> {
        let buf = self.read_page(id)?;
        Node::decode(&buf).map(Cow::Owned)
    }

    fn load_overflow(&self, id: PageId) -> Result<Arc<[u8]>> {
        self.read_page(id)
    }
}
