use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::primitives::pager::{Allocator, Pager, PendingCommit};
use crate::storage::btree::{BTreeStats, Node, PageSink, PageSource, TreeRoot};
use crate::types::{ArborError, KeyOrder, PageId, Result};

/// Dirty pages of one write transaction.
///
/// Nodes the transaction has written stay decoded in memory until commit.
/// Every id handed out by the allocator is "owned": it is edited in place
/// and can be returned to the allocator immediately when freed. Ids of the
/// base snapshot are only recorded in `freed` and reach the pager's pending
/// list at commit.
pub(crate) struct PageArena {
    pager: Arc<Pager>,
    stats: Arc<BTreeStats>,
    allocator: Allocator,
    nodes: HashMap<PageId, Node>,
    overflow: HashMap<PageId, Arc<[u8]>>,
    owned: HashSet<PageId>,
    freed: Vec<PageId>,
}

impl PageArena {
    pub(crate) fn new(pager: Arc<Pager>, allocator: Allocator, stats: Arc<BTreeStats>) -> Self {
        Self {
            pager,
            stats,
            allocator,
            nodes: HashMap::new(),
            overflow: HashMap::new(),
            owned: HashSet::new(),
            freed: Vec::new(),
        }
    }

    pub(crate) fn pager(&self) -> &Arc<Pager> {
        &self.pager
    }

    /// True while the transaction has neither written nor freed a page.
    pub(crate) fn is_clean(&self) -> bool {
        self.owned.is_empty() && self.freed.is_empty()
    }

    pub(crate) fn dirty_pages(&self) -> usize {
        self.owned.len()
    }

    /// Seals every dirty page and packages the transaction for
    /// [`Pager::commit`].
    pub(crate) fn into_pending(self, tree: TreeRoot) -> Result<PendingCommit> {
        let page_size = self.pager.page_size();
        let salt = self.pager.salt();
        let mut allocator = self.allocator;
        let mut pages: Vec<(PageId, Arc<[u8]>)> = Vec::with_capacity(self.owned.len());
        for (id, node) in self.nodes {
            pages.push((id, Arc::from(node.encode(id, page_size, salt)?)));
        }
        pages.extend(self.overflow);
        if pages.len() != self.owned.len() {
            let written: HashSet<PageId> = pages.iter().map(|(id, _)| *id).collect();
            for id in self.owned.difference(&written) {
                allocator.give_back(*id);
            }
        }
        pages.sort_by_key(|(id, _)| *id);
        Ok(PendingCommit {
            root: tree.root,
            depth: tree.depth,
            entries: tree.entries,
            allocator,
            freed: self.freed,
            pages,
        })
    }
}

impl PageSource for PageArena {
    fn page_size(&self) -> usize {
        self.pager.page_size()
    }

    fn key_order(&self) -> KeyOrder {
        self.pager.key_order()
    }

    fn load_node(&self, id: PageId) -> Result<Cow<'_, Node>> {
        if let Some(node) = self.nodes.get(&id) {
            return Ok(Cow::Borrowed(node));
        }
        if self.owned.contains(&id) {
            return Err(ArborError::Corruption("owned page has no node"));
        }
        PageSource::load_node(self.pager.as_ref(), id)
    }

    fn load_overflow(&self, id: PageId) -> Result<Arc<[u8]>> {
        if let Some(image) = self.overflow.get(&id) {
            return Ok(Arc::clone(image));
        }
        if self.owned.contains(&id) {
            return Err(ArborError::Corruption("owned page has no overflow image"));
        }
        self.pager.read_page(id)
    }
}

impl PageSink for PageArena {
    fn alloc(&mut self) -> Result<PageId> {
        let id = self.allocator.alloc()?;
        self.owned.insert(id);
        Ok(id)
    }

    fn free(&mut self, id: PageId) {
        if self.owned.remove(&id) {
            self.nodes.remove(&id);
            self.overflow.remove(&id);
            self.allocator.give_back(id);
        } else {
            self.freed.push(id);
        }
    }

    fn take_node(&mut self, id: PageId) -> Option<Node> {
        self.nodes.remove(&id)
    }

    fn put_node(&mut self, id: PageId, node: Node) {
        debug_assert!(self.owned.contains(&id), "write to unowned page {id}");
        self.nodes.insert(id, node);
    }

    fn put_overflow(&mut self, id: PageId, image: Arc<[u8]>) {
        debug_assert!(self.owned.contains(&id), "write to unowned page {id}");
        self.overflow.insert(id, image);
    }

    fn salt(&self) -> u64 {
        self.pager.salt()
    }

    fn stats(&self) -> &BTreeStats {
        &self.stats
    }
}
