use crate::primitives::pager::Pager;
use crate::storage::btree;
use crate::types::{page::PageKind, KeyOrder, Result, TxnId};

/// Shape and size of the latest committed tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbStat {
    /// Page size of the file.
    pub page_size: u32,
    /// Key collation recorded in the file.
    pub key_order: KeyOrder,
    /// Tree height; 0 for an empty tree.
    pub depth: u32,
    /// Number of branch pages reachable from the root.
    pub branch_pages: u64,
    /// Number of leaf pages reachable from the root.
    pub leaf_pages: u64,
    /// Number of overflow pages reachable from the root.
    pub overflow_pages: u64,
    /// Number of key/value pairs.
    pub entries: u64,
    /// Counter of the latest commit.
    pub txn: TxnId,
    /// Free pages, including those still held back for readers.
    pub free_pages: u64,
    /// One past the highest page id in use.
    pub next_page: u64,
    /// File size in bytes.
    pub file_size: u64,
}

/// Walks the current tree of `pager` and counts its pages.
pub(crate) fn collect(pager: &Pager) -> Result<DbStat> {
    let snapshot = pager.begin_snapshot();
    let meta = snapshot.meta();
    let (mut branch_pages, mut leaf_pages, mut overflow_pages) = (0u64, 0u64, 0u64);
    btree::visit_pages(pager, meta.root, &mut |_, kind| {
        match kind {
            PageKind::Branch => branch_pages += 1,
            PageKind::Leaf => leaf_pages += 1,
            _ => overflow_pages += 1,
        }
        Ok(())
    })?;
    Ok(DbStat {
        page_size: meta.page_size,
        key_order: meta.key_order,
        depth: meta.depth,
        branch_pages,
        leaf_pages,
        overflow_pages,
        entries: meta.entries,
        txn: meta.txn_id,
        free_pages: pager.free_pages(),
        next_page: meta.next_page.0,
        file_size: pager.file_len()?,
    })
}
