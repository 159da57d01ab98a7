use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use crate::primitives::durability;
use crate::primitives::io::{self, FileIo, OpenMode, StdFileIo};
use crate::primitives::pager::{self, Meta, Pager, FIRST_DATA_PAGE};
use crate::storage::btree::node::encode_overflow;
use crate::storage::btree::{self, LeafValue, Node, PageSource};
use crate::types::{page::PageKind, ArborError, PageId, Result};

/// Summary of a completed compaction.
#[derive(Debug, Clone, PartialEq)]
pub struct CompactReport {
    /// Tree, leaf and overflow pages copied into the new file.
    pub pages_copied: u64,
    /// File size before compaction.
    pub bytes_before: u64,
    /// File size after compaction.
    pub bytes_after: u64,
    /// Wall time spent, in milliseconds.
    pub duration_ms: f64,
}

/// Path of the staging file a compaction of `db_path` writes to.
pub fn staging_path(db_path: &Path) -> PathBuf {
    let mut name = db_path.as_os_str().to_owned();
    name.push(".compact");
    PathBuf::from(name)
}

/// Copies every page reachable from the current root of `source` into a
/// fresh file with contiguous ids, renames it over the original and returns
/// a pager on the new file.
///
/// The caller holds the writer lock and keeps new transactions out until
/// the returned pager is installed.
pub(crate) fn rewrite(source: &Pager) -> Result<(Pager, CompactReport)> {
    let start = Instant::now();
    let db_path = source.path().to_path_buf();
    let staging = staging_path(&db_path);
    let meta = source.meta();
    let bytes_before = source.file_len()?;

    match fs::remove_file(&staging) {
        Ok(()) => debug!(path = %staging.display(), "db.compact.removed_stale_staging"),
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }

    let mut order: Vec<(PageId, PageKind)> = Vec::new();
    btree::visit_pages(source, meta.root, &mut |id, kind| {
        order.push((id, kind));
        Ok(())
    })?;
    let remap: HashMap<PageId, PageId> = order
        .iter()
        .enumerate()
        .map(|(idx, (old, _))| (*old, PageId(FIRST_DATA_PAGE.0 + idx as u64)))
        .collect();
    let relocate = |id: PageId| -> Result<PageId> {
        remap
            .get(&id)
            .copied()
            .ok_or(ArborError::Corruption("page not reachable during compaction"))
    };

    let io: Arc<dyn FileIo> = Arc::new(StdFileIo::open(
        &staging,
        OpenMode {
            read_only: false,
            permissions: source.options().permissions,
        },
    )?);
    let page_size = source.page_size();
    let salt = source.salt();
    for (old, kind) in &order {
        let new_id = relocate(*old)?;
        match kind {
            PageKind::Branch | PageKind::Leaf => {
                let node = relink(source, source.load_node(*old)?.into_owned(), &relocate, &*io)?;
                let image = node.encode(new_id, page_size, salt)?;
                io.write_at(durability::offset(new_id, page_size)?, &image)?;
            }
            // Written together with the leaf that owns the chain.
            PageKind::Overflow => {}
            _ => return Err(ArborError::Corruption("unexpected page kind in tree")),
        }
    }
    io.sync_all()?;

    let next_page = PageId(FIRST_DATA_PAGE.0 + order.len() as u64);
    let compacted = Meta {
        root: if meta.root.is_none() {
            PageId::NONE
        } else {
            relocate(meta.root)?
        },
        free_head: PageId::NONE,
        next_page,
        held_extents: 0,
        retired: false,
        ..meta.clone()
    };
    pager::write_both_slots(io.as_ref(), &compacted)?;

    fs::rename(&staging, &db_path)?;
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        io::sync_dir(parent)?;
    }

    let bytes_after = io.len()?;
    let fresh = Pager::open_with_io(&db_path, io, source.options().clone())?;
    let report = CompactReport {
        pages_copied: order.len() as u64,
        bytes_before,
        bytes_after,
        duration_ms: start.elapsed().as_secs_f64() * 1_000.0,
    };
    info!(
        path = %db_path.display(),
        txn = compacted.txn_id.0,
        pages_copied = report.pages_copied,
        bytes_before = report.bytes_before,
        bytes_after = report.bytes_after,
        duration_ms = report.duration_ms,
        "db.compact.completed"
    );
    Ok((fresh, report))
}

/// Points a copied node at the new ids of its children, writing the
/// relocated overflow chains of a leaf on the way.
fn relink(
    source: &Pager,
    node: Node,
    relocate: &dyn Fn(PageId) -> Result<PageId>,
    dst: &dyn FileIo,
) -> Result<Node> {
    match node {
        Node::Branch(mut entries) => {
            for entry in &mut entries {
                entry.child = relocate(entry.child)?;
            }
            Ok(Node::Branch(entries))
        }
        Node::Leaf(mut entries) => {
            for entry in &mut entries {
                let LeafValue::Overflow { head, len } = entry.value else {
                    continue;
                };
                let chain = btree::overflow_chain(source, head, len)?;
                let ids = chain
                    .iter()
                    .map(|id| relocate(*id))
                    .collect::<Result<Vec<_>>>()?;
                let value = btree::read_value(source, &entry.value)?;
                for (id, image) in encode_overflow(&value, &ids, source.page_size(), source.salt())? {
                    dst.write_at(durability::offset(id, source.page_size())?, &image)?;
                }
                entry.value = LeafValue::Overflow {
                    head: ids.first().copied().unwrap_or(PageId::NONE),
                    len,
                };
            }
            Ok(Node::Leaf(entries))
        }
    }
}
