#![forbid(unsafe_code)]

//! Commit publication.
//!
//! A commit becomes durable in two steps: every new data page is written
//! and flushed, then the meta page naming the new root is written and
//! flushed. Until the meta write reaches disk the previous meta slot stays
//! authoritative, so an interrupted commit is simply invisible on reopen.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tracing::trace;

use super::io::FileIo;
use crate::types::{ArborError, PageId, Result};

/// Fsync policy applied at commit.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum Synchronous {
    /// Flush data pages, then flush the meta page.
    #[default]
    Full,
    /// Skip both flushes. A crash may lose recent commits but never exposes
    /// a partially written one through a valid meta page.
    Off,
}

impl Synchronous {
    /// Returns the canonical string representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Synchronous::Full => "full",
            Synchronous::Off => "off",
        }
    }

    /// Returns true when commits flush to stable storage.
    pub fn flushes(self) -> bool {
        matches!(self, Synchronous::Full)
    }
}

impl fmt::Display for Synchronous {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Synchronous {
    type Err = ArborError;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "full" => Ok(Synchronous::Full),
            "off" | "nosync" => Ok(Synchronous::Off),
            _ => Err(ArborError::Invalid("unknown synchronous mode")),
        }
    }
}

/// Writes `pages` and then `meta` in the order that keeps the file
/// recoverable at every intermediate point.
pub fn commit_ordered(
    io: &Arc<dyn FileIo>,
    page_size: usize,
    pages: &[(PageId, Arc<[u8]>)],
    meta_id: PageId,
    meta: &[u8],
    sync: Synchronous,
) -> Result<()> {
    let mut ordered: Vec<&(PageId, Arc<[u8]>)> = pages.iter().collect();
    ordered.sort_by_key(|(id, _)| *id);
    for (id, buf) in ordered {
        debug_assert_eq!(buf.len(), page_size);
        io.write_at(offset(*id, page_size)?, buf)?;
    }
    if sync.flushes() {
        io.sync_all()?;
    }
    io.write_at(offset(meta_id, page_size)?, meta)?;
    if sync.flushes() {
        io.sync_all()?;
    }
    trace!(pages = pages.len(), meta = %meta_id, "durability.commit_ordered");
    Ok(())
}

/// Byte offset of `id` in a file with `page_size` pages.
pub fn offset(id: PageId, page_size: usize) -> Result<u64> {
    id.0
        .checked_mul(page_size as u64)
        .ok_or(ArborError::OutOfSpace)
}
