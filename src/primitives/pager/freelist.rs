//! Free-page accounting.
//!
//! Pages released by a commit cannot be reused while a reader may still be
//! looking at the snapshot they belonged to, nor while the other meta slot
//! still points at the tree they came from. They are parked under the
//! releasing transaction and move to the ready set once every older reader
//! has finished and a later commit has overwritten that slot. The whole set
//! is persisted as a chain of free-list pages referenced from the meta page;
//! the pages released by the commit that wrote the meta are stored last and
//! counted in the meta, so they stay parked across a reopen.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::sync::Arc;

use crate::primitives::durability;
use crate::primitives::io::FileIo;
use crate::types::{
    page::{self, read_u32, read_u64, PageHeader, PageKind, PAGE_HDR_LEN},
    ArborError, PageId, Result, TxnId,
};

/// A run of consecutive free pages.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Extent {
    /// First page of the run.
    pub start: PageId,
    /// Number of pages in the run.
    pub len: u32,
}

impl Extent {
    /// Creates an extent covering `len` pages starting at `start`.
    pub fn new(start: PageId, len: u32) -> Self {
        Self { start, len }
    }

    fn end(&self) -> u64 {
        self.start.0 + self.len as u64
    }

    /// Absorbs `other` if it starts exactly where `self` ends.
    pub fn coalesce_with(&mut self, other: &Extent) -> bool {
        if self.end() == other.start.0 && self.len.checked_add(other.len).is_some() {
            self.len += other.len;
            true
        } else {
            false
        }
    }

    /// Iterates the page ids covered by this extent.
    pub fn iter_pages(&self) -> impl Iterator<Item = PageId> + '_ {
        (0..self.len).map(move |off| PageId(self.start.0 + off as u64))
    }
}

/// Sorted, coalesced set of pages that may be handed out right away.
///
/// Allocation is first-fit from the lowest id so live data drifts towards
/// the front of the file.
#[derive(Clone, Default, Debug)]
pub struct FreeCache {
    extents: Vec<Extent>,
}

impl FreeCache {
    /// Builds a cache from arbitrary, possibly unsorted extents.
    pub fn from_extents(extents: Vec<Extent>) -> Self {
        let mut cache = Self { extents };
        cache.rebuild();
        cache
    }

    /// Current extents in ascending order.
    pub fn extents(&self) -> &[Extent] {
        &self.extents
    }

    /// Number of free pages.
    pub fn page_count(&self) -> u64 {
        self.extents.iter().map(|e| e.len as u64).sum()
    }

    /// Removes and returns the lowest free page.
    pub fn pop(&mut self) -> Option<PageId> {
        let first = self.extents.first_mut()?;
        let page = first.start;
        if first.len > 1 {
            first.start.0 += 1;
            first.len -= 1;
        } else {
            self.extents.remove(0);
        }
        Some(page)
    }

    /// Returns a single page to the set.
    pub fn insert(&mut self, page: PageId) {
        self.extend(vec![Extent::new(page, 1)]);
    }

    /// Adds extents and re-coalesces.
    pub fn extend(&mut self, mut extents: Vec<Extent>) {
        if extents.is_empty() {
            return;
        }
        self.extents.append(&mut extents);
        self.rebuild();
    }

    fn rebuild(&mut self) {
        self.extents.sort_by_key(|e| e.start);
        let mut merged: Vec<Extent> = Vec::with_capacity(self.extents.len());
        for extent in self.extents.drain(..) {
            if extent.len == 0 {
                continue;
            }
            if let Some(last) = merged.last_mut() {
                if last.coalesce_with(&extent) {
                    continue;
                }
            }
            merged.push(extent);
        }
        self.extents = merged;
    }
}

/// Ready pages plus pages parked until older readers drain.
#[derive(Clone, Default, Debug)]
pub struct FreeList {
    /// Pages that can be allocated now.
    pub ready: FreeCache,
    /// Pages freed by each transaction, keyed by the freeing transaction.
    pub pending: BTreeMap<TxnId, Vec<PageId>>,
}

impl FreeList {
    /// Creates a free list whose pages are all ready.
    pub fn from_extents(extents: Vec<Extent>) -> Self {
        Self {
            ready: FreeCache::from_extents(extents),
            pending: BTreeMap::new(),
        }
    }

    /// Rebuilds the free list persisted by commit `txn`: the last `held`
    /// extents are the pages that commit released and stay parked under it.
    pub fn restore(mut extents: Vec<Extent>, held: u32, txn: TxnId) -> Result<Self> {
        let held = held as usize;
        if held > extents.len() {
            return Err(ArborError::Corruption("held extents exceed free list"));
        }
        let parked = extents.split_off(extents.len() - held);
        let mut list = Self::from_extents(extents);
        list.park(txn, parked.iter().flat_map(|e| e.iter_pages()));
        Ok(list)
    }

    /// Parks pages freed by `txn`.
    pub fn park(&mut self, txn: TxnId, pages: impl IntoIterator<Item = PageId>) {
        let entry = self.pending.entry(txn).or_default();
        entry.extend(pages);
        if entry.is_empty() {
            self.pending.remove(&txn);
        }
    }

    /// Moves parked pages to the ready set once nothing can reach them.
    ///
    /// Pages freed by transaction `t` are visible to snapshots older than `t`
    /// and to the meta slot of `t - 1`, which survives until commit `t + 1`
    /// lands. They are released when `committed` is past `t` and
    /// `oldest_reader`, if any, is at or past `t`. Returns the number of
    /// pages released.
    pub fn release_up_to(&mut self, oldest_reader: Option<TxnId>, committed: TxnId) -> usize {
        let Some(mut bound) = committed.0.checked_sub(1).map(TxnId) else {
            return 0;
        };
        if let Some(oldest) = oldest_reader {
            bound = bound.min(oldest);
        }
        let releasable: Vec<TxnId> = self.pending.range(..=bound).map(|(txn, _)| *txn).collect();
        let mut released = 0;
        for txn in releasable {
            if let Some(pages) = self.pending.remove(&txn) {
                released += pages.len();
                self.ready
                    .extend(pages.into_iter().map(|p| Extent::new(p, 1)).collect());
            }
        }
        released
    }

    /// Number of parked pages.
    pub fn pending_count(&self) -> u64 {
        self.pending.values().map(|v| v.len() as u64).sum()
    }

    /// Splits every free page into the extents persisted as free and those
    /// held back because commit `txn` released them.
    pub fn persisted_extents(&self, txn: TxnId) -> (Vec<Extent>, Vec<Extent>) {
        let mut free = self.ready.extents().to_vec();
        let mut held = Vec::new();
        for (parked_by, pages) in &self.pending {
            let target = if *parked_by == txn { &mut held } else { &mut free };
            target.extend(pages.iter().map(|page| Extent::new(*page, 1)));
        }
        (
            FreeCache::from_extents(free).extents,
            FreeCache::from_extents(held).extents,
        )
    }
}

/// Hands out page ids to a write transaction.
#[derive(Clone, Debug)]
pub struct Allocator {
    free: FreeCache,
    next_page: PageId,
    limit: u64,
}

impl Allocator {
    /// Creates an allocator over `free` that grows the file from `next_page`
    /// up to `limit` pages.
    pub fn new(free: FreeCache, next_page: PageId, limit: u64) -> Self {
        Self {
            free,
            next_page,
            limit,
        }
    }

    /// Allocates a page, preferring reuse over growing the file.
    pub fn alloc(&mut self) -> Result<PageId> {
        if let Some(page) = self.free.pop() {
            return Ok(page);
        }
        if self.next_page.0 >= self.limit {
            return Err(ArborError::OutOfSpace);
        }
        let page = self.next_page;
        self.next_page = PageId(page.0 + 1);
        Ok(page)
    }

    /// Returns a page allocated by the same transaction.
    pub fn give_back(&mut self, page: PageId) {
        self.free.insert(page);
    }

    /// One past the highest page handed out so far.
    pub fn next_page(&self) -> PageId {
        self.next_page
    }

    /// Pages still available for reuse.
    pub fn free(&self) -> &FreeCache {
        &self.free
    }

    pub(crate) fn into_parts(self) -> (FreeCache, PageId) {
        (self.free, self.next_page)
    }
}

const CHAIN_NEXT: usize = PAGE_HDR_LEN;
const CHAIN_COUNT: usize = PAGE_HDR_LEN + 8;
const CHAIN_RESERVED: usize = PAGE_HDR_LEN + 12;
const CHAIN_ENTRIES: usize = PAGE_HDR_LEN + 16;
const EXTENT_LEN: usize = 16;

/// Number of extents a single free-list page can hold.
pub fn chain_page_capacity(page_size: usize) -> usize {
    page_size.saturating_sub(CHAIN_ENTRIES) / EXTENT_LEN
}

/// Number of chain pages needed to persist `extents` extents.
pub fn chain_pages_needed(extents: usize, page_size: usize) -> usize {
    let capacity = chain_page_capacity(page_size).max(1);
    extents.div_ceil(capacity)
}

/// Encodes `extents` across the chain pages `ids`, linked in order.
pub fn write_chain(
    extents: &[Extent],
    ids: &[PageId],
    page_size: usize,
    salt: u64,
) -> Result<Vec<(PageId, Arc<[u8]>)>> {
    let capacity = chain_page_capacity(page_size);
    if ids.len() * capacity < extents.len() {
        return Err(ArborError::Invalid("free-list chain too short"));
    }
    let mut out = Vec::with_capacity(ids.len());
    let mut remaining = extents;
    for (idx, id) in ids.iter().enumerate() {
        let take = remaining.len().min(capacity);
        let (chunk, rest) = remaining.split_at(take);
        remaining = rest;
        let next = ids.get(idx + 1).copied().unwrap_or(PageId::NONE);
        let mut buf = vec![0u8; page_size];
        let free_offset = CHAIN_ENTRIES + chunk.len() * EXTENT_LEN;
        PageHeader::new(*id, PageKind::FreeList, page_size as u32)?
            .with_layout(0, free_offset as u16)
            .encode(&mut buf)?;
        buf[CHAIN_NEXT..CHAIN_NEXT + 8].copy_from_slice(&next.0.to_be_bytes());
        buf[CHAIN_COUNT..CHAIN_COUNT + 4].copy_from_slice(&(chunk.len() as u32).to_be_bytes());
        for (i, extent) in chunk.iter().enumerate() {
            let off = CHAIN_ENTRIES + i * EXTENT_LEN;
            buf[off..off + 8].copy_from_slice(&extent.start.0.to_be_bytes());
            buf[off + 8..off + 12].copy_from_slice(&extent.len.to_be_bytes());
        }
        page::seal(&mut buf, *id, salt)?;
        out.push((*id, Arc::from(buf)));
    }
    Ok(out)
}

/// Decoded contents of a persisted free list.
#[derive(Debug, Default)]
pub struct Chain {
    /// Free extents recorded in the chain.
    pub extents: Vec<Extent>,
    /// Pages the chain itself occupies.
    pub pages: Vec<PageId>,
}

/// Reads the free-list chain starting at `head`.
pub fn read_chain(
    io: &dyn FileIo,
    head: PageId,
    page_size: usize,
    salt: u64,
    next_page: PageId,
) -> Result<Chain> {
    let mut chain = Chain::default();
    let mut current = head;
    let capacity = chain_page_capacity(page_size);
    while !current.is_none() {
        if chain.pages.len() as u64 >= next_page.0 {
            return Err(ArborError::Corruption("free-list chain cycle"));
        }
        if current.0 >= next_page.0 {
            return Err(ArborError::Corruption("free-list page beyond end"));
        }
        let mut buf = vec![0u8; page_size];
        match io.read_at(durability::offset(current, page_size)?, &mut buf) {
            Ok(()) => {}
            Err(ArborError::Io(err)) if err.kind() == ErrorKind::UnexpectedEof => {
                return Err(ArborError::Corruption("free-list page truncated"));
            }
            Err(err) => return Err(err),
        }
        let header = page::verify(&buf, current, page_size, salt)?;
        if header.kind != PageKind::FreeList {
            return Err(ArborError::Corruption("free-list page kind mismatch"));
        }
        let count = read_u32(&buf, CHAIN_COUNT) as usize;
        if read_u32(&buf, CHAIN_RESERVED) != 0 {
            return Err(ArborError::Corruption("free-list reserved bytes not zero"));
        }
        if count > capacity {
            return Err(ArborError::Corruption("free-list count exceeds capacity"));
        }
        for i in 0..count {
            let off = CHAIN_ENTRIES + i * EXTENT_LEN;
            let extent = Extent::new(PageId(read_u64(&buf, off)), read_u32(&buf, off + 8));
            if extent.start.0 < 2 || extent.end() > next_page.0 {
                return Err(ArborError::Corruption("free-list extent out of range"));
            }
            chain.extents.push(extent);
        }
        chain.pages.push(current);
        current = PageId(read_u64(&buf, CHAIN_NEXT));
    }
    Ok(chain)
}
