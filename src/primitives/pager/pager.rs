use std::io::ErrorKind;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, info};

use super::freelist::{self, Allocator, FreeList};
use super::meta::{self, Meta, FIRST_DATA_PAGE, META_SLOTS};
use crate::primitives::concurrency::{ReaderSlot, ReaderTable};
use crate::primitives::durability::{self, Synchronous};
use crate::primitives::io::{FileIo, OpenMode, StdFileIo};
use crate::types::{page, ArborError, KeyOrder, PageId, Result, TxnId};

/// Configuration options for the pager.
///
/// `page_size` and `key_order` only apply when a new file is created;
/// an existing file keeps the values recorded in its meta pages.
#[derive(Clone, Debug)]
pub struct PagerOptions {
    /// Size of each page in bytes (power of two, 512..=32768).
    pub page_size: u32,
    /// Number of verified page images kept in memory.
    pub cache_pages: usize,
    /// Fsync policy applied at commit.
    pub synchronous: Synchronous,
    /// Open without write access; writes fail with [`ArborError::ReadOnly`].
    pub read_only: bool,
    /// Key collation for newly created files.
    pub key_order: KeyOrder,
    /// Unix permission bits used when the file is created.
    pub permissions: Option<u32>,
    /// Upper bound on the file size in pages.
    pub max_pages: Option<u64>,
}

impl Default for PagerOptions {
    fn default() -> Self {
        Self {
            page_size: page::DEFAULT_PAGE_SIZE,
            cache_pages: 256,
            synchronous: Synchronous::Full,
            read_only: false,
            key_order: KeyOrder::Forward,
            permissions: None,
            max_pages: None,
        }
    }
}

/// Counters describing pager activity since open.
#[derive(Default, Clone, Debug)]
pub struct PagerStats {
    /// Number of page reads served from the cache.
    pub hits: u64,
    /// Number of page reads that went to the file.
    pub misses: u64,
    /// Number of pages written by commits, meta pages excluded.
    pub pages_written: u64,
    /// Number of committed write transactions.
    pub commits: u64,
}

#[derive(Default)]
struct PagerCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    pages_written: AtomicU64,
    commits: AtomicU64,
}

struct PagerState {
    meta: Meta,
    freelist: FreeList,
    chain: Vec<PageId>,
}

/// A registered read view of one committed meta.
///
/// While the snapshot is alive no page reachable from its root is reused.
pub struct Snapshot {
    meta: Meta,
    _slot: ReaderSlot,
}

impl Snapshot {
    /// Meta the snapshot was taken from.
    pub fn meta(&self) -> &Meta {
        &self.meta
    }
}

/// Everything a write transaction hands to [`Pager::commit`].
pub struct PendingCommit {
    /// New tree root.
    pub root: PageId,
    /// New tree height.
    pub depth: u32,
    /// New entry count.
    pub entries: u64,
    /// Allocator state after the transaction's allocations.
    pub allocator: Allocator,
    /// Pages of the base snapshot that the new tree no longer references.
    pub freed: Vec<PageId>,
    /// Sealed images of every page written by the transaction.
    pub pages: Vec<(PageId, Arc<[u8]>)>,
}

/// Page manager for a single database file.
///
/// Owns the file handle, the two meta slots, the free list and a cache of
/// verified page images. Pages are immutable once committed; a commit only
/// ever writes pages that no live snapshot can reach.
pub struct Pager {
    path: PathBuf,
    io: Arc<dyn FileIo>,
    options: PagerOptions,
    page_size: usize,
    salt: u64,
    key_order: KeyOrder,
    cache: Mutex<LruCache<PageId, Arc<[u8]>>>,
    state: Mutex<PagerState>,
    readers: ReaderTable,
    counters: PagerCounters,
}

impl Pager {
    /// Opens the database file at `path`, creating it when it does not exist
    /// (unless `options.read_only` is set).
    pub fn open(path: impl AsRef<Path>, options: PagerOptions) -> Result<Self> {
        let path = path.as_ref();
        let mode = OpenMode {
            read_only: options.read_only,
            permissions: options.permissions,
        };
        let io: Arc<dyn FileIo> = Arc::new(StdFileIo::open(path, mode)?);
        Self::open_with_io(path, io, options)
    }

    /// Opens a pager over an arbitrary [`FileIo`]; `path` is only used for
    /// naming side files and log output.
    pub fn open_with_io(
        path: &Path,
        io: Arc<dyn FileIo>,
        options: PagerOptions,
    ) -> Result<Self> {
        let meta = if io.is_empty()? {
            if options.read_only {
                return Err(ArborError::ReadOnly);
            }
            let meta = Meta::fresh(options.page_size, options.key_order)?;
            meta::write_both_slots(io.as_ref(), &meta)?;
            info!(
                path = %path.display(),
                page_size = meta.page_size,
                "pager.created"
            );
            meta
        } else {
            meta::load_meta(io.as_ref())?
        };
        if meta.retired {
            return Err(ArborError::StaleHandle);
        }
        if meta.page_size != options.page_size || meta.key_order != options.key_order {
            debug!(
                file_page_size = meta.page_size,
                file_key_order = ?meta.key_order,
                "pager.open.file_settings_override_options"
            );
        }
        let page_size = meta.page_size as usize;
        let (freelist, chain) = load_free_list(io.as_ref(), &meta)?;
        let cache_pages = NonZeroUsize::new(options.cache_pages.max(1)).unwrap_or(NonZeroUsize::MIN);
        debug!(
            path = %path.display(),
            txn = meta.txn_id.0,
            root = meta.root.0,
            free_pages = freelist.ready.page_count(),
            held_pages = freelist.pending_count(),
            "pager.opened"
        );
        Ok(Self {
            path: path.to_path_buf(),
            io,
            page_size,
            salt: meta.salt,
            key_order: meta.key_order,
            options,
            cache: Mutex::new(LruCache::new(cache_pages)),
            state: Mutex::new(PagerState {
                freelist,
                chain,
                meta,
            }),
            readers: ReaderTable::new(),
            counters: PagerCounters::default(),
        })
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Page size of the open file.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Per-file checksum salt.
    pub fn salt(&self) -> u64 {
        self.salt
    }

    /// Key collation recorded in the file.
    pub fn key_order(&self) -> KeyOrder {
        self.key_order
    }

    /// Options the pager was opened with.
    pub fn options(&self) -> &PagerOptions {
        &self.options
    }

    /// Returns true when the file was opened without write access.
    pub fn is_read_only(&self) -> bool {
        self.options.read_only
    }

    /// Meta of the latest committed transaction.
    pub fn meta(&self) -> Meta {
        self.state.lock().meta.clone()
    }

    /// Registry of active readers.
    pub fn readers(&self) -> &ReaderTable {
        &self.readers
    }

    /// Number of free pages, ready or still parked behind readers.
    pub fn free_pages(&self) -> u64 {
        let state = self.state.lock();
        state.freelist.ready.page_count() + state.freelist.pending_count()
    }

    /// Current length of the file in bytes.
    pub fn file_len(&self) -> Result<u64> {
        self.io.len()
    }

    /// Counters describing cache and commit activity.
    pub fn stats(&self) -> PagerStats {
        PagerStats {
            hits: self.counters.hits.load(AtomicOrdering::Relaxed),
            misses: self.counters.misses.load(AtomicOrdering::Relaxed),
            pages_written: self.counters.pages_written.load(AtomicOrdering::Relaxed),
            commits: self.counters.commits.load(AtomicOrdering::Relaxed),
        }
    }

    /// Reads and verifies a data page.
    pub fn read_page(&self, id: PageId) -> Result<Arc<[u8]>> {
        if id < FIRST_DATA_PAGE {
            return Err(ArborError::Corruption("page reference into meta slots"));
        }
        if let Some(buf) = self.cache.lock().get(&id) {
            self.counters.hits.fetch_add(1, AtomicOrdering::Relaxed);
            return Ok(Arc::clone(buf));
        }
        self.counters.misses.fetch_add(1, AtomicOrdering::Relaxed);
        let mut buf = vec![0u8; self.page_size];
        match self
            .io
            .read_at(durability::offset(id, self.page_size)?, &mut buf)
        {
            Ok(()) => {}
            Err(ArborError::Io(err)) if err.kind() == ErrorKind::UnexpectedEof => {
                return Err(ArborError::Corruption("page beyond end of file"));
            }
            Err(err) => return Err(err),
        }
        page::verify(&buf, id, self.page_size, self.salt)?;
        let buf: Arc<[u8]> = Arc::from(buf);
        self.cache.lock().put(id, Arc::clone(&buf));
        Ok(buf)
    }

    /// Registers a reader of the latest committed meta.
    pub fn begin_snapshot(&self) -> Snapshot {
        let state = self.state.lock();
        let slot = self.readers.register(state.meta.txn_id);
        Snapshot {
            meta: state.meta.clone(),
            _slot: slot,
        }
    }

    /// Returns the base meta for a new write transaction and an allocator
    /// over every page that neither a reader nor the previous meta slot can
    /// still reach.
    pub fn writer_allocator(&self) -> Result<(Meta, Allocator)> {
        if self.is_read_only() {
            return Err(ArborError::ReadOnly);
        }
        let mut state = self.state.lock();
        let current_txn = state.meta.txn_id;
        let released = state
            .freelist
            .release_up_to(self.readers.oldest(), current_txn);
        if released > 0 {
            debug!(released, "pager.freelist.released");
        }
        let allocator = Allocator::new(
            state.freelist.ready.clone(),
            state.meta.next_page,
            self.page_limit(),
        );
        Ok((state.meta.clone(), allocator))
    }

    fn page_limit(&self) -> u64 {
        let by_size = u64::MAX / self.page_size as u64;
        match self.options.max_pages {
            Some(max) => max.min(by_size),
            None => by_size,
        }
    }

    /// Publishes a write transaction built on `base`.
    ///
    /// Data pages and the rewritten free list are written first, then the
    /// meta page in the slot not holding `base`. In-memory state changes only
    /// after the whole sequence succeeds.
    pub fn commit(&self, base: &Meta, pending: PendingCommit) -> Result<Meta> {
        if self.is_read_only() {
            return Err(ArborError::ReadOnly);
        }
        let mut state = self.state.lock();
        if state.meta.txn_id != base.txn_id {
            return Err(ArborError::TransactionState("commit base is stale"));
        }
        let txn = base.txn_id.next();
        let PendingCommit {
            root,
            depth,
            entries,
            mut allocator,
            freed,
            pages,
        } = pending;

        let mut freelist = FreeList {
            ready: Default::default(),
            pending: state.freelist.pending.clone(),
        };
        freelist.park(txn, freed.iter().copied().chain(state.chain.iter().copied()));

        // Pages released here go last in the chain; the meta records how many
        // extents they fill so a reopen keeps them parked.
        let mut chain: Vec<PageId> = Vec::new();
        let (mut extents, held) = loop {
            freelist.ready = allocator.free().clone();
            let (free, held) = freelist.persisted_extents(txn);
            let needed = freelist::chain_pages_needed(free.len() + held.len(), self.page_size);
            if needed <= chain.len() {
                break (free, held);
            }
            chain.push(allocator.alloc()?);
        };
        let held_extents = u32::try_from(held.len())
            .map_err(|_| ArborError::Invalid("too many held free-list extents"))?;
        extents.extend(held);
        let chain_pages = freelist::write_chain(&extents, &chain, self.page_size, self.salt)?;

        let (ready, next_page) = allocator.into_parts();
        freelist.ready = ready;
        let new_meta = Meta {
            txn_id: txn,
            root,
            depth,
            entries,
            next_page,
            free_head: chain.first().copied().unwrap_or(PageId::NONE),
            held_extents,
            ..base.clone()
        };
        let meta_buf = meta::encode_meta(&new_meta, new_meta.slot())?;

        let mut writes = pages;
        writes.extend(chain_pages);
        durability::commit_ordered(
            &self.io,
            self.page_size,
            &writes,
            new_meta.slot(),
            &meta_buf,
            self.options.synchronous,
        )?;

        {
            let mut cache = self.cache.lock();
            for (id, buf) in &writes {
                if chain.contains(id) {
                    cache.pop(id);
                } else {
                    cache.put(*id, Arc::clone(buf));
                }
            }
        }
        self.counters
            .pages_written
            .fetch_add(writes.len() as u64, AtomicOrdering::Relaxed);
        self.counters.commits.fetch_add(1, AtomicOrdering::Relaxed);
        debug!(
            txn = txn.0,
            pages = writes.len(),
            freed = freed.len(),
            root = root.0,
            "pager.commit"
        );
        state.meta = new_meta.clone();
        state.freelist = freelist;
        state.chain = chain;
        Ok(new_meta)
    }

    /// Flushes the file to stable storage.
    pub fn sync(&self) -> Result<()> {
        if self.is_read_only() {
            return Ok(());
        }
        self.io.sync_all()
    }

    /// Reloads the meta pages when another process has committed since this
    /// pager last looked. Called by writers right after taking the file lock.
    ///
    /// Returns true when newer state was picked up, and
    /// [`ArborError::StaleHandle`] once a compaction has retired the file.
    pub fn refresh(&self) -> Result<bool> {
        let mut state = self.state.lock();
        let mut newest: Option<Meta> = None;
        for slot in 0..META_SLOTS {
            let Ok(found) = meta::read_slot(self.io.as_ref(), PageId(slot), state.meta.page_size) else {
                continue;
            };
            if found.salt != self.salt {
                continue;
            }
            if found.retired {
                return Err(ArborError::StaleHandle);
            }
            if found.txn_id <= state.meta.txn_id {
                continue;
            }
            if newest.as_ref().map_or(true, |best| found.txn_id > best.txn_id) {
                newest = Some(found);
            }
        }
        let Some(latest) = newest else {
            return Ok(false);
        };
        let (freelist, chain) = load_free_list(self.io.as_ref(), &latest)?;
        self.cache.lock().clear();
        info!(
            from = state.meta.txn_id.0,
            to = latest.txn_id.0,
            "pager.refreshed"
        );
        state.freelist = freelist;
        state.chain = chain;
        state.meta = latest;
        Ok(true)
    }

    /// Discards the latest commit by invalidating its meta slot so the
    /// other slot becomes authoritative again.
    ///
    /// Fails with [`ArborError::LockBusy`] while readers are active and with
    /// [`ArborError::Invalid`] when the other slot holds no older commit.
    pub fn revert(&self) -> Result<Meta> {
        if self.is_read_only() {
            return Err(ArborError::ReadOnly);
        }
        let mut state = self.state.lock();
        if self.readers.active() > 0 {
            return Err(ArborError::LockBusy);
        }
        let current = state.meta.clone();
        let current_slot = current.slot();
        let other_slot = PageId((current_slot.0 + 1) % META_SLOTS);
        let previous = match meta::read_slot(self.io.as_ref(), other_slot, current.page_size) {
            Ok(previous) if previous.txn_id < current.txn_id && previous.salt == current.salt => {
                previous
            }
            _ => return Err(ArborError::Invalid("no earlier commit to revert to")),
        };
        let (freelist, chain) = load_free_list(self.io.as_ref(), &previous)?;
        let zeroes = vec![0u8; self.page_size];
        self.io
            .write_at(durability::offset(current_slot, self.page_size)?, &zeroes)?;
        if self.options.synchronous.flushes() {
            self.io.sync_all()?;
        }
        self.cache.lock().clear();
        info!(
            from = current.txn_id.0,
            to = previous.txn_id.0,
            "pager.reverted"
        );
        state.freelist = freelist;
        state.chain = chain;
        state.meta = previous.clone();
        Ok(previous)
    }

    /// Marks both meta slots of this file as retired so that other handles
    /// still holding it stop writing to it. Called once a compacted copy has
    /// been renamed over the path.
    pub fn retire(&self) -> Result<()> {
        let state = self.state.lock();
        let retired = Meta {
            retired: true,
            ..state.meta.clone()
        };
        meta::write_both_slots(self.io.as_ref(), &retired)?;
        info!(path = %self.path.display(), txn = retired.txn_id.0, "pager.retired");
        Ok(())
    }

    /// Transaction counter of the latest commit.
    pub fn last_txn(&self) -> TxnId {
        self.state.lock().meta.txn_id
    }
}

fn load_free_list(io: &dyn FileIo, meta: &Meta) -> Result<(FreeList, Vec<PageId>)> {
    let chain = freelist::read_chain(
        io,
        meta.free_head,
        meta.page_size as usize,
        meta.salt,
        meta.next_page,
    )?;
    let list = FreeList::restore(chain.extents, meta.held_extents, meta.txn_id)?;
    Ok((list, chain.pages))
}
