use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use super::options::{DatabaseBuilder, DatabaseOptions};
use super::transaction::Transaction;
use crate::admin::{self, CompactReport, DbStat};
use crate::primitives::concurrency::WriterLock;
use crate::primitives::io::FileIo;
use crate::primitives::pager::{Pager, PagerStats};
use crate::storage::btree::{BTreeStats, BTreeStatsSnapshot, WriteMode};
use crate::types::{ArborError, Result, TxnId};

/// Handle to an open database file.
///
/// A handle is `Sync`: any number of read transactions can run alongside
/// the single write transaction, from one thread or many.
pub struct Database {
    path: PathBuf,
    options: DatabaseOptions,
    store: RwLock<Arc<Pager>>,
    writer: WriterLock,
    file_backed: bool,
    stats: Arc<BTreeStats>,
}

impl Database {
    /// Opens or creates the database at `path` with default options.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_options(path, DatabaseOptions::default())
    }

    /// Returns a builder for non-default options.
    pub fn builder() -> DatabaseBuilder {
        DatabaseBuilder::new()
    }

    /// Opens or creates the database at `path`, applying the unix permission
    /// bits `mode` if the file is created.
    pub fn open_with_permissions(path: impl AsRef<Path>, mode: u32) -> Result<Self> {
        Self::builder().open_with_permissions(path, mode)
    }

    /// Opens or creates the database at `path` with `options`.
    pub fn open_with_options(path: impl AsRef<Path>, options: DatabaseOptions) -> Result<Self> {
        let path = path.as_ref();
        let pager = Pager::open(path, options.pager.clone())?;
        let writer = if options.pager.read_only {
            WriterLock::in_process()
        } else {
            WriterLock::open(path)?
        };
        info!(
            path = %path.display(),
            page_size = pager.page_size(),
            txn = pager.last_txn().0,
            read_only = options.pager.read_only,
            "db.opened"
        );
        Ok(Self {
            path: path.to_path_buf(),
            options,
            store: RwLock::new(Arc::new(pager)),
            writer,
            file_backed: true,
            stats: Arc::new(BTreeStats::default()),
        })
    }

    /// Opens a database over a caller-supplied [`FileIo`].
    ///
    /// `path` only names the database in log output. Such a handle cannot be
    /// compacted or reopened, and writers are only excluded within this
    /// process.
    pub fn open_with_io(
        path: impl AsRef<Path>,
        io: Arc<dyn FileIo>,
        options: DatabaseOptions,
    ) -> Result<Self> {
        let path = path.as_ref();
        let pager = Pager::open_with_io(path, io, options.pager.clone())?;
        Ok(Self {
            path: path.to_path_buf(),
            options,
            store: RwLock::new(Arc::new(pager)),
            writer: WriterLock::in_process(),
            file_backed: false,
            stats: Arc::new(BTreeStats::default()),
        })
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Options the database was opened with.
    pub fn options(&self) -> &DatabaseOptions {
        &self.options
    }

    /// Returns true when the database was opened read-only.
    pub fn is_read_only(&self) -> bool {
        self.options.pager.read_only
    }

    /// Current store. Blocks while a compaction is swapping files.
    fn pager(&self) -> Arc<Pager> {
        Arc::clone(&self.store.read())
    }

    pub(crate) fn tree_stats(&self) -> Arc<BTreeStats> {
        Arc::clone(&self.stats)
    }

    /// Begins a transaction; `read_only` selects a reader.
    pub fn begin(&self, read_only: bool) -> Result<Transaction<'_>> {
        if read_only {
            Ok(self.begin_read())
        } else {
            self.begin_write()
        }
    }

    /// Begins a read transaction on the latest committed snapshot.
    pub fn begin_read(&self) -> Transaction<'_> {
        Transaction::read(self, self.pager())
    }

    /// Begins the write transaction.
    ///
    /// With [`LockMode::FailFast`](crate::LockMode::FailFast) this fails with
    /// [`ArborError::LockBusy`] while another writer is active; with
    /// [`LockMode::Block`](crate::LockMode::Block) it waits. Fails with
    /// [`ArborError::StaleHandle`] once another handle has compacted the file.
    pub fn begin_write(&self) -> Result<Transaction<'_>> {
        if self.is_read_only() {
            return Err(ArborError::ReadOnly);
        }
        let guard = self.writer.acquire(self.options.lock_mode)?;
        let pager = self.pager();
        if self.file_backed {
            pager.refresh()?;
        }
        Transaction::write(self, guard, pager)
    }

    /// Looks up `key` in the latest committed snapshot.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.begin_read().get(key)?.ok_or(ArborError::NotFound)
    }

    /// Inserts or replaces `key` in a transaction of its own.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut txn = self.begin_write()?;
        txn.put_with(key, value, WriteMode::Upsert)?;
        txn.commit()
    }

    /// Removes `key` in a transaction of its own.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        let mut txn = self.begin_write()?;
        txn.delete(key)?;
        txn.commit()
    }

    /// Flushes the database file to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.pager().sync()
    }

    /// Flushes and closes the database.
    pub fn close(self) -> Result<()> {
        self.sync()?;
        info!(path = %self.path.display(), "db.closed");
        Ok(())
    }

    /// Closes and reopens the underlying file, picking up changes made by
    /// other processes and dropping every cached page.
    pub fn reopen(&mut self) -> Result<()> {
        if !self.file_backed {
            return Err(ArborError::Invalid("database was not opened from a path"));
        }
        self.sync()?;
        let pager = Pager::open(&self.path, self.options.pager.clone())?;
        info!(
            path = %self.path.display(),
            txn = pager.last_txn().0,
            "db.reopened"
        );
        *self.store.get_mut() = Arc::new(pager);
        Ok(())
    }

    /// Discards the most recent commit, making the previous one current.
    ///
    /// Takes the writer lock, and fails with [`ArborError::LockBusy`] while
    /// read transactions are active.
    pub fn revert(&self) -> Result<TxnId> {
        if self.is_read_only() {
            return Err(ArborError::ReadOnly);
        }
        let _guard = self.writer.acquire(self.options.lock_mode)?;
        let pager = self.pager();
        if self.file_backed {
            pager.refresh()?;
        }
        Ok(pager.revert()?.txn_id)
    }

    /// Rewrites the live pages into a fresh file and swaps it in.
    ///
    /// New transactions wait until the swap completes. Read transactions
    /// that began earlier keep reading the previous file. Any other handle
    /// open on the same path fails its next write with
    /// [`ArborError::StaleHandle`] until it is reopened.
    pub fn compact(&self) -> Result<CompactReport> {
        if self.is_read_only() {
            return Err(ArborError::ReadOnly);
        }
        if !self.file_backed {
            return Err(ArborError::Invalid("database was not opened from a path"));
        }
        let _guard = self.writer.acquire(self.options.lock_mode)?;
        let mut store = self.store.write();
        store.refresh()?;
        let (pager, report) = admin::compact::rewrite(&store)?;
        let retired = std::mem::replace(&mut *store, Arc::new(pager));
        drop(store);
        // Other handles may still hold the unlinked file; they see the flag
        // on their next write and must reopen.
        if let Err(err) = retired.retire() {
            warn!(path = %self.path.display(), error = %err, "db.compact.retire_failed");
            return Err(err);
        }
        Ok(report)
    }

    /// Shape and size of the latest committed tree.
    pub fn stat(&self) -> Result<DbStat> {
        admin::stat::collect(&self.pager())
    }

    /// Counters of B+ tree structural events since open.
    pub fn btree_stats(&self) -> BTreeStatsSnapshot {
        self.stats.snapshot()
    }

    /// Page cache and commit counters of the current store.
    pub fn pager_stats(&self) -> PagerStats {
        self.pager().stats()
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.path)
            .field("options", &self.options)
            .finish()
    }
}
