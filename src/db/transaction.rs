use std::sync::Arc;

use tracing::{debug, warn};

use super::arena::PageArena;
use super::Database;
use crate::primitives::concurrency::WriterGuard;
use crate::primitives::pager::{Meta, Pager, Snapshot};
use crate::storage::btree::{self, Cursor, Iter, PageSource, TreeRoot, WriteMode};
use crate::types::{ArborError, PageId, Result, TxnId};

/// The state of a transaction.
///
/// Transactions start `Active` and end in exactly one of the terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    /// The transaction accepts operations.
    Active,
    /// The transaction committed; for readers, its snapshot was released.
    Committed,
    /// The transaction was aborted or dropped.
    Aborted,
}

/// A read or write transaction on a [`Database`].
///
/// Read transactions see the snapshot that was current when they began,
/// regardless of later commits or compactions. Write transactions hold the
/// writer lock until they commit, abort or are dropped. Dropping an active
/// transaction aborts it.
///
/// # Example
///
/// ```no_run
/// use arbor::Database;
///
/// let db = Database::open("example.arbor")?;
/// let mut txn = db.begin_write()?;
/// txn.put(b"hello", b"world")?;
/// txn.commit()?;
///
/// let txn = db.begin_read();
/// assert_eq!(txn.get(b"hello")?, Some(b"world".to_vec()));
/// # Ok::<(), arbor::ArborError>(())
/// ```
pub struct Transaction<'db> {
    db: &'db Database,
    id: TxnId,
    state: TxnState,
    kind: Option<Kind>,
}

enum Kind {
    Read(ReadView),
    Write(Box<WriteView>),
}

struct ReadView {
    pager: Arc<Pager>,
    snapshot: Snapshot,
}

// Field order matters: the arena goes before the guard so the writer lock is
// released last.
struct WriteView {
    arena: PageArena,
    base: Meta,
    tree: TreeRoot,
    _guard: WriterGuard,
}

const FINISHED: ArborError = ArborError::TransactionState("transaction already finished");

impl<'db> Transaction<'db> {
    pub(crate) fn read(db: &'db Database, pager: Arc<Pager>) -> Self {
        let snapshot = pager.begin_snapshot();
        let id = snapshot.meta().txn_id;
        debug!(txn = id.0, "db.txn.begin_read");
        Self {
            db,
            id,
            state: TxnState::Active,
            kind: Some(Kind::Read(ReadView { pager, snapshot })),
        }
    }

    pub(crate) fn write(
        db: &'db Database,
        guard: WriterGuard,
        pager: Arc<Pager>,
    ) -> Result<Self> {
        let (base, allocator) = pager.writer_allocator()?;
        let tree = TreeRoot {
            root: base.root,
            depth: base.depth,
            entries: base.entries,
        };
        let id = base.txn_id.next();
        debug!(txn = id.0, base = base.txn_id.0, "db.txn.begin_write");
        let arena = PageArena::new(pager, allocator, db.tree_stats());
        Ok(Self {
            db,
            id,
            state: TxnState::Active,
            kind: Some(Kind::Write(Box::new(WriteView {
                arena,
                base,
                tree,
                _guard: guard,
            }))),
        })
    }

    /// Transaction counter of the snapshot for readers; for writers, the
    /// counter the transaction commits under.
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Current state of the transaction.
    pub fn state(&self) -> TxnState {
        self.state
    }

    /// Returns true for transactions started with `begin_read`.
    pub fn is_read_only(&self) -> bool {
        !matches!(self.kind, Some(Kind::Write(_)))
    }

    /// The database this transaction belongs to.
    pub fn database(&self) -> &'db Database {
        self.db
    }

    fn view(&self) -> Result<(&dyn PageSource, PageId)> {
        match &self.kind {
            Some(Kind::Read(read)) => Ok((read.pager.as_ref() as &dyn PageSource, read.snapshot.meta().root)),
            Some(Kind::Write(write)) => Ok((&write.arena as &dyn PageSource, write.tree.root)),
            None => Err(FINISHED),
        }
    }

    fn write_view(&mut self) -> Result<&mut WriteView> {
        match &mut self.kind {
            Some(Kind::Write(write)) => Ok(write),
            Some(Kind::Read(_)) => Err(ArborError::TransactionState("write on a read transaction")),
            None => Err(FINISHED),
        }
    }

    /// Looks up `key` in the transaction's view.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let (src, root) = self.view()?;
        btree::get(src, root, key)
    }

    /// Number of keys visible to the transaction.
    pub fn entries(&self) -> Result<u64> {
        match &self.kind {
            Some(Kind::Read(read)) => Ok(read.snapshot.meta().entries),
            Some(Kind::Write(write)) => Ok(write.tree.entries),
            None => Err(FINISHED),
        }
    }

    /// Inserts or replaces `key`.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.put_with(key, value, WriteMode::Upsert)
    }

    /// Inserts `key` according to `mode`.
    ///
    /// Argument errors ([`ArborError::Invalid`], [`ArborError::KeyExists`])
    /// leave the transaction active. Any other error aborts it.
    pub fn put_with(&mut self, key: &[u8], value: &[u8], mode: WriteMode) -> Result<()> {
        let write = self.write_view()?;
        let result = btree::put(&mut write.arena, &mut write.tree, key, value, mode);
        self.settle(result)
    }

    /// Removes `key`, failing with [`ArborError::NotFound`] when it is absent.
    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        let write = self.write_view()?;
        let result = btree::delete(&mut write.arena, &mut write.tree, key);
        self.settle(result)
    }

    /// Opens an unpositioned cursor over the transaction's view.
    pub fn cursor(&self) -> Result<Cursor<'_>> {
        let (src, root) = self.view()?;
        Ok(Cursor::new(src, root))
    }

    /// Iterates over all entries in key order.
    pub fn iter(&self) -> Result<Iter<'_>> {
        Ok(Iter::new(self.cursor()?, None))
    }

    /// Iterates over entries with keys at or after `start`.
    pub fn iter_from(&self, start: &[u8]) -> Result<Iter<'_>> {
        Ok(Iter::new(self.cursor()?, Some(start.to_vec())))
    }

    fn settle<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if is_fault(err) {
                warn!(txn = self.id.0, error = %err, "db.txn.aborted_on_error");
                self.kind = None;
                self.state = TxnState::Aborted;
            }
        }
        result
    }

    /// Commits the transaction.
    ///
    /// For a writer, dirty pages are written and flushed before the new meta
    /// page is published. A writer that changed nothing publishes nothing.
    /// For a reader, commit only releases the snapshot.
    pub fn commit(&mut self) -> Result<()> {
        let kind = self.kind.take().ok_or(FINISHED)?;
        let write = match kind {
            Kind::Read(read) => {
                drop(read);
                self.state = TxnState::Committed;
                debug!(txn = self.id.0, "db.txn.read_released");
                return Ok(());
            }
            Kind::Write(write) => write,
        };
        let WriteView {
            arena,
            base,
            tree,
            _guard,
        } = *write;
        if arena.is_clean() {
            self.state = TxnState::Committed;
            debug!(txn = self.id.0, "db.commit.empty");
            return Ok(());
        }
        let pager = Arc::clone(arena.pager());
        let dirty = arena.dirty_pages();
        let published = arena
            .into_pending(tree)
            .and_then(|pending| pager.commit(&base, pending));
        match published {
            Ok(meta) => {
                self.state = TxnState::Committed;
                debug!(
                    txn = meta.txn_id.0,
                    dirty,
                    entries = meta.entries,
                    "db.commit"
                );
                Ok(())
            }
            Err(err) => {
                self.state = TxnState::Aborted;
                warn!(txn = self.id.0, error = %err, "db.commit.failed");
                Err(err)
            }
        }
    }

    /// Aborts the transaction, discarding every change it made.
    pub fn abort(&mut self) -> Result<()> {
        let kind = self.kind.take().ok_or(FINISHED)?;
        self.state = TxnState::Aborted;
        if let Kind::Write(write) = &kind {
            debug!(
                txn = self.id.0,
                dirty = write.arena.dirty_pages(),
                "db.txn.abort"
            );
        }
        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.state == TxnState::Active {
            let _ = self.abort();
        }
    }
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("read_only", &self.is_read_only())
            .finish()
    }
}

/// Errors that reflect a problem with the arguments rather than with the
/// engine; they leave a write transaction usable.
fn is_fault(err: &ArborError) -> bool {
    !matches!(
        err,
        ArborError::NotFound | ArborError::KeyExists | ArborError::Invalid(_)
    )
}
