use std::path::Path;

use crate::primitives::concurrency::LockMode;
use crate::primitives::durability::Synchronous;
use crate::primitives::pager::PagerOptions;
use crate::types::{KeyOrder, Result};

use super::Database;

/// Options used when opening a [`Database`].
#[derive(Clone, Debug, Default)]
pub struct DatabaseOptions {
    /// Page manager settings.
    pub pager: PagerOptions,
    /// What `begin_write` does while another writer is active.
    pub lock_mode: LockMode,
}

impl DatabaseOptions {
    /// Options for opening an existing file without write access.
    pub fn read_only() -> Self {
        Self {
            pager: PagerOptions {
                read_only: true,
                ..PagerOptions::default()
            },
            ..Self::default()
        }
    }
}

/// Builder for [`Database`] handles.
///
/// ```no_run
/// use arbor::{Database, Synchronous};
///
/// let db = Database::builder()
///     .page_size(8192)
///     .synchronous(Synchronous::Off)
///     .open("data.arbor")?;
/// # Ok::<(), arbor::ArborError>(())
/// ```
#[derive(Clone, Debug, Default)]
pub struct DatabaseBuilder {
    options: DatabaseOptions,
}

impl DatabaseBuilder {
    /// Starts from the default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the file without write access.
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.options.pager.read_only = read_only;
        self
    }

    /// Sets the fsync policy applied at commit.
    pub fn synchronous(mut self, synchronous: Synchronous) -> Self {
        self.options.pager.synchronous = synchronous;
        self
    }

    /// Sets the key collation of a newly created file.
    pub fn key_order(mut self, order: KeyOrder) -> Self {
        self.options.pager.key_order = order;
        self
    }

    /// Sets the number of pages kept in the page cache.
    pub fn cache_size(mut self, pages: usize) -> Self {
        self.options.pager.cache_pages = pages;
        self
    }

    /// Sets the page size of a newly created file.
    pub fn page_size(mut self, bytes: u32) -> Self {
        self.options.pager.page_size = bytes;
        self
    }

    /// Sets the writer lock behaviour.
    pub fn lock_mode(mut self, mode: LockMode) -> Self {
        self.options.lock_mode = mode;
        self
    }

    /// Caps the file size in pages; allocations past it fail with `OutOfSpace`.
    pub fn max_pages(mut self, pages: u64) -> Self {
        self.options.pager.max_pages = Some(pages);
        self
    }

    /// Returns the options built so far.
    pub fn options(&self) -> &DatabaseOptions {
        &self.options
    }

    /// Opens or creates the database at `path`.
    pub fn open(self, path: impl AsRef<Path>) -> Result<Database> {
        Database::open_with_options(path, self.options)
    }

    /// Opens or creates the database at `path`, applying the unix permission
    /// bits `mode` if the file is created.
    pub fn open_with_permissions(mut self, path: impl AsRef<Path>, mode: u32) -> Result<Database> {
        self.options.pager.permissions = Some(mode);
        Database::open_with_options(path, self.options)
    }
}
