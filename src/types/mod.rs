//! Identifiers, the error taxonomy, and the shared on-disk page header.

#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::fmt;
use std::io;

/// Page checksum helpers.
pub mod checksum;
/// Fixed page header layout shared by every page kind.
pub mod page;

pub use checksum::page_crc32;

/// Identifier of a fixed-size page; the page lives at `id * page_size`.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct PageId(pub u64);

impl PageId {
    /// Sentinel used for "no page" (page 0 is always a meta page).
    pub const NONE: PageId = PageId(0);

    /// Returns true when this id is the [`PageId::NONE`] sentinel.
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

/// Monotonic transaction counter stored in the meta pages.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct TxnId(pub u64);

impl TxnId {
    /// Returns the counter of the transaction following this one.
    pub fn next(self) -> TxnId {
        TxnId(self.0 + 1)
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Collation applied to keys.
///
/// The order is fixed when a database file is created and recorded in its
/// meta pages.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum KeyOrder {
    /// Plain lexicographic byte order (shorter prefix sorts first).
    #[default]
    Forward,
    /// Keys are compared from their last byte towards their first.
    Reverse,
}

impl KeyOrder {
    /// Compares two keys under this collation.
    pub fn compare(self, a: &[u8], b: &[u8]) -> Ordering {
        match self {
            KeyOrder::Forward => a.cmp(b),
            KeyOrder::Reverse => a.iter().rev().cmp(b.iter().rev()),
        }
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            KeyOrder::Forward => 0,
            KeyOrder::Reverse => 1,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(KeyOrder::Forward),
            1 => Ok(KeyOrder::Reverse),
            _ => Err(ArborError::Corruption("unknown key order")),
        }
    }
}

/// Errors surfaced by the storage engine.
#[derive(thiserror::Error, Debug)]
pub enum ArborError {
    /// Open, read, write or fsync failure.
    #[error("IO: {0}")]
    Io(io::Error),
    /// A meta or tree page failed validation.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// The device is full or the page id space is exhausted.
    #[error("out of space")]
    OutOfSpace,
    /// The key is not present.
    #[error("key not found")]
    NotFound,
    /// `NoOverwrite` put on a key that already exists.
    #[error("key already exists")]
    KeyExists,
    /// The transaction has already committed or aborted, or the call is not
    /// valid for its kind.
    #[error("transaction state: {0}")]
    TransactionState(&'static str),
    /// Another write transaction is active.
    #[error("writer lock busy")]
    LockBusy,
    /// A write was attempted on a database opened read-only.
    #[error("database opened read-only")]
    ReadOnly,
    /// The caller supplied an unusable argument.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// The file behind this handle was replaced by a compaction; reopen it.
    #[error("stale handle: database file was compacted")]
    StaleHandle,
}

impl From<io::Error> for ArborError {
    fn from(err: io::Error) -> Self {
        #[cfg(unix)]
        {
            if err.raw_os_error() == Some(libc::ENOSPC) {
                return ArborError::OutOfSpace;
            }
        }
        ArborError::Io(err)
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, ArborError>;
