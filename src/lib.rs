//! Arbor: an embedded, single-file, copy-on-write B+ tree key-value store.
//!
//! One process opens a file with [`Database::open`] and works through
//! [`Transaction`]s: any number of snapshot-isolated readers alongside a
//! single writer. Commits write new pages first and publish them by
//! flipping between two meta pages, so a crash at any point leaves the
//! previous commit intact.

#![warn(missing_docs)]

pub mod admin;
pub mod db;
pub mod primitives;
pub mod storage;
pub mod types;

pub use admin::{CompactReport, DbStat};
pub use db::{Database, DatabaseBuilder, DatabaseOptions, Transaction, TxnState};
pub use primitives::concurrency::LockMode;
pub use primitives::durability::Synchronous;
pub use storage::btree::{Cursor, Iter, WriteMode};
pub use types::{ArborError, KeyOrder, PageId, Result, TxnId};
