#![forbid(unsafe_code)]

//! Maintenance operations on an open database.
//!
//! Compaction rewrites the live tree into a fresh file; `stat` reports the
//! shape of the current tree. Both are reached through
//! [`Database`](crate::Database) methods.

pub(crate) mod compact;
pub(crate) mod stat;

pub use compact::{staging_path, CompactReport};
pub use stat::DbStat;
