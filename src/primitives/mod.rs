//! Low-level primitives for building the storage engine.
//!
//! Includes positioned file I/O, writer and reader coordination, the
//! commit ordering used for durability, and the paging subsystem.

/// Writer lock and reader registration.
pub mod concurrency;

/// Ordered write and fsync sequence for publishing a commit.
pub mod durability;

/// I/O abstractions and utilities.
///
/// Interfaces for reading/writing data and file operations.
pub mod io;

/// Paging subsystem: meta slots, page cache, and free-page accounting.
pub mod pager;
