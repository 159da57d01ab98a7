//! Storage engine data structures.

/// Copy-on-write B+ tree.
///
/// Ordered byte-key storage over pager pages, plus cursors and structural
/// counters.
pub mod btree;
