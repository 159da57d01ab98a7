use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

/// Snapshot of B+ tree statistics at a point in time.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct BTreeStatsSnapshot {
    /// Number of leaf page splits performed
    pub leaf_splits: u64,
    /// Number of branch page splits performed
    pub branch_splits: u64,
    /// Number of times the tree grew a level
    pub root_splits: u64,
    /// Number of committed pages cloned before modification
    pub cow_clones: u64,
    /// Number of times a single-child branch root was removed
    pub root_collapses: u64,
    /// Number of empty nodes unlinked from their parent by deletes
    pub nodes_unlinked: u64,
    /// Number of overflow pages written for large values
    pub overflow_pages: u64,
}

/// Thread-safe statistics tracking for B+ tree operations.
#[derive(Default)]
pub struct BTreeStats {
    leaf_splits: AtomicU64,
    branch_splits: AtomicU64,
    root_splits: AtomicU64,
    cow_clones: AtomicU64,
    root_collapses: AtomicU64,
    nodes_unlinked: AtomicU64,
    overflow_pages: AtomicU64,
}

impl BTreeStats {
    /// Returns the current count of leaf page splits.
    pub fn leaf_splits(&self) -> u64 {
        self.leaf_splits.load(AtomicOrdering::Relaxed)
    }

    /// Returns the current count of branch page splits.
    pub fn branch_splits(&self) -> u64 {
        self.branch_splits.load(AtomicOrdering::Relaxed)
    }

    /// Returns how many times the tree grew a level.
    pub fn root_splits(&self) -> u64 {
        self.root_splits.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of copy-on-write page clones.
    pub fn cow_clones(&self) -> u64 {
        self.cow_clones.load(AtomicOrdering::Relaxed)
    }

    /// Returns how many times the tree lost a level.
    pub fn root_collapses(&self) -> u64 {
        self.root_collapses.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of empty nodes removed by deletes.
    pub fn nodes_unlinked(&self) -> u64 {
        self.nodes_unlinked.load(AtomicOrdering::Relaxed)
    }

    /// Returns the number of overflow pages written.
    pub fn overflow_pages(&self) -> u64 {
        self.overflow_pages.load(AtomicOrdering::Relaxed)
    }

    pub(crate) fn inc_leaf_splits(&self) {
        self.leaf_splits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_branch_splits(&self) {
        self.branch_splits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_root_splits(&self) {
        self.root_splits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_cow_clones(&self) {
        self.cow_clones.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_root_collapses(&self) {
        self.root_collapses.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_nodes_unlinked(&self) {
        self.nodes_unlinked.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn add_overflow_pages(&self, pages: u64) {
        self.overflow_pages.fetch_add(pages, AtomicOrdering::Relaxed);
    }

    /// Creates a snapshot of all current statistics.
    pub fn snapshot(&self) -> BTreeStatsSnapshot {
        BTreeStatsSnapshot {
            leaf_splits: self.leaf_splits(),
            branch_splits: self.branch_splits(),
            root_splits: self.root_splits(),
            cow_clones: self.cow_clones(),
            root_collapses: self.root_collapses(),
            nodes_unlinked: self.nodes_unlinked(),
            overflow_pages: self.overflow_pages(),
        }
    }

    /// Emits current statistics to the tracing infrastructure.
    pub fn emit_tracing(&self) {
        let snapshot = self.snapshot();
        tracing::info!(
            target: "arbor::btree::stats",
            leaf_splits = snapshot.leaf_splits,
            branch_splits = snapshot.branch_splits,
            root_splits = snapshot.root_splits,
            cow_clones = snapshot.cow_clones,
            root_collapses = snapshot.root_collapses,
            nodes_unlinked = snapshot.nodes_unlinked,
            overflow_pages = snapshot.overflow_pages,
            "btree stats snapshot"
        );
    }
}
