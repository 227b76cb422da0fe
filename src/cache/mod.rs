//! The contract between the tree and the page cache.
//!
//! The cache owns node memory and the handles; the tree owns the
//! deserialized bodies behind them and supplies one [NodeAdapter] that
//! bundles serialization, partial fetch and partial eviction. Pins are
//! the only suspension points: the non-blocking flavor never waits for
//! I/O, it reports [PinOutcome::NeedRetry] and the caller unwinds.

use crate::{block::Blocknum, error::Result};

mod pager;
pub use pager::{CacheStats, Pager, PinGuard};

/// Result of a non-blocking pin.
#[derive(Debug)]
pub enum PinOutcome<T> {
    Pinned(T),
    /// Satisfying the pin needs I/O. All ancestor pins of the current
    /// descent must be released before retrying.
    NeedRetry,
}

impl<T> PinOutcome<T> {
    pub fn is_retry(&self) -> bool {
        matches!(self, PinOutcome::NeedRetry)
    }
}

/// How a pin waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinFlavor {
    /// May perform synchronous I/O.
    Blocking,
    /// Returns [PinOutcome::NeedRetry] instead of performing I/O.
    NonBlocking,
}

/// Serialization and memory-management hooks for the objects one cache
/// instance manages.
pub trait NodeAdapter {
    type Node;
    /// Selects which parts of a node a fetch materializes.
    type Hint;

    /// Writes the node back for eviction or checkpoint. Invoked only
    /// when the node is dirty or the write is forced.
    fn flush(&self, node: &mut Self::Node, for_checkpoint: bool) -> Result<()>;

    /// Reads and deserializes the node, honoring `hint`.
    fn fetch(&self, bn: Blocknum, hint: &Self::Hint) -> Result<Self::Node>;

    /// True iff a partition `hint` needs is not resident.
    fn partial_fetch_required(&self, node: &Self::Node, hint: &Self::Hint) -> bool;

    /// Whether the pending partial fetch can complete without touching
    /// disk (e.g. pure decompression).
    fn partial_fetch_is_cheap(&self, node: &Self::Node, hint: &Self::Hint) -> bool;

    /// Makes the partitions `hint` needs resident.
    fn partial_fetch(&self, node: &mut Self::Node, hint: &Self::Hint) -> Result<()>;

    /// Reclaims memory from aged-out partitions of a clean node.
    /// Returns the number of bytes freed.
    fn partial_evict(&self, node: &mut Self::Node) -> Result<usize>;

    fn is_dirty(&self, node: &Self::Node) -> bool;

    fn mark_clean(&self, node: &mut Self::Node);

    /// Current in-memory footprint attributed to the cache.
    fn memory_size(&self, node: &Self::Node) -> usize;
}
