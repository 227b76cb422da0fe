//! Block table: logical block numbers and their backing store.
//!
//! The tree treats allocation as a black box. Nodes are always written
//! to their logical block as a whole; during a checkpoint, writes go to
//! shadow locations that replace the committed ones only when the
//! checkpoint ends.

use crate::{
    error::{Error, Result},
    size::StaticSize,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Logical id of an on-disk node, translated by the block table.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Blocknum(pub u64);

impl Blocknum {
    /// Reserved for the dictionary header.
    pub const HEADER: Blocknum = Blocknum(0);
}

impl StaticSize for Blocknum {
    fn static_size() -> usize {
        8
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct BlockStoreInner {
    next: u64,
    free: Vec<u64>,
    blocks: HashMap<u64, Vec<u8>>,
    /// Writes staged by an in-progress checkpoint. Promoted on end,
    /// discarded on crash.
    #[serde(skip)]
    shadow: HashMap<u64, Vec<u8>>,
    /// Optional budget; exhausting it reports disk-full.
    capacity: Option<u64>,
}

/// In-memory block store standing in for the block-allocation layer.
#[derive(Debug)]
pub struct BlockStore {
    inner: Mutex<BlockStoreInner>,
}

impl Default for BlockStore {
    fn default() -> Self {
        BlockStore::new()
    }
}

impl BlockStore {
    pub fn new() -> Self {
        BlockStore {
            inner: Mutex::new(BlockStoreInner {
                // Block 0 is the header.
                next: 1,
                ..BlockStoreInner::default()
            }),
        }
    }

    /// Limits the total stored bytes, for exercising disk-full paths.
    pub fn with_capacity(capacity: u64) -> Self {
        let store = BlockStore::new();
        store.inner.lock().capacity = Some(capacity);
        store
    }

    /// Hands out a fresh logical block number.
    pub fn allocate(&self) -> Blocknum {
        let mut inner = self.inner.lock();
        match inner.free.pop() {
            Some(n) => Blocknum(n),
            None => {
                let n = inner.next;
                inner.next += 1;
                Blocknum(n)
            }
        }
    }

    /// Returns a blocknum to the free list. The caller guarantees no
    /// live reference remains.
    pub fn free(&self, bn: Blocknum) {
        let mut inner = self.inner.lock();
        inner.blocks.remove(&bn.0);
        inner.shadow.remove(&bn.0);
        inner.free.push(bn.0);
    }

    /// Stores serialized bytes for `bn`. With `for_checkpoint` the old
    /// location survives until [BlockStore::end_checkpoint].
    pub fn write(&self, bn: Blocknum, data: Vec<u8>, for_checkpoint: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(cap) = inner.capacity {
            let used: u64 = inner.blocks.values().map(|b| b.len() as u64).sum();
            if used + data.len() as u64 > cap {
                return Err(Error::DiskFull);
            }
        }
        if for_checkpoint {
            inner.shadow.insert(bn.0, data);
        } else {
            inner.blocks.insert(bn.0, data);
        }
        Ok(())
    }

    pub fn read(&self, bn: Blocknum) -> Result<Vec<u8>> {
        let inner = self.inner.lock();
        // A checkpoint shadow is the newest committed-to-be state for
        // readers inside this process.
        inner
            .shadow
            .get(&bn.0)
            .or_else(|| inner.blocks.get(&bn.0))
            .cloned()
            .ok_or_else(|| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no block {:?}", bn),
                ))
            })
    }

    /// Total bytes of committed blocks.
    pub fn used_bytes(&self) -> u64 {
        self.inner
            .lock()
            .blocks
            .values()
            .map(|b| b.len() as u64)
            .sum()
    }

    /// Promotes shadow locations, releasing the old ones. The moment
    /// this returns, the checkpoint is the committed state.
    pub fn end_checkpoint(&self) {
        let mut inner = self.inner.lock();
        let shadow = std::mem::take(&mut inner.shadow);
        inner.blocks.extend(shadow);
    }

    /// Drops staged shadow writes, as a crash would.
    pub fn abort_checkpoint(&self) {
        self.inner.lock().shadow.clear();
    }

    /// Serializes the committed state. Shadow writes are not included;
    /// reopening from this image observes the last finished checkpoint.
    pub fn freeze(&self) -> Vec<u8> {
        let inner = self.inner.lock();
        bincode::serialize(&*inner).expect("block store is serializable")
    }

    /// Reopens a store from a [BlockStore::freeze] image.
    pub fn thaw(image: &[u8]) -> Result<Self> {
        let inner: BlockStoreInner = bincode::deserialize(image)
            .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
        Ok(BlockStore {
            inner: Mutex::new(inner),
        })
    }
}
