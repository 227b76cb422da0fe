//! The dictionary header and its checkpoint discipline.

use crate::{
    block::{BlockStore, Blocknum},
    error::{Error, Result},
    message::TxnId,
};
use serde::{Deserialize, Serialize};

/// Log sequence number of the last finished checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Lsn(pub u64);

/// Per-environment serial identifying one dictionary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DictId(pub u64);

const HEADER_LAYOUT_VERSION: u32 = 1;

/// The durable root of one dictionary.
///
/// A checkpoint clones the live header into a `CHECKPOINT_INPROGRESS`
/// twin sharing the block table; node writes go to shadow locations and
/// the twin is committed at end-of-checkpoint. A recorded panic poisons
/// every subsequent operation and makes checkpoints refuse to write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Header {
    pub layout_version: u32,
    pub dict_id: DictId,
    pub root: Blocknum,
    pub checkpoint_count: u64,
    pub checkpoint_lsn: Lsn,
    pub nodesize: u32,
    pub basementsize: u32,
    pub flags: u32,
    /// Outermost transaction live when the dictionary was created;
    /// snapshots older than this cannot read it.
    pub created_txn: TxnId,
    /// Set again by every mutation after a checkpoint cleared it.
    #[serde(skip)]
    pub dirty: bool,
    /// Non-recoverable error state; never persisted.
    #[serde(skip)]
    pub panic: Option<(i32, String)>,
}

impl Header {
    pub fn new(dict_id: DictId, root: Blocknum, nodesize: u32, basementsize: u32) -> Self {
        Header {
            layout_version: HEADER_LAYOUT_VERSION,
            dict_id,
            root,
            checkpoint_count: 0,
            checkpoint_lsn: Lsn(0),
            nodesize,
            basementsize,
            flags: 0,
            created_txn: TxnId::NONE,
            dirty: true,
            panic: None,
        }
    }

    /// Records a non-recoverable error. First writer wins.
    pub fn set_panic(&mut self, code: i32, reason: String) {
        if self.panic.is_none() {
            log::error!("dictionary panicked: {} (code {})", reason, code);
            self.panic = Some((code, reason));
        }
    }

    /// The poisoned-state error, if any.
    pub fn panicked(&self) -> Result<()> {
        match &self.panic {
            None => Ok(()),
            Some((code, reason)) => Err(Error::Panicked {
                code: *code,
                reason: reason.clone(),
            }),
        }
    }

    /// The `CHECKPOINT_INPROGRESS` twin: a snapshot of the live header
    /// taken at checkpoint begin. Clears the live dirty bit; mutations
    /// after this point set it again and belong to the next checkpoint.
    pub fn clone_for_checkpoint(&mut self) -> Header {
        self.dirty = false;
        let mut twin = self.clone();
        twin.panic = None;
        twin
    }

    /// Persists this header at its reserved block.
    pub fn write_to(&self, store: &BlockStore) -> Result<()> {
        let bytes = bincode::serialize(self)
            .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
        store.write(Blocknum::HEADER, bytes, false)
    }

    /// Loads the committed header.
    pub fn read_from(store: &BlockStore) -> Result<Header> {
        let bytes = store.read(Blocknum::HEADER)?;
        bincode::deserialize(&bytes)
            .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let store = BlockStore::new();
        let mut header = Header::new(DictId(3), Blocknum(1), 4096, 512);
        header.checkpoint_lsn = Lsn(9);
        header.write_to(&store).unwrap();
        let restored = Header::read_from(&store).unwrap();
        assert_eq!(restored.dict_id, DictId(3));
        assert_eq!(restored.root, Blocknum(1));
        assert_eq!(restored.checkpoint_lsn, Lsn(9));
        assert!(!restored.dirty);
        assert!(restored.panic.is_none());
    }

    #[test]
    fn panic_poisons() {
        let mut header = Header::new(DictId(1), Blocknum(1), 4096, 512);
        assert!(header.panicked().is_ok());
        header.set_panic(5, "flush failed".into());
        // First panic wins.
        header.set_panic(9, "later".into());
        match header.panicked() {
            Err(Error::Panicked { code: 5, .. }) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }
}
