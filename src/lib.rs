//! A transactional key/value storage engine built around a buffered
//! repository tree: a B-tree variant whose internal nodes carry
//! per-child message queues, so writes append a small message near the
//! root instead of touching a leaf. Messages drain towards the leaves
//! lazily, amortizing random I/O; reads replay whatever is still
//! buffered above the leaf they land in.
//!
//! The tree lives behind a page cache that supports partial fetch,
//! partial eviction and non-blocking pinning with try-again unwinding.
//! Durability piggybacks on fuzzy checkpoints against a copy-on-write
//! block store; nothing is ever overwritten in place.
//!
//! ```
//! use brt_storage_engine::{
//!     block::BlockStore, config::EngineConfig, env::Env, message::Xids, tree::Tree,
//! };
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), brt_storage_engine::Error> {
//! let env = Arc::new(Env::new());
//! let store = Arc::new(BlockStore::new());
//! let tree = Tree::create(env, store, EngineConfig::default())?;
//! tree.insert(b"hello", b"world", Xids::root())?;
//! assert_eq!(&*tree.lookup(b"hello")?.unwrap(), b"world");
//! tree.checkpoint()?;
//! # Ok(())
//! # }
//! ```

#[macro_use]
extern crate log;

pub mod block;
pub mod cache;
pub mod checksum;
pub mod compression;
pub mod config;
pub mod cow_bytes;
pub mod env;
pub mod error;
pub mod message;
pub mod size;
pub mod tree;

pub use crate::{
    block::BlockStore,
    config::EngineConfig,
    cow_bytes::{CowBytes, SlicedCowBytes},
    env::Env,
    error::{Error, Result},
    message::{Message, MessageType, Msn, TxnId, Xids},
    tree::{
        imp::{KeyRange, ReadContext, Stat64, Stats},
        Cursor, CursorOutcome, DefaultUpdateAction, Tree, UpdateAction, UpdateResult,
    },
};

/// Initializes `env_logger` for use in tests and examples.
#[cfg(feature = "init_env_logger")]
pub fn init_env_logger() {
    let _ = env_logger::Builder::from_default_env()
        .format_timestamp_millis()
        .try_init();
}
