//! Process-wide engine context.
//!
//! Monotonic counters shared by every dictionary of one environment.
//! They are threaded through this context instead of living in statics.

use crate::{message::TxnId, tree::header::DictId, tree::imp::GcContext};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug)]
pub struct Env {
    /// Bumped by every root ingress; cursors use it to validate their
    /// positional shortcuts.
    root_put_counter: AtomicU64,
    dict_id_serial: AtomicU64,
    /// No live transaction has an id below this.
    oldest_live_txn: AtomicU64,
}

impl Default for Env {
    fn default() -> Self {
        Env::new()
    }
}

impl Env {
    pub fn new() -> Self {
        Env {
            root_put_counter: AtomicU64::new(0),
            dict_id_serial: AtomicU64::new(1),
            // Until the transaction layer proves a watermark, nothing is
            // quiescent and optimize messages must not promote anything.
            oldest_live_txn: AtomicU64::new(TxnId::NONE.0),
        }
    }

    pub fn root_put_counter(&self) -> u64 {
        self.root_put_counter.load(Ordering::Relaxed)
    }

    pub(crate) fn bump_root_put(&self) -> u64 {
        self.root_put_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn next_dict_id(&self) -> DictId {
        DictId(self.dict_id_serial.fetch_add(1, Ordering::Relaxed))
    }

    /// Declares the oldest transaction id still live. Optimize messages
    /// promote provisional entries older than this.
    pub fn set_oldest_live_txn(&self, txn: TxnId) {
        self.oldest_live_txn.store(txn.0, Ordering::Relaxed);
    }

    pub(crate) fn gc(&self) -> GcContext {
        GcContext {
            oldest_live: TxnId(self.oldest_live_txn.load(Ordering::Relaxed)),
        }
    }
}
