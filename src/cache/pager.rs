//! A cache table over one block store.
//!
//! Second-chance eviction at node granularity, delegating to the
//! adapter's partial eviction first so partitions age out before whole
//! nodes do.

use super::{NodeAdapter, PinFlavor, PinOutcome};
use crate::{block::Blocknum, error::Result};
use parking_lot::{lock_api::ArcRwLockWriteGuard, RawRwLock, RwLock};
use std::{
    collections::HashMap,
    ops::{Deref, DerefMut},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

type NodeGuard<N> = ArcRwLockWriteGuard<RawRwLock, N>;

#[derive(Debug, Default)]
struct EntryMeta {
    pins: AtomicUsize,
    size: AtomicUsize,
    /// Second-chance bit.
    hot: AtomicBool,
    /// Set when the entry left the table while still pinned.
    removed: AtomicBool,
}

struct Entry<N> {
    node: Arc<RwLock<N>>,
    meta: Arc<EntryMeta>,
}

impl<N> Clone for Entry<N> {
    fn clone(&self) -> Self {
        Entry {
            node: self.node.clone(),
            meta: self.meta.clone(),
        }
    }
}

/// Cache counters, exposed through [crate::tree::Stats].
#[derive(Debug, Default)]
pub struct CacheStats {
    fetches: AtomicU64,
    partial_fetches: AtomicU64,
    partial_evictions: AtomicU64,
    evictions: AtomicU64,
    retries: AtomicU64,
}

impl CacheStats {
    pub fn fetches(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    pub fn partial_fetches(&self) -> u64 {
        self.partial_fetches.load(Ordering::Relaxed)
    }

    pub fn partial_evictions(&self) -> u64 {
        self.partial_evictions.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }
}

/// The cache table.
pub struct Pager<A: NodeAdapter> {
    adapter: A,
    cache_bytes: usize,
    table: RwLock<HashMap<Blocknum, Entry<A::Node>>>,
    total: AtomicUsize,
    stats: CacheStats,
    /// Countdown of non-blocking pins forced to report retry, for
    /// exercising the unwind path.
    force_retry: AtomicUsize,
}

impl<A: NodeAdapter> Pager<A> {
    pub fn new(adapter: A, cache_bytes: usize) -> Self {
        Pager {
            adapter,
            cache_bytes,
            table: RwLock::new(HashMap::new()),
            total: AtomicUsize::new(0),
            stats: CacheStats::default(),
            force_retry: AtomicUsize::new(0),
        }
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Bytes currently attributed to resident nodes.
    pub fn total_bytes(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }

    /// Forces the next `n` non-blocking pins to report
    /// [PinOutcome::NeedRetry].
    pub fn force_retries(&self, n: usize) {
        self.force_retry.store(n, Ordering::Relaxed);
    }

    fn lock_entry(&self, entry: &Entry<A::Node>, flavor: PinFlavor) -> Option<NodeGuard<A::Node>> {
        match entry.node.try_write_arc() {
            Some(guard) => Some(guard),
            None => match flavor {
                PinFlavor::Blocking => Some(entry.node.write_arc()),
                PinFlavor::NonBlocking => None,
            },
        }
    }

    /// Inserts a freshly created node and returns it pinned. The node
    /// starts dirty; it has no on-disk form yet.
    pub fn insert_new(&self, bn: Blocknum, node: A::Node) -> PinGuard<'_, A> {
        let size = self.adapter.memory_size(&node);
        let entry = Entry {
            node: Arc::new(RwLock::new(node)),
            meta: Arc::new(EntryMeta {
                pins: AtomicUsize::new(1),
                size: AtomicUsize::new(size),
                hot: AtomicBool::new(true),
                removed: AtomicBool::new(false),
            }),
        };
        self.total.fetch_add(size, Ordering::Relaxed);
        let guard = entry.node.write_arc();
        let meta = entry.meta.clone();
        self.table.write().insert(bn, entry);
        PinGuard {
            pager: self,
            meta,
            node: Some(guard),
            bn,
        }
    }

    /// Pins `(blocknum)` for exclusive use. Blocking pins may fetch and
    /// partial-fetch; non-blocking pins refuse anything that needs I/O.
    pub fn pin(
        &self,
        bn: Blocknum,
        hint: &A::Hint,
        flavor: PinFlavor,
    ) -> Result<PinOutcome<PinGuard<'_, A>>> {
        if flavor == PinFlavor::NonBlocking {
            let pending = self.force_retry.load(Ordering::Relaxed);
            if pending > 0
                && self
                    .force_retry
                    .compare_exchange(pending, pending - 1, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
            {
                self.stats.retries.fetch_add(1, Ordering::Relaxed);
                return Ok(PinOutcome::NeedRetry);
            }
        }

        let existing = self.table.read().get(&bn).cloned();
        let entry = match existing {
            Some(entry) => entry,
            None => {
                if flavor == PinFlavor::NonBlocking {
                    self.stats.retries.fetch_add(1, Ordering::Relaxed);
                    return Ok(PinOutcome::NeedRetry);
                }
                let node = self.adapter.fetch(bn, hint)?;
                self.stats.fetches.fetch_add(1, Ordering::Relaxed);
                let size = self.adapter.memory_size(&node);
                let entry = Entry {
                    node: Arc::new(RwLock::new(node)),
                    meta: Arc::new(EntryMeta {
                        pins: AtomicUsize::new(0),
                        size: AtomicUsize::new(size),
                        hot: AtomicBool::new(true),
                        removed: AtomicBool::new(false),
                    }),
                };
                self.total.fetch_add(size, Ordering::Relaxed);
                self.table.write().entry(bn).or_insert(entry).clone()
            }
        };

        let mut guard = match self.lock_entry(&entry, flavor) {
            Some(guard) => guard,
            None => {
                self.stats.retries.fetch_add(1, Ordering::Relaxed);
                return Ok(PinOutcome::NeedRetry);
            }
        };
        if self.adapter.partial_fetch_required(&guard, hint) {
            if flavor == PinFlavor::NonBlocking
                && !self.adapter.partial_fetch_is_cheap(&guard, hint)
            {
                drop(guard);
                self.stats.retries.fetch_add(1, Ordering::Relaxed);
                return Ok(PinOutcome::NeedRetry);
            }
            self.adapter.partial_fetch(&mut guard, hint)?;
            self.stats.partial_fetches.fetch_add(1, Ordering::Relaxed);
        }
        entry.meta.pins.fetch_add(1, Ordering::Relaxed);
        entry.meta.hot.store(true, Ordering::Relaxed);
        Ok(PinOutcome::Pinned(PinGuard {
            pager: self,
            meta: entry.meta.clone(),
            node: Some(guard),
            bn,
        }))
    }

    /// Brings a node into the cache ahead of need. A synchronous
    /// stand-in for asynchronous read-ahead.
    pub fn prefetch(&self, bn: Blocknum, hint: &A::Hint) -> Result<()> {
        match self.pin(bn, hint, PinFlavor::Blocking)? {
            PinOutcome::Pinned(guard) => {
                guard.unpin();
                Ok(())
            }
            PinOutcome::NeedRetry => unreachable!("blocking pins do not retry"),
        }
    }

    /// Drops a node from the table, e.g. when its blocknum is freed
    /// after a merge. The caller may still hold the pin guard.
    pub fn remove(&self, bn: Blocknum) {
        if let Some(entry) = self.table.write().remove(&bn) {
            entry.meta.removed.store(true, Ordering::Relaxed);
            let size = entry.meta.size.swap(0, Ordering::Relaxed);
            self.total.fetch_sub(size, Ordering::Relaxed);
        }
    }

    pub fn contains(&self, bn: Blocknum) -> bool {
        self.table.read().contains_key(&bn)
    }

    fn resize_entry(&self, meta: &EntryMeta, node: &A::Node) {
        if meta.removed.load(Ordering::Relaxed) {
            return;
        }
        let new = self.adapter.memory_size(node);
        let old = meta.size.swap(new, Ordering::Relaxed);
        if new >= old {
            self.total.fetch_add(new - old, Ordering::Relaxed);
        } else {
            self.total.fetch_sub(old - new, Ordering::Relaxed);
        }
    }

    /// Sheds memory until the configured budget is met: first a
    /// second-chance pass, then partial eviction, then whole-node
    /// eviction with write-back of dirty nodes.
    pub fn evict(&self) -> Result<()> {
        if self.total_bytes() <= self.cache_bytes {
            return Ok(());
        }
        let entries: Vec<(Blocknum, Entry<A::Node>)> = self
            .table
            .read()
            .iter()
            .map(|(bn, e)| (*bn, e.clone()))
            .collect();

        // Second chance: cold down everything unpinned that was hot.
        let mut cold = Vec::new();
        for (bn, entry) in entries {
            if entry.meta.pins.load(Ordering::Relaxed) > 0 {
                continue;
            }
            if entry.meta.hot.swap(false, Ordering::Relaxed) {
                continue;
            }
            cold.push((bn, entry));
        }

        for (bn, entry) in cold {
            if self.total_bytes() <= self.cache_bytes {
                break;
            }
            let mut guard = match entry.node.try_write_arc() {
                Some(guard) => guard,
                None => continue,
            };
            if self.adapter.is_dirty(&guard) {
                self.adapter.flush(&mut guard, false)?;
                self.adapter.mark_clean(&mut guard);
            }
            let freed = self.adapter.partial_evict(&mut guard)?;
            if freed > 0 {
                self.stats.partial_evictions.fetch_add(1, Ordering::Relaxed);
            }
            self.resize_entry(&entry.meta, &guard);
            if self.total_bytes() > self.cache_bytes {
                // Partial eviction was not enough, drop the whole node.
                drop(guard);
                self.remove(bn);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// Writes every dirty node back. With `for_checkpoint`, writes land
    /// in shadow locations until the checkpoint ends.
    pub fn write_back_all(&self, for_checkpoint: bool) -> Result<()> {
        let entries: Vec<Entry<A::Node>> = self.table.read().values().cloned().collect();
        for entry in entries {
            let mut guard = entry.node.write_arc();
            if self.adapter.is_dirty(&guard) {
                self.adapter.flush(&mut guard, for_checkpoint)?;
                self.adapter.mark_clean(&mut guard);
                self.resize_entry(&entry.meta, &guard);
            }
        }
        Ok(())
    }

    /// Drops every cache entry without writing anything back.
    pub fn drop_cache(&self) {
        self.table.write().clear();
        self.total.store(0, Ordering::Relaxed);
    }
}

/// An exclusive pin on one node. Dropping the guard unpins and
/// re-attributes the node's memory to the cache.
pub struct PinGuard<'a, A: NodeAdapter> {
    pager: &'a Pager<A>,
    meta: Arc<EntryMeta>,
    node: Option<NodeGuard<A::Node>>,
    bn: Blocknum,
}

impl<'a, A: NodeAdapter> PinGuard<'a, A> {
    pub fn blocknum(&self) -> Blocknum {
        self.bn
    }

    /// Releases the pin. Equivalent to dropping the guard.
    pub fn unpin(self) {}
}

impl<'a, A: NodeAdapter> Deref for PinGuard<'a, A> {
    type Target = A::Node;

    fn deref(&self) -> &A::Node {
        self.node.as_ref().expect("pin guard holds its node")
    }
}

impl<'a, A: NodeAdapter> DerefMut for PinGuard<'a, A> {
    fn deref_mut(&mut self) -> &mut A::Node {
        self.node.as_mut().expect("pin guard holds its node")
    }
}

impl<'a, A: NodeAdapter> Drop for PinGuard<'a, A> {
    fn drop(&mut self) {
        if let Some(guard) = self.node.take() {
            self.pager.resize_entry(&self.meta, &guard);
            drop(guard);
        }
        self.meta.pins.fetch_sub(1, Ordering::Relaxed);
    }
}
