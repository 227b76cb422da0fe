//! Implementation of the buffered repository tree.
//!
//! Writes enter at the root as stamped messages and drain towards the
//! leaves through per-child FIFOs; reads descend and replay whatever is
//! still buffered above the leaf they land in.

use self::node::{FetchHint, Node, Reactivity};
use crate::{
    block::{BlockStore, Blocknum},
    cache::{NodeAdapter, Pager, PinFlavor, PinGuard, PinOutcome},
    config::EngineConfig,
    cow_bytes::{CowBytes, SlicedCowBytes},
    env::Env,
    error::{Error, Result},
    message::{Message, MessageType, TxnId, Xids},
    size::Size,
    tree::header::{DictId, Header, Lsn},
    tree::UpdateAction,
};
use owning_ref::OwningRef;
use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

pub(crate) mod ancestors;
pub(crate) mod basement;
pub(crate) mod cursor;
pub(crate) mod fifo;
mod flush;
pub(crate) mod leaf_entry;
pub(crate) mod node;
mod split;

pub use cursor::{Cursor, CursorOutcome};
pub use leaf_entry::{GcContext, ReadContext};

pub(crate) type NodePin<'a> = PinGuard<'a, TreeAdapter>;

/// Entry-count estimates around one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyRange {
    pub less: u64,
    pub equal: u64,
    pub greater: u64,
}

/// Size statistics for one dictionary.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stat64 {
    pub file_size: u64,
    pub nkeys: u64,
    pub ndata: u64,
    pub dsize: u64,
}

/// Operation counters, merged from the tree and its cache.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    pub messages_injected: u64,
    pub flushes: u64,
    pub splits: u64,
    pub merges: u64,
    pub fetches: u64,
    pub partial_fetches: u64,
    pub partial_evictions: u64,
    pub evictions: u64,
    pub retries: u64,
}

#[derive(Debug, Default)]
pub(crate) struct TreeCounters {
    pub(crate) messages_injected: AtomicU64,
    pub(crate) flushes: AtomicU64,
    pub(crate) splits: AtomicU64,
    pub(crate) merges: AtomicU64,
}

/// The [NodeAdapter] implementation the tree hands its cache: node
/// serialization against the block store, partial fetch and partial
/// eviction.
pub(crate) struct TreeAdapter {
    store: Arc<BlockStore>,
    config: EngineConfig,
}

impl TreeAdapter {
    fn has_on_disk_parts(node: &Node) -> bool {
        (0..node.n_children())
            .any(|i| matches!(node.partition_state(i), node::Partition::OnDisk))
    }
}

impl NodeAdapter for TreeAdapter {
    type Node = Node;
    type Hint = FetchHint;

    fn flush(&self, node: &mut Node, for_checkpoint: bool) -> Result<()> {
        log::trace!(
            "flush: block {:?} height {} for_checkpoint {}",
            node.blocknum(),
            node.height(),
            for_checkpoint
        );
        if Self::has_on_disk_parts(node) {
            let image = self.store.read(node.blocknum())?;
            node.load_compressed_parts(&image)?;
        }
        if node.is_leaf() {
            // Writing a leaf re-chunks it into basement-sized partitions
            // so future reads can fault them in one at a time.
            for i in 0..node.n_children() {
                node.materialize(i, &self.config.compression)?;
            }
            node.rebalance_basements(self.config.basementsize);
        }
        let image = node.pack(&self.config.compression)?;
        self.store.write(node.blocknum(), image, for_checkpoint)
    }

    fn fetch(&self, bn: Blocknum, hint: &FetchHint) -> Result<Node> {
        let image = self.store.read(bn)?;
        let node = Node::unpack(&image, hint, &self.config.compression)?;
        Ok(node)
    }

    fn partial_fetch_required(&self, node: &Node, hint: &FetchHint) -> bool {
        node.partial_fetch_required(hint)
    }

    fn partial_fetch_is_cheap(&self, node: &Node, hint: &FetchHint) -> bool {
        // Decompression does not count as I/O; re-reading an evicted
        // partition from the store does.
        !Self::has_on_disk_parts(node) || !node.partial_fetch_required(hint)
    }

    fn partial_fetch(&self, node: &mut Node, hint: &FetchHint) -> Result<()> {
        if Self::has_on_disk_parts(node) {
            let image = self.store.read(node.blocknum())?;
            node.load_compressed_parts(&image)?;
        }
        node.materialize_for(hint, &self.config.compression)?;
        Ok(())
    }

    fn partial_evict(&self, node: &mut Node) -> Result<usize> {
        Ok(node.partial_evict(&self.config.compression)?)
    }

    fn is_dirty(&self, node: &Node) -> bool {
        node.is_dirty()
    }

    fn mark_clean(&self, node: &mut Node) {
        node.mark_clean();
    }

    fn memory_size(&self, node: &Node) -> usize {
        node.size()
    }
}

pub(crate) struct Inner<M> {
    pub(crate) header: RwLock<Header>,
    checkpoint_twin: Mutex<Option<Header>>,
    pub(crate) store: Arc<BlockStore>,
    pub(crate) pager: Pager<TreeAdapter>,
    pub(crate) config: EngineConfig,
    pub(crate) env: Arc<Env>,
    pub(crate) action: M,
    pub(crate) counters: TreeCounters,
}

/// One dictionary: a buffered repository tree over a block store.
pub struct Tree<M: UpdateAction = crate::tree::DefaultUpdateAction> {
    pub(crate) inner: Arc<Inner<M>>,
}

impl<M: UpdateAction> Clone for Tree<M> {
    fn clone(&self) -> Self {
        Tree {
            inner: self.inner.clone(),
        }
    }
}

impl Tree<crate::tree::DefaultUpdateAction> {
    /// Creates a new, empty dictionary.
    pub fn create(env: Arc<Env>, store: Arc<BlockStore>, config: EngineConfig) -> Result<Self> {
        Tree::create_with(env, store, config, crate::tree::DefaultUpdateAction)
    }

    /// Opens the dictionary committed to `store`.
    pub fn open(env: Arc<Env>, store: Arc<BlockStore>, config: EngineConfig) -> Result<Self> {
        Tree::open_with(env, store, config, crate::tree::DefaultUpdateAction)
    }
}

impl<M: UpdateAction> Tree<M> {
    pub fn create_with(
        env: Arc<Env>,
        store: Arc<BlockStore>,
        config: EngineConfig,
        action: M,
    ) -> Result<Self> {
        let root_bn = store.allocate();
        let header = Header::new(
            env.next_dict_id(),
            root_bn,
            config.nodesize as u32,
            config.basementsize as u32,
        );
        header.write_to(&store)?;
        let tree = Tree::assemble(env, store, config, action, header);
        let mut root = Node::empty_leaf(root_bn, tree.inner.config.nodesize as u32);
        // A root leaf has no ancestors, so it is current by definition.
        root.basement_mut(0)
            .expect("fresh leaf partition")
            .mark_up_to_date();
        tree.inner.pager.insert_new(root_bn, root).unpin();
        Ok(tree)
    }

    pub fn open_with(
        env: Arc<Env>,
        store: Arc<BlockStore>,
        config: EngineConfig,
        action: M,
    ) -> Result<Self> {
        let header = Header::read_from(&store)?;
        Ok(Tree::assemble(env, store, config, action, header))
    }

    fn assemble(
        env: Arc<Env>,
        store: Arc<BlockStore>,
        config: EngineConfig,
        action: M,
        header: Header,
    ) -> Self {
        let adapter = TreeAdapter {
            store: store.clone(),
            config: config.clone(),
        };
        let pager = Pager::new(adapter, config.cache_bytes);
        Tree {
            inner: Arc::new(Inner {
                header: RwLock::new(header),
                checkpoint_twin: Mutex::new(None),
                store,
                pager,
                config,
                env,
                action,
                counters: TreeCounters::default(),
            }),
        }
    }

    pub fn dict_id(&self) -> DictId {
        self.inner.header.read().dict_id
    }

    pub fn env(&self) -> &Arc<Env> {
        &self.inner.env
    }

    /// Records the transaction that created this dictionary; snapshots
    /// older than it refuse to read.
    pub fn set_created_txn(&self, txn: TxnId) {
        self.inner.header.write().created_txn = txn;
    }

    /// Locks the header and projects the root block number out of it.
    /// `None` while a checkpoint holds the header.
    pub fn try_lock_root(&self) -> Option<OwningRef<RwLockWriteGuard<'_, Header>, Blocknum>> {
        let guard = self.inner.header.try_write()?;
        Some(OwningRef::new(guard).map(|h| &h.root))
    }

    fn check_panicked(&self) -> Result<()> {
        self.inner.header.read().panicked()
    }

    fn poison_on_fatal(&self, err: &Error) {
        if let Some(code) = err.panic_code() {
            self.inner.header.write().set_panic(code, err.to_string());
        }
    }

    pub(crate) fn pin_blocking(&self, bn: Blocknum, hint: &FetchHint) -> Result<NodePin<'_>> {
        match self.inner.pager.pin(bn, hint, PinFlavor::Blocking)? {
            PinOutcome::Pinned(guard) => Ok(guard),
            PinOutcome::NeedRetry => unreachable!("blocking pins do not retry"),
        }
    }

    /// Pins the root, escalating to a blocking prefetch whenever the
    /// non-blocking attempt loses.
    pub(crate) fn pin_root(&self, hint: &FetchHint) -> Result<NodePin<'_>> {
        loop {
            let root_bn = self.inner.header.read().root;
            match self.inner.pager.pin(root_bn, hint, PinFlavor::NonBlocking)? {
                PinOutcome::Pinned(guard) => return Ok(guard),
                PinOutcome::NeedRetry => {
                    self.inner.pager.prefetch(root_bn, hint)?;
                }
            }
        }
    }

    // -- writes --------------------------------------------------------

    /// Inserts `key -> val` in the scope of `xids`. The root stack
    /// commits immediately.
    pub fn insert<K: AsRef<[u8]>, V: AsRef<[u8]>>(&self, key: K, val: V, xids: Xids) -> Result<()> {
        self.root_put(Message::new(
            MessageType::Insert,
            xids,
            CowBytes::from(key.as_ref()),
            CowBytes::from(val.as_ref()).into(),
        ))
    }

    /// Like [Tree::insert] but refuses to overwrite a live value.
    pub fn insert_no_overwrite<K: AsRef<[u8]>, V: AsRef<[u8]>>(
        &self,
        key: K,
        val: V,
        xids: Xids,
    ) -> Result<()> {
        let ctx = ReadContext {
            xids: xids.clone(),
            ..ReadContext::latest()
        };
        if self.lookup_with(key.as_ref(), &ctx)?.is_some() {
            return Err(Error::KeyExists);
        }
        self.root_put(Message::new(
            MessageType::InsertNoOverwrite,
            xids,
            CowBytes::from(key.as_ref()),
            CowBytes::from(val.as_ref()).into(),
        ))
    }

    pub fn delete<K: AsRef<[u8]>>(&self, key: K, xids: Xids) -> Result<()> {
        self.root_put(Message::new(
            MessageType::DeleteAny,
            xids,
            CowBytes::from(key.as_ref()),
            SlicedCowBytes::default(),
        ))
    }

    /// Runs the update callback against `key` with `extra`.
    pub fn update<K: AsRef<[u8]>, V: AsRef<[u8]>>(
        &self,
        key: K,
        extra: V,
        xids: Xids,
    ) -> Result<()> {
        self.root_put(Message::new(
            MessageType::Update,
            xids,
            CowBytes::from(key.as_ref()),
            CowBytes::from(extra.as_ref()).into(),
        ))
    }

    /// Runs the update callback against every key.
    pub fn update_broadcast<V: AsRef<[u8]>>(&self, extra: V, xids: Xids) -> Result<()> {
        self.root_put(Message::new(
            MessageType::UpdateBroadcastAll,
            xids,
            CowBytes::new(),
            CowBytes::from(extra.as_ref()).into(),
        ))
    }

    /// Commits every provisional operation of `xids` and its children.
    pub fn commit_txn(&self, xids: Xids) -> Result<()> {
        self.root_put(Message::new(
            MessageType::CommitBroadcastTxn,
            xids,
            CowBytes::new(),
            SlicedCowBytes::default(),
        ))
    }

    /// Rolls back every provisional operation of `xids` and its
    /// children.
    pub fn abort_txn(&self, xids: Xids) -> Result<()> {
        self.root_put(Message::new(
            MessageType::AbortBroadcastTxn,
            xids,
            CowBytes::new(),
            SlicedCowBytes::default(),
        ))
    }

    /// Commits everything provisional, regardless of transaction.
    pub fn commit_all(&self) -> Result<()> {
        self.root_put(Message::new(
            MessageType::CommitBroadcastAll,
            Xids::root(),
            CowBytes::new(),
            SlicedCowBytes::default(),
        ))
    }

    /// Garbage-collects quiescent provisional stacks against the oldest
    /// live transaction.
    pub fn optimize(&self) -> Result<()> {
        self.root_put(Message::new(
            MessageType::Optimize,
            Xids::root(),
            CowBytes::new(),
            SlicedCowBytes::default(),
        ))
    }

    pub fn optimize_for_upgrade(&self) -> Result<()> {
        self.root_put(Message::new(
            MessageType::OptimizeForUpgrade,
            Xids::root(),
            CowBytes::new(),
            SlicedCowBytes::default(),
        ))
    }

    fn root_put(&self, msg: Message) -> Result<()> {
        self.check_panicked()?;
        if msg.ty().is_targeted() && msg.key().is_empty() {
            return Err(Error::EmptyKey);
        }
        let res = self.root_put_inner(msg);
        if let Err(err) = &res {
            self.poison_on_fatal(err);
        }
        res
    }

    fn root_put_inner(&self, msg: Message) -> Result<()> {
        let inner = &self.inner;
        inner.env.bump_root_put();
        let mut root = self.pin_root(&FetchHint::All)?;

        let msn = root.max_msn_applied_in_memory().next();
        let mut msg = msg;
        msg.stamp(msn);
        log::trace!("root_put: {:?} msn {:?}", msg.ty(), msn);

        let gc = inner.env.gc();
        if root.is_leaf() {
            // No ancestors above a root leaf; its basements are current
            // by definition.
            for i in 0..root.n_children() {
                if let Some(bn) = root.basement_mut(i) {
                    bn.mark_up_to_date();
                }
            }
            root.apply_to_leaf(&msg, &gc, &inner.action);
        } else {
            root.enqueue_msg(&msg, &inner.config.compression)?;
            self.apply_eagerly(&root, &msg)?;
            if root.is_gorged() {
                self.flush_some_child(&mut root, true)?;
            }
        }

        if let Reactivity::Fissible = root.reactivity(&inner.config) {
            self.split_root(&mut root)?;
        }

        inner.header.write().dirty = true;
        inner
            .counters
            .messages_injected
            .fetch_add(1, Ordering::Relaxed);
        drop(root);
        inner.pager.evict()
    }

    /// Pushes the message into leaves that are already resident, so warm
    /// data stays current without waiting for a flush. Only in-memory
    /// copies change; partitions that are cold or behind pick the
    /// message up through the ordinary MSN-gated replay.
    ///
    /// Non-resident subtrees are skipped: their basements reload as
    /// not-up-to-date and replay delivers the message. Resident children
    /// are pinned blocking — past the residency check no I/O is
    /// possible, and an up-to-date basement that missed the message
    /// here would never see it again.
    fn apply_eagerly(&self, node: &Node, msg: &Message) -> Result<()> {
        debug_assert!(!node.is_leaf());
        let children: Vec<usize> = if msg.is_broadcast() {
            (0..node.n_children()).collect()
        } else {
            vec![node.which_child(msg.key())]
        };
        for c in children {
            let bn = node.child_blocknum(c);
            if !self.inner.pager.contains(bn) {
                continue;
            }
            let mut child = self.pin_blocking(bn, &FetchHint::None)?;
            if child.is_leaf() {
                child.apply_eager(msg, &self.inner.env.gc(), &self.inner.action);
            } else {
                self.apply_eagerly(&child, msg)?;
            }
        }
        Ok(())
    }

    /// Replaces a fissible root with a fresh one over the two halves.
    /// The root keeps its block number, so the header never moves.
    pub(crate) fn split_root(&self, root: &mut NodePin<'_>) -> Result<()> {
        let inner = &self.inner;
        let left_bn = inner.store.allocate();
        let right_bn = inner.store.allocate();
        let root_bn = root.blocknum();
        let msn = root.max_msn_applied_in_memory();
        let height = root.height();
        let nodesize = root.nodesize();

        let mut left = std::mem::replace(
            &mut **root,
            Node::init_empty(root_bn, height + 1, 0, nodesize, 0),
        );
        left.set_blocknum(left_bn);
        let (right, pivot) = if left.is_leaf() {
            left.split_leaf(right_bn, inner.config.basementsize)
        } else {
            left.split_nonleaf(right_bn)
        };
        log::debug!(
            "split_root: height {} -> {}, pivot {:?}",
            height,
            height + 1,
            pivot
        );
        let left_est = left.aggregate_estimates();
        let right_est = right.aggregate_estimates();
        **root = Node::from_parts(
            root_bn,
            height + 1,
            nodesize,
            0,
            msn,
            vec![pivot],
            vec![
                node::ChildSlot::new_internal(left_bn, left_est),
                node::ChildSlot::new_internal(right_bn, right_est),
            ],
        );
        inner.pager.insert_new(left_bn, left).unpin();
        inner.pager.insert_new(right_bn, right).unpin();
        inner.counters.splits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    // -- reads ---------------------------------------------------------

    /// Point lookup observing everything committed.
    pub fn lookup<K: AsRef<[u8]>>(&self, key: K) -> Result<Option<SlicedCowBytes>> {
        self.lookup_with(key.as_ref(), &ReadContext::latest())
    }

    /// Point lookup under an explicit MVCC context.
    pub fn lookup_with(&self, key: &[u8], ctx: &ReadContext) -> Result<Option<SlicedCowBytes>> {
        self.check_panicked()?;
        if key.is_empty() {
            return Err(Error::EmptyKey);
        }
        let hint = FetchHint::Subset(vec![CowBytes::from(key)]);
        let res = loop {
            let root = self.pin_root(&hint)?;
            let mut retry = None;
            match self.lookup_rec(root, key, None, ctx, &hint, &mut retry)? {
                Some(found) => break found,
                None => {
                    if let Some(bn) = retry {
                        self.inner.pager.prefetch(bn, &hint)?;
                    }
                }
            }
        };
        self.inner.pager.evict()?;
        Ok(res)
    }

    /// One level of the descent. `Ok(None)` asks the caller to unwind
    /// and redescend; the pins dropped on the way out are the
    /// unlockers.
    fn lookup_rec(
        &self,
        mut node: NodePin<'_>,
        key: &[u8],
        chain: Option<&ancestors::Ancestors<'_>>,
        ctx: &ReadContext,
        hint: &FetchHint,
        retry: &mut Option<Blocknum>,
    ) -> Result<Option<Option<SlicedCowBytes>>> {
        if node.is_leaf() {
            let target = node.which_child(key);
            ancestors::apply_ancestor_messages(
                &mut node,
                target,
                chain,
                &self.inner.env.gc(),
                &self.inner.action,
            );
            let found = node.basement(target).and_then(|bn| {
                bn.find_zero(key)
                    .ok()
                    .and_then(|i| bn.fetch(i))
                    .and_then(|le| le.read_visible(ctx))
            });
            return Ok(Some(found));
        }
        let childnum = node.which_child(key);
        let child_bn = node.child_blocknum(childnum);
        let child = match self
            .inner
            .pager
            .pin(child_bn, hint, PinFlavor::NonBlocking)?
        {
            PinOutcome::Pinned(guard) => guard,
            PinOutcome::NeedRetry => {
                *retry = Some(child_bn);
                return Ok(None);
            }
        };
        let frame = ancestors::Ancestors {
            node: &node,
            childnum,
            next: chain,
        };
        self.lookup_rec(child, key, Some(&frame), ctx, hint, retry)
    }

    /// Entry-count estimates `(less, equal, greater)` around `key`,
    /// using the subtree estimates for everything off the descent path.
    pub fn keyrange<K: AsRef<[u8]>>(&self, key: K) -> Result<KeyRange> {
        self.check_panicked()?;
        let key = key.as_ref();
        let hint = FetchHint::Subset(vec![CowBytes::from(key)]);
        let mut less = 0u64;
        let mut greater = 0u64;
        let mut chain_counts: Vec<(u64, u64)> = Vec::new();
        let mut node = self.pin_root(&hint)?;
        loop {
            if node.is_leaf() {
                let target = node.which_child(key);
                if chain_counts.is_empty() {
                    // Root leaf: safe to refresh in place. Deeper leaves
                    // answer from estimates instead of replaying here.
                    ancestors::apply_ancestor_messages(
                        &mut node,
                        target,
                        None,
                        &self.inner.env.gc(),
                        &self.inner.action,
                    );
                }
                let mut equal = 0;
                for i in 0..node.n_children() {
                    match node.basement(i) {
                        Some(bn) => {
                            for le in bn.iter() {
                                match (**le.key()).cmp(key) {
                                    std::cmp::Ordering::Less => less += 1,
                                    // A retained tombstone still occupies
                                    // its slot; it just no longer equals
                                    // anything.
                                    std::cmp::Ordering::Equal => {
                                        if le.latest_is_del() {
                                            greater += 1;
                                        } else {
                                            equal += 1;
                                        }
                                    }
                                    std::cmp::Ordering::Greater => greater += 1,
                                }
                            }
                        }
                        None => {
                            let est = node.slot(i).estimate;
                            if i < target {
                                less += est.ndata;
                            } else {
                                greater += est.ndata;
                            }
                        }
                    }
                }
                for (l, g) in chain_counts {
                    less += l;
                    greater += g;
                }
                return Ok(KeyRange {
                    less,
                    equal,
                    greater,
                });
            }
            let childnum = node.which_child(key);
            let mut l = 0;
            let mut g = 0;
            for i in 0..node.n_children() {
                let est = node.slot(i).estimate;
                if i < childnum {
                    l += est.ndata;
                } else if i > childnum {
                    g += est.ndata;
                }
            }
            chain_counts.push((l, g));
            let child_bn = node.child_blocknum(childnum);
            let child = self.pin_blocking(child_bn, &hint)?;
            node = child;
        }
    }

    /// Size statistics for the dictionary.
    pub fn stat64(&self) -> Result<Stat64> {
        self.check_panicked()?;
        let mut root = self.pin_root(&FetchHint::None)?;
        if root.is_leaf() {
            // A single-node tree can afford exact numbers.
            let all = FetchHint::All;
            if root.partial_fetch_required(&all) {
                drop(root);
                root = self.pin_root(&all)?;
            }
            root.recompute_leaf_estimates();
        }
        let est = root.aggregate_estimates();
        Ok(Stat64 {
            file_size: self.inner.store.used_bytes(),
            nkeys: est.nkeys,
            ndata: est.ndata,
            dsize: est.dsize,
        })
    }

    /// Replays pending ancestor messages onto the leaf owning `key`,
    /// without answering a query. Maintenance only; reads do this on
    /// their own.
    pub fn flatten<K: AsRef<[u8]>>(&self, key: K) -> Result<()> {
        self.lookup(key.as_ref()).map(|_| ())
    }

    // -- durability ----------------------------------------------------

    /// Fuzzy checkpoint: snapshots the header, writes every dirty node
    /// into shadow locations, then commits the twin and releases the
    /// old locations.
    pub fn checkpoint(&self) -> Result<Lsn> {
        self.check_panicked()?;
        log::trace!("checkpoint: begin");
        let twin = self.inner.header.write().clone_for_checkpoint();
        *self.inner.checkpoint_twin.lock() = Some(twin);

        if let Err(err) = self.inner.pager.write_back_all(true) {
            self.inner.checkpoint_twin.lock().take();
            self.inner.store.abort_checkpoint();
            self.poison_on_fatal(&err);
            return Err(err);
        }

        let mut twin = self
            .inner
            .checkpoint_twin
            .lock()
            .take()
            .expect("checkpoint twin survives the write phase");
        twin.checkpoint_lsn = Lsn(twin.checkpoint_lsn.0 + 1);
        twin.checkpoint_count += 1;
        self.inner.store.end_checkpoint();
        twin.write_to(&self.inner.store)?;
        {
            let mut header = self.inner.header.write();
            header.checkpoint_lsn = twin.checkpoint_lsn;
            header.checkpoint_count = twin.checkpoint_count;
        }
        // Leaf re-chunking during write-back moves entries between
        // partitions; positional cursors must redescend.
        self.inner.env.bump_root_put();
        log::trace!("checkpoint: done, lsn {:?}", twin.checkpoint_lsn);
        Ok(twin.checkpoint_lsn)
    }

    /// Writes all dirty state back without the checkpoint protocol.
    pub fn sync(&self) -> Result<()> {
        self.check_panicked()?;
        let res = self.inner.pager.write_back_all(false);
        if let Err(err) = &res {
            self.poison_on_fatal(err);
        }
        res?;
        self.inner.header.read().write_to(&self.inner.store)?;
        self.inner.env.bump_root_put();
        Ok(())
    }

    pub fn stats(&self) -> Stats {
        let cache = self.inner.pager.stats();
        Stats {
            messages_injected: self
                .inner
                .counters
                .messages_injected
                .load(Ordering::Relaxed),
            flushes: self.inner.counters.flushes.load(Ordering::Relaxed),
            splits: self.inner.counters.splits.load(Ordering::Relaxed),
            merges: self.inner.counters.merges.load(Ordering::Relaxed),
            fetches: cache.fetches(),
            partial_fetches: cache.partial_fetches(),
            partial_evictions: cache.partial_evictions(),
            evictions: cache.evictions(),
            retries: cache.retries(),
        }
    }

    /// Forces the next `n` non-blocking pins to lose their race, for
    /// exercising the try-again unwind path.
    #[cfg(any(test, feature = "internal-api"))]
    pub fn force_pin_retries(&self, n: usize) {
        self.inner.pager.force_retries(n);
    }
}
