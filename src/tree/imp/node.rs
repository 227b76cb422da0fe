//! Tree nodes: partitioned state, reactivity and the on-disk layout.
//!
//! A node is an array of child partitions separated by pivots. Leaf
//! partitions hold [Basement]s, nonleaf partitions hold [MsgFifo]s and a
//! child block number. Every partition is in exactly one of four states;
//! the cache moves them between `Avail`, `Compressed` and `OnDisk`
//! through partial fetch and partial eviction.

use super::{basement::Basement, fifo::MsgFifo, leaf_entry::GcContext};
use crate::{
    block::Blocknum,
    checksum::checksum_of,
    compression::CompressionMode,
    config::EngineConfig,
    cow_bytes::CowBytes,
    message::{Message, Msn},
    size::Size,
    tree::UpdateAction,
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read, Write};

const NODE_MAGIC: &[u8; 8] = b"brtnode\0";
pub(crate) const LAYOUT_VERSION: u32 = 1;
const BUILD_ID: u32 = 0;

/// Which partitions a fetch materializes immediately. Everything else
/// stays `Compressed` until partial fetch faults it in.
#[derive(Debug, Clone, Default)]
pub enum FetchHint {
    /// Materialize every partition (writes, flushes, structural ops).
    #[default]
    All,
    /// Only the partitions any of the given keys route to.
    Subset(Vec<CowBytes>),
    /// The leftmost partition only.
    Min,
    /// The rightmost partition only.
    Max,
    /// Metadata access only.
    None,
}

impl FetchHint {
    fn wants(&self, node: &Node, childnum: usize) -> bool {
        match self {
            FetchHint::All => true,
            FetchHint::None => false,
            FetchHint::Min => childnum == 0,
            FetchHint::Max => childnum + 1 == node.n_children(),
            FetchHint::Subset(keys) => keys.iter().any(|k| node.which_child(k) == childnum),
        }
    }
}

/// Size classification driving split and merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reactivity {
    Stable,
    Fissible,
    Fusible,
}

/// Statistics for the subtree rooted at one child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SubtreeEstimates {
    pub nkeys: u64,
    pub ndata: u64,
    pub dsize: u64,
    pub exact: bool,
}

impl Default for SubtreeEstimates {
    fn default() -> Self {
        SubtreeEstimates {
            nkeys: 0,
            ndata: 0,
            dsize: 0,
            exact: true,
        }
    }
}

impl SubtreeEstimates {
    pub fn accumulate(&mut self, other: &SubtreeEstimates) {
        self.nkeys += other.nkeys;
        self.ndata += other.ndata;
        self.dsize += other.dsize;
        self.exact &= other.exact;
    }

    /// Buffered messages make a child's numbers approximate until the
    /// next flush.
    pub fn invalidate(&mut self) {
        self.exact = false;
    }

    fn pack<W: Write>(&self, mut w: W) -> io::Result<()> {
        w.write_u64::<LittleEndian>(self.nkeys)?;
        w.write_u64::<LittleEndian>(self.ndata)?;
        w.write_u64::<LittleEndian>(self.dsize)?;
        w.write_u8(self.exact as u8)
    }

    fn unpack<R: Read>(mut r: R) -> io::Result<Self> {
        Ok(SubtreeEstimates {
            nkeys: r.read_u64::<LittleEndian>()?,
            ndata: r.read_u64::<LittleEndian>()?,
            dsize: r.read_u64::<LittleEndian>()?,
            exact: r.read_u8()? != 0,
        })
    }
}

/// Resident partition contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionBody {
    Leaf(Basement),
    Internal(MsgFifo),
}

impl PartitionBody {
    fn disksize(&self) -> usize {
        match self {
            PartitionBody::Leaf(bn) => bn.disksize(),
            PartitionBody::Internal(fifo) => fifo.disksize(),
        }
    }

    fn memsize(&self) -> usize {
        match self {
            PartitionBody::Leaf(bn) => 64 + bn.n_bytes(),
            PartitionBody::Internal(fifo) => fifo.size(),
        }
    }

    fn pack<W: Write>(&self, w: W) -> io::Result<()> {
        match self {
            PartitionBody::Leaf(bn) => bn.pack(w),
            PartitionBody::Internal(fifo) => fifo.pack(w),
        }
    }

    fn unpack<R: Read>(r: R, height: u8) -> io::Result<Self> {
        if height == 0 {
            Ok(PartitionBody::Leaf(Basement::unpack(r)?))
        } else {
            Ok(PartitionBody::Internal(MsgFifo::unpack(r)?))
        }
    }
}

/// Compressed image of a partition, held until a query needs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedPart {
    bytes: Box<[u8]>,
    uncompressed_len: u32,
}

/// The four-state partition machine.
///
/// `Invalid -> Avail` on node creation, `Avail <-> Compressed <-> OnDisk`
/// under the cache's partial fetch and eviction, any state to freed when
/// the node is merged away.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Partition {
    /// Never populated.
    #[default]
    Invalid,
    /// Serialized form exists on disk only.
    OnDisk,
    /// Raw compressed bytes in memory, decompressed lazily.
    Compressed(CompressedPart),
    /// Full in-memory form.
    Avail(PartitionBody),
}

impl Partition {
    pub fn state_name(&self) -> &'static str {
        match self {
            Partition::Invalid => "invalid",
            Partition::OnDisk => "on-disk",
            Partition::Compressed(_) => "compressed",
            Partition::Avail(_) => "avail",
        }
    }

    pub fn is_avail(&self) -> bool {
        matches!(self, Partition::Avail(_))
    }
}

/// One child slot: partition state, aging clock, subtree statistics and
/// (for nonleaf nodes) the child's block number.
#[derive(Debug, Clone, Default)]
pub struct ChildSlot {
    pub(crate) child: Option<Blocknum>,
    pub(crate) state: Partition,
    /// Second-chance counter for partial eviction.
    pub(crate) clock: u32,
    pub(crate) estimate: SubtreeEstimates,
    /// Uncompressed payload length at the last (de)serialization, kept
    /// so size estimates work for non-resident partitions.
    pub(crate) on_disk_len: u32,
}

impl ChildSlot {
    pub(crate) fn new_avail(body: PartitionBody) -> Self {
        ChildSlot {
            state: Partition::Avail(body),
            ..ChildSlot::default()
        }
    }

    /// A nonleaf slot pointing at `child` with an empty message queue.
    pub(crate) fn new_internal(child: Blocknum, estimate: SubtreeEstimates) -> Self {
        ChildSlot {
            child: Some(child),
            state: Partition::Avail(PartitionBody::Internal(MsgFifo::new())),
            estimate,
            ..ChildSlot::default()
        }
    }
}

/// A node of the tree.
#[derive(Debug, Clone)]
pub struct Node {
    blocknum: Blocknum,
    height: u8,
    nodesize: u32,
    flags: u32,
    layout_version: u32,
    dirty: bool,
    max_msn_applied_on_disk: Msn,
    max_msn_applied_in_memory: Msn,
    pivots: Vec<CowBytes>,
    bp: Vec<ChildSlot>,
    totalchildkeylens: usize,
}

impl Node {
    /// A node with `n_children` unpopulated partitions. Freshly created
    /// nodes are dirty and carry minimal MSN watermarks.
    pub fn init_empty(
        blocknum: Blocknum,
        height: u8,
        n_children: usize,
        nodesize: u32,
        flags: u32,
    ) -> Self {
        Node {
            blocknum,
            height,
            nodesize,
            flags,
            layout_version: LAYOUT_VERSION,
            dirty: true,
            max_msn_applied_on_disk: Msn::MIN,
            max_msn_applied_in_memory: Msn::MIN,
            pivots: Vec::new(),
            bp: (0..n_children).map(|_| ChildSlot::default()).collect(),
            totalchildkeylens: 0,
        }
    }

    /// An empty, single-partition leaf.
    pub fn empty_leaf(blocknum: Blocknum, nodesize: u32) -> Self {
        let mut node = Node::init_empty(blocknum, 0, 1, nodesize, 0);
        node.bp[0].state = Partition::Avail(PartitionBody::Leaf(Basement::new()));
        node
    }

    pub(crate) fn from_parts(
        blocknum: Blocknum,
        height: u8,
        nodesize: u32,
        flags: u32,
        msn: Msn,
        pivots: Vec<CowBytes>,
        bp: Vec<ChildSlot>,
    ) -> Self {
        let totalchildkeylens = pivots.iter().map(|p| p.len()).sum();
        Node {
            blocknum,
            height,
            nodesize,
            flags,
            layout_version: LAYOUT_VERSION,
            dirty: true,
            max_msn_applied_on_disk: Msn::MIN,
            max_msn_applied_in_memory: msn,
            pivots,
            bp,
            totalchildkeylens,
        }
    }

    pub fn blocknum(&self) -> Blocknum {
        self.blocknum
    }

    pub(crate) fn set_blocknum(&mut self, bn: Blocknum) {
        self.blocknum = bn;
    }

    pub fn height(&self) -> u8 {
        self.height
    }

    pub fn is_leaf(&self) -> bool {
        self.height == 0
    }

    pub fn nodesize(&self) -> u32 {
        self.nodesize
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub(crate) fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub fn n_children(&self) -> usize {
        self.bp.len()
    }

    pub fn pivots(&self) -> &[CowBytes] {
        &self.pivots
    }

    pub fn max_msn_applied_in_memory(&self) -> Msn {
        self.max_msn_applied_in_memory
    }

    pub fn max_msn_applied_on_disk(&self) -> Msn {
        self.max_msn_applied_on_disk
    }

    pub(crate) fn bump_msn(&mut self, msn: Msn) {
        debug_assert!(msn > self.max_msn_applied_in_memory);
        self.max_msn_applied_in_memory = msn;
    }

    pub(crate) fn child_blocknum(&self, i: usize) -> Blocknum {
        self.bp[i].child.expect("nonleaf child has a blocknum")
    }

    pub(crate) fn slot(&self, i: usize) -> &ChildSlot {
        &self.bp[i]
    }

    pub(crate) fn slot_mut(&mut self, i: usize) -> &mut ChildSlot {
        &mut self.bp[i]
    }

    pub(crate) fn take_slots(self) -> (Vec<CowBytes>, Vec<ChildSlot>) {
        (self.pivots, self.bp)
    }

    /// Routes `key` to a child index. The last pivot is probed first to
    /// favor right-edge sequential inserts.
    pub fn which_child(&self, key: &[u8]) -> usize {
        match self.pivots.last() {
            None => 0,
            Some(last) if &**last < key => self.pivots.len(),
            _ => self.pivots.partition_point(|p| &**p < key),
        }
    }

    /// The key range `(lower_exclusive, upper_inclusive]` owned by child
    /// `i`; `None` bounds are open.
    pub fn child_bounds(&self, i: usize) -> (Option<&CowBytes>, Option<&CowBytes>) {
        let lower = i.checked_sub(1).map(|j| &self.pivots[j]);
        let upper = self.pivots.get(i);
        (lower, upper)
    }

    /// Extends the node by one child on the right.
    pub fn append_child(&mut self, slot: ChildSlot, pivot: Option<CowBytes>) {
        if let Some(pivot) = pivot {
            debug_assert!(self.pivots.last().map_or(true, |last| *last < pivot));
            self.totalchildkeylens += pivot.len();
            self.pivots.push(pivot);
        }
        self.bp.push(slot);
        self.dirty = true;
    }

    /// Inserts `slot` as child `i`, separated from child `i-1` by
    /// `pivot`.
    pub(crate) fn insert_child_at(&mut self, i: usize, slot: ChildSlot, pivot: CowBytes) {
        debug_assert!(i >= 1 && i <= self.bp.len());
        self.totalchildkeylens += pivot.len();
        self.pivots.insert(i - 1, pivot);
        self.bp.insert(i, slot);
        debug_assert!(self.pivots.windows(2).all(|w| w[0] < w[1]));
        self.dirty = true;
    }

    /// Removes child `i` and the pivot separating it from its left
    /// neighbor.
    pub(crate) fn remove_child_at(&mut self, i: usize) -> ChildSlot {
        debug_assert!(i >= 1 && i < self.bp.len());
        let pivot = self.pivots.remove(i - 1);
        self.totalchildkeylens -= pivot.len();
        self.dirty = true;
        self.bp.remove(i)
    }

    /// Replaces the pivot separating children `i` and `i+1`.
    pub(crate) fn set_pivot(&mut self, i: usize, pivot: CowBytes) {
        self.totalchildkeylens += pivot.len();
        self.totalchildkeylens -= self.pivots[i].len();
        self.pivots[i] = pivot;
        self.dirty = true;
    }

    /// Detaches children `[at, n)` together with their inner pivots,
    /// returning `(right_pivots, right_slots, separator)` where the
    /// separator is the old pivot between `at-1` and `at`.
    pub(crate) fn split_slots_off(
        &mut self,
        at: usize,
    ) -> (Vec<CowBytes>, Vec<ChildSlot>, CowBytes) {
        debug_assert!(at >= 1 && at < self.bp.len());
        let right_slots = self.bp.split_off(at);
        let mut right_pivots = self.pivots.split_off(at - 1);
        let separator = right_pivots.remove(0);
        self.totalchildkeylens -= separator.len();
        self.totalchildkeylens -= right_pivots.iter().map(|p| p.len()).sum::<usize>();
        self.dirty = true;
        (right_pivots, right_slots, separator)
    }

    // -- partition access ---------------------------------------------

    pub fn partition_state(&self, i: usize) -> &Partition {
        &self.bp[i].state
    }

    pub fn basement(&self, i: usize) -> Option<&Basement> {
        match &self.bp[i].state {
            Partition::Avail(PartitionBody::Leaf(bn)) => Some(bn),
            _ => None,
        }
    }

    pub fn basement_mut(&mut self, i: usize) -> Option<&mut Basement> {
        match &mut self.bp[i].state {
            Partition::Avail(PartitionBody::Leaf(bn)) => Some(bn),
            _ => None,
        }
    }

    pub fn fifo(&self, i: usize) -> Option<&MsgFifo> {
        match &self.bp[i].state {
            Partition::Avail(PartitionBody::Internal(fifo)) => Some(fifo),
            _ => None,
        }
    }

    pub fn fifo_mut(&mut self, i: usize) -> Option<&mut MsgFifo> {
        match &mut self.bp[i].state {
            Partition::Avail(PartitionBody::Internal(fifo)) => Some(fifo),
            _ => None,
        }
    }

    /// Bumps the partition's clock; partial eviction spares recently
    /// touched partitions.
    pub fn touch(&mut self, i: usize) {
        self.bp[i].clock = self.bp[i].clock.saturating_add(1).min(2);
    }

    /// Decompresses partition `i` if needed. Errors on `OnDisk` and
    /// `Invalid`, which require the cache's partial fetch.
    pub fn materialize(&mut self, i: usize, compression: &CompressionMode) -> io::Result<()> {
        let slot = &mut self.bp[i];
        match &slot.state {
            Partition::Avail(_) => Ok(()),
            Partition::Compressed(part) => {
                let raw = compression.decompress(&part.bytes, part.uncompressed_len as usize)?;
                let body = PartitionBody::unpack(&raw[..], self.height)?;
                slot.state = Partition::Avail(body);
                Ok(())
            }
            Partition::OnDisk | Partition::Invalid => Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                format!("partition {} is {}", i, slot.state.state_name()),
            )),
        }
    }

    /// True iff some partition the query needs is not yet `Avail`.
    pub fn partial_fetch_required(&self, hint: &FetchHint) -> bool {
        (0..self.n_children()).any(|i| hint.wants(self, i) && !self.bp[i].state.is_avail())
    }

    /// Materializes every partition `hint` selects.
    pub fn materialize_for(
        &mut self,
        hint: &FetchHint,
        compression: &CompressionMode,
    ) -> io::Result<()> {
        for i in 0..self.n_children() {
            if hint.wants(self, i) && !self.bp[i].state.is_avail() {
                self.materialize(i, compression)?;
                self.touch(i);
            }
        }
        Ok(())
    }

    /// Restores non-resident partitions from a full block image, leaving
    /// them `Compressed`. Used by partial fetch and before repacking a
    /// node that still has `OnDisk` partitions.
    pub fn load_compressed_parts(&mut self, image: &[u8]) -> io::Result<()> {
        let dir = Self::read_directory(image)?;
        for (i, slot) in self.bp.iter_mut().enumerate() {
            if let Partition::OnDisk = slot.state {
                let d = &dir[i];
                let bytes = &image[d.offset as usize..d.offset as usize + d.compressed_len as usize];
                if checksum_of(bytes).to_u64() != d.checksum {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "sub-block checksum mismatch",
                    ));
                }
                slot.state = Partition::Compressed(CompressedPart {
                    bytes: bytes.into(),
                    uncompressed_len: d.uncompressed_len,
                });
            }
        }
        Ok(())
    }

    /// One partial-eviction step over all partitions: cold `Avail`
    /// partitions are compressed, cold `Compressed` partitions drop to
    /// `OnDisk`. Only legal on clean nodes. Returns the bytes freed.
    pub fn partial_evict(&mut self, compression: &CompressionMode) -> io::Result<usize> {
        debug_assert!(!self.dirty);
        let mut freed = 0;
        for slot in &mut self.bp {
            if slot.clock > 0 {
                slot.clock -= 1;
                continue;
            }
            match &slot.state {
                Partition::Avail(body) => {
                    let before = body.memsize();
                    let mut raw = Vec::with_capacity(body.disksize());
                    body.pack(&mut raw)?;
                    let bytes = compression.compress(&raw)?;
                    slot.on_disk_len = raw.len() as u32;
                    freed += before.saturating_sub(bytes.len());
                    slot.state = Partition::Compressed(CompressedPart {
                        bytes: bytes.into_boxed_slice(),
                        uncompressed_len: raw.len() as u32,
                    });
                }
                Partition::Compressed(part) => {
                    freed += part.bytes.len();
                    slot.state = Partition::OnDisk;
                }
                Partition::OnDisk | Partition::Invalid => {}
            }
        }
        Ok(freed)
    }

    // -- message application ------------------------------------------

    /// Applies a stamped message to this leaf. Targeted messages go to
    /// the owning basement; broadcasts sweep every resident basement.
    /// Partitions that are not `Avail` pick the message up on their next
    /// load through MSN-gated replay.
    pub fn apply_to_leaf<M: UpdateAction>(
        &mut self,
        msg: &Message,
        gc: &GcContext,
        action: &M,
    ) -> isize {
        debug_assert!(self.is_leaf());
        let mut delta = 0;
        if msg.is_broadcast() {
            for i in 0..self.n_children() {
                if let Some(bn) = self.basement_mut(i) {
                    delta += bn.apply_message(msg, gc, action);
                }
            }
        } else {
            let i = self.which_child(msg.key());
            if let Some(bn) = self.basement_mut(i) {
                delta += bn.apply_message(msg, gc, action);
            }
            self.bp[i].estimate.invalidate();
        }
        if msg.msn() > self.max_msn_applied_in_memory {
            self.max_msn_applied_in_memory = msg.msn();
        }
        self.dirty = true;
        delta
    }

    /// Eagerly applies a freshly stamped message to this warm leaf's
    /// in-memory state. Only basements that are resident and current
    /// take it; everything else catches up through MSN-gated replay.
    /// The node stays clean: the on-disk copy is refreshed by flushes
    /// alone.
    pub(crate) fn apply_eager<M: UpdateAction>(
        &mut self,
        msg: &Message,
        gc: &GcContext,
        action: &M,
    ) {
        debug_assert!(self.is_leaf());
        let mut applied_msn = self.max_msn_applied_in_memory;
        let targets: Vec<usize> = if msg.is_broadcast() {
            (0..self.n_children()).collect()
        } else {
            vec![self.which_child(msg.key())]
        };
        for i in targets {
            if let Some(bn) = self.basement_mut(i) {
                if bn.is_up_to_date() {
                    bn.apply_message(msg, gc, action);
                    applied_msn = applied_msn.max(msg.msn());
                }
            }
        }
        self.max_msn_applied_in_memory = applied_msn;
    }

    /// Buffers a stamped message in this nonleaf node. Targeted messages
    /// enqueue once; broadcasts are duplicated into every child FIFO.
    pub fn enqueue_msg(&mut self, msg: &Message, compression: &CompressionMode) -> io::Result<isize> {
        debug_assert!(!self.is_leaf());
        debug_assert!(msg.msn() > self.max_msn_applied_in_memory);
        let mut delta = 0isize;
        if msg.is_broadcast() {
            for i in 0..self.n_children() {
                self.materialize(i, compression)?;
                let fifo = self.fifo_mut(i).expect("materialized nonleaf partition");
                fifo.enqueue(msg.clone());
                delta += msg.serialize_size() as isize;
            }
        } else {
            let i = self.which_child(msg.key());
            self.materialize(i, compression)?;
            let fifo = self.fifo_mut(i).expect("materialized nonleaf partition");
            fifo.enqueue(msg.clone());
            self.bp[i].estimate.invalidate();
            delta = msg.serialize_size() as isize;
        }
        self.max_msn_applied_in_memory = msg.msn();
        self.dirty = true;
        Ok(delta)
    }

    /// Index of the child with the most buffered bytes, ties broken by
    /// the lowest index.
    pub fn heaviest_child(&self) -> Option<usize> {
        (0..self.n_children())
            .filter_map(|i| self.fifo(i).map(|f| (i, f.n_bytes())))
            .filter(|&(_, bytes)| bytes > 0)
            .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
            .map(|(i, _)| i)
    }

    // -- size and reactivity ------------------------------------------

    /// Serialized size estimate using uncompressed payload lengths.
    pub fn serialized_size(&self) -> usize {
        let prefix = 8 + 4 + 4 + 4 + 4 + 4 + 1 + 4 + 8 + 8;
        let pivots: usize = self.pivots.iter().map(|p| 4 + p.len()).sum();
        let children = if self.is_leaf() { 0 } else { 8 * self.n_children() };
        let directory = self.n_children() * DirEntry::WIRE_LEN;
        let payload: usize = self
            .bp
            .iter()
            .map(|slot| match &slot.state {
                Partition::Avail(body) => body.disksize(),
                Partition::Compressed(part) => part.uncompressed_len as usize,
                Partition::OnDisk | Partition::Invalid => slot.on_disk_len as usize,
            })
            .sum();
        prefix + pivots + children + directory + payload + 8
    }

    /// Whether this nonleaf node is over target with pending messages,
    /// the precondition for a flush.
    pub fn is_gorged(&self) -> bool {
        !self.is_leaf()
            && self.serialized_size() > self.nodesize as usize
            && self.bp.iter().any(|slot| match &slot.state {
                Partition::Avail(PartitionBody::Internal(f)) => !f.is_empty(),
                _ => false,
            })
    }

    /// Total resident leaf entries.
    pub fn leaf_entry_count(&self) -> usize {
        (0..self.n_children())
            .filter_map(|i| self.basement(i))
            .map(|bn| bn.len())
            .sum()
    }

    pub fn reactivity(&self, cfg: &EngineConfig) -> Reactivity {
        if self.is_leaf() {
            let size = self.serialized_size();
            if size > self.nodesize as usize && self.leaf_entry_count() > 1 {
                Reactivity::Fissible
            } else if size * 4 < self.nodesize as usize && !self.last_basement_seqinsert_hot() {
                Reactivity::Fusible
            } else {
                Reactivity::Stable
            }
        } else if self.n_children() > cfg.fanout {
            Reactivity::Fissible
        } else if self.n_children() * 4 < cfg.fanout {
            Reactivity::Fusible
        } else {
            Reactivity::Stable
        }
    }

    fn last_basement_seqinsert_hot(&self) -> bool {
        self.basement(self.n_children() - 1)
            .map_or(false, |bn| bn.seqinsert_hot())
    }

    /// Recomputes leaf estimates from resident basements.
    pub(crate) fn recompute_leaf_estimates(&mut self) {
        debug_assert!(self.is_leaf());
        for i in 0..self.n_children() {
            let est = match self.basement(i) {
                Some(bn) => SubtreeEstimates {
                    nkeys: bn.iter().filter(|le| !le.latest_is_del()).count() as u64,
                    ndata: bn.len() as u64,
                    dsize: bn
                        .iter()
                        .map(|le| le.keylen() as u64 + le.latest_val().map_or(0, |v| v.len() as u64))
                        .sum(),
                    exact: true,
                },
                None => {
                    let mut est = self.bp[i].estimate;
                    est.invalidate();
                    est
                }
            };
            self.bp[i].estimate = est;
        }
    }

    /// Sum of the per-child estimates.
    pub fn aggregate_estimates(&self) -> SubtreeEstimates {
        let mut total = SubtreeEstimates::default();
        for slot in &self.bp {
            total.accumulate(&slot.estimate);
        }
        total
    }

    /// Re-chunks a leaf's entries into partitions of roughly
    /// `basementsize` bytes, rebuilding the internal pivots. All
    /// partitions must be resident.
    pub(crate) fn rebalance_basements(&mut self, basementsize: usize) {
        debug_assert!(self.is_leaf());
        debug_assert!(self.bp.iter().all(|s| s.state.is_avail()));
        let msn = self
            .bp
            .iter()
            .filter_map(|s| match &s.state {
                Partition::Avail(PartitionBody::Leaf(bn)) => Some(bn.max_msn_applied()),
                _ => None,
            })
            .max()
            .unwrap_or(Msn::MIN);
        let mut entries = Vec::with_capacity(self.leaf_entry_count());
        for slot in self.bp.drain(..) {
            if let Partition::Avail(PartitionBody::Leaf(bn)) = slot.state {
                entries.extend(bn.into_entries());
            }
        }
        self.pivots.clear();
        self.totalchildkeylens = 0;

        let mut chunk = Vec::new();
        let mut chunk_bytes = 0;
        let mut chunks = Vec::new();
        for le in entries {
            chunk_bytes += le.memsize();
            chunk.push(le);
            if chunk_bytes >= basementsize {
                chunks.push(std::mem::take(&mut chunk));
                chunk_bytes = 0;
            }
        }
        if !chunk.is_empty() || chunks.is_empty() {
            chunks.push(chunk);
        }
        let n = chunks.len();
        for (i, chunk) in chunks.into_iter().enumerate() {
            if i + 1 < n {
                let pivot = chunk.last().expect("non-final chunks are non-empty").key().clone();
                self.totalchildkeylens += pivot.len();
                self.pivots.push(pivot);
            }
            self.bp.push(ChildSlot::new_avail(PartitionBody::Leaf(
                Basement::from_entries(chunk, msn),
            )));
        }
        self.recompute_leaf_estimates();
        self.dirty = true;
    }

    // -- codec ---------------------------------------------------------

    /// Serializes the full node. Every partition must be `Avail` or
    /// `Compressed`; restore `OnDisk` partitions first with
    /// [Node::load_compressed_parts]. Moves the on-disk MSN watermark up
    /// to the in-memory one.
    pub fn pack(&mut self, compression: &CompressionMode) -> io::Result<Vec<u8>> {
        self.max_msn_applied_on_disk = self.max_msn_applied_in_memory;

        let mut payloads = Vec::with_capacity(self.bp.len());
        for slot in &mut self.bp {
            let (bytes, uncompressed_len) = match &slot.state {
                Partition::Avail(body) => {
                    let mut raw = Vec::with_capacity(body.disksize());
                    body.pack(&mut raw)?;
                    let compressed = compression.compress(&raw)?;
                    (compressed, raw.len() as u32)
                }
                Partition::Compressed(part) => (part.bytes.to_vec(), part.uncompressed_len),
                Partition::OnDisk | Partition::Invalid => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("cannot pack {} partition", slot.state.state_name()),
                    ))
                }
            };
            slot.on_disk_len = uncompressed_len;
            payloads.push((bytes, uncompressed_len));
        }

        let mut out = Vec::with_capacity(self.serialized_size());
        out.write_all(NODE_MAGIC)?;
        out.write_u32::<LittleEndian>(self.layout_version)?;
        out.write_u32::<LittleEndian>(LAYOUT_VERSION)?;
        out.write_u32::<LittleEndian>(BUILD_ID)?;
        out.write_u32::<LittleEndian>(self.nodesize)?;
        out.write_u32::<LittleEndian>(self.flags)?;
        out.write_u8(self.height)?;
        out.write_u32::<LittleEndian>(self.bp.len() as u32)?;
        out.write_u64::<LittleEndian>(self.blocknum.0)?;
        out.write_u64::<LittleEndian>(self.max_msn_applied_on_disk.0)?;
        for pivot in &self.pivots {
            out.write_u32::<LittleEndian>(pivot.len() as u32)?;
            out.write_all(pivot)?;
        }
        if !self.is_leaf() {
            for slot in &self.bp {
                out.write_u64::<LittleEndian>(slot.child.expect("nonleaf child").0)?;
            }
        }

        let dir_start = out.len();
        let payload_start = dir_start + self.bp.len() * DirEntry::WIRE_LEN;
        let mut offset = payload_start as u32;
        for (slot, (bytes, uncompressed_len)) in self.bp.iter().zip(&payloads) {
            let entry = DirEntry {
                offset,
                compressed_len: bytes.len() as u32,
                uncompressed_len: *uncompressed_len,
                state_on_disk: 1,
                checksum: checksum_of(bytes).to_u64(),
                estimate: slot.estimate,
            };
            entry.pack(&mut out)?;
            offset += bytes.len() as u32;
        }
        for (bytes, _) in &payloads {
            out.write_all(bytes)?;
        }
        let trailer = checksum_of(&out).to_u64();
        out.write_u64::<LittleEndian>(trailer)?;
        Ok(out)
    }

    fn read_directory(image: &[u8]) -> io::Result<Vec<DirEntry>> {
        let mut r = Cursor::new(image);
        let mut magic = [0u8; 8];
        r.read_exact(&mut magic)?;
        if &magic != NODE_MAGIC {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "bad node magic"));
        }
        let _layout_version = r.read_u32::<LittleEndian>()?;
        let _layout_version_current = r.read_u32::<LittleEndian>()?;
        let _build_id = r.read_u32::<LittleEndian>()?;
        let _nodesize = r.read_u32::<LittleEndian>()?;
        let _flags = r.read_u32::<LittleEndian>()?;
        let height = r.read_u8()?;
        let n_children = r.read_u32::<LittleEndian>()? as usize;
        let _blocknum = r.read_u64::<LittleEndian>()?;
        let _msn = r.read_u64::<LittleEndian>()?;
        for _ in 1..n_children {
            let len = r.read_u32::<LittleEndian>()? as usize;
            r.set_position(r.position() + len as u64);
        }
        if height > 0 {
            r.set_position(r.position() + 8 * n_children as u64);
        }
        let mut dir = Vec::with_capacity(n_children);
        for _ in 0..n_children {
            dir.push(DirEntry::unpack(&mut r)?);
        }
        Ok(dir)
    }

    /// Deserializes a node image. The whole-node checksum is always
    /// verified; partitions wanted by `hint` are decompressed to
    /// `Avail`, the rest stay `Compressed`.
    pub fn unpack(image: &[u8], hint: &FetchHint, compression: &CompressionMode) -> io::Result<Self> {
        if image.len() < 8 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "short node"));
        }
        let (body, trailer) = image.split_at(image.len() - 8);
        let stored = u64::from_le_bytes(trailer.try_into().unwrap());
        if checksum_of(body).to_u64() != stored {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "node checksum mismatch",
            ));
        }

        let mut r = Cursor::new(body);
        let mut magic = [0u8; 8];
        r.read_exact(&mut magic)?;
        if &magic != NODE_MAGIC {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "bad node magic"));
        }
        let layout_version = r.read_u32::<LittleEndian>()?;
        let _layout_version_current = r.read_u32::<LittleEndian>()?;
        let _build_id = r.read_u32::<LittleEndian>()?;
        let nodesize = r.read_u32::<LittleEndian>()?;
        let flags = r.read_u32::<LittleEndian>()?;
        let height = r.read_u8()?;
        let n_children = r.read_u32::<LittleEndian>()? as usize;
        let blocknum = Blocknum(r.read_u64::<LittleEndian>()?);
        let msn = Msn(r.read_u64::<LittleEndian>()?);

        let mut pivots = Vec::with_capacity(n_children.saturating_sub(1));
        for _ in 1..n_children {
            let len = r.read_u32::<LittleEndian>()? as usize;
            let mut key = vec![0; len];
            r.read_exact(&mut key)?;
            pivots.push(CowBytes::from(key));
        }
        let mut children = Vec::with_capacity(n_children);
        if height > 0 {
            for _ in 0..n_children {
                children.push(Some(Blocknum(r.read_u64::<LittleEndian>()?)));
            }
        } else {
            children.resize(n_children, None);
        }
        let mut dir = Vec::with_capacity(n_children);
        for _ in 0..n_children {
            dir.push(DirEntry::unpack(&mut r)?);
        }

        let totalchildkeylens = pivots.iter().map(|p| p.len()).sum();
        let mut node = Node {
            blocknum,
            height,
            nodesize,
            flags,
            layout_version,
            dirty: false,
            max_msn_applied_on_disk: msn,
            max_msn_applied_in_memory: msn,
            pivots,
            bp: Vec::with_capacity(n_children),
            totalchildkeylens,
        };

        for (i, d) in dir.iter().enumerate() {
            let bytes = image
                .get(d.offset as usize..d.offset as usize + d.compressed_len as usize)
                .ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidData, "partition out of bounds")
                })?;
            if checksum_of(bytes).to_u64() != d.checksum {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "sub-block checksum mismatch",
                ));
            }
            node.bp.push(ChildSlot {
                child: children[i],
                state: Partition::Compressed(CompressedPart {
                    bytes: bytes.into(),
                    uncompressed_len: d.uncompressed_len,
                }),
                clock: 0,
                estimate: d.estimate,
                on_disk_len: d.uncompressed_len,
            });
        }
        for i in 0..node.n_children() {
            if hint.wants(&node, i) {
                node.materialize(i, compression)?;
                node.touch(i);
            }
        }
        Ok(node)
    }
}

impl Size for Node {
    fn size(&self) -> usize {
        let header = 128 + self.totalchildkeylens;
        let partitions: usize = self
            .bp
            .iter()
            .map(|slot| match &slot.state {
                Partition::Avail(body) => body.memsize(),
                Partition::Compressed(part) => part.bytes.len() + 16,
                Partition::OnDisk | Partition::Invalid => 16,
            })
            .sum();
        header + partitions
    }
}

/// Per-child directory entry: partitions are independently addressable
/// so partial fetch can read one without touching its siblings.
#[derive(Debug, Clone)]
struct DirEntry {
    offset: u32,
    compressed_len: u32,
    uncompressed_len: u32,
    state_on_disk: u8,
    checksum: u64,
    estimate: SubtreeEstimates,
}

impl DirEntry {
    const WIRE_LEN: usize = 4 + 4 + 4 + 1 + 8 + (8 + 8 + 8 + 1);

    fn pack<W: Write>(&self, mut w: W) -> io::Result<()> {
        w.write_u32::<LittleEndian>(self.offset)?;
        w.write_u32::<LittleEndian>(self.compressed_len)?;
        w.write_u32::<LittleEndian>(self.uncompressed_len)?;
        w.write_u8(self.state_on_disk)?;
        w.write_u64::<LittleEndian>(self.checksum)?;
        self.estimate.pack(&mut w)
    }

    fn unpack<R: Read>(mut r: R) -> io::Result<Self> {
        Ok(DirEntry {
            offset: r.read_u32::<LittleEndian>()?,
            compressed_len: r.read_u32::<LittleEndian>()?,
            uncompressed_len: r.read_u32::<LittleEndian>()?,
            state_on_disk: r.read_u8()?,
            checksum: r.read_u64::<LittleEndian>()?,
            estimate: SubtreeEstimates::unpack(&mut r)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cow_bytes::SlicedCowBytes,
        message::{MessageType, Xids},
        tree::DefaultUpdateAction,
    };

    fn insert_msg(key: &[u8], val: &[u8], msn: u64) -> Message {
        Message::new(
            MessageType::Insert,
            Xids::root(),
            CowBytes::from(key),
            CowBytes::from(val).into(),
        )
        .with_msn(Msn(msn))
    }

    fn leaf_with_keys(n: u64) -> Node {
        let mut node = Node::empty_leaf(Blocknum(7), 4096);
        for i in 0..n {
            node.apply_to_leaf(
                &insert_msg(&i.to_be_bytes(), b"value", i + 1),
                &GcContext::default(),
                &DefaultUpdateAction,
            );
        }
        node
    }

    #[test]
    fn which_child_routes_half_open_ranges() {
        let mut node = Node::init_empty(Blocknum(1), 1, 0, 4096, 0);
        node.append_child(
            ChildSlot {
                child: Some(Blocknum(10)),
                state: Partition::Avail(PartitionBody::Internal(MsgFifo::new())),
                ..ChildSlot::default()
            },
            None,
        );
        for (i, pivot) in [b"c", b"f"].iter().enumerate() {
            node.append_child(
                ChildSlot {
                    child: Some(Blocknum(11 + i as u64)),
                    state: Partition::Avail(PartitionBody::Internal(MsgFifo::new())),
                    ..ChildSlot::default()
                },
                Some(CowBytes::from(*pivot)),
            );
        }
        // Ranges: (-inf, c], (c, f], (f, +inf)
        assert_eq!(node.which_child(b"a"), 0);
        assert_eq!(node.which_child(b"c"), 0);
        assert_eq!(node.which_child(b"d"), 1);
        assert_eq!(node.which_child(b"f"), 1);
        assert_eq!(node.which_child(b"g"), 2);
    }

    #[test]
    fn pack_unpack_roundtrip_leaf() {
        let mut node = leaf_with_keys(50);
        node.rebalance_basements(256);
        assert!(node.n_children() > 1);
        let image = node.pack(&CompressionMode::default()).unwrap();
        let restored = Node::unpack(&image, &FetchHint::All, &CompressionMode::default()).unwrap();
        assert_eq!(restored.n_children(), node.n_children());
        assert_eq!(restored.pivots(), node.pivots());
        assert_eq!(restored.leaf_entry_count(), node.leaf_entry_count());
        assert_eq!(
            restored.max_msn_applied_on_disk(),
            node.max_msn_applied_in_memory()
        );
        assert!(!restored.is_dirty());
    }

    #[test]
    fn unpack_with_none_hint_keeps_partitions_compressed() {
        let mut node = leaf_with_keys(50);
        node.rebalance_basements(256);
        let image = node.pack(&CompressionMode::default()).unwrap();
        let restored = Node::unpack(&image, &FetchHint::None, &CompressionMode::default()).unwrap();
        assert!((0..restored.n_children()).all(|i| !restored.slot(i).state.is_avail()));
        assert!(restored.partial_fetch_required(&FetchHint::All));
        // The subset hint faults in only the routed partition.
        let key = 0u64.to_be_bytes();
        let restored = Node::unpack(
            &image,
            &FetchHint::Subset(vec![CowBytes::from(&key[..])]),
            &CompressionMode::default(),
        )
        .unwrap();
        assert!(restored.slot(0).state.is_avail());
        assert!(!restored.slot(restored.n_children() - 1).state.is_avail());
    }

    #[test]
    fn corrupted_image_is_rejected() {
        let mut node = leaf_with_keys(8);
        let mut image = node.pack(&CompressionMode::default()).unwrap();
        let mid = image.len() / 2;
        image[mid] ^= 0xff;
        assert!(Node::unpack(&image, &FetchHint::All, &CompressionMode::default()).is_err());
    }

    #[test]
    fn partial_evict_cycles_states() {
        let mut node = leaf_with_keys(20);
        node.mark_clean();
        let freed = node.partial_evict(&CompressionMode::default()).unwrap();
        assert!(freed > 0);
        assert!(matches!(node.slot(0).state, Partition::Compressed(_)));
        let _ = node.partial_evict(&CompressionMode::default()).unwrap();
        assert!(matches!(node.slot(0).state, Partition::OnDisk));
        // Restore from the packed image.
        let mut full = leaf_with_keys(20);
        let image = full.pack(&CompressionMode::default()).unwrap();
        node.load_compressed_parts(&image).unwrap();
        node.materialize(0, &CompressionMode::default()).unwrap();
        assert_eq!(node.leaf_entry_count(), 20);
    }

    #[test]
    fn gorged_requires_size_and_messages() {
        let mut node = Node::init_empty(Blocknum(1), 1, 0, 512, 0);
        node.append_child(
            ChildSlot {
                child: Some(Blocknum(2)),
                state: Partition::Avail(PartitionBody::Internal(MsgFifo::new())),
                ..ChildSlot::default()
            },
            None,
        );
        assert!(!node.is_gorged());
        let mut msn: u64 = 1;
        while !node.is_gorged() {
            node.enqueue_msg(
                &insert_msg(&msn.to_be_bytes(), &[0u8; 64], msn),
                &CompressionMode::default(),
            )
            .unwrap();
            msn += 1;
        }
        assert!(node.serialized_size() > 512);
    }

    #[test]
    fn heaviest_child_prefers_lowest_index_on_tie() {
        let mut node = Node::init_empty(Blocknum(1), 1, 0, 4096, 0);
        for i in 0..3u64 {
            node.append_child(
                ChildSlot {
                    child: Some(Blocknum(10 + i)),
                    state: Partition::Avail(PartitionBody::Internal(MsgFifo::new())),
                    ..ChildSlot::default()
                },
                if i == 0 {
                    None
                } else {
                    Some(CowBytes::from(format!("p{}", i).into_bytes()))
                },
            );
        }
        assert_eq!(node.heaviest_child(), None);
        node.fifo_mut(1).unwrap().enqueue(insert_msg(b"p0x", b"v", 1));
        node.fifo_mut(2).unwrap().enqueue(insert_msg(b"zzz", b"v", 2));
        // Same payload size: child 1 wins the tie.
        assert_eq!(node.heaviest_child(), Some(1));
    }

    #[test]
    fn reactivity_thresholds() {
        let cfg = EngineConfig {
            nodesize: 4096,
            fanout: 4,
            ..EngineConfig::default()
        };
        // Descending inserts keep the sequential-insert hint cold, so
        // the tiny leaf is fusible.
        let mut leaf = Node::empty_leaf(Blocknum(7), 4096);
        for (msn, i) in [1u64, 0].into_iter().enumerate() {
            leaf.apply_to_leaf(
                &insert_msg(&i.to_be_bytes(), b"value", msn as u64 + 1),
                &GcContext::default(),
                &DefaultUpdateAction,
            );
        }
        assert_eq!(leaf.reactivity(&cfg), Reactivity::Fusible);
        let mut nonleaf = Node::init_empty(Blocknum(1), 1, 0, 4096, 0);
        for i in 0..5u64 {
            nonleaf.append_child(
                ChildSlot {
                    child: Some(Blocknum(10 + i)),
                    state: Partition::Avail(PartitionBody::Internal(MsgFifo::new())),
                    ..ChildSlot::default()
                },
                if i == 0 {
                    None
                } else {
                    Some(CowBytes::from(i.to_be_bytes().to_vec()))
                },
            );
        }
        assert_eq!(nonleaf.reactivity(&cfg), Reactivity::Fissible);
    }
}
