//! MVCC leaf entries.
//!
//! A [LeafEntry] holds for one key either a single committed value or a
//! committed slot plus a stack of uncommitted provisional operations
//! keyed by transaction path. [LeafEntry::apply_message] is the sole
//! mutator; everything else is read-only.

use crate::{
    cow_bytes::{CowBytes, SlicedCowBytes},
    message::{Message, MessageType, TxnId, Xids},
    size::Size,
    tree::{UpdateAction, UpdateResult},
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

const LE_CLEAN: u8 = 0;
const LE_MVCC: u8 = 1;

/// The committed slot of an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Committed {
    Value(SlicedCowBytes),
    Tombstone,
}

/// One uncommitted operation, keyed by the full transaction path that
/// issued it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provisional {
    pub xids: Xids,
    pub op: ProvisionalOp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionalOp {
    Insert(SlicedCowBytes),
    Delete,
}

impl ProvisionalOp {
    fn val_len(&self) -> usize {
        match self {
            ProvisionalOp::Insert(v) => v.len(),
            ProvisionalOp::Delete => 0,
        }
    }
}

/// Transaction state consulted while applying messages.
#[derive(Debug, Clone, Copy, Default)]
pub struct GcContext {
    /// No live transaction has an id below this; provisional entries
    /// older than it are quiescent and may be promoted. The default is
    /// [TxnId::NONE]: without a proven watermark every transaction
    /// counts as live and optimize messages promote nothing.
    pub oldest_live: TxnId,
}

/// Reader-side MVCC context.
#[derive(Debug, Clone, Default)]
pub struct ReadContext {
    /// The reader's own transaction path. Values written anywhere along
    /// it are visible to the reader.
    pub xids: Xids,
    /// Committed values created by transactions below this id are
    /// visible regardless of the live set.
    pub oldest_live_in_snapshot: TxnId,
    /// Whether this reader pins the committed set chosen at cursor
    /// creation.
    pub snapshot: bool,
}

impl ReadContext {
    /// A non-transactional reader observing everything committed.
    pub fn latest() -> Self {
        ReadContext {
            xids: Xids::root(),
            oldest_live_in_snapshot: TxnId(u64::MAX),
            snapshot: false,
        }
    }

    /// Visibility rule: a value written by `creator` is accepted iff
    /// `creator` is the reader's ancestor or it committed before the
    /// snapshot horizon.
    pub fn does_txn_read_entry(&self, creator: TxnId) -> bool {
        creator == TxnId::NONE
            || self.xids.contains(creator)
            || creator < self.oldest_live_in_snapshot
    }
}

/// An entry of one basement node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeafEntry {
    Clean {
        key: CowBytes,
        val: SlicedCowBytes,
    },
    Mvcc {
        key: CowBytes,
        committed: Committed,
        stack: Vec<Provisional>,
    },
}

impl LeafEntry {
    pub fn key(&self) -> &CowBytes {
        match self {
            LeafEntry::Clean { key, .. } | LeafEntry::Mvcc { key, .. } => key,
        }
    }

    pub fn keylen(&self) -> usize {
        self.key().len()
    }

    pub fn is_clean(&self) -> bool {
        matches!(self, LeafEntry::Clean { .. })
    }

    /// The newest operation regardless of visibility: the innermost
    /// provisional op, or the committed slot.
    pub fn latest_val(&self) -> Option<&SlicedCowBytes> {
        match self {
            LeafEntry::Clean { val, .. } => Some(val),
            LeafEntry::Mvcc {
                committed, stack, ..
            } => match stack.last() {
                Some(Provisional {
                    op: ProvisionalOp::Insert(v),
                    ..
                }) => Some(v),
                Some(Provisional {
                    op: ProvisionalOp::Delete,
                    ..
                }) => None,
                None => match committed {
                    Committed::Value(v) => Some(v),
                    Committed::Tombstone => None,
                },
            },
        }
    }

    /// Whether the newest operation is a delete.
    pub fn latest_is_del(&self) -> bool {
        !self.is_clean() && self.latest_val().is_none()
    }

    /// Whether any provisional operation was issued on the given
    /// transaction path or below it.
    pub fn has_xids(&self, xids: &Xids) -> bool {
        match self {
            LeafEntry::Clean { .. } => false,
            LeafEntry::Mvcc { stack, .. } => stack.iter().any(|p| xids.is_prefix_of(&p.xids)),
        }
    }

    /// The value this reader observes, `None` for not-present.
    pub fn read_visible(&self, ctx: &ReadContext) -> Option<SlicedCowBytes> {
        match self {
            LeafEntry::Clean { val, .. } => Some(val.clone()),
            LeafEntry::Mvcc {
                committed, stack, ..
            } => {
                for p in stack.iter().rev() {
                    if ctx.does_txn_read_entry(p.xids.innermost()) {
                        return match &p.op {
                            ProvisionalOp::Insert(v) => Some(v.clone()),
                            ProvisionalOp::Delete => None,
                        };
                    }
                }
                match committed {
                    Committed::Value(v) => Some(v.clone()),
                    Committed::Tombstone => None,
                }
            }
        }
    }

    /// In-memory footprint.
    pub fn memsize(&self) -> usize {
        match self {
            LeafEntry::Clean { key, val } => 24 + key.len() + val.len(),
            LeafEntry::Mvcc {
                key,
                committed,
                stack,
            } => {
                let committed_len = match committed {
                    Committed::Value(v) => v.len(),
                    Committed::Tombstone => 0,
                };
                48 + key.len()
                    + committed_len
                    + stack
                        .iter()
                        .map(|p| p.xids.serialize_size() + p.op.val_len() + 16)
                        .sum::<usize>()
            }
        }
    }

    /// Serialized length.
    pub fn disksize(&self) -> usize {
        match self {
            LeafEntry::Clean { key, val } => 1 + 4 + key.len() + 4 + val.len(),
            LeafEntry::Mvcc {
                key,
                committed,
                stack,
            } => {
                let committed_len = match committed {
                    Committed::Value(v) => 1 + 4 + v.len(),
                    Committed::Tombstone => 1,
                };
                1 + 4
                    + key.len()
                    + committed_len
                    + 4
                    + stack
                        .iter()
                        .map(|p| p.xids.serialize_size() + 1 + 4 + p.op.val_len())
                        .sum::<usize>()
            }
        }
    }

    /// Collapses an entry whose stack emptied back to its minimal form.
    /// `None` means the entry vanishes from the basement.
    fn normalize(key: CowBytes, committed: Committed, stack: Vec<Provisional>) -> Option<LeafEntry> {
        if stack.is_empty() {
            return match committed {
                Committed::Value(val) => Some(LeafEntry::Clean { key, val }),
                Committed::Tombstone => None,
            };
        }
        Some(LeafEntry::Mvcc {
            key,
            committed,
            stack,
        })
    }

    fn into_parts(self) -> (CowBytes, Committed, Vec<Provisional>) {
        match self {
            LeafEntry::Clean { key, val } => (key, Committed::Value(val), Vec::new()),
            LeafEntry::Mvcc {
                key,
                committed,
                stack,
            } => (key, committed, stack),
        }
    }

    /// Applies one message to an entry slot, producing the new entry.
    ///
    /// `key` is the slot key: the message key for targeted messages, the
    /// entry's own key when a broadcast sweeps an existing entry.
    ///
    /// This is the only way leaf state changes. MSN gating happens in the
    /// basement; a message reaching this function is known to be newer
    /// than anything the entry has absorbed.
    pub fn apply_message<M: UpdateAction>(
        key: &CowBytes,
        old: Option<&LeafEntry>,
        msg: &Message,
        gc: &GcContext,
        action: &M,
    ) -> Option<LeafEntry> {
        match msg.ty() {
            MessageType::None => old.cloned(),

            MessageType::Insert => {
                Self::apply_insert(old, key.clone(), msg.val().clone(), msg.xids())
            }

            MessageType::InsertNoOverwrite => {
                // A live value preserves the entry untouched.
                let live = old.map_or(false, |le| !le.latest_is_del());
                if live {
                    old.cloned()
                } else {
                    Self::apply_insert(old, key.clone(), msg.val().clone(), msg.xids())
                }
            }

            MessageType::DeleteAny => match old {
                None => None,
                Some(le) => {
                    if msg.xids().is_root() {
                        // Committed delete, nothing to retain.
                        None
                    } else {
                        let (key, committed, mut stack) = le.clone().into_parts();
                        stack.retain(|p| p.xids != *msg.xids());
                        stack.push(Provisional {
                            xids: msg.xids().clone(),
                            op: ProvisionalOp::Delete,
                        });
                        Self::normalize(key, committed, stack)
                    }
                }
            },

            MessageType::CommitAny | MessageType::CommitBroadcastTxn => {
                Self::apply_commit(old, msg.xids())
            }

            MessageType::AbortAny | MessageType::AbortBroadcastTxn => {
                Self::apply_abort(old, msg.xids())
            }

            MessageType::CommitBroadcastAll => match old {
                None => None,
                Some(le) => {
                    let (key, committed, stack) = le.clone().into_parts();
                    let committed = match stack.last() {
                        Some(Provisional {
                            op: ProvisionalOp::Insert(v),
                            ..
                        }) => Committed::Value(v.clone()),
                        Some(Provisional {
                            op: ProvisionalOp::Delete,
                            ..
                        }) => Committed::Tombstone,
                        None => committed,
                    };
                    Self::normalize(key, committed, Vec::new())
                }
            },

            MessageType::Update | MessageType::UpdateBroadcastAll => {
                let current = old.and_then(|le| le.latest_val().cloned());
                match action.update(key, current.as_deref(), msg.val()) {
                    UpdateResult::Keep => old.cloned(),
                    UpdateResult::Set(v) => Self::apply_insert(old, key.clone(), v, msg.xids()),
                    UpdateResult::Delete => {
                        let del = Message::new(
                            MessageType::DeleteAny,
                            msg.xids().clone(),
                            key.clone(),
                            SlicedCowBytes::default(),
                        )
                        .with_msn(msg.msn());
                        Self::apply_message(key, old, &del, gc, action)
                    }
                }
            }

            MessageType::Optimize | MessageType::OptimizeForUpgrade => {
                Self::apply_optimize(old, gc)
            }
        }
    }

    fn apply_insert(
        old: Option<&LeafEntry>,
        key: CowBytes,
        val: SlicedCowBytes,
        xids: &Xids,
    ) -> Option<LeafEntry> {
        if xids.is_root() {
            // Committed overwrite collapses any history.
            return Some(LeafEntry::Clean { key, val });
        }
        let (key, committed, mut stack) = match old {
            Some(le) => le.clone().into_parts(),
            None => (key, Committed::Tombstone, Vec::new()),
        };
        // The same transaction path overwrites its own provisional op.
        stack.retain(|p| p.xids != *xids);
        stack.push(Provisional {
            xids: xids.clone(),
            op: ProvisionalOp::Insert(val),
        });
        Self::normalize(key, committed, stack)
    }

    fn apply_commit(old: Option<&LeafEntry>, xids: &Xids) -> Option<LeafEntry> {
        let le = old?;
        if !le.has_xids(xids) {
            return Some(le.clone());
        }
        let (key, mut committed, stack) = le.clone().into_parts();
        let mut kept = Vec::with_capacity(stack.len());
        for mut p in stack {
            if !xids.is_prefix_of(&p.xids) {
                kept.push(p);
                continue;
            }
            if xids.depth() > 1 {
                // A nested commit re-homes the op in the parent scope.
                p.xids = {
                    let mut parent = xids.clone();
                    parent.pop();
                    parent
                };
                // Collapse duplicates for the parent path.
                kept.retain(|q: &Provisional| q.xids != p.xids);
                kept.push(p);
            } else {
                committed = match p.op {
                    ProvisionalOp::Insert(v) => Committed::Value(v),
                    ProvisionalOp::Delete => Committed::Tombstone,
                };
            }
        }
        Self::normalize(key, committed, kept)
    }

    fn apply_abort(old: Option<&LeafEntry>, xids: &Xids) -> Option<LeafEntry> {
        let le = old?;
        if !le.has_xids(xids) {
            return Some(le.clone());
        }
        let (key, committed, mut stack) = le.clone().into_parts();
        stack.retain(|p| !xids.is_prefix_of(&p.xids));
        Self::normalize(key, committed, stack)
    }

    fn apply_optimize(old: Option<&LeafEntry>, gc: &GcContext) -> Option<LeafEntry> {
        let le = old?;
        if le.is_clean() {
            return Some(le.clone());
        }
        // Quiescent provisional ops belong to transactions that are no
        // longer live; their outcome is decided, promote them.
        let (key, mut committed, stack) = le.clone().into_parts();
        let mut kept = Vec::with_capacity(stack.len());
        for p in stack {
            if p.xids.outermost() < gc.oldest_live {
                committed = match p.op {
                    ProvisionalOp::Insert(v) => Committed::Value(v),
                    ProvisionalOp::Delete => Committed::Tombstone,
                };
            } else {
                kept.push(p);
            }
        }
        Self::normalize(key, committed, kept)
    }

    pub(crate) fn pack<W: Write>(&self, mut w: W) -> io::Result<()> {
        match self {
            LeafEntry::Clean { key, val } => {
                w.write_u8(LE_CLEAN)?;
                w.write_u32::<LittleEndian>(key.len() as u32)?;
                w.write_all(key)?;
                w.write_u32::<LittleEndian>(val.len() as u32)?;
                w.write_all(val)?;
            }
            LeafEntry::Mvcc {
                key,
                committed,
                stack,
            } => {
                w.write_u8(LE_MVCC)?;
                w.write_u32::<LittleEndian>(key.len() as u32)?;
                w.write_all(key)?;
                match committed {
                    Committed::Tombstone => w.write_u8(0)?,
                    Committed::Value(v) => {
                        w.write_u8(1)?;
                        w.write_u32::<LittleEndian>(v.len() as u32)?;
                        w.write_all(v)?;
                    }
                }
                w.write_u32::<LittleEndian>(stack.len() as u32)?;
                for p in stack {
                    p.xids.pack(&mut w)?;
                    match &p.op {
                        ProvisionalOp::Delete => w.write_u8(0)?,
                        ProvisionalOp::Insert(v) => {
                            w.write_u8(1)?;
                            w.write_u32::<LittleEndian>(v.len() as u32)?;
                            w.write_all(v)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    pub(crate) fn unpack<R: Read>(mut r: R) -> io::Result<Self> {
        let tag = r.read_u8()?;
        let keylen = r.read_u32::<LittleEndian>()? as usize;
        let mut key = vec![0; keylen];
        r.read_exact(&mut key)?;
        let key = CowBytes::from(key);
        match tag {
            LE_CLEAN => {
                let vallen = r.read_u32::<LittleEndian>()? as usize;
                let mut val = vec![0; vallen];
                r.read_exact(&mut val)?;
                Ok(LeafEntry::Clean {
                    key,
                    val: CowBytes::from(val).into(),
                })
            }
            LE_MVCC => {
                let committed = match r.read_u8()? {
                    0 => Committed::Tombstone,
                    1 => {
                        let vallen = r.read_u32::<LittleEndian>()? as usize;
                        let mut val = vec![0; vallen];
                        r.read_exact(&mut val)?;
                        Committed::Value(CowBytes::from(val).into())
                    }
                    _ => {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "bad committed slot tag",
                        ))
                    }
                };
                let n = r.read_u32::<LittleEndian>()? as usize;
                let mut stack = Vec::with_capacity(n);
                for _ in 0..n {
                    let xids = Xids::unpack(&mut r)?;
                    let op = match r.read_u8()? {
                        0 => ProvisionalOp::Delete,
                        1 => {
                            let vallen = r.read_u32::<LittleEndian>()? as usize;
                            let mut val = vec![0; vallen];
                            r.read_exact(&mut val)?;
                            ProvisionalOp::Insert(CowBytes::from(val).into())
                        }
                        _ => {
                            return Err(io::Error::new(
                                io::ErrorKind::InvalidData,
                                "bad provisional op tag",
                            ))
                        }
                    };
                    stack.push(Provisional { xids, op });
                }
                Ok(LeafEntry::Mvcc {
                    key,
                    committed,
                    stack,
                })
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "bad leaf entry tag",
            )),
        }
    }
}

impl Size for LeafEntry {
    fn size(&self) -> usize {
        self.memsize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        message::Msn,
        tree::DefaultUpdateAction,
    };
    use quickcheck::{Arbitrary, Gen};

    fn msg(ty: MessageType, xids: Xids, key: &[u8], val: &[u8]) -> Message {
        Message::new(
            ty,
            xids,
            CowBytes::from(key),
            CowBytes::from(val).into(),
        )
        .with_msn(Msn(1))
    }

    fn apply(old: Option<&LeafEntry>, m: &Message) -> Option<LeafEntry> {
        LeafEntry::apply_message(
            &CowBytes::from(m.key()),
            old,
            m,
            &GcContext::default(),
            &DefaultUpdateAction,
        )
    }

    impl Arbitrary for LeafEntry {
        fn arbitrary(g: &mut Gen) -> Self {
            let key = {
                let mut k = CowBytes::arbitrary(g);
                if k.is_empty() {
                    k = CowBytes::from(&[1][..]);
                }
                k
            };
            if bool::arbitrary(g) {
                LeafEntry::Clean {
                    key,
                    val: CowBytes::arbitrary(g).into(),
                }
            } else {
                let depth = 1 + usize::arbitrary(g) % 3;
                let stack = (0..depth)
                    .map(|i| Provisional {
                        xids: Xids::single(TxnId(i as u64 + 1)),
                        op: if bool::arbitrary(g) {
                            ProvisionalOp::Insert(CowBytes::arbitrary(g).into())
                        } else {
                            ProvisionalOp::Delete
                        },
                    })
                    .collect();
                LeafEntry::Mvcc {
                    key,
                    committed: if bool::arbitrary(g) {
                        Committed::Value(CowBytes::arbitrary(g).into())
                    } else {
                        Committed::Tombstone
                    },
                    stack,
                }
            }
        }
    }

    #[quickcheck_macros::quickcheck]
    fn pack_unpack(le: LeafEntry) {
        let mut buf = Vec::new();
        le.pack(&mut buf).unwrap();
        assert_eq!(buf.len(), le.disksize());
        assert_eq!(LeafEntry::unpack(&buf[..]).unwrap(), le);
    }

    #[test]
    fn committed_insert_collapses_history() {
        let m = msg(MessageType::Insert, Xids::single(TxnId(3)), b"k", b"v1");
        let le = apply(None, &m).unwrap();
        assert!(!le.is_clean());
        let m2 = msg(MessageType::Insert, Xids::root(), b"k", b"v2");
        let le2 = apply(Some(&le), &m2).unwrap();
        assert!(le2.is_clean());
        assert_eq!(&**le2.latest_val().unwrap(), b"v2");
    }

    #[test]
    fn txn_commit_promotes() {
        let xids = Xids::single(TxnId(3));
        let le = apply(None, &msg(MessageType::Insert, xids.clone(), b"k", b"v")).unwrap();
        let le = apply(Some(&le), &msg(MessageType::CommitAny, xids, b"k", b"")).unwrap();
        assert!(le.is_clean());
        assert_eq!(&**le.latest_val().unwrap(), b"v");
    }

    #[test]
    fn txn_abort_restores_committed() {
        let le = apply(None, &msg(MessageType::Insert, Xids::root(), b"k", b"old")).unwrap();
        let xids = Xids::single(TxnId(8));
        let le = apply(Some(&le), &msg(MessageType::DeleteAny, xids.clone(), b"k", b"")).unwrap();
        assert!(le.latest_is_del());
        // Readers whose snapshot excludes transaction 8 keep the old
        // value.
        let outside = ReadContext {
            xids: Xids::root(),
            oldest_live_in_snapshot: TxnId(8),
            snapshot: true,
        };
        assert_eq!(&*le.read_visible(&outside).unwrap(), b"old");
        let le = apply(Some(&le), &msg(MessageType::AbortAny, xids, b"k", b"")).unwrap();
        assert!(le.is_clean());
        assert_eq!(&**le.latest_val().unwrap(), b"old");
    }

    #[test]
    fn committed_delete_of_committed_value_removes() {
        let le = apply(None, &msg(MessageType::Insert, Xids::root(), b"k", b"v")).unwrap();
        assert!(apply(Some(&le), &msg(MessageType::DeleteAny, Xids::root(), b"k", b"")).is_none());
    }

    #[test]
    fn delete_commit_removes_entry() {
        let xids = Xids::single(TxnId(4));
        let le = apply(None, &msg(MessageType::Insert, Xids::root(), b"k", b"v")).unwrap();
        let le = apply(Some(&le), &msg(MessageType::DeleteAny, xids.clone(), b"k", b"")).unwrap();
        assert!(apply(Some(&le), &msg(MessageType::CommitAny, xids, b"k", b"")).is_none());
    }

    #[test]
    fn insert_no_overwrite_preserves_live_value() {
        let le = apply(None, &msg(MessageType::Insert, Xids::root(), b"k", b"v")).unwrap();
        let le2 = apply(
            Some(&le),
            &msg(MessageType::InsertNoOverwrite, Xids::root(), b"k", b"w"),
        )
        .unwrap();
        assert_eq!(le, le2);
    }

    #[test]
    fn nested_commit_rehomes_to_parent() {
        let outer = Xids::single(TxnId(5));
        let inner = Xids::child(&outer, TxnId(6));
        let le = apply(None, &msg(MessageType::Insert, inner.clone(), b"k", b"v")).unwrap();
        let le = apply(Some(&le), &msg(MessageType::CommitAny, inner, b"k", b"")).unwrap();
        // Still provisional, now under the parent.
        assert!(!le.is_clean());
        assert!(le.has_xids(&outer));
        let le = apply(Some(&le), &msg(MessageType::CommitAny, outer, b"k", b"")).unwrap();
        assert!(le.is_clean());
    }

    #[test]
    fn snapshot_does_not_see_uncommitted() {
        let le = apply(None, &msg(MessageType::Insert, Xids::single(TxnId(9)), b"k", b"v")).unwrap();
        let ctx = ReadContext {
            xids: Xids::root(),
            oldest_live_in_snapshot: TxnId(9),
            snapshot: true,
        };
        assert!(le.read_visible(&ctx).is_none());
        // The writer itself does see it.
        let own = ReadContext {
            xids: Xids::single(TxnId(9)),
            oldest_live_in_snapshot: TxnId(9),
            snapshot: true,
        };
        assert_eq!(&*le.read_visible(&own).unwrap(), b"v");
    }

    #[test]
    fn optimize_promotes_quiescent_stack() {
        let xids = Xids::single(TxnId(2));
        let le = apply(None, &msg(MessageType::Insert, xids, b"k", b"v")).unwrap();
        let gc = GcContext {
            oldest_live: TxnId(100),
        };
        let le = LeafEntry::apply_message(
            le.key(),
            Some(&le),
            &Message::new(
                MessageType::Optimize,
                Xids::root(),
                CowBytes::new(),
                SlicedCowBytes::default(),
            )
            .with_msn(Msn(2)),
            &gc,
            &DefaultUpdateAction,
        )
        .unwrap();
        assert!(le.is_clean());
    }
}
