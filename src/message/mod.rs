//! The message model.
//!
//! Every write enters the tree as a [Message]: a value object stamped
//! with a monotonic [Msn] at root ingress and carried downwards through
//! per-child FIFOs until it reaches a leaf.

use crate::{
    cow_bytes::{CowBytes, SlicedCowBytes},
    size::Size,
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

mod xids;
pub use xids::Xids;

/// A 64-bit transaction id. [TxnId::NONE] is reserved.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct TxnId(pub u64);

impl TxnId {
    /// The reserved "no transaction" id.
    pub const NONE: TxnId = TxnId(0);
}

/// Message sequence number: a dictionary-wide monotone stamp assigned
/// exactly once at root ingress. Defines the total order of writes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct Msn(pub u64);

impl Msn {
    /// Smaller than every assigned MSN; the initial watermark of a
    /// freshly created node.
    pub const MIN: Msn = Msn(0);

    /// The next stamp after `self`.
    pub fn next(self) -> Msn {
        Msn(self.0 + 1)
    }
}

/// The kind of a [Message].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum MessageType {
    None = 0,
    Insert = 1,
    InsertNoOverwrite = 2,
    DeleteAny = 3,
    AbortAny = 4,
    CommitAny = 5,
    Update = 6,
    UpdateBroadcastAll = 7,
    CommitBroadcastAll = 8,
    CommitBroadcastTxn = 9,
    AbortBroadcastTxn = 10,
    Optimize = 11,
    OptimizeForUpgrade = 12,
}

impl MessageType {
    /// Broadcast messages carry no key and are delivered to every child,
    /// duplicated on descent.
    pub fn is_broadcast(&self) -> bool {
        matches!(
            self,
            MessageType::UpdateBroadcastAll
                | MessageType::CommitBroadcastAll
                | MessageType::CommitBroadcastTxn
                | MessageType::AbortBroadcastTxn
                | MessageType::Optimize
                | MessageType::OptimizeForUpgrade
        )
    }

    /// Whether the message routes to a single child by key.
    pub fn is_targeted(&self) -> bool {
        !self.is_broadcast() && *self != MessageType::None
    }

    fn from_u8(x: u8) -> io::Result<Self> {
        Ok(match x {
            0 => MessageType::None,
            1 => MessageType::Insert,
            2 => MessageType::InsertNoOverwrite,
            3 => MessageType::DeleteAny,
            4 => MessageType::AbortAny,
            5 => MessageType::CommitAny,
            6 => MessageType::Update,
            7 => MessageType::UpdateBroadcastAll,
            8 => MessageType::CommitBroadcastAll,
            9 => MessageType::CommitBroadcastTxn,
            10 => MessageType::AbortBroadcastTxn,
            11 => MessageType::Optimize,
            12 => MessageType::OptimizeForUpgrade,
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "unknown message type",
                ))
            }
        })
    }
}

/// A buffered write. Messages are value objects; the MSN is assigned at
/// root ingress and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    ty: MessageType,
    msn: Msn,
    xids: Xids,
    key: CowBytes,
    val: SlicedCowBytes,
}

impl Message {
    /// A new, unstamped message. The key must be empty exactly for
    /// broadcast kinds.
    pub fn new(ty: MessageType, xids: Xids, key: CowBytes, val: SlicedCowBytes) -> Self {
        debug_assert!(ty.is_broadcast() == key.is_empty() || ty == MessageType::None);
        Message {
            ty,
            msn: Msn::MIN,
            xids,
            key,
            val,
        }
    }

    pub fn ty(&self) -> MessageType {
        self.ty
    }

    pub fn msn(&self) -> Msn {
        self.msn
    }

    pub fn xids(&self) -> &Xids {
        &self.xids
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn val(&self) -> &SlicedCowBytes {
        &self.val
    }

    pub fn is_broadcast(&self) -> bool {
        self.ty.is_broadcast()
    }

    /// Stamps the MSN. Called exactly once, at root ingress.
    pub(crate) fn stamp(&mut self, msn: Msn) {
        debug_assert_eq!(self.msn, Msn::MIN);
        self.msn = msn;
    }

    /// Re-creates the message with an explicit MSN, for FIFO unpacking.
    pub(crate) fn with_msn(mut self, msn: Msn) -> Self {
        self.msn = msn;
        self
    }

    /// Serialized length in bytes of `(type, msn, xids, keylen, key,
    /// vallen, val)`.
    pub fn serialize_size(&self) -> usize {
        1 + 8 + self.xids.serialize_size() + 4 + self.key.len() + 4 + self.val.len()
    }

    pub(crate) fn pack<W: Write>(&self, mut w: W) -> io::Result<()> {
        w.write_u8(self.ty as u8)?;
        w.write_u64::<LittleEndian>(self.msn.0)?;
        self.xids.pack(&mut w)?;
        w.write_u32::<LittleEndian>(self.key.len() as u32)?;
        w.write_all(&self.key)?;
        w.write_u32::<LittleEndian>(self.val.len() as u32)?;
        w.write_all(&self.val)?;
        Ok(())
    }

    pub(crate) fn unpack<R: Read>(mut r: R) -> io::Result<Self> {
        let ty = MessageType::from_u8(r.read_u8()?)?;
        let msn = Msn(r.read_u64::<LittleEndian>()?);
        let xids = Xids::unpack(&mut r)?;
        let keylen = r.read_u32::<LittleEndian>()? as usize;
        let mut key = vec![0; keylen];
        r.read_exact(&mut key)?;
        let vallen = r.read_u32::<LittleEndian>()? as usize;
        let mut val = vec![0; vallen];
        r.read_exact(&mut val)?;
        Ok(Message {
            ty,
            msn,
            xids,
            key: CowBytes::from(key),
            val: CowBytes::from(val).into(),
        })
    }
}

impl Size for Message {
    fn size(&self) -> usize {
        self.serialize_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::{Arbitrary, Gen};

    impl Arbitrary for MessageType {
        fn arbitrary(g: &mut Gen) -> Self {
            *g.choose(&[
                MessageType::Insert,
                MessageType::InsertNoOverwrite,
                MessageType::DeleteAny,
                MessageType::AbortAny,
                MessageType::CommitAny,
                MessageType::Update,
            ])
            .unwrap()
        }
    }

    impl Arbitrary for Message {
        fn arbitrary(g: &mut Gen) -> Self {
            let ty = MessageType::arbitrary(g);
            let mut key = CowBytes::arbitrary(g);
            if key.is_empty() {
                key = CowBytes::from(&[0][..]);
            }
            let mut msg = Message::new(ty, Xids::arbitrary(g), key, CowBytes::arbitrary(g).into());
            msg.stamp(Msn(u64::arbitrary(g).max(1)));
            msg
        }
    }

    #[quickcheck_macros::quickcheck]
    fn pack_unpack(msg: Message) {
        let mut buf = Vec::new();
        msg.pack(&mut buf).unwrap();
        assert_eq!(buf.len(), msg.serialize_size());
        assert_eq!(Message::unpack(&buf[..]).unwrap(), msg);
    }

    #[test]
    fn broadcast_classification() {
        assert!(MessageType::CommitBroadcastTxn.is_broadcast());
        assert!(MessageType::Optimize.is_broadcast());
        assert!(!MessageType::Insert.is_broadcast());
        assert!(!MessageType::None.is_targeted());
    }
}
