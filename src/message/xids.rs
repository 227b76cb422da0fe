//! Transaction-id stacks.

use super::TxnId;
use crate::size::Size;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

/// Maximum nesting depth of transactions.
pub const MAX_NESTED_TXNS: usize = 250;

/// A stack of transaction ids from the root transaction down to the
/// innermost nested child.
///
/// The stack is a value: it is freely duplicated and carried on every
/// message. An empty stack denotes the synthetic root (committed) scope.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Xids {
    stack: Vec<TxnId>,
}

impl Xids {
    /// The empty stack: no live transaction, values are committed.
    pub fn root() -> Self {
        Xids::default()
    }

    /// Returns `stack` extended by the nested child `txnid`.
    pub fn child(stack: &Xids, txnid: TxnId) -> Self {
        debug_assert!(txnid != TxnId::NONE);
        debug_assert!(stack.depth() < MAX_NESTED_TXNS);
        let mut v = Vec::with_capacity(stack.stack.len() + 1);
        v.extend_from_slice(&stack.stack);
        v.push(txnid);
        Xids { stack: v }
    }

    /// Convenience constructor for a depth-one stack.
    pub fn single(txnid: TxnId) -> Self {
        Xids::child(&Xids::root(), txnid)
    }

    /// The innermost transaction, [TxnId::NONE] for the root stack.
    pub fn innermost(&self) -> TxnId {
        self.stack.last().copied().unwrap_or(TxnId::NONE)
    }

    /// The outermost transaction, [TxnId::NONE] for the root stack.
    pub fn outermost(&self) -> TxnId {
        self.stack.first().copied().unwrap_or(TxnId::NONE)
    }

    /// Number of stacked transactions.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Whether this is the root (committed) stack.
    pub fn is_root(&self) -> bool {
        self.stack.is_empty()
    }

    /// Iterates ids from root to innermost.
    pub fn iter(&self) -> impl Iterator<Item = TxnId> + '_ {
        self.stack.iter().copied()
    }

    /// Whether `txnid` appears anywhere in the stack.
    pub fn contains(&self, txnid: TxnId) -> bool {
        self.stack.contains(&txnid)
    }

    /// Whether `self` is a prefix of `other`. Every stack is a prefix of
    /// itself; the root stack is a prefix of every stack.
    pub fn is_prefix_of(&self, other: &Xids) -> bool {
        other.stack.len() >= self.stack.len() && other.stack[..self.stack.len()] == self.stack[..]
    }

    /// Drops the innermost id, returning it. No-op on the root stack.
    pub fn pop(&mut self) -> Option<TxnId> {
        self.stack.pop()
    }

    /// Serialized length in bytes.
    pub fn serialize_size(&self) -> usize {
        1 + 8 * self.stack.len()
    }

    pub(crate) fn pack<W: Write>(&self, mut w: W) -> io::Result<()> {
        w.write_u8(self.stack.len() as u8)?;
        for id in &self.stack {
            w.write_u64::<LittleEndian>(id.0)?;
        }
        Ok(())
    }

    pub(crate) fn unpack<R: Read>(mut r: R) -> io::Result<Self> {
        let depth = r.read_u8()? as usize;
        let mut stack = Vec::with_capacity(depth);
        for _ in 0..depth {
            let id = TxnId(r.read_u64::<LittleEndian>()?);
            if id == TxnId::NONE {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "reserved txnid in xids stack",
                ));
            }
            stack.push(id);
        }
        Ok(Xids { stack })
    }
}

impl Size for Xids {
    fn size(&self) -> usize {
        self.serialize_size()
    }
}
