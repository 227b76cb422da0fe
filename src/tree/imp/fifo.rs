//! Per-child message queues of nonleaf nodes.

use crate::{message::Message, size::Size};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::{
    collections::VecDeque,
    io::{self, Read, Write},
};

/// An in-order queue of messages buffered for one child.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MsgFifo {
    queue: VecDeque<Message>,
    n_bytes: usize,
}

impl MsgFifo {
    pub fn new() -> Self {
        MsgFifo::default()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Buffered payload bytes; the flush heuristic picks the child with
    /// the largest value.
    pub fn n_bytes(&self) -> usize {
        self.n_bytes
    }

    pub fn enqueue(&mut self, msg: Message) {
        self.n_bytes += msg.serialize_size();
        self.queue.push_back(msg);
    }

    /// Removes every message, preserving insertion order.
    pub fn drain(&mut self) -> impl Iterator<Item = Message> + '_ {
        self.n_bytes = 0;
        self.queue.drain(..)
    }

    /// Iterates messages in insertion order without consuming them.
    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.queue.iter()
    }

    /// Serialized length.
    pub fn disksize(&self) -> usize {
        4 + self.queue.iter().map(|m| m.serialize_size()).sum::<usize>()
    }

    pub(crate) fn pack<W: Write>(&self, mut w: W) -> io::Result<()> {
        w.write_u32::<LittleEndian>(self.queue.len() as u32)?;
        for msg in &self.queue {
            msg.pack(&mut w)?;
        }
        Ok(())
    }

    pub(crate) fn unpack<R: Read>(mut r: R) -> io::Result<Self> {
        let n = r.read_u32::<LittleEndian>()? as usize;
        let mut fifo = MsgFifo::new();
        for _ in 0..n {
            fifo.enqueue(Message::unpack(&mut r)?);
        }
        Ok(fifo)
    }
}

impl Size for MsgFifo {
    fn size(&self) -> usize {
        24 + self.n_bytes
    }
}
