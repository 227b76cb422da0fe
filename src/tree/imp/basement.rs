//! Basement nodes: the ordered entry containers inside a leaf partition.

use super::leaf_entry::{GcContext, LeafEntry};
use crate::{
    cow_bytes::CowBytes,
    message::{Message, Msn},
    tree::UpdateAction,
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

/// Scan direction for [Basement::find].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

/// A leaf partition: an ordered array of [LeafEntry]s.
///
/// The array tolerates cursors surviving across mutations because
/// cursors re-validate against the tree-wide root-put counter before
/// trusting a remembered index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Basement {
    entries: Vec<LeafEntry>,
    n_bytes: usize,
    /// Consecutive inserts that landed near the right edge. A warm
    /// counter switches the probe to check the last entry first.
    seqinsert: u32,
    /// Whether pending ancestor messages have been replayed into this
    /// in-memory copy.
    soft_copy_is_up_to_date: bool,
    /// Newest message this partition has absorbed in memory.
    max_msn_applied: Msn,
}

impl Default for Basement {
    fn default() -> Self {
        Basement::new()
    }
}

impl Basement {
    pub fn new() -> Self {
        Basement {
            entries: Vec::new(),
            n_bytes: 0,
            seqinsert: 0,
            soft_copy_is_up_to_date: false,
            max_msn_applied: Msn::MIN,
        }
    }

    pub(crate) fn from_entries(entries: Vec<LeafEntry>, max_msn_applied: Msn) -> Self {
        debug_assert!(entries.windows(2).all(|w| w[0].key() < w[1].key()));
        let n_bytes = entries.iter().map(|e| e.memsize()).sum();
        Basement {
            entries,
            n_bytes,
            seqinsert: 0,
            soft_copy_is_up_to_date: false,
            max_msn_applied,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn n_bytes(&self) -> usize {
        self.n_bytes
    }

    pub fn max_msn_applied(&self) -> Msn {
        self.max_msn_applied
    }

    pub fn is_up_to_date(&self) -> bool {
        self.soft_copy_is_up_to_date
    }

    pub(crate) fn mark_up_to_date(&mut self) {
        self.soft_copy_is_up_to_date = true;
    }

    pub fn fetch(&self, i: usize) -> Option<&LeafEntry> {
        self.entries.get(i)
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &LeafEntry> {
        self.entries.iter()
    }

    pub fn first_key(&self) -> Option<&CowBytes> {
        self.entries.first().map(|e| e.key())
    }

    pub fn last_key(&self) -> Option<&CowBytes> {
        self.entries.last().map(|e| e.key())
    }

    /// Exact search: `Ok(index)` on a hit, `Err(insertion_point)` on a
    /// miss.
    pub fn find_zero(&self, key: &[u8]) -> Result<usize, usize> {
        self.entries.binary_search_by(|e| (**e.key()).cmp(key))
    }

    /// Heaviside search: the first entry at-or-after `key` going
    /// forward, the last entry at-or-before `key` going backward.
    /// `inclusive` controls whether an exact hit qualifies.
    pub fn find(&self, key: &[u8], dir: Direction, inclusive: bool) -> Option<usize> {
        match (self.find_zero(key), dir) {
            (Ok(i), Direction::Forward) if inclusive => Some(i),
            (Ok(i), Direction::Forward) => self.entries.get(i + 1).map(|_| i + 1),
            (Err(i), Direction::Forward) => self.entries.get(i).map(|_| i),
            (Ok(i), Direction::Backward) if inclusive => Some(i),
            (Ok(i), Direction::Backward) | (Err(i), Direction::Backward) => i.checked_sub(1),
        }
    }

    pub fn insert_at(&mut self, i: usize, le: LeafEntry) {
        self.n_bytes += le.memsize();
        self.entries.insert(i, le);
    }

    pub fn set_at(&mut self, i: usize, le: LeafEntry) {
        self.n_bytes += le.memsize();
        self.n_bytes -= self.entries[i].memsize();
        self.entries[i] = le;
    }

    pub fn delete_at(&mut self, i: usize) -> LeafEntry {
        let le = self.entries.remove(i);
        self.n_bytes -= le.memsize();
        le
    }

    /// How close to the right edge an insert must land to count as
    /// sequential.
    fn seq_window(&self) -> usize {
        (self.entries.len() / 16).clamp(1, 32)
    }

    /// Locates the slot for `key`, probing the right edge first while
    /// the sequential-insert hint is warm.
    fn find_slot(&mut self, key: &[u8]) -> Result<usize, usize> {
        if self.seqinsert > 0 {
            if let Some(last) = self.entries.last() {
                match (**last.key()).cmp(key) {
                    std::cmp::Ordering::Less => return Err(self.entries.len()),
                    std::cmp::Ordering::Equal => return Ok(self.entries.len() - 1),
                    std::cmp::Ordering::Greater => {}
                }
            }
        }
        self.find_zero(key)
    }

    fn note_insert_position(&mut self, i: usize) {
        if self.entries.len() - i <= self.seq_window() {
            self.seqinsert = self.seqinsert.saturating_add(1);
        } else {
            self.seqinsert = 0;
        }
    }

    /// Whether recent inserts trend towards the right edge. A warm hint
    /// vetoes leaf fusion.
    pub fn seqinsert_hot(&self) -> bool {
        self.seqinsert >= 2
    }

    /// Applies one message to this partition, returning the memory size
    /// delta. Messages at or below the absorbed watermark are dropped,
    /// which makes replay idempotent.
    pub fn apply_message<M: UpdateAction>(
        &mut self,
        msg: &Message,
        gc: &GcContext,
        action: &M,
    ) -> isize {
        if msg.msn() <= self.max_msn_applied {
            return 0;
        }
        self.max_msn_applied = msg.msn();
        if msg.is_broadcast() {
            self.apply_broadcast(msg, gc, action)
        } else {
            self.apply_targeted(msg, gc, action)
        }
    }

    fn apply_targeted<M: UpdateAction>(
        &mut self,
        msg: &Message,
        gc: &GcContext,
        action: &M,
    ) -> isize {
        let before = self.n_bytes as isize;
        let key = CowBytes::from(msg.key());
        match self.find_slot(msg.key()) {
            Ok(i) => {
                let new = LeafEntry::apply_message(&key, Some(&self.entries[i]), msg, gc, action);
                match new {
                    Some(le) => self.set_at(i, le),
                    None => {
                        self.delete_at(i);
                    }
                }
            }
            Err(i) => {
                if let Some(le) = LeafEntry::apply_message(&key, None, msg, gc, action) {
                    self.insert_at(i, le);
                    self.note_insert_position(i);
                }
            }
        }
        self.n_bytes as isize - before
    }

    fn apply_broadcast<M: UpdateAction>(
        &mut self,
        msg: &Message,
        gc: &GcContext,
        action: &M,
    ) -> isize {
        let before = self.n_bytes as isize;
        let old = std::mem::take(&mut self.entries);
        self.entries = old
            .into_iter()
            .filter_map(|le| {
                let key = le.key().clone();
                LeafEntry::apply_message(&key, Some(&le), msg, gc, action)
            })
            .collect();
        self.n_bytes = self.entries.iter().map(|e| e.memsize()).sum();
        self.n_bytes as isize - before
    }

    pub(crate) fn into_entries(self) -> Vec<LeafEntry> {
        self.entries
    }

    /// Splits off the entries from `at` onward into a new basement.
    pub(crate) fn split_off(&mut self, at: usize) -> Basement {
        let right = self.entries.split_off(at);
        let moved: usize = right.iter().map(|e| e.memsize()).sum();
        self.n_bytes -= moved;
        self.seqinsert = 0;
        let mut bn = Basement::from_entries(right, self.max_msn_applied);
        bn.soft_copy_is_up_to_date = self.soft_copy_is_up_to_date;
        bn
    }

    /// Appends all entries of `right`, which must sort strictly after
    /// our last key.
    pub(crate) fn append(&mut self, mut right: Basement) {
        debug_assert!(match (self.last_key(), right.first_key()) {
            (Some(l), Some(r)) => l < r,
            _ => true,
        });
        self.n_bytes += right.n_bytes;
        self.entries.append(&mut right.entries);
        self.max_msn_applied = self.max_msn_applied.max(right.max_msn_applied);
        self.soft_copy_is_up_to_date &= right.soft_copy_is_up_to_date;
    }

    /// Serialized length.
    pub fn disksize(&self) -> usize {
        4 + 8 + self.entries.iter().map(|e| e.disksize()).sum::<usize>()
    }

    pub(crate) fn pack<W: Write>(&self, mut w: W) -> io::Result<()> {
        w.write_u32::<LittleEndian>(self.entries.len() as u32)?;
        w.write_u64::<LittleEndian>(self.max_msn_applied.0)?;
        for le in &self.entries {
            le.pack(&mut w)?;
        }
        Ok(())
    }

    pub(crate) fn unpack<R: Read>(mut r: R) -> io::Result<Self> {
        let n = r.read_u32::<LittleEndian>()? as usize;
        let max_msn = Msn(r.read_u64::<LittleEndian>()?);
        let mut entries = Vec::with_capacity(n);
        for _ in 0..n {
            entries.push(LeafEntry::unpack(&mut r)?);
        }
        Ok(Basement::from_entries(entries, max_msn))
    }
}
