//! Search descent and range cursors.

use super::{
    ancestors::Ancestors,
    basement::Direction,
    leaf_entry::ReadContext,
    node::{FetchHint, Partition},
    NodePin, Tree,
};
use crate::{
    block::Blocknum,
    cache::{PinFlavor, PinOutcome},
    cow_bytes::{CowBytes, SlicedCowBytes},
    error::{Error, Result},
    tree::UpdateAction,
};

/// Return codes of cursor positioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorOutcome {
    /// Positioned on an entry.
    Found,
    /// The scan ran off its end.
    NotFound,
    /// A caller-supplied bound cut the answer.
    Rejected,
}

/// One step of a descent.
enum Step {
    Found(CowBytes, SlicedCowBytes, Blocknum),
    NotFound,
    Retry,
}

/// Search state surviving try-again retries. The pivot bound only ever
/// grows towards the scan direction, which guarantees forward progress.
struct SearchState {
    pivot_bound: Option<CowBytes>,
    retry: Option<(Blocknum, FetchHint)>,
}

#[derive(Clone)]
struct Pos {
    key: CowBytes,
    val: SlicedCowBytes,
    leaf: Blocknum,
}

/// A range cursor with a fixed MVCC context.
pub struct Cursor<'t, M: UpdateAction> {
    tree: &'t Tree<M>,
    ctx: ReadContext,
    at: Option<Pos>,
    /// Root-put counter at the time of positioning; a later write
    /// invalidates the positional shortcut.
    counter: u64,
}

impl<M: UpdateAction> Tree<M> {
    /// A cursor observing everything committed.
    pub fn cursor(&self) -> Cursor<'_, M> {
        Cursor {
            tree: self,
            ctx: ReadContext::latest(),
            at: None,
            counter: 0,
        }
    }

    /// A cursor under an explicit MVCC context. Snapshot readers refuse
    /// dictionaries created after their snapshot.
    pub fn cursor_with(&self, ctx: ReadContext) -> Result<Cursor<'_, M>> {
        self.check_created_before(&ctx)?;
        Ok(Cursor {
            tree: self,
            ctx,
            at: None,
            counter: 0,
        })
    }

    fn check_created_before(&self, ctx: &ReadContext) -> Result<()> {
        let created = self.inner.header.read().created_txn;
        if ctx.snapshot && created != crate::message::TxnId::NONE
            && created >= ctx.oldest_live_in_snapshot
            && !ctx.xids.contains(created)
        {
            return Err(Error::DictionaryTooNewForSnapshot);
        }
        Ok(())
    }

    /// Full bounded search from the root. `bound` is `(key, inclusive)`
    /// along `dir`; `None` scans from the edge.
    fn seek(
        &self,
        dir: Direction,
        bound: Option<(&[u8], bool)>,
        ctx: &ReadContext,
    ) -> Result<Option<Pos>> {
        self.inner.header.read().panicked()?;
        let root_hint = match (bound, dir) {
            (Some((k, _)), _) => FetchHint::Subset(vec![CowBytes::from(k)]),
            (None, Direction::Forward) => FetchHint::Min,
            (None, Direction::Backward) => FetchHint::Max,
        };
        let mut state = SearchState {
            pivot_bound: None,
            retry: None,
        };
        let found = loop {
            let root = self.pin_root(&root_hint)?;
            match self.search_node(root, dir, bound, ctx, None, &mut state)? {
                Step::Found(key, val, leaf) => break Some(Pos { key, val, leaf }),
                Step::NotFound => break None,
                Step::Retry => {
                    if let Some((bn, hint)) = state.retry.take() {
                        self.inner.pager.prefetch(bn, &hint)?;
                    }
                }
            }
        };
        self.inner.pager.evict()?;
        Ok(found)
    }

    fn search_node(
        &self,
        mut node: NodePin<'_>,
        dir: Direction,
        bound: Option<(&[u8], bool)>,
        ctx: &ReadContext,
        chain: Option<&Ancestors<'_>>,
        state: &mut SearchState,
    ) -> Result<Step> {
        if node.is_leaf() {
            return self.search_leaf(&mut node, dir, bound, ctx, chain, state);
        }
        let n = node.n_children();
        let start = match bound {
            Some((k, _)) => node.which_child(k),
            None => match dir {
                Direction::Forward => 0,
                Direction::Backward => n - 1,
            },
        };
        let candidates: Vec<usize> = match dir {
            Direction::Forward => (start..n).collect(),
            Direction::Backward => (0..=start).rev().collect(),
        };
        for c in candidates {
            // Children wholly on the already-searched side of the pivot
            // bound were covered by an earlier descent.
            if let Some(pb) = &state.pivot_bound {
                let searched = match dir {
                    Direction::Forward => {
                        node.pivots().get(c).map_or(false, |up| up <= pb)
                    }
                    Direction::Backward => c
                        .checked_sub(1)
                        .and_then(|i| node.pivots().get(i))
                        .map_or(false, |lo| lo >= pb),
                };
                if searched {
                    continue;
                }
            }
            // The descent reads this child's FIFO for the ancestor
            // replay; make sure it is resident before committing to the
            // branch.
            match node.partition_state(c) {
                Partition::Avail(_) => {}
                Partition::Compressed(_) => {
                    node.materialize(c, &self.inner.config.compression)?;
                    node.touch(c);
                }
                Partition::OnDisk | Partition::Invalid => {
                    state.retry = Some((node.blocknum(), FetchHint::All));
                    return Ok(Step::Retry);
                }
            }
            let hint = match bound {
                Some((k, _)) if c == start => FetchHint::Subset(vec![CowBytes::from(k)]),
                _ => match dir {
                    Direction::Forward => FetchHint::Min,
                    Direction::Backward => FetchHint::Max,
                },
            };
            let child_bn = node.child_blocknum(c);
            let child = match self
                .inner
                .pager
                .pin(child_bn, &hint, PinFlavor::NonBlocking)?
            {
                PinOutcome::Pinned(guard) => guard,
                PinOutcome::NeedRetry => {
                    state.retry = Some((child_bn, hint));
                    return Ok(Step::Retry);
                }
            };
            let frame = Ancestors {
                node: &node,
                childnum: c,
                next: chain,
            };
            match self.search_node(child, dir, bound, ctx, Some(&frame), state)? {
                Step::Found(k, v, leaf) => return Ok(Step::Found(k, v, leaf)),
                Step::Retry => return Ok(Step::Retry),
                Step::NotFound => {
                    // This child is exhausted; remember how far we got
                    // so a retry does not re-search it.
                    let covered = match dir {
                        Direction::Forward => node.pivots().get(c).cloned(),
                        Direction::Backward => {
                            c.checked_sub(1).and_then(|i| node.pivots().get(i).cloned())
                        }
                    };
                    if let Some(p) = covered {
                        state.pivot_bound = Some(p);
                    }
                }
            }
        }
        Ok(Step::NotFound)
    }

    fn search_leaf(
        &self,
        node: &mut NodePin<'_>,
        dir: Direction,
        bound: Option<(&[u8], bool)>,
        ctx: &ReadContext,
        chain: Option<&Ancestors<'_>>,
        state: &mut SearchState,
    ) -> Result<Step> {
        let n = node.n_children();
        let start = match bound {
            Some((k, _)) => node.which_child(k),
            None => match dir {
                Direction::Forward => 0,
                Direction::Backward => n - 1,
            },
        };
        let basements: Vec<usize> = match dir {
            Direction::Forward => (start..n).collect(),
            Direction::Backward => (0..=start).rev().collect(),
        };
        for b in basements {
            match node.partition_state(b) {
                Partition::Avail(_) | Partition::Compressed(_) => {
                    node.materialize(b, &self.inner.config.compression)?;
                    node.touch(b);
                }
                Partition::OnDisk | Partition::Invalid => {
                    // Faulting this partition in is real I/O; unwind.
                    state.retry = Some((node.blocknum(), FetchHint::All));
                    return Ok(Step::Retry);
                }
            }
            super::ancestors::apply_ancestor_messages(
                node,
                b,
                chain,
                &self.inner.env.gc(),
                &self.inner.action,
            );
            let basement = node.basement(b).expect("basement was materialized");
            if basement.is_empty() {
                continue;
            }
            let first = if b == start {
                match bound {
                    Some((k, inclusive)) => basement.find(k, dir, inclusive),
                    None => match dir {
                        Direction::Forward => Some(0),
                        Direction::Backward => Some(basement.len() - 1),
                    },
                }
            } else {
                match dir {
                    Direction::Forward => Some(0),
                    Direction::Backward => Some(basement.len() - 1),
                }
            };
            let mut idx = match first {
                Some(i) => i,
                None => continue,
            };
            // Skip entries this reader cannot see, e.g. provisional
            // deletes, continuing in the scan direction.
            loop {
                let le = basement.fetch(idx).expect("index stays in bounds");
                if let Some(val) = le.read_visible(ctx) {
                    return Ok(Step::Found(le.key().clone(), val, node.blocknum()));
                }
                match dir {
                    Direction::Forward => {
                        idx += 1;
                        if idx == basement.len() {
                            break;
                        }
                    }
                    Direction::Backward => match idx.checked_sub(1) {
                        Some(i) => idx = i,
                        None => break,
                    },
                }
            }
        }
        Ok(Step::NotFound)
    }
}

impl<'t, M: UpdateAction> Cursor<'t, M> {
    fn position(&mut self, pos: Pos) -> Option<(CowBytes, SlicedCowBytes)> {
        self.counter = self.tree.env().root_put_counter();
        let out = (pos.key.clone(), pos.val.clone());
        self.at = Some(pos);
        Some(out)
    }

    fn take_seek(
        &mut self,
        dir: Direction,
        bound: Option<(&[u8], bool)>,
    ) -> Result<Option<(CowBytes, SlicedCowBytes)>> {
        match self.tree.seek(dir, bound, &self.ctx)? {
            Some(pos) => Ok(self.position(pos)),
            None => {
                self.at = None;
                Ok(None)
            }
        }
    }

    /// Positions on the smallest entry.
    pub fn first(&mut self) -> Result<Option<(CowBytes, SlicedCowBytes)>> {
        self.take_seek(Direction::Forward, None)
    }

    /// Positions on the largest entry.
    pub fn last(&mut self) -> Result<Option<(CowBytes, SlicedCowBytes)>> {
        self.take_seek(Direction::Backward, None)
    }

    /// Positions on `key` exactly.
    pub fn set(&mut self, key: &[u8]) -> Result<Option<(CowBytes, SlicedCowBytes)>> {
        match self.tree.seek(Direction::Forward, Some((key, true)), &self.ctx)? {
            Some(pos) if &*pos.key == key => Ok(self.position(pos)),
            _ => {
                self.at = None;
                Ok(None)
            }
        }
    }

    /// Positions on the smallest entry at or after `key`.
    pub fn set_range(&mut self, key: &[u8]) -> Result<Option<(CowBytes, SlicedCowBytes)>> {
        self.take_seek(Direction::Forward, Some((key, true)))
    }

    /// Positions on the largest entry at or before `key`.
    pub fn set_range_reverse(&mut self, key: &[u8]) -> Result<Option<(CowBytes, SlicedCowBytes)>> {
        self.take_seek(Direction::Backward, Some((key, true)))
    }

    /// Like [Cursor::set_range], with a caller bound: a hit the
    /// predicate refuses reports [CursorOutcome::Rejected] and leaves
    /// the cursor unpositioned.
    pub fn set_range_with<F>(&mut self, key: &[u8], mut pred: F) -> Result<CursorOutcome>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        match self.tree.seek(Direction::Forward, Some((key, true)), &self.ctx)? {
            None => {
                self.at = None;
                Ok(CursorOutcome::NotFound)
            }
            Some(pos) => {
                if pred(&pos.key, &pos.val) {
                    self.position(pos);
                    Ok(CursorOutcome::Found)
                } else {
                    self.at = None;
                    Ok(CursorOutcome::Rejected)
                }
            }
        }
    }

    /// Advances to the next entry.
    pub fn next(&mut self) -> Result<Option<(CowBytes, SlicedCowBytes)>> {
        self.advance(Direction::Forward)
    }

    /// Steps back to the previous entry.
    pub fn prev(&mut self) -> Result<Option<(CowBytes, SlicedCowBytes)>> {
        self.advance(Direction::Backward)
    }

    fn advance(&mut self, dir: Direction) -> Result<Option<(CowBytes, SlicedCowBytes)>> {
        let key = match &self.at {
            Some(pos) => pos.key.clone(),
            None => {
                return match dir {
                    Direction::Forward => self.first(),
                    Direction::Backward => self.last(),
                }
            }
        };
        if let Some(found) = self.shortcut(dir) {
            return Ok(match found {
                Some(pos) => self.position(pos),
                None => {
                    self.at = None;
                    None
                }
            });
        }
        self.take_seek(dir, Some((&key, false)))
    }

    /// Fast next/prev inside the remembered basement, valid only while
    /// no root ingress has happened since positioning. `None` means the
    /// cursor must redescend.
    fn shortcut(&mut self, dir: Direction) -> Option<Option<Pos>> {
        let pos = self.at.as_ref()?;
        if self.counter != self.tree.env().root_put_counter() {
            return None;
        }
        let pager = &self.tree.inner.pager;
        if !pager.contains(pos.leaf) {
            return None;
        }
        let leaf = match pager
            .pin(pos.leaf, &FetchHint::None, PinFlavor::NonBlocking)
            .ok()?
        {
            PinOutcome::Pinned(guard) => guard,
            PinOutcome::NeedRetry => return None,
        };
        if !leaf.is_leaf() {
            return None;
        }
        let b = leaf.which_child(&pos.key);
        let basement = leaf.basement(b)?;
        if !basement.is_up_to_date() {
            return None;
        }
        let mut idx = basement.find_zero(&pos.key).ok()?;
        loop {
            match dir {
                Direction::Forward => {
                    idx += 1;
                    if idx == basement.len() {
                        // Ran off the basement; only a descent knows
                        // whether a neighbor holds more.
                        return None;
                    }
                }
                Direction::Backward => idx = idx.checked_sub(1)?,
            }
            let le = basement.fetch(idx)?;
            if let Some(val) = le.read_visible(&self.ctx) {
                return Some(Some(Pos {
                    key: le.key().clone(),
                    val,
                    leaf: pos.leaf,
                }));
            }
        }
    }

    /// Re-reads the entry under the cursor.
    pub fn current(&self) -> Result<Option<(CowBytes, SlicedCowBytes)>> {
        match &self.at {
            None => Ok(None),
            Some(pos) => Ok(self
                .tree
                .lookup_with(&pos.key, &self.ctx)?
                .map(|val| (pos.key.clone(), val))),
        }
    }

    /// Deletes the entry under the cursor in the cursor's transaction
    /// scope.
    pub fn delete(&mut self) -> Result<CursorOutcome> {
        match &self.at {
            None => Ok(CursorOutcome::NotFound),
            Some(pos) => {
                let key = pos.key.clone();
                self.tree.delete(&key, self.ctx.xids.clone())?;
                Ok(CursorOutcome::Found)
            }
        }
    }
}
