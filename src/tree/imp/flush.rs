//! The flush engine: draining per-child FIFOs downwards.

use super::{
    node::{FetchHint, Reactivity},
    split::FillUpResult,
    NodePin, Tree,
};
use crate::{error::Result, message::Message, tree::UpdateAction};
use std::sync::atomic::Ordering;

impl<M: UpdateAction> Tree<M> {
    /// Moves the heaviest child's entire FIFO down into that child.
    ///
    /// `is_first_flush` bounds the cascade: the first flush of a descent
    /// may keep flushing grandchildren while they remain gorged, later
    /// ones push at most one level further. After the move the child's
    /// reactivity is handled with a split or merge.
    pub(crate) fn flush_some_child(
        &self,
        parent: &mut NodePin<'_>,
        is_first_flush: bool,
    ) -> Result<()> {
        let inner = &self.inner;
        debug_assert!(!parent.is_leaf());
        let childnum = match parent.heaviest_child() {
            Some(c) => c,
            None => return Ok(()),
        };
        let child_bn = parent.child_blocknum(childnum);
        log::trace!(
            "flush_some_child: {:?} child {} ({:?})",
            parent.blocknum(),
            childnum,
            child_bn
        );
        let mut child = self.pin_blocking(child_bn, &FetchHint::All)?;

        let msgs: Vec<Message> = parent
            .fifo_mut(childnum)
            .expect("flush source FIFO is resident")
            .drain()
            .collect();
        parent.mark_dirty();
        self.deliver(&mut child, &msgs)?;

        if child.is_leaf() {
            child.recompute_leaf_estimates();
        }
        parent.slot_mut(childnum).estimate = child.aggregate_estimates();
        inner.counters.flushes.fetch_add(1, Ordering::Relaxed);

        if !child.is_leaf() {
            if is_first_flush {
                while child.is_gorged() {
                    self.flush_some_child(&mut child, false)?;
                }
            } else if child.is_gorged() {
                self.flush_some_child(&mut child, false)?;
            }
        }

        match child.reactivity(&inner.config) {
            Reactivity::Fissible => self.split_child(parent, childnum, child)?,
            Reactivity::Fusible => self.merge_child(parent, childnum, child)?,
            Reactivity::Stable => drop(child),
        }
        Ok(())
    }

    /// Hands a drained batch to the child: a nonleaf re-homes the
    /// messages in its own FIFOs (broadcasts duplicated), a leaf applies
    /// them into its partitions under the MSN gate.
    fn deliver(&self, child: &mut NodePin<'_>, msgs: &[Message]) -> Result<()> {
        let inner = &self.inner;
        let gc = inner.env.gc();
        for msg in msgs {
            if child.is_leaf() {
                child.apply_to_leaf(msg, &gc, &inner.action);
            } else {
                child.enqueue_msg(msg, &inner.config.compression)?;
            }
        }
        Ok(())
    }

    /// Splits child `childnum` (pinned as `child`) and hooks the new
    /// sibling into the parent. The parent's FIFO for this child was
    /// drained by the preceding flush, so no messages need rerouting.
    pub(crate) fn split_child(
        &self,
        parent: &mut NodePin<'_>,
        childnum: usize,
        mut child: NodePin<'_>,
    ) -> Result<()> {
        let inner = &self.inner;
        debug_assert!(parent
            .fifo(childnum)
            .map_or(true, |fifo| fifo.is_empty()));
        let right_bn = inner.store.allocate();
        let (right, pivot) = if child.is_leaf() {
            child.split_leaf(right_bn, inner.config.basementsize)
        } else {
            child.split_nonleaf(right_bn)
        };
        log::debug!(
            "split_child: {:?} -> {:?} at {:?}",
            child.blocknum(),
            right_bn,
            pivot
        );
        let right_est = right.aggregate_estimates();
        parent.slot_mut(childnum).estimate = child.aggregate_estimates();
        parent.insert_child_at(
            childnum + 1,
            super::node::ChildSlot::new_internal(right_bn, right_est),
            pivot,
        );
        drop(child);
        inner.pager.insert_new(right_bn, right).unpin();
        inner.counters.splits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Fuses child `childnum` with a neighbor, or rebalances the pair
    /// when a full merge would overshoot the node target. The spent
    /// sibling is unpinned and its block number freed.
    pub(crate) fn merge_child(
        &self,
        parent: &mut NodePin<'_>,
        childnum: usize,
        child: NodePin<'_>,
    ) -> Result<()> {
        let inner = &self.inner;
        if parent.n_children() < 2 {
            return Ok(());
        }
        // Re-pin as an ordered pair; merging needs both siblings.
        drop(child);
        let (li, ri) = if childnum + 1 < parent.n_children() {
            (childnum, childnum + 1)
        } else {
            (childnum - 1, childnum)
        };
        let mut left = self.pin_blocking(parent.child_blocknum(li), &FetchHint::All)?;
        let mut right = self.pin_blocking(parent.child_blocknum(ri), &FetchHint::All)?;

        // Drain what the parent still buffers for the pair, so the dying
        // FIFO is empty.
        for (i, node) in [(li, &mut left), (ri, &mut right)] {
            let msgs: Vec<Message> = parent
                .fifo_mut(i)
                .expect("parent partitions are resident")
                .drain()
                .collect();
            if !msgs.is_empty() {
                parent.mark_dirty();
                self.deliver(node, &msgs)?;
            }
        }

        if left.is_leaf() {
            match left.merge_or_rebalance_leaf(&mut right, inner.config.basementsize) {
                FillUpResult::Merged => {
                    let right_bn = right.blocknum();
                    drop(right);
                    parent.remove_child_at(ri);
                    parent.slot_mut(li).estimate = left.aggregate_estimates();
                    inner.pager.remove(right_bn);
                    inner.store.free(right_bn);
                    inner.counters.merges.fetch_add(1, Ordering::Relaxed);
                    log::debug!("merge_child: leaves fused, freed {:?}", right_bn);
                }
                FillUpResult::Rebalanced { pivot_key } => {
                    parent.set_pivot(li, pivot_key);
                    parent.slot_mut(li).estimate = left.aggregate_estimates();
                    parent.slot_mut(ri).estimate = right.aggregate_estimates();
                    drop(right);
                }
            }
        } else {
            let combined = left.n_children() + right.n_children();
            if combined > inner.config.fanout {
                // Fusing would immediately be fissible again; leave the
                // pair alone.
                drop(right);
                drop(left);
                return Ok(());
            }
            let right_bn = right.blocknum();
            let parent_pivot = parent.pivots()[li].clone();
            let right_node = std::mem::replace(
                &mut *right,
                super::node::Node::init_empty(right_bn, left.height(), 0, left.nodesize(), 0),
            );
            drop(right);
            left.merge_nonleaf(right_node, parent_pivot);
            parent.remove_child_at(ri);
            parent.slot_mut(li).estimate = left.aggregate_estimates();
            inner.pager.remove(right_bn);
            inner.store.free(right_bn);
            inner.counters.merges.fetch_add(1, Ordering::Relaxed);
            log::debug!("merge_child: nonleaves fused, freed {:?}", right_bn);
        }
        drop(left);
        Ok(())
    }
}
