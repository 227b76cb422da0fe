//! Node fission and fusion.

use super::{
    basement::Basement,
    node::{ChildSlot, Node, PartitionBody},
};
use crate::{block::Blocknum, cow_bytes::CowBytes, message::Msn};

/// Case-dependent outcome of a rebalance operation.
#[derive(Debug)]
pub(super) enum FillUpResult {
    Rebalanced { pivot_key: CowBytes },
    Merged,
}

impl Node {
    /// Splits a leaf at its serialized-size midpoint: the left half is
    /// the shortest entry prefix reaching half the total. The tail moves
    /// into a new right sibling at `right_bn`; the pivot is the key of
    /// the last entry staying left. Both halves inherit this node's MSN
    /// watermark.
    ///
    /// Every partition must be resident.
    pub(crate) fn split_leaf(
        &mut self,
        right_bn: Blocknum,
        basementsize: usize,
    ) -> (Node, CowBytes) {
        debug_assert!(self.is_leaf());
        debug_assert!(self.leaf_entry_count() > 1);
        // Collapse to one partition so the midpoint scan is one pass.
        self.rebalance_basements(usize::MAX);
        let msn = self.max_msn_applied_in_memory();
        let entries = {
            let bn = self.basement_mut(0).expect("rebalanced leaf is resident");
            std::mem::take(bn).into_entries()
        };
        let total: usize = entries.iter().map(|le| le.disksize()).sum();
        let mut acc = 0;
        let mut split_at = entries.len() - 1;
        for (i, le) in entries.iter().enumerate() {
            acc += le.disksize();
            if acc >= total / 2 {
                split_at = (i + 1).min(entries.len() - 1);
                break;
            }
        }
        let mut left_entries = entries;
        let right_entries = left_entries.split_off(split_at);
        let pivot = left_entries
            .last()
            .expect("left half is non-empty")
            .key()
            .clone();

        *self.basement_mut(0).expect("leaf partition") = Basement::from_entries(left_entries, msn);
        self.rebalance_basements(basementsize);
        self.recompute_leaf_estimates();
        self.mark_dirty();

        let mut right = Node::from_parts(
            right_bn,
            0,
            self.nodesize(),
            0,
            msn,
            Vec::new(),
            vec![ChildSlot::new_avail(PartitionBody::Leaf(
                Basement::from_entries(right_entries, msn),
            ))],
        );
        right.rebalance_basements(basementsize);
        right.recompute_leaf_estimates();
        (right, pivot)
    }

    /// Splits a nonleaf node in half by child count. The pivot between
    /// the halves is the original pivot at `n/2 - 1`.
    pub(crate) fn split_nonleaf(&mut self, right_bn: Blocknum) -> (Node, CowBytes) {
        debug_assert!(!self.is_leaf());
        debug_assert!(self.n_children() >= 2);
        let at = self.n_children() / 2;
        let msn = self.max_msn_applied_in_memory();
        let (right_pivots, right_slots, separator) = self.split_slots_off(at);
        let right = Node::from_parts(
            right_bn,
            self.height(),
            self.nodesize(),
            0,
            msn,
            right_pivots,
            right_slots,
        );
        self.mark_dirty();
        (right, separator)
    }

    /// Merges all entries of the right leaf into `self`, then decides:
    /// a result at or under three quarters of the node target stays
    /// merged, anything larger is split back evenly under a fresh
    /// pivot.
    pub(crate) fn merge_or_rebalance_leaf(
        &mut self,
        right: &mut Node,
        basementsize: usize,
    ) -> FillUpResult {
        debug_assert!(self.is_leaf() && right.is_leaf());
        let msn = self
            .max_msn_applied_in_memory()
            .max(right.max_msn_applied_in_memory());
        self.absorb_leaf(right, msn, basementsize);
        if self.serialized_size() <= self.nodesize() as usize * 3 / 4 {
            FillUpResult::Merged
        } else {
            let mut entries = {
                self.rebalance_basements(usize::MAX);
                let bn = self.basement_mut(0).expect("leaf partition");
                std::mem::take(bn).into_entries()
            };
            let back = entries.split_off(entries.len() / 2);
            let pivot_key = entries.last().expect("non-empty left half").key().clone();
            *self.basement_mut(0).expect("leaf partition") = Basement::from_entries(entries, msn);
            self.rebalance_basements(basementsize);
            self.recompute_leaf_estimates();
            *right
                .basement_mut(0)
                .expect("emptied right leaf keeps one partition") =
                Basement::from_entries(back, msn);
            right.rebalance_basements(basementsize);
            right.recompute_leaf_estimates();
            right.mark_dirty();
            FillUpResult::Rebalanced { pivot_key }
        }
    }

    /// Concatenates the right leaf's entries onto `self`. The emptied
    /// trailing partitions of the left side disappear in the re-chunk;
    /// the pivot at the seam is synthesized from the rightmost entry of
    /// the left side.
    fn absorb_leaf(&mut self, right: &mut Node, msn: Msn, basementsize: usize) {
        self.rebalance_basements(usize::MAX);
        right.rebalance_basements(usize::MAX);
        let mut entries = {
            let bn = self.basement_mut(0).expect("leaf partition");
            std::mem::take(bn).into_entries()
        };
        let right_entries = {
            let bn = right.basement_mut(0).expect("leaf partition");
            std::mem::take(bn).into_entries()
        };
        entries.extend(right_entries);
        *self.basement_mut(0).expect("leaf partition") = Basement::from_entries(entries, msn);
        self.rebalance_basements(basementsize);
        self.recompute_leaf_estimates();
        self.mark_dirty();
        right.mark_dirty();
    }

    /// Nonleaf fusion: appends the right sibling's children to `self`
    /// with the parent's old pivot separating the two halves.
    pub(crate) fn merge_nonleaf(&mut self, right: Node, parent_pivot: CowBytes) {
        debug_assert!(!self.is_leaf() && !right.is_leaf());
        debug_assert_eq!(self.height(), right.height());
        let (pivots, slots) = right.take_slots();
        let mut sep = Some(parent_pivot);
        let mut pivots = pivots.into_iter();
        for slot in slots {
            self.append_child(slot, sep.take().or_else(|| pivots.next()));
        }
        self.mark_dirty();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        message::{Message, MessageType, Xids},
        tree::imp::leaf_entry::GcContext,
        tree::imp::node::SubtreeEstimates,
        tree::DefaultUpdateAction,
    };

    fn leaf_with_keys(n: u64, val_len: usize) -> Node {
        let mut node = Node::empty_leaf(Blocknum(7), 4096);
        for i in 0..n {
            let msg = Message::new(
                MessageType::Insert,
                Xids::root(),
                CowBytes::from(&i.to_be_bytes()[..]),
                CowBytes::from(vec![0xab; val_len]).into(),
            )
            .with_msn(Msn(i + 1));
            node.apply_to_leaf(&msg, &GcContext::default(), &DefaultUpdateAction);
        }
        node
    }

    fn keys_of(node: &Node) -> Vec<Vec<u8>> {
        (0..node.n_children())
            .flat_map(|i| {
                node.basement(i)
                    .unwrap()
                    .iter()
                    .map(|le| le.key().to_vec())
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    #[test]
    fn leaf_split_covers_range_without_overlap() {
        let mut left = leaf_with_keys(100, 32);
        let before = keys_of(&left);
        let msn = left.max_msn_applied_in_memory();
        let (right, pivot) = left.split_leaf(Blocknum(8), 512);
        let left_keys = keys_of(&left);
        let right_keys = keys_of(&right);
        assert_eq!(left_keys.last().unwrap(), &pivot.to_vec());
        assert!(right_keys.first().unwrap() > &pivot.to_vec());
        let mut rejoined = left_keys;
        rejoined.extend(right_keys);
        assert_eq!(rejoined, before);
        assert_eq!(left.max_msn_applied_in_memory(), msn);
        assert_eq!(right.max_msn_applied_in_memory(), msn);
        assert!(right.is_dirty());
    }

    #[test]
    fn leaf_split_is_roughly_even() {
        let mut left = leaf_with_keys(64, 64);
        let total = left.serialized_size();
        let (right, _pivot) = left.split_leaf(Blocknum(8), 100000);
        let l = left.serialized_size();
        let r = right.serialized_size();
        assert!(l < total && r < total);
        assert!(l.abs_diff(r) < total / 2);
    }

    #[test]
    fn merge_small_leaves() {
        let mut left = leaf_with_keys(40, 16);
        let (mut right, _pivot) = left.split_leaf(Blocknum(8), 512);
        match left.merge_or_rebalance_leaf(&mut right, 512) {
            FillUpResult::Merged => {}
            other => panic!("expected merge, got {:?}", other),
        }
        assert_eq!(left.leaf_entry_count(), 40);
    }

    #[test]
    fn merge_large_leaves_rebalances() {
        let mut left = leaf_with_keys(100, 64);
        let (mut right, _pivot) = left.split_leaf(Blocknum(8), 512);
        match left.merge_or_rebalance_leaf(&mut right, 512) {
            FillUpResult::Rebalanced { pivot_key } => {
                let l = keys_of(&left);
                let r = keys_of(&right);
                assert_eq!(l.last().unwrap(), &pivot_key.to_vec());
                assert!(r.first().unwrap() > &pivot_key.to_vec());
                assert_eq!(l.len() + r.len(), 100);
            }
            other => panic!("expected rebalance, got {:?}", other),
        }
    }

    fn nonleaf_with_children(n: u64) -> Node {
        let mut node = Node::init_empty(Blocknum(1), 1, 0, 4096, 0);
        for i in 0..n {
            node.append_child(
                ChildSlot::new_internal(Blocknum(100 + i), SubtreeEstimates::default()),
                if i == 0 {
                    None
                } else {
                    Some(CowBytes::from(&i.to_be_bytes()[..]))
                },
            );
        }
        node
    }

    #[test]
    fn nonleaf_split_and_merge_roundtrip() {
        let mut left = nonleaf_with_children(8);
        let pivots_before: Vec<_> = left.pivots().to_vec();
        let (right, pivot) = left.split_nonleaf(Blocknum(2));
        assert_eq!(left.n_children(), 4);
        assert_eq!(right.n_children(), 4);
        // The separator is the original pivot at n/2 - 1.
        assert_eq!(pivot, pivots_before[3]);
        left.merge_nonleaf(right, pivot);
        assert_eq!(left.n_children(), 8);
        assert_eq!(left.pivots(), &pivots_before[..]);
    }

    #[test]
    fn insert_and_remove_child_slots() {
        let mut node = nonleaf_with_children(3);
        let n = node.n_children();
        // A pivot strictly between the existing pivots 1 and 2.
        let mut between = 1u64.to_be_bytes().to_vec();
        between.push(1);
        node.insert_child_at(
            2,
            ChildSlot::new_internal(Blocknum(50), SubtreeEstimates::default()),
            CowBytes::from(between),
        );
        assert_eq!(node.n_children(), n + 1);
        node.remove_child_at(2);
        assert_eq!(node.n_children(), n);
    }
}
