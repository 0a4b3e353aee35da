//! Online Merkle accumulator for one block.
//!
//! Slot `j` holds the root of a complete subtree over `2^j` leaves (node
//! level `j + 1`). After `n` leaves the occupied slots are exactly the set
//! bits of `n`. Adding a leaf carries upward like binary addition; closing
//! folds the remaining roots from the lowest slot upward, the older (higher)
//! subtree always on the left.
//!
//! Every merge is reported to a [`TreeObserver`], which is how the
//! record-chain builder follows individual leaves to the root.

use logsig_core::{hash_mask, hash_node, DataHash, Error, HashAlgorithm, Result};
use serde::Serialize;
use std::collections::VecDeque;
use std::ops::Range;

/// Number of slots; a block holds fewer than `2^MAX_TREE_HEIGHT` leaves.
pub const MAX_TREE_HEIGHT: usize = 31;

/// What a leaf stands for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum LeafKind {
    /// A log line.
    Record,
    /// An embedded meta-record.
    MetaRecord,
}

/// Reported once per leaf, before any merge it triggers.
#[derive(Debug)]
pub struct LeafEvent<'a> {
    /// Kind of leaf.
    pub kind: LeafKind,
    /// 1-based position of the leaf in the block.
    pub offset: u64,
    /// Hash of the record or meta-record.
    pub record_hash: &'a DataHash,
    /// Mask the leaf was blinded with.
    pub mask: &'a DataHash,
    /// Resulting leaf (level 1 node).
    pub leaf: &'a DataHash,
}

/// Reported for every node built, while adding leaves and while closing.
#[derive(Debug)]
pub struct MergeEvent<'a> {
    /// Left child.
    pub left: &'a DataHash,
    /// Right child.
    pub right: &'a DataHash,
    /// New node.
    pub parent: &'a DataHash,
    /// Level of the left child.
    pub left_level: u8,
    /// Level of the right child.
    pub right_level: u8,
    /// Level of the new node.
    pub parent_level: u8,
    /// Leaf offsets under the left child.
    pub left_leaves: Range<u64>,
    /// Leaf offsets under the right child.
    pub right_leaves: Range<u64>,
    /// `true` for the folding steps of [`MerkleTree::close`].
    pub closing: bool,
}

/// Receives tree events. Both hooks default to doing nothing.
pub trait TreeObserver {
    /// A leaf was added.
    fn on_leaf(&mut self, event: &LeafEvent<'_>) -> Result<()> {
        let _ = event;
        Ok(())
    }

    /// Two subtrees were combined.
    fn on_merge(&mut self, event: &MergeEvent<'_>) -> Result<()> {
        let _ = event;
        Ok(())
    }
}

/// Observer that ignores everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoObserver;

impl TreeObserver for NoObserver {}

#[derive(Clone, Debug)]
struct Node {
    hash: DataHash,
    level: u8,
    leaves: Range<u64>,
}

/// Per-block tree state. Reset with [`MerkleTree::reset`] at each block header.
#[derive(Clone, Debug)]
pub struct MerkleTree {
    algorithm: HashAlgorithm,
    seed: Vec<u8>,
    slots: Vec<Option<Node>>,
    height: usize,
    prev_leaf: Option<DataHash>,
    leaf_count: u64,
    unverified: VecDeque<DataHash>,
}

impl MerkleTree {
    /// Empty tree; no leaf can be added before [`MerkleTree::reset`].
    #[must_use]
    pub fn new(algorithm: HashAlgorithm) -> Self {
        Self {
            algorithm,
            seed: Vec::new(),
            slots: vec![None; MAX_TREE_HEIGHT],
            height: 0,
            prev_leaf: None,
            leaf_count: 0,
            unverified: VecDeque::new(),
        }
    }

    /// Start a block: new algorithm and seed, masking chain anchored at
    /// `input_hash` (the previous block's last leaf).
    pub fn reset(&mut self, algorithm: HashAlgorithm, seed: &[u8], input_hash: DataHash) {
        self.algorithm = algorithm;
        self.seed.clear();
        self.seed.extend_from_slice(seed);
        self.slots.iter_mut().for_each(|s| *s = None);
        self.height = 0;
        self.prev_leaf = Some(input_hash);
        self.leaf_count = 0;
        self.unverified.clear();
    }

    /// Hash function of the current block.
    #[must_use]
    pub const fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Leaves added since the last reset.
    #[must_use]
    pub const fn leaf_count(&self) -> u64 {
        self.leaf_count
    }

    /// One past the highest slot ever occupied in this block.
    #[must_use]
    pub const fn height(&self) -> usize {
        self.height
    }

    /// `true` when the leaves form a perfect tree (a single occupied slot).
    #[must_use]
    pub const fn is_balanced(&self) -> bool {
        self.leaf_count.is_power_of_two()
    }

    /// Last leaf added, or the block's input hash before the first leaf.
    #[must_use]
    pub const fn prev_leaf(&self) -> Option<&DataHash> {
        self.prev_leaf.as_ref()
    }

    /// Mask the next leaf will be blinded with.
    pub fn next_mask(&self) -> Result<DataHash> {
        let prev = self
            .prev_leaf
            .as_ref()
            .ok_or_else(|| Error::argument("tree used before a block was started"))?;
        Ok(hash_mask(self.algorithm, prev, &self.seed))
    }

    /// Pending subtree root in `slot` (covering `2^slot` leaves).
    #[must_use]
    pub fn subtree_root(&self, slot: usize) -> Option<&DataHash> {
        self.slots.get(slot)?.as_ref().map(|n| &n.hash)
    }

    /// Blind `record_hash` into a leaf and insert it, merging upward.
    pub fn add_leaf(
        &mut self,
        kind: LeafKind,
        record_hash: &DataHash,
        observer: &mut dyn TreeObserver,
    ) -> Result<DataHash> {
        let alg = self.algorithm;
        let mask = self.next_mask()?;
        let leaf = match kind {
            LeafKind::Record => hash_node(alg, &mask, record_hash, 1),
            LeafKind::MetaRecord => hash_node(alg, record_hash, &mask, 1),
        };
        let offset = self.leaf_count + 1;
        observer.on_leaf(&LeafEvent {
            kind,
            offset,
            record_hash,
            mask: &mask,
            leaf: &leaf,
        })?;
        self.leaf_count = offset;
        self.unverified.push_back(leaf.clone());

        let mut node = Node {
            hash: leaf.clone(),
            level: 1,
            leaves: offset..offset + 1,
        };
        let mut slot = 0;
        loop {
            if slot >= MAX_TREE_HEIGHT {
                return Err(Error::format(format!(
                    "block exceeds the maximum tree height of {MAX_TREE_HEIGHT}"
                )));
            }
            let Some(left) = self.slots[slot].take() else {
                self.slots[slot] = Some(node);
                break;
            };
            let level = left.level + 1;
            let parent = hash_node(alg, &left.hash, &node.hash, level);
            observer.on_merge(&MergeEvent {
                left: &left.hash,
                right: &node.hash,
                parent: &parent,
                left_level: left.level,
                right_level: node.level,
                parent_level: level,
                left_leaves: left.leaves.clone(),
                right_leaves: node.leaves.clone(),
                closing: false,
            })?;
            self.unverified.push_back(parent.clone());
            node = Node {
                hash: parent,
                level,
                leaves: left.leaves.start..node.leaves.end,
            };
            slot += 1;
        }
        self.height = self.height.max(slot + 1);
        self.prev_leaf = Some(leaf.clone());
        Ok(leaf)
    }

    /// Hashes [`MerkleTree::close`] would produce, in order, without
    /// changing the tree. Empty for a perfect tree.
    #[must_use]
    pub fn final_hashes(&self) -> Vec<DataHash> {
        let mut out = Vec::new();
        let mut acc: Option<DataHash> = None;
        for (j, node) in self.occupied() {
            acc = Some(match acc {
                None => node.hash.clone(),
                Some(right) => {
                    let h = hash_node(self.algorithm, &node.hash, &right, merge_level(j));
                    out.push(h.clone());
                    h
                }
            });
        }
        out
    }

    /// Fold the pending subtrees into the block root.
    ///
    /// Returns `None` when no leaf was added. The previous-leaf register is
    /// kept so the next block can be linked to this one.
    pub fn close(&mut self, observer: &mut dyn TreeObserver) -> Result<Option<DataHash>> {
        let mut acc: Option<Node> = None;
        for j in 0..self.height {
            let Some(node) = self.slots[j].take() else {
                continue;
            };
            acc = Some(match acc {
                None => node,
                Some(right) => {
                    let level = merge_level(j);
                    let parent = hash_node(self.algorithm, &node.hash, &right.hash, level);
                    observer.on_merge(&MergeEvent {
                        left: &node.hash,
                        right: &right.hash,
                        parent: &parent,
                        left_level: node.level,
                        right_level: right.level,
                        parent_level: level,
                        left_leaves: node.leaves.clone(),
                        right_leaves: right.leaves.clone(),
                        closing: true,
                    })?;
                    Node {
                        hash: parent,
                        level,
                        leaves: node.leaves.start..right.leaves.end,
                    }
                }
            });
        }
        self.height = 0;
        self.unverified.clear();
        Ok(acc.map(|n| n.hash))
    }

    /* ------------------ hashes awaiting comparison ------------------ */

    /// Oldest recomputed hash not yet matched against a tree hash from the
    /// file.
    pub fn pop_unverified(&mut self) -> Option<DataHash> {
        self.unverified.pop_front()
    }

    /// Number of recomputed hashes awaiting comparison.
    #[must_use]
    pub fn unverified_len(&self) -> usize {
        self.unverified.len()
    }

    /// Forget pending comparisons (files without tree hashes).
    pub fn clear_unverified(&mut self) {
        self.unverified.clear();
    }

    fn occupied(&self) -> impl Iterator<Item = (usize, &Node)> + '_ {
        self.slots[..self.height]
            .iter()
            .enumerate()
            .filter_map(|(j, s)| s.as_ref().map(|n| (j, n)))
    }
}

/// Level of the node formed when something merges into `slot`.
#[allow(clippy::cast_possible_truncation)]
const fn merge_level(slot: usize) -> u8 {
    // slot < MAX_TREE_HEIGHT, so the result fits.
    (slot + 2) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALG: HashAlgorithm = HashAlgorithm::Sha256;

    fn started() -> MerkleTree {
        let mut t = MerkleTree::new(ALG);
        t.reset(ALG, &[0x5a; 32], ALG.hash(b"input"));
        t
    }

    fn rec(i: u32) -> DataHash {
        ALG.hash(format!("record {i}").as_bytes())
    }

    #[derive(Default)]
    struct Recorder {
        merges: Vec<(u8, u8, u8, bool)>,
    }

    impl TreeObserver for Recorder {
        fn on_merge(&mut self, e: &MergeEvent<'_>) -> Result<()> {
            self.merges
                .push((e.left_level, e.right_level, e.parent_level, e.closing));
            Ok(())
        }
    }

    #[test]
    fn empty_block_has_no_root() {
        let mut t = started();
        assert!(t.close(&mut NoObserver).unwrap().is_none());
        assert!(t.final_hashes().is_empty());
    }

    #[test]
    fn leaf_before_reset_is_rejected() {
        let mut t = MerkleTree::new(ALG);
        assert!(t.add_leaf(LeafKind::Record, &rec(0), &mut NoObserver).is_err());
    }

    #[test]
    fn single_leaf_root_is_the_masked_leaf() {
        let mut t = started();
        let mask = hash_mask(ALG, &ALG.hash(b"input"), &[0x5a; 32]);
        assert_eq!(t.next_mask().unwrap(), mask);
        let leaf = t.add_leaf(LeafKind::Record, &rec(0), &mut NoObserver).unwrap();
        assert_eq!(leaf, hash_node(ALG, &mask, &rec(0), 1));
        assert_eq!(t.close(&mut NoObserver).unwrap(), Some(leaf));
    }

    #[test]
    fn three_leaves_fold_pair_then_pending_leaf() {
        let mut t = started();
        let mut rec_obs = Recorder::default();
        let l0 = t.add_leaf(LeafKind::Record, &rec(0), &mut rec_obs).unwrap();
        let l1 = t.add_leaf(LeafKind::Record, &rec(1), &mut rec_obs).unwrap();
        let l2 = t.add_leaf(LeafKind::Record, &rec(2), &mut rec_obs).unwrap();
        assert_eq!(t.leaf_count(), 3);
        assert!(!t.is_balanced());
        let pair = hash_node(ALG, &l0, &l1, 2);
        assert_eq!(t.subtree_root(0), Some(&l2));
        assert_eq!(t.subtree_root(1), Some(&pair));

        let expected = hash_node(ALG, &pair, &l2, 3);
        assert_eq!(t.final_hashes(), vec![expected.clone()]);
        assert_eq!(t.close(&mut rec_obs).unwrap(), Some(expected));
        assert_eq!(rec_obs.merges, vec![(1, 1, 2, false), (2, 1, 3, true)]);
    }

    #[test]
    fn masks_chain_through_previous_leaves() {
        let mut t = started();
        let l0 = t.add_leaf(LeafKind::Record, &rec(0), &mut NoObserver).unwrap();
        assert_eq!(t.prev_leaf(), Some(&l0));
        assert_eq!(t.next_mask().unwrap(), hash_mask(ALG, &l0, &[0x5a; 32]));
    }

    #[test]
    fn meta_record_leaf_puts_hash_on_the_left() {
        let mut t = started();
        let mask = t.next_mask().unwrap();
        let meta = ALG.hash(b"meta");
        let leaf = t.add_leaf(LeafKind::MetaRecord, &meta, &mut NoObserver).unwrap();
        assert_eq!(leaf, hash_node(ALG, &meta, &mask, 1));
    }

    #[test]
    fn unverified_queue_lists_leaf_then_merges() {
        let mut t = started();
        let l0 = t.add_leaf(LeafKind::Record, &rec(0), &mut NoObserver).unwrap();
        assert_eq!(t.pop_unverified(), Some(l0.clone()));
        let l1 = t.add_leaf(LeafKind::Record, &rec(1), &mut NoObserver).unwrap();
        assert_eq!(t.unverified_len(), 2);
        assert_eq!(t.pop_unverified(), Some(l1.clone()));
        assert_eq!(t.pop_unverified(), Some(hash_node(ALG, &l0, &l1, 2)));
        assert_eq!(t.pop_unverified(), None);
    }

    #[test]
    fn occupied_slots_follow_binary_representation() {
        let mut t = started();
        for n in 1..=37u32 {
            t.add_leaf(LeafKind::Record, &rec(n), &mut NoObserver).unwrap();
            for j in 0..8 {
                assert_eq!(t.subtree_root(j).is_some(), (n >> j) & 1 == 1, "n={n} slot={j}");
            }
        }
    }
}
