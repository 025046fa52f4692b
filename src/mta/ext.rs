// src/mta/ext.rs
// Windowed accumulator addressed by absolute chain height

use super::accumulator::Accumulator;
use super::node::{Hash, Node, Witness};
use crate::error::{RelayError, Result};
use crate::storage::Bucket;
use std::sync::Arc;

/// Accumulator that keeps at most `limit_roots` roots. Older subtrees are
/// evicted and counted in `offset`, so height `h` maps to local index
/// `h - 1 - offset`.
pub struct ExtAccumulator {
    acc: Accumulator,
    offset: u64,
    limit_roots: usize,
    evicted: Vec<(usize, Node)>,
}

impl ExtAccumulator {
    /// `limit_roots == 0` keeps every root.
    pub fn new(bucket: Arc<dyn Bucket>, state_key: &[u8], offset: u64, limit_roots: usize) -> Self {
        Self {
            acc: Accumulator::new(bucket, state_key),
            offset,
            limit_roots,
            evicted: Vec::new(),
        }
    }

    /// Count of items ever appended, pruned ones included.
    pub fn height(&self) -> u64 {
        self.acc.len() + self.offset
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn limit_roots(&self) -> usize {
        self.limit_roots
    }

    pub fn root_hashes(&mut self) -> Vec<Option<Hash>> {
        self.acc.root_hashes()
    }

    pub fn add_hash(&mut self, hash: Hash) -> Vec<Witness> {
        self.add_node(Node::from_hash(hash))
    }

    pub fn add_data(&mut self, data: Vec<u8>) -> Vec<Witness> {
        self.add_node(Node::from_data(data))
    }

    fn add_node(&mut self, node: Node) -> Vec<Witness> {
        if self.limit_roots > 0 && self.acc.root_count() >= self.limit_roots {
            self.evict(self.limit_roots - 1);
        }
        self.acc.add_node(node)
    }

    fn evict(&mut self, height: usize) {
        if let Some(node) = self.acc.take_root(height) {
            self.offset += 1u64 << height;
            log::debug!(
                "accumulator evicted root of height {} (offset {})",
                height,
                self.offset
            );
            self.evicted.push((height, node));
        }
    }

    fn evict_excess(&mut self) {
        if self.limit_roots == 0 {
            return;
        }
        while self.acc.roots.len() > self.limit_roots {
            let top = self.acc.roots.len() - 1;
            self.evict(top);
        }
    }

    /// Persist dirty nodes and state, then drop storage of evicted subtrees.
    pub fn flush(&mut self) -> Result<()> {
        self.acc.flush_nodes()?;
        self.acc.store_state(self.offset, self.limit_roots)?;
        let bucket = self.acc.shared_bucket();
        while let Some((height, mut node)) = self.evicted.pop() {
            if let Err(e) = node.purge(height, bucket.as_ref()) {
                self.evicted.push((height, node));
                return Err(e);
            }
        }
        Ok(())
    }

    /// Restore roots, height and offset from the bucket.
    pub fn recover(&mut self) -> Result<()> {
        if let Some(state) = self.acc.load_state()? {
            self.offset = state.offset;
            if self.limit_roots == 0 {
                self.limit_roots = state.limit_roots;
            }
            self.evict_excess();
        }
        Ok(())
    }

    /// Forget every root and restart the window at `offset`.
    pub fn resync(&mut self, offset: u64) {
        log::warn!(
            "accumulator resync: height {} offset {} -> offset {}",
            self.height(),
            self.offset,
            offset
        );
        for (i, root) in self.acc.roots.iter_mut().enumerate() {
            if let Some(node) = root.take() {
                self.evicted.push((i, node));
            }
        }
        self.acc.roots.clear();
        self.acc.length = 0;
        self.offset = offset;
    }

    fn check_offset(&self, offset: u64) -> Result<()> {
        if offset != self.offset {
            return Err(RelayError::UnsupportedOffset {
                local: self.offset,
                requested: offset,
            });
        }
        Ok(())
    }

    /// Witness for the item at absolute `height` against the accumulator as it
    /// was at absolute height `at`. `at` is clamped to the local height; the
    /// resolved `at` is returned with the witness.
    pub fn witness_for_at(
        &mut self,
        height: u64,
        at: u64,
        offset: u64,
    ) -> Result<(u64, Vec<Witness>)> {
        self.check_offset(offset)?;
        let at = at.min(self.height());
        if height <= self.offset || height > at {
            return Err(RelayError::NotFound(format!(
                "height {} outside ({}, {}]",
                height, self.offset, at
            )));
        }
        let witness = self
            .acc
            .witness_for_at_length(height - 1 - self.offset, at - self.offset)?;
        Ok((at, witness))
    }

    /// Verify a witness produced against absolute height `at`.
    pub fn verify_at(&mut self, witness: &[Witness], leaf: &Hash, at: u64) -> Result<()> {
        if at <= self.offset {
            return Err(RelayError::NotFound(format!(
                "height {} at or below offset {}",
                at, self.offset
            )));
        }
        self.acc
            .verify_with_acc_length(witness, leaf, at - self.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mta::node::hash_data;
    use crate::storage::MemoryBucket;

    fn leaf(h: u64) -> Hash {
        hash_data(&h.to_be_bytes())
    }

    fn build(n: u64, limit: usize, bucket: Arc<dyn Bucket>) -> ExtAccumulator {
        let mut acc = ExtAccumulator::new(bucket, b"acc", 0, limit);
        for h in 1..=n {
            acc.add_hash(leaf(h));
        }
        acc
    }

    #[test]
    fn eight_leaves_with_three_roots() {
        let mut acc = build(8, 3, Arc::new(MemoryBucket::new()));
        assert_eq!(acc.offset(), 4);
        assert_eq!(acc.height(), 8);
        for h in 5..=8u64 {
            let (at, w) = acc.witness_for_at(h, 8, 4).unwrap();
            assert_eq!(at, 8);
            acc.verify_at(&w, &leaf(h), 8).unwrap();
        }
    }

    #[test]
    fn pruned_heights_are_unanswerable() {
        let mut acc = build(8, 3, Arc::new(MemoryBucket::new()));
        assert!(matches!(
            acc.witness_for_at(4, 8, 4),
            Err(RelayError::NotFound(_))
        ));
        assert!(matches!(
            acc.witness_for_at(6, 8, 0),
            Err(RelayError::UnsupportedOffset { local: 4, requested: 0 })
        ));
        assert!(matches!(
            acc.witness_for_at(6, 8, 8),
            Err(RelayError::UnsupportedOffset { local: 4, requested: 8 })
        ));
    }

    #[test]
    fn resident_roots_stay_bounded() {
        let mut acc = build(1000, 4, Arc::new(MemoryBucket::new()));
        assert_eq!(acc.height(), 1000);
        assert!(acc.root_hashes().len() <= 4);
        let offset = acc.offset();
        let (_, w) = acc.witness_for_at(1000, 1000, offset).unwrap();
        acc.verify_at(&w, &leaf(1000), 1000).unwrap();
    }

    #[test]
    fn at_is_clamped_to_local_height() {
        let mut acc = build(10, 0, Arc::new(MemoryBucket::new()));
        let (at, w) = acc.witness_for_at(3, 50, 0).unwrap();
        assert_eq!(at, 10);
        acc.verify_at(&w, &leaf(3), at).unwrap();
    }

    #[test]
    fn historical_at_verifies() {
        let mut acc = build(20, 0, Arc::new(MemoryBucket::new()));
        let (at, w) = acc.witness_for_at(5, 12, 0).unwrap();
        assert_eq!(at, 12);
        acc.verify_at(&w, &leaf(5), 12).unwrap();
    }

    #[test]
    fn flush_recover_keeps_offset_and_purges_evicted() {
        let bucket = Arc::new(MemoryBucket::new());
        let mut acc = ExtAccumulator::new(bucket.clone(), b"acc", 0, 3);
        for h in 1..=7u64 {
            acc.add_hash(leaf(h));
        }
        acc.flush().unwrap();
        // roots: 4 + 2 + 1 leaves -> 3 + 1 internal nodes, plus state
        assert_eq!(bucket.len(), 5);

        acc.add_hash(leaf(8));
        acc.flush().unwrap();
        // the 4-leaf subtree is gone, the new 4-leaf root is stored
        assert_eq!(bucket.len(), 4);

        let mut restored = ExtAccumulator::new(bucket, b"acc", 0, 3);
        restored.recover().unwrap();
        assert_eq!(restored.offset(), 4);
        assert_eq!(restored.height(), 8);
        let (_, w) = restored.witness_for_at(6, 8, 4).unwrap();
        restored.verify_at(&w, &leaf(6), 8).unwrap();
    }

    #[test]
    fn resync_restarts_window() {
        let mut acc = build(5, 0, Arc::new(MemoryBucket::new()));
        acc.resync(100);
        assert_eq!(acc.height(), 100);
        acc.add_hash(leaf(101));
        let (_, w) = acc.witness_for_at(101, 101, 100).unwrap();
        acc.verify_at(&w, &leaf(101), 101).unwrap();
    }
}
