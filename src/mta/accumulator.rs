// src/mta/accumulator.rs
// Merkle tree accumulator: append-only binary-counter forest of subtree roots

use super::node::{compute_root, Direction, Hash, Node, Witness};
use crate::error::{RelayError, Result};
use crate::storage::{self, Bucket};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Persisted accumulator state. `height` counts every appended item,
/// including the `offset` items pruned by a windowed accumulator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredState {
    pub roots: Vec<Option<String>>,
    pub height: u64,
    pub offset: u64,
    pub limit_roots: usize,
}

/// Height of the root covering `idx` in an accumulator of `length` items,
/// and the position of `idx` inside that root.
pub(crate) fn locate(idx: u64, length: u64) -> Option<(usize, u64)> {
    if idx >= length {
        return None;
    }
    let mut base = 0u64;
    for i in (0..64usize).rev() {
        let size = 1u64 << i;
        if length & size == 0 {
            continue;
        }
        if idx < base + size {
            return Some((i, idx - base));
        }
        base += size;
    }
    None
}

/// Absolute index implied by a witness verified against an accumulator of `length` items.
pub(crate) fn index_from_witness(witness: &[Witness], length: u64) -> Result<u64> {
    let height = witness.len();
    if height >= 64 || length & (1u64 << height) == 0 {
        return Err(RelayError::InvalidWitness(format!(
            "no root of height {} at length {}",
            height, length
        )));
    }
    // larger (older) roots come first
    let base: u64 = (height + 1..64)
        .filter(|i| length & (1u64 << i) != 0)
        .map(|i| 1u64 << i)
        .sum();
    let pos = witness
        .iter()
        .enumerate()
        .filter(|(_, w)| w.direction == Direction::Left)
        .fold(0u64, |acc, (level, _)| acc | (1u64 << level));
    Ok(base + pos)
}

pub struct Accumulator {
    bucket: Arc<dyn Bucket>,
    state_key: Vec<u8>,
    pub(crate) roots: Vec<Option<Node>>,
    pub(crate) length: u64,
}

impl Accumulator {
    pub fn new(bucket: Arc<dyn Bucket>, state_key: &[u8]) -> Self {
        Self {
            bucket,
            state_key: state_key.to_vec(),
            roots: Vec::new(),
            length: 0,
        }
    }

    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub(crate) fn shared_bucket(&self) -> Arc<dyn Bucket> {
        self.bucket.clone()
    }

    /// Number of non-empty roots.
    pub fn root_count(&self) -> usize {
        self.roots.iter().filter(|r| r.is_some()).count()
    }

    pub fn root_hashes(&mut self) -> Vec<Option<Hash>> {
        self.roots
            .iter_mut()
            .map(|r| r.as_mut().map(|n| n.hash()))
            .collect()
    }

    pub fn add_hash(&mut self, hash: Hash) -> Vec<Witness> {
        self.add_node(Node::from_hash(hash))
    }

    pub fn add_data(&mut self, data: Vec<u8>) -> Vec<Witness> {
        self.add_node(Node::from_data(data))
    }

    /// Carry-propagating append. Returns the witness of the new leaf against
    /// the root it ends up under.
    pub(crate) fn add_node(&mut self, node: Node) -> Vec<Witness> {
        let mut node = node;
        let mut witness = Vec::new();
        let mut i = 0;
        loop {
            if i == self.roots.len() {
                self.roots.push(None);
            }
            match self.roots[i].take() {
                None => {
                    self.roots[i] = Some(node);
                    break;
                }
                Some(mut root) => {
                    witness.push(Witness::left(root.hash()));
                    node = Node::branch(root, node);
                }
            }
            i += 1;
        }
        self.length += 1;
        witness
    }

    /// Drop the root at `height`, shrinking the accumulator from the old end.
    pub(crate) fn take_root(&mut self, height: usize) -> Option<Node> {
        let node = self.roots.get_mut(height).and_then(|r| r.take())?;
        self.length -= 1u64 << height;
        while matches!(self.roots.last(), Some(None)) {
            self.roots.pop();
        }
        Some(node)
    }

    pub(crate) fn flush_nodes(&mut self) -> Result<()> {
        let bucket = self.bucket.clone();
        for root in self.roots.iter_mut().flatten() {
            root.flush(bucket.as_ref())?;
        }
        Ok(())
    }

    pub(crate) fn store_state(&mut self, offset: u64, limit_roots: usize) -> Result<()> {
        let state = StoredState {
            roots: self
                .root_hashes()
                .into_iter()
                .map(|h| h.map(hex::encode))
                .collect(),
            height: self.length + offset,
            offset,
            limit_roots,
        };
        storage::put(self.bucket.as_ref(), &self.state_key, &state)
    }

    /// Read persisted state and rebuild the roots as unresolved nodes.
    pub(crate) fn load_state(&mut self) -> Result<Option<StoredState>> {
        let Some(state) = storage::get::<StoredState>(self.bucket.as_ref(), &self.state_key)?
        else {
            return Ok(None);
        };
        if state.height < state.offset {
            return Err(RelayError::Format(format!(
                "height {} below offset {}",
                state.height, state.offset
            )));
        }
        let length = state.height - state.offset;
        if state.roots.len() < 64 && length >> state.roots.len() != 0 {
            return Err(RelayError::Format(format!(
                "length {} needs more than {} roots",
                length,
                state.roots.len()
            )));
        }
        let mut roots = Vec::with_capacity(state.roots.len());
        for (i, root) in state.roots.iter().enumerate() {
            let present = length & (1u64 << i) != 0;
            match (root, present) {
                (Some(h), true) => {
                    let bytes = hex::decode(h).map_err(|e| RelayError::Format(e.to_string()))?;
                    let hash: Hash = bytes.as_slice().try_into().map_err(|_| {
                        RelayError::Format(format!("root {} has {} bytes", i, bytes.len()))
                    })?;
                    roots.push(Some(Node::Unresolved(hash)));
                }
                (None, false) => roots.push(None),
                _ => {
                    return Err(RelayError::Format(format!(
                        "root {} does not match length {}",
                        i, length
                    )))
                }
            }
        }
        self.roots = roots;
        self.length = length;
        Ok(Some(state))
    }

    pub fn flush(&mut self) -> Result<()> {
        self.flush_nodes()?;
        self.store_state(0, 0)
    }

    /// Restore from the bucket. A missing state leaves the accumulator empty.
    pub fn recover(&mut self) -> Result<()> {
        self.load_state()?;
        Ok(())
    }

    pub fn witness_for(&mut self, idx: u64) -> Result<Vec<Witness>> {
        let (height, pos) = locate(idx, self.length).ok_or_else(|| {
            RelayError::NotFound(format!("index {} (length {})", idx, self.length))
        })?;
        let bucket = self.bucket.clone();
        let root = self.roots[height]
            .as_mut()
            .ok_or_else(|| RelayError::Format(format!("root {} missing", height)))?;
        root.witness(height, pos, bucket.as_ref())
    }

    /// Witness for `idx` as it was when the accumulator held `at_length` items.
    pub fn witness_for_at_length(&mut self, idx: u64, at_length: u64) -> Result<Vec<Witness>> {
        if at_length > self.length {
            return Err(RelayError::NotFound(format!(
                "length {} not reached (length {})",
                at_length, self.length
            )));
        }
        let (height, _) = locate(idx, at_length).ok_or_else(|| {
            RelayError::NotFound(format!("index {} (length {})", idx, at_length))
        })?;
        let mut witness = self.witness_for(idx)?;
        witness.truncate(height);
        Ok(witness)
    }

    pub fn verify(&mut self, witness: &[Witness], leaf: &Hash) -> Result<()> {
        let height = witness.len();
        let root = self
            .roots
            .get_mut(height)
            .and_then(|r| r.as_mut())
            .ok_or_else(|| {
                RelayError::InvalidWitness(format!("no root at height {}", height))
            })?;
        if compute_root(witness, leaf) != root.hash() {
            return Err(RelayError::InvalidWitness(format!(
                "root mismatch at height {}",
                height
            )));
        }
        Ok(())
    }

    /// Verify a witness produced by an accumulator of `at_length` items.
    pub fn verify_with_acc_length(
        &mut self,
        witness: &[Witness],
        leaf: &Hash,
        at_length: u64,
    ) -> Result<()> {
        if at_length == self.length {
            return self.verify(witness, leaf);
        }
        let idx = index_from_witness(witness, at_length)?;
        if self.length > at_length {
            let fresh = self.witness_for(idx)?;
            return self.verify(&fresh, leaf);
        }
        let (height, _) = locate(idx, self.length).ok_or_else(|| {
            RelayError::InvalidWitness(format!(
                "index {} newer than length {}",
                idx, self.length
            ))
        })?;
        if witness.len() < height {
            return Err(RelayError::InvalidWitness(format!(
                "witness depth {} below root height {}",
                witness.len(),
                height
            )));
        }
        self.verify(&witness[..height], leaf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mta::node::hash_data;
    use crate::storage::MemoryBucket;

    fn leaf(i: u64) -> Hash {
        hash_data(&i.to_be_bytes())
    }

    fn build(n: u64, bucket: Arc<dyn Bucket>) -> Accumulator {
        let mut acc = Accumulator::new(bucket, b"acc");
        for i in 0..n {
            acc.add_hash(leaf(i));
        }
        acc
    }

    #[test]
    fn roots_follow_binary_counter() {
        let mut acc = Accumulator::new(Arc::new(MemoryBucket::new()), b"acc");
        for n in 1..=37u64 {
            acc.add_hash(leaf(n - 1));
            assert_eq!(acc.len(), n);
            assert_eq!(acc.root_count() as u32, n.count_ones());
            for (i, r) in acc.roots.iter().enumerate() {
                assert_eq!(r.is_some(), n & (1 << i) != 0);
            }
        }
    }

    #[test]
    fn add_returns_valid_witness() {
        let mut acc = Accumulator::new(Arc::new(MemoryBucket::new()), b"acc");
        for i in 0..20u64 {
            let w = acc.add_hash(leaf(i));
            acc.verify(&w, &leaf(i)).unwrap();
        }
    }

    #[test]
    fn every_index_verifies() {
        let mut acc = build(23, Arc::new(MemoryBucket::new()));
        for i in 0..23u64 {
            let w = acc.witness_for(i).unwrap();
            acc.verify(&w, &leaf(i)).unwrap();
        }
        assert!(matches!(acc.witness_for(23), Err(RelayError::NotFound(_))));
    }

    #[test]
    fn wrong_leaf_is_rejected() {
        let mut acc = build(8, Arc::new(MemoryBucket::new()));
        let w = acc.witness_for(3).unwrap();
        assert!(matches!(
            acc.verify(&w, &leaf(4)),
            Err(RelayError::InvalidWitness(_))
        ));
    }

    #[test]
    fn too_deep_witness_is_rejected() {
        let mut acc = build(3, Arc::new(MemoryBucket::new()));
        let w = vec![Witness::left([0u8; 32]); 5];
        assert!(matches!(
            acc.verify(&w, &leaf(0)),
            Err(RelayError::InvalidWitness(_))
        ));
    }

    #[test]
    fn data_leaves_verify_by_payload_hash() {
        let mut acc = Accumulator::new(Arc::new(MemoryBucket::new()), b"acc");
        for i in 0..5u8 {
            acc.add_data(vec![i; 3]);
        }
        let w = acc.witness_for(2).unwrap();
        acc.verify(&w, &hash_data(&[2u8; 3])).unwrap();
    }

    #[test]
    fn flush_and_recover_answer_identically() {
        let bucket: Arc<dyn Bucket> = Arc::new(MemoryBucket::new());
        let mut acc = build(13, bucket.clone());
        acc.flush().unwrap();

        let mut restored = Accumulator::new(bucket, b"acc");
        restored.recover().unwrap();
        assert_eq!(restored.len(), 13);
        for i in 0..13u64 {
            let expected = acc.witness_for(i).unwrap();
            let w = restored.witness_for(i).unwrap();
            assert_eq!(w, expected);
            restored.verify(&w, &leaf(i)).unwrap();
        }
        // recovered accumulator keeps growing
        let w = restored.add_hash(leaf(13));
        restored.verify(&w, &leaf(13)).unwrap();
    }

    #[test]
    fn recover_rejects_inconsistent_length() {
        let bucket: Arc<dyn Bucket> = Arc::new(MemoryBucket::new());
        let state = StoredState {
            roots: vec![Some(hex::encode([1u8; 32])), None],
            height: 2,
            offset: 0,
            limit_roots: 0,
        };
        storage::put(bucket.as_ref(), b"acc", &state).unwrap();
        let mut acc = Accumulator::new(bucket, b"acc");
        assert!(matches!(acc.recover(), Err(RelayError::Format(_))));
    }

    #[test]
    fn verify_across_lengths() {
        let bucket: Arc<dyn Bucket> = Arc::new(MemoryBucket::new());
        let mut older = build(11, bucket.clone());
        let mut newer = build(29, Arc::new(MemoryBucket::new()));
        for i in 0..11u64 {
            // older witness checked by the newer accumulator
            let w = older.witness_for(i).unwrap();
            newer.verify_with_acc_length(&w, &leaf(i), 11).unwrap();
            // newer witness checked by the older accumulator
            let w = newer.witness_for(i).unwrap();
            older.verify_with_acc_length(&w, &leaf(i), 29).unwrap();
        }
        // index only present in the newer accumulator
        let w = newer.witness_for(20).unwrap();
        assert!(matches!(
            older.verify_with_acc_length(&w, &leaf(20), 29),
            Err(RelayError::InvalidWitness(_))
        ));
    }

    #[test]
    fn historical_witness_matches_old_accumulator() {
        let mut old = build(6, Arc::new(MemoryBucket::new()));
        let mut acc = build(16, Arc::new(MemoryBucket::new()));
        for i in 0..6u64 {
            assert_eq!(
                acc.witness_for_at_length(i, 6).unwrap(),
                old.witness_for(i).unwrap()
            );
        }
    }

    #[test]
    fn index_from_witness_matches_position() {
        let mut acc = build(13, Arc::new(MemoryBucket::new()));
        for i in 0..13u64 {
            let w = acc.witness_for(i).unwrap();
            assert_eq!(index_from_witness(&w, 13).unwrap(), i);
        }
    }
}
