// src/mta/node.rs
// Accumulator tree nodes and witness path elements

use crate::error::{RelayError, Result};
use crate::storage::Bucket;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub type Hash = [u8; 32];

pub fn hash_data(data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

pub fn hash_pair(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Side of the sibling relative to the node being proven.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Sibling is the left child: parent = H(sibling || current)
    Left,
    /// Sibling is the right child: parent = H(current || sibling)
    Right,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Witness {
    pub direction: Direction,
    pub hash: Hash,
}

impl Witness {
    pub fn left(hash: Hash) -> Self {
        Self {
            direction: Direction::Left,
            hash,
        }
    }

    pub fn right(hash: Hash) -> Self {
        Self {
            direction: Direction::Right,
            hash,
        }
    }
}

/// Replay a leaf-to-root witness path starting from `leaf`.
pub fn compute_root(witness: &[Witness], leaf: &Hash) -> Hash {
    witness.iter().fold(*leaf, |current, w| match w.direction {
        Direction::Left => hash_pair(&w.hash, &current),
        Direction::Right => hash_pair(&current, &w.hash),
    })
}

/// Raw sibling hashes of a witness, as carried by block proofs.
pub fn witness_hashes(witness: &[Witness]) -> Vec<Hash> {
    witness.iter().map(|w| w.hash).collect()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum NodeState {
    Dirty,
    Hashed,
    Flushed,
}

#[derive(Debug)]
pub(crate) struct Branch {
    left: Node,
    right: Node,
    hash: Option<Hash>,
    state: NodeState,
}

#[derive(Debug)]
pub(crate) struct Leaf {
    payload: Option<Vec<u8>>,
    hash: Option<Hash>,
    state: NodeState,
}

/// A tree node. `Unresolved` nodes carry only their hash; their children
/// (if any) are loaded from the bucket on demand.
#[derive(Debug)]
pub(crate) enum Node {
    Unresolved(Hash),
    Branch(Box<Branch>),
    Leaf(Leaf),
}

impl Node {
    pub(crate) fn from_hash(hash: Hash) -> Self {
        Node::Leaf(Leaf {
            payload: None,
            hash: Some(hash),
            state: NodeState::Hashed,
        })
    }

    pub(crate) fn from_data(data: Vec<u8>) -> Self {
        Node::Leaf(Leaf {
            payload: Some(data),
            hash: None,
            state: NodeState::Dirty,
        })
    }

    pub(crate) fn branch(left: Node, right: Node) -> Self {
        Node::Branch(Box::new(Branch {
            left,
            right,
            hash: None,
            state: NodeState::Dirty,
        }))
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> NodeState {
        match self {
            Node::Unresolved(_) => NodeState::Flushed,
            Node::Branch(b) => b.state,
            Node::Leaf(l) => l.state,
        }
    }

    /// Hash of the node, computed once and cached.
    pub(crate) fn hash(&mut self) -> Hash {
        match self {
            Node::Unresolved(h) => *h,
            Node::Leaf(leaf) => match leaf.hash {
                Some(h) => h,
                None => {
                    let h = hash_data(leaf.payload.as_deref().unwrap_or_default());
                    leaf.hash = Some(h);
                    leaf.state = NodeState::Hashed;
                    h
                }
            },
            Node::Branch(b) => match b.hash {
                Some(h) => h,
                None => {
                    let l = b.left.hash();
                    let r = b.right.hash();
                    let h = hash_pair(&l, &r);
                    b.hash = Some(h);
                    b.state = NodeState::Hashed;
                    h
                }
            },
        }
    }

    /// Load the children of an unresolved internal node from the bucket.
    /// `height` is the height of this node (0 for leaves).
    pub(crate) fn resolve(&mut self, height: usize, bucket: &dyn Bucket) -> Result<()> {
        let Node::Unresolved(hash) = *self else {
            return Ok(());
        };
        if height == 0 {
            return Ok(());
        }
        let bytes = bucket.get(&hash)?.ok_or_else(|| {
            RelayError::Format(format!("missing node {} at height {}", hex::encode(hash), height))
        })?;
        if bytes.len() != 64 {
            return Err(RelayError::Format(format!(
                "node {} has {} bytes, expected 64",
                hex::encode(hash),
                bytes.len()
            )));
        }
        let mut left = [0u8; 32];
        let mut right = [0u8; 32];
        left.copy_from_slice(&bytes[..32]);
        right.copy_from_slice(&bytes[32..]);
        *self = Node::Branch(Box::new(Branch {
            left: Node::Unresolved(left),
            right: Node::Unresolved(right),
            hash: Some(hash),
            state: NodeState::Flushed,
        }));
        Ok(())
    }

    /// Write dirty nodes to the bucket, children before parents.
    /// Already flushed subtrees are skipped, so a failed flush can be retried.
    pub(crate) fn flush(&mut self, bucket: &dyn Bucket) -> Result<()> {
        let hash = self.hash();
        match self {
            Node::Unresolved(_) => Ok(()),
            Node::Leaf(leaf) => {
                if leaf.state == NodeState::Flushed {
                    return Ok(());
                }
                if let Some(payload) = &leaf.payload {
                    bucket.set(&hash, payload)?;
                }
                leaf.state = NodeState::Flushed;
                Ok(())
            }
            Node::Branch(b) => {
                if b.state == NodeState::Flushed {
                    return Ok(());
                }
                b.left.flush(bucket)?;
                b.right.flush(bucket)?;
                let l = b.left.hash();
                let r = b.right.hash();
                let mut value = Vec::with_capacity(64);
                value.extend_from_slice(&l);
                value.extend_from_slice(&r);
                bucket.set(&hash, &value)?;
                b.left = Node::Unresolved(l);
                b.right = Node::Unresolved(r);
                b.state = NodeState::Flushed;
                Ok(())
            }
        }
    }

    /// Remove this subtree's entries from the bucket.
    pub(crate) fn purge(&mut self, height: usize, bucket: &dyn Bucket) -> Result<()> {
        let hash = self.hash();
        if height > 0 {
            if let Node::Unresolved(_) = self {
                if !bucket.has(&hash)? {
                    return Ok(());
                }
                self.resolve(height, bucket)?;
            }
            if let Node::Branch(b) = self {
                b.left.purge(height - 1, bucket)?;
                b.right.purge(height - 1, bucket)?;
            }
        }
        if bucket.has(&hash)? {
            bucket.delete(&hash)?;
        }
        Ok(())
    }

    /// Collect the witness for leaf `pos` inside this subtree of `height`,
    /// resolving nodes from the bucket along the way. Leaf-to-root order.
    pub(crate) fn witness(
        &mut self,
        height: usize,
        pos: u64,
        bucket: &dyn Bucket,
    ) -> Result<Vec<Witness>> {
        let mut path = Vec::with_capacity(height);
        let mut pos = pos;
        let mut current: &mut Node = self;
        for level in (1..=height).rev() {
            current.resolve(level, bucket)?;
            let half = 1u64 << (level - 1);
            current = match current {
                Node::Branch(b) => {
                    if pos < half {
                        path.push(Witness::right(b.right.hash()));
                        &mut b.left
                    } else {
                        pos -= half;
                        path.push(Witness::left(b.left.hash()));
                        &mut b.right
                    }
                }
                _ => {
                    return Err(RelayError::Format(format!(
                        "expected internal node at height {}",
                        level
                    )))
                }
            };
        }
        path.reverse();
        Ok(path)
    }
}
