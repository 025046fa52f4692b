//! Merkle tree accumulator.
//!
//! An append-only forest of perfect binary subtrees (one per set bit of the
//! item count) that can produce inclusion witnesses for any retained item
//! without keeping the full history in memory. Nodes are flushed to a
//! [`Bucket`](crate::storage::Bucket) keyed by hash and resolved lazily.

pub mod accumulator;
pub mod ext;
pub mod node;

pub use accumulator::{Accumulator, StoredState};
pub use ext::ExtAccumulator;
pub use node::{compute_root, hash_data, hash_pair, witness_hashes, Direction, Hash, Witness};
