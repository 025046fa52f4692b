// BTP relay engine: Merkle tree accumulator, relay message buffering and
// segmentation, rotation-aware scheduling and result reconciliation.

pub mod buffer;
pub mod chain;
pub mod config;
pub mod error;
pub mod mta;
pub mod reconciler;
pub mod relay;
pub mod rotation;
pub mod segment;
pub mod storage;

pub use buffer::RelayMessageBuffer;
pub use config::{ConfigValidation, RelayConfig};
pub use error::{RelayError, Result};
pub use mta::{Accumulator, ExtAccumulator};
pub use relay::Relay;
pub use segment::{BincodeCodec, ChainKind, SizeLimitSegmenter};
