// src/error.rs
// Error taxonomy for the relay engine

use crate::chain::RevertCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RelayError>;

#[derive(Error, Debug)]
pub enum RelayError {
    /// Index or height outside the accumulator bounds.
    #[error("not found: {0}")]
    NotFound(String),

    /// Persisted state is corrupted or inconsistent.
    #[error("invalid format: {0}")]
    Format(String),

    #[error("invalid witness: {0}")]
    InvalidWitness(String),

    #[error("unsupported offset: local {local}, requested {requested}")]
    UnsupportedOffset { local: u64, requested: u64 },

    #[error("proof too large: {kind} is {size} bytes (limit {limit})")]
    ProofTooLarge {
        kind: &'static str,
        size: usize,
        limit: usize,
    },

    #[error("gap detected: expected height {expected}, got {got}")]
    GapDetected { expected: u64, got: u64 },

    #[error("unrecognized revert: {0}")]
    UnrecognizedRevert(RevertCode),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("codec error: {0}")]
    Codec(String),

    /// Network or adapter failure reported by a chain collaborator.
    #[error("chain error: {0}")]
    Chain(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl RelayError {
    /// Fatal errors mean the engine must stop instead of retrying on the next tick.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RelayError::Storage(_)
                | RelayError::Format(_)
                | RelayError::Codec(_)
                | RelayError::GapDetected { .. }
                | RelayError::UnrecognizedRevert(_)
        )
    }
}

impl From<rocksdb::Error> for RelayError {
    fn from(e: rocksdb::Error) -> Self {
        RelayError::Storage(e.to_string())
    }
}

impl From<std::io::Error> for RelayError {
    fn from(e: std::io::Error) -> Self {
        RelayError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        RelayError::Codec(e.to_string())
    }
}

impl From<bincode::Error> for RelayError {
    fn from(e: bincode::Error) -> Self {
        RelayError::Codec(e.to_string())
    }
}
