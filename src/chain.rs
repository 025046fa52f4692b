// src/chain.rs
// Relay data model and the chain collaborator interfaces

use crate::error::{RelayError, Result};
use crate::mta::Hash;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// BTP address of the form `btp://<network>/<account>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BtpAddress(String);

impl BtpAddress {
    const PREFIX: &'static str = "btp://";

    pub fn network(&self) -> &str {
        self.rest().split_once('/').map(|(n, _)| n).unwrap_or_default()
    }

    pub fn account(&self) -> &str {
        self.rest().split_once('/').map(|(_, a)| a).unwrap_or_default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn rest(&self) -> &str {
        &self.0[Self::PREFIX.len()..]
    }
}

impl FromStr for BtpAddress {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        let rest = s
            .strip_prefix(Self::PREFIX)
            .ok_or_else(|| RelayError::Config(format!("'{}' is not a btp:// address", s)))?;
        match rest.split_once('/') {
            Some((network, account))
                if !network.is_empty() && !account.is_empty() && !account.contains('/') =>
            {
                Ok(Self(s.to_string()))
            }
            _ => Err(RelayError::Config(format!(
                "'{}' must be btp://<network>/<account>",
                s
            ))),
        }
    }
}

impl TryFrom<String> for BtpAddress {
    type Error = RelayError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<BtpAddress> for String {
    fn from(a: BtpAddress) -> Self {
        a.0
    }
}

impl fmt::Display for BtpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A finalized source block with the proof the destination verifier needs
/// to advance past it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockUpdate {
    pub height: u64,
    pub block_hash: Hash,
    pub header: Vec<u8>,
    pub proof: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub next: BtpAddress,
    pub sequence: u64,
    pub message: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventProof {
    pub index: u32,
    pub proof: Vec<u8>,
}

/// Receipt inclusion proof plus the BTP events it carries, one proof per event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptProof {
    pub index: u32,
    pub height: u64,
    pub proof: Vec<u8>,
    pub events: Vec<Event>,
    pub event_proofs: Vec<EventProof>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockWitness {
    /// Accumulator height the witness was produced against.
    pub height: u64,
    pub witness: Vec<Hash>,
}

/// Proof that an already-verified block is part of the verifier's accumulator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockProof {
    pub height: u64,
    pub header: Vec<u8>,
    pub block_witness: BlockWitness,
}

/// Opaque submission handle returned by [`Sender::relay`] (usually a tx hash).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxHandle(pub String);

/// Opaque outcome of a successful submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutcome(pub Vec<u8>);

/// One transaction-sized chunk of a relay message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Segment {
    pub height: u64,
    pub number_of_block_update: usize,
    pub event_sequence: u64,
    pub number_of_event: usize,
    pub transaction_param: Vec<u8>,
    /// `None` means the segment needs (re)submission.
    pub get_result_param: Option<TxHandle>,
    pub transaction_result: Option<TxOutcome>,
}

impl Segment {
    pub fn is_waiting(&self) -> bool {
        self.get_result_param.is_some() && self.transaction_result.is_none()
    }
}

/// A window of block updates and/or receipt proofs, submitted as one or more segments.
#[derive(Debug, Clone)]
pub struct RelayMessage {
    pub seq: u64,
    pub from: BtpAddress,
    pub block_updates: Vec<BlockUpdate>,
    pub receipt_proofs: Vec<ReceiptProof>,
    pub block_proof: Option<BlockProof>,
    /// `None` entries are already satisfied on-chain.
    pub segments: Vec<Option<Segment>>,
    /// Bumped whenever `segments` is replaced, so stale results can be told apart.
    pub segment_epoch: u64,
    /// Estimated destination height when the message becomes sendable.
    pub dst_height: u64,
    /// Content changed while results were outstanding; segment again once
    /// they are reconciled.
    pub resegment: bool,
}

impl RelayMessage {
    pub fn new(seq: u64, from: BtpAddress) -> Self {
        Self {
            seq,
            from,
            block_updates: Vec::new(),
            receipt_proofs: Vec::new(),
            block_proof: None,
            segments: Vec::new(),
            segment_epoch: 0,
            dst_height: 0,
            resegment: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.block_updates.is_empty() && self.receipt_proofs.is_empty()
    }

    pub fn is_segmented(&self) -> bool {
        !self.segments.is_empty()
    }

    /// True while any submitted segment still awaits its result.
    pub fn has_wait(&self) -> bool {
        self.segments.iter().flatten().any(Segment::is_waiting)
    }

    pub fn set_segments(&mut self, segments: Vec<Segment>) {
        self.segments = segments.into_iter().map(Some).collect();
        self.segment_epoch += 1;
    }

    /// Discard segments so the message is segmented again on the next tick.
    pub fn reset_segments(&mut self) {
        self.resegment = false;
        if !self.segments.is_empty() {
            self.segments.clear();
            self.segment_epoch += 1;
        }
    }

    /// Like `reset_segments`, but a message with submissions in flight keeps
    /// its segments until their results are in.
    pub fn invalidate_segments(&mut self) {
        if self.has_wait() {
            self.resegment = true;
        } else {
            self.reset_segments();
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerifierStatus {
    pub height: u64,
    pub offset: u64,
    pub last_height: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BmrInfo {
    pub address: String,
    pub block_count: u64,
    pub msg_count: u64,
}

/// Link status snapshot read from the destination BMC.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BmcLinkStatus {
    pub tx_seq: u64,
    pub rx_seq: u64,
    pub verifier: VerifierStatus,
    pub bmrs: Vec<BmrInfo>,
    pub bmr_index: usize,
    pub rotate_height: u64,
    pub rotate_term: i64,
    pub delay_limit: i64,
    pub max_aggregation: i64,
    pub current_height: u64,
}

impl BmcLinkStatus {
    pub fn bmr_index_of(&self, address: &str) -> Option<usize> {
        self.bmrs.iter().position(|b| b.address == address)
    }
}

/// Numeric revert codes raised by the destination BMC/BMV.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RevertCode {
    Unauthorized,
    InvalidMpt,
    InvalidVotes,
    InvalidSequence,
    InvalidBlockUpdate,
    InvalidBlockProof,
    InvalidBlockWitness,
    InvalidSequenceHigher,
    InvalidBlockUpdateHigher,
    InvalidBlockUpdateLower,
    InvalidBlockProofHigher,
    InvalidBlockWitnessOld,
    Other(u32),
}

impl RevertCode {
    pub fn from_code(code: u32) -> Self {
        match code {
            11 => RevertCode::Unauthorized,
            26 => RevertCode::InvalidMpt,
            27 => RevertCode::InvalidVotes,
            28 => RevertCode::InvalidSequence,
            29 => RevertCode::InvalidBlockUpdate,
            30 => RevertCode::InvalidBlockProof,
            31 => RevertCode::InvalidBlockWitness,
            32 => RevertCode::InvalidSequenceHigher,
            33 => RevertCode::InvalidBlockUpdateHigher,
            34 => RevertCode::InvalidBlockUpdateLower,
            35 => RevertCode::InvalidBlockProofHigher,
            36 => RevertCode::InvalidBlockWitnessOld,
            other => RevertCode::Other(other),
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            RevertCode::Unauthorized => 11,
            RevertCode::InvalidMpt => 26,
            RevertCode::InvalidVotes => 27,
            RevertCode::InvalidSequence => 28,
            RevertCode::InvalidBlockUpdate => 29,
            RevertCode::InvalidBlockProof => 30,
            RevertCode::InvalidBlockWitness => 31,
            RevertCode::InvalidSequenceHigher => 32,
            RevertCode::InvalidBlockUpdateHigher => 33,
            RevertCode::InvalidBlockUpdateLower => 34,
            RevertCode::InvalidBlockProofHigher => 35,
            RevertCode::InvalidBlockWitnessOld => 36,
            RevertCode::Other(code) => *code,
        }
    }
}

impl fmt::Display for RevertCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.code())
    }
}

/// Failure modes of [`Sender::get_result`].
#[derive(Debug, Clone, PartialEq)]
pub enum ResultError {
    /// Not yet included; poll again.
    Pending,
    /// Network or RPC failure; poll again.
    Transient(String),
    /// Included and reverted on-chain.
    Revert(RevertCode),
}

/// Splits a relay message into transaction-sized segments for one destination chain.
pub trait Segmenter: Send + Sync {
    /// Segment the content of `rm` above `since_height`.
    fn segment(&self, rm: &RelayMessage, since_height: u64) -> Result<Vec<Segment>>;

    /// Replace the block proof carried by an already encoded segment.
    fn update_segment(&self, bp: &BlockProof, segment: &mut Segment) -> Result<()>;
}

/// Destination chain adapter.
#[async_trait]
pub trait Sender: Segmenter {
    async fn get_status(&self) -> Result<BmcLinkStatus>;

    async fn relay(&self, segment: &Segment) -> Result<TxHandle>;

    async fn get_result(&self, handle: &TxHandle) -> std::result::Result<TxOutcome, ResultError>;

    /// Destination blocks between submission and finality.
    fn finalize_latency(&self) -> u64;

    /// Follow destination blocks from `height`; runs until error.
    async fn monitor_loop(
        &self,
        height: u64,
        on_height: &mut (dyn FnMut(u64) + Send),
        on_connect: &mut (dyn FnMut() + Send),
    ) -> Result<()>;
}

/// Source chain adapter.
#[async_trait]
pub trait Receiver: Send + Sync {
    /// Deliver finalized blocks from `height` (and events from `seq`) in order;
    /// runs until error. An error returned by `on_block` ends the loop with that error.
    async fn receive_loop(
        &self,
        height: u64,
        seq: u64,
        on_block: &mut (dyn FnMut(BlockUpdate, Vec<ReceiptProof>) -> Result<()> + Send),
        on_connect: &mut (dyn FnMut() + Send),
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn btp_address_parts() {
        let a: BtpAddress = "btp://0x1.icon/cx0123".parse().unwrap();
        assert_eq!(a.network(), "0x1.icon");
        assert_eq!(a.account(), "cx0123");
        assert!("http://0x1.icon/cx0123".parse::<BtpAddress>().is_err());
        assert!("btp://0x1.icon".parse::<BtpAddress>().is_err());
        assert!("btp:///cx0123".parse::<BtpAddress>().is_err());
    }

    #[test]
    fn btp_address_serde_validates() {
        let ok: BtpAddress = serde_json::from_str("\"btp://0x38.bsc/0xabc\"").unwrap();
        assert_eq!(ok.account(), "0xabc");
        assert!(serde_json::from_str::<BtpAddress>("\"0xabc\"").is_err());
    }

    #[test]
    fn revert_codes_roundtrip() {
        for code in [11u32, 26, 28, 31, 34, 36, 99] {
            assert_eq!(RevertCode::from_code(code).code(), code);
        }
        assert_eq!(RevertCode::from_code(36), RevertCode::InvalidBlockWitnessOld);
        assert_eq!(RevertCode::from_code(12), RevertCode::Other(12));
    }

    #[test]
    fn wait_tracks_outstanding_results() {
        let from: BtpAddress = "btp://0x1.icon/cx01".parse().unwrap();
        let mut rm = RelayMessage::new(1, from);
        rm.set_segments(vec![Segment::default(), Segment::default()]);
        assert!(!rm.has_wait());
        if let Some(Some(s)) = rm.segments.get_mut(0) {
            s.get_result_param = Some(TxHandle("0x01".into()));
        }
        assert!(rm.has_wait());
        if let Some(Some(s)) = rm.segments.get_mut(0) {
            s.transaction_result = Some(TxOutcome(vec![1]));
        }
        assert!(!rm.has_wait());
        let epoch = rm.segment_epoch;
        rm.reset_segments();
        assert_eq!(rm.segment_epoch, epoch + 1);
    }

    #[test]
    fn invalidation_waits_for_outstanding_results() {
        let from: BtpAddress = "btp://0x1.icon/cx01".parse().unwrap();
        let mut rm = RelayMessage::new(1, from);
        rm.set_segments(vec![Segment::default()]);
        if let Some(Some(s)) = rm.segments.get_mut(0) {
            s.get_result_param = Some(TxHandle("0x01".into()));
        }
        let epoch = rm.segment_epoch;

        rm.invalidate_segments();
        assert!(rm.resegment);
        assert!(rm.has_wait());
        assert_eq!(rm.segment_epoch, epoch);

        if let Some(Some(s)) = rm.segments.get_mut(0) {
            s.transaction_result = Some(TxOutcome(vec![1]));
        }
        rm.reset_segments();
        assert!(!rm.resegment);
        assert!(!rm.is_segmented());
        assert_eq!(rm.segment_epoch, epoch + 1);
    }
}
