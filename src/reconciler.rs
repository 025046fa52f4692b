// src/reconciler.rs
// Applies submission outcomes back onto buffered relay messages

use crate::buffer::RelayMessageBuffer;
use crate::chain::{
    BlockProof, BlockWitness, RelayMessage, ResultError, RevertCode, Segmenter, Sender, TxHandle,
    TxOutcome, VerifierStatus,
};
use crate::error::{RelayError, Result};
use crate::mta::{witness_hashes, ExtAccumulator};
use std::time::Duration;
use tokio::time::sleep;

/// Position of a submitted segment: message seq, segmentation epoch and
/// index in the message's segment list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentRef {
    pub seq: u64,
    pub epoch: u64,
    pub index: usize,
}

/// What reconciliation did to the segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    /// Accepted on-chain; result recorded.
    Final,
    /// Already satisfied on-chain; segment removed.
    Dropped,
    /// Block proof rebuilt and segment re-encoded; will be resubmitted.
    Rebuilt,
    /// Submission handle cleared; will be resubmitted unchanged.
    Resubmit,
    /// The segment was re-segmented or evicted since submission.
    Stale,
}

/// Bounded polling of a submission handle.
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub retries: u32,
    pub interval: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            retries: 10,
            interval: Duration::from_millis(2000),
        }
    }
}

/// Poll `handle` until it resolves, reverts, or the retries run out.
/// On exhaustion the last `Pending`/`Transient` error is returned.
pub async fn poll_result(
    sender: &dyn Sender,
    handle: &TxHandle,
    policy: PollPolicy,
) -> std::result::Result<TxOutcome, ResultError> {
    let attempts = policy.retries.max(1);
    let mut last = ResultError::Pending;
    for attempt in 1..=attempts {
        match sender.get_result(handle).await {
            Ok(outcome) => return Ok(outcome),
            Err(ResultError::Revert(code)) => return Err(ResultError::Revert(code)),
            Err(e) => {
                log::debug!(
                    "result of {} not ready ({}/{}): {:?}",
                    handle.0,
                    attempt,
                    attempts,
                    e
                );
                last = e;
                if attempt < attempts {
                    sleep(policy.interval).await;
                }
            }
        }
    }
    Err(last)
}

/// Prove the block at `height` against the verifier's accumulator. The
/// witness height is the verifier height, clamped to what is accumulated locally.
pub fn block_proof_at(
    acc: &mut ExtAccumulator,
    height: u64,
    header: &[u8],
    verifier: &VerifierStatus,
) -> Result<BlockProof> {
    let (at, witness) = acc.witness_for_at(height, verifier.height, verifier.offset)?;
    Ok(BlockProof {
        height,
        header: header.to_vec(),
        block_witness: BlockWitness {
            height: at,
            witness: witness_hashes(&witness),
        },
    })
}

/// Rebuild `bp` against the verifier's current accumulator height.
pub fn rebuild_block_proof(
    acc: &mut ExtAccumulator,
    bp: &BlockProof,
    verifier: &VerifierStatus,
) -> Result<BlockProof> {
    block_proof_at(acc, bp.height, &bp.header, verifier)
}

/// Apply the outcome of one submitted segment.
///
/// Unknown revert codes are returned as `UnrecognizedRevert`.
pub fn reconcile<S: Segmenter + ?Sized>(
    buffer: &mut RelayMessageBuffer,
    target: SegmentRef,
    outcome: std::result::Result<TxOutcome, ResultError>,
    acc: &mut ExtAccumulator,
    verifier: &VerifierStatus,
    segmenter: &S,
) -> Result<Reconciled> {
    let Some(rm) = buffer.get_mut(target.seq) else {
        return Ok(Reconciled::Stale);
    };
    if rm.segment_epoch != target.epoch {
        return Ok(Reconciled::Stale);
    }
    let RelayMessage {
        segments,
        block_proof,
        ..
    } = rm;
    let Some(slot) = segments.get_mut(target.index) else {
        return Ok(Reconciled::Stale);
    };
    let Some(segment) = slot.as_mut() else {
        return Ok(Reconciled::Stale);
    };

    let code = match outcome {
        Ok(result) => {
            segment.transaction_result = Some(result);
            return Ok(Reconciled::Final);
        }
        Err(ResultError::Pending) | Err(ResultError::Transient(_)) => {
            segment.get_result_param = None;
            return Ok(Reconciled::Resubmit);
        }
        Err(ResultError::Revert(code)) => code,
    };

    match code {
        RevertCode::InvalidSequence | RevertCode::InvalidBlockUpdateLower => {
            *slot = None;
            Ok(Reconciled::Dropped)
        }
        RevertCode::InvalidBlockWitnessOld => {
            segment.get_result_param = None;
            let Some(bp) = block_proof.as_ref() else {
                return Ok(Reconciled::Resubmit);
            };
            let rebuilt = rebuild_block_proof(acc, bp, verifier)?;
            segmenter.update_segment(&rebuilt, segment)?;
            log::info!(
                "rebuilt block proof of message {} at height {} (witness {} -> {})",
                target.seq,
                rebuilt.height,
                bp.block_witness.height,
                rebuilt.block_witness.height
            );
            *block_proof = Some(rebuilt);
            Ok(Reconciled::Rebuilt)
        }
        RevertCode::InvalidSequenceHigher
        | RevertCode::InvalidBlockUpdateHigher
        | RevertCode::InvalidBlockProofHigher
        | RevertCode::Unauthorized => {
            segment.get_result_param = None;
            Ok(Reconciled::Resubmit)
        }
        other => Err(RelayError::UnrecognizedRevert(other)),
    }
}
