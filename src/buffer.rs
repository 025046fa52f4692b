// src/buffer.rs
// Ordered queue of relay messages shared by ingestion and the scheduler

use crate::chain::{BlockProof, BlockUpdate, BtpAddress, ReceiptProof, RelayMessage};
use crate::error::{RelayError, Result};
use std::collections::VecDeque;

/// Relay messages in ingestion order. The last message is the open tail;
/// it stops taking block updates once it has been segmented.
pub struct RelayMessageBuffer {
    messages: VecDeque<RelayMessage>,
    from: BtpAddress,
    next_seq: u64,
    last_height: Option<u64>,
}

impl RelayMessageBuffer {
    /// `last_height` is the last block already accounted for; ingestion must
    /// continue at `last_height + 1`.
    pub fn new(from: BtpAddress, last_height: Option<u64>) -> Self {
        let mut buffer = Self {
            messages: VecDeque::new(),
            from,
            next_seq: 1,
            last_height,
        };
        buffer.open_tail();
        buffer
    }

    fn open_tail(&mut self) {
        let rm = RelayMessage::new(self.next_seq, self.from.clone());
        self.next_seq += 1;
        self.messages.push_back(rm);
    }

    fn tail(&mut self) -> &mut RelayMessage {
        if self.messages.is_empty() {
            self.open_tail();
        }
        let last = self.messages.len() - 1;
        &mut self.messages[last]
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.iter().all(RelayMessage::is_empty)
    }

    pub fn last_height(&self) -> Option<u64> {
        self.last_height
    }

    pub fn iter(&self) -> impl Iterator<Item = &RelayMessage> {
        self.messages.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut RelayMessage> {
        self.messages.iter_mut()
    }

    pub fn get_mut(&mut self, seq: u64) -> Option<&mut RelayMessage> {
        self.messages.iter_mut().find(|rm| rm.seq == seq)
    }

    /// Ingest the next finalized block. Returns `false` for replays of
    /// already ingested heights.
    pub fn append(
        &mut self,
        bu: BlockUpdate,
        receipt_proofs: Vec<ReceiptProof>,
        verifier_height: u64,
        dst_height: u64,
    ) -> Result<bool> {
        if let Some(last) = self.last_height {
            if bu.height <= last {
                log::debug!("skip replayed block {} (last {})", bu.height, last);
                return Ok(false);
            }
            if bu.height != last + 1 {
                return Err(RelayError::GapDetected {
                    expected: last + 1,
                    got: bu.height,
                });
            }
        }
        self.last_height = Some(bu.height);

        if self.tail().is_segmented() {
            self.open_tail();
        }
        let height = bu.height;
        let tail = self.tail();
        if receipt_proofs.is_empty() {
            if height <= verifier_height {
                // already verified, nothing to prove up to here
                tail.block_updates.clear();
            } else {
                tail.block_updates.push(bu);
            }
            return Ok(true);
        }

        tail.block_updates.push(bu);
        tail.receipt_proofs = receipt_proofs;
        tail.dst_height = dst_height;
        log::debug!(
            "sealed relay message {} at height {} ({} receipt proofs)",
            tail.seq,
            height,
            tail.receipt_proofs.len()
        );
        self.open_tail();
        Ok(true)
    }

    /// Drop content the destination has confirmed: events up to `rx_seq`
    /// and block updates up to `verifier_height`. A message whose block
    /// updates are all confirmed keeps its receipts behind a block proof
    /// built by `prove` from the last confirmed update. Segments of a
    /// changed message are dropped, or flagged for later if any is in flight.
    pub fn trim(
        &mut self,
        verifier_height: u64,
        rx_seq: u64,
        prove: &mut dyn FnMut(&BlockUpdate) -> Result<BlockProof>,
    ) -> Result<()> {
        let mut kept = VecDeque::with_capacity(self.messages.len());
        while let Some(mut rm) = self.messages.pop_front() {
            let mut changed = trim_events(&mut rm, rx_seq);

            let consumed = rm
                .block_updates
                .iter()
                .take_while(|bu| bu.height <= verifier_height)
                .count();
            if consumed > 0 {
                changed = true;
                if consumed == rm.block_updates.len() && !rm.receipt_proofs.is_empty() {
                    let bp = match prove(&rm.block_updates[consumed - 1]) {
                        Ok(bp) => bp,
                        Err(e) => {
                            self.messages.push_front(rm);
                            while let Some(done) = kept.pop_back() {
                                self.messages.push_front(done);
                            }
                            return Err(e);
                        }
                    };
                    rm.block_proof = Some(bp);
                }
                rm.block_updates.drain(..consumed);
            }

            // a message with results in flight stays until they are reconciled
            let waiting = rm.has_wait();
            if rm.is_empty() && !waiting && (changed || !self.messages.is_empty()) {
                log::debug!("evict relay message {}", rm.seq);
                continue;
            }
            if changed {
                rm.invalidate_segments();
            }
            kept.push_back(rm);
        }
        self.messages = kept;
        if self.messages.is_empty() {
            self.open_tail();
        }
        Ok(())
    }
}

fn trim_events(rm: &mut RelayMessage, rx_seq: u64) -> bool {
    let mut changed = false;
    for rp in rm.receipt_proofs.iter_mut() {
        let keep: Vec<bool> = rp.events.iter().map(|e| e.sequence > rx_seq).collect();
        if keep.iter().all(|k| *k) {
            continue;
        }
        changed = true;
        let mut flags = keep.iter();
        rp.events.retain(|_| *flags.next().unwrap_or(&false));
        let mut flags = keep.iter();
        rp.event_proofs.retain(|_| *flags.next().unwrap_or(&false));
    }
    if changed {
        rm.receipt_proofs.retain(|rp| !rp.events.is_empty());
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{BlockWitness, Event, EventProof, Segment, TxHandle};

    fn from() -> BtpAddress {
        "btp://0x1.icon/cx0001".parse().unwrap()
    }

    fn bu(height: u64) -> BlockUpdate {
        BlockUpdate {
            height,
            block_hash: [height as u8; 32],
            header: height.to_be_bytes().to_vec(),
            proof: vec![],
        }
    }

    fn rp(height: u64, seqs: &[u64]) -> ReceiptProof {
        ReceiptProof {
            index: 0,
            height,
            proof: vec![],
            events: seqs
                .iter()
                .map(|s| Event {
                    next: "btp://0x38.bsc/0xb".parse().unwrap(),
                    sequence: *s,
                    message: vec![*s as u8],
                })
                .collect(),
            event_proofs: seqs
                .iter()
                .map(|s| EventProof {
                    index: *s as u32,
                    proof: vec![],
                })
                .collect(),
        }
    }

    fn prover(at: u64) -> impl FnMut(&BlockUpdate) -> Result<BlockProof> {
        move |bu: &BlockUpdate| {
            Ok(BlockProof {
                height: bu.height,
                header: bu.header.clone(),
                block_witness: BlockWitness {
                    height: at,
                    witness: vec![],
                },
            })
        }
    }

    fn heights(buffer: &RelayMessageBuffer) -> Vec<u64> {
        buffer
            .iter()
            .flat_map(|rm| rm.block_updates.iter().map(|bu| bu.height))
            .collect()
    }

    #[test]
    fn trims_consumed_events() {
        let mut buffer = RelayMessageBuffer::new(from(), None);
        buffer.append(bu(1), vec![rp(1, &[5, 6, 7])], 0, 0).unwrap();
        buffer.trim(0, 6, &mut prover(0)).unwrap();

        let rm = buffer.iter().next().unwrap();
        assert_eq!(rm.receipt_proofs.len(), 1);
        let rp = &rm.receipt_proofs[0];
        assert_eq!(rp.events.len(), 1);
        assert_eq!(rp.events[0].sequence, 7);
        assert_eq!(rp.event_proofs.len(), 1);
        assert_eq!(rp.event_proofs[0].index, 7);
    }

    #[test]
    fn fully_consumed_receipts_drop_proof() {
        let mut buffer = RelayMessageBuffer::new(from(), None);
        buffer.append(bu(1), vec![rp(1, &[1]), rp(1, &[2, 3])], 0, 0).unwrap();
        buffer.trim(0, 2, &mut prover(0)).unwrap();
        let rm = buffer.iter().next().unwrap();
        assert_eq!(rm.receipt_proofs.len(), 1);
        assert_eq!(rm.receipt_proofs[0].events[0].sequence, 3);
    }

    #[test]
    fn gaps_are_fatal_and_replays_ignored() {
        let mut buffer = RelayMessageBuffer::new(from(), Some(10));
        assert!(!buffer.append(bu(10), vec![], 0, 0).unwrap());
        assert!(buffer.append(bu(11), vec![], 0, 0).unwrap());
        let err = buffer.append(bu(13), vec![], 0, 0).unwrap_err();
        assert!(matches!(err, RelayError::GapDetected { expected: 12, got: 13 }));
        assert!(err.is_fatal());
        assert_eq!(buffer.last_height(), Some(11));
    }

    #[test]
    fn receipts_seal_the_tail() {
        let mut buffer = RelayMessageBuffer::new(from(), None);
        buffer.append(bu(1), vec![], 0, 0).unwrap();
        buffer.append(bu(2), vec![rp(2, &[1])], 0, 42).unwrap();
        buffer.append(bu(3), vec![], 0, 0).unwrap();

        let msgs: Vec<&RelayMessage> = buffer.iter().collect();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].block_updates.len(), 2);
        assert_eq!(msgs[0].dst_height, 42);
        assert_eq!(msgs[1].block_updates.len(), 1);
        assert!(msgs[0].seq < msgs[1].seq);
    }

    #[test]
    fn segmented_tail_is_closed_for_ingestion() {
        let mut buffer = RelayMessageBuffer::new(from(), None);
        buffer.append(bu(1), vec![], 0, 0).unwrap();
        buffer.iter_mut().next().unwrap().set_segments(vec![Segment::default()]);
        buffer.append(bu(2), vec![], 0, 0).unwrap();
        assert_eq!(buffer.len(), 2);
        assert_eq!(heights(&buffer), vec![1, 2]);
    }

    #[test]
    fn verified_blocks_without_receipts_are_not_buffered() {
        let mut buffer = RelayMessageBuffer::new(from(), None);
        for h in 1..=5 {
            buffer.append(bu(h), vec![], 3, 0).unwrap();
        }
        assert_eq!(heights(&buffer), vec![4, 5]);
    }

    #[test]
    fn trim_keeps_order_without_gaps() {
        let mut buffer = RelayMessageBuffer::new(from(), None);
        for h in 1..=10 {
            let rps = match h {
                3 => vec![rp(3, &[1])],
                7 => vec![rp(7, &[2])],
                _ => vec![],
            };
            buffer.append(bu(h), rps, 0, 0).unwrap();
        }
        buffer.trim(5, 0, &mut prover(5)).unwrap();

        let seqs: Vec<u64> = buffer.iter().map(|rm| rm.seq).collect();
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(heights(&buffer), vec![6, 7, 8, 9, 10]);

        let first = buffer.iter().next().unwrap();
        assert!(first.block_updates.is_empty());
        let bp = first.block_proof.as_ref().unwrap();
        assert_eq!(bp.height, 3);
        assert_eq!(bp.block_witness.height, 5);
        assert_eq!(first.receipt_proofs.len(), 1);
    }

    #[test]
    fn trim_resets_segments_of_changed_messages() {
        let mut buffer = RelayMessageBuffer::new(from(), None);
        buffer.append(bu(1), vec![], 0, 0).unwrap();
        buffer.append(bu(2), vec![rp(2, &[1, 2])], 0, 0).unwrap();
        let rm = buffer.iter_mut().next().unwrap();
        rm.set_segments(vec![Segment::default()]);
        let epoch = rm.segment_epoch;

        buffer.trim(1, 0, &mut prover(1)).unwrap();
        let rm = buffer.iter().next().unwrap();
        assert!(!rm.is_segmented());
        assert_eq!(rm.segment_epoch, epoch + 1);
        assert_eq!(heights(&buffer), vec![2]);
    }

    fn submit_first_segment(rm: &mut RelayMessage) {
        rm.set_segments(vec![Segment::default()]);
        if let Some(Some(segment)) = rm.segments.get_mut(0) {
            segment.get_result_param = Some(TxHandle("0xaa".into()));
        }
    }

    #[test]
    fn trim_keeps_segments_in_flight() {
        let mut buffer = RelayMessageBuffer::new(from(), None);
        for h in 1..=2 {
            buffer.append(bu(h), vec![], 0, 0).unwrap();
        }
        buffer.append(bu(3), vec![rp(3, &[1])], 0, 0).unwrap();
        let rm = buffer.iter_mut().next().unwrap();
        submit_first_segment(rm);
        let epoch = rm.segment_epoch;

        buffer.trim(2, 0, &mut prover(2)).unwrap();
        let rm = buffer.iter().next().unwrap();
        assert_eq!(heights(&buffer), vec![3]);
        assert!(rm.has_wait());
        assert!(rm.resegment);
        assert_eq!(rm.segment_epoch, epoch);
    }

    #[test]
    fn confirmed_message_in_flight_is_not_evicted() {
        let mut buffer = RelayMessageBuffer::new(from(), None);
        buffer.append(bu(1), vec![rp(1, &[1])], 0, 0).unwrap();
        let seq = {
            let rm = buffer.iter_mut().next().unwrap();
            submit_first_segment(rm);
            rm.seq
        };

        buffer.trim(1, 1, &mut prover(1)).unwrap();
        let rm = buffer.iter().next().unwrap();
        assert_eq!(rm.seq, seq);
        assert!(rm.is_empty());
        assert!(rm.has_wait());

        buffer.get_mut(seq).unwrap().segments[0] = None;
        buffer.trim(1, 1, &mut prover(1)).unwrap();
        assert!(buffer.iter().all(|rm| rm.seq != seq));
    }

    #[test]
    fn confirmed_messages_are_evicted() {
        let mut buffer = RelayMessageBuffer::new(from(), None);
        buffer.append(bu(1), vec![rp(1, &[1])], 0, 0).unwrap();
        buffer.append(bu(2), vec![], 0, 0).unwrap();
        buffer.trim(2, 1, &mut prover(2)).unwrap();
        assert_eq!(buffer.len(), 1);
        assert!(buffer.is_empty());
        let tail = buffer.iter().next().unwrap();
        assert!(tail.seq > 2);

        // ingestion continues on the fresh tail
        buffer.append(bu(3), vec![], 2, 0).unwrap();
        assert_eq!(heights(&buffer), vec![3]);
    }
}
