// src/segment.rs
// Splits relay messages into transaction-sized segments

use crate::chain::{BlockProof, BlockUpdate, BtpAddress, ReceiptProof, RelayMessage, Segment, Segmenter};
use crate::error::{RelayError, Result};
use serde::{Deserialize, Serialize};

/// Destination chain family; picks the default transaction size limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainKind {
    #[default]
    Icon,
    Evm,
    Parachain,
}

impl ChainKind {
    pub fn default_tx_size_limit(&self) -> usize {
        match self {
            // max data size scaled down by transaction encoding overhead
            ChainKind::Icon => (524_288f64 / 1.37) as usize,
            ChainKind::Evm => 131_072,
            ChainKind::Parachain => 4_194_304,
        }
    }
}

/// Encoded contents of one relay transaction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelayPayload {
    pub block_updates: Vec<Vec<u8>>,
    pub block_proof: Option<Vec<u8>>,
    pub receipt_proofs: Vec<Vec<u8>>,
}

/// Chain-specific encoding of proofs and transactions.
pub trait PayloadCodec: Send + Sync {
    fn encode_block_update(&self, bu: &BlockUpdate) -> Result<Vec<u8>>;
    fn encode_block_proof(&self, bp: &BlockProof) -> Result<Vec<u8>>;
    fn encode_receipt_proof(&self, rp: &ReceiptProof) -> Result<Vec<u8>>;
    fn encode_transaction(&self, from: &BtpAddress, payload: &RelayPayload) -> Result<Vec<u8>>;
    fn decode_transaction(&self, bytes: &[u8]) -> Result<(BtpAddress, RelayPayload)>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl PayloadCodec for BincodeCodec {
    fn encode_block_update(&self, bu: &BlockUpdate) -> Result<Vec<u8>> {
        Ok(bincode::serialize(bu)?)
    }

    fn encode_block_proof(&self, bp: &BlockProof) -> Result<Vec<u8>> {
        Ok(bincode::serialize(bp)?)
    }

    fn encode_receipt_proof(&self, rp: &ReceiptProof) -> Result<Vec<u8>> {
        Ok(bincode::serialize(rp)?)
    }

    fn encode_transaction(&self, from: &BtpAddress, payload: &RelayPayload) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&(from.as_str(), payload))?)
    }

    fn decode_transaction(&self, bytes: &[u8]) -> Result<(BtpAddress, RelayPayload)> {
        let (from, payload): (String, RelayPayload) = bincode::deserialize(bytes)?;
        let from = from
            .parse()
            .map_err(|e: RelayError| RelayError::Codec(e.to_string()))?;
        Ok((from, payload))
    }
}

/// Proof anchoring the receipts of a message; repeated at the head of every
/// segment split off after the first.
#[derive(Clone)]
enum Anchor {
    BlockUpdate(u64, Vec<u8>),
    BlockProof(u64, Vec<u8>),
}

impl Anchor {
    fn height(&self) -> u64 {
        match self {
            Anchor::BlockUpdate(h, _) | Anchor::BlockProof(h, _) => *h,
        }
    }
}

#[derive(Default)]
struct Draft {
    payload: RelayPayload,
    size: usize,
    segment: Segment,
    has_content: bool,
}

impl Draft {
    fn anchored(anchor: &Anchor) -> Self {
        let mut draft = Draft::default();
        draft.size = match anchor {
            Anchor::BlockUpdate(_, bytes) => {
                draft.payload.block_updates.push(bytes.clone());
                bytes.len()
            }
            Anchor::BlockProof(_, bytes) => {
                draft.payload.block_proof = Some(bytes.clone());
                bytes.len()
            }
        };
        draft.segment.height = anchor.height();
        draft
    }

    fn push_block_update(&mut self, height: u64, bytes: Vec<u8>) {
        self.size += bytes.len();
        self.payload.block_updates.push(bytes);
        self.segment.height = height;
        self.segment.number_of_block_update += 1;
        self.has_content = true;
    }

    fn push_receipt(&mut self, bytes: Vec<u8>, events: usize, last_sequence: Option<u64>) {
        self.size += bytes.len();
        self.payload.receipt_proofs.push(bytes);
        self.segment.number_of_event += events;
        if let Some(seq) = last_sequence {
            self.segment.event_sequence = seq;
        }
        self.has_content = true;
    }
}

/// Generic segmenter bounded by an encoded-size limit per transaction.
pub struct SizeLimitSegmenter<C: PayloadCodec> {
    limit: usize,
    codec: C,
}

impl<C: PayloadCodec> SizeLimitSegmenter<C> {
    pub fn new(limit: usize, codec: C) -> Self {
        Self { limit, codec }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    fn check_unit(&self, kind: &'static str, size: usize) -> Result<()> {
        if size > self.limit {
            return Err(RelayError::ProofTooLarge {
                kind,
                size,
                limit: self.limit,
            });
        }
        Ok(())
    }

    fn close(&self, from: &BtpAddress, draft: Draft) -> Result<Segment> {
        let mut segment = draft.segment;
        segment.transaction_param = self.codec.encode_transaction(from, &draft.payload)?;
        Ok(segment)
    }

    fn fits(&self, draft: &Draft, size: usize) -> bool {
        draft.size + size <= self.limit
    }

    /// Add one receipt proof, splitting it by event when it does not fit.
    fn push_receipt_proof(
        &self,
        from: &BtpAddress,
        rp: &ReceiptProof,
        anchor: &Anchor,
        draft: &mut Draft,
        out: &mut Vec<Segment>,
    ) -> Result<()> {
        let whole = self.codec.encode_receipt_proof(rp)?;
        if self.fits(draft, whole.len()) {
            let last = rp.events.last().map(|e| e.sequence);
            draft.push_receipt(whole, rp.events.len(), last);
            return Ok(());
        }
        if rp.events.is_empty() {
            let anchored = Draft::anchored(anchor);
            self.check_unit("receipt proof", whole.len() + anchored.size)?;
            if draft.has_content {
                out.push(self.close(from, std::mem::replace(draft, anchored))?);
            }
            draft.push_receipt(whole, 0, None);
            return Ok(());
        }

        let mut start = 0;
        while start < rp.events.len() {
            let mut end = start;
            let mut best = None;
            while end < rp.events.len() {
                let bytes = self.codec.encode_receipt_proof(&partial(rp, start, end + 1))?;
                if !self.fits(draft, bytes.len()) {
                    if best.is_none() && !draft.has_content {
                        return Err(RelayError::ProofTooLarge {
                            kind: "event proof",
                            size: bytes.len() + draft.size,
                            limit: self.limit,
                        });
                    }
                    break;
                }
                best = Some(bytes);
                end += 1;
            }
            match best {
                Some(bytes) => {
                    draft.push_receipt(bytes, end - start, Some(rp.events[end - 1].sequence));
                    start = end;
                    if start < rp.events.len() {
                        out.push(self.close(from, std::mem::replace(draft, Draft::anchored(anchor)))?);
                    }
                }
                None => {
                    out.push(self.close(from, std::mem::replace(draft, Draft::anchored(anchor)))?);
                }
            }
        }
        Ok(())
    }
}

/// Receipt proof restricted to events `[start, end)`.
fn partial(rp: &ReceiptProof, start: usize, end: usize) -> ReceiptProof {
    ReceiptProof {
        index: rp.index,
        height: rp.height,
        proof: rp.proof.clone(),
        events: rp.events[start..end].to_vec(),
        event_proofs: rp.event_proofs.get(start..end).map(<[_]>::to_vec).unwrap_or_default(),
    }
}

impl<C: PayloadCodec> Segmenter for SizeLimitSegmenter<C> {
    fn segment(&self, rm: &RelayMessage, since_height: u64) -> Result<Vec<Segment>> {
        let mut out = Vec::new();
        let mut draft = Draft::default();
        let mut last_update = None;

        for bu in rm.block_updates.iter().filter(|bu| bu.height > since_height) {
            let bytes = self.codec.encode_block_update(bu)?;
            self.check_unit("block update", bytes.len())?;
            if !self.fits(&draft, bytes.len()) {
                out.push(self.close(&rm.from, std::mem::take(&mut draft))?);
            }
            last_update = Some(Anchor::BlockUpdate(bu.height, bytes.clone()));
            draft.push_block_update(bu.height, bytes);
        }

        if rm.receipt_proofs.is_empty() {
            if draft.has_content {
                out.push(self.close(&rm.from, draft)?);
            }
            return Ok(out);
        }

        let anchor = match last_update {
            Some(anchor) => anchor,
            None => {
                let bp = rm.block_proof.as_ref().ok_or_else(|| {
                    RelayError::NotFound(format!(
                        "no block update or block proof anchors receipts of message {}",
                        rm.seq
                    ))
                })?;
                let bytes = self.codec.encode_block_proof(bp)?;
                self.check_unit("block proof", bytes.len())?;
                let anchor = Anchor::BlockProof(bp.height, bytes);
                draft = Draft::anchored(&anchor);
                anchor
            }
        };

        for rp in &rm.receipt_proofs {
            self.push_receipt_proof(&rm.from, rp, &anchor, &mut draft, &mut out)?;
        }
        if draft.has_content {
            out.push(self.close(&rm.from, draft)?);
        }
        Ok(out)
    }

    fn update_segment(&self, bp: &BlockProof, segment: &mut Segment) -> Result<()> {
        let (from, mut payload) = self.codec.decode_transaction(&segment.transaction_param)?;
        payload.block_proof = Some(self.codec.encode_block_proof(bp)?);
        segment.transaction_param = self.codec.encode_transaction(&from, &payload)?;
        Ok(())
    }
}
