// src/relay.rs
// Relay engine: ingestion, scheduling loop and result polling for one link

use crate::buffer::RelayMessageBuffer;
use crate::chain::{
    BlockUpdate, BmcLinkStatus, ReceiptProof, Receiver, RelayMessage, ResultError, Segment, Sender,
    TxHandle, TxOutcome,
};
use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::mta::ExtAccumulator;
use crate::reconciler::{self, Reconciled, SegmentRef};
use crate::rotation::{self, Decision};
use crate::storage::{self, Bucket, RocksBucket};
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Bucket key of the persisted accumulator state.
pub const ACCUMULATOR_KEY: &[u8] = b"accumulator";

/// Pending relay signals; extra triggers beyond this coalesce.
const SIGNAL_CAPACITY: usize = 2;

/// Floor for the periodic scheduling tick.
const MIN_TICK_MS: u64 = 100;

/// Relay engine for one link.
///
/// Lock order is buffer before accumulator; no lock is held across an await.
pub struct Relay {
    config: RelayConfig,
    sender: Arc<dyn Sender>,
    receiver: Arc<dyn Receiver>,
    acc: Mutex<ExtAccumulator>,
    buffer: Mutex<RelayMessageBuffer>,
    status: RwLock<BmcLinkStatus>,
    /// (source height, destination height) sampled at the last status refresh.
    height_ref: Mutex<(u64, u64)>,
    dst_height: AtomicU64,
    signal_tx: mpsc::Sender<()>,
    signal_rx: Mutex<Option<mpsc::Receiver<()>>>,
    fatal_tx: mpsc::UnboundedSender<RelayError>,
    fatal_rx: Mutex<Option<mpsc::UnboundedReceiver<RelayError>>>,
    workers: Arc<Semaphore>,
}

impl Relay {
    pub fn new(
        config: RelayConfig,
        sender: Arc<dyn Sender>,
        receiver: Arc<dyn Receiver>,
        bucket: Arc<dyn Bucket>,
    ) -> Result<Arc<Self>> {
        let validation = config.validate();
        validation.print_summary();
        validation.into_result()?;

        let acc = ExtAccumulator::new(bucket, ACCUMULATOR_KEY, 0, config.limit_roots);
        let buffer = RelayMessageBuffer::new(config.src.clone(), None);
        let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_CAPACITY);
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        let workers = Arc::new(Semaphore::new(config.result_workers));

        Ok(Arc::new(Self {
            config,
            sender,
            receiver,
            acc: Mutex::new(acc),
            buffer: Mutex::new(buffer),
            status: RwLock::new(BmcLinkStatus::default()),
            height_ref: Mutex::new((0, 0)),
            dst_height: AtomicU64::new(0),
            signal_tx,
            signal_rx: Mutex::new(Some(signal_rx)),
            fatal_tx,
            fatal_rx: Mutex::new(Some(fatal_rx)),
            workers,
        }))
    }

    /// Open the RocksDB at `config.db_path` and build the engine over the
    /// link's bucket.
    pub fn open(
        config: RelayConfig,
        sender: Arc<dyn Sender>,
        receiver: Arc<dyn Receiver>,
    ) -> Result<Arc<Self>> {
        let db = storage::open_db(&config.db_path)?;
        let bucket = Arc::new(RocksBucket::new(db, &config.link_name));
        Self::new(config, sender, receiver, bucket)
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn status(&self) -> BmcLinkStatus {
        self.status.read().clone()
    }

    /// Absolute height and offset of the local accumulator.
    pub fn accumulator_window(&self) -> (u64, u64) {
        let acc = self.acc.lock();
        (acc.height(), acc.offset())
    }

    /// Copy of the buffered relay messages, oldest first.
    pub fn messages(&self) -> Vec<RelayMessage> {
        self.buffer.lock().iter().cloned().collect()
    }

    /// Wake the scheduler. Never blocks; a full channel already has a run pending.
    pub fn signal(&self) {
        let _ = self.signal_tx.try_send(());
    }

    pub async fn refresh_status(&self) -> Result<BmcLinkStatus> {
        let status = self.sender.get_status().await?;
        let src = self
            .buffer
            .lock()
            .last_height()
            .unwrap_or(status.verifier.height);
        *self.height_ref.lock() = (src, status.current_height);
        self.dst_height
            .fetch_max(status.current_height, Ordering::Relaxed);
        *self.status.write() = status.clone();
        Ok(status)
    }

    /// Restore the accumulator, line it up with the verifier and reset the
    /// buffer. Returns the status and the source height to receive from.
    pub async fn recover(&self) -> Result<(BmcLinkStatus, u64)> {
        let status = self.refresh_status().await?;
        let verifier = &status.verifier;
        let start = {
            let mut acc = self.acc.lock();
            acc.recover()?;
            if acc.offset() != verifier.offset || acc.height() < verifier.offset {
                acc.resync(verifier.offset);
                acc.flush()?;
            }
            info!(
                "[{}] accumulator height {} offset {}, verifier height {} offset {}",
                self.config.link_name,
                acc.height(),
                acc.offset(),
                verifier.height,
                verifier.offset
            );
            acc.height().min(verifier.height) + 1
        };
        *self.buffer.lock() = RelayMessageBuffer::new(self.config.src.clone(), Some(start - 1));
        Ok((status, start))
    }

    /// Add a finalized block to the accumulator. Blocks already accumulated are ignored.
    pub fn update_mta(&self, bu: &BlockUpdate) -> Result<()> {
        let mut acc = self.acc.lock();
        let next = acc.height() + 1;
        if bu.height > next {
            return Err(RelayError::GapDetected {
                expected: next,
                got: bu.height,
            });
        }
        if bu.height == next {
            acc.add_hash(bu.block_hash);
            acc.flush()?;
        }
        Ok(())
    }

    /// Source-side ingestion: accumulator first, then the buffer.
    pub fn on_block(&self, bu: BlockUpdate, receipt_proofs: Vec<ReceiptProof>) -> Result<()> {
        self.update_mta(&bu)?;
        let (src_ref, dst_ref) = *self.height_ref.lock();
        let dst_estimate = rotation::estimate_dst_height(
            dst_ref,
            src_ref,
            bu.height,
            self.config.src_block_interval_ms,
            self.config.dst_block_interval_ms,
        );
        let verifier_height = self.status.read().verifier.height;
        let height = bu.height;
        let appended = self
            .buffer
            .lock()
            .append(bu, receipt_proofs, verifier_height, dst_estimate)?;
        if appended {
            debug!("[{}] ingested block {}", self.config.link_name, height);
            self.signal();
        }
        Ok(())
    }

    fn on_dst_height(&self, height: u64) {
        if self.dst_height.fetch_max(height, Ordering::Relaxed) < height {
            self.signal();
        }
    }

    /// One scheduling pass. Only fatal errors are returned.
    pub async fn tick(self: &Arc<Self>) -> Result<()> {
        let status = self.refresh_status().await.map_err(|e| {
            error!("[{}] status refresh failed: {}", self.config.link_name, e);
            e
        })?;
        let my_index = status.bmr_index_of(&self.config.relayer_address);
        let latency = self.sender.finalize_latency();
        let jobs = self.plan(&status, my_index, latency)?;

        for (target, segment) in jobs {
            let handle = match self.sender.relay(&segment).await {
                Ok(handle) => handle,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(
                        "[{}] relay of message {} segment {} failed: {}",
                        self.config.link_name, target.seq, target.index, e
                    );
                    break;
                }
            };
            info!(
                "[{}] relayed message {} segment {} (height {}, event seq {}) tx {}",
                self.config.link_name,
                target.seq,
                target.index,
                segment.height,
                segment.event_sequence,
                handle.0
            );
            if self.record_submission(target, handle.clone()) {
                self.spawn_result_task(target, handle);
            }
        }
        Ok(())
    }

    /// Trim against `status` and collect the segments to submit, under the buffer lock.
    fn plan(
        &self,
        status: &BmcLinkStatus,
        my_index: Option<usize>,
        latency: u64,
    ) -> Result<Vec<(SegmentRef, Segment)>> {
        let verifier = status.verifier.clone();
        let mut buffer = self.buffer.lock();
        {
            let mut acc = self.acc.lock();
            let mut prove = |bu: &BlockUpdate| {
                reconciler::block_proof_at(&mut acc, bu.height, &bu.header, &verifier)
            };
            if let Err(e) = buffer.trim(verifier.height, status.rx_seq, &mut prove) {
                if e.is_fatal() {
                    return Err(e);
                }
                warn!("[{}] trim failed: {}", self.config.link_name, e);
            }
        }

        let mut jobs = Vec::new();
        let last = buffer.len().saturating_sub(1);
        for (pos, rm) in buffer.iter_mut().enumerate() {
            if rm.has_wait() {
                break;
            }
            if rm.resegment {
                debug!(
                    "[{}] message {} changed while in flight, segmenting again",
                    self.config.link_name, rm.seq
                );
                rm.reset_segments();
            }
            if rm.is_empty() {
                continue;
            }
            match rotation::decide(status, my_index, latency, rm) {
                Decision::Wait => break,
                // the open tail keeps collecting until receipts arrive
                Decision::Defer if pos == last => break,
                Decision::Defer | Decision::Relay => {}
            }
            if !rm.is_segmented() {
                match self.sender.segment(rm, verifier.height) {
                    Ok(segments) => rm.set_segments(segments),
                    Err(e) => {
                        warn!(
                            "[{}] segmentation of message {} failed: {}",
                            self.config.link_name, rm.seq, e
                        );
                        rm.reset_segments();
                        break;
                    }
                }
            }
            if rm.segments.iter().all(Option::is_none) {
                rm.reset_segments();
                break;
            }
            for (index, slot) in rm.segments.iter().enumerate() {
                if let Some(segment) = slot {
                    if segment.get_result_param.is_none() && segment.transaction_result.is_none() {
                        let target = SegmentRef {
                            seq: rm.seq,
                            epoch: rm.segment_epoch,
                            index,
                        };
                        jobs.push((target, segment.clone()));
                    }
                }
            }
            break;
        }
        Ok(jobs)
    }

    fn record_submission(&self, target: SegmentRef, handle: TxHandle) -> bool {
        let mut buffer = self.buffer.lock();
        let Some(rm) = buffer.get_mut(target.seq) else {
            return false;
        };
        if rm.segment_epoch != target.epoch {
            return false;
        }
        match rm.segments.get_mut(target.index) {
            Some(Some(segment)) => {
                segment.get_result_param = Some(handle);
                true
            }
            _ => false,
        }
    }

    fn spawn_result_task(self: &Arc<Self>, target: SegmentRef, handle: TxHandle) {
        let relay = self.clone();
        tokio::spawn(async move {
            let outcome = {
                let Ok(_permit) = relay.workers.clone().acquire_owned().await else {
                    return;
                };
                reconciler::poll_result(relay.sender.as_ref(), &handle, relay.config.poll_policy())
                    .await
            };
            if let Err(ResultError::Revert(code)) = &outcome {
                warn!(
                    "[{}] tx {} of message {} reverted: {}",
                    relay.config.link_name, handle.0, target.seq, code
                );
            }
            match relay.apply_result(target, outcome) {
                Ok(Reconciled::Final) => info!(
                    "[{}] tx {} of message {} accepted",
                    relay.config.link_name, handle.0, target.seq
                ),
                Ok(other) => debug!(
                    "[{}] tx {} of message {}: {:?}",
                    relay.config.link_name, handle.0, target.seq, other
                ),
                Err(e) if e.is_fatal() => {
                    error!("[{}] {}", relay.config.link_name, e);
                    let _ = relay.fatal_tx.send(e);
                }
                Err(e) => warn!(
                    "[{}] reconcile of tx {} failed: {}",
                    relay.config.link_name, handle.0, e
                ),
            }
            relay.signal();
        });
    }

    fn apply_result(
        &self,
        target: SegmentRef,
        outcome: std::result::Result<TxOutcome, ResultError>,
    ) -> Result<Reconciled> {
        let verifier = self.status.read().verifier.clone();
        let mut buffer = self.buffer.lock();
        let mut acc = self.acc.lock();
        reconciler::reconcile(
            &mut buffer,
            target,
            outcome,
            &mut acc,
            &verifier,
            self.sender.as_ref(),
        )
    }

    async fn relay_loop(self: &Arc<Self>, signal_rx: &mut mpsc::Receiver<()>) -> Result<()> {
        let mut timer = interval(Duration::from_millis(
            self.config.dst_block_interval_ms.max(MIN_TICK_MS),
        ));
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                Some(()) = signal_rx.recv() => {}
                _ = timer.tick() => {}
            }
            self.tick().await?;
        }
    }

    /// Run the link until a fatal error or until a chain loop ends.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        let signal_rx = self.signal_rx.lock().take();
        let fatal_rx = self.fatal_rx.lock().take();
        let (Some(mut signal_rx), Some(mut fatal_rx)) = (signal_rx, fatal_rx) else {
            return Err(RelayError::Config(format!(
                "relay {} already running",
                self.config.link_name
            )));
        };
        let (status, start) = self.recover().await?;
        info!(
            "[{}] starting relay: src {} -> dst {}, receive from height {} seq {}",
            self.config.link_name, self.config.src, self.config.dst, start, status.rx_seq
        );

        let monitor = async {
            let res = self
                .sender
                .monitor_loop(
                    status.current_height,
                    &mut |height| self.on_dst_height(height),
                    &mut || info!("[{}] destination monitor connected", self.config.link_name),
                )
                .await;
            res.and(Err(RelayError::Chain("destination monitor ended".into())))
        };
        let receive = async {
            let res = self
                .receiver
                .receive_loop(
                    start,
                    status.rx_seq,
                    &mut |bu, rps| self.on_block(bu, rps),
                    &mut || info!("[{}] source receiver connected", self.config.link_name),
                )
                .await;
            res.and(Err(RelayError::Chain("source receiver ended".into())))
        };

        self.signal();
        let res = tokio::select! {
            res = self.relay_loop(&mut signal_rx) => res,
            res = monitor => res,
            res = receive => res,
            Some(e) = fatal_rx.recv() => Err(e),
        };
        if let Err(e) = &res {
            error!("[{}] relay stopped: {}", self.config.link_name, e);
        }
        res
    }
}
