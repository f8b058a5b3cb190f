//! Batch submission loop.
//!
//! Each tick reads the rollup node's sync status, loads new unsafe L2 blocks into the
//! [`ChannelManager`], and publishes whatever frames are ready, keeping up to
//! `max_pending_transactions` sends in flight. Send results flow back into the manager, which
//! requeues failed frames and invalidates channels that timed out on L1.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use opcore_pipeline::RollupConfig;
use opcore_stream::{L1Provider, L1SourceError, L2Provider, SyncStatusProvider};
use opcore_types::{BlockId, SyncStatus};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    channel::{TxData, TxDataError, TxId},
    channel_manager::{ChannelManager, ChannelManagerError},
    config::{BatcherConfig, ConfigError},
    metrics::BatcherMetrics,
    throttle::{ThrottleClient, ThrottleController},
    tx_manager::{Transactor, TxCandidate, TxManager, TxManagerError, TxReceipt},
};

#[derive(Debug, Error)]
pub enum BatcherError {
    #[error("invalid config: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Channel(#[from] ChannelManagerError),
    #[error("encoding tx data: {0}")]
    TxData(#[from] TxDataError),
}

/// What one [`BatchSubmitter::tick`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub blocks_loaded: usize,
    pub txs_sent: usize,
    pub results: usize,
}

type SendResult = (TxId, Result<TxReceipt, TxManagerError>);

pub struct BatchSubmitter<L1, L2, S, T> {
    cfg: Arc<RollupConfig>,
    config: BatcherConfig,
    l1: L1,
    l2: L2,
    status: S,
    txmgr: Arc<TxManager<T>>,
    state: ChannelManager,
    metrics: Arc<BatcherMetrics>,
    throttle: Option<ThrottleController>,
    in_flight: JoinSet<SendResult>,
    /// Cancels sends; separate from the shutdown signal so frames can drain.
    send_cancel: CancellationToken,
    l1_head: BlockId,
}

impl<L1, L2, S, T> std::fmt::Debug for BatchSubmitter<L1, L2, S, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchSubmitter")
            .field("state", &self.state)
            .field("in_flight", &self.in_flight.len())
            .field("l1_head", &self.l1_head)
            .finish_non_exhaustive()
    }
}

impl<L1, L2, S, T> BatchSubmitter<L1, L2, S, T>
where
    L1: L1Provider,
    L2: L2Provider,
    S: SyncStatusProvider,
    T: Transactor + 'static,
{
    pub fn new(
        cfg: Arc<RollupConfig>,
        config: BatcherConfig,
        l1: L1,
        l2: L2,
        status: S,
        txmgr: TxManager<T>,
    ) -> Result<Self, BatcherError> {
        config.channel.validate()?;
        let metrics = Arc::new(BatcherMetrics::new());
        let state = ChannelManager::new(cfg.clone(), config.channel.clone(), metrics.clone());
        Ok(Self {
            cfg,
            config,
            l1,
            l2,
            status,
            txmgr: Arc::new(txmgr),
            state,
            metrics,
            throttle: None,
            in_flight: JoinSet::new(),
            send_cancel: CancellationToken::new(),
            l1_head: BlockId::default(),
        })
    }

    /// Throttle the sequencer through `client` when DA backs up. Needs `config.throttle`.
    pub fn with_throttle(mut self, client: Arc<dyn ThrottleClient>) -> Self {
        self.throttle = self.config.throttle.map(|config| ThrottleController::new(config, client));
        self
    }

    pub fn metrics(&self) -> &Arc<BatcherMetrics> {
        &self.metrics
    }

    pub fn state(&self) -> &ChannelManager {
        &self.state
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// One round: sync, load, publish, collect finished sends.
    pub async fn tick(&mut self) -> Result<TickSummary, BatcherError> {
        let mut summary = TickSummary::default();
        summary.results = self.collect_results();

        let status = match self.status.sync_status().await {
            Ok(status) => status,
            Err(err) => {
                warn!(target: "opcore::batcher", %err, "failed to fetch sync status");
                return Ok(summary);
            }
        };
        self.l1_head = status.head_l1.id();
        self.state.prune_safe(&status.safe_l2);
        summary.blocks_loaded = self.load_blocks(&status).await?;

        if let Some(throttle) = &mut self.throttle {
            throttle.update(self.state.pending_da_bytes()).await;
        }
        self.check_l1_reorgs(&status).await;
        summary.txs_sent = self.publish()?;
        Ok(summary)
    }

    /// Load unsafe blocks past what the manager already holds. An L2 reorg clears the manager.
    async fn load_blocks(&mut self, status: &SyncStatus) -> Result<usize, BatcherError> {
        let start = self.state.tip().map_or(status.safe_l2.number, |tip| tip.number) + 1;
        let end = status.unsafe_l2.number;
        let mut loaded = 0;
        for number in start..=end {
            let block = match self.l2.block_by_number(Some(number)).await {
                Ok(block) => block,
                Err(err) => {
                    warn!(target: "opcore::batcher", number, %err, "failed to fetch L2 block");
                    break;
                }
            };
            match self.state.add_l2_block(&block) {
                Ok(_) => loaded += 1,
                Err(err @ ChannelManagerError::Reorg { .. }) => {
                    warn!(target: "opcore::batcher", number, %err, "L2 reorg detected");
                    self.state.clear(status.safe_l2.l1_origin.number);
                    break;
                }
                Err(ChannelManagerError::PendingDaFull(pending)) => {
                    debug!(target: "opcore::batcher", pending, "DA backlog full, pausing block loading");
                    break;
                }
                Err(err) => return Err(err.into()),
            }
        }
        if loaded > 0 {
            debug!(target: "opcore::batcher", start, loaded, unsafe_head = end, "loaded L2 blocks");
        }
        Ok(loaded)
    }

    /// Requeue frames whose inclusion block is no longer canonical.
    async fn check_l1_reorgs(&mut self, status: &SyncStatus) {
        for (id, inclusion) in self.state.confirmed_inclusions() {
            if inclusion.number <= status.finalized_l1.number {
                continue;
            }
            let canonical = match self.l1.block_ref_by_number(inclusion.number).await {
                Ok(block) => block.hash == inclusion.hash,
                Err(L1SourceError::NotFound(_)) => false,
                Err(err) => {
                    debug!(target: "opcore::batcher", %err, "skipping L1 reorg check");
                    return;
                }
            };
            if !canonical {
                warn!(target: "opcore::batcher", tx = %id, block = inclusion.number, "batcher tx reorged out of L1");
                self.state.tx_reorged(&id);
            }
        }
    }

    /// Start sends for ready frames until the in-flight limit is reached.
    fn publish(&mut self) -> Result<usize, BatcherError> {
        let mut sent = 0;
        while self.in_flight.len() < self.config.max_pending_transactions {
            let data = match self.state.tx_data(self.l1_head) {
                Ok(data) => data,
                Err(ChannelManagerError::NoData) => break,
                Err(err) => return Err(err.into()),
            };
            self.spawn_send(data)?;
            sent += 1;
        }
        Ok(sent)
    }

    fn spawn_send(&mut self, data: TxData) -> Result<(), BatcherError> {
        let id = data.id();
        let to = self.cfg.batch_inbox_address;
        let candidate = if data.as_blob {
            let blobs = data.blobs()?;
            TxCandidate { to, blobs, ..Default::default() }
        } else {
            TxCandidate { to, data: data.call_data().map_err(TxDataError::from)?, ..Default::default() }
        };
        debug!(target: "opcore::batcher", tx = %id, blob = data.as_blob, bytes = data.len(), "sending batcher tx");

        let txmgr = self.txmgr.clone();
        let cancel = self.send_cancel.clone();
        self.in_flight.spawn(async move { (id, txmgr.send(candidate, &cancel).await) });
        Ok(())
    }

    /// Feed every finished send back into the manager without waiting.
    fn collect_results(&mut self) -> usize {
        let mut n = 0;
        while let Some(joined) = self.in_flight.try_join_next() {
            self.handle_joined(joined);
            n += 1;
        }
        n
    }

    fn handle_joined(&mut self, joined: Result<SendResult, tokio::task::JoinError>) {
        match joined {
            Ok((id, result)) => self.handle_result(id, result),
            Err(err) => error!(target: "opcore::batcher", %err, "send task panicked"),
        }
    }

    fn handle_result(&mut self, id: TxId, result: Result<TxReceipt, TxManagerError>) {
        match result {
            Ok(receipt) if receipt.success => {
                info!(
                    target: "opcore::batcher",
                    tx = %id,
                    hash = %receipt.tx_hash,
                    block = receipt.block.number,
                    "batcher tx confirmed"
                );
                self.state.tx_confirmed(&id, receipt.block);
            }
            Ok(receipt) => {
                warn!(target: "opcore::batcher", tx = %id, hash = %receipt.tx_hash, "batcher tx reverted");
                self.state.tx_failed(&id);
            }
            Err(err) => {
                warn!(target: "opcore::batcher", tx = %id, %err, "batcher tx failed");
                self.state.tx_failed(&id);
            }
        }
    }

    fn log_metrics(&self) {
        match serde_json::to_string(&self.metrics.snapshot()) {
            Ok(snapshot) => info!(target: "opcore::batcher", %snapshot, "batcher metrics"),
            Err(err) => debug!(target: "opcore::batcher", %err, "failed to encode metrics"),
        }
    }

    /// Submit until `cancel` fires, then drain what is left.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), BatcherError> {
        info!(
            target: "opcore::batcher",
            inbox = %self.cfg.batch_inbox_address,
            blobs = self.config.channel.use_blobs,
            batch_type = ?self.config.channel.batch_type,
            "batch submitter started"
        );
        let mut last_metrics = Instant::now();
        loop {
            if cancel.is_cancelled() {
                break;
            }
            self.tick().await?;
            if last_metrics.elapsed() >= self.config.metrics_interval {
                self.log_metrics();
                last_metrics = Instant::now();
            }
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
        self.drain().await
    }

    /// Close the manager and wait, up to the drain timeout, for the remaining frames to land.
    pub async fn drain(&mut self) -> Result<(), BatcherError> {
        info!(target: "opcore::batcher", pending_blocks = self.state.pending_blocks(), "draining");
        self.state.close()?;
        let deadline = Instant::now() + self.config.drain_timeout;
        loop {
            self.collect_results();
            self.publish()?;
            if self.in_flight.is_empty() && self.state.is_drained() {
                info!(target: "opcore::batcher", "batcher drained");
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(
                    target: "opcore::batcher",
                    in_flight = self.in_flight.len(),
                    pending_blocks = self.state.pending_blocks(),
                    "drain timed out"
                );
                break;
            }
            if self.in_flight.is_empty() {
                // Frames need to be resent; avoid spinning.
                tokio::time::sleep(remaining.min(Duration::from_millis(100))).await;
                continue;
            }
            if let Ok(Some(joined)) = tokio::time::timeout(remaining, self.in_flight.join_next()).await {
                self.handle_joined(joined);
            }
        }
        self.send_cancel.cancel();
        while let Some(joined) = self.in_flight.join_next().await {
            self.handle_joined(joined);
        }
        self.log_metrics();
        Ok(())
    }
}
