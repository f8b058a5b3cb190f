//! The conductor control loop.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bon::Builder;
use opcore_types::ExecutionPayloadEnvelope;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    health::Health,
    raft::{Consensus, ConsensusError},
};

#[derive(Debug, Clone, Builder)]
pub struct ConductorConfig {
    /// Consecutive unhealthy results, while leading, before leadership is handed over.
    #[builder(default = 3)]
    pub health_check_failure_threshold: u64,
    /// Start paused.
    #[builder(default)]
    pub paused: bool,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConductorError {
    #[error("not the leader")]
    NotLeader,
    #[error("conductor is stopped")]
    Stopped,
    #[error(transparent)]
    Consensus(#[from] ConsensusError),
}

/// What one health result led to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthAction {
    None,
    /// Paused; the result was recorded but not acted on.
    Ignored,
    TransferredLeadership,
    TransferFailed,
}

#[derive(Debug)]
pub struct Conductor<C> {
    config: ConductorConfig,
    consensus: C,
    paused: AtomicBool,
    stopped: AtomicBool,
    healthy: AtomicBool,
    failures: AtomicU64,
}

impl<C: Consensus> Conductor<C> {
    pub fn new(config: ConductorConfig, consensus: C) -> Self {
        Self {
            paused: AtomicBool::new(config.paused),
            config,
            consensus,
            stopped: AtomicBool::new(false),
            healthy: AtomicBool::new(false),
            failures: AtomicU64::new(0),
        }
    }

    pub const fn consensus(&self) -> &C {
        &self.consensus
    }

    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            info!(target: "opcore::conductor", "conductor paused");
        }
    }

    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            info!(target: "opcore::conductor", "conductor resumed");
        }
    }

    pub fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Running and not paused.
    pub fn active(&self) -> bool {
        !self.stopped() && !self.paused()
    }

    pub fn sequencer_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    /// Consecutive unhealthy results seen so far.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::SeqCst)
    }

    pub async fn leader(&self) -> bool {
        self.consensus.leader().await
    }

    pub async fn commit_unsafe_payload(
        &self,
        payload: &ExecutionPayloadEnvelope,
    ) -> Result<(), ConductorError> {
        if self.stopped() {
            return Err(ConductorError::Stopped);
        }
        if !self.consensus.leader().await {
            return Err(ConductorError::NotLeader);
        }
        self.consensus.commit_unsafe_payload(payload).await?;
        Ok(())
    }

    pub async fn latest_unsafe_payload(&self) -> Option<ExecutionPayloadEnvelope> {
        self.consensus.latest_unsafe_payload().await
    }

    /// Record one health result and hand over leadership once the failure threshold is hit.
    pub async fn handle_health(&self, health: &Health) -> HealthAction {
        if health.is_healthy() {
            self.healthy.store(true, Ordering::SeqCst);
            self.failures.store(0, Ordering::SeqCst);
            return HealthAction::None;
        }
        self.healthy.store(false, Ordering::SeqCst);
        let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.active() {
            return HealthAction::Ignored;
        }
        if failures < self.config.health_check_failure_threshold || !self.consensus.leader().await {
            return HealthAction::None;
        }

        warn!(target: "opcore::conductor", failures, ?health, "sequencer unhealthy, transferring leadership");
        match self.consensus.transfer_leader().await {
            Ok(()) => {
                self.failures.store(0, Ordering::SeqCst);
                HealthAction::TransferredLeadership
            }
            Err(err) => {
                error!(target: "opcore::conductor", %err, "leadership transfer failed");
                HealthAction::TransferFailed
            }
        }
    }

    /// Consume health results until cancelled or the monitor goes away, then shut consensus down.
    pub async fn run(
        &self,
        mut health: broadcast::Receiver<Health>,
        cancel: CancellationToken,
    ) -> Result<(), ConductorError> {
        let mut leader_ch = self.consensus.leader_ch();
        info!(
            target: "opcore::conductor",
            server_id = self.consensus.server_id(),
            leader = *leader_ch.borrow(),
            paused = self.paused(),
            "conductor started"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = leader_ch.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let leader = *leader_ch.borrow_and_update();
                    info!(target: "opcore::conductor", leader, "leadership changed");
                }
                result = health.recv() => match result {
                    Ok(h) => {
                        let action = self.handle_health(&h).await;
                        debug!(target: "opcore::conductor", ?h, ?action, "handled health result");
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(target: "opcore::conductor", skipped, "health results lagged");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        self.stopped.store(true, Ordering::SeqCst);
        self.consensus.shutdown().await?;
        info!(target: "opcore::conductor", "conductor stopped");
        Ok(())
    }
}
