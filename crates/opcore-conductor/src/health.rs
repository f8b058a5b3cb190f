//! Sequencer health monitor.
//!
//! Polls the rollup node every `interval` and publishes a [`Health`] per tick on a broadcast
//! channel. The unsafe head may lag the wall clock as long as it keeps advancing; it is unhealthy
//! once it lags and stops moving, or once it has not moved for longer than `unsafe_interval`.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bon::Builder;
use opcore_stream::{PeerCountProvider, SyncStatusProvider};
use opcore_types::SyncStatus;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Builder)]
pub struct HealthConfig {
    #[builder(default = Duration::from_secs(1))]
    pub interval: Duration,
    /// Seconds the unsafe head may trail the wall clock, or stand still.
    #[builder(default = 60)]
    pub unsafe_interval: u64,
    #[builder(default)]
    pub safe_enabled: bool,
    /// Seconds the safe head may trail the wall clock when `safe_enabled`.
    #[builder(default = 1200)]
    pub safe_interval: u64,
    #[builder(default = 1)]
    pub min_peer_count: u64,
    /// Results buffered per subscriber.
    #[builder(default = 16)]
    pub channel_capacity: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Unhealthy {
    #[error("unsafe head {number} is {lag}s behind and not advancing")]
    UnsafeHeadBehind { number: u64, lag: u64 },
    #[error("unsafe head {number} has not advanced for {stalled}s")]
    UnsafeHeadStalled { number: u64, stalled: u64 },
    #[error("safe head {number} is {lag}s behind")]
    SafeHeadBehind { number: u64, lag: u64 },
    #[error("{peers} peers, at least {min} required")]
    NotEnoughPeers { peers: u64, min: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Health {
    Healthy,
    NotHealthy(Unhealthy),
    /// The rollup node could not be queried.
    ConnectionDown(String),
}

impl Health {
    pub const fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

pub struct HealthMonitor<S, P> {
    config: HealthConfig,
    sync: S,
    peers: P,
    /// `(number, wall-clock time first seen)` of the highest unsafe head observed.
    last_seen: Option<(u64, u64)>,
    tx: broadcast::Sender<Health>,
}

impl<S, P> std::fmt::Debug for HealthMonitor<S, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("config", &self.config)
            .field("last_seen", &self.last_seen)
            .finish_non_exhaustive()
    }
}

impl<S: SyncStatusProvider, P: PeerCountProvider> HealthMonitor<S, P> {
    pub fn new(config: HealthConfig, sync: S, peers: P) -> Self {
        let (tx, _) = broadcast::channel(config.channel_capacity.max(1));
        Self { config, sync, peers, last_seen: None, tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Health> {
        self.tx.subscribe()
    }

    /// Query the node and evaluate its health at `now` (unix seconds).
    pub async fn check(&mut self, now: u64) -> Health {
        let status = match self.sync.sync_status().await {
            Ok(status) => status,
            Err(err) => return Health::ConnectionDown(err.to_string()),
        };
        let peers = match self.peers.peer_count().await {
            Ok(peers) => peers,
            Err(err) => return Health::ConnectionDown(err.to_string()),
        };
        self.evaluate(&status, peers, now)
    }

    /// Judge one observation. Updates the last-seen unsafe head.
    pub fn evaluate(&mut self, status: &SyncStatus, peers: u64, now: u64) -> Health {
        let unsafe_head = &status.unsafe_l2;
        let advanced = self.last_seen.is_none_or(|(number, _)| unsafe_head.number > number);
        if advanced {
            self.last_seen = Some((unsafe_head.number, now));
        }
        let since_seen = self.last_seen.map_or(0, |(_, seen)| now.saturating_sub(seen));

        let lag = now.saturating_sub(unsafe_head.timestamp);
        if since_seen > self.config.unsafe_interval {
            return Health::NotHealthy(Unhealthy::UnsafeHeadStalled {
                number: unsafe_head.number,
                stalled: since_seen,
            });
        }
        if lag > self.config.unsafe_interval && !advanced {
            return Health::NotHealthy(Unhealthy::UnsafeHeadBehind { number: unsafe_head.number, lag });
        }

        if self.config.safe_enabled {
            let lag = now.saturating_sub(status.safe_l2.timestamp);
            if lag > self.config.safe_interval {
                return Health::NotHealthy(Unhealthy::SafeHeadBehind {
                    number: status.safe_l2.number,
                    lag,
                });
            }
        }

        if peers < self.config.min_peer_count {
            return Health::NotHealthy(Unhealthy::NotEnoughPeers {
                peers,
                min: self.config.min_peer_count,
            });
        }
        Health::Healthy
    }

    /// Check every `interval` and publish the result until cancelled.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            target: "opcore::conductor",
            interval = ?self.config.interval,
            unsafe_interval = self.config.unsafe_interval,
            safe_enabled = self.config.safe_enabled,
            "health monitor started"
        );
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let now = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or_default();
            let health = self.check(now).await;
            match &health {
                Health::Healthy => debug!(target: "opcore::conductor", "sequencer healthy"),
                Health::NotHealthy(reason) => {
                    warn!(target: "opcore::conductor", %reason, "sequencer unhealthy")
                }
                Health::ConnectionDown(err) => {
                    warn!(target: "opcore::conductor", %err, "rollup node unreachable")
                }
            }
            // No subscribers is fine.
            let _ = self.tx.send(health);
        }
        info!(target: "opcore::conductor", "health monitor stopped");
    }
}
