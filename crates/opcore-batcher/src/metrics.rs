//! Batcher counters and gauges.
//!
//! Plain atomics shared between the channel manager and the submission driver; the driver logs a
//! [`MetricsSnapshot`] periodically.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::channel_out::CloseReason;

#[derive(Debug, Default)]
pub struct BatcherMetrics {
    // gauges
    pending_blocks: AtomicU64,
    channel_queue_length: AtomicU64,
    pending_da_bytes: AtomicU64,
    // counters
    blocks_added: AtomicU64,
    channels_opened: AtomicU64,
    channels_timed_out: AtomicU64,
    input_bytes: AtomicU64,
    output_bytes: AtomicU64,
    frames_submitted: AtomicU64,
    txs_confirmed: AtomicU64,
    txs_failed: AtomicU64,
    txs_reorged: AtomicU64,
    closed_full: AtomicU64,
    closed_max_duration: AtomicU64,
    closed_timeout: AtomicU64,
    closed_force: AtomicU64,
    closed_too_many_frames: AtomicU64,
}

/// Point-in-time copy of [`BatcherMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub pending_blocks: u64,
    pub channel_queue_length: u64,
    pub pending_da_bytes: u64,
    pub blocks_added: u64,
    pub channels_opened: u64,
    pub channels_timed_out: u64,
    pub input_bytes: u64,
    pub output_bytes: u64,
    pub frames_submitted: u64,
    pub txs_confirmed: u64,
    pub txs_failed: u64,
    pub txs_reorged: u64,
    pub closed_full: u64,
    pub closed_max_duration: u64,
    pub closed_timeout: u64,
    pub closed_force: u64,
    pub closed_too_many_frames: u64,
}

impl BatcherMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_pending_blocks(&self, n: u64) {
        self.pending_blocks.store(n, Ordering::Relaxed);
    }

    pub fn set_channel_queue_length(&self, n: u64) {
        self.channel_queue_length.store(n, Ordering::Relaxed);
    }

    pub fn set_pending_da_bytes(&self, n: u64) {
        self.pending_da_bytes.store(n, Ordering::Relaxed);
    }

    pub fn pending_da_bytes(&self) -> u64 {
        self.pending_da_bytes.load(Ordering::Relaxed)
    }

    pub fn record_block_added(&self) {
        self.blocks_added.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_channel_opened(&self) {
        self.channels_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_channel_timed_out(&self) {
        self.channels_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    /// A channel closed after taking `input` RLP bytes.
    pub fn record_channel_closed(&self, reason: CloseReason, input: u64) {
        self.input_bytes.fetch_add(input, Ordering::Relaxed);
        let counter = match reason {
            CloseReason::Full => &self.closed_full,
            CloseReason::MaxDuration => &self.closed_max_duration,
            CloseReason::Timeout => &self.closed_timeout,
            CloseReason::ForceClose => &self.closed_force,
            CloseReason::TooManyFrames => &self.closed_too_many_frames,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frames_submitted(&self, frames: u64, bytes: u64) {
        self.frames_submitted.fetch_add(frames, Ordering::Relaxed);
        self.output_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_tx_confirmed(&self) {
        self.txs_confirmed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tx_failed(&self) {
        self.txs_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tx_reorged(&self) {
        self.txs_reorged.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let get = |a: &AtomicU64| a.load(Ordering::Relaxed);
        MetricsSnapshot {
            pending_blocks: get(&self.pending_blocks),
            channel_queue_length: get(&self.channel_queue_length),
            pending_da_bytes: get(&self.pending_da_bytes),
            blocks_added: get(&self.blocks_added),
            channels_opened: get(&self.channels_opened),
            channels_timed_out: get(&self.channels_timed_out),
            input_bytes: get(&self.input_bytes),
            output_bytes: get(&self.output_bytes),
            frames_submitted: get(&self.frames_submitted),
            txs_confirmed: get(&self.txs_confirmed),
            txs_failed: get(&self.txs_failed),
            txs_reorged: get(&self.txs_reorged),
            closed_full: get(&self.closed_full),
            closed_max_duration: get(&self.closed_max_duration),
            closed_timeout: get(&self.closed_timeout),
            closed_force: get(&self.closed_force),
            closed_too_many_frames: get(&self.closed_too_many_frames),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_reasons_counted_separately() {
        let m = BatcherMetrics::new();
        m.record_channel_closed(CloseReason::Full, 100);
        m.record_channel_closed(CloseReason::Full, 50);
        m.record_channel_closed(CloseReason::ForceClose, 10);

        let s = m.snapshot();
        assert_eq!(s.closed_full, 2);
        assert_eq!(s.closed_force, 1);
        assert_eq!(s.closed_timeout, 0);
        assert_eq!(s.input_bytes, 160);
    }
}
