//! Pre-Holocene channel bank.
//!
//! Channels are kept in FIFO order of first sight. Only the head channel is ever read: it is
//! either returned once ready or dropped once timed out. When the summed channel size exceeds the
//! bank budget the oldest channels are evicted.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use opcore_types::L1BlockRef;
use tracing::{debug, warn};

use super::Channel;
use crate::{
    config::RollupConfig,
    frame::{ChannelId, Frame},
};

#[derive(Debug)]
pub struct ChannelBank {
    cfg: Arc<RollupConfig>,
    channels: HashMap<ChannelId, Channel>,
    queue: VecDeque<ChannelId>,
}

impl ChannelBank {
    pub fn new(cfg: Arc<RollupConfig>) -> Self {
        Self { cfg, channels: HashMap::new(), queue: VecDeque::new() }
    }

    /// Total bytes charged against the bank budget.
    pub fn size(&self) -> usize {
        self.channels.values().map(Channel::size).sum()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn contains(&self, id: &ChannelId) -> bool {
        self.channels.contains_key(id)
    }

    /// Ingest a frame seen in `origin`. Invalid frames are logged and ignored.
    pub fn ingest_frame(&mut self, frame: Frame, origin: &L1BlockRef) {
        let timeout = self.cfg.channel_timeout(origin.timestamp);
        let id = frame.id;

        if !self.channels.contains_key(&id) {
            self.queue.push_back(id);
            self.channels.insert(id, Channel::new(id, origin.id()));
        }
        let Some(channel) = self.channels.get_mut(&id) else { return };

        if channel.is_timed_out(origin.number, timeout) {
            warn!(
                target: "opcore::derive",
                channel_id = %hex::encode(id),
                frame = frame.number,
                "ignoring frame of timed out channel"
            );
            return;
        }

        let number = frame.number;
        if let Err(err) = channel.add_frame(frame, origin.id()) {
            debug!(target: "opcore::derive", channel_id = %hex::encode(id), number, %err, "dropping frame");
            return;
        }

        self.prune(origin.timestamp);
    }

    /// Evict the oldest channels until the bank fits its budget.
    fn prune(&mut self, timestamp: u64) {
        let max = self.cfg.max_channel_bank_size(timestamp);
        let mut total = self.size();
        while total > max {
            let Some(id) = self.queue.pop_front() else { break };
            if let Some(ch) = self.channels.remove(&id) {
                warn!(target: "opcore::derive", channel_id = %hex::encode(id), size = ch.size(), "evicting channel");
                total -= ch.size();
            }
        }
    }

    /// Read the head channel if it is ready.
    ///
    /// Returns `None` when there is nothing to read yet. A timed out head channel is dropped
    /// and `None` returned; the caller simply tries again.
    pub fn read(&mut self, origin: &L1BlockRef) -> Option<Vec<u8>> {
        let id = *self.queue.front()?;
        let timeout = self.cfg.channel_timeout(origin.timestamp);
        let ch = self.channels.get(&id)?;

        if ch.is_timed_out(origin.number, timeout) {
            debug!(target: "opcore::derive", channel_id = %hex::encode(id), "channel timed out");
            self.channels.remove(&id);
            self.queue.pop_front();
            return None;
        }
        if !ch.is_ready() {
            return None;
        }

        self.queue.pop_front();
        let ch = self.channels.remove(&id)?;
        ch.frame_data().ok()
    }

    /// Snapshot of the buffered channels, oldest first.
    pub fn channels(&self) -> impl Iterator<Item = &Channel> {
        self.queue.iter().filter_map(|id| self.channels.get(id))
    }

    pub fn reset(&mut self) {
        self.channels.clear();
        self.queue.clear();
    }
}
