//! Holocene channel assembler.
//!
//! Holds at most one channel. Frames must arrive strictly in order starting at 0; anything else
//! drops the channel. A frame 0 of a different channel replaces the current one.

use std::sync::Arc;

use opcore_types::L1BlockRef;
use tracing::{debug, warn};

use super::Channel;
use crate::{config::RollupConfig, frame::Frame};

#[derive(Debug)]
pub struct ChannelAssembler {
    cfg: Arc<RollupConfig>,
    channel: Option<Channel>,
}

impl ChannelAssembler {
    pub fn new(cfg: Arc<RollupConfig>) -> Self {
        Self { cfg, channel: None }
    }

    #[inline]
    pub fn current(&self) -> Option<&Channel> {
        self.channel.as_ref()
    }

    pub fn ingest_frame(&mut self, frame: Frame, origin: &L1BlockRef) {
        let timeout = self.cfg.channel_timeout(origin.timestamp);
        if self.channel.as_ref().is_some_and(|ch| ch.is_timed_out(origin.number, timeout)) {
            warn!(target: "opcore::derive", "dropping timed out channel");
            self.channel = None;
        }

        if let Some(ch) = &self.channel {
            if ch.id() != frame.id {
                if frame.number != 0 {
                    debug!(target: "opcore::derive", frame = frame.number, "ignoring frame of unknown channel");
                    return;
                }
                warn!(
                    target: "opcore::derive",
                    old = %hex::encode(ch.id()),
                    new = %hex::encode(frame.id),
                    "new channel replaces incomplete channel"
                );
                self.channel = None;
            }
        }

        if self.channel.is_none() {
            if frame.number != 0 {
                debug!(target: "opcore::derive", frame = frame.number, "ignoring frame without channel start");
                return;
            }
            self.channel = Some(Channel::new(frame.id, origin.id()));
        }
        let Some(channel) = self.channel.as_mut() else { return };

        let expected = channel.len() as u16;
        if frame.number != expected {
            warn!(
                target: "opcore::derive",
                channel_id = %hex::encode(frame.id),
                expected,
                got = frame.number,
                "out of order frame, dropping channel"
            );
            self.channel = None;
            return;
        }
        if let Err(err) = channel.add_frame(frame, origin.id()) {
            warn!(target: "opcore::derive", %err, "invalid frame, dropping channel");
            self.channel = None;
            return;
        }

        if channel.size() as u64 > self.cfg.max_rlp_bytes_per_channel(origin.timestamp) {
            warn!(target: "opcore::derive", size = channel.size(), "channel too large, dropping");
            self.channel = None;
        }
    }

    /// Take the channel data once the channel is complete.
    pub fn read(&mut self) -> Option<Vec<u8>> {
        if !self.channel.as_ref()?.is_ready() {
            return None;
        }
        self.channel.take()?.frame_data().ok()
    }

    pub fn reset(&mut self) {
        self.channel = None;
    }
}
