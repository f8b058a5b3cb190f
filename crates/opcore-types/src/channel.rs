use serde::{Deserialize, Serialize};

/// A channel still being assembled, in a form that survives a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelState {
    pub id: [u8; 16],
    /// Ordered by frame number.
    pub frames: Vec<FrameState>,
    pub is_closed: bool,
    pub highest_frame: u16,
    /// L1 inclusion block of the first frame; the channel times out relative to it.
    pub opened_at_l1_block: u64,
    /// Frame data plus per-frame overhead, as counted by the channel bank.
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameState {
    pub frame_number: u16,
    pub data: Vec<u8>,
    pub is_last: bool,
}
