use crate::buffer::RingBuffer;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CAPACITY: usize = 1_000_000;
/// Largest ring a client may ask for; storage is allocated up front.
pub const MAX_CAPACITY: usize = 64 * 1024 * 1024;
/// Writes a follower may fall behind by before it starts skipping.
pub const FOLLOW_BACKLOG: usize = 256;

#[derive(Deserialize, Default)]
pub struct BufferOptions {
    pub capacity: Option<serde_json::Value>,
}

#[derive(Deserialize, Default)]
pub struct TextQuery {
    #[serde(default)]
    pub strip_ansi: bool,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BufferStats {
    pub capacity: usize,
    pub total_written: u64,
    pub len: usize,
    pub evicted: u64,
}

impl From<&RingBuffer> for BufferStats {
    fn from(buffer: &RingBuffer) -> Self {
        Self {
            capacity: buffer.capacity(),
            total_written: buffer.total_written(),
            len: buffer.len(),
            evicted: buffer.evicted(),
        }
    }
}

/// `/stats` payload: the ring's counters plus time since the session was last used.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionStats {
    #[serde(flatten)]
    pub buffer: BufferStats,
    pub idle_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}
