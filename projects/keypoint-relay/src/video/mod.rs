#[cfg(feature = "ffmpeg")]
pub mod ffmpeg_decoder;
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg_source;

use crate::pipeline::types::{DecodedFrame, EncodedPacket};
use anyhow::Result;
use std::sync::Arc;

/// Demuxed encoded video, one access unit at a time.
pub trait StreamSource: Send {
    /// `Ok(None)` marks end of stream. Errors are transient; the caller retries.
    fn next_packet(&mut self) -> Result<Option<EncodedPacket>>;
}

/// Runs on the decode engine's own thread. Must not block beyond the
/// handoff queue's push timeout.
pub type FrameCallback = Arc<dyn Fn(DecodedFrame) + Send + Sync>;

pub trait DecodeEngine: Send {
    /// Queues `packet` for decoding. Every frame it produces is handed to
    /// `on_decoded`, asynchronously relative to the caller.
    fn submit(&mut self, packet: EncodedPacket, on_decoded: FrameCallback) -> Result<()>;
}
