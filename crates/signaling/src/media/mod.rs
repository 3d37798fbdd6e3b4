//! Shared video source boundary
//!
//! One source feeds every session. Sessions attach a [`FrameSink`] and
//! receive every frame by reference; payloads are `Bytes`, so fan-out never
//! copies pixels.

pub mod test_pattern;

pub use test_pattern::TestPatternSource;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::config::VideoSourceConfig;
use crate::Result;

/// Sink registration handle
pub type SinkId = u64;

/// Payload encoding of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    /// Raw planar YUV 4:2:0
    I420,
    /// VP8 bitstream, ready for packetization
    Vp8,
}

/// One video frame
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub data: Bytes,
    pub format: FrameFormat,
    pub width: u32,
    pub height: u32,
    /// Monotonic frame number starting at 0
    pub sequence: u64,
    /// Presentation time since the source started
    pub timestamp: Duration,
    /// Nominal frame duration
    pub duration: Duration,
    pub keyframe: bool,
}

/// Receives frames from a [`VideoSource`]. Called on the source's thread;
/// implementations must not block.
pub trait FrameSink: Send + Sync {
    fn on_frame(&self, frame: &VideoFrame);
}

/// Broadcast frame producer shared by all sessions
pub trait VideoSource: Send + Sync {
    fn start(&self) -> Result<()>;

    fn stop(&self);

    fn is_running(&self) -> bool;

    fn add_sink(&self, sink: Arc<dyn FrameSink>) -> SinkId;

    fn remove_sink(&self, id: SinkId) -> bool;

    fn sink_count(&self) -> usize;

    /// Frames produced since construction
    fn frames_generated(&self) -> u64;

    fn format(&self) -> VideoSourceConfig;
}
