//! Video encoder seam.
//!
//! The codec backends live outside this crate; the display channel only
//! drives them through this trait and reacts to what they return.

use bytes::Bytes;
use lumen_gfx::model::Bitmap;
use lumen_gfx::Rect;

use crate::config::VideoCodecKind;

/// One frame handed to an encoder.
#[derive(Debug)]
pub struct FrameRef<'a> {
    pub bitmap: &'a Bitmap,
    pub src_area: Rect,
    pub mm_time: u32,
}

/// What the encoder did with a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeAction {
    /// Encoded payload ready to send.
    Frame(Bytes),
    /// The encoder chose to drop this frame (rate control).
    Drop,
}

/// A client's periodic playback report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamReport {
    pub stream_id: u32,
    pub unique_id: u32,
    pub start_frame_mm_time: u32,
    pub end_frame_mm_time: u32,
    pub num_frames: u32,
    pub num_drops: u32,
    pub last_frame_delay: i32,
    pub audio_delay: u32,
}

impl StreamReport {
    /// The sentinel report a client sends when it cannot decode the
    /// stream's codec at all.
    pub fn is_decoder_rejection(&self) -> bool {
        self.num_frames == 0 && self.num_drops == u32::MAX
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EncoderStats {
    pub starting_bit_rate: u64,
    pub cur_bit_rate: u64,
    pub avg_quality: f64,
}

/// Live channel measurements the encoder's rate control may query.
pub trait RateContext {
    /// Channel round trip, falling back to the main channel's estimate.
    fn roundtrip_ms(&self) -> u32;

    /// Input frame rate of the stream being encoded.
    fn source_fps(&self) -> u32;
}

pub trait VideoEncoder: Send {
    fn codec(&self) -> VideoCodecKind;

    fn encode_frame(&mut self, ctx: &dyn RateContext, frame: &FrameRef<'_>) -> EncodeAction;

    /// The server dropped a frame this encoder already produced.
    fn notify_server_frame_drop(&mut self);

    /// Feeds a client report into rate control; may return a new
    /// playback delay the client should be configured with.
    fn client_stream_report(&mut self, ctx: &dyn RateContext, report: &StreamReport)
        -> Option<u32>;

    fn bit_rate(&self) -> u64;

    fn stats(&self) -> EncoderStats {
        EncoderStats::default()
    }
}

/// Creates encoder instances for one codec kind.
pub trait VideoEncoderFactory: Send + Sync {
    fn codec(&self) -> VideoCodecKind;

    /// May refuse (e.g. unsupported pixel format at this bit rate), in
    /// which case the next preferred codec is tried.
    fn create(&self, starting_bit_rate: u64) -> Option<Box<dyn VideoEncoder>>;
}
