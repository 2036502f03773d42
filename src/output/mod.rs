mod ffmpeg_sink;

pub use ffmpeg_sink::FfmpegSink;

use crate::error::SinkError;
use crate::frame::Frame;

/// Trait for encoded output destinations
///
/// Sinks are driven from the pipeline's writer thread.
pub trait FrameSink: Send {
    /// Append a frame to the output
    fn write_frame(&mut self, frame: &Frame) -> Result<(), SinkError>;

    /// Flush and finalize the output; no frames may follow
    fn finish(&mut self) -> Result<(), SinkError>;

    /// Get the expected output resolution
    fn resolution(&self) -> (u32, u32);
}
