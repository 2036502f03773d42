mod ffmpeg_source;

pub use ffmpeg_source::FfmpegSource;

use crate::error::SourceError;
use image::RgbaImage;

/// Trait for decoded video sources
pub trait FrameSource {
    /// Decode the frame shown at `timestamp_us`
    ///
    /// Returns `None` when no frame could be produced; callers may ask again.
    fn frame_at(&mut self, timestamp_us: u64) -> Option<RgbaImage>;

    /// Length of the source in seconds
    fn duration_secs(&self) -> f64;

    /// Get the resolution of decoded frames
    fn resolution(&self) -> (u32, u32);

    /// Release the decoder
    fn close(&mut self) -> Result<(), SourceError> {
        Ok(())
    }
}
