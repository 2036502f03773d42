use std::path::PathBuf;

use thiserror::Error;

/// Pixel-math contract violations. These are never clamped or recovered.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("invalid dimension {width}x{height}")]
    InvalidDimension { width: u32, height: u32 },

    #[error(
        "size mismatch: image is {image_width}x{image_height}, mask is {mask_width}x{mask_height}"
    )]
    SizeMismatch {
        image_width: u32,
        image_height: u32,
        mask_width: u32,
        mask_height: u32,
    },

    #[error("tensor holds {actual} values, expected {expected}")]
    TensorLength { expected: usize, actual: usize },
}

#[derive(Debug, Error)]
pub enum SegmentationError {
    #[error("failed to load model from {}", path.display())]
    ModelLoad {
        path: PathBuf,
        #[source]
        source: ort::Error,
    },

    #[error("inference failed: {0}")]
    Run(String),

    #[error(transparent)]
    Image(#[from] ImageError),

    #[error("no foreground found in image")]
    NoForeground,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to open video source {}: {reason}", path.display())]
    Open { path: PathBuf, reason: String },

    #[error("decode failed: {0}")]
    Decode(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to open video sink {}: {reason}", path.display())]
    Open { path: PathBuf, reason: String },

    #[error(
        "sink is {actual_width}x{actual_height}, frames are {expected_width}x{expected_height}"
    )]
    SizeMismatch {
        expected_width: u32,
        expected_height: u32,
        actual_width: u32,
        actual_height: u32,
    },

    #[error("failed to write frame: {0}")]
    Write(String),

    #[error("failed to finish encoding: {0}")]
    Finish(String),
}

/// Fatal errors of a pipeline run. The run reports the first one it hits.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid pipeline config: {0}")]
    Config(String),

    #[error("source open failed")]
    SourceOpen(#[source] SourceError),

    #[error("sink open failed")]
    SinkOpen(#[source] SinkError),

    #[error(
        "no frame at {timestamp_us}us (frame {frame_index}) after {attempts} attempts"
    )]
    FrameAcquisitionExhausted {
        frame_index: u64,
        timestamp_us: u64,
        attempts: u32,
    },

    #[error("write failed at frame {frame_index} ({timestamp_us}us)")]
    Write {
        frame_index: u64,
        timestamp_us: u64,
        #[source]
        source: SinkError,
    },

    #[error("finish failed")]
    Finish(#[source] SinkError),

    #[error("compose failed at frame {frame_index}")]
    Image {
        frame_index: u64,
        #[source]
        source: ImageError,
    },

    #[error("failed to spawn writer thread")]
    WriterSpawn(#[source] std::io::Error),

    #[error("writer thread panicked")]
    WriterPanicked,
}
