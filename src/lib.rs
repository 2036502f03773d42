pub mod capture;
pub mod error;
pub mod frame;
pub mod imaging;
pub mod output;
pub mod pipeline;
pub mod segmentation;

pub use error::{ImageError, PipelineError, SegmentationError, SinkError, SourceError};
pub use frame::Frame;
pub use pipeline::{FramePipeline, PipelineConfig, PipelineReport, PipelineState, StopSignal};
