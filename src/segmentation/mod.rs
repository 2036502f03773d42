mod preprocess;
mod segmenter;
pub mod types;
mod unet;

pub use preprocess::{
    empty_mask, normalize_for_model, threshold_mask, Preprocessor, CHANNEL_MEAN, CHANNEL_SCALE,
    MASK_THRESHOLD,
};
pub use segmenter::Segmenter;
pub use types::{
    InferenceEngine, MaskTensor, NormalizedTensor, SegmentationResult, MODEL_INPUT_SIZE,
};
pub use unet::{DeviceHint, MobileUnet};

use crate::error::SegmentationError;
use std::path::Path;

/// Create a segmenter backed by the default model (Mobile U-Net)
pub fn create_default_segmenter<P: AsRef<Path>>(
    model_path: P,
    device: DeviceHint,
) -> Result<Segmenter<MobileUnet>, SegmentationError> {
    let model = MobileUnet::load(model_path, device)?;
    Ok(Segmenter::new(model))
}
