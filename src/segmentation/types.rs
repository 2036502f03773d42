use crate::error::{ImageError, SegmentationError};
use crate::imaging::CropRect;
use image::RgbaImage;
use ndarray::Array4;

/// Side of the square model input and output, in pixels
pub const MODEL_INPUT_SIZE: u32 = 512;

/// Model input: NCHW float tensor with shape [1, 3, height, width]
pub type NormalizedTensor = Array4<f32>;

/// Raw model output: per-pixel foreground scores in [0, 1], row-major
#[derive(Debug, Clone, PartialEq)]
pub struct MaskTensor {
    scores: Vec<f32>,
    width: u32,
    height: u32,
}

impl MaskTensor {
    pub fn new(scores: Vec<f32>, width: u32, height: u32) -> Result<Self, ImageError> {
        let expected = width as usize * height as usize;
        if expected == 0 {
            return Err(ImageError::InvalidDimension { width, height });
        }
        if scores.len() != expected {
            return Err(ImageError::TensorLength {
                expected,
                actual: scores.len(),
            });
        }

        Ok(Self {
            scores,
            width,
            height,
        })
    }

    pub fn scores(&self) -> &[f32] {
        &self.scores
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// Foreground extracted from a still image
#[derive(Debug, Clone)]
pub struct SegmentationResult {
    /// Foreground cropped to `crop_rect`
    pub body: RgbaImage,
    /// Foreground on a transparent background, at the working resolution
    pub full_size_body: RgbaImage,
    /// Smallest rectangle holding every visible pixel of `full_size_body`
    pub crop_rect: CropRect,
}

/// Trait for inference backends
///
/// Taking `&mut self` keeps a backend to one in-flight call at a time.
pub trait InferenceEngine {
    /// Run the model on a normalized [1, 3, H, W] tensor
    ///
    /// # Returns
    /// * Foreground scores at the model's output resolution
    fn run(&mut self, input: &NormalizedTensor) -> Result<MaskTensor, SegmentationError>;

    /// Get the model's input dimensions
    ///
    /// Returns (width, height)
    fn input_size(&self) -> (u32, u32) {
        (MODEL_INPUT_SIZE, MODEL_INPUT_SIZE)
    }
}
