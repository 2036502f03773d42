use super::types::{MaskTensor, NormalizedTensor};
use crate::error::ImageError;
use crate::imaging::ensure_area;
use image::{imageops, Rgba, RgbaImage};
use ndarray::Array4;

/// Per-channel (R, G, B) mean subtracted before scaling
pub const CHANNEL_MEAN: [f32; 3] = [144.75, 137.707, 129.66];
/// Per-channel (R, G, B) divisor applied after mean subtraction
pub const CHANNEL_SCALE: [f32; 3] = [65.5, 61.69, 62.33];
/// Scores strictly above this become foreground
pub const MASK_THRESHOLD: f32 = 0.5;

const FOREGROUND: Rgba<u8> = Rgba([255, 255, 255, 255]);
const BACKGROUND: Rgba<u8> = Rgba([0, 0, 0, 0]);

/// Converts frames to model input tensors and model output back to masks
#[derive(Debug, Clone, Copy)]
pub struct Preprocessor {
    target_width: u32,
    target_height: u32,
}

impl Preprocessor {
    pub fn new(target_width: u32, target_height: u32) -> Self {
        Self {
            target_width,
            target_height,
        }
    }

    pub fn preprocess(&self, image: &RgbaImage) -> Result<NormalizedTensor, ImageError> {
        normalize_for_model(image, self.target_height, self.target_width)
    }

    pub fn postprocess(&self, tensor: &MaskTensor) -> Result<RgbaImage, ImageError> {
        threshold_mask(tensor, self.target_height, self.target_width)
    }
}

/// Preprocess an RGBA image into a normalized NCHW tensor
///
/// Steps:
/// 1. Resize to `width x height` into a fresh buffer
/// 2. Subtract the channel mean and divide by the channel scale
/// 3. Lay the R, G and B planes out row-major; alpha is dropped
///
/// Returns: Array4<f32> with shape [1, 3, height, width]
pub fn normalize_for_model(
    image: &RgbaImage,
    height: u32,
    width: u32,
) -> Result<NormalizedTensor, ImageError> {
    let _span = tracing::debug_span!("preprocess").entered();

    ensure_area(image.width(), image.height())?;
    ensure_area(width, height)?;

    let resized = imageops::resize(image, width, height, imageops::FilterType::Triangle);

    let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let (row, col) = (y as usize, x as usize);
        for channel in 0..3 {
            tensor[[0, channel, row, col]] =
                (f32::from(pixel[channel]) - CHANNEL_MEAN[channel]) / CHANNEL_SCALE[channel];
        }
    }

    Ok(tensor)
}

/// Build a binary mask from model scores
///
/// Every pixel is either opaque white (score > 0.5) or fully transparent.
pub fn threshold_mask(
    tensor: &MaskTensor,
    height: u32,
    width: u32,
) -> Result<RgbaImage, ImageError> {
    let _span = tracing::debug_span!("postprocess").entered();

    ensure_area(width, height)?;
    let (tensor_width, tensor_height) = tensor.dimensions();
    if (tensor_width, tensor_height) != (width, height) {
        return Err(ImageError::SizeMismatch {
            image_width: width,
            image_height: height,
            mask_width: tensor_width,
            mask_height: tensor_height,
        });
    }

    let scores = tensor.scores();
    Ok(RgbaImage::from_fn(width, height, |x, y| {
        let idx = (y * width + x) as usize;
        if scores[idx] > MASK_THRESHOLD {
            FOREGROUND
        } else {
            BACKGROUND
        }
    }))
}

/// Fully transparent mask, used when a frame could not be segmented
pub fn empty_mask(width: u32, height: u32) -> RgbaImage {
    RgbaImage::from_pixel(width, height, BACKGROUND)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-5
    }

    #[test]
    fn normalize_applies_channel_constants() {
        let image = RgbaImage::from_pixel(3, 3, Rgba([210, 137, 0, 12]));

        let tensor = normalize_for_model(&image, 3, 3).unwrap();

        assert_eq!(tensor.shape(), &[1, 3, 3, 3]);
        assert!(approx(tensor[[0, 0, 1, 1]], (210.0 - 144.75) / 65.5));
        assert!(approx(tensor[[0, 1, 2, 0]], (137.0 - 137.707) / 61.69));
        assert!(approx(tensor[[0, 2, 0, 2]], (0.0 - 129.66) / 62.33));
    }

    #[test]
    fn normalize_uses_planar_row_major_layout() {
        let mut image = RgbaImage::new(2, 1);
        image.put_pixel(0, 0, Rgba([10, 20, 30, 255]));
        image.put_pixel(1, 0, Rgba([200, 210, 220, 255]));

        let tensor = normalize_for_model(&image, 1, 2).unwrap();

        assert_eq!(tensor.shape(), &[1, 3, 1, 2]);
        let flat: Vec<f32> = tensor.iter().copied().collect();
        let expected = [
            (10.0 - 144.75) / 65.5,
            (200.0 - 144.75) / 65.5,
            (20.0 - 137.707) / 61.69,
            (210.0 - 137.707) / 61.69,
            (30.0 - 129.66) / 62.33,
            (220.0 - 129.66) / 62.33,
        ];
        for (got, want) in flat.iter().zip(expected) {
            assert!(approx(*got, want), "{got} != {want}");
        }
    }

    #[test]
    fn normalize_resizes_to_model_input() {
        let image = RgbaImage::from_pixel(7, 3, Rgba([1, 2, 3, 255]));
        let tensor = Preprocessor::new(16, 8).preprocess(&image).unwrap();
        assert_eq!(tensor.shape(), &[1, 3, 8, 16]);
    }

    #[test]
    fn normalize_rejects_empty_image() {
        assert!(matches!(
            normalize_for_model(&RgbaImage::new(0, 5), 4, 4),
            Err(ImageError::InvalidDimension { .. })
        ));
    }

    #[test]
    fn threshold_alpha_is_binary() {
        let (width, height) = (32u32, 16u32);
        // Deterministic spread of scores over [0, 1]
        let mut state = 0x2545_f491_u32;
        let scores: Vec<f32> = (0..width * height)
            .map(|_| {
                state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                (state >> 8) as f32 / (1u32 << 24) as f32
            })
            .collect();
        let tensor = MaskTensor::new(scores.clone(), width, height).unwrap();

        let mask = threshold_mask(&tensor, height, width).unwrap();

        for (pixel, score) in mask.pixels().zip(&scores) {
            assert!(pixel[3] == 0 || pixel[3] == 255);
            assert_eq!(pixel[3] == 255, *score > MASK_THRESHOLD);
        }
    }

    #[test]
    fn threshold_boundary_is_background() {
        let tensor = MaskTensor::new(vec![0.5, 0.500_001, 0.0, 1.0], 2, 2).unwrap();

        let mask = threshold_mask(&tensor, 2, 2).unwrap();

        assert_eq!(mask.get_pixel(0, 0), &BACKGROUND);
        assert_eq!(mask.get_pixel(1, 0), &FOREGROUND);
        assert_eq!(mask.get_pixel(0, 1), &BACKGROUND);
        assert_eq!(mask.get_pixel(1, 1), &FOREGROUND);
    }

    #[test]
    fn threshold_rejects_wrong_shape() {
        let tensor = MaskTensor::new(vec![0.0; 6], 3, 2).unwrap();
        assert!(matches!(
            threshold_mask(&tensor, 3, 2),
            Err(ImageError::SizeMismatch { .. })
        ));
        assert!(matches!(
            MaskTensor::new(vec![0.0; 5], 3, 2),
            Err(ImageError::TensorLength {
                expected: 6,
                actual: 5
            })
        ));
    }
}
