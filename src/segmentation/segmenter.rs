use super::preprocess::Preprocessor;
use super::types::{InferenceEngine, SegmentationResult};
use crate::error::SegmentationError;
use crate::imaging::{
    apply_mask, crop_by_alpha, decode_downscale, fit_with_letterbox, pad_to_square,
    scale_to_fit_with, WORKING_HEIGHT, WORKING_WIDTH,
};
use image::imageops::{self, FilterType};
use image::RgbaImage;
use std::time::Instant;

/// Turns frames into binary foreground masks using an owned inference engine
pub struct Segmenter<E> {
    engine: E,
    preprocessor: Preprocessor,
    square_input: bool,
}

impl<E: InferenceEngine> Segmenter<E> {
    pub fn new(engine: E) -> Self {
        let (width, height) = engine.input_size();
        Self {
            engine,
            preprocessor: Preprocessor::new(width, height),
            square_input: false,
        }
    }

    /// Pad frames to a square before inference so the model sees them
    /// undistorted. The mask is cropped back to the frame afterwards.
    pub fn with_square_padding(mut self, enabled: bool) -> Self {
        self.square_input = enabled;
        self
    }

    /// Segment a frame, logging and swallowing any failure.
    ///
    /// Returns a mask with the frame's dimensions, or `None` if inference
    /// failed for this frame.
    pub fn segment_frame(&mut self, frame: &RgbaImage) -> Option<RgbaImage> {
        match self.try_segment_frame(frame) {
            Ok(mask) => Some(mask),
            Err(err) => {
                tracing::warn!(
                    "Segmentation failed for {}x{} frame: {}",
                    frame.width(),
                    frame.height(),
                    err
                );
                None
            }
        }
    }

    /// Segment a frame and return a binary mask at the frame's resolution
    pub fn try_segment_frame(&mut self, frame: &RgbaImage) -> Result<RgbaImage, SegmentationError> {
        let _span = tracing::debug_span!("segment_frame").entered();

        let (width, height) = frame.dimensions();
        if !self.square_input || width == height {
            let mask = self.infer(frame)?;
            return Ok(scale_to_fit_with(mask, width, height, FilterType::Nearest)?);
        }

        let squared = pad_to_square(frame.clone())?;
        let side = squared.width();
        let mask = self.infer(&squared)?;
        let mask = scale_to_fit_with(mask, side, side, FilterType::Nearest)?;

        // Same offsets pad_to_square used to place the frame
        let x = (side - width) / 2;
        let y = (side - height) / 2;
        Ok(imageops::crop_imm(&mask, x, y, width, height).to_image())
    }

    /// Model-resolution mask for an image
    fn infer(&mut self, image: &RgbaImage) -> Result<RgbaImage, SegmentationError> {
        let start = Instant::now();
        let input = self.preprocessor.preprocess(image)?;
        let prepared = start.elapsed();

        let scores = self.engine.run(&input)?;
        let inferred = start.elapsed();

        let mask = self.preprocessor.postprocess(&scores)?;

        tracing::debug!(
            "prepare={:.1}ms, infer={:.1}ms, mask={:.1}ms",
            prepared.as_secs_f64() * 1000.0,
            (inferred - prepared).as_secs_f64() * 1000.0,
            (start.elapsed() - inferred).as_secs_f64() * 1000.0
        );

        Ok(mask)
    }

    /// Extract the foreground of a still image.
    ///
    /// The image is downscaled for decode, letterboxed into the working
    /// canvas, masked and cropped to its visible pixels.
    pub fn segment_image(
        &mut self,
        image: RgbaImage,
    ) -> Result<SegmentationResult, SegmentationError> {
        let image = decode_downscale(image)?;
        let working = fit_with_letterbox(&image, WORKING_WIDTH, WORKING_HEIGHT)?;

        let mask = self.try_segment_frame(&working)?;
        let full_size_body = apply_mask(&working, &mask)?;

        let (body, crop_rect) =
            crop_by_alpha(&full_size_body).ok_or(SegmentationError::NoForeground)?;

        Ok(SegmentationResult {
            body,
            full_size_body,
            crop_rect,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imaging::CropRect;
    use crate::segmentation::types::{MaskTensor, NormalizedTensor, MODEL_INPUT_SIZE};
    use image::Rgba;

    /// Scores the region x < `right`, y < `bottom` of the model output as
    /// foreground
    struct RegionEngine {
        right: u32,
        bottom: u32,
        calls: usize,
    }

    impl RegionEngine {
        fn top_left_quarter() -> Self {
            Self {
                right: MODEL_INPUT_SIZE / 2,
                bottom: MODEL_INPUT_SIZE / 2,
                calls: 0,
            }
        }
    }

    impl InferenceEngine for RegionEngine {
        fn run(&mut self, input: &NormalizedTensor) -> Result<MaskTensor, SegmentationError> {
            assert_eq!(input.shape(), &[1, 3, 512, 512]);
            self.calls += 1;

            let size = MODEL_INPUT_SIZE;
            let scores = (0..size * size)
                .map(|i| {
                    let (x, y) = (i % size, i / size);
                    if x < self.right && y < self.bottom {
                        0.9
                    } else {
                        0.1
                    }
                })
                .collect();
            Ok(MaskTensor::new(scores, size, size)?)
        }
    }

    struct BrokenEngine;

    impl InferenceEngine for BrokenEngine {
        fn run(&mut self, _input: &NormalizedTensor) -> Result<MaskTensor, SegmentationError> {
            Err(SegmentationError::Run("device lost".into()))
        }
    }

    fn frame(width: u32, height: u32) -> RgbaImage {
        RgbaImage::from_fn(width, height, |x, y| {
            Rgba([(x * 40 % 256) as u8, (y * 40 % 256) as u8, 128, 255])
        })
    }

    #[test]
    fn segments_top_left_block_of_small_frame() {
        let mut segmenter = Segmenter::new(RegionEngine::top_left_quarter());
        let source = frame(4, 4);

        let mask = segmenter.segment_frame(&source).unwrap();

        assert_eq!(mask.dimensions(), (4, 4));
        for (x, y, pixel) in mask.enumerate_pixels() {
            let expected = if x < 2 && y < 2 { 255 } else { 0 };
            assert_eq!(pixel[3], expected, "pixel ({x}, {y})");
        }

        let composited = apply_mask(&source, &mask).unwrap();
        let (body, rect) = crop_by_alpha(&composited).unwrap();
        assert_eq!(
            rect,
            CropRect {
                x: 0,
                y: 0,
                width: 2,
                height: 2
            }
        );
        assert_eq!(body.get_pixel(1, 1), source.get_pixel(1, 1));
    }

    #[test]
    fn failed_inference_yields_none() {
        let mut segmenter = Segmenter::new(BrokenEngine);
        assert!(segmenter.segment_frame(&frame(4, 4)).is_none());
        assert!(matches!(
            segmenter.try_segment_frame(&frame(4, 4)),
            Err(SegmentationError::Run(_))
        ));
    }

    #[test]
    fn square_padding_maps_mask_back_to_frame() {
        // Foreground is the left half of the padded square
        let engine = RegionEngine {
            right: MODEL_INPUT_SIZE / 2,
            bottom: MODEL_INPUT_SIZE,
            calls: 0,
        };
        let mut segmenter = Segmenter::new(engine).with_square_padding(true);

        // 8x4 pads to 8x8 with the frame on rows 2..6
        let mask = segmenter.segment_frame(&frame(8, 4)).unwrap();

        assert_eq!(mask.dimensions(), (8, 4));
        for (x, _, pixel) in mask.enumerate_pixels() {
            assert_eq!(pixel[3], if x < 4 { 255 } else { 0 });
        }
        assert_eq!(segmenter.engine.calls, 1);
    }

    #[test]
    fn segment_image_crops_to_foreground() {
        let mut segmenter = Segmenter::new(RegionEngine::top_left_quarter());

        let result = segmenter.segment_image(frame(100, 125)).unwrap();

        assert_eq!(result.full_size_body.dimensions(), (WORKING_WIDTH, WORKING_HEIGHT));
        assert_eq!(result.crop_rect.x, 0);
        assert_eq!(result.crop_rect.y, 0);
        assert_eq!(result.crop_rect.width, WORKING_WIDTH / 2);
        assert_eq!(result.crop_rect.height, WORKING_HEIGHT / 2);
        assert_eq!(
            result.body.dimensions(),
            (result.crop_rect.width, result.crop_rect.height)
        );
    }

    #[test]
    fn segment_image_without_foreground_is_an_error() {
        let engine = RegionEngine {
            right: 0,
            bottom: 0,
            calls: 0,
        };
        let mut segmenter = Segmenter::new(engine);

        assert!(matches!(
            segmenter.segment_image(frame(64, 80)),
            Err(SegmentationError::NoForeground)
        ));
    }
}
