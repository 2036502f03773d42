use crate::error::ImageError;
use image::{imageops, Rgba, RgbaImage};

/// Tight bounding box of the visible pixels of an image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Keep `image` where `mask` is opaque and clear it where `mask` is
/// transparent (destination-in compositing).
///
/// Resulting alpha is `image.alpha * mask.alpha / 255`, rounded; colour is
/// kept wherever that alpha remains non-zero.
pub fn apply_mask(image: &RgbaImage, mask: &RgbaImage) -> Result<RgbaImage, ImageError> {
    if image.dimensions() != mask.dimensions() {
        return Err(ImageError::SizeMismatch {
            image_width: image.width(),
            image_height: image.height(),
            mask_width: mask.width(),
            mask_height: mask.height(),
        });
    }

    let mut result = image.clone();
    for (pixel, mask_pixel) in result.pixels_mut().zip(mask.pixels()) {
        let alpha = (u16::from(pixel[3]) * u16::from(mask_pixel[3]) + 127) / 255;
        *pixel = if alpha == 0 {
            Rgba([0, 0, 0, 0])
        } else {
            Rgba([pixel[0], pixel[1], pixel[2], alpha as u8])
        };
    }

    Ok(result)
}

/// Crop an image to its visible pixels.
///
/// Returns `None` for a fully transparent image; callers decide what an
/// empty result means for them.
pub fn crop_by_alpha(image: &RgbaImage) -> Option<(RgbaImage, CropRect)> {
    let (width, height) = image.dimensions();

    let mut min_x = width;
    let mut min_y = height;
    let mut max_x = 0;
    let mut max_y = 0;
    let mut found = false;

    for (x, y, pixel) in image.enumerate_pixels() {
        if pixel[3] > 0 {
            found = true;
            min_x = min_x.min(x);
            max_x = max_x.max(x);
            min_y = min_y.min(y);
            max_y = max_y.max(y);
        }
    }

    if !found {
        return None;
    }

    let rect = CropRect {
        x: min_x,
        y: min_y,
        width: max_x - min_x + 1,
        height: max_y - min_y + 1,
    };
    tracing::debug!("Crop rect {:?}", rect);

    let cropped = imageops::crop_imm(image, rect.x, rect.y, rect.width, rect.height).to_image();
    Some((cropped, rect))
}
