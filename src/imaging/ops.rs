use crate::error::ImageError;
use image::imageops::{self, FilterType};
use image::{Rgba, RgbaImage};

/// Nominal working canvas for still images (width, height)
pub const WORKING_WIDTH: u32 = 1000;
pub const WORKING_HEIGHT: u32 = 1250;

const PAD_COLOR: Rgba<u8> = Rgba([0, 0, 0, 255]);

pub(crate) fn ensure_area(width: u32, height: u32) -> Result<(), ImageError> {
    if width == 0 || height == 0 {
        return Err(ImageError::InvalidDimension { width, height });
    }
    Ok(())
}

/// Resample to exactly `width x height` with bilinear filtering.
///
/// Hands the input buffer back untouched when it already has the target size.
pub fn scale_to_fit(image: RgbaImage, width: u32, height: u32) -> Result<RgbaImage, ImageError> {
    scale_to_fit_with(image, width, height, FilterType::Triangle)
}

/// Like [`scale_to_fit`] with an explicit filter. Masks use `Nearest` so
/// every output pixel is a copy of an input pixel.
pub fn scale_to_fit_with(
    image: RgbaImage,
    width: u32,
    height: u32,
    filter: FilterType,
) -> Result<RgbaImage, ImageError> {
    ensure_area(image.width(), image.height())?;
    ensure_area(width, height)?;

    if image.dimensions() == (width, height) {
        return Ok(image);
    }

    Ok(imageops::resize(&image, width, height, filter))
}

/// Pad to a square canvas filled with opaque black, centring the image
/// along its shorter axis. Square input is returned as is.
pub fn pad_to_square(image: RgbaImage) -> Result<RgbaImage, ImageError> {
    let (width, height) = image.dimensions();
    ensure_area(width, height)?;

    if width == height {
        return Ok(image);
    }

    let side = width.max(height);
    let offset = i64::from((side - width.min(height)) / 2);
    let (x, y) = if width > height { (0, offset) } else { (offset, 0) };

    let mut canvas = RgbaImage::from_pixel(side, side, PAD_COLOR);
    imageops::overlay(&mut canvas, &image, x, y);

    Ok(canvas)
}

/// Fit an image into a `target_width x target_height` canvas preserving
/// aspect ratio.
///
/// Images at least as wide as they are tall are fitted to the canvas width,
/// taller ones to its height. The scaled content is centred along the other
/// axis; uncovered canvas pixels stay transparent black and content that
/// overflows the canvas is clipped.
pub fn fit_with_letterbox(
    image: &RgbaImage,
    target_width: u32,
    target_height: u32,
) -> Result<RgbaImage, ImageError> {
    let _span = tracing::debug_span!("letterbox").entered();

    let (width, height) = image.dimensions();
    ensure_area(width, height)?;
    ensure_area(target_width, target_height)?;

    // Integer math keeps the truncation exact
    let (content_width, content_height) = if width >= height {
        let scaled = u64::from(height) * u64::from(target_width) / u64::from(width);
        (target_width, clamp_u32(scaled))
    } else {
        let scaled = u64::from(width) * u64::from(target_height) / u64::from(height);
        (clamp_u32(scaled), target_height)
    };
    ensure_area(content_width, content_height)?;

    let content = imageops::resize(image, content_width, content_height, FilterType::Triangle);

    let x = (i64::from(target_width) - i64::from(content_width)) / 2;
    let y = (i64::from(target_height) - i64::from(content_height)) / 2;

    let mut canvas = RgbaImage::new(target_width, target_height);
    imageops::replace(&mut canvas, &content, x, y);

    Ok(canvas)
}

fn clamp_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

/// Cheap size reduction applied to decoded stills before letterboxing.
///
/// Halves the image repeatedly while both sides are still at least the
/// working bound (1000 for landscape images, 1250 otherwise).
pub fn decode_downscale(image: RgbaImage) -> Result<RgbaImage, ImageError> {
    let (width, height) = image.dimensions();
    ensure_area(width, height)?;

    let bound = if width > height {
        WORKING_WIDTH
    } else {
        WORKING_HEIGHT
    };

    let mut sample = 1u32;
    while width / sample >= bound && height / sample >= bound {
        sample *= 2;
    }

    if sample == 1 {
        return Ok(image);
    }

    tracing::debug!(
        "Downscaling {}x{} by {} for decode",
        width,
        height,
        sample
    );
    scale_to_fit(image, width / sample, height / sample)
}

/// Replace every pixel that is not fully zero with `color`
pub fn recolor_visible(image: &RgbaImage, color: Rgba<u8>) -> RgbaImage {
    let mut recolored = image.clone();
    for pixel in recolored.pixels_mut() {
        if pixel.0 != [0, 0, 0, 0] {
            *pixel = color;
        }
    }
    recolored
}
