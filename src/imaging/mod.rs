mod compositor;
mod ops;

pub use compositor::{apply_mask, crop_by_alpha, CropRect};
pub use ops::{
    decode_downscale, fit_with_letterbox, pad_to_square, recolor_visible, scale_to_fit,
    scale_to_fit_with, WORKING_HEIGHT, WORKING_WIDTH,
};

pub(crate) use ops::ensure_area;
