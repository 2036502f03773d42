use image::RgbaImage;

/// An image stamped with its presentation time
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: RgbaImage,
    pub timestamp_us: u64,
}

impl Frame {
    pub fn new(image: RgbaImage, timestamp_us: u64) -> Self {
        Self {
            image,
            timestamp_us,
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}
