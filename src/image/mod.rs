//! Image containers for depth, uncertainty and colour frames

pub mod pooling;

pub use pooling::{PoolingImage, PoolingValue};

use bytemuck::{Pod, Zeroable};

/// Row-major 2D image
#[derive(Clone, Debug)]
pub struct Image<T> {
    width: u32,
    height: u32,
    data: Vec<T>,
}

impl<T: Clone> Image<T> {
    /// Create an image filled with a single value
    pub fn new(width: u32, height: u32, fill: T) -> Self {
        Self {
            width,
            height,
            data: vec![fill; (width * height) as usize],
        }
    }

    /// Create an image from existing pixel data. `data` must contain exactly
    /// `width * height` elements.
    pub fn from_data(width: u32, height: u32, data: Vec<T>) -> Self {
        assert_eq!(data.len(), (width * height) as usize);
        Self { width, height, data }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Pixel access without bounds checking beyond the debug assert
    pub fn get(&self, x: u32, y: u32) -> &T {
        debug_assert!(x < self.width && y < self.height);
        &self.data[(y * self.width + x) as usize]
    }

    pub fn get_mut(&mut self, x: u32, y: u32) -> &mut T {
        debug_assert!(x < self.width && y < self.height);
        &mut self.data[(y * self.width + x) as usize]
    }

    /// Whether integer pixel coordinates lie strictly inside the image
    pub fn in_bounds(&self, x: i32, y: i32) -> bool {
        x >= 0 && y >= 0 && (x as u32) < self.width && (y as u32) < self.height
    }

    pub fn pixels(&self) -> &[T] {
        &self.data
    }
}

/// 8-bit RGB pixel
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

/// Round a sub-pixel projection to the nearest integer pixel
pub fn round_pixel(p: glam::Vec2) -> glam::IVec2 {
    glam::IVec2::new(p.x.round() as i32, p.y.round() as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_access() {
        let mut img = Image::new(4, 3, 0.0f32);
        *img.get_mut(3, 2) = 7.5;
        assert_eq!(*img.get(3, 2), 7.5);
        assert_eq!(*img.get(0, 0), 0.0);
        assert!(img.in_bounds(3, 2));
        assert!(!img.in_bounds(4, 0));
        assert!(!img.in_bounds(-1, 0));
    }

    #[test]
    fn test_round_pixel() {
        let p = round_pixel(glam::Vec2::new(1.4, 2.6));
        assert_eq!(p, glam::IVec2::new(1, 3));
    }
}
