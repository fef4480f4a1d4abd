use image::ImageFormat;

use crate::rvl;
use crate::MediaError;

/// A decoded 16-bit depth image in row-major order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepthImage {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u16>,
}

/// Largest depth frame accepted from a packed header (4096 x 4096)
pub const MAX_DEPTH_PIXELS: usize = 4096 * 4096;

impl DepthImage {
    /// `width * height`, or `None` if it overflows or exceeds [`MAX_DEPTH_PIXELS`]
    pub fn pixel_count(width: u32, height: u32) -> Option<usize> {
        (width as usize)
            .checked_mul(height as usize)
            .filter(|&n| n <= MAX_DEPTH_PIXELS)
    }

    /// Decode an RVL stream holding exactly `width * height` samples
    pub fn from_rvl(width: u32, height: u32, encoded: &[u8]) -> Result<Self, MediaError> {
        let pixels = Self::pixel_count(width, height)
            .ok_or(MediaError::DepthDimensions { width, height })?;
        let data = rvl::decode(encoded, pixels)?;
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// Decode a grayscale PNG; 8-bit images are widened to 16 bits
    pub fn from_png(bytes: &[u8]) -> Result<Self, MediaError> {
        let image = image::load_from_memory_with_format(bytes, ImageFormat::Png)?;
        let luma = image.to_luma16();
        let (width, height) = luma.dimensions();
        Ok(Self {
            width,
            height,
            data: luma.into_raw(),
        })
    }

    pub fn to_rvl(&self) -> Vec<u8> {
        rvl::encode(&self.data)
    }

    /// Depth at (x, y), `None` outside the image
    pub fn get(&self, x: u32, y: u32) -> Option<u16> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.data.get(y as usize * self.width as usize + x as usize).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Luma};
    use std::io::Cursor;

    fn png_bytes(width: u32, height: u32, data: Vec<u16>) -> Vec<u8> {
        let buffer: ImageBuffer<Luma<u16>, Vec<u16>> =
            ImageBuffer::from_raw(width, height, data).unwrap();
        let mut out = Cursor::new(Vec::new());
        buffer.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_png_depth() {
        let data: Vec<u16> = (0..12).map(|i| i * 1000).collect();
        let depth = DepthImage::from_png(&png_bytes(4, 3, data.clone())).unwrap();
        assert_eq!((depth.width, depth.height), (4, 3));
        assert_eq!(depth.data, data);
        assert_eq!(depth.get(3, 2), Some(11_000));
        assert_eq!(depth.get(4, 0), None);
    }

    #[test]
    fn test_rvl_depth() {
        let depth = DepthImage {
            width: 3,
            height: 2,
            data: vec![0, 500, 501, 0, 0, 900],
        };
        let decoded = DepthImage::from_rvl(3, 2, &depth.to_rvl()).unwrap();
        assert_eq!(decoded, depth);
    }

    #[test]
    fn test_rvl_dimension_mismatch() {
        let depth = DepthImage {
            width: 2,
            height: 2,
            data: vec![1, 2, 3, 4],
        };
        assert!(DepthImage::from_rvl(4, 4, &depth.to_rvl()).is_err());
    }

    #[test]
    fn test_rvl_oversized_dimensions() {
        let encoded = rvl::encode(&[1, 2, 3, 4]);
        assert!(matches!(
            DepthImage::from_rvl(u32::MAX, u32::MAX, &encoded),
            Err(MediaError::DepthDimensions { .. })
        ));
        assert!(matches!(
            DepthImage::from_rvl(65536, 65536, &encoded),
            Err(MediaError::DepthDimensions { .. })
        ));
        assert_eq!(DepthImage::pixel_count(4096, 4096), Some(MAX_DEPTH_PIXELS));
        assert_eq!(DepthImage::pixel_count(4097, 4096), None);
    }

    #[test]
    fn test_garbage_png() {
        assert!(matches!(
            DepthImage::from_png(b"\x89PNG\r\n\x1a\nnope"),
            Err(MediaError::Image(_))
        ));
    }
}
