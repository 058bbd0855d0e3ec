//! Page raster decoding

use image::GrayImage;
use tracing::{debug, warn};

use crate::error::{DetectionError, Result};

/// A decoded page, grayscale, owned by one detection pass
#[derive(Debug, Clone)]
pub struct PageImage {
    /// Grayscale pixels (dark ink on light paper)
    pub gray: GrayImage,
    /// Page width in pixels
    pub width: u32,
    /// Page height in pixels
    pub height: u32,
    /// Size of the encoded input buffer
    pub buffer_len: usize,
    /// The buffer was not a known image format and was read as raw 8-bit pixels
    pub raw_raster_fallback: bool,
}

impl PageImage {
    /// Decode an encoded page image (PNG, JPEG, ...)
    ///
    /// An empty buffer is structurally invalid. A non-empty buffer that no
    /// decoder recognises is interpreted as a raw 8-bit grayscale raster so the
    /// pipeline can still run in degraded mode.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Err(DetectionError::ImageProcessing(
                "empty image buffer".to_string(),
            ));
        }

        match image::load_from_memory(bytes) {
            Ok(img) => {
                let gray = img.to_luma8();
                let (width, height) = gray.dimensions();
                if width == 0 || height == 0 {
                    return Err(DetectionError::ImageProcessing(format!(
                        "decoded image has zero dimension {}x{}",
                        width, height
                    )));
                }
                debug!("Decoded {}x{} page from {} bytes", width, height, bytes.len());
                Ok(Self {
                    gray,
                    width,
                    height,
                    buffer_len: bytes.len(),
                    raw_raster_fallback: false,
                })
            }
            Err(e) => {
                warn!(
                    "Buffer of {} bytes is not a decodable image ({}), reading as raw raster",
                    bytes.len(),
                    e
                );
                Self::from_raw_raster(bytes)
            }
        }
    }

    /// Interpret bytes as a row-major grayscale raster, as square as possible
    fn from_raw_raster(bytes: &[u8]) -> Result<Self> {
        let width = ((bytes.len() as f64).sqrt().floor() as u32).max(1);
        let height = (bytes.len() as u32 / width).max(1);
        let needed = (width * height) as usize;

        let gray = GrayImage::from_raw(width, height, bytes[..needed].to_vec()).ok_or_else(|| {
            DetectionError::ImageProcessing(format!(
                "cannot build {}x{} raster from {} bytes",
                width,
                height,
                bytes.len()
            ))
        })?;

        Ok(Self {
            gray,
            width,
            height,
            buffer_len: bytes.len(),
            raw_raster_fallback: true,
        })
    }

    /// Wrap an already decoded grayscale page
    pub fn from_gray(gray: GrayImage) -> Self {
        let (width, height) = gray.dimensions();
        let buffer_len = gray.as_raw().len();
        Self {
            gray,
            width,
            height,
            buffer_len,
            raw_raster_fallback: false,
        }
    }

    /// Get page dimensions as (width, height)
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn pixel_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Luma};
    use std::io::Cursor;

    #[test]
    fn test_empty_buffer_is_error() {
        let result = PageImage::decode(&[]);
        assert!(matches!(result, Err(DetectionError::ImageProcessing(_))));
    }

    #[test]
    fn test_decode_png() {
        let img = GrayImage::from_pixel(40, 20, Luma([200]));
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png).unwrap();

        let page = PageImage::decode(&bytes).unwrap();
        assert_eq!(page.dimensions(), (40, 20));
        assert!(!page.raw_raster_fallback);
        assert_eq!(page.gray.get_pixel(3, 3).0[0], 200);
    }

    #[test]
    fn test_undecodable_buffer_becomes_raw_raster() {
        let bytes = vec![0u8; 10_000];
        let page = PageImage::decode(&bytes).unwrap();
        assert!(page.raw_raster_fallback);
        assert_eq!(page.dimensions(), (100, 100));
        assert_eq!(page.buffer_len, 10_000);
    }
}
