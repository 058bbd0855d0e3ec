//! Page preprocessing ahead of contour extraction
//!
//! Contrast stretching, median denoising, Otsu binarization and morphological
//! closing. Output masks are white (255) where ink is present.

use image::{GrayImage, Luma};
use imageproc::contrast::{otsu_level, threshold, ThresholdType};
use imageproc::distance_transform::Norm;
use imageproc::filter::median_filter;
use imageproc::morphology::close;
use tracing::debug;

use crate::config::ContourConfig;

/// Binary ink mask plus the threshold that produced it
pub struct PreprocessResult {
    /// 255 = ink, 0 = background
    pub mask: GrayImage,
    /// Enhanced grayscale page the mask was derived from
    pub enhanced: GrayImage,
    /// Otsu threshold on the enhanced image
    pub level: u8,
}

/// Run the full preprocessing chain on a grayscale page
pub fn preprocess_page(gray: &GrayImage, config: &ContourConfig) -> PreprocessResult {
    let mut enhanced = if config.enhance_contrast {
        stretch_contrast(gray)
    } else {
        gray.clone()
    };

    if config.denoise_radius > 0 && gray.width() > 2 && gray.height() > 2 {
        enhanced = median_filter(&enhanced, config.denoise_radius, config.denoise_radius);
    }

    let level = otsu_level(&enhanced);
    let mut mask = binarize(&enhanced, level);

    if config.remove_speckles {
        mask = remove_speckles(&mask);
    }

    if config.closing_radius > 0 {
        mask = close(&mask, Norm::LInf, config.closing_radius);
    }

    debug!(
        "Preprocessed {}x{} page: otsu level {}, contrast={}, denoise={}, speckles={}, closing={}",
        gray.width(),
        gray.height(),
        level,
        config.enhance_contrast,
        config.denoise_radius,
        config.remove_speckles,
        config.closing_radius
    );

    PreprocessResult {
        mask,
        enhanced,
        level,
    }
}

/// Ink mask for dark-on-light drawings
pub fn binarize(gray: &GrayImage, level: u8) -> GrayImage {
    // Uniform pages have no ink at all
    let (min, max) = min_max(gray);
    if max.saturating_sub(min) < 16 {
        return GrayImage::new(gray.width(), gray.height());
    }
    threshold(gray, level, ThresholdType::BinaryInverted)
}

/// Clear ink pixels that have no 8-connected ink neighbour
pub fn remove_speckles(mask: &GrayImage) -> GrayImage {
    let (w, h) = mask.dimensions();
    let mut out = mask.clone();
    for y in 0..h {
        for x in 0..w {
            if mask.get_pixel(x, y).0[0] == 0 {
                continue;
            }
            let has_neighbour = neighbours8(x, y, w, h).any(|(nx, ny)| mask.get_pixel(nx, ny).0[0] > 0);
            if !has_neighbour {
                out.put_pixel(x, y, Luma([0]));
            }
        }
    }
    out
}

/// In-bounds 8-neighbourhood of (x, y)
pub fn neighbours8(x: u32, y: u32, w: u32, h: u32) -> impl Iterator<Item = (u32, u32)> {
    const OFFSETS: [(i64, i64); 8] = [(-1, -1), (0, -1), (1, -1), (-1, 0), (1, 0), (-1, 1), (0, 1), (1, 1)];
    OFFSETS.iter().filter_map(move |&(dx, dy)| {
        let nx = x as i64 + dx;
        let ny = y as i64 + dy;
        if nx >= 0 && ny >= 0 && nx < w as i64 && ny < h as i64 {
            Some((nx as u32, ny as u32))
        } else {
            None
        }
    })
}

/// Linear stretch of the intensity range to [0, 255]
pub fn stretch_contrast(gray: &GrayImage) -> GrayImage {
    let (min, max) = min_max(gray);
    if max <= min {
        return gray.clone();
    }

    let scale = 255.0 / (max - min) as f32;
    let mut out = gray.clone();
    for pixel in out.pixels_mut() {
        let v = ((pixel.0[0] - min) as f32 * scale).round().clamp(0.0, 255.0);
        *pixel = Luma([v as u8]);
    }
    out
}

fn min_max(gray: &GrayImage) -> (u8, u8) {
    gray.pixels().fold((u8::MAX, u8::MIN), |(lo, hi), p| {
        (lo.min(p.0[0]), hi.max(p.0[0]))
    })
}

/// Count of ink pixels in a mask
pub fn ink_count(mask: &GrayImage) -> usize {
    mask.pixels().filter(|p| p.0[0] > 127).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use imageproc::drawing::draw_filled_rect_mut;
    use imageproc::rect::Rect;

    #[test]
    fn test_stretch_contrast() {
        let mut img = GrayImage::from_pixel(4, 1, Luma([100]));
        img.put_pixel(0, 0, Luma([50]));
        img.put_pixel(3, 0, Luma([150]));

        let out = stretch_contrast(&img);
        assert_eq!(out.get_pixel(0, 0).0[0], 0);
        assert_eq!(out.get_pixel(3, 0).0[0], 255);
        assert_eq!(out.get_pixel(1, 0).0[0], 128);
    }

    #[test]
    fn test_remove_speckles_keeps_lines() {
        let mut mask = GrayImage::new(20, 20);
        mask.put_pixel(2, 2, Luma([255]));
        for x in 5..15 {
            mask.put_pixel(x, 10, Luma([255]));
        }

        let cleaned = remove_speckles(&mask);
        assert_eq!(cleaned.get_pixel(2, 2).0[0], 0);
        assert_eq!(ink_count(&cleaned), 10);
    }

    #[test]
    fn test_uniform_page_has_no_ink() {
        let img = GrayImage::from_pixel(50, 50, Luma([240]));
        let result = preprocess_page(&img, &ContourConfig::default());
        assert_eq!(ink_count(&result.mask), 0);
    }

    #[test]
    fn test_default_keeps_thin_strokes_and_drops_noise() {
        let mut img = GrayImage::from_pixel(60, 60, Luma([250]));
        for x in 10..50 {
            img.put_pixel(x, 30, Luma([10]));
        }
        for (x, y) in [(5, 5), (52, 10), (20, 50)] {
            img.put_pixel(x, y, Luma([10]));
        }

        let result = preprocess_page(&img, &ContourConfig::default());
        assert_eq!(result.mask.get_pixel(30, 30).0[0], 255);
        assert_eq!(result.mask.get_pixel(5, 5).0[0], 0);
        assert_eq!(result.mask.get_pixel(52, 10).0[0], 0);

        let median = ContourConfig {
            denoise_radius: 1,
            ..ContourConfig::default()
        };
        assert_eq!(ink_count(&preprocess_page(&img, &median).mask), 0);
    }

    #[test]
    fn test_dark_shape_becomes_ink() {
        let mut img = GrayImage::from_pixel(60, 60, Luma([250]));
        draw_filled_rect_mut(&mut img, Rect::at(10, 10).of_size(20, 20), Luma([10]));

        let result = preprocess_page(&img, &ContourConfig::default());
        assert_eq!(result.mask.get_pixel(20, 20).0[0], 255);
        assert_eq!(result.mask.get_pixel(50, 50).0[0], 0);
        let ink = ink_count(&result.mask);
        assert!(ink >= 350 && ink <= 450, "ink pixels: {}", ink);
    }
}
