//! Candidate shape extraction
//!
//! Turns a page into a filtered, position-ordered list of outer contours.
//! When nothing survives filtering a fixed placeholder set is returned and
//! flagged so callers can tell a degraded result from an empty page.

use image::GrayImage;
use imageproc::contours::{find_contours, BorderType};
use imageproc::geometry::{arc_length, contour_area};
use imageproc::point::Point as PixelPoint;
use std::time::Instant;
use tracing::{debug, warn};

use crate::config::ContourConfig;
use crate::types::{BoundingBox, Contour, Point};
use crate::vision::frame::PageImage;
use crate::vision::preprocess::{preprocess_page, PreprocessResult};

/// Placeholder boxes as (x, y, w, h) fractions of the page, used in degraded mode
const FALLBACK_LAYOUT: [(f64, f64, f64, f64); 5] = [
    (0.05, 0.05, 0.30, 0.10),
    (0.55, 0.05, 0.15, 0.20),
    (0.05, 0.45, 0.20, 0.20),
    (0.50, 0.45, 0.30, 0.40),
    (0.10, 0.80, 0.25, 0.12),
];

/// Output of contour extraction
#[derive(Debug, Clone)]
pub struct ContourExtraction {
    /// Ordered top-to-bottom, then left-to-right
    pub contours: Vec<Contour>,
    /// Ink mask the contours were traced on
    pub mask: GrayImage,
    /// Outer contours found before filtering
    pub raw_count: usize,
    /// Placeholder contours were substituted
    pub fallback: bool,
}

/// Extracts candidate symbol outlines from page images
#[derive(Debug, Clone)]
pub struct ContourExtractor {
    config: ContourConfig,
}

impl ContourExtractor {
    pub fn new(config: ContourConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ContourConfig {
        &self.config
    }

    /// Preprocess the page and extract filtered contours
    pub fn extract(&self, page: &PageImage) -> ContourExtraction {
        let start = Instant::now();
        let PreprocessResult { mask, .. } = preprocess_page(&page.gray, &self.config);

        let (mut contours, raw_count) = self.contours_from_mask(&mask);
        let fallback = contours.is_empty();
        if fallback {
            warn!(
                "No contours survived filtering ({} raw) on {}x{} page, using placeholder set",
                raw_count, page.width, page.height
            );
            contours = fallback_contours(page.width, page.height);
        }

        debug!(
            "Contour extraction complete in {:?}: {} of {} kept",
            start.elapsed(),
            contours.len(),
            raw_count
        );

        ContourExtraction {
            contours,
            mask,
            raw_count,
            fallback,
        }
    }

    /// Trace and filter outer contours on a binary ink mask
    pub fn contours_from_mask(&self, mask: &GrayImage) -> (Vec<Contour>, usize) {
        let traced = find_contours::<i32>(mask);
        let outer: Vec<_> = traced
            .into_iter()
            .filter(|c| c.border_type == BorderType::Outer && !c.points.is_empty())
            .collect();
        let raw_count = outer.len();

        let mut kept: Vec<Contour> = outer
            .iter()
            .map(|c| to_contour(&c.points))
            .filter(|c| self.accepts(c))
            .collect();

        // Largest first when capping, then restore reading order
        kept.sort_by(|a, b| {
            b.bounding_box
                .area()
                .partial_cmp(&a.bounding_box.area())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        kept.truncate(self.config.max_contours);
        kept.sort_by(|a, b| {
            (a.bounding_box.y, a.bounding_box.x)
                .partial_cmp(&(b.bounding_box.y, b.bounding_box.x))
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        (kept, raw_count)
    }

    /// Size, aspect and solidity window
    pub fn accepts(&self, contour: &Contour) -> bool {
        let bbox_area = contour.bounding_box.area();
        if bbox_area < self.config.min_area || bbox_area > self.config.max_area {
            return false;
        }

        let aspect = contour.bounding_box.aspect_ratio();
        if aspect < self.config.min_aspect_ratio || aspect > self.config.max_aspect_ratio {
            return false;
        }

        solidity(contour) >= self.config.min_solidity
    }
}

/// Contour area relative to its bounding box
pub fn solidity(contour: &Contour) -> f64 {
    let bbox_area = contour.bounding_box.area();
    if bbox_area <= f64::EPSILON {
        0.0
    } else {
        (contour.area / bbox_area).min(1.0)
    }
}

/// Union of every outer outline on a mask, for multi-part shapes.
/// `None` when the mask has no ink.
pub fn combined_outline(mask: &GrayImage) -> Option<Contour> {
    let outlines: Vec<Contour> = find_contours::<i32>(mask)
        .into_iter()
        .filter(|c| c.border_type == BorderType::Outer && !c.points.is_empty())
        .map(|c| to_contour(&c.points))
        .collect();
    if outlines.is_empty() {
        return None;
    }

    let points: Vec<Point> = outlines.iter().flat_map(|c| c.points.iter().copied()).collect();
    Some(Contour {
        bounding_box: BoundingBox::from_points(&points),
        area: outlines.iter().map(|c| c.area).sum(),
        perimeter: outlines.iter().map(|c| c.perimeter).sum(),
        points,
    })
}

pub(crate) fn to_contour(pixels: &[PixelPoint<i32>]) -> Contour {
    let points: Vec<Point> = pixels
        .iter()
        .map(|p| Point::new(p.x as f64, p.y as f64))
        .collect();
    let bounding_box = BoundingBox::from_points(&points);
    let area = if pixels.len() >= 3 {
        contour_area(pixels).abs()
    } else {
        0.0
    };
    let perimeter = arc_length(pixels, true);

    Contour {
        points,
        bounding_box,
        area,
        perimeter,
    }
}

/// Deterministic placeholder contours scaled to the page
pub fn fallback_contours(width: u32, height: u32) -> Vec<Contour> {
    let (w, h) = (width as f64, height as f64);
    FALLBACK_LAYOUT
        .iter()
        .map(|&(fx, fy, fw, fh)| {
            let bw = (fw * w).clamp(10.0, 200.0);
            let bh = (fh * h).clamp(10.0, 150.0);
            let x = (fx * w).min((w - bw).max(0.0));
            let y = (fy * h).min((h - bh).max(0.0));
            let points = vec![
                Point::new(x, y),
                Point::new(x + bw - 1.0, y),
                Point::new(x + bw - 1.0, y + bh - 1.0),
                Point::new(x, y + bh - 1.0),
            ];
            Contour {
                bounding_box: BoundingBox::from_points(&points),
                area: (bw - 1.0) * (bh - 1.0),
                perimeter: 2.0 * (bw + bh - 2.0),
                points,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;
    use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};
    use imageproc::rect::Rect;

    fn page_with(draw: impl Fn(&mut GrayImage)) -> PageImage {
        let mut img = GrayImage::from_pixel(300, 200, Luma([255]));
        draw(&mut img);
        PageImage::from_gray(img)
    }

    #[test]
    fn test_extracts_drawn_shapes_in_reading_order() {
        let page = page_with(|img| {
            draw_hollow_rect_mut(img, Rect::at(150, 20).of_size(60, 24), Luma([0]));
            draw_filled_rect_mut(img, Rect::at(20, 30).of_size(30, 30), Luma([0]));
            draw_hollow_rect_mut(img, Rect::at(40, 120).of_size(80, 50), Luma([0]));
        });

        let extraction = ContourExtractor::new(ContourConfig::default()).extract(&page);
        assert!(!extraction.fallback);
        assert_eq!(extraction.contours.len(), 3);

        let first = &extraction.contours[0].bounding_box;
        assert!((first.x - 150.0).abs() <= 2.0, "first box {:?}", first);
        assert!(extraction.contours[2].bounding_box.y > 100.0);
    }

    #[test]
    fn test_filters_tiny_and_huge_shapes() {
        let page = page_with(|img| {
            draw_filled_rect_mut(img, Rect::at(10, 10).of_size(4, 4), Luma([0]));
            draw_filled_rect_mut(img, Rect::at(100, 100).of_size(30, 30), Luma([0]));
        });

        let extraction = ContourExtractor::new(ContourConfig::default()).extract(&page);
        assert_eq!(extraction.contours.len(), 1);
        assert_eq!(extraction.raw_count, 2);
    }

    #[test]
    fn test_thin_lines_fail_solidity() {
        let page = page_with(|img| {
            // A diagonal-ish step line has a tiny enclosed area relative to its box
            for i in 0..80 {
                img.put_pixel(20 + i, 20 + i / 2, Luma([0]));
            }
        });
        let extraction = ContourExtractor::new(ContourConfig::default()).extract(&page);
        assert!(extraction.fallback);
    }

    #[test]
    fn test_blank_page_uses_fallback() {
        let page = page_with(|_| {});
        let extraction = ContourExtractor::new(ContourConfig::default()).extract(&page);
        assert!(extraction.fallback);
        assert_eq!(extraction.contours.len(), FALLBACK_LAYOUT.len());
        for c in &extraction.contours {
            assert!(c.bounding_box.right() <= 300.0);
            assert!(c.bounding_box.bottom() <= 200.0);
        }
    }

    #[test]
    fn test_combined_outline_spans_all_parts() {
        let mut mask = GrayImage::new(100, 60);
        draw_filled_rect_mut(&mut mask, Rect::at(10, 10).of_size(10, 40), Luma([255]));
        draw_filled_rect_mut(&mut mask, Rect::at(30, 10).of_size(10, 40), Luma([255]));

        let outline = combined_outline(&mask).unwrap();
        assert_eq!(outline.bounding_box, BoundingBox::new(10.0, 10.0, 30.0, 40.0));
        assert!(combined_outline(&GrayImage::new(10, 10)).is_none());
    }

    #[test]
    fn test_fallback_is_deterministic() {
        assert_eq!(fallback_contours(640, 480), fallback_contours(640, 480));
    }
}
