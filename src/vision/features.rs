//! Per-region feature extraction
//!
//! Produces the fixed 44-value feature vector consumed by the ML ensemble and
//! the shape invariants used by the pattern matcher. The vector is split in
//! four groups:
//!
//! | group       | len | contents |
//! |-------------|-----|----------|
//! | geometric   | 17  | log area, log perimeter, aspect ratio, compactness, solidity, eccentricity, orientation, extent, convexity, horizontal/vertical symmetry, equivalent diameter, major axis, minor/major ratio, centroid dx/dy, fill ratio |
//! | visual      | 12  | mean, std, min, max intensity, contrast, edge density, log corners, log lines, entropy, homogeneity, gradient mean, log circles |
//! | topological | 8   | holes, endpoints, junctions, Euler number, log skeleton length, components, skeleton ratio, largest component ratio |
//! | contextual  | 7   | distance from page centre, local density, edge proximity, alignment, scale ratio, isolation, log connection count |
//!
//! Every value is z-scored against the fixed `*_MEAN` / `*_STD` tables and
//! clamped to [-5, 5]. When a group cannot be computed its mean row is used,
//! which normalizes to zeros, so extraction always returns a full vector.

use image::{GrayImage, Luma};
use imageproc::contours::{find_contours, BorderType};
use imageproc::corners::corners_fast9;
use imageproc::edges::canny;
use imageproc::geometry::{arc_length, contour_area, convex_hull};
use imageproc::gradients::sobel_gradients;
use imageproc::hough::{detect_lines, LineDetectionOptions};
use imageproc::point::Point as PixelPoint;
use imageproc::region_labelling::{connected_components, Connectivity};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use crate::types::{BoundingBox, GeometricProperties, Point};
use crate::vision::moments::Moments;
use crate::vision::preprocess::neighbours8;

pub const GEOMETRIC_LEN: usize = 17;
pub const VISUAL_LEN: usize = 12;
pub const TOPOLOGICAL_LEN: usize = 8;
pub const CONTEXTUAL_LEN: usize = 7;
pub const FEATURE_LEN: usize = GEOMETRIC_LEN + VISUAL_LEN + TOPOLOGICAL_LEN + CONTEXTUAL_LEN;

pub const GEOMETRIC_MEAN: [f32; GEOMETRIC_LEN] = [
    6.5, 5.0, 1.5, 0.35, 0.7, 0.7, 0.0, 0.5, 0.8, 0.6, 0.6, 0.6, 0.9, 0.5, 0.0, 0.0, 0.25,
];
pub const GEOMETRIC_STD: [f32; GEOMETRIC_LEN] = [
    1.5, 1.0, 1.5, 0.25, 0.2, 0.25, 0.9, 0.25, 0.2, 0.25, 0.25, 0.25, 0.4, 0.3, 0.1, 0.1, 0.2,
];
pub const VISUAL_MEAN: [f32; VISUAL_LEN] = [
    0.75, 0.3, 0.05, 0.95, 0.9, 0.2, 2.0, 1.0, 0.5, 0.7, 0.15, 0.3,
];
pub const VISUAL_STD: [f32; VISUAL_LEN] = [
    0.15, 0.1, 0.1, 0.1, 0.2, 0.1, 1.2, 0.8, 0.2, 0.15, 0.1, 0.5,
];
pub const TOPOLOGICAL_MEAN: [f32; TOPOLOGICAL_LEN] = [1.0, 4.0, 3.0, 0.5, 4.5, 1.5, 0.4, 0.85];
pub const TOPOLOGICAL_STD: [f32; TOPOLOGICAL_LEN] = [1.5, 3.0, 3.0, 2.0, 1.0, 1.5, 0.2, 0.2];
pub const CONTEXTUAL_MEAN: [f32; CONTEXTUAL_LEN] = [0.5, 0.1, 0.2, 0.2, 0.1, 0.15, 1.0];
pub const CONTEXTUAL_STD: [f32; CONTEXTUAL_LEN] = [0.25, 0.1, 0.15, 0.2, 0.08, 0.15, 0.8];

/// Hough line and circle summary of a region
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HoughSummary {
    pub line_count: usize,
    pub horizontal_lines: usize,
    pub vertical_lines: usize,
    /// Most voted line angle in degrees, 0 when no lines
    pub dominant_angle: f32,
    /// Inner contours with circularity above 0.75
    pub circle_count: usize,
}

/// Raw (un-normalized) feature groups
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureVector {
    pub geometric: [f32; GEOMETRIC_LEN],
    pub visual: [f32; VISUAL_LEN],
    pub topological: [f32; TOPOLOGICAL_LEN],
    pub contextual: [f32; CONTEXTUAL_LEN],
}

impl Default for FeatureVector {
    /// The documented default vector: every group at its mean
    fn default() -> Self {
        Self {
            geometric: GEOMETRIC_MEAN,
            visual: VISUAL_MEAN,
            topological: TOPOLOGICAL_MEAN,
            contextual: CONTEXTUAL_MEAN,
        }
    }
}

impl FeatureVector {
    pub fn geometric_normalized(&self) -> Vec<f32> {
        zscore(&self.geometric, &GEOMETRIC_MEAN, &GEOMETRIC_STD)
    }

    pub fn visual_normalized(&self) -> Vec<f32> {
        zscore(&self.visual, &VISUAL_MEAN, &VISUAL_STD)
    }

    pub fn topological_normalized(&self) -> Vec<f32> {
        zscore(&self.topological, &TOPOLOGICAL_MEAN, &TOPOLOGICAL_STD)
    }

    pub fn contextual_normalized(&self) -> Vec<f32> {
        zscore(&self.contextual, &CONTEXTUAL_MEAN, &CONTEXTUAL_STD)
    }

    /// Concatenated z-scored vector of length [`FEATURE_LEN`]
    pub fn normalized(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(FEATURE_LEN);
        out.extend(self.geometric_normalized());
        out.extend(self.visual_normalized());
        out.extend(self.topological_normalized());
        out.extend(self.contextual_normalized());
        out
    }
}

fn zscore(values: &[f32], mean: &[f32], std: &[f32]) -> Vec<f32> {
    values
        .iter()
        .zip(mean.iter().zip(std.iter()))
        .map(|(v, (m, s))| ((v - m) / s).clamp(-5.0, 5.0))
        .collect()
}

/// Everything extracted for one region
#[derive(Debug, Clone)]
pub struct RegionFeatures {
    pub vector: FeatureVector,
    pub hu_moments: [f64; 7],
    pub hough: HoughSummary,
    pub geometric: GeometricProperties,
    /// Groups that fell back to their default row
    pub defaulted_groups: Vec<&'static str>,
}

impl RegionFeatures {
    pub fn normalized(&self) -> Vec<f32> {
        self.vector.normalized()
    }
}

/// Page-level context for the contextual group
pub struct FeatureContext<'a> {
    /// Ink mask of the whole page
    pub page_mask: &'a GrayImage,
    /// Other candidate boxes on the same page
    pub neighbours: &'a [BoundingBox],
}

/// Stateless feature extractor
#[derive(Debug, Clone, Default)]
pub struct FeatureExtractor;

impl FeatureExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Crop `bbox` from page-space images and extract its features
    pub fn extract_from_page(
        &self,
        page_gray: &GrayImage,
        page_mask: &GrayImage,
        bbox: &BoundingBox,
        context: Option<&FeatureContext<'_>>,
    ) -> RegionFeatures {
        let gray = crop(page_gray, bbox);
        let mask = crop(page_mask, bbox);
        self.extract(&gray, &mask, bbox, context)
    }

    /// Extract features from a cropped region. Total: never fails.
    pub fn extract(
        &self,
        gray: &GrayImage,
        mask: &GrayImage,
        bbox: &BoundingBox,
        context: Option<&FeatureContext<'_>>,
    ) -> RegionFeatures {
        let mut defaulted = Vec::new();
        let moments = Moments::of_mask(mask, None);
        let outline = OutlineStats::of_mask(mask);

        let (geometric, geometric_props) = match geometric_group(mask, bbox, &moments, &outline) {
            Some(g) => g,
            None => {
                defaulted.push("geometric");
                (GEOMETRIC_MEAN, GeometricProperties::default())
            }
        };

        let hough = hough_summary(gray, &outline);
        let visual = visual_group(gray, &hough).unwrap_or_else(|| {
            defaulted.push("visual");
            VISUAL_MEAN
        });

        let topological = topological_group(mask, &outline).unwrap_or_else(|| {
            defaulted.push("topological");
            TOPOLOGICAL_MEAN
        });

        let contextual = context
            .and_then(|ctx| contextual_group(bbox, ctx))
            .unwrap_or_else(|| {
                defaulted.push("contextual");
                CONTEXTUAL_MEAN
            });

        if !defaulted.is_empty() {
            debug!("Region {:?} used default feature groups {:?}", bbox, defaulted);
        }

        let mut geometric_props = geometric_props;
        geometric_props.centroid = {
            let (cx, cy) = moments.centroid();
            if moments.m00 > 0.0 {
                Point::new(bbox.x + cx, bbox.y + cy)
            } else {
                bbox.center()
            }
        };

        RegionFeatures {
            vector: FeatureVector {
                geometric,
                visual,
                topological,
                contextual,
            },
            hu_moments: moments.hu(),
            hough,
            geometric: geometric_props,
            defaulted_groups: defaulted,
        }
    }
}

/// Crop a page-space box out of an image, clipped to its bounds
pub fn crop(image: &GrayImage, bbox: &BoundingBox) -> GrayImage {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 {
        return GrayImage::new(1, 1);
    }
    let x = (bbox.x.max(0.0) as u32).min(w.saturating_sub(1));
    let y = (bbox.y.max(0.0) as u32).min(h.saturating_sub(1));
    let cw = (bbox.width.ceil() as u32).clamp(1, w - x);
    let ch = (bbox.height.ceil() as u32).clamp(1, h - y);
    image::imageops::crop_imm(image, x, y, cw, ch).to_image()
}

/// Outer and hole contours of a region mask
struct OutlineStats {
    outer: Vec<Vec<PixelPoint<i32>>>,
    holes: Vec<Vec<PixelPoint<i32>>>,
}

impl OutlineStats {
    fn of_mask(mask: &GrayImage) -> Self {
        let mut outer = Vec::new();
        let mut holes = Vec::new();
        for c in find_contours::<i32>(mask) {
            match c.border_type {
                BorderType::Outer => outer.push(c.points),
                BorderType::Hole => {
                    if c.points.len() >= 4 {
                        holes.push(c.points)
                    }
                }
            }
        }
        Self { outer, holes }
    }

    fn area(&self) -> f64 {
        self.outer
            .iter()
            .filter(|p| p.len() >= 3)
            .map(|p| contour_area(p).abs())
            .sum()
    }

    fn perimeter(&self) -> f64 {
        self.outer.iter().map(|p| arc_length(p, true)).sum()
    }

    fn all_outer_points(&self) -> Vec<PixelPoint<i32>> {
        self.outer.iter().flatten().copied().collect()
    }
}

fn geometric_group(
    mask: &GrayImage,
    bbox: &BoundingBox,
    moments: &Moments,
    outline: &OutlineStats,
) -> Option<([f32; GEOMETRIC_LEN], GeometricProperties)> {
    let ink = moments.m00;
    if ink < 1.0 || outline.outer.is_empty() {
        return None;
    }

    let (w, h) = mask.dimensions();
    let bbox_area = (w as f64) * (h as f64);
    // Thin strokes enclose no polygon area, count their ink instead
    let area = outline.area().max(ink);
    let perimeter = outline.perimeter().max(1.0);
    let aspect = bbox.aspect_ratio();

    let hull_points = convex_hull(&outline.all_outer_points()[..]);
    let (hull_area, hull_perimeter) = if hull_points.len() >= 3 {
        (contour_area(&hull_points).abs().max(area), arc_length(&hull_points, true))
    } else {
        (area, perimeter)
    };

    let compactness = (4.0 * std::f64::consts::PI * area / (perimeter * perimeter)).min(1.0);
    let solidity = (area / hull_area).min(1.0);
    let extent = (area / bbox_area).min(1.0);
    let convexity = (hull_perimeter / perimeter).min(1.0);
    let (sym_h, sym_v) = symmetry(mask);
    let max_side = w.max(h) as f64;
    let equivalent_diameter = (4.0 * area / std::f64::consts::PI).sqrt() / max_side;
    let (major, minor) = moments.axes();
    let (cx, cy) = moments.centroid();

    let values = [
        (1.0 + area).ln(),
        (1.0 + perimeter).ln(),
        aspect,
        compactness,
        solidity,
        moments.eccentricity(),
        moments.orientation(),
        extent,
        convexity,
        sym_h,
        sym_v,
        equivalent_diameter,
        major / max_side,
        if major > f64::EPSILON { minor / major } else { 0.0 },
        cx / w as f64 - 0.5,
        cy / h as f64 - 0.5,
        ink / bbox_area,
    ];

    let group = to_group(&values)?;
    Some((
        group,
        GeometricProperties {
            area,
            perimeter,
            aspect_ratio: aspect,
            compactness,
            solidity,
            centroid: Point::default(),
        },
    ))
}

/// Left-right and top-bottom mirror overlap of ink, each in [0, 1]
fn symmetry(mask: &GrayImage) -> (f64, f64) {
    let (w, h) = mask.dimensions();
    let ink = |x: u32, y: u32| mask.get_pixel(x, y).0[0] > 127;
    let (mut h_match, mut v_match, mut total) = (0u64, 0u64, 0u64);
    for y in 0..h {
        for x in 0..w {
            if !ink(x, y) {
                continue;
            }
            total += 1;
            if ink(w - 1 - x, y) {
                h_match += 1;
            }
            if ink(x, h - 1 - y) {
                v_match += 1;
            }
        }
    }
    if total == 0 {
        return (0.0, 0.0);
    }
    (h_match as f64 / total as f64, v_match as f64 / total as f64)
}

fn hough_summary(gray: &GrayImage, outline: &OutlineStats) -> HoughSummary {
    let (w, h) = gray.dimensions();
    let mut summary = HoughSummary::default();

    if w >= 8 && h >= 8 {
        let edges = canny(gray, 50.0, 100.0);
        let options = LineDetectionOptions {
            vote_threshold: (w.min(h) / 2).max(10),
            suppression_radius: 8,
        };
        let lines = detect_lines(&edges, options);
        summary.line_count = lines.len();
        for line in &lines {
            // Polar angle is the normal direction: 0 deg = vertical line
            let a = line.angle_in_degrees % 180;
            if a <= 10 || a >= 170 {
                summary.vertical_lines += 1;
            } else if (80..=100).contains(&a) {
                summary.horizontal_lines += 1;
            }
        }
        let mut votes: HashMap<u32, usize> = HashMap::new();
        for line in &lines {
            *votes.entry(line.angle_in_degrees % 180).or_default() += 1;
        }
        summary.dominant_angle = votes
            .into_iter()
            .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
            .map(|(angle, _)| angle as f32)
            .unwrap_or(0.0);
    }

    summary.circle_count = outline
        .holes
        .iter()
        .filter(|points| {
            let area = contour_area(points).abs();
            let perimeter = arc_length(points, true);
            area >= 12.0 && perimeter > 0.0 && 4.0 * std::f64::consts::PI * area / (perimeter * perimeter) > 0.75
        })
        .count();

    summary
}

fn visual_group(gray: &GrayImage, hough: &HoughSummary) -> Option<[f32; VISUAL_LEN]> {
    let (w, h) = gray.dimensions();
    let n = (w as f64) * (h as f64);
    if n < 1.0 {
        return None;
    }

    let mut histogram = [0u64; 256];
    let (mut sum, mut sum_sq) = (0.0f64, 0.0f64);
    for p in gray.pixels() {
        let v = p.0[0];
        histogram[v as usize] += 1;
        let f = v as f64 / 255.0;
        sum += f;
        sum_sq += f * f;
    }
    let mean = sum / n;
    let std = (sum_sq / n - mean * mean).max(0.0).sqrt();
    let min = histogram.iter().position(|&c| c > 0).unwrap_or(0) as f64 / 255.0;
    let max = histogram.iter().rposition(|&c| c > 0).unwrap_or(255) as f64 / 255.0;

    let entropy = histogram
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / n;
            -p * p.log2()
        })
        .sum::<f64>()
        / 8.0;

    let (edge_density, corners, gradient_mean) = if w >= 3 && h >= 3 {
        let edges = canny(gray, 50.0, 100.0);
        let edge_px = edges.pixels().filter(|p| p.0[0] > 0).count() as f64;
        let corners = corners_fast9(gray, 40).len() as f64;
        let gradients = sobel_gradients(gray);
        let grad_sum: f64 = gradients.pixels().map(|p| p.0[0] as f64).sum();
        (edge_px / n, corners, grad_sum / n / 1020.0)
    } else {
        (0.0, 0.0, 0.0)
    };

    let values = [
        mean,
        std,
        min,
        max,
        max - min,
        edge_density,
        (1.0 + corners).ln(),
        (1.0 + hough.line_count as f64).ln(),
        entropy,
        glcm_homogeneity(gray),
        gradient_mean,
        (1.0 + hough.circle_count as f64).ln(),
    ];
    to_group(&values)
}

/// Homogeneity of the horizontal grey-level co-occurrence matrix (8 levels)
fn glcm_homogeneity(gray: &GrayImage) -> f64 {
    let (w, h) = gray.dimensions();
    if w < 2 {
        return 1.0;
    }
    let mut glcm = [[0u64; 8]; 8];
    let mut pairs = 0u64;
    for y in 0..h {
        for x in 0..w - 1 {
            let a = (gray.get_pixel(x, y).0[0] / 32) as usize;
            let b = (gray.get_pixel(x + 1, y).0[0] / 32) as usize;
            glcm[a][b] += 1;
            pairs += 1;
        }
    }
    let mut homogeneity = 0.0;
    for (i, row) in glcm.iter().enumerate() {
        for (j, &count) in row.iter().enumerate() {
            let p = count as f64 / pairs as f64;
            homogeneity += p / (1.0 + (i as f64 - j as f64).abs());
        }
    }
    homogeneity
}

fn topological_group(mask: &GrayImage, outline: &OutlineStats) -> Option<[f32; TOPOLOGICAL_LEN]> {
    let ink = mask.pixels().filter(|p| p.0[0] > 127).count();
    if ink == 0 {
        return None;
    }

    let labels = connected_components(mask, Connectivity::Eight, Luma([0u8]));
    let mut sizes: HashMap<u32, usize> = HashMap::new();
    for p in labels.pixels() {
        if p.0[0] > 0 {
            *sizes.entry(p.0[0]).or_default() += 1;
        }
    }
    let components = sizes.len();
    let largest = sizes.values().copied().max().unwrap_or(0);

    let skeleton = skeletonize(mask);
    let (w, h) = skeleton.dimensions();
    let (mut skeleton_len, mut endpoints, mut junctions) = (0usize, 0usize, 0usize);
    for y in 0..h {
        for x in 0..w {
            if skeleton.get_pixel(x, y).0[0] == 0 {
                continue;
            }
            skeleton_len += 1;
            let degree = neighbours8(x, y, w, h)
                .filter(|&(nx, ny)| skeleton.get_pixel(nx, ny).0[0] > 0)
                .count();
            match degree {
                0 | 1 => endpoints += 1,
                d if d >= 3 => junctions += 1,
                _ => {}
            }
        }
    }

    let holes = outline.holes.len();
    let values = [
        holes as f64,
        endpoints as f64,
        junctions as f64,
        components as f64 - holes as f64,
        (1.0 + skeleton_len as f64).ln(),
        components as f64,
        skeleton_len as f64 / ink as f64,
        largest as f64 / ink as f64,
    ];
    to_group(&values)
}

/// Zhang-Suen thinning of an ink mask
pub fn skeletonize(mask: &GrayImage) -> GrayImage {
    let (w, h) = mask.dimensions();
    let mut img: Vec<u8> = mask.pixels().map(|p| u8::from(p.0[0] > 127)).collect();
    if w < 3 || h < 3 {
        return GrayImage::from_raw(w, h, img.iter().map(|&v| v * 255).collect())
            .unwrap_or_else(|| GrayImage::new(w, h));
    }

    let idx = |x: u32, y: u32| (y * w + x) as usize;
    let mut changed = true;
    let mut to_clear = Vec::new();
    while changed {
        changed = false;
        for step in 0..2 {
            to_clear.clear();
            for y in 1..h - 1 {
                for x in 1..w - 1 {
                    if img[idx(x, y)] == 0 {
                        continue;
                    }
                    // P2..P9 clockwise from north
                    let p = [
                        img[idx(x, y - 1)],
                        img[idx(x + 1, y - 1)],
                        img[idx(x + 1, y)],
                        img[idx(x + 1, y + 1)],
                        img[idx(x, y + 1)],
                        img[idx(x - 1, y + 1)],
                        img[idx(x - 1, y)],
                        img[idx(x - 1, y - 1)],
                    ];
                    let b: u8 = p.iter().sum();
                    if !(2..=6).contains(&b) {
                        continue;
                    }
                    let a = (0..8).filter(|&i| p[i] == 0 && p[(i + 1) % 8] == 1).count();
                    if a != 1 {
                        continue;
                    }
                    let (c1, c2) = if step == 0 {
                        (p[0] * p[2] * p[4], p[2] * p[4] * p[6])
                    } else {
                        (p[0] * p[2] * p[6], p[0] * p[4] * p[6])
                    };
                    if c1 == 0 && c2 == 0 {
                        to_clear.push(idx(x, y));
                    }
                }
            }
            if !to_clear.is_empty() {
                changed = true;
                for &i in &to_clear {
                    img[i] = 0;
                }
            }
        }
    }

    GrayImage::from_raw(w, h, img.iter().map(|&v| v * 255).collect()).unwrap_or_else(|| GrayImage::new(w, h))
}

fn contextual_group(bbox: &BoundingBox, ctx: &FeatureContext<'_>) -> Option<[f32; CONTEXTUAL_LEN]> {
    let (pw, ph) = ctx.page_mask.dimensions();
    if pw == 0 || ph == 0 {
        return None;
    }
    let (pw_f, ph_f) = (pw as f64, ph as f64);
    let center = bbox.center();
    let page_center = Point::new(pw_f / 2.0, ph_f / 2.0);
    let half_diagonal = (pw_f * pw_f + ph_f * ph_f).sqrt() / 2.0;
    let position = center.distance(&page_center) / half_diagonal;

    // Ink density in a ring one box-size wide around the region
    let ring = bbox.padded(bbox.width.max(bbox.height) / 2.0, pw_f, ph_f);
    let ring_ink = count_ink(ctx.page_mask, &ring);
    let own_ink = count_ink(ctx.page_mask, bbox);
    let ring_area = (ring.area() - bbox.area()).max(1.0);
    let density = (ring_ink.saturating_sub(own_ink)) as f64 / ring_area;

    let edge_gap = bbox.x.min(bbox.y).min(pw_f - bbox.right()).min(ph_f - bbox.bottom()).max(0.0);
    let edge_proximity = edge_gap / pw_f.min(ph_f);

    let others: Vec<&BoundingBox> = ctx
        .neighbours
        .iter()
        .filter(|b| b.iou(bbox) < 0.9)
        .collect();
    let alignment = if others.is_empty() {
        0.0
    } else {
        others
            .iter()
            .filter(|b| {
                let c = b.center();
                (c.x - center.x).abs() < 10.0 || (c.y - center.y).abs() < 10.0
            })
            .count() as f64
            / others.len() as f64
    };

    let scale_ratio = (bbox.area() / (pw_f * ph_f)).sqrt();
    let isolation = others
        .iter()
        .map(|b| b.center().distance(&center))
        .fold(f64::INFINITY, f64::min);
    let isolation = if isolation.is_finite() {
        isolation / (2.0 * half_diagonal)
    } else {
        1.0
    };

    let values = [
        position,
        density,
        edge_proximity,
        alignment,
        scale_ratio,
        isolation,
        (1.0 + connection_count(ctx.page_mask, bbox) as f64).ln(),
    ];
    to_group(&values)
}

fn count_ink(mask: &GrayImage, bbox: &BoundingBox) -> usize {
    let (w, h) = mask.dimensions();
    let x0 = (bbox.x.max(0.0) as u32).min(w);
    let y0 = (bbox.y.max(0.0) as u32).min(h);
    let x1 = (bbox.right().ceil().max(0.0) as u32).min(w);
    let y1 = (bbox.bottom().ceil().max(0.0) as u32).min(h);
    let mut count = 0;
    for y in y0..y1 {
        for x in x0..x1 {
            if mask.get_pixel(x, y).0[0] > 127 {
                count += 1;
            }
        }
    }
    count
}

/// Ink runs crossing the one-pixel ring just outside the box (attached wires)
fn connection_count(mask: &GrayImage, bbox: &BoundingBox) -> usize {
    let (w, h) = mask.dimensions();
    let x0 = bbox.x.floor() as i64 - 1;
    let y0 = bbox.y.floor() as i64 - 1;
    let x1 = bbox.right().ceil() as i64;
    let y1 = bbox.bottom().ceil() as i64;

    let mut ring = Vec::new();
    for x in x0..=x1 {
        ring.push((x, y0));
    }
    for y in y0 + 1..=y1 {
        ring.push((x1, y));
    }
    for x in (x0..x1).rev() {
        ring.push((x, y1));
    }
    for y in (y0 + 1..y1).rev() {
        ring.push((x0, y));
    }

    let ink_at = |&(x, y): &(i64, i64)| {
        x >= 0 && y >= 0 && x < w as i64 && y < h as i64 && mask.get_pixel(x as u32, y as u32).0[0] > 127
    };
    let mut runs = 0;
    let mut previous = ring.last().map(ink_at).unwrap_or(false);
    for p in &ring {
        let current = ink_at(p);
        if current && !previous {
            runs += 1;
        }
        previous = current;
    }
    runs
}

fn to_group<const N: usize>(values: &[f64; N]) -> Option<[f32; N]> {
    if values.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let mut out = [0.0f32; N];
    for (o, v) in out.iter_mut().zip(values.iter()) {
        *o = *v as f32;
    }
    Some(out)
}
