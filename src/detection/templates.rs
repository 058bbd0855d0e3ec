//! Symbol template library
//!
//! Templates are rendered procedurally, run through the same preprocessing as
//! a page, and analysed once into shape invariants, a feature signature and
//! keypoints. Each template also carries rotation/scale variants. The
//! library is immutable after construction and shared read-only between jobs.

use anyhow::{Context, Result};
use image::imageops::{self, FilterType};
use image::{GrayImage, Luma};
use imageproc::drawing::{
    draw_filled_rect_mut, draw_hollow_circle_mut, draw_line_segment_mut, draw_polygon_mut,
};
use imageproc::point::Point as PixelPoint;
use imageproc::rect::Rect;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info};

use crate::config::ContourConfig;
use crate::types::{Contour, SymbolCategory, SymbolType};
use crate::vision::contours::{combined_outline, solidity};
use crate::vision::features::FeatureExtractor;
use crate::vision::keypoints::{BriefExtractor, KeypointSet};
use crate::vision::moments::{descriptor_similarity, moment_similarity, shape_descriptor, Moments};
use crate::vision::preprocess::preprocess_page;

pub const ROTATIONS: [u16; 4] = [0, 90, 180, 270];
pub const SCALES: [f64; 3] = [0.75, 1.0, 1.25];

/// White border around rendered symbols, wide enough for keypoint patches
const MARGIN: u32 = 16;
const LIBRARY_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplatePriority {
    High,
    Normal,
}

/// Shape invariants of one ink region
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ShapeProfile {
    /// Hu invariants
    pub invariant_moments: Vec<f64>,
    /// Radial Fourier signature
    pub shape_descriptors: Vec<f64>,
    /// width / height of the ink box
    pub aspect_ratio: f64,
    /// Outline area / box area
    pub solidity: f64,
    /// Ink pixels / box area
    pub fill_ratio: f64,
}

impl ShapeProfile {
    /// Profile of the ink under `contour` on a binary mask
    pub fn of_contour(mask: &GrayImage, contour: &Contour) -> Self {
        let bbox = &contour.bounding_box;
        let moments = Moments::of_mask(mask, Some(bbox));
        let box_area = bbox.area().max(1.0);
        Self {
            invariant_moments: moments.hu().to_vec(),
            shape_descriptors: shape_descriptor(&contour.points),
            aspect_ratio: bbox.aspect_ratio(),
            solidity: solidity(contour),
            fill_ratio: (moments.m00 / box_area).min(1.0),
        }
    }

    pub fn moment_similarity(&self, other: &ShapeProfile) -> f64 {
        moment_similarity(&self.invariant_moments, &other.invariant_moments)
    }

    pub fn descriptor_similarity(&self, other: &ShapeProfile) -> f64 {
        descriptor_similarity(&self.shape_descriptors, &other.shape_descriptors)
    }

    /// Orientation-free geometric agreement in [0, 1]
    pub fn geometric_similarity(&self, other: &ShapeProfile) -> f64 {
        let elongation = ratio_similarity(elongation(self.aspect_ratio), elongation(other.aspect_ratio));
        let solidity = 1.0 - (self.solidity - other.solidity).abs().min(1.0);
        let fill = 1.0 - (2.0 * (self.fill_ratio - other.fill_ratio).abs()).min(1.0);
        0.5 * elongation + 0.25 * solidity + 0.25 * fill
    }

    /// Aspect agreement that respects orientation
    pub fn oriented_aspect_similarity(&self, other: &ShapeProfile) -> f64 {
        ratio_similarity(self.aspect_ratio, other.aspect_ratio)
    }
}

/// Long side over short side
pub fn elongation(aspect_ratio: f64) -> f64 {
    if aspect_ratio <= f64::EPSILON {
        0.0
    } else {
        aspect_ratio.max(1.0 / aspect_ratio)
    }
}

fn ratio_similarity(a: f64, b: f64) -> f64 {
    let (lo, hi) = if a < b { (a, b) } else { (b, a) };
    if hi <= f64::EPSILON {
        0.0
    } else {
        lo / hi
    }
}

/// A precomputed rotation/scale transform of a template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolVariant {
    /// Degrees, multiple of 90
    pub rotation: u16,
    pub scale: f64,
    /// Prior trust in matches against this variant
    pub confidence: f64,
    pub keypoints: KeypointSet,
    #[serde(flatten)]
    pub profile: ShapeProfile,
    pub feature_signature: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolTemplate {
    pub id: String,
    pub symbol_type: SymbolType,
    pub symbol_category: SymbolCategory,
    /// Normalized 44-value feature vector of the canonical rendering
    pub feature_signature: Vec<f32>,
    #[serde(flatten)]
    pub profile: ShapeProfile,
    pub keypoints: KeypointSet,
    pub variants: Vec<SymbolVariant>,
    pub priority: TemplatePriority,
    pub ensemble_weight: f64,
    /// Participates in the ensemble phase
    pub ensemble: bool,
}

impl SymbolTemplate {
    pub fn invariant_moments(&self) -> &[f64] {
        &self.profile.invariant_moments
    }

    pub fn is_high_priority(&self) -> bool {
        self.priority == TemplatePriority::High
    }

    /// Build and analyse the built-in template for a symbol class
    pub fn builtin(symbol_type: SymbolType) -> Self {
        let extractor = FeatureExtractor::new();
        let brief = BriefExtractor::default();
        let base = render_symbol(symbol_type);
        let canonical = analyse(&base, &extractor, &brief);

        let mut variants = Vec::with_capacity(ROTATIONS.len() * SCALES.len());
        for &rotation in &ROTATIONS {
            for &scale in &SCALES {
                let image = transform(&base, rotation, scale);
                let analysis = analyse(&image, &extractor, &brief);
                variants.push(SymbolVariant {
                    rotation,
                    scale,
                    confidence: variant_prior(rotation, scale),
                    keypoints: analysis.keypoints,
                    profile: analysis.profile,
                    feature_signature: analysis.signature,
                });
            }
        }

        let (priority, ensemble_weight, ensemble) = tuning(symbol_type);
        Self {
            id: symbol_type.as_str().to_string(),
            symbol_type,
            symbol_category: symbol_type.category(),
            feature_signature: canonical.signature,
            profile: canonical.profile,
            keypoints: canonical.keypoints,
            variants,
            priority,
            ensemble_weight,
            ensemble,
        }
    }
}

fn variant_prior(rotation: u16, scale: f64) -> f64 {
    let unscaled = (scale - 1.0).abs() < f64::EPSILON;
    match (rotation, unscaled) {
        (0, true) => 1.0,
        (_, true) => 0.95,
        (0, false) => 0.92,
        _ => 0.9,
    }
}

/// (priority, ensemble weight, ensemble tag) per class
fn tuning(symbol_type: SymbolType) -> (TemplatePriority, f64, bool) {
    use TemplatePriority::*;
    match symbol_type {
        SymbolType::Resistor => (High, 1.0, true),
        SymbolType::Capacitor => (High, 0.95, true),
        SymbolType::Diode => (High, 0.95, true),
        SymbolType::IntegratedCircuit => (High, 1.0, true),
        SymbolType::Ground => (High, 0.9, false),
        SymbolType::Transistor => (High, 0.9, true),
        SymbolType::Inductor => (Normal, 0.85, true),
        SymbolType::Led => (Normal, 0.85, true),
        SymbolType::Fuse => (Normal, 0.85, true),
        SymbolType::PolarizedCapacitor => (Normal, 0.85, false),
        SymbolType::Battery => (Normal, 0.85, false),
        SymbolType::Switch => (Normal, 0.8, false),
    }
}

struct Analysis {
    profile: ShapeProfile,
    signature: Vec<f32>,
    keypoints: KeypointSet,
}

fn analyse(gray: &GrayImage, extractor: &FeatureExtractor, brief: &BriefExtractor) -> Analysis {
    let pre = preprocess_page(gray, &ContourConfig::default());
    match combined_outline(&pre.mask) {
        Some(outline) => {
            let features = extractor.extract_from_page(&pre.enhanced, &pre.mask, &outline.bounding_box, None);
            Analysis {
                profile: ShapeProfile::of_contour(&pre.mask, &outline),
                signature: features.normalized(),
                keypoints: brief.detect_and_describe(gray),
            }
        }
        None => Analysis {
            profile: ShapeProfile::default(),
            signature: crate::vision::features::FeatureVector::default().normalized(),
            keypoints: KeypointSet::default(),
        },
    }
}

/// Rotate by a multiple of 90 degrees, then resample by `scale`
pub fn transform(image: &GrayImage, rotation: u16, scale: f64) -> GrayImage {
    let rotated = match rotation % 360 {
        90 => imageops::rotate90(image),
        180 => imageops::rotate180(image),
        270 => imageops::rotate270(image),
        _ => image.clone(),
    };
    if (scale - 1.0).abs() < f64::EPSILON {
        return rotated;
    }
    let w = ((rotated.width() as f64) * scale).round().max(1.0) as u32;
    let h = ((rotated.height() as f64) * scale).round().max(1.0) as u32;
    imageops::resize(&rotated, w, h, FilterType::Triangle)
}

/// Immutable set of templates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateLibrary {
    version: u32,
    templates: Vec<SymbolTemplate>,
}

impl TemplateLibrary {
    pub fn new(templates: Vec<SymbolTemplate>) -> Self {
        Self {
            version: LIBRARY_VERSION,
            templates,
        }
    }

    /// Render and analyse one template per supported class
    pub fn builtin() -> Self {
        let start = Instant::now();
        let templates: Vec<SymbolTemplate> = SymbolType::ALL.iter().map(|&t| SymbolTemplate::builtin(t)).collect();
        info!(
            "Built template library: {} templates, {} variants in {:?}",
            templates.len(),
            templates.iter().map(|t| t.variants.len()).sum::<usize>(),
            start.elapsed()
        );
        Self::new(templates)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    pub fn templates(&self) -> &[SymbolTemplate] {
        &self.templates
    }

    pub fn get(&self, id: &str) -> Option<&SymbolTemplate> {
        self.templates.iter().find(|t| t.id == id)
    }

    pub fn by_type(&self, symbol_type: SymbolType) -> Option<&SymbolTemplate> {
        self.templates.iter().find(|t| t.symbol_type == symbol_type)
    }

    pub fn high_priority(&self) -> impl Iterator<Item = &SymbolTemplate> {
        self.templates.iter().filter(|t| t.is_high_priority())
    }

    pub fn ensemble(&self) -> impl Iterator<Item = &SymbolTemplate> {
        self.templates.iter().filter(|t| t.ensemble)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let library: TemplateLibrary = serde_json::from_str(json).context("Invalid template library JSON")?;
        debug!("Loaded template library v{} with {} templates", library.version, library.len());
        Ok(library)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_json()?).with_context(|| format!("Failed to write template library: {:?}", path))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read template library: {:?}", path))?;
        Self::from_json(&json)
    }
}

/// Drawing surface with a symbol-local origin inside the margin
struct Canvas {
    image: GrayImage,
}

impl Canvas {
    const INK: Luma<u8> = Luma([0]);
    const PAPER: Luma<u8> = Luma([255]);

    fn new(width: u32, height: u32) -> Self {
        Self {
            image: GrayImage::from_pixel(width + 2 * MARGIN, height + 2 * MARGIN, Self::PAPER),
        }
    }

    fn at(x: i32, y: i32) -> (f32, f32) {
        ((x + MARGIN as i32) as f32, (y + MARGIN as i32) as f32)
    }

    fn line(&mut self, a: (i32, i32), b: (i32, i32)) {
        draw_line_segment_mut(&mut self.image, Self::at(a.0, a.1), Self::at(b.0, b.1), Self::INK);
    }

    fn rect(&mut self, x: i32, y: i32, w: u32, h: u32) {
        let (x0, y0) = (x, y);
        let (x1, y1) = (x + w as i32 - 1, y + h as i32 - 1);
        self.line((x0, y0), (x1, y0));
        self.line((x1, y0), (x1, y1));
        self.line((x1, y1), (x0, y1));
        self.line((x0, y1), (x0, y0));
    }

    fn fill(&mut self, x: i32, y: i32, w: u32, h: u32, color: Luma<u8>) {
        let rect = Rect::at(x + MARGIN as i32, y + MARGIN as i32).of_size(w, h);
        draw_filled_rect_mut(&mut self.image, rect, color);
    }

    fn circle(&mut self, center: (i32, i32), radius: i32) {
        let c = (center.0 + MARGIN as i32, center.1 + MARGIN as i32);
        draw_hollow_circle_mut(&mut self.image, c, radius, Self::INK);
    }

    fn triangle(&mut self, points: [(i32, i32); 3]) {
        let m = MARGIN as i32;
        let poly: Vec<PixelPoint<i32>> = points.iter().map(|&(x, y)| PixelPoint::new(x + m, y + m)).collect();
        draw_polygon_mut(&mut self.image, &poly, Self::INK);
    }
}

/// Render the canonical drawing of a symbol: black strokes on white with a
/// white margin on every side
pub fn render_symbol(symbol_type: SymbolType) -> GrayImage {
    let canvas = match symbol_type {
        SymbolType::Resistor => {
            let mut c = Canvas::new(64, 16);
            c.line((0, 8), (13, 8));
            c.rect(14, 2, 36, 13);
            c.line((50, 8), (63, 8));
            c
        }
        SymbolType::Fuse => {
            let mut c = Canvas::new(64, 16);
            c.rect(14, 3, 36, 11);
            c.line((0, 8), (63, 8));
            c
        }
        SymbolType::Capacitor => {
            let mut c = Canvas::new(40, 28);
            c.line((0, 14), (16, 14));
            c.fill(17, 0, 3, 28, Canvas::INK);
            c.fill(26, 0, 3, 28, Canvas::INK);
            c.line((29, 14), (39, 14));
            c
        }
        SymbolType::PolarizedCapacitor => {
            let mut c = Canvas::new(44, 32);
            c.line((0, 16), (17, 16));
            c.fill(18, 2, 3, 28, Canvas::INK);
            c.rect(27, 2, 5, 28);
            c.line((32, 16), (43, 16));
            c.line((8, 4), (14, 4));
            c.line((11, 1), (11, 7));
            c
        }
        SymbolType::Inductor => {
            let mut c = Canvas::new(64, 14);
            for i in 0..4 {
                c.circle((16 + i * 12, 12), 6);
            }
            c.fill(9, 13, 51, 8, Canvas::PAPER);
            c.line((0, 12), (63, 12));
            c
        }
        SymbolType::Diode => {
            let mut c = Canvas::new(48, 24);
            c.line((0, 12), (15, 12));
            c.triangle([(16, 2), (16, 22), (32, 12)]);
            c.fill(32, 2, 3, 21, Canvas::INK);
            c.line((35, 12), (47, 12));
            c
        }
        SymbolType::Led => {
            let mut c = Canvas::new(52, 44);
            c.circle((24, 26), 17);
            c.line((0, 26), (13, 26));
            c.triangle([(14, 18), (14, 34), (28, 26)]);
            c.fill(28, 18, 2, 17, Canvas::INK);
            c.line((30, 26), (51, 26));
            c.line((30, 10), (40, 0));
            c.line((40, 0), (36, 1));
            c.line((36, 12), (46, 2));
            c.line((46, 2), (42, 3));
            c
        }
        SymbolType::Transistor => {
            let mut c = Canvas::new(48, 48);
            c.circle((26, 24), 20);
            c.line((0, 24), (16, 24));
            c.fill(16, 12, 3, 25, Canvas::INK);
            c.line((19, 18), (34, 6));
            c.line((34, 6), (34, 0));
            c.line((19, 30), (34, 42));
            c.line((34, 42), (34, 47));
            c.triangle([(34, 42), (27, 41), (31, 36)]);
            c
        }
        SymbolType::IntegratedCircuit => {
            let mut c = Canvas::new(48, 64);
            c.rect(10, 0, 28, 64);
            for i in 0..3 {
                let y = 14 + i * 18;
                c.line((0, y), (9, y));
                c.line((38, y), (47, y));
            }
            c.circle((24, 6), 3);
            c
        }
        SymbolType::Ground => {
            let mut c = Canvas::new(32, 32);
            c.line((16, 0), (16, 12));
            c.line((2, 12), (30, 12));
            c.line((30, 12), (16, 30));
            c.line((16, 30), (2, 12));
            c
        }
        SymbolType::Battery => {
            let mut c = Canvas::new(40, 32);
            c.line((0, 16), (10, 16));
            c.fill(11, 0, 2, 32, Canvas::INK);
            c.fill(17, 8, 4, 16, Canvas::INK);
            c.fill(25, 0, 2, 32, Canvas::INK);
            c.fill(31, 8, 4, 16, Canvas::INK);
            c.line((35, 16), (39, 16));
            c
        }
        SymbolType::Switch => {
            let mut c = Canvas::new(56, 24);
            c.line((0, 20), (12, 20));
            c.circle((16, 20), 3);
            c.line((18, 18), (40, 4));
            c.circle((42, 20), 3);
            c.line((46, 20), (55, 20));
            c
        }
    };
    canvas.image
}

#[cfg(test)]
pub(crate) fn test_library() -> std::sync::Arc<TemplateLibrary> {
    use std::sync::{Arc, OnceLock};
    static LIBRARY: OnceLock<Arc<TemplateLibrary>> = OnceLock::new();
    LIBRARY.get_or_init(|| Arc::new(TemplateLibrary::builtin())).clone()
}
