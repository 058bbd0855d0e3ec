//! Core data model shared by the detectors, fusion and the job orchestrator

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// 2D coordinate in source-image pixel space
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// Axis-aligned box. `area` is always derived from width and height.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "BoundingBoxRepr", into = "BoundingBoxRepr")]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Serialize, Deserialize, Clone)]
struct BoundingBoxRepr {
    x: f64,
    y: f64,
    width: f64,
    height: f64,
    #[serde(default)]
    area: f64,
}

impl From<BoundingBoxRepr> for BoundingBox {
    fn from(repr: BoundingBoxRepr) -> Self {
        BoundingBox::new(repr.x, repr.y, repr.width, repr.height)
    }
}

impl From<BoundingBox> for BoundingBoxRepr {
    fn from(bbox: BoundingBox) -> Self {
        Self {
            x: bbox.x,
            y: bbox.y,
            width: bbox.width,
            height: bbox.height,
            area: bbox.area(),
        }
    }
}

impl BoundingBox {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width: width.max(0.0),
            height: height.max(0.0),
        }
    }

    pub fn area(&self) -> f64 {
        self.width * self.height
    }

    /// width / height, 0 for degenerate boxes
    pub fn aspect_ratio(&self) -> f64 {
        if self.height <= f64::EPSILON {
            0.0
        } else {
            self.width / self.height
        }
    }

    pub fn center(&self) -> Point {
        Point::new(self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn right(&self) -> f64 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f64 {
        self.y + self.height
    }

    pub fn intersection_area(&self, other: &BoundingBox) -> f64 {
        let w = self.right().min(other.right()) - self.x.max(other.x);
        let h = self.bottom().min(other.bottom()) - self.y.max(other.y);
        if w <= 0.0 || h <= 0.0 {
            0.0
        } else {
            w * h
        }
    }

    /// Intersection over union
    pub fn iou(&self, other: &BoundingBox) -> f64 {
        let inter = self.intersection_area(other);
        let union = self.area() + other.area() - inter;
        if union <= f64::EPSILON {
            0.0
        } else {
            inter / union
        }
    }

    /// Grow the box by `pad` pixels on every side, clipped to `[0, max_w] x [0, max_h]`
    pub fn padded(&self, pad: f64, max_w: f64, max_h: f64) -> BoundingBox {
        let x = (self.x - pad).max(0.0);
        let y = (self.y - pad).max(0.0);
        let right = (self.right() + pad).min(max_w);
        let bottom = (self.bottom() + pad).min(max_h);
        BoundingBox::new(x, y, right - x, bottom - y)
    }

    pub fn from_points(points: &[Point]) -> BoundingBox {
        if points.is_empty() {
            return BoundingBox::default();
        }
        let min_x = points.iter().map(|p| p.x).fold(f64::INFINITY, f64::min);
        let min_y = points.iter().map(|p| p.y).fold(f64::INFINITY, f64::min);
        let max_x = points.iter().map(|p| p.x).fold(f64::NEG_INFINITY, f64::max);
        let max_y = points.iter().map(|p| p.y).fold(f64::NEG_INFINITY, f64::max);
        // Pixel outlines are inclusive, so a single-pixel contour spans 1x1
        BoundingBox::new(min_x, min_y, max_x - min_x + 1.0, max_y - min_y + 1.0)
    }
}

/// Candidate shape outline, owned by a single detection pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contour {
    pub points: Vec<Point>,
    pub bounding_box: BoundingBox,
    pub area: f64,
    pub perimeter: f64,
}

/// Supported symbol classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolType {
    Resistor,
    Capacitor,
    PolarizedCapacitor,
    Inductor,
    Diode,
    Led,
    Transistor,
    IntegratedCircuit,
    Ground,
    Battery,
    Switch,
    Fuse,
}

impl SymbolType {
    /// Every class, in the fixed order used for model outputs
    pub const ALL: [SymbolType; 12] = [
        SymbolType::Resistor,
        SymbolType::Capacitor,
        SymbolType::PolarizedCapacitor,
        SymbolType::Inductor,
        SymbolType::Diode,
        SymbolType::Led,
        SymbolType::Transistor,
        SymbolType::IntegratedCircuit,
        SymbolType::Ground,
        SymbolType::Battery,
        SymbolType::Switch,
        SymbolType::Fuse,
    ];

    pub fn index(&self) -> usize {
        Self::ALL.iter().position(|t| t == self).unwrap_or(0)
    }

    pub fn from_index(index: usize) -> Option<SymbolType> {
        Self::ALL.get(index).copied()
    }

    pub fn category(&self) -> SymbolCategory {
        match self {
            SymbolType::Resistor
            | SymbolType::Capacitor
            | SymbolType::PolarizedCapacitor
            | SymbolType::Inductor
            | SymbolType::Fuse => SymbolCategory::Passive,
            SymbolType::Diode | SymbolType::Led | SymbolType::Transistor => {
                SymbolCategory::Semiconductor
            }
            SymbolType::IntegratedCircuit => SymbolCategory::Integrated,
            SymbolType::Ground | SymbolType::Battery => SymbolCategory::Power,
            SymbolType::Switch => SymbolCategory::Electromechanical,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SymbolType::Resistor => "resistor",
            SymbolType::Capacitor => "capacitor",
            SymbolType::PolarizedCapacitor => "polarized_capacitor",
            SymbolType::Inductor => "inductor",
            SymbolType::Diode => "diode",
            SymbolType::Led => "led",
            SymbolType::Transistor => "transistor",
            SymbolType::IntegratedCircuit => "integrated_circuit",
            SymbolType::Ground => "ground",
            SymbolType::Battery => "battery",
            SymbolType::Switch => "switch",
            SymbolType::Fuse => "fuse",
        }
    }
}

impl fmt::Display for SymbolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolCategory {
    Passive,
    Semiconductor,
    Integrated,
    Power,
    Electromechanical,
}

/// How a symbol was found. Closed set so fusion can match exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    PatternMatching,
    MlClassification,
    Consensus,
    VariantMatching,
    HuMoments,
    ContourMatching,
}

impl DetectionMethod {
    /// Whether the method belongs to the geometric pattern-matching family
    pub fn is_pattern_family(&self) -> bool {
        match self {
            DetectionMethod::PatternMatching
            | DetectionMethod::VariantMatching
            | DetectionMethod::HuMoments
            | DetectionMethod::ContourMatching => true,
            DetectionMethod::MlClassification | DetectionMethod::Consensus => false,
        }
    }
}

/// One detection that fed into a consensus symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusSource {
    pub method: DetectionMethod,
    pub symbol_type: SymbolType,
    pub confidence: f64,
    pub bounding_box: BoundingBox,
}

/// Geometric properties attached to a detection
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GeometricProperties {
    pub area: f64,
    pub perimeter: f64,
    pub aspect_ratio: f64,
    pub compactness: f64,
    pub solidity: f64,
    pub centroid: Point,
}

/// Feature payload carried with a detected symbol
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SymbolFeatures {
    pub geometric: GeometricProperties,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub invariant_moments: Vec<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shape_descriptors: Vec<f64>,
    /// Per-class probabilities when an ML model contributed
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub class_probabilities: Vec<(SymbolType, f64)>,
    /// Template that produced a pattern match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub consensus_sources: Vec<ConsensusSource>,
}

/// A symbol produced by one detection pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedSymbol {
    pub id: Uuid,
    pub symbol_type: SymbolType,
    pub symbol_category: SymbolCategory,
    /// In [0, 1]
    pub confidence: f64,
    pub location: Point,
    pub bounding_box: BoundingBox,
    pub detection_method: DetectionMethod,
    pub features: SymbolFeatures,
    /// In [0, 1]
    pub validation_score: f64,
}

impl DetectedSymbol {
    pub fn new(
        symbol_type: SymbolType,
        confidence: f64,
        bounding_box: BoundingBox,
        detection_method: DetectionMethod,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            symbol_type,
            symbol_category: symbol_type.category(),
            confidence: clamp_unit(confidence),
            location: bounding_box.center(),
            bounding_box,
            detection_method,
            features: SymbolFeatures::default(),
            validation_score: 0.0,
        }
    }

    pub fn with_features(mut self, features: SymbolFeatures) -> Self {
        self.features = features;
        self
    }
}

/// Clamp into [0, 1], mapping NaN to 0
pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Immutable per-job configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionSettings {
    pub confidence_threshold: f64,
    pub max_symbols_per_page: usize,
    pub enable_ml_classification: bool,
    pub enable_pattern_matching: bool,
    pub enable_llm_validation: bool,
    /// Whole-pipeline wall clock budget
    pub processing_timeout_ms: u64,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            max_symbols_per_page: 100,
            enable_ml_classification: true,
            enable_pattern_matching: true,
            enable_llm_validation: false,
            processing_timeout_ms: 30_000,
        }
    }
}

/// Per-stage timings and degraded-mode flags for one page
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DetectionMetadata {
    pub image_width: u32,
    pub image_height: u32,
    pub contours_found: usize,
    pub pattern_matching_time_ms: u64,
    pub ml_classification_time_ms: u64,
    pub fusion_time_ms: u64,
    pub pattern_symbols: usize,
    pub ml_symbols: usize,
    pub consensus_symbols: usize,
    /// Pattern phases that actually ran, in order
    pub phases_completed: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub early_termination: Option<String>,
    /// Input was not a decodable image and was read as a raw raster
    pub raw_raster_fallback: bool,
    /// Contour extraction yielded nothing and the placeholder set was used
    pub fallback_contours: bool,
    /// Weighted fusion failed and a plain merge was used
    pub fusion_fallback: bool,
    pub failed_ml_batches: usize,
    pub timed_out: bool,
    pub cancelled: bool,
    pub llm_validation_skipped: bool,
    pub cache_hit: bool,
}

impl DetectionMetadata {
    /// True when any fallback path produced part of the result
    pub fn is_degraded(&self) -> bool {
        self.raw_raster_fallback
            || self.fallback_contours
            || self.fusion_fallback
            || self.failed_ml_batches > 0
            || self.timed_out
    }

    /// Whether a rerun on the same input would reproduce this result.
    /// Timeouts and failed inference batches depend on load, not input.
    pub fn is_cacheable(&self) -> bool {
        !self.timed_out && !self.cancelled && self.failed_ml_batches == 0
    }
}

/// Terminal output of a detection job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolDetectionResult {
    pub id: Uuid,
    pub document_id: String,
    pub page_number: u32,
    pub detected_symbols: Vec<DetectedSymbol>,
    pub processing_time_ms: u64,
    pub overall_confidence: f64,
    pub detection_metadata: DetectionMetadata,
}

impl SymbolDetectionResult {
    pub fn new(
        document_id: impl Into<String>,
        page_number: u32,
        detected_symbols: Vec<DetectedSymbol>,
        processing_time_ms: u64,
        detection_metadata: DetectionMetadata,
    ) -> Self {
        let overall_confidence = if detected_symbols.is_empty() {
            0.0
        } else {
            detected_symbols.iter().map(|s| s.confidence).sum::<f64>()
                / detected_symbols.len() as f64
        };

        Self {
            id: Uuid::new_v4(),
            document_id: document_id.into(),
            page_number,
            detected_symbols,
            processing_time_ms,
            overall_confidence,
            detection_metadata,
        }
    }
}
