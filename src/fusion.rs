//! Fusion of pattern-matching and ML detections
//!
//! ML detections that overlap a pattern match become weighted consensus
//! symbols. Unmatched ML detections survive only when confident, unmatched
//! pattern matches are kept as they are. Everything then passes domain
//! validation and a final IoU deduplication.

use tracing::{debug, warn};

use crate::config::FusionConfig;
use crate::detection::geometry::non_maximum_suppression;
use crate::detection::templates::elongation;
use crate::types::{clamp_unit, ConsensusSource, DetectedSymbol, DetectionMethod, SymbolFeatures, SymbolType};

/// Result of one fusion pass
#[derive(Debug, Clone, Default)]
pub struct FusionOutcome {
    pub symbols: Vec<DetectedSymbol>,
    pub consensus_count: usize,
    /// Symbols dropped by domain validation
    pub rejected: usize,
    /// The weighted merge failed and the plain union was used
    pub fallback: bool,
}

/// Why a weighted merge could not proceed
#[derive(Debug, Clone, PartialEq)]
enum MergeError {
    InvalidWeights(f64, f64),
    NonFinite(DetectionMethod, usize),
}

impl std::fmt::Display for MergeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MergeError::InvalidWeights(p, m) => write!(f, "invalid fusion weights {} / {}", p, m),
            MergeError::NonFinite(method, i) => {
                write!(f, "non-finite geometry in {:?} detection #{}", method, i)
            }
        }
    }
}

pub struct FusionEngine {
    config: FusionConfig,
}

impl FusionEngine {
    pub fn new(config: FusionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    /// Merge both detectors' output for one page
    pub fn fuse(&self, pattern: Vec<DetectedSymbol>, ml: Vec<DetectedSymbol>) -> FusionOutcome {
        let input_count = pattern.len() + ml.len();
        let (merged, fallback) = match self.weighted_merge(&pattern, &ml) {
            Ok(merged) => (merged, false),
            Err(e) => {
                warn!("Weighted fusion failed ({}), falling back to plain merge", e);
                (plain_union(pattern, ml), true)
            }
        };

        let before_validation = merged.len();
        let validated: Vec<DetectedSymbol> = merged.into_iter().filter_map(|s| self.validate(s)).collect();
        let rejected = before_validation - validated.len();

        let symbols = non_maximum_suppression(validated, self.config.dedup_iou);
        let consensus_count = symbols
            .iter()
            .filter(|s| s.detection_method == DetectionMethod::Consensus)
            .count();

        debug!(
            "Fused {} detections into {} ({} consensus, {} rejected, fallback={})",
            input_count,
            symbols.len(),
            consensus_count,
            rejected,
            fallback
        );

        FusionOutcome {
            symbols,
            consensus_count,
            rejected,
            fallback,
        }
    }

    fn weighted_merge(&self, pattern: &[DetectedSymbol], ml: &[DetectedSymbol]) -> Result<Vec<DetectedSymbol>, MergeError> {
        let (pw, mw) = (self.config.pattern_weight, self.config.ml_weight);
        if !pw.is_finite() || !mw.is_finite() || pw < 0.0 || mw < 0.0 || pw + mw <= 0.0 {
            return Err(MergeError::InvalidWeights(pw, mw));
        }
        for (i, s) in pattern.iter().enumerate() {
            if !is_finite(s) {
                return Err(MergeError::NonFinite(s.detection_method, i));
            }
        }
        for (i, s) in ml.iter().enumerate() {
            if !is_finite(s) {
                return Err(MergeError::NonFinite(s.detection_method, i));
            }
        }

        let mut consumed = vec![false; pattern.len()];
        let mut out = Vec::with_capacity(pattern.len() + ml.len());

        for m in ml {
            let best = pattern
                .iter()
                .enumerate()
                .filter(|(i, _)| !consumed[*i])
                .map(|(i, p)| (i, p.bounding_box.iou(&m.bounding_box)))
                .filter(|(_, iou)| *iou > self.config.overlap_iou)
                .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

            match best {
                Some((i, _)) => {
                    consumed[i] = true;
                    out.push(consensus(&pattern[i], m, pw / (pw + mw), mw / (pw + mw)));
                }
                None if m.confidence > self.config.standalone_ml_confidence => out.push(m.clone()),
                None => {}
            }
        }

        out.extend(
            pattern
                .iter()
                .zip(consumed.iter())
                .filter(|(_, used)| !**used)
                .map(|(p, _)| p.clone()),
        );
        Ok(out)
    }

    /// Apply the domain rules. Returns the symbol with its validation score
    /// set, or `None` when it is implausible.
    pub fn validate(&self, mut symbol: DetectedSymbol) -> Option<DetectedSymbol> {
        let plausibility = self.plausibility(&symbol)?;
        symbol.validation_score = clamp_unit(0.5 * symbol.confidence + 0.5 * plausibility);
        Some(symbol)
    }

    /// Shape plausibility in [0.5, 1] for symbols that pass the rules
    pub fn plausibility(&self, symbol: &DetectedSymbol) -> Option<f64> {
        let bbox = &symbol.bounding_box;
        if !is_finite(symbol) {
            return None;
        }
        let area = bbox.area();
        if area < self.config.min_area || area > self.config.max_area {
            return None;
        }
        let aspect = bbox.aspect_ratio();
        if aspect < self.config.min_aspect_ratio || aspect > self.config.max_aspect_ratio {
            return None;
        }

        match symbol.symbol_type {
            SymbolType::Resistor => {
                let stretch = elongation(aspect);
                (stretch > self.config.resistor_min_elongation).then(|| (stretch / 3.0).clamp(0.5, 1.0))
            }
            SymbolType::Ground => {
                let ok = aspect >= self.config.ground_min_aspect && aspect <= self.config.ground_max_aspect;
                ok.then(|| (1.0 - (aspect - 1.0).abs()).clamp(0.5, 1.0))
            }
            _ => Some(1.0),
        }
    }
}

fn is_finite(symbol: &DetectedSymbol) -> bool {
    let b = &symbol.bounding_box;
    symbol.confidence.is_finite() && b.x.is_finite() && b.y.is_finite() && b.width.is_finite() && b.height.is_finite()
}

fn source(symbol: &DetectedSymbol) -> ConsensusSource {
    ConsensusSource {
        method: symbol.detection_method,
        symbol_type: symbol.symbol_type,
        confidence: symbol.confidence,
        bounding_box: symbol.bounding_box,
    }
}

/// Weighted consensus of an overlapping pattern match and ML detection
fn consensus(pattern: &DetectedSymbol, ml: &DetectedSymbol, pattern_weight: f64, ml_weight: f64) -> DetectedSymbol {
    let confidence = pattern_weight * pattern.confidence + ml_weight * ml.confidence;
    let symbol_type = if pattern.confidence > ml.confidence {
        pattern.symbol_type
    } else {
        ml.symbol_type
    };
    let bbox = if pattern.bounding_box.area() < ml.bounding_box.area() {
        pattern.bounding_box
    } else {
        ml.bounding_box
    };

    let mut features = SymbolFeatures {
        geometric: ml.features.geometric.clone(),
        invariant_moments: ml.features.invariant_moments.clone(),
        shape_descriptors: pattern.features.shape_descriptors.clone(),
        class_probabilities: ml.features.class_probabilities.clone(),
        template_id: pattern.features.template_id.clone(),
        consensus_sources: vec![source(pattern), source(ml)],
    };
    if features.invariant_moments.is_empty() {
        features.invariant_moments = pattern.features.invariant_moments.clone();
    }
    if features.geometric == Default::default() {
        features.geometric = pattern.features.geometric.clone();
    }

    DetectedSymbol::new(symbol_type, confidence, bbox, DetectionMethod::Consensus).with_features(features)
}

/// Unweighted merge used when the weighted merge fails
fn plain_union(pattern: Vec<DetectedSymbol>, ml: Vec<DetectedSymbol>) -> Vec<DetectedSymbol> {
    pattern
        .into_iter()
        .chain(ml)
        .filter(is_finite)
        .map(|mut s| {
            s.confidence = clamp_unit(s.confidence);
            s
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::geometry::max_pairwise_iou;
    use crate::types::BoundingBox;

    fn symbol(t: SymbolType, conf: f64, bbox: BoundingBox, method: DetectionMethod) -> DetectedSymbol {
        DetectedSymbol::new(t, conf, bbox, method)
    }

    fn engine() -> FusionEngine {
        FusionEngine::new(FusionConfig::default())
    }

    #[test]
    fn test_overlap_becomes_weighted_consensus() {
        let pattern = symbol(
            SymbolType::Resistor,
            0.7,
            BoundingBox::new(10.0, 10.0, 60.0, 20.0),
            DetectionMethod::HuMoments,
        );
        let ml = symbol(
            SymbolType::Resistor,
            0.9,
            BoundingBox::new(8.0, 8.0, 64.0, 24.0),
            DetectionMethod::MlClassification,
        );
        let outcome = engine().fuse(vec![pattern], vec![ml]);

        assert_eq!(outcome.symbols.len(), 1);
        let fused = &outcome.symbols[0];
        assert_eq!(fused.detection_method, DetectionMethod::Consensus);
        assert!((fused.confidence - 0.82).abs() < 1e-9);
        // Smaller box wins
        assert_eq!(fused.bounding_box, BoundingBox::new(10.0, 10.0, 60.0, 20.0));
        assert_eq!(fused.features.consensus_sources.len(), 2);
        assert!(fused.features.consensus_sources[0].bounding_box.iou(&fused.features.consensus_sources[1].bounding_box) > 0.3);
        assert_eq!(outcome.consensus_count, 1);
        assert!(!outcome.fallback);
    }

    #[test]
    fn test_consensus_type_follows_more_confident_source() {
        let bbox = BoundingBox::new(0.0, 0.0, 40.0, 30.0);
        let pattern = symbol(SymbolType::Capacitor, 0.95, bbox, DetectionMethod::PatternMatching);
        let ml = symbol(SymbolType::Diode, 0.6, bbox, DetectionMethod::MlClassification);
        let outcome = engine().fuse(vec![pattern], vec![ml]);
        assert_eq!(outcome.symbols[0].symbol_type, SymbolType::Capacitor);
    }

    #[test]
    fn test_standalone_ml_needs_high_confidence() {
        let low = symbol(
            SymbolType::Diode,
            0.55,
            BoundingBox::new(0.0, 0.0, 30.0, 20.0),
            DetectionMethod::MlClassification,
        );
        let high = symbol(
            SymbolType::Diode,
            0.65,
            BoundingBox::new(200.0, 0.0, 30.0, 20.0),
            DetectionMethod::MlClassification,
        );
        let outcome = engine().fuse(Vec::new(), vec![low, high]);
        assert_eq!(outcome.symbols.len(), 1);
        assert!((outcome.symbols[0].confidence - 0.65).abs() < 1e-9);
    }

    #[test]
    fn test_unmatched_pattern_kept_as_is() {
        let pattern = symbol(
            SymbolType::IntegratedCircuit,
            0.4,
            BoundingBox::new(0.0, 0.0, 40.0, 60.0),
            DetectionMethod::VariantMatching,
        );
        let outcome = engine().fuse(vec![pattern.clone()], Vec::new());
        assert_eq!(outcome.symbols.len(), 1);
        assert_eq!(outcome.symbols[0].id, pattern.id);
        assert_eq!(outcome.symbols[0].detection_method, DetectionMethod::VariantMatching);
    }

    #[test]
    fn test_domain_rules() {
        let e = engine();
        let make = |t, w, h| symbol(t, 0.8, BoundingBox::new(0.0, 0.0, w, h), DetectionMethod::PatternMatching);

        assert!(e.validate(make(SymbolType::Resistor, 60.0, 20.0)).is_some());
        // Vertical resistors are fine
        assert!(e.validate(make(SymbolType::Resistor, 20.0, 60.0)).is_some());
        assert!(e.validate(make(SymbolType::Resistor, 24.0, 20.0)).is_none());
        assert!(e.validate(make(SymbolType::Ground, 30.0, 30.0)).is_some());
        assert!(e.validate(make(SymbolType::Ground, 60.0, 20.0)).is_none());
        // Area and aspect windows
        assert!(e.validate(make(SymbolType::Capacitor, 5.0, 5.0)).is_none());
        assert!(e.validate(make(SymbolType::Capacitor, 300.0, 300.0)).is_none());
        assert!(e.validate(make(SymbolType::Capacitor, 220.0, 20.0)).is_none());

        let scored = e.validate(make(SymbolType::Capacitor, 30.0, 30.0)).unwrap();
        assert!((scored.validation_score - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_duplicates_collapsed() {
        let a = symbol(
            SymbolType::Diode,
            0.9,
            BoundingBox::new(0.0, 0.0, 40.0, 20.0),
            DetectionMethod::PatternMatching,
        );
        let b = symbol(
            SymbolType::Led,
            0.7,
            BoundingBox::new(2.0, 0.0, 40.0, 20.0),
            DetectionMethod::HuMoments,
        );
        let outcome = engine().fuse(vec![a, b], Vec::new());
        assert_eq!(outcome.symbols.len(), 1);
        assert_eq!(outcome.symbols[0].symbol_type, SymbolType::Diode);
        assert!(max_pairwise_iou(&outcome.symbols) <= 0.5);
    }

    #[test]
    fn test_non_finite_input_uses_plain_merge() {
        let good = symbol(
            SymbolType::Capacitor,
            0.8,
            BoundingBox::new(0.0, 0.0, 30.0, 30.0),
            DetectionMethod::PatternMatching,
        );
        let mut broken = symbol(
            SymbolType::Capacitor,
            0.9,
            BoundingBox::new(100.0, 0.0, 30.0, 30.0),
            DetectionMethod::MlClassification,
        );
        broken.bounding_box.x = f64::NAN;
        let dup = symbol(
            SymbolType::Capacitor,
            0.7,
            BoundingBox::new(1.0, 0.0, 30.0, 30.0),
            DetectionMethod::MlClassification,
        );

        let outcome = engine().fuse(vec![good], vec![broken, dup]);
        assert!(outcome.fallback);
        assert_eq!(outcome.symbols.len(), 1);
        assert_eq!(outcome.consensus_count, 0);
        assert!((outcome.symbols[0].confidence - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_weights_fall_back() {
        let config = FusionConfig {
            pattern_weight: f64::NAN,
            ..FusionConfig::default()
        };
        let bbox = BoundingBox::new(0.0, 0.0, 30.0, 30.0);
        let outcome = FusionEngine::new(config).fuse(
            vec![symbol(SymbolType::Capacitor, 0.8, bbox, DetectionMethod::PatternMatching)],
            vec![symbol(SymbolType::Capacitor, 0.9, bbox, DetectionMethod::MlClassification)],
        );
        assert!(outcome.fallback);
        assert_eq!(outcome.symbols.len(), 1);
        assert!((outcome.symbols[0].confidence - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_dedup_is_idempotent_on_output() {
        let symbols: Vec<DetectedSymbol> = (0..6)
            .map(|i| {
                symbol(
                    SymbolType::Capacitor,
                    0.5 + i as f64 * 0.05,
                    BoundingBox::new(i as f64 * 8.0, 0.0, 30.0, 30.0),
                    DetectionMethod::PatternMatching,
                )
            })
            .collect();
        let outcome = engine().fuse(symbols, Vec::new());
        let again = non_maximum_suppression(outcome.symbols.clone(), 0.5);
        assert_eq!(again.len(), outcome.symbols.len());
    }
}
