//! Matchers behind the four pattern-matching phases
//!
//! Every function here is synchronous and works on a slice of contour
//! indices so the engine can fan batches out to blocking worker threads.

use image::{imageops, GrayImage};
use std::collections::HashSet;

use crate::config::PatternMatchingConfig;
use crate::detection::templates::{ShapeProfile, SymbolTemplate, SymbolVariant, TemplateLibrary};
use crate::types::{
    ConsensusSource, Contour, DetectedSymbol, DetectionMethod, GeometricProperties, SymbolFeatures,
};
use crate::vision::keypoints::{match_confidence, match_descriptors, BriefExtractor, KeypointSet};

/// Hamming distance ceiling for a keypoint match
const MAX_DESCRIPTOR_DISTANCE: u32 = 64;
const RATIO_TEST: f32 = 0.8;
/// Extra context cropped around a contour before keypoint detection
const KEYPOINT_PADDING: f64 = 16.0;
const REGION_KEYPOINTS: usize = 32;

/// Page data shared read-only by every phase batch
pub struct PhaseInput {
    pub contours: Vec<Contour>,
    pub profiles: Vec<ShapeProfile>,
    /// Ink mask the contours were traced on
    pub mask: GrayImage,
    /// Original grayscale page
    pub gray: GrayImage,
}

impl PhaseInput {
    pub fn new(contours: Vec<Contour>, mask: GrayImage, gray: GrayImage) -> Self {
        let profiles = contours.iter().map(|c| ShapeProfile::of_contour(&mask, c)).collect();
        Self {
            contours,
            profiles,
            mask,
            gray,
        }
    }

    pub fn len(&self) -> usize {
        self.contours.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contours.is_empty()
    }

    fn symbol(&self, index: usize, template: &SymbolTemplate, confidence: f64, method: DetectionMethod) -> DetectedSymbol {
        let contour = &self.contours[index];
        let profile = &self.profiles[index];
        let perimeter = contour.perimeter.max(1.0);
        let features = SymbolFeatures {
            geometric: GeometricProperties {
                area: contour.area,
                perimeter: contour.perimeter,
                aspect_ratio: contour.bounding_box.aspect_ratio(),
                compactness: (4.0 * std::f64::consts::PI * contour.area / (perimeter * perimeter)).min(1.0),
                solidity: profile.solidity,
                centroid: contour.bounding_box.center(),
            },
            invariant_moments: profile.invariant_moments.clone(),
            shape_descriptors: profile.shape_descriptors.clone(),
            template_id: Some(template.id.clone()),
            ..Default::default()
        };
        DetectedSymbol::new(template.symbol_type, confidence, contour.bounding_box, method).with_features(features)
    }
}

/// Which templates a matcher considers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateSet {
    HighPriority,
    Ensemble,
    All,
}

impl TemplateSet {
    fn select(self, library: &TemplateLibrary) -> Vec<&SymbolTemplate> {
        match self {
            TemplateSet::HighPriority => library.high_priority().collect(),
            TemplateSet::Ensemble => library.ensemble().collect(),
            TemplateSet::All => library.templates().iter().collect(),
        }
    }
}

/// Best-scoring template per contour, kept if it clears the candidate threshold
fn best_per_contour<F>(
    input: &PhaseInput,
    indices: &[usize],
    templates: &[&SymbolTemplate],
    threshold: f64,
    method: DetectionMethod,
    score: F,
) -> Vec<DetectedSymbol>
where
    F: Fn(&ShapeProfile, &SymbolTemplate) -> f64,
{
    let mut out = Vec::new();
    for &i in indices {
        let profile = &input.profiles[i];
        let best = templates
            .iter()
            .map(|t| (*t, score(profile, t)))
            .filter(|(_, s)| s.is_finite())
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        if let Some((template, confidence)) = best {
            if confidence >= threshold {
                out.push(input.symbol(i, template, confidence, method));
            }
        }
    }
    out
}

/// Phase 1: weighted Hu-moment and geometric similarity against the
/// high-priority templates
pub fn match_high_priority(
    input: &PhaseInput,
    indices: &[usize],
    library: &TemplateLibrary,
    config: &PatternMatchingConfig,
) -> Vec<DetectedSymbol> {
    let templates = TemplateSet::HighPriority.select(library);
    best_per_contour(
        input,
        indices,
        &templates,
        config.candidate_threshold,
        DetectionMethod::PatternMatching,
        |profile, template| {
            let moment = profile.moment_similarity(&template.profile);
            let geometric = profile.geometric_similarity(&template.profile);
            (0.6 * moment + 0.4 * geometric) * template.ensemble_weight
        },
    )
}

/// Best variant of a template for a region profile
pub fn best_variant<'a>(profile: &ShapeProfile, template: &'a SymbolTemplate) -> Option<(&'a SymbolVariant, f64)> {
    template
        .variants
        .iter()
        .map(|v| (v, variant_score(profile, v)))
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
}

fn variant_score(profile: &ShapeProfile, variant: &SymbolVariant) -> f64 {
    let moment = profile.moment_similarity(&variant.profile);
    let aspect = profile.oriented_aspect_similarity(&variant.profile);
    let descriptor = profile.descriptor_similarity(&variant.profile);
    variant.confidence * (0.5 * moment + 0.3 * aspect + 0.2 * descriptor)
}

/// Matching against precomputed rotation/scale variants
pub fn match_variants(
    input: &PhaseInput,
    indices: &[usize],
    library: &TemplateLibrary,
    set: TemplateSet,
    config: &PatternMatchingConfig,
) -> Vec<DetectedSymbol> {
    let templates = set.select(library);
    best_per_contour(
        input,
        indices,
        &templates,
        config.candidate_threshold,
        DetectionMethod::VariantMatching,
        |profile, template| {
            best_variant(profile, template)
                .map(|(_, s)| s * template.ensemble_weight)
                .unwrap_or(0.0)
        },
    )
}

/// Direct Hu-moment comparison with the canonical template
pub fn match_hu(
    input: &PhaseInput,
    indices: &[usize],
    library: &TemplateLibrary,
    set: TemplateSet,
    config: &PatternMatchingConfig,
) -> Vec<DetectedSymbol> {
    let templates = set.select(library);
    best_per_contour(
        input,
        indices,
        &templates,
        config.candidate_threshold,
        DetectionMethod::HuMoments,
        |profile, template| profile.moment_similarity(&template.profile) * template.ensemble_weight,
    )
}

/// Radial outline signature plus orientation-free geometry
pub fn match_contour_descriptors(
    input: &PhaseInput,
    indices: &[usize],
    library: &TemplateLibrary,
    set: TemplateSet,
    config: &PatternMatchingConfig,
) -> Vec<DetectedSymbol> {
    let templates = set.select(library);
    best_per_contour(
        input,
        indices,
        &templates,
        config.candidate_threshold,
        DetectionMethod::ContourMatching,
        |profile, template| {
            let descriptor = profile.descriptor_similarity(&template.profile);
            let geometric = profile.geometric_similarity(&template.profile);
            (0.6 * descriptor + 0.4 * geometric) * template.ensemble_weight
        },
    )
}

/// Phase 2: variant matching plus direct Hu comparison over every template
pub fn match_invariant(
    input: &PhaseInput,
    indices: &[usize],
    library: &TemplateLibrary,
    config: &PatternMatchingConfig,
) -> Vec<DetectedSymbol> {
    let mut out = match_variants(input, indices, library, TemplateSet::All, config);
    out.extend(match_hu(input, indices, library, TemplateSet::All, config));
    out
}

fn method_weight(method: DetectionMethod) -> f64 {
    match method {
        DetectionMethod::VariantMatching => 0.4,
        DetectionMethod::HuMoments | DetectionMethod::ContourMatching => 0.3,
        _ => 0.2,
    }
}

/// Group ensemble candidates and emit one consensus symbol per group that
/// at least two distinct methods agree on.
///
/// Members share the seed's type, lie within `proximity_px` of its centre
/// and overlap it with IoU > 0.3. Single-method groups are dropped.
pub fn build_consensus(mut candidates: Vec<DetectedSymbol>, proximity_px: f64) -> Vec<DetectedSymbol> {
    crate::detection::geometry::sort_by_confidence(&mut candidates);
    let mut used = vec![false; candidates.len()];
    let mut out = Vec::new();

    for i in 0..candidates.len() {
        if used[i] {
            continue;
        }
        let seed = &candidates[i];
        let mut group = vec![i];
        for (j, other) in candidates.iter().enumerate().skip(i + 1) {
            if used[j] || other.symbol_type != seed.symbol_type {
                continue;
            }
            let close = seed.location.distance(&other.location) <= proximity_px;
            if close && seed.bounding_box.iou(&other.bounding_box) > 0.3 {
                group.push(j);
            }
        }

        let methods: HashSet<DetectionMethod> = group.iter().map(|&g| candidates[g].detection_method).collect();
        if methods.len() < 2 {
            continue;
        }

        let (weighted, weights) = group.iter().fold((0.0, 0.0), |(acc, w), &g| {
            let member = &candidates[g];
            let mw = method_weight(member.detection_method);
            (acc + mw * member.confidence, w + mw)
        });
        let sources: Vec<ConsensusSource> = group
            .iter()
            .map(|&g| {
                let m = &candidates[g];
                ConsensusSource {
                    method: m.detection_method,
                    symbol_type: m.symbol_type,
                    confidence: m.confidence,
                    bounding_box: m.bounding_box,
                }
            })
            .collect();

        let mut features = seed.features.clone();
        features.consensus_sources = sources;
        let symbol = DetectedSymbol::new(seed.symbol_type, weighted / weights, seed.bounding_box, DetectionMethod::Consensus)
            .with_features(features);
        for &g in &group {
            used[g] = true;
        }
        out.push(symbol);
    }
    out
}

/// Phase 4: BRIEF descriptor matching against template keypoints
pub fn match_keypoints(
    input: &PhaseInput,
    indices: &[usize],
    library: &TemplateLibrary,
    config: &PatternMatchingConfig,
) -> Vec<DetectedSymbol> {
    let brief = BriefExtractor::new(REGION_KEYPOINTS);
    let (page_w, page_h) = input.gray.dimensions();
    let mut out = Vec::new();

    for &i in indices {
        let region = input.contours[i].bounding_box.padded(KEYPOINT_PADDING, page_w as f64, page_h as f64);
        let crop = imageops::crop_imm(
            &input.gray,
            region.x as u32,
            region.y as u32,
            region.width.max(1.0) as u32,
            region.height.max(1.0) as u32,
        )
        .to_image();
        let query = brief.detect_and_describe(&crop);
        if query.len() < config.min_keypoint_matches {
            continue;
        }

        let mut best: Option<(&SymbolTemplate, f64)> = None;
        for template in library.templates() {
            let sets = std::iter::once((&template.keypoints, 1.0))
                .chain(template.variants.iter().map(|v| (&v.keypoints, v.confidence)));
            for (keypoints, prior) in sets {
                if let Some(score) = keypoint_score(&query, keypoints, config.min_keypoint_matches) {
                    let confidence = score * prior * template.ensemble_weight;
                    if best.map_or(true, |(_, b)| confidence > b) {
                        best = Some((template, confidence));
                    }
                }
            }
        }

        if let Some((template, confidence)) = best {
            if confidence >= config.candidate_threshold {
                out.push(input.symbol(i, template, confidence, DetectionMethod::PatternMatching));
            }
        }
    }
    out
}

/// Keypoint confidence when at least `min_matches` descriptors agree
pub fn keypoint_score(query: &KeypointSet, train: &KeypointSet, min_matches: usize) -> Option<f64> {
    if train.is_empty() {
        return None;
    }
    let matches = match_descriptors(&query.descriptors, &train.descriptors, MAX_DESCRIPTOR_DISTANCE, RATIO_TEST);
    if matches.len() < min_matches.max(1) {
        return None;
    }
    Some(match_confidence(&matches))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContourConfig;
    use crate::detection::templates::{render_symbol, test_library};
    use crate::types::{BoundingBox, SymbolType};
    use crate::vision::contours::ContourExtractor;
    use crate::vision::frame::PageImage;
    use image::Luma;

    fn page_input(symbols: &[(SymbolType, i64, i64)]) -> PhaseInput {
        let mut page = GrayImage::from_pixel(400, 300, Luma([255]));
        for &(t, x, y) in symbols {
            imageops::overlay(&mut page, &render_symbol(t), x, y);
        }
        let page = PageImage::from_gray(page);
        let extraction = ContourExtractor::new(ContourConfig::default()).extract(&page);
        PhaseInput::new(extraction.contours, extraction.mask, page.gray)
    }

    #[test]
    fn test_high_priority_finds_resistor() {
        let input = page_input(&[(SymbolType::Resistor, 40, 40)]);
        assert_eq!(input.len(), 1);
        let library = test_library();
        let found = match_high_priority(&input, &[0], &library, &PatternMatchingConfig::default());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].symbol_type, SymbolType::Resistor);
        assert!(found[0].confidence > 0.8, "confidence {}", found[0].confidence);
        assert_eq!(found[0].features.template_id.as_deref(), Some("resistor"));
    }

    #[test]
    fn test_variants_match_rotated_symbol() {
        let mut page = GrayImage::from_pixel(300, 300, Luma([255]));
        let rotated = imageops::rotate90(&render_symbol(SymbolType::Resistor));
        imageops::overlay(&mut page, &rotated, 100, 60);
        let page = PageImage::from_gray(page);
        let extraction = ContourExtractor::new(ContourConfig::default()).extract(&page);
        let input = PhaseInput::new(extraction.contours, extraction.mask, page.gray);

        let library = test_library();
        let found = match_variants(&input, &[0], &library, TemplateSet::All, &PatternMatchingConfig::default());
        assert_eq!(found[0].symbol_type, SymbolType::Resistor);
        assert_eq!(found[0].detection_method, DetectionMethod::VariantMatching);
    }

    #[test]
    fn test_consensus_requires_two_methods() {
        let bbox = BoundingBox::new(10.0, 10.0, 60.0, 20.0);
        let a = DetectedSymbol::new(SymbolType::Fuse, 0.8, bbox, DetectionMethod::HuMoments);
        let b = DetectedSymbol::new(SymbolType::Fuse, 0.6, bbox, DetectionMethod::VariantMatching);
        let lonely = DetectedSymbol::new(
            SymbolType::Diode,
            0.9,
            BoundingBox::new(200.0, 10.0, 40.0, 20.0),
            DetectionMethod::ContourMatching,
        );

        let out = build_consensus(vec![a, b, lonely], 30.0);
        assert_eq!(out.len(), 1);
        let consensus = &out[0];
        assert_eq!(consensus.detection_method, DetectionMethod::Consensus);
        assert_eq!(consensus.features.consensus_sources.len(), 2);
        let expected = (0.3 * 0.8 + 0.4 * 0.6) / 0.7;
        assert!((consensus.confidence - expected).abs() < 1e-9);
    }

    #[test]
    fn test_consensus_ignores_distant_same_type() {
        let a = DetectedSymbol::new(
            SymbolType::Fuse,
            0.8,
            BoundingBox::new(0.0, 0.0, 60.0, 20.0),
            DetectionMethod::HuMoments,
        );
        let b = DetectedSymbol::new(
            SymbolType::Fuse,
            0.8,
            BoundingBox::new(100.0, 0.0, 60.0, 20.0),
            DetectionMethod::ContourMatching,
        );
        assert!(build_consensus(vec![a, b], 30.0).is_empty());
    }

    #[test]
    fn test_keypoint_score_requires_minimum_matches() {
        let library = test_library();
        let ic = library.get("integrated_circuit").unwrap();
        assert!(ic.keypoints.len() >= 3);
        let own = keypoint_score(&ic.keypoints, &ic.keypoints, 3).unwrap();
        assert!(own > 0.5);
        assert!(keypoint_score(&ic.keypoints, &KeypointSet::default(), 3).is_none());
    }

    #[test]
    fn test_keypoints_match_drawn_symbol() {
        let input = page_input(&[(SymbolType::IntegratedCircuit, 120, 60)]);
        let largest = (0..input.len())
            .max_by(|&a, &b| {
                input.contours[a]
                    .bounding_box
                    .area()
                    .total_cmp(&input.contours[b].bounding_box.area())
            })
            .unwrap();
        let config = PatternMatchingConfig::default();

        let ic_only = TemplateLibrary::new(vec![SymbolTemplate::builtin(SymbolType::IntegratedCircuit)]);
        let found = match_keypoints(&input, &[largest], &ic_only, &config);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].symbol_type, SymbolType::IntegratedCircuit);
        assert_eq!(found[0].detection_method, DetectionMethod::PatternMatching);
        assert!(found[0].confidence >= config.candidate_threshold);
        assert!(found[0].confidence <= 1.0);

        let found = match_keypoints(&input, &[largest], &test_library(), &config);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].detection_method, DetectionMethod::PatternMatching);
    }
}
