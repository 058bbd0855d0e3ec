//! Neural symbol classification
//!
//! Proposes candidate regions on a page, extracts their feature vectors and
//! pushes them through a [`SymbolClassifier`] in bounded-concurrency batches.

pub mod network;
pub mod onnx;
pub mod tensors;

use image::{GrayImage, Luma};
use imageproc::region_labelling::{connected_components, Connectivity};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ContourConfig, MlConfig};
use crate::detection::batches::collect_until;
use crate::detection::templates::TemplateLibrary;
use crate::error::{DetectionError, Result};
use crate::types::{BoundingBox, DetectedSymbol, DetectionMethod, SymbolFeatures, SymbolType};
use crate::vision::features::{FeatureContext, FeatureExtractor, RegionFeatures, FEATURE_LEN};
use crate::vision::frame::PageImage;
use crate::vision::preprocess::preprocess_page;

pub use network::{PrototypeEnsemble, SymbolClassifier};
pub use onnx::OnnxEnsemble;
pub use tensors::{TensorLease, TensorRuntime, TensorScope, TensorStats};

/// Proposals overlapping a kept proposal by more than this are dropped
const PROPOSAL_DEDUP_IOU: f64 = 0.7;
/// Padding around boxes reported by other detectors
const EXISTING_PADDING: f64 = 4.0;

/// What one classification call did
#[derive(Debug, Clone, Default)]
pub struct MlReport {
    pub symbols: Vec<DetectedSymbol>,
    pub regions_proposed: usize,
    pub batches: usize,
    pub failed_batches: usize,
    pub skipped_batches: usize,
    pub cancelled: bool,
    /// Batches were abandoned at the deadline
    pub timed_out: bool,
    pub elapsed_ms: u64,
}

struct Region {
    bbox: BoundingBox,
    features: RegionFeatures,
}

enum BatchResult {
    Done(Vec<Option<DetectedSymbol>>),
    Failed,
    Skipped,
}

/// Region proposal plus batched ensemble inference
pub struct MlClassificationEngine {
    classifier: Arc<dyn SymbolClassifier>,
    runtime: TensorRuntime,
    config: MlConfig,
    contours: ContourConfig,
}

impl MlClassificationEngine {
    pub fn new(
        classifier: Arc<dyn SymbolClassifier>,
        runtime: TensorRuntime,
        config: MlConfig,
        contours: ContourConfig,
    ) -> Self {
        Self {
            classifier,
            runtime,
            config,
            contours,
        }
    }

    /// Pick the backend: ONNX models when `models_dir` holds all four,
    /// otherwise the prototype ensemble built from `library`
    pub fn from_config(
        library: &TemplateLibrary,
        config: MlConfig,
        contours: ContourConfig,
        runtime: TensorRuntime,
    ) -> anyhow::Result<Self> {
        let classifier: Arc<dyn SymbolClassifier> = match &config.models_dir {
            Some(dir) if onnx::models_available(dir) => Arc::new(OnnxEnsemble::load(dir)?),
            Some(dir) => {
                warn!(
                    "Models directory {:?} is incomplete, using the built-in prototype ensemble",
                    dir
                );
                Arc::new(PrototypeEnsemble::from_library(library, config.prototype_temperature)?)
            }
            None => Arc::new(PrototypeEnsemble::from_library(library, config.prototype_temperature)?),
        };
        info!("ML classification backend: {}", classifier.name());
        Ok(Self::new(classifier, runtime, config, contours))
    }

    pub fn runtime(&self) -> &TensorRuntime {
        &self.runtime
    }

    pub fn classifier_name(&self) -> &str {
        self.classifier.name()
    }

    /// Classify symbols in an encoded page image
    pub async fn classify(&self, image: &[u8], existing: &[DetectedSymbol]) -> Result<Vec<DetectedSymbol>> {
        let page = PageImage::decode(image).map_err(|e| self.wrap_error(e, image.len(), existing.len()))?;
        let report = self
            .classify_page(Arc::new(page), existing, None, &CancellationToken::new())
            .await?;
        Ok(report.symbols)
    }

    fn wrap_error(&self, error: DetectionError, buffer_size: usize, existing_symbols: usize) -> DetectionError {
        match error {
            already @ DetectionError::MlClassification { .. } => already,
            other => DetectionError::MlClassification {
                message: other.to_string(),
                buffer_size,
                existing_symbols,
            },
        }
    }

    /// Propose regions on a decoded page and classify them. Batches not
    /// started by `deadline` are skipped and batches still running then are
    /// abandoned; everything already classified is kept.
    pub async fn classify_page(
        &self,
        page: Arc<PageImage>,
        existing: &[DetectedSymbol],
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> Result<MlReport> {
        let start = Instant::now();
        let mut report = MlReport::default();

        let existing_boxes: Vec<BoundingBox> = existing.iter().map(|s| s.bounding_box).collect();
        let contours = self.contours.clone();
        let max_regions = self.config.max_regions;
        let page_for_regions = page.clone();
        let regions = tokio::task::spawn_blocking(move || {
            extract_regions(&page_for_regions, &existing_boxes, &contours, max_regions)
        })
        .await
        .map_err(|e| DetectionError::MlClassification {
            message: format!("region extraction task failed: {}", e),
            buffer_size: page.buffer_len,
            existing_symbols: existing.len(),
        })?;
        report.regions_proposed = regions.len();
        let regions = Arc::new(regions);

        let batch_size = self.config.batch_size.max(1);
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_batches.max(1)));
        let indices: Vec<usize> = (0..regions.len()).collect();

        let tasks: Vec<_> = indices
            .chunks(batch_size)
            .map(|chunk| {
                let chunk = chunk.to_vec();
                let regions = regions.clone();
                let classifier = self.classifier.clone();
                let runtime = self.runtime.clone();
                let semaphore = semaphore.clone();
                let cancel = cancel.clone();
                let min_confidence = self.config.min_confidence;
                async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return BatchResult::Skipped;
                    };
                    if cancel.is_cancelled() || deadline.is_some_and(|d| Instant::now() >= d) {
                        return BatchResult::Skipped;
                    }
                    let joined = tokio::task::spawn_blocking(move || {
                        run_batch(&regions, &chunk, classifier.as_ref(), &runtime, min_confidence)
                    })
                    .await;
                    match joined {
                        Ok(Ok(symbols)) => BatchResult::Done(symbols),
                        Ok(Err(e)) => {
                            warn!("Inference batch failed: {:#}", e);
                            BatchResult::Failed
                        }
                        Err(e) => {
                            warn!("Inference batch task failed: {}", e);
                            BatchResult::Failed
                        }
                    }
                }
            })
            .collect();

        report.batches = tasks.len();
        let collected = collect_until(tasks, deadline, cancel).await;
        report.skipped_batches = collected.abandoned;
        report.timed_out = collected.deadline_hit;
        for result in collected.done {
            match result {
                BatchResult::Done(symbols) => report.symbols.extend(symbols.into_iter().flatten()),
                BatchResult::Failed => report.failed_batches += 1,
                BatchResult::Skipped => report.skipped_batches += 1,
            }
        }
        report.cancelled = cancel.is_cancelled();

        report.symbols.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        report.elapsed_ms = start.elapsed().as_millis() as u64;

        info!(
            "ML classification kept {} of {} regions in {}ms ({} batches, {} failed, {} skipped)",
            report.symbols.len(),
            report.regions_proposed,
            report.elapsed_ms,
            report.batches,
            report.failed_batches,
            report.skipped_batches
        );
        Ok(report)
    }
}

fn extract_regions(
    page: &PageImage,
    existing: &[BoundingBox],
    contours: &ContourConfig,
    max_regions: usize,
) -> Vec<Region> {
    let pre = preprocess_page(&page.gray, contours);
    let boxes = propose_regions(&pre.mask, existing, contours, max_regions);
    let extractor = FeatureExtractor::new();
    let context = FeatureContext {
        page_mask: &pre.mask,
        neighbours: &boxes,
    };
    boxes
        .iter()
        .map(|bbox| Region {
            bbox: *bbox,
            features: extractor.extract_from_page(&pre.enhanced, &pre.mask, bbox, Some(&context)),
        })
        .collect()
}

/// Classify one batch inside its own tensor scope
fn run_batch(
    regions: &[Region],
    indices: &[usize],
    classifier: &dyn SymbolClassifier,
    runtime: &TensorRuntime,
    min_confidence: f64,
) -> anyhow::Result<Vec<Option<DetectedSymbol>>> {
    let mut flat = Vec::with_capacity(indices.len() * FEATURE_LEN);
    for &i in indices {
        flat.extend(regions[i].features.normalized());
    }

    let mut scope = runtime.scope();
    let input = scope.allocate(indices.len(), FEATURE_LEN, &flat);
    let probabilities = input
        .with_view(|view| classifier.classify(view))
        .ok_or_else(|| anyhow::anyhow!("input tensor {} was reclaimed before inference", input.id()))??;

    if probabilities.nrows() != indices.len() {
        anyhow::bail!(
            "classifier returned {} rows for {} regions",
            probabilities.nrows(),
            indices.len()
        );
    }

    Ok(indices
        .iter()
        .zip(probabilities.rows())
        .map(|(&i, row)| {
            let row: Vec<f32> = row.to_vec();
            to_symbol(&regions[i], &row, min_confidence)
        })
        .collect())
}

fn to_symbol(region: &Region, probabilities: &[f32], min_confidence: f64) -> Option<DetectedSymbol> {
    let (class, confidence) = network::argmax(probabilities)?;
    let confidence = confidence as f64;
    if confidence < min_confidence {
        return None;
    }
    let symbol_type = SymbolType::from_index(class)?;
    let features = SymbolFeatures {
        geometric: region.features.geometric.clone(),
        invariant_moments: region.features.hu_moments.to_vec(),
        class_probabilities: SymbolType::ALL
            .iter()
            .zip(probabilities.iter())
            .map(|(t, p)| (*t, *p as f64))
            .collect(),
        ..Default::default()
    };
    Some(
        DetectedSymbol::new(symbol_type, confidence, region.bbox, DetectionMethod::MlClassification)
            .with_features(features),
    )
}

/// Candidate regions: padded boxes from other detectors first, then ink
/// components inside the size and aspect window, largest first
pub fn propose_regions(
    mask: &GrayImage,
    existing: &[BoundingBox],
    contours: &ContourConfig,
    max_regions: usize,
) -> Vec<BoundingBox> {
    let (w, h) = (mask.width() as f64, mask.height() as f64);
    let mut candidates: Vec<BoundingBox> = existing
        .iter()
        .map(|b| b.padded(EXISTING_PADDING, w, h))
        .filter(|b| b.area() > 0.0)
        .collect();

    let mut components = component_boxes(mask);
    components.retain(|b| {
        let area = b.area();
        let aspect = b.aspect_ratio();
        area >= contours.min_area
            && area <= contours.max_area
            && aspect >= contours.min_aspect_ratio
            && aspect <= contours.max_aspect_ratio
    });
    components.sort_by(|a, b| b.area().partial_cmp(&a.area()).unwrap_or(std::cmp::Ordering::Equal));
    candidates.extend(components);

    let mut kept: Vec<BoundingBox> = Vec::new();
    for candidate in candidates {
        if kept.len() >= max_regions {
            break;
        }
        if kept.iter().all(|k| k.iou(&candidate) <= PROPOSAL_DEDUP_IOU) {
            kept.push(candidate);
        }
    }
    debug!("Proposed {} regions ({} from other detectors)", kept.len(), existing.len());
    kept
}

/// Bounding box of every 8-connected ink component
fn component_boxes(mask: &GrayImage) -> Vec<BoundingBox> {
    let labels = connected_components(mask, Connectivity::Eight, Luma([0u8]));
    let mut extents: HashMap<u32, (u32, u32, u32, u32)> = HashMap::new();
    for (x, y, label) in labels.enumerate_pixels() {
        let label = label[0];
        if label == 0 {
            continue;
        }
        extents
            .entry(label)
            .and_modify(|e| {
                e.0 = e.0.min(x);
                e.1 = e.1.min(y);
                e.2 = e.2.max(x);
                e.3 = e.3.max(y);
            })
            .or_insert((x, y, x, y));
    }
    let mut boxes: Vec<(u32, BoundingBox)> = extents
        .into_iter()
        .map(|(label, (x0, y0, x1, y1))| {
            (
                label,
                BoundingBox::new(x0 as f64, y0 as f64, (x1 - x0 + 1) as f64, (y1 - y0 + 1) as f64),
            )
        })
        .collect();
    boxes.sort_by_key(|(label, _)| *label);
    boxes.into_iter().map(|(_, b)| b).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::templates::{render_symbol, test_library};
    use crate::ml::network::StallingClassifier;
    use image::imageops;
    use ndarray::{Array2, ArrayView2};
    use std::io::Cursor;
    use std::time::Duration;

    fn engine() -> MlClassificationEngine {
        MlClassificationEngine::from_config(
            &test_library(),
            MlConfig::default(),
            ContourConfig::default(),
            TensorRuntime::default(),
        )
        .unwrap()
    }

    fn page_with(symbols: &[(SymbolType, i64, i64)]) -> GrayImage {
        let mut page = GrayImage::from_pixel(480, 320, Luma([255]));
        for &(t, x, y) in symbols {
            imageops::overlay(&mut page, &render_symbol(t), x, y);
        }
        page
    }

    fn png(page: &GrayImage) -> Vec<u8> {
        let mut bytes = Vec::new();
        page.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png).unwrap();
        bytes
    }

    struct FailingClassifier;

    impl SymbolClassifier for FailingClassifier {
        fn name(&self) -> &str {
            "failing"
        }

        fn num_classes(&self) -> usize {
            SymbolType::ALL.len()
        }

        fn classify(&self, _batch: ArrayView2<'_, f32>) -> anyhow::Result<Array2<f32>> {
            anyhow::bail!("model exploded")
        }
    }

    /// Always certain the region is a fuse
    struct FuseClassifier;

    impl SymbolClassifier for FuseClassifier {
        fn name(&self) -> &str {
            "fuse"
        }

        fn num_classes(&self) -> usize {
            SymbolType::ALL.len()
        }

        fn classify(&self, batch: ArrayView2<'_, f32>) -> anyhow::Result<Array2<f32>> {
            let mut out = Array2::zeros((batch.nrows(), self.num_classes()));
            out.column_mut(SymbolType::Fuse.index()).fill(1.0);
            Ok(out)
        }
    }

    #[test]
    fn test_component_proposals_respect_window() {
        let mut mask = GrayImage::new(200, 100);
        // 30x20 block, a 2x2 speck and a 150x1 line
        for y in 10..30 {
            for x in 10..40 {
                mask.put_pixel(x, y, Luma([255]));
            }
        }
        for (x, y) in [(100, 50), (101, 50), (100, 51), (101, 51)] {
            mask.put_pixel(x, y, Luma([255]));
        }
        for x in 20..170 {
            mask.put_pixel(x, 90, Luma([255]));
        }
        let boxes = propose_regions(&mask, &[], &ContourConfig::default(), 10);
        assert_eq!(boxes, vec![BoundingBox::new(10.0, 10.0, 30.0, 20.0)]);
    }

    #[test]
    fn test_existing_boxes_are_proposed_first_and_deduplicated() {
        let mut mask = GrayImage::new(200, 100);
        for y in 20..80 {
            for x in 20..120 {
                mask.put_pixel(x, y, Luma([255]));
            }
        }
        let existing = [BoundingBox::new(20.0, 20.0, 100.0, 60.0)];
        let boxes = propose_regions(&mask, &existing, &ContourConfig::default(), 10);
        assert_eq!(boxes.len(), 1);
        assert_eq!(boxes[0], BoundingBox::new(16.0, 16.0, 108.0, 68.0));
    }

    #[test]
    fn test_max_regions_caps_proposals() {
        let mut mask = GrayImage::new(300, 40);
        for i in 0..5u32 {
            for y in 5..25 {
                for x in (i * 50 + 5)..(i * 50 + 35) {
                    mask.put_pixel(x, y, Luma([255]));
                }
            }
        }
        assert_eq!(propose_regions(&mask, &[], &ContourConfig::default(), 3).len(), 3);
    }

    #[tokio::test]
    async fn test_classifies_drawn_resistor() {
        let page = page_with(&[(SymbolType::Resistor, 40, 40), (SymbolType::IntegratedCircuit, 260, 60)]);
        let symbols = engine().classify(&png(&page), &[]).await.unwrap();

        assert!(!symbols.is_empty());
        for symbol in &symbols {
            assert_eq!(symbol.detection_method, DetectionMethod::MlClassification);
            assert!(symbol.confidence >= 0.5 && symbol.confidence <= 1.0);
            assert_eq!(symbol.features.class_probabilities.len(), SymbolType::ALL.len());
        }
        let types: Vec<SymbolType> = symbols.iter().map(|s| s.symbol_type).collect();
        assert!(types.contains(&SymbolType::Resistor), "found {:?}", types);
    }

    #[tokio::test]
    async fn test_failed_batches_are_not_fatal() {
        let engine = MlClassificationEngine::new(
            Arc::new(FailingClassifier),
            TensorRuntime::default(),
            MlConfig::default(),
            ContourConfig::default(),
        );
        let page = page_with(&[(SymbolType::Resistor, 40, 40)]);
        let report = engine
            .classify_page(Arc::new(PageImage::from_gray(page)), &[], None, &CancellationToken::new())
            .await
            .unwrap();
        assert!(report.symbols.is_empty());
        assert_eq!(report.failed_batches, report.batches);
        assert!(report.batches >= 1);
        assert_eq!(engine.runtime().live_count(), 0);
    }

    #[tokio::test]
    async fn test_batches_release_tensors() {
        let config = MlConfig {
            batch_size: 1,
            ..MlConfig::default()
        };
        let engine = MlClassificationEngine::new(
            Arc::new(FuseClassifier),
            TensorRuntime::default(),
            config,
            ContourConfig::default(),
        );
        let page = page_with(&[(SymbolType::Resistor, 40, 40), (SymbolType::Capacitor, 300, 100)]);
        let report = engine
            .classify_page(Arc::new(PageImage::from_gray(page)), &[], None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.batches, report.regions_proposed);
        assert!(report.symbols.iter().all(|s| s.symbol_type == SymbolType::Fuse));
        let stats = engine.runtime().stats();
        assert_eq!(stats.live, 0);
        assert_eq!(stats.allocated, report.batches as u64);
    }

    #[tokio::test]
    async fn test_deadline_keeps_finished_batches() {
        let config = MlConfig {
            batch_size: 1,
            max_concurrent_batches: 1,
            ..MlConfig::default()
        };
        let engine = MlClassificationEngine::new(
            Arc::new(StallingClassifier::new(1, Duration::from_millis(2_000))),
            TensorRuntime::default(),
            config,
            ContourConfig::default(),
        );
        let page = page_with(&[
            (SymbolType::Resistor, 20, 20),
            (SymbolType::IntegratedCircuit, 200, 40),
            (SymbolType::Capacitor, 40, 200),
        ]);
        let deadline = Instant::now() + Duration::from_millis(800);
        let report = engine
            .classify_page(
                Arc::new(PageImage::from_gray(page)),
                &[],
                Some(deadline),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(report.batches >= 2);
        assert!(report.timed_out);
        assert!(!report.cancelled);
        assert!(!report.symbols.is_empty());
        assert!(report.symbols.iter().all(|s| s.symbol_type == SymbolType::Fuse));
        assert_eq!(report.skipped_batches, report.batches - 1);
    }

    #[tokio::test]
    async fn test_cancelled_call_skips_batches() {
        let page = page_with(&[(SymbolType::Resistor, 40, 40)]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = engine()
            .classify_page(Arc::new(PageImage::from_gray(page)), &[], None, &cancel)
            .await
            .unwrap();
        assert!(report.cancelled);
        assert!(report.symbols.is_empty());
        assert_eq!(report.skipped_batches, report.batches);
    }

    #[tokio::test]
    async fn test_empty_buffer_is_ml_error() {
        let existing = vec![DetectedSymbol::new(
            SymbolType::Resistor,
            0.9,
            BoundingBox::new(0.0, 0.0, 20.0, 10.0),
            DetectionMethod::PatternMatching,
        )];
        let err = engine().classify(&[], &existing).await.unwrap_err();
        match err {
            DetectionError::MlClassification {
                buffer_size,
                existing_symbols,
                ..
            } => {
                assert_eq!(buffer_size, 0);
                assert_eq!(existing_symbols, 1);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }
}
