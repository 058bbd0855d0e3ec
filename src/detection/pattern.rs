//! Time-budgeted pattern matching engine
//!
//! Runs the high-priority, invariant, ensemble and keypoint phases in that
//! order. Each phase only starts while enough of the budget remains, fans
//! contour batches out to blocking workers behind a semaphore, and is
//! followed by an early-termination check.

use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ContourConfig, PatternMatchingConfig};
use crate::detection::batches::collect_until;
use crate::detection::geometry::non_maximum_suppression;
use crate::detection::phases::{self, PhaseInput, TemplateSet};
use crate::detection::templates::TemplateLibrary;
use crate::error::{DetectionError, Result};
use crate::types::{DetectedSymbol, DetectionSettings, SymbolType};
use crate::vision::contours::ContourExtractor;
use crate::vision::frame::PageImage;

/// Per-call matching options
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PatternOptions {
    pub max_processing_time_ms: u64,
    pub max_symbols: usize,
    pub confidence_threshold: f64,
    pub enable_rotation_invariance: bool,
    pub enable_ensemble: bool,
    pub enable_keypoints: bool,
}

impl PatternOptions {
    pub fn from_settings(settings: &DetectionSettings, config: &PatternMatchingConfig) -> Self {
        Self {
            max_processing_time_ms: config.max_processing_time_ms.min(settings.processing_timeout_ms),
            max_symbols: settings.max_symbols_per_page,
            confidence_threshold: settings.confidence_threshold,
            enable_rotation_invariance: config.enable_rotation_invariance,
            enable_ensemble: config.enable_ensemble,
            enable_keypoints: config.enable_keypoints,
        }
    }

    pub fn budget(&self) -> Duration {
        Duration::from_millis(self.max_processing_time_ms)
    }
}

impl Default for PatternOptions {
    fn default() -> Self {
        Self::from_settings(&DetectionSettings::default(), &PatternMatchingConfig::default())
    }
}

/// Pattern phases in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    HighPriority,
    Invariant,
    Ensemble,
    Keypoint,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::HighPriority => "high_priority",
            Phase::Invariant => "invariant",
            Phase::Ensemble => "ensemble",
            Phase::Keypoint => "keypoint",
        }
    }
}

/// Everything the engine learned about one page
#[derive(Debug, Clone, Default)]
pub struct PatternReport {
    pub symbols: Vec<DetectedSymbol>,
    pub contours_found: usize,
    pub fallback_contours: bool,
    pub phases_completed: Vec<String>,
    pub early_termination: Option<String>,
    pub elapsed_ms: u64,
    pub budget_exceeded: bool,
    pub cancelled: bool,
    pub failed_batches: usize,
}

/// Wall-clock budget of one detect call
#[derive(Debug, Clone, Copy)]
struct Budget {
    start: Instant,
    total: Duration,
}

impl Budget {
    fn new(total: Duration) -> Self {
        Self {
            start: Instant::now(),
            total,
        }
    }

    fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    fn elapsed_fraction(&self) -> f64 {
        if self.total.is_zero() {
            return 1.0;
        }
        self.elapsed().as_secs_f64() / self.total.as_secs_f64()
    }

    fn remaining_fraction(&self) -> f64 {
        (1.0 - self.elapsed_fraction()).max(0.0)
    }

    fn exceeded(&self) -> bool {
        self.elapsed() >= self.total
    }

    fn deadline(&self) -> Instant {
        self.start + self.total
    }
}

type Matcher = dyn Fn(&PhaseInput, &[usize]) -> Vec<DetectedSymbol> + Send + Sync;

fn matcher_fn<F>(f: F) -> Arc<Matcher>
where
    F: Fn(&PhaseInput, &[usize]) -> Vec<DetectedSymbol> + Send + Sync + 'static,
{
    Arc::new(f)
}

struct BatchOutcome {
    symbols: Vec<DetectedSymbol>,
    failed: usize,
    skipped: usize,
}

/// Contour-based geometric symbol matcher
pub struct PatternMatchingEngine {
    library: Arc<TemplateLibrary>,
    config: Arc<PatternMatchingConfig>,
    extractor: ContourExtractor,
}

impl PatternMatchingEngine {
    pub fn new(library: Arc<TemplateLibrary>, config: PatternMatchingConfig, contours: ContourConfig) -> Self {
        Self {
            library,
            config: Arc::new(config),
            extractor: ContourExtractor::new(contours),
        }
    }

    pub fn library(&self) -> &Arc<TemplateLibrary> {
        &self.library
    }

    /// Detect symbols in an encoded page image
    pub async fn detect(&self, image: &[u8], options: &PatternOptions) -> Result<Vec<DetectedSymbol>> {
        let start = Instant::now();
        let page = PageImage::decode(image).map_err(|e| self.wrap_error(e, image.len(), options, start))?;
        let report = self
            .detect_page(Arc::new(page), options, &CancellationToken::new())
            .await
            .map_err(|e| self.wrap_error(e, image.len(), options, start))?;
        Ok(report.symbols)
    }

    fn wrap_error(&self, error: DetectionError, buffer_size: usize, options: &PatternOptions, start: Instant) -> DetectionError {
        match error {
            already @ DetectionError::PatternMatching { .. } => already,
            other => {
                let elapsed = start.elapsed();
                DetectionError::PatternMatching {
                    message: other.to_string(),
                    buffer_size,
                    options: serde_json::to_string(options).unwrap_or_else(|_| format!("{:?}", options)),
                    elapsed_ms: elapsed.as_millis() as u64,
                    budget_exceeded: elapsed >= options.budget(),
                }
            }
        }
    }

    /// Run all phases on a decoded page and report what happened
    pub async fn detect_page(
        &self,
        page: Arc<PageImage>,
        options: &PatternOptions,
        cancel: &CancellationToken,
    ) -> Result<PatternReport> {
        let budget = Budget::new(options.budget());
        let mut report = PatternReport::default();

        let extractor = self.extractor.clone();
        let page_for_extract = page.clone();
        let input = tokio::task::spawn_blocking(move || {
            let extraction = extractor.extract(&page_for_extract);
            let fallback = extraction.fallback;
            let input = PhaseInput::new(extraction.contours, extraction.mask, page_for_extract.gray.clone());
            (input, fallback)
        })
        .await
        .map_err(|e| DetectionError::PatternMatching {
            message: format!("contour extraction task failed: {}", e),
            buffer_size: page.buffer_len,
            options: format!("{:?}", options),
            elapsed_ms: budget.elapsed().as_millis() as u64,
            budget_exceeded: budget.exceeded(),
        })?;
        let (input, fallback) = input;
        report.contours_found = input.len();
        report.fallback_contours = fallback;
        let input = Arc::new(input);

        let batch_size = batch_size_for(page.pixel_count(), input.len());
        let all: Vec<usize> = (0..input.len()).collect();
        let mut detections: Vec<DetectedSymbol> = Vec::new();

        debug!(
            "Pattern matching {} contours in batches of {} (budget {}ms)",
            input.len(),
            batch_size,
            options.max_processing_time_ms
        );

        for phase in [Phase::HighPriority, Phase::Invariant, Phase::Ensemble, Phase::Keypoint] {
            if cancel.is_cancelled() {
                report.cancelled = true;
                report.early_termination = Some("cancelled".to_string());
                break;
            }
            if !self.phase_enabled(phase, options) {
                continue;
            }
            if !self.should_start(phase, &budget) {
                debug!(
                    "Skipping {} phase: {:.0}% of budget left, needs {:.0}%",
                    phase.as_str(),
                    budget.remaining_fraction() * 100.0,
                    self.phase_gate(phase) * 100.0
                );
                report.budget_exceeded |= budget.exceeded();
                continue;
            }

            let phase_start = Instant::now();
            let produced = match phase {
                Phase::Ensemble => self.run_ensemble(&input, &all, batch_size, &budget, cancel).await,
                Phase::Keypoint => {
                    // Contours already matched with high confidence need no keypoints
                    let pending: Vec<usize> = all
                        .iter()
                        .copied()
                        .filter(|&i| {
                            let bbox = &input.contours[i].bounding_box;
                            !detections
                                .iter()
                                .any(|d| d.confidence >= self.config.high_confidence && d.bounding_box.iou(bbox) > 0.5)
                        })
                        .collect();
                    let matcher = self.matcher(phase);
                    self.run_batched(&input, &pending, batch_size, &budget, cancel, matcher).await
                }
                _ => {
                    let matcher = self.matcher(phase);
                    self.run_batched(&input, &all, batch_size, &budget, cancel, matcher).await
                }
            };

            report.failed_batches += produced.failed;
            if produced.skipped > 0 {
                report.budget_exceeded |= budget.exceeded();
            }
            debug!(
                "{} phase produced {} candidates in {:?}",
                phase.as_str(),
                produced.symbols.len(),
                phase_start.elapsed()
            );
            detections.extend(produced.symbols);
            report.phases_completed.push(phase.as_str().to_string());

            if let Some(reason) = self.should_terminate(&detections, options, &budget) {
                debug!("Early termination after {} phase: {}", phase.as_str(), reason);
                report.early_termination = Some(reason);
                break;
            }
        }

        report.symbols = finalize(detections, options, self.config.dedup_iou);
        report.elapsed_ms = budget.elapsed().as_millis() as u64;
        report.budget_exceeded |= budget.exceeded();

        info!(
            "Pattern matching found {} symbols from {} contours in {}ms (phases: {:?})",
            report.symbols.len(),
            report.contours_found,
            report.elapsed_ms,
            report.phases_completed
        );
        Ok(report)
    }

    fn phase_enabled(&self, phase: Phase, options: &PatternOptions) -> bool {
        match phase {
            Phase::HighPriority => true,
            Phase::Invariant => options.enable_rotation_invariance,
            Phase::Ensemble => options.enable_ensemble,
            Phase::Keypoint => options.enable_keypoints,
        }
    }

    fn should_start(&self, phase: Phase, budget: &Budget) -> bool {
        budget.remaining_fraction() >= self.phase_gate(phase)
    }

    /// Minimum remaining budget fraction needed to start a phase
    fn phase_gate(&self, phase: Phase) -> f64 {
        match phase {
            // Starts as long as any budget is left
            Phase::HighPriority => f64::MIN_POSITIVE,
            Phase::Invariant => self.config.invariant_phase_min_remaining,
            Phase::Ensemble => self.config.ensemble_phase_min_remaining,
            Phase::Keypoint => self.config.keypoint_phase_min_remaining,
        }
    }

    fn matcher(&self, phase: Phase) -> Arc<Matcher> {
        let library = self.library.clone();
        let config = self.config.clone();
        match phase {
            Phase::HighPriority => matcher_fn(move |input: &PhaseInput, idx: &[usize]| {
                phases::match_high_priority(input, idx, &library, &config)
            }),
            Phase::Invariant => matcher_fn(move |input: &PhaseInput, idx: &[usize]| {
                phases::match_invariant(input, idx, &library, &config)
            }),
            Phase::Ensemble => matcher_fn(move |input: &PhaseInput, idx: &[usize]| {
                phases::match_variants(input, idx, &library, TemplateSet::Ensemble, &config)
            }),
            Phase::Keypoint => matcher_fn(move |input: &PhaseInput, idx: &[usize]| {
                phases::match_keypoints(input, idx, &library, &config)
            }),
        }
    }

    /// Hu, variant and descriptor matchers run concurrently, then agree
    async fn run_ensemble(
        &self,
        input: &Arc<PhaseInput>,
        indices: &[usize],
        batch_size: usize,
        budget: &Budget,
        cancel: &CancellationToken,
    ) -> BatchOutcome {
        let library = self.library.clone();
        let config = self.config.clone();
        let hu = {
            let (library, config) = (library.clone(), config.clone());
            matcher_fn(move |input: &PhaseInput, idx: &[usize]| {
                phases::match_hu(input, idx, &library, TemplateSet::Ensemble, &config)
            })
        };
        let variants = self.matcher(Phase::Ensemble);
        let descriptors = matcher_fn(move |input: &PhaseInput, idx: &[usize]| {
            phases::match_contour_descriptors(input, idx, &library, TemplateSet::Ensemble, &config)
        });

        let (a, b, c) = tokio::join!(
            self.run_batched(input, indices, batch_size, budget, cancel, hu),
            self.run_batched(input, indices, batch_size, budget, cancel, variants),
            self.run_batched(input, indices, batch_size, budget, cancel, descriptors),
        );

        let mut candidates = a.symbols;
        candidates.extend(b.symbols);
        candidates.extend(c.symbols);
        BatchOutcome {
            symbols: phases::build_consensus(candidates, self.config.proximity_px),
            failed: a.failed + b.failed + c.failed,
            skipped: a.skipped + b.skipped + c.skipped,
        }
    }

    /// Fan contour batches out to blocking workers, at most
    /// `max_concurrent_batches` at a time. Batches that have not started
    /// when the budget runs out or the job is cancelled are skipped, and
    /// batches still running at the end of the budget are abandoned.
    async fn run_batched(
        &self,
        input: &Arc<PhaseInput>,
        indices: &[usize],
        batch_size: usize,
        budget: &Budget,
        cancel: &CancellationToken,
        matcher: Arc<Matcher>,
    ) -> BatchOutcome {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_batches.max(1)));
        let tasks: Vec<_> = indices
            .chunks(batch_size.max(1))
            .map(|chunk| {
                let chunk = chunk.to_vec();
                let input = input.clone();
                let matcher = matcher.clone();
                let semaphore = semaphore.clone();
                let cancel = cancel.clone();
                let budget = *budget;
                async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return BatchResult::Skipped;
                    };
                    if cancel.is_cancelled() || budget.exceeded() {
                        return BatchResult::Skipped;
                    }
                    match tokio::task::spawn_blocking(move || matcher(input.as_ref(), chunk.as_slice())).await {
                        Ok(symbols) => BatchResult::Done(symbols),
                        Err(e) => {
                            warn!("Pattern batch failed: {}", e);
                            BatchResult::Failed
                        }
                    }
                }
            })
            .collect();

        let collected = collect_until(tasks, Some(budget.deadline()), cancel).await;
        if collected.abandoned > 0 {
            debug!("Abandoned {} pattern batches still running", collected.abandoned);
        }
        let mut outcome = BatchOutcome {
            symbols: Vec::new(),
            failed: 0,
            skipped: collected.abandoned,
        };
        for result in collected.done {
            match result {
                BatchResult::Done(symbols) => outcome.symbols.extend(symbols),
                BatchResult::Failed => outcome.failed += 1,
                BatchResult::Skipped => outcome.skipped += 1,
            }
        }
        outcome
    }

    fn should_terminate(&self, detections: &[DetectedSymbol], options: &PatternOptions, budget: &Budget) -> Option<String> {
        if budget.elapsed_fraction() > self.config.termination_elapsed_fraction {
            return Some("time_budget".to_string());
        }

        let max = options.max_symbols.max(1);
        let high = detections
            .iter()
            .filter(|d| d.confidence >= self.config.high_confidence)
            .count();
        if high >= max {
            return Some("high_confidence_quota".to_string());
        }

        let types: std::collections::HashSet<SymbolType> = detections.iter().map(|d| d.symbol_type).collect();
        if types.len() >= self.config.termination_type_diversity && detections.len() as f64 >= 0.8 * max as f64 {
            return Some("type_diversity".to_string());
        }
        None
    }
}

enum BatchResult {
    Done(Vec<DetectedSymbol>),
    Failed,
    Skipped,
}

/// Contours per batch: smaller batches for larger pages, and never fewer
/// than three batches when there is enough work
pub fn batch_size_for(pixel_count: u64, contour_count: usize) -> usize {
    let base = if pixel_count > 4_000_000 {
        8
    } else if pixel_count > 1_000_000 {
        16
    } else {
        32
    };
    base.min(contour_count.div_ceil(3)).max(1)
}

/// Threshold, suppress duplicates, rank and truncate
pub fn finalize(detections: Vec<DetectedSymbol>, options: &PatternOptions, dedup_iou: f64) -> Vec<DetectedSymbol> {
    let filtered: Vec<DetectedSymbol> = detections
        .into_iter()
        .filter(|d| d.confidence >= options.confidence_threshold)
        .collect();
    let mut kept = non_maximum_suppression(filtered, dedup_iou);
    kept.truncate(options.max_symbols);
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::geometry::max_pairwise_iou;
    use crate::detection::templates::{render_symbol, test_library};
    use crate::types::{BoundingBox, DetectionMethod};
    use image::{imageops, GrayImage, Luma};
    use std::io::Cursor;

    fn engine() -> PatternMatchingEngine {
        PatternMatchingEngine::new(test_library(), PatternMatchingConfig::default(), ContourConfig::default())
    }

    fn schematic_png(symbols: &[(SymbolType, i64, i64)]) -> Vec<u8> {
        let mut page = GrayImage::from_pixel(480, 320, Luma([255]));
        for &(t, x, y) in symbols {
            imageops::overlay(&mut page, &render_symbol(t), x, y);
        }
        let mut bytes = Vec::new();
        page.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png).unwrap();
        bytes
    }

    #[test]
    fn test_batch_size() {
        assert_eq!(batch_size_for(640 * 480, 300), 32);
        assert_eq!(batch_size_for(640 * 480, 9), 3);
        assert_eq!(batch_size_for(2_000_000, 300), 16);
        assert_eq!(batch_size_for(5_000_000, 300), 8);
        assert_eq!(batch_size_for(100, 0), 1);
    }

    #[tokio::test]
    async fn test_detects_drawn_symbols() {
        let png = schematic_png(&[
            (SymbolType::Resistor, 20, 20),
            (SymbolType::IntegratedCircuit, 200, 40),
            (SymbolType::Ground, 360, 200),
        ]);
        let symbols = engine().detect(&png, &PatternOptions::default()).await.unwrap();

        let types: Vec<SymbolType> = symbols.iter().map(|s| s.symbol_type).collect();
        assert!(types.contains(&SymbolType::Resistor), "found {:?}", types);
        assert!(types.contains(&SymbolType::IntegratedCircuit), "found {:?}", types);
        assert!(max_pairwise_iou(&symbols) <= 0.5);
        assert!(symbols.iter().all(|s| (0.0..=1.0).contains(&s.confidence)));
        assert!(symbols.windows(2).all(|w| w[0].confidence >= w[1].confidence));
    }

    #[tokio::test]
    async fn test_empty_buffer_is_pattern_error() {
        let err = engine().detect(&[], &PatternOptions::default()).await.unwrap_err();
        match err {
            DetectionError::PatternMatching { buffer_size, budget_exceeded, .. } => {
                assert_eq!(buffer_size, 0);
                assert!(!budget_exceeded);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_max_symbols_truncates() {
        let png = schematic_png(&[
            (SymbolType::Resistor, 20, 20),
            (SymbolType::IntegratedCircuit, 200, 40),
            (SymbolType::Diode, 20, 200),
        ]);
        let options = PatternOptions {
            max_symbols: 1,
            ..PatternOptions::default()
        };
        let symbols = engine().detect(&png, &options).await.unwrap();
        assert!(symbols.len() <= 1);
    }

    #[tokio::test]
    async fn test_cancelled_token_runs_no_phases() {
        let page = PageImage::decode(&schematic_png(&[(SymbolType::Resistor, 20, 20)])).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = engine()
            .detect_page(Arc::new(page), &PatternOptions::default(), &cancel)
            .await
            .unwrap();
        assert!(report.cancelled);
        assert!(report.phases_completed.is_empty());
        assert!(report.symbols.is_empty());
    }

    #[tokio::test]
    async fn test_zero_budget_skips_gated_phases() {
        let page = PageImage::decode(&schematic_png(&[(SymbolType::Resistor, 20, 20)])).unwrap();
        let options = PatternOptions {
            max_processing_time_ms: 0,
            ..PatternOptions::default()
        };
        let report = engine()
            .detect_page(Arc::new(page), &options, &CancellationToken::new())
            .await
            .unwrap();
        assert!(report.budget_exceeded);
        assert!(!report.phases_completed.contains(&"invariant".to_string()));
        assert!(!report.phases_completed.contains(&"keypoint".to_string()));
    }

    #[tokio::test]
    async fn test_early_termination_on_high_confidence_quota() {
        let page = PageImage::decode(&schematic_png(&[(SymbolType::Resistor, 20, 20)])).unwrap();
        let options = PatternOptions {
            max_symbols: 1,
            ..PatternOptions::default()
        };
        let report = engine()
            .detect_page(Arc::new(page), &options, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.phases_completed, vec!["high_priority".to_string()]);
        assert_eq!(report.early_termination.as_deref(), Some("high_confidence_quota"));
    }

    fn budget_started_ago(elapsed_ms: u64, total_ms: u64) -> Budget {
        Budget {
            start: Instant::now().checked_sub(Duration::from_millis(elapsed_ms)).unwrap(),
            total: Duration::from_millis(total_ms),
        }
    }

    fn detections(types: &[SymbolType], confidence: f64) -> Vec<DetectedSymbol> {
        types
            .iter()
            .enumerate()
            .map(|(i, &t)| {
                let bbox = BoundingBox::new(i as f64 * 80.0, 0.0, 60.0, 30.0);
                DetectedSymbol::new(t, confidence, bbox, DetectionMethod::ContourMatching)
            })
            .collect()
    }

    #[test]
    fn test_termination_on_time_budget() {
        let engine = engine();
        let options = PatternOptions::default();
        assert_eq!(
            engine.should_terminate(&[], &options, &budget_started_ago(900, 1_000)).as_deref(),
            Some("time_budget")
        );
        assert_eq!(engine.should_terminate(&[], &options, &budget_started_ago(100, 60_000)), None);
    }

    #[test]
    fn test_termination_on_type_diversity() {
        let engine = engine();
        let options = PatternOptions {
            max_symbols: 5,
            ..PatternOptions::default()
        };
        let budget = budget_started_ago(0, 60_000);
        let five = [
            SymbolType::Resistor,
            SymbolType::Capacitor,
            SymbolType::Diode,
            SymbolType::Inductor,
            SymbolType::Ground,
        ];

        let diverse = detections(&five, 0.6);
        assert_eq!(
            engine.should_terminate(&diverse, &options, &budget).as_deref(),
            Some("type_diversity")
        );

        let four_types = detections(&[five[0], five[1], five[2], five[3], five[0]], 0.6);
        assert_eq!(engine.should_terminate(&four_types, &options, &budget), None);

        let wide = PatternOptions {
            max_symbols: 100,
            ..PatternOptions::default()
        };
        assert_eq!(engine.should_terminate(&diverse, &wide, &budget), None);
    }

    #[test]
    fn test_phase_gates_follow_remaining_budget() {
        let engine = engine();

        let early = budget_started_ago(300, 1_000);
        assert!(engine.should_start(Phase::Invariant, &early));

        // 55% left is under the 60% invariant gate but over the ensemble gate
        let midway = budget_started_ago(450, 1_000);
        assert!(engine.should_start(Phase::HighPriority, &midway));
        assert!(!engine.should_start(Phase::Invariant, &midway));
        assert!(engine.should_start(Phase::Ensemble, &midway));

        let late = budget_started_ago(950, 1_000);
        assert!(!engine.should_start(Phase::Keypoint, &late));
        assert!(engine.should_start(Phase::HighPriority, &late));

        let spent = budget_started_ago(1_500, 1_000);
        assert!(!engine.should_start(Phase::HighPriority, &spent));
    }
}
