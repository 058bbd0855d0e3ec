//! Page detection pipeline
//!
//! Decode, pattern matching, ML classification and fusion for one page,
//! under the job's processing timeout. Both detectors receive the deadline
//! and stop scheduling work when it passes; the pipeline then fuses the
//! symbols already found and flags the result as timed out.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{AppConfig, PatternMatchingConfig};
use crate::detection::pattern::{PatternMatchingEngine, PatternOptions};
use crate::detection::templates::TemplateLibrary;
use crate::error::{DetectionError, Result};
use crate::fusion::FusionEngine;
use crate::ml::{MlClassificationEngine, TensorRuntime};
use crate::types::{DetectedSymbol, DetectionMetadata, DetectionSettings, SymbolDetectionResult};
use crate::vision::frame::PageImage;

/// Named progress stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    ImageProcessing,
    PatternMatching,
    MlClassification,
    Validation,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::ImageProcessing => "image_processing",
            Stage::PatternMatching => "pattern_matching",
            Stage::MlClassification => "ml_classification",
            Stage::Validation => "validation",
        }
    }

    /// Progress percentage reported when the stage starts
    pub fn start_percent(&self) -> u8 {
        match self {
            Stage::ImageProcessing => 0,
            Stage::PatternMatching => 10,
            Stage::MlClassification => 50,
            Stage::Validation => 85,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageProgress {
    pub stage: Stage,
    pub percent: u8,
    pub elapsed_ms: u64,
}

/// Receives stage progress while a page is processed
pub type ProgressFn<'a> = dyn Fn(StageProgress) + Send + Sync + 'a;

/// Pattern engine, ML engine and fusion wired together
pub struct SymbolDetectionPipeline {
    pattern: PatternMatchingEngine,
    ml: MlClassificationEngine,
    fusion: FusionEngine,
    pattern_config: PatternMatchingConfig,
}

impl SymbolDetectionPipeline {
    pub fn new(
        pattern: PatternMatchingEngine,
        ml: MlClassificationEngine,
        fusion: FusionEngine,
        pattern_config: PatternMatchingConfig,
    ) -> Self {
        Self {
            pattern,
            ml,
            fusion,
            pattern_config,
        }
    }

    /// Build every engine from the application config
    pub fn from_config(config: &AppConfig, library: Arc<TemplateLibrary>, runtime: TensorRuntime) -> anyhow::Result<Self> {
        let ml = MlClassificationEngine::from_config(&library, config.ml.clone(), config.contours.clone(), runtime)?;
        let pattern = PatternMatchingEngine::new(library, config.pattern_matching.clone(), config.contours.clone());
        Ok(Self::new(
            pattern,
            ml,
            FusionEngine::new(config.fusion.clone()),
            config.pattern_matching.clone(),
        ))
    }

    pub fn ml(&self) -> &MlClassificationEngine {
        &self.ml
    }

    /// Run detection on one encoded page
    pub async fn run(
        &self,
        image: &[u8],
        settings: &DetectionSettings,
        document_id: &str,
        page_number: u32,
        cancel: &CancellationToken,
        progress: &ProgressFn<'_>,
    ) -> Result<SymbolDetectionResult> {
        let start = Instant::now();
        let deadline = start + Duration::from_millis(settings.processing_timeout_ms);
        let report = |stage: Stage, percent: u8| {
            progress(StageProgress {
                stage,
                percent,
                elapsed_ms: start.elapsed().as_millis() as u64,
            })
        };
        let mut metadata = DetectionMetadata {
            llm_validation_skipped: settings.enable_llm_validation,
            ..Default::default()
        };

        report(Stage::ImageProcessing, Stage::ImageProcessing.start_percent());
        let bytes = image.to_vec();
        let page = tokio::task::spawn_blocking(move || PageImage::decode(&bytes))
            .await
            .map_err(|e| DetectionError::ImageProcessing(format!("decode task failed: {}", e)))??;
        let page = Arc::new(page);
        metadata.image_width = page.width;
        metadata.image_height = page.height;
        metadata.raw_raster_fallback = page.raw_raster_fallback;
        check_cancelled(cancel)?;

        let mut pattern_symbols: Vec<DetectedSymbol> = Vec::new();
        if settings.enable_pattern_matching {
            report(Stage::PatternMatching, Stage::PatternMatching.start_percent());
            match remaining(deadline) {
                None => metadata.timed_out = true,
                Some(left) => {
                    let stage_start = Instant::now();
                    let mut options = PatternOptions::from_settings(settings, &self.pattern_config);
                    options.max_processing_time_ms = options.max_processing_time_ms.min(left.as_millis() as u64);

                    let pattern = self.pattern.detect_page(page.clone(), &options, cancel).await?;
                    metadata.contours_found = pattern.contours_found;
                    metadata.fallback_contours = pattern.fallback_contours;
                    metadata.phases_completed = pattern.phases_completed;
                    metadata.early_termination = pattern.early_termination;
                    pattern_symbols = pattern.symbols;
                    if Instant::now() >= deadline {
                        warn!(
                            "Pattern matching hit the {}ms processing timeout, keeping {} symbols",
                            settings.processing_timeout_ms,
                            pattern_symbols.len()
                        );
                        metadata.timed_out = true;
                    }
                    metadata.pattern_matching_time_ms = stage_start.elapsed().as_millis() as u64;
                }
            }
            check_cancelled(cancel)?;
        }
        pattern_symbols.retain(|s| s.confidence >= settings.confidence_threshold);
        metadata.pattern_symbols = pattern_symbols.len();

        let mut ml_symbols: Vec<DetectedSymbol> = Vec::new();
        if settings.enable_ml_classification {
            report(Stage::MlClassification, Stage::MlClassification.start_percent());
            match remaining(deadline).filter(|_| !metadata.timed_out) {
                None => metadata.timed_out = true,
                Some(_) => {
                    let stage_start = Instant::now();
                    let ml = self
                        .ml
                        .classify_page(page.clone(), &pattern_symbols, Some(deadline), cancel)
                        .await?;
                    metadata.failed_ml_batches = ml.failed_batches;
                    ml_symbols = ml.symbols;
                    if ml.timed_out {
                        warn!(
                            "ML classification hit the {}ms processing timeout, {} of {} batches unfinished",
                            settings.processing_timeout_ms,
                            ml.skipped_batches,
                            ml.batches
                        );
                        metadata.timed_out = true;
                    }
                    metadata.ml_classification_time_ms = stage_start.elapsed().as_millis() as u64;
                }
            }
            check_cancelled(cancel)?;
        }
        ml_symbols.retain(|s| s.confidence >= settings.confidence_threshold);
        metadata.ml_symbols = ml_symbols.len();

        report(Stage::Validation, Stage::Validation.start_percent());
        let fusion_start = Instant::now();
        let fused = self.fusion.fuse(pattern_symbols, ml_symbols);
        let mut symbols: Vec<DetectedSymbol> = fused
            .symbols
            .into_iter()
            .filter(|s| s.confidence >= settings.confidence_threshold)
            .collect();
        symbols.truncate(settings.max_symbols_per_page);
        metadata.fusion_time_ms = fusion_start.elapsed().as_millis() as u64;
        metadata.fusion_fallback = fused.fallback;
        metadata.consensus_symbols = symbols
            .iter()
            .filter(|s| s.detection_method == crate::types::DetectionMethod::Consensus)
            .count();
        report(Stage::Validation, 100);

        let elapsed = start.elapsed().as_millis() as u64;
        if metadata.timed_out {
            warn!(
                "Page {} of {} finalized after timeout with {} partial symbols",
                page_number,
                document_id,
                symbols.len()
            );
        }
        if metadata.is_degraded() {
            debug!("Degraded result metadata: {:?}", metadata);
        }
        info!(
            "Detected {} symbols on page {} of {} in {}ms",
            symbols.len(),
            page_number,
            document_id,
            elapsed
        );

        Ok(SymbolDetectionResult::new(document_id, page_number, symbols, elapsed, metadata))
    }
}

fn remaining(deadline: Instant) -> Option<Duration> {
    let left = deadline.saturating_duration_since(Instant::now());
    (!left.is_zero()).then_some(left)
}

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(DetectionError::Cancelled)
    } else {
        Ok(())
    }
}
