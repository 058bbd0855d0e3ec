//! Application Configuration
//!
//! Detector tuning and job defaults stored in TOML format.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::types::DetectionSettings;

/// Application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Default per-job detection settings
    pub detection: DetectionSettings,
    /// Contour extraction settings
    pub contours: ContourConfig,
    /// Pattern matching engine settings
    pub pattern_matching: PatternMatchingConfig,
    /// ML classification engine settings
    pub ml: MlConfig,
    /// Fusion and validation settings
    pub fusion: FusionConfig,
    /// Result cache settings
    pub cache: CacheConfig,
    /// Job orchestration settings
    pub jobs: JobConfig,
    /// Persistence settings
    pub storage: StorageConfig,
}

/// Contour extraction and candidate filtering
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContourConfig {
    /// Minimum bounding box area in px²
    pub min_area: f64,
    /// Maximum bounding box area in px²
    pub max_area: f64,
    pub min_aspect_ratio: f64,
    pub max_aspect_ratio: f64,
    /// Minimum contour area / bounding box area
    pub min_solidity: f64,
    /// Stretch contrast before binarization
    pub enhance_contrast: bool,
    /// Median filter radius for noise reduction. The default of 0 turns
    /// the filter off: any radius erases one-pixel strokes, so isolated
    /// noise is left to `remove_speckles` instead. Raise it for scanned
    /// pages drawn with heavy strokes.
    pub denoise_radius: u32,
    /// Drop isolated ink pixels after binarization
    pub remove_speckles: bool,
    /// Morphological closing radius (0 disables)
    pub closing_radius: u8,
    /// Keep at most this many candidates, largest first
    pub max_contours: usize,
}

impl Default for ContourConfig {
    fn default() -> Self {
        Self {
            min_area: 100.0,
            max_area: 50_000.0,
            min_aspect_ratio: 0.1,
            max_aspect_ratio: 10.0,
            min_solidity: 0.1,
            enhance_contrast: true,
            denoise_radius: 0,
            remove_speckles: true,
            closing_radius: 1,
            max_contours: 400,
        }
    }
}

/// Pattern matching engine tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternMatchingConfig {
    /// Engine time budget in milliseconds
    pub max_processing_time_ms: u64,
    pub enable_rotation_invariance: bool,
    pub enable_ensemble: bool,
    pub enable_keypoints: bool,
    /// Concurrent contour batches per phase
    pub max_concurrent_batches: usize,
    /// Maximum centroid distance for ensemble grouping
    pub proximity_px: f64,
    /// Lowest score a raw match needs to be considered at all
    pub candidate_threshold: f64,
    /// Fraction of budget that must remain for the invariant phase to start
    pub invariant_phase_min_remaining: f64,
    pub ensemble_phase_min_remaining: f64,
    pub keypoint_phase_min_remaining: f64,
    /// Stop after a phase once this fraction of the budget is spent
    pub termination_elapsed_fraction: f64,
    /// Confidence counted as "high" for early termination
    pub high_confidence: f64,
    /// Distinct symbol types that allow early termination
    pub termination_type_diversity: usize,
    pub min_keypoint_matches: usize,
    pub dedup_iou: f64,
}

impl Default for PatternMatchingConfig {
    fn default() -> Self {
        Self {
            max_processing_time_ms: 30_000,
            enable_rotation_invariance: true,
            enable_ensemble: true,
            enable_keypoints: true,
            max_concurrent_batches: 3,
            proximity_px: 30.0,
            candidate_threshold: 0.35,
            invariant_phase_min_remaining: 0.6,
            ensemble_phase_min_remaining: 0.3,
            keypoint_phase_min_remaining: 0.1,
            termination_elapsed_fraction: 0.8,
            high_confidence: 0.8,
            termination_type_diversity: 5,
            min_keypoint_matches: 3,
            dedup_iou: 0.5,
        }
    }
}

/// ML classification engine tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MlConfig {
    /// Regions per inference batch
    pub batch_size: usize,
    /// Concurrent inference batches
    pub max_concurrent_batches: usize,
    /// Predictions below this top-class probability are discarded
    pub min_confidence: f64,
    /// Upper bound on proposed regions per page
    pub max_regions: usize,
    /// Directory holding geometric/visual/main/combiner ONNX models.
    /// When unset the built-in prototype ensemble is used.
    pub models_dir: Option<PathBuf>,
    /// Live tensor count above which the sweeper reclaims leases
    pub tensor_ceiling: usize,
    /// Minimum lease age before the sweeper may reclaim it
    pub tensor_max_age_ms: u64,
    pub sweep_interval_ms: u64,
    /// Softmax temperature of the prototype layers
    pub prototype_temperature: f32,
}

impl Default for MlConfig {
    fn default() -> Self {
        Self {
            batch_size: 12,
            max_concurrent_batches: 4,
            min_confidence: 0.5,
            max_regions: 200,
            models_dir: None,
            tensor_ceiling: 256,
            tensor_max_age_ms: 10_000,
            sweep_interval_ms: 5_000,
            prototype_temperature: 20.0,
        }
    }
}

/// Fusion weights and domain validation rules
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub pattern_weight: f64,
    pub ml_weight: f64,
    /// IoU above which a pattern match and an ML detection are fused
    pub overlap_iou: f64,
    /// Unmatched ML detections are kept only above this confidence
    pub standalone_ml_confidence: f64,
    /// IoU above which residual duplicates are collapsed
    pub dedup_iou: f64,
    pub min_area: f64,
    pub max_area: f64,
    pub min_aspect_ratio: f64,
    pub max_aspect_ratio: f64,
    /// Minimum long/short side ratio of a resistor body
    pub resistor_min_elongation: f64,
    pub ground_min_aspect: f64,
    pub ground_max_aspect: f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            pattern_weight: 0.4,
            ml_weight: 0.6,
            overlap_iou: 0.3,
            standalone_ml_confidence: 0.6,
            dedup_iou: 0.5,
            min_area: 100.0,
            max_area: 50_000.0,
            min_aspect_ratio: 0.1,
            max_aspect_ratio: 10.0,
            resistor_min_elongation: 1.5,
            ground_min_aspect: 0.7,
            ground_max_aspect: 1.5,
        }
    }
}

/// Result cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Maximum cached results
    pub capacity: usize,
    /// Entry lifetime in seconds
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 256,
            ttl_secs: 3_600,
        }
    }
}

/// Orchestrator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    /// Extra time the supervisor grants past `processing_timeout_ms`
    /// before failing a job outright
    pub hard_deadline_grace_ms: u64,
    /// Finished jobs kept for status queries; the oldest are forgotten first
    pub max_retained_jobs: usize,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            hard_deadline_grace_ms: 2_000,
            max_retained_jobs: 1_024,
        }
    }
}

/// Persistence settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file. In-memory repository when unset.
    pub database_path: Option<PathBuf>,
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: AppConfig = toml::from_str(&content)?;
    Ok(config)
}

/// Save configuration to file
pub fn save_config(config: &AppConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_app_config() {
        let config = AppConfig::default();

        // Detection defaults
        assert_eq!(config.detection.processing_timeout_ms, 30_000);
        assert!(config.detection.enable_ml_classification);
        assert!(config.detection.enable_pattern_matching);

        // Contour window
        assert_eq!(config.contours.min_area, 100.0);
        assert_eq!(config.contours.max_area, 50_000.0);

        // Phase gates
        assert!((config.pattern_matching.invariant_phase_min_remaining - 0.6).abs() < 1e-9);
        assert!((config.pattern_matching.ensemble_phase_min_remaining - 0.3).abs() < 1e-9);
        assert!((config.pattern_matching.keypoint_phase_min_remaining - 0.1).abs() < 1e-9);
        assert_eq!(config.pattern_matching.max_concurrent_batches, 3);

        // Fusion weights
        assert!((config.fusion.pattern_weight + config.fusion.ml_weight - 1.0).abs() < 1e-9);
        assert!(config.ml.models_dir.is_none());
        assert!(config.storage.database_path.is_none());
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let mut config = AppConfig::default();
        config.ml.batch_size = 8;
        config.detection.max_symbols_per_page = 42;
        config.storage.database_path = Some(PathBuf::from("/tmp/symbols.db"));

        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(parsed.ml.batch_size, 8);
        assert_eq!(parsed.detection.max_symbols_per_page, 42);
        assert_eq!(parsed.storage.database_path, Some(PathBuf::from("/tmp/symbols.db")));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let parsed: AppConfig = toml::from_str("[ml]\nbatch_size = 16\n").unwrap();
        assert_eq!(parsed.ml.batch_size, 16);
        assert_eq!(parsed.ml.max_regions, 200);
        assert_eq!(parsed.cache.capacity, 256);
    }

    #[test]
    fn test_save_and_load_config() {
        let config = AppConfig::default();
        let temp_file = NamedTempFile::new().unwrap();

        save_config(&config, temp_file.path()).unwrap();
        let loaded = load_config(temp_file.path()).unwrap();

        assert_eq!(config.cache.ttl_secs, loaded.cache.ttl_secs);
        assert_eq!(config.contours.max_contours, loaded.contours.max_contours);
    }

    #[test]
    fn test_load_config_file_not_found() {
        let result = load_config(Path::new("/nonexistent/path/config.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_config_invalid_toml() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "this is not valid toml {{{{").unwrap();

        let result = load_config(temp_file.path());
        assert!(result.is_err());
    }
}
