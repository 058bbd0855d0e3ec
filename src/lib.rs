//! Schematic Symbols
//!
//! Detection of electrical symbols on schematic page images. Geometric
//! pattern matching and a neural ensemble run independently on each page,
//! and a consensus layer fuses and validates their detections.

pub mod config;
pub mod detection;
pub mod error;
pub mod fusion;
pub mod jobs;
pub mod ml;
pub mod pipeline;
pub mod storage;
pub mod types;
pub mod vision;

pub use error::{DetectionError, Result};
pub use jobs::{DetectionJob, DetectionOrchestrator, JobStatus};
pub use pipeline::SymbolDetectionPipeline;
pub use types::{DetectedSymbol, DetectionSettings, SymbolDetectionResult, SymbolType};
