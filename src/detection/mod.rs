//! Geometric symbol detection
//!
//! Template library, overlap helpers and the phased pattern matching engine.

pub mod batches;
pub mod geometry;
pub mod pattern;
pub mod phases;
pub mod templates;

pub use geometry::{max_pairwise_iou, non_maximum_suppression};
pub use pattern::{PatternMatchingEngine, PatternOptions, PatternReport, Phase};
pub use templates::{render_symbol, ShapeProfile, SymbolTemplate, SymbolVariant, TemplateLibrary, TemplatePriority};
