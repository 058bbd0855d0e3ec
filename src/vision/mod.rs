//! Vision Layer
//!
//! Page decoding, binarization, contour extraction and the per-region shape
//! and feature descriptors both detectors consume.

pub mod contours;
pub mod features;
pub mod frame;
pub mod keypoints;
pub mod moments;
pub mod preprocess;

pub use contours::{ContourExtraction, ContourExtractor};
pub use features::{FeatureContext, FeatureExtractor, FeatureVector, HoughSummary, RegionFeatures, FEATURE_LEN};
pub use frame::PageImage;
pub use keypoints::{BriefExtractor, KeypointSet};
pub use preprocess::{preprocess_page, PreprocessResult};
