//! ONNX Runtime backend
//!
//! Loads externally trained `geometric.onnx`, `visual.onnx`, `main.onnx` and
//! `combiner.onnx` from a models directory. Each model takes one `N x D` f32
//! input and produces one `N x K` probability output.

use anyhow::{bail, Context, Result};
use ndarray::{s, Array2, ArrayView2, Axis};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::TensorRef;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::ml::network::{SymbolClassifier, GEOMETRIC_RANGE, VISUAL_RANGE};
use crate::types::SymbolType;
use crate::vision::features::FEATURE_LEN;

/// Networks of the ensemble, in evaluation order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    Geometric,
    Visual,
    Main,
    Combiner,
}

impl ModelKind {
    pub fn filename(&self) -> &'static str {
        match self {
            ModelKind::Geometric => "geometric.onnx",
            ModelKind::Visual => "visual.onnx",
            ModelKind::Main => "main.onnx",
            ModelKind::Combiner => "combiner.onnx",
        }
    }
}

/// Check that every ensemble model exists under `dir`
pub fn models_available(dir: &Path) -> bool {
    [ModelKind::Geometric, ModelKind::Visual, ModelKind::Main, ModelKind::Combiner]
        .iter()
        .all(|kind| dir.join(kind.filename()).is_file())
}

/// ONNX Runtime session wrapper
pub struct OnnxSession {
    session: Mutex<Session>,
    input_names: Vec<String>,
    output_names: Vec<String>,
    path: PathBuf,
}

impl OnnxSession {
    /// Create a new ONNX session from a model file
    pub fn new(model_path: &Path) -> Result<Self> {
        info!("Loading ONNX model from {:?}", model_path);

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?
            .commit_from_file(model_path)
            .with_context(|| format!("Failed to load ONNX model {:?}", model_path))?;

        let input_names: Vec<String> = session.inputs.iter().map(|input| input.name.clone()).collect();
        let output_names: Vec<String> = session.outputs.iter().map(|output| output.name.clone()).collect();

        info!("Model loaded. Inputs: {:?}, Outputs: {:?}", input_names, output_names);

        if input_names.is_empty() || output_names.is_empty() {
            bail!("model {:?} must have at least one input and one output", model_path);
        }

        Ok(Self {
            session: Mutex::new(session),
            input_names,
            output_names,
            path: model_path.to_path_buf(),
        })
    }

    pub fn input_names(&self) -> &[String] {
        &self.input_names
    }

    pub fn output_names(&self) -> &[String] {
        &self.output_names
    }

    /// Run the model on one `N x D` batch, returning `N x K`
    pub fn run(&self, batch: ArrayView2<'_, f32>) -> Result<Array2<f32>> {
        let rows = batch.nrows();
        let contiguous = batch.as_standard_layout();
        let input = TensorRef::from_array_view(contiguous.view())?;

        let mut session = self.session.lock();
        let outputs = session
            .run(ort::inputs![self.input_names[0].as_str() => input])
            .with_context(|| format!("inference failed for {:?}", self.path))?;
        let (shape, data) = outputs[self.output_names[0].as_str()].try_extract_tensor::<f32>()?;

        let dims: Vec<i64> = shape.iter().copied().collect();
        let cols = match dims.as_slice() {
            [n, k] if *n as usize == rows => *k as usize,
            other => bail!("{:?} produced output shape {:?} for {} rows", self.path, other, rows),
        };
        Ok(Array2::from_shape_vec((rows, cols), data.to_vec())?)
    }
}

/// Four-model ensemble backed by ONNX Runtime
pub struct OnnxEnsemble {
    geometric: OnnxSession,
    visual: OnnxSession,
    main: OnnxSession,
    combiner: OnnxSession,
}

impl OnnxEnsemble {
    pub fn load(dir: &Path) -> Result<Self> {
        let open = |kind: ModelKind| OnnxSession::new(&dir.join(kind.filename()));
        Ok(Self {
            geometric: open(ModelKind::Geometric)?,
            visual: open(ModelKind::Visual)?,
            main: open(ModelKind::Main)?,
            combiner: open(ModelKind::Combiner)?,
        })
    }
}

impl SymbolClassifier for OnnxEnsemble {
    fn name(&self) -> &str {
        "onnx-ensemble"
    }

    fn num_classes(&self) -> usize {
        SymbolType::ALL.len()
    }

    fn classify(&self, batch: ArrayView2<'_, f32>) -> Result<Array2<f32>> {
        if batch.ncols() != FEATURE_LEN {
            bail!("expected {} feature columns, got {}", FEATURE_LEN, batch.ncols());
        }
        let geometric = self.geometric.run(batch.slice(s![.., GEOMETRIC_RANGE]))?;
        let visual = self.visual.run(batch.slice(s![.., VISUAL_RANGE]))?;
        let main = self.main.run(batch)?;

        let k = self.num_classes();
        for (name, out) in [("geometric", &geometric), ("visual", &visual), ("main", &main)] {
            if out.ncols() != k {
                bail!("{} model emits {} classes, expected {}", name, out.ncols(), k);
            }
        }
        let stacked = ndarray::concatenate(Axis(1), &[geometric.view(), visual.view(), main.view()])?;
        self.combiner.run(stacked.view())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_filenames() {
        assert_eq!(ModelKind::Geometric.filename(), "geometric.onnx");
        assert_eq!(ModelKind::Combiner.filename(), "combiner.onnx");
    }

    #[test]
    fn test_models_available_requires_all_four() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!models_available(dir.path()));
        for kind in [ModelKind::Geometric, ModelKind::Visual, ModelKind::Main] {
            std::fs::write(dir.path().join(kind.filename()), b"stub").unwrap();
        }
        assert!(!models_available(dir.path()));
        std::fs::write(dir.path().join(ModelKind::Combiner.filename()), b"stub").unwrap();
        assert!(models_available(dir.path()));
    }

    #[test]
    fn test_load_missing_models_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(OnnxEnsemble::load(dir.path()).is_err());
    }
}
