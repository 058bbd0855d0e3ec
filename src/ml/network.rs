//! Layered classifier ensemble
//!
//! Four networks cooperate: a geometric specialist (17 inputs), a visual
//! specialist (12 inputs), a main classifier (all 44 inputs) and a combiner
//! that maps the concatenated `3K` specialist probabilities to the final
//! `K`-way distribution.
//!
//! The built-in [`PrototypeEnsemble`] derives its layers from the template
//! library: every template and variant signature becomes a unit-norm
//! prototype column, a region scores each class by its best cosine match,
//! and a temperature softmax turns scores into probabilities.

use anyhow::{bail, Result};
use ndarray::{s, Array1, Array2, ArrayView2, Axis};

use crate::detection::templates::TemplateLibrary;
use crate::types::SymbolType;
use crate::vision::features::{FEATURE_LEN, GEOMETRIC_LEN, VISUAL_LEN};

/// Column range of the geometric group in the feature vector
pub const GEOMETRIC_RANGE: std::ops::Range<usize> = 0..GEOMETRIC_LEN;
/// Column range of the visual group in the feature vector
pub const VISUAL_RANGE: std::ops::Range<usize> = GEOMETRIC_LEN..GEOMETRIC_LEN + VISUAL_LEN;

/// Share of each specialist in the combiner output
const COMBINER_WEIGHTS: [f32; 3] = [0.25, 0.25, 0.5];

/// Maps a batch of feature rows to per-class probabilities
pub trait SymbolClassifier: Send + Sync {
    fn name(&self) -> &str;

    /// Number of output classes, in [`SymbolType::ALL`] order
    fn num_classes(&self) -> usize;

    /// `batch` is `N x FEATURE_LEN`; returns `N x num_classes()` rows that
    /// each sum to 1
    fn classify(&self, batch: ArrayView2<'_, f32>) -> Result<Array2<f32>>;
}

/// Fully connected layer, `y = x W + b`
#[derive(Debug, Clone)]
pub struct DenseLayer {
    /// `inputs x outputs`
    pub weights: Array2<f32>,
    pub bias: Array1<f32>,
}

impl DenseLayer {
    pub fn new(weights: Array2<f32>, bias: Array1<f32>) -> Result<Self> {
        if weights.ncols() != bias.len() {
            bail!(
                "dense layer has {} outputs but {} bias terms",
                weights.ncols(),
                bias.len()
            );
        }
        Ok(Self { weights, bias })
    }

    pub fn inputs(&self) -> usize {
        self.weights.nrows()
    }

    pub fn outputs(&self) -> usize {
        self.weights.ncols()
    }

    pub fn forward(&self, x: ArrayView2<'_, f32>) -> Result<Array2<f32>> {
        if x.ncols() != self.inputs() {
            bail!("dense layer expects {} inputs, got {}", self.inputs(), x.ncols());
        }
        Ok(x.dot(&self.weights) + &self.bias)
    }
}

/// Row-wise softmax, numerically stabilised
pub fn softmax_rows(mut logits: Array2<f32>) -> Array2<f32> {
    for mut row in logits.axis_iter_mut(Axis(0)) {
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        if !max.is_finite() {
            let uniform = 1.0 / row.len().max(1) as f32;
            row.fill(uniform);
            continue;
        }
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        if sum > 0.0 {
            row.mapv_inplace(|v| v / sum);
        }
    }
    logits
}

fn l2_normalize_rows(mut x: Array2<f32>) -> Array2<f32> {
    for mut row in x.axis_iter_mut(Axis(0)) {
        let norm = row.dot(&row).sqrt();
        if norm > f32::EPSILON {
            row.mapv_inplace(|v| v / norm);
        }
    }
    x
}

/// Cosine-prototype classifier over one slice of the feature vector
#[derive(Debug, Clone)]
pub struct PrototypeHead {
    name: &'static str,
    columns: std::ops::Range<usize>,
    /// Unit prototypes as columns, no bias
    layer: DenseLayer,
    /// Class index of every prototype column
    classes: Vec<usize>,
    num_classes: usize,
    temperature: f32,
}

impl PrototypeHead {
    pub fn new(
        name: &'static str,
        columns: std::ops::Range<usize>,
        prototypes: &[(usize, Vec<f32>)],
        num_classes: usize,
        temperature: f32,
    ) -> Result<Self> {
        let width = columns.len();
        let mut rows = Array2::<f32>::zeros((prototypes.len(), width));
        for (i, (_, signature)) in prototypes.iter().enumerate() {
            if signature.len() < columns.end {
                bail!(
                    "prototype signature has {} values, {} head needs {}",
                    signature.len(),
                    name,
                    columns.end
                );
            }
            rows.row_mut(i)
                .assign(&ndarray::ArrayView1::from(&signature[columns.clone()]));
        }
        let weights = l2_normalize_rows(rows).reversed_axes();
        let bias = Array1::zeros(prototypes.len());

        Ok(Self {
            name,
            columns,
            layer: DenseLayer::new(weights, bias)?,
            classes: prototypes.iter().map(|(c, _)| *c).collect(),
            num_classes,
            temperature,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// `N x FEATURE_LEN` in, `N x K` probabilities out
    pub fn forward(&self, batch: ArrayView2<'_, f32>) -> Result<Array2<f32>> {
        if batch.ncols() < self.columns.end {
            bail!(
                "{} head needs {} feature columns, got {}",
                self.name,
                self.columns.end,
                batch.ncols()
            );
        }
        let inputs = l2_normalize_rows(batch.slice(s![.., self.columns.clone()]).to_owned());
        let similarity = self.layer.forward(inputs.view())?;

        // Classes without a prototype keep the lowest possible cosine
        let mut logits = Array2::<f32>::from_elem((batch.nrows(), self.num_classes), -self.temperature);
        for (row, sims) in similarity.axis_iter(Axis(0)).enumerate() {
            for (col, &sim) in sims.iter().enumerate() {
                let class = self.classes[col];
                let scaled = sim * self.temperature;
                if scaled > logits[[row, class]] {
                    logits[[row, class]] = scaled;
                }
            }
        }
        Ok(softmax_rows(logits))
    }
}

/// Built-in ensemble derived from template signatures
pub struct PrototypeEnsemble {
    geometric: PrototypeHead,
    visual: PrototypeHead,
    main: PrototypeHead,
    combiner: DenseLayer,
    num_classes: usize,
}

impl PrototypeEnsemble {
    pub fn from_library(library: &TemplateLibrary, temperature: f32) -> Result<Self> {
        let num_classes = SymbolType::ALL.len();
        let mut prototypes: Vec<(usize, Vec<f32>)> = Vec::new();
        for template in library.templates() {
            let class = template.symbol_type.index();
            prototypes.push((class, template.feature_signature.clone()));
            for variant in &template.variants {
                prototypes.push((class, variant.feature_signature.clone()));
            }
        }
        if prototypes.is_empty() {
            bail!("template library has no feature signatures");
        }

        Ok(Self {
            geometric: PrototypeHead::new("geometric", GEOMETRIC_RANGE, &prototypes, num_classes, temperature)?,
            visual: PrototypeHead::new("visual", VISUAL_RANGE, &prototypes, num_classes, temperature)?,
            main: PrototypeHead::new("main", 0..FEATURE_LEN, &prototypes, num_classes, temperature)?,
            combiner: weighted_combiner(num_classes)?,
            num_classes,
        })
    }

    pub fn heads(&self) -> [&PrototypeHead; 3] {
        [&self.geometric, &self.visual, &self.main]
    }
}

impl SymbolClassifier for PrototypeEnsemble {
    fn name(&self) -> &str {
        "prototype-ensemble"
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn classify(&self, batch: ArrayView2<'_, f32>) -> Result<Array2<f32>> {
        let geometric = self.geometric.forward(batch)?;
        let visual = self.visual.forward(batch)?;
        let main = self.main.forward(batch)?;
        let stacked = ndarray::concatenate(Axis(1), &[geometric.view(), visual.view(), main.view()])?;
        self.combiner.forward(stacked.view())
    }
}

/// `3K -> K` layer averaging the three specialist distributions
pub fn weighted_combiner(num_classes: usize) -> Result<DenseLayer> {
    let mut weights = Array2::<f32>::zeros((3 * num_classes, num_classes));
    for (block, weight) in COMBINER_WEIGHTS.iter().enumerate() {
        for class in 0..num_classes {
            weights[[block * num_classes + class, class]] = *weight;
        }
    }
    DenseLayer::new(weights, Array1::zeros(num_classes))
}

/// Index and value of the largest entry of a row
pub fn argmax(row: &[f32]) -> Option<(usize, f32)> {
    row.iter()
        .copied()
        .enumerate()
        .filter(|(_, p)| p.is_finite())
        .fold(None, |best: Option<(usize, f32)>, (i, p)| match best {
            Some((_, bp)) if bp >= p => best,
            _ => Some((i, p)),
        })
}

/// Certain every region is a fuse; the first `fast_calls` batches answer at
/// once and every later batch sleeps for `stall` first
#[cfg(test)]
pub(crate) struct StallingClassifier {
    pub fast_calls: usize,
    pub stall: std::time::Duration,
    pub calls: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl StallingClassifier {
    pub fn new(fast_calls: usize, stall: std::time::Duration) -> Self {
        Self {
            fast_calls,
            stall,
            calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }
}

#[cfg(test)]
impl SymbolClassifier for StallingClassifier {
    fn name(&self) -> &str {
        "stalling"
    }

    fn num_classes(&self) -> usize {
        SymbolType::ALL.len()
    }

    fn classify(&self, batch: ArrayView2<'_, f32>) -> Result<Array2<f32>> {
        let call = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if call >= self.fast_calls {
            std::thread::sleep(self.stall);
        }
        let mut out = Array2::zeros((batch.nrows(), self.num_classes()));
        out.column_mut(SymbolType::Fuse.index()).fill(1.0);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::templates::test_library;
    use ndarray::array;

    #[test]
    fn test_dense_layer_forward() {
        let layer = DenseLayer::new(array![[1.0, 0.0], [0.0, 2.0]], array![0.5, -1.0]).unwrap();
        let out = layer.forward(array![[1.0, 1.0]].view()).unwrap();
        assert_eq!(out, array![[1.5, 1.0]]);
        assert!(layer.forward(array![[1.0, 1.0, 1.0]].view()).is_err());
    }

    #[test]
    fn test_dense_layer_rejects_bias_mismatch() {
        assert!(DenseLayer::new(Array2::zeros((2, 3)), Array1::zeros(2)).is_err());
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let probs = softmax_rows(array![[1.0, 2.0, 3.0], [1000.0, 1000.0, 0.0]]);
        for row in probs.axis_iter(Axis(0)) {
            assert!((row.sum() - 1.0).abs() < 1e-5);
        }
        assert!((probs[[1, 0]] - 0.5).abs() < 1e-5);
    }

    #[test]
    fn test_combiner_preserves_distributions() {
        let combiner = weighted_combiner(2).unwrap();
        let stacked = array![[1.0, 0.0, 0.0, 1.0, 1.0, 0.0]];
        let out = combiner.forward(stacked.view()).unwrap();
        assert!((out[[0, 0]] - 0.75).abs() < 1e-6);
        assert!((out[[0, 1]] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_main_head_recognises_template_signature() {
        let library = test_library();
        let ensemble = PrototypeEnsemble::from_library(&library, 20.0).unwrap();
        for symbol_type in [SymbolType::Resistor, SymbolType::IntegratedCircuit] {
            let template = library.by_type(symbol_type).unwrap();
            let batch = Array2::from_shape_vec((1, FEATURE_LEN), template.feature_signature.clone()).unwrap();
            let probs = ensemble.main.forward(batch.view()).unwrap();
            let row: Vec<f32> = probs.row(0).to_vec();
            assert_eq!(argmax(&row).map(|(i, _)| i), Some(symbol_type.index()));
        }
    }

    #[test]
    fn test_ensemble_output_shape_and_normalisation() {
        let library = test_library();
        let ensemble = PrototypeEnsemble::from_library(&library, 20.0).unwrap();
        let mut batch = Array2::<f32>::zeros((3, FEATURE_LEN));
        batch
            .row_mut(1)
            .assign(&ndarray::ArrayView1::from(&library.templates()[0].feature_signature[..]));
        let probs = ensemble.classify(batch.view()).unwrap();
        assert_eq!(probs.dim(), (3, SymbolType::ALL.len()));
        for row in probs.axis_iter(Axis(0)) {
            assert!((row.sum() - 1.0).abs() < 1e-4);
        }
        // A featureless region is uniform and never confident
        assert!(probs.row(0).iter().all(|&p| p < 0.5));
    }

    #[test]
    fn test_argmax_skips_nan() {
        assert_eq!(argmax(&[0.1, f32::NAN, 0.7, 0.2]), Some((2, 0.7)));
        assert_eq!(argmax(&[]), None);
    }
}
