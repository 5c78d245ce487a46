// GelSense HILS - Touch Classifier
//
// Frozen multilayer perceptron exported by the offline training workflow as
// a versioned JSON bundle.  The bundle carries the network, the decision
// head and the no-contact training baseline the inputs were normalised
// against.  A loaded model is immutable; swapping models means loading a
// new one and replacing the `Arc`.
//
// Bundle layout:
//   format_version     : 1
//   feature_mode       : "fixed" | "sweep"
//   input_dim          : N
//   hidden_activation  : "relu" | "tanh" | "logistic" | "identity"
//   layers[]           : { weights[out][in], biases[out] }
//   head               : { kind: "binary" } | { kind: "grid", cells: [{x,y}] }
//                        | { kind: "regression" }
//   baseline           : { mean[N], std[N] }

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::MODEL_FORMAT_VERSION;
use crate::drift::TrainingBaseline;
use crate::error::{Error, Result};
use crate::events::{Decision, FeatureVector, Point};
use crate::features::FeatureMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    #[default]
    Relu,
    Tanh,
    Logistic,
    Identity,
}

impl Activation {
    fn apply(self, v: f64) -> f64 {
        match self {
            Self::Relu => v.max(0.0),
            Self::Tanh => v.tanh(),
            Self::Logistic => sigmoid(v),
            Self::Identity => v,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Head {
    /// One logistic output: press probability.
    Binary,
    /// Softmax over grid cells, each with its centre position.
    Grid { cells: Vec<Point> },
    /// Two linear outputs `(x, y)`.
    Regression,
}

impl Head {
    pub fn output_width(&self) -> usize {
        match self {
            Self::Binary => 1,
            Self::Grid { cells } => cells.len(),
            Self::Regression => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseLayer {
    /// Row-major `[out][in]`.
    pub weights: Vec<Vec<f64>>,
    pub biases: Vec<f64>,
}

impl DenseLayer {
    fn inputs(&self) -> usize {
        self.weights.first().map_or(0, Vec::len)
    }

    fn outputs(&self) -> usize {
        self.weights.len()
    }

    fn forward(&self, x: &[f64]) -> Vec<f64> {
        self.weights
            .iter()
            .zip(&self.biases)
            .map(|(row, b)| row.iter().zip(x).map(|(w, v)| w * v).sum::<f64>() + b)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierModel {
    format_version: u32,
    feature_mode: FeatureMode,
    input_dim: usize,
    #[serde(default)]
    hidden_activation: Activation,
    layers: Vec<DenseLayer>,
    head: Head,
    baseline: TrainingBaseline,
}

impl ClassifierModel {
    /// Load and validate a bundle.  Any structural problem is fatal.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            Error::ModelIncompatibility(format!("cannot read {}: {e}", path.display()))
        })?;
        let model = Self::from_json(&text)?;
        log::info!(
            "Loaded model {} ({:?}, {} inputs, {} layers, {} outputs)",
            path.display(),
            model.feature_mode,
            model.input_dim,
            model.layers.len(),
            model.head.output_width()
        );
        Ok(model)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let model: Self = serde_json::from_str(text)
            .map_err(|e| Error::ModelIncompatibility(format!("malformed model bundle: {e}")))?;
        model.validate()?;
        Ok(model)
    }

    pub fn feature_mode(&self) -> FeatureMode {
        self.feature_mode
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn head(&self) -> &Head {
        &self.head
    }

    pub fn baseline(&self) -> &TrainingBaseline {
        &self.baseline
    }

    /// Does this model fit a deployment measuring `pair_count` pairs in `mode`?
    pub fn check_compatible(&self, mode: FeatureMode, pair_count: usize) -> Result<()> {
        if mode != self.feature_mode {
            return Err(Error::ModelIncompatibility(format!(
                "model expects {:?} features, deployment extracts {:?}",
                self.feature_mode, mode
            )));
        }
        let expected = mode.dimension(pair_count);
        if expected != self.input_dim {
            return Err(Error::ModelIncompatibility(format!(
                "model expects {} inputs, {} pair(s) in {:?} mode give {}",
                self.input_dim, pair_count, mode, expected
            )));
        }
        Ok(())
    }

    /// Classify an already normalised feature vector.
    pub fn predict(&self, x: &FeatureVector, threshold: f64) -> Result<Decision> {
        if x.len() != self.input_dim {
            return Err(Error::ModelIncompatibility(format!(
                "feature vector has {} values, model expects {}",
                x.len(),
                self.input_dim
            )));
        }

        let mut activations = x.as_slice().to_vec();
        let last = self.layers.len() - 1;
        for (i, layer) in self.layers.iter().enumerate() {
            activations = layer.forward(&activations);
            if i < last {
                activations
                    .iter_mut()
                    .for_each(|v| *v = self.hidden_activation.apply(*v));
            }
        }

        let decision = match &self.head {
            Head::Binary => {
                let probability = sigmoid(activations[0]);
                Decision::Press {
                    pressed: probability >= threshold,
                    probability,
                }
            }
            Head::Grid { cells } => {
                let probabilities = softmax(&activations);
                let mut index = 0;
                for (i, p) in probabilities.iter().enumerate() {
                    if *p > probabilities[index] {
                        index = i;
                    }
                }
                Decision::Cell {
                    index,
                    position: cells[index],
                    probabilities,
                }
            }
            Head::Regression => Decision::Position {
                position: Point::new(activations[0], activations[1]),
            },
        };
        log::debug!("Decision: {:?}", decision);
        Ok(decision)
    }

    fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(Error::ModelIncompatibility(msg));

        if self.format_version != MODEL_FORMAT_VERSION {
            return fail(format!(
                "format version {} not supported (expected {MODEL_FORMAT_VERSION})",
                self.format_version
            ));
        }
        let per_pair = self.feature_mode.features_per_pair();
        if self.input_dim == 0 || self.input_dim % per_pair != 0 {
            return fail(format!(
                "input_dim {} is not a multiple of {per_pair} ({:?} mode)",
                self.input_dim, self.feature_mode
            ));
        }
        if self.layers.is_empty() {
            return fail("model has no layers".into());
        }

        let mut width = self.input_dim;
        for (i, layer) in self.layers.iter().enumerate() {
            if layer.outputs() == 0 || layer.inputs() != width {
                return fail(format!(
                    "layer {i} takes {} inputs, previous width is {width}",
                    layer.inputs()
                ));
            }
            if layer.weights.iter().any(|row| row.len() != width) {
                return fail(format!("layer {i} has ragged weight rows"));
            }
            if layer.biases.len() != layer.outputs() {
                return fail(format!(
                    "layer {i} has {} biases for {} outputs",
                    layer.biases.len(),
                    layer.outputs()
                ));
            }
            let finite = layer.weights.iter().flatten().chain(&layer.biases).all(|v| v.is_finite());
            if !finite {
                return fail(format!("layer {i} contains non-finite parameters"));
            }
            width = layer.outputs();
        }
        if width != self.head.output_width() {
            return fail(format!(
                "last layer emits {width} values, {:?} head needs {}",
                self.head,
                self.head.output_width()
            ));
        }

        let base = &self.baseline;
        if base.mean.len() != self.input_dim || base.std.len() != self.input_dim {
            return fail(format!(
                "baseline has {}/{} mean/std entries, model has {} inputs",
                base.mean.len(),
                base.std.len(),
                self.input_dim
            ));
        }
        if base.mean.iter().any(|m| !m.is_finite())
            || base.std.iter().any(|s| !s.is_finite() || *s <= 0.0)
        {
            return fail("baseline mean must be finite and std finite and positive".into());
        }
        Ok(())
    }
}

fn sigmoid(v: f64) -> f64 {
    1.0 / (1.0 + (-v).exp())
}

fn softmax(logits: &[f64]) -> Vec<f64> {
    let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = logits.iter().map(|v| (v - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}
