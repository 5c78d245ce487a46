// GelSense HILS - Drift Compensator
//
// The gel's no-contact baseline wanders between sessions.  A short batch of
// no-contact feature vectors, captured at session start, shifts the training
// normalisation mean onto today's baseline.  Scale is left untouched, so the
// correction is a pure offset.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::events::FeatureVector;

/// Per-feature statistics of the no-contact training data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingBaseline {
    pub mean: Vec<f64>,
    pub std: Vec<f64>,
}

impl TrainingBaseline {
    pub fn len(&self) -> usize {
        self.mean.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mean.is_empty()
    }

    /// Normalise without drift compensation.
    pub fn normalize(&self, x: &FeatureVector) -> Result<FeatureVector> {
        standardize(x, &self.mean, &self.std)
    }
}

/// Training baseline shifted onto the live no-contact mean.
#[derive(Debug, Clone, PartialEq)]
pub struct AdjustedBaseline {
    mean: Vec<f64>,
    std: Vec<f64>,
    drift: Vec<f64>,
    drift_norm: f64,
}

impl AdjustedBaseline {
    pub fn mean(&self) -> &[f64] {
        &self.mean
    }

    pub fn std(&self) -> &[f64] {
        &self.std
    }

    /// Live mean minus training mean, per feature.
    pub fn drift(&self) -> &[f64] {
        &self.drift
    }

    /// Euclidean norm of the drift in units of training std.
    pub fn drift_norm(&self) -> f64 {
        self.drift_norm
    }

    pub fn normalize(&self, x: &FeatureVector) -> Result<FeatureVector> {
        standardize(x, &self.mean, &self.std)
    }
}

/// Build the adjusted baseline from a batch of no-contact samples.
pub fn calibrate(
    samples: &[FeatureVector],
    baseline: &TrainingBaseline,
    spread_limit: f64,
) -> Result<AdjustedBaseline> {
    if samples.is_empty() {
        return Err(Error::Validation("calibration batch is empty".into()));
    }
    let dim = baseline.len();
    if let Some(bad) = samples.iter().find(|s| s.len() != dim) {
        return Err(Error::Validation(format!(
            "calibration sample has {} features, baseline has {dim}",
            bad.len()
        )));
    }

    let n = samples.len() as f64;
    let mut calib_mean = vec![0.0; dim];
    for s in samples {
        for (acc, v) in calib_mean.iter_mut().zip(s.as_slice()) {
            *acc += v;
        }
    }
    calib_mean.iter_mut().for_each(|m| *m /= n);

    // Sample std (n-1).  A single sample has no measurable spread.
    if samples.len() > 1 {
        for (i, (&m, &base_std)) in calib_mean.iter().zip(&baseline.std).enumerate() {
            let var = samples
                .iter()
                .map(|s| (s.as_slice()[i] - m).powi(2))
                .sum::<f64>()
                / (n - 1.0);
            let spread = var.sqrt();
            let limit = spread_limit * base_std;
            if spread > limit {
                return Err(Error::CalibrationInstability {
                    feature: i,
                    spread,
                    limit,
                });
            }
        }
    }

    let drift: Vec<f64> = calib_mean
        .iter()
        .zip(&baseline.mean)
        .map(|(c, t)| c - t)
        .collect();
    let drift_norm = drift
        .iter()
        .zip(&baseline.std)
        .map(|(d, s)| (d / s).powi(2))
        .sum::<f64>()
        .sqrt();
    let mean = baseline.mean.iter().zip(&drift).map(|(t, d)| t + d).collect();

    log::info!(
        "Calibrated on {} samples: drift norm {:.3} sigma",
        samples.len(),
        drift_norm
    );
    log::debug!("Drift vector: {:?}", drift);

    Ok(AdjustedBaseline {
        mean,
        std: baseline.std.clone(),
        drift,
        drift_norm,
    })
}

fn standardize(x: &FeatureVector, mean: &[f64], std: &[f64]) -> Result<FeatureVector> {
    if x.len() != mean.len() {
        return Err(Error::Validation(format!(
            "feature vector has {} values, baseline has {}",
            x.len(),
            mean.len()
        )));
    }
    Ok(x
        .as_slice()
        .iter()
        .zip(mean.iter().zip(std))
        .map(|(v, (m, s))| (v - m) / s)
        .collect::<Vec<_>>()
        .into())
}
