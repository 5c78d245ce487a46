// GelSense HILS - Feature Extraction
//
// Converts an impedance vector into the fixed-length numeric vector the
// classifier was trained on.  The mode is picked once per deployment.
//
//   fixed : per pair  [log10(|Z| + 1), phase]
//   sweep : per pair  [log10(f_peak), log10(|Z|_peak + 1), phase_peak,
//                      log10(mean|Z| + 1) low/mid/high,
//                      mean X low/mid/high,
//                      OLS slope of X against log10(f)]

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::events::{FeatureVector, ImpedanceVector, Reading, Spectrum};

pub const FIXED_FEATURES_PER_PAIR: usize = 2;
pub const SWEEP_FEATURES_PER_PAIR: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeatureMode {
    #[default]
    Fixed,
    Sweep,
}

impl FeatureMode {
    pub fn features_per_pair(self) -> usize {
        match self {
            Self::Fixed => FIXED_FEATURES_PER_PAIR,
            Self::Sweep => SWEEP_FEATURES_PER_PAIR,
        }
    }

    /// Dimensionality for a deployment measuring `pairs` paths.
    pub fn dimension(self, pairs: usize) -> usize {
        self.features_per_pair() * pairs
    }

    pub fn feature_names(self) -> &'static [&'static str] {
        match self {
            Self::Fixed => &["log10(mag+1)", "phase"],
            Self::Sweep => &[
                "log10(peak_freq)",
                "log10(peak_mag+1)",
                "peak_phase",
                "log10(z_low+1)",
                "log10(z_mid+1)",
                "log10(z_high+1)",
                "x_low",
                "x_mid",
                "x_high",
                "x_slope",
            ],
        }
    }
}

/// Pure function of the impedance vector under a fixed mode.
#[derive(Debug, Clone, Copy)]
pub struct FeatureExtractor {
    mode: FeatureMode,
}

impl FeatureExtractor {
    pub fn new(mode: FeatureMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> FeatureMode {
        self.mode
    }

    pub fn extract(&self, vector: &ImpedanceVector) -> Result<FeatureVector> {
        if vector.is_empty() {
            return Err(Error::Validation("empty impedance vector".into()));
        }
        let mut out = Vec::with_capacity(self.mode.dimension(vector.len()));
        for pr in vector.readings() {
            match (self.mode, &pr.reading) {
                (FeatureMode::Fixed, Reading::Fixed { magnitude, phase }) => {
                    out.push((magnitude + 1.0).log10());
                    out.push(*phase);
                }
                (FeatureMode::Sweep, Reading::Sweep(spectrum)) => {
                    out.extend_from_slice(&sweep_features(spectrum)?);
                }
                (mode, _) => {
                    return Err(Error::Validation(format!(
                        "pair {} reading does not match {:?} extraction",
                        pr.pair, mode
                    )));
                }
            }
        }
        Ok(FeatureVector::new(out))
    }
}

/// The 10 spectral features of one sweep.
pub fn sweep_features(s: &Spectrum) -> Result<[f64; SWEEP_FEATURES_PER_PAIR]> {
    let n = s.frequencies.len();
    if s.magnitude.len() != n || s.phase.len() != n {
        return Err(Error::Validation(format!(
            "spectrum lengths differ (f={}, |Z|={}, phase={})",
            n,
            s.magnitude.len(),
            s.phase.len()
        )));
    }
    if n < 3 {
        return Err(Error::Validation(format!(
            "sweep needs at least 3 samples, got {n}"
        )));
    }
    if s.frequencies[0] <= 0.0 || s.frequencies.windows(2).any(|w| w[1] <= w[0]) {
        return Err(Error::Validation(
            "sweep frequencies must be positive and strictly ascending".into(),
        ));
    }

    let reactance: Vec<f64> = s
        .magnitude
        .iter()
        .zip(&s.phase)
        .map(|(m, p)| m * p.sin())
        .collect();

    // Strict `>` keeps the lowest-frequency sample on ties.
    let mut peak = 0;
    for i in 1..n {
        if reactance[i].abs() > reactance[peak].abs() {
            peak = i;
        }
    }

    let n3 = n / 3;
    let bands = [0..n3, n3..2 * n3, 2 * n3..n];
    let z_mean = bands.clone().map(|b| mean(&s.magnitude[b]));
    let x_mean = bands.map(|b| mean(&reactance[b]));

    let log_f: Vec<f64> = s.frequencies.iter().map(|f| f.log10()).collect();

    Ok([
        s.frequencies[peak].log10(),
        (s.magnitude[peak] + 1.0).log10(),
        s.phase[peak],
        (z_mean[0] + 1.0).log10(),
        (z_mean[1] + 1.0).log10(),
        (z_mean[2] + 1.0).log10(),
        x_mean[0],
        x_mean[1],
        x_mean[2],
        ols_slope(&log_f, &reactance),
    ])
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn ols_slope(x: &[f64], y: &[f64]) -> f64 {
    let (mx, my) = (mean(x), mean(y));
    let mut sxy = 0.0;
    let mut sxx = 0.0;
    for (xi, yi) in x.iter().zip(y) {
        sxy += (xi - mx) * (yi - my);
        sxx += (xi - mx) * (xi - mx);
    }
    sxy / sxx
}
