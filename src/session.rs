// GelSense HILS - Inference Session
//
// State machine around one impedance source and one model:
//
//   Idle --calibrate--> Calibrating --ok--> Ready --step--> Measuring
//     ^                    |   ^                              |
//     +----- I/O fault ----+   +-- unstable batch (retry)     |
//                                                             v
//   Ready | Stopped --recalibrate--> Idle ... ; any --stop--> Stopped
//
// Drift is measured once at session start and never re-estimated while
// measuring.

use std::sync::Arc;

use crate::classifier::ClassifierModel;
use crate::config::{InferenceConfig, SweepConfig};
use crate::drift::{self, AdjustedBaseline};
use crate::drivers::ImpedanceSource;
use crate::error::{Error, Result};
use crate::events::{ChannelPair, Decision, FeatureVector};
use crate::features::{FeatureExtractor, FeatureMode};
use crate::simulation::MeasureMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Calibrating,
    Ready,
    Measuring,
    Stopped,
}

pub struct InferenceSession<S: ImpedanceSource> {
    source: S,
    model: Arc<ClassifierModel>,
    extractor: FeatureExtractor,
    pairs: Vec<ChannelPair>,
    mode: MeasureMode,
    calibration_samples: usize,
    spread_limit: f64,
    threshold: f64,
    state: SessionState,
    adjusted: Option<AdjustedBaseline>,
    seq: u64,
}

impl<S: ImpedanceSource> InferenceSession<S> {
    /// Fails with `ModelIncompatibility` if the model does not match the
    /// configured feature mode and pair count.
    pub fn new(
        source: S,
        model: Arc<ClassifierModel>,
        config: &InferenceConfig,
        sweep: SweepConfig,
    ) -> Result<Self> {
        model.check_compatible(config.feature_mode, config.pairs.len())?;
        let mode = match config.feature_mode {
            FeatureMode::Fixed => MeasureMode::Fixed,
            FeatureMode::Sweep => MeasureMode::from(sweep),
        };
        log::info!(
            "Inference session on {} ({:?}, {} pairs)",
            source.describe(),
            config.feature_mode,
            config.pairs.len()
        );
        Ok(Self {
            source,
            model,
            extractor: FeatureExtractor::new(config.feature_mode),
            pairs: config.pairs.clone(),
            mode,
            calibration_samples: config.calibration_samples,
            spread_limit: config.spread_limit,
            threshold: config.decision_threshold,
            state: SessionState::Idle,
            adjusted: None,
            seq: 0,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn adjusted(&self) -> Option<&AdjustedBaseline> {
        self.adjusted.as_ref()
    }

    /// Number of measurement attempts so far.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    /// Capture a no-contact batch and shift the baseline onto it.
    /// Allowed from `Idle`, or from `Calibrating` after an unstable batch.
    pub fn calibrate(&mut self) -> Result<&AdjustedBaseline> {
        if !matches!(self.state, SessionState::Idle | SessionState::Calibrating) {
            return Err(Error::Validation(format!(
                "cannot calibrate from {:?}; use recalibrate",
                self.state
            )));
        }
        self.state = SessionState::Calibrating;
        log::info!("Calibrating on {} no-contact samples", self.calibration_samples);

        let mut batch = Vec::with_capacity(self.calibration_samples);
        for _ in 0..self.calibration_samples {
            match self.sample() {
                Ok(features) => batch.push(features),
                Err(e) => {
                    log::warn!("Calibration aborted: {}", e);
                    self.state = SessionState::Idle;
                    return Err(e);
                }
            }
        }

        match drift::calibrate(&batch, self.model.baseline(), self.spread_limit) {
            Ok(adjusted) => {
                self.state = SessionState::Ready;
                Ok(&*self.adjusted.insert(adjusted))
            }
            Err(e @ Error::CalibrationInstability { .. }) => {
                log::warn!("{}; batch discarded, still calibrating", e);
                Err(e)
            }
            Err(e) => {
                self.state = SessionState::Idle;
                Err(e)
            }
        }
    }

    /// Operator-requested fresh calibration.
    pub fn recalibrate(&mut self) -> Result<&AdjustedBaseline> {
        if !matches!(self.state, SessionState::Ready | SessionState::Stopped) {
            return Err(Error::Validation(format!(
                "recalibrate not allowed from {:?}",
                self.state
            )));
        }
        self.adjusted = None;
        self.state = SessionState::Idle;
        self.calibrate()
    }

    /// One measurement, drift-compensated and classified.
    pub fn step(&mut self) -> Result<Decision> {
        let adjusted = match (&self.adjusted, self.state) {
            (Some(a), SessionState::Ready | SessionState::Measuring) => a.clone(),
            _ => {
                return Err(Error::Validation(format!(
                    "measurement refused in {:?} without a valid calibration",
                    self.state
                )));
            }
        };
        self.state = SessionState::Measuring;
        self.seq += 1;

        let features = self.sample()?;
        let normalized = adjusted.normalize(&features)?;
        self.model.predict(&normalized, self.threshold)
    }

    pub fn stop(&mut self) {
        if self.state != SessionState::Stopped {
            log::info!("Inference session stopped after {} measurements", self.seq);
        }
        self.state = SessionState::Stopped;
    }

    fn sample(&mut self) -> Result<FeatureVector> {
        let vector = self.source.measure(&self.pairs, &self.mode)?;
        self.extractor.extract(&vector)
    }
}
