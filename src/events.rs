// GelSense HILS - Shared Data Types
//
// Value types passed between the simulation engine, the sync server, the
// feature pipeline and whoever consumes decisions.  None of them expose
// mutating methods once built.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::MUX_CHANNEL_COUNT;
use crate::drift::AdjustedBaseline;
use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Geometry
// ---------------------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

// ---------------------------------------------------------------------------
// Touch state (owned by the sync hub, handed out as snapshots)
// ---------------------------------------------------------------------------
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TouchState {
    /// `None` means no contact.
    pub position: Option<Point>,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl TouchState {
    pub fn initial() -> Self {
        Self {
            position: None,
            version: 0,
            updated_at: Utc::now(),
        }
    }

    /// The state that follows `self` after a committed mutation.
    pub fn next(&self, position: Option<Point>) -> Self {
        Self {
            position,
            version: self.version + 1,
            updated_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Channel pair (one source/sink measurement path)
// ---------------------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "(u8, u8)", into = "(u8, u8)")]
pub struct ChannelPair {
    source: u8,
    sink: u8,
}

impl ChannelPair {
    pub fn new(source: u8, sink: u8) -> Result<Self> {
        if source == sink {
            return Err(Error::Validation(format!(
                "channel pair source and sink are both {source}"
            )));
        }
        if source >= MUX_CHANNEL_COUNT || sink >= MUX_CHANNEL_COUNT {
            return Err(Error::Validation(format!(
                "channel pair ({source}, {sink}) outside 0..{MUX_CHANNEL_COUNT}"
            )));
        }
        Ok(Self { source, sink })
    }

    pub fn source(&self) -> u8 {
        self.source
    }

    pub fn sink(&self) -> u8 {
        self.sink
    }
}

impl TryFrom<(u8, u8)> for ChannelPair {
    type Error = Error;

    fn try_from((source, sink): (u8, u8)) -> Result<Self> {
        Self::new(source, sink)
    }
}

impl From<ChannelPair> for (u8, u8) {
    fn from(pair: ChannelPair) -> Self {
        (pair.source, pair.sink)
    }
}

impl fmt::Display for ChannelPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.source, self.sink)
    }
}

// ---------------------------------------------------------------------------
// Impedance readings
// ---------------------------------------------------------------------------

/// One frequency sweep.  The three vectors are index-aligned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spectrum {
    pub frequencies: Vec<f64>,
    pub magnitude: Vec<f64>,
    pub phase: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Reading {
    /// |Z| in ohms and phase in radians at the measurement frequency.
    Fixed { magnitude: f64, phase: f64 },
    Sweep(Spectrum),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairReading {
    pub pair: ChannelPair,
    pub reading: Reading,
}

/// Per-pair readings in request order.  Produced once per measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImpedanceVector {
    readings: Vec<PairReading>,
}

impl ImpedanceVector {
    pub fn new(readings: Vec<PairReading>) -> Self {
        Self { readings }
    }

    pub fn readings(&self) -> &[PairReading] {
        &self.readings
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Feature vector
// ---------------------------------------------------------------------------
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureVector(Vec<f64>);

impl FeatureVector {
    pub fn new(values: Vec<f64>) -> Self {
        Self(values)
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<f64>> for FeatureVector {
    fn from(values: Vec<f64>) -> Self {
        Self(values)
    }
}

// ---------------------------------------------------------------------------
// Classifier decisions
// ---------------------------------------------------------------------------
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Decision {
    /// Binary head.
    Press { pressed: bool, probability: f64 },
    /// Grid head: arg-max cell and the full distribution.
    Cell {
        index: usize,
        position: Point,
        probabilities: Vec<f64>,
    },
    /// Regression head.
    Position { position: Point },
}

// ---------------------------------------------------------------------------
// Inference events, sent upward to whoever presents results
// ---------------------------------------------------------------------------
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum InferenceEvent {
    /// Drift adjustment computed, session is READY.
    Calibrated {
        drift: Vec<f64>,
        drift_norm: f64,
    },
    Decision {
        seq: u64,
        decision: Decision,
    },
    /// A measurement tick failed transiently.  Never a classification.
    MeasurementDropped {
        seq: u64,
        reason: String,
    },
    /// A calibration attempt failed.  `retrying` is false when the task
    /// gives up and stops.
    CalibrationFailed {
        kind: String,
        message: String,
        retrying: bool,
    },
}

impl InferenceEvent {
    pub fn calibrated(adjusted: &AdjustedBaseline) -> Self {
        Self::Calibrated {
            drift: adjusted.drift().to_vec(),
            drift_norm: adjusted.drift_norm(),
        }
    }

    pub fn calibration_failed(e: &Error, retrying: bool) -> Self {
        Self::CalibrationFailed {
            kind: e.kind().to_string(),
            message: e.to_string(),
            retrying,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_rejects_same_terminal_and_out_of_range() {
        assert!(ChannelPair::new(3, 3).is_err());
        assert!(ChannelPair::new(8, 0).is_err());
        assert!(ChannelPair::new(0, 8).is_err());
        let pair = ChannelPair::new(7, 0).unwrap();
        assert_eq!((pair.source(), pair.sink()), (7, 0));
    }

    #[test]
    fn pair_serializes_as_tuple_and_validates_on_parse() {
        let pair = ChannelPair::new(1, 2).unwrap();
        assert_eq!(serde_json::to_string(&pair).unwrap(), "[1,2]");
        assert!(serde_json::from_str::<ChannelPair>("[4,4]").is_err());
    }

    #[test]
    fn next_state_bumps_version() {
        let s0 = TouchState::initial();
        let s1 = s0.next(Some(Point::new(10.0, 20.0)));
        let s2 = s1.next(None);
        assert_eq!(s1.version, 1);
        assert_eq!(s2.version, 2);
        assert_eq!(s2.position, None);
    }
}
