// GelSense HILS - System Configuration
// Target: host PC (HILS server, inference client)
//
// Compile-time defaults live in the `pub const` blocks below.  A TOML file
// may override any of them at start-up through `Config::load`; nothing else
// is allowed to change runtime behaviour.

use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::events::{ChannelPair, Point};
use crate::features::FeatureMode;

// ---------------------------------------------------------------------------
// Electrode layout (ionic gel, mm)
// ---------------------------------------------------------------------------
pub const TERMINAL_POSITIONS_MM: [(f64, f64); 4] = [
    (0.0, 0.0),     // A
    (100.0, 0.0),   // B
    (100.0, 100.0), // C
    (0.0, 100.0),   // D
];
pub const MEASUREMENT_PAIRS: [(u8, u8); 6] = [
    (0, 1), // A->B
    (0, 3), // A->D
    (1, 2), // B->C
    (1, 3), // B->D
    (2, 3), // C->D
    (0, 2), // A->C
];

// ---------------------------------------------------------------------------
// Electrode-selection mux (two 8:1 muxes, source and sink)
// ---------------------------------------------------------------------------
pub const MUX_CHANNEL_COUNT: u8 = 8;
pub const MUX_BAUDRATE: u32 = 9600;
pub const MUX_REPLY_TIMEOUT_MS: u64 = 500;
pub const MUX_RESET_WAIT_MS: u64 = 2_000; // board resets when the port opens
pub const MUX_SETTLE_MS: u64 = 50; // after switching, before measuring

// ---------------------------------------------------------------------------
// Impedance model
// ---------------------------------------------------------------------------
pub const BASE_IMPEDANCE_OHM: f64 = 1000.0;
pub const DISTANCE_FACTOR_OHM_PER_MM: f64 = 10.0;
pub const NO_CONTACT_DISTANCE_MM: f64 = 150.0; // beyond the gel diagonal
pub const MIN_IMPEDANCE_OHM: f64 = 100.0;
pub const MEASUREMENT_FREQUENCY_HZ: f64 = 1000.0;
pub const BASE_CAPACITANCE_F: f64 = 100e-9;
pub const TOUCH_CAPACITANCE_F: f64 = 400e-9;
pub const CAPACITANCE_DECAY_MM: f64 = 30.0;
pub const NOISE_LEVEL: f64 = 0.05; // relative std-dev of the multiplicative factor

// ---------------------------------------------------------------------------
// Frequency sweep
// ---------------------------------------------------------------------------
pub const SWEEP_MIN_HZ: f64 = 2_000.0;
pub const SWEEP_MAX_HZ: f64 = 20_000.0;
pub const SWEEP_POINTS: usize = 50;
pub const MAX_SWEEP_POINTS: usize = 10_000; // per request, wire or config

// ---------------------------------------------------------------------------
// Inference session
// ---------------------------------------------------------------------------
pub const CALIBRATION_SAMPLES: usize = 10;
pub const CALIBRATION_SPREAD_LIMIT: f64 = 5.0; // multiples of baseline std
pub const DECISION_THRESHOLD: f64 = 0.5;
pub const INFERENCE_PERIOD_MS: u64 = 200;
pub const MEASURE_TIMEOUT_MS: u64 = 3_000;

// ---------------------------------------------------------------------------
// HILS server
// ---------------------------------------------------------------------------
pub const SERVER_HOST: &str = "127.0.0.1";
pub const SERVER_PORT: u16 = 8765;
pub const CONNECT_TIMEOUT_MS: u64 = 5_000;
pub const MAX_LINE_BYTES: usize = 64 * 1024; // longer request lines are discarded
pub const SESSION_WRITE_TIMEOUT_MS: u64 = 2_000; // stalled readers are dropped after this
pub const SESSION_QUEUE_DEPTH: usize = 256; // outbound messages per session

// ---------------------------------------------------------------------------
// Model artifact
// ---------------------------------------------------------------------------
pub const MODEL_FORMAT_VERSION: u32 = 1;

/// Where impedance vectors come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// In-process simulation engine, no server.
    Local,
    /// Measurement-consumer session on a HILS server.
    #[default]
    Hils,
    /// Mux + external impedance analyzer.
    Hardware,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backend: Backend,
    pub server: ServerConfig,
    pub simulation: SimulationConfig,
    pub sweep: SweepConfig,
    pub inference: InferenceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: SERVER_HOST.to_string(),
            port: SERVER_PORT,
        }
    }
}

impl ServerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub noise: bool,
    pub noise_level: f64,
    pub base_impedance_ohm: f64,
    pub distance_factor_ohm_per_mm: f64,
    pub no_contact_distance_mm: f64,
    pub measurement_frequency_hz: f64,
    pub terminals: Vec<Point>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            noise: true,
            noise_level: NOISE_LEVEL,
            base_impedance_ohm: BASE_IMPEDANCE_OHM,
            distance_factor_ohm_per_mm: DISTANCE_FACTOR_OHM_PER_MM,
            no_contact_distance_mm: NO_CONTACT_DISTANCE_MM,
            measurement_frequency_hz: MEASUREMENT_FREQUENCY_HZ,
            terminals: TERMINAL_POSITIONS_MM
                .iter()
                .map(|&(x, y)| Point::new(x, y))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub min_hz: f64,
    pub max_hz: f64,
    pub points: usize,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            min_hz: SWEEP_MIN_HZ,
            max_hz: SWEEP_MAX_HZ,
            points: SWEEP_POINTS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub feature_mode: FeatureMode,
    pub pairs: Vec<ChannelPair>,
    pub calibration_samples: usize,
    pub spread_limit: f64,
    pub decision_threshold: f64,
    pub period_ms: u64,
    pub measure_timeout_ms: u64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            feature_mode: FeatureMode::Fixed,
            pairs: default_pairs(),
            calibration_samples: CALIBRATION_SAMPLES,
            spread_limit: CALIBRATION_SPREAD_LIMIT,
            decision_threshold: DECISION_THRESHOLD,
            period_ms: INFERENCE_PERIOD_MS,
            measure_timeout_ms: MEASURE_TIMEOUT_MS,
        }
    }
}

/// The six usable paths between the four gel terminals.
pub fn default_pairs() -> Vec<ChannelPair> {
    MEASUREMENT_PAIRS
        .iter()
        .filter_map(|&(s, k)| ChannelPair::new(s, k).ok())
        .collect()
}

impl Config {
    /// Read a TOML file.  Missing keys fall back to the defaults above.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Config =
            toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        log::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let inf = &self.inference;
        anyhow::ensure!(inf.calibration_samples > 0, "calibration_samples must be > 0");
        anyhow::ensure!(inf.spread_limit > 0.0, "spread_limit must be > 0");
        anyhow::ensure!(
            (0.0..=1.0).contains(&inf.decision_threshold),
            "decision_threshold must be within [0, 1]"
        );
        anyhow::ensure!(!inf.pairs.is_empty(), "at least one channel pair is required");
        anyhow::ensure!(inf.period_ms > 0, "period_ms must be > 0");
        anyhow::ensure!(inf.measure_timeout_ms > 0, "measure_timeout_ms must be > 0");

        let sim = &self.simulation;
        anyhow::ensure!(
            sim.terminals.len() >= 2,
            "electrode layout needs at least two terminals"
        );
        anyhow::ensure!(
            sim.terminals.iter().all(Point::is_finite),
            "terminal coordinates must be finite"
        );
        anyhow::ensure!(
            sim.noise_level.is_finite() && sim.noise_level >= 0.0,
            "noise_level must be finite and >= 0"
        );
        anyhow::ensure!(
            [
                sim.base_impedance_ohm,
                sim.distance_factor_ohm_per_mm,
                sim.no_contact_distance_mm,
            ]
            .iter()
            .all(|v| v.is_finite() && *v >= 0.0),
            "impedance model parameters must be finite and >= 0"
        );
        anyhow::ensure!(
            sim.measurement_frequency_hz.is_finite() && sim.measurement_frequency_hz > 0.0,
            "measurement_frequency_hz must be > 0"
        );

        anyhow::ensure!(
            self.sweep.min_hz > 0.0
                && self.sweep.max_hz > self.sweep.min_hz
                && self.sweep.max_hz.is_finite(),
            "sweep range must satisfy 0 < min_hz < max_hz"
        );
        anyhow::ensure!(
            (3..=MAX_SWEEP_POINTS).contains(&self.sweep.points),
            "sweep points must be within 3..={MAX_SWEEP_POINTS}"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.inference.pairs.len(), 6);
        assert_eq!(config.server.address(), "127.0.0.1:8765");
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let text = r#"
            backend = "local"

            [server]
            port = 9900

            [inference]
            feature_mode = "sweep"
            pairs = [[0, 1]]
            calibration_samples = 20
        "#;
        let config: Config = toml::from_str(text).unwrap();
        config.validate().unwrap();
        assert_eq!(config.backend, Backend::Local);
        assert_eq!(config.server.port, 9900);
        assert_eq!(config.server.host, SERVER_HOST);
        assert_eq!(config.inference.feature_mode, FeatureMode::Sweep);
        assert_eq!(config.inference.pairs, vec![ChannelPair::new(0, 1).unwrap()]);
        assert_eq!(config.inference.calibration_samples, 20);
        assert_eq!(config.sweep.points, SWEEP_POINTS);
        assert!(config.simulation.noise);
    }

    #[test]
    fn invalid_pair_in_toml_is_rejected() {
        let text = "[inference]\npairs = [[2, 2]]\n";
        assert!(toml::from_str::<Config>(text).is_err());
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let cases = [
            "[inference]\nperiod_ms = 0\n",
            "[inference]\nmeasure_timeout_ms = 0\n",
            "[simulation]\nnoise_level = -0.1\n",
            "[simulation]\nterminals = [{ x = 0.0, y = 0.0 }, { x = inf, y = 0.0 }]\n",
            "[sweep]\npoints = 2\n",
            "[sweep]\npoints = 10001\n",
        ];
        for text in cases {
            let config: Config = toml::from_str(text).unwrap();
            assert!(config.validate().is_err(), "{text}");
        }
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gelsense.toml");
        fs::write(&path, "[simulation]\nnoise = false\n").unwrap();
        let config = Config::load(&path).unwrap();
        assert!(!config.simulation.noise);
    }
}
