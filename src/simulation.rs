// GelSense HILS - Impedance Simulation Engine
//
// Turns a virtual touch position into the impedance vector the real gel
// would produce.  Resistance grows linearly with the touch's distance from
// each pair's electrode path; a touch-dependent contact capacitance gives
// the reactive part.  Without noise, `simulate` is a pure function.

use std::f64::consts::PI;

use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::config::{
    SimulationConfig, SweepConfig, BASE_CAPACITANCE_F, CAPACITANCE_DECAY_MM, MAX_SWEEP_POINTS,
    MIN_IMPEDANCE_OHM, TOUCH_CAPACITANCE_F,
};
use crate::drivers::ImpedanceSource;
use crate::error::{Error, Result};
use crate::events::{ChannelPair, ImpedanceVector, PairReading, Point, Reading, Spectrum, TouchState};

/// What a single measurement request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MeasureMode {
    #[default]
    Fixed,
    Sweep {
        min_hz: f64,
        max_hz: f64,
        points: usize,
    },
}

impl From<SweepConfig> for MeasureMode {
    fn from(sweep: SweepConfig) -> Self {
        Self::Sweep {
            min_hz: sweep.min_hz,
            max_hz: sweep.max_hz,
            points: sweep.points,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Noise {
    Disabled,
    /// Multiplicative `1 + relative_std * N(0, 1)` per value.
    Gaussian { relative_std: f64 },
}

/// `points` log-spaced frequencies from `min_hz` to `max_hz` inclusive.
pub fn sweep_frequencies(min_hz: f64, max_hz: f64, points: usize) -> Result<Vec<f64>> {
    if !(min_hz > 0.0 && max_hz > min_hz && max_hz.is_finite()) {
        return Err(Error::Validation(format!(
            "sweep range {min_hz}..{max_hz} Hz is not increasing and positive"
        )));
    }
    if !(3..=MAX_SWEEP_POINTS).contains(&points) {
        return Err(Error::Validation(format!(
            "sweep needs 3..={MAX_SWEEP_POINTS} points, got {points}"
        )));
    }
    let (lo, hi) = (min_hz.log10(), max_hz.log10());
    let step = (hi - lo) / (points - 1) as f64;
    Ok((0..points)
        .map(|i| 10f64.powf(lo + step * i as f64))
        .collect())
}

#[derive(Debug, Clone)]
pub struct SimulationEngine {
    terminals: Vec<Point>,
    base_impedance: f64,
    distance_factor: f64,
    no_contact_distance: f64,
    measurement_frequency: f64,
}

impl SimulationEngine {
    pub fn new(config: &SimulationConfig) -> Self {
        Self {
            terminals: config.terminals.clone(),
            base_impedance: config.base_impedance_ohm,
            distance_factor: config.distance_factor_ohm_per_mm,
            no_contact_distance: config.no_contact_distance_mm,
            measurement_frequency: config.measurement_frequency_hz,
        }
    }

    pub fn terminal_count(&self) -> usize {
        self.terminals.len()
    }

    /// Simulate one measurement, drawing noise from the thread-local RNG.
    pub fn simulate(
        &self,
        position: Option<Point>,
        pairs: &[ChannelPair],
        mode: &MeasureMode,
        noise: Noise,
    ) -> Result<ImpedanceVector> {
        self.simulate_with_rng(position, pairs, mode, noise, &mut rand::thread_rng())
    }

    pub fn simulate_with_rng<R: Rng + ?Sized>(
        &self,
        position: Option<Point>,
        pairs: &[ChannelPair],
        mode: &MeasureMode,
        noise: Noise,
        rng: &mut R,
    ) -> Result<ImpedanceVector> {
        if pairs.is_empty() {
            return Err(Error::Validation("no channel pairs requested".into()));
        }
        let frequencies = match *mode {
            MeasureMode::Fixed => None,
            MeasureMode::Sweep {
                min_hz,
                max_hz,
                points,
            } => Some(sweep_frequencies(min_hz, max_hz, points)?),
        };

        let mut readings = Vec::with_capacity(pairs.len());
        for &pair in pairs {
            let distance = self.path_distance(position, pair)?;
            let resistance = self.resistance(distance);
            let capacitance = contact_capacitance(distance);

            let reading = match &frequencies {
                None => {
                    let x = reactance(self.measurement_frequency, capacitance);
                    Reading::Fixed {
                        magnitude: perturb_magnitude(resistance, noise, rng),
                        phase: perturb(x.atan2(resistance), noise, rng),
                    }
                }
                Some(freqs) => {
                    let mut magnitude = Vec::with_capacity(freqs.len());
                    let mut phase = Vec::with_capacity(freqs.len());
                    for &f in freqs {
                        let x = reactance(f, capacitance);
                        magnitude.push(perturb_magnitude(resistance.hypot(x), noise, rng));
                        phase.push(perturb(x.atan2(resistance), noise, rng));
                    }
                    Reading::Sweep(Spectrum {
                        frequencies: freqs.clone(),
                        magnitude,
                        phase,
                    })
                }
            };
            if !reading_is_finite(&reading) {
                return Err(Error::Validation(format!(
                    "touch {position:?} is too far from the gel to simulate pair {pair:?}"
                )));
            }
            readings.push(PairReading { pair, reading });
        }

        log::debug!(
            "Simulated {} pair(s) at {:?} ({:?})",
            readings.len(),
            position,
            mode
        );
        Ok(ImpedanceVector::new(readings))
    }

    /// Path resistance for a touch `distance` mm away from the electrode path.
    pub fn resistance(&self, distance: f64) -> f64 {
        self.base_impedance + self.distance_factor * distance
    }

    /// Distance from the touch to the segment between the pair's terminals,
    /// or the fixed no-contact distance.
    pub fn path_distance(&self, position: Option<Point>, pair: ChannelPair) -> Result<f64> {
        let source = self.terminal(pair.source())?;
        let sink = self.terminal(pair.sink())?;
        Ok(match position {
            Some(p) => segment_distance(p, source, sink),
            None => self.no_contact_distance,
        })
    }

    fn terminal(&self, id: u8) -> Result<Point> {
        self.terminals.get(id as usize).copied().ok_or_else(|| {
            Error::Validation(format!(
                "terminal {id} not in electrode layout (0..{})",
                self.terminals.len()
            ))
        })
    }
}

fn segment_distance(p: Point, a: Point, b: Point) -> f64 {
    let (dx, dy) = (b.x - a.x, b.y - a.y);
    let len_sq = dx * dx + dy * dy;
    if len_sq < 1e-12 {
        return p.distance(&a);
    }
    let t = (((p.x - a.x) * dx + (p.y - a.y) * dy) / len_sq).clamp(0.0, 1.0);
    p.distance(&Point::new(a.x + t * dx, a.y + t * dy))
}

fn contact_capacitance(distance: f64) -> f64 {
    BASE_CAPACITANCE_F + TOUCH_CAPACITANCE_F * (-distance / CAPACITANCE_DECAY_MM).exp()
}

fn reactance(frequency: f64, capacitance: f64) -> f64 {
    -1.0 / (2.0 * PI * frequency * capacitance)
}

fn reading_is_finite(reading: &Reading) -> bool {
    match reading {
        Reading::Fixed { magnitude, phase } => magnitude.is_finite() && phase.is_finite(),
        Reading::Sweep(s) => s
            .magnitude
            .iter()
            .chain(&s.phase)
            .all(|v| v.is_finite()),
    }
}

fn perturb<R: Rng + ?Sized>(value: f64, noise: Noise, rng: &mut R) -> f64 {
    match noise {
        Noise::Disabled => value,
        Noise::Gaussian { relative_std } => {
            let z: f64 = rng.sample(StandardNormal);
            value * (1.0 + relative_std * z)
        }
    }
}

fn perturb_magnitude<R: Rng + ?Sized>(value: f64, noise: Noise, rng: &mut R) -> f64 {
    match noise {
        Noise::Disabled => value,
        Noise::Gaussian { .. } => perturb(value, noise, rng).max(MIN_IMPEDANCE_OHM),
    }
}

// ---------------------------------------------------------------------------
// In-process source: the engine plus its own touch state, no server
// ---------------------------------------------------------------------------
pub struct LocalSimulator {
    engine: SimulationEngine,
    noise: Noise,
    state: TouchState,
}

impl LocalSimulator {
    pub fn new(config: &SimulationConfig) -> Self {
        let noise = if config.noise {
            Noise::Gaussian {
                relative_std: config.noise_level,
            }
        } else {
            Noise::Disabled
        };
        Self {
            engine: SimulationEngine::new(config),
            noise,
            state: TouchState::initial(),
        }
    }

    pub fn set_touch(&mut self, position: Option<Point>) {
        self.state = self.state.next(position);
        log::debug!("Local touch set to {:?} (v{})", position, self.state.version);
    }

    pub fn state(&self) -> &TouchState {
        &self.state
    }
}

impl ImpedanceSource for LocalSimulator {
    fn measure(&mut self, pairs: &[ChannelPair], mode: &MeasureMode) -> Result<ImpedanceVector> {
        self.engine
            .simulate(self.state.position, pairs, mode, self.noise)
    }

    fn describe(&self) -> String {
        format!("local simulator ({:?})", self.noise)
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    fn engine() -> SimulationEngine {
        SimulationEngine::new(&SimulationConfig::default())
    }

    fn pair(s: u8, k: u8) -> ChannelPair {
        ChannelPair::new(s, k).unwrap()
    }

    fn fixed_magnitude(v: &ImpedanceVector, i: usize) -> f64 {
        match v.readings()[i].reading {
            Reading::Fixed { magnitude, .. } => magnitude,
            _ => panic!("expected fixed reading"),
        }
    }

    #[test]
    fn noiseless_simulation_is_bit_identical() {
        let e = engine();
        let pairs = crate::config::default_pairs();
        let p = Some(Point::new(23.5, 71.25));
        for mode in [MeasureMode::Fixed, MeasureMode::from(SweepConfig::default())] {
            let a = e.simulate(p, &pairs, &mode, Noise::Disabled).unwrap();
            let b = e.simulate(p, &pairs, &mode, Noise::Disabled).unwrap();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn touch_three_mm_from_path_reads_1030_ohm() {
        // A(0,0) -> B(100,0); a touch at (50, 3) is 3 mm off the path.
        let v = engine()
            .simulate(Some(Point::new(50.0, 3.0)), &[pair(0, 1)], &MeasureMode::Fixed, Noise::Disabled)
            .unwrap();
        assert!((fixed_magnitude(&v, 0) - 1030.0).abs() < 1e-9);
    }

    #[test]
    fn magnitude_decreases_strictly_as_touch_approaches_path() {
        let e = engine();
        let mut last = f64::INFINITY;
        for y in [60.0, 40.0, 20.0, 10.0, 5.0, 1.0, 0.0] {
            let v = e
                .simulate(Some(Point::new(50.0, y)), &[pair(0, 1)], &MeasureMode::Fixed, Noise::Disabled)
                .unwrap();
            let m = fixed_magnitude(&v, 0);
            assert!(m < last, "magnitude {m} at y={y} not below {last}");
            last = m;
        }
    }

    #[test]
    fn no_contact_uses_baseline_distance() {
        let v = engine()
            .simulate(None, &[pair(0, 2)], &MeasureMode::Fixed, Noise::Disabled)
            .unwrap();
        assert!((fixed_magnitude(&v, 0) - (1000.0 + 10.0 * 150.0)).abs() < 1e-9);
    }

    #[test]
    fn distance_is_clamped_to_segment_ends() {
        let e = engine();
        // Beyond B along the A->B line: distance measured to B, not the infinite line.
        let d = e.path_distance(Some(Point::new(130.0, 0.0)), pair(0, 1)).unwrap();
        assert!((d - 30.0).abs() < 1e-9);
    }

    #[test]
    fn unknown_terminal_is_a_validation_error() {
        let err = engine()
            .simulate(None, &[pair(0, 5)], &MeasureMode::Fixed, Noise::Disabled)
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn sweep_reading_has_requested_shape_and_negative_reactance() {
        let mode = MeasureMode::Sweep {
            min_hz: 2_000.0,
            max_hz: 20_000.0,
            points: 12,
        };
        let v = engine()
            .simulate(Some(Point::new(10.0, 10.0)), &[pair(0, 1)], &mode, Noise::Disabled)
            .unwrap();
        let Reading::Sweep(s) = &v.readings()[0].reading else {
            panic!("expected sweep reading");
        };
        assert_eq!(s.frequencies.len(), 12);
        assert!((s.frequencies[0] - 2_000.0).abs() < 1e-6);
        assert!((s.frequencies[11] - 20_000.0).abs() < 1e-6);
        assert!(s.phase.iter().all(|p| *p < 0.0));
        assert!(s.magnitude.windows(2).all(|w| w[1] < w[0]));
    }

    #[test]
    fn sweep_point_count_is_bounded() {
        for points in [2, MAX_SWEEP_POINTS + 1, usize::MAX] {
            let err = sweep_frequencies(2_000.0, 20_000.0, points).unwrap_err();
            assert!(matches!(err, Error::Validation(_)), "{points}");
        }
        let widest = sweep_frequencies(2_000.0, 20_000.0, MAX_SWEEP_POINTS).unwrap();
        assert_eq!(widest.len(), MAX_SWEEP_POINTS);
    }

    #[test]
    fn overflowing_touch_is_rejected_not_serialized_as_infinity() {
        let e = engine();
        let far = Some(Point::new(1e308, 0.0));
        for mode in [MeasureMode::Fixed, MeasureMode::from(SweepConfig::default())] {
            let err = e.simulate(far, &[pair(0, 1)], &mode, Noise::Disabled).unwrap_err();
            assert!(matches!(err, Error::Validation(_)));
        }
    }

    #[test]
    fn noise_perturbs_each_call_independently() {
        let e = engine();
        let noise = Noise::Gaussian { relative_std: 0.05 };
        let mut rng = StdRng::seed_from_u64(7);
        let p = Some(Point::new(30.0, 30.0));
        let a = e.simulate_with_rng(p, &[pair(0, 1)], &MeasureMode::Fixed, noise, &mut rng).unwrap();
        let b = e.simulate_with_rng(p, &[pair(0, 1)], &MeasureMode::Fixed, noise, &mut rng).unwrap();
        assert_ne!(a, b);
        let clean = e.simulate(p, &[pair(0, 1)], &MeasureMode::Fixed, Noise::Disabled).unwrap();
        let rel = (fixed_magnitude(&a, 0) - fixed_magnitude(&clean, 0)).abs() / fixed_magnitude(&clean, 0);
        assert!(rel < 0.5);
    }

    #[test]
    fn local_simulator_tracks_its_own_touch() {
        let mut config = SimulationConfig::default();
        config.noise = false;
        let mut sim = LocalSimulator::new(&config);
        let far = sim.measure(&[pair(0, 1)], &MeasureMode::Fixed).unwrap();
        sim.set_touch(Some(Point::new(50.0, 0.0)));
        let near = sim.measure(&[pair(0, 1)], &MeasureMode::Fixed).unwrap();
        assert_eq!(sim.state().version, 1);
        assert!(fixed_magnitude(&near, 0) < fixed_magnitude(&far, 0));
    }
}
