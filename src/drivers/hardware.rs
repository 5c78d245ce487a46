// GelSense HILS - Real Hardware Source
//
// Mux + external impedance analyzer.  The acquisition SDK stays outside this
// crate; whatever wraps it implements `Analyzer`.

use std::io::{Read, Write};
use std::thread;
use std::time::Duration;

use crate::config::MUX_SETTLE_MS;
use crate::drivers::mux::MuxSelector;
use crate::drivers::ImpedanceSource;
use crate::error::Result;
use crate::events::{ChannelPair, ImpedanceVector, PairReading, Reading, Spectrum};
use crate::simulation::{sweep_frequencies, MeasureMode};

/// One complex impedance reading from the instrument.
pub trait Analyzer: Send {
    /// `(resistance, reactance)` in ohms at `frequency_hz`.
    fn impedance_at(&mut self, frequency_hz: f64) -> Result<(f64, f64)>;

    fn describe(&self) -> String {
        "external analyzer".to_string()
    }
}

pub struct HardwareSource<P: Read + Write + Send, A: Analyzer> {
    mux: MuxSelector<P>,
    analyzer: A,
    frequency_hz: f64,
    settle: Duration,
}

impl<P: Read + Write + Send, A: Analyzer> HardwareSource<P, A> {
    pub fn new(mux: MuxSelector<P>, analyzer: A, frequency_hz: f64) -> Self {
        Self {
            mux,
            analyzer,
            frequency_hz,
            settle: Duration::from_millis(MUX_SETTLE_MS),
        }
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    fn read_at(&mut self, frequency_hz: f64) -> Result<(f64, f64)> {
        let (r, x) = self.analyzer.impedance_at(frequency_hz)?;
        Ok((r.hypot(x), x.atan2(r)))
    }
}

impl<P: Read + Write + Send, A: Analyzer> ImpedanceSource for HardwareSource<P, A> {
    fn measure(&mut self, pairs: &[ChannelPair], mode: &MeasureMode) -> Result<ImpedanceVector> {
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
            self.mux.select(pair)?;
            thread::sleep(self.settle);

            let reading = match &frequencies {
                None => {
                    let (magnitude, phase) = self.read_at(self.frequency_hz)?;
                    log::debug!("Pair {pair}: {magnitude:.2} ohm, {phase:.4} rad");
                    Reading::Fixed { magnitude, phase }
                }
                Some(freqs) => {
                    let mut magnitude = Vec::with_capacity(freqs.len());
                    let mut phase = Vec::with_capacity(freqs.len());
                    for &f in freqs {
                        let (m, p) = self.read_at(f)?;
                        magnitude.push(m);
                        phase.push(p);
                    }
                    Reading::Sweep(Spectrum {
                        frequencies: freqs.clone(),
                        magnitude,
                        phase,
                    })
                }
            };
            readings.push(PairReading { pair, reading });
        }
        Ok(ImpedanceVector::new(readings))
    }

    fn describe(&self) -> String {
        format!("hardware ({} @ {} Hz)", self.analyzer.describe(), self.frequency_hz)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::mux::MuxEmulator;
    use crate::error::Error;

    /// Pure resistor in series with a 1 uF capacitor.
    struct RcAnalyzer {
        calls: usize,
        fail_after: Option<usize>,
    }

    impl Analyzer for RcAnalyzer {
        fn impedance_at(&mut self, frequency_hz: f64) -> Result<(f64, f64)> {
            self.calls += 1;
            if self.fail_after.is_some_and(|n| self.calls > n) {
                return Err(Error::TransientIo("analyzer timed out".into()));
            }
            let x = -1.0 / (2.0 * std::f64::consts::PI * frequency_hz * 1e-6);
            Ok((1000.0, x))
        }
    }

    fn source(fail_after: Option<usize>) -> HardwareSource<MuxEmulator, RcAnalyzer> {
        HardwareSource::new(
            MuxSelector::new(MuxEmulator::new()),
            RcAnalyzer { calls: 0, fail_after },
            1000.0,
        )
        .with_settle(Duration::ZERO)
    }

    #[test]
    fn fixed_measurement_walks_every_pair() {
        let mut src = source(None);
        let pairs = crate::config::default_pairs();
        let v = src.measure(&pairs, &MeasureMode::Fixed).unwrap();
        assert_eq!(v.len(), 6);
        assert_eq!(src.mux.active(), Some((0, 2)));
        let Reading::Fixed { magnitude, phase } = v.readings()[0].reading else {
            panic!("expected fixed reading");
        };
        assert!(magnitude > 1000.0);
        assert!(phase < 0.0);
    }

    #[test]
    fn sweep_measurement_uses_log_grid() {
        let mut src = source(None);
        let pair = ChannelPair::new(1, 3).unwrap();
        let mode = MeasureMode::Sweep {
            min_hz: 2_000.0,
            max_hz: 20_000.0,
            points: 4,
        };
        let v = src.measure(&[pair], &mode).unwrap();
        let Reading::Sweep(s) = &v.readings()[0].reading else {
            panic!("expected sweep reading");
        };
        assert_eq!(s.frequencies.len(), 4);
        assert_eq!(src.analyzer.calls, 4);
    }

    #[test]
    fn analyzer_fault_is_transient() {
        let mut src = source(Some(2));
        let err = src
            .measure(&crate::config::default_pairs(), &MeasureMode::Fixed)
            .unwrap_err();
        assert!(err.is_transient());
    }
}
