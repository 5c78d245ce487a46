// GelSense HILS - Measurement Drivers
//
// Everything that can hand the inference loop an impedance vector implements
// `ImpedanceSource`, so the pipeline never knows whether it talks to the
// HILS server, the in-process engine or real hardware.

pub mod hardware;
pub mod hils;
pub mod mux;

use crate::error::Result;
use crate::events::{ChannelPair, ImpedanceVector};
use crate::simulation::MeasureMode;

pub trait ImpedanceSource: Send {
    /// Measure every pair, in order.  Timeouts surface as `TransientIo`.
    fn measure(&mut self, pairs: &[ChannelPair], mode: &MeasureMode) -> Result<ImpedanceVector>;

    /// Short human-readable description for logs.
    fn describe(&self) -> String;
}

impl<S: ImpedanceSource + ?Sized> ImpedanceSource for Box<S> {
    fn measure(&mut self, pairs: &[ChannelPair], mode: &MeasureMode) -> Result<ImpedanceVector> {
        (**self).measure(pairs, mode)
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}
