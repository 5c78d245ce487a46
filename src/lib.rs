// GelSense HILS - Library Root
//
// Touch sensing on a resistive ionic gel: a hardware-in-the-loop sync
// server, the impedance simulation model, and the drift-compensated
// feature/classification pipeline.

pub mod classifier;
pub mod config;
pub mod drift;
pub mod drivers;
pub mod error;
pub mod events;
pub mod features;
pub mod protocol;
pub mod server;
pub mod session;
pub mod simulation;
pub mod tasks;

pub use error::{Error, Result};
