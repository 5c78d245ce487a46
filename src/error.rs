// GelSense HILS - Error Taxonomy
//
// Every fallible library operation returns one of these five kinds.  The
// wire `kind` string is what the sync server puts in `ERROR` replies.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or role-violating message.  The connection survives.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Invalid channel pair, feature-shape mismatch, bad request argument.
    /// Aborts only the offending request.
    #[error("validation error: {0}")]
    Validation(String),

    /// Network timeout or disconnect.  Retryable by the caller.
    #[error("transient I/O error: {0}")]
    TransientIo(String),

    /// Live baseline spread exceeds the configured tolerance.
    #[error(
        "calibration unstable: feature {feature} spread {spread:.4} exceeds limit {limit:.4}"
    )]
    CalibrationInstability {
        feature: usize,
        spread: f64,
        limit: f64,
    },

    /// Model shape or version mismatch.  Fatal until an operator reloads.
    #[error("model incompatible: {0}")]
    ModelIncompatibility(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Stable identifier used in `ERROR` replies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Protocol(_) => "protocol",
            Self::Validation(_) => "validation",
            Self::TransientIo(_) => "transient_io",
            Self::CalibrationInstability { .. } => "calibration_instability",
            Self::ModelIncompatibility(_) => "model_incompatibility",
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientIo(_))
    }

    /// Rebuild an error from an `ERROR` reply received over the wire.
    pub fn from_wire(kind: &str, message: String) -> Self {
        match kind {
            "protocol" => Self::Protocol(message),
            "validation" => Self::Validation(message),
            "model_incompatibility" => Self::ModelIncompatibility(message),
            _ => Self::TransientIo(message),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::TransientIo(e.to_string())
    }
}
