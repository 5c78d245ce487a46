// GelSense HILS - Sync Protocol Messages
//
// One JSON object per line: {"type": "SET_TOUCH", "payload": {...}}.
// Unit messages may omit the payload.  Roles are checked here, at the
// message boundary, before anything reaches the hub.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::events::{ChannelPair, ImpedanceVector, TouchState};
use crate::simulation::MeasureMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Truth source: may move or clear the virtual touch.
    Setter,
    /// Measuring client: may only read and measure.
    Consumer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Setter => f.write_str("setter"),
            Self::Consumer => f.write_str("consumer"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MeasureRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// `None` means the server's configured pair list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pairs: Option<Vec<ChannelPair>>,
    #[serde(default)]
    pub mode: MeasureMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    Connect {
        role: Role,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },
    SetTouch {
        x: f64,
        y: f64,
    },
    ClearTouch,
    GetState,
    Measure(MeasureRequest),
}

impl ClientMessage {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "CONNECT",
            Self::SetTouch { .. } => "SET_TOUCH",
            Self::ClearTouch => "CLEAR_TOUCH",
            Self::GetState => "GET_STATE",
            Self::Measure(_) => "MEASURE",
        }
    }

    /// Whether a session of `role` may send this message.
    pub fn permitted_for(&self, role: Role) -> bool {
        match self {
            Self::SetTouch { .. } | Self::ClearTouch => role == Role::Setter,
            Self::Connect { .. } | Self::GetState | Self::Measure(_) => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    Connected {
        session_id: u64,
        role: Role,
        state: TouchState,
    },
    /// Sent to the setter once its mutation is committed.
    Ack {
        version: u64,
    },
    StateUpdate {
        state: TouchState,
        client_count: usize,
        /// Set only on the direct answer to `GET_STATE`.
        #[serde(default, skip_serializing_if = "is_false")]
        requested: bool,
    },
    Measurement {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        state: TouchState,
        vector: ImpedanceVector,
    },
    Error {
        kind: String,
        message: String,
        /// Echoed from a failed `MEASURE`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
}

impl ServerMessage {
    pub fn error(e: &Error) -> Self {
        Self::error_for(e, None)
    }

    pub fn error_for(e: &Error, request_id: Option<String>) -> Self {
        Self::Error {
            kind: e.kind().to_string(),
            message: e.to_string(),
            request_id,
        }
    }

    /// Broadcasts are the only messages not sent in answer to a request.
    /// Every request gets exactly one direct reply, in request order.
    pub fn is_broadcast(&self) -> bool {
        matches!(self, Self::StateUpdate { requested: false, .. })
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Serialise a message as one newline-terminated line.
pub fn encode_line<T: Serialize>(msg: &T) -> Result<String> {
    let mut line = serde_json::to_string(msg)
        .map_err(|e| Error::Protocol(format!("cannot encode message: {e}")))?;
    line.push('\n');
    Ok(line)
}

/// Parse one line.  Anything that is not a known message is a protocol error.
pub fn decode<'a, T: Deserialize<'a>>(line: &'a str) -> Result<T> {
    serde_json::from_str(line.trim_end())
        .map_err(|e| Error::Protocol(format!("malformed message: {e}")))
}
