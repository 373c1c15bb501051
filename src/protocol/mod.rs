//! Line-delimited JSON protocol spoken with the automation script.
//!
//! Outbound, one object per line:
//! `{"id": "<string>", "command": "<string>", "params": {...}}`.
//!
//! Inbound, one line per message:
//! - `RESPONSE:{"id": "<string>", ...payload fields...}`
//! - `EVENT:{...payload fields...}`
//! - anything else is free-form diagnostic output, never parsed.

use serde::Serialize;
use thiserror::Error;

pub mod codec;

pub use codec::LineCodec;

/// Prefix marking a command response line.
pub const RESPONSE_MARKER: &str = "RESPONSE:";

/// Prefix marking an unsolicited event line.
pub const EVENT_MARKER: &str = "EVENT:";

/// Which protocol marker a line carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerKind {
    /// `RESPONSE:` line.
    Response,
    /// `EVENT:` line.
    Event,
}

impl std::fmt::Display for MarkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Response => f.write_str("response"),
            Self::Event => f.write_str("event"),
        }
    }
}

/// A protocol line that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The text after the marker is not valid JSON.
    #[error("malformed {kind} JSON: {reason}")]
    MalformedJson {
        /// Marker that introduced the line.
        kind: MarkerKind,
        /// Parser message.
        reason: String,
    },

    /// A response object without a usable correlation id.
    #[error("response is missing a correlation id")]
    MissingId,

    /// A response whose JSON is not an object.
    #[error("response payload is not a JSON object")]
    NotAnObject,
}

/// One classified line of subprocess output.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Reply to an outbound command.
    Response {
        /// Correlation id of the originating command.
        id: String,
        /// Response fields without the id.
        payload: serde_json::Value,
    },
    /// Unsolicited notification from the script.
    Event {
        /// Event body.
        payload: serde_json::Value,
    },
    /// Free-form log output.
    Diagnostic {
        /// The line, without its terminator.
        text: String,
    },
    /// A protocol line that was dropped because it could not be decoded.
    Malformed {
        /// Why it was dropped.
        error: ProtocolError,
        /// The offending line.
        line: String,
    },
}

/// Outbound command envelope.
#[derive(Debug, Serialize)]
pub struct OutboundCommand<'a> {
    /// Correlation id.
    pub id: &'a str,
    /// Command name understood by the script.
    pub command: &'a str,
    /// Command parameters (always an object on the wire).
    pub params: &'a serde_json::Value,
}

impl OutboundCommand<'_> {
    /// Serialize to a single newline-terminated line.
    ///
    /// # Errors
    ///
    /// Returns a JSON error if serialization fails.
    pub fn to_line(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut bytes = serde_json::to_vec(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }
}

/// Normalise caller params: `null` becomes `{}`.
pub fn normalise_params(params: serde_json::Value) -> serde_json::Value {
    if params.is_null() {
        serde_json::json!({})
    } else {
        params
    }
}
