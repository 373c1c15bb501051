//! Streaming line reassembly and classification.
//!
//! Output arrives in arbitrary chunks. The codec keeps the tail of the
//! current incomplete line and emits one [`InboundMessage`] per complete
//! line. Bytes are decoded only once a line is complete, so a multi-byte
//! UTF-8 character split across two chunks decodes correctly.

use super::{InboundMessage, MarkerKind, ProtocolError, EVENT_MARKER, RESPONSE_MARKER};

/// Reassembles lines from chunks and classifies them.
///
/// Invariant: `buffer` never contains a `\n`; it holds at most the tail of
/// the most recent incomplete line.
#[derive(Debug, Default)]
pub struct LineCodec {
    buffer: Vec<u8>,
}

impl LineCodec {
    /// Create an empty codec.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every message completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<InboundMessage> {
        // The buffer holds no newline, so only the new chunk can complete a line.
        let Some(last_newline) = chunk.iter().rposition(|&b| b == b'\n') else {
            self.buffer.extend_from_slice(chunk);
            return Vec::new();
        };

        let (complete, tail) = chunk.split_at(last_newline);
        let mut block = std::mem::take(&mut self.buffer);
        block.extend_from_slice(complete);
        // `tail` starts with the newline itself.
        self.buffer.extend_from_slice(tail.get(1..).unwrap_or_default());

        block
            .split(|&b| b == b'\n')
            .filter_map(|raw| classify_line(&String::from_utf8_lossy(raw)))
            .collect()
    }

    /// Flush the trailing partial line at end of stream.
    pub fn finish(&mut self) -> Vec<InboundMessage> {
        let rest = std::mem::take(&mut self.buffer);
        classify_line(&String::from_utf8_lossy(&rest))
            .into_iter()
            .collect()
    }

    /// Number of bytes waiting for a line terminator.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }
}

/// Classify one complete line. Blank lines yield `None`.
pub fn classify_line(line: &str) -> Option<InboundMessage> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return None;
    }

    if let Some(body) = line.strip_prefix(RESPONSE_MARKER) {
        return Some(match parse_response(body) {
            Ok((id, payload)) => InboundMessage::Response { id, payload },
            Err(error) => InboundMessage::Malformed {
                error,
                line: line.to_owned(),
            },
        });
    }

    if let Some(body) = line.strip_prefix(EVENT_MARKER) {
        return Some(match serde_json::from_str(body) {
            Ok(payload) => InboundMessage::Event { payload },
            Err(e) => InboundMessage::Malformed {
                error: ProtocolError::MalformedJson {
                    kind: MarkerKind::Event,
                    reason: e.to_string(),
                },
                line: line.to_owned(),
            },
        });
    }

    Some(InboundMessage::Diagnostic {
        text: line.to_owned(),
    })
}

fn parse_response(body: &str) -> Result<(String, serde_json::Value), ProtocolError> {
    let value: serde_json::Value =
        serde_json::from_str(body).map_err(|e| ProtocolError::MalformedJson {
            kind: MarkerKind::Response,
            reason: e.to_string(),
        })?;
    let serde_json::Value::Object(mut fields) = value else {
        return Err(ProtocolError::NotAnObject);
    };
    let id = match fields.remove("id") {
        Some(serde_json::Value::String(s)) if !s.is_empty() => s,
        Some(serde_json::Value::Number(n)) => n.to_string(),
        _ => return Err(ProtocolError::MissingId),
    };
    Ok((id, serde_json::Value::Object(fields)))
}
