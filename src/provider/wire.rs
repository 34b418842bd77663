//! Streaming transcription wire format
//!
//! Client to server: binary frames of mono PCM16LE at the configured sample
//! rate. Server to client: JSON text messages.
//!
//! ```json
//! {"type":"result","final":true,"alternatives":[{"transcript":"안녕","confidence":0.92}]}
//! {"type":"error","error":"quota exceeded"}
//! ```

use serde::{Deserialize, Serialize};

use super::ProviderError;
use crate::transcript::HypothesisBatch;

/// Message sent by the transcription service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Recognition result
    Result {
        /// Whether the result is final
        #[serde(rename = "final", default)]
        is_final: bool,
        /// Ranked alternatives
        #[serde(default)]
        alternatives: Vec<WireAlternative>,
    },
    /// Service-side failure
    Error {
        /// Failure description
        #[serde(default)]
        error: String,
    },
}

/// One alternative of a result message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireAlternative {
    /// Alternative text
    #[serde(default)]
    pub transcript: String,
    /// Confidence, when the service reports one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

/// Decoded server message
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// Hypotheses to forward
    Batch(HypothesisBatch),
    /// Service error to surface
    Error(ProviderError),
}

/// Decode one text message from the service
///
/// Returns `None` for malformed JSON, unknown message types and results
/// without alternatives.
#[must_use]
pub fn decode_server_message(text: &str) -> Option<Decoded> {
    let message = match serde_json::from_str::<ServerMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            tracing::debug!(error = %e, "ignoring unrecognized server message");
            return None;
        }
    };

    match message {
        ServerMessage::Result {
            is_final,
            alternatives,
        } => {
            let batch = HypothesisBatch::from_alternatives(
                is_final,
                alternatives.into_iter().map(|a| (a.transcript, a.confidence)),
            );
            (!batch.is_empty()).then_some(Decoded::Batch(batch))
        }
        ServerMessage::Error { error } => Some(Decoded::Error(ProviderError::remote(error))),
    }
}
