//! Voice event bus
//!
//! Typed publish/subscribe channel for the three voice events: mic mode
//! changes, transcripts and provider errors. One bus is created by the process
//! root and handed to the [`Coordinator`](crate::Coordinator) and to every
//! listener; there is no ambient global.
//!
//! Publishing is fire-and-forget: a bus with no subscribers drops the event,
//! and a subscriber that falls behind sees `RecvError::Lagged` rather than
//! blocking the publisher.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::transcript::{Alternative, StableTranscript};

/// Default number of events buffered per subscriber
const DEFAULT_CAPACITY: usize = 256;

/// Event published on the voice bus
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum VoiceEvent {
    /// Microphone became (or stopped being) the active audio consumer
    MicMode {
        /// Whether the microphone is active
        active: bool,
    },

    /// Recognized text, either a display-only interim or a stable final
    Transcript {
        /// Best hypothesis text
        text: String,
        /// Ranked alternatives, confidence descending
        alternatives: Vec<Alternative>,
        /// Whether this is a stable final transcript
        #[serde(rename = "final")]
        is_final: bool,
    },

    /// Classified-critical provider error or breaker refusal
    Error {
        /// Machine-readable error code
        code: String,
        /// User-facing message
        message: String,
    },
}

impl VoiceEvent {
    /// Build a mic-mode event
    #[must_use]
    pub const fn mic_mode(active: bool) -> Self {
        Self::MicMode { active }
    }

    /// Build a display-only interim transcript event
    #[must_use]
    pub fn interim(text: &str, confidence: f32) -> Self {
        Self::Transcript {
            text: text.to_string(),
            alternatives: vec![Alternative {
                text: text.to_string(),
                confidence,
            }],
            is_final: false,
        }
    }

    /// Build a final transcript event from a stable transcript
    #[must_use]
    pub fn stable(transcript: &StableTranscript) -> Self {
        Self::Transcript {
            text: transcript.text.clone(),
            alternatives: transcript.alternatives.clone(),
            is_final: true,
        }
    }

    /// Build an error event
    #[must_use]
    pub fn error(code: &str, message: &str) -> Self {
        Self::Error {
            code: code.to_string(),
            message: message.to_string(),
        }
    }

    /// Event name as used on the wire (`mic-mode`, `transcript`, `error`)
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::MicMode { .. } => "mic-mode",
            Self::Transcript { .. } => "transcript",
            Self::Error { .. } => "error",
        }
    }
}

/// Process-wide voice event bus
///
/// Cheap to clone; every clone publishes to the same subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<VoiceEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create a bus with the default per-subscriber buffer
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a bus buffering up to `capacity` events per subscriber
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event to every current subscriber
    pub fn publish(&self, event: VoiceEvent) {
        tracing::trace!(event = event.name(), "publishing voice event");
        // No subscribers is not an error
        let _ = self.sender.send(event);
    }

    /// Attach a listener; detaching is dropping the receiver
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<VoiceEvent> {
        self.sender.subscribe()
    }

    /// Number of attached listeners
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
