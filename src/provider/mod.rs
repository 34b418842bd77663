//! Recognition providers
//!
//! A provider owns the capture/recognition resource for one session at a
//! time and reports what it hears as [`ProviderEvent`]s on a single
//! registered sink. Two backends exist, chosen once at construction:
//!
//! - [`LocalProvider`]: wraps a continuous recognizer whose `aborted`
//!   termination is the normal way a session ends
//! - [`RemoteProvider`]: streams PCM frames to a transcription service over a
//!   WebSocket and decodes `result`/`error` messages
//!
//! Contract shared by both: every successful `start` is followed by exactly
//! one [`ProviderEvent::Ended`] for that session, whether or not `stop` was
//! called. `stop` is idempotent and cooperative; one more batch or error may
//! still arrive for the stopped session before its terminal signal.

mod error;
mod local;
mod remote;
mod wire;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::transcript::HypothesisBatch;

pub use error::{ErrorKind, ProviderError, Severity};
pub use local::{ContinuousRecognizer, DEFAULT_START_TIMEOUT, LocalProvider, RecognitionResult, RecognizerEvent};
pub use remote::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_STOP_GRACE, RemoteProvider};
pub use wire::{Decoded, ServerMessage, WireAlternative, decode_server_message};

/// Sink receiving every event of every session of a provider
pub type EventSink = mpsc::UnboundedSender<ProviderEvent>;

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// Identity of one `start` call
///
/// Unique across all providers in the process, so events from a replaced or
/// stopped session can never be mistaken for the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    /// Allocate a fresh session id
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_SESSION.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// How a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// Ended without any error report
    Clean,
    /// Ended by a benign code (`aborted`, `no-speech`, or any code after a stop request)
    Benign {
        /// Reported code
        code: String,
    },
    /// Ended after a critical error that was surfaced as [`ProviderEvent::Error`]
    Failed {
        /// Reported code
        code: String,
    },
}

/// Event emitted by a provider
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    /// Hypotheses for one recognition increment
    Batch {
        /// Originating session
        session: SessionId,
        /// Ranked hypotheses
        batch: HypothesisBatch,
    },
    /// Classified-critical error
    Error {
        /// Originating session
        session: SessionId,
        /// The error
        error: ProviderError,
    },
    /// Terminal signal, exactly once per session
    Ended {
        /// Originating session
        session: SessionId,
        /// How it ended
        termination: Termination,
    },
}

impl ProviderEvent {
    /// Session this event belongs to
    #[must_use]
    pub const fn session(&self) -> SessionId {
        match self {
            Self::Batch { session, .. } | Self::Error { session, .. } | Self::Ended { session, .. } => {
                *session
            }
        }
    }
}

/// Recognition backend selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// On-device continuous recognizer
    #[default]
    Local,
    /// Remote streaming transcription service
    Remote,
}

impl Backend {
    /// Parse a backend name
    ///
    /// Accepts `local`/`webspeech` and `remote`/`google`/`streaming`.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "local" | "webspeech" => Some(Self::Local),
            "remote" | "google" | "streaming" => Some(Self::Remote),
            _ => None,
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Remote => f.write_str("remote"),
        }
    }
}

/// The configured recognition provider
pub enum Provider {
    /// On-device continuous recognizer
    Local(LocalProvider),
    /// Remote streaming transcription
    Remote(RemoteProvider),
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider")
            .field("backend", &self.backend())
            .field("active", &self.is_active())
            .finish()
    }
}

impl Provider {
    /// Which backend this is
    #[must_use]
    pub const fn backend(&self) -> Backend {
        match self {
            Self::Local(_) => Backend::Local,
            Self::Remote(_) => Backend::Remote,
        }
    }

    /// Register the event sink; the last registration wins
    pub fn set_event_sink(&mut self, sink: EventSink) {
        match self {
            Self::Local(p) => p.set_event_sink(sink),
            Self::Remote(p) => p.set_event_sink(sink),
        }
    }

    /// Acquire the resource and begin a session
    ///
    /// # Errors
    ///
    /// Returns `already-active` while a session handle is live, or the
    /// backend's classified start failure.
    pub async fn start(&mut self) -> Result<SessionId, ProviderError> {
        match self {
            Self::Local(p) => p.start().await,
            Self::Remote(p) => p.start().await,
        }
    }

    /// Request termination of the current session; no-op when idle
    pub fn stop(&mut self) {
        match self {
            Self::Local(p) => p.stop(),
            Self::Remote(p) => p.stop(),
        }
    }

    /// Whether a session handle is live
    #[must_use]
    pub fn is_active(&self) -> bool {
        match self {
            Self::Local(p) => p.is_active(),
            Self::Remote(p) => p.is_active(),
        }
    }
}

/// Deliver `event` to `sink`, if one is registered
fn emit(sink: Option<&EventSink>, event: ProviderEvent) {
    match sink {
        Some(sink) => {
            if sink.send(event).is_err() {
                tracing::debug!("provider event sink closed");
            }
        }
        None => tracing::warn!(session = %event.session(), "no event sink registered, dropping event"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_unique_and_increasing() {
        let a = SessionId::next();
        let b = SessionId::next();
        assert!(b > a);
        assert_ne!(a, b);
    }

    #[test]
    fn backend_parsing_accepts_aliases() {
        assert_eq!(Backend::parse("webspeech"), Some(Backend::Local));
        assert_eq!(Backend::parse(" Google "), Some(Backend::Remote));
        assert_eq!(Backend::parse("remote"), Some(Backend::Remote));
        assert_eq!(Backend::parse("carrier-pigeon"), None);
    }
}
