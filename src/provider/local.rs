//! Provider over an on-device continuous recognizer
//!
//! The recognizer reports platform-style events (`Started`, `Result`,
//! `Error { code }`, `End`). This module translates them into the provider
//! contract: critical errors are surfaced, `aborted` and `no-speech` are
//! treated as ordinary endings, and exactly one `Ended` closes each session.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{EventSink, ProviderError, ProviderEvent, SessionId, Severity, Termination, emit};
use crate::transcript::HypothesisBatch;

/// Default bound on waiting for the recognizer to acknowledge a start
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(5);

/// One result entry of a recognizer `Result` event
#[derive(Debug, Clone, PartialEq)]
pub struct RecognitionResult {
    /// `(text, confidence)` pairs, best first
    pub alternatives: Vec<(String, Option<f32>)>,
    /// Whether the recognizer will not revise this result
    pub is_final: bool,
}

impl RecognitionResult {
    /// Single-alternative interim result
    #[must_use]
    pub fn interim(text: impl Into<String>, confidence: Option<f32>) -> Self {
        Self {
            alternatives: vec![(text.into(), confidence)],
            is_final: false,
        }
    }

    /// Final result with ranked alternatives
    #[must_use]
    pub fn final_<S: Into<String>>(alternatives: impl IntoIterator<Item = (S, Option<f32>)>) -> Self {
        Self {
            alternatives: alternatives
                .into_iter()
                .map(|(text, confidence)| (text.into(), confidence))
                .collect(),
            is_final: true,
        }
    }
}

/// Event reported by a continuous recognizer
#[derive(Debug, Clone, PartialEq)]
pub enum RecognizerEvent {
    /// Capture is running
    Started,
    /// New or revised results
    Result(Vec<RecognitionResult>),
    /// Error code, followed by `End`
    Error {
        /// Platform error code
        code: String,
        /// Optional detail
        message: Option<String>,
    },
    /// Session over; nothing follows
    End,
}

/// Platform continuous speech recognizer
///
/// Implementations deliver events for the session started by the latest
/// `start` call on the given channel and must finish every session with
/// [`RecognizerEvent::End`]. The recognizer may end a session on its own
/// (silence timeout), reporting `aborted` or `no-speech` first.
pub trait ContinuousRecognizer: Send {
    /// Name for logs
    fn name(&self) -> &'static str {
        "recognizer"
    }

    /// Begin a session
    ///
    /// # Errors
    ///
    /// Returns a classified error when the session cannot be created at all
    fn start(&mut self, events: mpsc::UnboundedSender<RecognizerEvent>) -> Result<(), ProviderError>;

    /// End the current session immediately, reporting `aborted`
    ///
    /// Must be a no-op when no session is running.
    fn abort(&mut self);
}

struct ActiveSession {
    id: SessionId,
    stop_requested: Arc<AtomicBool>,
    live: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

/// Recognition provider backed by a [`ContinuousRecognizer`]
pub struct LocalProvider {
    recognizer: Box<dyn ContinuousRecognizer>,
    sink: Option<EventSink>,
    start_timeout: Duration,
    active: Option<ActiveSession>,
}

impl LocalProvider {
    /// Wrap a recognizer
    #[must_use]
    pub fn new(recognizer: Box<dyn ContinuousRecognizer>) -> Self {
        Self {
            recognizer,
            sink: None,
            start_timeout: DEFAULT_START_TIMEOUT,
            active: None,
        }
    }

    /// Override the start acknowledgment timeout
    #[must_use]
    pub const fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    /// Register the event sink; the last registration wins
    pub fn set_event_sink(&mut self, sink: EventSink) {
        self.sink = Some(sink);
    }

    /// Whether a session handle is live
    ///
    /// Stays true after [`Self::stop`] until the recognizer has wound the
    /// session down.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|s| s.live.load(Ordering::Acquire))
    }

    /// Start a recognition session
    ///
    /// Waits for the recognizer to acknowledge, so permission and device
    /// failures are reported here rather than after the fact. A stopped
    /// session still winding down is awaited first, bounded by the start
    /// timeout, so two sessions never hold the capture device at once.
    ///
    /// A session the recognizer ends benignly before acknowledging
    /// (`no-speech`, `aborted`) still counts as started; its `Ended` follows.
    ///
    /// # Errors
    ///
    /// `already-active` while a session is live or fails to wind down,
    /// `timeout` when no acknowledgment arrives in time, or the recognizer's
    /// classified error.
    pub async fn start(&mut self) -> Result<SessionId, ProviderError> {
        if let Some(mut previous) = self.active.take()
            && previous.live.load(Ordering::Acquire)
        {
            let stopping = previous.stop_requested.load(Ordering::Acquire);
            let wound_down = stopping
                && tokio::time::timeout(self.start_timeout, &mut previous.task)
                    .await
                    .is_ok();
            if !wound_down {
                tracing::debug!(session = %previous.id, stopping, "previous session still live");
                self.active = Some(previous);
                return Err(ProviderError::already_active());
            }
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        self.recognizer.start(tx)?;

        let Ok(first) = tokio::time::timeout(self.start_timeout, rx.recv()).await else {
            self.recognizer.abort();
            return Err(ProviderError::timeout(format!(
                "{} did not start within {}ms",
                self.recognizer.name(),
                self.start_timeout.as_millis()
            )));
        };

        let early = match first {
            Some(RecognizerEvent::Started) => None,
            Some(event @ RecognizerEvent::Result(_)) => Some(event),
            Some(RecognizerEvent::Error { code, message }) => {
                let error = ProviderError::from_code(&code, message.clone());
                if error.severity() != Severity::Benign {
                    return Err(error);
                }
                tracing::debug!(code = %code, "recognizer ended before acknowledging");
                Some(RecognizerEvent::Error { code, message })
            }
            Some(RecognizerEvent::End) | None => {
                return Err(ProviderError::start_failed(format!(
                    "{} ended before starting",
                    self.recognizer.name()
                )));
            }
        };

        let id = SessionId::next();
        let stop_requested = Arc::new(AtomicBool::new(false));
        let live = Arc::new(AtomicBool::new(true));

        let mut translator = Translator::new(id, Arc::clone(&stop_requested));
        let task_live = Arc::clone(&live);
        let sink = self.sink.clone();

        let task = tokio::spawn(async move {
            let mut pending = early;
            while !translator.is_ended() {
                let event = match pending.take() {
                    Some(event) => event,
                    None => match rx.recv().await {
                        Some(event) => event,
                        None => break,
                    },
                };

                let out = translator.translate(event);
                if translator.is_ended() {
                    task_live.store(false, Ordering::Release);
                }
                for event in out {
                    emit(sink.as_ref(), event);
                }
            }

            task_live.store(false, Ordering::Release);
            if let Some(ended) = translator.finish() {
                tracing::debug!(session = %id, "recognizer channel closed without end");
                emit(sink.as_ref(), ended);
            }
        });

        tracing::debug!(session = %id, recognizer = self.recognizer.name(), "local session started");

        self.active = Some(ActiveSession {
            id,
            stop_requested,
            live,
            task,
        });
        Ok(id)
    }

    /// Abort the current session; no-op when idle or already stopping
    pub fn stop(&mut self) {
        let Some(session) = self.active.as_ref() else {
            return;
        };

        if session.stop_requested.swap(true, Ordering::AcqRel) {
            return;
        }
        if session.live.load(Ordering::Acquire) {
            tracing::debug!(session = %session.id, "aborting local session");
            self.recognizer.abort();
        }
    }
}

/// Maps recognizer events of one session onto provider events
struct Translator {
    session: SessionId,
    stop_requested: Arc<AtomicBool>,
    termination: Termination,
    ended: bool,
}

impl Translator {
    const fn new(session: SessionId, stop_requested: Arc<AtomicBool>) -> Self {
        Self {
            session,
            stop_requested,
            termination: Termination::Clean,
            ended: false,
        }
    }

    const fn is_ended(&self) -> bool {
        self.ended
    }

    fn translate(&mut self, event: RecognizerEvent) -> Vec<ProviderEvent> {
        if self.ended {
            return Vec::new();
        }

        match event {
            RecognizerEvent::Started => Vec::new(),
            RecognizerEvent::Result(results) => results
                .into_iter()
                .map(|r| HypothesisBatch::from_alternatives(r.is_final, r.alternatives))
                .filter(|batch| !batch.is_empty())
                .map(|batch| ProviderEvent::Batch {
                    session: self.session,
                    batch,
                })
                .collect(),
            RecognizerEvent::Error { code, message } => {
                self.on_error(ProviderError::from_code(&code, message))
            }
            RecognizerEvent::End => self.finish().into_iter().collect(),
        }
    }

    fn on_error(&mut self, error: ProviderError) -> Vec<ProviderEvent> {
        let stopping = self.stop_requested.load(Ordering::Acquire);

        match error.severity() {
            Severity::Critical if !stopping => {
                tracing::warn!(session = %self.session, error = %error, "recognizer failure");
                if !matches!(self.termination, Termination::Failed { .. }) {
                    self.termination = Termination::Failed {
                        code: error.code().to_string(),
                    };
                }
                vec![ProviderEvent::Error {
                    session: self.session,
                    error,
                }]
            }
            Severity::Unclassified => {
                tracing::warn!(session = %self.session, code = error.code(), "unclassified recognizer error");
                Vec::new()
            }
            _ => {
                tracing::debug!(
                    session = %self.session,
                    code = error.code(),
                    stopping,
                    "recognizer session ending"
                );
                if self.termination == Termination::Clean {
                    self.termination = Termination::Benign {
                        code: error.code().to_string(),
                    };
                }
                Vec::new()
            }
        }
    }

    fn finish(&mut self) -> Option<ProviderEvent> {
        if self.ended {
            return None;
        }
        self.ended = true;

        Some(ProviderEvent::Ended {
            session: self.session,
            termination: std::mem::replace(&mut self.termination, Termination::Clean),
        })
    }
}
