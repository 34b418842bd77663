//! Voice session coordinator
//!
//! Owns the single microphone session and arbitrates it against speech
//! output. All transitions and provider callbacks run under one async lock,
//! so the session state machine is processed one event at a time:
//!
//! ```text
//! Idle ──request_start──▶ Listening ──request_stop / error / end──▶ Idle
//!  │ ▲                        ▲
//!  │ └──speech finished──┐    │ request_start (speech stopped first)
//!  └──speak──────────▶ Speaking
//! ```
//!
//! Invariants:
//! - never Listening and Speaking at once
//! - at most one provider session handle exists
//! - provider events for any session other than the active one are discarded

use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::breaker::{BreakerState, CircuitBreaker, Classify, Guarded};
use crate::config::Config;
use crate::events::{EventBus, VoiceEvent};
use crate::provider::{
    Backend, EventSink, LocalProvider, Provider, ProviderError, ProviderEvent, RemoteProvider, SessionId,
    Severity, Termination,
};
use crate::transcript::{Corrections, Deduplicator, TranscriptPipeline};
use crate::voice::{
    AudioSource, CaptureFormat, MicrophoneSource, MutedSpeech, RecognizerSettings, SpeechOptions, SpeechOutput,
    SpeechToText, SynthesizedSpeech, TextToSpeech, VadRecognizer, VadSettings, speakable,
};
use crate::{Error, Result};

/// Default minimum time between a stop and the next accepted start
pub const DEFAULT_RESTART_COOLDOWN: Duration = Duration::from_millis(600);

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Neither listening nor speaking
    Idle,
    /// A recognition session is running
    Listening,
    /// Speech output is playing
    Speaking,
}

/// Result of [`Coordinator::request_start`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new session is running
    Started,
    /// Already listening; nothing changed
    AlreadyListening,
    /// Too soon after the last stop; ignored
    Throttled,
}

/// Result of [`Coordinator::request_stop`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The running session was stopped
    Stopped,
    /// Not listening; nothing changed
    NotListening,
}

/// Result of [`Coordinator::speak`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeakOutcome {
    /// Speech output started
    Speaking,
    /// Held until the stopped session delivers its terminal signal
    Queued,
    /// Dropped because the microphone is listening
    Refused,
    /// Nothing speakable
    Empty,
}

/// Coordinator counters for observation and tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Diagnostics {
    /// Current state
    pub state: SessionState,
    /// Backend currently in use
    pub backend: Backend,
    /// Successful provider starts
    pub sessions_started: u64,
    /// Provider terminal signals received
    pub terminals_observed: u64,
    /// A stopped session has not yet delivered its terminal signal
    pub draining: bool,
    /// Speech is waiting for draining to finish
    pub speech_pending: bool,
    /// Breaker snapshot
    pub breaker: BreakerState,
}

/// Coordinator tuning
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// Breaker guarding provider starts
    pub breaker: CircuitBreaker,
    /// Misrecognition corrections
    pub corrections: Corrections,
    /// Repeated-final window
    pub dedup_window: Duration,
    /// Confidence for promoted interims without one
    pub promotion_confidence: f32,
    /// Ignore starts this soon after a stop
    pub restart_cooldown: Duration,
    /// Stop listening after each stable transcript
    pub auto_stop_after_final: bool,
    /// Voice parameters for speech output
    pub speech: SpeechOptions,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            breaker: CircuitBreaker::default(),
            corrections: Corrections::default(),
            dedup_window: crate::transcript::DEFAULT_DEDUP_WINDOW,
            promotion_confidence: crate::transcript::DEFAULT_PROMOTION_CONFIDENCE,
            restart_cooldown: DEFAULT_RESTART_COOLDOWN,
            auto_stop_after_final: false,
            speech: SpeechOptions::default(),
        }
    }
}

struct Inner {
    state: SessionState,
    provider: Provider,
    fallback: Option<LocalProvider>,
    sink: EventSink,
    breaker: CircuitBreaker,
    pipeline: TranscriptPipeline,
    active: Option<SessionId>,
    draining: Option<SessionId>,
    pending_speech: Option<Vec<String>>,
    speech_generation: u64,
    speech_task: Option<JoinHandle<()>>,
    last_stop: Option<Instant>,
    sessions_started: u64,
    terminals_observed: u64,
}

struct Shared {
    inner: Mutex<Inner>,
    bus: EventBus,
    speech: Arc<dyn SpeechOutput>,
    speech_options: SpeechOptions,
    restart_cooldown: Duration,
    auto_stop_after_final: bool,
}

/// Handle to the voice coordinator
///
/// Cheap to clone; all clones drive the same session.
#[derive(Clone)]
pub struct Coordinator {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator").finish_non_exhaustive()
    }
}

impl Coordinator {
    /// Create a coordinator
    ///
    /// `fallback` is used once, when `provider` is remote and reports
    /// `start_failed`. Must be called inside a Tokio runtime; it spawns the
    /// task that feeds provider events into the state machine.
    #[must_use]
    pub fn new(
        mut provider: Provider,
        fallback: Option<LocalProvider>,
        speech: Arc<dyn SpeechOutput>,
        bus: EventBus,
        options: CoordinatorOptions,
    ) -> Self {
        let (sink, events) = mpsc::unbounded_channel();
        provider.set_event_sink(sink.clone());

        let pipeline = TranscriptPipeline::new(
            bus.clone(),
            options.corrections,
            Deduplicator::new(options.dedup_window),
        )
        .with_promotion_confidence(options.promotion_confidence);

        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                state: SessionState::Idle,
                provider,
                fallback,
                sink,
                breaker: options.breaker,
                pipeline,
                active: None,
                draining: None,
                pending_speech: None,
                speech_generation: 0,
                speech_task: None,
                last_stop: None,
                sessions_started: 0,
                terminals_observed: 0,
            }),
            bus,
            speech,
            speech_options: options.speech,
            restart_cooldown: options.restart_cooldown,
            auto_stop_after_final: options.auto_stop_after_final,
        });

        tokio::spawn(pump(Arc::downgrade(&shared), events));
        Self { shared }
    }

    /// Build the full stack from configuration
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the selected backend cannot be built
    /// (e.g. local recognition without an STT key)
    pub fn from_config(config: &Config, bus: EventBus) -> Result<Self> {
        let format = CaptureFormat {
            sample_rate: config.audio.sample_rate,
            frame_samples: config.audio.frame_samples,
        };
        let source: Arc<dyn AudioSource> =
            Arc::new(MicrophoneSource::with_device(config.audio.input_device.clone()));

        let local = match build_local(config, format, Arc::clone(&source)) {
            Ok(local) => Some(local),
            Err(e) if config.backend == Backend::Remote => {
                tracing::warn!(error = %e, "local recognizer unavailable, remote has no fallback");
                None
            }
            Err(e) => return Err(e),
        };

        let (provider, fallback) = match (config.backend, local) {
            (Backend::Local, Some(local)) => (Provider::Local(local), None),
            (Backend::Local, None) => {
                return Err(Error::Config("local recognizer could not be built".to_string()));
            }
            (Backend::Remote, fallback) => {
                let remote = RemoteProvider::new(config.remote.url.clone(), source)
                    .with_format(format)
                    .with_connect_timeout(config.session.start_timeout)
                    .with_stop_grace(config.remote.stop_grace);
                (Provider::Remote(remote), fallback)
            }
        };

        let speech: Arc<dyn SpeechOutput> = match config.api_keys.openai.clone() {
            Some(key) => Arc::new(SynthesizedSpeech::new(TextToSpeech::new(
                key,
                config.speech.voice.clone(),
                config.speech.model.clone(),
            )?)),
            None => {
                tracing::warn!("OPENAI_API_KEY not set, speech output muted");
                Arc::new(MutedSpeech)
            }
        };

        let options = CoordinatorOptions {
            breaker: CircuitBreaker::new(config.breaker.max_failures, config.breaker.cooldown),
            corrections: Corrections::default().with_extra(config.transcript.extra_corrections.clone()),
            dedup_window: config.transcript.dedup_window,
            promotion_confidence: config.transcript.promotion_confidence,
            restart_cooldown: config.session.restart_cooldown,
            auto_stop_after_final: config.transcript.auto_stop_after_final,
            speech: config.speech_options(),
        };

        tracing::info!(backend = %config.backend, language = %config.language, "voice coordinator ready");
        Ok(Self::new(provider, fallback, speech, bus, options))
    }

    /// The bus this coordinator publishes to
    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.shared.bus
    }

    /// Current state
    pub async fn state(&self) -> SessionState {
        self.lock().await.state
    }

    /// Counters and breaker snapshot
    pub async fn diagnostics(&self) -> Diagnostics {
        let inner = self.lock().await;
        Diagnostics {
            state: inner.state,
            backend: inner.provider.backend(),
            sessions_started: inner.sessions_started,
            terminals_observed: inner.terminals_observed,
            draining: inner.draining.is_some(),
            speech_pending: inner.pending_speech.is_some(),
            breaker: inner.breaker.state(),
        }
    }

    /// Begin listening
    ///
    /// Stops any speech output first, then starts the provider through the
    /// circuit breaker. A remote provider that reports `start_failed` is
    /// replaced by the local fallback for this and every later start.
    ///
    /// # Errors
    ///
    /// [`Error::BreakerOpen`] while the breaker refuses starts, or
    /// [`Error::Provider`] with the classified start failure. Both leave the
    /// coordinator idle with the mic inactive.
    pub async fn request_start(&self) -> Result<StartOutcome> {
        let mut inner = self.lock().await;

        if inner.state == SessionState::Listening {
            return Ok(StartOutcome::AlreadyListening);
        }

        if let Some(at) = inner.last_stop
            && at.elapsed() < self.shared.restart_cooldown
        {
            tracing::debug!(since_stop_ms = at.elapsed().as_millis(), "start throttled");
            return Ok(StartOutcome::Throttled);
        }

        if inner.state == SessionState::Speaking {
            self.halt_speech(&mut inner);
        }
        if inner.pending_speech.take().is_some() {
            tracing::debug!("dropping queued speech, listening again");
        }

        if let Err(open) = inner.breaker.check() {
            let e = Error::BreakerOpen {
                retry_after: open.retry_after,
            };
            tracing::warn!(retry_after_ms = open.retry_after.as_millis(), "start refused, breaker open");
            self.shared.bus.publish(VoiceEvent::error("breaker-open", &e.user_message()));
            return Err(e);
        }

        self.shared.bus.publish(VoiceEvent::mic_mode(true));
        inner.pipeline.reset_utterance();

        match inner.start_provider().await {
            Ok(session) => {
                inner.state = SessionState::Listening;
                inner.active = Some(session);
                inner.sessions_started += 1;
                tracing::info!(session = %session, backend = %inner.provider.backend(), "listening");
                Ok(StartOutcome::Started)
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to start listening");
                if let Some(event) = error_event(&e) {
                    self.shared.bus.publish(event);
                }
                self.shared.bus.publish(VoiceEvent::mic_mode(false));
                inner.state = SessionState::Idle;
                Err(e)
            }
        }
    }

    /// Stop listening; no-op unless listening
    ///
    /// The trailing interim, if any, is promoted to a stable transcript.
    /// The provider's terminal signal for the stopped session arrives later
    /// and is consumed without further effect.
    pub async fn request_stop(&self) -> StopOutcome {
        let mut inner = self.lock().await;
        if inner.state != SessionState::Listening {
            return StopOutcome::NotListening;
        }

        self.stop_listening(&mut inner, "requested");
        StopOutcome::Stopped
    }

    /// Speak `texts` with the configured voice
    pub async fn speak(&self, texts: Vec<String>) -> SpeakOutcome {
        let texts = speakable(&texts);
        if texts.is_empty() {
            return SpeakOutcome::Empty;
        }

        let mut inner = self.lock().await;
        match inner.state {
            SessionState::Listening => {
                tracing::debug!("speech refused while listening");
                SpeakOutcome::Refused
            }
            _ if inner.draining.is_some() => {
                tracing::debug!("speech queued until the stopped session ends");
                inner.pending_speech = Some(texts);
                SpeakOutcome::Queued
            }
            SessionState::Speaking | SessionState::Idle => {
                if inner.state == SessionState::Speaking {
                    self.halt_speech(&mut inner);
                }
                self.begin_speech(&mut inner, texts);
                SpeakOutcome::Speaking
            }
        }
    }

    /// Interrupt speech output and drop queued speech
    pub async fn stop_speaking(&self) {
        let mut inner = self.lock().await;
        inner.pending_speech = None;
        if inner.state == SessionState::Speaking {
            self.halt_speech(&mut inner);
            tracing::debug!("speech stopped");
        }
    }

    /// Pause speech output; no-op when not speaking
    pub async fn pause_speaking(&self) {
        if self.lock().await.state == SessionState::Speaking {
            self.shared.speech.pause();
        }
    }

    /// Resume paused speech output
    pub async fn resume_speaking(&self) {
        if self.lock().await.state == SessionState::Speaking {
            self.shared.speech.resume();
        }
    }

    async fn lock(&self) -> MutexGuard<'_, Inner> {
        self.shared.inner.lock().await
    }

    fn stop_listening(&self, inner: &mut Inner, reason: &'static str) {
        inner.provider.stop();
        inner.draining = inner.active.take();
        inner.pipeline.promote_interim_to_final();
        inner.state = SessionState::Idle;
        inner.last_stop = Some(Instant::now());

        tracing::info!(reason, draining = inner.draining.is_some(), "stopped listening");
        self.shared.bus.publish(VoiceEvent::mic_mode(false));
    }

    fn begin_speech(&self, inner: &mut Inner, texts: Vec<String>) {
        inner.speech_generation += 1;
        inner.state = SessionState::Speaking;

        let generation = inner.speech_generation;
        let speech = Arc::clone(&self.shared.speech);
        let options = self.shared.speech_options.clone();
        let this = self.clone();

        inner.speech_task = Some(tokio::spawn(async move {
            if let Err(e) = speech.speak(&texts, &options).await {
                tracing::warn!(error = %e, "speech output failed");
            }
            this.finish_speech(generation).await;
        }));
    }

    /// Cancel the speech request in flight, including one not yet begun
    fn halt_speech(&self, inner: &mut Inner) {
        if let Some(task) = inner.speech_task.take() {
            task.abort();
        }
        self.shared.speech.stop();
        inner.speech_generation += 1;
        inner.state = SessionState::Idle;
    }

    async fn finish_speech(&self, generation: u64) {
        let mut inner = self.lock().await;
        if inner.speech_generation == generation && inner.state == SessionState::Speaking {
            inner.state = SessionState::Idle;
            tracing::debug!("speech finished");
        }
    }

    async fn on_provider_event(&self, event: ProviderEvent) {
        let mut inner = self.lock().await;
        let session = event.session();

        match event {
            ProviderEvent::Batch { batch, .. } => {
                if inner.active != Some(session) {
                    tracing::trace!(session = %session, "discarding batch from inactive session");
                    return;
                }
                // A session that produces results is a healthy one
                inner.breaker.record_success();
                let stable = inner.pipeline.process(&batch).is_some();
                if stable && self.shared.auto_stop_after_final {
                    self.stop_listening(&mut inner, "final transcript");
                }
            }
            ProviderEvent::Error { error, .. } => {
                if inner.active != Some(session) {
                    tracing::debug!(session = %session, error = %error, "discarding error from inactive session");
                    return;
                }
                if error.is_critical() {
                    inner.breaker.record_failure();
                }
                self.shared
                    .bus
                    .publish(VoiceEvent::error(error.code(), error.user_message()));
                self.stop_listening(&mut inner, "provider error");
            }
            ProviderEvent::Ended { termination, .. } => {
                inner.terminals_observed += 1;

                let ours = inner.active == Some(session) || inner.draining == Some(session);
                if ours && !matches!(termination, Termination::Failed { .. }) {
                    inner.breaker.record_success();
                }

                if inner.active == Some(session) {
                    tracing::debug!(session = %session, ?termination, "session ended by provider");
                    inner.active = None;
                    self.stop_listening(&mut inner, "provider ended");
                } else if inner.draining == Some(session) {
                    tracing::trace!(session = %session, "stopped session drained");
                    inner.draining = None;
                    if inner.state == SessionState::Idle
                        && let Some(texts) = inner.pending_speech.take()
                    {
                        self.begin_speech(&mut inner, texts);
                    }
                } else {
                    tracing::trace!(session = %session, "terminal from unknown session");
                }
            }
        }
    }
}

impl Inner {
    async fn start_provider(&mut self) -> Result<SessionId> {
        match self.guarded_start().await {
            Err(Guarded::Failed(e))
                if e.severity() == Severity::Fallback && self.provider.backend() == Backend::Remote =>
            {
                let Some(mut local) = self.fallback.take() else {
                    return Err(Error::Provider(e));
                };
                tracing::warn!(error = %e, "remote recognition unavailable, falling back to local");
                local.set_event_sink(self.sink.clone());
                self.provider = Provider::Local(local);
                self.guarded_start().await.map_err(into_error)
            }
            result => result.map_err(into_error),
        }
    }

    /// Start through the breaker; success is scored once the session proves healthy
    async fn guarded_start(&mut self) -> std::result::Result<SessionId, Guarded<ProviderError>> {
        let provider = &mut self.provider;
        self.breaker.attempt(|| async move { provider.start().await }).await
    }
}

fn into_error(guarded: Guarded<ProviderError>) -> Error {
    match guarded {
        Guarded::Open(open) => Error::BreakerOpen {
            retry_after: open.retry_after,
        },
        Guarded::Failed(e) => Error::Provider(e),
    }
}

/// Event to publish for a failed start; refusals and benign endings publish nothing
fn error_event(error: &Error) -> Option<VoiceEvent> {
    match error {
        Error::Provider(e) if matches!(e.severity(), Severity::Refusal | Severity::Benign) => None,
        Error::Provider(e) => Some(VoiceEvent::error(e.code(), e.user_message())),
        Error::BreakerOpen { .. } => Some(VoiceEvent::error("breaker-open", &error.user_message())),
        other => Some(VoiceEvent::error("error", &other.user_message())),
    }
}

/// Feeds provider events into the coordinator until it is dropped
async fn pump(shared: Weak<Shared>, mut events: mpsc::UnboundedReceiver<ProviderEvent>) {
    while let Some(event) = events.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        Coordinator { shared }.on_provider_event(event).await;
    }
    tracing::trace!("provider event pump finished");
}

fn build_local(config: &Config, format: CaptureFormat, source: Arc<dyn AudioSource>) -> Result<LocalProvider> {
    let key = config
        .stt_key()
        .ok_or_else(|| Error::Config(format!("no API key for {:?} transcription", config.local.stt)))?;
    let transcriber = SpeechToText::new(config.local.stt, key, config.local.stt_model.clone(), &config.language)?;

    let settings = RecognizerSettings {
        format,
        vad: VadSettings {
            energy_threshold: config.local.energy_threshold,
            min_speech: config.local.min_speech,
            trailing_silence: config.local.trailing_silence,
        },
        silence_timeout: config.local.silence_timeout,
        interim_interval: config.local.interim_interval,
    };

    let recognizer = VadRecognizer::new(source, Arc::new(transcriber), settings);
    Ok(LocalProvider::new(Box::new(recognizer)).with_start_timeout(config.session.start_timeout))
}
