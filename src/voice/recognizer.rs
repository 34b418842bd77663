//! On-device continuous recognizer
//!
//! Captures audio, segments it with [`SpeechDetector`] and transcribes each
//! segment with a [`SegmentTranscriber`]. Behaves like a platform continuous
//! recognizer: `Started` once capture runs, `Result` per hypothesis, and an
//! `End` after `aborted`, a silence timeout or a failure.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use super::capture::{AudioSource, AudioStream, CaptureFormat};
use super::stt::SegmentTranscriber;
use super::vad::{Activity, SpeechDetector, VadSettings};
use crate::Error;
use crate::provider::{ContinuousRecognizer, ProviderError, RecognitionResult, RecognizerEvent};

/// Default time without speech before the recognizer ends the session
pub const DEFAULT_SILENCE_TIMEOUT: Duration = Duration::from_secs(8);

/// Default spacing of interim hypotheses inside a long segment
pub const DEFAULT_INTERIM_INTERVAL: Duration = Duration::from_secs(2);

/// Tuning of [`VadRecognizer`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecognizerSettings {
    /// Capture format
    pub format: CaptureFormat,
    /// Segmentation thresholds
    pub vad: VadSettings,
    /// Silence after which the session ends on its own
    pub silence_timeout: Duration,
    /// Transcribe the open segment this often for interims; `None` disables
    pub interim_interval: Option<Duration>,
}

impl Default for RecognizerSettings {
    fn default() -> Self {
        Self {
            format: CaptureFormat::default(),
            vad: VadSettings::default(),
            silence_timeout: DEFAULT_SILENCE_TIMEOUT,
            interim_interval: Some(DEFAULT_INTERIM_INTERVAL),
        }
    }
}

/// Voice-activity-driven continuous recognizer
pub struct VadRecognizer {
    source: Arc<dyn AudioSource>,
    transcriber: Arc<dyn SegmentTranscriber>,
    settings: RecognizerSettings,
    abort: Option<oneshot::Sender<()>>,
}

impl VadRecognizer {
    /// Create a recognizer over `source` and `transcriber`
    #[must_use]
    pub fn new(
        source: Arc<dyn AudioSource>,
        transcriber: Arc<dyn SegmentTranscriber>,
        settings: RecognizerSettings,
    ) -> Self {
        Self {
            source,
            transcriber,
            settings,
            abort: None,
        }
    }
}

impl ContinuousRecognizer for VadRecognizer {
    fn name(&self) -> &'static str {
        "vad-recognizer"
    }

    fn start(&mut self, events: mpsc::UnboundedSender<RecognizerEvent>) -> Result<(), ProviderError> {
        let (abort_tx, abort_rx) = oneshot::channel();
        self.abort = Some(abort_tx);

        let session = Session {
            detector: SpeechDetector::new(self.settings.vad, self.settings.format.sample_rate),
            transcriber: Arc::clone(&self.transcriber),
            settings: self.settings,
            events,
            heard_speech: false,
            interim_mark: 0,
        };
        tokio::spawn(session.run(Arc::clone(&self.source), abort_rx));
        Ok(())
    }

    fn abort(&mut self) {
        if let Some(abort) = self.abort.take() {
            let _ = abort.send(());
        }
    }
}

/// Why a session stopped
enum Stop {
    Aborted,
    SilenceTimeout,
    DeviceLost,
    Failed(Error),
}

struct Session {
    detector: SpeechDetector,
    transcriber: Arc<dyn SegmentTranscriber>,
    settings: RecognizerSettings,
    events: mpsc::UnboundedSender<RecognizerEvent>,
    heard_speech: bool,
    interim_mark: usize,
}

impl Session {
    async fn run(mut self, source: Arc<dyn AudioSource>, mut abort: oneshot::Receiver<()>) {
        let format = self.settings.format;
        let mut stream = match tokio::task::spawn_blocking(move || source.open(format)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "recognizer could not open capture");
                self.end_with("audio-capture", Some(e.to_string()));
                return;
            }
            Err(e) => {
                self.end_with("audio-capture", Some(e.to_string()));
                return;
            }
        };

        self.send(RecognizerEvent::Started);

        let stop = tokio::select! {
            biased;
            _ = &mut abort => Stop::Aborted,
            stop = self.listen(&mut stream) => stop,
        };
        stream.stop();

        match stop {
            Stop::Aborted => self.end_with("aborted", None),
            Stop::SilenceTimeout if self.heard_speech => {
                tracing::debug!("silence timeout, ending session");
                self.send(RecognizerEvent::End);
            }
            Stop::SilenceTimeout => self.end_with("no-speech", None),
            Stop::DeviceLost => self.end_with("audio-capture", Some("capture stream ended".to_string())),
            Stop::Failed(e) => self.end_with("network", Some(e.to_string())),
        }
    }

    async fn listen(&mut self, stream: &mut AudioStream) -> Stop {
        let mut last_voice = Instant::now();

        loop {
            let frame = tokio::select! {
                frame = stream.next_frame() => frame,
                () = tokio::time::sleep_until(last_voice + self.settings.silence_timeout) => {
                    return Stop::SilenceTimeout;
                }
            };
            let Some(frame) = frame else {
                return Stop::DeviceLost;
            };

            let result = match self.detector.process(&frame) {
                Activity::Silence => Ok(()),
                Activity::Speech => {
                    last_voice = Instant::now();
                    self.heard_speech = true;
                    self.interim().await
                }
                Activity::SegmentComplete(samples) => {
                    last_voice = Instant::now();
                    self.interim_mark = 0;
                    self.finalize(&samples).await
                }
            };

            if let Err(e) = result {
                return Stop::Failed(e);
            }
        }
    }

    /// Transcribe the open segment once it has grown by another interval
    async fn interim(&mut self) -> crate::Result<()> {
        let Some(interval) = self.settings.interim_interval else {
            return Ok(());
        };
        let step = samples_for(interval, self.settings.format.sample_rate);
        let buffered = self.detector.speech_buffer().len();
        if step == 0 || buffered < self.interim_mark + step {
            return Ok(());
        }
        self.interim_mark = buffered;

        let samples = self.detector.speech_buffer().to_vec();
        let alternatives = self.transcribe(&samples).await?;
        if let Some((text, confidence)) = alternatives.into_iter().next() {
            self.send(RecognizerEvent::Result(vec![RecognitionResult::interim(text, confidence)]));
        }
        Ok(())
    }

    async fn finalize(&mut self, samples: &[f32]) -> crate::Result<()> {
        let alternatives = self.transcribe(samples).await?;
        if alternatives.is_empty() {
            tracing::debug!("segment produced no text");
            return Ok(());
        }

        self.send(RecognizerEvent::Result(vec![RecognitionResult::final_(alternatives)]));
        Ok(())
    }

    /// Transport failures end the session; other failures skip the segment
    async fn transcribe(&self, samples: &[f32]) -> crate::Result<Vec<(String, Option<f32>)>> {
        match self
            .transcriber
            .transcribe(samples, self.settings.format.sample_rate)
            .await
        {
            Ok(alternatives) => Ok(alternatives),
            Err(e @ Error::Http(_)) => Err(e),
            Err(e) => {
                tracing::warn!(error = %e, "segment transcription failed, skipping");
                Ok(Vec::new())
            }
        }
    }

    fn send(&self, event: RecognizerEvent) {
        let _ = self.events.send(event);
    }

    fn end_with(&self, code: &str, message: Option<String>) {
        self.send(RecognizerEvent::Error {
            code: code.to_string(),
            message,
        });
        self.send(RecognizerEvent::End);
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn samples_for(duration: Duration, sample_rate: u32) -> usize {
    (duration.as_secs_f64() * f64::from(sample_rate)).round() as usize
}
