//! Speech output
//!
//! [`SpeechOutput`] is what the coordinator drives; [`SynthesizedSpeech`]
//! implements it with network TTS and local playback.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::playback::{self, PlaybackControl};
use super::tts::TextToSpeech;
use crate::{Error, Result};

/// Pause between consecutive utterances of one request
pub const UTTERANCE_GAP: Duration = Duration::from_millis(60);

/// Voice parameters of a speak request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechOptions {
    /// Speaking rate, 1.0 is normal
    pub rate: f32,
    /// Pitch, 1.0 is normal
    pub pitch: f32,
    /// Volume in `0..=1`
    pub volume: f32,
    /// BCP-47 language tag
    pub lang: String,
}

impl Default for SpeechOptions {
    fn default() -> Self {
        Self {
            rate: 0.9,
            pitch: 1.0,
            volume: 1.0,
            lang: "ko-KR".to_string(),
        }
    }
}

/// Text-to-speech output device
///
/// `speak` resolves once every utterance has played or the request was
/// stopped. `stop`, `pause` and `resume` apply to the request in flight.
#[async_trait]
pub trait SpeechOutput: Send + Sync {
    /// Speak `texts` in order
    ///
    /// # Errors
    ///
    /// Returns error when synthesis or playback fails
    async fn speak(&self, texts: &[String], options: &SpeechOptions) -> Result<()>;

    /// Interrupt and drop everything queued
    fn stop(&self);

    /// Pause playback; no-op when not speaking
    fn pause(&self);

    /// Resume paused playback
    fn resume(&self);

    /// Whether a request is in flight
    fn is_speaking(&self) -> bool;
}

/// Keeps non-blank texts, trimmed
#[must_use]
pub fn speakable(texts: &[String]) -> Vec<String> {
    texts
        .iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Speech output over `OpenAI` TTS and the default output device
pub struct SynthesizedSpeech {
    tts: TextToSpeech,
    current: Mutex<Option<Arc<PlaybackControl>>>,
    speaking: AtomicBool,
}

impl std::fmt::Debug for SynthesizedSpeech {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SynthesizedSpeech")
            .field("tts", &self.tts)
            .field("speaking", &self.is_speaking())
            .finish_non_exhaustive()
    }
}

impl SynthesizedSpeech {
    /// Create speech output over `tts`
    #[must_use]
    pub const fn new(tts: TextToSpeech) -> Self {
        Self {
            tts,
            current: Mutex::new(None),
            speaking: AtomicBool::new(false),
        }
    }

    fn control(&self) -> Option<Arc<PlaybackControl>> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Install a fresh control, stopping any previous request
    fn begin(&self) -> Arc<PlaybackControl> {
        let control = PlaybackControl::new();
        let previous = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(Arc::clone(&control));
        if let Some(previous) = previous {
            previous.stop();
        }
        self.speaking.store(true, Ordering::Release);
        control
    }

    /// Clear the control if it still belongs to this request
    fn finish(&self, control: &Arc<PlaybackControl>) {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, control)) {
            *current = None;
            self.speaking.store(false, Ordering::Release);
        }
    }

    async fn play_all(&self, texts: &[String], options: &SpeechOptions, control: &Arc<PlaybackControl>) -> Result<()> {
        for (i, text) in texts.iter().enumerate() {
            if control.is_stopped() {
                break;
            }
            if i > 0 {
                tokio::time::sleep(UTTERANCE_GAP).await;
            }

            let mp3 = self.tts.synthesize(text, options.rate).await?;
            if control.is_stopped() {
                break;
            }

            let mut audio = playback::decode_mp3(&mp3)?;
            audio.apply_volume(options.volume);

            let control = Arc::clone(control);
            tokio::task::spawn_blocking(move || playback::play_blocking(&audio, &control))
                .await
                .map_err(|e| Error::Audio(format!("playback task failed: {e}")))??;
        }
        Ok(())
    }
}

#[async_trait]
impl SpeechOutput for SynthesizedSpeech {
    async fn speak(&self, texts: &[String], options: &SpeechOptions) -> Result<()> {
        let texts = speakable(texts);
        if texts.is_empty() {
            return Ok(());
        }

        let control = self.begin();
        tracing::debug!(utterances = texts.len(), rate = options.rate, lang = %options.lang, "speaking");

        let result = self.play_all(&texts, options, &control).await;
        self.finish(&control);

        if let Err(e) = &result {
            tracing::warn!(error = %e, "speech output failed");
        }
        result
    }

    fn stop(&self) {
        let control = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(control) = control {
            control.stop();
            tracing::debug!("speech stopped");
        }
        self.speaking.store(false, Ordering::Release);
    }

    fn pause(&self) {
        if let Some(control) = self.control() {
            control.pause();
        }
    }

    fn resume(&self) {
        if let Some(control) = self.control() {
            control.resume();
        }
    }

    fn is_speaking(&self) -> bool {
        self.speaking.load(Ordering::Acquire)
    }
}

/// Speech output that plays nothing
///
/// Used when no TTS key is configured so the voice loop still runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct MutedSpeech;

#[async_trait]
impl SpeechOutput for MutedSpeech {
    async fn speak(&self, texts: &[String], _options: &SpeechOptions) -> Result<()> {
        tracing::info!(utterances = speakable(texts).len(), "speech output muted, dropping request");
        Ok(())
    }

    fn stop(&self) {}

    fn pause(&self) {}

    fn resume(&self) {}

    fn is_speaking(&self) -> bool {
        false
    }
}
