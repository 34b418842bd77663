//! Speech-to-text (STT) processing
//!
//! Batch transcription of completed speech segments over HTTP, used by the
//! on-device recognizer to turn each segment into hypotheses.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use super::capture::samples_to_wav;
use crate::{Error, Result};

/// Transcribes one speech segment into ranked `(text, confidence)` alternatives
#[async_trait]
pub trait SegmentTranscriber: Send + Sync {
    /// Transcribe mono samples at `sample_rate`
    ///
    /// An empty result means nothing intelligible was said.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Http`] on transport failure, [`Error::Stt`] when the
    /// service rejects the request
    async fn transcribe(&self, samples: &[f32], sample_rate: u32) -> Result<Vec<(String, Option<f32>)>>;
}

/// Response from OpenAI Whisper transcription API
#[derive(serde::Deserialize)]
struct WhisperResponse {
    text: String,
}

/// Response from Deepgram transcription API
#[derive(serde::Deserialize)]
struct DeepgramResponse {
    results: DeepgramResults,
}

#[derive(serde::Deserialize)]
struct DeepgramResults {
    channels: Vec<DeepgramChannel>,
}

#[derive(serde::Deserialize)]
struct DeepgramChannel {
    alternatives: Vec<DeepgramAlternative>,
}

#[derive(serde::Deserialize)]
struct DeepgramAlternative {
    transcript: String,
    #[serde(default)]
    confidence: Option<f32>,
}

/// STT provider backend
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SttBackend {
    /// `OpenAI` Whisper
    Whisper,
    /// Deepgram prerecorded API
    Deepgram,
}

impl SttBackend {
    /// Parse a backend name (`whisper`/`openai` or `deepgram`)
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "whisper" | "openai" => Some(Self::Whisper),
            "deepgram" => Some(Self::Deepgram),
            _ => None,
        }
    }
}

/// Transcribes speech to text
pub struct SpeechToText {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
    language: String,
    backend: SttBackend,
}

impl std::fmt::Debug for SpeechToText {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeechToText")
            .field("backend", &self.backend)
            .field("model", &self.model)
            .field("language", &self.language)
            .finish_non_exhaustive()
    }
}

impl SpeechToText {
    /// Create an STT client
    ///
    /// `language` is a BCP-47 tag such as `ko-KR`; only the primary subtag
    /// is sent to the service.
    ///
    /// # Errors
    ///
    /// Returns error if the API key is empty
    pub fn new(backend: SttBackend, api_key: SecretString, model: String, language: &str) -> Result<Self> {
        if api_key.expose_secret().is_empty() {
            let which = match backend {
                SttBackend::Whisper => "OpenAI API key required for Whisper",
                SttBackend::Deepgram => "Deepgram API key required",
            };
            return Err(Error::Config(which.to_string()));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            language: primary_language(language),
            backend,
        })
    }

    /// Which service this client calls
    #[must_use]
    pub const fn backend(&self) -> SttBackend {
        self.backend
    }

    /// Transcribe using OpenAI Whisper
    async fn transcribe_whisper(&self, audio: Vec<u8>) -> Result<Vec<(String, Option<f32>)>> {
        tracing::debug!(audio_bytes = audio.len(), "starting Whisper transcription");

        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(audio)
                    .file_name("audio.wav")
                    .mime_str("audio/wav")
                    .map_err(|e| Error::Stt(e.to_string()))?,
            )
            .text("model", self.model.clone())
            .text("language", self.language.clone());

        let response = self
            .client
            .post("https://api.openai.com/v1/audio/transcriptions")
            .bearer_auth(self.api_key.expose_secret())
            .multipart(form)
            .send()
            .await
            .inspect_err(|e| tracing::error!(error = %e, "Whisper request failed"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Whisper API error");
            return Err(Error::Stt(format!("Whisper API error {status}: {body}")));
        }

        let result: WhisperResponse = response.json().await?;
        let text = result.text.trim().to_string();

        tracing::debug!(transcript = %text, "transcription complete");
        Ok(if text.is_empty() { Vec::new() } else { vec![(text, None)] })
    }

    /// Transcribe using Deepgram
    async fn transcribe_deepgram(&self, audio: Vec<u8>) -> Result<Vec<(String, Option<f32>)>> {
        tracing::debug!(audio_bytes = audio.len(), "starting Deepgram transcription");

        let url = format!(
            "https://api.deepgram.com/v1/listen?model={}&language={}&punctuate=true&alternatives=3",
            self.model, self.language
        );

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Token {}", self.api_key.expose_secret()))
            .header("Content-Type", "audio/wav")
            .body(audio)
            .send()
            .await
            .inspect_err(|e| tracing::error!(error = %e, "Deepgram request failed"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "Deepgram API error");
            return Err(Error::Stt(format!("Deepgram API error {status}: {body}")));
        }

        let result: DeepgramResponse = response.json().await?;
        let alternatives: Vec<_> = result
            .results
            .channels
            .into_iter()
            .next()
            .map(|c| c.alternatives)
            .unwrap_or_default()
            .into_iter()
            .filter(|a| !a.transcript.trim().is_empty())
            .map(|a| (a.transcript.trim().to_string(), a.confidence))
            .collect();

        tracing::debug!(alternatives = alternatives.len(), "transcription complete");
        Ok(alternatives)
    }
}

#[async_trait]
impl SegmentTranscriber for SpeechToText {
    async fn transcribe(&self, samples: &[f32], sample_rate: u32) -> Result<Vec<(String, Option<f32>)>> {
        let audio = samples_to_wav(samples, sample_rate)?;
        match self.backend {
            SttBackend::Whisper => self.transcribe_whisper(audio).await,
            SttBackend::Deepgram => self.transcribe_deepgram(audio).await,
        }
    }
}

/// `ko-KR` -> `ko`
fn primary_language(tag: &str) -> String {
    tag.split(['-', '_'])
        .next()
        .unwrap_or(tag)
        .to_lowercase()
}
