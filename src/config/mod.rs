//! Configuration management for the voice channel
//!
//! Values resolve environment first, then the TOML file, then defaults.

pub mod file;

use std::path::Path;
use std::time::Duration;

use secrecy::SecretString;

use self::file::VoiceChannelConfigFile;
use crate::breaker::{DEFAULT_COOLDOWN, DEFAULT_MAX_FAILURES};
use crate::coordinator::DEFAULT_RESTART_COOLDOWN;
use crate::provider::Backend;
use crate::transcript::{DEFAULT_DEDUP_WINDOW, DEFAULT_PROMOTION_CONFIDENCE};
use crate::voice::{
    DEFAULT_INTERIM_INTERVAL, DEFAULT_SILENCE_TIMEOUT, DEFAULT_TTS_MODEL, DEFAULT_TTS_VOICE, FRAME_SAMPLES,
    SAMPLE_RATE, SpeechOptions, SttBackend, VadSettings,
};
use crate::{Error, Result};

/// Default recognition and speech language
pub const DEFAULT_LANGUAGE: &str = "ko-KR";

/// Voice channel configuration
#[derive(Debug)]
pub struct Config {
    /// Recognition backend
    pub backend: Backend,

    /// BCP-47 language for recognition and speech
    pub language: String,

    /// Audio capture
    pub audio: AudioConfig,

    /// Remote streaming recognition
    pub remote: RemoteConfig,

    /// On-device recognizer
    pub local: LocalConfig,

    /// Start circuit breaker
    pub breaker: BreakerConfig,

    /// Transcript post-processing
    pub transcript: TranscriptConfig,

    /// Session timing
    pub session: SessionConfig,

    /// Speech output
    pub speech: SpeechConfig,

    /// API keys
    pub api_keys: ApiKeys,
}

/// Audio capture configuration
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Capture sample rate in Hz
    pub sample_rate: u32,
    /// Samples per frame
    pub frame_samples: usize,
    /// Input device name; default device when `None`
    pub input_device: Option<String>,
}

/// Remote streaming recognition configuration
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// WebSocket endpoint; the remote backend fails to start without one
    pub url: Option<String>,
    /// Wait for the server to close after a stop
    pub stop_grace: Duration,
}

/// On-device recognizer configuration
#[derive(Debug, Clone)]
pub struct LocalConfig {
    pub stt: SttBackend,
    pub stt_model: String,
    pub energy_threshold: f32,
    pub min_speech: Duration,
    pub trailing_silence: Duration,
    pub silence_timeout: Duration,
    /// `None` disables interim hypotheses
    pub interim_interval: Option<Duration>,
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub max_failures: u32,
    pub cooldown: Duration,
}

#[derive(Debug, Clone)]
pub struct TranscriptConfig {
    pub dedup_window: Duration,
    pub promotion_confidence: f32,
    /// Applied after the built-in corrections
    pub extra_corrections: Vec<(String, String)>,
    pub auto_stop_after_final: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub start_timeout: Duration,
    pub restart_cooldown: Duration,
}

/// Speech output configuration
#[derive(Debug, Clone)]
pub struct SpeechConfig {
    pub rate: f32,
    pub pitch: f32,
    pub volume: f32,
    /// TTS voice identifier
    pub voice: String,
    /// TTS model
    pub model: String,
}

/// API keys for external services
#[derive(Debug, Default)]
pub struct ApiKeys {
    pub openai: Option<SecretString>,
    pub deepgram: Option<SecretString>,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_sources(VoiceChannelConfigFile::default(), |_| None)
    }
}

impl Config {
    /// Load configuration from environment and config file
    ///
    /// `path` names an explicit TOML file; without it the standard path is
    /// read when present.
    ///
    /// # Errors
    ///
    /// Returns error if an explicit file can't be loaded or the result is
    /// invalid
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let fc = match path {
            Some(path) => file::load_config_file_from(path)?,
            None => file::load_config_file(),
        };

        let config = Self::from_sources(fc, |key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Resolve every value from `env`, then `fc`, then defaults
    #[must_use]
    pub fn from_sources(fc: VoiceChannelConfigFile, env: impl Fn(&str) -> Option<String>) -> Self {
        let backend = env("VOICECHAN_BACKEND")
            .or(fc.backend)
            .and_then(|b| {
                let parsed = Backend::parse(&b);
                if parsed.is_none() {
                    tracing::warn!(backend = %b, "unknown recognition backend, using local");
                }
                parsed
            })
            .unwrap_or_default();

        let language = env("VOICECHAN_LANGUAGE")
            .or(fc.language)
            .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string());

        let audio = AudioConfig {
            sample_rate: parsed(&env, "VOICECHAN_SAMPLE_RATE")
                .or(fc.audio.sample_rate)
                .unwrap_or(SAMPLE_RATE),
            frame_samples: parsed(&env, "VOICECHAN_FRAME_SAMPLES")
                .or(fc.audio.frame_samples)
                .unwrap_or(FRAME_SAMPLES),
            input_device: env("VOICECHAN_INPUT_DEVICE").or(fc.audio.input_device),
        };

        let remote = RemoteConfig {
            url: env("VOICECHAN_STT_WS_URL").or(fc.remote.url),
            stop_grace: millis(fc.remote.stop_grace_ms, crate::provider::DEFAULT_STOP_GRACE),
        };

        let vad = VadSettings::default();
        let local = LocalConfig {
            stt: env("VOICECHAN_STT")
                .or(fc.local.stt)
                .and_then(|s| SttBackend::parse(&s))
                .unwrap_or(SttBackend::Whisper),
            stt_model: env("VOICECHAN_STT_MODEL")
                .or(fc.local.stt_model)
                .unwrap_or_else(|| "whisper-1".to_string()),
            energy_threshold: fc.local.energy_threshold.unwrap_or(vad.energy_threshold),
            min_speech: millis(fc.local.min_speech_ms, vad.min_speech),
            trailing_silence: millis(fc.local.trailing_silence_ms, vad.trailing_silence),
            silence_timeout: millis(fc.local.silence_timeout_ms, DEFAULT_SILENCE_TIMEOUT),
            interim_interval: match fc.local.interim_interval_ms {
                Some(0) => None,
                Some(ms) => Some(Duration::from_millis(ms)),
                None => Some(DEFAULT_INTERIM_INTERVAL),
            },
        };

        let breaker = BreakerConfig {
            max_failures: fc.breaker.max_failures.unwrap_or(DEFAULT_MAX_FAILURES),
            cooldown: millis(fc.breaker.cooldown_ms, DEFAULT_COOLDOWN),
        };

        let transcript = TranscriptConfig {
            dedup_window: millis(fc.transcript.dedup_window_ms, DEFAULT_DEDUP_WINDOW),
            promotion_confidence: fc
                .transcript
                .promotion_confidence
                .unwrap_or(DEFAULT_PROMOTION_CONFIDENCE),
            extra_corrections: fc.transcript.corrections.unwrap_or_default(),
            auto_stop_after_final: env("VOICECHAN_AUTO_STOP")
                .map(|v| flag(&v))
                .or(fc.transcript.auto_stop_after_final)
                .unwrap_or(false),
        };

        let session = SessionConfig {
            start_timeout: millis(fc.session.start_timeout_ms, crate::provider::DEFAULT_START_TIMEOUT),
            restart_cooldown: millis(fc.session.restart_cooldown_ms, DEFAULT_RESTART_COOLDOWN),
        };

        let voice_defaults = SpeechOptions::default();
        let speech = SpeechConfig {
            rate: fc.speech.rate.unwrap_or(voice_defaults.rate),
            pitch: fc.speech.pitch.unwrap_or(voice_defaults.pitch),
            volume: fc.speech.volume.unwrap_or(voice_defaults.volume),
            voice: env("VOICECHAN_TTS_VOICE")
                .or(fc.speech.voice)
                .unwrap_or_else(|| DEFAULT_TTS_VOICE.to_string()),
            model: env("VOICECHAN_TTS_MODEL")
                .or(fc.speech.model)
                .unwrap_or_else(|| DEFAULT_TTS_MODEL.to_string()),
        };

        let api_keys = ApiKeys {
            openai: secret(env("OPENAI_API_KEY").or(fc.api_keys.openai)),
            deepgram: secret(env("DEEPGRAM_API_KEY").or(fc.api_keys.deepgram)),
        };

        Self {
            backend,
            language,
            audio,
            remote,
            local,
            breaker,
            transcript,
            session,
            speech,
            api_keys,
        }
    }

    /// Reject values the runtime cannot work with
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first invalid value
    pub fn validate(&self) -> Result<()> {
        if self.audio.sample_rate == 0 {
            return Err(Error::Config("audio.sample_rate must be positive".to_string()));
        }
        if self.audio.frame_samples == 0 {
            return Err(Error::Config("audio.frame_samples must be positive".to_string()));
        }
        if self.breaker.max_failures == 0 {
            return Err(Error::Config("breaker.max_failures must be positive".to_string()));
        }
        if !(0.0..=1.0).contains(&self.transcript.promotion_confidence) {
            return Err(Error::Config(
                "transcript.promotion_confidence must be within 0..=1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.speech.volume) {
            return Err(Error::Config("speech.volume must be within 0..=1".to_string()));
        }
        if self.speech.rate <= 0.0 {
            return Err(Error::Config("speech.rate must be positive".to_string()));
        }
        if self.language.trim().is_empty() {
            return Err(Error::Config("language must not be empty".to_string()));
        }
        Ok(())
    }

    /// Key for the configured segment transcription backend
    #[must_use]
    pub fn stt_key(&self) -> Option<SecretString> {
        match self.local.stt {
            SttBackend::Whisper => self.api_keys.openai.clone(),
            SttBackend::Deepgram => self.api_keys.deepgram.clone(),
        }
    }

    /// Voice parameters for speech output
    #[must_use]
    pub fn speech_options(&self) -> SpeechOptions {
        SpeechOptions {
            rate: self.speech.rate,
            pitch: self.speech.pitch,
            volume: self.speech.volume,
            lang: self.language.clone(),
        }
    }
}

fn parsed<T: std::str::FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = env(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable environment value");
            None
        }
    }
}

fn millis(value: Option<u64>, default: Duration) -> Duration {
    value.map_or(default, Duration::from_millis)
}

fn flag(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn secret(value: Option<String>) -> Option<SecretString> {
    value.filter(|v| !v.trim().is_empty()).map(SecretString::from)
}
