//! TOML configuration file loading
//!
//! Supports `~/.config/voice-channel/config.toml` as a persistent config
//! source. All fields are optional; the file is a partial overlay on top of
//! defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::{Error, Result};

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct VoiceChannelConfigFile {
    /// Recognition backend ("local" or "remote")
    #[serde(default)]
    pub backend: Option<String>,

    /// Recognition and speech language (BCP-47, e.g. "ko-KR")
    #[serde(default)]
    pub language: Option<String>,

    /// Audio capture
    #[serde(default)]
    pub audio: AudioFileConfig,

    /// Remote streaming recognition
    #[serde(default)]
    pub remote: RemoteFileConfig,

    /// On-device recognizer
    #[serde(default)]
    pub local: LocalFileConfig,

    /// Start circuit breaker
    #[serde(default)]
    pub breaker: BreakerFileConfig,

    /// Transcript post-processing
    #[serde(default)]
    pub transcript: TranscriptFileConfig,

    /// Session timing
    #[serde(default)]
    pub session: SessionFileConfig,

    /// Speech output
    #[serde(default)]
    pub speech: SpeechFileConfig,

    /// API keys for external services
    #[serde(default)]
    pub api_keys: ApiKeysFileConfig,
}

#[derive(Debug, Default, Deserialize)]
pub struct AudioFileConfig {
    /// Capture sample rate in Hz
    pub sample_rate: Option<u32>,
    /// Samples per streamed frame
    pub frame_samples: Option<usize>,
    /// Input device name; default device when unset
    pub input_device: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RemoteFileConfig {
    /// WebSocket endpoint (ws:// or wss://)
    pub url: Option<String>,
    pub stop_grace_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LocalFileConfig {
    /// Segment transcription backend ("whisper" or "deepgram")
    pub stt: Option<String>,
    /// Segment transcription model (e.g. "whisper-1")
    pub stt_model: Option<String>,
    pub energy_threshold: Option<f32>,
    pub min_speech_ms: Option<u64>,
    pub trailing_silence_ms: Option<u64>,
    pub silence_timeout_ms: Option<u64>,
    /// Interim hypothesis spacing; 0 disables interims
    pub interim_interval_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct BreakerFileConfig {
    pub max_failures: Option<u32>,
    pub cooldown_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TranscriptFileConfig {
    pub dedup_window_ms: Option<u64>,
    /// Confidence given to promoted interims that carry none
    pub promotion_confidence: Option<f32>,
    /// Extra misrecognition corrections, `[from, to]` pairs
    pub corrections: Option<Vec<(String, String)>>,
    /// Stop listening after every stable transcript
    pub auto_stop_after_final: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SessionFileConfig {
    /// Bound on provider start (connect or first recognizer signal)
    pub start_timeout_ms: Option<u64>,
    /// Starts this soon after a stop are ignored
    pub restart_cooldown_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SpeechFileConfig {
    pub rate: Option<f32>,
    pub pitch: Option<f32>,
    pub volume: Option<f32>,
    /// TTS voice identifier (e.g. "nova")
    pub voice: Option<String>,
    /// TTS model (e.g. "tts-1")
    pub model: Option<String>,
}

/// API keys configuration
#[derive(Debug, Default, Deserialize)]
pub struct ApiKeysFileConfig {
    pub openai: Option<String>,
    pub deepgram: Option<String>,
}

/// Load the TOML config file from the standard path
///
/// Returns `VoiceChannelConfigFile::default()` if the file doesn't exist or
/// can't be parsed.
pub fn load_config_file() -> VoiceChannelConfigFile {
    let Some(path) = config_file_path() else {
        return VoiceChannelConfigFile::default();
    };

    if !path.exists() {
        return VoiceChannelConfigFile::default();
    }

    match load_config_file_from(&path) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to load config file, using defaults"
            );
            VoiceChannelConfigFile::default()
        }
    }
}

/// Load an explicitly named config file
///
/// # Errors
///
/// Returns error if the file can't be read or parsed
pub fn load_config_file_from(path: &Path) -> Result<VoiceChannelConfigFile> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
    let config = toml::from_str(&content)?;
    tracing::info!(path = %path.display(), "loaded config file");
    Ok(config)
}

/// Return the config file path: `~/.config/voice-channel/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("voice-channel").join("config.toml"))
}
