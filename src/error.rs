//! Error types for the voice channel

use std::time::Duration;

use thiserror::Error;

use crate::provider::ProviderError;

/// Result type alias for voice channel operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the voice channel
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio device error
    #[error("audio error: {0}")]
    Audio(String),

    /// Speech-to-text error
    #[error("STT error: {0}")]
    Stt(String),

    /// Text-to-speech error
    #[error("TTS error: {0}")]
    Tts(String),

    /// Recognition provider error, already classified at the provider boundary
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Circuit breaker refused the call without attempting it
    #[error("recognition temporarily disabled, retry in {}ms", retry_after.as_millis())]
    BreakerOpen {
        /// Time left until the breaker lets a probe through
        retry_after: Duration,
    },

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Message suitable for showing to the user
    ///
    /// Breaker refusals get a distinct "try again shortly" message so the UI
    /// does not present them as a generic failure.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Provider(e) => e.user_message().to_string(),
            Self::BreakerOpen { .. } => {
                "음성 인식을 잠시 사용할 수 없습니다. 잠시 후 다시 시도해주세요.".to_string()
            }
            Self::Audio(_) => "마이크가 감지되지 않았습니다.".to_string(),
            Self::Tts(_) => "음성 재생에 실패했습니다.".to_string(),
            _ => "오류가 발생했습니다. 잠시 후 다시 시도해주세요.".to_string(),
        }
    }

    /// Whether this is a breaker fail-fast refusal
    #[must_use]
    pub const fn is_breaker_open(&self) -> bool {
        matches!(self, Self::BreakerOpen { .. })
    }
}
