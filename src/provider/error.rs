//! Provider error classification
//!
//! Errors are classified at the provider boundary so only critical failures
//! ever reach the circuit breaker or the public error event.

use std::fmt;

use crate::breaker::Classify;

/// What went wrong
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// `start` called while a session handle is live
    AlreadyActive,
    /// Backend could not be constructed (e.g. missing configuration)
    StartFailed,
    /// Microphone permission denied
    PermissionDenied,
    /// No capture device or the device went away
    DeviceUnavailable,
    /// Network failure talking to the recognition service
    Network,
    /// Connection establishment or start acknowledgment timed out
    Timeout,
    /// The remote service reported an error
    Remote,
    /// Silence timeout without speech
    NoSpeech,
    /// Session aborted (explicit stop or platform auto-stop)
    Aborted,
    /// Unrecognized code
    Other,
}

/// How an error is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Normal end of a session, never surfaced as a failure
    Benign,
    /// Counted by the breaker and surfaced to the caller
    Critical,
    /// Caller misuse (`already-active`), neither counted nor retried
    Refusal,
    /// Construction failure, triggers fallback to the other backend
    Fallback,
    /// Unknown code, logged only
    Unclassified,
}

/// Classified provider error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    kind: ErrorKind,
    code: String,
    message: String,
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}

impl std::error::Error for ProviderError {}

impl ProviderError {
    /// Create an error with an explicit kind and code
    #[must_use]
    pub fn new(kind: ErrorKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
        }
    }

    /// Classify a recognizer error code
    #[must_use]
    pub fn from_code(code: &str, message: Option<String>) -> Self {
        let kind = match code {
            "not-allowed" | "service-not-allowed" => ErrorKind::PermissionDenied,
            "audio-capture" => ErrorKind::DeviceUnavailable,
            "network" | "ws_error" => ErrorKind::Network,
            "timeout" => ErrorKind::Timeout,
            "remote" => ErrorKind::Remote,
            "no-speech" => ErrorKind::NoSpeech,
            "aborted" => ErrorKind::Aborted,
            "already-active" => ErrorKind::AlreadyActive,
            "start_failed" => ErrorKind::StartFailed,
            _ => ErrorKind::Other,
        };

        Self::new(kind, code, message.unwrap_or_default())
    }

    /// `start` called while active
    #[must_use]
    pub fn already_active() -> Self {
        Self::new(
            ErrorKind::AlreadyActive,
            "already-active",
            "a recognition session is already running",
        )
    }

    /// Backend could not be constructed
    #[must_use]
    pub fn start_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::StartFailed, "start_failed", message)
    }

    /// Start or connect timed out
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, "timeout", message)
    }

    /// Capture device unavailable
    #[must_use]
    pub fn device_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DeviceUnavailable, "audio-capture", message)
    }

    /// Transport failure
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, "ws_error", message)
    }

    /// Error reported by the remote service
    #[must_use]
    pub fn remote(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Remote, "remote", message)
    }

    /// Error kind
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Machine-readable code
    #[must_use]
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Detail message
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// How this error is handled
    #[must_use]
    pub const fn severity(&self) -> Severity {
        match self.kind {
            ErrorKind::PermissionDenied
            | ErrorKind::DeviceUnavailable
            | ErrorKind::Network
            | ErrorKind::Timeout
            | ErrorKind::Remote => Severity::Critical,
            ErrorKind::NoSpeech | ErrorKind::Aborted => Severity::Benign,
            ErrorKind::AlreadyActive => Severity::Refusal,
            ErrorKind::StartFailed => Severity::Fallback,
            ErrorKind::Other => Severity::Unclassified,
        }
    }

    /// Message suitable for showing to the user
    #[must_use]
    pub const fn user_message(&self) -> &'static str {
        match self.kind {
            ErrorKind::PermissionDenied => "마이크 권한이 거부되었습니다.",
            ErrorKind::NoSpeech => "음성이 감지되지 않았습니다.",
            ErrorKind::DeviceUnavailable => "마이크가 감지되지 않았습니다.",
            ErrorKind::Network | ErrorKind::Remote => "네트워크 오류가 발생했습니다.",
            ErrorKind::Timeout => "요청 시간이 초과되었습니다. 다시 시도해주세요.",
            ErrorKind::Aborted => "음성 인식이 중단되었습니다.",
            ErrorKind::AlreadyActive => "이미 음성 인식이 진행 중입니다.",
            ErrorKind::StartFailed => "음성 인식을 시작할 수 없습니다.",
            ErrorKind::Other => "음성 인식 오류가 발생했습니다.",
        }
    }
}

impl Classify for ProviderError {
    fn is_critical(&self) -> bool {
        self.severity() == Severity::Critical
    }
}
