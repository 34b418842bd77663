//! Voice Channel - one microphone shared between speech output and recognition
//!
//! This library provides a hands-free voice channel:
//! - A session coordinator that never listens while speaking
//! - Interchangeable recognition providers (on-device and remote streaming)
//! - Transcript stabilization (corrections, ranking, deduplication)
//! - A circuit breaker guarding recognition starts
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │              Application / Intent matcher            │
//! └────────────────────┬────────────────────────────────┘
//!                      │ EventBus (mic mode, transcripts, errors)
//! ┌────────────────────▼────────────────────────────────┐
//! │                   Coordinator                        │
//! │   Breaker  │  Transcript pipeline  │  Speech output  │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                    Providers                         │
//! │   Local (VAD + STT)  │  Remote (WebSocket stream)    │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod breaker;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod intent;
pub mod provider;
pub mod transcript;
pub mod voice;

pub use config::Config;
pub use coordinator::{
    Coordinator, CoordinatorOptions, Diagnostics, SessionState, SpeakOutcome, StartOutcome, StopOutcome,
};
pub use error::{Error, Result};
pub use events::{EventBus, VoiceEvent};
pub use intent::{IntentMatcher, KeywordMatcher, spawn_intent_listener};
pub use provider::{Backend, Provider};
pub use transcript::StableTranscript;
