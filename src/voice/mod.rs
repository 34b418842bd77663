//! Voice processing module
//!
//! Audio capture and framing, the on-device recognizer, STT/TTS clients and
//! speech output.

mod capture;
mod playback;
mod recognizer;
mod resample;
mod speech;
mod stt;
mod tts;
mod vad;

pub use capture::{
    AudioSource, AudioStream, CaptureFormat, FRAME_SAMPLES, MicrophoneSource, SAMPLE_RATE, pcm16le, rms,
    samples_to_wav,
};
pub use playback::{DecodedAudio, PlaybackControl, decode_mp3, play_blocking};
pub use recognizer::{DEFAULT_INTERIM_INTERVAL, DEFAULT_SILENCE_TIMEOUT, RecognizerSettings, VadRecognizer};
pub use resample::FrameResampler;
pub use speech::{MutedSpeech, SpeechOptions, SpeechOutput, SynthesizedSpeech, UTTERANCE_GAP, speakable};
pub use stt::{SegmentTranscriber, SpeechToText, SttBackend};
pub use tts::{DEFAULT_TTS_MODEL, DEFAULT_TTS_VOICE, TextToSpeech};
pub use vad::{Activity, DetectorState, SpeechDetector, VadSettings};
