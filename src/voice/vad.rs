//! Energy-based speech segmentation
//!
//! Splits a framed audio stream into speech segments: a segment opens on the
//! first frame above the energy threshold and closes after enough trailing
//! silence. Bursts shorter than the minimum speech length are discarded as
//! noise.

use std::time::Duration;

use super::capture::rms;

/// Default RMS energy above which a frame counts as speech
pub const DEFAULT_ENERGY_THRESHOLD: f32 = 0.03;

/// Default minimum segment length
pub const DEFAULT_MIN_SPEECH: Duration = Duration::from_millis(300);

/// Default trailing silence closing a segment
pub const DEFAULT_TRAILING_SILENCE: Duration = Duration::from_millis(500);

/// Segmentation thresholds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadSettings {
    /// RMS energy threshold
    pub energy_threshold: f32,
    /// Minimum speech length of a segment
    pub min_speech: Duration,
    /// Silence that closes a segment
    pub trailing_silence: Duration,
}

impl Default for VadSettings {
    fn default() -> Self {
        Self {
            energy_threshold: DEFAULT_ENERGY_THRESHOLD,
            min_speech: DEFAULT_MIN_SPEECH,
            trailing_silence: DEFAULT_TRAILING_SILENCE,
        }
    }
}

/// Detector state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorState {
    /// Waiting for speech
    Idle,
    /// Inside a segment
    InSpeech,
}

/// Result of feeding one frame
#[derive(Debug, Clone, PartialEq)]
pub enum Activity {
    /// No segment open
    Silence,
    /// Segment open and growing
    Speech,
    /// Segment closed; carries its samples
    SegmentComplete(Vec<f32>),
}

/// Segments audio into utterances by energy
#[derive(Debug)]
pub struct SpeechDetector {
    threshold: f32,
    min_speech_samples: usize,
    silence_samples: usize,
    state: DetectorState,
    speech_buffer: Vec<f32>,
    silence_counter: usize,
}

impl SpeechDetector {
    /// Create a detector for audio at `sample_rate`
    #[must_use]
    pub fn new(settings: VadSettings, sample_rate: u32) -> Self {
        Self {
            threshold: settings.energy_threshold,
            min_speech_samples: samples_for(settings.min_speech, sample_rate),
            silence_samples: samples_for(settings.trailing_silence, sample_rate),
            state: DetectorState::Idle,
            speech_buffer: Vec::new(),
            silence_counter: 0,
        }
    }

    /// Feed one frame
    pub fn process(&mut self, samples: &[f32]) -> Activity {
        let energy = rms(samples);
        let is_speech = energy > self.threshold;

        match self.state {
            DetectorState::Idle => {
                if !is_speech {
                    return Activity::Silence;
                }
                self.state = DetectorState::InSpeech;
                self.speech_buffer.clear();
                self.speech_buffer.extend_from_slice(samples);
                self.silence_counter = 0;
                tracing::trace!(energy, "speech detected");
                Activity::Speech
            }
            DetectorState::InSpeech => {
                self.speech_buffer.extend_from_slice(samples);
                if is_speech {
                    self.silence_counter = 0;
                } else {
                    self.silence_counter += samples.len();
                }

                if self.silence_counter >= self.silence_samples {
                    let voiced = self.speech_buffer.len() - self.silence_counter;
                    if voiced >= self.min_speech_samples {
                        tracing::debug!(samples = self.speech_buffer.len(), "speech segment complete");
                        let segment = std::mem::take(&mut self.speech_buffer);
                        self.reset();
                        return Activity::SegmentComplete(segment);
                    }

                    tracing::trace!(voiced, "segment too short, discarding");
                    self.reset();
                    return Activity::Silence;
                }

                Activity::Speech
            }
        }
    }

    /// Samples of the open segment
    #[must_use]
    pub fn speech_buffer(&self) -> &[f32] {
        &self.speech_buffer
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> DetectorState {
        self.state
    }

    /// Drop any open segment
    pub fn reset(&mut self) {
        self.state = DetectorState::Idle;
        self.speech_buffer.clear();
        self.silence_counter = 0;
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn samples_for(duration: Duration, sample_rate: u32) -> usize {
    (duration.as_secs_f64() * f64::from(sample_rate)).round() as usize
}
