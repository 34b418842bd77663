//! Audio playback to speakers
//!
//! Playback blocks the calling thread until the audio has played or was
//! stopped; async callers run it under `spawn_blocking`. A shared
//! [`PlaybackControl`] pauses, resumes or stops it from any thread.

use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use cpal::SampleRate;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use super::resample::FrameResampler;
use crate::{Error, Result};

/// Poll interval while waiting for playback to drain
const POLL: Duration = Duration::from_millis(20);

/// Give up when the device stops consuming samples for this long
const STALL_TIMEOUT: Duration = Duration::from_secs(2);

/// Pause/stop flags shared with a running playback
#[derive(Debug, Default)]
pub struct PlaybackControl {
    stopped: AtomicBool,
    paused: AtomicBool,
}

impl PlaybackControl {
    /// Fresh control, neither paused nor stopped
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Stop playback for good
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    /// Output silence without advancing
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    /// Continue after [`pause`](Self::pause)
    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    /// Whether [`stop`](Self::stop) was called
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Whether playback is paused
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }
}

/// Decoded mono audio
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    /// Mono samples in `[-1, 1]`
    pub samples: Vec<f32>,
    /// Sample rate in Hz
    pub sample_rate: u32,
}

impl DecodedAudio {
    /// Scale every sample by `volume` (clamped to `0..=1`)
    pub fn apply_volume(&mut self, volume: f32) {
        let volume = if volume.is_nan() { 1.0 } else { volume.clamp(0.0, 1.0) };
        if (volume - 1.0).abs() < f32::EPSILON {
            return;
        }
        for sample in &mut self.samples {
            *sample *= volume;
        }
    }
}

/// Decode MP3 bytes to mono f32 samples
///
/// # Errors
///
/// Returns error if the data is not valid MP3
pub fn decode_mp3(mp3_data: &[u8]) -> Result<DecodedAudio> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(mp3_data));
    let mut samples = Vec::new();
    let mut sample_rate = 0u32;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                sample_rate = u32::try_from(frame.sample_rate).unwrap_or(sample_rate);
                if frame.channels == 2 {
                    samples.extend(frame.data.chunks(2).map(|chunk| {
                        let left = f32::from(chunk[0]) / 32768.0;
                        let right = f32::from(chunk.get(1).copied().unwrap_or(chunk[0])) / 32768.0;
                        f32::midpoint(left, right)
                    }));
                } else {
                    samples.extend(frame.data.iter().map(|&s| f32::from(s) / 32768.0));
                }
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::Audio(format!("MP3 decode error: {e}"))),
        }
    }

    if samples.is_empty() || sample_rate == 0 {
        return Err(Error::Audio("MP3 contained no audio".to_string()));
    }

    Ok(DecodedAudio {
        samples,
        sample_rate,
    })
}

/// Play `audio` on the default output device, blocking until done or stopped
///
/// # Errors
///
/// Returns error if no output device can be opened
pub fn play_blocking(audio: &DecodedAudio, control: &Arc<PlaybackControl>) -> Result<()> {
    if audio.samples.is_empty() || control.is_stopped() {
        return Ok(());
    }

    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

    let (config, samples) = output_config(&device, audio)?;
    let channels = usize::from(config.channels);
    let total = samples.len();

    let samples: Arc<[f32]> = samples.into();
    let position = Arc::new(AtomicUsize::new(0));

    let cb_samples = Arc::clone(&samples);
    let cb_position = Arc::clone(&position);
    let cb_control = Arc::clone(control);

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                if cb_control.is_paused() || cb_control.is_stopped() {
                    data.fill(0.0);
                    return;
                }

                let mut pos = cb_position.load(Ordering::Acquire);
                for frame in data.chunks_mut(channels) {
                    frame.fill(cb_samples.get(pos).copied().unwrap_or(0.0));
                    if pos < cb_samples.len() {
                        pos += 1;
                    }
                }
                cb_position.store(pos, Ordering::Release);
            },
            |err| {
                tracing::error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))?;

    stream.play().map_err(|e| Error::Audio(e.to_string()))?;

    let mut last = 0usize;
    let mut last_progress = Instant::now();
    loop {
        let pos = position.load(Ordering::Acquire);
        if pos >= total || control.is_stopped() {
            break;
        }

        if pos != last || control.is_paused() {
            last = pos;
            last_progress = Instant::now();
        } else if last_progress.elapsed() > STALL_TIMEOUT {
            tracing::warn!(pos, total, "playback stalled");
            break;
        }

        std::thread::sleep(POLL);
    }

    if !control.is_stopped() {
        // Let the device drain its last buffer
        std::thread::sleep(Duration::from_millis(100));
    }

    drop(stream);
    tracing::debug!(samples = total, stopped = control.is_stopped(), "playback complete");
    Ok(())
}

/// Pick an output config at the audio's rate, resampling when none exists
fn output_config(device: &cpal::Device, audio: &DecodedAudio) -> Result<(cpal::StreamConfig, Vec<f32>)> {
    let rate = SampleRate(audio.sample_rate);
    let matching = device
        .supported_output_configs()
        .map_err(|e| Error::Audio(e.to_string()))?
        .filter(|c| c.sample_format() == cpal::SampleFormat::F32)
        .filter(|c| c.channels() <= 2)
        .find(|c| c.min_sample_rate() <= rate && c.max_sample_rate() >= rate);

    if let Some(supported) = matching {
        return Ok((supported.with_sample_rate(rate).config(), audio.samples.clone()));
    }

    let default = device
        .default_output_config()
        .map_err(|e| Error::Audio(e.to_string()))?;
    let config: cpal::StreamConfig = default.into();

    tracing::debug!(from = audio.sample_rate, to = config.sample_rate.0, "resampling for output device");

    let mut resampler = FrameResampler::new(audio.sample_rate, config.sample_rate.0, 1024)?;
    let mut out = Vec::with_capacity(audio.samples.len());
    resampler.push(&audio.samples, |frame| out.extend_from_slice(frame));
    resampler.finish(|frame| out.extend_from_slice(frame));

    Ok((config, out))
}
