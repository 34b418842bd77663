//! Audio capture from microphone
//!
//! Capture runs on a dedicated thread because cpal streams are not `Send`.
//! The thread opens the input device at its native configuration, downmixes
//! to mono, resamples to the requested rate and forwards fixed-size frames
//! over a channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample, Stream};
use tokio::sync::mpsc;

use super::resample::FrameResampler;
use crate::{Error, Result};

/// Sample rate for audio capture (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// Default samples per emitted frame
pub const FRAME_SAMPLES: usize = 4096;

/// Frames buffered between the capture thread and its consumer
const FRAME_QUEUE: usize = 64;

/// How long `open` waits for the device to come up
const OPEN_TIMEOUT: Duration = Duration::from_secs(3);

/// Poll interval of the capture thread
const POLL: Duration = Duration::from_millis(50);

/// Requested output format of a capture stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureFormat {
    /// Output sample rate in Hz
    pub sample_rate: u32,
    /// Samples per frame
    pub frame_samples: usize,
}

impl Default for CaptureFormat {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            frame_samples: FRAME_SAMPLES,
        }
    }
}

/// Source of framed mono audio
pub trait AudioSource: Send + Sync {
    /// Open a stream; frames flow until the stream is stopped or dropped
    ///
    /// # Errors
    ///
    /// Returns [`Error::Audio`] when no device is available or it cannot be
    /// opened
    fn open(&self, format: CaptureFormat) -> Result<AudioStream>;
}

/// Running capture stream
///
/// Dropping the stream stops capture.
#[derive(Debug)]
pub struct AudioStream {
    frames: mpsc::Receiver<Vec<f32>>,
    running: Arc<AtomicBool>,
}

impl AudioStream {
    /// Wrap a frame receiver and the flag its producer polls
    #[must_use]
    pub const fn new(frames: mpsc::Receiver<Vec<f32>>, running: Arc<AtomicBool>) -> Self {
        Self { frames, running }
    }

    /// Stream fed by the returned sender
    #[must_use]
    pub fn channel(capacity: usize) -> (mpsc::Sender<Vec<f32>>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self::new(rx, Arc::new(AtomicBool::new(true))))
    }

    /// Next frame; `None` once capture has ended
    pub async fn next_frame(&mut self) -> Option<Vec<f32>> {
        self.frames.recv().await
    }

    /// Stop capture; buffered frames can still be drained
    pub fn stop(&mut self) {
        if self.running.swap(false, Ordering::AcqRel) {
            tracing::debug!("audio capture stop requested");
        }
        self.frames.close();
    }

    /// Whether capture has not been stopped
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for AudioStream {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Default (or named) system input device
#[derive(Debug, Clone, Default)]
pub struct MicrophoneSource {
    device_name: Option<String>,
}

impl MicrophoneSource {
    /// Use the input device whose name matches, falling back to the default
    #[must_use]
    pub const fn with_device(device_name: Option<String>) -> Self {
        Self { device_name }
    }
}

impl AudioSource for MicrophoneSource {
    fn open(&self, format: CaptureFormat) -> Result<AudioStream> {
        let (frames_tx, frames_rx) = mpsc::channel(FRAME_QUEUE);
        let (ready_tx, ready_rx) = std_mpsc::sync_channel(1);
        let running = Arc::new(AtomicBool::new(true));

        let thread_running = Arc::clone(&running);
        let device_name = self.device_name.clone();
        std::thread::Builder::new()
            .name("voice-capture".to_string())
            .spawn(move || {
                capture_thread(device_name.as_deref(), format, &frames_tx, &thread_running, &ready_tx);
            })?;

        match ready_rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(Ok(())) => Ok(AudioStream::new(frames_rx, running)),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                running.store(false, Ordering::Release);
                Err(Error::Audio("capture device did not open in time".to_string()))
            }
        }
    }
}

fn capture_thread(
    device_name: Option<&str>,
    format: CaptureFormat,
    frames: &mpsc::Sender<Vec<f32>>,
    running: &AtomicBool,
    ready: &std_mpsc::SyncSender<Result<()>>,
) {
    let device_lost = Arc::new(AtomicBool::new(false));
    let (chunk_tx, chunk_rx) = std_mpsc::channel::<Vec<f32>>();

    let opened = open_input(device_name, chunk_tx, Arc::clone(&device_lost)).and_then(
        |(stream, native_rate)| {
            let resampler = FrameResampler::new(native_rate, format.sample_rate, format.frame_samples)?;
            stream.play().map_err(|e| Error::Audio(e.to_string()))?;
            Ok((stream, resampler))
        },
    );

    let (stream, mut resampler) = match opened {
        Ok(opened) => opened,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let _ = ready.send(Ok(()));
    tracing::debug!(sample_rate = format.sample_rate, frame = format.frame_samples, "audio capture started");

    let mut dropped = 0usize;
    while running.load(Ordering::Acquire) && !frames.is_closed() {
        if device_lost.load(Ordering::Acquire) {
            tracing::warn!("input device lost");
            break;
        }

        match chunk_rx.recv_timeout(POLL) {
            Ok(chunk) => resampler.push(&chunk, |frame| {
                if frames.try_send(frame.to_vec()).is_err() {
                    dropped += 1;
                }
            }),
            Err(std_mpsc::RecvTimeoutError::Timeout) => {}
            Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    drop(stream);
    if dropped > 0 {
        tracing::warn!(dropped, "capture frames dropped, consumer too slow");
    }
    tracing::debug!("audio capture stopped");
}

fn open_input(
    device_name: Option<&str>,
    chunks: std_mpsc::Sender<Vec<f32>>,
    device_lost: Arc<AtomicBool>,
) -> Result<(Stream, u32)> {
    let host = cpal::default_host();

    let named = device_name.and_then(|wanted| {
        host.input_devices()
            .ok()?
            .find(|d| d.name().is_ok_and(|n| n == wanted))
    });
    let device = match named {
        Some(device) => device,
        None => host
            .default_input_device()
            .ok_or_else(|| Error::Audio("no input device available".to_string()))?,
    };

    let supported = device
        .default_input_config()
        .map_err(|e| Error::Audio(e.to_string()))?;
    let sample_format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();
    let channels = usize::from(config.channels);

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        native_rate = config.sample_rate.0,
        channels,
        format = ?sample_format,
        "audio capture initialized"
    );

    let stream = match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(&device, &config, channels, chunks, device_lost),
        cpal::SampleFormat::I16 => build_stream::<i16>(&device, &config, channels, chunks, device_lost),
        cpal::SampleFormat::U16 => build_stream::<u16>(&device, &config, channels, chunks, device_lost),
        cpal::SampleFormat::I32 => build_stream::<i32>(&device, &config, channels, chunks, device_lost),
        other => return Err(Error::Audio(format!("unsupported sample format {other:?}"))),
    }
    .map_err(|e| Error::Audio(e.to_string()))?;

    Ok((stream, config.sample_rate.0))
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    channels: usize,
    chunks: std_mpsc::Sender<Vec<f32>>,
    device_lost: Arc<AtomicBool>,
) -> std::result::Result<Stream, cpal::BuildStreamError>
where
    T: Sample + SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            let _ = chunks.send(downmix(data, channels));
        },
        move |err| {
            tracing::error!(error = %err, "audio capture error");
            if matches!(err, cpal::StreamError::DeviceNotAvailable) {
                device_lost.store(true, Ordering::Release);
            }
        },
        None,
    )
}

/// Average interleaved channels into mono f32
#[allow(clippy::cast_precision_loss)]
fn downmix<T>(data: &[T], channels: usize) -> Vec<f32>
where
    T: Sample,
    f32: FromSample<T>,
{
    if channels <= 1 {
        return data.iter().map(|s| s.to_sample::<f32>()).collect();
    }

    data.chunks(channels)
        .map(|frame| frame.iter().map(|s| s.to_sample::<f32>()).sum::<f32>() / channels as f32)
        .collect()
}

/// Convert f32 samples to 16-bit little-endian PCM
///
/// Samples are clamped to `[-1, 1]`; negative values scale by `0x8000` and
/// positive values by `0x7FFF`.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn pcm16le(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let s = sample.clamp(-1.0, 1.0);
        let scaled = if s < 0.0 { s * 32768.0 } else { s * 32767.0 };
        out.extend_from_slice(&(scaled as i16).to_le_bytes());
    }
    out
}

/// RMS energy of a frame
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Convert f32 samples to WAV bytes for STT APIs
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for chunk in pcm16le(samples).chunks_exact(2) {
            writer
                .write_sample(i16::from_le_bytes([chunk[0], chunk[1]]))
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}
