//! Sample-rate conversion into fixed-size frames

use rubato::{FftFixedIn, Resampler};

use crate::{Error, Result};

/// Input chunk fed to the FFT resampler
const CHUNK_IN: usize = 1024;

/// Converts a mono stream to the target rate and cuts it into equal frames
pub struct FrameResampler {
    resampler: Option<FftFixedIn<f32>>,
    in_buf: Vec<f32>,
    frame_samples: usize,
    pending: Vec<f32>,
}

impl std::fmt::Debug for FrameResampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameResampler")
            .field("resampling", &self.resampler.is_some())
            .field("frame_samples", &self.frame_samples)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl FrameResampler {
    /// Create a resampler from `in_hz` to `out_hz` emitting `frame_samples` per frame
    ///
    /// # Errors
    ///
    /// Returns error for a zero frame size or rate, or if the resampler
    /// cannot be built for the rate pair
    pub fn new(in_hz: u32, out_hz: u32, frame_samples: usize) -> Result<Self> {
        if frame_samples == 0 || in_hz == 0 || out_hz == 0 {
            return Err(Error::Audio(format!(
                "invalid framing: {in_hz}Hz -> {out_hz}Hz, {frame_samples} samples"
            )));
        }

        let resampler = if in_hz == out_hz {
            None
        } else {
            Some(
                FftFixedIn::<f32>::new(in_hz as usize, out_hz as usize, CHUNK_IN, 1, 1)
                    .map_err(|e| Error::Audio(format!("resampler: {e}")))?,
            )
        };

        Ok(Self {
            resampler,
            in_buf: Vec::with_capacity(CHUNK_IN),
            frame_samples,
            pending: Vec::with_capacity(frame_samples),
        })
    }

    /// Feed samples, calling `emit` once per completed frame
    pub fn push(&mut self, mut src: &[f32], mut emit: impl FnMut(&[f32])) {
        let Some(resampler) = self.resampler.as_mut() else {
            Self::emit_frames(&mut self.pending, self.frame_samples, src, &mut emit);
            return;
        };

        while !src.is_empty() {
            let take = (CHUNK_IN - self.in_buf.len()).min(src.len());
            self.in_buf.extend_from_slice(&src[..take]);
            src = &src[take..];

            if self.in_buf.len() == CHUNK_IN {
                match resampler.process(&[&self.in_buf[..]], None) {
                    Ok(out) => {
                        Self::emit_frames(&mut self.pending, self.frame_samples, &out[0], &mut emit);
                    }
                    Err(e) => tracing::warn!(error = %e, "resampler chunk dropped"),
                }
                self.in_buf.clear();
            }
        }
    }

    /// Flush buffered input, zero-padding the last frame
    pub fn finish(&mut self, mut emit: impl FnMut(&[f32])) {
        if let Some(resampler) = self.resampler.as_mut()
            && !self.in_buf.is_empty()
        {
            self.in_buf.resize(CHUNK_IN, 0.0);
            if let Ok(out) = resampler.process(&[&self.in_buf[..]], None) {
                Self::emit_frames(&mut self.pending, self.frame_samples, &out[0], &mut emit);
            }
            self.in_buf.clear();
        }

        if !self.pending.is_empty() {
            self.pending.resize(self.frame_samples, 0.0);
            emit(&self.pending);
            self.pending.clear();
        }
    }

    fn emit_frames(
        pending: &mut Vec<f32>,
        frame_samples: usize,
        mut data: &[f32],
        emit: &mut impl FnMut(&[f32]),
    ) {
        while !data.is_empty() {
            let take = (frame_samples - pending.len()).min(data.len());
            pending.extend_from_slice(&data[..take]);
            data = &data[take..];

            if pending.len() == frame_samples {
                emit(pending);
                pending.clear();
            }
        }
    }
}
