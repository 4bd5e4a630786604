//! FFT-based sample-rate conversion via rubato.
//!
//! Two entry points: [`StreamResampler`] accumulates callback-sized chunks
//! for real-time capture, [`resample`] converts whole buffers (TTS output,
//! network audio).

use anyhow::{Context, Result, anyhow};
use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{Fft, FixedSync, Resampler};

/// FFT chunk size. 1024 frames balances quality against latency.
const CHUNK_SIZE: usize = 1024;

/// Sub-chunk count for the FFT processor.
const SUB_CHUNKS: usize = 2;

/// Incremental mono resampler for audio callbacks.
///
/// Input arrives in whatever sizes the driver hands out; samples accumulate
/// internally until a full FFT chunk is available.
pub struct StreamResampler {
    resampler: Fft<f32>,
    output_buffer: Vec<f32>,
    output_frames_max: usize,
    pending: Vec<f32>,
}

impl StreamResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Result<Self> {
        let resampler = Fft::<f32>::new(from_rate as usize, to_rate as usize, CHUNK_SIZE, SUB_CHUNKS, 1, FixedSync::Input)
            .context("failed to create stream resampler")?;
        let output_frames_max = resampler.output_frames_max();
        Ok(Self { resampler, output_buffer: vec![0.0; output_frames_max], output_frames_max, pending: Vec::with_capacity(CHUNK_SIZE * 2) })
    }

    /// Feed samples; returns converted output once a full chunk is ready.
    pub fn push(&mut self, samples: &[f32]) -> Option<Vec<f32>> {
        self.pending.extend_from_slice(samples);
        if self.pending.len() < CHUNK_SIZE {
            return None;
        }

        let chunk: Vec<f32> = self.pending.drain(..CHUNK_SIZE).collect();
        let input = InterleavedSlice::new(&chunk, 1, CHUNK_SIZE).ok()?;
        let mut output = InterleavedSlice::new_mut(&mut self.output_buffer, 1, self.output_frames_max).ok()?;
        let (_, written) = self.resampler.process_into_buffer(&input, &mut output, None).ok()?;

        (written > 0).then(|| self.output_buffer[..written].to_vec())
    }
}

/// Convert a whole mono buffer from `from_rate` to `to_rate`.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    if from_rate == to_rate {
        return Ok(samples.to_vec());
    }

    let mut resampler =
        Fft::<f32>::new(from_rate as usize, to_rate as usize, CHUNK_SIZE, SUB_CHUNKS, 1, FixedSync::Input).context("failed to create resampler")?;

    let output_frames_max = resampler.output_frames_max();
    let mut output_buffer = vec![0.0f32; output_frames_max];

    let expected = (samples.len() as f64 * to_rate as f64 / from_rate as f64) as usize;
    let mut output = Vec::with_capacity(expected + CHUNK_SIZE);

    let mut pos = 0;
    while pos < samples.len() {
        let end = (pos + CHUNK_SIZE).min(samples.len());
        let mut chunk = samples[pos..end].to_vec();
        chunk.resize(CHUNK_SIZE, 0.0); // zero-pad the tail chunk

        let input = InterleavedSlice::new(&chunk, 1, CHUNK_SIZE).map_err(|e| anyhow!("input adapter: {e:?}"))?;
        let mut out = InterleavedSlice::new_mut(&mut output_buffer, 1, output_frames_max).map_err(|e| anyhow!("output adapter: {e:?}"))?;

        let (_, written) = resampler.process_into_buffer(&input, &mut out, None).map_err(|e| anyhow!("resampling error: {e}"))?;
        output.extend_from_slice(&output_buffer[..written]);

        pos += CHUNK_SIZE;
    }

    // Drop the padding-induced tail.
    output.truncate(expected + 100);
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsampling_triples_length() {
        let samples = vec![0.0; 16000];
        let result = resample(&samples, 16000, 48000).unwrap();
        assert!(result.len() >= 48000 && result.len() <= 48100);
    }

    #[test]
    fn downsampling_thirds_length() {
        let samples = vec![0.0; 48000];
        let result = resample(&samples, 48000, 16000).unwrap();
        assert!((15900..=16100).contains(&result.len()), "got {}", result.len());
    }

    #[test]
    fn equal_rates_pass_through() {
        let samples = vec![0.25f32; 1234];
        assert_eq!(resample(&samples, 16000, 16000).unwrap(), samples);
    }

    #[test]
    fn stream_resampler_emits_after_a_full_chunk() {
        let mut state = StreamResampler::new(48000, 16000).unwrap();
        assert!(state.push(&vec![0.0; 512]).is_none());
        let out = state.push(&vec![0.0; 512]).expect("full chunk should produce output");
        assert!(!out.is_empty());
    }
}
