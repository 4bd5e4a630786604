//! Signal level measurement for talking detection.
//!
//! The ambient baseline is measured once at startup; afterwards every
//! captured buffer is compared against `ambient + talking_offset`.

use anyhow::Result;
use tracing::info;

use super::device::CaptureHandle;

/// Root-mean-square level of a 16-bit LE PCM buffer, normalized to [0, 1].
pub fn rms_level(pcm: &[u8]) -> f64 {
    if pcm.len() < 2 {
        return 0.0;
    }
    let mut sum = 0.0f64;
    let mut count = 0usize;
    for pair in pcm.chunks_exact(2) {
        let sample = i16::from_le_bytes([pair[0], pair[1]]) as f64 / 32768.0;
        sum += sample * sample;
        count += 1;
    }
    (sum / count as f64).sqrt()
}

/// Sample the room for `seconds` and return the ambient RMS baseline.
///
/// Runs once before the listening loop starts; the caller treats the result
/// as immutable for the rest of the process lifetime.
pub fn measure_ambient(capture: &mut CaptureHandle, seconds: f64) -> Result<f64> {
    info!("Measuring ambient noise for {:.1}s, please stay quiet...", seconds);
    let pcm = capture.read_seconds(seconds)?;
    let level = rms_level(&pcm);
    info!("Ambient RMS baseline: {:.4}", level);
    Ok(level)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm_of(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn silence_is_zero() {
        assert_eq!(rms_level(&pcm_of(&[0; 64])), 0.0);
    }

    #[test]
    fn full_scale_square_wave_is_near_one() {
        let samples: Vec<i16> = (0..64).map(|i| if i % 2 == 0 { i16::MAX } else { i16::MIN }).collect();
        let level = rms_level(&pcm_of(&samples));
        assert!(level > 0.99 && level <= 1.001, "got {level}");
    }

    #[test]
    fn louder_signal_measures_higher() {
        let quiet = pcm_of(&[500i16; 128]);
        let loud = pcm_of(&[8000i16; 128]);
        assert!(rms_level(&loud) > rms_level(&quiet));
    }

    #[test]
    fn empty_buffer_is_zero() {
        assert_eq!(rms_level(&[]), 0.0);
    }
}
