//! WAV payload codec for the network audio path.
//!
//! The daemon only speaks one dialect on the wire: RIFF/WAVE with a PCM
//! `fmt ` chunk, mono, 16 bits per sample. Anything else is rejected before
//! it reaches the recognizer.

use thiserror::Error;

use super::device::FRAME_BYTES;

/// Size of the canonical header produced by [`build`]: RIFF descriptor,
/// 16-byte `fmt ` chunk and the `data` chunk header.
pub const WAV_HEADER_LEN: usize = 44;

#[derive(Debug, Error)]
pub enum WavError {
    #[error("buffer too short for a WAV header ({0} bytes)")]
    Truncated(usize),
    #[error("missing RIFF/WAVE signature")]
    BadSignature,
    #[error("no fmt chunk before data")]
    MissingFmt,
    #[error("no data chunk")]
    MissingData,
    #[error("compressed audio (format tag {0}) is not supported")]
    NonPcm(u16),
    #[error("unsupported layout: {channels} channel(s), {bits} bits/sample")]
    UnsupportedLayout { channels: u16, bits: u16 },
}

/// PCM audio extracted from a WAV buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WavAudio {
    pub pcm: Vec<u8>,
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl WavAudio {
    /// The only layout the pipeline accepts: mono, 16-bit.
    pub fn is_pipeline_format(&self) -> bool {
        self.channels == 1 && self.bits_per_sample == 16
    }
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

/// Parse a WAV buffer and extract its PCM payload.
///
/// Walks the chunk list rather than assuming a fixed 44-byte header, so
/// writers that insert `LIST`/`INFO` chunks still parse. Only uncompressed
/// PCM (`audio_format = 1`) is accepted.
pub fn parse(buf: &[u8]) -> Result<WavAudio, WavError> {
    if buf.len() < 12 {
        return Err(WavError::Truncated(buf.len()));
    }
    if &buf[0..4] != b"RIFF" || &buf[8..12] != b"WAVE" {
        return Err(WavError::BadSignature);
    }

    let mut pos = 12;
    let mut fmt: Option<(u16, u16, u32, u16)> = None; // format, channels, rate, bits
    let mut pcm: Option<Vec<u8>> = None;

    while pos + 8 <= buf.len() {
        let id = &buf[pos..pos + 4];
        let size = read_u32(buf, pos + 4) as usize;
        let body = pos + 8;
        if body + size > buf.len() {
            return Err(WavError::Truncated(buf.len()));
        }

        match id {
            b"fmt " => {
                if size < 16 {
                    return Err(WavError::Truncated(size));
                }
                let audio_format = read_u16(buf, body);
                if audio_format != 1 {
                    return Err(WavError::NonPcm(audio_format));
                }
                fmt = Some((audio_format, read_u16(buf, body + 2), read_u32(buf, body + 4), read_u16(buf, body + 14)));
            }
            b"data" => {
                if fmt.is_none() {
                    return Err(WavError::MissingFmt);
                }
                pcm = Some(buf[body..body + size].to_vec());
                break;
            }
            _ => {} // skip LIST, fact, etc.
        }

        // Chunks are word-aligned; odd sizes carry a pad byte.
        pos = body + size + (size & 1);
    }

    let (_, channels, sample_rate, bits_per_sample) = fmt.ok_or(WavError::MissingFmt)?;
    let pcm = pcm.ok_or(WavError::MissingData)?;

    Ok(WavAudio { pcm, sample_rate, channels, bits_per_sample })
}

/// Parse and additionally enforce the pipeline layout (mono 16-bit).
pub fn parse_pipeline(buf: &[u8]) -> Result<WavAudio, WavError> {
    let audio = parse(buf)?;
    if !audio.is_pipeline_format() {
        return Err(WavError::UnsupportedLayout { channels: audio.channels, bits: audio.bits_per_sample });
    }
    Ok(audio)
}

/// Build a canonical mono 16-bit WAV buffer around a PCM payload.
pub fn build(pcm: &[u8], sample_rate: u32) -> Vec<u8> {
    let data_len = pcm.len() as u32;
    let byte_rate = sample_rate * 2; // mono, 2 bytes per sample
    let mut out = Vec::with_capacity(WAV_HEADER_LEN + pcm.len());

    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVE");

    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes()); // PCM
    out.extend_from_slice(&1u16.to_le_bytes()); // mono
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&byte_rate.to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes()); // block align
    out.extend_from_slice(&16u16.to_le_bytes()); // bits per sample

    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    out.extend_from_slice(pcm);

    out
}

/// Clamp a reply WAV to `cap` bytes, cutting the PCM on a frame boundary.
///
/// A buffer already within the cap is returned untouched, byte for byte.
pub fn truncate_to_cap(wav: Vec<u8>, cap: usize) -> Vec<u8> {
    if wav.len() <= cap {
        return wav;
    }

    let audio = match parse(&wav) {
        Ok(a) => a,
        Err(_) => {
            // Not ours to reframe; hard-cut as a last resort.
            let mut wav = wav;
            wav.truncate(cap);
            return wav;
        }
    };

    let budget = cap.saturating_sub(WAV_HEADER_LEN);
    let keep = (budget / FRAME_BYTES) * FRAME_BYTES;
    build(&audio.pcm[..keep.min(audio.pcm.len())], audio.sample_rate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn hound_wav(samples: &[i16], rate: u32, channels: u16) -> Vec<u8> {
        let spec = hound::WavSpec { channels, sample_rate: rate, bits_per_sample: 16, sample_format: hound::SampleFormat::Int };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for s in samples {
                writer.write_sample(*s).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn parse_extracts_pcm_from_hound_output() {
        let wav = hound_wav(&[0, 100, -100, 32767], 16000, 1);
        let audio = parse_pipeline(&wav).unwrap();
        assert_eq!(audio.sample_rate, 16000);
        assert_eq!(audio.channels, 1);
        assert_eq!(audio.bits_per_sample, 16);
        assert_eq!(audio.pcm.len(), 8);
    }

    #[test]
    fn rewrap_is_byte_identical() {
        let pcm: Vec<u8> = (0..3200u32).map(|i| (i % 251) as u8).collect();
        let wav = build(&pcm, 16000);
        let audio = parse(&wav).unwrap();
        assert_eq!(build(&audio.pcm, audio.sample_rate), wav);
    }

    #[test]
    fn rejects_stereo_payload() {
        let wav = hound_wav(&[1, 2, 3, 4], 16000, 2);
        assert!(matches!(parse_pipeline(&wav), Err(WavError::UnsupportedLayout { channels: 2, .. })));
    }

    #[test]
    fn rejects_non_pcm_format_tag() {
        let mut wav = build(&[0u8; 32], 16000);
        wav[20] = 3; // IEEE float format tag
        assert!(matches!(parse(&wav), Err(WavError::NonPcm(3))));
    }

    #[test]
    fn rejects_bad_signature() {
        assert!(matches!(parse(b"RIFX....WAVE"), Err(WavError::BadSignature)));
    }

    #[test]
    fn cap_boundary_is_exact() {
        let pcm = vec![0u8; FRAME_BYTES * 4];
        let wav = build(&pcm, 16000);
        let cap = wav.len();

        // Exactly at the cap: unmodified.
        assert_eq!(truncate_to_cap(wav.clone(), cap), wav);

        // One byte over: PCM cut back to a frame boundary.
        let truncated = truncate_to_cap(wav.clone(), cap - 1);
        let audio = parse(&truncated).unwrap();
        assert_eq!(audio.pcm.len() % FRAME_BYTES, 0);
        assert_eq!(audio.pcm.len(), FRAME_BYTES * 3);
    }
}
