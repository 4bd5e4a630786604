//! Text-to-speech synthesis using Kokoro models.

use anyhow::Result;
use sherpa_rs::OnnxConfig;
use sherpa_rs::tts::{CommonTtsConfig, KokoroTts, KokoroTtsConfig};
use tracing::{debug, info};

use crate::audio::{PIPELINE_SAMPLE_RATE, resampler::resample, wav};
use crate::config::TtsSettings;

/// Kokoro emits 24 kHz audio regardless of configuration.
pub const SYNTH_SAMPLE_RATE: u32 = 24_000;

/// Kokoro TTS engine. Wrapped in a mutex by the owner; synthesis holds the
/// engine exclusively but never touches any audio device, so WAV replies
/// for network clients can be produced while local playback is busy.
pub struct Synthesizer {
    tts: KokoroTts,
    speaker_id: i32,
    speed: f32,
}

impl Synthesizer {
    pub fn new(settings: &TtsSettings) -> Result<Self> {
        let provider = settings.provider();
        info!("Initializing Kokoro TTS with {} provider, voice id {}", provider.as_sherpa_provider(), settings.speaker_id);

        let config = KokoroTtsConfig {
            model: settings.model_path().to_string_lossy().to_string(),
            voices: settings.voices_path().to_string_lossy().to_string(),
            tokens: settings.tokens_path().to_string_lossy().to_string(),
            data_dir: settings.data_dir().to_string_lossy().to_string(),
            dict_dir: settings.dict_dir().to_string_lossy().to_string(),
            lexicon: settings.lexicon(),
            lang: String::new(),
            length_scale: 1.0 / settings.speed,
            onnx_config: OnnxConfig {
                provider: provider.as_sherpa_provider().to_string(),
                num_threads: settings.effective_threads().try_into().unwrap_or(2),
                debug: false,
            },
            common_config: CommonTtsConfig { max_num_sentences: 1, ..Default::default() },
        };

        let tts = KokoroTts::new(config);

        Ok(Self { tts, speaker_id: settings.speaker_id, speed: settings.speed })
    }

    /// Synthesize one sentence to mono f32 samples at [`SYNTH_SAMPLE_RATE`].
    pub fn synthesize(&mut self, sentence: &str) -> Result<Vec<f32>> {
        if sentence.trim().is_empty() {
            return Ok(Vec::new());
        }
        debug!("Synthesizing: \"{}\"", sentence);
        let audio = self.tts.create(sentence, self.speaker_id, self.speed).map_err(|e| anyhow::anyhow!("TTS generation failed: {e}"))?;
        Ok(audio.samples)
    }

    /// Synthesize a whole reply into a pipeline-format WAV (mono 16-bit
    /// 16 kHz). Used for network replies; does not involve the playback
    /// device.
    pub fn synthesize_to_wav(&mut self, text: &str) -> Result<Vec<u8>> {
        let mut samples = Vec::new();
        for sentence in split_sentences(text) {
            samples.extend(self.synthesize(&sentence)?);
        }

        let downsampled = resample(&samples, SYNTH_SAMPLE_RATE, PIPELINE_SAMPLE_RATE)?;
        let pcm: Vec<u8> = downsampled.iter().flat_map(|&s| (((s.clamp(-1.0, 1.0)) * 32767.0) as i16).to_le_bytes()).collect();
        Ok(wav::build(&pcm, PIPELINE_SAMPLE_RATE))
    }
}

/// Split text into sentences for streaming synthesis.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();

    for c in text.chars() {
        current.push(c);
        if c == '.' || c == '!' || c == '?' || c == '\n' {
            let trimmed = current.trim().to_string();
            if !trimmed.is_empty() {
                sentences.push(trimmed);
            }
            current.clear();
        }
    }

    let trimmed = current.trim().to_string();
    if !trimmed.is_empty() {
        sentences.push(trimmed);
    }

    sentences
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_terminators() {
        let sentences = split_sentences("One. Two! Three? Four");
        assert_eq!(sentences, vec!["One.", "Two!", "Three?", "Four"]);
    }

    #[test]
    fn empty_text_yields_nothing() {
        assert!(split_sentences("   ").is_empty());
    }

    #[test]
    fn newlines_break_sentences() {
        assert_eq!(split_sentences("a\nb"), vec!["a", "b"]);
    }
}
