//! Speech recognizer façade over sherpa-rs Whisper.
//!
//! The listening loop only knows four operations: feed PCM, peek at the
//! partial transcript, finalize the utterance, reset. The Whisper backend
//! is an offline model, so the façade buffers fed samples and re-runs the
//! model only when new audio has arrived since the last read.

use anyhow::Result;
use sherpa_rs::whisper::{WhisperConfig, WhisperRecognizer};
use tracing::{debug, info};

use crate::audio::PIPELINE_SAMPLE_RATE;
use crate::config::SttSettings;

/// Cap on buffered audio (samples). Utterances longer than this keep only
/// the most recent window.
const MAX_BUFFERED_SAMPLES: usize = 30 * PIPELINE_SAMPLE_RATE as usize;

/// Streaming-recognizer interface consumed by the state machine.
pub trait Transcriber: Send {
    /// Consume a PCM buffer (16-bit LE mono 16 kHz).
    fn feed(&mut self, pcm: &[u8]);

    /// Best-guess transcript of the audio fed so far. `None` means no
    /// update this iteration.
    fn partial(&mut self) -> Option<String>;

    /// End the utterance: return the definitive transcript and clear state.
    fn finalize(&mut self) -> Option<String>;

    /// Drop any buffered audio (used when switching input sources).
    fn reset(&mut self);
}

/// Whisper-backed [`Transcriber`].
pub struct WhisperTranscriber {
    whisper: WhisperRecognizer,
    buffer: Vec<f32>,
    cached_partial: Option<String>,
    dirty: bool,
}

impl WhisperTranscriber {
    pub fn new(settings: &SttSettings) -> Result<Self> {
        let provider = settings.provider();
        info!("Initializing Whisper recognizer with {} provider", provider.as_sherpa_provider());

        let config = WhisperConfig {
            encoder: settings.encoder_path().to_string_lossy().to_string(),
            decoder: settings.decoder_path().to_string_lossy().to_string(),
            tokens: settings.tokens_path().to_string_lossy().to_string(),
            language: settings.language.clone(),
            provider: Some(provider.as_sherpa_provider().to_string()),
            num_threads: Some(settings.effective_threads().try_into().unwrap_or(2)),
            debug: false,
            ..Default::default()
        };

        let whisper = WhisperRecognizer::new(config).map_err(|e| anyhow::anyhow!("failed to initialize Whisper: {e}"))?;
        info!("Whisper recognizer ready");

        Ok(Self { whisper, buffer: Vec::new(), cached_partial: None, dirty: false })
    }

    fn transcribe_buffer(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let result = self.whisper.transcribe(PIPELINE_SAMPLE_RATE, &self.buffer);
        let text = result.text.trim().to_string();
        if text.is_empty() { None } else { Some(text) }
    }
}

impl Transcriber for WhisperTranscriber {
    fn feed(&mut self, pcm: &[u8]) {
        self.buffer.extend(pcm.chunks_exact(2).map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0));
        if self.buffer.len() > MAX_BUFFERED_SAMPLES {
            let excess = self.buffer.len() - MAX_BUFFERED_SAMPLES;
            self.buffer.drain(..excess);
        }
        self.dirty = true;
    }

    fn partial(&mut self) -> Option<String> {
        if self.dirty {
            self.cached_partial = self.transcribe_buffer();
            self.dirty = false;
        }
        self.cached_partial.clone()
    }

    fn finalize(&mut self) -> Option<String> {
        let text = self.transcribe_buffer();
        if let Some(ref t) = text {
            debug!("Finalized transcript: \"{}\"", t);
        }
        self.reset();
        text
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.cached_partial = None;
        self.dirty = false;
    }
}

