//! Text-to-speech: Kokoro synthesis plus the playback controller that owns
//! the speaker device.

mod controller;
mod synthesizer;

pub use controller::{PlaybackState, Speaker, SpeechOutput};
pub use synthesizer::{SYNTH_SAMPLE_RATE, Synthesizer, split_sentences};
