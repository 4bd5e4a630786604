//! Speech-to-text façade over sherpa-rs.

mod recognizer;

pub use recognizer::{Transcriber, WhisperTranscriber};
