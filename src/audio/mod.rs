//! Audio subsystem: device abstraction, level measurement, resampling and
//! the WAV codec used on the network path.

mod device;
pub mod resampler;
mod rms;
pub mod wav;

pub use device::{CaptureHandle, FRAME_BYTES, FRAME_SAMPLES, PIPELINE_SAMPLE_RATE, PlaybackHandle};
pub use rms::{measure_ambient, rms_level};
