//! Audio device abstraction over cpal.
//!
//! The rest of the daemon only sees one audio dialect: 16 kHz, 16-bit
//! signed LE, mono, in fixed-size frames. Capture converts whatever the
//! device delivers (f32, any rate, mono or stereo) into that dialect and
//! exposes a blocking frame-pull API; playback accepts mono f32 at any rate
//! and resamples to the device rate. Lock-free ring buffers sit between the
//! real-time callbacks and the calling threads.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex as StdMutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig, SupportedStreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use ringbuf::HeapRb;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use tracing::{debug, info, warn};

use super::resampler::{StreamResampler, resample};

/// Sample rate of every PCM buffer that crosses a module boundary.
pub const PIPELINE_SAMPLE_RATE: u32 = 16_000;

/// Samples per frame (100 ms at 16 kHz).
pub const FRAME_SAMPLES: usize = 1600;

/// Bytes per frame (16-bit mono).
pub const FRAME_BYTES: usize = FRAME_SAMPLES * 2;

/// Capture ring size in samples (~4 s of headroom at 16 kHz).
const CAPTURE_RING_SIZE: usize = 65536;

/// Playback ring size in samples (~10 s at 48 kHz device rate).
const PLAYBACK_RING_SIZE: usize = 524288;

fn device_label(device: &Device) -> String {
    device.description().ok().map(|d| d.name().to_string()).unwrap_or_else(|| "Unknown".to_string())
}

/// Pick a supported stream config: F32 samples, mono or stereo, at or near
/// the target rate.
fn pick_config(configs: impl Iterator<Item = SupportedStreamConfigRange>, target_rate: u32) -> Result<SupportedStreamConfig> {
    let candidates: Vec<_> = configs.filter(|c| c.channels() <= 2 && c.sample_format() == SampleFormat::F32).collect();
    if candidates.is_empty() {
        bail!("no F32 stream configuration offered by the device");
    }

    for config in &candidates {
        if target_rate >= config.min_sample_rate() && target_rate <= config.max_sample_rate() {
            return Ok((*config).with_sample_rate(target_rate));
        }
    }

    let config = &candidates[0];
    let rate = target_rate.clamp(config.min_sample_rate(), config.max_sample_rate());
    Ok((*config).with_sample_rate(rate))
}

/// Mix interleaved f32 frames down to mono by channel averaging.
fn mixdown(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        data.to_vec()
    } else {
        data.chunks(channels).map(|frame| frame.iter().sum::<f32>() / channels as f32).collect()
    }
}

fn sample_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * 32767.0) as i16
}

/// Resolve a device by the id string from the device table, or fall back to
/// the system default. Matching is by substring so ALSA-style ids and full
/// descriptions both work.
fn find_device(devices: impl Iterator<Item = Device>, wanted: &str) -> Option<Device> {
    devices.into_iter().find(|d| device_label(d).contains(wanted))
}

// ---------------------------------------------------------------------------
// Capture
// ---------------------------------------------------------------------------

/// Microphone handle with a blocking frame-pull API.
///
/// Owned by the state-machine thread; never shared. The cpal callback pushes
/// converted samples into the ring; [`CaptureHandle::read_frame`] pops them.
pub struct CaptureHandle {
    _stream: Stream,
    consumer: ringbuf::HeapCons<i16>,
    running: Arc<AtomicBool>,
    device_id: Option<String>,
}

impl CaptureHandle {
    /// Open a capture stream on the named device (or the default one).
    pub fn open(device_id: Option<&str>) -> Result<Self> {
        let host = cpal::default_host();
        let device = match device_id {
            Some(id) => find_device(host.input_devices().context("failed to enumerate input devices")?, id)
                .with_context(|| format!("capture device '{id}' not found"))?,
            None => host.default_input_device().context("no input device available")?,
        };

        info!("Using capture device: {}", device_label(&device));

        let supported = device.supported_input_configs().context("failed to get supported input configs")?;
        let config = pick_config(supported, PIPELINE_SAMPLE_RATE)?;
        let device_rate = config.sample_rate();
        let channels = config.channels() as usize;
        let stream_config: StreamConfig = config.config();

        debug!("Capture config: {} Hz, {} channel(s), {:?}", device_rate, channels, config.sample_format());

        let mut resampler = if device_rate != PIPELINE_SAMPLE_RATE {
            info!("Capture device runs at {} Hz, resampling to {} Hz", device_rate, PIPELINE_SAMPLE_RATE);
            Some(StreamResampler::new(device_rate, PIPELINE_SAMPLE_RATE)?)
        } else {
            None
        };

        let ring = HeapRb::<i16>::new(CAPTURE_RING_SIZE);
        let (mut producer, consumer) = ring.split();

        let running = Arc::new(AtomicBool::new(true));
        let running_cb = running.clone();

        let err_fn = |err| {
            tracing::error!("Capture stream error: {}", err);
        };

        let stream = device.build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if !running_cb.load(Ordering::Relaxed) {
                    return;
                }
                let mono = mixdown(data, channels);
                let samples = match &mut resampler {
                    Some(state) => state.push(&mono),
                    None => Some(mono),
                };
                if let Some(samples) = samples {
                    let converted: Vec<i16> = samples.iter().map(|&s| sample_to_i16(s)).collect();
                    let written = producer.push_slice(&converted);
                    if written < converted.len() {
                        static DROPS: AtomicU64 = AtomicU64::new(0);
                        let n = DROPS.fetch_add(1, Ordering::Relaxed);
                        if n % 100 == 0 {
                            tracing::warn!("Capture ring full, dropped {} chunks so far", n + 1);
                        }
                    }
                }
            },
            err_fn,
            None,
        )?;

        stream.play().context("failed to start capture stream")?;

        Ok(Self { _stream: stream, consumer, running, device_id: device_id.map(str::to_owned) })
    }

    /// Close and reopen the same device. Used once per read error before the
    /// error propagates.
    pub fn reopen(&mut self) -> Result<()> {
        warn!("Reopening capture device");
        *self = Self::open(self.device_id.as_deref())?;
        Ok(())
    }

    /// Read exactly one frame ([`FRAME_BYTES`] bytes) into `out`.
    ///
    /// Blocks while samples accumulate; partial frames are never returned.
    /// Errors if the device stops delivering for more than two frame
    /// durations.
    pub fn read_frame(&mut self, out: &mut [u8]) -> Result<()> {
        if out.len() != FRAME_BYTES {
            bail!("read_frame needs a {FRAME_BYTES}-byte buffer, got {}", out.len());
        }

        let frame = Duration::from_secs_f64(FRAME_SAMPLES as f64 / PIPELINE_SAMPLE_RATE as f64);
        let deadline = Instant::now() + frame * 2 + Duration::from_millis(50);

        let mut samples = [0i16; FRAME_SAMPLES];
        let mut filled = 0usize;

        while filled < FRAME_SAMPLES {
            let got = self.consumer.pop_slice(&mut samples[filled..]);
            filled += got;
            if filled < FRAME_SAMPLES {
                if Instant::now() > deadline {
                    bail!("capture stalled: {filled}/{FRAME_SAMPLES} samples after {:?}", frame * 2);
                }
                std::thread::sleep(Duration::from_millis(2));
            }
        }

        for (chunk, sample) in out.chunks_exact_mut(2).zip(samples.iter()) {
            chunk.copy_from_slice(&sample.to_le_bytes());
        }
        Ok(())
    }

    /// Read `seconds` worth of whole frames as one PCM buffer.
    pub fn read_seconds(&mut self, seconds: f64) -> Result<Vec<u8>> {
        let frames = ((seconds * PIPELINE_SAMPLE_RATE as f64) as usize).div_ceil(FRAME_SAMPLES).max(1);
        let mut pcm = vec![0u8; frames * FRAME_BYTES];
        for frame in pcm.chunks_exact_mut(FRAME_BYTES) {
            self.read_frame(frame)?;
        }
        Ok(pcm)
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Playback
// ---------------------------------------------------------------------------

/// Speaker handle. All writes funnel through the internal ring; the output
/// callback is the single consumer, so callers on any thread serialize
/// naturally through the producer mutex.
pub struct PlaybackHandle {
    _stream: Stream,
    device_rate: u32,
    producer: Mutex<ringbuf::HeapProd<f32>>,
    interrupt: Arc<AtomicBool>,
    playing: Arc<AtomicBool>,
    volume_bits: Arc<AtomicU32>,
    drained_mutex: Arc<StdMutex<()>>,
    drained: Arc<Condvar>,
}

impl PlaybackHandle {
    /// Open a playback stream on the named device (or the default one).
    pub fn open(device_id: Option<&str>) -> Result<Self> {
        let host = cpal::default_host();
        let device = match device_id {
            Some(id) => find_device(host.output_devices().context("failed to enumerate output devices")?, id)
                .with_context(|| format!("playback device '{id}' not found"))?,
            None => host.default_output_device().context("no output device available")?,
        };

        info!("Using playback device: {}", device_label(&device));

        let device_rate = match device.default_output_config() {
            Ok(config) => config.sample_rate(),
            Err(_) => {
                let supported = device.supported_output_configs().context("failed to get supported output configs")?;
                pick_config(supported, 48_000)?.sample_rate()
            }
        };

        let supported = device.supported_output_configs().context("failed to get supported output configs")?;
        let config = pick_config(supported, device_rate)?;
        let channels = config.channels() as usize;
        let stream_config: StreamConfig = config.config();

        debug!("Playback config: {} Hz, {} channel(s), {:?}", device_rate, channels, config.sample_format());

        let ring = HeapRb::<f32>::new(PLAYBACK_RING_SIZE);
        let (producer, mut consumer) = ring.split();

        let interrupt = Arc::new(AtomicBool::new(false));
        let playing = Arc::new(AtomicBool::new(false));
        let drained_mutex = Arc::new(StdMutex::new(()));
        let drained = Arc::new(Condvar::new());

        let interrupt_cb = interrupt.clone();
        let playing_cb = playing.clone();
        let drained_mutex_cb = drained_mutex.clone();
        let drained_cb = drained.clone();

        let err_fn = |err| {
            tracing::error!("Playback stream error: {}", err);
        };

        let stream = device.build_output_stream(
            &stream_config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let interrupted = interrupt_cb.load(Ordering::Relaxed);
                for frame in data.chunks_mut(channels) {
                    let sample = if interrupted { 0.0 } else { consumer.try_pop().unwrap_or(0.0) };
                    for channel in frame.iter_mut() {
                        *channel = sample;
                    }
                }
                if consumer.is_empty() || interrupted {
                    playing_cb.store(false, Ordering::SeqCst);
                    let _guard = drained_mutex_cb.lock().unwrap();
                    drained_cb.notify_all();
                }
            },
            err_fn,
            None,
        )?;

        stream.play().context("failed to start playback stream")?;

        Ok(Self {
            _stream: stream,
            device_rate,
            producer: Mutex::new(producer),
            interrupt,
            playing,
            volume_bits: Arc::new(AtomicU32::new(1.0f32.to_bits())),
            drained_mutex,
            drained,
        })
    }

    /// Software gain applied to everything queued after the call, 0.0..=1.0.
    pub fn set_volume(&self, volume: f32) {
        self.volume_bits.store(volume.clamp(0.0, 1.0).to_bits(), Ordering::SeqCst);
    }

    pub fn volume(&self) -> f32 {
        f32::from_bits(self.volume_bits.load(Ordering::SeqCst))
    }

    /// Queue mono samples at `rate` and block until drained or interrupted.
    ///
    /// Returns `false` when the wait ended early (interrupt or timeout).
    pub fn play(&self, samples: &[f32], rate: u32) -> bool {
        if samples.is_empty() {
            return true;
        }

        self.interrupt.store(false, Ordering::SeqCst);

        let resampled;
        let to_play: &[f32] = if rate != self.device_rate {
            match resample(samples, rate, self.device_rate) {
                Ok(r) => {
                    resampled = r;
                    &resampled
                }
                Err(e) => {
                    tracing::error!("Playback resampling failed: {}", e);
                    samples
                }
            }
        } else {
            samples
        };

        let gain = self.volume();
        let scaled: Vec<f32> = to_play.iter().map(|&s| s * gain).collect();

        {
            let mut producer = self.producer.lock();
            let written = producer.push_slice(&scaled);
            if written < scaled.len() {
                warn!("Playback ring overflow, dropped {} samples", scaled.len() - written);
            }
        }
        self.playing.store(true, Ordering::SeqCst);

        let duration = Duration::from_secs_f64(scaled.len() as f64 / self.device_rate as f64);
        let deadline = Instant::now() + duration + Duration::from_secs(1);

        while self.playing.load(Ordering::Relaxed) {
            if self.interrupt.load(Ordering::Relaxed) {
                debug!("Playback interrupted");
                return false;
            }
            if Instant::now() > deadline {
                warn!("Playback drain timeout exceeded");
                self.clear();
                return false;
            }
            let guard = self.drained_mutex.lock().unwrap();
            let _ = self.drained.wait_timeout(guard, Duration::from_millis(50)).unwrap();
        }

        true
    }

    /// Queue one pipeline-format frame (16-bit LE mono 16 kHz) without
    /// waiting for it to drain.
    #[allow(dead_code)]
    pub fn write_frame(&self, pcm: &[u8]) -> Result<()> {
        if pcm.len() % 2 != 0 {
            bail!("odd-length PCM buffer");
        }
        let samples: Vec<f32> = pcm.chunks_exact(2).map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0).collect();

        let resampled = if self.device_rate != PIPELINE_SAMPLE_RATE { resample(&samples, PIPELINE_SAMPLE_RATE, self.device_rate)? } else { samples };

        let gain = self.volume();
        let scaled: Vec<f32> = resampled.iter().map(|&s| s * gain).collect();

        let mut producer = self.producer.lock();
        let written = producer.push_slice(&scaled);
        if written < scaled.len() {
            bail!("playback ring full ({} of {} samples queued)", written, scaled.len());
        }
        self.playing.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Stop the current output and let the ring drain to silence.
    pub fn clear(&self) {
        let _producer = self.producer.lock();
        self.interrupt.store(true, Ordering::SeqCst);
        self.playing.store(false, Ordering::SeqCst);
        drop(_producer);

        std::thread::sleep(Duration::from_millis(20));
        self.interrupt.store(false, Ordering::SeqCst);
    }

    #[allow(dead_code)]
    pub fn interrupt(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
    }
}

impl Drop for PlaybackHandle {
    fn drop(&mut self) {
        self.interrupt.store(true, Ordering::SeqCst);
        self.playing.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mixdown_averages_stereo() {
        let data = [0.5f32, 1.0, -0.5, -1.0];
        let mono = mixdown(&data, 2);
        assert_eq!(mono, vec![0.75, -0.75]);
    }

    #[test]
    fn mixdown_passes_mono_through() {
        let data = [0.1f32, 0.2, 0.3];
        assert_eq!(mixdown(&data, 1), data.to_vec());
    }

    #[test]
    fn sample_conversion_clamps() {
        assert_eq!(sample_to_i16(2.0), i16::MAX);
        assert_eq!(sample_to_i16(-2.0), -32767);
        assert_eq!(sample_to_i16(0.0), 0);
    }

    #[test]
    fn frame_constants_are_consistent() {
        assert_eq!(FRAME_BYTES, FRAME_SAMPLES * 2);
        assert_eq!(FRAME_SAMPLES as u32 * 10, PIPELINE_SAMPLE_RATE);
    }
}
