//! Spoken-output controller.
//!
//! A single worker thread owns the playback device and drains a queue of
//! utterances, synthesizing sentence by sentence and writing the audio in
//! ~100 ms slices. Between slices it consults the shared control word, so a
//! `Pause` takes effect within one slice and a `Discard` abandons the
//! current buffer just as fast. `Discard` is one-shot: the queue empties at
//! discard time and the worker resets the word to `Idle`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc;
use std::sync::{Condvar, Mutex as StdMutex};
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::{debug, error, info};

use super::synthesizer::{SYNTH_SAMPLE_RATE, Synthesizer, split_sentences};
use crate::audio::PlaybackHandle;

/// Samples per playback slice (~100 ms at the synthesis rate).
const SLICE_SAMPLES: usize = SYNTH_SAMPLE_RATE as usize / 10;

/// Control states observed by the playback worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Play,
    Pause,
    Discard,
}

struct ControlInner {
    state: PlaybackState,
    queue: VecDeque<String>,
    switch_to: Option<String>,
    shutdown: bool,
}

/// What the worker should do with the slice it is about to play.
#[derive(Debug, PartialEq, Eq)]
enum Gate {
    Proceed,
    Abandon,
    Quit,
}

/// Worker wake-up reasons.
#[derive(Debug, PartialEq, Eq)]
enum WorkerEvent {
    Utterance(String),
    Switch(String),
    Quit,
}

/// Shared control word + utterance queue, guarded by a mutex and signalled
/// through a condition variable.
pub struct PlaybackControl {
    inner: StdMutex<ControlInner>,
    cond: Condvar,
}

impl PlaybackControl {
    pub fn new() -> Self {
        Self {
            inner: StdMutex::new(ControlInner { state: PlaybackState::Idle, queue: VecDeque::new(), switch_to: None, shutdown: false }),
            cond: Condvar::new(),
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.inner.lock().unwrap().state
    }

    pub fn is_paused(&self) -> bool {
        self.state() == PlaybackState::Pause
    }

    /// Enqueue an utterance. Wakes the worker; an idle controller starts
    /// playing, a paused one stays paused with the utterance queued.
    pub fn enqueue(&self, text: String) {
        let mut inner = self.inner.lock().unwrap();
        inner.queue.push_back(text);
        if inner.state == PlaybackState::Idle {
            inner.state = PlaybackState::Play;
        }
        self.cond.notify_all();
    }

    /// Hold playback so the microphone hears only the user.
    pub fn pause(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == PlaybackState::Play {
            inner.state = PlaybackState::Pause;
            self.cond.notify_all();
        }
    }

    /// Resume a paused stream.
    pub fn resume(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == PlaybackState::Pause {
            inner.state = PlaybackState::Play;
            self.cond.notify_all();
        }
    }

    /// Drop everything queued and abandon the in-progress utterance.
    /// No-op when already idle with nothing queued. The queue is cleared
    /// here, not in the worker, so an utterance enqueued right after a
    /// discard (a greeting, a farewell) survives it.
    pub fn discard(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == PlaybackState::Idle && inner.queue.is_empty() {
            return;
        }
        inner.queue.clear();
        inner.state = PlaybackState::Discard;
        self.cond.notify_all();
    }

    /// Ask the worker to reopen playback on another device between
    /// utterances.
    pub fn request_device_switch(&self, device_id: String) {
        let mut inner = self.inner.lock().unwrap();
        inner.switch_to = Some(device_id);
        self.cond.notify_all();
    }

    fn shutdown(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.shutdown = true;
        self.cond.notify_all();
    }

    /// Worker side: block until there is something to do.
    fn next_event(&self) -> WorkerEvent {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.shutdown {
                return WorkerEvent::Quit;
            }
            if let Some(device_id) = inner.switch_to.take() {
                return WorkerEvent::Switch(device_id);
            }
            match inner.state {
                PlaybackState::Discard => {
                    // One-shot: the queue was cleared at discard time.
                    inner.state = PlaybackState::Idle;
                }
                PlaybackState::Pause => {}
                PlaybackState::Play | PlaybackState::Idle => {
                    if let Some(text) = inner.queue.pop_front() {
                        inner.state = PlaybackState::Play;
                        return WorkerEvent::Utterance(text);
                    }
                    inner.state = PlaybackState::Idle;
                }
            }
            inner = self.cond.wait(inner).unwrap();
        }
    }

    /// Worker side: gate before each slice. Blocks while paused.
    fn gate(&self) -> Gate {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.shutdown {
                return Gate::Quit;
            }
            match inner.state {
                PlaybackState::Discard => {
                    inner.state = PlaybackState::Idle;
                    return Gate::Abandon;
                }
                PlaybackState::Pause => {
                    inner = self.cond.wait(inner).unwrap();
                }
                PlaybackState::Play => return Gate::Proceed,
                // Reached when a discard raced the slice loop; abandon so
                // the worker goes back to waiting for the next event.
                PlaybackState::Idle => return Gate::Abandon,
            }
        }
    }
}

impl Default for PlaybackControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Software volume shared with the `volume` device handler.
#[derive(Clone)]
pub struct VolumeControl(Arc<AtomicU32>);

impl VolumeControl {
    fn new(initial: f32) -> Self {
        Self(Arc::new(AtomicU32::new(initial.to_bits())))
    }

    pub fn set(&self, volume: f32) {
        self.0.store(volume.clamp(0.0, 1.0).to_bits(), Ordering::SeqCst);
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::SeqCst))
    }
}

/// Anything that can take an utterance. Lets callbacks and the dispatcher
/// speak without depending on a live audio device.
pub trait Speaker: Send + Sync {
    fn speak(&self, text: &str);
}

/// Public handle to the spoken-output subsystem.
pub struct SpeechOutput {
    control: Arc<PlaybackControl>,
    synthesizer: Arc<Mutex<Synthesizer>>,
    volume: VolumeControl,
    worker: Option<JoinHandle<()>>,
}

impl SpeechOutput {
    /// Spawn the playback worker. The cpal stream is opened inside the
    /// worker thread (stream handles stay on their owning thread); open
    /// failures surface here through the startup channel.
    pub fn start(synthesizer: Arc<Mutex<Synthesizer>>, playback_device: Option<String>) -> Result<Self> {
        let control = Arc::new(PlaybackControl::new());
        let volume = VolumeControl::new(1.0);

        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<()>>(1);
        let worker_control = control.clone();
        let worker_synth = synthesizer.clone();
        let worker_volume = volume.clone();

        let worker = std::thread::Builder::new()
            .name("tts-playback".into())
            .spawn(move || {
                let playback = match PlaybackHandle::open(playback_device.as_deref()) {
                    Ok(p) => {
                        let _ = ready_tx.send(Ok(()));
                        p
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                playback_worker(&worker_control, &worker_synth, playback, &worker_volume);
            })
            .context("failed to spawn playback worker")?;

        ready_rx.recv().context("playback worker exited before reporting readiness")??;
        info!("Speech output ready");

        Ok(Self { control, synthesizer, volume, worker: Some(worker) })
    }

    /// Non-blocking enqueue of an utterance.
    pub fn speak(&self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        debug!("Queueing speech: \"{}\"", text);
        self.control.enqueue(text.to_string());
    }

    pub fn pause(&self) {
        self.control.pause();
    }

    pub fn resume(&self) {
        self.control.resume();
    }

    pub fn discard(&self) {
        self.control.discard();
    }

    pub fn is_paused(&self) -> bool {
        self.control.is_paused()
    }

    pub fn set_volume(&self, volume: f32) {
        self.volume.set(volume);
    }

    /// Reopen playback on another configured device. Takes effect between
    /// utterances.
    pub fn switch_device(&self, device_id: &str) {
        self.control.request_device_switch(device_id.to_string());
    }

    pub fn volume(&self) -> f32 {
        self.volume.get()
    }

    /// Render a reply as a pipeline WAV without touching the playback
    /// device.
    pub fn synthesize_to_wav(&self, text: &str) -> Result<Vec<u8>> {
        self.synthesizer.lock().synthesize_to_wav(text)
    }

    /// Block until the queue drains or `timeout` passes. Used on shutdown
    /// so the farewell is heard.
    pub fn drain(&self, timeout: std::time::Duration) {
        let deadline = std::time::Instant::now() + timeout;
        while std::time::Instant::now() < deadline {
            let inner = self.control.inner.lock().unwrap();
            if inner.queue.is_empty() && inner.state != PlaybackState::Play {
                return;
            }
            drop(inner);
            std::thread::sleep(std::time::Duration::from_millis(50));
        }
    }
}

impl Speaker for SpeechOutput {
    fn speak(&self, text: &str) {
        SpeechOutput::speak(self, text);
    }
}

impl Drop for SpeechOutput {
    fn drop(&mut self) {
        self.control.shutdown();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn playback_worker(control: &PlaybackControl, synthesizer: &Mutex<Synthesizer>, mut playback: PlaybackHandle, volume: &VolumeControl) {
    loop {
        let text = match control.next_event() {
            WorkerEvent::Utterance(text) => text,
            WorkerEvent::Switch(device_id) => {
                match PlaybackHandle::open(Some(&device_id)) {
                    Ok(handle) => {
                        info!("Playback switched to device {}", device_id);
                        playback = handle;
                    }
                    Err(e) => error!("Playback device switch to {} failed: {}", device_id, e),
                }
                continue;
            }
            WorkerEvent::Quit => break,
        };

        playback.set_volume(volume.get());

        'utterance: for sentence in split_sentences(&text) {
            // A discard between sentences also cancels pending synthesis.
            match control.gate() {
                Gate::Proceed => {}
                Gate::Abandon => {
                    playback.clear();
                    break 'utterance;
                }
                Gate::Quit => return,
            }

            let samples = match synthesizer.lock().synthesize(&sentence) {
                Ok(s) => s,
                Err(e) => {
                    error!("TTS error for \"{}\": {}", sentence, e);
                    continue;
                }
            };

            for slice in samples.chunks(SLICE_SAMPLES) {
                match control.gate() {
                    Gate::Proceed => {}
                    Gate::Abandon => {
                        playback.clear();
                        break 'utterance;
                    }
                    Gate::Quit => return,
                }
                playback.play(slice, SYNTH_SAMPLE_RATE);
            }
        }
    }
    debug!("Playback worker exiting");
}

#[cfg(test)]
mod worker_tests {
    use super::*;

    #[test]
    fn switch_request_wakes_the_worker_first() {
        let control = PlaybackControl::new();
        control.enqueue("pending".into());
        control.request_device_switch("hw:1,0".into());
        assert_eq!(control.next_event(), WorkerEvent::Switch("hw:1,0".into()));
        assert_eq!(control.next_event(), WorkerEvent::Utterance("pending".into()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_moves_idle_to_play() {
        let control = PlaybackControl::new();
        assert_eq!(control.state(), PlaybackState::Idle);
        control.enqueue("hello".into());
        assert_eq!(control.state(), PlaybackState::Play);
    }

    #[test]
    fn pause_only_affects_active_playback() {
        let control = PlaybackControl::new();
        control.pause();
        assert_eq!(control.state(), PlaybackState::Idle);

        control.enqueue("hello".into());
        control.pause();
        assert_eq!(control.state(), PlaybackState::Pause);

        control.resume();
        assert_eq!(control.state(), PlaybackState::Play);
    }

    #[test]
    fn discard_while_idle_is_a_no_op() {
        let control = PlaybackControl::new();
        control.discard();
        assert_eq!(control.state(), PlaybackState::Idle);
        control.discard();
        assert_eq!(control.state(), PlaybackState::Idle);
    }

    #[test]
    fn discard_is_one_shot() {
        let control = PlaybackControl::new();
        control.enqueue("a".into());
        control.enqueue("b".into());
        control.discard();
        assert_eq!(control.state(), PlaybackState::Discard);

        // Worker observes the discard: queue is emptied, word resets. With
        // nothing left to play the worker would block, so verify the reset
        // through the gate path instead.
        assert_eq!(control.gate(), Gate::Abandon);
        assert_eq!(control.state(), PlaybackState::Idle);
        assert!(control.inner.lock().unwrap().queue.is_empty());
    }

    #[test]
    fn utterance_enqueued_after_a_discard_survives_it() {
        let control = PlaybackControl::new();
        control.enqueue("long reply".into());
        control.discard();
        control.enqueue("Goodbye sir.".into());

        assert_eq!(control.next_event(), WorkerEvent::Utterance("Goodbye sir.".into()));
    }

    #[test]
    fn speak_while_paused_stays_queued() {
        let control = PlaybackControl::new();
        control.enqueue("first".into());
        control.pause();
        control.enqueue("second".into());
        assert_eq!(control.state(), PlaybackState::Pause);
        assert_eq!(control.inner.lock().unwrap().queue.len(), 2);
    }
}
