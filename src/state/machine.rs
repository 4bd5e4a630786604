//! The listening state machine.
//!
//! Runs on its own control thread and owns the capture device and the
//! recognizer. Each loop iteration handles at most one state body; the
//! vision and network checks at the top of the iteration can preempt the
//! current state, and `NetworkProcessing` restores whatever it
//! interrupted.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::audio::{CaptureHandle, measure_ambient, rms_level, wav};
use crate::bus::MqttBus;
use crate::config::{ListenSettings, NetworkSettings};
use crate::dispatch::{CaptureSwitch, CommandDispatcher, VisionSlot};
use crate::llm::ConversationHistory;
use crate::net::RendezvousSlot;
use crate::stt::Transcriber;
use crate::tts::SpeechOutput;

use super::phrases::{PhraseTables, WakeOutcome, classify};

/// Topic for best-effort state announcements.
const HUD_TOPIC: &str = "hud";

/// Canned prompt for vision turns.
const VISION_PROMPT: &str = "What am I looking at?";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenState {
    Silence,
    WakeWordListen,
    CommandRecording,
    ProcessCommand,
    VisionReady,
    NetworkProcessing,
}

impl ListenState {
    fn name(&self) -> &'static str {
        match self {
            ListenState::Silence => "silence",
            ListenState::WakeWordListen => "wake_word_listen",
            ListenState::CommandRecording => "command_recording",
            ListenState::ProcessCommand => "process_command",
            ListenState::VisionReady => "vision_ready",
            ListenState::NetworkProcessing => "network_processing",
        }
    }
}

/// Quiet-iteration counter driving utterance finalization.
///
/// An iteration counts as quiet when the frame level is below the talking
/// threshold or the partial transcript stopped growing; speech that keeps
/// making progress resets the counter.
pub struct SilenceTracker {
    count: u32,
    last_partial_len: usize,
    limit: u32,
}

impl SilenceTracker {
    pub fn new(limit: u32) -> Self {
        Self { count: 0, last_partial_len: 0, limit }
    }

    /// Start a new utterance with the partial length observed so far.
    pub fn prime(&mut self, partial_len: usize) {
        self.count = 0;
        self.last_partial_len = partial_len;
    }

    /// Record one iteration; true when the utterance should finalize.
    pub fn update(&mut self, quiet_frame: bool, partial_len: usize) -> bool {
        if quiet_frame || partial_len == self.last_partial_len {
            self.count += 1;
        } else {
            self.count = 0;
        }
        self.last_partial_len = partial_len;
        self.count >= self.limit
    }
}

/// Everything the control thread needs that is constructed in `main`.
/// The capture handle and recognizer are built inside the thread because
/// their underlying handles stay on the thread that created them.
pub struct ControlDeps {
    pub listen: ListenSettings,
    pub network: NetworkSettings,
    pub phrases: PhraseTables,
    pub speech: Arc<SpeechOutput>,
    pub dispatcher: CommandDispatcher,
    pub bus: Option<Arc<MqttBus>>,
    pub slot: Option<Arc<RendezvousSlot>>,
    pub vision: Arc<VisionSlot>,
    pub capture_switch: Arc<CaptureSwitch>,
    pub history: Arc<Mutex<ConversationHistory>>,
    pub quit: Arc<AtomicBool>,
    pub ai_name: String,
    pub greeting_reply: String,
    pub farewell_reply: String,
    pub busy_reply: String,
}

pub struct Orchestrator {
    deps: ControlDeps,
    capture: CaptureHandle,
    transcriber: Box<dyn Transcriber>,
    ambient_rms: f64,
    state: ListenState,
    queued_next: ListenState,
    saved_state: Option<ListenState>,
    pending_command: Option<String>,
    silence: SilenceTracker,
    last_published: Option<&'static str>,
    farewell_spoken: bool,
}

impl Orchestrator {
    /// Open the capture device, measure the room, and get ready to listen.
    pub fn new(deps: ControlDeps, capture_device: Option<&str>, transcriber: Box<dyn Transcriber>) -> Result<Self> {
        let mut capture = CaptureHandle::open(capture_device).context("failed to open capture device")?;
        let ambient_rms = measure_ambient(&mut capture, deps.listen.ambient_seconds)?;
        let silence = SilenceTracker::new(deps.listen.command_timeout);

        Ok(Self {
            deps,
            capture,
            transcriber,
            ambient_rms,
            state: ListenState::Silence,
            queued_next: ListenState::WakeWordListen,
            saved_state: None,
            pending_command: None,
            silence,
            last_published: None,
            farewell_spoken: false,
        })
    }

    fn talking_threshold(&self) -> f64 {
        self.ambient_rms + self.deps.listen.talking_offset
    }

    /// Read one capture buffer, reopening the device once on failure.
    fn read_buffer(&mut self) -> Result<Vec<u8>> {
        let seconds = self.deps.listen.capture_seconds;
        match self.capture.read_seconds(seconds) {
            Ok(pcm) => Ok(pcm),
            Err(e) => {
                warn!("Capture read failed ({}), reopening once", e);
                self.capture.reopen()?;
                self.capture.read_seconds(seconds)
            }
        }
    }

    /// Best-effort, deduplicated state announcement on the hud topic.
    fn publish_state(&mut self) {
        let name = self.state.name();
        if self.last_published == Some(name) {
            return;
        }
        self.last_published = Some(name);
        if let Some(bus) = &self.deps.bus {
            let payload = serde_json::json!({"device": "ai", "name": self.deps.ai_name, "state": name}).to_string();
            bus.publish(HUD_TOPIC, payload.as_bytes());
        }
    }

    fn speak_farewell(&mut self) {
        if !self.farewell_spoken {
            self.deps.speech.speak(&self.deps.farewell_reply);
            self.farewell_spoken = true;
        }
    }

    /// Run until the quit flag is set. Persists the conversation on the
    /// way out.
    pub fn run(mut self) -> Result<()> {
        info!("Listening (ambient {:.4}, threshold {:.4})", self.ambient_rms, self.talking_threshold());

        while !self.deps.quit.load(Ordering::SeqCst) {
            if let Some(device_id) = self.deps.capture_switch.take() {
                info!("Switching capture to {}", device_id);
                self.capture = CaptureHandle::open(Some(&device_id))?;
            }

            if self.deps.vision.ready() && self.state != ListenState::NetworkProcessing {
                self.state = ListenState::VisionReady;
            }

            if let Some(slot) = self.deps.slot.clone()
                && slot.pending()
            {
                if matches!(self.state, ListenState::ProcessCommand | ListenState::VisionReady) {
                    // Can't take the request now; answer busy without
                    // disturbing the work in progress.
                    let busy = self.deps.speech.synthesize_to_wav(&self.deps.busy_reply).unwrap_or_else(|_| wav::build(&[], 16_000));
                    slot.reject_with(busy);
                } else {
                    self.saved_state = Some(self.state);
                    self.state = ListenState::NetworkProcessing;
                }
            }

            self.publish_state();

            match self.state {
                ListenState::Silence => self.run_silence()?,
                ListenState::WakeWordListen => self.run_listening(true)?,
                ListenState::CommandRecording => self.run_listening(false)?,
                ListenState::ProcessCommand => self.run_process_command(),
                ListenState::VisionReady => self.run_vision(),
                ListenState::NetworkProcessing => self.run_network(),
            }
        }

        self.speak_farewell();
        self.deps.speech.drain(Duration::from_secs(5));

        let cwd = std::env::current_dir().unwrap_or_else(|_| ".".into());
        if let Err(e) = self.deps.history.lock().persist(&cwd) {
            warn!("Failed to persist conversation history: {}", e);
        }
        info!("Listener stopped");
        Ok(())
    }

    fn run_silence(&mut self) -> Result<()> {
        self.deps.speech.resume();

        let pcm = self.read_buffer()?;
        let level = rms_level(&pcm);
        if level <= self.talking_threshold() {
            return Ok(());
        }

        debug!("Talking detected (rms {:.4})", level);
        self.transcriber.feed(&pcm);
        let partial_len = self.transcriber.partial().map(|p| p.len()).unwrap_or(0);
        self.silence.prime(partial_len);

        self.state = self.queued_next;
        self.queued_next = ListenState::WakeWordListen;
        Ok(())
    }

    /// Shared body of `WakeWordListen` and `CommandRecording`.
    fn run_listening(&mut self, wake_word_phase: bool) -> Result<()> {
        self.deps.speech.pause();

        let pcm = self.read_buffer()?;
        let level = rms_level(&pcm);
        self.transcriber.feed(&pcm);

        let Some(partial) = self.transcriber.partial() else {
            debug!("No transcript update this iteration");
            return Ok(());
        };

        let quiet = level < self.talking_threshold();
        if !self.silence.update(quiet, partial.len()) {
            return Ok(());
        }

        let Some(final_text) = self.transcriber.finalize() else {
            debug!("Empty final transcript, back to silence");
            self.state = ListenState::Silence;
            return Ok(());
        };
        info!("Heard: \"{}\"", final_text);

        if wake_word_phase {
            self.classify_wake_utterance(&final_text);
        } else {
            // Recording phase: the whole utterance is the command.
            self.pending_command = Some(final_text);
            self.state = ListenState::ProcessCommand;
        }
        Ok(())
    }

    fn classify_wake_utterance(&mut self, final_text: &str) {
        match classify(final_text, &self.deps.phrases, self.deps.speech.is_paused()) {
            WakeOutcome::Goodbye => {
                self.deps.quit.store(true, Ordering::SeqCst);
                self.deps.speech.discard();
                self.speak_farewell();
            }
            WakeOutcome::Cancel => {
                info!("Cancelled");
                self.deps.speech.discard();
                self.state = ListenState::Silence;
            }
            WakeOutcome::WakeAtEnd => {
                self.deps.speech.discard();
                self.deps.speech.speak(&self.deps.greeting_reply);
                self.queued_next = ListenState::CommandRecording;
                self.state = ListenState::Silence;
            }
            WakeOutcome::WakeWithCommand(command) => {
                self.deps.speech.discard();
                self.pending_command = Some(command);
                self.state = ListenState::ProcessCommand;
            }
            WakeOutcome::Nothing => {
                self.deps.speech.resume();
                self.state = ListenState::Silence;
            }
        }
    }

    fn run_process_command(&mut self) {
        let command = self.pending_command.take().unwrap_or_default();

        if self.deps.phrases.is_goodbye(&command) {
            self.deps.quit.store(true, Ordering::SeqCst);
        } else if let Some(reply) = self.deps.dispatcher.dispatch(&command) {
            self.deps.speech.speak(&reply);
        }

        self.queued_next = ListenState::WakeWordListen;
        self.state = ListenState::Silence;
    }

    fn run_vision(&mut self) {
        if let Some(jpeg) = self.deps.vision.take() {
            info!("Describing the captured frame");
            let encoded = BASE64.encode(jpeg);
            if let Some(reply) = self.deps.dispatcher.dispatch_vision(VISION_PROMPT, encoded) {
                self.deps.speech.speak(&reply);
            }
        }
        self.state = ListenState::Silence;
    }

    fn run_network(&mut self) {
        let restored = self.saved_state.take().unwrap_or(ListenState::Silence);
        let Some(slot) = self.deps.slot.clone() else {
            self.state = restored;
            return;
        };
        let Some(request) = slot.take_request() else {
            self.state = restored;
            return;
        };

        info!("Processing network audio from {} ({} bytes)", request.client, request.pcm.len());

        // Fresh recognizer state; local audio must not bleed into the
        // network utterance or vice versa.
        self.transcriber.reset();
        self.transcriber.feed(&request.pcm);
        let transcript = self.transcriber.finalize();
        self.transcriber.reset();

        let reply_text = match transcript {
            Some(text) => {
                info!("Network client said: \"{}\"", text);
                self.deps.dispatcher.dispatch(&text).unwrap_or_else(|| "Done.".to_string())
            }
            None => "I didn't catch that.".to_string(),
        };

        let reply = self
            .deps
            .speech
            .synthesize_to_wav(&reply_text)
            .unwrap_or_else(|_| wav::build(&[], 16_000));
        let reply = wav::truncate_to_cap(reply, self.deps.network.max_response_bytes);
        slot.complete(reply);

        self.state = restored;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loud_frames_with_progress_never_finalize() {
        let mut tracker = SilenceTracker::new(3);
        tracker.prime(0);
        assert!(!tracker.update(false, 5));
        assert!(!tracker.update(false, 9));
        assert!(!tracker.update(false, 14));
        assert!(!tracker.update(false, 20));
    }

    #[test]
    fn three_quiet_frames_finalize() {
        let mut tracker = SilenceTracker::new(3);
        tracker.prime(10);
        assert!(!tracker.update(true, 10));
        assert!(!tracker.update(true, 10));
        assert!(tracker.update(true, 10));
    }

    #[test]
    fn stalled_partial_counts_as_quiet_even_when_loud() {
        let mut tracker = SilenceTracker::new(3);
        tracker.prime(10);
        assert!(!tracker.update(false, 10));
        assert!(!tracker.update(false, 10));
        assert!(tracker.update(false, 10));
    }

    #[test]
    fn speech_resets_the_counter() {
        let mut tracker = SilenceTracker::new(3);
        tracker.prime(0);
        assert!(!tracker.update(true, 0));
        assert!(!tracker.update(true, 0));
        assert!(!tracker.update(false, 7)); // progress: reset
        assert!(!tracker.update(true, 7));
        assert!(!tracker.update(true, 7));
        assert!(tracker.update(true, 7));
    }

    #[test]
    fn state_names_are_stable() {
        assert_eq!(ListenState::Silence.name(), "silence");
        assert_eq!(ListenState::NetworkProcessing.name(), "network_processing");
    }
}
