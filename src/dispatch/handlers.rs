//! Built-in device handlers.
//!
//! Commands arriving on the daemon's own MQTT topic (from the LLM tool loop
//! or from other nodes) resolve by device tag to one of these handlers.
//! A handler either acts silently, produces a result string for the tool
//! loop, or asks for the result to be spoken.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use parking_lot::Mutex;
use serde::Deserialize;
use time::OffsetDateTime;
use time::macros::format_description;
use tracing::{debug, info, warn};

use crate::bus::MqttBus;
use crate::config::DeviceEntry;
use crate::config::LlmBackendKind;
use crate::llm::LlmRouter;
use crate::tts::{Speaker, SpeechOutput};

use super::registry::PendingTools;

/// Outcome of one handler invocation.
pub struct HandlerReply {
    /// Result text for the tool loop; `None` when the handler already acted
    /// on its own (spoke, switched a device, armed the camera).
    pub text: Option<String>,
    /// Whether the text should also be spoken when no tool call is waiting
    /// on it.
    pub should_respond: bool,
}

impl HandlerReply {
    pub fn silent() -> Self {
        Self { text: None, should_respond: false }
    }

    pub fn spoken(text: impl Into<String>) -> Self {
        Self { text: Some(text.into()), should_respond: true }
    }

    pub fn result(text: impl Into<String>) -> Self {
        Self { text: Some(text.into()), should_respond: false }
    }
}

pub trait DeviceHandler: Send + Sync {
    fn handle(&self, action: &str, value: &str) -> HandlerReply;
}

// ---------------------------------------------------------------------------
// Individual handlers
// ---------------------------------------------------------------------------

/// `time` and `date` tags.
pub struct ClockHandler;

impl DeviceHandler for ClockHandler {
    fn handle(&self, action: &str, _value: &str) -> HandlerReply {
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        match action {
            "date" => {
                let format = format_description!("[weekday repr:long], [month repr:long] [day padding:none], [year]");
                match now.format(format) {
                    Ok(date) => HandlerReply::spoken(format!("Today is {date}.")),
                    Err(_) => HandlerReply::spoken("I couldn't read the calendar."),
                }
            }
            _ => {
                let format = format_description!("[hour repr:12 padding:none]:[minute] [period]");
                match now.format(format) {
                    Ok(clock) => HandlerReply::spoken(format!("The time is {clock}.")),
                    Err(_) => HandlerReply::spoken("I couldn't read the clock."),
                }
            }
        }
    }
}

/// `volume` tag: absolute percent or up/down steps on the playback gain.
pub struct VolumeHandler {
    pub speech: Arc<SpeechOutput>,
}

impl DeviceHandler for VolumeHandler {
    fn handle(&self, action: &str, value: &str) -> HandlerReply {
        let current = self.speech.volume();
        let target = match action {
            "up" => current + 0.1,
            "down" => current - 0.1,
            _ => match value.trim().trim_end_matches('%').parse::<f32>() {
                Ok(percent) => percent / 100.0,
                Err(_) => return HandlerReply::spoken(format!("I can't set the volume to {value}.")),
            },
        };
        let target = target.clamp(0.0, 1.0);
        self.speech.set_volume(target);
        HandlerReply::spoken(format!("Volume set to {} percent.", (target * 100.0).round() as u32))
    }
}

/// `text_to_speech` tag: speak the value verbatim.
pub struct SpeakHandler {
    pub speech: Arc<SpeechOutput>,
}

impl DeviceHandler for SpeakHandler {
    fn handle(&self, _action: &str, value: &str) -> HandlerReply {
        self.speech.speak(value);
        HandlerReply::silent()
    }
}

/// `shutdown` tag.
pub struct ShutdownHandler {
    pub quit: Arc<AtomicBool>,
}

impl DeviceHandler for ShutdownHandler {
    fn handle(&self, _action: &str, _value: &str) -> HandlerReply {
        info!("Shutdown requested over the bus");
        self.quit.store(true, Ordering::SeqCst);
        HandlerReply::silent()
    }
}

/// Camera frame delivered by a vision node, waiting for the state machine.
pub struct VisionSlot {
    image: Mutex<Option<Vec<u8>>>,
}

impl VisionSlot {
    pub fn new() -> Self {
        Self { image: Mutex::new(None) }
    }

    pub fn store(&self, jpeg: Vec<u8>) {
        *self.image.lock() = Some(jpeg);
    }

    pub fn ready(&self) -> bool {
        self.image.lock().is_some()
    }

    /// Take the frame, releasing the slot.
    pub fn take(&self) -> Option<Vec<u8>> {
        self.image.lock().take()
    }
}

impl Default for VisionSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// `viewing` tag: stores the incoming frame for the next loop iteration.
pub struct ViewingHandler {
    pub vision: Arc<VisionSlot>,
}

impl DeviceHandler for ViewingHandler {
    fn handle(&self, _action: &str, value: &str) -> HandlerReply {
        match BASE64.decode(value.trim()) {
            Ok(jpeg) => {
                debug!("Vision frame received ({} bytes)", jpeg.len());
                self.vision.store(jpeg);
                HandlerReply::silent()
            }
            Err(e) => {
                warn!("Discarding undecodable vision frame: {}", e);
                HandlerReply::silent()
            }
        }
    }
}

/// `local_llm` / `cloud_llm` tags: flip the active completion backend.
pub struct BackendHandler {
    pub router: Arc<LlmRouter>,
    pub kind: LlmBackendKind,
}

impl DeviceHandler for BackendHandler {
    fn handle(&self, _action: &str, _value: &str) -> HandlerReply {
        if self.router.active() == self.kind {
            return HandlerReply::result("already active");
        }
        match self.router.select(self.kind) {
            Ok(()) => HandlerReply::spoken(match self.kind {
                LlmBackendKind::Local => "Switched to the local model.",
                LlmBackendKind::Cloud => "Switched to the cloud model.",
            }),
            Err(e) => HandlerReply::spoken(format!("I can't switch models: {e}.")),
        }
    }
}

/// Pending capture-device switch, applied by the state machine at its next
/// iteration (the capture handle lives on that thread).
pub struct CaptureSwitch {
    pending: Mutex<Option<String>>,
}

impl CaptureSwitch {
    pub fn new() -> Self {
        Self { pending: Mutex::new(None) }
    }

    pub fn request(&self, device_id: String) {
        *self.pending.lock() = Some(device_id);
    }

    pub fn take(&self) -> Option<String> {
        self.pending.lock().take()
    }
}

impl Default for CaptureSwitch {
    fn default() -> Self {
        Self::new()
    }
}

/// `audio_capture_device` tag.
pub struct CaptureDeviceHandler {
    pub switch: Arc<CaptureSwitch>,
    pub table: Vec<DeviceEntry>,
}

impl DeviceHandler for CaptureDeviceHandler {
    fn handle(&self, _action: &str, value: &str) -> HandlerReply {
        match self.table.iter().find(|d| d.name.eq_ignore_ascii_case(value.trim())) {
            Some(device) => {
                self.switch.request(device.id.clone());
                HandlerReply::spoken(format!("Listening through {} now.", device.name))
            }
            None => HandlerReply::spoken(format!("I don't know a microphone called {value}.")),
        }
    }
}

/// `audio_playback_device` tag.
pub struct PlaybackDeviceHandler {
    pub speech: Arc<SpeechOutput>,
    pub table: Vec<DeviceEntry>,
}

impl DeviceHandler for PlaybackDeviceHandler {
    fn handle(&self, _action: &str, value: &str) -> HandlerReply {
        match self.table.iter().find(|d| d.name.eq_ignore_ascii_case(value.trim())) {
            Some(device) => {
                self.speech.switch_device(&device.id);
                HandlerReply::spoken(format!("Speaking through {} now.", device.name))
            }
            None => HandlerReply::spoken(format!("I don't know a speaker called {value}.")),
        }
    }
}

/// `music` and `voice_amplifier` tags: forward to the downstream node's
/// topic and acknowledge.
pub struct RelayHandler {
    pub bus: Option<Arc<MqttBus>>,
    pub device: String,
    pub topic: String,
}

impl DeviceHandler for RelayHandler {
    fn handle(&self, action: &str, value: &str) -> HandlerReply {
        let payload = serde_json::json!({"device": self.device, "action": action, "value": value}).to_string();
        match &self.bus {
            Some(bus) => {
                bus.publish(&self.topic, payload.as_bytes());
                HandlerReply::result(format!("{} {action} requested", self.device))
            }
            None => HandlerReply::result(format!("{} is offline", self.device)),
        }
    }
}

// ---------------------------------------------------------------------------
// Registry and inbound routing
// ---------------------------------------------------------------------------

pub struct HandlerRegistry {
    handlers: HashMap<String, Box<dyn DeviceHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self { handlers: HashMap::new() }
    }

    pub fn register(&mut self, device: &str, handler: Box<dyn DeviceHandler>) {
        self.handlers.insert(device.to_string(), handler);
    }

    pub fn dispatch(&self, device: &str, action: &str, value: &str) -> Option<HandlerReply> {
        self.handlers.get(device).map(|h| h.handle(action, value))
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Message shape on the daemon's own topic.
#[derive(Debug, Deserialize)]
struct InboundCommand {
    device: String,
    action: String,
    #[serde(default)]
    value: String,
    #[serde(default)]
    request_id: Option<String>,
}

/// Routes messages from the daemon's own topic: device handlers first, then
/// either the tool-result registry (correlated by request id) or speech.
pub struct InboundRouter {
    pub registry: HandlerRegistry,
    pub pending: Arc<PendingTools>,
    pub speech: Arc<dyn Speaker>,
}

impl InboundRouter {
    pub fn route(&self, payload: &[u8]) {
        let command: InboundCommand = match serde_json::from_slice(payload) {
            Ok(c) => c,
            Err(e) => {
                warn!("Undecodable bus message: {}", e);
                return;
            }
        };

        let reply = match self.registry.dispatch(&command.device, &command.action, &command.value) {
            Some(reply) => reply,
            None => {
                debug!("No handler for device tag \"{}\"", command.device);
                return;
            }
        };

        if let Some(request_id) = command.request_id.as_deref() {
            let value = reply.text.unwrap_or_else(|| "ok".to_string());
            self.pending.complete(request_id, value);
            return;
        }

        if reply.should_respond
            && let Some(text) = reply.text
        {
            self.speech.speak(&text);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoHandler;

    impl DeviceHandler for EchoHandler {
        fn handle(&self, action: &str, value: &str) -> HandlerReply {
            HandlerReply::result(format!("{action}:{value}"))
        }
    }

    #[test]
    fn registry_dispatches_by_device_tag() {
        let mut registry = HandlerRegistry::new();
        registry.register("echo", Box::new(EchoHandler));

        let reply = registry.dispatch("echo", "on", "lamp").unwrap();
        assert_eq!(reply.text.as_deref(), Some("on:lamp"));
        assert!(registry.dispatch("nope", "on", "lamp").is_none());
    }

    #[test]
    fn vision_slot_hands_off_exactly_once() {
        let slot = VisionSlot::new();
        assert!(!slot.ready());
        slot.store(vec![1, 2, 3]);
        assert!(slot.ready());
        assert_eq!(slot.take(), Some(vec![1, 2, 3]));
        assert!(!slot.ready());
        assert_eq!(slot.take(), None);
    }

    #[test]
    fn capture_switch_is_one_shot() {
        let switch = CaptureSwitch::new();
        switch.request("hw:1,0".into());
        assert_eq!(switch.take(), Some("hw:1,0".into()));
        assert_eq!(switch.take(), None);
    }

    #[test]
    fn clock_handler_speaks_a_time() {
        let reply = ClockHandler.handle("time", "");
        let text = reply.text.unwrap();
        assert!(text.starts_with("The time is "), "got {text}");
        assert!(reply.should_respond);
    }

    #[test]
    fn clock_handler_speaks_a_date() {
        let reply = ClockHandler.handle("date", "");
        assert!(reply.text.unwrap().starts_with("Today is "));
    }
}
