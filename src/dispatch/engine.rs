//! Command dispatch: direct action matching, the LLM tool-call loop, and
//! reply cleanup.
//!
//! The loop publishes every `<command>` block the model emits on the
//! daemon's own topic with a fresh request id, waits (bounded) for the
//! correlated result, then feeds all results back to the model as a
//! synthetic user turn. It repeats until a reply carries no command tags,
//! capped by `max_tool_iterations`.

use std::sync::Arc;

use parking_lot::Mutex;
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::MqttBus;
use crate::config::{DispatchMode, DispatchSettings};
use crate::llm::{ConversationHistory, LlmRouter};

use super::handlers::InboundRouter;
use super::registry::PendingTools;
use super::router::ActionRouter;

static COMMAND_BLOCK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<command>(.*?)</command>").unwrap());

pub struct CommandDispatcher {
    mode: DispatchMode,
    router: ActionRouter,
    llm: Arc<LlmRouter>,
    history: Arc<Mutex<ConversationHistory>>,
    pending: Arc<PendingTools>,
    bus: Option<Arc<MqttBus>>,
    inbound: Arc<InboundRouter>,
    own_topic: String,
    settings: DispatchSettings,
}

impl CommandDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mode: DispatchMode,
        router: ActionRouter,
        llm: Arc<LlmRouter>,
        history: Arc<Mutex<ConversationHistory>>,
        pending: Arc<PendingTools>,
        bus: Option<Arc<MqttBus>>,
        inbound: Arc<InboundRouter>,
        own_topic: String,
        settings: DispatchSettings,
    ) -> Self {
        Self { mode, router, llm, history, pending, bus, inbound, own_topic, settings }
    }

    /// Route one recognized utterance. Returns the reply to speak, if any;
    /// `None` means a direct action fired (its handler replies through the
    /// bus loopback) or the utterance was ignored.
    pub fn dispatch(&self, text: &str) -> Option<String> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }

        match self.mode {
            DispatchMode::DirectOnly => {
                if self.try_direct(text) {
                    return None;
                }
                if self.is_ignored(text) {
                    debug!("Ignoring \"{}\"", text);
                    return None;
                }
                if self.settings.direct_only_llm_fallback { self.llm_turn(text, None) } else { None }
            }
            DispatchMode::DirectFirst => {
                if self.try_direct(text) {
                    return None;
                }
                self.llm_turn(text, None)
            }
            DispatchMode::LlmOnly => self.llm_turn(text, None),
        }
    }

    /// Vision turn: canned prompt plus the captured frame.
    pub fn dispatch_vision(&self, prompt: &str, image_b64: String) -> Option<String> {
        self.llm_turn(prompt, Some(image_b64))
    }

    fn is_ignored(&self, text: &str) -> bool {
        self.settings.ignore_words.iter().any(|w| w == text)
    }

    fn try_direct(&self, text: &str) -> bool {
        let Some(matched) = self.router.match_action(text) else {
            return false;
        };
        info!("Direct action \"{}\" matched, publishing on {}", matched.action.entry.name, matched.action.entry.topic);

        match &self.bus {
            Some(bus) => bus.publish(&matched.action.entry.topic, matched.payload.as_bytes()),
            // Without a broker, commands aimed at our own topic still reach
            // the local handlers.
            None if matched.action.entry.topic == self.own_topic => self.inbound.route(matched.payload.as_bytes()),
            None => warn!("MQTT disabled, dropping action payload for {}", matched.action.entry.topic),
        }
        true
    }

    fn llm_turn(&self, text: &str, image: Option<String>) -> Option<String> {
        let mut history = self.history.lock();
        history.push_user(text, image);

        let mut final_reply = None;

        for iteration in 0..self.settings.max_tool_iterations {
            let reply = match self.llm.complete(history.messages()) {
                Ok(reply) => reply,
                Err(e) => {
                    error!("LLM request failed: {:#}", e);
                    history.rollback_user();
                    return Some(self.settings.unavailable_reply.clone());
                }
            };

            // The raw reply (tags included) goes to history so the model
            // remembers its own tool use; only the cleaned text is spoken.
            history.push_assistant(&reply);
            final_reply = Some(clean_reply(&reply));

            let blocks = extract_command_blocks(&reply);
            if blocks.is_empty() {
                break;
            }
            debug!("Tool iteration {}: {} command block(s)", iteration + 1, blocks.len());

            let results: Vec<String> = blocks.iter().filter_map(|block| self.execute_command(block)).collect();
            if results.is_empty() {
                break;
            }
            history.push_user(results.join("\n"), None);
        }

        final_reply
    }

    /// Publish one command block with an injected request id and wait for
    /// its result.
    fn execute_command(&self, block: &str) -> Option<String> {
        let mut command: Value = match serde_json::from_str(block.trim()) {
            Ok(Value::Object(map)) => Value::Object(map),
            Ok(_) | Err(_) => {
                warn!("Skipping malformed command block: {}", block.trim());
                return None;
            }
        };

        let device = command["device"].as_str().unwrap_or("unknown").to_string();
        let action = command["action"].as_str().unwrap_or("unknown").to_string();

        let request_id = Uuid::new_v4().to_string();
        command["request_id"] = Value::String(request_id.clone());
        let payload = command.to_string();

        let rx = self.pending.register(&request_id);
        match &self.bus {
            Some(bus) => bus.publish(&self.own_topic, payload.as_bytes()),
            None => self.inbound.route(payload.as_bytes()),
        }

        let timeout = Duration::from_secs(self.settings.tool_timeout_secs);
        match self.pending.wait(&request_id, &rx, timeout) {
            Some(value) => Some(format!("[Tool Result: {device}.{action} returned: {value}]")),
            None => {
                debug!("Tool result timeout for {}.{}", device, action);
                Some(format!("[Tool Result: {device}.{action} completed successfully]"))
            }
        }
    }
}

/// All `<command>` block bodies in declaration order.
pub fn extract_command_blocks(reply: &str) -> Vec<String> {
    COMMAND_BLOCK.captures_iter(reply).map(|c| c[1].to_string()).collect()
}

/// Strip command tags, turn markers, asterisks and emoji; trim whitespace.
pub fn clean_reply(reply: &str) -> String {
    let stripped = COMMAND_BLOCK.replace_all(reply, "");
    let stripped = stripped.replace("<end_of_turn>", "");
    stripped.chars().filter(|&c| c != '*' && !is_emoji(c)).collect::<String>().trim().to_string()
}

fn is_emoji(c: char) -> bool {
    matches!(c as u32,
        0x1F000..=0x1FAFF   // pictographs, emoticons, transport, supplemental
        | 0x2600..=0x27BF   // misc symbols and dingbats
        | 0x2B00..=0x2BFF   // stars and arrows
        | 0xFE00..=0xFE0F   // variation selectors
        | 0x200D            // zero-width joiner
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ActionEntry;
    use crate::dispatch::handlers::{DeviceHandler, HandlerRegistry, HandlerReply};
    use crate::llm::{ChatMessage, ChatRole, CompletionBackend};
    use crate::tts::Speaker;
    use anyhow::Result;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    struct ScriptedBackend {
        replies: StdMutex<VecDeque<Result<String, String>>>,
    }

    impl ScriptedBackend {
        fn new(replies: Vec<Result<&str, &str>>) -> Self {
            Self { replies: StdMutex::new(replies.into_iter().map(|r| r.map(str::to_owned).map_err(str::to_owned)).collect()) }
        }
    }

    impl CompletionBackend for ScriptedBackend {
        fn complete(&self, _history: &[ChatMessage]) -> Result<String> {
            match self.replies.lock().unwrap().pop_front() {
                Some(Ok(reply)) => Ok(reply),
                Some(Err(e)) => Err(anyhow::anyhow!(e)),
                None => Ok("Done.".into()),
            }
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    struct NullSpeaker;

    impl Speaker for NullSpeaker {
        fn speak(&self, _text: &str) {}
    }

    struct OkHandler;

    impl DeviceHandler for OkHandler {
        fn handle(&self, _action: &str, _value: &str) -> HandlerReply {
            HandlerReply::result("ok")
        }
    }

    fn dispatcher(mode: DispatchMode, replies: Vec<Result<&str, &str>>, actions: Vec<ActionEntry>) -> (CommandDispatcher, Arc<Mutex<ConversationHistory>>) {
        let llm = Arc::new(LlmRouter::for_tests(Box::new(ScriptedBackend::new(replies))));
        let history = Arc::new(Mutex::new(ConversationHistory::new("system prompt")));
        let pending = Arc::new(PendingTools::new());

        let mut registry = HandlerRegistry::new();
        registry.register("lights", Box::new(OkHandler));
        let inbound = Arc::new(InboundRouter { registry, pending: pending.clone(), speech: Arc::new(NullSpeaker) });

        let mut settings = DispatchSettings::default();
        settings.tool_timeout_secs = 1;

        let dispatcher = CommandDispatcher::new(
            mode,
            ActionRouter::compile(&actions).unwrap(),
            llm,
            history.clone(),
            pending,
            None,
            inbound,
            "dawn".into(),
            settings,
        );
        (dispatcher, history)
    }

    #[test]
    fn command_blocks_extract_in_order() {
        let reply = "a <command>{\"x\":1}</command> b <command>{\"y\":2}</command>";
        assert_eq!(extract_command_blocks(reply), vec!["{\"x\":1}", "{\"y\":2}"]);
    }

    #[test]
    fn clean_reply_strips_tags_markers_and_emoji() {
        let reply = "Sure!😊 <command>{\"device\":\"x\"}</command>*Done*<end_of_turn>  ";
        assert_eq!(clean_reply(reply), "Sure! Done");
    }

    #[test]
    fn tool_loop_round_trips_and_history_alternates() {
        let first = r#"Certainly. <command>{"device":"lights","action":"off","value":"living room lamp"}</command>"#;
        let (dispatcher, history) = dispatcher(DispatchMode::DirectFirst, vec![Ok(first), Ok("Done.")], vec![]);

        let spoken = dispatcher.dispatch("turn off the living room lamp");
        assert_eq!(spoken.as_deref(), Some("Done."));

        let history = history.lock();
        let roles: Vec<ChatRole> = history.messages().iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![ChatRole::System, ChatRole::User, ChatRole::Assistant, ChatRole::User, ChatRole::Assistant]);

        // The synthetic turn carries the tool result.
        let synthetic = &history.messages()[3];
        assert_eq!(synthetic.content, "[Tool Result: lights.off returned: ok]");
        // The assistant turn keeps its command tags.
        assert!(history.messages()[2].content.contains("<command>"));
    }

    #[test]
    fn malformed_command_block_is_skipped() {
        let reply = r#"<command>not json</command> All set."#;
        let (dispatcher, history) = dispatcher(DispatchMode::LlmOnly, vec![Ok(reply)], vec![]);

        let spoken = dispatcher.dispatch("do the thing");
        assert_eq!(spoken.as_deref(), Some("All set."));
        // No synthetic turn: nothing executed.
        assert_eq!(history.lock().len(), 3);
    }

    #[test]
    fn llm_failure_speaks_the_fallback_and_rolls_back() {
        let (dispatcher, history) = dispatcher(DispatchMode::LlmOnly, vec![Err("connection refused")], vec![]);
        let spoken = dispatcher.dispatch("hello");
        assert_eq!(spoken.as_deref(), Some("I'm currently unavailable. Please try again later."));
        assert_eq!(history.lock().len(), 1);
    }

    #[test]
    fn tool_loop_depth_is_bounded() {
        let looping = r#"<command>{"device":"lights","action":"on","value":"x"}</command>"#;
        let (dispatcher, history) = dispatcher(DispatchMode::LlmOnly, vec![Ok(looping), Ok(looping), Ok(looping), Ok(looping), Ok(looping), Ok(looping)], vec![]);

        let spoken = dispatcher.dispatch("loop forever");
        // Cleaned text of the last reply is empty once tags are stripped.
        assert_eq!(spoken.as_deref(), Some(""));

        // max_tool_iterations (4) completions: system + user + 4 × (assistant + synthetic user)
        assert_eq!(history.lock().len(), 2 + 4 * 2);
    }

    #[test]
    fn direct_only_respects_the_ignore_list() {
        let (dispatcher, history) = dispatcher(DispatchMode::DirectOnly, vec![Ok("should not be called")], vec![]);
        assert_eq!(dispatcher.dispatch("huh"), None);
        assert_eq!(history.lock().len(), 1);
    }

    #[test]
    fn direct_match_skips_the_llm() {
        let action = ActionEntry {
            name: "lights".into(),
            device: "lights".into(),
            wildcard: "*lamp on*".into(),
            template: "lamp on".into(),
            command: r#"{"device":"lights","action":"on"}"#.into(),
            topic: "dawn".into(),
        };
        let (dispatcher, history) = dispatcher(DispatchMode::DirectFirst, vec![Ok("unused")], vec![action]);

        assert_eq!(dispatcher.dispatch("lamp on please"), None);
        assert_eq!(history.lock().len(), 1);
    }
}
