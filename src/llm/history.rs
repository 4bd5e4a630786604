//! Conversation history shared between the dispatcher and MQTT callbacks.
//!
//! The first entry is always the system prompt; everything after alternates
//! strictly between user and assistant turns. The dispatcher appends the
//! user turn before calling the model and rolls it back if the call fails,
//! so the alternation survives transport errors.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::macros::format_description;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    /// Base64-encoded JPEG attached to vision turns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: ChatRole::System, content: content.into(), image: None }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: content.into(), image: None }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: ChatRole::Assistant, content: content.into(), image: None }
    }
}

pub struct ConversationHistory {
    messages: Vec<ChatMessage>,
}

impl ConversationHistory {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self { messages: vec![ChatMessage::system(system_prompt)] }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn push_user(&mut self, content: impl Into<String>, image: Option<String>) {
        self.messages.push(ChatMessage { role: ChatRole::User, content: content.into(), image });
    }

    pub fn push_assistant(&mut self, content: impl Into<String>) {
        self.messages.push(ChatMessage::assistant(content));
    }

    /// Undo the most recent user turn. Called when the model call fails so
    /// a dangling user entry does not break the role alternation.
    pub fn rollback_user(&mut self) {
        if matches!(self.messages.last(), Some(m) if m.role == ChatRole::User) {
            self.messages.pop();
        }
    }

    /// Write the conversation to `chat_history_YYYYMMDD_HHMMSS.json` under
    /// `dir`, pretty-printed.
    pub fn persist(&self, dir: &Path) -> Result<PathBuf> {
        let stamp_format = format_description!("[year][month][day]_[hour][minute][second]");
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        let stamp = now.format(stamp_format).context("failed to format timestamp")?;

        let path = dir.join(format!("chat_history_{stamp}.json"));
        let json = serde_json::to_string_pretty(&self.messages)?;
        std::fs::write(&path, json).with_context(|| format!("failed to write {}", path.display()))?;
        info!("Conversation history written to {}", path.display());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alternation_holds(history: &ConversationHistory) -> bool {
        let messages = history.messages();
        if messages.first().map(|m| m.role) != Some(ChatRole::System) {
            return false;
        }
        messages[1..].iter().enumerate().all(|(i, m)| {
            let expected = if i % 2 == 0 { ChatRole::User } else { ChatRole::Assistant };
            m.role == expected
        })
    }

    #[test]
    fn starts_with_the_system_prompt() {
        let history = ConversationHistory::new("you are DAWN");
        assert_eq!(history.len(), 1);
        assert_eq!(history.messages()[0].role, ChatRole::System);
    }

    #[test]
    fn turns_alternate() {
        let mut history = ConversationHistory::new("sys");
        history.push_user("hi", None);
        history.push_assistant("hello");
        history.push_user("[Tool Result: lights.off returned: ok]", None);
        history.push_assistant("Done.");
        assert!(alternation_holds(&history));
        assert_eq!(history.len(), 5);
    }

    #[test]
    fn rollback_removes_only_a_trailing_user_turn() {
        let mut history = ConversationHistory::new("sys");
        history.push_user("hi", None);
        history.rollback_user();
        assert_eq!(history.len(), 1);

        history.push_user("hi", None);
        history.push_assistant("hello");
        history.rollback_user();
        assert_eq!(history.len(), 3);
        assert!(alternation_holds(&history));
    }

    #[test]
    fn persisted_file_is_a_json_array_of_roles() {
        let mut history = ConversationHistory::new("sys");
        history.push_user("hi", None);
        history.push_assistant("hello");

        let dir = tempfile::tempdir().unwrap();
        let path = history.persist(dir.path()).unwrap();
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("chat_history_"));

        let data = std::fs::read_to_string(&path).unwrap();
        let parsed: Vec<serde_json::Value> = serde_json::from_str(&data).unwrap();
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[0]["role"], "system");
        assert_eq!(parsed[1]["role"], "user");
        assert_eq!(parsed[2]["role"], "assistant");
    }
}
