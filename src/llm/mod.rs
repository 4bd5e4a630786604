//! LLM backends and the shared conversation history.

mod client;
mod history;

pub use client::{CompletionBackend, LlmRouter};
pub use history::{ChatMessage, ChatRole, ConversationHistory};
