//! Completion backends.
//!
//! Every backend speaks its provider's native HTTP schema over a blocking
//! reqwest client and is normalized behind [`CompletionBackend`]: full
//! history in, one reply string out. The dispatcher owns the history (tool
//! results, vision turns, rollback on failure), so the backends stay
//! stateless.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tracing::{debug, info};

use super::history::{ChatMessage, ChatRole};
use crate::config::{CloudProvider, LlmBackendKind, LlmSettings};

pub trait CompletionBackend: Send + Sync {
    /// Run one completion over the full conversation.
    fn complete(&self, history: &[ChatMessage]) -> Result<String>;

    /// Backend label for logs.
    fn name(&self) -> &'static str;
}

fn http_client(timeout_secs: u64) -> Result<reqwest::blocking::Client> {
    reqwest::blocking::Client::builder().timeout(Duration::from_secs(timeout_secs)).build().context("failed to build HTTP client")
}

fn role_str(role: ChatRole) -> &'static str {
    match role {
        ChatRole::System => "system",
        ChatRole::User => "user",
        ChatRole::Assistant => "assistant",
    }
}

// ---------------------------------------------------------------------------
// OpenAI-compatible chat completions (cloud OpenAI and local servers)
// ---------------------------------------------------------------------------

/// Messages in the chat-completions schema. Vision turns become a content
/// array with a data-URL image part.
fn openai_messages(history: &[ChatMessage]) -> Vec<Value> {
    history
        .iter()
        .map(|m| match &m.image {
            Some(b64) => json!({
                "role": role_str(m.role),
                "content": [
                    {"type": "text", "text": m.content},
                    {"type": "image_url", "image_url": {"url": format!("data:image/jpeg;base64,{b64}")}},
                ],
            }),
            None => json!({"role": role_str(m.role), "content": m.content}),
        })
        .collect()
}

fn openai_complete(http: &reqwest::blocking::Client, url: &str, api_key: Option<&str>, model: &str, temperature: f32, history: &[ChatMessage]) -> Result<String> {
    let body = json!({
        "model": model,
        "temperature": temperature,
        "messages": openai_messages(history),
    });

    let mut request = http.post(url).json(&body);
    if let Some(key) = api_key {
        request = request.bearer_auth(key);
    }

    let response = request.send().context("chat completion request failed")?;
    if !response.status().is_success() {
        bail!("chat completion returned HTTP {}", response.status());
    }

    let value: Value = response.json().context("invalid chat completion response")?;
    let content = value["choices"][0]["message"]["content"].as_str().unwrap_or_default().trim().to_string();
    if content.is_empty() {
        bail!("empty completion");
    }
    Ok(content)
}

pub struct OpenAiBackend {
    http: reqwest::blocking::Client,
    url: String,
    api_key: String,
    model: String,
    temperature: f32,
}

impl OpenAiBackend {
    pub fn new(settings: &LlmSettings) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY").context("OPENAI_API_KEY is not set")?;
        Ok(Self {
            http: http_client(settings.request_timeout_secs)?,
            url: format!("{}/v1/chat/completions", settings.openai_url.trim_end_matches('/')),
            api_key,
            model: settings.openai_model.clone(),
            temperature: settings.temperature,
        })
    }
}

impl CompletionBackend for OpenAiBackend {
    fn complete(&self, history: &[ChatMessage]) -> Result<String> {
        openai_complete(&self.http, &self.url, Some(&self.api_key), &self.model, self.temperature, history)
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

/// Local OpenAI-compatible server (Ollama, llama.cpp, vLLM).
pub struct LocalBackend {
    http: reqwest::blocking::Client,
    url: String,
    model: String,
    temperature: f32,
}

impl LocalBackend {
    pub fn new(settings: &LlmSettings) -> Result<Self> {
        info!("Local LLM endpoint: {} model {}", settings.local_url, settings.local_model);
        Ok(Self {
            http: http_client(settings.request_timeout_secs)?,
            url: format!("{}/v1/chat/completions", settings.local_url.trim_end_matches('/')),
            model: settings.local_model.clone(),
            temperature: settings.temperature,
        })
    }
}

impl CompletionBackend for LocalBackend {
    fn complete(&self, history: &[ChatMessage]) -> Result<String> {
        openai_complete(&self.http, &self.url, None, &self.model, self.temperature, history)
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

// ---------------------------------------------------------------------------
// Anthropic messages API
// ---------------------------------------------------------------------------

pub struct AnthropicBackend {
    http: reqwest::blocking::Client,
    url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl AnthropicBackend {
    pub fn new(settings: &LlmSettings) -> Result<Self> {
        let api_key = std::env::var("ANTHROPIC_API_KEY").context("ANTHROPIC_API_KEY is not set")?;
        Ok(Self {
            http: http_client(settings.request_timeout_secs)?,
            url: format!("{}/v1/messages", settings.anthropic_url.trim_end_matches('/')),
            api_key,
            model: settings.anthropic_model.clone(),
            max_tokens: settings.max_tokens,
        })
    }
}

impl CompletionBackend for AnthropicBackend {
    fn complete(&self, history: &[ChatMessage]) -> Result<String> {
        // The system prompt travels in its own field; the rest of the
        // history maps one-to-one.
        let system = history.iter().find(|m| m.role == ChatRole::System).map(|m| m.content.clone()).unwrap_or_default();

        let messages: Vec<Value> = history
            .iter()
            .filter(|m| m.role != ChatRole::System)
            .map(|m| match &m.image {
                Some(b64) => json!({
                    "role": role_str(m.role),
                    "content": [
                        {"type": "image", "source": {"type": "base64", "media_type": "image/jpeg", "data": b64}},
                        {"type": "text", "text": m.content},
                    ],
                }),
                None => json!({"role": role_str(m.role), "content": m.content}),
            })
            .collect();

        let body = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "system": system,
            "messages": messages,
        });

        let response = self
            .http
            .post(&self.url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .context("anthropic request failed")?;
        if !response.status().is_success() {
            bail!("anthropic returned HTTP {}", response.status());
        }

        let value: Value = response.json().context("invalid anthropic response")?;
        let content = value["content"][0]["text"].as_str().unwrap_or_default().trim().to_string();
        if content.is_empty() {
            bail!("empty completion");
        }
        Ok(content)
    }

    fn name(&self) -> &'static str {
        "anthropic"
    }
}

// ---------------------------------------------------------------------------
// Gemini generateContent API
// ---------------------------------------------------------------------------

pub struct GeminiBackend {
    http: reqwest::blocking::Client,
    url: String,
    temperature: f32,
}

impl GeminiBackend {
    pub fn new(settings: &LlmSettings) -> Result<Self> {
        let api_key = std::env::var("GEMINI_API_KEY").context("GEMINI_API_KEY is not set")?;
        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            settings.gemini_url.trim_end_matches('/'),
            settings.gemini_model,
            urlencoding::encode(&api_key),
        );
        Ok(Self { http: http_client(settings.request_timeout_secs)?, url, temperature: settings.temperature })
    }
}

impl CompletionBackend for GeminiBackend {
    fn complete(&self, history: &[ChatMessage]) -> Result<String> {
        let system = history.iter().find(|m| m.role == ChatRole::System).map(|m| m.content.clone()).unwrap_or_default();

        let contents: Vec<Value> = history
            .iter()
            .filter(|m| m.role != ChatRole::System)
            .map(|m| {
                let role = if m.role == ChatRole::Assistant { "model" } else { "user" };
                let mut parts = vec![json!({"text": m.content})];
                if let Some(b64) = &m.image {
                    parts.push(json!({"inline_data": {"mime_type": "image/jpeg", "data": b64}}));
                }
                json!({"role": role, "parts": parts})
            })
            .collect();

        let body = json!({
            "system_instruction": {"parts": [{"text": system}]},
            "contents": contents,
            "generationConfig": {"temperature": self.temperature},
        });

        let response = self.http.post(&self.url).json(&body).send().context("gemini request failed")?;
        if !response.status().is_success() {
            bail!("gemini returned HTTP {}", response.status());
        }

        let value: Value = response.json().context("invalid gemini response")?;
        let content = value["candidates"][0]["content"]["parts"][0]["text"].as_str().unwrap_or_default().trim().to_string();
        if content.is_empty() {
            bail!("empty completion");
        }
        Ok(content)
    }

    fn name(&self) -> &'static str {
        "gemini"
    }
}

// ---------------------------------------------------------------------------
// Runtime backend selection
// ---------------------------------------------------------------------------

/// Holds both backends and the active selection; the `local_llm` and
/// `cloud_llm` device handlers flip the selection at runtime.
pub struct LlmRouter {
    cloud: Option<Box<dyn CompletionBackend>>,
    local: Option<Box<dyn CompletionBackend>>,
    active: Mutex<LlmBackendKind>,
}

impl LlmRouter {
    pub fn new(settings: &LlmSettings, initial: LlmBackendKind, provider: CloudProvider) -> Result<Self> {
        let cloud: Option<Box<dyn CompletionBackend>> = match provider {
            CloudProvider::OpenAi => OpenAiBackend::new(settings).map(|b| Box::new(b) as _).ok(),
            CloudProvider::Anthropic => AnthropicBackend::new(settings).map(|b| Box::new(b) as _).ok(),
            CloudProvider::Gemini => GeminiBackend::new(settings).map(|b| Box::new(b) as _).ok(),
        };
        let local: Option<Box<dyn CompletionBackend>> = LocalBackend::new(settings).map(|b| Box::new(b) as _).ok();

        match initial {
            LlmBackendKind::Cloud if cloud.is_none() => bail!("cloud backend selected but no API key is configured"),
            LlmBackendKind::Local if local.is_none() => bail!("local backend selected but unavailable"),
            _ => {}
        }

        Ok(Self { cloud, local, active: Mutex::new(initial) })
    }

    /// Router backed by a single scripted backend, for dispatcher tests.
    #[cfg(test)]
    pub fn for_tests(backend: Box<dyn CompletionBackend>) -> Self {
        Self { cloud: None, local: Some(backend), active: Mutex::new(LlmBackendKind::Local) }
    }

    pub fn active(&self) -> LlmBackendKind {
        *self.active.lock()
    }

    /// Switch backends. Fails when the requested backend was never
    /// configured.
    pub fn select(&self, kind: LlmBackendKind) -> Result<()> {
        let available = match kind {
            LlmBackendKind::Cloud => self.cloud.is_some(),
            LlmBackendKind::Local => self.local.is_some(),
        };
        if !available {
            bail!("{kind:?} backend is not configured");
        }
        *self.active.lock() = kind;
        info!("LLM backend switched to {:?}", kind);
        Ok(())
    }

    pub fn complete(&self, history: &[ChatMessage]) -> Result<String> {
        let backend = match self.active() {
            LlmBackendKind::Cloud => self.cloud.as_ref(),
            LlmBackendKind::Local => self.local.as_ref(),
        }
        .context("no completion backend configured")?;

        debug!("Completing with {} over {} message(s)", backend.name(), history.len());
        backend.complete(history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openai_messages_carry_images_as_data_urls() {
        let history = vec![ChatMessage::system("sys"), ChatMessage { role: ChatRole::User, content: "look".into(), image: Some("QUJD".into()) }];
        let messages = openai_messages(&history);
        assert_eq!(messages[0]["content"], "sys");
        let url = messages[1]["content"][1]["image_url"]["url"].as_str().unwrap();
        assert_eq!(url, "data:image/jpeg;base64,QUJD");
    }

    #[test]
    fn plain_turns_stay_plain_strings() {
        let history = vec![ChatMessage::user("hello")];
        let messages = openai_messages(&history);
        assert_eq!(messages[0]["content"], "hello");
        assert_eq!(messages[0]["role"], "user");
    }
}
