//! Runtime settings from `dawn.toml`, overridable through `DAWN_`-prefixed
//! environment variables.
//!
//! Every field has a default so a partial (or missing) file still yields a
//! working configuration. Secrets never live here; API keys and MQTT
//! credentials come from the environment at the point of use.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Hardware acceleration provider for the ONNX models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    Cpu,
    Cuda,
    #[serde(rename = "coreml")]
    CoreMl,
}

impl Provider {
    pub fn as_sherpa_provider(&self) -> &'static str {
        match self {
            Provider::Cpu => "cpu",
            Provider::Cuda => "cuda",
            Provider::CoreMl => "coreml",
        }
    }

    /// Best available provider for this platform.
    pub fn detect() -> Self {
        #[cfg(target_os = "macos")]
        {
            Provider::CoreMl
        }
        #[cfg(target_os = "linux")]
        {
            if Path::new("/dev/nvidiactl").exists() || Path::new("/etc/nv_tegra_release").exists() { Provider::Cuda } else { Provider::Cpu }
        }
        #[cfg(not(any(target_os = "macos", target_os = "linux")))]
        {
            Provider::Cpu
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenSettings {
    /// Length of each capture buffer in the listening loop.
    pub capture_seconds: f64,
    /// Ambient sampling window at startup.
    pub ambient_seconds: f64,
    /// RMS above ambient that counts as talking.
    pub talking_offset: f64,
    /// Consecutive quiet iterations before an utterance finalizes.
    pub command_timeout: u32,
}

impl Default for ListenSettings {
    fn default() -> Self {
        Self { capture_seconds: 0.5, ambient_seconds: 6.0, talking_offset: 0.025, command_timeout: 3 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SttSettings {
    pub model_dir: PathBuf,
    pub language: String,
    pub threads: usize,
    pub provider: Option<Provider>,
}

impl Default for SttSettings {
    fn default() -> Self {
        Self { model_dir: default_model_dir(), language: "en".into(), threads: 0, provider: None }
    }
}

impl SttSettings {
    pub fn provider(&self) -> Provider {
        self.provider.unwrap_or_else(Provider::detect)
    }

    /// Worker threads for the recognizer; 0 picks a share of the cores,
    /// leaving headroom for TTS and the rest of the daemon.
    pub fn effective_threads(&self) -> usize {
        if self.threads > 0 { self.threads } else { (num_cpus::get() / 3).max(1) }
    }

    pub fn encoder_path(&self) -> PathBuf {
        self.model_dir.join("whisper").join("whisper-small-encoder.int8.onnx")
    }

    pub fn decoder_path(&self) -> PathBuf {
        self.model_dir.join("whisper").join("whisper-small-decoder.int8.onnx")
    }

    pub fn tokens_path(&self) -> PathBuf {
        self.model_dir.join("whisper").join("whisper-small-tokens.txt")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsSettings {
    pub model_dir: PathBuf,
    pub speaker_id: i32,
    pub speed: f32,
    pub threads: usize,
    pub provider: Option<Provider>,
}

impl Default for TtsSettings {
    fn default() -> Self {
        Self { model_dir: default_model_dir(), speaker_id: 2, speed: 0.93, threads: 0, provider: None }
    }
}

impl TtsSettings {
    pub fn provider(&self) -> Provider {
        self.provider.unwrap_or_else(Provider::detect)
    }

    pub fn effective_threads(&self) -> usize {
        if self.threads > 0 { self.threads } else { (num_cpus::get() / 3).max(1) }
    }

    fn kokoro_dir(&self) -> PathBuf {
        self.model_dir.join("tts").join("kokoro-multi-lang-v1_0")
    }

    pub fn model_path(&self) -> PathBuf {
        self.kokoro_dir().join("model.onnx")
    }

    pub fn voices_path(&self) -> PathBuf {
        self.kokoro_dir().join("voices.bin")
    }

    pub fn tokens_path(&self) -> PathBuf {
        self.kokoro_dir().join("tokens.txt")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.kokoro_dir().join("espeak-ng-data")
    }

    pub fn dict_dir(&self) -> PathBuf {
        self.kokoro_dir().join("dict")
    }

    pub fn lexicon(&self) -> String {
        self.kokoro_dir().join("lexicon-us-en.txt").to_string_lossy().to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub openai_url: String,
    pub openai_model: String,
    pub anthropic_url: String,
    pub anthropic_model: String,
    pub gemini_url: String,
    pub gemini_model: String,
    pub local_url: String,
    pub local_model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub request_timeout_secs: u64,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            openai_url: "https://api.openai.com".into(),
            openai_model: "gpt-4o-mini".into(),
            anthropic_url: "https://api.anthropic.com".into(),
            anthropic_model: "claude-sonnet-4-20250514".into(),
            gemini_url: "https://generativelanguage.googleapis.com".into(),
            gemini_model: "gemini-2.0-flash".into(),
            local_url: "http://localhost:11434".into(),
            local_model: "gemma3:1b".into(),
            temperature: 0.7,
            max_tokens: 1024,
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttSettings {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub keep_alive_secs: u64,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self { enabled: true, host: "localhost".into(), port: 1883, keep_alive_secs: 30 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    pub enabled: bool,
    pub port: u16,
    /// Per-session socket read/write timeout.
    pub session_timeout_secs: u64,
    /// How long a gateway worker waits for the state machine's reply.
    pub response_timeout_secs: u64,
    /// Retransmission cap per frame.
    pub max_retries: u32,
    /// Byte cap on reply WAVs; larger replies truncate on frame boundaries.
    pub max_response_bytes: usize,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self { enabled: false, port: 5000, session_timeout_secs: 30, response_timeout_secs: 30, max_retries: 3, max_response_bytes: 2 * 1024 * 1024 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSettings {
    pub mode: super::DispatchMode,
    /// Bounded wait for each tool result.
    pub tool_timeout_secs: u64,
    /// Hard cap on LLM↔tool round trips per turn.
    pub max_tool_iterations: u32,
    /// DirectOnly mode: hand unmatched text to the LLM anyway.
    pub direct_only_llm_fallback: bool,
    pub greeting_templates: Vec<String>,
    pub goodbye_words: Vec<String>,
    pub cancel_words: Vec<String>,
    pub ignore_words: Vec<String>,
    pub greeting_reply: String,
    pub farewell_reply: String,
    pub busy_reply: String,
    pub unavailable_reply: String,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            mode: super::DispatchMode::default(),
            tool_timeout_secs: 5,
            max_tool_iterations: 4,
            direct_only_llm_fallback: true,
            greeting_templates: vec!["hello %s".into(), "hey %s".into(), "hi %s".into(), "okay %s".into(), "good morning %s".into()],
            goodbye_words: vec!["bye".into(), "goodbye".into(), "bye bye".into(), "see you later".into()],
            cancel_words: vec!["stop".into(), "cancel".into(), "never mind".into(), "quiet".into()],
            ignore_words: vec!["the".into(), "huh".into(), "hmm".into()],
            greeting_reply: "Yes?".into(),
            farewell_reply: "Goodbye sir.".into(),
            busy_reply: "I'm currently busy. Please try again in a moment.".into(),
            unavailable_reply: "I'm currently unavailable. Please try again later.".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub listen: ListenSettings,
    pub stt: SttSettings,
    pub tts: TtsSettings,
    pub llm: LlmSettings,
    pub mqtt: MqttSettings,
    pub network: NetworkSettings,
    pub dispatch: DispatchSettings,
}

fn default_model_dir() -> PathBuf {
    dirs::home_dir().map(|h| h.join(".dawn").join("models")).unwrap_or_else(|| PathBuf::from("models"))
}

/// Default settings path: `~/.config/dawn/dawn.toml`.
pub fn default_settings_path() -> PathBuf {
    dirs::config_dir().map(|c| c.join("dawn").join("dawn.toml")).unwrap_or_else(|| PathBuf::from("dawn.toml"))
}

impl Settings {
    /// Load from `path` (a missing file yields pure defaults), then apply
    /// environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut settings = if path.exists() {
            let raw = std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
            toml::from_str(&raw).with_context(|| format!("malformed settings file {}", path.display()))?
        } else {
            info!("No settings file at {}, using defaults", path.display());
            Self::default()
        };

        settings.apply_env_overrides(|name| std::env::var(name).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    /// Overlay `DAWN_<SECTION>_<KEY>` environment variables onto the
    /// parsed tree. The variable value is parsed with the type of the
    /// field it replaces.
    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let mut tree = toml::Value::try_from(&*self).context("settings serialization failed")?;

        if let toml::Value::Table(sections) = &mut tree {
            for (section_name, section) in sections.iter_mut() {
                let toml::Value::Table(fields) = section else { continue };
                for (key, value) in fields.iter_mut() {
                    let var = format!("DAWN_{}_{}", section_name.to_uppercase(), key.to_uppercase());
                    let Some(raw) = lookup(&var) else { continue };
                    debug!("Settings override from {}", var);
                    *value = parse_as(&raw, value).with_context(|| format!("cannot parse {var}={raw}"))?;
                }
            }
        }

        *self = tree.try_into().context("settings overlay produced an invalid configuration")?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.listen.talking_offset <= 0.0 {
            bail!("listen.talking_offset must be positive");
        }
        if self.listen.command_timeout == 0 {
            bail!("listen.command_timeout must be at least 1");
        }
        if self.dispatch.max_tool_iterations == 0 {
            bail!("dispatch.max_tool_iterations must be at least 1");
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            bail!("llm.temperature must be between 0.0 and 2.0");
        }
        if self.tts.speed <= 0.0 {
            bail!("tts.speed must be positive");
        }
        Ok(())
    }
}

/// Parse `raw` with the same TOML type as `like`.
fn parse_as(raw: &str, like: &toml::Value) -> Result<toml::Value> {
    Ok(match like {
        toml::Value::Boolean(_) => toml::Value::Boolean(raw.parse()?),
        toml::Value::Integer(_) => toml::Value::Integer(raw.parse()?),
        toml::Value::Float(_) => toml::Value::Float(raw.parse()?),
        toml::Value::Array(_) => toml::Value::Array(raw.split(',').map(|s| toml::Value::String(s.trim().to_string())).collect()),
        _ => toml::Value::String(raw.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.network.port, 5000);
        assert_eq!(settings.listen.command_timeout, 3);
        assert!((settings.listen.talking_offset - 0.025).abs() < 1e-9);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let settings: Settings = toml::from_str("[network]\nport = 6000\n").unwrap();
        assert_eq!(settings.network.port, 6000);
        assert_eq!(settings.mqtt.port, 1883);
    }

    #[test]
    fn env_overrides_replace_typed_fields() {
        let mut settings = Settings::default();
        settings
            .apply_env_overrides(|name| match name {
                "DAWN_NETWORK_PORT" => Some("7000".into()),
                "DAWN_MQTT_ENABLED" => Some("false".into()),
                "DAWN_LISTEN_TALKING_OFFSET" => Some("0.05".into()),
                "DAWN_LLM_LOCAL_MODEL" => Some("llama3".into()),
                _ => None,
            })
            .unwrap();

        assert_eq!(settings.network.port, 7000);
        assert!(!settings.mqtt.enabled);
        assert!((settings.listen.talking_offset - 0.05).abs() < 1e-9);
        assert_eq!(settings.llm.local_model, "llama3");
    }

    #[test]
    fn bad_override_value_is_an_error() {
        let mut settings = Settings::default();
        let result = settings.apply_env_overrides(|name| (name == "DAWN_NETWORK_PORT").then(|| "not-a-number".into()));
        assert!(result.is_err());
    }

    #[test]
    fn out_of_range_temperature_fails_validation() {
        let mut settings = Settings::default();
        settings.llm.temperature = 3.0;
        assert!(settings.validate().is_err());
    }
}
