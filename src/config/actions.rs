//! Action table, device lists and the AI name, loaded once from
//! `dawn_actions.json`. Shape errors here are fatal at startup.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tracing::info;

/// One configured voice action.
#[derive(Debug, Clone, Deserialize)]
pub struct ActionEntry {
    /// Human-readable action name.
    pub name: String,
    /// Device tag; built-in tags resolve to local handlers.
    pub device: String,
    /// Wildcard pattern with `*` globs matched against the utterance.
    pub wildcard: String,
    /// Argument-extraction template (`turn on %s` style).
    pub template: String,
    /// Payload template with one `%s` slot for the extracted argument.
    pub command: String,
    /// MQTT topic the filled payload is published on.
    pub topic: String,
}

/// `(logical name, driver id)` pair from the device tables.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceEntry {
    pub name: String,
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActionsFile {
    pub ai_name: String,
    #[serde(default)]
    pub actions: Vec<ActionEntry>,
    #[serde(default)]
    pub capture_devices: Vec<DeviceEntry>,
    #[serde(default)]
    pub playback_devices: Vec<DeviceEntry>,
}

/// Default actions path: `~/.config/dawn/dawn_actions.json`.
pub fn default_actions_path() -> PathBuf {
    dirs::config_dir().map(|c| c.join("dawn").join("dawn_actions.json")).unwrap_or_else(|| PathBuf::from("dawn_actions.json"))
}

impl ActionsFile {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).with_context(|| format!("failed to read action table {}", path.display()))?;
        let file: ActionsFile = serde_json::from_str(&raw).with_context(|| format!("malformed action table {}", path.display()))?;
        file.validate()?;
        info!("Loaded {} action(s), {} capture / {} playback device(s), AI name \"{}\"",
            file.actions.len(), file.capture_devices.len(), file.playback_devices.len(), file.ai_name);
        Ok(file)
    }

    fn validate(&self) -> Result<()> {
        if self.ai_name.trim().is_empty() {
            bail!("ai_name must not be empty");
        }
        for action in &self.actions {
            if action.wildcard.trim().is_empty() {
                bail!("action \"{}\" has an empty wildcard", action.name);
            }
            if action.topic.trim().is_empty() {
                bail!("action \"{}\" has an empty topic", action.name);
            }
        }
        check_unique("capture", &self.capture_devices)?;
        check_unique("playback", &self.playback_devices)?;
        Ok(())
    }

    pub fn find_capture(&self, name: &str) -> Option<&DeviceEntry> {
        self.capture_devices.iter().find(|d| d.name == name)
    }

    pub fn find_playback(&self, name: &str) -> Option<&DeviceEntry> {
        self.playback_devices.iter().find(|d| d.name == name)
    }
}

fn check_unique(kind: &str, devices: &[DeviceEntry]) -> Result<()> {
    let mut seen = HashSet::new();
    for device in devices {
        if !seen.insert(device.name.as_str()) {
            bail!("duplicate {kind} device name \"{}\"", device.name);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> &'static str {
        r#"{
            "ai_name": "friday",
            "actions": [
                {"name": "lights on", "device": "lights", "wildcard": "*turn on the * light*",
                 "template": "turn on the %s", "command": "{\"device\":\"lights\",\"action\":\"on\",\"value\":\"%s\"}",
                 "topic": "home/lights"}
            ],
            "capture_devices": [{"name": "desk mic", "id": "hw:1,0"}],
            "playback_devices": [{"name": "speakers", "id": "hw:0,0"}]
        }"#
    }

    #[test]
    fn parses_and_validates() {
        let file: ActionsFile = serde_json::from_str(sample_json()).unwrap();
        file.validate().unwrap();
        assert_eq!(file.ai_name, "friday");
        assert_eq!(file.actions.len(), 1);
        assert!(file.find_capture("desk mic").is_some());
        assert!(file.find_playback("desk mic").is_none());
    }

    #[test]
    fn duplicate_device_names_are_fatal() {
        let mut file: ActionsFile = serde_json::from_str(sample_json()).unwrap();
        file.capture_devices.push(DeviceEntry { name: "desk mic".into(), id: "hw:2,0".into() });
        assert!(file.validate().is_err());
    }

    #[test]
    fn empty_ai_name_is_fatal() {
        let mut file: ActionsFile = serde_json::from_str(sample_json()).unwrap();
        file.ai_name = " ".into();
        assert!(file.validate().is_err());
    }
}
