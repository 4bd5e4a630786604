//! Configuration: CLI arguments, TOML runtime knobs with environment
//! overrides, and the JSON action/device table.

mod actions;
mod cli;
mod settings;

pub use actions::{ActionEntry, ActionsFile, DeviceEntry, default_actions_path};
pub use cli::{Cli, CloudProvider, DispatchMode, LlmBackendKind};
pub use settings::{
    DispatchSettings, ListenSettings, LlmSettings, MqttSettings, NetworkSettings, Provider, Settings, SttSettings, TtsSettings, default_settings_path,
};
