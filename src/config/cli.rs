//! Command-line surface.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};

/// Which LLM backend answers by default. Switchable at runtime through the
/// `local_llm` / `cloud_llm` device handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LlmBackendKind {
    Cloud,
    #[default]
    Local,
}

/// Cloud completion provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CloudProvider {
    #[default]
    #[value(name = "openai")]
    OpenAi,
    Anthropic,
    Gemini,
}

/// How recognized text is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DispatchMode {
    /// Only the action table; unmatched text falls through per the
    /// `direct_only_llm_fallback` knob.
    DirectOnly,
    /// Action table first, LLM for everything unmatched.
    #[default]
    DirectFirst,
    /// Straight to the LLM.
    LlmOnly,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "dawnd")]
#[command(version, about = "DAWN voice assistant daemon", long_about = None)]
pub struct Cli {
    /// Capture device (logical name from the device table)
    #[arg(short = 'c', long = "capture")]
    pub capture: Option<String>,

    /// Playback device (logical name from the device table)
    #[arg(short = 'd', long = "playback")]
    pub playback: Option<String>,

    /// Log destination (default: stdout)
    #[arg(short = 'l', long = "logfile")]
    pub logfile: Option<PathBuf>,

    /// Enable the network audio gateway
    #[arg(short = 'N', long = "network-audio")]
    pub network_audio: bool,

    /// LLM backend selection
    #[arg(short = 'm', long = "llm", value_enum)]
    pub llm: Option<LlmBackendKind>,

    /// Cloud provider override
    #[arg(short = 'P', long = "cloud-provider", value_enum)]
    pub cloud_provider: Option<CloudProvider>,

    /// Match commands against the action table only
    #[arg(short = 'D', long = "direct-only", conflicts_with_all = ["direct_first", "llm_only"])]
    pub direct_only: bool,

    /// Try the action table first, fall back to the LLM
    #[arg(short = 'C', long = "direct-first", conflicts_with_all = ["direct_only", "llm_only"])]
    pub direct_first: bool,

    /// Hand everything to the LLM
    #[arg(short = 'L', long = "llm-only", conflicts_with_all = ["direct_only", "direct_first"])]
    pub llm_only: bool,

    /// Runtime settings file (default: ~/.config/dawn/dawn.toml)
    #[arg(long = "config")]
    pub config: Option<PathBuf>,

    /// Action/device table file (default: ~/.config/dawn/dawn_actions.json)
    #[arg(long = "actions")]
    pub actions: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

impl Cli {
    /// Dispatch mode from the `-D`/`-C`/`-L` flags, when one was given.
    pub fn dispatch_mode(&self) -> Option<DispatchMode> {
        if self.direct_only {
            Some(DispatchMode::DirectOnly)
        } else if self.direct_first {
            Some(DispatchMode::DirectFirst)
        } else if self.llm_only {
            Some(DispatchMode::LlmOnly)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_flags_map_to_modes() {
        let cli = Cli::parse_from(["dawnd", "-D"]);
        assert_eq!(cli.dispatch_mode(), Some(DispatchMode::DirectOnly));
        let cli = Cli::parse_from(["dawnd", "-C"]);
        assert_eq!(cli.dispatch_mode(), Some(DispatchMode::DirectFirst));
        let cli = Cli::parse_from(["dawnd", "-L"]);
        assert_eq!(cli.dispatch_mode(), Some(DispatchMode::LlmOnly));
        let cli = Cli::parse_from(["dawnd"]);
        assert_eq!(cli.dispatch_mode(), None);
    }

    #[test]
    fn mode_flags_conflict() {
        assert!(Cli::try_parse_from(["dawnd", "-D", "-L"]).is_err());
    }

    #[test]
    fn short_options_parse() {
        let cli = Cli::parse_from(["dawnd", "-c", "mic", "-d", "speaker", "-N", "-m", "cloud", "-P", "anthropic"]);
        assert_eq!(cli.capture.as_deref(), Some("mic"));
        assert_eq!(cli.playback.as_deref(), Some("speaker"));
        assert!(cli.network_audio);
        assert_eq!(cli.llm, Some(LlmBackendKind::Cloud));
        assert_eq!(cli.cloud_provider, Some(CloudProvider::Anthropic));
    }

    #[test]
    fn unknown_option_is_rejected() {
        assert!(Cli::try_parse_from(["dawnd", "--no-such-flag"]).is_err());
    }
}
