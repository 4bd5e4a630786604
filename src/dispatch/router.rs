//! Direct action matching.
//!
//! Each configured action carries a wildcard pattern deciding whether an
//! utterance triggers it and a template describing how to pull the argument
//! out of the utterance. Templates are parsed once at load into explicit
//! extraction rules; no scanf-style interpretation happens at match time.

use anyhow::{Context, Result};
use regex::Regex;

use crate::config::ActionEntry;

/// Argument extraction rule parsed from an action template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgTemplate {
    /// `prefix %s`: the argument is everything after the literal prefix.
    Suffix { prefix: String },
    /// `prefix %s suffix`: the argument sits between two literals.
    Infix { prefix: String, suffix: String },
    /// No slot; a match carries no argument.
    Literal,
}

impl ArgTemplate {
    /// Parse a template string. At most one `%s` slot is honored.
    pub fn parse(template: &str) -> Self {
        match template.split_once("%s") {
            None => ArgTemplate::Literal,
            Some((prefix, suffix)) if suffix.trim().is_empty() => ArgTemplate::Suffix { prefix: prefix.to_string() },
            Some((prefix, suffix)) => ArgTemplate::Infix { prefix: prefix.to_string(), suffix: suffix.to_string() },
        }
    }

    /// Pull the argument substring out of an utterance.
    pub fn extract<'a>(&self, utterance: &'a str) -> Option<&'a str> {
        match self {
            ArgTemplate::Literal => Some(""),
            ArgTemplate::Suffix { prefix } => {
                let at = find_ci(utterance, prefix.trim())?;
                Some(utterance[at + prefix.trim().len()..].trim())
            }
            ArgTemplate::Infix { prefix, suffix } => {
                let start = find_ci(utterance, prefix.trim())? + prefix.trim().len();
                let rest = &utterance[start..];
                let end = find_ci(rest, suffix.trim()).unwrap_or(rest.len());
                Some(rest[..end].trim())
            }
        }
    }
}

/// Case-insensitive substring search returning the byte offset.
fn find_ci(haystack: &str, needle: &str) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.to_lowercase().find(&needle.to_lowercase())
}

/// Compiled action: the config entry plus its anchored wildcard regex and
/// parsed argument template.
#[derive(Debug, Clone)]
pub struct ActionSpec {
    pub entry: ActionEntry,
    pattern: Regex,
    template: ArgTemplate,
}

/// Translate a `*`-glob wildcard into an anchored case-insensitive regex.
fn compile_wildcard(wildcard: &str) -> Result<Regex> {
    let mut pattern = String::with_capacity(wildcard.len() + 8);
    pattern.push_str("(?i)^");
    for c in wildcard.chars() {
        match c {
            '*' => pattern.push_str(".*"),
            c => pattern.push_str(&regex::escape(&c.to_string())),
        }
    }
    pattern.push('$');
    Regex::new(&pattern).with_context(|| format!("invalid wildcard pattern \"{wildcard}\""))
}

/// A matched action with its filled payload.
#[derive(Debug, Clone)]
pub struct DirectMatch<'a> {
    pub action: &'a ActionSpec,
    pub payload: String,
}

pub struct ActionRouter {
    actions: Vec<ActionSpec>,
}

impl ActionRouter {
    pub fn compile(entries: &[ActionEntry]) -> Result<Self> {
        let actions = entries
            .iter()
            .map(|entry| {
                Ok(ActionSpec { entry: entry.clone(), pattern: compile_wildcard(&entry.wildcard)?, template: ArgTemplate::parse(&entry.template) })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { actions })
    }

    /// First action (declaration order) whose wildcard matches, with the
    /// payload template filled from the extracted argument.
    pub fn match_action(&self, utterance: &str) -> Option<DirectMatch<'_>> {
        let utterance = utterance.trim();
        for action in &self.actions {
            if !action.pattern.is_match(utterance) {
                continue;
            }
            let argument = action.template.extract(utterance).unwrap_or("");
            let payload = action.entry.command.replace("%s", argument);
            return Some(DirectMatch { action, payload });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(wildcard: &str, template: &str, command: &str) -> ActionEntry {
        ActionEntry {
            name: "test action".into(),
            device: "lights".into(),
            wildcard: wildcard.into(),
            template: template.into(),
            command: command.into(),
            topic: "home/lights".into(),
        }
    }

    #[test]
    fn suffix_template_takes_the_tail() {
        let template = ArgTemplate::parse("turn on the %s");
        assert_eq!(template.extract("turn on the living room lamp"), Some("living room lamp"));
    }

    #[test]
    fn infix_template_takes_the_middle() {
        let template = ArgTemplate::parse("set %s please");
        assert_eq!(template, ArgTemplate::Infix { prefix: "set ".into(), suffix: " please".into() });
        assert_eq!(template.extract("set kitchen lights please"), Some("kitchen lights"));
    }

    #[test]
    fn literal_template_has_no_argument() {
        let template = ArgTemplate::parse("what time is it");
        assert_eq!(template, ArgTemplate::Literal);
        assert_eq!(template.extract("what time is it"), Some(""));
    }

    #[test]
    fn wildcard_matching_is_first_wins() {
        let router = ActionRouter::compile(&[
            entry("*turn on*", "turn on %s", r#"{"action":"on","value":"%s"}"#),
            entry("*turn*", "turn %s", r#"{"action":"any","value":"%s"}"#),
        ])
        .unwrap();

        let matched = router.match_action("please turn on the lamp").unwrap();
        assert_eq!(matched.payload, r#"{"action":"on","value":"the lamp"}"#);
    }

    #[test]
    fn wildcard_is_anchored() {
        let router = ActionRouter::compile(&[entry("lights off", "lights off", "{}")]).unwrap();
        assert!(router.match_action("lights off").is_some());
        assert!(router.match_action("turn the lights off now").is_none());
    }

    #[test]
    fn wildcard_escapes_regex_metacharacters() {
        let router = ActionRouter::compile(&[entry("what's up*", "what's up %s", r#"{"v":"%s"}"#)]).unwrap();
        assert!(router.match_action("what's up doc").is_some());
        assert!(router.match_action("whats upX").is_none());
    }

    #[test]
    fn unmatched_utterance_returns_none() {
        let router = ActionRouter::compile(&[entry("*music*", "play %s", "{}")]).unwrap();
        assert!(router.match_action("what time is it").is_none());
    }
}
