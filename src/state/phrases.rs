//! Wake, goodbye and cancel phrase tables and final-utterance
//! classification.
//!
//! Wake phrases are built at startup by substituting the configured AI
//! name into the greeting templates. All tables are case-sensitive literal
//! lists; the recognizer's own normalization (lowercase text) is relied on
//! upstream. Wake phrases are scanned in declaration order, first match
//! wins; goodbye and cancel matching is exact.

use crate::config::DispatchSettings;

pub struct PhraseTables {
    wake: Vec<String>,
    goodbye: Vec<String>,
    cancel: Vec<String>,
}

impl PhraseTables {
    pub fn build(ai_name: &str, settings: &DispatchSettings) -> Self {
        let wake = settings.greeting_templates.iter().map(|t| t.replace("%s", ai_name)).collect();
        Self { wake, goodbye: settings.goodbye_words.clone(), cancel: settings.cancel_words.clone() }
    }

    pub fn is_goodbye(&self, text: &str) -> bool {
        self.goodbye.iter().any(|w| w == text)
    }

    pub fn is_cancel(&self, text: &str) -> bool {
        self.cancel.iter().any(|w| w == text)
    }

    /// First wake phrase (declaration order) contained in `text`, with the
    /// byte range it occupies.
    pub fn find_wake(&self, text: &str) -> Option<(usize, usize)> {
        for phrase in &self.wake {
            if let Some(start) = text.find(phrase.as_str()) {
                return Some((start, start + phrase.len()));
            }
        }
        None
    }
}

/// What the listener should do with a finalized utterance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WakeOutcome {
    /// Farewell: set quit, discard playback, say goodbye.
    Goodbye,
    /// Cancel phrase while playback is paused: drop the paused speech.
    Cancel,
    /// Wake phrase at the very end: greet and arm command recording.
    WakeAtEnd,
    /// Wake phrase with trailing content: the content is the command.
    WakeWithCommand(String),
    /// Nothing recognized: resume playback and keep listening.
    Nothing,
}

pub fn classify(text: &str, phrases: &PhraseTables, playback_paused: bool) -> WakeOutcome {
    let text = text.trim();

    if phrases.is_goodbye(text) {
        return WakeOutcome::Goodbye;
    }
    if playback_paused && phrases.is_cancel(text) {
        return WakeOutcome::Cancel;
    }
    if let Some((_, end)) = phrases.find_wake(text) {
        let remainder = text[end..].trim_start_matches(|c: char| c.is_whitespace() || c == ',' || c == '.').trim();
        if remainder.is_empty() {
            return WakeOutcome::WakeAtEnd;
        }
        return WakeOutcome::WakeWithCommand(remainder.to_string());
    }
    WakeOutcome::Nothing
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables() -> PhraseTables {
        PhraseTables::build("friday", &DispatchSettings::default())
    }

    #[test]
    fn wake_phrases_substitute_the_ai_name() {
        let tables = tables();
        assert!(tables.find_wake("hello friday").is_some());
        assert!(tables.find_wake("hey friday").is_some());
        assert!(tables.find_wake("hello jarvis").is_none());
    }

    #[test]
    fn wake_at_end_arms_command_recording() {
        assert_eq!(classify("hello friday", &tables(), false), WakeOutcome::WakeAtEnd);
    }

    #[test]
    fn wake_with_trailing_content_carries_the_command() {
        assert_eq!(classify("hello friday what time is it", &tables(), false), WakeOutcome::WakeWithCommand("what time is it".into()));
    }

    #[test]
    fn leading_chatter_before_the_wake_phrase_is_dropped() {
        assert_eq!(classify("um hey friday turn on the lamp", &tables(), false), WakeOutcome::WakeWithCommand("turn on the lamp".into()));
    }

    #[test]
    fn goodbye_beats_everything() {
        assert_eq!(classify("bye", &tables(), true), WakeOutcome::Goodbye);
        assert_eq!(classify("goodbye", &tables(), false), WakeOutcome::Goodbye);
    }

    #[test]
    fn cancel_requires_paused_playback() {
        assert_eq!(classify("stop", &tables(), true), WakeOutcome::Cancel);
        assert_eq!(classify("stop", &tables(), false), WakeOutcome::Nothing);
    }

    #[test]
    fn goodbye_and_cancel_are_exact_matches() {
        assert_eq!(classify("stop it now", &tables(), true), WakeOutcome::Nothing);
        assert_eq!(classify("bye bye birdie", &tables(), false), WakeOutcome::Nothing);
    }

    #[test]
    fn declaration_order_breaks_ties() {
        // "hello friday" is declared before "hey friday"; a text containing
        // both resolves to the first.
        let tables = tables();
        let text = "hey friday hello friday";
        let (start, _) = tables.find_wake(text).unwrap();
        assert_eq!(&text[start..start + 5], "hello");
    }
}
