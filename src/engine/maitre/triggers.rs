// ── Waystation Engine: Sovereign Triggers ──────────────────────────────────
// Deterministic pattern → action routing that runs before the classifier
// model. First match wins; a hit saves a model call for command-like inputs.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Exact,
    Prefix,
    ContainsPhrase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    ToolCall,
    UiControl,
    Menu,
    SystemPrompt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SovereignTrigger {
    pub pattern: String,
    pub match_kind: MatchKind,
    pub action_kind: ActionKind,
    #[serde(default)]
    pub action_payload: Value,
}

impl SovereignTrigger {
    /// Case-insensitive match against a user message.
    pub fn matches(&self, input: &str) -> bool {
        let input = input.trim().to_lowercase();
        let pattern = self.pattern.to_lowercase();
        match self.match_kind {
            MatchKind::Exact => input == pattern,
            MatchKind::Prefix => input.starts_with(&pattern),
            MatchKind::ContainsPhrase => input.contains(&pattern),
        }
    }
}

/// Run the trigger list in order; the first match wins.
pub fn first_match<'a>(input: &str, triggers: &'a [SovereignTrigger]) -> Option<&'a SovereignTrigger> {
    triggers.iter().find(|t| t.matches(input))
}

/// Parse the trigger list from its config JSON.
pub fn parse_triggers(raw: &str) -> Vec<SovereignTrigger> {
    serde_json::from_str(raw).unwrap_or_default()
}

// ── Tests ──────────────────────────────────────────────────────────────────
