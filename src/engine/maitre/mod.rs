// ── Waystation Engine: Maître d' (Intent Classifier) ───────────────────────
//
// Curates the per-request tool menu: which MCP servers this request should
// see, which advice topics apply, and whether a local system action was
// requested. Resolution order:
//   1. sovereign triggers (deterministic, no model call)
//   2. a small-context call to the classifier model, validated against the
//      decision schema
//   3. on malformed classifier output: the conservative default (no servers,
//      no action) — a bad classifier answer must never crash the agent loop.
//
// Past wins from the learning journal are appended to the prompt as recall
// hints.

pub mod learning;
pub mod triggers;

use crate::atoms::constants::MAITRE_CONTEXT_MESSAGES;
use crate::atoms::types::{Message, Role};
use crate::engine::config::ConfigStore;
use crate::engine::providers::{ProviderParams, ProviderRegistry};
use learning::FeedbackJournal;
use log::{info, warn};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use triggers::SovereignTrigger;
use uuid::Uuid;

/// The constraints the classifier prompt must encode. Their semantics are
/// fixed; the numbering is part of the contract.
const INTENT_CONSTRAINTS: &str = "\
(1) never select ambient tools (time, location)\n\
(3) generic web -> fetch/browse\n\
(4) file verbs -> filesystem\n\
(5) admin verbs -> system/admin\n\
(6) topic match -> advice_topics\n\
(7) local verbs (help/prompt/restart/emoji) -> system_action\n\
(9) news/headlines -> web search\n\
(10) breaking/current -> web search\n\
(11) memory verbs (recall/remember/preferences) -> memory";

/// Validated classifier decision.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MenuDecision {
    pub target_servers: Vec<String>,
    pub advice_topics: Vec<String>,
    pub system_action: Option<String>,
}

/// What the maître d' decided for this request.
#[derive(Debug, Clone)]
pub enum MaitreOutcome {
    /// A sovereign trigger fired; the agent short-circuits the model.
    Trigger(SovereignTrigger),
    /// Menu decision (from the classifier or the conservative default).
    Menu(MenuDecision),
}

pub struct Maitre {
    providers: Arc<ProviderRegistry>,
    config: Arc<ConfigStore>,
    journal: FeedbackJournal,
    triggers: RwLock<Vec<SovereignTrigger>>,
}

impl Maitre {
    pub fn new(providers: Arc<ProviderRegistry>, config: Arc<ConfigStore>, journal: FeedbackJournal) -> Self {
        let maitre = Maitre {
            providers,
            config,
            journal,
            triggers: RwLock::new(Vec::new()),
        };
        maitre.reload_triggers();
        maitre
    }

    /// Load the trigger list from config (boot and on config reload).
    pub fn reload_triggers(&self) {
        let raw = self.config.get_or("sovereign_triggers", "[]");
        let parsed = triggers::parse_triggers(&raw);
        info!("[maitre] {} sovereign triggers loaded", parsed.len());
        *self.triggers.write() = parsed;
    }

    /// Record a successful (query, server) pairing for future recall.
    pub fn record_success(&self, query: &str, server: &str) {
        self.journal.record_success(query, server);
    }

    /// Decide the tool menu for one request.
    pub async fn curate(
        &self,
        messages: &[Message],
        known_servers: &[String],
        request_id: Option<Uuid>,
    ) -> MaitreOutcome {
        let latest = latest_user_text(messages);

        // 1. Sovereign trigger fast path
        if let Some(trigger) = triggers::first_match(&latest, &self.triggers.read()) {
            info!("[maitre] Trigger matched: '{}'", trigger.pattern);
            return MaitreOutcome::Trigger(trigger.clone());
        }

        // 2. Classifier model
        let hints = self.journal.recall_hints(&latest);
        match self
            .classify(&latest, messages, known_servers, &hints, request_id)
            .await
        {
            Some(decision) => MaitreOutcome::Menu(decision),
            // 3. Conservative default: empty menu, no action
            None => {
                warn!("[maitre] Falling back to conservative default menu");
                MaitreOutcome::Menu(MenuDecision::default())
            }
        }
    }

    async fn classify(
        &self,
        latest: &str,
        messages: &[Message],
        known_servers: &[String],
        hints: &[(String, f64)],
        request_id: Option<Uuid>,
    ) -> Option<MenuDecision> {
        let (provider, model) = self.classifier_model();
        let prompt = build_prompt(latest, messages, known_servers, hints, &self.advice_topics());

        let outcome = self
            .providers
            .chat(
                &provider,
                &model,
                &[
                    Message::system(
                        "You are a tool-menu classifier. Answer with a single JSON object and nothing else.",
                    ),
                    Message::user(prompt),
                ],
                &[],
                ProviderParams {
                    temperature: Some(0.0),
                    max_tokens: Some(300),
                    top_p: None,
                },
                request_id,
            )
            .await;

        let text = match outcome {
            Ok(o) => o.text,
            Err(e) => {
                warn!("[maitre] Classifier call failed: {}", e);
                return None;
            }
        };
        let parsed = extract_json(&text)?;
        validate_decision(&parsed, known_servers)
    }

    /// `classifier_model` config is `<provider>:<model>`; defaults to the
    /// native engine with the offline fallback model, so classification
    /// works without internet.
    fn classifier_model(&self) -> (String, String) {
        let configured = self.config.get_or("classifier_model", "");
        if let Some((provider, model)) = configured.split_once(':') {
            if !provider.is_empty() && !model.is_empty() {
                return (provider.to_string(), model.to_string());
            }
        }
        let fallback = self
            .config
            .get("WAYSTATION_FALLBACK_MODEL")
            .or_else(|| self.config.get("fallback_model"))
            .unwrap_or_else(|| "llama3.2".to_string());
        (self.providers.native_name(), fallback)
    }

    fn advice_topics(&self) -> Vec<String> {
        let raw = self.config.get_or("advice_topics", "[]");
        serde_json::from_str(&raw).unwrap_or_default()
    }
}

// ── Prompt & parsing ───────────────────────────────────────────────────────

fn latest_user_text(messages: &[Message]) -> String {
    messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.as_text())
        .unwrap_or_default()
}

fn build_prompt(
    latest: &str,
    messages: &[Message],
    known_servers: &[String],
    hints: &[(String, f64)],
    advice_topics: &[String],
) -> String {
    let mut context: Vec<String> = messages
        .iter()
        .rev()
        .skip(1)
        .take(MAITRE_CONTEXT_MESSAGES)
        .map(|m| format!("{:?}: {}", m.role, crate::atoms::types::truncate_utf8(&m.content.as_text(), 200)))
        .collect();
    context.reverse();

    let mut prompt = format!(
        "Pick the tool servers this request needs.\n\n\
        Available servers: {}\n\
        Advice topics: {}\n\n\
        Constraints:\n{}\n\n\
        Recent context:\n{}\n\n\
        User message: {}\n\n\
        Reply with JSON: {{\"target_servers\": [...], \"advice_topics\": [...], \"system_action\": \"help\"|\"restart\"|null}}",
        known_servers.join(", "),
        advice_topics.join(", "),
        INTENT_CONSTRAINTS,
        context.join("\n"),
        latest,
    );
    if !hints.is_empty() {
        let listed: Vec<String> = hints
            .iter()
            .map(|(server, score)| format!("{server} ({score:.2})"))
            .collect();
        prompt.push_str(&format!(
            "\n\nServers that handled similar past requests well: {}",
            listed.join(", ")
        ));
    }
    prompt
}

/// Pull the first JSON object out of model text (models love to wrap JSON in
/// prose or code fences).
fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        return Some(v);
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&trimmed[start..=end]).ok()
}

/// Schema validation: unknown servers are dropped, system_action is clamped
/// to the allowed verbs, and a non-object answer is rejected outright.
fn validate_decision(parsed: &Value, known_servers: &[String]) -> Option<MenuDecision> {
    let obj = parsed.as_object()?;
    let target_servers: Vec<String> = obj
        .get("target_servers")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|s| s.as_str())
                .filter(|s| known_servers.iter().any(|k| k == s))
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default();
    let advice_topics: Vec<String> = obj
        .get("advice_topics")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|s| s.as_str())
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default();
    let system_action = obj
        .get("system_action")
        .and_then(|v| v.as_str())
        .filter(|a| matches!(*a, "help" | "restart"))
        .map(|a| a.to_string());
    Some(MenuDecision {
        target_servers,
        advice_topics,
        system_action,
    })
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extract_json_handles_fences_and_prose() {
        let v = extract_json("Sure! ```json\n{\"target_servers\": []}\n```").unwrap();
        assert!(v["target_servers"].as_array().unwrap().is_empty());
        assert!(extract_json("no json here").is_none());
        assert!(extract_json("{\"a\": 1}").is_some());
    }

    #[test]
    fn validate_drops_unknown_servers() {
        let known = vec!["fs".to_string(), "web".to_string()];
        let decision = validate_decision(
            &json!({"target_servers": ["fs", "ghost"], "advice_topics": ["cooking"], "system_action": null}),
            &known,
        )
        .unwrap();
        assert_eq!(decision.target_servers, vec!["fs"]);
        assert_eq!(decision.advice_topics, vec!["cooking"]);
        assert!(decision.system_action.is_none());
    }

    #[test]
    fn validate_clamps_system_action() {
        let decision = validate_decision(
            &json!({"target_servers": [], "system_action": "rm -rf"}),
            &[],
        )
        .unwrap();
        assert!(decision.system_action.is_none());

        let decision =
            validate_decision(&json!({"system_action": "restart"}), &[]).unwrap();
        assert_eq!(decision.system_action.as_deref(), Some("restart"));
    }

    #[test]
    fn validate_rejects_non_objects() {
        assert!(validate_decision(&json!([1, 2]), &[]).is_none());
        assert!(validate_decision(&json!("text"), &[]).is_none());
    }

    #[test]
    fn prompt_carries_constraints_and_hints() {
        let prompt = build_prompt(
            "what's in the news",
            &[Message::user("what's in the news")],
            &["web_search".to_string()],
            &[("web_search".to_string(), 1.7)],
            &["cooking".to_string()],
        );
        assert!(prompt.contains("(9) news/headlines -> web search"));
        assert!(prompt.contains("(1) never select ambient tools"));
        assert!(prompt.contains("web_search (1.70)"));
        assert!(prompt.contains("cooking"));
    }

    #[test]
    fn latest_user_text_finds_last_user_message() {
        let messages = vec![
            Message::user("first"),
            Message::assistant("reply"),
            Message::user("second"),
        ];
        assert_eq!(latest_user_text(&messages), "second");
        assert_eq!(latest_user_text(&[]), "");
    }
}
