// ── Waystation Engine: Agent Loop Helpers ──────────────────────────────────
// Self-contained sub-operations pulled out of `run_agent_turn`: empty
// response nudging, tool-call repetition detection, and per-tool failure
// tracking. Keeps the main loop focused on orchestration.

use crate::atoms::types::{Message, Role, ToolCall};
use log::warn;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

/// After this many consecutive failures of one tool, inject a stop-retry
/// nudge.
pub const MAX_CONSECUTIVE_TOOL_FAILS: u32 = 3;
/// After this many, block the tool entirely for the rest of the turn.
pub const HARD_STOP_TOOL_FAILS: u32 = 5;
/// Identical tool-call rounds tolerated before breaking the loop.
pub const MAX_REPEATED_SIGNATURES: usize = 3;

// ── Empty response nudge ───────────────────────────────────────────────────

/// When the model returns neither text nor tool calls, inject a system nudge
/// recapping the user's request. Retries on rounds 1-2 only.
/// Returns `true` if a nudge was injected (caller should `continue`).
pub fn handle_empty_response(
    final_text: &str,
    messages: &mut Vec<Message>,
    round: u32,
    max_rounds: u32,
) -> bool {
    if !final_text.is_empty() || round > 2 || round >= max_rounds {
        return false;
    }

    warn!(
        "[agent] Model returned empty response at round {} — injecting nudge and retrying",
        round
    );

    let recap = messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| {
            let text = m.content.as_text();
            crate::atoms::types::truncate_utf8(&text, 300).to_string()
        })
        .unwrap_or_default();

    let nudge = if recap.is_empty() {
        "[SYSTEM] The model returned an empty response. Retry the user's request. Use tools if needed."
            .to_string()
    } else {
        format!(
            "[SYSTEM] The model returned an empty response. The user's request is: \"{recap}\"\n\
            Respond to this request directly. Use tools if needed."
        )
    };
    messages.push(Message::system(nudge));
    true
}

/// Static fallback for persistently empty responses.
pub fn empty_response_fallback() -> String {
    "I wasn't able to generate a response. The model returned empty output \
    repeatedly — try rephrasing the request or switching models."
        .to_string()
}

// ── Tool-call repetition detector ──────────────────────────────────────────

/// Tracks a fingerprint per round. If the same set of (tool, arguments)
/// repeats `MAX_REPEATED_SIGNATURES` times consecutively, the model is stuck
/// in a tool-calling loop.
#[derive(Default)]
pub struct RepetitionDetector {
    signatures: Vec<u64>,
}

impl RepetitionDetector {
    /// Record this round's tool calls; returns `true` when the loop is stuck.
    pub fn record(&mut self, tool_calls: &[ToolCall]) -> bool {
        let mut parts: Vec<(&str, &str)> = tool_calls
            .iter()
            .map(|tc| (tc.function.name.as_str(), tc.function.arguments.as_str()))
            .collect();
        parts.sort();

        let mut hasher = DefaultHasher::new();
        for (name, args) in &parts {
            name.hash(&mut hasher);
            args.hash(&mut hasher);
        }
        let signature = hasher.finish();
        self.signatures.push(signature);

        let len = self.signatures.len();
        len >= MAX_REPEATED_SIGNATURES
            && self.signatures[len - MAX_REPEATED_SIGNATURES..]
                .iter()
                .all(|&s| s == signature)
    }
}

/// Redirect message injected when a tool-calling loop is detected.
pub fn loop_redirect_message() -> Message {
    Message::system(
        "[SYSTEM] You are stuck in a tool-calling loop — you have called the same \
        tools with the same arguments multiple times in a row. STOP calling tools \
        and provide a direct text response summarizing what you have accomplished \
        and any issues encountered.",
    )
}

// ── Per-tool failure tracking ──────────────────────────────────────────────

#[derive(Default)]
pub struct ToolFailCounter {
    counts: HashMap<String, u32>,
}

impl ToolFailCounter {
    /// True when the tool is blocked for the rest of the turn.
    pub fn is_blocked(&self, tool: &str) -> bool {
        self.counts.get(tool).is_some_and(|c| *c >= HARD_STOP_TOOL_FAILS)
    }

    /// Record an outcome. Returns a system message to inject, if any.
    pub fn record(&mut self, tool: &str, success: bool) -> Option<Message> {
        if success {
            self.counts.remove(tool);
            return None;
        }
        let count = self.counts.entry(tool.to_string()).or_insert(0);
        *count += 1;
        if *count == HARD_STOP_TOOL_FAILS {
            warn!(
                "[agent] Tool '{}' failed {} consecutive times — blocking it",
                tool, count
            );
            Some(Message::system(format!(
                "[SYSTEM] The tool '{tool}' has failed {count} times in a row and is now \
                BLOCKED. Do NOT call '{tool}' again. Tell the user what happened and \
                provide a text summary now."
            )))
        } else if *count == MAX_CONSECUTIVE_TOOL_FAILS {
            warn!(
                "[agent] Tool '{}' failed {} consecutive times — injecting nudge",
                tool, count
            );
            Some(Message::system(format!(
                "[SYSTEM] The tool '{tool}' has failed {count} times in a row. Stop calling \
                '{tool}' with the same arguments — try a different tool or approach."
            )))
        } else {
            None
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
