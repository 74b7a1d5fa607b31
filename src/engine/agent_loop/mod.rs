// ── Waystation Engine: Agent Loop ──────────────────────────────────────────
// The core orchestration loop: send to model → tool calls → execute → repeat
// until the model produces text, a cap trips, or the client goes away.
//
// Hard caps: max tool rounds, max wall time, max cumulative tool output.
// Exceeding any cap ends the turn with the best partial draft and a degraded
// marker instead of a hard failure. Offline mode transparently rewrites
// remote models to the local fallback and drops internet-only tools.

mod helpers;

pub use helpers::{HARD_STOP_TOOL_FAILS, MAX_CONSECUTIVE_TOOL_FAILS};

use crate::atoms::constants::{
    AGENT_MAX_STEPS, AGENT_MAX_TOOL_OUTPUT_BYTES, AGENT_MAX_WALL_SECS, AGENT_PARALLEL_TOOL_CALLS,
};
use crate::atoms::error::{GatewayError, GatewayResult};
use crate::atoms::types::{Message, QualityTier, TokenUsage};
use crate::engine::config::ConfigStore;
use crate::engine::maitre::{Maitre, MaitreOutcome};
use crate::engine::mcp::McpManager;
use crate::engine::observability::Tracker;
use crate::engine::providers::{assemble_chunks, ProviderParams, ProviderRegistry};
use crate::engine::tools::ToolRegistry;
use helpers::{RepetitionDetector, ToolFailCounter};
use log::{info, warn};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch, Semaphore};
use uuid::Uuid;

// ── Wiring ─────────────────────────────────────────────────────────────────

/// Everything the loop needs; owned by the gateway state, shared per request.
#[derive(Clone)]
pub struct AgentDeps {
    pub providers: Arc<ProviderRegistry>,
    pub maitre: Arc<Maitre>,
    pub tools: Arc<ToolRegistry>,
    pub mcp: Arc<McpManager>,
    pub tracker: Arc<Tracker>,
    pub config: Arc<ConfigStore>,
}

/// One agent-plane request.
pub struct AgentRequest {
    /// The part after `agent:` in the model id.
    pub model_rest: String,
    pub messages: Vec<Message>,
    pub quality: QualityTier,
    pub params: ProviderParams,
    pub request_id: Uuid,
    pub internet_available: bool,
}

/// Streamed progress events for SSE relay.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    Delta(String),
    /// Keep-alive during tool rounds so the HTTP connection does not idle.
    Heartbeat,
    ToolStarted { id: String, name: String },
    ToolResult { id: String, name: String, success: bool },
}

#[derive(Debug, Clone, Default)]
pub struct AgentOutcome {
    pub text: String,
    pub usage: TokenUsage,
    /// Set when a cap tripped or a subsystem outage degraded the answer.
    pub degraded: Option<String>,
    pub rounds: u32,
}

// ── Entry point ────────────────────────────────────────────────────────────

pub async fn run_agent_turn(
    deps: &AgentDeps,
    request: AgentRequest,
    events: Option<mpsc::Sender<AgentEvent>>,
    mut cancel: watch::Receiver<bool>,
) -> GatewayResult<AgentOutcome> {
    let request_id = request.request_id;
    let (provider, model, offline_rewrite) = resolve_model(deps, &request.model_rest, request.internet_available);
    if offline_rewrite {
        info!(
            "[agent] Offline — rewriting model to {}:{}",
            provider, model
        );
        deps.tracker.annotate(request_id, "offline_rewrite", json!(true));
    }

    let mut messages = request.messages;
    let latest_user = messages
        .iter()
        .rev()
        .find(|m| m.role == crate::atoms::types::Role::User)
        .map(|m| m.content.as_text())
        .unwrap_or_default();

    // ── Menu curation ──────────────────────────────────────────────────────
    let known_servers = deps.mcp.server_names();
    let decision = match deps
        .maitre
        .curate(&messages, &known_servers, Some(request_id))
        .await
    {
        MaitreOutcome::Trigger(trigger) => {
            return run_trigger(deps, trigger, request_id).await;
        }
        MaitreOutcome::Menu(decision) => decision,
    };
    if let Some(action) = &decision.system_action {
        return Ok(system_action_outcome(deps, action));
    }
    deps.tracker.annotate(
        request_id,
        "menu_servers",
        json!(decision.target_servers.clone()),
    );

    let mut tool_defs = deps.tools.definitions_for(&decision.target_servers);
    if !request.internet_available {
        let internet_only: HashSet<String> =
            deps.mcp.internet_tool_addresses().into_iter().collect();
        tool_defs.retain(|d| !internet_only.contains(&d.function.name));
    }
    if !decision.advice_topics.is_empty() {
        messages.insert(
            0,
            Message::system(format!(
                "Relevant advice topics for this request: {}",
                decision.advice_topics.join(", ")
            )),
        );
    }

    // ── The loop ───────────────────────────────────────────────────────────
    let max_rounds = match request.quality {
        QualityTier::Speed => 6,
        _ => AGENT_MAX_STEPS,
    };
    let run_finalizer = request.quality == QualityTier::High
        || deps.config.get_bool("finalizer_enabled").unwrap_or(false);

    let started = Instant::now();
    let mut round: u32 = 0;
    let mut draft = String::new();
    let mut usage = TokenUsage::default();
    let mut tool_output_bytes: usize = 0;
    let mut fail_counter = ToolFailCounter::default();
    let mut detector = RepetitionDetector::default();
    let mut redirected = false;
    let mut winning_servers: HashSet<String> = HashSet::new();

    loop {
        round += 1;
        if *cancel.borrow() {
            return Err(GatewayError::Cancelled("client disconnected".into()));
        }
        if round > max_rounds {
            warn!("[agent] Max tool rounds ({}) reached, stopping", max_rounds);
            return Ok(capped_outcome(
                draft,
                usage,
                round - 1,
                "max tool steps reached",
            ));
        }
        if started.elapsed().as_secs() >= AGENT_MAX_WALL_SECS {
            warn!("[agent] Wall-time cap reached at round {}", round);
            return Ok(capped_outcome(draft, usage, round - 1, "wall time cap reached"));
        }

        info!(
            "[agent] Round {}/{} request={} model={}:{}",
            round, max_rounds, request_id, provider, model
        );

        // ── 1. Call the model, forwarding deltas as they stream ────────────
        let stream = deps
            .providers
            .chat_stream(
                &provider,
                &model,
                &messages,
                &tool_defs,
                request.params,
                Some(request_id),
            )
            .await;
        let mut rx = match stream {
            Ok(rx) => rx,
            Err(e) if round > 1 => {
                // Partial tool results beat a hard failure
                warn!("[agent] Model call failed mid-turn: {e} — returning partial draft");
                return Ok(capped_outcome(draft, usage, round - 1, "model unavailable"));
            }
            Err(e) => return Err(e),
        };

        let mut chunks = Vec::new();
        loop {
            tokio::select! {
                _ = cancel.changed() => {
                    return Err(GatewayError::Cancelled("client disconnected".into()));
                }
                item = rx.recv() => match item {
                    Some(Ok(chunk)) => {
                        if let (Some(events), Some(delta)) = (&events, &chunk.delta_text) {
                            let _ = events.try_send(AgentEvent::Delta(delta.clone()));
                        }
                        chunks.push(chunk);
                    }
                    Some(Err(e)) => {
                        warn!("[agent] Stream error: {e}");
                        break;
                    }
                    None => break,
                }
            }
        }
        let outcome = assemble_chunks(chunks);
        if let Some(u) = non_zero_usage(&outcome.usage) {
            usage.input_tokens = u.input_tokens; // last round's context size
            usage.output_tokens += u.output_tokens;
            usage.total_tokens = usage.input_tokens + usage.output_tokens;
        }

        // ── 2. Text answer ends the loop ───────────────────────────────────
        if outcome.tool_calls.is_empty() {
            let mut text = outcome.text;
            if helpers::handle_empty_response(&text, &mut messages, round, max_rounds) {
                continue;
            }
            if text.is_empty() {
                text = if draft.is_empty() {
                    helpers::empty_response_fallback()
                } else {
                    draft.clone()
                };
            }
            messages.push(Message::assistant(text.clone()));

            if run_finalizer {
                text = finalize_draft(deps, &provider, &model, &messages, request_id, text).await;
            }
            for server in &winning_servers {
                deps.maitre.record_success(&latest_user, server);
            }
            deps.tracker.annotate(request_id, "agent_rounds", json!(round));
            return Ok(AgentOutcome {
                text,
                usage,
                degraded: None,
                rounds: round,
            });
        }

        // ── 3. Repetition guard ────────────────────────────────────────────
        if detector.record(&outcome.tool_calls) {
            if redirected {
                warn!("[agent] Model ignored the loop redirect — hard-breaking turn");
                return Ok(AgentOutcome {
                    text: "I was stuck calling the same tools repeatedly and couldn't make \
                           progress. Please try rephrasing your request."
                        .to_string(),
                    usage,
                    degraded: Some("tool loop detected".into()),
                    rounds: round,
                });
            }
            warn!("[agent] Tool-call loop detected — injecting redirect");
            messages.push(helpers::loop_redirect_message());
            redirected = true;
            continue;
        }

        if !outcome.text.is_empty() {
            draft = outcome.text.clone();
        }
        messages.push(Message {
            role: crate::atoms::types::Role::Assistant,
            content: crate::atoms::types::MessageContent::Text(outcome.text.clone()),
            tool_calls: Some(outcome.tool_calls.clone()),
            tool_call_id: None,
            name: None,
        });
        if let Some(events) = &events {
            let _ = events.try_send(AgentEvent::Heartbeat);
        }

        // ── 4. Execute the round's tool calls (bounded parallelism) ───────
        let semaphore = Arc::new(Semaphore::new(AGENT_PARALLEL_TOOL_CALLS));
        let futures: Vec<_> = outcome
            .tool_calls
            .iter()
            .map(|tc| {
                let semaphore = Arc::clone(&semaphore);
                let deps = deps.clone();
                let blocked = fail_counter.is_blocked(&tc.function.name);
                let name = tc.function.name.clone();
                let arguments = tc.function.arguments.clone();
                let id = tc.id.clone();
                let events = events.clone();
                async move {
                    if blocked {
                        return (
                            id,
                            name.clone(),
                            crate::engine::tools::ToolOutcome {
                                output: format!(
                                    "Error: tool '{name}' is blocked after repeated failures. \
                                     Use a different tool or tell the user."
                                ),
                                success: false,
                            },
                        );
                    }
                    let _permit = semaphore.acquire_owned().await;
                    if let Some(events) = &events {
                        let _ = events.try_send(AgentEvent::ToolStarted {
                            id: id.clone(),
                            name: name.clone(),
                        });
                    }
                    let result = deps.tools.execute(&name, &arguments, Some(request_id)).await;
                    if let Some(events) = &events {
                        let _ = events.try_send(AgentEvent::ToolResult {
                            id: id.clone(),
                            name: name.clone(),
                            success: result.success,
                        });
                    }
                    (id, name, result)
                }
            })
            .collect();

        let results = tokio::select! {
            _ = cancel.changed() => {
                return Err(GatewayError::Cancelled("client disconnected".into()));
            }
            results = futures::future::join_all(futures) => results,
        };

        // ── 5. Feed results back in call order ─────────────────────────────
        let mut nudges: Vec<Message> = Vec::new();
        for (id, name, result) in results {
            info!(
                "[agent] Tool result: {} success={} output_len={}",
                name,
                result.success,
                result.output.len()
            );
            tool_output_bytes += result.output.len();
            if result.success {
                if let Some((server, _)) = crate::engine::mcp::types::parse_tool_address(
                    &name,
                    known_servers.iter().map(|s| s.as_str()).collect(),
                ) {
                    winning_servers.insert(server.to_string());
                }
            }
            if let Some(nudge) = fail_counter.record(&name, result.success) {
                nudges.push(nudge);
            }
            messages.push(Message::tool_result(id, name, result.output));
        }
        messages.extend(nudges);

        if tool_output_bytes > AGENT_MAX_TOOL_OUTPUT_BYTES {
            warn!("[agent] Cumulative tool output cap exceeded at round {}", round);
            return Ok(capped_outcome(draft, usage, round, "tool output budget exceeded"));
        }
        // Loop: the model sees the tool results next round
    }
}

// ── Model resolution ───────────────────────────────────────────────────────

/// Resolve `agent:<rest>` to (provider, model). `default` maps through the
/// `agent_model` config key. Offline, remote providers rewrite to the local
/// fallback.
fn resolve_model(deps: &AgentDeps, rest: &str, internet_available: bool) -> (String, String, bool) {
    let native = deps.providers.native_name();
    let configured = if rest.is_empty() || rest == "default" {
        deps.config.get_or("agent_model", "")
    } else {
        rest.to_string()
    };

    let (provider, model) = match configured.split_once(':') {
        Some((p, m)) if deps.providers.get(p).is_some() => (p.to_string(), m.to_string()),
        _ if configured.is_empty() => (native.clone(), fallback_model(deps)),
        _ => (native.clone(), configured),
    };

    if !internet_available && provider != native {
        return (native.clone(), fallback_model(deps), true);
    }
    (provider, model, false)
}

fn fallback_model(deps: &AgentDeps) -> String {
    deps.config
        .get("WAYSTATION_FALLBACK_MODEL")
        .or_else(|| deps.config.get("fallback_model"))
        .unwrap_or_else(|| "llama3.2".to_string())
}

// ── Short-circuit paths ────────────────────────────────────────────────────

async fn run_trigger(
    deps: &AgentDeps,
    trigger: crate::engine::maitre::triggers::SovereignTrigger,
    request_id: Uuid,
) -> GatewayResult<AgentOutcome> {
    use crate::engine::maitre::triggers::ActionKind;
    deps.tracker
        .annotate(request_id, "sovereign_trigger", json!(trigger.pattern));
    match trigger.action_kind {
        ActionKind::ToolCall => {
            let tool = trigger.action_payload["tool"].as_str().unwrap_or_default();
            let arguments = trigger.action_payload["arguments"].to_string();
            let result = deps.tools.execute(tool, &arguments, Some(request_id)).await;
            Ok(AgentOutcome {
                degraded: (!result.success).then(|| format!("trigger tool '{tool}' failed")),
                text: result.output,
                ..Default::default()
            })
        }
        ActionKind::SystemPrompt | ActionKind::UiControl | ActionKind::Menu => {
            let text = trigger.action_payload["text"]
                .as_str()
                .map(|s| s.to_string())
                .unwrap_or_else(|| {
                    format!("Acknowledged: {}", trigger.action_payload["action"].as_str().unwrap_or("ok"))
                });
            Ok(AgentOutcome {
                text,
                ..Default::default()
            })
        }
    }
}

fn system_action_outcome(deps: &AgentDeps, action: &str) -> AgentOutcome {
    let text = match action {
        "help" => {
            let servers = deps.mcp.server_names();
            format!(
                "I can run tools from these servers: {}. Core tools (file reads, \
                 memory search, time) are always available. Admin operations live \
                 under /admin.",
                if servers.is_empty() {
                    "none configured".to_string()
                } else {
                    servers.join(", ")
                }
            )
        }
        "restart" => "Restart requested — use the admin restart endpoint to bounce a \
                      subsystem; the gateway itself stays up."
            .to_string(),
        other => format!("Unknown system action '{other}'."),
    };
    AgentOutcome {
        text,
        ..Default::default()
    }
}

async fn finalize_draft(
    deps: &AgentDeps,
    provider: &str,
    model: &str,
    messages: &[Message],
    request_id: Uuid,
    draft: String,
) -> String {
    let mut finalize_messages = messages.to_vec();
    finalize_messages.push(Message::system(
        "Polish your draft answer above: fix structure and wording, keep all facts. \
         Reply with the final answer only.",
    ));
    match deps
        .providers
        .chat(
            provider,
            model,
            &finalize_messages,
            &[],
            ProviderParams::default(),
            Some(request_id),
        )
        .await
    {
        Ok(outcome) if !outcome.text.is_empty() => outcome.text,
        _ => draft,
    }
}

fn capped_outcome(draft: String, usage: TokenUsage, rounds: u32, reason: &str) -> AgentOutcome {
    let text = if draft.is_empty() {
        format!(
            "I ran out of budget ({reason}) before I could write a final summary. \
             The work done so far may be incomplete."
        )
    } else {
        draft
    };
    AgentOutcome {
        text,
        usage,
        degraded: Some(reason.to_string()),
        rounds,
    }
}

fn non_zero_usage(usage: &TokenUsage) -> Option<TokenUsage> {
    (usage.input_tokens > 0 || usage.output_tokens > 0).then_some(*usage)
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::breaker::BreakerRegistry;
    use crate::engine::maitre::learning::FeedbackJournal;

    fn deps() -> (tempfile::TempDir, AgentDeps) {
        let dir = tempfile::tempdir().unwrap();
        let tracker = Arc::new(Tracker::new());
        let breakers = Arc::new(BreakerRegistry::new(Some(tracker.clone())));
        let config = Arc::new(ConfigStore::new(dir.path().join("config")));
        let providers = Arc::new(ProviderRegistry::new(breakers.clone(), tracker.clone()));
        providers.load_from_config(&config);
        let mcp = Arc::new(McpManager::new(breakers, tracker.clone(), None));
        let tools = Arc::new(ToolRegistry::new(mcp.clone()));
        let maitre = Arc::new(Maitre::new(
            providers.clone(),
            config.clone(),
            FeedbackJournal::new(dir.path().join("feedback.json")),
        ));
        (
            dir,
            AgentDeps {
                providers,
                maitre,
                tools,
                mcp,
                tracker,
                config,
            },
        )
    }

    #[test]
    fn offline_rewrites_remote_models() {
        let (_dir, deps_val) = deps();
        deps_val
            .config
            .set("providers.openai.base_url", "https://api.openai.com/v1")
            .unwrap();
        deps_val.providers.load_from_config(&deps_val.config);
        deps_val.config.set("fallback_model", "llama3.2").unwrap();

        let (provider, model, rewritten) = resolve_model(&deps_val, "openai:gpt-4o", false);
        assert_eq!(provider, "local");
        assert_eq!(model, "llama3.2");
        assert!(rewritten);

        // Online: the remote provider is honored
        let (provider, _, rewritten) = resolve_model(&deps_val, "openai:gpt-4o", true);
        assert_eq!(provider, "openai");
        assert!(!rewritten);
    }

    #[test]
    fn default_model_comes_from_config() {
        let (_dir, deps_val) = deps();
        deps_val.config.set("agent_model", "local:qwen3").unwrap();
        let (provider, model, _) = resolve_model(&deps_val, "default", true);
        assert_eq!(provider, "local");
        assert_eq!(model, "qwen3");

        // Bare model name goes to the native engine
        let (provider, model, _) = resolve_model(&deps_val, "mistral", true);
        assert_eq!(provider, "local");
        assert_eq!(model, "mistral");
    }

    #[test]
    fn capped_outcome_prefers_draft() {
        let out = capped_outcome("partial answer".into(), TokenUsage::default(), 3, "wall time cap reached");
        assert_eq!(out.text, "partial answer");
        assert_eq!(out.degraded.as_deref(), Some("wall time cap reached"));

        let out = capped_outcome(String::new(), TokenUsage::default(), 3, "max tool steps reached");
        assert!(out.text.contains("max tool steps reached"));
    }

    #[tokio::test]
    async fn trigger_tool_call_short_circuits() {
        let (_dir, deps_val) = deps();
        let trigger = crate::engine::maitre::triggers::SovereignTrigger {
            pattern: "what time".into(),
            match_kind: crate::engine::maitre::triggers::MatchKind::ContainsPhrase,
            action_kind: crate::engine::maitre::triggers::ActionKind::ToolCall,
            action_payload: json!({"tool": "current_time", "arguments": {}}),
        };
        let outcome = run_trigger(&deps_val, trigger, Uuid::new_v4()).await.unwrap();
        assert!(outcome.text.contains("UTC:"));
        assert!(outcome.degraded.is_none());
        assert_eq!(outcome.rounds, 0);
    }

    #[test]
    fn system_action_help_lists_servers() {
        let (_dir, deps_val) = deps();
        let outcome = system_action_outcome(&deps_val, "help");
        assert!(outcome.text.contains("none configured"));
        let outcome = system_action_outcome(&deps_val, "weird");
        assert!(outcome.text.contains("Unknown system action"));
    }
}
