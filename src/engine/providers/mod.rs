// ── Waystation Engine: Provider Adapters ───────────────────────────────────
// Two adapter shapes behind one trait: `native_local` translates between the
// OpenAI chat schema and the local engine's chat/generate APIs;
// `openai_compat` proxies any OpenAI-compatible upstream with Authorization
// injection. The registry wraps every call with the provider's circuit
// breaker and an operation metric.

pub mod native_local;
pub mod openai_compat;

pub use native_local::NativeLocalProvider;
pub use openai_compat::OpenAiCompatProvider;

use crate::atoms::error::{GatewayError, GatewayResult};
use crate::atoms::types::{
    Message, ModelInfo, StreamChunk, TokenUsage, ToolCall, ToolDefinition,
};
use crate::engine::breaker::{BreakerPolicy, BreakerRegistry};
use crate::engine::config::ConfigStore;
use crate::engine::observability::{OperationMetric, Tracker};
use async_trait::async_trait;
use chrono::Utc;
use log::{info, warn};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use uuid::Uuid;

// ── Classification ─────────────────────────────────────────────────────────

/// Adapter-level error, classified before it is tagged with the provider
/// name and folded into the gateway taxonomy.
#[derive(Debug, Clone)]
pub enum ProviderError {
    Auth(String),
    RateLimited {
        message: String,
        retry_after_secs: Option<u64>,
    },
    NotFound(String),
    Api { status: u16, message: String },
    Transport(String),
    Timeout(String),
    Protocol(String),
}

impl ProviderError {
    /// Fold into the gateway taxonomy, tagged with the provider name.
    pub fn into_gateway(self, provider: &str) -> GatewayError {
        match self {
            ProviderError::Auth(message) => GatewayError::UpstreamUnavailable {
                provider: provider.into(),
                message: format!("auth: {message}"),
            },
            ProviderError::RateLimited {
                message,
                retry_after_secs,
            } => GatewayError::RateLimited {
                message: format!("{provider}: {message}"),
                retry_after_secs,
            },
            ProviderError::NotFound(message) => {
                GatewayError::NotFound(format!("{provider}: {message}"))
            }
            ProviderError::Api { status, message } if status >= 500 => {
                GatewayError::UpstreamUnavailable {
                    provider: provider.into(),
                    message,
                }
            }
            ProviderError::Api { status, message } => GatewayError::UpstreamProtocol {
                provider: provider.into(),
                message: format!("status {status}: {message}"),
            },
            ProviderError::Transport(message) => GatewayError::UpstreamUnavailable {
                provider: provider.into(),
                message,
            },
            ProviderError::Timeout(message) => {
                GatewayError::Timeout(format!("{provider}: {message}"))
            }
            ProviderError::Protocol(message) => GatewayError::UpstreamProtocol {
                provider: provider.into(),
                message,
            },
        }
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderError::Auth(m) => write!(f, "auth: {m}"),
            ProviderError::RateLimited { message, .. } => write!(f, "rate limited: {message}"),
            ProviderError::NotFound(m) => write!(f, "not found: {m}"),
            ProviderError::Api { status, message } => write!(f, "api {status}: {message}"),
            ProviderError::Transport(m) => write!(f, "network: {m}"),
            ProviderError::Timeout(m) => write!(f, "timeout: {m}"),
            ProviderError::Protocol(m) => write!(f, "protocol: {m}"),
        }
    }
}

// ── Trait ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    NativeLocal,
    OpenAiCompat,
}

/// Sampling parameters forwarded per call.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProviderParams {
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
    pub top_p: Option<f64>,
}

/// Assembled non-streaming outcome.
#[derive(Debug, Clone, Default)]
pub struct ChatOutcome {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: TokenUsage,
    pub model: Option<String>,
}

pub type ChunkReceiver = mpsc::Receiver<Result<StreamChunk, ProviderError>>;

#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> ProviderKind;
    fn base_url(&self) -> &str;

    /// Open a streaming chat; chunks arrive on the receiver as the upstream
    /// produces them.
    async fn chat_stream(
        &self,
        model: &str,
        messages: &[Message],
        tools: &[ToolDefinition],
        params: ProviderParams,
    ) -> Result<ChunkReceiver, ProviderError>;

    /// Non-streaming chat; default implementation drains the stream.
    async fn chat(
        &self,
        model: &str,
        messages: &[Message],
        tools: &[ToolDefinition],
        params: ProviderParams,
    ) -> Result<ChatOutcome, ProviderError> {
        let mut rx = self.chat_stream(model, messages, tools, params).await?;
        let mut chunks = Vec::new();
        while let Some(item) = rx.recv().await {
            chunks.push(item?);
        }
        Ok(assemble_chunks(chunks))
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, ProviderError>;
}

/// Assemble streamed chunks into one outcome: concatenated text, tool calls
/// stitched from deltas by index, last-seen usage and model.
pub fn assemble_chunks(chunks: Vec<StreamChunk>) -> ChatOutcome {
    let mut outcome = ChatOutcome::default();
    // index → (id, name, arguments)
    let mut calls: HashMap<usize, (String, String, String)> = HashMap::new();

    for chunk in &chunks {
        if let Some(text) = &chunk.delta_text {
            outcome.text.push_str(text);
        }
        for delta in &chunk.tool_calls {
            let entry = calls.entry(delta.index).or_default();
            if let Some(id) = &delta.id {
                entry.0 = id.clone();
            }
            if let Some(name) = &delta.function_name {
                entry.1 = name.clone();
            }
            if let Some(args) = &delta.arguments_delta {
                entry.2.push_str(args);
            }
        }
        if let Some(usage) = &chunk.usage {
            outcome.usage = *usage;
        }
        if chunk.model.is_some() {
            outcome.model = chunk.model.clone();
        }
    }

    let mut indices: Vec<usize> = calls.keys().copied().collect();
    indices.sort_unstable();
    for index in indices {
        let (id, name, arguments) = calls.remove(&index).unwrap_or_default();
        let id = if id.is_empty() {
            format!("call_{}", Uuid::new_v4())
        } else {
            id
        };
        outcome.tool_calls.push(ToolCall {
            id,
            call_type: "function".into(),
            function: crate::atoms::types::FunctionCall { name, arguments },
        });
    }
    outcome
}

// ── Descriptor & registry ──────────────────────────────────────────────────

/// Provider descriptor as loaded from config; changes take effect on the
/// next request via registry reload.
#[derive(Debug, Clone)]
pub struct ProviderDescriptor {
    pub name: String,
    pub kind: ProviderKind,
    pub base_url: String,
    pub api_key: Option<String>,
    pub default_headers: HashMap<String, String>,
    pub timeout_secs: u64,
    /// native_local only: per-model `options` overrides.
    pub model_overrides: HashMap<String, serde_json::Map<String, serde_json::Value>>,
}

pub struct AnyProvider(Arc<dyn ChatProvider>);

impl AnyProvider {
    pub fn from_descriptor(descriptor: &ProviderDescriptor) -> Self {
        let provider: Arc<dyn ChatProvider> = match descriptor.kind {
            ProviderKind::NativeLocal => Arc::new(NativeLocalProvider::new(descriptor)),
            ProviderKind::OpenAiCompat => Arc::new(OpenAiCompatProvider::new(descriptor)),
        };
        AnyProvider(provider)
    }

    pub fn inner(&self) -> &Arc<dyn ChatProvider> {
        &self.0
    }
}

impl Clone for AnyProvider {
    fn clone(&self) -> Self {
        AnyProvider(Arc::clone(&self.0))
    }
}

/// Named providers plus the breaker/metric weave around every call.
pub struct ProviderRegistry {
    providers: RwLock<HashMap<String, AnyProvider>>,
    native_name: RwLock<String>,
    breakers: Arc<BreakerRegistry>,
    tracker: Arc<Tracker>,
}

impl ProviderRegistry {
    pub fn new(breakers: Arc<BreakerRegistry>, tracker: Arc<Tracker>) -> Self {
        ProviderRegistry {
            providers: RwLock::new(HashMap::new()),
            native_name: RwLock::new("local".into()),
            breakers,
            tracker,
        }
    }

    /// (Re)build the provider table from config. Recognized keys:
    ///   providers.<name>.kind        native_local | openai_compat
    ///   providers.<name>.base_url
    ///   providers.<name>.api_key     literal, or providers.<name>.auth_token_ref
    ///   providers.<name>.timeout_secs
    ///   providers.<name>.header.<h>  extra default headers
    /// A `local` native provider is always present (config may override its
    /// base_url).
    pub fn load_from_config(&self, config: &ConfigStore) {
        let snapshot = config.snapshot();
        let default_timeout = config
            .get("WAYSTATION_HTTP_TIMEOUT_SECS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(crate::atoms::constants::HTTP_TIMEOUT_SECS);
        let mut grouped: HashMap<String, HashMap<String, String>> = HashMap::new();
        for (key, value) in snapshot.iter() {
            if let Some(rest) = key.strip_prefix("providers.") {
                if let Some((name, field)) = rest.split_once('.') {
                    grouped
                        .entry(name.to_string())
                        .or_default()
                        .insert(field.to_string(), value.clone());
                }
            }
        }

        let mut fresh: HashMap<String, AnyProvider> = HashMap::new();
        for (name, fields) in grouped {
            let kind = match fields.get("kind").map(|s| s.as_str()) {
                Some("native_local") => ProviderKind::NativeLocal,
                _ => ProviderKind::OpenAiCompat,
            };
            let api_key = fields.get("api_key").cloned().or_else(|| {
                fields
                    .get("auth_token_ref")
                    .and_then(|token_ref| config.get(token_ref))
            });
            let default_headers = fields
                .iter()
                .filter_map(|(k, v)| {
                    k.strip_prefix("header.")
                        .map(|h| (h.to_string(), v.clone()))
                })
                .collect();
            // providers.<name>.options.<model>.<param> → per-model overrides
            let mut model_overrides: HashMap<String, serde_json::Map<String, serde_json::Value>> =
                HashMap::new();
            for (field, value) in &fields {
                if let Some(rest) = field.strip_prefix("options.") {
                    if let Some((model, param)) = rest.rsplit_once('.') {
                        let parsed = serde_json::from_str(value)
                            .unwrap_or(serde_json::Value::String(value.clone()));
                        model_overrides
                            .entry(model.to_string())
                            .or_default()
                            .insert(param.to_string(), parsed);
                    }
                }
            }
            let base_url = match fields.get("base_url").filter(|u| !u.is_empty()) {
                Some(url) => url.clone(),
                None if kind == ProviderKind::NativeLocal => "http://localhost:11434".into(),
                None => String::new(),
            };
            let descriptor = ProviderDescriptor {
                name: name.clone(),
                kind,
                base_url,
                api_key,
                default_headers,
                timeout_secs: fields
                    .get("timeout_secs")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(default_timeout),
                model_overrides,
            };
            if descriptor.base_url.is_empty() && kind == ProviderKind::OpenAiCompat {
                warn!("[providers] '{}' skipped: no base_url configured", name);
                continue;
            }
            if kind == ProviderKind::NativeLocal {
                *self.native_name.write() = name.clone();
            }
            fresh.insert(name.clone(), AnyProvider::from_descriptor(&descriptor));
        }

        // The native local engine always exists, even with an empty config
        let native_name = self.native_name.read().clone();
        fresh.entry(native_name.clone()).or_insert_with(|| {
            AnyProvider::from_descriptor(&ProviderDescriptor {
                name: native_name,
                kind: ProviderKind::NativeLocal,
                base_url: "http://localhost:11434".into(),
                api_key: None,
                default_headers: HashMap::new(),
                timeout_secs: crate::atoms::constants::HTTP_TIMEOUT_SECS,
                model_overrides: HashMap::new(),
            })
        });

        let count = fresh.len();
        *self.providers.write() = fresh;
        info!("[providers] {} providers loaded", count);
    }

    pub fn get(&self, name: &str) -> Option<AnyProvider> {
        self.providers.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Name of the native local engine provider.
    pub fn native_name(&self) -> String {
        self.native_name.read().clone()
    }

    pub fn native(&self) -> Option<AnyProvider> {
        self.get(&self.native_name())
    }

    // ── Breaker-guarded calls ──────────────────────────────────────────────

    /// Streaming chat through the provider breaker. Success is recorded once
    /// the upstream accepts the stream.
    pub async fn chat_stream(
        &self,
        provider_name: &str,
        model: &str,
        messages: &[Message],
        tools: &[ToolDefinition],
        params: ProviderParams,
        request_id: Option<Uuid>,
    ) -> GatewayResult<ChunkReceiver> {
        let provider = self
            .get(provider_name)
            .ok_or_else(|| GatewayError::NotFound(format!("unknown provider '{provider_name}'")))?;
        let key = format!("provider:{provider_name}");
        let policy = BreakerPolicy::provider();
        self.breakers.admit(&key, policy)?;

        let started = Instant::now();
        let result = provider.inner().chat_stream(model, messages, tools, params).await;
        self.settle(&key, policy, provider_name, "chat_stream", started, request_id, &result);
        result.map_err(|e| e.into_gateway(provider_name))
    }

    /// Non-streaming chat through the provider breaker.
    pub async fn chat(
        &self,
        provider_name: &str,
        model: &str,
        messages: &[Message],
        tools: &[ToolDefinition],
        params: ProviderParams,
        request_id: Option<Uuid>,
    ) -> GatewayResult<ChatOutcome> {
        let provider = self
            .get(provider_name)
            .ok_or_else(|| GatewayError::NotFound(format!("unknown provider '{provider_name}'")))?;
        let key = format!("provider:{provider_name}");
        let policy = BreakerPolicy::provider();
        self.breakers.admit(&key, policy)?;

        let started = Instant::now();
        let result = provider.inner().chat(model, messages, tools, params).await;
        self.settle(&key, policy, provider_name, "chat", started, request_id, &result);
        result.map_err(|e| e.into_gateway(provider_name))
    }

    /// Model listing; per-provider failures are the caller's to swallow.
    pub async fn list_models(&self, provider_name: &str) -> GatewayResult<Vec<ModelInfo>> {
        let provider = self
            .get(provider_name)
            .ok_or_else(|| GatewayError::NotFound(format!("unknown provider '{provider_name}'")))?;
        let started = Instant::now();
        let result = provider.inner().list_models().await;
        self.tracker.record_operation(
            None,
            OperationMetric {
                component: format!("provider:{provider_name}"),
                operation: "list_models".into(),
                duration_ms: started.elapsed().as_millis() as u64,
                started_at: Utc::now(),
                ok: result.is_ok(),
                metadata: serde_json::Value::Null,
            },
        );
        result.map_err(|e| e.into_gateway(provider_name))
    }

    fn settle<T>(
        &self,
        key: &str,
        policy: BreakerPolicy,
        provider_name: &str,
        operation: &str,
        started: Instant,
        request_id: Option<Uuid>,
        result: &Result<T, ProviderError>,
    ) {
        match result {
            Ok(_) => self.breakers.record_success(key),
            Err(e) => {
                self.breakers.record_failure(key, policy, &e.to_string());
                self.tracker.record_error(
                    &format!("provider:{provider_name}"),
                    &e.to_string(),
                    request_id,
                );
            }
        }
        self.tracker.record_operation(
            request_id,
            OperationMetric {
                component: format!("provider:{provider_name}"),
                operation: operation.into(),
                duration_ms: started.elapsed().as_millis() as u64,
                started_at: Utc::now(),
                ok: result.is_ok(),
                metadata: serde_json::Value::Null,
            },
        );
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
