// ── Waystation Engine: OpenAI-Compatible Provider ──────────────────────────
// Proxy adapter for any OpenAI-compatible REST upstream: Authorization
// injection, default-header passthrough for tracing, SSE chunk parsing,
// transient retries with backoff. Auth errors are never retried.

use super::{ChatOutcome, ChatProvider, ChunkReceiver, ProviderDescriptor, ProviderError, ProviderKind, ProviderParams};
use crate::atoms::types::{
    Message, ModelInfo, StreamChunk, TokenUsage, ToolCall, ToolCallDelta, ToolDefinition,
    truncate_utf8,
};
use crate::engine::http::{is_retryable_status, parse_retry_after, retry_delay, shared_client};
use async_trait::async_trait;
use futures::StreamExt;
use log::{error, info, warn};
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;

/// Transient retries per request (after the first attempt).
const MAX_RETRIES: u32 = 2;

pub struct OpenAiCompatProvider {
    name: String,
    client: Client,
    base_url: String,
    api_key: Option<String>,
    default_headers: HashMap<String, String>,
    timeout: Duration,
}

impl OpenAiCompatProvider {
    pub fn new(descriptor: &ProviderDescriptor) -> Self {
        OpenAiCompatProvider {
            name: descriptor.name.clone(),
            client: shared_client(),
            base_url: descriptor.base_url.trim_end_matches('/').to_string(),
            api_key: descriptor.api_key.clone(),
            default_headers: descriptor.default_headers.clone(),
            timeout: Duration::from_secs(descriptor.timeout_secs),
        }
    }

    fn request(&self, url: &str, body: &Value) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .post(url)
            .timeout(self.timeout)
            .header("Content-Type", "application/json");
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {key}"));
        }
        for (header, value) in &self.default_headers {
            req = req.header(header, value);
        }
        req.json(body)
    }

    fn build_body(
        model: &str,
        messages: &[Message],
        tools: &[ToolDefinition],
        params: ProviderParams,
        stream: bool,
    ) -> Value {
        let mut body = json!({
            "model": model,
            "messages": messages,
            "stream": stream,
        });
        if stream {
            body["stream_options"] = json!({"include_usage": true});
        }
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }
        if let Some(temperature) = params.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = params.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(top_p) = params.top_p {
            body["top_p"] = json!(top_p);
        }
        body
    }

    /// Send with transient retries; returns the successful response.
    async fn send_with_retries(&self, url: &str, body: &Value) -> Result<reqwest::Response, ProviderError> {
        let mut retry_after: Option<u64> = None;
        let mut last: Option<ProviderError> = None;

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let delay = retry_delay(attempt - 1, retry_after.take()).await;
                warn!(
                    "[providers] {} retry {}/{} after {}ms",
                    self.name,
                    attempt,
                    MAX_RETRIES,
                    delay.as_millis()
                );
            }

            let response = match self.request(url, body).send().await {
                Ok(r) => r,
                Err(e) if e.is_timeout() => {
                    last = Some(ProviderError::Timeout(e.to_string()));
                    continue;
                }
                Err(e) => {
                    last = Some(ProviderError::Transport(e.to_string()));
                    continue;
                }
            };

            let status = response.status().as_u16();
            if response.status().is_success() {
                return Ok(response);
            }

            retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            let body_text = response.text().await.unwrap_or_default();
            let message = truncate_utf8(&body_text, 500).to_string();
            error!("[providers] {} error {}: {}", self.name, status, message);

            // Auth errors are never retried
            if status == 401 || status == 403 {
                return Err(ProviderError::Auth(message));
            }
            if status == 404 {
                return Err(ProviderError::NotFound(message));
            }
            let err = if status == 429 {
                ProviderError::RateLimited {
                    message,
                    retry_after_secs: retry_after,
                }
            } else {
                ProviderError::Api { status, message }
            };
            if is_retryable_status(status) && attempt < MAX_RETRIES {
                last = Some(err);
                continue;
            }
            return Err(err);
        }
        Err(last.unwrap_or(ProviderError::Transport("retries exhausted".into())))
    }

    /// Parse a single SSE data payload from an OpenAI-compatible stream.
    fn parse_sse_chunk(data: &str) -> Option<StreamChunk> {
        if data == "[DONE]" {
            return None;
        }
        let v: Value = serde_json::from_str(data).ok()?;
        let model = v["model"].as_str().map(|s| s.to_string());
        let usage = parse_usage(v.get("usage"));

        let Some(choice) = v["choices"].get(0) else {
            // Usage-only trailer chunk
            return Some(StreamChunk {
                usage,
                model,
                ..Default::default()
            });
        };
        let delta = &choice["delta"];
        let finish_reason = choice["finish_reason"].as_str().map(|s| s.to_string());
        let delta_text = delta["content"].as_str().map(|s| s.to_string());

        let mut tool_calls = Vec::new();
        if let Some(tcs) = delta["tool_calls"].as_array() {
            for tc in tcs {
                tool_calls.push(ToolCallDelta {
                    index: tc["index"].as_u64().unwrap_or(0) as usize,
                    id: tc["id"].as_str().map(|s| s.to_string()),
                    function_name: tc["function"]["name"].as_str().map(|s| s.to_string()),
                    arguments_delta: tc["function"]["arguments"].as_str().map(|s| s.to_string()),
                });
            }
        }

        Some(StreamChunk {
            delta_text,
            tool_calls,
            finish_reason,
            usage,
            model,
        })
    }
}

fn parse_usage(usage: Option<&Value>) -> Option<TokenUsage> {
    let u = usage?;
    let input = u["prompt_tokens"].as_u64().unwrap_or(0);
    let output = u["completion_tokens"].as_u64().unwrap_or(0);
    if input == 0 && output == 0 {
        return None;
    }
    Some(TokenUsage {
        input_tokens: input,
        output_tokens: output,
        total_tokens: u["total_tokens"].as_u64().unwrap_or(input + output),
    })
}

#[async_trait]
impl ChatProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAiCompat
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn chat_stream(
        &self,
        model: &str,
        messages: &[Message],
        tools: &[ToolDefinition],
        params: ProviderParams,
    ) -> Result<ChunkReceiver, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = Self::build_body(model, messages, tools, params, true);
        info!("[providers] {} stream request model={}", self.name, model);

        let response = self.send_with_retries(&url, &body).await?;

        let (tx, rx) = mpsc::channel::<Result<StreamChunk, ProviderError>>(64);
        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut buffer = String::new();
            while let Some(result) = byte_stream.next().await {
                let bytes = match result {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx
                            .send(Err(ProviderError::Transport(format!("stream read: {e}"))))
                            .await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&bytes));

                // Process complete SSE lines
                while let Some(line_end) = buffer.find('\n') {
                    let line = buffer[..line_end].trim().to_string();
                    buffer = buffer[line_end + 1..].to_string();
                    if let Some(data) = line.strip_prefix("data: ") {
                        if data == "[DONE]" {
                            return;
                        }
                        if let Some(chunk) = Self::parse_sse_chunk(data) {
                            if tx.send(Ok(chunk)).await.is_err() {
                                return; // receiver hung up (cancellation)
                            }
                        }
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn chat(
        &self,
        model: &str,
        messages: &[Message],
        tools: &[ToolDefinition],
        params: ProviderParams,
    ) -> Result<ChatOutcome, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = Self::build_body(model, messages, tools, params, false);
        info!("[providers] {} request model={}", self.name, model);

        let response = self.send_with_retries(&url, &body).await?;
        let v: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Protocol(format!("response parse: {e}")))?;

        let choice = v["choices"]
            .get(0)
            .ok_or_else(|| ProviderError::Protocol("response has no choices".into()))?;
        let message = &choice["message"];
        let tool_calls: Vec<ToolCall> = message
            .get("tool_calls")
            .and_then(|tc| serde_json::from_value(tc.clone()).ok())
            .unwrap_or_default();

        Ok(ChatOutcome {
            text: message["content"].as_str().unwrap_or_default().to_string(),
            tool_calls,
            usage: parse_usage(v.get("usage")).unwrap_or_default(),
            model: v["model"].as_str().map(|s| s.to_string()),
        })
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, ProviderError> {
        let url = format!("{}/models", self.base_url);
        let mut req = self.client.get(&url).timeout(Duration::from_secs(10));
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {key}"));
        }
        let response = req
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ProviderError::Api {
                status: response.status().as_u16(),
                message: "list_models failed".into(),
            });
        }
        let v: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Protocol(format!("models parse: {e}")))?;
        let models = v["data"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|m| {
                        Some(ModelInfo {
                            id: m["id"].as_str()?.to_string(),
                            object: "model".into(),
                            created: m["created"].as_u64().unwrap_or(0),
                            owned_by: m["owned_by"].as_str().unwrap_or(&self.name).to_string(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(models)
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
