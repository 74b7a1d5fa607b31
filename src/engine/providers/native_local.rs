// ── Waystation Engine: Native Local Engine Provider ────────────────────────
// Adapter for the local model engine (Ollama-style API): translates the
// OpenAI chat schema to `/api/chat` (NDJSON streaming) and lists models from
// `/api/tags`. Per-model parameter overrides from config are merged into the
// engine's `options` object. Embeddings pass through at the server layer.

use super::{ChatOutcome, ChatProvider, ChunkReceiver, ProviderDescriptor, ProviderError, ProviderKind, ProviderParams};
use crate::atoms::types::{
    Message, ModelInfo, Role, StreamChunk, TokenUsage, ToolCall, ToolCallDelta, ToolDefinition,
};
use crate::engine::http::shared_client;
use async_trait::async_trait;
use futures::StreamExt;
use log::info;
use reqwest::Client;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

pub struct NativeLocalProvider {
    name: String,
    client: Client,
    base_url: String,
    timeout: Duration,
    /// Per-model `options` overrides from config.
    model_overrides: HashMap<String, Map<String, Value>>,
}

impl NativeLocalProvider {
    pub fn new(descriptor: &ProviderDescriptor) -> Self {
        NativeLocalProvider {
            name: descriptor.name.clone(),
            client: shared_client(),
            base_url: descriptor.base_url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(descriptor.timeout_secs),
            model_overrides: descriptor.model_overrides.clone(),
        }
    }

    fn build_body(
        &self,
        model: &str,
        messages: &[Message],
        tools: &[ToolDefinition],
        params: ProviderParams,
        stream: bool,
    ) -> Value {
        let mut options = self
            .model_overrides
            .get(model)
            .cloned()
            .unwrap_or_default();
        if let Some(temperature) = params.temperature {
            options.insert("temperature".into(), json!(temperature));
        }
        if let Some(top_p) = params.top_p {
            options.insert("top_p".into(), json!(top_p));
        }
        if let Some(max_tokens) = params.max_tokens {
            options.insert("num_predict".into(), json!(max_tokens));
        }

        let mut body = json!({
            "model": model,
            "messages": format_messages(messages),
            "stream": stream,
        });
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }
        if !options.is_empty() {
            body["options"] = Value::Object(options);
        }
        body
    }

    /// Parse one NDJSON line of an engine chat response.
    fn parse_line(line: &str) -> Option<StreamChunk> {
        let v: Value = serde_json::from_str(line).ok()?;
        let model = v["model"].as_str().map(|s| s.to_string());
        let message = &v["message"];
        let delta_text = message["content"]
            .as_str()
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string());

        let mut tool_calls = Vec::new();
        if let Some(calls) = message["tool_calls"].as_array() {
            for (index, call) in calls.iter().enumerate() {
                let function = &call["function"];
                tool_calls.push(ToolCallDelta {
                    index,
                    id: Some(format!("call_{}", Uuid::new_v4())),
                    function_name: function["name"].as_str().map(|s| s.to_string()),
                    // The engine sends arguments as a JSON object; the chat
                    // schema carries them as an encoded string
                    arguments_delta: Some(function["arguments"].to_string()),
                });
            }
        }

        let done = v["done"].as_bool().unwrap_or(false);
        let usage = if done {
            let input = v["prompt_eval_count"].as_u64().unwrap_or(0);
            let output = v["eval_count"].as_u64().unwrap_or(0);
            (input > 0 || output > 0).then_some(TokenUsage {
                input_tokens: input,
                output_tokens: output,
                total_tokens: input + output,
            })
        } else {
            None
        };

        Some(StreamChunk {
            delta_text,
            tool_calls,
            finish_reason: done.then(|| "stop".to_string()),
            usage,
            model,
        })
    }
}

/// Reduce messages to the engine's wire shape.
fn format_messages(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|msg| {
            let mut m = json!({
                "role": msg.role,
                "content": msg.content.as_text(),
            });
            if msg.role == Role::Assistant {
                if let Some(calls) = &msg.tool_calls {
                    let formatted: Vec<Value> = calls
                        .iter()
                        .map(|call| {
                            let arguments: Value =
                                serde_json::from_str(&call.function.arguments)
                                    .unwrap_or(Value::Object(Map::new()));
                            json!({"function": {"name": call.function.name, "arguments": arguments}})
                        })
                        .collect();
                    m["tool_calls"] = json!(formatted);
                }
            }
            m
        })
        .collect()
}

#[async_trait]
impl ChatProvider for NativeLocalProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::NativeLocal
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
        let url = format!("{}/api/chat", self.base_url);
        let body = self.build_body(model, messages, tools, params, true);
        info!("[providers] {} stream request model={}", self.name, model);

        let response = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(e.to_string())
                } else {
                    ProviderError::Transport(format!("cannot reach local engine: {e}"))
                }
            })?;
        let status = response.status().as_u16();
        if !response.status().is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(if status == 404 {
                ProviderError::NotFound(message)
            } else {
                ProviderError::Api { status, message }
            });
        }

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
                while let Some(line_end) = buffer.find('\n') {
                    let line = buffer[..line_end].trim().to_string();
                    buffer = buffer[line_end + 1..].to_string();
                    if line.is_empty() {
                        continue;
                    }
                    if let Some(chunk) = Self::parse_line(&line) {
                        let done = chunk.finish_reason.is_some();
                        if tx.send(Ok(chunk)).await.is_err() || done {
                            return;
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
        let url = format!("{}/api/chat", self.base_url);
        let body = self.build_body(model, messages, tools, params, false);
        info!("[providers] {} request model={}", self.name, model);

        let response = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(format!("cannot reach local engine: {e}")))?;
        let status = response.status().as_u16();
        if !response.status().is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api { status, message });
        }

        let v: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Protocol(format!("response parse: {e}")))?;
        let message = &v["message"];
        let tool_calls: Vec<ToolCall> = message["tool_calls"]
            .as_array()
            .map(|calls| {
                calls
                    .iter()
                    .filter_map(|call| {
                        let function = &call["function"];
                        Some(ToolCall {
                            id: format!("call_{}", Uuid::new_v4()),
                            call_type: "function".into(),
                            function: crate::atoms::types::FunctionCall {
                                name: function["name"].as_str()?.to_string(),
                                arguments: function["arguments"].to_string(),
                            },
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        let input = v["prompt_eval_count"].as_u64().unwrap_or(0);
        let output = v["eval_count"].as_u64().unwrap_or(0);
        Ok(ChatOutcome {
            text: message["content"].as_str().unwrap_or_default().to_string(),
            tool_calls,
            usage: TokenUsage {
                input_tokens: input,
                output_tokens: output,
                total_tokens: input + output,
            },
            model: v["model"].as_str().map(|s| s.to_string()),
        })
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, ProviderError> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| ProviderError::Transport(format!("cannot reach local engine: {e}")))?;
        if !response.status().is_success() {
            return Err(ProviderError::Api {
                status: response.status().as_u16(),
                message: "tags listing failed".into(),
            });
        }
        let v: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Protocol(format!("tags parse: {e}")))?;
        let models = v["models"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|m| {
                        Some(ModelInfo {
                            id: m["name"].as_str()?.to_string(),
                            object: "model".into(),
                            created: 0,
                            owned_by: self.name.clone(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(models)
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::MessageContent;

    fn provider_with_overrides() -> NativeLocalProvider {
        let mut overrides = HashMap::new();
        let mut opts = Map::new();
        opts.insert("num_ctx".into(), json!(8192));
        overrides.insert("qwen".to_string(), opts);
        NativeLocalProvider::new(&ProviderDescriptor {
            name: "local".into(),
            kind: ProviderKind::NativeLocal,
            base_url: "http://localhost:11434".into(),
            api_key: None,
            default_headers: HashMap::new(),
            timeout_secs: 120,
            model_overrides: overrides,
        })
    }

    #[test]
    fn parse_text_line() {
        let line = r#"{"model":"qwen","message":{"role":"assistant","content":"hel"},"done":false}"#;
        let chunk = NativeLocalProvider::parse_line(line).unwrap();
        assert_eq!(chunk.delta_text.as_deref(), Some("hel"));
        assert!(chunk.finish_reason.is_none());
    }

    #[test]
    fn parse_done_line_carries_usage() {
        let line = r#"{"model":"qwen","message":{"role":"assistant","content":""},"done":true,"prompt_eval_count":11,"eval_count":4}"#;
        let chunk = NativeLocalProvider::parse_line(line).unwrap();
        assert_eq!(chunk.finish_reason.as_deref(), Some("stop"));
        let usage = chunk.usage.unwrap();
        assert_eq!(usage.input_tokens, 11);
        assert_eq!(usage.total_tokens, 15);
    }

    #[test]
    fn parse_tool_call_line() {
        let line = r#"{"message":{"role":"assistant","content":"","tool_calls":[{"function":{"name":"greet","arguments":{"who":"x"}}}]},"done":false}"#;
        let chunk = NativeLocalProvider::parse_line(line).unwrap();
        assert_eq!(chunk.tool_calls.len(), 1);
        assert_eq!(chunk.tool_calls[0].function_name.as_deref(), Some("greet"));
        assert_eq!(
            chunk.tool_calls[0].arguments_delta.as_deref(),
            Some(r#"{"who":"x"}"#)
        );
    }

    #[test]
    fn overrides_merge_under_params() {
        let provider = provider_with_overrides();
        let body = provider.build_body(
            "qwen",
            &[Message::user("hi")],
            &[],
            ProviderParams {
                temperature: Some(0.1),
                ..Default::default()
            },
            true,
        );
        assert_eq!(body["options"]["num_ctx"], json!(8192));
        assert_eq!(body["options"]["temperature"], json!(0.1));
        // Unknown model: no overrides, still gets params
        let body = provider.build_body("other", &[Message::user("hi")], &[], ProviderParams::default(), false);
        assert!(body.get("options").is_none());
    }

    #[test]
    fn tool_results_flatten_to_text() {
        let messages = vec![
            Message::assistant("calling"),
            Message::tool_result("call_1", "greet", "hi"),
        ];
        let formatted = format_messages(&messages);
        assert_eq!(formatted[1]["role"], json!("tool"));
        assert_eq!(formatted[1]["content"], json!("hi"));
    }

    #[test]
    fn assistant_tool_calls_reencode_arguments() {
        let messages = vec![Message {
            role: Role::Assistant,
            content: MessageContent::Text(String::new()),
            tool_calls: Some(vec![ToolCall {
                id: "call_1".into(),
                call_type: "function".into(),
                function: crate::atoms::types::FunctionCall {
                    name: "greet".into(),
                    arguments: r#"{"who":"x"}"#.into(),
                },
            }]),
            tool_call_id: None,
            name: None,
        }];
        let formatted = format_messages(&messages);
        assert_eq!(
            formatted[0]["tool_calls"][0]["function"]["arguments"]["who"],
            json!("x")
        );
    }
}
