//! HTTP 传输（reqwest）
//!
//! 三种线格式：OpenAI 兼容（OpenAI / Azure / Ollama / 自定义）、Anthropic Messages、Google generateContent。
//! 非 OpenAI 的响应在这里归一为 OpenAI 形态，工具调用保留 `{id, name, input}` 结构化形态。
//! 流式：OpenAI 兼容与 Anthropic 走 SSE，Google 退化为单块。

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use serde_json::{json, Map, Value};

use crate::config::LlmSection;
use crate::llm::{
    ChatMessage, ChunkStream, CompletionRequest, CompletionTransport, LlmError, LlmProvider, Role,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const ANTHROPIC_DEFAULT_MAX_TOKENS: u64 = 4096;
const AZURE_DEFAULT_API_VERSION: &str = "2024-06-01";
const ERROR_BODY_PREVIEW: usize = 500;

pub struct HttpTransport {
    client: reqwest::Client,
    provider: LlmProvider,
    base_url: String,
    api_key: Option<String>,
    api_version: Option<String>,
}

impl HttpTransport {
    pub fn from_config(cfg: &LlmSection) -> Result<Self, LlmError> {
        let base_url = cfg
            .resolved_base_url()
            .ok_or_else(|| LlmError::Other(format!("No base_url configured for provider {}", cfg.provider)))?;
        let api_key = cfg.resolved_api_key();
        if api_key.is_none() && !cfg.provider.api_key_env_vars().is_empty() && cfg.provider != LlmProvider::Custom {
            return Err(LlmError::MissingApiKey(cfg.provider.to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs.max(1)))
            .build()
            .map_err(|e| LlmError::Other(e.to_string()))?;
        Ok(Self {
            client,
            provider: cfg.provider,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            api_version: cfg.api_version.clone(),
        })
    }

    fn post(&self, request: &CompletionRequest, streaming: bool) -> reqwest::RequestBuilder {
        match self.provider {
            LlmProvider::Azure => {
                let url = format!(
                    "{}/openai/deployments/{}/chat/completions?api-version={}",
                    self.base_url,
                    request.model,
                    self.api_version.as_deref().unwrap_or(AZURE_DEFAULT_API_VERSION)
                );
                let builder = self.client.post(url);
                match &self.api_key {
                    Some(key) => builder.header("api-key", key),
                    None => builder,
                }
            }
            LlmProvider::Anthropic => {
                let builder = self
                    .client
                    .post(format!("{}/v1/messages", self.base_url))
                    .header("anthropic-version", ANTHROPIC_VERSION);
                match &self.api_key {
                    Some(key) => builder.header("x-api-key", key),
                    None => builder,
                }
            }
            LlmProvider::Google => {
                let method = if streaming { "streamGenerateContent" } else { "generateContent" };
                let builder = self.client.post(format!(
                    "{}/v1beta/models/{}:{}",
                    self.base_url, request.model, method
                ));
                match &self.api_key {
                    Some(key) => builder.header("x-goog-api-key", key),
                    None => builder,
                }
            }
            LlmProvider::OpenAi | LlmProvider::Ollama | LlmProvider::Custom => {
                let builder = self.client.post(format!("{}/chat/completions", self.base_url));
                match &self.api_key {
                    Some(key) => builder.bearer_auth(key),
                    None => builder,
                }
            }
        }
    }

    fn body(&self, request: &CompletionRequest) -> Value {
        match self.provider {
            LlmProvider::Anthropic => anthropic_body(request),
            LlmProvider::Google => google_body(request),
            _ => request.to_openai_body(),
        }
    }

    async fn execute(&self, request: &CompletionRequest, streaming: bool) -> Result<reqwest::Response, LlmError> {
        let response = self
            .post(request, streaming)
            .json(&self.body(request))
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        Err(LlmError::Http {
            status: status.as_u16(),
            message: text.chars().take(ERROR_BODY_PREVIEW).collect(),
        })
    }
}

#[async_trait]
impl CompletionTransport for HttpTransport {
    async fn send(&self, request: &CompletionRequest) -> Result<Value, LlmError> {
        let mut request = request.clone();
        request.params.remove("stream");
        let raw: Value = self
            .execute(&request, false)
            .await?
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        match self.provider {
            LlmProvider::Anthropic => Ok(normalize_anthropic(&raw)),
            LlmProvider::Google => Ok(normalize_google(&raw)),
            _ => Ok(raw),
        }
    }

    async fn stream(&self, request: &CompletionRequest) -> Result<ChunkStream, LlmError> {
        let handler: fn(&str, &str) -> Option<String> = match self.provider {
            LlmProvider::Google => {
                let raw = self.send(request).await?;
                let content = crate::llm::CompletionResponse::from_raw(&raw).content;
                return Ok(Box::pin(futures_util::stream::iter(vec![Ok(content)])));
            }
            LlmProvider::Anthropic => anthropic_delta,
            _ => openai_delta,
        };
        let mut request = request.clone();
        request.params.insert("stream".into(), Value::Bool(true));
        let response = self.execute(&request, true).await?;
        let stream = response
            .bytes_stream()
            .eventsource()
            .filter_map(move |event| async move {
                match event {
                    Ok(event) => handler(&event.event, &event.data).map(Ok),
                    Err(e) => Some(Err(LlmError::Network(e.to_string()))),
                }
            });
        Ok(Box::pin(stream))
    }

    fn name(&self) -> &str {
        self.provider.as_str()
    }
}

fn map_reqwest_error(e: reqwest::Error) -> LlmError {
    if e.is_timeout() {
        LlmError::Timeout(e.to_string())
    } else if e.is_connect() || e.is_request() {
        LlmError::Network(e.to_string())
    } else {
        LlmError::Other(e.to_string())
    }
}

fn openai_delta(_event: &str, data: &str) -> Option<String> {
    if data.trim() == "[DONE]" {
        return None;
    }
    let v: Value = serde_json::from_str(data).ok()?;
    v["choices"][0]["delta"]["content"]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn anthropic_delta(event: &str, data: &str) -> Option<String> {
    if event != "content_block_delta" {
        return None;
    }
    let v: Value = serde_json::from_str(data).ok()?;
    v["delta"]["text"].as_str().map(str::to_string)
}

fn system_text(messages: &[ChatMessage]) -> Option<String> {
    let joined = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    (!joined.is_empty()).then_some(joined)
}

/// Anthropic：system 单独字段；连续同角色消息合并为一条（tool_result 以 user 身份发送）
fn anthropic_body(request: &CompletionRequest) -> Value {
    let mut turns: Vec<(&'static str, Vec<Value>)> = Vec::new();
    for m in request.messages.iter().filter(|m| m.role != Role::System) {
        let (role, blocks) = match m.role {
            Role::Assistant => {
                let mut blocks = Vec::new();
                if !m.content.is_empty() {
                    blocks.push(json!({"type": "text", "text": m.content}));
                }
                for call in &m.tool_calls {
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.name,
                        "input": call.arguments,
                    }));
                }
                ("assistant", blocks)
            }
            Role::Tool => (
                "user",
                vec![json!({
                    "type": "tool_result",
                    "tool_use_id": m.tool_call_id.as_deref().unwrap_or("unknown"),
                    "content": m.content,
                })],
            ),
            _ => ("user", vec![json!({"type": "text", "text": m.content})]),
        };
        match turns.last_mut() {
            Some((last_role, last_blocks)) if *last_role == role => last_blocks.extend(blocks),
            _ => turns.push((role, blocks)),
        }
    }

    let mut body = request.params.clone();
    body.insert("model".into(), json!(request.model));
    body.entry("max_tokens").or_insert(json!(ANTHROPIC_DEFAULT_MAX_TOKENS));
    if let Some(system) = system_text(&request.messages) {
        body.insert("system".into(), json!(system));
    }
    body.insert(
        "messages".into(),
        Value::Array(
            turns
                .into_iter()
                .map(|(role, content)| json!({"role": role, "content": content}))
                .collect(),
        ),
    );
    Value::Object(body)
}

fn normalize_anthropic(raw: &Value) -> Value {
    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for block in raw["content"].as_array().into_iter().flatten() {
        match block["type"].as_str() {
            Some("text") => text.push_str(block["text"].as_str().unwrap_or_default()),
            Some("tool_use") => tool_calls.push(json!({
                "id": block["id"],
                "name": block["name"],
                "input": block["input"],
            })),
            _ => {}
        }
    }
    let finish = match raw["stop_reason"].as_str() {
        Some("tool_use") => "tool_calls",
        Some("max_tokens") => "length",
        _ => "stop",
    };
    let prompt = raw["usage"]["input_tokens"].as_u64().unwrap_or(0);
    let completion = raw["usage"]["output_tokens"].as_u64().unwrap_or(0);
    json!({
        "model": raw["model"],
        "choices": [{
            "message": {"role": "assistant", "content": text, "tool_calls": tool_calls},
            "finish_reason": finish,
        }],
        "usage": {
            "prompt_tokens": prompt,
            "completion_tokens": completion,
            "total_tokens": prompt + completion,
        }
    })
}

/// Google：role 为 user / model；采样参数放进 generationConfig
fn google_body(request: &CompletionRequest) -> Value {
    let mut names_by_id: HashMap<&str, &str> = HashMap::new();
    let mut contents = Vec::new();
    for m in request.messages.iter().filter(|m| m.role != Role::System) {
        match m.role {
            Role::Assistant => {
                let mut parts = Vec::new();
                if !m.content.is_empty() {
                    parts.push(json!({"text": m.content}));
                }
                for call in &m.tool_calls {
                    names_by_id.insert(call.id.as_str(), call.name.as_str());
                    parts.push(json!({"functionCall": {"name": call.name, "args": call.arguments}}));
                }
                contents.push(json!({"role": "model", "parts": parts}));
            }
            Role::Tool => {
                let name = m
                    .tool_call_id
                    .as_deref()
                    .and_then(|id| names_by_id.get(id).copied())
                    .unwrap_or("tool");
                contents.push(json!({
                    "role": "user",
                    "parts": [{"functionResponse": {"name": name, "response": {"content": m.content}}}]
                }));
            }
            _ => contents.push(json!({"role": "user", "parts": [{"text": m.content}]})),
        }
    }

    let mut generation = Map::new();
    for (from, to) in [("temperature", "temperature"), ("top_p", "topP"), ("max_tokens", "maxOutputTokens")] {
        if let Some(v) = request.params.get(from) {
            generation.insert(to.into(), v.clone());
        }
    }

    let mut body = Map::new();
    body.insert("contents".into(), Value::Array(contents));
    if let Some(system) = system_text(&request.messages) {
        body.insert("systemInstruction".into(), json!({"parts": [{"text": system}]}));
    }
    if let Some(tools) = request.params.get("tools") {
        body.insert("tools".into(), tools.clone());
    }
    if !generation.is_empty() {
        body.insert("generationConfig".into(), Value::Object(generation));
    }
    Value::Object(body)
}

fn normalize_google(raw: &Value) -> Value {
    let candidate = &raw["candidates"][0];
    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for (i, part) in candidate["content"]["parts"].as_array().into_iter().flatten().enumerate() {
        if let Some(t) = part["text"].as_str() {
            text.push_str(t);
        }
        if let Some(call) = part.get("functionCall") {
            tool_calls.push(json!({
                "id": format!("call_{i}"),
                "name": call["name"],
                "input": call.get("args").cloned().unwrap_or_else(|| json!({})),
            }));
        }
    }
    let finish = match candidate["finishReason"].as_str() {
        Some("MAX_TOKENS") => "length",
        _ if !tool_calls.is_empty() => "tool_calls",
        _ => "stop",
    };
    let usage = &raw["usageMetadata"];
    json!({
        "model": raw.get("modelVersion").cloned().unwrap_or(Value::Null),
        "choices": [{
            "message": {"role": "assistant", "content": text, "tool_calls": tool_calls},
            "finish_reason": finish,
        }],
        "usage": {
            "prompt_tokens": usage["promptTokenCount"].as_u64().unwrap_or(0),
            "completion_tokens": usage["candidatesTokenCount"].as_u64().unwrap_or(0),
            "total_tokens": usage["totalTokenCount"].as_u64().unwrap_or(0),
        }
    })
}
