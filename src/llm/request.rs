//! 请求构造
//!
//! 一个通用构造器按 [`ProviderCapabilities`] 决定附加哪些字段：
//! 未设置（None）的参数永远不写入；没有工具时不写任何工具字段。

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::config::LlmSection;
use crate::llm::{ChatMessage, LlmProvider, ProviderCapabilities, Role, ToolFormat};

/// 工具描述（由 ToolRegistry 导出，传给模型）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// 单次调用的覆盖项
#[derive(Debug, Clone, Default)]
pub struct CompletionOptions {
    pub tools: Vec<ToolSpec>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub stream: bool,
}

impl CompletionOptions {
    pub fn with_tools(tools: Vec<ToolSpec>) -> Self {
        Self {
            tools,
            ..Default::default()
        }
    }
}

/// 已按 provider 成形的请求：消息保持统一结构，由传输层转换线格式
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub provider: LlmProvider,
    pub model: String,
    pub messages: Vec<ChatMessage>,
    /// 采样参数与工具字段
    pub params: Map<String, Value>,
}

impl CompletionRequest {
    pub fn has_param(&self, key: &str) -> bool {
        self.params.contains_key(key)
    }

    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    /// OpenAI 兼容的请求体
    pub fn to_openai_body(&self) -> Value {
        let mut body = self.params.clone();
        body.insert("model".into(), Value::String(self.model.clone()));
        body.insert(
            "messages".into(),
            Value::Array(self.messages.iter().map(openai_message).collect()),
        );
        Value::Object(body)
    }
}

fn openai_message(m: &ChatMessage) -> Value {
    let mut obj = Map::new();
    obj.insert("role".into(), Value::String(m.role.as_str().into()));
    obj.insert("content".into(), Value::String(m.content.clone()));
    if m.role == Role::Assistant && !m.tool_calls.is_empty() {
        let calls: Vec<Value> = m
            .tool_calls
            .iter()
            .map(|c| {
                json!({
                    "id": c.id,
                    "type": "function",
                    "function": { "name": c.name, "arguments": c.arguments.to_string() }
                })
            })
            .collect();
        obj.insert("tool_calls".into(), Value::Array(calls));
    }
    if let Some(id) = &m.tool_call_id {
        obj.insert("tool_call_id".into(), Value::String(id.clone()));
    }
    Value::Object(obj)
}

/// 通用请求构造器，构造后不可变
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    provider: LlmProvider,
    capabilities: ProviderCapabilities,
    model: String,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    top_p: Option<f32>,
    frequency_penalty: Option<f32>,
    presence_penalty: Option<f32>,
    tool_choice: Option<String>,
}

impl RequestBuilder {
    pub fn from_config(cfg: &LlmSection) -> Self {
        Self {
            provider: cfg.provider,
            capabilities: cfg.provider.capabilities(),
            model: cfg.model.clone(),
            temperature: cfg.temperature,
            max_tokens: cfg.max_tokens,
            top_p: cfg.top_p,
            frequency_penalty: cfg.frequency_penalty,
            presence_penalty: cfg.presence_penalty,
            tool_choice: cfg.tool_choice.clone(),
        }
    }

    pub fn provider(&self) -> LlmProvider {
        self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn build(&self, messages: Vec<ChatMessage>, options: &CompletionOptions) -> CompletionRequest {
        let caps = self.capabilities;
        let mut params = Map::new();

        put_f32(&mut params, "temperature", options.temperature.or(self.temperature));
        if let Some(max_tokens) = options.max_tokens.or(self.max_tokens) {
            params.insert("max_tokens".into(), json!(max_tokens));
        }
        if caps.supports_top_p {
            put_f32(&mut params, "top_p", self.top_p);
        }
        if caps.supports_penalties {
            put_f32(&mut params, "frequency_penalty", self.frequency_penalty);
            put_f32(&mut params, "presence_penalty", self.presence_penalty);
        }
        if options.stream {
            params.insert("stream".into(), Value::Bool(true));
        }

        if !options.tools.is_empty() {
            params.insert("tools".into(), format_tools(caps.tool_format, &options.tools));
            if caps.supports_tool_choice {
                if let Some(choice) = &self.tool_choice {
                    params.insert("tool_choice".into(), Value::String(choice.clone()));
                }
            }
        }

        CompletionRequest {
            provider: self.provider,
            model: self.model.clone(),
            messages,
            params,
        }
    }
}

fn put_f32(params: &mut Map<String, Value>, key: &str, value: Option<f32>) {
    if let Some(v) = value {
        // f32 -> f64 会带出 0.10000000149 之类的尾数，先经十进制字符串转换
        let v: f64 = format!("{v}").parse().unwrap_or(v as f64);
        params.insert(key.into(), json!(v));
    }
}

fn format_tools(format: ToolFormat, tools: &[ToolSpec]) -> Value {
    match format {
        ToolFormat::OpenAiFunction => Value::Array(
            tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect(),
        ),
        ToolFormat::AnthropicFlat => Value::Array(
            tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.parameters,
                    })
                })
                .collect(),
        ),
        ToolFormat::GoogleDeclarations => {
            let declarations: Vec<Value> = tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    })
                })
                .collect();
            json!([{ "function_declarations": declarations }])
        }
    }
}
