//! 响应解析
//!
//! 传输层把各后端响应归一为 `{choices:[{message:{content, tool_calls}, finish_reason}], usage, model}`。
//! tool_calls 中每项可以是 OpenAI 形态（arguments 为 JSON 字符串，需要解码）
//! 或 Anthropic / Google 形态（`{id, name, input}`，已是结构化参数）。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::llm::ToolCall;

/// Token 用量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: &TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }

    fn from_value(v: Option<&Value>) -> Self {
        let Some(v) = v else {
            return Self::default();
        };
        let field = |k: &str| v.get(k).and_then(Value::as_u64).unwrap_or(0);
        let prompt_tokens = field("prompt_tokens");
        let completion_tokens = field("completion_tokens");
        let total_tokens = match field("total_tokens") {
            0 => prompt_tokens + completion_tokens,
            n => n,
        };
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens,
        }
    }
}

/// 一次模型往返的结果；失败也以值返回（success = false）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: TokenUsage,
    pub finish_reason: Option<String>,
    pub model: Option<String>,
    pub success: bool,
    pub error: Option<String>,
}

impl CompletionResponse {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// 从归一化响应中解析内容、工具调用、用量与结束原因
    pub fn from_raw(raw: &Value) -> Self {
        let choice = raw.get("choices").and_then(|c| c.get(0));
        let message = choice.and_then(|c| c.get("message"));
        let content = message
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let tool_calls = message
            .and_then(|m| m.get("tool_calls"))
            .and_then(Value::as_array)
            .map(|calls| extract_tool_calls(calls))
            .unwrap_or_default();

        Self {
            content,
            tool_calls,
            usage: TokenUsage::from_value(raw.get("usage")),
            finish_reason: choice
                .and_then(|c| c.get("finish_reason"))
                .and_then(Value::as_str)
                .map(str::to_string),
            model: raw.get("model").and_then(Value::as_str).map(str::to_string),
            success: true,
            error: None,
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    /// 输出被截断时模型并未真正结束
    pub fn is_truncated(&self) -> bool {
        matches!(self.finish_reason.as_deref(), Some("length" | "max_tokens"))
    }
}

/// 解析工具调用列表；单个调用解码失败只丢弃该调用
pub fn extract_tool_calls(raw_calls: &[Value]) -> Vec<ToolCall> {
    raw_calls
        .iter()
        .enumerate()
        .filter_map(|(index, raw)| parse_tool_call(index, raw))
        .collect()
}

fn parse_tool_call(index: usize, raw: &Value) -> Option<ToolCall> {
    let id = raw
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("call_{index}"));

    if let Some(function) = raw.get("function") {
        let Some(name) = function.get("name").and_then(Value::as_str) else {
            tracing::error!(call_id = %id, "tool call without function name, dropping");
            return None;
        };
        let arguments = match function.get("arguments") {
            Some(Value::String(s)) if s.trim().is_empty() => Value::Object(Map::new()),
            Some(Value::String(s)) => match serde_json::from_str::<Value>(s) {
                Ok(v) => v,
                Err(e) => {
                    tracing::error!(
                        call_id = %id,
                        tool = %name,
                        error = %e,
                        "failed to decode tool call arguments, dropping call"
                    );
                    return None;
                }
            },
            Some(Value::Null) | None => Value::Object(Map::new()),
            Some(other) => other.clone(),
        };
        return Some(ToolCall {
            id,
            name: name.to_string(),
            arguments,
        });
    }

    let Some(name) = raw.get("name").and_then(Value::as_str) else {
        tracing::error!(call_id = %id, "unrecognized tool call shape, dropping");
        return None;
    };
    let arguments = raw
        .get("input")
        .or_else(|| raw.get("args"))
        .cloned()
        .unwrap_or_else(|| Value::Object(Map::new()));
    Some(ToolCall {
        id,
        name: name.to_string(),
        arguments,
    })
}
