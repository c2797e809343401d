//! 对话消息与消息折叠
//!
//! 目标接口不支持 system / tool 角色时，按配置把内容折叠进 user 消息并加上标签，而不是直接丢弃。
//! 折叠与 provider 无关，开关打开即对所有后端生效。

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// 模型请求的一次工具调用；id 用于与 ToolResult 对应
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    pub fn assistant_with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::plain(Role::Assistant, content)
        }
    }

    pub fn tool(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(call_id.into()),
            ..Self::plain(Role::Tool, content)
        }
    }
}

/// 消息折叠开关（来自 [llm] 配置）
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MessageShaping {
    pub disable_system_prompt: bool,
    pub disable_tool_role: bool,
}

impl MessageShaping {
    /// 组装一轮请求：可选系统提示 + 历史 + 当前用户输入
    pub fn build_messages(
        &self,
        user: &str,
        system: Option<&str>,
        history: &[ChatMessage],
    ) -> Vec<ChatMessage> {
        let system = system.filter(|s| !s.trim().is_empty());
        let mut messages = Vec::with_capacity(history.len() + 2);
        match system {
            Some(sys) if self.disable_system_prompt => {
                messages.extend(self.prepare_messages(history));
                messages.push(ChatMessage::user(format!(
                    "System instructions: {sys}\n\nUser request: {user}"
                )));
            }
            Some(sys) => {
                messages.push(ChatMessage::system(sys));
                messages.extend(self.prepare_messages(history));
                messages.push(ChatMessage::user(user));
            }
            None => {
                messages.extend(self.prepare_messages(history));
                messages.push(ChatMessage::user(user));
            }
        }
        messages
    }

    /// 按开关改写已有消息；assistant 消息保持原样
    pub fn prepare_messages(&self, messages: &[ChatMessage]) -> Vec<ChatMessage> {
        messages
            .iter()
            .map(|m| match m.role {
                Role::System if self.disable_system_prompt => {
                    ChatMessage::user(format!("System instructions: {}", m.content))
                }
                Role::Tool if self.disable_tool_role => ChatMessage::user(format!(
                    "Tool result for call_id {}: {}",
                    m.tool_call_id.as_deref().unwrap_or("unknown"),
                    m.content
                )),
                _ => m.clone(),
            })
            .collect()
    }
}
