//! 共享数据类型：执行模式、任务状态、确认级别、事件

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 执行模式：chat 为单轮交互，agent 为多步自主执行
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Chat,
    Agent,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Chat => "chat",
            ExecutionMode::Agent => "agent",
        }
    }
}

/// 任务 / 步骤状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// 步骤复杂度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    #[default]
    Simple,
    Complex,
}

/// 工具执行前需要人工确认的阈值；级别越高，需要确认的工具越多
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationLevel {
    None,
    Low,
    #[default]
    Medium,
    High,
}

/// 事件严重级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
}

/// 单个可观察事件；一旦发出不再修改
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEvent {
    pub event_type: String,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub level: EventLevel,
    pub timestamp: DateTime<Utc>,
}

impl AgentEvent {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            data: Map::new(),
            message: None,
            level: EventLevel::Info,
            timestamp: Utc::now(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_level(mut self, level: EventLevel) -> Self {
        self.level = level;
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }
}

/// 一次用户请求
#[derive(Debug, Clone, Default)]
pub struct Task {
    pub description: String,
    pub mode: ExecutionMode,
    /// 期望的最终输出 JSON Schema（可选）
    pub output_schema: Option<Value>,
    /// 附加上下文，序列化后放入首条 user 消息
    pub context_data: Map<String, Value>,
    /// 本任务不可见的工具
    pub excluded_tools: Vec<String>,
    pub system_prompt: Option<String>,
}

impl Task {
    pub fn new(description: impl Into<String>, mode: ExecutionMode) -> Self {
        Self {
            description: description.into(),
            mode,
            ..Default::default()
        }
    }

    pub fn agent(description: impl Into<String>) -> Self {
        Self::new(description, ExecutionMode::Agent)
    }

    pub fn chat(description: impl Into<String>) -> Self {
        Self::new(description, ExecutionMode::Chat)
    }

    pub fn with_output_schema(mut self, schema: Value) -> Self {
        self.output_schema = Some(schema);
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context_data.insert(key.into(), value);
        self
    }

    pub fn excluding(mut self, tools: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.excluded_tools.extend(tools.into_iter().map(Into::into));
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }
}
