//! Agent 错误类型
//!
//! 控制类失败（超时、迭代上限、关闭请求）各自独立分类；其余错误保留来源类型名，
//! 由执行器写入 task_failed 事件的 error_type 字段。

use thiserror::Error;

use crate::config::ConfigError;
use crate::execution::PlanError;

/// Agent 运行过程中可能出现的错误
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Task execution timed out after {timeout} seconds")]
    TaskTimeout { timeout: u64 },

    #[error("Interactive chat timed out after {timeout} seconds")]
    ChatTimeout { timeout: u64 },

    #[error("Task exceeded maximum iterations ({max_iterations})")]
    IterationLimitExceeded { max_iterations: usize },

    #[error("Task cancelled due to shutdown request")]
    ShutdownRequested,

    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("JSON parse error: {0}")]
    JsonParseError(String),

    #[error("Plan error: {0}")]
    Plan(#[from] PlanError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Task panicked: {0}")]
    Panic(String),
}

impl AgentError {
    /// 稳定的分类名，写入事件的 error_type
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::TaskTimeout { .. } => "TaskTimeout",
            AgentError::ChatTimeout { .. } => "ChatTimeout",
            AgentError::IterationLimitExceeded { .. } => "IterationLimitExceeded",
            AgentError::ShutdownRequested => "ShutdownRequested",
            AgentError::LlmError(_) => "LlmError",
            AgentError::ToolExecutionFailed(_) => "ToolExecutionFailed",
            AgentError::JsonParseError(_) => "JsonParseError",
            AgentError::Plan(_) => "PlanError",
            AgentError::Config(_) => "ConfigError",
            AgentError::Internal(_) => "InternalError",
            AgentError::Panic(_) => "Panic",
        }
    }

    /// 超时、迭代上限、关闭请求属于控制类失败
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            AgentError::TaskTimeout { .. }
                | AgentError::ChatTimeout { .. }
                | AgentError::IterationLimitExceeded { .. }
                | AgentError::ShutdownRequested
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_carry_classification_text() {
        let e = AgentError::IterationLimitExceeded { max_iterations: 3 };
        assert!(e.to_string().contains("maximum iterations"));
        assert!(AgentError::TaskTimeout { timeout: 1 }.to_string().contains("timed out"));
        assert!(AgentError::ShutdownRequested.to_string().contains("shutdown request"));
        assert!(e.is_control());
        assert!(!AgentError::LlmError("x".into()).is_control());
        assert_eq!(AgentError::ChatTimeout { timeout: 5 }.kind(), "ChatTimeout");
    }
}
