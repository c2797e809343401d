//! 工具执行器（派发层）
//!
//! execute(name, args) 依次做：查找 → 禁用检查 → 安全检查 → 按确认级别征求批准 → 带超时执行 → 记录统计。
//! 工具内部 panic 被捕获为失败结果；委派类工具（runs_own_deadline）由自身的任务截止时间约束，不套单次超时。
//! 所有失败都以 ToolResult 值返回，不向调用方抛错，执行循环可以继续迭代。
//! 每次调用输出一条结构化审计日志（JSON）。

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::FutureExt;
use serde::{Serialize, Serializer};
use serde_json::Value;
use tokio::time::timeout;

use crate::core::ConfirmationLevel;
use crate::llm::ToolCall;
use crate::tools::registry::Lookup;
use crate::tools::{RiskLevel, ToolRegistry};

/// 统一的结果信封
#[derive(Debug, Clone, Serialize)]
pub struct ToolResult {
    pub tool_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(serialize_with = "as_secs")]
    pub execution_time: Duration,
}

fn as_secs<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

impl ToolResult {
    pub fn ok(tool_name: &str, result: Value, execution_time: Duration) -> Self {
        Self {
            tool_name: tool_name.to_string(),
            call_id: None,
            success: true,
            result: Some(result),
            error: None,
            execution_time,
        }
    }

    pub fn failed(tool_name: &str, error: impl Into<String>, execution_time: Duration) -> Self {
        Self {
            tool_name: tool_name.to_string(),
            call_id: None,
            success: false,
            result: None,
            error: Some(error.into()),
            execution_time,
        }
    }

    /// 作为 tool 消息写回对话的文本
    pub fn to_message_content(&self) -> String {
        match (&self.result, &self.error) {
            (_, Some(err)) if !self.success => format!("Error: {err}"),
            (Some(Value::String(s)), _) => s.clone(),
            (Some(v), _) => serde_json::to_string_pretty(v).unwrap_or_else(|_| v.to_string()),
            (None, _) => String::new(),
        }
    }
}

/// 人工确认接口（由嵌入方提供，如 CLI 提示）
#[async_trait]
pub trait ToolApprover: Send + Sync {
    async fn approve(&self, tool_name: &str, args: &Value, risk: RiskLevel) -> bool;
}

/// 确认级别与风险级别共同决定是否需要确认
pub fn requires_confirmation(level: ConfirmationLevel, risk: RiskLevel) -> bool {
    match level {
        ConfirmationLevel::None => false,
        ConfirmationLevel::Low => risk >= RiskLevel::High,
        ConfirmationLevel::Medium => risk >= RiskLevel::Medium,
        ConfirmationLevel::High => true,
    }
}

/// 工具执行器：对每次调用施加超时，结果统一为 ToolResult
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
    confirmation_level: ConfirmationLevel,
    approver: Option<Arc<dyn ToolApprover>>,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, timeout_secs: u64) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs.max(1)),
            confirmation_level: ConfirmationLevel::None,
            approver: None,
        }
    }

    pub fn with_confirmation(
        mut self,
        level: ConfirmationLevel,
        approver: Option<Arc<dyn ToolApprover>>,
    ) -> Self {
        self.confirmation_level = level;
        self.approver = approver;
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.list()
    }

    /// 派发一次模型请求的调用，结果带上 call_id
    pub async fn execute_call(&self, call: &ToolCall) -> ToolResult {
        let mut result = self.execute(&call.name, call.arguments.clone()).await;
        result.call_id = Some(call.id.clone());
        result
    }

    /// 执行指定工具；任何失败都以 success = false 的结果返回
    pub async fn execute(&self, tool_name: &str, args: Value) -> ToolResult {
        let start = Instant::now();
        let (tool, stats) = match self.registry.lookup(tool_name) {
            Lookup::Found(tool, stats) => (tool, stats),
            Lookup::Disabled => {
                tracing::warn!(tool = %tool_name, "dispatch to disabled tool");
                return ToolResult::failed(
                    tool_name,
                    format!("Tool '{tool_name}' is disabled"),
                    start.elapsed(),
                );
            }
            Lookup::NotFound => {
                tracing::warn!(tool = %tool_name, "dispatch to unknown tool");
                return ToolResult::failed(
                    tool_name,
                    format!("Tool '{tool_name}' not found"),
                    start.elapsed(),
                );
            }
        };

        let preview = args_preview(&args);
        let outcome: Result<Value, (String, &str)> = 'run: {
            if let Some(check) = tool.safety_check(&args).filter(|c| !c.passed) {
                break 'run Err((
                    format!("Safety check failed ({}): {}", check.check_type, check.message),
                    "blocked",
                ));
            }
            if requires_confirmation(self.confirmation_level, tool.risk()) {
                match &self.approver {
                    Some(approver) => {
                        if !approver.approve(tool_name, &args, tool.risk()).await {
                            break 'run Err((
                                format!("Execution of '{tool_name}' was not approved"),
                                "rejected",
                            ));
                        }
                    }
                    None => tracing::debug!(
                        tool = %tool_name,
                        "confirmation required but no approver installed, proceeding"
                    ),
                }
            }
            let run = AssertUnwindSafe(tool.execute(args)).catch_unwind();
            let finished = if tool.runs_own_deadline() {
                Ok(run.await)
            } else {
                timeout(self.timeout, run).await
            };
            match finished {
                Ok(Ok(Ok(value))) => Ok(value),
                Ok(Ok(Err(e))) => Err((e, "error")),
                Ok(Err(payload)) => {
                    let message = panic_message(payload.as_ref());
                    tracing::error!(tool = %tool_name, panic = %message, "tool panicked");
                    Err((format!("Tool '{tool_name}' panicked: {message}"), "panic"))
                }
                Err(_) => Err((
                    format!(
                        "Tool '{tool_name}' timed out after {}s",
                        self.timeout.as_secs()
                    ),
                    "timeout",
                )),
            }
        };

        let elapsed = start.elapsed();
        stats.record(outcome.is_ok(), elapsed);
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool_name,
            "ok": outcome.is_ok(),
            "outcome": outcome.as_ref().map(|_| "ok").unwrap_or_else(|e| e.1),
            "duration_ms": elapsed.as_millis() as u64,
            "args_preview": preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        match outcome {
            Ok(value) => ToolResult::ok(tool_name, value, elapsed),
            Err((error, _)) => ToolResult::failed(tool_name, error, elapsed),
        }
    }
}

/// panic 负载转为文本
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
