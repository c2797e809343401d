//! delegate_task：把子任务交给一个全新的 TaskExecutor 独立运行
//!
//! 子任务有自己的迭代预算与对话，不占用父任务的迭代次数；结果只回传摘要与工具调用统计。
//! 工具执行器以弱引用持有（执行器 → 注册表 → 本工具）。子任务看不到委派与批处理工具，不会递归委派。

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::config::ExecutionConfig;
use crate::core::types::Task;
use crate::core::ShutdownManager;
use crate::execution::{EventSink, TaskExecutor};
use crate::llm::LlmClient;
use crate::tools::schema::{parameters_for, parse_args};
use crate::tools::{RiskLevel, Tool, ToolExecutor};

pub const DELEGATE_TOOL_NAME: &str = "delegate_task";

/// 子任务中不可用的工具
pub const DELEGATION_EXCLUDED_TOOLS: &[&str] = &[
    DELEGATE_TOOL_NAME,
    "process_search_files_by_name",
    "process_search_files_by_content",
    "process_search_files_semantic",
];

#[derive(Deserialize, JsonSchema)]
struct DelegateArgs {
    /// 子任务描述，需自包含
    task_description: String,
    /// 期望的输出
    expected_output: Option<String>,
    /// 附加上下文数据
    #[serde(default)]
    context: Map<String, Value>,
    /// 子任务最大迭代次数
    max_iterations: Option<usize>,
}

pub struct DelegateTaskTool {
    llm: Arc<LlmClient>,
    tools: Weak<ToolExecutor>,
    config: ExecutionConfig,
    shutdown: ShutdownManager,
}

impl DelegateTaskTool {
    pub fn new(
        llm: Arc<LlmClient>,
        tools: Weak<ToolExecutor>,
        config: ExecutionConfig,
        shutdown: ShutdownManager,
    ) -> Self {
        Self {
            llm,
            tools,
            config,
            shutdown,
        }
    }

    fn sub_task(args: &DelegateArgs) -> Task {
        let mut description = args.task_description.clone();
        if let Some(expected) = &args.expected_output {
            description.push_str("\n\nExpected output: ");
            description.push_str(expected);
        }
        let mut task = Task::agent(description).excluding(DELEGATION_EXCLUDED_TOOLS.iter().copied());
        task.context_data = args.context.clone();
        task
    }
}

#[async_trait]
impl Tool for DelegateTaskTool {
    fn name(&self) -> &str {
        DELEGATE_TOOL_NAME
    }

    fn description(&self) -> &str {
        "Delegate a self-contained sub-task to an independent agent run. The sub-agent has the same tools \
(except delegation) and returns a summary of what it did."
    }

    fn parameters_schema(&self) -> Value {
        parameters_for::<DelegateArgs>()
    }

    fn risk(&self) -> RiskLevel {
        RiskLevel::Medium
    }

    fn runs_own_deadline(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let args: DelegateArgs = parse_args(self.name(), args)?;
        let tools = self
            .tools
            .upgrade()
            .ok_or_else(|| "Task delegation failed: tool executor is no longer available".to_string())?;
        let max_iterations = args.max_iterations.unwrap_or(self.config.max_iterations);
        let executor = TaskExecutor::new(self.llm.clone(), tools, self.config.clone(), self.shutdown.clone())
            .with_max_iterations(max_iterations);

        let sink = EventSink::silent(format!("delegate-{}", uuid::Uuid::new_v4()));
        tracing::info!(
            sub_task = %sink.task_id(),
            max_iterations,
            "delegating sub-task"
        );
        match executor.run(Self::sub_task(&args), &sink).await {
            Ok(outcome) => Ok(json!({
                "success": true,
                "summary": outcome.response,
                "iterations": outcome.iterations,
                "tool_calls_made": outcome.tool_calls_made,
                "successful_tool_calls": outcome.successful_tool_calls,
                "failed_tool_calls": outcome.failed_tool_calls,
            })),
            Err(e) => {
                tracing::warn!(sub_task = %sink.task_id(), error = %e, "delegated sub-task failed");
                Err(format!("Task delegation failed: {e}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LlmSection;
    use crate::llm::{ScriptedReply, ScriptedTransport};
    use crate::tools::ToolRegistry;

    fn setup(replies: Vec<ScriptedReply>) -> (Arc<ToolExecutor>, Arc<ScriptedTransport>) {
        let transport = Arc::new(ScriptedTransport::new(replies));
        let config = ExecutionConfig::default();
        let llm = Arc::new(LlmClient::new(&LlmSection::default(), &config, transport.clone()));
        let registry = Arc::new(ToolRegistry::new());
        registry.register_function("echo", "Echo", |args| Ok(args));
        let tools = Arc::new(ToolExecutor::new(registry.clone(), 5));
        registry.register(DelegateTaskTool::new(
            llm,
            Arc::downgrade(&tools),
            config,
            ShutdownManager::new(),
        ));
        (tools, transport)
    }

    #[tokio::test]
    async fn test_delegation_reports_sub_task_stats() {
        let (tools, transport) = setup(vec![
            ScriptedReply::tool_calls(&[("c1", "echo", json!({"a": 1}))]),
            ScriptedReply::text("Updated 2 files"),
        ]);
        let result = tools
            .execute(
                "delegate_task",
                json!({"task_description": "Update files", "expected_output": "A summary"}),
            )
            .await;
        assert!(result.success, "{:?}", result.error);
        let value = result.result.unwrap();
        assert_eq!(value["summary"], "Updated 2 files");
        assert_eq!(value["tool_calls_made"], 1);
        assert_eq!(value["iterations"], 2);

        // 子任务看不到委派工具
        let first = &transport.requests()[0];
        let tool_names: Vec<String> = first
            .param("tools")
            .and_then(Value::as_array)
            .map(|ts| {
                ts.iter()
                    .filter_map(|t| t["function"]["name"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        assert_eq!(tool_names, vec!["echo"]);
        assert!(first.messages.iter().any(|m| m.content.contains("Expected output: A summary")));
    }

    #[tokio::test]
    async fn test_delegation_failure_message() {
        let (tools, _) = setup(vec![ScriptedReply::http_error(401, "invalid api key")]);
        let result = tools
            .execute("delegate_task", json!({"task_description": "x"}))
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().starts_with("Task delegation failed: "));
    }

    #[tokio::test]
    async fn test_sub_task_uses_own_iteration_budget() {
        let (tools, transport) = setup(vec![
            ScriptedReply::truncated("a"),
            ScriptedReply::truncated("b"),
        ]);
        let result = tools
            .execute("delegate_task", json!({"task_description": "x", "max_iterations": 2}))
            .await;
        assert!(result.error.unwrap().contains("maximum iterations (2)"));
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_sub_task_outlives_dispatch_timeout() {
        // 派发层超时为 5s，子任务单轮模型调用耗时 90s，仍在子任务自身的 task_timeout 内
        let (tools, _) = setup(vec![
            ScriptedReply::text("Reviewed every file").delayed(std::time::Duration::from_secs(90)),
        ]);
        let result = tools
            .execute("delegate_task", json!({"task_description": "Review the module"}))
            .await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.result.unwrap()["summary"], "Reviewed every file");
    }
}
