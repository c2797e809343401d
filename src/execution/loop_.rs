//! 任务执行器：STARTED → ITERATING → COMPLETED | FAILED
//!
//! 每轮迭代：检查关闭请求 → 检查截止时间 → 检查迭代上限 → 调用模型 → 逐个派发工具调用。
//! 没有工具调用、内容非空且结束原因不是截断时视为完成；否则追加继续提示再迭代。
//! 所有失败都先以 task_failed 事件发出，再作为 Err 返回给调用方。

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tokio::time::{timeout_at, Instant};

use crate::config::ExecutionConfig;
use crate::core::types::{AgentEvent, EventLevel, ExecutionMode, Task, TaskStatus};
use crate::core::{AgentError, ShutdownManager, TaskScheduler};
use crate::execution::events::{self, EventSink, EventStream};
use crate::execution::output::{schema_instructions, StructuredOutput};
use crate::execution::plan::TaskPlan;
use crate::execution::planner::TaskPlanner;
use crate::llm::{ChatMessage, CompletionOptions, CompletionResponse, LlmClient, TokenUsage, ToolCall};
use crate::tools::executor::{panic_message, ToolResult};
use crate::tools::ToolExecutor;

const AGENT_SYSTEM_PROMPT: &str = "You are an autonomous coding assistant working inside a project workspace. \
Use the available tools to inspect and change files, run commands and search the code. \
Call tools whenever you need information instead of guessing. When the task is done, reply with a concise \
summary of what you did and do not call any more tools.";

const CHAT_SYSTEM_PROMPT: &str = "You are a helpful coding assistant. Answer the user's question directly. \
Use tools only when you need to look at the project.";

const CONTINUE_PROMPT: &str = "Continue working on the task. If it is complete, reply with a final summary and no tool calls.";

/// 事件中内容预览的最大字符数
const PREVIEW_CHARS: usize = 500;

/// 一次任务执行的结果
#[derive(Debug, Clone, Serialize)]
pub struct TaskOutcome {
    pub response: String,
    pub mode: ExecutionMode,
    pub iterations: usize,
    pub tool_calls_made: usize,
    pub successful_tool_calls: usize,
    pub failed_tool_calls: usize,
    pub usage: TokenUsage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<TaskPlan>,
    pub structured_output: StructuredOutput,
}

/// 运行中的可变状态
#[derive(Debug, Default)]
struct RunState {
    iterations: usize,
    tool_calls_made: usize,
    successful_tool_calls: usize,
    failed_tool_calls: usize,
    usage: TokenUsage,
    plan: Option<TaskPlan>,
}

fn preview(text: &str) -> String {
    if text.chars().count() <= PREVIEW_CHARS {
        text.to_string()
    } else {
        let cut: String = text.chars().take(PREVIEW_CHARS).collect();
        format!("{cut}...")
    }
}

/// 完成信号：无工具调用、内容非空、未被截断
fn signals_completion(response: &CompletionResponse) -> bool {
    !response.has_tool_calls() && !response.content.trim().is_empty() && !response.is_truncated()
}

#[derive(Clone)]
pub struct TaskExecutor {
    llm: Arc<LlmClient>,
    tools: Arc<ToolExecutor>,
    planner: Option<Arc<TaskPlanner>>,
    config: ExecutionConfig,
    shutdown: ShutdownManager,
}

impl TaskExecutor {
    pub fn new(
        llm: Arc<LlmClient>,
        tools: Arc<ToolExecutor>,
        config: ExecutionConfig,
        shutdown: ShutdownManager,
    ) -> Self {
        Self {
            llm,
            tools,
            planner: None,
            config,
            shutdown,
        }
    }

    /// 安装计划器；仅在 agent 模式且 use_planner 打开时使用
    pub fn with_planner(mut self, planner: Arc<TaskPlanner>) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.config.max_iterations = max_iterations.max(1);
        self
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    pub fn llm(&self) -> &Arc<LlmClient> {
        &self.llm
    }

    pub fn tools(&self) -> &Arc<ToolExecutor> {
        &self.tools
    }

    pub fn shutdown(&self) -> &ShutdownManager {
        &self.shutdown
    }

    /// 在后台运行任务，返回有序事件流
    pub fn execute_task(&self, task: Task) -> EventStream {
        let task_id = uuid::Uuid::new_v4().to_string();
        let (sink, stream) = EventSink::channel(task_id);
        let executor = self.clone();
        tokio::spawn(async move {
            let result = match AssertUnwindSafe(executor.run(task, &sink)).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => {
                    let e = AgentError::Panic(panic_message(payload.as_ref()));
                    tracing::error!(task_id = %sink.task_id(), error = %e, "task panicked");
                    sink.emit(
                        AgentEvent::new(events::TASK_FAILED)
                            .with("error", format!("Workflow execution failed: {e}"))
                            .with("error_type", e.kind())
                            .with_level(EventLevel::Error)
                            .with_message(e.to_string()),
                    );
                    Err(e)
                }
            };
            sink.finish(result);
        });
        stream
    }

    /// 单轮交互对话：模式固定为 chat，超时取 execution.timeout
    pub fn execute_interactive_chat(&self, message: &str) -> EventStream {
        self.execute_task(Task::chat(message))
    }

    /// 并发运行多个独立任务，并行度受 max_parallel_tasks 限制；结果按输入顺序返回
    pub async fn execute_many(&self, tasks: Vec<Task>) -> Vec<Result<TaskOutcome, AgentError>> {
        let scheduler = TaskScheduler::new(self.config.max_parallel_tasks);
        let runs: Vec<_> = tasks
            .into_iter()
            .map(|task| {
                let sink = EventSink::silent(uuid::Uuid::new_v4().to_string());
                async move { self.run(task, &sink).await }
            })
            .collect();
        scheduler
            .run_all(runs)
            .await
            .into_iter()
            .map(|r| r.and_then(|inner| inner))
            .collect()
    }

    fn timeout_secs(&self, mode: ExecutionMode) -> u64 {
        match mode {
            ExecutionMode::Chat => self.config.timeout,
            ExecutionMode::Agent => self.config.task_timeout,
        }
    }

    fn timeout_error(&self, mode: ExecutionMode) -> AgentError {
        let timeout = self.timeout_secs(mode);
        match mode {
            ExecutionMode::Chat => AgentError::ChatTimeout { timeout },
            ExecutionMode::Agent => AgentError::TaskTimeout { timeout },
        }
    }

    /// 驱动一个任务直到终态；事件写入 sink，结果同时返回
    pub async fn run(&self, task: Task, sink: &EventSink) -> Result<TaskOutcome, AgentError> {
        let timeout = self.timeout_secs(task.mode);
        let deadline = Instant::now() + Duration::from_secs(timeout);
        tracing::info!(
            task_id = %sink.task_id(),
            mode = task.mode.as_str(),
            timeout,
            max_iterations = self.config.max_iterations,
            "task started"
        );
        sink.emit(
            AgentEvent::new(events::TASK_STARTED)
                .with("description", task.description.clone())
                .with("mode", task.mode.as_str())
                .with("timeout", timeout)
                .with("max_iterations", self.config.max_iterations as u64)
                .with_message(format!("Starting task: {}", preview(&task.description))),
        );

        let mut state = RunState::default();
        let result = self.drive(&task, deadline, &mut state, sink).await;
        settle_plan(&mut state.plan, &result);

        match result {
            Ok(outcome) => {
                tracing::info!(
                    task_id = %sink.task_id(),
                    iterations = outcome.iterations,
                    tool_calls = outcome.tool_calls_made,
                    "task completed"
                );
                let mut event = AgentEvent::new(events::TASK_COMPLETED)
                    .with("result", serde_json::to_value(&outcome.structured_output).unwrap_or(Value::Null))
                    .with("iterations", outcome.iterations as u64)
                    .with("tool_calls_made", outcome.tool_calls_made as u64)
                    .with("successful_tool_calls", outcome.successful_tool_calls as u64)
                    .with("failed_tool_calls", outcome.failed_tool_calls as u64)
                    .with("usage", serde_json::to_value(&outcome.usage).unwrap_or(Value::Null))
                    .with_message("Task completed");
                if let Some(plan) = &state.plan {
                    event = event.with("plan_status", serde_json::to_value(plan.status()).unwrap_or(Value::Null));
                }
                sink.emit(event);
                Ok(TaskOutcome {
                    plan: state.plan,
                    ..outcome
                })
            }
            Err(e) => {
                let error = if e.is_control() {
                    e.to_string()
                } else {
                    format!("Workflow execution failed: {e}")
                };
                tracing::error!(
                    task_id = %sink.task_id(),
                    error_type = e.kind(),
                    iterations = state.iterations,
                    %error,
                    "task failed"
                );
                let mut event = AgentEvent::new(events::TASK_FAILED)
                    .with("error", error.clone())
                    .with("error_type", e.kind())
                    .with("iterations_completed", state.iterations as u64)
                    .with_level(EventLevel::Error)
                    .with_message(error);
                match &e {
                    AgentError::TaskTimeout { timeout } | AgentError::ChatTimeout { timeout } => {
                        event = event.with("timeout", *timeout);
                    }
                    AgentError::ShutdownRequested => {
                        event = event.with("shutdown_requested", true);
                    }
                    AgentError::IterationLimitExceeded { max_iterations } => {
                        event = event.with("max_iterations", *max_iterations as u64);
                    }
                    _ => {}
                }
                sink.emit(event);
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        task: &Task,
        deadline: Instant,
        state: &mut RunState,
        sink: &EventSink,
    ) -> Result<TaskOutcome, AgentError> {
        if task.mode == ExecutionMode::Agent && self.config.use_planner {
            if let Some(planner) = &self.planner {
                let cancel = self.shutdown.token();
                let tool_names = self.tools.tool_names();
                let plan = tokio::select! {
                    r = timeout_at(deadline, planner.plan(&task.description, &tool_names)) => {
                        r.map_err(|_| self.timeout_error(task.mode))?
                    }
                    _ = cancel.cancelled() => return Err(AgentError::ShutdownRequested),
                };
                sink.emit(
                    AgentEvent::new(events::PLAN_CREATED)
                        .with("plan_id", plan.id.clone())
                        .with("steps", serde_json::to_value(&plan.steps).unwrap_or(Value::Null))
                        .with("has_list_processing", plan.has_list_processing())
                        .with_message(format!("Plan created with {} step(s)", plan.steps.len())),
                );
                state.plan = Some(plan);
            }
        }

        let system = self.system_prompt(task, state.plan.as_ref());
        let mut messages = self
            .llm
            .build_messages(&self.user_message(task), Some(&system), &[]);
        let options = CompletionOptions::with_tools(self.tools.registry().specs(&task.excluded_tools));
        let cancel = self.shutdown.token();

        loop {
            if self.shutdown.is_shutdown() {
                return Err(AgentError::ShutdownRequested);
            }
            if Instant::now() >= deadline {
                return Err(self.timeout_error(task.mode));
            }
            if state.iterations >= self.config.max_iterations {
                return Err(AgentError::IterationLimitExceeded {
                    max_iterations: self.config.max_iterations,
                });
            }
            state.iterations += 1;
            tracing::debug!(task_id = %sink.task_id(), iteration = state.iterations, "iteration");

            let response = tokio::select! {
                r = timeout_at(deadline, self.llm.complete(&messages, &options)) => {
                    r.map_err(|_| self.timeout_error(task.mode))?
                }
                _ = cancel.cancelled() => return Err(AgentError::ShutdownRequested),
            };
            if !response.success {
                return Err(AgentError::LlmError(
                    response.error.unwrap_or_else(|| "unknown completion error".into()),
                ));
            }
            state.usage.add(&response.usage);
            sink.emit(
                AgentEvent::new(events::LLM_RESPONSE)
                    .with("iteration", state.iterations as u64)
                    .with("content", preview(&response.content))
                    .with("tool_calls", response.tool_calls.len() as u64)
                    .with("finish_reason", response.finish_reason.clone().map_or(Value::Null, Value::from))
                    .with_level(EventLevel::Debug),
            );

            if response.has_tool_calls() {
                messages.push(ChatMessage::assistant_with_tool_calls(
                    response.content.clone(),
                    response.tool_calls.clone(),
                ));
                for call in &response.tool_calls {
                    self.handle_call(call, task, deadline, state, sink, &mut messages)
                        .await?;
                }
                continue;
            }

            if signals_completion(&response) {
                return Ok(TaskOutcome {
                    structured_output: StructuredOutput::from_response(
                        &response.content,
                        task.output_schema.as_ref(),
                    ),
                    response: response.content,
                    mode: task.mode,
                    iterations: state.iterations,
                    tool_calls_made: state.tool_calls_made,
                    successful_tool_calls: state.successful_tool_calls,
                    failed_tool_calls: state.failed_tool_calls,
                    usage: state.usage,
                    plan: None,
                });
            }

            if !response.content.trim().is_empty() {
                messages.push(ChatMessage::assistant(response.content));
            }
            messages.push(ChatMessage::user(CONTINUE_PROMPT));
        }
    }

    async fn handle_call(
        &self,
        call: &ToolCall,
        task: &Task,
        deadline: Instant,
        state: &mut RunState,
        sink: &EventSink,
        messages: &mut Vec<ChatMessage>,
    ) -> Result<(), AgentError> {
        sink.emit(
            AgentEvent::new(events::TOOL_CALL_STARTED)
                .with("iteration", state.iterations as u64)
                .with("tool", call.name.clone())
                .with("call_id", call.id.clone())
                .with("arguments", call.arguments.clone())
                .with_message(format!("Calling tool {}", call.name)),
        );

        let result = if task.excluded_tools.contains(&call.name) {
            let mut r = ToolResult::failed(&call.name, format!("Tool '{}' not found", call.name), Duration::ZERO);
            r.call_id = Some(call.id.clone());
            r
        } else {
            self.dispatch(call, task.mode, deadline).await?
        };

        state.tool_calls_made += 1;
        if result.success {
            state.successful_tool_calls += 1;
        } else {
            state.failed_tool_calls += 1;
        }
        messages.push(ChatMessage::tool(call.id.clone(), result.to_message_content()));

        let mut event = AgentEvent::new(events::STEP_COMPLETED)
            .with("iteration", state.iterations as u64)
            .with("tool", call.name.clone())
            .with("call_id", call.id.clone())
            .with("success", result.success)
            .with("execution_time", result.execution_time.as_secs_f64());
        match (&result.result, &result.error) {
            (_, Some(err)) => {
                event = event.with("error", err.clone()).with_level(EventLevel::Warning);
            }
            (Some(value), None) => {
                event = event.with("result", value.clone());
            }
            (None, None) => {}
        }
        sink.emit(event);

        if !result.success && !self.config.continue_on_tool_failure {
            return Err(AgentError::ToolExecutionFailed(format!(
                "{}: {}",
                call.name,
                result.error.unwrap_or_default()
            )));
        }
        Ok(())
    }

    /// 派发一次工具调用；retry_on_failure 时失败调用按 retry_delay × 2^attempt 退避重试
    async fn dispatch(
        &self,
        call: &ToolCall,
        mode: ExecutionMode,
        deadline: Instant,
    ) -> Result<ToolResult, AgentError> {
        let registry = self.tools.registry();
        let retryable = registry.is_registered(&call.name) && !registry.is_disabled(&call.name);
        let base = Duration::from_secs_f64(self.config.retry_delay.max(0.0));
        let mut attempt = 0u32;
        loop {
            let result = timeout_at(deadline, self.tools.execute_call(call))
                .await
                .map_err(|_| self.timeout_error(mode))?;
            if result.success
                || !retryable
                || !self.config.retry_on_failure
                || attempt >= self.config.max_retry_attempts
            {
                return Ok(result);
            }
            let delay = base * 2u32.saturating_pow(attempt);
            tracing::warn!(
                tool = %call.name,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                error = result.error.as_deref().unwrap_or(""),
                "tool call failed, retrying"
            );
            timeout_at(deadline, tokio::time::sleep(delay))
                .await
                .map_err(|_| self.timeout_error(mode))?;
            attempt += 1;
        }
    }

    fn system_prompt(&self, task: &Task, plan: Option<&TaskPlan>) -> String {
        let mut prompt = match (&task.system_prompt, self.llm.system_prompt()) {
            (Some(custom), _) => custom.clone(),
            (None, Some(configured)) => configured.to_string(),
            (None, None) => match task.mode {
                ExecutionMode::Agent => AGENT_SYSTEM_PROMPT.to_string(),
                ExecutionMode::Chat => CHAT_SYSTEM_PROMPT.to_string(),
            },
        };
        if let Some(plan) = plan {
            prompt.push_str("\n\nPlan:\n");
            for (i, step) in plan.steps.iter().enumerate() {
                prompt.push_str(&format!("{}. {}", i + 1, step.description));
                if !step.required_tools.is_empty() {
                    prompt.push_str(&format!(" (tools: {})", step.required_tools.join(", ")));
                }
                prompt.push('\n');
            }
            if plan.has_list_processing() {
                prompt.push_str(
                    "\nThis task applies one operation to many items. Prefer the process_search_files_* tools, \
which find the items and delegate them in groups.\n",
                );
            }
        }
        if let Some(schema) = &task.output_schema {
            prompt.push_str("\n\n");
            prompt.push_str(&schema_instructions(schema));
        }
        prompt
    }

    fn user_message(&self, task: &Task) -> String {
        if task.context_data.is_empty() {
            return task.description.clone();
        }
        let context = serde_json::to_string_pretty(&task.context_data).unwrap_or_default();
        format!("{}\n\nContext:\n{}", task.description, context)
    }
}

/// 按任务结果推进计划步骤：成功则依次完成，失败则标记第一个未完成的步骤
fn settle_plan(plan: &mut Option<TaskPlan>, result: &Result<TaskOutcome, AgentError>) {
    let Some(plan) = plan else {
        return;
    };
    let order: Vec<String> = match plan.execution_order() {
        Ok(steps) => steps.iter().map(|s| s.id.clone()).collect(),
        Err(_) => return,
    };
    for id in order {
        let outcome = match result {
            Ok(outcome) => plan
                .start_step(&id)
                .and_then(|_| plan.complete_step(&id, preview(&outcome.response))),
            Err(e) => {
                if plan.step(&id).map(|s| s.status) == Some(TaskStatus::Pending) {
                    let failed = plan
                        .start_step(&id)
                        .and_then(|_| plan.fail_step(&id, e.to_string(), false));
                    if let Err(err) = failed {
                        tracing::debug!(step = %id, error = %err, "plan step not updated");
                    }
                }
                return;
            }
        };
        if let Err(err) = outcome {
            tracing::debug!(step = %id, error = %err, "plan step not updated");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LlmSection;
    use crate::llm::{ScriptedReply, ScriptedTransport};
    use crate::tools::ToolRegistry;
    use serde_json::json;

    fn executor_with(
        replies: Vec<ScriptedReply>,
        config: ExecutionConfig,
    ) -> (TaskExecutor, Arc<ScriptedTransport>, Arc<ToolRegistry>) {
        let transport = Arc::new(ScriptedTransport::new(replies));
        let llm = Arc::new(LlmClient::new(&LlmSection::default(), &config, transport.clone()));
        let registry = Arc::new(ToolRegistry::new());
        registry.register_function("echo", "Echo arguments", |args| Ok(args));
        registry.register_function("fail", "Always fails", |_| Err("boom".to_string()));
        let tools = Arc::new(ToolExecutor::new(registry.clone(), 5));
        let executor = TaskExecutor::new(llm, tools, config, ShutdownManager::new());
        (executor, transport, registry)
    }

    fn types(events: &[AgentEvent]) -> Vec<&str> {
        events.iter().map(|e| e.event_type.as_str()).collect()
    }

    #[tokio::test]
    async fn test_tool_round_trip_then_completion() {
        let (executor, transport, registry) = executor_with(
            vec![
                ScriptedReply::tool_calls(&[("call_1", "echo", json!({"x": 1}))]),
                ScriptedReply::text("All done"),
            ],
            ExecutionConfig::default(),
        );
        let (events, result) = executor.execute_task(Task::agent("echo something")).collect_all().await;
        let outcome = result.unwrap();
        assert_eq!(outcome.response, "All done");
        assert_eq!(outcome.iterations, 2);
        assert_eq!(outcome.tool_calls_made, 1);
        assert_eq!(outcome.successful_tool_calls, 1);
        assert_eq!(
            types(&events),
            vec![
                "task_started",
                "llm_response",
                "tool_call_started",
                "step_completed",
                "llm_response",
                "task_completed"
            ]
        );
        assert_eq!(events[3].get("result"), Some(&json!({"x": 1})));
        assert_eq!(registry.stats("echo").unwrap().calls, 1);

        // 第二次请求里必须带着对 call_1 的 tool 消息
        let second = &transport.requests()[1];
        let tool_msg = second
            .messages
            .iter()
            .find(|m| m.tool_call_id.as_deref() == Some("call_1"))
            .unwrap();
        assert!(tool_msg.content.contains("\"x\": 1"));
    }

    #[tokio::test]
    async fn test_tool_failure_ends_task_by_default() {
        let (executor, _, _) = executor_with(
            vec![
                ScriptedReply::tool_calls(&[("c1", "fail", json!({}))]),
                ScriptedReply::text("unreachable"),
            ],
            ExecutionConfig::default(),
        );
        let (events, result) = executor.execute_task(Task::agent("x")).collect_all().await;
        assert!(matches!(result, Err(AgentError::ToolExecutionFailed(_))));
        let failed = events.last().unwrap();
        assert_eq!(failed.event_type, "task_failed");
        assert_eq!(failed.get("error_type"), Some(&json!("ToolExecutionFailed")));
        assert!(failed.get("error").unwrap().as_str().unwrap().starts_with("Workflow execution failed"));
    }

    #[tokio::test]
    async fn test_continue_on_tool_failure() {
        let config = ExecutionConfig {
            continue_on_tool_failure: true,
            ..ExecutionConfig::default()
        };
        let (executor, _, _) = executor_with(
            vec![
                ScriptedReply::tool_calls(&[("c1", "fail", json!({})), ("c2", "missing", json!({}))]),
                ScriptedReply::text("recovered"),
            ],
            config,
        );
        let (events, result) = executor.execute_task(Task::agent("x")).collect_all().await;
        let outcome = result.unwrap();
        assert_eq!(outcome.failed_tool_calls, 2);
        let steps: Vec<&AgentEvent> = events.iter().filter(|e| e.event_type == "step_completed").collect();
        assert_eq!(steps[0].get("error"), Some(&json!("boom")));
        assert_eq!(steps[1].get("error"), Some(&json!("Tool 'missing' not found")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_on_failure_backs_off() {
        let config = ExecutionConfig {
            retry_on_failure: true,
            max_retry_attempts: 2,
            retry_delay: 1.0,
            continue_on_tool_failure: true,
            ..ExecutionConfig::default()
        };
        let (executor, _, registry) = executor_with(
            vec![
                ScriptedReply::tool_calls(&[("c1", "fail", json!({}))]),
                ScriptedReply::text("done"),
            ],
            config,
        );
        let start = Instant::now();
        let outcome = executor.execute_task(Task::agent("x")).outcome().await.unwrap();
        // 1s + 2s 退避，共执行 3 次
        assert!(start.elapsed() >= Duration::from_secs(3));
        assert_eq!(registry.stats("fail").unwrap().calls, 3);
        assert_eq!(outcome.failed_tool_calls, 1);
    }

    #[tokio::test]
    async fn test_truncated_reply_is_not_completion() {
        let (executor, transport, _) = executor_with(
            vec![ScriptedReply::truncated("partial"), ScriptedReply::text("full answer")],
            ExecutionConfig::default(),
        );
        let outcome = executor.execute_task(Task::chat("hi")).outcome().await.unwrap();
        assert_eq!(outcome.response, "full answer");
        assert_eq!(outcome.iterations, 2);
        let last = transport.requests()[1].messages.last().unwrap().content.clone();
        assert_eq!(last, CONTINUE_PROMPT);
    }

    #[tokio::test]
    async fn test_llm_failure_is_wrapped() {
        let (executor, _, _) = executor_with(
            vec![ScriptedReply::http_error(401, "invalid api key")],
            ExecutionConfig::default(),
        );
        let (events, result) = executor.execute_task(Task::agent("x")).collect_all().await;
        assert!(matches!(result, Err(AgentError::LlmError(_))));
        assert_eq!(events.last().unwrap().get("error_type"), Some(&json!("LlmError")));
    }

    #[tokio::test]
    async fn test_structured_output() {
        let (executor, _, _) = executor_with(
            vec![ScriptedReply::text("Here: {\"title\": \"Hi\", \"published\": false}")],
            ExecutionConfig::default(),
        );
        let task = Task::agent("write a post").with_output_schema(json!({
            "type": "object",
            "required": ["title", "published"]
        }));
        let (events, result) = executor.execute_task(task).collect_all().await;
        let outcome = result.unwrap();
        assert_eq!(outcome.structured_output.get("title"), Some(&json!("Hi")));
        let completed = events.last().unwrap();
        assert_eq!(completed.get("result").unwrap()["output_format"], "json");
    }

    #[tokio::test]
    async fn test_panicking_tool_is_reported_as_failure() {
        let config = ExecutionConfig {
            continue_on_tool_failure: true,
            ..Default::default()
        };
        let (executor, _, registry) = executor_with(
            vec![
                ScriptedReply::tool_calls(&[("c1", "boom", json!({}))]),
                ScriptedReply::text("recovered"),
            ],
            config,
        );
        registry.register_function("boom", "Indexes an empty list", |_| {
            let empty: Vec<Value> = Vec::new();
            Ok(empty[0].clone())
        });
        let (events, result) = executor.execute_task(Task::agent("x")).collect_all().await;
        let outcome = result.unwrap();
        assert_eq!(outcome.failed_tool_calls, 1);
        let step = events.iter().find(|e| e.event_type == "step_completed").unwrap();
        assert!(step.get("error").unwrap().as_str().unwrap().contains("panicked"));
        assert_eq!(events.last().unwrap().event_type, "task_completed");
    }

    struct PanickingTransport;

    #[async_trait::async_trait]
    impl crate::llm::CompletionTransport for PanickingTransport {
        async fn send(&self, _request: &crate::llm::CompletionRequest) -> Result<Value, crate::llm::LlmError> {
            panic!("transport exploded")
        }

        fn name(&self) -> &str {
            "panicking"
        }
    }

    #[tokio::test]
    async fn test_panic_outside_tools_still_ends_with_task_failed() {
        let config = ExecutionConfig::default();
        let llm = Arc::new(LlmClient::new(&LlmSection::default(), &config, Arc::new(PanickingTransport)));
        let tools = Arc::new(ToolExecutor::new(Arc::new(ToolRegistry::new()), 5));
        let executor = TaskExecutor::new(llm, tools, config, ShutdownManager::new());

        let (events, result) = executor.execute_task(Task::chat("hi")).collect_all().await;
        assert!(matches!(result, Err(AgentError::Panic(ref m)) if m == "transport exploded"));
        let failed = events.last().unwrap();
        assert_eq!(failed.event_type, "task_failed");
        assert_eq!(failed.get("error_type"), Some(&json!("Panic")));
        assert_eq!(events.iter().filter(|e| e.event_type == "task_failed").count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_planning() {
        let (executor, transport, _) = executor_with(
            vec![ScriptedReply::text("{}").delayed(Duration::from_secs(60))],
            ExecutionConfig::default(),
        );
        let planner = Arc::new(TaskPlanner::new(executor.llm().clone()));
        let executor = executor.with_planner(planner);

        let stream = executor.execute_task(Task::agent("Plan something big"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        executor.shutdown().shutdown(crate::core::ShutdownReason::UserInitiated);

        let (events, result) = stream.collect_all().await;
        assert!(matches!(result, Err(AgentError::ShutdownRequested)));
        assert_eq!(events.last().unwrap().get("shutdown_requested"), Some(&json!(true)));
        assert!(!events.iter().any(|e| e.event_type == "plan_created"));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_planner_marks_steps_completed() {
        let (executor, _, _) = executor_with(vec![ScriptedReply::text("done")], ExecutionConfig::default());
        let executor = executor.with_planner(Arc::new(TaskPlanner::heuristic()));
        let (events, result) = executor.execute_task(Task::agent("Fix main.rs")).collect_all().await;
        assert_eq!(events[1].event_type, "plan_created");
        let plan = result.unwrap().plan.unwrap();
        assert_eq!(plan.status(), TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_execute_many_preserves_order() {
        let transport = Arc::new(ScriptedTransport::from_fn(|req| {
            let last = req.messages.last().map(|m| m.content.clone()).unwrap_or_default();
            ScriptedReply::text(format!("answer to {last}"))
        }));
        let config = ExecutionConfig::default();
        let llm = Arc::new(LlmClient::new(&LlmSection::default(), &config, transport));
        let tools = Arc::new(ToolExecutor::new(Arc::new(ToolRegistry::new()), 5));
        let executor = TaskExecutor::new(llm, tools, config, ShutdownManager::new());
        let results = executor
            .execute_many(vec![Task::chat("a"), Task::chat("b"), Task::chat("c")])
            .await;
        let answers: Vec<String> = results.into_iter().map(|r| r.unwrap().response).collect();
        assert_eq!(answers, vec!["answer to a", "answer to b", "answer to c"]);
    }
}
