//! Agent 构建器：统一的组件装配
//!
//! 顺序固定：LlmClient → ToolRegistry（内置工具）→ ToolExecutor → 委派/批处理工具
//! （它们只持有执行器的 Weak 引用，所以必须在执行器创建之后注册）→ TaskPlanner → TaskExecutor。

use std::sync::Arc;

use crate::config::AppConfig;
use crate::context::{ContextRetriever, NoopReindenter, Reindenter};
use crate::core::{AgentError, ShutdownManager, ShutdownReason, Task};
use crate::execution::{EventStream, TaskExecutor, TaskOutcome, TaskPlan, TaskPlanner};
use crate::llm::{CompletionTransport, HttpTransport, LlmClient};
use crate::tools::builtin::register_builtin_tools;
use crate::tools::{
    BatchKind, BatchProcessTool, DelegateTaskTool, ToolApprover, ToolExecutor, ToolRegistry,
    ToolStats,
};

/// Agent 构建器：外部协作者（传输、检索器、重排缩进、审批）都可替换
pub struct AgentBuilder {
    config: AppConfig,
    transport: Option<Arc<dyn CompletionTransport>>,
    retriever: Option<Arc<dyn ContextRetriever>>,
    reindenter: Arc<dyn Reindenter>,
    approver: Option<Arc<dyn ToolApprover>>,
    shutdown: ShutdownManager,
}

impl AgentBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            transport: None,
            retriever: None,
            reindenter: Arc::new(NoopReindenter),
            approver: None,
            shutdown: ShutdownManager::new(),
        }
    }

    /// 指定模型传输；未指定时按配置创建 HTTP 传输
    pub fn with_transport(mut self, transport: Arc<dyn CompletionTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// 安装语义检索器；同时启用 semantic_search 与 process_search_files_semantic
    pub fn with_retriever(mut self, retriever: Arc<dyn ContextRetriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    pub fn with_reindenter(mut self, reindenter: Arc<dyn Reindenter>) -> Self {
        self.reindenter = reindenter;
        self
    }

    pub fn with_approver(mut self, approver: Arc<dyn ToolApprover>) -> Self {
        self.approver = Some(approver);
        self
    }

    /// 共享外部的关闭管理器（例如已安装信号处理的实例）
    pub fn with_shutdown(mut self, shutdown: ShutdownManager) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn build(self) -> Result<Agent, AgentError> {
        let config = self.config;
        config.validate()?;

        let transport: Arc<dyn CompletionTransport> = match self.transport {
            Some(t) => t,
            None => Arc::new(
                HttpTransport::from_config(&config.llm)
                    .map_err(|e| AgentError::LlmError(e.to_string()))?,
            ),
        };
        let llm = Arc::new(LlmClient::new(&config.llm, &config.execution, transport));

        let registry = Arc::new(ToolRegistry::with_disabled(
            config.tools.disabled_tools.iter().cloned(),
        ));
        register_builtin_tools(&registry, &config, self.retriever.clone(), self.reindenter);

        let tools = Arc::new(
            ToolExecutor::new(registry.clone(), config.tools.tool_timeout_secs)
                .with_confirmation(config.safety.confirmation_level, self.approver),
        );

        registry.register(DelegateTaskTool::new(
            llm.clone(),
            Arc::downgrade(&tools),
            config.execution.clone(),
            self.shutdown.clone(),
        ));
        let mut batch_kinds = vec![BatchKind::FilesByName, BatchKind::FilesByContent];
        if self.retriever.is_some() {
            batch_kinds.push(BatchKind::Semantic);
        }
        for kind in batch_kinds {
            registry.register(BatchProcessTool::new(
                kind,
                Arc::downgrade(&tools),
                config.execution.max_parallel_tasks,
                config.tools.batch_group_size,
                config.tools.batch_max_results,
            ));
        }

        let planner = Arc::new(TaskPlanner::new(llm.clone()));
        let executor = TaskExecutor::new(
            llm,
            tools,
            config.execution.clone(),
            self.shutdown.clone(),
        )
        .with_planner(planner.clone());

        tracing::info!(
            provider = %config.llm.provider,
            model = %config.llm.model,
            tools = registry.list().len(),
            "agent ready"
        );

        Ok(Agent {
            config,
            executor,
            planner,
        })
    }
}

/// 对外门面：执行任务、对话、规划、工具开关与关闭控制
pub struct Agent {
    config: AppConfig,
    executor: TaskExecutor,
    planner: Arc<TaskPlanner>,
}

impl Agent {
    pub fn builder(config: AppConfig) -> AgentBuilder {
        AgentBuilder::new(config)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn executor(&self) -> &TaskExecutor {
        &self.executor
    }

    /// 按配置的默认模式构造任务
    pub fn task(&self, description: impl Into<String>) -> Task {
        Task::new(description, self.config.execution.default_mode)
    }

    pub fn execute_task(&self, task: Task) -> EventStream {
        self.executor.execute_task(task)
    }

    /// 运行任务并只取最终结果
    pub async fn run(&self, task: Task) -> Result<TaskOutcome, AgentError> {
        self.executor.execute_task(task).outcome().await
    }

    pub fn chat(&self, message: &str) -> EventStream {
        self.executor.execute_interactive_chat(message)
    }

    /// 只生成计划，不执行
    pub async fn plan(&self, description: &str) -> TaskPlan {
        let tools = self.executor.tools().tool_names();
        self.planner.plan(description, &tools).await
    }

    fn registry(&self) -> &Arc<ToolRegistry> {
        self.executor.tools().registry()
    }

    pub fn enable_tool(&self, name: &str) -> bool {
        self.registry().enable(name)
    }

    pub fn disable_tool(&self, name: &str) -> bool {
        self.registry().disable(name)
    }

    /// 当前可派发的工具
    pub fn list_tools(&self) -> Vec<String> {
        self.registry().list()
    }

    pub fn disabled_tools(&self) -> Vec<String> {
        self.registry().disabled_tools()
    }

    pub fn tool_stats(&self, name: &str) -> Option<ToolStats> {
        self.registry().stats(name)
    }

    pub fn shutdown_manager(&self) -> &ShutdownManager {
        self.executor.shutdown()
    }

    /// 请求协作式关闭：正在运行的任务在下一个迭代边界结束
    pub fn request_shutdown(&self, reason: ShutdownReason) {
        self.executor.shutdown().shutdown(reason);
    }

    pub fn is_shutdown(&self) -> bool {
        self.executor.shutdown().is_shutdown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ScriptedReply, ScriptedTransport};

    fn config(dir: &std::path::Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.tools.workspace_root = Some(dir.to_path_buf());
        config.tools.disabled_tools = vec!["run_shell".into()];
        config
    }

    #[test]
    fn test_build_registers_delegation_and_batch_tools() {
        let dir = tempfile::tempdir().unwrap();
        let agent = AgentBuilder::new(config(dir.path()))
            .with_transport(Arc::new(ScriptedTransport::repeating(ScriptedReply::text("ok"))))
            .build()
            .unwrap();
        let tools = agent.list_tools();
        assert!(tools.iter().any(|t| t == "delegate_task"));
        assert!(tools.iter().any(|t| t == "process_search_files_by_name"));
        assert!(tools.iter().any(|t| t == "process_search_files_by_content"));
        assert!(!tools.iter().any(|t| t == "process_search_files_semantic"));
        assert!(!tools.iter().any(|t| t == "run_shell"));
    }

    struct NoResults;

    #[async_trait::async_trait]
    impl ContextRetriever for NoResults {
        async fn retrieve_context(
            &self,
            _query: &str,
            _limits: &crate::context::RetrievalLimits,
        ) -> Result<Vec<crate::context::ContextItem>, String> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_retriever_enables_semantic_tools() {
        let dir = tempfile::tempdir().unwrap();
        let agent = AgentBuilder::new(config(dir.path()))
            .with_transport(Arc::new(ScriptedTransport::repeating(ScriptedReply::text("ok"))))
            .with_retriever(Arc::new(NoResults))
            .build()
            .unwrap();
        let tools = agent.list_tools();
        assert!(tools.iter().any(|t| t == "semantic_search"));
        assert!(tools.iter().any(|t| t == "process_search_files_semantic"));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.execution.max_iterations = 0;
        let err = AgentBuilder::new(cfg)
            .with_transport(Arc::new(ScriptedTransport::repeating(ScriptedReply::text("ok"))))
            .build()
            .err()
            .unwrap();
        assert_eq!(err.kind(), "ConfigError");
    }

    #[tokio::test]
    async fn test_disable_then_enable_tool() {
        let dir = tempfile::tempdir().unwrap();
        let agent = AgentBuilder::new(config(dir.path()))
            .with_transport(Arc::new(ScriptedTransport::repeating(ScriptedReply::text("ok"))))
            .build()
            .unwrap();
        assert!(agent.disable_tool("read_file"));
        let r = agent.executor().tools().execute("read_file", serde_json::json!({"path": "x"})).await;
        assert_eq!(r.error.as_deref(), Some("Tool 'read_file' is disabled"));
        assert!(agent.enable_tool("read_file"));
        assert!(agent.list_tools().iter().any(|t| t == "read_file"));
    }
}
