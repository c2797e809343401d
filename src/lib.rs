//! Codesmith - 基于工具调用的编码智能体执行引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）与校验
//! - **context**: 外部协作者接口（语义检索、代码重排缩进）
//! - **core**: 错误、共享类型、协作式关闭、任务调度、Agent 构建器
//! - **execution**: 任务计划、计划器、结构化输出、事件流与执行循环
//! - **llm**: 多后端模型客户端（请求整形、响应解析、限流重试、HTTP / Mock 传输）
//! - **observability**: tracing 初始化
//! - **tools**: 工具注册表、派发器、内置工具、委派与批处理

pub mod config;
pub mod context;
pub mod core;
pub mod execution;
pub mod llm;
pub mod observability;
pub mod tools;

pub use crate::config::{load_config, AppConfig, ExecutionConfig};
pub use crate::core::{Agent, AgentBuilder, AgentError, ShutdownManager, Task};
pub use crate::execution::{EventStream, TaskExecutor, TaskOutcome};
