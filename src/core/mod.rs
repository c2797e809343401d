//! 核心层：错误类型、共享数据类型、协作式关闭、并发调度与 Agent 装配

pub mod builder;
pub mod error;
pub mod shutdown;
pub mod task_scheduler;
pub mod types;

pub use builder::{Agent, AgentBuilder};
pub use error::AgentError;
pub use shutdown::{ShutdownManager, ShutdownReason};
pub use task_scheduler::TaskScheduler;
pub use types::{
    AgentEvent, ConfirmationLevel, EventLevel, ExecutionMode, Task, TaskStatus, TaskType,
};
