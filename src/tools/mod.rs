//! 工具层：Tool trait、注册表、派发器、内置工具，以及委派与批处理工具

pub mod batch;
pub mod builtin;
pub mod delegate;
pub mod executor;
pub mod function;
pub mod registry;
pub mod schema;

pub use batch::{BatchKind, BatchProcessTool};
pub use delegate::{DelegateTaskTool, DELEGATE_TOOL_NAME, DELEGATION_EXCLUDED_TOOLS};
pub use executor::{requires_confirmation, ToolApprover, ToolExecutor, ToolResult};
pub use function::FunctionTool;
pub use registry::{RiskLevel, SafetyCheck, Tool, ToolRegistry, ToolStats};
pub use schema::{parameters_for, parse_args};
