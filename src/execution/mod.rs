//! 任务执行：计划、计划器、结构化输出、事件流与执行循环

pub mod events;
pub mod loop_;
pub mod output;
pub mod plan;
pub mod planner;

pub use events::{EventSink, EventStream, TaskUpdate};
pub use loop_::{TaskExecutor, TaskOutcome};
pub use output::{clean_json_string, extract_json_from_text, OutputFormat, StructuredOutput};
pub use plan::{PlanError, PlanStep, TaskPlan};
pub use planner::{detect_list_processing, TaskPlanner};
