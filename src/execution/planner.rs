//! Planner：把任务描述拆成带依赖的步骤
//!
//! 优先让模型输出 JSON 计划；模型失败、输出不可解析或依赖图非法时退回启发式单步计划。
//! 启发式同时负责识别「对一组条目逐一执行同一操作」的列表处理任务。

use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::Deserialize;

use crate::core::types::TaskType;
use crate::execution::output::{clean_json_string, extract_json_from_text};
use crate::execution::plan::{PlanStep, TaskPlan};
use crate::llm::LlmClient;

const PLANNER_SYSTEM_PROMPT: &str = "You are a planning assistant for a coding agent. \
Break the user's task into a small number of concrete steps. Respond with JSON only, in the form \
{\"steps\": [{\"id\": \"step_1\", \"description\": \"...\", \"type\": \"simple|complex\", \
\"dependencies\": [], \"required_tools\": [], \"is_list_processing\": false}]}. \
Dependencies must reference earlier step ids. Set is_list_processing to true when a step applies \
one operation independently to each item of a list of files or matches.";

/// 列表处理的关键短语
const LIST_PHRASES: &[&str] = &[
    "for each",
    "for every",
    "each of",
    "each file",
    "every file",
    "all files",
    "all the files",
    "all matching",
    "each match",
    "one by one",
];

/// 描述超过该长度视为复杂任务
const COMPLEX_TASK_CHARS: usize = 200;

#[derive(Deserialize)]
struct RawPlan {
    steps: Vec<RawStep>,
}

#[derive(Deserialize)]
struct RawStep {
    #[serde(default)]
    id: Option<String>,
    description: String,
    #[serde(default, rename = "type")]
    step_type: Option<String>,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    required_tools: Vec<String>,
    #[serde(default)]
    is_list_processing: bool,
}

fn file_name_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b[\w./-]+\.[A-Za-z][A-Za-z0-9]{0,5}\b").ok())
        .as_ref()
}

fn numbered_item_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:^|\s)\d+[.)]\s").ok()).as_ref()
}

/// 任务是否意味着对一组条目逐一执行同一操作
pub fn detect_list_processing(description: &str) -> bool {
    let lower = description.to_lowercase();
    if LIST_PHRASES.iter().any(|p| lower.contains(p)) {
        return true;
    }
    // 逗号分隔的多个文件名：a.py, b.py, c.py
    let Some(re) = file_name_re() else {
        return false;
    };
    let files: Vec<&str> = re
        .find_iter(description)
        .map(|m| m.as_str())
        .filter(|m| !m.starts_with('.') && !m.ends_with('.'))
        .collect();
    files.len() >= 3 || (files.len() == 2 && (lower.contains(',') || lower.contains(" and ")))
}

fn is_complex(description: &str) -> bool {
    description.len() > COMPLEX_TASK_CHARS
        || numbered_item_re().map_or(false, |re| re.find_iter(description).count() >= 2)
}

/// 按关键词猜测需要的工具
fn guess_tools(description: &str) -> Vec<String> {
    let lower = description.to_lowercase();
    let rules: &[(&[&str], &str)] = &[
        (&["read", "show", "look at", "review", "explain"], "read_file"),
        (&["create", "new file", "write"], "create_file"),
        (&["edit", "modify", "change", "fix", "refactor", "add", "update", "rename"], "edit_file"),
        (&["run", "test", "build", "execute", "install"], "run_shell"),
        (&["find", "search", "where", "grep", "locate"], "search_files_by_content"),
        (&["list", "directory", "folder", "structure"], "list_directory"),
    ];
    rules
        .iter()
        .filter(|(words, _)| words.iter().any(|w| lower.contains(w)))
        .map(|(_, tool)| tool.to_string())
        .collect()
}

pub struct TaskPlanner {
    llm: Option<Arc<LlmClient>>,
}

impl TaskPlanner {
    pub fn new(llm: Arc<LlmClient>) -> Self {
        Self { llm: Some(llm) }
    }

    /// 只用启发式规则，不调用模型
    pub fn heuristic() -> Self {
        Self { llm: None }
    }

    pub async fn plan(&self, description: &str, available_tools: &[String]) -> TaskPlan {
        let Some(llm) = &self.llm else {
            return Self::heuristic_plan(description);
        };
        let prompt = format!(
            "Task: {description}\n\nAvailable tools: {}\n\nProduce the plan.",
            available_tools.join(", ")
        );
        let response = llm.complete_prompt(&prompt, Some(PLANNER_SYSTEM_PROMPT)).await;
        if !response.success {
            tracing::warn!(
                error = response.error.as_deref().unwrap_or(""),
                "planner completion failed, using heuristic plan"
            );
            return Self::heuristic_plan(description);
        }
        match Self::parse_plan(description, &response.content, available_tools) {
            Ok(plan) => {
                tracing::info!(steps = plan.steps.len(), plan_id = %plan.id, "plan created");
                plan
            }
            Err(reason) => {
                tracing::warn!(%reason, "planner output rejected, using heuristic plan");
                Self::heuristic_plan(description)
            }
        }
    }

    /// 解析模型输出的 JSON 计划；未知工具名被丢弃，依赖图在 TaskPlan::new 中校验
    pub fn parse_plan(
        description: &str,
        content: &str,
        available_tools: &[String],
    ) -> Result<TaskPlan, String> {
        let fragment = extract_json_from_text(content).ok_or("no JSON plan in response")?;
        let raw: RawPlan = serde_json::from_str(&fragment)
            .or_else(|_| serde_json::from_str(&clean_json_string(&fragment)))
            .map_err(|e| format!("invalid plan JSON: {e}"))?;
        let steps = raw
            .steps
            .into_iter()
            .enumerate()
            .map(|(i, s)| {
                let step_type = match s.step_type.as_deref() {
                    Some("complex") => TaskType::Complex,
                    _ => TaskType::Simple,
                };
                let list = s.is_list_processing || detect_list_processing(&s.description);
                let tools: Vec<String> = s
                    .required_tools
                    .into_iter()
                    .filter(|t| available_tools.is_empty() || available_tools.contains(t))
                    .collect();
                PlanStep::new(s.id.unwrap_or_else(|| format!("step_{}", i + 1)), s.description)
                    .with_type(step_type)
                    .depends_on(s.dependencies)
                    .with_tools(tools)
                    .list_processing(list)
            })
            .collect();
        TaskPlan::new(description, steps).map_err(|e| e.to_string())
    }

    /// 单步计划
    pub fn heuristic_plan(description: &str) -> TaskPlan {
        let step_type = if is_complex(description) {
            TaskType::Complex
        } else {
            TaskType::Simple
        };
        let step = PlanStep::new("step_1", description)
            .with_type(step_type)
            .with_tools(guess_tools(description))
            .list_processing(detect_list_processing(description));
        TaskPlan {
            id: uuid::Uuid::new_v4().to_string(),
            description: description.to_string(),
            steps: vec![step],
            created_at: chrono::Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExecutionConfig, LlmSection};
    use crate::core::types::TaskStatus;
    use crate::llm::{ScriptedReply, ScriptedTransport};

    #[test]
    fn test_detect_list_processing() {
        assert!(detect_list_processing(
            "Add a docstring to each of these Python files: test1.py, test2.py, test3.py"
        ));
        assert!(detect_list_processing("For each match of TODO, open an issue"));
        assert!(detect_list_processing("Update a.rs and b.rs to use the new API"));
        assert!(!detect_list_processing("Fix the bug in main.rs"));
        assert!(!detect_list_processing("Say hello world"));
    }

    #[test]
    fn test_heuristic_plan() {
        let plan = TaskPlanner::heuristic_plan(
            "Create a simple web API with: 1. a health endpoint 2. a user endpoint",
        );
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].step_type, TaskType::Complex);
        assert!(plan.steps[0].required_tools.contains(&"create_file".to_string()));
        assert_eq!(plan.status(), TaskStatus::Pending);
    }

    #[test]
    fn test_parse_plan_rejects_cycles() {
        let content = r#"```json
{"steps": [
  {"id": "a", "description": "first", "dependencies": ["b"]},
  {"id": "b", "description": "second", "dependencies": ["a"]}
]}
```"#;
        let err = TaskPlanner::parse_plan("t", content, &[]).unwrap_err();
        assert!(err.contains("cyclic"));
    }

    #[test]
    fn test_parse_plan_filters_unknown_tools() {
        let content = r#"{"steps": [
  {"id": "read", "description": "read main.rs", "required_tools": ["read_file", "teleport"]},
  {"id": "edit", "description": "edit it", "type": "complex", "dependencies": ["read"]}
]}"#;
        let tools = vec!["read_file".to_string(), "edit_file".to_string()];
        let plan = TaskPlanner::parse_plan("t", content, &tools).unwrap();
        assert_eq!(plan.steps[0].required_tools, vec!["read_file"]);
        assert_eq!(plan.steps[1].step_type, TaskType::Complex);
        assert_eq!(plan.steps[1].dependencies, vec!["read"]);
    }

    #[tokio::test]
    async fn test_plan_falls_back_when_model_fails() {
        let transport = Arc::new(ScriptedTransport::new(vec![ScriptedReply::text("no plan here")]));
        let llm = Arc::new(LlmClient::new(
            &LlmSection::default(),
            &ExecutionConfig::default(),
            transport.clone(),
        ));
        let plan = TaskPlanner::new(llm).plan("Fix the bug in main.rs", &[]).await;
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].description, "Fix the bug in main.rs");
        assert_eq!(transport.calls(), 1);
    }
}
