//! 批处理工具：搜索 → 截断到 max_results → 分组 → 每组委派一个子任务 → 汇总
//!
//! 搜索与委派都经由工具执行器按名派发（search_files_by_* / semantic_search / delegate_task），
//! 因此同样受禁用、安全检查与统计约束。各组并发执行，使用独立的 TaskScheduler，
//! 避免与外层任务争用同一组许可而互相等待。

use std::sync::Weak;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::core::TaskScheduler;
use crate::tools::delegate::DELEGATE_TOOL_NAME;
use crate::tools::schema::{parameters_for, parse_args};
use crate::tools::executor::ToolResult;
use crate::tools::{RiskLevel, Tool, ToolExecutor};

/// 三种批处理的差异：底层搜索工具、结果字段名与提示文本
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchKind {
    FilesByName,
    FilesByContent,
    Semantic,
}

impl BatchKind {
    pub fn tool_name(self) -> &'static str {
        match self {
            BatchKind::FilesByName => "process_search_files_by_name",
            BatchKind::FilesByContent => "process_search_files_by_content",
            BatchKind::Semantic => "process_search_files_semantic",
        }
    }

    fn search_tool(self) -> &'static str {
        match self {
            BatchKind::FilesByName => "search_files_by_name",
            BatchKind::FilesByContent => "search_files_by_content",
            BatchKind::Semantic => "semantic_search",
        }
    }

    /// 汇总与提示中使用的条目名
    fn noun(self) -> &'static str {
        match self {
            BatchKind::FilesByName => "files",
            BatchKind::FilesByContent => "matches",
            BatchKind::Semantic => "semantic search results",
        }
    }

    fn total_key(self) -> &'static str {
        match self {
            BatchKind::FilesByName => "total_files_found",
            BatchKind::FilesByContent => "total_matches_found",
            BatchKind::Semantic => "total_results_found",
        }
    }

    /// 不委派时的 (计数字段, 列表字段)
    fn report_keys(self) -> (&'static str, &'static str) {
        match self {
            BatchKind::FilesByName => ("files_found", "matches"),
            BatchKind::FilesByContent => ("matches_found", "matches"),
            BatchKind::Semantic => ("results_found", "results"),
        }
    }

    fn not_found_message(self, pattern: &str) -> String {
        match self {
            BatchKind::FilesByName => format!("No files found matching the pattern '{pattern}'"),
            BatchKind::FilesByContent => format!("No matches found for the pattern '{pattern}'"),
            BatchKind::Semantic => format!("No semantic search results found for the query '{pattern}'"),
        }
    }

    fn description(self) -> &'static str {
        match self {
            BatchKind::FilesByName => {
                "Find files by glob pattern, then apply an operation to every file by delegating groups of files \
to sub-agents. Set delegate_processing_results to false to only list the files."
            }
            BatchKind::FilesByContent => {
                "Search file contents, then apply an operation to every match by delegating groups of matches \
to sub-agents. Set delegate_processing_results to false to only list the matches."
            }
            BatchKind::Semantic => {
                "Run a semantic search, then apply an operation to every result by delegating groups of results \
to sub-agents. Set delegate_processing_results to false to only list the results."
            }
        }
    }

    fn parameters(self) -> Value {
        match self {
            BatchKind::FilesByName => parameters_for::<NameBatchArgs>(),
            BatchKind::FilesByContent => parameters_for::<ContentBatchArgs>(),
            BatchKind::Semantic => parameters_for::<SemanticBatchArgs>(),
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize, JsonSchema)]
struct NameBatchArgs {
    /// 文件名 glob 模式
    pattern: String,
    /// 对每个文件要执行的操作
    operation_description: String,
    /// 搜索起点目录
    path: Option<String>,
    /// 最多处理的文件数
    max_results: Option<usize>,
    /// 每组文件数
    group_size: Option<usize>,
    /// false 时只返回搜索结果，不委派
    #[serde(default = "default_true")]
    delegate_processing_results: bool,
}

#[derive(Deserialize, JsonSchema)]
struct ContentBatchArgs {
    /// 内容搜索模式
    pattern: String,
    /// 对每处匹配要执行的操作
    operation_description: String,
    path: Option<String>,
    /// 文件名 glob 过滤
    include: Option<String>,
    #[serde(default)]
    regex: bool,
    #[serde(default)]
    case_sensitive: bool,
    max_results: Option<usize>,
    group_size: Option<usize>,
    #[serde(default = "default_true")]
    delegate_processing_results: bool,
}

#[derive(Deserialize, JsonSchema)]
struct SemanticBatchArgs {
    /// 自然语言查询
    query: String,
    /// 对每条结果要执行的操作
    operation_description: String,
    max_results: Option<usize>,
    min_relevance: Option<f32>,
    group_size: Option<usize>,
    #[serde(default = "default_true")]
    delegate_processing_results: bool,
}

/// 三种参数归一后的请求
struct BatchRequest {
    pattern: String,
    operation: String,
    search_args: Value,
    max_results: usize,
    group_size: usize,
    delegate: bool,
}

pub struct BatchProcessTool {
    kind: BatchKind,
    tools: Weak<ToolExecutor>,
    scheduler: TaskScheduler,
    default_group_size: usize,
    default_max_results: usize,
}

impl BatchProcessTool {
    pub fn new(
        kind: BatchKind,
        tools: Weak<ToolExecutor>,
        max_parallel_tasks: usize,
        default_group_size: usize,
        default_max_results: usize,
    ) -> Self {
        Self {
            kind,
            tools,
            scheduler: TaskScheduler::new(max_parallel_tasks),
            default_group_size: default_group_size.max(1),
            default_max_results: default_max_results.max(1),
        }
    }

    fn request(&self, args: Value) -> Result<BatchRequest, String> {
        let name = self.kind.tool_name();
        let req = match self.kind {
            BatchKind::FilesByName => {
                let a: NameBatchArgs = parse_args(name, args)?;
                let max_results = a.max_results.unwrap_or(self.default_max_results);
                BatchRequest {
                    search_args: json!({"pattern": a.pattern, "path": a.path, "max_results": max_results}),
                    pattern: a.pattern,
                    operation: a.operation_description,
                    max_results,
                    group_size: a.group_size.unwrap_or(self.default_group_size),
                    delegate: a.delegate_processing_results,
                }
            }
            BatchKind::FilesByContent => {
                let a: ContentBatchArgs = parse_args(name, args)?;
                let max_results = a.max_results.unwrap_or(self.default_max_results);
                BatchRequest {
                    search_args: json!({
                        "pattern": a.pattern,
                        "path": a.path,
                        "include": a.include,
                        "regex": a.regex,
                        "case_sensitive": a.case_sensitive,
                        "max_results": max_results,
                    }),
                    pattern: a.pattern,
                    operation: a.operation_description,
                    max_results,
                    group_size: a.group_size.unwrap_or(self.default_group_size),
                    delegate: a.delegate_processing_results,
                }
            }
            BatchKind::Semantic => {
                let a: SemanticBatchArgs = parse_args(name, args)?;
                let max_results = a.max_results.unwrap_or(self.default_max_results);
                BatchRequest {
                    search_args: json!({
                        "query": a.query,
                        "max_results": max_results,
                        "min_relevance": a.min_relevance,
                    }),
                    pattern: a.query,
                    operation: a.operation_description,
                    max_results,
                    group_size: a.group_size.unwrap_or(self.default_group_size),
                    delegate: a.delegate_processing_results,
                }
            }
        };
        Ok(BatchRequest {
            group_size: req.group_size.max(1),
            max_results: req.max_results.max(1),
            ..req
        })
    }

    /// 子任务提示中的一行条目描述
    fn describe_item(&self, item: &Value) -> String {
        match self.kind {
            BatchKind::FilesByName => item_path(item).unwrap_or_else(|| item.to_string()),
            BatchKind::FilesByContent => format!(
                "{}:{}: {}",
                item_path(item).unwrap_or_default(),
                item.get("line").and_then(Value::as_u64).unwrap_or(0),
                item.get("content").and_then(Value::as_str).unwrap_or("").trim()
            ),
            BatchKind::Semantic => {
                let path = item_path(item).unwrap_or_default();
                match (
                    item.get("start_line").and_then(Value::as_u64),
                    item.get("end_line").and_then(Value::as_u64),
                ) {
                    (Some(s), Some(e)) => format!("{path} (lines {s}-{e})"),
                    _ => path,
                }
            }
        }
    }

    fn group_task(&self, operation: &str, group: &[Value]) -> (String, String) {
        let noun = self.kind.noun();
        let listing: Vec<String> = group.iter().map(|i| format!("- {}", self.describe_item(i))).collect();
        let task = format!(
            "{operation}\n\nApply this operation to each of the following {noun} ({} total):\n{}",
            group.len(),
            listing.join("\n")
        );
        let expected = format!(
            "Summary of processing {} {noun} with details of what was accomplished for each {}",
            group.len(),
            singular(noun)
        );
        (task, expected)
    }
}

fn singular(noun: &str) -> &str {
    match noun {
        "files" => "file",
        "matches" => "match",
        _ => "result",
    }
}

fn item_path(item: &Value) -> Option<String> {
    match item {
        Value::String(s) => Some(s.clone()),
        _ => ["file", "file_path", "path"]
            .iter()
            .find_map(|k| item.get(*k).and_then(Value::as_str))
            .map(str::to_string),
    }
}

/// 委派调用成功且子任务未自报失败
fn group_succeeded(result: &ToolResult) -> bool {
    result.success
        && result
            .result
            .as_ref()
            .and_then(|v| v.get("success"))
            .and_then(Value::as_bool)
            != Some(false)
}

/// 从搜索结果中取出条目列表
fn extract_items(result: &Value) -> Vec<Value> {
    ["files", "matches", "results"]
        .iter()
        .find_map(|k| result.get(*k).and_then(Value::as_array))
        .cloned()
        .unwrap_or_default()
}

#[async_trait]
impl Tool for BatchProcessTool {
    fn name(&self) -> &str {
        self.kind.tool_name()
    }

    fn description(&self) -> &str {
        self.kind.description()
    }

    fn parameters_schema(&self) -> Value {
        self.kind.parameters()
    }

    fn risk(&self) -> RiskLevel {
        RiskLevel::Medium
    }

    fn runs_own_deadline(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let req = self.request(args)?;
        let tools = self
            .tools
            .upgrade()
            .ok_or_else(|| "Tool executor is no longer available".to_string())?;

        let search = tools.execute(self.kind.search_tool(), req.search_args.clone()).await;
        if !search.success {
            return Err(format!(
                "Search failed: {}",
                search.error.unwrap_or_else(|| "unknown error".into())
            ));
        }
        let mut items = extract_items(search.result.as_ref().unwrap_or(&Value::Null));
        items.truncate(req.max_results);

        if items.is_empty() {
            return Ok(json!({
                "success": false,
                "message": self.kind.not_found_message(&req.pattern),
            }));
        }

        if !req.delegate {
            let (count_key, list_key) = self.kind.report_keys();
            return Ok(json!({
                "success": true,
                count_key: items.len(),
                list_key: items,
            }));
        }

        let groups: Vec<&[Value]> = items.chunks(req.group_size).collect();
        tracing::info!(
            tool = self.kind.tool_name(),
            items = items.len(),
            groups = groups.len(),
            "batch processing"
        );

        let runs: Vec<_> = groups
            .iter()
            .map(|group| {
                let (task, expected) = self.group_task(&req.operation, group);
                let tools = tools.clone();
                async move {
                    tools
                        .execute(
                            DELEGATE_TOOL_NAME,
                            json!({"task_description": task, "expected_output": expected}),
                        )
                        .await
                }
            })
            .collect();
        let outcomes = self.scheduler.run_all(runs).await;

        let mut successful = 0usize;
        let mut group_results = Vec::with_capacity(outcomes.len());
        for (index, (outcome, group)) in outcomes.into_iter().zip(&groups).enumerate() {
            let entry = match outcome {
                Ok(r) if group_succeeded(&r) => {
                    successful += 1;
                    json!({
                        "group": index + 1,
                        "items": group.len(),
                        "success": true,
                        "summary": r.result.as_ref().and_then(|v| v.get("summary")).cloned().unwrap_or(Value::Null),
                    })
                }
                Ok(r) => json!({
                    "group": index + 1,
                    "items": group.len(),
                    "success": false,
                    "error": r.error.unwrap_or_else(|| "sub-task reported failure".into()),
                }),
                Err(e) => json!({
                    "group": index + 1,
                    "items": group.len(),
                    "success": false,
                    "error": e.to_string(),
                }),
            };
            group_results.push(entry);
        }
        let failed = groups.len() - successful;

        Ok(json!({
            "success": failed == 0,
            self.kind.total_key(): items.len(),
            "total_groups": groups.len(),
            "successful_groups": successful,
            "failed_groups": failed,
            "summary": format!(
                "Processed {} {} in {} groups ({} succeeded, {} failed)",
                items.len(),
                self.kind.noun(),
                groups.len(),
                successful,
                failed
            ),
            "group_results": group_results,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{FunctionTool, ToolRegistry};
    use std::sync::{Arc, Mutex};

    /// 注册假的搜索与委派工具，记录委派参数
    fn setup(kind: BatchKind, found: Value) -> (Arc<ToolExecutor>, Arc<Mutex<Vec<Value>>>) {
        let registry = Arc::new(ToolRegistry::new());
        let found = Arc::new(found);
        registry.register_function(kind.search_tool(), "fake search", move |_| Ok((*found).clone()));
        let calls = Arc::new(Mutex::new(Vec::new()));
        let recorded = calls.clone();
        registry.register(FunctionTool::from_async(DELEGATE_TOOL_NAME, "fake delegate", move |args| {
            let recorded = recorded.clone();
            async move {
                recorded.lock().unwrap().push(args);
                Ok(json!({"success": true, "summary": "done", "tool_calls_made": 1}))
            }
        }));
        let tools = Arc::new(ToolExecutor::new(registry.clone(), 5));
        registry.register(BatchProcessTool::new(kind, Arc::downgrade(&tools), 4, 10, 100));
        (tools, calls)
    }

    fn files(n: usize) -> Value {
        json!({"files": (0..n).map(|i| format!("test{i}.py")).collect::<Vec<_>>()})
    }

    #[tokio::test]
    async fn test_name_batch_delegates_one_group() {
        let (tools, calls) = setup(BatchKind::FilesByName, files(2));
        let r = tools
            .execute(
                "process_search_files_by_name",
                json!({"pattern": "test*.py", "operation_description": "Add type hints"}),
            )
            .await;
        let out = r.result.unwrap();
        assert_eq!(out["success"], true);
        assert_eq!(out["total_files_found"], 2);
        assert_eq!(out["total_groups"], 1);
        assert_eq!(out["successful_groups"], 1);
        assert_eq!(out["failed_groups"], 0);
        assert!(out["summary"].as_str().unwrap().contains("Processed 2 files in 1 groups"));

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert!(calls[0]["task_description"].as_str().unwrap().contains("Add type hints"));
        assert_eq!(
            calls[0]["expected_output"],
            "Summary of processing 2 files with details of what was accomplished for each file"
        );
    }

    #[tokio::test]
    async fn test_max_results_applied_before_grouping() {
        let (tools, calls) = setup(BatchKind::FilesByName, files(10));
        let out = tools
            .execute(
                "process_search_files_by_name",
                json!({"pattern": "*.py", "operation_description": "x", "max_results": 5}),
            )
            .await
            .result
            .unwrap();
        assert_eq!(out["total_files_found"], 5);
        assert_eq!(out["total_groups"], 1);
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_groups_split_by_group_size() {
        let (tools, calls) = setup(BatchKind::FilesByName, files(25));
        let out = tools
            .execute(
                "process_search_files_by_name",
                json!({"pattern": "*.py", "operation_description": "x"}),
            )
            .await
            .result
            .unwrap();
        assert_eq!(out["total_groups"], 3);
        assert_eq!(out["group_results"][2]["items"], 5);
        assert_eq!(calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_no_matches_is_successful_dispatch() {
        let (tools, calls) = setup(BatchKind::FilesByName, files(0));
        let r = tools
            .execute(
                "process_search_files_by_name",
                json!({"pattern": "nope*.py", "operation_description": "x"}),
            )
            .await;
        assert!(r.success);
        let out = r.result.unwrap();
        assert_eq!(out["success"], false);
        assert!(out["message"]
            .as_str()
            .unwrap()
            .contains("No files found matching the pattern"));
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_report_only_modes() {
        let (tools, _) = setup(BatchKind::FilesByName, files(2));
        let out = tools
            .execute(
                "process_search_files_by_name",
                json!({"pattern": "*.py", "operation_description": "x", "delegate_processing_results": false}),
            )
            .await
            .result
            .unwrap();
        assert_eq!(out["files_found"], 2);
        assert!(out.get("matches").is_some());

        let (tools, _) = setup(
            BatchKind::Semantic,
            json!({"results": [{"file_path": "a.py"}, {"file_path": "b.py"}]}),
        );
        let out = tools
            .execute(
                "process_search_files_semantic",
                json!({"query": "auth", "operation_description": "x", "delegate_processing_results": false}),
            )
            .await
            .result
            .unwrap();
        assert_eq!(out["results_found"], 2);
        assert!(out.get("results").is_some());
    }

    #[tokio::test]
    async fn test_content_and_semantic_summaries() {
        let matches = json!({"matches": [
            {"file": "a.py", "line": 3, "content": "old_function()"},
            {"file": "b.py", "line": 9, "content": "old_function(x)"}
        ]});
        let (tools, calls) = setup(BatchKind::FilesByContent, matches);
        let out = tools
            .execute(
                "process_search_files_by_content",
                json!({"pattern": "old_function", "operation_description": "Replace with new_function"}),
            )
            .await
            .result
            .unwrap();
        assert_eq!(out["total_matches_found"], 2);
        assert!(out["summary"].as_str().unwrap().contains("Processed 2 matches in 1 groups"));
        let task = calls.lock().unwrap()[0]["task_description"].as_str().unwrap().to_string();
        assert!(task.contains("Replace with new_function"));
        assert!(task.contains("a.py:3: old_function()"));

        let (tools, _) = setup(
            BatchKind::Semantic,
            json!({"results": [{"file_path": "auth.py"}, {"file_path": "login.py"}]}),
        );
        let out = tools
            .execute(
                "process_search_files_semantic",
                json!({"query": "authentication logic", "operation_description": "Refactor"}),
            )
            .await
            .result
            .unwrap();
        assert_eq!(out["total_results_found"], 2);
        assert!(out["summary"]
            .as_str()
            .unwrap()
            .contains("Processed 2 semantic search results in 1 groups"));
    }

    /// 与真实委派一样自带截止时间、耗时超过派发超时的委派
    struct SlowDelegate;

    #[async_trait]
    impl Tool for SlowDelegate {
        fn name(&self) -> &str {
            DELEGATE_TOOL_NAME
        }
        fn description(&self) -> &str {
            "slow delegate"
        }
        fn runs_own_deadline(&self) -> bool {
            true
        }
        async fn execute(&self, _args: Value) -> Result<Value, String> {
            tokio::time::sleep(std::time::Duration::from_secs(120)).await;
            Ok(json!({"success": true, "summary": "done"}))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_groups_are_not_cut_by_dispatch_timeout() {
        let registry = Arc::new(ToolRegistry::new());
        registry.register_function("search_files_by_name", "fake", |_| Ok(json!({"files": ["a", "b"]})));
        registry.register(SlowDelegate);
        let tools = Arc::new(ToolExecutor::new(registry.clone(), 5));
        registry.register(BatchProcessTool::new(BatchKind::FilesByName, Arc::downgrade(&tools), 2, 1, 100));
        let out = tools
            .execute("process_search_files_by_name", json!({"pattern": "*", "operation_description": "x"}))
            .await
            .result
            .unwrap();
        assert_eq!(out["successful_groups"], 2);
        assert_eq!(out["success"], true);
    }

    #[tokio::test]
    async fn test_failed_group_is_counted() {
        let registry = Arc::new(ToolRegistry::new());
        registry.register_function("search_files_by_name", "fake", |_| Ok(json!({"files": ["a", "b", "c"]})));
        registry.register_function(DELEGATE_TOOL_NAME, "fake", |args| {
            if args["task_description"].as_str().unwrap_or("").contains("- c") {
                Err("Task delegation failed: boom".into())
            } else {
                Ok(json!({"success": true, "summary": "ok"}))
            }
        });
        let tools = Arc::new(ToolExecutor::new(registry.clone(), 5));
        registry.register(BatchProcessTool::new(BatchKind::FilesByName, Arc::downgrade(&tools), 2, 2, 100));
        let out = tools
            .execute("process_search_files_by_name", json!({"pattern": "*", "operation_description": "x"}))
            .await
            .result
            .unwrap();
        assert_eq!(out["success"], false);
        assert_eq!(out["successful_groups"], 1);
        assert_eq!(out["failed_groups"], 1);
        assert_eq!(out["group_results"][1]["error"], "Task delegation failed: boom");
    }
}
