//! 文件搜索：按文件名（glob）与按内容（正则或字面量）
//!
//! FileSearcher 同时供 search_files_by_* 工具与批处理工具使用。
//! 跳过隐藏目录、target、node_modules 以及超过大小上限的文件。

use std::path::Path;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::filesystem::SafeFs;
use crate::tools::schema::{parameters_for, parse_args};
use crate::tools::Tool;

const SKIP_DIRS: &[&str] = &["target", "node_modules"];
const MAX_FILE_SIZE: u64 = 1024 * 1024;
const MAX_DEPTH: usize = 20;

/// 单条内容匹配
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContentMatch {
    pub file: String,
    pub line: usize,
    pub content: String,
}

/// 内容搜索选项
#[derive(Debug, Clone, Default)]
pub struct ContentQuery<'a> {
    pub pattern: &'a str,
    pub path: Option<&'a str>,
    pub include: Option<&'a str>,
    pub regex: bool,
    pub case_sensitive: bool,
}

#[derive(Debug, Clone)]
pub struct FileSearcher {
    fs: SafeFs,
}

impl FileSearcher {
    pub fn new(fs: SafeFs) -> Self {
        Self { fs }
    }

    fn walk(&self, base: &Path) -> impl Iterator<Item = walkdir::DirEntry> {
        walkdir::WalkDir::new(base)
            .max_depth(MAX_DEPTH)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                let name = e.file_name().to_string_lossy();
                e.depth() == 0 || (!name.starts_with('.') && !SKIP_DIRS.contains(&name.as_ref()))
            })
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
    }

    /// 按 glob 匹配文件；模式含 `/` 时匹配相对路径，否则匹配文件名
    pub fn find_by_name(
        &self,
        pattern: &str,
        path: Option<&str>,
        max_results: usize,
    ) -> Result<Vec<String>, String> {
        let glob = glob::Pattern::new(pattern).map_err(|e| format!("Invalid glob pattern: {e}"))?;
        let base = self.fs.resolve(path.unwrap_or("."))?;
        let match_path = pattern.contains('/');
        let mut files = Vec::new();
        for entry in self.walk(&base) {
            if files.len() >= max_results {
                break;
            }
            let relative = self.fs.display(entry.path());
            let hit = if match_path {
                glob.matches(&relative)
            } else {
                glob.matches(&entry.file_name().to_string_lossy())
            };
            if hit {
                files.push(relative);
            }
        }
        Ok(files)
    }

    /// 逐行搜索内容
    pub fn find_by_content(
        &self,
        query: &ContentQuery<'_>,
        max_results: usize,
    ) -> Result<Vec<ContentMatch>, String> {
        let source = if query.regex {
            query.pattern.to_string()
        } else {
            regex::escape(query.pattern)
        };
        let re = regex::RegexBuilder::new(&source)
            .case_insensitive(!query.case_sensitive)
            .build()
            .map_err(|e| format!("Invalid regex pattern: {e}"))?;
        let include = query
            .include
            .map(glob::Pattern::new)
            .transpose()
            .map_err(|e| format!("Invalid include pattern: {e}"))?;
        let base = self.fs.resolve(query.path.unwrap_or("."))?;

        let mut matches = Vec::new();
        'files: for entry in self.walk(&base) {
            if let Some(include) = &include {
                if !include.matches(&entry.file_name().to_string_lossy()) {
                    continue;
                }
            }
            if entry.metadata().map(|m| m.len() > MAX_FILE_SIZE).unwrap_or(true) {
                continue;
            }
            // 二进制或非 UTF-8 文件直接跳过
            let Ok(content) = std::fs::read_to_string(entry.path()) else {
                continue;
            };
            let file = self.fs.display(entry.path());
            for (idx, line) in content.lines().enumerate() {
                if re.is_match(line) {
                    if matches.len() >= max_results {
                        break 'files;
                    }
                    matches.push(ContentMatch {
                        file: file.clone(),
                        line: idx + 1,
                        content: line.trim_end().to_string(),
                    });
                }
            }
        }
        Ok(matches)
    }
}

#[derive(Deserialize, JsonSchema)]
struct SearchByNameArgs {
    /// glob 模式，如 `*.rs` 或 `src/**/*.toml`
    pattern: String,
    /// 搜索起点目录
    path: Option<String>,
    /// 最多返回条数
    max_results: Option<usize>,
}

pub struct SearchFilesByNameTool {
    searcher: FileSearcher,
    default_limit: usize,
}

impl SearchFilesByNameTool {
    pub fn new(searcher: FileSearcher, default_limit: usize) -> Self {
        Self {
            searcher,
            default_limit,
        }
    }
}

#[async_trait]
impl Tool for SearchFilesByNameTool {
    fn name(&self) -> &str {
        "search_files_by_name"
    }

    fn description(&self) -> &str {
        "Find files whose name matches a glob pattern (e.g. '*.rs'). Patterns containing '/' match the path relative to the workspace."
    }

    fn parameters_schema(&self) -> Value {
        parameters_for::<SearchByNameArgs>()
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let args: SearchByNameArgs = parse_args(self.name(), args)?;
        let limit = args.max_results.unwrap_or(self.default_limit);
        let files = self
            .searcher
            .find_by_name(&args.pattern, args.path.as_deref(), limit)?;
        tracing::info!(pattern = %args.pattern, found = files.len(), "search_files_by_name");
        Ok(json!({
            "pattern": args.pattern,
            "count": files.len(),
            "files": files,
        }))
    }
}

#[derive(Deserialize, JsonSchema)]
struct SearchByContentArgs {
    /// 搜索内容
    pattern: String,
    /// 搜索起点目录
    path: Option<String>,
    /// 文件名 glob 过滤，如 `*.rs`
    include: Option<String>,
    /// 是否按正则解释 pattern
    #[serde(default)]
    regex: bool,
    /// 是否区分大小写
    #[serde(default)]
    case_sensitive: bool,
    /// 最多返回条数
    max_results: Option<usize>,
}

pub struct SearchFilesByContentTool {
    searcher: FileSearcher,
    default_limit: usize,
}

impl SearchFilesByContentTool {
    pub fn new(searcher: FileSearcher, default_limit: usize) -> Self {
        Self {
            searcher,
            default_limit,
        }
    }
}

#[async_trait]
impl Tool for SearchFilesByContentTool {
    fn name(&self) -> &str {
        "search_files_by_content"
    }

    fn description(&self) -> &str {
        "Search file contents line by line for a literal string or regex. Returns file, line number and matching line."
    }

    fn parameters_schema(&self) -> Value {
        parameters_for::<SearchByContentArgs>()
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let args: SearchByContentArgs = parse_args(self.name(), args)?;
        let limit = args.max_results.unwrap_or(self.default_limit);
        let query = ContentQuery {
            pattern: &args.pattern,
            path: args.path.as_deref(),
            include: args.include.as_deref(),
            regex: args.regex,
            case_sensitive: args.case_sensitive,
        };
        let matches = self.searcher.find_by_content(&query, limit)?;
        tracing::info!(pattern = %args.pattern, found = matches.len(), "search_files_by_content");
        Ok(json!({
            "pattern": args.pattern,
            "count": matches.len(),
            "truncated": matches.len() >= limit,
            "matches": matches,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, FileSearcher) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("src/nested")).unwrap();
        std::fs::create_dir_all(root.join("target")).unwrap();
        std::fs::create_dir_all(root.join(".git")).unwrap();
        std::fs::write(root.join("src/main.rs"), "fn main() {\n    // TODO remove\n}\n").unwrap();
        std::fs::write(root.join("src/nested/util.rs"), "pub fn todo_list() {}\n").unwrap();
        std::fs::write(root.join("README.md"), "# todo\n").unwrap();
        std::fs::write(root.join("target/gen.rs"), "// TODO generated\n").unwrap();
        std::fs::write(root.join(".git/config.rs"), "// TODO hidden\n").unwrap();
        let searcher = FileSearcher::new(SafeFs::new(root));
        (dir, searcher)
    }

    #[test]
    fn test_find_by_name_skips_ignored_dirs() {
        let (_dir, searcher) = setup();
        let files = searcher.find_by_name("*.rs", None, 100).unwrap();
        assert_eq!(files, vec!["src/main.rs", "src/nested/util.rs"]);
        let files = searcher.find_by_name("src/nested/*.rs", None, 100).unwrap();
        assert_eq!(files, vec!["src/nested/util.rs"]);
        let files = searcher.find_by_name("*.rs", None, 1).unwrap();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn test_find_by_content_case_and_include() {
        let (_dir, searcher) = setup();
        let insensitive = ContentQuery {
            pattern: "todo",
            ..Default::default()
        };
        let hits = searcher.find_by_content(&insensitive, 100).unwrap();
        assert_eq!(hits.len(), 3);

        let sensitive = ContentQuery {
            pattern: "TODO",
            case_sensitive: true,
            include: Some("*.rs"),
            ..Default::default()
        };
        let hits = searcher.find_by_content(&sensitive, 100).unwrap();
        assert_eq!(
            hits,
            vec![ContentMatch {
                file: "src/main.rs".into(),
                line: 2,
                content: "    // TODO remove".into(),
            }]
        );
    }

    #[test]
    fn test_literal_pattern_is_escaped() {
        let (_dir, searcher) = setup();
        let literal = ContentQuery {
            pattern: "main()",
            ..Default::default()
        };
        assert_eq!(searcher.find_by_content(&literal, 100).unwrap().len(), 1);
        let bad = ContentQuery {
            pattern: "(",
            regex: true,
            ..Default::default()
        };
        assert!(searcher.find_by_content(&bad, 100).is_err());
    }

    #[tokio::test]
    async fn test_tools_report_counts() {
        let (_dir, searcher) = setup();
        let tool = SearchFilesByContentTool::new(searcher.clone(), 100);
        let out = tool
            .execute(json!({"pattern": "fn", "include": "*.rs"}))
            .await
            .unwrap();
        assert_eq!(out["count"], 2);
        let tool = SearchFilesByNameTool::new(searcher, 100);
        let out = tool.execute(json!({"pattern": "*.md"})).await.unwrap();
        assert_eq!(out["files"], json!(["README.md"]));
    }
}
