//! 沙箱文件系统工具
//!
//! SafeFs 绑定工作目录，所有路径必须落在根目录内（禁止 ../ 与符号链接逃逸）。
//! read_file / create_file / edit_file / list_directory 基于 SafeFs。

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::context::Reindenter;
use crate::tools::schema::{parameters_for, parse_args};
use crate::tools::{RiskLevel, Tool};

/// 沙箱文件系统
#[derive(Debug, Clone)]
pub struct SafeFs {
    root_dir: PathBuf,
}

impl SafeFs {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        let root = root_dir.as_ref().to_path_buf();
        let root_dir = root.canonicalize().unwrap_or(root);
        Self { root_dir }
    }

    pub fn root(&self) -> &Path {
        &self.root_dir
    }

    /// 词法解析路径（不要求存在），越出根目录即拒绝
    pub fn resolve_lexical(&self, path: &str) -> Result<PathBuf, String> {
        let candidate = Path::new(path);
        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root_dir.join(candidate)
        };
        let mut normalized = PathBuf::new();
        for component in joined.components() {
            match component {
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(format!("Path escapes workspace: {path}"));
                    }
                }
                Component::CurDir => {}
                other => normalized.push(other.as_os_str()),
            }
        }
        if normalized.starts_with(&self.root_dir) {
            Ok(normalized)
        } else {
            Err(format!("Path escapes workspace: {path}"))
        }
    }

    /// 解析已存在的路径，并跟随符号链接再次校验
    pub fn resolve(&self, path: &str) -> Result<PathBuf, String> {
        let lexical = self.resolve_lexical(path)?;
        let canonical = lexical
            .canonicalize()
            .map_err(|_| format!("Path not found: {path}"))?;
        if canonical.starts_with(&self.root_dir) {
            Ok(canonical)
        } else {
            Err(format!("Path escapes workspace: {path}"))
        }
    }

    /// 相对根目录的显示路径
    pub fn display(&self, path: &Path) -> String {
        path.strip_prefix(&self.root_dir)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }
}

/// 带行号的文件内容：`N\t|\t<line>`
pub fn number_lines(content: &str, start_line: usize) -> String {
    content
        .lines()
        .enumerate()
        .map(|(i, line)| format!("{}\t|\t{}", i + start_line, line))
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Deserialize, JsonSchema)]
struct ReadFileArgs {
    /// 相对工作目录的文件路径
    path: String,
    /// 起始行（从 1 开始，含）
    start_line: Option<usize>,
    /// 结束行（含）
    end_line: Option<usize>,
}

/// read_file：返回带行号的内容
pub struct ReadFileTool {
    fs: SafeFs,
}

impl ReadFileTool {
    pub fn new(fs: SafeFs) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a file from the workspace. Each line is prefixed with its line number as 'N\\t|\\t'. Optionally restrict to a line range."
    }

    fn parameters_schema(&self) -> Value {
        parameters_for::<ReadFileArgs>()
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let args: ReadFileArgs = parse_args(self.name(), args)?;
        let path = self.fs.resolve(&args.path)?;
        tracing::info!(path = %args.path, "read_file tool execute");
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| format!("Read failed: {e}"))?;
        let start = args.start_line.unwrap_or(1).max(1);
        let selected: Vec<&str> = content
            .lines()
            .skip(start - 1)
            .take(match args.end_line {
                Some(end) if end >= start => end - start + 1,
                Some(_) => 0,
                None => usize::MAX,
            })
            .collect();
        Ok(Value::String(number_lines(&selected.join("\n"), start)))
    }
}

#[derive(Deserialize, JsonSchema)]
struct CreateFileArgs {
    /// 相对工作目录的文件路径
    path: String,
    /// 文件内容
    content: String,
    /// 文件已存在时是否覆盖
    #[serde(default)]
    overwrite: bool,
}

/// create_file：创建文件（自动创建父目录）
pub struct CreateFileTool {
    fs: SafeFs,
}

impl CreateFileTool {
    pub fn new(fs: SafeFs) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl Tool for CreateFileTool {
    fn name(&self) -> &str {
        "create_file"
    }

    fn description(&self) -> &str {
        "Create a new file with the given content. Parent directories are created as needed. Fails if the file exists unless overwrite is true."
    }

    fn parameters_schema(&self) -> Value {
        parameters_for::<CreateFileArgs>()
    }

    fn risk(&self) -> RiskLevel {
        RiskLevel::Medium
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let args: CreateFileArgs = parse_args(self.name(), args)?;
        let path = self.fs.resolve_lexical(&args.path)?;
        if path.exists() && !args.overwrite {
            return Err(format!("File already exists: {}", args.path));
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| format!("Create directory failed: {e}"))?;
        }
        tokio::fs::write(&path, &args.content)
            .await
            .map_err(|e| format!("Write failed: {e}"))?;
        tracing::info!(path = %args.path, bytes = args.content.len(), "create_file tool execute");
        Ok(json!({
            "path": self.fs.display(&path),
            "bytes_written": args.content.len(),
        }))
    }
}

#[derive(Deserialize, JsonSchema)]
struct EditFileArgs {
    /// 相对工作目录的文件路径
    path: String,
    /// 要替换的原文（必须在文件中恰好出现一次）
    old_text: String,
    /// 替换后的内容
    new_text: String,
}

/// edit_file：精确替换，新代码块经 Reindenter 调整缩进
pub struct EditFileTool {
    fs: SafeFs,
    reindenter: Arc<dyn Reindenter>,
}

impl EditFileTool {
    pub fn new(fs: SafeFs, reindenter: Arc<dyn Reindenter>) -> Self {
        Self { fs, reindenter }
    }
}

#[async_trait]
impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "edit_file"
    }

    fn description(&self) -> &str {
        "Replace an exact block of text in a file. old_text must occur exactly once; include enough surrounding lines to make it unique."
    }

    fn parameters_schema(&self) -> Value {
        parameters_for::<EditFileArgs>()
    }

    fn risk(&self) -> RiskLevel {
        RiskLevel::Medium
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let args: EditFileArgs = parse_args(self.name(), args)?;
        if args.old_text.is_empty() {
            return Err("old_text must not be empty".to_string());
        }
        let path = self.fs.resolve(&args.path)?;
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| format!("Read failed: {e}"))?;
        let occurrences = content.matches(args.old_text.as_str()).count();
        match occurrences {
            0 => return Err(format!("old_text not found in {}", args.path)),
            1 => {}
            n => {
                return Err(format!(
                    "old_text matches {n} times in {}; provide more context",
                    args.path
                ))
            }
        }
        let new_block = self
            .reindenter
            .reindent(&args.old_text, &args.new_text, &content, &path);
        let updated = content.replacen(args.old_text.as_str(), &new_block, 1);
        tokio::fs::write(&path, &updated)
            .await
            .map_err(|e| format!("Write failed: {e}"))?;
        let line = content
            .find(args.old_text.as_str())
            .map(|idx| content[..idx].lines().count().max(1))
            .unwrap_or(1);
        tracing::info!(path = %args.path, line, "edit_file tool execute");
        Ok(json!({
            "path": self.fs.display(&path),
            "replacements": 1,
            "line": line,
        }))
    }
}

#[derive(Deserialize, JsonSchema)]
struct ListDirectoryArgs {
    /// 目录路径，默认为工作目录
    path: Option<String>,
    /// 是否递归列出
    #[serde(default)]
    recursive: bool,
    /// 递归深度上限
    max_depth: Option<usize>,
}

/// list_directory：列出目录（隐藏文件除外），目录以 / 结尾
pub struct ListDirectoryTool {
    fs: SafeFs,
}

impl ListDirectoryTool {
    pub fn new(fs: SafeFs) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl Tool for ListDirectoryTool {
    fn name(&self) -> &str {
        "list_directory"
    }

    fn description(&self) -> &str {
        "List entries of a workspace directory. Directories end with '/'. Set recursive to walk subdirectories."
    }

    fn parameters_schema(&self) -> Value {
        parameters_for::<ListDirectoryArgs>()
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let args: ListDirectoryArgs = parse_args(self.name(), args)?;
        let path = args.path.as_deref().unwrap_or(".");
        let base = self.fs.resolve(path)?;
        if !base.is_dir() {
            return Err(format!("Not a directory: {path}"));
        }
        let depth = if args.recursive {
            args.max_depth.unwrap_or(5).max(1)
        } else {
            1
        };
        let mut entries = Vec::new();
        for entry in walkdir::WalkDir::new(&base)
            .min_depth(1)
            .max_depth(depth)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !e.file_name().to_string_lossy().starts_with('.'))
            .filter_map(|e| e.ok())
        {
            let suffix = if entry.file_type().is_dir() { "/" } else { "" };
            let relative = entry.path().strip_prefix(&base).unwrap_or(entry.path());
            entries.push(format!("{}{}", relative.to_string_lossy().replace('\\', "/"), suffix));
        }
        Ok(json!({
            "path": path,
            "entries": entries,
            "count": entries.len(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::NoopReindenter;

    fn setup() -> (tempfile::TempDir, SafeFs) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), "fn a() {}\nfn b() {}\nfn c() {}\n").unwrap();
        let fs = SafeFs::new(dir.path());
        (dir, fs)
    }

    #[tokio::test]
    async fn test_read_file_numbers_lines() {
        let (_dir, fs) = setup();
        let tool = ReadFileTool::new(fs);
        let out = tool.execute(json!({"path": "src/lib.rs"})).await.unwrap();
        assert_eq!(out, json!("1\t|\tfn a() {}\n2\t|\tfn b() {}\n3\t|\tfn c() {}"));
        let out = tool
            .execute(json!({"path": "src/lib.rs", "start_line": 2, "end_line": 2}))
            .await
            .unwrap();
        assert_eq!(out, json!("2\t|\tfn b() {}"));
    }

    #[tokio::test]
    async fn test_path_escape_rejected() {
        let (_dir, fs) = setup();
        let tool = ReadFileTool::new(fs.clone());
        let err = tool.execute(json!({"path": "../../etc/passwd"})).await.unwrap_err();
        assert!(err.contains("escapes workspace"));
        let create = CreateFileTool::new(fs);
        assert!(create
            .execute(json!({"path": "../outside.txt", "content": "x"}))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_create_and_edit() {
        let (dir, fs) = setup();
        let create = CreateFileTool::new(fs.clone());
        create
            .execute(json!({"path": "new/mod.rs", "content": "pub fn x() {}\n"}))
            .await
            .unwrap();
        assert!(create
            .execute(json!({"path": "new/mod.rs", "content": "again"}))
            .await
            .unwrap_err()
            .contains("already exists"));

        let edit = EditFileTool::new(fs, Arc::new(NoopReindenter));
        let out = edit
            .execute(json!({"path": "src/lib.rs", "old_text": "fn b() {}", "new_text": "fn b2() {}"}))
            .await
            .unwrap();
        assert_eq!(out["line"], 2);
        let content = std::fs::read_to_string(dir.path().join("src/lib.rs")).unwrap();
        assert!(content.contains("fn b2() {}"));

        let err = edit
            .execute(json!({"path": "src/lib.rs", "old_text": "fn ", "new_text": "x"}))
            .await
            .unwrap_err();
        assert!(err.contains("matches 3 times"));
    }

    struct Indent;

    impl Reindenter for Indent {
        fn reindent(&self, _old: &str, new_block: &str, _full: &str, _path: &Path) -> String {
            format!("    {new_block}")
        }
    }

    #[tokio::test]
    async fn test_edit_uses_reindenter() {
        let (dir, fs) = setup();
        let edit = EditFileTool::new(fs, Arc::new(Indent));
        edit.execute(json!({"path": "src/lib.rs", "old_text": "fn c() {}", "new_text": "fn d() {}"}))
            .await
            .unwrap();
        let content = std::fs::read_to_string(dir.path().join("src/lib.rs")).unwrap();
        assert!(content.contains("    fn d() {}"));
    }

    #[tokio::test]
    async fn test_list_directory() {
        let (_dir, fs) = setup();
        let tool = ListDirectoryTool::new(fs);
        let out = tool.execute(json!({})).await.unwrap();
        assert_eq!(out["entries"], json!(["src/"]));
        let out = tool.execute(json!({"recursive": true})).await.unwrap();
        assert_eq!(out["entries"], json!(["src/", "src/lib.rs"]));
    }
}
