//! Shell 执行器：黑名单命令名 + 可选白名单，禁止危险子串
//!
//! 执行通过 sh -c / cmd /C，在工作目录下运行，带超时与 tracing 审计。

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::process::Command;

use crate::config::SafetySection;
use crate::tools::schema::{parameters_for, parse_args};
use crate::tools::{RiskLevel, SafetyCheck, Tool};

/// 禁止的子串（即使命令名被允许，也不允许带这些参数）
const FORBIDDEN_SUBSTR: &[&str] = &[
    "rm -rf",
    "rm -fr",
    "wget ",
    "curl | sh",
    "| sh",
    "chmod 777",
    "chmod +s",
    "dd if=",
    "> /dev/sd",
    ":(){ :|:& };:", // fork bomb
];

#[derive(Deserialize, JsonSchema)]
struct RunShellArgs {
    /// 要执行的 shell 命令
    command: String,
    /// 超时秒数，默认使用工具超时
    timeout_secs: Option<u64>,
}

/// run_shell：在工作目录执行命令
pub struct RunShellTool {
    allowed: HashSet<String>,
    blocked: HashSet<String>,
    workdir: PathBuf,
    timeout_secs: u64,
}

impl RunShellTool {
    pub fn new(safety: &SafetySection, workdir: PathBuf, timeout_secs: u64) -> Self {
        let lower = |v: &[String]| v.iter().map(|s| s.to_lowercase()).collect::<HashSet<_>>();
        Self {
            allowed: lower(&safety.allowed_shell_commands),
            blocked: lower(&safety.blocked_shell_commands),
            workdir,
            timeout_secs,
        }
    }

    /// 首个 token 作为命令名
    fn command_name(raw: &str) -> &str {
        raw.split_whitespace().next().unwrap_or("")
    }

    fn check(&self, raw: &str) -> Result<(), String> {
        let lower = raw.trim().to_lowercase();
        let name = Self::command_name(&lower);
        if name.is_empty() {
            return Err("Empty command".to_string());
        }
        for forbidden in FORBIDDEN_SUBSTR {
            if lower.contains(forbidden) {
                return Err(format!("Forbidden pattern: {forbidden}"));
            }
        }
        // 管道与串联中的每一段都要检查命令名
        for segment in lower.split(|c| c == '|' || c == ';' || c == '&') {
            let seg_name = Self::command_name(segment);
            if seg_name.is_empty() {
                continue;
            }
            if self.blocked.contains(seg_name) {
                return Err(format!("Command '{seg_name}' is blocked"));
            }
            if !self.allowed.is_empty() && !self.allowed.contains(seg_name) {
                return Err(format!("Command '{seg_name}' not in allowlist"));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Tool for RunShellTool {
    fn name(&self) -> &str {
        "run_shell"
    }

    fn description(&self) -> &str {
        "Run a shell command in the workspace directory and return its exit code, stdout and stderr. Destructive commands are blocked."
    }

    fn parameters_schema(&self) -> Value {
        parameters_for::<RunShellArgs>()
    }

    fn risk(&self) -> RiskLevel {
        RiskLevel::High
    }

    fn safety_check(&self, args: &Value) -> Option<SafetyCheck> {
        let command = args.get("command").and_then(Value::as_str).unwrap_or("");
        self.check(command)
            .err()
            .map(|reason| SafetyCheck::failed("shell_command", reason, RiskLevel::High))
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let args: RunShellArgs = parse_args(self.name(), args)?;
        let command = args.command.trim();
        self.check(command)?;
        let timeout_secs = args.timeout_secs.unwrap_or(self.timeout_secs).max(1);

        tracing::info!(command = %command, timeout_secs, "shell tool execute");

        let mut cmd = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", command]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", command]);
            c
        };
        cmd.current_dir(&self.workdir).kill_on_drop(true);

        let output = tokio::time::timeout(Duration::from_secs(timeout_secs), cmd.output())
            .await
            .map_err(|_| format!("Command timed out after {timeout_secs}s"))?
            .map_err(|e| format!("Execution failed: {e}"))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if !output.status.success() {
            return Err(format!(
                "Exit {}\nstdout: {}\nstderr: {}",
                output.status.code().unwrap_or(-1),
                stdout.trim(),
                stderr.trim()
            ));
        }
        Ok(json!({
            "exit_code": output.status.code().unwrap_or(0),
            "stdout": stdout,
            "stderr": stderr,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(allowed: &[&str]) -> RunShellTool {
        let safety = SafetySection {
            allowed_shell_commands: allowed.iter().map(|s| s.to_string()).collect(),
            ..SafetySection::default()
        };
        RunShellTool::new(&safety, std::env::temp_dir(), 5)
    }

    #[test]
    fn test_blocked_and_forbidden() {
        let t = tool(&[]);
        assert!(t.check("rm file.txt").unwrap_err().contains("blocked"));
        assert!(t.check("ls | sudo tee x").unwrap_err().contains("blocked"));
        assert!(t.check("find . -exec chmod 777 {} ;").unwrap_err().contains("Forbidden"));
        assert!(t.check("").is_err());
        assert!(t.check("echo hi").is_ok());
    }

    #[test]
    fn test_allowlist_applies_to_each_segment() {
        let t = tool(&["ls", "grep"]);
        assert!(t.check("ls -la | grep src").is_ok());
        assert!(t.check("ls && cat secret").unwrap_err().contains("allowlist"));
    }

    #[test]
    fn test_safety_check_reports_failure() {
        let t = tool(&[]);
        let check = t.safety_check(&json!({"command": "sudo ls"})).unwrap();
        assert!(!check.passed);
        assert_eq!(check.severity, RiskLevel::High);
        assert!(t.safety_check(&json!({"command": "echo ok"})).is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_echo() {
        let t = tool(&[]);
        let out = t.execute(json!({"command": "echo hello"})).await.unwrap();
        assert_eq!(out["exit_code"], 0);
        assert_eq!(out["stdout"].as_str().unwrap().trim(), "hello");
        let err = t.execute(json!({"command": "exit 3"})).await.unwrap_err();
        assert!(err.starts_with("Exit 3"));
    }
}
