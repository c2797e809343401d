//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `CODESMITH__*` 覆盖（双下划线表示嵌套，如 `CODESMITH__LLM__PROVIDER=anthropic`）。
//! 加载完成后统一调用 [`AppConfig::validate`]，非法取值直接拒绝。

use std::path::PathBuf;

use serde::Deserialize;
use thiserror::Error;

use crate::core::{ConfirmationLevel, ExecutionMode};
use crate::llm::LlmProvider;

/// 配置加载或校验失败
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] config::ConfigError),

    #[error("Invalid value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmSection,
    pub execution: ExecutionConfig,
    pub safety: SafetySection,
    pub tools: ToolsSection,
    #[serde(default = "default_logging_level")]
    pub logging_level: String,
}

fn default_logging_level() -> String {
    "info".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            llm: LlmSection::default(),
            execution: ExecutionConfig::default(),
            safety: SafetySection::default(),
            tools: ToolsSection::default(),
            logging_level: default_logging_level(),
        }
    }
}

/// [llm] 段：后端、模型、采样参数与消息折叠开关
///
/// `top_p` / `frequency_penalty` / `presence_penalty` 为 None 时不会出现在请求中。
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub provider: LlmProvider,
    pub model: String,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    /// 旧字段名，仅在 base_url 未设置时生效
    pub api_base: Option<String>,
    /// Azure 专用
    pub api_version: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub frequency_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
    pub tool_choice: Option<String>,
    pub request_timeout_secs: u64,
    pub system_prompt: Option<String>,
    /// 目标接口不支持 system 角色时，把系统提示折叠进 user 消息
    pub disable_system_prompt: bool,
    /// 目标接口不支持 tool 角色时，把工具结果折叠进 user 消息
    pub disable_tool_role: bool,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: LlmProvider::default(),
            model: "gpt-4.1-mini".to_string(),
            api_key: None,
            base_url: None,
            api_base: None,
            api_version: None,
            max_tokens: Some(2000),
            temperature: Some(0.1),
            top_p: Some(0.95),
            frequency_penalty: Some(0.0),
            presence_penalty: Some(0.0),
            tool_choice: Some("auto".to_string()),
            request_timeout_secs: 60,
            system_prompt: None,
            disable_system_prompt: false,
            disable_tool_role: false,
        }
    }
}

impl LlmSection {
    /// base_url 优先；只配置了 api_base 时给出弃用提示
    pub fn resolved_base_url(&self) -> Option<String> {
        match (&self.base_url, &self.api_base) {
            (Some(url), _) => Some(url.clone()),
            (None, Some(url)) => {
                tracing::warn!("llm.api_base is deprecated, use llm.base_url instead");
                Some(url.clone())
            }
            (None, None) => self.provider.default_base_url().map(str::to_string),
        }
    }

    /// 配置中的 api_key 优先，否则按 provider 读取对应环境变量
    pub fn resolved_api_key(&self) -> Option<String> {
        if let Some(key) = self.api_key.as_ref().filter(|k| !k.is_empty()) {
            return Some(key.clone());
        }
        self.provider
            .api_key_env_vars()
            .iter()
            .find_map(|var| std::env::var(var).ok().filter(|v| !v.is_empty()))
    }
}

/// [execution] 段：迭代上限、超时、重试与并行度
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub default_mode: ExecutionMode,
    pub max_iterations: usize,
    /// 交互式对话的超时（秒）
    pub timeout: u64,
    /// agent 任务的整体超时（秒）
    pub task_timeout: u64,
    pub retry_on_failure: bool,
    /// 模型调用总尝试次数；同时作为失败工具的重新派发次数上限
    pub max_retry_attempts: u32,
    /// 普通可重试错误的基础退避（秒）
    pub retry_delay: f64,
    pub max_parallel_tasks: usize,
    pub continue_on_tool_failure: bool,
    pub use_planner: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_mode: ExecutionMode::Chat,
            max_iterations: 50,
            timeout: 300,
            task_timeout: 600,
            retry_on_failure: false,
            max_retry_attempts: 3,
            retry_delay: 1.0,
            max_parallel_tasks: 4,
            continue_on_tool_failure: false,
            use_planner: true,
        }
    }
}

/// [safety] 段：确认级别与 Shell 黑白名单
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SafetySection {
    pub confirmation_level: ConfirmationLevel,
    /// 为空表示除黑名单外均可执行（仅比较首词）
    pub allowed_shell_commands: Vec<String>,
    pub blocked_shell_commands: Vec<String>,
}

impl Default for SafetySection {
    fn default() -> Self {
        Self {
            confirmation_level: ConfirmationLevel::Medium,
            allowed_shell_commands: Vec::new(),
            blocked_shell_commands: ["rm", "sudo", "dd", "mkfs", "shutdown", "reboot"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// [tools] 段：工作目录、禁用工具、超时与批处理参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 沙箱根目录，未设置时用当前目录
    pub workspace_root: Option<PathBuf>,
    pub disabled_tools: Vec<String>,
    pub tool_timeout_secs: u64,
    pub batch_group_size: usize,
    pub batch_max_results: usize,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            workspace_root: None,
            disabled_tools: Vec::new(),
            tool_timeout_secs: 60,
            batch_group_size: 10,
            batch_max_results: 100,
        }
    }
}

impl ToolsSection {
    pub fn workspace(&self) -> PathBuf {
        self.workspace_root
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

impl AppConfig {
    /// 校验取值范围；任何一项不合法即返回错误
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn unit_range(field: &'static str, v: Option<f32>) -> Result<(), ConfigError> {
            match v {
                Some(x) if !(0.0..=1.0).contains(&x) => Err(ConfigError::Invalid {
                    field,
                    reason: format!("{x} is outside [0, 1]"),
                }),
                _ => Ok(()),
            }
        }

        unit_range("llm.temperature", self.llm.temperature)?;
        unit_range("llm.top_p", self.llm.top_p)?;
        if self.llm.max_tokens == Some(0) {
            return Err(ConfigError::Invalid {
                field: "llm.max_tokens",
                reason: "must be at least 1".into(),
            });
        }
        if self.llm.model.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "llm.model",
                reason: "must not be empty".into(),
            });
        }

        let exec = &self.execution;
        let positive: [(&'static str, u64); 4] = [
            ("execution.max_iterations", exec.max_iterations as u64),
            ("execution.timeout", exec.timeout),
            ("execution.task_timeout", exec.task_timeout),
            ("execution.max_parallel_tasks", exec.max_parallel_tasks as u64),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than 0".into(),
                });
            }
        }
        if !exec.retry_delay.is_finite() || exec.retry_delay < 0.0 {
            return Err(ConfigError::Invalid {
                field: "execution.retry_delay",
                reason: format!("{} is not a valid delay", exec.retry_delay),
            });
        }
        if self.tools.batch_group_size == 0 {
            return Err(ConfigError::Invalid {
                field: "tools.batch_group_size",
                reason: "must be greater than 0".into(),
            });
        }
        Ok(())
    }
}

/// 从 config 目录加载配置，环境变量 CODESMITH__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 CODESMITH__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        } else {
            tracing::warn!(path = %path.display(), "config file not found, skipping");
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("CODESMITH")
            .separator("__")
            .try_parsing(true),
    );

    let cfg: AppConfig = builder.build()?.try_deserialize()?;
    cfg.validate()?;
    Ok(cfg)
}
