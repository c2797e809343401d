//! 后端能力表
//!
//! 请求构造只查询能力（是否支持 tool_choice、是否支持惩罚参数、工具格式），不按 provider 名称分支。

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// 模型后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    #[default]
    OpenAi,
    Azure,
    #[serde(alias = "claude")]
    Anthropic,
    #[serde(alias = "gemini", alias = "vertex_ai")]
    Google,
    Ollama,
    /// 任意 OpenAI 兼容端点
    Custom,
}

/// 工具描述在请求中的形态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolFormat {
    /// `{type: "function", function: {name, description, parameters}}`
    OpenAiFunction,
    /// `{name, description, input_schema}`
    AnthropicFlat,
    /// `[{function_declarations: [{name, description, parameters}]}]`
    GoogleDeclarations,
}

/// 单个后端支持的请求字段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderCapabilities {
    pub supports_tool_choice: bool,
    pub supports_penalties: bool,
    pub supports_top_p: bool,
    pub tool_format: ToolFormat,
}

const OPENAI_COMPATIBLE: ProviderCapabilities = ProviderCapabilities {
    supports_tool_choice: true,
    supports_penalties: true,
    supports_top_p: true,
    tool_format: ToolFormat::OpenAiFunction,
};

const ANTHROPIC: ProviderCapabilities = ProviderCapabilities {
    supports_tool_choice: false,
    supports_penalties: false,
    supports_top_p: true,
    tool_format: ToolFormat::AnthropicFlat,
};

const GOOGLE: ProviderCapabilities = ProviderCapabilities {
    supports_tool_choice: false,
    supports_penalties: false,
    supports_top_p: true,
    tool_format: ToolFormat::GoogleDeclarations,
};

impl LlmProvider {
    pub fn capabilities(self) -> ProviderCapabilities {
        match self {
            LlmProvider::OpenAi | LlmProvider::Azure | LlmProvider::Ollama | LlmProvider::Custom => {
                OPENAI_COMPATIBLE
            }
            LlmProvider::Anthropic => ANTHROPIC,
            LlmProvider::Google => GOOGLE,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LlmProvider::OpenAi => "openai",
            LlmProvider::Azure => "azure",
            LlmProvider::Anthropic => "anthropic",
            LlmProvider::Google => "google",
            LlmProvider::Ollama => "ollama",
            LlmProvider::Custom => "custom",
        }
    }

    /// 未配置 api_key 时依次查找的环境变量
    pub fn api_key_env_vars(self) -> &'static [&'static str] {
        match self {
            LlmProvider::OpenAi | LlmProvider::Custom => &["OPENAI_API_KEY"],
            LlmProvider::Azure => &["AZURE_API_KEY", "AZURE_OPENAI_API_KEY"],
            LlmProvider::Anthropic => &["ANTHROPIC_API_KEY"],
            LlmProvider::Google => &["GOOGLE_API_KEY", "GEMINI_API_KEY"],
            LlmProvider::Ollama => &[],
        }
    }

    pub fn default_base_url(self) -> Option<&'static str> {
        match self {
            LlmProvider::OpenAi => Some("https://api.openai.com/v1"),
            LlmProvider::Anthropic => Some("https://api.anthropic.com"),
            LlmProvider::Google => Some("https://generativelanguage.googleapis.com"),
            LlmProvider::Ollama => Some("http://localhost:11434/v1"),
            LlmProvider::Azure | LlmProvider::Custom => None,
        }
    }
}

impl fmt::Display for LlmProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LlmProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(LlmProvider::OpenAi),
            "azure" => Ok(LlmProvider::Azure),
            "anthropic" | "claude" => Ok(LlmProvider::Anthropic),
            "google" | "gemini" | "vertex_ai" => Ok(LlmProvider::Google),
            "ollama" => Ok(LlmProvider::Ollama),
            "custom" => Ok(LlmProvider::Custom),
            other => Err(format!("unknown provider: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_table() {
        for p in [LlmProvider::OpenAi, LlmProvider::Azure, LlmProvider::Ollama, LlmProvider::Custom] {
            let caps = p.capabilities();
            assert!(caps.supports_tool_choice, "{p}");
            assert!(caps.supports_penalties, "{p}");
            assert_eq!(caps.tool_format, ToolFormat::OpenAiFunction);
        }
        for p in [LlmProvider::Anthropic, LlmProvider::Google] {
            let caps = p.capabilities();
            assert!(!caps.supports_tool_choice, "{p}");
            assert!(!caps.supports_penalties, "{p}");
            assert!(caps.supports_top_p, "{p}");
        }
    }

    #[test]
    fn test_parse_aliases() {
        assert_eq!("Claude".parse::<LlmProvider>().unwrap(), LlmProvider::Anthropic);
        assert_eq!("gemini".parse::<LlmProvider>().unwrap(), LlmProvider::Google);
        assert!("mystery".parse::<LlmProvider>().is_err());
        let p: LlmProvider = serde_json::from_value("openai".into()).unwrap();
        assert_eq!(p, LlmProvider::OpenAi);
    }
}
