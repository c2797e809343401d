//! get_tool_help：返回某个工具的描述与参数 Schema

use std::sync::Weak;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::tools::schema::{parameters_for, parse_args};
use crate::tools::{Tool, ToolRegistry};

#[derive(Deserialize, JsonSchema)]
struct ToolHelpArgs {
    /// 要查询的工具名
    tool_name: String,
}

/// 持有注册表的弱引用，避免注册表 -> 工具 -> 注册表的循环
pub struct ToolHelpTool {
    registry: Weak<ToolRegistry>,
}

impl ToolHelpTool {
    pub fn new(registry: Weak<ToolRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Tool for ToolHelpTool {
    fn name(&self) -> &str {
        "get_tool_help"
    }

    fn description(&self) -> &str {
        "Get the description and parameter schema of another available tool."
    }

    fn parameters_schema(&self) -> Value {
        parameters_for::<ToolHelpArgs>()
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let args: ToolHelpArgs = parse_args(self.name(), args)?;
        let registry = self
            .registry
            .upgrade()
            .ok_or_else(|| "Tool registry is no longer available".to_string())?;
        if registry.is_disabled(&args.tool_name) {
            return Err(format!("Tool '{}' is disabled", args.tool_name));
        }
        let tool = registry.get(&args.tool_name).ok_or_else(|| {
            format!(
                "Tool '{}' not found. Available tools: {}",
                args.tool_name,
                registry.list().join(", ")
            )
        })?;
        Ok(json!({
            "tool_name": tool.name(),
            "description": tool.description(),
            "parameters": tool.parameters_schema(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_help_for_registered_tool() {
        let registry = Arc::new(ToolRegistry::new());
        registry.register_function("echo", "Echo the input", |args| Ok(args));
        registry.register(ToolHelpTool::new(Arc::downgrade(&registry)));
        let help = registry.get("get_tool_help").unwrap();

        let out = help.execute(json!({"tool_name": "echo"})).await.unwrap();
        assert_eq!(out["tool_name"], "echo");
        assert_eq!(out["description"], "Echo the input");

        let err = help.execute(json!({"tool_name": "nope"})).await.unwrap_err();
        assert!(err.starts_with("Tool 'nope' not found"));

        registry.disable("echo");
        let err = help.execute(json!({"tool_name": "echo"})).await.unwrap_err();
        assert_eq!(err, "Tool 'echo' is disabled");
    }
}
