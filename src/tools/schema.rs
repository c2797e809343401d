//! 工具参数 Schema 生成（schemars）与参数解析
//!
//! 内置工具用带 `JsonSchema` 的参数结构体描述参数，生成的 Schema 直接作为 parameters 发给模型。

use schemars::{schema_for, JsonSchema};
use serde::de::DeserializeOwned;
use serde_json::Value;

/// 由参数结构体生成 JSON Schema（去掉 $schema / title 等元信息）
pub fn parameters_for<T: JsonSchema>() -> Value {
    let schema = schema_for!(T);
    let mut value = serde_json::to_value(schema).unwrap_or_else(|_| empty_parameters());
    if let Some(obj) = value.as_object_mut() {
        obj.remove("$schema");
        obj.remove("title");
        obj.entry("properties").or_insert_with(|| Value::Object(Default::default()));
    }
    value
}

pub fn empty_parameters() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {},
        "required": []
    })
}

/// 把 JSON 参数解析为结构体；失败信息带上工具名
pub fn parse_args<T: DeserializeOwned>(tool: &str, args: Value) -> Result<T, String> {
    let args = if args.is_null() {
        Value::Object(Default::default())
    } else {
        args
    };
    serde_json::from_value(args).map_err(|e| format!("Invalid arguments for {tool}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    /// 示例参数
    #[allow(dead_code)]
    #[derive(Deserialize, JsonSchema)]
    struct Demo {
        /// 文件路径
        path: String,
        #[serde(default)]
        recursive: bool,
    }

    #[test]
    fn test_parameters_for() {
        let schema = parameters_for::<Demo>();
        assert_eq!(schema["type"], "object");
        assert!(schema["properties"].get("path").is_some());
        assert_eq!(schema["required"], serde_json::json!(["path"]));
        assert!(schema.get("$schema").is_none());
    }

    #[test]
    fn test_parse_args_reports_tool() {
        let err = parse_args::<Demo>("demo", serde_json::json!({})).err().unwrap();
        assert!(err.starts_with("Invalid arguments for demo"));
        let ok: Demo = parse_args("demo", serde_json::json!({"path": "a"})).unwrap();
        assert!(!ok.recursive);
    }
}
