//! 结构化输出：从模型回复中提取 JSON 并按 Schema 的 required 字段校验
//!
//! 提取顺序：```json 围栏块 → 第一个可解析的对象 → 第一个可解析的数组。
//! 解析前会清洗注释、尾随逗号与单引号字符串。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 最终输出格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    Json,
    Raw,
}

/// 任务最终输出：原文 + 可选的结构化结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredOutput {
    pub raw: String,
    pub json: Option<Value>,
    pub output_format: OutputFormat,
}

impl StructuredOutput {
    pub fn raw(text: impl Into<String>) -> Self {
        Self {
            raw: text.into(),
            json: None,
            output_format: OutputFormat::Raw,
        }
    }

    /// 有 schema 时尝试结构化，失败退回 raw
    pub fn from_response(text: &str, schema: Option<&Value>) -> Self {
        match schema.and_then(|s| parse_structured(text, s)) {
            Some(json) => Self {
                raw: text.to_string(),
                json: Some(json),
                output_format: OutputFormat::Json,
            },
            None => Self::raw(text),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.json.as_ref().and_then(|j| j.get(key))
    }
}

/// 从文本中提取 JSON 片段（对象优先于数组）
pub fn extract_json_from_text(text: &str) -> Option<String> {
    if let Some(block) = fenced_block(text) {
        return Some(block);
    }
    first_balanced(text, '{', '}').or_else(|| first_balanced(text, '[', ']'))
}

fn fenced_block(text: &str) -> Option<String> {
    let start = text.find("```json").map(|i| i + 7).or_else(|| text.find("```").map(|i| i + 3))?;
    let rest = &text[start..];
    let end = rest.find("```")?;
    let body = rest[..end].trim();
    (body.starts_with('{') || body.starts_with('[')).then(|| body.to_string())
}

/// 找到第一个括号配平且能被解析的片段
fn first_balanced(text: &str, open: char, close: char) -> Option<String> {
    for (start, _) in text.match_indices(open) {
        if let Some(len) = balanced_len(&text[start..], open, close) {
            let candidate = &text[start..start + len];
            if serde_json::from_str::<Value>(&clean_json_string(candidate)).is_ok() {
                return Some(candidate.to_string());
            }
        }
    }
    None
}

fn balanced_len(text: &str, open: char, close: char) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (idx, c) in text.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => quote = Some(c),
            c if c == open => depth += 1,
            c if c == close => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(idx + c.len_utf8());
                }
            }
            _ => {}
        }
    }
    None
}

/// 清洗近似 JSON：去掉注释，单引号字符串改双引号，去掉尾随逗号
pub fn clean_json_string(raw: &str) -> String {
    let chars: Vec<char> = raw.chars().collect();
    let mut out = String::with_capacity(raw.len());
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '"' => {
                let end = string_end(&chars, i, '"');
                out.extend(&chars[i..end]);
                i = end;
            }
            '\'' => {
                let end = string_end(&chars, i, '\'');
                out.push('"');
                let inner_end = if end > i + 1 && chars[end - 1] == '\'' { end - 1 } else { end };
                for &ch in &chars[i + 1..inner_end] {
                    if ch == '"' {
                        out.push('\\');
                    }
                    out.push(ch);
                }
                out.push('"');
                i = end;
            }
            '/' if chars.get(i + 1) == Some(&'/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                i += 2;
                while i + 1 < chars.len() && !(chars[i] == '*' && chars[i + 1] == '/') {
                    i += 1;
                }
                i = (i + 2).min(chars.len());
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    strip_trailing_commas(out.trim())
}

/// 字符串结束位置（指向闭合引号之后）
fn string_end(chars: &[char], start: usize, quote: char) -> usize {
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            '\\' => i += 2,
            c if c == quote => return i + 1,
            _ => i += 1,
        }
    }
    chars.len()
}

fn strip_trailing_commas(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '"' {
            let end = string_end(&chars, i, '"');
            out.extend(&chars[i..end]);
            i = end;
            continue;
        }
        if c == ',' {
            let next = chars[i + 1..].iter().find(|ch| !ch.is_whitespace());
            if matches!(next, Some('}') | Some(']')) {
                i += 1;
                continue;
            }
        }
        out.push(c);
        i += 1;
    }
    out
}

/// 提取、清洗、解析，并校验 schema 的 required 字段
pub fn parse_structured(text: &str, schema: &Value) -> Option<Value> {
    let fragment = extract_json_from_text(text)?;
    let value: Value = serde_json::from_str(&fragment)
        .or_else(|_| serde_json::from_str(&clean_json_string(&fragment)))
        .ok()?;
    let missing = missing_required(&value, schema);
    if missing.is_empty() {
        Some(value)
    } else {
        tracing::debug!(missing = ?missing, "structured output missing required keys");
        None
    }
}

fn missing_required(value: &Value, schema: &Value) -> Vec<String> {
    let Some(required) = schema.get("required").and_then(Value::as_array) else {
        return Vec::new();
    };
    let Some(obj) = value.as_object() else {
        return required.iter().filter_map(Value::as_str).map(str::to_string).collect();
    };
    required
        .iter()
        .filter_map(Value::as_str)
        .filter(|k| !obj.contains_key(*k))
        .map(str::to_string)
        .collect()
}

/// 由 schema 生成示例对象（占位值）
pub fn example_from_schema(schema: &Value) -> Value {
    match schema.get("type").and_then(Value::as_str) {
        Some("object") | None if schema.get("properties").is_some() => {
            let mut example = Map::new();
            if let Some(props) = schema.get("properties").and_then(Value::as_object) {
                for (key, prop) in props {
                    example.insert(key.clone(), example_from_schema(prop));
                }
            }
            Value::Object(example)
        }
        Some("string") => Value::String("string".into()),
        Some("integer") | Some("number") => Value::from(0),
        Some("boolean") => Value::Bool(false),
        Some("array") => Value::Array(Vec::new()),
        Some("object") => Value::Object(Map::new()),
        _ => Value::Null,
    }
}

/// 附加到任务提示中的格式说明
pub fn schema_instructions(schema: &Value) -> String {
    let name = schema.get("title").and_then(Value::as_str).unwrap_or("output");
    let pretty = serde_json::to_string_pretty(schema).unwrap_or_else(|_| schema.to_string());
    let example = serde_json::to_string_pretty(&example_from_schema(schema)).unwrap_or_default();
    format!(
        "Your final answer must be a single JSON object for `{name}` matching this JSON schema:\n{pretty}\n\nExample:\n{example}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_object_from_prose() {
        let text = "Here is the result:\n{\"title\": \"Test\", \"author\": \"John\"}\nThat's all.";
        assert_eq!(
            extract_json_from_text(text).unwrap(),
            "{\"title\": \"Test\", \"author\": \"John\"}"
        );
        assert_eq!(extract_json_from_text("no json here"), None);
    }

    #[test]
    fn test_extract_fenced_and_array() {
        let text = "Result:\n```json\n{\n  \"title\": \"Test\"\n}\n```\n";
        assert!(extract_json_from_text(text).unwrap().contains("\"title\": \"Test\""));
        let arr = "Here: [{\"title\": \"Test1\"}, {\"title\": \"Test2\"}]";
        assert!(extract_json_from_text(arr).unwrap().contains("Test1"));
    }

    #[test]
    fn test_clean_json_string() {
        assert_eq!(
            clean_json_string(r#"{"title": "Test", "content": "Test content",}"#),
            r#"{"title": "Test", "content": "Test content"}"#
        );
        assert_eq!(
            clean_json_string("{'title': 'Test', 'content': 'Test content'}"),
            r#"{"title": "Test", "content": "Test content"}"#
        );
        let cleaned = clean_json_string("{\n \"title\": \"Test\", // note\n \"url\": \"http://x\"\n}");
        assert!(!cleaned.contains("// note"));
        assert!(cleaned.contains("http://x"));
        assert_eq!(
            serde_json::from_str::<Value>(&cleaned).unwrap()["title"],
            "Test"
        );
    }

    #[test]
    fn test_structured_output_checks_required() {
        let schema = json!({
            "type": "object",
            "properties": {"title": {"type": "string"}, "published": {"type": "boolean"}},
            "required": ["title", "published"]
        });
        let ok = StructuredOutput::from_response("Done: {\"title\": \"A\", \"published\": true}", Some(&schema));
        assert_eq!(ok.output_format, OutputFormat::Json);
        assert_eq!(ok.get("title"), Some(&json!("A")));

        let missing = StructuredOutput::from_response("{\"title\": \"A\"}", Some(&schema));
        assert_eq!(missing.output_format, OutputFormat::Raw);
        assert!(missing.json.is_none());

        let plain = StructuredOutput::from_response("{\"title\": \"A\"}", None);
        assert_eq!(plain.output_format, OutputFormat::Raw);
    }

    #[test]
    fn test_example_from_schema() {
        let schema = json!({
            "title": "BlogPost",
            "type": "object",
            "properties": {"title": {"type": "string"}, "published": {"type": "boolean"}}
        });
        let example = example_from_schema(&schema);
        assert_eq!(example["published"], json!(false));
        let text = schema_instructions(&schema);
        assert!(text.contains("BlogPost") && text.contains("JSON"));
    }
}
