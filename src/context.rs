//! 外部协作者接口：代码上下文检索与重新缩进
//!
//! 引擎只消费这两个接口，不实现嵌入索引，也不实现具体的缩进变换。

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 检索结果的粒度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextType {
    File,
    Function,
    Class,
    Snippet,
    Documentation,
}

/// 单条检索结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextItem {
    pub file_path: String,
    pub content: String,
    pub context_type: ContextType,
    pub relevance_score: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_line: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_line: Option<usize>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

/// 检索上限
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetrievalLimits {
    pub max_results: usize,
    pub min_relevance: Option<f32>,
}

impl Default for RetrievalLimits {
    fn default() -> Self {
        Self {
            max_results: 10,
            min_relevance: None,
        }
    }
}

/// 代码上下文检索（由嵌入方提供实现）
#[async_trait]
pub trait ContextRetriever: Send + Sync {
    async fn retrieve_context(
        &self,
        query: &str,
        limits: &RetrievalLimits,
    ) -> Result<Vec<ContextItem>, String>;
}

/// 应用编辑时调整新代码块的缩进，纯函数
pub trait Reindenter: Send + Sync {
    fn reindent(&self, old_block: &str, new_block: &str, full_file_text: &str, file_path: &Path) -> String;
}

/// 原样返回新代码块
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReindenter;

impl Reindenter for NoopReindenter {
    fn reindent(&self, _old_block: &str, new_block: &str, _full_file_text: &str, _file_path: &Path) -> String {
        new_block.to_string()
    }
}
