//! semantic_search：通过外部 ContextRetriever 做语义检索
//!
//! 仅在嵌入方提供检索器时注册。

use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::context::{ContextRetriever, RetrievalLimits};
use crate::tools::schema::{parameters_for, parse_args};
use crate::tools::Tool;

#[derive(Deserialize, JsonSchema)]
struct SemanticSearchArgs {
    /// 自然语言查询
    query: String,
    /// 最多返回条数
    max_results: Option<usize>,
    /// 相关度下限（0~1）
    min_relevance: Option<f32>,
}

pub struct SemanticSearchTool {
    retriever: Arc<dyn ContextRetriever>,
}

impl SemanticSearchTool {
    pub fn new(retriever: Arc<dyn ContextRetriever>) -> Self {
        Self { retriever }
    }
}

#[async_trait]
impl Tool for SemanticSearchTool {
    fn name(&self) -> &str {
        "semantic_search"
    }

    fn description(&self) -> &str {
        "Search the project semantically with a natural-language query. Returns relevant code snippets with file paths and line ranges."
    }

    fn parameters_schema(&self) -> Value {
        parameters_for::<SemanticSearchArgs>()
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let args: SemanticSearchArgs = parse_args(self.name(), args)?;
        let limits = RetrievalLimits {
            max_results: args.max_results.unwrap_or(RetrievalLimits::default().max_results),
            min_relevance: args.min_relevance,
        };
        let items = self.retriever.retrieve_context(&args.query, &limits).await?;
        tracing::info!(query = %args.query, found = items.len(), "semantic_search");
        Ok(json!({
            "query": args.query,
            "count": items.len(),
            "results": items,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextItem, ContextType};

    struct Fixed;

    #[async_trait]
    impl ContextRetriever for Fixed {
        async fn retrieve_context(
            &self,
            query: &str,
            limits: &RetrievalLimits,
        ) -> Result<Vec<ContextItem>, String> {
            Ok((0..limits.max_results)
                .map(|i| ContextItem {
                    file_path: format!("src/{i}.rs"),
                    content: query.to_string(),
                    context_type: ContextType::Snippet,
                    relevance_score: 0.9,
                    start_line: Some(1),
                    end_line: Some(3),
                    metadata: Default::default(),
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn test_semantic_search_passes_limits() {
        let tool = SemanticSearchTool::new(Arc::new(Fixed));
        let out = tool
            .execute(json!({"query": "parse config", "max_results": 2}))
            .await
            .unwrap();
        assert_eq!(out["count"], 2);
        assert_eq!(out["results"][1]["file_path"], "src/1.rs");
        assert_eq!(out["results"][0]["context_type"], "snippet");
    }
}
