//! 传输适配器抽象
//!
//! LlmClient 不直接发网络请求，而是经由 CompletionTransport：HTTP 实现负责线格式与鉴权，
//! 测试使用脚本化实现。传输层返回归一化后的 JSON 响应，解析与重试由 LlmClient 负责。

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{stream, Stream};
use serde_json::Value;
use thiserror::Error;

use crate::llm::{CompletionRequest, CompletionResponse};

/// 流式内容块
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

/// 传输层错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timeout: {0}")]
    Timeout(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Missing API key for provider {0}")]
    MissingApiKey(String),

    #[error("{0}")]
    Other(String),
}

#[async_trait]
pub trait CompletionTransport: Send + Sync {
    /// 发送一次非流式请求，返回归一化响应
    async fn send(&self, request: &CompletionRequest) -> Result<Value, LlmError>;

    /// 建立流式请求；默认退化为单块
    async fn stream(&self, request: &CompletionRequest) -> Result<ChunkStream, LlmError> {
        let raw = self.send(request).await?;
        let content = CompletionResponse::from_raw(&raw).content;
        Ok(Box::pin(stream::iter(vec![Ok(content)])))
    }

    fn name(&self) -> &str;
}
