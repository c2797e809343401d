//! 模型客户端
//!
//! 单一入口 `complete(messages, options) -> CompletionResponse`（以及流式变体），屏蔽后端差异：
//! 消息折叠 → 按能力表构造请求 → 经传输层发送 → 解析工具调用 → 按失败分类退避重试。
//! 重试用尽后返回 success = false 的响应而不是错误，由调用方决定如何处理。
//! 构造后只读，可在并发任务间共享。

use std::sync::Arc;

use crate::config::{ExecutionConfig, LlmSection};
use crate::llm::retry::{classify, FailureClass, RetryPolicy};
use crate::llm::{
    ChatMessage, ChunkStream, CompletionOptions, CompletionRequest, CompletionResponse,
    CompletionTransport, LlmError, LlmProvider, MessageShaping, RequestBuilder,
};

pub struct LlmClient {
    transport: Arc<dyn CompletionTransport>,
    builder: RequestBuilder,
    shaping: MessageShaping,
    retry: RetryPolicy,
    system_prompt: Option<String>,
}

impl LlmClient {
    pub fn new(
        llm: &LlmSection,
        execution: &ExecutionConfig,
        transport: Arc<dyn CompletionTransport>,
    ) -> Self {
        Self {
            transport,
            builder: RequestBuilder::from_config(llm),
            shaping: MessageShaping {
                disable_system_prompt: llm.disable_system_prompt,
                disable_tool_role: llm.disable_tool_role,
            },
            retry: RetryPolicy::from_config(execution),
            system_prompt: llm.system_prompt.clone(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn provider(&self) -> LlmProvider {
        self.builder.provider()
    }

    pub fn model(&self) -> &str {
        self.builder.model()
    }

    pub fn transport_name(&self) -> &str {
        self.transport.name()
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.system_prompt.as_deref()
    }

    pub fn shaping(&self) -> MessageShaping {
        self.shaping
    }

    /// 组装消息；未显式给出 system 时使用配置中的 system_prompt
    pub fn build_messages(
        &self,
        user: &str,
        system: Option<&str>,
        history: &[ChatMessage],
    ) -> Vec<ChatMessage> {
        self.shaping
            .build_messages(user, system.or(self.system_prompt.as_deref()), history)
    }

    pub fn prepare_messages(&self, messages: &[ChatMessage]) -> Vec<ChatMessage> {
        self.shaping.prepare_messages(messages)
    }

    pub fn build_request(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> CompletionRequest {
        self.builder.build(self.prepare_messages(messages), options)
    }

    /// 非流式完成（含重试）
    pub async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> CompletionResponse {
        let request = self.build_request(messages, options);
        let mut failures = 0u32;
        loop {
            match self.transport.send(&request).await {
                Ok(raw) => {
                    let response = CompletionResponse::from_raw(&raw);
                    tracing::debug!(
                        provider = %self.provider(),
                        tool_calls = response.tool_calls.len(),
                        finish_reason = ?response.finish_reason,
                        total_tokens = response.usage.total_tokens,
                        "completion received"
                    );
                    return response;
                }
                Err(e) => {
                    failures += 1;
                    match self.next_delay(&e, failures) {
                        Some(delay) => tokio::time::sleep(delay).await,
                        None => return CompletionResponse::failed(e.to_string()),
                    }
                }
            }
        }
    }

    /// 单条 prompt 的便捷调用
    pub async fn complete_prompt(&self, user: &str, system: Option<&str>) -> CompletionResponse {
        let messages = self.build_messages(user, system, &[]);
        self.complete(&messages, &CompletionOptions::default()).await
    }

    /// 流式完成；建立连接阶段与 complete 使用同一重试策略
    pub async fn complete_stream(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<ChunkStream, LlmError> {
        let options = CompletionOptions {
            stream: true,
            ..options.clone()
        };
        let request = self.build_request(messages, &options);
        let mut failures = 0u32;
        loop {
            match self.transport.stream(&request).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    failures += 1;
                    match self.next_delay(&e, failures) {
                        Some(delay) => tokio::time::sleep(delay).await,
                        None => return Err(e),
                    }
                }
            }
        }
    }

    fn next_delay(&self, error: &LlmError, failures: u32) -> Option<std::time::Duration> {
        let class = classify(error);
        let delay = self.retry.delay_for(class, failures);
        match (&delay, class) {
            (Some(d), FailureClass::RateLimit) => tracing::warn!(
                attempt = failures,
                max_attempts = self.retry.max_attempts,
                wait_secs = d.as_secs_f64(),
                error = %error,
                "rate limited, backing off"
            ),
            (Some(d), _) => tracing::warn!(
                attempt = failures,
                max_attempts = self.retry.max_attempts,
                wait_secs = d.as_secs_f64(),
                error = %error,
                "completion failed, retrying"
            ),
            (None, FailureClass::Fatal) => {
                tracing::error!(error = %error, "completion failed with non-retryable error")
            }
            (None, _) => tracing::error!(
                attempts = failures,
                error = %error,
                "completion failed, retries exhausted"
            ),
        }
        delay
    }
}
