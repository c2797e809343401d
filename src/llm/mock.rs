//! 脚本化传输（用于测试，无需 API）
//!
//! 按顺序返回预先编排的响应或错误，可为每条响应设置延迟；也可用闭包按请求内容决定响应。
//! 记录收到的每个请求，便于断言请求形态。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::llm::{CompletionRequest, CompletionTransport, LlmError};

/// 一条预设响应
#[derive(Debug, Clone)]
pub struct ScriptedReply {
    delay: Option<Duration>,
    result: Result<Value, LlmError>,
}

impl ScriptedReply {
    pub fn raw(value: Value) -> Self {
        Self {
            delay: None,
            result: Ok(value),
        }
    }

    /// 正常结束的文本回复
    pub fn text(content: impl Into<String>) -> Self {
        Self::with_finish(content, "stop")
    }

    /// 被截断的回复（模型未结束）
    pub fn truncated(content: impl Into<String>) -> Self {
        Self::with_finish(content, "length")
    }

    fn with_finish(content: impl Into<String>, finish: &str) -> Self {
        Self::raw(json!({
            "model": "scripted",
            "choices": [{
                "message": { "role": "assistant", "content": content.into() },
                "finish_reason": finish
            }],
            "usage": { "prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2 }
        }))
    }

    /// OpenAI 形态的工具调用（arguments 序列化为字符串）
    pub fn tool_calls(calls: &[(&str, &str, Value)]) -> Self {
        let calls: Vec<Value> = calls
            .iter()
            .map(|(id, name, args)| {
                json!({
                    "id": id,
                    "type": "function",
                    "function": { "name": name, "arguments": args.to_string() }
                })
            })
            .collect();
        Self::raw(json!({
            "model": "scripted",
            "choices": [{
                "message": { "role": "assistant", "content": null, "tool_calls": calls },
                "finish_reason": "tool_calls"
            }],
            "usage": { "prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2 }
        }))
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            delay: None,
            result: Err(LlmError::Other(message.into())),
        }
    }

    pub fn http_error(status: u16, message: impl Into<String>) -> Self {
        Self {
            delay: None,
            result: Err(LlmError::Http {
                status,
                message: message.into(),
            }),
        }
    }

    /// 返回前等待
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

type Responder = Box<dyn Fn(&CompletionRequest) -> ScriptedReply + Send + Sync>;

/// 脚本化传输
pub struct ScriptedTransport {
    replies: Mutex<VecDeque<ScriptedReply>>,
    fallback: Option<ScriptedReply>,
    responder: Option<Responder>,
    requests: Mutex<Vec<CompletionRequest>>,
    calls: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new(replies: Vec<ScriptedReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            fallback: None,
            responder: None,
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// 始终返回同一响应
    pub fn repeating(reply: ScriptedReply) -> Self {
        Self::new(Vec::new()).with_fallback(reply)
    }

    /// 按请求内容生成响应（并发子任务共享一个传输时使用）
    pub fn from_fn<F>(responder: F) -> Self
    where
        F: Fn(&CompletionRequest) -> ScriptedReply + Send + Sync + 'static,
    {
        Self {
            responder: Some(Box::new(responder)),
            ..Self::new(Vec::new())
        }
    }

    /// 脚本耗尽后使用的响应
    pub fn with_fallback(mut self, reply: ScriptedReply) -> Self {
        self.fallback = Some(reply);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    fn next_reply(&self, request: &CompletionRequest) -> ScriptedReply {
        if let Some(responder) = &self.responder {
            return responder(request);
        }
        let queued = self.replies.lock().ok().and_then(|mut q| q.pop_front());
        queued
            .or_else(|| self.fallback.clone())
            .unwrap_or_else(|| ScriptedReply::http_error(400, "scripted transport exhausted"))
    }
}

#[async_trait]
impl CompletionTransport for ScriptedTransport {
    async fn send(&self, request: &CompletionRequest) -> Result<Value, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        let reply = self.next_reply(request);
        if let Some(delay) = reply.delay {
            tokio::time::sleep(delay).await;
        }
        reply.result
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
