//! LLM 层：能力表、消息折叠、请求构造、响应解析、重试，以及传输实现（HTTP / 脚本化 Mock）

pub mod client;
pub mod http;
pub mod message;
pub mod mock;
pub mod provider;
pub mod request;
pub mod response;
pub mod retry;
pub mod traits;

pub use client::LlmClient;
pub use http::HttpTransport;
pub use message::{ChatMessage, MessageShaping, Role, ToolCall};
pub use mock::{ScriptedReply, ScriptedTransport};
pub use provider::{LlmProvider, ProviderCapabilities, ToolFormat};
pub use request::{CompletionOptions, CompletionRequest, RequestBuilder, ToolSpec};
pub use response::{extract_tool_calls, CompletionResponse, TokenUsage};
pub use retry::{classify, classify_message, is_rate_limit_error, FailureClass, RetryPolicy};
pub use traits::{ChunkStream, CompletionTransport, LlmError};
