//! 失败分类与退避策略
//!
//! - 限流：60 × 2^(n−1) 秒（60, 120, 240, ...）
//! - 其他可重试错误：retry_delay × 2^(n−1)
//! - 致命错误（鉴权、非法请求等）：不重试
//!
//! n 为第几次失败；最后一次尝试失败后不再等待。

use std::time::Duration;

use crate::config::ExecutionConfig;
use crate::llm::LlmError;

const RATE_LIMIT_BASE_SECS: u64 = 60;

const RATE_LIMIT_PATTERNS: &[&str] = &[
    "rate limit",
    "rate_limit",
    "ratelimit",
    "429",
    "quota exceeded",
    "exceeded your current quota",
    "throttled",
    "throttling",
    "too many requests",
    "check your plan and billing",
    "requests per minute",
    "tokens per minute",
];

const FATAL_PATTERNS: &[&str] = &[
    "invalid api key",
    "incorrect api key",
    "unauthorized",
    "authentication",
    "permission denied",
    "forbidden",
    "invalid request",
    "invalid model",
    "model not found",
    "does not exist",
    "missing api key",
    "context length",
    "context_length_exceeded",
];

/// 失败分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    RateLimit,
    Transient,
    Fatal,
}

/// 限流判定：纯函数，大小写不敏感
pub fn is_rate_limit_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    RATE_LIMIT_PATTERNS.iter().any(|p| lower.contains(p))
}

/// 按错误文本分类；既非限流也非致命的错误视为可重试
pub fn classify_message(message: &str) -> FailureClass {
    if is_rate_limit_error(message) {
        return FailureClass::RateLimit;
    }
    let lower = message.to_lowercase();
    if FATAL_PATTERNS.iter().any(|p| lower.contains(p)) {
        FailureClass::Fatal
    } else {
        FailureClass::Transient
    }
}

/// 结合 HTTP 状态码分类；文本中的限流特征优先
pub fn classify(error: &LlmError) -> FailureClass {
    let message = error.to_string();
    if is_rate_limit_error(&message) {
        return FailureClass::RateLimit;
    }
    match error {
        LlmError::Http { status: 429, .. } => FailureClass::RateLimit,
        LlmError::Http { status, .. } if *status == 408 || *status >= 500 => FailureClass::Transient,
        LlmError::Http { .. } | LlmError::MissingApiKey(_) => FailureClass::Fatal,
        LlmError::Network(_) | LlmError::Timeout(_) => FailureClass::Transient,
        LlmError::InvalidResponse(_) | LlmError::Other(_) => classify_message(&message),
    }
}

/// 重试策略：max_attempts 为总尝试次数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, retry_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            retry_delay,
        }
    }

    pub fn from_config(cfg: &ExecutionConfig) -> Self {
        Self::new(
            cfg.max_retry_attempts,
            Duration::from_secs_f64(cfg.retry_delay.max(0.0)),
        )
    }

    /// 第 failure 次（从 1 开始）失败后的等待时间；不可重试或已用尽时返回 None
    pub fn delay_for(&self, class: FailureClass, failure: u32) -> Option<Duration> {
        if class == FailureClass::Fatal || failure == 0 || failure >= self.max_attempts {
            return None;
        }
        let factor = 1u32 << (failure - 1).min(16);
        Some(match class {
            FailureClass::RateLimit => Duration::from_secs(RATE_LIMIT_BASE_SECS) * factor,
            _ => self.retry_delay * factor,
        })
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}
