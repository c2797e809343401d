//! 任务事件流
//!
//! 执行器在后台任务中运行，通过无界通道按发出顺序推送 TaskUpdate；
//! 最后一个元素总是 Finished，携带成功结果或错误，消费方无需依赖 panic / 异常传播判断失败。

use std::pin::Pin;
use std::task::{Context, Poll};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::{Stream, StreamExt};

use crate::core::types::{AgentEvent, EventLevel};
use crate::core::AgentError;
use crate::execution::TaskOutcome;

pub const TASK_STARTED: &str = "task_started";
pub const PLAN_CREATED: &str = "plan_created";
pub const LLM_RESPONSE: &str = "llm_response";
pub const TOOL_CALL_STARTED: &str = "tool_call_started";
pub const STEP_COMPLETED: &str = "step_completed";
pub const TASK_COMPLETED: &str = "task_completed";
pub const TASK_FAILED: &str = "task_failed";

/// 事件流中的一项：普通事件，或携带最终结果的结束标记
#[derive(Debug)]
pub enum TaskUpdate {
    Event(AgentEvent),
    Finished(Result<TaskOutcome, AgentError>),
}

/// 发送端；无接收方时事件只写日志
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<TaskUpdate>>,
    task_id: String,
}

impl EventSink {
    pub fn channel(task_id: impl Into<String>) -> (Self, EventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Self {
            tx: Some(tx),
            task_id: task_id.into(),
        };
        (sink, EventStream::new(rx))
    }

    /// 丢弃事件（委派子任务、execute_many 使用）
    pub fn silent(task_id: impl Into<String>) -> Self {
        Self {
            tx: None,
            task_id: task_id.into(),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn emit(&self, event: AgentEvent) {
        let event = event.with("task_id", Value::String(self.task_id.clone()));
        match event.level {
            EventLevel::Error => tracing::warn!(task_id = %self.task_id, event_type = %event.event_type, "task event"),
            _ => tracing::debug!(task_id = %self.task_id, event_type = %event.event_type, "task event"),
        }
        if let Some(tx) = &self.tx {
            let _ = tx.send(TaskUpdate::Event(event));
        }
    }

    pub fn finish(&self, result: Result<TaskOutcome, AgentError>) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(TaskUpdate::Finished(result));
        }
    }
}

/// 惰性、有序、有限、不可重启的事件序列
pub struct EventStream {
    inner: UnboundedReceiverStream<TaskUpdate>,
    finished: bool,
}

impl EventStream {
    fn new(rx: mpsc::UnboundedReceiver<TaskUpdate>) -> Self {
        Self {
            inner: UnboundedReceiverStream::new(rx),
            finished: false,
        }
    }

    /// 读完整个流：返回全部事件与最终结果
    pub async fn collect_all(mut self) -> (Vec<AgentEvent>, Result<TaskOutcome, AgentError>) {
        let mut events = Vec::new();
        while let Some(update) = self.next().await {
            match update {
                TaskUpdate::Event(event) => events.push(event),
                TaskUpdate::Finished(result) => return (events, result),
            }
        }
        (
            events,
            Err(AgentError::Internal("task ended without a result".into())),
        )
    }

    /// 只关心最终结果
    pub async fn outcome(self) -> Result<TaskOutcome, AgentError> {
        self.collect_all().await.1
    }
}

impl Stream for EventStream {
    type Item = TaskUpdate;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        let polled = Pin::new(&mut self.inner).poll_next(cx);
        if let Poll::Ready(Some(TaskUpdate::Finished(_))) = &polled {
            self.finished = true;
        }
        polled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stream_ends_after_finished() {
        let (sink, stream) = EventSink::channel("t1");
        sink.emit(AgentEvent::new(TASK_STARTED));
        sink.finish(Err(AgentError::ShutdownRequested));
        // 结束之后的事件不会被看到
        sink.emit(AgentEvent::new(TASK_COMPLETED));
        drop(sink);

        let (events, result) = stream.collect_all().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].get("task_id"), Some(&Value::from("t1")));
        assert!(matches!(result, Err(AgentError::ShutdownRequested)));
    }

    #[tokio::test]
    async fn test_missing_result_is_an_error() {
        let (sink, stream) = EventSink::channel("t2");
        sink.emit(AgentEvent::new(TASK_STARTED));
        drop(sink);
        let (_, result) = stream.collect_all().await;
        assert!(matches!(result, Err(AgentError::Internal(_))));
    }
}
