//! 并行度控制
//!
//! 相互独立的任务（并发对话、批处理的各个委派组）通过 Semaphore 共享同一并行上限；
//! 单个任务内部的工具调用仍然串行。

use std::future::Future;
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::core::AgentError;

/// 任务调度器：克隆后共享同一组许可
#[derive(Clone, Debug)]
pub struct TaskScheduler {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

impl TaskScheduler {
    pub fn new(max_parallel_tasks: usize) -> Self {
        let limit = max_parallel_tasks.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// 获取执行许可
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, AgentError> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AgentError::Internal("task scheduler closed".into()))
    }

    /// 并发运行一组 future，同时运行的数量不超过上限；结果按输入顺序返回
    pub async fn run_all<F, T>(&self, futures: Vec<F>) -> Vec<Result<T, AgentError>>
    where
        F: Future<Output = T>,
    {
        let bounded = futures.into_iter().map(|fut| async move {
            let _permit = self.acquire().await?;
            Ok(fut.await)
        });
        join_all(bounded).await
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(4)
    }
}
