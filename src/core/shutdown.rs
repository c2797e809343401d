//! 协作式关闭
//!
//! ShutdownManager 由调用方创建并注入执行器（不是全局单例），多个执行器可共享同一实例，
//! 也可各自持有互不影响。执行器在迭代边界轮询 `is_shutdown`，并在等待模型（含规划）时监听 token，
//! 不会中断正在执行的工具。

use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

/// 关闭信号管理器
#[derive(Clone)]
pub struct ShutdownManager {
    shutdown_token: CancellationToken,
    reason: Arc<Mutex<Option<ShutdownReason>>>,
}

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
    /// 由嵌入方主动请求
    Requested(String),
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            shutdown_token: CancellationToken::new(),
            reason: Arc::new(Mutex::new(None)),
        }
    }

    /// 获取关闭 token（用于 select! 等待）
    pub fn token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// 触发关闭；重复调用只记录第一次的原因
    pub fn shutdown(&self, reason: ShutdownReason) {
        if let Ok(mut slot) = self.reason.lock() {
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.shutdown_token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.lock().ok().and_then(|r| r.clone())
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(&self) {
        let manager = self.clone();
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, requesting cooperative shutdown");
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = self.clone();
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, requesting cooperative shutdown");
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_manager_new() {
        let manager = ShutdownManager::new();
        assert!(!manager.is_shutdown());
        assert!(manager.reason().is_none());
    }

    #[test]
    fn test_clones_share_state() {
        let manager = ShutdownManager::new();
        let other = manager.clone();
        let token = manager.token();
        other.shutdown(ShutdownReason::Requested("test".into()));
        assert!(manager.is_shutdown());
        assert!(token.is_cancelled());
        assert_eq!(manager.reason(), Some(ShutdownReason::Requested("test".into())));
    }

    #[test]
    fn test_independent_managers_do_not_interfere() {
        let a = ShutdownManager::new();
        let b = ShutdownManager::new();
        a.shutdown(ShutdownReason::Signal);
        assert!(a.is_shutdown());
        assert!(!b.is_shutdown());
    }

    #[test]
    fn test_first_reason_wins() {
        let manager = ShutdownManager::new();
        manager.shutdown(ShutdownReason::UserInitiated);
        manager.shutdown(ShutdownReason::Signal);
        assert_eq!(manager.reason(), Some(ShutdownReason::UserInitiated));
    }
}
