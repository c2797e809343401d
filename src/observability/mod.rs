//! 可观测性：tracing 订阅器初始化
//!
//! 默认级别取自配置的 `logging_level`；设置了 `RUST_LOG` 时以环境变量为准。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 构造过滤器：RUST_LOG 优先，其次 level，非法取值回落到 info
pub fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// 安装全局订阅器（输出到 stderr）；重复调用时静默忽略
pub fn init(level: &str) {
    let _ = tracing_subscriber::registry()
        .with(filter(level))
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init();
}
