//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / parameters_schema / execute），由 ToolRegistry 按名注册与查找。
//! 注册表在启动时写入、运行中以读为主；enable / disable 只改禁用集合，不删除注册项，
//! 因此重新启用无需再次注册。调用统计用原子计数，并发派发不会丢失更新。

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::llm::ToolSpec;
use crate::tools::schema::empty_parameters;
use crate::tools::FunctionTool;

/// 工具风险级别，与确认级别配合决定是否需要人工确认
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// 执行前的安全检查结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SafetyCheck {
    pub check_type: String,
    pub passed: bool,
    pub message: String,
    pub severity: RiskLevel,
}

impl SafetyCheck {
    pub fn failed(check_type: &str, message: impl Into<String>, severity: RiskLevel) -> Self {
        Self {
            check_type: check_type.to_string(),
            passed: false,
            message: message.into(),
            severity,
        }
    }
}

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（模型调用时使用）
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认无参数
    fn parameters_schema(&self) -> Value {
        empty_parameters()
    }

    fn risk(&self) -> RiskLevel {
        RiskLevel::Low
    }

    /// 执行前检查参数；返回 Some 且 passed = false 时拒绝执行
    fn safety_check(&self, _args: &Value) -> Option<SafetyCheck> {
        None
    }

    /// 自带截止时间的工具（委派子任务、批处理）不受派发层的单次超时约束
    fn runs_own_deadline(&self) -> bool {
        false
    }

    /// 执行工具
    async fn execute(&self, args: Value) -> Result<Value, String>;

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// 单个工具的调用统计快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ToolStats {
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub total_duration_ms: u64,
}

impl ToolStats {
    pub fn average_duration_ms(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.total_duration_ms as f64 / self.calls as f64
        }
    }
}

#[derive(Debug, Default)]
struct StatsCell {
    calls: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    total_micros: AtomicU64,
}

impl StatsCell {
    fn record(&self, success: bool, elapsed: Duration) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        self.total_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ToolStats {
        ToolStats {
            calls: self.calls.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            total_duration_ms: self.total_micros.load(Ordering::Relaxed) / 1000,
        }
    }
}

#[derive(Clone)]
struct Registration {
    tool: Arc<dyn Tool>,
    stats: Arc<StatsCell>,
}

/// 按名查找的结果
pub(crate) enum Lookup {
    Found(Arc<dyn Tool>, StatsHandle),
    Disabled,
    NotFound,
}

/// 派发时用于记录统计
#[derive(Clone)]
pub(crate) struct StatsHandle(Arc<StatsCell>);

impl StatsHandle {
    pub(crate) fn record(&self, success: bool, elapsed: Duration) {
        self.0.record(success, elapsed);
    }
}

#[derive(Default)]
struct Inner {
    tools: HashMap<String, Registration>,
    /// 运行期禁用（含配置禁用）
    disabled: HashSet<String>,
    /// 配置禁用：注册时直接忽略
    config_disabled: HashSet<String>,
}

/// 工具注册表：可在并发派发间共享（Arc<ToolRegistry>）
#[derive(Default)]
pub struct ToolRegistry {
    inner: RwLock<Inner>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 带配置禁用列表的注册表
    pub fn with_disabled<I, S>(disabled: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let config_disabled: HashSet<String> = disabled.into_iter().map(Into::into).collect();
        Self {
            inner: RwLock::new(Inner {
                tools: HashMap::new(),
                disabled: config_disabled.clone(),
                config_disabled,
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// 注册工具；配置禁用的名称静默忽略，返回是否实际注册
    pub fn register(&self, tool: impl Tool + 'static) -> bool {
        self.register_arc(Arc::new(tool))
    }

    pub fn register_arc(&self, tool: Arc<dyn Tool>) -> bool {
        let name = tool.name().to_string();
        let mut inner = self.write();
        if inner.config_disabled.contains(&name) {
            tracing::debug!(tool = %name, "tool disabled by configuration, skipping registration");
            return false;
        }
        if inner.tools.contains_key(&name) {
            tracing::warn!(tool = %name, "tool already registered, replacing");
        }
        inner.tools.insert(
            name,
            Registration {
                tool,
                stats: Arc::new(StatsCell::default()),
            },
        );
        true
    }

    /// 可选工具：None 时记录警告并忽略
    pub fn register_optional<T: Tool + 'static>(&self, tool: Option<T>) -> bool {
        match tool {
            Some(tool) => self.register(tool),
            None => {
                tracing::warn!("attempted to register an absent tool, ignoring");
                false
            }
        }
    }

    /// 注册普通函数（同步），自动包装为 FunctionTool
    pub fn register_function<F>(&self, name: &str, description: &str, f: F) -> bool
    where
        F: Fn(Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.register(FunctionTool::sync(name, description, f))
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.write().tools.remove(name).is_some()
    }

    pub fn enable(&self, name: &str) -> bool {
        let mut inner = self.write();
        inner.config_disabled.remove(name);
        let was_disabled = inner.disabled.remove(name);
        if was_disabled {
            tracing::info!(tool = %name, "tool enabled");
        }
        was_disabled
    }

    pub fn disable(&self, name: &str) -> bool {
        let mut inner = self.write();
        let newly = inner.disabled.insert(name.to_string());
        if newly {
            tracing::info!(tool = %name, "tool disabled");
        }
        newly
    }

    pub fn is_disabled(&self, name: &str) -> bool {
        self.read().disabled.contains(name)
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.read().tools.contains_key(name)
    }

    pub fn disabled_tools(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().disabled.iter().cloned().collect();
        names.sort();
        names
    }

    /// 可派发（已注册且未禁用）的工具名，按名称排序
    pub fn list(&self) -> Vec<String> {
        let inner = self.read();
        let mut names: Vec<String> = inner
            .tools
            .keys()
            .filter(|n| !inner.disabled.contains(*n))
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// 获取工具（包括已禁用的）
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.read().tools.get(name).map(|r| r.tool.clone())
    }

    pub(crate) fn lookup(&self, name: &str) -> Lookup {
        let inner = self.read();
        match inner.tools.get(name) {
            None => Lookup::NotFound,
            Some(_) if inner.disabled.contains(name) => Lookup::Disabled,
            Some(r) => Lookup::Found(r.tool.clone(), StatsHandle(r.stats.clone())),
        }
    }

    /// 已启用工具的描述，供模型请求使用；exclude 中的名称不导出
    pub fn specs(&self, exclude: &[String]) -> Vec<ToolSpec> {
        let inner = self.read();
        let mut specs: Vec<ToolSpec> = inner
            .tools
            .iter()
            .filter(|(n, _)| !inner.disabled.contains(*n) && !exclude.contains(*n))
            .map(|(_, r)| r.tool.spec())
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    pub fn stats(&self, name: &str) -> Option<ToolStats> {
        self.read().tools.get(name).map(|r| r.stats.snapshot())
    }

    pub fn all_stats(&self) -> HashMap<String, ToolStats> {
        self.read()
            .tools
            .iter()
            .map(|(n, r)| (n.clone(), r.stats.snapshot()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echo the input"
        }

        async fn execute(&self, args: Value) -> Result<Value, String> {
            Ok(args)
        }
    }

    #[test]
    fn test_register_and_list() {
        let registry = ToolRegistry::new();
        assert!(registry.register(Echo));
        registry.register_function("add", "Add two numbers", |args| {
            let a = args["a"].as_i64().unwrap_or(0);
            let b = args["b"].as_i64().unwrap_or(0);
            Ok(json!(a + b))
        });
        assert_eq!(registry.list(), vec!["add".to_string(), "echo".to_string()]);
        assert_eq!(registry.specs(&[]).len(), 2);
        assert_eq!(registry.specs(&["echo".to_string()]).len(), 1);
    }

    #[test]
    fn test_config_disabled_registration_is_noop() {
        let registry = ToolRegistry::with_disabled(["echo"]);
        assert!(!registry.register(Echo));
        assert!(!registry.is_registered("echo"));
        assert!(registry.is_disabled("echo"));
        assert!(registry.list().is_empty());
    }

    #[test]
    fn test_register_optional_none_is_noop() {
        let registry = ToolRegistry::new();
        assert!(!registry.register_optional::<Echo>(None));
        assert!(registry.list().is_empty());
        assert!(registry.register_optional(Some(Echo)));
    }

    #[test]
    fn test_disable_keeps_registration() {
        let registry = ToolRegistry::new();
        registry.register(Echo);
        assert!(registry.disable("echo"));
        assert!(registry.is_registered("echo"));
        assert!(registry.list().is_empty());
        assert!(registry.specs(&[]).is_empty());
        assert!(matches!(registry.lookup("echo"), Lookup::Disabled));
        assert!(registry.enable("echo"));
        assert!(matches!(registry.lookup("echo"), Lookup::Found(..)));
        assert!(matches!(registry.lookup("nope"), Lookup::NotFound));
    }

    #[test]
    fn test_stats_are_atomic_across_threads() {
        let registry = Arc::new(ToolRegistry::new());
        registry.register(Echo);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    if let Lookup::Found(_, stats) = registry.lookup("echo") {
                        for _ in 0..100 {
                            stats.record(i % 2 == 0, Duration::from_micros(1000));
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let stats = registry.stats("echo").unwrap();
        assert_eq!(stats.calls, 800);
        assert_eq!(stats.successes, 400);
        assert_eq!(stats.failures, 400);
        assert_eq!(stats.total_duration_ms, 800);
    }
}
