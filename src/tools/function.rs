//! 函数工具：把普通闭包（同步或异步）包装为 Tool
//!
//! 注册时完成适配，派发时不再区分两种形态。

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use serde_json::Value;

use crate::tools::schema::empty_parameters;
use crate::tools::{RiskLevel, Tool};

type SyncHandler = Box<dyn Fn(Value) -> Result<Value, String> + Send + Sync>;
type AsyncHandler =
    Box<dyn Fn(Value) -> Pin<Box<dyn Future<Output = Result<Value, String>> + Send>> + Send + Sync>;

enum Handler {
    Sync(SyncHandler),
    Async(AsyncHandler),
}

pub struct FunctionTool {
    name: String,
    description: String,
    parameters: Value,
    risk: RiskLevel,
    handler: Handler,
}

impl FunctionTool {
    pub fn sync<F>(name: &str, description: &str, f: F) -> Self
    where
        F: Fn(Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        Self::with_handler(name, description, Handler::Sync(Box::new(f)))
    }

    pub fn from_async<F, Fut>(name: &str, description: &str, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        Self::with_handler(
            name,
            description,
            Handler::Async(Box::new(move |args| Box::pin(f(args)))),
        )
    }

    fn with_handler(name: &str, description: &str, handler: Handler) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            parameters: empty_parameters(),
            risk: RiskLevel::Low,
            handler,
        }
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_risk(mut self, risk: RiskLevel) -> Self {
        self.risk = risk;
        self
    }
}

#[async_trait]
impl Tool for FunctionTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        self.parameters.clone()
    }

    fn risk(&self) -> RiskLevel {
        self.risk
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        match &self.handler {
            Handler::Sync(f) => f(args),
            Handler::Async(f) => f(args).await,
        }
    }
}
