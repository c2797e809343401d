//! 任务计划：有序步骤 + 依赖 DAG
//!
//! 构建时用邻接表与入度表（Kahn 算法）校验依赖：未知依赖、重复 id、环都会被拒绝。
//! 计划状态由步骤状态推导；计划进入终态后不再接受任何步骤变更。

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::types::{TaskStatus, TaskType};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlanError {
    #[error("plan has no steps")]
    Empty,

    #[error("duplicate step id '{0}'")]
    DuplicateStep(String),

    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("cyclic dependency among steps: {}", .0.join(", "))]
    CyclicDependency(Vec<String>),

    #[error("step '{0}' not found")]
    StepNotFound(String),

    #[error("step '{step}' cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        step: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("step '{0}' has unfinished dependencies")]
    DependenciesPending(String),

    #[error("plan is already {0:?}")]
    Finished(TaskStatus),
}

/// 计划中的一个步骤
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub step_type: TaskType,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub required_tools: Vec<String>,
    /// 同一操作独立作用于一组条目（可分组委派）
    #[serde(default)]
    pub is_list_processing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// 失败是否可恢复；可恢复的失败不会让整个计划失败
    #[serde(default)]
    pub recoverable: bool,
}

impl PlanStep {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            step_type: TaskType::Simple,
            status: TaskStatus::Pending,
            dependencies: Vec::new(),
            required_tools: Vec::new(),
            is_list_processing: false,
            result: None,
            error: None,
            recoverable: false,
        }
    }

    pub fn depends_on(mut self, deps: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn with_tools(mut self, tools: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.required_tools.extend(tools.into_iter().map(Into::into));
        self
    }

    pub fn with_type(mut self, step_type: TaskType) -> Self {
        self.step_type = step_type;
        self
    }

    pub fn list_processing(mut self, flag: bool) -> Self {
        self.is_list_processing = flag;
        self
    }
}

/// 任务计划
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPlan {
    pub id: String,
    pub description: String,
    pub steps: Vec<PlanStep>,
    pub created_at: DateTime<Utc>,
}

impl TaskPlan {
    /// 构建并校验计划
    pub fn new(description: impl Into<String>, steps: Vec<PlanStep>) -> Result<Self, PlanError> {
        let plan = Self {
            id: uuid::Uuid::new_v4().to_string(),
            description: description.into(),
            steps,
            created_at: Utc::now(),
        };
        plan.execution_order()?;
        Ok(plan)
    }

    /// 依赖满足的拓扑顺序；同层保持原始顺序
    pub fn execution_order(&self) -> Result<Vec<&PlanStep>, PlanError> {
        if self.steps.is_empty() {
            return Err(PlanError::Empty);
        }
        let mut index: HashMap<&str, usize> = HashMap::new();
        for (i, step) in self.steps.iter().enumerate() {
            if index.insert(step.id.as_str(), i).is_some() {
                return Err(PlanError::DuplicateStep(step.id.clone()));
            }
        }

        let mut in_degree = vec![0usize; self.steps.len()];
        let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); self.steps.len()];
        for (i, step) in self.steps.iter().enumerate() {
            let unique: HashSet<&str> = step.dependencies.iter().map(String::as_str).collect();
            for dep in unique {
                let &d = index.get(dep).ok_or_else(|| PlanError::UnknownDependency {
                    step: step.id.clone(),
                    dependency: dep.to_string(),
                })?;
                adjacency[d].push(i);
                in_degree[i] += 1;
            }
        }

        let mut queue: VecDeque<usize> = (0..self.steps.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(self.steps.len());
        while let Some(i) = queue.pop_front() {
            order.push(i);
            let mut next = adjacency[i].clone();
            next.sort_unstable();
            for j in next {
                in_degree[j] -= 1;
                if in_degree[j] == 0 {
                    queue.push_back(j);
                }
            }
        }

        if order.len() != self.steps.len() {
            let cyclic = (0..self.steps.len())
                .filter(|i| in_degree[*i] > 0)
                .map(|i| self.steps[i].id.clone())
                .collect();
            return Err(PlanError::CyclicDependency(cyclic));
        }
        Ok(order.into_iter().map(|i| &self.steps[i]).collect())
    }

    /// 由步骤状态推导的计划状态
    pub fn status(&self) -> TaskStatus {
        let failed = self
            .steps
            .iter()
            .any(|s| s.status == TaskStatus::Failed && !s.recoverable);
        if failed {
            return TaskStatus::Failed;
        }
        if !self.steps.is_empty() && self.steps.iter().all(|s| s.status == TaskStatus::Completed) {
            return TaskStatus::Completed;
        }
        if self.steps.iter().any(|s| s.status != TaskStatus::Pending) {
            return TaskStatus::InProgress;
        }
        TaskStatus::Pending
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn step(&self, id: &str) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn has_list_processing(&self) -> bool {
        self.steps.iter().any(|s| s.is_list_processing)
    }

    /// 依赖全部完成且自身仍为 pending 的步骤
    pub fn ready_steps(&self) -> Vec<&PlanStep> {
        self.steps
            .iter()
            .filter(|s| s.status == TaskStatus::Pending && self.dependencies_done(s))
            .collect()
    }

    fn dependencies_done(&self, step: &PlanStep) -> bool {
        step.dependencies.iter().all(|d| {
            self.step(d)
                .map(|dep| dep.status == TaskStatus::Completed)
                .unwrap_or(false)
        })
    }

    fn step_mut(&mut self, id: &str) -> Result<&mut PlanStep, PlanError> {
        let status = self.status();
        if status.is_terminal() {
            return Err(PlanError::Finished(status));
        }
        self.steps
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| PlanError::StepNotFound(id.to_string()))
    }

    fn transition(
        &mut self,
        id: &str,
        from: TaskStatus,
        to: TaskStatus,
    ) -> Result<&mut PlanStep, PlanError> {
        let step = self.step_mut(id)?;
        if step.status != from {
            return Err(PlanError::InvalidTransition {
                step: id.to_string(),
                from: step.status,
                to,
            });
        }
        step.status = to;
        Ok(step)
    }

    /// pending -> in_progress；依赖必须全部完成
    pub fn start_step(&mut self, id: &str) -> Result<(), PlanError> {
        let ready = self
            .step(id)
            .map(|s| self.dependencies_done(s))
            .ok_or_else(|| PlanError::StepNotFound(id.to_string()))?;
        if !ready {
            return Err(PlanError::DependenciesPending(id.to_string()));
        }
        self.transition(id, TaskStatus::Pending, TaskStatus::InProgress)?;
        Ok(())
    }

    /// in_progress -> completed
    pub fn complete_step(&mut self, id: &str, result: impl Into<String>) -> Result<(), PlanError> {
        let step = self.transition(id, TaskStatus::InProgress, TaskStatus::Completed)?;
        step.result = Some(result.into());
        step.error = None;
        Ok(())
    }

    /// in_progress -> failed；recoverable 为 true 时计划不因此失败
    pub fn fail_step(
        &mut self,
        id: &str,
        error: impl Into<String>,
        recoverable: bool,
    ) -> Result<(), PlanError> {
        let step = self.transition(id, TaskStatus::InProgress, TaskStatus::Failed)?;
        step.error = Some(error.into());
        step.recoverable = recoverable;
        Ok(())
    }

    /// 可恢复的 failed -> pending
    pub fn retry_step(&mut self, id: &str) -> Result<(), PlanError> {
        let step = self.transition(id, TaskStatus::Failed, TaskStatus::Pending)?;
        step.error = None;
        step.recoverable = false;
        Ok(())
    }
}
