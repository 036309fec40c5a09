use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use orchestrator_core::{OrchestratorError, OrchestratorResult};
use orchestrator_domain::entities::{Task, TaskStatus};

/// 各状态任务数量汇总
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskCounts {
    pub total: usize,
    pub pending: usize,
    pub assigned: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

/// 失败处理结论：重新排队或终态失败
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Requeued { retry_count: u32 },
    Exhausted,
}

/// 任务登记表，Master派发前唯一的事实来源
///
/// 所有状态变更都在这里校验合法转换，非法转换立即报错而不是静默纠正。
/// 注册表内部串行访问，派发循环、结果处理、存活监控并发读写都经由此处。
pub struct TaskRegistry {
    inner: RwLock<TaskTable>,
}

struct TaskTable {
    tasks: HashMap<String, Task>,
    next_seq: u64,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(TaskTable {
                tasks: HashMap::new(),
                next_seq: 0,
            }),
        }
    }

    /// 提交新任务，进入PENDING状态
    ///
    /// 提交时不校验任务类型是否有节点支持：允许任务先于可执行节点排队，
    /// 能力匹配在派发时进行。
    pub async fn submit(
        &self,
        task_type: String,
        parameters: serde_json::Value,
        priority: i32,
        max_retries: u32,
    ) -> Task {
        let mut table = self.inner.write().await;
        let seq = table.next_seq;
        table.next_seq += 1;

        let task = Task::new(task_type, parameters, priority, max_retries, seq);
        table.tasks.insert(task.id.clone(), task.clone());
        task
    }

    pub async fn get(&self, task_id: &str) -> Option<Task> {
        self.inner.read().await.tasks.get(task_id).cloned()
    }

    /// PENDING -> ASSIGNED
    pub async fn mark_assigned(&self, task_id: &str, slave_id: &str) -> OrchestratorResult<Task> {
        let mut table = self.inner.write().await;
        let task = table
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| OrchestratorError::task_not_found(task_id))?;

        if task.status != TaskStatus::Pending {
            return Err(invalid(task, TaskStatus::Assigned));
        }
        task.status = TaskStatus::Assigned;
        task.assigned_to = Some(slave_id.to_string());
        task.updated_at = Utc::now();
        Ok(task.clone())
    }

    /// ASSIGNED -> RUNNING，重复的进度上报幂等处理
    pub async fn mark_running(&self, task_id: &str) -> OrchestratorResult<Task> {
        let mut table = self.inner.write().await;
        let task = table
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| OrchestratorError::task_not_found(task_id))?;

        match task.status {
            TaskStatus::Assigned | TaskStatus::Running => {
                task.status = TaskStatus::Running;
                task.updated_at = Utc::now();
                Ok(task.clone())
            }
            _ => Err(invalid(task, TaskStatus::Running)),
        }
    }

    /// ASSIGNED|RUNNING -> COMPLETED
    pub async fn mark_completed(
        &self,
        task_id: &str,
        result: serde_json::Value,
    ) -> OrchestratorResult<Task> {
        let mut table = self.inner.write().await;
        let task = table
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| OrchestratorError::task_not_found(task_id))?;

        match task.status {
            TaskStatus::Assigned | TaskStatus::Running => {
                task.status = TaskStatus::Completed;
                task.result = Some(result);
                task.updated_at = Utc::now();
                Ok(task.clone())
            }
            _ => Err(invalid(task, TaskStatus::Completed)),
        }
    }

    /// 统一的失败处理：重试次数未用尽则回到PENDING重新竞争派发，
    /// 否则进入终态FAILED。执行失败、心跳超时、任务超时共用此路径。
    pub async fn handle_failure(
        &self,
        task_id: &str,
        error: String,
    ) -> OrchestratorResult<(Task, RetryDecision)> {
        let mut table = self.inner.write().await;
        let task = table
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| OrchestratorError::task_not_found(task_id))?;

        match task.status {
            TaskStatus::Assigned | TaskStatus::Running => {}
            _ => return Err(invalid(task, TaskStatus::Failed)),
        }

        task.error = Some(error);
        task.assigned_to = None;
        task.updated_at = Utc::now();

        let decision = if task.retry_count < task.max_retries {
            task.retry_count += 1;
            task.status = TaskStatus::Pending;
            debug!(
                "任务 {} 第 {} 次重试（上限 {}）",
                task.id, task.retry_count, task.max_retries
            );
            RetryDecision::Requeued {
                retry_count: task.retry_count,
            }
        } else {
            task.status = TaskStatus::Failed;
            RetryDecision::Exhausted
        };
        Ok((task.clone(), decision))
    }

    /// 选出下一个可派发的任务：优先级最高者先行，同优先级按提交顺序
    pub async fn next_dispatchable<F>(&self, is_capable: F) -> Option<Task>
    where
        F: Fn(&str) -> bool,
    {
        let table = self.inner.read().await;
        table
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending && is_capable(&t.task_type))
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then_with(|| a.seq.cmp(&b.seq))
            })
            .cloned()
    }

    /// 指定Slave当前持有的未完结任务
    pub async fn assigned_to_slave(&self, slave_id: &str) -> Vec<String> {
        let table = self.inner.read().await;
        table
            .tasks
            .values()
            .filter(|t| {
                matches!(t.status, TaskStatus::Assigned | TaskStatus::Running)
                    && t.assigned_to.as_deref() == Some(slave_id)
            })
            .map(|t| t.id.clone())
            .collect()
    }

    /// 超过时限仍无任何进展的未完结任务
    pub async fn stale_tasks(&self, now: DateTime<Utc>, timeout_seconds: i64) -> Vec<String> {
        let table = self.inner.read().await;
        table
            .tasks
            .values()
            .filter(|t| {
                matches!(t.status, TaskStatus::Assigned | TaskStatus::Running)
                    && (now - t.updated_at).num_seconds() > timeout_seconds
            })
            .map(|t| t.id.clone())
            .collect()
    }

    pub async fn counts(&self) -> TaskCounts {
        let table = self.inner.read().await;
        let mut counts = TaskCounts {
            total: table.tasks.len(),
            ..Default::default()
        };
        for task in table.tasks.values() {
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Assigned => counts.assigned += 1,
                TaskStatus::Running => counts.running += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn invalid(task: &Task, to: TaskStatus) -> OrchestratorError {
    OrchestratorError::InvalidTransition {
        task_id: task.id.clone(),
        from: task.status.to_string(),
        to: to.to_string(),
    }
}
