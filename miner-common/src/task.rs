//! Inference task and earnings records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a task. `InProgress` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    InProgress,
    Succeed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::InProgress)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::InProgress => "in-progress",
            TaskStatus::Succeed => "succeed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "in-progress" => Some(TaskStatus::InProgress),
            "succeed" => Some(TaskStatus::Succeed),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }
}

/// Duration and token counters reported by the engine. Missing fields are zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TaskMetrics {
    #[serde(default)]
    pub total_duration: u64,
    #[serde(default)]
    pub load_duration: u64,
    #[serde(default)]
    pub prompt_eval_count: u64,
    #[serde(default)]
    pub prompt_eval_duration: u64,
    #[serde(default)]
    pub eval_count: u64,
    #[serde(default)]
    pub eval_duration: u64,
}

impl TaskMetrics {
    /// Extract metrics from an engine response object, defaulting anything
    /// absent or non-numeric to zero.
    pub fn from_response(value: &serde_json::Value) -> Self {
        let field = |name: &str| value.get(name).and_then(|v| v.as_u64()).unwrap_or(0);
        Self {
            total_duration: field("total_duration"),
            load_duration: field("load_duration"),
            prompt_eval_count: field("prompt_eval_count"),
            prompt_eval_duration: field("prompt_eval_duration"),
            eval_count: field("eval_count"),
            eval_duration: field("eval_duration"),
        }
    }

    /// Tokens processed for this job (prompt + generated).
    pub fn job_tokens(&self) -> u64 {
        self.prompt_eval_count.saturating_add(self.eval_count)
    }
}

/// Lifecycle record of one inference job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub model: String,
    pub status: TaskStatus,
    #[serde(flatten)]
    pub metrics: TaskMetrics,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    /// New in-progress task with zeroed metrics.
    pub fn new(model: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            model: model.into(),
            status: TaskStatus::InProgress,
            metrics: TaskMetrics::default(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Reward units credited for one completed task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EarningsRecord {
    pub id: String,
    pub task_id: String,
    pub block_rewards: u64,
    pub job_rewards: u64,
    pub timestamp: DateTime<Utc>,
}

impl EarningsRecord {
    pub fn new(task_id: impl Into<String>, block_rewards: u64, job_rewards: u64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.into(),
            block_rewards,
            job_rewards,
            timestamp: Utc::now(),
        }
    }
}

/// One page of task history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskHistory {
    pub page: u32,
    pub limit: u32,
    pub total: u64,
    pub tasks: Vec<TaskRecord>,
}

/// Aggregated earnings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct EarningsSummary {
    pub total_block_rewards: u64,
    pub total_job_rewards: u64,
    pub records: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_terminal() {
        assert!(!TaskStatus::InProgress.is_terminal());
        assert!(TaskStatus::Succeed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
    }

    #[test]
    fn test_status_wire_names() {
        assert_eq!(serde_json::to_string(&TaskStatus::InProgress).unwrap(), r#""in-progress""#);
        assert_eq!(TaskStatus::parse("succeed"), Some(TaskStatus::Succeed));
        assert_eq!(TaskStatus::parse("done"), None);
    }

    #[test]
    fn test_metrics_from_partial_response() {
        let metrics = TaskMetrics::from_response(&json!({
            "done": true,
            "eval_count": 12,
            "prompt_eval_count": 8,
            "total_duration": "oops"
        }));
        assert_eq!(metrics.eval_count, 12);
        assert_eq!(metrics.prompt_eval_count, 8);
        assert_eq!(metrics.total_duration, 0);
        assert_eq!(metrics.job_tokens(), 20);
    }

    #[test]
    fn test_job_tokens_saturates() {
        let metrics = TaskMetrics::from_response(&json!({
            "prompt_eval_count": u64::MAX,
            "eval_count": 5
        }));
        assert_eq!(metrics.job_tokens(), u64::MAX);
    }

    #[test]
    fn test_new_task_is_in_progress() {
        let task = TaskRecord::new("llama3.2:3b");
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.metrics, TaskMetrics::default());
        assert_eq!(task.created_at, task.updated_at);
    }
}
