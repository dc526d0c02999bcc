//! Persistence for the device record, device status, tasks and earnings.
//!
//! Every [`Store`] method is one transaction. Task finalization and the
//! matching earnings record are written together, and only while the task is
//! still `in-progress`, so a second terminal update can never credit twice.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use chrono::{DateTime, Utc};
use miner_common::{EarningsRecord, EarningsSummary, TaskHistory, TaskMetrics, TaskRecord, TaskStatus};

use crate::device::{DeviceConfig, DeviceStatus, DeviceStatusRecord};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("IO error: {0}")]
    Io(String),
    #[error("Task not found: {0}")]
    TaskNotFound(String),
    #[error("Invalid task status: {0}")]
    InvalidStatus(String),
}

/// Result of a terminal task update.
#[derive(Debug, Clone, PartialEq)]
pub enum FinalizeOutcome {
    /// The task left `in-progress` with this call.
    Finalized(TaskRecord),
    /// The task was already terminal; nothing was written.
    AlreadyTerminal(TaskRecord),
}

impl FinalizeOutcome {
    pub fn is_finalized(&self) -> bool {
        matches!(self, FinalizeOutcome::Finalized(_))
    }

    pub fn task(&self) -> &TaskRecord {
        match self {
            FinalizeOutcome::Finalized(task) | FinalizeOutcome::AlreadyTerminal(task) => task,
        }
    }
}

/// Transactional record store.
pub trait Store: Send + Sync {
    /// Load the persisted device record, if one was saved.
    fn load_device_config(&self) -> Result<Option<DeviceConfig>, StoreError>;

    fn save_device_config(&self, config: &DeviceConfig) -> Result<(), StoreError>;

    fn clear_device_config(&self) -> Result<(), StoreError>;

    /// Insert or refresh the status row of a device.
    fn update_device_status(
        &self,
        device_id: &str,
        name: &str,
        status: DeviceStatus,
        reward_address: &str,
        gateway_address: &str,
    ) -> Result<(), StoreError>;

    fn find_device_status(&self, device_id: &str) -> Result<Option<DeviceStatusRecord>, StoreError>;

    fn list_device_status(&self) -> Result<Vec<DeviceStatusRecord>, StoreError>;

    /// Mark every online device last updated before `threshold` offline.
    /// Returns the number of rows changed.
    fn mark_devices_offline(&self, threshold: DateTime<Utc>) -> Result<usize, StoreError>;

    fn create_task(&self, task: &TaskRecord) -> Result<(), StoreError>;

    fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, StoreError>;

    /// Move a task to a terminal status and, in the same transaction, insert
    /// `earnings` when given. A task that is already terminal is left untouched.
    fn finalize_task(
        &self,
        task_id: &str,
        status: TaskStatus,
        metrics: &TaskMetrics,
        earnings: Option<&EarningsRecord>,
    ) -> Result<FinalizeOutcome, StoreError>;

    /// Tasks newest first, `page` is 1-based.
    fn task_history(&self, page: u32, limit: u32) -> Result<TaskHistory, StoreError>;

    fn list_earnings(&self) -> Result<Vec<EarningsRecord>, StoreError>;

    fn earnings_summary(&self) -> Result<EarningsSummary, StoreError> {
        let records = self.list_earnings()?;
        Ok(EarningsSummary {
            total_block_rewards: records.iter().map(|r| r.block_rewards).sum(),
            total_job_rewards: records.iter().map(|r| r.job_rewards).sum(),
            records: records.len() as u64,
        })
    }
}

fn check_terminal(status: TaskStatus) -> Result<(), StoreError> {
    if status.is_terminal() {
        Ok(())
    } else {
        Err(StoreError::InvalidStatus(status.as_str().to_string()))
    }
}

fn page_offset(page: u32, limit: u32) -> usize {
    (page.max(1) as usize - 1) * limit as usize
}
