use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use miner_common::{EarningsRecord, TaskHistory, TaskMetrics, TaskRecord, TaskStatus};

use super::{check_terminal, page_offset, FinalizeOutcome, Store, StoreError};
use crate::device::{DeviceConfig, DeviceStatus, DeviceStatusRecord};

#[derive(Default)]
struct Inner {
    device_config: Option<DeviceConfig>,
    device_status: HashMap<String, DeviceStatusRecord>,
    tasks: HashMap<String, TaskRecord>,
    earnings: Vec<EarningsRecord>,
}

/// In-process store. Used by tests and when no database is configured.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}

impl Store for MemoryStore {
    fn load_device_config(&self) -> Result<Option<DeviceConfig>, StoreError> {
        Ok(self.lock()?.device_config.clone())
    }

    fn save_device_config(&self, config: &DeviceConfig) -> Result<(), StoreError> {
        self.lock()?.device_config = Some(config.clone());
        Ok(())
    }

    fn clear_device_config(&self) -> Result<(), StoreError> {
        self.lock()?.device_config = None;
        Ok(())
    }

    fn update_device_status(
        &self,
        device_id: &str,
        name: &str,
        status: DeviceStatus,
        reward_address: &str,
        gateway_address: &str,
    ) -> Result<(), StoreError> {
        self.lock()?.device_status.insert(
            device_id.to_string(),
            DeviceStatusRecord {
                device_id: device_id.to_string(),
                name: name.to_string(),
                status,
                reward_address: reward_address.to_string(),
                gateway_address: gateway_address.to_string(),
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    fn find_device_status(&self, device_id: &str) -> Result<Option<DeviceStatusRecord>, StoreError> {
        Ok(self.lock()?.device_status.get(device_id).cloned())
    }

    fn list_device_status(&self) -> Result<Vec<DeviceStatusRecord>, StoreError> {
        let mut records: Vec<_> = self.lock()?.device_status.values().cloned().collect();
        records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(records)
    }

    fn mark_devices_offline(&self, threshold: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut inner = self.lock()?;
        let mut changed = 0;
        for record in inner.device_status.values_mut() {
            if record.status == DeviceStatus::Online && record.updated_at < threshold {
                record.status = DeviceStatus::Offline;
                changed += 1;
            }
        }
        Ok(changed)
    }

    fn create_task(&self, task: &TaskRecord) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        if inner.tasks.contains_key(&task.id) {
            return Err(StoreError::Database(format!("duplicate task id {}", task.id)));
        }
        inner.tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, StoreError> {
        Ok(self.lock()?.tasks.get(task_id).cloned())
    }

    fn finalize_task(
        &self,
        task_id: &str,
        status: TaskStatus,
        metrics: &TaskMetrics,
        earnings: Option<&EarningsRecord>,
    ) -> Result<FinalizeOutcome, StoreError> {
        check_terminal(status)?;
        let mut inner = self.lock()?;

        let task = inner
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?;

        if task.status.is_terminal() {
            return Ok(FinalizeOutcome::AlreadyTerminal(task.clone()));
        }

        task.status = status;
        task.metrics = *metrics;
        task.updated_at = Utc::now();
        let finalized = task.clone();

        if let Some(earnings) = earnings {
            inner.earnings.push(earnings.clone());
        }

        Ok(FinalizeOutcome::Finalized(finalized))
    }

    fn task_history(&self, page: u32, limit: u32) -> Result<TaskHistory, StoreError> {
        let inner = self.lock()?;
        let mut tasks: Vec<_> = inner.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = tasks.len() as u64;
        let tasks = tasks
            .into_iter()
            .skip(page_offset(page, limit))
            .take(limit as usize)
            .collect();

        Ok(TaskHistory {
            page: page.max(1),
            limit,
            total,
            tasks,
        })
    }

    fn list_earnings(&self) -> Result<Vec<EarningsRecord>, StoreError> {
        let mut records = self.lock()?.earnings.clone();
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_terminal_update_is_ignored() {
        let store = MemoryStore::new();
        let task = TaskRecord::new("llama3.2:3b");
        store.create_task(&task).unwrap();

        let earnings = EarningsRecord::new(&task.id, 5, 20);
        let first = store
            .finalize_task(&task.id, TaskStatus::Succeed, &TaskMetrics::default(), Some(&earnings))
            .unwrap();
        let second = store
            .finalize_task(&task.id, TaskStatus::Succeed, &TaskMetrics::default(), Some(&earnings))
            .unwrap();

        assert!(first.is_finalized());
        assert!(!second.is_finalized());
        assert_eq!(store.list_earnings().unwrap().len(), 1);
    }

    #[test]
    fn test_duplicate_task_id_rejected() {
        let store = MemoryStore::new();
        let task = TaskRecord::new("m");
        store.create_task(&task).unwrap();
        assert!(store.create_task(&task).is_err());
    }

    #[test]
    fn test_empty_history_page() {
        let store = MemoryStore::new();
        let history = store.task_history(0, 10).unwrap();
        assert_eq!(history.page, 1);
        assert_eq!(history.total, 0);
        assert!(history.tasks.is_empty());
    }
}
