use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use miner_common::{EarningsRecord, TaskHistory, TaskMetrics, TaskRecord, TaskStatus};

use super::{check_terminal, page_offset, FinalizeOutcome, Store, StoreError};
use crate::device::{DeviceConfig, DeviceStatus, DeviceStatusRecord};

/// SQLite-backed store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

const TASK_COLUMNS: &str = "id, model, status, total_duration, load_duration, prompt_eval_count, \
     prompt_eval_duration, eval_count, eval_duration, created_at, updated_at";

fn db_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Database(e.to_string())
}

fn parse_time(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<(TaskRecord, String)> {
    let status: String = row.get(2)?;
    let created_at: String = row.get(9)?;
    let updated_at: String = row.get(10)?;
    let task = TaskRecord {
        id: row.get(0)?,
        model: row.get(1)?,
        status: TaskStatus::InProgress,
        metrics: TaskMetrics {
            total_duration: row.get::<_, i64>(3)? as u64,
            load_duration: row.get::<_, i64>(4)? as u64,
            prompt_eval_count: row.get::<_, i64>(5)? as u64,
            prompt_eval_duration: row.get::<_, i64>(6)? as u64,
            eval_count: row.get::<_, i64>(7)? as u64,
            eval_duration: row.get::<_, i64>(8)? as u64,
        },
        created_at: parse_time(&created_at),
        updated_at: parse_time(&updated_at),
    };
    Ok((task, status))
}

fn with_status((mut task, status): (TaskRecord, String)) -> Result<TaskRecord, StoreError> {
    task.status = TaskStatus::parse(&status).ok_or(StoreError::InvalidStatus(status))?;
    Ok(task)
}

impl SqliteStore {
    pub fn new(database_url: &str) -> Result<Self, StoreError> {
        // Parse sqlite: prefix if present
        let path = database_url.strip_prefix("sqlite:").unwrap_or(database_url);

        if path != ":memory:" {
            if let Some(parent) = Path::new(path).parent() {
                std::fs::create_dir_all(parent).map_err(|e| StoreError::Io(e.to_string()))?;
            }
        }

        let conn = Connection::open(path).map_err(db_err)?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS device_config (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                device_id TEXT NOT NULL,
                device_name TEXT NOT NULL,
                gateway_address TEXT NOT NULL,
                reward_address TEXT NOT NULL,
                key TEXT NOT NULL,
                code TEXT NOT NULL,
                base_path TEXT NOT NULL,
                is_registered INTEGER NOT NULL DEFAULT 0,
                timestamp TEXT
            );
            CREATE TABLE IF NOT EXISTS device_status (
                device_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                reward_address TEXT NOT NULL,
                gateway_address TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                model TEXT NOT NULL,
                status TEXT NOT NULL,
                total_duration INTEGER NOT NULL DEFAULT 0,
                load_duration INTEGER NOT NULL DEFAULT 0,
                prompt_eval_count INTEGER NOT NULL DEFAULT 0,
                prompt_eval_duration INTEGER NOT NULL DEFAULT 0,
                eval_count INTEGER NOT NULL DEFAULT 0,
                eval_duration INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS earnings (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL UNIQUE,
                block_rewards INTEGER NOT NULL,
                job_rewards INTEGER NOT NULL,
                timestamp TEXT NOT NULL,
                FOREIGN KEY (task_id) REFERENCES tasks(id)
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_created_at ON tasks(created_at);
            CREATE INDEX IF NOT EXISTS idx_device_status_updated_at ON device_status(updated_at);",
        )
        .map_err(db_err)?;

        tracing::info!("Store initialized with database: {}", path);

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(db_err)
    }
}

impl Store for SqliteStore {
    fn load_device_config(&self) -> Result<Option<DeviceConfig>, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT device_id, device_name, gateway_address, reward_address, key, code,
                    base_path, is_registered, timestamp
             FROM device_config WHERE id = 1",
            [],
            |row| {
                let timestamp: Option<String> = row.get(8)?;
                Ok(DeviceConfig {
                    device_id: row.get(0)?,
                    device_name: row.get(1)?,
                    gateway_address: row.get(2)?,
                    reward_address: row.get(3)?,
                    key: row.get(4)?,
                    code: row.get(5)?,
                    base_path: row.get(6)?,
                    is_registered: row.get::<_, i32>(7)? != 0,
                    timestamp: timestamp.as_deref().map(parse_time),
                })
            },
        )
        .optional()
        .map_err(db_err)
    }

    fn save_device_config(&self, config: &DeviceConfig) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO device_config
                (id, device_id, device_name, gateway_address, reward_address, key, code,
                 base_path, is_registered, timestamp)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                device_id = excluded.device_id,
                device_name = excluded.device_name,
                gateway_address = excluded.gateway_address,
                reward_address = excluded.reward_address,
                key = excluded.key,
                code = excluded.code,
                base_path = excluded.base_path,
                is_registered = excluded.is_registered,
                timestamp = excluded.timestamp",
            params![
                config.device_id,
                config.device_name,
                config.gateway_address,
                config.reward_address,
                config.key,
                config.code,
                config.base_path,
                config.is_registered as i32,
                config.timestamp.map(|t| t.to_rfc3339()),
            ],
        )
        .map_err(db_err)?;
        tracing::debug!("Saved device config for {}", config.device_id);
        Ok(())
    }

    fn clear_device_config(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM device_config", []).map_err(db_err)?;
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
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO device_status (device_id, name, status, reward_address, gateway_address, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(device_id) DO UPDATE SET
                name = excluded.name,
                status = excluded.status,
                reward_address = excluded.reward_address,
                gateway_address = excluded.gateway_address,
                updated_at = excluded.updated_at",
            params![
                device_id,
                name,
                status.as_str(),
                reward_address,
                gateway_address,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn find_device_status(&self, device_id: &str) -> Result<Option<DeviceStatusRecord>, StoreError> {
        Ok(self
            .list_device_status()?
            .into_iter()
            .find(|record| record.device_id == device_id))
    }

    fn list_device_status(&self) -> Result<Vec<DeviceStatusRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT device_id, name, status, reward_address, gateway_address, updated_at
                 FROM device_status ORDER BY updated_at DESC",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                let status: String = row.get(2)?;
                let updated_at: String = row.get(5)?;
                Ok(DeviceStatusRecord {
                    device_id: row.get(0)?,
                    name: row.get(1)?,
                    status: DeviceStatus::parse(&status).unwrap_or(DeviceStatus::Offline),
                    reward_address: row.get(3)?,
                    gateway_address: row.get(4)?,
                    updated_at: parse_time(&updated_at),
                })
            })
            .map_err(db_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(db_err)
    }

    fn mark_devices_offline(&self, threshold: DateTime<Utc>) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE device_status SET status = 'offline'
                 WHERE status = 'online' AND updated_at < ?1",
                params![threshold.to_rfc3339()],
            )
            .map_err(db_err)?;
        Ok(changed)
    }

    fn create_task(&self, task: &TaskRecord) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO tasks (id, model, status, total_duration, load_duration, prompt_eval_count,
                                prompt_eval_duration, eval_count, eval_duration, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                task.id,
                task.model,
                task.status.as_str(),
                task.metrics.total_duration as i64,
                task.metrics.load_duration as i64,
                task.metrics.prompt_eval_count as i64,
                task.metrics.prompt_eval_duration as i64,
                task.metrics.eval_count as i64,
                task.metrics.eval_duration as i64,
                task.created_at.to_rfc3339(),
                task.updated_at.to_rfc3339(),
            ],
        )
        .map_err(db_err)?;
        tracing::debug!("Created task {} for model {}", task.id, task.model);
        Ok(())
    }

    fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, StoreError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
                params![task_id],
                task_from_row,
            )
            .optional()
            .map_err(db_err)?;
        row.map(with_status).transpose()
    }

    fn finalize_task(
        &self,
        task_id: &str,
        status: TaskStatus,
        metrics: &TaskMetrics,
        earnings: Option<&EarningsRecord>,
    ) -> Result<FinalizeOutcome, StoreError> {
        check_terminal(status)?;
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(db_err)?;

        let current = tx
            .query_row(
                &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
                params![task_id],
                task_from_row,
            )
            .optional()
            .map_err(db_err)?
            .map(with_status)
            .transpose()?
            .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?;

        if current.status.is_terminal() {
            return Ok(FinalizeOutcome::AlreadyTerminal(current));
        }

        let now = Utc::now();
        tx.execute(
            "UPDATE tasks SET status = ?1, total_duration = ?2, load_duration = ?3,
                prompt_eval_count = ?4, prompt_eval_duration = ?5, eval_count = ?6,
                eval_duration = ?7, updated_at = ?8
             WHERE id = ?9 AND status = 'in-progress'",
            params![
                status.as_str(),
                metrics.total_duration as i64,
                metrics.load_duration as i64,
                metrics.prompt_eval_count as i64,
                metrics.prompt_eval_duration as i64,
                metrics.eval_count as i64,
                metrics.eval_duration as i64,
                now.to_rfc3339(),
                task_id,
            ],
        )
        .map_err(db_err)?;

        if let Some(earnings) = earnings {
            tx.execute(
                "INSERT INTO earnings (id, task_id, block_rewards, job_rewards, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    earnings.id,
                    task_id,
                    earnings.block_rewards as i64,
                    earnings.job_rewards as i64,
                    earnings.timestamp.to_rfc3339(),
                ],
            )
            .map_err(db_err)?;
        }

        tx.commit().map_err(db_err)?;

        Ok(FinalizeOutcome::Finalized(TaskRecord {
            status,
            metrics: *metrics,
            updated_at: now,
            ..current
        }))
    }

    fn task_history(&self, page: u32, limit: u32) -> Result<TaskHistory, StoreError> {
        let conn = self.lock()?;
        let total: i64 = conn
            .query_row("SELECT COUNT(*) FROM tasks", [], |row| row.get(0))
            .map_err(db_err)?;

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM tasks ORDER BY created_at DESC LIMIT ?1 OFFSET ?2",
                TASK_COLUMNS
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(
                params![limit as i64, page_offset(page, limit) as i64],
                task_from_row,
            )
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        let tasks = rows
            .into_iter()
            .map(with_status)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(TaskHistory {
            page: page.max(1),
            limit,
            total: total as u64,
            tasks,
        })
    }

    fn list_earnings(&self) -> Result<Vec<EarningsRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, task_id, block_rewards, job_rewards, timestamp
                 FROM earnings ORDER BY timestamp DESC",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                let timestamp: String = row.get(4)?;
                Ok(EarningsRecord {
                    id: row.get(0)?,
                    task_id: row.get(1)?,
                    block_rewards: row.get::<_, i64>(2)? as u64,
                    job_rewards: row.get::<_, i64>(3)? as u64,
                    timestamp: parse_time(&timestamp),
                })
            })
            .map_err(db_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(db_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    fn temp_store() -> (TempDir, SqliteStore) {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite:{}", dir.path().join("miner.db").display());
        let store = SqliteStore::new(&url).unwrap();
        (dir, store)
    }

    fn registered_config() -> DeviceConfig {
        DeviceConfig {
            device_id: "dev-1".to_string(),
            device_name: "Node1".to_string(),
            gateway_address: "https://gw.test".to_string(),
            reward_address: "0xabc".to_string(),
            key: "K".to_string(),
            code: "C1".to_string(),
            base_path: "/".to_string(),
            is_registered: true,
            timestamp: Some(Utc::now()),
        }
    }

    #[test]
    fn test_device_config_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite:{}", dir.path().join("nested/miner.db").display());

        {
            let store = SqliteStore::new(&url).unwrap();
            assert!(store.load_device_config().unwrap().is_none());
            store.save_device_config(&registered_config()).unwrap();
        }

        let store = SqliteStore::new(&url).unwrap();
        let loaded = store.load_device_config().unwrap().unwrap();
        assert_eq!(loaded.device_id, "dev-1");
        assert!(loaded.is_registered);
        assert!(loaded.has_registration_info());
    }

    #[test]
    fn test_clear_device_config() {
        let (_dir, store) = temp_store();
        store.save_device_config(&registered_config()).unwrap();
        store.clear_device_config().unwrap();
        assert!(store.load_device_config().unwrap().is_none());
    }

    #[test]
    fn test_finalize_is_sticky_and_credits_once() {
        let (_dir, store) = temp_store();
        let task = TaskRecord::new("llama3.2:3b");
        store.create_task(&task).unwrap();

        let metrics = TaskMetrics {
            prompt_eval_count: 8,
            eval_count: 12,
            ..TaskMetrics::default()
        };
        let first = store
            .finalize_task(
                &task.id,
                TaskStatus::Succeed,
                &metrics,
                Some(&EarningsRecord::new(&task.id, 7, 20)),
            )
            .unwrap();
        assert!(first.is_finalized());

        let second = store
            .finalize_task(
                &task.id,
                TaskStatus::Failed,
                &TaskMetrics::default(),
                Some(&EarningsRecord::new(&task.id, 9, 20)),
            )
            .unwrap();
        assert!(!second.is_finalized());
        assert_eq!(second.task().status, TaskStatus::Succeed);

        let stored = store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Succeed);
        assert_eq!(stored.metrics.eval_count, 12);
        assert_eq!(store.list_earnings().unwrap().len(), 1);

        let summary = store.earnings_summary().unwrap();
        assert_eq!(summary.total_block_rewards, 7);
        assert_eq!(summary.total_job_rewards, 20);
    }

    #[test]
    fn test_finalize_unknown_task() {
        let (_dir, store) = temp_store();
        let result = store.finalize_task("missing", TaskStatus::Failed, &TaskMetrics::default(), None);
        assert!(matches!(result, Err(StoreError::TaskNotFound(_))));
    }

    #[test]
    fn test_finalize_rejects_non_terminal_status() {
        let (_dir, store) = temp_store();
        let task = TaskRecord::new("m");
        store.create_task(&task).unwrap();
        let result = store.finalize_task(&task.id, TaskStatus::InProgress, &TaskMetrics::default(), None);
        assert!(matches!(result, Err(StoreError::InvalidStatus(_))));
    }

    #[test]
    fn test_task_history_paging() {
        let (_dir, store) = temp_store();
        for i in 0..5 {
            let mut task = TaskRecord::new(format!("model-{}", i));
            task.created_at = Utc::now() + Duration::seconds(i);
            store.create_task(&task).unwrap();
        }

        let first = store.task_history(1, 2).unwrap();
        assert_eq!(first.total, 5);
        assert_eq!(first.tasks.len(), 2);
        assert_eq!(first.tasks[0].model, "model-4");

        let last = store.task_history(3, 2).unwrap();
        assert_eq!(last.tasks.len(), 1);
        assert_eq!(last.tasks[0].model, "model-0");
    }

    #[test]
    fn test_mark_devices_offline_only_touches_stale_rows() {
        let (_dir, store) = temp_store();
        store
            .update_device_status("dev-1", "Node1", DeviceStatus::Online, "0xabc", "https://gw.test")
            .unwrap();

        let changed = store.mark_devices_offline(Utc::now() - Duration::seconds(60)).unwrap();
        assert_eq!(changed, 0);

        let changed = store.mark_devices_offline(Utc::now() + Duration::seconds(1)).unwrap();
        assert_eq!(changed, 1);
        let record = store.find_device_status("dev-1").unwrap().unwrap();
        assert_eq!(record.status, DeviceStatus::Offline);
    }
}
