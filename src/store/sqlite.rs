// dispatcher - distributed download orchestration cluster
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Embedded single-file [`Store`] backend, built on `sqlx` over SQLite.
//!
//! Connection handling (WAL, busy timeout, pool sizing) follows the same
//! shape as the dispatcher's in-process database layer used elsewhere in
//! this workspace: create the parent directory if missing, open with
//! `create_if_missing`, and run migrations once at startup.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use super::models::{
    HealthMetrics, PerformanceStats, Task, TaskPatch, TaskPriority, TaskStatus, Worker,
    WorkerPatch, WorkerStatus,
};
use super::{migrations, Store};
use crate::error::{DispatcherError, Result};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .map_err(|e| DispatcherError::internal(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await?;

        migrations::migrate(&pool).await?;

        Ok(Self { pool })
    }

    pub async fn new_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| DispatcherError::internal(e.to_string()))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        migrations::migrate(&pool).await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn row_to_task(row: &SqliteRow) -> Result<Task> {
    let options_json: String = row.try_get("options")?;
    let result_json: Option<String> = row.try_get("result")?;
    let status_str: String = row.try_get("status")?;
    let priority_i32: i64 = row.try_get("priority")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(Task {
        id: row.try_get("id")?,
        url: row.try_get("url")?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
        status: TaskStatus::from_str(&status_str)
            .ok_or_else(|| DispatcherError::internal(format!("unknown task status: {status_str}")))?,
        priority: TaskPriority::from_i32(priority_i32 as i32),
        worker_id: row.try_get("worker_id")?,
        engine_gid: row.try_get("engine_gid")?,
        options: serde_json::from_str(&options_json).unwrap_or_default(),
        progress: row.try_get("progress")?,
        download_speed: row.try_get("download_speed")?,
        error_message: row.try_get("error_message")?,
        result: result_json.and_then(|s| serde_json::from_str(&s).ok()),
    })
}

fn row_to_worker(row: &SqliteRow) -> Result<Worker> {
    let status_str: String = row.try_get("status")?;
    let capabilities_json: String = row.try_get("capabilities")?;
    let current_tasks_json: String = row.try_get("current_tasks")?;
    let health_json: String = row.try_get("health_metrics")?;
    let error_history_json: String = row.try_get("error_history")?;
    let stats_json: String = row.try_get("performance_stats")?;
    let connected_at: String = row.try_get("connected_at")?;
    let last_heartbeat: String = row.try_get("last_heartbeat")?;
    let port_i64: i64 = row.try_get("port")?;
    let total_slots_i64: i64 = row.try_get("total_slots")?;
    let used_slots_i64: i64 = row.try_get("used_slots")?;

    Ok(Worker {
        id: row.try_get("id")?,
        hostname: row.try_get("hostname")?,
        address: row.try_get("address")?,
        port: port_i64 as u16,
        status: WorkerStatus::from_str(&status_str).ok_or_else(|| {
            DispatcherError::internal(format!("unknown worker status: {status_str}"))
        })?,
        connected_at: parse_timestamp(&connected_at)?,
        last_heartbeat: parse_timestamp(&last_heartbeat)?,
        capabilities: serde_json::from_str(&capabilities_json).unwrap_or_default(),
        current_tasks: serde_json::from_str(&current_tasks_json).unwrap_or_default(),
        total_slots: total_slots_i64 as u32,
        used_slots: used_slots_i64 as u32,
        health_metrics: serde_json::from_str(&health_json).unwrap_or_else(|_| HealthMetrics::default()),
        error_history: serde_json::from_str(&error_history_json).unwrap_or_default(),
        performance_stats: serde_json::from_str(&stats_json)
            .unwrap_or_else(|_| PerformanceStats::default()),
    })
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DispatcherError::internal(format!("bad timestamp {s}: {e}")))
}

#[async_trait]
impl Store for SqliteStore {
    async fn create_task(
        &self,
        url: String,
        options: HashMap<String, serde_json::Value>,
        priority: TaskPriority,
    ) -> Result<Task> {
        let task = Task::new(format!("task-{}", uuid::Uuid::new_v4()), url, priority, options);
        sqlx::query(
            "INSERT INTO tasks (id, url, created_at, updated_at, status, priority, worker_id,
                engine_gid, options, progress, download_speed, error_message, result)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&task.id)
        .bind(&task.url)
        .bind(task.created_at.to_rfc3339())
        .bind(task.updated_at.to_rfc3339())
        .bind(task.status.as_str())
        .bind(task.priority as i64)
        .bind(&task.worker_id)
        .bind(&task.engine_gid)
        .bind(serde_json::to_string(&task.options)?)
        .bind(task.progress)
        .bind(task.download_speed)
        .bind(&task.error_message)
        .bind(task.result.as_ref().map(|v| v.to_string()))
        .execute(&self.pool)
        .await?;
        Ok(task)
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_task).transpose()
    }

    async fn get_all_tasks(&self) -> Result<Vec<Task>> {
        let rows = sqlx::query("SELECT * FROM tasks").fetch_all(&self.pool).await?;
        rows.iter().map(row_to_task).collect()
    }

    async fn get_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        let rows = sqlx::query("SELECT * FROM tasks WHERE status = ?")
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_task).collect()
    }

    async fn get_tasks_by_worker(&self, worker_id: &str) -> Result<Vec<Task>> {
        let rows = sqlx::query("SELECT * FROM tasks WHERE worker_id = ?")
            .bind(worker_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_task).collect()
    }

    async fn update_task(&self, id: &str, patch: TaskPatch) -> Result<Option<Task>> {
        let existing = self.get_task(id).await?;
        let Some(mut task) = existing else {
            return Ok(None);
        };

        if let Some(status) = patch.status {
            task.status = status;
        }
        if let Some(priority) = patch.priority {
            task.priority = priority;
        }
        if let Some(worker_id) = patch.worker_id {
            task.worker_id = worker_id;
        }
        if let Some(engine_gid) = patch.engine_gid {
            task.engine_gid = engine_gid;
        }
        if let Some(options) = patch.options {
            task.options = options;
        }
        if let Some(progress) = patch.progress {
            task.progress = progress;
        }
        if let Some(download_speed) = patch.download_speed {
            task.download_speed = download_speed;
        }
        if let Some(error_message) = patch.error_message {
            task.error_message = error_message;
        }
        if let Some(result) = patch.result {
            task.result = result;
        }
        task.updated_at = Utc::now();

        sqlx::query(
            "UPDATE tasks SET status = ?, priority = ?, worker_id = ?, engine_gid = ?,
                options = ?, progress = ?, download_speed = ?, error_message = ?, result = ?,
                updated_at = ? WHERE id = ?",
        )
        .bind(task.status.as_str())
        .bind(task.priority as i64)
        .bind(&task.worker_id)
        .bind(&task.engine_gid)
        .bind(serde_json::to_string(&task.options)?)
        .bind(task.progress)
        .bind(task.download_speed)
        .bind(&task.error_message)
        .bind(task.result.as_ref().map(|v| v.to_string()))
        .bind(task.updated_at.to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(Some(task))
    }

    async fn delete_task(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn register_worker(
        &self,
        hostname: String,
        address: String,
        port: u16,
        capabilities: HashMap<String, serde_json::Value>,
        total_slots: u32,
    ) -> Result<Worker> {
        let worker = Worker::new(
            format!("worker-{}", uuid::Uuid::new_v4()),
            hostname,
            address,
            port,
            capabilities,
            total_slots,
        );
        sqlx::query(
            "INSERT INTO workers (id, hostname, address, port, status, connected_at,
                last_heartbeat, capabilities, current_tasks, total_slots, used_slots,
                health_metrics, error_history, performance_stats)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&worker.id)
        .bind(&worker.hostname)
        .bind(&worker.address)
        .bind(worker.port as i64)
        .bind(worker.status.as_str())
        .bind(worker.connected_at.to_rfc3339())
        .bind(worker.last_heartbeat.to_rfc3339())
        .bind(serde_json::to_string(&worker.capabilities)?)
        .bind(serde_json::to_string(&worker.current_tasks)?)
        .bind(worker.total_slots as i64)
        .bind(worker.used_slots as i64)
        .bind(serde_json::to_string(&worker.health_metrics)?)
        .bind(serde_json::to_string(&worker.error_history)?)
        .bind(serde_json::to_string(&worker.performance_stats)?)
        .execute(&self.pool)
        .await?;
        Ok(worker)
    }

    async fn get_worker(&self, id: &str) -> Result<Option<Worker>> {
        let row = sqlx::query("SELECT * FROM workers WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_worker).transpose()
    }

    async fn get_all_workers(&self) -> Result<Vec<Worker>> {
        let rows = sqlx::query("SELECT * FROM workers").fetch_all(&self.pool).await?;
        rows.iter().map(row_to_worker).collect()
    }

    async fn get_workers_by_status(&self, status: WorkerStatus) -> Result<Vec<Worker>> {
        let rows = sqlx::query("SELECT * FROM workers WHERE status = ?")
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_worker).collect()
    }

    async fn get_available_workers(&self) -> Result<Vec<Worker>> {
        let all = self.get_workers_by_status(WorkerStatus::Online).await?;
        Ok(all.into_iter().filter(|w| w.available_slots() > 0).collect())
    }

    async fn update_worker(&self, id: &str, patch: WorkerPatch) -> Result<Option<Worker>> {
        let existing = self.get_worker(id).await?;
        let Some(mut worker) = existing else {
            return Ok(None);
        };

        if let Some(status) = patch.status {
            worker.status = status;
        }
        if let Some(current_tasks) = patch.current_tasks {
            worker.current_tasks = current_tasks;
        }
        if let Some(used_slots) = patch.used_slots {
            worker.used_slots = used_slots;
        }
        if let Some(capabilities) = patch.capabilities {
            worker.capabilities = capabilities;
        }
        if let Some(total_slots) = patch.total_slots {
            worker.total_slots = total_slots;
        }
        if let Some(health_metrics) = patch.health_metrics {
            worker.health_metrics = health_metrics;
        }
        if let Some(performance_stats) = patch.performance_stats {
            worker.performance_stats = performance_stats;
        }

        sqlx::query(
            "UPDATE workers SET status = ?, current_tasks = ?, used_slots = ?, capabilities = ?,
                total_slots = ?, health_metrics = ?, performance_stats = ? WHERE id = ?",
        )
        .bind(worker.status.as_str())
        .bind(serde_json::to_string(&worker.current_tasks)?)
        .bind(worker.used_slots as i64)
        .bind(serde_json::to_string(&worker.capabilities)?)
        .bind(worker.total_slots as i64)
        .bind(serde_json::to_string(&worker.health_metrics)?)
        .bind(serde_json::to_string(&worker.performance_stats)?)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(Some(worker))
    }

    async fn update_worker_heartbeat(&self, id: &str) -> Result<Option<Worker>> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE workers SET last_heartbeat = ?,
                status = CASE WHEN status = 'offline' THEN 'online' ELSE status END
             WHERE id = ?",
        )
        .bind(now.to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_worker(id).await
    }

    async fn delete_worker(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM workers WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn assign_task_to_worker(&self, task_id: &str, worker_id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let worker_row = sqlx::query("SELECT * FROM workers WHERE id = ?")
            .bind(worker_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(worker_row) = worker_row else {
            tx.rollback().await?;
            return Ok(false);
        };
        let worker = row_to_worker(&worker_row)?;

        let task_exists: Option<(String,)> = sqlx::query_as("SELECT id FROM tasks WHERE id = ?")
            .bind(task_id)
            .fetch_optional(&mut *tx)
            .await?;
        if task_exists.is_none() || worker.used_slots >= worker.total_slots {
            tx.rollback().await?;
            return Ok(false);
        }

        let now = Utc::now().to_rfc3339();
        sqlx::query("UPDATE tasks SET worker_id = ?, status = 'queued', updated_at = ? WHERE id = ?")
            .bind(worker_id)
            .bind(&now)
            .bind(task_id)
            .execute(&mut *tx)
            .await?;

        let mut current_tasks = worker.current_tasks.clone();
        current_tasks.push(task_id.to_string());
        let new_used = worker.used_slots + 1;
        let new_status = if new_used >= worker.total_slots {
            WorkerStatus::Busy
        } else {
            worker.status
        };
        sqlx::query("UPDATE workers SET current_tasks = ?, used_slots = ?, status = ? WHERE id = ?")
            .bind(serde_json::to_string(&current_tasks)?)
            .bind(new_used as i64)
            .bind(new_status.as_str())
            .bind(worker_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn unassign_task_from_worker(&self, task_id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let task_row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(task_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(task_row) = task_row else {
            tx.rollback().await?;
            return Ok(false);
        };
        let task = row_to_task(&task_row)?;

        let now = Utc::now().to_rfc3339();
        sqlx::query("UPDATE tasks SET worker_id = NULL, updated_at = ? WHERE id = ?")
            .bind(&now)
            .bind(task_id)
            .execute(&mut *tx)
            .await?;

        if let Some(worker_id) = task.worker_id {
            let worker_row = sqlx::query("SELECT * FROM workers WHERE id = ?")
                .bind(&worker_id)
                .fetch_optional(&mut *tx)
                .await?;
            if let Some(worker_row) = worker_row {
                let worker = row_to_worker(&worker_row)?;
                let current_tasks: Vec<String> = worker
                    .current_tasks
                    .into_iter()
                    .filter(|t| t != task_id)
                    .collect();
                let new_used = worker.used_slots.saturating_sub(1);
                let new_status = if new_used < worker.total_slots && worker.status == WorkerStatus::Busy
                {
                    WorkerStatus::Online
                } else {
                    worker.status
                };
                sqlx::query(
                    "UPDATE workers SET current_tasks = ?, used_slots = ?, status = ? WHERE id = ?",
                )
                .bind(serde_json::to_string(&current_tasks)?)
                .bind(new_used as i64)
                .bind(new_status.as_str())
                .bind(&worker_id)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn get_task_counts_by_status(&self) -> Result<HashMap<String, usize>> {
        let mut counts: HashMap<String, usize> = TaskStatus::all()
            .into_iter()
            .map(|s| (s.as_str().to_string(), 0))
            .collect();
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM tasks GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        for (status, count) in rows {
            if counts.contains_key(&status) {
                counts.insert(status, count as usize);
            } else {
                tracing::warn!(status = %status, "unknown task status in counts query");
            }
        }
        Ok(counts)
    }

    async fn get_worker_counts_by_status(&self) -> Result<HashMap<String, usize>> {
        let mut counts: HashMap<String, usize> = WorkerStatus::all()
            .into_iter()
            .map(|s| (s.as_str().to_string(), 0))
            .collect();
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM workers GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        for (status, count) in rows {
            if counts.contains_key(&status) {
                counts.insert(status, count as usize);
            } else {
                tracing::warn!(status = %status, "unknown worker status in counts query");
            }
        }
        Ok(counts)
    }

    async fn get_system_load(&self) -> Result<f64> {
        let row: (Option<i64>, Option<i64>) =
            sqlx::query_as("SELECT SUM(total_slots), SUM(used_slots) FROM workers")
                .fetch_one(&self.pool)
                .await?;
        match row {
            (Some(total), Some(used)) if total > 0 => Ok((used as f64 / total as f64) * 100.0),
            _ => Ok(0.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_and_fetch_task_round_trips() {
        let store = SqliteStore::new_in_memory().await.unwrap();
        let task = store
            .create_task("https://example.com/a".into(), HashMap::new(), TaskPriority::High)
            .await
            .unwrap();
        let fetched = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(fetched.url, "https://example.com/a");
        assert_eq!(fetched.priority, TaskPriority::High);
    }

    #[tokio::test]
    async fn assign_is_transactional_at_capacity() {
        let store = SqliteStore::new_in_memory().await.unwrap();
        let worker = store
            .register_worker("h".into(), "127.0.0.1".into(), 6800, HashMap::new(), 1)
            .await
            .unwrap();
        let t1 = store
            .create_task("https://example.com/a".into(), HashMap::new(), TaskPriority::Normal)
            .await
            .unwrap();
        let t2 = store
            .create_task("https://example.com/b".into(), HashMap::new(), TaskPriority::Normal)
            .await
            .unwrap();

        assert!(store.assign_task_to_worker(&t1.id, &worker.id).await.unwrap());
        assert!(!store.assign_task_to_worker(&t2.id, &worker.id).await.unwrap());

        let t2_after = store.get_task(&t2.id).await.unwrap().unwrap();
        assert!(t2_after.worker_id.is_none());
    }

    #[tokio::test]
    async fn counts_by_status_seed_all_known_statuses() {
        let store = SqliteStore::new_in_memory().await.unwrap();
        let counts = store.get_task_counts_by_status().await.unwrap();
        assert_eq!(counts.len(), 6);
        assert_eq!(counts["pending"], 0);
    }
}
