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

//! The pluggable persistence layer.
//!
//! [`Store`] is the single contract both backends (in-memory and SQLite)
//! implement. The scheduler, liveness monitor, retry controller and API
//! layer all talk to `Arc<dyn Store>` and never know which backend is
//! underneath.

pub mod memory;
pub mod migrations;
pub mod models;
pub mod sqlite;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;

pub use memory::MemoryStore;
pub use models::{
    HealthMetrics, PerformanceStats, SystemStatus, Task, TaskPatch, TaskPriority, TaskStatus,
    Worker, WorkerPatch, WorkerStatus,
};
pub use sqlite::SqliteStore;

use crate::error::Result;

#[async_trait]
pub trait Store: Send + Sync {
    async fn create_task(
        &self,
        url: String,
        options: HashMap<String, serde_json::Value>,
        priority: TaskPriority,
    ) -> Result<Task>;
    async fn get_task(&self, id: &str) -> Result<Option<Task>>;
    async fn get_all_tasks(&self) -> Result<Vec<Task>>;
    async fn get_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>>;
    async fn get_tasks_by_worker(&self, worker_id: &str) -> Result<Vec<Task>>;
    async fn update_task(&self, id: &str, patch: TaskPatch) -> Result<Option<Task>>;
    async fn delete_task(&self, id: &str) -> Result<bool>;

    async fn register_worker(
        &self,
        hostname: String,
        address: String,
        port: u16,
        capabilities: HashMap<String, serde_json::Value>,
        total_slots: u32,
    ) -> Result<Worker>;
    async fn get_worker(&self, id: &str) -> Result<Option<Worker>>;
    async fn get_all_workers(&self) -> Result<Vec<Worker>>;
    async fn get_workers_by_status(&self, status: WorkerStatus) -> Result<Vec<Worker>>;
    async fn get_available_workers(&self) -> Result<Vec<Worker>>;
    async fn update_worker(&self, id: &str, patch: WorkerPatch) -> Result<Option<Worker>>;
    async fn update_worker_heartbeat(&self, id: &str) -> Result<Option<Worker>>;
    async fn delete_worker(&self, id: &str) -> Result<bool>;

    async fn assign_task_to_worker(&self, task_id: &str, worker_id: &str) -> Result<bool>;
    async fn unassign_task_from_worker(&self, task_id: &str) -> Result<bool>;

    async fn get_task_counts_by_status(&self) -> Result<HashMap<String, usize>>;
    async fn get_worker_counts_by_status(&self) -> Result<HashMap<String, usize>>;
    async fn get_system_load(&self) -> Result<f64>;
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationReport {
    pub tasks_migrated: usize,
    pub workers_migrated: usize,
    pub errors: usize,
}

/// Copies every task then every worker from `source` to `target`.
///
/// Tasks are re-created first (generating fresh ids) so that the worker
/// back-reference on each re-created worker can be reconciled against
/// already-existing task rows; per-record failures are logged and counted
/// rather than aborting the whole batch.
pub async fn migrate(source: &dyn Store, target: &dyn Store) -> Result<MigrationReport> {
    let mut report = MigrationReport::default();

    let tasks = source.get_all_tasks().await?;
    for task in tasks {
        match target
            .create_task(task.url.clone(), task.options.clone(), task.priority)
            .await
        {
            Ok(created) => {
                let patch = TaskPatch {
                    status: Some(task.status),
                    priority: Some(task.priority),
                    worker_id: Some(task.worker_id.clone()),
                    engine_gid: Some(task.engine_gid.clone()),
                    progress: Some(task.progress),
                    download_speed: Some(task.download_speed),
                    error_message: Some(task.error_message.clone()),
                    result: Some(task.result.clone()),
                    ..Default::default()
                };
                if target.update_task(&created.id, patch).await.is_err() {
                    report.errors += 1;
                } else {
                    report.tasks_migrated += 1;
                }
            }
            Err(err) => {
                tracing::error!(task_id = %task.id, error = %err, "failed to migrate task");
                report.errors += 1;
            }
        }
    }

    let workers = source.get_all_workers().await?;
    for worker in workers {
        match target
            .register_worker(
                worker.hostname.clone(),
                worker.address.clone(),
                worker.port,
                worker.capabilities.clone(),
                worker.total_slots,
            )
            .await
        {
            Ok(created) => {
                let patch = WorkerPatch {
                    status: Some(worker.status),
                    current_tasks: Some(worker.current_tasks.clone()),
                    used_slots: Some(worker.used_slots),
                    health_metrics: Some(worker.health_metrics.clone()),
                    performance_stats: Some(worker.performance_stats.clone()),
                    ..Default::default()
                };
                if target.update_worker(&created.id, patch).await.is_err() {
                    report.errors += 1;
                } else {
                    report.workers_migrated += 1;
                }
            }
            Err(err) => {
                tracing::error!(worker_id = %worker.id, error = %err, "failed to migrate worker");
                report.errors += 1;
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrate_memory_to_memory_round_trips_counts() {
        let source = MemoryStore::new();
        let target = MemoryStore::new();

        source
            .create_task("https://example.com/a".into(), HashMap::new(), TaskPriority::Normal)
            .await
            .unwrap();
        source
            .register_worker("h".into(), "127.0.0.1".into(), 6800, HashMap::new(), 2)
            .await
            .unwrap();

        let report = migrate(&source, &target).await.unwrap();
        assert_eq!(report.tasks_migrated, 1);
        assert_eq!(report.workers_migrated, 1);
        assert_eq!(report.errors, 0);

        assert_eq!(target.get_all_tasks().await.unwrap().len(), 1);
        assert_eq!(target.get_all_workers().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn migrate_preserves_worker_assignment_and_slot_usage() {
        let source = MemoryStore::new();
        let target = MemoryStore::new();

        let worker = source
            .register_worker("h".into(), "127.0.0.1".into(), 6800, HashMap::new(), 2)
            .await
            .unwrap();
        let task = source
            .create_task("https://example.com/a".into(), HashMap::new(), TaskPriority::Normal)
            .await
            .unwrap();
        source.assign_task_to_worker(&task.id, &worker.id).await.unwrap();

        let report = migrate(&source, &target).await.unwrap();
        assert_eq!(report.errors, 0);

        let migrated_task = target.get_all_tasks().await.unwrap().into_iter().next().unwrap();
        assert_eq!(migrated_task.status, TaskStatus::Queued);
        assert!(migrated_task.worker_id.is_some(), "worker_id must survive migration for a non-terminal task");

        let migrated_worker = target.get_all_workers().await.unwrap().into_iter().next().unwrap();
        assert_eq!(migrated_worker.used_slots, 1);
        assert_eq!(migrated_worker.current_tasks.len(), 1);
    }
}
