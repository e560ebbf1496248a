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

//! Ephemeral, process-local [`Store`] implementation.
//!
//! A single `std::sync::Mutex` guards both maps so that
//! `assign_task_to_worker`/`unassign_task_from_worker` are serializable
//! with respect to each other, mirroring the transactional guarantee the
//! SQLite backend gets from an explicit `BEGIN IMMEDIATE` transaction.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::models::{
    Task, TaskPatch, TaskPriority, TaskStatus, Worker, WorkerPatch, WorkerStatus,
};
use super::Store;
use crate::error::Result;

#[derive(Default)]
struct State {
    tasks: HashMap<String, Task>,
    workers: HashMap<String, Worker>,
}

pub struct MemoryStore {
    state: Mutex<State>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn apply_task_patch(task: &mut Task, patch: TaskPatch) {
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
}

fn apply_worker_patch(worker: &mut Worker, patch: WorkerPatch) {
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
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_task(
        &self,
        url: String,
        options: HashMap<String, serde_json::Value>,
        priority: TaskPriority,
    ) -> Result<Task> {
        let id = format!("task-{}", Uuid::new_v4());
        let task = Task::new(id.clone(), url, priority, options);
        self.lock().tasks.insert(id, task.clone());
        Ok(task)
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        Ok(self.lock().tasks.get(id).cloned())
    }

    async fn get_all_tasks(&self) -> Result<Vec<Task>> {
        Ok(self.lock().tasks.values().cloned().collect())
    }

    async fn get_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        Ok(self
            .lock()
            .tasks
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect())
    }

    async fn get_tasks_by_worker(&self, worker_id: &str) -> Result<Vec<Task>> {
        Ok(self
            .lock()
            .tasks
            .values()
            .filter(|t| t.worker_id.as_deref() == Some(worker_id))
            .cloned()
            .collect())
    }

    async fn update_task(&self, id: &str, patch: TaskPatch) -> Result<Option<Task>> {
        let mut state = self.lock();
        match state.tasks.get_mut(id) {
            Some(task) => {
                apply_task_patch(task, patch);
                Ok(Some(task.clone()))
            }
            None => Ok(None),
        }
    }

    async fn delete_task(&self, id: &str) -> Result<bool> {
        Ok(self.lock().tasks.remove(id).is_some())
    }

    async fn register_worker(
        &self,
        hostname: String,
        address: String,
        port: u16,
        capabilities: HashMap<String, serde_json::Value>,
        total_slots: u32,
    ) -> Result<Worker> {
        let id = format!("worker-{}", Uuid::new_v4());
        let worker = Worker::new(id.clone(), hostname, address, port, capabilities, total_slots);
        self.lock().workers.insert(id, worker.clone());
        Ok(worker)
    }

    async fn get_worker(&self, id: &str) -> Result<Option<Worker>> {
        Ok(self.lock().workers.get(id).cloned())
    }

    async fn get_all_workers(&self) -> Result<Vec<Worker>> {
        Ok(self.lock().workers.values().cloned().collect())
    }

    async fn get_workers_by_status(&self, status: WorkerStatus) -> Result<Vec<Worker>> {
        Ok(self
            .lock()
            .workers
            .values()
            .filter(|w| w.status == status)
            .cloned()
            .collect())
    }

    async fn get_available_workers(&self) -> Result<Vec<Worker>> {
        Ok(self
            .lock()
            .workers
            .values()
            .filter(|w| w.status == WorkerStatus::Online && w.available_slots() > 0)
            .cloned()
            .collect())
    }

    async fn update_worker(&self, id: &str, patch: WorkerPatch) -> Result<Option<Worker>> {
        let mut state = self.lock();
        match state.workers.get_mut(id) {
            Some(worker) => {
                apply_worker_patch(worker, patch);
                Ok(Some(worker.clone()))
            }
            None => Ok(None),
        }
    }

    async fn update_worker_heartbeat(&self, id: &str) -> Result<Option<Worker>> {
        let mut state = self.lock();
        match state.workers.get_mut(id) {
            Some(worker) => {
                worker.last_heartbeat = Utc::now();
                if worker.status == WorkerStatus::Offline {
                    worker.status = WorkerStatus::Online;
                }
                Ok(Some(worker.clone()))
            }
            None => Ok(None),
        }
    }

    async fn delete_worker(&self, id: &str) -> Result<bool> {
        Ok(self.lock().workers.remove(id).is_some())
    }

    async fn assign_task_to_worker(&self, task_id: &str, worker_id: &str) -> Result<bool> {
        let mut state = self.lock();

        let capacity_ok = match state.workers.get(worker_id) {
            Some(w) => w.used_slots < w.total_slots,
            None => false,
        };
        if !capacity_ok || !state.tasks.contains_key(task_id) {
            return Ok(false);
        }

        if let Some(task) = state.tasks.get_mut(task_id) {
            task.worker_id = Some(worker_id.to_string());
            task.status = TaskStatus::Queued;
            task.updated_at = Utc::now();
        }
        if let Some(worker) = state.workers.get_mut(worker_id) {
            worker.current_tasks.push(task_id.to_string());
            worker.used_slots += 1;
            if worker.used_slots >= worker.total_slots {
                worker.status = WorkerStatus::Busy;
            }
        }

        Ok(true)
    }

    async fn unassign_task_from_worker(&self, task_id: &str) -> Result<bool> {
        let mut state = self.lock();

        let worker_id = match state.tasks.get(task_id) {
            Some(task) => task.worker_id.clone(),
            None => return Ok(false),
        };

        if let Some(task) = state.tasks.get_mut(task_id) {
            task.worker_id = None;
            task.updated_at = Utc::now();
        }

        if let Some(worker_id) = worker_id {
            if let Some(worker) = state.workers.get_mut(&worker_id) {
                worker.current_tasks.retain(|t| t != task_id);
                worker.used_slots = worker.used_slots.saturating_sub(1);
                if worker.used_slots < worker.total_slots && worker.status == WorkerStatus::Busy {
                    worker.status = WorkerStatus::Online;
                }
            }
        }

        Ok(true)
    }

    async fn get_task_counts_by_status(&self) -> Result<HashMap<String, usize>> {
        let state = self.lock();
        let mut counts: HashMap<String, usize> = TaskStatus::all()
            .into_iter()
            .map(|s| (s.as_str().to_string(), 0))
            .collect();
        for task in state.tasks.values() {
            *counts.entry(task.status.as_str().to_string()).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn get_worker_counts_by_status(&self) -> Result<HashMap<String, usize>> {
        let state = self.lock();
        let mut counts: HashMap<String, usize> = WorkerStatus::all()
            .into_iter()
            .map(|s| (s.as_str().to_string(), 0))
            .collect();
        for worker in state.workers.values() {
            *counts
                .entry(worker.status.as_str().to_string())
                .or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn get_system_load(&self) -> Result<f64> {
        let state = self.lock();
        let total: u32 = state.workers.values().map(|w| w.total_slots).sum();
        let used: u32 = state.workers.values().map(|w| w.used_slots).sum();
        if total == 0 {
            Ok(0.0)
        } else {
            Ok((used as f64 / total as f64) * 100.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn assign_fails_at_capacity() {
        let store = MemoryStore::new();
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

        let worker = store.get_worker(&worker.id).await.unwrap().unwrap();
        assert_eq!(worker.used_slots, 1);
        assert_eq!(worker.status, WorkerStatus::Busy);
    }

    #[tokio::test]
    async fn assign_then_unassign_restores_capacity() {
        let store = MemoryStore::new();
        let worker = store
            .register_worker("h".into(), "127.0.0.1".into(), 6800, HashMap::new(), 2)
            .await
            .unwrap();
        let task = store
            .create_task("https://example.com/a".into(), HashMap::new(), TaskPriority::Normal)
            .await
            .unwrap();

        store.assign_task_to_worker(&task.id, &worker.id).await.unwrap();
        store.unassign_task_from_worker(&task.id).await.unwrap();

        let worker = store.get_worker(&worker.id).await.unwrap().unwrap();
        assert_eq!(worker.used_slots, 0);
        assert!(worker.current_tasks.is_empty());
        assert_eq!(worker.status, WorkerStatus::Online);

        let task = store.get_task(&task.id).await.unwrap().unwrap();
        assert!(task.worker_id.is_none());
    }

    #[tokio::test]
    async fn unassign_is_idempotent() {
        let store = MemoryStore::new();
        let task = store
            .create_task("https://example.com/a".into(), HashMap::new(), TaskPriority::Normal)
            .await
            .unwrap();
        assert!(store.unassign_task_from_worker(&task.id).await.unwrap());
        assert!(store.unassign_task_from_worker(&task.id).await.unwrap());
    }

    #[tokio::test]
    async fn heartbeat_brings_offline_worker_back_online() {
        let store = MemoryStore::new();
        let worker = store
            .register_worker("h".into(), "127.0.0.1".into(), 6800, HashMap::new(), 2)
            .await
            .unwrap();
        store
            .update_worker(
                &worker.id,
                WorkerPatch {
                    status: Some(WorkerStatus::Offline),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let worker = store.update_worker_heartbeat(&worker.id).await.unwrap().unwrap();
        assert_eq!(worker.status, WorkerStatus::Online);
    }
}
