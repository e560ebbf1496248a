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

//! Periodic pump that assigns pending tasks to available workers.

use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::AssignmentStrategy;
use crate::protocol::DispatcherFrame;
use crate::registry::Registry;
use crate::store::{Store, Task, Worker};

const TICK_PERIOD: Duration = Duration::from_secs(5);

pub struct Scheduler {
    store: Arc<dyn Store>,
    registry: Arc<Registry>,
    strategy: AssignmentStrategy,
    lock: Mutex<()>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn Store>, registry: Arc<Registry>, strategy: AssignmentStrategy) -> Self {
        Self {
            store,
            registry,
            strategy,
            lock: Mutex::new(()),
        }
    }

    /// Runs the pump until `cancel` fires. Spawn this as its own task.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(TICK_PERIOD);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = self.tick().await {
                        if err.is_retryable() {
                            tracing::warn!(error = %err, "scheduler tick failed, will retry next tick");
                        } else {
                            tracing::error!(error = %err, "scheduler tick failed");
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    tracing::info!("scheduler pump stopping");
                    break;
                }
            }
        }
    }

    pub async fn tick(&self) -> crate::error::Result<()> {
        let _guard = self.lock.lock().await;

        let mut pending = self
            .store
            .get_tasks_by_status(crate::store::TaskStatus::Pending)
            .await?;
        pending.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        if pending.is_empty() {
            return Ok(());
        }

        let mut candidates = self.store.get_available_workers().await?;

        for task in pending {
            if candidates.is_empty() {
                break;
            }

            let Some(chosen_id) = select_worker(self.strategy, &task, &candidates) else {
                continue;
            };

            let assigned = self.store.assign_task_to_worker(&task.id, &chosen_id).await?;
            if !assigned {
                continue;
            }

            if let Some(worker) = candidates.iter_mut().find(|w| w.id == chosen_id) {
                worker.used_slots += 1;
            }
            candidates.retain(|w| w.available_slots() > 0);

            if let Some(updated) = self.store.get_task(&task.id).await? {
                self.registry
                    .send(&chosen_id, DispatcherFrame::AddTask { task: updated });
            }
        }

        Ok(())
    }
}

/// Picks a worker for `task` from `candidates` (all known to have spare
/// capacity) according to `strategy`. Returns `None` only if `candidates`
/// is empty.
fn select_worker(strategy: AssignmentStrategy, task: &Task, candidates: &[Worker]) -> Option<String> {
    if candidates.is_empty() {
        return None;
    }

    match strategy {
        AssignmentStrategy::LeastLoaded => least_loaded(candidates),
        AssignmentStrategy::RoundRobin => candidates.first().map(|w| w.id.clone()),
        AssignmentStrategy::Random => candidates.choose(&mut rand::thread_rng()).map(|w| w.id.clone()),
        AssignmentStrategy::Tags => select_by_tags(task, candidates),
    }
}

fn least_loaded(candidates: &[Worker]) -> Option<String> {
    candidates
        .iter()
        .min_by(|a, b| {
            a.load_percentage()
                .partial_cmp(&b.load_percentage())
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|w| w.id.clone())
}

fn select_by_tags(task: &Task, candidates: &[Worker]) -> Option<String> {
    let task_tags = task
        .options
        .get("tags")
        .and_then(|v| v.as_object())
        .cloned();

    let Some(task_tags) = task_tags else {
        return least_loaded(candidates);
    };
    if task_tags.is_empty() {
        return least_loaded(candidates);
    }

    let matching: Vec<&Worker> = candidates
        .iter()
        .filter(|w| {
            let worker_tags = w.capabilities.get("tags").and_then(|v| v.as_object());
            match worker_tags {
                Some(worker_tags) => task_tags
                    .iter()
                    .all(|(k, v)| worker_tags.get(k) == Some(v)),
                None => false,
            }
        })
        .collect();

    if matching.is_empty() {
        return least_loaded(candidates);
    }

    matching
        .into_iter()
        .min_by(|a, b| {
            a.load_percentage()
                .partial_cmp(&b.load_percentage())
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|w| w.id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, TaskPriority};
    use std::collections::HashMap;

    #[tokio::test]
    async fn tick_assigns_highest_priority_first() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let registry = Arc::new(Registry::new());
        let worker = store
            .register_worker("h".into(), "127.0.0.1".into(), 6800, HashMap::new(), 1)
            .await
            .unwrap();
        let _low = store
            .create_task("https://example.com/low".into(), HashMap::new(), TaskPriority::Low)
            .await
            .unwrap();
        let urgent = store
            .create_task(
                "https://example.com/urgent".into(),
                HashMap::new(),
                TaskPriority::Urgent,
            )
            .await
            .unwrap();

        let scheduler = Scheduler::new(store.clone(), registry, AssignmentStrategy::LeastLoaded);
        scheduler.tick().await.unwrap();

        let worker = store.get_worker(&worker.id).await.unwrap().unwrap();
        assert_eq!(worker.current_tasks, vec![urgent.id.clone()]);
    }

    #[tokio::test]
    async fn tags_strategy_falls_back_to_least_loaded_without_match() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let registry = Arc::new(Registry::new());
        store
            .register_worker("h".into(), "127.0.0.1".into(), 6800, HashMap::new(), 1)
            .await
            .unwrap();
        let mut options = HashMap::new();
        options.insert("tags".to_string(), serde_json::json!({"region": "eu"}));
        store
            .create_task("https://example.com/a".into(), options, TaskPriority::Normal)
            .await
            .unwrap();

        let scheduler = Scheduler::new(store.clone(), registry, AssignmentStrategy::Tags);
        scheduler.tick().await.unwrap();

        let tasks = store.get_all_tasks().await.unwrap();
        assert_eq!(tasks[0].status, crate::store::TaskStatus::Queued);
    }

    #[tokio::test]
    async fn tick_is_noop_with_no_pending_tasks() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let registry = Arc::new(Registry::new());
        let scheduler = Scheduler::new(store, registry, AssignmentStrategy::LeastLoaded);
        scheduler.tick().await.unwrap();
    }
}
