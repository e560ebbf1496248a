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

//! End-to-end scenarios that exercise the scheduler, liveness monitor,
//! and retry controller against both store backends without a real
//! network transport.

use std::collections::HashMap;
use std::sync::Arc;

use dispatcher::config::AssignmentStrategy;
use dispatcher::liveness::LivenessMonitor;
use dispatcher::protocol::handle_worker_message;
use dispatcher::registry::Registry;
use dispatcher::retry::RetryController;
use dispatcher::scheduler::Scheduler;
use dispatcher::store::{MemoryStore, SqliteStore, Store, TaskPriority, TaskStatus, WorkerStatus};

async fn backends() -> Vec<(&'static str, Arc<dyn Store>)> {
    vec![
        ("memory", Arc::new(MemoryStore::new())),
        ("sqlite", Arc::new(SqliteStore::new_in_memory().await.unwrap())),
    ]
}

#[tokio::test]
async fn happy_path_assigns_and_completes() {
    for (name, store) in backends().await {
        let registry = Arc::new(Registry::new());
        let worker = store
            .register_worker("h".into(), "127.0.0.1".into(), 6800, HashMap::new(), 2)
            .await
            .unwrap();
        let task = store
            .create_task("https://example.com/a".into(), HashMap::new(), TaskPriority::Normal)
            .await
            .unwrap();

        let scheduler = Scheduler::new(store.clone(), registry, AssignmentStrategy::LeastLoaded);
        scheduler.tick().await.unwrap();

        let assigned = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(assigned.status, TaskStatus::Queued, "[{name}]");
        assert_eq!(assigned.worker_id.as_deref(), Some(worker.id.as_str()), "[{name}]");

        let msg = serde_json::json!({
            "action": "task_update",
            "task_id": task.id,
            "status": "completed",
            "progress": 100.0,
        })
        .to_string();
        handle_worker_message(store.as_ref(), &worker.id, &msg).await.unwrap();

        let completed = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(completed.status, TaskStatus::Completed, "[{name}]");
        assert!(completed.worker_id.is_none(), "[{name}]");

        let worker = store.get_worker(&worker.id).await.unwrap().unwrap();
        assert_eq!(worker.used_slots, 0, "[{name}]");
    }
}

#[tokio::test]
async fn capacity_cap_leaves_overflow_task_pending() {
    for (name, store) in backends().await {
        let registry = Arc::new(Registry::new());
        store
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

        let scheduler = Scheduler::new(store.clone(), registry, AssignmentStrategy::LeastLoaded);
        scheduler.tick().await.unwrap();

        let first = store.get_task(&t1.id).await.unwrap().unwrap();
        let second = store.get_task(&t2.id).await.unwrap().unwrap();
        let assigned_count = [&first, &second]
            .iter()
            .filter(|t| t.status == TaskStatus::Queued)
            .count();
        assert_eq!(assigned_count, 1, "[{name}]");
        let pending_count = [&first, &second]
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .count();
        assert_eq!(pending_count, 1, "[{name}]");
    }
}

#[tokio::test]
async fn heartbeat_timeout_orphans_tasks_for_rescheduling() {
    for (name, store) in backends().await {
        let registry = Arc::new(Registry::new());
        let worker = store
            .register_worker("h".into(), "127.0.0.1".into(), 6800, HashMap::new(), 1)
            .await
            .unwrap();
        let task = store
            .create_task("https://example.com/a".into(), HashMap::new(), TaskPriority::Normal)
            .await
            .unwrap();
        store.assign_task_to_worker(&task.id, &worker.id).await.unwrap();

        // A zero-second timeout makes any elapsed time "stale" without sleeping.
        let monitor = LivenessMonitor::new(store.clone(), 30, 0, false, 300);
        monitor.tick().await.unwrap();

        let worker = store.get_worker(&worker.id).await.unwrap().unwrap();
        assert_eq!(worker.status, WorkerStatus::Offline, "[{name}]");

        let task = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending, "[{name}]");
        assert!(task.worker_id.is_none(), "[{name}]");

        // Bring a second worker online and re-run the scheduler: the
        // orphaned task should be picked up again.
        let worker2 = store
            .register_worker("h2".into(), "127.0.0.1".into(), 6801, HashMap::new(), 1)
            .await
            .unwrap();
        let scheduler = Scheduler::new(store.clone(), registry, AssignmentStrategy::LeastLoaded);
        scheduler.tick().await.unwrap();

        let task = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(task.worker_id.as_deref(), Some(worker2.id.as_str()), "[{name}]");
    }
}

#[tokio::test]
async fn failed_task_is_retried_after_delay_and_bounded_by_max_retries() {
    for (name, store) in backends().await {
        let task = store
            .create_task("https://example.com/a".into(), HashMap::new(), TaskPriority::Normal)
            .await
            .unwrap();
        store
            .update_task(
                &task.id,
                dispatcher::store::TaskPatch {
                    status: Some(TaskStatus::Failed),
                    error_message: Some(Some("boom".into())),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let controller = RetryController::new(store.clone(), 1, 0);
        controller.tick().await.unwrap();

        let task = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending, "[{name}]");
        assert_eq!(task.retry_count(), 1, "[{name}]");

        store
            .update_task(
                &task.id,
                dispatcher::store::TaskPatch {
                    status: Some(TaskStatus::Failed),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        controller.tick().await.unwrap();

        let task = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed, "[{name}] max_retries should stop further retries");
    }
}

#[tokio::test]
async fn tag_affinity_prefers_matching_worker() {
    for (name, store) in backends().await {
        let registry = Arc::new(Registry::new());
        let mut eu_caps = HashMap::new();
        eu_caps.insert("tags".to_string(), serde_json::json!({"region": "eu"}));
        let eu_worker = store
            .register_worker("eu".into(), "127.0.0.1".into(), 6800, eu_caps, 5)
            .await
            .unwrap();
        let mut us_caps = HashMap::new();
        us_caps.insert("tags".to_string(), serde_json::json!({"region": "us"}));
        store
            .register_worker("us".into(), "127.0.0.1".into(), 6801, us_caps, 5)
            .await
            .unwrap();

        let mut options = HashMap::new();
        options.insert("tags".to_string(), serde_json::json!({"region": "eu"}));
        let task = store
            .create_task("https://example.com/a".into(), options, TaskPriority::Normal)
            .await
            .unwrap();

        let scheduler = Scheduler::new(store.clone(), registry, AssignmentStrategy::Tags);
        scheduler.tick().await.unwrap();

        let task = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(task.worker_id.as_deref(), Some(eu_worker.id.as_str()), "[{name}]");
    }
}

#[tokio::test]
async fn deleting_worker_returns_its_tasks_to_pending() {
    for (name, store) in backends().await {
        let worker = store
            .register_worker("h".into(), "127.0.0.1".into(), 6800, HashMap::new(), 2)
            .await
            .unwrap();
        let task = store
            .create_task("https://example.com/a".into(), HashMap::new(), TaskPriority::Normal)
            .await
            .unwrap();
        store.assign_task_to_worker(&task.id, &worker.id).await.unwrap();

        let worker = store.get_worker(&worker.id).await.unwrap().unwrap();
        for task_id in &worker.current_tasks {
            store.unassign_task_from_worker(task_id).await.unwrap();
            store
                .update_task(
                    task_id,
                    dispatcher::store::TaskPatch {
                        status: Some(TaskStatus::Pending),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }
        assert!(store.delete_worker(&worker.id).await.unwrap(), "[{name}]");

        let task = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending, "[{name}]");
        assert!(task.worker_id.is_none(), "[{name}]");
    }
}
