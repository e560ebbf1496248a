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

//! The JSON frame schema exchanged over a worker's persistent channel,
//! and the logic that applies worker-originated frames to the store.

use serde::{Deserialize, Serialize};

use crate::error::{DispatcherError, Result};
use crate::store::{Store, Task, TaskPatch, TaskStatus, WorkerPatch};

/// Frames sent from the dispatcher to a worker.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DispatcherFrame {
    InitialTasks { tasks: Vec<Task> },
    AddTask { task: Task },
    CancelTask { task_id: String },
    PauseTask { task_id: String },
    ResumeTask { task_id: String },
}

/// Frames received from a worker. Unknown actions deserialize as
/// [`WorkerFrame::Unknown`] rather than failing, so a single malformed
/// frame never closes the connection.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum WorkerFrame {
    Heartbeat {
        #[serde(default)]
        status: Option<String>,
        #[serde(default)]
        used_slots: Option<u32>,
        #[serde(default)]
        health_metrics: Option<crate::store::HealthMetrics>,
        #[serde(default)]
        performance_stats: Option<crate::store::PerformanceStats>,
    },
    TaskUpdate {
        task_id: String,
        #[serde(default)]
        status: Option<String>,
        #[serde(default)]
        progress: Option<f64>,
        #[serde(default)]
        download_speed: Option<i64>,
        #[serde(default)]
        engine_gid: Option<String>,
        #[serde(default)]
        error_message: Option<String>,
        #[serde(default)]
        result: Option<serde_json::Value>,
    },
    WorkerUpdate {
        #[serde(default)]
        capabilities: Option<std::collections::HashMap<String, serde_json::Value>>,
        #[serde(default)]
        total_slots: Option<u32>,
        #[serde(default)]
        used_slots: Option<u32>,
    },
    #[serde(other)]
    Unknown,
}

/// Applies a single inbound frame from `worker_id` to the store. Returns
/// a [`DispatcherError::Protocol`] for malformed JSON or an unrecognized
/// action; this function itself never panics on malformed worker-supplied
/// data, and callers are expected to log the error and keep the
/// connection open rather than treat it as fatal.
pub async fn handle_worker_message(store: &dyn Store, worker_id: &str, message: &str) -> Result<()> {
    let frame: WorkerFrame = serde_json::from_str(message)
        .map_err(|err| DispatcherError::protocol(format!("invalid JSON from worker: {err}")))?;

    match frame {
        WorkerFrame::Heartbeat {
            status,
            used_slots,
            health_metrics,
            performance_stats,
        } => {
            if let Err(err) = store.update_worker_heartbeat(worker_id).await {
                tracing::error!(worker_id, error = %err, "failed to update heartbeat");
                return Ok(());
            }

            let patch = WorkerPatch {
                status: status.as_deref().and_then(crate::store::WorkerStatus::from_str),
                used_slots,
                health_metrics,
                performance_stats,
                ..Default::default()
            };
            if patch.status.is_some()
                || patch.used_slots.is_some()
                || patch.health_metrics.is_some()
                || patch.performance_stats.is_some()
            {
                if let Err(err) = store.update_worker(worker_id, patch).await {
                    tracing::error!(worker_id, error = %err, "failed to apply heartbeat patch");
                }
            }
        }

        WorkerFrame::TaskUpdate {
            task_id,
            status,
            progress,
            download_speed,
            engine_gid,
            error_message,
            result,
        } => {
            let Some(task) = store.get_task(&task_id).await.ok().flatten() else {
                tracing::error!(worker_id, task_id, "unknown task in task_update");
                return Ok(());
            };
            let _ = task;

            let parsed_status = status.as_deref().and_then(TaskStatus::from_str);
            let patch = TaskPatch {
                status: parsed_status,
                progress,
                download_speed: download_speed.map(Some),
                engine_gid: engine_gid.map(Some),
                error_message: error_message.map(Some),
                result: result.map(Some),
                ..Default::default()
            };
            if let Err(err) = store.update_task(&task_id, patch).await {
                tracing::error!(worker_id, task_id, error = %err, "failed to apply task_update");
                return Ok(());
            }

            if let Some(status) = parsed_status {
                if status.is_final() {
                    if let Err(err) = store.unassign_task_from_worker(&task_id).await {
                        tracing::error!(worker_id, task_id, error = %err, "failed to unassign finished task");
                    }
                }
            }
        }

        WorkerFrame::WorkerUpdate {
            capabilities,
            total_slots,
            used_slots,
        } => {
            if capabilities.is_none() && total_slots.is_none() && used_slots.is_none() {
                return Ok(());
            }
            let patch = WorkerPatch {
                capabilities,
                total_slots,
                used_slots,
                ..Default::default()
            };
            if let Err(err) = store.update_worker(worker_id, patch).await {
                tracing::error!(worker_id, error = %err, "failed to apply worker_update");
            }
        }

        WorkerFrame::Unknown => {
            return Err(DispatcherError::protocol(format!("unknown action from worker: {message}")));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, TaskPriority};
    use std::collections::HashMap;

    #[tokio::test]
    async fn task_update_to_failed_unassigns_from_worker() {
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

        let msg = serde_json::json!({
            "action": "task_update",
            "task_id": task.id,
            "status": "failed",
            "error_message": "connection reset"
        })
        .to_string();
        handle_worker_message(&store, &worker.id, &msg).await.unwrap();

        let task = store.get_task(&task.id).await.unwrap().unwrap();
        assert!(task.worker_id.is_none());
        assert_eq!(task.status, TaskStatus::Failed);

        let worker = store.get_worker(&worker.id).await.unwrap().unwrap();
        assert_eq!(worker.used_slots, 0);
    }

    #[tokio::test]
    async fn malformed_json_is_reported_without_panicking() {
        let store = MemoryStore::new();
        let err = handle_worker_message(&store, "w1", "not json").await.unwrap_err();
        assert!(matches!(err, DispatcherError::Protocol(_)));
    }

    #[tokio::test]
    async fn unknown_action_is_reported_as_protocol_error() {
        let store = MemoryStore::new();
        let err = handle_worker_message(&store, "w1", r#"{"action": "mystery"}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatcherError::Protocol(_)));
    }
}
