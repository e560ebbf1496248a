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

//! `/tasks` and `/tasks/{task_id}` handlers.

use std::collections::HashMap;

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;

use super::AppState;
use crate::error::{DispatcherError, Result};
use crate::protocol::DispatcherFrame;
use crate::store::{Task, TaskPatch, TaskPriority, TaskStatus};

fn validate_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub url: String,
    #[serde(default)]
    pub priority: Option<TaskPriority>,
    #[serde(default)]
    pub options: HashMap<String, serde_json::Value>,
}

pub async fn create_task(
    State(state): State<AppState>,
    Json(body): Json<CreateTaskRequest>,
) -> Result<Json<Task>> {
    if !validate_url(&body.url) {
        return Err(DispatcherError::validation("invalid URL format"));
    }

    let task = state
        .store
        .create_task(body.url, body.options, body.priority.unwrap_or_default())
        .await?;
    Ok(Json(task))
}

pub async fn list_tasks(State(state): State<AppState>) -> Result<Json<Vec<Task>>> {
    Ok(Json(state.store.get_all_tasks().await?))
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<Task>> {
    state
        .store
        .get_task(&task_id)
        .await?
        .map(Json)
        .ok_or_else(|| DispatcherError::not_found("task", task_id))
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateTaskRequest {
    pub status: Option<TaskStatus>,
    pub priority: Option<TaskPriority>,
    pub worker_id: Option<String>,
    pub engine_gid: Option<String>,
    pub progress: Option<f64>,
    pub download_speed: Option<i64>,
    pub error_message: Option<String>,
    pub result: Option<serde_json::Value>,
}

pub async fn update_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Json(body): Json<UpdateTaskRequest>,
) -> Result<Json<Task>> {
    let patch = TaskPatch {
        status: body.status,
        priority: body.priority,
        worker_id: body.worker_id.map(Some),
        engine_gid: body.engine_gid.map(Some),
        progress: body.progress,
        download_speed: body.download_speed.map(Some),
        error_message: body.error_message.map(Some),
        result: body.result.map(Some),
        ..Default::default()
    };

    state
        .store
        .update_task(&task_id, patch)
        .await?
        .map(Json)
        .ok_or_else(|| DispatcherError::not_found("task", task_id))
}

pub async fn delete_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let task = state
        .store
        .get_task(&task_id)
        .await?
        .ok_or_else(|| DispatcherError::not_found("task", task_id.clone()))?;

    if let Some(worker_id) = &task.worker_id {
        if matches!(task.status, TaskStatus::Queued | TaskStatus::Downloading) {
            if let Some(worker) = state.store.get_worker(worker_id).await? {
                if worker.status != crate::store::WorkerStatus::Offline {
                    state.registry.send(
                        worker_id,
                        DispatcherFrame::CancelTask {
                            task_id: task_id.clone(),
                        },
                    );
                }
            }
        }
        state.store.unassign_task_from_worker(&task_id).await?;
    }

    if !state.store.delete_task(&task_id).await? {
        return Err(DispatcherError::internal("failed to delete task"));
    }

    Ok(Json(serde_json::json!({ "message": format!("Task {task_id} deleted") })))
}
