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

//! `/workers` and `/workers/{worker_id}` handlers.

use std::collections::HashMap;

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;

use super::AppState;
use crate::error::{DispatcherError, Result};
use crate::store::{HealthMetrics, PerformanceStats, TaskPatch, TaskStatus, Worker, WorkerPatch, WorkerStatus};

#[derive(Debug, Deserialize)]
pub struct RegisterWorkerRequest {
    pub hostname: String,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub capabilities: HashMap<String, serde_json::Value>,
    #[serde(default = "default_total_slots")]
    pub total_slots: u32,
}

fn default_total_slots() -> u32 {
    5
}

pub async fn register_worker(
    State(state): State<AppState>,
    Json(body): Json<RegisterWorkerRequest>,
) -> Result<Json<Worker>> {
    let worker = state
        .store
        .register_worker(
            body.hostname,
            body.address,
            body.port,
            body.capabilities,
            body.total_slots,
        )
        .await?;
    Ok(Json(worker))
}

pub async fn list_workers(State(state): State<AppState>) -> Result<Json<Vec<Worker>>> {
    Ok(Json(state.store.get_all_workers().await?))
}

pub async fn get_worker(
    State(state): State<AppState>,
    Path(worker_id): Path<String>,
) -> Result<Json<Worker>> {
    state
        .store
        .get_worker(&worker_id)
        .await?
        .map(Json)
        .ok_or_else(|| DispatcherError::not_found("worker", worker_id))
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateWorkerRequest {
    pub status: Option<WorkerStatus>,
    pub current_tasks: Option<Vec<String>>,
    pub used_slots: Option<u32>,
    pub capabilities: Option<HashMap<String, serde_json::Value>>,
    pub total_slots: Option<u32>,
    pub health_metrics: Option<HealthMetrics>,
    pub performance_stats: Option<PerformanceStats>,
}

pub async fn update_worker(
    State(state): State<AppState>,
    Path(worker_id): Path<String>,
    Json(body): Json<UpdateWorkerRequest>,
) -> Result<Json<Worker>> {
    let patch = WorkerPatch {
        status: body.status,
        current_tasks: body.current_tasks,
        used_slots: body.used_slots,
        capabilities: body.capabilities,
        total_slots: body.total_slots,
        health_metrics: body.health_metrics,
        performance_stats: body.performance_stats,
    };

    state
        .store
        .update_worker(&worker_id, patch)
        .await?
        .map(Json)
        .ok_or_else(|| DispatcherError::not_found("worker", worker_id))
}

pub async fn delete_worker(
    State(state): State<AppState>,
    Path(worker_id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let worker = state
        .store
        .get_worker(&worker_id)
        .await?
        .ok_or_else(|| DispatcherError::not_found("worker", worker_id.clone()))?;

    for task_id in &worker.current_tasks {
        state.store.unassign_task_from_worker(task_id).await?;
        state
            .store
            .update_task(
                task_id,
                TaskPatch {
                    status: Some(TaskStatus::Pending),
                    ..Default::default()
                },
            )
            .await?;
    }

    if !state.store.delete_worker(&worker_id).await? {
        return Err(DispatcherError::internal("failed to delete worker"));
    }

    Ok(Json(serde_json::json!({ "message": format!("Worker {worker_id} deleted") })))
}
