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

//! `/status` and `/api/status` — a snapshot of cluster-wide state.

use axum::extract::State;
use axum::Json;

use super::AppState;
use crate::error::Result;
use crate::store::{SystemStatus, WorkerStatus};

pub async fn system_status(State(state): State<AppState>) -> Result<Json<SystemStatus>> {
    let online = state.store.get_workers_by_status(WorkerStatus::Online).await?.len();
    let busy = state.store.get_workers_by_status(WorkerStatus::Busy).await?.len();

    let total_tasks = state.store.get_all_tasks().await?.len();
    let tasks_by_status = state.store.get_task_counts_by_status().await?;
    let system_load = state.store.get_system_load().await?;

    Ok(Json(SystemStatus {
        active_workers: online + busy,
        total_tasks,
        tasks_by_status,
        system_load,
    }))
}
