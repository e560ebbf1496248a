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

//! Periodic pump that demotes silent workers to offline, returns their
//! in-flight tasks to `pending`, and optionally garbage-collects workers
//! that have been offline for too long.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::store::{Store, TaskPatch, TaskStatus, WorkerPatch, WorkerStatus};

pub struct LivenessMonitor {
    store: Arc<dyn Store>,
    heartbeat_interval: Duration,
    heartbeat_timeout: chrono::Duration,
    auto_remove_offline: bool,
    offline_threshold: chrono::Duration,
}

impl LivenessMonitor {
    pub fn new(
        store: Arc<dyn Store>,
        heartbeat_interval_secs: u64,
        heartbeat_timeout_secs: u64,
        auto_remove_offline: bool,
        offline_threshold_secs: u64,
    ) -> Self {
        Self {
            store,
            heartbeat_interval: Duration::from_secs(heartbeat_interval_secs),
            heartbeat_timeout: chrono::Duration::seconds(heartbeat_timeout_secs as i64),
            auto_remove_offline,
            offline_threshold: chrono::Duration::seconds(offline_threshold_secs as i64),
        }
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.heartbeat_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = self.tick().await {
                        if err.is_retryable() {
                            tracing::warn!(error = %err, "liveness tick failed, will retry next tick");
                        } else {
                            tracing::error!(error = %err, "liveness tick failed");
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    tracing::info!("liveness monitor stopping");
                    break;
                }
            }
        }
    }

    pub async fn tick(&self) -> crate::error::Result<()> {
        let now = Utc::now();
        let workers = self.store.get_all_workers().await?;

        for worker in workers {
            let silent_for = now - worker.last_heartbeat;

            if silent_for > self.heartbeat_timeout && worker.status != WorkerStatus::Offline {
                tracing::warn!(worker_id = %worker.id, "worker heartbeat timed out, marking offline");
                self.store
                    .update_worker(
                        &worker.id,
                        WorkerPatch {
                            status: Some(WorkerStatus::Offline),
                            ..Default::default()
                        },
                    )
                    .await?;

                for task_id in &worker.current_tasks {
                    self.store.unassign_task_from_worker(task_id).await?;
                    self.store
                        .update_task(
                            task_id,
                            TaskPatch {
                                status: Some(TaskStatus::Pending),
                                ..Default::default()
                            },
                        )
                        .await?;
                }
                continue;
            }

            if self.auto_remove_offline
                && worker.status == WorkerStatus::Offline
                && silent_for > self.offline_threshold
            {
                tracing::info!(worker_id = %worker.id, "removing long-offline worker");
                self.store.delete_worker(&worker.id).await?;
            }
        }

        Ok(())
    }
}
