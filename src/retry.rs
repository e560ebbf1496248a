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

//! Periodic pump that promotes eligible `failed` tasks back to `pending`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::store::{Store, TaskPatch, TaskStatus};

const TICK_PERIOD: Duration = Duration::from_secs(60);

pub struct RetryController {
    store: Arc<dyn Store>,
    max_retries: u32,
    retry_delay: chrono::Duration,
}

impl RetryController {
    pub fn new(store: Arc<dyn Store>, max_retries: u32, retry_delay_secs: u64) -> Self {
        Self {
            store,
            max_retries,
            retry_delay: chrono::Duration::seconds(retry_delay_secs as i64),
        }
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(TICK_PERIOD);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = self.tick().await {
                        if err.is_retryable() {
                            tracing::warn!(error = %err, "retry tick failed, will retry next tick");
                        } else {
                            tracing::error!(error = %err, "retry tick failed");
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    tracing::info!("retry controller stopping");
                    break;
                }
            }
        }
    }

    pub async fn tick(&self) -> crate::error::Result<()> {
        let now = Utc::now();
        let failed = self.store.get_tasks_by_status(TaskStatus::Failed).await?;

        for task in failed {
            let retry_count = task.retry_count();
            if retry_count >= self.max_retries {
                continue;
            }
            if now - task.updated_at < self.retry_delay {
                continue;
            }

            let mut options = task.options.clone();
            options.insert(
                "retry_count".to_string(),
                serde_json::Value::from(retry_count + 1),
            );

            tracing::info!(task_id = %task.id, attempt = retry_count + 1, "requeuing failed task");
            self.store
                .update_task(
                    &task.id,
                    TaskPatch {
                        status: Some(TaskStatus::Pending),
                        worker_id: Some(None),
                        engine_gid: Some(None),
                        error_message: Some(None),
                        options: Some(options),
                        ..Default::default()
                    },
                )
                .await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, TaskPriority};
    use std::collections::HashMap;

    #[tokio::test]
    async fn eligible_failed_task_is_requeued_with_incremented_retry_count() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let task = store
            .create_task("https://example.com/a".into(), HashMap::new(), TaskPriority::Normal)
            .await
            .unwrap();
        store
            .update_task(
                &task.id,
                TaskPatch {
                    status: Some(TaskStatus::Failed),
                    error_message: Some(Some("boom".into())),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let controller = RetryController::new(store.clone(), 3, 0);
        controller.tick().await.unwrap();

        let task = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count(), 1);
        assert!(task.error_message.is_none());
    }

    #[tokio::test]
    async fn task_at_max_retries_is_left_failed() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let mut options = HashMap::new();
        options.insert("retry_count".to_string(), serde_json::json!(3));
        let task = store
            .create_task("https://example.com/a".into(), options, TaskPriority::Normal)
            .await
            .unwrap();
        store
            .update_task(
                &task.id,
                TaskPatch {
                    status: Some(TaskStatus::Failed),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let controller = RetryController::new(store.clone(), 3, 0);
        controller.tick().await.unwrap();

        let task = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn recently_failed_task_waits_out_the_delay() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let task = store
            .create_task("https://example.com/a".into(), HashMap::new(), TaskPriority::Normal)
            .await
            .unwrap();
        store
            .update_task(
                &task.id,
                TaskPatch {
                    status: Some(TaskStatus::Failed),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let controller = RetryController::new(store.clone(), 3, 3600);
        controller.tick().await.unwrap();

        let task = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
    }
}
