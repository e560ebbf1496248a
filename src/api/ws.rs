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

//! `GET /ws/worker/{worker_id}` — the persistent channel a worker opens
//! against the dispatcher.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use super::AppState;
use crate::protocol::{handle_worker_message, DispatcherFrame};
use crate::store::{WorkerPatch, WorkerStatus};

const POLICY_VIOLATION: u16 = 1008;

pub async fn worker_websocket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(worker_id): Path<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, worker_id))
}

async fn handle_socket(mut socket: WebSocket, state: AppState, worker_id: String) {
    let exists = match state.store.get_worker(&worker_id).await {
        Ok(worker) => worker.is_some(),
        Err(err) => {
            tracing::error!(worker_id, error = %err, "failed to look up worker for ws handshake");
            false
        }
    };

    if !exists {
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: POLICY_VIOLATION,
                reason: "Worker not found".into(),
            })))
            .await;
        return;
    }

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<DispatcherFrame>();
    state.registry.connect(&worker_id, outbound_tx.clone());

    if let Err(err) = state.store.update_worker_heartbeat(&worker_id).await {
        tracing::error!(worker_id, error = %err, "failed to record initial heartbeat");
    }

    match state.store.get_tasks_by_worker(&worker_id).await {
        Ok(tasks) if !tasks.is_empty() => {
            let _ = outbound_tx.send(DispatcherFrame::InitialTasks { tasks });
        }
        Ok(_) => {}
        Err(err) => tracing::error!(worker_id, error = %err, "failed to load initial tasks"),
    }

    let (mut sink, mut stream) = socket.split();

    let write_task = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(err) => {
                    tracing::error!(error = %err, "failed to serialize outbound frame");
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let store = state.store.clone();
    let read_worker_id = worker_id.clone();
    let read_task = tokio::spawn(async move {
        while let Some(Ok(message)) = stream.next().await {
            if let Message::Text(text) = message {
                if let Err(err) = handle_worker_message(store.as_ref(), &read_worker_id, &text).await {
                    tracing::warn!(worker_id = %read_worker_id, error = %err, "dropping malformed worker frame");
                }
            }
        }
    });

    tokio::select! {
        _ = write_task => {}
        _ = read_task => {}
    }

    tracing::info!(worker_id, "worker disconnected");
    state.registry.disconnect(&worker_id, &outbound_tx);

    if let Ok(Some(worker)) = state.store.get_worker(&worker_id).await {
        if worker.status != WorkerStatus::Offline {
            let _ = state
                .store
                .update_worker(
                    &worker_id,
                    WorkerPatch {
                        status: Some(WorkerStatus::Offline),
                        ..Default::default()
                    },
                )
                .await;
        }
    }
}
