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

//! The HTTP and WebSocket surface, built on `axum`.
//!
//! [`AppState`] is the dispatcher's composition root: built once in
//! `main`, cloned cheaply (its fields are all `Arc`s) into every handler
//! and pump. There is no ambient global state anywhere else in the crate.

pub mod auth;
pub mod status;
pub mod tasks;
pub mod workers;
pub mod ws;

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::Method;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::error::DispatcherError;
use crate::registry::Registry;
use crate::store::Store;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub registry: Arc<Registry>,
    pub config: Arc<Config>,
}

async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, DispatcherError> {
    auth::verify_api_key(&state.config.security, request.headers())?;
    Ok(next.run(request).await)
}

pub fn build_router(state: AppState) -> Router {
    let origins: Vec<_> = state
        .config
        .cors
        .allowed_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(tower_http::cors::Any)
        .allow_origin(AllowOrigin::list(origins));

    Router::new()
        .route("/tasks", post(tasks::create_task).get(tasks::list_tasks))
        .route(
            "/tasks/{task_id}",
            get(tasks::get_task)
                .put(tasks::update_task)
                .delete(tasks::delete_task),
        )
        .route("/workers", post(workers::register_worker).get(workers::list_workers))
        .route(
            "/workers/{worker_id}",
            get(workers::get_worker)
                .put(workers::update_worker)
                .delete(workers::delete_worker),
        )
        .route("/status", get(status::system_status))
        .route("/api/status", get(status::system_status))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key))
        // the worker channel authenticates by worker id existing in the store, not by API key
        .route("/ws/worker/{worker_id}", get(ws::worker_websocket))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
