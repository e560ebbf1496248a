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

//! Crate-wide error type.
//!
//! Every fallible operation in the dispatcher returns [`Result<T>`]. The
//! [`DispatcherError`] variants map onto the error kinds handled by the
//! scheduler, the worker protocol, and the public API (which turns each
//! variant into an HTTP response via [`axum::response::IntoResponse`]).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DispatcherError>;

#[derive(Error, Debug)]
pub enum DispatcherError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("transient I/O error: {0}")]
    TransientIo(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("operator configuration problem: {0}")]
    OperatorConfig(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl DispatcherError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Whether the failed operation is safe to retry on the next pump tick
    /// without operator intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientIo(_) | Self::Database(_) | Self::Io(_)
        )
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::TransientIo(_) | Self::Database(_) | Self::Io(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::Protocol(_) => StatusCode::BAD_REQUEST,
            Self::OperatorConfig(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Serialization(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for DispatcherError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}
