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

//! Typed configuration, loaded from a JSON file with environment overrides.
//!
//! A missing config file is not an error: every field has a default, so
//! the dispatcher can run unconfigured out of the box.

use std::path::Path;

use serde::{Deserialize, Serialize};

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_cors_origins() -> Vec<String> {
    vec!["http://localhost:8080".to_string()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub cors: CorsConfig,
    pub security: SecurityConfig,
    pub database: DatabaseConfig,
    pub task_assignment: TaskAssignmentConfig,
    pub worker_management: WorkerManagementConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors: CorsConfig::default(),
            security: SecurityConfig::default(),
            database: DatabaseConfig::default(),
            task_assignment: TaskAssignmentConfig::default(),
            worker_management: WorkerManagementConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: default_cors_origins(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SecurityConfig {
    pub api_key_required: bool,
    pub api_keys: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    Memory,
    Sqlite,
}

impl Default for DatabaseType {
    fn default() -> Self {
        Self::Memory
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    #[serde(rename = "type")]
    pub kind: DatabaseType,
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            kind: DatabaseType::Memory,
            path: "data/dispatcher.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStrategy {
    LeastLoaded,
    RoundRobin,
    Random,
    Tags,
}

impl Default for AssignmentStrategy {
    fn default() -> Self {
        Self::LeastLoaded
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskAssignmentConfig {
    pub strategy: AssignmentStrategy,
    pub max_retries: u32,
    pub retry_delay: u64,
}

impl Default for TaskAssignmentConfig {
    fn default() -> Self {
        Self {
            strategy: AssignmentStrategy::default(),
            max_retries: 3,
            retry_delay: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerManagementConfig {
    pub heartbeat_interval: u64,
    pub heartbeat_timeout: u64,
    pub auto_remove_offline: bool,
    pub offline_threshold: u64,
}

impl Default for WorkerManagementConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: 30,
            heartbeat_timeout: 90,
            auto_remove_offline: true,
            offline_threshold: 300,
        }
    }
}

impl Config {
    /// Loads configuration from `path`, falling back to defaults for a
    /// missing or unparsable file. Environment variables `DISPATCHER_DB_TYPE`
    /// and `DISPATCHER_DB_PATH` override whatever the file (or the default)
    /// says about the database backend.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<Config>(&contents) {
                Ok(config) => config,
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "failed to parse config file, using defaults");
                    Config::default()
                }
            },
            Err(err) => {
                tracing::info!(path = %path.display(), error = %err, "config file not found, using defaults");
                Config::default()
            }
        };

        if let Ok(db_type) = std::env::var("DISPATCHER_DB_TYPE") {
            config.database.kind = match db_type.to_lowercase().as_str() {
                "sqlite" => DatabaseType::Sqlite,
                _ => DatabaseType::Memory,
            };
        }
        if let Ok(db_path) = std::env::var("DISPATCHER_DB_PATH") {
            config.database.path = db_path;
        }

        config
    }

    /// Resolves the config path from `CONFIG_PATH`, defaulting to
    /// `config/dispatcher.json`, and loads it.
    pub fn load_from_env() -> Self {
        let path =
            std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config/dispatcher.json".to_string());
        Self::load(path)
    }
}
