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

//! Task and worker data models shared by every [`crate::store::Store`] backend.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Queued,
    Downloading,
    Completed,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Downloading => "downloading",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "queued" => Some(Self::Queued),
            "downloading" => Some(Self::Downloading),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }

    /// Terminal statuses unassign a task from its worker whenever a
    /// `task_update` frame reports them.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    pub fn all() -> [Self; 6] {
        [
            Self::Pending,
            Self::Queued,
            Self::Downloading,
            Self::Completed,
            Self::Failed,
            Self::Canceled,
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(i32)]
pub enum TaskPriority {
    Low = 1,
    Normal = 2,
    High = 3,
    Urgent = 4,
}

impl Default for TaskPriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl TaskPriority {
    pub fn from_i32(v: i32) -> Self {
        match v {
            1 => Self::Low,
            3 => Self::High,
            4 => Self::Urgent,
            _ => Self::Normal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Online,
    Busy,
    Offline,
    Error,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Busy => "busy",
            Self::Offline => "offline",
            Self::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "online" => Some(Self::Online),
            "busy" => Some(Self::Busy),
            "offline" => Some(Self::Offline),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn all() -> [Self; 4] {
        [Self::Online, Self::Busy, Self::Offline, Self::Error]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthMetrics {
    #[serde(default)]
    pub cpu_usage: f64,
    #[serde(default)]
    pub memory_usage: f64,
    #[serde(default)]
    pub disk_usage: f64,
    #[serde(default)]
    pub network_rx: i64,
    #[serde(default)]
    pub network_tx: i64,
    #[serde(default)]
    pub error_count: i64,
    #[serde(default)]
    pub success_count: i64,
    #[serde(default)]
    pub uptime: i64,
}

impl Default for HealthMetrics {
    fn default() -> Self {
        Self {
            cpu_usage: 0.0,
            memory_usage: 0.0,
            disk_usage: 0.0,
            network_rx: 0,
            network_tx: 0,
            error_count: 0,
            success_count: 0,
            uptime: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceStats {
    #[serde(default)]
    pub avg_download_speed: i64,
    #[serde(default)]
    pub peak_download_speed: i64,
    #[serde(default)]
    pub total_bytes_downloaded: i64,
    #[serde(default)]
    pub completed_tasks: i64,
    #[serde(default)]
    pub failed_tasks: i64,
}

impl Default for PerformanceStats {
    fn default() -> Self {
        Self {
            avg_download_speed: 0,
            peak_download_speed: 0,
            total_bytes_downloaded: 0,
            completed_tasks: 0,
            failed_tasks: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub worker_id: Option<String>,
    pub engine_gid: Option<String>,
    #[serde(default)]
    pub options: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub progress: f64,
    pub download_speed: Option<i64>,
    pub error_message: Option<String>,
    pub result: Option<serde_json::Value>,
}

impl Task {
    pub fn new(
        id: String,
        url: String,
        priority: TaskPriority,
        options: HashMap<String, serde_json::Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            url,
            created_at: now,
            updated_at: now,
            status: TaskStatus::Pending,
            priority,
            worker_id: None,
            engine_gid: None,
            options,
            progress: 0.0,
            download_speed: None,
            error_message: None,
            result: None,
        }
    }

    pub fn retry_count(&self) -> u32 {
        self.options
            .get("retry_count")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32
    }
}

/// Partial update applied to a [`Task`]. `None` fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub priority: Option<TaskPriority>,
    pub worker_id: Option<Option<String>>,
    pub engine_gid: Option<Option<String>>,
    pub options: Option<HashMap<String, serde_json::Value>>,
    pub progress: Option<f64>,
    pub download_speed: Option<Option<i64>>,
    pub error_message: Option<Option<String>>,
    pub result: Option<Option<serde_json::Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: String,
    pub hostname: String,
    pub address: String,
    pub port: u16,
    pub status: WorkerStatus,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default)]
    pub capabilities: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub current_tasks: Vec<String>,
    pub total_slots: u32,
    pub used_slots: u32,
    pub health_metrics: HealthMetrics,
    #[serde(default)]
    pub error_history: Vec<serde_json::Value>,
    pub performance_stats: PerformanceStats,
}

impl Worker {
    pub fn new(
        id: String,
        hostname: String,
        address: String,
        port: u16,
        capabilities: HashMap<String, serde_json::Value>,
        total_slots: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            hostname,
            address,
            port,
            status: WorkerStatus::Online,
            connected_at: now,
            last_heartbeat: now,
            capabilities,
            current_tasks: Vec::new(),
            total_slots,
            used_slots: 0,
            health_metrics: HealthMetrics::default(),
            error_history: Vec::new(),
            performance_stats: PerformanceStats::default(),
        }
    }

    pub fn available_slots(&self) -> u32 {
        self.total_slots.saturating_sub(self.used_slots)
    }

    pub fn load_percentage(&self) -> f64 {
        if self.total_slots == 0 {
            100.0
        } else {
            (self.used_slots as f64 / self.total_slots as f64) * 100.0
        }
    }

    pub fn health_score(&self) -> f64 {
        let cpu_score = (100.0 - self.health_metrics.cpu_usage).max(0.0);
        let memory_score = (100.0 - self.health_metrics.memory_usage).max(0.0);
        let disk_score = (100.0 - self.health_metrics.disk_usage).max(0.0);

        let total_tasks =
            self.performance_stats.completed_tasks + self.performance_stats.failed_tasks;
        let reliability_score = if total_tasks > 0 {
            (self.performance_stats.completed_tasks as f64 / total_tasks as f64) * 100.0
        } else {
            100.0
        };

        let score =
            cpu_score * 0.25 + memory_score * 0.25 + disk_score * 0.25 + reliability_score * 0.25;
        (score * 100.0).round() / 100.0
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self.status, WorkerStatus::Online | WorkerStatus::Busy)
            && self.health_score() >= 50.0
            && self.health_metrics.error_count < 10
    }
}

/// Partial update applied to a [`Worker`]. `None` fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerPatch {
    pub status: Option<WorkerStatus>,
    pub current_tasks: Option<Vec<String>>,
    pub used_slots: Option<u32>,
    pub capabilities: Option<HashMap<String, serde_json::Value>>,
    pub total_slots: Option<u32>,
    pub health_metrics: Option<HealthMetrics>,
    pub performance_stats: Option<PerformanceStats>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStatus {
    pub active_workers: usize,
    pub total_tasks: usize,
    pub tasks_by_status: HashMap<String, usize>,
    pub system_load: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn available_slots_never_negative() {
        let mut w = Worker::new(
            "w1".into(),
            "h".into(),
            "127.0.0.1".into(),
            1234,
            HashMap::new(),
            2,
        );
        w.used_slots = 5;
        assert_eq!(w.available_slots(), 0);
    }

    #[test]
    fn load_percentage_full_when_zero_slots() {
        let w = Worker::new(
            "w1".into(),
            "h".into(),
            "127.0.0.1".into(),
            1234,
            HashMap::new(),
            0,
        );
        assert_eq!(w.load_percentage(), 100.0);
    }

    #[test]
    fn health_score_defaults_to_perfect_with_no_history() {
        let w = Worker::new(
            "w1".into(),
            "h".into(),
            "127.0.0.1".into(),
            1234,
            HashMap::new(),
            5,
        );
        assert_eq!(w.health_score(), 100.0);
        assert!(w.is_healthy());
    }

    #[test]
    fn task_status_round_trips_through_str() {
        for status in TaskStatus::all() {
            assert_eq!(TaskStatus::from_str(status.as_str()), Some(status));
        }
    }
}
