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

//! Tracks which workers currently hold an open connection and lets the
//! rest of the dispatcher push frames to them without caring about
//! transport details.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::protocol::DispatcherFrame;

/// The sending half of a worker's outbound frame channel. Dropping it
/// closes the worker's socket.
pub type Connection = mpsc::UnboundedSender<DispatcherFrame>;

#[derive(Default)]
pub struct Registry {
    connections: Mutex<HashMap<String, Connection>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new connection for `worker_id`, evicting (and thereby
    /// closing) any connection already mapped to it.
    pub fn connect(&self, worker_id: &str, sender: Connection) {
        let mut connections = self.connections.lock().unwrap();
        if let Some(old) = connections.insert(worker_id.to_string(), sender) {
            tracing::info!(worker_id, "evicting stale connection on reconnect");
            drop(old);
        }
    }

    /// Removes the connection for `worker_id` if `sender` is still the
    /// one mapped there (a newer connection may have already replaced it).
    pub fn disconnect(&self, worker_id: &str, sender: &Connection) {
        let mut connections = self.connections.lock().unwrap();
        if let Some(current) = connections.get(worker_id) {
            if current.same_channel(sender) {
                connections.remove(worker_id);
            }
        }
    }

    pub fn is_connected(&self, worker_id: &str) -> bool {
        self.connections.lock().unwrap().contains_key(worker_id)
    }

    /// Sends `frame` to `worker_id`'s connection. A missing or broken
    /// connection is logged and treated as a no-op; callers never fail
    /// because a worker happened to be offline.
    pub fn send(&self, worker_id: &str, frame: DispatcherFrame) {
        let connections = self.connections.lock().unwrap();
        match connections.get(worker_id) {
            Some(sender) => {
                if sender.send(frame).is_err() {
                    tracing::warn!(worker_id, "worker channel closed, dropping frame");
                }
            }
            None => {
                tracing::debug!(worker_id, "no active connection, dropping frame");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_evicts_previous_connection() {
        let registry = Registry::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();

        registry.connect("w1", tx1);
        registry.connect("w1", tx2);

        assert!(rx1.try_recv().is_err());
        assert!(registry.is_connected("w1"));
    }

    #[test]
    fn send_to_unknown_worker_is_a_noop() {
        let registry = Registry::new();
        registry.send("ghost", DispatcherFrame::CancelTask { task_id: "t1".into() });
    }
}
