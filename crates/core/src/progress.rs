//! Per-session fan-out of job snapshots to WebSocket subscribers.

use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::jobs::JobSnapshot;

const CHANNEL_CAPACITY: usize = 64;

/// One broadcast channel per session. Publishing with no subscribers is
/// a no-op; slow subscribers lag and skip intermediate snapshots rather
/// than blocking the pipeline.
#[derive(Debug, Default)]
pub struct ProgressHub {
    channels: DashMap<String, broadcast::Sender<JobSnapshot>>,
}

impl ProgressHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, session_id: &str) -> broadcast::Receiver<JobSnapshot> {
        self.channels
            .entry(session_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub fn publish(&self, session_id: &str, snapshot: JobSnapshot) {
        if let Some(sender) = self.channels.get(session_id) {
            // Err here just means nobody is listening right now.
            let _ = sender.send(snapshot);
        }
    }

    /// Drop the channel for a disconnected session.
    pub fn remove_session(&self, session_id: &str) {
        self.channels.remove(session_id);
    }
}
