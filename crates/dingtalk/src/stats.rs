use std::{
    sync::{Arc, RwLock},
    time::SystemTime,
};

use {serde::Serialize, tokio::sync::watch};

/// Lifecycle state of the stream connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
            Self::Error => "error",
        }
    }
}

/// Point-in-time copy of the connection statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStats {
    pub status: ConnectionStatus,
    pub connected_at: Option<SystemTime>,
    pub last_error: Option<String>,
    /// Reconnects scheduled since the manager was created.
    pub reconnect_count: u64,
    pub messages_received: u64,
    pub messages_sent: u64,
}

/// Shared handle to the live statistics of one connection manager.
///
/// The outbound sender holds a clone to count sends; status changes are
/// also published on a watch channel.
#[derive(Clone)]
pub struct StatsHandle {
    stats: Arc<RwLock<ConnectionStats>>,
    status_tx: Arc<watch::Sender<ConnectionStatus>>,
}

impl Default for StatsHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsHandle {
    pub fn new() -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            stats: Arc::new(RwLock::new(ConnectionStats::default())),
            status_tx: Arc::new(status_tx),
        }
    }

    pub fn snapshot(&self) -> ConnectionStats {
        self.stats.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.stats.read().unwrap_or_else(|e| e.into_inner()).status
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    /// Mutate the stats; a status change is broadcast to subscribers.
    pub(crate) fn update(&self, f: impl FnOnce(&mut ConnectionStats)) {
        let status = {
            let mut stats = self.stats.write().unwrap_or_else(|e| e.into_inner());
            f(&mut stats);
            stats.status
        };
        self.status_tx.send_if_modified(|current| {
            let changed = *current != status;
            *current = status;
            changed
        });
    }

    pub(crate) fn set_status(&self, status: ConnectionStatus) {
        self.update(|s| s.status = status);
    }

    pub(crate) fn record_received(&self) {
        self.update(|s| s.messages_received += 1);
    }

    pub(crate) fn record_sent(&self) {
        self.update(|s| s.messages_sent += 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_is_a_copy() {
        let handle = StatsHandle::new();
        let before = handle.snapshot();
        handle.record_received();
        handle.record_sent();
        assert_eq!(before.messages_received, 0);
        let after = handle.snapshot();
        assert_eq!(after.messages_received, 1);
        assert_eq!(after.messages_sent, 1);
    }

    #[test]
    fn status_changes_are_published() {
        let handle = StatsHandle::new();
        let mut rx = handle.subscribe();
        assert!(!rx.has_changed().unwrap());
        handle.record_sent();
        assert!(!rx.has_changed().unwrap());
        handle.set_status(ConnectionStatus::Connecting);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), ConnectionStatus::Connecting);
    }
}
