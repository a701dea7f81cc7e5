//! Diagnostics types shared by the server API and the status command

use serde::{Deserialize, Serialize};

/// One live session as reported by the diagnostics endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatusEntry {
    pub id: String,
    pub peer_address: String,
    pub client_descriptor: String,
    /// Milliseconds since the last inbound event
    pub idle_ms: u64,
    /// Milliseconds since the session registered
    pub connected_ms: u64,
}

/// Snapshot of the shared backing-store connection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub open: bool,
    pub open_for_ms: Option<u64>,
    /// Remaining time before the armed idle-close fires, if any
    pub idle_close_in_ms: Option<u64>,
    pub opens_total: u64,
    pub closes_total: u64,
    pub active_leases: usize,
}

/// Result of an operator-triggered disconnect
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectReport {
    pub disconnected: Vec<String>,
}
