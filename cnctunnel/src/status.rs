//! Status types for external reporting.

use serde::Serialize;

/// Point-in-time slot usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    /// `max_clients - slots_in_use`, floored at zero.
    pub slots_free: usize,
    pub slots_in_use: usize,
    /// Identifiers physically left in the pool.
    pub pool_available: usize,
    pub max_clients: usize,
    pub draining: bool,
    pub tunnel_enabled: bool,
}

impl StatusSnapshot {
    /// Plain-text form served on `/status`.
    pub fn to_text(&self) -> String {
        format!(
            "{} slots free.\n{} slots in use.\n",
            self.slots_free, self.slots_in_use
        )
    }
}

/// Admin UI status payload.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UiStatus {
    pub slots_free: usize,
    pub slots_in_use: usize,
    pub server_log: Vec<String>,
}
