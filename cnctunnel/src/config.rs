//! Runtime configuration.
//!
//! [`TunnelConfig`] is what the admin UI reads and writes. [`Limits`] is fixed
//! at startup.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Largest peer group a single reservation may ask for.
pub const MAX_GROUP_SIZE: i64 = 8;
/// Smallest peer group: a relay session always has two ends.
pub const MIN_GROUP_SIZE: i64 = 2;

/// Operator-editable service configuration.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelConfig {
    pub server_name: String,
    /// Password game clients must present on `/request`. `None` means open.
    #[serde(default, deserialize_with = "empty_as_none")]
    pub server_password: Option<String>,
    pub admin_username: String,
    pub admin_password: String,
    pub max_clients: usize,
    /// Advertised relay port.
    pub port: u16,
    #[serde(default)]
    pub tunnel_enabled: bool,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            server_name: "Unnamed server".to_string(),
            server_password: None,
            admin_username: "admin".to_string(),
            admin_password: "admin".to_string(),
            max_clients: 200,
            port: 50001,
            tunnel_enabled: true,
        }
    }
}

// Passwords are never written to logs.
impl std::fmt::Debug for TunnelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelConfig")
            .field("server_name", &self.server_name)
            .field("server_password", &self.server_password.as_ref().map(|_| "***"))
            .field("admin_username", &self.admin_username)
            .field("max_clients", &self.max_clients)
            .field("port", &self.port)
            .field("tunnel_enabled", &self.tunnel_enabled)
            .finish()
    }
}

fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.is_empty()))
}

/// Startup-only admission and lifecycle limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Reservation groups one source address may hold per window. 0 disables.
    pub ip_limit: u32,
    /// Sessions silent for longer than this are reclaimed.
    pub idle_timeout: Duration,
    /// Rate-limit windows older than this are reset.
    pub lock_window: Duration,
    pub sweep_interval: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            ip_limit: 0,
            idle_timeout: Duration::from_secs(60),
            lock_window: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(5),
        }
    }
}
