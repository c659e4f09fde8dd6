//! Transport layer for cnctunnel.
//!
//! HTTP (axum) serves game clients' reservation requests, the plain status
//! page, the maintenance trigger and the admin UI API. The relay engine
//! talks to [`TunnelService`](crate::service::TunnelService) directly.

pub mod http;

pub use http::{ServerConfig, serve};
