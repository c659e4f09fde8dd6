//! HTTP transport.

mod routes;
mod server;

pub use routes::{API_KEY_HEADER, LoginRequest, LoginResponse, SlotRequestQuery, routes};
pub use server::{ServerConfig, serve};
