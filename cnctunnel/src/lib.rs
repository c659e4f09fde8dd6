//! cnctunnel: slot admission and lifecycle control plane for a game peer-relay tunnel.

mod drain;
mod rate_limit;
mod recent_logs;
mod status;
mod version;

pub mod admission;
pub mod auth;
pub mod config;
pub mod master;
pub mod pool;
pub mod registry;
pub mod service;
pub mod sweeper;
pub mod transport;

pub use admission::{AdmissionController, ReserveError, UnavailableReason};
pub use auth::AuthError;
pub use config::{Limits, MAX_GROUP_SIZE, MIN_GROUP_SIZE, TunnelConfig};
pub use drain::{DrainState, MaintenanceDrain};
pub use master::{DirectoryNotifier, MasterClient, MasterConfig, NotifyError, TunnelAdvert};
pub use pool::{IdentifierPool, SLOT_SPACE, SlotId};
pub use rate_limit::{RateDecision, RateLimitEntry, SourceRateLimiter};
pub use recent_logs::RecentLogs;
pub use registry::{ClientRegistry, PeerGroup, RegistryError, Session};
pub use service::{ConfigChange, TunnelService};
pub use status::{StatusSnapshot, UiStatus};
pub use sweeper::{LifecycleSweeper, SweepOutcome, SweepReport};
pub use version::VERSION;
