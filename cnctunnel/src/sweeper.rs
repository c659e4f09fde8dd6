//! Periodic lifecycle sweep.
//!
//! Every tick: finish a drain if nothing is left, reclaim idle sessions,
//! forget expired rate-limit windows, then log a status line at debug level.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::pool::SlotId;
use crate::service::TunnelService;
use crate::status::StatusSnapshot;

/// What one sweep did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_slots: Vec<SlotId>,
    pub released_sources: Vec<IpAddr>,
    pub status: StatusSnapshot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepOutcome {
    Continue(SweepReport),
    /// Drain finished; shutdown has been signalled.
    Terminate,
}

pub struct LifecycleSweeper {
    service: Arc<TunnelService>,
    interval: Duration,
}

impl LifecycleSweeper {
    pub fn new(service: Arc<TunnelService>) -> Self {
        let interval = service.limits().sweep_interval;
        Self { service, interval }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn tick(&self, now: Instant) -> SweepOutcome {
        let admission = self.service.admission();
        let limits = self.service.limits();

        let expired_slots = {
            let mut slots = admission.slots();

            if admission.drain().is_draining() && slots.registry.is_empty() {
                drop(slots);
                tracing::info!("Tunnel empty, doing maintenance quit");
                self.service.trigger_shutdown();
                return SweepOutcome::Terminate;
            }

            let expired = slots.registry.expired(now, limits.idle_timeout);
            for &id in &expired {
                if let Some(session) = slots.release(id) {
                    tracing::info!(
                        slot = id,
                        idle_secs = session.idle_for(now).as_secs(),
                        "Client timed out"
                    );
                }
            }
            expired
        };

        let released_sources = admission.limiter().expire(now, limits.lock_window);
        for source in &released_sources {
            tracing::debug!(source = %source, "Rate limit window expired");
        }

        let status = self.service.status_snapshot();
        tracing::debug!(
            in_use = status.slots_in_use,
            max_clients = status.max_clients,
            pool_available = status.pool_available,
            draining = status.draining,
            tunnel_enabled = status.tunnel_enabled,
            "Tunnel status"
        );

        SweepOutcome::Continue(SweepReport {
            expired_slots,
            released_sources,
            status,
        })
    }

    /// Sweep until cancelled or the drain completes.
    pub async fn run(self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(interval_ms = self.interval.as_millis() as u64, "Sweeper started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Sweeper cancelled");
                    return;
                }
                _ = interval.tick() => {}
            }

            if let SweepOutcome::Terminate = self.tick(Instant::now()) {
                return;
            }
        }
    }
}
