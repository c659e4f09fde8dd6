//! Reservation admission.
//!
//! A reservation moves 2..=8 identifiers from the pool into the registry as one
//! peer group. Checks run cheapest first and each refusal has its own kind:
//!
//! 1. credential → `Unauthorized`
//! 2. group size → `InvalidAmount`
//! 3. drain / disabled tunnel → `ServiceUnavailable`
//! 4. per-source quota → `TooManyRequests`
//! 5. capacity, 6. pool exhaustion → `ServiceUnavailable`
//!
//! Steps 4 to 6, registration and the quota increment run under the slot
//! lock, so concurrent reservations and sweeps see either the whole group or
//! none of it, and one address can never exceed its quota.

use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use subtle::ConstantTimeEq;

use crate::config::{MAX_GROUP_SIZE, MIN_GROUP_SIZE};
use crate::drain::MaintenanceDrain;
use crate::pool::{IdentifierPool, SlotId};
use crate::rate_limit::SourceRateLimiter;
use crate::registry::{ClientRegistry, PeerGroup, Session};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnavailableReason {
    Draining,
    Disabled,
    AtCapacity,
    PoolExhausted,
}

impl std::fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            UnavailableReason::Draining => "maintenance in progress",
            UnavailableReason::Disabled => "tunnel disabled pending configuration",
            UnavailableReason::AtCapacity => "not enough free slots",
            UnavailableReason::PoolExhausted => "identifier pool exhausted",
        };
        f.write_str(reason)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReserveError {
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Invalid amount requested: {0} (must be 2..=8)")]
    InvalidAmount(i64),
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(UnavailableReason),
    #[error("Too many requests from this address")]
    TooManyRequests,
    #[error("Internal error: {0}")]
    Internal(String),
}

/// One parsed reservation request.
#[derive(Debug, Clone, Copy)]
pub struct ReservationRequest<'a> {
    pub source: IpAddr,
    pub amount: i64,
    pub credential: Option<&'a str>,
}

/// Configuration values a reservation is checked against, snapshotted once
/// per request.
#[derive(Debug, Clone, Default)]
pub struct AdmissionPolicy {
    pub password: Option<String>,
    pub max_clients: usize,
    pub ip_limit: u32,
    pub tunnel_enabled: bool,
}

impl AdmissionPolicy {
    fn credential_ok(&self, supplied: Option<&str>) -> bool {
        match (&self.password, supplied) {
            (None, _) => true,
            (Some(expected), Some(given)) => expected.as_bytes().ct_eq(given.as_bytes()).into(),
            (Some(_), None) => false,
        }
    }
}

/// Pool and registry, always locked together.
#[derive(Debug)]
pub struct SlotTable {
    pub pool: IdentifierPool,
    pub registry: ClientRegistry,
}

impl SlotTable {
    /// Remove a session and return its identifier to the pool.
    pub fn release(&mut self, id: SlotId) -> Option<Arc<Session>> {
        let session = self.registry.remove(id)?;
        self.pool.give(id);
        Some(session)
    }
}

/// Counts read in one critical section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotCounts {
    pub in_use: usize,
    pub pool_available: usize,
}

pub struct AdmissionController {
    slots: Mutex<SlotTable>,
    limiter: SourceRateLimiter,
    drain: MaintenanceDrain,
}

impl AdmissionController {
    pub fn new(pool: IdentifierPool) -> Self {
        Self {
            slots: Mutex::new(SlotTable {
                pool,
                registry: ClientRegistry::new(),
            }),
            limiter: SourceRateLimiter::new(),
            drain: MaintenanceDrain::new(),
        }
    }

    /// Lock the slot table. A poisoned lock is recovered: every mutation
    /// leaves the table consistent before it can panic.
    pub fn slots(&self) -> MutexGuard<'_, SlotTable> {
        match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Slot table mutex poisoned - recovering");
                poisoned.into_inner()
            }
        }
    }

    pub fn limiter(&self) -> &SourceRateLimiter {
        &self.limiter
    }

    pub fn drain(&self) -> &MaintenanceDrain {
        &self.drain
    }

    pub fn reserve(
        &self,
        request: &ReservationRequest<'_>,
        policy: &AdmissionPolicy,
        now: Instant,
    ) -> Result<Vec<SlotId>, ReserveError> {
        if !policy.credential_ok(request.credential) {
            tracing::info!(source = %request.source, "Request was unauthorized");
            return Err(ReserveError::Unauthorized);
        }

        if !(MIN_GROUP_SIZE..=MAX_GROUP_SIZE).contains(&request.amount) {
            tracing::info!(
                source = %request.source,
                amount = request.amount,
                "Request had invalid requested amount"
            );
            return Err(ReserveError::InvalidAmount(request.amount));
        }
        // In range, so the cast cannot truncate.
        let amount = request.amount as usize;

        if self.drain.is_draining() {
            tracing::info!(source = %request.source, "New game denied: maintenance in progress");
            return Err(ReserveError::ServiceUnavailable(UnavailableReason::Draining));
        }

        if !policy.tunnel_enabled {
            tracing::info!(source = %request.source, "New game denied: tunnel disabled");
            return Err(ReserveError::ServiceUnavailable(UnavailableReason::Disabled));
        }

        let reserved = {
            let mut slots = self.slots();

            // Seen under the lock, so a sweep that finds the registry empty
            // while draining cannot race this registration.
            if self.drain.is_draining() {
                return Err(ReserveError::ServiceUnavailable(UnavailableReason::Draining));
            }

            // Checked and recorded under the slot lock: every grant for an
            // address is serialized with every other check for it.
            if !self
                .limiter
                .check(request.source, policy.ip_limit)
                .is_allowed()
            {
                tracing::info!(
                    source = %request.source,
                    limit = policy.ip_limit,
                    "Address exceeded reservation limit"
                );
                return Err(ReserveError::TooManyRequests);
            }

            if slots.registry.len() + amount > policy.max_clients {
                tracing::info!(
                    source = %request.source,
                    amount,
                    in_use = slots.registry.len(),
                    max_clients = policy.max_clients,
                    "Request wanted more than we could provide"
                );
                return Err(ReserveError::ServiceUnavailable(
                    UnavailableReason::AtCapacity,
                ));
            }

            let Some(reserved) = slots.pool.take_many(amount) else {
                tracing::warn!(
                    source = %request.source,
                    amount,
                    available = slots.pool.len(),
                    "Request passed capacity check but the pool is exhausted"
                );
                return Err(ReserveError::ServiceUnavailable(
                    UnavailableReason::PoolExhausted,
                ));
            };

            register_group(&mut slots, &reserved, now)?;
            if policy.ip_limit > 0 {
                self.limiter.record(request.source, now);
            }
            reserved
        };

        tracing::info!(source = %request.source, slots = ?reserved, "Slots allocated");
        Ok(reserved)
    }

    pub fn lookup(&self, id: SlotId) -> Option<Arc<Session>> {
        self.slots().registry.get(id)
    }

    pub fn touch(&self, id: SlotId, now: Instant) -> bool {
        self.slots().registry.touch(id, now)
    }

    pub fn counts(&self) -> SlotCounts {
        let slots = self.slots();
        SlotCounts {
            in_use: slots.registry.len(),
            pool_available: slots.pool.len(),
        }
    }
}

/// Register every member of a freshly taken group, or roll the whole group
/// back into the pool.
fn register_group(
    slots: &mut SlotTable,
    reserved: &[SlotId],
    now: Instant,
) -> Result<(), ReserveError> {
    let peers = PeerGroup::new(reserved);

    for (index, &id) in reserved.iter().enumerate() {
        if let Err(e) = slots
            .registry
            .register(Session::new(id, peers.clone(), now))
        {
            tracing::error!(slot = id, error = %e, "Bug: pool handed out an allocated slot");
            for &done in &reserved[..index] {
                slots.registry.remove(done);
            }
            // The conflicting identifier already has a live session; only the
            // others go back to the pool.
            slots
                .pool
                .give_all(reserved.iter().copied().filter(|other| *other != id));
            return Err(ReserveError::Internal(e.to_string()));
        }
    }
    Ok(())
}
