//! Per-source-address reservation quota.
//!
//! The check runs before a reservation and the increment only after a
//! successful one, so requests refused for capacity or maintenance never
//! consume quota. Entries are dropped by the sweeper once their window has
//! passed, whatever their count.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitEntry {
    /// First successful reservation in the current window.
    pub first_request: Instant,
    /// Reservation groups granted in the current window.
    pub groups: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Denied,
}

impl RateDecision {
    pub fn is_allowed(self) -> bool {
        self == RateDecision::Allowed
    }
}

/// Tracks outstanding reservation groups per source address.
#[derive(Debug, Default)]
pub struct SourceRateLimiter {
    entries: DashMap<IpAddr, RateLimitEntry>,
}

impl SourceRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// `limit == 0` disables rate limiting.
    pub fn check(&self, addr: IpAddr, limit: u32) -> RateDecision {
        if limit == 0 {
            return RateDecision::Allowed;
        }
        match self.entries.get(&addr) {
            Some(entry) if entry.groups >= limit => RateDecision::Denied,
            _ => RateDecision::Allowed,
        }
    }

    /// Count one granted reservation group for `addr`.
    pub fn record(&self, addr: IpAddr, now: Instant) -> u32 {
        let mut entry = self.entries.entry(addr).or_insert(RateLimitEntry {
            first_request: now,
            groups: 0,
        });
        entry.groups = entry.groups.saturating_add(1);
        entry.groups
    }

    /// Drop entries whose window started more than `window` ago.
    pub fn expire(&self, now: Instant, window: Duration) -> Vec<IpAddr> {
        let stale: Vec<IpAddr> = self
            .entries
            .iter()
            .filter(|e| now.saturating_duration_since(e.first_request) > window)
            .map(|e| *e.key())
            .collect();

        // Age is re-checked under the shard lock at removal time.
        stale
            .into_iter()
            .filter(|addr| {
                self.entries
                    .remove_if(addr, |_, e| {
                        now.saturating_duration_since(e.first_request) > window
                    })
                    .is_some()
            })
            .collect()
    }

    pub fn get(&self, addr: IpAddr) -> Option<RateLimitEntry> {
        self.entries.get(&addr).map(|e| *e)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
