//! Maintenance drain state.
//!
//! `Active` → `Draining` is one-way for the life of the process. Admission
//! refuses every new reservation once draining, and the sweeper ends the
//! process when the last session is gone.

use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DrainState {
    #[default]
    Active,
    Draining,
}

#[derive(Debug, Default)]
pub struct MaintenanceDrain {
    draining: AtomicBool,
}

impl MaintenanceDrain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> DrainState {
        if self.is_draining() {
            DrainState::Draining
        } else {
            DrainState::Active
        }
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Enter draining. Returns `true` only for the call that made the transition.
    pub fn enter(&self) -> bool {
        !self.draining.swap(true, Ordering::AcqRel)
    }
}
