//! Client registry: the allocated half of the slot space.
//!
//! A key in the registry means the identifier is in use. Sessions are shared
//! as `Arc<Session>` so the relay engine can keep a lookup result while the
//! registry itself stays behind the admission lock.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::pool::SlotId;

/// Identifiers allocated together in one reservation.
///
/// Computed once and shared by every session of the group; each member is
/// part of its own group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerGroup(Arc<[SlotId]>);

impl PeerGroup {
    pub fn new(ids: &[SlotId]) -> Self {
        Self(Arc::from(ids))
    }

    pub fn contains(&self, id: SlotId) -> bool {
        self.0.contains(&id)
    }

    pub fn ids(&self) -> &[SlotId] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Live state for one allocated identifier.
#[derive(Debug)]
pub struct Session {
    id: SlotId,
    peers: PeerGroup,
    last_activity: Mutex<Instant>,
    /// Bound on first relay contact, not at reservation time.
    address: Mutex<Option<SocketAddr>>,
}

fn lock_cell<T>(cell: &Mutex<T>) -> MutexGuard<'_, T> {
    cell.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Session {
    pub fn new(id: SlotId, peers: PeerGroup, now: Instant) -> Self {
        Self {
            id,
            peers,
            last_activity: Mutex::new(now),
            address: Mutex::new(None),
        }
    }

    pub fn id(&self) -> SlotId {
        self.id
    }

    pub fn peers(&self) -> &PeerGroup {
        &self.peers
    }

    /// Whether `other` was allocated in the same reservation.
    pub fn is_peer(&self, other: SlotId) -> bool {
        self.peers.contains(other)
    }

    pub fn last_activity(&self) -> Instant {
        *lock_cell(&self.last_activity)
    }

    pub fn touch(&self, now: Instant) {
        let mut last = lock_cell(&self.last_activity);
        // Relay threads may report out of order; never move activity backwards.
        if now > *last {
            *last = now;
        }
    }

    pub fn address(&self) -> Option<SocketAddr> {
        *lock_cell(&self.address)
    }

    /// First write wins. Returns `true` if this call bound the address.
    pub fn bind_address(&self, addr: SocketAddr) -> bool {
        let mut address = lock_cell(&self.address);
        if address.is_some() {
            return false;
        }
        *address = Some(addr);
        true
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("slot {0} is already registered")]
    AlreadyRegistered(SlotId),
}

/// Map of allocated identifiers to their sessions.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    sessions: HashMap<SlotId, Arc<Session>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, session: Session) -> Result<(), RegistryError> {
        let id = session.id();
        if self.sessions.contains_key(&id) {
            return Err(RegistryError::AlreadyRegistered(id));
        }
        self.sessions.insert(id, Arc::new(session));
        Ok(())
    }

    /// Record activity on `id`. Returns `false` if the identifier is not allocated.
    pub fn touch(&self, id: SlotId, now: Instant) -> bool {
        match self.sessions.get(&id) {
            Some(session) => {
                session.touch(now);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: SlotId) -> Option<Arc<Session>> {
        self.sessions.get(&id).cloned()
    }

    pub fn remove(&mut self, id: SlotId) -> Option<Arc<Session>> {
        self.sessions.remove(&id)
    }

    pub fn contains(&self, id: SlotId) -> bool {
        self.sessions.contains_key(&id)
    }

    /// Identifiers whose sessions have been silent for longer than `timeout`.
    pub fn expired(&self, now: Instant, timeout: Duration) -> Vec<SlotId> {
        self.sessions
            .iter()
            .filter(|(_, session)| session.idle_for(now) > timeout)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = SlotId> + '_ {
        self.sessions.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: SlotId, group: &[SlotId], now: Instant) -> Session {
        Session::new(id, PeerGroup::new(group), now)
    }

    #[test]
    fn register_and_get() {
        let now = Instant::now();
        let mut registry = ClientRegistry::new();
        registry.register(session(5, &[5, 6], now)).unwrap();

        let found = registry.get(5).expect("registered session");
        assert_eq!(found.id(), 5);
        assert!(found.is_peer(5));
        assert!(found.is_peer(6));
        assert!(!found.is_peer(7));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn double_register_is_rejected() {
        let now = Instant::now();
        let mut registry = ClientRegistry::new();
        registry.register(session(1, &[1, 2], now)).unwrap();

        let err = registry.register(session(1, &[1, 3], now)).unwrap_err();
        assert_eq!(err, RegistryError::AlreadyRegistered(1));
        // Original session is untouched.
        assert!(registry.get(1).unwrap().is_peer(2));
    }

    #[test]
    fn touch_unknown_slot_reports_not_found() {
        let registry = ClientRegistry::new();
        assert!(!registry.touch(42, Instant::now()));
    }

    #[test]
    fn touch_never_moves_activity_backwards() {
        let start = Instant::now();
        let s = session(1, &[1, 2], start + Duration::from_secs(10));
        s.touch(start);
        assert_eq!(s.last_activity(), start + Duration::from_secs(10));
        s.touch(start + Duration::from_secs(20));
        assert_eq!(s.last_activity(), start + Duration::from_secs(20));
    }

    #[test]
    fn expired_uses_strict_timeout() {
        let start = Instant::now();
        let mut registry = ClientRegistry::new();
        registry.register(session(1, &[1, 2], start)).unwrap();
        registry.register(session(2, &[1, 2], start)).unwrap();
        registry.touch(2, start + Duration::from_secs(30));

        let timeout = Duration::from_secs(60);
        assert!(
            registry
                .expired(start + Duration::from_secs(60), timeout)
                .is_empty()
        );
        assert_eq!(
            registry.expired(start + Duration::from_secs(61), timeout),
            vec![1]
        );
    }

    #[test]
    fn bind_address_is_lazy() {
        let s = session(1, &[1, 2], Instant::now());
        assert!(s.address().is_none());

        let addr: SocketAddr = "203.0.113.9:50000".parse().unwrap();
        assert!(s.bind_address(addr));
        assert_eq!(s.address(), Some(addr));
    }

    #[test]
    fn bind_address_keeps_first_contact() {
        let s = session(1, &[1, 2], Instant::now());
        let first: SocketAddr = "203.0.113.9:50000".parse().unwrap();
        let second: SocketAddr = "203.0.113.77:61000".parse().unwrap();

        assert!(s.bind_address(first));
        assert!(!s.bind_address(second));
        assert_eq!(s.address(), Some(first));
    }

    #[test]
    fn remove_returns_session() {
        let mut registry = ClientRegistry::new();
        registry
            .register(session(9, &[9, 10], Instant::now()))
            .unwrap();

        let removed = registry.remove(9).unwrap();
        assert_eq!(removed.id(), 9);
        assert!(registry.is_empty());
        assert!(registry.remove(9).is_none());
    }
}
