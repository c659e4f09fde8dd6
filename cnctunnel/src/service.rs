//! TunnelService: transport-agnostic control plane.
//!
//! This service owns:
//! - Slot admission (pool + registry + rate limiter + drain state)
//! - Operator configuration and the tunnel-enabled gate
//! - Admin UI credentials
//! - Shutdown coordination once a maintenance drain completes
//!
//! Transports (HTTP today) and the relay engine hold an `Arc<TunnelService>`
//! and call into it; the [`LifecycleSweeper`](crate::sweeper::LifecycleSweeper)
//! runs against the same instance.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use tokio::sync::watch;

use crate::admission::{AdmissionController, AdmissionPolicy, ReservationRequest, ReserveError};
use crate::auth::{AdminAuth, AuthError};
use crate::config::{Limits, TunnelConfig};
use crate::master::{DirectoryNotifier, TunnelAdvert};
use crate::pool::{IdentifierPool, SlotId};
use crate::recent_logs::RecentLogs;
use crate::registry::Session;
use crate::status::{StatusSnapshot, UiStatus};

/// Result of [`TunnelService::apply_configuration`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigChange {
    /// New values stored; tunnel disabled until re-enabled.
    Applied,
    /// Submitted config had the tunnel off: only the disable took effect.
    Disabled,
}

pub struct TunnelService {
    admission: AdmissionController,
    config: RwLock<TunnelConfig>,
    limits: Limits,
    auth: AdminAuth,
    notifier: Option<Arc<dyn DirectoryNotifier>>,
    recent_logs: Option<RecentLogs>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl TunnelService {
    /// Create with a freshly shuffled identifier pool.
    pub fn new(config: TunnelConfig, limits: Limits) -> Self {
        let started = Instant::now();
        let pool = IdentifierPool::shuffled();
        tracing::info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Identifier pool initialized"
        );
        Self::with_pool(pool, config, limits)
    }

    pub fn with_pool(pool: IdentifierPool, config: TunnelConfig, limits: Limits) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            admission: AdmissionController::new(pool),
            config: RwLock::new(config),
            limits,
            auth: AdminAuth::new(),
            notifier: None,
            recent_logs: None,
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn DirectoryNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_recent_logs(mut self, logs: RecentLogs) -> Self {
        self.recent_logs = Some(logs);
        self
    }

    fn read_config(&self) -> RwLockReadGuard<'_, TunnelConfig> {
        self.config.read().unwrap_or_else(|poisoned| {
            tracing::error!("Config lock poisoned - recovering");
            poisoned.into_inner()
        })
    }

    fn write_config(&self) -> RwLockWriteGuard<'_, TunnelConfig> {
        self.config.write().unwrap_or_else(|poisoned| {
            tracing::error!("Config lock poisoned - recovering");
            poisoned.into_inner()
        })
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn reserve(
        &self,
        source: IpAddr,
        amount: i64,
        credential: Option<&str>,
    ) -> Result<Vec<SlotId>, ReserveError> {
        self.reserve_at(source, amount, credential, Instant::now())
    }

    /// Reserve with an explicit clock reading.
    ///
    /// The config read lock is held for the whole reservation, so
    /// `apply_configuration` never interleaves with one in flight.
    pub fn reserve_at(
        &self,
        source: IpAddr,
        amount: i64,
        credential: Option<&str>,
        now: Instant,
    ) -> Result<Vec<SlotId>, ReserveError> {
        let config = self.read_config();
        let policy = AdmissionPolicy {
            password: config.server_password.clone(),
            max_clients: config.max_clients,
            ip_limit: self.limits.ip_limit,
            tunnel_enabled: config.tunnel_enabled,
        };
        let request = ReservationRequest {
            source,
            amount,
            credential,
        };
        self.admission.reserve(&request, &policy, now)
    }

    /// Session for `id`, if allocated. Used by the relay engine to validate
    /// senders and recipients.
    pub fn lookup(&self, id: SlotId) -> Option<Arc<Session>> {
        self.admission.lookup(id)
    }

    pub fn touch(&self, id: SlotId) -> bool {
        self.touch_at(id, Instant::now())
    }

    pub fn touch_at(&self, id: SlotId, now: Instant) -> bool {
        self.admission.touch(id, now)
    }

    /// Record the relay address of `id` on first contact. Later contacts
    /// from other addresses leave the binding unchanged.
    ///
    /// Returns `false` if `id` is not allocated.
    pub fn bind_address(&self, id: SlotId, addr: SocketAddr) -> bool {
        match self.lookup(id) {
            Some(session) => {
                if session.bind_address(addr) {
                    tracing::debug!(slot = id, address = %addr, "Client address bound");
                }
                true
            }
            None => false,
        }
    }

    pub fn status_snapshot(&self) -> StatusSnapshot {
        let (max_clients, tunnel_enabled) = {
            let config = self.read_config();
            (config.max_clients, config.tunnel_enabled)
        };
        let counts = self.admission.counts();

        StatusSnapshot {
            slots_free: max_clients.saturating_sub(counts.in_use),
            slots_in_use: counts.in_use,
            pool_available: counts.pool_available,
            max_clients,
            draining: self.admission.drain().is_draining(),
            tunnel_enabled,
        }
    }

    pub fn ui_status(&self) -> UiStatus {
        let snapshot = self.status_snapshot();
        UiStatus {
            slots_free: snapshot.slots_free,
            slots_in_use: snapshot.slots_in_use,
            server_log: self.recent_logs(),
        }
    }

    pub fn recent_logs(&self) -> Vec<String> {
        self.recent_logs
            .as_ref()
            .map(RecentLogs::snapshot)
            .unwrap_or_default()
    }

    /// Stop accepting new games. Idempotent; returns `true` on the transition.
    ///
    /// The master notification is spawned and never awaited here.
    pub fn enter_maintenance(&self) -> bool {
        if !self.admission.drain().enter() {
            tracing::debug!("Maintenance already in progress");
            return false;
        }
        tracing::info!("Maintenance mode enabled, no new games can be started");

        if let Some(notifier) = self.notifier.clone() {
            let advert = self.advert(true);
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        match notifier.notify(&advert).await {
                            Ok(()) => tracing::info!("Master notified of maintenance"),
                            Err(e) => {
                                tracing::warn!(error = %e, "Failed to notify master of maintenance")
                            }
                        }
                    });
                }
                Err(_) => {
                    tracing::warn!("No async runtime - master not notified of maintenance");
                }
            }
        }
        true
    }

    pub fn is_draining(&self) -> bool {
        self.admission.drain().is_draining()
    }

    fn advert(&self, maintenance: bool) -> TunnelAdvert {
        let (name, has_password, port, max_clients) = {
            let config = self.read_config();
            (
                config.server_name.clone(),
                config.server_password.is_some(),
                config.port,
                config.max_clients,
            )
        };
        TunnelAdvert {
            name,
            has_password,
            port,
            clients: self.admission.counts().in_use,
            max_clients,
            maintenance,
        }
    }

    pub fn current_configuration(&self) -> TunnelConfig {
        self.read_config().clone()
    }

    /// Apply an operator configuration.
    ///
    /// The tunnel is always disabled first and stays disabled until
    /// [`enable_tunnel`](Self::enable_tunnel). Values are only stored when the
    /// submitted config has `tunnel_enabled` set.
    pub fn apply_configuration(&self, new: TunnelConfig) -> ConfigChange {
        let mut config = self.write_config();
        config.tunnel_enabled = false;

        if !new.tunnel_enabled {
            tracing::info!("Tunnel disabled, waiting for new configuration");
            return ConfigChange::Disabled;
        }

        let credentials_changed = config.admin_username != new.admin_username
            || config.admin_password != new.admin_password;
        *config = TunnelConfig {
            tunnel_enabled: false,
            ..new
        };
        tracing::info!(config = ?*config, "Config updated: enable the tunnel again to use it");
        drop(config);

        if credentials_changed {
            self.auth.revoke();
        }
        ConfigChange::Applied
    }

    pub fn enable_tunnel(&self) {
        let mut config = self.write_config();
        if !config.tunnel_enabled {
            config.tunnel_enabled = true;
            tracing::info!("Tunnel enabled");
        }
    }

    pub fn is_tunnel_enabled(&self) -> bool {
        self.read_config().tunnel_enabled
    }

    /// Admin UI login. Returns the API key for later calls.
    pub fn login(&self, username: &str, password_b64: &str) -> Result<String, AuthError> {
        let (admin_username, admin_password) = {
            let config = self.read_config();
            (config.admin_username.clone(), config.admin_password.clone())
        };
        let result = self
            .auth
            .login(username, password_b64, &admin_username, &admin_password);
        match &result {
            Ok(_) => tracing::info!(username, "Admin logged in"),
            Err(e) => tracing::warn!(username, error = %e, "Admin login failed"),
        }
        result
    }

    pub fn check_api_key(&self, key: &str) -> bool {
        self.auth.check(key)
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;

    use crate::admission::UnavailableReason;
    use crate::master::NotifyError;

    /// Notifier that records every advert it is handed.
    #[derive(Default)]
    struct RecordingNotifier {
        calls: AtomicUsize,
        last: StdMutex<Option<TunnelAdvert>>,
        fail: bool,
    }

    #[async_trait]
    impl DirectoryNotifier for RecordingNotifier {
        async fn notify(&self, advert: &TunnelAdvert) -> Result<(), NotifyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last.lock().unwrap() = Some(advert.clone());
            if self.fail {
                Err(NotifyError::Status(500))
            } else {
                Ok(())
            }
        }
    }

    fn addr(last: u8) -> IpAddr {
        IpAddr::from([203, 0, 113, last])
    }

    fn service() -> TunnelService {
        TunnelService::with_pool(
            IdentifierPool::from_ids(0..1000),
            TunnelConfig::default(),
            Limits::default(),
        )
    }

    #[tokio::test]
    async fn reserve_then_lookup_round_trip() {
        let svc = service();
        let ids = svc.reserve(addr(1), 3, None).unwrap();

        for &id in &ids {
            let session = svc.lookup(id).unwrap();
            assert_eq!(session.peers().ids(), ids.as_slice());
        }
        assert!(svc.touch(ids[0]));
        assert!(!svc.touch(5000));
    }

    #[tokio::test]
    async fn status_reports_free_against_max_clients() {
        let svc = service();
        svc.reserve(addr(1), 4, None).unwrap();

        let status = svc.status_snapshot();
        assert_eq!(status.slots_in_use, 4);
        assert_eq!(status.slots_free, 196);
        assert_eq!(status.pool_available, 996);
        assert!(!status.draining);
        assert!(status.tunnel_enabled);
    }

    #[tokio::test]
    async fn password_from_config_is_enforced() {
        let svc = TunnelService::with_pool(
            IdentifierPool::from_ids(0..100),
            TunnelConfig {
                server_password: Some("pw".to_string()),
                ..Default::default()
            },
            Limits::default(),
        );

        assert_eq!(
            svc.reserve(addr(1), 2, None),
            Err(ReserveError::Unauthorized)
        );
        assert!(svc.reserve(addr(1), 2, Some("pw")).is_ok());
    }

    #[tokio::test]
    async fn maintenance_refuses_everything_and_notifies_once() {
        let notifier = Arc::new(RecordingNotifier::default());
        let svc = service().with_notifier(notifier.clone());
        svc.reserve(addr(1), 2, None).unwrap();

        assert!(svc.enter_maintenance());
        assert!(!svc.enter_maintenance());

        for amount in 2..=8 {
            assert_eq!(
                svc.reserve(addr(9), amount, None),
                Err(ReserveError::ServiceUnavailable(UnavailableReason::Draining))
            );
        }

        tokio::time::timeout(Duration::from_secs(1), async {
            while notifier.calls.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("master was not notified");

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 1);

        let advert = notifier.last.lock().unwrap().clone().unwrap();
        assert!(advert.maintenance);
        assert_eq!(advert.clients, 2);
        assert_eq!(advert.max_clients, 200);
    }

    #[tokio::test]
    async fn failed_notification_does_not_block_drain() {
        let notifier = Arc::new(RecordingNotifier {
            fail: true,
            ..Default::default()
        });
        let svc = service().with_notifier(notifier);

        assert!(svc.enter_maintenance());
        assert!(svc.is_draining());
        assert!(svc.status_snapshot().draining);
    }

    #[test]
    fn maintenance_without_runtime_still_drains() {
        let svc = service().with_notifier(Arc::new(RecordingNotifier::default()));
        assert!(svc.enter_maintenance());
        assert!(svc.is_draining());
    }

    #[tokio::test]
    async fn apply_configuration_disables_until_enabled() {
        let svc = service();
        let new = TunnelConfig {
            server_name: "Renamed".to_string(),
            max_clients: 10,
            tunnel_enabled: true,
            ..Default::default()
        };

        assert_eq!(svc.apply_configuration(new), ConfigChange::Applied);

        let current = svc.current_configuration();
        assert_eq!(current.server_name, "Renamed");
        assert_eq!(current.max_clients, 10);
        assert!(!current.tunnel_enabled);

        assert_eq!(
            svc.reserve(addr(1), 2, None),
            Err(ReserveError::ServiceUnavailable(UnavailableReason::Disabled))
        );

        svc.enable_tunnel();
        assert!(svc.is_tunnel_enabled());
        assert!(svc.reserve(addr(1), 2, None).is_ok());
    }

    #[tokio::test]
    async fn apply_configuration_with_tunnel_off_only_disables() {
        let svc = service();
        let new = TunnelConfig {
            server_name: "Ignored".to_string(),
            tunnel_enabled: false,
            ..Default::default()
        };

        assert_eq!(svc.apply_configuration(new), ConfigChange::Disabled);
        let current = svc.current_configuration();
        assert_eq!(current.server_name, TunnelConfig::default().server_name);
        assert!(!current.tunnel_enabled);
    }

    #[tokio::test]
    async fn login_and_credential_change_revokes_key() {
        let svc = service();
        let key = svc.login("admin", &STANDARD.encode("admin")).unwrap();
        assert!(svc.check_api_key(&key));

        svc.apply_configuration(TunnelConfig {
            admin_password: "changed".to_string(),
            tunnel_enabled: true,
            ..Default::default()
        });
        assert!(!svc.check_api_key(&key));

        assert_eq!(
            svc.login("admin", &STANDARD.encode("admin")),
            Err(AuthError::InvalidCredentials)
        );
        assert!(svc.login("admin", &STANDARD.encode("changed")).is_ok());
    }

    #[tokio::test]
    async fn bind_address_only_for_allocated_slots() {
        let svc = service();
        let ids = svc.reserve(addr(1), 2, None).unwrap();
        let relay_addr: SocketAddr = "198.51.100.4:40000".parse().unwrap();

        assert!(svc.bind_address(ids[0], relay_addr));
        assert_eq!(svc.lookup(ids[0]).unwrap().address(), Some(relay_addr));
        assert!(!svc.bind_address(-1, relay_addr));

        let other: SocketAddr = "198.51.100.99:40001".parse().unwrap();
        assert!(svc.bind_address(ids[0], other));
        assert_eq!(svc.lookup(ids[0]).unwrap().address(), Some(relay_addr));
    }

    #[tokio::test]
    async fn shutdown_signal_works() {
        let svc = service();
        let mut rx = svc.shutdown_rx();
        assert!(!*rx.borrow());

        svc.trigger_shutdown();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn ui_status_includes_recent_logs() {
        let logs = RecentLogs::new(5);
        logs.push("[INFO] cnctunnel hello".to_string());
        let svc = service().with_recent_logs(logs);

        let status = svc.ui_status();
        assert_eq!(status.slots_free, 200);
        assert_eq!(status.server_log, vec!["[INFO] cnctunnel hello".to_string()]);
    }
}
