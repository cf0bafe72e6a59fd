//! Ephemeral Registrations
//!
//! The registrar owns this instance's ephemeral entries. On lease backends
//! every registration gets its own lease and a renewal task refreshing it
//! at a third of the TTL; a lease that cannot be renewed marks the entry
//! LOST. On session backends the entry lives with the connection session;
//! loss is reported by the store through `SessionExpired` watch events, or
//! found by [`LeaseRegistrar::audit_session`] when the session was replaced
//! while no watch was armed. Either way, lost entries are recreated through
//! [`LeaseRegistrar::recover`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;

use crate::error::{Error, Result};
use crate::retry::sleep_or_cancel;
use crate::store::{CoordinationStore, CreateOutcome, EntryKind, LeaseId, StoreBackend};

/// Create attempts before a churning path is reported as transient
const CLAIM_ATTEMPTS: u32 = 3;

/// Who may hold a registered path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// One well-known path contended by every instance
    Exclusive,
    /// A path derived from this instance's address
    Member,
}

impl std::fmt::Display for Ownership {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Ownership::Exclusive => write!(f, "EXCLUSIVE"),
            Ownership::Member => write!(f, "MEMBER"),
        }
    }
}

struct Registration {
    payload: String,
    ownership: Ownership,
    lease: Option<LeaseId>,
    /// Store session the entry was created on
    epoch: u64,
    renewal: Option<CancellationToken>,
    lost: Arc<AtomicBool>,
}

/// Registers, renews and removes ephemeral entries
pub struct LeaseRegistrar {
    store: Arc<dyn CoordinationStore>,
    lease_ttl: Duration,
    renew_failure_budget: u32,
    cancel: CancellationToken,
    registrations: Mutex<HashMap<String, Registration>>,
    losses: watch::Sender<u64>,
}

impl LeaseRegistrar {
    /// Create a registrar. Renewal tasks stop when `cancel` fires.
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        lease_ttl: Duration,
        renew_failure_budget: u32,
        cancel: CancellationToken,
    ) -> Self {
        let (losses, _) = watch::channel(0);
        Self {
            store,
            lease_ttl,
            renew_failure_budget: renew_failure_budget.max(1),
            cancel,
            registrations: Mutex::new(HashMap::new()),
            losses,
        }
    }

    /// Counter bumped every time a registration is marked lost
    pub fn subscribe_losses(&self) -> watch::Receiver<u64> {
        self.losses.subscribe()
    }

    /// Register `path` with `payload`.
    ///
    /// Any previous registration of the same path is released first. An
    /// entry left behind by an earlier incarnation of this instance is
    /// removed and recreated; an exclusive path held by anyone else yields
    /// [`Error::RegistrationConflict`].
    pub async fn register(&self, path: &str, payload: &str, ownership: Ownership) -> Result<()> {
        self.release_local(path).await;

        let epoch = self.store.session_epoch();
        let lease = match self.store.backend() {
            StoreBackend::Lease => Some(self.store.grant_lease(self.lease_ttl).await?),
            StoreBackend::Session => None,
        };

        if let Err(e) = self.claim(path, payload, ownership, lease).await {
            if let Some(lease) = lease {
                if let Err(revoke_err) = self.store.revoke_lease(lease).await {
                    tracing::debug!("Failed to revoke unused lease {}: {}", lease, revoke_err);
                }
            }
            return Err(e);
        }

        let lost = Arc::new(AtomicBool::new(false));
        let renewal = lease.map(|lease| self.spawn_renewal(path, lease, Arc::clone(&lost)));

        self.registrations.lock().await.insert(
            path.to_string(),
            Registration {
                payload: payload.to_string(),
                ownership,
                lease,
                epoch,
                renewal,
                lost,
            },
        );

        tracing::info!("Registered {} entry {}", ownership, path);
        Ok(())
    }

    async fn claim(
        &self,
        path: &str,
        payload: &str,
        ownership: Ownership,
        lease: Option<LeaseId>,
    ) -> Result<()> {
        let kind = EntryKind::Ephemeral { lease };

        for _ in 0..CLAIM_ATTEMPTS {
            if self.store.create(path, payload, kind).await? == CreateOutcome::Created {
                return Ok(());
            }

            let Some(existing) = self.store.get(path).await? else {
                continue;
            };

            let stale_own = match ownership {
                Ownership::Member => true,
                Ownership::Exclusive => existing.value == payload,
            };
            if !stale_own {
                return Err(Error::RegistrationConflict {
                    path: path.to_string(),
                    owner: existing.value,
                });
            }

            tracing::warn!("Removing stale registration at {}", path);
            self.store.delete(path).await?;
        }

        Err(Error::Transient(format!("{} kept changing while registering", path)))
    }

    fn spawn_renewal(&self, path: &str, lease: LeaseId, lost: Arc<AtomicBool>) -> CancellationToken {
        let token = self.cancel.child_token();
        let cancel = token.clone();
        let store = Arc::clone(&self.store);
        let losses = self.losses.clone();
        let budget = self.renew_failure_budget;
        let interval = (self.lease_ttl / 3).max(Duration::from_millis(100));
        let path = path.to_string();

        tokio::spawn(
            async move {
                let mut failures = 0u32;
                loop {
                    if !sleep_or_cancel(&cancel, interval).await {
                        break;
                    }

                    let result = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        result = store.keep_alive(lease) => result,
                    };

                    match result {
                        Ok(_) => failures = 0,
                        Err(e) if e.is_session_loss() => {
                            tracing::warn!("Lease {} for {} is gone: {}", lease, path, e);
                            break;
                        }
                        Err(e) => {
                            failures += 1;
                            tracing::warn!(
                                "Lease {} renewal failed ({}/{}): {}",
                                lease,
                                failures,
                                budget,
                                e
                            );
                            if failures >= budget {
                                tracing::error!("Giving up on lease {} for {}", lease, path);
                                break;
                            }
                        }
                    }
                }

                if !cancel.is_cancelled() {
                    lost.store(true, Ordering::SeqCst);
                    losses.send_modify(|count| *count += 1);
                }
            }
            .with_current_subscriber(),
        );

        token
    }

    /// Forget a registration locally: stop its renewal and revoke its lease
    async fn release_local(&self, path: &str) -> Option<Registration> {
        let registration = self.registrations.lock().await.remove(path)?;
        if let Some(renewal) = &registration.renewal {
            renewal.cancel();
        }
        if let Some(lease) = registration.lease {
            if let Err(e) = self.store.revoke_lease(lease).await {
                tracing::debug!("Failed to revoke lease {}: {}", lease, e);
            }
        }
        Some(registration)
    }

    /// Remove `path`. A missing entry counts as success.
    pub async fn deregister(&self, path: &str) -> Result<()> {
        self.release_local(path).await;
        if self.store.delete(path).await? {
            tracing::info!("Deregistered {}", path);
        } else {
            tracing::debug!("Nothing to deregister at {}", path);
        }
        Ok(())
    }

    /// Remove every registration, logging failures
    pub async fn deregister_all(&self) {
        let paths: Vec<String> = self.registrations.lock().await.keys().cloned().collect();
        for path in paths {
            if let Err(e) = self.deregister(&path).await {
                tracing::warn!("Failed to deregister {}: {}", path, e);
            }
        }
    }

    /// Rebuild registrations after a session or lease loss.
    ///
    /// On session backends every registration died with the session; on
    /// lease backends only the ones marked lost. Member entries are
    /// recreated. Exclusive entries are only forgotten; whoever contends for
    /// them decides whether to claim them again.
    pub async fn recover(&self) -> Result<()> {
        let session_backend = self.store.backend() == StoreBackend::Session;
        let paths: Vec<String> = self
            .registrations
            .lock()
            .await
            .iter()
            .filter(|(_, r)| session_backend || r.lost.load(Ordering::SeqCst))
            .map(|(path, _)| path.clone())
            .collect();

        for path in paths {
            let Some(registration) = self.release_local(&path).await else {
                continue;
            };
            match registration.ownership {
                Ownership::Member => {
                    tracing::info!("Re-registering {}", path);
                    self.register(&path, &registration.payload, Ownership::Member).await?;
                }
                Ownership::Exclusive => {
                    tracing::debug!("Dropped exclusive registration {}", path);
                }
            }
        }
        Ok(())
    }

    /// Mark every registration made on an earlier store session as lost.
    ///
    /// A session replaced while no watch was armed leaves no event behind;
    /// comparing epochs is the only way to notice. Returns true and bumps
    /// the loss counter if anything was stale.
    pub async fn audit_session(&self) -> bool {
        if self.store.backend() != StoreBackend::Session {
            return false;
        }

        let epoch = self.store.session_epoch();
        let mut stale = 0;
        for (path, registration) in self.registrations.lock().await.iter() {
            if registration.epoch != epoch && !registration.lost.swap(true, Ordering::SeqCst) {
                tracing::warn!(
                    "Registration {} belongs to session {}, store is on session {}",
                    path,
                    registration.epoch,
                    epoch
                );
                stale += 1;
            }
        }

        if stale > 0 {
            self.losses.send_modify(|count| *count += 1);
        }
        stale > 0
    }

    /// Record that `path` is gone from the store
    pub async fn mark_lost(&self, path: &str) {
        if let Some(registration) = self.registrations.lock().await.get(path) {
            registration.lost.store(true, Ordering::SeqCst);
        }
    }

    /// Registered and not known to be lost
    pub async fn is_live(&self, path: &str) -> bool {
        self.registrations
            .lock()
            .await
            .get(path)
            .map(|r| !r.lost.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Registered but its lease is gone
    pub async fn is_lost(&self, path: &str) -> bool {
        self.registrations
            .lock()
            .await
            .get(path)
            .map(|r| r.lost.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Paths currently registered
    pub async fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.registrations.lock().await.keys().cloned().collect();
        paths.sort();
        paths
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryCluster, MemoryConnection};

    async fn registrar(cluster: &MemoryCluster, backend: StoreBackend) -> (Arc<MemoryConnection>, LeaseRegistrar) {
        let conn = Arc::new(cluster.connect(backend).await);
        let store: Arc<dyn CoordinationStore> = conn.clone();
        let registrar = LeaseRegistrar::new(store, Duration::from_secs(3), 3, CancellationToken::new());
        (conn, registrar)
    }

    #[tokio::test]
    async fn test_exclusive_conflict_reports_owner() {
        let cluster = MemoryCluster::new();
        let (_a, first) = registrar(&cluster, StoreBackend::Session).await;
        let (_b, second) = registrar(&cluster, StoreBackend::Session).await;

        first.register("/app/leader", "10.0.0.1", Ownership::Exclusive).await.unwrap();
        let err = second
            .register("/app/leader", "10.0.0.2", Ownership::Exclusive)
            .await
            .unwrap_err();

        match err {
            Error::RegistrationConflict { path, owner } => {
                assert_eq!(path, "/app/leader");
                assert_eq!(owner, "10.0.0.1");
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(first.is_live("/app/leader").await);
        assert!(!second.is_live("/app/leader").await);
    }

    #[tokio::test]
    async fn test_stale_own_entry_is_replaced() {
        let cluster = MemoryCluster::new();
        let (old, _) = registrar(&cluster, StoreBackend::Session).await;
        old.create("/app/leader", "10.0.0.1", EntryKind::Persistent).await.unwrap();

        let (_conn, registrar) = registrar(&cluster, StoreBackend::Session).await;
        registrar.register("/app/leader", "10.0.0.1", Ownership::Exclusive).await.unwrap();
        assert!(registrar.is_live("/app/leader").await);

        // Re-registering our own live entry is idempotent too.
        registrar.register("/app/leader", "10.0.0.1", Ownership::Exclusive).await.unwrap();
        assert_eq!(cluster.value("/app/leader").await.as_deref(), Some("10.0.0.1"));
    }

    #[tokio::test]
    async fn test_deregister_tolerates_missing() {
        let cluster = MemoryCluster::new();
        let (_conn, registrar) = registrar(&cluster, StoreBackend::Session).await;

        registrar.deregister("/app/discovery/10.0.0.9").await.unwrap();

        registrar.register("/app/discovery/10.0.0.1", "", Ownership::Member).await.unwrap();
        registrar.deregister("/app/discovery/10.0.0.1").await.unwrap();
        assert!(cluster.value("/app/discovery/10.0.0.1").await.is_none());
        assert!(registrar.paths().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_keeps_lease_alive() {
        let cluster = MemoryCluster::new();
        let (_conn, registrar) = registrar(&cluster, StoreBackend::Lease).await;

        registrar.register("/app/discovery/10.0.0.1", "meta", Ownership::Member).await.unwrap();
        tokio::time::sleep(Duration::from_secs(20)).await;

        assert_eq!(cluster.value("/app/discovery/10.0.0.1").await.as_deref(), Some("meta"));
        assert!(registrar.is_live("/app/discovery/10.0.0.1").await);
        assert_eq!(cluster.lease_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_marks_entry_lost() {
        let cluster = MemoryCluster::new();
        let (conn, registrar) = registrar(&cluster, StoreBackend::Lease).await;
        let mut losses = registrar.subscribe_losses();

        registrar.register("/app/discovery/10.0.0.1", "", Ownership::Member).await.unwrap();
        conn.expire_session().await;

        losses.changed().await.unwrap();
        assert_eq!(*losses.borrow(), 1);
        assert!(registrar.is_lost("/app/discovery/10.0.0.1").await);
        assert!(cluster.value("/app/discovery/10.0.0.1").await.is_none());

        registrar.recover().await.unwrap();
        assert!(registrar.is_live("/app/discovery/10.0.0.1").await);
        assert!(cluster.value("/app/discovery/10.0.0.1").await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_failure_budget() {
        let cluster = MemoryCluster::new();
        let (conn, registrar) = registrar(&cluster, StoreBackend::Lease).await;
        let mut losses = registrar.subscribe_losses();

        registrar.register("/app/discovery/10.0.0.1", "", Ownership::Member).await.unwrap();
        conn.inject_transient_failures(3);

        losses.changed().await.unwrap();
        assert!(registrar.is_lost("/app/discovery/10.0.0.1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_renewal() {
        let cluster = MemoryCluster::new();
        let conn = Arc::new(cluster.connect(StoreBackend::Lease).await);
        let cancel = CancellationToken::new();
        let registrar = LeaseRegistrar::new(conn.clone(), Duration::from_secs(3), 3, cancel.clone());

        registrar.register("/app/discovery/10.0.0.1", "", Ownership::Member).await.unwrap();
        cancel.cancel();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert!(cluster.value("/app/discovery/10.0.0.1").await.is_none());
        assert!(!registrar.is_lost("/app/discovery/10.0.0.1").await);
    }

    #[tokio::test]
    async fn test_recover_after_session_expiry() {
        let cluster = MemoryCluster::new();
        let (conn, registrar) = registrar(&cluster, StoreBackend::Session).await;

        registrar.register("/app/discovery/10.0.0.1", "m", Ownership::Member).await.unwrap();
        registrar.register("/app/leader", "10.0.0.1", Ownership::Exclusive).await.unwrap();
        conn.expire_session().await;
        assert!(cluster.entries().await.is_empty());

        registrar.recover().await.unwrap();
        assert_eq!(cluster.value("/app/discovery/10.0.0.1").await.as_deref(), Some("m"));
        assert!(cluster.value("/app/leader").await.is_none());
        assert_eq!(registrar.paths().await, vec!["/app/discovery/10.0.0.1".to_string()]);
    }

    #[tokio::test]
    async fn test_audit_flags_replaced_session() {
        let cluster = MemoryCluster::new();
        let (conn, registrar) = registrar(&cluster, StoreBackend::Session).await;
        let losses = registrar.subscribe_losses();

        registrar.register("/app/discovery/10.0.0.1", "m", Ownership::Member).await.unwrap();
        assert!(!registrar.audit_session().await);

        // No watch is armed, so nothing reports the expiry.
        conn.expire_session().await;
        assert!(registrar.audit_session().await);
        assert!(registrar.is_lost("/app/discovery/10.0.0.1").await);
        assert_eq!(*losses.borrow(), 1);
        assert!(!registrar.audit_session().await);
        assert_eq!(*losses.borrow(), 1);

        registrar.recover().await.unwrap();
        assert!(registrar.is_live("/app/discovery/10.0.0.1").await);
        assert!(!registrar.audit_session().await);
        assert_eq!(cluster.value("/app/discovery/10.0.0.1").await.as_deref(), Some("m"));
    }

    #[tokio::test]
    async fn test_marked_lease_entry_is_rebuilt() {
        let cluster = MemoryCluster::new();
        let (_conn, registrar) = registrar(&cluster, StoreBackend::Lease).await;

        registrar.register("/app/discovery/10.0.0.1", "m", Ownership::Member).await.unwrap();
        registrar.register("/app/discovery/10.0.0.2", "n", Ownership::Member).await.unwrap();
        registrar.mark_lost("/app/discovery/10.0.0.1").await;
        assert!(!registrar.audit_session().await);

        registrar.recover().await.unwrap();
        assert!(registrar.is_live("/app/discovery/10.0.0.1").await);
        assert!(registrar.is_live("/app/discovery/10.0.0.2").await);
        assert_eq!(cluster.lease_count().await, 2);
    }
}
