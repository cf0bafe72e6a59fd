//! In-Process Coordination Store
//!
//! A complete coordination store living inside the process. A
//! [`MemoryCluster`] is the shared keyspace and every [`MemoryConnection`]
//! is one client with its own session. Both ephemeral flavours are
//! supported:
//!
//! - session backends bind ephemeral entries to the connection session;
//!   they vanish when the session expires or the connection closes, and an
//!   expired session fires `SessionExpired` on that connection's watches.
//!   A client that goes away without closing keeps its entries until the
//!   session timeout passes.
//! - lease backends bind ephemeral entries to a TTL lease; they vanish when
//!   the lease is revoked or is not renewed before its deadline
//!
//! Deadlines use `tokio::time::Instant`, so tests can drive expiry with
//! paused time. Every lease has a reaper task sleeping until its deadline;
//! operations also reap whatever has already expired.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::instrument::WithSubscriber;

use super::{
    CoordinationStore, CreateOutcome, Entry, EntryKind, LeaseId, PendingWatch, StoreBackend,
    StoreConnector, WatchEvent, WatchEventKind, WatchScope,
};
use crate::error::{Error, Result};
use crate::paths::is_direct_child;

type SessionId = u64;

/// Session timeout of connections opened straight from a cluster
const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(15);

/// Who keeps an entry alive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owner {
    Persistent,
    Session(SessionId),
    Lease(LeaseId),
}

#[derive(Debug, Clone)]
struct StoredEntry {
    value: String,
    owner: Owner,
}

#[derive(Debug)]
struct LeaseRecord {
    ttl: Duration,
    deadline: Instant,
    /// Session that granted the lease
    session: SessionId,
}

#[derive(Debug, Clone, Copy)]
enum Change {
    Created,
    Updated,
    Deleted,
}

struct WatchRecord {
    session: SessionId,
    path: String,
    scope: WatchScope,
    tx: oneshot::Sender<WatchEvent>,
}

impl WatchRecord {
    fn event_for(&self, path: &str, change: Change) -> Option<WatchEventKind> {
        match self.scope {
            WatchScope::Entry if self.path == path => Some(match change {
                Change::Created => WatchEventKind::EntryCreated,
                Change::Updated => WatchEventKind::ValueChanged,
                Change::Deleted => WatchEventKind::EntryDeleted,
            }),
            WatchScope::Children if is_direct_child(&self.path, path) => Some(match change {
                Change::Updated => WatchEventKind::ValueChanged,
                Change::Created | Change::Deleted => WatchEventKind::ChildrenChanged,
            }),
            _ => None,
        }
    }
}

#[derive(Default)]
struct Keyspace {
    entries: BTreeMap<String, StoredEntry>,
    leases: HashMap<LeaseId, LeaseRecord>,
    watches: Vec<WatchRecord>,
    next_session: SessionId,
    next_lease: LeaseId,
}

impl Keyspace {
    fn open_session(&mut self) -> SessionId {
        self.next_session += 1;
        self.next_session
    }

    fn insert(&mut self, path: &str, entry: StoredEntry) {
        let change = match self.entries.insert(path.to_string(), entry) {
            Some(_) => Change::Updated,
            None => Change::Created,
        };
        self.notify(path, change);
    }

    fn remove(&mut self, path: &str) -> bool {
        if self.entries.remove(path).is_none() {
            return false;
        }
        self.notify(path, Change::Deleted);
        true
    }

    fn remove_owned_by(&mut self, owner: Owner) -> usize {
        let doomed: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.owner == owner)
            .map(|(path, _)| path.clone())
            .collect();

        for path in &doomed {
            self.remove(path);
        }
        doomed.len()
    }

    fn drop_lease(&mut self, lease: LeaseId) -> bool {
        if self.leases.remove(&lease).is_none() {
            return false;
        }
        let removed = self.remove_owned_by(Owner::Lease(lease));
        tracing::debug!("Lease {} dropped, {} entries removed", lease, removed);
        true
    }

    fn reap_expired(&mut self, now: Instant) {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for lease in expired {
            tracing::debug!("Lease {} expired", lease);
            self.drop_lease(lease);
        }
    }

    fn leases_of(&self, session: SessionId) -> Vec<LeaseId> {
        self.leases
            .iter()
            .filter(|(_, lease)| lease.session == session)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Fire and discard every watch interested in this change
    fn notify(&mut self, path: &str, change: Change) {
        let mut remaining = Vec::with_capacity(self.watches.len());
        for watch in std::mem::take(&mut self.watches) {
            if watch.tx.is_closed() {
                continue;
            }
            match watch.event_for(path, change) {
                Some(kind) => {
                    let _ = watch.tx.send(WatchEvent::new(kind, path));
                }
                None => remaining.push(watch),
            }
        }
        self.watches = remaining;
    }

    fn expire_session_watches(&mut self, session: SessionId) {
        let mut remaining = Vec::with_capacity(self.watches.len());
        for watch in std::mem::take(&mut self.watches) {
            if watch.session == session {
                let _ = watch
                    .tx
                    .send(WatchEvent::new(WatchEventKind::SessionExpired, &watch.path));
            } else {
                remaining.push(watch);
            }
        }
        self.watches = remaining;
    }

    fn drop_session_watches(&mut self, session: SessionId) {
        self.watches.retain(|watch| watch.session != session);
    }
}

/// Drop `lease` once its deadline passes without a renewal
fn spawn_lease_reaper(keyspace: Weak<Mutex<Keyspace>>, lease: LeaseId, deadline: Instant) {
    tokio::spawn(
        async move {
            let mut deadline = deadline;
            loop {
                tokio::time::sleep_until(deadline).await;
                let Some(keyspace) = keyspace.upgrade() else {
                    break;
                };
                let mut keyspace = keyspace.lock().await;
                match keyspace.leases.get(&lease) {
                    None => break,
                    Some(record) if record.deadline > Instant::now() => deadline = record.deadline,
                    Some(_) => {
                        tracing::debug!("Lease {} expired", lease);
                        keyspace.drop_lease(lease);
                        break;
                    }
                }
            }
        }
        .with_current_subscriber(),
    );
}

/// Shared in-process keyspace
#[derive(Clone, Default)]
pub struct MemoryCluster {
    keyspace: Arc<Mutex<Keyspace>>,
}

impl MemoryCluster {
    /// Create an empty cluster
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector handing out connections to this cluster
    pub fn connector(&self, backend: StoreBackend) -> MemoryConnector {
        MemoryConnector {
            cluster: self.clone(),
            backend,
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            refuse: Arc::new(AtomicBool::new(false)),
            connections: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Open a connection with a fresh session
    pub async fn connect(&self, backend: StoreBackend) -> MemoryConnection {
        self.connect_with(backend, DEFAULT_SESSION_TIMEOUT).await
    }

    async fn connect_with(&self, backend: StoreBackend, session_timeout: Duration) -> MemoryConnection {
        let session = self.keyspace.lock().await.open_session();
        MemoryConnection {
            cluster: self.clone(),
            backend,
            session_timeout,
            session: AtomicU64::new(session),
            closed: AtomicBool::new(false),
            injected_failures: AtomicU32::new(0),
        }
    }

    /// All live entries
    pub async fn entries(&self) -> BTreeMap<String, String> {
        let mut keyspace = self.keyspace.lock().await;
        keyspace.reap_expired(Instant::now());
        keyspace
            .entries
            .iter()
            .map(|(path, entry)| (path.clone(), entry.value.clone()))
            .collect()
    }

    /// Value at `path`, if live
    pub async fn value(&self, path: &str) -> Option<String> {
        let mut keyspace = self.keyspace.lock().await;
        keyspace.reap_expired(Instant::now());
        keyspace.entries.get(path).map(|entry| entry.value.clone())
    }

    /// Expire a lease as if it was not renewed in time
    pub async fn expire_lease(&self, lease: LeaseId) -> bool {
        self.keyspace.lock().await.drop_lease(lease)
    }

    /// Number of live leases
    pub async fn lease_count(&self) -> usize {
        let mut keyspace = self.keyspace.lock().await;
        keyspace.reap_expired(Instant::now());
        keyspace.leases.len()
    }
}

/// Connector over a [`MemoryCluster`]
#[derive(Clone)]
pub struct MemoryConnector {
    cluster: MemoryCluster,
    backend: StoreBackend,
    session_timeout: Duration,
    refuse: Arc<AtomicBool>,
    connections: Arc<Mutex<Vec<Arc<MemoryConnection>>>>,
}

impl MemoryConnector {
    /// How long an abandoned session outlives its client
    pub fn with_session_timeout(mut self, session_timeout: Duration) -> Self {
        self.session_timeout = session_timeout;
        self
    }

    /// Make subsequent connects fail (or succeed again)
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Most recently opened connection
    pub async fn last_connection(&self) -> Option<Arc<MemoryConnection>> {
        self.connections.lock().await.last().cloned()
    }

    /// Number of connections opened so far
    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }
}

#[async_trait]
impl StoreConnector for MemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn CoordinationStore>> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(Error::Connect("memory store is refusing connections".into()));
        }

        let conn = Arc::new(self.cluster.connect_with(self.backend, self.session_timeout).await);
        self.connections.lock().await.push(Arc::clone(&conn));
        tracing::debug!("Opened memory connection with session {}", conn.session_id());
        Ok(conn)
    }

    fn describe(&self) -> String {
        format!("memory ({})", self.backend)
    }
}

/// One client of a [`MemoryCluster`]
pub struct MemoryConnection {
    cluster: MemoryCluster,
    backend: StoreBackend,
    session_timeout: Duration,
    session: AtomicU64,
    closed: AtomicBool,
    injected_failures: AtomicU32,
}

impl MemoryConnection {
    /// Current session identifier
    pub fn session_id(&self) -> u64 {
        self.session.load(Ordering::SeqCst)
    }

    /// Fail the next `count` operations with a transient error
    pub fn inject_transient_failures(&self, count: u32) {
        self.injected_failures.store(count, Ordering::SeqCst);
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Lose the session backing this connection's ephemeral entries.
    ///
    /// Session backends drop every session entry, fire `SessionExpired` on
    /// this connection's watches and continue on a fresh session. Lease
    /// backends drop every lease this connection granted.
    pub async fn expire_session(&self) {
        let mut keyspace = self.cluster.keyspace.lock().await;
        let old = self.session_id();

        match self.backend {
            StoreBackend::Session => {
                keyspace.expire_session_watches(old);
                let removed = keyspace.remove_owned_by(Owner::Session(old));
                let fresh = keyspace.open_session();
                self.session.store(fresh, Ordering::SeqCst);
                tracing::debug!(
                    "Session {} expired ({} entries removed), continuing on session {}",
                    old,
                    removed,
                    fresh
                );
            }
            StoreBackend::Lease => {
                for lease in keyspace.leases_of(old) {
                    keyspace.drop_lease(lease);
                }
            }
        }
    }

    /// Go silent without closing, as a crashed client would.
    ///
    /// Nothing is cleaned up right away. Session entries stay until the
    /// session timeout passes; leases run out once nobody renews them.
    pub async fn crash(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let session = self.session_id();
        self.cluster.keyspace.lock().await.drop_session_watches(session);
        if self.backend != StoreBackend::Session {
            return;
        }

        let keyspace = Arc::downgrade(&self.cluster.keyspace);
        let timeout = self.session_timeout;
        tokio::spawn(
            async move {
                tokio::time::sleep(timeout).await;
                if let Some(keyspace) = keyspace.upgrade() {
                    let removed = keyspace.lock().await.remove_owned_by(Owner::Session(session));
                    tracing::debug!("Session {} timed out, {} entries removed", session, removed);
                }
            }
            .with_current_subscriber(),
        );
    }

    async fn enter(&self) -> Result<MutexGuard<'_, Keyspace>> {
        if self.is_closed() {
            return Err(Error::Store("connection closed".into()));
        }

        let injected = self
            .injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(Error::Transient("injected transient failure".into()));
        }

        let mut keyspace = self.cluster.keyspace.lock().await;
        keyspace.reap_expired(Instant::now());
        Ok(keyspace)
    }
}

#[async_trait]
impl CoordinationStore for MemoryConnection {
    fn backend(&self) -> StoreBackend {
        self.backend
    }

    fn session_epoch(&self) -> u64 {
        match self.backend {
            StoreBackend::Session => self.session_id(),
            StoreBackend::Lease => 0,
        }
    }

    async fn create(&self, path: &str, value: &str, kind: EntryKind) -> Result<CreateOutcome> {
        let mut keyspace = self.enter().await?;
        if keyspace.entries.contains_key(path) {
            return Ok(CreateOutcome::Exists);
        }

        let owner = match kind {
            EntryKind::Persistent => Owner::Persistent,
            EntryKind::Ephemeral { lease: Some(lease) } => {
                if !keyspace.leases.contains_key(&lease) {
                    return Err(Error::SessionLost(format!("lease {} not found", lease)));
                }
                Owner::Lease(lease)
            }
            EntryKind::Ephemeral { lease: None } => match self.backend {
                StoreBackend::Session => Owner::Session(self.session_id()),
                StoreBackend::Lease => {
                    return Err(Error::Store(
                        "ephemeral entries need a lease on lease backends".into(),
                    ))
                }
            },
        };

        keyspace.insert(
            path,
            StoredEntry {
                value: value.to_string(),
                owner,
            },
        );
        Ok(CreateOutcome::Created)
    }

    async fn delete(&self, path: &str) -> Result<bool> {
        let mut keyspace = self.enter().await?;
        Ok(keyspace.remove(path))
    }

    async fn get(&self, path: &str) -> Result<Option<Entry>> {
        let keyspace = self.enter().await?;
        Ok(keyspace.entries.get(path).map(|entry| Entry {
            path: path.to_string(),
            value: entry.value.clone(),
        }))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<Entry>> {
        let keyspace = self.enter().await?;
        Ok(keyspace
            .entries
            .iter()
            .filter(|(path, _)| is_direct_child(prefix, path))
            .map(|(path, entry)| Entry {
                path: path.clone(),
                value: entry.value.clone(),
            })
            .collect())
    }

    async fn watch(&self, path: &str, scope: WatchScope) -> Result<PendingWatch> {
        let mut keyspace = self.enter().await?;
        let (tx, pending) = PendingWatch::channel(path);
        keyspace.watches.push(WatchRecord {
            session: self.session_id(),
            path: path.to_string(),
            scope,
            tx,
        });
        Ok(pending)
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId> {
        if self.backend == StoreBackend::Session {
            return Err(Error::Store("session backends do not grant leases".into()));
        }

        let mut keyspace = self.enter().await?;
        keyspace.next_lease += 1;
        let lease = keyspace.next_lease;
        let session = self.session_id();
        let deadline = Instant::now() + ttl;
        keyspace.leases.insert(
            lease,
            LeaseRecord {
                ttl,
                deadline,
                session,
            },
        );
        spawn_lease_reaper(Arc::downgrade(&self.cluster.keyspace), lease, deadline);
        Ok(lease)
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<Duration> {
        let mut keyspace = self.enter().await?;
        let now = Instant::now();
        match keyspace.leases.get_mut(&lease) {
            Some(record) => {
                record.deadline = now + record.ttl;
                Ok(record.ttl)
            }
            None => Err(Error::SessionLost(format!("lease {} expired or revoked", lease))),
        }
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        let mut keyspace = self.enter().await?;
        keyspace.drop_lease(lease);
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut keyspace = self.cluster.keyspace.lock().await;
        let session = self.session_id();
        if self.backend == StoreBackend::Session {
            let removed = keyspace.remove_owned_by(Owner::Session(session));
            tracing::debug!("Closed session {}, {} ephemeral entries removed", session, removed);
        }
        keyspace.drop_session_watches(session);
    }
}
