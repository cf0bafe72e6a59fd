//! Coordination Store Module
//!
//! The capability set every coordination store exposes. Registration,
//! watching, election and discovery are written once against
//! [`CoordinationStore`]; backends differ only in how ephemeral entries
//! are kept alive (a connection session or a renewable lease).

mod memory;
#[cfg(feature = "etcd")]
mod etcd;
#[cfg(test)]
pub(crate) mod testing;

pub use memory::{MemoryCluster, MemoryConnection, MemoryConnector};
#[cfg(feature = "etcd")]
pub use etcd::{EtcdConnector, EtcdStore};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::config::{BackendKind, StoreConfig};
use crate::error::Result;

/// Lease identifier
pub type LeaseId = i64;

/// How a backend keeps ephemeral entries alive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreBackend {
    /// Entries live as long as the connection session
    Session,
    /// Entries live as long as a renewed lease
    Lease,
}

impl std::fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreBackend::Session => write!(f, "SESSION"),
            StoreBackend::Lease => write!(f, "LEASE"),
        }
    }
}

/// Lifetime of a created entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Survives its creator
    Persistent,
    /// Removed with its session, or with its lease when one is given
    Ephemeral { lease: Option<LeaseId> },
}

/// Result of a create-if-absent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    /// A live entry already occupies the path
    Exists,
}

/// A key and its payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub path: String,
    pub value: String,
}

/// What a watch observes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchScope {
    /// The entry at exactly this path
    Entry,
    /// The direct children of this path
    Children,
}

/// Kind of a fired watch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    EntryCreated,
    ValueChanged,
    EntryDeleted,
    ChildrenChanged,
    /// The session or lease backing our ephemeral entries is gone
    SessionExpired,
}

impl std::fmt::Display for WatchEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatchEventKind::EntryCreated => write!(f, "ENTRY_CREATED"),
            WatchEventKind::ValueChanged => write!(f, "VALUE_CHANGED"),
            WatchEventKind::EntryDeleted => write!(f, "ENTRY_DELETED"),
            WatchEventKind::ChildrenChanged => write!(f, "CHILDREN_CHANGED"),
            WatchEventKind::SessionExpired => write!(f, "SESSION_EXPIRED"),
        }
    }
}

/// A fired watch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub path: String,
}

impl WatchEvent {
    pub fn new(kind: WatchEventKind, path: &str) -> Self {
        Self {
            kind,
            path: path.to_string(),
        }
    }
}

/// An armed single-fire watch
#[derive(Debug)]
pub struct PendingWatch {
    path: String,
    rx: oneshot::Receiver<WatchEvent>,
}

impl PendingWatch {
    /// Create a watch and the sender the backend fires it through
    pub fn channel(path: &str) -> (oneshot::Sender<WatchEvent>, Self) {
        let (tx, rx) = oneshot::channel();
        (
            tx,
            Self {
                path: path.to_string(),
                rx,
            },
        )
    }

    /// Watched path
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The event, if it has already fired
    pub fn try_fired(&mut self) -> Option<WatchEvent> {
        self.rx.try_recv().ok()
    }

    /// Wait for the event; `None` if the backend dropped the watch
    pub async fn fired(self) -> Option<WatchEvent> {
        self.rx.await.ok()
    }
}

/// Operations over a coordination store connection
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Ephemeral semantics of this backend
    fn backend(&self) -> StoreBackend;

    /// Identifier of the session that owns session-scoped entries. It
    /// changes whenever the store replaces an expired session. Lease
    /// backends have no such session and report 0.
    fn session_epoch(&self) -> u64 {
        0
    }

    /// Create `path` if absent
    async fn create(&self, path: &str, value: &str, kind: EntryKind) -> Result<CreateOutcome>;

    /// Delete `path`; returns false if nothing was there
    async fn delete(&self, path: &str) -> Result<bool>;

    /// Read `path`
    async fn get(&self, path: &str) -> Result<Option<Entry>>;

    /// Direct children of `prefix`, ordered by path
    async fn list(&self, prefix: &str) -> Result<Vec<Entry>>;

    /// Arm a single-fire watch
    async fn watch(&self, path: &str, scope: WatchScope) -> Result<PendingWatch>;

    /// Grant a lease with the given TTL (lease backends)
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId>;

    /// Renew a lease once, returning the refreshed TTL
    async fn keep_alive(&self, lease: LeaseId) -> Result<Duration>;

    /// Revoke a lease and every entry bound to it
    async fn revoke_lease(&self, lease: LeaseId) -> Result<()>;

    /// Close the connection
    async fn close(&self);
}

/// Opens store connections; one per started service
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn CoordinationStore>>;

    /// Human-readable target, for logs
    fn describe(&self) -> String;
}

/// Build the connector a store configuration asks for. Memory backends
/// attach to `cluster`.
pub fn connector_for(config: &StoreConfig, cluster: &MemoryCluster) -> Result<Arc<dyn StoreConnector>> {
    match config.backend {
        BackendKind::MemorySession => Ok(Arc::new(
            cluster
                .connector(StoreBackend::Session)
                .with_session_timeout(config.session_timeout()),
        )),
        BackendKind::MemoryLease => Ok(Arc::new(cluster.connector(StoreBackend::Lease))),
        #[cfg(feature = "etcd")]
        BackendKind::Etcd => Ok(Arc::new(EtcdConnector::new(
            config.endpoints.clone(),
            config.connect_timeout(),
        ))),
        #[cfg(not(feature = "etcd"))]
        BackendKind::Etcd => Err(crate::Error::Config(
            "the etcd backend requires building with --features etcd".into(),
        )),
    }
}
