//! etcd v3 Coordination Store
//!
//! Lease backend over `etcd-client`. Ephemeral entries are bound to a
//! lease; create-if-absent is a transaction guarded on
//! `create_revision == 0`. Watches are single-fire: a background task waits
//! for the first relevant event after the last read revision of the path,
//! forwards it, then cancels the server-side watcher.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, EventType, GetOptions, PutOptions, Txn, TxnOp,
    WatchOptions,
};
use tokio::sync::Mutex;
use tracing::instrument::WithSubscriber;

use super::{
    CoordinationStore, CreateOutcome, Entry, EntryKind, LeaseId, PendingWatch, StoreBackend,
    StoreConnector, WatchEvent, WatchEventKind, WatchScope,
};
use crate::error::{Error, Result};
use crate::paths::is_direct_child;

fn map_err(e: etcd_client::Error) -> Error {
    match e {
        etcd_client::Error::TransportError(_) | etcd_client::Error::IoError(_) => {
            Error::Transient(e.to_string())
        }
        etcd_client::Error::GRpcStatus(ref status) => {
            if status.message().contains("lease not found") {
                Error::SessionLost(status.message().to_string())
            } else {
                Error::Transient(e.to_string())
            }
        }
        other => Error::Store(other.to_string()),
    }
}

/// Connects to an etcd cluster
pub struct EtcdConnector {
    endpoints: Vec<String>,
    connect_timeout: Duration,
}

impl EtcdConnector {
    pub fn new(endpoints: Vec<String>, connect_timeout: Duration) -> Self {
        Self {
            endpoints,
            connect_timeout,
        }
    }
}

#[async_trait]
impl StoreConnector for EtcdConnector {
    async fn connect(&self) -> Result<Arc<dyn CoordinationStore>> {
        let options = ConnectOptions::new()
            .with_connect_timeout(self.connect_timeout)
            .with_timeout(self.connect_timeout);

        let client = tokio::time::timeout(
            self.connect_timeout,
            Client::connect(self.endpoints.clone(), Some(options)),
        )
        .await
        .map_err(|_| Error::Connect(format!("timed out connecting to {:?}", self.endpoints)))?
        .map_err(|e| Error::Connect(e.to_string()))?;

        tracing::info!("Connected to etcd at {:?}", self.endpoints);
        Ok(Arc::new(EtcdStore::new(client)))
    }

    fn describe(&self) -> String {
        format!("etcd {}", self.endpoints.join(","))
    }
}

/// One etcd client connection
pub struct EtcdStore {
    client: Client,
    /// Header revision of the last read per path
    read_revisions: Mutex<HashMap<String, i64>>,
    closed: AtomicBool,
}

impl EtcdStore {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            read_revisions: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn client(&self) -> Result<Client> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Store("connection closed".into()));
        }
        Ok(self.client.clone())
    }

    async fn record_revision(&self, path: &str, revision: Option<i64>) {
        if let Some(revision) = revision {
            self.read_revisions.lock().await.insert(path.to_string(), revision);
        }
    }
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    fn backend(&self) -> StoreBackend {
        StoreBackend::Lease
    }

    async fn create(&self, path: &str, value: &str, kind: EntryKind) -> Result<CreateOutcome> {
        let put_options = match kind {
            EntryKind::Persistent => None,
            EntryKind::Ephemeral { lease: Some(lease) } => Some(PutOptions::new().with_lease(lease)),
            EntryKind::Ephemeral { lease: None } => {
                return Err(Error::Store("ephemeral entries need a lease on etcd".into()))
            }
        };

        let txn = Txn::new()
            .when(vec![Compare::create_revision(path, CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(path, value, put_options)]);

        let resp = self.client()?.txn(txn).await.map_err(map_err)?;
        if resp.succeeded() {
            Ok(CreateOutcome::Created)
        } else {
            Ok(CreateOutcome::Exists)
        }
    }

    async fn delete(&self, path: &str) -> Result<bool> {
        let resp = self.client()?.delete(path, None).await.map_err(map_err)?;
        Ok(resp.deleted() > 0)
    }

    async fn get(&self, path: &str) -> Result<Option<Entry>> {
        let resp = self.client()?.get(path, None).await.map_err(map_err)?;
        self.record_revision(path, resp.header().map(|h| h.revision())).await;

        match resp.kvs().first() {
            Some(kv) => Ok(Some(Entry {
                path: path.to_string(),
                value: kv.value_str().map_err(map_err)?.to_string(),
            })),
            None => Ok(None),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<Entry>> {
        let key = format!("{}/", prefix);
        let resp = self
            .client()?
            .get(key, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(map_err)?;
        self.record_revision(prefix, resp.header().map(|h| h.revision())).await;

        let mut entries = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            let path = kv.key_str().map_err(map_err)?;
            if !is_direct_child(prefix, path) {
                continue;
            }
            entries.push(Entry {
                path: path.to_string(),
                value: kv.value_str().map_err(map_err)?.to_string(),
            });
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    async fn watch(&self, path: &str, scope: WatchScope) -> Result<PendingWatch> {
        let mut client = self.client()?;
        let start = self.read_revisions.lock().await.get(path).copied();

        let (key, mut options) = match scope {
            WatchScope::Entry => (path.to_string(), WatchOptions::new()),
            WatchScope::Children => (format!("{}/", path), WatchOptions::new().with_prefix()),
        };
        if let Some(revision) = start {
            options = options.with_start_revision(revision + 1);
        }

        let (mut watcher, mut stream) = client.watch(key, Some(options)).await.map_err(map_err)?;
        let (tx, pending) = PendingWatch::channel(path);
        let watched = path.to_string();

        tokio::spawn(
            async move {
                let event = loop {
                    let message = tokio::select! {
                        _ = tx.closed() => break None,
                        message = stream.message() => message,
                    };

                    let resp = match message {
                        Ok(Some(resp)) => resp,
                        Ok(None) | Err(_) => {
                            break Some(WatchEvent::new(WatchEventKind::SessionExpired, &watched))
                        }
                    };
                    if resp.canceled() {
                        break Some(WatchEvent::new(WatchEventKind::SessionExpired, &watched));
                    }

                    let classified = resp.events().iter().find_map(|event| {
                        let kv = event.kv()?;
                        let key = kv.key_str().ok()?;
                        let created = kv.version() == 1;
                        let kind = match (scope, event.event_type()) {
                            (WatchScope::Entry, EventType::Put) if created => WatchEventKind::EntryCreated,
                            (WatchScope::Entry, EventType::Put) => WatchEventKind::ValueChanged,
                            (WatchScope::Entry, EventType::Delete) => WatchEventKind::EntryDeleted,
                            (WatchScope::Children, _) if !is_direct_child(&watched, key) => return None,
                            (WatchScope::Children, EventType::Put) if !created => WatchEventKind::ValueChanged,
                            (WatchScope::Children, _) => WatchEventKind::ChildrenChanged,
                        };
                        Some(WatchEvent::new(kind, key))
                    });

                    if classified.is_some() {
                        break classified;
                    }
                };

                if let Some(event) = event {
                    let _ = tx.send(event);
                }
                if let Err(e) = watcher.cancel().await {
                    tracing::debug!("Failed to cancel etcd watcher: {}", e);
                }
            }
            .with_current_subscriber(),
        );

        Ok(pending)
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId> {
        let secs = ttl.as_secs().max(1) as i64;
        let resp = self.client()?.lease_grant(secs, None).await.map_err(map_err)?;
        Ok(resp.id())
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<Duration> {
        let (mut keeper, mut stream) = self.client()?.lease_keep_alive(lease).await.map_err(map_err)?;
        keeper.keep_alive().await.map_err(map_err)?;

        match stream.message().await.map_err(map_err)? {
            Some(resp) if resp.ttl() > 0 => Ok(Duration::from_secs(resp.ttl() as u64)),
            Some(_) => Err(Error::SessionLost(format!("lease {} expired", lease))),
            None => Err(Error::Transient(format!("keep-alive stream for lease {} ended", lease))),
        }
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        match self.client()?.lease_revoke(lease).await {
            Ok(_) => Ok(()),
            Err(e) => match map_err(e) {
                Error::SessionLost(_) => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!("Closed etcd connection");
        }
    }
}
