//! Member Discovery
//!
//! Tracks the live members registered under an app's discovery prefix.
//! Every fired watch triggers a full re-list; event payloads are never
//! trusted to patch the member set.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;

use super::{EngineContext, Notification};
use crate::config::RallyConfig;
use crate::error::{Error, Result};
use crate::paths::{child_name, member_path, PathLayout};
use crate::registrar::Ownership;
use crate::retry::sleep_or_cancel;
use crate::store::{Entry, WatchEventKind};
use crate::watch::{Baseline, WatchLoop};

/// A registered instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Member {
    /// Address (host:port)
    pub address: String,
    /// Payload of the member entry
    pub metadata: String,
    /// Store path of the member entry
    pub store_key: String,
}

/// Immutable view of the member set
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberSetSnapshot {
    /// Members sorted by address
    pub members: Vec<Member>,
    /// Incremented on every re-list
    pub revision: u64,
    /// When the listing was taken
    pub taken_at: chrono::DateTime<chrono::Utc>,
}

impl MemberSetSnapshot {
    /// Snapshot before the first listing
    pub fn empty() -> Self {
        Self {
            members: Vec::new(),
            revision: 0,
            taken_at: chrono::Utc::now(),
        }
    }

    /// Build a snapshot from the entries of one listing
    pub fn from_entries(entries: &[Entry], revision: u64) -> Self {
        let mut members: Vec<Member> = entries
            .iter()
            .map(|entry| Member {
                address: child_name(&entry.path).to_string(),
                metadata: entry.value.clone(),
                store_key: entry.path.clone(),
            })
            .collect();
        members.sort_by(|a, b| a.address.cmp(&b.address));

        Self {
            members,
            revision,
            taken_at: chrono::Utc::now(),
        }
    }

    /// Sorted member addresses
    pub fn addresses(&self) -> Vec<String> {
        self.members.iter().map(|m| m.address.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Discovery engine for one service
pub struct DiscoveryEngine {
    discovery_path: String,
    /// Own member path and payload, when registering
    own: Option<(String, String)>,
    ctx: EngineContext,
    watcher: WatchLoop,
    snapshot: Arc<watch::Sender<Arc<MemberSetSnapshot>>>,
    revision: u64,
    /// Addresses last handed to the notifier
    announced: Option<Vec<String>>,
}

impl DiscoveryEngine {
    pub fn new(
        config: &RallyConfig,
        ctx: EngineContext,
        snapshot: Arc<watch::Sender<Arc<MemberSetSnapshot>>>,
    ) -> Self {
        let layout = PathLayout::new(&config.store.root, &config.service.app_name);
        let discovery_path = layout.discovery_path();
        let own = config.discovery.register_self.then(|| {
            (
                member_path(&discovery_path, &config.service.address),
                config.service.metadata.clone(),
            )
        });
        let watcher = WatchLoop::new(
            "discovery",
            Arc::clone(&ctx.store),
            Arc::clone(&ctx.registrar),
            ctx.retry.clone(),
            ctx.cancel.clone(),
        );
        let revision = snapshot.borrow().revision;

        Self {
            discovery_path,
            own,
            ctx,
            watcher,
            snapshot,
            revision,
            announced: None,
        }
    }

    /// Register self and take the initial listing, run synchronously by `start`
    pub async fn bootstrap(&mut self) -> Result<Baseline> {
        tracing::info!("Starting discovery under {}", self.discovery_path);

        if let Some((path, metadata)) = self.own.clone() {
            let registrar = Arc::clone(&self.ctx.registrar);
            self.ctx
                .retry
                .run("register member", &self.ctx.cancel, || {
                    registrar.register(&path, &metadata, Ownership::Member)
                })
                .await?;
        }

        self.refresh().await
    }

    /// Arm/handle/re-list until cancelled or a fatal error
    pub async fn run(mut self, mut baseline: Baseline) -> Result<()> {
        loop {
            let event = match self.watcher.next_event(&self.discovery_path, &baseline).await {
                Ok(Some(event)) => event,
                Ok(None) => return Ok(()),
                Err(e) => return Err(self.fail(e)),
            };

            if event.kind == WatchEventKind::SessionExpired {
                if let Err(e) = self.recover().await {
                    return self.finish(e);
                }
            }

            baseline = match self.refresh().await {
                Ok(baseline) => baseline,
                Err(e) => return self.finish(e),
            };
        }
    }

    fn finish(&self, e: Error) -> Result<()> {
        match e {
            Error::Cancelled => Ok(()),
            e => Err(self.fail(e)),
        }
    }

    fn fail(&self, e: Error) -> Error {
        tracing::error!("Discovery under {} failed: {}", self.discovery_path, e);
        e
    }

    async fn recover(&mut self) -> Result<()> {
        tracing::warn!("Session lost, re-registering under {}", self.discovery_path);
        if !sleep_or_cancel(&self.ctx.cancel, self.ctx.retry.backoff(1)).await {
            return Err(Error::Cancelled);
        }

        let registrar = Arc::clone(&self.ctx.registrar);
        self.ctx
            .retry
            .run("recover registrations", &self.ctx.cancel, || registrar.recover())
            .await
    }

    /// List the whole prefix and publish the result
    async fn refresh(&mut self) -> Result<Baseline> {
        let store = Arc::clone(&self.ctx.store);
        let entries = self
            .ctx
            .retry
            .run("list members", &self.ctx.cancel, || store.list(&self.discovery_path))
            .await?;

        self.revision += 1;
        let snapshot = Arc::new(MemberSetSnapshot::from_entries(&entries, self.revision));
        let addresses = snapshot.addresses();
        let baseline = Baseline::Children(addresses.clone());

        tracing::debug!(
            "Member listing {} under {}: {} members",
            self.revision,
            self.discovery_path,
            snapshot.len()
        );
        self.snapshot.send_replace(snapshot);

        if self.announced.as_ref() != Some(&addresses) {
            tracing::info!("Members under {}: {:?}", self.discovery_path, addresses);
            self.announced = Some(addresses.clone());
            self.ctx.notify.enqueue(Notification::Membership(addresses));
        }

        Ok(baseline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendKind, ServiceMode, StoreConfig};
    use crate::registrar::LeaseRegistrar;
    use crate::store::testing::ScriptedStore;
    use crate::store::{CoordinationStore, MemoryCluster, StoreBackend};
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn config(address: &str, register_self: bool) -> RallyConfig {
        let mut config = RallyConfig::new(
            "billing",
            address,
            ServiceMode::Discovery,
            StoreConfig::memory(BackendKind::MemorySession),
        );
        config.discovery.register_self = register_self;
        config
    }

    async fn discovery(
        cluster: &MemoryCluster,
        config: &RallyConfig,
        debounce: Duration,
    ) -> (DiscoveryEngine, watch::Receiver<Arc<MemberSetSnapshot>>, mpsc::UnboundedReceiver<Notification>, CancellationToken) {
        let conn = Arc::new(cluster.connect(StoreBackend::Session).await);
        discovery_on(conn, config, debounce)
    }

    fn discovery_on(
        conn: Arc<dyn CoordinationStore>,
        config: &RallyConfig,
        debounce: Duration,
    ) -> (DiscoveryEngine, watch::Receiver<Arc<MemberSetSnapshot>>, mpsc::UnboundedReceiver<Notification>, CancellationToken) {
        let cancel = CancellationToken::new();
        let (outbox, notes) = mpsc::unbounded_channel();
        let ctx = EngineContext::new(conn, config, debounce, outbox, cancel.clone());
        let (snapshot_tx, snapshot) = watch::channel(Arc::new(MemberSetSnapshot::empty()));
        (DiscoveryEngine::new(config, ctx, Arc::new(snapshot_tx)), snapshot, notes, cancel)
    }

    async fn next_membership(notes: &mut mpsc::UnboundedReceiver<Notification>) -> Vec<String> {
        loop {
            match notes.recv().await.unwrap() {
                Notification::Membership(addresses) => return addresses,
                _ => continue,
            }
        }
    }

    #[test]
    fn test_snapshot_sorted_by_address() {
        let entries = vec![
            Entry { path: "/a/discovery/10.0.0.2".into(), value: "b".into() },
            Entry { path: "/a/discovery/10.0.0.1".into(), value: "a".into() },
        ];
        let snapshot = MemberSetSnapshot::from_entries(&entries, 4);
        assert_eq!(snapshot.addresses(), vec!["10.0.0.1", "10.0.0.2"]);
        assert_eq!(snapshot.members[0].metadata, "a");
        assert_eq!(snapshot.members[0].store_key, "/a/discovery/10.0.0.1");
        assert_eq!(snapshot.revision, 4);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["members"][1]["address"], "10.0.0.2");
        assert_eq!(json["revision"], 4);
    }

    #[tokio::test]
    async fn test_discovery_converges_to_survivors() {
        let cluster = MemoryCluster::new();

        let mut members = Vec::new();
        for i in 1..=5 {
            let config = config(&format!("10.0.0.{}", i), true);
            let (mut engine, _, _, cancel) = discovery(&cluster, &config, Duration::ZERO).await;
            engine.bootstrap().await.unwrap();
            members.push((engine, cancel));
        }

        // Deregister two members without any watcher observing it.
        for (engine, _) in members.iter().take(2) {
            engine.ctx.registrar.deregister_all().await;
        }

        let observer_config = config("", false);
        let (mut observer, snapshot, mut notes, _cancel) = discovery(&cluster, &observer_config, Duration::ZERO).await;
        observer.bootstrap().await.unwrap();

        assert_eq!(snapshot.borrow().addresses(), vec!["10.0.0.3", "10.0.0.4", "10.0.0.5"]);
        assert_eq!(next_membership(&mut notes).await, vec!["10.0.0.3", "10.0.0.4", "10.0.0.5"]);
    }

    #[tokio::test]
    async fn test_watch_relists_on_change() {
        let cluster = MemoryCluster::new();
        let (mut first, mut snapshot, mut notes, cancel) =
            discovery(&cluster, &config("10.0.0.1", true), Duration::ZERO).await;

        let baseline = first.bootstrap().await.unwrap();
        assert_eq!(next_membership(&mut notes).await, vec!["10.0.0.1"]);
        let task = tokio::spawn(first.run(baseline));

        let (mut second, _, _, second_cancel) = discovery(&cluster, &config("10.0.0.2", true), Duration::ZERO).await;
        second.bootstrap().await.unwrap();

        assert_eq!(next_membership(&mut notes).await, vec!["10.0.0.1", "10.0.0.2"]);
        snapshot.changed().await.unwrap();
        assert!(snapshot.borrow().revision >= 2);

        second.ctx.registrar.deregister_all().await;
        assert_eq!(next_membership(&mut notes).await, vec!["10.0.0.1"]);

        cancel.cancel();
        second_cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_membership_is_debounced() {
        let cluster = MemoryCluster::new();
        let (mut observer, _, mut notes, cancel) =
            discovery(&cluster, &config("10.0.0.1", true), Duration::from_secs(15)).await;
        let baseline = observer.bootstrap().await.unwrap();
        let task = tokio::spawn(observer.run(baseline));

        let conn = cluster.connect(StoreBackend::Session).await;
        let registrar = LeaseRegistrar::new(Arc::new(conn), Duration::from_secs(20), 3, cancel.clone());
        for i in 2..=4 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            registrar
                .register(&format!("/rallypoint/common/billing/discovery/10.0.0.{}", i), "", Ownership::Member)
                .await
                .unwrap();
        }

        let start = tokio::time::Instant::now();
        let settled = next_membership(&mut notes).await;
        assert_eq!(settled, vec!["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4"]);
        assert!(start.elapsed() >= Duration::from_secs(14));
        assert!(notes.try_recv().is_err());

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_own_entry_restored_after_unobserved_expiry() {
        let cluster = MemoryCluster::new();
        let conn = Arc::new(cluster.connect(StoreBackend::Session).await);
        let store = Arc::new(ScriptedStore::new(conn).expire_before_next_watch());
        let (mut engine, snapshot, _notes, cancel) =
            discovery_on(store, &config("10.0.0.1", true), Duration::ZERO);

        let baseline = engine.bootstrap().await.unwrap();
        let arms = engine.watcher.arm_counter();
        let task = tokio::spawn(engine.run(baseline));

        // The session is gone before the first watch goes in; nothing fires for it.
        while arms.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(cluster.value("/rallypoint/common/billing/discovery/10.0.0.1").await.is_some());
        assert_eq!(snapshot.borrow().addresses(), vec!["10.0.0.1"]);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }
}
