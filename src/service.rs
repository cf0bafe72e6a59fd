//! Coordination Service
//!
//! The consumer-facing handle. A service owns one store connection while
//! running, drives an election or discovery engine on a background task,
//! and delivers resolved state to user callbacks from a dedicated
//! dispatcher task.
//!
//! Start and stop are serialised by one lifecycle mutex. Callbacks never
//! run while it is held, so a callback may stop its own service:
//!
//! ```ignore
//! let handle = service.clone();
//! service
//!     .set_leadership_callback(move |is_leader| {
//!         if !is_leader {
//!             let handle = handle.clone();
//!             tokio::spawn(async move { handle.stop().await });
//!         }
//!     })
//!     .await;
//! ```

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;
use tracing::Dispatch;

use crate::config::{FailurePolicy, RallyConfig, ServiceMode};
use crate::debounce::DebounceAggregator;
use crate::error::{Error, Result};
use crate::paths::PathLayout;
use crate::registrar::LeaseRegistrar;
use crate::state::{
    DiscoveryEngine, ElectionEngine, ElectionStatus, EngineContext, MemberSetSnapshot, Notification, Role,
};
use crate::store::{
    connector_for, CoordinationStore, CreateOutcome, EntryKind, MemoryCluster, StoreBackend, StoreConnector,
};
use crate::watch::Baseline;

/// How long `stop` waits for the engine task before aborting it
const ENGINE_STOP_TIMEOUT: Duration = Duration::from_secs(5);

type LeadershipCallback = Arc<dyn Fn(bool) + Send + Sync>;
type MembershipCallback = Arc<dyn Fn(&[String]) + Send + Sync>;
type FatalCallback = Arc<dyn Fn(&Error) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    leadership: Option<LeadershipCallback>,
    membership: Option<MembershipCallback>,
    fatal: Option<FatalCallback>,
    /// Overrides `[discovery] debounce_secs`
    membership_debounce: Option<Duration>,
}

struct Running {
    cancel: CancellationToken,
    store: Arc<dyn CoordinationStore>,
    registrar: Arc<LeaseRegistrar>,
    notify: DebounceAggregator<Notification>,
    engine: JoinHandle<()>,
}

enum Lifecycle {
    Idle,
    Running(Running),
    Stopped,
}

enum Engine {
    Election(ElectionEngine),
    Discovery(DiscoveryEngine),
}

impl Engine {
    async fn run(self, baseline: Baseline) -> Result<()> {
        match self {
            Engine::Election(engine) => engine.run(baseline).await,
            Engine::Discovery(engine) => engine.run(baseline).await,
        }
    }
}

struct Inner {
    config: RallyConfig,
    connector: Arc<dyn StoreConnector>,
    dispatch: Dispatch,
    lifecycle: Mutex<Lifecycle>,
    callbacks: Arc<RwLock<Callbacks>>,
    status: Arc<watch::Sender<ElectionStatus>>,
    snapshot: Arc<watch::Sender<Arc<MemberSetSnapshot>>>,
    last_error: Arc<RwLock<Option<Arc<Error>>>>,
    running: AtomicBool,
}

/// Builds a [`CoordinationService`]
pub struct ServiceBuilder {
    config: RallyConfig,
    connector: Option<Arc<dyn StoreConnector>>,
    cluster: Option<MemoryCluster>,
    dispatch: Dispatch,
}

impl ServiceBuilder {
    pub fn new(config: RallyConfig) -> Self {
        Self {
            config,
            connector: None,
            cluster: None,
            dispatch: Dispatch::none(),
        }
    }

    /// Use this connector instead of the one `[store]` describes
    pub fn connector(mut self, connector: Arc<dyn StoreConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Cluster memory backends attach to
    pub fn memory_cluster(mut self, cluster: MemoryCluster) -> Self {
        self.cluster = Some(cluster);
        self
    }

    /// Where the service's diagnostics go; discarded by default
    pub fn dispatch(mut self, dispatch: Dispatch) -> Self {
        self.dispatch = dispatch;
        self
    }

    /// Validate the configuration and build the service
    pub fn build(self) -> Result<CoordinationService> {
        self.config.validate()?;

        let connector = match self.connector {
            Some(connector) => connector,
            None => connector_for(&self.config.store, &self.cluster.unwrap_or_default())?,
        };

        let (status, _) = watch::channel(ElectionStatus::default());
        let (snapshot, _) = watch::channel(Arc::new(MemberSetSnapshot::empty()));

        Ok(CoordinationService {
            inner: Arc::new(Inner {
                config: self.config,
                connector,
                dispatch: self.dispatch,
                lifecycle: Mutex::new(Lifecycle::Idle),
                callbacks: Arc::new(RwLock::new(Callbacks::default())),
                status: Arc::new(status),
                snapshot: Arc::new(snapshot),
                last_error: Arc::new(RwLock::new(None)),
                running: AtomicBool::new(false),
            }),
        })
    }
}

/// Election or discovery over a coordination store
#[derive(Clone)]
pub struct CoordinationService {
    inner: Arc<Inner>,
}

impl CoordinationService {
    /// Build a service over `connector`
    pub fn new(config: RallyConfig, connector: Arc<dyn StoreConnector>) -> Result<Self> {
        ServiceBuilder::new(config).connector(connector).build()
    }

    pub fn builder(config: RallyConfig) -> ServiceBuilder {
        ServiceBuilder::new(config)
    }

    pub fn config(&self) -> &RallyConfig {
        &self.inner.config
    }

    /// Connect, register and resolve the initial state.
    ///
    /// Returns once the first election result or member listing is known;
    /// everything after that happens in the background. Starting a running
    /// service is a no-op.
    pub async fn start(&self) -> Result<()> {
        let dispatch = self.inner.dispatch.clone();
        self.start_inner().with_subscriber(dispatch).await
    }

    async fn start_inner(&self) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if matches!(*lifecycle, Lifecycle::Running(_)) {
            return Ok(());
        }

        let config = &self.inner.config;
        tracing::info!(
            "Starting {} service for {} ({}) on {}",
            config.service.mode,
            config.service.app_name,
            config.service.address,
            self.inner.connector.describe()
        );

        let store = self.inner.connector.connect().await?;
        if let Err(e) = ensure_app_path(store.as_ref(), config).await {
            store.close().await;
            return Err(e);
        }

        let debounce = match config.service.mode {
            ServiceMode::Election => config.election_debounce(),
            ServiceMode::Discovery => self
                .inner
                .callbacks
                .read()
                .await
                .membership_debounce
                .unwrap_or_else(|| config.discovery_debounce()),
        };

        let cancel = CancellationToken::new();
        let (outbox, inbox) = mpsc::unbounded_channel();
        let ctx = EngineContext::new(Arc::clone(&store), config, debounce, outbox.clone(), cancel.clone());
        let registrar = Arc::clone(&ctx.registrar);
        let notify = ctx.notify.clone();

        self.inner.status.send_replace(ElectionStatus::default());
        self.inner.last_error.write().await.take();

        let bootstrapped = match config.service.mode {
            ServiceMode::Election => {
                let mut engine = ElectionEngine::new(config, ctx, Arc::clone(&self.inner.status));
                engine.bootstrap().await.map(|baseline| (Engine::Election(engine), baseline))
            }
            ServiceMode::Discovery => {
                let mut engine = DiscoveryEngine::new(config, ctx, Arc::clone(&self.inner.snapshot));
                engine.bootstrap().await.map(|baseline| (Engine::Discovery(engine), baseline))
            }
        };

        let (engine, baseline) = match bootstrapped {
            Ok(bootstrapped) => bootstrapped,
            Err(e) => {
                tracing::error!("Failed to start: {}", e);
                cancel.cancel();
                registrar.deregister_all().await;
                store.close().await;
                self.inner.status.send_modify(|status| status.role = Role::Unknown);
                return Err(e);
            }
        };

        tokio::spawn(
            dispatch_notifications(
                inbox,
                Arc::clone(&self.inner.callbacks),
                Arc::clone(&self.inner.last_error),
                config.failure_policy(),
                cancel.clone(),
            )
            .with_current_subscriber(),
        );

        let engine = tokio::spawn(
            async move {
                if let Err(e) = engine.run(baseline).await {
                    let _ = outbox.send(Notification::Fatal(Arc::new(e)));
                }
            }
            .with_current_subscriber(),
        );

        *lifecycle = Lifecycle::Running(Running {
            cancel,
            store,
            registrar,
            notify,
            engine,
        });
        self.inner.running.store(true, Ordering::SeqCst);

        tracing::info!("Service for {} started", config.service.app_name);
        Ok(())
    }

    /// Stop background work, remove this instance's entries and close the
    /// connection. Safe to call repeatedly or before `start`.
    pub async fn stop(&self) {
        let dispatch = self.inner.dispatch.clone();
        self.stop_inner().with_subscriber(dispatch).await
    }

    async fn stop_inner(&self) {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        let running = match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Running(running) => running,
            other => {
                *lifecycle = other;
                return;
            }
        };

        tracing::info!("Stopping service for {}", self.inner.config.service.app_name);
        running.cancel.cancel();

        let mut engine = running.engine;
        if tokio::time::timeout(ENGINE_STOP_TIMEOUT, &mut engine).await.is_err() {
            tracing::warn!("Engine did not stop within {:?}, aborting", ENGINE_STOP_TIMEOUT);
            engine.abort();
        }

        running.registrar.deregister_all().await;
        running.store.close().await;

        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.status.send_modify(|status| {
            status.role = Role::Stopped;
            status.current_leader = None;
        });
        tracing::info!("Service for {} stopped", self.inner.config.service.app_name);
    }

    /// Called with `true`/`false` whenever this instance gains or loses leadership
    pub async fn set_leadership_callback<F>(&self, callback: F)
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.inner.callbacks.write().await.leadership = Some(Arc::new(callback));
    }

    /// Called with the sorted member addresses once they settle for
    /// `debounce_secs`. A running discovery service switches to the new
    /// debounce right away.
    pub async fn set_membership_callback<F>(&self, callback: F, debounce_secs: u64)
    where
        F: Fn(&[String]) + Send + Sync + 'static,
    {
        let debounce = Duration::from_secs(debounce_secs);
        {
            let mut callbacks = self.inner.callbacks.write().await;
            callbacks.membership = Some(Arc::new(callback));
            callbacks.membership_debounce = Some(debounce);
        }

        if self.inner.config.service.mode != ServiceMode::Discovery {
            return;
        }
        if let Lifecycle::Running(running) = &*self.inner.lifecycle.lock().await {
            running.notify.set_delay(debounce);
        }
    }

    /// Called when the engine stops on a non-recoverable error
    pub async fn set_fatal_callback<F>(&self, callback: F)
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.inner.callbacks.write().await.fatal = Some(Arc::new(callback));
    }

    pub fn is_leader(&self) -> bool {
        self.inner.status.borrow().is_leader()
    }

    pub fn role(&self) -> Role {
        self.inner.status.borrow().role
    }

    pub fn current_leader(&self) -> Option<String> {
        self.inner.status.borrow().current_leader.clone()
    }

    /// Election state updates
    pub fn election_status(&self) -> watch::Receiver<ElectionStatus> {
        self.inner.status.subscribe()
    }

    /// Member snapshot updates
    pub fn membership(&self) -> watch::Receiver<Arc<MemberSetSnapshot>> {
        self.inner.snapshot.subscribe()
    }

    /// Member snapshots as a stream
    pub fn membership_stream(&self) -> WatchStream<Arc<MemberSetSnapshot>> {
        WatchStream::new(self.membership())
    }

    /// Latest member addresses, sorted
    pub fn members(&self) -> Vec<String> {
        self.inner.snapshot.borrow().addresses()
    }

    /// Error that stopped the engine, if any
    pub async fn last_error(&self) -> Option<Arc<Error>> {
        self.inner.last_error.read().await.clone()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }
}

/// Hierarchical session stores need the app node before ephemeral children
async fn ensure_app_path(store: &dyn CoordinationStore, config: &RallyConfig) -> Result<()> {
    if store.backend() != StoreBackend::Session {
        return Ok(());
    }

    let layout = PathLayout::new(&config.store.root, &config.service.app_name);
    if store.create(&layout.app_path(), "", EntryKind::Persistent).await? == CreateOutcome::Created {
        tracing::debug!("Created {}", layout.app_path());
    }
    Ok(())
}

fn invoke<F: FnOnce()>(what: &str, callback: F) {
    if std::panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
        tracing::error!("{} callback panicked", what);
    }
}

async fn dispatch_notifications(
    mut inbox: mpsc::UnboundedReceiver<Notification>,
    callbacks: Arc<RwLock<Callbacks>>,
    last_error: Arc<RwLock<Option<Arc<Error>>>>,
    policy: FailurePolicy,
    cancel: CancellationToken,
) {
    loop {
        let notification = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            notification = inbox.recv() => match notification {
                Some(notification) => notification,
                None => break,
            },
        };

        match notification {
            Notification::Leadership(is_leader) => {
                let callback = callbacks.read().await.leadership.clone();
                if let Some(callback) = callback {
                    invoke("Leadership", || callback(is_leader));
                }
            }
            Notification::Membership(addresses) => {
                let callback = callbacks.read().await.membership.clone();
                if let Some(callback) = callback {
                    invoke("Membership", || callback(&addresses));
                }
            }
            Notification::Fatal(error) => {
                tracing::error!("Coordination stopped on a fatal error: {}", error);
                *last_error.write().await = Some(Arc::clone(&error));

                let callback = callbacks.read().await.fatal.clone();
                if let Some(callback) = callback {
                    invoke("Fatal", || callback(&error));
                }

                if let FailurePolicy::Exit { grace, code } = policy {
                    tracing::error!("Exiting with code {} in {:?}", code, grace);
                    tokio::time::sleep(grace).await;
                    std::process::exit(code);
                }
            }
        }
    }

    tracing::debug!("Notification dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendKind, StoreConfig};
    use crate::store::StoreBackend;

    fn config(address: &str, mode: ServiceMode) -> RallyConfig {
        RallyConfig::new("billing", address, mode, StoreConfig::memory(BackendKind::MemorySession))
    }

    fn service(cluster: &MemoryCluster, config: RallyConfig) -> CoordinationService {
        CoordinationService::builder(config)
            .memory_cluster(cluster.clone())
            .build()
            .unwrap()
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        tokio::time::timeout(Duration::from_secs(30), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_two_instances_one_leader_and_sorted_members() {
        let cluster = MemoryCluster::new();
        let a = service(&cluster, config("10.0.0.1", ServiceMode::Election));
        let b = service(&cluster, config("10.0.0.2", ServiceMode::Election));

        let (ra, rb) = tokio::join!(a.start(), b.start());
        ra.unwrap();
        rb.unwrap();
        assert!(a.is_leader() ^ b.is_leader());
        assert_eq!(a.current_leader(), b.current_leader());

        let observer = service(&cluster, {
            let mut c = config("", ServiceMode::Discovery);
            c.discovery.register_self = false;
            c
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        observer
            .set_membership_callback(move |members| { let _ = tx.send(members.to_vec()); }, 0)
            .await;
        observer.start().await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), Vec::<String>::new());

        let da = service(&cluster, config("10.0.0.1", ServiceMode::Discovery));
        let db = service(&cluster, config("10.0.0.2", ServiceMode::Discovery));
        let (ra, rb) = tokio::join!(da.start(), db.start());
        ra.unwrap();
        rb.unwrap();

        let settled = loop {
            let members = rx.recv().await.unwrap();
            if members.len() == 2 {
                break members;
            }
        };
        assert_eq!(settled, vec!["10.0.0.1", "10.0.0.2"]);
        assert_eq!(observer.members(), vec!["10.0.0.1", "10.0.0.2"]);

        for svc in [&a, &b, &da, &db, &observer] {
            svc.stop().await;
        }
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let cluster = MemoryCluster::new();
        let svc = service(&cluster, config("10.0.0.1", ServiceMode::Election));

        svc.stop().await;
        svc.start().await.unwrap();
        svc.start().await.unwrap();
        assert!(svc.is_running());

        svc.stop().await;
        svc.stop().await;
        assert!(!svc.is_running());
        assert_eq!(svc.role(), Role::Stopped);
        assert!(cluster.value("/rallypoint/common/billing/leader").await.is_none());

        // A stopped service can start again.
        svc.start().await.unwrap();
        assert!(svc.is_leader());
        svc.stop().await;
    }

    #[tokio::test]
    async fn test_config_error_fails_fast() {
        let mut bad = config("10.0.0.1", ServiceMode::Election);
        bad.store.endpoints.clear();
        let result = CoordinationService::builder(bad).build();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_connect_error_leaves_no_state() {
        let cluster = MemoryCluster::new();
        let connector = cluster.connector(StoreBackend::Session);
        connector.refuse_connections(true);
        let svc = CoordinationService::new(
            config("10.0.0.1", ServiceMode::Election),
            Arc::new(connector.clone()),
        )
        .unwrap();

        assert!(matches!(svc.start().await, Err(Error::Connect(_))));
        assert!(!svc.is_running());
        assert!(cluster.entries().await.is_empty());

        connector.refuse_connections(false);
        svc.start().await.unwrap();
        assert!(svc.is_leader());
        svc.stop().await;
    }

    #[tokio::test]
    async fn test_failover_after_leader_stops() {
        let cluster = MemoryCluster::new();
        let a = service(&cluster, config("10.0.0.1", ServiceMode::Election));
        let b = service(&cluster, config("10.0.0.2", ServiceMode::Election));
        let (tx, mut rx) = mpsc::unbounded_channel();
        b.set_leadership_callback(move |is_leader| { let _ = tx.send(is_leader); }).await;

        a.start().await.unwrap();
        b.start().await.unwrap();
        assert!(a.is_leader());
        assert!(!rx.recv().await.unwrap());

        a.stop().await;
        assert!(rx.recv().await.unwrap());
        assert!(b.is_leader());
        assert_eq!(b.current_leader().as_deref(), Some("10.0.0.2"));
        b.stop().await;
    }

    #[tokio::test]
    async fn test_callback_can_stop_its_own_service() {
        let cluster = MemoryCluster::new();
        let svc = service(&cluster, config("10.0.0.1", ServiceMode::Election));

        let handle = svc.clone();
        svc.set_leadership_callback(move |is_leader| {
            if is_leader {
                let handle = handle.clone();
                tokio::spawn(async move { handle.stop().await });
            }
        })
        .await;

        svc.start().await.unwrap();
        wait_until(|| !svc.is_running()).await;
        assert_eq!(svc.role(), Role::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_is_surfaced() {
        let cluster = MemoryCluster::new();
        let connector = cluster.connector(StoreBackend::Session);
        let svc = CoordinationService::new(
            config("10.0.0.1", ServiceMode::Election),
            Arc::new(connector.clone()),
        )
        .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        svc.set_fatal_callback(move |e| { let _ = tx.send(e.to_string()); }).await;
        svc.start().await.unwrap();
        assert!(svc.is_leader());

        let live = connector.last_connection().await.unwrap();
        live.inject_transient_failures(1000);

        let other = cluster.connect(StoreBackend::Session).await;
        other.delete("/rallypoint/common/billing/leader").await.unwrap();

        let message = rx.recv().await.unwrap();
        assert!(message.contains("failed after"));
        assert!(matches!(svc.last_error().await.as_deref(), Some(Error::FatalProtocol(_))));
        assert_eq!(svc.role(), Role::Unknown);
        assert!(svc.is_running());

        live.inject_transient_failures(0);
        svc.stop().await;
        assert!(!svc.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_backend_recovers_membership() {
        let cluster = MemoryCluster::new();
        let connector = cluster.connector(StoreBackend::Lease);
        let mut cfg = config("10.0.0.1", ServiceMode::Discovery);
        cfg.store.backend = BackendKind::MemoryLease;
        cfg.discovery.debounce_secs = 0;
        let svc = CoordinationService::new(cfg, Arc::new(connector.clone())).unwrap();

        svc.start().await.unwrap();
        assert_eq!(svc.members(), vec!["10.0.0.1"]);

        let mut snapshots = svc.membership();
        connector.last_connection().await.unwrap().expire_session().await;

        // Entry drops with its lease, then comes back once re-registered.
        let mut saw_empty = false;
        loop {
            snapshots.changed().await.unwrap();
            let members = snapshots.borrow_and_update().addresses();
            if members.is_empty() {
                saw_empty = true;
            } else if saw_empty && members == vec!["10.0.0.1".to_string()] {
                break;
            }
        }
        svc.stop().await;
        assert!(cluster.entries().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_membership_debounce_changes_while_running() {
        let cluster = MemoryCluster::new();
        let observer = service(&cluster, config("10.0.0.1", ServiceMode::Discovery));
        observer.start().await.unwrap();
        let started = tokio::time::Instant::now();

        let (tx, mut rx) = mpsc::unbounded_channel();
        observer
            .set_membership_callback(move |members| { let _ = tx.send(members.to_vec()); }, 0)
            .await;

        let joiner = service(&cluster, config("10.0.0.2", ServiceMode::Discovery));
        joiner.start().await.unwrap();

        let settled = loop {
            let members = rx.recv().await.unwrap();
            if members.len() == 2 {
                break members;
            }
        };
        assert_eq!(settled, vec!["10.0.0.1", "10.0.0.2"]);
        assert!(started.elapsed() < Duration::from_secs(15));

        joiner.stop().await;
        observer.stop().await;
    }
}
