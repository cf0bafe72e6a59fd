//! Leader Election
//!
//! Resolves this instance's role against the coordination store with one
//! of two tie-break policies:
//!
//! - fixed path: every candidate tries to create the same ephemeral leader
//!   entry; the creator leads and everyone else follows its payload
//! - sorted prefix: every candidate creates `leader/<address>`; the lowest
//!   address in sorted order leads
//!
//! The engine resolves once during start and then loops: arm a watch,
//! handle its single event, resolve again. A lost session demotes the
//! instance to `Unknown` until its registrations are rebuilt.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::{EngineContext, Notification};
use crate::config::{RallyConfig, TieBreak};
use crate::error::{Error, Result};
use crate::paths::{child_name, member_path, PathLayout};
use crate::registrar::Ownership;
use crate::retry::sleep_or_cancel;
use crate::store::WatchEventKind;
use crate::watch::{Baseline, WatchLoop};

/// Role of this instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Role {
    /// Not resolved, or resolution was invalidated by a session loss
    #[default]
    Unknown,
    /// Resolution in progress
    Electing,
    /// This instance leads
    Leader,
    /// Another instance leads
    Follower,
    /// The service was stopped
    Stopped,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Unknown => write!(f, "UNKNOWN"),
            Role::Electing => write!(f, "ELECTING"),
            Role::Leader => write!(f, "LEADER"),
            Role::Follower => write!(f, "FOLLOWER"),
            Role::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// Published election state
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ElectionStatus {
    pub role: Role,
    /// Address of the current leader, when known
    pub current_leader: Option<String>,
    /// Watches armed by the engine so far
    pub watch_generation: u64,
}

impl ElectionStatus {
    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }
}

/// Election engine for one service
pub struct ElectionEngine {
    policy: TieBreak,
    address: String,
    leader_path: String,
    listing_retries: u32,
    ctx: EngineContext,
    watcher: WatchLoop,
    status: Arc<watch::Sender<ElectionStatus>>,
    /// Last leadership value handed to the notifier
    announced: Option<bool>,
}

impl ElectionEngine {
    pub fn new(config: &RallyConfig, ctx: EngineContext, status: Arc<watch::Sender<ElectionStatus>>) -> Self {
        let layout = PathLayout::new(&config.store.root, &config.service.app_name);
        let watcher = WatchLoop::new(
            "election",
            Arc::clone(&ctx.store),
            Arc::clone(&ctx.registrar),
            ctx.retry.clone(),
            ctx.cancel.clone(),
        );

        Self {
            policy: config.election.policy,
            address: config.service.address.clone(),
            leader_path: layout.leader_path(),
            listing_retries: config.retry.listing_retries,
            ctx,
            watcher,
            status,
            announced: None,
        }
    }

    /// Path this instance registers under
    pub fn own_path(&self) -> String {
        match self.policy {
            TieBreak::FixedPath => self.leader_path.clone(),
            TieBreak::SortedPrefix => member_path(&self.leader_path, &self.address),
        }
    }

    /// First resolution, run synchronously by `start`
    pub async fn bootstrap(&mut self) -> Result<Baseline> {
        tracing::info!(
            "Starting {} election for {} at {}",
            self.policy,
            self.address,
            self.leader_path
        );
        match self.settle().await {
            Err(e) => Err(self.fail(e)),
            ok => ok,
        }
    }

    /// Arm/handle/resolve until cancelled or a fatal error
    pub async fn run(mut self, mut baseline: Baseline) -> Result<()> {
        loop {
            let event = match self.watcher.next_event(&self.leader_path, &baseline).await {
                Ok(Some(event)) => event,
                Ok(None) => return Ok(()),
                Err(e) => return Err(self.fail(e)),
            };
            self.publish_generation();

            if event.kind == WatchEventKind::SessionExpired {
                if let Err(e) = self.recover().await {
                    return self.finish(e);
                }
            } else if self.policy == TieBreak::FixedPath && event.kind == WatchEventKind::EntryDeleted {
                tracing::info!("Leader entry {} deleted, re-electing", event.path);
            }

            baseline = match self.settle().await {
                Ok(baseline) => baseline,
                Err(e) => return self.finish(e),
            };
        }
    }

    fn finish(&mut self, e: Error) -> Result<()> {
        match e {
            Error::Cancelled => Ok(()),
            e => Err(self.fail(e)),
        }
    }

    fn fail(&mut self, e: Error) -> Error {
        tracing::error!("Election for {} failed: {}", self.address, e);
        self.publish(Role::Unknown, None);
        self.demote();
        e
    }

    /// Resolve, rebuilding registrations after session losses
    async fn settle(&mut self) -> Result<Baseline> {
        loop {
            match self.resolve().await {
                Err(e) if e.is_session_loss() => {
                    tracing::warn!("Session lost during election: {}", e);
                    self.recover().await?;
                }
                other => return other,
            }
        }
    }

    async fn recover(&mut self) -> Result<()> {
        let was = self.status.borrow().role;
        tracing::warn!("Session lost while {}, re-electing", was);
        self.publish(Role::Unknown, None);
        self.demote();

        if !sleep_or_cancel(&self.ctx.cancel, self.ctx.retry.backoff(1)).await {
            return Err(Error::Cancelled);
        }

        let registrar = Arc::clone(&self.ctx.registrar);
        self.ctx
            .retry
            .run("recover registrations", &self.ctx.cancel, || registrar.recover())
            .await
    }

    async fn resolve(&mut self) -> Result<Baseline> {
        let leader = self.status.borrow().current_leader.clone();
        self.publish(Role::Electing, leader);

        match self.policy {
            TieBreak::FixedPath => self.resolve_fixed().await,
            TieBreak::SortedPrefix => self.resolve_sorted().await,
        }
    }

    async fn resolve_fixed(&mut self) -> Result<Baseline> {
        let store = Arc::clone(&self.ctx.store);
        let registrar = Arc::clone(&self.ctx.registrar);
        let path = self.leader_path.clone();
        let address = self.address.clone();

        if registrar.is_live(&path).await {
            let current = self
                .ctx
                .retry
                .run("read leader entry", &self.ctx.cancel, || store.get(&path))
                .await?;
            if current.as_ref().map(|e| e.value.as_str()) == Some(address.as_str()) {
                self.resolved(Role::Leader, address.clone());
                return Ok(Baseline::Entry(Some(address)));
            }

            // Our claim is gone even though nothing reported it lost yet.
            registrar.mark_lost(&path).await;
            return Err(Error::SessionLost(format!("leader entry {} vanished", path)));
        }

        let claim = self
            .ctx
            .retry
            .run("claim leader entry", &self.ctx.cancel, || {
                registrar.register(&path, &address, Ownership::Exclusive)
            })
            .await;

        match claim {
            Ok(()) => {
                self.resolved(Role::Leader, address.clone());
                Ok(Baseline::Entry(Some(address)))
            }
            Err(Error::RegistrationConflict { owner, .. }) => {
                self.resolved(Role::Follower, owner.clone());
                Ok(Baseline::Entry(Some(owner)))
            }
            Err(e) => Err(e),
        }
    }

    async fn resolve_sorted(&mut self) -> Result<Baseline> {
        let store = Arc::clone(&self.ctx.store);
        let registrar = Arc::clone(&self.ctx.registrar);
        let own = self.own_path();
        let address = self.address.clone();

        if !registrar.is_live(&own).await {
            self.ctx
                .retry
                .run("register candidate", &self.ctx.cancel, || {
                    registrar.register(&own, &address, Ownership::Member)
                })
                .await?;
        }

        let mut attempt = 0u32;
        loop {
            let entries = self
                .ctx
                .retry
                .run("list candidates", &self.ctx.cancel, || store.list(&self.leader_path))
                .await?;

            let mut names: Vec<String> = entries
                .iter()
                .map(|entry| child_name(&entry.path).to_string())
                .collect();
            names.sort();

            if names.iter().any(|name| name == &address) {
                let leader = names[0].clone();
                let role = if leader == address { Role::Leader } else { Role::Follower };
                self.resolved(role, leader);
                return Ok(Baseline::Children(names));
            }

            if registrar.is_lost(&own).await {
                return Err(Error::SessionLost(format!("candidate entry {} lost", own)));
            }

            // A listing may lag behind our own write; only a missing entry is a loss.
            let stored = self
                .ctx
                .retry
                .run("read candidate entry", &self.ctx.cancel, || store.get(&own))
                .await?;
            if stored.is_none() {
                registrar.mark_lost(&own).await;
                return Err(Error::SessionLost(format!("candidate entry {} vanished", own)));
            }

            attempt += 1;
            if attempt > self.listing_retries {
                return Err(Error::FatalProtocol(format!(
                    "own entry {} missing from {} after {} listings",
                    own, self.leader_path, attempt
                )));
            }

            tracing::warn!(
                "Own entry {} not yet listed under {}, relisting ({}/{})",
                own,
                self.leader_path,
                attempt,
                self.listing_retries
            );
            if !sleep_or_cancel(&self.ctx.cancel, self.ctx.retry.backoff(attempt)).await {
                return Err(Error::Cancelled);
            }
        }
    }

    fn resolved(&mut self, role: Role, leader: String) {
        let previous = self.status.borrow().clone();
        if previous.role != role || previous.current_leader.as_deref() != Some(leader.as_str()) {
            match role {
                Role::Leader => tracing::info!("{} is now the leader", self.address),
                _ => tracing::info!("{} is {} (leader is {})", self.address, role, leader),
            }
        }

        self.publish(role, Some(leader));
        self.announce(role == Role::Leader);
    }

    fn publish(&self, role: Role, leader: Option<String>) {
        let generation = self.watcher.arm_count();
        self.status.send_modify(|status| {
            status.role = role;
            status.current_leader = leader;
            status.watch_generation = generation;
        });
    }

    fn publish_generation(&self) {
        let generation = self.watcher.arm_count();
        self.status.send_modify(|status| status.watch_generation = generation);
    }

    /// Queue a leadership notification when the value changes
    fn announce(&mut self, is_leader: bool) {
        if self.announced == Some(is_leader) {
            return;
        }
        self.announced = Some(is_leader);
        self.ctx.notify.enqueue(Notification::Leadership(is_leader));
    }

    /// Withdraw an announced leadership
    fn demote(&mut self) {
        if self.announced == Some(true) {
            self.announce(false);
        }
    }
}
