//! Watch Arm/Handle Cycle
//!
//! Store watches fire once. [`WatchLoop::next_event`] arms a fresh watch,
//! yields exactly one event, and leaves re-arming to the caller, so every
//! arm is an explicit step of the owning engine and is counted.
//!
//! After arming, the watched state is read back and compared with the
//! caller's baseline. A change that slipped in between the caller's last
//! read and the arm is reported as a synthesized event instead of being
//! missed. The same goes for a store session replaced in that gap: the
//! registrar's audit turns it into `SessionExpired`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::paths::child_name;
use crate::registrar::LeaseRegistrar;
use crate::retry::RetryPolicy;
use crate::store::{CoordinationStore, WatchEvent, WatchEventKind, WatchScope};

/// State the caller last observed at the watched path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Baseline {
    /// Value of the entry, `None` if absent
    Entry(Option<String>),
    /// Sorted child names
    Children(Vec<String>),
}

impl Baseline {
    fn scope(&self) -> WatchScope {
        match self {
            Baseline::Entry(_) => WatchScope::Entry,
            Baseline::Children(_) => WatchScope::Children,
        }
    }
}

/// Single-fire watch driver owned by one engine
pub struct WatchLoop {
    label: String,
    store: Arc<dyn CoordinationStore>,
    registrar: Arc<LeaseRegistrar>,
    losses: watch::Receiver<u64>,
    retry: RetryPolicy,
    cancel: CancellationToken,
    arms: Arc<AtomicU64>,
}

impl WatchLoop {
    pub fn new(
        label: &str,
        store: Arc<dyn CoordinationStore>,
        registrar: Arc<LeaseRegistrar>,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            label: label.to_string(),
            store,
            losses: registrar.subscribe_losses(),
            registrar,
            retry,
            cancel,
            arms: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of watches armed so far
    pub fn arm_count(&self) -> u64 {
        self.arms.load(Ordering::SeqCst)
    }

    /// Shared handle to the arm counter
    pub fn arm_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.arms)
    }

    /// Arm a watch on `path` and wait for its single event.
    ///
    /// Returns `Ok(None)` once cancelled. A registration loss, reported by
    /// the registrar or found by its session audit, surfaces as
    /// `SessionExpired`.
    pub async fn next_event(&mut self, path: &str, baseline: &Baseline) -> Result<Option<WatchEvent>> {
        let scope = baseline.scope();
        let store = Arc::clone(&self.store);

        let mut pending = match self
            .retry
            .run("arm watch", &self.cancel, || store.watch(path, scope))
            .await
        {
            Ok(pending) => pending,
            Err(Error::Cancelled) => return Ok(None),
            Err(e) => return Err(e),
        };

        let count = self.arms.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!("{} watch armed on {} (count {})", self.label, pending.path(), count);

        // The watch sits on the current session, so anything older is gone.
        if self.registrar.audit_session().await || self.losses.has_changed().unwrap_or(false) {
            self.losses.borrow_and_update();
            tracing::debug!("{} registrations lost before the watch was armed", self.label);
            return Ok(Some(WatchEvent::new(WatchEventKind::SessionExpired, path)));
        }

        match self.drift(path, baseline).await {
            Ok(Some(drifted)) => {
                // A real event that already fired says more than the diff.
                if let Some(event) = pending.try_fired() {
                    return Ok(Some(event));
                }
                tracing::debug!("{} state at {} moved before the watch was armed", self.label, path);
                return Ok(Some(drifted));
            }
            Ok(None) => {}
            Err(Error::Cancelled) => return Ok(None),
            Err(e) => return Err(e),
        }

        let event = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            _ = next_loss(&mut self.losses) => {
                Some(WatchEvent::new(WatchEventKind::SessionExpired, path))
            }
            fired = pending.fired() => {
                Some(fired.unwrap_or_else(|| WatchEvent::new(WatchEventKind::SessionExpired, path)))
            }
        };

        if let Some(event) = &event {
            tracing::debug!("{} watch fired: {} at {}", self.label, event.kind, event.path);
        }
        Ok(event)
    }

    async fn drift(&self, path: &str, baseline: &Baseline) -> Result<Option<WatchEvent>> {
        let store = Arc::clone(&self.store);

        match baseline {
            Baseline::Entry(expected) => {
                let current = self
                    .retry
                    .run("read watched entry", &self.cancel, || store.get(path))
                    .await?
                    .map(|entry| entry.value);

                let kind = match (expected, &current) {
                    (a, b) if a == b => return Ok(None),
                    (Some(_), None) => WatchEventKind::EntryDeleted,
                    (None, Some(_)) => WatchEventKind::EntryCreated,
                    _ => WatchEventKind::ValueChanged,
                };
                Ok(Some(WatchEvent::new(kind, path)))
            }
            Baseline::Children(expected) => {
                let current: Vec<String> = self
                    .retry
                    .run("list watched children", &self.cancel, || store.list(path))
                    .await?
                    .iter()
                    .map(|entry| child_name(&entry.path).to_string())
                    .collect();

                if &current == expected {
                    Ok(None)
                } else {
                    Ok(Some(WatchEvent::new(WatchEventKind::ChildrenChanged, path)))
                }
            }
        }
    }
}

/// Resolves on the next loss; never resolves once the registrar is gone
async fn next_loss(losses: &mut watch::Receiver<u64>) {
    if losses.changed().await.is_err() {
        std::future::pending::<()>().await;
    }
}
