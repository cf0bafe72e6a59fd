//! Coordination State Module
//!
//! Leader election and member discovery engines. Both run an explicit
//! resolve / arm / handle cycle against the coordination store and report
//! resolved state through watch channels and debounced notifications.

pub mod election;
mod membership;

pub use election::{ElectionEngine, ElectionStatus, Role};
pub use membership::{DiscoveryEngine, Member, MemberSetSnapshot};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::RallyConfig;
use crate::debounce::DebounceAggregator;
use crate::error::Error;
use crate::registrar::LeaseRegistrar;
use crate::retry::RetryPolicy;
use crate::store::CoordinationStore;

/// Event delivered to user callbacks
#[derive(Debug, Clone)]
pub enum Notification {
    /// This instance gained or lost leadership
    Leadership(bool),
    /// Settled member addresses, sorted
    Membership(Vec<String>),
    /// Non-recoverable error; the engine has stopped
    Fatal(Arc<Error>),
}

/// Everything an engine shares with its service
pub struct EngineContext {
    pub store: Arc<dyn CoordinationStore>,
    pub registrar: Arc<LeaseRegistrar>,
    pub retry: RetryPolicy,
    pub cancel: CancellationToken,
    pub notify: DebounceAggregator<Notification>,
}

impl EngineContext {
    /// Wire a registrar and a debounce aggregator over `store`
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        config: &RallyConfig,
        debounce: Duration,
        outbox: mpsc::UnboundedSender<Notification>,
        cancel: CancellationToken,
    ) -> Self {
        let registrar = Arc::new(LeaseRegistrar::new(
            Arc::clone(&store),
            config.store.lease_ttl(),
            config.retry.renew_failure_budget,
            cancel.clone(),
        ));

        Self {
            store,
            registrar,
            retry: config.retry_policy(),
            notify: DebounceAggregator::spawn(debounce, outbox, cancel.clone()),
            cancel,
        }
    }
}
