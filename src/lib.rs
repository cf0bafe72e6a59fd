//! Rallypoint - Leader Election and Member Discovery
//!
//! A coordination primitive for fleets of service instances sharing one
//! coordination store. Each instance either takes part in leader election
//! or tracks the live member set of its app, through ephemeral entries
//! that disappear with the instance's session or lease.
//!
//! # Architecture
//!
//! Store access goes through the [`store::CoordinationStore`] trait, with
//! an in-process implementation covering both session and lease
//! semantics and an etcd implementation behind the `etcd` feature. On top
//! of it:
//!
//! - [`registrar::LeaseRegistrar`] creates, renews and removes ephemeral entries
//! - [`watch::WatchLoop`] arms single-fire watches, one explicit step at a time
//! - [`debounce::DebounceAggregator`] coalesces bursts of change notifications
//! - [`state::ElectionEngine`] and [`state::DiscoveryEngine`] resolve state
//! - [`service::CoordinationService`] wires it together behind start/stop
//!
//! # Features
//!
//! - Fixed-path and sorted-prefix election tie-breaks
//! - Debounced membership callbacks
//! - Recovery from session and lease loss
//! - Bounded retry with backoff for transient store errors
//! - Injected `tracing` dispatch; silent unless the host opts in

pub mod config;
pub mod debounce;
pub mod error;
pub mod paths;
pub mod registrar;
pub mod retry;
pub mod service;
pub mod state;
pub mod store;
pub mod watch;

pub use config::RallyConfig;
pub use error::{Error, Result};
pub use service::{CoordinationService, ServiceBuilder};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{RallyConfig, ServiceMode, StoreConfig, TieBreak};
    pub use crate::error::{Error, Result};
    pub use crate::service::{CoordinationService, ServiceBuilder};
    pub use crate::state::{ElectionStatus, MemberSetSnapshot, Role};
    pub use crate::store::{CoordinationStore, MemoryCluster, StoreConnector};
}
