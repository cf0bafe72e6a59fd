//! Rallypoint Configuration
//!
//! This module provides configuration structures for a coordination
//! service: which app it belongs to, which store it talks to, and how
//! election, discovery, retries and fatal failures behave.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Main Rallypoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RallyConfig {
    /// Service identity
    pub service: ServiceConfig,

    /// Coordination store configuration
    pub store: StoreConfig,

    /// Leader election configuration
    #[serde(default)]
    pub election: ElectionSettings,

    /// Member discovery configuration
    #[serde(default)]
    pub discovery: DiscoverySettings,

    /// Retry and backoff configuration
    #[serde(default)]
    pub retry: RetrySettings,

    /// Fatal error handling
    #[serde(default)]
    pub failure: FailureSettings,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// What a service runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceMode {
    /// Take part in leader election
    #[default]
    Election,
    /// Track the live member set
    Discovery,
}

impl std::fmt::Display for ServiceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceMode::Election => write!(f, "election"),
            ServiceMode::Discovery => write!(f, "discovery"),
        }
    }
}

/// Service identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Application name, shared by every instance of the fleet
    pub app_name: String,

    /// This instance's address (host:port)
    #[serde(default)]
    pub address: String,

    /// Payload stored in this instance's member entry
    #[serde(default)]
    pub metadata: String,

    /// Election or discovery
    #[serde(default)]
    pub mode: ServiceMode,
}

/// Coordination store backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// In-process store with session-scoped ephemeral entries
    MemorySession,
    /// In-process store with lease-scoped ephemeral entries
    MemoryLease,
    /// etcd v3 (requires the `etcd` feature)
    Etcd,
}

/// Coordination store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend to use
    #[serde(default = "default_backend")]
    pub backend: BackendKind,

    /// Store endpoints
    #[serde(default)]
    pub endpoints: Vec<String>,

    /// Root path under which all apps live
    #[serde(default = "default_root")]
    pub root: String,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Session timeout in seconds (session backends)
    #[serde(default = "default_session_timeout")]
    pub session_timeout_secs: u64,

    /// Lease TTL in seconds (lease backends)
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_secs: u64,
}

/// Tie-break policy for leader election
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TieBreak {
    /// Whoever creates the well-known leader entry wins
    #[default]
    FixedPath,
    /// Every candidate creates a child; the lowest address wins
    SortedPrefix,
}

impl std::fmt::Display for TieBreak {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TieBreak::FixedPath => write!(f, "fixed-path"),
            TieBreak::SortedPrefix => write!(f, "sorted-prefix"),
        }
    }
}

/// Leader election configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionSettings {
    /// Tie-break policy
    #[serde(default)]
    pub policy: TieBreak,

    /// Debounce for leadership callbacks in seconds (0 = immediate)
    #[serde(default)]
    pub debounce_secs: u64,
}

/// Member discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverySettings {
    /// Register this instance as a member
    #[serde(default = "default_true")]
    pub register_self: bool,

    /// Debounce for membership callbacks in seconds (0 = immediate)
    #[serde(default = "default_discovery_debounce")]
    pub debounce_secs: u64,
}

/// Retry and backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Attempts per store operation before escalating
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First backoff delay in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Backoff ceiling in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Consecutive failed lease renewals before the entry is marked lost
    #[serde(default = "default_renew_failure_budget")]
    pub renew_failure_budget: u32,

    /// Relists tolerated while our own entry is missing from a listing
    #[serde(default = "default_listing_retries")]
    pub listing_retries: u32,
}

/// What to do when a fatal protocol error is raised
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum FailureMode {
    /// Report through the fatal callback and keep the process alive
    #[default]
    Surface,
    /// Exit the process so a supervisor restarts it
    Exit,
}

/// Fatal error handling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureSettings {
    /// Surface or exit
    #[serde(default)]
    pub policy: FailureMode,

    /// Seconds to wait before exiting
    #[serde(default = "default_exit_grace")]
    pub exit_grace_secs: u64,

    /// Process exit code
    #[serde(default = "default_exit_code")]
    pub exit_code: i32,
}

/// Resolved fatal error policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Report through the fatal callback and keep the process alive
    Surface,
    /// Exit the process after a grace period
    Exit { grace: Duration, code: i32 },
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_backend() -> BackendKind {
    BackendKind::MemorySession
}

fn default_root() -> String {
    "/rallypoint/common".to_string()
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_session_timeout() -> u64 {
    15
}

fn default_lease_ttl() -> u64 {
    20
}

fn default_true() -> bool {
    true
}

fn default_discovery_debounce() -> u64 {
    15
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    5000
}

fn default_renew_failure_budget() -> u32 {
    3
}

fn default_listing_retries() -> u32 {
    5
}

fn default_exit_grace() -> u64 {
    5
}

fn default_exit_code() -> i32 {
    70
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ElectionSettings {
    fn default() -> Self {
        Self {
            policy: TieBreak::default(),
            debounce_secs: 0,
        }
    }
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            register_self: true,
            debounce_secs: default_discovery_debounce(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            renew_failure_budget: default_renew_failure_budget(),
            listing_retries: default_listing_retries(),
        }
    }
}

impl Default for FailureSettings {
    fn default() -> Self {
        Self {
            policy: FailureMode::default(),
            exit_grace_secs: default_exit_grace(),
            exit_code: default_exit_code(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl StoreConfig {
    /// In-process store config with the given backend
    pub fn memory(backend: BackendKind) -> Self {
        Self {
            backend,
            endpoints: vec!["memory://local".to_string()],
            root: default_root(),
            connect_timeout_secs: default_connect_timeout(),
            session_timeout_secs: default_session_timeout(),
            lease_ttl_secs: default_lease_ttl(),
        }
    }

    /// Get connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Get session timeout as Duration
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    /// Get lease TTL as Duration
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }
}

impl RallyConfig {
    /// Build a configuration programmatically, with defaults for everything
    /// except identity and store
    pub fn new(app_name: &str, address: &str, mode: ServiceMode, store: StoreConfig) -> Self {
        Self {
            service: ServiceConfig {
                app_name: app_name.to_string(),
                address: address.to_string(),
                metadata: String::new(),
                mode,
            },
            store,
            election: ElectionSettings::default(),
            discovery: DiscoverySettings::default(),
            retry: RetrySettings::default(),
            failure: FailureSettings::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: RallyConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: RallyConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.store.endpoints.iter().all(|e| e.trim().is_empty()) {
            return Err(crate::Error::Config("store.endpoints cannot be empty".into()));
        }

        if self.service.app_name.is_empty() {
            return Err(crate::Error::Config("service.app_name cannot be empty".into()));
        }

        if self.service.app_name.contains('/') {
            return Err(crate::Error::Config("service.app_name cannot contain '/'".into()));
        }

        let registers = match self.service.mode {
            ServiceMode::Election => true,
            ServiceMode::Discovery => self.discovery.register_self,
        };
        if registers && self.service.address.is_empty() {
            return Err(crate::Error::Config(format!(
                "service.address is required in {} mode",
                self.service.mode
            )));
        }

        if self.service.address.contains('/') {
            return Err(crate::Error::Config("service.address cannot contain '/'".into()));
        }

        if self.store.lease_ttl_secs == 0 {
            return Err(crate::Error::Config("store.lease_ttl_secs must be positive".into()));
        }

        if self.store.session_timeout_secs == 0 {
            return Err(crate::Error::Config("store.session_timeout_secs must be positive".into()));
        }

        if self.retry.max_attempts == 0 || self.retry.renew_failure_budget == 0 {
            return Err(crate::Error::Config("retry budgets must be positive".into()));
        }

        Ok(())
    }

    /// Retry policy for store operations
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms.max(self.retry.base_delay_ms)),
        }
    }

    /// Resolved fatal error policy
    pub fn failure_policy(&self) -> FailurePolicy {
        match self.failure.policy {
            FailureMode::Surface => FailurePolicy::Surface,
            FailureMode::Exit => FailurePolicy::Exit {
                grace: Duration::from_secs(self.failure.exit_grace_secs),
                code: self.failure.exit_code,
            },
        }
    }

    /// Get leadership debounce as Duration
    pub fn election_debounce(&self) -> Duration {
        Duration::from_secs(self.election.debounce_secs)
    }

    /// Get membership debounce as Duration
    pub fn discovery_debounce(&self) -> Duration {
        Duration::from_secs(self.discovery.debounce_secs)
    }

    /// Sample configuration written by `rallypoint init`
    pub fn sample(app_name: &str, address: &str) -> String {
        format!(
            r#"# Rallypoint Configuration

[service]
app_name = "{app_name}"
address = "{address}"
metadata = ""
mode = "election"

[store]
backend = "memory-session"
endpoints = ["memory://local"]
root = "/rallypoint/common"
connect_timeout_secs = 5
session_timeout_secs = 15
lease_ttl_secs = 20

[election]
policy = "fixed-path"
debounce_secs = 0

[discovery]
register_self = true
debounce_secs = 15

[retry]
max_attempts = 5
base_delay_ms = 200
max_delay_ms = 5000
renew_failure_budget = 3
listing_retries = 5

[failure]
policy = "surface"
exit_grace_secs = 5
exit_code = 70

[logging]
level = "info"
format = "pretty"
"#
        )
    }
}
