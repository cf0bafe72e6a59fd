//! Rallypoint - Leader Election and Member Discovery
//!
//! Command-line front end: write and check configuration files, run one
//! coordination service, or watch a failover on an in-process cluster.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rallypoint::config::{BackendKind, LoggingConfig, RallyConfig, ServiceMode, StoreConfig};
use rallypoint::error::{Error, Result};
use rallypoint::service::CoordinationService;
use rallypoint::store::MemoryCluster;

/// Rallypoint - leader election and member discovery over a coordination store
#[derive(Parser)]
#[command(name = "rallypoint")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "rallypoint.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides [logging]
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "rallypoint.toml")]
        output: PathBuf,

        /// Application name
        #[arg(long, default_value = "my-app")]
        app: String,

        /// This instance's address
        #[arg(long, default_value = "127.0.0.1:7000")]
        address: String,
    },

    /// Validate configuration file
    Validate,

    /// Run the configured service until Ctrl-C
    Run,

    /// Show a failover on an in-process cluster
    Demo {
        /// Number of instances
        #[arg(short, long, default_value_t = 3)]
        instances: u32,

        /// Membership debounce in seconds
        #[arg(long, default_value_t = 2)]
        debounce: u64,

        /// Print the final member snapshot as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logging comes from the config file when there is one
    let mut logging = RallyConfig::from_file(&cli.config)
        .map(|c| c.logging)
        .unwrap_or_default();
    if let Some(level) = &cli.log_level {
        logging.level = level.clone();
    }
    init_logging(&logging);

    match cli.command {
        Commands::Init { output, app, address } => run_init(output, app, address),
        Commands::Validate => run_validate(cli.config),
        Commands::Run => run_service(cli.config).await,
        Commands::Demo { instances, debounce, json } => run_demo(instances, debounce, json).await,
    }
}

/// Initialize logging
fn init_logging(logging: &LoggingConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| logging.level.as_str().into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Dispatcher the services log through
fn current_dispatch() -> tracing::Dispatch {
    tracing::dispatcher::get_default(|dispatch| dispatch.clone())
}

/// Write a sample configuration
fn run_init(output: PathBuf, app: String, address: String) -> Result<()> {
    if output.exists() {
        return Err(Error::Config(format!("{:?} already exists", output)));
    }

    std::fs::write(&output, RallyConfig::sample(&app, &address))?;
    println!("Configuration written to {:?}", output);
    println!();
    println!("Next steps:");
    println!("  1. Point [store] at your coordination store");
    println!("  2. Run: rallypoint --config {:?} run", output);
    Ok(())
}

/// Validate configuration file
fn run_validate(config_path: PathBuf) -> Result<()> {
    match RallyConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  App:       {}", config.service.app_name);
            println!("  Address:   {}", config.service.address);
            println!("  Mode:      {}", config.service.mode);
            println!("  Backend:   {:?}", config.store.backend);
            println!("  Endpoints: {:?}", config.store.endpoints);
            if config.service.mode == ServiceMode::Election {
                println!("  Policy:    {}", config.election.policy);
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Run the configured service
async fn run_service(config_path: PathBuf) -> Result<()> {
    let config = match RallyConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            return Err(e);
        }
    };

    let debounce = config.discovery.debounce_secs;
    let service = CoordinationService::builder(config)
        .dispatch(current_dispatch())
        .build()?;

    service
        .set_leadership_callback(|is_leader| {
            if is_leader {
                println!("★ This instance is now the leader");
            } else {
                println!("☆ This instance is a follower");
            }
        })
        .await;
    service
        .set_membership_callback(|members| println!("Members: {:?}", members), debounce)
        .await;
    service
        .set_fatal_callback(|e| eprintln!("✗ Coordination failed: {}", e))
        .await;

    service.start().await?;
    if let Some(leader) = service.current_leader() {
        tracing::info!("Current leader: {}", leader);
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal");
    service.stop().await;
    Ok(())
}

struct DemoInstance {
    address: String,
    election: CoordinationService,
    discovery: CoordinationService,
}

/// Spin up instances on an in-process cluster and kill the leader
async fn run_demo(instances: u32, debounce: u64, json: bool) -> Result<()> {
    if instances < 2 {
        return Err(Error::Config("the demo needs at least 2 instances".into()));
    }

    let cluster = MemoryCluster::new();
    let dispatch = current_dispatch();
    let build = |address: &str, mode: ServiceMode| {
        let mut config = RallyConfig::new(
            "demo",
            address,
            mode,
            StoreConfig::memory(BackendKind::MemorySession),
        );
        config.discovery.debounce_secs = debounce;
        CoordinationService::builder(config)
            .memory_cluster(cluster.clone())
            .dispatch(dispatch.clone())
            .build()
    };

    // The observer watches without registering itself
    let observer = {
        let mut config = RallyConfig::new(
            "demo",
            "",
            ServiceMode::Discovery,
            StoreConfig::memory(BackendKind::MemorySession),
        );
        config.discovery.register_self = false;
        CoordinationService::builder(config)
            .memory_cluster(cluster.clone())
            .dispatch(dispatch.clone())
            .build()?
    };
    let (members_tx, mut members_rx) = mpsc::unbounded_channel();
    observer
        .set_membership_callback(move |members| { let _ = members_tx.send(members.to_vec()); }, debounce)
        .await;
    observer.start().await?;

    let mut fleet = Vec::new();
    for i in 1..=instances {
        let address = format!("10.0.0.{}:7000", i);
        let instance = DemoInstance {
            election: build(&address, ServiceMode::Election)?,
            discovery: build(&address, ServiceMode::Discovery)?,
            address,
        };
        instance.election.start().await?;
        instance.discovery.start().await?;
        fleet.push(instance);
    }

    let leader = fleet
        .iter()
        .position(|i| i.election.is_leader())
        .ok_or_else(|| Error::FatalProtocol("no instance won the election".into()))?;
    println!("★ Leader: {}", fleet[leader].address);
    println!("Waiting {}s for membership to settle...", debounce);
    print_members(&mut members_rx, fleet.len()).await;

    let fallen = fleet.remove(leader);
    println!("✗ Stopping leader {}", fallen.address);
    fallen.election.stop().await;
    fallen.discovery.stop().await;

    let mut statuses: Vec<_> = fleet.iter().map(|i| i.election.election_status()).collect();
    let new_leader = tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            if let Some(instance) = fleet.iter().find(|i| i.election.is_leader()) {
                return instance.address.clone();
            }
            let changes = statuses.iter_mut().map(|s| Box::pin(s.changed()));
            let _ = futures::future::select_all(changes).await;
        }
    })
    .await
    .map_err(|_| Error::FatalProtocol("no failover within 30s".into()))?;
    println!("★ New leader: {}", new_leader);
    print_members(&mut members_rx, fleet.len()).await;

    if json {
        let snapshot = observer.membership().borrow().clone();
        println!("{}", serde_json::to_string_pretty(snapshot.as_ref())?);
    }

    for instance in &fleet {
        instance.election.stop().await;
        instance.discovery.stop().await;
    }
    observer.stop().await;
    println!("Demo finished");
    Ok(())
}

async fn print_members(members_rx: &mut mpsc::UnboundedReceiver<Vec<String>>, expected: usize) {
    while let Some(members) = members_rx.recv().await {
        if members.len() == expected {
            println!("Members: {:?}", members);
            return;
        }
    }
}
