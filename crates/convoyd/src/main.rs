//! convoyd: the convoy daemon.
//!
//! Runs one replica, or several replicas in one process, of the
//! orchestrator control plane. Each replica campaigns for the leader lease
//! and serves the REST API; only the elected replica accepts writes.
//!
//! # Usage
//!
//! ```text
//! convoyd standalone --port 8080 --data-dir /var/lib/convoy
//! convoyd cluster --replicas 3 --base-port 8080 --data-dir /var/lib/convoy
//! convoyd verify-backup file:///var/backups/convoy.tar.gz
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use convoy_backup::BackupUri;
use convoy_engine::LocalResourceManager;
use convoy_state::{StateStore, SystemClock};
use convoyd::{DaemonConfig, Replica};

const DEFAULT_FILTER: &str = "info,convoyd=debug,convoy=debug";
const DB_FILE: &str = "convoy.redb";

#[derive(Parser)]
#[command(name = "convoyd", about = "Convoy orchestrator daemon")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run a single replica.
    Standalone {
        /// TOML configuration file.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port to listen on.
        #[arg(long, default_value = "8080")]
        port: u16,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/convoy")]
        data_dir: PathBuf,

        /// Identity used in the leader lease.
        #[arg(long, default_value = "convoy-1")]
        replica_id: String,

        /// Address other replicas report for this one. Defaults to
        /// `127.0.0.1:<port>`.
        #[arg(long)]
        advertise_address: Option<String>,
    },

    /// Run several replicas in one process on a shared store, each serving
    /// the API on its own port.
    Cluster {
        /// TOML configuration file.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Number of replicas.
        #[arg(long, default_value = "3")]
        replicas: u16,

        /// Port of the first replica; the others follow consecutively.
        #[arg(long, default_value = "8080")]
        base_port: u16,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/convoy")]
        data_dir: PathBuf,
    },

    /// Check that a backup archive is readable and print its summary.
    VerifyBackup {
        /// Backup location, e.g. `file:///var/backups/convoy.tar`.
        uri: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Standalone {
            config,
            port,
            data_dir,
            replica_id,
            advertise_address,
        } => {
            let config = DaemonConfig::load(config.as_deref())?;
            let address = advertise_address.unwrap_or_else(|| format!("127.0.0.1:{port}"));
            run_standalone(config, port, data_dir, &replica_id, &address).await
        }
        Command::Cluster {
            config,
            replicas,
            base_port,
            data_dir,
        } => {
            let config = DaemonConfig::load(config.as_deref())?;
            run_cluster(config, replicas, base_port, data_dir).await
        }
        Command::VerifyBackup { uri } => verify_backup(&uri),
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn open_store(data_dir: &std::path::Path) -> anyhow::Result<StateStore> {
    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join(DB_FILE);
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");
    Ok(store)
}

async fn run_standalone(
    config: DaemonConfig,
    port: u16,
    data_dir: PathBuf,
    replica_id: &str,
    address: &str,
) -> anyhow::Result<()> {
    info!(replica = replica_id, %address, "convoy daemon starting in standalone mode");
    let store = open_store(&data_dir)?;
    let replica = Replica::new(
        replica_id,
        address,
        store,
        Arc::new(LocalResourceManager::new(config.agents.clone())),
        Arc::new(SystemClock),
        &config,
    )?;

    let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let background = replica.spawn(&shutdown_rx);
    tokio::spawn(shutdown_on_ctrl_c(shutdown_tx));

    replica.serve(listener, shutdown_rx).await?;
    for handle in background {
        let _ = handle.await;
    }

    info!("convoy daemon stopped");
    Ok(())
}

async fn run_cluster(
    config: DaemonConfig,
    count: u16,
    base_port: u16,
    data_dir: PathBuf,
) -> anyhow::Result<()> {
    if count == 0 {
        anyhow::bail!("--replicas must be at least 1");
    }
    info!(replicas = count, base_port, "convoy daemon starting in cluster mode");
    let store = open_store(&data_dir)?;
    let replicas = Replica::cluster(count, base_port, store, &config)?;

    // Bind every port before starting anything, so a taken port fails fast.
    let mut listeners = Vec::with_capacity(replicas.len());
    for replica in &replicas {
        let addr: SocketAddr = replica.address().parse()?;
        let port = addr.port();
        listeners.push(TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await?);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut background = Vec::new();
    let mut servers = Vec::new();
    for (replica, listener) in replicas.into_iter().zip(listeners) {
        let replica = Arc::new(replica);
        background.extend(replica.spawn(&shutdown_rx));
        let shutdown = shutdown_rx.clone();
        servers.push(tokio::spawn(async move { replica.serve(listener, shutdown).await }));
    }
    tokio::spawn(shutdown_on_ctrl_c(shutdown_tx));

    for server in servers {
        server.await??;
    }
    for handle in background {
        let _ = handle.await;
    }

    info!("convoy cluster stopped");
    Ok(())
}

fn verify_backup(uri: &str) -> anyhow::Result<()> {
    let uri = BackupUri::parse(uri)?;
    let summary = convoy_backup::archive::verify(&uri)?;
    info!(%uri, entries = summary.entries, "backup verified");
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn shutdown_on_ctrl_c(shutdown: watch::Sender<bool>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        // Keep the sender alive; dropping it would stop every replica.
        error!(error = %e, "failed to install CTRL+C handler");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
    shutdown.send_replace(true);
}
