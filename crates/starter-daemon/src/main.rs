//! starterd - cluster bootstrapper and supervisor daemon.
//!
//! One starter runs per machine taking part in a deployment. It launches
//! the local database servers, keeps them alive, coordinates with sibling
//! starters over HTTP and serves the operational API.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::Parser;
use rand::Rng;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use starter_core::cluster::{ClusterConfig, ServiceMode, DEFAULT_BASE_PORT};
use starter_core::config::{BootstrapConfig, Config};
use starter_core::context::{ClusterContext, DatabaseFeatures, HelloRequest};
use starter_core::process::Runner;
use starter_core::supervisor::ServerManager;
use starter_core::version::database_version;

use starter_daemon::api::PeerServer;
use starter_daemon::runner::NativeRunner;
use starter_daemon::service::{Starter, StarterOptions};

/// starter daemon - cluster bootstrapper and supervisor
#[derive(Parser, Debug)]
#[command(name = "starterd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Address other peers use to reach this starter
    #[arg(long, default_value = "127.0.0.1")]
    address: String,

    /// Base port of this starter
    #[arg(long, default_value_t = DEFAULT_BASE_PORT)]
    port: u16,

    /// Directory holding all server data
    #[arg(long, default_value = "./starter-data")]
    data_dir: PathBuf,

    /// Operating mode (single, activefailover, cluster)
    #[arg(long, default_value = "cluster")]
    mode: String,

    /// Number of agents the deployment should run
    #[arg(long, default_value_t = 3)]
    agency_size: usize,

    /// Address of a running starter to join (host or host:port)
    #[arg(long)]
    join: Option<String>,

    /// Path of the database server executable
    #[arg(long, default_value = "dbserverd")]
    server_path: PathBuf,

    /// Path of the synchronization executable
    #[arg(long, default_value = "dbsyncd")]
    sync_path: PathBuf,

    /// Prefix for container names of supervised servers
    #[arg(long, default_value = "")]
    container_name_prefix: String,

    /// Start a dbserver on this peer (cluster mode)
    #[arg(long)]
    start_dbserver: Option<bool>,

    /// Start a coordinator on this peer (cluster mode)
    #[arg(long)]
    start_coordinator: Option<bool>,

    /// Start a sync master on this peer (cluster mode)
    #[arg(long)]
    start_sync_master: Option<bool>,

    /// Start a sync worker on this peer (cluster mode)
    #[arg(long)]
    start_sync_worker: Option<bool>,

    /// Emit verbose cluster diagnostics
    #[arg(long)]
    debug_cluster: bool,

    /// Number of rotated log files to keep per server
    #[arg(long, default_value_t = 5)]
    log_rotate_files_to_keep: usize,

    /// Interval between automatic log rotations (e.g. 24h, 0s to disable)
    #[arg(long, default_value = "24h", value_parser = humantime::parse_duration)]
    log_rotate_interval: Duration,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// TLS certificate chain (PEM); TLS is enabled iff cert and key are set
    #[arg(long, requires = "ssl_key")]
    ssl_cert: Option<PathBuf>,

    /// TLS private key (PEM)
    #[arg(long, requires = "ssl_cert")]
    ssl_key: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args)?;

    let mode: ServiceMode = args
        .mode
        .parse()
        .map_err(|err| anyhow::anyhow!("{err}"))
        .context("invalid --mode")?;

    tokio::fs::create_dir_all(&args.data_dir)
        .await
        .context("cannot create data directory")?;
    let id = load_or_create_id(&args.data_dir).await?;
    info!("Starter {id} running in {mode} mode");

    // Install the rustls crypto provider before any TLS configuration is
    // built.
    rustls::crypto::ring::default_provider().install_default().ok();

    let tls_config = match (&args.ssl_cert, &args.ssl_key) {
        (Some(cert), Some(key)) => Some(load_tls_config(cert, key)?),
        _ => None,
    };

    let config = Config {
        server_path: args.server_path.clone(),
        sync_path: args.sync_path.clone(),
        master_port: args.port,
        container_name_prefix: args.container_name_prefix.clone(),
        debug_cluster: args.debug_cluster,
        log_rotate_files_to_keep: args.log_rotate_files_to_keep,
        project_version: env!("CARGO_PKG_VERSION").to_string(),
        project_build: option_env!("STARTER_BUILD").unwrap_or("dev").to_string(),
    };
    let bootstrap = BootstrapConfig {
        start_dbserver: args.start_dbserver,
        start_coordinator: args.start_coordinator,
        start_sync_master: args.start_sync_master,
        start_sync_worker: args.start_sync_worker,
        recovery_agent_id: None,
    };

    let starter = Arc::new(
        Starter::new(
            StarterOptions {
                id: id.clone(),
                own_address: args.address.clone(),
                data_dir: args.data_dir.clone(),
                mode,
                agency_size: args.agency_size,
                is_local_slave: false,
                is_secure: tls_config.is_some(),
            },
            config.clone(),
            bootstrap.clone(),
        )
        .map_err(|err| anyhow::anyhow!("{err}"))?,
    );
    let context: Arc<dyn ClusterContext> = Arc::clone(&starter) as Arc<dyn ClusterContext>;
    let runner: Arc<dyn Runner> = Arc::new(NativeRunner::new());
    let manager = Arc::new(ServerManager::new());
    let cancel = starter.cancel_token();

    // Detect database features before starting anything.
    match database_version(&runner, &config).await {
        Ok(version) => {
            info!("Using database version {version}");
            starter.set_database_features(DatabaseFeatures { version });
        }
        Err(err) => warn!("Cannot determine database version: {err}"),
    }

    // Join an existing deployment when asked to.
    if let Some(join) = &args.join {
        join_deployment(&starter, &args, &id, join)
            .await
            .context("cannot join deployment")?;
    }

    // Start the peer HTTP API.
    let server = PeerServer::new(
        Arc::clone(&context),
        Arc::clone(&manager),
        &config,
        id.clone(),
    );
    let host_addr = format!("{}:{}", args.address, args.port);
    let container_addr: SocketAddr = ([0, 0, 0, 0], args.port).into();
    server
        .start(&host_addr, &container_addr.to_string(), tls_config)
        .await
        .context("cannot start HTTP server")?;

    // Unix signals: TERM/INT stop the peer, HUP rotates server logs.
    {
        let context = Arc::clone(&context);
        tokio::spawn(async move {
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(err) => {
                    error!("Failed to register SIGTERM: {err}");
                    return;
                }
            };
            let mut sigint = match signal(SignalKind::interrupt()) {
                Ok(s) => s,
                Err(err) => {
                    error!("Failed to register SIGINT: {err}");
                    return;
                }
            };
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM"),
                _ = sigint.recv() => info!("Received SIGINT"),
            }
            context.stop();
        });
    }
    {
        let context = Arc::clone(&context);
        let manager = Arc::clone(&manager);
        let config = config.clone();
        tokio::spawn(async move {
            let mut sighup = match signal(SignalKind::hangup()) {
                Ok(s) => s,
                Err(err) => {
                    error!("Failed to register SIGHUP: {err}");
                    return;
                }
            };
            while sighup.recv().await.is_some() {
                manager.rotate_all_log_files(&context, &config).await;
            }
        });
    }
    if !args.log_rotate_interval.is_zero() {
        let context = Arc::clone(&context);
        let manager = Arc::clone(&manager);
        let config = config.clone();
        let interval = args.log_rotate_interval;
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(interval) => {
                        manager.rotate_all_log_files(&context, &config).await;
                    }
                }
            }
        });
    }

    starter.set_running();
    Arc::clone(&manager)
        .run(cancel, context, runner, config, bootstrap)
        .await;

    info!("Starter has shut down");
    Ok(())
}

/// Initialize tracing to stdout or the given log file.
fn init_tracing(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(())
}

/// Load the persistent starter ID, generating one on first launch.
async fn load_or_create_id(data_dir: &std::path::Path) -> Result<String> {
    let id_path = data_dir.join("starter-id");
    match tokio::fs::read_to_string(&id_path).await {
        Ok(id) if !id.trim().is_empty() => Ok(id.trim().to_string()),
        _ => {
            const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
            let mut rng = rand::thread_rng();
            let id: String = (0..8)
                .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
                .collect();
            tokio::fs::write(&id_path, &id)
                .await
                .context("cannot persist starter ID")?;
            Ok(id)
        }
    }
}

/// Load a rustls server configuration from PEM files.
fn load_tls_config(
    cert_path: &std::path::Path,
    key_path: &std::path::Path,
) -> Result<Arc<rustls::ServerConfig>> {
    let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(
        std::fs::File::open(cert_path).context("cannot open TLS certificate")?,
    ))
    .collect::<std::io::Result<Vec<_>>>()
    .context("cannot parse TLS certificate")?;
    let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(
        std::fs::File::open(key_path).context("cannot open TLS key")?,
    ))
    .context("cannot parse TLS key")?
    .context("no private key found")?;
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("invalid TLS configuration")?;
    Ok(Arc::new(config))
}

/// Register with a running starter and adopt its cluster configuration.
async fn join_deployment(starter: &Starter, args: &Args, id: &str, join: &str) -> Result<()> {
    let master_addr = if join.contains(':') {
        join.to_string()
    } else {
        format!("{join}:{DEFAULT_BASE_PORT}")
    };
    let master_url = format!("http://{master_addr}");
    info!("Joining deployment via {master_url}");

    let req = HelloRequest {
        slave_id: id.to_string(),
        slave_address: args.address.clone(),
        slave_port: args.port,
        data_dir: args.data_dir.display().to_string(),
        is_secure: args.ssl_cert.is_some(),
        ..Default::default()
    };
    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .timeout(Duration::from_secs(10))
        .build()
        .context("cannot build HTTP client")?;
    let cluster: ClusterConfig = client
        .post(format!("{master_url}/hello"))
        .json(&req)
        .send()
        .await
        .context("cannot reach master")?
        .error_for_status()
        .context("master rejected hello")?
        .json()
        .await
        .context("cannot parse master response")?;

    info!("Joined deployment with {} peers", cluster.peers.len());
    starter.join_cluster(cluster, master_url);
    Ok(())
}
