//! Per-server supervision.
//!
//! For every role a peer hosts, one long-lived task starts the server,
//! probes it for liveness and role, restarts it on failure with
//! recent-failure accounting, rotates its logs and participates in the
//! ordered shutdown sequence.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cluster::{Peer, UrlSchemes};
use crate::config::{BootstrapConfig, Config};
use crate::context::{ClusterContext, StatusItem};
use crate::errors::{Error, Result};
use crate::net::wait_until_port_available;
use crate::process::{add_volume, terminate_process, Process, Runner, ServerType};

/// Number of recent failures needed before the server log is dumped.
pub const MIN_RECENT_FAILURES_FOR_LOG: usize = 2;

/// Number of recent failures after which the starter gives up.
pub const MAX_RECENT_FAILURES: usize = 100;

/// Uptime below which an exit counts as a recent failure.
const RECENT_FAILURE_UPTIME: Duration = Duration::from_secs(30);

/// Deadline for one graceful server termination.
const TERMINATE_TIMEOUT: Duration = Duration::from_secs(60);

/// Number of log lines dumped by [`ServerManager::show_recent_logs`].
const RECENT_LOG_LINES: usize = 20;

/// A per-role slot holding the currently live process handle.
///
/// Invariant: at most one live handle per role per peer at any instant.
/// Written only by the task supervising that role or the shutdown path.
type Slot = Mutex<Option<Arc<dyn Process>>>;

/// Start, monitor and stop behavior of database servers in a runtime
/// state.
pub struct ServerManager {
    /// Serializes multi-line user-facing banners.
    log_mutex: Mutex<()>,
    agent: Slot,
    dbserver: Slot,
    coordinator: Slot,
    single: Slot,
    sync_master: Slot,
    sync_worker: Slot,
    stopping: AtomicBool,
    /// Test hook: number of port-in-use retries performed.
    port_in_use_retries: AtomicUsize,
}

impl Default for ServerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerManager {
    /// Create a manager with all slots empty.
    #[must_use]
    pub fn new() -> Self {
        Self {
            log_mutex: Mutex::new(()),
            agent: Mutex::new(None),
            dbserver: Mutex::new(None),
            coordinator: Mutex::new(None),
            single: Mutex::new(None),
            sync_master: Mutex::new(None),
            sync_worker: Mutex::new(None),
            stopping: AtomicBool::new(false),
            port_in_use_retries: AtomicUsize::new(0),
        }
    }

    fn slot(&self, server_type: ServerType) -> &Slot {
        match server_type {
            ServerType::Agent => &self.agent,
            ServerType::DBServer => &self.dbserver,
            ServerType::Coordinator => &self.coordinator,
            ServerType::Single | ServerType::ResilientSingle => &self.single,
            ServerType::SyncMaster => &self.sync_master,
            ServerType::SyncWorker => &self.sync_worker,
        }
    }

    /// The live process handle of the given role, if any.
    #[must_use]
    pub fn process(&self, server_type: ServerType) -> Option<Arc<dyn Process>> {
        self.slot(server_type).lock().ok().and_then(|s| s.clone())
    }

    /// Database-family processes currently held in slots, in reporting
    /// order.
    #[must_use]
    pub fn server_processes(&self) -> Vec<(ServerType, Arc<dyn Process>)> {
        let mut result = Vec::new();
        for server_type in [
            ServerType::Agent,
            ServerType::Coordinator,
            ServerType::DBServer,
            ServerType::Single,
        ] {
            if let Some(p) = self.process(server_type) {
                result.push((server_type, p));
            }
        }
        result
    }

    /// Whether the manager is shutting down.
    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Test hook: number of times a start attempt was delayed because the
    /// port was in use.
    #[must_use]
    pub fn port_in_use_retries(&self) -> usize {
        self.port_in_use_retries.load(Ordering::SeqCst)
    }

    /// Start all servers this peer hosts and keep them running until the
    /// cancellation token fires, then perform the ordered teardown.
    pub async fn run(
        self: Arc<Self>,
        cancel: CancellationToken,
        context: Arc<dyn ClusterContext>,
        runner: Arc<dyn Runner>,
        config: Config,
        bootstrap: BootstrapConfig,
    ) {
        let (_, my_peer, mode) = context.cluster_config();
        let Some(my_peer) = my_peer else {
            error!("Cannot find my own peer in cluster configuration");
            return;
        };

        let spawn = |server_type: ServerType| {
            let manager = Arc::clone(&self);
            let cancel = cancel.clone();
            let context = Arc::clone(&context);
            let runner = Arc::clone(&runner);
            let config = config.clone();
            let my_peer = my_peer.clone();
            tokio::spawn(async move {
                manager
                    .run_server(cancel, context, runner, config, my_peer, server_type)
                    .await;
            });
        };

        if mode.is_cluster_mode() {
            if my_peer.has_agent() {
                spawn(ServerType::Agent);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            if BootstrapConfig::flag_enabled(bootstrap.start_dbserver) {
                spawn(ServerType::DBServer);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            if BootstrapConfig::flag_enabled(bootstrap.start_coordinator) {
                spawn(ServerType::Coordinator);
            }
            if BootstrapConfig::flag_enabled(bootstrap.start_sync_master) {
                spawn(ServerType::SyncMaster);
            }
            if BootstrapConfig::flag_enabled(bootstrap.start_sync_worker) {
                spawn(ServerType::SyncWorker);
            }
        } else if mode.is_active_failover_mode() {
            // Mode is authoritative here: coordinators and sync processes
            // are never started in active-failover mode.
            if my_peer.has_agent() {
                spawn(ServerType::Agent);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            if my_peer.has_resilient_single() {
                spawn(ServerType::ResilientSingle);
            }
        } else if mode.is_single_mode() {
            spawn(ServerType::Single);
        }

        cancel.cancelled().await;
        self.stopping.store(true, Ordering::SeqCst);

        info!("Shutting down services...");
        let teardown: [(ServerType, &str); 6] = [
            (ServerType::SyncWorker, "sync worker"),
            (ServerType::SyncMaster, "sync master"),
            (ServerType::Single, "single server"),
            (ServerType::Coordinator, "coordinator"),
            (ServerType::DBServer, "dbserver"),
            (ServerType::Agent, "agent"),
        ];
        for (server_type, name) in teardown {
            if let Some(p) = self.process(server_type) {
                if server_type == ServerType::Agent {
                    // Give coordinators and dbservers time to notice
                    // agency loss before the agency dies.
                    tokio::time::sleep(Duration::from_secs(3)).await;
                }
                terminate_process(&*p, name, TERMINATE_TIMEOUT).await;
            }
        }
        for (server_type, name) in teardown {
            if let Some(p) = self.process(server_type) {
                if server_type == ServerType::Agent {
                    tokio::time::sleep(Duration::from_secs(3)).await;
                }
                if let Err(err) = p.cleanup().await {
                    warn!("Failed to cleanup {name}: {err}");
                }
            }
        }
        if let Err(err) = runner.cleanup().await {
            warn!("Failed to cleanup runner: {err}");
        }
    }

    /// Start a single server of the given type and keep restarting it
    /// when needed.
    async fn run_server(
        self: Arc<Self>,
        cancel: CancellationToken,
        context: Arc<dyn ClusterContext>,
        runner: Arc<dyn Runner>,
        config: Config,
        my_peer: Peer,
        server_type: ServerType,
    ) {
        let mut restart = 0usize;
        let mut recent_failures = 0usize;
        loop {
            let my_host_address = my_peer.address.clone();
            let start_time = Instant::now();
            match start_server(
                &context,
                &runner,
                &config,
                &my_host_address,
                server_type,
                restart,
            )
            .await
            {
                Err(err) if err.is_port_in_use() => {
                    info!("Error while starting {server_type}: {err}");
                    self.port_in_use_retries.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    if self.is_stopping() || cancel.is_cancelled() {
                        break;
                    }
                    continue;
                }
                Err(err) => {
                    error!("Error while starting {server_type}: {err}");
                    // Surface the failure instead of leaving the role
                    // silently dead.
                    context.stop();
                    break;
                }
                Ok(process) => {
                    if let Ok(mut slot) = self.slot(server_type).lock() {
                        *slot = Some(Arc::clone(&process));
                    }
                    let probe_cancel = cancel.child_token();
                    self.spawn_probe(
                        probe_cancel.clone(),
                        Arc::clone(&context),
                        &config,
                        my_peer.clone(),
                        server_type,
                        Arc::clone(&process),
                    );
                    process.wait().await;
                    probe_cancel.cancel();
                }
            }

            let uptime = start_time.elapsed();
            let termination_expected = context
                .upgrade_manager()
                .is_server_upgrade_in_progress(server_type);
            if termination_expected {
                debug!("{server_type} stopped as expected");
            } else if uptime < RECENT_FAILURE_UPTIME {
                recent_failures += 1;
                if !self.is_stopping() {
                    info!(
                        "{server_type} has terminated quickly, in {uptime:?} (recent failures: {recent_failures})"
                    );
                    if recent_failures >= MIN_RECENT_FAILURES_FOR_LOG {
                        self.show_recent_logs(&context, server_type).await;
                    }
                    if recent_failures >= MAX_RECENT_FAILURES {
                        error!("{server_type} has failed {recent_failures} times, giving up");
                        context.stop();
                        self.stopping.store(true, Ordering::SeqCst);
                        break;
                    }
                }
            } else {
                recent_failures = 0;
                info!("{server_type} has terminated");
                if config.debug_cluster && !self.is_stopping() {
                    self.show_recent_logs(&context, server_type).await;
                }
            }

            if self.is_stopping() {
                break;
            }

            info!("restarting {server_type}");
            restart += 1;
        }
    }

    /// Spawn the probe task watching one freshly started instance.
    fn spawn_probe(
        self: &Arc<Self>,
        cancel: CancellationToken,
        context: Arc<dyn ClusterContext>,
        config: &Config,
        my_peer: Peer,
        server_type: ServerType,
        process: Arc<dyn Process>,
    ) {
        let manager = Arc::clone(self);
        let debug_cluster = config.debug_cluster;
        tokio::spawn(async move {
            let port = match context.server_port(server_type) {
                Ok(port) => port,
                // Config resolution must not fail once the server started.
                Err(err) => panic!("Cannot collect serverPort: {err}"),
            };

            let (status_tx, mut status_rx) = mpsc::channel::<StatusItem>(16);
            let log_watcher = {
                let manager = Arc::clone(&manager);
                let context = Arc::clone(&context);
                tokio::spawn(async move {
                    let mut show_log_duration = Duration::from_secs(60);
                    while let Some(item) = status_rx.recv().await {
                        if item.prev_status_code != item.status_code {
                            if debug_cluster {
                                info!("{server_type} status changed to {}", item.status_code);
                            } else {
                                debug!("{server_type} status changed to {}", item.status_code);
                            }
                        }
                        if item.duration > show_log_duration {
                            show_log_duration = item.duration + Duration::from_secs(30);
                            manager.show_recent_logs(&context, server_type).await;
                        }
                    }
                })
            };

            let status = context
                .test_instance(
                    cancel.clone(),
                    server_type,
                    &my_peer.address,
                    port,
                    Some(status_tx),
                )
                .await;
            let _ = log_watcher.await;

            if status.cancelled {
                return;
            }
            if status.up && status.correct_role {
                let msg_postfix = if server_type == ServerType::ResilientSingle && !status.is_leader
                {
                    " as follower"
                } else {
                    ""
                };
                info!(
                    "{server_type} up and running{msg_postfix} (version {}).",
                    status.version
                );

                let user_facing = (server_type == ServerType::Coordinator
                    && !context.is_local_slave())
                    || server_type == ServerType::Single
                    || server_type == ServerType::ResilientSingle;
                if user_facing {
                    match process.host_port(port) {
                        Err(_) => {
                            if !process.container_id().is_empty() {
                                info!(
                                    "{server_type} can only be accessed from inside a container."
                                );
                            }
                        }
                        Ok(host_port) => {
                            let ip = &my_peer.address;
                            let schemes = UrlSchemes::new(my_peer.is_secure);
                            let what = match server_type {
                                ServerType::Single => "single server",
                                ServerType::ResilientSingle => "resilient single server",
                                _ => "cluster",
                            };
                            if server_type != ServerType::ResilientSingle || status.is_leader {
                                let _guard = manager.log_mutex.lock();
                                info!(
                                    "Your {what} can now be accessed with a browser at `{}://{ip}:{host_port}` or",
                                    schemes.browser
                                );
                                info!(
                                    "using `dbsh --server.endpoint {}://{ip}:{host_port}`.",
                                    schemes.shell
                                );
                            }
                            context.remove_recovery_file();
                        }
                    }
                }
                if server_type == ServerType::SyncMaster && !context.is_local_slave() {
                    match process.host_port(port) {
                        Err(_) => {
                            if !process.container_id().is_empty() {
                                info!(
                                    "{server_type} can only be accessed from inside a container."
                                );
                            }
                        }
                        Ok(host_port) => {
                            let ip = &my_peer.address;
                            let _guard = manager.log_mutex.lock();
                            info!("Your syncmaster can now be reached at `https://{ip}:{host_port}`");
                        }
                    }
                }
            } else if !status.up {
                warn!(
                    "{server_type} not ready after 5min!: Status trail: {:?}",
                    status.status_trail
                );
            } else {
                let (expected_role, expected_mode) = server_type.expected_server_role();
                warn!(
                    "{server_type} does not have the expected role of '{expected_role},{expected_mode}' (but '{},{}'): Status trail: {:?}",
                    status.role, status.mode, status.status_trail
                );
            }
        });
    }

    /// Dump the most recent log lines of the server of the given type.
    pub async fn show_recent_logs(
        &self,
        context: &Arc<dyn ClusterContext>,
        server_type: ServerType,
    ) {
        let log_path = match context.server_host_log_file(server_type) {
            Ok(path) => path,
            Err(err) => {
                error!("Cannot find server host log file: {err}");
                return;
            }
        };
        match tokio::fs::read(&log_path).await {
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!("Log file for {server_type} is empty");
            }
            Err(err) => {
                error!("Cannot open log file for {server_type}: {err}");
            }
            Ok(content) => {
                let text = String::from_utf8_lossy(&content);
                let lines: Vec<&str> = text.lines().collect();
                let tail = &lines[lines.len().saturating_sub(RECENT_LOG_LINES)..];
                let mut buf = format!("## Start of {server_type} log\n");
                for line in tail {
                    buf.push('\t');
                    buf.push_str(line);
                    buf.push('\n');
                }
                buf.push_str(&format!("## End of {server_type} log"));
                info!("{buf}");
            }
        }
    }

    /// Rotate the log file of a single server, keeping `files_to_keep`
    /// numbered backups, then HUP the process so it reopens its file.
    pub async fn rotate_log_file(
        &self,
        context: &Arc<dyn ClusterContext>,
        server_type: ServerType,
        process: &Arc<dyn Process>,
        files_to_keep: usize,
    ) {
        let log_path = match context.server_host_log_file(server_type) {
            Ok(path) => path,
            Err(err) => {
                debug!("Failed to get host log file for '{server_type}': {err}");
                return;
            }
        };
        debug!("Rotating {server_type} log file: {}", log_path.display());

        for i in (0..=files_to_keep).rev() {
            let log_path_x = if i == 0 {
                log_path.clone()
            } else {
                numbered_log_path(&log_path, i)
            };
            if tokio::fs::metadata(&log_path_x).await.is_err() {
                continue;
            }
            if i == files_to_keep {
                match tokio::fs::remove_file(&log_path_x).await {
                    Err(err) => {
                        error!("Failed to remove {}: {err}", log_path_x.display());
                    }
                    Ok(()) => debug!("Removed old log file: {}", log_path_x.display()),
                }
            } else {
                let log_path_next = numbered_log_path(&log_path, i + 1);
                match tokio::fs::rename(&log_path_x, &log_path_next).await {
                    Err(err) => error!(
                        "Failed to move {} to {}: {err}",
                        log_path_x.display(),
                        log_path_next.display()
                    ),
                    Ok(()) => debug!(
                        "Moved log file {} to {}",
                        log_path_x.display(),
                        log_path_next.display()
                    ),
                }
            }
        }

        if let Err(err) = process.hup() {
            error!("Failed to send HUP signal: {err}");
        }
    }

    /// Rotate the log files of all servers.
    pub async fn rotate_all_log_files(
        &self,
        context: &Arc<dyn ClusterContext>,
        config: &Config,
    ) {
        info!("Rotating log files...");
        let (_, my_peer, _) = context.cluster_config();
        if my_peer.is_none() {
            error!("Cannot find my own peer in cluster configuration");
            return;
        }
        let order = [
            ServerType::SyncWorker,
            ServerType::SyncMaster,
            ServerType::Single,
            ServerType::Coordinator,
            ServerType::DBServer,
            ServerType::Agent,
        ];
        for server_type in order {
            if let Some(p) = self.process(server_type) {
                self.rotate_log_file(context, server_type, &p, config.log_rotate_files_to_keep)
                    .await;
            }
        }
    }

    /// Trigger a restart of the server of the given type.
    ///
    /// The server is terminated gracefully; its run loop restarts it.
    pub async fn restart_server(&self, server_type: ServerType) {
        let name = match server_type {
            ServerType::Agent => "agent",
            ServerType::DBServer => "dbserver",
            ServerType::Coordinator => "coordinator",
            ServerType::Single | ServerType::ResilientSingle => "single server",
            ServerType::SyncMaster => "sync master",
            ServerType::SyncWorker => "sync worker",
        };
        if let Some(p) = self.process(server_type) {
            terminate_process(&*p, name, TERMINATE_TIMEOUT).await;
        }
    }
}

fn numbered_log_path(log_path: &Path, i: usize) -> std::path::PathBuf {
    let mut name = log_path.as_os_str().to_os_string();
    name.push(format!(".{i}"));
    std::path::PathBuf::from(name)
}

/// Start a single server of the given type.
///
/// Returns [`Error::PortInUse`] when the server port is taken; that is the
/// only retryable error class for the caller.
async fn start_server(
    context: &Arc<dyn ClusterContext>,
    runner: &Arc<dyn Runner>,
    config: &Config,
    my_host_address: &str,
    server_type: ServerType,
    restart: usize,
) -> Result<Arc<dyn Process>> {
    let my_port = context.server_port(server_type)?;
    let my_host_dir = context.server_host_dir(server_type)?;
    let my_container_dir = context.server_container_dir(server_type)?;
    let my_container_log_file = context.server_container_log_file(server_type)?;

    let _ = tokio::fs::create_dir_all(my_host_dir.join("data")).await;
    let _ = tokio::fs::create_dir_all(my_host_dir.join("apps")).await;

    // Check if the server is already running.
    info!("Looking for a running instance of {server_type} on port {my_port}");
    if let Some(p) = runner.get_running_server(&my_host_dir).await? {
        info!("{server_type} seems to be running already, checking port {my_port}...");
        let probe_cancel = CancellationToken::new();
        let deadline_guard = probe_cancel.clone();
        let deadline = tokio::spawn(async move {
            tokio::select! {
                () = deadline_guard.cancelled() => {}
                () = tokio::time::sleep(Duration::from_secs(10)) => deadline_guard.cancel(),
            }
        });
        let status = context
            .test_instance(
                probe_cancel.clone(),
                server_type,
                my_host_address,
                my_port,
                None,
            )
            .await;
        probe_cancel.cancel();
        let _ = deadline.await;
        if status.up && status.correct_role {
            info!("{server_type} is already running on {my_port}. No need to start anything.");
            return Ok(p);
        } else if !status.up {
            info!(
                "{server_type} is not up on port {my_port}. Terminating existing process and restarting it..."
            );
        } else {
            let (expected_role, expected_mode) = server_type.expected_server_role();
            info!(
                "{server_type} is not of role '{expected_role}.{expected_mode}' on port {my_port}. Terminating existing process and restarting it..."
            );
        }
        let _ = p.terminate();
    }

    // Check availability of the port.
    if !wait_until_port_available(my_host_address, my_port, Duration::from_secs(3)).await {
        return Err(Error::PortInUse(my_port));
    }

    info!("Starting {server_type} on port {my_port}");
    let process_type = server_type.process_type();
    let conf_volumes =
        context.create_server_config(server_type, &my_host_dir, &my_container_dir, my_port)?;

    let (_, my_peer, _) = context.cluster_config();
    let my_peer = my_peer
        .ok_or_else(|| Error::Transient("own peer not in cluster configuration".to_string()))?;
    let upgrade_manager = context.upgrade_manager();
    let database_auto_upgrade = upgrade_manager.server_database_auto_upgrade(server_type);
    let args = context.build_server_args(
        server_type,
        &my_container_dir,
        &my_container_log_file,
        my_port,
        database_auto_upgrade,
    )?;
    let executable = config.server_executable(process_type);
    write_command(
        &my_host_dir.join(process_type.command_file_name()),
        &executable,
        &args,
    )
    .await;

    let volumes = add_volume(conf_volumes, &my_host_dir, &my_container_dir, false);

    let container_name_prefix = if config.container_name_prefix.is_empty() {
        String::new()
    } else {
        format!("{}-", config.container_name_prefix)
    };
    let container_name = format!(
        "{container_name_prefix}{server_type}-{}-{restart}-{my_host_address}-{my_port}",
        my_peer.id
    );
    let ports = [my_port];
    let p = runner
        .start(
            process_type,
            &executable,
            &args,
            &volumes,
            &ports,
            &container_name,
            &my_host_dir,
            None,
        )
        .await?;
    if database_auto_upgrade {
        // The server consumed its one-shot auto-upgrade chance.
        upgrade_manager.server_database_auto_upgrade_started(server_type);
    }
    Ok(p)
}

/// Write a trace of the command about to run next to the data directory.
async fn write_command(path: &Path, executable: &Path, args: &[String]) {
    let mut content = executable.display().to_string();
    for arg in args {
        content.push_str(" \\\n    ");
        content.push_str(arg);
    }
    content.push('\n');
    if let Err(err) = tokio::fs::write(path, content).await {
        debug!("Failed to write command file {}: {err}", path.display());
    }
}
