//! Concrete cluster context.
//!
//! The [`Starter`] owns the in-memory cluster configuration, resolves
//! per-role paths and ports from the data directory layout, implements
//! hello/goodbye membership handling and probes server instances over
//! their `/status` endpoint.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use starter_core::cluster::{ClusterConfig, Peer, ServiceMode, UrlSchemes};
use starter_core::config::{BootstrapConfig, Config};
use starter_core::context::{
    ClusterContext, DatabaseFeatures, HelloRequest, InstanceStatus, MasterInfo, StatusItem,
    UpgradeManager,
};
use starter_core::errors::{Error, Result};
use starter_core::net::normalize_host_name;
use starter_core::process::{ProcessType, ServerType, Volume};

/// Port-offset distance between two peers sharing an address.
pub const PORT_OFFSET_INCREMENT: u16 = 10;

/// Marker file cleared after the first healthy start.
const RECOVERY_FILE_NAME: &str = "RECOVERY";

/// Ceiling for one instance probe.
const TEST_INSTANCE_TIMEOUT: Duration = Duration::from_secs(300);

/// Cadence of the instance probe.
const TEST_INSTANCE_INTERVAL: Duration = Duration::from_secs(1);

/// Probe status codes, recorded in the status trail.
const STATUS_UNREACHABLE: i32 = 0;
const STATUS_BAD_RESPONSE: i32 = 1;
const STATUS_WRONG_ROLE: i32 = 2;
const STATUS_GOOD: i32 = 3;

/// Status document served by a database server on `/status`.
#[derive(Debug, Clone, Default, serde::Deserialize)]
struct StatusResponse {
    #[serde(default)]
    version: String,
    #[serde(default)]
    role: String,
    #[serde(default)]
    mode: String,
    #[serde(default)]
    leader: bool,
}

/// Mutable cluster state, guarded by one mutex.
struct ClusterState {
    cluster: ClusterConfig,
    is_running: bool,
    is_running_master: bool,
    master_url: String,
}

/// Options for constructing a [`Starter`].
pub struct StarterOptions {
    /// Unique ID of this starter.
    pub id: String,
    /// Address other peers use to reach this starter.
    pub own_address: String,
    /// Root data directory.
    pub data_dir: PathBuf,
    /// Operating mode of the deployment.
    pub mode: ServiceMode,
    /// Number of agents the deployment should run.
    pub agency_size: usize,
    /// Whether this peer runs as a local slave of another starter.
    pub is_local_slave: bool,
    /// Whether servers started by this peer use TLS.
    pub is_secure: bool,
}

/// The per-peer service implementing [`ClusterContext`].
pub struct Starter {
    config: Config,
    bootstrap: BootstrapConfig,
    id: String,
    data_dir: PathBuf,
    mode: ServiceMode,
    is_local_slave: bool,
    state: Mutex<ClusterState>,
    features: Mutex<DatabaseFeatures>,
    cancel: CancellationToken,
    upgrade: Arc<LatchUpgradeManager>,
    sync_secret: String,
    client: reqwest::Client,
}

impl Starter {
    /// Create a starter that bootstraps a fresh deployment with itself as
    /// the first peer and running master.
    pub fn new(options: StarterOptions, config: Config, bootstrap: BootstrapConfig) -> Result<Self> {
        let mut own_peer = Peer::new(
            &options.id,
            normalize_host_name(&options.own_address),
            config.master_port,
            0,
            options.data_dir.display().to_string(),
        );
        own_peer.is_secure = options.is_secure;
        own_peer.has_resilient_single_flag = options.mode.is_active_failover_mode();
        if options.mode.is_single_mode() {
            own_peer.has_agent_flag = false;
            own_peer.has_dbserver_flag = false;
            own_peer.has_coordinator_flag = false;
        }
        let master_url = own_peer.starter_url();

        let mut cluster = ClusterConfig::new(options.agency_size, config.master_port);
        cluster.add_or_update_peer(own_peer);

        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(Duration::from_secs(2))
            .build()
            .map_err(|err| Error::Transient(format!("cannot build HTTP client: {err}")))?;

        Ok(Self {
            config,
            bootstrap,
            id: options.id,
            data_dir: options.data_dir,
            mode: options.mode,
            is_local_slave: options.is_local_slave,
            state: Mutex::new(ClusterState {
                cluster,
                is_running: false,
                is_running_master: true,
                master_url,
            }),
            features: Mutex::new(DatabaseFeatures::default()),
            cancel: CancellationToken::new(),
            upgrade: Arc::new(LatchUpgradeManager::default()),
            sync_secret: random_secret(),
            client,
        })
    }

    /// Token cancelled when the peer is asked to stop.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Mark the deployment as running.
    pub fn set_running(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.is_running = true;
        }
    }

    /// Install a cluster configuration received from the master we joined.
    pub fn join_cluster(&self, cluster: ClusterConfig, master_url: String) {
        if let Ok(mut state) = self.state.lock() {
            state.cluster = cluster;
            state.is_running_master = false;
            state.master_url = master_url;
        }
    }

    /// Record the features detected from the database executable.
    pub fn set_database_features(&self, features: DatabaseFeatures) {
        if let Ok(mut guard) = self.features.lock() {
            *guard = features;
        }
    }

    /// The auto-upgrade latch, for wiring an upgrade flow.
    #[must_use]
    pub fn upgrade_latch(&self) -> Arc<LatchUpgradeManager> {
        Arc::clone(&self.upgrade)
    }

    /// The runtime configuration this starter was built with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    fn own_peer(&self) -> Result<Peer> {
        let state = self
            .state
            .lock()
            .map_err(|_| Error::Transient("cluster state poisoned".to_string()))?;
        state
            .cluster
            .peer_by_id(&self.id)
            .cloned()
            .ok_or_else(|| Error::Transient("own peer not in cluster configuration".to_string()))
    }

    fn status_url(&self, address: &str, port: u16) -> String {
        let is_secure = self.own_peer().map(|p| p.is_secure).unwrap_or(false);
        let schemes = UrlSchemes::new(is_secure);
        let host = if address.contains(':') {
            format!("[{address}]")
        } else {
            address.to_string()
        };
        format!("{}://{host}:{port}/status", schemes.browser)
    }
}

fn random_secret() -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::thread_rng();
    (0..32)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

/// Derive the address of a joining peer.
fn derive_slave_address(req_address: &str, remote_address: &str, own_address: &str) -> String {
    if !req_address.is_empty() {
        return normalize_host_name(req_address);
    }
    let host = remote_address
        .rsplit_once(':')
        .map_or(remote_address, |(host, _)| host);
    let host = normalize_host_name(host);
    if host.is_empty() {
        own_address.to_string()
    } else {
        host
    }
}

#[async_trait]
impl ClusterContext for Starter {
    fn cluster_config(&self) -> (ClusterConfig, Option<Peer>, ServiceMode) {
        let state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => return (ClusterConfig::default(), None, self.mode),
        };
        let my_peer = state.cluster.peer_by_id(&self.id).cloned();
        (state.cluster.clone(), my_peer, self.mode)
    }

    fn is_running_master(&self) -> MasterInfo {
        match self.state.lock() {
            Ok(state) => MasterInfo {
                is_running_master: state.is_running_master,
                is_running: state.is_running,
                master_url: state.master_url.clone(),
            },
            Err(_) => MasterInfo::default(),
        }
    }

    fn handle_hello(
        &self,
        own_address: &str,
        remote_address: &str,
        req: Option<&HelloRequest>,
        is_update: bool,
    ) -> Result<ClusterConfig> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| Error::Transient("cluster state poisoned".to_string()))?;

        let Some(req) = req else {
            // GET request: report the current configuration.
            if is_update {
                debug!("Updating hello for {remote_address}");
            }
            return Ok(state.cluster.clone());
        };

        if req.slave_id.is_empty() {
            return Err(Error::BadRequest("SlaveID must be set.".to_string()));
        }
        if self.mode.is_single_mode() {
            return Err(Error::PreconditionFailed(
                "Cannot join a single server deployment".to_string(),
            ));
        }

        let slave_address = derive_slave_address(&req.slave_address, remote_address, own_address);

        if let Some(existing) = state.cluster.peer_by_id(&req.slave_id).cloned() {
            // Known peer: refresh its reachable address and secureness.
            let mut updated = existing;
            updated.address = slave_address;
            updated.port = req.slave_port;
            updated.is_secure = req.is_secure;
            if !req.data_dir.is_empty() {
                updated.data_dir = req.data_dir.clone();
            }
            state.cluster.add_or_update_peer(updated);
            return Ok(state.cluster.clone());
        }

        let port_offset = {
            let same_address = state
                .cluster
                .peers
                .iter()
                .filter(|p| p.address == slave_address)
                .count();
            same_address as u16 * PORT_OFFSET_INCREMENT
        };
        let mut peer = Peer::new(
            &req.slave_id,
            slave_address,
            req.slave_port,
            port_offset,
            req.data_dir.clone(),
        );
        peer.is_secure = req.is_secure;
        peer.has_agent_flag = req
            .agent
            .unwrap_or(state.cluster.agent_count() < state.cluster.agency_size);
        peer.has_dbserver_flag = req.dbserver.unwrap_or(true);
        peer.has_coordinator_flag = req.coordinator.unwrap_or(true);
        peer.has_resilient_single_flag = self.mode.is_active_failover_mode();
        info!(
            "Added new peer '{}' at {}:{}",
            peer.id, peer.address, peer.port
        );
        state.cluster.add_or_update_peer(peer);
        Ok(state.cluster.clone())
    }

    fn handle_goodbye(&self, id: &str) -> Result<bool> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| Error::Transient("cluster state poisoned".to_string()))?;
        Ok(state.cluster.remove_peer_by_id(id))
    }

    fn stop(&self) {
        self.cancel.cancel();
    }

    async fn send_master_leave_cluster(&self) -> Result<()> {
        let master = self.is_running_master();
        if master.is_running_master {
            // We are the master; drop ourselves locally.
            self.handle_goodbye(&self.id)?;
            return Ok(());
        }
        if master.master_url.is_empty() {
            return Err(Error::ServiceUnavailable(
                "No runtime master known".to_string(),
            ));
        }
        let url = starter_core::net::get_url_with_path(&master.master_url, "/goodbye")?;
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "SlaveID": self.id }))
            .send()
            .await
            .map_err(|err| Error::Transient(format!("cannot reach master: {err}")))?;
        if !response.status().is_success() {
            return Err(Error::Status(
                response.status().as_u16(),
                "master refused goodbye".to_string(),
            ));
        }
        Ok(())
    }

    fn master_changed_callback(&self) {
        info!("Master changed, refreshing cluster configuration");
    }

    fn is_local_slave(&self) -> bool {
        self.is_local_slave
    }

    fn database_features(&self) -> DatabaseFeatures {
        self.features
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    fn upgrade_manager(&self) -> Arc<dyn UpgradeManager> {
        Arc::clone(&self.upgrade) as Arc<dyn UpgradeManager>
    }

    fn server_port(&self, server_type: ServerType) -> Result<u16> {
        Ok(self.own_peer()?.server_port(server_type))
    }

    fn server_host_dir(&self, server_type: ServerType) -> Result<PathBuf> {
        let port = self.server_port(server_type)?;
        Ok(self.data_dir.join(format!("{server_type}{port}")))
    }

    fn server_container_dir(&self, server_type: ServerType) -> Result<PathBuf> {
        // Native servers see the host paths unchanged.
        self.server_host_dir(server_type)
    }

    fn server_host_log_file(&self, server_type: ServerType) -> Result<PathBuf> {
        let dir = self.server_host_dir(server_type)?;
        Ok(dir.join(server_type.process_type().log_file_name()))
    }

    fn server_container_log_file(&self, server_type: ServerType) -> Result<PathBuf> {
        self.server_host_log_file(server_type)
    }

    fn remove_recovery_file(&self) {
        let path = self.data_dir.join(RECOVERY_FILE_NAME);
        if std::fs::remove_file(&path).is_ok() {
            info!("Removed recovery file");
        }
    }

    fn create_server_config(
        &self,
        server_type: ServerType,
        host_dir: &Path,
        container_dir: &Path,
        port: u16,
    ) -> Result<Vec<Volume>> {
        match server_type.process_type() {
            ProcessType::Database => {
                let conf_path = host_dir.join("server.conf");
                if !conf_path.exists() {
                    let schemes = UrlSchemes::new(self.own_peer()?.is_secure);
                    let content = format!(
                        "[server]\nendpoint = {}://[::]:{port}\nstorage-engine = auto\n\n[log]\nlevel = info\n",
                        schemes.shell
                    );
                    std::fs::write(&conf_path, content)?;
                }
                Ok(Vec::new())
            }
            ProcessType::Sync => {
                let secret_path = host_dir.join("cluster-secret");
                if !secret_path.exists() {
                    std::fs::write(&secret_path, &self.sync_secret)?;
                }
                Ok(vec![Volume {
                    host_path: secret_path,
                    container_path: container_dir.join("cluster-secret"),
                    read_only: true,
                }])
            }
        }
    }

    fn build_server_args(
        &self,
        server_type: ServerType,
        container_dir: &Path,
        container_log_file: &Path,
        port: u16,
        database_auto_upgrade: bool,
    ) -> Result<Vec<String>> {
        let my_peer = self.own_peer()?;
        let (cluster, _, _) = self.cluster_config();
        let schemes = UrlSchemes::new(my_peer.is_secure);
        let my_address = format!("{}://{}:{port}", schemes.shell, my_peer.address);

        let mut args = Vec::new();
        match server_type.process_type() {
            ProcessType::Database => {
                args.push(format!(
                    "--configuration={}",
                    container_dir.join("server.conf").display()
                ));
                args.push(format!("--server.endpoint={}://[::]:{port}", schemes.shell));
                args.push(format!("--log.file={}", container_log_file.display()));
                args.push(format!(
                    "--database.directory={}",
                    container_dir.join("data").display()
                ));
                match server_type {
                    ServerType::Agent => {
                        args.push("--agency.activate=true".to_string());
                        args.push(format!("--agency.size={}", cluster.agency_size));
                        args.push(format!("--agency.my-address={my_address}"));
                        for endpoint in cluster.agent_endpoints() {
                            args.push(format!("--agency.endpoint={endpoint}"));
                        }
                        if let Some(recovery_id) = &self.bootstrap.recovery_agent_id {
                            args.push(format!("--agency.my-id={recovery_id}"));
                        }
                    }
                    ServerType::DBServer => {
                        args.push("--cluster.my-role=PRIMARY".to_string());
                        args.push(format!("--cluster.my-address={my_address}"));
                        for endpoint in cluster.agent_endpoints() {
                            args.push(format!("--cluster.agency-endpoint={endpoint}"));
                        }
                    }
                    ServerType::Coordinator => {
                        args.push("--cluster.my-role=COORDINATOR".to_string());
                        args.push(format!("--cluster.my-address={my_address}"));
                        for endpoint in cluster.agent_endpoints() {
                            args.push(format!("--cluster.agency-endpoint={endpoint}"));
                        }
                    }
                    ServerType::ResilientSingle => {
                        args.push("--replication.automatic-failover=true".to_string());
                        args.push(format!("--cluster.my-address={my_address}"));
                        for endpoint in cluster.agent_endpoints() {
                            args.push(format!("--cluster.agency-endpoint={endpoint}"));
                        }
                    }
                    _ => {}
                }
                if database_auto_upgrade {
                    args.push("--database.auto-upgrade=true".to_string());
                }
            }
            ProcessType::Sync => {
                args.push("run".to_string());
                args.push(
                    if server_type == ServerType::SyncMaster {
                        "master"
                    } else {
                        "worker"
                    }
                    .to_string(),
                );
                args.push(format!(
                    "--server.endpoint=https://{}:{port}",
                    my_peer.address
                ));
                args.push(format!(
                    "--master.jwt-secret={}",
                    container_dir.join("cluster-secret").display()
                ));
                if server_type == ServerType::SyncMaster {
                    for endpoint in cluster.agent_endpoints() {
                        args.push(format!("--cluster.endpoint={endpoint}"));
                    }
                } else {
                    let master_port = my_peer.server_port(ServerType::SyncMaster);
                    args.push(format!(
                        "--master.endpoint=https://{}:{master_port}",
                        my_peer.address
                    ));
                }
            }
        }
        Ok(args)
    }

    async fn test_instance(
        &self,
        cancel: CancellationToken,
        server_type: ServerType,
        address: &str,
        port: u16,
        status_changed: Option<mpsc::Sender<StatusItem>>,
    ) -> InstanceStatus {
        let url = self.status_url(address, port);
        let (expected_role, expected_mode) = server_type.expected_server_role();
        let start = tokio::time::Instant::now();
        let mut prev_code = STATUS_UNREACHABLE;
        let mut trail: Vec<i32> = Vec::new();
        let mut last_body: Option<StatusResponse> = None;
        let mut last_code = STATUS_UNREACHABLE;

        loop {
            if cancel.is_cancelled() {
                return InstanceStatus {
                    cancelled: true,
                    status_trail: trail,
                    ..Default::default()
                };
            }

            let code = match self.client.get(&url).send().await {
                Err(_) => STATUS_UNREACHABLE,
                Ok(response) if !response.status().is_success() => STATUS_BAD_RESPONSE,
                Ok(response) => match response.json::<StatusResponse>().await {
                    Err(_) => STATUS_BAD_RESPONSE,
                    Ok(body) => {
                        let correct = body.role == expected_role
                            && (expected_mode.is_empty() || body.mode == expected_mode);
                        last_body = Some(body);
                        if correct {
                            STATUS_GOOD
                        } else {
                            STATUS_WRONG_ROLE
                        }
                    }
                },
            };
            if trail.last() != Some(&code) {
                trail.push(code);
            }
            if let Some(tx) = &status_changed {
                let _ = tx
                    .send(StatusItem {
                        prev_status_code: prev_code,
                        status_code: code,
                        duration: start.elapsed(),
                    })
                    .await;
            }
            prev_code = code;
            last_code = code;

            if code == STATUS_GOOD {
                let body = last_body.unwrap_or_default();
                return InstanceStatus {
                    up: true,
                    correct_role: true,
                    version: body.version,
                    role: body.role,
                    mode: body.mode,
                    is_leader: body.leader,
                    status_trail: trail,
                    cancelled: false,
                };
            }
            if start.elapsed() >= TEST_INSTANCE_TIMEOUT {
                let body = last_body.unwrap_or_default();
                return InstanceStatus {
                    up: last_code >= STATUS_WRONG_ROLE,
                    correct_role: false,
                    version: body.version,
                    role: body.role,
                    mode: body.mode,
                    is_leader: body.leader,
                    status_trail: trail,
                    cancelled: false,
                };
            }

            tokio::select! {
                () = cancel.cancelled() => {
                    return InstanceStatus {
                        cancelled: true,
                        status_trail: trail,
                        ..Default::default()
                    };
                }
                () = tokio::time::sleep(TEST_INSTANCE_INTERVAL) => {}
            }
        }
    }
}

/// In-memory implementation of the auto-upgrade latch.
#[derive(Debug, Default)]
pub struct LatchUpgradeManager {
    latched: Mutex<Vec<ServerType>>,
    in_progress: Mutex<Vec<ServerType>>,
}

impl LatchUpgradeManager {
    /// Latch an auto-upgrade for the next start of the given role.
    pub fn latch(&self, server_type: ServerType) {
        if let Ok(mut latched) = self.latched.lock() {
            if !latched.contains(&server_type) {
                latched.push(server_type);
            }
        }
    }

    /// Mark the upgrade of the given role as finished.
    pub fn finish_upgrade(&self, server_type: ServerType) {
        if let Ok(mut in_progress) = self.in_progress.lock() {
            in_progress.retain(|t| *t != server_type);
        }
    }
}

impl UpgradeManager for LatchUpgradeManager {
    fn server_database_auto_upgrade(&self, server_type: ServerType) -> bool {
        self.latched
            .lock()
            .map(|latched| latched.contains(&server_type))
            .unwrap_or(false)
    }

    fn server_database_auto_upgrade_started(&self, server_type: ServerType) {
        if let Ok(mut latched) = self.latched.lock() {
            latched.retain(|t| *t != server_type);
        }
        if let Ok(mut in_progress) = self.in_progress.lock() {
            if !in_progress.contains(&server_type) {
                in_progress.push(server_type);
            }
        }
    }

    fn is_server_upgrade_in_progress(&self, server_type: ServerType) -> bool {
        self.in_progress
            .lock()
            .map(|in_progress| in_progress.contains(&server_type))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_starter(mode: ServiceMode) -> Starter {
        let options = StarterOptions {
            id: "p1".to_string(),
            own_address: "10.0.0.1".to_string(),
            data_dir: PathBuf::from("/tmp/starter-test"),
            mode,
            agency_size: 3,
            is_local_slave: false,
            is_secure: false,
        };
        Starter::new(options, Config::default(), BootstrapConfig::default()).unwrap()
    }

    fn hello(id: &str, address: &str, port: u16) -> HelloRequest {
        HelloRequest {
            slave_id: id.to_string(),
            slave_address: address.to_string(),
            slave_port: port,
            ..Default::default()
        }
    }

    #[test]
    fn test_bootstrap_registers_own_peer() {
        let starter = test_starter(ServiceMode::Cluster);
        let (cluster, my_peer, mode) = starter.cluster_config();
        assert_eq!(cluster.peers.len(), 1);
        assert_eq!(my_peer.unwrap().id, "p1");
        assert!(mode.is_cluster_mode());
        assert!(starter.is_running_master().is_running_master);
    }

    #[test]
    fn test_hello_adds_peer_with_derived_address() {
        let starter = test_starter(ServiceMode::Cluster);
        let req = hello("p2", "", 8528);
        let cluster = starter
            .handle_hello("10.0.0.1", "10.0.0.2:38422", Some(&req), false)
            .unwrap();
        assert_eq!(cluster.peers.len(), 2);
        assert_eq!(cluster.peer_by_id("p2").unwrap().address, "10.0.0.2");
    }

    #[test]
    fn test_hello_is_idempotent() {
        let starter = test_starter(ServiceMode::Cluster);
        let req = hello("p2", "10.0.0.2", 8528);
        let first = starter
            .handle_hello("10.0.0.1", "10.0.0.2:38422", Some(&req), false)
            .unwrap();
        let second = starter
            .handle_hello("10.0.0.1", "10.0.0.2:38422", Some(&req), false)
            .unwrap();
        assert_eq!(
            serde_json::to_vec(&first).unwrap(),
            serde_json::to_vec(&second).unwrap()
        );
    }

    #[test]
    fn test_hello_rejected_in_single_mode() {
        let starter = test_starter(ServiceMode::Single);
        let req = hello("p2", "10.0.0.2", 8528);
        let err = starter
            .handle_hello("10.0.0.1", "10.0.0.2:38422", Some(&req), false)
            .unwrap_err();
        assert!(matches!(err, Error::PreconditionFailed(_)));
    }

    #[test]
    fn test_hello_assigns_port_offsets_per_address() {
        let starter = test_starter(ServiceMode::Cluster);
        starter
            .handle_hello("10.0.0.1", "", Some(&hello("p2", "10.0.0.2", 8528)), false)
            .unwrap();
        let cluster = starter
            .handle_hello("10.0.0.1", "", Some(&hello("p3", "10.0.0.2", 8528)), false)
            .unwrap();
        assert_eq!(cluster.peer_by_id("p2").unwrap().port_offset, 0);
        assert_eq!(
            cluster.peer_by_id("p3").unwrap().port_offset,
            PORT_OFFSET_INCREMENT
        );
    }

    #[test]
    fn test_agent_flag_defaults_to_agency_size() {
        let starter = test_starter(ServiceMode::Cluster);
        // Own peer already hosts one agent; two more fill the agency.
        for (id, addr) in [("p2", "10.0.0.2"), ("p3", "10.0.0.3"), ("p4", "10.0.0.4")] {
            starter
                .handle_hello("10.0.0.1", "", Some(&hello(id, addr, 8528)), false)
                .unwrap();
        }
        let (cluster, _, _) = starter.cluster_config();
        assert!(cluster.peer_by_id("p2").unwrap().has_agent());
        assert!(cluster.peer_by_id("p3").unwrap().has_agent());
        assert!(!cluster.peer_by_id("p4").unwrap().has_agent());
    }

    #[test]
    fn test_goodbye_is_idempotent() {
        let starter = test_starter(ServiceMode::Cluster);
        starter
            .handle_hello("10.0.0.1", "", Some(&hello("p2", "10.0.0.2", 8528)), false)
            .unwrap();
        assert!(starter.handle_goodbye("p2").unwrap());
        assert!(!starter.handle_goodbye("p2").unwrap());
    }

    #[test]
    fn test_server_paths_derive_from_port() {
        let starter = test_starter(ServiceMode::Cluster);
        assert_eq!(starter.server_port(ServerType::Agent).unwrap(), 8531);
        assert_eq!(
            starter.server_host_dir(ServerType::Agent).unwrap(),
            PathBuf::from("/tmp/starter-test/agent8531")
        );
        assert_eq!(
            starter.server_host_log_file(ServerType::Agent).unwrap(),
            PathBuf::from("/tmp/starter-test/agent8531/server.log")
        );
    }

    #[test]
    fn test_build_agent_args() {
        let starter = test_starter(ServiceMode::Cluster);
        let args = starter
            .build_server_args(
                ServerType::Agent,
                Path::new("/data/agent8531"),
                Path::new("/data/agent8531/server.log"),
                8531,
                false,
            )
            .unwrap();
        assert!(args.contains(&"--agency.activate=true".to_string()));
        assert!(args.contains(&"--agency.size=3".to_string()));
        assert!(args.iter().any(|a| a.starts_with("--server.endpoint=tcp://")));
        assert!(!args.iter().any(|a| a.contains("auto-upgrade")));
    }

    #[test]
    fn test_auto_upgrade_flag_is_added() {
        let starter = test_starter(ServiceMode::Cluster);
        let args = starter
            .build_server_args(
                ServerType::DBServer,
                Path::new("/data/dbserver8530"),
                Path::new("/data/dbserver8530/server.log"),
                8530,
                true,
            )
            .unwrap();
        assert!(args.contains(&"--database.auto-upgrade=true".to_string()));
    }

    #[test]
    fn test_upgrade_latch_is_one_shot() {
        let latch = LatchUpgradeManager::default();
        assert!(!latch.server_database_auto_upgrade(ServerType::DBServer));

        latch.latch(ServerType::DBServer);
        assert!(latch.server_database_auto_upgrade(ServerType::DBServer));
        assert!(!latch.server_database_auto_upgrade(ServerType::Agent));

        latch.server_database_auto_upgrade_started(ServerType::DBServer);
        assert!(!latch.server_database_auto_upgrade(ServerType::DBServer));
        assert!(latch.is_server_upgrade_in_progress(ServerType::DBServer));

        latch.finish_upgrade(ServerType::DBServer);
        assert!(!latch.is_server_upgrade_in_progress(ServerType::DBServer));
    }

    #[test]
    fn test_derive_slave_address() {
        assert_eq!(
            derive_slave_address("10.0.0.9", "10.0.0.2:38422", "10.0.0.1"),
            "10.0.0.9"
        );
        assert_eq!(
            derive_slave_address("", "10.0.0.2:38422", "10.0.0.1"),
            "10.0.0.2"
        );
        assert_eq!(derive_slave_address("", "", "10.0.0.1"), "10.0.0.1");
    }
}
