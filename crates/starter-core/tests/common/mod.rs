//! In-memory fakes of the supervisor's collaborators.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use starter_core::cluster::{ClusterConfig, Peer, ServiceMode};
use starter_core::context::{
    ClusterContext, DatabaseFeatures, HelloRequest, InstanceStatus, MasterInfo, StatusItem,
    UpgradeManager,
};
use starter_core::errors::Result;
use starter_core::process::{OutputSink, Process, ProcessType, Runner, ServerType, Volume};

/// Shared event log recording lifecycle calls in order.
pub type Events = Arc<Mutex<Vec<String>>>;

pub fn new_events() -> Events {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn snapshot(events: &Events) -> Vec<String> {
    events.lock().unwrap().clone()
}

/// A process whose exit is controlled by the test.
pub struct FakeProcess {
    pid: u32,
    label: String,
    events: Events,
    exit_tx: watch::Sender<bool>,
    pub hups: Arc<AtomicUsize>,
}

impl FakeProcess {
    pub fn new(pid: u32, label: impl Into<String>, events: Events, exited: bool) -> Self {
        let (exit_tx, _) = watch::channel(exited);
        Self {
            pid,
            label: label.into(),
            events,
            exit_tx,
            hups: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn record(&self, what: &str) {
        self.events
            .lock()
            .unwrap()
            .push(format!("{what}:{}", self.label));
    }
}

#[async_trait]
impl Process for FakeProcess {
    fn process_id(&self) -> u32 {
        self.pid
    }

    fn host_port(&self, internal_port: u16) -> Result<u16> {
        Ok(internal_port)
    }

    async fn wait(&self) {
        let mut rx = self.exit_tx.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn terminate(&self) -> Result<()> {
        self.record("terminate");
        let _ = self.exit_tx.send(true);
        Ok(())
    }

    fn kill(&self) -> Result<()> {
        self.record("kill");
        let _ = self.exit_tx.send(true);
        Ok(())
    }

    fn hup(&self) -> Result<()> {
        self.record("hup");
        self.hups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        self.record("cleanup");
        Ok(())
    }
}

/// A runner producing [`FakeProcess`]es.
pub struct FakeRunner {
    events: Events,
    /// Started processes exit immediately when set.
    pub exit_immediately: bool,
    next_pid: AtomicU32,
    pub cleanup_calls: Arc<AtomicUsize>,
}

impl FakeRunner {
    pub fn new(events: Events) -> Self {
        Self {
            events,
            exit_immediately: false,
            next_pid: AtomicU32::new(100),
            cleanup_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn exiting_immediately(events: Events) -> Self {
        Self {
            exit_immediately: true,
            ..Self::new(events)
        }
    }
}

#[async_trait]
impl Runner for FakeRunner {
    async fn start(
        &self,
        _process_type: ProcessType,
        _executable: &Path,
        _args: &[String],
        _volumes: &[Volume],
        _ports: &[u16],
        container_name: &str,
        _host_dir: &Path,
        _output: Option<OutputSink>,
    ) -> Result<Arc<dyn Process>> {
        // Container names have the shape <serverType>-<peer>-<restart>-...
        let label = container_name
            .split('-')
            .next()
            .unwrap_or(container_name)
            .to_string();
        self.events.lock().unwrap().push(format!("start:{label}"));
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeProcess::new(
            pid,
            label,
            Arc::clone(&self.events),
            self.exit_immediately,
        )))
    }

    async fn get_running_server(&self, _host_dir: &Path) -> Result<Option<Arc<dyn Process>>> {
        Ok(None)
    }

    async fn cleanup(&self) -> Result<()> {
        self.events.lock().unwrap().push("runner-cleanup".to_string());
        self.cleanup_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Upgrade manager with no latched upgrades.
#[derive(Debug, Default)]
pub struct NoUpgrades;

impl UpgradeManager for NoUpgrades {
    fn server_database_auto_upgrade(&self, _server_type: ServerType) -> bool {
        false
    }

    fn server_database_auto_upgrade_started(&self, _server_type: ServerType) {}

    fn is_server_upgrade_in_progress(&self, _server_type: ServerType) -> bool {
        false
    }
}

/// Cluster context backed by plain in-memory state.
pub struct FakeContext {
    pub cluster: Mutex<ClusterConfig>,
    pub my_id: String,
    pub mode: ServiceMode,
    pub data_dir: PathBuf,
    /// Per-role port overrides; roles not listed get port 0 (always free).
    pub ports: Mutex<HashMap<ServerType, u16>>,
    /// Probes report up + correct role immediately when set; otherwise
    /// they block until cancelled.
    pub probe_up: bool,
    pub stop_calls: Arc<AtomicUsize>,
    pub cancel: CancellationToken,
    upgrades: Arc<NoUpgrades>,
}

impl FakeContext {
    pub fn new(mode: ServiceMode, data_dir: PathBuf) -> Self {
        let mut peer = Peer::new("p1", "127.0.0.1", 0, 0, data_dir.display().to_string());
        if mode.is_single_mode() {
            peer.has_agent_flag = false;
            peer.has_dbserver_flag = false;
            peer.has_coordinator_flag = false;
        }
        peer.has_resilient_single_flag = mode.is_active_failover_mode();
        let mut cluster = ClusterConfig::new(3, 0);
        cluster.add_or_update_peer(peer);
        Self {
            cluster: Mutex::new(cluster),
            my_id: "p1".to_string(),
            mode,
            data_dir,
            ports: Mutex::new(HashMap::new()),
            probe_up: true,
            stop_calls: Arc::new(AtomicUsize::new(0)),
            cancel: CancellationToken::new(),
            upgrades: Arc::new(NoUpgrades),
        }
    }

    pub fn set_port(&self, server_type: ServerType, port: u16) {
        self.ports.lock().unwrap().insert(server_type, port);
    }
}

#[async_trait]
impl ClusterContext for FakeContext {
    fn cluster_config(&self) -> (ClusterConfig, Option<Peer>, ServiceMode) {
        let cluster = self.cluster.lock().unwrap().clone();
        let my_peer = cluster.peer_by_id(&self.my_id).cloned();
        (cluster, my_peer, self.mode)
    }

    fn is_running_master(&self) -> MasterInfo {
        MasterInfo {
            is_running_master: true,
            is_running: true,
            master_url: "http://127.0.0.1:8528".to_string(),
        }
    }

    fn handle_hello(
        &self,
        _own_address: &str,
        _remote_address: &str,
        _req: Option<&HelloRequest>,
        _is_update: bool,
    ) -> Result<ClusterConfig> {
        Ok(self.cluster.lock().unwrap().clone())
    }

    fn handle_goodbye(&self, id: &str) -> Result<bool> {
        Ok(self.cluster.lock().unwrap().remove_peer_by_id(id))
    }

    fn stop(&self) {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.cancel.cancel();
    }

    async fn send_master_leave_cluster(&self) -> Result<()> {
        Ok(())
    }

    fn master_changed_callback(&self) {}

    fn is_local_slave(&self) -> bool {
        false
    }

    fn database_features(&self) -> DatabaseFeatures {
        DatabaseFeatures::default()
    }

    fn upgrade_manager(&self) -> Arc<dyn UpgradeManager> {
        Arc::clone(&self.upgrades) as Arc<dyn UpgradeManager>
    }

    fn server_port(&self, server_type: ServerType) -> Result<u16> {
        Ok(self
            .ports
            .lock()
            .unwrap()
            .get(&server_type)
            .copied()
            .unwrap_or(0))
    }

    fn server_host_dir(&self, server_type: ServerType) -> Result<PathBuf> {
        Ok(self.data_dir.join(server_type.to_string()))
    }

    fn server_container_dir(&self, server_type: ServerType) -> Result<PathBuf> {
        self.server_host_dir(server_type)
    }

    fn server_host_log_file(&self, server_type: ServerType) -> Result<PathBuf> {
        Ok(self
            .server_host_dir(server_type)?
            .join(server_type.process_type().log_file_name()))
    }

    fn server_container_log_file(&self, server_type: ServerType) -> Result<PathBuf> {
        self.server_host_log_file(server_type)
    }

    fn remove_recovery_file(&self) {}

    fn create_server_config(
        &self,
        _server_type: ServerType,
        _host_dir: &Path,
        _container_dir: &Path,
        _port: u16,
    ) -> Result<Vec<Volume>> {
        Ok(Vec::new())
    }

    fn build_server_args(
        &self,
        _server_type: ServerType,
        _container_dir: &Path,
        _container_log_file: &Path,
        _port: u16,
        _database_auto_upgrade: bool,
    ) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn test_instance(
        &self,
        cancel: CancellationToken,
        server_type: ServerType,
        _address: &str,
        _port: u16,
        status_changed: Option<mpsc::Sender<StatusItem>>,
    ) -> InstanceStatus {
        if self.probe_up {
            if let Some(tx) = &status_changed {
                let _ = tx
                    .send(StatusItem {
                        prev_status_code: 0,
                        status_code: 3,
                        duration: Duration::from_millis(1),
                    })
                    .await;
            }
            let (role, mode) = server_type.expected_server_role();
            return InstanceStatus {
                up: true,
                correct_role: true,
                version: "1.0.0".to_string(),
                role: role.to_string(),
                mode: mode.to_string(),
                is_leader: true,
                status_trail: vec![3],
                cancelled: false,
            };
        }
        cancel.cancelled().await;
        InstanceStatus {
            cancelled: true,
            ..Default::default()
        }
    }
}
