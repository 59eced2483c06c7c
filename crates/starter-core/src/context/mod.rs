//! Capability contracts the supervisor consumes.
//!
//! The cluster context is the single source of truth for membership, mode
//! and peer identity. The supervisor reads it at every start attempt and
//! never caches it. Implementations live outside this crate; tests use
//! in-memory fakes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cluster::{ClusterConfig, Peer, ServiceMode};
use crate::errors::Result;
use crate::process::{ServerType, Volume};

/// Payload of a `/hello` POST request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HelloRequest {
    /// Unique ID of the joining peer.
    #[serde(rename = "SlaveID")]
    pub slave_id: String,

    /// Address used to reach the peer; derived from the request when empty.
    #[serde(rename = "SlaveAddress", default)]
    pub slave_address: String,

    /// Port used to reach the peer.
    #[serde(rename = "SlavePort")]
    pub slave_port: u16,

    /// Directory used for data by the peer.
    #[serde(rename = "DataDir", default)]
    pub data_dir: String,

    /// Whether servers started by the peer use TLS.
    #[serde(rename = "IsSecure", default)]
    pub is_secure: bool,

    /// Whether the peer gets an agent. Unset means default handling.
    #[serde(rename = "Agent", skip_serializing_if = "Option::is_none", default)]
    pub agent: Option<bool>,

    /// Whether the peer gets a dbserver. Unset means default handling.
    #[serde(rename = "DBServer", skip_serializing_if = "Option::is_none", default)]
    pub dbserver: Option<bool>,

    /// Whether the peer gets a coordinator. Unset means default handling.
    #[serde(
        rename = "Coordinator",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub coordinator: Option<bool>,
}

/// Payload of a `/goodbye` POST request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoodbyeRequest {
    /// Unique ID of the peer that should be removed.
    #[serde(rename = "SlaveID")]
    pub slave_id: String,
}

/// Answer to [`ClusterContext::is_running_master`].
#[derive(Debug, Clone, Default)]
pub struct MasterInfo {
    /// This starter is the running master.
    pub is_running_master: bool,
    /// The deployment is in its running phase.
    pub is_running: bool,
    /// URL of the running master, empty when unknown.
    pub master_url: String,
}

/// One status observation of a starting server instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusItem {
    /// Status code of the previous observation.
    pub prev_status_code: i32,
    /// Status code of this observation.
    pub status_code: i32,
    /// Time spent probing so far.
    pub duration: Duration,
}

/// Final outcome of a [`ClusterContext::test_instance`] probe.
#[derive(Debug, Clone, Default)]
pub struct InstanceStatus {
    /// The instance answers on its port.
    pub up: bool,
    /// The instance reports the role/mode expected for its server type.
    pub correct_role: bool,
    /// Reported server version.
    pub version: String,
    /// Reported role.
    pub role: String,
    /// Reported mode.
    pub mode: String,
    /// The instance is the leader of its group.
    pub is_leader: bool,
    /// Sequence of distinct status codes observed while probing.
    pub status_trail: Vec<i32>,
    /// The probe was cancelled before reaching a verdict.
    pub cancelled: bool,
}

/// Features detected from the database executable version.
#[derive(Debug, Clone, Default)]
pub struct DatabaseFeatures {
    /// Version reported by the executable.
    pub version: String,
}

/// One-shot auto-upgrade latch per server role.
///
/// When latched, exactly the next start of the corresponding role adds the
/// database auto-upgrade flag; starting the server consumes the latch.
pub trait UpgradeManager: Send + Sync {
    /// Whether the next start of this role must run with auto-upgrade.
    fn server_database_auto_upgrade(&self, server_type: ServerType) -> bool;

    /// Notify that a server consumed its auto-upgrade chance.
    fn server_database_auto_upgrade_started(&self, server_type: ServerType);

    /// Whether an upgrade is currently in progress for this role, making
    /// exits expected.
    fn is_server_upgrade_in_progress(&self, server_type: ServerType) -> bool;
}

/// Context the supervisor and HTTP server operate against.
#[async_trait]
pub trait ClusterContext: Send + Sync {
    /// Current cluster configuration, own peer (if joined) and mode.
    fn cluster_config(&self) -> (ClusterConfig, Option<Peer>, ServiceMode);

    /// Whether this starter is the running master.
    fn is_running_master(&self) -> MasterInfo;

    /// Handle a hello request. `req` is `None` for GET requests.
    fn handle_hello(
        &self,
        own_address: &str,
        remote_address: &str,
        req: Option<&HelloRequest>,
        is_update: bool,
    ) -> Result<ClusterConfig>;

    /// Remove the peer with the given ID from the cluster configuration.
    /// Returns whether the peer was present.
    fn handle_goodbye(&self, id: &str) -> Result<bool>;

    /// Stop this peer and everything it supervises.
    fn stop(&self);

    /// Inform the master that this peer is leaving for good.
    async fn send_master_leave_cluster(&self) -> Result<()>;

    /// Invoked by the agency when the master changed.
    fn master_changed_callback(&self);

    /// Whether this peer runs as a local slave of another starter on the
    /// same machine.
    fn is_local_slave(&self) -> bool;

    /// Detected database features.
    fn database_features(&self) -> DatabaseFeatures;

    /// The auto-upgrade latch service.
    fn upgrade_manager(&self) -> Arc<dyn UpgradeManager>;

    /// Port on which my server of the given type will listen.
    fn server_port(&self, server_type: ServerType) -> Result<u16>;

    /// Host-namespace data directory for the given server.
    fn server_host_dir(&self, server_type: ServerType) -> Result<PathBuf>;

    /// Container-namespace data directory for the given server.
    fn server_container_dir(&self, server_type: ServerType) -> Result<PathBuf>;

    /// Host-namespace log file of the given server.
    fn server_host_log_file(&self, server_type: ServerType) -> Result<PathBuf>;

    /// Container-namespace log file of the given server.
    fn server_container_log_file(&self, server_type: ServerType) -> Result<PathBuf>;

    /// Remove any recorded recovery marker file.
    fn remove_recovery_file(&self);

    /// Materialize the on-disk configuration for a server about to start
    /// and return the volumes it requires.
    ///
    /// For the database family this writes the server config file; for the
    /// sync family it emits the cluster secret file.
    fn create_server_config(
        &self,
        server_type: ServerType,
        host_dir: &Path,
        container_dir: &Path,
        port: u16,
    ) -> Result<Vec<Volume>>;

    /// Build the command line for a server of the given type.
    fn build_server_args(
        &self,
        server_type: ServerType,
        container_dir: &Path,
        container_log_file: &Path,
        port: u16,
        database_auto_upgrade: bool,
    ) -> Result<Vec<String>>;

    /// Check the `up` status of a server instance.
    ///
    /// Status updates are delivered over `status_changed` while probing;
    /// the sequence ends when the probe returns. Cancellation is by the
    /// caller's token.
    async fn test_instance(
        &self,
        cancel: CancellationToken,
        server_type: ServerType,
        address: &str,
        port: u16,
        status_changed: Option<mpsc::Sender<StatusItem>>,
    ) -> InstanceStatus;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_request_tri_state_serialization() {
        let req = HelloRequest {
            slave_id: "p2".to_string(),
            slave_port: 8530,
            ..Default::default()
        };
        let json = serde_json::to_string(&req).unwrap();
        // Unset tri-state flags are omitted from the wire form.
        assert!(!json.contains("Agent"));
        assert!(!json.contains("DBServer"));
        assert!(!json.contains("Coordinator"));

        let req = HelloRequest {
            slave_id: "p2".to_string(),
            slave_port: 8530,
            dbserver: Some(false),
            ..Default::default()
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"DBServer\":false"));
    }

    #[test]
    fn test_hello_request_wire_names() {
        let json = r#"{"SlaveID":"p2","SlaveAddress":"","SlavePort":8530,"IsSecure":false}"#;
        let req: HelloRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.slave_id, "p2");
        assert_eq!(req.slave_port, 8530);
        assert!(req.agent.is_none());
    }
}
