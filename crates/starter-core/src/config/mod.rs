//! Starter configuration.
//!
//! [`Config`] carries the settings the supervisor needs at every start
//! attempt; [`BootstrapConfig`] carries the one-time bootstrap decisions
//! made when the deployment was first created.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::process::ProcessType;

/// Runtime configuration of the starter.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path of the database server executable.
    pub server_path: PathBuf,

    /// Path of the synchronization executable.
    pub sync_path: PathBuf,

    /// Base port of this starter.
    pub master_port: u16,

    /// Optional prefix for container names of supervised servers.
    pub container_name_prefix: String,

    /// Emit verbose cluster diagnostics (status transitions at info level).
    pub debug_cluster: bool,

    /// Number of rotated log files to keep per server.
    pub log_rotate_files_to_keep: usize,

    /// Version of this starter, reported on `/version`.
    pub project_version: String,

    /// Build of this starter, reported on `/version`.
    pub project_build: String,
}

impl Config {
    /// Path of the executable for the given process family.
    #[must_use]
    pub fn server_executable(&self, process_type: ProcessType) -> PathBuf {
        match process_type {
            ProcessType::Database => self.server_path.clone(),
            ProcessType::Sync => self.sync_path.clone(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_path: PathBuf::from("dbserverd"),
            sync_path: PathBuf::from("dbsyncd"),
            master_port: crate::cluster::DEFAULT_BASE_PORT,
            container_name_prefix: String::new(),
            debug_cluster: false,
            log_rotate_files_to_keep: 5,
            project_version: env!("CARGO_PKG_VERSION").to_string(),
            project_build: String::new(),
        }
    }
}

/// Bootstrap-time decisions, persisted when the deployment is created.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BootstrapConfig {
    /// Start a dbserver on this peer. Unset means yes.
    #[serde(rename = "StartDBServer", skip_serializing_if = "Option::is_none")]
    pub start_dbserver: Option<bool>,

    /// Start a coordinator on this peer. Unset means yes.
    #[serde(rename = "StartCoordinator", skip_serializing_if = "Option::is_none")]
    pub start_coordinator: Option<bool>,

    /// Start a sync master on this peer. Unset means yes.
    #[serde(rename = "StartSyncMaster", skip_serializing_if = "Option::is_none")]
    pub start_sync_master: Option<bool>,

    /// Start a sync worker on this peer. Unset means yes.
    #[serde(rename = "StartSyncWorker", skip_serializing_if = "Option::is_none")]
    pub start_sync_worker: Option<bool>,

    /// Agent ID to recover, set while a recovery file is present.
    #[serde(rename = "RecoveryAgentID", skip_serializing_if = "Option::is_none")]
    pub recovery_agent_id: Option<String>,
}

impl BootstrapConfig {
    /// Resolve a tri-state start flag: unset means enabled.
    #[must_use]
    pub fn flag_enabled(flag: Option<bool>) -> bool {
        flag.unwrap_or(true)
    }
}
