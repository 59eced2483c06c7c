//! Server typing and the process-runner contract.
//!
//! The supervisor is agnostic to whether a server runs natively or inside
//! a container; that decision belongs to the [`Runner`] implementation.
//! This module defines the capability contracts the supervisor consumes.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::Result;

/// Functional kind of a supervised server process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerType {
    /// Agency member.
    Agent,
    /// Data shard server.
    DBServer,
    /// Query coordinator.
    Coordinator,
    /// Stand-alone single server.
    Single,
    /// Single server with automatic failover.
    ResilientSingle,
    /// Datacenter synchronization master.
    SyncMaster,
    /// Datacenter synchronization worker.
    SyncWorker,
}

impl ServerType {
    /// Process family of this server type.
    #[must_use]
    pub const fn process_type(self) -> ProcessType {
        match self {
            Self::SyncMaster | Self::SyncWorker => ProcessType::Sync,
            _ => ProcessType::Database,
        }
    }

    /// Fixed port offset of this server type relative to the peer base.
    #[must_use]
    pub const fn port_offset(self) -> u16 {
        match self {
            Self::Coordinator | Self::Single | Self::ResilientSingle => 1,
            Self::DBServer => 2,
            Self::Agent => 3,
            Self::SyncMaster => 4,
            Self::SyncWorker => 5,
        }
    }

    /// Role/mode pair the server is expected to report once started.
    #[must_use]
    pub const fn expected_server_role(self) -> (&'static str, &'static str) {
        match self {
            Self::Agent => ("agent", ""),
            Self::DBServer => ("primary", ""),
            Self::Coordinator => ("coordinator", ""),
            Self::Single => ("single", ""),
            Self::ResilientSingle => ("single", "resilient"),
            Self::SyncMaster => ("master", ""),
            Self::SyncWorker => ("worker", ""),
        }
    }
}

impl std::fmt::Display for ServerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Agent => write!(f, "agent"),
            Self::DBServer => write!(f, "dbserver"),
            Self::Coordinator => write!(f, "coordinator"),
            Self::Single => write!(f, "single"),
            Self::ResilientSingle => write!(f, "resilientsingle"),
            Self::SyncMaster => write!(f, "syncmaster"),
            Self::SyncWorker => write!(f, "syncworker"),
        }
    }
}

/// Process family: the database server binary or the sync binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessType {
    /// Database server process.
    Database,
    /// Synchronization process.
    Sync,
}

impl ProcessType {
    /// Name of the command-trace file written next to the data directory.
    #[must_use]
    pub const fn command_file_name(self) -> &'static str {
        match self {
            Self::Database => "server_command.txt",
            Self::Sync => "sync_command.txt",
        }
    }

    /// Name of the log file the server writes inside its host directory.
    #[must_use]
    pub const fn log_file_name(self) -> &'static str {
        match self {
            Self::Database => "server.log",
            Self::Sync => "sync.log",
        }
    }
}

/// A host-to-container path mapping for a started server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    /// Path in the host namespace.
    pub host_path: PathBuf,
    /// Path in the container namespace.
    pub container_path: PathBuf,
    /// Whether the mapping is read-only.
    pub read_only: bool,
}

/// Append a volume mapping to the list.
#[must_use]
pub fn add_volume(
    mut volumes: Vec<Volume>,
    host_path: impl Into<PathBuf>,
    container_path: impl Into<PathBuf>,
    read_only: bool,
) -> Vec<Volume> {
    volumes.push(Volume {
        host_path: host_path.into(),
        container_path: container_path.into(),
        read_only,
    });
    volumes
}

/// Shared buffer a runner streams captured child output into.
pub type OutputSink = Arc<Mutex<Vec<u8>>>;

/// Handle to a started server process.
///
/// Created by [`Runner::start`], owned by the supervisor slot for its
/// role, destroyed via [`Process::cleanup`].
#[async_trait]
pub trait Process: Send + Sync {
    /// OS process ID.
    fn process_id(&self) -> u32;

    /// Container ID, empty when not container-backed.
    fn container_id(&self) -> String {
        String::new()
    }

    /// Container IP, empty when not container-backed.
    fn container_ip(&self) -> String {
        String::new()
    }

    /// Host port mapped to the given container-internal port.
    fn host_port(&self, internal_port: u16) -> Result<u16>;

    /// Block until the process exits.
    async fn wait(&self);

    /// Request graceful termination (SIGTERM).
    fn terminate(&self) -> Result<()>;

    /// Force termination (SIGKILL).
    fn kill(&self) -> Result<()>;

    /// Ask the process to reopen its log files (SIGHUP).
    fn hup(&self) -> Result<()>;

    /// Release all resources held for this process.
    async fn cleanup(&self) -> Result<()>;
}

/// Creates, locates and releases server processes.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Start a server process.
    #[allow(clippy::too_many_arguments)]
    async fn start(
        &self,
        process_type: ProcessType,
        executable: &Path,
        args: &[String],
        volumes: &[Volume],
        ports: &[u16],
        container_name: &str,
        host_dir: &Path,
        output: Option<OutputSink>,
    ) -> Result<Arc<dyn Process>>;

    /// Recover a previously started server instance for the given host
    /// directory, if one is still alive.
    async fn get_running_server(&self, host_dir: &Path) -> Result<Option<Arc<dyn Process>>>;

    /// Release runner-wide resources.
    async fn cleanup(&self) -> Result<()>;
}

/// Gracefully terminate a process, force-killing it when the deadline
/// elapses first.
pub async fn terminate_process(process: &dyn Process, name: &str, timeout: Duration) {
    tracing::debug!("Terminating {name}");
    if let Err(err) = process.terminate() {
        tracing::warn!("Failed to terminate {name}: {err}");
        return;
    }
    if tokio::time::timeout(timeout, process.wait()).await.is_err() {
        tracing::warn!("{name} did not terminate in time, killing it");
        if let Err(err) = process.kill() {
            tracing::warn!("Failed to kill {name}: {err}");
        }
    }
}

impl std::fmt::Debug for dyn Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("process_id", &self.process_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_offsets() {
        assert_eq!(ServerType::Coordinator.port_offset(), 1);
        assert_eq!(ServerType::Single.port_offset(), 1);
        assert_eq!(ServerType::ResilientSingle.port_offset(), 1);
        assert_eq!(ServerType::DBServer.port_offset(), 2);
        assert_eq!(ServerType::Agent.port_offset(), 3);
        assert_eq!(ServerType::SyncMaster.port_offset(), 4);
        assert_eq!(ServerType::SyncWorker.port_offset(), 5);
    }

    #[test]
    fn test_process_family() {
        assert_eq!(ServerType::Agent.process_type(), ProcessType::Database);
        assert_eq!(ServerType::SyncMaster.process_type(), ProcessType::Sync);
        assert_eq!(ServerType::SyncWorker.process_type(), ProcessType::Sync);
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(ServerType::ResilientSingle.to_string(), "resilientsingle");
        assert_eq!(
            serde_json::to_string(&ServerType::DBServer).unwrap(),
            "\"dbserver\""
        );
    }

    #[test]
    fn test_add_volume() {
        let vols = add_volume(Vec::new(), "/host/data", "/data", false);
        assert_eq!(vols.len(), 1);
        assert_eq!(vols[0].container_path, PathBuf::from("/data"));
        assert!(!vols[0].read_only);
    }
}
