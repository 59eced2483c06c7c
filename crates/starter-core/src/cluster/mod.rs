//! Cluster membership model.
//!
//! A deployment consists of several peers, each running the starter. The
//! [`ClusterConfig`] is the ordered set of peers plus derived endpoint
//! views; peers are keyed by their unique ID and mutated only through
//! hello/goodbye handling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::process::ServerType;

/// One starter instance participating in the deployment.
///
/// "Slave" is the historical wire name for a peer; the JSON field names
/// keep it for compatibility.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// Unique identifier of the peer.
    #[serde(rename = "ID")]
    pub id: String,

    /// Address used to reach the peer.
    #[serde(rename = "Address")]
    pub address: String,

    /// Base port of the peer's starter.
    #[serde(rename = "Port")]
    pub port: u16,

    /// Offset added to the base port to derive per-role ports.
    ///
    /// Peers sharing an address receive distinct offsets so their port
    /// ranges do not collide.
    #[serde(rename = "PortOffset")]
    pub port_offset: u16,

    /// Directory used for data by this peer.
    #[serde(rename = "DataDir", default)]
    pub data_dir: String,

    /// Whether this peer hosts an agent.
    #[serde(rename = "HasAgent")]
    pub has_agent_flag: bool,

    /// Whether this peer hosts a dbserver.
    #[serde(rename = "HasDBServer")]
    pub has_dbserver_flag: bool,

    /// Whether this peer hosts a coordinator.
    #[serde(rename = "HasCoordinator")]
    pub has_coordinator_flag: bool,

    /// Whether this peer hosts a resilient single server.
    #[serde(rename = "HasResilientSingle", default)]
    pub has_resilient_single_flag: bool,

    /// Whether servers started by this peer use TLS.
    #[serde(rename = "IsSecure")]
    pub is_secure: bool,
}

impl Peer {
    /// Create a new peer hosting all default roles.
    pub fn new(
        id: impl Into<String>,
        address: impl Into<String>,
        port: u16,
        port_offset: u16,
        data_dir: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            port,
            port_offset,
            data_dir: data_dir.into(),
            has_agent_flag: true,
            has_dbserver_flag: true,
            has_coordinator_flag: true,
            has_resilient_single_flag: false,
            is_secure: false,
        }
    }

    /// Returns whether this peer hosts an agent.
    #[must_use]
    pub const fn has_agent(&self) -> bool {
        self.has_agent_flag
    }

    /// Returns whether this peer hosts a dbserver.
    #[must_use]
    pub const fn has_dbserver(&self) -> bool {
        self.has_dbserver_flag
    }

    /// Returns whether this peer hosts a coordinator.
    #[must_use]
    pub const fn has_coordinator(&self) -> bool {
        self.has_coordinator_flag
    }

    /// Returns whether this peer hosts a resilient single server.
    #[must_use]
    pub const fn has_resilient_single(&self) -> bool {
        self.has_resilient_single_flag
    }

    /// Port on which this peer's server of the given type listens.
    #[must_use]
    pub fn server_port(&self, server_type: ServerType) -> u16 {
        self.port + self.port_offset + server_type.port_offset()
    }

    /// Absolute URL of this peer's starter.
    #[must_use]
    pub fn starter_url(&self) -> String {
        let schemes = UrlSchemes::new(self.is_secure);
        format!(
            "{}://{}:{}",
            schemes.browser,
            self.address,
            self.port + self.port_offset
        )
    }

    /// Absolute URL of this peer's server of the given type.
    #[must_use]
    pub fn server_url(&self, server_type: ServerType) -> String {
        let schemes = UrlSchemes::new(self.is_secure);
        format!(
            "{}://{}:{}",
            schemes.browser,
            self.address,
            self.server_port(server_type)
        )
    }
}

/// The full cluster configuration: an ordered set of peers.
///
/// Invariant: at most one peer per ID. The derived endpoint views always
/// reflect the current peer set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// All peers, in join order.
    #[serde(rename = "Peers", default)]
    pub peers: Vec<Peer>,

    /// Number of agents the deployment should run.
    #[serde(rename = "AgencySize")]
    pub agency_size: usize,

    /// Base port new peers default to.
    #[serde(rename = "BasePort", default = "default_base_port")]
    pub base_port: u16,

    /// Time of the last membership change.
    #[serde(rename = "LastModified", skip_serializing_if = "Option::is_none", default)]
    pub last_modified: Option<DateTime<Utc>>,
}

/// Default base port for starters.
pub const DEFAULT_BASE_PORT: u16 = 8528;

const fn default_base_port() -> u16 {
    DEFAULT_BASE_PORT
}

impl ClusterConfig {
    /// Create an empty configuration with the given agency size.
    #[must_use]
    pub const fn new(agency_size: usize, base_port: u16) -> Self {
        Self {
            peers: Vec::new(),
            agency_size,
            base_port,
            last_modified: None,
        }
    }

    /// Look up a peer by ID.
    #[must_use]
    pub fn peer_by_id(&self, id: &str) -> Option<&Peer> {
        self.peers.iter().find(|p| p.id == id)
    }

    /// Insert a peer, replacing any existing peer with the same ID.
    ///
    /// `last_modified` only moves when the peer set actually changes, so
    /// repeated identical updates keep the configuration byte-stable.
    pub fn add_or_update_peer(&mut self, peer: Peer) {
        if let Some(existing) = self.peers.iter_mut().find(|p| p.id == peer.id) {
            if *existing != peer {
                *existing = peer;
                self.last_modified = Some(Utc::now());
            }
        } else {
            self.peers.push(peer);
            self.last_modified = Some(Utc::now());
        }
    }

    /// Remove the peer with the given ID. Returns whether it was present.
    pub fn remove_peer_by_id(&mut self, id: &str) -> bool {
        let before = self.peers.len();
        self.peers.retain(|p| p.id != id);
        let removed = self.peers.len() != before;
        if removed {
            self.last_modified = Some(Utc::now());
        }
        removed
    }

    /// Number of peers currently hosting an agent.
    #[must_use]
    pub fn agent_count(&self) -> usize {
        self.peers.iter().filter(|p| p.has_agent()).count()
    }

    /// URLs of all starters in the cluster.
    #[must_use]
    pub fn peer_endpoints(&self) -> Vec<String> {
        self.peers.iter().map(Peer::starter_url).collect()
    }

    /// URLs of all agents in the cluster.
    #[must_use]
    pub fn agent_endpoints(&self) -> Vec<String> {
        self.peers
            .iter()
            .filter(|p| p.has_agent())
            .map(|p| p.server_url(ServerType::Agent))
            .collect()
    }

    /// URLs of all coordinators in the cluster.
    #[must_use]
    pub fn coordinator_endpoints(&self) -> Vec<String> {
        self.peers
            .iter()
            .filter(|p| p.has_coordinator())
            .map(|p| p.server_url(ServerType::Coordinator))
            .collect()
    }

    /// Returns `true` if all peers use TLS.
    #[must_use]
    pub fn is_secure(&self) -> bool {
        !self.peers.is_empty() && self.peers.iter().all(|p| p.is_secure)
    }
}

/// Operating mode of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceMode {
    /// One stand-alone server.
    Single,
    /// Agency plus resilient single servers with automatic failover.
    ActiveFailover,
    /// Full cluster: agents, dbservers, coordinators.
    Cluster,
}

impl ServiceMode {
    /// Returns `true` for single mode.
    #[must_use]
    pub const fn is_single_mode(self) -> bool {
        matches!(self, Self::Single)
    }

    /// Returns `true` for active-failover mode.
    #[must_use]
    pub const fn is_active_failover_mode(self) -> bool {
        matches!(self, Self::ActiveFailover)
    }

    /// Returns `true` for cluster mode.
    #[must_use]
    pub const fn is_cluster_mode(self) -> bool {
        matches!(self, Self::Cluster)
    }
}

impl std::fmt::Display for ServiceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Single => write!(f, "single"),
            Self::ActiveFailover => write!(f, "activefailover"),
            Self::Cluster => write!(f, "cluster"),
        }
    }
}

impl std::str::FromStr for ServiceMode {
    type Err = crate::errors::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "single" => Ok(Self::Single),
            "activefailover" => Ok(Self::ActiveFailover),
            "cluster" => Ok(Self::Cluster),
            other => Err(crate::errors::Error::BadRequest(format!(
                "unknown service mode '{other}'"
            ))),
        }
    }
}

/// URL schemes for user-facing endpoint banners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UrlSchemes {
    /// Scheme for browser access.
    pub browser: &'static str,
    /// Scheme for shell (`dbsh`) endpoints.
    pub shell: &'static str,
}

impl UrlSchemes {
    /// Pick schemes based on whether the deployment uses TLS.
    #[must_use]
    pub const fn new(is_secure: bool) -> Self {
        if is_secure {
            Self {
                browser: "https",
                shell: "ssl",
            }
        } else {
            Self {
                browser: "http",
                shell: "tcp",
            }
        }
    }
}
