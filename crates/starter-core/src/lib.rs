//! # starter-core
//!
//! Core library for the cluster starter — the per-peer supervisor that
//! bootstraps a distributed database deployment.
//!
//! Each peer running the starter launches and keeps alive a set of local
//! database processes (agent, dbserver, coordinator, single server and/or
//! synchronization processes), converges with sibling peers on a shared
//! cluster configuration, and serves operational APIs.
//!
//! ## Features
//!
//! - **Subprocess harness**: spawn a child, stream its output into a
//!   rolling buffer and match regular expressions against it with timeouts
//! - **Cluster model**: peers, derived endpoints, service modes
//! - **Supervision**: per-role start/monitor/restart with failure
//!   accounting, log rotation and ordered shutdown
//! - **Version probe**: one-shot `--version` invocation with output parsing
//!
//! ## Example
//!
//! ```rust,no_run
//! use starter_core::cluster::{ClusterConfig, Peer};
//!
//! let mut config = ClusterConfig::new(3, 8528);
//! config.add_or_update_peer(Peer::new("peer-1", "10.0.0.1", 8528, 0, "/data"));
//! assert_eq!(config.peer_endpoints().len(), 1);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cluster;
pub mod config;
pub mod context;
pub mod errors;
pub mod expect;
pub mod net;
pub mod process;
pub mod supervisor;
pub mod version;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::cluster::{ClusterConfig, Peer, ServiceMode};
    pub use crate::config::{BootstrapConfig, Config};
    pub use crate::context::ClusterContext;
    pub use crate::errors::Error;
    pub use crate::process::{Process, Runner, ServerType};
    pub use crate::supervisor::ServerManager;
}

/// Re-export commonly used types at the crate root.
pub use cluster::{ClusterConfig, Peer, ServiceMode};
pub use config::{BootstrapConfig, Config};
pub use errors::Error;
pub use process::{Process, Runner, ServerType};
pub use supervisor::ServerManager;
