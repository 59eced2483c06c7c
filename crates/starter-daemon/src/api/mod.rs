//! Peer-to-peer and operational HTTP API.
//!
//! Peers join and leave through `/hello` and `/goodbye`; operators use
//! the remaining endpoints for identity, process listing, endpoint
//! discovery, log fetching and shutdown. The agency calls back on
//! `/cb/masterChanged` when its leader changes.

pub mod error;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, get, post};
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::io::ReaderStream;
use tower::{Service, ServiceExt};
use tracing::{debug, info, warn};

use starter_core::cluster::ClusterConfig;
use starter_core::context::{ClusterContext, GoodbyeRequest, HelloRequest};
use starter_core::errors::Error;
use starter_core::net::{get_url_with_path, normalize_host_name};
use starter_core::process::ServerType;
use starter_core::supervisor::ServerManager;
use starter_core::Config;

pub use self::error::{ApiError, ErrorResponse};
use self::error::error_response;

/// Identity of this starter, as served on `/id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdInfo {
    /// Unique ID of this starter.
    #[serde(rename = "ID")]
    pub id: String,
}

/// Version information, as served on `/version`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    /// Starter version.
    #[serde(rename = "Version")]
    pub version: String,
    /// Starter build.
    #[serde(rename = "Build")]
    pub build: String,
}

/// One supervised server process, as reported on `/process`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerProcess {
    /// Server role.
    #[serde(rename = "Type")]
    pub server_type: ServerType,
    /// Address the server listens on.
    #[serde(rename = "IP")]
    pub ip: String,
    /// Port the server listens on.
    #[serde(rename = "Port")]
    pub port: u16,
    /// OS process ID.
    #[serde(rename = "ProcessID")]
    pub process_id: u32,
    /// Container ID, empty for native processes.
    #[serde(rename = "ContainerID", default)]
    pub container_id: String,
    /// Container IP, empty for native processes.
    #[serde(rename = "ContainerIP", default)]
    pub container_ip: String,
    /// Whether the server uses TLS.
    #[serde(rename = "IsSecure")]
    pub is_secure: bool,
}

/// Response of `/process`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessList {
    /// All live server processes.
    #[serde(rename = "Servers", default)]
    pub servers: Vec<ServerProcess>,
    /// Whether every expected server has started.
    #[serde(rename = "ServersStarted")]
    pub servers_started: bool,
}

/// Response of `/endpoints`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointList {
    /// URLs of all starters.
    #[serde(rename = "Starters", default)]
    pub starters: Vec<String>,
    /// URLs of all agents.
    #[serde(rename = "Agents", default)]
    pub agents: Vec<String>,
    /// URLs of all coordinators.
    #[serde(rename = "Coordinators", default)]
    pub coordinators: Vec<String>,
}

/// Shared state of the HTTP server.
pub struct ApiState {
    context: Arc<dyn ClusterContext>,
    manager: Arc<ServerManager>,
    id_info: IdInfo,
    version_info: VersionInfo,
    master_port: u16,
}

/// The peer HTTP server.
pub struct PeerServer {
    state: Arc<ApiState>,
}

impl PeerServer {
    /// Create the server around the given context and server manager.
    #[must_use]
    pub fn new(
        context: Arc<dyn ClusterContext>,
        manager: Arc<ServerManager>,
        config: &Config,
        server_id: impl Into<String>,
    ) -> Self {
        Self {
            state: Arc::new(ApiState {
                context,
                manager,
                id_info: IdInfo {
                    id: server_id.into(),
                },
                version_info: VersionInfo {
                    version: config.project_version.clone(),
                    build: config.project_build.clone(),
                },
                master_port: config.master_port,
            }),
        }
    }

    /// Build the router for all endpoints.
    #[must_use]
    pub fn router(&self) -> Router {
        Router::new()
            // Starter to starter API
            .route("/hello", get(hello_get).post(hello_post))
            .route("/goodbye", post(goodbye))
            // External API
            .route("/id", any(id_handler))
            .route("/process", any(process_list))
            .route("/endpoints", any(endpoints))
            .route("/logs/agent", any(agent_logs))
            .route("/logs/dbserver", any(dbserver_logs))
            .route("/logs/coordinator", any(coordinator_logs))
            .route("/logs/single", any(single_logs))
            .route("/version", any(version))
            .route("/shutdown", post(shutdown))
            // Agency callback
            .route("/cb/masterChanged", post(cb_master_changed))
            .with_state(Arc::clone(&self.state))
    }

    /// Start listening for requests on the container-namespace address.
    ///
    /// Returns directly after starting; the accept loop runs until the
    /// process exits. TLS is enabled iff a TLS configuration is supplied.
    pub async fn start(
        &self,
        host_addr: &str,
        container_addr: &str,
        tls_config: Option<Arc<rustls::ServerConfig>>,
    ) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind(container_addr).await?;
        let local_addr = listener.local_addr()?;
        if tls_config.is_some() {
            info!("Listening on {container_addr} ({host_addr}) using TLS");
        } else {
            info!("Listening on {container_addr} ({host_addr})");
        }

        let acceptor = tls_config.map(TlsAcceptor::from);
        let mut make_service = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();
        tokio::spawn(async move {
            loop {
                let (stream, remote_addr) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(err) => {
                        warn!("Failed to accept connection: {err}");
                        continue;
                    }
                };
                let tower_service = match make_service.call(remote_addr).await {
                    Ok(service) => service,
                    Err(never) => match never {},
                };
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    let hyper_service = hyper::service::service_fn(
                        move |request: hyper::Request<hyper::body::Incoming>| {
                            tower_service.clone().oneshot(request)
                        },
                    );
                    let builder =
                        hyper_util::server::conn::auto::Builder::new(TokioExecutor::new());
                    let served: Result<(), Box<dyn std::error::Error + Send + Sync>> =
                        match acceptor {
                            Some(acceptor) => match acceptor.accept(stream).await {
                                Ok(tls_stream) => builder
                                    .serve_connection_with_upgrades(
                                        TokioIo::new(tls_stream),
                                        hyper_service,
                                    )
                                    .await,
                                Err(err) => {
                                    debug!("TLS handshake with {remote_addr} failed: {err}");
                                    return;
                                }
                            },
                            None => {
                                builder
                                    .serve_connection_with_upgrades(
                                        TokioIo::new(stream),
                                        hyper_service,
                                    )
                                    .await
                            }
                        };
                    if let Err(err) = served {
                        debug!("Failed to serve connection from {remote_addr}: {err}");
                    }
                });
            }
        });
        Ok(local_addr)
    }
}

/// Derive this peer's own address from the request's Host header.
fn derive_own_address(headers: &HeaderMap) -> Result<String, ApiError> {
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            ApiError::bad_request("Cannot derive own host address: missing Host header")
        })?;
    Ok(normalize_host_name(split_host(host)))
}

/// Strip the port from a `host:port` pair, tolerating bare hosts and
/// bracketed IPv6 addresses.
fn split_host(host_port: &str) -> &str {
    if let Some(end) = host_port.rfind(']') {
        return &host_port[..=end];
    }
    match host_port.rsplit_once(':') {
        Some((host, _)) => host,
        None => host_port,
    }
}

fn parse_update_flag(query: &HashMap<String, String>) -> bool {
    query
        .get("update")
        .and_then(|v| v.parse::<bool>().ok())
        .unwrap_or(false)
}

async fn hello_get(
    State(state): State<Arc<ApiState>>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Json<ClusterConfig>, ApiError> {
    debug!("Received GET /hello request from {remote_addr}");
    let own_address = derive_own_address(&headers)?;
    let is_update = parse_update_flag(&query);
    let result = state.context.handle_hello(
        &own_address,
        &remote_addr.to_string(),
        None,
        is_update,
    )?;
    Ok(Json(result))
}

async fn hello_post(
    State(state): State<Arc<ApiState>>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ClusterConfig>, ApiError> {
    debug!("Received POST /hello request from {remote_addr}");
    let own_address = derive_own_address(&headers)?;
    let req: HelloRequest = serde_json::from_slice(&body)
        .map_err(|err| ApiError::bad_request(format!("Cannot parse request body: {err}")))?;
    let result =
        state
            .context
            .handle_hello(&own_address, &remote_addr.to_string(), Some(&req), false)?;
    Ok(Json(result))
}

async fn goodbye(State(state): State<Arc<ApiState>>, body: Bytes) -> Response {
    let req: GoodbyeRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(err) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                &format!("Cannot parse request body: {err}"),
            );
        }
    };
    if req.slave_id.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "SlaveID must be set.");
    }

    info!("Goodbye requested for peer {}", req.slave_id);
    match state.context.handle_goodbye(&req.slave_id) {
        Err(err) => ApiError(err).into_response(),
        Ok(false) => error_response(StatusCode::NOT_FOUND, "Unknown ID"),
        Ok(true) => (StatusCode::OK, "BYE").into_response(),
    }
}

async fn id_handler(State(state): State<Arc<ApiState>>) -> Json<IdInfo> {
    Json(state.id_info.clone())
}

async fn version(State(state): State<Arc<ApiState>>) -> Json<VersionInfo> {
    Json(state.version_info.clone())
}

async fn process_list(State(state): State<Arc<ApiState>>) -> Json<ProcessList> {
    let (cluster_config, my_peer, mode) = state.context.cluster_config();
    let is_secure = cluster_config.is_secure();

    let mut resp = ProcessList::default();
    let mut expected_servers = 0;
    if let Some(my_peer) = my_peer {
        expected_servers += usize::from(my_peer.has_agent());
        expected_servers += usize::from(my_peer.has_dbserver());
        expected_servers += usize::from(my_peer.has_coordinator());

        for (server_type, p) in state.manager.server_processes() {
            resp.servers.push(ServerProcess {
                server_type,
                ip: my_peer.address.clone(),
                port: state.master_port + my_peer.port_offset + server_type.port_offset(),
                process_id: p.process_id(),
                container_id: p.container_id(),
                container_ip: p.container_ip(),
                is_secure,
            });
        }
    }
    if mode.is_single_mode() {
        expected_servers = 1;
    }
    resp.servers_started = resp.servers.len() == expected_servers;
    Json(resp)
}

async fn endpoints(State(state): State<Arc<ApiState>>) -> Result<Json<EndpointList>, ApiError> {
    let master = state.context.is_running_master();
    if master.is_running && !master.is_running_master {
        // Not the master; point the caller at it.
        if master.master_url.is_empty() {
            return Err(ApiError(Error::ServiceUnavailable(
                "No runtime master known".to_string(),
            )));
        }
        let location = get_url_with_path(&master.master_url, "/endpoints")?;
        return Err(ApiError(Error::Redirect(location)));
    }

    let (cluster_config, _, _) = state.context.cluster_config();
    let mut resp = EndpointList {
        starters: cluster_config.peer_endpoints(),
        ..Default::default()
    };
    if master.is_running {
        resp.agents = cluster_config.agent_endpoints();
        resp.coordinators = cluster_config.coordinator_endpoints();
    }
    Ok(Json(resp))
}

async fn agent_logs(State(state): State<Arc<ApiState>>) -> Response {
    let (_, my_peer, _) = state.context.cluster_config();
    if my_peer.is_some_and(|p| p.has_agent()) {
        logs_response(&state, ServerType::Agent).await
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

async fn dbserver_logs(State(state): State<Arc<ApiState>>) -> Response {
    let (_, my_peer, _) = state.context.cluster_config();
    if my_peer.is_some_and(|p| p.has_dbserver()) {
        logs_response(&state, ServerType::DBServer).await
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

async fn coordinator_logs(State(state): State<Arc<ApiState>>) -> Response {
    let (_, my_peer, _) = state.context.cluster_config();
    if my_peer.is_some_and(|p| p.has_coordinator()) {
        logs_response(&state, ServerType::Coordinator).await
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

async fn single_logs(State(state): State<Arc<ApiState>>) -> Response {
    logs_response(&state, ServerType::Single).await
}

/// Stream the entire log of the given server.
async fn logs_response(state: &Arc<ApiState>, server_type: ServerType) -> Response {
    let Ok(my_host_dir) = state.context.server_host_dir(server_type) else {
        // Not ready yet.
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };
    let log_path = my_host_dir.join(server_type.process_type().log_file_name());
    debug!("Fetching logs in {}", log_path.display());
    match tokio::fs::File::open(&log_path).await {
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            // Log file not there (yet), we allow this.
            StatusCode::OK.into_response()
        }
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
        Ok(file) => Body::from_stream(ReaderStream::new(file)).into_response(),
    }
}

async fn shutdown(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Response, ApiError> {
    if query.get("mode").map(String::as_str) == Some("goodbye") {
        // Inform the master we're leaving for good.
        state.context.send_master_leave_cluster().await?;
    }
    state.context.stop();
    Ok((StatusCode::OK, "OK").into_response())
}

async fn cb_master_changed(
    State(state): State<Arc<ApiState>>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
) -> Response {
    debug!("Master changed callback from {remote_addr}");
    state.context.master_changed_callback();
    (StatusCode::OK, "OK").into_response()
}
