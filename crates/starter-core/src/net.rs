//! Small networking helpers shared by the supervisor and the HTTP layer.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::TcpListener;

use crate::errors::{Error, Result};

/// Poll until the given port can be bound, or the timeout expires.
///
/// An empty address means all interfaces. Returns `true` when the port
/// became available within the timeout.
pub async fn wait_until_port_available(address: &str, port: u16, timeout: Duration) -> bool {
    let ip: IpAddr = address
        .parse()
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    let addr = SocketAddr::new(ip, port);
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                drop(listener);
                return true;
            }
            Err(_) => {
                if tokio::time::Instant::now() >= deadline {
                    return false;
                }
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
        }
    }
}

/// Normalize a host name for comparison and URL building.
///
/// Lowercases the name and strips IPv6 brackets.
#[must_use]
pub fn normalize_host_name(host: &str) -> String {
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .to_lowercase()
}

/// Build an absolute URL from a base URL and a path.
pub fn get_url_with_path(base: &str, path: &str) -> Result<String> {
    if base.is_empty() {
        return Err(Error::BadRequest("empty base URL".to_string()));
    }
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    Ok(format!("{base}/{path}"))
}
