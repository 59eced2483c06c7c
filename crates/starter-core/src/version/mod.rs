//! Version probe.
//!
//! Runs the database executable once with `--version` and extracts the
//! reported server version from its output.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rand::Rng;

use crate::config::Config;
use crate::errors::{Error, Result};
use crate::process::{OutputSink, ProcessType, Runner};

const VERSION_CHECK_SUFFIX_LEN: usize = 6;

/// Returns the version of the database executable used by this starter.
///
/// Fails with [`Error::VersionNotFound`] when the output contains no
/// `server-version` line.
pub async fn database_version(runner: &Arc<dyn Runner>, config: &Config) -> Result<String> {
    let output: OutputSink = Arc::new(Mutex::new(Vec::new()));
    let container_name = format!("starter-versioncheck-{}", random_suffix());
    let p = runner
        .start(
            ProcessType::Database,
            &config.server_path,
            &["--version".to_string()],
            &[],
            &[],
            &container_name,
            Path::new("."),
            Some(Arc::clone(&output)),
        )
        .await?;
    p.wait().await;
    let _ = p.cleanup().await;

    let stdout = output
        .lock()
        .map(|buf| String::from_utf8_lossy(&buf).into_owned())
        .unwrap_or_default();
    parse_version_output(&stdout)
}

/// Find the first `server-version : <value>` line in `--version` output.
fn parse_version_output(stdout: &str) -> Result<String> {
    for line in stdout.lines() {
        let mut parts = line.splitn(2, ':');
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        if key.trim() != "server-version" {
            continue;
        }
        let version = value.trim().to_string();
        tracing::debug!("Found server version '{version}'");
        return Ok(version);
    }
    Err(Error::VersionNotFound(stdout.to_string()))
}

fn random_suffix() -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..VERSION_CHECK_SUFFIX_LEN)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}
