//! Native process runner.
//!
//! Runs servers as plain OS processes. A pid file inside the server's
//! host directory lets a restarted starter re-adopt instances that
//! survived a crash of the starter itself.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tracing::debug;

use starter_core::errors::{Error, Result};
use starter_core::expect::{SpawnOptions, SubProcess};
use starter_core::process::{OutputSink, Process, ProcessType, Runner, Volume};

const PID_FILE_NAME: &str = "process.pid";

/// Runner that starts servers as native OS processes.
#[derive(Debug, Default)]
pub struct NativeRunner;

impl NativeRunner {
    /// Create a new native runner.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Runner for NativeRunner {
    async fn start(
        &self,
        _process_type: ProcessType,
        executable: &Path,
        args: &[String],
        _volumes: &[Volume],
        ports: &[u16],
        container_name: &str,
        host_dir: &Path,
        output: Option<OutputSink>,
    ) -> Result<Arc<dyn Process>> {
        debug!("Starting {} as {container_name}", executable.display());
        let (pid, inner) = if let Some(output) = output {
            // Output capture goes through the subprocess harness.
            let sub = SubProcess::spawn_with(
                executable,
                args,
                SpawnOptions {
                    tee: Some(output),
                    cwd: Some(host_dir.to_path_buf()),
                    ..Default::default()
                },
            )?;
            (sub.process_id(), Inner::Harness(sub))
        } else {
            let child = Command::new(executable)
                .args(args)
                .current_dir(host_dir)
                .stdin(Stdio::null())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit())
                .kill_on_drop(false)
                .spawn()?;
            let pid = child
                .id()
                .ok_or_else(|| Error::Transient("failed to get process ID".to_string()))?
                as i32;
            (pid, Inner::Child(tokio::sync::Mutex::new(child)))
        };

        // One-shot invocations are not recoverable, so they get no pid
        // file.
        let has_pid_file = !ports.is_empty();
        if has_pid_file {
            tokio::fs::write(host_dir.join(PID_FILE_NAME), pid.to_string()).await?;
        }

        Ok(Arc::new(NativeProcess {
            pid,
            host_dir: host_dir.to_path_buf(),
            has_pid_file,
            inner,
        }))
    }

    async fn get_running_server(&self, host_dir: &Path) -> Result<Option<Arc<dyn Process>>> {
        let pid_path = host_dir.join(PID_FILE_NAME);
        let content = match tokio::fs::read_to_string(&pid_path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let Ok(pid) = content.trim().parse::<i32>() else {
            let _ = tokio::fs::remove_file(&pid_path).await;
            return Ok(None);
        };
        match signal::kill(Pid::from_raw(pid), None) {
            Ok(()) => Ok(Some(Arc::new(NativeProcess {
                pid,
                host_dir: host_dir.to_path_buf(),
                has_pid_file: true,
                inner: Inner::Adopted,
            }))),
            Err(_) => {
                // Stale pid file.
                let _ = tokio::fs::remove_file(&pid_path).await;
                Ok(None)
            }
        }
    }

    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }
}

enum Inner {
    /// Spawned directly; output inherited.
    Child(tokio::sync::Mutex<tokio::process::Child>),
    /// Spawned through the subprocess harness for output capture.
    Harness(SubProcess),
    /// Recovered from a pid file after a starter restart.
    Adopted,
}

/// A native server process.
pub struct NativeProcess {
    pid: i32,
    host_dir: PathBuf,
    has_pid_file: bool,
    inner: Inner,
}

impl NativeProcess {
    fn signal(&self, sig: Signal) -> Result<()> {
        match signal::kill(Pid::from_raw(self.pid), sig) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(err) => Err(Error::Transient(format!(
                "failed to send {sig} to pid {}: {err}",
                self.pid
            ))),
        }
    }
}

#[async_trait]
impl Process for NativeProcess {
    fn process_id(&self) -> u32 {
        self.pid as u32
    }

    fn host_port(&self, internal_port: u16) -> Result<u16> {
        // Native processes listen directly on the host.
        Ok(internal_port)
    }

    async fn wait(&self) {
        match &self.inner {
            Inner::Child(child) => {
                let _ = child.lock().await.wait().await;
            }
            Inner::Harness(sub) => {
                let _ = sub.wait().await;
            }
            Inner::Adopted => {
                // No child handle to reap; poll for liveness instead.
                while signal::kill(Pid::from_raw(self.pid), None).is_ok() {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        }
    }

    fn terminate(&self) -> Result<()> {
        self.signal(Signal::SIGTERM)
    }

    fn kill(&self) -> Result<()> {
        self.signal(Signal::SIGKILL)
    }

    fn hup(&self) -> Result<()> {
        self.signal(Signal::SIGHUP)
    }

    async fn cleanup(&self) -> Result<()> {
        if self.has_pid_file {
            let _ = tokio::fs::remove_file(self.host_dir.join(PID_FILE_NAME)).await;
        }
        Ok(())
    }
}
