//! Subprocess harness with output expectations.
//!
//! Spawns a child process, continuously drains its stdout and stderr into
//! a shared rolling buffer, and matches caller-supplied regular
//! expressions against that buffer with timeouts. Used to detect server
//! readiness and to run one-shot `--version` invocations.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use regex::bytes::Regex;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::errors::{Error, Result};
use crate::process::OutputSink;

/// Serializes multi-line diagnostic writes so interleaved dumps from
/// concurrent expectations remain readable.
static DIAGNOSTIC_MUTEX: Mutex<()> = Mutex::new(());

/// Sink for expectation-timeout diagnostics.
///
/// Writes are serialized by a process-wide mutex; implementations only
/// need to put the bytes somewhere.
pub trait DiagnosticSink: Send + Sync {
    /// Write one diagnostic blob.
    fn write_all(&self, data: &[u8]);
}

/// Default sink: standard error.
#[derive(Debug, Default)]
pub struct StderrSink;

impl DiagnosticSink for StderrSink {
    fn write_all(&self, data: &[u8]) {
        use std::io::Write;
        let _ = std::io::stderr().write_all(data);
    }
}

/// Options for spawning a [`SubProcess`].
pub struct SpawnOptions {
    /// Sink receiving timeout diagnostics. Defaults to stderr.
    pub diagnostic_sink: Arc<dyn DiagnosticSink>,
    /// Optional buffer that receives a copy of all drained output.
    pub tee: Option<OutputSink>,
    /// Working directory; inherited when unset.
    pub cwd: Option<PathBuf>,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            diagnostic_sink: Arc::new(StderrSink),
            tee: None,
            cwd: None,
        }
    }
}

/// Buffer plus expectation map, guarded by a single mutex.
///
/// Invariant: when a regex matches at `[a, b)`, the buffer is advanced
/// past `b` and the completion signal fires exactly once; the entry is
/// removed.
struct ExpectState {
    output: Vec<u8>,
    expressions: HashMap<String, (Regex, oneshot::Sender<()>)>,
}

impl ExpectState {
    fn match_expressions(&mut self) {
        loop {
            let mut hit: Option<(String, usize)> = None;
            for (pattern, (re, _)) in &self.expressions {
                if let Some(m) = re.find(&self.output) {
                    hit = Some((pattern.clone(), m.end()));
                    break;
                }
            }
            let Some((pattern, end)) = hit else {
                return;
            };
            // Discard everything until the end of the match.
            self.output.drain(..end);
            if let Some((_, found)) = self.expressions.remove(&pattern) {
                let _ = found.send(());
            }
        }
    }
}

/// A child process whose combined output can be matched with regular
/// expressions.
pub struct SubProcess {
    child: tokio::sync::Mutex<Child>,
    pid: i32,
    stdin: Mutex<Option<ChildStdin>>,
    state: Arc<Mutex<ExpectState>>,
    sink: Arc<dyn DiagnosticSink>,
}

impl SubProcess {
    /// Spawn a new process with the given name and arguments.
    pub fn spawn(program: impl AsRef<OsStr>, args: &[String]) -> Result<Self> {
        Self::spawn_with(program, args, SpawnOptions::default())
    }

    /// Spawn a new process with explicit options.
    pub fn spawn_with(
        program: impl AsRef<OsStr>,
        args: &[String],
        options: SpawnOptions,
    ) -> Result<Self> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
        if let Some(cwd) = &options.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| Error::Transient("failed to get process ID".to_string()))?;

        let state = Arc::new(Mutex::new(ExpectState {
            output: Vec::new(),
            expressions: HashMap::new(),
        }));

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdin = child.stdin.take();
        if let Some(stdout) = stdout {
            Self::slurp(stdout, Arc::clone(&state), options.tee.clone());
        }
        if let Some(stderr) = stderr {
            Self::slurp(stderr, Arc::clone(&state), options.tee);
        }

        Ok(Self {
            child: tokio::sync::Mutex::new(child),
            pid: pid as i32,
            stdin: Mutex::new(stdin),
            state,
            sink: options.diagnostic_sink,
        })
    }

    /// Drain one pipe into the shared buffer in chunks of at most 512
    /// bytes, re-evaluating all registered expressions after each chunk.
    fn slurp(
        mut pipe: impl AsyncReadExt + Unpin + Send + 'static,
        state: Arc<Mutex<ExpectState>>,
        tee: Option<OutputSink>,
    ) {
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            loop {
                match pipe.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => {
                        if let Some(tee) = &tee {
                            if let Ok(mut sink) = tee.lock() {
                                sink.extend_from_slice(&buf[..n]);
                            }
                        }
                        if let Ok(mut state) = state.lock() {
                            state.output.extend_from_slice(&buf[..n]);
                            state.match_expressions();
                        }
                    }
                }
            }
        });
    }

    /// OS process ID of the child.
    #[must_use]
    pub const fn process_id(&self) -> i32 {
        self.pid
    }

    /// Take the writable stdin stream of the child.
    pub fn take_stdin(&self) -> Option<ChildStdin> {
        self.stdin.lock().ok().and_then(|mut s| s.take())
    }

    /// Wait for the output of the process to match the given expression,
    /// or until a timeout occurs.
    ///
    /// On a match the process output is discarded until the end of the
    /// match and `Ok(())` is returned. Cancellation of the given token
    /// also returns `Ok(())`. On timeout, the pending output is dumped to
    /// the diagnostic sink and [`Error::ExpectTimeout`] is returned.
    ///
    /// Concurrent calls with distinct expressions are allowed; each is
    /// released independently.
    pub async fn expect_timeout(
        &self,
        cancel: &CancellationToken,
        timeout: Duration,
        expression: Regex,
        label: &str,
    ) -> Result<()> {
        let pattern = expression.as_str().to_string();
        let (found_tx, found_rx) = oneshot::channel();
        {
            let mut state = self
                .state
                .lock()
                .map_err(|_| Error::Transient("expectation state poisoned".to_string()))?;
            state.expressions.insert(pattern.clone(), (expression, found_tx));
            // A previous chunk may already satisfy the expression.
            state.match_expressions();
        }

        tokio::select! {
            () = cancel.cancelled() => Ok(()),
            _ = found_rx => Ok(()),
            () = tokio::time::sleep(timeout) => {
                let output = self
                    .state
                    .lock()
                    .map(|state| state.output.clone())
                    .unwrap_or_default();
                {
                    let _guard = DIAGNOSTIC_MUTEX.lock();
                    let header =
                        format!("Timeout while waiting for '{pattern}' in {label}\nOutput so far:\n");
                    self.sink.write_all(header.as_bytes());
                    self.sink.write_all(&output);
                }
                Err(Error::ExpectTimeout { pattern, label: label.to_string() })
            }
        }
    }

    /// Wait for the process to terminate.
    pub async fn wait(&self) -> Result<ExitStatus> {
        let mut child = self.child.lock().await;
        Ok(child.wait().await?)
    }

    /// Wait for the process to terminate; a watchdog terminates it when
    /// the given timeout elapses first.
    pub async fn wait_timeout(&self, timeout: Duration) -> Result<ExitStatus> {
        let done = CancellationToken::new();
        let watchdog_done = done.clone();
        let pid = self.pid;
        let watchdog = tokio::spawn(async move {
            tokio::select! {
                () = watchdog_done.cancelled() => {}
                () = tokio::time::sleep(timeout) => {
                    let _ = signal::kill(Pid::from_raw(pid), Signal::SIGTERM);
                }
            }
        });
        let status = self.wait().await;
        done.cancel();
        let _ = watchdog.await;
        status
    }

    /// Terminate the process (SIGTERM) and wait for it to exit.
    pub async fn close(&self) -> Result<()> {
        self.signal(Signal::SIGTERM)?;
        let _ = self.wait().await;
        Ok(())
    }

    /// Terminate the process the hard way (SIGKILL) and wait.
    pub async fn kill(&self) -> Result<()> {
        self.signal(Signal::SIGKILL)?;
        let _ = self.wait().await;
        Ok(())
    }

    /// Send a SIGINT to the process without waiting.
    pub fn send_intr(&self) -> Result<()> {
        self.signal(Signal::SIGINT)
    }

    /// Send a SIGHUP to the process without waiting.
    pub fn send_hup(&self) -> Result<()> {
        self.signal(Signal::SIGHUP)
    }

    fn signal(&self, sig: Signal) -> Result<()> {
        match signal::kill(Pid::from_raw(self.pid), sig) {
            // Already reaped processes are fine.
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(err) => Err(Error::Transient(format!(
                "failed to send {sig} to pid {}: {err}",
                self.pid
            ))),
        }
    }
}
