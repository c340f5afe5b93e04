//! Ephemeral backend process lifecycle
//!
//! A `BackendProcess` owns exactly one child. It moves through
//! `Created -> Starting -> AwaitingReady -> Ready -> InFlight -> Stopping -> Stopped`
//! and `shutdown` can be entered from any state. Shutdown is idempotent, and
//! dropping the handle kills the child as a last resort.

use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::error::{Result, SubboxError};

/// Dial timeout for a single readiness check
const READY_DIAL_TIMEOUT: Duration = Duration::from_millis(200);
/// Pause between readiness checks
const READY_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// How long to wait for the child after each stop signal
const STOP_GRACE: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Created,
    Starting,
    AwaitingReady,
    Ready,
    InFlight,
    Stopping,
    Stopped,
}

/// One short-lived backend instance serving a single health probe
pub struct BackendProcess {
    program: PathBuf,
    args: Vec<String>,
    child: Option<Child>,
    state: ProcessState,
}

impl BackendProcess {
    /// Prepare a `<binary> run -c <config>` invocation without starting it
    pub fn new(binary: &Path, config_path: &Path) -> Self {
        Self::with_args(
            binary,
            vec![
                "run".to_string(),
                "-c".to_string(),
                config_path.to_string_lossy().into_owned(),
            ],
        )
    }

    pub fn with_args(program: &Path, args: Vec<String>) -> Self {
        Self {
            program: program.to_path_buf(),
            args,
            child: None,
            state: ProcessState::Created,
        }
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Spawn the child with its output discarded
    pub fn start(&mut self) -> Result<()> {
        if self.state != ProcessState::Created {
            return Err(SubboxError::BackendExited(format!(
                "cannot start from state {:?}",
                self.state
            )));
        }

        self.state = ProcessState::Starting;
        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn();

        match child {
            Ok(child) => {
                debug!(pid = child.id(), "Spawned {}", self.program.display());
                self.child = Some(child);
                Ok(())
            }
            Err(e) => {
                self.state = ProcessState::Stopped;
                Err(e.into())
            }
        }
    }

    /// Wait until `addr` accepts TCP connections
    ///
    /// Races the readiness poll against the child exiting early; whichever
    /// happens first (or `start_timeout`) decides the result.
    pub async fn wait_ready(&mut self, addr: SocketAddr, start_timeout: Duration) -> Result<()> {
        let Some(child) = self.child.as_mut() else {
            return Err(SubboxError::BackendExited("process was never started".into()));
        };
        self.state = ProcessState::AwaitingReady;

        let poll = async {
            loop {
                if let Ok(Ok(_)) = timeout(READY_DIAL_TIMEOUT, TcpStream::connect(addr)).await {
                    return;
                }
                sleep(READY_POLL_INTERVAL).await;
            }
        };

        tokio::select! {
            status = child.wait() => {
                let reason = match status {
                    Ok(status) => describe_exit(status),
                    Err(e) => e.to_string(),
                };
                Err(SubboxError::BackendExited(reason))
            }
            _ = poll => {
                self.state = ProcessState::Ready;
                Ok(())
            }
            _ = sleep(start_timeout) => Err(SubboxError::ReadinessTimeout),
        }
    }

    /// Mark the instance as carrying a health request
    pub fn begin_request(&mut self) {
        if self.state == ProcessState::Ready {
            self.state = ProcessState::InFlight;
        }
    }

    /// Stop the child: interrupt, wait, force-kill, wait
    ///
    /// Safe to call from any state and more than once.
    pub async fn shutdown(&mut self) {
        if self.state == ProcessState::Stopped {
            return;
        }
        self.state = ProcessState::Stopping;

        if let Some(mut child) = self.child.take() {
            interrupt(&child);
            if timeout(STOP_GRACE, child.wait()).await.is_err() {
                debug!("Backend ignored interrupt, killing");
                if let Err(e) = child.start_kill() {
                    warn!("Failed to kill backend: {}", e);
                }
                if timeout(STOP_GRACE, child.wait()).await.is_err() {
                    warn!("Backend did not exit after kill");
                }
            }
        }

        self.state = ProcessState::Stopped;
    }
}

#[cfg(unix)]
fn interrupt(child: &Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    // `id` is None once the child has been reaped.
    if let Some(pid) = child.id() {
        #[allow(clippy::cast_possible_wrap)]
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGINT);
    }
}

#[cfg(not(unix))]
fn interrupt(_child: &Child) {}

fn describe_exit(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit status {}", code),
        None => "terminated by signal".to_string(),
    }
}

/// Resolve an executable name the way a shell would
///
/// Names containing a path separator are checked directly; bare names are
/// searched for in `PATH`.
pub fn locate_executable(name: &str) -> Option<PathBuf> {
    let name = name.trim();
    if name.is_empty() {
        return None;
    }

    let candidate = Path::new(name);
    if candidate.components().count() > 1 {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }

    let path = env::var_os("PATH")?;
    env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|full| is_executable(full))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
