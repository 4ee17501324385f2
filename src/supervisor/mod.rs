//! Process supervision for the external VPN binary
//!
//! Lifecycle per profile:
//!
//! ```text
//! NotRunning -> Starting -> Running -> Stopping -> NotRunning
//! ```
//!
//! Nothing is cached in memory: every query re-reads the state directory.
//! A start is acknowledged by a liveness check after a fixed delay, not
//! by any readiness signal from the child.

mod state;

pub use state::{pid_alive, ProcessState, PID_FILE, STDERR_FILE, STDOUT_FILE};

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::context::{ManagerContext, Notification};
use crate::error::{ManagerError, ProcessError};
use crate::profile::{self, Profile, PROCESS_DIR};
use crate::runtime;

/// Environment variable carrying the network token
pub const TOKEN_ENV: &str = "EDGEVPNTOKEN";

/// Interval between liveness polls while stopping
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Supervised process state as seen by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    NotRunning,
    Starting,
    Running,
    Stopping,
}

/// Snapshot of one profile's process state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub status: ProcessStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

/// A launched process awaiting its liveness check
///
/// The check runs on its own task and produces exactly one
/// [`Notification::Started`] or [`Notification::StartFailed`], which is
/// both published on the context bus and returned by [`outcome`].
///
/// [`outcome`]: PendingStart::outcome
pub struct PendingStart {
    name: String,
    pid: i32,
    outcome_rx: oneshot::Receiver<Notification>,
    task: JoinHandle<()>,
}

impl PendingStart {
    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Wait for the liveness check
    pub async fn outcome(self) -> Notification {
        match self.outcome_rx.await {
            Ok(notification) => notification,
            Err(_) => Notification::StartFailed {
                name: self.name,
                reason: "start check was cancelled".to_string(),
            },
        }
    }

    /// Cancel the liveness check; the launched process is left alone
    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Starts, stops and inspects profile processes
#[derive(Clone)]
pub struct Supervisor {
    ctx: ManagerContext,
}

impl Supervisor {
    pub fn new(ctx: ManagerContext) -> Self {
        Self { ctx }
    }

    /// Process state directory of a profile
    pub fn state_for(&self, profile: &Profile) -> Result<ProcessState, ManagerError> {
        profile::validate_name(&profile.name)?;
        Ok(ProcessState::new(
            self.ctx
                .config()
                .state_dir
                .join(&profile.name)
                .join(PROCESS_DIR),
        ))
    }

    /// Launch the binary for `profile`
    ///
    /// Returns once the process is spawned. Must be called from within a
    /// tokio runtime.
    pub async fn start(&self, profile: &Profile) -> Result<PendingStart, ManagerError> {
        let config = self.ctx.config();
        let state = self.state_for(profile)?;
        let bin = runtime::resolve_binary(config, profile)?;

        if state.is_alive() {
            return Err(ProcessError::AlreadyRunning {
                name: profile.name.clone(),
            }
            .into());
        }

        // Stale state from a crashed run
        state.clear().map_err(|e| launch_failed(profile, e))?;
        std::fs::create_dir_all(state.dir()).map_err(|e| launch_failed(profile, e))?;

        let child = match self.spawn(profile, &bin, &state) {
            Ok(child) => child,
            Err(e) => {
                let _ = state.clear();
                return Err(e);
            }
        };

        let Some(pid) = child.id().map(|id| id as i32) else {
            let _ = state.clear();
            return Err(launch_failed(profile, "process exited before its pid was read"));
        };

        if let Err(e) = state.write_pid(pid) {
            let _ = signal_process(pid, libc::SIGKILL);
            let _ = state.clear();
            return Err(launch_failed(profile, e));
        }

        tracing::info!(
            "Launched '{}' (pid {}) on interface '{}'",
            profile.name,
            pid,
            profile.interface
        );

        let (outcome_tx, outcome_rx) = oneshot::channel();
        let task = tokio::spawn(watch_start(
            self.ctx.clone(),
            profile.clone(),
            state,
            child,
            outcome_tx,
        ));

        Ok(PendingStart {
            name: profile.name.clone(),
            pid,
            outcome_rx,
            task,
        })
    }

    /// Launch `profile` and wait for its liveness check
    ///
    /// A process that dies during the check is reported as `LaunchFailed`
    /// with the reason it published.
    pub async fn start_checked(&self, profile: &Profile) -> Result<Notification, ManagerError> {
        let pending = self.start(profile).await?;
        match pending.outcome().await {
            started @ Notification::Started { .. } => Ok(started),
            Notification::StartFailed { name, reason } => {
                Err(ProcessError::LaunchFailed { name, reason }.into())
            }
            other => Err(launch_failed(
                profile,
                format!("unexpected start outcome: {}", other.message()),
            )),
        }
    }

    fn spawn(&self, profile: &Profile, bin: &Path, state: &ProcessState) -> Result<Child, ManagerError> {
        let config = self.ctx.config();
        let stdout = open_log(&state.stdout_path()).map_err(|e| launch_failed(profile, e))?;
        let stderr = open_log(&state.stderr_path()).map_err(|e| launch_failed(profile, e))?;

        let script = launch_script(profile, bin);
        let mut cmd = match &config.elevation {
            Some(wrapper) => {
                let mut cmd = Command::new(wrapper);
                cmd.arg("/bin/sh");
                cmd
            }
            None => Command::new("/bin/sh"),
        };

        cmd.arg("-c")
            .arg(&script)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(false);

        // The elevation wrapper may prompt on the terminal and has to stay
        // in the caller's foreground process group.
        if config.elevation.is_none() {
            cmd.process_group(0);
        }

        cmd.spawn().map_err(|e| launch_failed(profile, e))
    }

    /// Terminate the process of `profile`
    ///
    /// SIGTERM first, then one forced kill through the elevation wrapper.
    /// The state directory is removed whatever happens.
    pub async fn stop(&self, profile: &Profile) -> Result<(), ManagerError> {
        let config = self.ctx.config();
        let state = self.state_for(profile)?;

        let Some(pid) = state.read_pid() else {
            tracing::debug!("No pid recorded for '{}'", profile.name);
            state.clear()?;
            return Ok(());
        };

        let result = terminate(pid, config.elevation.as_deref(), config.stop_grace).await;

        if let Err(e) = state.clear() {
            tracing::warn!("Failed to remove process state {:?}: {}", state.dir(), e);
        }

        match &result {
            Ok(()) => tracing::info!("Stopped '{}' (pid {})", profile.name, pid),
            Err(e) => tracing::error!("Stopping '{}' failed: {}", profile.name, e),
        }

        self.ctx.notify(Notification::Stopped {
            name: profile.name.clone(),
        });

        result.map_err(ManagerError::from)
    }

    /// Whether the profile's process is running; false on any doubt
    pub fn is_alive(&self, profile: &Profile) -> bool {
        self.state_for(profile)
            .map(|state| state.is_alive())
            .unwrap_or(false)
    }

    pub fn status(&self, profile: &Profile) -> Result<ProcessInfo, ManagerError> {
        let state = self.state_for(profile)?;
        let pid = state.read_pid();
        let running = pid.map(pid_alive).unwrap_or(false);

        Ok(ProcessInfo {
            status: if running {
                ProcessStatus::Running
            } else {
                ProcessStatus::NotRunning
            },
            pid: pid.filter(|_| running),
            stdout: state.stdout_path(),
            stderr: state.stderr_path(),
        })
    }
}

/// Shell command line run (possibly elevated) for a profile
pub fn launch_script(profile: &Profile, bin: &Path) -> String {
    let bin = bin.to_string_lossy();
    let mut parts = vec![
        format!("{}={}", TOKEN_ENV, shell_words::quote(&profile.token)),
        "exec".to_string(),
        shell_words::quote(&bin).into_owned(),
        "--address".to_string(),
        shell_words::quote(&profile.ip).into_owned(),
        "--interface".to_string(),
        shell_words::quote(&profile.interface).into_owned(),
    ];

    if profile.api {
        parts.push("--api".to_string());
        parts.push("--api-listen".to_string());
        parts.push(shell_words::quote(&profile.api_address).into_owned());
    }

    parts.join(" ")
}

/// Delayed liveness check for a fresh launch
async fn watch_start(
    ctx: ManagerContext,
    profile: Profile,
    state: ProcessState,
    mut child: Child,
    outcome_tx: oneshot::Sender<Notification>,
) {
    tokio::time::sleep(ctx.config().start_delay).await;

    let (exited, reaped) = match child.try_wait() {
        Ok(Some(status)) => (Some(format!("process exited with {}", status)), true),
        Ok(None) if state.is_alive() => (None, false),
        Ok(None) => (Some("process is not alive".to_string()), false),
        Err(e) => (Some(format!("failed to poll process: {}", e)), false),
    };

    let notification = match exited {
        None => {
            tracing::info!("Network '{}' is up", profile.name);
            Notification::Started {
                name: profile.name.clone(),
                interface: profile.interface.clone(),
            }
        }
        Some(mut reason) => {
            if let Some(line) = state.last_error_line() {
                reason = format!("{}: {}", reason, line);
            }
            tracing::error!("Network '{}' failed to start: {}", profile.name, reason);

            // A reaped pid may already belong to someone else
            if !reaped {
                if let Some(pid) = state.read_pid() {
                    let _ = signal_process(pid, libc::SIGTERM);
                }
            }
            if let Err(e) = state.clear() {
                tracing::warn!("Failed to remove process state {:?}: {}", state.dir(), e);
            }
            Notification::StartFailed {
                name: profile.name.clone(),
                reason,
            }
        }
    };

    let started = matches!(notification, Notification::Started { .. });
    ctx.notify(notification.clone());
    let _ = outcome_tx.send(notification);

    // Keep reaping the child so it never lingers as a zombie
    if started {
        match child.wait().await {
            Ok(status) => tracing::info!("Network '{}' exited with {}", profile.name, status),
            Err(e) => tracing::warn!("Lost track of network '{}': {}", profile.name, e),
        }
    }
}

/// Graceful-then-forced termination of `pid`
async fn terminate(pid: i32, elevation: Option<&Path>, grace: Duration) -> Result<(), ProcessError> {
    if let Err(e) = signal_process(pid, libc::SIGTERM) {
        tracing::debug!("SIGTERM to {} failed: {}", pid, e);
    }

    if wait_for_exit(pid, grace).await {
        return Ok(());
    }

    tracing::warn!("Process {} ignored SIGTERM, forcing kill", pid);
    match elevation {
        Some(wrapper) => {
            let output = Command::new(wrapper)
                .args(["kill", "-9", &pid.to_string()])
                .output()
                .await
                .map_err(|e| ProcessError::KillFailed {
                    pid,
                    reason: format!("{}: {}", wrapper.display(), e),
                })?;
            if !output.status.success() {
                tracing::warn!(
                    "Forced kill of {} exited with {}: {}",
                    pid,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
        }
        None => {
            if let Err(e) = signal_process(pid, libc::SIGKILL) {
                tracing::debug!("SIGKILL to {} failed: {}", pid, e);
            }
        }
    }

    if wait_for_exit(pid, grace).await {
        Ok(())
    } else {
        Err(ProcessError::KillFailed {
            pid,
            reason: "process still alive after forced kill".to_string(),
        })
    }
}

async fn wait_for_exit(pid: i32, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if !pid_alive(pid) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(STOP_POLL_INTERVAL).await;
    }
}

fn signal_process(pid: i32, signal: libc::c_int) -> std::io::Result<()> {
    state::signal_process(pid, signal)
}

fn open_log(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn launch_failed(profile: &Profile, reason: impl std::fmt::Display) -> ManagerError {
    ProcessError::LaunchFailed {
        name: profile.name.clone(),
        reason: reason.to_string(),
    }
    .into()
}
