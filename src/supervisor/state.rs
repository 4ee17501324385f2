//! On-disk process state
//!
//! One directory per profile holding the launched pid and the two log
//! files. Liveness is always re-derived from the pid record.

use std::io;
use std::path::{Path, PathBuf};

/// Pid record file name
pub const PID_FILE: &str = "pid";
/// Standard output log file name
pub const STDOUT_FILE: &str = "stdout";
/// Standard error log file name
pub const STDERR_FILE: &str = "stderr";

/// Handle on a process state directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessState {
    dir: PathBuf,
}

impl ProcessState {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn pid_path(&self) -> PathBuf {
        self.dir.join(PID_FILE)
    }

    pub fn stdout_path(&self) -> PathBuf {
        self.dir.join(STDOUT_FILE)
    }

    pub fn stderr_path(&self) -> PathBuf {
        self.dir.join(STDERR_FILE)
    }

    pub fn exists(&self) -> bool {
        self.dir.is_dir()
    }

    /// Recorded pid, or `None` if absent or unreadable
    pub fn read_pid(&self) -> Option<i32> {
        let raw = std::fs::read_to_string(self.pid_path()).ok()?;
        raw.trim().parse::<i32>().ok().filter(|pid| *pid > 1)
    }

    pub fn write_pid(&self, pid: i32) -> io::Result<()> {
        std::fs::write(self.pid_path(), pid.to_string())
    }

    /// Whether the recorded process is still running; fails open to false
    pub fn is_alive(&self) -> bool {
        self.read_pid().map(pid_alive).unwrap_or(false)
    }

    /// Remove the directory and everything in it
    pub fn clear(&self) -> io::Result<()> {
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => {
                tracing::debug!("Cleared process state {:?}", self.dir);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Last non-empty stderr line, for failure reports
    pub fn last_error_line(&self) -> Option<String> {
        let content = std::fs::read_to_string(self.stderr_path()).ok()?;
        content
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
    }
}

/// Whether `pid` names a live, non-zombie process
///
/// A permission error means the process exists but belongs to another
/// user (root, when launched through the elevation wrapper).
pub fn pid_alive(pid: i32) -> bool {
    if pid <= 1 {
        return false;
    }

    // SAFETY: signal 0 only performs the existence and permission check
    let rc = unsafe { libc::kill(pid, 0) };
    if rc != 0 && io::Error::last_os_error().raw_os_error() != Some(libc::EPERM) {
        return false;
    }

    !is_zombie(pid)
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: i32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) else {
        return false;
    };
    // Field 3, after the parenthesised command name
    stat.rsplit_once(')')
        .and_then(|(_, rest)| rest.trim_start().chars().next())
        .map(|state| state == 'Z' || state == 'X')
        .unwrap_or(false)
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: i32) -> bool {
    false
}

/// Signal the process group led by `pid`, falling back to the pid alone
pub fn signal_process(pid: i32, signal: libc::c_int) -> io::Result<()> {
    if pid <= 1 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("refusing to signal pid {}", pid),
        ));
    }

    // SAFETY: plain kill(2) on a validated positive pid / its group
    let rc = unsafe { libc::kill(-pid, signal) };
    if rc == 0 {
        return Ok(());
    }

    let rc = unsafe { libc::kill(pid, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}
