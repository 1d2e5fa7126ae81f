//! Detect, stop and start the OS processes backed by an executable file.
//!
//! Matching is by executable base name (without extension), not PID: the
//! updater never launched the processes it has to stop.

use crate::{Result, UpdateError};
use async_trait::async_trait;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;
use sysinfo::{Pid, Process, System};
use tracing::{debug, info};

/// Wait after each terminated process before moving on
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(1);

#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// True if at least one process runs from an executable with this name.
    fn is_running(&self, executable: &Path) -> bool;

    /// Terminate every matching process, waiting the grace period after each.
    ///
    /// The wait is best effort: exit is not confirmed.
    async fn stop(&self, executable: &Path) -> Result<()>;

    /// Launch the executable detached. The new process is not tracked.
    fn start(&self, executable: &Path) -> Result<()>;
}

/// [`ProcessControl`] backed by the live process table
pub struct SystemProcessController {
    grace_period: Duration,
}

impl SystemProcessController {
    pub fn new(grace_period: Duration) -> Self {
        Self { grace_period }
    }

    /// Processes matching `executable`, excluding the updater itself.
    fn matching(&self, executable: &Path) -> Vec<(Pid, String)> {
        let Some(stem) = stem_of(executable) else {
            return Vec::new();
        };

        let mut system = System::new();
        system.refresh_processes();
        let own_pid = sysinfo::get_current_pid().ok();

        system
            .processes()
            .iter()
            .filter(|(pid, _)| Some(**pid) != own_pid)
            .filter(|(_, process)| process_matches(process, &stem))
            .map(|(pid, process)| (*pid, process.name().to_string()))
            .collect()
    }
}

impl Default for SystemProcessController {
    fn default() -> Self {
        Self::new(DEFAULT_GRACE_PERIOD)
    }
}

#[async_trait]
impl ProcessControl for SystemProcessController {
    fn is_running(&self, executable: &Path) -> bool {
        !self.matching(executable).is_empty()
    }

    async fn stop(&self, executable: &Path) -> Result<()> {
        let targets = self.matching(executable);
        if targets.is_empty() {
            debug!("No running process for {}", executable.display());
            return Ok(());
        }

        for (pid, name) in targets {
            info!("Terminating {} (pid {})", name, pid);
            terminate(pid).map_err(|reason| {
                UpdateError::ProcessControl(format!(
                    "Failed to stop {} (pid {}): {}",
                    name, pid, reason
                ))
            })?;
            tokio::time::sleep(self.grace_period).await;
        }

        Ok(())
    }

    fn start(&self, executable: &Path) -> Result<()> {
        let mut command = launch_command(executable);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(dir) = executable.parent().filter(|d| !d.as_os_str().is_empty()) {
            command.current_dir(dir);
        }

        let child = command.spawn().map_err(|e| {
            UpdateError::ProcessControl(format!(
                "Failed to start {}: {}",
                executable.display(),
                e
            ))
        })?;
        debug!("Launched {} (pid {})", executable.display(), child.id());
        Ok(())
    }
}

fn stem_of(path: &Path) -> Option<String> {
    path.file_stem().map(|s| s.to_string_lossy().to_string())
}

fn names_match(candidate: &str, stem: &str) -> bool {
    if cfg!(windows) {
        candidate.eq_ignore_ascii_case(stem)
    } else {
        candidate == stem
    }
}

/// Compare by process name and, where visible, by executable path. Linux
/// truncates process names to 15 bytes, so the path check catches long names.
fn process_matches(process: &Process, stem: &str) -> bool {
    let by_name = stem_of(Path::new(process.name()))
        .map(|name| names_match(&name, stem))
        .unwrap_or(false);
    let by_exe = process
        .exe()
        .and_then(stem_of)
        .map(|name| names_match(&name, stem))
        .unwrap_or(false);
    by_name || by_exe
}

#[cfg(unix)]
fn terminate(pid: Pid) -> std::result::Result<(), String> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid as UnixPid;

    match kill(UnixPid::from_raw(pid.as_u32() as i32), Signal::SIGKILL) {
        // Already gone.
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e.to_string()),
    }
}

#[cfg(not(unix))]
fn terminate(pid: Pid) -> std::result::Result<(), String> {
    let mut system = System::new();
    system.refresh_processes();
    match system.process(pid) {
        Some(process) if process.kill() => Ok(()),
        Some(_) => Err("termination was refused".to_string()),
        None => Ok(()),
    }
}

#[cfg(windows)]
fn launch_command(executable: &Path) -> Command {
    let mut command = Command::new("cmd");
    command.args(["/C", "start", ""]).arg(executable);
    command
}

#[cfg(target_os = "macos")]
fn launch_command(executable: &Path) -> Command {
    let mut command = Command::new("open");
    command.arg(executable);
    command
}

#[cfg(all(not(windows), not(target_os = "macos")))]
fn launch_command(executable: &Path) -> Command {
    Command::new(executable)
}
