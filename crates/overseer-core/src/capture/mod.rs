//! Capture process supervision.
//!
//! Provides the low-level process handling for one watched stream:
//! - Spawning the capture command in its own process group
//! - Reading combined stdout/stderr line by line
//! - Two-stage termination (SIGTERM to the group, SIGKILL after a grace period)

use crate::error::{Error, Result};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, info, warn};

/// Default delay between SIGTERM and SIGKILL.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(3);

/// A running capture command.
///
/// Dropping the handle terminates the process group if it is still running.
pub struct CaptureProcess {
    child: Option<Child>,
    pgid: i32,
    reader: BufReader<ChildStdout>,
    /// Bytes of a line not yet terminated
    partial: Vec<u8>,
    grace: Duration,
}

impl CaptureProcess {
    /// Spawn `command` through `sh` with stderr folded into stdout.
    pub fn spawn(command: &str, workdir: Option<&Path>, grace: Duration) -> Result<Self> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(format!("exec 2>&1; {}", command))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            // own group, so the whole tree can be signalled at once
            .process_group(0);
        if let Some(dir) = workdir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::ProcessSpawn(format!("{}: {}", command, e)))?;
        let pgid = child
            .id()
            .ok_or_else(|| Error::ProcessSpawn(format!("{}: exited before start", command)))?
            as i32;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::ProcessSpawn(format!("{}: no stdout pipe", command)))?;

        info!(pgid, "Capture process started: {}", command);
        Ok(Self {
            child: Some(child),
            pgid,
            reader: BufReader::new(stdout),
            partial: Vec::new(),
            grace,
        })
    }

    /// Next output line without its line terminator; `None` once the pipe closes.
    ///
    /// Cancel safe: bytes read before the future is dropped are kept for the
    /// next call.
    pub async fn next_line(&mut self) -> Result<Option<String>> {
        let read = self.reader.read_until(b'\n', &mut self.partial).await?;
        if read == 0 && self.partial.is_empty() {
            return Ok(None);
        }
        let buf = std::mem::take(&mut self.partial);
        let line = String::from_utf8_lossy(&buf);
        Ok(Some(line.trim_end_matches(['\n', '\r']).to_string()))
    }

    /// Whether the process has not been reaped yet.
    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Send SIGTERM to the process group and arm a SIGKILL for after the
    /// grace period. Calling this on an exited or already terminated
    /// process only logs a warning.
    pub fn terminate(&mut self) {
        let Some(mut child) = self.child.take() else {
            warn!(pgid = self.pgid, "Trying to kill capture process but it is already terminated");
            return;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                warn!(pgid = self.pgid, %status, "Trying to kill capture process but it is already dead");
                return;
            }
            Ok(None) => {}
            Err(e) => warn!(pgid = self.pgid, error = %e, "Failed to poll capture process"),
        }

        info!(pgid = self.pgid, "Killing capture process");
        signal_group(self.pgid, libc::SIGTERM);

        let pgid = self.pgid;
        let grace = self.grace;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    let deadline = tokio::time::Instant::now() + grace;
                    let leader = tokio::time::timeout(grace, child.wait()).await;
                    // other group members may outlive the leader
                    tokio::time::sleep_until(deadline).await;
                    signal_group(pgid, libc::SIGKILL);
                    if leader.is_err() {
                        warn!(pgid, "Capture process ignored SIGTERM, sent SIGKILL");
                        let _ = child.wait().await;
                    }
                    debug!(pgid, "Capture process reaped");
                });
            }
            Err(_) => {
                // no runtime left to arm the timer on
                signal_group(pgid, libc::SIGKILL);
            }
        }
    }
}

impl Drop for CaptureProcess {
    fn drop(&mut self) {
        if self.is_running() {
            self.terminate();
        }
    }
}

fn signal_group(pgid: i32, signal: libc::c_int) {
    // SAFETY: killpg has no memory-safety preconditions
    let rc = unsafe { libc::killpg(pgid, signal) };
    if rc != 0 {
        debug!(
            pgid,
            signal,
            error = %std::io::Error::last_os_error(),
            "killpg failed"
        );
    }
}
