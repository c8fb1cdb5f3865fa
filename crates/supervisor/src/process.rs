//! The managed child process.
//!
//! The supervisor only talks to [`ProcessHandle`]; [`ChildProcess`] is the
//! tokio implementation used by the binary.

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::error::{Result, SupervisionError};

#[async_trait]
pub trait ProcessHandle: Send {
    /// Spawn the child and return its pid.
    async fn start(&mut self) -> Result<u32>;

    /// Ask the child to exit, killing it after `timeout`. Stopping a child
    /// that is not running is not an error.
    async fn stop(&mut self, timeout: Duration) -> Result<()>;

    fn is_alive(&mut self) -> bool;

    /// Wait for the child to exit and return its exit code, `None` when it
    /// was killed by a signal.
    async fn wait(&mut self) -> Result<Option<i32>>;

    fn pid(&self) -> Option<u32>;
}

/// A child started with `tokio::process`.
pub struct ChildProcess {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    child: Option<Child>,
}

impl ChildProcess {
    pub fn new(command: &[String], working_dir: Option<PathBuf>) -> Result<Self> {
        let (program, args) = command.split_first().ok_or(SupervisionError::EmptyCommand)?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            working_dir,
            child: None,
        })
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[async_trait]
impl ProcessHandle for ChildProcess {
    async fn start(&mut self) -> Result<u32> {
        if self.is_alive() {
            warn!(pid = ?self.pid(), "Pipeline already running, not spawning another");
            return self.pid().ok_or(SupervisionError::NotRunning);
        }

        let mut command = Command::new(&self.program);
        command.args(&self.args).kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let child = command.spawn().map_err(SupervisionError::Spawn)?;
        let pid = child.id().ok_or(SupervisionError::NotRunning)?;
        info!(pid, command = %self.command_line(), "Pipeline started");
        self.child = Some(child);
        Ok(pid)
    }

    async fn stop(&mut self, timeout: Duration) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let Some(pid) = child.id() else {
            // Already exited and reaped.
            return Ok(());
        };

        terminate(pid);
        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => {
                info!(pid, %status, "Pipeline stopped");
                Ok(())
            }
            Ok(Err(e)) => Err(SupervisionError::Stop {
                pid,
                reason: e.to_string(),
            }),
            Err(_) => {
                warn!(pid, ?timeout, "Pipeline ignored SIGTERM, killing it");
                child.kill().await.map_err(|e| SupervisionError::Stop {
                    pid,
                    reason: e.to_string(),
                })
            }
        }
    }

    fn is_alive(&mut self) -> bool {
        match self.child.as_mut().map(Child::try_wait) {
            Some(Ok(None)) => true,
            Some(Ok(Some(status))) => {
                debug!(%status, "Pipeline has exited");
                false
            }
            Some(Err(e)) => {
                warn!(error = %e, "Could not poll pipeline status");
                false
            }
            None => false,
        }
    }

    async fn wait(&mut self) -> Result<Option<i32>> {
        let child = self.child.as_mut().ok_or(SupervisionError::NotRunning)?;
        let status = child.wait().await.map_err(|e| SupervisionError::Probe(e.to_string()))?;
        Ok(status.code())
    }

    fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }
}

/// Send SIGTERM.
#[cfg(unix)]
fn terminate(pid: u32) {
    // SAFETY: kill(2) has no memory-safety preconditions.
    let ret = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if ret != 0 {
        warn!(pid, error = %std::io::Error::last_os_error(), "Failed to send SIGTERM");
    }
}

#[cfg(not(unix))]
fn terminate(pid: u32) {
    debug!(pid, "No SIGTERM on this platform, waiting for the kill timeout");
}

/// Whether a process with this pid exists.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    // SAFETY: kill(2) has no memory-safety preconditions; signal 0 only
    // checks that the pid exists.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    false
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> ChildProcess {
        ChildProcess::new(
            &["sh".to_string(), "-c".to_string(), script.to_string()],
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_empty_command_is_rejected() {
        assert!(matches!(
            ChildProcess::new(&[], None),
            Err(SupervisionError::EmptyCommand)
        ));
    }

    #[tokio::test]
    async fn test_stop_terminates_running_child() {
        let mut process = sh("sleep 30");
        let pid = process.start().await.unwrap();
        assert!(process.is_alive());
        assert!(pid_alive(pid));

        process.stop(Duration::from_secs(5)).await.unwrap();
        assert!(!process.is_alive());
        assert!(!pid_alive(pid));
        assert_eq!(process.pid(), None);
        assert!(pid_alive(std::process::id()));
    }

    #[tokio::test]
    async fn test_stop_kills_child_ignoring_sigterm() {
        let mut process = sh("trap '' TERM; sleep 30");
        process.start().await.unwrap();
        // Give the shell time to install the trap.
        tokio::time::sleep(Duration::from_millis(200)).await;

        process.stop(Duration::from_millis(200)).await.unwrap();
        assert!(!process.is_alive());
    }

    #[tokio::test]
    async fn test_wait_reports_exit_code() {
        let mut process = sh("exit 3");
        process.start().await.unwrap();
        assert_eq!(process.wait().await.unwrap(), Some(3));
        assert!(!process.is_alive());
    }

    #[tokio::test]
    async fn test_stop_without_child_is_noop() {
        let mut process = sh("true");
        process.stop(Duration::from_secs(1)).await.unwrap();
        assert!(matches!(process.wait().await, Err(SupervisionError::NotRunning)));
    }
}
