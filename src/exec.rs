//! Shell command execution.
//!
//! Everything that mutates kernel state (`ip`, `route`, `ipvsadm`,
//! namespace symlinks) goes through the [`CommandRunner`] capability,
//! so the control logic can be exercised in tests without touching
//! the host.

use async_trait::async_trait;
use log::{debug, warn};
use tokio::process::Command;

use crate::error::{Error, Result};

#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &str) -> Result<()>;
}

/// Runs commands through `sh -c` on the host.
pub struct ShellRunner;

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, command: &str) -> Result<()> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .await
            .map_err(|e| Error::CommandFailed {
                command: command.to_string(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::CommandFailed {
                command: command.to_string(),
                reason: format!("{}: {}", output.status, stderr.trim()),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            debug!("{}", stdout.trim());
        }
        Ok(())
    }
}

/// Issues a command and reports failure without propagating it.
///
/// Address assignments, routes and IPVS rules have no rollback; a
/// failed command leaves the bookkeeping in place and the operator
/// a log line to act on.
pub async fn issue(runner: &dyn CommandRunner, command: String) {
    debug!("exec: {}", command);
    if let Err(e) = runner.run(&command).await {
        warn!("{}", e);
    }
}

/// Captures issued commands instead of executing them.
#[cfg(test)]
pub struct RecordingRunner {
    commands: std::sync::Mutex<Vec<String>>,
    fail: bool,
}

#[cfg(test)]
impl RecordingRunner {
    pub fn new() -> Self {
        Self {
            commands: std::sync::Mutex::new(Vec::new()),
            fail: false,
        }
    }

    /// A runner whose every command fails after being recorded.
    pub fn failing() -> Self {
        Self {
            commands: std::sync::Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.commands.lock().unwrap())
    }
}

#[cfg(test)]
#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, command: &str) -> Result<()> {
        self.commands.lock().unwrap().push(command.to_string());
        if self.fail {
            return Err(Error::CommandFailed {
                command: command.to_string(),
                reason: "forced failure".into(),
            });
        }
        Ok(())
    }
}
