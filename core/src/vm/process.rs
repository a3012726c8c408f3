//! The forked hypervisor process, modeled as a capability interface so
//! the Supervisor never assumes a concrete process-spawning mechanism.
//! Argument construction for the KVM binary is explicitly out of scope
//! (spec.md §1) - callers supply a ready-to-exec command line.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::Path;
use tokio::process::{Child, Command};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Exited with status 0, or was killed by our own expected signal.
    Clean,
    /// Exited with a non-zero status or an unexpected signal.
    Crashed,
}

/// A running (or exited) hypervisor child process.
#[async_trait]
pub trait HypervisorProcess: Send {
    fn pid(&self) -> u32;
    async fn wait(&mut self) -> Result<ExitReason>;
    async fn kill(&mut self) -> Result<()>;
}

/// Spawns a hypervisor process. `args` is the full, already-constructed
/// command line; `runtime_dir` becomes the child's working directory so
/// relative monitor-socket paths resolve correctly.
pub fn spawn(program: &str, args: &[String], runtime_dir: &Path, expected_kill_signal: i32) -> Result<ChildProcess> {
    let child = Command::new(program)
        .args(args)
        .current_dir(runtime_dir)
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::external_failure(format!("failed to spawn hypervisor: {e}")))?;
    let pid = child
        .id()
        .ok_or_else(|| Error::external_failure("hypervisor process has no pid".to_string()))?;
    Ok(ChildProcess {
        child,
        pid,
        expected_kill_signal,
    })
}

pub struct ChildProcess {
    child: Child,
    pid: u32,
    expected_kill_signal: i32,
}

#[async_trait]
impl HypervisorProcess for ChildProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    async fn wait(&mut self) -> Result<ExitReason> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| Error::external_failure(format!("failed to wait on hypervisor: {e}")))?;

        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Ok(if signal == self.expected_kill_signal {
                    ExitReason::Clean
                } else {
                    ExitReason::Crashed
                });
            }
        }

        Ok(if status.success() { ExitReason::Clean } else { ExitReason::Crashed })
    }

    async fn kill(&mut self) -> Result<()> {
        self.child
            .kill()
            .await
            .map_err(|e| Error::external_failure(format!("failed to kill hypervisor: {e}")))
    }
}
