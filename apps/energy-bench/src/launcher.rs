use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{debug, info, warn};
use transport_ipc::Endpoint;

use crate::config::LOOP_ITERATIONS_ENV;
use crate::definition::LaunchSpec;
use crate::error::HarnessError;

/// A launched worker process. Killed if dropped while still running.
#[derive(Debug)]
pub struct WorkerProcess {
    program: String,
    child: Child,
}

/// Starts the worker for one session. The endpoint is its only required
/// argument; worker stdout is folded into our stderr so that stdout
/// carries results alone.
pub fn spawn(
    launch: &LaunchSpec,
    endpoint: &Endpoint,
    loop_iterations: u32,
) -> Result<WorkerProcess, HarnessError> {
    let argv = launch.argv(endpoint);
    let mut command = Command::new(&launch.program);
    command
        .args(&argv)
        .envs(&launch.env)
        .env(LOOP_ITERATIONS_ENV, loop_iterations.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::from(std::io::stderr()))
        .kill_on_drop(true);

    let child = command.spawn().map_err(|source| HarnessError::Launch {
        program: launch.program.clone(),
        source,
    })?;
    info!(program = %launch.program, args = ?argv, pid = ?child.id(), "worker launched");
    Ok(WorkerProcess {
        program: launch.program.clone(),
        child,
    })
}

impl WorkerProcess {
    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Resolves when the process exits on its own.
    pub async fn exited(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    pub async fn kill(&mut self) {
        if let Err(err) = self.child.kill().await {
            debug!(program = %self.program, error = %err, "kill failed; worker already gone");
        }
    }

    /// Waits up to `grace` for the worker to exit, then kills it. Returns
    /// the exit code when the process exited by itself.
    pub async fn reap(mut self, grace: Duration) -> Option<i32> {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(program = %self.program, %status, "worker exited");
                status.code()
            }
            Ok(Err(err)) => {
                warn!(program = %self.program, error = %err, "failed to wait for worker");
                None
            }
            Err(_) => {
                warn!(program = %self.program, ?grace, "worker outlived its session; killing it");
                self.kill().await;
                None
            }
        }
    }
}
