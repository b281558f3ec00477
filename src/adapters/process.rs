use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::ports::{CommandSpec, EnvPlan, ExecError, ExecOutcome, Launcher};

/// Launches children with `tokio::process`.
///
/// Each child leads its own process group so a timed-out run can be torn
/// down together with anything it spawned.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioLauncher;

#[async_trait::async_trait]
impl Launcher for TokioLauncher {
    async fn launch(
        &self,
        spec: &CommandSpec,
        timeout: Option<Duration>,
        capture_stdout: bool,
    ) -> Result<ExecOutcome, ExecError> {
        let mut command = Command::new(&spec.program);
        command.args(&spec.args);
        match &spec.env {
            EnvPlan::Inherit(vars) => {
                command.envs(vars);
            }
            EnvPlan::Replace(vars) => {
                command.env_clear();
                command.envs(vars);
            }
        }
        command.stdin(Stdio::null());
        command.stdout(if capture_stdout {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        command.stderr(Stdio::null());
        command.kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let child = command.spawn().map_err(|source| ExecError::Launch {
            program: spec.program.clone(),
            source,
        })?;
        let pid = child.id();
        debug!(command = %spec.display_line(), child_pid = ?pid, "Child spawned");

        let wait = child.wait_with_output();
        tokio::pin!(wait);

        let output = match timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut wait).await {
                Ok(result) => result,
                Err(_) => {
                    terminate_group(pid);
                    warn!(
                        program = %spec.program,
                        timeout_ms = limit.as_millis() as u64,
                        "Child timed out and was killed"
                    );
                    return Err(ExecError::Timeout {
                        program: spec.program.clone(),
                        timeout_ms: limit.as_millis() as u64,
                    });
                }
            },
            None => (&mut wait).await,
        }
        .map_err(|source| ExecError::Io {
            program: spec.program.clone(),
            source,
        })?;

        Ok(ExecOutcome {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        })
    }
}

/// SIGKILL the child's process group. The child itself is also killed when
/// the pending wait (and with it the `Child`) is dropped.
#[cfg(unix)]
fn terminate_group(pid: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = pid {
        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            debug!(child_pid = pid, error = %e, "killpg failed");
        }
    }
}

#[cfg(not(unix))]
fn terminate_group(_pid: Option<u32>) {}
