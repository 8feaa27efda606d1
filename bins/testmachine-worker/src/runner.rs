// Local execution strategy: run the test tool directly on the host
//
// Fast, but only the exclusive workspace separates guest code from the host.
// No network or privilege isolation.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use testmachine_common::config::TEST_FILENAME;
use testmachine_common::types::Task;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, error, info, instrument, warn};

use crate::engine::{combine_logs, ExecutionOutcome, Executor, Workspace};

pub struct LocalExecutor {
    command: Vec<String>,
    timeout: Duration,
    workspace_root: Option<PathBuf>,
}

impl LocalExecutor {
    /// `command` is the program plus leading arguments; the test file is appended
    pub fn new(command: Vec<String>, timeout: Duration) -> Self {
        Self {
            command,
            timeout,
            workspace_root: None,
        }
    }

    /// Create workspaces under `root` instead of the system temp directory
    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = Some(root.into());
        self
    }

    async fn run_in(&self, workspace: &Workspace) -> Result<ExecutionOutcome> {
        let (program, args) = self
            .command
            .split_first()
            .context("Local test command is empty")?;

        let mut command = Command::new(program);
        command
            .args(args)
            .arg(TEST_FILENAME)
            .current_dir(workspace.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so subprocesses started by the suite can be killed with it
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to launch test runner '{}'", program))?;
        let pid = child.id();

        debug!(pid = ?pid, "Test runner started");

        let mut stdout_task = tokio::spawn(read_pipe(child.stdout.take()));
        let mut stderr_task = tokio::spawn(read_pipe(child.stderr.take()));

        // Output is drained inside the budget too: a grandchild holding the
        // pipes open must not outlive the timeout.
        let run = async {
            let status = child.wait().await?;
            let stdout = (&mut stdout_task).await.unwrap_or_default();
            let stderr = (&mut stderr_task).await.unwrap_or_default();
            Ok::<(ExitStatus, String, String), std::io::Error>((status, stdout, stderr))
        };

        let result = tokio::time::timeout(self.timeout, run).await;
        match result {
            Ok(Ok((status, stdout, stderr))) => Ok(ExecutionOutcome::Completed {
                exit_code: exit_code_of(status),
                logs: combine_logs(&stdout, &stderr),
            }),
            Ok(Err(e)) => Err(anyhow::Error::new(e).context("Failed to wait for test runner")),
            Err(_) => {
                warn!(timeout_secs = self.timeout.as_secs_f64(), "Test run timed out - killing runner");
                kill_process_group(pid);
                if let Err(e) = child.kill().await {
                    // Already exited between the timeout firing and the kill
                    debug!(error = %e, "Kill after timeout failed");
                }
                stdout_task.abort();
                stderr_task.abort();
                Ok(ExecutionOutcome::TimedOut {
                    logs: format!(
                        "Timeout: test run exceeded {}s and was terminated",
                        self.timeout.as_secs_f64()
                    ),
                })
            }
        }
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    fn name(&self) -> &'static str {
        "local"
    }

    #[instrument(skip(self, task), fields(strategy = "local"))]
    async fn execute(&self, task: &Task) -> ExecutionOutcome {
        let workspace = match Workspace::create(self.workspace_root.as_deref(), task) {
            Ok(workspace) => workspace,
            Err(e) => {
                error!(error = %e, "Failed to prepare workspace");
                return ExecutionOutcome::infrastructure(format!("Failed to prepare workspace: {}", e));
            }
        };

        let start = Instant::now();
        let outcome = match self.run_in(&workspace).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %format!("{:#}", e), "Local execution failed");
                ExecutionOutcome::infrastructure(format!("{:#}", e))
            }
        };
        workspace.close();

        info!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            outcome = outcome.label(),
            "Local execution finished"
        );
        outcome
    }
}

async fn read_pipe<R>(pipe: Option<R>) -> String
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        if let Err(e) = pipe.read_to_end(&mut buf).await {
            debug!(error = %e, "Error reading test runner output");
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// SIGKILL every process in the runner's group. The group id stays reserved
/// while any member is alive, so this cannot hit an unrelated group.
#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid else { return };
    match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) => debug!(pgid = pid, "Killed runner process group"),
        // ESRCH: the whole group is already gone
        Err(e) => debug!(pgid = pid, error = %e, "Process group kill failed"),
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

/// Exit code of the runner; a signal-terminated runner reports the negated signal
fn exit_code_of(status: ExitStatus) -> i64 {
    if let Some(code) = status.code() {
        return code as i64;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -(signal as i64);
        }
    }
    -1
}
