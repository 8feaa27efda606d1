/// Container execution strategy
///
/// **Isolation Rules:**
/// 1. Builds a throwaway image per execution: small interpreter base, restricted
///    workdir, only the test tool installed, unprivileged `appuser`
/// 2. Runs the suite in a uniquely named container:
///    - Network disabled
///    - Workspace bind-mounted as the workdir
///    - Memory/CPU/pid limits, all capabilities dropped, no-new-privileges
/// 3. Hard timeout on the run; the container is stopped by name when it fires
/// 4. Cleanup always runs: stop + remove the container if a launch was
///    attempted, remove the image tag, remove the workspace
///
/// Container processes do not die because the host stopped waiting for them,
/// so the stop-then-remove pass runs on every exit path, failure paths included.
/// Names are unique per execution, which keeps cleanup-by-name safe even after
/// a partial failure and when executions run side by side.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::{BuildImageOptions, RemoveImageOptions};
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use testmachine_common::config::TEST_FILENAME;
use testmachine_common::types::Task;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ContainerSettings;
use crate::engine::{combine_logs, ExecutionOutcome, Executor, Workspace};

/// Workdir inside the image; the workspace is mounted here
const CONTAINER_WORKDIR: &str = "/app/code";
const CONTAINER_PIDS_LIMIT: i64 = 128;

/// Phases of one container execution, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerPhase {
    /// The workspace could not be created; nothing reached the daemon
    WorkspaceFailed,
    WorkspaceReady,
    ImageBuilding,
    ImageBuilt,
    ContainerRunning,
    Completed,
    TimedOut,
    BuildFailed,
    RunFailed,
    CleanedUp,
}

impl fmt::Display for ContainerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContainerPhase::WorkspaceFailed => "workspace_failed",
            ContainerPhase::WorkspaceReady => "workspace_ready",
            ContainerPhase::ImageBuilding => "image_building",
            ContainerPhase::ImageBuilt => "image_built",
            ContainerPhase::ContainerRunning => "container_running",
            ContainerPhase::Completed => "completed",
            ContainerPhase::TimedOut => "timed_out",
            ContainerPhase::BuildFailed => "build_failed",
            ContainerPhase::RunFailed => "run_failed",
            ContainerPhase::CleanedUp => "cleaned_up",
        };
        f.write_str(name)
    }
}

/// Image tag and container name owned by exactly one execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactNames {
    pub image: String,
    pub container: String,
}

impl ArtifactNames {
    pub fn generate() -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let short = &id[..12];
        Self {
            image: format!("testmachine-img-{}", short),
            container: format!("testmachine-run-{}", short),
        }
    }
}

/// Everything the backend needs to launch the test container
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub workspace: PathBuf,
    pub command: Vec<String>,
    pub memory_bytes: i64,
    pub nano_cpus: i64,
}

/// Image definition for one execution
pub fn dockerfile(base_image: &str) -> String {
    format!(
        "FROM {base}\n\
         WORKDIR {workdir}\n\
         RUN pip install --no-cache-dir pytest\n\
         RUN useradd --create-home appuser && chown -R appuser {workdir}\n\
         USER appuser\n",
        base = base_image,
        workdir = CONTAINER_WORKDIR,
    )
}

/// Tar build context holding only the image definition
pub fn build_context(base_image: &str) -> std::io::Result<Vec<u8>> {
    let contents = dockerfile(base_image);
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();

    let mut builder = tar::Builder::new(Vec::new());
    builder.append_data(&mut header, "Dockerfile", contents.as_bytes())?;
    builder.into_inner()
}

/// Operations the container executor needs from a container daemon
///
/// `stop_container`, `remove_container` and `remove_image` treat a missing
/// target as success so cleanup can be attempted unconditionally.
#[async_trait]
pub trait ContainerBackend: Send + Sync {
    async fn build_image(&self, tag: &str, context: Vec<u8>) -> Result<()>;

    /// Create and start the container
    async fn start_container(&self, spec: &ContainerSpec) -> Result<()>;

    /// Wait for the container to exit and return its exit code
    async fn wait_container(&self, name: &str) -> Result<i64>;

    /// Captured (stdout, stderr) of an exited container
    async fn container_logs(&self, name: &str) -> Result<(String, String)>;

    async fn stop_container(&self, name: &str) -> Result<()>;

    async fn remove_container(&self, name: &str) -> Result<()>;

    async fn remove_image(&self, tag: &str) -> Result<()>;
}

pub struct ContainerExecutor<B> {
    backend: B,
    settings: ContainerSettings,
    timeout: Duration,
    workspace_root: Option<PathBuf>,
}

impl<B: ContainerBackend> ContainerExecutor<B> {
    pub fn new(backend: B, settings: ContainerSettings, timeout: Duration) -> Self {
        Self {
            backend,
            settings,
            timeout,
            workspace_root: None,
        }
    }

    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = Some(root.into());
        self
    }

    /// Run one execution and report the last phase reached before cleanup
    pub(crate) async fn execute_with_phase(&self, task: &Task) -> (ExecutionOutcome, ContainerPhase) {
        let names = ArtifactNames::generate();

        let workspace = match Workspace::create(self.workspace_root.as_deref(), task) {
            Ok(workspace) => workspace,
            Err(e) => {
                enter(ContainerPhase::WorkspaceFailed, &names);
                error!(error = %e, "Failed to prepare workspace");
                return (
                    ExecutionOutcome::infrastructure(format!("Failed to prepare workspace: {}", e)),
                    ContainerPhase::WorkspaceFailed,
                );
            }
        };
        enter(ContainerPhase::WorkspaceReady, &names);

        let start = Instant::now();
        let (outcome, phase, container_attempted) = self.run_phases(&names, workspace.path()).await;

        self.cleanup(&names, container_attempted).await;
        workspace.close();
        enter(ContainerPhase::CleanedUp, &names);

        info!(
            container = %names.container,
            image = %names.image,
            phase = %phase,
            elapsed_ms = start.elapsed().as_millis() as u64,
            outcome = outcome.label(),
            "Container execution finished"
        );
        (outcome, phase)
    }

    /// Build, run and wait. Returns whether a container launch was attempted.
    async fn run_phases(
        &self,
        names: &ArtifactNames,
        workspace: &Path,
    ) -> (ExecutionOutcome, ContainerPhase, bool) {
        enter(ContainerPhase::ImageBuilding, names);
        let built = match build_context(&self.settings.base_image) {
            Ok(context) => self.backend.build_image(&names.image, context).await,
            Err(e) => Err(anyhow::Error::new(e).context("Failed to assemble build context")),
        };
        if let Err(e) = built {
            enter(ContainerPhase::BuildFailed, names);
            error!(image = %names.image, error = %format!("{:#}", e), "Image build failed");
            return (
                ExecutionOutcome::infrastructure(format!("Image build failed: {:#}", e)),
                ContainerPhase::BuildFailed,
                false,
            );
        }
        enter(ContainerPhase::ImageBuilt, names);

        let spec = ContainerSpec {
            name: names.container.clone(),
            image: names.image.clone(),
            workspace: workspace.to_path_buf(),
            command: vec![
                "python".to_string(),
                "-m".to_string(),
                "pytest".to_string(),
                TEST_FILENAME.to_string(),
            ],
            memory_bytes: self.settings.memory_limit_bytes(),
            nano_cpus: self.settings.nano_cpus(),
        };

        enter(ContainerPhase::ContainerRunning, names);
        let run = async {
            self.backend
                .start_container(&spec)
                .await
                .context("Failed to launch container")?;
            let exit_code = self
                .backend
                .wait_container(&spec.name)
                .await
                .context("Failed waiting for container")?;
            let (stdout, stderr) = self
                .backend
                .container_logs(&spec.name)
                .await
                .context("Failed to read container logs")?;
            Ok::<(i64, String, String), anyhow::Error>((exit_code, stdout, stderr))
        };

        let result = tokio::time::timeout(self.timeout, run).await;
        match result {
            Ok(Ok((exit_code, stdout, stderr))) => {
                enter(ContainerPhase::Completed, names);
                (
                    ExecutionOutcome::Completed {
                        exit_code,
                        logs: combine_logs(&stdout, &stderr),
                    },
                    ContainerPhase::Completed,
                    true,
                )
            }
            Ok(Err(e)) => {
                enter(ContainerPhase::RunFailed, names);
                error!(container = %names.container, error = %format!("{:#}", e), "Container run failed");
                (
                    ExecutionOutcome::infrastructure(format!("{:#}", e)),
                    ContainerPhase::RunFailed,
                    true,
                )
            }
            Err(_) => {
                enter(ContainerPhase::TimedOut, names);
                warn!(
                    container = %names.container,
                    timeout_secs = self.timeout.as_secs_f64(),
                    "Container timed out - stopping it"
                );
                // The host-side wait ending says nothing about the container itself
                if let Err(e) = self.backend.stop_container(&names.container).await {
                    warn!(container = %names.container, error = %format!("{:#}", e), "Failed to stop timed-out container");
                }
                (
                    ExecutionOutcome::TimedOut {
                        logs: format!(
                            "Timeout: test run exceeded {}s, possible infinite loop; container stopped",
                            self.timeout.as_secs_f64()
                        ),
                    },
                    ContainerPhase::TimedOut,
                    true,
                )
            }
        }
    }

    async fn cleanup(&self, names: &ArtifactNames, container_attempted: bool) {
        if container_attempted {
            if let Err(e) = self.backend.stop_container(&names.container).await {
                warn!(container = %names.container, error = %format!("{:#}", e), "Cleanup: failed to stop container");
            }
            if let Err(e) = self.backend.remove_container(&names.container).await {
                warn!(container = %names.container, error = %format!("{:#}", e), "Cleanup: failed to remove container");
            }
        }
        // Attempted even after a failed build: a partial build may have tagged it
        if let Err(e) = self.backend.remove_image(&names.image).await {
            warn!(image = %names.image, error = %format!("{:#}", e), "Cleanup: failed to remove image");
        }
    }
}

#[async_trait]
impl<B: ContainerBackend> Executor for ContainerExecutor<B> {
    fn name(&self) -> &'static str {
        "docker"
    }

    #[instrument(skip(self, task), fields(strategy = "docker"))]
    async fn execute(&self, task: &Task) -> ExecutionOutcome {
        self.execute_with_phase(task).await.0
    }
}

fn enter(phase: ContainerPhase, names: &ArtifactNames) {
    debug!(container = %names.container, image = %names.image, phase = %phase, "Container phase");
}

/// Docker daemon access through bollard
///
/// The daemon client is created on first use, so a worker on a host without
/// Docker still serves local tasks.
pub struct BollardBackend {
    docker: OnceCell<Docker>,
}

impl BollardBackend {
    pub fn new() -> Self {
        Self {
            docker: OnceCell::new(),
        }
    }

    async fn docker(&self) -> Result<&Docker> {
        self.docker
            .get_or_try_init(|| async {
                Docker::connect_with_local_defaults().context("Failed to connect to Docker daemon")
            })
            .await
    }
}

impl Default for BollardBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Not-found (404) and not-modified (304) mean the target is already gone or stopped
fn is_absent(error: &DockerError) -> bool {
    matches!(
        error,
        DockerError::DockerResponseServerError { status_code: 404 | 304, .. }
    )
}

#[async_trait]
impl ContainerBackend for BollardBackend {
    async fn build_image(&self, tag: &str, context: Vec<u8>) -> Result<()> {
        let docker = self.docker().await?;
        let options = BuildImageOptions {
            dockerfile: "Dockerfile",
            t: tag,
            rm: true,
            forcerm: true,
            ..Default::default()
        };

        let mut stream = docker.build_image(options, None, Some(context.into()));
        while let Some(item) = stream.next().await {
            let info = item.context("Docker build stream failed")?;
            if let Some(error) = info.error {
                bail!("{}", error.trim_end());
            }
            if let Some(line) = info.stream {
                let line = line.trim_end();
                if !line.is_empty() {
                    debug!(image = tag, "{}", line);
                }
            }
        }
        Ok(())
    }

    async fn start_container(&self, spec: &ContainerSpec) -> Result<()> {
        let docker = self.docker().await?;

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            working_dir: Some(CONTAINER_WORKDIR.to_string()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            network_disabled: Some(true), // SECURITY: No network access
            host_config: Some(bollard::models::HostConfig {
                binds: Some(vec![format!("{}:{}", spec.workspace.display(), CONTAINER_WORKDIR)]),
                network_mode: Some("none".to_string()),
                memory: Some(spec.memory_bytes),
                nano_cpus: Some(spec.nano_cpus),
                pids_limit: Some(CONTAINER_PIDS_LIMIT),
                cap_drop: Some(vec!["ALL".to_string()]),
                security_opt: Some(vec!["no-new-privileges".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: spec.name.as_str(),
            platform: None,
        };
        docker
            .create_container(Some(create_options), config)
            .await
            .context("Failed to create Docker container")?;

        docker
            .start_container(&spec.name, None::<StartContainerOptions<String>>)
            .await
            .context("Failed to start Docker container")?;
        Ok(())
    }

    async fn wait_container(&self, name: &str) -> Result<i64> {
        let docker = self.docker().await?;
        let options = WaitContainerOptions {
            condition: "not-running",
        };

        let mut stream = docker.wait_container(name, Some(options));
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports a non-zero exit as an error carrying the code
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(anyhow::Error::new(e).context("Docker wait failed")),
            None => bail!("No wait response from container {}", name),
        }
    }

    async fn container_logs(&self, name: &str) -> Result<(String, String)> {
        let docker = self.docker().await?;
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: false,
            ..Default::default()
        };

        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut stream = docker.logs(name, Some(options));
        while let Some(item) = stream.next().await {
            match item? {
                LogOutput::StdOut { message } => stdout.push_str(&String::from_utf8_lossy(&message)),
                LogOutput::StdErr { message } => stderr.push_str(&String::from_utf8_lossy(&message)),
                _ => {}
            }
        }
        Ok((stdout, stderr))
    }

    async fn stop_container(&self, name: &str) -> Result<()> {
        let docker = self.docker().await?;
        match docker
            .stop_container(name, Some(StopContainerOptions { t: 0 }))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_absent(&e) => {
                debug!(container = name, "Container already stopped or gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        let docker = self.docker().await?;
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        match docker.remove_container(name, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_absent(&e) => {
                debug!(container = name, "Container already removed");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_image(&self, tag: &str) -> Result<()> {
        let docker = self.docker().await?;
        let options = RemoveImageOptions {
            force: true,
            ..Default::default()
        };
        match docker.remove_image(tag, Some(options), None).await {
            Ok(_) => Ok(()),
            Err(e) if is_absent(&e) => {
                debug!(image = tag, "Image already removed");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
