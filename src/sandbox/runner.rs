use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::demux::OutputBuffers;
use super::runtime::{ContainerRuntime, ContainerSpec, FrameStream};
use super::{EXIT_CODE_UNKNOWN, RunOutcome};
use crate::config::SandboxConfig;
use crate::job::ResourceLimits;
use crate::workspace::Workspace;
use crate::workspace::harness::{RESULTS_FILE, SHARED_MODULES_DIR};

/// Where the workspace is mounted inside the sandbox
pub const MOUNT_POINT: &str = "/workspace";

/// Working directory inside the sandbox
pub const WORK_DIR: &str = "/app";

/// How long a killed sandbox gets to report its exit status
const STOP_GRACE: Duration = Duration::from_secs(5);

/// How long the output reader may keep draining after the sandbox exits
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct SandboxSettings {
    pub image: String,
    pub user: Option<String>,
    pub pids_limit: i64,
    pub network_mode: String,
    pub max_output_bytes: usize,
}

impl From<&SandboxConfig> for SandboxSettings {
    fn from(config: &SandboxConfig) -> Self {
        Self {
            image: config.image.clone(),
            user: Some("node".to_string()),
            pids_limit: config.pids_limit,
            network_mode: config.network_mode.clone(),
            max_output_bytes: config.max_output_bytes,
        }
    }
}

/// Shell script executed inside the sandbox
///
/// The install step is only emitted when the candidate declared packages the
/// image does not already carry.
pub fn sandbox_script(install: bool) -> String {
    let mut script = vec![
        "set -e".to_string(),
        format!("cp -a {MOUNT_POINT}/. {WORK_DIR}/"),
        format!("mkdir -p {WORK_DIR}/node_modules"),
        format!("cp -a {SHARED_MODULES_DIR}/. {WORK_DIR}/node_modules/"),
    ];
    if install {
        script.push("npm install --no-audit --no-fund --loglevel=error".to_string());
    }
    script.extend([
        "set +e".to_string(),
        format!("npx jest --ci --json --outputFile={WORK_DIR}/{RESULTS_FILE}"),
        "status=$?".to_string(),
        format!(
            "if [ -f {WORK_DIR}/{RESULTS_FILE} ]; then cp {WORK_DIR}/{RESULTS_FILE} {MOUNT_POINT}/{RESULTS_FILE}; fi"
        ),
        "exit $status".to_string(),
    ]);
    script.join("\n")
}

/// Runs a workspace in a fresh sandbox under a wall-clock deadline
pub struct SandboxRunner {
    runtime: Arc<dyn ContainerRuntime>,
    settings: SandboxSettings,
}

impl SandboxRunner {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, settings: SandboxSettings) -> Self {
        Self { runtime, settings }
    }

    pub fn container_spec(
        &self,
        job_id: Uuid,
        workspace: &Workspace,
        limits: &ResourceLimits,
    ) -> ContainerSpec {
        ContainerSpec {
            name: format!("exec-sandbox-{job_id}-{}", &Uuid::new_v4().simple().to_string()[..8]),
            image: self.settings.image.clone(),
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                sandbox_script(workspace.install_required()),
            ],
            workspace: workspace.path().to_path_buf(),
            mount_point: MOUNT_POINT.to_string(),
            working_dir: WORK_DIR.to_string(),
            user: self.settings.user.clone(),
            limits: *limits,
            pids_limit: self.settings.pids_limit,
            network_mode: self.settings.network_mode.clone(),
            labels: HashMap::from([("exec-sandbox.job".to_string(), job_id.to_string())]),
        }
    }

    /// Creates, runs and always removes one sandbox
    pub async fn run(
        &self,
        job_id: Uuid,
        workspace: &Workspace,
        limits: &ResourceLimits,
    ) -> Result<RunOutcome> {
        let spec = self.container_spec(job_id, workspace, limits);
        let id = self
            .runtime
            .create(&spec)
            .await
            .context("Failed to create sandbox")?;
        log::info!("Created sandbox {id} for job {job_id}");

        let outcome = self.supervise(&id, limits).await;
        self.remove_quietly(&id).await;
        outcome
    }

    async fn supervise(&self, id: &str, limits: &ResourceLimits) -> Result<RunOutcome> {
        let started = Instant::now();
        self.runtime
            .start(id)
            .await
            .context("Failed to start sandbox")?;

        let buffers = Arc::new(Mutex::new(OutputBuffers::new(self.settings.max_output_bytes)));
        let token = CancellationToken::new();
        let reader = match self.runtime.output(id).await {
            Ok(frames) => Some(tokio::spawn(pump_output(
                frames,
                Arc::clone(&buffers),
                token.clone(),
            ))),
            Err(e) => {
                log::warn!("No output stream for sandbox {id}, continuing without it: {e:#}");
                None
            }
        };

        let deadline = Duration::from_millis(limits.timeout_ms);
        let (exit_code, timed_out) = self.await_exit(id, deadline).await;
        let duration = started.elapsed();

        if let Some(mut reader) = reader
            && tokio::time::timeout(OUTPUT_DRAIN_GRACE, &mut reader).await.is_err()
        {
            log::debug!("Output of sandbox {id} still open after exit, cancelling reader");
            token.cancel();
            let _ = reader.await;
        }

        let (stdout, stderr) = buffers.lock().take();
        Ok(RunOutcome {
            exit_code,
            stdout,
            stderr,
            timed_out,
            duration,
        })
    }

    /// Races the sandbox's exit against the deadline
    async fn await_exit(&self, id: &str, deadline: Duration) -> (i64, bool) {
        let wait = self.runtime.wait(id);
        tokio::pin!(wait);

        tokio::select! {
            biased;

            status = &mut wait => (resolve_exit_code(id, status), false),

            _ = tokio::time::sleep(deadline) => {
                log::warn!("Sandbox {id} exceeded its {}ms deadline, stopping it", deadline.as_millis());
                self.force_stop(id).await;

                let exit_code = match tokio::time::timeout(STOP_GRACE, &mut wait).await {
                    Ok(status) => resolve_exit_code(id, status),
                    Err(_) => {
                        log::warn!("Sandbox {id} did not report an exit status after being stopped");
                        EXIT_CODE_UNKNOWN
                    }
                };
                (exit_code, true)
            }
        }
    }

    async fn force_stop(&self, id: &str) {
        match self.runtime.is_running(id).await {
            Ok(false) => {
                log::debug!("Sandbox {id} already exited, no stop needed");
                return;
            }
            Ok(true) => {}
            Err(e) => log::warn!("Failed to inspect sandbox {id}, stopping anyway: {e:#}"),
        }

        if let Err(e) = self.runtime.stop(id).await {
            log::warn!("Failed to stop sandbox {id}: {e:#}");
        }
    }

    async fn remove_quietly(&self, id: &str) {
        match self.runtime.remove(id).await {
            Ok(()) => log::debug!("Removed sandbox {id}"),
            Err(e) => log::warn!("Failed to remove sandbox {id}: {e:#}"),
        }
    }
}

fn resolve_exit_code(id: &str, status: Result<Option<i64>>) -> i64 {
    match status {
        Ok(Some(code)) => code,
        Ok(None) => EXIT_CODE_UNKNOWN,
        Err(e) => {
            log::warn!("Waiting on sandbox {id} failed: {e:#}");
            EXIT_CODE_UNKNOWN
        }
    }
}

async fn pump_output(
    mut frames: FrameStream,
    buffers: Arc<Mutex<OutputBuffers>>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            next = frames.next() => match next {
                Some(Ok(frame)) => buffers.lock().push(&frame),
                Some(Err(e)) => {
                    log::warn!("Sandbox output stream failed: {e}");
                    break;
                }
                None => break,
            },
        }
    }
}
