use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use crate::collector;
use crate::job::{ExecutionJob, ExecutionResult, preview};
use crate::queue::{Delivery, JobHandler, JobQueue};
use crate::reporter::ResultReporter;
use crate::sandbox::SandboxRunner;
use crate::workspace::WorkspaceBuilder;

const LOG_PREVIEW_CHARS: usize = 200;

/// Queue handler that builds, runs, collects and reports one job
pub struct ExecutionWorker {
    builder: WorkspaceBuilder,
    runner: SandboxRunner,
    reporter: ResultReporter,
}

impl ExecutionWorker {
    pub fn new(builder: WorkspaceBuilder, runner: SandboxRunner, reporter: ResultReporter) -> Self {
        Self {
            builder,
            runner,
            reporter,
        }
    }

    /// Runs a job end to end. Never fails: anything that goes wrong becomes
    /// an `error` result carrying the message in `stderr`.
    pub async fn execute(&self, job_id: Uuid, job: &ExecutionJob) -> ExecutionResult {
        let started = Instant::now();

        match self.try_execute(job_id, job).await {
            Ok(result) => result,
            Err(e) => {
                log::error!("Job {job_id} errored before producing a verdict: {e:#}");
                ExecutionResult::error(format!("{e:#}"), started.elapsed().as_millis() as u64)
            }
        }
    }

    async fn try_execute(&self, job_id: Uuid, job: &ExecutionJob) -> Result<ExecutionResult> {
        let workspace = self.builder.build(job_id, job).await?;
        let outcome = self
            .runner
            .run(job_id, &workspace, &job.resource_limits)
            .await?;
        let test_results = collector::read_test_results(&workspace.results_path()).await;
        workspace.remove().await;

        Ok(collector::collect(outcome, test_results))
    }
}

#[async_trait]
impl JobHandler for ExecutionWorker {
    async fn handle(&self, queue: &JobQueue, delivery: &Delivery) -> Result<()> {
        let submission_id = &delivery.job.submission_id;

        let result = match &delivery.checkpoint {
            Some(result) => {
                log::info!(
                    "Job {} already produced a {} result, reporting it again",
                    delivery.id,
                    result.status
                );
                result.clone()
            }
            None => {
                let result = self.execute(delivery.id, &delivery.job).await;
                log::info!(
                    "Submission {submission_id}: {} (exit code {}, {}ms)",
                    result.status,
                    result.exit_code,
                    result.duration_ms
                );
                log::debug!("stdout: {}", preview(&result.stdout, LOG_PREVIEW_CHARS));
                log::debug!("stderr: {}", preview(&result.stderr, LOG_PREVIEW_CHARS));

                if let Err(e) = queue.checkpoint(delivery.id, &result).await {
                    log::warn!("Failed to checkpoint job {}: {e:#}", delivery.id);
                }
                result
            }
        };

        self.reporter
            .report(submission_id, &result)
            .await
            .inspect_err(|e| log::error!("Failed to report submission {submission_id}: {e:#}"))
    }

    async fn on_panic(&self, delivery: &Delivery, message: &str) {
        let result = ExecutionResult::error(format!("internal error: {message}"), 0);
        if let Err(e) = self
            .reporter
            .report(&delivery.job.submission_id, &result)
            .await
        {
            log::warn!(
                "Failed to report the crash of submission {}: {e:#}",
                delivery.job.submission_id
            );
        }
    }
}
