use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::create_timestamp;
use crate::job::{ExecutionJob, ExecutionResult};

/// Queue kind consumed by the sandbox workers
pub const EXECUTION_KIND: &str = "execution";

#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub concurrency: usize,
    pub max_attempts: u32,
    pub backoff: Duration,
    pub poll_interval: Duration,
    /// How long a claimed job stays reserved without a heartbeat
    pub lease: Duration,
}

impl From<&QueueConfig> for QueueOptions {
    fn from(config: &QueueConfig) -> Self {
        Self {
            concurrency: config.concurrency,
            max_attempts: config.max_attempts,
            backoff: Duration::from_millis(config.backoff_ms),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            lease: Duration::from_millis(config.lease_ms),
        }
    }
}

/// One delivery attempt of a queued job
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: Uuid,
    /// 1 for the first delivery, incremented on every redelivery
    pub attempt: u32,
    pub job: ExecutionJob,
    /// Result saved by an earlier attempt that got as far as reporting
    pub checkpoint: Option<ExecutionResult>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JobState {
    pub id: String,
    pub state: String,
    pub attempts: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum FailOutcome {
    Retrying { delay: Duration },
    Dead,
}

/// Work performed for each delivery
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, queue: &JobQueue, delivery: &Delivery) -> Result<()>;

    /// Called when `handle` panicked, before the job is marked failed
    async fn on_panic(&self, _delivery: &Delivery, _message: &str) {}
}

#[derive(sqlx::FromRow)]
struct ClaimedRow {
    id: String,
    payload: String,
    attempts: i64,
    checkpoint: Option<String>,
}

/// Durable at-least-once FIFO queue stored in SQLite
///
/// Jobs of one `kind` are delivered oldest first. A job stays `active` while a
/// worker holds it and keeps renewing its lease. Once the lease runs out
/// (the process died) it is delivered again.
pub struct JobQueue {
    pool: SqlitePool,
    kind: String,
    options: QueueOptions,
    notify: Notify,
}

impl JobQueue {
    pub async fn open(path: impl AsRef<Path>, kind: &str, options: QueueOptions) -> Result<Self> {
        let url = format!("sqlite://{}", path.as_ref().display());
        let connect_options = SqliteConnectOptions::from_str(&url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await
            .with_context(|| format!("Failed to open queue store {}", path.as_ref().display()))?;

        let queue = Self::with_pool(pool, kind, options).await?;
        log::info!(
            "Opened {kind} queue at {} (concurrency {})",
            path.as_ref().display(),
            queue.options.concurrency
        );
        Ok(queue)
    }

    pub async fn with_pool(pool: SqlitePool, kind: &str, options: QueueOptions) -> Result<Self> {
        for sql in [
            r"
            CREATE TABLE IF NOT EXISTS queue_jobs (
                seq           INTEGER  PRIMARY KEY AUTOINCREMENT,
                id            TEXT     NOT NULL UNIQUE,
                kind          TEXT     NOT NULL,
                payload       TEXT     NOT NULL,
                state         TEXT     NOT NULL,
                attempts      INTEGER  NOT NULL DEFAULT 0,
                max_attempts  INTEGER  NOT NULL,
                run_at        INTEGER  NOT NULL,
                leased_until  INTEGER  NOT NULL DEFAULT 0,
                last_error    TEXT,
                checkpoint    TEXT,
                created_time  TEXT     NOT NULL,
                updated_time  TEXT     NOT NULL
            );",
            "CREATE INDEX IF NOT EXISTS idx_queue_jobs_due ON queue_jobs(kind, state, run_at, seq);",
        ] {
            sqlx::query(sql).execute(&pool).await?;
        }

        Ok(Self {
            pool,
            kind: kind.to_string(),
            options,
            notify: Notify::new(),
        })
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    pub async fn close(&self) {
        self.pool.close().await;
        log::info!("Closed {} queue", self.kind);
    }

    /// Validates and stores a job, returning its queue id
    pub async fn enqueue(&self, job: &ExecutionJob) -> Result<Uuid> {
        job.validate().context("Rejected malformed job payload")?;

        let id = Uuid::new_v4();
        let payload = serde_json::to_string(job)?;
        let now = create_timestamp();

        sqlx::query(
            r"
            INSERT INTO queue_jobs (id, kind, payload, state, attempts, max_attempts, run_at, created_time, updated_time)
            VALUES (?, ?, ?, 'queued', 0, ?, ?, ?, ?)
            ",
        )
        .bind(id.to_string())
        .bind(&self.kind)
        .bind(payload)
        .bind(self.options.max_attempts as i64)
        .bind(now_ms())
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.notify.notify_one();
        log::debug!("Enqueued {} job {id} for submission {}", self.kind, job.submission_id);
        Ok(id)
    }

    /// Moves the oldest due job to `active` and hands it out
    pub async fn claim(&self) -> Result<Option<Delivery>> {
        loop {
            let row = sqlx::query_as::<_, ClaimedRow>(
                r"
                UPDATE queue_jobs
                SET state = 'active', attempts = attempts + 1, leased_until = ?, updated_time = ?
                WHERE seq = (
                    SELECT seq FROM queue_jobs
                    WHERE kind = ? AND (
                        (state = 'queued' AND run_at <= ?)
                        OR (state = 'active' AND leased_until <= ?)
                    )
                    ORDER BY run_at, seq
                    LIMIT 1
                )
                RETURNING id, payload, attempts, checkpoint
                ",
            )
            .bind(self.lease_deadline())
            .bind(create_timestamp())
            .bind(&self.kind)
            .bind(now_ms())
            .bind(now_ms())
            .fetch_optional(&self.pool)
            .await?;

            let Some(row) = row else {
                return Ok(None);
            };

            let id = Uuid::parse_str(&row.id)?;
            let job = match serde_json::from_str::<ExecutionJob>(&row.payload)
                .map_err(anyhow::Error::from)
                .and_then(|job| job.validate().map(|_| job))
            {
                Ok(job) => job,
                Err(e) => {
                    log::error!("Discarding malformed job {id}: {e:#}");
                    self.mark_dead(id, &format!("malformed payload: {e:#}")).await?;
                    continue;
                }
            };

            let checkpoint = match row
                .checkpoint
                .as_deref()
                .map(serde_json::from_str::<ExecutionResult>)
            {
                Some(Ok(result)) => Some(result),
                Some(Err(e)) => {
                    log::warn!("Ignoring unreadable checkpoint of job {id}: {e}");
                    None
                }
                None => None,
            };

            return Ok(Some(Delivery {
                id,
                attempt: row.attempts as u32,
                job,
                checkpoint,
            }));
        }
    }

    /// Waits for the next delivery, or `None` once `token` is cancelled
    pub async fn next(&self, token: &CancellationToken) -> Option<Delivery> {
        loop {
            if token.is_cancelled() {
                return None;
            }
            match self.claim().await {
                Ok(Some(delivery)) => return Some(delivery),
                Ok(None) => {}
                Err(e) => log::error!("Failed to claim a {} job: {e:#}", self.kind),
            }

            tokio::select! {
                _ = token.cancelled() => return None,
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(self.options.poll_interval) => {}
            }
        }
    }

    fn lease_deadline(&self) -> i64 {
        now_ms() + self.options.lease.as_millis() as i64
    }

    /// Extends the lease of a job this process is still working on
    pub async fn renew_lease(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE queue_jobs SET leased_until = ? WHERE id = ? AND state = 'active'")
            .bind(self.lease_deadline())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn complete(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE queue_jobs SET state = 'completed', last_error = NULL, updated_time = ? WHERE id = ?",
        )
        .bind(create_timestamp())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Records a failed attempt, re-queueing with exponential backoff while
    /// attempts remain
    pub async fn fail(&self, id: Uuid, attempt: u32, error: &str) -> Result<FailOutcome> {
        if attempt >= self.options.max_attempts {
            self.mark_dead(id, error).await?;
            return Ok(FailOutcome::Dead);
        }

        let delay = self.backoff_delay(attempt);
        sqlx::query(
            r"
            UPDATE queue_jobs
            SET state = 'queued', run_at = ?, last_error = ?, updated_time = ?
            WHERE id = ?
            ",
        )
        .bind(now_ms() + delay.as_millis() as i64)
        .bind(error)
        .bind(create_timestamp())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(FailOutcome::Retrying { delay })
    }

    /// Delay before retrying after the given attempt failed
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.options
            .backoff
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
    }

    async fn mark_dead(&self, id: Uuid, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE queue_jobs SET state = 'failed', last_error = ?, updated_time = ? WHERE id = ?",
        )
        .bind(error)
        .bind(create_timestamp())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Saves a finished result so a redelivery can skip straight to reporting
    pub async fn checkpoint(&self, id: Uuid, result: &ExecutionResult) -> Result<()> {
        sqlx::query("UPDATE queue_jobs SET checkpoint = ?, updated_time = ? WHERE id = ?")
            .bind(serde_json::to_string(result)?)
            .bind(create_timestamp())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Puts jobs whose lease ran out back in line. Jobs a live consumer is
    /// still renewing are left alone.
    pub async fn recover_abandoned(&self) -> Result<u64> {
        let recovered = sqlx::query(
            r"
            UPDATE queue_jobs SET state = 'queued', updated_time = ?
            WHERE kind = ? AND state = 'active' AND leased_until <= ?
            ",
        )
        .bind(create_timestamp())
        .bind(&self.kind)
        .bind(now_ms())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if recovered > 0 {
            log::warn!("Re-queued {recovered} abandoned {} job(s)", self.kind);
            self.notify.notify_one();
        }
        Ok(recovered)
    }

    pub async fn job_state(&self, id: Uuid) -> Result<Option<JobState>> {
        #[derive(sqlx::FromRow)]
        struct StateRow {
            state: String,
            attempts: i64,
            last_error: Option<String>,
        }

        let row = sqlx::query_as::<_, StateRow>(
            "SELECT state, attempts, last_error FROM queue_jobs WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| JobState {
            id: id.to_string(),
            state: row.state,
            attempts: row.attempts as u32,
            last_error: row.last_error,
        }))
    }

    /// Runs `concurrency` workers until `token` is cancelled
    ///
    /// Each worker finishes its current delivery before stopping.
    pub async fn consume<H: JobHandler>(
        self: Arc<Self>,
        handler: Arc<H>,
        token: CancellationToken,
    ) -> Result<()> {
        self.recover_abandoned().await?;

        let mut workers = JoinSet::new();
        for worker_id in 1..=self.options.concurrency {
            workers.spawn(worker_loop(
                worker_id,
                Arc::clone(&self),
                Arc::clone(&handler),
                token.clone(),
            ));
        }

        while let Some(res) = workers.join_next().await {
            if let Err(e) = res {
                log::error!("Queue worker terminated abnormally: {e:?}");
            }
        }

        log::info!("All {} workers have shut down", self.kind);
        Ok(())
    }
}

async fn worker_loop<H: JobHandler>(
    worker_id: usize,
    queue: Arc<JobQueue>,
    handler: Arc<H>,
    token: CancellationToken,
) {
    log::info!("Worker {worker_id} initialized");

    while let Some(delivery) = queue.next(&token).await {
        log::info!(
            "Worker {worker_id} got job {} (submission {}, attempt {})",
            delivery.id,
            delivery.job.submission_id,
            delivery.attempt
        );
        process_delivery(&queue, &handler, delivery).await;
    }

    log::info!("Worker {worker_id} has shut down gracefully");
}

async fn process_delivery<H: JobHandler>(queue: &Arc<JobQueue>, handler: &Arc<H>, delivery: Delivery) {
    let job_id = delivery.id;
    let attempt = delivery.attempt;

    let task = {
        let queue = Arc::clone(queue);
        let handler = Arc::clone(handler);
        let delivery = delivery.clone();
        tokio::spawn(async move { handler.handle(&queue, &delivery).await })
    };

    let heartbeat = {
        let queue = Arc::clone(queue);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(
                (queue.options.lease / 3).max(Duration::from_millis(1)),
            );
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = queue.renew_lease(job_id).await {
                    log::warn!("Failed to renew the lease of job {job_id}: {e:#}");
                }
            }
        })
    };

    let outcome = task.await;
    heartbeat.abort();

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(e) if e.is_panic() => {
            let message = panic_message(e.into_panic());
            log::error!("Handler panicked on job {job_id}: {message}");
            handler.on_panic(&delivery, &message).await;
            Err(anyhow!("handler panicked: {message}"))
        }
        Err(e) => Err(anyhow!("handler task was cancelled: {e}")),
    };

    let bookkeeping = match outcome {
        Ok(()) => queue.complete(job_id).await.map(|_| log::info!("Job {job_id} completed")),
        Err(e) => {
            log::error!("Job {job_id} failed on attempt {attempt}: {e:#}");
            queue.fail(job_id, attempt, &format!("{e:#}")).await.map(|outcome| match outcome {
                FailOutcome::Retrying { delay } => {
                    log::info!("Job {job_id} will be retried in {}ms", delay.as_millis())
                }
                FailOutcome::Dead => log::error!("Job {job_id} exhausted its attempts"),
            })
        }
    };

    if let Err(e) = bookkeeping {
        log::error!("Failed to record the outcome of job {job_id}: {e:#}");
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
