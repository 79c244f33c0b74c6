use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

use crate::create_timestamp;
use crate::job::ExecutionStatus;

const DATABASE_NAME: &str = "exec-sandbox.sqlite3";
const QUEUE_DATABASE_NAME: &str = "exec-queue.sqlite3";

pub const TEST_STATUS_PENDING: &str = "pending";
pub const TEST_STATUS_COMPLETED: &str = "completed";

/// Status of a submission that has no terminal result yet
pub const STATUS_PENDING: &str = "pending";

fn data_dir() -> anyhow::Result<PathBuf> {
    use directories::ProjectDirs;

    let proj_dirs = ProjectDirs::from("", "", "exec-sandbox")
        .context("Unable to find user directory")?;
    let data_dir = proj_dirs.data_local_dir();

    fs::create_dir_all(data_dir).context("Failed to create local data dir")?;

    Ok(data_dir.to_path_buf())
}

pub fn get_db_path() -> anyhow::Result<PathBuf> {
    Ok(data_dir()?.join(DATABASE_NAME))
}

pub fn get_queue_db_path() -> anyhow::Result<PathBuf> {
    Ok(data_dir()?.join(QUEUE_DATABASE_NAME))
}

pub async fn init_db(db_path: impl AsRef<Path>) -> sqlx::Result<SqlitePool> {
    let db_url = format!("sqlite://{}?mode=rwc", db_path.as_ref().display()); // rwc = read/write/create
    let db_pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(0)
        .connect(&db_url)
        .await?;

    // PRAGMA statements cannot run inside a transaction
    for pragma_sql in &[
        "PRAGMA busy_timeout = 2000;",
        "PRAGMA journal_mode = WAL;",
        "PRAGMA synchronous = NORMAL;",
    ] {
        sqlx::query(pragma_sql).execute(&db_pool).await?;
    }

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS submissions (
            id             TEXT     PRIMARY KEY,
            assignment_id  TEXT     NOT NULL DEFAULT '',
            project_id     TEXT     NOT NULL DEFAULT '',
            files          TEXT     NOT NULL DEFAULT '{}',
            status         TEXT     NOT NULL,
            test_status    TEXT     NOT NULL,
            exit_code      INTEGER,
            stdout         TEXT,
            stderr         TEXT,
            test_results   TEXT,
            duration       INTEGER,
            created_time   TEXT     NOT NULL,
            updated_time   TEXT     NOT NULL
        );",
    )
    .execute(&db_pool)
    .await?;

    log::info!("Initialized database at {}", db_path.as_ref().display());

    Ok(db_pool)
}

pub fn remove_db(db_path: impl AsRef<Path>) {
    // Remove WAL and SHM files (ignore errors as they might not exist)
    let wal_path = format!("{}-wal", db_path.as_ref().display());
    let shm_path = format!("{}-shm", db_path.as_ref().display());
    let _ = fs::remove_file(wal_path);
    let _ = fs::remove_file(shm_path);

    if let Err(e) = fs::remove_file(&db_path) {
        log::warn!(
            "Unable to remove database at {}: {e}",
            db_path.as_ref().display()
        );
    } else {
        log::info!("Removed database at {}", db_path.as_ref().display());
    }
}

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct SubmissionRecord {
    pub id: String,
    pub assignment_id: String,
    pub project_id: String,
    pub files: String,
    pub status: String,
    pub test_status: String,
    pub exit_code: Option<i64>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub test_results: Option<String>,
    pub duration: Option<i64>,
    pub created_time: String,
    pub updated_time: String,
}

impl SubmissionRecord {
    pub fn candidate_files(&self) -> serde_json::Result<BTreeMap<String, String>> {
        serde_json::from_str(&self.files)
    }

    pub fn test_results_json(&self) -> Option<serde_json::Value> {
        self.test_results
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
    }
}

/// Terminal state written by the result endpoint
#[derive(Debug, Clone)]
pub struct TerminalResult {
    pub status: ExecutionStatus,
    pub exit_code: Option<i64>,
    pub stdout: String,
    pub stderr: String,
    pub test_results: Option<serde_json::Value>,
    pub duration_ms: Option<u64>,
}

/// Inserts a new submission in the `pending` state
pub async fn create_submission(
    id: &str,
    assignment_id: &str,
    project_id: &str,
    files: &BTreeMap<String, String>,
    pool: &SqlitePool,
) -> anyhow::Result<()> {
    let now = create_timestamp();

    sqlx::query(
        r"
        INSERT INTO submissions (id, assignment_id, project_id, files, status, test_status, created_time, updated_time)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ",
    )
    .bind(id)
    .bind(assignment_id)
    .bind(project_id)
    .bind(serde_json::to_string(files)?)
    .bind(STATUS_PENDING)
    .bind(TEST_STATUS_PENDING)
    .bind(&now)
    .bind(&now)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn fetch_submission(id: &str, pool: &SqlitePool) -> sqlx::Result<SubmissionRecord> {
    log::debug!("Trying to fetch submission {id} from database");

    sqlx::query_as::<_, SubmissionRecord>(
        r"
        SELECT id, assignment_id, project_id, files, status, test_status, exit_code,
               stdout, stderr, test_results, duration, created_time, updated_time
        FROM submissions
        WHERE id = ?
        ",
    )
    .bind(id)
    .fetch_one(pool)
    .await
}

/// Writes the terminal state of a submission, keyed by id
///
/// Repeated calls for the same id overwrite each other, so the last report
/// wins and no extra rows appear.
pub async fn upsert_result(
    id: &str,
    result: &TerminalResult,
    pool: &SqlitePool,
) -> anyhow::Result<()> {
    let now = create_timestamp();
    let test_results = result
        .test_results
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    sqlx::query(
        r"
        INSERT INTO submissions (id, status, test_status, exit_code, stdout, stderr, test_results, duration, created_time, updated_time)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            status       = excluded.status,
            test_status  = excluded.test_status,
            exit_code    = excluded.exit_code,
            stdout       = excluded.stdout,
            stderr       = excluded.stderr,
            test_results = excluded.test_results,
            duration     = excluded.duration,
            updated_time = excluded.updated_time
        ",
    )
    .bind(id)
    .bind(result.status.as_str())
    .bind(TEST_STATUS_COMPLETED)
    .bind(result.exit_code)
    .bind(&result.stdout)
    .bind(&result.stderr)
    .bind(test_results)
    .bind(result.duration_ms.map(|d| d as i64))
    .bind(&now)
    .bind(&now)
    .execute(pool)
    .await?;

    Ok(())
}

/// Clears the previous verdict before a submission is run again.
/// Returns false when the submission does not exist.
pub async fn reset_to_pending(id: &str, pool: &SqlitePool) -> sqlx::Result<bool> {
    let updated = sqlx::query(
        r"
        UPDATE submissions
        SET status = ?, test_status = ?, exit_code = NULL, stdout = NULL, stderr = NULL,
            test_results = NULL, duration = NULL, updated_time = ?
        WHERE id = ?
        ",
    )
    .bind(STATUS_PENDING)
    .bind(TEST_STATUS_PENDING)
    .bind(create_timestamp())
    .bind(id)
    .execute(pool)
    .await?
    .rows_affected();

    Ok(updated > 0)
}
