use std::path::Path;

use crate::job::{ExecutionResult, ExecutionStatus};
use crate::sandbox::RunOutcome;

/// Reads the test runner's JSON artifact
///
/// A missing file is normal (for example when the install step failed before
/// any test ran), so this never fails; it just yields `None`.
pub async fn read_test_results(path: &Path) -> Option<serde_json::Value> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            log::debug!("No test results at {}", path.display());
            return None;
        }
        Err(e) => {
            log::warn!("Failed to read test results at {}: {e}", path.display());
            return None;
        }
    };

    match serde_json::from_str(&content) {
        Ok(value) => Some(value),
        Err(e) => {
            log::warn!("Test results at {} are not valid JSON: {e}", path.display());
            None
        }
    }
}

/// Timeout first, then the exit code
pub fn classify(exit_code: i64, timed_out: bool) -> ExecutionStatus {
    if timed_out {
        ExecutionStatus::Timeout
    } else if exit_code == 0 {
        ExecutionStatus::Passed
    } else {
        ExecutionStatus::Failed
    }
}

pub fn collect(outcome: RunOutcome, test_results: Option<serde_json::Value>) -> ExecutionResult {
    ExecutionResult {
        status: classify(outcome.exit_code, outcome.timed_out),
        exit_code: outcome.exit_code,
        stdout: outcome.stdout,
        stderr: outcome.stderr,
        test_results,
        duration_ms: outcome.duration.as_millis() as u64,
    }
}
