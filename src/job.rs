use std::collections::BTreeMap;
use std::path::{Component, Path};

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// Resource ceiling applied to one sandboxed execution
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    pub memory_mb: u64,
    #[serde(alias = "cpuShare")]
    pub cpus: f64,
    pub timeout_ms: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 512,
            cpus: 1.0,
            timeout_ms: 30_000,
        }
    }
}

/// Queue message describing one execution
///
/// Built once by the Execution Service and never mutated after it is enqueued.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionJob {
    pub submission_id: String,
    pub project_id: String,
    pub files: BTreeMap<String, String>,
    pub test_files: BTreeMap<String, String>,
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    pub resource_limits: ResourceLimits,
}

impl ExecutionJob {
    /// Rejects payloads a worker could never run
    pub fn validate(&self) -> Result<()> {
        if self.submission_id.trim().is_empty() {
            bail!("submissionId must not be empty");
        }
        if self.files.is_empty() {
            bail!("job for submission {} has no candidate files", self.submission_id);
        }
        for path in self.files.keys().chain(self.test_files.keys()) {
            validate_relative_path(path)?;
        }

        let limits = &self.resource_limits;
        if limits.memory_mb == 0 || limits.timeout_ms == 0 || !(limits.cpus > 0.0) {
            bail!("resource limits must be positive: {limits:?}");
        }

        Ok(())
    }
}

/// Checks that a workspace path stays inside the workspace
pub fn validate_relative_path(path: &str) -> Result<()> {
    if path.is_empty() {
        bail!("empty file path");
    }

    for component in Path::new(path).components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => bail!("file path {path:?} must be relative and must not leave the workspace"),
        }
    }

    Ok(())
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Passed,
    Failed,
    Timeout,
    Error,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final outcome of one job, as reported to the Execution Service
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub test_results: Option<serde_json::Value>,
    pub duration_ms: u64,
}

impl ExecutionResult {
    /// Result for a job that never produced a classifiable run
    pub fn error(message: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            status: ExecutionStatus::Error,
            exit_code: crate::sandbox::EXIT_CODE_UNKNOWN,
            stdout: String::new(),
            stderr: message.into(),
            test_results: None,
            duration_ms,
        }
    }
}

/// Shortens captured output for log lines
pub fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}... ({} bytes total)", &text[..idx], text.len()),
        None => text.to_string(),
    }
}
