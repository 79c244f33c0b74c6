mod jobs;
mod rerun;
mod results;
mod status;
mod submit;

pub use jobs::get_job_state_handler;
pub use rerun::rerun_handler;
pub use results::report_result_handler;
pub use status::get_status_handler;
pub use submit::submit_handler;

use std::collections::BTreeMap;

use actix_web::{HttpResponse, Responder, get, post, web};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;

use super::{external_error, invalid_argument, not_found};
use crate::config::{ProjectCatalog, ProjectHarness};
use crate::database as db;
use crate::job::{ExecutionJob, ExecutionStatus};
use crate::queue::JobQueue;

/// Candidate manifest whose `dependencies` are merged over the project's
const CANDIDATE_MANIFEST: &str = "package.json";

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub assignment_id: Option<String>,
    pub files: Option<BTreeMap<String, String>>,
    pub project_id: Option<String>,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AcceptedResponse {
    pub message: String,
    pub submission_id: String,
    pub job_id: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct StatusResponse {
    pub status: String,
    pub test_status: String,
    pub results: Option<serde_json::Value>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ResultReportRequest {
    pub submission_id: Option<String>,
    pub status: Option<ExecutionStatus>,
    pub exit_code: Option<i64>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    pub test_results: Option<serde_json::Value>,
    pub duration_ms: Option<u64>,
}

/// Dependencies the project declares, overlaid with the ones the candidate
/// declares in its own manifest
fn declared_dependencies(
    harness: &ProjectHarness,
    files: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut dependencies = harness.dependencies.clone();

    let Some(manifest) = files.get(CANDIDATE_MANIFEST) else {
        return dependencies;
    };
    match serde_json::from_str::<serde_json::Value>(manifest) {
        Ok(manifest) => {
            if let Some(declared) = manifest.get("dependencies").and_then(|d| d.as_object()) {
                for (name, version) in declared {
                    if let Some(version) = version.as_str() {
                        dependencies.insert(name.clone(), version.to_string());
                    }
                }
            }
        }
        Err(e) => log::warn!("Ignoring unreadable candidate {CANDIDATE_MANIFEST}: {e}"),
    }

    dependencies
}

fn build_job(
    submission_id: &str,
    harness: &ProjectHarness,
    files: BTreeMap<String, String>,
) -> ExecutionJob {
    ExecutionJob {
        submission_id: submission_id.to_string(),
        project_id: harness.id.clone(),
        dependencies: declared_dependencies(harness, &files),
        files,
        test_files: harness.test_files.clone(),
        resource_limits: harness.resource_limits,
    }
}
