use super::*;

fn required(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

#[post("/exec/submit")]
pub async fn submit_handler(
    queue: web::Data<JobQueue>,
    pool: web::Data<SqlitePool>,
    projects: web::Data<ProjectCatalog>,
    body: web::Json<SubmitRequest>,
) -> impl Responder {
    let SubmitRequest {
        assignment_id,
        files,
        project_id,
    } = body.into_inner();

    let (Some(assignment_id), Some(files), Some(project_id)) = (
        required(assignment_id),
        files.filter(|f| !f.is_empty()),
        required(project_id),
    ) else {
        return invalid_argument("assignmentId, files and projectId are required.");
    };

    let Some(harness) = projects.get(&project_id) else {
        log::info!("Rejected submission for unknown project {project_id}");
        return not_found(format!("Project {project_id} not found."));
    };

    let submission_id = uuid::Uuid::new_v4().to_string();
    let job = build_job(&submission_id, harness, files);
    if let Err(e) = job.validate() {
        return invalid_argument(format!("{e:#}"));
    }

    if let Err(e) = db::create_submission(
        &submission_id,
        &assignment_id,
        &project_id,
        &job.files,
        pool.get_ref(),
    )
    .await
    {
        log::error!("Failed to insert submission into database: {e:#}");
        return external_error();
    }
    log::info!("Inserted submission {submission_id} for assignment {assignment_id}");

    enqueue_submission(job, queue.get_ref(), pool.get_ref(), "Submission accepted").await
}

/// Enqueues an already persisted submission and answers 202
///
/// If the queue refuses the job the submission is closed with an `error`
/// result, so that pollers never wait on a job that does not exist.
pub(super) async fn enqueue_submission(
    job: ExecutionJob,
    queue: &JobQueue,
    pool: &SqlitePool,
    message: &str,
) -> HttpResponse {
    match queue.enqueue(&job).await {
        Ok(job_id) => {
            log::info!("Queued job {job_id} for submission {}", job.submission_id);
            HttpResponse::Accepted().json(AcceptedResponse {
                message: message.to_string(),
                submission_id: job.submission_id,
                job_id: job_id.to_string(),
            })
        }
        Err(e) => {
            log::error!("Failed to enqueue submission {}: {e:#}", job.submission_id);
            let closed = db::TerminalResult {
                status: ExecutionStatus::Error,
                exit_code: None,
                stdout: String::new(),
                stderr: format!("failed to enqueue: {e:#}"),
                test_results: None,
                duration_ms: None,
            };
            if let Err(e) = db::upsert_result(&job.submission_id, &closed, pool).await {
                log::error!("Failed to close submission {}: {e:#}", job.submission_id);
            }
            external_error()
        }
    }
}
