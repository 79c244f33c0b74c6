use super::*;

#[post("/exec/rerun/{submission_id}")]
pub async fn rerun_handler(
    queue: web::Data<JobQueue>,
    pool: web::Data<SqlitePool>,
    projects: web::Data<ProjectCatalog>,
    path: web::Path<(String,)>,
) -> impl Responder {
    let submission_id = path.into_inner().0;

    let record = match db::fetch_submission(&submission_id, pool.get_ref()).await {
        Ok(record) => record,
        Err(sqlx::Error::RowNotFound) => {
            log::info!("Rerun ignored because submission {submission_id} was not found");
            return not_found(format!("Submission {submission_id} not found."));
        }
        Err(e) => {
            log::error!("Failed to retrieve submission from database: {e}");
            return external_error();
        }
    };

    let Some(harness) = projects.get(&record.project_id) else {
        log::info!(
            "Rerun ignored because project {} of submission {submission_id} no longer exists",
            record.project_id
        );
        return not_found(format!("Project {} not found.", record.project_id));
    };

    let files = match record.candidate_files() {
        Ok(files) => files,
        Err(e) => {
            log::error!("Stored files of submission {submission_id} are unreadable: {e}");
            return external_error();
        }
    };
    let job = build_job(&submission_id, harness, files);

    match db::reset_to_pending(&submission_id, pool.get_ref()).await {
        Ok(true) => {}
        Ok(false) => return not_found(format!("Submission {submission_id} not found.")),
        Err(e) => {
            log::error!("Failed to reset submission {submission_id}: {e}");
            return external_error();
        }
    }

    super::submit::enqueue_submission(job, queue.get_ref(), pool.get_ref(), "Rerun accepted").await
}
