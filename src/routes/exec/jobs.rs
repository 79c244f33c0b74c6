use super::*;

#[get("/exec/jobs/{job_id}")]
pub async fn get_job_state_handler(
    queue: web::Data<JobQueue>,
    path: web::Path<(String,)>,
) -> impl Responder {
    let raw_id = path.into_inner().0;
    let Ok(job_id) = uuid::Uuid::parse_str(&raw_id) else {
        return not_found(format!("Job {raw_id} not found."));
    };

    match queue.job_state(job_id).await {
        Ok(Some(state)) => HttpResponse::Ok().json(state),
        Ok(None) => not_found(format!("Job {job_id} not found.")),
        Err(e) => {
            log::error!("Failed to read state of job {job_id}: {e:#}");
            external_error()
        }
    }
}
