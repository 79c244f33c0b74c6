use super::*;

#[get("/exec/status/{submission_id}")]
pub async fn get_status_handler(
    pool: web::Data<SqlitePool>,
    path: web::Path<(String,)>,
) -> impl Responder {
    let submission_id = path.into_inner().0;

    match db::fetch_submission(&submission_id, pool.get_ref()).await {
        Ok(record) => HttpResponse::Ok().json(StatusResponse {
            results: record.test_results_json(),
            status: record.status,
            test_status: record.test_status,
            stdout: record.stdout,
            stderr: record.stderr,
        }),
        Err(sqlx::Error::RowNotFound) => {
            log::info!("Got nothing with submission id {submission_id} from database");
            not_found(format!("Submission {submission_id} not found."))
        }
        Err(e) => {
            log::error!("Failed to retrieve submission from database: {e}");
            external_error()
        }
    }
}
