use super::*;

#[post("/exec/internal/results")]
pub async fn report_result_handler(
    pool: web::Data<SqlitePool>,
    body: web::Json<ResultReportRequest>,
) -> impl Responder {
    let report = body.into_inner();

    let Some(submission_id) = report.submission_id.filter(|id| !id.trim().is_empty()) else {
        return invalid_argument("submissionId is required.");
    };
    let Some(status) = report.status else {
        return invalid_argument("status is required.");
    };

    let result = db::TerminalResult {
        status,
        exit_code: report.exit_code,
        stdout: report.stdout,
        stderr: report.stderr,
        test_results: report.test_results,
        duration_ms: report.duration_ms,
    };

    match db::upsert_result(&submission_id, &result, pool.get_ref()).await {
        Ok(()) => {
            log::info!("Stored {status} result for submission {submission_id}");
            HttpResponse::Ok().json(serde_json::json!({
                "message": "Result stored",
                "submissionId": submission_id,
            }))
        }
        Err(e) => {
            log::error!("Failed to store result of submission {submission_id}: {e:#}");
            external_error()
        }
    }
}
