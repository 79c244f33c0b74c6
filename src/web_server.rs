use std::sync::Arc;

use actix_web::{App, HttpServer, dev::Server, middleware, web};
use sqlx::sqlite::SqlitePool;

use crate::config::{ProjectCatalog, ServerConfig};
use crate::queue::JobQueue;
use crate::routes::{
    get_job_state_handler, get_status_handler, json_error_handler, report_result_handler,
    rerun_handler, submit_handler,
};

/// Registers the Execution Service routes on an app
///
/// Shared by the real server and the integration tests.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::JsonConfig::default().error_handler(json_error_handler))
        .service(submit_handler)
        .service(get_status_handler)
        .service(report_result_handler)
        .service(rerun_handler)
        .service(get_job_state_handler);
}

pub fn build_server(
    server_config: ServerConfig,
    db_pool: SqlitePool,
    queue: Arc<JobQueue>,
    projects: ProjectCatalog,
) -> std::io::Result<Server> {
    let db_pool = web::Data::new(db_pool);
    let queue = web::Data::from(queue);
    let projects = web::Data::new(projects);

    let bind_address = server_config
        .bind_address
        .unwrap_or("127.0.0.1".to_string());
    let bind_port = server_config.bind_port.unwrap_or(12345);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(db_pool.clone())
            .app_data(queue.clone())
            .app_data(projects.clone())
            .wrap(middleware::Logger::default())
            .configure(configure)
    })
    .bind((bind_address.as_str(), bind_port))?
    .run();

    log::info!("Execution Service listening on {bind_address}:{bind_port}");
    Ok(server)
}
