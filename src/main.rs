use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use exec_sandbox::config::{CliArgs, Config, load_projects};
use exec_sandbox::database as db;
use exec_sandbox::queue::{EXECUTION_KIND, JobQueue, QueueOptions};
use exec_sandbox::reporter::ResultReporter;
use exec_sandbox::sandbox::{DockerRuntime, SandboxRunner, SandboxSettings};
use exec_sandbox::web_server::build_server;
use exec_sandbox::worker::ExecutionWorker;
use exec_sandbox::workspace::WorkspaceBuilder;

async fn build_worker(config: &Config) -> anyhow::Result<ExecutionWorker> {
    let runtime = DockerRuntime::connect(&config.sandbox.docker_socket)?;
    if let Err(e) = runtime.check_image(&config.sandbox.image).await {
        log::warn!("Sandbox image check failed: {e:#}");
    }

    let root = match &config.sandbox.workspace_root {
        Some(root) => root.clone(),
        None => WorkspaceBuilder::default_root()?,
    };
    log::info!("Workspaces live under {}", root.display());

    let runner = SandboxRunner::new(Arc::new(runtime), SandboxSettings::from(&config.sandbox));
    let reporter = ResultReporter::new(
        &config.reporting.api_base_url,
        Duration::from_millis(config.reporting.timeout_ms),
    )?;

    Ok(ExecutionWorker::new(WorkspaceBuilder::new(root), runner, reporter))
}

/// Resolves when the task finishes, or never if there is no task
async fn finished<T>(task: Option<&mut JoinHandle<T>>) -> Result<T, JoinError> {
    match task {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = CliArgs::parse();
    let config = cli.to_config().context("Failed to load configuration")?;
    log::info!("Starting in {:?} role", cli.role);

    let queue_path = match &config.queue.database {
        Some(path) => path.clone(),
        None => db::get_queue_db_path()?,
    };
    let queue = Arc::new(
        JobQueue::open(&queue_path, EXECUTION_KIND, QueueOptions::from(&config.queue)).await?,
    );
    let shutdown_token = CancellationToken::new();

    // ======= PREPARATION END, EXECUTION START =======

    let mut consumer = None;
    if cli.role.runs_worker() {
        let worker = Arc::new(build_worker(&config).await?);
        consumer = Some(tokio::spawn(
            Arc::clone(&queue).consume(worker, shutdown_token.clone()),
        ));
    }

    let mut server = None;
    if cli.role.runs_api() {
        let db_path = match &config.database {
            Some(path) => path.clone(),
            None => db::get_db_path()?,
        };
        if cli.flush_data {
            db::remove_db(&db_path);
        }
        let db_pool = db::init_db(&db_path)
            .await
            .context("Failed to initialize database")?;

        let projects = load_projects(&config.projects, config.sandbox.default_limits)?;

        let http = build_server(config.server, db_pool, Arc::clone(&queue), projects)
            .context("Failed to build server")?;
        server = Some((http.handle(), actix_web::rt::spawn(http)));
    }

    // ===== EXECUTION END, WAITING FOR SHUTDOWN ======

    let (server_handle, mut server_task) = server.unzip();
    let mut consumer_exited = false;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Ctrl-c received, shutting down...");
        }
        res_server = finished(server_task.as_mut()) => {
            log::error!("Server terminated unexpectedly: {res_server:?}");
        }
        res_consumer = finished(consumer.as_mut()) => {
            log::error!("Queue consumer terminated unexpectedly: {res_consumer:?}");
            consumer_exited = true;
        }
    }

    // 1. Stop accepting submissions
    if let Some(handle) = server_handle {
        handle.stop(true).await;
    }

    // 2. Let every worker finish its current delivery
    shutdown_token.cancel();
    if let Some(consumer) = consumer.filter(|_| !consumer_exited) {
        log::info!("Shutdown signal sent to workers, waiting for them to finish...");
        match consumer.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::error!("Queue consumer finished with error: {e:#}"),
            Err(e) => log::error!("Queue consumer panicked: {e:?}"),
        }
    }

    // 3. Release the queue store
    queue.close().await;

    log::info!("Shutdown complete");
    Ok(())
}
