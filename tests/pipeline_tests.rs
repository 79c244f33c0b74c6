mod common;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use exec_sandbox::job::{ExecutionJob, ExecutionStatus};
use exec_sandbox::queue::JobQueue;
use exec_sandbox::reporter::ResultReporter;
use exec_sandbox::sandbox::demux::{Frame, StreamKind};
use exec_sandbox::sandbox::{MOUNT_POINT, SandboxRunner, SandboxSettings, WORK_DIR};
use exec_sandbox::worker::ExecutionWorker;
use exec_sandbox::workspace::WorkspaceBuilder;

use common::{
    FakeRuntime, KILLED_EXIT_CODE, Script, fast_queue_options, files, open_queue,
    read_workspace_file, sample_job, temp_dir,
};

const RESULTS_PATH: &str = "/exec/internal/results";

struct Pipeline {
    dir: TempDir,
    runtime: Arc<FakeRuntime>,
    worker: Arc<ExecutionWorker>,
}

impl Pipeline {
    fn new(runtime: Arc<FakeRuntime>, api_base_url: &str) -> Self {
        let dir = temp_dir();
        let settings = SandboxSettings {
            image: "exec-sandbox-runner:test".to_string(),
            user: Some("node".to_string()),
            pids_limit: 64,
            network_mode: "bridge".to_string(),
            max_output_bytes: 1 << 20,
        };
        let runner = SandboxRunner::new(runtime.clone(), settings);
        let reporter = ResultReporter::new(api_base_url, Duration::from_secs(2)).unwrap();
        let worker = ExecutionWorker::new(
            WorkspaceBuilder::new(dir.path().join("workspaces")),
            runner,
            reporter,
        );
        Self {
            dir,
            runtime,
            worker: Arc::new(worker),
        }
    }

    /// Pipeline whose reporter points nowhere; for tests that call `execute` directly
    fn offline(runtime: Arc<FakeRuntime>) -> Self {
        Self::new(runtime, "http://127.0.0.1:9")
    }

    fn leftover_workspaces(&self) -> usize {
        count_entries(&self.dir.path().join("workspaces"))
    }

    fn assert_cleaned_up(&self) {
        assert_eq!(self.leftover_workspaces(), 0, "workspace left behind");
        assert_eq!(self.runtime.live_containers(), 0, "sandbox left behind");
        let mut removed = self.runtime.removed.lock().clone();
        removed.sort();
        let mut created = self.runtime.created_ids();
        created.sort();
        assert_eq!(removed, created);
    }
}

fn count_entries(dir: &Path) -> usize {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries.count(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
        Err(e) => panic!("unable to list {}: {e}", dir.display()),
    }
}

fn job_with_timeout(submission_id: &str, timeout_ms: u64) -> ExecutionJob {
    let mut job = sample_job(submission_id);
    job.resource_limits.timeout_ms = timeout_ms;
    job
}

#[tokio::test]
async fn test_passing_tests_report_passed() {
    let pipeline = Pipeline::offline(FakeRuntime::always(Script::passing()));

    let result = pipeline
        .worker
        .execute(Uuid::new_v4(), &job_with_timeout("sub-a", 5000))
        .await;

    assert_eq!(result.status, ExecutionStatus::Passed);
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.stdout, "PASS src/App.test.js\n");
    let test_results = result.test_results.expect("test results should be collected");
    assert_eq!(test_results["numPassedTests"], 1);
    pipeline.assert_cleaned_up();
}

#[tokio::test]
async fn test_syntax_error_reports_failed() {
    let pipeline = Pipeline::offline(FakeRuntime::always(Script::syntax_error()));

    let result = pipeline
        .worker
        .execute(Uuid::new_v4(), &sample_job("sub-b"))
        .await;

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_ne!(result.exit_code, 0);
    assert!(result.stderr.contains("SyntaxError"));
    assert_eq!(result.test_results, None);
    pipeline.assert_cleaned_up();
}

#[tokio::test]
async fn test_infinite_loop_times_out() {
    let pipeline = Pipeline::offline(FakeRuntime::always(Script::infinite_loop()));

    let started = Instant::now();
    let result = pipeline
        .worker
        .execute(Uuid::new_v4(), &job_with_timeout("sub-c", 1000))
        .await;
    let elapsed = started.elapsed();

    assert_eq!(result.status, ExecutionStatus::Timeout);
    assert_eq!(result.exit_code, KILLED_EXIT_CODE);
    assert!(result.stdout.contains("still looping"), "partial output is kept");
    assert!(result.duration_ms >= 1000, "took {}ms", result.duration_ms);
    assert!(elapsed < Duration::from_millis(2500), "took {elapsed:?}");
    assert_eq!(pipeline.runtime.stopped.lock().len(), 1);
    pipeline.assert_cleaned_up();
}

#[tokio::test]
async fn test_stop_is_skipped_when_sandbox_already_exited() {
    let mut script = Script::passing();
    script.runs_for = Duration::from_millis(1300);
    let runtime = FakeRuntime::always(script);
    runtime
        .reports_exited
        .store(true, std::sync::atomic::Ordering::SeqCst);
    let pipeline = Pipeline::offline(runtime);

    let result = pipeline
        .worker
        .execute(Uuid::new_v4(), &job_with_timeout("sub-exited", 1000))
        .await;

    assert_eq!(result.status, ExecutionStatus::Timeout);
    assert!(pipeline.runtime.stopped.lock().is_empty(), "no stop for an exited sandbox");
    pipeline.assert_cleaned_up();
}

#[tokio::test]
async fn test_install_step_only_for_extra_dependencies() {
    let pipeline = Pipeline::offline(FakeRuntime::always(Script::passing()));

    let plain = sample_job("sub-d");
    assert!(plain.dependencies.is_empty());
    pipeline.worker.execute(Uuid::new_v4(), &plain).await;

    let mut base_only = sample_job("sub-d-base");
    base_only
        .dependencies
        .insert("react".to_string(), "^18.2.0".to_string());
    pipeline.worker.execute(Uuid::new_v4(), &base_only).await;

    let mut extra = sample_job("sub-d-extra");
    extra
        .dependencies
        .insert("lodash".to_string(), "^4.17.21".to_string());
    pipeline.worker.execute(Uuid::new_v4(), &extra).await;

    let created = pipeline.runtime.created.lock().clone();
    let scripts: Vec<&str> = created.iter().map(|spec| spec.command[2].as_str()).collect();
    assert!(!scripts[0].contains("npm install"));
    assert!(!scripts[1].contains("npm install"));
    assert!(scripts[2].contains("npm install"));
    for script in scripts {
        assert!(script.contains("npx jest"));
    }
    pipeline.assert_cleaned_up();
}

#[tokio::test]
async fn test_sandbox_gets_the_job_limits_and_workspace() {
    let runtime = FakeRuntime::new(|spec| {
        let manifest: Value =
            serde_json::from_str(&read_workspace_file(spec, "package.json")).unwrap_or_default();
        let mut script = Script::passing();
        script.frames = vec![Frame::new(
            StreamKind::Stdout,
            format!(
                "jest={} config={}\n",
                manifest["devDependencies"]["jest"],
                !read_workspace_file(spec, "jest.config.js").is_empty()
            ),
        )];
        script
    });
    let pipeline = Pipeline::offline(runtime);
    let job_id = Uuid::new_v4();

    let mut job = sample_job("sub-limits");
    job.resource_limits.memory_mb = 128;
    job.resource_limits.cpus = 0.25;
    let result = pipeline.worker.execute(job_id, &job).await;
    assert_eq!(result.stdout, "jest=\"^29.7.0\" config=true\n");

    let spec = pipeline.runtime.created.lock()[0].clone();
    assert_eq!(spec.limits, job.resource_limits);
    assert_eq!(spec.user.as_deref(), Some("node"));
    assert_eq!(spec.mount_point, MOUNT_POINT);
    assert_eq!(spec.working_dir, WORK_DIR);
    assert_eq!(spec.pids_limit, 64);
    assert_eq!(spec.labels.get("exec-sandbox.job"), Some(&job_id.to_string()));
    assert_eq!(spec.workspace, pipeline.dir.path().join("workspaces").join(format!("job-{job_id}")));
    pipeline.assert_cleaned_up();
}

#[tokio::test]
async fn test_sandbox_creation_failure_is_an_error_result() {
    let runtime = FakeRuntime::always(Script::passing());
    runtime
        .fail_create
        .store(true, std::sync::atomic::Ordering::SeqCst);
    let pipeline = Pipeline::offline(runtime);

    let result = pipeline
        .worker
        .execute(Uuid::new_v4(), &sample_job("sub-e"))
        .await;

    assert_eq!(result.status, ExecutionStatus::Error);
    assert!(result.stderr.contains("not found"), "stderr: {}", result.stderr);
    pipeline.assert_cleaned_up();
}

#[tokio::test]
async fn test_concurrent_jobs_are_isolated() {
    let runtime = FakeRuntime::new(|spec| {
        let mut script = Script::passing();
        script.frames = vec![Frame::new(
            StreamKind::Stdout,
            read_workspace_file(spec, "src/App.js"),
        )];
        script.runs_for = Duration::from_millis(200);
        script
    });
    let pipeline = Pipeline::offline(runtime);

    let mut first = sample_job("sub-1");
    first.files = files(&[("src/App.js", "first candidate")]);
    let mut second = sample_job("sub-2");
    second.files = files(&[("src/App.js", "second candidate")]);

    let (a, b) = tokio::join!(
        pipeline.worker.execute(Uuid::new_v4(), &first),
        pipeline.worker.execute(Uuid::new_v4(), &second),
    );

    assert_eq!(a.stdout, "first candidate");
    assert_eq!(b.stdout, "second candidate");
    pipeline.assert_cleaned_up();
}

async fn run_consumer(
    pipeline: &Pipeline,
    queue: &Arc<JobQueue>,
    job: &ExecutionJob,
    terminal_state: &str,
) -> exec_sandbox::queue::JobState {
    let token = CancellationToken::new();
    let consumer = tokio::spawn(Arc::clone(queue).consume(Arc::clone(&pipeline.worker), token.clone()));

    let id = queue.enqueue(job).await.unwrap();
    let mut state = None;
    for _ in 0..250 {
        let current = queue.job_state(id).await.unwrap().unwrap();
        if current.state == terminal_state {
            state = Some(current);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    token.cancel();
    consumer.await.unwrap().unwrap();
    state.unwrap_or_else(|| panic!("job {id} never reached {terminal_state}"))
}

#[tokio::test]
async fn test_worker_reports_the_result() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(RESULTS_PATH))
        .and(body_partial_json(json!({
            "submissionId": "sub-report",
            "status": "passed",
            "exitCode": 0,
            "stdout": "PASS src/App.test.js\n",
            "testResults": {"success": true}
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let pipeline = Pipeline::new(FakeRuntime::always(Script::passing()), &server.uri());
    let queue = open_queue(pipeline.dir.path(), fast_queue_options()).await;

    let state = run_consumer(&pipeline, &queue, &sample_job("sub-report"), "completed").await;
    assert_eq!(state.attempts, 1);

    let requests = server.received_requests().await.unwrap();
    let body: Value = requests[0].body_json().unwrap();
    assert!(body["durationMs"].as_u64().is_some());
    server.verify().await;
    pipeline.assert_cleaned_up();
}

#[tokio::test]
async fn test_reporting_failure_retries_without_rerunning() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(RESULTS_PATH))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(RESULTS_PATH))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let pipeline = Pipeline::new(FakeRuntime::always(Script::syntax_error()), &server.uri());
    let queue = open_queue(pipeline.dir.path(), fast_queue_options()).await;

    let state = run_consumer(&pipeline, &queue, &sample_job("sub-retry"), "completed").await;
    assert_eq!(state.attempts, 2);
    assert_eq!(pipeline.runtime.created.lock().len(), 1, "sandbox ran once");

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    let first: Value = requests[0].body_json().unwrap();
    let second: Value = requests[1].body_json().unwrap();
    assert_eq!(first, second);
    assert_eq!(second["status"], "failed");
    pipeline.assert_cleaned_up();
}

#[tokio::test]
async fn test_unreachable_endpoint_exhausts_retries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(RESULTS_PATH))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    let pipeline = Pipeline::new(FakeRuntime::always(Script::passing()), &server.uri());
    let queue = open_queue(pipeline.dir.path(), fast_queue_options()).await;

    let state = run_consumer(&pipeline, &queue, &sample_job("sub-dead"), "failed").await;
    assert_eq!(state.attempts, 3);
    assert!(state.last_error.unwrap().contains("500"));
    assert_eq!(pipeline.runtime.created.lock().len(), 1);
    server.verify().await;
    pipeline.assert_cleaned_up();
}

#[tokio::test]
async fn test_harness_configuration_wins_over_candidate_files() {
    let runtime = FakeRuntime::new(|spec| {
        let mut script = Script::passing();
        script.frames = vec![Frame::new(
            StreamKind::Stdout,
            read_workspace_file(spec, "jest.config.js"),
        )];
        script
    });
    let pipeline = Pipeline::offline(runtime);

    let mut job = sample_job("sub-override");
    job.files
        .insert("jest.config.js".to_string(), "module.exports = { bail: true };".to_string());
    job.dependencies = BTreeMap::from([("jest".to_string(), "1.0.0".to_string())]);
    let result = pipeline.worker.execute(Uuid::new_v4(), &job).await;

    assert!(result.stdout.contains("testEnvironment: 'jsdom'"));
    assert!(!result.stdout.contains("bail"));
    // A pinned tooling version is ignored, so nothing has to be installed
    let script = pipeline.runtime.created.lock()[0].command[2].clone();
    assert!(!script.contains("npm install"));
}
