#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream;
use parking_lot::Mutex;
use serde_json::{Value, json};
use sqlx::sqlite::SqlitePool;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use exec_sandbox::database as db;
use exec_sandbox::job::{ExecutionJob, ResourceLimits};
use exec_sandbox::queue::{EXECUTION_KIND, JobQueue, QueueOptions};
use exec_sandbox::sandbox::demux::{Frame, StreamKind};
use exec_sandbox::sandbox::{ContainerRuntime, ContainerSpec, FrameStream};

/// Exit code the fake engine reports for a killed sandbox
pub const KILLED_EXIT_CODE: i64 = 137;

/// What one fake sandbox does once started
#[derive(Debug, Clone)]
pub struct Script {
    pub frames: Vec<Frame>,
    pub exit_code: i64,
    pub runs_for: Duration,
    /// Written to the workspace as the test runner artifact on a normal exit
    pub results: Option<Value>,
}

impl Script {
    pub fn passing() -> Self {
        Self {
            frames: vec![Frame::new(StreamKind::Stdout, "PASS src/App.test.js\n")],
            exit_code: 0,
            runs_for: Duration::from_millis(50),
            results: Some(json!({
                "success": true,
                "numTotalTests": 1,
                "numPassedTests": 1,
                "numFailedTests": 0,
            })),
        }
    }

    pub fn syntax_error() -> Self {
        Self {
            frames: vec![
                Frame::new(StreamKind::Stdout, "FAIL src/App.test.js\n"),
                Frame::new(
                    StreamKind::Stderr,
                    "SyntaxError: src/App.test.js: Unexpected token (3:14)\n",
                ),
            ],
            exit_code: 1,
            runs_for: Duration::from_millis(50),
            results: None,
        }
    }

    /// Prints something, then never exits on its own
    pub fn infinite_loop() -> Self {
        Self {
            frames: vec![Frame::new(StreamKind::Stdout, "still looping\n")],
            exit_code: 0,
            runs_for: Duration::from_secs(3600),
            results: None,
        }
    }
}

type Behavior = Box<dyn Fn(&ContainerSpec) -> Script + Send + Sync>;

struct FakeContainer {
    spec: ContainerSpec,
    script: Script,
    stopped: CancellationToken,
    exited: CancellationToken,
}

/// In-memory container engine that follows a scripted behavior
pub struct FakeRuntime {
    behavior: Behavior,
    next_id: AtomicU32,
    containers: Mutex<HashMap<String, Arc<FakeContainer>>>,
    pub fail_create: AtomicBool,
    /// Makes `is_running` answer false even while `wait` is still pending
    pub reports_exited: AtomicBool,
    pub created: Mutex<Vec<ContainerSpec>>,
    pub stopped: Mutex<Vec<String>>,
    pub removed: Mutex<Vec<String>>,
}

impl FakeRuntime {
    pub fn new(behavior: impl Fn(&ContainerSpec) -> Script + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            behavior: Box::new(behavior),
            next_id: AtomicU32::new(1),
            containers: Mutex::new(HashMap::new()),
            fail_create: AtomicBool::new(false),
            reports_exited: AtomicBool::new(false),
            created: Mutex::new(Vec::new()),
            stopped: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
        })
    }

    pub fn always(script: Script) -> Arc<Self> {
        Self::new(move |_| script.clone())
    }

    /// Ids handed out by `create`
    pub fn created_ids(&self) -> Vec<String> {
        (1..self.next_id.load(Ordering::SeqCst))
            .map(|n| format!("fake-{n}"))
            .collect()
    }

    pub fn live_containers(&self) -> usize {
        self.containers.lock().len()
    }

    fn container(&self, id: &str) -> Result<Arc<FakeContainer>> {
        match self.containers.lock().get(id) {
            Some(container) => Ok(Arc::clone(container)),
            None => bail!("no such container: {id}"),
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        if self.fail_create.load(Ordering::SeqCst) {
            bail!("image {} not found", spec.image);
        }

        let id = format!("fake-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let script = (self.behavior)(spec);
        self.created.lock().push(spec.clone());
        self.containers.lock().insert(
            id.clone(),
            Arc::new(FakeContainer {
                spec: spec.clone(),
                script,
                stopped: CancellationToken::new(),
                exited: CancellationToken::new(),
            }),
        );
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.container(id).map(|_| ())
    }

    async fn output(&self, id: &str) -> Result<FrameStream> {
        let container = self.container(id)?;
        let frames = container.script.frames.clone();
        let exited = container.exited.clone();

        let tail = stream::once(async move { exited.cancelled().await })
            .filter_map(|_| async { None::<std::io::Result<Frame>> });
        Ok(stream::iter(frames.into_iter().map(Ok)).chain(tail).boxed())
    }

    async fn wait(&self, id: &str) -> Result<Option<i64>> {
        let container = self.container(id)?;

        let code = tokio::select! {
            _ = tokio::time::sleep(container.script.runs_for) => {
                if let Some(results) = &container.script.results {
                    let artifact = container.spec.workspace.join("test-results.json");
                    std::fs::write(artifact, results.to_string())?;
                }
                container.script.exit_code
            }
            _ = container.stopped.cancelled() => KILLED_EXIT_CODE,
        };

        container.exited.cancel();
        Ok(Some(code))
    }

    async fn is_running(&self, id: &str) -> Result<bool> {
        let container = self.container(id)?;
        Ok(!self.reports_exited.load(Ordering::SeqCst) && !container.exited.is_cancelled())
    }

    async fn stop(&self, id: &str) -> Result<()> {
        self.stopped.lock().push(id.to_string());
        self.container(id)?.stopped.cancel();
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.removed.lock().push(id.to_string());
        if let Some(container) = self.containers.lock().remove(id) {
            container.stopped.cancel();
        }
        Ok(())
    }
}

/// Reads a file the candidate shipped, as the sandbox would see it
pub fn read_workspace_file(spec: &ContainerSpec, relative: &str) -> String {
    std::fs::read_to_string(spec.workspace.join(relative)).unwrap_or_default()
}

pub fn fast_queue_options() -> QueueOptions {
    QueueOptions {
        concurrency: 2,
        max_attempts: 3,
        backoff: Duration::from_millis(20),
        poll_interval: Duration::from_millis(20),
        lease: Duration::from_millis(300),
    }
}

pub async fn open_queue(dir: &Path, options: QueueOptions) -> Arc<JobQueue> {
    Arc::new(
        JobQueue::open(dir.join("queue.sqlite3"), EXECUTION_KIND, options)
            .await
            .unwrap(),
    )
}

pub async fn open_submissions(dir: &Path) -> SqlitePool {
    db::init_db(dir.join("submissions.sqlite3")).await.unwrap()
}

pub fn temp_dir() -> TempDir {
    tempfile::tempdir().unwrap()
}

pub fn files(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
    entries
        .iter()
        .map(|(path, content)| (path.to_string(), content.to_string()))
        .collect()
}

pub fn sample_job(submission_id: &str) -> ExecutionJob {
    ExecutionJob {
        submission_id: submission_id.to_string(),
        project_id: "todo-app".to_string(),
        files: files(&[("src/App.js", "export default function App() { return null; }")]),
        test_files: files(&[(
            "src/App.test.js",
            "import App from './App';\ntest('renders', () => { expect(App()).toBeNull(); });",
        )]),
        dependencies: BTreeMap::new(),
        resource_limits: ResourceLimits {
            memory_mb: 256,
            cpus: 0.5,
            timeout_ms: 5000,
        },
    }
}
