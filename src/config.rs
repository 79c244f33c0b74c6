use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use serde::Deserialize;

use crate::job::{ResourceLimits, validate_relative_path};

#[derive(Parser)]
#[command(name = "exec-sandbox", version = "1.0", about, long_about = None)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(long = "config", short = 'c')]
    pub config_path: String,

    /// Which half of the pipeline this process runs
    #[arg(long, value_enum, default_value_t = Role::All)]
    pub role: Role,

    /// Whether to flush the existing submission database
    #[arg(long = "flush-data", short = 'f', default_value_t = false)]
    pub flush_data: bool,

    /// Queue backing store, overrides `queue.database`
    #[arg(long, env = "EXEC_QUEUE_DATABASE")]
    pub queue_database: Option<PathBuf>,

    /// Sandbox image reference, overrides `sandbox.image`
    #[arg(long, env = "EXEC_SANDBOX_IMAGE")]
    pub sandbox_image: Option<String>,

    /// Base URL the worker reports results to, overrides `reporting.api_base_url`
    #[arg(long, env = "EXEC_API_BASE_URL")]
    pub api_base_url: Option<String>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Api,
    Worker,
    All,
}

impl Role {
    pub fn runs_api(&self) -> bool {
        matches!(self, Self::Api | Self::All)
    }

    pub fn runs_worker(&self) -> bool {
        matches!(self, Self::Worker | Self::All)
    }
}

impl CliArgs {
    /// Load the configuration from the specified file and apply overrides
    pub fn to_config(&self) -> Result<Config> {
        let file = std::fs::File::open(&self.config_path)
            .with_context(|| format!("Failed to open config file {}", self.config_path))?;
        let reader = std::io::BufReader::new(file);
        let mut config: Config = serde_json::from_reader(reader)
            .with_context(|| format!("Failed to parse config file {}", self.config_path))?;

        if let Some(path) = &self.queue_database {
            config.queue.database = Some(path.clone());
        }
        if let Some(image) = &self.sandbox_image {
            config.sandbox.image = image.clone();
        }
        if let Some(url) = &self.api_base_url {
            config.reporting.api_base_url = url.clone();
        }

        config.validate()?;
        Ok(config)
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: Option<PathBuf>,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub reporting: ReportingConfig,
    #[serde(default)]
    pub projects: Vec<ProjectConfig>,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.queue.concurrency == 0 {
            bail!("queue.concurrency must not be 0");
        }
        if self.queue.max_attempts == 0 {
            bail!("queue.max_attempts must not be 0");
        }
        if self.queue.lease_ms == 0 {
            bail!("queue.lease_ms must not be 0");
        }

        let mut seen = std::collections::HashSet::new();
        for project in &self.projects {
            if !seen.insert(project.id.as_str()) {
                bail!("duplicate project id {}", project.id);
            }
            for test_file in &project.test_files {
                validate_relative_path(&test_file.path)
                    .with_context(|| format!("invalid test file in project {}", project.id))?;
            }
        }

        Ok(())
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct ServerConfig {
    pub bind_address: Option<String>,
    pub bind_port: Option<u16>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct QueueConfig {
    pub database: Option<PathBuf>,
    pub concurrency: usize,
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub poll_interval_ms: u64,
    /// A claimed job is handed to another worker if its holder stops renewing for this long
    pub lease_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            database: None,
            concurrency: 2,
            max_attempts: 3,
            backoff_ms: 1000,
            poll_interval_ms: 500,
            lease_ms: 60_000,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SandboxConfig {
    pub image: String,
    pub docker_socket: PathBuf,
    pub workspace_root: Option<PathBuf>,
    pub pids_limit: i64,
    pub network_mode: String,
    pub max_output_bytes: usize,
    pub default_limits: ResourceLimits,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "exec-sandbox-runner:latest".to_string(),
            docker_socket: PathBuf::from("/var/run/docker.sock"),
            workspace_root: None,
            pids_limit: 128,
            network_mode: "bridge".to_string(),
            max_output_bytes: 1024 * 1024,
            default_limits: ResourceLimits::default(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ReportingConfig {
    pub api_base_url: String,
    pub timeout_ms: u64,
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:12345".to_string(),
            timeout_ms: 10_000,
        }
    }
}

/// Harness definition for one project: the tests every submission is run against
#[derive(Deserialize, Debug, Clone)]
pub struct ProjectConfig {
    pub id: String,
    pub name: String,
    pub test_files: Vec<TestFileConfig>,
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    pub resource_limits: Option<ResourceLimitsOverride>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct TestFileConfig {
    /// Path of the file inside the workspace
    pub path: String,
    pub content: Option<String>,
    /// Host file to read the content from
    pub file: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Clone, Copy, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimitsOverride {
    pub memory_mb: Option<u64>,
    #[serde(alias = "cpuShare")]
    pub cpus: Option<f64>,
    pub timeout_ms: Option<u64>,
}

impl ResourceLimitsOverride {
    pub fn apply(&self, base: ResourceLimits) -> ResourceLimits {
        ResourceLimits {
            memory_mb: self.memory_mb.unwrap_or(base.memory_mb),
            cpus: self.cpus.unwrap_or(base.cpus),
            timeout_ms: self.timeout_ms.unwrap_or(base.timeout_ms),
        }
    }
}

/// Fully resolved harness for a project, ready to be copied into jobs
#[derive(Debug, Clone)]
pub struct ProjectHarness {
    pub id: String,
    pub name: String,
    pub test_files: BTreeMap<String, String>,
    pub dependencies: BTreeMap<String, String>,
    pub resource_limits: ResourceLimits,
}

/// Lookup table of harnesses, keyed by project id
pub type ProjectCatalog = BTreeMap<String, ProjectHarness>;

/// Reads every project's test files and resolves its limits
pub fn load_projects(projects: &[ProjectConfig], defaults: ResourceLimits) -> Result<ProjectCatalog> {
    let mut catalog = ProjectCatalog::new();

    for project in projects {
        let mut test_files = BTreeMap::new();
        for test_file in &project.test_files {
            let content = match (&test_file.content, &test_file.file) {
                (Some(content), _) => content.clone(),
                (None, Some(file)) => std::fs::read_to_string(file).with_context(|| {
                    format!(
                        "Failed to read test file {} of project {}",
                        file.display(),
                        project.id
                    )
                })?,
                (None, None) => bail!(
                    "test file {} of project {} has neither content nor file",
                    test_file.path,
                    project.id
                ),
            };
            test_files.insert(test_file.path.clone(), content);
        }

        let resource_limits = project
            .resource_limits
            .map_or(defaults, |o| o.apply(defaults));

        catalog.insert(
            project.id.clone(),
            ProjectHarness {
                id: project.id.clone(),
                name: project.name.clone(),
                test_files,
                dependencies: project.dependencies.clone(),
                resource_limits,
            },
        );
    }

    log::info!("Loaded {} project harness(es)", catalog.len());
    Ok(catalog)
}
