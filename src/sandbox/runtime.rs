use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::stream::BoxStream;

use super::demux::Frame;
use crate::job::ResourceLimits;

/// Demultiplexed output of a running sandbox
pub type FrameStream = BoxStream<'static, std::io::Result<Frame>>;

/// Everything needed to create one sandbox
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    /// Host directory mounted read-write at `mount_point`
    pub workspace: PathBuf,
    pub mount_point: String,
    pub working_dir: String,
    pub user: Option<String>,
    pub limits: ResourceLimits,
    pub pids_limit: i64,
    pub network_mode: String,
    pub labels: HashMap<String, String>,
}

/// Container engine operations the runner relies on
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Creates a stopped sandbox and returns its id
    async fn create(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start(&self, id: &str) -> Result<()>;

    /// Follows the sandbox output from its start until it exits
    async fn output(&self, id: &str) -> Result<FrameStream>;

    /// Resolves when the sandbox exits, with its exit code when known
    async fn wait(&self, id: &str) -> Result<Option<i64>>;

    async fn is_running(&self, id: &str) -> Result<bool>;

    /// Kills the sandbox without a grace period
    async fn stop(&self, id: &str) -> Result<()>;

    /// Force-removes the sandbox, running or not
    async fn remove(&self, id: &str) -> Result<()>;
}
