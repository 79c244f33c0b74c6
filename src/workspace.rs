pub mod harness;

use std::fs::Permissions;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use uuid::Uuid;

use crate::job::{ExecutionJob, validate_relative_path};

/// The sandbox runs as an unprivileged user that must write its test results
/// back into the mounted job directory
const WORKSPACE_PERMISSIONS: u32 = 0o777;

/// A job's private directory on the host
///
/// The directory is removed when the value is dropped, on every path out of a
/// job: success, failure, timeout, or an error halfway through `build`.
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
    install_required: bool,
    removed: bool,
}

impl Workspace {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the sandbox has to run the dependency-install step
    pub fn install_required(&self) -> bool {
        self.install_required
    }

    pub fn results_path(&self) -> PathBuf {
        self.path.join(harness::RESULTS_FILE)
    }

    /// Deletes the directory without blocking the runtime. Dropping the
    /// workspace instead is the fallback for early exits.
    pub async fn remove(mut self) {
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => log::debug!("Removed workspace {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Failed to remove workspace {}: {e}", self.path.display()),
        }
        self.removed = true;
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => log::debug!("Removed workspace {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Failed to remove workspace {}: {e}", self.path.display()),
        }
    }
}

/// Materializes jobs into directories under a common root
#[derive(Debug, Clone)]
pub struct WorkspaceBuilder {
    root: PathBuf,
}

impl WorkspaceBuilder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Default root under the platform cache directory
    pub fn default_root() -> Result<PathBuf> {
        use directories::ProjectDirs;

        let proj_dirs = ProjectDirs::from("", "", "exec-sandbox")
            .context("Unable to find user directory")?;
        Ok(proj_dirs.cache_dir().join("workspaces"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory used by a job. Depends only on the queue job id, so two
    /// deliveries of the same submission under different jobs never collide.
    pub fn workspace_path(&self, job_id: Uuid) -> PathBuf {
        self.root.join(format!("job-{job_id}"))
    }

    /// Writes candidate files, test files, the merged manifest and the
    /// harness configuration. Safe to call again over a partially built
    /// directory left by an earlier attempt.
    pub async fn build(&self, job_id: Uuid, job: &ExecutionJob) -> Result<Workspace> {
        let path = self.workspace_path(job_id);
        tokio::fs::create_dir_all(&path)
            .await
            .with_context(|| format!("Failed to create workspace {}", path.display()))?;

        let workspace = Workspace {
            path,
            install_required: harness::needs_install(&job.dependencies),
            removed: false,
        };

        tokio::fs::set_permissions(
            workspace.path(),
            Permissions::from_mode(WORKSPACE_PERMISSIONS),
        )
        .await
        .with_context(|| format!("Failed to open up workspace {}", workspace.path().display()))?;

        for (relative, content) in job.files.iter().chain(job.test_files.iter()) {
            write_file(workspace.path(), relative, content).await?;
        }

        let manifest = serde_json::to_string_pretty(&harness::manifest(&job.dependencies))?;
        write_file(workspace.path(), "package.json", &manifest).await?;

        for (relative, content) in harness::config_files() {
            write_file(workspace.path(), relative, content).await?;
        }

        // A stale artifact from an earlier attempt must not be mistaken for this run's
        match tokio::fs::remove_file(workspace.results_path()).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                return Err(e).context("Failed to clear previous test results");
            }
            _ => {}
        }

        log::info!(
            "Built workspace {} for submission {} (install step: {})",
            workspace.path().display(),
            job.submission_id,
            workspace.install_required()
        );
        Ok(workspace)
    }
}

async fn write_file(root: &Path, relative: &str, content: &str) -> Result<()> {
    validate_relative_path(relative)?;
    let target = root.join(relative);

    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }

    tokio::fs::write(&target, content)
        .await
        .with_context(|| format!("Failed to write {}", target.display()))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::job::ResourceLimits;

    fn job_with(files: &[(&str, &str)], dependencies: &[(&str, &str)]) -> ExecutionJob {
        let to_map = |pairs: &[(&str, &str)]| -> BTreeMap<String, String> {
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        };
        ExecutionJob {
            submission_id: "sub".to_string(),
            project_id: "proj".to_string(),
            files: to_map(files),
            test_files: to_map(&[("src/__tests__/App.test.js", "test('a', () => {});")]),
            dependencies: to_map(dependencies),
            resource_limits: ResourceLimits::default(),
        }
    }

    #[tokio::test]
    async fn test_build_writes_every_file() {
        let root = tempfile::tempdir().unwrap();
        let builder = WorkspaceBuilder::new(root.path());
        let job = job_with(&[("src/App.js", "export default 1;")], &[]);

        let workspace = builder.build(Uuid::new_v4(), &job).await.unwrap();
        let dir = workspace.path().to_path_buf();

        assert_eq!(
            std::fs::read_to_string(dir.join("src/App.js")).unwrap(),
            "export default 1;"
        );
        assert!(dir.join("src/__tests__/App.test.js").exists());
        assert!(dir.join("jest.config.js").exists());
        assert!(dir.join("__mocks__/styleMock.js").exists());

        let manifest: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.join("package.json")).unwrap())
                .unwrap();
        assert_eq!(manifest["devDependencies"]["jest"], "^29.7.0");
        assert!(!workspace.install_required());

        drop(workspace);
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_sandbox_user_can_write_into_workspace() {
        let root = tempfile::tempdir().unwrap();
        let builder = WorkspaceBuilder::new(root.path());
        let job = job_with(&[("src/App.js", "export default 1;")], &[]);

        let workspace = builder.build(Uuid::new_v4(), &job).await.unwrap();
        let mode = std::fs::metadata(workspace.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, WORKSPACE_PERMISSIONS, "mode was {:o}", mode & 0o777);
    }

    #[tokio::test]
    async fn test_explicit_remove_deletes_directory() {
        let root = tempfile::tempdir().unwrap();
        let builder = WorkspaceBuilder::new(root.path());
        let job = job_with(&[("src/App.js", "export default 1;")], &[]);

        let workspace = builder.build(Uuid::new_v4(), &job).await.unwrap();
        let dir = workspace.path().to_path_buf();
        workspace.remove().await;
        assert!(!dir.exists());
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_harness_config_wins_over_candidate_file() {
        let root = tempfile::tempdir().unwrap();
        let builder = WorkspaceBuilder::new(root.path());
        let job = job_with(&[("jest.config.js", "module.exports = { testMatch: [] };")], &[]);

        let workspace = builder.build(Uuid::new_v4(), &job).await.unwrap();
        let jest = std::fs::read_to_string(workspace.path().join("jest.config.js")).unwrap();
        assert!(jest.contains("jsdom"));
    }

    #[tokio::test]
    async fn test_rebuild_over_existing_directory() {
        let root = tempfile::tempdir().unwrap();
        let builder = WorkspaceBuilder::new(root.path());
        let job_id = Uuid::new_v4();
        let job = job_with(&[("src/App.js", "v2")], &[("lodash", "^4.17.21")]);

        let stale = builder.workspace_path(job_id);
        std::fs::create_dir_all(stale.join("src")).unwrap();
        std::fs::write(stale.join("src/App.js"), "v1").unwrap();
        std::fs::write(stale.join(harness::RESULTS_FILE), "{}").unwrap();

        let workspace = builder.build(job_id, &job).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(workspace.path().join("src/App.js")).unwrap(),
            "v2"
        );
        assert!(!workspace.results_path().exists());
        assert!(workspace.install_required());
    }

    #[tokio::test]
    async fn test_failed_build_leaves_nothing_behind() {
        let root = tempfile::tempdir().unwrap();
        let builder = WorkspaceBuilder::new(root.path());
        let job_id = Uuid::new_v4();
        let job = job_with(&[("../escape.js", "x")], &[]);

        assert!(builder.build(job_id, &job).await.is_err());
        assert!(!builder.workspace_path(job_id).exists());
    }

    #[test]
    fn test_workspace_path_depends_on_job_id_only() {
        let builder = WorkspaceBuilder::new("/tmp/ws");
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(builder.workspace_path(a), builder.workspace_path(a));
        assert_ne!(builder.workspace_path(a), builder.workspace_path(b));
    }
}
