pub mod demux;
mod docker;
mod runner;
mod runtime;

pub use docker::DockerRuntime;
pub use runner::{MOUNT_POINT, SandboxRunner, SandboxSettings, WORK_DIR, sandbox_script};
pub use runtime::{ContainerRuntime, ContainerSpec, FrameStream};

use std::time::Duration;

/// Exit code used when a sandbox never reported one
pub const EXIT_CODE_UNKNOWN: i64 = -1;

/// What a finished (or stopped) sandbox left behind
#[derive(Debug)]
pub struct RunOutcome {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration: Duration,
}
