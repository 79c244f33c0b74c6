use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use bollard::Docker;
use bollard::errors::Error as DockerError;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions, InspectContainerOptions, KillContainerOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt};
use http_body_util::{BodyExt, Empty};
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;

use super::demux::FrameDecoder;
use super::runtime::{ContainerRuntime, ContainerSpec, FrameStream};

const CONNECT_TIMEOUT_SECS: u64 = 120;

/// Sandboxes backed by the local Docker engine
///
/// Lifecycle calls go through `bollard`. The log stream is read raw from the
/// engine socket and split by [`FrameDecoder`] as it arrives.
pub struct DockerRuntime {
    docker: Docker,
    socket: PathBuf,
}

impl DockerRuntime {
    pub fn connect(socket: &Path) -> Result<Self> {
        let docker = Docker::connect_with_unix(
            &socket.to_string_lossy(),
            CONNECT_TIMEOUT_SECS,
            bollard::API_DEFAULT_VERSION,
        )
        .with_context(|| format!("Failed to connect to Docker at {}", socket.display()))?;

        Ok(Self {
            docker,
            socket: socket.to_path_buf(),
        })
    }

    /// Fails early if the engine is unreachable or the image was never built
    pub async fn check_image(&self, image: &str) -> Result<()> {
        self.docker
            .ping()
            .await
            .context("Docker engine is not responding")?;
        self.docker
            .inspect_image(image)
            .await
            .with_context(|| format!("Sandbox image {image} is not available locally"))?;
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let memory = (spec.limits.memory_mb * 1024 * 1024) as i64;
        let options = CreateContainerOptions {
            name: Some(spec.name.clone()),
            ..Default::default()
        };

        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            working_dir: Some(spec.working_dir.clone()),
            user: spec.user.clone(),
            labels: Some(spec.labels.clone()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            host_config: Some(HostConfig {
                binds: Some(vec![format!(
                    "{}:{}:rw",
                    spec.workspace.display(),
                    spec.mount_point
                )]),
                memory: Some(memory),
                memory_swap: Some(memory),
                nano_cpus: Some((spec.limits.cpus * 1_000_000_000.0) as i64),
                pids_limit: Some(spec.pids_limit),
                cap_drop: Some(vec!["ALL".to_string()]),
                security_opt: Some(vec!["no-new-privileges".to_string()]),
                network_mode: Some(spec.network_mode.clone()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let response = self.docker.create_container(Some(options), body).await?;
        for warning in &response.warnings {
            log::warn!("Docker warning for {}: {warning}", spec.name);
        }
        Ok(response.id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions>)
            .await?;
        Ok(())
    }

    async fn output(&self, id: &str) -> Result<FrameStream> {
        let stream = UnixStream::connect(&self.socket)
            .await
            .with_context(|| format!("Failed to connect to {}", self.socket.display()))?;
        let (mut sender, connection) =
            hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                log::debug!("Log stream connection ended with error: {e}");
            }
        });

        let request = Request::get(format!("/containers/{id}/logs?follow=1&stdout=1&stderr=1"))
            .header(hyper::header::HOST, "docker")
            .body(Empty::<Bytes>::new())?;
        let response = sender.send_request(request).await?;
        if !response.status().is_success() {
            bail!("Docker refused the log stream of {id}: {}", response.status());
        }

        let body = response
            .into_body()
            .into_data_stream()
            .map_err(std::io::Error::other);
        Ok(FramedRead::new(StreamReader::new(body), FrameDecoder).boxed())
    }

    async fn wait(&self, id: &str) -> Result<Option<i64>> {
        let mut results = self
            .docker
            .wait_container(id, None::<WaitContainerOptions>);

        match results.next().await {
            Some(Ok(response)) => Ok(Some(response.status_code)),
            // bollard reports a non-zero exit as an error carrying the code
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => Ok(Some(code)),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    async fn is_running(&self, id: &str) -> Result<bool> {
        let info = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await?;
        Ok(info.state.and_then(|s| s.running).unwrap_or(false))
    }

    async fn stop(&self, id: &str) -> Result<()> {
        self.docker
            .kill_container(id, None::<KillContainerOptions>)
            .await?;
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await?;
        Ok(())
    }
}
