//! Create-container, access-container, and register-info-store handlers
//! (spec.md §4.5), grounded on `sandbox.rs`'s Docker client setup,
//! generalized to the [`SandboxRegistrar`] trait of §6.

use super::ExecutorContext;
use crate::domain::{Container, ContainerKind, Job};
use crate::error::{EngineError, EngineResult};
use crate::external::SandboxRegistrar;

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub async fn create(job: &Job, ctx: &ExecutorContext) -> EngineResult<String> {
    let name = job
        .payload
        .container_name
        .as_deref()
        .ok_or_else(|| EngineError::Validation("create-container job missing name".to_string()))?;
    let path = job
        .payload
        .container_path
        .as_deref()
        .ok_or_else(|| EngineError::Validation("create-container job missing path".to_string()))?;

    let registrar: &dyn SandboxRegistrar = ctx
        .sandbox
        .as_deref()
        .ok_or_else(|| EngineError::tool("create_container", "no sandbox registrar configured"))?;
    registrar
        .register(name, path)
        .await
        .map_err(|e| EngineError::tool("create_container", format!("registration failed: {e}")))?;

    let container = Container {
        id: uuid::Uuid::new_v4().to_string(),
        name: name.to_string(),
        kind: ContainerKind::Docker,
        path: path.to_string(),
        description: job.payload.container_description.clone(),
        created_at: now(),
    };
    ctx.job_store.put_container(&container).await?;

    Ok(format!("container '{name}' registered at {path} (id {})", container.id))
}

pub async fn access(job: &Job, ctx: &ExecutorContext) -> EngineResult<String> {
    let resource_id = job
        .resource_id
        .as_deref()
        .ok_or_else(|| EngineError::Validation("access-container job missing resource".to_string()))?;
    let container = ctx
        .job_store
        .get_container(resource_id)
        .await?
        .ok_or_else(|| EngineError::tool("access_container", format!("unknown container {resource_id}")))?;
    Ok(format!(
        "{} ({:?}) at {}{}",
        container.name,
        container.kind,
        container.path,
        container.description.map(|d| format!(" — {d}")).unwrap_or_default()
    ))
}

/// Info-store registration is a resourceless global-flag action (spec.md
/// §3) with no dedicated entity of its own in §3 — the registration CRUD
/// itself is an out-of-scope external collaborator per spec.md §1. This
/// handler only acknowledges the request was authorized.
pub async fn register_info_store(_job: &Job) -> EngineResult<String> {
    Ok("info store registration acknowledged".to_string())
}
