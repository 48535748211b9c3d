//! Safe-DSL executor (spec.md §4.5): compile + execute within a
//! `SandboxedDsl` container's workspace via the [`SafeDslRuntime`]
//! collaborator, then aggregate per-step status into a summary.

use super::ExecutorContext;
use crate::domain::{ContainerKind, Job};
use crate::error::{EngineError, EngineResult};
use crate::external::SafeDslRuntime;
use tokio_util::sync::CancellationToken;

pub async fn execute(job: &Job, ct: CancellationToken, ctx: &ExecutorContext) -> EngineResult<String> {
    let script = job
        .payload
        .script
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| EngineError::Validation("safe-shell job missing script payload".to_string()))?;
    let resource_id = job
        .resource_id
        .as_deref()
        .ok_or_else(|| EngineError::Validation("safe-shell job missing container resource".to_string()))?;

    let container = ctx
        .job_store
        .get_container(resource_id)
        .await?
        .ok_or_else(|| EngineError::tool("safe_dsl", format!("unknown container {resource_id}")))?;
    if container.kind != ContainerKind::SandboxedDsl {
        return Err(EngineError::Validation(format!(
            "container {resource_id} is not a SandboxedDsl container"
        )));
    }

    let runtime: &dyn SafeDslRuntime = ctx
        .safe_dsl
        .as_deref()
        .ok_or_else(|| EngineError::tool("safe_dsl", "no safe-DSL runtime configured"))?;

    let compiled = runtime
        .compile(script, &container.path, serde_json::json!({}))
        .await
        .map_err(|e| EngineError::tool("safe_dsl", format!("compile failed: {e}")))?;

    let report = runtime
        .execute(&compiled, ct)
        .await
        .map_err(|e| EngineError::tool("safe_dsl", format!("execution failed: {e}")))?;

    let summary = report
        .steps
        .iter()
        .map(|s| {
            let status = if s.success { "ok" } else { "FAILED" };
            format!("  [{}] {} — {status} ({} attempt(s), {}ms){}", s.index, s.verb, s.attempts, s.duration_ms, s
                .error
                .as_ref()
                .map(|e| format!(": {e}"))
                .unwrap_or_default())
        })
        .collect::<Vec<_>>()
        .join("\n");

    let headline = if report.all_succeeded {
        format!("{}/{} steps succeeded", report.steps.len(), report.steps.len())
    } else {
        let failed = report.steps.iter().filter(|s| !s.success).count();
        format!("{failed}/{} steps failed", report.steps.len())
    };

    let result = format!("{headline} in {}ms\n{summary}", report.total_duration_ms);

    if report.all_succeeded {
        Ok(result)
    } else {
        Err(EngineError::tool("safe_dsl", result))
    }
}
