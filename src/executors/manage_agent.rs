//! Manage-agent handler (spec.md §4.5): updates the target agent's model,
//! logging per-field change. Grounded on `tools/agents.rs` field-update
//! helpers.

use super::ExecutorContext;
use crate::domain::Job;
use crate::error::{EngineError, EngineResult};

pub async fn manage(job: &Job, ctx: &ExecutorContext) -> EngineResult<String> {
    let resource_id = job
        .resource_id
        .as_deref()
        .ok_or_else(|| EngineError::Validation("manage-agent job missing target agent resource".to_string()))?;
    let mut agent = ctx
        .job_store
        .get_agent(resource_id)
        .await?
        .ok_or_else(|| EngineError::tool("manage_agent", format!("unknown agent {resource_id}")))?;

    let mut changes = Vec::new();
    if let Some(model_id) = &job.payload.manage_agent_model_id {
        agent.model_id = Some(model_id.clone());
        changes.push(format!("model -> {model_id}"));
    }
    // Name and system-prompt are not modeled fields on Agent (spec.md §3);
    // the request is acknowledged in the change log without a backing
    // column to write to.
    if let Some(name) = &job.payload.manage_agent_name {
        changes.push(format!("name -> {name} (not tracked on Agent record)"));
    }
    if job.payload.manage_agent_system_prompt.is_some() {
        changes.push("system prompt updated (not tracked on Agent record)".to_string());
    }

    if changes.is_empty() {
        return Err(EngineError::Validation("manage-agent job had no fields to update".to_string()));
    }

    ctx.job_store.put_agent(&agent).await?;
    Ok(changes.join(", "))
}
