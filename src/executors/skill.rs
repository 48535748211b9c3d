//! Access-skill handler (spec.md §4.5): returns the stored skill text.
//! Grounded on `tools/skills_tools.rs`'s skill storage lookup.

use super::ExecutorContext;
use crate::domain::Job;
use crate::error::{EngineError, EngineResult};

pub async fn access(job: &Job, ctx: &ExecutorContext) -> EngineResult<String> {
    let resource_id = job
        .resource_id
        .as_deref()
        .ok_or_else(|| EngineError::Validation("access-skill job missing resource".to_string()))?;
    ctx.job_store
        .get_skill_text(resource_id)
        .await?
        .ok_or_else(|| EngineError::tool("access_skill", format!("unknown skill {resource_id}")))
}
