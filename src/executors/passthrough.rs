//! Handlers for the four per-resource action kinds whose actual fetch
//! logic is an out-of-scope external collaborator (spec.md §1: "CRUD
//! services for agents/models/channels" and browsing/search surfaces).
//! Clearance has already gated the call by the time dispatch reaches
//! here; this handler's only job is to acknowledge the authorized access
//! against its resource id, the way `register_info_store` does.

use crate::domain::{ActionKind, Job};
use crate::error::{EngineError, EngineResult};

pub async fn access(job: &Job) -> EngineResult<String> {
    let resource_id = job
        .resource_id
        .as_deref()
        .ok_or_else(|| EngineError::Validation(format!("{:?} job missing resource", job.action)))?;

    let verb = match job.action {
        ActionKind::AccessLocalInfoStore => "local info store",
        ActionKind::AccessExternalInfoStore => "external info store",
        ActionKind::AccessWebsite => "website",
        ActionKind::QuerySearchEngine => "search engine",
        _ => unreachable!("dispatch only routes these four kinds here"),
    };

    Ok(format!("{verb} access authorized for resource {resource_id}"))
}
