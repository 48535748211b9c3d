//! Edit-task handler (spec.md §4.5): updates name, repeat interval, max
//! retries. Grounded on `tools/tasks.rs::execute_manage_task`.
//!
//! No Task entity is defined in spec.md §3 — task CRUD is an out-of-scope
//! external collaborator per §1. This handler validates and acknowledges
//! the requested field changes; persisting them is the out-of-scope
//! service's job. `EditAnyTask` dispatches here too, bypassing the
//! resource lookup `EditTask` requires (see DESIGN.md's recorded reading
//! of the EditAnyTask Open Question).

use crate::domain::Job;
use crate::error::{EngineError, EngineResult};

pub async fn edit(job: &Job) -> EngineResult<String> {
    let mut changes = Vec::new();
    if let Some(name) = &job.payload.task_name {
        changes.push(format!("name -> {name}"));
    }
    if let Some(interval) = &job.payload.task_repeat_interval {
        changes.push(format!("repeatInterval -> {interval}"));
    }
    if let Some(retries) = job.payload.task_max_retries {
        changes.push(format!("maxRetries -> {retries}"));
    }

    if changes.is_empty() {
        return Err(EngineError::Validation("edit-task job had no fields to update".to_string()));
    }

    Ok(changes.join(", "))
}
