//! Executor Registry (spec.md §4.5): per-action-kind handlers that receive
//! a Job and a cancellation token and return textual `resultData` or throw.

mod container;
mod dangerous_shell;
mod edit_task;
mod manage_agent;
mod passthrough;
mod safe_dsl;
mod skill;
mod sub_agent;

use crate::domain::{ActionKind, Job};
use crate::error::EngineResult;
use crate::external::{JobStore, SafeDslRuntime, SandboxRegistrar};
use crate::transcription::TranscriptionOrchestrator;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Collaborators every executor handler may need. Optional fields are
/// `None` when the caller hasn't wired that collaborator in — dispatch
/// fails with a tool error rather than panicking if an action needs one.
pub struct ExecutorContext {
    pub job_store: Arc<dyn JobStore>,
    pub safe_dsl: Option<Arc<dyn SafeDslRuntime>>,
    pub sandbox: Option<Arc<dyn SandboxRegistrar>>,
    pub transcription: Arc<TranscriptionOrchestrator>,
}

/// The result of dispatching a job to its handler. Every action kind
/// except the transcription family resolves synchronously to `Completed`;
/// transcription kinds hand off to the orchestrator and the job stays
/// `Executing` until `StopTranscription`, `Cancel`, or the failure policy
/// in §4.6 ends it (spec.md §4.5's "hand off to §4.6").
pub enum ExecutorOutcome {
    Completed(String),
    HandedOffToTranscription,
}

pub async fn dispatch(job: &Job, ct: CancellationToken, ctx: &ExecutorContext) -> EngineResult<ExecutorOutcome> {
    if job.action.is_transcription() {
        ctx.transcription.start(job.clone(), ct).await?;
        return Ok(ExecutorOutcome::HandedOffToTranscription);
    }

    let result_data = match job.action {
        ActionKind::ExecuteAsSafeShell => {
            safe_dsl::execute(job, ct, ctx).await?
        }
        ActionKind::UnsafeExecuteAsDangerousShell => {
            dangerous_shell::execute(job, ct, ctx).await?
        }
        ActionKind::CreateSubAgent => sub_agent::create(job, ctx).await?,
        ActionKind::CreateContainer => container::create(job, ctx).await?,
        ActionKind::RegisterInfoStore => container::register_info_store(job).await?,
        ActionKind::ManageAgent => manage_agent::manage(job, ctx).await?,
        ActionKind::EditTask | ActionKind::EditAnyTask => edit_task::edit(job).await?,
        ActionKind::AccessSkill => skill::access(job, ctx).await?,
        ActionKind::AccessContainer => container::access(job, ctx).await?,
        ActionKind::AccessLocalInfoStore
        | ActionKind::AccessExternalInfoStore
        | ActionKind::AccessWebsite
        | ActionKind::QuerySearchEngine => passthrough::access(job).await?,
        ActionKind::TranscribeFromAudioDevice
        | ActionKind::TranscribeFromAudioStream
        | ActionKind::TranscribeFromAudioFile => unreachable!("handled above"),
    };

    Ok(ExecutorOutcome::Completed(result_data))
}
