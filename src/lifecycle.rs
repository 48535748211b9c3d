//! Job Lifecycle Manager (spec.md §4.4) and the Action Dispatcher that
//! backs it (§4.2's per-resource validation plus §4.5's executor
//! dispatch). Persistence is grounded on `engine/sessions.rs`'s
//! `SessionStore`: every transition is a row write behind the same
//! `Mutex<Connection>`-backed store, with an append-only log entry for
//! every transition and decision reason (spec.md §3).

use crate::clearance::{self, Verdict};
use crate::domain::{ActionKind, CallerRef, Job, JobPayload, JobStatus, LogEntry, Severity};
use crate::error::{EngineError, EngineResult};
use crate::executors::{self, ExecutorContext, ExecutorOutcome};
use crate::external::{JobStore, PermissionStore, SafeDslRuntime, SandboxRegistrar};
use crate::transcription::TranscriptionOrchestrator;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn now() -> String {
    Utc::now().to_rfc3339()
}

/// A proposed action, as translated from a chat tool call (§4.7) or any
/// other submission surface.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub channel_id: Option<String>,
    /// An explicit substitute for the channel's default agent — must be
    /// one of the channel's `allowed_agents` (spec.md §4.4 step 1).
    pub agent_id_override: Option<String>,
    pub caller: CallerRef,
    pub action: ActionKind,
    pub resource_id: Option<String>,
    pub payload: JobPayload,
}

pub struct JobLifecycleManager {
    job_store: Arc<dyn JobStore>,
    permission_store: Arc<dyn PermissionStore>,
    transcription: Arc<TranscriptionOrchestrator>,
    safe_dsl: Option<Arc<dyn SafeDslRuntime>>,
    sandbox: Option<Arc<dyn SandboxRegistrar>>,
    /// Cancellation tokens for jobs currently `Executing`, so `Cancel`
    /// can abort an in-flight dangerous-shell/safe-DSL execution (spec.md
    /// §5: "Canceling the shell executor's process-spawn aborts the
    /// child.").
    running: Mutex<HashMap<String, CancellationToken>>,
}

impl JobLifecycleManager {
    pub fn new(
        job_store: Arc<dyn JobStore>,
        permission_store: Arc<dyn PermissionStore>,
        transcription: Arc<TranscriptionOrchestrator>,
        safe_dsl: Option<Arc<dyn SafeDslRuntime>>,
        sandbox: Option<Arc<dyn SandboxRegistrar>>,
    ) -> Self {
        Self {
            job_store,
            permission_store,
            transcription,
            safe_dsl,
            sandbox,
            running: Mutex::new(HashMap::new()),
        }
    }

    fn executor_context(&self) -> ExecutorContext {
        ExecutorContext {
            job_store: self.job_store.clone(),
            safe_dsl: self.safe_dsl.clone(),
            sandbox: self.sandbox.clone(),
            transcription: self.transcription.clone(),
        }
    }

    async fn append_log(&self, job_id: &str, severity: Severity, message: impl Into<String>) -> EngineResult<()> {
        self.job_store
            .append_log(&LogEntry {
                id: Uuid::new_v4().to_string(),
                job_id: job_id.to_string(),
                severity,
                message: message.into(),
                created_at: now(),
            })
            .await
    }

    /// Resolve the executing agent for a submission: the channel's
    /// default agent, or an explicit `allowedAgent` override (spec.md
    /// §4.4 step 1).
    async fn resolve_agent(&self, req: &SubmitRequest) -> EngineResult<String> {
        let channel = match &req.channel_id {
            Some(id) => self.permission_store.get_channel(id).await?,
            None => None,
        };

        if let Some(override_id) = &req.agent_id_override {
            if let Some(channel) = &channel {
                if !channel.allowed_agents.iter().any(|a| a == override_id) {
                    return Err(EngineError::Validation(format!(
                        "agent {override_id} is not an allowed substitute on channel"
                    )));
                }
            }
            return Ok(override_id.clone());
        }

        channel
            .and_then(|c| c.default_agent_id)
            .ok_or_else(|| EngineError::Validation("no agent resolvable for submission".to_string()))
    }

    /// Resolve the job's resource id: explicit, else §4.2's
    /// default-resource walk, else `None` (rejected by the evaluator for
    /// per-resource actions — spec.md §4.2).
    async fn resolve_resource(&self, req: &SubmitRequest, agent_id: &str) -> EngineResult<Option<String>> {
        if req.resource_id.is_some() {
            return Ok(req.resource_id.clone());
        }
        let Some(category) = req.action.category() else { return Ok(None) };
        clearance::resolve_default_resource(
            self.permission_store.as_ref(),
            req.channel_id.as_deref(),
            agent_id,
            category,
        )
        .await
    }

    /// Submit(channelId, request) — spec.md §4.4.
    pub async fn submit(&self, req: SubmitRequest) -> EngineResult<Job> {
        let agent_id = self.resolve_agent(&req).await?;
        let resource_id = self.resolve_resource(&req, &agent_id).await?;

        let mut job = Job {
            id: Uuid::new_v4().to_string(),
            agent_id: agent_id.clone(),
            channel_id: req.channel_id.clone(),
            caller_user_id: req.caller.user_id().map(str::to_string),
            caller_agent_id: req.caller.agent_id().map(str::to_string),
            action: req.action,
            resource_id,
            status: JobStatus::Queued,
            effective_clearance: None,
            approved_by_user_id: None,
            approved_by_agent_id: None,
            result_data: None,
            error_log: None,
            payload: req.payload,
            created_at: now(),
            started_at: None,
            completed_at: None,
        };

        self.job_store.insert_job(&job).await?;
        self.append_log(&job.id, Severity::Info, "queued").await?;

        let verdict = clearance::evaluate(
            self.permission_store.as_ref(),
            &job.agent_id,
            job.action,
            job.resource_id.as_deref(),
            &req.caller,
        )
        .await?;

        match verdict {
            Verdict::Approved { rule, effective_clearance } => {
                job.effective_clearance = Some(effective_clearance);
                self.append_log(&job.id, Severity::Info, format!("Permission granted ({rule})")).await?;
                if let CallerRef::User(id) = &req.caller {
                    job.approved_by_user_id = Some(id.clone());
                }
                if let CallerRef::Agent(id) = &req.caller {
                    job.approved_by_agent_id = Some(id.clone());
                }
                self.execute(&mut job).await?;
            }
            Verdict::Pending { effective_clearance } => {
                job.effective_clearance = Some(effective_clearance);
                let preauthorized = clearance::check_preauthorized(
                    self.permission_store.as_ref(),
                    job.channel_id.as_deref(),
                    job.action,
                    job.resource_id.as_deref(),
                    effective_clearance,
                    &req.caller,
                )
                .await?;
                if preauthorized {
                    self.append_log(&job.id, Severity::Info, "Pre-authorized by channel/context permission set")
                        .await?;
                    self.execute(&mut job).await?;
                } else {
                    job.status = JobStatus::AwaitingApproval;
                    self.job_store.update_job(&job).await?;
                    self.append_log(
                        &job.id,
                        Severity::Info,
                        format!("awaiting approval: effective clearance {}", effective_clearance.name()),
                    )
                    .await?;
                }
            }
            Verdict::Denied { reason } => {
                job.status = JobStatus::Denied;
                job.completed_at = Some(now());
                self.job_store.update_job(&job).await?;
                self.append_log(&job.id, Severity::Warning, reason).await?;
            }
        }

        Ok(job)
    }

    /// Approve(jobId, approver) — spec.md §4.4. Only legal from
    /// `AwaitingApproval`; idempotent no-op on a terminal job.
    pub async fn approve(&self, job_id: &str, approver: CallerRef) -> EngineResult<Job> {
        let mut job = self.job_store.get_job(job_id).await?.ok_or_else(|| {
            EngineError::Validation(format!("no such job {job_id}"))
        })?;

        if job.status != JobStatus::AwaitingApproval {
            self.append_log(job_id, Severity::Warning, format!("rejected: already {}", job.status.as_str()))
                .await?;
            return Ok(job);
        }

        let verdict = clearance::evaluate(
            self.permission_store.as_ref(),
            &job.agent_id,
            job.action,
            job.resource_id.as_deref(),
            &approver,
        )
        .await?;

        match verdict {
            Verdict::Approved { rule, effective_clearance } => {
                job.effective_clearance = Some(effective_clearance);
                if let CallerRef::User(id) = &approver {
                    job.approved_by_user_id = Some(id.clone());
                }
                if let CallerRef::Agent(id) = &approver {
                    job.approved_by_agent_id = Some(id.clone());
                }
                self.append_log(job_id, Severity::Info, format!("Permission granted ({rule})")).await?;
                self.execute(&mut job).await?;
            }
            Verdict::Pending { .. } => {
                self.append_log(job_id, Severity::Warning, "insufficient: approver does not satisfy effective clearance")
                    .await?;
            }
            Verdict::Denied { reason } => {
                job.status = JobStatus::Denied;
                job.completed_at = Some(now());
                self.job_store.update_job(&job).await?;
                self.append_log(job_id, Severity::Warning, format!("permission revoked: {reason}")).await?;
            }
        }

        Ok(job)
    }

    /// Cancel(jobId) — spec.md §4.4. Allowed from any non-terminal state;
    /// idempotent on a terminal job.
    pub async fn cancel(&self, job_id: &str) -> EngineResult<Job> {
        let mut job = self.job_store.get_job(job_id).await?.ok_or_else(|| {
            EngineError::Validation(format!("no such job {job_id}"))
        })?;

        if job.status.is_terminal() {
            self.append_log(job_id, Severity::Warning, format!("rejected: already {}", job.status.as_str()))
                .await?;
            return Ok(job);
        }

        if job.action.is_transcription() && job.status == JobStatus::Executing {
            self.transcription.cancel(job_id).await?;
        }
        if let Some(ct) = self.running.lock().remove(job_id) {
            ct.cancel();
        }

        job.status = JobStatus::Cancelled;
        job.completed_at = Some(now());
        self.job_store.update_job(&job).await?;
        self.append_log(job_id, Severity::Info, "Job cancelled").await?;
        Ok(job)
    }

    /// StopTranscription(jobId) — spec.md §4.4. Only from `Executing` and
    /// only for transcription kinds; distinct terminal state from Cancel.
    pub async fn stop_transcription(&self, job_id: &str) -> EngineResult<Job> {
        let mut job = self.job_store.get_job(job_id).await?.ok_or_else(|| {
            EngineError::Validation(format!("no such job {job_id}"))
        })?;

        if job.status != JobStatus::Executing || !job.action.is_transcription() {
            return Err(EngineError::Validation(
                "StopTranscription is only valid for an Executing transcription job".to_string(),
            ));
        }

        self.transcription.stop(job_id).await?;
        job.status = JobStatus::Completed;
        job.completed_at = Some(now());
        self.job_store.update_job(&job).await?;
        Ok(job)
    }

    /// Mark `Executing`, dispatch to the executor registry, and record
    /// the terminal outcome — shared by `submit`'s Approved/pre-authorized
    /// paths and `approve`'s Approved path (spec.md §4.4 steps 5/6).
    async fn execute(&self, job: &mut Job) -> EngineResult<()> {
        job.status = JobStatus::Executing;
        job.started_at = Some(now());
        self.job_store.update_job(job).await?;
        self.append_log(&job.id, Severity::Info, "Job executing").await?;

        let ct = CancellationToken::new();
        self.running.lock().insert(job.id.clone(), ct.clone());

        let ctx = self.executor_context();
        let outcome = executors::dispatch(job, ct, &ctx).await;
        self.running.lock().remove(&job.id);

        match outcome {
            Ok(ExecutorOutcome::Completed(result_data)) => {
                job.status = JobStatus::Completed;
                job.result_data = Some(result_data);
                job.completed_at = Some(now());
                self.job_store.update_job(job).await?;
                self.append_log(&job.id, Severity::Info, "Job completed successfully").await?;
            }
            Ok(ExecutorOutcome::HandedOffToTranscription) => {
                // Job stays Executing: the orchestrator owns the rest of
                // its lifecycle until StopTranscription, Cancel, or the
                // chunk-failure policy ends it (spec.md §4.6).
            }
            Err(e) if matches!(e, EngineError::Cancelled) => {
                job.status = JobStatus::Cancelled;
                job.completed_at = Some(now());
                self.job_store.update_job(job).await?;
                self.append_log(&job.id, Severity::Info, "Job cancelled").await?;
            }
            Err(e) => {
                job.status = JobStatus::Failed;
                job.error_log = Some(e.to_string());
                job.completed_at = Some(now());
                self.job_store.update_job(job).await?;
                self.append_log(&job.id, Severity::Error, format!("execution failed: {e}")).await?;
            }
        }

        Ok(())
    }

    pub fn job_store(&self) -> &Arc<dyn JobStore> {
        &self.job_store
    }

    pub fn permission_store(&self) -> &Arc<dyn PermissionStore> {
        &self.permission_store
    }

    /// Level a session user/agent would need to personally clear to
    /// satisfy an already-`AwaitingApproval` job — used by the chat
    /// tool-call loop (§4.7 step 3c) to decide whether to surface an
    /// approval prompt or auto-cancel.
    pub async fn could_satisfy(&self, job: &Job, caller: &CallerRef) -> EngineResult<bool> {
        let verdict = clearance::evaluate(
            self.permission_store.as_ref(),
            &job.agent_id,
            job.action,
            job.resource_id.as_deref(),
            caller,
        )
        .await?;
        Ok(matches!(verdict, Verdict::Approved { .. }))
    }
}
