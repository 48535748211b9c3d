//! End-to-end scenarios against an in-memory store, following the
//! teacher's `tempfile`/isolated-DB convention for integration coverage.
//! Each scenario below is a literal-input case; see DESIGN.md for how
//! each maps onto a component.

use async_trait::async_trait;
use clearance_engine::domain::{
    ActionKind, Agent, CallerRef, Channel, ChannelContext, Clearance, Container, ContainerKind,
    Grant, JobPayload, JobStatus, PermissionSet, ResourceCategory, Role, Severity, ShellKind,
    SystemUser, ALL_RESOURCES,
};
use clearance_engine::external::{
    AudioCaptureDriver, AudioDeviceInfo, JobStore, OnChunk, PermissionStore, Transcription,
    TranscriptionClient, TranscribedSegment,
};
use clearance_engine::lifecycle::{JobLifecycleManager, SubmitRequest};
use clearance_engine::store::EngineStore;
use clearance_engine::transcription::TranscriptionOrchestrator;
use clearance_engine::EngineResult;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn uid() -> String {
    Uuid::new_v4().to_string()
}

struct NullAudioDriver;
#[async_trait]
impl AudioCaptureDriver for NullAudioDriver {
    async fn list_devices(&self) -> EngineResult<Vec<AudioDeviceInfo>> {
        Ok(Vec::new())
    }
    async fn capture(&self, _d: &str, _c: Duration, _o: OnChunk, _ct: CancellationToken) -> EngineResult<()> {
        Ok(())
    }
}

struct NullTranscriber;
#[async_trait]
impl TranscriptionClient for NullTranscriber {
    async fn transcribe(&self, _m: &str, _w: &[u8], _l: Option<&str>) -> EngineResult<Transcription> {
        Err(clearance_engine::EngineError::Other("unused in this test".to_string()))
    }
}

/// Emits a fixed number of 1-byte chunks synchronously, then returns —
/// standing in for a real device stream (spec.md §8 scenario 7).
struct ScriptedAudioDriver {
    chunk_count: u32,
}
#[async_trait]
impl AudioCaptureDriver for ScriptedAudioDriver {
    async fn list_devices(&self) -> EngineResult<Vec<AudioDeviceInfo>> {
        Ok(Vec::new())
    }
    async fn capture(&self, _d: &str, _c: Duration, mut on_chunk: OnChunk, _ct: CancellationToken) -> EngineResult<()> {
        for i in 0..self.chunk_count {
            on_chunk(vec![0u8], i)?;
        }
        Ok(())
    }
}

/// Always succeeds, returning one segment of fixed duration per chunk —
/// used to assert ordering.
struct SucceedingTranscriber;
#[async_trait]
impl TranscriptionClient for SucceedingTranscriber {
    async fn transcribe(&self, _m: &str, _w: &[u8], _l: Option<&str>) -> EngineResult<Transcription> {
        Ok(Transcription {
            text: "chunk".to_string(),
            duration: 1.0,
            segments: vec![TranscribedSegment { text: "chunk".to_string(), start: 0.0, end: 1.0, confidence: Some(1.0) }],
        })
    }
}

/// Always fails — used to drive the consecutive-failure abort policy.
struct FailingTranscriber {
    calls: AtomicUsize,
}
#[async_trait]
impl TranscriptionClient for FailingTranscriber {
    async fn transcribe(&self, _m: &str, _w: &[u8], _l: Option<&str>) -> EngineResult<Transcription> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(clearance_engine::EngineError::Provider { provider: "test".to_string(), message: "induced failure".to_string() })
    }
}

async fn new_store() -> Arc<EngineStore> {
    Arc::new(EngineStore::open_in_memory().expect("open in-memory store"))
}

fn lifecycle_with(
    store: Arc<EngineStore>,
    capture: Arc<dyn AudioCaptureDriver>,
    transcriber: Arc<dyn TranscriptionClient>,
) -> JobLifecycleManager {
    let transcription = Arc::new(TranscriptionOrchestrator::new(store.clone(), capture, transcriber, None));
    JobLifecycleManager::new(store.clone(), store, transcription, None, None)
}

fn default_lifecycle(store: Arc<EngineStore>) -> JobLifecycleManager {
    lifecycle_with(store, Arc::new(NullAudioDriver), Arc::new(NullTranscriber))
}

/// Seeds a role + permission set with one grant in `category`, plus an
/// agent pointed at that role. Returns (agent_id, role_id, ps_id).
async fn seed_agent_with_grant(
    store: &EngineStore,
    category: ResourceCategory,
    resource_id: &str,
    clearance: Clearance,
) -> (String, String) {
    let agent_id = uid();
    let role_id = uid();
    let ps_id = uid();
    let ps = PermissionSet::new(&ps_id, now());
    store.put_permission_set(&ps).await.unwrap();
    store
        .put_grant(
            &ps_id,
            &Grant { id: uid(), category, resource_id: resource_id.to_string(), clearance },
        )
        .await
        .unwrap();
    store.put_role(&Role { id: role_id.clone(), name: "role".to_string(), permission_set_id: ps_id.clone() }).await.unwrap();
    store.put_agent(&Agent { id: agent_id.clone(), role_id: Some(role_id.clone()), model_id: None }).await.unwrap();
    (agent_id, role_id)
}

async fn seed_agent_no_grants(store: &EngineStore) -> String {
    let agent_id = uid();
    let role_id = uid();
    let ps_id = uid();
    let ps = PermissionSet::new(&ps_id, now());
    store.put_permission_set(&ps).await.unwrap();
    store.put_role(&Role { id: role_id.clone(), name: "role".to_string(), permission_set_id: ps_id }).await.unwrap();
    store.put_agent(&Agent { id: agent_id.clone(), role_id: Some(role_id), model_id: None }).await.unwrap();
    agent_id
}

async fn seed_user_with_grant(store: &EngineStore, category: ResourceCategory, resource_id: &str, clearance: Clearance) -> String {
    let user_id = uid();
    let role_id = uid();
    let ps_id = uid();
    let ps = PermissionSet::new(&ps_id, now());
    store.put_permission_set(&ps).await.unwrap();
    store
        .put_grant(&ps_id, &Grant { id: uid(), category, resource_id: resource_id.to_string(), clearance })
        .await
        .unwrap();
    store.put_role(&Role { id: role_id.clone(), name: "role".to_string(), permission_set_id: ps_id }).await.unwrap();
    store.put_user_role(&user_id, &role_id).await.unwrap();
    user_id
}

#[tokio::test]
async fn scenario_1_level5_inline_execution() {
    let store = new_store().await;
    let (agent_id, _role) = seed_agent_with_grant(&store, ResourceCategory::Skill, "R1", Clearance::Level5).await;
    store.put_skill_text("R1", "the skill text").await.unwrap();
    let user_id = uid();

    let lifecycle = default_lifecycle(store.clone());
    let job = lifecycle
        .submit(SubmitRequest {
            channel_id: None,
            agent_id_override: Some(agent_id),
            caller: CallerRef::User(user_id),
            action: ActionKind::AccessSkill,
            resource_id: Some("R1".to_string()),
            payload: JobPayload::default(),
        })
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.effective_clearance, Some(Clearance::Level5));
    assert_eq!(job.result_data.as_deref(), Some("the skill text"));

    let logs = store.get_logs(&job.id).await.unwrap();
    assert!(logs.iter().any(|l| l.message.contains("Permission granted")));
    assert!(logs.iter().any(|l| l.message == "Job completed successfully"));
}

#[tokio::test]
async fn scenario_2_pending_then_self_approval() {
    let store = new_store().await;
    let (agent_id, _role) = seed_agent_with_grant(&store, ResourceCategory::Website, "R2", Clearance::Level1).await;
    let user_id = seed_user_with_grant(&store, ResourceCategory::Website, "R2", Clearance::Unset).await;

    let lifecycle = default_lifecycle(store.clone());
    let job = lifecycle
        .submit(SubmitRequest {
            channel_id: None,
            agent_id_override: Some(agent_id),
            caller: CallerRef::Anonymous,
            action: ActionKind::AccessWebsite,
            resource_id: Some("R2".to_string()),
            payload: JobPayload::default(),
        })
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::AwaitingApproval);
    assert_eq!(job.effective_clearance, Some(Clearance::Level1));

    let approved = lifecycle.approve(&job.id, CallerRef::User(user_id)).await.unwrap();
    assert_eq!(approved.status, JobStatus::Completed);
}

#[tokio::test]
async fn scenario_3_denied_for_missing_grant() {
    let store = new_store().await;
    let agent_id = seed_agent_no_grants(&store).await;

    let lifecycle = default_lifecycle(store.clone());
    let job = lifecycle
        .submit(SubmitRequest {
            channel_id: None,
            agent_id_override: Some(agent_id),
            caller: CallerRef::User(uid()),
            action: ActionKind::AccessContainer,
            resource_id: Some("R3".to_string()),
            payload: JobPayload::default(),
        })
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Denied);
    let logs = store.get_logs(&job.id).await.unwrap();
    assert!(logs.iter().any(|l| l.message.contains("does not have container access")));
}

#[tokio::test]
async fn scenario_4_channel_preauth_at_level2() {
    let store = new_store().await;
    let (agent_id, _role) = seed_agent_with_grant(&store, ResourceCategory::Website, "R4", Clearance::Level2).await;

    let ctx_ps_id = uid();
    let ctx_ps = PermissionSet::new(&ctx_ps_id, now());
    store.put_permission_set(&ctx_ps).await.unwrap();
    store
        .put_grant(&ctx_ps_id, &Grant { id: uid(), category: ResourceCategory::Website, resource_id: "R4".to_string(), clearance: Clearance::Level1 })
        .await
        .unwrap();

    let context_id = uid();
    store
        .put_channel_context(&ChannelContext {
            id: context_id.clone(),
            default_agent_id: None,
            permission_set_id: Some(ctx_ps_id),
            allowed_agents: Vec::new(),
            disable_chat_header: false,
        })
        .await
        .unwrap();

    let channel_id = uid();
    store
        .put_channel(&Channel {
            id: channel_id.clone(),
            default_agent_id: Some(agent_id),
            context_id: Some(context_id),
            permission_set_id: None,
            allowed_agents: Vec::new(),
            disable_chat_header: false,
        })
        .await
        .unwrap();

    let lifecycle = default_lifecycle(store.clone());
    let job = lifecycle
        .submit(SubmitRequest {
            channel_id: Some(channel_id),
            agent_id_override: None,
            caller: CallerRef::User(uid()),
            action: ActionKind::AccessWebsite,
            resource_id: Some("R4".to_string()),
            payload: JobPayload::default(),
        })
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    let logs = store.get_logs(&job.id).await.unwrap();
    assert!(logs.iter().any(|l| l.message.contains("Pre-authorized by channel/context permission set")));
}

#[tokio::test]
async fn scenario_5_level3_is_agent_only() {
    let store = new_store().await;
    let (agent_id, _role) = seed_agent_with_grant(&store, ResourceCategory::SafeShell, "R5", Clearance::Level3).await;
    let user_id = seed_user_with_grant(&store, ResourceCategory::SafeShell, "R5", Clearance::Level5).await;

    let lifecycle = default_lifecycle(store.clone());
    let job = lifecycle
        .submit(SubmitRequest {
            channel_id: None,
            agent_id_override: Some(agent_id),
            caller: CallerRef::User(user_id),
            action: ActionKind::ExecuteAsSafeShell,
            resource_id: Some("R5".to_string()),
            payload: JobPayload::default(),
        })
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::AwaitingApproval);
    assert_eq!(job.effective_clearance, Some(Clearance::Level3));
}

#[tokio::test]
async fn scenario_6_dangerous_shell_success() {
    let store = new_store().await;
    let (agent_id, _role) =
        seed_agent_with_grant(&store, ResourceCategory::DangerousShell, "SU", Clearance::Level5).await;
    store
        .put_system_user(&SystemUser { id: "SU".to_string(), name: "sys".to_string(), working_directory: None, sandbox_root: None })
        .await
        .unwrap();

    let lifecycle = default_lifecycle(store.clone());
    let job = lifecycle
        .submit(SubmitRequest {
            channel_id: None,
            agent_id_override: Some(agent_id),
            caller: CallerRef::User(uid()),
            action: ActionKind::UnsafeExecuteAsDangerousShell,
            resource_id: Some("SU".to_string()),
            payload: JobPayload { shell_kind: Some(ShellKind::Bash), script: Some("echo hello".to_string()), ..Default::default() },
        })
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.result_data.unwrap_or_default().contains("hello"));
}

#[tokio::test]
async fn scenario_7_transcription_ordering() {
    let store = new_store().await;
    let (agent_id, _role) =
        seed_agent_with_grant(&store, ResourceCategory::AudioDevice, "MIC", Clearance::Level5).await;

    let lifecycle = lifecycle_with(
        store.clone(),
        Arc::new(ScriptedAudioDriver { chunk_count: 3 }),
        Arc::new(SucceedingTranscriber),
    );

    let job = lifecycle
        .submit(SubmitRequest {
            channel_id: None,
            agent_id_override: Some(agent_id),
            caller: CallerRef::User(uid()),
            action: ActionKind::TranscribeFromAudioDevice,
            resource_id: Some("MIC".to_string()),
            payload: JobPayload {
                transcription_model: Some("test-model".to_string()),
                transcription_device_id: Some("MIC".to_string()),
                ..Default::default()
            },
        })
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Executing);

    // Consumer task runs concurrently; give it a moment to drain the three
    // scripted chunks.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let segments = store.get_segments(&job.id).await.unwrap();
    assert_eq!(segments.len(), 3);
    let mut last_start = -1.0;
    for segment in &segments {
        assert!(segment.start_time >= last_start);
        assert!(segment.end_time >= segment.start_time);
        last_start = segment.start_time;
    }
}

/// Builds a submit request for the AudioDevice transcription fixture
/// shared by both halves of the failure-policy test below.
fn transcription_request(agent_id: &str) -> SubmitRequest {
    SubmitRequest {
        channel_id: None,
        agent_id_override: Some(agent_id.to_string()),
        caller: CallerRef::User(uid()),
        action: ActionKind::TranscribeFromAudioDevice,
        resource_id: Some("MIC".to_string()),
        payload: JobPayload {
            transcription_model: Some("test-model".to_string()),
            transcription_device_id: Some("MIC".to_string()),
            ..Default::default()
        },
    }
}

#[tokio::test]
async fn scenario_7_transcription_failure_policy_below_threshold() {
    let store = new_store().await;
    let (agent_id, _role) =
        seed_agent_with_grant(&store, ResourceCategory::AudioDevice, "MIC", Clearance::Level5).await;

    let transcriber = Arc::new(FailingTranscriber { calls: AtomicUsize::new(0) });
    let lifecycle = lifecycle_with(store.clone(), Arc::new(ScriptedAudioDriver { chunk_count: 4 }), transcriber);

    let job = lifecycle.submit(transcription_request(&agent_id)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let after_four_failures = store.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(after_four_failures.status, JobStatus::Executing);
}

#[tokio::test]
async fn scenario_7_transcription_failure_policy_crosses_threshold() {
    let store = new_store().await;
    let (agent_id, _role) =
        seed_agent_with_grant(&store, ResourceCategory::AudioDevice, "MIC", Clearance::Level5).await;

    let transcriber = Arc::new(FailingTranscriber { calls: AtomicUsize::new(0) });
    let lifecycle = lifecycle_with(store.clone(), Arc::new(ScriptedAudioDriver { chunk_count: 5 }), transcriber);

    let job = lifecycle.submit(transcription_request(&agent_id)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let after_five_failures = store.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(after_five_failures.status, JobStatus::Failed);
    assert!(after_five_failures.error_log.unwrap_or_default().contains("5 consecutive"));
}

#[tokio::test]
async fn scenario_8_wildcard_immutability() {
    let store = new_store().await;
    let ps_id = uid();
    let ps = PermissionSet::new(&ps_id, now());
    store.put_permission_set(&ps).await.unwrap();

    let grant = Grant { id: uid(), category: ResourceCategory::Skill, resource_id: ALL_RESOURCES.to_string(), clearance: Clearance::Level1 };
    store.put_grant(&ps_id, &grant).await.unwrap();

    let mutated = Grant { clearance: Clearance::Level5, ..grant };
    let err = store.put_grant(&ps_id, &mutated).await.unwrap_err();
    assert!(matches!(err, clearance_engine::EngineError::InvariantViolation(_)));

    let reloaded = store.get_permission_set(&ps_id).await.unwrap().unwrap();
    let stored = reloaded.find_grant(ResourceCategory::Skill, ALL_RESOURCES).unwrap();
    assert_eq!(stored.clearance, Clearance::Level1);
}

#[tokio::test]
async fn approve_on_terminal_job_is_idempotent_no_op() {
    let store = new_store().await;
    let agent_id = seed_agent_no_grants(&store).await;
    let lifecycle = default_lifecycle(store.clone());

    let job = lifecycle
        .submit(SubmitRequest {
            channel_id: None,
            agent_id_override: Some(agent_id),
            caller: CallerRef::User(uid()),
            action: ActionKind::AccessContainer,
            resource_id: Some("R-missing".to_string()),
            payload: JobPayload::default(),
        })
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Denied);

    let before = store.get_logs(&job.id).await.unwrap().len();
    let result = lifecycle.approve(&job.id, CallerRef::User(uid())).await.unwrap();
    assert_eq!(result.status, JobStatus::Denied);

    let after = store.get_logs(&job.id).await.unwrap();
    assert_eq!(after.len(), before + 1);
    assert_eq!(after.last().unwrap().severity, Severity::Warning);
}

#[tokio::test]
async fn cancel_twice_is_idempotent() {
    let store = new_store().await;
    let (agent_id, _role) = seed_agent_with_grant(&store, ResourceCategory::Website, "R-cancel", Clearance::Level1).await;
    let lifecycle = default_lifecycle(store.clone());

    let job = lifecycle
        .submit(SubmitRequest {
            channel_id: None,
            agent_id_override: Some(agent_id),
            caller: CallerRef::Anonymous,
            action: ActionKind::AccessWebsite,
            resource_id: Some("R-cancel".to_string()),
            payload: JobPayload::default(),
        })
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::AwaitingApproval);

    let first = lifecycle.cancel(&job.id).await.unwrap();
    assert_eq!(first.status, JobStatus::Cancelled);
    let second = lifecycle.cancel(&job.id).await.unwrap();
    assert_eq!(second.status, JobStatus::Cancelled);

    let logs = store.get_logs(&job.id).await.unwrap();
    assert_eq!(logs.iter().filter(|l| l.message == "Job cancelled").count(), 1);
}

#[tokio::test]
async fn resubmitting_identical_parameters_creates_distinct_jobs() {
    let store = new_store().await;
    let (agent_id, _role) = seed_agent_with_grant(&store, ResourceCategory::Skill, "R-dup", Clearance::Level5).await;
    store.put_skill_text("R-dup", "text").await.unwrap();
    let lifecycle = default_lifecycle(store.clone());

    let request = || SubmitRequest {
        channel_id: None,
        agent_id_override: Some(agent_id.clone()),
        caller: CallerRef::User(uid()),
        action: ActionKind::AccessSkill,
        resource_id: Some("R-dup".to_string()),
        payload: JobPayload::default(),
    };

    let first = lifecycle.submit(request()).await.unwrap();
    let second = lifecycle.submit(request()).await.unwrap();
    assert_ne!(first.id, second.id);
}

#[tokio::test]
async fn container_registry_round_trips_by_name() {
    let store = new_store().await;
    let container = Container {
        id: uid(),
        name: "sandbox-a".to_string(),
        kind: ContainerKind::SandboxedDsl,
        path: "/tmp/sandbox-a".to_string(),
        description: None,
        created_at: now(),
    };
    store.put_container(&container).await.unwrap();
    let found = store.get_container_by_name("sandbox-a").await.unwrap().unwrap();
    assert_eq!(found.id, container.id);
}
