//! External collaborator interfaces (spec.md §6).
//!
//! Everything here is out of scope per spec.md §1: this crate only depends
//! on these traits, never on a concrete provider/compiler/capture-device
//! implementation. Grounded on `engine/providers.rs`'s `AnyProvider`
//! enum-dispatch, narrowed to a trait object since this crate has no fixed
//! provider roster to enumerate at compile time.

use crate::domain::{
    Channel, ChannelContext, Container, Grant, Job, LogEntry, PermissionSet, Role,
    TranscriptionSegment,
};
use crate::error::EngineResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A single streamed chunk from `streamChatCompletionWithTools`: either a
/// plain text delta or the terminal content+tool-calls payload.
#[derive(Debug, Clone)]
pub enum ChatStreamEvent {
    TextDelta(String),
    Final { content: Option<String>, tool_calls: Vec<ToolCallRequest> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: Option<String>,
    pub tool_call_id: Option<String>,
    pub tool_calls: Option<Vec<ToolCallRequest>>,
}

#[derive(Debug, Clone)]
pub struct ChatCompletion {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Chat-history persistence for the tool-call loop (spec.md §4.7: "the
/// user message is persisted after the loop, once"). Grounded on
/// `engine/sessions.rs`'s message-append/history-read pair.
#[async_trait]
pub trait ChatHistoryStore: Send + Sync {
    async fn get_history(&self, channel_id: &str) -> EngineResult<Vec<ChatMessage>>;
    async fn append_message(&self, channel_id: &str, message: &ChatMessage) -> EngineResult<()>;
}

/// The provider chat client (spec.md §6). One trait object per chat loop
/// invocation — the concrete HTTP client, retry/backoff, and wire format
/// live entirely outside this crate.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn chat_completion(
        &self,
        model: &str,
        system_prompt: &str,
        messages: &[ChatMessage],
    ) -> EngineResult<String>;

    async fn chat_completion_with_tools(
        &self,
        model: &str,
        system_prompt: &str,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> EngineResult<ChatCompletion>;

    /// Returns ordered events; the last event is always `Final`.
    async fn stream_chat_completion_with_tools(
        &self,
        model: &str,
        system_prompt: &str,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        ct: CancellationToken,
    ) -> EngineResult<Vec<ChatStreamEvent>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscribedSegment {
    pub text: String,
    pub start: f64,
    pub end: f64,
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcription {
    pub text: String,
    pub duration: f64,
    pub segments: Vec<TranscribedSegment>,
}

/// The speech-to-text client (spec.md §6).
#[async_trait]
pub trait TranscriptionClient: Send + Sync {
    async fn transcribe(
        &self,
        model: &str,
        wav_bytes: &[u8],
        language: Option<&str>,
    ) -> EngineResult<Transcription>;
}

/// Resolves and decrypts the provider API key a transcription job needs
/// before capture starts (spec.md §4.6 step 1). Grounded on the teacher's
/// skill-vault encryption (`engine/skills/crypto.rs`): AES-256-GCM with
/// the vault key held in the OS keychain, zeroized once read.
#[async_trait]
pub trait ProviderKeyResolver: Send + Sync {
    async fn resolve_key(&self, model_id: &str) -> EngineResult<zeroize::Zeroizing<String>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioDeviceInfo {
    pub id: String,
    pub name: String,
}

/// Invoked by the capture driver for every chunk; contract: sequential,
/// never concurrent with itself (spec.md §4.6/§6).
pub type OnChunk = Box<dyn FnMut(Vec<u8>, u32) -> EngineResult<()> + Send>;

/// The audio-capture driver (spec.md §6).
#[async_trait]
pub trait AudioCaptureDriver: Send + Sync {
    async fn list_devices(&self) -> EngineResult<Vec<AudioDeviceInfo>>;

    async fn capture(
        &self,
        device_id: &str,
        chunk_duration: Duration,
        on_chunk: OnChunk,
        ct: CancellationToken,
    ) -> EngineResult<()>;
}

#[derive(Debug, Clone)]
pub struct CompiledScript {
    pub handle: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub index: u32,
    pub verb: String,
    pub success: bool,
    pub attempts: u32,
    pub duration_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub all_succeeded: bool,
    pub steps: Vec<StepResult>,
    pub total_duration_ms: u64,
}

/// The safe-DSL compiler/executor (spec.md §6) — a sandboxed scripting
/// surface distinct from the dangerous-shell executor's real interpreter.
#[async_trait]
pub trait SafeDslRuntime: Send + Sync {
    async fn compile(
        &self,
        script: &str,
        workspace: &str,
        opts: serde_json::Value,
    ) -> EngineResult<CompiledScript>;

    async fn execute(&self, compiled: &CompiledScript, ct: CancellationToken) -> EngineResult<ExecutionReport>;
}

/// The sandbox/container registrar (spec.md §6), grounded on
/// `sandbox.rs`'s Docker client setup.
#[async_trait]
pub trait SandboxRegistrar: Send + Sync {
    async fn register(&self, sandbox_name: &str, root_path: &str) -> EngineResult<()>;
}

/// Permission-model persistence (spec.md §6): "transactional read/write of
/// entities in §3; must reject wildcard-grant mutations."
#[async_trait]
pub trait PermissionStore: Send + Sync {
    async fn get_permission_set(&self, id: &str) -> EngineResult<Option<PermissionSet>>;
    async fn put_permission_set(&self, ps: &PermissionSet) -> EngineResult<()>;

    /// Insert or update a grant. Must reject any mutation touching a grant
    /// whose `resource_id` is `ALL_RESOURCES` if one already exists for the
    /// same `(permission_set_id, category)` — the persistence-layer
    /// wildcard-immutability check (spec.md §5, §8 scenario 8).
    async fn put_grant(&self, permission_set_id: &str, grant: &Grant) -> EngineResult<()>;
    async fn delete_grant(&self, permission_set_id: &str, grant_id: &str) -> EngineResult<()>;

    async fn get_role(&self, id: &str) -> EngineResult<Option<Role>>;
    async fn put_role(&self, role: &Role) -> EngineResult<()>;
    async fn get_channel(&self, id: &str) -> EngineResult<Option<Channel>>;
    async fn put_channel(&self, channel: &Channel) -> EngineResult<()>;
    async fn get_channel_context(&self, id: &str) -> EngineResult<Option<ChannelContext>>;
    async fn put_channel_context(&self, context: &ChannelContext) -> EngineResult<()>;

    async fn get_agent_role_id(&self, agent_id: &str) -> EngineResult<Option<String>>;
    async fn get_user_role_id(&self, user_id: &str) -> EngineResult<Option<String>>;
    async fn put_user_role(&self, user_id: &str, role_id: &str) -> EngineResult<()>;
}

/// Job lifecycle persistence (spec.md §6/§4.4).
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert_job(&self, job: &Job) -> EngineResult<()>;
    async fn get_job(&self, id: &str) -> EngineResult<Option<Job>>;
    async fn update_job(&self, job: &Job) -> EngineResult<()>;

    async fn append_log(&self, entry: &LogEntry) -> EngineResult<()>;
    async fn get_logs(&self, job_id: &str) -> EngineResult<Vec<LogEntry>>;

    async fn append_segment(&self, segment: &TranscriptionSegment) -> EngineResult<()>;
    async fn get_segments(&self, job_id: &str) -> EngineResult<Vec<TranscriptionSegment>>;
    async fn get_segments_since(&self, job_id: &str, timestamp: f64) -> EngineResult<Vec<TranscriptionSegment>>;

    /// Jobs left `Executing` or `Queued` for a transcription kind across a
    /// process restart — reconciled to `Cancelled` on startup (spec.md §4.6).
    async fn list_stale_transcription_jobs(&self) -> EngineResult<Vec<Job>>;

    async fn get_container(&self, id: &str) -> EngineResult<Option<Container>>;
    async fn put_container(&self, container: &Container) -> EngineResult<()>;

    /// Sandbox-name lookup for the chat tool-call loop's tool-call
    /// translation step (spec.md §4.7: "sandbox name lookup when no
    /// resource id is supplied").
    async fn get_container_by_name(&self, name: &str) -> EngineResult<Option<Container>>;

    async fn get_system_user(&self, id: &str) -> EngineResult<Option<crate::domain::SystemUser>>;
    async fn put_system_user(&self, user: &crate::domain::SystemUser) -> EngineResult<()>;

    async fn get_skill_text(&self, resource_id: &str) -> EngineResult<Option<String>>;
    async fn put_skill_text(&self, resource_id: &str, text: &str) -> EngineResult<()>;

    async fn put_agent(&self, agent: &crate::domain::Agent) -> EngineResult<()>;
    async fn get_agent(&self, id: &str) -> EngineResult<Option<crate::domain::Agent>>;
}

/// `{provider, message}` pairs used to decide a transient-provider retry
/// (spec.md §7: HTTP 429 with `insufficient_quota` promotes to permanent).
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 3, base_delay: Duration::from_secs(2) }
    }
}

impl RetryPolicy {
    /// `2s * 2^n`, capped at `max_retries` attempts.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.pow(attempt)
    }
}

/// Whether an HTTP 429 body should be promoted to a permanent failure
/// rather than retried (spec.md §7).
pub fn is_permanent_quota_error(status: u16, body: &str) -> bool {
    status == 429 && body.contains("insufficient_quota")
}

/// Retry a transient provider call with exponential backoff, honoring
/// cancellation. `should_retry` inspects the error to decide whether
/// another attempt is warranted (e.g. not a quota-exhaustion 429).
pub async fn with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    ct: &CancellationToken,
    mut should_retry: impl FnMut(&EngineResult<T>) -> bool,
    mut call: F,
) -> EngineResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = EngineResult<T>>,
{
    let mut attempt = 0;
    loop {
        let result = call().await;
        if ct.is_cancelled() {
            return Err(crate::error::EngineError::Cancelled);
        }
        if result.is_ok() || attempt >= policy.max_retries || !should_retry(&result) {
            return result;
        }
        tokio::select! {
            _ = tokio::time::sleep(policy.delay_for(attempt)) => {}
            _ = ct.cancelled() => return Err(crate::error::EngineError::Cancelled),
        }
        attempt += 1;
    }
}
