//! Chat Tool-Call Loop (spec.md §4.7), grounded directly on
//! `agent_loop/mod.rs::run_agent_turn`: round cap, per-round tool-call
//! assembly, the `PendingApprovals`-oneshot approval pattern (here an
//! `ApprovalCallback` trait object), and an ordered event sequence
//! (`ChatEvent`) replacing the teacher's `tauri::Emitter::emit` — this
//! crate has no UI layer, so events are returned as an ordered `Vec`
//! (non-streaming) or pushed onto a `tokio::sync::mpsc` sender
//! (streaming), per Design Note §9's "lazy sequence of tagged events".

use crate::domain::{ActionKind, CallerRef, Job, JobPayload, JobStatus, ShellKind};
use crate::error::{EngineError, EngineResult};
use crate::external::{ChatHistoryStore, ChatMessage, ChatProvider, ChatStreamEvent, ToolCallRequest, ToolDefinition};
use crate::lifecycle::{JobLifecycleManager, SubmitRequest};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const ROUND_CAP: u32 = 10;

/// The closed event-tag set of spec.md §6.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    TextDelta(String),
    ApprovalRequired(Job),
    ApprovalDecision(Job),
    ToolStart(Job),
    Complete(ChatTurnResult),
}

#[derive(Debug, Clone)]
pub struct ChatTurnResult {
    pub final_text: String,
    pub jobs: Vec<Job>,
}

/// The human-in-the-loop approval prompt (spec.md §4.7 step 3c). One call
/// per job awaiting approval; `true` approves, `false` cancels.
#[async_trait]
pub trait ApprovalCallback: Send + Sync {
    async fn ask(&self, job: &Job) -> bool;
}

/// Fixed tool-name → action-kind table (spec.md §4.7 step 3a). Unknown
/// tool names are a caller/provider bug, not a clearance question — they
/// surface as a `ValidationError` tool-result rather than panicking.
fn action_kind_for_tool(name: &str) -> Option<ActionKind> {
    use ActionKind::*;
    Some(match name {
        "create_sub_agent" => CreateSubAgent,
        "create_container" => CreateContainer,
        "register_info_store" => RegisterInfoStore,
        "edit_any_task" => EditAnyTask,
        "exec_safe_shell" => ExecuteAsSafeShell,
        "exec_dangerous_shell" => UnsafeExecuteAsDangerousShell,
        "access_local_info_store" => AccessLocalInfoStore,
        "access_external_info_store" => AccessExternalInfoStore,
        "access_website" => AccessWebsite,
        "query_search_engine" => QuerySearchEngine,
        "access_container" => AccessContainer,
        "manage_agent" => ManageAgent,
        "edit_task" => EditTask,
        "access_skill" => AccessSkill,
        "transcribe_audio_device" => TranscribeFromAudioDevice,
        "transcribe_audio_stream" => TranscribeFromAudioStream,
        "transcribe_audio_file" => TranscribeFromAudioFile,
        _ => return None,
    })
}

fn string_arg(args: &Value, key: &str) -> Option<String> {
    args.get(key).and_then(Value::as_str).map(str::to_string)
}

fn shell_kind_arg(args: &Value) -> Option<ShellKind> {
    match string_arg(args, "shell_kind").as_deref() {
        Some("bash") => Some(ShellKind::Bash),
        Some("powershell") | Some("power_shell_cross_platform") => Some(ShellKind::PowerShellCrossPlatform),
        Some("cmd") | Some("command_prompt_windows") => Some(ShellKind::CommandPromptWindows),
        Some("git") | Some("git_subcommand") => Some(ShellKind::GitSubcommand),
        _ => None,
    }
}

fn payload_from_args(action: ActionKind, args: &Value) -> JobPayload {
    JobPayload {
        shell_kind: shell_kind_arg(args),
        script: string_arg(args, "script"),
        working_directory: string_arg(args, "working_directory"),
        transcription_model: string_arg(args, "model_id"),
        transcription_device_id: string_arg(args, "device_id"),
        transcription_language: string_arg(args, "language"),
        sub_agent_name: string_arg(args, "name"),
        sub_agent_model_id: string_arg(args, "model_id"),
        sub_agent_system_prompt: string_arg(args, "system_prompt"),
        container_name: string_arg(args, "name"),
        container_path: string_arg(args, "path"),
        container_description: string_arg(args, "description"),
        manage_agent_name: if action == ActionKind::ManageAgent { string_arg(args, "name") } else { None },
        manage_agent_system_prompt: if action == ActionKind::ManageAgent {
            string_arg(args, "system_prompt")
        } else {
            None
        },
        manage_agent_model_id: if action == ActionKind::ManageAgent { string_arg(args, "model_id") } else { None },
        task_name: string_arg(args, "task_name"),
        task_repeat_interval: string_arg(args, "repeat_interval"),
        task_max_retries: args.get("max_retries").and_then(Value::as_i64),
    }
}

/// Translate one streamed/returned tool call into a [`SubmitRequest`],
/// resolving a bare sandbox name to its container id when the model
/// supplied no explicit `resource_id` (spec.md §4.7 step 3a).
async fn build_submit_request(
    lifecycle: &JobLifecycleManager,
    channel_id: Option<&str>,
    caller: &CallerRef,
    tool_call: &ToolCallRequest,
) -> EngineResult<(ActionKind, SubmitRequest)> {
    let action = action_kind_for_tool(&tool_call.name)
        .ok_or_else(|| EngineError::Validation(format!("unknown tool {}", tool_call.name)))?;

    let mut resource_id = string_arg(&tool_call.arguments, "resource_id");
    if resource_id.is_none() {
        if let Some(sandbox_name) = string_arg(&tool_call.arguments, "sandbox_name") {
            if let Some(container) = lifecycle.job_store().get_container_by_name(&sandbox_name).await? {
                resource_id = Some(container.id);
            }
        }
    }

    Ok((
        action,
        SubmitRequest {
            channel_id: channel_id.map(str::to_string),
            agent_id_override: string_arg(&tool_call.arguments, "agent_id"),
            caller: caller.clone(),
            action,
            resource_id,
            payload: payload_from_args(action, &tool_call.arguments),
        },
    ))
}

#[derive(Debug, Clone, serde::Serialize)]
struct ToolResultPayload {
    status: &'static str,
    result: Option<String>,
    error: Option<String>,
}

fn tool_result_message(tool_call_id: &str, job: &Job) -> ChatMessage {
    let payload = match job.status {
        JobStatus::Completed => ToolResultPayload { status: "completed", result: job.result_data.clone(), error: None },
        JobStatus::Executing => ToolResultPayload {
            status: "executing",
            result: Some("transcription in progress".to_string()),
            error: None,
        },
        JobStatus::Failed => {
            ToolResultPayload { status: "failed", result: None, error: job.error_log.clone() }
        }
        JobStatus::Denied => ToolResultPayload { status: "denied", result: None, error: job.error_log.clone() },
        JobStatus::Cancelled => ToolResultPayload { status: "cancelled", result: None, error: None },
        JobStatus::AwaitingApproval => {
            ToolResultPayload { status: "awaiting_approval", result: None, error: None }
        }
        JobStatus::Queued => ToolResultPayload { status: "queued", result: None, error: None },
    };
    ChatMessage {
        role: "tool".to_string(),
        content: Some(serde_json::to_string(&payload).unwrap_or_default()),
        tool_call_id: Some(tool_call_id.to_string()),
        tool_calls: None,
    }
}

/// Everything one chat turn needs beyond the history itself.
pub struct ChatTurnContext<'a> {
    pub provider: &'a dyn ChatProvider,
    pub history_store: &'a dyn ChatHistoryStore,
    pub lifecycle: &'a JobLifecycleManager,
    pub approval: &'a dyn ApprovalCallback,
    pub channel_id: String,
    pub model: String,
    pub system_prompt: String,
    pub tools: Vec<ToolDefinition>,
    pub session_caller: CallerRef,
}

/// One round's worth of tool-call handling shared by the streaming and
/// non-streaming entry points (spec.md §4.7 step 3).
async fn handle_tool_calls(
    ctx: &ChatTurnContext<'_>,
    tool_calls: &[ToolCallRequest],
    history: &mut Vec<ChatMessage>,
    jobs: &mut Vec<Job>,
    events: &mut Vec<ChatEvent>,
) -> EngineResult<bool> {
    let mut any_awaiting = false;

    for tool_call in tool_calls {
        let (action, request) = match build_submit_request(
            ctx.lifecycle,
            Some(&ctx.channel_id),
            &ctx.session_caller,
            tool_call,
        )
        .await
        {
            Ok(pair) => pair,
            Err(e) => {
                history.push(ChatMessage {
                    role: "tool".to_string(),
                    content: Some(format!("{{\"status\":\"denied\",\"error\":\"{e}\"}}")),
                    tool_call_id: Some(tool_call.id.clone()),
                    tool_calls: None,
                });
                continue;
            }
        };
        let _ = action;

        let mut job = ctx.lifecycle.submit(request).await?;
        events.push(ChatEvent::ToolStart(job.clone()));

        if job.status == JobStatus::AwaitingApproval {
            if ctx.lifecycle.could_satisfy(&job, &ctx.session_caller).await? {
                events.push(ChatEvent::ApprovalRequired(job.clone()));
                let approved = ctx.approval.ask(&job).await;
                job = if approved {
                    ctx.lifecycle.approve(&job.id, ctx.session_caller.clone()).await?
                } else {
                    ctx.lifecycle.cancel(&job.id).await?
                };
                events.push(ChatEvent::ApprovalDecision(job.clone()));
            } else {
                job = ctx.lifecycle.cancel(&job.id).await?;
            }
        }

        if job.status == JobStatus::AwaitingApproval {
            any_awaiting = true;
        }

        history.push(tool_result_message(&tool_call.id, &job));
        jobs.push(job);
    }

    Ok(any_awaiting)
}

/// Non-streaming entry point (spec.md §4.7).
pub async fn run_turn(ctx: ChatTurnContext<'_>, user_message: &str) -> EngineResult<ChatTurnResult> {
    let mut history = ctx.history_store.get_history(&ctx.channel_id).await?;
    history.push(ChatMessage { role: "user".to_string(), content: Some(user_message.to_string()), tool_call_id: None, tool_calls: None });

    let mut jobs = Vec::new();
    let mut events = Vec::new();
    let mut final_text = String::new();
    let mut round = 0u32;

    loop {
        round += 1;
        let completion = ctx
            .provider
            .chat_completion_with_tools(&ctx.model, &ctx.system_prompt, &history, &ctx.tools)
            .await?;

        if completion.tool_calls.is_empty() || round > ROUND_CAP {
            final_text = completion.content.unwrap_or_default();
            break;
        }

        history.push(ChatMessage {
            role: "assistant".to_string(),
            content: completion.content.clone(),
            tool_call_id: None,
            tool_calls: Some(completion.tool_calls.clone()),
        });

        let any_awaiting = handle_tool_calls(&ctx, &completion.tool_calls, &mut history, &mut jobs, &mut events).await?;

        if any_awaiting {
            let last = ctx
                .provider
                .chat_completion(&ctx.model, &ctx.system_prompt, &history)
                .await?;
            final_text = last;
            break;
        }
    }

    ctx.history_store
        .append_message(&ctx.channel_id, &ChatMessage { role: "user".to_string(), content: Some(user_message.to_string()), tool_call_id: None, tool_calls: None })
        .await?;
    ctx.history_store
        .append_message(
            &ctx.channel_id,
            &ChatMessage { role: "assistant".to_string(), content: Some(final_text.clone()), tool_call_id: None, tool_calls: None },
        )
        .await?;

    Ok(ChatTurnResult { final_text, jobs })
}

/// Streaming entry point: identical round logic, but text deltas are
/// pushed onto `event_tx` as they arrive and a terminal `Complete` event
/// closes the stream (spec.md §6: "Complete always terminates the
/// stream").
pub async fn run_turn_streaming(
    ctx: ChatTurnContext<'_>,
    user_message: &str,
    event_tx: mpsc::Sender<ChatEvent>,
    ct: CancellationToken,
) -> EngineResult<ChatTurnResult> {
    let mut history = ctx.history_store.get_history(&ctx.channel_id).await?;
    history.push(ChatMessage { role: "user".to_string(), content: Some(user_message.to_string()), tool_call_id: None, tool_calls: None });

    let mut jobs = Vec::new();
    let mut final_text = String::new();
    let mut round = 0u32;

    'rounds: loop {
        round += 1;
        let stream_events = ctx
            .provider
            .stream_chat_completion_with_tools(&ctx.model, &ctx.system_prompt, &history, &ctx.tools, ct.clone())
            .await?;

        let mut content = None;
        let mut tool_calls = Vec::new();
        let mut round_text = String::new();

        for event in stream_events {
            match event {
                ChatStreamEvent::TextDelta(delta) => {
                    round_text.push_str(&delta);
                    let _ = event_tx.send(ChatEvent::TextDelta(delta)).await;
                }
                ChatStreamEvent::Final { content: c, tool_calls: calls } => {
                    content = c;
                    tool_calls = calls;
                }
            }
        }

        if tool_calls.is_empty() || round > ROUND_CAP {
            final_text = content.unwrap_or(round_text);
            break 'rounds;
        }

        history.push(ChatMessage {
            role: "assistant".to_string(),
            content: content.clone(),
            tool_call_id: None,
            tool_calls: Some(tool_calls.clone()),
        });

        let mut events = Vec::new();
        let any_awaiting = handle_tool_calls(&ctx, &tool_calls, &mut history, &mut jobs, &mut events).await?;
        for event in events {
            let _ = event_tx.send(event).await;
        }

        if any_awaiting {
            let last = ctx
                .provider
                .chat_completion(&ctx.model, &ctx.system_prompt, &history)
                .await?;
            final_text = last;
            break 'rounds;
        }
    }

    ctx.history_store
        .append_message(&ctx.channel_id, &ChatMessage { role: "user".to_string(), content: Some(user_message.to_string()), tool_call_id: None, tool_calls: None })
        .await?;
    ctx.history_store
        .append_message(
            &ctx.channel_id,
            &ChatMessage { role: "assistant".to_string(), content: Some(final_text.clone()), tool_call_id: None, tool_calls: None },
        )
        .await?;

    let result = ChatTurnResult { final_text, jobs };
    let _ = event_tx.send(ChatEvent::Complete(result.clone())).await;
    Ok(result)
}
