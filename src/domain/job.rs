//! Jobs, their payloads, logs, and transcription segments (spec.md §3).

use super::permission::ResourceCategory;
use serde::{Deserialize, Serialize};

/// The exhaustive action-kind tag set (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    CreateSubAgent,
    CreateContainer,
    RegisterInfoStore,
    EditAnyTask,
    ExecuteAsSafeShell,
    UnsafeExecuteAsDangerousShell,
    AccessLocalInfoStore,
    AccessExternalInfoStore,
    AccessWebsite,
    QuerySearchEngine,
    AccessContainer,
    ManageAgent,
    EditTask,
    AccessSkill,
    TranscribeFromAudioDevice,
    TranscribeFromAudioStream,
    TranscribeFromAudioFile,
}

impl ActionKind {
    /// The resource category a per-resource action is checked against, or
    /// `None` for the four resourceless global-flag actions this tag set
    /// reaches (spec.md §9's "evaluator dispatches on the tag").
    pub fn category(&self) -> Option<ResourceCategory> {
        use ActionKind::*;
        match self {
            CreateSubAgent | CreateContainer | RegisterInfoStore | EditAnyTask => None,
            ExecuteAsSafeShell => Some(ResourceCategory::SafeShell),
            UnsafeExecuteAsDangerousShell => Some(ResourceCategory::DangerousShell),
            AccessLocalInfoStore => Some(ResourceCategory::LocalInfoStore),
            AccessExternalInfoStore => Some(ResourceCategory::ExternalInfoStore),
            AccessWebsite => Some(ResourceCategory::Website),
            QuerySearchEngine => Some(ResourceCategory::SearchEngine),
            AccessContainer => Some(ResourceCategory::Container),
            ManageAgent => Some(ResourceCategory::Agent),
            EditTask => Some(ResourceCategory::Task),
            AccessSkill => Some(ResourceCategory::Skill),
            TranscribeFromAudioDevice | TranscribeFromAudioStream | TranscribeFromAudioFile => {
                Some(ResourceCategory::AudioDevice)
            }
        }
    }

    pub fn is_transcription(&self) -> bool {
        matches!(
            self,
            ActionKind::TranscribeFromAudioDevice
                | ActionKind::TranscribeFromAudioStream
                | ActionKind::TranscribeFromAudioFile
        )
    }

    pub fn is_global_flag(&self) -> bool {
        self.category().is_none()
    }

    /// The [`super::permission::GlobalFlag`] a resourceless action checks,
    /// or `None` for every per-resource action.
    pub fn global_flag(&self) -> Option<super::permission::GlobalFlag> {
        use super::permission::GlobalFlag;
        match self {
            ActionKind::CreateSubAgent => Some(GlobalFlag::CreateSubAgent),
            ActionKind::CreateContainer => Some(GlobalFlag::CreateContainer),
            ActionKind::RegisterInfoStore => Some(GlobalFlag::RegisterInfoStore),
            ActionKind::EditAnyTask => Some(GlobalFlag::EditAnyTask),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShellKind {
    Bash,
    PowerShellCrossPlatform,
    CommandPromptWindows,
    GitSubcommand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    AwaitingApproval,
    Executing,
    Completed,
    Failed,
    Denied,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Denied | JobStatus::Cancelled
        )
    }

    /// True if `self -> next` is a legal transition per spec.md §3.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, AwaitingApproval) | (Queued, Denied) | (Queued, Executing)
                | (AwaitingApproval, Executing) | (AwaitingApproval, Denied) | (AwaitingApproval, Cancelled)
                | (Executing, Completed) | (Executing, Failed) | (Executing, Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::AwaitingApproval => "awaiting_approval",
            JobStatus::Executing => "executing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Denied => "denied",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "queued" => JobStatus::Queued,
            "awaiting_approval" => JobStatus::AwaitingApproval,
            "executing" => JobStatus::Executing,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            "denied" => JobStatus::Denied,
            "cancelled" => JobStatus::Cancelled,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "warning" => Severity::Warning,
            "error" => Severity::Error,
            _ => Severity::Info,
        }
    }
}

/// Action-specific fields. Every field is optional because only a subset
/// applies to any one action kind — mirrors the loosely-typed JSON argument
/// blobs the chat tool-call loop actually receives per call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobPayload {
    pub shell_kind: Option<ShellKind>,
    pub script: Option<String>,
    pub working_directory: Option<String>,

    pub transcription_model: Option<String>,
    pub transcription_device_id: Option<String>,
    pub transcription_language: Option<String>,

    pub sub_agent_name: Option<String>,
    pub sub_agent_model_id: Option<String>,
    pub sub_agent_system_prompt: Option<String>,

    pub container_name: Option<String>,
    pub container_path: Option<String>,
    pub container_description: Option<String>,

    pub manage_agent_name: Option<String>,
    pub manage_agent_system_prompt: Option<String>,
    pub manage_agent_model_id: Option<String>,

    pub task_name: Option<String>,
    pub task_repeat_interval: Option<String>,
    pub task_max_retries: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: String,
    pub job_id: String,
    pub severity: Severity,
    pub message: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionSegment {
    pub id: String,
    pub job_id: String,
    pub start_time: f64,
    pub end_time: f64,
    pub text: String,
    pub confidence: Option<f64>,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerKind {
    SandboxedDsl,
    Docker,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Container {
    pub id: String,
    pub name: String,
    pub kind: ContainerKind,
    pub path: String,
    pub description: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemUser {
    pub id: String,
    pub name: String,
    pub working_directory: Option<String>,
    pub sandbox_root: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub agent_id: String,
    pub channel_id: Option<String>,
    pub caller_user_id: Option<String>,
    pub caller_agent_id: Option<String>,
    pub action: ActionKind,
    pub resource_id: Option<String>,
    pub status: JobStatus,
    pub effective_clearance: Option<super::permission::Clearance>,
    pub approved_by_user_id: Option<String>,
    pub approved_by_agent_id: Option<String>,
    pub result_data: Option<String>,
    pub error_log: Option<String>,
    pub payload: JobPayload,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}
