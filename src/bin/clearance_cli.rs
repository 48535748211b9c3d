//! Demo CLI for the clearance engine (no counterpart in the teacher, which
//! has no CLI of its own — shaped after `linggen-linggen-agent`'s
//! `clap::Parser`/`Subcommand` front end and `tokio::main` entry point).
//!
//! Exercises the job lifecycle end to end against an on-disk SQLite store:
//! seed a role/permission set, submit a job, inspect it, approve or cancel
//! it, and tail its log.

use clap::{Parser, Subcommand};
use clearance_engine::domain::{
    ActionKind, CallerRef, Clearance, JobPayload, PermissionSet, Role, ShellKind,
};
use clearance_engine::external::{JobStore, PermissionStore};
use clearance_engine::lifecycle::{JobLifecycleManager, SubmitRequest};
use clearance_engine::store::{default_db_path, EngineStore};
use clearance_engine::transcription::TranscriptionOrchestrator;
use clearance_engine::{EngineError, EngineResult};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "clearance-cli", version, about = "Inspect and drive the clearance engine's job lifecycle")]
struct Cli {
    /// Path to the SQLite database. Defaults to ~/.clearance-engine/engine.db
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Seed a permission set + role with a given default clearance, so a
    /// first submission has somewhere to resolve an agent's role from.
    SeedRole {
        #[arg(long)]
        role_id: String,
        #[arg(long)]
        permission_set_id: String,
        #[arg(long, value_parser = parse_clearance, default_value = "level1")]
        default_clearance: Clearance,
    },
    /// Register an agent against an already-seeded role.
    SeedAgent {
        #[arg(long)]
        agent_id: String,
        #[arg(long)]
        role_id: String,
    },
    /// Register a user against an already-seeded role.
    SeedUser {
        #[arg(long)]
        user_id: String,
        #[arg(long)]
        role_id: String,
    },
    /// Submit a safe-shell job as an independent (Level5-default) caller.
    Submit {
        #[arg(long)]
        agent_id: String,
        #[arg(long, value_parser = parse_action)]
        action: ActionKind,
        #[arg(long)]
        resource_id: Option<String>,
        #[arg(long)]
        script: Option<String>,
        #[arg(long)]
        user_id: Option<String>,
    },
    /// Approve a job awaiting approval, as the given user.
    Approve {
        job_id: String,
        #[arg(long)]
        user_id: String,
    },
    /// Cancel a job.
    Cancel { job_id: String },
    /// Print a job's current state and its log entries.
    Show { job_id: String },
}

fn parse_clearance(s: &str) -> Result<Clearance, String> {
    Ok(match s.to_lowercase().as_str() {
        "unset" => Clearance::Unset,
        "level1" | "samelevel" | "samelevel user" => Clearance::Level1,
        "level2" | "whitelisteduser" => Clearance::Level2,
        "level3" | "permittedagent" => Clearance::Level3,
        "level4" | "whitelistedagent" => Clearance::Level4,
        "level5" | "independent" => Clearance::Level5,
        other => return Err(format!("unknown clearance level {other}")),
    })
}

fn parse_action(s: &str) -> Result<ActionKind, String> {
    serde_json::from_value(serde_json::Value::String(s.to_string())).map_err(|e| e.to_string())
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[tokio::main]
async fn main() -> EngineResult<()> {
    env_logger::init();
    let cli = Cli::parse();
    let db_path = cli.db.unwrap_or_else(default_db_path);
    let store = Arc::new(EngineStore::open(&db_path)?);

    match cli.cmd {
        Command::SeedRole { role_id, permission_set_id, default_clearance } => {
            let mut ps = PermissionSet::new(&permission_set_id, now());
            ps.default_clearance = default_clearance;
            store.put_permission_set(&ps).await?;
            store
                .put_role(&Role { id: role_id.clone(), name: role_id.clone(), permission_set_id: permission_set_id.clone() })
                .await?;
            println!("seeded role {role_id} -> permission set {permission_set_id} ({})", default_clearance.name());
        }
        Command::SeedAgent { agent_id, role_id } => {
            let agent = clearance_engine::domain::Agent { id: agent_id.clone(), role_id: Some(role_id), model_id: None };
            store.put_agent(&agent).await?;
            println!("seeded agent {agent_id}");
        }
        Command::SeedUser { user_id, role_id } => {
            store.put_user_role(&user_id, &role_id).await?;
            println!("seeded user {user_id} -> role {role_id}");
        }
        Command::Submit { agent_id, action, resource_id, script, user_id } => {
            let lifecycle = build_lifecycle(store.clone());
            let caller = match user_id {
                Some(id) => CallerRef::User(id),
                None => CallerRef::Anonymous,
            };
            let payload = JobPayload { script, shell_kind: Some(ShellKind::Bash), ..Default::default() };
            let job = lifecycle
                .submit(SubmitRequest {
                    channel_id: None,
                    agent_id_override: Some(agent_id),
                    caller,
                    action,
                    resource_id,
                    payload,
                })
                .await?;
            println!("job {} -> {}", job.id, job.status.as_str());
        }
        Command::Approve { job_id, user_id } => {
            let lifecycle = build_lifecycle(store.clone());
            let job = lifecycle.approve(&job_id, CallerRef::User(user_id)).await?;
            println!("job {} -> {}", job.id, job.status.as_str());
        }
        Command::Cancel { job_id } => {
            let lifecycle = build_lifecycle(store.clone());
            let job = lifecycle.cancel(&job_id).await?;
            println!("job {} -> {}", job.id, job.status.as_str());
        }
        Command::Show { job_id } => {
            let job = store
                .get_job(&job_id)
                .await?
                .ok_or_else(|| EngineError::Validation(format!("no such job {job_id}")))?;
            println!("{job:#?}");
            for entry in store.get_logs(&job_id).await? {
                println!("[{}] {} {}", entry.created_at, entry.severity.as_str(), entry.message);
            }
        }
    }

    Ok(())
}

fn build_lifecycle(store: Arc<EngineStore>) -> JobLifecycleManager {
    let transcription = Arc::new(TranscriptionOrchestrator::new(
        store.clone(),
        Arc::new(NullAudioDriver),
        Arc::new(NullTranscriber),
        None,
    ));
    // Docker may not be reachable in every environment this CLI runs in
    // (e.g. CI); create-container jobs simply fail with "no sandbox
    // registrar configured" when it isn't, rather than the demo refusing
    // to start.
    let sandbox = clearance_engine::sandbox::DockerSandboxRegistrar::connect()
        .map(|r| Arc::new(r) as Arc<dyn clearance_engine::external::SandboxRegistrar>)
        .ok();
    JobLifecycleManager::new(store.clone(), store, transcription, None, sandbox)
}

struct NullAudioDriver;

#[async_trait::async_trait]
impl clearance_engine::external::AudioCaptureDriver for NullAudioDriver {
    async fn list_devices(&self) -> EngineResult<Vec<clearance_engine::external::AudioDeviceInfo>> {
        Ok(Vec::new())
    }

    async fn capture(
        &self,
        _device_id: &str,
        _chunk_duration: std::time::Duration,
        _on_chunk: clearance_engine::external::OnChunk,
        _ct: tokio_util::sync::CancellationToken,
    ) -> EngineResult<()> {
        Err(EngineError::Other("no audio capture driver configured for the CLI demo".to_string()))
    }
}

struct NullTranscriber;

#[async_trait::async_trait]
impl clearance_engine::external::TranscriptionClient for NullTranscriber {
    async fn transcribe(
        &self,
        _model: &str,
        _wav_bytes: &[u8],
        _language: Option<&str>,
    ) -> EngineResult<clearance_engine::external::Transcription> {
        Err(EngineError::Other("no transcription client configured for the CLI demo".to_string()))
    }
}
