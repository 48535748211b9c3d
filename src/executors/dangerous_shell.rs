//! Dangerous-shell executor (spec.md §4.5), grounded on
//! `tools/exec.rs::execute_exec`: spawn a real interpreter process with
//! stdout/stderr captured, `kill_on_drop(true)`, honor cancellation.

use super::ExecutorContext;
use crate::domain::{Job, ShellKind};
use crate::error::{EngineError, EngineResult};
use tokio_util::sync::CancellationToken;

const MAX_OUTPUT: usize = 50_000;

fn truncate(s: String) -> String {
    if s.len() <= MAX_OUTPUT {
        s
    } else {
        let mut cut = MAX_OUTPUT;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}... [truncated]", &s[..cut])
    }
}

fn program_and_args(kind: ShellKind, script: &str) -> (&'static str, Vec<String>) {
    match kind {
        ShellKind::Bash => ("bash", vec!["-c".to_string(), script.to_string()]),
        ShellKind::PowerShellCrossPlatform => ("pwsh", vec!["-Command".to_string(), script.to_string()]),
        ShellKind::CommandPromptWindows => ("cmd", vec!["/C".to_string(), script.to_string()]),
        // `git` subcommands arrive as the remainder of the command line
        // (e.g. "status --short"); run them through a shell so quoting in
        // the script text behaves the way the other shell kinds do.
        ShellKind::GitSubcommand => ("bash", vec!["-c".to_string(), format!("git {script}")]),
    }
}

pub async fn execute(job: &Job, ct: CancellationToken, ctx: &ExecutorContext) -> EngineResult<String> {
    let script = job
        .payload
        .script
        .as_deref()
        .ok_or_else(|| EngineError::Validation("dangerous-shell job missing script payload".to_string()))?;
    let shell_kind = job
        .payload
        .shell_kind
        .ok_or_else(|| EngineError::Validation("dangerous-shell job missing shellKind".to_string()))?;
    let resource_id = job
        .resource_id
        .as_deref()
        .ok_or_else(|| EngineError::Validation("dangerous-shell job missing systemUser resource".to_string()))?;

    let system_user = ctx
        .job_store
        .get_system_user(resource_id)
        .await?
        .ok_or_else(|| EngineError::tool("dangerous_shell", format!("unknown system user {resource_id}")))?;

    let working_directory = job
        .payload
        .working_directory
        .clone()
        .or_else(|| system_user.working_directory.clone())
        .or_else(|| system_user.sandbox_root.clone());

    let (program, args) = program_and_args(shell_kind, script);
    let mut command = tokio::process::Command::new(program);
    command.args(&args);
    if let Some(dir) = &working_directory {
        command.current_dir(dir);
    }
    command.kill_on_drop(true);
    command.stdout(std::process::Stdio::piped());
    command.stderr(std::process::Stdio::piped());

    let mut child = command
        .spawn()
        .map_err(|e| EngineError::Process(format!("failed to spawn {program}: {e}")))?;

    let output = tokio::select! {
        res = child.wait_with_output() => res.map_err(|e| EngineError::Process(e.to_string()))?,
        _ = ct.cancelled() => {
            return Err(EngineError::Cancelled);
        }
    };

    let stdout = truncate(String::from_utf8_lossy(&output.stdout).to_string());
    let stderr = truncate(String::from_utf8_lossy(&output.stderr).to_string());

    if output.status.success() {
        Ok(stdout)
    } else {
        Err(EngineError::tool(
            "dangerous_shell",
            format!("exit {:?}: {stderr}", output.status.code()),
        ))
    }
}
