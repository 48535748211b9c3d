// Error taxonomy for the clearance engine.
//
// Design rules (carried over from the teacher's `atoms/error.rs`):
//   • Variants are coarse-grained by domain (I/O, DB, provider, tool…).
//   • `#[from]` wires std/external error conversions automatically.
//   • No variant carries secret material (API keys, tokens) in its message.
//
// §7 of the spec distinguishes expected control-flow outcomes (denial,
// validation) from genuine failures (execution, invariant violation).
// `Denied`/`Validation` are returned, never thrown, by the evaluator and
// lifecycle manager; `InvariantViolation` is the one variant the
// persistence layer is expected to panic^Wreturn-as-Err on and the caller
// is expected to propagate rather than convert into a terminal job state.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Filesystem or OS-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// SQLite / rusqlite database failure.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A permission/clearance check resolved to Denied. Expected, recorded
    /// as a terminal job state — never thrown across an await boundary.
    #[error("Denied: {0}")]
    Denied(String),

    /// A submission was missing a required field (e.g. no resourceId and
    /// no default resolvable). Recorded as Denied with this reason.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Tool/executor failure surfaced from a handler.
    #[error("Tool error: {tool}: {message}")]
    Tool { tool: String, message: String },

    /// AI provider HTTP or API-level failure (non-secret detail only).
    #[error("Provider error: {provider}: {message}")]
    Provider { provider: String, message: String },

    /// External process (shell, sandbox, Docker) returned a non-zero exit
    /// or otherwise failed to run.
    #[error("Process error: {0}")]
    Process(String),

    /// Security policy violation that is not a plain clearance denial
    /// (e.g. blocked command pattern).
    #[error("Security error: {0}")]
    Security(String),

    /// A program invariant was violated: a mutation touched an
    /// `AllResources` grant, a terminal job was mutated, or a background
    /// worker was started twice for the same job. These throw — callers
    /// must not convert them into a job status transition.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Cancellation requested via a `CancellationToken`. Propagates
    /// unchanged rather than becoming `Failed`.
    #[error("Operation cancelled")]
    Cancelled,

    /// Catch-all for errors that do not yet have a dedicated variant.
    #[error("{0}")]
    Other(String),
}

impl From<String> for EngineError {
    fn from(s: String) -> Self {
        EngineError::Other(s)
    }
}

impl From<&str> for EngineError {
    fn from(s: &str) -> Self {
        EngineError::Other(s.to_string())
    }
}

impl EngineError {
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Tool { tool: tool.into(), message: message.into() }
    }

    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider { provider: provider.into(), message: message.into() }
    }

    /// True for errors that represent an expected control-flow outcome
    /// (denied/validation) rather than a genuine execution failure.
    pub fn is_expected(&self) -> bool {
        matches!(self, EngineError::Denied(_) | EngineError::Validation(_))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

impl From<EngineError> for String {
    fn from(e: EngineError) -> Self {
        e.to_string()
    }
}
