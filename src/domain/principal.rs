//! Users, Agents, and the Caller pair (spec.md §3).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub role_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub role_id: Option<String>,
    /// Opaque per spec.md §3 — this crate never inspects the model id.
    pub model_id: Option<String>,
}

/// The `(userId | agentId)` pair with exactly one field set — used
/// wherever §4.1/§4.3 need to know both which kind of principal is asking
/// and its id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallerRef {
    User(String),
    Agent(String),
    /// No session principal attached to the submission (spec.md §4.1 step 5).
    Anonymous,
}

impl CallerRef {
    pub fn user_id(&self) -> Option<&str> {
        match self {
            CallerRef::User(id) => Some(id),
            _ => None,
        }
    }

    pub fn agent_id(&self) -> Option<&str> {
        match self {
            CallerRef::Agent(id) => Some(id),
            _ => None,
        }
    }
}
