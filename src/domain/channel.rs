//! Channels and ChannelContexts (spec.md §3).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    pub default_agent_id: Option<String>,
    pub context_id: Option<String>,
    pub permission_set_id: Option<String>,
    /// Permitted substitutes for the default agent on this channel.
    pub allowed_agents: Vec<String>,
    pub disable_chat_header: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelContext {
    pub id: String,
    pub default_agent_id: Option<String>,
    pub permission_set_id: Option<String>,
    pub allowed_agents: Vec<String>,
    pub disable_chat_header: bool,
}
