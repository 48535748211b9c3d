//! Permission sets, grants, and the clearance ladder (spec.md §3, §4.1).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Reserved wildcard resource id. Fixed across process restarts — callers
/// compare against this constant, never a freshly generated uuid.
pub const ALL_RESOURCES: &str = "00000000-0000-0000-0000-000000000000";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceCategory {
    DangerousShell,
    SafeShell,
    LocalInfoStore,
    ExternalInfoStore,
    Website,
    SearchEngine,
    Container,
    AudioDevice,
    Agent,
    Task,
    Skill,
}

impl ResourceCategory {
    pub const ALL: [ResourceCategory; 11] = [
        ResourceCategory::DangerousShell,
        ResourceCategory::SafeShell,
        ResourceCategory::LocalInfoStore,
        ResourceCategory::ExternalInfoStore,
        ResourceCategory::Website,
        ResourceCategory::SearchEngine,
        ResourceCategory::Container,
        ResourceCategory::AudioDevice,
        ResourceCategory::Agent,
        ResourceCategory::Task,
        ResourceCategory::Skill,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceCategory::DangerousShell => "dangerous_shell",
            ResourceCategory::SafeShell => "safe_shell",
            ResourceCategory::LocalInfoStore => "local_info_store",
            ResourceCategory::ExternalInfoStore => "external_info_store",
            ResourceCategory::Website => "website",
            ResourceCategory::SearchEngine => "search_engine",
            ResourceCategory::Container => "container",
            ResourceCategory::AudioDevice => "audio_device",
            ResourceCategory::Agent => "agent",
            ResourceCategory::Task => "task",
            ResourceCategory::Skill => "skill",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "dangerous_shell" => ResourceCategory::DangerousShell,
            "safe_shell" => ResourceCategory::SafeShell,
            "local_info_store" => ResourceCategory::LocalInfoStore,
            "external_info_store" => ResourceCategory::ExternalInfoStore,
            "website" => ResourceCategory::Website,
            "search_engine" => ResourceCategory::SearchEngine,
            "container" => ResourceCategory::Container,
            "audio_device" => ResourceCategory::AudioDevice,
            "agent" => ResourceCategory::Agent,
            "task" => ResourceCategory::Task,
            "skill" => ResourceCategory::Skill,
            _ => return None,
        })
    }
}

/// The five clearance levels, plus the `Unset` marker used before the
/// fallback chain (grant → PermissionSet default → hard default Level1)
/// has resolved to a concrete level. Numeric discriminants are load-bearing:
/// they round-trip as integers through the `grants`/`permission_sets` tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(i64)]
pub enum Clearance {
    Unset = 0,
    Level1 = 1,
    Level2 = 2,
    Level3 = 3,
    Level4 = 4,
    Level5 = 5,
}

impl Clearance {
    pub fn name(&self) -> &'static str {
        match self {
            Clearance::Unset => "Unset",
            Clearance::Level1 => "SameLevelUser",
            Clearance::Level2 => "WhitelistedUser",
            Clearance::Level3 => "PermittedAgent",
            Clearance::Level4 => "WhitelistedAgent",
            Clearance::Level5 => "Independent",
        }
    }

    pub fn from_i64(n: i64) -> Self {
        match n {
            1 => Clearance::Level1,
            2 => Clearance::Level2,
            3 => Clearance::Level3,
            4 => Clearance::Level4,
            5 => Clearance::Level5,
            _ => Clearance::Unset,
        }
    }
}

/// A `(resourceId, clearance)` record inside a PermissionSet for one
/// category. A grant whose `resource_id` is [`ALL_RESOURCES`] is immutable
/// once persisted — enforced by the store, not by this type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Grant {
    pub id: String,
    pub category: ResourceCategory,
    pub resource_id: String,
    pub clearance: Clearance,
}

impl Grant {
    pub fn is_wildcard(&self) -> bool {
        self.resource_id == ALL_RESOURCES
    }
}

/// The unit attached to Roles, Channels, and ChannelContexts (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionSet {
    pub id: String,
    pub default_clearance: Clearance,

    pub flag_create_sub_agent: bool,
    pub flag_create_container: bool,
    pub flag_register_info_store: bool,
    pub flag_edit_any_task: bool,
    pub flag_access_localhost_browser: bool,
    pub flag_access_localhost_cli: bool,

    /// Grants, keyed by category. Exact-resource grants are kept ordered
    /// ahead of the wildcard grant within a category's `Vec` so tie-break
    /// lookups (§4.1) can simply take the first match.
    pub grants: HashMap<ResourceCategory, Vec<Grant>>,

    /// The grant id designated as each category's default, for
    /// default-resource resolution (§4.2). Stored by id rather than a
    /// back-pointer into `grants` to avoid the construction-order cycle
    /// Design Note §9 calls out.
    pub default_grant: HashMap<ResourceCategory, String>,

    pub user_whitelist: Vec<String>,
    pub agent_whitelist: Vec<String>,

    pub created_at: String,
    pub updated_at: String,
}

impl PermissionSet {
    pub fn new(id: impl Into<String>, now: impl Into<String>) -> Self {
        let now = now.into();
        Self {
            id: id.into(),
            default_clearance: Clearance::Unset,
            flag_create_sub_agent: false,
            flag_create_container: false,
            flag_register_info_store: false,
            flag_edit_any_task: false,
            flag_access_localhost_browser: false,
            flag_access_localhost_cli: false,
            grants: HashMap::new(),
            default_grant: HashMap::new(),
            user_whitelist: Vec::new(),
            agent_whitelist: Vec::new(),
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// Find a grant in `category` matching `resource_id` exactly, else the
    /// category's wildcard grant. Exact match is checked first, matching
    /// the tie-break rule in spec.md §4.1.
    pub fn find_grant(&self, category: ResourceCategory, resource_id: &str) -> Option<&Grant> {
        let grants = self.grants.get(&category)?;
        grants
            .iter()
            .find(|g| g.resource_id == resource_id)
            .or_else(|| grants.iter().find(|g| g.is_wildcard()))
    }

    /// The default grant for `category`, if one is designated.
    pub fn default_grant_for(&self, category: ResourceCategory) -> Option<&Grant> {
        let grant_id = self.default_grant.get(&category)?;
        self.grants.get(&category)?.iter().find(|g| &g.id == grant_id)
    }

    pub fn has_flag(&self, category: GlobalFlag) -> bool {
        match category {
            GlobalFlag::CreateSubAgent => self.flag_create_sub_agent,
            GlobalFlag::CreateContainer => self.flag_create_container,
            GlobalFlag::RegisterInfoStore => self.flag_register_info_store,
            GlobalFlag::EditAnyTask => self.flag_edit_any_task,
            GlobalFlag::AccessLocalhostBrowser => self.flag_access_localhost_browser,
            GlobalFlag::AccessLocalhostCli => self.flag_access_localhost_cli,
        }
    }
}

/// The six resourceless global boolean flags (spec.md §3). Only the first
/// four currently have a corresponding [`crate::domain::job::ActionKind`] —
/// the latter two are carried on the PermissionSet but unreachable from the
/// exhaustive action-kind tag set in spec.md §6, mirroring the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalFlag {
    CreateSubAgent,
    CreateContainer,
    RegisterInfoStore,
    EditAnyTask,
    AccessLocalhostBrowser,
    AccessLocalhostCli,
}

/// Named; owns exactly one PermissionSet; referenced by zero or more Users/Agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub id: String,
    pub name: String,
    pub permission_set_id: String,
}
