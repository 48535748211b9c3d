//! Clearance Evaluator (spec.md §4.1) and its two helpers,
//! Default-Resource Resolver (§4.2) and Pre-authorization (§4.3).

pub mod default_resource;
pub mod preauth;

pub use default_resource::resolve_default_resource;
pub use preauth::check_preauthorized;

use crate::domain::{ActionKind, CallerRef, Clearance, PermissionSet, ResourceCategory};
use crate::error::{EngineError, EngineResult};
use crate::external::PermissionStore;

#[derive(Debug, Clone)]
pub enum Verdict {
    Approved { rule: &'static str, effective_clearance: Clearance },
    Pending { effective_clearance: Clearance },
    Denied { reason: String },
}

/// Load the permission set that owns an agent's grants, via its role.
async fn load_agent_permission_set(
    store: &dyn PermissionStore,
    agent_id: &str,
) -> EngineResult<Option<PermissionSet>> {
    let Some(role_id) = store.get_agent_role_id(agent_id).await? else {
        return Ok(None);
    };
    let Some(role) = store.get_role(&role_id).await? else {
        return Ok(None);
    };
    store.get_permission_set(&role.permission_set_id).await
}

async fn load_user_permission_set(
    store: &dyn PermissionStore,
    user_id: &str,
) -> EngineResult<Option<PermissionSet>> {
    let Some(role_id) = store.get_user_role_id(user_id).await? else {
        return Ok(None);
    };
    let Some(role) = store.get_role(&role_id).await? else {
        return Ok(None);
    };
    store.get_permission_set(&role.permission_set_id).await
}

/// Whether a PermissionSet "holds the same permission" for the job being
/// evaluated — the grant/flag-presence check shared by Levels 1 and 3.
fn holds_permission(ps: &PermissionSet, action: ActionKind, resource_id: Option<&str>) -> bool {
    if let Some(flag) = action.global_flag() {
        return ps.has_flag(flag);
    }
    let Some(category) = action.category() else { return false };
    let Some(resource_id) = resource_id else { return false };
    ps.find_grant(category, resource_id).is_some()
}

/// Level 1 — SameLevelUser: caller is a User who personally holds the
/// permission via their own role.
async fn satisfies_level1(
    store: &dyn PermissionStore,
    caller: &CallerRef,
    action: ActionKind,
    resource_id: Option<&str>,
) -> EngineResult<bool> {
    let CallerRef::User(user_id) = caller else { return Ok(false) };
    let Some(ps) = load_user_permission_set(store, user_id).await? else { return Ok(false) };
    Ok(holds_permission(&ps, action, resource_id))
}

/// Level 3 — PermittedAgent: caller is an Agent whose own PS holds the
/// permission. No User may ever satisfy this level.
async fn satisfies_level3(
    store: &dyn PermissionStore,
    caller: &CallerRef,
    action: ActionKind,
    resource_id: Option<&str>,
) -> EngineResult<bool> {
    let CallerRef::Agent(agent_id) = caller else { return Ok(false) };
    let Some(ps) = load_agent_permission_set(store, agent_id).await? else { return Ok(false) };
    Ok(holds_permission(&ps, action, resource_id))
}

/// Level 2 — WhitelistedUser: caller is a User in the owning PS's
/// user-whitelist, or satisfies Level 1.
async fn satisfies_level2(
    store: &dyn PermissionStore,
    owning_ps: &PermissionSet,
    caller: &CallerRef,
    action: ActionKind,
    resource_id: Option<&str>,
) -> EngineResult<bool> {
    if let CallerRef::User(user_id) = caller {
        if owning_ps.user_whitelist.iter().any(|u| u == user_id) {
            return Ok(true);
        }
    }
    satisfies_level1(store, caller, action, resource_id).await
}

/// Level 4 — WhitelistedAgent: caller is an Agent in the owning PS's
/// agent-whitelist, or satisfies Levels 3, 2, or 1.
async fn satisfies_level4(
    store: &dyn PermissionStore,
    owning_ps: &PermissionSet,
    caller: &CallerRef,
    action: ActionKind,
    resource_id: Option<&str>,
) -> EngineResult<bool> {
    if let CallerRef::Agent(agent_id) = caller {
        if owning_ps.agent_whitelist.iter().any(|a| a == agent_id) {
            return Ok(true);
        }
    }
    if satisfies_level3(store, caller, action, resource_id).await? {
        return Ok(true);
    }
    satisfies_level2(store, owning_ps, caller, action, resource_id).await
}

/// The evaluation contract of spec.md §4.1.
pub async fn evaluate(
    store: &dyn PermissionStore,
    agent_id: &str,
    action: ActionKind,
    resource_id: Option<&str>,
    caller: &CallerRef,
) -> EngineResult<Verdict> {
    // Step 1: load the agent's PermissionSet.
    let Some(owning_ps) = load_agent_permission_set(store, agent_id).await? else {
        return Ok(Verdict::Denied { reason: "no role".to_string() });
    };

    // Step 2: flag presence / grant lookup.
    let grant_clearance = if let Some(category) = action.category() {
        let Some(resource_id) = resource_id else {
            return Ok(Verdict::Denied { reason: "ResourceId required".to_string() });
        };
        match owning_ps.find_grant(category, resource_id) {
            Some(grant) => Some(grant.clearance),
            None => {
                return Ok(Verdict::Denied {
                    reason: format!("agent does not have {} access", category.as_str()),
                });
            }
        }
    } else {
        let flag = action
            .global_flag()
            .ok_or_else(|| EngineError::Other("global-flag action missing flag mapping".to_string()))?;
        if !owning_ps.has_flag(flag) {
            return Ok(Verdict::Denied {
                reason: format!("agent does not have {:?} access", flag),
            });
        }
        None
    };

    // Step 3: effective clearance fallback chain.
    let effective_clearance = match grant_clearance {
        Some(Clearance::Unset) | None => match owning_ps.default_clearance {
            Clearance::Unset => Clearance::Level1,
            other => other,
        },
        Some(other) => other,
    };

    // Step 4.
    if effective_clearance == Clearance::Level5 {
        return Ok(Verdict::Approved { rule: "independent", effective_clearance });
    }

    // Step 5: anonymous caller.
    if matches!(caller, CallerRef::Anonymous) {
        return Ok(Verdict::Pending { effective_clearance });
    }

    // Step 6: level-specific rule.
    let (approved, rule) = match effective_clearance {
        Clearance::Level1 => (satisfies_level1(store, caller, action, resource_id).await?, "SameLevelUser"),
        Clearance::Level2 => (
            satisfies_level2(store, &owning_ps, caller, action, resource_id).await?,
            "WhitelistedUser",
        ),
        Clearance::Level3 => (satisfies_level3(store, caller, action, resource_id).await?, "PermittedAgent"),
        Clearance::Level4 => (
            satisfies_level4(store, &owning_ps, caller, action, resource_id).await?,
            "WhitelistedAgent",
        ),
        Clearance::Level5 | Clearance::Unset => unreachable!("handled above"),
    };

    if approved {
        Ok(Verdict::Approved { rule, effective_clearance })
    } else {
        Ok(Verdict::Pending { effective_clearance })
    }
}

/// Re-exported for callers that need the category of a resourceless action
/// rejected at submit time (§4.4 step 1's resource resolution).
pub fn category_of(action: ActionKind) -> Option<ResourceCategory> {
    action.category()
}

/// Exposed for [`preauth::check_preauthorized`]'s Level-1 case: pre-auth
/// never grants Level 1 on its own, it only matters whether the caller
/// independently holds the permission via their own role.
pub(crate) async fn satisfies_level1_public(
    store: &dyn PermissionStore,
    caller: &CallerRef,
    action: ActionKind,
    resource_id: Option<&str>,
) -> EngineResult<bool> {
    satisfies_level1(store, caller, action, resource_id).await
}
