//! Pre-authorization (spec.md §4.3). Applied only when §4.1 (the
//! [`super::evaluate`] call) has already returned `Pending`.

use crate::domain::{ActionKind, CallerRef, Clearance, PermissionSet, ALL_RESOURCES};
use crate::error::EngineResult;
use crate::external::PermissionStore;

fn matches_grant_or_flag(ps: &PermissionSet, action: ActionKind, resource_id: Option<&str>) -> bool {
    if let Some(flag) = action.global_flag() {
        return ps.has_flag(flag);
    }
    let Some(category) = action.category() else { return false };
    let grants = match ps.grants.get(&category) {
        Some(g) => g,
        None => return false,
    };
    grants
        .iter()
        .any(|g| Some(g.resource_id.as_str()) == resource_id || g.resource_id == ALL_RESOURCES)
}

/// Channel PS first, then context PS, for a matching grant/flag in the
/// right category — clearance value on the grant is not inspected, only
/// its presence.
async fn channel_or_context_preauthorized(
    store: &dyn PermissionStore,
    channel_id: Option<&str>,
    action: ActionKind,
    resource_id: Option<&str>,
) -> EngineResult<bool> {
    let Some(channel_id) = channel_id else { return Ok(false) };
    let Some(channel) = store.get_channel(channel_id).await? else { return Ok(false) };

    if let Some(ps_id) = &channel.permission_set_id {
        if let Some(ps) = store.get_permission_set(ps_id).await? {
            if matches_grant_or_flag(&ps, action, resource_id) {
                return Ok(true);
            }
        }
    }

    if let Some(context_id) = &channel.context_id {
        if let Some(context) = store.get_channel_context(context_id).await? {
            if let Some(ps_id) = &context.permission_set_id {
                if let Some(ps) = store.get_permission_set(ps_id).await? {
                    if matches_grant_or_flag(&ps, action, resource_id) {
                        return Ok(true);
                    }
                }
            }
        }
    }

    Ok(false)
}

/// Decide whether a `Pending` verdict at `effective_clearance` can be
/// auto-approved via channel/context pre-authorization. Level 3 is never
/// pre-authorized; Level 1 still requires the caller to personally hold
/// the permission (pre-auth alone never satisfies it — see DESIGN.md's
/// recorded reading of this Open Question).
pub async fn check_preauthorized(
    store: &dyn PermissionStore,
    channel_id: Option<&str>,
    action: ActionKind,
    resource_id: Option<&str>,
    effective_clearance: Clearance,
    caller: &CallerRef,
) -> EngineResult<bool> {
    match effective_clearance {
        Clearance::Level3 => Ok(false),
        Clearance::Level1 => {
            super::satisfies_level1_public(store, caller, action, resource_id).await
        }
        Clearance::Level2 | Clearance::Level4 => {
            channel_or_context_preauthorized(store, channel_id, action, resource_id).await
        }
        Clearance::Level5 | Clearance::Unset => Ok(false),
    }
}
