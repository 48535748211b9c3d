//! Default-Resource Resolver (spec.md §4.2).

use crate::domain::ResourceCategory;
use crate::error::EngineResult;
use crate::external::PermissionStore;

/// Walk channel PS → channel's context PS → agent's role PS, using the
/// first one that names a default grant for `category`.
///
/// Per DESIGN.md's recorded Open Question decision, a wildcard
/// ([`crate::domain::ALL_RESOURCES`]) default grant is honored exactly
/// like a named-resource default grant — the teacher's own resolution
/// helpers (`resolve_provider_for_model`) always fall through to an
/// unconditional match as the last resort, so the same reading is applied
/// here.
pub async fn resolve_default_resource(
    store: &dyn PermissionStore,
    channel_id: Option<&str>,
    agent_id: &str,
    category: ResourceCategory,
) -> EngineResult<Option<String>> {
    if let Some(channel_id) = channel_id {
        if let Some(channel) = store.get_channel(channel_id).await? {
            if let Some(ps_id) = &channel.permission_set_id {
                if let Some(ps) = store.get_permission_set(ps_id).await? {
                    if let Some(grant) = ps.default_grant_for(category) {
                        return Ok(Some(grant.resource_id.clone()));
                    }
                }
            }
            if let Some(context_id) = &channel.context_id {
                if let Some(context) = store.get_channel_context(context_id).await? {
                    if let Some(ps_id) = &context.permission_set_id {
                        if let Some(ps) = store.get_permission_set(ps_id).await? {
                            if let Some(grant) = ps.default_grant_for(category) {
                                return Ok(Some(grant.resource_id.clone()));
                            }
                        }
                    }
                }
            }
        }
    }

    if let Some(role_id) = store.get_agent_role_id(agent_id).await? {
        if let Some(role) = store.get_role(&role_id).await? {
            if let Some(ps) = store.get_permission_set(&role.permission_set_id).await? {
                if let Some(grant) = ps.default_grant_for(category) {
                    return Ok(Some(grant.resource_id.clone()));
                }
            }
        }
    }

    Ok(None)
}
