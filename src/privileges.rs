use anyhow::{anyhow, Context, Result};
use users::switch::{set_current_gid, set_current_uid};

/// Drops process privileges to the configured user/group.
///
/// Must be called after all privileged port binds and before the first
/// connection is accepted. The group is changed first; changing it after
/// setuid would no longer be permitted. Uses setgid/setuid, so the drop
/// also covers the real and saved ids and cannot be reverted.
///
/// Any failure here is fatal to the process: a daemon that bound port 25
/// as root must not keep serving as root.
pub fn drop_privileges(user: Option<&str>, group: Option<&str>) -> Result<()> {
    if let Some(name) = group {
        let group = users::get_group_by_name(name)
            .ok_or_else(|| anyhow!("unknown group '{}'", name))?;
        set_current_gid(group.gid())
            .with_context(|| format!("could not change group id to {}", group.gid()))?;
        tracing::info!(group = name, gid = group.gid(), "changed group id");
    }
    if let Some(name) = user {
        let user =
            users::get_user_by_name(name).ok_or_else(|| anyhow!("unknown user '{}'", name))?;
        set_current_uid(user.uid())
            .with_context(|| format!("could not change user id to {}", user.uid()))?;
        tracing::info!(user = name, uid = user.uid(), "changed user id");
    }
    if user.is_some() || group.is_some() {
        tracing::info!("dropped privileges");
    }
    Ok(())
}
