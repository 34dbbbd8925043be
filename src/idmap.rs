use anyhow::{Context, Result};
use nix::sched::CloneFlags;
use nix::unistd::{getegid, geteuid};

/// Unshare a fresh user namespace in the *calling* process and map the
/// caller's current euid/egid to uid/gid 0 inside it.
///
/// This runs in the Spawner itself, before the leader is cloned, so that
/// anything the Spawner does afterwards (joining a netns, writing the
/// leader's identity) runs under the new mapping. `/proc/self/*` therefore
/// refers to the Spawner, not the leader.
pub fn unshare_user_ns() -> Result<()> {
    let uid = geteuid();
    let gid = getegid();

    nix::sched::unshare(CloneFlags::CLONE_NEWUSER).context("Failed to unshare user namespace")?;

    write_control("/proc/self/setgroups", "deny")?;
    write_control("/proc/self/uid_map", &format!("0 {} 1", uid))?;
    write_control("/proc/self/gid_map", &format!("0 {} 1", gid))?;

    Ok(())
}

fn write_control(path: &str, data: &str) -> Result<()> {
    std::fs::write(path, data).with_context(|| format!("Failed to write {}", path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_control_reports_missing_path() {
        let err = write_control("/nonexistent/path/for/test", "0 0 1").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/path/for/test"));
    }
}
