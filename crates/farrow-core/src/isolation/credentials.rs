//! Credential switching
//!
//! Runs in the child after cgroup placement and resource limits.
//! The order is load-bearing: supplementary groups, then the gid,
//! then the uid — once the uid is gone, nothing else is allowed.

use nix::unistd::{setgid, setgroups, setuid, Gid, Uid};

use crate::error::SpawnError;
use crate::prepared::UidGid;
use crate::Result;

/// Switch to the target credentials.  A no-op for the empty pair.
///
/// `in_user_namespace` suppresses `setgroups(2)`: after the child
/// wrote `deny` into `/proc/self/setgroups`, the call can only fail.
pub fn apply(uid_gid: &UidGid, in_user_namespace: bool) -> Result<()> {
    if uid_gid.is_empty() {
        return Ok(());
    }

    let fail = |what: &str, err: nix::errno::Errno| {
        SpawnError::Credentials(format!("{what}: {err}"))
    };

    if !in_user_namespace {
        if !uid_gid.groups.is_empty() {
            let groups: Vec<Gid> = uid_gid
                .groups
                .iter()
                .map(|&gid| Gid::from_raw(gid))
                .collect();
            setgroups(&groups).map_err(|err| fail("setgroups", err))?;
        } else if Uid::effective().is_root() {
            // drop the spawner's own supplementary groups
            setgroups(&[Gid::from_raw(uid_gid.gid)]).map_err(|err| fail("setgroups", err))?;
        }
    }

    setgid(Gid::from_raw(uid_gid.gid)).map_err(|err| fail("setgid", err))?;
    setuid(Uid::from_raw(uid_gid.uid)).map_err(|err| fail("setuid", err))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_pair_is_a_no_op() {
        apply(&UidGid::default(), false).unwrap();
    }
}
