//! Linux namespace isolation

use std::ffi::CString;
use std::fs;

use nix::sched::{setns, unshare, CloneFlags};
use nix::unistd::sethostname;

use crate::error::SpawnError;
use crate::prepared::UidGid;
use crate::Result;

/// One entry of the bind-mount chain, applied in request order.
#[derive(Debug, Clone)]
pub struct BindMount {
    pub source: CString,
    pub target: CString,
    pub writable: bool,
    pub exec: bool,
}

/// Namespace and mount-tree options for one child.
#[derive(Debug, Clone, Default)]
pub struct NamespaceOptions {
    pub user: bool,
    pub pid: bool,
    pub network: bool,
    pub ipc: bool,
    pub mount: bool,

    /// Join this named network namespace (under `/run/netns`) instead
    /// of unsharing a fresh one.
    pub network_namespace: Option<String>,

    pub hostname: Option<String>,

    /// Mount `/proc` inside the new mount namespace.
    pub mount_proc: bool,
    /// Leave the `/proc` mount writable (needed e.g. for uid_map
    /// writes by the child itself).
    pub writable_proc: bool,

    pub pivot_root: Option<CString>,
    pub binds: Vec<BindMount>,
    /// Bind the home directory: (host path, container path).
    pub mount_home: Option<(CString, CString)>,
    /// Mount a tmpfs at this container path.
    pub mount_tmpfs: Option<CString>,
    /// Mount a tmpfs on `/tmp`, with these mount options (may be
    /// empty).
    pub mount_tmp_tmpfs: Option<String>,
}

impl NamespaceOptions {
    /// The namespaces to unshare.  A named network namespace is
    /// joined, not unshared.
    #[must_use]
    pub fn clone_flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::empty();

        if self.user {
            flags |= CloneFlags::CLONE_NEWUSER;
        }
        if self.pid {
            flags |= CloneFlags::CLONE_NEWPID;
        }
        if self.network && self.network_namespace.is_none() {
            flags |= CloneFlags::CLONE_NEWNET;
        }
        if self.ipc {
            flags |= CloneFlags::CLONE_NEWIPC;
        }
        if self.mount {
            flags |= CloneFlags::CLONE_NEWNS;
        }
        if self.hostname.is_some() {
            flags |= CloneFlags::CLONE_NEWUTS;
        }

        flags
    }

    /// Enter the requested namespaces.  The user namespace is
    /// established first so the remaining privileged calls run with
    /// full capabilities inside it; the 1:1 uid/gid maps for the
    /// child's target credentials are written right away.
    pub fn apply(&self, uid_gid: &UidGid) -> Result<()> {
        let mut flags = self.clone_flags();

        if flags.contains(CloneFlags::CLONE_NEWUSER) {
            unshare(CloneFlags::CLONE_NEWUSER).map_err(|err| {
                SpawnError::Namespace(format!("unshare(CLONE_NEWUSER): {err}"))
            })?;
            flags.remove(CloneFlags::CLONE_NEWUSER);

            if !uid_gid.is_empty() {
                write_id_maps(uid_gid)?;
            }
        }

        if !flags.is_empty() {
            unshare(flags)
                .map_err(|err| SpawnError::Namespace(format!("unshare({flags:?}): {err}")))?;
        }

        if let Some(name) = &self.network_namespace {
            join_network_namespace(name)?;
        }

        Ok(())
    }

    /// Set the hostname inside the new UTS namespace.
    pub fn apply_hostname(&self) -> Result<()> {
        if let Some(hostname) = &self.hostname {
            sethostname(hostname)
                .map_err(|err| SpawnError::Namespace(format!("sethostname: {err}")))?;
        }
        Ok(())
    }
}

/// Join a named network namespace created by `ip netns add`.
fn join_network_namespace(name: &str) -> Result<()> {
    let path = format!("/run/netns/{name}");
    let handle = fs::File::open(&path)
        .map_err(|err| SpawnError::Namespace(format!("open {path}: {err}")))?;

    setns(handle, CloneFlags::CLONE_NEWNET)
        .map_err(|err| SpawnError::Namespace(format!("setns {path}: {err}")))
}

/// Map the child's target uid/gid 1:1 into a fresh user namespace and
/// deny `setgroups(2)`, so the later credential switch succeeds with
/// no privileged parent helping out.
fn write_id_maps(uid_gid: &UidGid) -> Result<()> {
    let map_err =
        |what: &str, err: std::io::Error| SpawnError::Namespace(format!("write {what}: {err}"));

    fs::write("/proc/self/setgroups", "deny")
        .map_err(|err| map_err("/proc/self/setgroups", err))?;
    fs::write(
        "/proc/self/uid_map",
        format!("{0} {0} 1", uid_gid.uid),
    )
    .map_err(|err| map_err("/proc/self/uid_map", err))?;
    fs::write(
        "/proc/self/gid_map",
        format!("{0} {0} 1", uid_gid.gid),
    )
    .map_err(|err| map_err("/proc/self/gid_map", err))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_flags_mirror_the_options() {
        let mut ns = NamespaceOptions {
            user: true,
            pid: true,
            network: true,
            ipc: true,
            mount: true,
            ..Default::default()
        };
        let flags = ns.clone_flags();
        assert!(flags.contains(CloneFlags::CLONE_NEWUSER));
        assert!(flags.contains(CloneFlags::CLONE_NEWPID));
        assert!(flags.contains(CloneFlags::CLONE_NEWNET));
        assert!(flags.contains(CloneFlags::CLONE_NEWIPC));
        assert!(flags.contains(CloneFlags::CLONE_NEWNS));
        assert!(!flags.contains(CloneFlags::CLONE_NEWUTS));

        ns.hostname = Some("sandbox".to_string());
        assert!(ns.clone_flags().contains(CloneFlags::CLONE_NEWUTS));
    }

    #[test]
    fn named_network_namespace_suppresses_unshare() {
        let ns = NamespaceOptions {
            network: true,
            network_namespace: Some("uplink".to_string()),
            ..Default::default()
        };
        assert!(!ns.clone_flags().contains(CloneFlags::CLONE_NEWNET));
    }

    #[test]
    fn default_options_are_inert() {
        let ns = NamespaceOptions::default();
        assert!(ns.clone_flags().is_empty());
        // nothing to unshare, nothing to join
        ns.apply(&UidGid::default()).unwrap();
        ns.apply_hostname().unwrap();
    }
}
