//! Container root construction
//!
//! Runs inside the child's fresh mount namespace.  The sequence is
//! fixed: make the inherited root a slave mount, pivot into the new
//! root if one was requested, then apply the bind-mount chain, home,
//! tmpfs and /proc mounts in that order.

use std::ffi::CStr;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use nix::errno::Errno;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::unistd::{chdir, pivot_root};

use crate::error::SpawnError;
use crate::isolation::namespace::{BindMount, NamespaceOptions};
use crate::Result;

/// Build the mount tree described by `ns`.  A no-op unless a mount
/// namespace was requested.
pub fn setup_mounts(ns: &NamespaceOptions) -> Result<()> {
    if !ns.mount {
        return Ok(());
    }

    // keep our mount events out of the host namespace
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_SLAVE | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|err| SpawnError::Mount(format!("remount / as slave: {err}")))?;

    if let Some(new_root) = &ns.pivot_root {
        enter_pivot_root(new_root)?;
    }

    for bind in &ns.binds {
        apply_bind_mount(bind)?;
    }

    if let Some((source, target)) = &ns.mount_home {
        apply_bind_mount(&BindMount {
            source: source.clone(),
            target: target.clone(),
            writable: true,
            exec: true,
        })?;
    }

    if let Some(target) = &ns.mount_tmpfs {
        mount_tmpfs(target, "mode=700")?;
    }

    if let Some(options) = &ns.mount_tmp_tmpfs {
        // world-writable with the sticky bit, like any /tmp
        let data = if options.is_empty() {
            "mode=1777".to_string()
        } else {
            format!("{options},mode=1777")
        };
        mount_tmpfs(c"/tmp", &data)?;
    }

    if ns.mount_proc {
        mount_proc(ns.writable_proc)?;
    }

    Ok(())
}

/// Swap the root filesystem for `new_root`.
fn enter_pivot_root(new_root: &CStr) -> Result<()> {
    let fail = |what: &str, err: Errno| SpawnError::Mount(format!("{what}: {err}"));

    // pivot_root requires the new root to be a mount point
    mount(
        Some(new_root),
        new_root,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|err| fail("bind new root", err))?;

    chdir(new_root).map_err(|err| fail("chdir new root", err))?;

    // stack the old root on the new one, then drop it
    pivot_root(".", ".").map_err(|err| fail("pivot_root", err))?;
    umount2(".", MntFlags::MNT_DETACH).map_err(|err| fail("detach old root", err))?;
    chdir("/").map_err(|err| fail("chdir /", err))?;

    Ok(())
}

/// The remount flags implementing a bind's `writable`/`exec` bits.
fn remount_flags(writable: bool, exec: bool) -> MsFlags {
    let mut flags = MsFlags::MS_NOSUID | MsFlags::MS_NODEV;
    if !writable {
        flags |= MsFlags::MS_RDONLY;
    }
    if !exec {
        flags |= MsFlags::MS_NOEXEC;
    }
    flags
}

fn apply_bind_mount(bind: &BindMount) -> Result<()> {
    let target_path = Path::new(std::ffi::OsStr::from_bytes(bind.target.to_bytes()));
    // a missing mount point fails the mount itself with a clear error
    let _ = fs::create_dir_all(target_path);

    mount(
        Some(bind.source.as_c_str()),
        bind.target.as_c_str(),
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(|err| {
        SpawnError::Mount(format!(
            "bind {:?} on {:?}: {err}",
            bind.source, bind.target
        ))
    })?;

    // the flags are ignored by the bind itself and need a remount
    let flags = remount_flags(bind.writable, bind.exec);
    let remount = MsFlags::MS_REMOUNT | MsFlags::MS_BIND | flags;

    match mount(
        None::<&str>,
        bind.target.as_c_str(),
        None::<&str>,
        remount,
        None::<&str>,
    ) {
        Ok(()) => Ok(()),
        // some kernels reject the remount unless MS_NOEXEC is set;
        // retry once with it when it was not explicitly requested
        Err(Errno::EPERM) if !flags.contains(MsFlags::MS_NOEXEC) => mount(
            None::<&str>,
            bind.target.as_c_str(),
            None::<&str>,
            remount | MsFlags::MS_NOEXEC,
            None::<&str>,
        )
        .map_err(|err| SpawnError::Mount(format!("remount {:?}: {err}", bind.target))),
        Err(err) => Err(SpawnError::Mount(format!(
            "remount {:?}: {err}",
            bind.target
        ))),
    }
}

fn mount_tmpfs(target: &CStr, data: &str) -> Result<()> {
    let target_path = Path::new(std::ffi::OsStr::from_bytes(target.to_bytes()));
    let _ = fs::create_dir_all(target_path);

    mount(
        Some("tmpfs"),
        target,
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        Some(data),
    )
    .map_err(|err| SpawnError::Mount(format!("tmpfs on {target:?}: {err}")))
}

fn mount_proc(writable: bool) -> Result<()> {
    let _ = fs::create_dir_all("/proc");

    let mut flags = MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV;
    if !writable {
        flags |= MsFlags::MS_RDONLY;
    }

    mount(Some("proc"), "/proc", Some("proc"), flags, None::<&str>)
        .map_err(|err| SpawnError::Mount(format!("mount /proc: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remount_flags_honor_writable_and_exec() {
        let ro_noexec = remount_flags(false, false);
        assert!(ro_noexec.contains(MsFlags::MS_RDONLY));
        assert!(ro_noexec.contains(MsFlags::MS_NOEXEC));
        assert!(ro_noexec.contains(MsFlags::MS_NOSUID));
        assert!(ro_noexec.contains(MsFlags::MS_NODEV));

        let rw_exec = remount_flags(true, true);
        assert!(!rw_exec.contains(MsFlags::MS_RDONLY));
        assert!(!rw_exec.contains(MsFlags::MS_NOEXEC));
        assert!(rw_exec.contains(MsFlags::MS_NOSUID));

        let ro_exec = remount_flags(false, true);
        assert!(ro_exec.contains(MsFlags::MS_RDONLY));
        assert!(!ro_exec.contains(MsFlags::MS_NOEXEC));
    }

    #[test]
    fn mount_setup_without_mount_namespace_is_inert() {
        let ns = NamespaceOptions::default();
        setup_mounts(&ns).unwrap();
    }
}
