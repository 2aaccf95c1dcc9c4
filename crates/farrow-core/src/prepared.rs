//! The spawn configuration model
//!
//! A [`PreparedChildProcess`] is built by the request parser (or by an
//! embedding caller), finalized once, and then consumed by the fork
//! engine.  Nothing mutates it after the fork begins.

use std::ffi::{CStr, CString};
use std::os::fd::OwnedFd;

use crate::cgroup::CgroupOptions;
use crate::error::SpawnError;
use crate::isolation::namespace::NamespaceOptions;
use crate::rlimits::ResourceLimits;
use crate::Result;

/// Upper bound on argv and environment entries per request.
pub const MAX_ARGS: usize = 32;

/// Upper bound on supplementary groups per request.
pub const MAX_GROUPS: usize = 32;

const DEFAULT_PATH: &CStr = c"PATH=/usr/bin:/bin";

/// Credentials the child switches to before exec.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UidGid {
    pub uid: libc::uid_t,
    pub gid: libc::gid_t,
    pub groups: Vec<libc::gid_t>,
}

impl UidGid {
    #[must_use]
    pub fn new(uid: libc::uid_t, gid: libc::gid_t) -> Self {
        Self {
            uid,
            gid,
            groups: Vec::new(),
        }
    }

    /// An all-zero pair means "not specified"; the server substitutes
    /// its configured default before spawning.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.uid == 0 && self.gid == 0
    }
}

/// Everything needed to launch one isolated child.
#[derive(Debug, Default)]
pub struct PreparedChildProcess {
    pub args: Vec<CString>,
    pub env: Vec<CString>,

    pub stdin: Option<OwnedFd>,
    pub stdout: Option<OwnedFd>,
    pub stderr: Option<OwnedFd>,
    /// Control channel, wired to descriptor 3 in the child.
    pub control: Option<OwnedFd>,

    pub stderr_path: Option<CString>,
    /// Open `/dev/null` as stderr when nothing else was given.
    pub stderr_null: bool,
    /// Defer opening `stderr_path` until after chroot/pivot_root.
    pub stderr_jailed: bool,

    pub tty: bool,
    pub umask: Option<u16>,
    pub priority: i32,
    pub chroot: Option<CString>,
    pub chdir: Option<CString>,
    pub hook_info: Option<String>,
    pub refence: Option<String>,

    pub ns: NamespaceOptions,
    pub cgroup: CgroupOptions,
    pub rlimits: ResourceLimits,
    pub uid_gid: UidGid,

    pub sched_idle: bool,
    pub ioprio_idle: bool,
    pub forbid_user_ns: bool,
    pub forbid_multicast: bool,
    pub forbid_bind: bool,
    pub no_new_privs: bool,
}

impl PreparedChildProcess {
    /// Append one argv entry; requests beyond [`MAX_ARGS`] are
    /// malformed.
    pub fn append_arg(&mut self, arg: CString) -> Result<()> {
        if self.args.len() >= MAX_ARGS {
            return Err(SpawnError::MalformedPayload);
        }
        self.args.push(arg);
        Ok(())
    }

    /// Append one `NAME=value` environment entry.
    pub fn put_env(&mut self, entry: CString) -> Result<()> {
        if self.env.len() >= MAX_ARGS {
            return Err(SpawnError::MalformedPayload);
        }
        self.env.push(entry);
        Ok(())
    }

    /// Final fixups before the fork: argv must not be empty, and the
    /// child always gets a `PATH`.
    pub fn finish(&mut self) -> Result<()> {
        if self.args.is_empty() {
            return Err(SpawnError::Exec("empty argv".to_string()));
        }

        if !self.env.iter().any(|e| e.as_bytes().starts_with(b"PATH=")) {
            self.env.push(DEFAULT_PATH.to_owned());
        }

        Ok(())
    }

    /// The executable path (argv\[0\]).
    #[must_use]
    pub fn exec_path(&self) -> Option<&CStr> {
        self.args.first().map(CString::as_c_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cstr(s: &str) -> CString {
        CString::new(s).unwrap()
    }

    #[test]
    fn finish_requires_argv() {
        let mut p = PreparedChildProcess::default();
        assert!(p.finish().is_err());

        p.append_arg(cstr("/bin/true")).unwrap();
        assert!(p.finish().is_ok());
    }

    #[test]
    fn finish_supplies_default_path() {
        let mut p = PreparedChildProcess::default();
        p.append_arg(cstr("/bin/true")).unwrap();
        p.put_env(cstr("HOME=/nonexistent")).unwrap();
        p.finish().unwrap();
        assert!(p
            .env
            .iter()
            .any(|e| e.as_bytes().starts_with(b"PATH=")));
    }

    #[test]
    fn finish_keeps_explicit_path() {
        let mut p = PreparedChildProcess::default();
        p.append_arg(cstr("/bin/true")).unwrap();
        p.put_env(cstr("PATH=/opt/bin")).unwrap();
        p.finish().unwrap();
        let paths: Vec<_> = p
            .env
            .iter()
            .filter(|e| e.as_bytes().starts_with(b"PATH="))
            .collect();
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].as_bytes(), b"PATH=/opt/bin");
    }

    #[test]
    fn argv_is_bounded() {
        let mut p = PreparedChildProcess::default();
        for i in 0..MAX_ARGS {
            p.append_arg(cstr(&format!("arg{i}"))).unwrap();
        }
        assert!(matches!(
            p.append_arg(cstr("overflow")),
            Err(SpawnError::MalformedPayload)
        ));
    }

    #[test]
    fn empty_uid_gid_is_unspecified() {
        assert!(UidGid::default().is_empty());
        assert!(!UidGid::new(1000, 1000).is_empty());
    }
}
