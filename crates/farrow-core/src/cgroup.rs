//! Cgroup state and per-child cgroup placement
//!
//! The spawner lives inside a systemd scope; at startup it reads its
//! own `/proc/self/cgroup` to learn the scope path and which
//! controller hierarchies share it.  Spawn requests may then name a
//! leaf group under that scope and a list of controller settings; the
//! child creates the leaf on demand and moves itself into it before
//! dropping privileges.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;

use crate::error::SpawnError;
use crate::Result;

const CGROUP_FS: &str = "/sys/fs/cgroup";

/// Where this process sits in the cgroup hierarchies.  Immutable
/// after startup.
#[derive(Debug, Clone, Default)]
pub struct CgroupState {
    /// The systemd scope path, e.g. `/system.slice/spawn.scope`.
    /// Empty when the feature is disabled.
    pub group_path: String,

    /// Hierarchy mount names sharing the scope path (`systemd` first).
    pub mounts: Vec<String>,

    /// Controller name → hierarchy mount name.
    pub controllers: BTreeMap<String, String>,
}

impl CgroupState {
    /// Cgroup placement is available iff the scope path is known.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        !self.group_path.is_empty()
    }

    /// Load the state of this process.
    #[must_use]
    pub fn load_self() -> Self {
        Self::load(None)
    }

    /// Load the state of `pid` (or of this process).  A missing or
    /// unparsable file yields a disabled state, never an error.
    #[must_use]
    pub fn load(pid: Option<libc::pid_t>) -> Self {
        let path = pid.map_or_else(
            || PathBuf::from("/proc/self/cgroup"),
            |pid| PathBuf::from(format!("/proc/{pid}/cgroup")),
        );

        match fs::read_to_string(&path) {
            Ok(content) => Self::parse(&content),
            Err(err) => {
                tracing::debug!(path = %path.display(), %err, "no cgroup state");
                Self::default()
            }
        }
    }

    /// Parse `/proc/<pid>/cgroup` content.  Each line is
    /// `<id>:<controller list>:<path>`; the `name=systemd` line
    /// anchors the scope, and every hierarchy mounted at the same
    /// path contributes its controllers.
    #[must_use]
    pub fn parse(content: &str) -> Self {
        struct Assignment<'a> {
            name: &'a str,
            path: &'a str,
        }

        let mut assignments = Vec::new();
        let mut systemd_path = None;

        for line in content.lines() {
            let mut fields = line.splitn(3, ':');
            let (Some(id), Some(name), Some(path)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };

            if id.parse::<u32>().is_err() || name.is_empty() {
                continue;
            }
            if !path.starts_with('/') || path.starts_with("//") {
                continue;
            }

            if name == "name=systemd" {
                systemd_path = Some(path);
            } else {
                assignments.push(Assignment { name, path });
            }
        }

        // no systemd hierarchy: the feature is disabled
        let Some(group_path) = systemd_path else {
            return Self::default();
        };

        let mut state = Self {
            group_path: group_path.to_string(),
            mounts: vec!["systemd".to_string()],
            controllers: BTreeMap::new(),
        };

        for assignment in assignments {
            if assignment.path != group_path {
                continue;
            }

            for controller in assignment.name.split(',') {
                state
                    .controllers
                    .insert(controller.to_string(), assignment.name.to_string());
            }
            state.mounts.push(assignment.name.to_string());
        }

        state
    }
}

/// Requested cgroup placement for one child.
#[derive(Debug, Clone, Default)]
pub struct CgroupOptions {
    /// Leaf group name under the spawner's scope.
    pub name: Option<String>,

    /// Controller settings, applied in request order: the key names a
    /// controller file (`memory.limit_in_bytes`), the value is
    /// written into it.
    pub set: Vec<(String, String)>,
}

impl CgroupOptions {
    /// Move the calling process into its leaf group and apply the
    /// controller settings.  A no-op without a leaf name or with
    /// cgroups disabled.
    pub fn apply(&self, state: &CgroupState) -> Result<()> {
        let Some(name) = &self.name else {
            return Ok(());
        };
        if !state.is_enabled() {
            return Ok(());
        }

        // SAFETY: trivially safe
        let pid = unsafe { libc::getpid() };
        let mut pid_text = String::new();
        let _ = write!(pid_text, "{pid}");

        for mount in &state.mounts {
            let leaf = format!("{CGROUP_FS}/{mount}{}/{name}", state.group_path);
            fs::create_dir_all(&leaf)
                .map_err(|err| SpawnError::Cgroup(format!("mkdir {leaf}: {err}")))?;
            let procs = format!("{leaf}/cgroup.procs");
            fs::write(&procs, &pid_text)
                .map_err(|err| SpawnError::Cgroup(format!("write {procs}: {err}")))?;
        }

        for (key, value) in &self.set {
            // the controller prefix of the key selects the hierarchy
            let controller = key.split('.').next().unwrap_or_default();
            let mount = state.controllers.get(controller).ok_or_else(|| {
                SpawnError::Cgroup(format!("no hierarchy for controller {controller}"))
            })?;

            let path = format!("{CGROUP_FS}/{mount}{}/{name}/{key}", state.group_path);
            fs::write(&path, value)
                .map_err(|err| SpawnError::Cgroup(format!("write {path}: {err}")))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HYBRID: &str = "\
12:pids:/system.slice/spawn.scope
11:memory:/system.slice/spawn.scope
10:cpu,cpuacct:/system.slice/spawn.scope
9:devices:/other.slice
1:name=systemd:/system.slice/spawn.scope
0::/system.slice/spawn.scope
";

    #[test]
    fn parse_hybrid_hierarchy() {
        let state = CgroupState::parse(HYBRID);
        assert!(state.is_enabled());
        assert_eq!(state.group_path, "/system.slice/spawn.scope");

        // systemd first, then every hierarchy sharing the scope path
        assert_eq!(state.mounts[0], "systemd");
        assert!(state.mounts.contains(&"pids".to_string()));
        assert!(state.mounts.contains(&"memory".to_string()));
        assert!(state.mounts.contains(&"cpu,cpuacct".to_string()));
        // the devices hierarchy is elsewhere and must not appear
        assert!(!state.mounts.iter().any(|m| m == "devices"));

        // comma lists fan out to one controller entry each
        assert_eq!(state.controllers.get("cpu").unwrap(), "cpu,cpuacct");
        assert_eq!(state.controllers.get("cpuacct").unwrap(), "cpu,cpuacct");
        assert_eq!(state.controllers.get("memory").unwrap(), "memory");
        assert!(!state.controllers.contains_key("devices"));
    }

    #[test]
    fn missing_systemd_hierarchy_disables_the_feature() {
        let state = CgroupState::parse("0::/system.slice/spawn.scope\n");
        assert!(!state.is_enabled());
        assert!(state.mounts.is_empty());
    }

    #[test]
    fn garbage_lines_are_skipped() {
        let content = "\
not a cgroup line
x:broken
1:name=systemd:/spawn.scope
";
        let state = CgroupState::parse(content);
        assert!(state.is_enabled());
        assert_eq!(state.group_path, "/spawn.scope");
    }

    #[test]
    fn empty_options_apply_cleanly() {
        let options = CgroupOptions::default();
        options.apply(&CgroupState::default()).unwrap();

        let named = CgroupOptions {
            name: Some("job-1".to_string()),
            set: Vec::new(),
        };
        // disabled state short-circuits before touching the filesystem
        named.apply(&CgroupState::default()).unwrap();
    }
}
