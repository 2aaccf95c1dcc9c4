//! Wire protocol for the spawn socket
//!
//! Every frame is a single datagram: a one-byte opcode followed by an
//! opcode-specific body, with file descriptors carried in one
//! `SCM_RIGHTS` ancillary block.  All integers are native-endian
//! fixed-width values; both peers run on the same host, so no byte
//! swapping is ever involved.

use crate::error::SpawnError;

/// Maximum payload an encoder may produce.
pub const MAX_PAYLOAD: usize = 65536;

/// Receive buffer for one incoming datagram.
pub const RECV_BUFFER: usize = 8192;

/// Maximum number of file descriptors accepted per received datagram.
pub const MAX_RECV_FDS: usize = 32;

/// Maximum number of file descriptors attached to a sent datagram.
pub const MAX_SEND_FDS: usize = 8;

/// Request opcodes (worker → spawner).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestCommand {
    /// Install a passed file descriptor as a new connection.
    /// Empty body, exactly one fd.
    Connect = 0,

    /// Spawn a child process: `id: i32`, `name: cstr`, then a
    /// sub-command stream ([`ExecCommand`]).
    Execute = 1,

    /// Signal a child: `id: i32`, `signo: i32`, no fds.
    Kill = 2,
}

impl TryFrom<u8> for RequestCommand {
    type Error = SpawnError;

    fn try_from(value: u8) -> Result<Self, SpawnError> {
        match value {
            0 => Ok(Self::Connect),
            1 => Ok(Self::Execute),
            2 => Ok(Self::Kill),
            _ => Err(SpawnError::MalformedPayload),
        }
    }
}

/// Response opcodes (spawner → worker).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseCommand {
    /// Sent once at startup when the spawner can do cgroup placement.
    CgroupsAvailable = 0,

    /// A child exited: `id: i32`, `status: i32` (raw wait status).
    Exit = 1,
}

impl TryFrom<u8> for ResponseCommand {
    type Error = SpawnError;

    fn try_from(value: u8) -> Result<Self, SpawnError> {
        match value {
            0 => Ok(Self::CgroupsAvailable),
            1 => Ok(Self::Exit),
            _ => Err(SpawnError::MalformedPayload),
        }
    }
}

/// Sub-commands of the EXEC body: a one-byte tag followed by
/// tag-specific operands.  List-valued commands (`Arg`, `SetEnv`,
/// `BindMount`, `CgroupSet`) are order-preserving; everything else is
/// last-writer-wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExecCommand {
    /// Append one argv entry (cstr).
    Arg = 0,
    /// Append one `NAME=value` environment entry (cstr).
    SetEnv = 1,
    /// File creation mask (u16).
    Umask = 2,
    /// Consume one passed fd as stdin.
    Stdin = 3,
    /// Consume one passed fd as stdout.
    Stdout = 4,
    /// Consume one passed fd as stderr.
    Stderr = 5,
    /// Path to open (append mode) as stderr (cstr).
    StderrPath = 6,
    /// Consume one passed fd as the control channel (slot 3).
    Control = 7,
    /// Stdin is the controlling tty.
    Tty = 8,
    /// Opaque refence blob (cstr).
    Refence = 9,
    /// Unshare the user namespace.
    UserNs = 10,
    /// Unshare the pid namespace.
    PidNs = 11,
    /// Unshare the network namespace.
    NetworkNs = 12,
    /// Join the named network namespace instead (cstr).
    NetworkNsName = 13,
    /// Unshare the IPC namespace.
    IpcNs = 14,
    /// Unshare the mount namespace.
    MountNs = 15,
    /// Mount /proc read-only.
    MountProc = 16,
    /// Make the /proc mount writable.
    WritableProc = 17,
    /// pivot_root() to this directory (cstr).
    PivotRoot = 18,
    /// Bind the home directory: host path, container path (2 × cstr).
    MountHome = 19,
    /// Mount a tmpfs on /tmp with these options (cstr, may be empty).
    MountTmpTmpfs = 20,
    /// Mount a tmpfs on this container path (cstr).
    MountTmpfs = 21,
    /// Bind mount: source, target (2 × cstr), writable, exec (2 × u8).
    BindMount = 22,
    /// Set the hostname inside the UTS namespace (cstr).
    Hostname = 23,
    /// Resource limit: resource index (u8), soft and hard (2 × u64).
    Rlimit = 24,
    /// Credentials: uid (u32), gid (u32), group count (u8), groups.
    UidGid = 25,
    /// SCHED_IDLE scheduling policy.
    SchedIdle = 26,
    /// Idle I/O priority class.
    IoprioIdle = 27,
    /// Seccomp: deny user namespace creation.
    ForbidUserNs = 28,
    /// Seccomp: deny multicast socket options.
    ForbidMulticast = 29,
    /// Seccomp: deny bind()/listen().
    ForbidBind = 30,
    /// Set the no-new-privileges bit.
    NoNewPrivs = 31,
    /// Cgroup leaf name under the spawner's scope (cstr).
    Cgroup = 32,
    /// Cgroup controller setting: key, value (2 × cstr).
    CgroupSet = 33,
    /// Nice value (i32).
    Priority = 34,
    /// chroot() to this directory (cstr).
    Chroot = 35,
    /// Working directory (cstr).
    Chdir = 36,
    /// Opaque payload for the verification hook (cstr).
    HookInfo = 37,
}

impl TryFrom<u8> for ExecCommand {
    type Error = SpawnError;

    fn try_from(value: u8) -> Result<Self, SpawnError> {
        use ExecCommand::{
            Arg, BindMount, Cgroup, CgroupSet, Chdir, Chroot, Control, ForbidBind,
            ForbidMulticast, ForbidUserNs, HookInfo, Hostname, IoprioIdle, IpcNs, MountHome,
            MountNs, MountProc, MountTmpTmpfs, MountTmpfs, NetworkNs, NetworkNsName, NoNewPrivs,
            PidNs, PivotRoot, Priority, Refence, Rlimit, SchedIdle, SetEnv, Stderr, StderrPath,
            Stdin, Stdout, Tty, Umask, UidGid, UserNs, WritableProc,
        };

        const TABLE: [ExecCommand; 38] = [
            Arg,
            SetEnv,
            Umask,
            Stdin,
            Stdout,
            Stderr,
            StderrPath,
            Control,
            Tty,
            Refence,
            UserNs,
            PidNs,
            NetworkNs,
            NetworkNsName,
            IpcNs,
            MountNs,
            MountProc,
            WritableProc,
            PivotRoot,
            MountHome,
            MountTmpTmpfs,
            MountTmpfs,
            BindMount,
            Hostname,
            Rlimit,
            UidGid,
            SchedIdle,
            IoprioIdle,
            ForbidUserNs,
            ForbidMulticast,
            ForbidBind,
            NoNewPrivs,
            Cgroup,
            CgroupSet,
            Priority,
            Chroot,
            Chdir,
            HookInfo,
        ];

        TABLE
            .get(usize::from(value))
            .copied()
            .ok_or(SpawnError::MalformedPayload)
    }
}

/// Synthesized wait status reported when the spawn itself failed
/// (fork, a builder step, verification, or exec): `W_EXITCODE(0xff, 0)`.
pub const SPAWN_FAILURE_STATUS: i32 = 0xff << 8;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_opcodes_round_trip() {
        for cmd in [
            RequestCommand::Connect,
            RequestCommand::Execute,
            RequestCommand::Kill,
        ] {
            assert_eq!(RequestCommand::try_from(cmd as u8).unwrap(), cmd);
        }
        assert!(RequestCommand::try_from(3).is_err());
    }

    #[test]
    fn response_opcodes_round_trip() {
        assert_eq!(
            ResponseCommand::try_from(0).unwrap(),
            ResponseCommand::CgroupsAvailable
        );
        assert_eq!(ResponseCommand::try_from(1).unwrap(), ResponseCommand::Exit);
        assert!(ResponseCommand::try_from(2).is_err());
    }

    #[test]
    fn exec_commands_round_trip() {
        for raw in 0..=37u8 {
            let cmd = ExecCommand::try_from(raw).unwrap();
            assert_eq!(cmd as u8, raw);
        }
        assert!(ExecCommand::try_from(38).is_err());
        assert!(ExecCommand::try_from(255).is_err());
    }

    #[test]
    fn spawn_failure_status_is_exit_code_ff() {
        assert_eq!(SPAWN_FAILURE_STATUS, 0xff00);
        assert!(libc::WIFEXITED(SPAWN_FAILURE_STATUS));
        assert_eq!(libc::WEXITSTATUS(SPAWN_FAILURE_STATUS), 0xff);
    }
}
