//! Decoding EXEC requests into a [`PreparedChildProcess`]
//!
//! The EXEC body is a header (`id`, `name`) followed by a stream of
//! tagged sub-commands.  Scalar commands are last-writer-wins;
//! list-valued commands (`ARG`, `SETENV`, `BIND_MOUNT`, `CGROUP_SET`)
//! preserve request order.  A frame must consume exactly the
//! descriptors it carried — surplus or deficit is malformed.

use crate::error::SpawnError;
use crate::isolation::namespace::BindMount;
use crate::payload::{FdQueue, Payload};
use crate::prepared::{PreparedChildProcess, UidGid, MAX_GROUPS};
use crate::protocol::ExecCommand;
use crate::rlimits::RlimitValue;
use crate::Result;

/// One decoded EXEC request.
pub struct ExecRequest {
    /// Client-scoped child id, echoed in the EXIT response.
    pub id: i32,
    /// Symbolic name for log messages.
    pub name: String,
    pub process: PreparedChildProcess,
}

/// Parse the body of an EXEC frame.  `payload` starts after the
/// opcode byte.
pub fn parse_exec(payload: &mut Payload<'_>, fds: &mut FdQueue) -> Result<ExecRequest> {
    let id = payload.read_i32()?;
    let name = payload.read_str()?.to_string();

    let mut p = PreparedChildProcess::default();

    while !payload.is_empty() {
        let cmd = ExecCommand::try_from(payload.read_byte()?)?;
        match cmd {
            ExecCommand::Arg => p.append_arg(payload.read_cstring()?)?,
            ExecCommand::SetEnv => p.put_env(payload.read_cstring()?)?,
            ExecCommand::Umask => p.umask = Some(payload.read_u16()?),
            ExecCommand::Stdin => p.stdin = Some(fds.take()?),
            ExecCommand::Stdout => p.stdout = Some(fds.take()?),
            ExecCommand::Stderr => p.stderr = Some(fds.take()?),
            ExecCommand::StderrPath => p.stderr_path = Some(payload.read_cstring()?),
            ExecCommand::Control => p.control = Some(fds.take()?),
            ExecCommand::Tty => p.tty = true,
            ExecCommand::Refence => p.refence = Some(payload.read_str()?.to_string()),
            ExecCommand::UserNs => p.ns.user = true,
            ExecCommand::PidNs => p.ns.pid = true,
            ExecCommand::NetworkNs => p.ns.network = true,
            ExecCommand::NetworkNsName => {
                p.ns.network_namespace = Some(payload.read_str()?.to_string());
            }
            ExecCommand::IpcNs => p.ns.ipc = true,
            ExecCommand::MountNs => p.ns.mount = true,
            ExecCommand::MountProc => p.ns.mount_proc = true,
            ExecCommand::WritableProc => p.ns.writable_proc = true,
            ExecCommand::PivotRoot => p.ns.pivot_root = Some(payload.read_cstring()?),
            ExecCommand::MountHome => {
                let source = payload.read_cstring()?;
                let target = payload.read_cstring()?;
                p.ns.mount_home = Some((source, target));
            }
            ExecCommand::MountTmpTmpfs => {
                p.ns.mount_tmp_tmpfs = Some(payload.read_str()?.to_string());
            }
            ExecCommand::MountTmpfs => p.ns.mount_tmpfs = Some(payload.read_cstring()?),
            ExecCommand::BindMount => {
                let source = payload.read_cstring()?;
                let target = payload.read_cstring()?;
                let writable = payload.read_byte()? != 0;
                let exec = payload.read_byte()? != 0;
                p.ns.binds.push(BindMount {
                    source,
                    target,
                    writable,
                    exec,
                });
            }
            ExecCommand::Hostname => p.ns.hostname = Some(payload.read_str()?.to_string()),
            ExecCommand::Rlimit => {
                let index = payload.read_byte()?;
                let soft = payload.read_u64()?;
                let hard = payload.read_u64()?;
                p.rlimits.set(index, RlimitValue { soft, hard })?;
            }
            ExecCommand::UidGid => read_uid_gid(payload, &mut p.uid_gid)?,
            ExecCommand::SchedIdle => p.sched_idle = true,
            ExecCommand::IoprioIdle => p.ioprio_idle = true,
            ExecCommand::ForbidUserNs => p.forbid_user_ns = true,
            ExecCommand::ForbidMulticast => p.forbid_multicast = true,
            ExecCommand::ForbidBind => p.forbid_bind = true,
            ExecCommand::NoNewPrivs => p.no_new_privs = true,
            ExecCommand::Cgroup => p.cgroup.name = Some(payload.read_str()?.to_string()),
            ExecCommand::CgroupSet => {
                let key = payload.read_str()?.to_string();
                let value = payload.read_str()?.to_string();
                p.cgroup.set.push((key, value));
            }
            ExecCommand::Priority => p.priority = payload.read_i32()?,
            ExecCommand::Chroot => p.chroot = Some(payload.read_cstring()?),
            ExecCommand::Chdir => p.chdir = Some(payload.read_cstring()?),
            ExecCommand::HookInfo => p.hook_info = Some(payload.read_str()?.to_string()),
        }
    }

    // every carried descriptor must have been consumed
    if !fds.is_empty() {
        return Err(SpawnError::MalformedPayload);
    }

    Ok(ExecRequest {
        id,
        name,
        process: p,
    })
}

fn read_uid_gid(payload: &mut Payload<'_>, uid_gid: &mut UidGid) -> Result<()> {
    uid_gid.uid = payload.read_u32()?;
    uid_gid.gid = payload.read_u32()?;

    let n_groups = usize::from(payload.read_byte()?);
    if n_groups > MAX_GROUPS {
        return Err(SpawnError::MalformedPayload);
    }

    uid_gid.groups.clear();
    for _ in 0..n_groups {
        uid_gid.groups.push(payload.read_u32()?);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RequestCommand;
    use crate::serializer::Serializer;

    /// Decode a serialized EXEC frame the way the connection does:
    /// skip the opcode, then parse.
    fn parse(s: &Serializer) -> Result<ExecRequest> {
        parse_with_fds(s, FdQueue::default())
    }

    fn parse_with_fds(s: &Serializer, mut fds: FdQueue) -> Result<ExecRequest> {
        let mut payload = Payload::new(&s.payload()[1..]);
        parse_exec(&mut payload, &mut fds)
    }

    fn exec_header(id: i32, name: &str) -> Serializer {
        let mut s = Serializer::request(RequestCommand::Execute);
        s.write_i32(id).unwrap();
        s.write_str(name).unwrap();
        s
    }

    #[test]
    fn minimal_request() {
        let mut s = exec_header(7, "echo");
        s.write_exec_str(ExecCommand::Arg, "/bin/echo").unwrap();
        s.write_exec_str(ExecCommand::Arg, "hi").unwrap();

        let request = parse(&s).unwrap();
        assert_eq!(request.id, 7);
        assert_eq!(request.name, "echo");
        assert_eq!(request.process.args.len(), 2);
        assert_eq!(request.process.args[0].as_bytes(), b"/bin/echo");
        assert_eq!(request.process.args[1].as_bytes(), b"hi");
    }

    #[test]
    fn list_commands_preserve_order() {
        let mut s = exec_header(1, "ordered");
        s.write_exec_str(ExecCommand::Arg, "/bin/sh").unwrap();
        s.write_exec_str(ExecCommand::SetEnv, "A=1").unwrap();
        s.write_exec_str(ExecCommand::SetEnv, "B=2").unwrap();
        for (key, value) in [("memory.limit_in_bytes", "1"), ("pids.max", "2")] {
            s.write_exec(ExecCommand::CgroupSet).unwrap();
            s.write_str(key).unwrap();
            s.write_str(value).unwrap();
        }

        let request = parse(&s).unwrap();
        let env: Vec<_> = request
            .process
            .env
            .iter()
            .map(|e| e.to_bytes().to_vec())
            .collect();
        assert_eq!(env, vec![b"A=1".to_vec(), b"B=2".to_vec()]);
        assert_eq!(request.process.cgroup.set[0].0, "memory.limit_in_bytes");
        assert_eq!(request.process.cgroup.set[1].0, "pids.max");
    }

    #[test]
    fn scalar_commands_are_last_writer_wins() {
        let mut s = exec_header(1, "umask");
        s.write_exec_str(ExecCommand::Arg, "/bin/true").unwrap();
        s.write_exec(ExecCommand::Umask).unwrap();
        s.write_u16(0o022).unwrap();
        s.write_exec(ExecCommand::Umask).unwrap();
        s.write_u16(0o077).unwrap();

        let request = parse(&s).unwrap();
        assert_eq!(request.process.umask, Some(0o077));
    }

    #[test]
    fn bind_mount_fields() {
        let mut s = exec_header(1, "binds");
        s.write_exec_str(ExecCommand::Arg, "/bin/true").unwrap();
        s.write_exec(ExecCommand::BindMount).unwrap();
        s.write_str("/ro").unwrap();
        s.write_str("/mnt/ro").unwrap();
        s.write_byte(0).unwrap();
        s.write_byte(1).unwrap();

        let request = parse(&s).unwrap();
        let bind = &request.process.ns.binds[0];
        assert_eq!(bind.source.as_bytes(), b"/ro");
        assert_eq!(bind.target.as_bytes(), b"/mnt/ro");
        assert!(!bind.writable);
        assert!(bind.exec);
    }

    #[test]
    fn uid_gid_with_groups() {
        let mut s = exec_header(1, "creds");
        s.write_exec_str(ExecCommand::Arg, "/bin/true").unwrap();
        s.write_exec(ExecCommand::UidGid).unwrap();
        s.write_u32(1000).unwrap();
        s.write_u32(1000).unwrap();
        s.write_byte(2).unwrap();
        s.write_u32(33).unwrap();
        s.write_u32(44).unwrap();

        let request = parse(&s).unwrap();
        assert_eq!(request.process.uid_gid.uid, 1000);
        assert_eq!(request.process.uid_gid.gid, 1000);
        assert_eq!(request.process.uid_gid.groups, vec![33, 44]);
    }

    #[test]
    fn oversized_group_count_is_malformed() {
        let mut s = exec_header(1, "creds");
        s.write_exec(ExecCommand::UidGid).unwrap();
        s.write_u32(1000).unwrap();
        s.write_u32(1000).unwrap();
        s.write_byte(33).unwrap();

        assert!(matches!(parse(&s), Err(SpawnError::MalformedPayload)));
    }

    #[test]
    fn unknown_tag_is_malformed() {
        let mut s = exec_header(1, "bad");
        s.write_byte(0xee).unwrap();

        assert!(matches!(parse(&s), Err(SpawnError::MalformedPayload)));
    }

    #[test]
    fn truncated_operand_is_malformed() {
        let mut s = exec_header(1, "truncated");
        s.write_exec(ExecCommand::Priority).unwrap();
        s.write_byte(1).unwrap();

        assert!(matches!(parse(&s), Err(SpawnError::MalformedPayload)));
    }

    #[test]
    fn surplus_descriptors_are_malformed() {
        let s = exec_header(1, "surplus");
        let (r, w) = nix::unistd::pipe().unwrap();
        let fds = FdQueue::new(vec![r, w]);

        assert!(matches!(
            parse_with_fds(&s, fds),
            Err(SpawnError::MalformedPayload)
        ));
    }

    #[test]
    fn missing_descriptor_is_malformed() {
        let mut s = exec_header(1, "deficit");
        s.write_exec(ExecCommand::Stdin).unwrap();

        assert!(matches!(parse(&s), Err(SpawnError::MalformedPayload)));
    }

    #[test]
    fn descriptors_are_consumed_in_order() {
        let mut s = exec_header(1, "fds");
        let (r, w) = nix::unistd::pipe().unwrap();
        use std::os::fd::AsRawFd;
        let (r_raw, w_raw) = (r.as_raw_fd(), w.as_raw_fd());
        s.write_exec(ExecCommand::Stdin).unwrap();
        s.write_exec(ExecCommand::Stdout).unwrap();

        let request = parse_with_fds(&s, FdQueue::new(vec![r, w])).unwrap();
        assert_eq!(request.process.stdin.as_ref().unwrap().as_raw_fd(), r_raw);
        assert_eq!(request.process.stdout.as_ref().unwrap().as_raw_fd(), w_raw);
    }

    #[test]
    fn namespace_flags_accumulate() {
        let mut s = exec_header(1, "ns");
        s.write_exec_str(ExecCommand::Arg, "/bin/true").unwrap();
        for cmd in [
            ExecCommand::UserNs,
            ExecCommand::PidNs,
            ExecCommand::MountNs,
            ExecCommand::MountProc,
            ExecCommand::NoNewPrivs,
            ExecCommand::ForbidUserNs,
        ] {
            s.write_exec(cmd).unwrap();
        }

        let request = parse(&s).unwrap();
        let p = &request.process;
        assert!(p.ns.user && p.ns.pid && p.ns.mount && p.ns.mount_proc);
        assert!(p.no_new_privs && p.forbid_user_ns);
        assert!(!p.ns.network && !p.forbid_bind);
    }
}
