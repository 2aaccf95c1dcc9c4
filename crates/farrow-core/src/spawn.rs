//! The fork/exec engine
//!
//! [`spawn_child_process`] does the parent-side preparation, forks,
//! and runs the isolation pipeline in the child.  The pipeline order
//! is a kernel contract, not a style choice: descriptors first, then
//! refence, namespaces, mounts, hostname, cgroup, rlimits,
//! credentials, no-new-privs, chroot/chdir, jailed stderr, scheduling,
//! and the seccomp filter as the very last step before `execve`.
//!
//! A child that fails anywhere in the pipeline writes a one-line
//! description into the error pipe and exits with code 0xff; the
//! parent reports the synthesized status like any other exit and logs
//! the message when the child is reaped.

use std::convert::Infallible;
use std::ffi::{CStr, OsStr};
use std::fs::OpenOptions;
use std::io::Read;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use nix::unistd::{chdir, chroot, execve, fork, pipe2, setsid, ForkResult, Pid};

use crate::cgroup::CgroupState;
use crate::error::SpawnError;
use crate::isolation::seccomp::{self, FilterOptions};
use crate::isolation::{credentials, mounts, refence};
use crate::prepared::PreparedChildProcess;
use crate::Result;

/// Exit code of a child whose setup pipeline failed.
pub const SETUP_FAILURE_EXIT_CODE: u8 = 0xff;

const IOPRIO_WHO_PROCESS: libc::c_int = 1;
const IOPRIO_CLASS_IDLE: libc::c_int = 3;
const IOPRIO_CLASS_SHIFT: libc::c_int = 13;

/// A successfully forked child.
#[derive(Debug)]
pub struct SpawnedChild {
    pub pid: Pid,
    /// Read end of the setup error pipe; readable (without blocking)
    /// once the child failed, closed on successful exec.
    pub error_pipe: OwnedFd,
}

/// Finalize `p`, fork, and run the isolation pipeline in the child.
///
/// The parent returns as soon as the fork happened; it never waits on
/// the child here.  SIGCHLD reports the exit later.
pub fn spawn_child_process(
    mut p: PreparedChildProcess,
    cgroup_state: &CgroupState,
) -> Result<SpawnedChild> {
    p.finish()?;
    prepare_stderr(&mut p)?;

    let (error_read, error_write) =
        pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK).map_err(SpawnError::Os)?;

    // SAFETY: the child only runs the setup pipeline and then execs
    // or _exits; the parent is single-threaded by design
    match unsafe { fork() }.map_err(SpawnError::Os)? {
        ForkResult::Parent { child } => {
            drop(error_write);
            Ok(SpawnedChild {
                pid: child,
                error_pipe: error_read,
            })
        }
        ForkResult::Child => {
            drop(error_read);
            // the pipe must not sit in a slot the stdio wiring is
            // about to overwrite
            let error_write = raise_above_stdio(error_write);
            match run_child(&p, cgroup_state) {
                Ok(never) => match never {},
                Err(err) => {
                    report_setup_error(&error_write, &err);
                    // SAFETY: terminating the failed child
                    unsafe { libc::_exit(i32::from(SETUP_FAILURE_EXIT_CODE)) }
                }
            }
        }
    }
}

/// Open the stderr target in the parent, where failures can still be
/// reported cleanly.  A jailed stderr path is left for the child: it
/// must be opened after chroot/pivot_root.
fn prepare_stderr(p: &mut PreparedChildProcess) -> Result<()> {
    if p.stderr.is_some() {
        return Ok(());
    }

    if let Some(path) = &p.stderr_path {
        if !p.stderr_jailed {
            p.stderr = Some(open_stderr_path(path)?);
        }
    } else if p.stderr_null {
        // best effort; a child without stderr is still viable
        if let Ok(file) = OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NOCTTY)
            .open("/dev/null")
        {
            p.stderr = Some(file.into());
        }
    }

    Ok(())
}

fn open_stderr_path(path: &CStr) -> Result<OwnedFd> {
    let path = Path::new(OsStr::from_bytes(path.to_bytes()));
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .mode(0o600)
        .custom_flags(libc::O_NOCTTY)
        .open(path)
        .map_err(|err| SpawnError::Exec(format!("open {}: {err}", path.display())))?;
    Ok(file.into())
}

/// The ordered child-side pipeline.  Only returns on failure.
fn run_child(p: &PreparedChildProcess, cgroup_state: &CgroupState) -> Result<Infallible> {
    setup_stdio(p)?;

    if let Some(blob) = &p.refence {
        // before unshare: the blob goes to the host's interface
        refence::apply(blob)?;
    }

    p.ns.apply(&p.uid_gid)?;
    mounts::setup_mounts(&p.ns)?;
    p.ns.apply_hostname()?;

    p.cgroup.apply(cgroup_state)?;
    p.rlimits.apply()?;

    credentials::apply(&p.uid_gid, p.ns.user)?;

    if p.no_new_privs {
        nix::sys::prctl::set_no_new_privs()
            .map_err(|err| SpawnError::Exec(format!("no_new_privs: {err}")))?;
    }

    if let Some(root) = &p.chroot {
        if p.ns.pivot_root.is_none() {
            chroot(root.as_c_str())
                .map_err(|err| SpawnError::Exec(format!("chroot {root:?}: {err}")))?;
        }
    }
    match &p.chdir {
        Some(dir) => chdir(dir.as_c_str())
            .map_err(|err| SpawnError::Exec(format!("chdir {dir:?}: {err}")))?,
        None => {
            if p.chroot.is_some() || p.ns.pivot_root.is_some() {
                chdir("/").map_err(|err| SpawnError::Exec(format!("chdir /: {err}")))?;
            }
        }
    }

    if p.stderr_jailed {
        if let Some(path) = &p.stderr_path {
            let fd = open_stderr_path(path)?;
            install_fd(&fd, 2)?;
        }
    }

    apply_scheduling(p)?;

    // the filter must be the last step: everything above may use
    // syscalls the child is not allowed to
    seccomp::install(&FilterOptions {
        forbid_user_ns: p.forbid_user_ns,
        forbid_multicast: p.forbid_multicast,
        forbid_bind: p.forbid_bind,
    })?;

    let Some(path) = p.exec_path() else {
        return Err(SpawnError::Exec("empty argv".to_string()));
    };
    execve(path, &p.args, &p.env)
        .map_err(|err| SpawnError::Exec(format!("execve {path:?}: {err}")))
}

/// Wire the standard descriptors: stdin/stdout/stderr into slots
/// 0/1/2, the control channel into slot 3.  Missing stdin falls back
/// to `/dev/null`; missing stdout/stderr inherit the spawner's own.
/// Everything else in the process is close-on-exec already.
fn setup_stdio(p: &PreparedChildProcess) -> Result<()> {
    if p.tty {
        setsid().map_err(|err| SpawnError::Exec(format!("setsid: {err}")))?;
    }

    match &p.stdin {
        Some(fd) => install_fd(fd, 0)?,
        None => {
            let file = OpenOptions::new()
                .read(true)
                .custom_flags(libc::O_NOCTTY)
                .open("/dev/null")
                .map_err(|err| SpawnError::Exec(format!("open /dev/null: {err}")))?;
            install_fd(&file.into(), 0)?;
        }
    }

    if let Some(fd) = &p.stdout {
        install_fd(fd, 1)?;
    }
    if let Some(fd) = &p.stderr {
        install_fd(fd, 2)?;
    }
    if let Some(fd) = &p.control {
        install_fd(fd, 3)?;
    }

    if p.tty {
        // SAFETY: stdin is the tty the request passed in
        if unsafe { libc::ioctl(0, libc::TIOCSCTTY as _, 0) } < 0 {
            return Err(SpawnError::Exec(format!(
                "TIOCSCTTY: {}",
                std::io::Error::last_os_error()
            )));
        }
    }

    Ok(())
}

/// `dup2` into a well-known slot.  The copy drops close-on-exec; if
/// the descriptor already sits in its slot, the flag must be cleared
/// by hand because `dup2` with equal descriptors does nothing.
fn install_fd(fd: &OwnedFd, slot: RawFd) -> Result<()> {
    let raw = fd.as_raw_fd();
    let fail = |what: &str| SpawnError::Exec(format!("{what}: {}", std::io::Error::last_os_error()));

    if raw == slot {
        // SAFETY: plain fcntl on an owned descriptor
        if unsafe { libc::fcntl(raw, libc::F_SETFD, 0) } < 0 {
            return Err(fail("fcntl(F_SETFD)"));
        }
    // SAFETY: dup2 onto a fixed slot number
    } else if unsafe { libc::dup2(raw, slot) } < 0 {
        return Err(fail("dup2"));
    }

    Ok(())
}

fn apply_scheduling(p: &PreparedChildProcess) -> Result<()> {
    let os_fail = |what: &str| SpawnError::Exec(format!("{what}: {}", std::io::Error::last_os_error()));

    if p.sched_idle {
        let param = libc::sched_param { sched_priority: 0 };
        // SAFETY: plain scheduler call on self
        if unsafe { libc::sched_setscheduler(0, libc::SCHED_IDLE, &param) } < 0 {
            return Err(os_fail("sched_setscheduler"));
        }
    }

    if p.ioprio_idle {
        // SAFETY: ioprio_set on self
        if unsafe {
            libc::syscall(
                libc::SYS_ioprio_set,
                IOPRIO_WHO_PROCESS,
                0,
                IOPRIO_CLASS_IDLE << IOPRIO_CLASS_SHIFT,
            )
        } < 0
        {
            return Err(os_fail("ioprio_set"));
        }
    }

    if let Some(mask) = p.umask {
        nix::sys::stat::umask(Mode::from_bits_truncate(libc::mode_t::from(mask)));
    }

    if p.priority != 0 {
        // SAFETY: setpriority on self
        if unsafe { libc::setpriority(libc::PRIO_PROCESS as _, 0, p.priority) } < 0 {
            return Err(os_fail("setpriority"));
        }
    }

    Ok(())
}

fn raise_above_stdio(fd: OwnedFd) -> OwnedFd {
    if fd.as_raw_fd() > 3 {
        return fd;
    }
    // SAFETY: F_DUPFD_CLOEXEC allocates a fresh descriptor at 4 or
    // above; the old one closes with `fd`
    let raw = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_DUPFD_CLOEXEC, 4) };
    if raw < 0 {
        return fd;
    }
    // SAFETY: freshly duplicated, owned by nobody else
    unsafe { OwnedFd::from_raw_fd(raw) }
}

fn report_setup_error(pipe: &OwnedFd, err: &SpawnError) {
    let message = err.to_string();
    let bytes = message.as_bytes();
    // SAFETY: short write into our own pipe; the result does not
    // matter, the exit code carries the failure either way
    unsafe {
        libc::write(pipe.as_raw_fd(), bytes.as_ptr().cast(), bytes.len());
    }
}

/// Drain the setup error pipe of a reaped child, if it wrote one.
#[must_use]
pub fn read_setup_error(pipe: &OwnedFd) -> Option<String> {
    let mut file = std::fs::File::from(pipe.try_clone().ok()?);
    let mut buffer = [0u8; 256];
    match file.read(&mut buffer) {
        Ok(n) if n > 0 => Some(String::from_utf8_lossy(&buffer[..n]).into_owned()),
        _ => None,
    }
}
