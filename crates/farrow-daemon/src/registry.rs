//! SIGCHLD multiplexer
//!
//! Tracks every live child by pid.  The server's signal task calls
//! [`ChildRegistry::reap`] on each SIGCHLD; the reap loop drains
//! `wait4` and routes each exit status to the exit listener that
//! registered it.  Listeners are weak: a connection that died (or a
//! child record that was dropped) leaves an inert listener behind and
//! the exit is swallowed.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::os::fd::OwnedFd;
use std::rc::Weak;
use std::time::{Duration, Instant};

use nix::unistd::Pid;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use farrow_core::spawn::{read_setup_error, SETUP_FAILURE_EXIT_CODE};

/// From a graceful kill to the SIGKILL escalation.
const KILL_TIMEOUT: Duration = Duration::from_secs(60);

/// Receives the exit status of one child process.
pub trait ExitListener {
    fn on_child_process_exit(&self, id: i32, status: i32);
}

struct ChildEntry {
    name: String,
    start_time: Instant,
    listener: Option<(Weak<dyn ExitListener>, i32)>,
    kill_timeout: Option<JoinHandle<()>>,
    error_pipe: OwnedFd,
}

impl ChildEntry {
    fn cancel_kill_timeout(&mut self) {
        if let Some(handle) = self.kill_timeout.take() {
            handle.abort();
        }
    }
}

/// Registry of live children, owned by the server.
#[derive(Default)]
pub struct ChildRegistry {
    children: RefCell<BTreeMap<libc::pid_t, ChildEntry>>,
    /// During shutdown: once the set drains, the registry reports
    /// itself done and the event loop may exit.
    volatile: Cell<bool>,
    drained: Notify,
}

impl ChildRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.children.borrow().is_empty()
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.children.borrow().len()
    }

    /// Register a freshly forked child.
    pub fn add(
        &self,
        pid: Pid,
        name: String,
        listener: Weak<dyn ExitListener>,
        id: i32,
        error_pipe: OwnedFd,
    ) {
        tracing::debug!(pid = pid.as_raw(), name = %name, "child registered");
        let _previous = self.children.borrow_mut().insert(
            pid.as_raw(),
            ChildEntry {
                name,
                start_time: Instant::now(),
                listener: Some((listener, id)),
                kill_timeout: None,
                error_pipe,
            },
        );
        debug_assert!(_previous.is_none(), "duplicate pid in registry");
    }

    /// Send `signo` to a registered child and arm the SIGKILL
    /// escalation timer.  The entry stays registered; the reap path
    /// erases it.  Unknown pids are a no-op.
    pub fn kill(&self, pid: Pid, signo: i32) {
        let mut children = self.children.borrow_mut();
        let Some(entry) = children.get_mut(&pid.as_raw()) else {
            tracing::debug!(pid = pid.as_raw(), "kill for unknown pid");
            return;
        };

        tracing::debug!(pid = pid.as_raw(), name = %entry.name, signo, "killing child");

        // SAFETY: plain kill(2) on a child we own
        if unsafe { libc::kill(pid.as_raw(), signo) } < 0 {
            tracing::warn!(
                pid = pid.as_raw(),
                name = %entry.name,
                signo,
                error = %std::io::Error::last_os_error(),
                "failed to kill child"
            );
        }

        entry.cancel_kill_timeout();
        if signo != libc::SIGKILL {
            let raw_pid = pid.as_raw();
            entry.kill_timeout = Some(tokio::task::spawn_local(async move {
                tokio::time::sleep(KILL_TIMEOUT).await;
                tracing::warn!(pid = raw_pid, "kill timeout expired, sending SIGKILL");
                // SAFETY: escalation on a pid we still consider ours;
                // the reap path cancels this task first when the child
                // exits in time
                unsafe {
                    libc::kill(raw_pid, libc::SIGKILL);
                }
            }));
        }
    }

    /// Drain every pending exit.  Called from the SIGCHLD task; also
    /// harmless to call spuriously.
    pub fn reap(&self) {
        loop {
            let mut status: libc::c_int = 0;
            // SAFETY: rusage is plain data filled by the kernel
            let mut rusage: libc::rusage = unsafe { std::mem::zeroed() };
            // SAFETY: non-blocking wait on any child
            let pid = unsafe {
                libc::wait4(
                    -1,
                    &mut status,
                    libc::WNOHANG | libc::WCONTINUED,
                    &mut rusage,
                )
            };

            if pid == 0 {
                break;
            }
            if pid < 0 {
                match std::io::Error::last_os_error().raw_os_error() {
                    Some(libc::EINTR) => continue,
                    Some(libc::ECHILD) => break,
                    _ => {
                        tracing::warn!(
                            error = %std::io::Error::last_os_error(),
                            "wait4 failed"
                        );
                        break;
                    }
                }
            }

            // stop/continue notifications do not end the child
            if !libc::WIFEXITED(status) && !libc::WIFSIGNALED(status) {
                continue;
            }

            self.deliver_exit(pid, status, &rusage);
        }

        self.check_drained();
    }

    fn deliver_exit(&self, pid: libc::pid_t, status: i32, rusage: &libc::rusage) {
        let entry = self.children.borrow_mut().remove(&pid);
        let Some(mut entry) = entry else {
            tracing::debug!(pid, status, "reaped unregistered child");
            return;
        };

        entry.cancel_kill_timeout();

        tracing::info!(
            pid,
            name = %entry.name,
            status,
            runtime_ms = entry.start_time.elapsed().as_millis() as u64,
            utime_ms = timeval_ms(&rusage.ru_utime),
            stime_ms = timeval_ms(&rusage.ru_stime),
            maxrss_kib = rusage.ru_maxrss,
            "child exited"
        );

        if libc::WIFEXITED(status)
            && libc::WEXITSTATUS(status) == i32::from(SETUP_FAILURE_EXIT_CODE)
        {
            if let Some(message) = read_setup_error(&entry.error_pipe) {
                tracing::error!(pid, name = %entry.name, %message, "child setup failed");
            }
        }

        // the map borrow is released; the listener may re-enter the
        // registry (e.g. a connection teardown killing siblings)
        if let Some((listener, id)) = entry.listener.take() {
            if let Some(listener) = listener.upgrade() {
                listener.on_child_process_exit(id, status);
            }
        }
    }

    /// Enter shutdown mode: when the registered set drains, the
    /// SIGCHLD subscription may be dropped and the loop may exit.
    pub fn set_volatile(&self) {
        self.volatile.set(true);
        self.check_drained();
    }

    /// Wait until the registry is volatile and empty.
    pub async fn wait_drained(&self) {
        loop {
            if self.volatile.get() && self.is_empty() {
                return;
            }
            self.drained.notified().await;
        }
    }

    fn check_drained(&self) {
        if self.volatile.get() && self.is_empty() {
            self.drained.notify_waiters();
        }
    }
}

fn timeval_ms(tv: &libc::timeval) -> i64 {
    tv.tv_sec * 1000 + tv.tv_usec / 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kill_for_unknown_pid_is_a_no_op() {
        let registry = ChildRegistry::new();
        registry.kill(Pid::from_raw(999_999), libc::SIGTERM);
        assert!(registry.is_empty());
    }

    #[test]
    fn reap_without_children_is_harmless() {
        let registry = ChildRegistry::new();
        registry.reap();
        assert!(registry.is_empty());
    }

    #[test]
    fn volatile_with_empty_set_is_drained() {
        let registry = ChildRegistry::new();
        registry.set_volatile();

        let waited = futures_ready(registry.wait_drained());
        assert!(waited);
    }

    /// Poll a future exactly once; true if it completed immediately.
    fn futures_ready<F: std::future::Future<Output = ()>>(future: F) -> bool {
        use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

        fn noop_raw_waker() -> RawWaker {
            const VTABLE: RawWakerVTable =
                RawWakerVTable::new(|_| noop_raw_waker(), |_| {}, |_| {}, |_| {});
            RawWaker::new(std::ptr::null(), &VTABLE)
        }

        // SAFETY: the no-op waker never dereferences its pointer
        let waker = unsafe { Waker::from_raw(noop_raw_waker()) };
        let mut context = Context::from_waker(&waker);
        let mut future = Box::pin(future);
        matches!(future.as_mut().poll(&mut context), Poll::Ready(()))
    }
}
