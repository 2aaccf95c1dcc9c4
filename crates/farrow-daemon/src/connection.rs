//! Per-client connection state
//!
//! One datagram is one request.  The connection decodes the opcode,
//! dispatches, and keeps the id → child mapping for its own spawns.
//! A malformed frame is logged and dropped; the connection lives on.
//! A hung-up or failing peer tears the connection down, which
//! SIGTERMs every remaining child through the registry.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::rc::{Rc, Weak};

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

use farrow_core::datagram;
use farrow_core::parser::{parse_exec, ExecRequest};
use farrow_core::payload::{FdQueue, Payload};
use farrow_core::protocol::{RequestCommand, ResponseCommand, RECV_BUFFER, SPAWN_FAILURE_STATUS};
use farrow_core::serializer::Serializer;
use farrow_core::spawn::spawn_child_process;
use farrow_core::{Result, SpawnError};

use crate::registry::ExitListener;
use crate::server::Server;

struct ChildRecord {
    pid: nix::unistd::Pid,
    name: String,
}

pub struct Connection {
    server: Weak<Server>,
    socket: AsyncFd<OwnedFd>,
    /// Live children of this client, keyed by the client-assigned id.
    children: RefCell<BTreeMap<i32, ChildRecord>>,
}

impl Connection {
    pub fn new(server: Weak<Server>, fd: OwnedFd) -> io::Result<Rc<Self>> {
        set_nonblocking(&fd)?;
        let socket = AsyncFd::with_interest(fd, Interest::READABLE)?;
        Ok(Rc::new(Self {
            server,
            socket,
            children: RefCell::new(BTreeMap::new()),
        }))
    }

    /// Drive the inbound side until the peer goes away.
    pub async fn run(self: Rc<Self>) {
        let mut buffer = vec![0u8; RECV_BUFFER];

        loop {
            let mut guard = match self.socket.readable().await {
                Ok(guard) => guard,
                Err(err) => {
                    tracing::warn!(%err, "connection poll failed");
                    break;
                }
            };

            match guard.try_io(|inner| datagram::receive(inner.get_ref().as_fd(), &mut buffer)) {
                Ok(Ok(received)) => {
                    if received.len == 0 {
                        tracing::debug!("peer closed the connection");
                        break;
                    }
                    self.handle_frame(&buffer[..received.len], received.fds);
                }
                Ok(Err(err)) if err.kind() == io::ErrorKind::InvalidData => {
                    // ill-formed ancillary data; the frame is gone but
                    // the connection survives
                    tracing::warn!(%err, "discarding frame");
                }
                Ok(Err(err)) => {
                    tracing::warn!(%err, "recvmsg failed");
                    break;
                }
                Err(_would_block) => {}
            }
        }

        self.remove();
    }

    fn handle_frame(self: &Rc<Self>, payload: &[u8], mut fds: FdQueue) {
        match self.dispatch(payload, &mut fds) {
            Ok(()) => {}
            Err(SpawnError::MalformedPayload) => {
                tracing::warn!("malformed spawn payload");
            }
            Err(err) => {
                tracing::warn!(%err, "request failed");
            }
        }
    }

    fn dispatch(self: &Rc<Self>, payload: &[u8], fds: &mut FdQueue) -> Result<()> {
        let mut payload = Payload::new(payload);

        match RequestCommand::try_from(payload.read_byte()?)? {
            RequestCommand::Connect => {
                if !payload.is_empty() || fds.len() != 1 {
                    return Err(SpawnError::MalformedPayload);
                }
                let fd = fds.take()?;
                let server = self.server().ok_or(SpawnError::MalformedPayload)?;
                server.add_connection(fd).map_err(SpawnError::Io)?;
                Ok(())
            }

            RequestCommand::Execute => {
                let request = parse_exec(&mut payload, fds)?;
                self.spawn_child(request);
                Ok(())
            }

            RequestCommand::Kill => {
                if !fds.is_empty() {
                    return Err(SpawnError::MalformedPayload);
                }
                let id = payload.read_i32()?;
                let signo = payload.read_i32()?;
                if !payload.is_empty() {
                    return Err(SpawnError::MalformedPayload);
                }
                self.handle_kill(id, signo);
                Ok(())
            }
        }
    }

    /// Verify, fork, and register one child.  Any refusal or failure
    /// surfaces to the client as an `EXIT` with the synthesized
    /// spawn-failure status.
    fn spawn_child(self: &Rc<Self>, request: ExecRequest) {
        let Some(server) = self.server() else { return };
        let ExecRequest {
            id,
            name,
            mut process,
        } = request;

        if process.uid_gid.is_empty() {
            let default = &server.config().default_uid_gid;
            if default.is_empty() {
                tracing::warn!(id, name = %name, "no uid/gid specified");
                self.send_exit(id, SPAWN_FAILURE_STATUS);
                return;
            }
            process.uid_gid = default.clone();
        } else if let Err(err) = server.verify(&process) {
            tracing::warn!(id, name = %name, %err, "spawn rejected");
            self.send_exit(id, SPAWN_FAILURE_STATUS);
            return;
        }

        let child = match spawn_child_process(process, server.cgroup_state()) {
            Ok(child) => child,
            Err(err) => {
                tracing::error!(id, name = %name, %err, "failed to spawn child");
                self.send_exit(id, SPAWN_FAILURE_STATUS);
                return;
            }
        };

        tracing::debug!(id, name = %name, pid = child.pid.as_raw(), "child running");

        self.children.borrow_mut().insert(
            id,
            ChildRecord {
                pid: child.pid,
                name: name.clone(),
            },
        );

        let listener = Rc::downgrade(self) as Weak<dyn ExitListener>;
        server
            .registry()
            .add(child.pid, name, listener, id, child.error_pipe);
    }

    /// KILL: signal through the registry.  The record stays; the reap
    /// still delivers exactly one EXIT for the child.  Unknown ids
    /// are a no-op.
    fn handle_kill(&self, id: i32, signo: i32) {
        let Some(server) = self.server() else { return };

        let pid = {
            let children = self.children.borrow();
            let Some(record) = children.get(&id) else {
                tracing::debug!(id, signo, "kill for unknown child id");
                return;
            };
            record.pid
        };

        server.registry().kill(pid, signo);
    }

    /// Route a reaped exit to the client.  The record may already be
    /// gone (the connection is being torn down); the exit is then
    /// swallowed.
    fn deliver_exit(&self, id: i32, status: i32) {
        if self.children.borrow_mut().remove(&id).is_none() {
            return;
        }
        self.send_exit(id, status);
    }

    fn send_exit(&self, id: i32, status: i32) {
        let result: Result<()> = (|| {
            let mut s = Serializer::response(ResponseCommand::Exit);
            s.write_i32(id)?;
            s.write_i32(status)?;
            datagram::send_retry(self.socket.get_ref().as_fd(), s.payload(), s.fds())?;
            Ok(())
        })();

        if let Err(err) = result {
            tracing::error!(id, %err, "failed to send EXIT");
            self.remove();
        }
    }

    /// SIGTERM every remaining child.  Their records are dropped, so
    /// the eventual reaps are swallowed; the registry escalates to
    /// SIGKILL on its own.
    pub fn shutdown(&self, server: &Server) {
        let children = std::mem::take(&mut *self.children.borrow_mut());
        for (id, record) in children {
            tracing::debug!(
                id,
                pid = record.pid.as_raw(),
                name = %record.name,
                "terminating orphaned child"
            );
            server.registry().kill(record.pid, libc::SIGTERM);
        }
    }

    fn remove(&self) {
        if let Some(server) = self.server() {
            server.remove_connection(self);
        }
    }

    fn server(&self) -> Option<Rc<Server>> {
        self.server.upgrade()
    }
}

impl ExitListener for Connection {
    fn on_child_process_exit(&self, id: i32, status: i32) {
        self.deliver_exit(id, status);
    }
}

fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    // SAFETY: fcntl on an owned descriptor
    unsafe {
        let flags = libc::fcntl(fd.as_raw_fd(), libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
