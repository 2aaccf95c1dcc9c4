//! The spawn server
//!
//! Owns the spawn policy, the cgroup state, the child registry and
//! the connection list, all on one thread.  The server terminates on
//! its own once the last connection is gone and the last child has
//! been reaped.

use std::cell::RefCell;
use std::io;
use std::os::fd::{AsFd, OwnedFd};
use std::rc::Rc;

use tokio::signal::unix::{signal, SignalKind};

use farrow_core::datagram;
use farrow_core::hook::SpawnHook;
use farrow_core::protocol::ResponseCommand;
use farrow_core::serializer::Serializer;
use farrow_core::{CgroupState, PreparedChildProcess, Result, SpawnConfig};

use crate::connection::Connection;
use crate::registry::ChildRegistry;

pub struct Server {
    config: SpawnConfig,
    cgroup_state: CgroupState,
    hook: Option<Box<dyn SpawnHook>>,
    registry: ChildRegistry,
    connections: RefCell<Vec<Rc<Connection>>>,
}

impl Server {
    #[must_use]
    pub fn new(
        config: SpawnConfig,
        cgroup_state: CgroupState,
        hook: Option<Box<dyn SpawnHook>>,
    ) -> Rc<Self> {
        Rc::new(Self {
            config,
            cgroup_state,
            hook,
            registry: ChildRegistry::new(),
            connections: RefCell::new(Vec::new()),
        })
    }

    #[must_use]
    pub fn config(&self) -> &SpawnConfig {
        &self.config
    }

    #[must_use]
    pub fn cgroup_state(&self) -> &CgroupState {
        &self.cgroup_state
    }

    #[must_use]
    pub fn registry(&self) -> &ChildRegistry {
        &self.registry
    }

    /// The pre-launch policy gate: an accepting hook short-circuits
    /// the uid/gid allow-list check.
    pub fn verify(&self, process: &PreparedChildProcess) -> Result<()> {
        if let Some(hook) = &self.hook {
            if hook.verify(process)? {
                return Ok(());
            }
        }
        self.config.verify(&process.uid_gid)
    }

    /// Wire a descriptor into a new connection under the event loop.
    pub fn add_connection(self: &Rc<Self>, fd: OwnedFd) -> io::Result<()> {
        let connection = Connection::new(Rc::downgrade(self), fd)?;
        self.connections.borrow_mut().push(connection.clone());
        tokio::task::spawn_local(connection.run());
        tracing::debug!(
            connections = self.connections.borrow().len(),
            "connection added"
        );
        Ok(())
    }

    /// Tear one connection down.  When the list drains, the registry
    /// turns volatile and the server exits after the last reap.
    pub fn remove_connection(self: &Rc<Self>, target: &Connection) {
        let mut removed = None;
        self.connections.borrow_mut().retain(|connection| {
            if std::ptr::eq(Rc::as_ptr(connection), target) {
                removed = Some(connection.clone());
                false
            } else {
                true
            }
        });

        let Some(connection) = removed else {
            return;
        };
        connection.shutdown(self);

        if self.connections.borrow().is_empty() {
            tracing::info!(
                children = self.registry.count(),
                "last connection closed, draining"
            );
            self.registry.set_volatile();
        }
    }
}

/// Serve the seed descriptor until idle.
///
/// Must run inside a `tokio::task::LocalSet` on a current-thread
/// runtime; everything here is single-threaded by design.
pub async fn run(
    config: SpawnConfig,
    cgroup_state: CgroupState,
    hook: Option<Box<dyn SpawnHook>>,
    seed: OwnedFd,
) -> io::Result<()> {
    if cgroup_state.is_enabled() {
        // tell the first client that cgroup placement works; it has
        // no other way to find out
        let greeting = Serializer::response(ResponseCommand::CgroupsAvailable);
        datagram::send(seed.as_fd(), greeting.payload(), &[])?;
    }

    // subscribe before the first child can possibly exist
    let mut sigchld = signal(SignalKind::child())?;

    let server = Server::new(config, cgroup_state, hook);
    server.add_connection(seed)?;

    let reaper = {
        let server = server.clone();
        tokio::task::spawn_local(async move {
            loop {
                sigchld.recv().await;
                server.registry().reap();
            }
        })
    };

    server.registry().wait_drained().await;
    reaper.abort();

    tracing::info!("all children reaped, exiting");
    Ok(())
}
