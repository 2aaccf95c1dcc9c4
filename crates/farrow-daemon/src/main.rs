//! farrowd - the spawn server daemon
//!
//! Runs as the privileged half of a worker fleet: workers connect
//! over the seed datagram socket (or an inherited descriptor) and ask
//! for isolated children; farrowd forks, isolates, and reports exits.
//! The process terminates on its own once every connection is gone
//! and every child has been reaped.

use std::fs;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use farrow_core::CgroupState;
use farrow_daemon::config::DaemonConfig;
use farrow_daemon::server;

#[derive(Parser)]
#[command(name = "farrowd")]
#[command(author, version, about = "Spawn server for isolated child processes")]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind the seed socket at this path (overrides the config file)
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Adopt this inherited datagram socket as the seed connection
    /// instead of binding one
    #[arg(long)]
    fd: Option<RawFd>,

    /// Default uid for requests that specify none
    #[arg(long)]
    default_uid: Option<u32>,

    /// Default gid for requests that specify none
    #[arg(long)]
    default_gid: Option<u32>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("farrow=info".parse()?))
        .init();

    let cli = Cli::parse();

    let mut config = DaemonConfig::load(cli.config.as_deref())?;
    if let Some(socket) = cli.socket {
        config.socket_path = socket;
    }
    if let Some(uid) = cli.default_uid {
        config.default_uid = uid;
    }
    if let Some(gid) = cli.default_gid {
        config.default_gid = gid;
    }

    let cgroup_state = CgroupState::load_self();
    tracing::info!(
        cgroups = cgroup_state.is_enabled(),
        scope = %cgroup_state.group_path,
        "farrowd starting"
    );

    let seed = match cli.fd {
        // SAFETY: the parent process handed us this descriptor
        Some(fd) => unsafe { OwnedFd::from_raw_fd(fd) },
        None => bind_seed_socket(&config.socket_path)?,
    };

    let local = tokio::task::LocalSet::new();
    local
        .run_until(server::run(
            config.spawn_config(),
            cgroup_state,
            None,
            seed,
        ))
        .await?;

    Ok(())
}

fn bind_seed_socket(path: &Path) -> anyhow::Result<OwnedFd> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create {}", parent.display()))?;
    }
    // a stale socket from a previous run would make the bind fail
    let _ = fs::remove_file(path);

    let socket = UnixDatagram::bind(path)
        .with_context(|| format!("bind {}", path.display()))?;
    tracing::info!(socket = %path.display(), "listening");
    Ok(socket.into())
}
