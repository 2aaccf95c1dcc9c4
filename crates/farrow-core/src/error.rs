//! Error types for farrow-core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SpawnError {
    /// A received frame violates the protocol grammar.  The frame is
    /// dropped; the connection survives.
    #[error("malformed spawn payload")]
    MalformedPayload,

    /// The encoder ran out of payload or file-descriptor capacity.
    #[error("spawn payload too large")]
    PayloadTooLarge,

    /// The hook or the spawn configuration refused the request.
    #[error("spawn rejected: {0}")]
    Rejected(String),

    #[error("namespace error: {0}")]
    Namespace(String),

    #[error("mount error: {0}")]
    Mount(String),

    #[error("cgroup error: {0}")]
    Cgroup(String),

    #[error("seccomp error: {0}")]
    Seccomp(String),

    #[error("credentials error: {0}")]
    Credentials(String),

    #[error("exec error: {0}")]
    Exec(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("os error: {0}")]
    Os(#[from] nix::errno::Errno),
}
